//! Fixed-layout function entry records.
//!
//! One `FuncEntryDes` summarizes one compiled function's placement: where
//! its code starts, which module it belongs to, its frame-pointer delta,
//! and where its callee-saved registers were spilled. The record is
//! persisted byte-for-byte into AOT images, so it is serialized field by
//! field in little-endian order rather than relying on struct layout.

use crate::signature::TargetKind;

/// Upper bound on recorded callee-saved registers per function.
pub const MAX_CALLEE_SAVE_REGISTER_NUM: usize = 8;

/// Sentinel for "no source-file index".
pub const INVALID_INDEX: u32 = u32::MAX;

/// Serialized size of one entry in bytes.
///
/// code_addr(8) + target_kind(4) + is_main(1) + is_fast_call(1) +
/// index_or_method_id(4) + module_index(4) + abc_index(4) + fp_delta(4) +
/// func_size(4) + callee_register_num(4) + 8 * (register(8) + offset(8)).
pub const ENTRY_SIZE: usize = 38 + MAX_CALLEE_SAVE_REGISTER_NUM * 16;

/// Placement record for one compiled function.
///
/// `code_addr .. code_addr + func_size` is a half-open byte range; ranges
/// of entries within one module never overlap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncEntryDes {
    pub code_addr: u64,
    pub target_kind: TargetKind,
    pub is_main_func: bool,
    pub is_fast_call: bool,
    pub index_or_method_id: u32,
    pub module_index: u32,
    pub abc_index: u32,
    pub fp_delta: i32,
    pub func_size: u32,
    pub callee_register_num: u32,
    /// (register, stack offset) pairs; only the first
    /// `callee_register_num` slots are meaningful, the rest stay zero.
    pub callee_reg_info: [(u64, u64); MAX_CALLEE_SAVE_REGISTER_NUM],
}

impl Default for FuncEntryDes {
    /// A fully zeroed record. Entries are always created zeroed first so
    /// no uninitialized byte can ever reach a persisted image.
    fn default() -> Self {
        Self {
            code_addr: 0,
            target_kind: TargetKind::CommonStub,
            is_main_func: false,
            is_fast_call: false,
            index_or_method_id: 0,
            module_index: 0,
            abc_index: INVALID_INDEX,
            fp_delta: 0,
            func_size: 0,
            callee_register_num: 0,
            callee_reg_info: [(0, 0); MAX_CALLEE_SAVE_REGISTER_NUM],
        }
    }
}

impl FuncEntryDes {
    /// Whether `addr` falls inside this function's half-open byte range.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.code_addr && addr < self.code_addr + self.func_size as u64
    }

    /// The meaningful (register, offset) pairs.
    pub fn callee_regs(&self) -> &[(u64, u64)] {
        &self.callee_reg_info[..self.callee_register_num as usize]
    }

    /// Append the serialized record to `out`. Exactly [`ENTRY_SIZE`]
    /// bytes, little-endian, fixed field order.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&self.code_addr.to_le_bytes());
        out.extend_from_slice(&self.target_kind.to_u32().to_le_bytes());
        out.push(self.is_main_func as u8);
        out.push(self.is_fast_call as u8);
        out.extend_from_slice(&self.index_or_method_id.to_le_bytes());
        out.extend_from_slice(&self.module_index.to_le_bytes());
        out.extend_from_slice(&self.abc_index.to_le_bytes());
        out.extend_from_slice(&self.fp_delta.to_le_bytes());
        out.extend_from_slice(&self.func_size.to_le_bytes());
        out.extend_from_slice(&self.callee_register_num.to_le_bytes());
        for (reg, offset) in &self.callee_reg_info {
            out.extend_from_slice(&reg.to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
        }
        debug_assert_eq!(out.len() - start, ENTRY_SIZE);
    }

    /// Decode one record from the front of `bytes`.
    ///
    /// Returns `None` if the slice is too short, carries an unknown
    /// target-kind tag, or an impossible callee-register count; callers
    /// treat that as a corrupt image.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < ENTRY_SIZE {
            return None;
        }
        let mut pos = 0usize;
        let mut take = |n: usize| {
            let slice = &bytes[pos..pos + n];
            pos += n;
            slice
        };

        let code_addr = u64::from_le_bytes(take(8).try_into().ok()?);
        let target_kind = TargetKind::from_u32(u32::from_le_bytes(take(4).try_into().ok()?))?;
        let is_main_func = take(1)[0] != 0;
        let is_fast_call = take(1)[0] != 0;
        let index_or_method_id = u32::from_le_bytes(take(4).try_into().ok()?);
        let module_index = u32::from_le_bytes(take(4).try_into().ok()?);
        let abc_index = u32::from_le_bytes(take(4).try_into().ok()?);
        let fp_delta = i32::from_le_bytes(take(4).try_into().ok()?);
        let func_size = u32::from_le_bytes(take(4).try_into().ok()?);
        let callee_register_num = u32::from_le_bytes(take(4).try_into().ok()?);
        if callee_register_num as usize > MAX_CALLEE_SAVE_REGISTER_NUM {
            return None;
        }
        let mut callee_reg_info = [(0u64, 0u64); MAX_CALLEE_SAVE_REGISTER_NUM];
        for slot in callee_reg_info.iter_mut() {
            let reg = u64::from_le_bytes(take(8).try_into().ok()?);
            let offset = u64::from_le_bytes(take(8).try_into().ok()?);
            *slot = (reg, offset);
        }
        debug_assert_eq!(pos, ENTRY_SIZE);

        Some(Self {
            code_addr,
            target_kind,
            is_main_func,
            is_fast_call,
            index_or_method_id,
            module_index,
            abc_index,
            fp_delta,
            func_size,
            callee_register_num,
            callee_reg_info,
        })
    }
}
