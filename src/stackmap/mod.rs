//! Stack maps: where every live value sits at each call site.
//!
//! Two wire encodings feed this subsystem — LLVM's binary stackmap format
//! and LiteCG's SLEB128 stream — and both are normalized into one
//! canonical in-memory form ([`StackMapInfo`]) before anything downstream
//! (unwinder, deoptimizer, GC) sees them. The canonical form is then
//! re-serialized into the merged on-disk blob by [`ArkStackMapBuilder`].

mod builder;
mod litecg;
mod llvm;
pub mod sleb128;
mod triple;

pub use builder::{ArkStackMapBuilder, BackendStackMap};
pub use litecg::{decode_litecg, encode_litecg};
pub use llvm::{LlvmFunctionMap, decode_llvm, encode_llvm};
pub use triple::TargetTriple;

/// Marker ORed into the high half-word of a raw location so register
/// entries are distinguishable from stack entries in merged blobs.
pub const REGISTER_MARK: u32 = 0xFFFF_0000;

/// One live-value location at a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationTy {
    /// Physical register, DWARF numbering.
    Register(u16),
    /// Byte offset from the target's frame-pointer register.
    FrameSlot(i32),
    /// Raw constant; legal only in deopt records, never at call sites.
    Immediate(i64),
}

impl LocationTy {
    /// Raw merged-form encoding: registers carry the 0xFFFF high-word
    /// sentinel, frame slots are the offset's i32 bits. Immediates have
    /// no raw form (they carry an explicit tag in serialized blobs).
    pub fn to_raw(self) -> u32 {
        match self {
            LocationTy::Register(reg) => REGISTER_MARK | reg as u32,
            LocationTy::FrameSlot(offset) => offset as u32,
            LocationTy::Immediate(_) => {
                panic!("immediate location has no raw call-site encoding")
            }
        }
    }

    /// Decode the merged-form raw encoding.
    pub fn from_raw(raw: u32) -> Self {
        if raw & REGISTER_MARK == REGISTER_MARK {
            LocationTy::Register((raw & 0xFFFF) as u16)
        } else {
            LocationTy::FrameSlot(raw as i32)
        }
    }
}

/// Live-value locations at one call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallsiteEntry {
    /// Program counter relative to the function's text start.
    pub pc: u64,
    pub locations: Vec<LocationTy>,
}

/// Interpreter-state reconstruction info at one deopt point: which
/// virtual register holds which location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeoptEntry {
    pub pc: u64,
    pub slots: Vec<(i32, LocationTy)>,
}

/// Canonical stack-map representation for one function, keyed by PC.
///
/// Call sites are kept sorted ascending by `pc`; both decoders and the
/// blob parser uphold this.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackMapInfo {
    pub callsites: Vec<CallsiteEntry>,
    pub deopts: Vec<DeoptEntry>,
}

impl StackMapInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locations for the call site at exactly `pc`.
    pub fn callsite(&self, pc: u64) -> Option<&CallsiteEntry> {
        self.callsites
            .binary_search_by_key(&pc, |e| e.pc)
            .ok()
            .map(|i| &self.callsites[i])
    }

    pub fn deopt(&self, pc: u64) -> Option<&DeoptEntry> {
        self.deopts.iter().find(|e| e.pc == pc)
    }

    /// Restore the sorted-by-pc invariant after bulk insertion.
    pub fn sort(&mut self) {
        self.callsites.sort_by_key(|e| e.pc);
        self.deopts.sort_by_key(|e| e.pc);
    }
}
