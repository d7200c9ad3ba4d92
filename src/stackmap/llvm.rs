//! Parser for LLVM's binary stackmap format (version 3).
//!
//! Layout, little-endian:
//!
//! ```text
//! Header   { u8 version, u8 reserved, u16 reserved }
//!          u32 NumFunctions, u32 NumConstants, u32 NumRecords
//! StkSize  { u64 FunctionAddress, u64 StackSize, u64 RecordCount }*
//! Constant { u64 LargeConstant }*
//! Record   { u64 PatchPointID, u32 InstructionOffset,
//!            u16 reserved, u16 NumLocations,
//!            Location{ u8 Type, u8 reserved, u16 Size,
//!                      u16 DwarfRegNum, u16 reserved,
//!                      i32 OffsetOrSmallConstant }*,
//!            align(8), u16 padding, u16 NumLiveOuts,
//!            LiveOut{ u16 DwarfRegNum, u8 reserved, u8 Size }*,
//!            align(8) }*
//! ```
//!
//! Records are attributed to functions in order via each function's
//! `RecordCount`. Within a record, Location[0] is a constant holding the
//! number of plain call-site locations; those follow, and any remaining
//! locations are (constant vreg, location) pairs carrying the deopt
//! bundle for that call site. Deopt state therefore only ever attaches
//! to a recorded call site.
//!
//! A malformed blob aborts; this is producer output, not untrusted user
//! input, and continuing past an inconsistency corrupts GC and deopt
//! state downstream.

use super::{CallsiteEntry, DeoptEntry, LocationTy, StackMapInfo, TargetTriple};

const LOC_REGISTER: u8 = 1;
const LOC_DIRECT: u8 = 2;
const LOC_INDIRECT: u8 = 3;
const LOC_CONSTANT: u8 = 4;
const LOC_CONST_INDEX: u8 = 5;

/// One function's worth of stack-map records from an LLVM blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlvmFunctionMap {
    pub func_addr: u64,
    pub stack_size: u64,
    pub info: StackMapInfo,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> &'a [u8] {
        assert!(self.pos + n <= self.bytes.len(), "truncated LLVM stackmap");
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take(1)[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take(2).try_into().unwrap())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take(4).try_into().unwrap())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take(8).try_into().unwrap())
    }

    fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take(4).try_into().unwrap())
    }

    fn align8(&mut self) {
        while self.pos % 8 != 0 {
            self.pos += 1;
        }
        assert!(self.pos <= self.bytes.len(), "truncated LLVM stackmap");
    }
}

fn decode_location(
    kind: u8,
    reg: u16,
    offset: i32,
    constants: &[u64],
    triple: TargetTriple,
) -> LocationTy {
    match kind {
        LOC_REGISTER => LocationTy::Register(reg),
        LOC_DIRECT | LOC_INDIRECT => {
            // Spilled values are reported relative to FP or SP; the
            // deoptimizer reconstructs against FP, so anything else is
            // a layout we do not understand.
            assert!(
                reg == triple.fp_dwarf_reg() || reg == triple.sp_dwarf_reg(),
                "stack location relative to unexpected register {}",
                reg
            );
            LocationTy::FrameSlot(offset)
        }
        LOC_CONSTANT => LocationTy::Immediate(offset as i64),
        LOC_CONST_INDEX => {
            let index = offset as usize;
            assert!(index < constants.len(), "constant index out of range");
            LocationTy::Immediate(constants[index] as i64)
        }
        _ => panic!("unsupported location kind {} in LLVM stackmap", kind),
    }
}

/// Split one record's flat location list into call-site locations and
/// deopt (vreg, location) slots, per the Location[0] count prefix.
fn split_record_locations(raw: Vec<LocationTy>) -> (Vec<LocationTy>, Vec<(i32, LocationTy)>) {
    if raw.is_empty() {
        return (Vec::new(), Vec::new());
    }
    let count = match raw[0] {
        LocationTy::Immediate(n) => {
            assert!(
                n >= 0 && (n as usize) < raw.len(),
                "call-site location count {} out of range",
                n
            );
            n as usize
        }
        _ => panic!("record is missing its call-site location count"),
    };
    let locations = raw[1..1 + count].to_vec();

    let rest = &raw[1 + count..];
    assert!(
        rest.len() % 2 == 0,
        "dangling deopt slot in LLVM stackmap record"
    );
    let mut slots = Vec::with_capacity(rest.len() / 2);
    for pair in rest.chunks(2) {
        let vreg = match pair[0] {
            LocationTy::Immediate(v) => {
                assert!(
                    (i32::MIN as i64..=i32::MAX as i64).contains(&v),
                    "deopt vreg {} out of range",
                    v
                );
                v as i32
            }
            _ => panic!("deopt slot is missing its vreg constant"),
        };
        slots.push((vreg, pair[1]));
    }
    (locations, slots)
}

/// Parse an LLVM stackmap blob into per-function canonical maps.
///
/// Record PCs are rewritten relative to their function's start address,
/// matching the canonical keying used everywhere else.
pub fn decode_llvm(bytes: &[u8], triple: TargetTriple) -> Vec<LlvmFunctionMap> {
    let mut cur = Cursor { bytes, pos: 0 };

    let version = cur.u8();
    assert_eq!(version, 3, "unsupported LLVM stackmap version");
    let _ = cur.u8();
    let _ = cur.u16();

    let num_functions = cur.u32() as usize;
    let num_constants = cur.u32() as usize;
    let num_records = cur.u32() as usize;

    let mut functions = Vec::with_capacity(num_functions);
    for _ in 0..num_functions {
        let addr = cur.u64();
        let stack_size = cur.u64();
        let record_count = cur.u64();
        functions.push((addr, stack_size, record_count));
    }

    let mut constants = Vec::with_capacity(num_constants);
    for _ in 0..num_constants {
        constants.push(cur.u64());
    }

    let total: u64 = functions.iter().map(|&(_, _, c)| c).sum();
    assert_eq!(total as usize, num_records, "record counts disagree");

    let mut out = Vec::with_capacity(num_functions);
    for (addr, stack_size, record_count) in functions {
        let mut info = StackMapInfo::new();
        for _ in 0..record_count {
            let _patch_point_id = cur.u64();
            let instruction_offset = cur.u32();
            let _ = cur.u16();
            let num_locations = cur.u16() as usize;

            let mut raw = Vec::with_capacity(num_locations);
            for _ in 0..num_locations {
                let kind = cur.u8();
                let _ = cur.u8();
                let _size = cur.u16();
                let reg = cur.u16();
                let _ = cur.u16();
                let offset = cur.i32();
                raw.push(decode_location(kind, reg, offset, &constants, triple));
            }
            cur.align8();

            let _padding = cur.u16();
            let num_live_outs = cur.u16() as usize;
            for _ in 0..num_live_outs {
                let _reg = cur.u16();
                let _ = cur.u8();
                let _size = cur.u8();
            }
            cur.align8();

            let (locations, slots) = split_record_locations(raw);
            info.callsites.push(CallsiteEntry {
                pc: instruction_offset as u64,
                locations,
            });
            if !slots.is_empty() {
                info.deopts.push(DeoptEntry {
                    pc: instruction_offset as u64,
                    slots,
                });
            }
        }
        info.sort();
        out.push(LlvmFunctionMap {
            func_addr: addr,
            stack_size,
            info,
        });
    }
    assert_eq!(cur.pos, cur.bytes.len(), "trailing bytes in LLVM stackmap");
    out
}

/// Serialize canonical maps into the LLVM v3 layout. Tooling/test aid;
/// production blobs come from the codegen backend.
pub fn encode_llvm(functions: &[LlvmFunctionMap], triple: TargetTriple) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(3u8);
    out.push(0);
    out.extend_from_slice(&0u16.to_le_bytes());

    let num_records: usize = functions.iter().map(|f| f.info.callsites.len()).sum();
    out.extend_from_slice(&(functions.len() as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // no large constants
    out.extend_from_slice(&(num_records as u32).to_le_bytes());

    for f in functions {
        out.extend_from_slice(&f.func_addr.to_le_bytes());
        out.extend_from_slice(&f.stack_size.to_le_bytes());
        out.extend_from_slice(&(f.info.callsites.len() as u64).to_le_bytes());
    }

    fn push_location(out: &mut Vec<u8>, loc: LocationTy, triple: TargetTriple) {
        let (kind, reg, offset) = match loc {
            LocationTy::Register(r) => (LOC_REGISTER, r, 0i32),
            LocationTy::FrameSlot(off) => (LOC_INDIRECT, triple.fp_dwarf_reg(), off),
            LocationTy::Immediate(v) => {
                (LOC_CONSTANT, 0, i32::try_from(v).expect("large constant"))
            }
        };
        out.push(kind);
        out.push(0);
        out.extend_from_slice(&8u16.to_le_bytes());
        out.extend_from_slice(&reg.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
    }

    for f in functions {
        // Deopt state rides on the call-site record at the same pc.
        for deopt in &f.info.deopts {
            assert!(
                f.info.callsites.iter().any(|c| c.pc == deopt.pc),
                "deopt state at pc {:#x} without a call-site record",
                deopt.pc
            );
        }
        for callsite in &f.info.callsites {
            let slots: &[(i32, LocationTy)] = f
                .info
                .deopts
                .iter()
                .find(|d| d.pc == callsite.pc)
                .map(|d| d.slots.as_slice())
                .unwrap_or(&[]);
            let total = 1 + callsite.locations.len() + 2 * slots.len();

            out.extend_from_slice(&0u64.to_le_bytes()); // patch point id
            out.extend_from_slice(&(callsite.pc as u32).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&(total as u16).to_le_bytes());
            push_location(
                &mut out,
                LocationTy::Immediate(callsite.locations.len() as i64),
                triple,
            );
            for &loc in &callsite.locations {
                push_location(&mut out, loc, triple);
            }
            for &(vreg, loc) in slots {
                push_location(&mut out, LocationTy::Immediate(vreg as i64), triple);
                push_location(&mut out, loc, triple);
            }
            while out.len() % 8 != 0 {
                out.push(0);
            }
            out.extend_from_slice(&0u16.to_le_bytes()); // padding
            out.extend_from_slice(&0u16.to_le_bytes()); // no live-outs
            while out.len() % 8 != 0 {
                out.push(0);
            }
        }
    }
    out
}
