//! Normalization and serialization of stack maps.
//!
//! [`ArkStackMapBuilder`] turns whichever wire encoding a codegen backend
//! produced into the canonical [`StackMapInfo`], then emits the on-disk
//! blob stored in each module's ArkStackMap section. The blob uses fixed
//! widths so the runtime can parse it without a decoder state machine:
//!
//! ```text
//! u32 magic, u32 callsite_count, u32 deopt_count
//! callsite: u64 pc, u32 location_count, { u32 raw }*
//! deopt:    u64 pc, u32 slot_count,
//!           { i32 vreg, u8 kind, u8 pad[3], i64 value }*
//! ```
//!
//! Call-site locations use the raw merged form ([`LocationTy::to_raw`]):
//! a 0xFFFF high half-word marks a register, anything else is an i32
//! frame offset. Deopt slots can additionally hold immediates, so they
//! carry an explicit kind byte matching the LiteCG tags: 0 constant,
//! 1 stack, 2 register.

use super::litecg::{KIND_CONSTANT, KIND_REGISTER, KIND_STACK, decode_litecg};
use super::llvm::decode_llvm;
use super::{CallsiteEntry, DeoptEntry, LocationTy, StackMapInfo, TargetTriple};

const BLOB_MAGIC: u32 = u32::from_le_bytes(*b"ARSM");

/// Raw stack-map bytes as produced by one of the two supported backends.
#[derive(Debug, Clone)]
pub enum BackendStackMap {
    /// LLVM binary stackmap, version 3.
    Llvm(Vec<u8>),
    /// LiteCG SLEB128 stream.
    LiteCg(Vec<u8>),
}

/// Converts backend stack maps to the canonical form and serializes the
/// canonical form into ArkStackMap blobs.
#[derive(Debug, Clone, Copy)]
pub struct ArkStackMapBuilder {
    triple: TargetTriple,
}

impl ArkStackMapBuilder {
    pub fn new(triple: TargetTriple) -> Self {
        Self { triple }
    }

    pub fn triple(&self) -> TargetTriple {
        self.triple
    }

    /// Decode a backend blob into the canonical form, with every PC
    /// rebased relative to `text_start`.
    pub fn normalize(&self, backend: &BackendStackMap, text_start: u64) -> StackMapInfo {
        match backend {
            BackendStackMap::LiteCg(bytes) => decode_litecg(bytes, self.triple),
            BackendStackMap::Llvm(bytes) => {
                let mut info = StackMapInfo::new();
                for func in decode_llvm(bytes, self.triple) {
                    assert!(
                        func.func_addr >= text_start,
                        "function address precedes module text"
                    );
                    let base = func.func_addr - text_start;
                    for callsite in func.info.callsites {
                        info.callsites.push(CallsiteEntry {
                            pc: base + callsite.pc,
                            locations: callsite.locations,
                        });
                    }
                    for deopt in func.info.deopts {
                        info.deopts.push(DeoptEntry {
                            pc: base + deopt.pc,
                            slots: deopt.slots,
                        });
                    }
                }
                info.sort();
                info
            }
        }
    }

    /// Serialize the canonical form into one ArkStackMap blob.
    pub fn emit(&self, info: &StackMapInfo) -> Vec<u8> {
        fn push_location(out: &mut Vec<u8>, loc: LocationTy) {
            let (kind, value): (u8, i64) = match loc {
                LocationTy::Immediate(v) => (KIND_CONSTANT as u8, v),
                LocationTy::FrameSlot(off) => (KIND_STACK as u8, off as i64),
                LocationTy::Register(reg) => (KIND_REGISTER as u8, reg as i64),
            };
            out.push(kind);
            out.extend_from_slice(&[0u8; 3]);
            out.extend_from_slice(&value.to_le_bytes());
        }

        let mut sorted = info.clone();
        sorted.sort();

        let mut out = Vec::new();
        out.extend_from_slice(&BLOB_MAGIC.to_le_bytes());
        out.extend_from_slice(&(sorted.callsites.len() as u32).to_le_bytes());
        out.extend_from_slice(&(sorted.deopts.len() as u32).to_le_bytes());

        for callsite in &sorted.callsites {
            out.extend_from_slice(&callsite.pc.to_le_bytes());
            out.extend_from_slice(&(callsite.locations.len() as u32).to_le_bytes());
            for &loc in &callsite.locations {
                // Call sites hold value locations only; a constant here
                // means a backend emitted deopt state into the wrong
                // table.
                assert!(
                    !matches!(loc, LocationTy::Immediate(_)),
                    "immediate location at call site"
                );
                out.extend_from_slice(&loc.to_raw().to_le_bytes());
            }
        }
        for deopt in &sorted.deopts {
            out.extend_from_slice(&deopt.pc.to_le_bytes());
            out.extend_from_slice(&(deopt.slots.len() as u32).to_le_bytes());
            for &(vreg, loc) in &deopt.slots {
                out.extend_from_slice(&vreg.to_le_bytes());
                push_location(&mut out, loc);
            }
        }
        out
    }

    /// Parse an ArkStackMap blob back into the canonical form. A corrupt
    /// blob aborts: the deoptimizer cannot proceed with guessed state.
    pub fn parse(bytes: &[u8]) -> StackMapInfo {
        struct Cursor<'a> {
            bytes: &'a [u8],
            pos: usize,
        }
        impl<'a> Cursor<'a> {
            fn take(&mut self, n: usize) -> &'a [u8] {
                assert!(
                    self.pos + n <= self.bytes.len(),
                    "truncated ArkStackMap blob"
                );
                let out = &self.bytes[self.pos..self.pos + n];
                self.pos += n;
                out
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
            fn i64(&mut self) -> i64 {
                i64::from_le_bytes(self.take(8).try_into().unwrap())
            }
            fn location(&mut self) -> LocationTy {
                let kind = self.take(4)[0];
                let value = self.i64();
                match kind as i64 {
                    KIND_CONSTANT => LocationTy::Immediate(value),
                    KIND_STACK => LocationTy::FrameSlot(value as i32),
                    KIND_REGISTER => LocationTy::Register(value as u16),
                    _ => panic!("unsupported location kind {} in ArkStackMap blob", kind),
                }
            }
        }

        let mut cur = Cursor { bytes, pos: 0 };
        assert_eq!(cur.u32(), BLOB_MAGIC, "bad ArkStackMap magic");
        let callsite_count = cur.u32() as usize;
        let deopt_count = cur.u32() as usize;

        let mut info = StackMapInfo::new();
        for _ in 0..callsite_count {
            let pc = cur.u64();
            let location_count = cur.u32() as usize;
            let mut locations = Vec::with_capacity(location_count);
            for _ in 0..location_count {
                locations.push(LocationTy::from_raw(cur.u32()));
            }
            info.callsites.push(CallsiteEntry { pc, locations });
        }
        for _ in 0..deopt_count {
            let pc = cur.u64();
            let slot_count = cur.u32() as usize;
            let mut slots = Vec::with_capacity(slot_count);
            for _ in 0..slot_count {
                let vreg = cur.i32();
                slots.push((vreg, cur.location()));
            }
            info.deopts.push(DeoptEntry { pc, slots });
        }
        assert_eq!(cur.pos, bytes.len(), "trailing bytes in ArkStackMap blob");
        info
    }
}
