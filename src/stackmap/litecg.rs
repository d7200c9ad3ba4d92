//! Decoder for LiteCG's SLEB128-encoded stack-map stream.
//!
//! The stream is a call-site section followed by a deopt section. Every
//! value is SLEB128. Call-site locations are (kind, value) pairs; deopt
//! slots are (vreg, kind, value) triples:
//!
//! ```text
//! callsite_count
//!   { pc, location_count, { kind, value }* }*
//! deopt_count
//!   { pc, slot_count, { vreg, kind, value }* }*
//! ```
//!
//! Kind 2 is a register (value = DWARF register number), kind 1 a stack
//! slot (value = byte offset from the triple's frame-pointer register).
//! Kind 0, a raw constant, is legal only in deopt slots. Anything else is
//! an unsupported location kind and aborts: continuing with a guessed
//! location corrupts deoptimization.

use super::sleb128;
use super::{CallsiteEntry, DeoptEntry, LocationTy, StackMapInfo, TargetTriple};

pub const KIND_CONSTANT: i64 = 0;
pub const KIND_STACK: i64 = 1;
pub const KIND_REGISTER: i64 = 2;

fn decode_location(kind: i64, value: i64, allow_constant: bool) -> LocationTy {
    match kind {
        KIND_REGISTER => {
            assert!(
                (0..=u16::MAX as i64).contains(&value),
                "register number {} out of range",
                value
            );
            LocationTy::Register(value as u16)
        }
        KIND_STACK => {
            assert!(
                (i32::MIN as i64..=i32::MAX as i64).contains(&value),
                "frame offset {} out of range",
                value
            );
            LocationTy::FrameSlot(value as i32)
        }
        KIND_CONSTANT if allow_constant => LocationTy::Immediate(value),
        _ => panic!("unsupported location kind {} in LiteCG stack map", kind),
    }
}

/// Decode one function's LiteCG stream into the canonical form.
///
/// `triple` names the architecture whose frame-pointer register stack
/// offsets are relative to; it must be a supported target (enforced at
/// config time via [`TargetTriple::parse`]).
pub fn decode_litecg(bytes: &[u8], _triple: TargetTriple) -> StackMapInfo {
    let mut pos = 0usize;
    let mut info = StackMapInfo::new();

    let callsite_count = sleb128::decode(bytes, &mut pos);
    assert!(callsite_count >= 0, "negative call-site count");
    for _ in 0..callsite_count {
        let pc = sleb128::decode(bytes, &mut pos);
        assert!(pc >= 0, "negative call-site pc");
        let location_count = sleb128::decode(bytes, &mut pos);
        assert!(location_count >= 0, "negative location count");
        let mut locations = Vec::with_capacity(location_count as usize);
        for _ in 0..location_count {
            let kind = sleb128::decode(bytes, &mut pos);
            let value = sleb128::decode(bytes, &mut pos);
            locations.push(decode_location(kind, value, false));
        }
        info.callsites.push(CallsiteEntry {
            pc: pc as u64,
            locations,
        });
    }

    let deopt_count = sleb128::decode(bytes, &mut pos);
    assert!(deopt_count >= 0, "negative deopt count");
    for _ in 0..deopt_count {
        let pc = sleb128::decode(bytes, &mut pos);
        assert!(pc >= 0, "negative deopt pc");
        let slot_count = sleb128::decode(bytes, &mut pos);
        assert!(slot_count >= 0, "negative deopt slot count");
        let mut slots = Vec::with_capacity(slot_count as usize);
        for _ in 0..slot_count {
            let vreg = sleb128::decode(bytes, &mut pos);
            let kind = sleb128::decode(bytes, &mut pos);
            let value = sleb128::decode(bytes, &mut pos);
            slots.push((vreg as i32, decode_location(kind, value, true)));
        }
        info.deopts.push(DeoptEntry {
            pc: pc as u64,
            slots,
        });
    }

    assert_eq!(pos, bytes.len(), "trailing bytes in LiteCG stack map");
    info.sort();
    info
}

/// Encode the canonical form back into the LiteCG stream layout. Exists
/// for tooling and tests; production input always comes from the backend.
pub fn encode_litecg(info: &StackMapInfo) -> Vec<u8> {
    fn location_parts(loc: LocationTy) -> (i64, i64) {
        match loc {
            LocationTy::Register(reg) => (KIND_REGISTER, reg as i64),
            LocationTy::FrameSlot(offset) => (KIND_STACK, offset as i64),
            LocationTy::Immediate(value) => (KIND_CONSTANT, value),
        }
    }

    let mut out = Vec::new();
    sleb128::encode(info.callsites.len() as i64, &mut out);
    for callsite in &info.callsites {
        sleb128::encode(callsite.pc as i64, &mut out);
        sleb128::encode(callsite.locations.len() as i64, &mut out);
        for &loc in &callsite.locations {
            let (kind, value) = location_parts(loc);
            sleb128::encode(kind, &mut out);
            sleb128::encode(value, &mut out);
        }
    }
    sleb128::encode(info.deopts.len() as i64, &mut out);
    for deopt in &info.deopts {
        sleb128::encode(deopt.pc as i64, &mut out);
        sleb128::encode(deopt.slots.len() as i64, &mut out);
        for &(vreg, loc) in &deopt.slots {
            sleb128::encode(vreg as i64, &mut out);
            let (kind, value) = location_parts(loc);
            sleb128::encode(kind, &mut out);
            sleb128::encode(value, &mut out);
        }
    }
    out
}
