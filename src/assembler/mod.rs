//! Machine-code assembly buffer.
//!
//! Both codegen backends emit raw instruction bytes through this
//! append-only buffer. Forward references are recorded against named
//! labels and patched in one pass before the code is placed into
//! executable memory.

mod memory;

pub use memory::{ExecMemory, MemError};

use std::collections::HashMap;

/// Relocation width/shape of a forward reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// 32-bit PC-relative displacement (x86-64 near jump/call).
    Rel32,
    /// 26-bit instruction-count displacement in an AArch64 B/BL.
    AArch64Branch26,
}

/// Error type for assembly and finalization.
#[derive(Debug)]
pub enum AsmError {
    UndefinedLabel(String),
    DisplacementOutOfRange(String),
    Memory(MemError),
}

impl std::fmt::Display for AsmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AsmError::UndefinedLabel(label) => write!(f, "undefined label: {}", label),
            AsmError::DisplacementOutOfRange(label) => {
                write!(f, "displacement out of range for label: {}", label)
            }
            AsmError::Memory(e) => write!(f, "memory error: {}", e),
        }
    }
}

impl std::error::Error for AsmError {}

struct ForwardRef {
    offset: usize,
    label: String,
    kind: RelocKind,
}

/// Append-only byte buffer with label/relocation bookkeeping.
pub struct Assembler {
    code: Vec<u8>,
    labels: HashMap<String, usize>,
    forward_refs: Vec<ForwardRef>,
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            labels: HashMap::new(),
            forward_refs: Vec::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
            labels: HashMap::new(),
            forward_refs: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Current offset, used when binding labels.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Zero-pad the buffer up to a multiple of `alignment`.
    pub fn align(&mut self, alignment: usize) {
        let aligned = (self.code.len() + alignment - 1) & !(alignment - 1);
        self.code.resize(aligned, 0);
    }

    /// Bind a label to the current offset.
    pub fn bind_label(&mut self, name: &str) {
        self.labels.insert(name.to_string(), self.code.len());
    }

    pub fn label_offset(&self, name: &str) -> Option<usize> {
        self.labels.get(name).copied()
    }

    /// Emit placeholder bytes for a reference to `label`, to be patched
    /// by [`patch_forward_refs`](Assembler::patch_forward_refs).
    pub fn emit_forward_ref(&mut self, label: &str, kind: RelocKind) {
        self.forward_refs.push(ForwardRef {
            offset: self.code.len(),
            label: label.to_string(),
            kind,
        });
        // Both kinds occupy 4 bytes. An AArch64 branch placeholder keeps
        // its opcode bits; the patch preserves the top 6 bits.
        self.emit_u32(0);
    }

    /// Resolve every recorded forward reference against bound labels.
    pub fn patch_forward_refs(&mut self) -> Result<(), AsmError> {
        for fref in self.forward_refs.drain(..) {
            let target = *self
                .labels
                .get(&fref.label)
                .ok_or_else(|| AsmError::UndefinedLabel(fref.label.clone()))?;

            match fref.kind {
                RelocKind::Rel32 => {
                    // Displacement is relative to the end of the 4-byte field.
                    let rel = target as i64 - (fref.offset as i64 + 4);
                    if rel < i32::MIN as i64 || rel > i32::MAX as i64 {
                        return Err(AsmError::DisplacementOutOfRange(fref.label));
                    }
                    self.code[fref.offset..fref.offset + 4]
                        .copy_from_slice(&(rel as i32).to_le_bytes());
                }
                RelocKind::AArch64Branch26 => {
                    // Offset counts 4-byte instructions from the branch itself.
                    let rel = (target as i64 - fref.offset as i64) / 4;
                    if !(-(1 << 25)..(1 << 25)).contains(&rel) {
                        return Err(AsmError::DisplacementOutOfRange(fref.label));
                    }
                    let current = u32::from_le_bytes(
                        self.code[fref.offset..fref.offset + 4].try_into().unwrap(),
                    );
                    let patched = (current & 0xFC00_0000) | ((rel as u32) & 0x03FF_FFFF);
                    self.code[fref.offset..fref.offset + 4]
                        .copy_from_slice(&patched.to_le_bytes());
                }
            }
        }
        Ok(())
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Consume the buffer. References must already be patched.
    pub fn into_code(mut self) -> Result<Vec<u8>, AsmError> {
        self.patch_forward_refs()?;
        Ok(self.code)
    }

    /// Patch references, copy into fresh executable memory, and seal it.
    pub fn finalize(mut self) -> Result<ExecMemory, AsmError> {
        self.patch_forward_refs()?;
        let mut mem = ExecMemory::new(self.code.len()).map_err(AsmError::Memory)?;
        mem.write(0, &self.code).map_err(AsmError::Memory)?;
        mem.seal().map_err(AsmError::Memory)?;
        Ok(mem)
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_bytes() {
        let mut asm = Assembler::new();
        asm.emit_u8(0x90);
        asm.emit_u16(0x1234);
        asm.emit_u32(0xDEADBEEF);
        asm.emit_u64(1);

        assert_eq!(asm.len(), 15);
        assert_eq!(&asm.code()[..7], &[0x90, 0x34, 0x12, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_align() {
        let mut asm = Assembler::new();
        asm.emit_u8(0xC3);
        asm.align(16);
        assert_eq!(asm.len(), 16);
        assert_eq!(asm.code()[1], 0);
    }

    #[test]
    fn test_labels() {
        let mut asm = Assembler::new();
        asm.emit_u8(0x90);
        asm.bind_label("loop");
        asm.emit_u8(0x90);
        assert_eq!(asm.label_offset("loop"), Some(1));
        assert_eq!(asm.label_offset("missing"), None);
    }

    #[test]
    fn test_patch_rel32_forward() {
        let mut asm = Assembler::new();
        asm.emit_u8(0xE9); // jmp rel32
        asm.emit_forward_ref("target", RelocKind::Rel32);
        asm.emit_u8(0x90);
        asm.bind_label("target");
        asm.patch_forward_refs().unwrap();

        // Field ends at offset 5, target at 6: displacement 1.
        let disp = i32::from_le_bytes(asm.code()[1..5].try_into().unwrap());
        assert_eq!(disp, 1);
    }

    #[test]
    fn test_patch_rel32_backward() {
        let mut asm = Assembler::new();
        asm.bind_label("top");
        asm.emit_u8(0x90);
        asm.emit_u8(0xE9);
        asm.emit_forward_ref("top", RelocKind::Rel32);
        asm.patch_forward_refs().unwrap();

        let disp = i32::from_le_bytes(asm.code()[2..6].try_into().unwrap());
        assert_eq!(disp, -6);
    }

    #[test]
    fn test_patch_aarch64_branch() {
        let mut asm = Assembler::new();
        // B placeholder with opcode bits 0b000101 in the top 6 bits.
        asm.emit_forward_ref("fwd", RelocKind::AArch64Branch26);
        let opcode = 0x1400_0000u32;
        asm.code[0..4].copy_from_slice(&opcode.to_le_bytes());
        asm.emit_u32(0xD503201F); // nop
        asm.bind_label("fwd");
        asm.patch_forward_refs().unwrap();

        let inst = u32::from_le_bytes(asm.code()[0..4].try_into().unwrap());
        assert_eq!(inst >> 26, 0x05); // opcode preserved
        assert_eq!(inst & 0x03FF_FFFF, 2); // two instructions forward
    }

    #[test]
    fn test_undefined_label_errors() {
        let mut asm = Assembler::new();
        asm.emit_forward_ref("nowhere", RelocKind::Rel32);
        assert!(matches!(
            asm.patch_forward_refs(),
            Err(AsmError::UndefinedLabel(_))
        ));
    }

    #[test]
    fn test_into_code_patches() {
        let mut asm = Assembler::new();
        asm.emit_forward_ref("end", RelocKind::Rel32);
        asm.bind_label("end");
        let code = asm.into_code().unwrap();
        assert_eq!(i32::from_le_bytes(code[0..4].try_into().unwrap()), 0);
    }
}
