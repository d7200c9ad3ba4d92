//! Target-architecture awareness, confined to one lookup: which physical
//! register is the frame pointer (and stack pointer) on each supported
//! triple. Register numbers follow DWARF conventions.

/// Supported target architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetTriple {
    #[default]
    X86_64,
    Aarch64,
    Arm32,
}

impl TargetTriple {
    /// Parse a full LLVM-style triple string. Returns `None` for an
    /// architecture this subsystem does not support; callers validating
    /// config turn that into a user error, everything past config treats
    /// an unsupported triple as fatal.
    pub fn parse(triple: &str) -> Option<Self> {
        let arch = triple.split('-').next()?;
        Some(match arch {
            "x86_64" | "amd64" => TargetTriple::X86_64,
            "aarch64" | "arm64" => TargetTriple::Aarch64,
            "arm" | "armv7" | "thumbv7" => TargetTriple::Arm32,
            _ => return None,
        })
    }

    /// DWARF register number of the frame pointer.
    pub fn fp_dwarf_reg(self) -> u16 {
        match self {
            TargetTriple::X86_64 => 6,   // rbp
            TargetTriple::Aarch64 => 29, // x29
            TargetTriple::Arm32 => 11,   // r11
        }
    }

    /// DWARF register number of the stack pointer.
    pub fn sp_dwarf_reg(self) -> u16 {
        match self {
            TargetTriple::X86_64 => 7,   // rsp
            TargetTriple::Aarch64 => 31, // sp
            TargetTriple::Arm32 => 13,   // r13
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TargetTriple::X86_64 => "x86_64",
            TargetTriple::Aarch64 => "aarch64",
            TargetTriple::Arm32 => "arm32",
        }
    }
}

impl std::fmt::Display for TargetTriple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
