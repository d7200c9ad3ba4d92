//! AOT file metadata: function entries, module sections, and the
//! return-address lookup used by the unwinder and deoptimizer.
//!
//! The on-disk image produced here is an ad hoc binary protocol: field
//! orders, widths, and the alignment constants below are contracts shared
//! with every reader of the format.

mod entry;
mod file_info;
mod section;

pub use entry::{ENTRY_SIZE, FuncEntryDes, INVALID_INDEX, MAX_CALLEE_SAVE_REGISTER_NUM};
pub use file_info::{AotFileError, AotFileInfo, CallSiteInfo};
pub use section::{ModuleSectionDes, SectionKind, StackMapSlice};

/// Text sections are aligned to 16 bytes in merged images.
pub const TEXT_ALIGN: u64 = 16;
/// Data sections (including the merged stack-map blob) align to 8 bytes.
pub const DATA_ALIGN: u64 = 8;
/// Whole module images align to page boundaries when concatenated.
pub const PAGE_ALIGN: u64 = 4096;

/// Round `value` up to a multiple of `align` (a power of two).
pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}
