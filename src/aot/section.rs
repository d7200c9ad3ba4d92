//! Per-module section descriptors.

use std::collections::HashMap;
use std::sync::Arc;

use super::{DATA_ALIGN, TEXT_ALIGN};

/// ELF-like section roles a compiled module can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Text,
    RodataBeforeText,
    RodataAfterText,
    ArkStackMap,
}

impl SectionKind {
    pub fn to_u32(self) -> u32 {
        match self {
            SectionKind::Text => 0,
            SectionKind::RodataBeforeText => 1,
            SectionKind::RodataAfterText => 2,
            SectionKind::ArkStackMap => 3,
        }
    }

    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => SectionKind::Text,
            1 => SectionKind::RodataBeforeText,
            2 => SectionKind::RodataAfterText,
            3 => SectionKind::ArkStackMap,
            _ => return None,
        })
    }

    /// Required alignment when this section is placed in a merged image.
    pub fn align(self) -> u64 {
        match self {
            SectionKind::Text => TEXT_ALIGN,
            _ => DATA_ALIGN,
        }
    }
}

/// A window into a shared stack-map buffer.
///
/// Before the merge pass each module holds its own whole blob (offset 0);
/// after merging, every module's slice points into the single merged
/// section.
#[derive(Debug, Clone)]
pub struct StackMapSlice {
    data: Arc<[u8]>,
    offset: usize,
    len: usize,
}

impl StackMapSlice {
    pub fn whole(data: Arc<[u8]>) -> Self {
        let len = data.len();
        Self {
            data,
            offset: 0,
            len,
        }
    }

    pub fn window(data: Arc<[u8]>, offset: usize, len: usize) -> Self {
        assert!(offset + len <= data.len(), "stack-map window out of range");
        Self { data, offset, len }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.len]
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// One compiled module's section table.
///
/// `start_index` and `func_count` delimit the module's sub-range of the
/// global function-entry array.
#[derive(Debug, Clone, Default)]
pub struct ModuleSectionDes {
    sections: HashMap<SectionKind, (u64, u64)>,
    start_index: u32,
    func_count: u32,
    stackmap: Option<StackMapSlice>,
}

impl ModuleSectionDes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_section(&mut self, kind: SectionKind, addr: u64, size: u64) {
        self.sections.insert(kind, (addr, size));
    }

    pub fn section(&self, kind: SectionKind) -> Option<(u64, u64)> {
        self.sections.get(&kind).copied()
    }

    pub fn sections(&self) -> impl Iterator<Item = (SectionKind, u64, u64)> + '_ {
        self.sections.iter().map(|(k, &(a, s))| (*k, a, s))
    }

    /// The TEXT section's (addr, size), if the module has one.
    pub fn text_range(&self) -> Option<(u64, u64)> {
        self.section(SectionKind::Text)
    }

    /// Whether `addr` falls inside this module's TEXT section.
    pub fn contains_text(&self, addr: u64) -> bool {
        match self.text_range() {
            Some((start, size)) => addr >= start && addr < start + size,
            None => false,
        }
    }

    pub fn start_index(&self) -> u32 {
        self.start_index
    }

    pub fn func_count(&self) -> u32 {
        self.func_count
    }

    pub fn set_entry_range(&mut self, start_index: u32, func_count: u32) {
        self.start_index = start_index;
        self.func_count = func_count;
    }

    pub fn set_stackmap(&mut self, slice: StackMapSlice) {
        self.stackmap = Some(slice);
    }

    pub fn stackmap(&self) -> Option<&StackMapSlice> {
        self.stackmap.as_ref()
    }

    /// Repoint this module's stack map at a window of the merged section.
    /// The private per-module buffer is released here.
    pub fn rewrite_stackmap(&mut self, merged: Arc<[u8]>, offset: usize, len: usize) {
        self.stackmap = Some(StackMapSlice::window(merged, offset, len));
        self.set_section(SectionKind::ArkStackMap, offset as u64, len as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_kind_round_trip() {
        for raw in 0..4 {
            assert_eq!(SectionKind::from_u32(raw).unwrap().to_u32(), raw);
        }
        assert!(SectionKind::from_u32(9).is_none());
    }

    #[test]
    fn test_section_alignments() {
        assert_eq!(SectionKind::Text.align(), 16);
        assert_eq!(SectionKind::ArkStackMap.align(), 8);
        assert_eq!(SectionKind::RodataBeforeText.align(), 8);
    }

    #[test]
    fn test_contains_text() {
        let mut des = ModuleSectionDes::new();
        assert!(!des.contains_text(0x1000));

        des.set_section(SectionKind::Text, 0x1000, 0x100);
        assert!(des.contains_text(0x1000));
        assert!(des.contains_text(0x10FF));
        assert!(!des.contains_text(0x1100));
        assert!(!des.contains_text(0xFFF));
    }

    #[test]
    fn test_stackmap_rewrite() {
        let mut des = ModuleSectionDes::new();
        let private: Arc<[u8]> = Arc::from(vec![1u8, 2, 3].into_boxed_slice());
        des.set_stackmap(StackMapSlice::whole(private));
        assert_eq!(des.stackmap().unwrap().as_bytes(), &[1, 2, 3]);

        let merged: Arc<[u8]> = Arc::from(vec![0u8, 0, 1, 2, 3, 9].into_boxed_slice());
        des.rewrite_stackmap(merged, 2, 3);
        let sm = des.stackmap().unwrap();
        assert_eq!(sm.as_bytes(), &[1, 2, 3]);
        assert_eq!(sm.offset(), 2);
        assert_eq!(des.section(SectionKind::ArkStackMap), Some((2, 3)));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_bad_window_panics() {
        let data: Arc<[u8]> = Arc::from(vec![0u8; 4].into_boxed_slice());
        let _ = StackMapSlice::window(data, 2, 4);
    }
}
