//! The file-level AOT index: every function entry, every module's section
//! table, and the query surface the runtime's unwinder and deoptimizer
//! use against compiled code.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use super::entry::{ENTRY_SIZE, FuncEntryDes, MAX_CALLEE_SAVE_REGISTER_NUM};
use super::section::{ModuleSectionDes, SectionKind, StackMapSlice};
use super::{DATA_ALIGN, PAGE_ALIGN, align_up};
use crate::assembler::ExecMemory;
use crate::signature::TargetKind;

const MAGIC: u32 = u32::from_le_bytes(*b"CRCL");
const VERSION: u32 = 1;

/// Error type for AOT image I/O.
#[derive(Debug)]
pub enum AotFileError {
    Io(String),
    BadMagic,
    BadVersion(u32),
    Corrupt(&'static str),
    Memory(crate::assembler::MemError),
}

impl std::fmt::Display for AotFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AotFileError::Io(msg) => write!(f, "io error: {}", msg),
            AotFileError::BadMagic => write!(f, "not an AOT image (bad magic)"),
            AotFileError::BadVersion(v) => write!(f, "unsupported AOT image version {}", v),
            AotFileError::Corrupt(what) => write!(f, "corrupt AOT image: {}", what),
            AotFileError::Memory(e) => write!(f, "executable memory: {}", e),
        }
    }
}

impl std::error::Error for AotFileError {}

/// Result of a return-address lookup.
///
/// When the query is neither a stub nor a deopt lookup, only the module
/// identity is filled in: `fp_delta` is zero and `callee_regs` is empty.
#[derive(Debug, Clone)]
pub struct CallSiteInfo {
    /// Start address of the matching module's TEXT section.
    pub text_start: u64,
    /// The module's encoded stack-map blob, when one was recorded.
    pub stackmap: Option<StackMapSlice>,
    /// Frame-pointer-to-previous-SP delta of the matched function.
    pub fp_delta: i32,
    /// Saved (register, stack offset) pairs, filled for deopt lookups.
    pub callee_regs: Vec<(u64, u64)>,
}

/// Top-level container for one AOT or stub image.
///
/// Built incrementally during compilation: one [`ModuleSectionDes`] per
/// compiled module, entries appended in ascending `code_addr` order within
/// each module. Executable memory is released explicitly via
/// [`destroy`](AotFileInfo::destroy), never implicitly.
#[derive(Default)]
pub struct AotFileInfo {
    entries: Vec<FuncEntryDes>,
    modules: Vec<ModuleSectionDes>,
    /// Raw machine code per module, parallel to `modules`.
    code_images: Vec<Vec<u8>>,
    merged_stackmap: Option<Arc<[u8]>>,
    total_code_size: u64,
    exec_mem: Vec<ExecMemory>,
    destroyed: bool,
}

impl AotFileInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct one zero-initialized entry, populate it, and append it.
    ///
    /// Panics if more callee-saved registers are supplied than the record
    /// can hold; that is a codegen-backend bug, not a recoverable state.
    #[allow(clippy::too_many_arguments)]
    pub fn add_entry(
        &mut self,
        kind: TargetKind,
        is_main_func: bool,
        is_fast_call: bool,
        index_in_kind: u32,
        code_addr: u64,
        abc_index: u32,
        module_index: u32,
        fp_delta: i32,
        func_size: u32,
        callee_regs: &[(u64, u64)],
    ) {
        assert!(
            callee_regs.len() <= MAX_CALLEE_SAVE_REGISTER_NUM,
            "callee-saved register list overflows entry record"
        );
        // Start from the zeroed record so padding slots stay zero in the
        // persisted image.
        let mut entry = FuncEntryDes::default();
        entry.target_kind = kind;
        entry.is_main_func = is_main_func;
        entry.is_fast_call = is_fast_call;
        entry.index_or_method_id = index_in_kind;
        entry.code_addr = code_addr;
        entry.abc_index = abc_index;
        entry.module_index = module_index;
        entry.fp_delta = fp_delta;
        entry.func_size = func_size;
        entry.callee_register_num = callee_regs.len() as u32;
        entry.callee_reg_info[..callee_regs.len()].copy_from_slice(callee_regs);
        self.entries.push(entry);
    }

    /// Append a prebuilt entry. Used by the generator's merge pass, which
    /// constructs entries on worker threads.
    pub fn push_entry(&mut self, entry: FuncEntryDes) {
        assert!(
            entry.callee_register_num as usize <= MAX_CALLEE_SAVE_REGISTER_NUM,
            "callee-saved register count overflows entry record"
        );
        self.entries.push(entry);
    }

    /// Append one module's section table and its machine code.
    pub fn add_module(&mut self, des: ModuleSectionDes, code: Vec<u8>) {
        if let Some((_, size)) = des.text_range() {
            self.total_code_size += size;
        }
        self.modules.push(des);
        self.code_images.push(code);
    }

    pub fn entries(&self) -> &[FuncEntryDes] {
        &self.entries
    }

    pub fn modules(&self) -> &[ModuleSectionDes] {
        &self.modules
    }

    pub fn entry_num(&self) -> usize {
        self.entries.len()
    }

    pub fn module_num(&self) -> usize {
        self.modules.len()
    }

    pub fn total_code_size(&self) -> u64 {
        self.total_code_size
    }

    pub fn code_image(&self, module_index: usize) -> &[u8] {
        &self.code_images[module_index]
    }

    pub fn merged_stackmap(&self) -> Option<&Arc<[u8]>> {
        self.merged_stackmap.as_ref()
    }

    pub fn set_merged_stackmap(&mut self, merged: Arc<[u8]>) {
        self.merged_stackmap = Some(merged);
    }

    pub fn module_mut(&mut self, index: usize) -> &mut ModuleSectionDes {
        &mut self.modules[index]
    }

    /// The sole query surface for the runtime's unwinder and deoptimizer.
    ///
    /// Finds the module whose TEXT range contains `ret_addr`. Returns
    /// `None` when no module matches: the caller must treat the frame as
    /// not AOT-compiled. A zeroed default is never returned for an
    /// unresolved address.
    ///
    /// For stub and deopt lookups the function entry is resolved by
    /// binary search over the module's entry sub-range, using
    /// `ret_addr - 1` so the lookup lands on the call site rather than
    /// the instruction after it. The sub-range must be sorted ascending
    /// by `code_addr`; that invariant is established at module-build time.
    pub fn cal_call_site_info(
        &self,
        ret_addr: u64,
        is_in_stub: bool,
        is_deopt: bool,
    ) -> Option<CallSiteInfo> {
        let module = self.modules.iter().find(|m| m.contains_text(ret_addr))?;
        let (text_start, _) = module.text_range()?;
        let stackmap = module.stackmap().cloned();

        if !is_in_stub && !is_deopt {
            // Caller only needed the module identity.
            return Some(CallSiteInfo {
                text_start,
                stackmap,
                fp_delta: 0,
                callee_regs: Vec::new(),
            });
        }

        let start = module.start_index() as usize;
        let count = module.func_count() as usize;
        assert!(
            start + count <= self.entries.len(),
            "module entry range exceeds entry table"
        );
        let sub = &self.entries[start..start + count];

        // The return address points after the call instruction; resolve
        // the call site itself.
        let target = ret_addr - 1;
        let upper = sub.partition_point(|e| e.code_addr <= target);
        assert!(upper > 0, "return address precedes all function entries");
        let entry = &sub[upper - 1];
        assert!(
            entry.contains(target),
            "call-site lookup resolved outside the entry's code range"
        );

        let callee_regs = if is_deopt {
            entry.callee_regs().to_vec()
        } else {
            Vec::new()
        };

        Some(CallSiteInfo {
            text_start,
            stackmap,
            fp_delta: entry.fp_delta,
            callee_regs,
        })
    }

    /// Copy every module's code image into fresh executable memory and
    /// seal it.
    pub fn place_in_memory(&mut self) -> Result<(), AotFileError> {
        for code in &self.code_images {
            if code.is_empty() {
                continue;
            }
            let mut mem = ExecMemory::new(code.len()).map_err(AotFileError::Memory)?;
            mem.write(0, code).map_err(AotFileError::Memory)?;
            mem.seal().map_err(AotFileError::Memory)?;
            self.exec_mem.push(mem);
        }
        Ok(())
    }

    /// The executable blocks created by
    /// [`place_in_memory`](AotFileInfo::place_in_memory). Empty once
    /// destroyed.
    pub fn exec_memories(&self) -> &[ExecMemory] {
        &self.exec_mem
    }

    /// Release executable memory. Idempotent: a second call is a no-op.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        for mem in &mut self.exec_mem {
            mem.destroy();
        }
        self.exec_mem.clear();
        self.destroyed = true;
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Serialize the whole index to one image.
    ///
    /// If the merge pass has not run, per-module private blobs are laid
    /// out into a merged section here, with the same alignment rules the
    /// generator's merge uses.
    pub fn serialize(&self) -> Vec<u8> {
        // (merged section bytes, per-module (offset, len) windows)
        let mut merged: Vec<u8> = Vec::new();
        let mut windows: Vec<(u64, u64)> = Vec::with_capacity(self.modules.len());
        match &self.merged_stackmap {
            Some(section) => {
                merged.extend_from_slice(section);
                for module in &self.modules {
                    windows.push(match module.stackmap() {
                        Some(sm) => (sm.offset() as u64, sm.len() as u64),
                        None => (0, 0),
                    });
                }
            }
            None => {
                for module in &self.modules {
                    match module.stackmap() {
                        Some(sm) => {
                            let offset = align_up(merged.len() as u64, DATA_ALIGN);
                            merged.resize(offset as usize, 0);
                            merged.extend_from_slice(sm.as_bytes());
                            windows.push((offset, sm.len() as u64));
                        }
                        None => windows.push((0, 0)),
                    }
                }
            }
        }

        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.modules.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.total_code_size.to_le_bytes());

        for entry in &self.entries {
            entry.encode(&mut out);
        }

        for ((module, code), window) in self.modules.iter().zip(&self.code_images).zip(&windows) {
            out.extend_from_slice(&module.start_index().to_le_bytes());
            out.extend_from_slice(&module.func_count().to_le_bytes());

            let mut sections: Vec<(SectionKind, u64, u64)> = module.sections().collect();
            sections.sort_by_key(|(k, _, _)| k.to_u32());
            out.extend_from_slice(&(sections.len() as u32).to_le_bytes());
            for (kind, addr, size) in sections {
                out.extend_from_slice(&kind.to_u32().to_le_bytes());
                out.extend_from_slice(&addr.to_le_bytes());
                out.extend_from_slice(&size.to_le_bytes());
            }

            out.extend_from_slice(&window.0.to_le_bytes());
            out.extend_from_slice(&window.1.to_le_bytes());

            out.extend_from_slice(&(code.len() as u64).to_le_bytes());
            // Module images land on page boundaries so a loader can map
            // them directly.
            let padded = align_up(out.len() as u64, PAGE_ALIGN) as usize;
            out.resize(padded, 0);
            out.extend_from_slice(code);
        }

        out.extend_from_slice(&(merged.len() as u64).to_le_bytes());
        let padded = align_up(out.len() as u64, DATA_ALIGN) as usize;
        out.resize(padded, 0);
        out.extend_from_slice(&merged);
        out
    }

    pub fn save(&self, path: &Path) -> Result<(), AotFileError> {
        fs::write(path, self.serialize()).map_err(|e| AotFileError::Io(e.to_string()))
    }

    /// Deserialize an image produced by [`serialize`](AotFileInfo::serialize).
    pub fn deserialize(bytes: &[u8]) -> Result<Self, AotFileError> {
        let mut reader = Reader { bytes, pos: 0 };
        if reader.u32()? != MAGIC {
            return Err(AotFileError::BadMagic);
        }
        let version = reader.u32()?;
        if version != VERSION {
            return Err(AotFileError::BadVersion(version));
        }
        let entry_num = reader.u32()? as usize;
        let module_num = reader.u32()? as usize;
        let total_code_size = reader.u64()?;

        let mut entries = Vec::with_capacity(entry_num);
        for _ in 0..entry_num {
            let raw = reader.slice(ENTRY_SIZE)?;
            entries.push(FuncEntryDes::decode(raw).ok_or(AotFileError::Corrupt("entry"))?);
        }

        struct RawModule {
            des: ModuleSectionDes,
            sm_offset: u64,
            sm_len: u64,
            code: Vec<u8>,
        }

        let mut raw_modules = Vec::with_capacity(module_num);
        for _ in 0..module_num {
            let start_index = reader.u32()?;
            let func_count = reader.u32()?;
            let mut des = ModuleSectionDes::new();
            des.set_entry_range(start_index, func_count);

            let section_count = reader.u32()? as usize;
            for _ in 0..section_count {
                let kind = SectionKind::from_u32(reader.u32()?)
                    .ok_or(AotFileError::Corrupt("section kind"))?;
                let addr = reader.u64()?;
                let size = reader.u64()?;
                des.set_section(kind, addr, size);
            }

            let sm_offset = reader.u64()?;
            let sm_len = reader.u64()?;
            let code_len = reader.u64()? as usize;
            reader.align(PAGE_ALIGN)?;
            let code = reader.slice(code_len)?.to_vec();
            raw_modules.push(RawModule {
                des,
                sm_offset,
                sm_len,
                code,
            });
        }

        let merged_len = reader.u64()? as usize;
        reader.align(DATA_ALIGN)?;
        let merged: Arc<[u8]> = Arc::from(reader.slice(merged_len)?.to_vec().into_boxed_slice());

        let mut info = AotFileInfo::new();
        info.entries = entries;
        for raw in raw_modules {
            let mut des = raw.des;
            if raw.sm_len > 0 {
                if raw.sm_offset + raw.sm_len > merged.len() as u64 {
                    return Err(AotFileError::Corrupt("stack-map window"));
                }
                des.set_stackmap(StackMapSlice::window(
                    merged.clone(),
                    raw.sm_offset as usize,
                    raw.sm_len as usize,
                ));
            }
            info.modules.push(des);
            info.code_images.push(raw.code);
        }
        if merged_len > 0 {
            info.merged_stackmap = Some(merged);
        }
        info.total_code_size = total_code_size;
        Ok(info)
    }

    pub fn load(path: &Path) -> Result<Self, AotFileError> {
        let bytes = fs::read(path).map_err(|e| AotFileError::Io(e.to_string()))?;
        Self::deserialize(&bytes)
    }
}

impl Drop for AotFileInfo {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn slice(&mut self, n: usize) -> Result<&'a [u8], AotFileError> {
        if self.pos + n > self.bytes.len() {
            return Err(AotFileError::Corrupt("truncated image"));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, AotFileError> {
        Ok(u32::from_le_bytes(self.slice(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, AotFileError> {
        Ok(u64::from_le_bytes(self.slice(8)?.try_into().unwrap()))
    }

    fn align(&mut self, align: u64) -> Result<(), AotFileError> {
        let aligned = align_up(self.pos as u64, align) as usize;
        if aligned > self.bytes.len() {
            return Err(AotFileError::Corrupt("truncated padding"));
        }
        self.pos = aligned;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two modules: A spans [0x1000, 0x1100) with functions at 0x1000 and
    /// 0x1080; B spans [0x2000, 0x2050) with one function.
    fn two_module_info() -> AotFileInfo {
        let mut info = AotFileInfo::new();

        info.add_entry(
            TargetKind::JsFunction,
            true,
            false,
            0,
            0x1000,
            0,
            0,
            -8,
            0x80,
            &[],
        );
        info.add_entry(
            TargetKind::JsFunction,
            false,
            false,
            1,
            0x1080,
            0,
            0,
            -16,
            0x80,
            &[(19, 8), (20, 16)],
        );
        info.add_entry(
            TargetKind::JsFunction,
            false,
            true,
            2,
            0x2000,
            1,
            1,
            -8,
            0x50,
            &[],
        );

        let mut a = ModuleSectionDes::new();
        a.set_section(SectionKind::Text, 0x1000, 0x100);
        a.set_entry_range(0, 2);
        let blob_a: Arc<[u8]> = Arc::from(vec![0xAAu8; 16].into_boxed_slice());
        a.set_stackmap(StackMapSlice::whole(blob_a));
        info.add_module(a, vec![0x90; 0x100]);

        let mut b = ModuleSectionDes::new();
        b.set_section(SectionKind::Text, 0x2000, 0x50);
        b.set_entry_range(2, 1);
        let blob_b: Arc<[u8]> = Arc::from(vec![0xBBu8; 8].into_boxed_slice());
        b.set_stackmap(StackMapSlice::whole(blob_b));
        info.add_module(b, vec![0x90; 0x50]);

        info
    }

    #[test]
    fn test_module_identity_lookup() {
        let info = two_module_info();
        let result = info.cal_call_site_info(0x1090, false, false).unwrap();
        assert_eq!(result.text_start, 0x1000);
        assert_eq!(result.fp_delta, 0);
        assert!(result.callee_regs.is_empty());
        assert_eq!(result.stackmap.unwrap().as_bytes(), &[0xAA; 16]);
    }

    #[test]
    fn test_deopt_lookup_returns_callee_regs() {
        let info = two_module_info();
        let result = info.cal_call_site_info(0x1090, false, true).unwrap();
        assert_eq!(result.text_start, 0x1000);
        assert_eq!(result.fp_delta, -16);
        assert_eq!(result.callee_regs, vec![(19, 8), (20, 16)]);
    }

    #[test]
    fn test_stub_lookup_resolves_function() {
        let info = two_module_info();
        let result = info.cal_call_site_info(0x1040, true, false).unwrap();
        assert_eq!(result.fp_delta, -8);
        assert!(result.callee_regs.is_empty());
    }

    #[test]
    fn test_return_address_at_boundary_resolves_caller() {
        // ret_addr 0x1080 means the call instruction is the last byte of
        // the first function; the -1 adjustment must land there.
        let info = two_module_info();
        let result = info.cal_call_site_info(0x1080, true, false).unwrap();
        assert_eq!(result.fp_delta, -8);
    }

    #[test]
    fn test_unmapped_address_is_none() {
        let info = two_module_info();
        assert!(info.cal_call_site_info(0x3000, false, false).is_none());
        assert!(info.cal_call_site_info(0x3000, true, true).is_none());
        assert!(info.cal_call_site_info(0xFFF, false, false).is_none());
        assert!(info.cal_call_site_info(0x1100, false, false).is_none());
    }

    #[test]
    fn test_second_module_lookup() {
        let info = two_module_info();
        let result = info.cal_call_site_info(0x2010, false, true).unwrap();
        assert_eq!(result.text_start, 0x2000);
        assert_eq!(result.fp_delta, -8);
    }

    #[test]
    #[should_panic(expected = "callee-saved register list overflows")]
    fn test_oversized_callee_list_is_fatal() {
        let mut info = AotFileInfo::new();
        let regs = [(0u64, 0u64); MAX_CALLEE_SAVE_REGISTER_NUM + 1];
        info.add_entry(
            TargetKind::CommonStub,
            false,
            false,
            0,
            0,
            0,
            0,
            0,
            16,
            &regs,
        );
    }

    #[test]
    fn test_serialize_round_trip() {
        let info = two_module_info();
        let bytes = info.serialize();
        let loaded = AotFileInfo::deserialize(&bytes).unwrap();

        assert_eq!(loaded.entry_num(), 3);
        assert_eq!(loaded.module_num(), 2);
        assert_eq!(loaded.entries(), info.entries());
        assert_eq!(loaded.total_code_size(), 0x150);
        assert_eq!(loaded.code_image(0).len(), 0x100);

        // Lookups behave identically on the loaded copy, including the
        // stack-map blobs (now windows into the merged section).
        let result = loaded.cal_call_site_info(0x1090, false, true).unwrap();
        assert_eq!(result.callee_regs, vec![(19, 8), (20, 16)]);
        assert_eq!(result.stackmap.unwrap().as_bytes(), &[0xAA; 16]);
        let b = loaded.cal_call_site_info(0x2010, false, false).unwrap();
        assert_eq!(b.stackmap.unwrap().as_bytes(), &[0xBB; 8]);
    }

    #[test]
    fn test_deserialize_rejects_garbage() {
        assert!(matches!(
            AotFileInfo::deserialize(&[0u8; 4]),
            Err(AotFileError::Corrupt(_))
        ));
        assert!(matches!(
            AotFileInfo::deserialize(&[0xFFu8; 64]),
            Err(AotFileError::BadMagic)
        ));
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let mut info = two_module_info();
        info.destroy();
        assert!(info.is_destroyed());
        info.destroy();
        assert!(info.is_destroyed());
    }

    #[test]
    fn test_place_in_memory_seals_and_releases_once() {
        let mut info = two_module_info();
        info.place_in_memory().unwrap();
        assert_eq!(info.exec_memories().len(), 2);
        assert!(info.exec_memories().iter().all(|m| m.is_sealed()));

        info.destroy();
        assert!(info.is_destroyed());
        assert!(info.exec_memories().is_empty());
        // A second destroy after the blocks are gone must be a no-op.
        info.destroy();
        assert!(info.is_destroyed());
    }

    #[test]
    fn test_module_images_are_page_aligned() {
        let mut info = AotFileInfo::new();
        info.add_entry(
            TargetKind::JsFunction,
            false,
            false,
            0,
            0x1000,
            0,
            0,
            -8,
            0x100,
            &[],
        );
        info.add_entry(
            TargetKind::JsFunction,
            false,
            false,
            1,
            0x2000,
            0,
            1,
            -8,
            0x50,
            &[],
        );

        let mut a = ModuleSectionDes::new();
        a.set_section(SectionKind::Text, 0x1000, 0x100);
        a.set_entry_range(0, 1);
        info.add_module(a, vec![0xC3; 0x100]);

        let mut b = ModuleSectionDes::new();
        b.set_section(SectionKind::Text, 0x2000, 0x50);
        b.set_entry_range(1, 1);
        info.add_module(b, vec![0xCC; 0x50]);

        let bytes = info.serialize();

        // Each module's code image starts on a page boundary. The fill
        // bytes do not occur in runs anywhere else in the image.
        let first = bytes
            .windows(16)
            .position(|w| w == [0xC3; 16])
            .expect("first module image not found");
        assert_eq!(first % PAGE_ALIGN as usize, 0);
        let second = bytes
            .windows(16)
            .position(|w| w == [0xCC; 16])
            .expect("second module image not found");
        assert_eq!(second % PAGE_ALIGN as usize, 0);
        assert!(second > first);

        let loaded = AotFileInfo::deserialize(&bytes).unwrap();
        assert_eq!(loaded.code_image(0), &[0xC3; 0x100][..]);
        assert_eq!(loaded.code_image(1), &[0xCC; 0x50][..]);
    }
}
