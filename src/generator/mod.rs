//! File/module generation orchestration.
//!
//! After code generation fixes every module's in-memory layout, the
//! generator walks each module's function index, computes function sizes,
//! builds the entry table, normalizes stack maps, and merges everything
//! into one [`AotFileInfo`].
//!
//! Concurrency is strictly fan-out/merge: worker threads each index their
//! own modules into private artifacts, the orchestrating thread handles
//! module 0 itself, joins every worker unconditionally, and only then
//! appends results into the shared containers, single-threaded. No locks,
//! no atomics, no cancellation.

use std::path::Path;
use std::sync::Arc;
use std::thread;

use crate::aot::{
    AotFileError, AotFileInfo, DATA_ALIGN, FuncEntryDes, INVALID_INDEX, ModuleSectionDes,
    SectionKind, align_up,
};
use crate::config::AotConfig;
use crate::signature::{CallSignature, StubRegistry, TargetKind};
use crate::stackmap::{ArkStackMapBuilder, BackendStackMap};

/// What the codegen backend reports for one compiled function.
#[derive(Debug, Clone)]
pub struct CompiledFunc {
    pub name: String,
    /// Absolute start address within the module's laid-out image.
    pub code_addr: u64,
    pub fp_delta: i32,
    pub callee_regs: Vec<(u64, u64)>,
    pub is_main_func: bool,
    pub is_fast_call: bool,
    pub method_id: u32,
    pub abc_index: u32,
    pub kind: TargetKind,
}

impl CompiledFunc {
    /// A stub function entry derived from its call signature.
    pub fn for_stub(sig: &CallSignature, code_addr: u64, fp_delta: i32) -> Self {
        Self {
            name: sig.name().to_string(),
            code_addr,
            fp_delta,
            callee_regs: Vec::new(),
            is_main_func: false,
            is_fast_call: false,
            method_id: sig.id(),
            abc_index: INVALID_INDEX,
            kind: sig.target_kind(),
        }
    }
}

/// One module's codegen output, handed over once its layout is final.
///
/// Functions must be listed in compilation order with monotonically
/// non-decreasing addresses and contiguous layout; function sizes are
/// derived from the gap to the next function (the last function extends
/// to the end of the TEXT section).
#[derive(Debug, Clone)]
pub struct CompiledModule {
    pub module_index: u32,
    pub text_addr: u64,
    pub text_size: u64,
    pub funcs: Vec<CompiledFunc>,
    pub stackmap: BackendStackMap,
    pub code: Vec<u8>,
}

/// Private per-module output of one indexing pass.
struct ModuleArtifact {
    module_index: u32,
    text_addr: u64,
    text_size: u64,
    entries: Vec<FuncEntryDes>,
    stackmap_blob: Vec<u8>,
    code: Vec<u8>,
}

/// Walk one module's function index and build its entries and stack-map
/// blob. Runs on worker threads; touches nothing shared.
fn index_module(module: CompiledModule, builder: ArkStackMapBuilder) -> ModuleArtifact {
    let text_end = module.text_addr + module.text_size;
    let mut entries = Vec::with_capacity(module.funcs.len());

    for (i, func) in module.funcs.iter().enumerate() {
        assert!(
            func.code_addr >= module.text_addr && func.code_addr < text_end,
            "function {} outside module text section",
            func.name
        );
        // Size is the gap to the next function; contiguous layout is an
        // invariant of the backend contract, checked here so a violation
        // fails at link time instead of producing wrong sizes.
        let next_start = match module.funcs.get(i + 1) {
            Some(next) => {
                assert!(
                    next.code_addr >= func.code_addr,
                    "function index not in ascending address order"
                );
                next.code_addr
            }
            None => text_end,
        };
        let func_size = (next_start - func.code_addr) as u32;

        let mut entry = FuncEntryDes::default();
        entry.target_kind = func.kind;
        entry.is_main_func = func.is_main_func;
        entry.is_fast_call = func.is_fast_call;
        entry.index_or_method_id = func.method_id;
        entry.code_addr = func.code_addr;
        entry.abc_index = func.abc_index;
        entry.module_index = module.module_index;
        entry.fp_delta = func.fp_delta;
        entry.func_size = func_size;
        entry.callee_register_num = func.callee_regs.len() as u32;
        entry.callee_reg_info[..func.callee_regs.len()].copy_from_slice(&func.callee_regs);
        entries.push(entry);
    }

    let normalized = builder.normalize(&module.stackmap, module.text_addr);
    let stackmap_blob = builder.emit(&normalized);

    ModuleArtifact {
        module_index: module.module_index,
        text_addr: module.text_addr,
        text_size: module.text_size,
        entries,
        stackmap_blob,
        code: module.code,
    }
}

/// Drives many modules' metadata into one AOT image.
pub struct AotFileGenerator {
    config: AotConfig,
    builder: ArkStackMapBuilder,
    info: AotFileInfo,
}

impl AotFileGenerator {
    pub fn new(config: AotConfig) -> Self {
        let builder = ArkStackMapBuilder::new(config.triple);
        Self {
            config,
            builder,
            info: AotFileInfo::new(),
        }
    }

    /// Index every module and merge the results.
    ///
    /// Module 0 is processed on the calling thread; the rest are fanned
    /// out over at most `max_workers` workers. Joins are unconditional.
    pub fn run(&mut self, mut modules: Vec<CompiledModule>) {
        if modules.is_empty() {
            return;
        }
        modules.sort_by_key(|m| m.module_index);

        let builder = self.builder;
        let trace = self.config.trace_link;
        let first = modules.remove(0);
        let rest = modules;

        let mut artifacts: Vec<ModuleArtifact> = if rest.is_empty() {
            vec![index_module(first, builder)]
        } else {
            let worker_count = rest.len().min(self.config.max_workers.max(1));
            // Round-robin the remaining modules across workers; each
            // worker owns its chunk outright.
            let mut chunks: Vec<Vec<CompiledModule>> = (0..worker_count).map(|_| Vec::new()).collect();
            for (i, module) in rest.into_iter().enumerate() {
                chunks[i % worker_count].push(module);
            }

            thread::scope(|scope| {
                let handles: Vec<_> = chunks
                    .into_iter()
                    .map(|chunk| {
                        scope.spawn(move || {
                            chunk
                                .into_iter()
                                .map(|m| index_module(m, builder))
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect();

                // The orchestrator indexes module 0 while workers run.
                let mut collected = vec![index_module(first, builder)];
                for handle in handles {
                    let worker_output = handle.join().expect("module indexing worker panicked");
                    collected.extend(worker_output);
                }
                collected
            })
        };

        artifacts.sort_by_key(|a| a.module_index);
        self.merge(artifacts, trace);
    }

    /// Sequential merge: append entries, lay out the merged stack-map
    /// section, and rewrite each module's descriptor to point into it.
    fn merge(&mut self, artifacts: Vec<ModuleArtifact>, trace: bool) {
        let mut merged: Vec<u8> = Vec::new();
        let mut windows: Vec<(usize, usize)> = Vec::with_capacity(artifacts.len());
        for artifact in &artifacts {
            let offset = align_up(merged.len() as u64, DATA_ALIGN) as usize;
            merged.resize(offset, 0);
            merged.extend_from_slice(&artifact.stackmap_blob);
            windows.push((offset, artifact.stackmap_blob.len()));
        }
        let merged: Arc<[u8]> = Arc::from(merged.into_boxed_slice());

        for (artifact, (sm_offset, sm_len)) in artifacts.into_iter().zip(windows) {
            let start_index = self.info.entry_num() as u32;
            let func_count = artifact.entries.len() as u32;
            if trace {
                eprintln!(
                    "[link] module {}: {} functions, text {:#x}..{:#x}, stackmap {} bytes",
                    artifact.module_index,
                    func_count,
                    artifact.text_addr,
                    artifact.text_addr + artifact.text_size,
                    sm_len
                );
            }
            for entry in artifact.entries {
                self.info.push_entry(entry);
            }

            let mut des = ModuleSectionDes::new();
            des.set_section(SectionKind::Text, artifact.text_addr, artifact.text_size);
            des.set_entry_range(start_index, func_count);
            des.rewrite_stackmap(merged.clone(), sm_offset, sm_len);
            self.info.add_module(des, artifact.code);
        }
        self.info.set_merged_stackmap(merged);
    }

    pub fn file_info(&self) -> &AotFileInfo {
        &self.info
    }

    /// Write the finished image.
    pub fn save_aot_file(&self, path: &Path) -> Result<(), AotFileError> {
        self.info.save(path)
    }

    /// Write the finished image to the path configured in the options
    /// file. Errors when no output path was configured.
    pub fn save(&self) -> Result<(), AotFileError> {
        match &self.config.out {
            Some(path) => self.info.save(path),
            None => Err(AotFileError::Io("no output path configured".to_string())),
        }
    }

    /// Hand the index over to its final owner.
    pub fn finish(self) -> AotFileInfo {
        self.info
    }
}

/// Generates stub images: the same pipeline as [`AotFileGenerator`], with
/// entries derived from the signature registry.
pub struct StubFileGenerator {
    inner: AotFileGenerator,
}

impl StubFileGenerator {
    pub fn new(config: AotConfig) -> Self {
        Self {
            inner: AotFileGenerator::new(config),
        }
    }

    /// Index stub modules. Every function must correspond to a
    /// registered signature: its method id resolves into the registry
    /// table for its kind and the names must agree. Entries keep the
    /// signature's id and target kind so the loader can map them back.
    pub fn run(&mut self, modules: Vec<CompiledModule>, registry: &StubRegistry) {
        for module in &modules {
            for func in &module.funcs {
                assert!(
                    func.kind.is_stub(),
                    "non-stub function {} in a stub image",
                    func.name
                );
                let sig = match func.kind {
                    TargetKind::BytecodeHandler => {
                        registry.bytecode_handler(func.method_id as usize)
                    }
                    TargetKind::BaselineStub => registry.baseline(func.method_id as usize),
                    _ => registry.common(func.method_id as usize),
                };
                assert_eq!(
                    sig.name(),
                    func.name,
                    "stub {} does not match the registered signature for id {}",
                    func.name,
                    func.method_id
                );
            }
        }
        self.inner.run(modules);
    }

    pub fn file_info(&self) -> &AotFileInfo {
        self.inner.file_info()
    }

    pub fn save_stub_file(&self, path: &Path) -> Result<(), AotFileError> {
        self.inner.save_aot_file(path)
    }

    /// Write to the configured output path.
    pub fn save(&self) -> Result<(), AotFileError> {
        self.inner.save()
    }

    pub fn finish(self) -> AotFileInfo {
        self.inner.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stackmap::{
        CallsiteEntry, LocationTy, StackMapInfo, TargetTriple, encode_litecg,
    };

    fn empty_litecg() -> BackendStackMap {
        BackendStackMap::LiteCg(encode_litecg(&StackMapInfo::new()))
    }

    fn js_func(name: &str, addr: u64, fp_delta: i32, main: bool) -> CompiledFunc {
        CompiledFunc {
            name: name.to_string(),
            code_addr: addr,
            fp_delta,
            callee_regs: Vec::new(),
            is_main_func: main,
            is_fast_call: false,
            method_id: 0,
            abc_index: 0,
            kind: TargetKind::JsFunction,
        }
    }

    fn two_modules() -> Vec<CompiledModule> {
        let mut f2 = js_func("bar", 0x1080, -16, false);
        f2.callee_regs = vec![(19, 8), (20, 16)];
        vec![
            CompiledModule {
                module_index: 0,
                text_addr: 0x1000,
                text_size: 0x100,
                funcs: vec![js_func("foo", 0x1000, -8, true), f2],
                stackmap: BackendStackMap::LiteCg(encode_litecg(&StackMapInfo {
                    callsites: vec![CallsiteEntry {
                        pc: 0x14,
                        locations: vec![LocationTy::FrameSlot(-16)],
                    }],
                    deopts: vec![],
                })),
                code: vec![0x90; 0x100],
            },
            CompiledModule {
                module_index: 1,
                text_addr: 0x2000,
                text_size: 0x50,
                funcs: vec![js_func("baz", 0x2000, -8, false)],
                stackmap: empty_litecg(),
                code: vec![0x90; 0x50],
            },
        ]
    }

    #[test]
    fn test_function_sizes_from_gaps() {
        let mut generator = AotFileGenerator::new(AotConfig::default());
        generator.run(two_modules());
        let info = generator.file_info();

        assert_eq!(info.entry_num(), 3);
        assert_eq!(info.entries()[0].func_size, 0x80);
        assert_eq!(info.entries()[1].func_size, 0x80);
        // Last function of module 1 extends to the text end.
        assert_eq!(info.entries()[2].func_size, 0x50);
    }

    #[test]
    fn test_entry_ranges_per_module() {
        let mut generator = AotFileGenerator::new(AotConfig::default());
        generator.run(two_modules());
        let info = generator.file_info();

        assert_eq!(info.module_num(), 2);
        assert_eq!(info.modules()[0].start_index(), 0);
        assert_eq!(info.modules()[0].func_count(), 2);
        assert_eq!(info.modules()[1].start_index(), 2);
        assert_eq!(info.modules()[1].func_count(), 1);
        assert_eq!(info.total_code_size(), 0x150);
    }

    #[test]
    fn test_merged_stackmap_section() {
        let mut generator = AotFileGenerator::new(AotConfig::default());
        generator.run(two_modules());
        let info = generator.file_info();

        let merged = info.merged_stackmap().unwrap();
        let sm0 = info.modules()[0].stackmap().unwrap();
        let sm1 = info.modules()[1].stackmap().unwrap();
        // Module 1's window starts 8-aligned after module 0's blob.
        assert_eq!(sm0.offset(), 0);
        assert_eq!(sm1.offset() % 8, 0);
        assert!(sm1.offset() >= sm0.len());
        assert!(merged.len() >= sm1.offset() + sm1.len());
    }

    #[test]
    fn test_lookup_after_generation() {
        let mut generator = AotFileGenerator::new(AotConfig::default());
        generator.run(two_modules());
        let info = generator.finish();

        let plain = info.cal_call_site_info(0x1090, false, false).unwrap();
        assert_eq!(plain.text_start, 0x1000);
        assert_eq!(plain.fp_delta, 0);
        assert!(plain.callee_regs.is_empty());

        let deopt = info.cal_call_site_info(0x1090, false, true).unwrap();
        assert_eq!(deopt.fp_delta, -16);
        assert_eq!(deopt.callee_regs, vec![(19, 8), (20, 16)]);

        assert!(info.cal_call_site_info(0x3000, false, false).is_none());
    }

    #[test]
    fn test_many_modules_with_few_workers() {
        let config = AotConfig {
            max_workers: 2,
            ..Default::default()
        };
        let mut modules = Vec::new();
        for i in 0..6u32 {
            let base = 0x10000 * (i as u64 + 1);
            modules.push(CompiledModule {
                module_index: i,
                text_addr: base,
                text_size: 0x40,
                funcs: vec![js_func(&format!("f{}", i), base, -8, false)],
                stackmap: empty_litecg(),
                code: vec![0x90; 0x40],
            });
        }
        let mut generator = AotFileGenerator::new(config);
        generator.run(modules);
        let info = generator.file_info();

        assert_eq!(info.entry_num(), 6);
        assert_eq!(info.module_num(), 6);
        // Merge preserves module order regardless of worker scheduling.
        for i in 0..6 {
            assert_eq!(info.entries()[i].module_index, i as u32);
        }
    }

    #[test]
    #[should_panic(expected = "ascending address order")]
    fn test_unsorted_functions_are_fatal() {
        let module = CompiledModule {
            module_index: 0,
            text_addr: 0x1000,
            text_size: 0x100,
            funcs: vec![
                js_func("late", 0x1080, -8, false),
                js_func("early", 0x1000, -8, false),
            ],
            stackmap: empty_litecg(),
            code: vec![0x90; 0x100],
        };
        let mut generator = AotFileGenerator::new(AotConfig::default());
        generator.run(vec![module]);
    }

    #[test]
    fn test_stub_file_generator() {
        let registry = StubRegistry::build();
        let mut funcs = Vec::new();
        let mut addr = 0x4000u64;
        for i in 0..4 {
            funcs.push(CompiledFunc::for_stub(registry.common(i), addr, -8));
            addr += 0x40;
        }
        let module = CompiledModule {
            module_index: 0,
            text_addr: 0x4000,
            text_size: 0x100,
            funcs,
            stackmap: empty_litecg(),
            code: vec![0x90; 0x100],
        };

        let mut generator = StubFileGenerator::new(AotConfig {
            triple: TargetTriple::Aarch64,
            ..Default::default()
        });
        generator.run(vec![module], &registry);
        let info = generator.file_info();

        assert_eq!(info.entry_num(), 4);
        assert_eq!(info.entries()[0].target_kind, TargetKind::CommonStub);
        assert_eq!(info.entries()[2].index_or_method_id, 2);
        assert_eq!(info.entries()[0].abc_index, INVALID_INDEX);
    }

    #[test]
    #[should_panic(expected = "does not match the registered signature")]
    fn test_stub_generator_rejects_unregistered_function() {
        let registry = StubRegistry::build();
        let mut func = CompiledFunc::for_stub(registry.common(0), 0x4000, -8);
        func.name = "NotARegisteredStub".to_string();
        let module = CompiledModule {
            module_index: 0,
            text_addr: 0x4000,
            text_size: 0x40,
            funcs: vec![func],
            stackmap: empty_litecg(),
            code: vec![0x90; 0x40],
        };

        let mut generator = StubFileGenerator::new(AotConfig::default());
        generator.run(vec![module], &registry);
    }

    #[test]
    #[should_panic(expected = "non-stub function")]
    fn test_stub_generator_rejects_js_function() {
        let registry = StubRegistry::build();
        let module = CompiledModule {
            module_index: 0,
            text_addr: 0x4000,
            text_size: 0x40,
            funcs: vec![js_func("compiled", 0x4000, -8, false)],
            stackmap: empty_litecg(),
            code: vec![0x90; 0x40],
        };

        let mut generator = StubFileGenerator::new(AotConfig::default());
        generator.run(vec![module], &registry);
    }

    #[test]
    fn test_save_to_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.an");

        let config = AotConfig {
            out: Some(path.clone()),
            ..Default::default()
        };
        let mut generator = AotFileGenerator::new(config);
        generator.run(two_modules());
        generator.save().unwrap();

        let loaded = AotFileInfo::load(&path).unwrap();
        assert_eq!(loaded.entry_num(), 3);
        assert_eq!(loaded.module_num(), 2);
    }

    #[test]
    fn test_save_without_configured_path_errors() {
        let mut generator = AotFileGenerator::new(AotConfig::default());
        generator.run(two_modules());
        assert!(generator.save().is_err());
    }
}
