use std::process::Command;

use caracal::aot::INVALID_INDEX;
use caracal::stackmap::{
    CallsiteEntry, LlvmFunctionMap, LocationTy, StackMapInfo, encode_litecg, encode_llvm,
};
use caracal::{
    AotConfig, AotFileGenerator, AotFileInfo, ArkStackMapBuilder, BackendStackMap, CompiledFunc,
    CompiledModule, StubFileGenerator, StubRegistry, TargetKind, TargetTriple,
};

fn js_func(name: &str, addr: u64, fp_delta: i32) -> CompiledFunc {
    CompiledFunc {
        name: name.to_string(),
        code_addr: addr,
        fp_delta,
        callee_regs: Vec::new(),
        is_main_func: false,
        is_fast_call: false,
        method_id: 0,
        abc_index: 0,
        kind: TargetKind::JsFunction,
    }
}

/// Two modules with different stack-map backends: module 0 carries an
/// LLVM binary stackmap, module 1 a LiteCG stream.
fn build_modules() -> Vec<CompiledModule> {
    let mut main_func = js_func("entry", 0x1000, -8);
    main_func.is_main_func = true;
    let mut helper = js_func("helper", 0x1080, -16);
    helper.callee_regs = vec![(19, 8), (20, 16)];
    helper.method_id = 1;

    let llvm = encode_llvm(
        &[LlvmFunctionMap {
            func_addr: 0x1000,
            stack_size: 64,
            info: StackMapInfo {
                callsites: vec![CallsiteEntry {
                    pc: 0x14,
                    locations: vec![LocationTy::FrameSlot(-24)],
                }],
                deopts: vec![],
            },
        }],
        TargetTriple::Aarch64,
    );

    let litecg = encode_litecg(&StackMapInfo {
        callsites: vec![CallsiteEntry {
            pc: 0x10,
            locations: vec![LocationTy::Register(19)],
        }],
        deopts: vec![],
    });

    vec![
        CompiledModule {
            module_index: 0,
            text_addr: 0x1000,
            text_size: 0x100,
            funcs: vec![main_func, helper],
            stackmap: BackendStackMap::Llvm(llvm),
            code: vec![0x90; 0x100],
        },
        CompiledModule {
            module_index: 1,
            text_addr: 0x2000,
            text_size: 0x50,
            funcs: vec![js_func("other", 0x2000, -8)],
            stackmap: BackendStackMap::LiteCg(litecg),
            code: vec![0x90; 0x50],
        },
    ]
}

fn aarch64_config() -> AotConfig {
    AotConfig {
        triple: TargetTriple::Aarch64,
        ..Default::default()
    }
}

#[test]
fn test_generate_save_load_query() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.an");

    let mut generator = AotFileGenerator::new(aarch64_config());
    generator.run(build_modules());
    generator.save_aot_file(&path).unwrap();

    let info = AotFileInfo::load(&path).unwrap();
    assert_eq!(info.entry_num(), 3);
    assert_eq!(info.module_num(), 2);
    assert_eq!(info.total_code_size(), 0x150);
    assert!(info.entries()[0].is_main_func);

    // Module-identity query.
    let plain = info.cal_call_site_info(0x1090, false, false).unwrap();
    assert_eq!(plain.text_start, 0x1000);
    assert_eq!(plain.fp_delta, 0);
    assert!(plain.callee_regs.is_empty());

    // Deopt query resolves the containing function and its saved regs.
    let deopt = info.cal_call_site_info(0x1090, false, true).unwrap();
    assert_eq!(deopt.fp_delta, -16);
    assert_eq!(deopt.callee_regs, vec![(19, 8), (20, 16)]);

    // A return address exactly at a function boundary belongs to the
    // preceding function.
    let boundary = info.cal_call_site_info(0x1080, true, false).unwrap();
    assert_eq!(boundary.fp_delta, -8);

    assert!(info.cal_call_site_info(0x3000, false, false).is_none());
}

#[test]
fn test_loaded_stackmaps_parse_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.an");

    let mut generator = AotFileGenerator::new(aarch64_config());
    generator.run(build_modules());
    generator.save_aot_file(&path).unwrap();

    let info = AotFileInfo::load(&path).unwrap();

    // Module 0's blob came from an LLVM stackmap; PCs were rebased to
    // the module text start.
    let a = info.cal_call_site_info(0x1010, false, false).unwrap();
    let parsed = ArkStackMapBuilder::parse(a.stackmap.unwrap().as_bytes());
    assert_eq!(parsed.callsites.len(), 1);
    assert_eq!(parsed.callsites[0].pc, 0x14);
    assert_eq!(parsed.callsites[0].locations, vec![LocationTy::FrameSlot(-24)]);

    // Module 1's blob came from a LiteCG stream.
    let b = info.cal_call_site_info(0x2010, false, false).unwrap();
    let parsed = ArkStackMapBuilder::parse(b.stackmap.unwrap().as_bytes());
    assert_eq!(parsed.callsites[0].pc, 0x10);
    assert_eq!(parsed.callsites[0].locations, vec![LocationTy::Register(19)]);
}

#[test]
fn test_stub_image_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stub.an");

    let registry = StubRegistry::build();
    let mut funcs = Vec::new();
    let mut addr = 0x8000u64;
    for i in 0..registry.common_count().min(8) {
        funcs.push(CompiledFunc::for_stub(registry.common(i), addr, -8));
        addr += 0x40;
    }
    let count = funcs.len();
    let module = CompiledModule {
        module_index: 0,
        text_addr: 0x8000,
        text_size: count as u64 * 0x40,
        funcs,
        stackmap: BackendStackMap::LiteCg(encode_litecg(&StackMapInfo::new())),
        code: vec![0x90; count * 0x40],
    };

    let mut generator = StubFileGenerator::new(aarch64_config());
    generator.run(vec![module], &registry);
    generator.save_stub_file(&path).unwrap();

    let info = AotFileInfo::load(&path).unwrap();
    assert_eq!(info.entry_num(), count);
    for (i, entry) in info.entries().iter().enumerate() {
        assert_eq!(entry.target_kind, TargetKind::CommonStub);
        assert_eq!(entry.index_or_method_id, i as u32);
        assert_eq!(entry.abc_index, INVALID_INDEX);
        assert_eq!(entry.func_size, 0x40);
    }

    // Stub lookups resolve through the same query surface.
    let hit = info.cal_call_site_info(0x8050, true, false).unwrap();
    assert_eq!(hit.fp_delta, -8);
}

fn save_image(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("app.an");
    let mut generator = AotFileGenerator::new(aarch64_config());
    generator.run(build_modules());
    generator.save_aot_file(&path).unwrap();
    path
}

#[test]
fn test_cli_inspect() {
    let dir = tempfile::tempdir().unwrap();
    let path = save_image(dir.path());

    let output = Command::new(env!("CARGO_BIN_EXE_caracal"))
        .args(["inspect", path.to_str().unwrap()])
        .output()
        .expect("failed to execute caracal");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("3 entries, 2 modules"));
    assert!(stdout.contains("0x1000"));
}

#[test]
fn test_cli_inspect_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = save_image(dir.path());

    let output = Command::new(env!("CARGO_BIN_EXE_caracal"))
        .args(["inspect", path.to_str().unwrap(), "--json"])
        .output()
        .expect("failed to execute caracal");
    assert!(output.status.success());
    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(doc["entries"].as_array().unwrap().len(), 3);
    assert_eq!(doc["modules"].as_array().unwrap().len(), 2);
    assert_eq!(doc["total_code_size"], 0x150);
}

#[test]
fn test_cli_inspect_rejects_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("junk.an");
    std::fs::write(&path, [0xFFu8; 64]).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_caracal"))
        .args(["inspect", path.to_str().unwrap()])
        .output()
        .expect("failed to execute caracal");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("bad magic"));
}

#[test]
fn test_cli_stubs() {
    let output = Command::new(env!("CARGO_BIN_EXE_caracal"))
        .arg("stubs")
        .output()
        .expect("failed to execute caracal");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("common"));
    assert!(stdout.contains("CallRuntime"));
}
