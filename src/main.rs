use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use caracal::aot::{AotFileInfo, INVALID_INDEX, SectionKind};
use caracal::signature::StubRegistry;

#[derive(Parser)]
#[command(name = "caracal")]
#[command(about = "Inspect AOT images and runtime-stub signatures", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump the entry table and section layout of an AOT image
    Inspect {
        /// The image file to inspect
        file: PathBuf,

        /// Emit machine-readable JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// List the registered runtime-stub call signatures
    Stubs {
        /// Emit machine-readable JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn inspect(file: &PathBuf, json: bool) -> Result<(), String> {
    let info = AotFileInfo::load(file).map_err(|e| e.to_string())?;

    if json {
        let entries: Vec<_> = info
            .entries()
            .iter()
            .map(|e| {
                serde_json::json!({
                    "kind": format!("{:?}", e.target_kind),
                    "code_addr": e.code_addr,
                    "size": e.func_size,
                    "module": e.module_index,
                    "method_id": e.index_or_method_id,
                    "abc_index": if e.abc_index == INVALID_INDEX {
                        serde_json::Value::Null
                    } else {
                        serde_json::json!(e.abc_index)
                    },
                    "fp_delta": e.fp_delta,
                    "main": e.is_main_func,
                    "fast_call": e.is_fast_call,
                    "callee_regs": e.callee_regs(),
                })
            })
            .collect();
        let modules: Vec<_> = info
            .modules()
            .iter()
            .map(|m| {
                let mut sections: Vec<_> = m.sections().collect();
                sections.sort_by_key(|(k, _, _)| k.to_u32());
                serde_json::json!({
                    "start_index": m.start_index(),
                    "func_count": m.func_count(),
                    "sections": sections
                        .into_iter()
                        .map(|(k, addr, size)| {
                            serde_json::json!({
                                "kind": format!("{:?}", k),
                                "addr": addr,
                                "size": size,
                            })
                        })
                        .collect::<Vec<_>>(),
                    "stackmap_len": m.stackmap().map(|s| s.len()),
                })
            })
            .collect();
        let doc = serde_json::json!({
            "entries": entries,
            "modules": modules,
            "total_code_size": info.total_code_size(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&doc).map_err(|e| e.to_string())?
        );
        return Ok(());
    }

    println!(
        "{} entries, {} modules, {} code bytes",
        info.entry_num(),
        info.module_num(),
        info.total_code_size()
    );
    for (i, module) in info.modules().iter().enumerate() {
        let (text_addr, text_size) = module
            .section(SectionKind::Text)
            .ok_or_else(|| format!("module {} has no text section", i))?;
        println!(
            "module {}: text {:#x}..{:#x}, entries {}..{}",
            i,
            text_addr,
            text_addr + text_size,
            module.start_index(),
            module.start_index() + module.func_count()
        );
        if let Some(sm) = module.stackmap() {
            println!("  stackmap: {} bytes at offset {}", sm.len(), sm.offset());
        }
    }
    for entry in info.entries() {
        println!(
            "  {:#010x} size {:>6} module {} {:?} method {}{}{}",
            entry.code_addr,
            entry.func_size,
            entry.module_index,
            entry.target_kind,
            entry.index_or_method_id,
            if entry.is_main_func { " [main]" } else { "" },
            if entry.is_fast_call { " [fast]" } else { "" },
        );
    }
    Ok(())
}

fn list_stubs(json: bool) -> Result<(), String> {
    let registry = StubRegistry::build();
    let groups = [
        (
            "common",
            (0..registry.common_count())
                .map(|i| registry.common(i))
                .collect::<Vec<_>>(),
        ),
        (
            "bytecode",
            (0..registry.bytecode_count())
                .map(|i| registry.bytecode_handler(i))
                .collect::<Vec<_>>(),
        ),
        (
            "baseline",
            (0..registry.baseline_count())
                .map(|i| registry.baseline(i))
                .collect::<Vec<_>>(),
        ),
    ];

    if json {
        let mut doc = serde_json::Map::new();
        for (group, sigs) in &groups {
            let list: Vec<_> = sigs
                .iter()
                .map(|sig| {
                    serde_json::json!({
                        "id": sig.id(),
                        "name": sig.name(),
                        "params": sig.params().len(),
                        "call_conv": format!("{:?}", sig.call_conv()),
                        "variadic": sig.is_variadic(),
                    })
                })
                .collect();
            doc.insert(group.to_string(), serde_json::Value::Array(list));
        }
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::Value::Object(doc))
                .map_err(|e| e.to_string())?
        );
        return Ok(());
    }

    for (group, sigs) in &groups {
        println!("{} ({}):", group, sigs.len());
        for sig in sigs {
            println!(
                "  {:>4} {} ({} params, {:?}{})",
                sig.id(),
                sig.name(),
                sig.params().len(),
                sig.call_conv(),
                if sig.is_variadic() { ", variadic" } else { "" },
            );
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Inspect { file, json } => inspect(&file, json),
        Commands::Stubs { json } => list_stubs(json),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}
