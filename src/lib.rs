//! Caracal - compiled-code metadata for an AOT JavaScript backend
//!
//! This library provides call signatures for runtime stubs, the function
//! entry and section index of AOT images, stack-map normalization, and
//! the generators that link per-module codegen output into one image.

pub mod aot;
pub mod assembler;
pub mod config;
pub mod generator;
pub mod signature;
pub mod stackmap;

// Re-export commonly used types
pub use aot::{AotFileInfo, CallSiteInfo, FuncEntryDes, ModuleSectionDes};
pub use config::{AotConfig, AotOptions};
pub use generator::{AotFileGenerator, CompiledFunc, CompiledModule, StubFileGenerator};
pub use signature::{CallSignature, StubRegistry, TargetKind};
pub use stackmap::{ArkStackMapBuilder, BackendStackMap, StackMapInfo, TargetTriple};
