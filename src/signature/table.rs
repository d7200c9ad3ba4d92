//! Stub descriptor tables and the signature registry.
//!
//! Every compiled stub the runtime knows about is listed here once, as a
//! `(name, shape, builder)` descriptor. The dense index space and the
//! constructed [`CallSignature`]s are both derived from these tables, so
//! adding a stub is a one-line change.

use super::{
    ArgumentsOrder, CallConv, CallSignature, StubBuilderKind, TargetKind, VariableType,
};

/// Signature template shared by a family of stubs.
///
/// Shapes mirror the handful of parameter layouts the runtime actually
/// uses; the first parameter is always the native "glue" pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigShape {
    /// (glue, lhs, rhs, global-env) -> any
    BinaryWithGlobalEnv,
    /// (glue, operand) -> any
    Unary,
    /// (glue, operand, global-env) -> any
    UnaryWithGlobalEnv,
    /// (glue, receiver, key, global-env) -> any
    LoadByName,
    /// (glue, receiver, key, value, global-env) -> any
    StoreByName,
    /// (glue, receiver, index:i32, global-env) -> any
    LoadByIndex,
    /// (glue, receiver, index:i32, value, global-env) -> any
    StoreByIndex,
    /// (glue, receiver, key, value) -> any, for inline-cache stubs
    IcAccess,
    /// (glue, object, offset:ptr, value) -> void, GC-leaf write barrier
    Barrier,
    /// (glue, hclass) -> any, heap allocation
    Allocate,
    /// (glue, runtime-id:i64, argc:i64, ...) -> any, variadic trampoline
    RuntimeTrampoline,
    /// The 7-argument GHC-convention bytecode handler layout:
    /// (glue, sp, pc, constpool, profile, acc, hotness) -> void
    BytecodeHandler,
    /// (glue, sp, pc, constpool, profile, acc, hotness) -> void, baseline
    /// check-and-dispatch variant
    BaselineDispatch,
}

impl SigShape {
    fn params(self) -> Vec<VariableType> {
        use VariableType::*;
        match self {
            SigShape::BinaryWithGlobalEnv => vec![NativePointer, JsAny, JsAny, JsAny],
            SigShape::Unary => vec![NativePointer, JsAny],
            SigShape::UnaryWithGlobalEnv => vec![NativePointer, JsAny, JsAny],
            SigShape::LoadByName => vec![NativePointer, JsAny, JsAny, JsAny],
            SigShape::StoreByName => vec![NativePointer, JsAny, JsAny, JsAny, JsAny],
            SigShape::LoadByIndex => vec![NativePointer, JsAny, Int32, JsAny],
            SigShape::StoreByIndex => vec![NativePointer, JsAny, Int32, JsAny, JsAny],
            SigShape::IcAccess => vec![NativePointer, JsAny, JsAny, JsAny],
            SigShape::Barrier => vec![NativePointer, JsAny, NativePointer, JsAny],
            SigShape::Allocate => vec![NativePointer, JsAny],
            SigShape::RuntimeTrampoline => vec![NativePointer, Int64, Int64],
            SigShape::BytecodeHandler | SigShape::BaselineDispatch => vec![
                NativePointer,
                NativePointer,
                NativePointer,
                JsPointer,
                JsPointer,
                JsAny,
                Int32,
            ],
        }
    }

    fn return_type(self) -> VariableType {
        match self {
            SigShape::Barrier | SigShape::BytecodeHandler | SigShape::BaselineDispatch => {
                VariableType::Void
            }
            _ => VariableType::JsAny,
        }
    }

    fn call_conv(self) -> CallConv {
        match self {
            SigShape::BytecodeHandler | SigShape::BaselineDispatch => CallConv::Ghc,
            _ => CallConv::CCall,
        }
    }

    fn is_variadic(self) -> bool {
        matches!(self, SigShape::RuntimeTrampoline)
    }

    fn is_gc_leaf(self) -> bool {
        matches!(self, SigShape::Barrier)
    }
}

/// One row of a stub table.
#[derive(Debug, Clone, Copy)]
pub struct StubDescriptor {
    pub name: &'static str,
    pub shape: SigShape,
    pub builder: StubBuilderKind,
}

const fn stub(name: &'static str, shape: SigShape, builder: StubBuilderKind) -> StubDescriptor {
    StubDescriptor {
        name,
        shape,
        builder,
    }
}

/// Common stubs callable from both AOT code and the interpreter.
pub const COMMON_STUBS: &[StubDescriptor] = &[
    stub("Add", SigShape::BinaryWithGlobalEnv, StubBuilderKind::BinaryOp),
    stub("Sub", SigShape::BinaryWithGlobalEnv, StubBuilderKind::BinaryOp),
    stub("Mul", SigShape::BinaryWithGlobalEnv, StubBuilderKind::BinaryOp),
    stub("Div", SigShape::BinaryWithGlobalEnv, StubBuilderKind::BinaryOp),
    stub("Mod", SigShape::BinaryWithGlobalEnv, StubBuilderKind::BinaryOp),
    stub("Equal", SigShape::BinaryWithGlobalEnv, StubBuilderKind::BinaryOp),
    stub("NotEqual", SigShape::BinaryWithGlobalEnv, StubBuilderKind::BinaryOp),
    stub("StrictEqual", SigShape::BinaryWithGlobalEnv, StubBuilderKind::BinaryOp),
    stub("StrictNotEqual", SigShape::BinaryWithGlobalEnv, StubBuilderKind::BinaryOp),
    stub("Less", SigShape::BinaryWithGlobalEnv, StubBuilderKind::BinaryOp),
    stub("LessEq", SigShape::BinaryWithGlobalEnv, StubBuilderKind::BinaryOp),
    stub("Greater", SigShape::BinaryWithGlobalEnv, StubBuilderKind::BinaryOp),
    stub("GreaterEq", SigShape::BinaryWithGlobalEnv, StubBuilderKind::BinaryOp),
    stub("Shl", SigShape::BinaryWithGlobalEnv, StubBuilderKind::BinaryOp),
    stub("Shr", SigShape::BinaryWithGlobalEnv, StubBuilderKind::BinaryOp),
    stub("Ashr", SigShape::BinaryWithGlobalEnv, StubBuilderKind::BinaryOp),
    stub("And", SigShape::BinaryWithGlobalEnv, StubBuilderKind::BinaryOp),
    stub("Or", SigShape::BinaryWithGlobalEnv, StubBuilderKind::BinaryOp),
    stub("Xor", SigShape::BinaryWithGlobalEnv, StubBuilderKind::BinaryOp),
    stub("Instanceof", SigShape::BinaryWithGlobalEnv, StubBuilderKind::BinaryOp),
    stub("Inc", SigShape::UnaryWithGlobalEnv, StubBuilderKind::UnaryOp),
    stub("Dec", SigShape::UnaryWithGlobalEnv, StubBuilderKind::UnaryOp),
    stub("Neg", SigShape::UnaryWithGlobalEnv, StubBuilderKind::UnaryOp),
    stub("Not", SigShape::UnaryWithGlobalEnv, StubBuilderKind::UnaryOp),
    stub("TypeOf", SigShape::UnaryWithGlobalEnv, StubBuilderKind::UnaryOp),
    stub("ToBoolean", SigShape::Unary, StubBuilderKind::UnaryOp),
    stub("GetPropertyByName", SigShape::LoadByName, StubBuilderKind::PropertyAccess),
    stub("SetPropertyByName", SigShape::StoreByName, StubBuilderKind::PropertyStore),
    stub("SetPropertyByNameWithOwn", SigShape::StoreByName, StubBuilderKind::PropertyStore),
    stub("GetPropertyByIndex", SigShape::LoadByIndex, StubBuilderKind::PropertyAccess),
    stub("SetPropertyByIndex", SigShape::StoreByIndex, StubBuilderKind::PropertyStore),
    stub("SetPropertyByIndexWithOwn", SigShape::StoreByIndex, StubBuilderKind::PropertyStore),
    stub("GetPropertyByValue", SigShape::LoadByName, StubBuilderKind::PropertyAccess),
    stub("SetPropertyByValue", SigShape::StoreByName, StubBuilderKind::PropertyStore),
    stub("TryLdGlobalByName", SigShape::LoadByName, StubBuilderKind::PropertyAccess),
    stub("TryStGlobalByName", SigShape::StoreByName, StubBuilderKind::PropertyStore),
    stub("LdGlobalVar", SigShape::LoadByName, StubBuilderKind::PropertyAccess),
    stub("StGlobalVar", SigShape::StoreByName, StubBuilderKind::PropertyStore),
    stub("StOwnByName", SigShape::StoreByName, StubBuilderKind::PropertyStore),
    stub("StOwnByIndex", SigShape::StoreByIndex, StubBuilderKind::PropertyStore),
    stub("StOwnByValue", SigShape::StoreByName, StubBuilderKind::PropertyStore),
    stub("TryLoadICByName", SigShape::IcAccess, StubBuilderKind::IcAccess),
    stub("TryLoadICByValue", SigShape::IcAccess, StubBuilderKind::IcAccess),
    stub("TryStoreICByName", SigShape::StoreByName, StubBuilderKind::IcAccess),
    stub("TryStoreICByValue", SigShape::StoreByName, StubBuilderKind::IcAccess),
    stub("SetValueWithBarrier", SigShape::Barrier, StubBuilderKind::Barrier),
    stub("VerifyBarrier", SigShape::Barrier, StubBuilderKind::Barrier),
    stub("NewJsObject", SigShape::Allocate, StubBuilderKind::Allocation),
    stub("NewLexicalEnv", SigShape::Allocate, StubBuilderKind::Allocation),
    stub("CreateEmptyArray", SigShape::Allocate, StubBuilderKind::Allocation),
    stub("CreateArrayWithBuffer", SigShape::Allocate, StubBuilderKind::Allocation),
    stub("ConstructorCheck", SigShape::UnaryWithGlobalEnv, StubBuilderKind::CallDispatch),
    stub("CallRuntime", SigShape::RuntimeTrampoline, StubBuilderKind::Trampoline),
    stub("CallRuntimeWithArgv", SigShape::RuntimeTrampoline, StubBuilderKind::Trampoline),
];

/// Bytecode handlers. All share the GHC-convention dispatch layout.
pub const BYTECODE_HANDLERS: &[StubDescriptor] = &[
    stub("HandleLdundefined", SigShape::BytecodeHandler, StubBuilderKind::CallDispatch),
    stub("HandleLdnull", SigShape::BytecodeHandler, StubBuilderKind::CallDispatch),
    stub("HandleLdtrue", SigShape::BytecodeHandler, StubBuilderKind::CallDispatch),
    stub("HandleLdfalse", SigShape::BytecodeHandler, StubBuilderKind::CallDispatch),
    stub("HandleLdaV8", SigShape::BytecodeHandler, StubBuilderKind::CallDispatch),
    stub("HandleStaV8", SigShape::BytecodeHandler, StubBuilderKind::CallDispatch),
    stub("HandleAdd2Imm8V8", SigShape::BytecodeHandler, StubBuilderKind::BinaryOp),
    stub("HandleSub2Imm8V8", SigShape::BytecodeHandler, StubBuilderKind::BinaryOp),
    stub("HandleMul2Imm8V8", SigShape::BytecodeHandler, StubBuilderKind::BinaryOp),
    stub("HandleDiv2Imm8V8", SigShape::BytecodeHandler, StubBuilderKind::BinaryOp),
    stub("HandleMod2Imm8V8", SigShape::BytecodeHandler, StubBuilderKind::BinaryOp),
    stub("HandleJmpImm8", SigShape::BytecodeHandler, StubBuilderKind::CallDispatch),
    stub("HandleJmpImm16", SigShape::BytecodeHandler, StubBuilderKind::CallDispatch),
    stub("HandleJeqzImm8", SigShape::BytecodeHandler, StubBuilderKind::CallDispatch),
    stub("HandleCallarg0Imm8", SigShape::BytecodeHandler, StubBuilderKind::CallDispatch),
    stub("HandleCallarg1Imm8V8", SigShape::BytecodeHandler, StubBuilderKind::CallDispatch),
    stub("HandleCallargs2Imm8V8V8", SigShape::BytecodeHandler, StubBuilderKind::CallDispatch),
    stub("HandleCallthis0Imm8V8", SigShape::BytecodeHandler, StubBuilderKind::CallDispatch),
    stub("HandleReturn", SigShape::BytecodeHandler, StubBuilderKind::CallDispatch),
    stub("HandleReturnundefined", SigShape::BytecodeHandler, StubBuilderKind::CallDispatch),
    stub("ExceptionHandler", SigShape::BytecodeHandler, StubBuilderKind::CallDispatch),
];

/// Baseline-compiler dispatch stubs.
pub const BASELINE_STUBS: &[StubDescriptor] = &[
    stub("CallArg0AndCheckToBaseline", SigShape::BaselineDispatch, StubBuilderKind::CallDispatch),
    stub("CallArg1AndCheckToBaseline", SigShape::BaselineDispatch, StubBuilderKind::CallDispatch),
    stub("CallArgs2AndCheckToBaseline", SigShape::BaselineDispatch, StubBuilderKind::CallDispatch),
    stub("CallArgs3AndCheckToBaseline", SigShape::BaselineDispatch, StubBuilderKind::CallDispatch),
    stub("CallThisArg0AndCheckToBaseline", SigShape::BaselineDispatch, StubBuilderKind::CallDispatch),
    stub("CallThisArg1AndCheckToBaseline", SigShape::BaselineDispatch, StubBuilderKind::CallDispatch),
    stub("CallThisArgs2AndCheckToBaseline", SigShape::BaselineDispatch, StubBuilderKind::CallDispatch),
    stub("CallThisArgs3AndCheckToBaseline", SigShape::BaselineDispatch, StubBuilderKind::CallDispatch),
];

fn build_signature(id: u32, desc: &StubDescriptor, kind: TargetKind) -> CallSignature {
    let params = desc.shape.params();
    let mut sig = CallSignature::with_params(
        desc.name,
        desc.shape.is_variadic(),
        ArgumentsOrder::Default,
        desc.shape.return_type(),
        &params,
    );
    sig.set_id(id);
    sig.set_call_conv(desc.shape.call_conv());
    sig.set_target_kind(kind);
    sig.set_gc_leaf(desc.shape.is_gc_leaf());
    sig.set_constructor(desc.builder);
    if matches!(desc.shape, SigShape::RuntimeTrampoline) {
        sig.set_target_kind(TargetKind::RuntimeStub);
    }
    sig
}

/// All call signatures the process knows, built once and read many times.
///
/// Indices are dense per table and match the order of the descriptor
/// arrays, so generators can iterate `0..common_count()` and get every
/// common stub exactly once.
pub struct StubRegistry {
    common: Vec<CallSignature>,
    bytecode: Vec<CallSignature>,
    baseline: Vec<CallSignature>,
}

impl StubRegistry {
    /// Build every signature from the descriptor tables.
    pub fn build() -> Self {
        let common = COMMON_STUBS
            .iter()
            .enumerate()
            .map(|(i, d)| build_signature(i as u32, d, TargetKind::CommonStub))
            .collect();
        let bytecode = BYTECODE_HANDLERS
            .iter()
            .enumerate()
            .map(|(i, d)| build_signature(i as u32, d, TargetKind::BytecodeHandler))
            .collect();
        let baseline = BASELINE_STUBS
            .iter()
            .enumerate()
            .map(|(i, d)| build_signature(i as u32, d, TargetKind::BaselineStub))
            .collect();
        Self {
            common,
            bytecode,
            baseline,
        }
    }

    pub fn common_count(&self) -> usize {
        self.common.len()
    }

    pub fn bytecode_count(&self) -> usize {
        self.bytecode.len()
    }

    pub fn baseline_count(&self) -> usize {
        self.baseline.len()
    }

    /// Get a common stub's signature. Panics on an out-of-range index;
    /// callers index with table-derived constants, so a bad index is a
    /// programmer error.
    pub fn common(&self, index: usize) -> &CallSignature {
        assert!(index < self.common.len(), "common stub index out of range");
        &self.common[index]
    }

    pub fn bytecode_handler(&self, index: usize) -> &CallSignature {
        assert!(
            index < self.bytecode.len(),
            "bytecode handler index out of range"
        );
        &self.bytecode[index]
    }

    pub fn baseline(&self, index: usize) -> &CallSignature {
        assert!(
            index < self.baseline.len(),
            "baseline stub index out of range"
        );
        &self.baseline[index]
    }

    /// Look up a common stub by name (CLI and diagnostics only; hot paths
    /// use indices).
    pub fn find_common(&self, name: &str) -> Option<&CallSignature> {
        self.common.iter().find(|s| s.name() == name)
    }
}
