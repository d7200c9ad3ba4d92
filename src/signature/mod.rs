//! Call signatures for compiled stubs and handlers.
//!
//! A `CallSignature` describes one callable entity's ABI: its name,
//! parameter and return types, calling convention, and a set of flags
//! (variadic, tail-call, GC-leaf) plus a target-kind role tag that
//! determines how the rest of the pipeline treats it.
//!
//! Signatures are built once at startup into a [`StubRegistry`] and read
//! many times; nothing mutates them after registry construction.

mod table;

pub use table::{
    BASELINE_STUBS, BYTECODE_HANDLERS, COMMON_STUBS, SigShape, StubDescriptor, StubRegistry,
};

/// Semantic type of one parameter or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableType {
    Void,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Float64,
    /// Raw machine pointer (the "glue" runtime pointer, frames, pc).
    NativePointer,
    /// Pointer into the managed heap.
    JsPointer,
    /// Any tagged JS value.
    JsAny,
}

/// Calling convention used by a compiled target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallConv {
    /// Plain C calling convention.
    #[default]
    CCall,
    /// Register-heavy convention used by bytecode handlers (GHC-like).
    Ghc,
    /// JS-call convention for entering optimized JS code (WebKit-JS-like).
    WebKitJs,
}

/// Order in which arguments are pushed.
///
/// Only the default (right-to-left) order exists today; the tag is kept so
/// signatures stay self-describing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArgumentsOrder {
    #[default]
    Default,
}

/// Role of a compiled target. Determines ABI details and how the entry's
/// metadata is interpreted by the loader and unwinder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetKind {
    #[default]
    CommonStub,
    RuntimeStub,
    /// Runtime stub guaranteed not to trigger garbage collection.
    RuntimeStubNoGc,
    BytecodeHandler,
    BuiltinsStub,
    JsFunction,
    OptimizedStub,
    DeoptStub,
    BaselineStub,
}

impl TargetKind {
    /// Stable numeric encoding used in serialized function entries.
    pub fn to_u32(self) -> u32 {
        match self {
            TargetKind::CommonStub => 0,
            TargetKind::RuntimeStub => 1,
            TargetKind::RuntimeStubNoGc => 2,
            TargetKind::BytecodeHandler => 3,
            TargetKind::BuiltinsStub => 4,
            TargetKind::JsFunction => 5,
            TargetKind::OptimizedStub => 6,
            TargetKind::DeoptStub => 7,
            TargetKind::BaselineStub => 8,
        }
    }

    /// Decode from the serialized encoding. Returns `None` for an unknown
    /// tag (a corrupt or newer-format file).
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => TargetKind::CommonStub,
            1 => TargetKind::RuntimeStub,
            2 => TargetKind::RuntimeStubNoGc,
            3 => TargetKind::BytecodeHandler,
            4 => TargetKind::BuiltinsStub,
            5 => TargetKind::JsFunction,
            6 => TargetKind::OptimizedStub,
            7 => TargetKind::DeoptStub,
            8 => TargetKind::BaselineStub,
            _ => return None,
        })
    }

    /// Whether entries of this kind live in stub files (as opposed to AOT
    /// images of compiled JS functions).
    pub fn is_stub(self) -> bool {
        !matches!(self, TargetKind::JsFunction)
    }
}

/// Which builder constructs the circuit body for a stub.
///
/// The set of builders is closed and known at compile time, so this is a
/// plain tag rather than a boxed constructor closure; the codegen driver
/// matches on it to allocate the right builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubBuilderKind {
    BinaryOp,
    UnaryOp,
    PropertyAccess,
    PropertyStore,
    IcAccess,
    Allocation,
    CallDispatch,
    Barrier,
    Trampoline,
}

/// ABI descriptor for one callable target.
///
/// Cloning deep-copies the parameter vector; two clones never share
/// parameter storage.
#[derive(Debug, Clone)]
pub struct CallSignature {
    name: String,
    id: u32,
    params: Vec<VariableType>,
    return_type: VariableType,
    order: ArgumentsOrder,
    call_conv: CallConv,
    target_kind: TargetKind,
    variadic: bool,
    tail_call: bool,
    gc_leaf: bool,
    /// Parameter indices whose registers may be clobbered after the call.
    dead_params: Vec<usize>,
    constructor: Option<StubBuilderKind>,
}

impl CallSignature {
    /// Create a signature with `param_count` parameters, all initially
    /// `JsAny`. Types are filled in afterwards via [`set_parameters`].
    ///
    /// [`set_parameters`]: CallSignature::set_parameters
    pub fn new(
        name: &str,
        variadic: bool,
        param_count: usize,
        order: ArgumentsOrder,
        return_type: VariableType,
    ) -> Self {
        Self {
            name: name.to_string(),
            id: 0,
            params: vec![VariableType::JsAny; param_count],
            return_type,
            order,
            call_conv: CallConv::CCall,
            target_kind: TargetKind::CommonStub,
            variadic,
            tail_call: false,
            gc_leaf: false,
            dead_params: Vec::new(),
            constructor: None,
        }
    }

    /// Create a signature with an explicit parameter-type list.
    pub fn with_params(
        name: &str,
        variadic: bool,
        order: ArgumentsOrder,
        return_type: VariableType,
        params: &[VariableType],
    ) -> Self {
        let mut sig = Self::new(name, variadic, params.len(), order, return_type);
        sig.params.copy_from_slice(params);
        sig
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[VariableType] {
        &self.params
    }

    /// Replace all parameter types. The slice length must match the count
    /// given at construction.
    pub fn set_parameters(&mut self, params: &[VariableType]) {
        assert_eq!(
            params.len(),
            self.params.len(),
            "parameter count mismatch for signature {}",
            self.name
        );
        self.params.copy_from_slice(params);
    }

    pub fn return_type(&self) -> VariableType {
        self.return_type
    }

    pub fn order(&self) -> ArgumentsOrder {
        self.order
    }

    pub fn call_conv(&self) -> CallConv {
        self.call_conv
    }

    pub fn set_call_conv(&mut self, conv: CallConv) {
        self.call_conv = conv;
    }

    pub fn target_kind(&self) -> TargetKind {
        self.target_kind
    }

    pub fn set_target_kind(&mut self, kind: TargetKind) {
        self.target_kind = kind;
    }

    pub fn is_variadic(&self) -> bool {
        self.variadic
    }

    pub fn set_variadic(&mut self, variadic: bool) {
        self.variadic = variadic;
    }

    pub fn is_tail_call(&self) -> bool {
        self.tail_call
    }

    pub fn set_tail_call(&mut self, tail_call: bool) {
        self.tail_call = tail_call;
    }

    /// A GC-leaf target is guaranteed not to trigger garbage collection,
    /// so callers may keep raw pointers live across the call.
    pub fn is_gc_leaf(&self) -> bool {
        self.gc_leaf
    }

    pub fn set_gc_leaf(&mut self, gc_leaf: bool) {
        self.gc_leaf = gc_leaf;
    }

    /// Mark a parameter's register as dead after the call.
    pub fn mark_param_dead(&mut self, index: usize) {
        assert!(index < self.params.len(), "dead-param index out of range");
        if !self.dead_params.contains(&index) {
            self.dead_params.push(index);
        }
    }

    pub fn is_param_dead(&self, index: usize) -> bool {
        self.dead_params.contains(&index)
    }

    pub fn constructor(&self) -> Option<StubBuilderKind> {
        self.constructor
    }

    pub fn has_constructor(&self) -> bool {
        self.constructor.is_some()
    }

    pub fn set_constructor(&mut self, kind: StubBuilderKind) {
        self.constructor = Some(kind);
    }
}
