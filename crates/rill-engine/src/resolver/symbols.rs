//! Symbol tables for the resolver
//!
//! Variables and functions get dense ids; blocks form a scope stack with
//! each scope tagged by its owning function so lookups can tell a plain
//! local reference from a closure capture.

use crate::parser::ast::NodeId;
use crate::parser::token::Span;
use crate::types::{ClassId, Type};
use rustc_hash::FxHashMap;

/// Index into the resolved variable table.
pub type VarId = usize;

/// Index into the resolved function table.
pub type FunId = usize;

/// Everything the lowering pass needs to know about one variable.
#[derive(Debug, Clone)]
pub struct VarInfo {
    pub name: String,
    pub ty: Type,
    pub owner_fun: FunId,
    /// Slot within the owning function's frame
    pub slot: u16,
    /// Captured by some closure; all access goes through a heap cell
    pub is_heap: bool,
    pub is_param: bool,
    pub is_final: bool,
    pub decl_span: Span,
    /// Function this variable is known to be bound to, when the
    /// initializer was a closure or function reference
    pub bound_fun: Option<FunId>,
    /// Assigned anywhere after declaration (invalidates `bound_fun`)
    pub reassigned: bool,
}

/// Everything the lowering pass needs to know about one function.
#[derive(Debug, Clone)]
pub struct FunctionInfo {
    /// AST node of the `FunDecl`; `None` for synthesized functions
    /// (class initializers)
    pub node: Option<NodeId>,
    /// Stable compiled name, e.g. `main`, `fact`, `Point.sum`
    pub name: String,
    pub params: Vec<VarId>,
    /// Signature metadata, available before the body is resolved so
    /// forward calls can be checked
    pub param_names: Vec<String>,
    pub param_types: Vec<Type>,
    pub param_has_default: Vec<bool>,
    pub return_type: Type,
    pub is_closure: bool,
    /// Outer-function variables this function reads or writes
    /// (transitively closed over referenced functions)
    pub captures: Vec<VarId>,
    /// Own variables that were hoisted to heap cells, in declaration order
    pub own_cells: Vec<VarId>,
    /// Peak number of local slots (parameters included)
    pub locals_count: u16,
    pub needs_wrapper: bool,
    pub owner_class: Option<ClassId>,
    pub is_init: bool,
    pub enclosing: Option<FunId>,
    pub decl_span: Span,
    /// Earliest reference that preceded the declaration, when forward
    /// referenced
    pub earliest_forward_ref: Option<Span>,
    /// Call-graph edges for async propagation
    pub calls: Vec<FunId>,
    /// Directly contains an async host call, an `eval`, or a call
    /// through an unknown function value
    pub has_async_seed: bool,
    /// Computed by the async fixed point
    pub is_async: bool,
}

impl FunctionInfo {
    pub fn new(name: String, enclosing: Option<FunId>, decl_span: Span) -> Self {
        Self {
            node: None,
            name,
            params: Vec::new(),
            param_names: Vec::new(),
            param_types: Vec::new(),
            param_has_default: Vec::new(),
            return_type: Type::Any,
            is_closure: false,
            captures: Vec::new(),
            own_cells: Vec::new(),
            locals_count: 0,
            needs_wrapper: false,
            owner_class: None,
            is_init: false,
            enclosing,
            decl_span,
            earliest_forward_ref: None,
            calls: Vec::new(),
            has_async_seed: false,
            is_async: false,
        }
    }
}

/// What a name in scope refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeEntry {
    Var(VarId),
    Fun(FunId),
}

/// One block's name bindings, tagged with the owning function.
#[derive(Debug)]
pub struct Scope {
    pub names: FxHashMap<String, ScopeEntry>,
    pub fun: FunId,
}

impl Scope {
    pub fn new(fun: FunId) -> Self {
        Self {
            names: FxHashMap::default(),
            fun,
        }
    }
}

/// How an identifier use was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarUse {
    /// A local (or parameter) of the current function
    Local(VarId),
    /// A variable of an enclosing function, accessed through a cell
    Capture(VarId),
    /// A script-level global, looked up by name at runtime
    Global(String),
    /// An instance field of the enclosing class (implicit `this.`)
    Field(String),
    /// A named function used as a value
    FunctionRef(FunId),
}

/// How a call site was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    /// Direct call to a script function
    Function(FunId),
    /// Call to a registered host function
    Host(usize),
    /// `eval(source [, bindings])`
    Eval,
    /// Call through a function-typed value
    Value,
    /// Unqualified method call on the enclosing instance
    SelfMethod(String),
}
