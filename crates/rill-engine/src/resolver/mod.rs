//! Semantic resolution
//!
//! Annotates the parsed AST with symbol bindings, types, closure capture
//! sets, and async reachability. The AST itself stays immutable; every
//! attribute lives in the `Resolution` side tables keyed by node id,
//! which also makes re-running the resolver a pure no-op.

pub mod classes;
pub mod error;
mod fixpoint;
mod resolve;
pub mod symbols;

pub use classes::{ClassDescriptor, FieldInfo, MethodInfo};
pub use error::{ResolveError, ResolveErrorKind};
pub use symbols::{CallTarget, FunId, FunctionInfo, VarId, VarInfo, VarUse};

use crate::host::HostRegistry;
use crate::parser::ast::Script;
use crate::parser::NodeId;
use crate::types::Type;
use rustc_hash::{FxHashMap, FxHashSet};

/// Options for resolution.
#[derive(Debug, Default, Clone)]
pub struct ResolveOptions {
    /// Names the host will supply as globals at execution time
    pub globals: FxHashSet<String>,
    /// Assignment to an undeclared name at script level creates a global
    /// (the `-p`/`-n` contract)
    pub allow_implicit_globals: bool,
}

/// Output of the resolver: everything the lowering pass needs.
#[derive(Debug)]
pub struct Resolution {
    pub vars: Vec<VarInfo>,
    pub functions: Vec<FunctionInfo>,
    pub classes: Vec<ClassDescriptor>,
    /// Identifier expression -> how it resolved
    pub var_uses: FxHashMap<NodeId, VarUse>,
    /// `VarDecl`/`Param` node -> its variable
    pub decl_vars: FxHashMap<NodeId, VarId>,
    /// `FunDecl` node -> its function
    pub fun_ids: FxHashMap<NodeId, FunId>,
    /// `ClassDecl` node -> its class
    pub class_ids: FxHashMap<NodeId, crate::types::ClassId>,
    /// Call expression -> resolved target
    pub call_targets: FxHashMap<NodeId, CallTarget>,
    /// Method-call expression -> statically bound method (final methods
    /// on known instance types)
    pub method_binds: FxHashMap<NodeId, FunId>,
    /// Expression node -> static type
    pub expr_types: FxHashMap<NodeId, Type>,
    /// Call sites that may suspend
    pub async_calls: FxHashSet<NodeId>,
    /// `new X(...)` expression -> class
    pub new_classes: FxHashMap<NodeId, crate::types::ClassId>,
    pub main_fun: FunId,
    /// Global names: host-supplied plus script-created
    pub globals: FxHashSet<String>,
}

/// Resolve a parsed script against a host registry.
///
/// Errors are collected rather than failing fast; resolution continues
/// past an error wherever that cannot cascade into false positives.
pub fn resolve(
    script: &Script,
    registry: &HostRegistry,
    options: &ResolveOptions,
) -> Result<Resolution, Vec<ResolveError>> {
    resolve::run(script, registry, options)
}
