//! Compiled code containers
//!
//! A `CodeUnit` per function (wrappers included), assembled into a
//! `Program`. Units are `Arc`-shared with frames so suspended
//! continuations keep their code alive independently of the program
//! table.

use crate::compiler::op::Op;
use crate::parser::token::Span;
use crate::types::ClassId;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Where a unit came from; frames from `eval`-compiled units cannot be
/// detached into a serialized continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Root,
    Eval,
}

/// Parameter metadata used for runtime argument marshaling (`this`
/// excluded).
#[derive(Debug, Clone)]
pub struct ParamMeta {
    pub name: String,
    pub has_default: bool,
}

/// A heap cell the frame allocates on entry.
#[derive(Debug, Clone, Copy)]
pub struct OwnCell {
    /// Seed the cell from this parameter slot (hoisted parameters);
    /// plain hoisted locals start null
    pub seed_param: Option<u16>,
}

/// One compiled function.
#[derive(Debug)]
pub struct CodeUnit {
    /// Stable identity, e.g. `main`, `fact$12`, `Point.init+wrapper`
    pub name: String,
    /// Index in the program's function table
    pub fun_id: usize,
    /// Parameter count including `this` for methods
    pub params: u16,
    /// Total local slots (parameters plus locals plus scratch)
    pub locals: u16,
    pub is_async: bool,
    pub is_wrapper: bool,
    /// Expects `this` in slot 0
    pub is_method: bool,
    /// Synthesized class initializer (missing mandatory arguments
    /// report as missing fields)
    pub is_init: bool,
    pub param_meta: Vec<ParamMeta>,
    /// Number of cells captured from the creating frame
    pub capture_count: u16,
    /// Cells allocated on entry, appended after the captured ones
    pub own_cells: Vec<OwnCell>,
    pub ops: Vec<Op>,
    /// Source position per op, for runtime error locations
    pub spans: Vec<Span>,
    /// Wrapper unit when this function has one
    pub wrapper: Option<usize>,
    pub origin: Origin,
}

impl CodeUnit {
    pub fn span_at(&self, pc: usize) -> Option<Span> {
        self.spans.get(pc).copied()
    }
}

/// Runtime view of a class: flattened method table and constructor
/// parameter order.
#[derive(Debug)]
pub struct RuntimeClass {
    pub name: Arc<str>,
    pub class_id: ClassId,
    pub base: Option<ClassId>,
    /// All fields including inherited, base-first; also the constructor
    /// parameter order
    pub field_names: Vec<String>,
    /// Dynamic dispatch table: own methods shadow inherited ones
    pub methods: FxHashMap<String, usize>,
    /// The initializer's wrapper unit (always present)
    pub init_wrapper: usize,
}

impl RuntimeClass {
    /// Is `class` the same as or derived from `base`?
    pub fn is_instance_of(classes: &[RuntimeClass], mut class: ClassId, base: ClassId) -> bool {
        loop {
            if class == base {
                return true;
            }
            match classes[class].base {
                Some(b) => class = b,
                None => return false,
            }
        }
    }
}

/// A fully compiled script.
#[derive(Debug)]
pub struct Program {
    pub name: String,
    pub functions: Vec<Arc<CodeUnit>>,
    pub classes: Vec<RuntimeClass>,
    pub main: usize,
}

impl Program {
    pub fn unit(&self, fun: usize) -> Arc<CodeUnit> {
        Arc::clone(&self.functions[fun])
    }

    /// Look a unit up by its stable name (continuation reattachment).
    pub fn unit_by_name(&self, name: &str) -> Option<Arc<CodeUnit>> {
        self.functions
            .iter()
            .find(|u| u.name == name)
            .map(Arc::clone)
    }
}
