//! Frames and continuations
//!
//! A `Frame` is one reified function activation: code, instruction
//! pointer, locals, operand stack, heap cells, and the per-frame regex
//! state. Because frames are plain values (never the host call stack), a
//! suspended script is just the frame chain packaged as a
//! `Continuation`.

use crate::compiler::code::CodeUnit;
use crate::error::RuntimeError;
use crate::host::HostFn;
use crate::vm::heap::HeapCell;
use crate::vm::iter::DriveState;
use crate::vm::regexes::GlobalMatchState;
use crate::vm::value::{Globals, Value};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// One function activation.
#[derive(Debug)]
pub struct Frame {
    pub unit: Arc<CodeUnit>,
    pub pc: usize,
    pub locals: Vec<Value>,
    pub stack: Vec<Value>,
    /// Captured cells followed by own hoisted cells
    pub cells: Vec<HeapCell>,
    pub globals: Globals,
    /// Wrapper bookkeeping: which parameters `BindArgs` bound
    pub bound: Vec<bool>,
    /// Regex capture variables `$0..$N` of the most recent match
    pub captures: Vec<Value>,
    /// Per-call-site state for `=~ /.../g` loops
    pub regex_sites: FxHashMap<u32, GlobalMatchState>,
    /// Active iterator/substitution drive for the current op
    pub drive: Option<DriveState>,
}

impl Frame {
    /// Create a frame for `unit`, seeding parameter slots from `args`
    /// and allocating the unit's own cells.
    pub fn new(unit: Arc<CodeUnit>, args: Vec<Value>, captures: Vec<HeapCell>, globals: Globals) -> Self {
        let mut locals = vec![Value::Null; unit.locals as usize];
        for (i, arg) in args.into_iter().enumerate() {
            if i < locals.len() {
                locals[i] = arg;
            }
        }
        let mut cells = captures;
        for own in &unit.own_cells {
            let seed = own
                .seed_param
                .map(|slot| std::mem::take(&mut locals[slot as usize]))
                .unwrap_or(Value::Null);
            cells.push(HeapCell::new(seed));
        }
        Self {
            unit,
            pc: 0,
            locals,
            stack: Vec::new(),
            cells,
            globals,
            bound: Vec::new(),
            captures: Vec::new(),
            regex_sites: FxHashMap::default(),
            drive: None,
        }
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Null)
    }

    pub fn peek(&self) -> &Value {
        self.stack.last().unwrap_or(&Value::Null)
    }
}

/// The description of the blocking operation the host must perform
/// while the script is suspended.
pub struct AsyncOp {
    /// Host function name
    pub function: String,
    pub args: Vec<Value>,
    /// The registered dispatch, when one was provided; `run_blocking`
    /// uses it, event-driven hosts may ignore it
    pub dispatch: Option<HostFn>,
}

impl std::fmt::Debug for AsyncOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncOp")
            .field("function", &self.function)
            .field("args", &self.args)
            .finish()
    }
}

/// A suspended script: the frame chain from script root (first) to the
/// suspension point (last). The innermost frame's pc already points
/// past the async call, so resuming only needs the outcome value.
#[derive(Debug)]
pub struct Continuation {
    pub frames: Vec<Frame>,
}

impl Continuation {
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

/// Result of running or resuming a script.
#[derive(Debug)]
pub enum Outcome {
    Done(Value),
    /// The script is waiting for the host to perform `AsyncOp`
    Suspend(Continuation, AsyncOp),
    Failed(RuntimeError),
}

impl Outcome {
    pub fn into_done(self) -> Option<Value> {
        match self {
            Outcome::Done(v) => Some(v),
            _ => None,
        }
    }
}

/// Outcome the host delivers on resume.
pub type AsyncOutcome = Result<Value, RuntimeError>;
