//! Rill language engine - lexer, parser, resolver, and suspendable VM
//! runtime.
//!
//! Rill is an embeddable scripting language for hosts that need a
//! tightly sandboxed, asynchronous-capable scripting surface. Scripts
//! have no ambient authority: their only window to the world is the
//! functions the host registers. A call to an async host function never
//! blocks the calling thread - the script is suspended into a
//! `Continuation` value that the host resumes later, possibly on a
//! different thread, possibly after serializing it.
//!
//! # Example
//!
//! ```ignore
//! use rill_engine::{compile, CompileOptions, HostRegistry, Outcome};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(HostRegistry::with_defaults());
//! let script = compile(
//!     "def fact(n) { n <= 1 ? 1 : n * fact(n - 1) }; fact(10)",
//!     "example",
//!     &registry,
//!     CompileOptions::default(),
//! )?;
//! let mut output = rill_engine::CollectPrint::default();
//! match script.execute_new_globals(&mut output) {
//!     Outcome::Done(v) => assert_eq!(v.display(), "3628800"),
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

pub mod compiler;
pub mod error;
pub mod host;
pub mod parser;
pub mod resolver;
pub mod types;
pub mod vm;

pub use error::{CompileError, CompileErrors, RuntimeError, RuntimeErrorKind};
pub use host::{
    CollectPrint, HostContext, HostFunction, HostParam, HostRegistry, NoPrint, PrintWriter,
    StdPrint,
};
pub use parser::LoopMode;
pub use types::Type;
pub use vm::{
    AsyncOp, AsyncOutcome, Continuation, ExecOptions, Outcome, SerializedContinuation,
    SnapshotError, Value,
};

use crate::compiler::{code::Program, Origin};
use crate::parser::{Lexer, Parser};
use crate::resolver::ResolveOptions;
use crate::vm::value::Globals;
use crate::vm::Vm;
use indexmap::IndexMap;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::sync::Arc;

/// Compilation knobs.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Wrap the top-level statements in the read-line loop (`-p`/`-n`)
    pub loop_mode: LoopMode,
    /// Global names the host will supply at execution time
    pub globals: FxHashSet<String>,
    /// Assignment to undeclared names at script level creates globals
    pub allow_implicit_globals: bool,
    /// Execution limits carried into every run of this script
    pub exec: ExecOptions,
}

/// A compiled, executable script bound to its host registry snapshot.
pub struct CompiledScript {
    program: Arc<Program>,
    registry: Arc<HostRegistry>,
    source: Arc<str>,
    exec: ExecOptions,
}

impl CompiledScript {
    pub fn name(&self) -> &str {
        &self.program.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Dump the compiled units (the `-d` debug output).
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for unit in &self.program.functions {
            out.push_str(&format!(
                "=== {} (params {}, locals {}{}{})\n",
                unit.name,
                unit.params,
                unit.locals,
                if unit.is_async { ", async" } else { "" },
                if unit.is_wrapper { ", wrapper" } else { "" },
            ));
            for (pc, op) in unit.ops.iter().enumerate() {
                out.push_str(&format!("{:5}  {:?}\n", pc, op));
            }
        }
        out
    }

    /// Run with the given globals map. Returns `Done`, `Suspend`, or
    /// `Failed`; on `Suspend` the host performs the `AsyncOp` and calls
    /// [`CompiledScript::resume`].
    pub fn execute(
        &self,
        globals: IndexMap<String, Value>,
        writer: &mut dyn PrintWriter,
    ) -> Outcome {
        let globals: Globals = Arc::new(Mutex::new(globals));
        self.execute_shared(globals, writer)
    }

    /// Run with empty globals.
    pub fn execute_new_globals(&self, writer: &mut dyn PrintWriter) -> Outcome {
        self.execute(IndexMap::new(), writer)
    }

    /// Run with a shared globals handle (the host keeps access to
    /// globals the script creates).
    pub fn execute_shared(&self, globals: Globals, writer: &mut dyn PrintWriter) -> Outcome {
        let mut vm = Vm::new(
            Arc::clone(&self.program),
            Arc::clone(&self.registry),
            self.exec.clone(),
        );
        let mut ctx = HostContext { writer };
        vm.execute(globals, &mut ctx)
    }

    /// Re-enter a suspended script with the async operation's outcome.
    /// An `Err` outcome (cancellation included) surfaces as a throw at
    /// the suspension point.
    pub fn resume(
        &self,
        continuation: Continuation,
        outcome: AsyncOutcome,
        writer: &mut dyn PrintWriter,
    ) -> Outcome {
        let mut vm = Vm::new(
            Arc::clone(&self.program),
            Arc::clone(&self.registry),
            self.exec.clone(),
        );
        let mut ctx = HostContext { writer };
        vm.resume(continuation, outcome, &mut ctx)
    }

    /// Reattach a detached continuation produced by
    /// [`Continuation::detach`].
    pub fn attach(
        &self,
        serialized: &SerializedContinuation,
    ) -> Result<Continuation, SnapshotError> {
        serialized.attach(&self.program)
    }

    /// Run to completion on this thread, performing async operations
    /// with their registered dispatch. Hosts that need real
    /// event-driven suspension drive `execute`/`resume` themselves.
    pub fn run_blocking(
        &self,
        globals: IndexMap<String, Value>,
        writer: &mut dyn PrintWriter,
    ) -> Result<Value, RuntimeError> {
        let mut outcome = self.execute(globals, writer);
        loop {
            match outcome {
                Outcome::Done(value) => return Ok(value),
                Outcome::Failed(error) => return Err(error),
                Outcome::Suspend(continuation, op) => {
                    let result = match &op.dispatch {
                        Some(dispatch) => {
                            let mut ctx = HostContext { writer };
                            dispatch(&mut ctx, &op.args)
                        }
                        None => Err(RuntimeError::new(RuntimeErrorKind::Internal {
                            message: format!(
                                "Async function '{}' has no dispatch for blocking execution",
                                op.function
                            ),
                        })),
                    };
                    outcome = self.resume(continuation, result, writer);
                }
            }
        }
    }
}

/// Compile a script against a host registry snapshot.
///
/// Registration must be complete before this call: the returned script
/// keeps the registry behind an `Arc`, so later registrations cannot
/// change what compiled scripts resolve to.
pub fn compile(
    source: &str,
    name: &str,
    registry: &Arc<HostRegistry>,
    options: CompileOptions,
) -> Result<CompiledScript, CompileErrors> {
    let program = compile_program(source, name, registry, &options, Origin::Root)?;
    Ok(CompiledScript {
        program,
        registry: Arc::clone(registry),
        source: Arc::from(source),
        exec: options.exec,
    })
}

fn compile_program(
    source: &str,
    name: &str,
    registry: &Arc<HostRegistry>,
    options: &CompileOptions,
    origin: Origin,
) -> Result<Arc<Program>, CompileErrors> {
    let tokens = Lexer::new(source).tokenize().map_err(|errors| {
        CompileErrors::new(
            name,
            errors
                .into_iter()
                .map(|e| CompileError {
                    message: e.to_string(),
                    span: e.span(),
                })
                .collect(),
        )
    })?;

    let script = Parser::new(tokens)
        .parse_script(name, options.loop_mode)
        .map_err(|errors| {
            CompileErrors::new(
                name,
                errors
                    .into_iter()
                    .map(|e| CompileError {
                        message: e.message,
                        span: e.span,
                    })
                    .collect(),
            )
        })?;

    let resolve_options = ResolveOptions {
        globals: options.globals.clone(),
        allow_implicit_globals: options.allow_implicit_globals
            || options.loop_mode != LoopMode::Off,
    };
    let resolution =
        resolver::resolve(&script, registry, &resolve_options).map_err(|errors| {
            CompileErrors::new(
                name,
                errors
                    .into_iter()
                    .map(|e| CompileError {
                        message: e.message(),
                        span: e.span,
                    })
                    .collect(),
            )
        })?;

    Ok(Arc::new(compiler::lower(&script, &resolution, origin)))
}

/// Compile an `eval` argument: same registry, implicit globals allowed
/// (they land in the bindings map).
pub(crate) fn compile_eval_program(
    source: &str,
    registry: &Arc<HostRegistry>,
) -> Result<Arc<Program>, CompileErrors> {
    let options = CompileOptions {
        allow_implicit_globals: true,
        ..CompileOptions::default()
    };
    compile_program(source, "eval", registry, &options, Origin::Eval)
}
