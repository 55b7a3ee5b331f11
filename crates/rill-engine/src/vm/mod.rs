//! The Rill runtime: tagged values, heap cells, frames, the execution
//! engine, and detached continuations.

pub mod arith;
pub mod builtins;
pub mod frame;
pub mod heap;
pub mod interp;
pub mod iter;
pub mod regexes;
pub mod snapshot;
pub mod value;

pub use frame::{AsyncOp, AsyncOutcome, Continuation, Frame, Outcome};
pub use heap::HeapCell;
pub use interp::{ExecOptions, Vm};
pub use snapshot::{SerializedContinuation, SnapshotError};
pub use value::{FunctionValue, Globals, Instance, Value};
