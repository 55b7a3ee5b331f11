//! Heap cells for captured variables
//!
//! When a variable is captured by a closure, both the declaring frame and
//! every capturing closure hold the same cell, so all reads and writes
//! observe the same storage. Cells are `Send` so a suspended continuation
//! can be resumed from a different thread; the mutex is uncontended
//! because a script instance is single-threaded.

use crate::vm::value::Value;
use parking_lot::Mutex;
use std::sync::Arc;

/// A shared, mutable box holding a single value.
#[derive(Debug, Clone, Default)]
pub struct HeapCell(Arc<Mutex<Value>>);

impl HeapCell {
    pub fn new(value: Value) -> Self {
        Self(Arc::new(Mutex::new(value)))
    }

    pub fn get(&self) -> Value {
        self.0.lock().clone()
    }

    pub fn set(&self, value: Value) {
        *self.0.lock() = value;
    }

    /// Identity of the cell, preserved across suspend/resume within a
    /// process and used to dedupe shared cells during serialization.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn same_cell(&self, other: &HeapCell) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_cell_observes_writes() {
        let a = HeapCell::new(Value::Int(1));
        let b = a.clone();
        b.set(Value::Int(2));
        assert_eq!(a.get(), Value::Int(2));
        assert!(a.same_cell(&b));
    }
}
