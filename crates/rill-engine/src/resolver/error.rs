//! Error types for semantic resolution

use crate::parser::token::Span;
use thiserror::Error;

/// Errors detected between parsing and execution.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolveErrorKind {
    #[error("Unknown variable '{name}'")]
    UnknownVariable { name: String },

    #[error("Unknown function '{name}'")]
    UnknownFunction { name: String },

    #[error("Unknown class '{name}'")]
    UnknownClass { name: String },

    #[error("Unknown method '{name}' for type {ty}")]
    UnknownMethod { name: String, ty: String },

    #[error("Unknown field '{name}' in class {class}")]
    UnknownField { name: String, class: String },

    #[error("Variable '{name}' already declared in this scope")]
    DuplicateSymbol { name: String, original: Span },

    #[error("Type mismatch: cannot convert {actual} to {expected}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Cyclic inheritance involving class '{name}'")]
    CyclicInheritance { name: String },

    #[error("Method '{name}' overrides a final method of class {base}")]
    FinalOverride { name: String, base: String },

    #[error("Closure cannot capture variable '{name}' declared after forward reference")]
    CaptureAfterForwardReference { name: String },

    #[error("Cannot assign to final variable '{name}'")]
    FinalAssignment { name: String },

    #[error("Wrong number of arguments to '{name}': expected {expected}, got {actual}")]
    ArgumentCount {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Missing value for mandatory parameter '{param}' of '{name}'")]
    MissingArgument { name: String, param: String },

    #[error("Cannot index a value of type {ty}")]
    BadIndexTarget { ty: String },

    #[error("Operator '{op}' cannot be applied to type {ty}")]
    BadOperandType { op: String, ty: String },

    #[error("'break' is only allowed inside a loop")]
    BreakOutsideLoop,

    #[error("'continue' is only allowed inside a loop")]
    ContinueOutsideLoop,

    #[error("Classes are only allowed at the top level or nested in another class")]
    ClassNotAllowedHere,

    #[error("Only one global regex match is allowed in a loop condition")]
    MultipleGlobalMatches,

    #[error("{message}")]
    Other { message: String },
}

/// A resolve error with source location.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveError {
    pub kind: ResolveErrorKind,
    pub span: Span,
}

impl ResolveError {
    pub fn new(kind: ResolveErrorKind, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn message(&self) -> String {
        self.kind.to_string()
    }
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.span.line, self.span.column, self.kind)
    }
}
