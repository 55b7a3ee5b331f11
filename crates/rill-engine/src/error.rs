//! Error surface of the engine: compile-time error collection and
//! runtime errors that unwind script frames.

use crate::parser::token::Span;
use thiserror::Error;

/// Runtime error kinds.
#[derive(Debug, Error, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum RuntimeErrorKind {
    #[error("Null value encountered {context}")]
    NullValue { context: String },

    #[error("Index {index} out of bounds for size {size}")]
    IndexOutOfBounds { index: i64, size: usize },

    #[error("Cannot convert {from} to {to}")]
    ConversionFailure { from: String, to: String },

    #[error("Missing mandatory field '{field}' for class {class}")]
    MissingField { field: String, class: String },

    #[error("No such method '{name}' for type {ty}")]
    MethodNotFound { name: String, ty: String },

    #[error("No such field '{name}' for type {ty}")]
    FieldNotFound { name: String, ty: String },

    #[error("Divide by zero")]
    DivideByZero,

    #[error("Call stack too deep")]
    StackOverflow,

    #[error("Operator '{op}' cannot be applied to {ty}")]
    BadOperand { op: String, ty: String },

    #[error("{message}")]
    InvalidArguments { message: String },

    #[error("Invalid regex: {message}")]
    BadRegex { message: String },

    #[error("{message}")]
    Died { message: String },

    #[error("Execution cancelled")]
    Cancelled,

    #[error("{message}")]
    Internal { message: String },
}

/// A runtime error together with where it happened.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub span: Option<Span>,
    /// Innermost-first function names at the point of the error
    pub script_stack: Vec<String>,
}

impl RuntimeError {
    pub fn new(kind: RuntimeErrorKind) -> Self {
        Self {
            kind,
            span: None,
            script_stack: Vec::new(),
        }
    }

    pub fn with_span(kind: RuntimeErrorKind, span: Span) -> Self {
        Self {
            kind,
            span: Some(span),
            script_stack: Vec::new(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(RuntimeErrorKind::Cancelled)
    }

    pub fn died(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::Died {
            message: message.into(),
        })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, RuntimeErrorKind::Cancelled)
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.span {
            Some(span) => write!(f, "{}:{}: {}", span.line, span.column, self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// One collected compile-time error (lex, parse, or resolve).
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub message: String,
    pub span: Span,
}

/// All errors from one compilation, renderable with source context.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileErrors {
    pub script_name: String,
    pub errors: Vec<CompileError>,
}

impl CompileErrors {
    pub fn new(script_name: impl Into<String>, errors: Vec<CompileError>) -> Self {
        Self {
            script_name: script_name.into(),
            errors,
        }
    }

    /// Render as `file:line:col: message` with a source line and caret.
    pub fn render(&self, source: &str) -> String {
        let lines: Vec<&str> = source.lines().collect();
        let mut out = String::new();
        for err in &self.errors {
            out.push_str(&format!(
                "{}:{}:{}: {}\n",
                self.script_name, err.span.line, err.span.column, err.message
            ));
            if err.span.line >= 1 {
                if let Some(line) = lines.get(err.span.line as usize - 1) {
                    out.push_str(line);
                    out.push('\n');
                    let col = err.span.column.max(1) as usize - 1;
                    out.push_str(&" ".repeat(col));
                    out.push_str("^\n");
                }
            }
        }
        out
    }
}

impl std::fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for err in &self.errors {
            writeln!(
                f,
                "{}:{}:{}: {}",
                self.script_name, err.span.line, err.span.column, err.message
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileErrors {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_with_caret() {
        let source = "def x = $\nmore";
        let errors = CompileErrors::new(
            "test.rill",
            vec![CompileError {
                message: "Unexpected character '$'".to_string(),
                span: Span::new(8, 9, 1, 9),
            }],
        );
        let rendered = errors.render(source);
        assert!(rendered.contains("test.rill:1:9: Unexpected character"));
        assert!(rendered.contains("def x = $"));
        assert!(rendered.lines().last().unwrap().ends_with('^'));
    }
}
