//! Rill front end - lexer and parser for the Rill scripting language.
//!
//! Lexical analysis produces a token vector with explicit EOL tokens;
//! the parser turns it into the AST of one compilation unit (a `Script`).

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod token;

pub use ast::{NodeId, Script};
pub use lexer::{LexError, Lexer};
pub use parser::{ParseError, Parser};
pub use token::{Span, StringPart, Token};

/// How the CLI wants the top-level statements wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopMode {
    /// Plain script: statements run once
    #[default]
    Off,
    /// `-n`: wrap in a read-line loop
    Loop,
    /// `-p`: wrap in a read-line loop and print `it` after each iteration
    LoopPrint,
}
