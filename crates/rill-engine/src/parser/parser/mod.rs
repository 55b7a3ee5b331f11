//! Recursive-descent parser for the Rill scripting language.
//!
//! Statements are terminated by `;`, a statement-level EOL, `}` or EOF.
//! Inside `(...)`/`[...]` groups EOL tokens are whitespace, so
//! `x` `\n` `[0]` is two statements at statement level but one indexing
//! expression inside parentheses.

mod expr;
mod stmt;

use crate::parser::ast::*;
use crate::parser::token::{Span, Token};
use crate::parser::LoopMode;
use thiserror::Error;

/// Maximum statement/expression nesting depth before the parser bails.
pub(crate) const MAX_PARSE_DEPTH: usize = 256;

/// Parse error kinds.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseErrorKind {
    #[error("Unexpected token {found} (expected {expected})")]
    UnexpectedToken { expected: String, found: String },
    #[error("{reason}")]
    InvalidSyntax { reason: String },
    #[error("Maximum nesting depth exceeded")]
    DepthExceeded,
}

/// A parse error with source location.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub span: Span,
    pub message: String,
}

impl ParseError {
    pub fn unexpected(expected: impl Into<String>, found: &Token, span: Span) -> Self {
        let expected = expected.into();
        let message = format!("Unexpected token '{}' (expected {})", found, expected);
        Self {
            kind: ParseErrorKind::UnexpectedToken {
                expected,
                found: found.to_string(),
            },
            span,
            message,
        }
    }

    pub fn invalid(reason: impl Into<String>, span: Span) -> Self {
        let reason = reason.into();
        Self {
            message: reason.clone(),
            kind: ParseErrorKind::InvalidSyntax { reason },
            span,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}: {}",
            self.span.line, self.span.column, self.message
        )
    }
}

/// Main parser structure.
pub struct Parser {
    tokens: Vec<(Token, Span)>,
    pos: usize,
    /// Nesting of `(`/`[` groups; EOL is whitespace when non-zero
    group_depth: usize,
    pub(crate) depth: usize,
    next_id: NodeId,
    errors: Vec<ParseError>,
}

impl Parser {
    pub fn new(tokens: Vec<(Token, Span)>) -> Self {
        Self {
            tokens,
            pos: 0,
            group_depth: 0,
            depth: 0,
            next_id: 0,
            errors: Vec::new(),
        }
    }

    fn with_start_id(tokens: Vec<(Token, Span)>, next_id: NodeId) -> Self {
        let mut parser = Self::new(tokens);
        parser.next_id = next_id;
        parser
    }

    pub(crate) fn new_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Parse a complete compilation unit.
    ///
    /// Top-level statements are wrapped in a synthesized `main` function;
    /// `BEGIN`/`END` blocks and the read-line loop are assembled here when
    /// a loop mode is active.
    pub fn parse_script(
        mut self,
        name: &str,
        loop_mode: LoopMode,
    ) -> Result<Script, Vec<ParseError>> {
        let script = stmt::parse_compilation_unit(&mut self, name, loop_mode);
        match script {
            Ok(script) if self.errors.is_empty() => Ok(script),
            Ok(_) => Err(self.errors),
            Err(err) => {
                self.errors.push(err);
                Err(self.errors)
            }
        }
    }

    /// Parse a token vector as a single expression (used for interpolated
    /// string segments). Shares the node-id counter with the caller.
    pub(crate) fn parse_embedded_expr(
        &mut self,
        tokens: Vec<(Token, Span)>,
        span: Span,
    ) -> Result<Expr, ParseError> {
        let mut sub = Parser::with_start_id(tokens, self.next_id);
        let result = expr::parse_expression(&mut sub);
        self.next_id = sub.next_id;
        self.errors.append(&mut sub.errors);
        match result {
            Ok(expr) => {
                if !sub.check(&Token::Eof) {
                    Err(ParseError::invalid(
                        "Unexpected trailing tokens in interpolated expression",
                        span,
                    ))
                } else {
                    Ok(expr)
                }
            }
            Err(err) => Err(err),
        }
    }

    // ------------------------------------------------------------------
    // Token navigation
    // ------------------------------------------------------------------

    /// Current token. Inside a group, EOL tokens are skipped first.
    pub(crate) fn current(&mut self) -> &Token {
        if self.group_depth > 0 {
            self.skip_eols();
        }
        &self.tokens[self.pos.min(self.tokens.len() - 1)].0
    }

    pub(crate) fn current_span(&self) -> Span {
        self.tokens[self.pos.min(self.tokens.len() - 1)].1
    }

    /// Peek `n` tokens ahead of the current one, skipping EOLs when inside
    /// a group.
    pub(crate) fn peek(&mut self, n: usize) -> &Token {
        if self.group_depth > 0 {
            self.skip_eols();
        }
        let mut idx = self.pos;
        let mut remaining = n;
        while remaining > 0 && idx + 1 < self.tokens.len() {
            idx += 1;
            if self.group_depth > 0 {
                while idx + 1 < self.tokens.len() && self.tokens[idx].0 == Token::Eol {
                    idx += 1;
                }
            }
            remaining -= 1;
        }
        &self.tokens[idx.min(self.tokens.len() - 1)].0
    }

    pub(crate) fn advance(&mut self) -> (Token, Span) {
        if self.group_depth > 0 {
            self.skip_eols();
        }
        let entry = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        entry
    }

    pub(crate) fn check(&mut self, token: &Token) -> bool {
        self.current() == token
    }

    pub(crate) fn expect(&mut self, token: &Token) -> Result<Span, ParseError> {
        if self.check(token) {
            Ok(self.advance().1)
        } else {
            let span = self.current_span();
            let found = self.current().clone();
            Err(ParseError::unexpected(token.to_string(), &found, span))
        }
    }

    /// Consume EOL tokens. Used inside groups and after infix operators,
    /// where a newline is a continuation, not a terminator.
    pub(crate) fn skip_eols(&mut self) {
        while self.pos < self.tokens.len() - 1 && self.tokens[self.pos].0 == Token::Eol {
            self.pos += 1;
        }
    }

    pub(crate) fn enter_group(&mut self) {
        self.group_depth += 1;
    }

    pub(crate) fn exit_group(&mut self) {
        self.group_depth = self.group_depth.saturating_sub(1);
    }

    /// Run `f` with grouping disabled (closure bodies inside `(...)` are
    /// statement contexts again).
    pub(crate) fn without_groups<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> T,
    ) -> T {
        let saved = self.group_depth;
        self.group_depth = 0;
        let result = f(self);
        self.group_depth = saved;
        result
    }

    pub(crate) fn record_error(&mut self, err: ParseError) {
        self.errors.push(err);
    }

    pub(crate) fn save_position(&self) -> usize {
        self.pos
    }

    pub(crate) fn restore_position(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Skip forward to a plausible statement boundary after an error.
    pub(crate) fn synchronize(&mut self) {
        loop {
            match &self.tokens[self.pos.min(self.tokens.len() - 1)].0 {
                Token::Eof => break,
                Token::Eol | Token::Semicolon => {
                    self.pos += 1;
                    break;
                }
                Token::RightBrace => break,
                _ => {
                    if self.pos >= self.tokens.len() - 1 {
                        break;
                    }
                    self.pos += 1;
                }
            }
        }
    }

    /// True when the current token terminates a statement.
    pub(crate) fn at_statement_end(&mut self) -> bool {
        matches!(
            self.tokens[self.pos.min(self.tokens.len() - 1)].0,
            Token::Eol | Token::Semicolon | Token::RightBrace | Token::Eof
        )
    }

    /// Consume a statement terminator (`;` or EOL); `}`/EOF are left for
    /// the caller.
    pub(crate) fn consume_statement_end(&mut self) -> Result<(), ParseError> {
        match &self.tokens[self.pos.min(self.tokens.len() - 1)].0 {
            Token::Semicolon | Token::Eol => {
                self.pos += 1;
                Ok(())
            }
            Token::RightBrace | Token::Eof => Ok(()),
            found => {
                let found = found.clone();
                let span = self.current_span();
                Err(ParseError::unexpected(
                    "end of statement",
                    &found,
                    span,
                ))
            }
        }
    }

    pub(crate) fn combine_spans(&self, a: &Span, b: &Span) -> Span {
        a.merge(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Lexer;

    fn parse(source: &str) -> Script {
        let tokens = Lexer::new(source).tokenize().expect("lex error");
        Parser::new(tokens)
            .parse_script("test", LoopMode::Off)
            .expect("parse error")
    }

    fn parse_err(source: &str) -> Vec<ParseError> {
        let tokens = Lexer::new(source).tokenize().expect("lex error");
        Parser::new(tokens)
            .parse_script("test", LoopMode::Off)
            .expect_err("expected parse error")
    }

    #[test]
    fn test_two_statements_vs_index() {
        // At statement level: two statements
        let script = parse("x\n[0]");
        assert_eq!(script.main.body.stmts.len(), 2);
        // Inside parentheses: one indexing expression
        let script = parse("(x\n[0])");
        assert_eq!(script.main.body.stmts.len(), 1);
        match &script.main.body.stmts[0].kind {
            StmtKind::Expr(e) => assert!(matches!(e.kind, ExprKind::Index { .. })),
            other => panic!("expected expression, got {:?}", other),
        }
    }

    #[test]
    fn test_function_declaration() {
        let script = parse("def fact(n) { n <= 1 ? 1 : n * fact(n - 1) }");
        assert!(matches!(
            script.main.body.stmts[0].kind,
            StmtKind::FunDecl(_)
        ));
    }

    #[test]
    fn test_postfix_if_lowers_to_if() {
        let script = parse("x = 1 if y");
        assert!(matches!(script.main.body.stmts[0].kind, StmtKind::If { .. }));
    }

    #[test]
    fn test_postfix_unless_negates() {
        let script = parse("return 2 unless y");
        match &script.main.body.stmts[0].kind {
            StmtKind::If { cond, .. } => {
                assert!(matches!(cond.kind, ExprKind::Prefix { op: PrefixOp::Not, .. }))
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_closure_with_params() {
        let script = parse("def f = { x, y -> x + y }");
        match &script.main.body.stmts[0].kind {
            StmtKind::VarDecl(decl) => match &decl.init.as_ref().unwrap().kind {
                ExprKind::Closure(fun) => assert_eq!(fun.params.len(), 2),
                other => panic!("expected closure, got {:?}", other),
            },
            other => panic!("expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn test_no_arg_closure() {
        let script = parse("def f = { -> 42 }");
        match &script.main.body.stmts[0].kind {
            StmtKind::VarDecl(decl) => match &decl.init.as_ref().unwrap().kind {
                ExprKind::Closure(fun) => assert!(fun.params.is_empty()),
                other => panic!("expected closure, got {:?}", other),
            },
            other => panic!("expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn test_implicit_it_closure() {
        let script = parse("xs.map { it * 2 }");
        match &script.main.body.stmts[0].kind {
            StmtKind::Expr(e) => match &e.kind {
                ExprKind::MethodCall { args, .. } => match &args[0].kind {
                    ExprKind::Closure(fun) => {
                        assert_eq!(fun.params.len(), 1);
                        assert_eq!(fun.params[0].name.name, "it");
                    }
                    other => panic!("expected closure, got {:?}", other),
                },
                other => panic!("expected method call, got {:?}", other),
            },
            other => panic!("expected expression, got {:?}", other),
        }
    }

    #[test]
    fn test_named_args_become_map_literal() {
        let script = parse("f(x: 1, y: 2)");
        match &script.main.body.stmts[0].kind {
            StmtKind::Expr(e) => match &e.kind {
                ExprKind::Call { args, .. } => {
                    assert_eq!(args.len(), 1);
                    assert!(matches!(
                        args[0].kind,
                        ExprKind::MapLiteral {
                            is_named_args: true,
                            ..
                        }
                    ));
                }
                other => panic!("expected call, got {:?}", other),
            },
            other => panic!("expected expression, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_map_literal() {
        let script = parse("def m = [:]");
        match &script.main.body.stmts[0].kind {
            StmtKind::VarDecl(decl) => assert!(matches!(
                decl.init.as_ref().unwrap().kind,
                ExprKind::MapLiteral { .. }
            )),
            other => panic!("expected var decl, got {:?}", other),
        }
    }

    #[test]
    fn test_class_declaration() {
        let script = parse("class Point { int x = 0\nint y = 0\nint sum() { x + y } }");
        assert_eq!(script.classes.len(), 1);
        assert_eq!(script.classes[0].fields.len(), 2);
        assert_eq!(script.classes[0].methods.len(), 1);
    }

    #[test]
    fn test_syntax_error_has_location() {
        let errs = parse_err("def f( { }");
        assert!(!errs.is_empty());
        assert!(errs[0].span.line >= 1);
    }

    #[test]
    fn test_concatenated_scripts_parse_identically() {
        let a = parse("x = 1");
        let b = parse("y = 2");
        let both = parse("x = 1\ny = 2");
        assert_eq!(both.main.body.stmts.len(), 2);
        // Structure matches the individually parsed statements
        assert_eq!(
            format!("{:?}", both.main.body.stmts[0].kind).replace(", id: 0", ""),
            format!("{:?}", a.main.body.stmts[0].kind).replace(", id: 0", "")
        );
        let _ = b;
    }

    #[test]
    fn test_begin_end_rejected_without_loop_mode() {
        let errs = parse_err("BEGIN { x = 1 }");
        assert!(errs[0].message.contains("BEGIN"));
    }
}
