//! Lexer for the Rill scripting language.
//!
//! Raw tokenization is driven by the logos library. A manual outer loop
//! owns position/line/column accounting and handles the pieces that need
//! context logos cannot express: newline tokens, the five string kinds,
//! interpolation, and the pattern-string-vs-division decision (a `/`
//! starts a pattern string only when the previous significant token
//! cannot end an expression).

use crate::parser::token::{Span, StringPart, Token};
use logos::Logos;
use thiserror::Error;
use unicode_xid::UnicodeXID;

/// Logos-based token enum for lexing.
///
/// Used internally for everything except newlines, strings, and pattern
/// strings; converted to the main Token enum after lexing.
#[derive(Logos, Debug, Clone, PartialEq)]
enum LogosToken {
    // Type keywords
    #[token("boolean")]
    Boolean,
    #[token("int")]
    Int,
    #[token("long")]
    Long,
    #[token("double")]
    Double,
    #[token("Decimal")]
    Decimal,
    #[token("String")]
    StringType,
    #[token("List")]
    ListType,
    #[token("Map")]
    MapType,
    #[token("def")]
    Def,
    #[token("var")]
    Var,
    #[token("void")]
    Void,

    #[token("class")]
    Class,
    #[token("extends")]
    Extends,
    #[token("final")]
    Final,
    #[token("import")]
    Import,

    #[token("if")]
    If,
    #[token("unless")]
    Unless,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("for")]
    For,
    #[token("do")]
    Do,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("return")]
    Return,

    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("not")]
    Not,

    #[token("new")]
    New,
    #[token("instanceof")]
    Instanceof,
    #[token("!instanceof")]
    BangInstanceof,
    #[token("in")]
    In,
    #[token("!in")]
    BangIn,
    #[token("as")]
    As,

    #[token("print")]
    Print,
    #[token("println")]
    Println,
    #[token("die")]
    Die,

    #[token("BEGIN")]
    Begin,
    #[token("END")]
    End,

    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,

    // Identifiers (must come after keywords)
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Identifier(String),

    // Regex capture variables
    #[regex(r"\$[0-9]+", |lex| lex.slice().to_string())]
    CaptureVar(String),

    // Numbers; classification and overflow checks happen in the outer loop
    #[regex(r"0[xX][0-9a-fA-F]+L?", |lex| lex.slice().to_string())]
    HexNumber(String),
    #[regex(r"0[bB][01]+L?", |lex| lex.slice().to_string())]
    BinNumber(String),
    #[regex(r"[0-9]+(\.[0-9]+)?[DL]?", |lex| lex.slice().to_string())]
    Number(String),

    // Operators (logos picks the longest match)
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("%%")]
    PercentPercent,
    #[token("++")]
    PlusPlus,
    #[token("--")]
    MinusMinus,
    #[token("!")]
    Bang,
    #[token("~")]
    Tilde,
    #[token("==")]
    EqualEqual,
    #[token("!=")]
    BangEqual,
    #[token("===")]
    TripleEqual,
    #[token("!==")]
    BangTripleEqual,
    #[token("<")]
    Less,
    #[token("<=")]
    LessEqual,
    #[token(">")]
    Greater,
    #[token(">=")]
    GreaterEqual,
    #[token("<=>")]
    Compare,
    #[token("=~")]
    MatchOp,
    #[token("!~")]
    NotMatchOp,
    #[token("&&")]
    AmpAmp,
    #[token("||")]
    PipePipe,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("<<")]
    LessLess,
    #[token(">>")]
    GreaterGreater,
    #[token(">>>")]
    GreaterGreaterGreater,
    #[token("=")]
    Equal,
    #[token("+=")]
    PlusEqual,
    #[token("-=")]
    MinusEqual,
    #[token("*=")]
    StarEqual,
    #[token("/=")]
    SlashEqual,
    #[token("%=")]
    PercentEqual,
    #[token("&=")]
    AmpEqual,
    #[token("|=")]
    PipeEqual,
    #[token("^=")]
    CaretEqual,
    #[token("<<=")]
    LessLessEqual,
    #[token(">>=")]
    GreaterGreaterEqual,
    #[token("?=")]
    QuestionEqual,
    #[token("?")]
    Question,
    #[token("?:")]
    QuestionColon,
    #[token("?.")]
    QuestionDot,
    #[token("?[")]
    QuestionLeftBracket,
    #[token(".")]
    Dot,
    #[token(":")]
    Colon,
    #[token("->")]
    Arrow,
    #[token("(")]
    LeftParen,
    #[token(")")]
    RightParen,
    #[token("{")]
    LeftBrace,
    #[token("}")]
    RightBrace,
    #[token("[")]
    LeftBracket,
    #[token("]")]
    RightBracket,
    #[token(";")]
    Semicolon,
    #[token(",")]
    Comma,
}

/// Lexer error types.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LexError {
    #[error("Unexpected character '{ch}'")]
    UnexpectedCharacter { ch: char, span: Span },
    #[error("Unterminated string")]
    UnterminatedString { span: Span },
    #[error("Unterminated pattern string")]
    UnterminatedPattern { span: Span },
    #[error("Unterminated comment")]
    UnterminatedComment { span: Span },
    #[error("New line not allowed inside single-line string")]
    NewlineInString { span: Span },
    #[error("Invalid escape sequence '\\{escape}'")]
    InvalidEscape { escape: char, span: Span },
    #[error("Number too large for int (use the L suffix for a long)")]
    IntOutOfRange { text: String, span: Span },
    #[error("Invalid numeric literal '{text}'")]
    InvalidNumber { text: String, span: Span },
    #[error("Unknown pattern modifier '{ch}' (expected one of i, g, m, s)")]
    InvalidPatternModifier { ch: char, span: Span },
    #[error("Unterminated interpolated expression")]
    UnterminatedInterpolation { span: Span },
}

impl LexError {
    pub fn span(&self) -> Span {
        match self {
            LexError::UnexpectedCharacter { span, .. }
            | LexError::UnterminatedString { span }
            | LexError::UnterminatedPattern { span }
            | LexError::UnterminatedComment { span }
            | LexError::NewlineInString { span }
            | LexError::InvalidEscape { span, .. }
            | LexError::IntOutOfRange { span, .. }
            | LexError::InvalidNumber { span, .. }
            | LexError::InvalidPatternModifier { span, .. }
            | LexError::UnterminatedInterpolation { span } => *span,
        }
    }
}

/// Base position of a (possibly nested) lexer within the outermost source.
///
/// Interpolated `${...}` segments are lexed recursively over the inner
/// slice; the base converts slice-relative positions into absolute spans.
#[derive(Debug, Clone, Copy)]
struct Base {
    offset: usize,
    line: u32,
    column: u32,
}

impl Base {
    fn root() -> Self {
        Self {
            offset: 0,
            line: 1,
            column: 1,
        }
    }
}

/// Main lexer structure.
pub struct Lexer<'a> {
    source: &'a str,
    tokens: Vec<(Token, Span)>,
    errors: Vec<LexError>,
    base: Base,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            tokens: Vec::new(),
            errors: Vec::new(),
            base: Base::root(),
        }
    }

    fn nested(source: &'a str, base: Base) -> Self {
        Self {
            source,
            tokens: Vec::new(),
            errors: Vec::new(),
            base,
        }
    }

    fn make_span(&self, start: usize, end: usize, line: u32, column: u32) -> Span {
        Span {
            start: self.base.offset + start,
            end: self.base.offset + end,
            line: self.base.line + line - 1,
            column: if line == 1 {
                self.base.column + column - 1
            } else {
                column
            },
        }
    }

    /// The last significant token (skipping EOL), used to decide whether
    /// `/` is division or the start of a pattern string.
    fn prev_significant(&self) -> Option<&Token> {
        self.tokens.iter().rev().map(|(t, _)| t).find(|t| **t != Token::Eol)
    }

    fn regex_position(&self) -> bool {
        match self.prev_significant() {
            Some(tok) => !tok.can_end_expression(),
            None => true,
        }
    }

    fn emit_eol(&mut self, span: Span) {
        if !matches!(self.tokens.last(), Some((Token::Eol, _)) | None) {
            self.tokens.push((Token::Eol, span));
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<(Token, Span)>, Vec<LexError>> {
        let bytes = self.source.as_bytes();
        let mut pos = 0;
        let mut line = 1u32;
        let mut column = 1u32;

        while pos < bytes.len() {
            let ch = bytes[pos];
            match ch {
                b' ' | b'\t' | b'\r' => {
                    pos += 1;
                    column += 1;
                }
                b'\n' => {
                    let span = self.make_span(pos, pos + 1, line, column);
                    self.emit_eol(span);
                    pos += 1;
                    line += 1;
                    column = 1;
                }
                b'/' if pos + 1 < bytes.len() && bytes[pos + 1] == b'/' => {
                    while pos < bytes.len() && bytes[pos] != b'\n' {
                        pos += 1;
                        column += 1;
                    }
                }
                b'/' if pos + 1 < bytes.len() && bytes[pos + 1] == b'*' => {
                    let start = pos;
                    let (start_line, start_col) = (line, column);
                    pos += 2;
                    column += 2;
                    let mut terminated = false;
                    while pos + 1 < bytes.len() {
                        if bytes[pos] == b'*' && bytes[pos + 1] == b'/' {
                            pos += 2;
                            column += 2;
                            terminated = true;
                            break;
                        }
                        if bytes[pos] == b'\n' {
                            line += 1;
                            column = 1;
                        } else {
                            column += 1;
                        }
                        pos += 1;
                    }
                    if !terminated {
                        let span = self.make_span(start, pos, start_line, start_col);
                        self.errors.push(LexError::UnterminatedComment { span });
                        break;
                    }
                }
                b'\'' => {
                    pos = self.lex_single_string(pos, &mut line, &mut column);
                }
                b'"' => {
                    pos = self.lex_double_string(pos, &mut line, &mut column);
                }
                b'/' if self.regex_position() => {
                    pos = self.lex_pattern_string(pos, &mut line, &mut column);
                }
                b's' if pos + 1 < bytes.len()
                    && bytes[pos + 1] == b'/'
                    && matches!(
                        self.prev_significant(),
                        Some(Token::MatchOp) | Some(Token::NotMatchOp)
                    ) =>
                {
                    pos = self.lex_subst_string(pos, &mut line, &mut column);
                }
                _ => {
                    pos = self.lex_with_logos(pos, &mut line, &mut column);
                }
            }
        }

        let eof_span = self.make_span(self.source.len(), self.source.len(), line, column);
        self.tokens.push((Token::Eof, eof_span));

        if self.errors.is_empty() {
            Ok(self.tokens)
        } else {
            Err(self.errors)
        }
    }

    /// Run logos over the remaining source and take a single token.
    fn lex_with_logos(&mut self, pos: usize, line: &mut u32, column: &mut u32) -> usize {
        let mut logos_lexer = LogosToken::lexer(&self.source[pos..]);
        let Some(token_result) = logos_lexer.next() else {
            return self.source.len();
        };
        let range = logos_lexer.span();
        let abs_start = pos + range.start;
        let abs_end = pos + range.end;
        let span = self.make_span(abs_start, abs_end, *line, *column);

        match token_result {
            Ok(logos_token) => {
                if let Some(token) = self.convert_token(logos_token, span) {
                    self.tokens.push((token, span));
                }
            }
            Err(_) => {
                let ch = self.source[abs_start..].chars().next().unwrap_or('\0');
                self.errors.push(LexError::UnexpectedCharacter { ch, span });
            }
        }

        self.advance_position(abs_start, abs_end, line, column);
        abs_end
    }

    fn advance_position(&self, start: usize, end: usize, line: &mut u32, column: &mut u32) {
        for c in self.source[start..end].chars() {
            if c == '\n' {
                *line += 1;
                *column = 1;
            } else {
                *column += 1;
            }
        }
    }

    /// Convert a logos token, classifying numeric literals. Returns None
    /// when the literal is invalid (an error has been recorded).
    fn convert_token(&mut self, logos_token: LogosToken, span: Span) -> Option<Token> {
        let token = match logos_token {
            LogosToken::Boolean => Token::Boolean,
            LogosToken::Int => Token::Int,
            LogosToken::Long => Token::Long,
            LogosToken::Double => Token::Double,
            LogosToken::Decimal => Token::Decimal,
            LogosToken::StringType => Token::StringType,
            LogosToken::ListType => Token::ListType,
            LogosToken::MapType => Token::MapType,
            LogosToken::Def => Token::Def,
            LogosToken::Var => Token::Var,
            LogosToken::Void => Token::Void,
            LogosToken::Class => Token::Class,
            LogosToken::Extends => Token::Extends,
            LogosToken::Final => Token::Final,
            LogosToken::Import => Token::Import,
            LogosToken::If => Token::If,
            LogosToken::Unless => Token::Unless,
            LogosToken::Else => Token::Else,
            LogosToken::While => Token::While,
            LogosToken::For => Token::For,
            LogosToken::Do => Token::Do,
            LogosToken::Break => Token::Break,
            LogosToken::Continue => Token::Continue,
            LogosToken::Return => Token::Return,
            LogosToken::And => Token::And,
            LogosToken::Or => Token::Or,
            LogosToken::Not => Token::Not,
            LogosToken::New => Token::New,
            LogosToken::Instanceof => Token::Instanceof,
            LogosToken::BangInstanceof => Token::BangInstanceof,
            LogosToken::In => Token::In,
            LogosToken::BangIn => Token::BangIn,
            LogosToken::As => Token::As,
            LogosToken::Print => Token::Print,
            LogosToken::Println => Token::Println,
            LogosToken::Die => Token::Die,
            LogosToken::Begin => Token::Begin,
            LogosToken::End => Token::End,
            LogosToken::True => Token::True,
            LogosToken::False => Token::False,
            LogosToken::Null => Token::Null,
            LogosToken::Identifier(name) => Token::Identifier(name),
            LogosToken::CaptureVar(text) => match text[1..].parse::<u32>() {
                Ok(n) => Token::CaptureVar(n),
                Err(_) => {
                    self.errors.push(LexError::InvalidNumber { text, span });
                    return None;
                }
            },
            LogosToken::HexNumber(text) => return self.convert_radix_number(&text, 16, span),
            LogosToken::BinNumber(text) => return self.convert_radix_number(&text, 2, span),
            LogosToken::Number(text) => return self.convert_decimal_number(&text, span),
            LogosToken::Plus => Token::Plus,
            LogosToken::Minus => Token::Minus,
            LogosToken::Star => Token::Star,
            LogosToken::Slash => Token::Slash,
            LogosToken::Percent => Token::Percent,
            LogosToken::PercentPercent => Token::PercentPercent,
            LogosToken::PlusPlus => Token::PlusPlus,
            LogosToken::MinusMinus => Token::MinusMinus,
            LogosToken::Bang => Token::Bang,
            LogosToken::Tilde => Token::Tilde,
            LogosToken::EqualEqual => Token::EqualEqual,
            LogosToken::BangEqual => Token::BangEqual,
            LogosToken::TripleEqual => Token::TripleEqual,
            LogosToken::BangTripleEqual => Token::BangTripleEqual,
            LogosToken::Less => Token::Less,
            LogosToken::LessEqual => Token::LessEqual,
            LogosToken::Greater => Token::Greater,
            LogosToken::GreaterEqual => Token::GreaterEqual,
            LogosToken::Compare => Token::Compare,
            LogosToken::MatchOp => Token::MatchOp,
            LogosToken::NotMatchOp => Token::NotMatchOp,
            LogosToken::AmpAmp => Token::AmpAmp,
            LogosToken::PipePipe => Token::PipePipe,
            LogosToken::Amp => Token::Amp,
            LogosToken::Pipe => Token::Pipe,
            LogosToken::Caret => Token::Caret,
            LogosToken::LessLess => Token::LessLess,
            LogosToken::GreaterGreater => Token::GreaterGreater,
            LogosToken::GreaterGreaterGreater => Token::GreaterGreaterGreater,
            LogosToken::Equal => Token::Equal,
            LogosToken::PlusEqual => Token::PlusEqual,
            LogosToken::MinusEqual => Token::MinusEqual,
            LogosToken::StarEqual => Token::StarEqual,
            LogosToken::SlashEqual => Token::SlashEqual,
            LogosToken::PercentEqual => Token::PercentEqual,
            LogosToken::AmpEqual => Token::AmpEqual,
            LogosToken::PipeEqual => Token::PipeEqual,
            LogosToken::CaretEqual => Token::CaretEqual,
            LogosToken::LessLessEqual => Token::LessLessEqual,
            LogosToken::GreaterGreaterEqual => Token::GreaterGreaterEqual,
            LogosToken::QuestionEqual => Token::QuestionEqual,
            LogosToken::Question => Token::Question,
            LogosToken::QuestionColon => Token::QuestionColon,
            LogosToken::QuestionDot => Token::QuestionDot,
            LogosToken::QuestionLeftBracket => Token::QuestionLeftBracket,
            LogosToken::Dot => Token::Dot,
            LogosToken::Colon => Token::Colon,
            LogosToken::Arrow => Token::Arrow,
            LogosToken::LeftParen => Token::LeftParen,
            LogosToken::RightParen => Token::RightParen,
            LogosToken::LeftBrace => Token::LeftBrace,
            LogosToken::RightBrace => Token::RightBrace,
            LogosToken::LeftBracket => Token::LeftBracket,
            LogosToken::RightBracket => Token::RightBracket,
            LogosToken::Semicolon => Token::Semicolon,
            LogosToken::Comma => Token::Comma,
        };
        Some(token)
    }

    fn convert_radix_number(&mut self, text: &str, radix: u32, span: Span) -> Option<Token> {
        let is_long = text.ends_with('L');
        let digits = &text[2..text.len() - usize::from(is_long)];
        if is_long {
            match u64::from_str_radix(digits, radix) {
                Ok(n) => Some(Token::LongLiteral(n as i64)),
                Err(_) => {
                    self.errors.push(LexError::InvalidNumber {
                        text: text.to_string(),
                        span,
                    });
                    None
                }
            }
        } else {
            match u32::from_str_radix(digits, radix) {
                Ok(n) => Some(Token::IntLiteral(n as i32)),
                Err(_) => {
                    self.errors.push(LexError::IntOutOfRange {
                        text: text.to_string(),
                        span,
                    });
                    None
                }
            }
        }
    }

    fn convert_decimal_number(&mut self, text: &str, span: Span) -> Option<Token> {
        if let Some(digits) = text.strip_suffix('L') {
            if digits.contains('.') {
                self.errors.push(LexError::InvalidNumber {
                    text: text.to_string(),
                    span,
                });
                return None;
            }
            return match digits.parse::<i64>() {
                Ok(n) => Some(Token::LongLiteral(n)),
                Err(_) => {
                    self.errors.push(LexError::InvalidNumber {
                        text: text.to_string(),
                        span,
                    });
                    None
                }
            };
        }
        if let Some(digits) = text.strip_suffix('D') {
            return match digits.parse::<f64>() {
                Ok(n) => Some(Token::DoubleLiteral(n)),
                Err(_) => {
                    self.errors.push(LexError::InvalidNumber {
                        text: text.to_string(),
                        span,
                    });
                    None
                }
            };
        }
        if text.contains('.') {
            return Some(Token::DecimalLiteral(text.to_string()));
        }
        match text.parse::<i64>() {
            Ok(n) if n <= i32::MAX as i64 => Some(Token::IntLiteral(n as i32)),
            Ok(_) | Err(_) => {
                self.errors.push(LexError::IntOutOfRange {
                    text: text.to_string(),
                    span,
                });
                None
            }
        }
    }

    /// Lex a single-quoted (or triple-single-quoted) string: no
    /// interpolation, backslash escapes.
    fn lex_single_string(&mut self, start: usize, line: &mut u32, column: &mut u32) -> usize {
        let bytes = self.source.as_bytes();
        let (start_line, start_col) = (*line, *column);
        let triple = self.source[start..].starts_with("'''");
        let open_len = if triple { 3 } else { 1 };
        let mut pos = start + open_len;
        let mut value = String::new();

        loop {
            if pos >= bytes.len() {
                let span = self.make_span(start, pos, start_line, start_col);
                self.errors.push(LexError::UnterminatedString { span });
                break;
            }
            if (triple && self.source[pos..].starts_with("'''"))
                || (!triple && bytes[pos] == b'\'')
            {
                pos += open_len;
                let span = self.make_span(start, pos, start_line, start_col);
                self.tokens.push((Token::StringLiteral(value), span));
                break;
            }
            if bytes[pos] == b'\n' && !triple {
                let span = self.make_span(start, pos, start_line, start_col);
                self.errors.push(LexError::NewlineInString { span });
                break;
            }
            if bytes[pos] == b'\\' && pos + 1 < bytes.len() {
                let esc = self.source[pos + 1..].chars().next().unwrap_or('\0');
                match self.unescape(esc) {
                    Some(c) => value.push(c),
                    None => {
                        let span = self.make_span(pos, pos + 2, start_line, start_col);
                        self.errors.push(LexError::InvalidEscape { escape: esc, span });
                    }
                }
                pos += 1 + esc.len_utf8();
            } else {
                let c = self.source[pos..].chars().next().unwrap_or('\0');
                value.push(c);
                pos += c.len_utf8();
            }
        }

        self.advance_position(start, pos.min(self.source.len()), line, column);
        pos
    }

    fn unescape(&self, esc: char) -> Option<char> {
        match esc {
            'n' => Some('\n'),
            't' => Some('\t'),
            'r' => Some('\r'),
            'b' => Some('\u{8}'),
            'f' => Some('\u{c}'),
            '0' => Some('\0'),
            '\\' => Some('\\'),
            '\'' => Some('\''),
            '"' => Some('"'),
            '$' => Some('$'),
            '/' => Some('/'),
            _ => None,
        }
    }

    /// Lex a double-quoted (or triple-double-quoted) interpolated string.
    fn lex_double_string(&mut self, start: usize, line: &mut u32, column: &mut u32) -> usize {
        let (start_line, start_col) = (*line, *column);
        let triple = self.source[start..].starts_with("\"\"\"");
        let open_len = if triple { 3 } else { 1 };
        let close: &str = if triple { "\"\"\"" } else { "\"" };

        match self.lex_interpolated(start + open_len, close, !triple, false, *line, *column) {
            Ok((parts, end_pos)) => {
                let span = self.make_span(start, end_pos, start_line, start_col);
                let token = Self::string_token(parts);
                self.tokens.push((token, span));
                self.advance_position(start, end_pos, line, column);
                end_pos
            }
            Err(err) => {
                self.errors.push(err);
                self.advance_position(start, self.source.len(), line, column);
                self.source.len()
            }
        }
    }

    /// Collapse a parts list to a plain string literal when nothing is
    /// interpolated.
    fn string_token(mut parts: Vec<StringPart>) -> Token {
        let interpolated = parts.iter().any(|p| matches!(p, StringPart::Expr(_)));
        if interpolated {
            Token::ExprString(parts)
        } else {
            match parts.pop() {
                Some(StringPart::Literal(s)) if parts.is_empty() => Token::StringLiteral(s),
                Some(part) => {
                    parts.push(part);
                    Token::ExprString(parts)
                }
                None => Token::StringLiteral(String::new()),
            }
        }
    }

    /// Lex a `/pattern/mods` string. The payload is passed through
    /// verbatim (only `\/` is unescaped) so the regex engine sees the
    /// same escapes the author wrote. Pattern strings may span lines.
    fn lex_pattern_string(&mut self, start: usize, line: &mut u32, column: &mut u32) -> usize {
        let (start_line, start_col) = (*line, *column);
        match self.lex_interpolated(start + 1, "/", false, true, *line, *column) {
            Ok((parts, after_slash)) => {
                let (modifiers, end_pos) = self.lex_modifiers(after_slash, start_line, start_col);
                let span = self.make_span(start, end_pos, start_line, start_col);
                self.tokens
                    .push((Token::PatternString { parts, modifiers }, span));
                self.advance_position(start, end_pos, line, column);
                end_pos
            }
            Err(_) => {
                let span = self.make_span(start, self.source.len(), start_line, start_col);
                self.errors.push(LexError::UnterminatedPattern { span });
                self.advance_position(start, self.source.len(), line, column);
                self.source.len()
            }
        }
    }

    /// Lex `s/pattern/replacement/mods` after `=~` or `!~`.
    fn lex_subst_string(&mut self, start: usize, line: &mut u32, column: &mut u32) -> usize {
        let (start_line, start_col) = (*line, *column);
        let pattern = self.lex_interpolated(start + 2, "/", false, true, *line, *column);
        let (pattern, after_pattern) = match pattern {
            Ok(ok) => ok,
            Err(_) => {
                let span = self.make_span(start, self.source.len(), start_line, start_col);
                self.errors.push(LexError::UnterminatedPattern { span });
                self.advance_position(start, self.source.len(), line, column);
                return self.source.len();
            }
        };
        let replacement = self.lex_interpolated(after_pattern, "/", false, true, *line, *column);
        let (replacement, after_repl) = match replacement {
            Ok(ok) => ok,
            Err(_) => {
                let span = self.make_span(start, self.source.len(), start_line, start_col);
                self.errors.push(LexError::UnterminatedPattern { span });
                self.advance_position(start, self.source.len(), line, column);
                return self.source.len();
            }
        };
        let (modifiers, end_pos) = self.lex_modifiers(after_repl, start_line, start_col);
        let span = self.make_span(start, end_pos, start_line, start_col);
        self.tokens.push((
            Token::SubstString {
                pattern,
                replacement,
                modifiers,
            },
            span,
        ));
        self.advance_position(start, end_pos, line, column);
        end_pos
    }

    fn lex_modifiers(&mut self, mut pos: usize, err_line: u32, err_col: u32) -> (String, usize) {
        let bytes = self.source.as_bytes();
        let mut modifiers = String::new();
        while pos < bytes.len() && bytes[pos].is_ascii_lowercase() {
            let ch = bytes[pos] as char;
            if matches!(ch, 'i' | 'g' | 'm' | 's') {
                modifiers.push(ch);
                pos += 1;
            } else {
                let span = self.make_span(pos, pos + 1, err_line, err_col);
                self.errors.push(LexError::InvalidPatternModifier { ch, span });
                pos += 1;
            }
        }
        (modifiers, pos)
    }

    /// Shared scanner for interpolated payloads (double-quoted strings,
    /// pattern strings, substitution parts).
    ///
    /// `raw` mode keeps backslash escapes verbatim except `\/` and `\$`
    /// (pattern strings); otherwise the usual escapes apply.
    fn lex_interpolated(
        &mut self,
        start: usize,
        close: &str,
        single_line: bool,
        raw: bool,
        start_line: u32,
        start_col: u32,
    ) -> Result<(Vec<StringPart>, usize), LexError> {
        let bytes = self.source.as_bytes();
        let mut parts: Vec<StringPart> = Vec::new();
        let mut literal = String::new();
        let mut pos = start;
        // Line/column of the current position, tracked for nested spans.
        // The opener is ASCII, so its column width equals its byte width.
        let mut cur_line = start_line;
        let mut cur_col = start_col + close.len() as u32;

        loop {
            if pos >= bytes.len() {
                let span = self.make_span(start, pos, start_line, start_col);
                return Err(LexError::UnterminatedString { span });
            }
            if self.source[pos..].starts_with(close) {
                if !literal.is_empty() || parts.is_empty() {
                    parts.push(StringPart::Literal(literal));
                }
                return Ok((parts, pos + close.len()));
            }
            let c = self.source[pos..].chars().next().unwrap_or('\0');
            if c == '\n' {
                if single_line {
                    let span = self.make_span(start, pos, start_line, start_col);
                    return Err(LexError::NewlineInString { span });
                }
                literal.push('\n');
                pos += 1;
                cur_line += 1;
                cur_col = 1;
                continue;
            }
            if c == '\\' && pos + 1 < bytes.len() {
                let esc = self.source[pos + 1..].chars().next().unwrap_or('\0');
                if raw {
                    // Pattern payloads go to the regex engine untouched;
                    // only the delimiter escape is consumed. `\$` stays
                    // a regex-escaped dollar (and suppresses
                    // interpolation).
                    match esc {
                        '/' => literal.push('/'),
                        _ => {
                            literal.push('\\');
                            literal.push(esc);
                        }
                    }
                } else {
                    match self.unescape(esc) {
                        Some(ch) => literal.push(ch),
                        None => {
                            let span = self.make_span(pos, pos + 2, cur_line, cur_col);
                            self.errors.push(LexError::InvalidEscape { escape: esc, span });
                        }
                    }
                }
                pos += 1 + esc.len_utf8();
                cur_col += 2;
                continue;
            }
            if c == '$' {
                let rest = &self.source[pos + 1..];
                let next = rest.chars().next();
                match next {
                    Some('{') => {
                        let expr_start = pos + 2;
                        let Some(expr_end) = self.find_interp_end(expr_start) else {
                            let span = self.make_span(pos, self.source.len(), cur_line, cur_col);
                            return Err(LexError::UnterminatedInterpolation { span });
                        };
                        if !literal.is_empty() {
                            parts.push(StringPart::Literal(std::mem::take(&mut literal)));
                        }
                        let inner = &self.source[expr_start..expr_end];
                        let inner_base = Base {
                            offset: self.base.offset + expr_start,
                            line: self.base.line + cur_line - 1,
                            column: if cur_line == 1 {
                                self.base.column + cur_col + 1
                            } else {
                                cur_col + 2
                            },
                        };
                        match Lexer::nested(inner, inner_base).tokenize() {
                            Ok(tokens) => parts.push(StringPart::Expr(tokens)),
                            Err(mut errs) => self.errors.append(&mut errs),
                        }
                        self.advance_position(pos, expr_end + 1, &mut cur_line, &mut cur_col);
                        pos = expr_end + 1;
                        continue;
                    }
                    Some(d) if d.is_ascii_digit() => {
                        let digits: String =
                            rest.chars().take_while(|c| c.is_ascii_digit()).collect();
                        if !literal.is_empty() {
                            parts.push(StringPart::Literal(std::mem::take(&mut literal)));
                        }
                        let span = self.make_span(pos, pos + 1 + digits.len(), cur_line, cur_col);
                        let n: u32 = digits.parse().unwrap_or(0);
                        let eof = self.make_span(
                            pos + 1 + digits.len(),
                            pos + 1 + digits.len(),
                            cur_line,
                            cur_col,
                        );
                        parts.push(StringPart::Expr(vec![
                            (Token::CaptureVar(n), span),
                            (Token::Eof, eof),
                        ]));
                        pos += 1 + digits.len();
                        cur_col += 1 + digits.len() as u32;
                        continue;
                    }
                    Some(i) if i.is_xid_start() || i == '_' => {
                        let ident: String = rest
                            .chars()
                            .take_while(|c| c.is_xid_continue() || *c == '_')
                            .collect();
                        if !literal.is_empty() {
                            parts.push(StringPart::Literal(std::mem::take(&mut literal)));
                        }
                        let span = self.make_span(pos + 1, pos + 1 + ident.len(), cur_line, cur_col);
                        let eof = self.make_span(
                            pos + 1 + ident.len(),
                            pos + 1 + ident.len(),
                            cur_line,
                            cur_col,
                        );
                        parts.push(StringPart::Expr(vec![
                            (Token::Identifier(ident.clone()), span),
                            (Token::Eof, eof),
                        ]));
                        pos += 1 + ident.len();
                        cur_col += 1 + ident.len() as u32;
                        continue;
                    }
                    _ => {
                        literal.push('$');
                        pos += 1;
                        cur_col += 1;
                        continue;
                    }
                }
            }
            literal.push(c);
            pos += c.len_utf8();
            cur_col += 1;
        }
    }

    /// Find the `}` closing a `${` interpolation, skipping nested braces
    /// and quoted strings.
    fn find_interp_end(&self, start: usize) -> Option<usize> {
        let bytes = self.source.as_bytes();
        let mut depth = 1usize;
        let mut pos = start;
        while pos < bytes.len() {
            match bytes[pos] {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(pos);
                    }
                }
                quote @ (b'\'' | b'"') => {
                    pos += 1;
                    while pos < bytes.len() && bytes[pos] != quote {
                        if bytes[pos] == b'\\' {
                            pos += 1;
                        }
                        pos += 1;
                    }
                }
                b'\\' => pos += 1,
                _ => {}
            }
            pos += 1;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<Token> {
        Lexer::new(source)
            .tokenize()
            .expect("lexing failed")
            .into_iter()
            .map(|(t, _)| t)
            .collect()
    }

    #[test]
    fn test_keywords_and_identifiers() {
        let tokens = lex("def x = y");
        assert_eq!(
            tokens,
            vec![
                Token::Def,
                Token::Identifier("x".to_string()),
                Token::Equal,
                Token::Identifier("y".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_numeric_classification() {
        assert_eq!(lex("42")[0], Token::IntLiteral(42));
        assert_eq!(lex("42L")[0], Token::LongLiteral(42));
        assert_eq!(lex("4.2D")[0], Token::DoubleLiteral(4.2));
        assert_eq!(lex("4.2")[0], Token::DecimalLiteral("4.2".to_string()));
        assert_eq!(lex("0xFF")[0], Token::IntLiteral(255));
        assert_eq!(lex("0b101")[0], Token::IntLiteral(5));
        assert_eq!(lex("0xFFFFFFFF")[0], Token::IntLiteral(-1));
    }

    #[test]
    fn test_int_overflow_is_an_error() {
        let errs = Lexer::new("2147483648").tokenize().unwrap_err();
        assert!(matches!(errs[0], LexError::IntOutOfRange { .. }));
        // Boundary value still fits
        assert_eq!(lex("2147483647")[0], Token::IntLiteral(2147483647));
    }

    #[test]
    fn test_eol_tokens_outside_strings() {
        let tokens = lex("x\ny");
        assert_eq!(
            tokens,
            vec![
                Token::Identifier("x".to_string()),
                Token::Eol,
                Token::Identifier("y".to_string()),
                Token::Eof,
            ]
        );
        // Runs of newlines collapse to one EOL
        assert_eq!(lex("x\n\n\ny").len(), 4);
    }

    #[test]
    fn test_single_quoted_string() {
        assert_eq!(
            lex(r"'a\nb'")[0],
            Token::StringLiteral("a\nb".to_string())
        );
    }

    #[test]
    fn test_interpolated_string() {
        let tokens = lex(r#""a${x}b""#);
        match &tokens[0] {
            Token::ExprString(parts) => {
                assert_eq!(parts.len(), 3);
                assert_eq!(parts[0], StringPart::Literal("a".to_string()));
                match &parts[1] {
                    StringPart::Expr(toks) => {
                        assert_eq!(toks[0].0, Token::Identifier("x".to_string()))
                    }
                    other => panic!("expected expr part, got {:?}", other),
                }
                assert_eq!(parts[2], StringPart::Literal("b".to_string()));
            }
            other => panic!("expected expr string, got {:?}", other),
        }
    }

    #[test]
    fn test_dollar_ident_interpolation() {
        let tokens = lex(r#""hello $name!""#);
        match &tokens[0] {
            Token::ExprString(parts) => {
                assert_eq!(parts[0], StringPart::Literal("hello ".to_string()));
                match &parts[1] {
                    StringPart::Expr(toks) => {
                        assert_eq!(toks[0].0, Token::Identifier("name".to_string()))
                    }
                    other => panic!("expected expr part, got {:?}", other),
                }
                assert_eq!(parts[2], StringPart::Literal("!".to_string()));
            }
            other => panic!("expected expr string, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_double_quoted_collapses_to_literal() {
        assert_eq!(lex(r#""abc""#)[0], Token::StringLiteral("abc".to_string()));
    }

    #[test]
    fn test_pattern_vs_division() {
        // After an identifier, `/` is division
        let tokens = lex("x / 2");
        assert_eq!(tokens[1], Token::Slash);
        // After `=~`, `/` opens a pattern string
        let tokens = lex(r"x =~ /ab\d/i");
        match &tokens[2] {
            Token::PatternString { parts, modifiers } => {
                assert_eq!(parts[0], StringPart::Literal("ab\\d".to_string()));
                assert_eq!(modifiers, "i");
            }
            other => panic!("expected pattern string, got {:?}", other),
        }
    }

    #[test]
    fn test_subst_string() {
        let tokens = lex("x =~ s/ab/cd/g");
        match &tokens[2] {
            Token::SubstString {
                pattern,
                replacement,
                modifiers,
            } => {
                assert_eq!(pattern[0], StringPart::Literal("ab".to_string()));
                assert_eq!(replacement[0], StringPart::Literal("cd".to_string()));
                assert_eq!(modifiers, "g");
            }
            other => panic!("expected subst string, got {:?}", other),
        }
    }

    #[test]
    fn test_capture_var() {
        assert_eq!(lex("$1")[0], Token::CaptureVar(1));
    }

    #[test]
    fn test_tokenization_is_deterministic() {
        let source = "def f(x) { x * 2 }\nf(21)";
        let first = Lexer::new(source).tokenize().unwrap();
        let second = Lexer::new(source).tokenize().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unterminated_string() {
        let errs = Lexer::new("'abc").tokenize().unwrap_err();
        assert!(matches!(errs[0], LexError::UnterminatedString { .. }));
    }

    #[test]
    fn test_comments_are_skipped() {
        let tokens = lex("x // comment\n/* block\ncomment */ y");
        assert_eq!(
            tokens,
            vec![
                Token::Identifier("x".to_string()),
                Token::Eol,
                Token::Identifier("y".to_string()),
                Token::Eof,
            ]
        );
    }
}
