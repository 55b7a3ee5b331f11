//! Expression parsing
//!
//! Precedence-climbing over a fixed operator table. Word operators
//! (`or`, `and`, `not`) bind looser than assignment, which binds looser
//! than the ternary/elvis level; everything below that is table-driven.

use super::{ParseError, Parser, MAX_PARSE_DEPTH};
use crate::parser::ast::*;
use crate::parser::token::{StringPart, Token};

/// Parse a full expression.
pub(crate) fn parse_expression(parser: &mut Parser) -> Result<Expr, ParseError> {
    parser.depth += 1;
    if parser.depth > MAX_PARSE_DEPTH {
        parser.depth -= 1;
        return Err(ParseError::invalid(
            "Maximum nesting depth exceeded in expression",
            parser.current_span(),
        ));
    }
    let result = parse_or_keyword(parser);
    parser.depth -= 1;
    result
}

fn parse_or_keyword(parser: &mut Parser) -> Result<Expr, ParseError> {
    let mut lhs = parse_and_keyword(parser)?;
    while parser.check(&Token::Or) {
        parser.advance();
        parser.skip_eols();
        let rhs = parse_and_keyword(parser)?;
        lhs = make_binary(parser, BinOp::Or, lhs, rhs);
    }
    Ok(lhs)
}

fn parse_and_keyword(parser: &mut Parser) -> Result<Expr, ParseError> {
    let mut lhs = parse_not_keyword(parser)?;
    while parser.check(&Token::And) {
        parser.advance();
        parser.skip_eols();
        let rhs = parse_not_keyword(parser)?;
        lhs = make_binary(parser, BinOp::And, lhs, rhs);
    }
    Ok(lhs)
}

fn parse_not_keyword(parser: &mut Parser) -> Result<Expr, ParseError> {
    if parser.check(&Token::Not) {
        let (_, span) = parser.advance();
        parser.skip_eols();
        let operand = parse_not_keyword(parser)?;
        let span = parser.combine_spans(&span, &operand.span);
        return Ok(Expr {
            id: parser.new_id(),
            span,
            kind: ExprKind::Prefix {
                op: PrefixOp::Not,
                expr: Box::new(operand),
            },
        });
    }
    parse_assignment(parser)
}

fn assignment_op(token: &Token) -> Option<(Option<BinOp>, bool)> {
    match token {
        Token::Equal => Some((None, false)),
        Token::QuestionEqual => Some((None, true)),
        Token::PlusEqual => Some((Some(BinOp::Add), false)),
        Token::MinusEqual => Some((Some(BinOp::Sub), false)),
        Token::StarEqual => Some((Some(BinOp::Mul), false)),
        Token::SlashEqual => Some((Some(BinOp::Div), false)),
        Token::PercentEqual => Some((Some(BinOp::Mod), false)),
        Token::AmpEqual => Some((Some(BinOp::BitAnd), false)),
        Token::PipeEqual => Some((Some(BinOp::BitOr), false)),
        Token::CaretEqual => Some((Some(BinOp::BitXor), false)),
        Token::LessLessEqual => Some((Some(BinOp::Shl), false)),
        Token::GreaterGreaterEqual => Some((Some(BinOp::Shr), false)),
        _ => None,
    }
}

fn parse_assignment(parser: &mut Parser) -> Result<Expr, ParseError> {
    let lhs = parse_ternary(parser)?;
    let Some((op, conditional)) = assignment_op(parser.current()) else {
        return Ok(lhs);
    };
    if !lhs.is_assignable() {
        return Err(ParseError::invalid(
            "Invalid assignment target",
            lhs.span,
        ));
    }
    parser.advance();
    parser.skip_eols();
    let value = parse_assignment(parser)?;
    let span = parser.combine_spans(&lhs.span, &value.span);
    Ok(Expr {
        id: parser.new_id(),
        span,
        kind: ExprKind::Assign {
            target: Box::new(lhs),
            value: Box::new(value),
            op,
            conditional,
        },
    })
}

fn parse_ternary(parser: &mut Parser) -> Result<Expr, ParseError> {
    let cond = parse_binary(parser, 1)?;
    if parser.check(&Token::Question) {
        parser.advance();
        parser.skip_eols();
        let then_expr = parse_ternary(parser)?;
        parser.skip_eols();
        parser.expect(&Token::Colon)?;
        parser.skip_eols();
        let else_expr = parse_ternary(parser)?;
        let span = parser.combine_spans(&cond.span, &else_expr.span);
        return Ok(Expr {
            id: parser.new_id(),
            span,
            kind: ExprKind::Ternary {
                cond: Box::new(cond),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            },
        });
    }
    if parser.check(&Token::QuestionColon) {
        parser.advance();
        parser.skip_eols();
        let fallback = parse_ternary(parser)?;
        let span = parser.combine_spans(&cond.span, &fallback.span);
        return Ok(Expr {
            id: parser.new_id(),
            span,
            kind: ExprKind::Elvis {
                value: Box::new(cond),
                fallback: Box::new(fallback),
            },
        });
    }
    Ok(cond)
}

/// Binding strength of binary operators; higher binds tighter.
fn binary_prec(token: &Token) -> Option<u8> {
    match token {
        Token::PipePipe => Some(1),
        Token::AmpAmp => Some(2),
        Token::Pipe => Some(3),
        Token::Caret => Some(4),
        Token::Amp => Some(5),
        Token::EqualEqual
        | Token::BangEqual
        | Token::TripleEqual
        | Token::BangTripleEqual
        | Token::Compare => Some(6),
        Token::Less
        | Token::LessEqual
        | Token::Greater
        | Token::GreaterEqual
        | Token::Instanceof
        | Token::BangInstanceof
        | Token::In
        | Token::BangIn
        | Token::As => Some(7),
        Token::MatchOp | Token::NotMatchOp => Some(8),
        Token::LessLess | Token::GreaterGreater | Token::GreaterGreaterGreater => Some(9),
        Token::Plus | Token::Minus => Some(10),
        Token::Star | Token::Slash | Token::Percent | Token::PercentPercent => Some(11),
        _ => None,
    }
}

fn simple_bin_op(token: &Token) -> BinOp {
    match token {
        Token::PipePipe => BinOp::Or,
        Token::AmpAmp => BinOp::And,
        Token::Pipe => BinOp::BitOr,
        Token::Caret => BinOp::BitXor,
        Token::Amp => BinOp::BitAnd,
        Token::EqualEqual => BinOp::Eq,
        Token::BangEqual => BinOp::Ne,
        Token::TripleEqual => BinOp::EqId,
        Token::BangTripleEqual => BinOp::NeId,
        Token::Compare => BinOp::Cmp,
        Token::Less => BinOp::Lt,
        Token::LessEqual => BinOp::Le,
        Token::Greater => BinOp::Gt,
        Token::GreaterEqual => BinOp::Ge,
        Token::LessLess => BinOp::Shl,
        Token::GreaterGreater => BinOp::Shr,
        Token::GreaterGreaterGreater => BinOp::Ushr,
        Token::Plus => BinOp::Add,
        Token::Minus => BinOp::Sub,
        Token::Star => BinOp::Mul,
        Token::Slash => BinOp::Div,
        Token::Percent => BinOp::Mod,
        Token::PercentPercent => BinOp::Rem,
        other => unreachable!("not a simple binary operator: {}", other),
    }
}

fn parse_binary(parser: &mut Parser, min_prec: u8) -> Result<Expr, ParseError> {
    let mut lhs = parse_unary(parser)?;
    loop {
        let Some(prec) = binary_prec(parser.current()) else {
            break;
        };
        if prec < min_prec {
            break;
        }
        match parser.current().clone() {
            Token::As => {
                parser.advance();
                parser.skip_eols();
                let (ty, ty_span) = parse_type(parser)?;
                let span = parser.combine_spans(&lhs.span, &ty_span);
                lhs = Expr {
                    id: parser.new_id(),
                    span,
                    kind: ExprKind::AsConvert {
                        expr: Box::new(lhs),
                        ty,
                    },
                };
            }
            tok @ (Token::Instanceof | Token::BangInstanceof) => {
                parser.advance();
                parser.skip_eols();
                let (ty, ty_span) = parse_type(parser)?;
                let span = parser.combine_spans(&lhs.span, &ty_span);
                lhs = Expr {
                    id: parser.new_id(),
                    span,
                    kind: ExprKind::InstanceOf {
                        expr: Box::new(lhs),
                        ty,
                        negated: tok == Token::BangInstanceof,
                    },
                };
            }
            tok @ (Token::In | Token::BangIn) => {
                parser.advance();
                parser.skip_eols();
                let rhs = parse_binary(parser, prec + 1)?;
                let span = parser.combine_spans(&lhs.span, &rhs.span);
                lhs = Expr {
                    id: parser.new_id(),
                    span,
                    kind: ExprKind::InOp {
                        item: Box::new(lhs),
                        collection: Box::new(rhs),
                        negated: tok == Token::BangIn,
                    },
                };
            }
            tok @ (Token::MatchOp | Token::NotMatchOp) => {
                parser.advance();
                parser.skip_eols();
                lhs = parse_regex_rhs(parser, lhs, tok == Token::NotMatchOp, prec)?;
            }
            tok => {
                parser.advance();
                parser.skip_eols();
                let rhs = parse_binary(parser, prec + 1)?;
                lhs = make_binary(parser, simple_bin_op(&tok), lhs, rhs);
            }
        }
    }
    Ok(lhs)
}

/// Right-hand side of `=~`/`!~`: a pattern string, a substitution, or any
/// string-valued expression.
fn parse_regex_rhs(
    parser: &mut Parser,
    subject: Expr,
    negated: bool,
    prec: u8,
) -> Result<Expr, ParseError> {
    match parser.current().clone() {
        Token::PatternString { parts, modifiers } => {
            let (_, span) = parser.advance();
            let pattern = string_interp_expr(parser, parts, span)?;
            let span = parser.combine_spans(&subject.span, &span);
            Ok(Expr {
                id: parser.new_id(),
                span,
                kind: ExprKind::RegexMatch {
                    subject: Box::new(subject),
                    pattern: Box::new(pattern),
                    modifiers,
                    negated,
                },
            })
        }
        Token::SubstString {
            pattern,
            replacement,
            modifiers,
        } => {
            let (_, span) = parser.advance();
            if negated {
                return Err(ParseError::invalid(
                    "Substitution cannot be used with !~",
                    span,
                ));
            }
            let pattern = string_interp_expr(parser, pattern, span)?;
            // The replacement re-evaluates per match, so it is wrapped in
            // a zero-arg closure reading the capture variables.
            let repl_expr = string_interp_expr(parser, replacement, span)?;
            let repl_span = repl_expr.span;
            let body = Block {
                id: parser.new_id(),
                span: repl_span,
                stmts: vec![Stmt {
                    id: parser.new_id(),
                    span: repl_span,
                    kind: StmtKind::Expr(repl_expr),
                }],
            };
            let closure = Expr {
                id: parser.new_id(),
                span: repl_span,
                kind: ExprKind::Closure(Box::new(FunDecl {
                    id: parser.new_id(),
                    span: repl_span,
                    name: None,
                    return_type: TypeSpec::Dynamic,
                    params: Vec::new(),
                    body,
                    is_closure: true,
                    is_final: false,
                })),
            };
            let span = parser.combine_spans(&subject.span, &span);
            Ok(Expr {
                id: parser.new_id(),
                span,
                kind: ExprKind::RegexSubst {
                    subject: Box::new(subject),
                    pattern: Box::new(pattern),
                    replacement: Box::new(closure),
                    modifiers,
                },
            })
        }
        _ => {
            let pattern = parse_binary(parser, prec + 1)?;
            let span = parser.combine_spans(&subject.span, &pattern.span);
            Ok(Expr {
                id: parser.new_id(),
                span,
                kind: ExprKind::RegexMatch {
                    subject: Box::new(subject),
                    pattern: Box::new(pattern),
                    modifiers: String::new(),
                    negated,
                },
            })
        }
    }
}

fn parse_unary(parser: &mut Parser) -> Result<Expr, ParseError> {
    let op = match parser.current() {
        Token::Bang => Some(PrefixOp::Not),
        Token::Minus => Some(PrefixOp::Neg),
        Token::Plus => Some(PrefixOp::Plus),
        Token::Tilde => Some(PrefixOp::BitNot),
        Token::PlusPlus => Some(PrefixOp::Incr),
        Token::MinusMinus => Some(PrefixOp::Decr),
        _ => None,
    };
    if let Some(op) = op {
        let (_, span) = parser.advance();
        parser.skip_eols();
        let operand = parse_unary(parser)?;
        let span = parser.combine_spans(&span, &operand.span);
        return Ok(Expr {
            id: parser.new_id(),
            span,
            kind: ExprKind::Prefix {
                op,
                expr: Box::new(operand),
            },
        });
    }
    parse_postfix(parser)
}

fn parse_postfix(parser: &mut Parser) -> Result<Expr, ParseError> {
    let mut expr = parse_primary(parser)?;
    loop {
        match parser.current().clone() {
            Token::PlusPlus | Token::MinusMinus => {
                let (tok, span) = parser.advance();
                let op = if tok == Token::PlusPlus {
                    PostfixOp::Incr
                } else {
                    PostfixOp::Decr
                };
                let span = parser.combine_spans(&expr.span, &span);
                expr = Expr {
                    id: parser.new_id(),
                    span,
                    kind: ExprKind::Postfix {
                        op,
                        expr: Box::new(expr),
                    },
                };
            }
            Token::LeftParen => {
                let args = parse_call_args(parser)?;
                let span = parser.combine_spans(&expr.span, &parser.current_span());
                expr = Expr {
                    id: parser.new_id(),
                    span,
                    kind: ExprKind::Call {
                        callee: Box::new(expr),
                        args,
                    },
                };
            }
            tok @ (Token::LeftBracket | Token::QuestionLeftBracket) => {
                parser.advance();
                parser.enter_group();
                let index = parse_expression(parser)?;
                let close = parser.expect(&Token::RightBracket)?;
                parser.exit_group();
                let span = parser.combine_spans(&expr.span, &close);
                expr = Expr {
                    id: parser.new_id(),
                    span,
                    kind: ExprKind::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                        null_safe: tok == Token::QuestionLeftBracket,
                    },
                };
            }
            tok @ (Token::Dot | Token::QuestionDot) => {
                parser.advance();
                parser.skip_eols();
                let null_safe = tok == Token::QuestionDot;
                let (name_tok, name_span) = parser.advance();
                let Token::Identifier(name) = name_tok else {
                    return Err(ParseError::unexpected(
                        "field or method name",
                        &name_tok,
                        name_span,
                    ));
                };
                let name = Ident {
                    name,
                    span: name_span,
                };
                if parser.check(&Token::LeftParen) {
                    let args = parse_call_args(parser)?;
                    let span = parser.combine_spans(&expr.span, &parser.current_span());
                    expr = Expr {
                        id: parser.new_id(),
                        span,
                        kind: ExprKind::MethodCall {
                            target: Box::new(expr),
                            name,
                            args,
                            null_safe,
                        },
                    };
                } else if parser.check(&Token::LeftBrace) {
                    let closure = parse_closure(parser)?;
                    let span = parser.combine_spans(&expr.span, &closure.span);
                    expr = Expr {
                        id: parser.new_id(),
                        span,
                        kind: ExprKind::MethodCall {
                            target: Box::new(expr),
                            name,
                            args: vec![closure],
                            null_safe,
                        },
                    };
                } else {
                    let span = parser.combine_spans(&expr.span, &name_span);
                    expr = Expr {
                        id: parser.new_id(),
                        span,
                        kind: ExprKind::FieldAccess {
                            target: Box::new(expr),
                            name,
                            null_safe,
                        },
                    };
                }
            }
            Token::LeftBrace if callable_target(&expr) => {
                let closure = parse_closure(parser)?;
                let span = parser.combine_spans(&expr.span, &closure.span);
                expr = match expr.kind {
                    ExprKind::Call { callee, mut args } => {
                        args.push(closure);
                        Expr {
                            id: parser.new_id(),
                            span,
                            kind: ExprKind::Call { callee, args },
                        }
                    }
                    ExprKind::MethodCall {
                        target,
                        name,
                        mut args,
                        null_safe,
                    } => {
                        args.push(closure);
                        Expr {
                            id: parser.new_id(),
                            span,
                            kind: ExprKind::MethodCall {
                                target,
                                name,
                                args,
                                null_safe,
                            },
                        }
                    }
                    _ => Expr {
                        id: parser.new_id(),
                        span,
                        kind: ExprKind::Call {
                            callee: Box::new(expr),
                            args: vec![closure],
                        },
                    },
                };
            }
            _ => break,
        }
    }
    Ok(expr)
}

/// Can a trailing `{ ... }` closure attach to this expression?
fn callable_target(expr: &Expr) -> bool {
    matches!(
        expr.kind,
        ExprKind::Variable(_) | ExprKind::Call { .. } | ExprKind::MethodCall { .. }
    )
}

/// Parse `(...)` call arguments. A leading `name:` turns the whole list
/// into a single named-argument map literal.
fn parse_call_args(parser: &mut Parser) -> Result<Vec<Expr>, ParseError> {
    let open = parser.expect(&Token::LeftParen)?;
    parser.enter_group();
    if parser.check(&Token::RightParen) {
        parser.advance();
        parser.exit_group();
        return Ok(Vec::new());
    }

    let named = matches!(parser.current(), Token::Identifier(_))
        && parser.peek(1) == &Token::Colon;
    if named {
        let mut entries = Vec::new();
        loop {
            let (tok, span) = parser.advance();
            let Token::Identifier(name) = tok else {
                return Err(ParseError::unexpected("argument name", &tok, span));
            };
            parser.expect(&Token::Colon)?;
            let value = parse_expression(parser)?;
            entries.push((MapKey { name, span }, value));
            if parser.check(&Token::Comma) {
                parser.advance();
            } else {
                break;
            }
        }
        let close = parser.expect(&Token::RightParen)?;
        parser.exit_group();
        let span = parser.combine_spans(&open, &close);
        return Ok(vec![Expr {
            id: parser.new_id(),
            span,
            kind: ExprKind::MapLiteral {
                entries,
                is_named_args: true,
            },
        }]);
    }

    let mut args = Vec::new();
    loop {
        args.push(parse_expression(parser)?);
        if parser.check(&Token::Comma) {
            parser.advance();
        } else {
            break;
        }
    }
    parser.expect(&Token::RightParen)?;
    parser.exit_group();
    Ok(args)
}

fn parse_primary(parser: &mut Parser) -> Result<Expr, ParseError> {
    let span = parser.current_span();
    match parser.current().clone() {
        Token::IntLiteral(n) => {
            parser.advance();
            Ok(literal(parser, span, Literal::Int(n)))
        }
        Token::LongLiteral(n) => {
            parser.advance();
            Ok(literal(parser, span, Literal::Long(n)))
        }
        Token::DoubleLiteral(n) => {
            parser.advance();
            Ok(literal(parser, span, Literal::Double(n)))
        }
        Token::DecimalLiteral(text) => {
            parser.advance();
            match text.parse() {
                Ok(d) => Ok(literal(parser, span, Literal::Decimal(d))),
                Err(_) => Err(ParseError::invalid(
                    format!("Invalid decimal literal '{}'", text),
                    span,
                )),
            }
        }
        Token::StringLiteral(s) => {
            parser.advance();
            Ok(literal(parser, span, Literal::Str(s)))
        }
        Token::ExprString(parts) | Token::PatternString { parts, .. } => {
            parser.advance();
            string_interp_expr(parser, parts, span)
        }
        Token::True => {
            parser.advance();
            Ok(literal(parser, span, Literal::Bool(true)))
        }
        Token::False => {
            parser.advance();
            Ok(literal(parser, span, Literal::Bool(false)))
        }
        Token::Null => {
            parser.advance();
            Ok(literal(parser, span, Literal::Null))
        }
        Token::CaptureVar(n) => {
            parser.advance();
            Ok(Expr {
                id: parser.new_id(),
                span,
                kind: ExprKind::CaptureVar(n),
            })
        }
        Token::Identifier(name) => {
            parser.advance();
            Ok(Expr {
                id: parser.new_id(),
                span,
                kind: ExprKind::Variable(name),
            })
        }
        Token::LeftParen => parse_paren_or_cast(parser),
        Token::LeftBracket => parse_list_or_map(parser),
        Token::LeftBrace => parse_closure(parser),
        Token::New => parse_new(parser),
        Token::Do => {
            parser.advance();
            parser.skip_eols();
            let block = super::stmt::parse_block(parser)?;
            let span = parser.combine_spans(&span, &block.span);
            Ok(Expr {
                id: parser.new_id(),
                span,
                kind: ExprKind::DoBlock(block),
            })
        }
        found => Err(ParseError::unexpected("expression", &found, span)),
    }
}

fn literal(parser: &mut Parser, span: crate::parser::token::Span, lit: Literal) -> Expr {
    Expr {
        id: parser.new_id(),
        span,
        kind: ExprKind::Literal(lit),
    }
}

/// Build a `StringInterp` expression from lexed string parts.
pub(crate) fn string_interp_expr(
    parser: &mut Parser,
    parts: Vec<StringPart>,
    span: crate::parser::token::Span,
) -> Result<Expr, ParseError> {
    let mut segs = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            StringPart::Literal(s) => segs.push(StringSeg::Lit(s)),
            StringPart::Expr(tokens) => {
                let expr = parser.parse_embedded_expr(tokens, span)?;
                segs.push(StringSeg::Expr(Box::new(expr)));
            }
        }
    }
    // A single literal segment is just a string constant
    if segs.len() == 1 {
        if let StringSeg::Lit(s) = &segs[0] {
            let s = s.clone();
            return Ok(literal(parser, span, Literal::Str(s)));
        }
    }
    Ok(Expr {
        id: parser.new_id(),
        span,
        kind: ExprKind::StringInterp(segs),
    })
}

/// `(type)expr` cast or parenthesized expression.
fn parse_paren_or_cast(parser: &mut Parser) -> Result<Expr, ParseError> {
    let span = parser.current_span();
    let is_cast = parser.peek(1).is_type_keyword() && parser.peek(2) == &Token::RightParen;
    if is_cast {
        parser.advance();
        let (ty, _) = parse_type(parser)?;
        parser.expect(&Token::RightParen)?;
        let operand = parse_unary(parser)?;
        let span = parser.combine_spans(&span, &operand.span);
        return Ok(Expr {
            id: parser.new_id(),
            span,
            kind: ExprKind::TypeCast {
                ty,
                expr: Box::new(operand),
            },
        });
    }
    parser.advance();
    parser.enter_group();
    let expr = parse_expression(parser)?;
    parser.expect(&Token::RightParen)?;
    parser.exit_group();
    Ok(expr)
}

/// `[a, b, c]` list literal, `[k: v]` map literal, or `[:]` empty map.
fn parse_list_or_map(parser: &mut Parser) -> Result<Expr, ParseError> {
    let open = parser.expect(&Token::LeftBracket)?;
    parser.enter_group();

    if parser.check(&Token::Colon) {
        parser.advance();
        let close = parser.expect(&Token::RightBracket)?;
        parser.exit_group();
        let span = parser.combine_spans(&open, &close);
        return Ok(Expr {
            id: parser.new_id(),
            span,
            kind: ExprKind::MapLiteral {
                entries: Vec::new(),
                is_named_args: false,
            },
        });
    }

    let is_map = match parser.current() {
        Token::Identifier(_) | Token::StringLiteral(_) => parser.peek(1) == &Token::Colon,
        _ => false,
    };

    if is_map {
        let mut entries = Vec::new();
        loop {
            let (tok, key_span) = parser.advance();
            let name = match tok {
                Token::Identifier(name) => name,
                Token::StringLiteral(s) => s,
                other => {
                    return Err(ParseError::unexpected("map key", &other, key_span));
                }
            };
            parser.expect(&Token::Colon)?;
            let value = parse_expression(parser)?;
            entries.push((
                MapKey {
                    name,
                    span: key_span,
                },
                value,
            ));
            if parser.check(&Token::Comma) {
                parser.advance();
            } else {
                break;
            }
        }
        let close = parser.expect(&Token::RightBracket)?;
        parser.exit_group();
        let span = parser.combine_spans(&open, &close);
        return Ok(Expr {
            id: parser.new_id(),
            span,
            kind: ExprKind::MapLiteral {
                entries,
                is_named_args: false,
            },
        });
    }

    let mut items = Vec::new();
    if !parser.check(&Token::RightBracket) {
        loop {
            items.push(parse_expression(parser)?);
            if parser.check(&Token::Comma) {
                parser.advance();
            } else {
                break;
            }
        }
    }
    let close = parser.expect(&Token::RightBracket)?;
    parser.exit_group();
    let span = parser.combine_spans(&open, &close);
    Ok(Expr {
        id: parser.new_id(),
        span,
        kind: ExprKind::ListLiteral(items),
    })
}

/// `{ params -> body }` or `{ body }` with the implicit `it` parameter.
pub(crate) fn parse_closure(parser: &mut Parser) -> Result<Expr, ParseError> {
    let open = parser.expect(&Token::LeftBrace)?;
    parser.without_groups(|parser| {
        let params = match try_parse_closure_params(parser)? {
            Some(params) => params,
            None => {
                // No arrow: implicit single `it` parameter, defaulting to null
                let span = open;
                vec![Param {
                    id: parser.new_id(),
                    span,
                    name: Ident {
                        name: "it".to_string(),
                        span,
                    },
                    ty: TypeSpec::Dynamic,
                    default: Some(Expr {
                        id: parser.new_id(),
                        span,
                        kind: ExprKind::Literal(Literal::Null),
                    }),
                }]
            }
        };
        let stmts = super::stmt::parse_block_body(parser)?;
        let close = parser.expect(&Token::RightBrace)?;
        let span = parser.combine_spans(&open, &close);
        let body = Block {
            id: parser.new_id(),
            span,
            stmts,
        };
        Ok(Expr {
            id: parser.new_id(),
            span,
            kind: ExprKind::Closure(Box::new(FunDecl {
                id: parser.new_id(),
                span,
                name: None,
                return_type: TypeSpec::Dynamic,
                params,
                body,
                is_closure: true,
                is_final: false,
            })),
        })
    })
}

/// Attempt to parse `params ->` at the start of a closure. Returns None
/// (with position restored) when there is no arrow.
fn try_parse_closure_params(parser: &mut Parser) -> Result<Option<Vec<Param>>, ParseError> {
    let saved = parser.save_position();
    parser.skip_eols();
    if parser.check(&Token::Arrow) {
        parser.advance();
        return Ok(Some(Vec::new()));
    }
    let mut params = Vec::new();
    loop {
        let ty = if parser.current().is_type_keyword() {
            let (ty, _) = match parse_type(parser) {
                Ok(ok) => ok,
                Err(_) => {
                    parser.restore_position(saved);
                    return Ok(None);
                }
            };
            ty
        } else {
            TypeSpec::Dynamic
        };
        let span = parser.current_span();
        let Token::Identifier(name) = parser.current().clone() else {
            parser.restore_position(saved);
            return Ok(None);
        };
        parser.advance();
        let default = if parser.check(&Token::Equal) {
            parser.advance();
            match parse_expression(parser) {
                Ok(expr) => Some(expr),
                Err(_) => {
                    parser.restore_position(saved);
                    return Ok(None);
                }
            }
        } else {
            None
        };
        params.push(Param {
            id: parser.new_id(),
            span,
            name: Ident { name, span },
            ty,
            default,
        });
        if parser.check(&Token::Comma) {
            parser.advance();
            continue;
        }
        if parser.check(&Token::Arrow) {
            parser.advance();
            return Ok(Some(params));
        }
        parser.restore_position(saved);
        return Ok(None);
    }
}

fn parse_new(parser: &mut Parser) -> Result<Expr, ParseError> {
    let start = parser.expect(&Token::New)?;
    let mut class = Vec::new();
    loop {
        let (tok, span) = parser.advance();
        let Token::Identifier(name) = tok else {
            return Err(ParseError::unexpected("class name", &tok, span));
        };
        class.push(Ident { name, span });
        if parser.check(&Token::Dot) {
            parser.advance();
        } else {
            break;
        }
    }
    let args = if parser.check(&Token::LeftParen) {
        parse_call_args(parser)?
    } else {
        Vec::new()
    };
    let span = parser.combine_spans(&start, &parser.current_span());
    Ok(Expr {
        id: parser.new_id(),
        span,
        kind: ExprKind::New { class, args },
    })
}

/// Parse a type annotation.
pub(crate) fn parse_type(
    parser: &mut Parser,
) -> Result<(TypeSpec, crate::parser::token::Span), ParseError> {
    let (tok, span) = parser.advance();
    let ty = match tok {
        Token::Boolean => TypeSpec::Boolean,
        Token::Int => TypeSpec::Int,
        Token::Long => TypeSpec::Long,
        Token::Double => TypeSpec::Double,
        Token::Decimal => TypeSpec::Decimal,
        Token::StringType => TypeSpec::Str,
        Token::ListType => TypeSpec::List,
        Token::MapType => TypeSpec::Map,
        Token::Def => TypeSpec::Dynamic,
        Token::Var => TypeSpec::Inferred,
        Token::Void => TypeSpec::Void,
        Token::Identifier(name) => {
            let mut path = vec![Ident { name, span }];
            let mut end = span;
            while parser.check(&Token::Dot) && matches!(parser.peek(1), Token::Identifier(_)) {
                parser.advance();
                let (tok, span) = parser.advance();
                if let Token::Identifier(name) = tok {
                    end = span;
                    path.push(Ident { name, span });
                }
            }
            return Ok((TypeSpec::Named(path), parser.combine_spans(&span, &end)));
        }
        other => {
            return Err(ParseError::unexpected("type name", &other, span));
        }
    };
    Ok((ty, span))
}

fn make_binary(parser: &mut Parser, op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    let span = parser.combine_spans(&lhs.span, &rhs.span);
    Expr {
        id: parser.new_id(),
        span,
        kind: ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
    }
}
