//! Statement parsing

use super::{expr, ParseError, Parser, MAX_PARSE_DEPTH};
use crate::parser::ast::*;
use crate::parser::token::{Span, Token};
use crate::parser::LoopMode;

/// Parse the whole token stream into a `Script`.
///
/// Top-level classes are collected separately; the remaining statements
/// become the body of the synthesized `main` function. Under a loop mode
/// the body is wrapped in the canonical read-line loop with `BEGIN`/`END`
/// blocks as prologue/epilogue.
pub(crate) fn parse_compilation_unit(
    parser: &mut Parser,
    name: &str,
    loop_mode: LoopMode,
) -> Result<Script, ParseError> {
    let mut classes = Vec::new();
    let mut begin_stmts = Vec::new();
    let mut end_stmts = Vec::new();
    let mut body_stmts = Vec::new();

    loop {
        while matches!(
            parser.current(),
            Token::Eol | Token::Semicolon
        ) {
            parser.advance();
        }
        if parser.check(&Token::Eof) {
            break;
        }
        match parser.current().clone() {
            tok @ (Token::Begin | Token::End) => {
                let span = parser.current_span();
                if loop_mode == LoopMode::Off {
                    parser.record_error(ParseError::invalid(
                        "BEGIN/END blocks are only allowed with -p or -n",
                        span,
                    ));
                    parser.advance();
                    parser.synchronize();
                    continue;
                }
                parser.advance();
                match parse_block(parser) {
                    Ok(block) => {
                        if tok == Token::Begin {
                            begin_stmts.extend(block.stmts);
                        } else {
                            end_stmts.extend(block.stmts);
                        }
                    }
                    Err(err) => {
                        parser.record_error(err);
                        parser.synchronize();
                    }
                }
            }
            Token::Class => match parse_class(parser) {
                Ok(class) => classes.push(class),
                Err(err) => {
                    parser.record_error(err);
                    parser.synchronize();
                }
            },
            _ => match parse_statement(parser).and_then(|stmt| {
                parser.consume_statement_end()?;
                Ok(stmt)
            }) {
                Ok(stmt) => body_stmts.push(stmt),
                Err(err) => {
                    parser.record_error(err);
                    parser.synchronize();
                }
            },
        }
    }

    let span = Span::new(0, 0, 1, 1);
    let stmts = match loop_mode {
        LoopMode::Off => body_stmts,
        LoopMode::Loop | LoopMode::LoopPrint => {
            synthesize_line_loop(parser, begin_stmts, body_stmts, end_stmts, loop_mode)
        }
    };
    let body = Block {
        id: parser.new_id(),
        span,
        stmts,
    };
    let main = FunDecl {
        id: parser.new_id(),
        span,
        name: None,
        return_type: TypeSpec::Dynamic,
        params: Vec::new(),
        body,
        is_closure: false,
        is_final: false,
    };
    Ok(Script {
        name: name.to_string(),
        classes,
        main,
    })
}

/// Build `BEGIN; while ((it = nextLine()) != null) { body; [println it] }
/// END` for the `-p`/`-n` modes.
fn synthesize_line_loop(
    parser: &mut Parser,
    begin_stmts: Vec<Stmt>,
    body_stmts: Vec<Stmt>,
    end_stmts: Vec<Stmt>,
    loop_mode: LoopMode,
) -> Vec<Stmt> {
    let span = Span::new(0, 0, 1, 1);
    let next_line = Expr {
        id: parser.new_id(),
        span,
        kind: ExprKind::Call {
            callee: Box::new(Expr {
                id: parser.new_id(),
                span,
                kind: ExprKind::Variable("nextLine".to_string()),
            }),
            args: Vec::new(),
        },
    };
    let assign_it = Expr {
        id: parser.new_id(),
        span,
        kind: ExprKind::Assign {
            target: Box::new(Expr {
                id: parser.new_id(),
                span,
                kind: ExprKind::Variable("it".to_string()),
            }),
            value: Box::new(next_line),
            op: None,
            conditional: false,
        },
    };
    let cond = Expr {
        id: parser.new_id(),
        span,
        kind: ExprKind::Binary {
            op: BinOp::Ne,
            lhs: Box::new(assign_it),
            rhs: Box::new(Expr {
                id: parser.new_id(),
                span,
                kind: ExprKind::Literal(Literal::Null),
            }),
        },
    };
    let mut loop_body = body_stmts;
    if loop_mode == LoopMode::LoopPrint {
        loop_body.push(Stmt {
            id: parser.new_id(),
            span,
            kind: StmtKind::Print {
                value: Some(Expr {
                    id: parser.new_id(),
                    span,
                    kind: ExprKind::Variable("it".to_string()),
                }),
                newline: true,
            },
        });
    }
    let while_stmt = Stmt {
        id: parser.new_id(),
        span,
        kind: StmtKind::While {
            cond,
            body: Block {
                id: parser.new_id(),
                span,
                stmts: loop_body,
            },
            update: Vec::new(),
        },
    };
    let mut stmts = begin_stmts;
    stmts.push(while_stmt);
    stmts.extend(end_stmts);
    stmts
}

/// Parse a statement.
pub(crate) fn parse_statement(parser: &mut Parser) -> Result<Stmt, ParseError> {
    parser.depth += 1;
    if parser.depth > MAX_PARSE_DEPTH {
        parser.depth -= 1;
        return Err(ParseError::invalid(
            "Maximum nesting depth exceeded in statement",
            parser.current_span(),
        ));
    }
    let result = parse_statement_inner(parser);
    parser.depth -= 1;
    result
}

fn parse_statement_inner(parser: &mut Parser) -> Result<Stmt, ParseError> {
    match parser.current().clone() {
        Token::Final => {
            let start = parser.current_span();
            parser.advance();
            let (ty, _) = expr::parse_type(parser)?;
            parse_decl_after_type(parser, ty, start, true)
        }
        tok if tok.is_type_keyword() => {
            let start = parser.current_span();
            let (ty, _) = expr::parse_type(parser)?;
            parse_decl_after_type(parser, ty, start, false)
        }
        Token::Identifier(_) if matches!(parser.peek(1), Token::Identifier(_)) => {
            // Class-typed declaration: `Point p = ...` or `Point f(...) {}`
            let start = parser.current_span();
            let (ty, _) = expr::parse_type(parser)?;
            parse_decl_after_type(parser, ty, start, false)
        }
        Token::Class => {
            let class = parse_class(parser)?;
            let span = class.span;
            Ok(Stmt {
                id: parser.new_id(),
                span,
                kind: StmtKind::ClassDecl(class),
            })
        }
        Token::If => parse_if(parser, false),
        Token::Unless => parse_if(parser, true),
        Token::While => parse_while(parser),
        Token::For => parse_for(parser),
        Token::Break => {
            let span = parser.advance().1;
            let id = parser.new_id();
            apply_modifiers(
                parser,
                Stmt {
                    id,
                    span,
                    kind: StmtKind::Break,
                },
            )
        }
        Token::Continue => {
            let span = parser.advance().1;
            let id = parser.new_id();
            apply_modifiers(
                parser,
                Stmt {
                    id,
                    span,
                    kind: StmtKind::Continue,
                },
            )
        }
        Token::Return => {
            let span = parser.advance().1;
            let value = if statement_value_follows(parser) {
                Some(expr::parse_expression(parser)?)
            } else {
                None
            };
            let id = parser.new_id();
            apply_modifiers(
                parser,
                Stmt {
                    id,
                    span,
                    kind: StmtKind::Return { value },
                },
            )
        }
        tok @ (Token::Print | Token::Println) => {
            let span = parser.advance().1;
            let value = if statement_value_follows(parser) {
                Some(expr::parse_expression(parser)?)
            } else {
                None
            };
            let id = parser.new_id();
            apply_modifiers(
                parser,
                Stmt {
                    id,
                    span,
                    kind: StmtKind::Print {
                        value,
                        newline: tok == Token::Println,
                    },
                },
            )
        }
        Token::Die => {
            let span = parser.advance().1;
            let value = if statement_value_follows(parser) {
                Some(expr::parse_expression(parser)?)
            } else {
                None
            };
            let id = parser.new_id();
            apply_modifiers(
                parser,
                Stmt {
                    id,
                    span,
                    kind: StmtKind::Die { value },
                },
            )
        }
        Token::Import => parse_import(parser),
        tok @ (Token::Begin | Token::End) => Err(ParseError::invalid(
            format!("{} blocks are only allowed at the top level with -p or -n", tok),
            parser.current_span(),
        )),
        _ => {
            let expression = expr::parse_expression(parser)?;
            let span = expression.span;
            let id = parser.new_id();
            apply_modifiers(
                parser,
                Stmt {
                    id,
                    span,
                    kind: StmtKind::Expr(expression),
                },
            )
        }
    }
}

/// True when a value expression follows on the same line (for `return`,
/// `print`, `die`), as opposed to a terminator or a postfix modifier.
fn statement_value_follows(parser: &mut Parser) -> bool {
    !parser.at_statement_end() && !matches!(parser.current(), Token::If | Token::Unless)
}

/// Lower the `stmt if cond` / `stmt unless cond` postfix modifiers.
fn apply_modifiers(parser: &mut Parser, stmt: Stmt) -> Result<Stmt, ParseError> {
    let negate = match parser.current() {
        Token::If => false,
        Token::Unless => true,
        _ => return Ok(stmt),
    };
    parser.advance();
    parser.skip_eols();
    let mut cond = expr::parse_expression(parser)?;
    if negate {
        let span = cond.span;
        cond = Expr {
            id: parser.new_id(),
            span,
            kind: ExprKind::Prefix {
                op: PrefixOp::Not,
                expr: Box::new(cond),
            },
        };
    }
    let span = parser.combine_spans(&stmt.span, &cond.span);
    let block_span = stmt.span;
    Ok(Stmt {
        id: parser.new_id(),
        span,
        kind: StmtKind::If {
            cond,
            then_block: Block {
                id: parser.new_id(),
                span: block_span,
                stmts: vec![stmt],
            },
            else_block: None,
        },
    })
}

/// After a leading type: either a variable or a function declaration.
fn parse_decl_after_type(
    parser: &mut Parser,
    ty: TypeSpec,
    start: Span,
    is_final: bool,
) -> Result<Stmt, ParseError> {
    let name_span = parser.current_span();
    let Token::Identifier(name) = parser.current().clone() else {
        let found = parser.current().clone();
        return Err(ParseError::unexpected("name", &found, name_span));
    };
    parser.advance();
    let name = Ident {
        name,
        span: name_span,
    };

    if parser.check(&Token::LeftParen) {
        return parse_fun_decl(parser, ty, name, start, is_final);
    }

    let init = if parser.check(&Token::Equal) {
        parser.advance();
        parser.skip_eols();
        Some(expr::parse_expression(parser)?)
    } else {
        if ty == TypeSpec::Inferred {
            return Err(ParseError::invalid(
                "Variable declared with 'var' must have an initializer",
                name_span,
            ));
        }
        None
    };
    let end = init.as_ref().map(|e| e.span).unwrap_or(name_span);
    let span = parser.combine_spans(&start, &end);
    let decl = VarDecl {
        id: parser.new_id(),
        span,
        name,
        ty,
        init,
        is_final,
    };
    let id = parser.new_id();
    apply_modifiers(
        parser,
        Stmt {
            id,
            span,
            kind: StmtKind::VarDecl(decl),
        },
    )
}

fn parse_fun_decl(
    parser: &mut Parser,
    return_type: TypeSpec,
    name: Ident,
    start: Span,
    is_final: bool,
) -> Result<Stmt, ParseError> {
    if return_type == TypeSpec::Inferred {
        return Err(ParseError::invalid(
            "Functions cannot be declared with 'var'",
            start,
        ));
    }
    let params = parse_params(parser)?;
    parser.skip_eols();
    let body = parse_block(parser)?;
    let span = parser.combine_spans(&start, &body.span);
    Ok(Stmt {
        id: parser.new_id(),
        span,
        kind: StmtKind::FunDecl(FunDecl {
            id: parser.new_id(),
            span,
            name: Some(name),
            return_type,
            params,
            body,
            is_closure: false,
            is_final,
        }),
    })
}

/// Parse a parenthesized parameter list: `([type] name [= default], ...)`.
fn parse_params(parser: &mut Parser) -> Result<Vec<Param>, ParseError> {
    parser.expect(&Token::LeftParen)?;
    parser.enter_group();
    let mut params = Vec::new();
    if !parser.check(&Token::RightParen) {
        loop {
            let ty = if parser.current().is_type_keyword() {
                expr::parse_type(parser)?.0
            } else if matches!(parser.current(), Token::Identifier(_))
                && matches!(parser.peek(1), Token::Identifier(_))
            {
                expr::parse_type(parser)?.0
            } else {
                TypeSpec::Dynamic
            };
            let span = parser.current_span();
            let (tok, _) = parser.advance();
            let Token::Identifier(name) = tok else {
                return Err(ParseError::unexpected("parameter name", &tok, span));
            };
            let default = if parser.check(&Token::Equal) {
                parser.advance();
                Some(expr::parse_expression(parser)?)
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
            } else {
                break;
            }
        }
    }
    parser.expect(&Token::RightParen)?;
    parser.exit_group();
    Ok(params)
}

fn parse_if(parser: &mut Parser, negate: bool) -> Result<Stmt, ParseError> {
    let start = parser.advance().1;
    parser.expect(&Token::LeftParen)?;
    parser.enter_group();
    let mut cond = expr::parse_expression(parser)?;
    parser.expect(&Token::RightParen)?;
    parser.exit_group();
    if negate {
        let span = cond.span;
        cond = Expr {
            id: parser.new_id(),
            span,
            kind: ExprKind::Prefix {
                op: PrefixOp::Not,
                expr: Box::new(cond),
            },
        };
    }
    parser.skip_eols();
    let then_block = parse_block_or_stmt(parser)?;

    // `else` may sit after the closing brace on its own line
    let saved = parser.save_position();
    parser.skip_eols();
    let else_block = if parser.check(&Token::Else) {
        parser.advance();
        parser.skip_eols();
        if parser.check(&Token::If) || parser.check(&Token::Unless) {
            let is_unless = parser.check(&Token::Unless);
            let nested = parse_if(parser, is_unless)?;
            let span = nested.span;
            Some(Block {
                id: parser.new_id(),
                span,
                stmts: vec![nested],
            })
        } else {
            Some(parse_block_or_stmt(parser)?)
        }
    } else {
        parser.restore_position(saved);
        None
    };

    let end = else_block
        .as_ref()
        .map(|b| b.span)
        .unwrap_or(then_block.span);
    let span = parser.combine_spans(&start, &end);
    Ok(Stmt {
        id: parser.new_id(),
        span,
        kind: StmtKind::If {
            cond,
            then_block,
            else_block,
        },
    })
}

fn parse_while(parser: &mut Parser) -> Result<Stmt, ParseError> {
    let start = parser.advance().1;
    parser.expect(&Token::LeftParen)?;
    parser.enter_group();
    let cond = expr::parse_expression(parser)?;
    parser.expect(&Token::RightParen)?;
    parser.exit_group();
    parser.skip_eols();
    let body = parse_block_or_stmt(parser)?;
    let span = parser.combine_spans(&start, &body.span);
    Ok(Stmt {
        id: parser.new_id(),
        span,
        kind: StmtKind::While {
            cond,
            body,
            update: Vec::new(),
        },
    })
}

/// `for (init; cond; update) body` desugars to a block holding the init
/// and a while loop whose update expressions run before re-testing.
fn parse_for(parser: &mut Parser) -> Result<Stmt, ParseError> {
    let start = parser.advance().1;
    parser.expect(&Token::LeftParen)?;
    parser.enter_group();

    let init = if parser.check(&Token::Semicolon) {
        None
    } else {
        Some(parse_statement(parser)?)
    };
    parser.expect(&Token::Semicolon)?;

    let cond = if parser.check(&Token::Semicolon) {
        let span = parser.current_span();
        Expr {
            id: parser.new_id(),
            span,
            kind: ExprKind::Literal(Literal::Bool(true)),
        }
    } else {
        expr::parse_expression(parser)?
    };
    parser.expect(&Token::Semicolon)?;

    let mut update = Vec::new();
    if !parser.check(&Token::RightParen) {
        loop {
            update.push(expr::parse_expression(parser)?);
            if parser.check(&Token::Comma) {
                parser.advance();
            } else {
                break;
            }
        }
    }
    parser.expect(&Token::RightParen)?;
    parser.exit_group();
    parser.skip_eols();
    let body = parse_block_or_stmt(parser)?;
    let span = parser.combine_spans(&start, &body.span);

    let while_stmt = Stmt {
        id: parser.new_id(),
        span,
        kind: StmtKind::While { cond, body, update },
    };
    match init {
        Some(init) => Ok(Stmt {
            id: parser.new_id(),
            span,
            kind: StmtKind::Block(Block {
                id: parser.new_id(),
                span,
                stmts: vec![init, while_stmt],
            }),
        }),
        None => Ok(while_stmt),
    }
}

fn parse_import(parser: &mut Parser) -> Result<Stmt, ParseError> {
    let start = parser.advance().1;
    let mut path = Vec::new();
    loop {
        let (tok, span) = parser.advance();
        let Token::Identifier(name) = tok else {
            return Err(ParseError::unexpected("import path", &tok, span));
        };
        path.push(Ident { name, span });
        if parser.check(&Token::Dot) {
            parser.advance();
        } else {
            break;
        }
    }
    let alias = if parser.check(&Token::As) {
        parser.advance();
        let (tok, span) = parser.advance();
        let Token::Identifier(name) = tok else {
            return Err(ParseError::unexpected("import alias", &tok, span));
        };
        Some(Ident { name, span })
    } else {
        None
    };
    let end = alias
        .as_ref()
        .map(|a| a.span)
        .or_else(|| path.last().map(|p| p.span))
        .unwrap_or(start);
    let span = parser.combine_spans(&start, &end);
    Ok(Stmt {
        id: parser.new_id(),
        span,
        kind: StmtKind::Import { path, alias },
    })
}

/// A `{ ... }` block, or a single statement wrapped in one.
fn parse_block_or_stmt(parser: &mut Parser) -> Result<Block, ParseError> {
    if parser.check(&Token::LeftBrace) {
        parse_block(parser)
    } else {
        let stmt = parse_statement(parser)?;
        let span = stmt.span;
        Ok(Block {
            id: parser.new_id(),
            span,
            stmts: vec![stmt],
        })
    }
}

/// Parse a braced block.
pub(crate) fn parse_block(parser: &mut Parser) -> Result<Block, ParseError> {
    let open = parser.expect(&Token::LeftBrace)?;
    parser.without_groups(|parser| {
        let stmts = parse_block_body(parser)?;
        let close = parser.expect(&Token::RightBrace)?;
        Ok(Block {
            id: parser.new_id(),
            span: parser.combine_spans(&open, &close),
            stmts,
        })
    })
}

/// Parse statements up to (not including) the closing brace.
pub(crate) fn parse_block_body(parser: &mut Parser) -> Result<Vec<Stmt>, ParseError> {
    let mut stmts = Vec::new();
    loop {
        while matches!(parser.current(), Token::Eol | Token::Semicolon) {
            parser.advance();
        }
        if parser.check(&Token::RightBrace) || parser.check(&Token::Eof) {
            break;
        }
        let stmt = parse_statement(parser)?;
        parser.consume_statement_end()?;
        stmts.push(stmt);
    }
    Ok(stmts)
}

/// Parse a class declaration.
pub(crate) fn parse_class(parser: &mut Parser) -> Result<ClassDecl, ParseError> {
    let start = parser.expect(&Token::Class)?;
    let name_span = parser.current_span();
    let (tok, _) = parser.advance();
    let Token::Identifier(name) = tok else {
        return Err(ParseError::unexpected("class name", &tok, name_span));
    };
    let name = Ident {
        name,
        span: name_span,
    };

    let base = if parser.check(&Token::Extends) {
        parser.advance();
        let mut path = Vec::new();
        loop {
            let (tok, span) = parser.advance();
            let Token::Identifier(name) = tok else {
                return Err(ParseError::unexpected("base class name", &tok, span));
            };
            path.push(Ident { name, span });
            if parser.check(&Token::Dot) {
                parser.advance();
            } else {
                break;
            }
        }
        Some(path)
    } else {
        None
    };

    parser.skip_eols();
    parser.expect(&Token::LeftBrace)?;
    let mut fields = Vec::new();
    let mut methods = Vec::new();
    let mut inner_classes = Vec::new();

    parser.without_groups(|parser| -> Result<(), ParseError> {
        loop {
            while matches!(parser.current(), Token::Eol | Token::Semicolon) {
                parser.advance();
            }
            if parser.check(&Token::RightBrace) || parser.check(&Token::Eof) {
                break;
            }
            if parser.check(&Token::Class) {
                inner_classes.push(parse_class(parser)?);
                continue;
            }
            let is_final = if parser.check(&Token::Final) {
                parser.advance();
                true
            } else {
                false
            };
            let member_start = parser.current_span();
            let (ty, _) = expr::parse_type(parser)?;
            let stmt = parse_decl_after_type(parser, ty, member_start, is_final)?;
            parser.consume_statement_end()?;
            match stmt.kind {
                StmtKind::FunDecl(fun) => methods.push(fun),
                StmtKind::VarDecl(field) => fields.push(field),
                _ => {
                    return Err(ParseError::invalid(
                        "Only fields, methods, and inner classes are allowed in a class body",
                        member_start,
                    ));
                }
            }
        }
        Ok(())
    })?;

    let close = parser.expect(&Token::RightBrace)?;
    Ok(ClassDecl {
        id: parser.new_id(),
        span: parser.combine_spans(&start, &close),
        name,
        base,
        fields,
        methods,
        inner_classes,
    })
}
