//! AST definitions for the Rill scripting language.
//!
//! Nodes are produced by the parser and are immutable afterwards; every
//! node carries a `NodeId` so later passes (resolver, lowering) can hang
//! attributes off side tables instead of mutating the tree.

use crate::parser::token::Span;
use bigdecimal::BigDecimal;

/// Identifies an AST node within one compilation unit.
pub type NodeId = u32;

/// An identifier together with its source location.
#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

/// A syntactic type annotation.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeSpec {
    /// `var` — type comes from the initializer
    Inferred,
    /// `def` — dynamically typed
    Dynamic,
    Boolean,
    Int,
    Long,
    Double,
    Decimal,
    Str,
    List,
    Map,
    Void,
    /// A class name, possibly dotted for inner classes
    Named(Vec<Ident>),
}

/// A literal value.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Decimal(BigDecimal),
    Str(String),
}

/// One segment of an interpolated string.
#[derive(Debug, Clone, PartialEq)]
pub enum StringSeg {
    Lit(String),
    Expr(Box<Expr>),
}

/// Binary operators (short-circuiting `and`/`or` included; lowering gives
/// them jump-based evaluation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    /// `%` — floored modulo, result takes the divisor's sign
    Mod,
    /// `%%` — truncated remainder
    Rem,
    Shl,
    Shr,
    Ushr,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    Ne,
    /// `===`
    EqId,
    /// `!==`
    NeId,
    Lt,
    Le,
    Gt,
    Ge,
    /// `<=>`
    Cmp,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixOp {
    Neg,
    Plus,
    Not,
    BitNot,
    Incr,
    Decr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostfixOp {
    Incr,
    Decr,
}

/// A map literal key: a bare name / string, or nothing fancier.
#[derive(Debug, Clone, PartialEq)]
pub struct MapKey {
    pub name: String,
    pub span: Span,
}

/// An expression node.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub id: NodeId,
    pub span: Span,
    pub kind: ExprKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(Literal),
    StringInterp(Vec<StringSeg>),
    Variable(String),
    CaptureVar(u32),
    ListLiteral(Vec<Expr>),
    MapLiteral {
        entries: Vec<(MapKey, Expr)>,
        /// True when this literal was written as `f(name: value, ...)`
        is_named_args: bool,
    },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Prefix {
        op: PrefixOp,
        expr: Box<Expr>,
    },
    Postfix {
        op: PostfixOp,
        expr: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    /// `a ?: b` — `a` when truthy, otherwise `b`
    Elvis {
        value: Box<Expr>,
        fallback: Box<Expr>,
    },
    /// `(int)x` style cast on a built-in type
    TypeCast {
        ty: TypeSpec,
        expr: Box<Expr>,
    },
    /// `x as Type`
    AsConvert {
        expr: Box<Expr>,
        ty: TypeSpec,
    },
    InstanceOf {
        expr: Box<Expr>,
        ty: TypeSpec,
        negated: bool,
    },
    /// `x in xs` / `x !in xs`
    InOp {
        item: Box<Expr>,
        collection: Box<Expr>,
        negated: bool,
    },
    Index {
        target: Box<Expr>,
        index: Box<Expr>,
        null_safe: bool,
    },
    FieldAccess {
        target: Box<Expr>,
        name: Ident,
        null_safe: bool,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    MethodCall {
        target: Box<Expr>,
        name: Ident,
        args: Vec<Expr>,
        null_safe: bool,
    },
    Closure(Box<FunDecl>),
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
        /// `+=` and friends carry the underlying operator
        op: Option<BinOp>,
        /// `?=` — assign only when the right-hand side is non-null
        conditional: bool,
    },
    RegexMatch {
        subject: Box<Expr>,
        pattern: Box<Expr>,
        modifiers: String,
        negated: bool,
    },
    RegexSubst {
        subject: Box<Expr>,
        pattern: Box<Expr>,
        /// Always a `Closure` expression built by the parser; it re-reads
        /// the capture variables for every match
        replacement: Box<Expr>,
        modifiers: String,
    },
    New {
        class: Vec<Ident>,
        args: Vec<Expr>,
    },
    /// `do { ... }` — value is the block's final expression
    DoBlock(Block),
}

/// A statement node.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub id: NodeId,
    pub span: Span,
    pub kind: StmtKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Expr(Expr),
    VarDecl(VarDecl),
    FunDecl(FunDecl),
    ClassDecl(ClassDecl),
    If {
        cond: Expr,
        then_block: Block,
        else_block: Option<Block>,
    },
    While {
        cond: Expr,
        body: Block,
        /// `for` loops desugar to a while with update expressions
        update: Vec<Expr>,
    },
    Break,
    Continue,
    Return {
        value: Option<Expr>,
    },
    Print {
        value: Option<Expr>,
        newline: bool,
    },
    Die {
        value: Option<Expr>,
    },
    Block(Block),
    Import {
        path: Vec<Ident>,
        alias: Option<Ident>,
    },
}

/// A brace-delimited scope.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: NodeId,
    pub span: Span,
    pub stmts: Vec<Stmt>,
}

/// A variable declaration (local, global under loop mode, or class field).
#[derive(Debug, Clone, PartialEq)]
pub struct VarDecl {
    pub id: NodeId,
    pub span: Span,
    pub name: Ident,
    pub ty: TypeSpec,
    pub init: Option<Expr>,
    pub is_final: bool,
}

/// A function/closure parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub id: NodeId,
    pub span: Span,
    pub name: Ident,
    pub ty: TypeSpec,
    pub default: Option<Expr>,
}

/// A function, method, or closure declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct FunDecl {
    pub id: NodeId,
    pub span: Span,
    /// None for closures
    pub name: Option<Ident>,
    pub return_type: TypeSpec,
    pub params: Vec<Param>,
    pub body: Block,
    pub is_closure: bool,
    pub is_final: bool,
}

/// A class declaration with fields, methods, and inner classes.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDecl {
    pub id: NodeId,
    pub span: Span,
    pub name: Ident,
    pub base: Option<Vec<Ident>>,
    pub fields: Vec<VarDecl>,
    pub methods: Vec<FunDecl>,
    pub inner_classes: Vec<ClassDecl>,
}

/// One compilation unit: top-level classes plus a synthesized main
/// function wrapping the top-level statements.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub name: String,
    pub classes: Vec<ClassDecl>,
    pub main: FunDecl,
}

impl Expr {
    /// True when the expression can be the target of an assignment.
    pub fn is_assignable(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Variable(_) | ExprKind::Index { .. } | ExprKind::FieldAccess { .. }
        )
    }

    /// Visit each direct child expression (statements and blocks are not
    /// descended into).
    pub fn walk_children<'s>(&'s self, mut f: impl FnMut(&'s Expr)) {
        match &self.kind {
            ExprKind::Literal(_)
            | ExprKind::Variable(_)
            | ExprKind::CaptureVar(_)
            | ExprKind::Closure(_)
            | ExprKind::DoBlock(_) => {}
            ExprKind::StringInterp(segs) => {
                for seg in segs {
                    if let StringSeg::Expr(e) = seg {
                        f(e);
                    }
                }
            }
            ExprKind::ListLiteral(items) => items.iter().for_each(&mut f),
            ExprKind::MapLiteral { entries, .. } => {
                for (_, v) in entries {
                    f(v);
                }
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            ExprKind::Prefix { expr, .. } | ExprKind::Postfix { expr, .. } => f(expr),
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                f(cond);
                f(then_expr);
                f(else_expr);
            }
            ExprKind::Elvis { value, fallback } => {
                f(value);
                f(fallback);
            }
            ExprKind::TypeCast { expr, .. } | ExprKind::AsConvert { expr, .. } => f(expr),
            ExprKind::InstanceOf { expr, .. } => f(expr),
            ExprKind::InOp { item, collection, .. } => {
                f(item);
                f(collection);
            }
            ExprKind::Index { target, index, .. } => {
                f(target);
                f(index);
            }
            ExprKind::FieldAccess { target, .. } => f(target),
            ExprKind::Call { callee, args } => {
                f(callee);
                args.iter().for_each(&mut f);
            }
            ExprKind::MethodCall { target, args, .. } => {
                f(target);
                args.iter().for_each(&mut f);
            }
            ExprKind::Assign { target, value, .. } => {
                f(target);
                f(value);
            }
            ExprKind::RegexMatch {
                subject, pattern, ..
            } => {
                f(subject);
                f(pattern);
            }
            ExprKind::RegexSubst {
                subject,
                pattern,
                replacement,
                ..
            } => {
                f(subject);
                f(pattern);
                f(replacement);
            }
            ExprKind::New { args, .. } => args.iter().for_each(&mut f),
        }
    }
}

impl TypeSpec {
    /// Name as written in source, for error messages.
    pub fn display_name(&self) -> String {
        match self {
            TypeSpec::Inferred => "var".to_string(),
            TypeSpec::Dynamic => "def".to_string(),
            TypeSpec::Boolean => "boolean".to_string(),
            TypeSpec::Int => "int".to_string(),
            TypeSpec::Long => "long".to_string(),
            TypeSpec::Double => "double".to_string(),
            TypeSpec::Decimal => "Decimal".to_string(),
            TypeSpec::Str => "String".to_string(),
            TypeSpec::List => "List".to_string(),
            TypeSpec::Map => "Map".to_string(),
            TypeSpec::Void => "void".to_string(),
            TypeSpec::Named(path) => path
                .iter()
                .map(|i| i.name.as_str())
                .collect::<Vec<_>>()
                .join("."),
        }
    }
}
