//! AST-to-ops lowering
//!
//! One code unit per resolved function, plus one synthesized wrapper per
//! function that needs canonical-argument handling (defaults, named
//! arguments, single-list spreading). The wrapper accepts the canonical
//! `(positional list, named map)` vector, binds what was provided, fills
//! defaults in declaration order, and tail-calls the target.

use crate::compiler::code::{CodeUnit, Origin, OwnCell, ParamMeta, Program, RuntimeClass};
use crate::compiler::op::{Op, RegexFlags, TypeTag};
use crate::parser::ast::*;
use crate::parser::token::Span;
use crate::resolver::classes::ClassDescriptor;
use crate::resolver::symbols::{CallTarget, FunId, VarId, VarUse};
use crate::resolver::Resolution;
use crate::types::Type;
use crate::vm::value::Value;
use bigdecimal::BigDecimal;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Lower a resolved script into a program.
pub fn lower(script: &Script, res: &Resolution, origin: Origin) -> Program {
    let mut decls = DeclIndex::default();
    decls.index_fun(&script.main);
    for class in &script.classes {
        decls.index_class(class);
    }

    // Wrapper unit ids follow the function units
    let fun_count = res.functions.len();
    let mut wrapper_ids = FxHashMap::default();
    let mut next_unit = fun_count;
    for f in 0..fun_count {
        if res.functions[f].needs_wrapper {
            wrapper_ids.insert(f, next_unit);
            next_unit += 1;
        }
    }

    let lowerer = Lowerer {
        res,
        decls: &decls,
        wrapper_ids: &wrapper_ids,
    };

    let mut units: Vec<Option<CodeUnit>> = Vec::with_capacity(next_unit);
    units.resize_with(next_unit, || None);
    for f in 0..fun_count {
        let unit = if res.functions[f].is_init {
            lowerer.lower_init(f, origin)
        } else {
            let node = res.functions[f].node.expect("function without a node");
            let decl = decls.funs.get(&node).expect("unindexed function decl");
            lowerer.lower_function(f, decl, origin)
        };
        units[f] = Some(unit);
        if let Some(&wrapper_id) = wrapper_ids.get(&f) {
            units[wrapper_id] = Some(lowerer.lower_wrapper(f, wrapper_id, origin));
        }
    }

    let classes = build_runtime_classes(res, &wrapper_ids);
    Program {
        name: script.name.clone(),
        functions: units
            .into_iter()
            .map(|u| Arc::new(u.expect("unit not lowered")))
            .collect(),
        classes,
        main: res.main_fun,
    }
}

fn build_runtime_classes(
    res: &Resolution,
    wrapper_ids: &FxHashMap<FunId, usize>,
) -> Vec<RuntimeClass> {
    let mut out = Vec::with_capacity(res.classes.len());
    for (class_id, class) in res.classes.iter().enumerate() {
        let fields = ClassDescriptor::all_fields(&res.classes, class_id);
        // Base-first so overrides shadow inherited entries
        let mut chain = Vec::new();
        let mut cur = Some(class_id);
        while let Some(c) = cur {
            chain.push(c);
            cur = res.classes[c].base;
        }
        let mut methods = FxHashMap::default();
        for c in chain.into_iter().rev() {
            for (name, method) in &res.classes[c].methods {
                methods.insert(name.clone(), method.fun);
            }
        }
        out.push(RuntimeClass {
            name: Arc::from(class.full_name.as_str()),
            class_id,
            base: class.base,
            field_names: fields.into_iter().map(|f| f.name).collect(),
            methods,
            init_wrapper: *wrapper_ids
                .get(&class.init_fun)
                .expect("initializer without wrapper"),
        });
    }
    out
}

/// AST declarations by node id (function bodies, field defaults).
#[derive(Default)]
struct DeclIndex<'a> {
    funs: FxHashMap<NodeId, &'a FunDecl>,
    vars: FxHashMap<NodeId, &'a VarDecl>,
}

impl<'a> DeclIndex<'a> {
    fn index_class(&mut self, class: &'a ClassDecl) {
        for field in &class.fields {
            self.vars.insert(field.id, field);
            if let Some(init) = &field.init {
                self.index_expr(init);
            }
        }
        for method in &class.methods {
            self.index_fun(method);
        }
        for inner in &class.inner_classes {
            self.index_class(inner);
        }
    }

    fn index_fun(&mut self, fun: &'a FunDecl) {
        self.funs.insert(fun.id, fun);
        for param in &fun.params {
            if let Some(default) = &param.default {
                self.index_expr(default);
            }
        }
        self.index_block(&fun.body);
    }

    fn index_block(&mut self, block: &'a Block) {
        for stmt in &block.stmts {
            self.index_stmt(stmt);
        }
    }

    fn index_stmt(&mut self, stmt: &'a Stmt) {
        match &stmt.kind {
            StmtKind::Expr(e) => self.index_expr(e),
            StmtKind::VarDecl(decl) => {
                self.vars.insert(decl.id, decl);
                if let Some(init) = &decl.init {
                    self.index_expr(init);
                }
            }
            StmtKind::FunDecl(fun) => self.index_fun(fun),
            StmtKind::ClassDecl(class) => self.index_class(class),
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.index_expr(cond);
                self.index_block(then_block);
                if let Some(e) = else_block {
                    self.index_block(e);
                }
            }
            StmtKind::While { cond, body, update } => {
                self.index_expr(cond);
                self.index_block(body);
                for u in update {
                    self.index_expr(u);
                }
            }
            StmtKind::Return { value } => {
                if let Some(v) = value {
                    self.index_expr(v);
                }
            }
            StmtKind::Print { value, .. } | StmtKind::Die { value } => {
                if let Some(v) = value {
                    self.index_expr(v);
                }
            }
            StmtKind::Block(block) => self.index_block(block),
            StmtKind::Break | StmtKind::Continue | StmtKind::Import { .. } => {}
        }
    }

    fn index_expr(&mut self, expr: &'a Expr) {
        if let ExprKind::Closure(fun) = &expr.kind {
            self.index_fun(fun);
        }
        if let ExprKind::DoBlock(block) = &expr.kind {
            self.index_block(block);
        }
        expr.walk_children(|child| self.index_expr(child));
    }
}

struct LoopCtx {
    break_patches: Vec<usize>,
    continue_patches: Vec<usize>,
}

/// Per-function lowering state.
struct FnCtx {
    fun: FunId,
    ops: Vec<Op>,
    spans: Vec<Span>,
    loops: Vec<LoopCtx>,
    /// Base slot count from the resolver; scratch slots go after
    base_locals: u16,
    scratch: Option<u16>,
    /// Slot displacement when compiling default expressions inside a
    /// wrapper (target parameter slots shift by two)
    slot_offset: u16,
    /// Inside a wrapper, hoisted target parameters are still plain
    /// slots (the target frame creates their cells on entry)
    wrapper_mode: bool,
}

impl FnCtx {
    fn emit(&mut self, op: Op, span: Span) -> usize {
        self.ops.push(op);
        self.spans.push(span);
        self.ops.len() - 1
    }

    fn here(&self) -> usize {
        self.ops.len()
    }

    fn patch(&mut self, at: usize) {
        let target = self.ops.len();
        match &mut self.ops[at] {
            Op::Jump(t)
            | Op::JumpIfFalse(t)
            | Op::JumpIfFalseOrPop(t)
            | Op::JumpIfTrueOrPop(t)
            | Op::JumpIfNull(t)
            | Op::JumpIfBound { target: t, .. } => *t = target,
            other => panic!("patching a non-jump op {:?}", other),
        }
    }

    fn scratch_slot(&mut self) -> u16 {
        match self.scratch {
            Some(slot) => slot,
            None => {
                let slot = self.base_locals;
                self.scratch = Some(slot);
                slot
            }
        }
    }

    fn locals_total(&self) -> u16 {
        self.base_locals + u16::from(self.scratch.is_some())
    }
}

struct Lowerer<'a> {
    res: &'a Resolution,
    decls: &'a DeclIndex<'a>,
    wrapper_ids: &'a FxHashMap<FunId, usize>,
}

impl<'a> Lowerer<'a> {
    // ------------------------------------------------------------------
    // Units
    // ------------------------------------------------------------------

    fn new_ctx(&self, fun: FunId, slot_offset: u16, extra_slots: u16) -> FnCtx {
        FnCtx {
            fun,
            ops: Vec::new(),
            spans: Vec::new(),
            loops: Vec::new(),
            base_locals: self.res.functions[fun].locals_count + extra_slots,
            scratch: None,
            slot_offset,
            wrapper_mode: slot_offset != 0,
        }
    }

    fn finish_unit(
        &self,
        ctx: FnCtx,
        name: String,
        fun_id: usize,
        params: u16,
        is_wrapper: bool,
        origin: Origin,
    ) -> CodeUnit {
        let info = &self.res.functions[ctx.fun];
        let param_meta: Vec<ParamMeta> = info
            .param_names
            .iter()
            .zip(&info.param_has_default)
            .map(|(name, &has_default)| ParamMeta {
                name: name.clone(),
                has_default,
            })
            .collect();
        let own_cells = if is_wrapper {
            Vec::new()
        } else {
            info.own_cells
                .iter()
                .map(|&v| OwnCell {
                    seed_param: self.res.vars[v]
                        .is_param
                        .then_some(self.res.vars[v].slot),
                })
                .collect()
        };
        CodeUnit {
            name,
            fun_id,
            params,
            locals: ctx.locals_total(),
            is_async: info.is_async,
            is_wrapper,
            is_method: info.owner_class.is_some(),
            is_init: info.is_init,
            param_meta,
            capture_count: info.captures.len() as u16,
            own_cells,
            ops: ctx.ops,
            spans: ctx.spans,
            wrapper: self.wrapper_ids.get(&ctx.fun).copied(),
            origin,
        }
    }

    fn lower_function(&self, fun: FunId, decl: &FunDecl, origin: Origin) -> CodeUnit {
        let mut ctx = self.new_ctx(fun, 0, 0);
        self.lower_body(&mut ctx, &decl.body, decl.span);
        let info = &self.res.functions[fun];
        self.finish_unit(
            ctx,
            info.name.clone(),
            fun,
            info.params.len() as u16,
            false,
            origin,
        )
    }

    /// Function bodies yield their last expression's value.
    fn lower_body(&self, ctx: &mut FnCtx, body: &Block, span: Span) {
        self.lower_stmts_with_tail(ctx, &body.stmts, span);
        ctx.emit(Op::Return, span);
    }

    fn lower_stmts_with_tail(&self, ctx: &mut FnCtx, stmts: &[Stmt], span: Span) {
        match stmts.split_last() {
            None => {
                ctx.emit(Op::Const(Value::Null), span);
            }
            Some((last, rest)) => {
                for stmt in rest {
                    self.lower_stmt(ctx, stmt);
                }
                if let StmtKind::Expr(e) = &last.kind {
                    self.lower_expr(ctx, e);
                } else {
                    self.lower_stmt(ctx, last);
                    ctx.emit(Op::Const(Value::Null), last.span);
                }
            }
        }
    }

    /// The synthesized initializer assigns every constructor parameter
    /// to its field and returns `this`.
    fn lower_init(&self, fun: FunId, origin: Origin) -> CodeUnit {
        let info = &self.res.functions[fun];
        let span = info.decl_span;
        let mut ctx = self.new_ctx(fun, 0, 0);
        for (i, name) in info.param_names.iter().enumerate() {
            ctx.emit(Op::LoadLocal(0), span);
            ctx.emit(Op::LoadLocal(1 + i as u16), span);
            ctx.emit(
                Op::SetField {
                    name: name.clone(),
                    null_safe: false,
                    keep_value: false,
                },
                span,
            );
        }
        ctx.emit(Op::LoadLocal(0), span);
        ctx.emit(Op::Return, span);
        self.finish_unit(
            ctx,
            info.name.clone(),
            fun,
            info.params.len() as u16,
            false,
            origin,
        )
    }

    /// The canonical-argument wrapper of `fun`.
    fn lower_wrapper(&self, fun: FunId, wrapper_id: usize, origin: Origin) -> CodeUnit {
        let info = &self.res.functions[fun];
        let span = info.decl_span;
        let is_method = info.owner_class.is_some();
        let param_count = info.param_names.len();
        let own_params = if is_method { 3 } else { 2 };
        let param_base: u16 = if is_method { 3 } else { 2 };

        // Wrapper slots: [this?] list map target-params...; target slots
        // shift by two
        let mut ctx = self.new_ctx(fun, 2, own_params);
        ctx.base_locals = own_params + param_count as u16;
        ctx.emit(Op::BindArgs { target: fun }, span);

        for i in 0..param_count {
            if !info.param_has_default[i] {
                continue;
            }
            let default_expr = self.default_expr_of(fun, i);
            let Some(default_expr) = default_expr else {
                continue;
            };
            let bound = ctx.emit(
                Op::JumpIfBound {
                    param: i as u16,
                    target: usize::MAX,
                },
                span,
            );
            self.lower_expr(&mut ctx, default_expr);
            ctx.emit(Op::StoreLocal(param_base + i as u16), default_expr.span);
            ctx.patch(bound);
        }

        if is_method {
            ctx.emit(Op::LoadLocal(0), span);
        }
        for i in 0..param_count {
            ctx.emit(Op::LoadLocal(param_base + i as u16), span);
        }
        let argc = param_count + usize::from(is_method);
        let cells: Vec<u16> = (0..info.captures.len() as u16).collect();
        ctx.emit(
            Op::CallStatic {
                fun,
                argc: argc as u8,
                cells,
            },
            span,
        );
        ctx.emit(Op::Return, span);

        let name = format!("{}+wrapper", info.name);
        self.finish_unit(ctx, name, wrapper_id, own_params, true, origin)
    }

    /// The AST expression for a parameter (or field) default.
    fn default_expr_of(&self, fun: FunId, index: usize) -> Option<&'a Expr> {
        let info = &self.res.functions[fun];
        if info.is_init {
            let class_id = info.owner_class.expect("init without class");
            let fields = ClassDescriptor::all_fields(&self.res.classes, class_id);
            let field = &fields[index];
            self.decls
                .vars
                .get(&field.node)
                .and_then(|decl| decl.init.as_ref())
        } else {
            let node = info.node?;
            let decl = self.decls.funs.get(&node)?;
            decl.params[index].default.as_ref()
        }
    }

    // ------------------------------------------------------------------
    // Variables and cells
    // ------------------------------------------------------------------

    /// Index of a variable's cell within the current frame's cell
    /// vector: captures first, then own hoisted cells.
    fn cell_index(&self, fun: FunId, var: VarId) -> u16 {
        let info = &self.res.functions[fun];
        if let Some(i) = info.captures.iter().position(|&v| v == var) {
            return i as u16;
        }
        let own = info
            .own_cells
            .iter()
            .position(|&v| v == var)
            .expect("captured variable has no cell in this frame");
        (info.captures.len() + own) as u16
    }

    fn capture_cells(&self, ctx: &FnCtx, target: FunId) -> Vec<u16> {
        self.res.functions[target]
            .captures
            .iter()
            .map(|&v| self.cell_index(ctx.fun, v))
            .collect()
    }

    fn emit_load_var(&self, ctx: &mut FnCtx, use_: &VarUse, span: Span) {
        match use_ {
            VarUse::Local(v) => {
                let var = &self.res.vars[*v];
                if var.is_heap && !(ctx.wrapper_mode && var.is_param) {
                    let idx = self.cell_index(ctx.fun, *v);
                    ctx.emit(Op::LoadCell(idx), span);
                } else {
                    ctx.emit(Op::LoadLocal(var.slot + ctx.slot_offset), span);
                }
            }
            VarUse::Capture(v) => {
                let idx = self.cell_index(ctx.fun, *v);
                ctx.emit(Op::LoadCell(idx), span);
            }
            VarUse::Global(name) => {
                ctx.emit(Op::LoadGlobal(name.clone()), span);
            }
            VarUse::Field(name) => {
                ctx.emit(Op::LoadLocal(0), span);
                ctx.emit(
                    Op::GetField {
                        name: name.clone(),
                        null_safe: false,
                        create_if_missing: false,
                    },
                    span,
                );
            }
            VarUse::FunctionRef(f) => {
                let cells = self.capture_cells(ctx, *f);
                ctx.emit(Op::MakeClosure { fun: *f, cells }, span);
            }
        }
    }

    /// Store the top of stack into a variable; `keep` leaves the value
    /// on the stack.
    fn emit_store_var(&self, ctx: &mut FnCtx, use_: &VarUse, keep: bool, span: Span) {
        if keep {
            ctx.emit(Op::Dup, span);
        }
        match use_ {
            VarUse::Local(v) => {
                let var = &self.res.vars[*v];
                if var.is_heap && !(ctx.wrapper_mode && var.is_param) {
                    let idx = self.cell_index(ctx.fun, *v);
                    ctx.emit(Op::StoreCell(idx), span);
                } else {
                    ctx.emit(Op::StoreLocal(var.slot + ctx.slot_offset), span);
                }
            }
            VarUse::Capture(v) => {
                let idx = self.cell_index(ctx.fun, *v);
                ctx.emit(Op::StoreCell(idx), span);
            }
            VarUse::Global(name) => {
                ctx.emit(Op::StoreGlobal(name.clone()), span);
            }
            VarUse::Field(name) => {
                // Stack is [value]; fetch `this` under it
                ctx.emit(Op::LoadLocal(0), span);
                ctx.emit(Op::Swap, span);
                ctx.emit(
                    Op::SetField {
                        name: name.clone(),
                        null_safe: false,
                        keep_value: false,
                    },
                    span,
                );
            }
            VarUse::FunctionRef(_) => {
                // Rejected during resolution
            }
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn lower_stmt(&self, ctx: &mut FnCtx, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.lower_expr(ctx, expr);
                ctx.emit(Op::Pop, stmt.span);
            }
            StmtKind::VarDecl(decl) => {
                match &decl.init {
                    Some(init) => self.lower_expr(ctx, init),
                    None => {
                        let var = self.res.decl_vars[&decl.id];
                        let default = default_value(self.res.vars[var].ty);
                        ctx.emit(Op::Const(default), decl.span);
                    }
                }
                let var = self.res.decl_vars[&decl.id];
                self.emit_store_var(ctx, &VarUse::Local(var), false, decl.span);
            }
            StmtKind::FunDecl(_) => {
                // Compiled as its own unit; references create closures
            }
            StmtKind::ClassDecl(_) => {
                // Rejected during resolution
            }
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.lower_expr(ctx, cond);
                let to_else = ctx.emit(Op::JumpIfFalse(usize::MAX), cond.span);
                self.lower_block_stmts(ctx, then_block);
                match else_block {
                    Some(else_block) => {
                        let to_end = ctx.emit(Op::Jump(usize::MAX), stmt.span);
                        ctx.patch(to_else);
                        self.lower_block_stmts(ctx, else_block);
                        ctx.patch(to_end);
                    }
                    None => ctx.patch(to_else),
                }
            }
            StmtKind::While { cond, body, update } => {
                let start = ctx.here();
                self.lower_expr(ctx, cond);
                let to_end = ctx.emit(Op::JumpIfFalse(usize::MAX), cond.span);
                ctx.loops.push(LoopCtx {
                    break_patches: vec![to_end],
                    continue_patches: Vec::new(),
                });
                self.lower_block_stmts(ctx, body);
                let update_at = ctx.here();
                for u in update {
                    self.lower_expr(ctx, u);
                    ctx.emit(Op::Pop, u.span);
                }
                ctx.emit(Op::Jump(start), stmt.span);
                let loop_ctx = ctx.loops.pop().expect("loop context");
                for at in loop_ctx.break_patches {
                    ctx.patch(at);
                }
                for at in loop_ctx.continue_patches {
                    match &mut ctx.ops[at] {
                        Op::Jump(t) => *t = update_at,
                        _ => unreachable!("continue patch on non-jump"),
                    }
                }
            }
            StmtKind::Break => {
                let at = ctx.emit(Op::Jump(usize::MAX), stmt.span);
                if let Some(loop_ctx) = ctx.loops.last_mut() {
                    loop_ctx.break_patches.push(at);
                }
            }
            StmtKind::Continue => {
                let at = ctx.emit(Op::Jump(usize::MAX), stmt.span);
                if let Some(loop_ctx) = ctx.loops.last_mut() {
                    loop_ctx.continue_patches.push(at);
                }
            }
            StmtKind::Return { value } => {
                match value {
                    Some(value) => self.lower_expr(ctx, value),
                    None => {
                        ctx.emit(Op::Const(Value::Null), stmt.span);
                    }
                }
                ctx.emit(Op::Return, stmt.span);
            }
            StmtKind::Print { value, newline } => {
                match value {
                    Some(value) => self.lower_expr(ctx, value),
                    None => {
                        ctx.emit(Op::Const(Value::string("")), stmt.span);
                    }
                }
                ctx.emit(Op::Print { newline: *newline }, stmt.span);
            }
            StmtKind::Die { value } => {
                if let Some(value) = value {
                    self.lower_expr(ctx, value);
                }
                ctx.emit(
                    Op::Die {
                        has_value: value.is_some(),
                    },
                    stmt.span,
                );
            }
            StmtKind::Block(block) => self.lower_block_stmts(ctx, block),
            StmtKind::Import { .. } => {}
        }
    }

    fn lower_block_stmts(&self, ctx: &mut FnCtx, block: &Block) {
        for stmt in &block.stmts {
            self.lower_stmt(ctx, stmt);
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn lower_expr(&self, ctx: &mut FnCtx, expr: &Expr) {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Literal(lit) => {
                ctx.emit(Op::Const(literal_value(lit)), span);
            }
            ExprKind::StringInterp(segs) => {
                for seg in segs {
                    match seg {
                        StringSeg::Lit(s) => {
                            ctx.emit(Op::Const(Value::string(s.clone())), span);
                        }
                        StringSeg::Expr(e) => self.lower_expr(ctx, e),
                    }
                }
                ctx.emit(Op::BuildString(segs.len() as u16), span);
            }
            ExprKind::Variable(_) => {
                let use_ = self.res.var_uses.get(&expr.id).cloned().unwrap_or(
                    VarUse::Global("?".to_string()),
                );
                self.emit_load_var(ctx, &use_, span);
            }
            ExprKind::CaptureVar(n) => {
                ctx.emit(Op::LoadCaptureVar(*n as u16), span);
            }
            ExprKind::ListLiteral(items) => {
                for item in items {
                    self.lower_expr(ctx, item);
                }
                ctx.emit(Op::NewList(items.len() as u16), span);
            }
            ExprKind::MapLiteral { entries, .. } => {
                for (key, value) in entries {
                    ctx.emit(Op::Const(Value::string(key.name.clone())), key.span);
                    self.lower_expr(ctx, value);
                }
                ctx.emit(Op::NewMap(entries.len() as u16), span);
            }
            ExprKind::Binary { op, lhs, rhs } => match op {
                BinOp::And => {
                    self.lower_expr(ctx, lhs);
                    let short = ctx.emit(Op::JumpIfFalseOrPop(usize::MAX), span);
                    self.lower_expr(ctx, rhs);
                    ctx.patch(short);
                    ctx.emit(Op::ToBool, span);
                }
                BinOp::Or => {
                    self.lower_expr(ctx, lhs);
                    let short = ctx.emit(Op::JumpIfTrueOrPop(usize::MAX), span);
                    self.lower_expr(ctx, rhs);
                    ctx.patch(short);
                    ctx.emit(Op::ToBool, span);
                }
                other => {
                    self.lower_expr(ctx, lhs);
                    self.lower_expr(ctx, rhs);
                    ctx.emit(Op::Binary(*other), span);
                }
            },
            ExprKind::Prefix { op, expr: operand } => match op {
                PrefixOp::Not => {
                    self.lower_expr(ctx, operand);
                    ctx.emit(Op::Not, span);
                }
                PrefixOp::Neg => {
                    self.lower_expr(ctx, operand);
                    ctx.emit(Op::Negate, span);
                }
                PrefixOp::Plus => {
                    self.lower_expr(ctx, operand);
                    ctx.emit(Op::UnaryPlus, span);
                }
                PrefixOp::BitNot => {
                    self.lower_expr(ctx, operand);
                    ctx.emit(Op::BitNot, span);
                }
                PrefixOp::Incr => self.lower_incr_decr(ctx, operand, BinOp::Add, true, span),
                PrefixOp::Decr => self.lower_incr_decr(ctx, operand, BinOp::Sub, true, span),
            },
            ExprKind::Postfix { op, expr: operand } => {
                let bin = match op {
                    PostfixOp::Incr => BinOp::Add,
                    PostfixOp::Decr => BinOp::Sub,
                };
                self.lower_incr_decr(ctx, operand, bin, false, span);
            }
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                self.lower_expr(ctx, cond);
                let to_else = ctx.emit(Op::JumpIfFalse(usize::MAX), cond.span);
                self.lower_expr(ctx, then_expr);
                let to_end = ctx.emit(Op::Jump(usize::MAX), span);
                ctx.patch(to_else);
                self.lower_expr(ctx, else_expr);
                ctx.patch(to_end);
            }
            ExprKind::Elvis { value, fallback } => {
                self.lower_expr(ctx, value);
                let short = ctx.emit(Op::JumpIfTrueOrPop(usize::MAX), span);
                self.lower_expr(ctx, fallback);
                ctx.patch(short);
            }
            ExprKind::TypeCast { ty, expr: operand }
            | ExprKind::AsConvert { expr: operand, ty } => {
                self.lower_expr(ctx, operand);
                ctx.emit(Op::Convert(self.type_tag(ty)), span);
            }
            ExprKind::InstanceOf {
                expr: operand,
                ty,
                negated,
            } => {
                self.lower_expr(ctx, operand);
                ctx.emit(
                    Op::InstanceOfOp {
                        tag: self.type_tag(ty),
                        negated: *negated,
                    },
                    span,
                );
            }
            ExprKind::InOp {
                item,
                collection,
                negated,
            } => {
                self.lower_expr(ctx, item);
                self.lower_expr(ctx, collection);
                ctx.emit(Op::InOp { negated: *negated }, span);
            }
            ExprKind::Index {
                target,
                index,
                null_safe,
            } => {
                self.lower_expr(ctx, target);
                self.lower_expr(ctx, index);
                ctx.emit(
                    Op::Index {
                        null_safe: *null_safe,
                        create_if_missing: false,
                    },
                    span,
                );
            }
            ExprKind::FieldAccess {
                target,
                name,
                null_safe,
            } => {
                self.lower_expr(ctx, target);
                ctx.emit(
                    Op::GetField {
                        name: name.name.clone(),
                        null_safe: *null_safe,
                        create_if_missing: false,
                    },
                    span,
                );
            }
            ExprKind::Call { callee, args } => self.lower_call(ctx, expr, callee, args),
            ExprKind::MethodCall {
                target,
                name,
                args,
                null_safe,
            } => self.lower_method_call(ctx, expr, target, name, args, *null_safe),
            ExprKind::Closure(fun_decl) => {
                let fun = self.res.fun_ids[&fun_decl.id];
                let cells = self.capture_cells(ctx, fun);
                ctx.emit(Op::MakeClosure { fun, cells }, span);
            }
            ExprKind::Assign {
                target,
                value,
                op,
                conditional,
            } => {
                self.lower_assign(ctx, target, value, *op, *conditional, true, span);
            }
            ExprKind::RegexMatch {
                subject,
                pattern,
                modifiers,
                negated,
            } => {
                self.lower_expr(ctx, subject);
                self.lower_expr(ctx, pattern);
                ctx.emit(
                    Op::RegexMatch {
                        site: expr.id,
                        global: modifiers.contains('g'),
                        negated: *negated,
                        flags: RegexFlags::from_modifiers(modifiers),
                    },
                    span,
                );
            }
            ExprKind::RegexSubst {
                subject,
                pattern,
                replacement,
                modifiers,
            } => {
                self.lower_expr(ctx, subject);
                self.lower_expr(ctx, pattern);
                self.lower_expr(ctx, replacement);
                ctx.emit(
                    Op::RegexSubst {
                        site: expr.id,
                        global: modifiers.contains('g'),
                        flags: RegexFlags::from_modifiers(modifiers),
                    },
                    span,
                );
            }
            ExprKind::New { args, .. } => {
                let class = self.res.new_classes[&expr.id];
                ctx.emit(Op::NewInstance { class }, span);
                let named = is_named_args(args);
                for arg in args {
                    self.lower_expr(ctx, arg);
                }
                ctx.emit(
                    Op::CallInit {
                        class,
                        argc: args.len() as u8,
                        named,
                    },
                    span,
                );
            }
            ExprKind::DoBlock(block) => {
                self.lower_stmts_with_tail(ctx, &block.stmts, span);
            }
        }
    }

    fn type_tag(&self, ty: &TypeSpec) -> TypeTag {
        match ty {
            TypeSpec::Boolean => TypeTag::Bool,
            TypeSpec::Int => TypeTag::Int,
            TypeSpec::Long => TypeTag::Long,
            TypeSpec::Double => TypeTag::Double,
            TypeSpec::Decimal => TypeTag::Decimal,
            TypeSpec::Str => TypeTag::Str,
            TypeSpec::List => TypeTag::List,
            TypeSpec::Map => TypeTag::Map,
            TypeSpec::Named(path) => {
                // Resolved during the resolver pass; map back by name
                let name = path
                    .iter()
                    .map(|i| i.name.as_str())
                    .collect::<Vec<_>>()
                    .join(".");
                let class = self
                    .res
                    .classes
                    .iter()
                    .position(|c| c.full_name == name || c.name == name)
                    .unwrap_or(0);
                TypeTag::Instance(class)
            }
            TypeSpec::Inferred | TypeSpec::Dynamic | TypeSpec::Void => TypeTag::Any,
        }
    }

    fn lower_incr_decr(
        &self,
        ctx: &mut FnCtx,
        target: &Expr,
        op: BinOp,
        prefix: bool,
        span: Span,
    ) {
        match &target.kind {
            ExprKind::Variable(_) => {
                let use_ = self.res.var_uses[&target.id].clone();
                self.emit_load_var(ctx, &use_, span);
                if !prefix {
                    ctx.emit(Op::Dup, span);
                }
                ctx.emit(Op::Const(Value::Int(1)), span);
                ctx.emit(Op::Binary(op), span);
                if prefix {
                    self.emit_store_var(ctx, &use_, true, span);
                } else {
                    self.emit_store_var(ctx, &use_, false, span);
                }
            }
            ExprKind::FieldAccess { target: inner, name, .. } => {
                self.lower_expr(ctx, inner);
                ctx.emit(Op::Dup, span);
                ctx.emit(
                    Op::GetField {
                        name: name.name.clone(),
                        null_safe: false,
                        create_if_missing: true,
                    },
                    span,
                );
                if prefix {
                    ctx.emit(Op::Const(Value::Int(1)), span);
                    ctx.emit(Op::Binary(op), span);
                    ctx.emit(
                        Op::SetField {
                            name: name.name.clone(),
                            null_safe: false,
                            keep_value: true,
                        },
                        span,
                    );
                } else {
                    let tmp = ctx.scratch_slot();
                    ctx.emit(Op::Dup, span);
                    ctx.emit(Op::StoreLocal(tmp), span);
                    ctx.emit(Op::Const(Value::Int(1)), span);
                    ctx.emit(Op::Binary(op), span);
                    ctx.emit(
                        Op::SetField {
                            name: name.name.clone(),
                            null_safe: false,
                            keep_value: false,
                        },
                        span,
                    );
                    ctx.emit(Op::LoadLocal(tmp), span);
                }
            }
            ExprKind::Index { target: inner, index, .. } => {
                self.lower_expr(ctx, inner);
                self.lower_expr(ctx, index);
                ctx.emit(Op::Dup2, span);
                ctx.emit(
                    Op::Index {
                        null_safe: false,
                        create_if_missing: true,
                    },
                    span,
                );
                if prefix {
                    ctx.emit(Op::Const(Value::Int(1)), span);
                    ctx.emit(Op::Binary(op), span);
                    ctx.emit(
                        Op::IndexStore {
                            null_safe: false,
                            keep_value: true,
                        },
                        span,
                    );
                } else {
                    let tmp = ctx.scratch_slot();
                    ctx.emit(Op::Dup, span);
                    ctx.emit(Op::StoreLocal(tmp), span);
                    ctx.emit(Op::Const(Value::Int(1)), span);
                    ctx.emit(Op::Binary(op), span);
                    ctx.emit(
                        Op::IndexStore {
                            null_safe: false,
                            keep_value: false,
                        },
                        span,
                    );
                    ctx.emit(Op::LoadLocal(tmp), span);
                }
            }
            _ => {
                // Rejected during resolution
                self.lower_expr(ctx, target);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_assign(
        &self,
        ctx: &mut FnCtx,
        target: &Expr,
        value: &Expr,
        op: Option<BinOp>,
        conditional: bool,
        used: bool,
        span: Span,
    ) {
        if conditional {
            self.lower_conditional_assign(ctx, target, value, used, span);
            return;
        }
        match &target.kind {
            ExprKind::Variable(_) => {
                let use_ = self.res.var_uses[&target.id].clone();
                match op {
                    None => self.lower_expr(ctx, value),
                    Some(op) => {
                        self.emit_load_var(ctx, &use_, span);
                        self.lower_expr(ctx, value);
                        ctx.emit(Op::Binary(op), span);
                    }
                }
                self.emit_store_var(ctx, &use_, used, span);
                if !used {
                    return;
                }
            }
            ExprKind::FieldAccess { target: inner, name, .. } => {
                self.lower_lvalue_prefix(ctx, inner);
                match op {
                    None => self.lower_expr(ctx, value),
                    Some(op) => {
                        ctx.emit(Op::Dup, span);
                        ctx.emit(
                            Op::GetField {
                                name: name.name.clone(),
                                null_safe: false,
                                create_if_missing: true,
                            },
                            span,
                        );
                        self.lower_expr(ctx, value);
                        ctx.emit(Op::Binary(op), span);
                    }
                }
                ctx.emit(
                    Op::SetField {
                        name: name.name.clone(),
                        null_safe: false,
                        keep_value: used,
                    },
                    span,
                );
            }
            ExprKind::Index { target: inner, index, null_safe } => {
                self.lower_lvalue_prefix(ctx, inner);
                self.lower_expr(ctx, index);
                match op {
                    None => self.lower_expr(ctx, value),
                    Some(op) => {
                        ctx.emit(Op::Dup2, span);
                        ctx.emit(
                            Op::Index {
                                null_safe: false,
                                create_if_missing: true,
                            },
                            span,
                        );
                        self.lower_expr(ctx, value);
                        ctx.emit(Op::Binary(op), span);
                    }
                }
                ctx.emit(
                    Op::IndexStore {
                        null_safe: *null_safe,
                        keep_value: used,
                    },
                    span,
                );
            }
            _ => {
                // Rejected during resolution; evaluate for effect
                self.lower_expr(ctx, value);
            }
        }
    }

    /// `target ?= value`: store only when the value is non-null; the
    /// expression yields the value (or null).
    fn lower_conditional_assign(
        &self,
        ctx: &mut FnCtx,
        target: &Expr,
        value: &Expr,
        used: bool,
        span: Span,
    ) {
        let tmp = ctx.scratch_slot();
        self.lower_expr(ctx, value);
        ctx.emit(Op::StoreLocal(tmp), span);
        ctx.emit(Op::LoadLocal(tmp), span);
        let skip = ctx.emit(Op::JumpIfNull(usize::MAX), span);
        ctx.emit(Op::Pop, span);
        match &target.kind {
            ExprKind::Variable(_) => {
                let use_ = self.res.var_uses[&target.id].clone();
                ctx.emit(Op::LoadLocal(tmp), span);
                self.emit_store_var(ctx, &use_, true, span);
            }
            ExprKind::FieldAccess { target: inner, name, .. } => {
                self.lower_lvalue_prefix(ctx, inner);
                ctx.emit(Op::LoadLocal(tmp), span);
                ctx.emit(
                    Op::SetField {
                        name: name.name.clone(),
                        null_safe: false,
                        keep_value: true,
                    },
                    span,
                );
            }
            ExprKind::Index { target: inner, index, .. } => {
                self.lower_lvalue_prefix(ctx, inner);
                self.lower_expr(ctx, index);
                ctx.emit(Op::LoadLocal(tmp), span);
                ctx.emit(
                    Op::IndexStore {
                        null_safe: false,
                        keep_value: true,
                    },
                    span,
                );
            }
            _ => {
                ctx.emit(Op::LoadLocal(tmp), span);
            }
        }
        ctx.patch(skip);
        if !used {
            ctx.emit(Op::Pop, span);
        }
    }

    /// Lvalue prefixes auto-create missing map entries so nested stores
    /// like `m.a.b = 1` work on empty maps.
    fn lower_lvalue_prefix(&self, ctx: &mut FnCtx, expr: &Expr) {
        match &expr.kind {
            ExprKind::FieldAccess { target, name, null_safe } => {
                self.lower_lvalue_prefix(ctx, target);
                ctx.emit(
                    Op::GetField {
                        name: name.name.clone(),
                        null_safe: *null_safe,
                        create_if_missing: true,
                    },
                    expr.span,
                );
            }
            ExprKind::Index { target, index, null_safe } => {
                self.lower_lvalue_prefix(ctx, target);
                self.lower_expr(ctx, index);
                ctx.emit(
                    Op::Index {
                        null_safe: *null_safe,
                        create_if_missing: true,
                    },
                    expr.span,
                );
            }
            _ => self.lower_expr(ctx, expr),
        }
    }

    fn lower_call(&self, ctx: &mut FnCtx, expr: &Expr, callee: &Expr, args: &[Expr]) {
        let span = expr.span;
        let named = is_named_args(args);
        let target = self
            .res
            .call_targets
            .get(&expr.id)
            .cloned()
            .unwrap_or(CallTarget::Value);
        match target {
            CallTarget::Function(fun) => {
                let info = &self.res.functions[fun];
                let direct = !named && args.len() == info.param_names.len();
                let cells = self.capture_cells(ctx, fun);
                if direct {
                    for arg in args {
                        self.lower_expr(ctx, arg);
                    }
                    ctx.emit(
                        Op::CallStatic {
                            fun,
                            argc: args.len() as u8,
                            cells,
                        },
                        span,
                    );
                } else {
                    let wrapper = self.wrapper_ids.get(&fun).copied().unwrap_or(fun);
                    self.push_canonical_args(ctx, args, named, span);
                    ctx.emit(
                        Op::CallStatic {
                            fun: wrapper,
                            argc: 2,
                            cells,
                        },
                        span,
                    );
                }
            }
            CallTarget::Host(idx) => {
                for arg in args {
                    self.lower_expr(ctx, arg);
                }
                let host_op = if self.res.async_calls.contains(&expr.id) {
                    Op::CallHostAsync {
                        idx: idx as u32,
                        argc: args.len() as u8,
                    }
                } else {
                    Op::CallHost {
                        idx: idx as u32,
                        argc: args.len() as u8,
                    }
                };
                ctx.emit(host_op, span);
            }
            CallTarget::Eval => {
                for arg in args {
                    self.lower_expr(ctx, arg);
                }
                ctx.emit(
                    Op::Eval {
                        has_bindings: args.len() > 1,
                    },
                    span,
                );
            }
            CallTarget::SelfMethod(name) => {
                ctx.emit(Op::LoadLocal(0), span);
                for arg in args {
                    self.lower_expr(ctx, arg);
                }
                ctx.emit(
                    Op::CallMethod {
                        name,
                        argc: args.len() as u8,
                        null_safe: false,
                        named,
                    },
                    span,
                );
            }
            CallTarget::Value => {
                self.lower_expr(ctx, callee);
                for arg in args {
                    self.lower_expr(ctx, arg);
                }
                ctx.emit(
                    Op::CallValue {
                        argc: args.len() as u8,
                        named,
                    },
                    span,
                );
            }
        }
    }

    /// Push the wrapper's `(positional list, named map)` argument pair.
    fn push_canonical_args(&self, ctx: &mut FnCtx, args: &[Expr], named: bool, span: Span) {
        if named {
            ctx.emit(Op::NewList(0), span);
            self.lower_expr(ctx, &args[0]);
        } else {
            for arg in args {
                self.lower_expr(ctx, arg);
            }
            ctx.emit(Op::NewList(args.len() as u16), span);
            ctx.emit(Op::NewMap(0), span);
        }
    }

    fn lower_method_call(
        &self,
        ctx: &mut FnCtx,
        expr: &Expr,
        target: &Expr,
        name: &Ident,
        args: &[Expr],
        null_safe: bool,
    ) {
        let span = expr.span;
        let named = is_named_args(args);

        // Statically bound final methods call direct
        if let Some(&fun) = self.res.method_binds.get(&expr.id) {
            let info = &self.res.functions[fun];
            let direct = !named && args.len() == info.param_names.len();
            self.lower_expr(ctx, target);
            if direct {
                for arg in args {
                    self.lower_expr(ctx, arg);
                }
                ctx.emit(
                    Op::CallStatic {
                        fun,
                        argc: args.len() as u8 + 1,
                        cells: Vec::new(),
                    },
                    span,
                );
            } else {
                let wrapper = self.wrapper_ids.get(&fun).copied().unwrap_or(fun);
                self.push_canonical_args(ctx, args, named, span);
                ctx.emit(
                    Op::CallStatic {
                        fun: wrapper,
                        argc: 3,
                        cells: Vec::new(),
                    },
                    span,
                );
            }
            return;
        }

        self.lower_expr(ctx, target);
        for arg in args {
            self.lower_expr(ctx, arg);
        }
        ctx.emit(
            Op::CallMethod {
                name: name.name.clone(),
                argc: args.len() as u8,
                null_safe,
                named,
            },
            span,
        );
    }
}

fn is_named_args(args: &[Expr]) -> bool {
    matches!(
        args,
        [Expr {
            kind: ExprKind::MapLiteral {
                is_named_args: true,
                ..
            },
            ..
        }]
    )
}

fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Null => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(n) => Value::Int(*n),
        Literal::Long(n) => Value::Long(*n),
        Literal::Double(n) => Value::Double(*n),
        Literal::Decimal(d) => Value::decimal(d.clone()),
        Literal::Str(s) => Value::string(s.clone()),
    }
}

fn default_value(ty: Type) -> Value {
    match ty {
        Type::Bool => Value::Bool(false),
        Type::Int => Value::Int(0),
        Type::Long => Value::Long(0),
        Type::Double => Value::Double(0.0),
        Type::Decimal => Value::decimal(BigDecimal::from(0)),
        Type::Str => Value::string(""),
        _ => Value::Null,
    }
}
