//! The main resolution pass
//!
//! One in-order walk per function body: declarations bind, identifiers
//! resolve through the scope chain, captures register on every function
//! between the reference and the owning frame, and call sites record
//! their targets for lowering and for the async fixed point.

use super::classes::{ClassDescriptor, FieldInfo, MethodInfo};
use super::error::{ResolveError, ResolveErrorKind};
use super::fixpoint;
use super::symbols::*;
use super::{Resolution, ResolveOptions};
use crate::host::HostRegistry;
use crate::parser::ast::*;
use crate::parser::token::Span;
use crate::types::{ClassId, Type};
use rustc_hash::{FxHashMap, FxHashSet};

pub(super) struct Resolver<'a> {
    pub res: Resolution,
    pub errors: Vec<ResolveError>,
    registry: &'a HostRegistry,
    scopes: Vec<Scope>,
    fun_stack: Vec<FunId>,
    class_stack: Vec<ClassId>,
    /// Loop nesting per function (break/continue validity)
    loop_stack: Vec<usize>,
    /// Dotted class name -> id (aliases included)
    class_names: FxHashMap<String, ClassId>,
    /// Base-class paths recorded during pre-declaration
    base_paths: FxHashMap<ClassId, (String, Span)>,
    allow_implicit_globals: bool,
}

pub(super) fn run(
    script: &Script,
    registry: &HostRegistry,
    options: &ResolveOptions,
) -> Result<Resolution, Vec<ResolveError>> {
    let res = Resolution {
        vars: Vec::new(),
        functions: Vec::new(),
        classes: Vec::new(),
        var_uses: FxHashMap::default(),
        decl_vars: FxHashMap::default(),
        fun_ids: FxHashMap::default(),
        class_ids: FxHashMap::default(),
        call_targets: FxHashMap::default(),
        method_binds: FxHashMap::default(),
        expr_types: FxHashMap::default(),
        async_calls: FxHashSet::default(),
        new_classes: FxHashMap::default(),
        main_fun: 0,
        globals: options.globals.clone(),
    };
    let mut r = Resolver {
        res,
        errors: Vec::new(),
        registry,
        scopes: Vec::new(),
        fun_stack: Vec::new(),
        class_stack: Vec::new(),
        loop_stack: Vec::new(),
        class_names: FxHashMap::default(),
        base_paths: FxHashMap::default(),
        allow_implicit_globals: options.allow_implicit_globals,
    };

    // Script main is always function 0
    let main = r.new_function("main".to_string(), None, script.main.span);
    r.res.fun_ids.insert(script.main.id, main);
    r.res.main_fun = main;

    r.predeclare_classes(&script.classes, "");
    r.link_bases();
    r.declare_members(&script.classes);

    r.resolve_function_body(main, &script.main, None);
    r.resolve_class_bodies(&script.classes);

    fixpoint::close_captures(&mut r.res, &mut r.errors);
    fixpoint::propagate_async(&mut r.res);

    if r.errors.is_empty() {
        Ok(r.res)
    } else {
        Err(r.errors)
    }
}

impl<'a> Resolver<'a> {
    fn error(&mut self, kind: ResolveErrorKind, span: Span) {
        self.errors.push(ResolveError::new(kind, span));
    }

    fn current_fun(&self) -> FunId {
        *self.fun_stack.last().expect("no current function")
    }

    fn new_function(&mut self, name: String, enclosing: Option<FunId>, span: Span) -> FunId {
        let id = self.res.functions.len();
        self.res
            .functions
            .push(FunctionInfo::new(name, enclosing, span));
        id
    }

    fn new_var(
        &mut self,
        name: &str,
        ty: Type,
        is_param: bool,
        is_final: bool,
        span: Span,
    ) -> VarId {
        let fun = self.current_fun();
        let slot = self.res.functions[fun].locals_count;
        self.res.functions[fun].locals_count += 1;
        let id = self.res.vars.len();
        self.res.vars.push(VarInfo {
            name: name.to_string(),
            ty,
            owner_fun: fun,
            slot,
            is_heap: false,
            is_param,
            is_final,
            decl_span: span,
            bound_fun: None,
            reassigned: false,
        });
        id
    }

    fn bind(&mut self, name: &str, entry: ScopeEntry, span: Span) {
        let scope = self.scopes.last_mut().expect("no scope");
        if let Some(existing) = scope.names.get(name) {
            let original = match existing {
                ScopeEntry::Var(v) => self.res.vars[*v].decl_span,
                ScopeEntry::Fun(f) => self.res.functions[*f].decl_span,
            };
            self.error(
                ResolveErrorKind::DuplicateSymbol {
                    name: name.to_string(),
                    original,
                },
                span,
            );
            return;
        }
        scope.names.insert(name.to_string(), entry);
    }

    fn lookup(&self, name: &str) -> Option<ScopeEntry> {
        for scope in self.scopes.iter().rev() {
            if let Some(entry) = scope.names.get(name) {
                return Some(*entry);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Classes: pre-declaration
    // ------------------------------------------------------------------

    fn predeclare_classes(&mut self, classes: &[ClassDecl], prefix: &str) {
        for decl in classes {
            let full_name = if prefix.is_empty() {
                decl.name.name.clone()
            } else {
                format!("{}.{}", prefix, decl.name.name)
            };
            if self.class_names.contains_key(&full_name) {
                self.error(
                    ResolveErrorKind::DuplicateSymbol {
                        name: full_name.clone(),
                        original: decl.name.span,
                    },
                    decl.name.span,
                );
                continue;
            }
            let id = self.res.classes.len();
            self.res.classes.push(ClassDescriptor {
                node: decl.id,
                name: decl.name.name.clone(),
                full_name: full_name.clone(),
                base: None,
                fields: Vec::new(),
                methods: FxHashMap::default(),
                inner: Vec::new(),
                init_fun: 0,
            });
            self.class_names.insert(full_name.clone(), id);
            self.res.class_ids.insert(decl.id, id);
            if let Some(base) = &decl.base {
                let path = base
                    .iter()
                    .map(|i| i.name.as_str())
                    .collect::<Vec<_>>()
                    .join(".");
                let span = base.first().map(|i| i.span).unwrap_or(decl.span);
                self.base_paths.insert(id, (path, span));
            }
            self.predeclare_classes(&decl.inner_classes, &full_name);
            for inner in &decl.inner_classes {
                if let Some(&inner_id) = self.res.class_ids.get(&inner.id) {
                    self.res.classes[id].inner.push(inner_id);
                }
            }
        }
    }

    /// Resolve a class path, trying enclosing-class prefixes first.
    fn resolve_class_name(&self, path: &str) -> Option<ClassId> {
        for &enclosing in self.class_stack.iter().rev() {
            let qualified = format!("{}.{}", self.res.classes[enclosing].full_name, path);
            if let Some(&id) = self.class_names.get(&qualified) {
                return Some(id);
            }
        }
        self.class_names.get(path).copied()
    }

    fn link_bases(&mut self) {
        let paths: Vec<(ClassId, String, Span)> = self
            .base_paths
            .iter()
            .map(|(&id, (path, span))| (id, path.clone(), *span))
            .collect();
        for (id, path, span) in paths {
            match self.resolve_class_name(&path) {
                Some(base) => self.res.classes[id].base = Some(base),
                None => self.error(ResolveErrorKind::UnknownClass { name: path }, span),
            }
        }
        // Cycle detection along base chains
        for start in 0..self.res.classes.len() {
            let mut seen = FxHashSet::default();
            let mut cur = Some(start);
            while let Some(c) = cur {
                if !seen.insert(c) {
                    let span = self
                        .base_paths
                        .get(&start)
                        .map(|(_, s)| *s)
                        .unwrap_or(Span::new(0, 0, 1, 1));
                    self.error(
                        ResolveErrorKind::CyclicInheritance {
                            name: self.res.classes[start].name.clone(),
                        },
                        span,
                    );
                    self.res.classes[start].base = None;
                    break;
                }
                cur = self.res.classes[c].base;
            }
        }
    }

    /// Create function infos for all methods and initializers so bodies
    /// can call each other regardless of order.
    fn declare_members(&mut self, classes: &[ClassDecl]) {
        for decl in classes {
            let Some(&class_id) = self.res.class_ids.get(&decl.id) else {
                continue;
            };
            // Fields
            for field in &decl.fields {
                let ty = self.typespec_to_type(&field.ty, field.span);
                let info = FieldInfo {
                    name: field.name.name.clone(),
                    ty,
                    has_default: field.init.is_some(),
                    is_final: field.is_final,
                    node: field.id,
                };
                self.res.classes[class_id].fields.push(info);
            }
            // Methods
            for method in &decl.methods {
                let name = method
                    .name
                    .as_ref()
                    .map(|n| n.name.clone())
                    .unwrap_or_default();
                let full = format!("{}.{}", self.res.classes[class_id].full_name, name);
                let fun = self.new_function(full, None, method.span);
                self.fill_signature(fun, method);
                self.res.functions[fun].owner_class = Some(class_id);
                self.res.functions[fun].node = Some(method.id);
                self.res.fun_ids.insert(method.id, fun);
                self.res.classes[class_id].methods.insert(
                    name,
                    MethodInfo {
                        fun,
                        is_final: method.is_final,
                    },
                );
            }
            // Initializer: parameters are all fields, base-first
            let init_name = format!("{}.init", self.res.classes[class_id].full_name);
            let init = self.new_function(init_name, None, decl.span);
            self.res.functions[init].owner_class = Some(class_id);
            self.res.functions[init].is_init = true;
            self.res.functions[init].needs_wrapper = true;
            self.res.functions[init].return_type = Type::Instance(class_id);
            self.res.classes[class_id].init_fun = init;

            self.declare_members(&decl.inner_classes);
        }
        // Init signatures and final-override checks need the full class
        // table, so they run after every class was visited
        for class_id in 0..self.res.classes.len() {
            let fields = ClassDescriptor::all_fields(&self.res.classes, class_id);
            let init = self.res.classes[class_id].init_fun;
            let info = &mut self.res.functions[init];
            info.param_names = fields.iter().map(|f| f.name.clone()).collect();
            info.param_types = fields.iter().map(|f| f.ty).collect();
            info.param_has_default = fields.iter().map(|f| f.has_default).collect();

            if let Some(base) = self.res.classes[class_id].base {
                let own: Vec<(String, FunId)> = self.res.classes[class_id]
                    .methods
                    .iter()
                    .map(|(name, m)| (name.clone(), m.fun))
                    .collect();
                for (name, fun) in own {
                    if let Some(inherited) =
                        ClassDescriptor::find_method(&self.res.classes, base, &name)
                    {
                        if inherited.is_final {
                            let span = self.res.functions[fun].decl_span;
                            let base_name = self.res.classes[base].name.clone();
                            self.error(
                                ResolveErrorKind::FinalOverride {
                                    name,
                                    base: base_name,
                                },
                                span,
                            );
                        }
                    }
                }
            }
        }
    }

    fn fill_signature(&mut self, fun: FunId, decl: &FunDecl) {
        let mut names = Vec::new();
        let mut types = Vec::new();
        let mut defaults = Vec::new();
        for param in &decl.params {
            names.push(param.name.name.clone());
            types.push(self.typespec_to_type(&param.ty, param.span));
            defaults.push(param.default.is_some());
        }
        let return_type = match decl.return_type {
            TypeSpec::Dynamic => Type::Any,
            ref other => self.typespec_to_type(other, decl.span),
        };
        let info = &mut self.res.functions[fun];
        info.param_names = names;
        info.param_types = types;
        info.param_has_default = defaults;
        info.needs_wrapper = info.param_has_default.iter().any(|d| *d);
        info.is_closure = decl.is_closure;
        info.return_type = return_type;
    }

    fn typespec_to_type(&mut self, spec: &TypeSpec, span: Span) -> Type {
        match spec {
            TypeSpec::Inferred => Type::Any,
            TypeSpec::Dynamic => Type::Any,
            TypeSpec::Boolean => Type::Bool,
            TypeSpec::Int => Type::Int,
            TypeSpec::Long => Type::Long,
            TypeSpec::Double => Type::Double,
            TypeSpec::Decimal => Type::Decimal,
            TypeSpec::Str => Type::Str,
            TypeSpec::List => Type::List,
            TypeSpec::Map => Type::Map,
            TypeSpec::Void => Type::Void,
            TypeSpec::Named(path) => {
                let name = path
                    .iter()
                    .map(|i| i.name.as_str())
                    .collect::<Vec<_>>()
                    .join(".");
                match self.resolve_class_name(&name) {
                    Some(id) => Type::Instance(id),
                    None => {
                        self.error(ResolveErrorKind::UnknownClass { name }, span);
                        Type::Any
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    fn resolve_function_body(
        &mut self,
        fun: FunId,
        decl: &FunDecl,
        owner_class: Option<ClassId>,
    ) {
        self.fun_stack.push(fun);
        self.loop_stack.push(0);
        self.scopes.push(Scope::new(fun));

        if let Some(class_id) = owner_class {
            let this = self.new_var("this", Type::Instance(class_id), true, true, decl.span);
            self.bind("this", ScopeEntry::Var(this), decl.span);
            self.res.functions[fun].params.push(this);
        }

        for (i, param) in decl.params.iter().enumerate() {
            let default_ty = param
                .default
                .as_ref()
                .map(|d| self.resolve_expr(d))
                .unwrap_or(Type::Any);
            let declared = self.typespec_to_type(&param.ty, param.span);
            let ty = match param.ty {
                TypeSpec::Inferred => default_ty,
                TypeSpec::Dynamic => Type::Any,
                _ => declared,
            };
            let var = self.new_var(&param.name.name, ty, true, false, param.span);
            self.bind(&param.name.name, ScopeEntry::Var(var), param.span);
            self.res.decl_vars.insert(param.id, var);
            self.res.functions[fun].params.push(var);
            if i < self.res.functions[fun].param_types.len() {
                self.res.functions[fun].param_types[i] = ty;
            }
        }

        self.predeclare_block_functions(&decl.body);
        let stmts = &decl.body.stmts;
        for stmt in stmts {
            self.resolve_stmt(stmt);
        }

        self.scopes.pop();
        self.loop_stack.pop();
        self.fun_stack.pop();
    }

    /// Resolve the synthesized initializer of a class: `this` plus one
    /// parameter per field. Defaults of inherited fields belong to the
    /// base initializer and are not resolved here.
    fn resolve_init_body(&mut self, class_id: ClassId, decl: &ClassDecl) {
        let init = self.res.classes[class_id].init_fun;
        self.fun_stack.push(init);
        self.loop_stack.push(0);
        self.scopes.push(Scope::new(init));
        self.class_stack.push(class_id);

        let this = self.new_var("this", Type::Instance(class_id), true, true, decl.span);
        self.bind("this", ScopeEntry::Var(this), decl.span);
        self.res.functions[init].params.push(this);

        let own_start = ClassDescriptor::all_fields(&self.res.classes, class_id).len()
            - self.res.classes[class_id].fields.len();
        let all_fields = ClassDescriptor::all_fields(&self.res.classes, class_id);
        for (i, field) in all_fields.iter().enumerate() {
            if i >= own_start {
                // Own field: resolve its default in the init scope, where
                // earlier fields are already bound
                let field_decl = decl.fields.iter().find(|f| f.id == field.node);
                if let Some(field_decl) = field_decl {
                    if let Some(init_expr) = &field_decl.init {
                        let actual = self.resolve_expr(init_expr);
                        if !actual.assignable_to(&field.ty) && !actual.convertible_to(&field.ty) {
                            self.error(
                                ResolveErrorKind::TypeMismatch {
                                    expected: field.ty.to_string(),
                                    actual: actual.to_string(),
                                },
                                field_decl.span,
                            );
                        }
                    }
                }
            }
            let var = self.new_var(&field.name, field.ty, true, false, decl.span);
            self.bind(&field.name, ScopeEntry::Var(var), decl.span);
            self.res.functions[init].params.push(var);
            self.res.decl_vars.insert(field.node, var);
        }

        self.class_stack.pop();
        self.scopes.pop();
        self.loop_stack.pop();
        self.fun_stack.pop();
    }

    fn resolve_class_bodies(&mut self, classes: &[ClassDecl]) {
        for decl in classes {
            let Some(&class_id) = self.res.class_ids.get(&decl.id) else {
                continue;
            };
            self.resolve_init_body(class_id, decl);
            for method in &decl.methods {
                let Some(&fun) = self.res.fun_ids.get(&method.id) else {
                    continue;
                };
                self.class_stack.push(class_id);
                self.resolve_function_body(fun, method, Some(class_id));
                self.class_stack.pop();
            }
            self.resolve_class_bodies(&decl.inner_classes);
        }
    }

    /// Named functions are visible in the whole block, so they bind
    /// before any statement resolves.
    fn predeclare_block_functions(&mut self, block: &Block) {
        for stmt in &block.stmts {
            if let StmtKind::FunDecl(fun_decl) = &stmt.kind {
                let name = fun_decl
                    .name
                    .as_ref()
                    .map(|n| n.name.clone())
                    .unwrap_or_default();
                let enclosing = self.current_fun();
                let compiled_name = format!("{}${}", name, fun_decl.id);
                let fun = self.new_function(compiled_name, Some(enclosing), fun_decl.span);
                self.fill_signature(fun, fun_decl);
                self.res.functions[fun].node = Some(fun_decl.id);
                self.res.fun_ids.insert(fun_decl.id, fun);
                self.bind(&name, ScopeEntry::Fun(fun), fun_decl.span);
            }
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn resolve_block(&mut self, block: &Block) {
        let fun = self.current_fun();
        self.scopes.push(Scope::new(fun));
        self.predeclare_block_functions(block);
        for stmt in &block.stmts {
            self.resolve_stmt(stmt);
        }
        self.scopes.pop();
    }

    fn resolve_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.resolve_expr(expr);
            }
            StmtKind::VarDecl(decl) => self.resolve_var_decl(decl),
            StmtKind::FunDecl(fun_decl) => {
                // Pre-declared at block entry; resolve the body now
                if let Some(&fun) = self.res.fun_ids.get(&fun_decl.id) {
                    self.resolve_function_body(fun, fun_decl, None);
                }
            }
            StmtKind::ClassDecl(_) => {
                self.error(ResolveErrorKind::ClassNotAllowedHere, stmt.span);
            }
            StmtKind::If {
                cond,
                then_block,
                else_block,
            } => {
                self.resolve_expr(cond);
                self.resolve_block(then_block);
                if let Some(else_block) = else_block {
                    self.resolve_block(else_block);
                }
            }
            StmtKind::While { cond, body, update } => {
                self.check_global_matches(cond);
                self.resolve_expr(cond);
                *self.loop_stack.last_mut().unwrap() += 1;
                self.resolve_block(body);
                for u in update {
                    self.resolve_expr(u);
                }
                *self.loop_stack.last_mut().unwrap() -= 1;
            }
            StmtKind::Break => {
                if *self.loop_stack.last().unwrap() == 0 {
                    self.error(ResolveErrorKind::BreakOutsideLoop, stmt.span);
                }
            }
            StmtKind::Continue => {
                if *self.loop_stack.last().unwrap() == 0 {
                    self.error(ResolveErrorKind::ContinueOutsideLoop, stmt.span);
                }
            }
            StmtKind::Return { value } => {
                let actual = value.as_ref().map(|v| self.resolve_expr(v));
                let expected = self.res.functions[self.current_fun()].return_type;
                if let Some(actual) = actual {
                    if expected != Type::Any
                        && expected != Type::Void
                        && !actual.assignable_to(&expected)
                        && !actual.convertible_to(&expected)
                    {
                        self.error(
                            ResolveErrorKind::TypeMismatch {
                                expected: expected.to_string(),
                                actual: actual.to_string(),
                            },
                            stmt.span,
                        );
                    }
                }
            }
            StmtKind::Print { value, .. } | StmtKind::Die { value } => {
                if let Some(value) = value {
                    self.resolve_expr(value);
                }
            }
            StmtKind::Block(block) => self.resolve_block(block),
            StmtKind::Import { path, alias } => {
                let name = path
                    .iter()
                    .map(|i| i.name.as_str())
                    .collect::<Vec<_>>()
                    .join(".");
                match self.resolve_class_name(&name) {
                    Some(id) => {
                        let alias_name = alias
                            .as_ref()
                            .map(|a| a.name.clone())
                            .unwrap_or_else(|| path.last().unwrap().name.clone());
                        self.class_names.insert(alias_name, id);
                    }
                    None => {
                        let span = path.first().map(|i| i.span).unwrap_or(stmt.span);
                        self.error(ResolveErrorKind::UnknownClass { name }, span);
                    }
                }
            }
        }
    }

    fn resolve_var_decl(&mut self, decl: &VarDecl) {
        // The initializer resolves first: a closure initializer cannot
        // reference the variable being declared
        let init_ty = decl.init.as_ref().map(|e| self.resolve_expr(e));
        let declared = self.typespec_to_type(&decl.ty, decl.span);
        let ty = match decl.ty {
            TypeSpec::Inferred => init_ty.unwrap_or(Type::Any),
            TypeSpec::Dynamic => Type::Any,
            _ => {
                if let Some(actual) = init_ty {
                    if !actual.assignable_to(&declared) {
                        self.error(
                            ResolveErrorKind::TypeMismatch {
                                expected: declared.to_string(),
                                actual: actual.to_string(),
                            },
                            decl.span,
                        );
                    }
                }
                declared
            }
        };
        let var = self.new_var(&decl.name.name, ty, false, decl.is_final, decl.name.span);
        // Remember closure/function bindings for the async analysis
        if let Some(init) = &decl.init {
            match &init.kind {
                ExprKind::Closure(fun_decl) => {
                    self.res.vars[var].bound_fun = self.res.fun_ids.get(&fun_decl.id).copied();
                }
                ExprKind::Variable(_) => {
                    if let Some(VarUse::FunctionRef(f)) = self.res.var_uses.get(&init.id) {
                        self.res.vars[var].bound_fun = Some(*f);
                    }
                }
                _ => {}
            }
        }
        self.bind(&decl.name.name, ScopeEntry::Var(var), decl.name.span);
        self.res.decl_vars.insert(decl.id, var);
    }

    /// Enforce the one-global-match-per-condition rule.
    fn check_global_matches(&mut self, cond: &Expr) {
        fn count(expr: &Expr, total: &mut usize) {
            if let ExprKind::RegexMatch { modifiers, .. } = &expr.kind {
                if modifiers.contains('g') {
                    *total += 1;
                }
            }
            expr.walk_children(|child| count(child, total));
        }
        let mut total = 0;
        count(cond, &mut total);
        if total > 1 {
            self.error(ResolveErrorKind::MultipleGlobalMatches, cond.span);
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn record_type(&mut self, expr: &Expr, ty: Type) -> Type {
        self.res.expr_types.insert(expr.id, ty);
        ty
    }

    fn resolve_expr(&mut self, expr: &Expr) -> Type {
        let ty = self.resolve_expr_inner(expr);
        self.record_type(expr, ty)
    }

    fn resolve_expr_inner(&mut self, expr: &Expr) -> Type {
        match &expr.kind {
            ExprKind::Literal(lit) => match lit {
                Literal::Null => Type::Any,
                Literal::Bool(_) => Type::Bool,
                Literal::Int(_) => Type::Int,
                Literal::Long(_) => Type::Long,
                Literal::Double(_) => Type::Double,
                Literal::Decimal(_) => Type::Decimal,
                Literal::Str(_) => Type::Str,
            },
            ExprKind::StringInterp(segs) => {
                for seg in segs {
                    if let StringSeg::Expr(e) = seg {
                        self.resolve_expr(e);
                    }
                }
                Type::Str
            }
            ExprKind::Variable(name) => self.resolve_variable(expr, name),
            ExprKind::CaptureVar(_) => Type::Str,
            ExprKind::ListLiteral(items) => {
                for item in items {
                    self.resolve_expr(item);
                }
                Type::List
            }
            ExprKind::MapLiteral { entries, .. } => {
                for (_, value) in entries {
                    self.resolve_expr(value);
                }
                Type::Map
            }
            ExprKind::Binary { op, lhs, rhs } => self.resolve_binary(expr, *op, lhs, rhs),
            ExprKind::Prefix { op, expr: operand } => {
                let ty = self.resolve_expr(operand);
                match op {
                    PrefixOp::Not => Type::Bool,
                    PrefixOp::BitNot => {
                        self.require_integral(ty, "~", operand.span);
                        ty
                    }
                    PrefixOp::Neg | PrefixOp::Plus => {
                        self.require_numeric(ty, "unary -", operand.span);
                        ty
                    }
                    PrefixOp::Incr | PrefixOp::Decr => {
                        self.check_incr_target(operand);
                        ty
                    }
                }
            }
            ExprKind::Postfix { expr: operand, .. } => {
                let ty = self.resolve_expr(operand);
                self.check_incr_target(operand);
                ty
            }
            ExprKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                self.resolve_expr(cond);
                let a = self.resolve_expr(then_expr);
                let b = self.resolve_expr(else_expr);
                if a == b {
                    a
                } else {
                    Type::Any
                }
            }
            ExprKind::Elvis { value, fallback } => {
                let a = self.resolve_expr(value);
                let b = self.resolve_expr(fallback);
                if a == b {
                    a
                } else {
                    Type::Any
                }
            }
            ExprKind::TypeCast { ty, expr: operand } | ExprKind::AsConvert { expr: operand, ty } => {
                let from = self.resolve_expr(operand);
                let to = self.typespec_to_type(ty, expr.span);
                if from != Type::Any && !from.convertible_to(&to) {
                    self.error(
                        ResolveErrorKind::TypeMismatch {
                            expected: to.to_string(),
                            actual: from.to_string(),
                        },
                        expr.span,
                    );
                }
                to
            }
            ExprKind::InstanceOf { expr: operand, ty, .. } => {
                self.resolve_expr(operand);
                self.typespec_to_type(ty, expr.span);
                Type::Bool
            }
            ExprKind::InOp { item, collection, .. } => {
                self.resolve_expr(item);
                self.resolve_expr(collection);
                Type::Bool
            }
            ExprKind::Index { target, index, .. } => {
                let target_ty = self.resolve_expr(target);
                self.resolve_expr(index);
                match target_ty {
                    Type::Str => Type::Str,
                    Type::List | Type::Map | Type::Iterator | Type::Any => Type::Any,
                    other => {
                        self.error(
                            ResolveErrorKind::BadIndexTarget {
                                ty: other.to_string(),
                            },
                            target.span,
                        );
                        Type::Any
                    }
                }
            }
            ExprKind::FieldAccess { target, name, .. } => {
                let target_ty = self.resolve_expr(target);
                match target_ty {
                    Type::Instance(class_id) => {
                        match ClassDescriptor::find_field(&self.res.classes, class_id, &name.name) {
                            Some(field) => field.ty,
                            None => {
                                let class = self.res.classes[class_id].name.clone();
                                self.error(
                                    ResolveErrorKind::UnknownField {
                                        name: name.name.clone(),
                                        class,
                                    },
                                    name.span,
                                );
                                Type::Any
                            }
                        }
                    }
                    _ => Type::Any,
                }
            }
            ExprKind::Call { callee, args } => self.resolve_call(expr, callee, args),
            ExprKind::MethodCall {
                target,
                name,
                args,
                ..
            } => self.resolve_method_call(expr, target, name, args),
            ExprKind::Closure(fun_decl) => {
                let enclosing = self.current_fun();
                let compiled_name = format!("_closure${}", fun_decl.id);
                let fun = self.new_function(compiled_name, Some(enclosing), fun_decl.span);
                self.fill_signature(fun, fun_decl);
                self.res.functions[fun].node = Some(fun_decl.id);
                self.res.fun_ids.insert(fun_decl.id, fun);
                self.resolve_function_body(fun, fun_decl, None);
                Type::Function
            }
            ExprKind::Assign {
                target,
                value,
                op,
                conditional: _,
            } => self.resolve_assign(target, value, *op),
            ExprKind::RegexMatch { subject, pattern, .. } => {
                self.resolve_expr(subject);
                self.resolve_expr(pattern);
                Type::Bool
            }
            ExprKind::RegexSubst {
                subject,
                pattern,
                replacement,
                ..
            } => {
                self.resolve_expr(subject);
                self.resolve_expr(pattern);
                self.resolve_expr(replacement);
                Type::Str
            }
            ExprKind::New { class, args } => {
                let name = class
                    .iter()
                    .map(|i| i.name.as_str())
                    .collect::<Vec<_>>()
                    .join(".");
                let span = class.first().map(|i| i.span).unwrap_or(expr.span);
                match self.resolve_class_name(&name) {
                    Some(class_id) => {
                        self.res.new_classes.insert(expr.id, class_id);
                        let init = self.res.classes[class_id].init_fun;
                        self.check_args(init, args, expr.span);
                        self.add_call_edge(init);
                        for arg in args {
                            self.resolve_expr(arg);
                        }
                        self.note_closure_arg_edges(args);
                        Type::Instance(class_id)
                    }
                    None => {
                        self.error(ResolveErrorKind::UnknownClass { name }, span);
                        for arg in args {
                            self.resolve_expr(arg);
                        }
                        Type::Any
                    }
                }
            }
            ExprKind::DoBlock(block) => {
                let fun = self.current_fun();
                self.scopes.push(Scope::new(fun));
                self.predeclare_block_functions(block);
                let mut last = Type::Any;
                for stmt in &block.stmts {
                    self.resolve_stmt(stmt);
                    if let StmtKind::Expr(e) = &stmt.kind {
                        last = self.res.expr_types.get(&e.id).copied().unwrap_or(Type::Any);
                    } else {
                        last = Type::Any;
                    }
                }
                self.scopes.pop();
                last
            }
        }
    }

    fn resolve_variable(&mut self, expr: &Expr, name: &str) -> Type {
        if let Some(entry) = self.lookup(name) {
            match entry {
                ScopeEntry::Var(var) => {
                    let owner = self.res.vars[var].owner_fun;
                    if owner == self.current_fun() {
                        self.res.var_uses.insert(expr.id, VarUse::Local(var));
                    } else {
                        self.note_capture(var);
                        self.res.var_uses.insert(expr.id, VarUse::Capture(var));
                    }
                    self.res.vars[var].ty
                }
                ScopeEntry::Fun(fun) => {
                    self.note_forward_reference(fun, expr.span);
                    self.add_call_edge(fun);
                    self.res.var_uses.insert(expr.id, VarUse::FunctionRef(fun));
                    Type::Function
                }
            }
        } else if let Some(class_id) = self.enclosing_field_class(name) {
            let field = ClassDescriptor::find_field(&self.res.classes, class_id, name)
                .expect("field checked");
            let ty = field.ty;
            self.res
                .var_uses
                .insert(expr.id, VarUse::Field(name.to_string()));
            ty
        } else if self.res.globals.contains(name) {
            self.res
                .var_uses
                .insert(expr.id, VarUse::Global(name.to_string()));
            Type::Any
        } else {
            self.error(
                ResolveErrorKind::UnknownVariable {
                    name: name.to_string(),
                },
                expr.span,
            );
            self.res
                .var_uses
                .insert(expr.id, VarUse::Global(name.to_string()));
            Type::Any
        }
    }

    /// The innermost class whose field chain contains `name`, when
    /// resolving inside a method body.
    fn enclosing_field_class(&self, name: &str) -> Option<ClassId> {
        let &class_id = self.class_stack.last()?;
        ClassDescriptor::find_field(&self.res.classes, class_id, name).map(|_| class_id)
    }

    /// Register a capture on every function between the current one and
    /// the variable's owner.
    fn note_capture(&mut self, var: VarId) {
        self.res.vars[var].is_heap = true;
        let owner = self.res.vars[var].owner_fun;
        let mut fun = self.current_fun();
        while fun != owner {
            if !self.res.functions[fun].captures.contains(&var) {
                self.res.functions[fun].captures.push(var);
            }
            match self.res.functions[fun].enclosing {
                Some(enclosing) => fun = enclosing,
                None => break,
            }
        }
    }

    fn note_forward_reference(&mut self, fun: FunId, use_span: Span) {
        if use_span.start < self.res.functions[fun].decl_span.start {
            let earlier = match self.res.functions[fun].earliest_forward_ref {
                Some(existing) => use_span.start < existing.start,
                None => true,
            };
            if earlier {
                self.res.functions[fun].earliest_forward_ref = Some(use_span);
            }
        }
    }

    fn add_call_edge(&mut self, callee: FunId) {
        let caller = self.current_fun();
        if !self.res.functions[caller].calls.contains(&callee) {
            self.res.functions[caller].calls.push(callee);
        }
    }

    fn mark_async_seed(&mut self) {
        let fun = self.current_fun();
        self.res.functions[fun].has_async_seed = true;
    }

    fn note_closure_arg_edges(&mut self, args: &[Expr]) {
        for arg in args {
            if let ExprKind::Closure(fun_decl) = &arg.kind {
                if let Some(&fun) = self.res.fun_ids.get(&fun_decl.id) {
                    self.add_call_edge(fun);
                }
            }
        }
    }

    fn resolve_call(&mut self, expr: &Expr, callee: &Expr, args: &[Expr]) -> Type {
        for arg in args {
            self.resolve_expr(arg);
        }
        self.note_closure_arg_edges(args);

        if let ExprKind::Variable(name) = &callee.kind {
            if let Some(entry) = self.lookup(name) {
                match entry {
                    ScopeEntry::Var(var) => {
                        // Calling through a function-typed variable
                        let owner = self.res.vars[var].owner_fun;
                        if owner == self.current_fun() {
                            self.res.var_uses.insert(callee.id, VarUse::Local(var));
                        } else {
                            self.note_capture(var);
                            self.res.var_uses.insert(callee.id, VarUse::Capture(var));
                        }
                        self.record_type(callee, self.res.vars[var].ty);
                        let info = &self.res.vars[var];
                        match (info.bound_fun, info.reassigned) {
                            (Some(bound), false) => {
                                // Effectively final: async follows the
                                // known target
                                self.add_call_edge(bound);
                            }
                            _ => self.mark_async_seed(),
                        }
                        self.res.call_targets.insert(expr.id, CallTarget::Value);
                        return Type::Any;
                    }
                    ScopeEntry::Fun(fun) => {
                        self.note_forward_reference(fun, callee.span);
                        self.add_call_edge(fun);
                        self.check_args(fun, args, expr.span);
                        self.res
                            .call_targets
                            .insert(expr.id, CallTarget::Function(fun));
                        return self.res.functions[fun].return_type;
                    }
                }
            }
            // Unqualified method call inside a class body
            if let Some(&class_id) = self.class_stack.last() {
                if let Some(method) =
                    ClassDescriptor::find_method(&self.res.classes, class_id, name)
                {
                    self.add_call_edge(method.fun);
                    self.add_override_edges(name);
                    self.check_args(method.fun, args, expr.span);
                    self.res
                        .call_targets
                        .insert(expr.id, CallTarget::SelfMethod(name.clone()));
                    return self.res.functions[method.fun].return_type;
                }
            }
            if name == "eval" {
                self.mark_async_seed();
                self.res.async_calls.insert(expr.id);
                self.res.call_targets.insert(expr.id, CallTarget::Eval);
                if args.is_empty() || args.len() > 2 {
                    self.error(
                        ResolveErrorKind::ArgumentCount {
                            name: "eval".to_string(),
                            expected: 1,
                            actual: args.len(),
                        },
                        expr.span,
                    );
                }
                return Type::Any;
            }
            if let Some(idx) = self.registry.lookup(name) {
                let host = self.registry.get(idx);
                self.check_host_args(name, idx, args, expr.span);
                if host.is_async {
                    self.mark_async_seed();
                    self.res.async_calls.insert(expr.id);
                }
                let return_type = host.return_type;
                self.res.call_targets.insert(expr.id, CallTarget::Host(idx));
                return return_type;
            }
            self.error(
                ResolveErrorKind::UnknownFunction {
                    name: name.to_string(),
                },
                callee.span,
            );
            self.res.call_targets.insert(expr.id, CallTarget::Value);
            return Type::Any;
        }

        // Arbitrary callee expression
        let callee_ty = self.resolve_expr(callee);
        if let ExprKind::Closure(fun_decl) = &callee.kind {
            if let Some(&fun) = self.res.fun_ids.get(&fun_decl.id) {
                self.add_call_edge(fun);
            }
        } else {
            self.mark_async_seed();
        }
        if callee_ty != Type::Function && callee_ty != Type::Any {
            self.error(
                ResolveErrorKind::TypeMismatch {
                    expected: Type::Function.to_string(),
                    actual: callee_ty.to_string(),
                },
                callee.span,
            );
        }
        self.res.call_targets.insert(expr.id, CallTarget::Value);
        Type::Any
    }

    /// Async edges to every override of a dynamically dispatched method.
    fn add_override_edges(&mut self, name: &str) {
        let funs: Vec<FunId> = self
            .res
            .classes
            .iter()
            .filter_map(|c| c.methods.get(name).map(|m| m.fun))
            .collect();
        for fun in funs {
            self.add_call_edge(fun);
        }
    }

    fn resolve_method_call(
        &mut self,
        expr: &Expr,
        target: &Expr,
        name: &Ident,
        args: &[Expr],
    ) -> Type {
        let target_ty = self.resolve_expr(target);
        for arg in args {
            self.resolve_expr(arg);
        }
        self.note_closure_arg_edges(args);

        match target_ty {
            Type::Instance(class_id) => {
                match ClassDescriptor::find_method(&self.res.classes, class_id, &name.name) {
                    Some(method) => {
                        self.add_call_edge(method.fun);
                        self.add_override_edges(&name.name);
                        self.check_args(method.fun, args, expr.span);
                        if method.is_final {
                            self.res.method_binds.insert(expr.id, method.fun);
                        }
                        self.res.functions[method.fun].return_type
                    }
                    None => {
                        if crate::vm::builtins::method_exists(&name.name) {
                            Type::Any
                        } else {
                            let class = self.res.classes[class_id].name.clone();
                            self.error(
                                ResolveErrorKind::UnknownMethod {
                                    name: name.name.clone(),
                                    ty: class,
                                },
                                name.span,
                            );
                            Type::Any
                        }
                    }
                }
            }
            Type::Any => {
                // Dynamic receiver: any same-named script method could be
                // the target
                self.add_override_edges(&name.name);
                Type::Any
            }
            known => {
                if !crate::vm::builtins::method_exists(&name.name) {
                    self.error(
                        ResolveErrorKind::UnknownMethod {
                            name: name.name.clone(),
                            ty: known.to_string(),
                        },
                        name.span,
                    );
                }
                Type::Any
            }
        }
    }

    fn resolve_assign(&mut self, target: &Expr, value: &Expr, op: Option<BinOp>) -> Type {
        let value_ty = self.resolve_expr(value);

        match &target.kind {
            ExprKind::Variable(name) => {
                if let Some(entry) = self.lookup(name) {
                    match entry {
                        ScopeEntry::Var(var) => {
                            if self.res.vars[var].is_final {
                                self.error(
                                    ResolveErrorKind::FinalAssignment {
                                        name: name.to_string(),
                                    },
                                    target.span,
                                );
                            }
                            self.res.vars[var].reassigned = true;
                            let owner = self.res.vars[var].owner_fun;
                            if owner == self.current_fun() {
                                self.res.var_uses.insert(target.id, VarUse::Local(var));
                            } else {
                                self.note_capture(var);
                                self.res.var_uses.insert(target.id, VarUse::Capture(var));
                            }
                            let declared = self.res.vars[var].ty;
                            self.record_type(target, declared);
                            if op.is_none()
                                && declared != Type::Any
                                && value_ty != Type::Any
                                && !value_ty.assignable_to(&declared)
                            {
                                self.error(
                                    ResolveErrorKind::TypeMismatch {
                                        expected: declared.to_string(),
                                        actual: value_ty.to_string(),
                                    },
                                    value.span,
                                );
                            }
                            return declared;
                        }
                        ScopeEntry::Fun(_) => {
                            self.error(
                                ResolveErrorKind::Other {
                                    message: format!("Cannot assign to function '{}'", name),
                                },
                                target.span,
                            );
                            return Type::Any;
                        }
                    }
                }
                if let Some(class_id) = self.enclosing_field_class(name) {
                    let _ = class_id;
                    self.res
                        .var_uses
                        .insert(target.id, VarUse::Field(name.to_string()));
                    self.record_type(target, Type::Any);
                    return Type::Any;
                }
                let is_global = self.res.globals.contains(name);
                let at_script_level =
                    self.current_fun() == self.res.main_fun && self.allow_implicit_globals;
                if is_global || at_script_level {
                    self.res.globals.insert(name.to_string());
                    self.res
                        .var_uses
                        .insert(target.id, VarUse::Global(name.to_string()));
                    self.record_type(target, Type::Any);
                    return Type::Any;
                }
                self.error(
                    ResolveErrorKind::UnknownVariable {
                        name: name.to_string(),
                    },
                    target.span,
                );
                self.res
                    .var_uses
                    .insert(target.id, VarUse::Global(name.to_string()));
                self.record_type(target, Type::Any);
                Type::Any
            }
            ExprKind::Index {
                target: inner,
                index,
                ..
            } => {
                self.resolve_expr(inner);
                self.resolve_expr(index);
                self.record_type(target, Type::Any);
                Type::Any
            }
            ExprKind::FieldAccess { target: inner, name, .. } => {
                let inner_ty = self.resolve_expr(inner);
                if let Type::Instance(class_id) = inner_ty {
                    if let Some(field) =
                        ClassDescriptor::find_field(&self.res.classes, class_id, &name.name)
                    {
                        if field.is_final {
                            self.error(
                                ResolveErrorKind::FinalAssignment {
                                    name: name.name.clone(),
                                },
                                name.span,
                            );
                        }
                    } else {
                        let class = self.res.classes[class_id].name.clone();
                        self.error(
                            ResolveErrorKind::UnknownField {
                                name: name.name.clone(),
                                class,
                            },
                            name.span,
                        );
                    }
                }
                self.record_type(target, Type::Any);
                Type::Any
            }
            _ => {
                self.error(
                    ResolveErrorKind::Other {
                        message: "Invalid assignment target".to_string(),
                    },
                    target.span,
                );
                Type::Any
            }
        }
    }

    fn resolve_binary(&mut self, expr: &Expr, op: BinOp, lhs: &Expr, rhs: &Expr) -> Type {
        let l = self.resolve_expr(lhs);
        let r = self.resolve_expr(rhs);
        match op {
            BinOp::And | BinOp::Or => Type::Bool,
            BinOp::Eq | BinOp::Ne | BinOp::EqId | BinOp::NeId => Type::Bool,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => Type::Bool,
            BinOp::Cmp => Type::Int,
            BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor => {
                self.require_integral(l, "bitwise operator", lhs.span);
                self.require_integral(r, "bitwise operator", rhs.span);
                if l == Type::Long || r == Type::Long {
                    Type::Long
                } else if l == Type::Any || r == Type::Any {
                    Type::Any
                } else {
                    Type::Int
                }
            }
            BinOp::Shl | BinOp::Shr | BinOp::Ushr => {
                self.require_integral(l, "shift operator", lhs.span);
                self.require_integral(r, "shift operator", rhs.span);
                l
            }
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod | BinOp::Rem => {
                match Type::arith_result(l, r, op == BinOp::Add) {
                    Some(ty) => ty,
                    None => {
                        self.error(
                            ResolveErrorKind::TypeMismatch {
                                expected: "numeric operands".to_string(),
                                actual: format!("{} and {}", l, r),
                            },
                            expr.span,
                        );
                        Type::Any
                    }
                }
            }
        }
    }

    fn require_numeric(&mut self, ty: Type, op: &str, span: Span) {
        if ty != Type::Any && !ty.is_numeric() {
            self.error(
                ResolveErrorKind::BadOperandType {
                    op: op.to_string(),
                    ty: ty.to_string(),
                },
                span,
            );
        }
    }

    fn require_integral(&mut self, ty: Type, op: &str, span: Span) {
        if ty != Type::Any && !ty.is_integral() {
            self.error(
                ResolveErrorKind::BadOperandType {
                    op: op.to_string(),
                    ty: ty.to_string(),
                },
                span,
            );
        }
    }

    fn check_incr_target(&mut self, operand: &Expr) {
        if !operand.is_assignable() {
            self.error(
                ResolveErrorKind::Other {
                    message: "Operand of ++/-- must be assignable".to_string(),
                },
                operand.span,
            );
            return;
        }
        if let ExprKind::Variable(name) = &operand.kind {
            if let Some(ScopeEntry::Var(var)) = self.lookup(name) {
                self.res.vars[var].reassigned = true;
            }
        }
    }

    /// Argument checks against a script function's signature.
    fn check_args(&mut self, fun: FunId, args: &[Expr], span: Span) {
        let info = &self.res.functions[fun];
        // Compiled names carry a uniquifying suffix; errors show the
        // source name
        let name = info
            .name
            .split('$')
            .next()
            .unwrap_or(&info.name)
            .to_string();
        let param_names = info.param_names.clone();
        let defaults = info.param_has_default.clone();
        let named = matches!(
            args,
            [Expr {
                kind: ExprKind::MapLiteral {
                    is_named_args: true,
                    ..
                },
                ..
            }]
        );
        if named {
            let ExprKind::MapLiteral { entries, .. } = &args[0].kind else {
                return;
            };
            let provided: FxHashSet<&str> =
                entries.iter().map(|(k, _)| k.name.as_str()).collect();
            for (key, _) in entries {
                if !param_names.iter().any(|p| p == &key.name) {
                    self.error(
                        ResolveErrorKind::Other {
                            message: format!(
                                "'{}' has no parameter named '{}'",
                                name, key.name
                            ),
                        },
                        key.span,
                    );
                }
            }
            for (i, p) in param_names.iter().enumerate() {
                if !defaults[i] && !provided.contains(p.as_str()) {
                    self.error(
                        ResolveErrorKind::MissingArgument {
                            name: name.clone(),
                            param: p.clone(),
                        },
                        span,
                    );
                }
            }
            self.mark_needs_wrapper(fun);
            return;
        }
        let min_args = defaults
            .iter()
            .rposition(|d| !d)
            .map(|i| i + 1)
            .unwrap_or(0);
        if args.len() < min_args || args.len() > param_names.len() {
            // Single-list-argument invocation spreads at runtime
            let single_list = args.len() == 1 && min_args > 1;
            if single_list {
                self.mark_needs_wrapper(fun);
            } else {
                self.error(
                    ResolveErrorKind::ArgumentCount {
                        name,
                        expected: param_names.len(),
                        actual: args.len(),
                    },
                    span,
                );
            }
        } else if args.len() < param_names.len() {
            self.mark_needs_wrapper(fun);
        }
    }

    fn mark_needs_wrapper(&mut self, fun: FunId) {
        self.res.functions[fun].needs_wrapper = true;
    }

    fn check_host_args(&mut self, name: &str, idx: usize, args: &[Expr], span: Span) {
        let host = self.registry.get(idx);
        let mandatory = host.params.iter().filter(|p| p.default.is_none()).count();
        let max = host.params.len();
        let named = matches!(
            args,
            [Expr {
                kind: ExprKind::MapLiteral {
                    is_named_args: true,
                    ..
                },
                ..
            }]
        );
        if named {
            return;
        }
        if args.len() < mandatory || (!host.varargs && args.len() > max) {
            self.error(
                ResolveErrorKind::ArgumentCount {
                    name: name.to_string(),
                    expected: max,
                    actual: args.len(),
                },
                span,
            );
        }
    }
}
