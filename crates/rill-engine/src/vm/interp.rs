//! The execution engine
//!
//! A fetch/dispatch loop over reified frames. Control never lives on
//! the Rust call stack between ops, so suspending at an async host call
//! is just packaging the frame vector into a `Continuation` and handing
//! it back; `resume` restores the frames, pushes the outcome where the
//! call's result belongs, and re-enters the loop. Drives (iterator
//! realization, substitution) re-execute their op until finished, with
//! their state carried on the frame.

use crate::compiler::code::Program;
use crate::compiler::op::{Op, RegexFlags, TypeTag};
use crate::error::{RuntimeError, RuntimeErrorKind};
use crate::host::{HostContext, HostRegistry};
use crate::vm::arith;
use crate::vm::builtins::{self, BuiltinResult};
use crate::vm::frame::{AsyncOp, AsyncOutcome, Continuation, Frame, Outcome};
use crate::vm::heap::HeapCell;
use crate::vm::iter::{Awaiting, DriveDest, DriveKind, DriveState, DriveStep, IterNode};
use crate::vm::regexes::{self, GlobalMatchState, RegexCache, SubstState};
use crate::vm::value::{FunctionValue, Globals, Instance, Value};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Execution limits and knobs.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Frame-depth limit; exceeding it is a runtime error
    pub max_frame_depth: usize,
    /// Significant digits kept by Decimal division
    pub decimal_precision: u32,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            max_frame_depth: 512,
            decimal_precision: 20,
        }
    }
}

/// Why the step loop stopped.
enum Control {
    Done(Value),
    Suspend(AsyncOp),
    Error(RuntimeError),
}

type StepResult = Result<(), Control>;

fn fail(kind: RuntimeErrorKind) -> Control {
    Control::Error(RuntimeError::new(kind))
}

/// A single script instance's execution engine.
pub struct Vm {
    program: Arc<Program>,
    registry: Arc<HostRegistry>,
    options: ExecOptions,
    frames: Vec<Frame>,
    regex_cache: RegexCache,
}

impl Vm {
    pub fn new(program: Arc<Program>, registry: Arc<HostRegistry>, options: ExecOptions) -> Self {
        Self {
            program,
            registry,
            options,
            frames: Vec::new(),
            regex_cache: RegexCache::default(),
        }
    }

    /// Run the script's main function to completion or first suspension.
    pub fn execute(&mut self, globals: Globals, ctx: &mut HostContext) -> Outcome {
        let main = self.program.unit(self.program.main);
        self.frames
            .push(Frame::new(main, Vec::new(), Vec::new(), globals));
        self.run(ctx)
    }

    /// Re-enter a suspended script with the async operation's outcome.
    pub fn resume(
        &mut self,
        continuation: Continuation,
        outcome: AsyncOutcome,
        ctx: &mut HostContext,
    ) -> Outcome {
        self.frames = continuation.frames;
        match outcome {
            Ok(value) => {
                if let Some(frame) = self.frames.last_mut() {
                    frame.push(value);
                }
                self.run(ctx)
            }
            Err(error) => Outcome::Failed(self.decorate(error)),
        }
    }

    fn run(&mut self, ctx: &mut HostContext) -> Outcome {
        loop {
            let result = if self
                .frames
                .last()
                .map(|f| f.drive.is_some())
                .unwrap_or(false)
            {
                self.step_drive()
            } else {
                self.step(ctx)
            };
            match result {
                Ok(()) => {}
                Err(Control::Done(value)) => return Outcome::Done(value),
                Err(Control::Suspend(op)) => {
                    let frames = std::mem::take(&mut self.frames);
                    return Outcome::Suspend(Continuation { frames }, op);
                }
                Err(Control::Error(error)) => return Outcome::Failed(self.decorate(error)),
            }
        }
    }

    /// Fill in location and script stack on an escaping error.
    fn decorate(&self, mut error: RuntimeError) -> RuntimeError {
        if error.span.is_none() {
            error.span = self
                .frames
                .last()
                .and_then(|f| f.unit.span_at(f.pc.min(f.unit.spans.len().saturating_sub(1))));
        }
        if error.script_stack.is_empty() {
            error.script_stack = self
                .frames
                .iter()
                .rev()
                .map(|f| f.unit.name.clone())
                .collect();
        }
        error
    }

    fn frame(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    // ------------------------------------------------------------------
    // Drives
    // ------------------------------------------------------------------

    fn step_drive(&mut self) -> StepResult {
        let frame = self.frame();
        let mut drive = frame.drive.take().expect("drive checked");
        let injected = if drive.awaiting != Awaiting::None {
            Some(frame.pop())
        } else {
            None
        };
        match drive.step(injected) {
            DriveStep::Call { f, args, captures } => {
                let dest_frame = self.frame();
                dest_frame.drive = Some(drive);
                // pc stays on the driving op so completion re-enters it
                self.call_value(f, args, false, captures)
            }
            DriveStep::Done(value) => {
                let dest = drive.dest;
                let frame = self.frame();
                match dest {
                    DriveDest::Push => {
                        frame.push(value);
                        frame.pc += 1;
                    }
                    DriveDest::StackSlot(slot) => {
                        if slot < frame.stack.len() {
                            frame.stack[slot] = value;
                        }
                    }
                }
                Ok(())
            }
            DriveStep::Error(error) => Err(Control::Error(error)),
        }
    }

    /// When an op is about to consume iterator values from the top `n`
    /// stack slots, realize them to lists first. Returns true when a
    /// drive was installed (the op re-executes afterwards).
    fn force_top(&mut self, n: usize) -> bool {
        let frame = self.frame();
        let len = frame.stack.len();
        for i in len.saturating_sub(n)..len {
            if let Value::Iter(state) = &frame.stack[i] {
                let node = state.lock().take_node();
                frame.drive = Some(DriveState::collect_into_slot(node, i));
                return true;
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    fn push_frame(
        &mut self,
        unit: Arc<crate::compiler::code::CodeUnit>,
        args: Vec<Value>,
        cells: Vec<HeapCell>,
        globals: Globals,
        captures: Option<Vec<Value>>,
    ) -> StepResult {
        if self.frames.len() >= self.options.max_frame_depth {
            return Err(fail(RuntimeErrorKind::StackOverflow));
        }
        let mut frame = Frame::new(unit, args, cells, globals);
        if let Some(captures) = captures {
            frame.captures = captures;
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Call a function value: direct when the positional arguments match
    /// the parameter shape exactly, otherwise through the wrapper.
    fn call_value(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        named: bool,
        captures: Option<Vec<Value>>,
    ) -> StepResult {
        let Value::Function(fv) = callee else {
            return Err(fail(RuntimeErrorKind::BadOperand {
                op: "call".to_string(),
                ty: callee.type_name(),
            }));
        };
        let params = fv.unit.params as usize;
        if !named && args.len() == params {
            return self.push_frame(
                Arc::clone(&fv.unit),
                args,
                fv.captures.clone(),
                fv.globals.clone(),
                captures,
            );
        }
        let Some(wrapper) = self.wrapper_of(&fv) else {
            return Err(fail(RuntimeErrorKind::InvalidArguments {
                message: format!(
                    "Function '{}' expects {} argument(s), got {}",
                    fv.name,
                    params,
                    args.len()
                ),
            }));
        };
        let (list, map) = canonical_args(args, named);
        self.push_frame(
            wrapper,
            vec![list, map],
            fv.captures.clone(),
            fv.globals.clone(),
            captures,
        )
    }

    fn wrapper_of(
        &self,
        fv: &FunctionValue,
    ) -> Option<Arc<crate::compiler::code::CodeUnit>> {
        fv.wrapper.clone()
    }

    fn make_closure(&mut self, fun: usize, cell_indices: &[u16]) -> Value {
        let program = Arc::clone(&self.program);
        let frame = self.frame();
        let cells = cell_indices
            .iter()
            .map(|&i| frame.cells[i as usize].clone())
            .collect();
        let unit = program.unit(fun);
        let wrapper = unit.wrapper.map(|w| program.unit(w));
        Value::Function(Arc::new(FunctionValue {
            name: Arc::from(unit.name.as_str()),
            unit,
            wrapper,
            captures: cells,
            globals: frame.globals.clone(),
        }))
    }

    // ------------------------------------------------------------------
    // The dispatch loop body
    // ------------------------------------------------------------------

    fn step(&mut self, ctx: &mut HostContext) -> StepResult {
        let frame = self.frame();
        let op = frame.unit.ops[frame.pc].clone();
        match op {
            Op::Const(v) => {
                let frame = self.frame();
                frame.push(v);
                frame.pc += 1;
            }
            Op::Pop => {
                let frame = self.frame();
                frame.pop();
                frame.pc += 1;
            }
            Op::Dup => {
                let frame = self.frame();
                let top = frame.peek().clone();
                frame.push(top);
                frame.pc += 1;
            }
            Op::Dup2 => {
                let frame = self.frame();
                let len = frame.stack.len();
                let a = frame.stack.get(len.wrapping_sub(2)).cloned().unwrap_or(Value::Null);
                let b = frame.stack.get(len.wrapping_sub(1)).cloned().unwrap_or(Value::Null);
                frame.push(a);
                frame.push(b);
                frame.pc += 1;
            }
            Op::Swap => {
                let frame = self.frame();
                let b = frame.pop();
                let a = frame.pop();
                frame.push(b);
                frame.push(a);
                frame.pc += 1;
            }
            Op::LoadLocal(slot) => {
                let frame = self.frame();
                let v = frame.locals[slot as usize].clone();
                frame.push(v);
                frame.pc += 1;
            }
            Op::StoreLocal(slot) => {
                if self.force_top(1) {
                    return Ok(());
                }
                let frame = self.frame();
                let v = frame.pop();
                frame.locals[slot as usize] = v;
                frame.pc += 1;
            }
            Op::LoadCell(idx) => {
                let frame = self.frame();
                let v = frame.cells[idx as usize].get();
                frame.push(v);
                frame.pc += 1;
            }
            Op::StoreCell(idx) => {
                if self.force_top(1) {
                    return Ok(());
                }
                let frame = self.frame();
                let v = frame.pop();
                frame.cells[idx as usize].set(v);
                frame.pc += 1;
            }
            Op::LoadGlobal(name) => {
                let frame = self.frame();
                let v = frame.globals.lock().get(&name).cloned().unwrap_or(Value::Null);
                frame.push(v);
                frame.pc += 1;
            }
            Op::StoreGlobal(name) => {
                if self.force_top(1) {
                    return Ok(());
                }
                let frame = self.frame();
                let v = frame.pop();
                frame.globals.lock().insert(name, v);
                frame.pc += 1;
            }
            Op::Jump(target) => {
                self.frame().pc = target;
            }
            Op::JumpIfFalse(target) => {
                let frame = self.frame();
                let v = frame.pop();
                frame.pc = if v.truthy() { frame.pc + 1 } else { target };
            }
            Op::JumpIfFalseOrPop(target) => {
                let frame = self.frame();
                if frame.peek().truthy() {
                    frame.pop();
                    frame.pc += 1;
                } else {
                    frame.pc = target;
                }
            }
            Op::JumpIfTrueOrPop(target) => {
                let frame = self.frame();
                if frame.peek().truthy() {
                    frame.pc = target;
                } else {
                    frame.pop();
                    frame.pc += 1;
                }
            }
            Op::JumpIfNull(target) => {
                let frame = self.frame();
                if frame.peek().is_null() {
                    frame.pc = target;
                } else {
                    frame.pc += 1;
                }
            }
            Op::Not => {
                let frame = self.frame();
                let v = frame.pop();
                frame.push(Value::Bool(!v.truthy()));
                frame.pc += 1;
            }
            Op::ToBool => {
                let frame = self.frame();
                let v = frame.pop();
                frame.push(Value::Bool(v.truthy()));
                frame.pc += 1;
            }
            Op::Negate => {
                let frame = self.frame();
                let v = frame.pop();
                let result = arith::negate(v).map_err(Control::Error)?;
                let frame = self.frame();
                frame.push(result);
                frame.pc += 1;
            }
            Op::UnaryPlus => {
                let frame = self.frame();
                let v = frame.pop();
                let result = arith::unary_plus(v).map_err(Control::Error)?;
                let frame = self.frame();
                frame.push(result);
                frame.pc += 1;
            }
            Op::BitNot => {
                let frame = self.frame();
                let v = frame.pop();
                let result = arith::bit_not(v).map_err(Control::Error)?;
                let frame = self.frame();
                frame.push(result);
                frame.pc += 1;
            }
            Op::Binary(bin) => {
                if self.force_top(2) {
                    return Ok(());
                }
                let precision = self.options.decimal_precision;
                let frame = self.frame();
                let rhs = frame.pop();
                let lhs = frame.pop();
                let result = arith::binary(bin, lhs, rhs, precision).map_err(Control::Error)?;
                let frame = self.frame();
                frame.push(result);
                frame.pc += 1;
            }
            Op::Convert(tag) => {
                if self.force_top(1) {
                    return Ok(());
                }
                let program = Arc::clone(&self.program);
                let frame = self.frame();
                let v = frame.pop();
                let result = arith::convert(v, tag, &program.classes).map_err(Control::Error)?;
                let frame = self.frame();
                frame.push(result);
                frame.pc += 1;
            }
            Op::InstanceOfOp { tag, negated } => {
                let program = Arc::clone(&self.program);
                let frame = self.frame();
                let v = frame.pop();
                let is = instance_of(&v, tag, &program.classes);
                frame.push(Value::Bool(is != negated));
                frame.pc += 1;
            }
            Op::InOp { negated } => {
                if self.force_top(2) {
                    return Ok(());
                }
                let frame = self.frame();
                let collection = frame.pop();
                let item = frame.pop();
                let found = arith::contains(&item, &collection).map_err(Control::Error)?;
                let frame = self.frame();
                frame.push(Value::Bool(found != negated));
                frame.pc += 1;
            }
            Op::BuildString(n) => {
                if self.force_top(n as usize) {
                    return Ok(());
                }
                let frame = self.frame();
                let at = frame.stack.len().saturating_sub(n as usize);
                let parts: Vec<Value> = frame.stack.split_off(at);
                let mut out = String::new();
                for part in parts {
                    out.push_str(&part.display());
                }
                frame.push(Value::string(out));
                frame.pc += 1;
            }
            Op::NewList(n) => {
                if self.force_top(n as usize) {
                    return Ok(());
                }
                let frame = self.frame();
                let at = frame.stack.len().saturating_sub(n as usize);
                let items = frame.stack.split_off(at);
                frame.push(Value::list(items));
                frame.pc += 1;
            }
            Op::NewMap(n) => {
                if self.force_top(2 * n as usize) {
                    return Ok(());
                }
                let frame = self.frame();
                let at = frame.stack.len().saturating_sub(2 * n as usize);
                let mut flat = frame.stack.split_off(at).into_iter();
                let mut map = IndexMap::new();
                while let (Some(k), Some(v)) = (flat.next(), flat.next()) {
                    map.insert(k.display(), v);
                }
                frame.push(Value::map(map));
                frame.pc += 1;
            }
            Op::Index {
                null_safe,
                create_if_missing,
            } => {
                if self.force_top(2) {
                    return Ok(());
                }
                let frame = self.frame();
                let index = frame.pop();
                let target = frame.pop();
                let result =
                    index_get(&target, &index, null_safe, create_if_missing).map_err(Control::Error)?;
                let frame = self.frame();
                frame.push(result);
                frame.pc += 1;
            }
            Op::IndexStore {
                null_safe,
                keep_value,
            } => {
                if self.force_top(1) {
                    return Ok(());
                }
                let frame = self.frame();
                let value = frame.pop();
                let index = frame.pop();
                let target = frame.pop();
                index_set(&target, &index, value.clone(), null_safe).map_err(Control::Error)?;
                let frame = self.frame();
                if keep_value {
                    frame.push(value);
                }
                frame.pc += 1;
            }
            Op::GetField {
                name,
                null_safe,
                create_if_missing,
            } => {
                let frame = self.frame();
                let target = frame.pop();
                let result =
                    field_get(&target, &name, null_safe, create_if_missing).map_err(Control::Error)?;
                let frame = self.frame();
                frame.push(result);
                frame.pc += 1;
            }
            Op::SetField {
                name,
                null_safe,
                keep_value,
            } => {
                if self.force_top(1) {
                    return Ok(());
                }
                let frame = self.frame();
                let value = frame.pop();
                let target = frame.pop();
                field_set(&target, &name, value.clone(), null_safe).map_err(Control::Error)?;
                let frame = self.frame();
                if keep_value {
                    frame.push(value);
                }
                frame.pc += 1;
            }
            Op::MakeClosure { fun, cells } => {
                let closure = self.make_closure(fun, &cells);
                let frame = self.frame();
                frame.push(closure);
                frame.pc += 1;
            }
            Op::CallStatic { fun, argc, cells } => {
                if self.force_top(argc as usize) {
                    return Ok(());
                }
                let unit = self.program.unit(fun);
                let frame = self.frame();
                frame.pc += 1;
                let at = frame.stack.len().saturating_sub(argc as usize);
                let args = frame.stack.split_off(at);
                let cell_refs = cells
                    .iter()
                    .map(|&i| frame.cells[i as usize].clone())
                    .collect();
                let globals = frame.globals.clone();
                self.push_frame(unit, args, cell_refs, globals, None)?;
            }
            Op::CallValue { argc, named } => {
                if self.force_top(argc as usize) {
                    return Ok(());
                }
                let frame = self.frame();
                frame.pc += 1;
                let at = frame.stack.len().saturating_sub(argc as usize);
                let args = frame.stack.split_off(at);
                let callee = frame.pop();
                self.call_value(callee, args, named, None)?;
            }
            Op::CallHost { idx, argc } => {
                if self.force_top(argc as usize) {
                    return Ok(());
                }
                let registry = Arc::clone(&self.registry);
                let frame = self.frame();
                let at = frame.stack.len().saturating_sub(argc as usize);
                let mut args = frame.stack.split_off(at);
                let host = registry.get(idx as usize);
                fill_host_defaults(host, &mut args);
                let dispatch = host.dispatch.clone().ok_or_else(|| {
                    fail(RuntimeErrorKind::Internal {
                        message: format!("Host function '{}' has no dispatch", host.name),
                    })
                })?;
                let result = dispatch(ctx, &args).map_err(Control::Error)?;
                let frame = self.frame();
                frame.push(result);
                frame.pc += 1;
            }
            Op::CallHostAsync { idx, argc } => {
                if self.force_top(argc as usize) {
                    return Ok(());
                }
                let registry = Arc::clone(&self.registry);
                let frame = self.frame();
                let at = frame.stack.len().saturating_sub(argc as usize);
                let mut args = frame.stack.split_off(at);
                let host = registry.get(idx as usize);
                fill_host_defaults(host, &mut args);
                // Resume pushes the outcome exactly where the result
                // would have been
                frame.pc += 1;
                return Err(Control::Suspend(AsyncOp {
                    function: host.name.clone(),
                    args,
                    dispatch: host.dispatch.clone(),
                }));
            }
            Op::CallMethod {
                name,
                argc,
                null_safe,
                named,
            } => {
                if self.force_top(argc as usize) {
                    return Ok(());
                }
                self.call_method(&name, argc, null_safe, named)?;
            }
            Op::NewInstance { class } => {
                let program = Arc::clone(&self.program);
                let class_info = &program.classes[class];
                let fields = class_info
                    .field_names
                    .iter()
                    .map(|n| (n.clone(), Value::Null))
                    .collect();
                let instance = Value::Instance(Arc::new(Mutex::new(Instance {
                    class_id: class,
                    class_name: Arc::clone(&class_info.name),
                    fields,
                })));
                let frame = self.frame();
                frame.push(instance);
                frame.pc += 1;
            }
            Op::CallInit { class, argc, named } => {
                if self.force_top(argc as usize) {
                    return Ok(());
                }
                let wrapper = self
                    .program
                    .unit(self.program.classes[class].init_wrapper);
                let frame = self.frame();
                frame.pc += 1;
                let at = frame.stack.len().saturating_sub(argc as usize);
                let args = frame.stack.split_off(at);
                let instance = frame.pop();
                let globals = frame.globals.clone();
                let (list, map) = canonical_args(args, named);
                self.push_frame(wrapper, vec![instance, list, map], Vec::new(), globals, None)?;
            }
            Op::Eval { has_bindings } => {
                if self.force_top(if has_bindings { 2 } else { 1 }) {
                    return Ok(());
                }
                self.eval(has_bindings)?;
            }
            Op::Return => {
                if self.force_top(1) {
                    return Ok(());
                }
                let mut done = self.frames.pop().expect("no frame to return from");
                let value = done.pop();
                match self.frames.last_mut() {
                    None => return Err(Control::Done(value)),
                    Some(caller) => caller.push(value),
                }
            }
            Op::BindArgs { target } => {
                self.bind_args(target)?;
            }
            Op::JumpIfBound { param, target } => {
                let frame = self.frame();
                let bound = frame.bound.get(param as usize).copied().unwrap_or(false);
                frame.pc = if bound { target } else { frame.pc + 1 };
            }
            Op::RegexMatch {
                site,
                global,
                negated,
                flags,
            } => {
                self.regex_match(site, global, negated, flags)?;
            }
            Op::RegexSubst {
                site: _,
                global,
                flags,
            } => {
                let frame = self.frame();
                let closure = frame.pop();
                let pattern = frame.pop().display();
                let subject = frame.pop();
                if subject.is_null() {
                    return Err(fail(RuntimeErrorKind::NullValue {
                        context: "as the subject of a substitution".to_string(),
                    }));
                }
                let state = SubstState::new(subject.display(), pattern, flags, global, closure);
                let frame = self.frame();
                frame.drive = Some(DriveState::new(
                    IterNode::Empty,
                    DriveKind::Subst(state),
                    DriveDest::Push,
                ));
                // pc stays: the drive completion pushes the result
            }
            Op::LoadCaptureVar(n) => {
                let frame = self.frame();
                let v = frame.captures.get(n as usize).cloned().unwrap_or(Value::Null);
                frame.push(v);
                frame.pc += 1;
            }
            Op::Print { newline } => {
                if self.force_top(1) {
                    return Ok(());
                }
                let frame = self.frame();
                let v = frame.pop();
                let text = v.display();
                if newline {
                    ctx.writer.println(&text);
                } else {
                    ctx.writer.print(&text);
                }
                self.frame().pc += 1;
            }
            Op::Die { has_value } => {
                let message = if has_value {
                    self.frame().pop().display()
                } else {
                    "Script died".to_string()
                };
                return Err(Control::Error(RuntimeError::died(message)));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Method dispatch
    // ------------------------------------------------------------------

    fn call_method(&mut self, name: &str, argc: u8, null_safe: bool, named: bool) -> StepResult {
        let program = Arc::clone(&self.program);
        let frame = self.frame();
        let at = frame.stack.len().saturating_sub(argc as usize);
        let args = frame.stack.split_off(at);
        let target = frame.pop();

        if target.is_null() {
            if null_safe {
                let frame = self.frame();
                frame.push(Value::Null);
                frame.pc += 1;
                return Ok(());
            }
            return Err(fail(RuntimeErrorKind::NullValue {
                context: format!("calling method '{}'", name),
            }));
        }

        // Script-defined methods on instances
        if let Value::Instance(instance) = &target {
            let class_id = instance.lock().class_id;
            if let Some(&unit_id) = program.classes[class_id].methods.get(name) {
                let unit = program.unit(unit_id);
                let frame = self.frame();
                frame.pc += 1;
                let globals = frame.globals.clone();
                let user_params = unit.params as usize - 1;
                if !named && args.len() == user_params {
                    let mut all = Vec::with_capacity(args.len() + 1);
                    all.push(target);
                    all.extend(args);
                    return self.push_frame(unit, all, Vec::new(), globals, None);
                }
                let Some(wrapper_id) = unit.wrapper else {
                    return Err(fail(RuntimeErrorKind::InvalidArguments {
                        message: format!(
                            "Method '{}' expects {} argument(s), got {}",
                            name,
                            user_params,
                            args.len()
                        ),
                    }));
                };
                let wrapper = program.unit(wrapper_id);
                let (list, map) = canonical_args(args, named);
                return self.push_frame(wrapper, vec![target, list, map], Vec::new(), globals, None);
            }
            // A function-valued field is callable as a method
            let field = instance.lock().fields.get(name).cloned();
            if let Some(f @ Value::Function(_)) = field {
                self.frame().pc += 1;
                return self.call_value(f, args, named, None);
            }
        }

        // A function-valued map entry is callable as a method
        if let Value::Map(map) = &target {
            let entry = map.lock().get(name).cloned();
            if let Some(f @ Value::Function(_)) = entry {
                self.frame().pc += 1;
                return self.call_value(f, args, named, None);
            }
        }

        match builtins::invoke(&target, name, &args) {
            Some(BuiltinResult::Value(v)) => {
                let frame = self.frame();
                frame.push(v);
                frame.pc += 1;
                Ok(())
            }
            Some(BuiltinResult::Drive(drive)) => {
                // pc stays: drive completion pushes and advances
                self.frame().drive = Some(drive);
                Ok(())
            }
            Some(BuiltinResult::Error(e)) => Err(Control::Error(e)),
            None => Err(fail(RuntimeErrorKind::MethodNotFound {
                name: name.to_string(),
                ty: target.type_name(),
            })),
        }
    }

    // ------------------------------------------------------------------
    // Wrapper argument binding
    // ------------------------------------------------------------------

    fn bind_args(&mut self, target: usize) -> StepResult {
        let unit = self.program.unit(target);
        let meta = &unit.param_meta;
        let n = meta.len();
        let frame = self.frame();
        let (list_slot, map_slot, param_base) = if frame.unit.is_method {
            (1usize, 2usize, 3usize)
        } else {
            (0, 1, 2)
        };
        let list = frame.locals[list_slot].clone();
        let map = frame.locals[map_slot].clone();

        let mut positional: Vec<Value> = match &list {
            Value::List(l) => l.lock().clone(),
            _ => Vec::new(),
        };
        // A single list argument spreads over a multi-parameter target
        if positional.len() == 1 && n > 1 {
            if let Value::List(inner) = &positional[0] {
                let inner_values = inner.lock().clone();
                positional = inner_values;
            }
        }
        if positional.len() > n {
            return Err(fail(RuntimeErrorKind::InvalidArguments {
                message: format!(
                    "Too many arguments: '{}' expects {}, got {}",
                    unit.name,
                    n,
                    positional.len()
                ),
            }));
        }

        frame.bound = vec![false; n];
        for (i, v) in positional.into_iter().enumerate() {
            frame.locals[param_base + i] = v;
            frame.bound[i] = true;
        }

        if let Value::Map(named) = &map {
            for (key, value) in named.lock().iter() {
                match meta.iter().position(|p| &p.name == key) {
                    Some(i) => {
                        frame.locals[param_base + i] = value.clone();
                        frame.bound[i] = true;
                    }
                    None => {
                        return Err(fail(RuntimeErrorKind::InvalidArguments {
                            message: format!("'{}' has no parameter named '{}'", unit.name, key),
                        }));
                    }
                }
            }
        }

        for (i, param) in meta.iter().enumerate() {
            if !frame.bound[i] && !param.has_default {
                if unit.is_init {
                    let class = unit.name.strip_suffix(".init").unwrap_or(&unit.name);
                    return Err(fail(RuntimeErrorKind::MissingField {
                        field: param.name.clone(),
                        class: class.to_string(),
                    }));
                }
                return Err(fail(RuntimeErrorKind::InvalidArguments {
                    message: format!(
                        "Missing value for parameter '{}' of '{}'",
                        param.name, unit.name
                    ),
                }));
            }
        }
        frame.pc += 1;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Regex matching
    // ------------------------------------------------------------------

    fn regex_match(
        &mut self,
        site: u32,
        global: bool,
        negated: bool,
        flags: RegexFlags,
    ) -> StepResult {
        let frame = self.frames.last_mut().expect("no active frame");
        let pattern = frame.pop().display();
        let subject_value = frame.pop();
        if subject_value.is_null() {
            return Err(fail(RuntimeErrorKind::NullValue {
                context: "as the subject of a match".to_string(),
            }));
        }
        let subject = subject_value.display();
        let regex = self.regex_cache.get(&pattern, flags).map_err(Control::Error)?;
        let frame = self.frames.last_mut().expect("no active frame");

        let matched = if global {
            let start = match frame.regex_sites.get(&site) {
                Some(state) if state.subject == subject => state.pos,
                _ => 0,
            };
            if start > subject.len() {
                frame.regex_sites.remove(&site);
                false
            } else {
                match regex.captures_at(&subject, start) {
                    Some(caps) => {
                        let whole = caps.get(0).expect("group 0 always present");
                        // Guarantee progress on empty matches
                        let next = if whole.end() > start {
                            whole.end()
                        } else {
                            subject[whole.end()..]
                                .chars()
                                .next()
                                .map(|c| whole.end() + c.len_utf8())
                                .unwrap_or(subject.len() + 1)
                        };
                        frame.captures = regexes::capture_values(&caps);
                        frame.regex_sites.insert(
                            site,
                            GlobalMatchState {
                                subject: subject.clone(),
                                pos: next,
                            },
                        );
                        true
                    }
                    None => {
                        frame.regex_sites.remove(&site);
                        false
                    }
                }
            }
        } else {
            match regex.captures(&subject) {
                Some(caps) => {
                    frame.captures = regexes::capture_values(&caps);
                    true
                }
                None => false,
            }
        };

        frame.push(Value::Bool(matched != negated));
        frame.pc += 1;
        Ok(())
    }

    // ------------------------------------------------------------------
    // eval
    // ------------------------------------------------------------------

    fn eval(&mut self, has_bindings: bool) -> StepResult {
        let frame = self.frame();
        let bindings = if has_bindings { Some(frame.pop()) } else { None };
        let source = frame.pop().display();
        frame.pc += 1;

        let registry = Arc::clone(&self.registry);
        match crate::compile_eval_program(&source, &registry) {
            Ok(program) => {
                let globals: Globals = match &bindings {
                    Some(Value::Map(map)) => Arc::clone(map),
                    _ => Arc::new(Mutex::new(IndexMap::new())),
                };
                let unit = program.unit(program.main);
                self.push_frame(unit, Vec::new(), Vec::new(), globals, None)
            }
            Err(errors) => {
                if let Some(Value::Map(map)) = &bindings {
                    map.lock()
                        .insert("$error".to_string(), Value::string(errors.to_string()));
                }
                let frame = self.frame();
                frame.push(Value::Null);
                Ok(())
            }
        }
    }
}

// ----------------------------------------------------------------------
// Value access helpers
// ----------------------------------------------------------------------

fn canonical_args(args: Vec<Value>, named: bool) -> (Value, Value) {
    if named {
        let map = args.into_iter().next().unwrap_or_else(Value::empty_map);
        (Value::list(Vec::new()), map)
    } else {
        (Value::list(args), Value::empty_map())
    }
}

fn fill_host_defaults(host: &crate::host::HostFunction, args: &mut Vec<Value>) {
    if host.varargs {
        return;
    }
    for param in host.params.iter().skip(args.len()) {
        match &param.default {
            Some(default) => args.push(default.clone()),
            None => break,
        }
    }
}

fn instance_of(v: &Value, tag: TypeTag, classes: &[crate::compiler::code::RuntimeClass]) -> bool {
    match tag {
        TypeTag::Any => true,
        TypeTag::Bool => matches!(v, Value::Bool(_)),
        TypeTag::Int => matches!(v, Value::Int(_)),
        TypeTag::Long => matches!(v, Value::Long(_)),
        TypeTag::Double => matches!(v, Value::Double(_)),
        TypeTag::Decimal => matches!(v, Value::Decimal(_)),
        TypeTag::Str => matches!(v, Value::Str(_)),
        TypeTag::List => matches!(v, Value::List(_)),
        TypeTag::Map => matches!(v, Value::Map(_)),
        TypeTag::Function => matches!(v, Value::Function(_)),
        TypeTag::Instance(base) => match v {
            Value::Instance(i) => crate::compiler::code::RuntimeClass::is_instance_of(
                classes,
                i.lock().class_id,
                base,
            ),
            _ => false,
        },
    }
}

fn index_get(
    target: &Value,
    index: &Value,
    null_safe: bool,
    create_if_missing: bool,
) -> Result<Value, RuntimeError> {
    match target {
        Value::Null => {
            if null_safe {
                Ok(Value::Null)
            } else {
                Err(RuntimeError::new(RuntimeErrorKind::NullValue {
                    context: "as the target of an index".to_string(),
                }))
            }
        }
        Value::List(list) => {
            let guard = list.lock();
            let idx = resolve_index(index, guard.len())?;
            Ok(guard.get(idx).cloned().unwrap_or(Value::Null))
        }
        Value::Map(map) => {
            let key = index.display();
            if create_if_missing {
                let mut guard = map.lock();
                if !guard.contains_key(&key) {
                    guard.insert(key.clone(), Value::empty_map());
                }
                Ok(guard.get(&key).cloned().unwrap_or(Value::Null))
            } else {
                Ok(map.lock().get(&key).cloned().unwrap_or(Value::Null))
            }
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = resolve_index(index, chars.len())?;
            match chars.get(idx) {
                Some(c) => Ok(Value::string(c.to_string())),
                None => Err(RuntimeError::new(RuntimeErrorKind::IndexOutOfBounds {
                    index: idx as i64,
                    size: chars.len(),
                })),
            }
        }
        other => Err(RuntimeError::new(RuntimeErrorKind::BadOperand {
            op: "[]".to_string(),
            ty: other.type_name(),
        })),
    }
}

/// Negative indexes count from the end.
fn resolve_index(index: &Value, len: usize) -> Result<usize, RuntimeError> {
    let i = index.to_i64().ok_or_else(|| {
        RuntimeError::new(RuntimeErrorKind::BadOperand {
            op: "[]".to_string(),
            ty: index.type_name(),
        })
    })?;
    if i < 0 {
        let adjusted = i + len as i64;
        if adjusted < 0 {
            return Err(RuntimeError::new(RuntimeErrorKind::IndexOutOfBounds {
                index: i,
                size: len,
            }));
        }
        Ok(adjusted as usize)
    } else {
        Ok(i as usize)
    }
}

fn index_set(
    target: &Value,
    index: &Value,
    value: Value,
    null_safe: bool,
) -> Result<(), RuntimeError> {
    match target {
        Value::Null if null_safe => Ok(()),
        Value::List(list) => {
            let mut guard = list.lock();
            let len = guard.len();
            let idx = resolve_index(index, len)?;
            if idx >= guard.len() {
                guard.resize(idx + 1, Value::Null);
            }
            guard[idx] = value;
            Ok(())
        }
        Value::Map(map) => {
            map.lock().insert(index.display(), value);
            Ok(())
        }
        Value::Null => Err(RuntimeError::new(RuntimeErrorKind::NullValue {
            context: "as the target of an index store".to_string(),
        })),
        other => Err(RuntimeError::new(RuntimeErrorKind::BadOperand {
            op: "[]=".to_string(),
            ty: other.type_name(),
        })),
    }
}

fn field_get(
    target: &Value,
    name: &str,
    null_safe: bool,
    create_if_missing: bool,
) -> Result<Value, RuntimeError> {
    match target {
        Value::Null => {
            if null_safe {
                Ok(Value::Null)
            } else {
                Err(RuntimeError::new(RuntimeErrorKind::NullValue {
                    context: format!("accessing field '{}'", name),
                }))
            }
        }
        Value::Map(map) => {
            if create_if_missing {
                let mut guard = map.lock();
                if !guard.contains_key(name) {
                    guard.insert(name.to_string(), Value::empty_map());
                }
                Ok(guard.get(name).cloned().unwrap_or(Value::Null))
            } else {
                Ok(map.lock().get(name).cloned().unwrap_or(Value::Null))
            }
        }
        Value::Instance(instance) => {
            let guard = instance.lock();
            guard.fields.get(name).cloned().ok_or_else(|| {
                RuntimeError::new(RuntimeErrorKind::FieldNotFound {
                    name: name.to_string(),
                    ty: guard.class_name.to_string(),
                })
            })
        }
        other => Err(RuntimeError::new(RuntimeErrorKind::FieldNotFound {
            name: name.to_string(),
            ty: other.type_name(),
        })),
    }
}

fn field_set(
    target: &Value,
    name: &str,
    value: Value,
    null_safe: bool,
) -> Result<(), RuntimeError> {
    match target {
        Value::Null if null_safe => Ok(()),
        Value::Map(map) => {
            map.lock().insert(name.to_string(), value);
            Ok(())
        }
        Value::Instance(instance) => {
            let mut guard = instance.lock();
            if guard.fields.contains_key(name) {
                guard.fields.insert(name.to_string(), value);
                Ok(())
            } else {
                Err(RuntimeError::new(RuntimeErrorKind::FieldNotFound {
                    name: name.to_string(),
                    ty: guard.class_name.to_string(),
                }))
            }
        }
        Value::Null => Err(RuntimeError::new(RuntimeErrorKind::NullValue {
            context: format!("storing field '{}'", name),
        })),
        other => Err(RuntimeError::new(RuntimeErrorKind::FieldNotFound {
            name: name.to_string(),
            ty: other.type_name(),
        })),
    }
}
