//! Lazy iterators and drives
//!
//! `map`/`filter`/`flatMap` chains build `IterNode` trees without
//! running any script code. Realization happens through a `DriveState`
//! installed on the consuming frame: the VM steps the drive, and
//! whenever a closure must run, the drive parks (`Step::Call`), the
//! closure executes as an ordinary frame, and the result is injected
//! back on re-entry. All drive state lives in frames and values, so a
//! suspension inside a mapping closure is captured like any other.

use crate::error::RuntimeError;
use crate::vm::arith;
use crate::vm::regexes::SubstState;
use crate::vm::value::{ListRef, MapRef, Value};
use std::cmp::Ordering;
use std::sync::Arc;

/// One pull on an iterator chain.
#[derive(Debug)]
pub enum Step {
    Yield(Value),
    Done,
    /// A closure must run before the chain can continue
    Call {
        f: Value,
        args: Vec<Value>,
        captures: Option<Vec<Value>>,
    },
}

/// A node in a lazy iterator chain. Single-pass: sources are consumed
/// as they advance and are not restartable.
#[derive(Debug, Clone)]
pub enum IterNode {
    Empty,
    Single(Option<Value>),
    ListSrc { list: ListRef, idx: usize },
    MapSrc { map: MapRef, idx: usize },
    StrSrc { s: Arc<str>, pos: usize },
    MapOp {
        inner: Box<IterNode>,
        f: Value,
        awaiting: bool,
    },
    FilterOp {
        inner: Box<IterNode>,
        f: Value,
        pending: Option<Value>,
        awaiting: bool,
    },
    FlatMapOp {
        inner: Box<IterNode>,
        f: Value,
        current: Option<Box<IterNode>>,
        awaiting: bool,
    },
    SkipOp {
        inner: Box<IterNode>,
        remaining: usize,
    },
    LimitOp {
        inner: Box<IterNode>,
        remaining: usize,
    },
    UniqueOp {
        inner: Box<IterNode>,
        seen: Vec<Value>,
    },
    ReverseOp {
        inner: Box<IterNode>,
        buf: Vec<Value>,
        drained: bool,
        idx: usize,
    },
}

/// Holds an iterator chain inside a `Value::Iter`.
#[derive(Debug)]
pub struct IterState {
    pub node: IterNode,
}

impl IterState {
    pub fn new(node: IterNode) -> Self {
        Self { node }
    }

    /// Take the chain out; iterators are single-pass, so the original
    /// value is left exhausted.
    pub fn take_node(&mut self) -> IterNode {
        std::mem::replace(&mut self.node, IterNode::Empty)
    }
}

/// Build a source node for any iterable value.
pub fn source_node(value: &Value) -> Option<IterNode> {
    match value {
        Value::List(list) => Some(IterNode::ListSrc {
            list: Arc::clone(list),
            idx: 0,
        }),
        Value::Map(map) => Some(IterNode::MapSrc {
            map: Arc::clone(map),
            idx: 0,
        }),
        Value::Str(s) => Some(IterNode::StrSrc {
            s: Arc::clone(s),
            pos: 0,
        }),
        Value::Iter(state) => Some(state.lock().take_node()),
        _ => None,
    }
}

/// Any value becomes an iterator for `flatMap` results: collections
/// flatten, everything else is a single element (null vanishes).
fn node_from_value(value: Value) -> IterNode {
    match &value {
        Value::Null => IterNode::Empty,
        Value::List(_) | Value::Map(_) | Value::Iter(_) => {
            source_node(&value).unwrap_or(IterNode::Empty)
        }
        _ => IterNode::Single(Some(value)),
    }
}

impl IterNode {
    /// Advance the chain one element. `injected` carries a closure
    /// result back into whichever node was awaiting it.
    pub fn step(&mut self, injected: &mut Option<Value>) -> Step {
        loop {
            match self {
                IterNode::Empty => return Step::Done,
                IterNode::Single(slot) => {
                    return match slot.take() {
                        Some(v) => Step::Yield(v),
                        None => Step::Done,
                    };
                }
                IterNode::ListSrc { list, idx } => {
                    let guard = list.lock();
                    if *idx < guard.len() {
                        let v = guard[*idx].clone();
                        *idx += 1;
                        return Step::Yield(v);
                    }
                    return Step::Done;
                }
                IterNode::MapSrc { map, idx } => {
                    let guard = map.lock();
                    if let Some((k, v)) = guard.get_index(*idx) {
                        let entry = Value::list(vec![Value::string(k.clone()), v.clone()]);
                        *idx += 1;
                        return Step::Yield(entry);
                    }
                    return Step::Done;
                }
                IterNode::StrSrc { s, pos } => {
                    match s[*pos..].chars().next() {
                        Some(c) => {
                            *pos += c.len_utf8();
                            return Step::Yield(Value::string(c.to_string()));
                        }
                        None => return Step::Done,
                    }
                }
                IterNode::MapOp { inner, f, awaiting } => {
                    if *awaiting {
                        if let Some(v) = injected.take() {
                            *awaiting = false;
                            return Step::Yield(v);
                        }
                        return Step::Done;
                    }
                    match inner.step(injected) {
                        Step::Yield(v) => {
                            *awaiting = true;
                            return Step::Call {
                                f: f.clone(),
                                args: vec![v],
                                captures: None,
                            };
                        }
                        other => return other,
                    }
                }
                IterNode::FilterOp {
                    inner,
                    f,
                    pending,
                    awaiting,
                } => {
                    if *awaiting {
                        let Some(verdict) = injected.take() else {
                            return Step::Done;
                        };
                        *awaiting = false;
                        let kept = pending.take().unwrap_or(Value::Null);
                        if verdict.truthy() {
                            return Step::Yield(kept);
                        }
                        continue;
                    }
                    match inner.step(injected) {
                        Step::Yield(v) => {
                            *pending = Some(v.clone());
                            *awaiting = true;
                            return Step::Call {
                                f: f.clone(),
                                args: vec![v],
                                captures: None,
                            };
                        }
                        other => return other,
                    }
                }
                IterNode::FlatMapOp {
                    inner,
                    f,
                    current,
                    awaiting,
                } => {
                    if *awaiting {
                        let Some(v) = injected.take() else {
                            return Step::Done;
                        };
                        *awaiting = false;
                        *current = Some(Box::new(node_from_value(v)));
                    }
                    if let Some(cur) = current {
                        match cur.step(injected) {
                            Step::Done => {
                                *current = None;
                            }
                            other => return other,
                        }
                    }
                    match inner.step(injected) {
                        Step::Yield(v) => {
                            *awaiting = true;
                            return Step::Call {
                                f: f.clone(),
                                args: vec![v],
                                captures: None,
                            };
                        }
                        other => return other,
                    }
                }
                IterNode::SkipOp { inner, remaining } => match inner.step(injected) {
                    Step::Yield(v) => {
                        if *remaining > 0 {
                            *remaining -= 1;
                            continue;
                        }
                        return Step::Yield(v);
                    }
                    other => return other,
                },
                IterNode::LimitOp { inner, remaining } => {
                    if *remaining == 0 {
                        return Step::Done;
                    }
                    match inner.step(injected) {
                        Step::Yield(v) => {
                            *remaining -= 1;
                            return Step::Yield(v);
                        }
                        other => return other,
                    }
                }
                IterNode::UniqueOp { inner, seen } => match inner.step(injected) {
                    Step::Yield(v) => {
                        if seen.iter().any(|s| s.equals(&v)) {
                            continue;
                        }
                        seen.push(v.clone());
                        return Step::Yield(v);
                    }
                    other => return other,
                },
                IterNode::ReverseOp {
                    inner,
                    buf,
                    drained,
                    idx,
                } => {
                    if !*drained {
                        match inner.step(injected) {
                            Step::Yield(v) => {
                                buf.push(v);
                                continue;
                            }
                            Step::Done => {
                                buf.reverse();
                                *drained = true;
                            }
                            call => return call,
                        }
                    }
                    if *idx < buf.len() {
                        let v = buf[*idx].clone();
                        *idx += 1;
                        return Step::Yield(v);
                    }
                    return Step::Done;
                }
            }
        }
    }
}

// ----------------------------------------------------------------------
// Drives
// ----------------------------------------------------------------------

/// Where the drive's final value goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveDest {
    /// Push the result and advance past the op that started the drive
    Push,
    /// Replace a stack slot (iterator realization) and re-execute the op
    StackSlot(usize),
}

/// Who consumes the next injected closure result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Awaiting {
    None,
    Iter,
    Kind,
}

/// The terminal operation a drive performs.
#[derive(Debug)]
pub enum DriveKind {
    Collect { acc: Vec<Value> },
    Each { f: Value },
    Reduce { f: Value, acc: Value },
    Sum { acc: Value },
    Avg { acc: Value, count: i64 },
    Min { best: Option<Value> },
    Max { best: Option<Value> },
    Join { sep: String, out: String, first: bool },
    Count { n: i64 },
    Contains { needle: Value },
    Sort(SortState),
    Subst(SubstState),
}

/// Insertion sort with a possibly-async comparator. `items[..sorted]`
/// is sorted; `key` is being sifted down from position `j`.
#[derive(Debug)]
pub struct SortState {
    pub cmp: Option<Value>,
    pub items: Vec<Value>,
    pub collected: bool,
    pub sorted: usize,
    pub j: usize,
    pub key: Option<Value>,
}

/// An in-flight terminal operation, owned by the frame whose op
/// started it.
#[derive(Debug)]
pub struct DriveState {
    pub iter: IterNode,
    pub kind: DriveKind,
    pub dest: DriveDest,
    pub awaiting: Awaiting,
}

/// Drive progress as seen by the VM loop.
#[derive(Debug)]
pub enum DriveStep {
    /// A closure frame must run; re-enter with its result injected
    Call {
        f: Value,
        args: Vec<Value>,
        captures: Option<Vec<Value>>,
    },
    Done(Value),
    Error(RuntimeError),
}

impl DriveState {
    pub fn new(iter: IterNode, kind: DriveKind, dest: DriveDest) -> Self {
        Self {
            iter,
            kind,
            dest,
            awaiting: Awaiting::None,
        }
    }

    pub fn collect_into_slot(node: IterNode, slot: usize) -> Self {
        Self::new(node, DriveKind::Collect { acc: Vec::new() }, DriveDest::StackSlot(slot))
    }

    /// Advance until the drive needs a closure result or finishes.
    pub fn step(&mut self, mut injected: Option<Value>) -> DriveStep {
        loop {
            match self.awaiting {
                Awaiting::Kind => {
                    let value = injected.take().unwrap_or(Value::Null);
                    self.awaiting = Awaiting::None;
                    if let Some(result) = self.consume_kind_result(value) {
                        return result;
                    }
                    continue;
                }
                Awaiting::Iter | Awaiting::None => {}
            }

            // Substitution and the sort phase do not pull the iterator
            if let DriveKind::Subst(subst) = &mut self.kind {
                match subst.step() {
                    crate::vm::regexes::SubstStep::Call { f, captures } => {
                        self.awaiting = Awaiting::Kind;
                        return DriveStep::Call {
                            f,
                            args: Vec::new(),
                            captures: Some(captures),
                        };
                    }
                    crate::vm::regexes::SubstStep::Done(s) => return DriveStep::Done(s),
                    crate::vm::regexes::SubstStep::Error(e) => return DriveStep::Error(e),
                }
            }
            if let DriveKind::Sort(sort) = &mut self.kind {
                if sort.collected {
                    match Self::sort_step(sort) {
                        Some(DriveStep::Call { f, args, captures }) => {
                            self.awaiting = Awaiting::Kind;
                            return DriveStep::Call { f, args, captures };
                        }
                        Some(result) => return result,
                        None => continue,
                    }
                }
            }

            let step = self.iter.step(&mut injected);
            self.awaiting = Awaiting::None;
            match step {
                Step::Call { f, args, captures } => {
                    self.awaiting = Awaiting::Iter;
                    return DriveStep::Call { f, args, captures };
                }
                Step::Yield(v) => {
                    if let Some(result) = self.consume_element(v) {
                        return result;
                    }
                }
                Step::Done => {
                    if let Some(result) = self.finish() {
                        return result;
                    }
                }
            }
        }
    }

    /// Feed one produced element to the terminal operation. Returns
    /// `Some` to stop the drive (done, error, or closure call).
    fn consume_element(&mut self, v: Value) -> Option<DriveStep> {
        match &mut self.kind {
            DriveKind::Collect { acc } => {
                acc.push(v);
                None
            }
            DriveKind::Each { f } => {
                self.awaiting = Awaiting::Kind;
                Some(DriveStep::Call {
                    f: f.clone(),
                    args: vec![v],
                    captures: None,
                })
            }
            DriveKind::Reduce { f, acc } => {
                let current = std::mem::take(acc);
                self.awaiting = Awaiting::Kind;
                Some(DriveStep::Call {
                    f: f.clone(),
                    args: vec![current, v],
                    captures: None,
                })
            }
            DriveKind::Sum { acc } => {
                match arith::binary(crate::parser::ast::BinOp::Add, acc.clone(), v, 20) {
                    Ok(sum) => {
                        *acc = sum;
                        None
                    }
                    Err(e) => Some(DriveStep::Error(e)),
                }
            }
            DriveKind::Avg { acc, count } => {
                *count += 1;
                match arith::binary(crate::parser::ast::BinOp::Add, acc.clone(), v, 20) {
                    Ok(sum) => {
                        *acc = sum;
                        None
                    }
                    Err(e) => Some(DriveStep::Error(e)),
                }
            }
            DriveKind::Min { best } => {
                let better = match best {
                    Some(b) => matches!(v.compare(b), Some(Ordering::Less)),
                    None => true,
                };
                if better {
                    *best = Some(v);
                }
                None
            }
            DriveKind::Max { best } => {
                let better = match best {
                    Some(b) => matches!(v.compare(b), Some(Ordering::Greater)),
                    None => true,
                };
                if better {
                    *best = Some(v);
                }
                None
            }
            DriveKind::Join { sep, out, first } => {
                if !*first {
                    out.push_str(sep);
                }
                *first = false;
                out.push_str(&v.display());
                None
            }
            DriveKind::Count { n } => {
                *n += 1;
                None
            }
            DriveKind::Contains { needle } => {
                if needle.equals(&v) {
                    Some(DriveStep::Done(Value::Bool(true)))
                } else {
                    None
                }
            }
            DriveKind::Sort(sort) => {
                sort.items.push(v);
                None
            }
            DriveKind::Subst(_) => None,
        }
    }

    /// Deliver a closure result to the terminal operation.
    fn consume_kind_result(&mut self, value: Value) -> Option<DriveStep> {
        match &mut self.kind {
            DriveKind::Each { .. } => None,
            DriveKind::Reduce { acc, .. } => {
                *acc = value;
                None
            }
            DriveKind::Sort(sort) => Self::sort_deliver(sort, value),
            DriveKind::Subst(subst) => {
                subst.deliver(&value);
                None
            }
            _ => None,
        }
    }

    /// Iterator exhausted: produce the terminal value, or switch a sort
    /// into its comparison phase.
    fn finish(&mut self) -> Option<DriveStep> {
        match &mut self.kind {
            DriveKind::Collect { acc } => Some(DriveStep::Done(Value::list(std::mem::take(acc)))),
            DriveKind::Each { .. } => Some(DriveStep::Done(Value::Null)),
            DriveKind::Reduce { acc, .. } => Some(DriveStep::Done(std::mem::take(acc))),
            DriveKind::Sum { acc } => Some(DriveStep::Done(std::mem::take(acc))),
            DriveKind::Avg { acc, count } => {
                if *count == 0 {
                    return Some(DriveStep::Done(Value::Null));
                }
                let sum = std::mem::take(acc);
                let result = sum
                    .to_decimal()
                    .map(|d| Value::decimal(d / bigdecimal::BigDecimal::from(*count)))
                    .unwrap_or(Value::Null);
                Some(DriveStep::Done(result))
            }
            DriveKind::Min { best } | DriveKind::Max { best } => {
                Some(DriveStep::Done(best.take().unwrap_or(Value::Null)))
            }
            DriveKind::Join { out, .. } => Some(DriveStep::Done(Value::string(std::mem::take(out)))),
            DriveKind::Count { n } => Some(DriveStep::Done(Value::Int(*n as i32))),
            DriveKind::Contains { .. } => Some(DriveStep::Done(Value::Bool(false))),
            DriveKind::Sort(sort) => {
                sort.collected = true;
                if sort.cmp.is_none() {
                    let mut items = std::mem::take(&mut sort.items);
                    items.sort_by(|a, b| a.compare(b).unwrap_or(Ordering::Equal));
                    return Some(DriveStep::Done(Value::list(items)));
                }
                sort.sorted = 1;
                sort.j = 1;
                None
            }
            DriveKind::Subst(_) => None,
        }
    }

    /// One step of the comparator-driven insertion sort. `None` means
    /// keep looping without running a closure.
    fn sort_step(sort: &mut SortState) -> Option<DriveStep> {
        if sort.sorted >= sort.items.len() {
            let items = std::mem::take(&mut sort.items);
            return Some(DriveStep::Done(Value::list(items)));
        }
        if sort.key.is_none() {
            sort.key = Some(sort.items[sort.sorted].clone());
            sort.j = sort.sorted;
        }
        if sort.j == 0 {
            sort.items[0] = sort.key.take().unwrap_or(Value::Null);
            sort.sorted += 1;
            return None;
        }
        let cmp = sort.cmp.clone().unwrap_or(Value::Null);
        let a = sort.items[sort.j - 1].clone();
        let b = sort.key.clone().unwrap_or(Value::Null);
        Some(DriveStep::Call {
            f: cmp,
            args: vec![a, b],
            captures: None,
        })
    }

    fn sort_deliver(sort: &mut SortState, verdict: Value) -> Option<DriveStep> {
        let greater = verdict.to_i64().map(|n| n > 0).unwrap_or(false);
        if greater {
            sort.items[sort.j] = sort.items[sort.j - 1].clone();
            sort.j -= 1;
        } else {
            sort.items[sort.j] = sort.key.take().unwrap_or(Value::Null);
            sort.sorted += 1;
        }
        None
    }
}

pub fn iter_value(node: IterNode) -> Value {
    Value::Iter(Arc::new(parking_lot::Mutex::new(IterState::new(node))))
}
