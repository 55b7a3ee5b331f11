//! Detached continuations
//!
//! A suspended script can be detached into a pure value graph: primitive
//! values, list/map/instance graphs (deduplicated by identity, so shared
//! and cyclic data survive), heap cells, function identities by stable
//! compiled name, iterator/drive state, and frame positions. The engine
//! defines only this graph shape, not a wire format; hosts serialize it
//! with whatever serde backend they use and reattach it against the same
//! compiled program.

use crate::compiler::code::{Origin, Program};
use crate::compiler::op::RegexFlags;
use crate::vm::frame::{Continuation, Frame};
use crate::vm::heap::HeapCell;
use crate::vm::iter::{
    Awaiting, DriveDest, DriveKind, DriveState, IterNode, IterState, SortState,
};
use crate::vm::regexes::{GlobalMatchState, SubstState};
use crate::vm::value::{FunctionValue, Globals, Instance, Value};
use indexmap::IndexMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SnapshotError {
    #[error("Continuations holding eval frames cannot be detached")]
    EvalFrame,
    #[error("Unknown function '{name}' during reattachment")]
    UnknownFunction { name: String },
    #[error("Malformed continuation graph: {message}")]
    Malformed { message: String },
}

/// A value in the detached graph. Reference values are indices into the
/// pools of `SerializedContinuation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SValue {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Decimal(String),
    Str(String),
    List(u32),
    Map(u32),
    Instance(u32),
    Function {
        name: String,
        captures: Vec<u32>,
        globals: u32,
    },
    Iter(Box<SIter>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SIter {
    Empty,
    Single(Option<Box<SValue>>),
    ListSrc { list: u32, idx: usize },
    MapSrc { map: u32, idx: usize },
    StrSrc { s: String, pos: usize },
    MapOp {
        inner: Box<SIter>,
        f: Box<SValue>,
        awaiting: bool,
    },
    FilterOp {
        inner: Box<SIter>,
        f: Box<SValue>,
        pending: Option<Box<SValue>>,
        awaiting: bool,
    },
    FlatMapOp {
        inner: Box<SIter>,
        f: Box<SValue>,
        current: Option<Box<SIter>>,
        awaiting: bool,
    },
    SkipOp { inner: Box<SIter>, remaining: usize },
    LimitOp { inner: Box<SIter>, remaining: usize },
    UniqueOp { inner: Box<SIter>, seen: Vec<SValue> },
    ReverseOp {
        inner: Box<SIter>,
        buf: Vec<SValue>,
        drained: bool,
        idx: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SDriveKind {
    Collect { acc: Vec<SValue> },
    Each { f: SValue },
    Reduce { f: SValue, acc: SValue },
    Sum { acc: SValue },
    Avg { acc: SValue, count: i64 },
    Min { best: Option<SValue> },
    Max { best: Option<SValue> },
    Join { sep: String, out: String, first: bool },
    Count { n: i64 },
    Contains { needle: SValue },
    Sort {
        cmp: Option<SValue>,
        items: Vec<SValue>,
        collected: bool,
        sorted: usize,
        j: usize,
        key: Option<SValue>,
    },
    Subst {
        subject: String,
        pattern: String,
        flags: RegexFlags,
        global: bool,
        closure: SValue,
        pos: usize,
        out: String,
        matched: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SDrive {
    pub iter: SIter,
    pub kind: SDriveKind,
    /// 0 = push, otherwise stack slot + 1
    pub dest: u64,
    /// 0 = none, 1 = iter, 2 = kind
    pub awaiting: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SFrame {
    pub function: String,
    pub pc: usize,
    pub locals: Vec<SValue>,
    pub stack: Vec<SValue>,
    pub cells: Vec<u32>,
    /// Map-pool index of this frame's globals
    pub globals: u32,
    pub bound: Vec<bool>,
    pub captures: Vec<SValue>,
    pub regex_sites: Vec<(u32, GlobalMatchState)>,
    pub drive: Option<SDrive>,
}

/// The complete detached form of a suspended script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedContinuation {
    pub lists: Vec<Vec<SValue>>,
    pub maps: Vec<Vec<(String, SValue)>>,
    pub instances: Vec<(String, Vec<(String, SValue)>)>,
    pub cells: Vec<SValue>,
    pub frames: Vec<SFrame>,
}

// ----------------------------------------------------------------------
// Detach
// ----------------------------------------------------------------------

#[derive(Default)]
struct Encoder {
    lists: Vec<Option<Vec<SValue>>>,
    maps: Vec<Option<Vec<(String, SValue)>>>,
    instances: Vec<Option<(String, Vec<(String, SValue)>)>>,
    cells: Vec<Option<SValue>>,
    list_ids: FxHashMap<usize, u32>,
    map_ids: FxHashMap<usize, u32>,
    instance_ids: FxHashMap<usize, u32>,
    cell_ids: FxHashMap<usize, u32>,
}

impl Encoder {
    fn encode(&mut self, value: &Value) -> Result<SValue, SnapshotError> {
        Ok(match value {
            Value::Null => SValue::Null,
            Value::Bool(b) => SValue::Bool(*b),
            Value::Int(n) => SValue::Int(*n),
            Value::Long(n) => SValue::Long(*n),
            Value::Double(n) => SValue::Double(*n),
            Value::Decimal(d) => SValue::Decimal(d.to_string()),
            Value::Str(s) => SValue::Str(s.to_string()),
            Value::List(list) => SValue::List(self.encode_list(list)?),
            Value::Map(map) => SValue::Map(self.encode_map(map)?),
            Value::Instance(instance) => SValue::Instance(self.encode_instance(instance)?),
            Value::Function(f) => self.encode_function(f)?,
            Value::Iter(state) => {
                let node = state.lock().node.clone();
                SValue::Iter(Box::new(self.encode_iter(&node)?))
            }
        })
    }

    fn encode_list(
        &mut self,
        list: &crate::vm::value::ListRef,
    ) -> Result<u32, SnapshotError> {
        let key = Arc::as_ptr(list) as usize;
        if let Some(&id) = self.list_ids.get(&key) {
            return Ok(id);
        }
        // Register before recursing so cyclic data terminates
        let id = self.lists.len() as u32;
        self.list_ids.insert(key, id);
        self.lists.push(None);
        let items = list.lock().clone();
        let encoded = items
            .iter()
            .map(|v| self.encode(v))
            .collect::<Result<Vec<_>, _>>()?;
        self.lists[id as usize] = Some(encoded);
        Ok(id)
    }

    fn encode_map(&mut self, map: &crate::vm::value::MapRef) -> Result<u32, SnapshotError> {
        let key = Arc::as_ptr(map) as usize;
        if let Some(&id) = self.map_ids.get(&key) {
            return Ok(id);
        }
        let id = self.maps.len() as u32;
        self.map_ids.insert(key, id);
        self.maps.push(None);
        let entries = map.lock().clone();
        let mut encoded = Vec::with_capacity(entries.len());
        for (k, v) in entries.iter() {
            encoded.push((k.clone(), self.encode(v)?));
        }
        self.maps[id as usize] = Some(encoded);
        Ok(id)
    }

    fn encode_instance(
        &mut self,
        instance: &crate::vm::value::InstanceRef,
    ) -> Result<u32, SnapshotError> {
        let key = Arc::as_ptr(instance) as usize;
        if let Some(&id) = self.instance_ids.get(&key) {
            return Ok(id);
        }
        let id = self.instances.len() as u32;
        self.instance_ids.insert(key, id);
        self.instances.push(None);
        let (class_name, fields) = {
            let guard = instance.lock();
            (guard.class_name.to_string(), guard.fields.clone())
        };
        let mut encoded = Vec::with_capacity(fields.len());
        for (k, v) in fields.iter() {
            encoded.push((k.clone(), self.encode(v)?));
        }
        self.instances[id as usize] = Some((class_name, encoded));
        Ok(id)
    }

    fn encode_cell(&mut self, cell: &HeapCell) -> Result<u32, SnapshotError> {
        let key = cell.id();
        if let Some(&id) = self.cell_ids.get(&key) {
            return Ok(id);
        }
        let id = self.cells.len() as u32;
        self.cell_ids.insert(key, id);
        self.cells.push(None);
        let encoded = self.encode(&cell.get())?;
        self.cells[id as usize] = Some(encoded);
        Ok(id)
    }

    fn encode_function(&mut self, f: &FunctionValue) -> Result<SValue, SnapshotError> {
        let captures = f
            .captures
            .iter()
            .map(|c| self.encode_cell(c))
            .collect::<Result<Vec<_>, _>>()?;
        let globals = self.encode_map(&f.globals)?;
        Ok(SValue::Function {
            name: f.name.to_string(),
            captures,
            globals,
        })
    }

    fn encode_iter(&mut self, node: &IterNode) -> Result<SIter, SnapshotError> {
        Ok(match node {
            IterNode::Empty => SIter::Empty,
            IterNode::Single(v) => SIter::Single(match v {
                Some(v) => Some(Box::new(self.encode(v)?)),
                None => None,
            }),
            IterNode::ListSrc { list, idx } => SIter::ListSrc {
                list: self.encode_list(list)?,
                idx: *idx,
            },
            IterNode::MapSrc { map, idx } => SIter::MapSrc {
                map: self.encode_map(map)?,
                idx: *idx,
            },
            IterNode::StrSrc { s, pos } => SIter::StrSrc {
                s: s.to_string(),
                pos: *pos,
            },
            IterNode::MapOp { inner, f, awaiting } => SIter::MapOp {
                inner: Box::new(self.encode_iter(inner)?),
                f: Box::new(self.encode(f)?),
                awaiting: *awaiting,
            },
            IterNode::FilterOp {
                inner,
                f,
                pending,
                awaiting,
            } => SIter::FilterOp {
                inner: Box::new(self.encode_iter(inner)?),
                f: Box::new(self.encode(f)?),
                pending: match pending {
                    Some(v) => Some(Box::new(self.encode(v)?)),
                    None => None,
                },
                awaiting: *awaiting,
            },
            IterNode::FlatMapOp {
                inner,
                f,
                current,
                awaiting,
            } => SIter::FlatMapOp {
                inner: Box::new(self.encode_iter(inner)?),
                f: Box::new(self.encode(f)?),
                current: match current {
                    Some(node) => Some(Box::new(self.encode_iter(node)?)),
                    None => None,
                },
                awaiting: *awaiting,
            },
            IterNode::SkipOp { inner, remaining } => SIter::SkipOp {
                inner: Box::new(self.encode_iter(inner)?),
                remaining: *remaining,
            },
            IterNode::LimitOp { inner, remaining } => SIter::LimitOp {
                inner: Box::new(self.encode_iter(inner)?),
                remaining: *remaining,
            },
            IterNode::UniqueOp { inner, seen } => SIter::UniqueOp {
                inner: Box::new(self.encode_iter(inner)?),
                seen: seen
                    .iter()
                    .map(|v| self.encode(v))
                    .collect::<Result<Vec<_>, _>>()?,
            },
            IterNode::ReverseOp {
                inner,
                buf,
                drained,
                idx,
            } => SIter::ReverseOp {
                inner: Box::new(self.encode_iter(inner)?),
                buf: buf
                    .iter()
                    .map(|v| self.encode(v))
                    .collect::<Result<Vec<_>, _>>()?,
                drained: *drained,
                idx: *idx,
            },
        })
    }

    fn encode_drive(&mut self, drive: &DriveState) -> Result<SDrive, SnapshotError> {
        let kind = match &drive.kind {
            DriveKind::Collect { acc } => SDriveKind::Collect {
                acc: self.encode_all(acc)?,
            },
            DriveKind::Each { f } => SDriveKind::Each {
                f: self.encode(f)?,
            },
            DriveKind::Reduce { f, acc } => SDriveKind::Reduce {
                f: self.encode(f)?,
                acc: self.encode(acc)?,
            },
            DriveKind::Sum { acc } => SDriveKind::Sum {
                acc: self.encode(acc)?,
            },
            DriveKind::Avg { acc, count } => SDriveKind::Avg {
                acc: self.encode(acc)?,
                count: *count,
            },
            DriveKind::Min { best } => SDriveKind::Min {
                best: best.as_ref().map(|v| self.encode(v)).transpose()?,
            },
            DriveKind::Max { best } => SDriveKind::Max {
                best: best.as_ref().map(|v| self.encode(v)).transpose()?,
            },
            DriveKind::Join { sep, out, first } => SDriveKind::Join {
                sep: sep.clone(),
                out: out.clone(),
                first: *first,
            },
            DriveKind::Count { n } => SDriveKind::Count { n: *n },
            DriveKind::Contains { needle } => SDriveKind::Contains {
                needle: self.encode(needle)?,
            },
            DriveKind::Sort(sort) => SDriveKind::Sort {
                cmp: sort.cmp.as_ref().map(|v| self.encode(v)).transpose()?,
                items: self.encode_all(&sort.items)?,
                collected: sort.collected,
                sorted: sort.sorted,
                j: sort.j,
                key: sort.key.as_ref().map(|v| self.encode(v)).transpose()?,
            },
            DriveKind::Subst(subst) => SDriveKind::Subst {
                subject: subst.subject.clone(),
                pattern: subst.pattern.clone(),
                flags: subst.flags,
                global: subst.global,
                closure: self.encode(&subst.closure)?,
                pos: subst.pos,
                out: subst.out.clone(),
                matched: subst.matched,
            },
        };
        Ok(SDrive {
            iter: self.encode_iter(&drive.iter)?,
            kind,
            dest: match drive.dest {
                DriveDest::Push => 0,
                DriveDest::StackSlot(slot) => slot as u64 + 1,
            },
            awaiting: match drive.awaiting {
                Awaiting::None => 0,
                Awaiting::Iter => 1,
                Awaiting::Kind => 2,
            },
        })
    }

    fn encode_all(&mut self, values: &[Value]) -> Result<Vec<SValue>, SnapshotError> {
        values.iter().map(|v| self.encode(v)).collect()
    }
}

impl Continuation {
    /// Detach into a serializable value graph. Fails when the
    /// continuation holds frames of `eval`-compiled code, whose units
    /// have no stable identity in the root program.
    pub fn detach(&self) -> Result<SerializedContinuation, SnapshotError> {
        let mut enc = Encoder::default();
        let mut frames = Vec::with_capacity(self.frames.len());
        for frame in &self.frames {
            if frame.unit.origin == Origin::Eval {
                return Err(SnapshotError::EvalFrame);
            }
            let drive = match &frame.drive {
                Some(d) => Some(enc.encode_drive(d)?),
                None => None,
            };
            frames.push(SFrame {
                function: frame.unit.name.clone(),
                pc: frame.pc,
                locals: enc.encode_all(&frame.locals)?,
                stack: enc.encode_all(&frame.stack)?,
                cells: frame
                    .cells
                    .iter()
                    .map(|c| enc.encode_cell(c))
                    .collect::<Result<Vec<_>, _>>()?,
                globals: enc.encode_map(&frame.globals)?,
                bound: frame.bound.clone(),
                captures: enc.encode_all(&frame.captures)?,
                regex_sites: frame
                    .regex_sites
                    .iter()
                    .map(|(&k, v)| (k, v.clone()))
                    .collect(),
                drive,
            });
        }
        Ok(SerializedContinuation {
            lists: enc.lists.into_iter().map(|l| l.unwrap_or_default()).collect(),
            maps: enc.maps.into_iter().map(|m| m.unwrap_or_default()).collect(),
            instances: enc
                .instances
                .into_iter()
                .map(|i| i.unwrap_or_default())
                .collect(),
            cells: enc.cells.into_iter().map(|c| c.unwrap_or(SValue::Null)).collect(),
            frames,
        })
    }
}

// ----------------------------------------------------------------------
// Attach
// ----------------------------------------------------------------------

struct Decoder<'a> {
    program: &'a Program,
    lists: Vec<crate::vm::value::ListRef>,
    maps: Vec<crate::vm::value::MapRef>,
    instances: Vec<crate::vm::value::InstanceRef>,
    cells: Vec<HeapCell>,
}

impl<'a> Decoder<'a> {
    fn pool_map(&self, id: u32) -> Result<Globals, SnapshotError> {
        self.maps
            .get(id as usize)
            .cloned()
            .ok_or_else(|| SnapshotError::Malformed {
                message: format!("map reference {} out of range", id),
            })
    }

    fn pool_cell(&self, id: u32) -> Result<HeapCell, SnapshotError> {
        self.cells
            .get(id as usize)
            .cloned()
            .ok_or_else(|| SnapshotError::Malformed {
                message: format!("cell reference {} out of range", id),
            })
    }

    fn decode(&self, value: &SValue) -> Result<Value, SnapshotError> {
        Ok(match value {
            SValue::Null => Value::Null,
            SValue::Bool(b) => Value::Bool(*b),
            SValue::Int(n) => Value::Int(*n),
            SValue::Long(n) => Value::Long(*n),
            SValue::Double(n) => Value::Double(*n),
            SValue::Decimal(text) => {
                let d = text.parse().map_err(|_| SnapshotError::Malformed {
                    message: format!("invalid decimal '{}'", text),
                })?;
                Value::decimal(d)
            }
            SValue::Str(s) => Value::string(s.clone()),
            SValue::List(id) => Value::List(
                self.lists
                    .get(*id as usize)
                    .cloned()
                    .ok_or_else(|| SnapshotError::Malformed {
                        message: format!("list reference {} out of range", id),
                    })?,
            ),
            SValue::Map(id) => Value::Map(self.pool_map(*id)?),
            SValue::Instance(id) => Value::Instance(
                self.instances
                    .get(*id as usize)
                    .cloned()
                    .ok_or_else(|| SnapshotError::Malformed {
                        message: format!("instance reference {} out of range", id),
                    })?,
            ),
            SValue::Function {
                name,
                captures,
                globals,
            } => {
                let unit = self
                    .program
                    .unit_by_name(name)
                    .ok_or_else(|| SnapshotError::UnknownFunction { name: name.clone() })?;
                let wrapper = unit.wrapper.map(|w| self.program.unit(w));
                let captures = captures
                    .iter()
                    .map(|&id| self.pool_cell(id))
                    .collect::<Result<Vec<_>, _>>()?;
                Value::Function(Arc::new(FunctionValue {
                    name: Arc::from(name.as_str()),
                    unit,
                    wrapper,
                    captures,
                    globals: self.pool_map(*globals)?,
                }))
            }
            SValue::Iter(node) => {
                let node = self.decode_iter(node)?;
                Value::Iter(Arc::new(Mutex::new(IterState::new(node))))
            }
        })
    }

    fn decode_all(&self, values: &[SValue]) -> Result<Vec<Value>, SnapshotError> {
        values.iter().map(|v| self.decode(v)).collect()
    }

    fn decode_iter(&self, node: &SIter) -> Result<IterNode, SnapshotError> {
        Ok(match node {
            SIter::Empty => IterNode::Empty,
            SIter::Single(v) => IterNode::Single(match v {
                Some(v) => Some(self.decode(v)?),
                None => None,
            }),
            SIter::ListSrc { list, idx } => IterNode::ListSrc {
                list: self
                    .lists
                    .get(*list as usize)
                    .cloned()
                    .ok_or_else(|| SnapshotError::Malformed {
                        message: format!("list reference {} out of range", list),
                    })?,
                idx: *idx,
            },
            SIter::MapSrc { map, idx } => IterNode::MapSrc {
                map: self.pool_map(*map)?,
                idx: *idx,
            },
            SIter::StrSrc { s, pos } => IterNode::StrSrc {
                s: Arc::from(s.as_str()),
                pos: *pos,
            },
            SIter::MapOp { inner, f, awaiting } => IterNode::MapOp {
                inner: Box::new(self.decode_iter(inner)?),
                f: self.decode(f)?,
                awaiting: *awaiting,
            },
            SIter::FilterOp {
                inner,
                f,
                pending,
                awaiting,
            } => IterNode::FilterOp {
                inner: Box::new(self.decode_iter(inner)?),
                f: self.decode(f)?,
                pending: match pending {
                    Some(v) => Some(self.decode(v)?),
                    None => None,
                },
                awaiting: *awaiting,
            },
            SIter::FlatMapOp {
                inner,
                f,
                current,
                awaiting,
            } => IterNode::FlatMapOp {
                inner: Box::new(self.decode_iter(inner)?),
                f: self.decode(f)?,
                current: match current {
                    Some(node) => Some(Box::new(self.decode_iter(node)?)),
                    None => None,
                },
                awaiting: *awaiting,
            },
            SIter::SkipOp { inner, remaining } => IterNode::SkipOp {
                inner: Box::new(self.decode_iter(inner)?),
                remaining: *remaining,
            },
            SIter::LimitOp { inner, remaining } => IterNode::LimitOp {
                inner: Box::new(self.decode_iter(inner)?),
                remaining: *remaining,
            },
            SIter::UniqueOp { inner, seen } => IterNode::UniqueOp {
                inner: Box::new(self.decode_iter(inner)?),
                seen: self.decode_all(seen)?,
            },
            SIter::ReverseOp {
                inner,
                buf,
                drained,
                idx,
            } => IterNode::ReverseOp {
                inner: Box::new(self.decode_iter(inner)?),
                buf: self.decode_all(buf)?,
                drained: *drained,
                idx: *idx,
            },
        })
    }

    fn decode_drive(&self, drive: &SDrive) -> Result<DriveState, SnapshotError> {
        let kind = match &drive.kind {
            SDriveKind::Collect { acc } => DriveKind::Collect {
                acc: self.decode_all(acc)?,
            },
            SDriveKind::Each { f } => DriveKind::Each {
                f: self.decode(f)?,
            },
            SDriveKind::Reduce { f, acc } => DriveKind::Reduce {
                f: self.decode(f)?,
                acc: self.decode(acc)?,
            },
            SDriveKind::Sum { acc } => DriveKind::Sum {
                acc: self.decode(acc)?,
            },
            SDriveKind::Avg { acc, count } => DriveKind::Avg {
                acc: self.decode(acc)?,
                count: *count,
            },
            SDriveKind::Min { best } => DriveKind::Min {
                best: best.as_ref().map(|v| self.decode(v)).transpose()?,
            },
            SDriveKind::Max { best } => DriveKind::Max {
                best: best.as_ref().map(|v| self.decode(v)).transpose()?,
            },
            SDriveKind::Join { sep, out, first } => DriveKind::Join {
                sep: sep.clone(),
                out: out.clone(),
                first: *first,
            },
            SDriveKind::Count { n } => DriveKind::Count { n: *n },
            SDriveKind::Contains { needle } => DriveKind::Contains {
                needle: self.decode(needle)?,
            },
            SDriveKind::Sort {
                cmp,
                items,
                collected,
                sorted,
                j,
                key,
            } => DriveKind::Sort(SortState {
                cmp: cmp.as_ref().map(|v| self.decode(v)).transpose()?,
                items: self.decode_all(items)?,
                collected: *collected,
                sorted: *sorted,
                j: *j,
                key: key.as_ref().map(|v| self.decode(v)).transpose()?,
            }),
            SDriveKind::Subst {
                subject,
                pattern,
                flags,
                global,
                closure,
                pos,
                out,
                matched,
            } => {
                let mut state = SubstState::new(
                    subject.clone(),
                    pattern.clone(),
                    *flags,
                    *global,
                    self.decode(closure)?,
                );
                state.pos = *pos;
                state.out = out.clone();
                state.matched = *matched;
                DriveKind::Subst(state)
            }
        };
        let mut decoded = DriveState::new(
            self.decode_iter(&drive.iter)?,
            kind,
            match drive.dest {
                0 => DriveDest::Push,
                slot => DriveDest::StackSlot(slot as usize - 1),
            },
        );
        decoded.awaiting = match drive.awaiting {
            1 => Awaiting::Iter,
            2 => Awaiting::Kind,
            _ => Awaiting::None,
        };
        Ok(decoded)
    }
}

impl SerializedContinuation {
    /// Reattach against a compiled program. Function identities resolve
    /// by stable name; an unknown name means the program does not match
    /// the one that produced this continuation.
    pub fn attach(&self, program: &Program) -> Result<Continuation, SnapshotError> {
        // Pre-create the shared pools so cyclic data can reference them
        // while being filled
        let decoder = Decoder {
            program,
            lists: (0..self.lists.len())
                .map(|_| Arc::new(Mutex::new(Vec::new())))
                .collect(),
            maps: (0..self.maps.len())
                .map(|_| Arc::new(Mutex::new(IndexMap::new())))
                .collect(),
            instances: (0..self.instances.len())
                .map(|_| {
                    Arc::new(Mutex::new(Instance {
                        class_id: 0,
                        class_name: Arc::from(""),
                        fields: IndexMap::new(),
                    }))
                })
                .collect(),
            cells: (0..self.cells.len())
                .map(|_| HeapCell::new(Value::Null))
                .collect(),
        };

        for (id, items) in self.lists.iter().enumerate() {
            let decoded = decoder.decode_all(items)?;
            *decoder.lists[id].lock() = decoded;
        }
        for (id, entries) in self.maps.iter().enumerate() {
            let mut decoded = IndexMap::new();
            for (k, v) in entries {
                decoded.insert(k.clone(), decoder.decode(v)?);
            }
            *decoder.maps[id].lock() = decoded;
        }
        for (id, (class_name, fields)) in self.instances.iter().enumerate() {
            let class_id = program
                .classes
                .iter()
                .position(|c| c.name.as_ref() == class_name)
                .ok_or_else(|| SnapshotError::Malformed {
                    message: format!("unknown class '{}'", class_name),
                })?;
            let mut decoded = IndexMap::new();
            for (k, v) in fields {
                decoded.insert(k.clone(), decoder.decode(v)?);
            }
            let mut guard = decoder.instances[id].lock();
            guard.class_id = class_id;
            guard.class_name = Arc::clone(&program.classes[class_id].name);
            guard.fields = decoded;
        }
        for (id, value) in self.cells.iter().enumerate() {
            decoder.cells[id].set(decoder.decode(value)?);
        }

        let mut frames = Vec::with_capacity(self.frames.len());
        for sframe in &self.frames {
            let unit = program
                .unit_by_name(&sframe.function)
                .ok_or_else(|| SnapshotError::UnknownFunction {
                    name: sframe.function.clone(),
                })?;
            let drive = match &sframe.drive {
                Some(d) => Some(decoder.decode_drive(d)?),
                None => None,
            };
            frames.push(Frame {
                unit,
                pc: sframe.pc,
                locals: decoder.decode_all(&sframe.locals)?,
                stack: decoder.decode_all(&sframe.stack)?,
                cells: sframe
                    .cells
                    .iter()
                    .map(|&id| decoder.pool_cell(id))
                    .collect::<Result<Vec<_>, _>>()?,
                globals: decoder.pool_map(sframe.globals)?,
                bound: sframe.bound.clone(),
                captures: decoder.decode_all(&sframe.captures)?,
                regex_sites: sframe.regex_sites.iter().cloned().collect(),
                drive,
            });
        }
        Ok(Continuation { frames })
    }
}
