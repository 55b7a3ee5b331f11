//! Built-in methods on values
//!
//! Collection, string, and numeric methods dispatched by name at
//! runtime. Lazy methods (`map`, `filter`, ...) build iterator chains
//! without running script code; terminal methods that may call closures
//! return a `DriveState` for the VM to step.

use crate::error::{RuntimeError, RuntimeErrorKind};
use crate::vm::iter::{
    iter_value, source_node, DriveDest, DriveKind, DriveState, IterNode, SortState,
};
use crate::vm::regexes;
use crate::vm::value::Value;
use once_cell::sync::Lazy;
use rustc_hash::FxHashSet;

/// Result of a builtin dispatch.
pub enum BuiltinResult {
    Value(Value),
    Drive(DriveState),
    Error(RuntimeError),
}

static METHOD_NAMES: Lazy<FxHashSet<&'static str>> = Lazy::new(|| {
    [
        "size", "length", "map", "filter", "flatMap", "each", "collect", "reduce", "sum",
        "avg", "min", "max", "join", "sort", "reverse", "unique", "skip", "limit",
        "contains", "containsKey", "add", "addAt", "remove", "subList", "toString",
        "toUpperCase", "toLowerCase", "substring", "split", "lines", "words", "trim", "indexOf",
        "charAt", "asNum", "repeat", "abs", "sqr", "sqrt", "pow", "toBase", "asChar",
    ]
    .into_iter()
    .collect()
});

/// Known builtin method names (the resolver checks statically typed
/// receivers against this).
pub fn method_exists(name: &str) -> bool {
    METHOD_NAMES.contains(name)
}

fn invalid(message: impl Into<String>) -> BuiltinResult {
    BuiltinResult::Error(RuntimeError::new(RuntimeErrorKind::InvalidArguments {
        message: message.into(),
    }))
}

fn arg_closure(args: &[Value], idx: usize, method: &str) -> Result<Value, RuntimeError> {
    match args.get(idx) {
        Some(f @ Value::Function(_)) => Ok(f.clone()),
        _ => Err(RuntimeError::new(RuntimeErrorKind::InvalidArguments {
            message: format!("'{}' expects a closure argument", method),
        })),
    }
}

fn arg_int(args: &[Value], idx: usize, method: &str) -> Result<i64, RuntimeError> {
    args.get(idx).and_then(|v| v.to_i64()).ok_or_else(|| {
        RuntimeError::new(RuntimeErrorKind::InvalidArguments {
            message: format!("'{}' expects an integer argument", method),
        })
    })
}

fn drive(node: IterNode, kind: DriveKind) -> BuiltinResult {
    BuiltinResult::Drive(DriveState::new(node, kind, DriveDest::Push))
}

/// Dispatch a builtin method; `None` means no such builtin for this
/// receiver.
pub fn invoke(target: &Value, name: &str, args: &[Value]) -> Option<BuiltinResult> {
    // Methods on any value
    if name == "toString" {
        return Some(BuiltinResult::Value(Value::string(target.display())));
    }

    // Lazy chain constructors and closure-driven terminals work on any
    // iterable receiver
    if let Some(node) = source_node(target) {
        match name {
            "map" => {
                return Some(match arg_closure(args, 0, name) {
                    Ok(f) => BuiltinResult::Value(iter_value(IterNode::MapOp {
                        inner: Box::new(node),
                        f,
                        awaiting: false,
                    })),
                    Err(e) => BuiltinResult::Error(e),
                });
            }
            "filter" => {
                return Some(match arg_closure(args, 0, name) {
                    Ok(f) => BuiltinResult::Value(iter_value(IterNode::FilterOp {
                        inner: Box::new(node),
                        f,
                        pending: None,
                        awaiting: false,
                    })),
                    Err(e) => BuiltinResult::Error(e),
                });
            }
            "flatMap" => {
                return Some(match arg_closure(args, 0, name) {
                    Ok(f) => BuiltinResult::Value(iter_value(IterNode::FlatMapOp {
                        inner: Box::new(node),
                        f,
                        current: None,
                        awaiting: false,
                    })),
                    Err(e) => BuiltinResult::Error(e),
                });
            }
            "skip" => {
                return Some(match arg_int(args, 0, name) {
                    Ok(n) => BuiltinResult::Value(iter_value(IterNode::SkipOp {
                        inner: Box::new(node),
                        remaining: n.max(0) as usize,
                    })),
                    Err(e) => BuiltinResult::Error(e),
                });
            }
            "limit" => {
                return Some(match arg_int(args, 0, name) {
                    Ok(n) => BuiltinResult::Value(iter_value(IterNode::LimitOp {
                        inner: Box::new(node),
                        remaining: n.max(0) as usize,
                    })),
                    Err(e) => BuiltinResult::Error(e),
                });
            }
            "unique" => {
                return Some(BuiltinResult::Value(iter_value(IterNode::UniqueOp {
                    inner: Box::new(node),
                    seen: Vec::new(),
                })));
            }
            "reverse" => {
                return Some(BuiltinResult::Value(iter_value(IterNode::ReverseOp {
                    inner: Box::new(node),
                    buf: Vec::new(),
                    drained: false,
                    idx: 0,
                })));
            }
            "each" => {
                return Some(match arg_closure(args, 0, name) {
                    Ok(f) => drive(node, DriveKind::Each { f }),
                    Err(e) => BuiltinResult::Error(e),
                });
            }
            "reduce" => {
                let init = args.first().cloned().unwrap_or(Value::Null);
                return Some(match arg_closure(args, 1, name) {
                    Ok(f) => drive(node, DriveKind::Reduce { f, acc: init }),
                    Err(e) => BuiltinResult::Error(e),
                });
            }
            "collect" => {
                return Some(drive(node, DriveKind::Collect { acc: Vec::new() }));
            }
            "sum" => {
                return Some(drive(node, DriveKind::Sum { acc: Value::Int(0) }));
            }
            "avg" => {
                return Some(drive(
                    node,
                    DriveKind::Avg {
                        acc: Value::Int(0),
                        count: 0,
                    },
                ));
            }
            "min" => return Some(drive(node, DriveKind::Min { best: None })),
            "max" => return Some(drive(node, DriveKind::Max { best: None })),
            "join" => {
                let sep = args.first().map(|v| v.display()).unwrap_or_default();
                return Some(drive(
                    node,
                    DriveKind::Join {
                        sep,
                        out: String::new(),
                        first: true,
                    },
                ));
            }
            "sort" => {
                let cmp = match args.first() {
                    Some(f @ Value::Function(_)) => Some(f.clone()),
                    Some(_) => return Some(invalid("'sort' expects a comparator closure")),
                    None => None,
                };
                return Some(drive(
                    node,
                    DriveKind::Sort(SortState {
                        cmp,
                        items: Vec::new(),
                        collected: false,
                        sorted: 0,
                        j: 0,
                        key: None,
                    }),
                ));
            }
            "size" | "length" if matches!(target, Value::Iter(_)) => {
                return Some(drive(node, DriveKind::Count { n: 0 }));
            }
            "contains" if matches!(target, Value::Iter(_)) => {
                let needle = args.first().cloned().unwrap_or(Value::Null);
                return Some(drive(node, DriveKind::Contains { needle }));
            }
            _ => {}
        }
    }

    match target {
        Value::List(list) => match name {
            "size" | "length" => Some(BuiltinResult::Value(Value::Int(list.lock().len() as i32))),
            "contains" => {
                let needle = args.first().cloned().unwrap_or(Value::Null);
                let found = list.lock().iter().any(|v| v.equals(&needle));
                Some(BuiltinResult::Value(Value::Bool(found)))
            }
            "add" => {
                let value = args.first().cloned().unwrap_or(Value::Null);
                list.lock().push(value);
                Some(BuiltinResult::Value(target.clone()))
            }
            "addAt" => {
                let idx = match arg_int(args, 0, name) {
                    Ok(n) => n,
                    Err(e) => return Some(BuiltinResult::Error(e)),
                };
                let value = args.get(1).cloned().unwrap_or(Value::Null);
                let mut guard = list.lock();
                let idx = (idx.max(0) as usize).min(guard.len());
                guard.insert(idx, value);
                drop(guard);
                Some(BuiltinResult::Value(target.clone()))
            }
            "remove" => {
                let idx = match arg_int(args, 0, name) {
                    Ok(n) => n,
                    Err(e) => return Some(BuiltinResult::Error(e)),
                };
                let mut guard = list.lock();
                if idx < 0 || idx as usize >= guard.len() {
                    return Some(BuiltinResult::Error(RuntimeError::new(
                        RuntimeErrorKind::IndexOutOfBounds {
                            index: idx,
                            size: guard.len(),
                        },
                    )));
                }
                let removed = guard.remove(idx as usize);
                Some(BuiltinResult::Value(removed))
            }
            "subList" => {
                let from = match arg_int(args, 0, name) {
                    Ok(n) => n.max(0) as usize,
                    Err(e) => return Some(BuiltinResult::Error(e)),
                };
                let guard = list.lock();
                let to = args
                    .get(1)
                    .and_then(|v| v.to_i64())
                    .map(|n| n.max(0) as usize)
                    .unwrap_or(guard.len())
                    .min(guard.len());
                let from = from.min(to);
                Some(BuiltinResult::Value(Value::list(guard[from..to].to_vec())))
            }
            _ => None,
        },
        Value::Map(map) => match name {
            "size" | "length" => Some(BuiltinResult::Value(Value::Int(map.lock().len() as i32))),
            "containsKey" => {
                let key = args.first().map(|v| v.display()).unwrap_or_default();
                Some(BuiltinResult::Value(Value::Bool(
                    map.lock().contains_key(&key),
                )))
            }
            "remove" => {
                let key = args.first().map(|v| v.display()).unwrap_or_default();
                let removed = map.lock().shift_remove(&key).unwrap_or(Value::Null);
                Some(BuiltinResult::Value(removed))
            }
            _ => None,
        },
        Value::Str(s) => match name {
            "size" | "length" => {
                Some(BuiltinResult::Value(Value::Int(s.chars().count() as i32)))
            }
            "toUpperCase" => Some(BuiltinResult::Value(Value::string(s.to_uppercase()))),
            "toLowerCase" => Some(BuiltinResult::Value(Value::string(s.to_lowercase()))),
            "trim" => Some(BuiltinResult::Value(Value::string(s.trim()))),
            "substring" => {
                let from = match arg_int(args, 0, name) {
                    Ok(n) => n.max(0) as usize,
                    Err(e) => return Some(BuiltinResult::Error(e)),
                };
                let chars: Vec<char> = s.chars().collect();
                let to = args
                    .get(1)
                    .and_then(|v| v.to_i64())
                    .map(|n| n.max(0) as usize)
                    .unwrap_or(chars.len())
                    .min(chars.len());
                let from = from.min(to);
                Some(BuiltinResult::Value(Value::string(
                    chars[from..to].iter().collect::<String>(),
                )))
            }
            "split" => {
                let Some(pattern) = args.first() else {
                    return Some(invalid("'split' expects a pattern argument"));
                };
                let pattern = pattern.display();
                match regexes::build_regex(&pattern, Default::default()) {
                    Ok(re) => {
                        let parts = re
                            .split(s.as_ref())
                            .map(Value::string)
                            .collect::<Vec<_>>();
                        Some(BuiltinResult::Value(Value::list(parts)))
                    }
                    Err(e) => Some(BuiltinResult::Error(e)),
                }
            }
            "lines" => Some(BuiltinResult::Value(Value::list(
                s.lines().map(Value::string).collect(),
            ))),
            "words" => Some(BuiltinResult::Value(Value::list(
                s.split_whitespace().map(Value::string).collect(),
            ))),
            "contains" => {
                let needle = args.first().map(|v| v.display()).unwrap_or_default();
                Some(BuiltinResult::Value(Value::Bool(s.contains(&needle))))
            }
            "indexOf" => {
                let needle = args.first().map(|v| v.display()).unwrap_or_default();
                let idx = match s.find(&needle) {
                    Some(byte_idx) => s[..byte_idx].chars().count() as i32,
                    None => -1,
                };
                Some(BuiltinResult::Value(Value::Int(idx)))
            }
            "charAt" => {
                let idx = match arg_int(args, 0, name) {
                    Ok(n) => n,
                    Err(e) => return Some(BuiltinResult::Error(e)),
                };
                match s.chars().nth(idx.max(0) as usize) {
                    Some(c) => Some(BuiltinResult::Value(Value::string(c.to_string()))),
                    None => Some(BuiltinResult::Error(RuntimeError::new(
                        RuntimeErrorKind::IndexOutOfBounds {
                            index: idx,
                            size: s.chars().count(),
                        },
                    ))),
                }
            }
            "asNum" => {
                let base = args.first().and_then(|v| v.to_i64()).unwrap_or(10);
                match i64::from_str_radix(s.trim(), base.clamp(2, 36) as u32) {
                    Ok(n) if n >= i64::from(i32::MIN) && n <= i64::from(i32::MAX) => {
                        Some(BuiltinResult::Value(Value::Int(n as i32)))
                    }
                    Ok(n) => Some(BuiltinResult::Value(Value::Long(n))),
                    Err(_) => Some(BuiltinResult::Error(RuntimeError::new(
                        RuntimeErrorKind::ConversionFailure {
                            from: format!("'{}'", s),
                            to: "number".to_string(),
                        },
                    ))),
                }
            }
            "repeat" => {
                let n = match arg_int(args, 0, name) {
                    Ok(n) => n,
                    Err(e) => return Some(BuiltinResult::Error(e)),
                };
                Some(BuiltinResult::Value(Value::string(
                    s.repeat(n.max(0) as usize),
                )))
            }
            _ => None,
        },
        v if v.is_number() => numeric_method(v, name, args),
        _ => None,
    }
}

fn numeric_method(v: &Value, name: &str, args: &[Value]) -> Option<BuiltinResult> {
    match name {
        "abs" => Some(BuiltinResult::Value(match v {
            Value::Int(n) => Value::Int(n.wrapping_abs()),
            Value::Long(n) => Value::Long(n.wrapping_abs()),
            Value::Double(n) => Value::Double(n.abs()),
            Value::Decimal(d) => Value::decimal(bigdecimal::Signed::abs(d.as_ref())),
            _ => return None,
        })),
        "sqr" => {
            let result = crate::vm::arith::binary(
                crate::parser::ast::BinOp::Mul,
                v.clone(),
                v.clone(),
                20,
            );
            Some(match result {
                Ok(value) => BuiltinResult::Value(value),
                Err(e) => BuiltinResult::Error(e),
            })
        }
        "sqrt" => {
            let n = v.to_f64()?;
            if n < 0.0 {
                return Some(invalid("'sqrt' of a negative number"));
            }
            Some(BuiltinResult::Value(Value::Double(n.sqrt())))
        }
        "pow" => {
            let exp = args.first().and_then(|a| a.to_f64()).unwrap_or(0.0);
            let base = v.to_f64()?;
            Some(BuiltinResult::Value(Value::Double(base.powf(exp))))
        }
        "toBase" => {
            let base = args.first().and_then(|a| a.to_i64()).unwrap_or(10);
            let n = v.to_i64()?;
            Some(BuiltinResult::Value(Value::string(to_base(
                n,
                base.clamp(2, 36) as u32,
            ))))
        }
        "asChar" => {
            let n = v.to_i64()?;
            match u32::try_from(n).ok().and_then(char::from_u32) {
                Some(c) => Some(BuiltinResult::Value(Value::string(c.to_string()))),
                None => Some(invalid(format!("{} is not a valid character code", n))),
            }
        }
        _ => None,
    }
}

fn to_base(n: i64, base: u32) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let negative = n < 0;
    let mut digits = Vec::new();
    let mut m = (n as i128).unsigned_abs();
    while m > 0 {
        let d = (m % u128::from(base)) as u32;
        digits.push(char::from_digit(d, base).unwrap_or('?'));
        m /= u128::from(base);
    }
    if negative {
        digits.push('-');
    }
    digits.iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_exists() {
        assert!(method_exists("map"));
        assert!(method_exists("collect"));
        assert!(method_exists("substring"));
        assert!(!method_exists("frobnicate"));
    }

    #[test]
    fn test_list_size() {
        let list = Value::list(vec![Value::Int(1), Value::Int(2)]);
        match invoke(&list, "size", &[]).unwrap() {
            BuiltinResult::Value(v) => assert_eq!(v, Value::Int(2)),
            _ => panic!("expected value"),
        }
    }

    #[test]
    fn test_string_methods() {
        let s = Value::string("Hello World");
        match invoke(&s, "toUpperCase", &[]).unwrap() {
            BuiltinResult::Value(v) => assert_eq!(v.display(), "HELLO WORLD"),
            _ => panic!("expected value"),
        }
        match invoke(&s, "indexOf", &[Value::string("World")]).unwrap() {
            BuiltinResult::Value(v) => assert_eq!(v, Value::Int(6)),
            _ => panic!("expected value"),
        }
    }

    #[test]
    fn test_lazy_map_builds_iterator() {
        let list = Value::list(vec![Value::Int(1)]);
        // A closure value is required; a non-function argument errors
        match invoke(&list, "map", &[Value::Int(1)]).unwrap() {
            BuiltinResult::Error(_) => {}
            _ => panic!("expected error for non-closure argument"),
        }
    }

    #[test]
    fn test_to_base() {
        assert_eq!(to_base(255, 16), "ff");
        assert_eq!(to_base(-8, 2), "-1000");
        assert_eq!(to_base(0, 7), "0");
    }
}
