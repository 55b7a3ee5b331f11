//! Operator semantics
//!
//! Numeric operations promote to the widest operand
//! (int/long/double/Decimal). Integer arithmetic wraps (two's
//! complement); `/` truncates toward zero; `%` is floored so the result
//! takes the sign of the divisor; `%%` is the plain truncated remainder.

use crate::compiler::code::RuntimeClass;
use crate::compiler::op::TypeTag;
use crate::error::{RuntimeError, RuntimeErrorKind};
use crate::parser::ast::BinOp;
use crate::vm::value::{Instance, Value};
use bigdecimal::{BigDecimal, Zero};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;

fn bad_operand(op: &str, v: &Value) -> RuntimeError {
    RuntimeError::new(RuntimeErrorKind::BadOperand {
        op: op.to_string(),
        ty: v.type_name(),
    })
}

fn null_operand(op: &str) -> RuntimeError {
    RuntimeError::new(RuntimeErrorKind::NullValue {
        context: format!("as operand of '{}'", op),
    })
}

fn op_name(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Mod => "%",
        BinOp::Rem => "%%",
        BinOp::Shl => "<<",
        BinOp::Shr => ">>",
        BinOp::Ushr => ">>>",
        BinOp::BitAnd => "&",
        BinOp::BitOr => "|",
        BinOp::BitXor => "^",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::EqId => "===",
        BinOp::NeId => "!==",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
        BinOp::Cmp => "<=>",
        BinOp::And => "&&",
        BinOp::Or => "||",
    }
}

/// Apply a binary operator. `decimal_precision` bounds Decimal division.
pub fn binary(
    op: BinOp,
    lhs: Value,
    rhs: Value,
    decimal_precision: u32,
) -> Result<Value, RuntimeError> {
    match op {
        BinOp::Eq => return Ok(Value::Bool(lhs.equals(&rhs))),
        BinOp::Ne => return Ok(Value::Bool(!lhs.equals(&rhs))),
        BinOp::EqId => return Ok(Value::Bool(lhs.identical(&rhs))),
        BinOp::NeId => return Ok(Value::Bool(!lhs.identical(&rhs))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Cmp => {
            let ord = lhs
                .compare(&rhs)
                .ok_or_else(|| bad_operand(op_name(op), &rhs))?;
            return Ok(match op {
                BinOp::Lt => Value::Bool(ord == Ordering::Less),
                BinOp::Le => Value::Bool(ord != Ordering::Greater),
                BinOp::Gt => Value::Bool(ord == Ordering::Greater),
                BinOp::Ge => Value::Bool(ord != Ordering::Less),
                _ => Value::Int(match ord {
                    Ordering::Less => -1,
                    Ordering::Equal => 0,
                    Ordering::Greater => 1,
                }),
            });
        }
        BinOp::And | BinOp::Or => {
            // Short-circuiting forms are lowered to jumps; this is the
            // eager fallback
            let l = lhs.truthy();
            let r = rhs.truthy();
            return Ok(Value::Bool(if op == BinOp::And { l && r } else { l || r }));
        }
        _ => {}
    }

    if lhs.is_null() || rhs.is_null() {
        return Err(null_operand(op_name(op)));
    }

    // Non-numeric forms of `+` and `*`
    if op == BinOp::Add {
        match &lhs {
            Value::Str(s) => {
                let mut out = s.to_string();
                out.push_str(&rhs.display());
                return Ok(Value::string(out));
            }
            Value::List(list) => {
                let mut items = list.lock().clone();
                match &rhs {
                    Value::List(other) => items.extend(other.lock().iter().cloned()),
                    other => items.push(other.clone()),
                }
                return Ok(Value::list(items));
            }
            Value::Map(map) => {
                if let Value::Map(other) = &rhs {
                    let mut merged = map.lock().clone();
                    for (k, v) in other.lock().iter() {
                        merged.insert(k.clone(), v.clone());
                    }
                    return Ok(Value::map(merged));
                }
                return Err(bad_operand("+", &rhs));
            }
            _ => {}
        }
    }
    if op == BinOp::Mul {
        if let (Value::Str(s), Some(n)) = (&lhs, rhs.to_i64()) {
            if n < 0 {
                return Err(bad_operand("*", &rhs));
            }
            return Ok(Value::string(s.repeat(n as usize)));
        }
    }

    match op {
        BinOp::Shl | BinOp::Shr | BinOp::Ushr | BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor => {
            return integral_binary(op, &lhs, &rhs);
        }
        _ => {}
    }

    numeric_binary(op, &lhs, &rhs, decimal_precision)
}

fn integral_binary(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, RuntimeError> {
    let wide = matches!(lhs, Value::Long(_)) || matches!(rhs, Value::Long(_));
    let l = lhs.to_i64().ok_or_else(|| bad_operand(op_name(op), lhs))?;
    let r = rhs.to_i64().ok_or_else(|| bad_operand(op_name(op), rhs))?;
    if wide {
        let result = match op {
            BinOp::Shl => l.wrapping_shl(r as u32 & 63),
            BinOp::Shr => l.wrapping_shr(r as u32 & 63),
            BinOp::Ushr => ((l as u64).wrapping_shr(r as u32 & 63)) as i64,
            BinOp::BitAnd => l & r,
            BinOp::BitOr => l | r,
            BinOp::BitXor => l ^ r,
            _ => unreachable!(),
        };
        Ok(Value::Long(result))
    } else {
        let l = l as i32;
        let r = r as i32;
        let result = match op {
            BinOp::Shl => l.wrapping_shl(r as u32 & 31),
            BinOp::Shr => l.wrapping_shr(r as u32 & 31),
            BinOp::Ushr => ((l as u32).wrapping_shr(r as u32 & 31)) as i32,
            BinOp::BitAnd => l & r,
            BinOp::BitOr => l | r,
            BinOp::BitXor => l ^ r,
            _ => unreachable!(),
        };
        Ok(Value::Int(result))
    }
}

fn numeric_binary(
    op: BinOp,
    lhs: &Value,
    rhs: &Value,
    decimal_precision: u32,
) -> Result<Value, RuntimeError> {
    let rank = numeric_rank(lhs)
        .max(numeric_rank(rhs))
        .ok_or_else(|| bad_operand(op_name(op), if numeric_rank(lhs).is_none() { lhs } else { rhs }))?;
    match rank {
        0 => {
            let l = lhs.to_i64().unwrap_or(0) as i32;
            let r = rhs.to_i64().unwrap_or(0) as i32;
            int_binary(op, l as i64, r as i64).map(|n| Value::Int(n as i32))
        }
        1 => {
            let l = lhs.to_i64().unwrap_or(0);
            let r = rhs.to_i64().unwrap_or(0);
            int_binary(op, l, r).map(Value::Long)
        }
        2 => {
            let l = lhs.to_f64().unwrap_or(0.0);
            let r = rhs.to_f64().unwrap_or(0.0);
            Ok(Value::Double(double_binary(op, l, r)))
        }
        _ => {
            let l = lhs
                .to_decimal()
                .ok_or_else(|| bad_operand(op_name(op), lhs))?;
            let r = rhs
                .to_decimal()
                .ok_or_else(|| bad_operand(op_name(op), rhs))?;
            decimal_binary(op, l, r, decimal_precision).map(Value::decimal)
        }
    }
}

fn numeric_rank(v: &Value) -> Option<u8> {
    match v {
        Value::Int(_) => Some(0),
        Value::Long(_) => Some(1),
        Value::Double(_) => Some(2),
        Value::Decimal(_) => Some(3),
        _ => None,
    }
}

fn int_binary(op: BinOp, l: i64, r: i64) -> Result<i64, RuntimeError> {
    match op {
        BinOp::Add => Ok(l.wrapping_add(r)),
        BinOp::Sub => Ok(l.wrapping_sub(r)),
        BinOp::Mul => Ok(l.wrapping_mul(r)),
        BinOp::Div => {
            if r == 0 {
                Err(RuntimeError::new(RuntimeErrorKind::DivideByZero))
            } else {
                Ok(l.wrapping_div(r))
            }
        }
        BinOp::Mod => {
            if r == 0 {
                Err(RuntimeError::new(RuntimeErrorKind::DivideByZero))
            } else {
                // Floored: result takes the divisor's sign
                Ok(l.wrapping_rem(r).wrapping_add(r).wrapping_rem(r))
            }
        }
        BinOp::Rem => {
            if r == 0 {
                Err(RuntimeError::new(RuntimeErrorKind::DivideByZero))
            } else {
                Ok(l.wrapping_rem(r))
            }
        }
        _ => unreachable!("non-arithmetic op {:?}", op),
    }
}

fn double_binary(op: BinOp, l: f64, r: f64) -> f64 {
    match op {
        BinOp::Add => l + r,
        BinOp::Sub => l - r,
        BinOp::Mul => l * r,
        BinOp::Div => l / r,
        BinOp::Mod => ((l % r) + r) % r,
        BinOp::Rem => l % r,
        _ => unreachable!("non-arithmetic op {:?}", op),
    }
}

fn decimal_binary(
    op: BinOp,
    l: BigDecimal,
    r: BigDecimal,
    precision: u32,
) -> Result<BigDecimal, RuntimeError> {
    match op {
        BinOp::Add => Ok(l + r),
        BinOp::Sub => Ok(l - r),
        BinOp::Mul => Ok(l * r),
        BinOp::Div => {
            if r.is_zero() {
                Err(RuntimeError::new(RuntimeErrorKind::DivideByZero))
            } else {
                Ok((l / r).with_prec(u64::from(precision)))
            }
        }
        BinOp::Mod => {
            if r.is_zero() {
                Err(RuntimeError::new(RuntimeErrorKind::DivideByZero))
            } else {
                let rem = l % r.clone();
                Ok((rem + r.clone()) % r)
            }
        }
        BinOp::Rem => {
            if r.is_zero() {
                Err(RuntimeError::new(RuntimeErrorKind::DivideByZero))
            } else {
                Ok(l % r)
            }
        }
        _ => unreachable!("non-arithmetic op {:?}", op),
    }
}

pub fn negate(v: Value) -> Result<Value, RuntimeError> {
    match v {
        Value::Int(n) => Ok(Value::Int(n.wrapping_neg())),
        Value::Long(n) => Ok(Value::Long(n.wrapping_neg())),
        Value::Double(n) => Ok(Value::Double(-n)),
        Value::Decimal(d) => Ok(Value::decimal(-d.as_ref().clone())),
        other => Err(bad_operand("unary -", &other)),
    }
}

pub fn unary_plus(v: Value) -> Result<Value, RuntimeError> {
    if v.is_number() {
        Ok(v)
    } else {
        Err(bad_operand("unary +", &v))
    }
}

pub fn bit_not(v: Value) -> Result<Value, RuntimeError> {
    match v {
        Value::Int(n) => Ok(Value::Int(!n)),
        Value::Long(n) => Ok(Value::Long(!n)),
        other => Err(bad_operand("~", &other)),
    }
}

fn conversion_failure(v: &Value, to: &str) -> RuntimeError {
    RuntimeError::new(RuntimeErrorKind::ConversionFailure {
        from: v.type_name(),
        to: to.to_string(),
    })
}

/// Explicit `as` conversion.
pub fn convert(v: Value, tag: TypeTag, classes: &[RuntimeClass]) -> Result<Value, RuntimeError> {
    match tag {
        TypeTag::Any => Ok(v),
        TypeTag::Bool => Ok(Value::Bool(v.truthy())),
        TypeTag::Int => match &v {
            Value::Int(_) => Ok(v),
            Value::Long(n) => Ok(Value::Int(*n as i32)),
            Value::Double(n) => Ok(Value::Int(*n as i32)),
            Value::Decimal(d) => bigdecimal::ToPrimitive::to_i64(d.as_ref())
                .map(|n| Value::Int(n as i32))
                .ok_or_else(|| conversion_failure(&v, "int")),
            Value::Bool(b) => Ok(Value::Int(i32::from(*b))),
            Value::Str(s) => s
                .trim()
                .parse::<i32>()
                .map(Value::Int)
                .map_err(|_| conversion_failure(&v, "int")),
            _ => Err(conversion_failure(&v, "int")),
        },
        TypeTag::Long => match &v {
            Value::Long(_) => Ok(v),
            Value::Int(n) => Ok(Value::Long(i64::from(*n))),
            Value::Double(n) => Ok(Value::Long(*n as i64)),
            Value::Decimal(d) => bigdecimal::ToPrimitive::to_i64(d.as_ref())
                .map(Value::Long)
                .ok_or_else(|| conversion_failure(&v, "long")),
            Value::Bool(b) => Ok(Value::Long(i64::from(*b))),
            Value::Str(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Long)
                .map_err(|_| conversion_failure(&v, "long")),
            _ => Err(conversion_failure(&v, "long")),
        },
        TypeTag::Double => match &v {
            Value::Double(_) => Ok(v),
            _ => v
                .to_f64()
                .map(Value::Double)
                .or_else(|| match &v {
                    Value::Str(s) => s.trim().parse::<f64>().ok().map(Value::Double),
                    _ => None,
                })
                .ok_or_else(|| conversion_failure(&v, "double")),
        },
        TypeTag::Decimal => match &v {
            Value::Decimal(_) => Ok(v),
            Value::Str(s) => s
                .trim()
                .parse::<BigDecimal>()
                .map(Value::decimal)
                .map_err(|_| conversion_failure(&v, "Decimal")),
            _ => v
                .to_decimal()
                .map(Value::decimal)
                .ok_or_else(|| conversion_failure(&v, "Decimal")),
        },
        TypeTag::Str => Ok(Value::string(v.display())),
        TypeTag::List => match &v {
            Value::List(_) => Ok(v),
            Value::Map(map) => {
                let items = map
                    .lock()
                    .iter()
                    .map(|(k, val)| Value::list(vec![Value::string(k.clone()), val.clone()]))
                    .collect();
                Ok(Value::list(items))
            }
            Value::Str(s) => Ok(Value::list(
                s.chars().map(|c| Value::string(c.to_string())).collect(),
            )),
            _ => Err(conversion_failure(&v, "List")),
        },
        TypeTag::Map => match &v {
            Value::Map(_) => Ok(v),
            Value::List(list) => {
                let mut out = IndexMap::new();
                for item in list.lock().iter() {
                    let Value::List(pair) = item else {
                        return Err(conversion_failure(&v, "Map"));
                    };
                    let pair = pair.lock();
                    if pair.len() != 2 {
                        return Err(conversion_failure(&v, "Map"));
                    }
                    out.insert(pair[0].display(), pair[1].clone());
                }
                Ok(Value::map(out))
            }
            Value::Instance(instance) => Ok(Value::map(instance.lock().fields.clone())),
            _ => Err(conversion_failure(&v, "Map")),
        },
        TypeTag::Instance(class_id) => match &v {
            Value::Instance(instance) => {
                if RuntimeClass::is_instance_of(classes, instance.lock().class_id, class_id) {
                    Ok(v)
                } else {
                    Err(conversion_failure(&v, &classes[class_id].name))
                }
            }
            Value::Map(map) => {
                let class = &classes[class_id];
                let source = map.lock();
                let mut fields = IndexMap::new();
                for name in &class.field_names {
                    fields.insert(name.clone(), source.get(name).cloned().unwrap_or(Value::Null));
                }
                Ok(Value::Instance(Arc::new(Mutex::new(Instance {
                    class_id,
                    class_name: Arc::clone(&class.name),
                    fields,
                }))))
            }
            _ => Err(conversion_failure(&v, &classes[class_id].name)),
        },
        TypeTag::Function => match &v {
            Value::Function(_) => Ok(v),
            _ => Err(conversion_failure(&v, "Function")),
        },
    }
}

/// Membership for `in`/`!in`.
pub fn contains(item: &Value, collection: &Value) -> Result<bool, RuntimeError> {
    match collection {
        Value::List(list) => Ok(list.lock().iter().any(|v| v.equals(item))),
        Value::Map(map) => Ok(map.lock().contains_key(item.display().as_str())),
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.contains(needle.as_ref())),
            _ => Ok(s.contains(&item.display())),
        },
        other => Err(bad_operand("in", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn int_op(op: BinOp, l: i32, r: i32) -> Value {
        binary(op, Value::Int(l), Value::Int(r), 20).unwrap()
    }

    #[test]
    fn test_modulo_takes_divisor_sign() {
        assert_eq!(int_op(BinOp::Mod, -5, 3), Value::Int(1));
        assert_eq!(int_op(BinOp::Mod, 3, -5), Value::Int(-2));
        assert_eq!(int_op(BinOp::Mod, -3, -5), Value::Int(-3));
        assert_eq!(int_op(BinOp::Mod, 5, 3), Value::Int(2));
    }

    #[test]
    fn test_remainder_is_truncated() {
        assert_eq!(int_op(BinOp::Rem, -5, 3), Value::Int(-2));
        assert_eq!(int_op(BinOp::Rem, 5, -3), Value::Int(2));
    }

    #[test]
    fn test_modulo_law() {
        for x in [-7i32, -3, 0, 3, 7, 100] {
            for y in [-5i32, -2, 2, 5] {
                let r = match int_op(BinOp::Mod, x, y) {
                    Value::Int(n) => n,
                    other => panic!("unexpected {:?}", other),
                };
                assert!(r.abs() < y.abs());
                assert!(y > 0 && r >= 0 || y < 0 && r <= 0, "x={} y={} r={}", x, y, r);
            }
        }
    }

    #[test]
    fn test_numeric_promotion() {
        assert_eq!(
            binary(BinOp::Add, Value::Int(1), Value::Long(2), 20).unwrap(),
            Value::Long(3)
        );
        assert_eq!(
            binary(BinOp::Add, Value::Int(1), Value::Double(0.5), 20).unwrap(),
            Value::Double(1.5)
        );
        let d = BigDecimal::from_str("1.5").unwrap();
        assert_eq!(
            binary(BinOp::Add, Value::Int(1), Value::decimal(d), 20).unwrap(),
            Value::decimal(BigDecimal::from_str("2.5").unwrap())
        );
    }

    #[test]
    fn test_int_wraps() {
        assert_eq!(int_op(BinOp::Add, i32::MAX, 1), Value::Int(i32::MIN));
    }

    #[test]
    fn test_divide_by_zero() {
        let err = binary(BinOp::Div, Value::Int(1), Value::Int(0), 20).unwrap_err();
        assert!(matches!(err.kind, RuntimeErrorKind::DivideByZero));
        // IEEE division never errors
        assert!(binary(BinOp::Div, Value::Double(1.0), Value::Double(0.0), 20).is_ok());
    }

    #[test]
    fn test_string_concat() {
        assert_eq!(
            binary(BinOp::Add, Value::string("a"), Value::Int(1), 20)
                .unwrap()
                .display(),
            "a1"
        );
        assert!(binary(BinOp::Add, Value::Int(1), Value::string("a"), 20).is_err());
    }

    #[test]
    fn test_string_to_number_conversion() {
        assert_eq!(
            convert(Value::string("42"), TypeTag::Int, &[]).unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            convert(Value::string("151.03"), TypeTag::Decimal, &[]).unwrap(),
            Value::decimal(BigDecimal::from_str("151.03").unwrap())
        );
        assert!(convert(Value::string("abc"), TypeTag::Int, &[]).is_err());
    }

    #[test]
    fn test_compare_op() {
        assert_eq!(int_op(BinOp::Cmp, 1, 2), Value::Int(-1));
        assert_eq!(int_op(BinOp::Cmp, 2, 2), Value::Int(0));
        assert_eq!(int_op(BinOp::Cmp, 3, 2), Value::Int(1));
    }
}
