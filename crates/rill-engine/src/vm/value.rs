//! The tagged runtime value
//!
//! Reference values (lists, maps, instances, iterators) share storage
//! through `Arc<Mutex<...>>` so continuations stay `Send` and identity
//! (`===`) is Arc identity. Equality (`==`) is structural and numeric
//! comparisons promote across the int/long/double/Decimal chain.

use crate::compiler::code::CodeUnit;
use crate::types::ClassId;
use crate::vm::heap::HeapCell;
use crate::vm::iter::IterState;
use bigdecimal::BigDecimal;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;

pub type ListRef = Arc<Mutex<Vec<Value>>>;
pub type MapRef = Arc<Mutex<IndexMap<String, Value>>>;
pub type InstanceRef = Arc<Mutex<Instance>>;
pub type IterRef = Arc<Mutex<IterState>>;
/// Script globals share the map representation.
pub type Globals = MapRef;

/// An object instance: its class plus insertion-ordered fields.
#[derive(Debug, Clone)]
pub struct Instance {
    pub class_id: ClassId,
    pub class_name: Arc<str>,
    pub fields: IndexMap<String, Value>,
}

/// The value form of a function or closure.
#[derive(Debug)]
pub struct FunctionValue {
    /// Stable compiled name, the function's identity for serialization
    pub name: Arc<str>,
    pub unit: Arc<CodeUnit>,
    /// Canonicalizing wrapper for defaults / named arguments
    pub wrapper: Option<Arc<CodeUnit>>,
    /// Cells captured from enclosing frames, in the unit's capture order
    pub captures: Vec<HeapCell>,
    /// Globals of the run that created this value
    pub globals: Globals,
}

/// A tagged runtime value.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Decimal(Arc<BigDecimal>),
    Str(Arc<str>),
    List(ListRef),
    Map(MapRef),
    Instance(InstanceRef),
    Function(Arc<FunctionValue>),
    Iter(IterRef),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Value {
        Value::Str(Arc::from(s.into().into_boxed_str()))
    }

    pub fn decimal(d: BigDecimal) -> Value {
        Value::Decimal(Arc::new(d))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Arc::new(Mutex::new(items)))
    }

    pub fn map(entries: IndexMap<String, Value>) -> Value {
        Value::Map(Arc::new(Mutex::new(entries)))
    }

    pub fn empty_map() -> Value {
        Value::Map(Arc::new(Mutex::new(IndexMap::new())))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(_) => "boolean".to_string(),
            Value::Int(_) => "int".to_string(),
            Value::Long(_) => "long".to_string(),
            Value::Double(_) => "double".to_string(),
            Value::Decimal(_) => "Decimal".to_string(),
            Value::Str(_) => "String".to_string(),
            Value::List(_) => "List".to_string(),
            Value::Map(_) => "Map".to_string(),
            Value::Instance(i) => i.lock().class_name.to_string(),
            Value::Function(_) => "Function".to_string(),
            Value::Iter(_) => "Iterator".to_string(),
        }
    }

    /// Truthiness: null, false, zero, and empty strings/collections are
    /// false; everything else is true.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Long(n) => *n != 0,
            Value::Double(n) => *n != 0.0,
            Value::Decimal(d) => !bigdecimal::Zero::is_zero(d.as_ref()),
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.lock().is_empty(),
            Value::Map(m) => !m.lock().is_empty(),
            Value::Instance(_) | Value::Function(_) | Value::Iter(_) => true,
        }
    }

    /// Structural equality; numbers compare across representations.
    pub fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (a, b) if a.is_number() && b.is_number() => {
                matches!(a.number_cmp(b), Some(Ordering::Equal))
            }
            (Value::List(a), Value::List(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.lock();
                let b = b.lock();
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.lock();
                let b = b.lock();
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).map(|w| v.equals(w)).unwrap_or(false))
            }
            (Value::Instance(a), Value::Instance(b)) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let a = a.lock();
                let b = b.lock();
                a.class_id == b.class_id
                    && a.fields.len() == b.fields.len()
                    && a.fields
                        .iter()
                        .all(|(k, v)| b.fields.get(k).map(|w| v.equals(w)).unwrap_or(false))
            }
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Iter(a), Value::Iter(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// `===`: identity for reference types, value equality for the rest.
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) => Arc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Arc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Arc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Iter(a), Value::Iter(b)) => Arc::ptr_eq(a, b),
            _ => self.equals(other),
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(
            self,
            Value::Int(_) | Value::Long(_) | Value::Double(_) | Value::Decimal(_)
        )
    }

    /// Compare two numbers, promoting to the wider representation.
    pub fn number_cmp(&self, other: &Value) -> Option<Ordering> {
        use Value::*;
        match (self, other) {
            (Decimal(a), b) => Some(a.as_ref().cmp(&b.to_decimal()?)),
            (a, Decimal(b)) => Some(a.to_decimal()?.cmp(b.as_ref())),
            (Double(a), b) => a.partial_cmp(&b.to_f64()?),
            (a, Double(b)) => a.to_f64()?.partial_cmp(b),
            (a, b) => Some(a.to_i64()?.cmp(&b.to_i64()?)),
        }
    }

    /// Total ordering used by `<=>`, comparisons, and `sort`.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (a, b) if a.is_number() && b.is_number() => a.number_cmp(b),
            (Value::Str(a), Value::Str(b)) => Some(a.as_ref().cmp(b.as_ref())),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) => Some(Ordering::Less),
            (_, Value::Null) => Some(Ordering::Greater),
            (Value::List(a), Value::List(b)) => {
                let a = a.lock().clone();
                let b = b.lock().clone();
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.compare(y)? {
                        Ordering::Equal => continue,
                        other => return Some(other),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => None,
        }
    }

    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n as i64),
            Value::Long(n) => Some(*n),
            Value::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Long(n) => Some(*n as f64),
            Value::Double(n) => Some(*n),
            Value::Decimal(d) => bigdecimal::ToPrimitive::to_f64(d.as_ref()),
            _ => None,
        }
    }

    pub fn to_decimal(&self) -> Option<BigDecimal> {
        match self {
            Value::Int(n) => Some(BigDecimal::from(*n)),
            Value::Long(n) => Some(BigDecimal::from(*n)),
            Value::Double(n) => BigDecimal::try_from(*n).ok(),
            Value::Decimal(d) => Some(d.as_ref().clone()),
            _ => None,
        }
    }

    /// Human-readable rendering: strings bare, collections bracketed,
    /// doubles always with a decimal point.
    pub fn display(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Long(n) => n.to_string(),
            Value::Double(n) => format_double(*n),
            Value::Decimal(d) => d.to_string(),
            Value::Str(s) => s.to_string(),
            Value::List(l) => {
                let items: Vec<String> = l.lock().iter().map(|v| v.display()).collect();
                format!("[{}]", items.join(", "))
            }
            Value::Map(m) => {
                let entries: Vec<String> = m
                    .lock()
                    .iter()
                    .map(|(k, v)| format!("{}:{}", k, v.display()))
                    .collect();
                if entries.is_empty() {
                    "[:]".to_string()
                } else {
                    format!("[{}]", entries.join(", "))
                }
            }
            Value::Instance(i) => {
                let i = i.lock();
                let fields: Vec<String> = i
                    .fields
                    .iter()
                    .map(|(k, v)| format!("{}:{}", k, v.display()))
                    .collect();
                format!("[{}]", fields.join(", "))
            }
            Value::Function(f) => format!("Function@{}", f.name),
            Value::Iter(_) => "<iterator>".to_string(),
        }
    }
}

fn format_double(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{:.1}", n)
    } else {
        n.to_string()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_numeric_equality_across_types() {
        assert_eq!(Value::Int(3), Value::Long(3));
        assert_eq!(Value::Int(3), Value::Double(3.0));
        assert_eq!(
            Value::Int(3),
            Value::decimal(BigDecimal::from_str("3").unwrap())
        );
        assert_ne!(Value::Int(3), Value::Int(4));
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.truthy());
        assert!(!Value::Int(0).truthy());
        assert!(!Value::string("").truthy());
        assert!(!Value::list(vec![]).truthy());
        assert!(Value::Int(1).truthy());
        assert!(Value::string("x").truthy());
    }

    #[test]
    fn test_structural_list_equality() {
        let a = Value::list(vec![Value::Int(1), Value::Int(2)]);
        let b = Value::list(vec![Value::Int(1), Value::Int(2)]);
        assert!(a.equals(&b));
        assert!(!a.identical(&b));
        let c = a.clone();
        assert!(a.identical(&c));
    }

    #[test]
    fn test_display_formats() {
        assert_eq!(
            Value::list(vec![Value::Int(1), Value::Int(2)]).display(),
            "[1, 2]"
        );
        assert_eq!(Value::Double(1.0).display(), "1.0");
        let mut m = IndexMap::new();
        m.insert(
            "AAPL".to_string(),
            Value::decimal(BigDecimal::from_str("151.03").unwrap()),
        );
        assert_eq!(Value::map(m).display(), "[AAPL:151.03]");
        assert_eq!(Value::empty_map().display(), "[:]");
    }

    #[test]
    fn test_compare_strings_code_points() {
        assert_eq!(
            Value::string("abc").compare(&Value::string("abd")),
            Some(Ordering::Less)
        );
    }
}
