//! The Rill type lattice and coercion rules.
//!
//! Numeric widening follows `int -> long -> double -> Decimal`; `def`
//! (spelled `Any` here) defers checks to runtime.

use std::fmt;

/// Index into the resolved class table.
pub type ClassId = usize;

/// A resolved static type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    Bool,
    Int,
    Long,
    Double,
    Decimal,
    Str,
    List,
    Map,
    Instance(ClassId),
    /// A class reference (the class itself, not an instance)
    Class(ClassId),
    Function,
    Iterator,
    /// `def` — checks happen at runtime
    Any,
    Void,
}

impl Type {
    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Int | Type::Long | Type::Double | Type::Decimal)
    }

    pub fn is_integral(&self) -> bool {
        matches!(self, Type::Int | Type::Long)
    }

    /// Rank in the numeric widening chain; higher wins in arithmetic.
    fn numeric_rank(&self) -> Option<u8> {
        match self {
            Type::Int => Some(0),
            Type::Long => Some(1),
            Type::Double => Some(2),
            Type::Decimal => Some(3),
            _ => None,
        }
    }

    /// Result type of an arithmetic operator applied to two operands.
    ///
    /// `+` additionally means concatenation when the left operand is a
    /// string or list and merge for maps; callers pass `is_add` so those
    /// cases resolve here.
    pub fn arith_result(lhs: Type, rhs: Type, is_add: bool) -> Option<Type> {
        if lhs == Type::Any || rhs == Type::Any {
            return Some(Type::Any);
        }
        if is_add {
            match lhs {
                Type::Str => return Some(Type::Str),
                Type::List | Type::Iterator => return Some(Type::List),
                Type::Map if rhs == Type::Map => return Some(Type::Map),
                _ => {}
            }
        }
        // String repetition: 'ab' * 3
        if !is_add && lhs == Type::Str && rhs.is_integral() {
            return Some(Type::Str);
        }
        match (lhs.numeric_rank(), rhs.numeric_rank()) {
            (Some(a), Some(b)) => {
                let rank = a.max(b);
                Some(match rank {
                    0 => Type::Int,
                    1 => Type::Long,
                    2 => Type::Double,
                    _ => Type::Decimal,
                })
            }
            _ => None,
        }
    }

    /// Can a value of `self` be assigned to a slot of type `target`
    /// without an explicit conversion?
    pub fn assignable_to(&self, target: &Type) -> bool {
        if self == target || *target == Type::Any || *self == Type::Any {
            return true;
        }
        match (self.numeric_rank(), target.numeric_rank()) {
            // Implicit widening only
            (Some(from), Some(to)) => from <= to,
            // Instance-to-instance compatibility (subclassing) is
            // checked at runtime against the class table
            _ => matches!(
                (self, target),
                (Type::Iterator, Type::List)
                    | (Type::List, Type::Iterator)
                    | (Type::Instance(_), Type::Instance(_))
            ),
        }
    }

    /// Is an explicit `as` conversion between these types defined at all?
    pub fn convertible_to(&self, target: &Type) -> bool {
        if self.assignable_to(target) {
            return true;
        }
        match (self, target) {
            // Narrowing numeric conversions
            (a, b) if a.is_numeric() && b.is_numeric() => true,
            // String to number and anything to string
            (Type::Str, b) if b.is_numeric() => true,
            (_, Type::Str) => true,
            (_, Type::Bool) => true,
            // Collection reshaping
            (Type::List, Type::Map) | (Type::Map, Type::List) => true,
            (Type::Iterator, Type::Map) => true,
            // Instances and maps interconvert
            (Type::Instance(_), Type::Map) | (Type::Map, Type::Instance(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bool => write!(f, "boolean"),
            Type::Int => write!(f, "int"),
            Type::Long => write!(f, "long"),
            Type::Double => write!(f, "double"),
            Type::Decimal => write!(f, "Decimal"),
            Type::Str => write!(f, "String"),
            Type::List => write!(f, "List"),
            Type::Map => write!(f, "Map"),
            Type::Instance(id) => write!(f, "Instance<{}>", id),
            Type::Class(id) => write!(f, "Class<{}>", id),
            Type::Function => write!(f, "Function"),
            Type::Iterator => write!(f, "Iterator"),
            Type::Any => write!(f, "def"),
            Type::Void => write!(f, "void"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_widening() {
        assert_eq!(
            Type::arith_result(Type::Int, Type::Long, false),
            Some(Type::Long)
        );
        assert_eq!(
            Type::arith_result(Type::Long, Type::Double, false),
            Some(Type::Double)
        );
        assert_eq!(
            Type::arith_result(Type::Double, Type::Decimal, false),
            Some(Type::Decimal)
        );
        assert_eq!(
            Type::arith_result(Type::Int, Type::Int, false),
            Some(Type::Int)
        );
    }

    #[test]
    fn test_string_concat_takes_left() {
        assert_eq!(
            Type::arith_result(Type::Str, Type::Int, true),
            Some(Type::Str)
        );
        assert_eq!(Type::arith_result(Type::Int, Type::Str, true), None);
    }

    #[test]
    fn test_assignability() {
        assert!(Type::Int.assignable_to(&Type::Long));
        assert!(!Type::Long.assignable_to(&Type::Int));
        assert!(Type::Int.assignable_to(&Type::Any));
        assert!(Type::Any.assignable_to(&Type::Int));
    }

    #[test]
    fn test_conversions() {
        assert!(Type::Long.convertible_to(&Type::Int));
        assert!(Type::Str.convertible_to(&Type::Decimal));
        assert!(Type::Map.convertible_to(&Type::List));
        assert!(!Type::Function.convertible_to(&Type::Int));
    }
}
