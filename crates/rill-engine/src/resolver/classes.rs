//! Class descriptors
//!
//! Built during pre-declaration so method bodies and field initializers
//! can reference any class in the unit regardless of declaration order.

use crate::parser::ast::NodeId;
use crate::resolver::symbols::FunId;
use crate::types::{ClassId, Type};
use rustc_hash::FxHashMap;

/// One declared field.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: String,
    pub ty: Type,
    /// Field has a default value; fields without one are mandatory
    /// constructor arguments
    pub has_default: bool,
    pub is_final: bool,
    /// The `VarDecl` node carrying the default expression
    pub node: NodeId,
}

/// One declared method.
#[derive(Debug, Clone, Copy)]
pub struct MethodInfo {
    pub fun: FunId,
    pub is_final: bool,
}

/// Compile-time description of a class.
#[derive(Debug, Clone)]
pub struct ClassDescriptor {
    pub node: NodeId,
    /// Simple name as declared
    pub name: String,
    /// Dotted name including enclosing classes
    pub full_name: String,
    pub base: Option<ClassId>,
    /// Own fields in declaration order (base fields excluded)
    pub fields: Vec<FieldInfo>,
    /// Own methods by name
    pub methods: FxHashMap<String, MethodInfo>,
    pub inner: Vec<ClassId>,
    /// Synthesized initializer taking the fields as parameters
    pub init_fun: FunId,
}

impl ClassDescriptor {
    /// Find a field, walking the base chain.
    pub fn find_field<'a>(
        classes: &'a [ClassDescriptor],
        mut id: ClassId,
        name: &str,
    ) -> Option<&'a FieldInfo> {
        loop {
            let class = &classes[id];
            if let Some(field) = class.fields.iter().find(|f| f.name == name) {
                return Some(field);
            }
            id = class.base?;
        }
    }

    /// Find a method, walking the base chain.
    pub fn find_method(
        classes: &[ClassDescriptor],
        mut id: ClassId,
        name: &str,
    ) -> Option<MethodInfo> {
        loop {
            let class = &classes[id];
            if let Some(method) = class.methods.get(name) {
                return Some(*method);
            }
            id = class.base?;
        }
    }

    /// All fields including inherited ones, base-first, in declaration
    /// order. This is also the constructor parameter order.
    pub fn all_fields(classes: &[ClassDescriptor], id: ClassId) -> Vec<FieldInfo> {
        let mut chain = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            chain.push(c);
            cur = classes[c].base;
        }
        let mut fields = Vec::new();
        for c in chain.into_iter().rev() {
            fields.extend(classes[c].fields.iter().cloned());
        }
        fields
    }

    /// Is `maybe_base` the same class as `id` or one of its ancestors?
    pub fn is_subclass_of(classes: &[ClassDescriptor], mut id: ClassId, maybe_base: ClassId) -> bool {
        loop {
            if id == maybe_base {
                return true;
            }
            match classes[id].base {
                Some(base) => id = base,
                None => return false,
            }
        }
    }
}
