//! Runtime values as observed by the engine
//!
//! The engine never executes values. It only needs three views of each one:
//! its identity, its runtime class and its declared type tag. A class always
//! belongs to exactly one type tag, which keeps the stamp lattice a tree.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of a value in the guest language's type system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeTag(pub u32);

impl TypeTag {
    pub const NULL: TypeTag = TypeTag(0);
    pub const BOOLEAN: TypeTag = TypeTag(1);
    pub const NUMBER: TypeTag = TypeTag(2);
    pub const STRING: TypeTag = TypeTag(3);
    pub const ARRAY: TypeTag = TypeTag(4);
    pub const OBJECT: TypeTag = TypeTag(5);
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TypeTag::NULL => f.write_str("null"),
            TypeTag::BOOLEAN => f.write_str("boolean"),
            TypeTag::NUMBER => f.write_str("number"),
            TypeTag::STRING => f.write_str("string"),
            TypeTag::ARRAY => f.write_str("array"),
            TypeTag::OBJECT => f.write_str("object"),
            TypeTag(other) => write!(f, "type#{}", other),
        }
    }
}

/// Runtime class of a value.
///
/// The class embeds its type tag, so equal classes always have equal types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId {
    pub type_tag: TypeTag,
    pub index: u32,
}

impl ClassId {
    pub const NULL: ClassId = ClassId::new(TypeTag::NULL, 0);
    pub const BOOL: ClassId = ClassId::new(TypeTag::BOOLEAN, 0);
    pub const INT: ClassId = ClassId::new(TypeTag::NUMBER, 0);
    pub const FLOAT: ClassId = ClassId::new(TypeTag::NUMBER, 1);
    pub const STRING: ClassId = ClassId::new(TypeTag::STRING, 0);
    pub const ARRAY: ClassId = ClassId::new(TypeTag::ARRAY, 0);

    /// Create a class belonging to `type_tag`
    pub const fn new(type_tag: TypeTag, index: u32) -> Self {
        Self { type_tag, index }
    }

    /// Create a guest object class
    pub const fn object(index: u32) -> Self {
        Self::new(TypeTag::OBJECT, index)
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.type_tag, self.index)
    }
}

/// Reference to a guest heap object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Heap identity
    pub id: u64,
    /// Runtime class
    pub class: ClassId,
}

/// Runtime value type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(ObjectRef),
}

/// Exact identity of a single witnessed scalar value.
///
/// Floats compare by bit pattern so a NaN witness is equal to itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Identity {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    String(String),
    Object(u64),
}

/// A witnessed scalar: identity plus the class it was observed with
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Witness {
    pub identity: Identity,
    pub class: ClassId,
}

impl Witness {
    /// Declared type of the witnessed value
    pub fn type_tag(&self) -> TypeTag {
        self.class.type_tag
    }
}

impl Value {
    /// Runtime class of the value
    pub fn class(&self) -> ClassId {
        match self {
            Value::Null => ClassId::NULL,
            Value::Bool(_) => ClassId::BOOL,
            Value::Int(_) => ClassId::INT,
            Value::Float(_) => ClassId::FLOAT,
            Value::String(_) => ClassId::STRING,
            Value::Array(_) => ClassId::ARRAY,
            Value::Object(obj) => obj.class,
        }
    }

    /// Declared type of the value
    pub fn type_tag(&self) -> TypeTag {
        self.class().type_tag
    }

    /// Identity witness, `None` for arrays which are profiled per slot
    pub fn witness(&self) -> Option<Witness> {
        let identity = match self {
            Value::Null => Identity::Null,
            Value::Bool(b) => Identity::Bool(*b),
            Value::Int(i) => Identity::Int(*i),
            Value::Float(f) => Identity::Float(f.to_bits()),
            Value::String(s) => Identity::String(s.clone()),
            Value::Object(obj) => Identity::Object(obj.id),
            Value::Array(_) => return None,
        };
        Some(Witness {
            identity,
            class: self.class(),
        })
    }

    /// Whether `other` is the same witnessed value
    pub fn same_identity(&self, other: &Value) -> bool {
        match (self.witness(), other.witness()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}
