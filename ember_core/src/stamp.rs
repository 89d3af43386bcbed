//! Argument-shape stamps
//!
//! A stamp is an abstract description of the values seen at some point, for
//! example the argument vectors passing through one call site. Stamps form a
//! join-semilattice with `Uninitialized` at the bottom and `Generic` at the top:
//!
//! ```text
//!                 Generic
//!         /          |          \
//!     Type(t)     Array(..)    ...
//!        |
//!     Class(c)          c.type_tag == t
//!        |
//!    Instance(v)        class(v) == c
//!        |
//!   Uninitialized
//! ```
//!
//! Arrays are profiled per slot, up to [`MAX_TRACKED_SLOTS`] slots, plus a
//! length that is itself uninitialized, exact or generic.

use crate::value::{ClassId, TypeTag, Value, Witness};
use serde::Serialize;
use std::fmt;

/// Number of leading array slots tracked individually.
///
/// Slots past the cap are ignored both when joining and when checking
/// compatibility.
pub const MAX_TRACKED_SLOTS: usize = 8;

/// Abstract shape of a value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum Stamp {
    /// Nothing observed yet. Compatible with no value.
    Uninitialized,
    /// Exactly one scalar value observed
    Instance(Witness),
    /// Scalars sharing one runtime class
    Class(ClassId),
    /// Scalars sharing one declared type
    Type(TypeTag),
    /// Arrays, profiled per slot
    Array(ArrayStamp),
    /// Anything
    Generic,
}

/// Length component of an array stamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ArrayLength {
    Uninitialized,
    Exact(usize),
    Generic,
}

impl ArrayLength {
    fn join(self, other: ArrayLength) -> ArrayLength {
        match (self, other) {
            (ArrayLength::Uninitialized, x) | (x, ArrayLength::Uninitialized) => x,
            (ArrayLength::Exact(a), ArrayLength::Exact(b)) if a == b => ArrayLength::Exact(a),
            _ => ArrayLength::Generic,
        }
    }

    fn accepts(self, len: usize) -> bool {
        match self {
            ArrayLength::Uninitialized => false,
            ArrayLength::Exact(n) => n == len,
            ArrayLength::Generic => true,
        }
    }
}

/// Per-slot stamp of an array.
///
/// `slots` never holds more than [`MAX_TRACKED_SLOTS`] entries. A slot index
/// with no entry is uninitialized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ArrayStamp {
    slots: Vec<Stamp>,
    length: ArrayLength,
}

impl ArrayStamp {
    /// Stamp of one observed array
    pub fn of(items: &[Value]) -> Self {
        Self {
            slots: items.iter().take(MAX_TRACKED_SLOTS).map(Stamp::of).collect(),
            length: ArrayLength::Exact(items.len()),
        }
    }

    /// Tracked slot stamps
    pub fn slots(&self) -> &[Stamp] {
        &self.slots
    }

    /// Length component
    pub fn length(&self) -> ArrayLength {
        self.length
    }

    fn join(&self, other: &ArrayStamp) -> ArrayStamp {
        let width = self.slots.len().max(other.slots.len());
        let slots = (0..width)
            .map(|i| match (self.slots.get(i), other.slots.get(i)) {
                (Some(a), Some(b)) => a.join(b),
                (Some(a), None) | (None, Some(a)) => a.clone(),
                (None, None) => Stamp::Uninitialized,
            })
            .collect();
        ArrayStamp {
            slots,
            length: self.length.join(other.length),
        }
    }

    fn is_compatible(&self, items: &[Value]) -> bool {
        if !self.length.accepts(items.len()) {
            return false;
        }
        items
            .iter()
            .take(MAX_TRACKED_SLOTS)
            .enumerate()
            .all(|(i, item)| match self.slots.get(i) {
                Some(slot) => slot.is_compatible(item),
                None => false,
            })
    }
}

/// Intermediate view of a scalar stamp used by the join
struct ScalarLevels<'a> {
    witness: Option<&'a Witness>,
    class: Option<ClassId>,
    type_tag: TypeTag,
}

impl Stamp {
    /// Most precise stamp describing `value`
    pub fn of(value: &Value) -> Stamp {
        match value {
            Value::Array(items) => Stamp::Array(ArrayStamp::of(items)),
            scalar => match scalar.witness() {
                Some(witness) => Stamp::Instance(witness),
                None => Stamp::Generic,
            },
        }
    }

    /// Stamp of a whole argument vector
    pub fn of_arguments(args: &[Value]) -> Stamp {
        Stamp::Array(ArrayStamp::of(args))
    }

    /// Fold one observed value into this stamp
    pub fn join_value(&self, value: &Value) -> Stamp {
        self.join(&Stamp::of(value))
    }

    /// Fold one argument vector into this stamp
    pub fn join_arguments(&self, args: &[Value]) -> Stamp {
        self.join(&Stamp::of_arguments(args))
    }

    /// Least upper bound of two stamps
    pub fn join(&self, other: &Stamp) -> Stamp {
        match (self, other) {
            (Stamp::Uninitialized, x) | (x, Stamp::Uninitialized) => x.clone(),
            (Stamp::Generic, _) | (_, Stamp::Generic) => Stamp::Generic,
            (Stamp::Array(a), Stamp::Array(b)) => Stamp::Array(a.join(b)),
            (Stamp::Array(_), _) | (_, Stamp::Array(_)) => Stamp::Generic,
            (a, b) => match (a.scalar_levels(), b.scalar_levels()) {
                (Some(a), Some(b)) => Self::join_scalars(a, b),
                _ => Stamp::Generic,
            },
        }
    }

    fn join_scalars(a: ScalarLevels<'_>, b: ScalarLevels<'_>) -> Stamp {
        if let (Some(wa), Some(wb)) = (a.witness, b.witness) {
            if wa == wb {
                return Stamp::Instance(wa.clone());
            }
        }
        if let (Some(ca), Some(cb)) = (a.class, b.class) {
            if ca == cb {
                return Stamp::Class(ca);
            }
        }
        if a.type_tag == b.type_tag {
            return Stamp::Type(a.type_tag);
        }
        Stamp::Generic
    }

    fn scalar_levels(&self) -> Option<ScalarLevels<'_>> {
        match self {
            Stamp::Instance(w) => Some(ScalarLevels {
                witness: Some(w),
                class: Some(w.class),
                type_tag: w.type_tag(),
            }),
            Stamp::Class(c) => Some(ScalarLevels {
                witness: None,
                class: Some(*c),
                type_tag: c.type_tag,
            }),
            Stamp::Type(t) => Some(ScalarLevels {
                witness: None,
                class: None,
                type_tag: *t,
            }),
            _ => None,
        }
    }

    /// Whether `value` is described by this stamp without widening it
    pub fn is_compatible(&self, value: &Value) -> bool {
        match (self, value) {
            (Stamp::Uninitialized, _) => false,
            (Stamp::Generic, _) => true,
            (Stamp::Array(stamp), Value::Array(items)) => stamp.is_compatible(items),
            (Stamp::Array(_), _) | (_, Value::Array(_)) => false,
            (Stamp::Instance(w), v) => v.witness().as_ref() == Some(w),
            (Stamp::Class(c), v) => v.class() == *c,
            (Stamp::Type(t), v) => v.type_tag() == *t,
        }
    }

    /// Whether an argument vector is described by this stamp
    pub fn is_compatible_arguments(&self, args: &[Value]) -> bool {
        match self {
            Stamp::Generic => true,
            Stamp::Array(stamp) => stamp.is_compatible(args),
            _ => false,
        }
    }

    /// Lattice order: `self ⊑ other`
    pub fn is_subsumed_by(&self, other: &Stamp) -> bool {
        self.join(other) == *other
    }

    pub fn is_generic(&self) -> bool {
        matches!(self, Stamp::Generic)
    }

    /// Carries no shape information: `Generic`, or an array stamp whose
    /// length and tracked slots are all generic
    pub fn is_unspecialized(&self) -> bool {
        match self {
            Stamp::Generic => true,
            Stamp::Array(a) => {
                a.length == ArrayLength::Generic && a.slots.iter().all(Stamp::is_generic)
            }
            _ => false,
        }
    }
}

impl Default for Stamp {
    fn default() -> Self {
        Stamp::Uninitialized
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stamp::Uninitialized => f.write_str("uninit"),
            Stamp::Instance(w) => write!(f, "={:?}", w.identity),
            Stamp::Class(c) => write!(f, "class({})", c),
            Stamp::Type(t) => write!(f, "type({})", t),
            Stamp::Generic => f.write_str("generic"),
            Stamp::Array(a) => {
                f.write_str("[")?;
                for (i, slot) in a.slots.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", slot)?;
                }
                match a.length {
                    ArrayLength::Uninitialized => f.write_str("; len=?]"),
                    ArrayLength::Exact(n) => write!(f, "; len={}]", n),
                    ArrayLength::Generic => f.write_str("; len=*]"),
                }
            }
        }
    }
}
