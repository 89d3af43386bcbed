//! Host AST interface
//!
//! The engine does not know how trees are represented or executed. It only
//! needs to count nodes for size heuristics and to copy a tree when a call
//! site receives a private variant.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Identifier of a call target in a registry session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TargetId(pub u32);

/// Identifier of a call site in a registry session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CallSiteId(pub u32);

impl TargetId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl CallSiteId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

impl fmt::Display for CallSiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cs{}", self.0)
    }
}

/// Root of an executable tree owned by the host
pub trait RootNode: fmt::Debug + Send + Sync {
    /// Name used in logs and profile dumps
    fn name(&self) -> &str;

    /// Number of non-trivial nodes in this tree, excluding callees
    fn node_count(&self) -> usize;

    /// Uninitialized copy of this tree for a split variant.
    ///
    /// The copy must contain the same call sites, in the same order, as the
    /// original tree.
    fn split_copy(&self) -> Arc<dyn RootNode>;
}
