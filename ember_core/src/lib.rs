//! Ember Core
//!
//! Shared types of the Ember specialization engine: the values the engine
//! observes, the argument-shape stamp lattice, the host tree interface and
//! the configuration surface.

pub mod error;
pub mod loader;
pub mod options;
pub mod stamp;
pub mod tree;
pub mod value;

pub use error::{CompileError, EngineError, Result};
pub use loader::OptionsLoader;
pub use options::{EngineOptions, FailureAction, PolicyKind};
pub use stamp::{ArrayLength, ArrayStamp, Stamp, MAX_TRACKED_SLOTS};
pub use tree::{CallSiteId, RootNode, TargetId};
pub use value::{ClassId, ObjectRef, TypeTag, Value};
