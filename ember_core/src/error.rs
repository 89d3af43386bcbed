//! Error types for Ember Core

use crate::tree::{CallSiteId, TargetId};
use std::time::Duration;
use thiserror::Error;

/// Result type for Ember operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while driving the engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// A target id that the registry does not own
    #[error("Unknown call target: {0}")]
    UnknownTarget(TargetId),

    /// A call site id that the registry does not own
    #[error("Unknown call site: {0}")]
    UnknownCallSite(CallSiteId),

    /// Engine bookkeeping was found in an inconsistent state
    #[error("Invariant violated: {0}")]
    InvariantViolated(String),

    /// Error validating an option
    #[error("Invalid option {name}: {message}")]
    InvalidOption { name: String, message: String },

    /// A compilation failed and the failure action asked to surface it
    #[error("Compilation of {target} failed: {source}")]
    Compilation {
        target: String,
        #[source]
        source: CompileError,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Failures reported by a compiler backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The backend gave up on this unit.
    ///
    /// A permanent bail-out means retrying will never succeed.
    #[error("bailout: {reason}")]
    Bailout { reason: String, permanent: bool },

    /// Internal backend error
    #[error("fatal: {0}")]
    Fatal(String),

    /// The compilation did not finish in time
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The compilation was cancelled before it produced code
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl CompileError {
    /// Create a retryable bail-out
    pub fn bailout(reason: impl Into<String>) -> Self {
        CompileError::Bailout {
            reason: reason.into(),
            permanent: false,
        }
    }

    /// Create a bail-out that disables further attempts
    pub fn permanent_bailout(reason: impl Into<String>) -> Self {
        CompileError::Bailout {
            reason: reason.into(),
            permanent: true,
        }
    }

    /// Whether the target should never be compiled again
    pub fn is_permanent(&self) -> bool {
        matches!(self, CompileError::Bailout { permanent: true, .. })
    }

    /// Whether this is a bail-out rather than a backend fault
    pub fn is_bailout(&self) -> bool {
        matches!(self, CompileError::Bailout { .. })
    }
}
