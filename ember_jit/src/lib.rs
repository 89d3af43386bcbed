//! Ember JIT
//!
//! Tiering machinery of the Ember specialization engine: execution profiles
//! and compilation policies, inlining decisions, call-site splitting and the
//! background compilation queue, tied together by the call target registry.

pub mod compiler;
pub mod events;
pub mod graph;
pub mod inlining;
pub mod policy;
pub mod profile;
pub mod registry;
pub mod splitting;

#[cfg(test)]
mod testing;

pub use compiler::{CancelToken, CompilationUnit, CompiledArtifact, CompilerBackend};
pub use events::{EngineEvent, EngineListener};
pub use graph::{CallGraph, CallSite, CallSiteFeedback, CallTarget};
pub use inlining::{InliningDecision, InliningPolicy, RejectReason, Verdict};
pub use policy::{CompilationPolicy, CompileDecision, CounterPolicy, TimestampedPolicy};
pub use profile::{CompilationProfile, ProfileSettings};
pub use registry::{CallDispatch, CallTargetRegistry, Route, TargetSnapshot};
pub use splitting::{SplitOutcome, SplitResolution, SplittingStrategy, SuppressReason};
