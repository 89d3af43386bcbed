//! Compilation policies deciding when a hot target is compiled

use crate::profile::CompilationProfile;
use ember_core::{EngineOptions, PolicyKind};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Answer to "compile now?"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompileDecision {
    /// Counters not exhausted yet
    NotReady,
    /// Submit a compilation
    Compile,
    /// Counters were exhausted too quickly; they were reset and the decision postponed
    Deferred,
    /// A recent failure keeps the target ineligible
    CoolingDown,
    /// A permanent failure disabled compilation of the target
    Disabled,
    /// The target is already compiled or queued; the policy was not consulted
    InProgress,
}

/// Decision predicate over a compilation profile.
///
/// Policies receive the profile mutably because the timestamped variant
/// resets counters when it defers.
pub trait CompilationPolicy: fmt::Debug + Send + Sync {
    fn should_compile(&self, profile: &mut CompilationProfile, now: Instant) -> CompileDecision;
}

/// Gates shared by every policy
fn gate(profile: &CompilationProfile, now: Instant) -> Option<CompileDecision> {
    if profile.compilation_failed() {
        Some(CompileDecision::Disabled)
    } else if profile.is_cooling_down(now) {
        Some(CompileDecision::CoolingDown)
    } else if !profile.is_exhausted() {
        Some(CompileDecision::NotReady)
    } else {
        None
    }
}

/// Compiles as soon as both counters are exhausted
#[derive(Debug, Default, Clone, Copy)]
pub struct CounterPolicy;

impl CompilationPolicy for CounterPolicy {
    fn should_compile(&self, profile: &mut CompilationProfile, now: Instant) -> CompileDecision {
        if let Some(decision) = gate(profile, now) {
            return decision;
        }
        profile.mark_decision(now);
        CompileDecision::Compile
    }
}

/// Requires a minimum wall-clock span between two decisions.
///
/// Loop-heavy targets can exhaust their counters almost immediately; when
/// that happens faster than `min_interval` the counters are reset and the
/// decision deferred.
#[derive(Debug, Clone, Copy)]
pub struct TimestampedPolicy {
    min_interval: Duration,
}

impl TimestampedPolicy {
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval }
    }
}

impl CompilationPolicy for TimestampedPolicy {
    fn should_compile(&self, profile: &mut CompilationProfile, now: Instant) -> CompileDecision {
        if let Some(decision) = gate(profile, now) {
            return decision;
        }
        let span = now.saturating_duration_since(profile.previous_timestamp());
        if span > self.min_interval {
            profile.mark_decision(now);
            CompileDecision::Compile
        } else {
            profile.reset(now);
            CompileDecision::Deferred
        }
    }
}

/// Build the policy selected by `compilation-policy`
pub fn policy_for(options: &EngineOptions) -> Box<dyn CompilationPolicy> {
    match options.compilation_policy {
        PolicyKind::Counter => Box::new(CounterPolicy),
        PolicyKind::Timestamped => Box::new(TimestampedPolicy::new(options.time_threshold())),
    }
}
