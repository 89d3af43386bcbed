//! Engine configuration surface

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which compilation policy decides when a hot target is compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Compile as soon as both counters are exhausted
    Counter,
    /// Additionally require `time-threshold` to pass between decisions
    Timestamped,
}

/// What to do when the backend fails with anything but a retryable bail-out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    /// Apply the cool-down and say nothing
    Silent,
    /// Log the failure as a warning
    Print,
    /// Report the failure to the host as an error
    Throw,
    /// Log the failure and terminate the process
    Exit,
}

/// Recognized engine options.
///
/// Every field has a default, so a configuration file only needs to name
/// the options it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct EngineOptions {
    /// Calls plus loop iterations before a target is eligible
    pub compilation_threshold: u32,
    /// Calls alone before a target is eligible
    pub min_invoke_threshold: u32,
    /// Counter floor applied after an invalidation
    pub invalidation_reprofile_count: u32,
    /// Call-and-loop counter floor applied after a node replacement
    pub replace_reprofile_count: u32,
    /// Minimum milliseconds between decisions for the timestamped policy
    pub time_threshold: u64,
    pub compilation_policy: PolicyKind,

    pub function_inlining: bool,
    pub inlining_max_caller_size: usize,
    pub inlining_max_callee_size: usize,
    /// Callees at most this large ignore the frequency cutoff
    pub inlining_trivial_size: usize,
    pub inlining_min_frequency: f64,
    pub max_recursive_inlining_depth: usize,

    pub splitting_enabled: bool,
    pub splitting_start_call_count: u64,
    pub splitting_max_callee_size: usize,
    pub splitting_aggressive: bool,
    /// Shape-driven splitting; the eager heuristic is used when disabled
    pub splitting_shape_tracking: bool,

    pub background_compilation: bool,
    /// Block on the first compilation of a root target
    pub synchronous_compilation: bool,
    pub compiler_threads: usize,
    /// Milliseconds before a compilation is abandoned, 0 disables the limit
    pub compile_timeout: u64,
    /// Milliseconds a failed target stays ineligible
    pub compilation_failure_cooldown: u64,
    pub compilation_failure_action: FailureAction,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            compilation_threshold: 1000,
            min_invoke_threshold: 3,
            invalidation_reprofile_count: 3,
            replace_reprofile_count: 10,
            time_threshold: 50,
            compilation_policy: PolicyKind::Counter,
            function_inlining: true,
            inlining_max_caller_size: 2250,
            inlining_max_callee_size: 500,
            inlining_trivial_size: 10,
            inlining_min_frequency: 0.3,
            max_recursive_inlining_depth: 15,
            splitting_enabled: true,
            splitting_start_call_count: 3,
            splitting_max_callee_size: 100,
            splitting_aggressive: false,
            splitting_shape_tracking: true,
            background_compilation: true,
            synchronous_compilation: false,
            compiler_threads: 1,
            compile_timeout: 0,
            compilation_failure_cooldown: 1000,
            compilation_failure_action: FailureAction::Silent,
        }
    }
}

impl EngineOptions {
    /// Options tuned for tests: tiny thresholds, no time gating
    pub fn eager() -> Self {
        Self {
            compilation_threshold: 10,
            min_invoke_threshold: 3,
            time_threshold: 0,
            ..Self::default()
        }
    }

    pub fn time_threshold(&self) -> Duration {
        Duration::from_millis(self.time_threshold)
    }

    pub fn compile_timeout(&self) -> Option<Duration> {
        (self.compile_timeout > 0).then(|| Duration::from_millis(self.compile_timeout))
    }

    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_millis(self.compilation_failure_cooldown)
    }
}
