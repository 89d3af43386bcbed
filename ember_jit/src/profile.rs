//! Compilation profile: interpreted execution volume of one call target

use ember_core::EngineOptions;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Thresholds and reprofile amounts shared by every profile in a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileSettings {
    pub call_threshold: i64,
    pub call_and_loop_threshold: i64,
    pub invalidation_reprofile: i64,
    pub replace_reprofile: i64,
    pub function_inlining: bool,
}

impl ProfileSettings {
    pub fn from_options(options: &EngineOptions) -> Self {
        Self {
            call_threshold: i64::from(options.min_invoke_threshold),
            call_and_loop_threshold: i64::from(options.compilation_threshold),
            invalidation_reprofile: i64::from(options.invalidation_reprofile_count),
            replace_reprofile: i64::from(options.replace_reprofile_count),
            function_inlining: options.function_inlining,
        }
    }
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self::from_options(&EngineOptions::default())
    }
}

/// Counters tracking how much a target ran in the interpreter.
///
/// Both counters start at their thresholds and count down. A target is
/// eligible for compilation once both are at or below zero.
#[derive(Debug, Clone)]
pub struct CompilationProfile {
    settings: ProfileSettings,
    /// Remaining interpreter calls
    call_count: i64,
    /// Remaining interpreter calls plus loop iterations
    call_and_loop_count: i64,
    call_threshold: i64,
    call_and_loop_threshold: i64,
    invalidation_count: u32,
    replace_count: u32,
    total_calls: u64,
    total_loop_iterations: u64,
    compilation_attempts: u32,
    previous_timestamp: Instant,
    cooldown_until: Option<Instant>,
    compilation_failed: bool,
}

impl CompilationProfile {
    /// Create a profile with the session thresholds
    pub fn new(settings: ProfileSettings) -> Self {
        Self::started_at(settings, Instant::now())
    }

    /// Create a profile whose decision clock starts at `now`
    pub fn started_at(settings: ProfileSettings, now: Instant) -> Self {
        Self {
            settings,
            call_count: settings.call_threshold,
            call_and_loop_count: settings.call_and_loop_threshold,
            call_threshold: settings.call_threshold,
            call_and_loop_threshold: settings.call_and_loop_threshold,
            invalidation_count: 0,
            replace_count: 0,
            total_calls: 0,
            total_loop_iterations: 0,
            compilation_attempts: 0,
            previous_timestamp: now,
            cooldown_until: None,
            compilation_failed: false,
        }
    }

    /// Record one interpreted call
    pub fn report_interpreter_call(&mut self) {
        self.call_count = self.call_count.saturating_sub(1);
        self.call_and_loop_count = self.call_and_loop_count.saturating_sub(1);
        self.total_calls = self.total_calls.saturating_add(1);
    }

    /// Record `iterations` loop iterations inside an interpreted call.
    ///
    /// The call-and-loop counter is floored at zero.
    pub fn report_loop_count(&mut self, iterations: u64) {
        self.total_loop_iterations = self.total_loop_iterations.saturating_add(iterations);
        if self.call_and_loop_count > 0 {
            let step = i64::try_from(iterations).unwrap_or(i64::MAX);
            self.call_and_loop_count = self.call_and_loop_count.saturating_sub(step).max(0);
        }
    }

    /// Record that compiled code for this target was discarded
    pub fn report_invalidated(&mut self) {
        self.invalidation_count += 1;
        let reprofile = self.settings.invalidation_reprofile;
        self.ensure_profiling(reprofile, reprofile);
        if self.settings.function_inlining {
            self.call_and_loop_threshold = self.call_and_loop_threshold.saturating_add(reprofile);
        }
    }

    /// Record that a node in this target's tree was rewritten
    pub fn report_node_replaced(&mut self) {
        self.replace_count += 1;
        self.call_and_loop_count = self.call_and_loop_count.max(self.settings.replace_reprofile);
    }

    /// Raise the counters so at least `calls` and `calls_and_loops` more
    /// events are needed. Never lowers a counter.
    fn ensure_profiling(&mut self, calls: i64, calls_and_loops: i64) {
        self.call_count = self.call_count.max(calls);
        self.call_and_loop_count = self.call_and_loop_count.max(calls_and_loops);
    }

    /// Restore both counters to the current thresholds
    pub fn reset(&mut self, now: Instant) {
        self.ensure_profiling(self.call_threshold, self.call_and_loop_threshold);
        self.previous_timestamp = now;
    }

    /// Both counters are exhausted
    pub fn is_exhausted(&self) -> bool {
        self.call_count <= 0 && self.call_and_loop_count <= 0
    }

    /// Remember when the last compilation decision was taken
    pub fn mark_decision(&mut self, now: Instant) {
        self.previous_timestamp = now;
    }

    pub(crate) fn report_compilation_started(&mut self) {
        self.compilation_attempts += 1;
    }

    /// Record a backend failure.
    ///
    /// Permanent failures disable compilation of this target; others keep it
    /// ineligible until `cooldown` has passed.
    pub fn report_compilation_failed(&mut self, now: Instant, cooldown: Duration, permanent: bool) {
        if permanent {
            self.compilation_failed = true;
        }
        self.cooldown_until = Some(now + cooldown);
    }

    pub fn is_cooling_down(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    pub fn compilation_failed(&self) -> bool {
        self.compilation_failed
    }

    pub fn call_count(&self) -> i64 {
        self.call_count
    }

    pub fn call_and_loop_count(&self) -> i64 {
        self.call_and_loop_count
    }

    pub fn call_threshold(&self) -> i64 {
        self.call_threshold
    }

    pub fn call_and_loop_threshold(&self) -> i64 {
        self.call_and_loop_threshold
    }

    pub fn invalidation_count(&self) -> u32 {
        self.invalidation_count
    }

    pub fn replace_count(&self) -> u32 {
        self.replace_count
    }

    /// Interpreted calls since the target was created
    pub fn total_calls(&self) -> u64 {
        self.total_calls
    }

    pub fn total_loop_iterations(&self) -> u64 {
        self.total_loop_iterations
    }

    pub fn compilation_attempts(&self) -> u32 {
        self.compilation_attempts
    }

    pub fn previous_timestamp(&self) -> Instant {
        self.previous_timestamp
    }

    pub fn snapshot(&self) -> ProfileSnapshot {
        ProfileSnapshot {
            calls: format!("{}/{}", self.call_count, self.call_threshold),
            calls_and_loops: format!("{}/{}", self.call_and_loop_count, self.call_and_loop_threshold),
            total_calls: self.total_calls,
            total_loop_iterations: self.total_loop_iterations,
            invalidations: self.invalidation_count,
            replaces: self.replace_count,
            compilation_attempts: self.compilation_attempts,
            compilation_failed: self.compilation_failed,
        }
    }
}

/// Serializable view of a profile for dumps
#[derive(Debug, Clone, Serialize)]
pub struct ProfileSnapshot {
    /// Remaining calls over the call threshold
    pub calls: String,
    /// Remaining calls and loops over the call-and-loop threshold
    pub calls_and_loops: String,
    pub total_calls: u64,
    pub total_loop_iterations: u64,
    pub invalidations: u32,
    pub replaces: u32,
    pub compilation_attempts: u32,
    pub compilation_failed: bool,
}
