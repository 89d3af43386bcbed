//! Call target registry
//!
//! The registry is the engine's public surface. It owns the call graph for
//! one runtime session, routes execution events into profiles and policies,
//! runs splitting checks on call sites and hands hot targets to the
//! compilation queue. All methods run on the interpreter thread; only the
//! backend runs elsewhere.

use crate::compiler::{
    CompilationOutcome, CompilationQueue, CompilationUnit, CompiledArtifact, CompilerBackend,
    FinishStatus,
};
use crate::events::{EngineEvent, EngineListener};
use crate::graph::{CallGraph, CallSite, CallSiteFeedback, CallTarget};
use crate::inlining::{InliningDecision, InliningPolicy};
use crate::policy::{policy_for, CompilationPolicy, CompileDecision};
use crate::profile::{ProfileSettings, ProfileSnapshot};
use crate::splitting::{SplitOutcome, SplitResolution, SplittingStrategy};
use ember_core::{
    CallSiteId, CompileError, EngineError, EngineOptions, FailureAction, OptionsLoader, Result,
    RootNode, TargetId, Value,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a call through a call site is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// The callee is folded into the caller's compiled code
    Inlined,
    /// The site dispatches to its private variant
    Split,
    /// The site dispatches to the target shared with other callers
    Shared,
}

/// Where a call should go
#[derive(Debug, Clone)]
pub struct CallDispatch {
    pub target: TargetId,
    pub route: Route,
    /// Installed code for `target`; interpret when absent
    pub artifact: Option<Arc<CompiledArtifact>>,
    /// Policy answer, when the call was counted as an interpreted call
    pub decision: Option<CompileDecision>,
}

/// Serializable state of one target for profile dumps
#[derive(Debug, Clone, Serialize)]
pub struct TargetSnapshot {
    pub id: TargetId,
    pub name: String,
    pub node_count: usize,
    pub compiled: bool,
    pub compiling: bool,
    pub known_call_sites: usize,
    pub split_source: Option<TargetId>,
    pub split_variants: Vec<TargetId>,
    pub specialization: String,
    pub return_stamp: String,
    pub profile: ProfileSnapshot,
}

impl TargetSnapshot {
    fn of(target: &CallTarget) -> Self {
        let mut split_variants: Vec<TargetId> = target
            .split_variants()
            .values()
            .chain(target.private_variants())
            .copied()
            .collect();
        split_variants.sort();
        Self {
            id: target.id(),
            name: target.name().to_string(),
            node_count: target.node_count(),
            compiled: target.is_valid(),
            compiling: target.compilation().is_compiling(),
            known_call_sites: target.known_call_sites(),
            split_source: target.split_source(),
            split_variants,
            specialization: target.specialization().to_string(),
            return_stamp: target.return_stamp().to_string(),
            profile: target.profile().snapshot(),
        }
    }
}

/// Session-scoped owner of every call target
pub struct CallTargetRegistry {
    options: EngineOptions,
    graph: CallGraph,
    policy: Box<dyn CompilationPolicy>,
    inlining: InliningPolicy,
    splitting: SplittingStrategy,
    queue: CompilationQueue,
    listener: Option<Arc<dyn EngineListener>>,
}

impl CallTargetRegistry {
    /// Start a session with validated options
    pub fn new(options: EngineOptions, backend: Arc<dyn CompilerBackend>) -> Result<Self> {
        OptionsLoader::new().validate(&options)?;
        let queue = CompilationQueue::new(backend, options.compiler_threads, options.compile_timeout())?;

        tracing::info!(
            "Starting engine: {:?} policy, {} compiler threads, background: {}",
            options.compilation_policy,
            options.compiler_threads,
            options.background_compilation
        );

        Ok(Self {
            graph: CallGraph::new(ProfileSettings::from_options(&options)),
            policy: policy_for(&options),
            inlining: InliningPolicy::from_options(&options),
            splitting: SplittingStrategy::from_options(&options),
            queue,
            listener: None,
            options,
        })
    }

    /// Deliver engine events to `listener`
    pub fn with_listener(mut self, listener: Arc<dyn EngineListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn graph(&self) -> &CallGraph {
        &self.graph
    }

    pub fn target(&self, id: TargetId) -> Result<&CallTarget> {
        self.graph.target(id)
    }

    pub fn call_site(&self, id: CallSiteId) -> Result<&CallSite> {
        self.graph.site(id)
    }

    fn emit(&self, event: EngineEvent) {
        event.log();
        if let Some(listener) = &self.listener {
            listener.on_event(&event);
        }
    }

    fn name_of(&self, target: TargetId) -> String {
        self.graph
            .get_target(target)
            .map(|t| t.name().to_string())
            .unwrap_or_else(|| target.to_string())
    }

    pub fn register_target(&mut self, root: Arc<dyn RootNode>) -> TargetId {
        let id = self.graph.add_target(root);
        tracing::debug!("Registered {} as {}", self.name_of(id), id);
        id
    }

    /// Register a call site in `caller`'s tree; sites are kept in registration order
    pub fn add_call_site(&mut self, caller: TargetId, callee: TargetId) -> Result<CallSiteId> {
        self.graph.add_call_site(caller, callee)
    }

    /// Drop a target the host no longer references
    pub fn unregister_target(&mut self, id: TargetId) -> Result<()> {
        let reclaimed = self.graph.remove_target(id)?;
        for target in reclaimed {
            self.emit(EngineEvent::VariantReclaimed { target });
        }
        Ok(())
    }

    /// Count one interpreted call of `target`
    pub fn report_interpreter_call(&mut self, target: TargetId) -> Result<CompileDecision> {
        self.graph.target_mut(target)?.profile.report_interpreter_call();
        self.maybe_compile(target, false)
    }

    /// Count loop iterations run by an interpreted call of `target`
    pub fn report_loop_count(&mut self, target: TargetId, iterations: u64) -> Result<CompileDecision> {
        self.graph.target_mut(target)?.profile.report_loop_count(iterations);
        self.maybe_compile(target, false)
    }

    /// A node of `target`'s tree was rewritten; its code and every unit it
    /// was inlined into are discarded
    pub fn report_node_replaced(&mut self, target: TargetId) -> Result<()> {
        self.graph.target_mut(target)?.profile.report_node_replaced();
        self.invalidate(target, "node replaced")?;
        Ok(())
    }

    /// Discard `target`'s compiled code after a failed assumption, along with
    /// every unit it was inlined into.
    ///
    /// Returns whether any code was installed or a compilation was running.
    pub fn report_invalidated(&mut self, target: TargetId, reason: &str) -> Result<bool> {
        self.invalidate(target, reason)
    }

    fn invalidate(&mut self, target: TargetId, reason: &str) -> Result<bool> {
        let dependents: Vec<TargetId> = self.graph.target_mut(target)?.dependents.drain().collect();
        let mut invalidated = self.invalidate_code(target, reason)?;
        for dependent in dependents {
            if self.graph.get_target(dependent).is_some() {
                let reason = format!("inlined {} was invalidated", target);
                invalidated |= self.invalidate_code(dependent, &reason)?;
            }
        }
        Ok(invalidated)
    }

    fn invalidate_code(&mut self, target: TargetId, reason: &str) -> Result<bool> {
        let t = self.graph.target_mut(target)?;
        if !t.compilation().invalidate() {
            return Ok(false);
        }
        t.profile.report_invalidated();
        let name = t.name().to_string();
        self.unlink_callees(target);
        self.graph.reset_inlining(target)?;
        self.emit(EngineEvent::Invalidated {
            target,
            name,
            reason: reason.to_string(),
        });
        Ok(true)
    }

    /// Splitting check for one interpreted call through `site`
    pub fn before_call(&mut self, site: CallSiteId, args: &[Value]) -> Result<SplitResolution> {
        let resolution = self.splitting.before_call(&mut self.graph, site, args)?;
        let (from, to) = (resolution.previous, resolution.target);
        match resolution.outcome {
            SplitOutcome::Created | SplitOutcome::Reused => self.emit(EngineEvent::Split {
                site,
                from,
                to,
                created: resolution.outcome == SplitOutcome::Created,
            }),
            SplitOutcome::Unsplit => self.emit(EngineEvent::Unsplit { site, from, to }),
            SplitOutcome::Rekeyed => {
                self.invalidate(to, "re-specialized for a new argument shape")?;
                self.emit(EngineEvent::Respecialized { site, target: to });
            }
            _ => {}
        }
        for &target in &resolution.reclaimed {
            self.emit(EngineEvent::VariantReclaimed { target });
        }
        Ok(resolution)
    }

    /// Profile the value returned through `site`
    pub fn after_call(&mut self, site: CallSiteId, result: &Value) -> Result<()> {
        self.splitting.after_call(&mut self.graph, site, result)
    }

    /// Resolve a call through `site`, counting it where it is interpreted.
    ///
    /// Inlined sites only skip profiling while their caller's code is
    /// installed.
    pub fn call(&mut self, site: CallSiteId, args: &[Value]) -> Result<CallDispatch> {
        let resolution = self.before_call(site, args)?;
        let call_site = self.graph.site(site)?;
        let caller_compiled = self.graph.target(call_site.caller())?.is_valid();
        let route = if call_site.is_inlined() && caller_compiled {
            Route::Inlined
        } else if call_site.is_split() {
            Route::Split
        } else {
            Route::Shared
        };
        if route == Route::Inlined {
            return Ok(CallDispatch {
                target: resolution.target,
                route,
                artifact: None,
                decision: None,
            });
        }
        self.dispatch(resolution.target, route, false)
    }

    /// Resolve a top-level call of `target`
    pub fn call_root(&mut self, target: TargetId) -> Result<CallDispatch> {
        self.dispatch(target, Route::Shared, true)
    }

    fn dispatch(&mut self, target: TargetId, route: Route, root: bool) -> Result<CallDispatch> {
        if let Some(artifact) = self.graph.target(target)?.compilation().artifact() {
            return Ok(CallDispatch {
                target,
                route,
                artifact: Some(artifact),
                decision: None,
            });
        }
        self.graph.target_mut(target)?.profile.report_interpreter_call();
        let decision = self.maybe_compile(target, root)?;
        Ok(CallDispatch {
            target,
            route,
            artifact: self.graph.target(target)?.compilation().artifact(),
            decision: Some(decision),
        })
    }

    /// Let the next compilation that reaches `site` inline it past the size
    /// cap and frequency cutoff
    pub fn force_inlining(&mut self, site: CallSiteId) -> Result<()> {
        self.graph.site_mut(site)?.forced = true;
        Ok(())
    }

    pub fn report_call_site_feedback(&mut self, site: CallSiteId, feedback: CallSiteFeedback) -> Result<()> {
        self.graph.site_mut(site)?.feedback = feedback;
        Ok(())
    }

    fn maybe_compile(&mut self, target: TargetId, root: bool) -> Result<CompileDecision> {
        self.poll_compilations()?;
        let now = Instant::now();
        let t = self.graph.target_mut(target)?;
        let slot = t.compilation();
        if slot.is_valid() || slot.is_compiling() {
            return Ok(CompileDecision::InProgress);
        }
        // finished on a worker but not drained yet
        if slot.has_pending_failure() {
            return Ok(CompileDecision::CoolingDown);
        }

        let decision = self.policy.should_compile(&mut t.profile, now);
        match decision {
            CompileDecision::Compile => {
                let first = t.profile.compilation_attempts() == 0;
                let blocking = root && first && self.options.synchronous_compilation;
                self.submit(target, blocking)?;
            }
            CompileDecision::Deferred => {
                let name = t.name().to_string();
                self.emit(EngineEvent::CompilationDeferred { target, name });
            }
            _ => {}
        }
        Ok(decision)
    }

    /// Compile `target` now on the calling thread, bypassing the policy
    pub fn compile(&mut self, target: TargetId) -> Result<Option<Arc<CompiledArtifact>>> {
        let slot = Arc::clone(self.graph.target(target)?.compilation());
        self.poll_compilations()?;
        if slot.is_valid() || slot.is_compiling() {
            return Ok(slot.artifact());
        }
        self.submit(target, true)?;
        Ok(slot.artifact())
    }

    /// Inlining decision `target` would be compiled with, without applying it
    pub fn decide_inlining(&self, target: TargetId) -> Result<InliningDecision> {
        self.inlining.decide(&self.graph, target)
    }

    /// Start compiling `target`.
    ///
    /// The inlining decision is applied to call sites only once the code is
    /// installed, but callees learn of the unit right away so that changes
    /// to them cancel it.
    fn submit(&mut self, target: TargetId, blocking: bool) -> Result<()> {
        let decision = Arc::new(self.inlining.decide(&self.graph, target)?);
        self.emit(EngineEvent::InliningDecided {
            target,
            accepted: decision.accepted_count(),
            rejected: decision.rejected_count(),
            total_node_count: decision.total_node_count(),
        });

        let t = self.graph.target_mut(target)?;
        let slot = Arc::clone(t.compilation());
        let Some((generation, token)) = slot.begin() else {
            return Ok(());
        };
        t.profile.report_compilation_started();
        let callees = decision.inlined_targets();
        t.inlined_callees = callees.iter().copied().collect();
        for &callee in &callees {
            if let Ok(c) = self.graph.target_mut(callee) {
                c.dependents.insert(target);
            }
        }

        let t = self.graph.target(target)?;
        let unit = CompilationUnit {
            target,
            name: t.name().to_string(),
            root: Arc::clone(t.root()),
            inlining: decision,
            generation,
        };

        let background = self.options.background_compilation && !blocking;
        self.emit(EngineEvent::CompilationQueued {
            target,
            name: unit.name.clone(),
            background,
        });
        if background {
            self.queue.submit(unit, slot, token);
            Ok(())
        } else {
            let outcome = self.queue.compile_blocking(unit, slot, token);
            self.handle_outcome(outcome)
        }
    }

    /// Apply finished background compilations.
    ///
    /// Every outcome is processed; the first failure escalated by
    /// `compilation-failure-action: throw` is returned afterwards.
    pub fn poll_compilations(&mut self) -> Result<usize> {
        let outcomes = self.queue.drain();
        let count = outcomes.len();
        let mut first_error = None;
        for outcome in outcomes {
            if let Err(err) = self.handle_outcome(outcome) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }

    /// Wait up to `limit` for background compilations, then apply them.
    ///
    /// Returns `false` if some were still running.
    pub fn wait_for_compilations(&mut self, limit: Duration) -> Result<bool> {
        let idle = self.queue.wait_idle(limit);
        self.poll_compilations()?;
        Ok(idle)
    }

    pub fn pending_compilations(&self) -> usize {
        self.queue.pending()
    }

    /// Drop `target` from the dependents of everything its unit inlined
    fn unlink_callees(&mut self, target: TargetId) {
        let Ok(t) = self.graph.target_mut(target) else {
            return;
        };
        let callees: Vec<TargetId> = t.inlined_callees.drain().collect();
        for callee in callees {
            if let Ok(c) = self.graph.target_mut(callee) {
                c.dependents.remove(&target);
            }
        }
    }

    fn handle_outcome(&mut self, outcome: CompilationOutcome) -> Result<()> {
        let target = outcome.target;
        let name = self.name_of(target);
        if outcome.status == FinishStatus::Failed {
            if let Some(t) = self.graph.get_target(target) {
                t.compilation().acknowledge_failure();
            }
            self.unlink_callees(target);
        }
        match (outcome.status, outcome.result) {
            (FinishStatus::Installed, Ok(artifact)) => {
                // invalidated between installation and this drain
                let current = self
                    .graph
                    .get_target(target)
                    .is_some_and(|t| t.compilation().generation() == outcome.generation);
                if current {
                    outcome.inlining.apply(&mut self.graph);
                }
                self.emit(EngineEvent::CompilationSucceeded {
                    target,
                    name,
                    code_size: artifact.code_size,
                    inlined_call_sites: artifact.inlined_call_sites,
                    elapsed: outcome.elapsed,
                });
                Ok(())
            }
            (FinishStatus::Stale, result) => {
                let reason = match result {
                    Ok(_) => "target invalidated during compilation".to_string(),
                    Err(err) => err.to_string(),
                };
                self.emit(EngineEvent::CompilationDequeued { target, name, reason });
                Ok(())
            }
            (_, Err(CompileError::Cancelled(reason))) => {
                self.emit(EngineEvent::CompilationDequeued { target, name, reason });
                Ok(())
            }
            (_, Err(err)) => self.compilation_failed(target, name, err),
            (_, Ok(_)) => Err(EngineError::InvariantViolated(format!(
                "compilation of {} succeeded without installing",
                target
            ))),
        }
    }

    fn compilation_failed(&mut self, target: TargetId, name: String, err: CompileError) -> Result<()> {
        let permanent = err.is_permanent();
        let cooldown = self.options.failure_cooldown();
        if let Ok(t) = self.graph.target_mut(target) {
            t.profile.report_compilation_failed(Instant::now(), cooldown, permanent);
        }
        self.emit(EngineEvent::CompilationFailed {
            target,
            name: name.clone(),
            reason: err.to_string(),
            permanent,
        });

        // retryable bail-outs only cool down
        if err.is_bailout() && !permanent {
            return Ok(());
        }
        match self.options.compilation_failure_action {
            FailureAction::Silent => Ok(()),
            FailureAction::Print => {
                tracing::warn!("Compilation of {} ({}) failed: {}", name, target, err);
                Ok(())
            }
            FailureAction::Throw => Err(EngineError::Compilation {
                target: name,
                source: err,
            }),
            FailureAction::Exit => {
                tracing::error!("Compilation of {} ({}) failed, exiting: {}", name, target, err);
                std::process::exit(-1)
            }
        }
    }

    pub fn profile_snapshot(&self) -> Vec<TargetSnapshot> {
        self.graph.targets().map(TargetSnapshot::of).collect()
    }

    pub fn dump_profiles_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.profile_snapshot())?)
    }

    pub fn verify_call_site_counts(&self) -> Result<()> {
        self.graph.verify_call_site_counts()
    }

    /// Stop the compiler threads; outstanding compilations are abandoned
    pub fn shutdown(&mut self) {
        let (submitted, installed, failed, discarded) = self.queue.stats().snapshot();
        tracing::info!(
            "Stopping engine: {} compilations submitted, {} installed, {} failed, {} discarded",
            submitted,
            installed,
            failed,
            discarded
        );
        self.queue.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingListener, ScriptedBackend, TestTree};
    use ember_core::PolicyKind;

    const WAIT: Duration = Duration::from_secs(5);

    fn blocking() -> EngineOptions {
        EngineOptions {
            background_compilation: false,
            ..EngineOptions::eager()
        }
    }

    fn registry(
        options: EngineOptions,
        backend: Arc<ScriptedBackend>,
    ) -> (CallTargetRegistry, Arc<RecordingListener>) {
        let listener = RecordingListener::new();
        let registry = CallTargetRegistry::new(options, backend)
            .unwrap()
            .with_listener(listener.clone());
        (registry, listener)
    }

    #[test]
    fn test_compiles_on_tenth_call() {
        let (mut reg, events) = registry(blocking(), ScriptedBackend::succeeding());
        let t = reg.register_target(TestTree::new("hot", 12));

        for _ in 0..9 {
            assert_eq!(reg.report_interpreter_call(t).unwrap(), CompileDecision::NotReady);
        }
        assert_eq!(reg.report_interpreter_call(t).unwrap(), CompileDecision::Compile);
        assert!(reg.target(t).unwrap().is_valid());
        assert_eq!(reg.report_interpreter_call(t).unwrap(), CompileDecision::InProgress);
        assert_eq!(
            events.count(|e| matches!(e, EngineEvent::CompilationSucceeded { .. })),
            1
        );
    }

    #[test]
    fn test_loop_counts_complete_the_threshold() {
        let (mut reg, _) = registry(blocking(), ScriptedBackend::succeeding());
        let t = reg.register_target(TestTree::new("loop", 12));
        for _ in 0..3 {
            reg.report_interpreter_call(t).unwrap();
        }
        assert_eq!(reg.report_loop_count(t, 100).unwrap(), CompileDecision::Compile);
    }

    #[test]
    fn test_background_compilation() {
        let backend = ScriptedBackend::succeeding();
        let (mut reg, events) = registry(EngineOptions::eager(), backend.clone());
        let t = reg.register_target(TestTree::new("bg", 12));

        for _ in 0..10 {
            reg.report_interpreter_call(t).unwrap();
        }
        assert!(reg.wait_for_compilations(WAIT).unwrap());
        assert!(reg.target(t).unwrap().is_valid());
        assert_eq!(backend.calls(), 1);
        assert_eq!(reg.pending_compilations(), 0);
        assert!(matches!(
            events.events().first(),
            Some(EngineEvent::InliningDecided { .. })
        ));
        assert_eq!(
            events.count(|e| matches!(e, EngineEvent::CompilationQueued { background: true, .. })),
            1
        );
    }

    #[test]
    fn test_invalidation_during_compilation_discards_result() {
        let backend = ScriptedBackend::gated();
        let (mut reg, events) = registry(EngineOptions::eager(), backend.clone());
        let t = reg.register_target(TestTree::new("racy", 12));

        for _ in 0..10 {
            reg.report_interpreter_call(t).unwrap();
        }
        assert_eq!(reg.report_interpreter_call(t).unwrap(), CompileDecision::InProgress);
        assert!(reg.report_invalidated(t, "assumption failed").unwrap());
        backend.open();
        assert!(reg.wait_for_compilations(WAIT).unwrap());

        assert!(!reg.target(t).unwrap().is_valid());
        assert_eq!(
            events.count(|e| matches!(e, EngineEvent::CompilationDequeued { .. })),
            1
        );
        let profile = reg.target(t).unwrap().profile();
        assert_eq!(profile.invalidation_count(), 1);
        assert_eq!(profile.call_count(), 3);

        // reprofiled: three more calls make it hot again
        for _ in 0..2 {
            assert_eq!(reg.report_interpreter_call(t).unwrap(), CompileDecision::NotReady);
        }
        assert_eq!(reg.report_interpreter_call(t).unwrap(), CompileDecision::Compile);
        assert!(reg.wait_for_compilations(WAIT).unwrap());
        assert!(reg.target(t).unwrap().is_valid());
    }

    #[test]
    fn test_invalidating_interpreted_target_is_a_no_op() {
        let (mut reg, events) = registry(blocking(), ScriptedBackend::succeeding());
        let t = reg.register_target(TestTree::new("cold", 12));
        assert!(!reg.report_invalidated(t, "nothing to drop").unwrap());
        assert_eq!(reg.target(t).unwrap().profile().invalidation_count(), 0);
        assert!(events.events().is_empty());
    }

    #[test]
    fn test_failure_cooldown_and_throw() {
        let options = EngineOptions {
            compilation_failure_action: FailureAction::Throw,
            ..blocking()
        };
        let backend = ScriptedBackend::failing(CompileError::Fatal("register allocation".into()));
        backend.push(Err(CompileError::bailout("unsupported node")));
        let (mut reg, events) = registry(options, backend);
        let bailing = reg.register_target(TestTree::new("bailing", 12));
        let fatal = reg.register_target(TestTree::new("fatal", 12));

        // first compilation bails out: cool-down only
        for _ in 0..10 {
            reg.report_interpreter_call(bailing).unwrap();
        }
        assert_eq!(reg.report_interpreter_call(bailing).unwrap(), CompileDecision::CoolingDown);

        for _ in 0..9 {
            reg.report_interpreter_call(fatal).unwrap();
        }
        let err = reg.report_interpreter_call(fatal).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Compilation {
                source: CompileError::Fatal(_),
                ..
            }
        ));
        assert_eq!(reg.report_interpreter_call(fatal).unwrap(), CompileDecision::CoolingDown);
        assert_eq!(
            events.count(|e| matches!(e, EngineEvent::CompilationFailed { .. })),
            2
        );
    }

    #[test]
    fn test_permanent_bailout_disables_target() {
        let options = EngineOptions {
            compilation_failure_cooldown: 0,
            ..blocking()
        };
        let (mut reg, _) = registry(options, ScriptedBackend::failing(CompileError::permanent_bailout("too deep")));
        let t = reg.register_target(TestTree::new("doomed", 12));
        for _ in 0..10 {
            reg.report_interpreter_call(t).unwrap();
        }
        assert_eq!(reg.report_interpreter_call(t).unwrap(), CompileDecision::Disabled);
        assert!(reg.target(t).unwrap().profile().compilation_failed());
    }

    #[test]
    fn test_timed_out_compilation_cools_down() {
        let options = EngineOptions {
            compile_timeout: 20,
            ..blocking()
        };
        let (mut reg, events) = registry(options, ScriptedBackend::slow(WAIT));
        let t = reg.register_target(TestTree::new("slow", 12));
        for _ in 0..10 {
            reg.report_interpreter_call(t).unwrap();
        }
        assert!(!reg.target(t).unwrap().is_valid());
        assert_eq!(reg.report_interpreter_call(t).unwrap(), CompileDecision::CoolingDown);
        assert_eq!(
            events.count(|e| matches!(e, EngineEvent::CompilationFailed { permanent: false, .. })),
            1
        );
    }

    #[test]
    fn test_timestamped_policy_emits_deferred_event() {
        let options = EngineOptions {
            compilation_policy: PolicyKind::Timestamped,
            time_threshold: 60_000,
            ..blocking()
        };
        let (mut reg, events) = registry(options, ScriptedBackend::succeeding());
        let t = reg.register_target(TestTree::new("fast-loop", 12));

        for _ in 0..9 {
            reg.report_interpreter_call(t).unwrap();
        }
        assert_eq!(reg.report_interpreter_call(t).unwrap(), CompileDecision::Deferred);
        assert_eq!(
            events.count(|e| matches!(e, EngineEvent::CompilationDeferred { .. })),
            1
        );
        assert!(!reg.target(t).unwrap().is_valid());
        assert_eq!(reg.target(t).unwrap().profile().call_and_loop_count(), 10);
    }

    #[test]
    fn test_split_sites_dispatch_to_distinct_variants() {
        let (mut reg, events) = registry(blocking(), ScriptedBackend::succeeding());
        let main = reg.register_target(TestTree::new("main", 40));
        let t = reg.register_target(TestTree::new("sum", 20));
        let ints = reg.add_call_site(main, t).unwrap();
        let floats = reg.add_call_site(main, t).unwrap();

        let mut last = None;
        for i in 0..4 {
            let a = reg.call(ints, &[Value::Array(vec![Value::Int(i)])]).unwrap();
            let b = reg
                .call(floats, &[Value::Array(vec![Value::Float(i as f64 * 0.5)])])
                .unwrap();
            last = Some((a, b));
        }
        let (a, b) = last.unwrap();
        assert_eq!(a.route, Route::Split);
        assert_eq!(b.route, Route::Split);
        assert_ne!(a.target, b.target);
        assert_eq!(reg.target(t).unwrap().split_variants().len(), 2);
        assert_eq!(
            events.count(|e| matches!(e, EngineEvent::Split { created: true, .. })),
            2
        );
        reg.verify_call_site_counts().unwrap();

        // calls before the split were counted on the shared target
        assert_eq!(reg.target(t).unwrap().profile().total_calls(), 4);
        assert_eq!(reg.target(a.target).unwrap().profile().total_calls(), 2);
    }

    #[test]
    fn test_node_replacement_invalidates_inlining_callers() {
        let options = EngineOptions {
            splitting_enabled: false,
            ..blocking()
        };
        let (mut reg, events) = registry(options, ScriptedBackend::succeeding());
        let main = reg.register_target(TestTree::new("main", 40));
        let leaf = reg.register_target(TestTree::new("leaf", 5));
        let site = reg.add_call_site(main, leaf).unwrap();
        for _ in 0..5 {
            reg.call(site, &[]).unwrap();
        }
        assert!(reg.compile(main).unwrap().is_some());
        assert!(reg.call_site(site).unwrap().is_inlined());
        assert_eq!(reg.call(site, &[]).unwrap().route, Route::Inlined);

        reg.report_node_replaced(leaf).unwrap();
        assert!(!reg.target(main).unwrap().is_valid());
        assert!(!reg.call_site(site).unwrap().is_inlined());
        assert_eq!(reg.target(main).unwrap().profile().invalidation_count(), 1);
        assert_eq!(reg.target(leaf).unwrap().profile().replace_count(), 1);
        assert_eq!(
            events.count(|e| matches!(e, EngineEvent::Invalidated { target, .. } if *target == main)),
            1
        );
    }

    #[test]
    fn test_background_failure_cools_down_without_polling() {
        let options = EngineOptions {
            compilation_failure_cooldown: 60_000,
            ..EngineOptions::eager()
        };
        let backend = ScriptedBackend::failing(CompileError::bailout("unsupported node"));
        let (mut reg, events) = registry(options, backend.clone());
        let t = reg.register_target(TestTree::new("bailing", 12));

        for _ in 0..10 {
            reg.report_interpreter_call(t).unwrap();
        }
        assert!(reg.queue.wait_idle(WAIT));
        let slot = Arc::clone(reg.target(t).unwrap().compilation());
        assert!(!slot.is_compiling());
        assert!(slot.has_pending_failure());

        for _ in 0..30 {
            assert_eq!(reg.report_interpreter_call(t).unwrap(), CompileDecision::CoolingDown);
        }
        assert!(!slot.has_pending_failure());
        assert_eq!(backend.calls(), 1);
        assert_eq!(
            events.count(|e| matches!(e, EngineEvent::CompilationQueued { .. })),
            1
        );
    }

    #[test]
    fn test_failed_compilation_leaves_call_sites_interpreted() {
        let options = EngineOptions {
            splitting_enabled: false,
            ..blocking()
        };
        let (mut reg, _) = registry(options, ScriptedBackend::failing(CompileError::permanent_bailout("too deep")));
        let main = reg.register_target(TestTree::new("main", 40));
        let leaf = reg.register_target(TestTree::new("leaf", 5));
        let site = reg.add_call_site(main, leaf).unwrap();
        for _ in 0..5 {
            reg.call(site, &[]).unwrap();
        }
        assert!(reg.decide_inlining(main).unwrap().find(site).unwrap().is_inlined());

        assert!(reg.compile(main).unwrap().is_none());
        assert!(reg.target(main).unwrap().profile().compilation_failed());
        assert!(!reg.call_site(site).unwrap().is_inlined());
        assert!(reg.target(leaf).unwrap().dependents.is_empty());
        assert!(reg.target(main).unwrap().inlined_callees.is_empty());

        let dispatch = reg.call(site, &[]).unwrap();
        assert_eq!(dispatch.route, Route::Shared);
        assert_eq!(reg.target(leaf).unwrap().profile().total_calls(), 6);
    }

    #[test]
    fn test_inlined_sites_are_profiled_until_caller_is_installed() {
        let options = EngineOptions {
            splitting_enabled: false,
            ..EngineOptions::eager()
        };
        let backend = ScriptedBackend::gated();
        let (mut reg, _) = registry(options, backend.clone());
        let main = reg.register_target(TestTree::new("main", 40));
        let leaf = reg.register_target(TestTree::new("leaf", 5));
        let site = reg.add_call_site(main, leaf).unwrap();
        for _ in 0..5 {
            reg.call(site, &[]).unwrap();
        }
        for _ in 0..10 {
            reg.report_interpreter_call(main).unwrap();
        }
        assert!(reg.target(main).unwrap().compilation().is_compiling());

        // queued but not installed: still interpreted
        for _ in 0..3 {
            assert_eq!(reg.call(site, &[]).unwrap().route, Route::Shared);
        }
        assert!(!reg.call_site(site).unwrap().is_inlined());
        assert_eq!(reg.target(leaf).unwrap().profile().total_calls(), 8);

        backend.open();
        assert!(reg.wait_for_compilations(WAIT).unwrap());
        assert!(reg.target(main).unwrap().is_valid());
        assert!(reg.call_site(site).unwrap().is_inlined());
        assert_eq!(reg.call(site, &[]).unwrap().route, Route::Inlined);
        assert_eq!(reg.target(leaf).unwrap().profile().total_calls(), 8);
    }

    #[test]
    fn test_split_sites_are_never_inlined() {
        let (mut reg, _) = registry(blocking(), ScriptedBackend::succeeding());
        let main = reg.register_target(TestTree::new("main", 40));
        let t = reg.register_target(TestTree::new("sum", 5));
        let ints = reg.add_call_site(main, t).unwrap();
        let floats = reg.add_call_site(main, t).unwrap();

        let exclusive = |reg: &CallTargetRegistry| reg.graph().sites().all(|s| !(s.is_split() && s.is_inlined()));
        for i in 0..4 {
            reg.call(ints, &[Value::Array(vec![Value::Int(i)])]).unwrap();
            reg.call(floats, &[Value::Array(vec![Value::Float(i as f64 * 0.5)])])
                .unwrap();
            assert!(exclusive(&reg));
        }
        assert!(reg.call_site(ints).unwrap().is_split());

        assert!(reg.compile(main).unwrap().is_some());
        assert!(exclusive(&reg));
        assert!(!reg.call_site(ints).unwrap().is_inlined());
        assert_eq!(
            reg.decide_inlining(main).unwrap().find(ints).unwrap().verdict,
            crate::inlining::Verdict::Reject(crate::inlining::RejectReason::Split)
        );

        for i in 0..4 {
            let dispatch = reg.call(floats, &[Value::Array(vec![Value::Float(i as f64)])]).unwrap();
            assert_eq!(dispatch.route, Route::Split);
            assert!(exclusive(&reg));
        }
        reg.verify_call_site_counts().unwrap();
    }

    #[test]
    fn test_assumption_invalidation_reaches_inlining_callers() {
        let options = EngineOptions {
            splitting_enabled: false,
            ..blocking()
        };
        let (mut reg, events) = registry(options, ScriptedBackend::succeeding());
        let main = reg.register_target(TestTree::new("main", 40));
        let leaf = reg.register_target(TestTree::new("leaf", 5));
        let site = reg.add_call_site(main, leaf).unwrap();
        for _ in 0..5 {
            reg.call(site, &[]).unwrap();
        }
        assert!(reg.compile(main).unwrap().is_some());
        assert!(reg.target(leaf).unwrap().dependents.contains(&main));

        // leaf itself runs interpreted; its inlined copy in main is dropped
        assert!(reg.report_invalidated(leaf, "assumption failed").unwrap());
        assert!(!reg.target(main).unwrap().is_valid());
        assert!(!reg.call_site(site).unwrap().is_inlined());
        assert!(reg.target(leaf).unwrap().dependents.is_empty());
        assert!(reg.target(main).unwrap().inlined_callees.is_empty());
        assert_eq!(
            events.count(|e| matches!(e, EngineEvent::Invalidated { target, .. } if *target == main)),
            1
        );
        assert!(!reg.report_invalidated(leaf, "again").unwrap());
    }

    #[test]
    fn test_synchronous_first_root_compilation() {
        let options = EngineOptions {
            synchronous_compilation: true,
            ..EngineOptions::eager()
        };
        let (mut reg, _) = registry(options, ScriptedBackend::succeeding());
        let t = reg.register_target(TestTree::new("entry", 12));

        for _ in 0..9 {
            assert!(reg.call_root(t).unwrap().artifact.is_none());
        }
        let tenth = reg.call_root(t).unwrap();
        assert_eq!(tenth.decision, Some(CompileDecision::Compile));
        assert!(tenth.artifact.is_some());
        let eleventh = reg.call_root(t).unwrap();
        assert!(eleventh.artifact.is_some());
        assert_eq!(eleventh.decision, None);
    }

    #[test]
    fn test_forced_inlining_flag() {
        let (mut reg, _) = registry(blocking(), ScriptedBackend::succeeding());
        let main = reg.register_target(TestTree::new("main", 40));
        let big = reg.register_target(TestTree::new("big", 900));
        let site = reg.add_call_site(main, big).unwrap();

        let before = reg.decide_inlining(main).unwrap();
        assert!(!before.find(site).unwrap().is_inlined());
        reg.force_inlining(site).unwrap();
        let after = reg.decide_inlining(main).unwrap();
        assert!(after.find(site).unwrap().is_inlined());
        assert!(!reg.call_site(site).unwrap().is_inlined(), "decide_inlining does not apply");
    }

    #[test]
    fn test_unregister_target() {
        let (mut reg, _) = registry(blocking(), ScriptedBackend::succeeding());
        let main = reg.register_target(TestTree::new("main", 40));
        let callee = reg.register_target(TestTree::new("callee", 5));
        reg.add_call_site(main, callee).unwrap();

        assert!(matches!(
            reg.unregister_target(callee),
            Err(EngineError::InvariantViolated(_))
        ));
        reg.unregister_target(main).unwrap();
        reg.unregister_target(callee).unwrap();
        assert!(matches!(
            reg.report_interpreter_call(callee),
            Err(EngineError::UnknownTarget(_))
        ));
        assert!(matches!(
            reg.call(CallSiteId(0), &[]),
            Err(EngineError::UnknownCallSite(_))
        ));
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let options = EngineOptions {
            compiler_threads: 0,
            ..EngineOptions::default()
        };
        let result = CallTargetRegistry::new(options, ScriptedBackend::succeeding());
        assert!(matches!(result, Err(EngineError::InvalidOption { .. })));
    }

    #[test]
    fn test_profile_dump() {
        let (mut reg, _) = registry(blocking(), ScriptedBackend::succeeding());
        let main = reg.register_target(TestTree::new("main", 40));
        let t = reg.register_target(TestTree::new("dumped", 20));
        reg.add_call_site(main, t).unwrap();
        reg.report_interpreter_call(t).unwrap();

        let snapshot = reg.profile_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].known_call_sites, 1);
        assert_eq!(snapshot[1].profile.calls, "2/3");

        let json: serde_json::Value = serde_json::from_str(&reg.dump_profiles_json().unwrap()).unwrap();
        assert_eq!(json[1]["name"], "dumped");
        assert_eq!(json[1]["profile"]["calls_and_loops"], "9/10");
        reg.shutdown();
    }
}
