//! Call-site splitting
//!
//! A call site that keeps seeing argument shapes other callers do not gets a
//! private copy of its target so the copy can specialize on its own. The
//! shape-driven strategy keys variants by the site's running argument stamp
//! and re-resolves whenever the stamp widens; the eager strategy splits once
//! on a structural heuristic.

use crate::graph::CallGraph;
use ember_core::{CallSiteId, EngineOptions, Result, Stamp, TargetId, Value};

/// Why a site that qualified for evaluation was left alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// The callee is the caller's own tree or a split of it
    Recursive,
    /// The callee is larger than `splitting-max-callee-size`
    TooLarge,
    /// The callee has several calls and none of them is polymorphic
    Monomorphic,
}

/// What a splitting check did to the call site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitOutcome {
    /// Below the start threshold, inlined, or splitting disabled
    NotEvaluated,
    /// The current target still matches
    Unchanged,
    /// The site went back to its original target
    Unsplit,
    /// The site's own variant was re-specialized in place
    Rekeyed,
    /// The site moved to an existing variant
    Reused,
    /// A new variant was cloned for the site
    Created,
    Suppressed(SuppressReason),
}

/// Result of [`SplittingStrategy::before_call`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitResolution {
    pub outcome: SplitOutcome,
    /// Target the site dispatches to after the check
    pub target: TargetId,
    /// Target the site dispatched to before the check
    pub previous: TargetId,
    /// Variants reclaimed because they lost their last caller
    pub reclaimed: Vec<TargetId>,
}

impl SplitResolution {
    fn unchanged(outcome: SplitOutcome, target: TargetId) -> Self {
        Self {
            outcome,
            target,
            previous: target,
            reclaimed: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SplittingStrategy {
    pub enabled: bool,
    pub shape_tracking: bool,
    pub start_call_count: u64,
    pub max_callee_size: usize,
    pub aggressive: bool,
}

impl SplittingStrategy {
    pub fn from_options(options: &EngineOptions) -> Self {
        Self {
            enabled: options.splitting_enabled,
            shape_tracking: options.splitting_shape_tracking,
            start_call_count: options.splitting_start_call_count,
            max_callee_size: options.splitting_max_callee_size,
            aggressive: options.splitting_aggressive,
        }
    }

    /// Count one interpreted call through `site` and re-resolve its target
    pub fn before_call(
        &self,
        graph: &mut CallGraph,
        site: CallSiteId,
        args: &[Value],
    ) -> Result<SplitResolution> {
        let call_site = graph.site_mut(site)?;
        call_site.call_count = call_site.call_count.saturating_add(1);
        let current = call_site.current();
        if !self.enabled {
            return Ok(SplitResolution::unchanged(SplitOutcome::NotEvaluated, current));
        }

        if self.shape_tracking {
            let previous_stamp = std::mem::take(&mut call_site.stamp);
            call_site.stamp = previous_stamp.join_arguments(args);
            if call_site.is_inlined() {
                return Ok(SplitResolution::unchanged(SplitOutcome::NotEvaluated, current));
            }
            self.resolve_shape(graph, site, previous_stamp)
        } else {
            if call_site.is_inlined() {
                return Ok(SplitResolution::unchanged(SplitOutcome::NotEvaluated, current));
            }
            self.resolve_eager(graph, site)
        }
    }

    /// Fold a call's result into the return stamp of the target that ran it
    pub fn after_call(&self, graph: &mut CallGraph, site: CallSiteId, result: &Value) -> Result<()> {
        let current = graph.site(site)?.current();
        let target = graph.target_mut(current)?;
        target.return_stamp = target.return_stamp.join_value(result);
        Ok(())
    }

    fn threshold(&self) -> u64 {
        if self.aggressive {
            1
        } else {
            self.start_call_count
        }
    }

    fn suppression(
        &self,
        graph: &CallGraph,
        caller: TargetId,
        original: TargetId,
    ) -> Result<Option<SuppressReason>> {
        if graph.is_same_or_split(caller, original) {
            return Ok(Some(SuppressReason::Recursive));
        }
        if !self.aggressive && graph.target(original)?.node_count() > self.max_callee_size {
            return Ok(Some(SuppressReason::TooLarge));
        }
        Ok(None)
    }

    fn resolve_shape(
        &self,
        graph: &mut CallGraph,
        site: CallSiteId,
        previous_stamp: Stamp,
    ) -> Result<SplitResolution> {
        let call_site = graph.site(site)?;
        let (caller, original, current) = (call_site.caller(), call_site.original(), call_site.current());
        let count = call_site.call_count();
        let stamp = call_site.stamp().clone();

        let threshold = self.threshold();
        if count < threshold {
            return Ok(SplitResolution::unchanged(SplitOutcome::NotEvaluated, current));
        }
        let changed = stamp != previous_stamp;
        let crossed = count == threshold;
        let matches_current = graph.target(current)?.specialization() == &stamp;
        if !changed && !crossed && matches_current {
            return Ok(SplitResolution::unchanged(SplitOutcome::Unchanged, current));
        }

        if let Some(reason) = self.suppression(graph, caller, original)? {
            return Ok(SplitResolution::unchanged(SplitOutcome::Suppressed(reason), current));
        }

        let original_matches =
            stamp.is_unspecialized() || graph.target(original)?.specialization() == &stamp;
        let (outcome, target) = if original_matches {
            (SplitOutcome::Unsplit, original)
        } else if matches_current {
            (SplitOutcome::Unchanged, current)
        } else if self.can_rekey(graph, original, current, &previous_stamp, &stamp)? {
            graph.rekey_variant(current, stamp.clone())?;
            (SplitOutcome::Rekeyed, current)
        } else if let Some(variant) = graph.split_variant(original, &stamp) {
            (SplitOutcome::Reused, variant)
        } else {
            (SplitOutcome::Created, graph.split_for(original, stamp.clone())?)
        };

        let outcome = if target == current && outcome == SplitOutcome::Unsplit {
            SplitOutcome::Unchanged
        } else {
            outcome
        };
        let reclaimed = graph.retarget(site, target)?;
        tracing::debug!(
            "Split check for {} resolved {} -> {} ({:?}) for {}",
            site,
            current,
            target,
            outcome,
            stamp
        );
        Ok(SplitResolution {
            outcome,
            target,
            previous: current,
            reclaimed,
        })
    }

    /// The site is the only user of its variant, which was keyed by the
    /// previous stamp, and no variant exists for the new one yet
    fn can_rekey(
        &self,
        graph: &CallGraph,
        original: TargetId,
        current: TargetId,
        previous_stamp: &Stamp,
        stamp: &Stamp,
    ) -> Result<bool> {
        if current == original {
            return Ok(false);
        }
        let variant = graph.target(current)?;
        Ok(variant.split_source() == Some(original)
            && variant.known_call_sites() == 1
            && variant.specialization() == previous_stamp
            && graph.split_variant(original, stamp).is_none())
    }

    fn resolve_eager(&self, graph: &mut CallGraph, site: CallSiteId) -> Result<SplitResolution> {
        let call_site = graph.site(site)?;
        let (caller, original, current) = (call_site.caller(), call_site.original(), call_site.current());
        let trigger = if self.aggressive { 1 } else { 2 };
        if call_site.is_split() || call_site.call_count() != trigger {
            return Ok(SplitResolution::unchanged(SplitOutcome::NotEvaluated, current));
        }

        if let Some(reason) = self.suppression(graph, caller, original)? {
            return Ok(SplitResolution::unchanged(SplitOutcome::Suppressed(reason), current));
        }
        if !self.aggressive && !self.worth_splitting(graph, original)? {
            return Ok(SplitResolution::unchanged(
                SplitOutcome::Suppressed(SuppressReason::Monomorphic),
                current,
            ));
        }

        let variant = graph.split_private(original)?;
        let reclaimed = graph.retarget(site, variant)?;
        tracing::debug!("Eagerly split {} of {} into {}", site, original, variant);
        Ok(SplitResolution {
            outcome: SplitOutcome::Created,
            target: variant,
            previous: current,
            reclaimed,
        })
    }

    /// Callee has at most one nested call, or one of its calls is polymorphic
    fn worth_splitting(&self, graph: &CallGraph, callee: TargetId) -> Result<bool> {
        let sites = graph.target(callee)?.call_sites();
        if sites.len() <= 1 {
            return Ok(true);
        }
        for &site in sites {
            if graph.site(site)?.feedback().is_polymorphic() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
