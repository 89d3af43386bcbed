//! Inlining decisions for one compilation unit
//!
//! Exploration walks the call graph from the compiled target, scoring every
//! call site by `frequency / deep node count` and greedily accepting the
//! best candidates into a node budget. Decisions for a target are memoized
//! for the duration of one pass, and targets on the exploration stack are
//! reported as recursive instead of being entered again.

use crate::graph::CallGraph;
use ember_core::{CallSiteId, EngineOptions, Result, TargetId};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Why a call site was not inlined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// The callee is already being explored
    Recursive,
    /// The site dispatches to a split variant
    Split,
    /// The callee's expanded size exceeds the per-callee cap
    CalleeTooLarge,
    /// The site runs too rarely relative to its caller
    FrequencyCutoff,
    /// Not enough of the node budget is left
    BudgetExceeded,
    /// Function inlining is disabled
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Inline,
    Reject(RejectReason),
}

/// Exploration result for one call site
#[derive(Debug, Clone)]
pub struct InliningProfile {
    pub call_site: CallSiteId,
    pub callee: TargetId,
    pub shallow_node_count: usize,
    /// Shallow count plus the deep counts of the callee's accepted children
    pub deep_node_count: usize,
    /// Path frequency relative to the compiled target
    pub frequency: f64,
    pub score: f64,
    pub recursive: bool,
    /// The site dispatched to a split variant when explored
    pub split: bool,
    pub forced: bool,
    /// Inlined by an earlier pass; not explored again
    pub previously_inlined: bool,
    pub nested: Option<Arc<TargetDecision>>,
    pub verdict: Verdict,
}

impl InliningProfile {
    pub fn is_inlined(&self) -> bool {
        self.verdict == Verdict::Inline
    }
}

/// Decisions for the call sites of one target, in acceptance order
#[derive(Debug, Clone)]
pub struct TargetDecision {
    pub target: TargetId,
    pub shallow_node_count: usize,
    pub call_sites: Vec<InliningProfile>,
}

impl TargetDecision {
    /// Size of this target with every accepted callee folded in
    pub fn deep_node_count(&self) -> usize {
        self.shallow_node_count
            + self
                .call_sites
                .iter()
                .filter(|p| p.is_inlined())
                .map(|p| p.deep_node_count)
                .sum::<usize>()
    }

    fn accepted(&self) -> impl Iterator<Item = &InliningProfile> {
        self.call_sites.iter().filter(|p| p.is_inlined())
    }
}

/// Decision tree handed to the compiler backend
#[derive(Debug, Clone)]
pub struct InliningDecision {
    root: Arc<TargetDecision>,
}

impl InliningDecision {
    /// Decision that inlines nothing
    pub fn empty(target: TargetId, shallow_node_count: usize) -> Self {
        Self {
            root: Arc::new(TargetDecision {
                target,
                shallow_node_count,
                call_sites: Vec::new(),
            }),
        }
    }

    pub fn root(&self) -> &TargetDecision {
        &self.root
    }

    pub fn target(&self) -> TargetId {
        self.root.target
    }

    /// Node count of the compiled unit
    pub fn total_node_count(&self) -> usize {
        self.root.deep_node_count()
    }

    /// Call sites folded into the unit, counted along every inlined path
    pub fn accepted_count(&self) -> usize {
        fn count(decision: &TargetDecision) -> usize {
            decision
                .accepted()
                .map(|p| 1 + p.nested.as_deref().map_or(0, count))
                .sum()
        }
        count(&self.root)
    }

    /// Rejected call sites directly inside the compiled target
    pub fn rejected_count(&self) -> usize {
        self.root.call_sites.iter().filter(|p| !p.is_inlined()).count()
    }

    /// Profile of `site` anywhere along an inlined path
    pub fn find(&self, site: CallSiteId) -> Option<&InliningProfile> {
        fn search(decision: &TargetDecision, site: CallSiteId) -> Option<&InliningProfile> {
            for profile in &decision.call_sites {
                if profile.call_site == site {
                    return Some(profile);
                }
            }
            decision
                .accepted()
                .filter_map(|p| p.nested.as_deref())
                .find_map(|nested| search(nested, site))
        }
        search(&self.root, site)
    }

    /// Every target whose code is folded into the unit
    pub fn inlined_targets(&self) -> BTreeSet<TargetId> {
        let mut targets = BTreeSet::new();
        let mut pending: Vec<&TargetDecision> = vec![&self.root];
        while let Some(decision) = pending.pop() {
            for profile in decision.accepted() {
                targets.insert(profile.callee);
                if let Some(nested) = profile.nested.as_deref() {
                    pending.push(nested);
                }
            }
        }
        targets
    }

    /// Flag every accepted site reachable through accepted edges as inlined.
    ///
    /// Sites split or reclaimed since the decision was made are left alone.
    pub fn apply(&self, graph: &mut CallGraph) -> usize {
        let mut flagged = 0;
        let mut pending: Vec<&TargetDecision> = vec![&self.root];
        while let Some(decision) = pending.pop() {
            for profile in decision.accepted() {
                let Ok(site) = graph.site_mut(profile.call_site) else {
                    continue;
                };
                if !site.inlined && !site.split {
                    site.inlined = true;
                    flagged += 1;
                }
                if let Some(nested) = profile.nested.as_deref() {
                    pending.push(nested);
                }
            }
        }
        flagged
    }
}

/// Budgets and cutoffs for inlining exploration
#[derive(Debug, Clone, Copy)]
pub struct InliningPolicy {
    pub enabled: bool,
    pub max_caller_size: usize,
    pub max_callee_size: usize,
    pub trivial_size: usize,
    pub min_frequency: f64,
    pub max_depth: usize,
}

impl InliningPolicy {
    pub fn from_options(options: &EngineOptions) -> Self {
        Self {
            enabled: options.function_inlining,
            max_caller_size: options.inlining_max_caller_size,
            max_callee_size: options.inlining_max_callee_size,
            trivial_size: options.inlining_trivial_size,
            min_frequency: options.inlining_min_frequency,
            max_depth: options.max_recursive_inlining_depth,
        }
    }

    /// Decide which calls to fold into the compiled unit of `target`
    pub fn decide(&self, graph: &CallGraph, target: TargetId) -> Result<InliningDecision> {
        let mut explorer = Explorer {
            policy: self,
            graph,
            memo: HashMap::new(),
            stack: Vec::new(),
        };
        let root = explorer.explore(target, 0, 1.0, self.max_caller_size)?;
        Ok(InliningDecision { root })
    }
}

struct Explorer<'a> {
    policy: &'a InliningPolicy,
    graph: &'a CallGraph,
    memo: HashMap<TargetId, Arc<TargetDecision>>,
    stack: Vec<TargetId>,
}

impl Explorer<'_> {
    fn explore(
        &mut self,
        target: TargetId,
        depth: usize,
        path_frequency: f64,
        ceiling: usize,
    ) -> Result<Arc<TargetDecision>> {
        if let Some(decision) = self.memo.get(&target) {
            return Ok(Arc::clone(decision));
        }

        let graph = self.graph;
        let caller = graph.target(target)?;
        let shallow_node_count = caller.node_count();
        let caller_calls = caller.profile().total_calls().max(1) as f64;

        self.stack.push(target);
        let mut candidates = Vec::with_capacity(caller.call_sites().len());
        for &site_id in caller.call_sites() {
            let site = graph.site(site_id)?;
            let callee = site.current();
            let callee_size = graph.target(callee)?.node_count();
            let frequency = path_frequency * (site.call_count() as f64 / caller_calls);
            let recursive = self
                .stack
                .iter()
                .any(|&on_stack| graph.is_same_or_split(on_stack, callee));

            let explore = self.policy.enabled
                && !recursive
                && !site.is_split()
                && !site.is_inlined()
                && depth + 1 < self.policy.max_depth;
            let nested = if explore {
                Some(self.explore(callee, depth + 1, frequency, self.policy.max_callee_size)?)
            } else {
                None
            };
            let deep_node_count = nested
                .as_deref()
                .map_or(callee_size, TargetDecision::deep_node_count);

            candidates.push(InliningProfile {
                call_site: site_id,
                callee,
                shallow_node_count: callee_size,
                deep_node_count,
                frequency,
                score: frequency / deep_node_count.max(1) as f64,
                recursive,
                split: site.is_split(),
                forced: site.is_forced(),
                previously_inlined: site.is_inlined(),
                nested,
                verdict: Verdict::Reject(RejectReason::Disabled),
            });
        }
        self.stack.pop();

        // stable: equal scores keep discovery order
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

        let mut remaining = ceiling.saturating_sub(shallow_node_count);
        for candidate in &mut candidates {
            let verdict = self.judge(candidate, remaining);
            if verdict == Verdict::Inline {
                remaining -= candidate.deep_node_count;
            } else {
                tracing::debug!(
                    "Not inlining {} into {}: {:?}",
                    candidate.call_site,
                    target,
                    verdict
                );
            }
            candidate.verdict = verdict;
        }

        let decision = Arc::new(TargetDecision {
            target,
            shallow_node_count,
            call_sites: candidates,
        });
        self.memo.insert(target, Arc::clone(&decision));
        Ok(decision)
    }

    fn judge(&self, candidate: &InliningProfile, remaining: usize) -> Verdict {
        let policy = self.policy;
        let deep = candidate.deep_node_count;
        let reason = if !policy.enabled {
            Some(RejectReason::Disabled)
        } else if candidate.recursive {
            Some(RejectReason::Recursive)
        } else if candidate.split {
            Some(RejectReason::Split)
        } else if !candidate.forced && deep > policy.max_callee_size {
            Some(RejectReason::CalleeTooLarge)
        } else if !candidate.forced
            && deep > policy.trivial_size
            && candidate.frequency < policy.min_frequency
        {
            Some(RejectReason::FrequencyCutoff)
        } else if deep > remaining {
            Some(RejectReason::BudgetExceeded)
        } else {
            None
        };
        reason.map_or(Verdict::Inline, Verdict::Reject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileSettings;
    use crate::testing::TestTree;

    fn policy() -> InliningPolicy {
        InliningPolicy::from_options(&EngineOptions::default())
    }

    /// Record `calls` interpreted calls of `target` and `site_calls` calls through `site`
    fn run(graph: &mut CallGraph, target: TargetId, calls: u64, site: Option<(CallSiteId, u64)>) {
        let t = graph.target_mut(target).unwrap();
        for _ in 0..calls {
            t.profile.report_interpreter_call();
        }
        if let Some((site, n)) = site {
            graph.site_mut(site).unwrap().call_count = n;
        }
    }

    #[test]
    fn test_direct_self_recursion_is_never_inlined() {
        let mut g = CallGraph::new(ProfileSettings::default());
        let x = g.add_target(TestTree::new("x", 10));
        let site = g.add_call_site(x, x).unwrap();
        run(&mut g, x, 10, Some((site, 100)));

        let decision = policy().decide(&g, x).unwrap();
        let profile = decision.find(site).unwrap();
        assert!(profile.recursive);
        assert_eq!(profile.verdict, Verdict::Reject(RejectReason::Recursive));
        assert_eq!(decision.accepted_count(), 0);
        assert_eq!(decision.apply(&mut g), 0);
        assert!(!g.site(site).unwrap().is_inlined());
    }

    #[test]
    fn test_mutual_recursion_terminates() {
        let mut g = CallGraph::new(ProfileSettings::default());
        let a = g.add_target(TestTree::new("a", 10));
        let b = g.add_target(TestTree::new("b", 10));
        let ab = g.add_call_site(a, b).unwrap();
        let ba = g.add_call_site(b, a).unwrap();
        run(&mut g, a, 1, Some((ab, 1)));
        run(&mut g, b, 1, Some((ba, 1)));

        let decision = policy().decide(&g, a).unwrap();
        assert!(decision.find(ab).unwrap().is_inlined());
        let back_edge = decision.find(ba).unwrap();
        assert!(back_edge.recursive);
        assert!(!back_edge.is_inlined());
        assert_eq!(decision.total_node_count(), 20);
    }

    #[test]
    fn test_budget_invariant() {
        let mut g = CallGraph::new(ProfileSettings::default());
        let root = g.add_target(TestTree::new("root", 50));
        let mut sites = Vec::new();
        for i in 0..12 {
            let callee = g.add_target(TestTree::new(&format!("c{}", i), 40 + i * 3));
            sites.push(g.add_call_site(root, callee).unwrap());
        }
        run(&mut g, root, 10, None);
        for &site in &sites {
            g.site_mut(site).unwrap().call_count = 10;
        }

        let policy = InliningPolicy {
            max_caller_size: 300,
            ..policy()
        };
        let decision = policy.decide(&g, root).unwrap();
        assert!(decision.total_node_count() <= 300);
        let accepted: usize = decision
            .root()
            .call_sites
            .iter()
            .filter(|p| p.is_inlined())
            .map(|p| p.deep_node_count)
            .sum();
        assert!(50 + accepted <= 300);
        assert!(decision
            .root()
            .call_sites
            .iter()
            .any(|p| p.verdict == Verdict::Reject(RejectReason::BudgetExceeded)));
        // smaller callees score higher and go first
        assert!(decision.find(sites[0]).unwrap().is_inlined());
    }

    #[test]
    fn test_frequency_cutoff_and_trivial_callees() {
        let mut g = CallGraph::new(ProfileSettings::default());
        let root = g.add_target(TestTree::new("root", 10));
        let rare = g.add_target(TestTree::new("rare", 50));
        let tiny = g.add_target(TestTree::new("tiny", 5));
        let rare_site = g.add_call_site(root, rare).unwrap();
        let tiny_site = g.add_call_site(root, tiny).unwrap();
        run(&mut g, root, 100, Some((rare_site, 10)));
        g.site_mut(tiny_site).unwrap().call_count = 1;

        let decision = policy().decide(&g, root).unwrap();
        assert_eq!(
            decision.find(rare_site).unwrap().verdict,
            Verdict::Reject(RejectReason::FrequencyCutoff)
        );
        assert!(decision.find(tiny_site).unwrap().is_inlined());
    }

    #[test]
    fn test_forced_sites_bypass_caps_but_not_budget() {
        let mut g = CallGraph::new(ProfileSettings::default());
        let root = g.add_target(TestTree::new("root", 100));
        let big = g.add_target(TestTree::new("big", 800));
        let huge = g.add_target(TestTree::new("huge", 5000));
        let big_site = g.add_call_site(root, big).unwrap();
        let huge_site = g.add_call_site(root, huge).unwrap();
        g.site_mut(big_site).unwrap().forced = true;
        g.site_mut(huge_site).unwrap().forced = true;

        let decision = policy().decide(&g, root).unwrap();
        assert!(decision.find(big_site).unwrap().is_inlined());
        assert_eq!(
            decision.find(huge_site).unwrap().verdict,
            Verdict::Reject(RejectReason::BudgetExceeded)
        );
        assert!(decision.total_node_count() <= 2250);
    }

    #[test]
    fn test_callee_cap_uses_deep_count() {
        let mut g = CallGraph::new(ProfileSettings::default());
        let root = g.add_target(TestTree::new("root", 10));
        let mid = g.add_target(TestTree::new("mid", 300));
        let leaf = g.add_target(TestTree::new("leaf", 150));
        let root_mid = g.add_call_site(root, mid).unwrap();
        let mid_leaf = g.add_call_site(mid, leaf).unwrap();
        run(&mut g, root, 1, Some((root_mid, 1)));
        run(&mut g, mid, 1, Some((mid_leaf, 1)));

        let decision = policy().decide(&g, root).unwrap();
        let mid_profile = decision.find(root_mid).unwrap();
        assert_eq!(mid_profile.shallow_node_count, 300);
        assert_eq!(mid_profile.deep_node_count, 450);
        assert!(mid_profile.is_inlined());
        assert_eq!(decision.inlined_targets().into_iter().collect::<Vec<_>>(), vec![mid, leaf]);

        assert_eq!(decision.apply(&mut g), 2);
        assert!(g.site(mid_leaf).unwrap().is_inlined());
    }

    #[test]
    fn test_previously_inlined_sites_are_not_explored() {
        let mut g = CallGraph::new(ProfileSettings::default());
        let root = g.add_target(TestTree::new("root", 10));
        let mid = g.add_target(TestTree::new("mid", 20));
        let leaf = g.add_target(TestTree::new("leaf", 30));
        let root_mid = g.add_call_site(root, mid).unwrap();
        g.add_call_site(mid, leaf).unwrap();
        run(&mut g, root, 1, Some((root_mid, 1)));
        g.site_mut(root_mid).unwrap().inlined = true;

        let decision = policy().decide(&g, root).unwrap();
        let profile = decision.find(root_mid).unwrap();
        assert!(profile.previously_inlined);
        assert!(profile.nested.is_none());
        assert_eq!(profile.deep_node_count, 20);
    }

    #[test]
    fn test_depth_limit_charges_shallow_size() {
        let mut g = CallGraph::new(ProfileSettings::default());
        let chain: Vec<_> = (0..5)
            .map(|i| g.add_target(TestTree::new(&format!("f{}", i), 5)))
            .collect();
        for pair in chain.windows(2) {
            let site = g.add_call_site(pair[0], pair[1]).unwrap();
            run(&mut g, pair[0], 1, Some((site, 1)));
        }

        let policy = InliningPolicy {
            max_depth: 2,
            ..policy()
        };
        let decision = policy.decide(&g, chain[0]).unwrap();
        let first = &decision.root().call_sites[0];
        let nested = first.nested.as_deref().unwrap();
        assert!(nested.call_sites[0].nested.is_none());
        assert_eq!(decision.total_node_count(), 15);
    }

    #[test]
    fn test_disabled_inlining_rejects_everything() {
        let mut g = CallGraph::new(ProfileSettings::default());
        let root = g.add_target(TestTree::new("root", 10));
        let callee = g.add_target(TestTree::new("callee", 3));
        let site = g.add_call_site(root, callee).unwrap();

        let policy = InliningPolicy {
            enabled: false,
            ..policy()
        };
        let decision = policy.decide(&g, root).unwrap();
        assert_eq!(
            decision.find(site).unwrap().verdict,
            Verdict::Reject(RejectReason::Disabled)
        );
        assert_eq!(decision.total_node_count(), 10);
    }

    #[test]
    fn test_zero_caller_calls() {
        let mut g = CallGraph::new(ProfileSettings::default());
        let root = g.add_target(TestTree::new("root", 10));
        let callee = g.add_target(TestTree::new("callee", 50));
        let site = g.add_call_site(root, callee).unwrap();
        g.site_mut(site).unwrap().call_count = 4;

        let decision = policy().decide(&g, root).unwrap();
        let profile = decision.find(site).unwrap();
        assert!(profile.frequency.is_finite());
        assert_eq!(profile.frequency, 4.0);
    }

    #[test]
    fn test_split_sites_are_not_inlined() {
        let mut g = CallGraph::new(ProfileSettings::default());
        let root = g.add_target(TestTree::new("root", 10));
        let callee = g.add_target(TestTree::new("callee", 5));
        let split_site = g.add_call_site(root, callee).unwrap();
        let shared_site = g.add_call_site(root, callee).unwrap();
        let variant = g.split_private(callee).unwrap();
        g.retarget(split_site, variant).unwrap();
        run(&mut g, root, 10, Some((split_site, 10)));
        g.site_mut(shared_site).unwrap().call_count = 10;

        let decision = policy().decide(&g, root).unwrap();
        let split = decision.find(split_site).unwrap();
        assert!(split.split);
        assert_eq!(split.verdict, Verdict::Reject(RejectReason::Split));
        assert!(split.nested.is_none());
        assert!(decision.find(shared_site).unwrap().is_inlined());

        assert_eq!(decision.apply(&mut g), 1);
        assert!(!g.site(split_site).unwrap().is_inlined());
    }

    #[test]
    fn test_apply_skips_sites_split_after_the_decision() {
        let mut g = CallGraph::new(ProfileSettings::default());
        let root = g.add_target(TestTree::new("root", 10));
        let callee = g.add_target(TestTree::new("callee", 5));
        let site = g.add_call_site(root, callee).unwrap();
        run(&mut g, root, 10, Some((site, 10)));

        let decision = policy().decide(&g, root).unwrap();
        assert!(decision.find(site).unwrap().is_inlined());
        let variant = g.split_private(callee).unwrap();
        g.retarget(site, variant).unwrap();

        assert_eq!(decision.apply(&mut g), 0);
        let site = g.site(site).unwrap();
        assert!(site.is_split() && !site.is_inlined());
    }
}
