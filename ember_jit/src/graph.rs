//! Arena of call targets and call sites
//!
//! Targets and sites are addressed by id and never reused within a session.
//! Each target counts the call sites currently pointing at it; a split
//! variant whose count drops to zero is reclaimed together with the call
//! sites inside its tree.

use crate::compiler::CompilationSlot;
use crate::profile::{CompilationProfile, ProfileSettings};
use ember_core::{CallSiteId, EngineError, Result, RootNode, Stamp, TargetId};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Type feedback the host observed at a call site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallSiteFeedback {
    #[default]
    Uninitialized,
    Monomorphic,
    Polymorphic,
    Megamorphic,
}

impl CallSiteFeedback {
    pub fn is_polymorphic(self) -> bool {
        matches!(self, Self::Polymorphic | Self::Megamorphic)
    }
}

/// A compilable unit of interpreted code
#[derive(Debug)]
pub struct CallTarget {
    id: TargetId,
    root: Arc<dyn RootNode>,
    pub(crate) profile: CompilationProfile,
    compilation: Arc<CompilationSlot>,
    known_call_sites: usize,
    split_source: Option<TargetId>,
    split_variants: HashMap<Stamp, TargetId>,
    private_variants: Vec<TargetId>,
    specialization: Stamp,
    call_sites: Vec<CallSiteId>,
    pub(crate) return_stamp: Stamp,
    /// Targets whose compiled code folded this target in
    pub(crate) dependents: HashSet<TargetId>,
    /// Targets folded into this target's installed code
    pub(crate) inlined_callees: HashSet<TargetId>,
}

impl CallTarget {
    fn new(id: TargetId, root: Arc<dyn RootNode>, settings: ProfileSettings) -> Self {
        Self {
            id,
            root,
            profile: CompilationProfile::new(settings),
            compilation: Arc::new(CompilationSlot::new()),
            known_call_sites: 0,
            split_source: None,
            split_variants: HashMap::new(),
            private_variants: Vec::new(),
            specialization: Stamp::Generic,
            call_sites: Vec::new(),
            return_stamp: Stamp::Uninitialized,
            dependents: HashSet::new(),
            inlined_callees: HashSet::new(),
        }
    }

    pub fn id(&self) -> TargetId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.root.name()
    }

    pub fn root(&self) -> &Arc<dyn RootNode> {
        &self.root
    }

    pub fn node_count(&self) -> usize {
        self.root.node_count()
    }

    pub fn profile(&self) -> &CompilationProfile {
        &self.profile
    }

    pub(crate) fn compilation(&self) -> &Arc<CompilationSlot> {
        &self.compilation
    }

    /// Compiled code is installed
    pub fn is_valid(&self) -> bool {
        self.compilation.is_valid()
    }

    pub fn known_call_sites(&self) -> usize {
        self.known_call_sites
    }

    /// Target this variant was split from
    pub fn split_source(&self) -> Option<TargetId> {
        self.split_source
    }

    pub fn is_split(&self) -> bool {
        self.split_source.is_some()
    }

    /// Shape-keyed variants of this source target
    pub fn split_variants(&self) -> &HashMap<Stamp, TargetId> {
        &self.split_variants
    }

    /// Variants created by the eager heuristic, owned by a single call site each
    pub fn private_variants(&self) -> &[TargetId] {
        &self.private_variants
    }

    /// Argument shape this target is specialized for; `Generic` for sources
    pub fn specialization(&self) -> &Stamp {
        &self.specialization
    }

    /// Call sites in this target's tree, in discovery order
    pub fn call_sites(&self) -> &[CallSiteId] {
        &self.call_sites
    }

    pub fn return_stamp(&self) -> &Stamp {
        &self.return_stamp
    }

    fn has_variants(&self) -> bool {
        !self.split_variants.is_empty() || !self.private_variants.is_empty()
    }
}

/// A point in a caller's tree that invokes a call target
#[derive(Debug, Clone)]
pub struct CallSite {
    id: CallSiteId,
    caller: TargetId,
    original: TargetId,
    current: TargetId,
    pub(crate) call_count: u64,
    pub(crate) split: bool,
    pub(crate) inlined: bool,
    pub(crate) forced: bool,
    pub(crate) stamp: Stamp,
    pub(crate) feedback: CallSiteFeedback,
}

impl CallSite {
    pub fn id(&self) -> CallSiteId {
        self.id
    }

    /// Target whose tree contains this site
    pub fn caller(&self) -> TargetId {
        self.caller
    }

    /// Target the site was built against
    pub fn original(&self) -> TargetId {
        self.original
    }

    /// Target the site currently dispatches to
    pub fn current(&self) -> TargetId {
        self.current
    }

    pub fn call_count(&self) -> u64 {
        self.call_count
    }

    /// The site dispatches to a variant of its original target
    pub fn is_split(&self) -> bool {
        self.split
    }

    pub fn is_inlined(&self) -> bool {
        self.inlined
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    /// Running argument stamp
    pub fn stamp(&self) -> &Stamp {
        &self.stamp
    }

    pub fn feedback(&self) -> CallSiteFeedback {
        self.feedback
    }
}

/// Owner of every target and call site in a session
#[derive(Debug)]
pub struct CallGraph {
    settings: ProfileSettings,
    targets: Vec<Option<CallTarget>>,
    sites: Vec<Option<CallSite>>,
}

impl CallGraph {
    pub fn new(settings: ProfileSettings) -> Self {
        Self {
            settings,
            targets: Vec::new(),
            sites: Vec::new(),
        }
    }

    /// Register a tree as a new source target
    pub fn add_target(&mut self, root: Arc<dyn RootNode>) -> TargetId {
        let id = TargetId(self.targets.len() as u32);
        self.targets.push(Some(CallTarget::new(id, root, self.settings)));
        id
    }

    /// Register a call site in `caller`'s tree invoking `callee`
    pub fn add_call_site(&mut self, caller: TargetId, callee: TargetId) -> Result<CallSiteId> {
        self.target(caller)?;
        if let Some(source) = self.target(callee)?.split_source {
            return Err(EngineError::InvariantViolated(format!(
                "call site must be built against source target {}, not variant {}",
                source, callee
            )));
        }
        Ok(self.push_site(caller, callee))
    }

    fn push_site(&mut self, caller: TargetId, callee: TargetId) -> CallSiteId {
        let id = CallSiteId(self.sites.len() as u32);
        self.sites.push(Some(CallSite {
            id,
            caller,
            original: callee,
            current: callee,
            call_count: 0,
            split: false,
            inlined: false,
            forced: false,
            stamp: Stamp::Uninitialized,
            feedback: CallSiteFeedback::Uninitialized,
        }));
        if let Some(Some(target)) = self.targets.get_mut(caller.index()) {
            target.call_sites.push(id);
        }
        if let Some(Some(target)) = self.targets.get_mut(callee.index()) {
            target.known_call_sites += 1;
        }
        id
    }

    pub fn get_target(&self, id: TargetId) -> Option<&CallTarget> {
        self.targets.get(id.index()).and_then(Option::as_ref)
    }

    pub fn target(&self, id: TargetId) -> Result<&CallTarget> {
        self.get_target(id).ok_or(EngineError::UnknownTarget(id))
    }

    pub fn target_mut(&mut self, id: TargetId) -> Result<&mut CallTarget> {
        self.targets
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(EngineError::UnknownTarget(id))
    }

    pub fn site(&self, id: CallSiteId) -> Result<&CallSite> {
        self.sites
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(EngineError::UnknownCallSite(id))
    }

    pub fn site_mut(&mut self, id: CallSiteId) -> Result<&mut CallSite> {
        self.sites
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(EngineError::UnknownCallSite(id))
    }

    /// Live targets in id order
    pub fn targets(&self) -> impl Iterator<Item = &CallTarget> {
        self.targets.iter().flatten()
    }

    /// Live call sites in id order
    pub fn sites(&self) -> impl Iterator<Item = &CallSite> {
        self.sites.iter().flatten()
    }

    /// Source a target was split from, or the target itself
    pub fn source_of(&self, id: TargetId) -> TargetId {
        self.get_target(id).and_then(|t| t.split_source).unwrap_or(id)
    }

    /// Both targets are the same tree or splits of the same source
    pub fn is_same_or_split(&self, a: TargetId, b: TargetId) -> bool {
        self.source_of(a) == self.source_of(b)
    }

    /// Variant of `source` registered for `stamp`
    pub fn split_variant(&self, source: TargetId, stamp: &Stamp) -> Option<TargetId> {
        self.get_target(source)
            .and_then(|t| t.split_variants.get(stamp).copied())
    }

    /// Clone `source` into a variant registered under `stamp`
    pub fn split_for(&mut self, source: TargetId, stamp: Stamp) -> Result<TargetId> {
        if let Some(existing) = self.split_variant(source, &stamp) {
            return Err(EngineError::InvariantViolated(format!(
                "{} already has variant {} for {}",
                source, existing, stamp
            )));
        }
        let variant = self.clone_target(source, stamp.clone())?;
        self.target_mut(source)?.split_variants.insert(stamp, variant);
        Ok(variant)
    }

    /// Clone `source` into a variant owned by a single call site
    pub fn split_private(&mut self, source: TargetId) -> Result<TargetId> {
        let variant = self.clone_target(source, Stamp::Generic)?;
        self.target_mut(source)?.private_variants.push(variant);
        Ok(variant)
    }

    fn clone_target(&mut self, source: TargetId, specialization: Stamp) -> Result<TargetId> {
        let original = self.target(source)?;
        if let Some(parent) = original.split_source {
            return Err(EngineError::InvariantViolated(format!(
                "cannot split variant {} of {}",
                source, parent
            )));
        }
        let root = original.root.split_copy();
        let callees = original
            .call_sites
            .iter()
            .map(|&site| self.site(site).map(CallSite::original))
            .collect::<Result<Vec<_>>>()?;

        let id = TargetId(self.targets.len() as u32);
        let mut variant = CallTarget::new(id, root, self.settings);
        variant.split_source = Some(source);
        variant.specialization = specialization;
        self.targets.push(Some(variant));

        for callee in callees {
            self.push_site(id, callee);
        }
        Ok(id)
    }

    /// Move a variant to a new key in its source's map
    pub fn rekey_variant(&mut self, variant: TargetId, stamp: Stamp) -> Result<()> {
        let target = self.target(variant)?;
        let Some(source) = target.split_source else {
            return Err(EngineError::InvariantViolated(format!(
                "{} is not a split variant",
                variant
            )));
        };
        let old = target.specialization.clone();
        let variants = &mut self.target_mut(source)?.split_variants;
        if variants.contains_key(&stamp) {
            return Err(EngineError::InvariantViolated(format!(
                "{} already has a variant for {}",
                source, stamp
            )));
        }
        if variants.get(&old) == Some(&variant) {
            variants.remove(&old);
        }
        variants.insert(stamp.clone(), variant);
        self.target_mut(variant)?.specialization = stamp;
        Ok(())
    }

    /// Point `site` at `target`, adjusting both counts.
    ///
    /// Returns the variants reclaimed because they lost their last caller.
    pub fn retarget(&mut self, site: CallSiteId, target: TargetId) -> Result<Vec<TargetId>> {
        self.target(target)?;
        let call_site = self.site_mut(site)?;
        let old = call_site.current;
        if old == target {
            return Ok(Vec::new());
        }
        call_site.current = target;
        call_site.split = target != call_site.original;

        self.target_mut(target)?.known_call_sites += 1;
        let mut reclaimed = Vec::new();
        self.release(old, &mut reclaimed)?;
        Ok(reclaimed)
    }

    /// Drop one known call site from `target`, reclaiming variants that
    /// reach zero along with everything their trees call
    fn release(&mut self, target: TargetId, reclaimed: &mut Vec<TargetId>) -> Result<()> {
        let mut pending = vec![target];
        while let Some(id) = pending.pop() {
            let t = self.target_mut(id)?;
            if t.known_call_sites == 0 {
                return Err(EngineError::InvariantViolated(format!(
                    "known call site count of {} would become negative",
                    id
                )));
            }
            t.known_call_sites -= 1;
            if t.known_call_sites > 0 || t.split_source.is_none() || t.has_variants() {
                continue;
            }
            pending.extend(self.reclaim(id)?);
            reclaimed.push(id);
        }
        Ok(())
    }

    /// Remove a variant and its call sites; returns the targets those sites called
    fn reclaim(&mut self, id: TargetId) -> Result<Vec<TargetId>> {
        let Some(target) = self.targets.get_mut(id.index()).and_then(Option::take) else {
            return Err(EngineError::UnknownTarget(id));
        };
        target.compilation.invalidate();

        if let Some(source) = target.split_source.and_then(|s| self.targets.get_mut(s.index())) {
            if let Some(source) = source.as_mut() {
                source.split_variants.retain(|_, v| *v != id);
                source.private_variants.retain(|v| *v != id);
            }
        }

        let mut callees = Vec::with_capacity(target.call_sites.len());
        for site in &target.call_sites {
            if let Some(site) = self.sites.get_mut(site.index()).and_then(Option::take) {
                callees.push(site.current);
            }
        }
        Ok(callees)
    }

    /// Remove a target the host no longer references.
    ///
    /// Fails while call sites still point at it or it still owns variants.
    pub fn remove_target(&mut self, id: TargetId) -> Result<Vec<TargetId>> {
        let target = self.target(id)?;
        if target.known_call_sites > 0 {
            return Err(EngineError::InvariantViolated(format!(
                "{} still has {} known call sites",
                id, target.known_call_sites
            )));
        }
        if target.has_variants() {
            return Err(EngineError::InvariantViolated(format!(
                "{} still owns split variants",
                id
            )));
        }
        let mut reclaimed = Vec::new();
        for callee in self.reclaim(id)? {
            self.release(callee, &mut reclaimed)?;
        }
        Ok(reclaimed)
    }

    /// Clear the inlined flags set for `target`'s compiled unit.
    ///
    /// Follows inlined edges into callees, mirroring how the flags were set.
    pub fn reset_inlining(&mut self, target: TargetId) -> Result<usize> {
        let mut cleared = 0;
        let mut visited = HashSet::new();
        let mut pending = vec![target];
        while let Some(id) = pending.pop() {
            if !visited.insert(id) {
                continue;
            }
            let sites = self.target(id)?.call_sites.clone();
            for site in sites {
                let site = self.site_mut(site)?;
                if site.inlined {
                    site.inlined = false;
                    cleared += 1;
                    pending.push(site.current);
                }
            }
        }
        Ok(cleared)
    }

    /// Check that every target's known count matches the sites pointing at it
    /// and that the variant maps agree with the split sources
    pub fn verify_call_site_counts(&self) -> Result<()> {
        let mut counts: HashMap<TargetId, usize> = HashMap::new();
        for site in self.sites() {
            self.target(site.current)?;
            *counts.entry(site.current).or_default() += 1;
        }

        for target in self.targets() {
            let counted = counts.get(&target.id).copied().unwrap_or(0);
            if counted != target.known_call_sites {
                return Err(EngineError::InvariantViolated(format!(
                    "{} records {} known call sites but {} point at it",
                    target.id, target.known_call_sites, counted
                )));
            }
            let owned = target.split_variants.values().chain(&target.private_variants);
            for &variant in owned {
                let v = self.target(variant)?;
                if v.split_source != Some(target.id) {
                    return Err(EngineError::InvariantViolated(format!(
                        "{} lists {} as a variant but its source is {:?}",
                        target.id, variant, v.split_source
                    )));
                }
                if v.known_call_sites == 0 {
                    return Err(EngineError::InvariantViolated(format!(
                        "variant {} has no callers but was not reclaimed",
                        variant
                    )));
                }
            }
            if target.split_source.is_some() && target.has_variants() {
                return Err(EngineError::InvariantViolated(format!(
                    "variant {} owns variants",
                    target.id
                )));
            }
        }
        Ok(())
    }
}
