//! Structured engine events

use ember_core::{CallSiteId, TargetId};
use serde::Serialize;
use std::time::Duration;

/// Something the engine did that a host may want to observe
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    CompilationQueued {
        target: TargetId,
        name: String,
        background: bool,
    },
    /// The timestamped policy postponed a compilation and reset the counters
    CompilationDeferred {
        target: TargetId,
        name: String,
    },
    CompilationSucceeded {
        target: TargetId,
        name: String,
        code_size: usize,
        inlined_call_sites: usize,
        elapsed: Duration,
    },
    CompilationFailed {
        target: TargetId,
        name: String,
        reason: String,
        permanent: bool,
    },
    /// A compilation finished after its target was invalidated, or was cancelled
    CompilationDequeued {
        target: TargetId,
        name: String,
        reason: String,
    },
    Invalidated {
        target: TargetId,
        name: String,
        reason: String,
    },
    InliningDecided {
        target: TargetId,
        accepted: usize,
        rejected: usize,
        total_node_count: usize,
    },
    Split {
        site: CallSiteId,
        from: TargetId,
        to: TargetId,
        created: bool,
    },
    /// A variant was moved to the site's new argument shape
    Respecialized {
        site: CallSiteId,
        target: TargetId,
    },
    Unsplit {
        site: CallSiteId,
        from: TargetId,
        to: TargetId,
    },
    VariantReclaimed {
        target: TargetId,
    },
}

impl EngineEvent {
    /// Emit the event through `tracing`
    pub fn log(&self) {
        match self {
            EngineEvent::CompilationQueued { target, name, background } => {
                tracing::info!("Queued compilation of {} ({}), background: {}", name, target, background);
            }
            EngineEvent::CompilationDeferred { target, name } => {
                tracing::debug!("Deferred compilation of {} ({})", name, target);
            }
            EngineEvent::CompilationSucceeded {
                target,
                name,
                code_size,
                inlined_call_sites,
                elapsed,
            } => {
                tracing::info!(
                    "Compiled {} ({}): {} bytes, {} inlined call sites in {:?}",
                    name,
                    target,
                    code_size,
                    inlined_call_sites,
                    elapsed
                );
            }
            EngineEvent::CompilationFailed {
                target,
                name,
                reason,
                permanent,
            } => {
                tracing::debug!(
                    "Compilation of {} ({}) failed (permanent: {}): {}",
                    name,
                    target,
                    permanent,
                    reason
                );
            }
            EngineEvent::CompilationDequeued { target, name, reason } => {
                tracing::debug!("Dropped compilation of {} ({}): {}", name, target, reason);
            }
            EngineEvent::Invalidated { target, name, reason } => {
                tracing::info!("Invalidated {} ({}): {}", name, target, reason);
            }
            EngineEvent::InliningDecided {
                target,
                accepted,
                rejected,
                total_node_count,
            } => {
                tracing::debug!(
                    "Inlining for {}: {} accepted, {} rejected, {} nodes",
                    target,
                    accepted,
                    rejected,
                    total_node_count
                );
            }
            EngineEvent::Split { site, from, to, created } => {
                tracing::debug!("Split {}: {} -> {} (new variant: {})", site, from, to, created);
            }
            EngineEvent::Respecialized { site, target } => {
                tracing::debug!("Re-specialized {} for {}", target, site);
            }
            EngineEvent::Unsplit { site, from, to } => {
                tracing::debug!("Unsplit {}: {} -> {}", site, from, to);
            }
            EngineEvent::VariantReclaimed { target } => {
                tracing::debug!("Reclaimed variant {}", target);
            }
        }
    }
}

/// Receiver of engine events, installed on the registry
pub trait EngineListener: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

impl<F> EngineListener for F
where
    F: Fn(&EngineEvent) + Send + Sync,
{
    fn on_event(&self, event: &EngineEvent) {
        self(event)
    }
}
