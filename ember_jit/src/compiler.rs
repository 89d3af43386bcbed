//! Compilation backend seam and background compilation queue
//!
//! The backend is a black box: it receives a [`CompilationUnit`] (tree root
//! plus the inlining decision) and returns an artifact or a failure. The
//! queue runs it on a bounded pool hosted by a dedicated tokio runtime.
//!
//! ```text
//!  interpreter thread                       compiler runtime
//!  ──────────────────                       ────────────────
//!  submit(unit) ──► spawn ──► permit ──► spawn_blocking(backend.compile)
//!                                                   │
//!  poll() ◄──── completion channel ◄── slot.finish(generation, result)
//! ```

use crate::inlining::InliningDecision;
use ember_core::{CompileError, RootNode, TargetId};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch, Semaphore};

/// Everything the backend needs to compile one target
#[derive(Debug, Clone)]
pub struct CompilationUnit {
    pub target: TargetId,
    pub name: String,
    pub root: Arc<dyn RootNode>,
    /// Which nested calls to fold into this unit
    pub inlining: Arc<InliningDecision>,
    /// Slot generation this unit was submitted for
    pub generation: u64,
}

/// Installed result of a successful compilation
pub struct CompiledArtifact {
    /// Target this code was compiled from
    pub target: TargetId,
    pub name: String,
    /// Compilation timestamp
    pub compiled_at: Instant,
    /// Size of the generated code in bytes, as reported by the backend
    pub code_size: usize,
    /// Number of call sites folded into this artifact
    pub inlined_call_sites: usize,
    payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl CompiledArtifact {
    /// Create an artifact for `unit`
    pub fn new(unit: &CompilationUnit, code_size: usize) -> Self {
        Self {
            target: unit.target,
            name: unit.name.clone(),
            compiled_at: Instant::now(),
            code_size,
            inlined_call_sites: unit.inlining.accepted_count(),
            payload: None,
        }
    }

    /// Attach backend-specific data, such as an entry point handle
    pub fn with_payload<T: Any + Send + Sync>(mut self, payload: T) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    /// Backend-specific data, if it has type `T`
    pub fn payload<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.payload.as_deref().and_then(|p| p.downcast_ref::<T>())
    }
}

impl fmt::Debug for CompiledArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledArtifact")
            .field("target", &self.target)
            .field("name", &self.name)
            .field("code_size", &self.code_size)
            .field("inlined_call_sites", &self.inlined_call_sites)
            .finish_non_exhaustive()
    }
}

/// Best-effort cancellation flag handed to the backend
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Machine-code generator
pub trait CompilerBackend: Send + Sync + 'static {
    /// Compile one unit.
    ///
    /// Long compilations should poll `cancel` and give up with
    /// [`CompileError::Cancelled`] once it is set.
    fn compile(
        &self,
        unit: &CompilationUnit,
        cancel: &CancelToken,
    ) -> Result<CompiledArtifact, CompileError>;
}

#[derive(Debug)]
struct InFlight {
    generation: u64,
    token: CancelToken,
}

/// How a finished compilation was applied to its slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishStatus {
    /// The artifact is now installed
    Installed,
    /// The slot was invalidated while compiling; the result was dropped
    Stale,
    /// The backend failed
    Failed,
}

/// Compilation state of one target, shared with compiler workers.
///
/// An absent artifact always means "interpret". Installation and
/// invalidation serialize on the in-flight lock, so a result compiled
/// against an invalidated generation is never installed.
#[derive(Debug, Default)]
pub struct CompilationSlot {
    artifact: RwLock<Option<Arc<CompiledArtifact>>>,
    generation: AtomicU64,
    in_flight: Mutex<Option<InFlight>>,
    /// Set when the backend failed and the registry has not yet seen it
    failure_pending: AtomicBool,
}

impl CompilationSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installed code, if any
    pub fn artifact(&self) -> Option<Arc<CompiledArtifact>> {
        self.artifact.read().clone()
    }

    pub fn is_valid(&self) -> bool {
        self.artifact.read().is_some()
    }

    pub fn is_compiling(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// A failed compilation whose outcome has not been applied yet
    pub fn has_pending_failure(&self) -> bool {
        self.failure_pending.load(Ordering::Acquire)
    }

    pub(crate) fn acknowledge_failure(&self) {
        self.failure_pending.store(false, Ordering::Release);
    }

    /// Claim the slot for a new compilation.
    ///
    /// Returns `None` while another compilation is outstanding.
    pub(crate) fn begin(&self) -> Option<(u64, CancelToken)> {
        let mut in_flight = self.in_flight.lock();
        if in_flight.is_some() {
            return None;
        }
        let generation = self.generation();
        let token = CancelToken::new();
        *in_flight = Some(InFlight {
            generation,
            token: token.clone(),
        });
        Some((generation, token))
    }

    /// Apply a finished compilation
    pub(crate) fn finish(
        &self,
        generation: u64,
        result: &Result<Arc<CompiledArtifact>, CompileError>,
    ) -> FinishStatus {
        let mut in_flight = self.in_flight.lock();
        if in_flight.as_ref().is_some_and(|f| f.generation == generation) {
            *in_flight = None;
        }
        if generation != self.generation() {
            return FinishStatus::Stale;
        }
        match result {
            Ok(artifact) => {
                *self.artifact.write() = Some(Arc::clone(artifact));
                FinishStatus::Installed
            }
            Err(_) => {
                self.failure_pending.store(true, Ordering::Release);
                FinishStatus::Failed
            }
        }
    }

    /// Drop installed code and cancel any outstanding compilation.
    ///
    /// Returns whether code was installed or a compilation was running.
    pub fn invalidate(&self) -> bool {
        let mut in_flight = self.in_flight.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let cancelled = match in_flight.take() {
            Some(f) => {
                f.token.cancel();
                true
            }
            None => false,
        };
        let had_code = self.artifact.write().take().is_some();
        had_code || cancelled
    }
}

/// A compilation that finished, failed or was dropped
#[derive(Debug, Clone)]
pub struct CompilationOutcome {
    pub target: TargetId,
    pub generation: u64,
    pub status: FinishStatus,
    pub result: Result<Arc<CompiledArtifact>, CompileError>,
    /// Inlining the unit was compiled with
    pub inlining: Arc<InliningDecision>,
    pub elapsed: Duration,
}

/// Statistics for the compilation queue
#[derive(Debug, Default)]
pub struct QueueStats {
    pub submitted: AtomicU64,
    pub installed: AtomicU64,
    pub failed: AtomicU64,
    pub discarded: AtomicU64,
}

impl QueueStats {
    /// Snapshot of (submitted, installed, failed, discarded)
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.submitted.load(Ordering::Relaxed),
            self.installed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.discarded.load(Ordering::Relaxed),
        )
    }

    fn record(&self, status: FinishStatus) {
        let counter = match status {
            FinishStatus::Installed => &self.installed,
            FinishStatus::Failed => &self.failed,
            FinishStatus::Stale => &self.discarded,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Bounded pool running the backend off the interpreter thread
pub struct CompilationQueue {
    runtime: Option<Runtime>,
    backend: Arc<dyn CompilerBackend>,
    permits: Arc<Semaphore>,
    timeout: Option<Duration>,
    completed_tx: mpsc::UnboundedSender<CompilationOutcome>,
    completed_rx: mpsc::UnboundedReceiver<CompilationOutcome>,
    pending: Arc<watch::Sender<usize>>,
    stats: Arc<QueueStats>,
}

impl CompilationQueue {
    /// Create a queue running at most `threads` compilations at once
    pub fn new(
        backend: Arc<dyn CompilerBackend>,
        threads: usize,
        timeout: Option<Duration>,
    ) -> std::io::Result<Self> {
        let threads = threads.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads)
            .thread_name("ember-compiler")
            .enable_time()
            .build()?;
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(0usize);

        Ok(Self {
            runtime: Some(runtime),
            backend,
            permits: Arc::new(Semaphore::new(threads)),
            timeout,
            completed_tx,
            completed_rx,
            pending: Arc::new(pending),
            stats: Arc::new(QueueStats::default()),
        })
    }

    /// Compile in the background; the outcome is delivered by [`Self::drain`]
    pub fn submit(&self, unit: CompilationUnit, slot: Arc<CompilationSlot>, token: CancelToken) {
        let Some(runtime) = self.runtime.as_ref() else {
            return;
        };
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        self.pending.send_modify(|n| *n += 1);

        let job = self.job(unit, slot, token);
        let completed_tx = self.completed_tx.clone();
        let pending = Arc::clone(&self.pending);
        runtime.spawn(async move {
            let outcome = job.await;
            // the receiver only goes away with the queue itself
            let _ = completed_tx.send(outcome);
            pending.send_modify(|n| *n = n.saturating_sub(1));
        });
    }

    /// Compile on the calling thread's behalf and wait for the outcome.
    ///
    /// Must not be called from inside an async context.
    pub fn compile_blocking(
        &self,
        unit: CompilationUnit,
        slot: Arc<CompilationSlot>,
        token: CancelToken,
    ) -> CompilationOutcome {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        let target = unit.target;
        let generation = unit.generation;
        let inlining = Arc::clone(&unit.inlining);
        match self.runtime.as_ref() {
            Some(runtime) => runtime.block_on(self.job(unit, slot, token)),
            None => {
                let result = Err(CompileError::Cancelled("compiler shut down".to_string()));
                let status = slot.finish(generation, &result);
                CompilationOutcome {
                    target,
                    generation,
                    status,
                    result,
                    inlining,
                    elapsed: Duration::ZERO,
                }
            }
        }
    }

    fn job(
        &self,
        unit: CompilationUnit,
        slot: Arc<CompilationSlot>,
        token: CancelToken,
    ) -> impl std::future::Future<Output = CompilationOutcome> + Send + 'static {
        let backend = Arc::clone(&self.backend);
        let permits = Arc::clone(&self.permits);
        let stats = Arc::clone(&self.stats);
        let timeout = self.timeout;

        async move {
            let started = Instant::now();
            let target = unit.target;
            let generation = unit.generation;
            let inlining = Arc::clone(&unit.inlining);
            let result = run_backend(backend, permits, unit, token, timeout)
                .await
                .map(Arc::new);
            let status = slot.finish(generation, &result);
            stats.record(status);
            CompilationOutcome {
                target,
                generation,
                status,
                result,
                inlining,
                elapsed: started.elapsed(),
            }
        }
    }

    /// Outcomes of background compilations finished since the last drain
    pub fn drain(&mut self) -> Vec<CompilationOutcome> {
        let mut outcomes = Vec::new();
        while let Ok(outcome) = self.completed_rx.try_recv() {
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Wait until no background compilation is outstanding.
    ///
    /// Returns `false` if `limit` elapsed first.
    pub fn wait_idle(&self, limit: Duration) -> bool {
        let Some(runtime) = self.runtime.as_ref() else {
            return true;
        };
        let mut pending = self.pending.subscribe();
        runtime.block_on(async move {
            matches!(
                tokio::time::timeout(limit, pending.wait_for(|n| *n == 0)).await,
                Ok(Ok(_))
            )
        })
    }

    /// Number of background compilations not yet finished
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Stop accepting work and release the compiler threads
    pub fn shutdown(&mut self) {
        self.permits.close();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for CompilationQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_backend(
    backend: Arc<dyn CompilerBackend>,
    permits: Arc<Semaphore>,
    unit: CompilationUnit,
    token: CancelToken,
    timeout: Option<Duration>,
) -> Result<CompiledArtifact, CompileError> {
    let Ok(permit) = permits.acquire_owned().await else {
        return Err(CompileError::Cancelled("compiler shut down".to_string()));
    };
    if token.is_cancelled() {
        return Err(CompileError::Cancelled("invalidated before start".to_string()));
    }

    let worker_token = token.clone();
    // the permit travels with the blocking job so an abandoned compilation
    // still occupies its thread until the backend returns
    let job = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        backend.compile(&unit, &worker_token)
    });

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, job).await {
            Ok(joined) => joined,
            Err(_) => {
                token.cancel();
                return Err(CompileError::Timeout(limit));
            }
        },
        None => job.await,
    };

    match joined {
        Ok(result) => result,
        Err(err) => Err(CompileError::Fatal(format!("backend panicked: {}", err))),
    }
}
