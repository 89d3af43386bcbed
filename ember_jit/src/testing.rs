//! Test doubles shared by the unit tests

use crate::compiler::{CancelToken, CompilationUnit, CompiledArtifact, CompilerBackend};
use crate::events::{EngineEvent, EngineListener};
use ember_core::{CompileError, RootNode};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Root node with a fixed size
#[derive(Debug)]
pub struct TestTree {
    name: String,
    nodes: usize,
}

impl TestTree {
    pub fn new(name: &str, nodes: usize) -> Arc<dyn RootNode> {
        Arc::new(Self {
            name: name.to_string(),
            nodes,
        })
    }
}

impl RootNode for TestTree {
    fn name(&self) -> &str {
        &self.name
    }

    fn node_count(&self) -> usize {
        self.nodes
    }

    fn split_copy(&self) -> Arc<dyn RootNode> {
        Arc::new(Self {
            name: format!("{} <split>", self.name),
            nodes: self.nodes,
        })
    }
}

/// Backend replaying scripted results, falling back to a default
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Result<usize, CompileError>>>,
    fallback: Result<usize, CompileError>,
    delay: Duration,
    gate: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    fn with(fallback: Result<usize, CompileError>, delay: Duration, open: bool) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay,
            gate: AtomicBool::new(open),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::with(Ok(128), Duration::ZERO, true)
    }

    pub fn failing(error: CompileError) -> Arc<Self> {
        Self::with(Err(error), Duration::ZERO, true)
    }

    /// Succeeds after `delay` unless cancelled first
    pub fn slow(delay: Duration) -> Arc<Self> {
        Self::with(Ok(128), delay, true)
    }

    /// Blocks every compilation until [`Self::open`] is called
    pub fn gated() -> Arc<Self> {
        Self::with(Ok(128), Duration::ZERO, false)
    }

    pub fn open(&self) {
        self.gate.store(true, Ordering::Release);
    }

    /// Queue a result for the next compilation
    pub fn push(&self, result: Result<usize, CompileError>) {
        self.script.lock().push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }
}

impl CompilerBackend for ScriptedBackend {
    fn compile(
        &self,
        unit: &CompilationUnit,
        cancel: &CancelToken,
    ) -> Result<CompiledArtifact, CompileError> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        let started = std::time::Instant::now();
        while !self.gate.load(Ordering::Acquire) || started.elapsed() < self.delay {
            if cancel.is_cancelled() {
                return Err(CompileError::Cancelled(unit.name.clone()));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let next = self.script.lock().pop_front();
        let size = next.unwrap_or_else(|| self.fallback.clone())?;
        Ok(CompiledArtifact::new(unit, size))
    }
}

/// Listener keeping every event it receives
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, matches: impl Fn(&EngineEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| matches(e)).count()
    }
}

impl EngineListener for RecordingListener {
    fn on_event(&self, event: &EngineEvent) {
        self.events.lock().push(event.clone());
    }
}
