//! Per-script execution sessions.
//!
//! One session exists per open script identity. Each `run` request drives
//! the pipeline Idle → Restoring → Compiling → Running → terminal and
//! emits events on the session's broadcast channel. At most one run is in
//! flight per session: a new `run` cancels the active one and waits
//! (bounded) for its single terminal event before starting.
//!
//! Blocking engine work (cargo, rustc, runner IPC) runs under
//! `spawn_blocking`; the async side only coordinates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock as StdRwLock};

use tokio::sync::broadcast;
use tokio::task::{self, JoinHandle};
use tokio::time::{sleep, timeout};

use quill_core::{
    CompileOutcome, CompilerConfig, CompiledScript, DependencyResolver, DirectiveParser,
    OptimizationLevel, PlatformCatalog, ReferenceSet, RunnerCommand, RunnerEvent, RunnerHandle,
    RunnerInputHandle, RunnerKillHandle, RunnerPool, ScriptCompiler, ScriptDirs, ScriptId,
    WorkspaceRegistry,
};

use crate::error::{HostError, HostResult};
use crate::events::{DiagnosticInfo, ExecutionEvent, RunPhase};
use crate::host::{HostConfig, RestorePolicy, RunRequest};
use crate::sink::{CancelToken, EventSink, RunOutcome};

/// Capacity of the per-script broadcast channel.
///
/// 256 events cover normal runs comfortably; a consumer that falls
/// further behind loses the oldest events (broadcast lag), not the
/// stream.
const MESSAGE_CHANNEL_CAPACITY: usize = 256;

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connection state of one in-flight run.
struct ActiveRun {
    /// Cancellation token carried by the run request.
    token: CancelToken,
    /// The run's event sink; closed once its terminal event is out.
    sink: EventSink,
    /// Drive task handle.
    join: JoinHandle<()>,
    /// Kill handle for the runner process, once one is live.
    kill: Arc<StdMutex<Option<RunnerKillHandle>>>,
    /// Input handle for the runner process, once one is live.
    input: Arc<StdMutex<Option<RunnerInputHandle>>>,
    /// Set on `InputRequested`, cleared when input is delivered.
    awaiting_input: Arc<AtomicBool>,
}

/// Execution state for one script identity.
pub(crate) struct ScriptSession {
    id: ScriptId,
    registry: Arc<WorkspaceRegistry>,
    catalog: Arc<PlatformCatalog>,
    pool: Arc<StdMutex<RunnerPool>>,
    config: HostConfig,

    /// Broadcast channel all subscribers of this script share.
    events: broadcast::Sender<ExecutionEvent>,

    /// The in-flight run, if any. The async mutex serializes `run`,
    /// `terminate`, and `send_input` against each other; the drive task
    /// itself never takes it.
    active: tokio::sync::Mutex<Option<ActiveRun>>,

    /// Currently bound reference set, replaced atomically after restore.
    references: StdRwLock<Arc<ReferenceSet>>,

    /// `update_references` was called; the next run restores even on a
    /// matching request hash.
    restore_requested: AtomicBool,

    /// Restore must bypass the resolver cache on the next run.
    force_refresh: AtomicBool,

    /// Pipeline phase for status queries.
    phase: StdRwLock<RunPhase>,
}

impl ScriptSession {
    pub(crate) fn new(
        id: ScriptId,
        registry: Arc<WorkspaceRegistry>,
        catalog: Arc<PlatformCatalog>,
        pool: Arc<StdMutex<RunnerPool>>,
        config: HostConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(MESSAGE_CHANNEL_CAPACITY);
        Self {
            id,
            registry,
            catalog,
            pool,
            config,
            events,
            active: tokio::sync::Mutex::new(None),
            references: StdRwLock::new(Arc::new(ReferenceSet::empty())),
            restore_requested: AtomicBool::new(false),
            force_refresh: AtomicBool::new(false),
            phase: StdRwLock::new(RunPhase::Idle),
        }
    }

    /// Subscribe to this script's event stream.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// Current pipeline phase.
    pub(crate) fn phase(&self) -> RunPhase {
        self.phase.read().map(|phase| *phase).unwrap_or(RunPhase::Idle)
    }

    /// Mark the bound reference set stale.
    ///
    /// With `always_restore`, the next run re-resolves even when the
    /// resolver cache would otherwise satisfy the request hash.
    pub(crate) fn update_references(&self, always_restore: bool) {
        self.restore_requested.store(true, Ordering::SeqCst);
        if always_restore {
            self.force_refresh.store(true, Ordering::SeqCst);
        }
    }

    /// Start a run, superseding any run already in flight.
    pub(crate) async fn run(self: &Arc<Self>, request: RunRequest) -> HostResult<()> {
        // Unknown platforms fail synchronously, before the active run is
        // touched and before any pipeline work.
        self.catalog.platform(request.platform.as_deref())?;

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.wind_down(previous).await;
        }

        let token = request.token.clone();
        let sink = EventSink::new(self.events.clone());
        let kill = Arc::new(StdMutex::new(None));
        let input = Arc::new(StdMutex::new(None));
        let awaiting_input = Arc::new(AtomicBool::new(false));

        let join = tokio::spawn(Arc::clone(self).drive(
            request,
            sink.clone(),
            token.clone(),
            Arc::clone(&kill),
            Arc::clone(&input),
            Arc::clone(&awaiting_input),
        ));

        *active = Some(ActiveRun {
            token,
            sink,
            join,
            kill,
            input,
            awaiting_input,
        });
        Ok(())
    }

    /// Terminate the active run, if any.
    ///
    /// Graceful shutdown first, forced kill after the grace period; a
    /// no-op when nothing is running.
    pub(crate) async fn terminate(&self) {
        let mut active = self.active.lock().await;
        if let Some(run) = active.take() {
            self.wind_down(run).await;
        }
    }

    /// Deliver one input line to the active run.
    ///
    /// Valid only after an unanswered `InputRequested`; in every other
    /// case a silent no-op. Input racing with completion is expected and
    /// is not an error.
    pub(crate) async fn send_input(&self, text: &str) {
        let active = self.active.lock().await;
        let Some(run) = active.as_ref() else {
            return;
        };
        if !run.awaiting_input.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = lock(&run.input).clone();
        drop(active);

        if let Some(handle) = handle
            && let Err(e) = handle.send(text)
        {
            tracing::debug!("Input for script {} dropped: {}", self.id, e);
        }
    }

    /// Cancel `run` and wait (bounded) for its terminal event.
    async fn wind_down(&self, mut run: ActiveRun) {
        run.token.cancel();
        match timeout(self.config.restart_wait, &mut run.join).await {
            Ok(result) => {
                if let Err(e) = result {
                    tracing::warn!("Run task for script {} failed: {}", self.id, e);
                }
            }
            Err(_) => {
                tracing::warn!(
                    "Run on script {} ignored cancellation; forcing teardown",
                    self.id
                );
                run.join.abort();
                if let Some(kill) = lock(&run.kill).take() {
                    kill.kill();
                }
            }
        }
        // Exactly one terminal per run; this is a no-op when the drive
        // task already delivered it.
        if run.sink.finish(RunOutcome::Cancelled) {
            self.set_phase(RunPhase::Cancelled);
        }
    }

    /// Drive one run to its terminal event.
    async fn drive(
        self: Arc<Self>,
        request: RunRequest,
        sink: EventSink,
        token: CancelToken,
        kill_slot: Arc<StdMutex<Option<RunnerKillHandle>>>,
        input_slot: Arc<StdMutex<Option<RunnerInputHandle>>>,
        awaiting_input: Arc<AtomicBool>,
    ) {
        let outcome = self
            .drive_stages(&request, &sink, &token, &kill_slot, &input_slot, &awaiting_input)
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(HostError::Core(quill_core::Error::Aborted)) => RunOutcome::Cancelled,
            Err(e) => {
                tracing::warn!("Run on script {} faulted: {}", self.id, e);
                RunOutcome::Faulted(Some(e.to_string()))
            }
        };

        // Dead handles must not linger: a pooled runner may already be
        // serving another script through the same stdin.
        *lock(&input_slot) = None;
        *lock(&kill_slot) = None;
        awaiting_input.store(false, Ordering::SeqCst);

        self.set_phase(match &outcome {
            RunOutcome::Completed => RunPhase::Completed,
            RunOutcome::Faulted(_) => RunPhase::Faulted,
            RunOutcome::Cancelled => RunPhase::Cancelled,
        });
        sink.finish(outcome);
    }

    async fn drive_stages(
        &self,
        request: &RunRequest,
        sink: &EventSink,
        token: &CancelToken,
        kill_slot: &Arc<StdMutex<Option<RunnerKillHandle>>>,
        input_slot: &Arc<StdMutex<Option<RunnerInputHandle>>>,
        awaiting_input: &Arc<AtomicBool>,
    ) -> HostResult<RunOutcome> {
        let unit = self.registry.get(self.id)?;
        let ancestors = self.registry.ancestors(self.id)?;
        let platform = self.catalog.platform(request.platform.as_deref())?.clone();

        // Restore stage; skipped entirely when the bound set still
        // satisfies the declared requests.
        token.flag().bail_if_cancelled()?;
        let requests = DirectiveParser::parse(&unit.source);
        let restore_requested = self.restore_requested.load(Ordering::SeqCst);
        let force_refresh = self.force_refresh.load(Ordering::SeqCst);
        let bound = self.current_references();

        if restore_requested || force_refresh || !bound.satisfies(&requests) {
            self.set_phase(RunPhase::Restoring);
            sink.emit(ExecutionEvent::RestoreStarted);

            let working_dir = unit.working_dir.clone();
            let cargo = self.catalog.cargo_path().clone();
            let resolve_requests = requests.clone();
            let restore = task::spawn_blocking(move || {
                let resolver = DependencyResolver::new(&working_dir, cargo)?;
                resolver.resolve(&resolve_requests, force_refresh)
            })
            .await;

            let outcome = match restore {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    // Resolver infrastructure failure (io, lock), not a
                    // per-package resolution error.
                    sink.emit(ExecutionEvent::RestoreCompleted {
                        success: false,
                        errors: vec![e.to_string()],
                    });
                    sink.emit(ExecutionEvent::CompilationDiagnostics {
                        diagnostics: vec![DiagnosticInfo::error(e.to_string())],
                    });
                    return Ok(RunOutcome::Faulted(None));
                }
                Err(join) => {
                    sink.emit(ExecutionEvent::RestoreCompleted {
                        success: false,
                        errors: vec![join.to_string()],
                    });
                    return Err(HostError::Task(join.to_string()));
                }
            };

            sink.emit(ExecutionEvent::RestoreCompleted {
                success: outcome.success,
                errors: outcome.errors.clone(),
            });

            let applied = outcome.success
                || matches!(self.config.restore_policy, RestorePolicy::BestEffort);
            if applied {
                self.store_references(outcome.references);
                self.restore_requested.store(false, Ordering::SeqCst);
                self.force_refresh.store(false, Ordering::SeqCst);
            } else {
                // Strict policy: surface the errors as diagnostics and
                // refuse to execute. Compiling never starts.
                let diagnostics = outcome
                    .errors
                    .iter()
                    .map(|error| DiagnosticInfo::error(error.clone()))
                    .collect();
                sink.emit(ExecutionEvent::CompilationDiagnostics { diagnostics });
                return Ok(RunOutcome::Faulted(None));
            }
        }

        // Compile stage.
        token.flag().bail_if_cancelled()?;
        self.set_phase(RunPhase::Compiling);

        let references = self.current_references();
        let artifact = match self
            .compile(&unit, &ancestors, &references, request.optimization)
            .await?
        {
            CompileOutcome::Failed { diagnostics } => {
                sink.emit(ExecutionEvent::CompilationDiagnostics {
                    diagnostics: diagnostics.iter().map(DiagnosticInfo::from).collect(),
                });
                return Ok(RunOutcome::Faulted(None));
            }
            CompileOutcome::Success {
                artifact,
                diagnostics,
            } => {
                if !diagnostics.is_empty() {
                    sink.emit(ExecutionEvent::CompilationDiagnostics {
                        diagnostics: diagnostics.iter().map(DiagnosticInfo::from).collect(),
                    });
                }
                artifact
            }
            CompileOutcome::Cached(artifact) => {
                tracing::debug!("Script {} compiled from cache", self.id);
                artifact
            }
        };

        if request.disassemble {
            self.emit_disassembly(&unit, &ancestors, &references, request.optimization, sink)
                .await;
        }

        // Run stage.
        token.flag().bail_if_cancelled()?;
        self.set_phase(RunPhase::Running);

        let runner = {
            let pool = Arc::clone(&self.pool);
            let runner_path = platform.runner_path.clone();
            task::spawn_blocking(move || lock(&pool).get(&runner_path))
                .await
                .map_err(|e| HostError::Task(e.to_string()))??
        };

        *lock(kill_slot) = Some(runner.kill_handle());
        *lock(input_slot) = Some(runner.input_handle());

        // The watcher turns a cancellation into graceful shutdown, then a
        // forced kill once the grace period elapses. Killing is what
        // unblocks the event loop when the script never yields.
        let watcher = {
            let token = token.clone();
            let kill_slot = Arc::clone(kill_slot);
            let input_slot = Arc::clone(input_slot);
            let grace = self.config.termination_grace;
            tokio::spawn(async move {
                token.cancelled().await;
                let kill = lock(&kill_slot).take();
                if let Some(input) = lock(&input_slot).clone()
                    && let Err(e) = input.request_shutdown()
                {
                    tracing::debug!("Graceful shutdown request failed: {}", e);
                }
                sleep(grace).await;
                if let Some(kill) = kill {
                    tracing::debug!("Shutdown grace period elapsed; killing runner");
                    kill.kill();
                }
            })
        };

        let loop_result = self
            .run_event_loop(runner, &unit, &artifact, sink, token, awaiting_input)
            .await;
        watcher.abort();

        match loop_result {
            Ok((runner, finished)) => {
                if finished {
                    let pool = Arc::clone(&self.pool);
                    let _ = task::spawn_blocking(move || lock(&pool).put(runner)).await;
                    Ok(RunOutcome::Completed)
                } else {
                    // Cancelled mid-run; the handle's drop kills the
                    // process instead of pooling it.
                    let _ = task::spawn_blocking(move || drop(runner)).await;
                    Ok(RunOutcome::Cancelled)
                }
            }
            Err(e) => {
                if token.is_cancelled() {
                    return Ok(RunOutcome::Cancelled);
                }
                Ok(RunOutcome::Faulted(Some(format!(
                    "runner process failed: {e}"
                ))))
            }
        }
    }

    /// Compile the script off the async threads.
    async fn compile(
        &self,
        unit: &Arc<quill_core::CompilationUnit>,
        ancestors: &[Arc<quill_core::CompilationUnit>],
        references: &Arc<ReferenceSet>,
        optimization: OptimizationLevel,
    ) -> HostResult<CompileOutcome> {
        let rustc = self.catalog.rustc_path().clone();
        let unit = Arc::clone(unit);
        let ancestors = ancestors.to_vec();
        let references = (**references).clone();

        task::spawn_blocking(move || -> quill_core::Result<CompileOutcome> {
            let dirs = ScriptDirs::from_working_dir(&unit.working_dir)?;
            let mut config = CompilerConfig::for_workspace(&dirs);
            config.debug_info = optimization == OptimizationLevel::Debug;
            let compiler = ScriptCompiler::new(config, rustc);
            Ok(compiler.compile(&unit, &ancestors, &references, optimization))
        })
        .await
        .map_err(|e| HostError::Task(e.to_string()))?
        .map_err(HostError::Core)
    }

    /// Produce and emit the assembly listing. Best effort: failures are
    /// logged, never faulted.
    async fn emit_disassembly(
        &self,
        unit: &Arc<quill_core::CompilationUnit>,
        ancestors: &[Arc<quill_core::CompilationUnit>],
        references: &Arc<ReferenceSet>,
        optimization: OptimizationLevel,
        sink: &EventSink,
    ) {
        let rustc = self.catalog.rustc_path().clone();
        let unit = Arc::clone(unit);
        let ancestors = ancestors.to_vec();
        let references = (**references).clone();

        let result = task::spawn_blocking(move || {
            let dirs = ScriptDirs::from_working_dir(&unit.working_dir)?;
            let mut config = CompilerConfig::for_workspace(&dirs);
            config.debug_info = optimization == OptimizationLevel::Debug;
            let compiler = ScriptCompiler::new(config, rustc);
            compiler.disassemble(&unit, &ancestors, &references, optimization)
        })
        .await;

        match result {
            Ok(Ok(text)) => sink.emit(ExecutionEvent::Disassembly { text }),
            Ok(Err(e)) => tracing::warn!("Disassembly for script {} failed: {}", self.id, e),
            Err(join) => tracing::warn!("Disassembly task failed: {}", join),
        }
    }

    /// Feed the artifact to the runner and pump its events into the sink.
    ///
    /// Returns the handle and whether the run finished cleanly (only a
    /// clean finish allows pooling).
    async fn run_event_loop(
        &self,
        runner: RunnerHandle,
        unit: &Arc<quill_core::CompilationUnit>,
        artifact: &CompiledScript,
        sink: &EventSink,
        token: &CancelToken,
        awaiting_input: &Arc<AtomicBool>,
    ) -> quill_core::Result<(RunnerHandle, bool)> {
        let command = RunnerCommand::Run {
            artifact_path: artifact.dylib_path.display().to_string(),
            entry_symbol: artifact.entry_symbol.clone(),
            script_name: format!("script-{}", self.id),
            working_dir: unit.working_dir.display().to_string(),
        };

        let sink = sink.clone();
        let token = token.clone();
        let awaiting_input = Arc::clone(awaiting_input);

        let handle = task::spawn_blocking(move || {
            let mut runner = runner;
            runner.send_command(&command)?;
            loop {
                match runner.recv_event() {
                    Ok(RunnerEvent::Output { text }) => {
                        sink.emit(ExecutionEvent::Output { text });
                    }
                    Ok(RunnerEvent::RuntimeError { message }) => {
                        sink.emit(ExecutionEvent::RuntimeError { message });
                    }
                    Ok(RunnerEvent::Progress { percent }) => {
                        sink.emit(ExecutionEvent::Progress { percent });
                    }
                    Ok(RunnerEvent::ReadInput) => {
                        awaiting_input.store(true, Ordering::SeqCst);
                        sink.emit(ExecutionEvent::InputRequested);
                    }
                    Ok(RunnerEvent::Finished) => return Ok((runner, true)),
                    Ok(RunnerEvent::ShuttingDown) => return Ok((runner, false)),
                    Ok(RunnerEvent::Pong) => {}
                    Err(e) => {
                        if token.is_cancelled() {
                            // Killed or shut down by the watcher.
                            return Ok((runner, false));
                        }
                        return Err(e);
                    }
                }
            }
        });

        handle
            .await
            .map_err(|e| quill_core::Error::Process(format!("runner event loop failed: {e}")))?
    }

    fn current_references(&self) -> Arc<ReferenceSet> {
        self.references
            .read()
            .map(|references| references.clone())
            .unwrap_or_else(|_| Arc::new(ReferenceSet::empty()))
    }

    fn store_references(&self, references: ReferenceSet) {
        if let Ok(mut guard) = self.references.write() {
            *guard = Arc::new(references);
        }
    }

    fn set_phase(&self, phase: RunPhase) {
        if let Ok(mut guard) = self.phase.write() {
            *guard = phase;
        }
    }
}
