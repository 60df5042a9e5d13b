//! The execution host façade.
//!
//! Owns the script registry, the detected toolchain catalog, and the
//! runner pool; hands each open script a session that drives its runs.
//! The host is cheap to clone and safe to share across tasks.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::{RwLock, broadcast};

use quill_core::{
    CompilationUnit, OpenArgs, OptimizationLevel, PlatformCatalog, RunnerPool, ScriptId,
    WorkspaceRegistry,
};

use crate::error::{HostError, HostResult};
use crate::events::{ExecutionEvent, RunPhase};
use crate::session::ScriptSession;
use crate::sink::CancelToken;

/// How restore failures affect a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RestorePolicy {
    /// A failed restore faults the run; compilation never starts.
    #[default]
    Strict,
    /// Failures are reported but the run continues with whatever
    /// resolved.
    BestEffort,
}

/// Host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Restore failure handling.
    pub restore_policy: RestorePolicy,

    /// Time a cancelled script gets to wind down before its runner is
    /// killed.
    pub termination_grace: Duration,

    /// Time a superseding run (or `terminate`) waits for the previous
    /// run's terminal event before forcing teardown.
    pub restart_wait: Duration,

    /// Maximum idle runner processes kept for reuse.
    pub pool_size: usize,

    /// Runner processes spawned up front so the first runs skip spawn
    /// latency. Zero (the default) spawns lazily.
    pub pool_warm: usize,

    /// Explicit runner binary path; replaces the detected host-platform
    /// runner.
    pub runner_path: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            restore_policy: RestorePolicy::default(),
            termination_grace: Duration::from_millis(500),
            restart_wait: Duration::from_secs(10),
            pool_size: 4,
            pool_warm: 0,
            runner_path: None,
        }
    }
}

/// Parameters of one run request.
#[derive(Clone, Default)]
pub struct RunRequest {
    /// Optimization level for this run.
    pub optimization: OptimizationLevel,
    /// Target platform id; `None` selects the host platform.
    pub platform: Option<String>,
    /// Emit a `Disassembly` event after a successful compile.
    pub disassemble: bool,
    /// Cancellation token; cancel it to stop the run early.
    pub token: CancelToken,
}

impl RunRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile with optimizations.
    pub fn release(mut self) -> Self {
        self.optimization = OptimizationLevel::Release;
        self
    }

    /// Target a specific execution platform.
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    /// Request the assembly listing alongside execution.
    pub fn with_disassembly(mut self) -> Self {
        self.disassemble = true;
        self
    }

    /// Attach a caller-held cancellation token.
    pub fn with_token(mut self, token: CancelToken) -> Self {
        self.token = token;
        self
    }
}

/// The execution host.
///
/// One session per open script identity; sessions are created at `open`
/// and released at `close`. All handles share the same registry, catalog,
/// and runner pool.
#[derive(Clone)]
pub struct ExecutionHost {
    registry: Arc<WorkspaceRegistry>,
    catalog: Arc<PlatformCatalog>,
    pool: Arc<StdMutex<RunnerPool>>,
    sessions: Arc<RwLock<FxHashMap<ScriptId, Arc<ScriptSession>>>>,
    config: HostConfig,
}

impl ExecutionHost {
    /// Detect the toolchain and build a host.
    ///
    /// Fails when rustc or cargo cannot be found, or when a requested
    /// pre-warm cannot spawn the runner binary.
    pub fn new(config: HostConfig) -> HostResult<Self> {
        let mut catalog = PlatformCatalog::detect()?;
        if let Some(path) = &config.runner_path {
            catalog = catalog.with_runner(path.clone());
        }

        let pool = if config.pool_warm > 0 {
            let host_platform = catalog.platform(None)?;
            RunnerPool::with_warm_runners(
                &host_platform.runner_path,
                config.pool_size,
                config.pool_warm,
            )?
        } else {
            RunnerPool::new(config.pool_size)
        };

        Ok(Self {
            registry: Arc::new(WorkspaceRegistry::new()),
            catalog: Arc::new(catalog),
            pool: Arc::new(StdMutex::new(pool)),
            sessions: Arc::new(RwLock::new(FxHashMap::default())),
            config,
        })
    }

    pub fn with_defaults() -> HostResult<Self> {
        Self::new(HostConfig::default())
    }

    /// Open a top-level script.
    pub async fn open(&self, args: OpenArgs) -> HostResult<ScriptId> {
        let id = self.registry.open(args)?;
        self.insert_session(id).await;
        Ok(id)
    }

    /// Open a script whose compilation chains onto `parent`.
    ///
    /// The new script sees items and dependencies of its whole ancestor
    /// chain.
    pub async fn open_related(&self, parent: ScriptId, args: OpenArgs) -> HostResult<ScriptId> {
        let id = self.registry.open_related(parent, args, true)?;
        self.insert_session(id).await;
        Ok(id)
    }

    /// Replace a script's source text.
    ///
    /// Takes effect on the next run; an in-flight run keeps its snapshot.
    pub fn update(&self, id: ScriptId, source: &str) -> HostResult<()> {
        Ok(self.registry.update(id, source)?)
    }

    /// Suppress a diagnostic code or lint name for a script.
    pub fn add_suppression(&self, id: ScriptId, name: &str) -> HostResult<()> {
        Ok(self.registry.add_suppression(id, name)?)
    }

    /// Close a script identity.
    ///
    /// Refused while other open scripts chain onto it. Otherwise the
    /// active run is terminated and awaited before the identity is
    /// released.
    pub async fn close(&self, id: ScriptId) -> HostResult<()> {
        if !self.registry.dependents(id)?.is_empty() {
            return Err(HostError::Core(quill_core::Error::DocumentReferenced(id)));
        }
        if let Some(session) = self.sessions.read().await.get(&id).cloned() {
            session.terminate().await;
        }
        self.registry.close(id)?;
        self.sessions.write().await.remove(&id);
        Ok(())
    }

    /// Immutable snapshot of a script's compile-relevant state.
    pub fn snapshot(&self, id: ScriptId) -> HostResult<Arc<CompilationUnit>> {
        Ok(self.registry.get(id)?)
    }

    /// Whether `id` refers to an open script.
    pub fn contains(&self, id: ScriptId) -> bool {
        self.registry.contains(id)
    }

    /// Number of open scripts.
    pub fn open_count(&self) -> usize {
        self.registry.open_count()
    }

    /// Subscribe to a script's event stream.
    ///
    /// Every subscriber sees the same events in the same order; events
    /// emitted before subscription are not replayed.
    pub async fn subscribe(&self, id: ScriptId) -> HostResult<broadcast::Receiver<ExecutionEvent>> {
        Ok(self.session(id).await?.subscribe())
    }

    /// Run a script, superseding any run already in flight for it.
    ///
    /// Returns once the pipeline is started; progress and the terminal
    /// event arrive on the subscription.
    pub async fn run(&self, id: ScriptId, request: RunRequest) -> HostResult<()> {
        self.session(id).await?.run(request).await
    }

    /// Terminate the active run of a script; a no-op when idle.
    pub async fn terminate(&self, id: ScriptId) -> HostResult<()> {
        self.session(id).await?.terminate().await;
        Ok(())
    }

    /// Deliver one line of input to a script blocked on `InputRequested`.
    ///
    /// Silently ignored in every other state.
    pub async fn send_input(&self, id: ScriptId, text: &str) -> HostResult<()> {
        self.session(id).await?.send_input(text).await;
        Ok(())
    }

    /// Mark a script's bound references stale so the next run restores.
    ///
    /// With `always_restore`, the restore also bypasses the resolver
    /// cache.
    pub async fn update_references(&self, id: ScriptId, always_restore: bool) -> HostResult<()> {
        self.session(id).await?.update_references(always_restore);
        Ok(())
    }

    /// Current pipeline phase of a script.
    pub async fn phase(&self, id: ScriptId) -> HostResult<RunPhase> {
        Ok(self.session(id).await?.phase())
    }

    /// Toolchain and platform catalog in use.
    pub fn catalog(&self) -> &PlatformCatalog {
        &self.catalog
    }

    async fn insert_session(&self, id: ScriptId) {
        let session = Arc::new(ScriptSession::new(
            id,
            Arc::clone(&self.registry),
            Arc::clone(&self.catalog),
            Arc::clone(&self.pool),
            self.config.clone(),
        ));
        self.sessions.write().await.insert(id, session);
    }

    async fn session(&self, id: ScriptId) -> HostResult<Arc<ScriptSession>> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| HostError::Core(quill_core::Error::UnknownScript(id)))
    }
}
