//! The FastEdge debug adapter: what each protocol command actually does.
//!
//! Only three commands do anything.  `initialize` reports that no optional features are
//! supported, `launch` starts the FastEdge runner on a wasm app and streams its output to the
//! client, and `disconnect` stops it.  Everything else is answered with an `unsupported` error.
use crate::capabilities::Capabilities;
use crate::command::Command;
use crate::launch::{LaunchConfig, LaunchError};
use crate::relay::{relay_output, KillSwitch, Worker, WorkerSlot};
use fedap_session::{
    Event, OutputCategory, Request, RequestHandler, Response, SessionContext, SessionService,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::*;

/// Error message for every command the adapter doesn't implement
pub const UNSUPPORTED: &str = "unsupported";

/// Error message for a `launch` that couldn't be carried out.
///
/// Deliberately distinct from [`UNSUPPORTED`], so a client can tell a failed launch from a command
/// the adapter doesn't have.  Older adapters answered both with `unsupported`; don't fold them back
/// together.
pub const INVALID_REQUEST: &str = "invalid request";

/// File name of the runner shipped next to the adapter executable on this platform
#[cfg(windows)]
pub const DEFAULT_RUNNER: &str = "cli.exe";
#[cfg(target_os = "macos")]
pub const DEFAULT_RUNNER: &str = "cli-darwin-arm64";
#[cfg(not(any(windows, target_os = "macos")))]
pub const DEFAULT_RUNNER: &str = "cli-linux-x64";

#[derive(Clone, Debug)]
pub struct AdapterConfig {
    /// The FastEdge runner executable started by `launch`, unless the launch request names its
    /// own
    pub runner: PathBuf,
}

impl AdapterConfig {
    pub fn new(runner: impl Into<PathBuf>) -> Self {
        Self {
            runner: runner.into(),
        }
    }

    /// Use [`DEFAULT_RUNNER`] in the same directory as the running executable
    pub fn with_default_runner() -> Result<Self, LaunchError> {
        let exe = std::env::current_exe().map_err(LaunchError::RunnerLocation)?;
        let runner = match exe.parent() {
            Some(dir) => dir.join(DEFAULT_RUNNER),
            None => PathBuf::from(DEFAULT_RUNNER),
        };

        Ok(Self::new(runner))
    }
}

/// The adapter service.  One instance serves every session.
#[derive(Clone, Debug)]
pub struct Adapter {
    config: Arc<AdapterConfig>,
}

impl Adapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl SessionService for Adapter {
    type Handler = AdapterSession;

    fn new_session(&self, context: SessionContext) -> AdapterSession {
        debug!(session = %context.id(), "New adapter session");

        AdapterSession {
            context,
            config: self.config.clone(),
            worker: WorkerSlot::new(),
        }
    }
}

/// Per-session adapter state.  Clones share the same session and the same tracked worker.
#[derive(Clone, Debug)]
pub struct AdapterSession {
    context: SessionContext,
    config: Arc<AdapterConfig>,
    worker: WorkerSlot,
}

#[async_trait::async_trait]
impl RequestHandler for AdapterSession {
    async fn handle_request(&self, request: Request) {
        use Command::*;

        match Command::parse(&request.command) {
            Initialize => self.initialize(&request).await,
            Launch => self.launch(&request).await,
            Disconnect => self.disconnect(&request).await,

            Attach
            | BreakpointLocations
            | Cancel
            | Completions
            | ConfigurationDone
            | Continue
            | DataBreakpointInfo
            | Disassemble
            | Evaluate
            | ExceptionInfo
            | Goto
            | GotoTargets
            | LoadedSources
            | Modules
            | Next
            | Pause
            | ReadMemory
            | Restart
            | RestartFrame
            | ReverseContinue
            | Scopes
            | SetBreakpoints
            | SetDataBreakpoints
            | SetExceptionBreakpoints
            | SetExpression
            | SetFunctionBreakpoints
            | SetInstructionBreakpoints
            | SetVariable
            | Source
            | StackTrace
            | StepBack
            | StepIn
            | StepInTargets
            | StepOut
            | Terminate
            | TerminateThreads
            | Threads
            | Variables
            | WriteMemory
            | Unknown(_) => self.unsupported(&request).await,
        }
    }
}

impl AdapterSession {
    /// Announce readiness and report that nothing optional is supported.
    ///
    /// The `initialized` event goes out first; there is no configuration step to wait for.
    async fn initialize(&self, request: &Request) {
        self.context.send(Event::new("initialized", None)).await;
        self.context
            .send(Response::success(request, Capabilities::none().to_json()))
            .await;
    }

    /// Start the runner, relay its output until it exits, then tell the client it's gone.
    ///
    /// This doesn't return until the worker has exited and been reclaimed, so the session can't
    /// finish shutting down while a worker is still running.
    async fn launch(&self, request: &Request) {
        let config = match LaunchConfig::from_arguments(request.arguments.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = ?e, "Rejecting launch request");
                return self.invalid_request(request).await;
            }
        };

        let runner = config
            .cli_path
            .clone()
            .unwrap_or_else(|| self.config.runner.clone());
        let mut worker = match Worker::spawn(&runner, &config) {
            Ok(worker) => worker,
            Err(e) => {
                error!(error = ?e, "Unable to start worker");
                return self.invalid_request(request).await;
            }
        };

        let (stdout, stderr) = worker.take_output();
        let (switch, kill_requests) = KillSwitch::pair();
        let generation = self.worker.track(switch).await;

        self.context.send(Response::success(request, None)).await;
        self.context
            .send(Event::output(OutputCategory::Stderr, config.serving_banner()))
            .await;

        let (_, _, status) = tokio::join!(
            relay_output(stdout, OutputCategory::Stdout, &self.context),
            relay_output(stderr, OutputCategory::Stderr, &self.context),
            worker.supervise(kill_requests, self.context.shutdown_token().clone()),
        );
        self.worker.release(generation).await;

        match status {
            Ok(status) => {
                info!(%status, "Worker finished");
                if let Some(code) = status.code() {
                    self.context
                        .send(Event::new("exited", json!({ "exitCode": code })))
                        .await;
                }
            }
            Err(e) => {
                error!(error = %e, "Unable to reclaim worker");
            }
        }
        self.context.send(Event::new("terminated", None)).await;
    }

    /// Kill the worker if there is one.  Always succeeds.
    async fn disconnect(&self, request: &Request) {
        if !self.worker.kill().await {
            debug!("Disconnect with no worker running");
        }

        self.context.send(Response::success(request, None)).await;
    }

    async fn unsupported(&self, request: &Request) {
        debug!(command = %request.command, "Unsupported command");
        self.context
            .send(Response::error(request, UNSUPPORTED))
            .await;
    }

    async fn invalid_request(&self, request: &Request) {
        self.context
            .send(Response::error(request, INVALID_REQUEST))
            .await;
    }
}
