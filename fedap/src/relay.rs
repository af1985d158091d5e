//! The worker process behind a `launch`: starting it, relaying its output to the client, and
//! stopping it.
//!
//! A running worker is owned by the `launch` handler that started it.  Other handlers reach it
//! only through the session's [`WorkerSlot`], which holds a [`KillSwitch`] for the most recently
//! launched worker.
use crate::launch::{LaunchConfig, LaunchError};
use fedap_session::{Event, OutputCategory, SessionContext};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Size of each read from the worker's output streams.  Each non-empty read becomes one output
/// event.
pub const CHUNK_SIZE: usize = 1024;

/// A started worker process whose output has not been claimed yet
#[derive(Debug)]
pub struct Worker {
    child: Child,
}

impl Worker {
    /// Start the runner at `runner` with the command line described by `config`.
    ///
    /// stdout and stderr are piped so they can be relayed; stdin is closed.  If the returned
    /// `Worker` is dropped the process is killed.
    pub fn spawn(runner: &Path, config: &LaunchConfig) -> Result<Self, LaunchError> {
        let args = config.worker_args();
        debug!(runner = %runner.display(), ?args, "Starting worker");

        let child = Command::new(runner)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                runner: runner.to_path_buf(),
                source,
            })?;

        info!(pid = ?child.id(), runner = %runner.display(), "Worker started");
        Ok(Self { child })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Take the worker's two output streams.
    ///
    /// A stream that can't be had is logged and comes back as `None`; there is simply nothing to
    /// relay from it.
    pub fn take_output(&mut self) -> (Option<ChildStdout>, Option<ChildStderr>) {
        let stdout = self.child.stdout.take();
        if stdout.is_none() {
            warn!(pid = ?self.id(), "Worker stdout is not available; it will not be relayed");
        }

        let stderr = self.child.stderr.take();
        if stderr.is_none() {
            warn!(pid = ?self.id(), "Worker stderr is not available; it will not be relayed");
        }

        (stdout, stderr)
    }

    /// Wait for the worker to exit, and reclaim it.
    ///
    /// The worker is killed first if a kill request arrives on `kill_requests`, or if `shutdown`
    /// is cancelled.  A kill request is acknowledged only once the process has been reclaimed.
    #[instrument(skip_all, fields(pid = ?self.id()))]
    pub async fn supervise(
        mut self,
        mut kill_requests: mpsc::Receiver<oneshot::Sender<()>>,
        shutdown: CancellationToken,
    ) -> std::io::Result<ExitStatus> {
        // If the kill switch is dropped (a newer launch replaced this one) `recv` yields `None`
        // and that branch is disabled; the worker then runs until it exits or shutdown
        let ack = tokio::select! {
            status = self.child.wait() => {
                debug!(?status, "Worker exited on its own");
                return status;
            }
            Some(ack) = kill_requests.recv() => {
                info!("Kill requested");
                Some(ack)
            }
            _ = shutdown.cancelled() => {
                info!("Session shutting down; killing worker");
                None
            }
        };

        if let Err(e) = self.child.kill().await {
            // Most likely it exited between the request and now
            warn!(error = %e, "Failed to kill worker");
        }
        let status = self.child.wait().await;
        debug!(?status, "Worker reclaimed");

        if let Some(ack) = ack {
            // The requester may have given up waiting; nothing to do about that
            let _ = ack.send(());
        }

        status
    }
}

/// Copy one of the worker's output streams to the client as `output` events, one event per read
/// of up to [`CHUNK_SIZE`] bytes.
///
/// Stops at end of stream, on a read error, or when the session shuts down.  Bytes that aren't
/// valid UTF-8 are replaced rather than dropped.
pub async fn relay_output<R>(stream: Option<R>, category: OutputCategory, context: &SessionContext)
where
    R: AsyncRead + Unpin,
{
    let Some(mut stream) = stream else {
        return;
    };

    let mut buf = [0u8; CHUNK_SIZE];
    let mut relayed = 0usize;
    loop {
        let read = tokio::select! {
            _ = context.shutdown_token().cancelled() => {
                debug!(category = category.as_str(), "Session shutting down; relay stopped");
                break;
            }
            read = stream.read(&mut buf) => read,
        };

        match read {
            Ok(0) => break,
            Ok(n) => {
                relayed += n;
                let text = String::from_utf8_lossy(&buf[..n]);
                context.send(Event::output(category, text)).await;
            }
            Err(e) => {
                debug!(category = category.as_str(), error = %e, "Error reading worker output; relay stopped");
                break;
            }
        }
    }

    debug!(category = category.as_str(), bytes = relayed, "Relay finished");
}

/// Handle for asking a running worker to die
#[derive(Clone, Debug)]
pub struct KillSwitch {
    requests: mpsc::Sender<oneshot::Sender<()>>,
}

impl KillSwitch {
    /// Make a kill switch and the receiving end to hand to [`Worker::supervise`]
    pub fn pair() -> (Self, mpsc::Receiver<oneshot::Sender<()>>) {
        let (requests, receiver) = mpsc::channel(1);
        (Self { requests }, receiver)
    }

    /// Kill the worker and wait until it has been reclaimed.
    ///
    /// Returns immediately if the worker is already gone.
    pub async fn kill(&self) {
        let (ack, done) = oneshot::channel();
        if self.requests.send(ack).await.is_err() {
            debug!("Worker already gone; nothing to kill");
            return;
        }

        if done.await.is_err() {
            debug!("Worker went away before acknowledging the kill");
        }
    }
}

/// The one worker a session is tracking, if any.
///
/// Cheap to clone; all clones refer to the same slot.  Each tracked worker gets a generation
/// number so that a finished launch only clears the slot if it still holds that launch's worker.
#[derive(Clone, Debug, Default)]
pub struct WorkerSlot {
    current: Arc<Mutex<Option<(u64, KillSwitch)>>>,
    generations: Arc<AtomicU64>,
}

impl WorkerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a new worker, replacing whatever was tracked before.  Returns the
    /// generation to pass to [`Self::release`].
    pub async fn track(&self, switch: KillSwitch) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let previous = self.current.lock().await.replace((generation, switch));
        if let Some((previous, _)) = previous {
            debug!(previous, generation, "Replacing tracked worker");
        }

        generation
    }

    /// Stop tracking the worker of `generation`, if it is still the tracked one
    pub async fn release(&self, generation: u64) {
        let mut current = self.current.lock().await;
        if matches!(&*current, Some((tracked, _)) if *tracked == generation) {
            *current = None;
        }
    }

    /// Kill the tracked worker, if there is one, and wait until it is reclaimed.
    ///
    /// Returns `false` if no worker was being tracked.
    pub async fn kill(&self) -> bool {
        // Don't hold the lock across the kill; the launch handler needs it to release the slot
        let tracked = self.current.lock().await.take();
        match tracked {
            Some((generation, switch)) => {
                debug!(generation, "Killing tracked worker");
                switch.kill().await;
                true
            }
            None => false,
        }
    }

    pub async fn is_tracking(&self) -> bool {
        self.current.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedap_session::{
        DapCodec, Message, Request, RequestHandler, Response, Session, SessionConfig,
        SessionService, StreamTransport,
    };
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::codec::{FramedRead, FramedWrite};

    /// Runs relays from inside a real session, so their events go through the real outbound queue
    struct RelayService;

    impl SessionService for RelayService {
        type Handler = RelayHandler;

        fn new_session(&self, context: SessionContext) -> RelayHandler {
            RelayHandler { context }
        }
    }

    #[derive(Clone)]
    struct RelayHandler {
        context: SessionContext,
    }

    #[async_trait::async_trait]
    impl RequestHandler for RelayHandler {
        async fn handle_request(&self, request: Request) {
            match request.command.as_str() {
                "missing" => {
                    relay_output(None::<ChildStdout>, OutputCategory::Stdout, &self.context).await;
                    relay_output(None::<ChildStderr>, OutputCategory::Stderr, &self.context).await;
                    self.context.send(Response::success(&request, None)).await;
                }
                "stdout-only" => {
                    // stderr goes nowhere, so there is no stderr stream to take
                    let child = Command::new("echo")
                        .arg("hello")
                        .stdout(Stdio::piped())
                        .stderr(Stdio::null())
                        .kill_on_drop(true)
                        .spawn()
                        .unwrap();
                    let mut worker = Worker { child };
                    let (stdout, stderr) = worker.take_output();
                    let stderr_missing = stderr.is_none();
                    let (again_stdout, again_stderr) = worker.take_output();
                    let second_take_empty = again_stdout.is_none() && again_stderr.is_none();

                    let (_switch, kill_requests) = KillSwitch::pair();
                    let (_, _, status) = tokio::join!(
                        relay_output(stdout, OutputCategory::Stdout, &self.context),
                        relay_output(stderr, OutputCategory::Stderr, &self.context),
                        worker.supervise(kill_requests, self.context.shutdown_token().clone()),
                    );

                    self.context
                        .send(Response::success(
                            &request,
                            json!({
                                "stderrMissing": stderr_missing,
                                "secondTakeEmpty": second_take_empty,
                                "exitedCleanly": status.map(|s| s.success()).unwrap_or(false),
                            }),
                        ))
                        .await;
                }
                _ => {
                    self.context
                        .send(Response::error(&request, "unsupported"))
                        .await;
                }
            }
        }
    }

    /// Send one request to a fresh session and collect everything it writes, up to and including
    /// the response
    async fn run_one(command: &str) -> Vec<Message> {
        crate::test_helpers::init_test_logging();

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_rx, server_tx) = tokio::io::split(server);
        let (client_rx, client_tx) = tokio::io::split(client);

        let session = Session::new(
            StreamTransport::new(server_rx, server_tx, "test-client"),
            SessionConfig::default(),
        );
        let handle = tokio::spawn(async move { session.run(&RelayService).await });

        let mut writer = FramedWrite::new(client_tx, DapCodec::new());
        let mut reader = FramedRead::new(client_rx, DapCodec::new());
        writer
            .send(Message::Request(Request::new(1, command, None)))
            .await
            .unwrap();

        let mut messages = Vec::new();
        loop {
            let message = tokio::time::timeout(Duration::from_secs(10), reader.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let done = matches!(message, Message::Response(_));
            messages.push(message);
            if done {
                break;
            }
        }

        writer.close().await.unwrap();
        while let Some(message) = reader.next().await {
            messages.push(message.unwrap());
        }
        handle.await.unwrap().unwrap();

        messages
    }

    fn outputs(messages: &[Message], category: &str) -> String {
        messages
            .iter()
            .filter_map(|message| match message {
                Message::Event(event) if event.event == "output" => event.body.as_ref(),
                _ => None,
            })
            .filter(|body| body["category"] == category)
            .filter_map(|body| body["output"].as_str())
            .collect()
    }

    #[tokio::test]
    async fn missing_streams_relay_nothing() {
        let messages = run_one("missing").await;

        assert_eq!(messages.len(), 1);
        assert!(matches!(&messages[0], Message::Response(response) if response.success));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn only_the_available_stream_is_relayed() {
        let messages = run_one("stdout-only").await;

        assert_eq!(outputs(&messages, "stdout"), "hello\n");
        assert_eq!(outputs(&messages, "stderr"), "");

        let response = match messages.last() {
            Some(Message::Response(response)) => response,
            other => panic!("expected a response last, got {other:?}"),
        };
        assert_eq!(
            response.body,
            Some(json!({
                "stderrMissing": true,
                "secondTakeEmpty": true,
                "exitedCleanly": true,
            }))
        );
    }

    #[tokio::test]
    async fn kill_on_empty_slot_is_a_no_op() {
        let slot = WorkerSlot::new();
        assert!(!slot.kill().await);
        assert!(!slot.is_tracking().await);
    }

    #[tokio::test]
    async fn release_only_clears_its_own_generation() {
        let slot = WorkerSlot::new();
        let (first, _first_rx) = KillSwitch::pair();
        let (second, _second_rx) = KillSwitch::pair();

        let first_generation = slot.track(first).await;
        let second_generation = slot.track(second).await;
        assert_ne!(first_generation, second_generation);

        slot.release(first_generation).await;
        assert!(slot.is_tracking().await);

        slot.release(second_generation).await;
        assert!(!slot.is_tracking().await);
    }

    #[tokio::test]
    async fn kill_switch_returns_when_worker_is_gone() {
        let (switch, receiver) = KillSwitch::pair();
        drop(receiver);

        tokio::time::timeout(Duration::from_secs(5), switch.kill())
            .await
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_switch_stops_a_running_worker() {
        crate::test_helpers::init_test_logging();

        // `Worker::spawn` always passes runner arguments, which `sleep` would reject
        let child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let worker = Worker { child };

        let slot = WorkerSlot::new();
        let (switch, kill_requests) = KillSwitch::pair();
        let generation = slot.track(switch).await;

        let supervisor = tokio::spawn(worker.supervise(kill_requests, CancellationToken::new()));

        assert!(tokio::time::timeout(Duration::from_secs(5), slot.kill())
            .await
            .unwrap());

        let status = supervisor.await.unwrap().unwrap();
        assert!(!status.success());
        slot.release(generation).await;
        assert!(!slot.is_tracking().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shutdown_kills_the_worker() {
        crate::test_helpers::init_test_logging();

        let child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let worker = Worker { child };
        let (_switch, kill_requests) = KillSwitch::pair();
        let shutdown = CancellationToken::new();

        let supervisor = tokio::spawn(worker.supervise(kill_requests, shutdown.clone()));
        shutdown.cancel();

        let status = tokio::time::timeout(Duration::from_secs(5), supervisor)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn spawn_failure_names_the_runner() {
        let config = LaunchConfig {
            binary: "app.wasm".to_string(),
            ..Default::default()
        };
        let result = Worker::spawn(Path::new("/definitely/not/a/runner"), &config);

        match result {
            Err(LaunchError::Spawn { runner, .. }) => {
                assert_eq!(runner, Path::new("/definitely/not/a/runner"))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
