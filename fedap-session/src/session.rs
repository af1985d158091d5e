//! The session engine, which drives a single client connection from its first frame to its
//! last.
//!
//! A session is made of three kinds of concurrent work:
//!
//! - the read loop, which pulls frames off the transport one at a time.  Each request is handed
//!   to its own task and the loop goes straight back to reading; it never waits on a handler.
//! - one task per in-flight request, running the [`RequestHandler`].  Handlers produce output only
//!   by calling [`SessionContext::send`].
//! - the serializer, the single owner of the write half of the transport.  It pops messages off
//!   the outbound queue and writes each as one complete frame, so frames from different handlers
//!   can never interleave.
//!
//! When the read loop stops at end of stream the session cancels its shutdown token, waits for
//! every request task to finish, closes the outbound queue, lets the serializer drain it, and
//! finally shuts down the transport.  A read error is fatal: the session stops writing at once
//! and returns the error.
use crate::codec::DapCodec;
use crate::message::{Message, Request};
use crate::transport::StreamTransport;
use anyhow::{Context, Result};
use futures::{FutureExt, SinkExt, StreamExt};
use std::panic::AssertUnwindSafe;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::*;

pub type SessionId = uuid::Uuid;

/// Something that can serve sessions.  One instance is shared by every session it serves.
pub trait SessionService: Send + Sync + 'static {
    type Handler: RequestHandler;

    /// Create the request handler for a new session.
    ///
    /// The handler lives exactly as long as the session, so this is where per-session state
    /// goes.
    fn new_session(&self, context: SessionContext) -> Self::Handler;
}

/// Handles the requests of one session.
///
/// The handler is cloned for every request so that requests can run as parallel async tasks.
/// Implementors should make the clone cheap, using an `Arc<Mutex<T>>` pattern for shared state
/// where needed.
#[async_trait::async_trait]
pub trait RequestHandler: Clone + Send + Sync + 'static {
    /// Handle one request.
    ///
    /// There is no return value; every response and event goes out through
    /// [`SessionContext::send`].
    async fn handle_request(&self, request: Request);
}

/// Runtime-configurable settings for a session, independent of what the handler does
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// The maximum number of outbound messages that can be queued before senders have to wait
    /// for the serializer to catch up.
    ///
    /// Most users should not need to modify this.
    pub max_pending_messages: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_pending_messages: 100,
        }
    }
}

/// A handler's view of its session.  Cheap to clone.
#[derive(Clone, Debug)]
pub struct SessionContext {
    id: SessionId,
    outbound: mpsc::Sender<Message>,
    shutdown: CancellationToken,
}

impl SessionContext {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queue a message for the client.
    ///
    /// Messages queued by one caller go out in the order they were queued.  Nothing is promised
    /// about the relative order of messages queued by different, concurrently running callers.
    ///
    /// This is infallible from the caller's point of view.  The only way it can fail is that the
    /// session has already stopped writing, in which case the failure is logged and the message
    /// is dropped.
    pub async fn send(&self, message: impl Into<Message>) {
        let message = message.into();
        let label = message.label();

        if self.outbound.send(message).await.is_err() {
            error!(session = %self.id, %label, "Message not sent; session is no longer writing");
        }
    }

    /// Token that is cancelled when the session begins shutting down.
    ///
    /// Anything that can block for a long time should watch this and give up once it fires.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}

/// Engine state for one connection
pub struct Session<R, W> {
    id: SessionId,
    transport: StreamTransport<R, W>,
    config: SessionConfig,
    shutdown: CancellationToken,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(transport: StreamTransport<R, W>, config: SessionConfig) -> Self {
        Self {
            id: SessionId::now_v7(),
            transport,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Tie this session's shutdown to some outer token, typically the one for the whole server.
    ///
    /// Cancelling `parent` shuts the session down; the session shutting down on its own does not
    /// affect `parent`.
    pub fn with_parent_shutdown(mut self, parent: &CancellationToken) -> Self {
        self.shutdown = parent.child_token();
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Drive the session until the client closes the stream, the shutdown token is cancelled, or
    /// an unrecoverable error happens.
    ///
    /// Returns `Ok` on a clean end of stream, after every dispatched request has finished and
    /// every message it queued has been written.
    #[instrument(skip_all, fields(session = %self.id, peer = %self.transport.peer()))]
    pub async fn run<S: SessionService>(self, service: &S) -> Result<()> {
        let Self {
            id,
            transport,
            config,
            shutdown,
        } = self;
        let (reader, writer) = transport.into_parts();

        let (outbound, queue) = mpsc::channel(config.max_pending_messages);
        let context = SessionContext {
            id,
            outbound,
            shutdown: shutdown.clone(),
        };
        let handler = service.new_session(context.clone());

        let close_queue = CancellationToken::new();
        let serializer = tokio::spawn(
            serialize_outbound(
                FramedWrite::new(writer, DapCodec::new()),
                queue,
                close_queue.clone(),
                shutdown.clone(),
            )
            .in_current_span(),
        );

        let tracker = TaskTracker::new();
        let read_result = read_requests(
            FramedRead::new(reader, DapCodec::new()),
            &handler,
            &tracker,
            &shutdown,
        )
        .await;

        // The read loop is done one way or another; nothing new gets dispatched from here on
        shutdown.cancel();
        tracker.close();

        if let Err(e) = read_result {
            // Fail fast.  Requests still in flight see the cancelled token and wind down on
            // their own, but nothing more is written to this client.
            error!(error = ?e, "Fatal error reading from client; aborting session");
            serializer.abort();
            return Err(e);
        }

        debug!(
            in_flight = tracker.len(),
            "Waiting for in-flight requests to finish"
        );
        tracker.wait().await;

        drop(handler);
        drop(context);
        close_queue.cancel();

        let mut writer = serializer
            .await
            .context("Outbound serializer task failed")??;
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "Error closing transport; client probably already gone");
        }

        info!("Session ended");
        Ok(())
    }
}

/// Read frames until end of stream, spawning a task for each request
async fn read_requests<R, H>(
    mut frames: FramedRead<R, DapCodec>,
    handler: &H,
    tracker: &TaskTracker,
    shutdown: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    H: RequestHandler,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Session shutdown requested; no longer reading from client");
                return Ok(());
            }
            frame = frames.next() => frame,
        };

        match frame {
            None => {
                debug!("End of stream from client");
                return Ok(());
            }
            Some(Err(e)) => {
                return Err(e).context("Failed to read a protocol frame from the client");
            }
            Some(Ok(Message::Request(request))) => {
                debug!(seq = request.seq, command = %request.command, "Received request");
                dispatch(handler, tracker, request);
            }
            Some(Ok(other)) => {
                warn!(seq = other.seq(), message = %other.label(), "Ignoring message that is not a request");
            }
        }
    }
}

/// Start handling a request in its own task, counted by `tracker`
fn dispatch<H: RequestHandler>(handler: &H, tracker: &TaskTracker, request: Request) {
    let handler = handler.clone();
    let span = info_span!("request", seq = request.seq, command = %request.command);

    tracker.spawn(
        async move {
            // A panicking handler takes down its own request and nothing else
            if let Err(panic) = AssertUnwindSafe(handler.handle_request(request))
                .catch_unwind()
                .await
            {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(%reason, "Request handler panicked");
            }
        }
        .instrument(span),
    );
}

/// The serializer: owns the writer and writes queued messages one complete frame at a time.
///
/// Runs until the queue is closed (by `close`, or by every sender going away) and drained, then
/// hands the writer back so the caller can shut it down.
async fn serialize_outbound<W>(
    mut frames: FramedWrite<W, DapCodec>,
    mut queue: mpsc::Receiver<Message>,
    close: CancellationToken,
    shutdown: CancellationToken,
) -> Result<W>
where
    W: AsyncWrite + Unpin,
{
    let mut next_seq = 1;
    let mut closing = false;

    loop {
        let message = tokio::select! {
            biased;
            message = queue.recv() => message,
            _ = close.cancelled(), if !closing => {
                // Stop accepting new messages, but keep going until what is already queued has
                // been written
                queue.close();
                closing = true;
                continue;
            }
        };

        let Some(message) = message else {
            break;
        };

        let message = message.with_seq(next_seq);
        next_seq += 1;
        let label = message.label();

        // `send` writes the whole frame and flushes before returning
        if let Err(e) = frames.send(message).await {
            error!(error = ?e, %label, "Failed to write message; session can no longer write");
            shutdown.cancel();
            return Err(e).context("Failed to write a protocol frame to the client");
        }
        trace!(%label, seq = next_seq - 1, "Message sent");
    }

    debug!("Outbound queue closed and drained");
    Ok(frames.into_inner())
}
