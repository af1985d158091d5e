//! Ways of putting the adapter in front of clients: a TCP listener serving any number of
//! concurrent sessions, or a single embedded session on stdin/stdout.
use crate::adapter::Adapter;
use crate::Result;
use anyhow::Context;
use fedap_session::{Session, SessionConfig, StdioTransport, TcpTransport};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::*;

/// Accept connections on `listener` until `shutdown` is cancelled, running one session per
/// connection.
///
/// A session that fails ends only that connection.  On shutdown every open session is told to
/// stop, and this returns once they all have.
#[instrument(skip_all, fields(addr = ?listener.local_addr().ok()))]
pub async fn serve_tcp(
    listener: TcpListener,
    adapter: Adapter,
    shutdown: CancellationToken,
) -> Result<()> {
    let sessions = TaskTracker::new();
    info!("Listening for debug adapter clients");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested; no longer accepting connections");
                break;
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                // Usually transient (e.g. out of file descriptors); keep serving
                warn!(error = %e, "Failed to accept connection");
                continue;
            }
        };

        let session = Session::new(TcpTransport::tcp(stream), SessionConfig::default())
            .with_parent_shutdown(&shutdown);
        debug!(%peer, session = %session.id(), "Accepted connection");
        let adapter = adapter.clone();
        sessions.spawn(async move {
            if let Err(e) = session.run(&adapter).await {
                error!("Session failed: {:#}", e);
            }
        });
    }

    sessions.close();
    debug!(open = sessions.len(), "Waiting for open sessions to end");
    sessions.wait().await;

    Ok(())
}

/// Run a single session over this process's stdin and stdout
pub async fn serve_stdio(adapter: Adapter) -> Result<()> {
    info!("Serving a single session on stdin/stdout");

    Session::new(StdioTransport::stdio(), SessionConfig::default())
        .run(&adapter)
        .await
        .context("Debug adapter session failed")
}
