use anyhow::Context;
use clap::Parser;
use fedap::{Adapter, AdapterConfig};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::exit;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::*;
use tracing_subscriber::{fmt::writer::BoxMakeWriter, filter::LevelFilter, EnvFilter};

/// Name of the log file written next to the executable when `--log-file` isn't given
const DEFAULT_LOG_FILE: &str = "log";

/// Debug adapter for FastEdge wasm apps.
///
/// Speaks the Debug Adapter Protocol on stdin/stdout, or to any number of clients over TCP when a
/// port is given.  Nothing but protocol frames is ever written to stdout.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Listen for clients on this TCP port instead of serving one client on stdin/stdout
    #[arg(short, long, env = "FDAP_PORT")]
    port: Option<u16>,

    /// FastEdge runner executable to start on `launch`
    ///
    /// If not specified, the platform's runner in the same directory as this executable is used.
    /// A launch request can still override this with its own `cliPath`.
    #[arg(long, value_name = "FILE", env = "FDAP_RUNNER")]
    runner: Option<PathBuf>,

    /// Append log events to this file
    ///
    /// If not specified, logs go to a file called `log` next to this executable.  If the file
    /// can't be opened, logs go to stderr.
    #[arg(long, value_name = "FILE", env = "FDAP_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Turn debugging information on
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,
}

impl Cli {
    async fn execute(self) -> anyhow::Result<()> {
        let config = match self.runner {
            Some(runner) => AdapterConfig::new(runner),
            None => AdapterConfig::with_default_runner()?,
        };
        debug!(runner = %config.runner.display(), "Runner configured");
        let adapter = Adapter::new(config);

        match self.port {
            Some(port) => {
                let listener = TcpListener::bind(("0.0.0.0", port))
                    .await
                    .with_context(|| format!("Failed to listen on port {port}"))?;

                let shutdown = CancellationToken::new();
                tokio::spawn(cancel_on_ctrl_c(shutdown.clone()));

                fedap::serve_tcp(listener, adapter, shutdown).await
            }
            None => fedap::serve_stdio(adapter).await,
        }
    }

    fn log_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.log_file {
            return Some(path.clone());
        }

        let exe = std::env::current_exe().ok()?;
        Some(exe.parent()?.join(DEFAULT_LOG_FILE))
    }
}

async fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Ctrl-C detected; shutting down");
            shutdown.cancel();
        }
        Err(e) => {
            warn!(error = %e, "Unable to listen for Ctrl-C");
        }
    }
}

/// Plain text log events, appended to the log file or, failing that, written to stderr
fn init_logging(cli: &Cli) {
    let default_log_directive = match cli.debug {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let log_file = cli.log_path().and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("Unable to open log file {}: {e}", path.display());
                None
            }
        }
    });
    let writer = match log_file {
        Some(file) => BoxMakeWriter::new(std::sync::Mutex::new(file)),
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_log_directive.into())
                .from_env_lossy(),
        )
        .with_ansi(false)
        .with_writer(writer)
        .try_init();

    if let Err(e) = result {
        eprintln!("Failed to set up logging: {e}");
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = cli.execute().await {
        error!("{:#}", e);
        exit(1);
    } else {
        debug!("adapter exited normally");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify that there aren't any invalid attributes in the CLI specification that can only be
    /// detected at runtime
    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn explicit_log_file_wins() {
        let cli = Cli::parse_from(["fdap", "--log-file", "/tmp/fdap.log", "-p", "4711"]);
        assert_eq!(cli.log_path(), Some(PathBuf::from("/tmp/fdap.log")));
        assert_eq!(cli.port, Some(4711));
    }

    #[test]
    fn default_log_file_is_next_to_the_executable() {
        let cli = Cli::parse_from(["fdap"]);
        let path = cli.log_path().unwrap();
        assert_eq!(path.file_name().unwrap(), DEFAULT_LOG_FILE);
        assert_eq!(
            path.parent(),
            std::env::current_exe().unwrap().parent()
        );
    }
}
