//! Arguments of a `launch` request, and the command line they turn into for the runner.
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// The runner subcommand that serves a wasm app over HTTP
pub const SUBCOMMAND: &str = "http";

pub const DEFAULT_PORT: u16 = 8181;

/// Memory limit passed to the runner when the launch request doesn't specify one
pub const DEFAULT_MEM_LIMIT: u64 = 10_000_000;

/// Reasons a launch can't go ahead.  All of these are reported to the client as a failed
/// `launch` response; the session carries on.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("launch request has no arguments")]
    MissingArguments,

    #[error("launch arguments are malformed")]
    InvalidArguments(#[from] serde_json::Error),

    #[error("launch arguments have an empty `binary`")]
    EmptyBinary,

    #[error("unable to locate the adapter executable to find the default runner")]
    RunnerLocation(#[source] std::io::Error),

    #[error("failed to start runner {}", runner.display())]
    Spawn {
        runner: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Parsed `launch` arguments.
///
/// Every field but `binary` is optional; `null` is treated the same as absent.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct LaunchConfig {
    /// Path of the wasm app to serve
    pub binary: String,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default, rename = "geoIpHeaders")]
    pub geo_ip_headers: Option<bool>,

    #[serde(default)]
    pub env: Option<BTreeMap<String, String>>,

    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,

    #[serde(default)]
    pub mem_limit: Option<u64>,

    /// Runner executable to use for this launch only, overriding the adapter's configured one
    #[serde(default, rename = "cliPath")]
    pub cli_path: Option<PathBuf>,
}

impl LaunchConfig {
    pub fn from_arguments(arguments: Option<&Value>) -> Result<Self, LaunchError> {
        let arguments = match arguments {
            None | Some(Value::Null) => return Err(LaunchError::MissingArguments),
            Some(arguments) => arguments,
        };

        let config = Self::deserialize(arguments)?;
        if config.binary.trim().is_empty() {
            return Err(LaunchError::EmptyBinary);
        }

        Ok(config)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn mem_limit(&self) -> u64 {
        self.mem_limit.unwrap_or(DEFAULT_MEM_LIMIT)
    }

    /// The runner's command line, not including the runner itself:
    ///
    /// ```text
    /// http --wasm <binary> --port <port> -m <mem_limit> [--envs K=V]* [--headers K=V]* [--geo]
    /// ```
    pub fn worker_args(&self) -> Vec<String> {
        let mut args = vec![
            SUBCOMMAND.to_string(),
            "--wasm".to_string(),
            self.binary.clone(),
            "--port".to_string(),
            self.port().to_string(),
            "-m".to_string(),
            self.mem_limit().to_string(),
        ];

        for (key, value) in self.env.iter().flatten() {
            args.push("--envs".to_string());
            args.push(format!("{key}={value}"));
        }

        for (key, value) in self.headers.iter().flatten() {
            args.push("--headers".to_string());
            args.push(format!("{key}={value}"));
        }

        if self.geo_ip_headers.unwrap_or(false) {
            args.push("--geo".to_string());
        }

        args
    }

    /// Text of the output event that tells the user where the app is listening
    pub fn serving_banner(&self) -> String {
        format!("Serving on http://localhost:{}\n", self.port())
    }
}
