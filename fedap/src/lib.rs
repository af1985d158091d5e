//! A debug adapter for FastEdge wasm apps.
//!
//! Clients speak the Debug Adapter Protocol to it; `launch` runs the app under the FastEdge
//! runner and streams the runner's output back as `output` events.
pub mod adapter;
pub mod capabilities;
pub mod command;
mod error;
pub mod launch;
pub mod relay;
pub mod server;

pub use adapter::{Adapter, AdapterConfig};
pub use error::Result;
pub use server::{serve_stdio, serve_tcp};
