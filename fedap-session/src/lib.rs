//! Transport-agnostic Debug Adapter Protocol session engine.
//!
//! Reads framed messages from a byte stream, runs each request concurrently through a
//! [`RequestHandler`], and funnels everything the handlers produce back through a single writer.
mod codec;
mod message;
mod session;
mod transport;

pub use codec::{CodecError, DapCodec, MAX_FRAME_LENGTH};
pub use message::*;
pub use session::*;
pub use transport::*;
