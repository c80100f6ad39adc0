//! Wire protocol between the supervising process and the bridge.
//!
//! - **protocol**: the [`protocol::Envelope`] union and the payloads it carries
//! - **codec**: newline-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
