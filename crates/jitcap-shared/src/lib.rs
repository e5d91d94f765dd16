//! Shared types and wire protocol for jitcap
//!
//! The instrumented process (producer) and the consumer talk over a
//! single-consumer duplex byte channel: a named pipe on Windows, a Unix
//! domain socket elsewhere.
//!
//! # Architecture
//!
//! - [`messages`] - frame header and message body layouts
//! - [`FramedTransport`] - header/body framing, serialized sends, receive loop
//! - [`Channel`] - the platform byte channel underneath

pub mod arch;
pub mod error;
pub mod messages;
#[cfg(windows)]
pub mod pipe;
#[cfg(unix)]
pub mod socket;
pub mod transport;

pub use arch::Architecture;
pub use error::{Error, ProtocolError, Result};
pub use messages::*;
#[cfg(any(windows, unix))]
pub use transport::{PlatformChannel, accept_one, connect};
pub use transport::{Channel, DEFAULT_SEND_TIMEOUT, FramedTransport, MessageSink};

/// Well-known endpoint name the producer connects to.
pub const PIPE_NAME: &str = "jitcap-pipe";
