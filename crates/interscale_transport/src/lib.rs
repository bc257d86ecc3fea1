//! # Interscale Transport
//!
//! Stage to stage links of the hub pipeline.
//!
//! ## Backends
//!
//! ```text
//!                  ┌──────────────────────────┐
//!   send(msg) ────►│       dyn Transport      │────► receive() -> msg
//!                  └────────────┬─────────────┘
//!                 ┌─────────────┴──────────────┐
//!        ThreadTransport                ProcessTransport
//!   Arc<DoubleBuffer> shared        loopback socket, endpoint
//!   by two threads                  published via handshake
//! ```
//!
//! A backend is chosen once when the pipeline is built. Stages only see
//! `Box<dyn Transport>` and cannot tell the two apart.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod error;
pub mod process;
pub mod thread;
pub mod wire;

pub use error::{TransportError, TransportResult};
pub use process::{connect_published, ProcessTransport, PublishedListener};
pub use thread::ThreadTransport;
pub use wire::WireError;

use interscale_core::Message;

/// Per-link counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Intervals sent.
    pub messages_sent: u64,
    /// Intervals received.
    pub messages_received: u64,
    /// Bytes sent.
    pub bytes_sent: u64,
    /// Bytes received.
    pub bytes_received: u64,
}

impl TransportStats {
    pub(crate) fn record_sent(&mut self, bytes: usize) {
        self.messages_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub(crate) fn record_received(&mut self, bytes: usize) {
        self.messages_received += 1;
        self.bytes_received += bytes as u64;
    }
}

/// Uniform send/receive capability between two neighbouring stages.
///
/// Messages between the same two ends arrive in the order they were sent.
pub trait Transport: Send {
    /// Sends one message, blocking until the link accepts it.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the link is closed or broken.
    fn send(&mut self, message: Message) -> TransportResult<()>;

    /// Receives the next message, blocking until one arrives.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the link is broken.
    fn receive(&mut self) -> TransportResult<Message>;

    /// Closes this end. Idempotent. A peer blocked on the link wakes up.
    fn close(&mut self);

    /// Counters of this end.
    fn stats(&self) -> TransportStats;

    /// Backend name for logs.
    fn backend(&self) -> &'static str;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, message: Message) -> TransportResult<()> {
        (**self).send(message)
    }

    fn receive(&mut self) -> TransportResult<Message> {
        (**self).receive()
    }

    fn close(&mut self) {
        (**self).close();
    }

    fn stats(&self) -> TransportStats {
        (**self).stats()
    }

    fn backend(&self) -> &'static str {
        (**self).backend()
    }
}
