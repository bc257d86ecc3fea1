//! # Thread Transport
//!
//! Both ends of a link hold the same [`DoubleBuffer`]. The sending end
//! writes into it, the receiving end reads out of it.
//!
//! ```text
//! Consumer thread ──send──► Arc<DoubleBuffer> ──receive──► Transformer thread
//! ```

use std::sync::Arc;

use interscale_core::{BufferStatus, DoubleBuffer, Message};

use crate::{Transport, TransportError, TransportResult, TransportStats};

/// One end of a shared-memory link.
#[derive(Debug)]
pub struct ThreadTransport {
    slot: Arc<DoubleBuffer>,
    stats: TransportStats,
}

impl ThreadTransport {
    /// Wraps an existing slot.
    #[must_use]
    pub fn new(slot: Arc<DoubleBuffer>) -> Self {
        Self {
            slot,
            stats: TransportStats::default(),
        }
    }

    /// Creates a `(sending end, receiving end)` pair over a fresh slot.
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, Self) {
        let slot = Arc::new(DoubleBuffer::with_capacity(capacity));
        (Self::new(Arc::clone(&slot)), Self::new(slot))
    }

    /// The shared slot.
    #[must_use]
    pub fn slot(&self) -> &Arc<DoubleBuffer> {
        &self.slot
    }
}

impl Transport for ThreadTransport {
    fn send(&mut self, message: Message) -> TransportResult<()> {
        match message {
            Message::Interval(buffer) => {
                self.slot.write(&buffer)?;
                self.stats.record_sent(buffer.payload_bytes().len());
            }
            Message::EndOfStream => self.slot.finish()?,
            Message::Error(reason) => {
                if !self.slot.abort(reason) {
                    return Err(TransportError::Closed);
                }
            }
        }
        Ok(())
    }

    fn receive(&mut self) -> TransportResult<Message> {
        let message = self.slot.read();
        if let Message::Interval(buffer) = &message {
            self.stats.record_received(buffer.payload_bytes().len());
        }
        Ok(message)
    }

    fn close(&mut self) {
        let status = self.slot.status();
        if !status.is_terminal() && self.slot.abort("transport closed by peer") {
            tracing::debug!(?status, "thread link aborted on close");
        }
    }

    fn stats(&self) -> TransportStats {
        self.stats
    }

    fn backend(&self) -> &'static str {
        "thread"
    }
}

impl Drop for ThreadTransport {
    fn drop(&mut self) {
        // A dropped end must never leave its peer blocked.
        if self.slot.status() != BufferStatus::EndOfStream {
            self.close();
        }
    }
}
