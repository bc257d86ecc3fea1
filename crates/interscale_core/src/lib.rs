//! # Interscale Core
//!
//! Building blocks shared by every stage of the Interscale Hub:
//! - The synchronization buffer data model
//! - The double buffer used by the shared-memory transport
//! - The file-based handshake used for discovery between participants
//! - The channel table and the region to channel mapping
//!
//! ## Architecture Rules
//!
//! 1. **One owner per buffer** - a buffer moves between stages, it is never shared
//! 2. **Blocking means waiting** - every wait parks on a condvar or sleeps between polls
//! 3. **Ordered hand-off** - one slot, one writer, one reader
//!
//! ## Example
//!
//! ```rust,ignore
//! use interscale_core::{DoubleBuffer, Interval, SynchronizationBuffer};
//!
//! let slot = DoubleBuffer::with_capacity(4096);
//! slot.write(&SynchronizationBuffer::new(Interval::new(0, 0.0, 0.1)))?;
//! let message = slot.read();
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod buffer;
pub mod handshake;
pub mod mapping;
pub mod sync;

pub use buffer::{Event, Interval, Message, SynchronizationBuffer};
pub use handshake::{
    CancelToken, CleanupOutcome, Clock, HandshakeError, HandshakeRecord, HandshakeResult,
    SystemClock, WaitOptions,
};
pub use mapping::{ChannelRange, ChannelTable, IdentifierMapping, TableError};
pub use sync::{BufferError, BufferStatus, DoubleBuffer};
