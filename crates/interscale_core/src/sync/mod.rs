//! # Hand-off Primitives
//!
//! ## The Problem
//!
//! ```text
//! Thread 1 (Consumer):     WRITE interval N
//! Thread 2 (Transformer):  READ  interval N
//!
//! Without a protocol:  reader sees half an interval, or interval N is
//!                      overwritten by N+1 before it was read
//! ```
//!
//! ## The Solution: Status-Guarded Slot
//!
//! ```text
//! Empty ──write──► Ready ──read──► Empty ──write──► ...
//! ```
//!
//! One writer, one reader, one status flag, one lock. The writer waits
//! for `Empty`, the reader waits for `Ready`. Nobody spins.

mod double_buffer;

pub use double_buffer::{BufferError, BufferStatus, DoubleBuffer};
