//! # Wire Frames
//!
//! Every message crossing a socket is one frame:
//!
//! ```text
//! ┌───────┬──────┬───────┬───────┬───────┬───────┬──────────────────────┐
//! │ magic │ kind │ index │ start │ end   │ count │ payload              │
//! │ ISHB  │ u8   │ u64   │ f64   │ f64   │ u32   │ count * 24 (events)  │
//! │ 4     │ 1    │ 8     │ 8     │ 8     │ 4     │ count (error text)   │
//! └───────┴──────┴───────┴───────┴───────┴───────┴──────────────────────┘
//! ```
//!
//! Header fields are little-endian. The event payload is the raw `Pod`
//! layout of [`Event`] in native byte order: both ends always run on the
//! same host.

use std::io::{self, Read, Write};

use interscale_core::{Event, Interval, Message, SynchronizationBuffer};
use thiserror::Error;

/// Frame magic.
pub const MAGIC: [u8; 4] = *b"ISHB";

/// Header size in bytes.
pub const HEADER_LEN: usize = 4 + 1 + 8 + 8 + 8 + 4;

/// Largest event count accepted in one frame.
pub const MAX_FRAME_EVENTS: u32 = 16 * 1024 * 1024;

/// Largest error text accepted in one frame.
pub const MAX_ERROR_BYTES: u32 = 64 * 1024;

const EVENT_LEN: usize = std::mem::size_of::<Event>();

/// Frame kind tag.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// One interval of events.
    Interval = 1,
    /// End of stream.
    EndOfStream = 2,
    /// Upstream failure with a reason.
    Error = 3,
}

impl FrameKind {
    /// Converts from the raw tag.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Interval),
            2 => Some(Self::EndOfStream),
            3 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Frame decoding errors.
#[derive(Error, Debug)]
pub enum WireError {
    /// The underlying stream failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The stream ended in the middle of a frame.
    #[error("stream ended inside a frame")]
    Truncated,

    /// The frame does not start with the magic.
    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 4]),

    /// Unknown frame kind.
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),

    /// The frame announces more data than allowed.
    #[error("frame announces {count} items, limit is {max}")]
    TooLarge {
        /// Announced count.
        count: u32,
        /// Allowed maximum.
        max: u32,
    },

    /// The error text is not UTF-8.
    #[error("error frame text is not valid UTF-8")]
    InvalidText,

    /// The interval bounds are not finite or end before they start.
    #[error("invalid interval bounds [{start}, {end})")]
    BadInterval {
        /// Announced start.
        start: f64,
        /// Announced end.
        end: f64,
    },
}

fn header(kind: FrameKind, interval: Interval, count: u32) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0..4].copy_from_slice(&MAGIC);
    out[4] = kind as u8;
    out[5..13].copy_from_slice(&interval.index.to_le_bytes());
    out[13..21].copy_from_slice(&interval.start.to_le_bytes());
    out[21..29].copy_from_slice(&interval.end.to_le_bytes());
    out[29..33].copy_from_slice(&count.to_le_bytes());
    out
}

/// Writes one message as a frame and returns the bytes written.
///
/// # Errors
///
/// Returns [`WireError::TooLarge`] for oversized payloads and
/// [`WireError::Io`] if the writer fails.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<usize, WireError> {
    match message {
        Message::Interval(buffer) => {
            let count = u32::try_from(buffer.len())
                .ok()
                .filter(|c| *c <= MAX_FRAME_EVENTS)
                .ok_or(WireError::TooLarge {
                    count: u32::try_from(buffer.len()).unwrap_or(u32::MAX),
                    max: MAX_FRAME_EVENTS,
                })?;
            writer.write_all(&header(FrameKind::Interval, buffer.interval, count))?;
            let payload = buffer.payload_bytes();
            writer.write_all(payload)?;
            Ok(HEADER_LEN + payload.len())
        }
        Message::EndOfStream => {
            writer.write_all(&header(FrameKind::EndOfStream, Interval::default(), 0))?;
            Ok(HEADER_LEN)
        }
        Message::Error(reason) => {
            // Oversized reasons are cut on a char boundary rather than rejected.
            let mut end = reason.len().min(MAX_ERROR_BYTES as usize);
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            let text = &reason.as_bytes()[..end];
            #[allow(clippy::cast_possible_truncation)]
            let count = text.len() as u32;
            writer.write_all(&header(FrameKind::Error, Interval::default(), count))?;
            writer.write_all(text)?;
            Ok(HEADER_LEN + text.len())
        }
    }
}

/// Encodes one message into a new byte vector.
///
/// # Errors
///
/// See [`write_message`].
pub fn encode(message: &Message) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(HEADER_LEN);
    write_message(&mut out, message)?;
    Ok(out)
}

/// Reads one frame.
///
/// Returns `Ok(None)` if the stream ended cleanly on a frame boundary.
///
/// # Errors
///
/// Returns a [`WireError`] for malformed or truncated frames.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<Message>, WireError> {
    let mut head = [0u8; HEADER_LEN];
    if !fill_or_eof(reader, &mut head)? {
        return Ok(None);
    }

    let magic = [head[0], head[1], head[2], head[3]];
    if magic != MAGIC {
        return Err(WireError::BadMagic(magic));
    }
    let kind = FrameKind::from_u8(head[4]).ok_or(WireError::UnknownKind(head[4]))?;
    let interval = Interval::new(
        u64::from_le_bytes(field(&head, 5)),
        f64::from_le_bytes(field(&head, 13)),
        f64::from_le_bytes(field(&head, 21)),
    );
    let count = u32::from_le_bytes([head[29], head[30], head[31], head[32]]);

    match kind {
        FrameKind::Interval => {
            if !(interval.start.is_finite() && interval.end.is_finite() && interval.end >= interval.start) {
                return Err(WireError::BadInterval {
                    start: interval.start,
                    end: interval.end,
                });
            }
            if count > MAX_FRAME_EVENTS {
                return Err(WireError::TooLarge {
                    count,
                    max: MAX_FRAME_EVENTS,
                });
            }
            let mut payload = vec![0u8; count as usize * EVENT_LEN];
            read_body(reader, &mut payload)?;
            let events: Vec<Event> = payload
                .chunks_exact(EVENT_LEN)
                .map(bytemuck::pod_read_unaligned)
                .collect();
            Ok(Some(Message::Interval(SynchronizationBuffer::with_events(
                interval, events,
            ))))
        }
        FrameKind::EndOfStream => Ok(Some(Message::EndOfStream)),
        FrameKind::Error => {
            if count > MAX_ERROR_BYTES {
                return Err(WireError::TooLarge {
                    count,
                    max: MAX_ERROR_BYTES,
                });
            }
            let mut text = vec![0u8; count as usize];
            read_body(reader, &mut text)?;
            let reason = String::from_utf8(text).map_err(|_| WireError::InvalidText)?;
            Ok(Some(Message::Error(reason)))
        }
    }
}

/// Decodes exactly one frame from a byte slice.
///
/// # Errors
///
/// Returns [`WireError::Truncated`] on empty input, otherwise see
/// [`read_message`].
pub fn decode(mut bytes: &[u8]) -> Result<Message, WireError> {
    read_message(&mut bytes)?.ok_or(WireError::Truncated)
}

fn field(head: &[u8; HEADER_LEN], at: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&head[at..at + 8]);
    out
}

fn read_body<R: Read>(reader: &mut R, out: &mut [u8]) -> Result<(), WireError> {
    reader.read_exact(out).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => WireError::Truncated,
        _ => WireError::Io(e),
    })
}

/// Fills `out` completely. Returns false if the stream was already at EOF.
fn fill_or_eof<R: Read>(reader: &mut R, out: &mut [u8]) -> Result<bool, WireError> {
    let mut filled = 0;
    while filled < out.len() {
        match reader.read(&mut out[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(WireError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(WireError::Io(e)),
        }
    }
    Ok(true)
}
