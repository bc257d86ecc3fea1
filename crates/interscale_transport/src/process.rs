//! # Process Transport
//!
//! Point-to-point link between two ranks running in separate processes.
//!
//! ## Endpoint Discovery
//!
//! ```text
//! receiving rank                              sending rank
//! ──────────────                              ────────────
//! bind 127.0.0.1:0
//! publish "<addr>" ──► <record> + .unlock ──► await_and_consume(<record>)
//! accept ◄──────────────────────────────────── connect(<addr>)
//! remove <record>
//! ```
//!
//! A single TCP stream per link keeps frames between the same pair of
//! ranks FIFO. Nothing is ordered across links.

use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::time::Duration;

use interscale_core::{CancelToken, Clock, HandshakeError, HandshakeRecord, Message, WaitOptions};

use crate::wire::{read_message, write_message, WireError};
use crate::{Transport, TransportError, TransportResult, TransportStats};

/// Pause between two non-blocking accept attempts.
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Loopback listener whose address is published through the handshake.
///
/// Binding and publishing never block. [`accept`](Self::accept) waits for
/// the peer and removes the record once it is connected.
#[derive(Debug)]
pub struct PublishedListener {
    listener: TcpListener,
    address: SocketAddr,
    record: HandshakeRecord,
}

impl PublishedListener {
    /// Binds `127.0.0.1:0` and publishes the address at `record`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if binding fails or
    /// [`TransportError::Handshake`] if the record cannot be written.
    pub fn bind(record: &Path) -> TransportResult<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let address = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let record = HandshakeRecord::new(record);
        record.publish(address.to_string().as_bytes())?;
        tracing::debug!(%address, record = %record.data_path().display(), "endpoint published");
        Ok(Self {
            listener,
            address,
            record,
        })
    }

    /// Bound address.
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Path of the published record.
    #[must_use]
    pub fn record_path(&self) -> &Path {
        self.record.data_path()
    }

    /// Waits for one peer, then removes the record.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Handshake`] on timeout or cancellation
    /// and [`TransportError::Io`] on socket errors.
    pub fn accept(self, options: &WaitOptions, clock: &dyn Clock) -> TransportResult<TcpStream> {
        let start = clock.now();
        let mut announced = false;
        let stream = loop {
            match self.listener.accept() {
                Ok((stream, _)) => break stream,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
            if !announced {
                tracing::info!(address = %self.address, record = %self.record.data_path().display(), "waiting for peer");
                announced = true;
            }
            if options.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                return Err(HandshakeError::Cancelled(self.record.data_path().to_path_buf()).into());
            }
            let waited = clock.now().saturating_sub(start);
            if options.timeout.is_some_and(|timeout| waited >= timeout) {
                return Err(HandshakeError::Timeout {
                    path: self.record.data_path().to_path_buf(),
                    waited,
                }
                .into());
            }
            clock.sleep(ACCEPT_POLL);
        };

        self.record.remove()?;
        stream.set_nonblocking(false)?;
        Ok(stream)
    }
}

/// Waits for the record at `record`, then connects to the address it
/// holds.
///
/// A refused connection (stale record from an earlier run) is retried
/// after one poll interval until `options` runs out.
///
/// # Errors
///
/// Returns [`TransportError::Handshake`] if the record never appears,
/// [`TransportError::InvalidEndpoint`] if it is not an address, or
/// [`TransportError::Io`] if connecting fails.
pub fn connect_published(record: &Path, options: &WaitOptions, clock: &dyn Clock) -> TransportResult<TcpStream> {
    let record = HandshakeRecord::new(record);
    let start = clock.now();
    loop {
        let remaining = options
            .timeout
            .map(|timeout| timeout.saturating_sub(clock.now().saturating_sub(start)));
        let attempt = options.clone().with_timeout(remaining);

        let data = record.await_and_consume(&attempt, clock)?;
        let text = String::from_utf8_lossy(&data).trim().to_string();
        let address: SocketAddr = text
            .parse()
            .map_err(|_| TransportError::InvalidEndpoint(text.clone()))?;

        match TcpStream::connect(address) {
            Ok(stream) => {
                tracing::info!(%address, "connected to published endpoint");
                return Ok(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                tracing::warn!(%address, "endpoint refused, waiting for a fresh record");
                let waited = clock.now().saturating_sub(start);
                if options.timeout.is_some_and(|timeout| waited >= timeout) {
                    return Err(e.into());
                }
                clock.sleep(options.poll_interval);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// One end of a socket link between two ranks.
#[derive(Debug)]
pub struct ProcessTransport {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    peer: String,
    stats: TransportStats,
    closed: bool,
}

impl ProcessTransport {
    /// Wraps a connected stream.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the stream cannot be configured.
    pub fn from_stream(stream: TcpStream, peer: impl Into<String>) -> TransportResult<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            reader,
            writer: BufWriter::new(stream),
            peer: peer.into(),
            stats: TransportStats::default(),
            closed: false,
        })
    }

    /// Publishes a loopback endpoint at `record` and waits for the peer.
    ///
    /// # Errors
    ///
    /// See [`PublishedListener::bind`] and [`PublishedListener::accept`].
    pub fn listen(record: &Path, options: &WaitOptions, clock: &dyn Clock) -> TransportResult<Self> {
        let listener = PublishedListener::bind(record)?;
        let address = listener.address();
        let stream = listener.accept(options, clock)?;
        Self::from_stream(stream, address.to_string())
    }

    /// Connects to the endpoint published at `record`.
    ///
    /// # Errors
    ///
    /// See [`connect_published`].
    pub fn connect(record: &Path, options: &WaitOptions, clock: &dyn Clock) -> TransportResult<Self> {
        let stream = connect_published(record, options, clock)?;
        let peer = stream.peer_addr()?.to_string();
        Self::from_stream(stream, peer)
    }

    /// Address of the peer.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    fn disconnected(&self) -> TransportError {
        TransportError::Disconnected {
            peer: self.peer.clone(),
        }
    }

    fn map_wire(&self, error: WireError) -> TransportError {
        match error {
            WireError::Truncated => self.disconnected(),
            WireError::Io(e) if is_disconnect(&e) => self.disconnected(),
            other => other.into(),
        }
    }
}

fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

impl Transport for ProcessTransport {
    fn send(&mut self, message: Message) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let written = write_message(&mut self.writer, &message).map_err(|e| self.map_wire(e))?;
        self.writer.flush().map_err(|e| {
            if is_disconnect(&e) {
                self.disconnected()
            } else {
                e.into()
            }
        })?;
        if matches!(message, Message::Interval(_)) {
            self.stats.record_sent(written);
        }
        Ok(())
    }

    fn receive(&mut self) -> TransportResult<Message> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match read_message(&mut self.reader) {
            Ok(Some(message)) => {
                if let Message::Interval(buffer) = &message {
                    self.stats.record_received(crate::wire::HEADER_LEN + buffer.payload_bytes().len());
                }
                Ok(message)
            }
            Ok(None) => Err(self.disconnected()),
            Err(e) => Err(self.map_wire(e)),
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.writer.flush() {
            tracing::trace!(peer = %self.peer, error = %e, "flush on close failed");
        }
        if let Err(e) = self.writer.get_ref().shutdown(Shutdown::Both) {
            tracing::trace!(peer = %self.peer, error = %e, "shutdown on closed socket");
        }
    }

    fn stats(&self) -> TransportStats {
        self.stats
    }

    fn backend(&self) -> &'static str {
        "process"
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.close();
    }
}
