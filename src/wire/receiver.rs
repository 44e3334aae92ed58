//! The input endpoint: lazy connect, input-side negotiation, container
//! reassembly and per-record iteration.

use std::io::Read;
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::tools::error::{Error, Result};
use crate::wire::container::HEADER_SIZE;
use crate::wire::negotiate::{
    evaluate, read_hello, DataFormat, NegotiationCallback, NegotiationResult,
};
use crate::wire::params::{EndpointAddr, ReceiverConfig};
use crate::wire::socket::Socket;

/// Timeout policy of one [`StreamReceiver::recv`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvTimeout {
    /// Block until a record arrives (or the endpoint terminates).
    Wait,
    /// Return immediately when no record is available.
    NonBlocking,
    /// Wait at most this many microseconds, measured from call entry.
    Micros(u64),
}

/// Reception counters of an input endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReceiverStats {
    /// Records handed to the caller.
    pub received_records: u64,
    /// Containers fully reassembled.
    pub received_containers: u64,
    /// Records the sequence numbers show were never seen (dropped for this
    /// consumer or lost on reconnect).
    pub missed_records: u64,
}

/// Cooperative termination handle for a receiver owned by another thread.
#[derive(Debug, Clone)]
pub struct Terminator {
    flag: Arc<AtomicBool>,
}

impl Terminator {
    /// Make every pending and future `recv` return `Terminated`.
    pub fn terminate(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// Partially read wire data, kept across timed-out calls so no byte is lost.
#[derive(Debug)]
enum Pending {
    Header { buf: [u8; HEADER_SIZE], filled: usize },
    Payload { filled: usize },
}

///
/// Input endpoint of a record stream.
///
/// Connects lazily on the first `recv`, performs the input side of the
/// format negotiation, then reassembles containers and yields one record
/// per call. A format change by the sender surfaces as
/// [`Error::FormatChanged`] at a record boundary; the caller expands its
/// template and continues receiving.
///
pub struct StreamReceiver {
    cfg: ReceiverConfig,
    required: DataFormat,
    /// Spec string accepted in the last successful negotiation.
    negotiated: Option<String>,
    callback: Option<Box<NegotiationCallback>>,
    socket: Option<Socket>,
    pending: Option<Pending>,
    container: Vec<u8>,
    payload_len: usize,
    next_off: usize,
    recs_left: u16,
    expected_seq: Option<u64>,
    pending_change: Option<String>,
    stats: ReceiverStats,
    terminated: Arc<AtomicBool>,
}

impl std::fmt::Debug for StreamReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReceiver")
            .field("cfg", &self.cfg)
            .field("required", &self.required)
            .field("negotiated", &self.negotiated)
            .field("connected", &self.socket.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

impl StreamReceiver {
    /// Create a receiver for the given endpoint requiring the given format.
    /// No connection is made until the first [`recv`](Self::recv).
    pub fn new(cfg: ReceiverConfig, required: DataFormat) -> StreamReceiver {
        StreamReceiver {
            cfg,
            required,
            negotiated: None,
            callback: None,
            socket: None,
            pending: None,
            container: Vec::new(),
            payload_len: 0,
            next_off: 0,
            recs_left: 0,
            expected_seq: None,
            pending_change: None,
            stats: ReceiverStats::default(),
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Install a callback consulted before any negotiated format is
    /// accepted. Returning `false` from it refuses the connection.
    pub fn set_negotiation_callback(
        &mut self,
        callback: Box<NegotiationCallback>,
    ) {
        self.callback = Some(callback);
    }

    /// Replace the required format, typically after handling a
    /// `FormatChanged` signal with an expanded template.
    pub fn install_format(&mut self, format: DataFormat) {
        self.required = format;
    }

    /// A handle that terminates this receiver from another thread.
    pub fn terminator(&self) -> Terminator {
        Terminator {
            flag: self.terminated.clone(),
        }
    }

    /// Reception counters.
    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }

    /// The spec string of the currently negotiated stream format.
    pub fn negotiated_spec(&self) -> Option<&str> {
        self.negotiated.as_deref()
    }

    /// Receive one record.
    ///
    /// Returns the record bytes, valid until the next call. Errors:
    /// `Timeout` when the bounded wait expired (partial wire data is kept
    /// and resumed by the next call), `FormatChanged` at a record boundary
    /// after the sender renegotiated, `FormatMismatch` when the formats are
    /// irreconcilable, `Terminated` after [`Terminator::terminate`].
    pub fn recv(&mut self, timeout: RecvTimeout) -> Result<&[u8]> {
        let deadline = match timeout {
            RecvTimeout::Wait => None,
            RecvTimeout::NonBlocking => Some(Instant::now()),
            RecvTimeout::Micros(us) => Some(Instant::now() + Duration::from_micros(us)),
        };

        loop {
            if self.terminated.load(Ordering::SeqCst) {
                return Err(Error::Terminated);
            }
            if self.next_off < self.payload_len {
                // a record is pending in the current container
                if let Some((start, len)) = self.pop_record() {
                    return Ok(&self.container[start..start + len]);
                }
                // malformed framing, container rest discarded; read on
                continue;
            }
            if let Some(spec) = self.pending_change.take() {
                return Err(Error::FormatChanged(spec));
            }
            if self.socket.is_none() {
                self.connect(deadline)?;
                continue;
            }
            match self.read_container(deadline) {
                Ok(()) => continue,
                Err(Error::Io(e)) => {
                    log::debug!("connection lost: {}", e);
                    self.drop_connection();
                    continue;
                }
                Err(other) => return Err(other),
            }
        }
    }

    fn drop_connection(&mut self) {
        if let Some(sock) = self.socket.take() {
            sock.shutdown();
        }
        self.pending = None;
        self.expected_seq = None;
        self.payload_len = 0;
        self.next_off = 0;
        self.recs_left = 0;
    }

    /// Establish the connection and run the input side of the negotiation.
    fn connect(&mut self, deadline: Option<Instant>) -> Result<()> {
        loop {
            if self.terminated.load(Ordering::SeqCst) {
                return Err(Error::Terminated);
            }
            let attempt = match &self.cfg.addr {
                EndpointAddr::Tcp { host, port } => {
                    connect_tcp(host, *port, deadline).map(Socket::Tcp)
                }
                EndpointAddr::Unix { id } => {
                    let path = self.cfg.addr.socket_path().ok_or_else(|| {
                        Error::spec(format!("bad unix socket id {:?}", id))
                    })?;
                    UnixStream::connect(path).map(Socket::Unix)
                }
            };
            match attempt {
                Ok(sock) => {
                    self.socket = Some(sock);
                    return self.negotiate(deadline);
                }
                Err(e) => {
                    log::debug!("connect failed: {}", e);
                    match deadline {
                        None => {
                            // wait before the next attempt; many attempts in
                            // a row would be unpleasant for the peer
                            sleep_observing(&self.terminated, Duration::from_secs(1));
                        }
                        Some(d) if Instant::now() >= d => return Err(Error::Timeout),
                        Some(_) => {
                            sleep_observing(&self.terminated, Duration::from_millis(50));
                        }
                    }
                }
            }
        }
    }

    fn negotiate(&mut self, deadline: Option<Instant>) -> Result<()> {
        let sock = match self.socket.as_mut() {
            Some(sock) => sock,
            None => return Err(Error::Timeout),
        };
        let hello_budget = match deadline {
            None => Duration::from_secs(5),
            Some(d) => d
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(10)),
        };
        sock.set_read_timeout(Some(hello_budget))?;
        let received = match read_hello(sock) {
            Ok(received) => received,
            Err(e) => {
                log::debug!("hello from sender failed: {}", e);
                self.drop_connection();
                return Err(e);
            }
        };

        let result = evaluate(&self.required, &received, self.negotiated.as_deref());
        log::debug!("input negotiation result: {:?}", result);
        if let Some(callback) = &self.callback {
            let required_spec = self.required.spec().unwrap_or("");
            let received_spec = received.spec().unwrap_or("");
            if !callback(result, required_spec, received_spec) {
                log::debug!("negotiation callback refused the connection");
                self.drop_connection();
                return Err(Error::FormatMismatch);
            }
        }
        match result {
            NegotiationResult::Ok
            | NegotiationResult::ReceiverSubset
            | NegotiationResult::SenderSubset => {
                self.negotiated = received.spec().map(str::to_owned);
                Ok(())
            }
            NegotiationResult::FmtChanged => {
                let spec = received.spec().unwrap_or("").to_owned();
                self.negotiated = Some(spec.clone());
                self.pending_change = Some(spec);
                Ok(())
            }
            NegotiationResult::FmtUnknown => {
                self.drop_connection();
                Err(Error::FormatUnknown)
            }
            NegotiationResult::Failed => {
                self.drop_connection();
                Err(Error::Timeout)
            }
            NegotiationResult::FmtMismatch => {
                self.drop_connection();
                Err(Error::FormatMismatch)
            }
        }
    }

    /// Make progress on the wire: resume a partial header or payload read.
    /// Returns once a whole container landed; a timed-out call leaves the
    /// partial state in place for the next one.
    fn read_container(&mut self, deadline: Option<Instant>) -> Result<()> {
        loop {
            match self.pending.take() {
                None => {
                    self.pending = Some(Pending::Header {
                        buf: [0; HEADER_SIZE],
                        filled: 0,
                    });
                }
                Some(Pending::Header { mut buf, mut filled }) => {
                    let sock = match self.socket.as_mut() {
                        Some(sock) => sock,
                        None => return Ok(()),
                    };
                    match read_some(sock, &mut buf[filled..], deadline, &self.terminated) {
                        Ok(n) => filled += n,
                        Err(e) => {
                            self.pending = Some(Pending::Header { buf, filled });
                            return Err(e);
                        }
                    }
                    if filled < HEADER_SIZE {
                        self.pending = Some(Pending::Header { buf, filled });
                        continue;
                    }
                    self.start_payload(buf);
                }
                Some(Pending::Payload { mut filled }) => {
                    let sock = match self.socket.as_mut() {
                        Some(sock) => sock,
                        None => return Ok(()),
                    };
                    match read_some(
                        sock,
                        &mut self.container[filled..],
                        deadline,
                        &self.terminated,
                    ) {
                        Ok(n) => filled += n,
                        Err(e) => {
                            self.pending = Some(Pending::Payload { filled });
                            return Err(e);
                        }
                    }
                    if filled < self.payload_len {
                        self.pending = Some(Pending::Payload { filled });
                        continue;
                    }
                    self.stats.received_containers += 1;
                    return Ok(());
                }
            }
        }
    }

    /// Parse a complete container header and prepare the payload read.
    fn start_payload(&mut self, header: [u8; HEADER_SIZE]) {
        let payload_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let seq = u64::from_be_bytes([
            header[4], header[5], header[6], header[7], header[8], header[9], header[10],
            header[11],
        ]);
        let count = u16::from_be_bytes([header[12], header[13]]);

        if let Some(expected) = self.expected_seq {
            if seq > expected {
                let missed = seq - expected;
                self.stats.missed_records += missed;
                log::warn!(
                    "missed {} records ({} missed of {} total)",
                    missed,
                    self.stats.missed_records,
                    self.stats.missed_records + self.stats.received_records
                );
            }
        }
        self.expected_seq = Some(seq + count as u64);

        self.container.resize(payload_len, 0);
        self.payload_len = payload_len;
        self.next_off = 0;
        self.recs_left = count;
        self.pending = if payload_len > 0 {
            Some(Pending::Payload { filled: 0 })
        } else {
            None
        };
    }

    /// Take the next record span out of the current container. `None` means
    /// the container framing was malformed and the rest is discarded.
    fn pop_record(&mut self) -> Option<(usize, usize)> {
        if self.next_off + 2 > self.payload_len {
            log::warn!("truncated record length prefix, discarding container rest");
            self.next_off = self.payload_len;
            return None;
        }
        let len =
            u16::from_be_bytes([self.container[self.next_off], self.container[self.next_off + 1]])
                as usize;
        let start = self.next_off + 2;
        if start + len > self.payload_len {
            log::warn!("record crosses the container end, discarding container rest");
            self.next_off = self.payload_len;
            return None;
        }
        self.next_off = start + len;
        if self.recs_left == 0 {
            log::warn!("container holds more records than its header counted");
        } else {
            self.recs_left -= 1;
            if self.next_off >= self.payload_len && self.recs_left > 0 {
                log::warn!(
                    "container ended {} records short of its header count",
                    self.recs_left
                );
            }
        }
        self.stats.received_records += 1;
        Some((start, len))
    }
}

impl Drop for StreamReceiver {
    fn drop(&mut self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.drop_connection();
    }
}

fn connect_tcp(host: &str, port: u16, deadline: Option<Instant>) -> std::io::Result<TcpStream> {
    match deadline {
        None => TcpStream::connect((host, port)),
        Some(d) => {
            use std::net::ToSocketAddrs;
            let addr = (host, port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotFound, "host did not resolve")
                })?;
            let budget = d
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(10));
            TcpStream::connect_timeout(&addr, budget)
        }
    }
}

/// Read at least one byte, observing the deadline and the terminated flag.
/// The socket read timeout is sliced so termination stays responsive even
/// in wait-forever mode.
fn read_some(
    sock: &mut Socket,
    buf: &mut [u8],
    deadline: Option<Instant>,
    terminated: &AtomicBool,
) -> Result<usize> {
    const SLICE: Duration = Duration::from_millis(200);
    loop {
        if terminated.load(Ordering::SeqCst) {
            return Err(Error::Terminated);
        }
        let timeout = match deadline {
            None => SLICE,
            Some(d) => d
                .saturating_duration_since(Instant::now())
                .min(SLICE)
                .max(Duration::from_millis(1)),
        };
        sock.set_read_timeout(Some(timeout))?;
        match sock.read(buf) {
            Ok(0) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "sender closed the connection",
                )))
            }
            Ok(n) => return Ok(n),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                    return Err(Error::Timeout);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}

fn sleep_observing(terminated: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while !terminated.load(Ordering::SeqCst) {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        std::thread::sleep(left.min(Duration::from_millis(20)));
    }
}
