//! The output endpoint: accept loop, per-consumer sender threads, batching
//! into containers and the bounded dispatch ring.

use std::io::Write;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::tools::error::{Error, Result};
use crate::wire::container::{self, HEADER_SIZE};
use crate::wire::mbuf::{Mbuf, Ring};
use crate::wire::negotiate::{write_hello, DataFormat};
use crate::wire::next_backoff_us;
use crate::wire::params::{EndpointAddr, SenderConfig};
use crate::wire::socket::{shutdown_fd, Listener, Socket};

/// Counters of one connected consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    /// Stable client id: remote port for TCP, peer pid for unix sockets.
    pub id: u32,
    /// Containers transmitted to this consumer.
    pub sent_containers: u64,
    /// Records transmitted to this consumer.
    pub sent_records: u64,
}

#[derive(Debug)]
struct Client {
    id: u32,
    fd: i32,
    /// Monotone index of the next container to transmit.
    cursor: AtomicU64,
    sent_containers: AtomicU64,
    sent_records: AtomicU64,
}

#[derive(Debug)]
struct Shared {
    cfg: SenderConfig,
    /// The endpoint lock: active container, recycle stacks, counters.
    state: Mutex<Mbuf>,
    /// Published containers; read side shared with the sender threads.
    ring: Ring,
    format: Mutex<Option<DataFormat>>,
    clients: Mutex<Vec<Arc<Client>>>,
    sender_threads: Mutex<Vec<JoinHandle<()>>>,
    connected: AtomicU32,
    terminated: AtomicBool,
    /// A freshly accepted consumer is waiting for the endpoint lock; a
    /// blocking publish releases the lock so the accept path can finish.
    client_pending: AtomicBool,
    /// A finish-active is in flight with the lock transiently released.
    in_finish: AtomicBool,
    epoch: Instant,
    /// Microseconds since `epoch` of the last container publication.
    autoflush_stamp: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Shared {
    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    fn stamp_autoflush(&self) {
        self.autoflush_stamp.store(self.now_us(), Ordering::SeqCst);
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Lowest cursor over the connected consumers, or `None` without any.
    fn lowest_cursor(&self) -> Option<u64> {
        lock(&self.clients)
            .iter()
            .map(|c| c.cursor.load(Ordering::SeqCst))
            .min()
    }
}

/// Publish the active container into the ring.
///
/// In blocking mode, when the publication would overwrite a container a
/// consumer has not passed yet, the producer spins with capped exponential
/// backoff until the slowest cursor advances. While a freshly accepted
/// consumer is waiting to be admitted, the endpoint lock is released so the
/// accept path can initialize it, then re-acquired.
fn finish_active<'a>(
    shared: &'a Arc<Shared>,
    mut st: MutexGuard<'a, Mbuf>,
) -> Result<MutexGuard<'a, Mbuf>> {
    shared.in_finish.store(true, Ordering::SeqCst);
    st.active.lock().write_header(shared.ring.head());

    if shared.cfg.blocking
        && st.lowest_cont_idx <= shared.ring.tail()
        && shared.ring.head() - shared.ring.tail() >= shared.ring.capacity() as u64 - 1
    {
        let mut backoff = 1u64;
        loop {
            if shared.is_terminated() {
                shared.in_finish.store(false, Ordering::SeqCst);
                return Err(Error::Terminated);
            }
            st.lowest_cont_idx = shared.lowest_cursor().unwrap_or(0);
            if st.lowest_cont_idx > shared.ring.tail() {
                break;
            }
            if shared.client_pending.load(Ordering::SeqCst) {
                drop(st);
                while shared.client_pending.load(Ordering::SeqCst) && !shared.is_terminated() {
                    std::thread::sleep(Duration::from_micros(1_000));
                }
                st = lock(&shared.state);
                continue;
            }
            backoff = next_backoff_us(backoff);
            std::thread::sleep(Duration::from_micros(backoff));
        }
    }

    if let Some(old) = shared.ring.publish(st.active.clone()) {
        st.recycle_displaced(old);
    }
    st.finished_containers += 1;
    shared.stamp_autoflush();
    shared.in_finish.store(false, Ordering::SeqCst);
    Ok(st)
}

/// Finish the active container and make a fresh one active, stamping its
/// sequence number with the processed-record counter.
fn rotate_active<'a>(
    shared: &'a Arc<Shared>,
    st: MutexGuard<'a, Mbuf>,
) -> Result<MutexGuard<'a, Mbuf>> {
    let mut st = finish_active(shared, st)?;
    let seq = st.processed_records;
    let cont = st.get_empty();
    cont.lock().seq = seq;
    Ok(st)
}

fn flush_inner(shared: &Arc<Shared>) -> Result<()> {
    if shared.in_finish.load(Ordering::SeqCst) {
        return Ok(());
    }
    let st = lock(&shared.state);
    if st.active.lock().used == HEADER_SIZE {
        return Ok(());
    }
    let _unused = rotate_active(shared, st)?;
    Ok(())
}

/// Transmit a whole buffer, absorbing partial writes, `EINTR` and `EAGAIN`.
fn send_all(sock: &mut Socket, bytes: &[u8]) -> std::io::Result<()> {
    let mut done = 0;
    while done < bytes.len() {
        match sock.write(&bytes[done..]) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "consumer socket closed",
                ))
            }
            Ok(n) => done += n,
            Err(e)
                if e.kind() == std::io::ErrorKind::Interrupted
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                continue
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Spin with capped backoff until the ring publishes the container at
/// `cursor`. Returns false when the endpoint terminated instead.
fn wait_for_container(shared: &Shared, cursor: u64) -> bool {
    let mut backoff = 1u64;
    loop {
        if shared.is_terminated() {
            return false;
        }
        if shared.ring.head() > cursor {
            return true;
        }
        backoff = next_backoff_us(backoff);
        std::thread::sleep(Duration::from_micros(backoff));
    }
}

fn disconnect(shared: &Shared, client: &Arc<Client>) {
    shared.connected.fetch_sub(1, Ordering::SeqCst);
    shutdown_fd(client.fd);
    lock(&shared.clients).retain(|c| !Arc::ptr_eq(c, client));
    log::debug!("consumer {} disconnected", client.id);
}

/// Sender loop of one consumer in blocking mode: walk the ring from the own
/// cursor and transmit whole containers in order.
fn sender_blocking(shared: Arc<Shared>, client: Arc<Client>, mut sock: Socket) {
    while !shared.is_terminated() {
        let cursor = client.cursor.load(Ordering::SeqCst);
        if !wait_for_container(&shared, cursor) {
            break;
        }
        let cont = match shared.ring.at(cursor) {
            Some(cont) => cont,
            None => continue,
        };
        let count;
        {
            let buf = cont.lock();
            count = buf.count;
            if let Err(e) = send_all(&mut sock, &buf.buffer[..buf.used]) {
                if !shared.is_terminated() {
                    log::debug!("send to consumer {} failed: {}", client.id, e);
                }
                drop(buf);
                disconnect(&shared, &client);
                return;
            }
        }
        client.sent_containers.fetch_add(1, Ordering::SeqCst);
        client.sent_records.fetch_add(count as u64, Ordering::SeqCst);
        client.cursor.fetch_add(1, Ordering::SeqCst);
    }
    disconnect(&shared, &client);
}

/// Sender loop of one consumer in non-blocking mode. Identical to the
/// blocking loop except that a container is acquired before transmission;
/// when the acquire finds it already recycled, or the cursor has fallen
/// behind the ring tail, the consumer jumps to the ring head and drops
/// everything in between.
fn sender_non_blocking(shared: Arc<Shared>, client: Arc<Client>, mut sock: Socket) {
    while !shared.is_terminated() {
        let cursor = client.cursor.load(Ordering::SeqCst);
        if !wait_for_container(&shared, cursor) {
            break;
        }
        let cont = match shared.ring.at(cursor) {
            Some(cont) => cont,
            None => continue,
        };
        if cont.acquire() < 1 {
            cont.release();
            let head = shared.ring.head();
            log::debug!(
                "consumer {} lagged {} containers, skipping ahead",
                client.id,
                head - cursor
            );
            client.cursor.store(head, Ordering::SeqCst);
            continue;
        }
        let count;
        {
            let buf = cont.lock();
            count = buf.count;
            if let Err(e) = send_all(&mut sock, &buf.buffer[..buf.used]) {
                if !shared.is_terminated() {
                    log::debug!("send to consumer {} failed: {}", client.id, e);
                }
                drop(buf);
                cont.release();
                disconnect(&shared, &client);
                return;
            }
        }
        client.sent_containers.fetch_add(1, Ordering::SeqCst);
        client.sent_records.fetch_add(count as u64, Ordering::SeqCst);
        cont.release();

        if client.cursor.load(Ordering::SeqCst) < shared.ring.tail() {
            client.cursor.store(shared.ring.head(), Ordering::SeqCst);
        } else {
            client.cursor.fetch_add(1, Ordering::SeqCst);
        }
    }
    disconnect(&shared, &client);
}

fn admit_client(shared: &Arc<Shared>, mut sock: Socket, id: u32) {
    if shared.connected.load(Ordering::SeqCst) >= shared.cfg.max_clients as u32 {
        log::warn!(
            "refusing consumer {}: {} clients already connected",
            id,
            shared.cfg.max_clients
        );
        sock.shutdown();
        return;
    }
    sock.set_blocking();
    sock.set_nodelay();

    shared.client_pending.store(true, Ordering::SeqCst);
    let st = lock(&shared.state);
    shared.client_pending.store(false, Ordering::SeqCst);

    // output-side negotiation: announce our format before any data
    let format = lock(&shared.format).clone();
    match format {
        None => {
            log::warn!("refusing consumer {}: no output format declared", id);
            sock.shutdown();
            return;
        }
        Some(fmt) => {
            if let Err(e) = write_hello(&mut sock, &fmt) {
                log::warn!("hello to consumer {} failed: {}", id, e);
                sock.shutdown();
                return;
            }
        }
    }

    let client = Arc::new(Client {
        id,
        fd: sock.raw_fd(),
        cursor: AtomicU64::new(shared.ring.tail()),
        sent_containers: AtomicU64::new(0),
        sent_records: AtomicU64::new(0),
    });
    lock(&shared.clients).push(client.clone());
    shared.connected.fetch_add(1, Ordering::SeqCst);

    let thread_shared = shared.clone();
    let blocking = shared.cfg.blocking;
    let handle = std::thread::spawn(move || {
        if blocking {
            sender_blocking(thread_shared, client, sock)
        } else {
            sender_non_blocking(thread_shared, client, sock)
        }
    });
    lock(&shared.sender_threads).push(handle);
    drop(st);
    log::debug!("consumer {} connected", id);
}

/// Accept loop. The listener runs non-blocking and the loop polls the
/// terminated flag between attempts, so termination is observable without a
/// wakeup pipe.
fn accept_loop(shared: Arc<Shared>, listener: Listener) {
    if let Err(e) = listener.set_nonblocking(true) {
        log::error!("cannot make listener non-blocking: {}", e);
        return;
    }
    while !shared.is_terminated() {
        match listener.accept() {
            Ok((sock, id)) => admit_client(&shared, sock, id),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_micros(5_000));
            }
            Err(e) => {
                log::error!("accepting new consumer failed: {}", e);
                std::thread::sleep(Duration::from_micros(5_000));
            }
        }
    }
}

/// Sleep in short slices so the terminated flag stays observable.
fn sleep_observing(shared: &Shared, total: Duration) {
    let deadline = Instant::now() + total;
    while !shared.is_terminated() {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break;
        }
        std::thread::sleep(left.min(Duration::from_millis(20)));
    }
}

fn autoflush_loop(shared: Arc<Shared>) {
    let period = shared.cfg.autoflush;
    while !shared.is_terminated() {
        let since = Duration::from_micros(
            shared
                .now_us()
                .saturating_sub(shared.autoflush_stamp.load(Ordering::SeqCst)),
        );
        if since >= period {
            if let Err(e) = flush_inner(&shared) {
                log::debug!("auto-flush skipped: {}", e);
            }
            sleep_observing(&shared, period);
        } else {
            sleep_observing(&shared, period - since);
        }
    }
}

///
/// Output endpoint of a record stream.
///
/// One producer feeds many concurrent consumers: records are batched into
/// containers, finished containers are published into a bounded ring, and a
/// dedicated sender thread per consumer walks the ring from its own cursor.
/// In blocking mode the producer waits for the slowest consumer before
/// recycling a still-unseen container; otherwise lagging consumers skip
/// ahead and drop the missed range.
///
#[derive(Debug)]
pub struct StreamSender {
    shared: Arc<Shared>,
    local_addr: Option<SocketAddr>,
    accept_thread: Option<JoinHandle<()>>,
    autoflush_thread: Option<JoinHandle<()>>,
}

impl StreamSender {
    /// Open the listening socket, preallocate the container pool and start
    /// the accept and auto-flush threads. Consumers connecting before a
    /// format is declared with [`set_format`](Self::set_format) are refused.
    pub fn new(cfg: SenderConfig) -> Result<StreamSender> {
        StreamSender::create(cfg, None)
    }

    /// [`new`](Self::new) with the stream format declared up front.
    pub fn with_format(cfg: SenderConfig, format: DataFormat) -> Result<StreamSender> {
        StreamSender::create(cfg, Some(format))
    }

    fn create(cfg: SenderConfig, format: Option<DataFormat>) -> Result<StreamSender> {
        if cfg.active_containers == 0 || cfg.max_clients == 0 {
            return Err(Error::spec(
                "active_containers and max_clients must be positive",
            ));
        }
        if cfg.buffer_size <= HEADER_SIZE {
            return Err(Error::spec(format!(
                "container buffer of {} bytes cannot hold the {}-byte header",
                cfg.buffer_size, HEADER_SIZE
            )));
        }
        let listener = match &cfg.addr {
            EndpointAddr::Tcp { host, port } => {
                Listener::Tcp(TcpListener::bind((host.as_str(), *port))?)
            }
            EndpointAddr::Unix { id } => {
                let path = cfg
                    .addr
                    .socket_path()
                    .ok_or_else(|| Error::spec(format!("bad unix socket id {:?}", id)))?;
                // a previous run may have left the socket file behind
                let _ = std::fs::remove_file(&path);
                Listener::Unix(UnixListener::bind(&path)?)
            }
        };
        let local_addr = listener.local_addr();

        let shared = Arc::new(Shared {
            state: Mutex::new(Mbuf::new(
                cfg.active_containers,
                cfg.max_clients,
                cfg.buffer_size,
            )),
            ring: Ring::new(cfg.active_containers),
            format: Mutex::new(format),
            clients: Mutex::new(Vec::new()),
            sender_threads: Mutex::new(Vec::new()),
            connected: AtomicU32::new(0),
            terminated: AtomicBool::new(false),
            client_pending: AtomicBool::new(false),
            in_finish: AtomicBool::new(false),
            epoch: Instant::now(),
            autoflush_stamp: AtomicU64::new(0),
            cfg,
        });
        shared.stamp_autoflush();

        let accept_shared = shared.clone();
        let accept_thread = std::thread::spawn(move || accept_loop(accept_shared, listener));
        let autoflush_shared = shared.clone();
        let autoflush_thread = std::thread::spawn(move || autoflush_loop(autoflush_shared));

        Ok(StreamSender {
            shared,
            local_addr,
            accept_thread: Some(accept_thread),
            autoflush_thread: Some(autoflush_thread),
        })
    }

    /// Declare (or change) the stream format announced to connecting
    /// consumers.
    pub fn set_format(&self, format: DataFormat) {
        *lock(&self.shared.format) = Some(format);
    }

    /// Admit one record into the stream.
    ///
    /// The record goes into the active container; a full container is
    /// published and a fresh one started. A record too large for an empty
    /// container is logged and dropped, and the call still succeeds.
    pub fn send(&self, record: &[u8]) -> Result<()> {
        let needed = record.len() + 2;
        if !container::has_capacity(self.shared.cfg.buffer_size, needed) {
            log::warn!(
                "record of {} bytes cannot fit a container of {} bytes, dropping",
                record.len(),
                self.shared.cfg.buffer_size
            );
            return Ok(());
        }
        if self.shared.is_terminated() {
            return Err(Error::Terminated);
        }

        let mut st = lock(&self.shared.state);
        if !st.active.lock().has_space(needed) {
            st = rotate_active(&self.shared, st)?;
        }
        st.active.lock().insert(record);
        st.processed_records += 1;
        Ok(())
    }

    /// Publish the active container even though it is not full. A container
    /// holding no records is left alone.
    pub fn flush(&self) -> Result<()> {
        flush_inner(&self.shared)
    }

    /// Stop the endpoint: wait briefly for connected consumers to drain the
    /// published containers, then set the terminated flag and wake every
    /// blocked thread. In-flight and subsequent calls fail with
    /// `Terminated`.
    pub fn terminate(&self) {
        for _ in 0..100 {
            match self.shared.lowest_cursor() {
                Some(lowest) if lowest < self.shared.ring.head() => {
                    std::thread::sleep(Duration::from_micros(10_000))
                }
                _ => break,
            }
        }
        self.shared.terminated.store(true, Ordering::SeqCst);
        for client in lock(&self.shared.clients).iter() {
            shutdown_fd(client.fd);
        }
    }

    /// Number of currently connected consumers.
    pub fn connected_clients(&self) -> u32 {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Per-consumer transmission counters.
    pub fn client_stats(&self) -> Vec<ClientStats> {
        lock(&self.shared.clients)
            .iter()
            .map(|c| ClientStats {
                id: c.id,
                sent_containers: c.sent_containers.load(Ordering::SeqCst),
                sent_records: c.sent_records.load(Ordering::SeqCst),
            })
            .collect()
    }

    /// Records admitted so far.
    pub fn processed_records(&self) -> u64 {
        lock(&self.shared.state).processed_records
    }

    /// Containers published so far.
    pub fn finished_containers(&self) -> u64 {
        lock(&self.shared.state).finished_containers
    }

    /// Local address of a TCP listener (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for StreamSender {
    fn drop(&mut self) {
        self.terminate();
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.autoflush_thread.take() {
            let _ = handle.join();
        }
        let handles: Vec<JoinHandle<()>> = lock(&self.shared.sender_threads).drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        for client in lock(&self.shared.clients).drain(..) {
            shutdown_fd(client.fd);
        }
        if let Some(path) = self.shared.cfg.addr.socket_path() {
            let _ = std::fs::remove_file(path);
        }
    }
}
