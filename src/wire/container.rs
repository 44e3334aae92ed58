//! The framed batch of records travelling from the producer to every
//! consumer.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Bytes of the on-wire container header: 4-byte payload length, 8-byte
/// sequence number, 2-byte record count, all big-endian.
pub(crate) const HEADER_SIZE: usize = 14;

/// Buffer and fill state of a container. Mutated only by the producer while
/// it exclusively owns the container; consumers take the lock just to read
/// the finished bytes out to their socket.
#[derive(Debug)]
pub(crate) struct ContainerBuf {
    pub buffer: Vec<u8>,
    /// Bytes filled so far, header included.
    pub used: usize,
    /// Records inserted so far.
    pub count: u16,
    /// Sequence number of the first record in the container.
    pub seq: u64,
    /// Monotone ring index stamped when the header is written.
    pub idx: u64,
}

impl ContainerBuf {
    /// True iff `size` more bytes fit into the buffer.
    pub fn has_space(&self, size: usize) -> bool {
        self.buffer.len() - self.used >= size
    }

    /// Append one record: a 2-byte big-endian length prefix, then the bytes.
    pub fn insert(&mut self, data: &[u8]) {
        let len = data.len() as u16;
        self.buffer[self.used..self.used + 2].copy_from_slice(&len.to_be_bytes());
        self.buffer[self.used + 2..self.used + 2 + data.len()].copy_from_slice(data);
        self.used += 2 + data.len();
        self.count += 1;
    }

    /// Stamp the 14-byte header and remember the ring index.
    pub fn write_header(&mut self, idx: u64) {
        self.idx = idx;
        let payload = (self.used - HEADER_SIZE) as u32;
        self.buffer[0..4].copy_from_slice(&payload.to_be_bytes());
        self.buffer[4..12].copy_from_slice(&self.seq.to_be_bytes());
        self.buffer[12..14].copy_from_slice(&self.count.to_be_bytes());
    }
}

/// A preallocated, reference-counted container.
///
/// The reference counter tracks consumer interest the way the ring protocol
/// expects: a cleared container starts at 1 (the producer's reference);
/// non-blocking consumers acquire/release around each transmission; the
/// producer drops its reference when the container is displaced from the
/// ring. A container is recyclable once the counter reaches 0.
#[derive(Debug)]
pub(crate) struct Container {
    refs: AtomicI32,
    inner: Mutex<ContainerBuf>,
}

impl Container {
    pub fn new(capacity: usize) -> Container {
        Container {
            refs: AtomicI32::new(1),
            inner: Mutex::new(ContainerBuf {
                buffer: vec![0; capacity],
                used: HEADER_SIZE,
                count: 0,
                seq: 0,
                idx: 0,
            }),
        }
    }

    /// Reset to the freshly-created state: one (producer) reference, empty
    /// payload.
    pub fn clear(&self) {
        self.refs.store(1, Ordering::SeqCst);
        let mut inner = self.lock();
        inner.used = HEADER_SIZE;
        inner.count = 0;
        inner.seq = 0;
        inner.idx = 0;
    }

    pub fn lock(&self) -> MutexGuard<'_, ContainerBuf> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Increment the reference counter; returns the previous value. A
    /// previous value below 1 means the container was already recycled and
    /// the caller must skip it.
    pub fn acquire(&self) -> i32 {
        self.refs.fetch_add(1, Ordering::SeqCst)
    }

    /// Decrement the reference counter; returns the new value.
    pub fn release(&self) -> i32 {
        self.refs.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Current reference count.
    pub fn refs(&self) -> i32 {
        self.refs.load(Ordering::SeqCst)
    }
}

/// True iff a record of `size` bytes (its length prefix included) can fit
/// into an empty container of `capacity` bytes.
pub(crate) fn has_capacity(capacity: usize, size: usize) -> bool {
    size <= capacity - HEADER_SIZE
}
