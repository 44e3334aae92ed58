//! Producer-side pool of containers: the active one being filled, the ring
//! of published containers all consumers walk, and the recycle stacks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::wire::container::Container;

/// Bounded ring of published containers, ordered by monotone index.
///
/// Head and tail only grow. The producer publishes under the endpoint lock;
/// consumers walk the ring lock-free through the atomics and clone the
/// per-slot `Arc` under a short read lock.
#[derive(Debug)]
pub(crate) struct Ring {
    slots: Vec<RwLock<Option<Arc<Container>>>>,
    head: AtomicU64,
    tail: AtomicU64,
}

impl Ring {
    pub fn new(size: usize) -> Ring {
        Ring {
            slots: (0..size).map(|_| RwLock::new(None)).collect(),
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
        }
    }

    /// Index the next published container will get.
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::SeqCst)
    }

    /// Lowest index still kept in the ring.
    pub fn tail(&self) -> u64 {
        self.tail.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// True when publishing one more container would displace the tail.
    pub fn is_full(&self) -> bool {
        self.head() - self.tail() == self.slots.len() as u64
    }

    /// Publish a container at the head slot and hand back whatever the slot
    /// held before (the displaced container once the ring has wrapped).
    /// Must be called under the endpoint lock.
    pub fn publish(&self, cont: Arc<Container>) -> Option<Arc<Container>> {
        let head = self.head();
        let slot = &self.slots[(head % self.slots.len() as u64) as usize];
        let old = {
            let mut slot = match slot.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            slot.replace(cont)
        };
        self.head.fetch_add(1, Ordering::SeqCst);
        if self.is_full() {
            self.tail.fetch_add(1, Ordering::SeqCst);
        }
        old
    }

    /// Container at monotone index `n`, if the slot is filled. The caller is
    /// responsible for `n` being in the published window; a wrapped slot
    /// returns the newer container living there.
    pub fn at(&self, n: u64) -> Option<Arc<Container>> {
        let slot = &self.slots[(n % self.slots.len() as u64) as usize];
        let slot = match slot.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.clone()
    }
}

/// The producer's container pool. All fields are protected by the endpoint
/// lock except the ring, whose read side is shared with the consumers.
#[derive(Debug)]
pub(crate) struct Mbuf {
    /// Container currently being filled; exclusively owned by the producer.
    pub active: Arc<Container>,
    /// Recyclable containers.
    empty: Vec<Arc<Container>>,
    /// Displaced containers still referenced by a lagging consumer.
    deferred: Vec<Arc<Container>>,
    /// Published containers.
    pub finished_containers: u64,
    /// Records admitted so far; also the sequence number of the next record.
    pub processed_records: u64,
    /// Cached lowest consumer cursor, maintained by the blocking publish
    /// path.
    pub lowest_cont_idx: u64,
}

impl Mbuf {
    /// Preallocate `active_containers + max_clients + 1` containers of
    /// `buffer_size` bytes each. Nothing is allocated on the hot path
    /// afterwards.
    pub fn new(active_containers: usize, max_clients: usize, buffer_size: usize) -> Mbuf {
        let total = active_containers + max_clients + 1;
        let mut empty: Vec<Arc<Container>> = (0..total)
            .map(|_| Arc::new(Container::new(buffer_size)))
            .collect();
        let active = empty.pop().unwrap_or_else(|| {
            // total is always >= 2
            Arc::new(Container::new(buffer_size))
        });
        Mbuf {
            active,
            empty,
            deferred: Vec::with_capacity(total),
            finished_containers: 0,
            processed_records: 0,
            lowest_cont_idx: 0,
        }
    }

    /// Pop a recyclable container and make it the active one. Scavenges the
    /// deferred stack for containers whose last consumer reference is gone.
    ///
    /// With the pool sized as in [`Mbuf::new`] a container is always
    /// available by the time the publish path needs one; the inner loop is a
    /// safety net against a laggard holding its reference across the call.
    pub fn get_empty(&mut self) -> Arc<Container> {
        loop {
            if let Some(cont) = self.empty.pop() {
                self.active = cont.clone();
                return cont;
            }
            self.scavenge_deferred();
            if self.empty.is_empty() {
                log::warn!("container pool exhausted, waiting for a consumer to release one");
                std::thread::sleep(std::time::Duration::from_micros(100));
            }
        }
    }

    /// Move every deferred container whose refcount reached 0 to the empty
    /// stack.
    fn scavenge_deferred(&mut self) {
        let mut i = 0;
        while i < self.deferred.len() {
            if self.deferred[i].refs() == 0 {
                let cont = self.deferred.swap_remove(i);
                cont.clear();
                self.empty.push(cont);
            } else {
                i += 1;
            }
        }
    }

    /// Recycle a container displaced from the ring: drop the producer
    /// reference and either clear it for reuse or park it on the deferred
    /// stack until the last lagging consumer lets go.
    pub fn recycle_displaced(&mut self, old: Arc<Container>) {
        if old.refs() == 0 {
            old.clear();
            self.empty.push(old);
            return;
        }
        if old.release() != 0 {
            self.deferred.push(old);
        } else {
            old.clear();
            self.empty.push(old);
        }
    }

    #[cfg(test)]
    pub fn pool_counts(&self) -> (usize, usize) {
        (self.empty.len(), self.deferred.len())
    }
}
