//! Bounded ring of parsed packet metadata for the monitoring surface.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::parser::PacketInfo;

struct Inner {
    buf: VecDeque<PacketInfo>,
    capacity: usize,
}

/// Holds the most recent [`PacketInfo`] records, evicting the oldest first
/// once `capacity` is reached. The control surface drains it with
/// [`fetch_and_clear`](MonitorRing::fetch_and_clear); entries never feed
/// back into the pipeline.
pub struct MonitorRing {
    inner: Mutex<Inner>,
}

impl MonitorRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity.min(4096)),
                capacity,
            }),
        }
    }

    /// Append one record, returning how many old records were evicted to
    /// make room.
    pub fn push(&self, info: PacketInfo) -> u64 {
        let mut inner = self.inner.lock();
        inner.buf.push_back(info);
        let mut evicted = 0;
        while inner.buf.len() > inner.capacity {
            inner.buf.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Change the bound. Shrinking evicts the oldest overflow immediately;
    /// the eviction count is returned.
    pub fn set_capacity(&self, capacity: usize) -> u64 {
        let mut inner = self.inner.lock();
        inner.capacity = capacity;
        let mut evicted = 0;
        while inner.buf.len() > inner.capacity {
            inner.buf.pop_front();
            evicted += 1;
        }
        evicted
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().buf.is_empty()
    }

    /// Take everything currently buffered, oldest first.
    pub fn fetch_and_clear(&self) -> Vec<PacketInfo> {
        self.inner.lock().buf.drain(..).collect()
    }
}
