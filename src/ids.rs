use crate::memory::MemoryRegion;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Identifies one message on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

/// Cluster-unique identifier of a region's content version. `WriteId::NONE`
/// means "no version produced yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteId(pub u64);

impl WriteId {
    pub const NONE: WriteId = WriteId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Identifies a task this node has offloaded to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OffloadedTaskId(pub u64);

impl fmt::Display for OffloadedTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Node-partitioned monotonic counter. Node `N` of a `K`-node cluster
/// issues `N + K`, `N + 2K`, `N + 3K`, … so no two nodes can ever collide
/// and zero stays reserved as the "none" value.
#[derive(Debug)]
struct PartitionedCounter {
    base: AtomicU64,
    stride: AtomicU64,
    next: AtomicU64,
}

impl PartitionedCounter {
    fn new() -> Self {
        Self {
            base: AtomicU64::new(0),
            stride: AtomicU64::new(1),
            next: AtomicU64::new(1),
        }
    }

    fn initialize(&self, node_index: usize, cluster_size: usize) {
        debug_assert!(cluster_size > 0 && node_index < cluster_size);
        self.base.store(node_index as u64, Ordering::Relaxed);
        self.stride.store(cluster_size as u64, Ordering::Relaxed);
        self.next.store(1, Ordering::Relaxed);
    }

    fn allocate(&self) -> u64 {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        if n == u64::MAX {
            Self::exhausted();
        }
        self.base.load(Ordering::Relaxed) + self.stride.load(Ordering::Relaxed) * n
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique id: bitspace exhausted")
    }
}

/// The three counter families of the runtime: message ids, write ids and
/// offloaded-task ids. Re-based once the messenger reports this node's
/// index and the cluster size.
#[derive(Debug)]
pub struct IdServices {
    message: PartitionedCounter,
    write: PartitionedCounter,
    offloaded: PartitionedCounter,
}

impl IdServices {
    pub fn new() -> Self {
        Self {
            message: PartitionedCounter::new(),
            write: PartitionedCounter::new(),
            offloaded: PartitionedCounter::new(),
        }
    }

    pub fn initialize(&self, node_index: usize, cluster_size: usize) {
        self.message.initialize(node_index, cluster_size);
        self.write.initialize(node_index, cluster_size);
        self.offloaded.initialize(node_index, cluster_size);
    }

    pub fn next_message_id(&self) -> MessageId {
        MessageId(self.message.allocate())
    }

    pub fn next_write_id(&self) -> WriteId {
        WriteId(self.write.allocate())
    }

    pub fn next_offloaded_task_id(&self) -> OffloadedTaskId {
        OffloadedTaskId(self.offloaded.allocate())
    }
}

impl Default for IdServices {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded cache of `(write id → region)` pairs this node already holds
/// at that version. A hit for a fully-contained region cancels the need
/// to fetch. Eviction is LRU: a hit refreshes the entry, inserts past
/// capacity drop the coldest one.
#[derive(Debug)]
pub struct WriteIdCache {
    inner: Mutex<CacheInner>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

#[derive(Debug)]
struct CacheInner {
    entries: HashMap<WriteId, MemoryRegion>,
    order: VecDeque<WriteId>,
    capacity: usize,
}

impl WriteIdCache {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "write-id cache capacity cannot be 0");
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::with_capacity(capacity.min(1024)),
                order: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
            }),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Record that this node holds `region` at version `write_id`.
    pub fn register_local(&self, write_id: WriteId, region: MemoryRegion) {
        if write_id.is_none() {
            return;
        }

        let mut inner = self.inner.lock();
        if inner.entries.insert(write_id, region).is_none() {
            inner.order.push_back(write_id);
        } else {
            inner.refresh(write_id);
        }

        while inner.order.len() > inner.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.entries.remove(&evicted);
            }
        }
    }

    /// Does this node already hold the version `write_id` for all of
    /// `region`? Containment matters: a cached entry for a larger region
    /// covers any sub-region of it.
    pub fn check_local(&self, write_id: WriteId, region: MemoryRegion) -> bool {
        if write_id.is_none() {
            return false;
        }

        let mut inner = self.inner.lock();
        let hit = inner
            .entries
            .get(&write_id)
            .is_some_and(|cached| cached.contains(&region));

        if hit {
            inner.refresh(write_id);
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Drop a version, e.g. when the region is overwritten locally.
    pub fn invalidate(&self, write_id: WriteId) {
        let mut inner = self.inner.lock();
        if inner.entries.remove(&write_id).is_some() {
            inner.order.retain(|id| *id != write_id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheInner {
    fn refresh(&mut self, write_id: WriteId) {
        if let Some(pos) = self.order.iter().position(|id| *id == write_id) {
            self.order.remove(pos);
            self.order.push_back(write_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_partitioned_ids_unique_across_nodes() {
        // Simulate a 4-node cluster: every node allocates from its own
        // residue class, so the union is collision-free.
        let cluster_size = 4;
        let per_node = 1000;

        let mut all = HashSet::new();
        for node in 0..cluster_size {
            let ids = IdServices::new();
            ids.initialize(node, cluster_size);
            for _ in 0..per_node {
                assert!(all.insert(ids.next_write_id()));
            }
        }
        assert_eq!(all.len(), cluster_size * per_node);
    }

    #[test]
    fn test_ids_never_zero() {
        let ids = IdServices::new();
        ids.initialize(0, 2);
        for _ in 0..10 {
            assert!(!ids.next_write_id().is_none());
            assert_ne!(ids.next_message_id().0, 0);
        }
    }

    #[test]
    fn test_cache_contained_region_hits() {
        let cache = WriteIdCache::new(16);
        let full = MemoryRegion::new(0x1000, 0x3000);
        let id = WriteId(42);

        cache.register_local(id, full);

        assert!(cache.check_local(id, full));
        assert!(cache.check_local(id, MemoryRegion::new(0x1800, 0x2000)));
        // Sticking out on either side is a miss.
        assert!(!cache.check_local(id, MemoryRegion::new(0x800, 0x2000)));
        assert!(!cache.check_local(WriteId(43), full));
        assert!(!cache.check_local(WriteId::NONE, full));
    }

    #[test]
    fn test_cache_evicts_lru() {
        let cache = WriteIdCache::new(2);
        let r = |i: u64| MemoryRegion::new(i * 0x1000, (i + 1) * 0x1000);

        cache.register_local(WriteId(1), r(1));
        cache.register_local(WriteId(2), r(2));
        // Touch 1 so 2 becomes the coldest entry.
        assert!(cache.check_local(WriteId(1), r(1)));
        cache.register_local(WriteId(3), r(3));

        assert_eq!(cache.len(), 2);
        assert!(cache.check_local(WriteId(1), r(1)));
        assert!(!cache.check_local(WriteId(2), r(2)));
        assert!(cache.check_local(WriteId(3), r(3)));
    }
}
