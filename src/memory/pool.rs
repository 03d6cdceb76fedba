use parking_lot::Mutex;

/// How many objects move between the CPU and NUMA layers at once.
const TRANSFER_BATCH: usize = 16;

/// Two-layer object pool: one cache per CPU backed by one cache per NUMA
/// node, plus a locked external cache for callers that are not worker
/// threads.
///
/// Acquisition hits the caller's CPU cache and refills it in batches from
/// the CPU's NUMA cache when empty. Release returns to the CPU cache and
/// spills surplus back to the NUMA layer, so objects gravitate to the
/// NUMA node that actually uses them.
#[derive(Debug)]
pub struct ObjectPool<T> {
    cpu_caches: Vec<Mutex<Vec<T>>>,
    numa_caches: Vec<Mutex<Vec<T>>>,
    cpu_to_numa: Vec<usize>,
    external: Mutex<Vec<T>>,
}

impl<T> ObjectPool<T> {
    pub fn new(cpu_to_numa: Vec<usize>, numa_count: usize) -> Self {
        assert!(numa_count > 0);
        debug_assert!(cpu_to_numa.iter().all(|n| *n < numa_count));

        let cpu_caches = (0..cpu_to_numa.len()).map(|_| Mutex::new(Vec::new())).collect();
        let numa_caches = (0..numa_count).map(|_| Mutex::new(Vec::new())).collect();

        Self {
            cpu_caches,
            numa_caches,
            cpu_to_numa,
            external: Mutex::new(Vec::new()),
        }
    }

    /// Take an object, constructing a fresh one when every layer is dry.
    /// `cpu` is the caller's virtual CPU id; `None` routes through the
    /// external cache.
    pub fn acquire_with(&self, cpu: Option<usize>, make: impl FnOnce() -> T) -> T {
        let Some(cpu) = cpu.filter(|c| *c < self.cpu_caches.len()) else {
            return self.external.lock().pop().unwrap_or_else(make);
        };

        let mut cache = self.cpu_caches[cpu].lock();
        if let Some(obj) = cache.pop() {
            return obj;
        }

        // Refill a batch from the NUMA layer while we hold the CPU cache.
        let numa = self.cpu_to_numa[cpu];
        let mut upstream = self.numa_caches[numa].lock();
        let take = upstream.len().min(TRANSFER_BATCH);
        if take > 0 {
            let split = upstream.len() - take;
            cache.extend(upstream.drain(split..));
        }
        drop(upstream);

        cache.pop().unwrap_or_else(make)
    }

    /// Return an object to the pool.
    pub fn release(&self, cpu: Option<usize>, obj: T) {
        let Some(cpu) = cpu.filter(|c| *c < self.cpu_caches.len()) else {
            self.external.lock().push(obj);
            return;
        };

        let mut cache = self.cpu_caches[cpu].lock();
        cache.push(obj);

        if cache.len() > 2 * TRANSFER_BATCH {
            let split = cache.len() - TRANSFER_BATCH;
            let spill: Vec<T> = cache.drain(split..).collect();
            drop(cache);
            self.numa_caches[self.cpu_to_numa[cpu]].lock().extend(spill);
        }
    }

    /// Rough object count across every layer. Unsynchronized; debug use.
    pub fn approximate_len(&self) -> usize {
        let cpu: usize = self.cpu_caches.iter().map(|c| c.lock().len()).sum();
        let numa: usize = self.numa_caches.iter().map(|c| c.lock().len()).sum();
        cpu + numa + self.external.lock().len()
    }
}
