use crate::config::ClusterConfig;
use crate::memory::MemoryRegion;
use anyhow::{Context, Result, anyhow};
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use parking_lot::Mutex;
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::OnceLock;

/// Allocation granularity inside the arenas.
const ARENA_ALIGN: u64 = 64;

pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// The cluster-wide virtual address range of this process.
///
/// One contiguous anonymous mapping is reserved at init and carved into a
/// distributed arena (the pool for cluster-wide allocations) plus one
/// local arena per NUMA node. Carving never moves: a region handed out
/// stays valid at the same addresses until freed.
#[derive(Debug)]
pub struct VirtualMemory {
    mapping: NonNull<c_void>,
    mapping_len: usize,
    distributed: Arena,
    locals: Vec<Arena>,
}

// The raw mapping pointer is only used for the final munmap; all
// allocation state is behind the arena mutexes.
unsafe impl Send for VirtualMemory {}
unsafe impl Sync for VirtualMemory {}

impl VirtualMemory {
    /// Reserve the address range and set up the memory layout. Failure to
    /// reserve is a fatal initialization error surfaced to the caller.
    pub fn initialize(cfg: &ClusterConfig) -> Result<Self> {
        let page = page_size() as u64;
        let distrib_size = round_up(cfg.distributed_arena_size as u64, page);
        let local_size = round_up(cfg.local_arena_size as u64, page);
        let total = distrib_size + local_size * cfg.numa_nodes as u64;

        let mapping = unsafe {
            mmap_anonymous(
                None,
                NonZeroUsize::new(total as usize)
                    .ok_or_else(|| anyhow!("empty virtual memory reservation"))?,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .context("reserving the cluster virtual address range")?;

        let base = mapping.as_ptr() as u64;
        let distributed = Arena::new(MemoryRegion::new(base, base + distrib_size));

        let mut locals = Vec::with_capacity(cfg.numa_nodes);
        let mut cursor = base + distrib_size;
        for _ in 0..cfg.numa_nodes {
            locals.push(Arena::new(MemoryRegion::new(cursor, cursor + local_size)));
            cursor += local_size;
        }

        tracing::debug!(
            base,
            distributed = distrib_size,
            local = local_size,
            numa_nodes = cfg.numa_nodes,
            "reserved cluster virtual memory"
        );

        Ok(Self {
            mapping,
            mapping_len: total as usize,
            distributed,
            locals,
        })
    }

    /// Carve a block out of the distributed arena.
    pub fn alloc_distributed(&self, size: usize) -> Result<MemoryRegion> {
        self.distributed.alloc(size)
    }

    pub fn free_distributed(&self, region: MemoryRegion) {
        self.distributed.free(region);
    }

    /// Carve a block out of the local arena of `numa_node`.
    pub fn alloc_local(&self, size: usize, numa_node: usize) -> Result<MemoryRegion> {
        self.locals
            .get(numa_node)
            .ok_or_else(|| anyhow!("NUMA node {numa_node} out of range"))?
            .alloc(size)
    }

    pub fn free_local(&self, region: MemoryRegion, numa_node: usize) {
        self.locals[numa_node].free(region);
    }

    /// Does `region` fall inside the distributed arena? This is what gates
    /// remote offloadability: only cluster memory can be fetched by peers.
    pub fn is_cluster_memory(&self, region: &MemoryRegion) -> bool {
        self.distributed.span.contains(region)
    }

    pub fn distributed_span(&self) -> MemoryRegion {
        self.distributed.span
    }
}

impl Drop for VirtualMemory {
    fn drop(&mut self) {
        // Safety: `mapping` came from mmap_anonymous with exactly this
        // length and nothing is handed out past the runtime's lifetime.
        if let Err(e) = unsafe { munmap(self.mapping, self.mapping_len) } {
            tracing::warn!("failed to unmap cluster virtual memory: {e}");
        }
    }
}

/// Bump allocator with a first-fit free list over a fixed span.
#[derive(Debug)]
struct Arena {
    span: MemoryRegion,
    state: Mutex<ArenaState>,
}

#[derive(Debug)]
struct ArenaState {
    /// Next never-allocated address.
    bump: u64,
    /// Previously freed blocks, first-fit reused.
    free_list: Vec<MemoryRegion>,
}

impl Arena {
    fn new(span: MemoryRegion) -> Self {
        let bump = span.start();
        Self {
            span,
            state: Mutex::new(ArenaState {
                bump,
                free_list: Vec::new(),
            }),
        }
    }

    fn alloc(&self, size: usize) -> Result<MemoryRegion> {
        if size == 0 {
            return Err(anyhow!("zero-size allocation"));
        }
        let size = round_up(size as u64, ARENA_ALIGN);

        let mut state = self.state.lock();

        // First fit from the free list, splitting the tail back.
        if let Some(pos) = state
            .free_list
            .iter()
            .position(|block| block.len() as u64 >= size)
        {
            let block = state.free_list.swap_remove(pos);
            let taken = MemoryRegion::new(block.start(), block.start() + size);
            if taken.end() < block.end() {
                state
                    .free_list
                    .push(MemoryRegion::new(taken.end(), block.end()));
            }
            return Ok(taken);
        }

        let start = state.bump;
        let end = start + size;
        if end > self.span.end() {
            return Err(anyhow!(
                "arena {:?} exhausted: cannot allocate {size} bytes",
                self.span
            ));
        }
        state.bump = end;
        Ok(MemoryRegion::new(start, end))
    }

    fn free(&self, region: MemoryRegion) {
        assert!(
            self.span.contains(&region),
            "freeing {region:?} which is outside arena {:?}",
            self.span
        );
        let size = round_up(region.len() as u64, ARENA_ALIGN);
        let block = MemoryRegion::new(region.start(), region.start() + size);

        let mut state = self.state.lock();
        if state.free_list.iter().any(|b| b.intersects(&block)) {
            panic!("double free of {region:?}");
        }
        state.free_list.push(block);
    }
}

fn round_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(VirtualMemory: Send, Sync);

    fn small_config() -> ClusterConfig {
        ClusterConfig::default().arena_sizes(1024 * 1024, 256 * 1024)
    }

    #[test]
    fn test_layout_and_cluster_memory_gate() {
        let cfg = small_config().numa_nodes(2);
        let vmm = VirtualMemory::initialize(&cfg).unwrap();

        let distributed = vmm.alloc_distributed(4096).unwrap();
        assert!(vmm.is_cluster_memory(&distributed));

        let local = vmm.alloc_local(4096, 0).unwrap();
        assert!(!vmm.is_cluster_memory(&local));

        let local1 = vmm.alloc_local(4096, 1).unwrap();
        assert!(!local.intersects(&local1));
        assert!(!distributed.intersects(&local));

        assert!(vmm.alloc_local(4096, 2).is_err());
    }

    #[test]
    fn test_free_list_reuse() {
        let cfg = small_config();
        let vmm = VirtualMemory::initialize(&cfg).unwrap();

        let a = vmm.alloc_distributed(8192).unwrap();
        let b = vmm.alloc_distributed(4096).unwrap();
        vmm.free_distributed(a);

        // The freed block satisfies a smaller allocation first-fit.
        let c = vmm.alloc_distributed(4096).unwrap();
        assert_eq!(c.start(), a.start());
        assert!(!c.intersects(&b));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let cfg = small_config();
        let vmm = VirtualMemory::initialize(&cfg).unwrap();
        let a = vmm.alloc_distributed(4096).unwrap();
        vmm.free_distributed(a);
        vmm.free_distributed(a);
    }

    #[test]
    fn test_arena_exhaustion_is_an_error() {
        let cfg = small_config();
        let vmm = VirtualMemory::initialize(&cfg).unwrap();
        assert!(vmm.alloc_distributed(2 * 1024 * 1024).is_err());
    }
}
