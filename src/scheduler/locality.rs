use crate::memory::{Directory, MemoryPlace, VirtualMemory};
use crate::node::NodeRegistry;
use crate::task::Task;

/// Where a ready task should execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingDecision {
    RunHere,
    Offload(usize),
}

/// Per-node byte scores over the task's accesses, or None when the task
/// cannot be offloaded (an access falls outside cluster memory).
///
/// An access whose recorded location is concrete adds its full region
/// size to the owner's score; an unknown or directory-sentinel location
/// is split through the directory so every home node gets its share.
/// The scores conserve bytes: they always sum to the total size of the
/// task's cluster-memory accesses.
pub fn node_scores(
    task: &Task,
    nodes: &NodeRegistry,
    vmm: &VirtualMemory,
    directory: &Directory,
) -> Option<Vec<usize>> {
    let mut scores = vec![0usize; nodes.size()];

    for access in task.accesses() {
        let region = access.region();
        if !vmm.is_cluster_memory(&region) {
            return None;
        }

        let location = access.location().unwrap_or(MemoryPlace::Directory);
        match location {
            MemoryPlace::Directory => {
                for part in directory.find(region) {
                    scores[part.home_node] += part.region.len();
                }
            }
            MemoryPlace::Host { node } => {
                scores[node] += region.len();
            }
        }
    }

    Some(scores)
}

/// The locality decision: run the task where most of its bytes live.
/// Ties break on the lowest node index (first maximum). Tasks that are
/// not wire-capable, were received from a peer, or touch non-cluster
/// memory always run here.
pub fn decide(
    task: &Task,
    nodes: &NodeRegistry,
    vmm: &VirtualMemory,
    directory: &Directory,
) -> SchedulingDecision {
    if !nodes.in_cluster_mode() || !task.is_wire_capable() || task.remote_origin().is_some() {
        return SchedulingDecision::RunHere;
    }

    let Some(scores) = node_scores(task, nodes, vmm, directory) else {
        return SchedulingDecision::RunHere;
    };
    debug_assert!(!scores.is_empty());

    let mut best = 0usize;
    for (node, score) in scores.iter().enumerate() {
        // Strict comparison keeps the first maximum on ties.
        if *score > scores[best] {
            best = node;
        }
    }

    if best == nodes.this_index() {
        SchedulingDecision::RunHere
    } else {
        tracing::debug!(task = %task.id(), node = best, "offloading by locality");
        SchedulingDecision::Offload(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, DistributionPolicy};
    use crate::deps::AccessMode;
    use crate::memory::MemoryRegion;
    use crate::task::TaskBuilder;
    use std::sync::Arc;

    const MIB: usize = 1024 * 1024;

    struct Fixture {
        nodes: NodeRegistry,
        vmm: Arc<VirtualMemory>,
        directory: Directory,
    }

    /// A pretend N-node cluster over this process's arena, with this
    /// node being node 0.
    fn fixture(cluster_size: usize) -> Fixture {
        let cfg = ClusterConfig::default().arena_sizes(8 * MIB, 256 * 1024);
        let vmm = Arc::new(VirtualMemory::initialize(&cfg).unwrap());
        Fixture {
            nodes: NodeRegistry::with_indices(cluster_size, 0, 0),
            vmm,
            directory: Directory::new(0, cluster_size),
        }
    }

    #[test]
    fn test_scores_conserve_bytes_over_directory_split() {
        let fx = fixture(2);
        let region = {
            let r = fx.vmm.alloc_distributed(MIB).unwrap();
            MemoryRegion::new(r.start(), r.start() + MIB as u64)
        };
        fx.directory
            .register_allocation(region, DistributionPolicy::EqualBlocks, &[], 0);

        let task = TaskBuilder::registered(1, vec![])
            .access(region, AccessMode::ReadWrite, false)
            .build();

        let scores = node_scores(&task, &fx.nodes, &fx.vmm, &fx.directory).unwrap();
        // Scenario: 1 MiB equal-block over two nodes scores 512 KiB each,
        // conserving the total.
        assert_eq!(scores.iter().sum::<usize>(), MIB);
    }

    #[test]
    fn test_concrete_location_scores_owner_and_offloads() {
        let fx = fixture(2);
        let region = fx.vmm.alloc_distributed(4096).unwrap();

        let task = TaskBuilder::registered(1, vec![])
            .access(region, AccessMode::Read, false)
            .build();
        task.accesses()[0].set_location(MemoryPlace::host(1));

        let scores = node_scores(&task, &fx.nodes, &fx.vmm, &fx.directory).unwrap();
        assert_eq!(scores, vec![0, 4096]);
        assert_eq!(
            decide(&task, &fx.nodes, &fx.vmm, &fx.directory),
            SchedulingDecision::Offload(1)
        );
    }

    #[test]
    fn test_closure_bodies_never_offload() {
        let fx = fixture(2);
        let region = fx.vmm.alloc_distributed(4096).unwrap();

        let task = TaskBuilder::new(|_| {})
            .access(region, AccessMode::Read, false)
            .build();
        task.accesses()[0].set_location(MemoryPlace::host(1));

        assert_eq!(
            decide(&task, &fx.nodes, &fx.vmm, &fx.directory),
            SchedulingDecision::RunHere
        );
    }

    #[test]
    fn test_non_cluster_memory_vetoes_offload() {
        let fx = fixture(2);
        let local = fx.vmm.alloc_local(4096, 0).unwrap();

        let task = TaskBuilder::registered(1, vec![])
            .access(local, AccessMode::Read, false)
            .build();

        assert!(node_scores(&task, &fx.nodes, &fx.vmm, &fx.directory).is_none());
        assert_eq!(
            decide(&task, &fx.nodes, &fx.vmm, &fx.directory),
            SchedulingDecision::RunHere
        );
    }

    #[test]
    fn test_single_node_mode_never_offloads() {
        let fx = fixture(1);
        let region = fx.vmm.alloc_distributed(4096).unwrap();
        let task = TaskBuilder::registered(1, vec![])
            .access(region, AccessMode::Read, false)
            .build();

        assert_eq!(
            decide(&task, &fx.nodes, &fx.vmm, &fx.directory),
            SchedulingDecision::RunHere
        );
    }

    #[test]
    fn test_first_maximum_tie_break() {
        // Direct argmax semantics: on a tie the lowest index wins.
        let scores = [512 * 1024usize, 512 * 1024];
        let mut best = 0;
        for (node, score) in scores.iter().enumerate() {
            if *score > scores[best] {
                best = node;
            }
        }
        assert_eq!(best, 0);
    }
}
