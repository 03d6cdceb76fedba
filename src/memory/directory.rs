use crate::config::DistributionPolicy;
use crate::memory::{MemoryPlace, MemoryRegion};
use anyhow::{Result, anyhow};
use parking_lot::Mutex;

/// One registered distributed allocation: the covered region and its
/// partition into per-home-node sub-regions, fixed at registration time.
#[derive(Debug, Clone)]
struct Allocation {
    region: MemoryRegion,
    partitions: Vec<HomePartition>,
}

/// A sub-region and the node chosen to physically back it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HomePartition {
    pub region: MemoryRegion,
    pub home_node: usize,
}

/// Maps cluster virtual addresses to home nodes and tracks the current
/// location of live copies.
///
/// Home assignments are immutable for the lifetime of the allocation;
/// locations move as transfers complete and tasks write.
#[derive(Debug)]
pub struct Directory {
    this_node: usize,
    cluster_size: usize,
    allocations: Mutex<Vec<Allocation>>,
    locations: Mutex<Vec<(MemoryRegion, MemoryPlace)>>,
}

impl Directory {
    pub fn new(this_node: usize, cluster_size: usize) -> Self {
        assert!(cluster_size > 0);
        Self {
            this_node,
            cluster_size,
            allocations: Mutex::new(Vec::new()),
            locations: Mutex::new(Vec::new()),
        }
    }

    /// Register a distributed allocation and compute its home-node
    /// partition under the given policy.
    pub fn register_allocation(
        &self,
        region: MemoryRegion,
        policy: DistributionPolicy,
        dims: &[u64],
        allocating_node: usize,
    ) -> Vec<HomePartition> {
        let partitions = self.partition(region, policy, dims, allocating_node);

        let mut allocations = self.allocations.lock();
        debug_assert!(
            !allocations.iter().any(|a| a.region.intersects(&region)),
            "allocation {region:?} overlaps an existing one"
        );
        allocations.push(Allocation {
            region,
            partitions: partitions.clone(),
        });

        tracing::debug!(%region, ?policy, parts = partitions.len(), "registered dmalloc");
        partitions
    }

    /// Drop a distributed allocation. Freeing a region that was never
    /// registered is a protocol violation.
    pub fn unregister_allocation(&self, region: MemoryRegion) -> Result<()> {
        let mut allocations = self.allocations.lock();
        let before = allocations.len();
        allocations.retain(|a| a.region != region);
        if allocations.len() == before {
            return Err(anyhow!("dfree of unknown region {region:?}"));
        }

        self.locations.lock().retain(|(r, _)| !region.contains(r));
        Ok(())
    }

    /// The home-node partition covering `query`. Parts of the query that
    /// fall outside every registered allocation are homed on this node,
    /// which is also the single-node-mode behavior.
    pub fn find(&self, query: MemoryRegion) -> Vec<HomePartition> {
        let allocations = self.allocations.lock();

        let mut out = Vec::new();
        for allocation in allocations.iter() {
            if !allocation.region.intersects(&query) {
                continue;
            }
            for part in &allocation.partitions {
                if let Some(overlap) = part.region.intersect(&query) {
                    out.push(HomePartition {
                        region: overlap,
                        home_node: part.home_node,
                    });
                }
            }
        }

        if out.is_empty() {
            return vec![HomePartition {
                region: query,
                home_node: self.this_node,
            }];
        }

        out.sort_by_key(|p| p.region.start());
        out
    }

    /// Record that `region` now lives at `place`.
    pub fn update_location(&self, region: MemoryRegion, place: MemoryPlace) {
        let mut locations = self.locations.lock();
        locations.retain(|(r, _)| !region.contains(r));
        locations.push((region, place));
    }

    /// The current location of `region`: the most recent update covering
    /// it, or the directory sentinel when nothing concrete is known.
    pub fn query_location(&self, region: MemoryRegion) -> MemoryPlace {
        let locations = self.locations.lock();
        locations
            .iter()
            .rev()
            .find(|(r, _)| r.contains(&region))
            .map(|(_, place)| *place)
            .unwrap_or(MemoryPlace::Directory)
    }

    fn partition(
        &self,
        region: MemoryRegion,
        policy: DistributionPolicy,
        dims: &[u64],
        allocating_node: usize,
    ) -> Vec<HomePartition> {
        let n = self.cluster_size as u64;
        match policy {
            DistributionPolicy::Local => vec![HomePartition {
                region,
                home_node: allocating_node,
            }],

            DistributionPolicy::EqualBlocks => {
                let len = region.len() as u64;
                let block = len / n;
                if block == 0 {
                    // Degenerate allocation smaller than the cluster:
                    // home it whole on the allocating node.
                    return vec![HomePartition {
                        region,
                        home_node: allocating_node,
                    }];
                }

                let mut out = Vec::with_capacity(self.cluster_size);
                let mut cursor = region.start();
                for node in 0..self.cluster_size {
                    let end = if node + 1 == self.cluster_size {
                        region.end()
                    } else {
                        cursor + block
                    };
                    out.push(HomePartition {
                        region: MemoryRegion::new(cursor, end),
                        home_node: node,
                    });
                    cursor = end;
                }
                out
            }

            DistributionPolicy::Cyclic => {
                let block = dims
                    .first()
                    .copied()
                    .filter(|b| *b > 0)
                    .unwrap_or_else(|| (region.len() as u64).div_ceil(n));

                let mut out = Vec::new();
                let mut cursor = region.start();
                let mut node = 0usize;
                while cursor < region.end() {
                    let end = region.end().min(cursor + block);
                    out.push(HomePartition {
                        region: MemoryRegion::new(cursor, end),
                        home_node: node,
                    });
                    cursor = end;
                    node = (node + 1) % self.cluster_size;
                }
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_equal_blocks_partition() {
        let dir = Directory::new(0, 2);
        let region = MemoryRegion::new(0x10000, 0x10000 + MIB);
        let parts = dir.register_allocation(region, DistributionPolicy::EqualBlocks, &[], 0);

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].home_node, 0);
        assert_eq!(parts[1].home_node, 1);
        assert_eq!(parts[0].region.len() as u64, MIB / 2);
        assert_eq!(parts[1].region.len() as u64, MIB / 2);
        assert_eq!(parts[0].region.end(), parts[1].region.start());
    }

    #[test]
    fn test_find_clips_to_query() {
        let dir = Directory::new(0, 4);
        let region = MemoryRegion::new(0x0, 4 * MIB);
        dir.register_allocation(region, DistributionPolicy::EqualBlocks, &[], 0);

        // A query straddling the node1/node2 boundary splits in two.
        let query = MemoryRegion::new(2 * MIB - 4096, 2 * MIB + 4096);
        let parts = dir.find(query);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].home_node, 1);
        assert_eq!(parts[1].home_node, 2);
        assert_eq!(parts[0].region.len(), 4096);
        assert_eq!(parts[1].region.len(), 4096);
    }

    #[test]
    fn test_unregistered_region_homes_here() {
        let dir = Directory::new(3, 4);
        let query = MemoryRegion::new(0x5000, 0x6000);
        let parts = dir.find(query);
        assert_eq!(parts, vec![HomePartition { region: query, home_node: 3 }]);
    }

    #[rstest]
    #[case(DistributionPolicy::Local)]
    #[case(DistributionPolicy::Cyclic)]
    fn test_partition_covers_region(#[case] policy: DistributionPolicy) {
        let dir = Directory::new(0, 3);
        let region = MemoryRegion::new(0x1000, 0x1000 + 10_000);
        let parts = dir.register_allocation(region, policy, &[4096], 0);

        let mut cursor = region.start();
        for part in &parts {
            assert_eq!(part.region.start(), cursor);
            assert!(part.home_node < 3);
            cursor = part.region.end();
        }
        assert_eq!(cursor, region.end());
    }

    #[test]
    fn test_cyclic_round_robin() {
        let dir = Directory::new(0, 2);
        let region = MemoryRegion::new(0, 4 * 4096);
        let parts = dir.register_allocation(region, DistributionPolicy::Cyclic, &[4096], 0);
        let homes: Vec<usize> = parts.iter().map(|p| p.home_node).collect();
        assert_eq!(homes, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_location_tracking() {
        let dir = Directory::new(0, 2);
        let region = MemoryRegion::new(0x1000, 0x2000);

        assert_eq!(dir.query_location(region), MemoryPlace::Directory);

        dir.update_location(region, MemoryPlace::host(1));
        assert_eq!(dir.query_location(region), MemoryPlace::host(1));

        // A sub-region resolves through the covering entry.
        let sub = MemoryRegion::new(0x1800, 0x1900);
        assert_eq!(dir.query_location(sub), MemoryPlace::host(1));

        dir.update_location(region, MemoryPlace::host(0));
        assert_eq!(dir.query_location(region), MemoryPlace::host(0));
    }

    #[test]
    fn test_duplicate_free_is_an_error() {
        let dir = Directory::new(0, 2);
        let region = MemoryRegion::new(0x1000, 0x2000);
        dir.register_allocation(region, DistributionPolicy::Local, &[], 0);

        assert!(dir.unregister_allocation(region).is_ok());
        assert!(dir.unregister_allocation(region).is_err());
    }
}
