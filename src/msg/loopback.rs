use crate::config::ClusterConfig;
use crate::msg::{Envelope, Messenger};
use anyhow::{Result, anyhow};
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

/// In-process cluster shared by every loopback node. Each (source,
/// destination) pair gets its own FIFO queue, which is exactly the
/// per-pair ordering guarantee the messenger contract asks for.
///
/// This is the transport used to run multi-node scenarios inside one
/// process; a network transport registers its own backend instead.
#[derive(Debug)]
pub struct LoopbackCluster {
    size: usize,
    /// Indexed `dest * size + source`.
    queues: Vec<SegQueue<Vec<u8>>>,
    barrier: Barrier,
    claimed: Vec<AtomicBool>,
    /// Wire buffers cycle through here instead of the allocator; the
    /// external layer of the pool serves callers off the worker pool.
    buffers: crate::memory::ObjectPool<Vec<u8>>,
}

impl LoopbackCluster {
    pub fn new(size: usize) -> Arc<Self> {
        assert!(size > 0, "loopback cluster cannot be empty");
        Arc::new(Self {
            size,
            queues: (0..size * size).map(|_| SegQueue::new()).collect(),
            barrier: Barrier::new(size),
            claimed: (0..size).map(|_| AtomicBool::new(false)).collect(),
            buffers: crate::memory::ObjectPool::new(Vec::new(), 1),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Claim a node slot: a specific one when requested, otherwise the
    /// first free one in joining order.
    fn join(self: &Arc<Self>, index: Option<usize>) -> Result<LoopbackMessenger> {
        let index = match index {
            Some(wanted) => {
                let slot = self
                    .claimed
                    .get(wanted)
                    .ok_or_else(|| anyhow!("node index {wanted} out of range"))?;
                if slot.swap(true, Ordering::AcqRel) {
                    return Err(anyhow!("node index {wanted} already claimed"));
                }
                wanted
            }
            None => self
                .claimed
                .iter()
                .position(|slot| !slot.swap(true, Ordering::AcqRel))
                .ok_or_else(|| {
                    anyhow!("loopback cluster of size {} is already full", self.size)
                })?,
        };
        Ok(LoopbackMessenger {
            cluster: Arc::clone(self),
            index,
            receive_cursor: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    fn queue(&self, source: usize, dest: usize) -> &SegQueue<Vec<u8>> {
        &self.queues[dest * self.size + source]
    }
}

/// One node's endpoint into a [`LoopbackCluster`]. Node indices are
/// assigned in join order; node 0 is the master.
#[derive(Debug)]
pub struct LoopbackMessenger {
    cluster: Arc<LoopbackCluster>,
    index: usize,
    /// Round-robin start position over source queues, so one chatty peer
    /// cannot starve the others.
    receive_cursor: AtomicUsize,
    closed: AtomicBool,
}

pub(crate) fn factory(cfg: &ClusterConfig) -> Result<Arc<dyn Messenger>> {
    let cluster = cfg
        .loopback
        .as_ref()
        .ok_or_else(|| anyhow!("loopback backend selected without a cluster handle"))?;
    Ok(Arc::new(cluster.join(cfg.loopback_index)?))
}

impl Messenger for LoopbackMessenger {
    fn cluster_size(&self) -> usize {
        self.cluster.size
    }

    fn node_index(&self) -> usize {
        self.index
    }

    fn master_index(&self) -> usize {
        0
    }

    fn send(&self, env: &Envelope, dest: usize, _blocking: bool) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(anyhow!("send on a shut-down messenger"));
        }
        if dest >= self.cluster.size {
            return Err(anyhow!("destination node {dest} out of range"));
        }
        debug_assert_ne!(dest, self.index, "self-sends never leave a node");

        let mut buf = self
            .cluster
            .buffers
            .acquire_with(crate::cpu::current_cpu(), || Vec::with_capacity(64));
        buf.clear();
        env.encode(&mut buf);
        // Enqueueing is acceptance: the peer's inbox owns the bytes from
        // here, so blocking and non-blocking sends coincide.
        self.cluster.queue(self.index, dest).push(buf);
        Ok(())
    }

    fn receive(&self) -> Option<Envelope> {
        let n = self.cluster.size;
        let start = self.receive_cursor.fetch_add(1, Ordering::Relaxed) % n;

        for off in 0..n {
            let source = (start + off) % n;
            if source == self.index {
                continue;
            }
            if let Some(bytes) = self.cluster.queue(source, self.index).pop() {
                let decoded = Envelope::decode(source, &bytes);
                self.cluster
                    .buffers
                    .release(crate::cpu::current_cpu(), bytes);
                match decoded {
                    Ok(env) => return Some(env),
                    Err(e) => panic!("protocol violation from node {source}: {e}"),
                }
            }
        }
        None
    }

    fn synchronize_all(&self) {
        self.cluster.barrier.wait();
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::MessageId;
    use crate::memory::MemoryRegion;
    use crate::msg::{DfreeMsg, Message};
    use static_assertions::assert_impl_all;

    assert_impl_all!(LoopbackMessenger: Send, Sync);

    fn dummy(id: u64) -> Envelope {
        Envelope::new(
            MessageId(id),
            0,
            Message::Dfree(DfreeMsg {
                region: MemoryRegion::new(id * 64, (id + 1) * 64),
            }),
        )
    }

    #[test]
    fn test_send_receive_preserves_order() -> anyhow::Result<()> {
        let cluster = LoopbackCluster::new(2);
        let node0 = cluster.join(None)?;
        let node1 = cluster.join(None)?;

        for i in 1..=5 {
            node0.send(&dummy(i), 1, false)?;
        }

        let mut seen = Vec::new();
        while let Some(env) = node1.receive() {
            assert_eq!(env.source, 0);
            seen.push(env.id.0);
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert!(node1.receive().is_none());
        Ok(())
    }

    #[test]
    fn test_join_past_capacity_fails() -> anyhow::Result<()> {
        let cluster = LoopbackCluster::new(1);
        let _node0 = cluster.join(None)?;
        assert!(cluster.join(None).is_err());
        Ok(())
    }

    #[test]
    fn test_send_after_shutdown_fails() -> anyhow::Result<()> {
        let cluster = LoopbackCluster::new(2);
        let node0 = cluster.join(None)?;
        let _node1 = cluster.join(None)?;

        node0.shutdown();
        assert!(node0.send(&dummy(1), 1, false).is_err());
        Ok(())
    }
}
