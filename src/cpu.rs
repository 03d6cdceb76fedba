use crate::config::ClusterConfig;
use crate::report::RuntimeInfo;
use crate::task::Task;
use anyhow::{Context, Result};
use nix::sched::CpuSet;
use nix::unistd::Pid;
use parking_lot::{Condvar, Mutex};
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// One admitted CPU: its kernel id, its dense virtual id and the NUMA
/// node it is assigned to.
#[derive(Debug, Clone, Copy)]
pub struct CpuInfo {
    pub system_id: usize,
    pub virtual_id: usize,
    pub numa_node: usize,
}

/// An executable resource the scheduler can hand tasks to. Accelerator
/// queues would slot in as further variants; the core only ever sees the
/// enqueue/query surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ComputePlace {
    Cpu(usize),
}

impl ComputePlace {
    pub fn cpu(&self) -> usize {
        match self {
            ComputePlace::Cpu(id) => *id,
        }
    }
}

#[derive(Debug, Default)]
struct ParkSlot {
    wake_pending: Mutex<bool>,
    cv: Condvar,
}

/// Tracks the admitted CPUs, the idle bitset and the parked worker
/// threads.
///
/// `preinitialize` reads the process affinity mask and assigns dense
/// virtual ids; `initialize` (driven by the runtime) spawns one bound
/// worker per CPU. The idle bitset has its own lock and nothing else is
/// ever taken under it.
#[derive(Debug)]
pub struct CpuManager {
    cpus: Vec<CpuInfo>,
    idle: Mutex<Vec<bool>>,
    parks: Vec<ParkSlot>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl CpuManager {
    /// Scan the process affinity mask and build the virtual CPU table.
    /// Failure to query affinity is a fatal initialization error.
    pub fn preinitialize(cfg: &ClusterConfig, info: &RuntimeInfo) -> Result<Self> {
        let mask = nix::sched::sched_getaffinity(Pid::from_raw(0))
            .context("retrieving the affinity of the process")?;

        let mut cpus = Vec::new();
        for system_id in 0..CpuSet::count() {
            if !mask.is_set(system_id).unwrap_or(false) {
                continue;
            }
            let virtual_id = cpus.len();
            cpus.push(CpuInfo {
                system_id,
                virtual_id,
                numa_node: virtual_id % cfg.numa_nodes,
            });
            if let Some(max) = cfg.max_workers {
                if cpus.len() == max {
                    break;
                }
            }
        }
        anyhow::ensure!(!cpus.is_empty(), "process affinity mask admits no CPU");

        info.add_string(
            "initial_cpu_list",
            region_list(cpus.iter().map(|c| c.system_id)),
            "Initial CPU List",
        );
        for numa in 0..cfg.numa_nodes {
            info.add_string(
                format!("numa_node_{numa}_cpu_list"),
                region_list(
                    cpus.iter()
                        .filter(|c| c.numa_node == numa)
                        .map(|c| c.system_id),
                ),
                format!("NUMA Node {numa} CPU List"),
            );
        }

        let parks = (0..cpus.len()).map(|_| ParkSlot::default()).collect();
        let idle = Mutex::new(vec![false; cpus.len()]);

        Ok(Self {
            cpus,
            idle,
            parks,
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn total_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpu(&self, virtual_id: usize) -> &CpuInfo {
        &self.cpus[virtual_id]
    }

    pub fn cpus(&self) -> &[CpuInfo] {
        &self.cpus
    }

    pub fn numa_node_of(&self, virtual_id: usize) -> usize {
        self.cpus[virtual_id].numa_node
    }

    pub(crate) fn register_worker_thread(&self, handle: JoinHandle<()>) {
        self.threads.lock().push(handle);
    }

    /// Pin the calling thread to its CPU. Runs first thing on every
    /// worker.
    pub(crate) fn bind_current_thread(&self, virtual_id: usize) -> Result<()> {
        let mut set = CpuSet::new();
        set.set(self.cpus[virtual_id].system_id)?;
        nix::sched::sched_setaffinity(Pid::from_raw(0), &set)
            .with_context(|| format!("binding worker to CPU {virtual_id}"))?;
        Ok(())
    }

    // --- idle/wake coordination ---

    /// Park the calling worker until woken or `patience` elapses. The CPU
    /// is marked idle for the duration.
    pub(crate) fn park(&self, virtual_id: usize, patience: Duration) {
        {
            let mut idle = self.idle.lock();
            idle[virtual_id] = true;
        }

        let slot = &self.parks[virtual_id];
        let mut pending = slot.wake_pending.lock();
        if !*pending {
            slot.cv.wait_for(&mut pending, patience);
        }
        *pending = false;
        drop(pending);

        let mut idle = self.idle.lock();
        idle[virtual_id] = false;
    }

    /// Wake one idle CPU: clear its bit and signal it. Returns the woken
    /// CPU, if any was idle.
    pub(crate) fn wake_one(&self) -> Option<usize> {
        let victim = {
            let mut idle = self.idle.lock();
            let victim = idle.iter().position(|b| *b)?;
            idle[victim] = false;
            victim
        };
        self.wake(victim);
        Some(victim)
    }

    /// Wake a specific CPU regardless of its idle bit.
    pub(crate) fn wake(&self, virtual_id: usize) {
        let slot = &self.parks[virtual_id];
        let mut pending = slot.wake_pending.lock();
        *pending = true;
        slot.cv.notify_one();
    }

    pub(crate) fn wake_all(&self) {
        for id in 0..self.cpus.len() {
            self.wake(id);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().iter().filter(|b| **b).count()
    }

    /// Join every worker thread. Callers set the runtime shutdown flag
    /// and wake everyone first.
    pub(crate) fn join_workers(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                tracing::warn!("worker thread panicked during shutdown");
            }
        }
    }
}

/// Render CPU ids as the compact "0-3,7-8" region-list form used in the
/// runtime report.
fn region_list(ids: impl IntoIterator<Item = usize>) -> String {
    let mut ids: Vec<usize> = ids.into_iter().collect();
    ids.sort_unstable();

    let mut out = String::new();
    let mut i = 0;
    while i < ids.len() {
        let start = ids[i];
        let mut end = start;
        while i + 1 < ids.len() && ids[i + 1] == end + 1 {
            i += 1;
            end = ids[i];
        }
        if !out.is_empty() {
            out.push(',');
        }
        if start == end {
            out.push_str(&start.to_string());
        } else {
            out.push_str(&format!("{start}-{end}"));
        }
        i += 1;
    }
    out
}

// --- per-worker thread context ---

thread_local! {
    static CURRENT_CPU: Cell<Option<usize>> = const { Cell::new(None) };
    static TASK_STACK: RefCell<Vec<Arc<Task>>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn set_current_cpu(virtual_id: Option<usize>) {
    CURRENT_CPU.with(|c| c.set(virtual_id));
}

/// The virtual CPU the calling thread is bound to; None off the worker
/// pool.
pub fn current_cpu() -> Option<usize> {
    CURRENT_CPU.with(|c| c.get())
}

/// The task the calling worker is currently executing, if any. Nested
/// execution during taskwait stacks.
pub fn current_task() -> Option<Arc<Task>> {
    TASK_STACK.with(|s| s.borrow().last().cloned())
}

pub(crate) fn with_task_frame<R>(task: &Arc<Task>, f: impl FnOnce() -> R) -> R {
    TASK_STACK.with(|s| s.borrow_mut().push(Arc::clone(task)));
    struct PopGuard;
    impl Drop for PopGuard {
        fn drop(&mut self) {
            TASK_STACK.with(|s| {
                s.borrow_mut().pop();
            });
        }
    }
    let _guard = PopGuard;
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskBuilder;
    use rstest::rstest;

    #[rstest]
    #[case(vec![], "")]
    #[case(vec![0], "0")]
    #[case(vec![0, 1, 2, 3], "0-3")]
    #[case(vec![0, 1, 2, 3, 7], "0-3,7")]
    #[case(vec![5, 0, 1, 7, 8], "0-1,5,7-8")]
    fn test_region_list(#[case] ids: Vec<usize>, #[case] expected: &str) {
        assert_eq!(region_list(ids), expected);
    }

    #[test]
    fn test_preinitialize_assigns_dense_ids() {
        let cfg = ClusterConfig::default().numa_nodes(2);
        let info = RuntimeInfo::new();
        let cpus = CpuManager::preinitialize(&cfg, &info).unwrap();

        assert!(cpus.total_cpus() > 0);
        for (i, cpu) in cpus.cpus().iter().enumerate() {
            assert_eq!(cpu.virtual_id, i);
            assert!(cpu.numa_node < 2);
        }
    }

    #[test]
    fn test_max_workers_caps_admission() {
        let cfg = ClusterConfig::default().max_workers(1);
        let info = RuntimeInfo::new();
        let cpus = CpuManager::preinitialize(&cfg, &info).unwrap();
        assert_eq!(cpus.total_cpus(), 1);
    }

    #[test]
    fn test_park_wake_round_trip() {
        let cfg = ClusterConfig::default().max_workers(1);
        let info = RuntimeInfo::new();
        let cpus = CpuManager::preinitialize(&cfg, &info).unwrap();

        // A pre-posted wake means park returns without waiting out the
        // full patience.
        cpus.wake(0);
        let start = std::time::Instant::now();
        cpus.park(0, Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(cpus.idle_count(), 0);
    }

    #[test]
    fn test_wake_one_prefers_idle_cpu() {
        let cfg = ClusterConfig::default();
        let info = RuntimeInfo::new();
        let cpus = CpuManager::preinitialize(&cfg, &info).unwrap();

        // Nothing idle yet.
        assert_eq!(cpus.wake_one(), None);
    }

    #[test]
    fn test_task_frame_stacks() {
        let a = TaskBuilder::new(|_| {}).build();
        let b = TaskBuilder::new(|_| {}).build();

        assert!(current_task().is_none());
        with_task_frame(&a, || {
            assert_eq!(current_task().unwrap().id(), a.id());
            with_task_frame(&b, || {
                assert_eq!(current_task().unwrap().id(), b.id());
            });
            assert_eq!(current_task().unwrap().id(), a.id());
        });
        assert!(current_task().is_none());
    }
}
