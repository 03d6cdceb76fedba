pub mod locality;

pub use locality::{SchedulingDecision, decide, node_scores};

use crate::cpu::{ComputePlace, CpuManager};
use crate::task::Task;
use crossbeam_deque::{Injector, Stealer, Worker as CbWorker};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// How many passes over the injector and the other workers' queues before
/// a worker gives up and considers idling.
const MAX_STEAL_RETRIES: usize = 4;

/// Scheduling hint attached by the caller of `add_ready_task`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadyTaskHint {
    #[default]
    NoHint,
    /// Freshly created child of the running task.
    Child,
    /// Became ready through dependency release.
    Unblocked,
}

/// A CPU's advertisement that it wants its next task handed to it
/// directly, without going through the queues or fully idling.
#[derive(Debug, Default)]
struct PollingSlot {
    requested: AtomicBool,
    task: Mutex<Option<Arc<Task>>>,
}

/// Local-dispatch scheduler: per-CPU deques consulted first, then the
/// global injector, then stealing. The locality policy deciding *which
/// node* runs a task lives in [`locality`]; by the time a task reaches
/// these queues it has been decided to run here.
#[derive(Debug)]
pub struct Scheduler {
    injector: Injector<Arc<Task>>,
    stealers: RwLock<Vec<Stealer<Arc<Task>>>>,
    slots: Vec<PollingSlot>,
    cpus: Arc<CpuManager>,
}

/// The queues a worker thread owns: its local deque plus its private,
/// shuffled view of everyone else's stealers. Shuffling gives each worker
/// a different steal order, which keeps them from contending on the same
/// victim.
pub struct WorkerQueues {
    pub(crate) cpu: usize,
    local: CbWorker<Arc<Task>>,
    stealers: Vec<Stealer<Arc<Task>>>,
}

impl WorkerQueues {
    /// Stealer handle onto this worker's local deque, for registration
    /// with the scheduler before the worker starts.
    pub fn stealer(&self) -> Stealer<Arc<Task>> {
        self.local.stealer()
    }
}

impl Scheduler {
    pub fn new(cpus: Arc<CpuManager>) -> Self {
        let slots = (0..cpus.total_cpus()).map(|_| PollingSlot::default()).collect();
        Self {
            injector: Injector::new(),
            stealers: RwLock::new(Vec::new()),
            slots,
            cpus,
        }
    }

    /// Create the queue set for one worker; called on the worker thread
    /// at startup, after every stealer has been registered.
    pub fn worker_queues(&self, cpu: usize) -> WorkerQueues {
        let local = CbWorker::new_fifo();
        let mut stealers = self.stealers.read().clone();
        fastrand::shuffle(&mut stealers);
        WorkerQueues {
            cpu,
            local,
            stealers,
        }
    }

    pub fn register_stealer(&self, stealer: Stealer<Arc<Task>>) {
        self.stealers.write().push(stealer);
    }

    /// A task decided to run on this node is ready: queue it. If an
    /// origin CPU holds a polling slot, hand the task straight to it and
    /// return that compute place so the caller can resume there
    /// immediately.
    pub fn add_ready_task(
        &self,
        task: Arc<Task>,
        origin: Option<ComputePlace>,
        _hint: ReadyTaskHint,
    ) -> Option<ComputePlace> {
        // Polling slots first: a slot owner is spinning for exactly this
        // hand-off and skipping the queues avoids waking anyone.
        let preferred = origin.map(|p| p.cpu());
        for offset in 0..self.slots.len() {
            let cpu = match preferred {
                Some(p) => (p + offset) % self.slots.len(),
                None => offset,
            };
            let slot = &self.slots[cpu];
            if !slot.requested.load(Ordering::Acquire) {
                continue;
            }
            let mut held = slot.task.lock();
            if held.is_none() && slot.requested.swap(false, Ordering::AcqRel) {
                *held = Some(task);
                drop(held);
                self.cpus.wake(cpu);
                return Some(ComputePlace::Cpu(cpu));
            }
        }

        self.injector.push(task);
        self.cpus.wake_one();
        None
    }

    /// A worker pulls its next task. With `can_idle` the worker parks
    /// (bounded) when nothing is runnable and returns None; the caller
    /// loops.
    pub fn get_ready_task(
        &self,
        queues: &WorkerQueues,
        can_idle: bool,
        patience: std::time::Duration,
    ) -> Option<Arc<Task>> {
        if let Some(task) = self.take_polling_slot(queues.cpu) {
            return Some(task);
        }

        // Local queue first: hot cache, no contention. Then the global
        // injector, then stealing from siblings.
        let found = queues.local.pop().or_else(|| {
            std::iter::repeat_with(|| {
                self.injector
                    .steal_batch_and_pop(&queues.local)
                    .or_else(|| queues.stealers.iter().map(|s| s.steal()).collect())
            })
            .take(MAX_STEAL_RETRIES)
            .find(|s| !s.is_retry())
            .and_then(|s| s.success())
        });

        if found.is_some() {
            return found;
        }
        if can_idle {
            self.cpus.park(queues.cpu, patience);
        }
        None
    }

    /// Register interest in a direct hand-off for this CPU.
    pub fn request_polling(&self, cpu: usize) {
        self.slots[cpu].requested.store(true, Ordering::Release);
    }

    /// Withdraw the polling request; a task already deposited goes back
    /// to the global queue rather than being lost.
    pub fn release_polling(&self, cpu: usize) {
        let slot = &self.slots[cpu];
        slot.requested.store(false, Ordering::Release);
        if let Some(task) = slot.task.lock().take() {
            self.injector.push(task);
            self.cpus.wake_one();
        }
    }

    fn take_polling_slot(&self, cpu: usize) -> Option<Arc<Task>> {
        self.slots[cpu].task.lock().take()
    }

    /// Anything queued anywhere? Used by the shutdown drain.
    pub fn has_pending_work(&self) -> bool {
        !self.injector.is_empty()
            || self
                .slots
                .iter()
                .any(|s| s.task.lock().is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::report::RuntimeInfo;
    use crate::task::TaskBuilder;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Scheduler: Send, Sync);

    fn scheduler() -> Scheduler {
        let cfg = ClusterConfig::default();
        let info = RuntimeInfo::new();
        let cpus = Arc::new(CpuManager::preinitialize(&cfg, &info).unwrap());
        Scheduler::new(cpus)
    }

    #[test]
    fn test_injector_dispatch() {
        let sched = scheduler();
        let queues = sched.worker_queues(0);

        let task = TaskBuilder::new(|_| {}).build();
        let id = task.id();
        assert!(sched
            .add_ready_task(task, None, ReadyTaskHint::NoHint)
            .is_none());

        let got = sched
            .get_ready_task(&queues, false, std::time::Duration::ZERO)
            .expect("task queued");
        assert_eq!(got.id(), id);
    }

    #[test]
    fn test_polling_slot_hand_off() {
        let sched = scheduler();
        let queues = sched.worker_queues(0);

        sched.request_polling(0);
        let task = TaskBuilder::new(|_| {}).build();
        let id = task.id();

        let place = sched.add_ready_task(task, Some(ComputePlace::Cpu(0)), ReadyTaskHint::Child);
        assert_eq!(place, Some(ComputePlace::Cpu(0)));

        // The hand-off bypassed the queues.
        let got = sched
            .get_ready_task(&queues, false, std::time::Duration::ZERO)
            .expect("slot filled");
        assert_eq!(got.id(), id);

        // The slot request was consumed.
        let other = TaskBuilder::new(|_| {}).build();
        assert!(sched
            .add_ready_task(other, None, ReadyTaskHint::NoHint)
            .is_none());
    }

    #[test]
    fn test_release_polling_requeues_deposited_task() {
        let sched = scheduler();
        let queues = sched.worker_queues(0);

        sched.request_polling(0);
        let task = TaskBuilder::new(|_| {}).build();
        let id = task.id();
        sched.add_ready_task(task, None, ReadyTaskHint::NoHint);

        sched.release_polling(0);
        // The deposited task is back in the global queue, not lost.
        let got = sched
            .get_ready_task(&queues, false, std::time::Duration::ZERO)
            .expect("requeued");
        assert_eq!(got.id(), id);
    }

    #[test]
    fn test_stealing_between_workers() {
        let sched = scheduler();
        let q0 = sched.worker_queues(0);
        sched.register_stealer(q0.local.stealer());
        // Simulate another worker: it sees q0's stealer.
        let q1 = sched.worker_queues(1 % sched.slots.len().max(1));

        let task = TaskBuilder::new(|_| {}).build();
        let id = task.id();
        q0.local.push(task);

        let got = sched
            .get_ready_task(&q1, false, std::time::Duration::ZERO)
            .expect("stolen");
        assert_eq!(got.id(), id);
    }
}
