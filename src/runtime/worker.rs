use crate::runtime::Runtime;
use crate::scheduler::WorkerQueues;
use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// How long a worker parks before re-checking the shutdown flag.
const IDLE_PARK_PATIENCE: Duration = Duration::from_millis(100);

thread_local! {
    static WORKER_QUEUES: RefCell<Option<WorkerQueues>> = const { RefCell::new(None) };
}

/// Spawn one bound, named worker thread per admitted CPU. Stealers are
/// registered before any thread starts so every worker sees the full
/// victim set.
pub(super) fn spawn_workers(rt: &Arc<Runtime>) -> Result<()> {
    let mut queue_sets = Vec::with_capacity(rt.cpus.total_cpus());
    for cpu in rt.cpus.cpus() {
        let queues = rt.scheduler.worker_queues(cpu.virtual_id);
        rt.scheduler.register_stealer(queues.stealer());
        queue_sets.push(queues);
    }

    for (cpu, queues) in rt.cpus.cpus().to_vec().into_iter().zip(queue_sets) {
        let rt_for_worker = Arc::clone(rt);
        let handle = std::thread::Builder::new()
            .name(format!("distrun-worker-{}", cpu.virtual_id))
            .spawn(move || worker_main(rt_for_worker, cpu.virtual_id, queues))
            .with_context(|| format!("spawning worker for CPU {}", cpu.virtual_id))?;
        rt.cpus.register_worker_thread(handle);
    }
    Ok(())
}

fn worker_main(rt: Arc<Runtime>, cpu: usize, queues: WorkerQueues) {
    if let Err(e) = rt.cpus.bind_current_thread(cpu) {
        tracing::warn!("worker {cpu} could not bind to its CPU: {e}");
    }
    crate::cpu::set_current_cpu(Some(cpu));
    crate::utils::set_current_thread_name(&format!("distrun-{cpu}"));
    WORKER_QUEUES.with(|q| *q.borrow_mut() = Some(queues));

    loop {
        if rt.shutdown_flag.load(Ordering::Acquire) {
            break;
        }

        let task = WORKER_QUEUES.with(|q| {
            let slot = q.borrow();
            let queues = slot.as_ref().expect("worker queues not installed");
            rt.scheduler.get_ready_task(queues, true, IDLE_PARK_PATIENCE)
        });

        if let Some(task) = task {
            rt.execute_task(task);
        }
    }

    WORKER_QUEUES.with(|q| *q.borrow_mut() = None);
    crate::cpu::set_current_cpu(None);
}

/// Pull and run a single task on the calling worker, if one is
/// immediately available. Used by taskwait to make progress while a task
/// is blocked. Returns whether anything ran.
pub(super) fn run_one_local_task(rt: &Arc<Runtime>) -> bool {
    let task = WORKER_QUEUES.with(|q| {
        let slot = q.borrow();
        let queues = slot.as_ref()?;
        rt.scheduler.get_ready_task(queues, false, Duration::ZERO)
    });

    match task {
        Some(task) => {
            rt.execute_task(task);
            true
        }
        None => false,
    }
}

/// Blocks the bootstrap thread until a root task's completion callback
/// fires. Cloned into the callback; waited on outside the worker pool.
#[derive(Debug, Clone)]
pub struct WaitHandle {
    inner: Arc<WaitInner>,
}

#[derive(Debug)]
struct WaitInner {
    done: Mutex<bool>,
    cv: Condvar,
}

impl WaitHandle {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(WaitInner {
                done: Mutex::new(false),
                cv: Condvar::new(),
            }),
        }
    }

    pub(crate) fn notify(&self) {
        let mut done = self.inner.done.lock();
        *done = true;
        self.inner.cv.notify_all();
    }

    /// Block until the callback fired.
    pub fn wait(&self) {
        let mut done = self.inner.done.lock();
        while !*done {
            self.inner.cv.wait(&mut done);
        }
    }

    /// Bounded wait; returns whether the callback fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut done = self.inner.done.lock();
        if !*done {
            self.inner.cv.wait_for(&mut done, timeout);
        }
        *done
    }

    pub fn is_done(&self) -> bool {
        *self.inner.done.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_handle_notify_unblocks() {
        let handle = WaitHandle::new();
        assert!(!handle.is_done());
        assert!(!handle.wait_timeout(Duration::from_millis(1)));

        let notifier = handle.clone();
        let t = std::thread::spawn(move || notifier.notify());
        handle.wait();
        assert!(handle.is_done());
        t.join().unwrap();
    }
}
