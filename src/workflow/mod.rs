mod steps;

pub(crate) use steps::{
    DataCopyStep, DataLinkStep, DataReleaseStep, ExecutionStep, NotificationStep,
};
pub(crate) use steps::{
    build_local_fetches, link_region, offload_task, send_delayed_releases,
};

use parking_lot::Mutex;
use slab::Slab;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Stable handle to a workflow step slot in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StepId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StepState {
    Pending = 0,
    Started = 1,
    Done = 2,
}

/// One node of a task's execution workflow DAG.
///
/// The predecessor counter is atomic and is the ordering primitive: a
/// step may start only when it reaches zero. The payload sits behind the
/// per-step lock. Completion is a CAS to `Done` — whichever path wins the
/// CAS frees the slot, which is what makes "both `start` and
/// `link_region` may be the last holder" safe.
#[derive(Debug)]
pub(crate) struct Step {
    preds: AtomicUsize,
    state: AtomicU8,
    successors: Mutex<SmallVec<[StepId; 2]>>,
    pub(crate) payload: Mutex<StepPayload>,
}

#[derive(Debug)]
pub(crate) enum StepPayload {
    DataCopy(DataCopyStep),
    DataLink(DataLinkStep),
    Execution(ExecutionStep),
    Notification(NotificationStep),
    DataRelease(DataReleaseStep),
}

impl Step {
    pub(crate) fn state(&self) -> StepState {
        match self.state.load(Ordering::Acquire) {
            0 => StepState::Pending,
            1 => StepState::Started,
            _ => StepState::Done,
        }
    }
}

/// Arena owning every live workflow step. Steps are referenced by stable
/// ids; freeing returns the slot and outstanding `Arc`s (e.g. captured by
/// transfer callbacks) just expire.
#[derive(Debug, Default)]
pub struct StepArena {
    slab: Mutex<Slab<Arc<Step>>>,
}

impl StepArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a step with `preds` unsatisfied predecessors. The payload
    /// constructor receives the step's id so it can be self-referential.
    pub(crate) fn insert_with(
        &self,
        preds: usize,
        make: impl FnOnce(StepId) -> StepPayload,
    ) -> StepId {
        let mut slab = self.slab.lock();
        let entry = slab.vacant_entry();
        let id = StepId(entry.key());
        entry.insert(Arc::new(Step {
            preds: AtomicUsize::new(preds),
            state: AtomicU8::new(StepState::Pending as u8),
            successors: Mutex::new(SmallVec::new()),
            payload: Mutex::new(make(id)),
        }));
        id
    }

    pub(crate) fn get(&self, id: StepId) -> Option<Arc<Step>> {
        self.slab.lock().get(id.0).cloned()
    }

    pub(crate) fn add_successor(&self, pred: StepId, succ: StepId) {
        if let Some(step) = self.get(pred) {
            step.successors.lock().push(succ);
        }
    }

    /// One predecessor of `id` completed; start the step when the
    /// counter hits zero.
    pub(crate) fn release(&self, rt: &Arc<crate::runtime::Runtime>, id: StepId) {
        let Some(step) = self.get(id) else {
            return;
        };
        debug_assert_ne!(step.state(), StepState::Done);
        if step.preds.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.start(rt, id);
        }
    }

    /// Start a pending step (predecessors must be gone).
    pub(crate) fn start(&self, rt: &Arc<crate::runtime::Runtime>, id: StepId) {
        let Some(step) = self.get(id) else {
            return;
        };
        debug_assert_eq!(step.preds.load(Ordering::Acquire), 0);
        if step
            .state
            .compare_exchange(
                StepState::Pending as u8,
                StepState::Started as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        steps::dispatch_start(rt, &step, id);
    }

    /// Move the step to `Done` and free its slot, exactly once; then
    /// release its successors. Returns whether this call won the CAS.
    pub(crate) fn complete(&self, rt: &Arc<crate::runtime::Runtime>, id: StepId) -> bool {
        let Some(step) = self.get(id) else {
            return false;
        };
        let prev = step.state.swap(StepState::Done as u8, Ordering::AcqRel);
        if prev == StepState::Done as u8 {
            return false;
        }

        let successors = std::mem::take(&mut *step.successors.lock());
        self.slab.lock().remove(id.0);
        for succ in successors {
            self.release(rt, succ);
        }
        true
    }

    /// Live step count; the shutdown drain checks this reaches zero.
    pub fn len(&self) -> usize {
        self.slab.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::ids::OffloadedTaskId;
    use crate::runtime::Runtime;
    use crate::task::TaskBuilder;

    fn runtime() -> Arc<Runtime> {
        let cfg = ClusterConfig::default()
            .arena_sizes(1024 * 1024, 256 * 1024)
            .max_workers(1);
        Runtime::preinit(cfg).unwrap()
    }

    /// A step whose start is a no-op, so the arena mechanics can be
    /// exercised in isolation.
    fn inert_payload() -> StepPayload {
        StepPayload::Notification(NotificationStep {
            task: TaskBuilder::new(|_| {}).build(),
            offloaded_id: OffloadedTaskId(1),
        })
    }

    #[test]
    fn test_predecessor_countdown_gates_start() {
        let rt = runtime();
        let id = rt.steps.insert_with(2, |_| inert_payload());

        rt.steps.release(&rt, id);
        assert_eq!(rt.steps.get(id).unwrap().state(), StepState::Pending);

        rt.steps.release(&rt, id);
        assert_eq!(rt.steps.get(id).unwrap().state(), StepState::Started);
    }

    #[test]
    fn test_complete_frees_slot_exactly_once() {
        let rt = runtime();
        let id = rt.steps.insert_with(0, |_| inert_payload());
        assert_eq!(rt.steps.len(), 1);

        // Whichever path wins the CAS owns the slot release; the loser
        // must see false.
        assert!(rt.steps.complete(&rt, id));
        assert!(!rt.steps.complete(&rt, id));
        assert!(rt.steps.get(id).is_none());
        assert!(rt.steps.is_empty());
    }

    #[test]
    fn test_completion_releases_successors() {
        let rt = runtime();
        let first = rt.steps.insert_with(0, |_| inert_payload());
        let second = rt.steps.insert_with(1, |_| inert_payload());
        rt.steps.add_successor(first, second);

        rt.steps.start(&rt, first);
        assert_eq!(rt.steps.get(second).unwrap().state(), StepState::Pending);

        rt.steps.complete(&rt, first);
        assert_eq!(rt.steps.get(second).unwrap().state(), StepState::Started);
    }
}
