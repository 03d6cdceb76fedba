pub mod registry;

pub use registry::{TaskFn, TaskFnRegistry};

use crate::deps::{AccessMode, DataAccess};
use crate::ids::OffloadedTaskId;
use crate::memory::MemoryRegion;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

/// An opaque id that uniquely identifies a task on this node. Ids are
/// monotonic but carry no ordering meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(NonZeroU64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };
        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique task id: bitspace exhausted")
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Task lifecycle. `Released` is terminal and only entered once every
/// access has been completed locally and, for tasks executed on behalf of
/// a peer, reported back to the offloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Created = 0,
    Ready = 1,
    Executing = 2,
    Blocked = 3,
    Finished = 4,
    Released = 5,
}

impl TaskState {
    fn from_u8(raw: u8) -> TaskState {
        match raw {
            0 => TaskState::Created,
            1 => TaskState::Ready,
            2 => TaskState::Executing,
            3 => TaskState::Blocked,
            4 => TaskState::Finished,
            5 => TaskState::Released,
            _ => unreachable!("invalid task state {raw}"),
        }
    }
}

/// When the task's accesses release relative to its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DelayedRelease {
    /// Release each access as soon as the task body finishes.
    NoWait = 0,
    /// Delay only non-local accesses until the children released.
    AutoWait = 1,
    /// Delay every access until the children released.
    Wait = 2,
}

/// What actually runs. Closures execute locally only; bodies that should
/// be offloadable register a plain function and travel as (id, args).
pub enum TaskBody {
    Closure(Box<dyn FnOnce(&Task) + Send>),
    Registered { task_fn: u64, args: Vec<u8> },
}

impl fmt::Debug for TaskBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskBody::Closure(_) => f.write_str("Closure"),
            TaskBody::Registered { task_fn, args } => f
                .debug_struct("Registered")
                .field("task_fn", task_fn)
                .field("args_len", &args.len())
                .finish(),
        }
    }
}

/// Offloader-side bookkeeping attached when the scheduler decides to run
/// the task on a peer.
#[derive(Debug, Clone)]
pub struct ClusterContext {
    pub remote_node: usize,
    pub offloaded_id: OffloadedTaskId,
    /// Most recent task this node offloaded to the same peer; lets the
    /// remote namespace chain siblings without a round trip.
    pub predecessor_hint: u64,
}

/// Identity of the offloader, for tasks this node executes on behalf of a
/// peer.
#[derive(Debug, Clone, Copy)]
pub struct RemoteOrigin {
    pub offloader_node: usize,
    pub offloaded_id: OffloadedTaskId,
}

#[derive(Debug, Default)]
struct WaitState {
    live_children: Mutex<usize>,
    cv: Condvar,
}

/// One schedulable unit: a body, its declared accesses and the
/// bookkeeping that moves it through the lifecycle.
pub struct Task {
    id: TaskId,
    name: Option<String>,
    body: Mutex<Option<TaskBody>>,
    accesses: Vec<Arc<DataAccess>>,
    state: AtomicU8,
    release_mode: AtomicU8,
    parent: Option<Arc<Task>>,
    wait: WaitState,
    cluster: Mutex<Option<ClusterContext>>,
    remote_origin: Mutex<Option<RemoteOrigin>>,
    completion: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    /// Access indices whose release is deferred to the delayed-release
    /// path (autowait / wait).
    delayed: Mutex<Vec<usize>>,
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn accesses(&self) -> &[Arc<DataAccess>] {
        &self.accesses
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Created → Ready, once all non-weak accesses carry the
    /// satisfiability their mode needs. Returns true exactly once.
    pub fn try_mark_ready(&self) -> bool {
        if self.state() != TaskState::Created {
            return false;
        }
        if !self.accesses.iter().all(|a| a.satisfied_for_mode()) {
            return false;
        }
        self.transition(TaskState::Created, TaskState::Ready)
    }

    pub fn release_mode(&self) -> DelayedRelease {
        match self.release_mode.load(Ordering::Acquire) {
            0 => DelayedRelease::NoWait,
            1 => DelayedRelease::AutoWait,
            2 => DelayedRelease::Wait,
            raw => unreachable!("invalid release mode {raw}"),
        }
    }

    pub fn set_release_mode(&self, mode: DelayedRelease) {
        self.release_mode.store(mode as u8, Ordering::Release);
    }

    pub(crate) fn take_body(&self) -> Option<TaskBody> {
        self.body.lock().take()
    }

    /// Can this task's body travel over the wire?
    pub fn is_wire_capable(&self) -> bool {
        matches!(
            self.body.lock().as_ref(),
            Some(TaskBody::Registered { .. })
        )
    }

    pub fn parent(&self) -> Option<&Arc<Task>> {
        self.parent.as_ref()
    }

    pub fn cluster_context(&self) -> Option<ClusterContext> {
        self.cluster.lock().clone()
    }

    pub(crate) fn set_cluster_context(&self, ctx: ClusterContext) {
        let mut cluster = self.cluster.lock();
        debug_assert!(cluster.is_none(), "task offloaded twice");
        *cluster = Some(ctx);
    }

    pub fn remote_origin(&self) -> Option<RemoteOrigin> {
        *self.remote_origin.lock()
    }

    pub(crate) fn set_remote_origin(&self, origin: RemoteOrigin) {
        *self.remote_origin.lock() = Some(origin);
    }

    pub(crate) fn take_completion(&self) -> Option<Box<dyn FnOnce() + Send>> {
        self.completion.lock().take()
    }

    pub(crate) fn push_delayed(&self, access_index: usize) {
        self.delayed.lock().push(access_index);
    }

    pub(crate) fn take_delayed(&self) -> Vec<usize> {
        std::mem::take(&mut *self.delayed.lock())
    }

    pub(crate) fn delayed_is_empty(&self) -> bool {
        self.delayed.lock().is_empty()
    }

    // --- child accounting, for taskwait and delayed release ---

    fn child_created(&self) {
        *self.wait.live_children.lock() += 1;
    }

    /// A child fully released. Returns true when this was the last one.
    pub(crate) fn child_released(&self) -> bool {
        let mut live = self.wait.live_children.lock();
        debug_assert!(*live > 0, "child released twice");
        *live -= 1;
        let drained = *live == 0;
        if drained {
            self.wait.cv.notify_all();
        }
        drained
    }

    pub fn live_children(&self) -> usize {
        *self.wait.live_children.lock()
    }

    /// Block until every child has released or `patience` elapses, so the
    /// calling worker can help drain the scheduler in between. Returns
    /// whether the children are all gone.
    pub(crate) fn wait_for_children(&self, patience: Duration) -> bool {
        let mut live = self.wait.live_children.lock();
        if *live == 0 {
            return true;
        }
        self.wait.cv.wait_for(&mut live, patience);
        *live == 0
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("accesses", &self.accesses.len())
            .finish_non_exhaustive()
    }
}

/// Builder for tasks; the only way to construct one.
pub struct TaskBuilder {
    name: Option<String>,
    body: TaskBody,
    accesses: Vec<Arc<DataAccess>>,
    parent: Option<Arc<Task>>,
    completion: Option<Box<dyn FnOnce() + Send>>,
    release_mode: DelayedRelease,
}

impl TaskBuilder {
    pub fn new(body: impl FnOnce(&Task) + Send + 'static) -> Self {
        Self::with_body(TaskBody::Closure(Box::new(body)))
    }

    /// A body registered in the task-function table; required for tasks
    /// that may be offloaded.
    pub fn registered(task_fn: u64, args: Vec<u8>) -> Self {
        Self::with_body(TaskBody::Registered { task_fn, args })
    }

    fn with_body(body: TaskBody) -> Self {
        Self {
            name: None,
            body,
            accesses: Vec::new(),
            parent: None,
            completion: None,
            release_mode: DelayedRelease::NoWait,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn access(mut self, region: MemoryRegion, mode: AccessMode, weak: bool) -> Self {
        self.accesses.push(DataAccess::new(region, mode, weak));
        self
    }

    pub fn parent(mut self, parent: Arc<Task>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    pub fn completion(mut self, cb: impl FnOnce() + Send + 'static) -> Self {
        self.completion = Some(Box::new(cb));
        self
    }

    pub fn release_mode(mut self, mode: DelayedRelease) -> Self {
        self.release_mode = mode;
        self
    }

    pub fn build(self) -> Arc<Task> {
        if let Some(parent) = &self.parent {
            parent.child_created();
        }
        Arc::new(Task {
            id: TaskId::next(),
            name: self.name,
            body: Mutex::new(Some(self.body)),
            accesses: self.accesses,
            state: AtomicU8::new(TaskState::Created as u8),
            release_mode: AtomicU8::new(self.release_mode as u8),
            parent: self.parent,
            wait: WaitState::default(),
            cluster: Mutex::new(None),
            remote_origin: Mutex::new(None),
            completion: Mutex::new(self.completion),
            delayed: Mutex::new(Vec::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::collections::HashSet;

    assert_impl_all!(Task: Send, Sync);

    #[test]
    fn test_task_ids_unique() {
        let mut ids = HashSet::new();
        for _ in 0..100 {
            let task = TaskBuilder::new(|_| {}).build();
            assert!(ids.insert(task.id()));
        }
    }

    #[test]
    fn test_state_transitions() {
        let task = TaskBuilder::new(|_| {}).build();
        assert_eq!(task.state(), TaskState::Created);

        assert!(task.try_mark_ready());
        assert!(!task.try_mark_ready());
        assert_eq!(task.state(), TaskState::Ready);

        assert!(task.transition(TaskState::Ready, TaskState::Executing));
        assert!(!task.transition(TaskState::Ready, TaskState::Executing));
        assert!(task.transition(TaskState::Executing, TaskState::Finished));
        assert!(task.transition(TaskState::Finished, TaskState::Released));
    }

    #[test]
    fn test_not_ready_until_accesses_satisfied() {
        let task = TaskBuilder::new(|_| {})
            .access(MemoryRegion::new(0, 64), AccessMode::Write, false)
            .build();
        // The write access was never satisfied.
        assert!(!task.try_mark_ready());
    }

    #[test]
    fn test_child_accounting() {
        let parent = TaskBuilder::new(|_| {}).build();
        let _c1 = TaskBuilder::new(|_| {}).parent(Arc::clone(&parent)).build();
        let _c2 = TaskBuilder::new(|_| {}).parent(Arc::clone(&parent)).build();

        assert_eq!(parent.live_children(), 2);
        parent.child_released();
        assert_eq!(parent.live_children(), 1);
        parent.child_released();
        assert!(parent.wait_for_children(Duration::from_millis(1)));
    }

    #[test]
    fn test_wire_capability() {
        let closure = TaskBuilder::new(|_| {}).build();
        assert!(!closure.is_wire_capable());

        let registered = TaskBuilder::registered(1, vec![0, 1]).build();
        assert!(registered.is_wire_capable());
    }
}
