use crate::deps::access::{AccessFlags, SuccessorEdge};
use crate::deps::{AccessMode, DataAccess};
use crate::ids::WriteId;
use crate::memory::{MemoryPlace, MemoryRegion};
use crate::task::Task;
use parking_lot::Mutex;
use std::sync::Arc;

/// Callbacks the dependency system raises while holding no registry lock.
///
/// The runtime wires `task_became_ready` to the scheduler and
/// `access_satisfied` to the cluster workflow, so satisfiability gained
/// after a task was offloaded keeps flowing to its remote copy.
pub trait DependencyObserver: Send + Sync {
    fn task_became_ready(&self, task: Arc<Task>);

    fn access_satisfied(&self, task: &Arc<Task>, access_index: usize, read: bool, write: bool);
}

/// Observer that swallows everything; unit tests and teardown paths.
#[derive(Debug, Default)]
pub struct NullObserver;

impl DependencyObserver for NullObserver {
    fn task_became_ready(&self, _task: Arc<Task>) {}
    fn access_satisfied(&self, _task: &Arc<Task>, _index: usize, _read: bool, _write: bool) {}
}

/// One not-yet-released access, visible to later registrations as a
/// potential predecessor.
#[derive(Debug)]
struct LiveEntry {
    access: Arc<DataAccess>,
    region: MemoryRegion,
    mode: AccessMode,
    owner: crate::task::TaskId,
}

/// The dependency DAG over region accesses.
///
/// Registration scans the live list for intersecting predecessors and
/// chains successor edges onto them; release walks those edges and
/// decrements blocker counters. Locking discipline: the live-list lock
/// and at most one per-access lock are ever held together, and successor
/// notification happens with the live list unlocked.
#[derive(Debug, Default)]
pub struct DependencyRegistry {
    live: Mutex<Vec<LiveEntry>>,
}

impl DependencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every declared access of `task`, linking it behind the
    /// intersecting accesses already live. May conclude the task is ready
    /// immediately.
    pub fn register_task(&self, task: &Arc<Task>, observer: &dyn DependencyObserver) {
        for (index, access) in task.accesses().iter().enumerate() {
            if access.is_weak() {
                // Weak accesses neither block nor get blocked; they only
                // carry location information for the scheduler.
                continue;
            }
            self.register_access(task, index, access, observer);
        }
        self.maybe_ready(task, observer);
    }

    fn register_access(
        &self,
        task: &Arc<Task>,
        index: usize,
        access: &Arc<DataAccess>,
        observer: &dyn DependencyObserver,
    ) {
        let region = access.region();
        let mut found_read: isize = 0;
        let mut found_write: isize = 0;

        {
            let mut live = self.live.lock();

            for entry in live.iter() {
                // A task never depends on its own sibling accesses.
                if entry.owner == task.id() || !entry.region.intersects(&region) {
                    continue;
                }
                let mut pred = entry.access.lock();
                if pred.flags.contains(AccessFlags::RELEASED) {
                    continue;
                }

                // Prior writers block reads; anything prior blocks writes.
                let blocks_read = entry.mode.writes();
                found_write += 1;
                if blocks_read {
                    found_read += 1;
                }
                pred.successors.push(SuccessorEdge {
                    task: Arc::downgrade(task),
                    access_index: index,
                    blocks_read,
                });
            }

            live.push(LiveEntry {
                access: Arc::clone(access),
                region,
                mode: access.mode(),
                owner: task.id(),
            });
        }

        // Fold the scan result into the counters and lift the
        // registration guard. Predecessors that released mid-scan already
        // decremented, which the signed counters absorb.
        let (became_read, became_write) = {
            let mut state = access.lock();
            state.read_blockers += found_read;
            state.write_blockers += found_write;
            state.flags.remove(AccessFlags::REGISTERING);

            let became_read = state.read_blockers <= 0
                && !state.flags.contains(AccessFlags::READ_SATISFIED);
            if became_read {
                state.flags |= AccessFlags::READ_SATISFIED;
            }
            let became_write = state.write_blockers <= 0
                && !state.flags.contains(AccessFlags::WRITE_SATISFIED);
            if became_write {
                state.flags |= AccessFlags::WRITE_SATISFIED;
            }
            (became_read, became_write)
        };

        if became_read || became_write {
            observer.access_satisfied(task, index, became_read, became_write);
        }
    }

    /// Register a task whose satisfiability is driven externally (it was
    /// received from an offloader). Its accesses become visible as
    /// predecessors to later local registrations, but gain no local
    /// blockers themselves: satisfiability arrives through wire flags,
    /// `Satisfiability` messages and namespace propagation.
    pub fn register_task_external(&self, task: &Arc<Task>) {
        let mut live = self.live.lock();
        for access in task.accesses() {
            if access.is_weak() {
                continue;
            }
            live.push(LiveEntry {
                access: Arc::clone(access),
                region: access.region(),
                mode: access.mode(),
                owner: task.id(),
            });
            access.lock().flags.remove(AccessFlags::REGISTERING);
        }
    }

    /// Re-evaluate readiness after externally applied state changes.
    pub fn check_ready(&self, task: &Arc<Task>, observer: &dyn DependencyObserver) {
        self.maybe_ready(task, observer);
    }

    /// The access completed and may release its contribution: propagate
    /// read/write satisfiability to every successor and drop it from the
    /// live list.
    pub fn release_access(
        &self,
        task: &Arc<Task>,
        access_index: usize,
        observer: &dyn DependencyObserver,
    ) {
        let access = &task.accesses()[access_index];

        let (successors, write_id, location) = {
            let mut state = access.lock();
            if state.flags.contains(AccessFlags::RELEASED) {
                return;
            }
            state.flags |= AccessFlags::RELEASED | AccessFlags::COMPLETE;
            (
                std::mem::take(&mut state.successors),
                state.write_id,
                state.location,
            )
        };

        self.live
            .lock()
            .retain(|entry| !Arc::ptr_eq(&entry.access, access));

        for edge in successors {
            self.notify_successor(&edge, write_id, location, observer);
        }
    }

    fn notify_successor(
        &self,
        edge: &SuccessorEdge,
        write_id: WriteId,
        location: Option<MemoryPlace>,
        observer: &dyn DependencyObserver,
    ) {
        let Some(task) = edge.task.upgrade() else {
            return;
        };
        let access = &task.accesses()[edge.access_index];

        let (became_read, became_write) = {
            let mut state = access.lock();
            state.write_blockers -= 1;
            if edge.blocks_read {
                state.read_blockers -= 1;
            }

            // A releasing writer hands its version down to the consumer.
            if edge.blocks_read && !write_id.is_none() {
                state.write_id = write_id;
            }
            if location.is_some() && (edge.blocks_read || state.location.is_none()) {
                state.location = location;
            }

            if state.flags.contains(AccessFlags::REGISTERING) {
                // Registration will evaluate the counters once the scan
                // result is in.
                (false, false)
            } else {
                let became_read = state.read_blockers <= 0
                    && !state.flags.contains(AccessFlags::READ_SATISFIED);
                if became_read {
                    state.flags |= AccessFlags::READ_SATISFIED;
                }
                let became_write = state.write_blockers <= 0
                    && !state.flags.contains(AccessFlags::WRITE_SATISFIED);
                if became_write {
                    state.flags |= AccessFlags::WRITE_SATISFIED;
                }
                (became_read, became_write)
            }
        };

        if became_read || became_write {
            observer.access_satisfied(&task, edge.access_index, became_read, became_write);
            self.maybe_ready(&task, observer);
        }
    }

    /// Apply satisfiability that arrived as a message (or through the
    /// cluster namespace). Delivering the same information twice is a
    /// no-op: the flags are the dedup.
    pub fn apply_satisfiability(
        &self,
        task: &Arc<Task>,
        region: MemoryRegion,
        read: bool,
        write: bool,
        write_id: WriteId,
        location: Option<MemoryPlace>,
        observer: &dyn DependencyObserver,
    ) {
        for (index, access) in task.accesses().iter().enumerate() {
            if !access.region().intersects(&region) {
                continue;
            }

            let (became_read, became_write) = {
                let mut state = access.lock();
                let became_read = read && !state.flags.contains(AccessFlags::READ_SATISFIED);
                if became_read {
                    state.flags |= AccessFlags::READ_SATISFIED;
                }
                let became_write = write && !state.flags.contains(AccessFlags::WRITE_SATISFIED);
                if became_write {
                    state.flags |= AccessFlags::WRITE_SATISFIED;
                }
                if became_read || became_write {
                    if !write_id.is_none() {
                        state.write_id = write_id;
                    }
                    if location.is_some() {
                        state.location = location;
                    }
                }
                (became_read, became_write)
            };

            if became_read || became_write {
                observer.access_satisfied(task, index, became_read, became_write);
            }
        }

        self.maybe_ready(task, observer);
    }

    /// Record that the data of every access intersecting `region` now
    /// lives at `place` (a transfer landed or a task wrote it here).
    pub fn update_location(&self, task: &Arc<Task>, region: MemoryRegion, place: MemoryPlace) {
        for access in task.accesses() {
            if access.region().intersects(&region) {
                access.set_location(place);
            }
        }
    }

    fn maybe_ready(&self, task: &Arc<Task>, observer: &dyn DependencyObserver) {
        if task.try_mark_ready() {
            observer.task_became_ready(Arc::clone(task));
        }
    }

    #[cfg(test)]
    pub(crate) fn live_len(&self) -> usize {
        self.live.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskBuilder};
    use parking_lot::Mutex as PlMutex;

    /// Observer that records readiness order.
    #[derive(Default)]
    struct Recorder {
        ready: PlMutex<Vec<u64>>,
        satisfied: PlMutex<Vec<(u64, usize, bool, bool)>>,
    }

    impl DependencyObserver for Recorder {
        fn task_became_ready(&self, task: Arc<Task>) {
            self.ready.lock().push(task.id().as_u64());
        }

        fn access_satisfied(&self, task: &Arc<Task>, index: usize, read: bool, write: bool) {
            self.satisfied
                .lock()
                .push((task.id().as_u64(), index, read, write));
        }
    }

    fn task_with_access(mode: AccessMode, region: MemoryRegion) -> Arc<Task> {
        TaskBuilder::new(|_| {})
            .access(region, mode, false)
            .build()
    }

    #[test]
    fn test_independent_tasks_ready_immediately() {
        let registry = DependencyRegistry::new();
        let observer = Recorder::default();

        let a = task_with_access(AccessMode::Write, MemoryRegion::new(0, 64));
        let b = task_with_access(AccessMode::Write, MemoryRegion::new(64, 128));

        registry.register_task(&a, &observer);
        registry.register_task(&b, &observer);

        assert_eq!(
            *observer.ready.lock(),
            vec![a.id().as_u64(), b.id().as_u64()]
        );
    }

    #[test]
    fn test_reader_waits_for_writer() {
        let registry = DependencyRegistry::new();
        let observer = Recorder::default();
        let region = MemoryRegion::new(0, 64);

        let writer = task_with_access(AccessMode::Write, region);
        let reader = task_with_access(AccessMode::Read, region);

        registry.register_task(&writer, &observer);
        registry.register_task(&reader, &observer);

        assert_eq!(*observer.ready.lock(), vec![writer.id().as_u64()]);

        // The writer produces a version and releases.
        writer.accesses()[0].lock().write_id = WriteId(7);
        writer.accesses()[0].set_location(MemoryPlace::host(0));
        registry.release_access(&writer, 0, &observer);

        assert_eq!(
            *observer.ready.lock(),
            vec![writer.id().as_u64(), reader.id().as_u64()]
        );
        // The consumer inherited the producer's version and location.
        assert_eq!(reader.accesses()[0].write_id(), WriteId(7));
        assert_eq!(reader.accesses()[0].location(), Some(MemoryPlace::host(0)));
        assert_eq!(registry.live_len(), 1);
    }

    #[test]
    fn test_concurrent_readers_share_then_writer_waits() {
        let registry = DependencyRegistry::new();
        let observer = Recorder::default();
        let region = MemoryRegion::new(0, 64);

        let r1 = task_with_access(AccessMode::Read, region);
        let r2 = task_with_access(AccessMode::Read, region);
        let w = task_with_access(AccessMode::Write, region);

        registry.register_task(&r1, &observer);
        registry.register_task(&r2, &observer);
        registry.register_task(&w, &observer);

        // Both readers run concurrently; the writer waits for both.
        assert_eq!(
            *observer.ready.lock(),
            vec![r1.id().as_u64(), r2.id().as_u64()]
        );

        registry.release_access(&r1, 0, &observer);
        assert_eq!(observer.ready.lock().len(), 2);

        registry.release_access(&r2, 0, &observer);
        assert_eq!(
            *observer.ready.lock(),
            vec![r1.id().as_u64(), r2.id().as_u64(), w.id().as_u64()]
        );
    }

    #[test]
    fn test_partial_overlap_creates_dependency() {
        let registry = DependencyRegistry::new();
        let observer = Recorder::default();

        let w1 = task_with_access(AccessMode::Write, MemoryRegion::new(0, 100));
        let w2 = task_with_access(AccessMode::Write, MemoryRegion::new(50, 150));

        registry.register_task(&w1, &observer);
        registry.register_task(&w2, &observer);
        assert_eq!(observer.ready.lock().len(), 1);

        registry.release_access(&w1, 0, &observer);
        assert_eq!(observer.ready.lock().len(), 2);
    }

    #[test]
    fn test_duplicate_satisfiability_is_idempotent() {
        let registry = DependencyRegistry::new();
        let observer = Recorder::default();
        let region = MemoryRegion::new(0, 64);

        let writer = task_with_access(AccessMode::Write, region);
        let reader = task_with_access(AccessMode::Read, region);
        registry.register_task(&writer, &observer);
        registry.register_task(&reader, &observer);

        let apply = |obs: &Recorder| {
            registry.apply_satisfiability(
                &reader,
                region,
                true,
                false,
                WriteId(9),
                Some(MemoryPlace::host(1)),
                obs,
            )
        };

        apply(&observer);
        let ready_after_one = observer.ready.lock().clone();
        let satisfied_after_one = observer.satisfied.lock().clone();

        // Delivering the exact same satisfiability again changes nothing.
        apply(&observer);
        assert_eq!(*observer.ready.lock(), ready_after_one);
        assert_eq!(*observer.satisfied.lock(), satisfied_after_one);
        assert_eq!(reader.accesses()[0].write_id(), WriteId(9));
    }

    #[test]
    fn test_weak_accesses_do_not_block() {
        let registry = DependencyRegistry::new();
        let observer = Recorder::default();
        let region = MemoryRegion::new(0, 64);

        let weak = TaskBuilder::new(|_| {})
            .access(region, AccessMode::ReadWrite, true)
            .build();
        let strong = task_with_access(AccessMode::Write, region);

        registry.register_task(&weak, &observer);
        registry.register_task(&strong, &observer);

        // Both are immediately ready: the weak access neither blocks the
        // writer nor waits for anything.
        assert_eq!(observer.ready.lock().len(), 2);
    }
}
