//! Handlers for everything that arrives over the cluster messenger:
//! task offloads, satisfiability, data movement, releases and the
//! distributed allocation traffic.

use crate::deps::DependencyObserver;
use crate::ids::{OffloadedTaskId, WriteId};
use crate::memory::{MemoryPlace, MemoryRegion};
use crate::msg::{
    DataFetchMsg, DataSendMsg, DfreeMsg, DmallocMsg, Envelope, Message, ReleaseMsg,
    SatisfiabilityMsg, TaskFinishMsg, TaskNewMsg,
};
use crate::runtime::{RemoteTaskInfo, Runtime};
use crate::task::{RemoteOrigin, TaskBuilder, TaskState};
use std::sync::Arc;
use std::sync::atomic::Ordering;

impl Runtime {
    /// Dispatch one received message. Runs on the polling threads (or
    /// polling tasks); anything malformed is a fatal protocol violation.
    pub(crate) fn handle_message(self: &Arc<Runtime>, env: Envelope) {
        tracing::trace!(kind = ?env.body.kind(), source = env.source, "handle");
        match env.body {
            Message::TaskNew(msg) => self.handle_task_new(env.source, msg),
            Message::Satisfiability(msg) => self.handle_satisfiability(msg),
            Message::DataFetch(msg) => self.handle_data_fetch(env.source, msg),
            Message::DataSend(msg) => self.handle_data_send(msg),
            Message::TaskFinish(msg) => self.handle_task_finish(env.source, msg),
            Message::SysFinish => self.sys_finish_seen.store(true, Ordering::Release),
            Message::Dmalloc(msg) => self.handle_dmalloc(msg),
            Message::Dfree(msg) => self.handle_dfree(msg),
            Message::Release(msg) => self.handle_release(msg),
        }
    }

    /// A peer offloaded a task to us: rebuild it from the wire, make its
    /// accesses visible to the local dependency DAG, and apply whatever
    /// satisfiability travelled along.
    fn handle_task_new(self: &Arc<Runtime>, source: usize, msg: TaskNewMsg) {
        let mut builder = TaskBuilder::registered(msg.task_fn, msg.args)
            .named(format!("offloaded-{}", msg.offloaded_id));
        for access in &msg.accesses {
            builder = builder.access(access.region, access.mode, access.weak);
        }
        let task = builder.build();
        task.set_remote_origin(RemoteOrigin {
            offloader_node: source,
            offloaded_id: msg.offloaded_id,
        });

        // Pre-set the locations the offloader reported; the fetch steps
        // read them once the task is ready.
        for (access, wire) in task.accesses().iter().zip(&msg.accesses) {
            let mut state = access.lock();
            state.location = wire.location;
            state.write_id = wire.write_id;
        }

        self.remote.insert(
            msg.offloaded_id,
            RemoteTaskInfo {
                task: Arc::clone(&task),
                offloader: source,
            },
        );

        if self.cfg.use_namespace {
            self.deps.register_task_external(&task);
        } else {
            // Without the namespace the task is invisible to local
            // chaining; satisfiability is purely message-driven.
            for access in task.accesses() {
                access
                    .lock()
                    .flags
                    .remove(crate::deps::AccessFlags::REGISTERING);
            }
        }

        for wire in &msg.accesses {
            if wire.read_satisfied || wire.write_satisfied {
                self.deps.apply_satisfiability(
                    &task,
                    wire.region,
                    wire.read_satisfied,
                    wire.write_satisfied,
                    wire.write_id,
                    wire.location,
                    &**self as &dyn DependencyObserver,
                );
            }
        }
        self.deps
            .check_ready(&task, &**self as &dyn DependencyObserver);
    }

    /// Post-offload satisfiability from the offloader. Duplicates with
    /// the namespace propagation are expected and harmless, as is
    /// satisfiability for a task that already finished: a dimension the
    /// task itself never needed (say, write satisfiability of a read
    /// access) may arrive after its release.
    fn handle_satisfiability(self: &Arc<Runtime>, msg: SatisfiabilityMsg) {
        let Some(entry) = self.remote.get(&msg.offloaded_id) else {
            tracing::trace!(id = %msg.offloaded_id, "late satisfiability for a released task");
            return;
        };
        let task = Arc::clone(&entry.task);
        drop(entry);

        self.deps.apply_satisfiability(
            &task,
            msg.region,
            msg.read,
            msg.write,
            msg.write_id,
            msg.location,
            &**self as &dyn DependencyObserver,
        );
    }

    /// A peer pulls data that lives here: answer every fragment with a
    /// DataSend.
    fn handle_data_fetch(self: &Arc<Runtime>, source: usize, msg: DataFetchMsg) {
        for fragment in msg.fragments {
            if !self.vmm.is_cluster_memory(&fragment.region) {
                panic!("data fetch outside cluster memory: {}", fragment.region);
            }
            // Safety: the region is inside our arena mapping, and the
            // dependency system serialized us behind the last writer.
            let bytes = unsafe { fragment.region.as_slice() }.to_vec();
            self.send_message(
                Message::DataSend(DataSendMsg {
                    transfer_id: fragment.transfer_id,
                    region: fragment.region,
                    bytes,
                }),
                source,
                false,
            )
            .unwrap_or_else(|e| panic!("answering data fetch: {e}"));
        }
    }

    /// A fragment of data arrived: land the bytes and complete the
    /// matching pending transfer. Without one this is an eager push.
    fn handle_data_send(self: &Arc<Runtime>, msg: DataSendMsg) {
        if !self.vmm.is_cluster_memory(&msg.region) {
            panic!("data send outside cluster memory: {}", msg.region);
        }
        if msg.bytes.len() != msg.region.len() {
            panic!(
                "data send size mismatch: {} bytes for {}",
                msg.bytes.len(),
                msg.region
            );
        }
        // Safety: region is inside our arena; the transfer was issued
        // while the consumer side is parked, so nobody reads it yet.
        unsafe { msg.region.as_mut_slice() }.copy_from_slice(&msg.bytes);

        if self.pending.complete(msg.transfer_id).is_none() {
            // Unsolicited (eager send): just track the fresh copy.
            self.directory.update_location(msg.region, self.this_place());
        }
    }

    /// The remote side finished a task we offloaded: apply the reported
    /// locations and release the accesses it did not delay.
    fn handle_task_finish(self: &Arc<Runtime>, source: usize, msg: TaskFinishMsg) {
        for access in &msg.accesses {
            self.release_offloaded_access(
                msg.offloaded_id,
                access.region,
                access.write_id,
                access.location.or(Some(MemoryPlace::host(source))),
            );
        }
        // A finish with everything delayed still has to finalize once
        // the releases trickle in; with nothing delayed this is it.
        self.try_finalize_offloaded(msg.offloaded_id);
    }

    /// Late release of one delayed access of an offloaded task.
    fn handle_release(self: &Arc<Runtime>, msg: ReleaseMsg) {
        if !self.offloaded.contains_key(&msg.offloaded_id) {
            panic!("release for unknown offloaded task {}", msg.offloaded_id);
        }
        self.release_offloaded_access(
            msg.offloaded_id,
            msg.region,
            msg.write_id,
            msg.location,
        );
        self.try_finalize_offloaded(msg.offloaded_id);
    }

    fn handle_dmalloc(self: &Arc<Runtime>, msg: DmallocMsg) {
        let policy = crate::config::DistributionPolicy::from_u8(msg.policy)
            .unwrap_or_else(|e| panic!("{e}"));
        self.directory.register_allocation(
            msg.region,
            policy,
            &msg.dims,
            msg.allocating_node as usize,
        );
    }

    fn handle_dfree(self: &Arc<Runtime>, msg: DfreeMsg) {
        self.directory
            .unregister_allocation(msg.region)
            .unwrap_or_else(|e| panic!("{e}"));
    }

    /// Release every not-yet-released offloader-side access that the
    /// reported region covers, propagating the remote version into the
    /// local dependency DAG.
    fn release_offloaded_access(
        self: &Arc<Runtime>,
        offloaded_id: OffloadedTaskId,
        region: MemoryRegion,
        write_id: WriteId,
        location: Option<MemoryPlace>,
    ) {
        // Mark under the map guard, release outside it: the release
        // cascade may offload further tasks into the same map.
        let (task, to_release) = {
            let Some(mut info) = self.offloaded.get_mut(&offloaded_id) else {
                panic!("report for unknown offloaded task {offloaded_id}");
            };
            let task = Arc::clone(&info.task);
            let mut to_release = Vec::new();
            for (index, access) in task.accesses().iter().enumerate() {
                if info.released_accesses[index] || !access.region().intersects(&region) {
                    continue;
                }
                info.released_accesses[index] = true;
                to_release.push(index);
            }
            (task, to_release)
        };

        if let Some(place) = location {
            self.directory.update_location(region, place);
        }

        for index in to_release {
            {
                let mut state = task.accesses()[index].lock();
                if !write_id.is_none() {
                    state.write_id = write_id;
                }
                if location.is_some() {
                    state.location = location;
                }
            }
            self.deps
                .release_access(&task, index, &**self as &dyn DependencyObserver);
        }
    }

    /// All accesses reported back? Then the offloaded task is done here:
    /// tear down its workflow and cascade the release.
    fn try_finalize_offloaded(self: &Arc<Runtime>, offloaded_id: OffloadedTaskId) {
        let finished = {
            let Some(info) = self.offloaded.get(&offloaded_id) else {
                return;
            };
            info.released_accesses.iter().all(|r| *r)
        };
        if !finished {
            return;
        }
        let Some((_, info)) = self.offloaded.remove(&offloaded_id) else {
            return;
        };

        if let Some(step) = self.steps.get(info.notification_step) {
            let payload = step.payload.lock();
            if let crate::workflow::StepPayload::Notification(n) = &*payload {
                debug_assert_eq!(n.offloaded_id, offloaded_id);
                debug_assert_eq!(n.task.id(), info.task.id());
            }
        }

        self.steps.complete(self, info.execution_step);
        self.steps.complete(self, info.notification_step);
        for link in info.link_steps.into_iter().flatten() {
            self.steps.complete(self, link);
        }

        let task = info.task;
        task.transition(TaskState::Executing, TaskState::Finished);
        self.try_finalize_release(&task);
    }

    /// Register a pending transfer directly; test hook for the
    /// coalescing paths.
    #[cfg(test)]
    pub(crate) fn inject_pending_transfer(
        self: &Arc<Runtime>,
        id: crate::ids::MessageId,
        region: MemoryRegion,
        source: MemoryPlace,
    ) {
        self.pending.add(crate::transfer::DataTransfer::new(
            id,
            region,
            source,
            self.this_place(),
        ));
    }
}
