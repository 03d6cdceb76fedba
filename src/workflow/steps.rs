use crate::deps::AccessFlags;
use crate::ids::{OffloadedTaskId, WriteId};
use crate::memory::{MemoryPlace, MemoryRegion};
use crate::msg::{DataFetchMsg, FetchFragment, Message, TaskNewMsg, WireAccess};
use crate::runtime::{OffloadedTaskInfo, Runtime};
use crate::task::{ClusterContext, RemoteOrigin, Task, TaskBody, TaskState};
use crate::transfer::DataTransfer;
use crate::workflow::{Step, StepId, StepPayload};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Consumer-side fetch of one access's data into this node. Fragmented
/// at `cluster.message_max_size`; before issuing anything it checks the
/// write-id cache for a late match and the pending queue for a transfer
/// to piggy-back on.
#[derive(Debug)]
pub(crate) struct DataCopyStep {
    pub task: Arc<Task>,
    pub access_index: usize,
    pub source: MemoryPlace,
    pub region: MemoryRegion,
    pub write_id: WriteId,
    pub needs_transfer: bool,
}

/// Producer-side link of one access of an offloaded task: carries
/// satisfiability from the offloader to the remote namespace. Both
/// `start` and `link_region` decrement `bytes_to_link` under the step
/// lock; whichever observes zero (with the step started) completes it.
#[derive(Debug)]
pub(crate) struct DataLinkStep {
    pub task: Arc<Task>,
    pub access_index: usize,
    pub region: MemoryRegion,
    pub bytes_to_link: usize,
    pub started: bool,
    pub execution_step: StepId,
}

/// Bundles the accumulated per-access satisfiability into one `TaskNew`
/// and sends it to the selected node.
#[derive(Debug)]
pub(crate) struct ExecutionStep {
    pub task: Arc<Task>,
    pub remote_node: usize,
    pub offloaded_id: OffloadedTaskId,
    pub predecessor_hint: u64,
    /// Satisfiability snapshots, one slot per access, filled by the link
    /// steps as they start.
    pub accesses: Vec<Option<WireAccess>>,
    pub sent: bool,
}

/// Armed after the `TaskNew` goes out; completed when the remote
/// `TaskFinish` arrives and the reported locations have been applied.
#[derive(Debug)]
pub(crate) struct NotificationStep {
    pub task: Arc<Task>,
    pub offloaded_id: OffloadedTaskId,
}

/// Late release of one delayed access, sent back to the offloader so it
/// can propagate release to the successor dependencies.
#[derive(Debug)]
pub(crate) struct DataReleaseStep {
    pub origin: RemoteOrigin,
    pub access: crate::msg::FinishAccess,
}

pub(crate) fn dispatch_start(rt: &Arc<Runtime>, step: &Arc<Step>, id: StepId) {
    // Each handler takes the payload lock itself; the dispatch only
    // peeks at the variant.
    let kind = {
        let payload = step.payload.lock();
        match &*payload {
            StepPayload::DataCopy(_) => 0,
            StepPayload::DataLink(_) => 1,
            StepPayload::Execution(_) => 2,
            StepPayload::Notification(_) => 3,
            StepPayload::DataRelease(_) => 4,
        }
    };
    match kind {
        0 => start_data_copy(rt, step, id),
        1 => start_data_link(rt, step, id),
        2 => start_execution(rt, step, id),
        // A notification step has nothing to do at start; the remote
        // TaskFinish completes it.
        3 => {}
        _ => start_data_release(rt, step, id),
    }
}

// --- offloader side -------------------------------------------------------

/// Build and kick the offload workflow for `task`, which the locality
/// scheduler assigned to `remote_node`:
///
/// link steps (one per access) → execution step → notification step,
/// with the delayed releases travelling back as separate steps on the
/// executing side.
pub(crate) fn offload_task(rt: &Arc<Runtime>, task: Arc<Task>, remote_node: usize) {
    let offloaded_id = rt.ids.next_offloaded_task_id();
    // The predecessor hint is what lets the remote namespace chain this
    // task behind its sibling; connection setup can be configured off.
    let predecessor_hint = if rt.cfg.use_namespace && !rt.cfg.disable_remote_connect {
        let mut last = rt.last_offloaded.lock();
        let prev = last[remote_node];
        last[remote_node] = offloaded_id.0;
        prev
    } else {
        0
    };

    task.set_cluster_context(ClusterContext {
        remote_node,
        offloaded_id,
        predecessor_hint,
    });
    // The task is executing, just not here.
    assert!(task.transition(TaskState::Ready, TaskState::Executing));

    let access_count = task.accesses().len();
    let execution_step = rt.steps.insert_with(access_count, |_| {
        StepPayload::Execution(ExecutionStep {
            task: Arc::clone(&task),
            remote_node,
            offloaded_id,
            predecessor_hint,
            accesses: vec![None; access_count],
            sent: false,
        })
    });
    let notification_step = rt.steps.insert_with(1, |_| {
        StepPayload::Notification(NotificationStep {
            task: Arc::clone(&task),
            offloaded_id,
        })
    });
    rt.steps.add_successor(execution_step, notification_step);

    let mut link_steps = Vec::with_capacity(access_count);
    for (index, access) in task.accesses().iter().enumerate() {
        let region = access.region();
        let link = rt.steps.insert_with(0, |_| {
            StepPayload::DataLink(DataLinkStep {
                task: Arc::clone(&task),
                access_index: index,
                region,
                // Read and write satisfiability each account the region
                // once.
                bytes_to_link: 2 * region.len(),
                started: false,
                execution_step,
            })
        });
        link_steps.push(Some(link));
    }

    rt.offloaded.insert(
        offloaded_id,
        OffloadedTaskInfo {
            task: Arc::clone(&task),
            remote_node,
            link_steps: link_steps.clone(),
            execution_step,
            notification_step,
            released_accesses: vec![false; access_count],
        },
    );

    tracing::debug!(task = %task.id(), node = remote_node, id = %offloaded_id, "offload");

    // Zero accesses: the execution step has no predecessors and can go
    // out immediately.
    if access_count == 0 {
        rt.steps.start(rt, execution_step);
    } else {
        for link in link_steps.into_iter().flatten() {
            rt.steps.start(rt, link);
        }
    }
}

fn start_data_link(rt: &Arc<Runtime>, step: &Arc<Step>, id: StepId) {
    let (execution_step, completed, access_index, offloaded, snapshot) = {
        let mut payload = step.payload.lock();
        let StepPayload::DataLink(link) = &mut *payload else {
            unreachable!("data-link start on a non-link step");
        };

        // Snapshot the access under its own lock, then account the
        // dimensions that are already satisfied.
        let access = &link.task.accesses()[link.access_index];
        let (read_sat, write_sat, write_id, location) = {
            let st = access.lock();
            (
                st.flags.contains(AccessFlags::READ_SATISFIED),
                st.flags.contains(AccessFlags::WRITE_SATISFIED),
                st.write_id,
                st.location,
            )
        };

        let len = link.region.len();
        if read_sat {
            link.bytes_to_link -= len;
        }
        if write_sat {
            link.bytes_to_link -= len;
        }
        link.started = true;
        access.lock().flags |= AccessFlags::REGISTERED_REMOTELY;

        let snapshot = WireAccess {
            region: link.region,
            mode: access.mode(),
            weak: access.is_weak(),
            write_id,
            location,
            read_satisfied: read_sat,
            write_satisfied: write_sat,
        };
        let offloaded = link.task.cluster_context().map(|c| c.offloaded_id);

        (
            link.execution_step,
            link.bytes_to_link == 0,
            link.access_index,
            offloaded,
            snapshot,
        )
    };

    // Contribute the snapshot to the execution step, then release it;
    // the last link to do so triggers the TaskNew send.
    if let Some(exec) = rt.steps.get(execution_step) {
        let mut payload = exec.payload.lock();
        if let StepPayload::Execution(exec) = &mut *payload {
            exec.accesses[access_index] = Some(snapshot);
        }
    }
    rt.steps.release(rt, execution_step);

    if completed {
        // Fully linked at start: this branch owns the slot release.
        if rt.steps.complete(rt, id) {
            if let Some(offloaded_id) = offloaded {
                clear_link_step(rt, offloaded_id, access_index);
            }
        }
    }
}

/// Satisfiability reached an access of an already-offloaded task: feed
/// it through the link step. Before the `TaskNew` went out this just
/// refreshes the bundled snapshot; afterwards it becomes a
/// `Satisfiability` message to the remote namespace.
pub(crate) fn link_region(
    rt: &Arc<Runtime>,
    task: &Arc<Task>,
    access_index: usize,
    read: bool,
    write: bool,
) {
    let Some(ctx) = task.cluster_context() else {
        return;
    };
    let Some(link_id) = rt
        .offloaded
        .get(&ctx.offloaded_id)
        .and_then(|info| info.link_steps.get(access_index).copied().flatten())
    else {
        return;
    };
    let Some(step) = rt.steps.get(link_id) else {
        return;
    };

    let access = &task.accesses()[access_index];
    let (write_id, location) = {
        let st = access.lock();
        (st.write_id, st.location)
    };
    let region = access.region();

    let (completed, execution_step) = {
        let mut payload = step.payload.lock();
        let StepPayload::DataLink(link) = &mut *payload else {
            return;
        };
        let len = link.region.len();
        if read {
            link.bytes_to_link = link.bytes_to_link.saturating_sub(len);
        }
        if write {
            link.bytes_to_link = link.bytes_to_link.saturating_sub(len);
        }
        (link.started && link.bytes_to_link == 0, link.execution_step)
    };

    // If the TaskNew is still being assembled, refresh its snapshot
    // in place; otherwise propagate over the wire. Lock order is always
    // link step → execution step.
    let mut deliver_remote = true;
    if let Some(exec) = rt.steps.get(execution_step) {
        let mut payload = exec.payload.lock();
        if let StepPayload::Execution(exec) = &mut *payload {
            if !exec.sent {
                if let Some(slot) = exec.accesses.get_mut(access_index) {
                    if let Some(wire) = slot {
                        wire.read_satisfied |= read;
                        wire.write_satisfied |= write;
                        wire.write_id = write_id;
                        wire.location = location;
                    }
                    deliver_remote = false;
                }
            }
        }
    }

    if deliver_remote {
        rt.send_message(
            Message::Satisfiability(crate::msg::SatisfiabilityMsg {
                offloaded_id: ctx.offloaded_id,
                region,
                read,
                write,
                write_id,
                location,
            }),
            ctx.remote_node,
            false,
        )
        .unwrap_or_else(|e| panic!("propagating satisfiability: {e}"));
    }

    if completed && rt.steps.complete(rt, link_id) {
        clear_link_step(rt, ctx.offloaded_id, access_index);
    }
}

fn clear_link_step(rt: &Arc<Runtime>, offloaded_id: OffloadedTaskId, access_index: usize) {
    if let Some(mut info) = rt.offloaded.get_mut(&offloaded_id) {
        if let Some(slot) = info.link_steps.get_mut(access_index) {
            *slot = None;
        }
    }
}

fn start_execution(rt: &Arc<Runtime>, step: &Arc<Step>, _id: StepId) {
    // The send happens under the payload lock: `sent` flipping and the
    // TaskNew hitting the channel must be one event, or a concurrent
    // `link_region` could emit a Satisfiability that overtakes it.
    let mut payload = step.payload.lock();
    let StepPayload::Execution(exec) = &mut *payload else {
        unreachable!("execution start on a non-execution step");
    };

    let accesses = exec
        .accesses
        .iter()
        .cloned()
        .map(|a| a.expect("link step never contributed its access"))
        .collect();

    let (task_fn, args) = match exec.task.take_body() {
        Some(TaskBody::Registered { task_fn, args }) => (task_fn, args),
        other => panic!(
            "offloaded task {} has a non-wire body: {other:?}",
            exec.task.id()
        ),
    };

    exec.sent = true;
    rt.send_message(
        Message::TaskNew(TaskNewMsg {
            offloaded_id: exec.offloaded_id,
            task_fn,
            args,
            predecessor: exec.predecessor_hint,
            accesses,
        }),
        exec.remote_node,
        false,
    )
    .unwrap_or_else(|e| panic!("offloading task: {e}"));
}

// --- executing side -------------------------------------------------------

/// Create fetch steps for every access whose data lives on a peer. Call
/// when the task became ready here; returns true when fetches are in
/// flight (the task parks in `Blocked` until they land).
pub(crate) fn build_local_fetches(rt: &Arc<Runtime>, task: &Arc<Task>) -> bool {
    if !rt.nodes.in_cluster_mode() {
        return false;
    }
    let this = rt.nodes.this_index();

    let mut created = Vec::new();
    for (index, access) in task.accesses().iter().enumerate() {
        if !access.mode().reads() || access.region().is_empty() {
            continue;
        }
        if access.is_weak() && !rt.cfg.eager_weak_fetch {
            continue;
        }
        let (location, write_id) = {
            let st = access.lock();
            (st.location, st.write_id)
        };
        let Some(MemoryPlace::Host { node }) = location else {
            continue;
        };
        if node == this {
            continue;
        }

        access.lock().flags |= AccessFlags::DATA_PENDING;
        let region = access.region();
        let copy = rt.steps.insert_with(0, |_| {
            StepPayload::DataCopy(DataCopyStep {
                task: Arc::clone(task),
                access_index: index,
                source: MemoryPlace::host(node),
                region,
                write_id,
                needs_transfer: true,
            })
        });
        created.push(copy);
    }

    if created.is_empty() {
        return false;
    }

    // Park the task before the first fetch can complete synchronously.
    task.transition(TaskState::Ready, TaskState::Blocked);
    for id in created {
        rt.steps.start(rt, id);
    }
    true
}

/// The decision tree of a fetch: late write-id match, piggy-back on a
/// pending transfer, or issue fragmented `DataFetch` messages.
fn start_data_copy(rt: &Arc<Runtime>, step: &Arc<Step>, id: StepId) {
    let (task, access_index, source, region, write_id, needs_transfer) = {
        let payload = step.payload.lock();
        let StepPayload::DataCopy(copy) = &*payload else {
            unreachable!("data-copy start on a non-copy step");
        };
        (
            Arc::clone(&copy.task),
            copy.access_index,
            copy.source,
            copy.region,
            copy.write_id,
            copy.needs_transfer,
        )
    };
    let this_place = rt.this_place();

    // (i) Second chance on the write-id cache: the bytes are already
    // here at the right version, so only the location needs fixing.
    let late_write_id = needs_transfer && rt.write_cache.check_local(write_id, region);
    if !needs_transfer || late_write_id {
        tracing::trace!(%region, "fetch elided by local write id");
        finish_data_copy(rt, &task, access_index, region, write_id, false);
        rt.steps.complete(rt, id);
        return;
    }

    // (ii) Coalesce with a pending transfer that has the same target and
    // fully contains this region. The callback must not take registry
    // locks here — it is registered under the queue lock and runs at
    // completion, outside it.
    let piggybacked = {
        let rt2 = Arc::clone(rt);
        let task2 = Arc::clone(&task);
        rt.pending.check_pending(move |pending| {
            if pending.target().node() == Some(this_place.node().unwrap())
                && pending.region().contains(&region)
            {
                let rt = Arc::clone(&rt2);
                let task = Arc::clone(&task2);
                pending.add_completion_callback(move || {
                    finish_data_copy(&rt, &task, access_index, region, write_id, false);
                    rt.steps.complete(&rt, id);
                });
                true
            } else {
                false
            }
        })
    };
    if piggybacked {
        tracing::trace!(%region, "fetch coalesced with pending transfer");
        return;
    }

    // (iii) Issue one DataFetch covering every fragment; each fragment
    // is one message-sized transfer, completion counted down atomically.
    let source_node = source
        .node()
        .expect("fetching from the directory sentinel");
    let fragments: Vec<MemoryRegion> = region.fragments(rt.cfg.message_max_size).collect();
    let remaining = Arc::new(AtomicUsize::new(fragments.len()));

    let mut wire_fragments = Vec::with_capacity(fragments.len());
    let mut transfers = Vec::with_capacity(fragments.len());
    for fragment in fragments {
        let transfer_id = rt.ids.next_message_id();
        let transfer = DataTransfer::new(transfer_id, fragment, source, this_place);

        let rt2 = Arc::clone(rt);
        let task2 = Arc::clone(&task);
        let remaining2 = Arc::clone(&remaining);
        transfer.add_completion_callback(move || {
            if remaining2.fetch_sub(1, Ordering::AcqRel) == 1 {
                finish_data_copy(&rt2, &task2, access_index, region, write_id, true);
                rt2.steps.complete(&rt2, id);
            }
        });

        wire_fragments.push(FetchFragment {
            region: fragment,
            transfer_id,
        });
        transfers.push(transfer);
    }

    // Transfers must be pending before the fetch goes out, or the reply
    // could race past them.
    rt.pending.add_vector(transfers);
    rt.send_message(
        Message::DataFetch(DataFetchMsg {
            fragments: wire_fragments,
        }),
        source_node,
        false,
    )
    .unwrap_or_else(|e| panic!("requesting data fetch: {e}"));
}

/// All fragments landed (or were elided): update the location, register
/// the version as local, and let the task resume.
fn finish_data_copy(
    rt: &Arc<Runtime>,
    task: &Arc<Task>,
    access_index: usize,
    region: MemoryRegion,
    write_id: WriteId,
    register_write_id: bool,
) {
    let this_place = rt.this_place();
    rt.deps.update_location(task, region, this_place);
    rt.directory.update_location(region, this_place);
    if register_write_id {
        rt.write_cache.register_local(write_id, region);
    }

    task.accesses()[access_index]
        .lock()
        .flags
        .remove(AccessFlags::DATA_PENDING);
    rt.resume_after_data(task);
}

// --- delayed release ------------------------------------------------------

/// Ship the delayed releases of a remotely-executed task back to its
/// offloader, one release step per access.
pub(crate) fn send_delayed_releases(
    rt: &Arc<Runtime>,
    origin: RemoteOrigin,
    accesses: &[crate::msg::FinishAccess],
) {
    for access in accesses {
        let access = *access;
        let id = rt.steps.insert_with(0, |_| {
            StepPayload::DataRelease(DataReleaseStep { origin, access })
        });
        rt.steps.start(rt, id);
    }
}

fn start_data_release(rt: &Arc<Runtime>, step: &Arc<Step>, id: StepId) {
    let (origin, access) = {
        let payload = step.payload.lock();
        let StepPayload::DataRelease(release) = &*payload else {
            unreachable!("data-release start on a non-release step");
        };
        (release.origin, release.access)
    };

    rt.send_message(
        Message::Release(crate::msg::ReleaseMsg {
            offloaded_id: origin.offloaded_id,
            region: access.region,
            read: true,
            write: true,
            write_id: access.write_id,
            location: access.location,
        }),
        origin.offloader_node,
        false,
    )
    .unwrap_or_else(|e| panic!("sending delayed release: {e}"));

    rt.steps.complete(rt, id);
}
