mod worker;

pub use worker::WaitHandle;

use crate::config::{ClusterConfig, DistributionPolicy};
use crate::cpu::{ComputePlace, CpuManager};
use crate::deps::{DependencyObserver, DependencyRegistry};
use crate::ids::{IdServices, OffloadedTaskId, WriteIdCache};
use crate::memory::{Directory, MemoryPlace, MemoryRegion, VirtualMemory};
use crate::msg::{Envelope, Message, Messenger};
use crate::node::NodeRegistry;
use crate::report::RuntimeInfo;
use crate::scheduler::{ReadyTaskHint, Scheduler, SchedulingDecision};
use crate::task::{
    DelayedRelease, Task, TaskBuilder, TaskFn, TaskFnRegistry, TaskState,
};
use crate::transfer::PendingTransferQueue;
use crate::workflow::StepArena;
use anyhow::{Context, Result, anyhow};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

/// Offloader-side record of a task sent to a peer.
#[derive(Debug)]
pub(crate) struct OffloadedTaskInfo {
    pub task: Arc<Task>,
    pub remote_node: usize,
    /// Link step per access, while satisfiability is still flowing.
    pub link_steps: Vec<Option<crate::workflow::StepId>>,
    pub execution_step: crate::workflow::StepId,
    pub notification_step: crate::workflow::StepId,
    /// Accesses already released back into the local dependency DAG.
    pub released_accesses: Vec<bool>,
}

/// Record of a task this node executes on behalf of a peer.
#[derive(Debug)]
pub(crate) struct RemoteTaskInfo {
    pub task: Arc<Task>,
    pub offloader: usize,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Preinitialized = 0,
    Running = 1,
    ShuttingDown = 2,
    Down = 3,
}

/// The runtime: every service of the node, owned explicitly and handed
/// around by reference. One instance per process in normal use, but
/// nothing enforces it — tests run several "nodes" side by side.
pub struct Runtime {
    pub(crate) cfg: ClusterConfig,
    pub(crate) nodes: NodeRegistry,
    pub(crate) messenger: Option<Arc<dyn Messenger>>,
    pub(crate) ids: IdServices,
    pub(crate) write_cache: WriteIdCache,
    pub(crate) vmm: Arc<VirtualMemory>,
    pub(crate) directory: Directory,
    pub(crate) deps: DependencyRegistry,
    pub(crate) pending: PendingTransferQueue,
    pub(crate) steps: StepArena,
    pub(crate) offloaded: DashMap<OffloadedTaskId, OffloadedTaskInfo>,
    pub(crate) remote: DashMap<OffloadedTaskId, RemoteTaskInfo>,
    pub(crate) task_fns: TaskFnRegistry,
    pub(crate) scheduler: Scheduler,
    pub(crate) cpus: Arc<CpuManager>,
    pub(crate) info: RuntimeInfo,
    pub(crate) polling: Mutex<Option<crate::polling::PollingServices>>,
    pub(crate) shutdown_flag: Arc<AtomicBool>,
    /// Set by the polling loop when the master's SysFinish arrives.
    pub(crate) sys_finish_seen: Arc<AtomicBool>,
    /// Shutdown callback installed when the namespace is disabled (or the
    /// namespace notification when it is enabled).
    pub(crate) shutdown_callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    /// Per-destination id of the last task offloaded there; the remote
    /// namespace uses it to chain siblings.
    pub(crate) last_offloaded: Mutex<Vec<u64>>,
    phase: AtomicU8,
    self_ref: OnceLock<Weak<Runtime>>,
}

impl Runtime {
    /// First lifecycle phase: messenger, node registry and id services,
    /// then the address space and CPU table. No threads run yet.
    pub fn preinit(cfg: ClusterConfig) -> Result<Arc<Runtime>> {
        cfg.validate()?;

        let info = RuntimeInfo::new();
        info.add_string(
            "cluster_communication",
            cfg.communication.clone(),
            "Cluster Communication Implementation",
        );

        let (messenger, nodes) = if cfg.communication == "disabled" {
            (None, NodeRegistry::single_node())
        } else {
            let msn = crate::msg::create_messenger(&cfg)
                .context("initializing the cluster messenger")?;
            let nodes = NodeRegistry::from_messenger(msn.as_ref());
            (Some(msn), nodes)
        };

        let ids = IdServices::new();
        ids.initialize(nodes.this_index(), nodes.size());

        let vmm = match &cfg.shared_vmm {
            Some(shared) => Arc::clone(shared),
            None => Arc::new(VirtualMemory::initialize(&cfg)?),
        };
        let cpus = Arc::new(CpuManager::preinitialize(&cfg, &info)?);
        info.add_long(
            "total_cpus",
            cpus.total_cpus() as i64,
            "cpus",
            "Admitted CPUs",
        );

        let directory = Directory::new(nodes.this_index(), nodes.size());
        let scheduler = Scheduler::new(Arc::clone(&cpus));
        let write_cache = WriteIdCache::new(cfg.write_id_cache_capacity);
        let cluster_size = nodes.size();

        let rt = Arc::new(Runtime {
            cfg,
            nodes,
            messenger,
            ids,
            write_cache,
            vmm,
            directory,
            deps: DependencyRegistry::new(),
            pending: PendingTransferQueue::new(),
            steps: StepArena::new(),
            offloaded: DashMap::new(),
            remote: DashMap::new(),
            task_fns: TaskFnRegistry::new(),
            scheduler,
            cpus,
            info,
            polling: Mutex::new(None),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            sys_finish_seen: Arc::new(AtomicBool::new(false)),
            shutdown_callback: Mutex::new(None),
            last_offloaded: Mutex::new(vec![0; cluster_size]),
            phase: AtomicU8::new(Phase::Preinitialized as u8),
            self_ref: OnceLock::new(),
        });
        rt.self_ref
            .set(Arc::downgrade(&rt))
            .expect("self reference set twice");

        if let Some(msn) = &rt.messenger {
            msn.synchronize_all();
        }
        Ok(rt)
    }

    /// Second lifecycle phase: spawn the bound worker threads and, in
    /// cluster mode, the polling services.
    pub fn init(self: &Arc<Runtime>) -> Result<()> {
        anyhow::ensure!(
            self.phase() == Phase::Preinitialized,
            "init called out of order"
        );

        worker::spawn_workers(self)?;

        if self.nodes.in_cluster_mode() {
            let services = crate::polling::PollingServices::start(self)?;
            *self.polling.lock() = Some(services);
        }

        self.phase.store(Phase::Running as u8, Ordering::Release);
        Ok(())
    }

    fn phase(&self) -> Phase {
        match self.phase.load(Ordering::Acquire) {
            0 => Phase::Preinitialized,
            1 => Phase::Running,
            2 => Phase::ShuttingDown,
            _ => Phase::Down,
        }
    }

    pub(crate) fn arc(&self) -> Arc<Runtime> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("runtime already dropped")
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.cfg
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    pub fn runtime_info(&self) -> &RuntimeInfo {
        &self.info
    }

    pub fn in_cluster_mode(&self) -> bool {
        self.nodes.in_cluster_mode()
    }

    /// Register an offloadable task function. Must happen in the same
    /// order on every node, before any spawn that uses it.
    pub fn register_task_fn(&self, f: TaskFn) -> u64 {
        self.task_fns.register(f)
    }

    // --- spawning and waiting ---

    /// Submit a built task: attach the calling task as parent when none
    /// was set, register its accesses, and let the dependency system
    /// decide when it is ready.
    pub fn spawn(self: &Arc<Runtime>, mut builder: TaskBuilder) -> Arc<Task> {
        // An explicit parent wins; otherwise the calling task adopts.
        if !builder.has_parent()
            && let Some(current) = crate::cpu::current_task()
        {
            builder = builder.parent(current);
        }
        let task = builder.build();
        tracing::trace!(task = %task.id(), "spawned");
        self.deps.register_task(&task, &**self as &dyn DependencyObserver);
        task
    }

    /// Spawn the root task: a function plus a completion callback fired
    /// once the task (and its children) fully released. Returns a handle
    /// the bootstrap can block on.
    pub fn spawn_function(
        self: &Arc<Runtime>,
        body: impl FnOnce(&Task) + Send + 'static,
        name: &str,
    ) -> WaitHandle {
        let handle = WaitHandle::new();
        let notifier = handle.clone();
        self.spawn(
            TaskBuilder::new(body)
                .named(name)
                .completion(move || notifier.notify()),
        );
        handle
    }

    /// Suspend the calling task until all of its children released. The
    /// worker keeps running other tasks in the meantime.
    pub fn taskwait(self: &Arc<Runtime>, reason: &str) {
        let Some(task) = crate::cpu::current_task() else {
            return;
        };
        tracing::trace!(task = %task.id(), reason, "taskwait");

        if task.live_children() == 0 {
            return;
        }
        task.transition(TaskState::Executing, TaskState::Blocked);

        // Advertise for a direct hand-off instead of going fully idle;
        // the scheduler fills the slot and skips the queues.
        let cpu = crate::cpu::current_cpu();
        if let Some(cpu) = cpu {
            self.scheduler.request_polling(cpu);
        }

        loop {
            if task.live_children() == 0 {
                break;
            }
            // Help drain the queues; only actually block when idle.
            if !worker::run_one_local_task(self) {
                task.wait_for_children(Duration::from_millis(1));
            }
        }

        if let Some(cpu) = cpu {
            self.scheduler.release_polling(cpu);
        }
        task.transition(TaskState::Blocked, TaskState::Executing);
    }

    /// Change the calling task's release discipline.
    /// `cluster.disable_autowait` degrades autowait to no-wait.
    pub fn set_early_release(&self, mode: DelayedRelease) {
        let Some(task) = crate::cpu::current_task() else {
            return;
        };
        let effective = match mode {
            DelayedRelease::AutoWait if self.cfg.disable_autowait => DelayedRelease::NoWait,
            other => other,
        };
        task.set_release_mode(effective);
    }

    // --- memory API ---

    /// Cluster-wide allocation: carve from the distributed arena,
    /// register the home-node partition, and tell the peers.
    pub fn dmalloc(
        &self,
        size: usize,
        policy: DistributionPolicy,
        dims: &[u64],
    ) -> Result<MemoryRegion> {
        let region = self.vmm.alloc_distributed(size)?;
        self.directory
            .register_allocation(region, policy, dims, self.nodes.this_index());

        self.broadcast(Message::Dmalloc(crate::msg::DmallocMsg {
            region,
            policy: policy.as_u8(),
            dims: dims.to_vec(),
            allocating_node: self.nodes.this_index() as u64,
        }))?;
        Ok(region)
    }

    pub fn dfree(&self, region: MemoryRegion) -> Result<()> {
        self.directory.unregister_allocation(region)?;
        self.vmm.free_distributed(region);
        self.broadcast(Message::Dfree(crate::msg::DfreeMsg { region }))?;
        Ok(())
    }

    /// Node-local allocation on the calling CPU's NUMA node.
    pub fn lmalloc(&self, size: usize) -> Result<MemoryRegion> {
        let numa = crate::cpu::current_cpu()
            .map(|cpu| self.cpus.numa_node_of(cpu))
            .unwrap_or(0);
        self.vmm.alloc_local(size, numa)
    }

    pub fn lfree(&self, region: MemoryRegion) {
        let numa = crate::cpu::current_cpu()
            .map(|cpu| self.cpus.numa_node_of(cpu))
            .unwrap_or(0);
        self.vmm.free_local(region, numa);
    }

    // --- messaging helpers ---

    pub(crate) fn send_message(&self, body: Message, dest: usize, blocking: bool) -> Result<()> {
        let msn = self
            .messenger
            .as_ref()
            .ok_or_else(|| anyhow!("send in single-node mode"))?;
        let env = Envelope::new(self.ids.next_message_id(), self.nodes.this_index(), body);
        tracing::trace!(kind = ?env.body.kind(), dest, "send");
        msn.send(&env, dest, blocking)
    }

    fn broadcast(&self, body: Message) -> Result<()> {
        if !self.nodes.in_cluster_mode() {
            return Ok(());
        }
        for node in self.nodes.iter() {
            if node.index() != self.nodes.this_index() {
                self.send_message(body.clone(), node.index(), false)?;
            }
        }
        Ok(())
    }

    pub(crate) fn this_place(&self) -> MemoryPlace {
        MemoryPlace::host(self.nodes.this_index())
    }

    // --- execution ---

    /// Run one task body to completion on the calling worker thread.
    pub(crate) fn execute_task(self: &Arc<Runtime>, task: Arc<Task>) {
        if !task.transition(TaskState::Ready, TaskState::Executing) {
            // Lost a race with shutdown draining; drop it.
            return;
        }

        crate::cpu::with_task_frame(&task, || match task.take_body() {
            Some(crate::task::TaskBody::Closure(body)) => body(&task),
            Some(crate::task::TaskBody::Registered { task_fn, args }) => {
                let Some(f) = self.task_fns.get(task_fn) else {
                    panic!("task references unregistered function {task_fn}");
                };
                f(&args)
            }
            None => panic!("task {} executed twice", task.id()),
        });

        self.finish_task(&task);
    }

    /// The body finished: stamp versions, decide per-access delayed
    /// release, report to the offloader if we ran this for a peer.
    fn finish_task(self: &Arc<Runtime>, task: &Arc<Task>) {
        assert!(task.transition(TaskState::Executing, TaskState::Finished));

        let this_place = self.this_place();
        let remote_origin = task.remote_origin();
        let delay_all = match task.release_mode() {
            DelayedRelease::NoWait => false,
            DelayedRelease::Wait => true,
            // Autowait delays the non-local accesses; everything a peer
            // sent us is non-local.
            DelayedRelease::AutoWait => remote_origin.is_some(),
        };

        let mut finish_accesses = Vec::new();
        for (index, access) in task.accesses().iter().enumerate() {
            if access.mode().writes() && !access.is_weak() {
                let write_id = self.ids.next_write_id();
                {
                    let mut state = access.lock();
                    state.write_id = write_id;
                    state.location = Some(this_place);
                }
                self.write_cache.register_local(write_id, access.region());
                self.directory.update_location(access.region(), this_place);
            } else if access.location().is_none() {
                access.set_location(this_place);
            }

            let can_merge = task.live_children() == 0 && self.cfg.merge_release_and_finish;
            if delay_all && !can_merge {
                task.push_delayed(index);
            } else {
                self.release_task_access(task, index, &mut finish_accesses, remote_origin);
            }
        }

        if let Some(origin) = remote_origin {
            // Eager send pushes freshly-written data ahead of the finish
            // report, so the offloader holds the bytes by the time the
            // release propagates.
            if self.cfg.eager_send {
                for access in task.accesses() {
                    if !access.mode().writes() || access.is_weak() {
                        continue;
                    }
                    let region = access.region();
                    // Safety: this task was the last writer and nothing
                    // reads the region until the release lands.
                    let bytes = unsafe { region.as_slice() }.to_vec();
                    self.send_message(
                        Message::DataSend(crate::msg::DataSendMsg {
                            transfer_id: self.ids.next_message_id(),
                            region,
                            bytes,
                        }),
                        origin.offloader_node,
                        false,
                    )
                    .unwrap_or_else(|e| panic!("eager send: {e}"));
                }
            }

            self.send_message(
                Message::TaskFinish(crate::msg::TaskFinishMsg {
                    offloaded_id: origin.offloaded_id,
                    accesses: finish_accesses,
                }),
                origin.offloader_node,
                false,
            )
            .unwrap_or_else(|e| panic!("reporting task finish: {e}"));
        }

        // Without children the delayed set can go out right away (as
        // separate Release messages when merging is off).
        if task.live_children() == 0 && !task.delayed_is_empty() {
            self.release_delayed(task);
        }

        self.try_finalize_release(task);
    }

    /// Release one completed access: propagate locally, feed the
    /// namespace, and record it for the TaskFinish report when executing
    /// for a peer.
    fn release_task_access(
        self: &Arc<Runtime>,
        task: &Arc<Task>,
        index: usize,
        finish_accesses: &mut Vec<crate::msg::FinishAccess>,
        remote_origin: Option<crate::task::RemoteOrigin>,
    ) {
        let access = &task.accesses()[index];
        let (region, write_id, location) =
            (access.region(), access.write_id(), access.location());

        self.deps
            .release_access(task, index, &**self as &dyn DependencyObserver);

        if let Some(origin) = remote_origin {
            finish_accesses.push(crate::msg::FinishAccess {
                region,
                write_id,
                location,
            });
            // In-namespace propagation to siblings, unless remote
            // propagation was configured off.
            if self.cfg.use_namespace && !self.cfg.disable_remote {
                self.namespace_propagate(origin.offloader_node, region, write_id, location);
            }
        }
    }

    /// Remote-namespace propagation: hand read satisfiability straight
    /// to sibling tasks offloaded here by the same peer, without a round
    /// trip through the offloader.
    ///
    /// Only accesses expecting exactly this version are touched: the
    /// write id names the region's content version cluster-wide, so a
    /// match proves the sibling consumes what was just released. Write
    /// satisfiability always comes from the offloader, which is the only
    /// side that sees the whole dependency DAG.
    fn namespace_propagate(
        self: &Arc<Runtime>,
        offloader: usize,
        region: MemoryRegion,
        write_id: crate::ids::WriteId,
        location: Option<MemoryPlace>,
    ) {
        if write_id.is_none() {
            return;
        }

        // Collect first: the satisfiability application re-enters the
        // scheduler and must not run under the map's shard locks.
        let siblings: Vec<Arc<Task>> = self
            .remote
            .iter()
            .filter(|entry| entry.offloader == offloader)
            .map(|entry| Arc::clone(&entry.task))
            .collect();

        for sibling in siblings {
            if sibling.state() != TaskState::Created {
                continue;
            }
            for access in sibling.accesses() {
                if !access.region().intersects(&region) || access.write_id() != write_id {
                    continue;
                }
                self.deps.apply_satisfiability(
                    &sibling,
                    access.region(),
                    true,
                    false,
                    write_id,
                    location,
                    &**self as &dyn DependencyObserver,
                );
            }
        }
    }

    /// Delayed releases that waited for the children; runs when the last
    /// child releases.
    pub(crate) fn release_delayed(self: &Arc<Runtime>, task: &Arc<Task>) {
        let delayed = task.take_delayed();
        if delayed.is_empty() {
            return;
        }

        let remote_origin = task.remote_origin();
        let mut released = Vec::new();
        for index in delayed {
            self.release_task_access(task, index, &mut released, remote_origin);
        }

        if let Some(origin) = remote_origin {
            crate::workflow::send_delayed_releases(self, origin, &released);
        }
        self.try_finalize_release(task);
    }

    /// Finished → Released once every access released; cascades to the
    /// parent and fires the completion callback.
    pub(crate) fn try_finalize_release(self: &Arc<Runtime>, task: &Arc<Task>) {
        use crate::deps::AccessFlags;

        if task.state() != TaskState::Finished {
            return;
        }
        // A task outlives its children: the last child release re-enters
        // here through the parent cascade.
        if task.live_children() > 0 {
            return;
        }
        let all_released = task
            .accesses()
            .iter()
            .all(|a| a.flags().contains(AccessFlags::RELEASED) || a.is_weak());
        if !all_released || !task.delayed_is_empty() {
            return;
        }
        if !task.transition(TaskState::Finished, TaskState::Released) {
            return;
        }
        tracing::trace!(task = %task.id(), "released");

        if let Some(origin) = task.remote_origin() {
            self.remote.remove(&origin.offloaded_id);
        }
        if let Some(cb) = task.take_completion() {
            cb();
        }
        if let Some(parent) = task.parent() {
            if parent.child_released() {
                self.handle_children_drained(parent);
            }
        }
    }

    /// A fetch landed: if the task was parked waiting on data and has
    /// everything it needs now, put it back on the ready path.
    pub(crate) fn resume_after_data(self: &Arc<Runtime>, task: &Arc<Task>) {
        if task.state() != TaskState::Blocked {
            return;
        }
        if !task.accesses().iter().all(|a| a.satisfied_for_mode()) {
            return;
        }
        if !task.transition(TaskState::Blocked, TaskState::Ready) {
            return;
        }
        let origin = crate::cpu::current_cpu().map(ComputePlace::Cpu);
        self.scheduler
            .add_ready_task(Arc::clone(task), origin, ReadyTaskHint::Unblocked);
    }

    pub(crate) fn handle_children_drained(self: &Arc<Runtime>, parent: &Arc<Task>) {
        if parent.state() == TaskState::Finished {
            self.release_delayed(parent);
            self.try_finalize_release(parent);
        }
    }

    // --- shutdown ---

    /// Install the callback run when the cluster winds down (or notify
    /// the namespace instead, when enabled).
    pub fn set_shutdown_callback(&self, cb: impl FnOnce() + Send + 'static) {
        *self.shutdown_callback.lock() = Some(Box::new(cb));
    }

    /// Orderly two-phase shutdown of the node.
    pub fn shutdown(self: &Arc<Runtime>) {
        if self.phase() != Phase::Running && self.phase() != Phase::Preinitialized {
            return;
        }
        self.phase.store(Phase::ShuttingDown as u8, Ordering::Release);

        self.shutdown_phase1();
        self.shutdown_phase2();
        self.phase.store(Phase::Down as u8, Ordering::Release);
    }

    fn shutdown_phase1(self: &Arc<Runtime>) {
        // Master drives the wind-down: namespace/shutdown callback first,
        // then the SysFinish fan-out.
        if self.nodes.is_master() {
            if let Some(cb) = self.shutdown_callback.lock().take() {
                cb();
            }
        }

        if self.nodes.in_cluster_mode() {
            if self.nodes.is_master() {
                for node in self.nodes.iter() {
                    if node.index() != self.nodes.this_index() {
                        self.send_message(Message::SysFinish, node.index(), true)
                            .unwrap_or_else(|e| panic!("sending SysFinish: {e}"));
                    }
                }
            } else {
                // Slaves keep polling until the master says stop.
                while !self.sys_finish_seen.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }

            if let Some(msn) = &self.messenger {
                msn.synchronize_all();
            }
        }

        // Stop polling services and drain what is left in flight.
        if let Some(services) = self.polling.lock().take() {
            services.shutdown();
        }
        assert!(
            self.pending.is_empty(),
            "pending transfers survived shutdown"
        );

        // Stop the workers; after the join no task is executing.
        self.shutdown_flag.store(true, Ordering::Release);
        self.cpus.wake_all();
        self.cpus.join_workers();

        if let Some(msn) = &self.messenger {
            msn.shutdown();
        }
    }

    fn shutdown_phase2(self: &Arc<Runtime>) {
        self.offloaded.clear();
        self.remote.clear();
        self.info.maybe_print_report();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("node", &self.nodes.this_index())
            .field("cluster_size", &self.nodes.size())
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

/// The dependency system talks back to the runtime through this surface:
/// readiness feeds the scheduler (and the locality decision), and
/// satisfiability gained after an offload flows on to the remote copy.
impl DependencyObserver for Runtime {
    fn task_became_ready(&self, task: Arc<Task>) {
        let rt = self.arc();

        match crate::scheduler::decide(&task, &rt.nodes, &rt.vmm, &rt.directory) {
            SchedulingDecision::Offload(node) => {
                crate::workflow::offload_task(&rt, task, node);
            }
            SchedulingDecision::RunHere => {
                if crate::workflow::build_local_fetches(&rt, &task) {
                    // Fetches are in flight; the task re-enters through
                    // resume_after_data.
                    return;
                }
                let origin = crate::cpu::current_cpu().map(ComputePlace::Cpu);
                rt.scheduler
                    .add_ready_task(task, origin, ReadyTaskHint::Unblocked);
            }
        }
    }

    fn access_satisfied(&self, task: &Arc<Task>, access_index: usize, read: bool, write: bool) {
        if task.cluster_context().is_some() {
            let rt = self.arc();
            crate::workflow::link_region(&rt, task, access_index, read, write);
        }
    }
}
