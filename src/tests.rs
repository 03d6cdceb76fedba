//! End-to-end scenarios over in-process clusters: single-node lifecycle,
//! two-node offload round trips, fetch elision and coalescing.

use crate::config::{ClusterConfig, DistributionPolicy};
use crate::deps::AccessMode;
use crate::ids::{MessageId, WriteId};
use crate::memory::{MemoryPlace, MemoryRegion, VirtualMemory};
use crate::msg::LoopbackCluster;
use crate::runtime::Runtime;
use crate::task::{DelayedRelease, TaskBuilder, TaskState};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const KIB: usize = 1024;

/// A generous bound for cross-thread progress in tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(20);

fn small_config() -> ClusterConfig {
    ClusterConfig::default()
        .arena_sizes(4 * 1024 * KIB, 256 * KIB)
        .max_workers(2)
}

/// Spin up a `size`-node loopback cluster sharing one address space.
/// Preinit synchronizes all nodes, so every node is built on its own
/// thread.
fn cluster(size: usize, tweak: impl Fn(ClusterConfig) -> ClusterConfig + Sync) -> Vec<Arc<Runtime>> {
    let loopback = LoopbackCluster::new(size);
    let vmm = Arc::new(VirtualMemory::initialize(&small_config()).unwrap());

    let mut runtimes: Vec<Option<Arc<Runtime>>> = (0..size).map(|_| None).collect();
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..size)
            .map(|node| {
                let loopback = Arc::clone(&loopback);
                let vmm = Arc::clone(&vmm);
                let tweak = &tweak;
                s.spawn(move || {
                    let cfg = tweak(small_config())
                        .loopback(loopback, node)
                        .shared_vmm(vmm);
                    let rt = Runtime::preinit(cfg).unwrap();
                    rt.init().unwrap();
                    rt
                })
            })
            .collect();
        for (node, handle) in handles.into_iter().enumerate() {
            runtimes[node] = Some(handle.join().unwrap());
        }
    });
    runtimes.into_iter().map(|rt| rt.unwrap()).collect()
}

fn shutdown_all(runtimes: Vec<Arc<Runtime>>) {
    std::thread::scope(|s| {
        for rt in &runtimes {
            s.spawn(move || rt.shutdown());
        }
    });
}

fn encode_region(region: MemoryRegion) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&region.start().to_ne_bytes());
    out.extend_from_slice(&region.end().to_ne_bytes());
    out
}

fn decode_region(args: &[u8]) -> MemoryRegion {
    let start = u64::from_ne_bytes(args[0..8].try_into().unwrap());
    let end = u64::from_ne_bytes(args[8..16].try_into().unwrap());
    MemoryRegion::new(start, end)
}

fn fill_body(args: &[u8]) {
    let region = decode_region(args);
    unsafe { region.as_mut_slice() }.fill(0xAB);
}

static CHECK_OK: AtomicBool = AtomicBool::new(false);

fn check_body(args: &[u8]) {
    let region = decode_region(args);
    let ok = unsafe { region.as_slice() }.iter().all(|b| *b == 0xAB);
    CHECK_OK.store(ok, Ordering::Release);
}

// --- single-node ----------------------------------------------------------

#[test]
fn test_single_node_spawn_taskwait_shutdown() {
    let rt = Runtime::preinit(small_config()).unwrap();
    rt.init().unwrap();
    assert!(!rt.in_cluster_mode());

    let region = rt
        .dmalloc(64 * KIB, DistributionPolicy::Local, &[])
        .unwrap();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let handle = {
        let rt2 = Arc::clone(&rt);
        let order = Arc::clone(&order);
        rt.spawn_function(
            move |_| {
                let (o1, o2, o3) = (Arc::clone(&order), Arc::clone(&order), Arc::clone(&order));
                rt2.spawn(
                    TaskBuilder::new(move |_| o1.lock().push("writer"))
                        .access(region, AccessMode::Write, false),
                );
                rt2.spawn(
                    TaskBuilder::new(move |_| o2.lock().push("reader-a"))
                        .access(region, AccessMode::Read, false),
                );
                rt2.spawn(
                    TaskBuilder::new(move |_| o3.lock().push("reader-b"))
                        .access(region, AccessMode::Read, false),
                );
                rt2.taskwait("children ordered by the region dependency");
                order.lock().push("after-taskwait");
            },
            "main",
        )
    };

    assert!(handle.wait_timeout(TEST_TIMEOUT), "root task never released");

    let order = order.lock().clone();
    assert_eq!(order.len(), 4);
    assert_eq!(order[0], "writer");
    assert_eq!(order[3], "after-taskwait");

    rt.dfree(region).unwrap();
    shutdown_all(vec![rt]);
}

#[test]
fn test_disable_autowait_degrades_to_no_wait() {
    let cfg = small_config().disable_autowait(true);
    let rt = Runtime::preinit(cfg).unwrap();
    rt.init().unwrap();

    let observed = Arc::new(Mutex::new(None));
    let handle = {
        let rt2 = Arc::clone(&rt);
        let observed = Arc::clone(&observed);
        rt.spawn_function(
            move |task| {
                rt2.set_early_release(DelayedRelease::AutoWait);
                *observed.lock() = Some(task.release_mode());
            },
            "autowait-probe",
        )
    };
    assert!(handle.wait_timeout(TEST_TIMEOUT));

    assert_eq!(*observed.lock(), Some(DelayedRelease::NoWait));
    shutdown_all(vec![rt]);
}

// --- two-node cluster -----------------------------------------------------

#[test]
fn test_two_node_offload_round_trip() {
    let runtimes = cluster(2, |cfg| cfg);
    let (rt0, rt1) = (&runtimes[0], &runtimes[1]);
    assert!(rt0.nodes().is_master());
    assert!(!rt1.nodes().is_master());

    // Identical registration order on both nodes.
    let fill0 = rt0.register_task_fn(fill_body);
    let fill1 = rt1.register_task_fn(fill_body);
    assert_eq!(fill0, fill1);
    let check0 = rt0.register_task_fn(check_body);
    rt1.register_task_fn(check_body);

    // Equal-block distribution: the second half is homed on node 1, so
    // tasks touching only that half offload there.
    let alloc = rt0
        .dmalloc(128 * KIB, DistributionPolicy::EqualBlocks, &[])
        .unwrap();
    let second_half = MemoryRegion::new(alloc.start() + 64 * KIB as u64, alloc.end());

    CHECK_OK.store(false, Ordering::Release);
    let writer_done = crate::runtime::WaitHandle::new();
    let writer_task = {
        let notifier = writer_done.clone();
        rt0.spawn(
            TaskBuilder::registered(fill0, encode_region(second_half))
                .access(second_half, AccessMode::Write, false)
                .completion(move || notifier.notify()),
        )
    };

    // The reader chains behind the writer through the region dependency
    // and follows it to node 1 once the location is known.
    let reader_done = crate::runtime::WaitHandle::new();
    {
        let notifier = reader_done.clone();
        rt0.spawn(
            TaskBuilder::registered(check0, encode_region(second_half))
                .access(second_half, AccessMode::Read, false)
                .completion(move || notifier.notify()),
        );
    }

    assert!(writer_done.wait_timeout(TEST_TIMEOUT), "writer never released");
    assert!(reader_done.wait_timeout(TEST_TIMEOUT), "reader never released");

    // The write happened on node 1 through the shared mapping, and the
    // reader saw it there.
    assert!(unsafe { second_half.as_slice() }.iter().all(|b| *b == 0xAB));
    assert!(CHECK_OK.load(Ordering::Acquire));

    // The offloader learned the remote location and the final state.
    assert_eq!(writer_task.state(), TaskState::Released);
    assert_eq!(
        writer_task.accesses()[0].location(),
        Some(MemoryPlace::host(1))
    );
    assert!(!writer_task.accesses()[0].write_id().is_none());
    assert_eq!(
        rt0.directory.query_location(second_half),
        MemoryPlace::host(1)
    );

    // Everything drained before shutdown.
    assert!(rt0.pending.is_empty());
    assert!(rt1.pending.is_empty());
    shutdown_all(runtimes);
}

#[test]
fn test_fetch_pulls_remote_data_and_caches_write_id() {
    let runtimes = cluster(2, |cfg| cfg.message_max_size(4 * KIB));
    let rt0 = &runtimes[0];

    let alloc = rt0
        .dmalloc(64 * KIB, DistributionPolicy::Local, &[])
        .unwrap();
    // 10000 bytes: ⌈10000/4096⌉ = 3 fragments behind a single fetch.
    let region = MemoryRegion::new(alloc.start(), alloc.start() + 10_000);
    assert_eq!(region.fragment_count(4 * KIB), 3);
    unsafe { region.as_mut_slice() }.fill(0x5A);

    // A local (closure) task on node 0 whose input sits on node 1.
    let write_id = WriteId(7_001);
    let done = crate::runtime::WaitHandle::new();
    let notifier = done.clone();
    let task = TaskBuilder::new(|_| {})
        .access(region, AccessMode::Read, false)
        .completion(move || notifier.notify())
        .build();
    {
        let mut state = task.accesses()[0].lock();
        state.location = Some(MemoryPlace::host(1));
        state.write_id = write_id;
    }

    rt0.deps
        .register_task(&task, &**rt0 as &dyn crate::deps::DependencyObserver);
    assert!(done.wait_timeout(TEST_TIMEOUT), "fetch never completed");

    // Fragments landed, the location moved here and the version is now
    // known locally, so a future consumer can skip the transfer.
    assert!(unsafe { region.as_slice() }.iter().all(|b| *b == 0x5A));
    assert_eq!(task.accesses()[0].location(), Some(MemoryPlace::host(0)));
    assert!(rt0.write_cache.check_local(write_id, region));
    assert!(rt0.pending.is_empty());

    shutdown_all(runtimes);
}

#[test]
fn test_late_write_id_match_elides_fetch() {
    let runtimes = cluster(2, |cfg| cfg);
    let rt0 = &runtimes[0];

    let alloc = rt0
        .dmalloc(64 * KIB, DistributionPolicy::Local, &[])
        .unwrap();
    let region = MemoryRegion::new(alloc.start(), alloc.start() + 8 * KIB as u64);

    // This node already holds the version the access consumes.
    let write_id = WriteId(9_001);
    rt0.write_cache.register_local(write_id, region);

    let done = crate::runtime::WaitHandle::new();
    let notifier = done.clone();
    let task = TaskBuilder::new(|_| {})
        .access(region, AccessMode::Read, false)
        .completion(move || notifier.notify())
        .build();
    {
        let mut state = task.accesses()[0].lock();
        state.location = Some(MemoryPlace::host(1));
        state.write_id = write_id;
    }

    rt0.deps
        .register_task(&task, &**rt0 as &dyn crate::deps::DependencyObserver);

    // The second chance hit: zero transfers were ever issued, only the
    // location was fixed up.
    assert!(rt0.pending.is_empty());
    assert!(done.wait_timeout(TEST_TIMEOUT), "elided fetch never resumed");
    assert_eq!(task.accesses()[0].location(), Some(MemoryPlace::host(0)));

    shutdown_all(runtimes);
}

#[test]
fn test_fetch_coalesces_with_pending_transfer() {
    let runtimes = cluster(2, |cfg| cfg);
    let rt0 = &runtimes[0];

    let alloc = rt0
        .dmalloc(64 * KIB, DistributionPolicy::Local, &[])
        .unwrap();
    let outer = MemoryRegion::new(alloc.start(), alloc.start() + 16 * KIB as u64);
    let inner = MemoryRegion::new(alloc.start() + 4 * KIB as u64, alloc.start() + 8 * KIB as u64);

    // A transfer fully containing the region is already in flight
    // towards this node.
    let in_flight = MessageId(999_001);
    rt0.inject_pending_transfer(in_flight, outer, MemoryPlace::host(1));

    let done = crate::runtime::WaitHandle::new();
    let notifier = done.clone();
    let task = TaskBuilder::new(|_| {})
        .access(inner, AccessMode::Read, false)
        .completion(move || notifier.notify())
        .build();
    task.accesses()[0].lock().location = Some(MemoryPlace::host(1));

    rt0.deps
        .register_task(&task, &**rt0 as &dyn crate::deps::DependencyObserver);

    // No second fetch was issued: the step piggy-backed on the pending
    // transfer and the task parked waiting for it.
    assert_eq!(rt0.pending.len(), 1);
    assert_eq!(task.state(), TaskState::Blocked);
    assert!(!done.is_done());

    // The containing transfer lands; the piggy-backed callback resumes
    // the task.
    rt0.pending.complete(in_flight).unwrap();
    assert!(done.wait_timeout(TEST_TIMEOUT), "coalesced fetch never resumed");
    assert!(rt0.pending.is_empty());

    shutdown_all(runtimes);
}
