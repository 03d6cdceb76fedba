//! The polling subsystem: drains the messenger and drives in-flight
//! transfers between worker activity. Deployed either as dedicated
//! threads or as long-lived internal tasks, per configuration.

use crate::runtime::Runtime;
use crate::task::TaskBuilder;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Idle backoff between empty polls. Bounded so shutdown and barrier
/// progress are never stuck behind a sleeping poller.
const POLL_BACKOFF: Duration = Duration::from_micros(200);

/// Handle to the running polling services of a node.
#[derive(Debug)]
pub struct PollingServices {
    stop: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    threads: Vec<JoinHandle<()>>,
    task_handles: Vec<crate::runtime::WaitHandle>,
}

impl PollingServices {
    /// Start the configured number of message handler workers, as
    /// dedicated threads or internal tasks.
    pub(crate) fn start(rt: &Arc<Runtime>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicUsize::new(0));
        let workers = rt.cfg.num_message_handler_workers;

        let mut threads = Vec::new();
        let mut task_handles = Vec::new();

        if rt.cfg.services_in_task {
            for i in 0..workers {
                let rt2 = Arc::clone(rt);
                let stop2 = Arc::clone(&stop);
                let active2 = Arc::clone(&active);
                let handle = crate::runtime::WaitHandle::new();
                let notifier = handle.clone();
                rt.spawn(
                    TaskBuilder::new(move |_| polling_loop(&rt2, &stop2, &active2))
                        .named(format!("message-handler-{i}"))
                        .completion(move || notifier.notify()),
                );
                task_handles.push(handle);
            }
        } else {
            for i in 0..workers {
                let rt2 = Arc::clone(rt);
                let stop2 = Arc::clone(&stop);
                let active2 = Arc::clone(&active);
                let handle = std::thread::Builder::new()
                    .name(format!("distrun-msg-{i}"))
                    .spawn(move || polling_loop(&rt2, &stop2, &active2))
                    .context("spawning polling service thread")?;
                threads.push(handle);
            }
        }

        Ok(Self {
            stop,
            active,
            threads,
            task_handles,
        })
    }

    pub fn active_services(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Stop accepting new work, drain to empty and join every service.
    pub(crate) fn shutdown(self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.threads {
            if handle.join().is_err() {
                tracing::warn!("polling service panicked during shutdown");
            }
        }
        for handle in self.task_handles {
            handle.wait();
        }
        assert_eq!(self.active.load(Ordering::Acquire), 0);
    }
}

/// The service loop: drain the messenger, dispatch, back off briefly
/// when idle. On stop, keeps going until both the messenger and the
/// pending-transfer queue are drained.
fn polling_loop(rt: &Arc<Runtime>, stop: &AtomicBool, active: &AtomicUsize) {
    active.fetch_add(1, Ordering::AcqRel);
    let messenger = rt
        .messenger
        .as_ref()
        .expect("polling services without a messenger")
        .clone();

    loop {
        let mut progressed = false;
        while let Some(env) = messenger.receive() {
            rt.handle_message(env);
            progressed = true;
        }

        if stop.load(Ordering::Acquire) && !progressed && rt.pending.is_empty() {
            break;
        }
        if !progressed {
            std::thread::sleep(POLL_BACKOFF);
        }
    }

    active.fetch_sub(1, Ordering::AcqRel);
}
