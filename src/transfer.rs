use crate::ids::MessageId;
use crate::memory::{MemoryPlace, MemoryRegion};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

type Callback = Box<dyn FnOnce() + Send>;

/// One in-flight data movement between two nodes, keyed by the message id
/// of the fragment that will complete it. Interested parties chain
/// completion callbacks onto it; they all run, in registration order,
/// when the transfer lands.
pub struct DataTransfer {
    id: MessageId,
    region: MemoryRegion,
    source: MemoryPlace,
    target: MemoryPlace,
    completed: AtomicBool,
    callbacks: Mutex<Vec<Callback>>,
}

impl DataTransfer {
    pub fn new(
        id: MessageId,
        region: MemoryRegion,
        source: MemoryPlace,
        target: MemoryPlace,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            region,
            source,
            target,
            completed: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn region(&self) -> MemoryRegion {
        self.region
    }

    pub fn source(&self) -> MemoryPlace {
        self.source
    }

    pub fn target(&self) -> MemoryPlace {
        self.target
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Piggy-back on this transfer. Panics if it already completed; the
    /// pending queue only exposes live transfers under its lock, which is
    /// what rules that out.
    pub fn add_completion_callback(&self, cb: impl FnOnce() + Send + 'static) {
        assert!(
            !self.is_completed(),
            "callback added to a completed transfer"
        );
        self.callbacks.lock().push(Box::new(cb));
    }

    fn run_callbacks(&self) {
        self.completed.store(true, Ordering::Release);
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for cb in callbacks {
            cb();
        }
    }
}

impl std::fmt::Debug for DataTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataTransfer")
            .field("id", &self.id)
            .field("region", &self.region)
            .field("source", &self.source)
            .field("target", &self.target)
            .field("completed", &self.is_completed())
            .finish_non_exhaustive()
    }
}

/// The locked list of in-flight transfers.
///
/// `check_pending` is the coalescing hook: a fetch step about to issue a
/// transfer scans here first and piggy-backs on a pending one that fully
/// contains its region. The scan holds the queue lock, so predicates must
/// not take registry locks; completion callbacks always run outside it.
#[derive(Debug, Default)]
pub struct PendingTransferQueue {
    inner: Mutex<Vec<Arc<DataTransfer>>>,
}

impl PendingTransferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, transfer: Arc<DataTransfer>) {
        self.inner.lock().push(transfer);
    }

    /// Register a whole batch atomically, before the fetch message that
    /// references them goes out.
    pub fn add_vector(&self, transfers: impl IntoIterator<Item = Arc<DataTransfer>>) {
        self.inner.lock().extend(transfers);
    }

    /// Scan the queue under the lock, invoking `predicate` on each entry;
    /// scanning stops at the first entry for which it returns true.
    /// Returns whether any entry matched.
    pub fn check_pending(&self, mut predicate: impl FnMut(&Arc<DataTransfer>) -> bool) -> bool {
        let inner = self.inner.lock();
        inner.iter().any(|t| predicate(t))
    }

    /// A fragment landed: remove the matching transfer and run its
    /// callback chain outside the queue lock. Returns the transfer, or
    /// None for an id nothing is waiting on.
    pub fn complete(&self, id: MessageId) -> Option<Arc<DataTransfer>> {
        let transfer = {
            let mut inner = self.inner.lock();
            let pos = inner.iter().position(|t| t.id() == id)?;
            inner.swap_remove(pos)
        };
        transfer.run_callbacks();
        Some(transfer)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
