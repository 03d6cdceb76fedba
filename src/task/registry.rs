use parking_lot::RwLock;

/// Body of an offloadable task. Takes the opaque argument bytes that
/// travelled with the `TaskNew` message.
pub type TaskFn = fn(&[u8]);

/// Static table of offloadable task functions.
///
/// Function pointers do not travel over the wire; instead every node of
/// the (SPMD) cluster registers the same functions in the same order at
/// startup and tasks reference them by table index. Index 0 is reserved
/// so a zero on the wire always means "no registered body".
#[derive(Debug, Default)]
pub struct TaskFnRegistry {
    fns: RwLock<Vec<TaskFn>>,
}

impl TaskFnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function and return its wire id. Registration order
    /// must match on every node.
    pub fn register(&self, f: TaskFn) -> u64 {
        let mut fns = self.fns.write();
        fns.push(f);
        fns.len() as u64
    }

    pub fn get(&self, id: u64) -> Option<TaskFn> {
        if id == 0 {
            return None;
        }
        self.fns.read().get(id as usize - 1).copied()
    }

    pub fn len(&self) -> usize {
        self.fns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
