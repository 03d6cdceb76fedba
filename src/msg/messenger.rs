use crate::config::ClusterConfig;
use crate::msg::Envelope;
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// The reliable typed message channel of the cluster.
///
/// Contract: per (source, destination) delivery is in order; `send` with
/// `blocking` returns only after remote acceptance; `receive` is a
/// non-blocking poll; `synchronize_all` is a full-cluster barrier.
pub trait Messenger: Send + Sync + std::fmt::Debug {
    fn cluster_size(&self) -> usize;

    fn node_index(&self) -> usize;

    fn master_index(&self) -> usize;

    fn send(&self, env: &Envelope, dest: usize, blocking: bool) -> Result<()>;

    fn receive(&self) -> Option<Envelope>;

    fn synchronize_all(&self);

    /// Drain and close. No sends or receives after this returns.
    fn shutdown(&self);
}

type Factory = fn(&ClusterConfig) -> Result<Arc<dyn Messenger>>;

fn registry() -> &'static Mutex<HashMap<&'static str, Factory>> {
    static REGISTRY: OnceLock<Mutex<HashMap<&'static str, Factory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut table: HashMap<&'static str, Factory> = HashMap::new();
        table.insert("loopback", crate::msg::loopback::factory);
        Mutex::new(table)
    })
}

/// Register a messenger backend under a config name. In-tree backends are
/// pre-registered; out-of-tree transports hook in here before
/// `Runtime::preinit`.
pub fn register_backend(name: &'static str, factory: Factory) {
    registry().lock().insert(name, factory);
}

/// Instantiate the backend named by `cluster.communication`. `"disabled"`
/// is handled by the caller and never reaches this point.
pub fn create_messenger(cfg: &ClusterConfig) -> Result<Arc<dyn Messenger>> {
    debug_assert_ne!(cfg.communication, "disabled");

    let factory = registry()
        .lock()
        .get(cfg.communication.as_str())
        .copied()
        .ok_or_else(|| anyhow!("unknown messenger backend {:?}", cfg.communication))?;

    factory(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_backend_is_an_error() {
        let cfg = ClusterConfig::default().communication("no-such-backend");
        assert!(create_messenger(&cfg).is_err());
    }
}
