use anyhow::{Result, anyhow};
use std::env;
use std::sync::Arc;

/// Default fragmentation threshold for data transfers, in bytes.
const DEFAULT_MESSAGE_MAX_SIZE: usize = 64 * 1024;

/// Default size of the distributed arena reserved at init.
const DEFAULT_DISTRIBUTED_ARENA_SIZE: usize = 256 * 1024 * 1024;

/// Default size of each NUMA-local arena reserved at init.
const DEFAULT_LOCAL_ARENA_SIZE: usize = 64 * 1024 * 1024;

/// Capacity of the local write-id cache. Entries past this are evicted
/// in LRU order.
const DEFAULT_WRITE_ID_CACHE_CAPACITY: usize = 8192;

/// Distribution policy for cluster-wide allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributionPolicy {
    /// Split the region into equal-size blocks, one per node.
    EqualBlocks,
    /// The whole region is homed on the allocating node.
    Local,
    /// Blocks of `dims[0]` bytes assigned to nodes round-robin.
    Cyclic,
}

impl DistributionPolicy {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            DistributionPolicy::EqualBlocks => 0,
            DistributionPolicy::Local => 1,
            DistributionPolicy::Cyclic => 2,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(DistributionPolicy::EqualBlocks),
            1 => Ok(DistributionPolicy::Local),
            2 => Ok(DistributionPolicy::Cyclic),
            other => Err(anyhow!("unknown distribution policy discriminant {other}")),
        }
    }
}

/// All cluster-facing knobs, resolved once at startup.
///
/// Values come from `DISTRUN_*` environment variables with the defaults
/// below; tests override them through the builder-style setters instead
/// of touching the process environment.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Messenger backend name. `"disabled"` forces single-node mode.
    pub communication: String,

    /// Run the polling loops as internal tasks instead of dedicated threads.
    pub services_in_task: bool,

    /// Number of message handler workers (threads or internal tasks).
    pub num_message_handler_workers: usize,

    /// Enable in-namespace satisfiability propagation between sibling
    /// offloaded tasks.
    pub use_namespace: bool,

    /// (namespace only) Disable remote satisfiability propagation.
    pub disable_remote: bool,

    /// (namespace only) Disable remote connection setup.
    pub disable_remote_connect: bool,

    /// Force `autowait` release mode down to `no_wait`.
    pub disable_autowait: bool,

    /// Transfers larger than this are fragmented so each fragment fits in
    /// one message.
    pub message_max_size: usize,

    /// Fetch weak accesses eagerly at offload time.
    pub eager_weak_fetch: bool,

    /// Push newly-produced data instead of waiting for a pull.
    pub eager_send: bool,

    /// Fold pending releases into the `TaskFinish` message when possible.
    pub merge_release_and_finish: bool,

    /// Bytes reserved for the distributed arena.
    pub distributed_arena_size: usize,

    /// Bytes reserved for each NUMA-local arena.
    pub local_arena_size: usize,

    /// Number of NUMA nodes to lay arenas and CPU assignments over.
    /// Topology probing is out of scope, so this is configuration.
    pub numa_nodes: usize,

    /// Cap on the number of worker threads; `None` admits every CPU in
    /// the process affinity mask.
    pub max_workers: Option<usize>,

    /// Bound on the write-id cache before LRU eviction kicks in.
    pub write_id_cache_capacity: usize,

    /// In-process cluster handle for the `loopback` backend. Set by test
    /// fixtures, never from the environment.
    pub loopback: Option<Arc<crate::msg::LoopbackCluster>>,

    /// Node index to claim in the loopback cluster; joining order decides
    /// when unset.
    pub loopback_index: Option<usize>,

    /// Share an already-reserved address space instead of mapping a
    /// fresh one. In-process multi-node runs need all "nodes" to agree
    /// on the cluster addresses; over a real transport every process
    /// maps its own.
    pub shared_vmm: Option<Arc<crate::memory::VirtualMemory>>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            communication: "disabled".to_string(),
            services_in_task: false,
            num_message_handler_workers: 1,
            use_namespace: true,
            disable_remote: false,
            disable_remote_connect: false,
            disable_autowait: false,
            message_max_size: DEFAULT_MESSAGE_MAX_SIZE,
            eager_weak_fetch: true,
            eager_send: false,
            merge_release_and_finish: true,
            distributed_arena_size: DEFAULT_DISTRIBUTED_ARENA_SIZE,
            local_arena_size: DEFAULT_LOCAL_ARENA_SIZE,
            numa_nodes: 1,
            max_workers: None,
            write_id_cache_capacity: DEFAULT_WRITE_ID_CACHE_CAPACITY,
            loopback: None,
            loopback_index: None,
            shared_vmm: None,
        }
    }
}

impl ClusterConfig {
    /// Resolve the configuration from `DISTRUN_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(v) = env::var("DISTRUN_COMMUNICATION") {
            cfg.communication = v;
        }
        cfg.services_in_task = env_bool("DISTRUN_SERVICES_IN_TASK", cfg.services_in_task)?;
        cfg.num_message_handler_workers = env_usize(
            "DISTRUN_NUM_MESSAGE_HANDLER_WORKERS",
            cfg.num_message_handler_workers,
        )?;
        cfg.use_namespace = env_bool("DISTRUN_USE_NAMESPACE", cfg.use_namespace)?;
        cfg.disable_remote = env_bool("DISTRUN_DISABLE_REMOTE", cfg.disable_remote)?;
        cfg.disable_remote_connect =
            env_bool("DISTRUN_DISABLE_REMOTE_CONNECT", cfg.disable_remote_connect)?;
        cfg.disable_autowait = env_bool("DISTRUN_DISABLE_AUTOWAIT", cfg.disable_autowait)?;
        cfg.message_max_size = env_usize("DISTRUN_MESSAGE_MAX_SIZE", cfg.message_max_size)?;
        cfg.eager_weak_fetch = env_bool("DISTRUN_EAGER_WEAK_FETCH", cfg.eager_weak_fetch)?;
        cfg.eager_send = env_bool("DISTRUN_EAGER_SEND", cfg.eager_send)?;
        cfg.merge_release_and_finish = env_bool(
            "DISTRUN_MERGE_RELEASE_AND_FINISH",
            cfg.merge_release_and_finish,
        )?;
        cfg.distributed_arena_size =
            env_usize("DISTRUN_DISTRIBUTED_ARENA_SIZE", cfg.distributed_arena_size)?;
        cfg.local_arena_size = env_usize("DISTRUN_LOCAL_ARENA_SIZE", cfg.local_arena_size)?;
        cfg.numa_nodes = env_usize("DISTRUN_NUMA_NODES", cfg.numa_nodes)?;
        if let Ok(v) = env::var("DISTRUN_MAX_WORKERS") {
            cfg.max_workers = Some(v.parse().map_err(|e| {
                anyhow!("invalid DISTRUN_MAX_WORKERS value {:?}: {e}", v)
            })?);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.message_max_size == 0 {
            return Err(anyhow!("message_max_size must be greater than 0"));
        }
        if self.num_message_handler_workers == 0 {
            return Err(anyhow!(
                "num_message_handler_workers must be greater than 0"
            ));
        }
        if self.numa_nodes == 0 {
            return Err(anyhow!("numa_nodes must be greater than 0"));
        }
        if self.distributed_arena_size == 0 || self.local_arena_size == 0 {
            return Err(anyhow!("arena sizes must be greater than 0"));
        }
        if self.communication == "loopback" && self.loopback.is_none() {
            return Err(anyhow!(
                "the loopback backend needs a LoopbackCluster handle"
            ));
        }
        Ok(())
    }

    pub fn communication(mut self, backend: impl Into<String>) -> Self {
        self.communication = backend.into();
        self
    }

    pub fn message_max_size(mut self, bytes: usize) -> Self {
        self.message_max_size = bytes;
        self
    }

    pub fn services_in_task(mut self, val: bool) -> Self {
        self.services_in_task = val;
        self
    }

    pub fn num_message_handler_workers(mut self, val: usize) -> Self {
        self.num_message_handler_workers = val;
        self
    }

    pub fn use_namespace(mut self, val: bool) -> Self {
        self.use_namespace = val;
        self
    }

    pub fn disable_autowait(mut self, val: bool) -> Self {
        self.disable_autowait = val;
        self
    }

    pub fn eager_weak_fetch(mut self, val: bool) -> Self {
        self.eager_weak_fetch = val;
        self
    }

    pub fn merge_release_and_finish(mut self, val: bool) -> Self {
        self.merge_release_and_finish = val;
        self
    }

    pub fn arena_sizes(mut self, distributed: usize, local: usize) -> Self {
        self.distributed_arena_size = distributed;
        self.local_arena_size = local;
        self
    }

    pub fn numa_nodes(mut self, val: usize) -> Self {
        self.numa_nodes = val;
        self
    }

    pub fn max_workers(mut self, val: usize) -> Self {
        self.max_workers = Some(val);
        self
    }

    pub fn loopback(mut self, cluster: Arc<crate::msg::LoopbackCluster>, index: usize) -> Self {
        self.communication = "loopback".to_string();
        self.loopback = Some(cluster);
        self.loopback_index = Some(index);
        self
    }

    pub fn shared_vmm(mut self, vmm: Arc<crate::memory::VirtualMemory>) -> Self {
        self.shared_vmm = Some(vmm);
        self
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(v) => match v.as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(anyhow!("invalid boolean for {key}: {other:?}")),
        },
        Err(_) => Ok(default),
    }
}

fn env_usize(key: &str, default: usize) -> Result<usize> {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|e| anyhow!("invalid value for {key}: {v:?}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = ClusterConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.communication, "disabled");
    }

    #[test]
    fn test_zero_message_max_size_rejected() {
        let cfg = ClusterConfig::default().message_max_size(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_loopback_requires_cluster_handle() {
        let cfg = ClusterConfig::default().communication("loopback");
        assert!(cfg.validate().is_err());
    }
}
