use std::fmt;

/// A typed memory location. Places are small value types compared by
/// (kind, node), which makes the process-wide interning of the original
/// design a plain `Copy` enum.
///
/// `Directory` is the sentinel meaning "no concrete copy yet; the home
/// node assignment in the directory is authoritative".
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryPlace {
    /// Host RAM of cluster node `node`.
    Host { node: usize },
    /// The directory sentinel.
    Directory,
}

impl MemoryPlace {
    pub fn host(node: usize) -> Self {
        MemoryPlace::Host { node }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, MemoryPlace::Directory)
    }

    /// The owning cluster node, if this is a concrete location.
    pub fn node(&self) -> Option<usize> {
        match self {
            MemoryPlace::Host { node } => Some(*node),
            MemoryPlace::Directory => None,
        }
    }

    /// Wire encoding: node index for host places, `-2` for the directory
    /// sentinel. `-1` encodes "no location" (an `Option::None` upstream).
    pub(crate) fn to_wire(place: Option<MemoryPlace>) -> i64 {
        match place {
            None => -1,
            Some(MemoryPlace::Directory) => -2,
            Some(MemoryPlace::Host { node }) => node as i64,
        }
    }

    pub(crate) fn from_wire(raw: i64) -> Option<MemoryPlace> {
        match raw {
            -1 => None,
            -2 => Some(MemoryPlace::Directory),
            node if node >= 0 => Some(MemoryPlace::Host { node: node as usize }),
            _ => None,
        }
    }
}

impl fmt::Debug for MemoryPlace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryPlace::Host { node } => write!(f, "host(node {node})"),
            MemoryPlace::Directory => write!(f, "directory"),
        }
    }
}

impl fmt::Display for MemoryPlace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip() {
        for place in [None, Some(MemoryPlace::Directory), Some(MemoryPlace::host(3))] {
            assert_eq!(MemoryPlace::from_wire(MemoryPlace::to_wire(place)), place);
        }
    }

    #[test]
    fn test_equality_by_kind_and_node() {
        assert_eq!(MemoryPlace::host(1), MemoryPlace::host(1));
        assert_ne!(MemoryPlace::host(1), MemoryPlace::host(2));
        assert_ne!(MemoryPlace::host(1), MemoryPlace::Directory);
    }
}
