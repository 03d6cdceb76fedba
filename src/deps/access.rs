use crate::ids::WriteId;
use crate::memory::{MemoryPlace, MemoryRegion};
use anyhow::{Result, anyhow};
use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use std::sync::{Arc, Weak};

/// How a task uses a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn reads(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, AccessMode::Write | AccessMode::ReadWrite)
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            AccessMode::Read => 0,
            AccessMode::Write => 1,
            AccessMode::ReadWrite => 2,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(AccessMode::Read),
            1 => Ok(AccessMode::Write),
            2 => Ok(AccessMode::ReadWrite),
            other => Err(anyhow!("unknown access mode discriminant {other}")),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u8 {
        /// Every prior writer of an intersecting region has released.
        const READ_SATISFIED = 1;

        /// Every prior access of an intersecting region has released.
        const WRITE_SATISFIED = 1 << 1;

        /// Weak access: non-blocking, used to pass regions down to
        /// children without enforcing exclusion here.
        const WEAK = 1 << 2;

        /// The current location has been registered with a remote peer.
        const REGISTERED_REMOTELY = 1 << 3;

        /// The owning task has finished its use of the region.
        const COMPLETE = 1 << 4;

        /// The access has released its successors; terminal.
        const RELEASED = 1 << 5;

        /// Registration in the dependency registry is still in flight;
        /// satisfiability is not evaluated until this clears. Predecessors
        /// may release concurrently, which is why the blocker counters are
        /// signed.
        const REGISTERING = 1 << 6;

        /// A data copy into this node is in flight for the region; the
        /// access cannot start until it lands, satisfiability aside.
        const DATA_PENDING = 1 << 7;
    }
}

/// An edge to a successor access that is waiting on this one.
#[derive(Debug)]
pub(crate) struct SuccessorEdge {
    pub task: Weak<crate::task::Task>,
    pub access_index: usize,
    /// This access blocks the successor's read satisfiability (only
    /// writers do).
    pub blocks_read: bool,
}

/// Everything about an access that changes after creation, behind the
/// per-access lock.
#[derive(Debug)]
pub struct AccessState {
    pub flags: AccessFlags,
    pub write_id: WriteId,
    pub location: Option<MemoryPlace>,
    /// Prior writers not yet released. May dip below zero while
    /// REGISTERING, when a predecessor releases before the registration
    /// scan has added it to the count.
    pub(crate) read_blockers: isize,
    /// Prior accesses of any mode not yet released; same signedness rule.
    pub(crate) write_blockers: isize,
    pub(crate) successors: SmallVec<[SuccessorEdge; 4]>,
}

/// A task's declared use of a memory region. The region and mode are
/// fixed at declaration; satisfiability, location and the successor list
/// live behind a fine-grained per-access lock.
#[derive(Debug)]
pub struct DataAccess {
    region: MemoryRegion,
    mode: AccessMode,
    state: Mutex<AccessState>,
}

impl DataAccess {
    pub fn new(region: MemoryRegion, mode: AccessMode, weak: bool) -> Arc<Self> {
        let mut flags = AccessFlags::empty();
        if weak {
            flags |= AccessFlags::WEAK;
        } else {
            flags |= AccessFlags::REGISTERING;
        }
        Arc::new(Self {
            region,
            mode,
            state: Mutex::new(AccessState {
                flags,
                write_id: WriteId::NONE,
                location: None,
                read_blockers: 0,
                write_blockers: 0,
                successors: SmallVec::new(),
            }),
        })
    }

    pub fn region(&self) -> MemoryRegion {
        self.region
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn is_weak(&self) -> bool {
        self.state.lock().flags.contains(AccessFlags::WEAK)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, AccessState> {
        self.state.lock()
    }

    pub fn flags(&self) -> AccessFlags {
        self.state.lock().flags
    }

    pub fn write_id(&self) -> WriteId {
        self.state.lock().write_id
    }

    pub fn location(&self) -> Option<MemoryPlace> {
        self.state.lock().location
    }

    pub fn set_location(&self, place: MemoryPlace) {
        self.state.lock().location = Some(place);
    }

    /// Has all the satisfiability this access's mode requires? Weak
    /// accesses never gate readiness.
    pub fn satisfied_for_mode(&self) -> bool {
        let state = self.state.lock();
        Self::satisfied_with(self.mode, state.flags)
    }

    pub(crate) fn satisfied_with(mode: AccessMode, flags: AccessFlags) -> bool {
        if flags.contains(AccessFlags::WEAK) {
            return true;
        }
        if flags.contains(AccessFlags::DATA_PENDING) {
            return false;
        }
        let read_ok = !mode.reads() || flags.contains(AccessFlags::READ_SATISFIED);
        let write_ok = !mode.writes() || flags.contains(AccessFlags::WRITE_SATISFIED);
        read_ok && write_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_predicates() {
        assert!(AccessMode::Read.reads() && !AccessMode::Read.writes());
        assert!(!AccessMode::Write.reads() && AccessMode::Write.writes());
        assert!(AccessMode::ReadWrite.reads() && AccessMode::ReadWrite.writes());
    }

    #[test]
    fn test_mode_wire_round_trip() {
        for mode in [AccessMode::Read, AccessMode::Write, AccessMode::ReadWrite] {
            assert_eq!(AccessMode::from_u8(mode.as_u8()).unwrap(), mode);
        }
        assert!(AccessMode::from_u8(9).is_err());
    }

    #[test]
    fn test_satisfaction_by_mode() {
        let region = MemoryRegion::new(0, 64);

        let read = DataAccess::new(region, AccessMode::Read, false);
        assert!(!read.satisfied_for_mode());
        read.lock().flags |= AccessFlags::READ_SATISFIED;
        assert!(read.satisfied_for_mode());

        let rw = DataAccess::new(region, AccessMode::ReadWrite, false);
        rw.lock().flags |= AccessFlags::READ_SATISFIED;
        assert!(!rw.satisfied_for_mode());
        rw.lock().flags |= AccessFlags::WRITE_SATISFIED;
        assert!(rw.satisfied_for_mode());

        let weak = DataAccess::new(region, AccessMode::ReadWrite, true);
        assert!(weak.satisfied_for_mode());
    }
}
