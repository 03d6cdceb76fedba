use crate::deps::AccessMode;
use crate::ids::{MessageId, OffloadedTaskId, WriteId};
use crate::memory::{MemoryPlace, MemoryRegion};
use anyhow::{Result, anyhow};

/// Message kind discriminator, the first byte of every wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    TaskNew = 0,
    Satisfiability = 1,
    DataFetch = 2,
    DataSend = 3,
    TaskFinish = 4,
    SysFinish = 5,
    Dmalloc = 6,
    Dfree = 7,
    Release = 8,
}

impl MessageKind {
    fn from_u8(raw: u8) -> Result<Self> {
        Ok(match raw {
            0 => MessageKind::TaskNew,
            1 => MessageKind::Satisfiability,
            2 => MessageKind::DataFetch,
            3 => MessageKind::DataSend,
            4 => MessageKind::TaskFinish,
            5 => MessageKind::SysFinish,
            6 => MessageKind::Dmalloc,
            7 => MessageKind::Dfree,
            8 => MessageKind::Release,
            other => return Err(anyhow!("message of unknown kind {other}")),
        })
    }
}

/// One access description travelling with a `TaskNew`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireAccess {
    pub region: MemoryRegion,
    pub mode: AccessMode,
    pub weak: bool,
    pub write_id: WriteId,
    pub location: Option<MemoryPlace>,
    pub read_satisfied: bool,
    pub write_satisfied: bool,
}

/// Offload a task with its accesses to the destination node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskNewMsg {
    pub offloaded_id: OffloadedTaskId,
    pub task_fn: u64,
    pub args: Vec<u8>,
    /// Offloader-side id of the most recent task offloaded to the same
    /// node, used by the remote namespace to chain siblings. Zero means
    /// none.
    pub predecessor: u64,
    pub accesses: Vec<WireAccess>,
}

/// A region became read- and/or write-satisfied at a location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatisfiabilityMsg {
    pub offloaded_id: OffloadedTaskId,
    pub region: MemoryRegion,
    pub read: bool,
    pub write: bool,
    pub write_id: WriteId,
    pub location: Option<MemoryPlace>,
}

/// One fragment of a pull request; the transfer id keys the pending
/// transfer the reply will complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchFragment {
    pub region: MemoryRegion,
    pub transfer_id: MessageId,
}

/// Pull fragments of cluster memory from the receiving node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFetchMsg {
    pub fragments: Vec<FetchFragment>,
}

/// Push the bytes of one fragment to the receiving node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSendMsg {
    pub transfer_id: MessageId,
    pub region: MemoryRegion,
    pub bytes: Vec<u8>,
}

/// Final state of one access reported back by a finished remote task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishAccess {
    pub region: MemoryRegion,
    pub write_id: WriteId,
    pub location: Option<MemoryPlace>,
}

/// A remote task completed. Carries the releasable accesses, including
/// delayed ones when release and finish were merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFinishMsg {
    pub offloaded_id: OffloadedTaskId,
    pub accesses: Vec<FinishAccess>,
}

/// A cluster-wide allocation happened; register it in the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmallocMsg {
    pub region: MemoryRegion,
    pub policy: u8,
    pub dims: Vec<u64>,
    pub allocating_node: u64,
}

/// A cluster-wide allocation was freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfreeMsg {
    pub region: MemoryRegion,
}

/// Late release of a delayed access of an offloaded task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseMsg {
    pub offloaded_id: OffloadedTaskId,
    pub region: MemoryRegion,
    pub read: bool,
    pub write: bool,
    pub write_id: WriteId,
    pub location: Option<MemoryPlace>,
}

/// The tagged union of everything that travels between nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    TaskNew(TaskNewMsg),
    Satisfiability(SatisfiabilityMsg),
    DataFetch(DataFetchMsg),
    DataSend(DataSendMsg),
    TaskFinish(TaskFinishMsg),
    SysFinish,
    Dmalloc(DmallocMsg),
    Dfree(DfreeMsg),
    Release(ReleaseMsg),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::TaskNew(_) => MessageKind::TaskNew,
            Message::Satisfiability(_) => MessageKind::Satisfiability,
            Message::DataFetch(_) => MessageKind::DataFetch,
            Message::DataSend(_) => MessageKind::DataSend,
            Message::TaskFinish(_) => MessageKind::TaskFinish,
            Message::SysFinish => MessageKind::SysFinish,
            Message::Dmalloc(_) => MessageKind::Dmalloc,
            Message::Dfree(_) => MessageKind::Dfree,
            Message::Release(_) => MessageKind::Release,
        }
    }
}

/// A message plus its wire identity. The source node is attached by the
/// transport on receive; it never travels in the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub id: MessageId,
    pub source: usize,
    pub body: Message,
}

impl Envelope {
    pub fn new(id: MessageId, source: usize, body: Message) -> Self {
        Self { id, source, body }
    }

    /// Wire layout: one kind byte, the 64-bit message id, then the
    /// kind-specific payload with fields in declaration order. Native
    /// endianness throughout; heterogeneous clusters are out of scope.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.body.kind() as u8);
        put_u64(buf, self.id.0);

        match &self.body {
            Message::TaskNew(m) => {
                put_u64(buf, m.offloaded_id.0);
                put_u64(buf, m.task_fn);
                put_bytes(buf, &m.args);
                put_u64(buf, m.predecessor);
                put_u64(buf, m.accesses.len() as u64);
                for access in &m.accesses {
                    put_region(buf, access.region);
                    buf.push(access.mode.as_u8());
                    buf.push(access.weak as u8);
                    put_u64(buf, access.write_id.0);
                    put_i64(buf, MemoryPlace::to_wire(access.location));
                    buf.push(access.read_satisfied as u8);
                    buf.push(access.write_satisfied as u8);
                }
            }
            Message::Satisfiability(m) => {
                put_u64(buf, m.offloaded_id.0);
                put_region(buf, m.region);
                buf.push(m.read as u8);
                buf.push(m.write as u8);
                put_u64(buf, m.write_id.0);
                put_i64(buf, MemoryPlace::to_wire(m.location));
            }
            Message::DataFetch(m) => {
                put_u64(buf, m.fragments.len() as u64);
                for fragment in &m.fragments {
                    put_region(buf, fragment.region);
                    put_u64(buf, fragment.transfer_id.0);
                }
            }
            Message::DataSend(m) => {
                put_u64(buf, m.transfer_id.0);
                put_region(buf, m.region);
                put_bytes(buf, &m.bytes);
            }
            Message::TaskFinish(m) => {
                put_u64(buf, m.offloaded_id.0);
                put_u64(buf, m.accesses.len() as u64);
                for access in &m.accesses {
                    put_region(buf, access.region);
                    put_u64(buf, access.write_id.0);
                    put_i64(buf, MemoryPlace::to_wire(access.location));
                }
            }
            Message::SysFinish => {}
            Message::Dmalloc(m) => {
                put_region(buf, m.region);
                buf.push(m.policy);
                put_u64(buf, m.dims.len() as u64);
                for dim in &m.dims {
                    put_u64(buf, *dim);
                }
                put_u64(buf, m.allocating_node);
            }
            Message::Dfree(m) => {
                put_region(buf, m.region);
            }
            Message::Release(m) => {
                put_u64(buf, m.offloaded_id.0);
                put_region(buf, m.region);
                buf.push(m.read as u8);
                buf.push(m.write as u8);
                put_u64(buf, m.write_id.0);
                put_i64(buf, MemoryPlace::to_wire(m.location));
            }
        }
    }

    pub fn decode(source: usize, bytes: &[u8]) -> Result<Self> {
        let mut r = Reader { bytes, pos: 0 };
        let kind = MessageKind::from_u8(r.u8()?)?;
        let id = MessageId(r.u64()?);

        let body = match kind {
            MessageKind::TaskNew => {
                let offloaded_id = OffloadedTaskId(r.u64()?);
                let task_fn = r.u64()?;
                let args = r.bytes()?;
                let predecessor = r.u64()?;
                let count = r.u64()? as usize;
                let mut accesses = Vec::with_capacity(count);
                for _ in 0..count {
                    accesses.push(WireAccess {
                        region: r.region()?,
                        mode: AccessMode::from_u8(r.u8()?)?,
                        weak: r.bool()?,
                        write_id: WriteId(r.u64()?),
                        location: MemoryPlace::from_wire(r.i64()?),
                        read_satisfied: r.bool()?,
                        write_satisfied: r.bool()?,
                    });
                }
                Message::TaskNew(TaskNewMsg {
                    offloaded_id,
                    task_fn,
                    args,
                    predecessor,
                    accesses,
                })
            }
            MessageKind::Satisfiability => Message::Satisfiability(SatisfiabilityMsg {
                offloaded_id: OffloadedTaskId(r.u64()?),
                region: r.region()?,
                read: r.bool()?,
                write: r.bool()?,
                write_id: WriteId(r.u64()?),
                location: MemoryPlace::from_wire(r.i64()?),
            }),
            MessageKind::DataFetch => {
                let count = r.u64()? as usize;
                let mut fragments = Vec::with_capacity(count);
                for _ in 0..count {
                    fragments.push(FetchFragment {
                        region: r.region()?,
                        transfer_id: MessageId(r.u64()?),
                    });
                }
                Message::DataFetch(DataFetchMsg { fragments })
            }
            MessageKind::DataSend => Message::DataSend(DataSendMsg {
                transfer_id: MessageId(r.u64()?),
                region: r.region()?,
                bytes: r.bytes()?,
            }),
            MessageKind::TaskFinish => {
                let offloaded_id = OffloadedTaskId(r.u64()?);
                let count = r.u64()? as usize;
                let mut accesses = Vec::with_capacity(count);
                for _ in 0..count {
                    accesses.push(FinishAccess {
                        region: r.region()?,
                        write_id: WriteId(r.u64()?),
                        location: MemoryPlace::from_wire(r.i64()?),
                    });
                }
                Message::TaskFinish(TaskFinishMsg {
                    offloaded_id,
                    accesses,
                })
            }
            MessageKind::SysFinish => Message::SysFinish,
            MessageKind::Dmalloc => {
                let region = r.region()?;
                let policy = r.u8()?;
                let count = r.u64()? as usize;
                let mut dims = Vec::with_capacity(count);
                for _ in 0..count {
                    dims.push(r.u64()?);
                }
                let allocating_node = r.u64()?;
                Message::Dmalloc(DmallocMsg {
                    region,
                    policy,
                    dims,
                    allocating_node,
                })
            }
            MessageKind::Dfree => Message::Dfree(DfreeMsg { region: r.region()? }),
            MessageKind::Release => Message::Release(ReleaseMsg {
                offloaded_id: OffloadedTaskId(r.u64()?),
                region: r.region()?,
                read: r.bool()?,
                write: r.bool()?,
                write_id: WriteId(r.u64()?),
                location: MemoryPlace::from_wire(r.i64()?),
            }),
        };

        if r.pos != bytes.len() {
            return Err(anyhow!(
                "trailing garbage in {kind:?} message: {} of {} bytes consumed",
                r.pos,
                bytes.len()
            ));
        }

        Ok(Envelope { id, source, body })
    }
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_ne_bytes());
}

fn put_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_ne_bytes());
}

fn put_region(buf: &mut Vec<u8>, region: MemoryRegion) {
    put_u64(buf, region.start());
    put_u64(buf, region.end());
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_u64(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn u8(&mut self) -> Result<u8> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| anyhow!("truncated message"))?;
        self.pos += 1;
        Ok(b)
    }

    fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    fn u64(&mut self) -> Result<u64> {
        let end = self.pos + 8;
        let raw = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| anyhow!("truncated message"))?;
        self.pos = end;
        Ok(u64::from_ne_bytes(raw.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(self.u64()? as i64)
    }

    fn region(&mut self) -> Result<MemoryRegion> {
        let start = self.u64()?;
        let end = self.u64()?;
        if end < start {
            return Err(anyhow!("malformed region [{start:#x}, {end:#x})"));
        }
        Ok(MemoryRegion::new(start, end))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u64()? as usize;
        let end = self.pos + len;
        let raw = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| anyhow!("truncated message"))?;
        self.pos = end;
        Ok(raw.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(body: Message) {
        let env = Envelope::new(MessageId(99), 2, body);
        let mut buf = Vec::new();
        env.encode(&mut buf);
        let decoded = Envelope::decode(2, &buf).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_header_layout() {
        let env = Envelope::new(MessageId(7), 0, Message::SysFinish);
        let mut buf = Vec::new();
        env.encode(&mut buf);

        assert_eq!(buf.len(), 9);
        assert_eq!(buf[0], MessageKind::SysFinish as u8);
        assert_eq!(u64::from_ne_bytes(buf[1..9].try_into().unwrap()), 7);
    }

    #[test]
    fn test_task_new_round_trip() {
        round_trip(Message::TaskNew(TaskNewMsg {
            offloaded_id: OffloadedTaskId(11),
            task_fn: 3,
            args: vec![1, 2, 3, 4],
            predecessor: 0,
            accesses: vec![WireAccess {
                region: MemoryRegion::new(0x1000, 0x2000),
                mode: AccessMode::ReadWrite,
                weak: false,
                write_id: WriteId(5),
                location: Some(MemoryPlace::host(1)),
                read_satisfied: true,
                write_satisfied: false,
            }],
        }));
    }

    #[test]
    fn test_data_messages_round_trip() {
        round_trip(Message::DataFetch(DataFetchMsg {
            fragments: vec![
                FetchFragment {
                    region: MemoryRegion::new(0, 4096),
                    transfer_id: MessageId(1),
                },
                FetchFragment {
                    region: MemoryRegion::new(4096, 8192),
                    transfer_id: MessageId(2),
                },
            ],
        }));
        round_trip(Message::DataSend(DataSendMsg {
            transfer_id: MessageId(1),
            region: MemoryRegion::new(0, 3),
            bytes: vec![9, 8, 7],
        }));
        round_trip(Message::Satisfiability(SatisfiabilityMsg {
            offloaded_id: OffloadedTaskId(4),
            region: MemoryRegion::new(16, 32),
            read: true,
            write: true,
            write_id: WriteId(77),
            location: Some(MemoryPlace::Directory),
        }));
        round_trip(Message::Release(ReleaseMsg {
            offloaded_id: OffloadedTaskId(4),
            region: MemoryRegion::new(16, 32),
            read: false,
            write: true,
            write_id: WriteId(78),
            location: None,
        }));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut buf = vec![200u8];
        buf.extend_from_slice(&1u64.to_ne_bytes());
        assert!(Envelope::decode(0, &buf).is_err());
    }

    #[test]
    fn test_truncation_rejected() {
        let env = Envelope::new(
            MessageId(1),
            0,
            Message::Dfree(DfreeMsg {
                region: MemoryRegion::new(0, 64),
            }),
        );
        let mut buf = Vec::new();
        env.encode(&mut buf);
        assert!(Envelope::decode(0, &buf[..buf.len() - 1]).is_err());
    }
}
