pub mod loopback;
pub mod message;
pub mod messenger;

pub use loopback::{LoopbackCluster, LoopbackMessenger};
pub use message::{
    DataFetchMsg, DataSendMsg, DfreeMsg, DmallocMsg, Envelope, FetchFragment, FinishAccess,
    Message, MessageKind, ReleaseMsg, SatisfiabilityMsg, TaskFinishMsg, TaskNewMsg, WireAccess,
};
pub use messenger::{Messenger, create_messenger, register_backend};
