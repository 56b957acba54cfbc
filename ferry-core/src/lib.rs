//! Ferry: chunked, retransmitting file transfer for opportunistic contact networks.
//! Host-driven: no I/O; the host reports completed transfers and ticks, then drains the outgoing buffer.

pub mod cache;
pub mod chunk;
pub mod config;
pub mod core;
pub mod file;
pub mod integrity;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod wire;

pub use cache::{Admission, FileCache, Outbox, StoreOutcome};
pub use config::{ConfigError, ProtocolConfig, QueueMode};
pub use core::{DispatchError, Disposition, FerryCore, NodeStats};
pub use file::File;
pub use protocol::{Bitmap, ChunkId, HostId, Message, Packet, Role, TransactionId};
pub use registry::{Pending, RetransmitKey, RetransmitRegistry, RetryBudget};
pub use wire::{decode_frame, encode_frame, FrameError, LinkReader};
