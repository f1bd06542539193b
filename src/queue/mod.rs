//! Queues connecting the read loop, decode workers and presenters.

pub mod frame_queue;
pub mod packet;
pub mod packet_queue;
pub mod wakeup;

pub use frame_queue::{Frame, FrameMeta, FrameQueue, WriteSlot};
pub use packet::{Packet, QueueItem, QueuedPacket};
pub use packet_queue::{PacketQueue, QueueError, QueueStats};
pub use wakeup::{ReadWakeup, WakeReason};
