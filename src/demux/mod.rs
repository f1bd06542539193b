//! Container reading: the source seam and the thread that feeds the packet
//! queues.

pub mod read_loop;
pub mod source;

pub use read_loop::{has_enough_packets, in_play_range, ReadLoop, MAX_QUEUE_SIZE};
pub use source::{Chapter, DemuxError, DemuxSource, Interrupt, MediaBackend, SeekSpec, SourceInfo};
