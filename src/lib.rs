//! Audio/video playback core: packet and frame queues, decoders, clocks,
//! audio/video synchronization and the read loop, with an optional FFmpeg
//! backend and cpal audio output.

pub mod audio;
pub mod config;
pub mod core;
pub mod decode;
pub mod demux;
#[cfg(feature = "ffmpeg")]
pub mod media;
pub mod playback;
pub mod queue;
pub mod render;

pub use config::SessionConfig;
pub use playback::{Player, PlayerCommand, PlayerError, QuitReason};
