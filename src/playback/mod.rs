//! Clocks, synchronization, the refresh scheduler and the player that ties
//! a session together.

pub mod clock;
pub mod engine;
pub mod scheduler;
pub mod state;
pub mod sync;

pub use clock::{Clock, ClockSnapshot};
pub use engine::{Player, PlayerCommand, PlayerError};
pub use scheduler::{FrameDecision, Scheduler};
pub use state::{PlaybackStatus, PlayerEvent, QuitReason, SeekTarget, SessionState};
pub use sync::{compute_target_delay, effective_master, AudioDriftCorrector};
