pub mod sink;

pub use sink::{calculate_display_rect, DisplayRect, LoggingVideoSink, RenderError, VideoSink};
