//! The video output seam.
//!
//! The refresh scheduler hands the sink the frame to show together with the
//! rectangle it should occupy. Sinks upload the payload once per frame and
//! mark it `uploaded`, so redisplaying a paused frame is cheap.

use crate::decode::frame::{SubtitleFrame, VideoPicture};
use crate::core::Rational;
use crate::queue::Frame;

/// Error type for rendering operations
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to upload frame: {0}")]
    Upload(String),
    #[error("unsupported pixel format: {0}")]
    UnsupportedFormat(String),
    #[error("output surface error: {0}")]
    Surface(String),
}

/// Target area inside the output, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Fit a `pic_width` x `pic_height` picture with sample aspect ratio `sar`
/// into the area at (`left`, `top`) of size `scr_width` x `scr_height`.
///
/// The picture keeps its display aspect ratio, is centred, and has even
/// dimensions of at least one pixel.
pub fn calculate_display_rect(
    left: i32,
    top: i32,
    scr_width: u32,
    scr_height: u32,
    pic_width: u32,
    pic_height: u32,
    sar: Rational,
) -> DisplayRect {
    let mut aspect_ratio = if sar.num == 0 { 0.0 } else { sar.to_f64() };
    if aspect_ratio <= 0.0 || aspect_ratio.is_nan() {
        aspect_ratio = 1.0;
    }
    aspect_ratio *= pic_width.max(1) as f64 / pic_height.max(1) as f64;

    let mut height = scr_height as i64;
    let mut width = ((height as f64 * aspect_ratio).round() as i64) & !1;
    if width > scr_width as i64 {
        width = scr_width as i64;
        height = ((width as f64 / aspect_ratio).round() as i64) & !1;
    }
    let x = (scr_width as i64 - width) / 2;
    let y = (scr_height as i64 - height) / 2;

    DisplayRect {
        x: left + x as i32,
        y: top + y as i32,
        width: width.max(1) as u32,
        height: height.max(1) as u32,
    }
}

/// Where pictures and the audio visualization end up.
pub trait VideoSink {
    /// Size of the output area in pixels.
    fn size(&self) -> (u32, u32);

    /// Show `frame` inside `rect`, with `subtitle` overlaid when present.
    /// Implementations set `uploaded` on frames they have converted.
    fn display_picture(
        &mut self,
        frame: &mut Frame<VideoPicture>,
        subtitle: Option<&mut Frame<SubtitleFrame>>,
        rect: DisplayRect,
    ) -> Result<(), RenderError>;

    /// Draw the waveform of the most recent interleaved samples.
    fn display_waveform(&mut self, samples: &[f32], channels: u16) -> Result<(), RenderError>;

    /// Blank the output.
    fn clear(&mut self) -> Result<(), RenderError> {
        Ok(())
    }
}

/// A sink without a window: records what would be shown and logs it.
#[derive(Debug)]
pub struct LoggingVideoSink {
    width: u32,
    height: u32,
    pictures: u64,
    waveforms: u64,
    last_pts: f64,
}

impl LoggingVideoSink {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pictures: 0,
            waveforms: 0,
            last_pts: f64::NAN,
        }
    }

    pub fn pictures_shown(&self) -> u64 {
        self.pictures
    }

    pub fn waveforms_shown(&self) -> u64 {
        self.waveforms
    }

    /// pts of the last picture shown.
    pub fn last_pts(&self) -> f64 {
        self.last_pts
    }
}

impl Default for LoggingVideoSink {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl VideoSink for LoggingVideoSink {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn display_picture(
        &mut self,
        frame: &mut Frame<VideoPicture>,
        subtitle: Option<&mut Frame<SubtitleFrame>>,
        rect: DisplayRect,
    ) -> Result<(), RenderError> {
        if !frame.uploaded {
            self.pictures += 1;
            self.last_pts = frame.pts;
            frame.uploaded = true;
        }
        if let Some(subtitle) = subtitle {
            subtitle.uploaded = true;
        }
        tracing::trace!(
            pts = frame.pts,
            serial = frame.serial,
            x = rect.x,
            y = rect.y,
            width = rect.width,
            height = rect.height,
            "display picture"
        );
        Ok(())
    }

    fn display_waveform(&mut self, samples: &[f32], channels: u16) -> Result<(), RenderError> {
        self.waveforms += 1;
        let peak = samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()));
        tracing::trace!(samples = samples.len(), channels, peak, "display waveform");
        Ok(())
    }
}
