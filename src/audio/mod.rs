pub mod buffer;
#[cfg(feature = "cpal-output")]
pub mod cpal_output;
pub mod output;
pub mod renderer;

pub use buffer::{AudioFormat, AudioParams, SampleArray, SampleFormat};
#[cfg(feature = "cpal-output")]
pub use cpal_output::CpalOutputFactory;
pub use output::{fallback_specs, AudioOutput, AudioOutputFactory, AudioSpec, SharedRenderer};
pub use renderer::{AudioRenderer, Resampler, ResamplerFactory};

/// Error type for audio output and conversion
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("no audio output device available")]
    NoDevice,
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),
    #[error("audio device error: {0}")]
    Device(String),
    #[error("resampler error: {0}")]
    Resample(String),
}
