//! The audio device seam.
//!
//! A device pulls interleaved f32 from an [`AudioRenderer`] on its own
//! thread. Opening negotiates the format; whatever the device settles on is
//! reported back through [`AudioOutput::params`] and handed to the renderer
//! before the first callback.

use std::sync::Arc;

use parking_lot::Mutex;

use super::buffer::AudioParams;
use super::renderer::AudioRenderer;
use super::AudioError;
use crate::config::AudioBufferConfig;

/// What the player asks the device for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub buffering: AudioBufferConfig,
}

impl AudioSpec {
    pub fn buffer_samples(&self) -> u32 {
        self.buffering.buffer_samples(self.sample_rate)
    }
}

/// The renderer as shared with the device callback.
pub type SharedRenderer = Arc<Mutex<AudioRenderer>>;

/// An open device. Dropping it closes the device and stops callbacks.
pub trait AudioOutput {
    fn params(&self) -> AudioParams;
}

/// Opens audio devices.
pub trait AudioOutputFactory {
    /// Open a device as close to `wanted` as possible, configure `renderer`
    /// with the negotiated parameters and start pulling from it.
    fn open(&self, wanted: AudioSpec, renderer: SharedRenderer) -> Result<Box<dyn AudioOutput>, AudioError>;
}

/// Channel count to try after `channels` was refused, 0 meaning "try the
/// next lower sample rate".
const NEXT_CHANNELS: [u16; 8] = [0, 0, 1, 6, 2, 6, 4, 6];
const NEXT_SAMPLE_RATES: [u32; 5] = [0, 44_100, 48_000, 96_000, 192_000];

/// Device formats to try, in order, when `wanted` is not available: fewer
/// or more common channel layouts first, then lower standard sample rates.
pub fn fallback_specs(wanted: AudioSpec) -> Vec<AudioSpec> {
    let mut specs = Vec::new();
    let mut rate_index = NEXT_SAMPLE_RATES.len() - 1;
    while rate_index > 0 && NEXT_SAMPLE_RATES[rate_index] >= wanted.sample_rate {
        rate_index -= 1;
    }

    let mut spec = wanted;
    loop {
        specs.push(spec);
        spec.channels = NEXT_CHANNELS[(spec.channels as usize).min(7)];
        if spec.channels == 0 {
            spec.sample_rate = NEXT_SAMPLE_RATES[rate_index];
            spec.channels = wanted.channels;
            if spec.sample_rate == 0 {
                break;
            }
            rate_index -= 1;
        }
    }
    specs
}

/// Configure `renderer` for `params`. Device implementations call this once
/// negotiation settled.
pub fn bind_renderer(renderer: &SharedRenderer, params: AudioParams) {
    renderer.lock().configure(params);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_buffer_samples() {
        let spec = AudioSpec {
            sample_rate: 48_000,
            channels: 2,
            buffering: AudioBufferConfig::default(),
        };
        // 48000 / 30 = 1600 -> 2048
        assert_eq!(spec.buffer_samples(), 2048);
    }

    #[test]
    fn test_fallback_specs() {
        let wanted = AudioSpec {
            sample_rate: 48_000,
            channels: 2,
            buffering: AudioBufferConfig::default(),
        };
        let tried: Vec<(u16, u32)> = fallback_specs(wanted)
            .iter()
            .map(|spec| (spec.channels, spec.sample_rate))
            .collect();
        assert_eq!(tried, vec![(2, 48_000), (1, 48_000), (2, 44_100), (1, 44_100)]);
    }

    #[test]
    fn test_fallback_specs_surround() {
        let wanted = AudioSpec {
            sample_rate: 44_100,
            channels: 8,
            buffering: AudioBufferConfig::default(),
        };
        let tried: Vec<u16> = fallback_specs(wanted).iter().map(|spec| spec.channels).collect();
        // 8 -> 6 -> 4 -> 2 -> 1, then no lower rate is left
        assert_eq!(tried, vec![8, 6, 4, 2, 1]);
    }
}
