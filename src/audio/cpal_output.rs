//! cpal audio device.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleRate, StreamConfig, SupportedBufferSize};

use super::buffer::AudioParams;
use super::output::{bind_renderer, fallback_specs, AudioOutput, AudioOutputFactory, AudioSpec, SharedRenderer};
use super::AudioError;

impl From<cpal::DefaultStreamConfigError> for AudioError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        AudioError::Device(err.to_string())
    }
}

impl From<cpal::SupportedStreamConfigsError> for AudioError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        AudioError::Device(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(err: cpal::BuildStreamError) -> Self {
        AudioError::Device(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for AudioError {
    fn from(err: cpal::PlayStreamError) -> Self {
        AudioError::Device(err.to_string())
    }
}

/// Opens the default output device of the default host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalOutputFactory;

/// A running cpal output stream.
pub struct CpalOutput {
    _stream: cpal::Stream,
    params: AudioParams,
}

impl AudioOutput for CpalOutput {
    fn params(&self) -> AudioParams {
        self.params
    }
}

impl CpalOutputFactory {
    /// First f32 configuration the device supports among the fallback specs,
    /// or its default configuration.
    fn negotiate(device: &Device, wanted: AudioSpec) -> Result<(StreamConfig, AudioSpec), AudioError> {
        let ranges: Vec<_> = device
            .supported_output_configs()?
            .filter(|range| range.sample_format() == cpal::SampleFormat::F32)
            .collect();

        for spec in fallback_specs(wanted) {
            let found = ranges.iter().find(|range| {
                range.channels() == spec.channels
                    && range.min_sample_rate().0 <= spec.sample_rate
                    && spec.sample_rate <= range.max_sample_rate().0
            });
            if let Some(range) = found {
                let samples = spec.buffer_samples();
                let buffer_size = match range.buffer_size() {
                    SupportedBufferSize::Range { min, max } if (*min..=*max).contains(&samples) => {
                        BufferSize::Fixed(samples)
                    }
                    _ => BufferSize::Default,
                };
                let config = StreamConfig {
                    channels: spec.channels,
                    sample_rate: SampleRate(spec.sample_rate),
                    buffer_size,
                };
                return Ok((config, spec));
            }
            tracing::debug!(
                channels = spec.channels,
                sample_rate = spec.sample_rate,
                "audio format not supported by device"
            );
        }

        let default = device.default_output_config()?;
        if default.sample_format() != cpal::SampleFormat::F32 {
            return Err(AudioError::UnsupportedFormat(format!("{:?}", default.sample_format())));
        }
        let spec = AudioSpec {
            sample_rate: default.sample_rate().0,
            channels: default.channels(),
            buffering: wanted.buffering,
        };
        Ok((StreamConfig::from(default), spec))
    }
}

impl AudioOutputFactory for CpalOutputFactory {
    fn open(&self, wanted: AudioSpec, renderer: SharedRenderer) -> Result<Box<dyn AudioOutput>, AudioError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
        let (config, spec) = Self::negotiate(&device, wanted)?;

        let buffer_samples = match config.buffer_size {
            BufferSize::Fixed(samples) => samples,
            BufferSize::Default => spec.buffer_samples(),
        };
        let params = AudioParams::new(spec.sample_rate, spec.channels, buffer_samples);
        bind_renderer(&renderer, params);

        let stream = device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                renderer.lock().fill(data);
            },
            |err| tracing::error!(error = %err, "audio stream error"),
            None,
        )?;
        stream.play()?;

        tracing::info!(
            device = %device.name().unwrap_or_default(),
            sample_rate = params.sample_rate,
            channels = params.channels,
            buffer_samples,
            "audio output opened"
        );
        Ok(Box::new(CpalOutput { _stream: stream, params }))
    }
}
