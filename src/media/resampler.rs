//! libswresample conversion into the device format.

use std::os::raw::c_int;
use std::{mem, ptr};

use ffmpeg_next::ffi;

use super::{error_string, sample_format_to_av};
use crate::audio::{AudioError, AudioFormat, Resampler, SampleFormat};
use crate::decode::AudioSamples;

/// Converts decoded audio of one source format into interleaved f32 at the
/// device rate and channel count.
pub struct FfmpegResampler {
    swr: *mut ffi::SwrContext,
    source: AudioFormat,
    target: AudioFormat,
}

// Owned by the audio renderer, which is behind a mutex.
unsafe impl Send for FfmpegResampler {}

impl FfmpegResampler {
    pub fn new(source: AudioFormat, target: AudioFormat) -> Result<Self, AudioError> {
        if target.sample_format != SampleFormat::F32 {
            return Err(AudioError::UnsupportedFormat(format!(
                "resampler output must be packed f32, got {:?}",
                target.sample_format
            )));
        }
        if source.sample_rate == 0 || target.sample_rate == 0 || source.channels == 0 || target.channels == 0 {
            return Err(AudioError::UnsupportedFormat(format!(
                "cannot convert {} Hz / {} ch to {} Hz / {} ch",
                source.sample_rate, source.channels, target.sample_rate, target.channels
            )));
        }

        unsafe {
            let mut in_layout: ffi::AVChannelLayout = mem::zeroed();
            let mut out_layout: ffi::AVChannelLayout = mem::zeroed();
            ffi::av_channel_layout_default(&mut in_layout, source.channels as c_int);
            ffi::av_channel_layout_default(&mut out_layout, target.channels as c_int);

            let mut swr: *mut ffi::SwrContext = ptr::null_mut();
            let ret = ffi::swr_alloc_set_opts2(
                &mut swr,
                &out_layout,
                ffi::AVSampleFormat::AV_SAMPLE_FMT_FLT,
                target.sample_rate as c_int,
                &in_layout,
                sample_format_to_av(source.sample_format),
                source.sample_rate as c_int,
                0,
                ptr::null_mut(),
            );
            ffi::av_channel_layout_uninit(&mut in_layout);
            ffi::av_channel_layout_uninit(&mut out_layout);
            if ret < 0 || swr.is_null() {
                return Err(AudioError::Resample(format!(
                    "cannot create sample rate converter for conversion of {} Hz {:?} {} channels to {} Hz f32 {} channels: {}",
                    source.sample_rate,
                    source.sample_format,
                    source.channels,
                    target.sample_rate,
                    target.channels,
                    error_string(ret)
                )));
            }

            let ret = ffi::swr_init(swr);
            if ret < 0 {
                ffi::swr_free(&mut swr);
                return Err(AudioError::Resample(format!("swr_init failed: {}", error_string(ret))));
            }

            Ok(Self { swr, source, target })
        }
    }
}

impl Resampler for FfmpegResampler {
    fn convert(&mut self, input: &AudioSamples, out: &mut Vec<f32>) -> Result<usize, AudioError> {
        if input.format != self.source {
            return Err(AudioError::Resample(format!(
                "input format {:?} does not match converter input {:?}",
                input.format, self.source
            )));
        }
        let expected_planes = if self.source.sample_format.is_planar() {
            self.source.channels as usize
        } else {
            1
        };
        if input.planes.len() < expected_planes {
            return Err(AudioError::Resample(format!(
                "expected {} planes, got {}",
                expected_planes,
                input.planes.len()
            )));
        }

        let out_count = input.nb_samples as i64 * self.target.sample_rate as i64 / self.source.sample_rate as i64 + 256;
        let channels = self.target.channels as usize;
        let start = out.len();
        out.resize(start + out_count as usize * channels, 0.0);

        let in_planes: Vec<*const u8> = input.planes.iter().map(|plane| plane.as_ptr()).collect();
        let mut out_ptr = out[start..].as_mut_ptr() as *mut u8;
        let converted = unsafe {
            ffi::swr_convert(
                self.swr,
                &mut out_ptr,
                out_count as c_int,
                in_planes.as_ptr(),
                input.nb_samples as c_int,
            )
        };
        if converted < 0 {
            out.truncate(start);
            return Err(AudioError::Resample(format!("swr_convert() failed: {}", error_string(converted))));
        }
        if converted as i64 == out_count {
            tracing::warn!("audio buffer is probably too small");
            let ret = unsafe { ffi::swr_init(self.swr) };
            if ret < 0 {
                tracing::warn!("swr_init failed: {}", error_string(ret));
            }
        }
        out.truncate(start + converted as usize * channels);
        Ok(converted as usize)
    }

    fn set_compensation(&mut self, delta: i32, distance: i32) -> Result<(), AudioError> {
        let ret = unsafe { ffi::swr_set_compensation(self.swr, delta, distance) };
        if ret < 0 {
            return Err(AudioError::Resample(format!(
                "swr_set_compensation() failed: {}",
                error_string(ret)
            )));
        }
        Ok(())
    }
}

impl Drop for FfmpegResampler {
    fn drop(&mut self) {
        unsafe { ffi::swr_free(&mut self.swr) }
    }
}
