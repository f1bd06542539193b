//! FFmpeg implementation of the demux, codec and resampler seams.
//!
//! All unsafe FFmpeg code is isolated in this module. Every raw context is
//! owned by exactly one wrapper that frees it on drop.

mod codec;
mod demuxer;
mod resampler;

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;

pub use codec::FfmpegCodec;
pub use demuxer::{is_realtime, FfmpegSource};
pub use resampler::FfmpegResampler;

use crate::audio::{AudioError, AudioFormat, Resampler, SampleFormat};
use crate::config::CodecOptions;
use crate::core::Rational;
use crate::decode::{Codec, CodecError, StreamInfo};
use crate::demux::{DemuxError, DemuxSource, Interrupt, MediaBackend};

/// Opens sources, codecs and resamplers through FFmpeg.
#[derive(Debug, Clone, Copy)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Result<Self, DemuxError> {
        ffmpeg::init().map_err(|e| DemuxError::Io(format!("FFmpeg init failed: {e}")))?;
        Ok(Self)
    }
}

impl MediaBackend for FfmpegBackend {
    fn open_source(
        &self,
        uri: &str,
        options: &CodecOptions,
        interrupt: Interrupt,
    ) -> Result<Box<dyn DemuxSource>, DemuxError> {
        Ok(Box::new(FfmpegSource::open(uri, options, interrupt)?))
    }

    fn open_codec(&self, stream: &StreamInfo, options: &CodecOptions) -> Result<Box<dyn Codec>, CodecError> {
        Ok(Box::new(FfmpegCodec::open(stream, options)?))
    }

    fn open_resampler(&self, source: AudioFormat, target: AudioFormat) -> Result<Box<dyn Resampler>, AudioError> {
        Ok(Box::new(FfmpegResampler::new(source, target)?))
    }
}

/// Codec parameters copied out of the format context, so a codec can be
/// opened after the demuxer moved to its own thread.
pub(crate) struct OwnedParameters(*mut ffi::AVCodecParameters);

// The parameters are only read after construction.
unsafe impl Send for OwnedParameters {}
unsafe impl Sync for OwnedParameters {}

impl OwnedParameters {
    /// # Safety
    /// `source` must point to valid codec parameters.
    pub(crate) unsafe fn copy_from(source: *const ffi::AVCodecParameters) -> Option<Self> {
        let params = ffi::avcodec_parameters_alloc();
        if params.is_null() {
            return None;
        }
        if ffi::avcodec_parameters_copy(params, source) < 0 {
            let mut params = params;
            ffi::avcodec_parameters_free(&mut params);
            return None;
        }
        Some(Self(params))
    }

    pub(crate) fn as_ptr(&self) -> *const ffi::AVCodecParameters {
        self.0
    }
}

impl Drop for OwnedParameters {
    fn drop(&mut self) {
        unsafe { ffi::avcodec_parameters_free(&mut self.0) }
    }
}

pub(crate) fn error_string(code: c_int) -> String {
    ffmpeg::Error::from(code).to_string()
}

pub(crate) fn is_again(code: c_int) -> bool {
    matches!(ffmpeg::Error::from(code), ffmpeg::Error::Other { errno } if errno == ffmpeg::error::EAGAIN)
}

pub(crate) fn is_eof(code: c_int) -> bool {
    matches!(ffmpeg::Error::from(code), ffmpeg::Error::Eof)
}

pub(crate) fn is_not_supported(code: c_int) -> bool {
    matches!(ffmpeg::Error::from(code), ffmpeg::Error::Other { errno } if errno == ffmpeg::error::ENOSYS)
}

pub(crate) fn rational(value: ffi::AVRational) -> Rational {
    Rational::new(value.num, value.den)
}

pub(crate) fn av_rational(value: Rational) -> ffi::AVRational {
    ffi::AVRational {
        num: value.num,
        den: value.den,
    }
}

pub(crate) fn opt_ts(ts: i64) -> Option<i64> {
    (ts != ffi::AV_NOPTS_VALUE).then_some(ts)
}

pub(crate) fn cstring(value: &str) -> Result<CString, String> {
    CString::new(value).map_err(|e| format!("invalid string {value:?}: {e}"))
}

/// # Safety
/// `ptr` must be null or a valid NUL-terminated string.
pub(crate) unsafe fn string_from(ptr: *const c_char) -> String {
    if ptr.is_null() {
        String::new()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

pub(crate) fn sample_format_from_raw(format: c_int) -> Option<SampleFormat> {
    use ffi::AVSampleFormat::*;
    let formats = [
        (AV_SAMPLE_FMT_U8, SampleFormat::U8),
        (AV_SAMPLE_FMT_S16, SampleFormat::S16),
        (AV_SAMPLE_FMT_S32, SampleFormat::S32),
        (AV_SAMPLE_FMT_FLT, SampleFormat::F32),
        (AV_SAMPLE_FMT_DBL, SampleFormat::F64),
        (AV_SAMPLE_FMT_U8P, SampleFormat::U8P),
        (AV_SAMPLE_FMT_S16P, SampleFormat::S16P),
        (AV_SAMPLE_FMT_S32P, SampleFormat::S32P),
        (AV_SAMPLE_FMT_FLTP, SampleFormat::F32P),
        (AV_SAMPLE_FMT_DBLP, SampleFormat::F64P),
    ];
    formats
        .iter()
        .find(|(raw, _)| *raw as c_int == format)
        .map(|&(_, format)| format)
}

pub(crate) fn sample_format_to_av(format: SampleFormat) -> ffi::AVSampleFormat {
    use ffi::AVSampleFormat::*;
    match format {
        SampleFormat::U8 => AV_SAMPLE_FMT_U8,
        SampleFormat::S16 => AV_SAMPLE_FMT_S16,
        SampleFormat::S32 => AV_SAMPLE_FMT_S32,
        SampleFormat::F32 => AV_SAMPLE_FMT_FLT,
        SampleFormat::F64 => AV_SAMPLE_FMT_DBL,
        SampleFormat::U8P => AV_SAMPLE_FMT_U8P,
        SampleFormat::S16P => AV_SAMPLE_FMT_S16P,
        SampleFormat::S32P => AV_SAMPLE_FMT_S32P,
        SampleFormat::F32P => AV_SAMPLE_FMT_FLTP,
        SampleFormat::F64P => AV_SAMPLE_FMT_DBLP,
    }
}
