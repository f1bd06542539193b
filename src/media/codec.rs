//! libavcodec decoders behind the [`Codec`] seam.
//!
//! Video output is RGBA8, converted with swscale. Audio output keeps the
//! codec's native sample layout; conversion happens in the resampler.

use std::os::raw::{c_char, c_int};
use std::{ptr, slice};

use ffmpeg_next::ffi;

use super::{av_rational, error_string, is_again, is_eof, opt_ts, rational, sample_format_from_raw, string_from, OwnedParameters};
use crate::audio::AudioFormat;
use crate::config::CodecOptions;
use crate::core::MediaKind;
use crate::decode::{
    AudioSamples, Codec, CodecError, DecodedFrame, PixelFormat, Received, SendStatus, StreamInfo, SubtitleFrame,
    SubtitleRect, VideoPicture,
};
use crate::queue::Packet;

pub struct FfmpegCodec {
    kind: MediaKind,
    ctx: *mut ffi::AVCodecContext,
    frame: *mut ffi::AVFrame,
    packet: *mut ffi::AVPacket,
    sws: *mut ffi::SwsContext,
}

// Each codec is driven by exactly one decode thread.
unsafe impl Send for FfmpegCodec {}

impl FfmpegCodec {
    pub fn open(stream: &StreamInfo, options: &CodecOptions) -> Result<Self, CodecError> {
        if stream.kind == MediaKind::Data {
            return Err(CodecError::Unsupported);
        }
        let params = stream
            .params
            .as_ref()
            .and_then(|params| params.downcast_ref::<OwnedParameters>())
            .ok_or_else(|| CodecError::Open(format!("stream {} carries no codec parameters", stream.index)))?;

        unsafe {
            let codec = ffi::avcodec_find_decoder((*params.as_ptr()).codec_id);
            if codec.is_null() {
                return Err(CodecError::NotFound(stream.codec_name.clone()));
            }

            let mut ctx = ffi::avcodec_alloc_context3(codec);
            if ctx.is_null() {
                return Err(CodecError::Open("failed to allocate codec context".to_string()));
            }
            let ret = ffi::avcodec_parameters_to_context(ctx, params.as_ptr());
            if ret < 0 {
                ffi::avcodec_free_context(&mut ctx);
                return Err(CodecError::Open(error_string(ret)));
            }
            (*ctx).pkt_timebase = av_rational(stream.time_base);

            let mut lowres = options.lowres as c_int;
            let max_lowres = (*codec).max_lowres as c_int;
            if lowres > max_lowres {
                tracing::warn!(
                    "The maximum value for lowres supported by the decoder is {}",
                    max_lowres
                );
                lowres = max_lowres;
            }
            (*ctx).lowres = lowres;
            if options.fast {
                (*ctx).flags2 |= ffi::AV_CODEC_FLAG2_FAST as c_int;
            }

            let mut opts: *mut ffi::AVDictionary = ptr::null_mut();
            ffi::av_dict_set(
                &mut opts,
                b"threads\0".as_ptr() as *const c_char,
                b"auto\0".as_ptr() as *const c_char,
                0,
            );
            if lowres != 0 {
                ffi::av_dict_set_int(&mut opts, b"lowres\0".as_ptr() as *const c_char, lowres as i64, 0);
            }
            let ret = ffi::avcodec_open2(ctx, codec, &mut opts);
            ffi::av_dict_free(&mut opts);
            if ret < 0 {
                ffi::avcodec_free_context(&mut ctx);
                return Err(CodecError::Open(error_string(ret)));
            }

            let frame = ffi::av_frame_alloc();
            let packet = ffi::av_packet_alloc();
            if frame.is_null() || packet.is_null() {
                let (mut frame, mut packet) = (frame, packet);
                ffi::av_frame_free(&mut frame);
                ffi::av_packet_free(&mut packet);
                ffi::avcodec_free_context(&mut ctx);
                return Err(CodecError::Open("failed to allocate frame/packet".to_string()));
            }

            tracing::debug!(
                "Opened {} decoder {} for stream {}",
                stream.kind,
                string_from((*codec).name),
                stream.index
            );

            Ok(Self {
                kind: stream.kind,
                ctx,
                frame,
                packet,
                sws: ptr::null_mut(),
            })
        }
    }

    /// Load `packet` into the reusable AVPacket. A null packet leaves it
    /// empty, which drains subtitle decoders.
    unsafe fn load_packet(&mut self, packet: &Packet) -> Result<(), CodecError> {
        ffi::av_packet_unref(self.packet);
        if packet.is_null() {
            return Ok(());
        }
        let size = c_int::try_from(packet.size()).map_err(|_| CodecError::InvalidData("packet too large".to_string()))?;
        let ret = ffi::av_new_packet(self.packet, size);
        if ret < 0 {
            return Err(CodecError::Backend(error_string(ret)));
        }
        ptr::copy_nonoverlapping(packet.data.as_ptr(), (*self.packet).data, packet.size());
        (*self.packet).stream_index = packet.stream_index as c_int;
        (*self.packet).pts = packet.pts.unwrap_or(ffi::AV_NOPTS_VALUE);
        (*self.packet).dts = packet.dts.unwrap_or(ffi::AV_NOPTS_VALUE);
        (*self.packet).duration = packet.duration;
        (*self.packet).pos = packet.pos.unwrap_or(-1);
        if packet.keyframe {
            (*self.packet).flags |= ffi::AV_PKT_FLAG_KEY as c_int;
        }
        Ok(())
    }

    unsafe fn take_video(&mut self) -> Result<VideoPicture, CodecError> {
        let frame = self.frame;
        let width = (*frame).width;
        let height = (*frame).height;
        if width <= 0 || height <= 0 {
            return Err(CodecError::InvalidData(format!("invalid picture size {width}x{height}")));
        }

        self.sws = ffi::sws_getCachedContext(
            self.sws,
            width,
            height,
            (*self.ctx).pix_fmt,
            width,
            height,
            ffi::AVPixelFormat::AV_PIX_FMT_RGBA,
            ffi::SWS_BILINEAR as c_int,
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null(),
        );
        if self.sws.is_null() {
            return Err(CodecError::Backend("cannot initialize the conversion context".to_string()));
        }

        let stride = width as usize * 4;
        let mut rgba = vec![0u8; stride * height as usize];
        let dst_data: [*mut u8; 4] = [rgba.as_mut_ptr(), ptr::null_mut(), ptr::null_mut(), ptr::null_mut()];
        let dst_linesize: [c_int; 4] = [stride as c_int, 0, 0, 0];
        ffi::sws_scale(
            self.sws,
            (*frame).data.as_ptr() as *const *const u8,
            (*frame).linesize.as_ptr(),
            0,
            height,
            dst_data.as_ptr(),
            dst_linesize.as_ptr(),
        );

        let mut picture = VideoPicture::new(width as u32, height as u32, PixelFormat::Rgba);
        picture.sample_aspect_ratio = rational((*frame).sample_aspect_ratio);
        picture.frame_pts = opt_ts((*frame).pts);
        picture.best_effort_timestamp = opt_ts((*frame).best_effort_timestamp);
        picture.pkt_dts = opt_ts((*frame).pkt_dts);
        picture.planes = vec![rgba];
        picture.strides = vec![stride];
        Ok(picture)
    }

    unsafe fn take_audio(&mut self) -> Result<AudioSamples, CodecError> {
        let frame = self.frame;
        let sample_format = sample_format_from_raw((*frame).format)
            .ok_or_else(|| CodecError::InvalidData(format!("unsupported sample format {}", (*frame).format)))?;
        let channels = (*frame).ch_layout.nb_channels.max(0) as usize;
        let nb_samples = (*frame).nb_samples.max(0) as usize;
        let bytes_per_sample = sample_format.bytes_per_sample();

        let planes = if sample_format.is_planar() {
            (0..channels)
                .map(|ch| {
                    let data = *(*frame).extended_data.add(ch);
                    slice::from_raw_parts(data, nb_samples * bytes_per_sample).to_vec()
                })
                .collect()
        } else {
            let data = *(*frame).extended_data;
            vec![slice::from_raw_parts(data, nb_samples * bytes_per_sample * channels).to_vec()]
        };

        Ok(AudioSamples {
            format: AudioFormat {
                sample_rate: (*frame).sample_rate.max(0) as u32,
                channels: channels as u16,
                sample_format,
            },
            nb_samples,
            pts: opt_ts((*frame).pts),
            pos: None,
            planes,
        })
    }
}

impl Codec for FfmpegCodec {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<SendStatus, CodecError> {
        unsafe {
            let ret = if packet.is_null() {
                ffi::avcodec_send_packet(self.ctx, ptr::null())
            } else {
                self.load_packet(packet)?;
                ffi::avcodec_send_packet(self.ctx, self.packet)
            };
            if ret >= 0 || is_eof(ret) {
                Ok(SendStatus::Accepted)
            } else if is_again(ret) {
                Ok(SendStatus::Again)
            } else {
                Err(CodecError::InvalidData(error_string(ret)))
            }
        }
    }

    fn receive_frame(&mut self) -> Result<Received, CodecError> {
        unsafe {
            let ret = ffi::avcodec_receive_frame(self.ctx, self.frame);
            if is_again(ret) {
                return Ok(Received::Again);
            }
            if is_eof(ret) {
                // Re-arm the codec so it accepts input after the next seek.
                ffi::avcodec_flush_buffers(self.ctx);
                return Ok(Received::Eof);
            }
            if ret < 0 {
                return Err(CodecError::InvalidData(error_string(ret)));
            }

            let decoded = match self.kind {
                MediaKind::Video => self.take_video().map(DecodedFrame::Video),
                MediaKind::Audio => self.take_audio().map(DecodedFrame::Audio),
                _ => Err(CodecError::Unsupported),
            };
            ffi::av_frame_unref(self.frame);
            decoded.map(Received::Frame)
        }
    }

    fn decode_subtitle(&mut self, packet: &Packet) -> Result<Option<SubtitleFrame>, CodecError> {
        if self.kind != MediaKind::Subtitle {
            return Err(CodecError::Unsupported);
        }
        unsafe {
            self.load_packet(packet)?;
            let mut sub: ffi::AVSubtitle = std::mem::zeroed();
            let mut got: c_int = 0;
            let ret = ffi::avcodec_decode_subtitle2(self.ctx, &mut sub, &mut got, self.packet);
            if ret < 0 {
                return Err(CodecError::InvalidData(error_string(ret)));
            }
            if got == 0 {
                return Ok(None);
            }

            let rects = (0..sub.num_rects as usize)
                .map(|i| subtitle_rect(*sub.rects.add(i)))
                .collect();
            let frame = SubtitleFrame {
                pts: opt_ts(sub.pts),
                start_display_time: sub.start_display_time,
                end_display_time: sub.end_display_time,
                graphics: sub.format == 0,
                rects,
            };
            ffi::avsubtitle_free(&mut sub);
            Ok(Some(frame))
        }
    }

    fn flush(&mut self) {
        unsafe { ffi::avcodec_flush_buffers(self.ctx) }
    }
}

impl Drop for FfmpegCodec {
    fn drop(&mut self) {
        unsafe {
            if !self.sws.is_null() {
                ffi::sws_freeContext(self.sws);
            }
            ffi::av_frame_free(&mut self.frame);
            ffi::av_packet_free(&mut self.packet);
            ffi::avcodec_free_context(&mut self.ctx);
        }
    }
}

unsafe fn subtitle_rect(rect: *const ffi::AVSubtitleRect) -> SubtitleRect {
    let width = (*rect).w.max(0) as usize;
    let height = (*rect).h.max(0) as usize;
    let text = match (*rect).type_ {
        ffi::AVSubtitleType::SUBTITLE_TEXT => Some(string_from((*rect).text)),
        ffi::AVSubtitleType::SUBTITLE_ASS => Some(string_from((*rect).ass)),
        _ => None,
    };

    let mut bitmap = Vec::new();
    let data = (*rect).data[0];
    let linesize = (*rect).linesize[0].max(0) as usize;
    if !data.is_null() && linesize >= width {
        bitmap.reserve(width * height);
        for row in 0..height {
            bitmap.extend_from_slice(slice::from_raw_parts(data.add(row * linesize), width));
        }
    }

    SubtitleRect {
        x: (*rect).x,
        y: (*rect).y,
        width: width as u32,
        height: height as u32,
        text,
        bitmap,
    }
}
