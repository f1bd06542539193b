//! libavformat container reader.

use std::os::raw::{c_char, c_int, c_void};
use std::{ptr, slice};

use ffmpeg_next as ffmpeg;
use ffmpeg_next::ffi;

use super::{cstring, error_string, is_eof, is_not_supported, opt_ts, rational, sample_format_from_raw, string_from, OwnedParameters};
use crate::audio::SampleFormat;
use crate::config::CodecOptions;
use crate::core::MediaKind;
use crate::decode::{AudioStreamInfo, CodecParameters, StreamInfo, VideoStreamInfo};
use crate::demux::{Chapter, DemuxError, DemuxSource, Interrupt, SeekSpec, SourceInfo};
use crate::queue::Packet;

/// Byte-offset stand-in for `SEEK_CUR` in `avio_seek`.
const SEEK_CUR: c_int = 1;

/// Network formats and protocols that deliver data in real time.
pub fn is_realtime(format_name: &str, uri: &str, has_io: bool) -> bool {
    matches!(format_name, "rtp" | "rtsp" | "sdp") || (has_io && (uri.starts_with("rtp:") || uri.starts_with("udp:")))
}

fn needs_pause_polling(format_name: &str, uri: &str, has_io: bool) -> bool {
    format_name == "rtsp" || (has_io && uri.starts_with("mmsh:"))
}

unsafe extern "C" fn interrupt_callback(opaque: *mut c_void) -> c_int {
    let interrupt = &*(opaque as *const Interrupt);
    interrupt.is_triggered() as c_int
}

/// An opened container. Owned by the read thread.
pub struct FfmpegSource {
    ctx: *mut ffi::AVFormatContext,
    packet: *mut ffi::AVPacket,
    info: SourceInfo,
    pause_polling: bool,
    // Boxed so the address handed to the interrupt callback stays put.
    interrupt: Box<Interrupt>,
}

// The format context is only touched from the thread that owns the source.
unsafe impl Send for FfmpegSource {}

impl FfmpegSource {
    pub fn open(uri: &str, options: &CodecOptions, interrupt: Interrupt) -> Result<Self, DemuxError> {
        let open_error = |reason: String| DemuxError::Open {
            uri: uri.to_string(),
            reason,
        };
        let c_uri = cstring(uri).map_err(open_error)?;
        let interrupt = Box::new(interrupt);

        unsafe {
            let mut ctx = ffi::avformat_alloc_context();
            if ctx.is_null() {
                return Err(open_error("failed to allocate format context".to_string()));
            }
            (*ctx).interrupt_callback = ffi::AVIOInterruptCB {
                callback: Some(interrupt_callback),
                opaque: &*interrupt as *const Interrupt as *mut c_void,
            };

            let mut opts: *mut ffi::AVDictionary = ptr::null_mut();
            ffi::av_dict_set(
                &mut opts,
                b"scan_all_pmts\0".as_ptr() as *const c_char,
                b"1\0".as_ptr() as *const c_char,
                ffi::AV_DICT_DONT_OVERWRITE as c_int,
            );

            // On failure avformat_open_input frees the context.
            let ret = ffi::avformat_open_input(&mut ctx, c_uri.as_ptr(), ptr::null(), &mut opts);
            ffi::av_dict_free(&mut opts);
            if ret < 0 {
                if interrupt.is_triggered() {
                    return Err(DemuxError::Interrupted);
                }
                return Err(open_error(error_string(ret)));
            }

            if options.genpts {
                (*ctx).flags |= ffi::AVFMT_FLAG_GENPTS as c_int;
            }

            let ret = ffi::avformat_find_stream_info(ctx, ptr::null_mut());
            if ret < 0 {
                ffi::avformat_close_input(&mut ctx);
                return Err(open_error(format!("could not find codec parameters: {}", error_string(ret))));
            }

            let packet = ffi::av_packet_alloc();
            if packet.is_null() {
                ffi::avformat_close_input(&mut ctx);
                return Err(open_error("failed to allocate packet".to_string()));
            }

            let info = source_info(ctx, uri);
            let has_io = !(*ctx).pb.is_null();
            let pause_polling = needs_pause_polling(&info.format_name, uri, has_io);
            tracing::debug!(
                "Opened {} as {} with {} streams",
                uri,
                info.format_name,
                info.streams.len()
            );

            Ok(Self {
                ctx,
                packet,
                info,
                pause_polling,
                interrupt,
            })
        }
    }
}

impl DemuxSource for FfmpegSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn read_packet(&mut self) -> Result<Packet, DemuxError> {
        unsafe {
            let ret = ffi::av_read_frame(self.ctx, self.packet);
            if ret < 0 {
                if self.interrupt.is_triggered() || matches!(ffmpeg::Error::from(ret), ffmpeg::Error::Exit) {
                    return Err(DemuxError::Interrupted);
                }
                let pb = (*self.ctx).pb;
                if !pb.is_null() && (*pb).error != 0 {
                    return Err(DemuxError::Io(error_string((*pb).error)));
                }
                if !is_eof(ret) && (pb.is_null() || ffi::avio_feof(pb) == 0) {
                    tracing::debug!("Read error on {}: {}", self.info.uri, error_string(ret));
                }
                return Err(DemuxError::Eof);
            }
            let packet = packet_from(self.packet);
            ffi::av_packet_unref(self.packet);
            Ok(packet)
        }
    }

    fn seek(&mut self, spec: SeekSpec) -> Result<(), DemuxError> {
        let flags = if spec.by_bytes { ffi::AVSEEK_FLAG_BYTE as c_int } else { 0 };
        let ret = unsafe { ffi::avformat_seek_file(self.ctx, -1, spec.min, spec.target, spec.max, flags) };
        if ret < 0 {
            return Err(DemuxError::Seek(format!("{}: {}", self.info.uri, error_string(ret))));
        }
        Ok(())
    }

    fn read_pause(&mut self) -> Result<(), DemuxError> {
        pause_result(unsafe { ffi::av_read_pause(self.ctx) })
    }

    fn read_play(&mut self) -> Result<(), DemuxError> {
        pause_result(unsafe { ffi::av_read_play(self.ctx) })
    }

    fn byte_position(&self) -> Option<i64> {
        unsafe {
            let pb = (*self.ctx).pb;
            if pb.is_null() {
                return None;
            }
            let pos = ffi::avio_seek(pb, 0, SEEK_CUR);
            (pos >= 0).then_some(pos)
        }
    }

    fn needs_pause_polling(&self) -> bool {
        self.pause_polling
    }

    fn best_stream(&self, kind: MediaKind, wanted: Option<usize>, related: Option<usize>) -> Option<usize> {
        let media_type = match kind {
            MediaKind::Video => ffi::AVMediaType::AVMEDIA_TYPE_VIDEO,
            MediaKind::Audio => ffi::AVMediaType::AVMEDIA_TYPE_AUDIO,
            MediaKind::Subtitle => ffi::AVMediaType::AVMEDIA_TYPE_SUBTITLE,
            MediaKind::Data => return None,
        };
        let wanted = wanted.map_or(-1, |index| index as c_int);
        let related = related.map_or(-1, |index| index as c_int);
        let ret = unsafe { ffi::av_find_best_stream(self.ctx, media_type, wanted, related, ptr::null_mut(), 0) };
        (ret >= 0).then_some(ret as usize)
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        unsafe {
            ffi::av_packet_free(&mut self.packet);
            ffi::avformat_close_input(&mut self.ctx);
        }
    }
}

fn pause_result(ret: c_int) -> Result<(), DemuxError> {
    if ret >= 0 {
        Ok(())
    } else if is_not_supported(ret) {
        Err(DemuxError::Unsupported)
    } else {
        Err(DemuxError::Io(error_string(ret)))
    }
}

unsafe fn packet_from(pkt: *const ffi::AVPacket) -> Packet {
    let data = if (*pkt).data.is_null() || (*pkt).size <= 0 {
        Vec::new()
    } else {
        slice::from_raw_parts((*pkt).data, (*pkt).size as usize).to_vec()
    };
    Packet {
        stream_index: (*pkt).stream_index.max(0) as usize,
        pts: opt_ts((*pkt).pts),
        dts: opt_ts((*pkt).dts),
        duration: (*pkt).duration.max(0),
        pos: ((*pkt).pos >= 0).then_some((*pkt).pos),
        keyframe: (*pkt).flags & ffi::AV_PKT_FLAG_KEY as c_int != 0,
        data,
    }
}

unsafe fn source_info(ctx: *mut ffi::AVFormatContext, uri: &str) -> SourceInfo {
    let iformat = (*ctx).iformat;
    let (format_name, format_flags) = if iformat.is_null() {
        (String::new(), 0)
    } else {
        (string_from((*iformat).name), (*iformat).flags)
    };
    let pb = (*ctx).pb;

    let streams = (0..(*ctx).nb_streams as usize)
        .map(|i| stream_info(ctx, *(*ctx).streams.add(i)))
        .collect();

    let chapters = (0..(*ctx).nb_chapters as usize)
        .map(|i| {
            let chapter = *(*ctx).chapters.add(i);
            Chapter {
                start: (*chapter).start,
                end: (*chapter).end,
                time_base: rational((*chapter).time_base),
            }
        })
        .collect();

    let byte_size = if pb.is_null() {
        None
    } else {
        Some(ffi::avio_size(pb)).filter(|size| *size > 0)
    };

    let no_search_flags = (ffi::AVFMT_NOBINSEARCH | ffi::AVFMT_NOGENSEARCH | ffi::AVFMT_NO_BYTE_SEEK) as c_int;

    SourceInfo {
        uri: uri.to_string(),
        realtime: is_realtime(&format_name, uri, !pb.is_null()),
        format_name,
        streams,
        duration: opt_ts((*ctx).duration),
        start_time: opt_ts((*ctx).start_time),
        bit_rate: (*ctx).bit_rate,
        byte_size,
        chapters,
        ts_discontinuous: format_flags & ffi::AVFMT_TS_DISCONT as c_int != 0,
        no_timestamp_search: format_flags & no_search_flags != 0,
    }
}

unsafe fn stream_info(ctx: *mut ffi::AVFormatContext, stream: *mut ffi::AVStream) -> StreamInfo {
    let par = (*stream).codecpar;
    let kind = match (*par).codec_type {
        ffi::AVMediaType::AVMEDIA_TYPE_VIDEO => MediaKind::Video,
        ffi::AVMediaType::AVMEDIA_TYPE_AUDIO => MediaKind::Audio,
        ffi::AVMediaType::AVMEDIA_TYPE_SUBTITLE => MediaKind::Subtitle,
        _ => MediaKind::Data,
    };
    let index = (*stream).index.max(0) as usize;
    let mut info = StreamInfo::new(index, kind, rational((*stream).time_base));
    info.codec_name = string_from(ffi::avcodec_get_name((*par).codec_id));
    info.start_time = opt_ts((*stream).start_time);
    info.duration = opt_ts((*stream).duration);

    match kind {
        MediaKind::Video => {
            let stream_sar = rational((*stream).sample_aspect_ratio);
            let frame_rate = rational(ffi::av_guess_frame_rate(ctx, stream, ptr::null_mut()));
            info.video = Some(VideoStreamInfo {
                width: (*par).width.max(0) as u32,
                height: (*par).height.max(0) as u32,
                sample_aspect_ratio: if stream_sar.is_valid() {
                    stream_sar
                } else {
                    rational((*par).sample_aspect_ratio)
                },
                frame_rate: frame_rate.is_valid().then_some(frame_rate),
            });
        }
        MediaKind::Audio => {
            info.audio = Some(AudioStreamInfo {
                sample_rate: (*par).sample_rate.max(0) as u32,
                channels: (*par).ch_layout.nb_channels.clamp(0, u16::MAX as c_int) as u16,
                // Resolved per frame by the decoder when the container leaves it open.
                sample_format: sample_format_from_raw((*par).format).unwrap_or(SampleFormat::F32),
            });
        }
        _ => {}
    }

    if (*stream).disposition & ffi::AV_DISPOSITION_ATTACHED_PIC as c_int != 0 {
        let mut picture = packet_from(&(*stream).attached_pic);
        picture.stream_index = index;
        info.attached_pic = Some(picture);
    }

    info.params = OwnedParameters::copy_from(par).map(CodecParameters::new);
    info
}
