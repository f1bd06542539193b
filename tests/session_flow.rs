//! End-to-end session tests against an in-memory backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel;
use parking_lot::Mutex;

use aves_player::audio::{
    AudioError, AudioFormat, AudioOutput, AudioOutputFactory, AudioParams, AudioSpec, Resampler, SampleFormat,
    SharedRenderer,
};
use aves_player::config::CodecOptions;
use aves_player::core::{MediaKind, Rational};
use aves_player::decode::{
    AudioSamples, AudioStreamInfo, Codec, CodecError, DecodedFrame, PixelFormat, Received, SendStatus, StreamInfo,
    VideoPicture, VideoStreamInfo,
};
use aves_player::demux::{DemuxError, DemuxSource, Interrupt, MediaBackend, SeekSpec, SourceInfo};
use aves_player::queue::{Frame, Packet};
use aves_player::render::{DisplayRect, RenderError, VideoSink};
use aves_player::{Player, PlayerCommand, PlayerError, QuitReason, SessionConfig};

const FRAME_MS: i64 = 40;
const SAMPLE_RATE: u32 = 48_000;

fn source_info(kinds: &[MediaKind]) -> SourceInfo {
    let streams = kinds
        .iter()
        .enumerate()
        .map(|(index, &kind)| {
            let mut stream = StreamInfo::new(index, kind, Rational::new(1, 1000));
            stream.codec_name = "raw".into();
            match kind {
                MediaKind::Video => {
                    stream.video = Some(VideoStreamInfo {
                        width: 4,
                        height: 4,
                        sample_aspect_ratio: Rational::new(1, 1),
                        frame_rate: Some(Rational::new(25, 1)),
                    })
                }
                MediaKind::Audio => {
                    stream.audio = Some(AudioStreamInfo {
                        sample_rate: SAMPLE_RATE,
                        channels: 2,
                        sample_format: SampleFormat::F32,
                    })
                }
                _ => {}
            }
            stream
        })
        .collect();
    SourceInfo {
        uri: "memory:clip".into(),
        format_name: "memory".into(),
        streams,
        start_time: Some(0),
        ..Default::default()
    }
}

/// `frames` packets per stream, interleaved, `FRAME_MS` apart.
fn script(kinds: &[MediaKind], frames: i64) -> Vec<Packet> {
    (0..frames)
        .flat_map(|i| {
            (0..kinds.len()).map(move |index| {
                Packet::new(index, vec![0; 64])
                    .with_pts(i * FRAME_MS)
                    .with_duration(FRAME_MS)
                    .with_pos(i * 64)
            })
        })
        .collect()
}

struct MemorySource {
    info: SourceInfo,
    packets: Vec<Packet>,
    cursor: usize,
    seeks: Arc<Mutex<Vec<SeekSpec>>>,
    closed: Arc<AtomicBool>,
}

impl DemuxSource for MemorySource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn read_packet(&mut self) -> Result<Packet, DemuxError> {
        let packet = self.packets.get(self.cursor).cloned().ok_or(DemuxError::Eof)?;
        self.cursor += 1;
        Ok(packet)
    }

    fn seek(&mut self, spec: SeekSpec) -> Result<(), DemuxError> {
        self.seeks.lock().push(spec);
        let target_ms = spec.target / 1000;
        self.cursor = self
            .packets
            .iter()
            .position(|packet| packet.pts.unwrap_or(0) >= target_ms)
            .unwrap_or(self.packets.len());
        Ok(())
    }
}

impl Drop for MemorySource {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// One frame per packet, drains to Eof after a null packet.
struct PassthroughCodec {
    kind: MediaKind,
    pending: VecDeque<DecodedFrame>,
    draining: bool,
}

impl Codec for PassthroughCodec {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn send_packet(&mut self, packet: &Packet) -> Result<SendStatus, CodecError> {
        if packet.is_null() {
            self.draining = true;
            return Ok(SendStatus::Accepted);
        }
        let frame = match self.kind {
            MediaKind::Video => {
                let mut picture = VideoPicture::new(4, 4, PixelFormat::Rgba);
                picture.best_effort_timestamp = packet.pts;
                picture.frame_pts = packet.pts;
                picture.pkt_dts = packet.dts;
                picture.pos = packet.pos;
                picture.planes = vec![vec![0; 64]];
                picture.strides = vec![16];
                DecodedFrame::Video(picture)
            }
            MediaKind::Audio => {
                let samples_per_frame = (SAMPLE_RATE as i64 * FRAME_MS / 1000) as usize;
                let mut samples = AudioSamples::from_f32(SAMPLE_RATE, 2, &vec![0.1; samples_per_frame * 2]);
                samples.pts = packet.pts;
                samples.pos = packet.pos;
                DecodedFrame::Audio(samples)
            }
            _ => return Err(CodecError::Unsupported),
        };
        self.pending.push_back(frame);
        Ok(SendStatus::Accepted)
    }

    fn receive_frame(&mut self) -> Result<Received, CodecError> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Received::Frame(frame));
        }
        if self.draining {
            self.draining = false;
            return Ok(Received::Eof);
        }
        Ok(Received::Again)
    }

    fn flush(&mut self) {
        self.pending.clear();
        self.draining = false;
    }
}

struct CopyResampler;

impl Resampler for CopyResampler {
    fn convert(&mut self, input: &AudioSamples, out: &mut Vec<f32>) -> Result<usize, AudioError> {
        let samples = input
            .as_interleaved_f32()
            .ok_or_else(|| AudioError::Resample("expected packed f32".into()))?;
        out.extend_from_slice(&samples);
        Ok(input.nb_samples)
    }

    fn set_compensation(&mut self, _delta: i32, _distance: i32) -> Result<(), AudioError> {
        Ok(())
    }
}

struct MemoryBackend {
    info: SourceInfo,
    packets: Vec<Packet>,
    seeks: Arc<Mutex<Vec<SeekSpec>>>,
    closed: Arc<AtomicBool>,
}

impl MemoryBackend {
    fn new(kinds: &[MediaKind], frames: i64) -> Self {
        Self {
            info: source_info(kinds),
            packets: script(kinds, frames),
            seeks: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl MediaBackend for MemoryBackend {
    fn open_source(
        &self,
        _uri: &str,
        _options: &CodecOptions,
        _interrupt: Interrupt,
    ) -> Result<Box<dyn DemuxSource>, DemuxError> {
        Ok(Box::new(MemorySource {
            info: self.info.clone(),
            packets: self.packets.clone(),
            cursor: 0,
            seeks: Arc::clone(&self.seeks),
            closed: Arc::clone(&self.closed),
        }))
    }

    fn open_codec(&self, stream: &StreamInfo, _options: &CodecOptions) -> Result<Box<dyn Codec>, CodecError> {
        Ok(Box::new(PassthroughCodec {
            kind: stream.kind,
            pending: VecDeque::new(),
            draining: false,
        }))
    }

    fn open_resampler(&self, _source: AudioFormat, _target: AudioFormat) -> Result<Box<dyn Resampler>, AudioError> {
        Ok(Box::new(CopyResampler))
    }
}

/// Records the pts of every picture shown.
struct RecordingSink {
    shown: Arc<Mutex<Vec<f64>>>,
}

impl VideoSink for RecordingSink {
    fn size(&self) -> (u32, u32) {
        (320, 240)
    }

    fn display_picture(
        &mut self,
        frame: &mut Frame<VideoPicture>,
        _subtitle: Option<&mut Frame<aves_player::decode::SubtitleFrame>>,
        _rect: DisplayRect,
    ) -> Result<(), RenderError> {
        frame.uploaded = true;
        self.shown.lock().push(frame.pts);
        Ok(())
    }

    fn display_waveform(&mut self, _samples: &[f32], _channels: u16) -> Result<(), RenderError> {
        Ok(())
    }
}

/// A device emulated by a thread pulling 10 ms of audio every 10 ms.
struct PullOutput {
    params: AudioParams,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl AudioOutput for PullOutput {
    fn params(&self) -> AudioParams {
        self.params
    }
}

impl Drop for PullOutput {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct PullOutputFactory;

impl AudioOutputFactory for PullOutputFactory {
    fn open(&self, wanted: AudioSpec, renderer: SharedRenderer) -> Result<Box<dyn AudioOutput>, AudioError> {
        let params = AudioParams::new(wanted.sample_rate, wanted.channels, wanted.buffer_samples());
        renderer.lock().configure(params);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let chunk = (wanted.sample_rate / 100) as usize * wanted.channels as usize;
        let handle = thread::spawn(move || {
            let mut buffer = vec![0.0f32; chunk];
            while !flag.load(Ordering::SeqCst) {
                renderer.lock().fill(&mut buffer);
                thread::sleep(Duration::from_millis(10));
            }
        });
        Ok(Box::new(PullOutput {
            params,
            stop,
            handle: Some(handle),
        }))
    }
}

struct NoDeviceFactory;

impl AudioOutputFactory for NoDeviceFactory {
    fn open(&self, _wanted: AudioSpec, _renderer: SharedRenderer) -> Result<Box<dyn AudioOutput>, AudioError> {
        Err(AudioError::NoDevice)
    }
}

fn open_player(
    config: SessionConfig,
    backend: &Arc<MemoryBackend>,
    factory: Box<dyn AudioOutputFactory>,
) -> (Result<Player, PlayerError>, Arc<Mutex<Vec<f64>>>) {
    let shown = Arc::new(Mutex::new(Vec::new()));
    let sink = RecordingSink {
        shown: Arc::clone(&shown),
    };
    let backend: Arc<dyn MediaBackend> = Arc::clone(backend) as Arc<dyn MediaBackend>;
    (Player::open(config, backend, Box::new(sink), factory), shown)
}

/// Send `Quit` after `after` in case the session never ends by itself.
fn watchdog(commands: &channel::Sender<PlayerCommand>, after: Duration) {
    let commands = commands.clone();
    thread::spawn(move || {
        thread::sleep(after);
        let _ = commands.send(PlayerCommand::Quit);
    });
}

#[test]
fn test_plays_to_end_with_autoexit() {
    let kinds = [MediaKind::Video, MediaKind::Audio];
    let backend = Arc::new(MemoryBackend::new(&kinds, 15));
    let mut config = SessionConfig::new("memory:clip");
    config.autoexit = true;
    let (player, shown) = open_player(config, &backend, Box::new(PullOutputFactory));
    let Ok(mut player) = player else {
        panic!("session failed to open");
    };

    let (tx, rx) = channel::unbounded();
    watchdog(&tx, Duration::from_secs(10));
    assert_eq!(player.run(rx), QuitReason::EndOfStream);

    let shown = shown.lock().clone();
    assert!(!shown.is_empty());
    assert!(shown.windows(2).all(|pair| pair[0] <= pair[1]), "pictures out of order: {shown:?}");
    assert!(player.status().eof);
}

#[test]
fn test_seek_command_jumps_forward() {
    let kinds = [MediaKind::Video, MediaKind::Audio];
    let backend = Arc::new(MemoryBackend::new(&kinds, 250));
    let (player, shown) = open_player(SessionConfig::new("memory:clip"), &backend, Box::new(PullOutputFactory));
    let Ok(mut player) = player else {
        panic!("session failed to open");
    };

    let (tx, rx) = channel::unbounded();
    let commands = tx.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        let _ = commands.send(PlayerCommand::Seek(6.0));
        thread::sleep(Duration::from_millis(500));
        let _ = commands.send(PlayerCommand::Quit);
    });
    watchdog(&tx, Duration::from_secs(10));
    assert_eq!(player.run(rx), QuitReason::Requested);

    let seeks = backend.seeks.lock().clone();
    assert!(seeks.iter().any(|spec| spec.target == 6_000_000 && !spec.by_bytes), "seeks: {seeks:?}");
    let shown = shown.lock().clone();
    assert!(shown.iter().any(|&pts| pts >= 6.0), "shown: {shown:?}");
}

#[test]
fn test_quit_tears_down_source() {
    let kinds = [MediaKind::Video];
    let backend = Arc::new(MemoryBackend::new(&kinds, 1000));
    let (player, _shown) = open_player(SessionConfig::new("memory:clip"), &backend, Box::new(PullOutputFactory));
    let Ok(mut player) = player else {
        panic!("session failed to open");
    };

    let (tx, rx) = channel::unbounded();
    tx.send(PlayerCommand::Quit).unwrap();
    assert_eq!(player.run(rx), QuitReason::Requested);
    assert!(!backend.closed.load(Ordering::SeqCst));

    drop(player);
    assert!(backend.closed.load(Ordering::SeqCst));
}

#[test]
fn test_open_without_playable_streams_fails() {
    let backend = Arc::new(MemoryBackend::new(&[MediaKind::Data], 10));
    let (player, _shown) = open_player(SessionConfig::new("memory:clip"), &backend, Box::new(PullOutputFactory));
    assert!(matches!(player, Err(PlayerError::NoStreams(_))));
}

#[test]
fn test_missing_audio_device_keeps_video() {
    let kinds = [MediaKind::Video, MediaKind::Audio];
    let backend = Arc::new(MemoryBackend::new(&kinds, 50));
    let (player, _shown) = open_player(SessionConfig::new("memory:clip"), &backend, Box::new(NoDeviceFactory));
    let Ok(mut player) = player else {
        panic!("session failed to open");
    };

    assert!(player.state().has_stream(MediaKind::Video));
    assert!(!player.state().has_stream(MediaKind::Audio));

    let (tx, rx) = channel::unbounded();
    tx.send(PlayerCommand::Quit).unwrap();
    assert_eq!(player.run(rx), QuitReason::Requested);
}
