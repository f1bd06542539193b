//! Headless command-line player.
//!
//! Plays one input through the FFmpeg backend and the default cpal output
//! device. Pictures go to a logging sink; single-key commands are read from
//! stdin, one line at a time.

use std::io::{self, Read};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::{Parser, ValueEnum};
use crossbeam::channel::{self, Sender};

use aves_player::audio::CpalOutputFactory;
use aves_player::config::{CodecOptions, Framedrop, SessionConfig, ShowMode, SyncMaster};
use aves_player::core::MediaKind;
use aves_player::media::FfmpegBackend;
use aves_player::render::LoggingVideoSink;
use aves_player::{Player, PlayerCommand, QuitReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SyncArg {
    Audio,
    Video,
    Ext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ShowModeArg {
    Video,
    Waves,
    None,
}

/// Play an audio/video file or stream.
#[derive(Parser, Debug)]
#[command(name = "aves-player", version, long_about = None)]
struct Args {
    /// URL or file path
    input: String,

    /// Disable audio
    #[arg(long = "an")]
    no_audio: bool,

    /// Disable video
    #[arg(long = "vn")]
    no_video: bool,

    /// Disable subtitles
    #[arg(long = "sn")]
    no_subtitles: bool,

    /// Audio stream index
    #[arg(long)]
    ast: Option<usize>,

    /// Video stream index
    #[arg(long)]
    vst: Option<usize>,

    /// Subtitle stream index
    #[arg(long)]
    sst: Option<usize>,

    /// Seek by bytes (0 = off, 1 = on, -1 = auto)
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    bytes: i32,

    /// Seek interval for left/right keys, in seconds
    #[arg(long, default_value_t = 10.0)]
    seek_interval: f64,

    /// Start position, in seconds
    #[arg(long)]
    ss: Option<f64>,

    /// Play this many seconds
    #[arg(short = 't', long)]
    duration: Option<f64>,

    /// Master clock
    #[arg(long, value_enum, default_value_t = SyncArg::Audio)]
    sync: SyncArg,

    /// Drop late frames even when video is the master clock
    #[arg(long, conflicts_with = "noframedrop")]
    framedrop: bool,

    /// Never drop late frames
    #[arg(long)]
    noframedrop: bool,

    /// Don't limit the input buffer size
    #[arg(long)]
    infbuf: bool,

    /// Number of plays, 0 loops forever
    #[arg(long = "loop", default_value_t = 1)]
    loop_count: i32,

    /// Exit at the end of the input
    #[arg(long)]
    autoexit: bool,

    /// Startup volume, 0 to 100
    #[arg(long, default_value_t = 100)]
    volume: i32,

    /// What to show
    #[arg(long, value_enum)]
    showmode: Option<ShowModeArg>,

    /// Timestamp reordering (0 = packet dts, 1 = frame pts, -1 = auto)
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    drp: i32,

    /// Non standard-compliant decoder optimizations
    #[arg(long)]
    fast: bool,

    /// Decode at reduced resolution
    #[arg(long, default_value_t = 0)]
    lowres: u8,

    /// Generate missing pts
    #[arg(long)]
    genpts: bool,

    /// Width of the logged display area
    #[arg(long, default_value_t = 640)]
    width: u32,

    /// Height of the logged display area
    #[arg(long, default_value_t = 480)]
    height: u32,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::new(self.input.clone());
        config.wanted_streams = [self.vst, self.ast, self.sst];
        config.disable_video = self.no_video;
        config.disable_audio = self.no_audio;
        config.disable_subtitles = self.no_subtitles;
        config.seek_by_bytes = match self.bytes {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        };
        config.seek_interval = self.seek_interval;
        config.start_time = self.ss;
        config.duration = self.duration;
        config.sync_master = match self.sync {
            SyncArg::Audio => SyncMaster::Audio,
            SyncArg::Video => SyncMaster::Video,
            SyncArg::Ext => SyncMaster::External,
        };
        config.framedrop = if self.framedrop {
            Framedrop::Always
        } else if self.noframedrop {
            Framedrop::Never
        } else {
            Framedrop::Auto
        };
        config.infinite_buffer = self.infbuf.then_some(true);
        config.loop_count = self.loop_count;
        config.autoexit = self.autoexit;
        config.startup_volume = self.volume.clamp(0, 100);
        config.show_mode = self.showmode.map(|mode| match mode {
            ShowModeArg::Video => ShowMode::Video,
            ShowModeArg::Waves => ShowMode::Waves,
            ShowModeArg::None => ShowMode::None,
        });
        config.reorder_pts = match self.drp {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        };
        config.codec = CodecOptions {
            fast: self.fast,
            lowres: self.lowres,
            genpts: self.genpts,
        };
        config
    }
}

/// Map one key to a command. `framedrop` tracks the current policy so `f`
/// can cycle it.
fn key_command(key: char, seek_interval: f64, framedrop: &mut Framedrop) -> Option<PlayerCommand> {
    let command = match key {
        'q' => PlayerCommand::Quit,
        'p' | ' ' => PlayerCommand::TogglePause,
        's' => PlayerCommand::StepFrame,
        'm' => PlayerCommand::ToggleMute,
        '0' | '*' => PlayerCommand::Volume(1),
        '9' | '/' => PlayerCommand::Volume(-1),
        'a' => PlayerCommand::CycleStream(MediaKind::Audio),
        'v' => PlayerCommand::CycleStream(MediaKind::Video),
        't' => PlayerCommand::CycleStream(MediaKind::Subtitle),
        'w' => PlayerCommand::ToggleShowMode,
        'f' => {
            *framedrop = match *framedrop {
                Framedrop::Auto => Framedrop::Always,
                Framedrop::Always => Framedrop::Never,
                Framedrop::Never => Framedrop::Auto,
            };
            PlayerCommand::SetFramedrop(*framedrop)
        }
        'l' => PlayerCommand::SeekRelative(-seek_interval),
        'r' => PlayerCommand::SeekRelative(seek_interval),
        'd' => PlayerCommand::SeekRelative(-60.0),
        'u' => PlayerCommand::SeekRelative(60.0),
        '[' => PlayerCommand::SeekChapter(-1),
        ']' => PlayerCommand::SeekChapter(1),
        _ => return None,
    };
    Some(command)
}

fn spawn_key_reader(commands: Sender<PlayerCommand>, seek_interval: f64, framedrop: Framedrop) -> io::Result<()> {
    thread::Builder::new().name("keys".to_string()).spawn(move || {
        let mut framedrop = framedrop;
        for byte in io::stdin().lock().bytes() {
            let Ok(byte) = byte else { break };
            let Some(command) = key_command(byte as char, seek_interval, &mut framedrop) else {
                continue;
            };
            if commands.send(command).is_err() {
                break;
            }
        }
    })?;
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.session_config();

    let backend = match FfmpegBackend::new() {
        Ok(backend) => backend,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let (tx, rx) = channel::unbounded();
    if let Err(e) = spawn_key_reader(tx, config.seek_interval, config.framedrop) {
        tracing::warn!("Keyboard input unavailable: {e}");
    }

    let sink = LoggingVideoSink::new(args.width, args.height);
    let mut player = match Player::open(config, Arc::new(backend), Box::new(sink), Box::new(CpalOutputFactory)) {
        Ok(player) => player,
        Err(e) => {
            tracing::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match player.run(rx) {
        QuitReason::Error(reason) => {
            tracing::error!("{reason}");
            ExitCode::FAILURE
        }
        reason => {
            tracing::info!(?reason, "Playback finished");
            ExitCode::SUCCESS
        }
    }
}
