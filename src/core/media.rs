//! Media kinds shared by the demux, decode and playback layers.

use std::fmt;

/// The kind of an elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
    Subtitle,
    Data,
}

impl MediaKind {
    /// The three kinds the player can open a component for.
    pub const PLAYABLE: [MediaKind; 3] = [MediaKind::Video, MediaKind::Audio, MediaKind::Subtitle];

    /// Slot index for per-kind arrays (video, audio, subtitle).
    pub fn slot(self) -> Option<usize> {
        match self {
            MediaKind::Video => Some(0),
            MediaKind::Audio => Some(1),
            MediaKind::Subtitle => Some(2),
            MediaKind::Data => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Subtitle => "subtitle",
            MediaKind::Data => "data",
        };
        f.write_str(name)
    }
}
