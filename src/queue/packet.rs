//! Compressed packets as they travel from the demuxer to a decoder.

/// One compressed packet. An empty payload marks end of stream for its
/// stream and asks the decoder to drain.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    pub stream_index: usize,
    /// Presentation timestamp in the stream time base.
    pub pts: Option<i64>,
    /// Decode timestamp in the stream time base.
    pub dts: Option<i64>,
    /// Duration in the stream time base; 0 when unknown.
    pub duration: i64,
    /// Byte offset in the source, if known.
    pub pos: Option<i64>,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(stream_index: usize, data: Vec<u8>) -> Self {
        Self {
            stream_index,
            data,
            ..Default::default()
        }
    }

    /// The end-of-stream marker for `stream_index`.
    pub fn null(stream_index: usize) -> Self {
        Self {
            stream_index,
            ..Default::default()
        }
    }

    pub fn is_null(&self) -> bool {
        self.data.is_empty()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// pts if present, else dts.
    pub fn timestamp(&self) -> Option<i64> {
        self.pts.or(self.dts)
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self.dts = Some(pts);
        self
    }

    pub fn with_duration(mut self, duration: i64) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_pos(mut self, pos: i64) -> Self {
        self.pos = Some(pos);
        self
    }
}

/// What a packet queue hands out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem {
    Packet(Packet),
    /// Flush sentinel: everything before it belongs to an older generation.
    Flush,
}

/// A queue entry stamped with the generation it was enqueued under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPacket {
    pub item: QueueItem,
    pub serial: i32,
}

impl QueuedPacket {
    pub fn packet(&self) -> Option<&Packet> {
        match &self.item {
            QueueItem::Packet(packet) => Some(packet),
            QueueItem::Flush => None,
        }
    }

    pub fn is_flush(&self) -> bool {
        matches!(self.item, QueueItem::Flush)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_packet() {
        let packet = Packet::null(2);
        assert!(packet.is_null());
        assert_eq!(packet.stream_index, 2);
        assert!(!Packet::new(0, vec![1, 2, 3]).is_null());
    }

    #[test]
    fn test_timestamp_falls_back_to_dts() {
        let mut packet = Packet::new(0, vec![0]);
        packet.dts = Some(40);
        assert_eq!(packet.timestamp(), Some(40));
        packet.pts = Some(80);
        assert_eq!(packet.timestamp(), Some(80));
    }
}
