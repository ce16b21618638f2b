use std::fmt::{Display, Formatter};

/// Audio or video elementary stream kind carried by a [`Packet`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Audio,
    Video,
}

/// Codec identifier carried on a packet. Audio packets use `Aac`/`Mp3`,
/// video packets use `Avc`/`Hevc`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodecId {
    Aac,
    Mp3,
    Avc,
    Hevc,
}

impl CodecId {
    pub fn is_audio(&self) -> bool {
        matches!(self, CodecId::Aac | CodecId::Mp3)
    }

    pub fn is_video(&self) -> bool {
        matches!(self, CodecId::Avc | CodecId::Hevc)
    }
}

impl Display for CodecId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CodecId::Aac => "aac",
            CodecId::Mp3 => "mp3",
            CodecId::Avc => "avc",
            CodecId::Hevc => "hevc",
        };
        write!(f, "{}", s)
    }
}

/// Video frame classification, set by the upstream parser.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameType {
    Key,
    Inter,
    Disposable,
    Generated,
    Command,
    VideoInfo,
}

/// An immutable access unit consumed by the controller (§3 "Packet").
///
/// Produced by the (out-of-scope) ingest/demux path; this crate never
/// mutates a packet, only reads its fields to drive segmentation.
#[derive(Clone, Debug)]
pub struct Packet {
    pub kind: PacketKind,
    /// Decode timestamp, 90kHz ticks.
    pub dts: u64,
    /// Presentation timestamp, 90kHz ticks. Only meaningful for video.
    pub pts: u64,
    pub codec: CodecId,
    pub payload: Vec<u8>,
    pub is_sequence_header: bool,
    /// Only set for video packets; `None` for audio.
    pub frame_type: Option<FrameType>,
}

impl Packet {
    pub fn is_keyframe(&self) -> bool {
        matches!(self.frame_type, Some(FrameType::Key))
    }

    pub fn composition_offset(&self) -> i64 {
        self.pts as i64 - self.dts as i64
    }
}
