use std::path::PathBuf;

/// Container profile a muxer variant produces (§3 "Segment", `container`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Container {
    Ts,
    Fmp4,
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Ts => "ts",
            Container::Fmp4 => "m4s",
        }
    }
}

/// Per-segment encryption state. TS uses full-segment AES-128-CBC; fMP4 uses
/// per-sample SAMPLE-AES (CBCS). See `crypto.rs` for key material generation.
#[derive(Clone, Debug)]
pub enum SegmentKey {
    None,
    Ts { key: [u8; 16], iv: [u8; 16] },
    Cbcs {
        kid: [u8; 16],
        const_iv: Vec<u8>,
        iv: [u8; 16],
    },
}

impl SegmentKey {
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, SegmentKey::None)
    }

    /// IV used in the `#EXT-X-KEY` playlist line, as 32 lowercase hex chars.
    pub fn iv_hex(&self) -> Option<String> {
        match self {
            SegmentKey::None => None,
            SegmentKey::Ts { iv, .. } => Some(hex::encode(iv)),
            SegmentKey::Cbcs { const_iv, .. } => Some(hex::encode(const_iv)),
        }
    }
}

/// Unit of output and unit of playlist enumeration (§3 "Segment").
#[derive(Clone, Debug)]
pub struct Segment {
    pub sequence_no: u64,
    pub path: PathBuf,
    pub tmp_path: PathBuf,
    /// Playlist-relative URI (operator prefix + m3u8 directory + filename).
    pub uri: String,
    /// Accumulated duration, 90kHz ticks.
    pub duration: u64,
    pub discontinuity: bool,
    pub key: SegmentKey,
    pub closed: bool,
    pub container: Container,
    /// Identifies which key-rotation period this segment belongs to, so the
    /// playlist writer knows when to re-emit `#EXT-X-KEY` vs. inherit.
    pub key_rotation_id: u64,
}

impl Segment {
    pub fn duration_secs(&self) -> f64 {
        self.duration as f64 / 90_000.0
    }
}
