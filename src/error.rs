use std::path::PathBuf;

/// Typed failure surface for the segmenter, one variant per §7 error kind.
///
/// Leaf components (window, crypto, mux) return `Result<T, SegmenterError>`
/// so the controller can match on `kind()` and apply `hls_on_error` policy.
#[derive(thiserror::Error, Debug)]
pub enum SegmenterError {
    #[error("config invalid: {0}")]
    ConfigInvalid(String),

    #[error("io error on {path}: {source}")]
    IoTransient {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("playlist write failed for {path}: {source}")]
    PlaylistWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("key material generation failed: {0}")]
    CryptoRng(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

impl SegmenterError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SegmenterError::IoTransient {
            path: path.into(),
            source,
        }
    }

    pub fn playlist(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SegmenterError::PlaylistWrite {
            path: path.into(),
            source,
        }
    }

    /// True for failures that `hls_on_error` policy applies to (§7 IoTransient).
    pub fn is_io_transient(&self) -> bool {
        matches!(self, SegmenterError::IoTransient { .. })
    }
}

pub type Result<T> = std::result::Result<T, SegmenterError>;

/// `hls_on_error` directive: what the controller does when a write fails mid-stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OnErrorPolicy {
    /// Log and continue with the next packet; may silently drop content.
    Ignore,
    /// Reap-and-reopen a fresh segment; enter fault state if reopen also fails.
    #[default]
    Continue,
    /// Treat as fatal, force unpublish.
    Disconnect,
}

impl OnErrorPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ignore" => Some(OnErrorPolicy::Ignore),
            "continue" => Some(OnErrorPolicy::Continue),
            "disconnect" => Some(OnErrorPolicy::Disconnect),
            _ => None,
        }
    }
}
