/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header names a frame id with no known body layout.
    #[error("unknown frame id {0:#06x}")]
    UnknownFrameId(u16),

    /// A record was decoded from fewer bytes than its fixed size.
    #[error("truncated record (expected {expected} bytes, got {actual})")]
    Truncated { expected: usize, actual: usize },

    /// The stream ended part way through a frame.
    #[error("stream ended mid-frame ({buffered} bytes buffered)")]
    IncompleteFrame { buffered: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed on a frame boundary.
    #[error("connection closed")]
    ConnectionClosed,
}

impl FrameError {
    /// True for protocol faults after which the byte stream cannot be realigned.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            FrameError::UnknownFrameId(_)
                | FrameError::Truncated { .. }
                | FrameError::IncompleteFrame { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
