use thiserror::Error;

/// Main error type for the container engine.
///
/// Core helpers never catch; they surface. A `Malformed` error raised while
/// scanning `moov` for the first time is fatal to the whole `Input`. The
/// same error raised while building a single track's sample table only
/// demotes that track to unusable and leaves its peers alone.
#[derive(Error, Debug)]
pub enum MediaError {
    /// Container brand, codec, or feature recognized but not implemented.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Structural violation: oversized box, truncated `trun`, a PTS placed
    /// before the last key sample, and similar.
    #[error("malformed: {0}")]
    Malformed(String),

    /// Operation invoked in the wrong state (`add_packet` before `start`,
    /// `start` called twice, reading before `start` on an `Input`, ...).
    #[error("not ready: {0}")]
    NotReady(String),

    /// `Source` read failure.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// `Target` write failure.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// Raised by a `Decoder` collaborator.
    #[error("decode failed: {0}")]
    DecodeFailed(String),

    /// Raised by an `Encoder` collaborator.
    #[error("encode failed: {0}")]
    EncodeFailed(String),

    /// An iterator or a conversion was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// An invariant was violated; always a bug in the engine, never in the
    /// caller's input.
    #[error("internal error: {0}")]
    Internal(String),

    /// A standard I/O error from a `Source`/`Target` backing store.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MediaError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        MediaError::Malformed(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        MediaError::Unsupported(msg.into())
    }

    pub fn not_ready(msg: impl Into<String>) -> Self {
        MediaError::NotReady(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        MediaError::Internal(msg.into())
    }

    /// True for errors that demote a single track rather than killing the
    /// whole input.
    pub fn is_track_local(&self) -> bool {
        matches!(self, MediaError::Malformed(_) | MediaError::Unsupported(_))
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MediaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_local_classification() {
        assert!(MediaError::malformed("bad stsz").is_track_local());
        assert!(MediaError::unsupported("av2").is_track_local());
        assert!(!MediaError::Cancelled.is_track_local());
        assert!(!MediaError::internal("bug").is_track_local());
    }

    #[test]
    fn display_messages_carry_context() {
        let err = MediaError::malformed("truncated trun");
        assert_eq!(err.to_string(), "malformed: truncated trun");
    }
}
