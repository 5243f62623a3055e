//! The four `fastStart` muxing strategies, and the behavior each implies
//! for buffering and finalize.

use serde::{Deserialize, Serialize};

/// How `Output` lays out `moov` relative to sample data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FastStart {
    /// Buffer every sample in memory; write `ftyp`+`moov`+`mdat` only on
    /// `finalize`. Unbounded memory, smallest possible file (no `free`
    /// padding), always seekable-correct.
    InMemory,
    /// Reserve a `free` box sized from an expected chunk count up front,
    /// write chunks as they arrive, then shrink/patch `free` and splice
    /// `moov` in ahead of `mdat` at `finalize`. Bounded memory as long as
    /// the estimate holds; falls back to `InMemory`-style buffering for
    /// the tail if the reservation is exceeded (see DESIGN.md open
    /// question).
    Reserve,
    /// Write `mdat` first, `moov` last (the classic non-fragmented
    /// streaming layout). Default. Requires no seek-back beyond `mdat`'s
    /// own size field.
    Streaming,
    /// Fragmented: `ftyp`+`moov`(empty `mvex`-bearing)+repeating
    /// `moof`+`mdat`, optionally closed by `mfra`. No seek-back at all;
    /// works on append-only targets.
    Fragmented,
}

impl Default for FastStart {
    fn default() -> Self {
        FastStart::Streaming
    }
}

impl FastStart {
    /// Whether this strategy requires every sample to be resident before
    /// any bytes reach the `Target`.
    pub fn buffers_fully(self) -> bool {
        matches!(self, FastStart::InMemory)
    }

    /// Whether chunk boundaries must be key-sample-aligned across every
    /// track (true for fragmented output, since a fragment can only start
    /// at a sync point).
    pub fn requires_key_aligned_chunks(self) -> bool {
        matches!(self, FastStart::Fragmented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_in_memory_buffers_fully() {
        assert!(FastStart::InMemory.buffers_fully());
        assert!(!FastStart::Streaming.buffers_fully());
        assert!(!FastStart::Reserve.buffers_fully());
        assert!(!FastStart::Fragmented.buffers_fully());
    }

    #[test]
    fn only_fragmented_requires_key_alignment() {
        assert!(FastStart::Fragmented.requires_key_aligned_chunks());
        assert!(!FastStart::Streaming.requires_key_aligned_chunks());
    }

    #[test]
    fn default_is_streaming() {
        assert_eq!(FastStart::default(), FastStart::Streaming);
    }
}
