//! Crate configuration. Two small `serde`-derived structs instead of one
//! global object, because the things they tune (demux read budgets, mux
//! chunking policy) are handed explicitly to `Input`/`Output` rather than
//! read from ambient state — codec registries stay explicit parameters for
//! the same reason. Mirrors a `ServerConfig`/`CacheConfig`
//! split: one struct per concern, each with a `Default` a caller can
//! start from and override piecemeal.

use serde::{Deserialize, Serialize};

use crate::io::reader::{DEFAULT_CHUNK_READER_BUDGET, DEFAULT_METADATA_READER_BUDGET};

/// Tunables for `Input`'s two `Reader`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Eviction budget for the chunk-data reader (sample bytes).
    pub chunk_budget_bytes: u64,
    /// Eviction budget for the metadata reader (`moov`/`moof`/`mfra`).
    pub metadata_budget_bytes: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            chunk_budget_bytes: DEFAULT_CHUNK_READER_BUDGET,
            metadata_budget_bytes: DEFAULT_METADATA_READER_BUDGET,
        }
    }
}

/// Tunables for `Output`'s muxing policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxerConfig {
    pub fast_start: crate::mux::strategy::FastStart,
    /// Seconds of buffered samples before a non-fragmented chunk closes.
    pub chunk_duration_secs: f64,
    /// Seconds of buffered samples before a fragment closes, once every
    /// track has reached a key sample.
    pub fragment_duration_secs: f64,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            fast_start: crate::mux::strategy::FastStart::Streaming,
            chunk_duration_secs: 0.5,
            fragment_duration_secs: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_config_defaults_match_declared_budgets() {
        let cfg = ReaderConfig::default();
        assert_eq!(cfg.chunk_budget_bytes, DEFAULT_CHUNK_READER_BUDGET);
        assert_eq!(cfg.metadata_budget_bytes, DEFAULT_METADATA_READER_BUDGET);
    }

    #[test]
    fn muxer_config_round_trips_through_toml() {
        let cfg = MuxerConfig::default();
        let text = toml::to_string(&cfg).unwrap();
        let back: MuxerConfig = toml::from_str(&text).unwrap();
        assert_eq!(cfg, back);
    }
}
