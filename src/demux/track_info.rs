//! The tagged-enum `TrackInfo`: one `Track` struct carrying a `TrackInfo`
//! payload instead of a base class with video/audio/subtitle subclasses.
//! Capability predicates become pattern matches.

use bytes::Bytes;

use crate::boxes::Rotation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
    Subtitle,
}

#[derive(Debug, Clone)]
pub enum TrackInfo {
    Video {
        width: u32,
        height: u32,
        rotation: Rotation,
    },
    Audio {
        channels: u16,
        sample_rate: u32,
    },
    Subtitle,
}

impl TrackInfo {
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackInfo::Video { .. } => TrackKind::Video,
            TrackInfo::Audio { .. } => TrackKind::Audio,
            TrackInfo::Subtitle => TrackKind::Subtitle,
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, TrackInfo::Video { .. })
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, TrackInfo::Audio { .. })
    }

    pub fn is_subtitle(&self) -> bool {
        matches!(self, TrackInfo::Subtitle)
    }
}

/// Codec identity plus the raw decoder-configuration blob copied verbatim
/// from the relevant config box (`avcC`, `hvcC`, `dOps`, ...).
#[derive(Debug, Clone)]
pub struct CodecConfig {
    pub codec: String,
    pub description: Option<Bytes>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_payload() {
        let v = TrackInfo::Video {
            width: 1,
            height: 1,
            rotation: Rotation::None,
        };
        assert_eq!(v.kind(), TrackKind::Video);
        assert!(v.is_video());
        assert!(!v.is_audio());
    }
}
