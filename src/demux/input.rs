//! `Input`: a `Source` interpreted by the ISOBMFF container codec. Owns
//! its `Reader` exclusively — a single
//! logical demuxer job holds it, so every method here takes `&mut self`
//! rather than reintroducing a lock the borrow checker already gives us
//! for free (see DESIGN.md for why no `fragmentLookupMutex` is needed).

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ReaderConfig;
use crate::demux::fragment::FragmentArena;
use crate::demux::metadata::{read_metadata, MovieMetadata};
use crate::demux::sample_table::SampleTable;
use crate::demux::track_info::{CodecConfig, TrackInfo};
use crate::error::{MediaError, Result};
use crate::io::{Reader, Source};

/// One elementary stream, as exposed to callers.
#[derive(Debug, Clone)]
pub struct InputTrack {
    pub id: u32,
    pub timescale: u32,
    pub duration: u64,
    pub info: TrackInfo,
    pub codec: String,
    pub codec_description: Option<bytes::Bytes>,
}

/// One resolved packet location, shared between the fragmented and
/// non-fragmented lookup paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketLocation {
    pub sample_index: u32,
    pub presentation_timestamp: u64,
    pub decode_timestamp: u64,
    pub duration: u64,
    pub offset: u64,
    pub size: u32,
    pub key: bool,
}

#[derive(Debug)]
pub struct Input {
    pub(crate) reader: Reader,
    pub(crate) chunk_reader: Reader,
    pub(crate) metadata: MovieMetadata,
    pub(crate) sample_tables: HashMap<u32, SampleTable>,
    pub(crate) fragments: FragmentArena,
    pub(crate) fragment_scan_pos: u64,
}

impl Input {
    pub async fn open(source: Arc<dyn Source>, config: ReaderConfig) -> Result<Self> {
        let mut reader = Reader::new(source.clone(), config.metadata_budget_bytes);
        let chunk_reader = Reader::new(source, config.chunk_budget_bytes);
        let metadata = read_metadata(&mut reader).await?;
        tracing::debug!(
            tracks = metadata.tracks.len(),
            fragmented = metadata.fragmented,
            "opened input"
        );
        Ok(Self {
            reader,
            chunk_reader,
            metadata,
            sample_tables: HashMap::new(),
            fragments: FragmentArena::default(),
            fragment_scan_pos: 0,
        })
    }

    pub fn timescale(&self) -> u32 {
        self.metadata.timescale
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.metadata.timescale == 0 {
            0.0
        } else {
            self.metadata.duration as f64 / self.metadata.timescale as f64
        }
    }

    pub fn is_fragmented(&self) -> bool {
        self.metadata.fragmented
    }

    pub fn tracks(&self) -> Vec<InputTrack> {
        self.metadata
            .tracks
            .iter()
            .map(|t| InputTrack {
                id: t.id,
                timescale: t.timescale,
                duration: t.duration,
                info: t.info.clone(),
                codec: t.codec_config.codec.clone(),
                codec_description: t.codec_config.description.clone(),
            })
            .collect()
    }

    fn track_meta(&self, track_id: u32) -> Result<&crate::demux::metadata::InputTrackMeta> {
        self.metadata
            .tracks
            .iter()
            .find(|t| t.id == track_id)
            .ok_or_else(|| MediaError::malformed(format!("no track with id {track_id}")))
    }

    fn is_pcm_like(codec: &str) -> bool {
        matches!(codec, "twos" | "sowt" | "raw " | "in24" | "in32" | "fl32" | "fl64" | "ulaw" | "alaw" | "NONE")
    }

    /// Build (and cache) the non-fragmented `SampleTable` for `track_id`.
    pub async fn sample_table(&mut self, track_id: u32) -> Result<&SampleTable> {
        if !self.sample_tables.contains_key(&track_id) {
            let meta = self.track_meta(track_id)?;
            let (start, end) = meta.stbl_range.ok_or_else(|| {
                MediaError::malformed(format!("track {track_id} has no stbl (is this a fragmented file?)"))
            })?;
            let pcm_collapse = Self::is_pcm_like(&meta.codec_config.codec);
            self.reader.load_range(start, end).await?;
            let data = self.reader.read_range(start, end)?;
            let table = SampleTable::parse(&data, pcm_collapse).map_err(|e| {
                // A Malformed sample table demotes this track,
                // it must not kill the whole Input.
                MediaError::malformed(format!("track {track_id} sample table: {e}"))
            })?;
            self.reader.forget_range(start, end);
            self.sample_tables.insert(track_id, table);
        }
        Ok(self.sample_tables.get(&track_id).unwrap())
    }

    pub async fn get_sample_info(&mut self, track_id: u32, index: u32) -> Result<PacketLocation> {
        let table = self.sample_table(track_id).await?;
        let info = table.sample_info(index)?;
        Ok(PacketLocation {
            sample_index: index,
            presentation_timestamp: info.presentation_timestamp,
            decode_timestamp: info.decode_timestamp,
            duration: info.duration,
            offset: info.offset,
            size: info.size,
            key: info.key,
        })
    }

    pub async fn sample_bytes(&mut self, location: &PacketLocation) -> Result<bytes::Bytes> {
        let end = location.offset + location.size as u64;
        self.chunk_reader.load_range(location.offset, end).await?;
        self.chunk_reader.read_range(location.offset, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::source::MemorySource;

    fn leaf(tag: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut v = ((8 + body.len()) as u32).to_be_bytes().to_vec();
        v.extend(tag.iter());
        v.extend(body);
        v
    }

    #[tokio::test]
    async fn open_fails_cleanly_on_garbage_input() {
        let source: Arc<dyn Source> = Arc::new(MemorySource::new(leaf(b"free", b"not a moov")));
        let err = Input::open(source, ReaderConfig::default()).await.unwrap_err();
        assert!(matches!(err, MediaError::Malformed(_)));
    }
}
