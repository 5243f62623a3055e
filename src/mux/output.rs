//! `Output`: a `Target` wrapped by the ISOBMFF muxer. Owns the `Writer`,
//! every `OutputTrack`, and drives the `fastStart` strategy's buffering and
//! finalize behavior.

use std::collections::HashMap;

use crate::config::MuxerConfig;
use crate::demux::track_info::{CodecConfig, TrackInfo};
use crate::error::{MediaError, Result};
use crate::io::target::Target;
use crate::io::writer::Writer;
use crate::mux::strategy::FastStart;
use crate::mux::track::TrackMuxer;
use crate::mux::writer_boxes;
use crate::pipeline::packet::EncodedPacket;

/// Unix epoch offset applied to `mvhd`/`tkhd`/`mdhd` creation/modification
/// times, which count seconds since 1904-01-01.
pub const ISOBMFF_EPOCH_OFFSET: u64 = 2_082_844_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Pending,
    Started,
    Finalized,
    Cancelled,
}

/// One stream being written. Added before `start()`; its codec identity is
/// fixed at the moment its first packet is muxed.
pub struct OutputTrack {
    pub id: u32,
    pub info: TrackInfo,
    pub codec: CodecConfig,
    pub language: String,
    pub(crate) muxer: TrackMuxer,
    pub(crate) chunk_started_at: Option<u64>,
    pub(crate) chunk_offsets: Vec<u64>,
    pub(crate) samples_per_chunk: Vec<u32>,
    /// `moof` start offset for every drained key sample, keyed by its
    /// absolute index into `muxer.samples`. Read by `build_tfra`.
    pub(crate) fragment_moof_offsets: HashMap<u32, u64>,
}

impl OutputTrack {
    fn new(id: u32, info: TrackInfo, codec: CodecConfig, timescale: u32, language: impl Into<String>) -> Self {
        Self {
            id,
            info,
            codec,
            language: language.into(),
            muxer: TrackMuxer::new(timescale),
            chunk_started_at: None,
            chunk_offsets: Vec::new(),
            samples_per_chunk: Vec::new(),
            fragment_moof_offsets: HashMap::new(),
        }
    }

    pub fn timescale(&self) -> u32 {
        self.muxer.timescale
    }
}

pub struct Output<T: Target> {
    writer: Writer<T>,
    pub fast_start: FastStart,
    pub tracks: Vec<OutputTrack>,
    state: OutputState,
    creation_time_unix: u64,
    moof_sequence: u32,
    config: MuxerConfig,
}

impl<T: Target> Output<T> {
    pub fn new(target: T, config: MuxerConfig, creation_time_unix: u64) -> Self {
        Self {
            writer: Writer::new(target),
            fast_start: config.fast_start,
            tracks: Vec::new(),
            state: OutputState::Pending,
            creation_time_unix,
            moof_sequence: 1,
            config,
        }
    }

    pub fn state(&self) -> OutputState {
        self.state
    }

    /// Adds a track before `start()`. Panics-free: returns an error instead
    /// of allowing a duplicate id or a post-start addition.
    pub fn add_track(
        &mut self,
        id: u32,
        info: TrackInfo,
        codec: CodecConfig,
        timescale: u32,
        language: impl Into<String>,
    ) -> Result<()> {
        if !matches!(self.state, OutputState::Pending) {
            return Err(MediaError::internal("tracks can only be added before start()"));
        }
        if self.tracks.iter().any(|t| t.id == id) {
            return Err(MediaError::malformed(format!("duplicate output track id {id}")));
        }
        self.tracks.push(OutputTrack::new(id, info, codec, timescale, language));
        Ok(())
    }

    pub async fn start(&mut self) -> Result<()> {
        if !matches!(self.state, OutputState::Pending) {
            return Err(MediaError::internal("start() called twice"));
        }
        if self.tracks.is_empty() {
            return Err(MediaError::malformed("output has no tracks"));
        }
        self.state = OutputState::Started;
        tracing::debug!(tracks = self.tracks.len(), fast_start = ?self.fast_start, "output started");

        let ftyp = writer_boxes::build_ftyp(self.fast_start == FastStart::Fragmented);
        ftyp.write(&mut self.writer).await?;

        if self.fast_start == FastStart::Fragmented {
            let moov = writer_boxes::build_fragmented_moov(&self.tracks, self.creation_time_unix);
            moov.write(&mut self.writer).await?;
        }
        // Streaming/InMemory/Reserve: moov is deferred to finalize(); those
        // strategies start writing mdat immediately after ftyp below.
        if self.fast_start != FastStart::Fragmented {
            self.writer.write_u32(0).await?; // placeholder mdat size
            self.writer.write_bytes(crate::fourcc::MDAT.as_bytes()).await?;
        }
        Ok(())
    }

    fn chunk_duration_threshold_ticks(&self, timescale: u32) -> u64 {
        let secs = if self.fast_start == FastStart::Fragmented {
            self.config.fragment_duration_secs
        } else {
            self.config.chunk_duration_secs
        };
        (secs * timescale as f64) as u64
    }

    /// Sample admission for one track: runs DTS recovery via the track's
    /// `TrackMuxer`, then decides whether the currently open chunk should
    /// close. Fragmented output additionally requires every other track's
    /// next queued sample to be a key sample before closing, so every
    /// fragment starts key-aligned across tracks.
    pub async fn add_packet(&mut self, track_id: u32, packet: EncodedPacket) -> Result<()> {
        if !matches!(self.state, OutputState::Started) {
            return Err(MediaError::internal("add_packet() before start() or after finalize()"));
        }
        let idx = self
            .tracks
            .iter()
            .position(|t| t.id == track_id)
            .ok_or_else(|| MediaError::malformed(format!("no output track with id {track_id}")))?;

        let position = self.writer.position().await?;
        if self.tracks[idx].chunk_started_at.is_none() {
            let sample_count = self.tracks[idx].muxer.sample_count() as u64;
            let track = &mut self.tracks[idx];
            track.chunk_offsets.push(position);
            track.samples_per_chunk.push(0);
            track.chunk_started_at = Some(sample_count);
        }

        let data = packet.data.clone();
        self.tracks[idx].muxer.add_packet(packet)?;
        self.writer.write_bytes(&data).await?;

        let timescale = self.tracks[idx].timescale();
        let threshold = self.chunk_duration_threshold_ticks(timescale);

        *self.tracks[idx].samples_per_chunk.last_mut().unwrap() += 1;

        let track = &self.tracks[idx];
        let started_at = track.chunk_started_at.unwrap();
        let samples_in_chunk = track.muxer.sample_count() as u64 - started_at;
        let elapsed_ticks: u64 = track
            .muxer
            .samples
            .iter()
            .skip(started_at as usize)
            .map(|s| s.packet.duration_us as u64 * track.muxer.timescale as u64 / 1_000_000)
            .sum();
        let duration_reached = samples_in_chunk > 0 && elapsed_ticks >= threshold;

        let key_aligned = !self.fast_start.requires_key_aligned_chunks()
            || self.tracks.iter().enumerate().all(|(i, t)| i == idx || t.muxer.next_pending_is_key());

        if duration_reached && key_aligned {
            self.tracks[idx].chunk_started_at = None;
        }
        Ok(())
    }

    pub async fn finalize(&mut self) -> Result<()> {
        if !matches!(self.state, OutputState::Started) {
            return Err(MediaError::internal("finalize() requires a started output"));
        }
        for track in &mut self.tracks {
            track.muxer.finish()?;
        }

        if self.fast_start == FastStart::Fragmented {
            self.flush_fragment().await?;
            let mfra = writer_boxes::build_mfra(&self.tracks);
            mfra.write(&mut self.writer).await?;
        } else {
            let mdat_end = self.writer.position().await?;
            // mdat started right after ftyp; recompute its start from the
            // recorded chunk offsets (the very first one, if any track
            // produced samples).
            let mdat_start = self
                .tracks
                .iter()
                .flat_map(|t| t.chunk_offsets.first().copied())
                .min()
                .unwrap_or(mdat_end);
            let mdat_header_start = mdat_start - 8;
            let mdat_size = mdat_end - mdat_header_start;

            self.writer.seek(mdat_header_start).await?;
            self.writer.write_u32(mdat_size as u32).await?;
            self.writer.seek(mdat_end).await?;

            let moov = writer_boxes::build_moov(&self.tracks, self.creation_time_unix);
            moov.write(&mut self.writer).await?;
        }

        self.writer.flush().await?;
        self.writer.finalize().await?;
        self.state = OutputState::Finalized;
        tracing::debug!("output finalized");
        Ok(())
    }

    pub async fn cancel(&mut self) -> Result<()> {
        self.writer.cancel().await?;
        self.state = OutputState::Cancelled;
        tracing::warn!("output cancelled before finalize");
        Ok(())
    }

    /// Reclaims the underlying `Target` once the output is finalized (or
    /// cancelled), e.g. to read the bytes back out of a `MemoryTarget`.
    pub fn into_target(self) -> T {
        self.writer.into_inner()
    }

    pub async fn close_fragment(&mut self) -> Result<()> {
        if self.fast_start != FastStart::Fragmented {
            return Err(MediaError::internal("close_fragment() only applies to fastStart=fragmented"));
        }
        self.flush_fragment().await
    }

    /// Drains every track's currently open chunk into one `moof`/`mdat`
    /// pair and records each drained key sample's `moof` start offset for
    /// `tfra`. Shared by `close_fragment()` and `finalize()`, since a
    /// fragmented output must flush its last, still-open fragment before
    /// appending `mfra` — otherwise every sample since the last
    /// `close_fragment()` call is silently dropped.
    async fn flush_fragment(&mut self) -> Result<()> {
        let mut per_track: HashMap<u32, (u32, u64, Vec<crate::mux::track::Sample>)> = HashMap::new();
        for track in &mut self.tracks {
            if let Some(started_at) = track.chunk_started_at.take() {
                let samples: Vec<_> = track.muxer.samples[started_at as usize..].to_vec();
                if !samples.is_empty() {
                    per_track.insert(track.id, (track.timescale(), started_at, samples));
                }
            }
        }
        if per_track.is_empty() {
            return Ok(());
        }
        tracing::debug!(sequence = self.moof_sequence, tracks = per_track.len(), "closing fragment");

        let moof_input: HashMap<u32, (u32, Vec<crate::mux::track::Sample>)> =
            per_track.iter().map(|(&id, (timescale, _, samples))| (id, (*timescale, samples.clone()))).collect();
        let moof = writer_boxes::build_moof(self.moof_sequence, &moof_input);
        let moof_bytes = moof.encode();
        let moof_start = self.writer.position().await?;
        self.writer.write_bytes(&moof_bytes).await?;

        let mdat_start = self.writer.position().await?;
        self.writer.write_u32(0).await?;
        self.writer.write_bytes(crate::fourcc::MDAT.as_bytes()).await?;
        for (_, (_, _, samples)) in per_track.iter() {
            for sample in samples {
                self.writer.write_bytes(&sample.packet.data).await?;
            }
        }
        let mdat_end = self.writer.position().await?;
        self.writer.seek(mdat_start).await?;
        self.writer.write_u32((mdat_end - mdat_start) as u32).await?;
        self.writer.seek(mdat_end).await?;

        for (track_id, (_, started_at, samples)) in &per_track {
            let Some(track) = self.tracks.iter_mut().find(|t| t.id == *track_id) else { continue };
            for (i, sample) in samples.iter().enumerate() {
                if sample.packet.is_key() {
                    track.fragment_moof_offsets.insert(*started_at as u32 + i as u32, moof_start);
                }
            }
        }

        self.moof_sequence += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::Rotation;
    use crate::io::target::MemoryTarget;
    use crate::pipeline::packet::PacketKind;

    fn video_info() -> TrackInfo {
        TrackInfo::Video {
            width: 640,
            height: 480,
            rotation: Rotation::None,
        }
    }

    #[tokio::test]
    async fn rejects_packets_before_start() {
        let mut out = Output::new(MemoryTarget::new(), MuxerConfig { fast_start: FastStart::Streaming, ..MuxerConfig::default() }, 0);
        out.add_track(1, video_info(), CodecConfig { codec: "avc1".into(), description: None }, 1000, "und")
            .unwrap();
        let err = out
            .add_packet(
                1,
                EncodedPacket {
                    data: bytes::Bytes::new(),
                    kind: PacketKind::Key,
                    timestamp_us: 0,
                    duration_us: 0,
                    sequence_number: 0,
                    side_data: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Internal(_)));
    }

    #[tokio::test]
    async fn start_then_finalize_round_trip_produces_moov() {
        let mut out = Output::new(MemoryTarget::new(), MuxerConfig { fast_start: FastStart::Streaming, ..MuxerConfig::default() }, 0);
        out.add_track(1, video_info(), CodecConfig { codec: "avc1".into(), description: None }, 1000, "und")
            .unwrap();
        out.start().await.unwrap();
        out.add_packet(
            1,
            EncodedPacket {
                data: bytes::Bytes::from_static(b"frame"),
                kind: PacketKind::Key,
                timestamp_us: 0,
                duration_us: 33_000,
                sequence_number: 0,
                side_data: None,
            },
        )
        .await
        .unwrap();
        out.finalize().await.unwrap();
        assert_eq!(out.state(), OutputState::Finalized);
    }
}
