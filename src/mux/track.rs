//! Per-track muxer state: sample admission, DTS recovery via "sort PTS and
//! zip", and the compact time-to-sample / composition-offset run tables.

use crate::error::{MediaError, Result};
use crate::pipeline::packet::EncodedPacket;

/// An `EncodedPacket` annotated with its resolved decode timestamp and the
/// tick delta to the next sample.
#[derive(Debug, Clone)]
pub struct Sample {
    pub packet: EncodedPacket,
    pub decode_timestamp: u64,
    pub ticks_to_next: u32,
    pub composition_offset: i32,
}

/// A contiguous run of samples sharing one container-level byte offset.
#[derive(Debug, Default)]
pub struct Chunk {
    pub start_timestamp: u64,
    pub samples: Vec<Sample>,
    pub offset: Option<u64>,
}

/// One pending sample whose decode timestamp is not yet final, queued
/// until the next key sample triggers PTS-sort-and-zip recovery.
#[derive(Debug, Clone)]
struct PendingSample {
    packet: EncodedPacket,
    tentative_timestamp_ticks: u64,
}

pub struct TrackMuxer {
    pub timescale: u32,
    first_timestamp_us: Option<i64>,
    last_key_timestamp_us: Option<i64>,
    pending: Vec<PendingSample>,
    pub(crate) samples: Vec<Sample>,
    pub(crate) time_to_sample: Vec<(u32, u32)>,
    pub(crate) composition_offsets: Vec<(u32, i32)>,
    pub(crate) key_sample_indices: Vec<u32>,
    last_decode_timestamp_ticks: Option<u64>,
}

impl TrackMuxer {
    pub fn new(timescale: u32) -> Self {
        Self {
            timescale,
            first_timestamp_us: None,
            last_key_timestamp_us: None,
            pending: Vec::new(),
            samples: Vec::new(),
            time_to_sample: Vec::new(),
            composition_offsets: Vec::new(),
            key_sample_indices: Vec::new(),
            last_decode_timestamp_ticks: None,
        }
    }

    fn ticks(&self, us: i64) -> u64 {
        ((us as i128 * self.timescale as i128) / 1_000_000).max(0) as u64
    }

    /// Admits one packet, recovering its decode timestamp once enough
    /// lookahead has accumulated.
    pub fn add_packet(&mut self, packet: EncodedPacket) -> Result<()> {
        if packet.timestamp_us < 0 {
            return Err(MediaError::malformed("packet timestamp_us must be >= 0"));
        }
        if let Some(last_key) = self.last_key_timestamp_us {
            if packet.timestamp_us < last_key {
                return Err(MediaError::malformed(
                    "packet timestamp precedes the last key sample's timestamp",
                ));
            }
        }

        let first = *self.first_timestamp_us.get_or_insert(packet.timestamp_us);
        let relative_us = packet.timestamp_us - first;
        let is_key = packet.is_key();

        self.pending.push(PendingSample {
            packet,
            tentative_timestamp_ticks: self.ticks(relative_us),
        });

        if is_key {
            self.last_key_timestamp_us = Some(relative_us + first);
            self.process_queue()?;
        }
        Ok(())
    }

    /// DTS recovery: sort the queue's tentative (== presentation-order)
    /// timestamps ascending, then zip them back against the samples in
    /// their original arrival order.
    fn process_queue(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut sorted_ticks: Vec<u64> = self.pending.iter().map(|p| p.tentative_timestamp_ticks).collect();
        sorted_ticks.sort_unstable();

        let pending = std::mem::take(&mut self.pending);
        for (pending_sample, decode_timestamp) in pending.into_iter().zip(sorted_ticks) {
            let presentation_ticks = pending_sample.tentative_timestamp_ticks;
            let composition_offset = presentation_ticks as i64 - decode_timestamp as i64;

            if let Some(prev) = self.last_decode_timestamp_ticks {
                let delta = decode_timestamp.saturating_sub(prev) as u32;
                push_run(&mut self.time_to_sample, delta);
            }
            self.last_decode_timestamp_ticks = Some(decode_timestamp);

            push_i32_run(&mut self.composition_offsets, composition_offset as i32);

            if pending_sample.packet.is_key() {
                self.key_sample_indices.push(self.samples.len() as u32);
            }

            self.samples.push(Sample {
                packet: pending_sample.packet,
                decode_timestamp,
                ticks_to_next: 0,
                composition_offset: composition_offset as i32,
            });
        }
        Ok(())
    }

    /// Drains any samples still waiting on a future key sample. Called at
    /// finalize — without a following key, their relative order is already
    /// known (arrival order), so the same sort-and-zip still applies.
    pub fn finish(&mut self) -> Result<()> {
        self.process_queue()?;
        // The final time-to-sample run needs one more entry for the last
        // sample's own duration-to-next, using its packet duration.
        if let Some(last) = self.samples.last() {
            let duration_ticks = self.ticks(last.packet.duration_us);
            push_run(&mut self.time_to_sample, duration_ticks as u32);
        }
        Ok(())
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// True when the queue has no sample still waiting on DTS recovery, or
    /// its first-arrived (and thus first-decoded once a key flushes it) entry
    /// is itself a key sample. Used to gate chunk closes in fragmented output
    /// on every other track's next sample being key-aligned.
    pub(crate) fn next_pending_is_key(&self) -> bool {
        self.pending.first().map(|p| p.packet.is_key()).unwrap_or(true)
    }
}

fn push_run(runs: &mut Vec<(u32, u32)>, delta: u32) {
    match runs.last_mut() {
        Some((count, last_delta)) if *last_delta == delta => *count += 1,
        _ => runs.push((1, delta)),
    }
}

fn push_i32_run(runs: &mut Vec<(u32, i32)>, value: i32) {
    match runs.last_mut() {
        Some((count, last)) if *last == value => *count += 1,
        _ => runs.push((1, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::packet::PacketKind;
    use bytes::Bytes;

    fn packet(ts_us: i64, kind: PacketKind) -> EncodedPacket {
        EncodedPacket {
            data: Bytes::from_static(b"x"),
            kind,
            timestamp_us: ts_us,
            duration_us: 1000,
            sequence_number: 0,
            side_data: None,
        }
    }

    #[test]
    fn key_sample_triggers_dts_recovery_for_queued_deltas() {
        let mut track = TrackMuxer::new(1000);
        track.add_packet(packet(0, PacketKind::Key)).unwrap();
        track.add_packet(packet(40, PacketKind::Delta)).unwrap();
        track.add_packet(packet(120, PacketKind::Delta)).unwrap();
        track.add_packet(packet(80, PacketKind::Delta)).unwrap();
        // New key sample flushes the prior run.
        track.add_packet(packet(160, PacketKind::Key)).unwrap();

        assert_eq!(track.samples.len(), 4);
        // Decode order should be the sorted presentation order: 0,40,80,120.
        let dts: Vec<u64> = track.samples.iter().map(|s| s.decode_timestamp).collect();
        assert_eq!(dts, vec![0, 40, 80, 120]);
    }

    #[test]
    fn timestamp_before_last_key_is_rejected() {
        let mut track = TrackMuxer::new(1000);
        track.add_packet(packet(100, PacketKind::Key)).unwrap();
        let err = track.add_packet(packet(50, PacketKind::Key)).unwrap_err();
        assert!(matches!(err, MediaError::Malformed(_)));
    }

    #[test]
    fn finish_flushes_trailing_non_keyed_queue() {
        let mut track = TrackMuxer::new(1000);
        track.add_packet(packet(0, PacketKind::Key)).unwrap();
        track.add_packet(packet(40, PacketKind::Delta)).unwrap();
        track.finish().unwrap();
        assert_eq!(track.samples.len(), 2);
    }
}
