//! `Decoder`/`Encoder` contracts and the sample sinks that drive a decoder
//! from a packet sink's key-aligned runs.
//!
//! This crate never ships a concrete decoder: pixel/sample decode is the
//! surrounding host's job. A decoder is any type implementing `Decoder`;
//! tests supply a trivial passthrough double.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::Result;
use crate::pipeline::packet::EncodedPacket;
use crate::pipeline::sink::EncodedPacketSink;

/// A raw decoded unit: video frame or audio buffer. The pipeline never
/// looks inside `data`; it only needs the presentation timestamp to answer
/// timestamp-addressed queries.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub data: bytes::Bytes,
    pub timestamp_us: i64,
    pub duration_us: i64,
}

/// Packets are submitted in order, but frames may arrive out of
/// order relative to submission but are consumed here in presentation
/// order via `VideoSampleSink`/`AudioSampleSink`.
pub trait Decoder: Send {
    fn configure(&mut self, codec: &str, description: Option<&bytes::Bytes>) -> Result<()>;
    fn decode(&mut self, packet: &EncodedPacket) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    /// Drain frames made available since the last call.
    fn poll_frames(&mut self) -> Vec<DecodedFrame>;
    fn inflight(&self) -> usize;
}

pub trait Encoder: Send {
    fn configure(&mut self, codec: &str, bitrate: Option<u64>) -> Result<()>;
    fn encode(&mut self, frame: &DecodedFrame, force_key: bool) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn poll_packets(&mut self) -> Vec<EncodedPacket>;
}

/// Caps `frameQueue.length + decoder.inflight` at this value.
const MAX_DECODE_QUEUE: usize = 8;

/// Feeds key-aligned packet runs from an `EncodedPacketSink` into a
/// `Decoder` and yields decoded frames at requested timestamps, caching
/// the last-decoded frame to answer duplicate queries without re-decoding.
pub struct SampleSink<D: Decoder> {
    sink: Arc<EncodedPacketSink>,
    decoder: D,
    queued_frames: VecDeque<DecodedFrame>,
    last_frame: Option<DecodedFrame>,
    cursor: Option<EncodedPacket>,
}

impl<D: Decoder> SampleSink<D> {
    pub fn new(sink: Arc<EncodedPacketSink>, decoder: D) -> Self {
        Self {
            sink,
            decoder,
            queued_frames: VecDeque::new(),
            last_frame: None,
            cursor: None,
        }
    }

    /// Decode the key-aligned run covering `timestamp_us` and return the
    /// frame whose presentation window contains it, decoding only as many
    /// packets as needed to respect `MAX_DECODE_QUEUE`.
    pub async fn frame_at(&mut self, timestamp_us: i64) -> Result<Option<DecodedFrame>> {
        if let Some(last) = &self.last_frame {
            if last.timestamp_us <= timestamp_us && timestamp_us < last.timestamp_us + last.duration_us {
                return Ok(Some(last.clone()));
            }
        }

        let mut packet = match &self.cursor {
            Some(p) => self.sink.get_next(p).await?,
            None => self.sink.get_key_at_timestamp(timestamp_us).await?,
        };

        while let Some(p) = packet.take() {
            if self.queued_frames.len() + self.decoder.inflight() >= MAX_DECODE_QUEUE {
                break;
            }
            self.decoder.decode(&p)?;
            self.queued_frames.extend(self.decoder.poll_frames());
            self.cursor = Some(p.clone());

            if p.timestamp_us >= timestamp_us {
                break;
            }
            packet = self.sink.get_next(&p).await?;
        }

        while let Some(frame) = self.queued_frames.pop_front() {
            if frame.timestamp_us <= timestamp_us && timestamp_us < frame.timestamp_us + frame.duration_us {
                self.last_frame = Some(frame.clone());
                return Ok(Some(frame));
            }
            self.last_frame = Some(frame);
        }
        Ok(self.last_frame.clone())
    }
}

pub type VideoSampleSink<D> = SampleSink<D>;
pub type AudioSampleSink<D> = SampleSink<D>;

#[cfg(test)]
mod tests {
    use super::*;

    struct PassthroughDecoder {
        pending: Vec<DecodedFrame>,
    }

    impl Decoder for PassthroughDecoder {
        fn configure(&mut self, _codec: &str, _description: Option<&bytes::Bytes>) -> Result<()> {
            Ok(())
        }
        fn decode(&mut self, packet: &EncodedPacket) -> Result<()> {
            self.pending.push(DecodedFrame {
                data: packet.data.clone(),
                timestamp_us: packet.timestamp_us,
                duration_us: packet.duration_us,
            });
            Ok(())
        }
        fn flush(&mut self) -> Result<()> {
            Ok(())
        }
        fn poll_frames(&mut self) -> Vec<DecodedFrame> {
            std::mem::take(&mut self.pending)
        }
        fn inflight(&self) -> usize {
            0
        }
    }

    #[test]
    fn passthrough_decoder_emits_what_it_consumes() {
        use crate::pipeline::packet::PacketKind;
        let mut d = PassthroughDecoder { pending: Vec::new() };
        d.decode(&EncodedPacket {
            data: bytes::Bytes::from_static(b"x"),
            kind: PacketKind::Key,
            timestamp_us: 0,
            duration_us: 1000,
            sequence_number: 0,
            side_data: None,
        })
        .unwrap();
        let frames = d.poll_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].timestamp_us, 0);
    }
}
