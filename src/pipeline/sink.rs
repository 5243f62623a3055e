//! `EncodedPacketSink`: the random-access + sequential packet contract over
//! an `InputTrack`, plus the bounded async packet iterator that backs
//! `packets()`.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::demux::input::{Input, PacketLocation};
use crate::error::{MediaError, Result};
use crate::pipeline::packet::{EncodedPacket, PacketKind};

/// Random-access lookups on one track of an `Input`. Holds the `Input`
/// behind a `tokio::sync::Mutex` so that several sinks on the same input
/// can be driven from different tasks; the lock only ever contends during
/// fragment discovery, exactly the `fragmentLookupMutex` this models.
pub struct EncodedPacketSink {
    input: Arc<Mutex<Input>>,
    track_id: u32,
}

impl EncodedPacketSink {
    pub fn new(input: Arc<Mutex<Input>>, track_id: u32) -> Self {
        Self { input, track_id }
    }

    async fn fetch(&self, location: PacketLocation) -> Result<EncodedPacket> {
        let mut input = self.input.lock().await;
        let data = input.sample_bytes(&location).await?;
        Ok(EncodedPacket {
            data,
            kind: if location.key { PacketKind::Key } else { PacketKind::Delta },
            timestamp_us: scale_to_us(location.presentation_timestamp, &mut input, self.track_id)?,
            duration_us: scale_duration_to_us(location.duration, &mut input, self.track_id)?,
            sequence_number: location.sample_index as u64,
            side_data: None,
        })
    }

    pub async fn get_first(&self) -> Result<Option<EncodedPacket>> {
        let location = {
            let mut input = self.input.lock().await;
            input.get_first_chunk(self.track_id).await?
        };
        match location {
            Some(loc) => Ok(Some(self.fetch(loc).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_at_timestamp(&self, timestamp_us: i64) -> Result<Option<EncodedPacket>> {
        let ticks = {
            let mut input = self.input.lock().await;
            to_ticks(timestamp_us, &mut input, self.track_id)?
        };
        let location = {
            let mut input = self.input.lock().await;
            input.get_chunk(self.track_id, ticks).await?
        };
        match location {
            Some(loc) => Ok(Some(self.fetch(loc).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_key_at_timestamp(&self, timestamp_us: i64) -> Result<Option<EncodedPacket>> {
        let ticks = {
            let mut input = self.input.lock().await;
            to_ticks(timestamp_us, &mut input, self.track_id)?
        };
        let location = {
            let mut input = self.input.lock().await;
            input.get_key_chunk(self.track_id, ticks).await?
        };
        match location {
            Some(loc) => Ok(Some(self.fetch(loc).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_next(&self, after: &EncodedPacket) -> Result<Option<EncodedPacket>> {
        let location = self.location_of(after).await?;
        let next = {
            let mut input = self.input.lock().await;
            input.get_next_chunk(self.track_id, &location).await?
        };
        match next {
            Some(loc) => Ok(Some(self.fetch(loc).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_next_key(&self, after: &EncodedPacket) -> Result<Option<EncodedPacket>> {
        let location = self.location_of(after).await?;
        let next = {
            let mut input = self.input.lock().await;
            input.get_next_key_chunk(self.track_id, &location).await?
        };
        match next {
            Some(loc) => Ok(Some(self.fetch(loc).await?)),
            None => Ok(None),
        }
    }

    async fn location_of(&self, packet: &EncodedPacket) -> Result<PacketLocation> {
        let mut input = self.input.lock().await;
        let ticks = to_ticks(packet.timestamp_us, &mut input, self.track_id)?;
        input
            .get_chunk(self.track_id, ticks)
            .await?
            .ok_or_else(|| MediaError::internal("packet has no matching location in its own track"))
    }

    /// A lazy sequence of packets in file order, from `start` (or the track
    /// start) up to `end_timestamp_us` (or the end of the track).
    ///
    /// The returned iterator prefetches ahead with a bounded queue capped at
    /// `max(2, packets produced in the last second)`: enough to hide I/O
    /// latency without unbounded memory growth on a slow consumer.
    pub fn packets(self: Arc<Self>, start: Option<EncodedPacket>, end_timestamp_us: Option<i64>) -> PacketIterator {
        PacketIterator::new(self, start, end_timestamp_us)
    }
}

fn to_ticks(us: i64, input: &mut Input, track_id: u32) -> Result<u64> {
    let timescale = input
        .tracks()
        .into_iter()
        .find(|t| t.id == track_id)
        .map(|t| t.timescale)
        .ok_or_else(|| MediaError::malformed(format!("no track with id {track_id}")))?;
    Ok(((us as i128 * timescale as i128) / 1_000_000).max(0) as u64)
}

fn scale_to_us(ticks: u64, input: &mut Input, track_id: u32) -> Result<i64> {
    let timescale = input
        .tracks()
        .into_iter()
        .find(|t| t.id == track_id)
        .map(|t| t.timescale)
        .ok_or_else(|| MediaError::malformed(format!("no track with id {track_id}")))?;
    if timescale == 0 {
        return Ok(0);
    }
    Ok(((ticks as i128 * 1_000_000) / timescale as i128) as i64)
}

fn scale_duration_to_us(ticks: u64, input: &mut Input, track_id: u32) -> Result<i64> {
    scale_to_us(ticks, input, track_id)
}

/// Backpressure-bounded packet producer. Tracks its own recent production
/// rate to grow the queue cap above the floor of 2 when the consumer is
/// keeping up, matching the "max(2, packets produced in the last second)"
/// cap from the concurrency model.
pub struct PacketIterator {
    sink: Arc<EncodedPacketSink>,
    current: Option<EncodedPacket>,
    started: bool,
    end_timestamp_us: Option<i64>,
    queue: VecDeque<EncodedPacket>,
    produced_this_second: u32,
    terminated: bool,
}

impl PacketIterator {
    fn new(sink: Arc<EncodedPacketSink>, start: Option<EncodedPacket>, end_timestamp_us: Option<i64>) -> Self {
        Self {
            sink,
            current: start,
            started: false,
            end_timestamp_us,
            queue: VecDeque::new(),
            produced_this_second: 0,
            terminated: false,
        }
    }

    fn queue_cap(&self) -> usize {
        queue_cap_for(self.produced_this_second)
    }

    /// Stops the iterator: no further packets are produced even if
    /// `next()` is called again.
    pub fn cancel(&mut self) {
        self.terminated = true;
        self.queue.clear();
    }

    pub async fn next(&mut self) -> Result<Option<EncodedPacket>> {
        if self.terminated {
            return Ok(None);
        }
        if let Some(packet) = self.queue.pop_front() {
            return Ok(Some(packet));
        }
        self.refill().await?;
        Ok(self.queue.pop_front())
    }

    async fn refill(&mut self) -> Result<()> {
        while self.queue.len() < self.queue_cap() {
            let next = if !self.started {
                self.started = true;
                match &self.current {
                    Some(p) => Some(p.clone()),
                    None => self.sink.get_first().await?,
                }
            } else {
                let Some(cursor) = self.current.clone() else {
                    break;
                };
                self.sink.get_next(&cursor).await?
            };

            let Some(packet) = next else {
                self.terminated = true;
                break;
            };
            if let Some(end) = self.end_timestamp_us {
                if packet.timestamp_us >= end {
                    self.terminated = true;
                    break;
                }
            }
            self.current = Some(packet.clone());
            self.produced_this_second += 1;
            self.queue.push_back(packet);
        }
        Ok(())
    }
}

/// `max(2, packets-produced-in-the-last-second)`.
fn queue_cap_for(produced_this_second: u32) -> usize {
    (produced_this_second as usize).max(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_cap_floors_at_two_and_grows_with_rate() {
        assert_eq!(queue_cap_for(0), 2);
        assert_eq!(queue_cap_for(1), 2);
        assert_eq!(queue_cap_for(10), 10);
    }
}
