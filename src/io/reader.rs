//! Buffered, range-aware view over a `Source`.
//!
//! Mirrors a `SegmentCache`: entries keyed by a range instead of
//! a string, evicted least-recently-used once a configured byte budget is
//! exceeded. The demuxer calls `load_range` before touching any bytes in
//! that range; positioned reads then assert the cursor is inside a loaded
//! range rather than going back to the `Source`.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{MediaError, Result};
use crate::io::source::Source;

/// Default eviction budgets.
pub const DEFAULT_CHUNK_READER_BUDGET: u64 = 64 * 1024 * 1024;
pub const DEFAULT_METADATA_READER_BUDGET: u64 = 16 * 1024 * 1024;

#[derive(Debug)]
struct LoadedRange {
    end: u64,
    data: Bytes,
    last_used: u64,
}

/// A single logical demuxer job's view over a `Source`. Not thread-safe —
/// the `Reader` is owned exclusively by one demuxer job.
pub struct Reader {
    source: Arc<dyn Source>,
    ranges: BTreeMap<u64, LoadedRange>,
    budget_bytes: u64,
    loaded_bytes: u64,
    tick: u64,
    /// Ranges currently "pinned" (e.g. a fragment mid-traversal) and exempt
    /// from eviction even if least-recently-used.
    pinned: Vec<(u64, u64)>,
    pub pos: u64,
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("ranges", &self.ranges)
            .field("budget_bytes", &self.budget_bytes)
            .field("loaded_bytes", &self.loaded_bytes)
            .field("tick", &self.tick)
            .field("pinned", &self.pinned)
            .field("pos", &self.pos)
            .finish()
    }
}

impl Reader {
    pub fn new(source: Arc<dyn Source>, budget_bytes: u64) -> Self {
        Self {
            source,
            ranges: BTreeMap::new(),
            budget_bytes,
            loaded_bytes: 0,
            tick: 0,
            pinned: Vec::new(),
            pos: 0,
        }
    }

    pub async fn size(&self) -> Result<u64> {
        self.source.size().await
    }

    pub fn pin(&mut self, start: u64, end: u64) {
        self.pinned.push((start, end));
    }

    pub fn unpin(&mut self, start: u64, end: u64) {
        self.pinned.retain(|&(s, e)| !(s == start && e == end));
    }

    fn is_pinned(&self, range_end: u64) -> bool {
        self.pinned.iter().any(|&(_, e)| e == range_end)
    }

    /// Guarantee bytes in `[start, end)` are loaded before any positioned
    /// reader touches them. Overlapping/adjacent loaded ranges are coalesced
    /// into a single entry.
    pub async fn load_range(&mut self, start: u64, end: u64) -> Result<()> {
        if start >= end {
            return Ok(());
        }
        if self.covers(start, end) {
            self.touch(start, end);
            return Ok(());
        }

        // Find the maximal span of overlapping/adjacent ranges to merge.
        let mut merge_start = start;
        let mut merge_end = end;
        let overlapping: Vec<u64> = self
            .ranges
            .iter()
            .filter(|(&s, r)| s <= merge_end && r.end >= merge_start)
            .map(|(&s, _)| s)
            .collect();
        for s in &overlapping {
            let r = self.ranges.get(s).unwrap();
            merge_start = merge_start.min(*s);
            merge_end = merge_end.max(r.end);
        }

        let bytes = self.source.read(merge_start, merge_end).await?;
        for s in overlapping {
            if let Some(r) = self.ranges.remove(&s) {
                self.loaded_bytes -= r.end - s;
            }
        }

        self.tick += 1;
        let size = merge_end - merge_start;
        self.ranges.insert(
            merge_start,
            LoadedRange {
                end: merge_end,
                data: bytes,
                last_used: self.tick,
            },
        );
        self.loaded_bytes += size;

        self.evict_if_needed();
        Ok(())
    }

    fn touch(&mut self, start: u64, end: u64) {
        self.tick += 1;
        let tick = self.tick;
        if let Some((_, r)) = self
            .ranges
            .range_mut(..=start)
            .rev()
            .find(|(&s, r)| s <= start && r.end >= end)
        {
            r.last_used = tick;
        }
    }

    fn covers(&self, start: u64, end: u64) -> bool {
        self.ranges
            .range(..=start)
            .next_back()
            .map(|(&s, r)| s <= start && r.end >= end)
            .unwrap_or(false)
    }

    /// Explicit drop, used by the demuxer after a fragment is consumed.
    pub fn forget_range(&mut self, start: u64, end: u64) {
        let keys: Vec<u64> = self
            .ranges
            .range(..)
            .filter(|(&s, r)| s < end && r.end > start)
            .map(|(&s, _)| s)
            .collect();
        for s in keys {
            if let Some(r) = self.ranges.remove(&s) {
                self.loaded_bytes -= r.end - s;
                // Re-insert the surviving edges outside [start, end).
                if s < start {
                    let left = r.data.slice(0..(start - s) as usize);
                    self.tick += 1;
                    self.loaded_bytes += left.len() as u64;
                    self.ranges.insert(
                        s,
                        LoadedRange {
                            end: start,
                            data: left,
                            last_used: self.tick,
                        },
                    );
                }
                if r.end > end {
                    let offset = (end - s) as usize;
                    let right = r.data.slice(offset..);
                    self.tick += 1;
                    self.loaded_bytes += right.len() as u64;
                    self.ranges.insert(
                        end,
                        LoadedRange {
                            end: r.end,
                            data: right,
                            last_used: self.tick,
                        },
                    );
                }
            }
        }
    }

    fn evict_if_needed(&mut self) {
        while self.loaded_bytes > self.budget_bytes {
            let victim = self
                .ranges
                .iter()
                .filter(|(_, r)| !self.is_pinned(r.end))
                .min_by_key(|(_, r)| r.last_used)
                .map(|(&s, _)| s);
            match victim {
                Some(s) => {
                    if let Some(r) = self.ranges.remove(&s) {
                        self.loaded_bytes -= r.end - s;
                    }
                }
                None => break, // everything left is pinned
            }
        }
    }

    fn slice(&self, start: u64, end: u64) -> Result<&[u8]> {
        let (&range_start, range) = self
            .ranges
            .range(..=start)
            .next_back()
            .filter(|(&s, r)| s <= start && r.end >= end)
            .ok_or_else(|| {
                MediaError::internal(format!(
                    "NotLoaded: [{start}, {end}) not in any loaded range (bug in caller)"
                ))
            })?;
        let lo = (start - range_start) as usize;
        let hi = (end - range_start) as usize;
        Ok(&range.data[lo..hi])
    }

    fn take(&mut self, len: u64) -> Result<&[u8]> {
        let start = self.pos;
        let end = start + len;
        self.slice(start, end)?;
        self.pos = end;
        self.slice(start, end)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u24(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        let b = self.take(4)?;
        Ok(f32::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        let b = self.take(8)?;
        Ok(f64::from_be_bytes(b.try_into().unwrap()))
    }

    pub fn read_ascii(&mut self, len: usize) -> Result<String> {
        let b = self.take(len as u64)?;
        Ok(String::from_utf8_lossy(b).into_owned())
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self.take(len as u64)?))
    }

    /// Read `[start, end)` as an owned `Bytes`, moving the cursor to `end`.
    /// The range must already be loaded via `load_range`.
    pub fn read_range(&mut self, start: u64, end: u64) -> Result<Bytes> {
        self.pos = start;
        self.read_bytes((end - start) as usize)
    }

    pub fn loaded_bytes(&self) -> u64 {
        self.loaded_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::source::MemorySource;

    fn reader_over(data: &[u8], budget: u64) -> Reader {
        Reader::new(Arc::new(MemorySource::new(data.to_vec())), budget)
    }

    #[tokio::test]
    async fn positioned_reads_advance_cursor() {
        let mut r = reader_over(&[0, 0, 0, 1, b'f', b't', b'y', b'p'], 1024);
        r.load_range(0, 8).await.unwrap();
        r.pos = 0;
        assert_eq!(r.read_u32().unwrap(), 1);
        assert_eq!(r.read_ascii(4).unwrap(), "ftyp");
    }

    #[tokio::test]
    async fn read_without_load_fails() {
        let mut r = reader_over(&[1, 2, 3, 4], 1024);
        r.pos = 0;
        assert!(r.read_u32().is_err());
    }

    #[tokio::test]
    async fn overlapping_loads_coalesce() {
        let mut r = reader_over(&(0u8..=20).collect::<Vec<_>>(), 1024);
        r.load_range(0, 10).await.unwrap();
        r.load_range(5, 15).await.unwrap();
        assert_eq!(r.ranges.len(), 1);
        assert_eq!(r.loaded_bytes(), 15);
    }

    #[tokio::test]
    async fn lru_eviction_respects_budget() {
        let data = vec![0u8; 100];
        let mut r = reader_over(&data, 30);
        r.load_range(0, 20).await.unwrap();
        r.load_range(20, 40).await.unwrap();
        // Loading a third range pushes total past budget; the
        // least-recently-used (first) range should be evicted.
        r.load_range(40, 60).await.unwrap();
        assert!(r.loaded_bytes() <= 40); // at most the 2 most recent ranges
        assert!(!r.covers(0, 20));
    }

    #[tokio::test]
    async fn pinned_range_survives_eviction() {
        let data = vec![0u8; 100];
        let mut r = reader_over(&data, 20);
        r.load_range(0, 20).await.unwrap();
        r.pin(0, 20);
        r.load_range(20, 40).await.unwrap();
        assert!(r.covers(0, 20));
    }

    #[tokio::test]
    async fn forget_range_splits_surviving_edges() {
        let data: Vec<u8> = (0u8..=99).collect();
        let mut r = reader_over(&data, 1024);
        r.load_range(0, 50).await.unwrap();
        r.forget_range(10, 20);
        assert!(r.covers(0, 10));
        assert!(r.covers(20, 50));
        assert!(!r.covers(5, 25));
    }
}
