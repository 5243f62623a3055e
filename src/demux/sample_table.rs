//! Non-fragmented per-track sample index ("Non-fragmented random
//! access"), built lazily the first time a track is randomly accessed.
//! Generalizes a stream-summary pass from "one
//! pass producing a few scalars" to "one pass producing a queryable table",
//! since random access needs the full run-length structure, not just
//! duration/fps.

use crate::error::{MediaError, Result};

/// One sample's fully resolved position and timing, the return of
/// `get_sample_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    pub decode_timestamp: u64,
    pub presentation_timestamp: u64,
    pub duration: u64,
    pub size: u32,
    pub offset: u64,
    pub key: bool,
}

/// `stsc` resolved to an absolute first-sample index per run, so chunk
/// lookup doesn't re-walk the run table for every query.
#[derive(Debug, Clone, Copy)]
struct StscRun {
    first_chunk: u32,
    samples_per_chunk: u32,
    start_sample_index: u32,
}

#[derive(Debug, Default)]
pub struct SampleTable {
    sample_count: u32,
    /// `(count, delta)` time-to-sample runs; decode timestamps are the
    /// cumulative sum.
    timing_runs: Vec<(u32, u32)>,
    /// `(count, offset)` composition-offset runs. Empty means no `ctts`,
    /// i.e. presentation == decode timestamp for every sample.
    composition_runs: Vec<(u32, i32)>,
    /// Either one entry (constant size, PCM-collapsed chunks included) or
    /// one entry per sample.
    sample_sizes: Vec<u32>,
    /// `None` means every sample is a key sample (no `stss`).
    key_sample_indices: Option<Vec<u32>>,
    stsc_runs: Vec<StscRun>,
    chunk_offsets: Vec<u64>,
    /// Built only when `composition_runs` is non-empty: `(pts, sample
    /// index)` sorted by pts, for pts-indexed lookup.
    presentation_sorted: Option<Vec<(u64, u32)>>,
}

impl SampleTable {
    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    /// Parse the full set of sample-table boxes out of an already-loaded
    /// `stbl` payload. `pcm_collapse` folds each chunk into a single
    /// sample, for constant-bitrate PCM tracks.
    pub fn parse(stbl: &[u8], pcm_collapse: bool) -> Result<Self> {
        let mut stsz = None;
        let mut stts = None;
        let mut ctts = None;
        let mut stss = None;
        let mut stsc = None;
        let mut stco: Option<(bool, Vec<u8>)> = None;

        crate::boxes::walk_boxes(stbl, &[], &mut |tag, payload| match tag.as_bytes() {
            b"stsz" => stsz = Some(payload.to_vec()),
            b"stts" => stts = Some(payload.to_vec()),
            b"ctts" => ctts = Some(payload.to_vec()),
            b"stss" => stss = Some(payload.to_vec()),
            b"stsc" => stsc = Some(payload.to_vec()),
            b"stco" => stco = Some((false, payload.to_vec())),
            b"co64" => stco = Some((true, payload.to_vec())),
            _ => {}
        });

        let stsz = stsz.ok_or_else(|| MediaError::malformed("stbl missing stsz"))?;
        let stts = stts.ok_or_else(|| MediaError::malformed("stbl missing stts"))?;
        let stsc = stsc.ok_or_else(|| MediaError::malformed("stbl missing stsc"))?;
        let (stco_is_64bit, stco) = stco.ok_or_else(|| MediaError::malformed("stbl missing stco/co64"))?;

        let (sample_count, sample_sizes) = parse_stsz(&stsz)?;
        let timing_runs = parse_run_table_u32(&stts)?;
        let composition_runs = match &ctts {
            Some(c) => parse_run_table_i32(c)?,
            None => Vec::new(),
        };
        let key_sample_indices = match &stss {
            Some(s) => Some(parse_u32_list(s)?),
            None => None,
        };
        let stsc_entries = parse_stsc(&stsc)?;
        let chunk_offsets = parse_chunk_offsets(&stco, stco_is_64bit)?;

        let stsc_runs = resolve_stsc_runs(&stsc_entries, chunk_offsets.len() as u32);

        let mut table = SampleTable {
            sample_count,
            timing_runs,
            composition_runs,
            sample_sizes,
            key_sample_indices,
            stsc_runs,
            chunk_offsets,
            presentation_sorted: None,
        };

        if pcm_collapse && table.composition_runs.is_empty() {
            table.collapse_chunks_to_samples()?;
        }

        if !table.composition_runs.is_empty() {
            table.build_presentation_sorted()?;
        }

        Ok(table)
    }

    fn collapse_chunks_to_samples(&mut self) -> Result<()> {
        let chunk_count = self.chunk_offsets.len() as u32;
        let mut new_sizes = Vec::with_capacity(chunk_count as usize);
        let mut new_timing = Vec::new();
        for chunk_index in 0..chunk_count {
            let (start, count) = self.samples_in_chunk(chunk_index)?;
            let mut size_sum = 0u64;
            let mut duration_sum = 0u64;
            for i in start..start + count {
                size_sum += self.sample_size(i)? as u64;
                duration_sum += self.sample_duration(i)?;
            }
            new_sizes.push(size_sum as u32);
            push_run(&mut new_timing, duration_sum as u32);
        }
        self.sample_sizes = new_sizes;
        self.timing_runs = new_timing;
        self.sample_count = chunk_count;
        self.stsc_runs = (0..chunk_count)
            .map(|i| StscRun {
                first_chunk: i + 1,
                samples_per_chunk: 1,
                start_sample_index: i,
            })
            .collect();
        self.key_sample_indices = None;
        Ok(())
    }

    fn build_presentation_sorted(&mut self) -> Result<()> {
        let mut list = Vec::with_capacity(self.sample_count as usize);
        for i in 0..self.sample_count {
            let dts = self.sample_decode_timestamp(i)?;
            let offset = self.composition_offset(i)?;
            let pts = (dts as i64 + offset as i64).max(0) as u64;
            list.push((pts, i));
        }
        list.sort_unstable_by_key(|&(pts, _)| pts);
        self.presentation_sorted = Some(list);
        Ok(())
    }

    fn sample_decode_timestamp(&self, index: u32) -> Result<u64> {
        let mut remaining = index;
        let mut ts = 0u64;
        for &(count, delta) in &self.timing_runs {
            if remaining < count {
                return Ok(ts + remaining as u64 * delta as u64);
            }
            remaining -= count;
            ts += count as u64 * delta as u64;
        }
        Err(MediaError::malformed("stts runs shorter than sample count"))
    }

    fn sample_duration(&self, index: u32) -> Result<u64> {
        let mut remaining = index;
        for &(count, delta) in &self.timing_runs {
            if remaining < count {
                return Ok(delta as u64);
            }
            remaining -= count;
        }
        Err(MediaError::malformed("stts runs shorter than sample count"))
    }

    fn composition_offset(&self, index: u32) -> Result<i32> {
        if self.composition_runs.is_empty() {
            return Ok(0);
        }
        let mut remaining = index;
        for &(count, offset) in &self.composition_runs {
            if remaining < count {
                return Ok(offset);
            }
            remaining -= count;
        }
        Err(MediaError::malformed("ctts runs shorter than sample count"))
    }

    fn sample_size(&self, index: u32) -> Result<u32> {
        if self.sample_sizes.len() == 1 {
            Ok(self.sample_sizes[0])
        } else {
            self.sample_sizes
                .get(index as usize)
                .copied()
                .ok_or_else(|| MediaError::malformed("stsz shorter than sample count"))
        }
    }

    fn samples_in_chunk(&self, chunk_index: u32) -> Result<(u32, u32)> {
        let run = self
            .stsc_runs
            .iter()
            .rev()
            .find(|r| r.first_chunk - 1 <= chunk_index)
            .ok_or_else(|| MediaError::malformed("stsc has no run for chunk"))?;
        let chunks_into_run = chunk_index - (run.first_chunk - 1);
        let start = run.start_sample_index + chunks_into_run * run.samples_per_chunk;
        Ok((start, run.samples_per_chunk))
    }

    fn chunk_and_offset_for_sample(&self, index: u32) -> Result<(u32, u64)> {
        for (chunk_index, run) in self.stsc_runs.iter().enumerate() {
            let base = run.start_sample_index;
            let span = run.samples_per_chunk
                * self.chunks_in_run(chunk_index as u32)
                    .max(1);
            if index >= base && index < base + span {
                let rel = index - base;
                let chunk = run.first_chunk - 1 + rel / run.samples_per_chunk;
                let in_chunk = rel % run.samples_per_chunk;
                let chunk_offset = *self
                    .chunk_offsets
                    .get(chunk as usize)
                    .ok_or_else(|| MediaError::malformed("sample-to-chunk points past stco"))?;
                let mut byte_offset = chunk_offset;
                let first_in_chunk = base + (chunk - (run.first_chunk - 1)) * run.samples_per_chunk;
                for s in first_in_chunk..first_in_chunk + in_chunk {
                    byte_offset += self.sample_size(s)? as u64;
                }
                return Ok((chunk, byte_offset));
            }
        }
        Err(MediaError::malformed("no stsc run covers sample index"))
    }

    fn chunks_in_run(&self, run_index: u32) -> u32 {
        let run = self.stsc_runs[run_index as usize];
        let next_first_chunk = self
            .stsc_runs
            .get(run_index as usize + 1)
            .map(|r| r.first_chunk)
            .unwrap_or(self.chunk_offsets.len() as u32 + 1);
        next_first_chunk - run.first_chunk
    }

    fn is_key(&self, index: u32) -> bool {
        match &self.key_sample_indices {
            None => true,
            Some(list) => list.binary_search(&index).is_ok(),
        }
    }

    /// Resolves one sample's offset, size, timestamps, and key flag.
    pub fn sample_info(&self, index: u32) -> Result<SampleInfo> {
        if index >= self.sample_count {
            return Err(MediaError::malformed("sample index out of range"));
        }
        let decode_timestamp = self.sample_decode_timestamp(index)?;
        let duration = self.sample_duration(index)?;
        let offset = self.composition_offset(index)?;
        let presentation_timestamp = (decode_timestamp as i64 + offset as i64).max(0) as u64;
        let size = self.sample_size(index)?;
        let (_, byte_offset) = self.chunk_and_offset_for_sample(index)?;
        Ok(SampleInfo {
            decode_timestamp,
            presentation_timestamp,
            duration,
            size,
            offset: byte_offset,
            key: self.is_key(index),
        })
    }

    /// Binary search by presentation timestamp: the `presentationTimestamps`
    /// list when composition offsets are present, else the cumulative
    /// decode-timestamp runs.
    pub fn find_by_timestamp(&self, timestamp: u64) -> Option<u32> {
        if self.sample_count == 0 {
            return None;
        }
        if let Some(sorted) = &self.presentation_sorted {
            let pos = match sorted.binary_search_by_key(&timestamp, |&(pts, _)| pts) {
                Ok(i) => i,
                Err(0) => return None,
                Err(i) => i - 1,
            };
            return Some(sorted[pos].1);
        }
        // No composition offsets: decode order == presentation order.
        let mut ts = 0u64;
        let mut index = 0u32;
        for &(count, delta) in &self.timing_runs {
            let run_span = count as u64 * delta as u64;
            if ts + run_span > timestamp {
                let into_run = if delta == 0 { 0 } else { (timestamp - ts) / delta as u64 };
                return Some(index + (into_run as u32).min(count - 1));
            }
            ts += run_span;
            index += count;
        }
        Some(self.sample_count - 1)
    }

    pub fn find_next_key(&self, after_index: u32) -> Option<u32> {
        match &self.key_sample_indices {
            None => (after_index + 1 < self.sample_count).then_some(after_index + 1),
            Some(list) => list
                .iter()
                .find(|&&i| i > after_index)
                .copied(),
        }
    }

    pub fn find_key_at_or_before(&self, index: u32) -> Option<u32> {
        match &self.key_sample_indices {
            None => Some(index),
            Some(list) => list.iter().rev().find(|&&i| i <= index).copied(),
        }
    }
}

fn push_run(runs: &mut Vec<(u32, u32)>, delta: u32) {
    match runs.last_mut() {
        Some((count, last_delta)) if *last_delta == delta => *count += 1,
        _ => runs.push((1, delta)),
    }
}

fn parse_stsz(data: &[u8]) -> Result<(u32, Vec<u32>)> {
    if data.len() < 12 {
        return Err(MediaError::malformed("stsz truncated"));
    }
    let constant_size = u32::from_be_bytes(data[4..8].try_into().unwrap());
    let count = u32::from_be_bytes(data[8..12].try_into().unwrap());
    if constant_size != 0 {
        return Ok((count, vec![constant_size]));
    }
    let mut sizes = Vec::with_capacity(count as usize);
    let mut pos = 12;
    for _ in 0..count {
        if pos + 4 > data.len() {
            return Err(MediaError::malformed("stsz entries truncated"));
        }
        sizes.push(u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()));
        pos += 4;
    }
    Ok((count, sizes))
}

fn parse_run_table_u32(data: &[u8]) -> Result<Vec<(u32, u32)>> {
    if data.len() < 8 {
        return Err(MediaError::malformed("run table truncated"));
    }
    let count = u32::from_be_bytes(data[4..8].try_into().unwrap());
    let mut runs = Vec::with_capacity(count as usize);
    let mut pos = 8;
    for _ in 0..count {
        if pos + 8 > data.len() {
            return Err(MediaError::malformed("run table entries truncated"));
        }
        let c = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap());
        let v = u32::from_be_bytes(data[pos + 4..pos + 8].try_into().unwrap());
        runs.push((c, v));
        pos += 8;
    }
    Ok(runs)
}

fn parse_run_table_i32(data: &[u8]) -> Result<Vec<(u32, i32)>> {
    Ok(parse_run_table_u32(data)?
        .into_iter()
        .map(|(c, v)| (c, v as i32))
        .collect())
}

fn parse_u32_list(data: &[u8]) -> Result<Vec<u32>> {
    if data.len() < 8 {
        return Err(MediaError::malformed("index list truncated"));
    }
    let count = u32::from_be_bytes(data[4..8].try_into().unwrap());
    let mut out = Vec::with_capacity(count as usize);
    let mut pos = 8;
    for _ in 0..count {
        if pos + 4 > data.len() {
            return Err(MediaError::malformed("index list entries truncated"));
        }
        // stss indices are 1-based on disk; store 0-based.
        out.push(u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) - 1);
        pos += 4;
    }
    Ok(out)
}

fn parse_stsc(data: &[u8]) -> Result<Vec<(u32, u32, u32)>> {
    if data.len() < 8 {
        return Err(MediaError::malformed("stsc truncated"));
    }
    let count = u32::from_be_bytes(data[4..8].try_into().unwrap());
    let mut out = Vec::with_capacity(count as usize);
    let mut pos = 8;
    for _ in 0..count {
        if pos + 12 > data.len() {
            return Err(MediaError::malformed("stsc entries truncated"));
        }
        let first_chunk = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap());
        let samples_per_chunk = u32::from_be_bytes(data[pos + 4..pos + 8].try_into().unwrap());
        let sample_desc_index = u32::from_be_bytes(data[pos + 8..pos + 12].try_into().unwrap());
        out.push((first_chunk, samples_per_chunk, sample_desc_index));
        pos += 12;
    }
    Ok(out)
}

fn parse_chunk_offsets(data: &[u8], is_64bit: bool) -> Result<Vec<u64>> {
    if data.len() < 8 {
        return Err(MediaError::malformed("stco/co64 truncated"));
    }
    let count = u32::from_be_bytes(data[4..8].try_into().unwrap());
    let width = if is_64bit { 8 } else { 4 };
    let mut out = Vec::with_capacity(count as usize);
    let mut pos = 8;
    for _ in 0..count {
        if pos + width > data.len() {
            return Err(MediaError::malformed("stco/co64 entries truncated"));
        }
        if !is_64bit {
            out.push(u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as u64);
        } else {
            out.push(u64::from_be_bytes(data[pos..pos + 8].try_into().unwrap()));
        }
        pos += width;
    }
    Ok(out)
}

fn resolve_stsc_runs(entries: &[(u32, u32, u32)], chunk_count: u32) -> Vec<StscRun> {
    let mut runs = Vec::with_capacity(entries.len());
    let mut start_sample_index = 0u32;
    for (i, &(first_chunk, samples_per_chunk, _)) in entries.iter().enumerate() {
        let next_first = entries.get(i + 1).map(|e| e.0).unwrap_or(chunk_count + 1);
        let chunks_in_run = next_first - first_chunk;
        runs.push(StscRun {
            first_chunk,
            samples_per_chunk,
            start_sample_index,
        });
        start_sample_index += chunks_in_run * samples_per_chunk;
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stsz_constant(size: u32, count: u32) -> Vec<u8> {
        let mut v = vec![0u8; 4];
        v.extend(size.to_be_bytes());
        v.extend(count.to_be_bytes());
        v
    }

    fn run_table(entries: &[(u32, u32)]) -> Vec<u8> {
        let mut v = vec![0u8; 4];
        v.extend((entries.len() as u32).to_be_bytes());
        for &(c, d) in entries {
            v.extend(c.to_be_bytes());
            v.extend(d.to_be_bytes());
        }
        v
    }

    fn stsc(entries: &[(u32, u32, u32)]) -> Vec<u8> {
        let mut v = vec![0u8; 4];
        v.extend((entries.len() as u32).to_be_bytes());
        for &(a, b, c) in entries {
            v.extend(a.to_be_bytes());
            v.extend(b.to_be_bytes());
            v.extend(c.to_be_bytes());
        }
        v
    }

    fn stco(offsets: &[u32]) -> Vec<u8> {
        let mut v = vec![0u8; 4];
        v.extend((offsets.len() as u32).to_be_bytes());
        for &o in offsets {
            v.extend(o.to_be_bytes());
        }
        v
    }

    fn co64(offsets: &[u64]) -> Vec<u8> {
        let mut v = vec![0u8; 4];
        v.extend((offsets.len() as u32).to_be_bytes());
        for &o in offsets {
            v.extend(o.to_be_bytes());
        }
        v
    }

    fn stbl_box(children: &[(&[u8; 4], Vec<u8>)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (tag, body) in children {
            out.extend(((8 + body.len()) as u32).to_be_bytes());
            out.extend(tag.iter());
            out.extend(body);
        }
        out
    }

    #[test]
    fn simple_constant_size_table() {
        let stbl = stbl_box(&[
            (b"stts", run_table(&[(4, 1000)])),
            (b"stsz", stsz_constant(500, 4)),
            (b"stsc", stsc(&[(1, 2, 1)])),
            (b"stco", stco(&[1000, 2000])),
        ]);
        let table = SampleTable::parse(&stbl, false).unwrap();
        assert_eq!(table.sample_count(), 4);

        let s0 = table.sample_info(0).unwrap();
        assert_eq!(s0.decode_timestamp, 0);
        assert_eq!(s0.offset, 1000);
        assert!(s0.key);

        let s1 = table.sample_info(1).unwrap();
        assert_eq!(s1.decode_timestamp, 1000);
        assert_eq!(s1.offset, 1500);

        let s2 = table.sample_info(2).unwrap();
        assert_eq!(s2.offset, 2000);
    }

    #[test]
    fn key_sample_lookup_defaults_to_all_keys_without_stss() {
        let stbl = stbl_box(&[
            (b"stts", run_table(&[(2, 1000)])),
            (b"stsz", stsz_constant(10, 2)),
            (b"stsc", stsc(&[(1, 2, 1)])),
            (b"stco", stco(&[0])),
        ]);
        let table = SampleTable::parse(&stbl, false).unwrap();
        assert!(table.sample_info(0).unwrap().key);
        assert!(table.sample_info(1).unwrap().key);
    }

    #[test]
    fn composition_offsets_reorder_presentation_search() {
        let stbl = stbl_box(&[
            (b"stts", run_table(&[(3, 1000)])),
            (b"ctts", run_table(&[(1, 2000), (2, 0)])),
            (b"stsz", stsz_constant(10, 3)),
            (b"stsc", stsc(&[(1, 3, 1)])),
            (b"stco", stco(&[0])),
        ]);
        let table = SampleTable::parse(&stbl, false).unwrap();
        // dts: 0,1000,2000 ; pts: 2000,1000,2000
        let found = table.find_by_timestamp(1000).unwrap();
        assert_eq!(found, 1);
    }

    #[test]
    fn co64_chunk_offsets_are_not_confused_with_stco_width() {
        let stbl = stbl_box(&[
            (b"stts", run_table(&[(2, 1000)])),
            (b"stsz", stsz_constant(10, 2)),
            (b"stsc", stsc(&[(1, 2, 1)])),
            (b"co64", co64(&[5_000_000_000, 5_000_000_010])),
        ]);
        let table = SampleTable::parse(&stbl, false).unwrap();
        assert_eq!(table.sample_info(0).unwrap().offset, 5_000_000_000);
        assert_eq!(table.sample_info(1).unwrap().offset, 5_000_000_010);
    }

    #[test]
    fn pcm_collapse_merges_chunk_into_one_sample() {
        let stbl = stbl_box(&[
            (b"stts", run_table(&[(6, 100)])),
            (b"stsz", stsz_constant(2, 6)),
            (b"stsc", stsc(&[(1, 3, 1)])),
            (b"stco", stco(&[0, 600])),
        ]);
        let table = SampleTable::parse(&stbl, true).unwrap();
        assert_eq!(table.sample_count(), 2);
        let s0 = table.sample_info(0).unwrap();
        assert_eq!(s0.size, 6);
        assert_eq!(s0.duration, 300);
    }
}
