//! Fragmented random access: `moof`/`traf`/`trun` parsing and the fragment
//! arena that replaces the source's cyclic `nextFragment` object graph with
//! integer handles.
//!
//! The `tfhd`/`trun` resolution here — base-data-offset precedence,
//! default-base-is-moof, the sync-sample flag bit — follows the same shape
//! as the reference fragmented-MP4 reader examined for this module, adapted
//! to build into the arena instead of a per-track `Vec`.

use std::collections::{BTreeMap, HashMap};

use crate::boxes::walk_boxes;
use crate::error::{MediaError, Result};
use crate::fourcc;

pub type FragmentId = usize;

const TFHD_BASE_DATA_OFFSET_PRESENT: u32 = 0x0000_01;
const TFHD_SAMPLE_DESCRIPTION_INDEX_PRESENT: u32 = 0x0000_02;
const TFHD_DEFAULT_SAMPLE_DURATION_PRESENT: u32 = 0x0000_08;
const TFHD_DEFAULT_SAMPLE_SIZE_PRESENT: u32 = 0x0000_10;
const TFHD_DEFAULT_SAMPLE_FLAGS_PRESENT: u32 = 0x0000_20;
const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x02_0000;

const TRUN_DATA_OFFSET_PRESENT: u32 = 0x0000_01;
const TRUN_FIRST_SAMPLE_FLAGS_PRESENT: u32 = 0x0000_04;
const TRUN_SAMPLE_DURATION_PRESENT: u32 = 0x0001_00;
const TRUN_SAMPLE_SIZE_PRESENT: u32 = 0x0002_00;
const TRUN_SAMPLE_FLAGS_PRESENT: u32 = 0x0004_00;
const TRUN_SAMPLE_CTS_PRESENT: u32 = 0x0008_00;

const SAMPLE_IS_NON_SYNC_FLAG: u32 = 0x0001_0000;

/// Per-track `trex` defaults parsed from `moov/mvex`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrexDefaults {
    pub default_sample_description_index: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct FragmentSample {
    pub presentation_timestamp: u64,
    pub decode_timestamp: u64,
    pub duration: u32,
    pub offset: u64,
    pub size: u32,
    pub key: bool,
}

#[derive(Debug, Default)]
pub struct FragmentTrackData {
    pub samples: Vec<FragmentSample>,
    pub start_timestamp: u64,
    pub end_timestamp: u64,
    /// False until a `tfdt` (or an inherited base from a prior fragment)
    /// has resolved this track's absolute timestamps.
    pub start_timestamp_is_final: bool,
}

#[derive(Debug, Default)]
pub struct Fragment {
    pub moof_offset: u64,
    pub moof_size: u64,
    pub data_start: u64,
    pub data_end: u64,
    pub tracks: HashMap<u32, FragmentTrackData>,
    pub next_fragment: Option<FragmentId>,
}

/// Arena of fragments keyed by `moofOffset`, with `nextFragment` as an
/// `Option<FragmentId>` instead of an object reference.
#[derive(Debug, Default)]
pub struct FragmentArena {
    fragments: Vec<Fragment>,
    by_offset: BTreeMap<u64, FragmentId>,
}

impl FragmentArena {
    pub fn get(&self, id: FragmentId) -> &Fragment {
        &self.fragments[id]
    }

    pub fn contains_offset(&self, moof_offset: u64) -> bool {
        self.by_offset.contains_key(&moof_offset)
    }

    pub fn id_at_offset(&self, moof_offset: u64) -> Option<FragmentId> {
        self.by_offset.get(&moof_offset).copied()
    }

    /// The fragment with the greatest `moofOffset <= offset`, used to find
    /// an anchor to resume byte-walking from.
    pub fn floor(&self, offset: u64) -> Option<FragmentId> {
        self.by_offset
            .range(..=offset)
            .next_back()
            .map(|(_, &id)| id)
    }

    pub fn insert(&mut self, fragment: Fragment) -> FragmentId {
        let offset = fragment.moof_offset;
        let id = self.fragments.len();
        self.fragments.push(fragment);
        if let Some((_, &prev_id)) = self.by_offset.range(..offset).next_back() {
            self.fragments[prev_id].next_fragment = Some(id);
        }
        if let Some((&next_offset, &next_id)) = self.by_offset.range(offset..).next() {
            if next_offset != offset {
                self.fragments[id].next_fragment = Some(next_id);
            }
        }
        self.by_offset.insert(offset, id);
        id
    }

    pub fn last(&self) -> Option<FragmentId> {
        self.by_offset.values().next_back().copied()
    }
}

/// Parse one `moof` (payload with header stripped) into a `Fragment`,
/// using `trex_defaults` for any field a `tfhd` omits. `mdat_start` is the
/// first byte of the `mdat` immediately following this `moof` — the only
/// layout this demuxer's writer (and most real encoders) produce.
pub fn parse_moof(
    moof_payload: &[u8],
    moof_offset: u64,
    moof_size: u64,
    mdat_start: u64,
    mdat_end: u64,
    trex_defaults: &HashMap<u32, TrexDefaults>,
) -> Result<Fragment> {
    let mut tracks = HashMap::new();

    let mut parse_err: Option<MediaError> = None;
    walk_boxes(moof_payload, &[fourcc::TRAF], &mut |tag, payload| {
        if parse_err.is_some() || tag != fourcc::TRAF {
            return;
        }
        match parse_traf(payload, moof_offset, trex_defaults) {
            Ok((track_id, data)) => {
                tracks.insert(track_id, data);
            }
            Err(e) => parse_err = Some(e),
        }
    });
    if let Some(e) = parse_err {
        return Err(e);
    }

    Ok(Fragment {
        moof_offset,
        moof_size,
        data_start: mdat_start,
        data_end: mdat_end,
        tracks,
        next_fragment: None,
    })
}

fn parse_traf(
    traf: &[u8],
    moof_offset: u64,
    trex_defaults: &HashMap<u32, TrexDefaults>,
) -> Result<(u32, FragmentTrackData)> {
    let tfhd = crate::boxes::find_child(traf, fourcc::TFHD)
        .ok_or_else(|| MediaError::malformed("traf missing tfhd"))?;
    let (track_id, mut base_data_offset, default_sample_description_index, mut default_duration, mut default_size, mut default_flags) =
        parse_tfhd(tfhd, moof_offset)?;

    if let Some(trex) = trex_defaults.get(&track_id) {
        if default_sample_description_index == 0 {
            // sample description index default unused directly here
        }
        if default_duration == 0 {
            default_duration = trex.default_sample_duration;
        }
        if default_size == 0 {
            default_size = trex.default_sample_size;
        }
        if default_flags == 0 {
            default_flags = trex.default_sample_flags;
        }
    }

    let mut base_decode_time = 0u64;
    let mut has_tfdt = false;
    if let Some(tfdt) = crate::boxes::find_child(traf, fourcc::TFDT) {
        has_tfdt = true;
        base_decode_time = parse_tfdt(tfdt)?;
    }

    let mut samples = Vec::new();
    let mut running_dts = base_decode_time;

    let mut trun_err: Option<MediaError> = None;
    walk_boxes(traf, &[], &mut |tag, payload| {
        if trun_err.is_some() || tag != fourcc::TRUN {
            return;
        }
        match parse_trun(
            payload,
            &mut base_data_offset,
            default_duration,
            default_size,
            default_flags,
            &mut running_dts,
        ) {
            Ok(mut trun_samples) => samples.append(&mut trun_samples),
            Err(e) => trun_err = Some(e),
        }
    });
    if let Some(e) = trun_err {
        return Err(e);
    }

    let start_timestamp = samples.first().map(|s| s.presentation_timestamp).unwrap_or(base_decode_time);
    let end_timestamp = running_dts;

    Ok((
        track_id,
        FragmentTrackData {
            samples,
            start_timestamp,
            end_timestamp,
            start_timestamp_is_final: has_tfdt,
        },
    ))
}

#[allow(clippy::type_complexity)]
fn parse_tfhd(data: &[u8], moof_offset: u64) -> Result<(u32, u64, u32, u32, u32, u32)> {
    if data.len() < 8 {
        return Err(MediaError::malformed("tfhd truncated"));
    }
    let flags = u32::from_be_bytes([0, data[1], data[2], data[3]]);
    let track_id = u32::from_be_bytes(data[4..8].try_into().unwrap());
    let mut pos = 8;

    // Legacy default (neither flag set) is also "first byte of the moof".
    let base_data_offset = if flags & TFHD_BASE_DATA_OFFSET_PRESENT != 0 {
        u64::from_be_bytes(read_n(data, &mut pos, 8)?.try_into().unwrap())
    } else {
        moof_offset
    };

    let mut default_sample_description_index = 0u32;
    if flags & TFHD_SAMPLE_DESCRIPTION_INDEX_PRESENT != 0 {
        default_sample_description_index =
            u32::from_be_bytes(read_n(data, &mut pos, 4)?.try_into().unwrap());
    }
    let mut default_duration = 0u32;
    if flags & TFHD_DEFAULT_SAMPLE_DURATION_PRESENT != 0 {
        default_duration = u32::from_be_bytes(read_n(data, &mut pos, 4)?.try_into().unwrap());
    }
    let mut default_size = 0u32;
    if flags & TFHD_DEFAULT_SAMPLE_SIZE_PRESENT != 0 {
        default_size = u32::from_be_bytes(read_n(data, &mut pos, 4)?.try_into().unwrap());
    }
    let mut default_flags = 0u32;
    if flags & TFHD_DEFAULT_SAMPLE_FLAGS_PRESENT != 0 {
        default_flags = u32::from_be_bytes(read_n(data, &mut pos, 4)?.try_into().unwrap());
    }

    Ok((
        track_id,
        base_data_offset,
        default_sample_description_index,
        default_duration,
        default_size,
        default_flags,
    ))
}

fn parse_tfdt(data: &[u8]) -> Result<u64> {
    if data.is_empty() {
        return Err(MediaError::malformed("tfdt truncated"));
    }
    let version = data[0];
    if version == 1 {
        if data.len() < 12 {
            return Err(MediaError::malformed("tfdt v1 truncated"));
        }
        Ok(u64::from_be_bytes(data[4..12].try_into().unwrap()))
    } else {
        if data.len() < 8 {
            return Err(MediaError::malformed("tfdt v0 truncated"));
        }
        Ok(u32::from_be_bytes(data[4..8].try_into().unwrap()) as u64)
    }
}

fn parse_trun(
    data: &[u8],
    base_data_offset: &mut u64,
    default_duration: u32,
    default_size: u32,
    default_flags: u32,
    running_dts: &mut u64,
) -> Result<Vec<FragmentSample>> {
    if data.len() < 8 {
        return Err(MediaError::malformed("trun truncated"));
    }
    let flags = u32::from_be_bytes([0, data[1], data[2], data[3]]);
    let sample_count = u32::from_be_bytes(data[4..8].try_into().unwrap());
    let mut pos = 8;

    let mut data_offset = *base_data_offset;
    if flags & TRUN_DATA_OFFSET_PRESENT != 0 {
        let rel = i32::from_be_bytes(read_n(data, &mut pos, 4)?.try_into().unwrap());
        data_offset = (*base_data_offset as i64 + rel as i64)
            .try_into()
            .map_err(|_| MediaError::malformed("trun data_offset underflows"))?;
    }

    let mut first_sample_flags = default_flags;
    let explicit_first_flags = flags & TRUN_FIRST_SAMPLE_FLAGS_PRESENT != 0;
    if explicit_first_flags {
        first_sample_flags = u32::from_be_bytes(read_n(data, &mut pos, 4)?.try_into().unwrap());
    }

    let mut samples = Vec::with_capacity(sample_count as usize);
    let mut cursor = data_offset;

    for i in 0..sample_count {
        let duration = if flags & TRUN_SAMPLE_DURATION_PRESENT != 0 {
            u32::from_be_bytes(read_n(data, &mut pos, 4)?.try_into().unwrap())
        } else {
            default_duration
        };
        let size = if flags & TRUN_SAMPLE_SIZE_PRESENT != 0 {
            u32::from_be_bytes(read_n(data, &mut pos, 4)?.try_into().unwrap())
        } else {
            default_size
        };
        let sample_flags = if flags & TRUN_SAMPLE_FLAGS_PRESENT != 0 {
            u32::from_be_bytes(read_n(data, &mut pos, 4)?.try_into().unwrap())
        } else if i == 0 && explicit_first_flags {
            first_sample_flags
        } else {
            default_flags
        };
        let cts = if flags & TRUN_SAMPLE_CTS_PRESENT != 0 {
            i32::from_be_bytes(read_n(data, &mut pos, 4)?.try_into().unwrap())
        } else {
            0
        };

        let dts = *running_dts;
        let pts = (dts as i64 + cts as i64).max(0) as u64;
        let key = sample_flags & SAMPLE_IS_NON_SYNC_FLAG == 0;

        samples.push(FragmentSample {
            presentation_timestamp: pts,
            decode_timestamp: dts,
            duration,
            offset: cursor,
            size,
            key,
        });

        cursor += size as u64;
        *running_dts += duration as u64;
    }

    *base_data_offset = cursor;
    Ok(samples)
}

fn read_n<'a>(data: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    if *pos + n > data.len() {
        return Err(MediaError::malformed("trun/tfhd field truncated"));
    }
    let s = &data[*pos..*pos + n];
    *pos += n;
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trun_bytes(first_flags: u32, samples: &[(u32, u32, i32)]) -> Vec<u8> {
        let flags = TRUN_SAMPLE_DURATION_PRESENT
            | TRUN_SAMPLE_SIZE_PRESENT
            | TRUN_SAMPLE_CTS_PRESENT
            | TRUN_FIRST_SAMPLE_FLAGS_PRESENT;
        let mut v = vec![0u8];
        v.extend(flags.to_be_bytes()[1..].iter());
        v.extend((samples.len() as u32).to_be_bytes());
        v.extend(first_flags.to_be_bytes());
        for &(dur, size, cts) in samples {
            v.extend(dur.to_be_bytes());
            v.extend(size.to_be_bytes());
            v.extend(cts.to_be_bytes());
        }
        v
    }

    fn tfhd_bytes(track_id: u32, default_duration: u32, default_size: u32) -> Vec<u8> {
        let flags = TFHD_DEFAULT_SAMPLE_DURATION_PRESENT
            | TFHD_DEFAULT_SAMPLE_SIZE_PRESENT
            | TFHD_DEFAULT_BASE_IS_MOOF;
        let mut v = vec![0u8];
        v.extend(flags.to_be_bytes()[1..].iter());
        v.extend(track_id.to_be_bytes());
        v.extend(default_duration.to_be_bytes());
        v.extend(default_size.to_be_bytes());
        v
    }

    fn tfdt_bytes(base: u32) -> Vec<u8> {
        let mut v = vec![0u8, 0, 0, 0];
        v.extend(base.to_be_bytes());
        v
    }

    fn leaf(tag: &[u8; 4], body: Vec<u8>) -> Vec<u8> {
        let mut v = ((8 + body.len()) as u32).to_be_bytes().to_vec();
        v.extend(tag.iter());
        v.extend(body);
        v
    }

    #[test]
    fn parses_traf_with_tfdt_and_trun() {
        let tfhd = leaf(b"tfhd", tfhd_bytes(1, 1000, 500));
        let tfdt = leaf(b"tfdt", tfdt_bytes(0));
        let trun = leaf(b"trun", trun_bytes(0, &[(1000, 500, 0), (1000, 600, 2000)]));
        let mut traf_body = tfhd;
        traf_body.extend(tfdt);
        traf_body.extend(trun);
        let traf = leaf(b"traf", traf_body);
        let moof = leaf(b"moof", traf);

        let defaults = HashMap::new();
        let frag = parse_moof(&moof[8..], 0, moof.len() as u64, moof.len() as u64, moof.len() as u64 + 1100, &defaults).unwrap();

        let track = frag.tracks.get(&1).unwrap();
        assert!(track.start_timestamp_is_final);
        assert_eq!(track.samples.len(), 2);
        assert_eq!(track.samples[0].decode_timestamp, 0);
        assert_eq!(track.samples[1].decode_timestamp, 1000);
        assert_eq!(track.samples[1].presentation_timestamp, 3000);
        assert!(track.samples[0].key);
    }

    #[test]
    fn arena_links_next_fragment_both_directions() {
        let mut arena = FragmentArena::default();
        let a = arena.insert(Fragment {
            moof_offset: 100,
            ..Default::default()
        });
        let c = arena.insert(Fragment {
            moof_offset: 300,
            ..Default::default()
        });
        let b = arena.insert(Fragment {
            moof_offset: 200,
            ..Default::default()
        });

        assert_eq!(arena.get(a).next_fragment, Some(b));
        assert_eq!(arena.get(b).next_fragment, Some(c));
        assert_eq!(arena.floor(250), Some(b));
    }
}
