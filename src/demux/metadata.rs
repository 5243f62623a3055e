//! Initial metadata pass: locate
//! `moov`, parse `mvhd`/`trak`/`tkhd`/`mdia`/`stsd`, detect `mvex` for
//! fragmented files, and read a trailing `mfra` if present.

use std::collections::HashMap;

use bytes::Bytes;

use crate::boxes::{find_child, read_box_header, walk_boxes, Rotation};
use crate::demux::fragment::TrexDefaults;
use crate::demux::track_info::{CodecConfig, TrackInfo};
use crate::error::{MediaError, Result};
use crate::fourcc;
use crate::io::Reader;

#[derive(Debug, Clone)]
pub struct InputTrackMeta {
    pub id: u32,
    pub timescale: u32,
    pub duration: u64,
    pub info: TrackInfo,
    pub codec_config: CodecConfig,
    /// Absolute `[start, end)` of this track's `stbl` box content, if the
    /// file is non-fragmented.
    pub stbl_range: Option<(u64, u64)>,
    pub trex: Option<TrexDefaults>,
}

#[derive(Debug, Default)]
pub struct MovieMetadata {
    pub timescale: u32,
    pub duration: u64,
    pub fragmented: bool,
    pub tracks: Vec<InputTrackMeta>,
    pub moof_offsets: Vec<u64>,
    /// `track_id -> [(presentationTimestamp, moofOffset), ...]` sorted,
    /// from `mfra`/`tfra`, if present.
    pub fragment_lookup: HashMap<u32, Vec<(u64, u64)>>,
}

pub async fn read_metadata(reader: &mut Reader) -> Result<MovieMetadata> {
    let file_size = reader.size().await?;
    let (moov_start, moov_end, moof_offsets) = find_top_level(reader, file_size).await?;

    reader.pin(moov_start, moov_end);
    let moov_bytes = {
        reader.load_range(moov_start, moov_end).await?;
        reader.read_range(moov_start, moov_end)?
    };
    reader.unpin(moov_start, moov_end);

    let mut metadata = parse_moov(&moov_bytes, moov_start)?;
    metadata.moof_offsets = moof_offsets;
    metadata.fragmented = !metadata.tracks.iter().all(|t| t.trex.is_none());

    if metadata.fragmented {
        if let Some((mfra_start, mfra_end)) = find_trailing_mfra(reader, file_size).await? {
            reader.load_range(mfra_start, mfra_end).await?;
            let mfra_bytes = reader.read_range(mfra_start, mfra_end)?;
            metadata.fragment_lookup = parse_mfra(&mfra_bytes);
        }
    }

    Ok(metadata)
}

async fn find_top_level(reader: &mut Reader, file_size: u64) -> Result<(u64, u64, Vec<u64>)> {
    reader.pos = 0;
    let mut moov_range = None;
    let mut moof_offsets = Vec::new();
    while reader.pos < file_size {
        let header = read_box_header(reader, file_size).await?;
        if header.box_type == fourcc::MOOV {
            moov_range = Some((header.content_start(), header.end()));
        }
        if header.box_type == fourcc::MOOF {
            moof_offsets.push(header.start);
        }
        reader.pos = header.end();
    }
    let (start, end) = moov_range.ok_or_else(|| MediaError::malformed("no moov box found"))?;
    Ok((start, end, moof_offsets))
}

async fn find_trailing_mfra(reader: &mut Reader, file_size: u64) -> Result<Option<(u64, u64)>> {
    if file_size < 32 {
        return Ok(None);
    }
    reader.load_range(file_size - 16, file_size).await?;
    let tail = reader.read_range(file_size - 16, file_size)?;
    if &tail[4..8] != fourcc::MFRO.as_bytes() {
        return Ok(None);
    }
    let mfro_size = u32::from_be_bytes(tail[12..16].try_into().unwrap()) as u64;
    if mfro_size == 0 || mfro_size > file_size {
        return Ok(None);
    }
    let mfra_start = file_size - mfro_size;
    reader.load_range(mfra_start, mfra_start + 8).await?;
    let header = read_box_header(reader, file_size).await?;
    if header.box_type != fourcc::MFRA {
        return Ok(None);
    }
    Ok(Some((header.start, header.end())))
}

fn parse_moov(moov: &[u8], moov_start: u64) -> Result<MovieMetadata> {
    let mvhd = find_child(moov, fourcc::MVHD).ok_or_else(|| MediaError::malformed("moov missing mvhd"))?;
    let (timescale, duration) = parse_mvhd(mvhd)?;

    let mut trex_defaults: HashMap<u32, TrexDefaults> = HashMap::new();
    if let Some(mvex) = find_child(moov, fourcc::MVEX) {
        walk_boxes(mvex, &[], &mut |tag, payload| {
            if tag == fourcc::TREX {
                if let Ok((id, trex)) = parse_trex(payload) {
                    trex_defaults.insert(id, trex);
                }
            }
        });
    }

    let mut tracks = Vec::new();
    let mut fatal_err: Option<MediaError> = None;
    walk_boxes(moov, &[], &mut |tag, payload| {
        if fatal_err.is_some() || tag != fourcc::TRAK {
            return;
        }
        match parse_trak(payload, moov_start, &trex_defaults) {
            Ok(t) => tracks.push(t),
            Err(e) if e.is_track_local() => {
                tracing::warn!(error = %e, "demoting track: failed to parse trak");
            }
            Err(e) => fatal_err = Some(e),
        }
    });
    if let Some(e) = fatal_err {
        return Err(e);
    }

    Ok(MovieMetadata {
        timescale,
        duration,
        fragmented: false,
        tracks,
        moof_offsets: Vec::new(),
        fragment_lookup: HashMap::new(),
    })
}

fn parse_mvhd(data: &[u8]) -> Result<(u32, u64)> {
    if data.is_empty() {
        return Err(MediaError::malformed("mvhd empty"));
    }
    let version = data[0];
    if version == 1 {
        if data.len() < 28 {
            return Err(MediaError::malformed("mvhd v1 truncated"));
        }
        let timescale = u32::from_be_bytes(data[20..24].try_into().unwrap());
        let duration = u64::from_be_bytes(data[24..32.min(data.len())].try_into().unwrap_or([0; 8]));
        Ok((timescale, duration))
    } else {
        if data.len() < 20 {
            return Err(MediaError::malformed("mvhd v0 truncated"));
        }
        let timescale = u32::from_be_bytes(data[12..16].try_into().unwrap());
        let duration = u32::from_be_bytes(data[16..20].try_into().unwrap()) as u64;
        Ok((timescale, duration))
    }
}

fn parse_trex(data: &[u8]) -> Result<(u32, TrexDefaults)> {
    if data.len() < 24 {
        return Err(MediaError::malformed("trex truncated"));
    }
    let track_id = u32::from_be_bytes(data[4..8].try_into().unwrap());
    Ok((
        track_id,
        TrexDefaults {
            default_sample_description_index: u32::from_be_bytes(data[8..12].try_into().unwrap()),
            default_sample_duration: u32::from_be_bytes(data[12..16].try_into().unwrap()),
            default_sample_size: u32::from_be_bytes(data[16..20].try_into().unwrap()),
            default_sample_flags: u32::from_be_bytes(data[20..24].try_into().unwrap()),
        },
    ))
}

fn parse_trak(
    trak: &[u8],
    moov_start: u64,
    trex_defaults: &HashMap<u32, TrexDefaults>,
) -> Result<InputTrackMeta> {
    let tkhd = find_child(trak, fourcc::TKHD).ok_or_else(|| MediaError::malformed("trak missing tkhd"))?;
    let (id, rotation) = parse_tkhd(tkhd)?;

    let mdia = find_child(trak, fourcc::MDIA).ok_or_else(|| MediaError::malformed("trak missing mdia"))?;
    let mdhd = find_child(mdia, fourcc::MDHD).ok_or_else(|| MediaError::malformed("mdia missing mdhd"))?;
    let (timescale, duration) = parse_mdhd(mdhd)?;

    let hdlr = find_child(mdia, fourcc::HDLR).ok_or_else(|| MediaError::malformed("mdia missing hdlr"))?;
    let handler_type = parse_hdlr(hdlr)?;

    let minf = find_child(mdia, fourcc::MINF).ok_or_else(|| MediaError::malformed("mdia missing minf"))?;
    let stbl = find_child(minf, fourcc::STBL).ok_or_else(|| MediaError::malformed("minf missing stbl"))?;
    let stsd = find_child(stbl, fourcc::STSD).ok_or_else(|| MediaError::malformed("stbl missing stsd"))?;

    let (info, codec_config) = parse_stsd(stsd, &handler_type)?;
    let info = match info {
        TrackInfo::Video { width, height, .. } => TrackInfo::Video { width, height, rotation },
        other => other,
    };

    // Absolute offset of the stbl payload: moov_start + the byte offset of
    // `stbl` within the moov buffer we were handed.
    let stbl_offset_in_moov = offset_within(trak, stbl);
    let stbl_range = stbl_offset_in_moov.map(|off| (moov_start + off as u64, moov_start + off as u64 + stbl.len() as u64));

    Ok(InputTrackMeta {
        id,
        timescale,
        duration,
        info,
        codec_config,
        stbl_range,
        trex: trex_defaults.get(&id).copied(),
    })
}

/// Recovers `child`'s byte offset within `parent` from their slice
/// addresses — both originate from the same `moov_bytes` allocation, so
/// plain address subtraction (no dereference, so no `unsafe` needed) is
/// enough.
fn offset_within(parent: &[u8], child: &[u8]) -> Option<usize> {
    let parent_start = parent.as_ptr() as usize;
    let parent_end = parent_start + parent.len();
    let child_start = child.as_ptr() as usize;
    if child_start < parent_start || child_start > parent_end {
        return None;
    }
    Some(child_start - parent_start)
}

/// Reads the track id and, when the full matrix is present, the display
/// rotation out of a `tkhd` payload. The matrix sits after the
/// layer/alternate_group/volume/reserved fields, which are 2 bytes wider
/// in a version-1 box than in version 0.
fn parse_tkhd(data: &[u8]) -> Result<(u32, Rotation)> {
    if data.is_empty() {
        return Err(MediaError::malformed("tkhd empty"));
    }
    let version = data[0];
    let (id_offset, matrix_offset) = if version == 1 { (20, 52) } else { (12, 40) };
    if data.len() < id_offset + 4 {
        return Err(MediaError::malformed("tkhd truncated"));
    }
    let id = u32::from_be_bytes(data[id_offset..id_offset + 4].try_into().unwrap());
    let rotation = if data.len() >= matrix_offset + 36 {
        Rotation::from_matrix(read_matrix(&data[matrix_offset..matrix_offset + 36]))
    } else {
        Rotation::None
    };
    Ok((id, rotation))
}

/// Decodes a `{a,b,u,c,d,v,x,y,w}` transformation matrix: `a,b,c,d,x,y` are
/// 16.16 fixed point, `u,v,w` are 2.30.
fn read_matrix(data: &[u8]) -> [f64; 9] {
    const FIXED_16_16_INDICES: [usize; 6] = [0, 1, 3, 4, 6, 7];
    let mut matrix = [0.0f64; 9];
    for i in 0..9 {
        let raw = i32::from_be_bytes(data[i * 4..i * 4 + 4].try_into().unwrap());
        matrix[i] = if FIXED_16_16_INDICES.contains(&i) { raw as f64 / 65536.0 } else { raw as f64 / 1_073_741_824.0 };
    }
    matrix
}

fn parse_mdhd(data: &[u8]) -> Result<(u32, u64)> {
    if data.is_empty() {
        return Err(MediaError::malformed("mdhd empty"));
    }
    let version = data[0];
    if version == 1 {
        if data.len() < 32 {
            return Err(MediaError::malformed("mdhd v1 truncated"));
        }
        let timescale = u32::from_be_bytes(data[20..24].try_into().unwrap());
        let duration = u64::from_be_bytes(data[24..32].try_into().unwrap());
        Ok((timescale, duration))
    } else {
        if data.len() < 24 {
            return Err(MediaError::malformed("mdhd v0 truncated"));
        }
        let timescale = u32::from_be_bytes(data[12..16].try_into().unwrap());
        let duration = u32::from_be_bytes(data[16..20].try_into().unwrap()) as u64;
        Ok((timescale, duration))
    }
}

fn parse_hdlr(data: &[u8]) -> Result<[u8; 4]> {
    if data.len() < 12 {
        return Err(MediaError::malformed("hdlr truncated"));
    }
    Ok(data[8..12].try_into().unwrap())
}

fn parse_stsd(data: &[u8], handler_type: &[u8; 4]) -> Result<(TrackInfo, CodecConfig)> {
    if data.len() < 8 {
        return Err(MediaError::malformed("stsd truncated"));
    }
    let entry_count = u32::from_be_bytes(data[4..8].try_into().unwrap());
    if entry_count == 0 || data.len() < 16 {
        return Err(MediaError::malformed("stsd has no sample entry"));
    }
    let entry_size = u32::from_be_bytes(data[8..12].try_into().unwrap()) as usize;
    let codec_tag: [u8; 4] = data[12..16].try_into().unwrap();
    let entry = &data[8..(8 + entry_size).min(data.len())];
    let codec = String::from_utf8_lossy(&codec_tag).into_owned();

    let description = find_codec_config(entry).map(Bytes::copy_from_slice);

    match handler_type {
        b"vide" => {
            let (width, height) = parse_visual_sample_entry_dims(entry).unwrap_or((0, 0));
            Ok((
                TrackInfo::Video {
                    width,
                    height,
                    rotation: crate::boxes::Rotation::None,
                },
                CodecConfig { codec, description },
            ))
        }
        b"soun" => {
            let (channels, sample_rate) = parse_audio_sample_entry(entry).unwrap_or((2, 48000));
            Ok((
                TrackInfo::Audio { channels, sample_rate },
                CodecConfig { codec, description },
            ))
        }
        _ => Ok((TrackInfo::Subtitle, CodecConfig { codec, description })),
    }
}

fn parse_visual_sample_entry_dims(entry: &[u8]) -> Option<(u32, u32)> {
    // VisualSampleEntry: 8 reserved+ref, 16 predefined/reserved, then
    // width(2)/height(2) at byte 32/34 within the entry payload (after the
    // 8-byte box header).
    let body = &entry[8..];
    if body.len() < 36 {
        return None;
    }
    let width = u16::from_be_bytes(body[24..26].try_into().unwrap()) as u32;
    let height = u16::from_be_bytes(body[26..28].try_into().unwrap()) as u32;
    Some((width, height))
}

fn parse_audio_sample_entry(entry: &[u8]) -> Option<(u16, u32)> {
    let body = &entry[8..];
    if body.len() < 20 {
        return None;
    }
    let channels = u16::from_be_bytes(body[8..10].try_into().unwrap());
    let sample_rate = u32::from_be_bytes(body[16..20].try_into().unwrap()) >> 16;
    Some((channels, sample_rate))
}

fn find_codec_config(entry: &[u8]) -> Option<&[u8]> {
    const CONFIG_BOXES: [fourcc::FourCc; 7] = [
        fourcc::AVCC,
        fourcc::HVCC,
        fourcc::VPCC,
        fourcc::AV1C,
        fourcc::ESDS,
        fourcc::DOPS,
        fourcc::DFLA,
    ];
    if entry.len() < 8 {
        return None;
    }
    let mut found = None;
    walk_boxes(&entry[8..], &[], &mut |tag, payload| {
        if found.is_none() && CONFIG_BOXES.contains(&tag) {
            found = Some(payload);
        }
    });
    found
}

fn parse_mfra(mfra: &[u8]) -> HashMap<u32, Vec<(u64, u64)>> {
    let mut out = HashMap::new();
    walk_boxes(mfra, &[], &mut |tag, payload| {
        if tag != fourcc::TFRA {
            return;
        }
        if let Some((track_id, entries)) = parse_tfra(payload) {
            out.insert(track_id, entries);
        }
    });
    out
}

fn parse_tfra(data: &[u8]) -> Option<(u32, Vec<(u64, u64)>)> {
    if data.len() < 16 {
        return None;
    }
    let version = data[0];
    let track_id = u32::from_be_bytes(data[4..8].try_into().unwrap());
    let sizes = u32::from_be_bytes(data[8..12].try_into().unwrap());
    let length_size_of_traf_num = ((sizes >> 4) & 3) as usize + 1;
    let length_size_of_trun_num = ((sizes >> 2) & 3) as usize + 1;
    let length_size_of_sample_num = (sizes & 3) as usize + 1;
    let entry_count = u32::from_be_bytes(data[12..16].try_into().unwrap());

    let (time_size, offset_size) = if version == 1 { (8, 8) } else { (4, 4) };
    let entry_size = time_size + offset_size + length_size_of_traf_num + length_size_of_trun_num + length_size_of_sample_num;

    let mut pos = 16;
    let mut entries = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        if pos + entry_size > data.len() {
            break;
        }
        let time = read_uint(&data[pos..pos + time_size]);
        let offset = read_uint(&data[pos + time_size..pos + time_size + offset_size]);
        entries.push((time, offset));
        pos += entry_size;
    }
    Some((track_id, entries))
}

fn read_uint(b: &[u8]) -> u64 {
    let mut v = 0u64;
    for &byte in b {
        v = (v << 8) | byte as u64;
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::source::MemorySource;
    use std::sync::Arc;

    fn leaf(tag: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut v = ((8 + body.len()) as u32).to_be_bytes().to_vec();
        v.extend(tag.iter());
        v.extend(body);
        v
    }

    fn mvhd_v0(timescale: u32, duration: u32) -> Vec<u8> {
        let mut v = vec![0u8; 12];
        v.extend(timescale.to_be_bytes());
        v.extend(duration.to_be_bytes());
        v.extend([0u8; 80]);
        v
    }

    fn tkhd_v0(id: u32) -> Vec<u8> {
        let mut v = vec![0u8; 12]; // version/flags + creation_time + modification_time
        v.extend(id.to_be_bytes());
        v.extend([0u8; 66]);
        v
    }

    fn mdhd_v0(timescale: u32, duration: u32) -> Vec<u8> {
        let mut v = vec![0u8; 12];
        v.extend(timescale.to_be_bytes());
        v.extend(duration.to_be_bytes());
        v.extend([0u8; 4]);
        v
    }

    fn hdlr(handler: &[u8; 4]) -> Vec<u8> {
        let mut v = vec![0u8; 8];
        v.extend(handler.iter());
        v.extend([0u8; 12]);
        v
    }

    fn visual_sample_entry(codec: &[u8; 4], width: u16, height: u16) -> Vec<u8> {
        let mut body = vec![0u8; 8 + 16];
        body.extend(width.to_be_bytes());
        body.extend(height.to_be_bytes());
        body.extend([0u8; 50]);
        leaf(codec, &body)
    }

    fn stsd(entry: Vec<u8>) -> Vec<u8> {
        let mut v = vec![0u8; 4];
        v.extend(1u32.to_be_bytes());
        v.extend(entry);
        v
    }

    fn build_minimal_moov() -> Vec<u8> {
        let stsd_box = leaf(&fourcc::STSD.0, &stsd(visual_sample_entry(b"avc1", 640, 480)));
        let stbl_box = leaf(&fourcc::STBL.0, &stsd_box);
        let minf_box = leaf(&fourcc::MINF.0, &stbl_box);
        let hdlr_box = leaf(&fourcc::HDLR.0, &hdlr(b"vide"));
        let mdhd_box = leaf(&fourcc::MDHD.0, &mdhd_v0(90000, 450000));
        let mut mdia_body = mdhd_box;
        mdia_body.extend(hdlr_box);
        mdia_body.extend(minf_box);
        let mdia_box = leaf(&fourcc::MDIA.0, &mdia_body);
        let tkhd_box = leaf(&fourcc::TKHD.0, &tkhd_v0(1));
        let mut trak_body = tkhd_box;
        trak_body.extend(mdia_box);
        let trak_box = leaf(&fourcc::TRAK.0, &trak_body);
        let mvhd_box = leaf(&fourcc::MVHD.0, &mvhd_v0(1000, 5000));
        let mut moov_body = mvhd_box;
        moov_body.extend(trak_box);
        leaf(&fourcc::MOOV.0, &moov_body)
    }

    #[tokio::test]
    async fn reads_single_video_track_metadata() {
        let mut file = vec![0u8; 0];
        file.extend(leaf(b"ftyp", b"isom"));
        let moov_offset_marker = file.len();
        file.extend(build_minimal_moov());
        let _ = moov_offset_marker;

        let mut reader = Reader::new(Arc::new(MemorySource::new(file)), 1 << 20);
        let meta = read_metadata(&mut reader).await.unwrap();

        assert_eq!(meta.timescale, 1000);
        assert_eq!(meta.tracks.len(), 1);
        let track = &meta.tracks[0];
        assert_eq!(track.id, 1);
        assert_eq!(track.timescale, 90000);
        match track.info {
            TrackInfo::Video { width, height, .. } => {
                assert_eq!(width, 640);
                assert_eq!(height, 480);
            }
            _ => panic!("expected video track"),
        }
        assert!(track.stbl_range.is_some());
        assert!(!meta.fragmented);
    }

    #[test]
    fn tkhd_matrix_recovers_90_degree_rotation() {
        const FIXED_16_16_INDICES: [usize; 6] = [0, 1, 3, 4, 6, 7];
        let mut v = vec![0u8; 12];
        v.extend(7u32.to_be_bytes()); // track_ID
        v.extend([0u8; 28]); // reserved + duration + reserved[2] + layer/alt_group/volume/reserved
        for (i, component) in Rotation::Deg90.matrix().iter().enumerate() {
            let raw = if FIXED_16_16_INDICES.contains(&i) {
                (component * 65536.0).round() as i32
            } else {
                (component * 1_073_741_824.0).round() as i32
            };
            v.extend(raw.to_be_bytes());
        }
        v.extend([0u8; 8]); // width/height

        let (id, rotation) = parse_tkhd(&v).unwrap();
        assert_eq!(id, 7);
        assert_eq!(rotation, Rotation::Deg90);
    }
}
