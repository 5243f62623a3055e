//! Packet-retrieval contract: `getChunk`/`getKeyChunk`/`getNextChunk`/
//! `getNextKeyChunk`/`getFirstChunk`, for both the
//! non-fragmented (`SampleTable`) and fragmented (`FragmentArena`) paths.
//!
//! The fragmented path leans on one simplification over the prose spec:
//! the initial top-level box walk (`demux::metadata::find_top_level`)
//! already records every `moof`'s byte offset while hunting for `moov`, so
//! fragment *discovery* is not lazy — only fragment *parsing* is. This
//! keeps the `mfra` lookup table purely as an optional timestamp-rebasing
//! shortcut rather than a structural requirement (see DESIGN.md).

use std::collections::HashMap;

use crate::boxes::read_box_header;
use crate::demux::fragment::{parse_moof, Fragment, FragmentId, TrexDefaults};
use crate::demux::input::{Input, PacketLocation};
use crate::error::{MediaError, Result};
use crate::fourcc;

impl Input {
    fn trex_defaults(&self) -> HashMap<u32, TrexDefaults> {
        self.metadata
            .tracks
            .iter()
            .filter_map(|t| t.trex.map(|trex| (t.id, trex)))
            .collect()
    }

    async fn parse_fragment_at(&mut self, moof_offset: u64) -> Result<Fragment> {
        let file_size = self.reader.size().await?;
        self.reader.pos = moof_offset;
        let moof_header = read_box_header(&mut self.reader, file_size).await?;
        self.reader
            .load_range(moof_header.content_start(), moof_header.end())
            .await?;
        let moof_payload = self
            .reader
            .read_range(moof_header.content_start(), moof_header.end())?;

        self.reader.pos = moof_header.end();
        let mdat_header = read_box_header(&mut self.reader, file_size).await?;
        if mdat_header.box_type != fourcc::MDAT {
            return Err(MediaError::malformed("moof not immediately followed by mdat"));
        }

        let defaults = self.trex_defaults();
        let mut fragment = parse_moof(
            &moof_payload,
            moof_header.start,
            moof_header.size,
            mdat_header.content_start(),
            mdat_header.end(),
            &defaults,
        )?;

        // Resolve any track whose tfdt was absent by inheriting the
        // previous fragment's end timestamp.
        if let Some(prev_id) = self.fragments.floor(moof_offset.saturating_sub(1)) {
            let prev_ends: HashMap<u32, u64> = self
                .fragments
                .get(prev_id)
                .tracks
                .iter()
                .map(|(&id, t)| (id, t.end_timestamp))
                .collect();
            for (track_id, track) in fragment.tracks.iter_mut() {
                if !track.start_timestamp_is_final {
                    if let Some(&base) = prev_ends.get(track_id) {
                        rebase_track(track, base);
                    }
                }
            }
        }

        Ok(fragment)
    }

    async fn ensure_fragment_at_index(&mut self, index: usize) -> Result<FragmentId> {
        let moof_offset = *self
            .metadata
            .moof_offsets
            .get(index)
            .ok_or_else(|| MediaError::internal("fragment index out of range"))?;
        if let Some(id) = self.fragments.id_at_offset(moof_offset) {
            return Ok(id);
        }
        let fragment = self.parse_fragment_at(moof_offset).await?;
        Ok(self.fragments.insert(fragment))
    }

    /// Parse fragments in moof order until the most recently parsed one
    /// covers `target_ts` for `track_id`, or the file is exhausted.
    async fn ensure_fragments_through(&mut self, track_id: u32, target_ts: u64) -> Result<()> {
        loop {
            if let Some(last_id) = self.fragments.last() {
                if let Some(track) = self.fragments.get(last_id).tracks.get(&track_id) {
                    if track.start_timestamp_is_final && track.end_timestamp > target_ts {
                        return Ok(());
                    }
                }
            }
            if self.fragment_scan_pos as usize >= self.metadata.moof_offsets.len() {
                return Ok(());
            }
            let idx = self.fragment_scan_pos as usize;
            self.ensure_fragment_at_index(idx).await?;
            self.fragment_scan_pos += 1;
        }
    }

    async fn ensure_all_fragments(&mut self) -> Result<()> {
        while (self.fragment_scan_pos as usize) < self.metadata.moof_offsets.len() {
            let idx = self.fragment_scan_pos as usize;
            self.ensure_fragment_at_index(idx).await?;
            self.fragment_scan_pos += 1;
        }
        Ok(())
    }

    /// Every sample across all discovered fragments matching `predicate`,
    /// in no particular order — callers reduce with `min_by_key`/
    /// `max_by_key` on `presentation_timestamp` depending on which edge of
    /// the match set they want.
    fn matching_fragment_samples(
        &self,
        track_id: u32,
        predicate: impl Fn(u64, bool) -> bool,
    ) -> Vec<PacketLocation> {
        let mut out = Vec::new();
        for fragment in self.fragments_in_order() {
            if let Some(track) = fragment.tracks.get(&track_id) {
                for (i, sample) in track.samples.iter().enumerate() {
                    if predicate(sample.presentation_timestamp, sample.key) {
                        out.push(PacketLocation {
                            sample_index: i as u32,
                            presentation_timestamp: sample.presentation_timestamp,
                            decode_timestamp: sample.decode_timestamp,
                            duration: sample.duration as u64,
                            offset: sample.offset,
                            size: sample.size,
                            key: sample.key,
                        });
                    }
                }
            }
        }
        out
    }

    fn fragments_in_order(&self) -> Vec<&Fragment> {
        let mut out = Vec::new();
        let mut cursor = self
            .metadata
            .moof_offsets
            .first()
            .and_then(|&offset| self.fragments.id_at_offset(offset));
        while let Some(id) = cursor {
            let f = self.fragments.get(id);
            out.push(f);
            cursor = f.next_fragment;
        }
        out
    }

    pub async fn get_first_chunk(&mut self, track_id: u32) -> Result<Option<PacketLocation>> {
        if !self.is_fragmented() {
            let table = self.sample_table(track_id).await?;
            if table.sample_count() == 0 {
                return Ok(None);
            }
            return Ok(Some(self.get_sample_info(track_id, 0).await?));
        }
        self.ensure_fragments_through(track_id, 0).await?;
        Ok(self
            .matching_fragment_samples(track_id, |_, _| true)
            .into_iter()
            .min_by_key(|p| p.presentation_timestamp))
    }

    pub async fn get_chunk(&mut self, track_id: u32, timestamp: u64) -> Result<Option<PacketLocation>> {
        if !self.is_fragmented() {
            let table = self.sample_table(track_id).await?;
            let Some(index) = table.find_by_timestamp(timestamp) else {
                return Ok(None);
            };
            return Ok(Some(self.get_sample_info(track_id, index).await?));
        }
        self.ensure_fragments_through(track_id, timestamp).await?;
        Ok(self
            .matching_fragment_samples(track_id, |pts, _| pts <= timestamp)
            .into_iter()
            .max_by_key(|p| p.presentation_timestamp))
    }

    pub async fn get_key_chunk(&mut self, track_id: u32, timestamp: u64) -> Result<Option<PacketLocation>> {
        if !self.is_fragmented() {
            let table = self.sample_table(track_id).await?;
            let Some(index) = table.find_by_timestamp(timestamp) else {
                return Ok(None);
            };
            let Some(key_index) = table.find_key_at_or_before(index) else {
                return Ok(None);
            };
            return Ok(Some(self.get_sample_info(track_id, key_index).await?));
        }
        self.ensure_fragments_through(track_id, timestamp).await?;
        Ok(self
            .matching_fragment_samples(track_id, |pts, key| key && pts <= timestamp)
            .into_iter()
            .max_by_key(|p| p.presentation_timestamp))
    }

    pub async fn get_next_chunk(&mut self, track_id: u32, after: &PacketLocation) -> Result<Option<PacketLocation>> {
        if !self.is_fragmented() {
            let table = self.sample_table(track_id).await?;
            let next_index = after.sample_index + 1;
            if next_index >= table.sample_count() {
                return Ok(None);
            }
            return Ok(Some(self.get_sample_info(track_id, next_index).await?));
        }
        self.ensure_all_fragments().await?;
        let target = after.presentation_timestamp;
        Ok(self
            .matching_fragment_samples(track_id, |pts, _| pts > target)
            .into_iter()
            .min_by_key(|p| p.presentation_timestamp))
    }

    pub async fn get_next_key_chunk(&mut self, track_id: u32, after: &PacketLocation) -> Result<Option<PacketLocation>> {
        if !self.is_fragmented() {
            let table = self.sample_table(track_id).await?;
            let Some(key_index) = table.find_next_key(after.sample_index) else {
                return Ok(None);
            };
            return Ok(Some(self.get_sample_info(track_id, key_index).await?));
        }
        self.ensure_all_fragments().await?;
        let target = after.presentation_timestamp;
        Ok(self
            .matching_fragment_samples(track_id, |pts, key| key && pts > target)
            .into_iter()
            .min_by_key(|p| p.presentation_timestamp))
    }
}

fn rebase_track(track: &mut crate::demux::fragment::FragmentTrackData, base: u64) {
    track.start_timestamp += base;
    track.end_timestamp += base;
    track.start_timestamp_is_final = true;
    for sample in track.samples.iter_mut() {
        sample.decode_timestamp += base;
        sample.presentation_timestamp += base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::source::MemorySource;
    use std::sync::Arc;

    fn leaf(tag: &[u8; 4], body: Vec<u8>) -> Vec<u8> {
        let mut v = ((8 + body.len()) as u32).to_be_bytes().to_vec();
        v.extend(tag.iter());
        v.extend(body);
        v
    }

    fn mvhd() -> Vec<u8> {
        let mut v = vec![0u8; 12];
        v.extend(1000u32.to_be_bytes());
        v.extend(0u32.to_be_bytes());
        v.extend([0u8; 80]);
        v
    }

    fn tkhd(id: u32) -> Vec<u8> {
        let mut v = vec![0u8; 8];
        v.extend(id.to_be_bytes());
        v.extend([0u8; 70]);
        v
    }

    fn mdhd() -> Vec<u8> {
        let mut v = vec![0u8; 12];
        v.extend(1000u32.to_be_bytes());
        v.extend(0u32.to_be_bytes());
        v.extend([0u8; 4]);
        v
    }

    fn hdlr(h: &[u8; 4]) -> Vec<u8> {
        let mut v = vec![0u8; 8];
        v.extend(h.iter());
        v.extend([0u8; 12]);
        v
    }

    fn audio_sample_entry() -> Vec<u8> {
        let mut body = vec![0u8; 16];
        body.extend(2u16.to_be_bytes());
        body.extend([0u8; 6]);
        body.extend((48000u32 << 16).to_be_bytes());
        leaf(b"mp4a", body)
    }

    fn stsd(entry: Vec<u8>) -> Vec<u8> {
        let mut v = vec![0u8; 4];
        v.extend(1u32.to_be_bytes());
        v.extend(entry);
        v
    }

    fn trex(id: u32) -> Vec<u8> {
        let mut v = vec![0u8; 4];
        v.extend(id.to_be_bytes());
        v.extend(1u32.to_be_bytes());
        v.extend(1000u32.to_be_bytes());
        v.extend(100u32.to_be_bytes());
        v.extend(0u32.to_be_bytes());
        v
    }

    fn build_fragmented_moov() -> Vec<u8> {
        let stsd_box = leaf(b"stsd", stsd(audio_sample_entry()));
        let stbl_box = leaf(b"stbl", stsd_box);
        let minf_box = leaf(b"minf", stbl_box);
        let hdlr_box = leaf(b"hdlr", hdlr(b"soun"));
        let mdhd_box = leaf(b"mdhd", mdhd());
        let mut mdia_body = mdhd_box;
        mdia_body.extend(hdlr_box);
        mdia_body.extend(minf_box);
        let mdia_box = leaf(b"mdia", mdia_body);
        let tkhd_box = leaf(b"tkhd", tkhd(1));
        let mut trak_body = tkhd_box;
        trak_body.extend(mdia_box);
        let trak_box = leaf(b"trak", trak_body);
        let trex_box = leaf(b"trex", trex(1));
        let mvex_box = leaf(b"mvex", trex_box);
        let mvhd_box = leaf(b"mvhd", mvhd());
        let mut moov_body = mvhd_box;
        moov_body.extend(trak_box);
        moov_body.extend(mvex_box);
        leaf(b"moov", moov_body)
    }

    fn tfhd(id: u32) -> Vec<u8> {
        let flags = 0x02_0000u32 | 0x08 | 0x10; // default-base-is-moof + default duration/size
        let mut v = vec![0u8];
        v.extend(flags.to_be_bytes()[1..].iter());
        v.extend(id.to_be_bytes());
        v.extend(1000u32.to_be_bytes());
        v.extend(100u32.to_be_bytes());
        v
    }

    fn tfdt(base: u32) -> Vec<u8> {
        let mut v = vec![0u8, 0, 0, 0];
        v.extend(base.to_be_bytes());
        v
    }

    fn trun(samples: u32) -> Vec<u8> {
        let mut v = vec![0u8, 0, 0, 0];
        v.extend(samples.to_be_bytes());
        v
    }

    fn build_moof(track_id: u32, base_dts: u32, samples: u32) -> Vec<u8> {
        let tfhd_box = leaf(b"tfhd", tfhd(track_id));
        let tfdt_box = leaf(b"tfdt", tfdt(base_dts));
        let trun_box = leaf(b"trun", trun(samples));
        let mut traf_body = tfhd_box;
        traf_body.extend(tfdt_box);
        traf_body.extend(trun_box);
        let traf_box = leaf(b"traf", traf_body);
        leaf(b"moof", traf_box)
    }

    #[tokio::test]
    async fn fragmented_lookup_without_tfdt_inherits_previous_end() {
        let mut file = Vec::new();
        file.extend(leaf(b"ftyp", b"iso5".to_vec()));
        file.extend(build_fragmented_moov());

        let moof1 = build_moof(1, 0, 2);
        let mdat1 = leaf(b"mdat", vec![0u8; 200]);
        file.extend(moof1);
        file.extend(mdat1);

        // Second fragment has no tfdt: base_data_offset-is-moof only.
        let tfhd_box = leaf(b"tfhd", tfhd(1));
        let trun_box = leaf(b"trun", trun(2));
        let mut traf_body = tfhd_box;
        traf_body.extend(trun_box);
        let traf_box = leaf(b"traf", traf_body);
        let moof2 = leaf(b"moof", traf_box);
        let mdat2 = leaf(b"mdat", vec![0u8; 200]);
        file.extend(moof2);
        file.extend(mdat2);

        let source: Arc<dyn crate::io::Source> = Arc::new(MemorySource::new(file));
        let mut input = Input::open(source, crate::config::ReaderConfig::default()).await.unwrap();
        assert!(input.is_fragmented());

        let first = input.get_first_chunk(1).await.unwrap().unwrap();
        assert_eq!(first.decode_timestamp, 0);

        // The first fragment's 2 samples each last 1000 ticks => end ts 2000.
        let next = input.get_next_chunk(1, &first).await.unwrap().unwrap();
        assert_eq!(next.decode_timestamp, 1000);

        let into_second_fragment = input.get_chunk(1, 2000).await.unwrap().unwrap();
        assert_eq!(into_second_fragment.decode_timestamp, 2000);
    }
}
