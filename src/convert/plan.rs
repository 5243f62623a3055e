//! Per-track conversion planning: decide `copy`, `transcode`, or `discard`
//! for each input track against an output format's supported codec set.

use crate::convert::options::TrackOptions;
use crate::demux::track_info::TrackKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Mp4,
    Mov,
    Webm,
    Avi,
}

impl OutputFormat {
    fn supported_codecs(self, kind: TrackKind) -> &'static [&'static str] {
        match (self, kind) {
            (OutputFormat::Mp4, TrackKind::Video) => &["avc1", "hvc1", "vp08", "vp09", "av01"],
            (OutputFormat::Mp4, TrackKind::Audio) => &["mp4a", "opus", "flac", "mp3"],
            (OutputFormat::Mp4, TrackKind::Subtitle) => &["wvtt", "tx3g"],
            (OutputFormat::Mov, TrackKind::Video) => &["avc1", "hvc1", "vp08", "vp09", "av01", "mp4v"],
            (OutputFormat::Mov, TrackKind::Audio) => &["mp4a", "opus", "flac", "mp3", "ac-3", "ec-3", "vorbis", "alac"],
            (OutputFormat::Mov, TrackKind::Subtitle) => &["wvtt", "tx3g", "ttml"],
            (OutputFormat::Webm, TrackKind::Video) => &["avc1", "hvc1", "vp08", "vp09", "av01", "mp4v"],
            (OutputFormat::Webm, TrackKind::Audio) => &["mp4a", "opus", "flac", "mp3", "vorbis"],
            (OutputFormat::Webm, TrackKind::Subtitle) => &["srt", "ass", "wvtt"],
            (OutputFormat::Avi, TrackKind::Video) => &["avc1", "hvc1", "vp08", "vp09", "av01", "mp4v"],
            (OutputFormat::Avi, TrackKind::Audio) => &["mp3", "mp4a", "vorbis", "flac", "pcm", "ulaw", "alaw"],
            (OutputFormat::Avi, TrackKind::Subtitle) => &[],
        }
    }

    /// The best target codec this format has an encoder available for,
    /// given a requested codec preference (or the format's first choice).
    fn encodable_target(self, kind: TrackKind, requested: Option<&str>) -> Option<&'static str> {
        let supported = self.supported_codecs(kind);
        if let Some(req) = requested {
            return supported.iter().find(|&&c| c == req).copied();
        }
        supported.first().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Copy,
    Transcode,
    Discard,
}

#[derive(Debug, Clone)]
pub struct TrackPlan {
    pub input_track_id: u32,
    pub kind: TrackKind,
    pub mode: Mode,
    pub chosen_output_codec: Option<String>,
    pub discard_reason: Option<String>,
}

/// Plans one input track: `copy` iff its codec is already accepted by the
/// output format and no transform options apply; otherwise `transcode` if
/// an encoder target exists; otherwise `discard`.
pub fn plan_track(
    input_track_id: u32,
    kind: TrackKind,
    input_codec: &str,
    format: OutputFormat,
    options: &TrackOptions,
) -> TrackPlan {
    if options.discard {
        return TrackPlan {
            input_track_id,
            kind,
            mode: Mode::Discard,
            chosen_output_codec: None,
            discard_reason: Some("discard_requested".into()),
        };
    }

    let supported = format.supported_codecs(kind);
    let accepted_as_is = supported.contains(&input_codec) && !options.has_transform() && options.codec.is_none();
    if accepted_as_is {
        return TrackPlan {
            input_track_id,
            kind,
            mode: Mode::Copy,
            chosen_output_codec: Some(input_codec.to_string()),
            discard_reason: None,
        };
    }

    match format.encodable_target(kind, options.codec.as_deref()) {
        Some(codec) => TrackPlan {
            input_track_id,
            kind,
            mode: Mode::Transcode,
            chosen_output_codec: Some(codec.to_string()),
            discard_reason: None,
        },
        None => TrackPlan {
            input_track_id,
            kind,
            mode: Mode::Discard,
            chosen_output_codec: None,
            discard_reason: Some("no_encodable_target_codec".into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_codec_with_no_transform_is_copied() {
        let plan = plan_track(1, TrackKind::Video, "avc1", OutputFormat::Mp4, &TrackOptions::default());
        assert_eq!(plan.mode, Mode::Copy);
    }

    #[test]
    fn mismatched_codec_transcodes_to_format_default() {
        let plan = plan_track(1, TrackKind::Video, "vp09", OutputFormat::Mp4, &TrackOptions::default());
        assert_eq!(plan.mode, Mode::Transcode);
        assert_eq!(plan.chosen_output_codec.as_deref(), Some("avc1"));
    }

    #[test]
    fn unencodable_target_is_discarded_with_reason() {
        let opts = TrackOptions { codec: Some("ass".into()), ..Default::default() };
        let plan = plan_track(1, TrackKind::Subtitle, "srt", OutputFormat::Mp4, &opts);
        assert_eq!(plan.mode, Mode::Discard);
        assert_eq!(plan.discard_reason.as_deref(), Some("no_encodable_target_codec"));
    }

    #[test]
    fn explicit_codec_request_forces_transcode_even_if_already_accepted() {
        let opts = TrackOptions { codec: Some("opus".into()), ..Default::default() };
        let plan = plan_track(1, TrackKind::Audio, "mp4a", OutputFormat::Mp4, &opts);
        assert_eq!(plan.mode, Mode::Transcode);
        assert_eq!(plan.chosen_output_codec.as_deref(), Some("opus"));
    }
}
