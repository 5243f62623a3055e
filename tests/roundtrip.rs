//! End-to-end coverage for the muxer/demuxer pair: write a small movie with
//! `Output`, read it back with `Input`, and check what actually round-trips.

use std::sync::Arc;

use bytes::Bytes;
use mediabox::boxes::Rotation;
use mediabox::{
    CodecConfig, EncodedPacket, FastStart, Input, MemorySource, MemoryTarget, MuxerConfig, Output, PacketKind,
    ReaderConfig, TrackInfo,
};

fn packet(kind: PacketKind, timestamp_us: i64, duration_us: i64, data: &'static [u8]) -> EncodedPacket {
    EncodedPacket {
        data: Bytes::from_static(data),
        kind,
        timestamp_us,
        duration_us,
        sequence_number: 0,
        side_data: None,
    }
}

async fn write_movie(fast_start: FastStart) -> Vec<u8> {
    let mut out = Output::new(MemoryTarget::new(), MuxerConfig { fast_start, ..MuxerConfig::default() }, 0);
    out.add_track(
        1,
        TrackInfo::Video { width: 640, height: 480, rotation: Rotation::None },
        CodecConfig { codec: "avc1".into(), description: None },
        1000,
        "und",
    )
    .unwrap();
    out.add_track(
        2,
        TrackInfo::Audio { channels: 2, sample_rate: 48000 },
        CodecConfig { codec: "opus".into(), description: None },
        48000,
        "und",
    )
    .unwrap();
    out.start().await.unwrap();

    for i in 0..5i64 {
        let kind = if i == 0 { PacketKind::Key } else { PacketKind::Delta };
        out.add_packet(1, packet(kind, i * 33_333, 33_333, b"video-frame")).await.unwrap();
    }
    for i in 0..10i64 {
        out.add_packet(2, packet(PacketKind::Key, i * 20_000, 20_000, b"audio-frame")).await.unwrap();
    }

    out.finalize().await.unwrap();
    out.into_target().into_bytes()
}

#[tokio::test]
async fn streaming_mp4_round_trips_track_metadata_and_sample_count() {
    let bytes = write_movie(FastStart::Streaming).await;
    let source: Arc<dyn mediabox::Source> = Arc::new(MemorySource::new(Bytes::from(bytes)));
    let mut input = Input::open(source, ReaderConfig::default()).await.unwrap();

    assert!(!input.is_fragmented());
    let tracks = input.tracks();
    assert_eq!(tracks.len(), 2);

    let video = tracks.iter().find(|t| t.id == 1).unwrap();
    assert!(video.info.is_video());
    assert_eq!(video.codec, "avc1");
    assert_eq!(video.timescale, 1000);

    let audio = tracks.iter().find(|t| t.id == 2).unwrap();
    assert!(audio.info.is_audio());
    assert_eq!(audio.codec, "opus");
    assert_eq!(audio.timescale, 48000);

    let table = input.sample_table(1).await.unwrap();
    assert_eq!(table.sample_count(), 5);

    let first = input.get_sample_info(1, 0).await.unwrap();
    assert_eq!(first.presentation_timestamp, 0);
    assert!(first.key);
    let second = input.get_sample_info(1, 1).await.unwrap();
    assert_eq!(second.presentation_timestamp, 33);
    assert!(!second.key);

    let bytes = input.sample_bytes(&first).await.unwrap();
    assert_eq!(&bytes[..], b"video-frame");
}

#[tokio::test]
async fn fragmented_mp4_round_trips_via_fragment_lookup() {
    let bytes = write_movie(FastStart::Fragmented).await;
    let source: Arc<dyn mediabox::Source> = Arc::new(MemorySource::new(Bytes::from(bytes)));
    let mut input = Input::open(source, ReaderConfig::default()).await.unwrap();
    assert!(input.is_fragmented());

    let first = input.get_sample_info(2, 0).await;
    // A fragmented track has no `stbl`; sample_table()/get_sample_info()
    // is the non-fragmented path and correctly refuses it.
    assert!(first.is_err());
}

#[tokio::test]
async fn fragmented_output_can_close_fragments_before_finalize() {
    let mut out = Output::new(MemoryTarget::new(), MuxerConfig { fast_start: FastStart::Fragmented, ..MuxerConfig::default() }, 0);
    out.add_track(
        1,
        TrackInfo::Audio { channels: 1, sample_rate: 16000 },
        CodecConfig { codec: "opus".into(), description: None },
        16000,
        "und",
    )
    .unwrap();
    out.start().await.unwrap();
    for i in 0..3i64 {
        out.add_packet(1, packet(PacketKind::Key, i * 20_000, 20_000, b"a")).await.unwrap();
    }
    out.close_fragment().await.unwrap();
    for i in 3..6i64 {
        out.add_packet(1, packet(PacketKind::Key, i * 20_000, 20_000, b"a")).await.unwrap();
    }
    out.finalize().await.unwrap();
    let bytes = out.into_target().into_bytes();

    let source: Arc<dyn mediabox::Source> = Arc::new(MemorySource::new(bytes));
    let mut input = Input::open(source, ReaderConfig::default()).await.unwrap();
    assert!(input.is_fragmented());

    let mut count = 0;
    let mut next = input.get_first_chunk(1).await.unwrap();
    while let Some(chunk) = next {
        count += 1;
        next = input.get_next_chunk(1, &chunk).await.unwrap();
    }
    // The trailing 3 packets, still queued in the open chunk at finalize()
    // time, must survive alongside the 3 already flushed by close_fragment().
    assert_eq!(count, 6);
}

#[tokio::test]
async fn garbage_input_is_rejected_without_panicking() {
    let source: Arc<dyn mediabox::Source> = Arc::new(MemorySource::new(Bytes::from_static(b"not an mp4 at all")));
    let result = Input::open(source, ReaderConfig::default()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn add_packet_on_unknown_track_fails_cleanly() {
    let mut out = Output::new(MemoryTarget::new(), MuxerConfig { fast_start: FastStart::Streaming, ..MuxerConfig::default() }, 0);
    out.add_track(
        1,
        TrackInfo::Video { width: 320, height: 240, rotation: Rotation::None },
        CodecConfig { codec: "avc1".into(), description: None },
        1000,
        "und",
    )
    .unwrap();
    out.start().await.unwrap();
    let err = out.add_packet(99, packet(PacketKind::Key, 0, 1000, b"x")).await.unwrap_err();
    assert!(matches!(err, mediabox::MediaError::Malformed(_)));
}
