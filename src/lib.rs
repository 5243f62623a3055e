//! # mediabox
//!
//! An ISOBMFF (MP4/MOV-family) container engine: a demuxer that reads
//! non-fragmented and fragmented files with random-access packet lookups, a
//! muxer that writes any of four `fastStart` layouts, and a conversion
//! orchestrator that plans and executes per-track copy/transcode/discard
//! decisions across container formats.
//!
//! Byte I/O, codec encode/decode, and other container formats are out of
//! scope: this crate defines the `Source`/`Target`/`Decoder`/`Encoder`
//! traits as the seams where a host plugs those in.

pub mod boxes;
pub mod config;
pub mod convert;
pub mod demux;
pub mod error;
pub mod fourcc;
pub mod io;
pub mod mux;
pub mod pipeline;

pub use config::{MuxerConfig, ReaderConfig};
pub use convert::{Conversion, ConversionOptions, Mode, OutputFormat, TrackOptions, TrackPlan};
pub use demux::{CodecConfig, Input, InputTrack, PacketLocation, TrackInfo, TrackKind};
pub use error::{MediaError, Result};
pub use fourcc::FourCc;
pub use io::{MemorySource, MemoryTarget, Reader, Source, Target, Writer};
pub use mux::{FastStart, Output, OutputTrack};
pub use pipeline::{
    AudioSampleSink, DecodedFrame, Decoder, Encoder, EncodedPacket, EncodedPacketSink, PacketIterator, PacketKind,
    SampleSink, SideData, VideoSampleSink,
};
