//! The ISOBMFF demuxer: metadata parsing, non-fragmented sample tables,
//! fragmented random access, and the packet-retrieval contract that sits
//! on top of both.

pub mod fragment;
pub mod input;
pub mod lookup;
pub mod metadata;
pub mod sample_table;
pub mod track_info;

pub use input::{Input, InputTrack, PacketLocation};
pub use track_info::{CodecConfig, TrackInfo, TrackKind};
