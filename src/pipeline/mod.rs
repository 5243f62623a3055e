//! Packet sources and sinks: the lazy, backpressured bridge between
//! `Input`/`Output` and decode/encode collaborators.

pub mod decoder;
pub mod packet;
pub mod sink;

pub use decoder::{AudioSampleSink, DecodedFrame, Decoder, Encoder, SampleSink, VideoSampleSink};
pub use packet::{EncodedPacket, PacketKind, SideData};
pub use sink::{EncodedPacketSink, PacketIterator};
