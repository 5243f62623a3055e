//! Muxing: turning encoded packets into an ISOBMFF `Output`.

pub mod output;
pub mod strategy;
pub mod track;
pub mod writer_boxes;

pub use output::{Output, OutputTrack};
pub use strategy::FastStart;
pub use track::{Chunk, Sample};
