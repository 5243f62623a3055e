//! ISOBMFF box reading and writing primitives shared by `demux` and `mux`.

pub mod builder;
pub mod header;
pub mod rotation;

pub use builder::BoxNode;
pub use header::{find_child, read_box_header, read_full_box_prefix, walk_boxes, BoxHeader};
pub use rotation::Rotation;
