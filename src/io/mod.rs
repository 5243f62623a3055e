//! Byte I/O primitives: the `Source`/`Target` contracts and the buffered
//! `Reader`/`Writer` that sit on top of them.

pub mod reader;
pub mod source;
pub mod target;
pub mod writer;

pub use reader::Reader;
pub use source::{MemorySource, Source};
pub use target::{MemoryTarget, Target};
pub use writer::Writer;
