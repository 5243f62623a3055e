//! The `Source` contract: a read-only, random-access byte stream.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use crate::error::{MediaError, Result};

/// Byte-addressable read access over something that backs an `Input`.
///
/// Implementations may be called concurrently with distinct, non-overlapping
/// ranges; a file handle, an HTTP range fetcher, and an in-memory
/// buffer all satisfy this contract identically from the demuxer's point of
/// view. This crate's hard core never constructs a `Source` on its own
/// behalf beyond the in-memory adapter used by its own tests — real
/// adapters are external collaborators.
#[async_trait]
pub trait Source: Send + Sync {
    /// Total size of the underlying stream in bytes.
    async fn size(&self) -> Result<u64>;

    /// Read exactly `end - start` bytes, or fail with `ReadFailed`.
    async fn read(&self, start: u64, end: u64) -> Result<Bytes>;
}

/// An in-memory `Source` over an owned byte buffer.
///
/// This is the crate's own minimal backing used for its test/demo suite.
/// Real byte-I/O adapters (file, network) are out of this crate's scope.
#[derive(Clone)]
pub struct MemorySource {
    data: Arc<Bytes>,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: Arc::new(data.into()),
        }
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn size(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    async fn read(&self, start: u64, end: u64) -> Result<Bytes> {
        let (start, end) = (start as usize, end as usize);
        if start > end || end > self.data.len() {
            return Err(MediaError::ReadFailed(format!(
                "range {}..{} out of bounds (len={})",
                start,
                end,
                self.data.len()
            )));
        }
        Ok(self.data.slice(start..end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_exact_range() {
        let src = MemorySource::new(Bytes::from_static(b"0123456789"));
        assert_eq!(src.size().await.unwrap(), 10);
        assert_eq!(&src.read(2, 5).await.unwrap()[..], b"234");
    }

    #[tokio::test]
    async fn out_of_bounds_read_fails() {
        let src = MemorySource::new(Bytes::from_static(b"abc"));
        assert!(src.read(0, 10).await.is_err());
    }
}
