//! The `Target` contract: an append/patch byte sink.

use async_trait::async_trait;

use crate::error::{MediaError, Result};

/// Byte-addressable write access backing an `Output`.
///
/// `seek` to a previously-written offset for patching (e.g. rewriting a
/// placeholder box size, or the `mdat` size after streaming) is required.
/// Writes after `finalize` are undefined.
#[async_trait]
pub trait Target: Send + Sync {
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;
    async fn seek(&mut self, absolute: u64) -> Result<()>;
    async fn position(&mut self) -> Result<u64>;
    async fn flush(&mut self) -> Result<()>;
    async fn finalize(&mut self) -> Result<()>;
    async fn cancel(&mut self) -> Result<()>;
}

/// An in-memory `Target` that grows a `Vec<u8>`, supporting seek-back
/// patching. This crate's own test/demo backing; see `MemorySource`.
pub struct MemoryTarget {
    buf: Vec<u8>,
    pos: u64,
    finalized: bool,
    cancelled: bool,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            finalized: false,
            cancelled: false,
        }
    }

    /// Snapshot of the bytes written so far. Only meaningful after
    /// `finalize()` has succeeded, but callers may peek mid-write too.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for MemoryTarget {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Target for MemoryTarget {
    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.finalized {
            return Err(MediaError::NotReady("write after finalize".into()));
        }
        let end = self.pos as usize + bytes.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[self.pos as usize..end].copy_from_slice(bytes);
        self.pos = end as u64;
        Ok(())
    }

    async fn seek(&mut self, absolute: u64) -> Result<()> {
        if absolute as usize > self.buf.len() {
            return Err(MediaError::WriteFailed(format!(
                "seek past end: {} > {}",
                absolute,
                self.buf.len()
            )));
        }
        self.pos = absolute;
        Ok(())
    }

    async fn position(&mut self) -> Result<u64> {
        Ok(self.pos)
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        self.finalized = true;
        Ok(())
    }

    async fn cancel(&mut self) -> Result<()> {
        self.cancelled = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_and_patch_back() {
        let mut t = MemoryTarget::new();
        t.write(b"AAAA1234").await.unwrap();
        t.seek(0).await.unwrap();
        t.write(b"BBBB").await.unwrap();
        t.seek(8).await.unwrap();
        t.write(b"tail").await.unwrap();
        assert_eq!(t.bytes(), b"BBBB1234tail");
    }

    #[tokio::test]
    async fn write_after_finalize_fails() {
        let mut t = MemoryTarget::new();
        t.finalize().await.unwrap();
        assert!(t.write(b"x").await.is_err());
    }

    #[tokio::test]
    async fn seek_past_end_fails() {
        let mut t = MemoryTarget::new();
        t.write(b"abc").await.unwrap();
        assert!(t.seek(10).await.is_err());
    }
}
