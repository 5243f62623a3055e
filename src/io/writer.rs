//! The mirror of `Reader` over a `Target`: buffered primitive writers plus
//! seek-back for patching previously written headers (box sizes, `mdat`
//! size, the final `mfro` self-reference).

use bytes::Bytes;

use crate::error::Result;
use crate::io::target::Target;

pub struct Writer<T: Target> {
    target: T,
}

impl<T: Target> Writer<T> {
    pub fn new(target: T) -> Self {
        Self { target }
    }

    pub fn into_inner(self) -> T {
        self.target
    }

    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.target
    }

    pub async fn position(&mut self) -> Result<u64> {
        self.target.position().await
    }

    pub async fn seek(&mut self, absolute: u64) -> Result<()> {
        self.target.seek(absolute).await
    }

    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.target.write(bytes).await
    }

    pub async fn write_u8(&mut self, v: u8) -> Result<()> {
        self.target.write(&[v]).await
    }

    pub async fn write_u16(&mut self, v: u16) -> Result<()> {
        self.target.write(&v.to_be_bytes()).await
    }

    pub async fn write_u24(&mut self, v: u32) -> Result<()> {
        let b = v.to_be_bytes();
        self.target.write(&b[1..4]).await
    }

    pub async fn write_u32(&mut self, v: u32) -> Result<()> {
        self.target.write(&v.to_be_bytes()).await
    }

    pub async fn write_u64(&mut self, v: u64) -> Result<()> {
        self.target.write(&v.to_be_bytes()).await
    }

    pub async fn write_i16(&mut self, v: i16) -> Result<()> {
        self.target.write(&v.to_be_bytes()).await
    }

    pub async fn write_i32(&mut self, v: i32) -> Result<()> {
        self.target.write(&v.to_be_bytes()).await
    }

    /// 16.16 fixed point, used for `mvhd`/`tkhd` rate and volume fields.
    pub async fn write_fixed_16_16(&mut self, v: f64) -> Result<()> {
        self.write_i32((v * 65536.0).round() as i32).await
    }

    /// 8.8 fixed point, used for `tkhd` volume.
    pub async fn write_fixed_8_8(&mut self, v: f64) -> Result<()> {
        self.write_i16((v * 256.0).round() as i16).await
    }

    /// 2.30 fixed point, used for the `tkhd` transformation matrix.
    pub async fn write_fixed_2_30(&mut self, v: f64) -> Result<()> {
        self.write_i32((v * 1073741824.0).round() as i32).await
    }

    pub async fn write_ascii(&mut self, s: &str) -> Result<()> {
        self.target.write(s.as_bytes()).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.target.flush().await
    }

    pub async fn finalize(&mut self) -> Result<()> {
        self.target.finalize().await
    }

    pub async fn cancel(&mut self) -> Result<()> {
        self.target.cancel().await
    }
}

/// Owned bytes queued for a single write, used by callers that build a
/// payload in memory before handing it to the `Writer` (e.g. a finished
/// box tree).
pub async fn write_all<T: Target>(w: &mut Writer<T>, chunks: &[Bytes]) -> Result<()> {
    for c in chunks {
        w.write_bytes(c).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::target::MemoryTarget;

    #[tokio::test]
    async fn fixed_point_round_trips_reasonably() {
        let mut w = Writer::new(MemoryTarget::new());
        w.write_fixed_16_16(1.0).await.unwrap();
        let bytes = w.into_inner().into_bytes();
        assert_eq!(bytes, 65536i32.to_be_bytes());
    }

    #[tokio::test]
    async fn seek_back_patches_header() {
        let mut w = Writer::new(MemoryTarget::new());
        w.write_u32(0).await.unwrap(); // placeholder size
        w.write_ascii("ftyp").await.unwrap();
        w.write_ascii("isom").await.unwrap();
        let end = w.position().await.unwrap();
        w.seek(0).await.unwrap();
        w.write_u32(end as u32).await.unwrap();
        w.seek(end).await.unwrap();
        let bytes = w.into_inner().into_bytes();
        assert_eq!(u32::from_be_bytes(bytes[0..4].try_into().unwrap()), end as u32);
    }
}
