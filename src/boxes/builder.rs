//! Write-side box tree: build a `BoxNode` tree in memory, measure it
//! bottom-up, then emit it through a `Writer`. Mirrors a
//! `Fmp4Muxer` pattern of "write placeholder size, recurse, seek back and
//! patch" but generalized to a reusable tree rather than inlined per call
//! site, since this crate emits `ftyp`/`moov`/`moof`/`mfra` trees of very
//! different shapes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::fourcc::FourCc;
use crate::io::target::Target;
use crate::io::writer::Writer;

const LARGE_SIZE_THRESHOLD: u64 = u32::MAX as u64;

enum Content {
    Leaf(Bytes),
    Children(Vec<BoxNode>),
}

/// One node of a box tree ready to be written. Built bottom-up: leaves
/// first, then wrapped in containers.
pub struct BoxNode {
    box_type: FourCc,
    content: Content,
}

impl BoxNode {
    pub fn leaf(box_type: FourCc, body: impl Into<Bytes>) -> Self {
        Self {
            box_type,
            content: Content::Leaf(body.into()),
        }
    }

    pub fn container(box_type: FourCc, children: Vec<BoxNode>) -> Self {
        Self {
            box_type,
            content: Content::Children(children),
        }
    }

    /// A full-box leaf: prefixes `body` with the standard `version(1) +
    /// flags(3)` header used by `mvhd`, `tkhd`, `stsd`, and friends.
    pub fn full_leaf(box_type: FourCc, version: u8, flags: u32, body: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(4 + body.len());
        let vf = ((version as u32) << 24) | (flags & 0x00FF_FFFF);
        buf.put_u32(vf);
        buf.put_slice(body);
        Self::leaf(box_type, buf.freeze())
    }

    /// Total encoded size of this box including its own header, computed
    /// bottom-up. Matches the header width `write` will actually choose.
    pub fn encoded_size(&self) -> u64 {
        let body_len = match &self.content {
            Content::Leaf(b) => b.len() as u64,
            Content::Children(children) => children.iter().map(BoxNode::encoded_size).sum(),
        };
        let header_len = if 8 + body_len > LARGE_SIZE_THRESHOLD { 16 } else { 8 };
        header_len + body_len
    }

    pub async fn write<T: Target>(&self, w: &mut Writer<T>) -> Result<()> {
        let total = self.encoded_size();
        if total > LARGE_SIZE_THRESHOLD {
            w.write_u32(1).await?;
            w.write_bytes(self.box_type.as_bytes()).await?;
            w.write_u64(total).await?;
        } else {
            w.write_u32(total as u32).await?;
            w.write_bytes(self.box_type.as_bytes()).await?;
        }
        match &self.content {
            Content::Leaf(b) => w.write_bytes(b).await?,
            Content::Children(children) => {
                for child in children {
                    Box::pin(child.write(w)).await?;
                }
            }
        }
        Ok(())
    }

    /// Flatten the tree into a contiguous buffer without going through a
    /// `Target` — used when the caller needs the encoded bytes in hand
    /// (e.g. to compute a `moof` size before laying down its `trun` data
    /// offsets, which depend on the `moof`'s own length).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size() as usize);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        let total = self.encoded_size();
        if total > LARGE_SIZE_THRESHOLD {
            buf.put_u32(1);
            buf.put_slice(self.box_type.as_bytes());
            buf.put_u64(total);
        } else {
            buf.put_u32(total as u32);
            buf.put_slice(self.box_type.as_bytes());
        }
        match &self.content {
            Content::Leaf(b) => buf.put_slice(b),
            Content::Children(children) => {
                for child in children {
                    child.encode_into(buf);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fourcc;
    use crate::io::target::MemoryTarget;

    #[test]
    fn leaf_size_includes_header() {
        let n = BoxNode::leaf(fourcc::FREE, Bytes::from_static(&[1, 2, 3]));
        assert_eq!(n.encoded_size(), 11);
    }

    #[test]
    fn container_size_sums_children() {
        let tkhd = BoxNode::leaf(fourcc::TKHD, Bytes::from_static(&[0u8; 4]));
        let trak = BoxNode::container(fourcc::TRAK, vec![tkhd]);
        assert_eq!(trak.encoded_size(), 8 + 12);
    }

    #[test]
    fn full_leaf_prefixes_version_and_flags() {
        let n = BoxNode::full_leaf(fourcc::MVHD, 0, 0, &[0xAB; 4]);
        let encoded = n.encode();
        assert_eq!(encoded[8..12], [0, 0, 0, 0]);
        assert_eq!(encoded[12..16], [0xAB; 4]);
    }

    #[tokio::test]
    async fn write_matches_encode() {
        let inner = BoxNode::leaf(fourcc::TKHD, Bytes::from_static(&[9u8; 2]));
        let trak = BoxNode::container(fourcc::TRAK, vec![inner]);
        let encoded = trak.encode();

        let mut w = Writer::new(MemoryTarget::new());
        trak.write(&mut w).await.unwrap();
        let written = w.into_inner().into_bytes();

        assert_eq!(written, encoded.to_vec());
    }
}
