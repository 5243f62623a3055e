//! Box-header reading: the `traverseBox: readHeader → dispatch by fourCC →
//! either recurse or skip to box end` walk, split into two
//! layers:
//!
//! - [`read_box_header`] reads one header through the buffered `Reader`,
//!   used for the top-level walk where `mdat` may be gigabytes and must
//!   never be pulled into memory just to find `moov`.
//! - [`walk_boxes`] walks an already-loaded byte slice (a `moov`, a `moof`,
//!   an `mfra`) synchronously.

use crate::error::{MediaError, Result};
use crate::fourcc::FourCc;
use crate::io::Reader;

/// One box header as read from the top-level (or any) byte stream.
#[derive(Debug, Clone, Copy)]
pub struct BoxHeader {
    pub box_type: FourCc,
    /// Absolute offset of the first byte of this box (the size field).
    pub start: u64,
    /// Length of the size+type(+largesize) header itself: 8 or 16 bytes.
    pub header_len: u64,
    /// Total box size including the header. Resolved against the
    /// containing range's end if the on-disk `size` field was 0.
    pub size: u64,
}

impl BoxHeader {
    pub fn content_start(&self) -> u64 {
        self.start + self.header_len
    }

    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    pub fn content_len(&self) -> u64 {
        self.size - self.header_len
    }
}

/// Read one box header at `reader.pos`, advancing the cursor to the start
/// of the box's content. `range_end` is the size of the enclosing range
/// (the file, for top-level boxes), used to resolve a `size == 0` box that
/// extends to the end of its container.
pub async fn read_box_header(reader: &mut Reader, range_end: u64) -> Result<BoxHeader> {
    let start = reader.pos;
    reader.load_range(start, start + 8).await?;
    reader.pos = start;
    let size32 = reader.read_u32()?;
    let box_type = FourCc::new(&{
        let b = reader.read_bytes(4)?;
        let mut arr = [0u8; 4];
        arr.copy_from_slice(&b);
        arr
    });

    let (size, header_len) = if size32 == 1 {
        reader.load_range(start + 8, start + 16).await?;
        reader.pos = start + 8;
        let large = reader.read_u64()?;
        (large, 16)
    } else if size32 == 0 {
        (range_end - start, 8)
    } else {
        (size32 as u64, 8)
    };

    if size < header_len {
        return Err(MediaError::malformed(format!(
            "box {box_type} has size {size} smaller than its own header ({header_len})"
        )));
    }
    if start + size > range_end {
        return Err(MediaError::malformed(format!(
            "box {box_type} at {start} (size {size}) overruns its container (end {range_end})"
        )));
    }

    reader.pos = start + header_len;
    Ok(BoxHeader {
        box_type,
        start,
        header_len,
        size,
    })
}

/// Version + flags prefix of a full box (spec glossary: "Full-box").
pub fn read_full_box_prefix(reader: &mut Reader) -> Result<(u8, u32)> {
    let vf = reader.read_u32()?;
    Ok(((vf >> 24) as u8, vf & 0x00FF_FFFF))
}

/// Walk all boxes in `data` in pre-order, recursing into `containers`.
/// `callback` receives the box type and its content payload (header
/// stripped). This operates entirely on an already-loaded slice — used for
/// `moov`, one `moof`, or `mfra`, never directly on `mdat`.
pub fn walk_boxes<'a, F>(data: &'a [u8], containers: &[FourCc], callback: &mut F)
where
    F: FnMut(FourCc, &'a [u8]),
{
    let mut pos = 0usize;
    while pos + 8 <= data.len() {
        let size = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        let box_type = FourCc::new(&data[pos + 4..pos + 8].try_into().unwrap());

        let (size, header_len) = if size == 1 {
            if pos + 16 > data.len() {
                break;
            }
            let large = u64::from_be_bytes(data[pos + 8..pos + 16].try_into().unwrap()) as usize;
            (large, 16)
        } else if size == 0 {
            (data.len() - pos, 8)
        } else {
            (size, 8)
        };

        if size < header_len || pos + size > data.len() {
            break;
        }

        let payload = &data[pos + header_len..pos + size];
        callback(box_type, payload);

        if containers.contains(&box_type) {
            walk_boxes(payload, containers, callback);
        }

        pos += size;
    }
}

/// Find the first direct child box of `data` with type `target`, without
/// recursing into other children.
pub fn find_child<'a>(data: &'a [u8], target: FourCc) -> Option<&'a [u8]> {
    let mut pos = 0usize;
    while pos + 8 <= data.len() {
        let size = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        let box_type = FourCc::new(&data[pos + 4..pos + 8].try_into().unwrap());
        let (size, header_len) = if size == 1 {
            if pos + 16 > data.len() {
                break;
            }
            let large = u64::from_be_bytes(data[pos + 8..pos + 16].try_into().unwrap()) as usize;
            (large, 16)
        } else if size == 0 {
            (data.len() - pos, 8)
        } else {
            (size, 8)
        };
        if size < header_len || pos + size > data.len() {
            break;
        }
        if box_type == target {
            return Some(&data[pos + header_len..pos + size]);
        }
        pos += size;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fourcc;
    use crate::io::source::MemorySource;
    use std::sync::Arc;

    fn leaf(tag: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((8 + body.len()) as u32).to_be_bytes());
        out.extend_from_slice(tag);
        out.extend_from_slice(body);
        out
    }

    fn container(tag: &[u8; 4], children: &[Vec<u8>]) -> Vec<u8> {
        let body: Vec<u8> = children.concat();
        leaf(tag, &body)
    }

    #[tokio::test]
    async fn reads_simple_header() {
        let data = leaf(b"free", &[1, 2, 3]);
        let mut r = Reader::new(Arc::new(MemorySource::new(data.clone())), 1024);
        let h = read_box_header(&mut r, data.len() as u64).await.unwrap();
        assert_eq!(h.box_type, fourcc::FREE);
        assert_eq!(h.size, 11);
        assert_eq!(h.header_len, 8);
        assert_eq!(h.content_start(), 8);
    }

    #[tokio::test]
    async fn size_zero_extends_to_container_end() {
        let mut data = vec![0, 0, 0, 0];
        data.extend_from_slice(b"mdat");
        data.extend_from_slice(&[9; 20]);
        let mut r = Reader::new(Arc::new(MemorySource::new(data.clone())), 1024);
        let h = read_box_header(&mut r, data.len() as u64).await.unwrap();
        assert_eq!(h.size, data.len() as u64);
    }

    #[test]
    fn walk_recurses_into_containers() {
        let inner = leaf(b"tkhd", &[0u8; 4]);
        let trak = container(b"trak", &[inner.clone()]);
        let moov = container(b"moov", &[trak.clone()]);

        let mut seen = Vec::new();
        walk_boxes(&moov, &[fourcc::MOOV, fourcc::TRAK], &mut |t, payload| {
            seen.push((t, payload.len()));
        });

        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, fourcc::TRAK);
        assert_eq!(seen[1].0, fourcc::TKHD);
    }

    #[test]
    fn find_child_skips_non_matching_siblings() {
        let a = leaf(b"free", &[0; 2]);
        let b = leaf(b"tkhd", &[1; 4]);
        let moov = container(b"moov", &[a, b.clone()]);
        let found = find_child(&moov, fourcc::TKHD).unwrap();
        assert_eq!(found, &b[8..]);
    }
}
