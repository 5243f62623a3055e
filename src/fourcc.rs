//! FourCC box-type tags.
//!
//! ISOBMFF identifies every box by a 4-byte ASCII tag. We model it as a
//! newtype instead of comparing raw byte slices everywhere, so box
//! dispatch reads as `fourcc::MOOV` rather than `b"moov"` scattered across
//! match arms.

use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const fn new(tag: &[u8; 4]) -> Self {
        FourCc(*tag)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| c.is_ascii_graphic() || c == ' ') => {
                write!(f, "FourCc({:?})", s)
            }
            _ => write!(f, "FourCc({:02x?})", self.0),
        }
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "{:02x?}", self.0),
        }
    }
}

impl From<&[u8; 4]> for FourCc {
    fn from(tag: &[u8; 4]) -> Self {
        FourCc(*tag)
    }
}

macro_rules! fourcc_consts {
    ($($name:ident => $tag:literal),* $(,)?) => {
        $(pub const $name: FourCc = FourCc(*$tag);)*
    };
}

fourcc_consts! {
    FTYP => b"ftyp",
    STYP => b"styp",
    FREE => b"free",
    SKIP => b"skip",
    MDAT => b"mdat",
    MOOV => b"moov",
    MVHD => b"mvhd",
    TRAK => b"trak",
    TKHD => b"tkhd",
    EDTS => b"edts",
    ELST => b"elst",
    MDIA => b"mdia",
    MDHD => b"mdhd",
    HDLR => b"hdlr",
    MINF => b"minf",
    STBL => b"stbl",
    STSD => b"stsd",
    STTS => b"stts",
    CTTS => b"ctts",
    STSZ => b"stsz",
    STSS => b"stss",
    STSC => b"stsc",
    STCO => b"stco",
    CO64 => b"co64",
    AVCC => b"avcC",
    HVCC => b"hvcC",
    VPCC => b"vpcC",
    AV1C => b"av1C",
    ESDS => b"esds",
    DOPS => b"dOps",
    DFLA => b"dfLa",
    COLR => b"colr",
    MVEX => b"mvex",
    TREX => b"trex",
    MOOF => b"moof",
    MFHD => b"mfhd",
    TRAF => b"traf",
    TFHD => b"tfhd",
    TFDT => b"tfdt",
    TRUN => b"trun",
    MFRA => b"mfra",
    TFRA => b"tfra",
    MFRO => b"mfro",
}

/// Top-level / nested box types the walker recurses into rather than
/// treating as opaque leaf payloads.
pub const CONTAINER_BOXES: &[FourCc] = &[
    MOOV, TRAK, EDTS, MDIA, MINF, STBL, MVEX, MOOF, TRAF, MFRA,
];

pub fn is_container(tag: FourCc) -> bool {
    CONTAINER_BOXES.contains(&tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_as_ascii() {
        assert_eq!(MOOV.to_string(), "moov");
        assert_eq!(format!("{:?}", MOOV), "FourCc(\"moov\")");
    }

    #[test]
    fn container_classification() {
        assert!(is_container(MOOV));
        assert!(is_container(TRAF));
        assert!(!is_container(STSZ));
        assert!(!is_container(MDAT));
    }

    #[test]
    fn equality_and_hash_are_byte_based() {
        assert_eq!(FourCc::new(b"moov"), MOOV);
        assert_ne!(FourCc::new(b"moof"), MOOV);
    }
}
