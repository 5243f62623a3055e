//! `EncodedPacket`, the one coded unit that flows between demux sinks and
//! mux sources.

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Key,
    Delta,
}

/// Arbitrary auxiliary payload carried alongside a packet, e.g. an alpha
/// plane for formats that encode it as a second elementary stream.
#[derive(Debug, Clone)]
pub struct SideData {
    pub label: String,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct EncodedPacket {
    pub data: Bytes,
    pub kind: PacketKind,
    pub timestamp_us: i64,
    pub duration_us: i64,
    pub sequence_number: u64,
    pub side_data: Option<SideData>,
}

impl EncodedPacket {
    pub fn is_key(&self) -> bool {
        self.kind == PacketKind::Key
    }

    pub fn presentation_end_us(&self) -> i64 {
        self.timestamp_us + self.duration_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presentation_end_adds_duration() {
        let p = EncodedPacket {
            data: Bytes::new(),
            kind: PacketKind::Key,
            timestamp_us: 1000,
            duration_us: 500,
            sequence_number: 0,
            side_data: None,
        };
        assert_eq!(p.presentation_end_us(), 1500);
        assert!(p.is_key());
    }
}
