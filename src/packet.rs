use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, Digest, CRC_32_ISO_HDLC};
use tinyvec::TinyVec;

use crate::error::{Error, Result};

/// Packet wire format, all integers little-endian:
///
/// ```text
///  0        4        5        6
/// +--------+--------+--------+------------------+---------------------+
/// | last   | nak    | check- | nak offsets      | chunks              |
/// | contin.| type   | sum    | (nak_type > 0    | number(4) size(1)   |
/// | (i32)  | (i8)   | (u8)   |  bytes, u8 each) | payload[size] ...   |
/// +--------+--------+--------+------------------+---------------------+
/// ```
///
/// `last_continuous` is the highest chunk number the sender has received in
/// order (-1 = none yet). A negative `nak_type` reports `-nak_type` missing
/// chunks starting right after `last_continuous`; a positive one is followed
/// by that many single-byte offsets from `last_continuous + 1`.
pub(crate) const PACKET_HEADER_SIZE: usize = 6;
pub(crate) const PACKET_MAX_SIZE: usize = 4096;

pub(crate) const CHUNK_HEADER_SIZE: usize = 5;
pub(crate) const CHUNK_MAX_PAYLOAD: usize = 254;

pub(crate) const PACKET_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// The unit of reliability: a numbered slice of the outbound byte stream.
///
/// Chunks are immutable once created and shared between the unacked queue,
/// the resend map and any in-flight packet.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Chunk {
    pub(crate) chunk_number: i32,
    pub(crate) data: Bytes,
}

impl Chunk {
    pub(crate) fn wire_size(&self) -> usize {
        CHUNK_HEADER_SIZE + self.data.len()
    }

    fn update_checksum(&self, digest: &mut Digest<'_, u32>) {
        digest.update(&self.chunk_number.to_le_bytes());
        digest.update(&(self.data.len() as u32).to_le_bytes());
        digest.update(&self.data);
    }
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct Packet {
    pub(crate) last_continuous: i32,
    pub(crate) nak_type: i8,
    pub(crate) checksum: u8,
    pub(crate) naks: TinyVec<[u8; 32]>,
    pub(crate) chunks: Vec<Arc<Chunk>>,
}

impl Packet {
    pub(crate) fn new(last_continuous: i32, nak_type: i8) -> Self {
        Packet {
            last_continuous,
            nak_type,
            ..Default::default()
        }
    }

    pub(crate) fn unmarshal(raw: &Bytes) -> Result<Self> {
        if raw.len() < PACKET_HEADER_SIZE {
            return Err(Error::ErrPacketHeaderTooSmall);
        }

        let mut reader = raw.clone();

        let last_continuous = reader.get_i32_le();
        let nak_type = reader.get_i8();
        let checksum = reader.get_u8();

        let mut naks = TinyVec::default();
        if nak_type > 0 {
            for _ in 0..nak_type {
                if reader.remaining() < 1 {
                    break;
                }
                naks.push(reader.get_u8());
            }
        }

        let mut chunks = vec![];
        while reader.remaining() > CHUNK_HEADER_SIZE {
            let chunk_number = reader.get_i32_le();
            let chunk_size = reader.get_u8() as usize;

            // defective tail, ignore
            if reader.remaining() < chunk_size {
                break;
            }

            chunks.push(Arc::new(Chunk {
                chunk_number,
                data: reader.split_to(chunk_size),
            }));
        }

        Ok(Packet {
            last_continuous,
            nak_type,
            checksum,
            naks,
            chunks,
        })
    }

    pub(crate) fn wire_size(&self) -> usize {
        let mut size = PACKET_HEADER_SIZE + self.naks.len();
        for chunk in &self.chunks {
            size += chunk.wire_size();
        }
        size
    }

    /// Digest over every field except the checksum byte itself; the low byte
    /// of the CRC-32 is the wire checksum.
    pub(crate) fn calc_checksum(&self) -> u8 {
        let mut digest = PACKET_CRC.digest();
        digest.update(&self.last_continuous.to_le_bytes());
        digest.update(&(self.nak_type as i32 as u32).to_le_bytes());

        if !self.naks.is_empty() {
            digest.update(&self.naks);
        }
        for chunk in &self.chunks {
            chunk.update_checksum(&mut digest);
        }

        digest.finalize() as u8
    }

    pub(crate) fn marshal_to(&self, writer: &mut BytesMut) -> usize {
        writer.put_i32_le(self.last_continuous);
        writer.put_i8(self.nak_type);
        writer.put_u8(self.checksum);
        writer.extend_from_slice(&self.naks);

        for chunk in &self.chunks {
            writer.put_i32_le(chunk.chunk_number);
            writer.put_u8(chunk.data.len() as u8);
            writer.extend_from_slice(&chunk.data);
        }

        writer.len()
    }

    pub(crate) fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        self.marshal_to(&mut buf);
        buf.freeze()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_packet_unmarshal_too_small() {
        let result = Packet::unmarshal(&Bytes::from_static(&[0xff, 0xff, 0xff, 0xff, 0x00]));
        assert_eq!(Err(Error::ErrPacketHeaderTooSmall), result);
    }

    #[test]
    fn test_packet_unmarshal_header_only() -> Result<()> {
        let raw = Bytes::from_static(&[0xff, 0xff, 0xff, 0xff, 0x00, 0x5a]);
        let pkt = Packet::unmarshal(&raw)?;

        assert_eq!(-1, pkt.last_continuous);
        assert_eq!(0, pkt.nak_type);
        assert_eq!(0x5a, pkt.checksum);
        assert!(pkt.naks.is_empty());
        assert!(pkt.chunks.is_empty());
        Ok(())
    }

    #[test]
    fn test_packet_unmarshal_chunks() -> Result<()> {
        let raw = Bytes::from_static(&[
            0x02, 0x00, 0x00, 0x00, // last_continuous = 2
            0x00, 0x00, // nak_type, checksum
            0x03, 0x00, 0x00, 0x00, 0x03, b'a', b'b', b'c', // chunk 3, 3 bytes
            0x04, 0x00, 0x00, 0x00, 0x01, b'd', // chunk 4, 1 byte
        ]);
        let pkt = Packet::unmarshal(&raw)?;

        assert_eq!(2, pkt.chunks.len());
        assert_eq!(3, pkt.chunks[0].chunk_number);
        assert_eq!(Bytes::from_static(b"abc"), pkt.chunks[0].data);
        assert_eq!(4, pkt.chunks[1].chunk_number);
        assert_eq!(Bytes::from_static(b"d"), pkt.chunks[1].data);
        Ok(())
    }

    #[test]
    fn test_packet_unmarshal_nak_vector() -> Result<()> {
        let raw = Bytes::from_static(&[
            0x05, 0x00, 0x00, 0x00, // last_continuous = 5
            0x03, 0x00, // nak_type = 3, checksum
            0x01, 0x04, 0x09, // nak offsets
        ]);
        let pkt = Packet::unmarshal(&raw)?;

        assert_eq!(3, pkt.nak_type);
        assert_eq!(&[1, 4, 9], &pkt.naks[..]);
        assert!(pkt.chunks.is_empty());
        Ok(())
    }

    #[test]
    fn test_packet_unmarshal_run_nak_has_no_vector() -> Result<()> {
        let raw = Bytes::from_static(&[
            0x05, 0x00, 0x00, 0x00, //
            0xfd, 0x00, // nak_type = -3
            0x07, 0x00, 0x00, 0x00, 0x01, b'x', // chunk 7 follows directly
        ]);
        let pkt = Packet::unmarshal(&raw)?;

        assert_eq!(-3, pkt.nak_type);
        assert!(pkt.naks.is_empty());
        assert_eq!(1, pkt.chunks.len());
        assert_eq!(7, pkt.chunks[0].chunk_number);
        Ok(())
    }

    #[test]
    fn test_packet_unmarshal_defective_tail_ignored() -> Result<()> {
        let raw = Bytes::from_static(&[
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
            0x01, 0x00, 0x00, 0x00, 0x02, b'o', b'k', // complete chunk
            0x02, 0x00, 0x00, 0x00, 0x0a, b'x', // declares 10 bytes, has 1
        ]);
        let pkt = Packet::unmarshal(&raw)?;

        assert_eq!(1, pkt.chunks.len(), "defective tail must be dropped");
        assert_eq!(1, pkt.chunks[0].chunk_number);
        Ok(())
    }

    #[test]
    fn test_packet_marshal_roundtrip() -> Result<()> {
        let mut pkt = Packet::new(41, 2);
        pkt.naks.push(1);
        pkt.naks.push(3);
        pkt.chunks.push(Arc::new(Chunk {
            chunk_number: 46,
            data: Bytes::from_static(b"payload"),
        }));
        pkt.chunks.push(Arc::new(Chunk {
            chunk_number: 47,
            data: Bytes::from_static(&[0u8; 254]),
        }));
        pkt.checksum = pkt.calc_checksum();

        let raw = pkt.marshal();
        assert_eq!(pkt.wire_size(), raw.len());

        let parsed = Packet::unmarshal(&raw)?;
        assert_eq!(pkt, parsed);
        assert_eq!(parsed.checksum, parsed.calc_checksum());
        Ok(())
    }

    #[test]
    fn test_checksum_covers_chunk_numbers() {
        let mut a = Packet::new(0, 0);
        a.chunks.push(Arc::new(Chunk {
            chunk_number: 1,
            data: Bytes::from_static(b"z"),
        }));
        let mut b = Packet::new(0, 0);
        b.chunks.push(Arc::new(Chunk {
            chunk_number: 2,
            data: Bytes::from_static(b"z"),
        }));
        assert_ne!(a.calc_checksum(), b.calc_checksum());
    }
}
