use crate::error::{Error, Result};

/// Length rule: the message length lives in the byte after the id.
pub const LENGTH_IN_BYTE: i32 = -1;
/// Length rule: the message length lives in the little-endian u16 after the id.
pub const LENGTH_IN_WORD: i32 = -2;

/// Sizes application messages from their leading bytes.
///
/// Every message starts with a one-byte id; the registry maps each id to a
/// length rule: a positive rule is a fixed message length, [`LENGTH_IN_BYTE`]
/// and [`LENGTH_IN_WORD`] read the length out of the message itself, and zero
/// marks an unknown id. The table is seeded by the application before any
/// connection starts receiving and is immutable afterwards (share it behind
/// an `Arc`).
#[derive(Debug, Clone)]
pub struct ProtocolRegistry {
    rules: [i32; 256],
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        ProtocolRegistry::new()
    }
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        ProtocolRegistry { rules: [0; 256] }
    }

    /// Register the length rule for a message id.
    pub fn add_type(&mut self, id: u8, length_rule: i32) {
        self.rules[id as usize] = length_rule;
    }

    /// Determine the length of the message starting at `buf[0]`.
    ///
    /// Returns the message length when it can be derived, `0` when more bytes
    /// are needed to decide, `-1` when the declared length is structurally
    /// invalid and `-2` when the id is unknown. A rule value that cannot be
    /// interpreted at all is a seeding error and surfaces as `Err`.
    pub fn packet_length(&self, buf: &[u8]) -> Result<i32> {
        if buf.is_empty() {
            return Ok(0);
        }

        let id = buf[0];
        let rule = self.rules[id as usize];

        if rule > 0 {
            return Ok(rule);
        }

        match rule {
            0 => Ok(-2),
            LENGTH_IN_BYTE => {
                if buf.len() < 2 {
                    Ok(0)
                } else if buf[1] >= 2 {
                    Ok(buf[1] as i32)
                } else {
                    Ok(-1)
                }
            }
            LENGTH_IN_WORD => {
                if buf.len() < 3 {
                    Ok(0)
                } else {
                    let length = u16::from_le_bytes([buf[1], buf[2]]);
                    if length >= 3 {
                        Ok(length as i32)
                    } else {
                        Ok(-1)
                    }
                }
            }
            _ => Err(Error::ErrInvalidMessageLength { id }),
        }
    }

    pub fn is_valid_length(&self, pkt_length: i32, buf_length: usize) -> bool {
        pkt_length > 0 && buf_length >= pkt_length as usize
    }

    pub fn is_valid_packet(&self, buf: &[u8]) -> bool {
        matches!(self.packet_length(buf), Ok(length) if self.is_valid_length(length, buf.len()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn registry() -> ProtocolRegistry {
        let mut reg = ProtocolRegistry::new();
        reg.add_type(1, 10);
        reg.add_type(2, LENGTH_IN_BYTE);
        reg.add_type(3, LENGTH_IN_WORD);
        reg
    }

    #[test]
    fn test_fixed_length() -> Result<()> {
        let reg = registry();
        assert_eq!(10, reg.packet_length(&[1])?);
        assert_eq!(10, reg.packet_length(&[1, 0xff, 0xff])?);
        Ok(())
    }

    #[test]
    fn test_length_in_byte() -> Result<()> {
        let reg = registry();
        assert_eq!(0, reg.packet_length(&[2])?, "need the length byte");
        assert_eq!(5, reg.packet_length(&[2, 5])?);
        assert_eq!(-1, reg.packet_length(&[2, 1])?, "length below header size");
        Ok(())
    }

    #[test]
    fn test_length_in_word() -> Result<()> {
        let reg = registry();
        assert_eq!(0, reg.packet_length(&[3])?);
        assert_eq!(0, reg.packet_length(&[3, 4])?, "need both length bytes");
        assert_eq!(0x0104, reg.packet_length(&[3, 4, 1])?, "little-endian");
        assert_eq!(-1, reg.packet_length(&[3, 2, 0])?, "length below header size");
        Ok(())
    }

    #[test]
    fn test_unknown_id() -> Result<()> {
        let reg = registry();
        assert_eq!(-2, reg.packet_length(&[200, 1, 2, 3])?);
        Ok(())
    }

    #[test]
    fn test_impossible_rule_is_fatal() {
        let mut reg = registry();
        reg.add_type(9, -5);
        assert_eq!(
            Err(Error::ErrInvalidMessageLength { id: 9 }),
            reg.packet_length(&[9, 1, 2])
        );
    }

    #[test]
    fn test_length_monotone_in_buffer() -> Result<()> {
        // once the length is determined, feeding more bytes never changes it
        let reg = registry();
        let msg = [2u8, 4, 0xaa, 0xbb];
        let mut last = 0;
        for len in 1..=msg.len() {
            let derived = reg.packet_length(&msg[..len])?;
            assert!(derived >= last, "length regressed at {}", len);
            last = derived;
        }
        assert_eq!(4, last);
        Ok(())
    }

    #[test]
    fn test_is_valid_packet() {
        let reg = registry();
        assert!(reg.is_valid_packet(&[2, 3, 0]));
        assert!(!reg.is_valid_packet(&[2, 3]), "buffer shorter than message");
        assert!(!reg.is_valid_packet(&[200, 0, 0]), "unknown id");
        assert!(!reg.is_valid_packet(&[]));
    }
}
