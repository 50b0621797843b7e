//! CRC16 used by the NLIP frame trailer.
//!
//! CRC-CCITT (XMODEM flavour): poly 0x1021, init 0x0000, MSB first, fed as
//! a straight polynomial division. With `pad` set, two implicit zero bytes
//! are shifted in after the data, which is what the sender needs to compute
//! a trailer and what the receiver needs to check one.

pub const CRC_POLY: u16 = 0x1021;
pub const CRC_INIT: u16 = 0x0000;

/// Compute the CRC16 of `buf`, optionally followed by two zero bytes.
///
/// `crc16(data, true)` is the trailer to append. Running
/// `crc16(data ++ trailer, true)` over a received frame yields 0 when intact.
pub fn crc16(buf: &[u8], pad: bool) -> u16 {
    let padding = if pad { 2 } else { 0 };
    let mut crc = CRC_INIT;

    for i in 0..buf.len() + padding {
        let byte = buf.get(i).copied().unwrap_or(0);
        for bit in 0..8 {
            let divide = crc & 0x8000 != 0;
            crc = (crc << 1) | u16::from((byte >> (7 - bit)) & 1);
            if divide {
                crc ^= CRC_POLY;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_buffer() {
        assert_eq!(crc16(&[], false), 0);
        assert_eq!(crc16(&[], true), 0);
    }

    #[test]
    fn test_known_vector() {
        // XMODEM check value for "123456789"
        assert_eq!(crc16(b"123456789", true), 0x31C3);
    }

    #[test]
    fn test_trailer_roundtrip() {
        let inputs: [&[u8]; 4] = [b"a", b"hello world", &[0xFF; 37], &[0x00, 0x80, 0x7F]];
        for data in inputs {
            let crc = crc16(data, true);
            let mut framed = data.to_vec();
            framed.extend_from_slice(&crc.to_be_bytes());

            assert_eq!(crc16(&framed, false), 0, "unpadded residual for {data:?}");
            assert_eq!(crc16(&framed, true), 0, "padded residual for {data:?}");
        }
    }

    #[test]
    fn test_corruption_detected() {
        let data = b"nmp frame";
        let crc = crc16(data, true);
        let mut framed = data.to_vec();
        framed.extend_from_slice(&crc.to_be_bytes());
        framed[3] ^= 0x01;
        assert_ne!(crc16(&framed, true), 0);
    }
}
