//! # Message and image checksums
//!
//! Every message carries a CRC-16 over its id and payload. The written image is
//! checked once at the end with a CRC-32 computed by both sides.

use crc::{CRC_16_IBM_3740, CRC_32_ISO_HDLC, Crc};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-16 over the little-endian message id followed by the payload
pub fn checksum16(id: u16, payload: &[u8]) -> u16 {
    let mut digest = CRC16.digest();
    digest.update(&id.to_le_bytes());
    digest.update(payload);
    digest.finalize()
}

/// CRC-32 over a whole buffer, as computed by the bootloader's verify command
pub fn checksum32(buffer: &[u8]) -> u32 {
    CRC32.checksum(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_values() {
        let id = u16::from_le_bytes(*b"12");
        assert_eq!(checksum16(id, b"3456789"), 0x29B1);
        assert_eq!(checksum32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn deterministic() {
        let payload: Vec<u8> = (0..=255).collect();
        assert_eq!(checksum16(0x0103, &payload), checksum16(0x0103, &payload));
        assert_eq!(checksum32(&payload), checksum32(&payload));
    }

    #[test]
    fn single_bit_flips_are_detected() {
        let vectors: [&[u8]; 3] = [b"123456789", &[0x00; 16], &[0xB0, 0x07, 0x10, 0xAD]];
        for vector in vectors {
            let crc16 = checksum16(0x0100, vector);
            let crc32 = checksum32(vector);
            for bit in 0..vector.len() * 8 {
                let mut flipped = vector.to_vec();
                flipped[bit / 8] ^= 1 << (bit % 8);
                assert_ne!(checksum16(0x0100, &flipped), crc16, "bit {bit}");
                assert_ne!(checksum32(&flipped), crc32, "bit {bit}");
            }
            for bit in 0..16 {
                assert_ne!(checksum16(0x0100 ^ (1 << bit), vector), crc16, "id bit {bit}");
            }
        }
    }
}
