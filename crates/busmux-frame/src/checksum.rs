//! CRC-16/CCITT-FALSE (polynomial 0x1021, initial value 0xffff, unreflected).

/// Running CRC-16 state.
#[derive(Debug, Clone, Copy)]
pub struct Crc16(u16);

impl Default for Crc16 {
    fn default() -> Self {
        Self(Self::INIT_VALUE)
    }
}

impl Crc16 {
    pub const LENGTH: usize = 2;
    const INIT_VALUE: u16 = 0xffff;
    const POLYNOMIAL: u16 = 0x1021;

    pub fn add(&mut self, byte: u8) {
        self.0 ^= u16::from(byte) << 8;
        for _bit in 0..8 {
            if (self.0 & 0x8000) != 0 {
                self.0 = (self.0 << 1) ^ Self::POLYNOMIAL;
            } else {
                self.0 <<= 1;
            }
        }
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        bytes.iter().for_each(|&byte| self.add(byte));
    }

    pub fn get(&self) -> u16 {
        self.0
    }
}

/// CRC-16 of a complete buffer.
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc = Crc16::default();
    crc.add_bytes(bytes);
    crc.get()
}

/// Checksum of a frame whose checksum field is still missing.
///
/// `body` runs from the header through the last payload byte; the checksum
/// field itself takes part as two zero bytes.
pub fn frame_checksum(body: &[u8]) -> u16 {
    let mut crc = Crc16::default();
    crc.add_bytes(body);
    crc.add_bytes(&[0; Crc16::LENGTH]);
    crc.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_reference_vector() {
        assert_eq!(crc16(b"123456789"), 0x29b1);
        assert_eq!(crc16(b""), 0xffff);
    }

    #[test]
    fn incremental_matches_oneshot() {
        let mut crc = Crc16::default();
        crc.add_bytes(b"1234");
        crc.add_bytes(b"56789");
        assert_eq!(crc.get(), crc16(b"123456789"));
    }

    #[test]
    fn frame_checksum_includes_zeroed_field() {
        let body = [0x54, 0xab, 0x80, 0x01, 0x00];
        let mut with_zeroes = body.to_vec();
        with_zeroes.extend_from_slice(&[0, 0]);
        assert_eq!(frame_checksum(&body), crc16(&with_zeroes));
        assert_ne!(frame_checksum(&body), crc16(&body));
    }
}
