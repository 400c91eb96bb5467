/// CRC-16/CCITT-FALSE (polynomial 0x1021, initial value 0xFFFF, no reflection)
pub struct Crc16 {
    table: [u16; 256],
}

impl Crc16 {
    const POLYNOMIAL: u16 = 0x1021;
    const INIT: u16 = 0xFFFF;

    const fn build_table() -> [u16; 256] {
        let mut table = [0u16; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = (i as u16) << 8;
            let mut j = 0;
            while j < 8 {
                if crc & 0x8000 != 0 {
                    crc = (crc << 1) ^ Self::POLYNOMIAL;
                } else {
                    crc <<= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    }

    /// Computes the checksum for the given data
    pub fn checksum(&self, data: &[u8]) -> u16 {
        self.update(Self::INIT, data)
    }

    /// Updates a running CRC value with additional data
    pub fn update(&self, mut crc: u16, data: &[u8]) -> u16 {
        for &byte in data {
            let index = ((crc >> 8) ^ byte as u16) & 0xFF;
            crc = (crc << 8) ^ self.table[index as usize];
        }
        crc
    }
}

/// Lookup table computed at compile time
static CRC16: Crc16 = Crc16 {
    table: Crc16::build_table(),
};

/// Computes the CRC-16/CCITT-FALSE checksum using the global table
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_known_values() {
        assert_eq!(crc16(b""), 0xFFFF);
        assert_eq!(crc16(b"123456789"), 0x29B1);
        assert_eq!(crc16(b"A"), 0xB915);
    }

    #[test]
    fn test_crc16_incremental() {
        let data = b"e00fce68a1b2c3d4e5f60718";
        let mut crc = Crc16::INIT;
        crc = CRC16.update(crc, &data[..10]);
        crc = CRC16.update(crc, &data[10..]);
        assert_eq!(crc, crc16(data));
    }

    #[test]
    fn test_crc16_detects_single_bit_flip() {
        let data = [0x42u8; 24];
        let mut flipped = data;
        flipped[7] ^= 0x01;
        assert_ne!(crc16(&data), crc16(&flipped));
    }
}
