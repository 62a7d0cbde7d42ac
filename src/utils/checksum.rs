//! 32-bit file checksum.
//!
//! MSB-first CRC with generator `0x04C11DB7`, zero initial value. After the
//! data bytes, the input length is folded in low byte first until no bits
//! remain, and the result is complemented. This is the POSIX `cksum`
//! value, not the zlib CRC-32.

/// Generator polynomial
pub const POLYNOMIAL: u32 = 0x04C1_1DB7;

/// Lookup table, built at compile time.
pub static TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ POLYNOMIAL
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

#[inline]
fn step(state: u32, byte: u8) -> u32 {
    (state << 8) ^ TABLE[((state >> 24) as u8 ^ byte) as usize]
}

/// Incremental form, for data that arrives in pieces.
#[derive(Debug, Clone, Default)]
pub struct Checksum {
    state: u32,
    length: u64,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.state = data.iter().fold(self.state, |s, &b| step(s, b));
        self.length += data.len() as u64;
    }

    /// Fold in the length and complement.
    pub fn finalize(self) -> u32 {
        let mut state = self.state;
        let mut remaining = self.length;
        while remaining != 0 {
            state = step(state, (remaining & 0xFF) as u8);
            remaining >>= 8;
        }
        !state
    }
}

/// Checksum of a complete buffer.
pub fn checksum(data: &[u8]) -> u32 {
    let mut sum = Checksum::new();
    sum.update(data);
    sum.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_edges() {
        assert_eq!(TABLE[0], 0);
        assert_eq!(TABLE[1], 0x04C1_1DB7);
        assert_eq!(TABLE[255], 0xB1F7_40B4);
    }

    #[test]
    fn known_values() {
        assert_eq!(checksum(b""), 0xFFFF_FFFF);
        assert_eq!(checksum(b"a"), 1_220_704_766);
        assert_eq!(checksum(b"hello"), 3_287_646_509);
        assert_eq!(checksum(b"123456789"), 930_766_865);
        assert_eq!(checksum(b"hello world\n"), 3_733_384_285);
    }

    #[test]
    fn length_fold_spans_multiple_bytes() {
        // 300 = 0x012C needs two length bytes
        assert_eq!(checksum(&[0u8; 300]), 351_385_237);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let data: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let mut sum = Checksum::new();
        for chunk in data.chunks(333) {
            sum.update(chunk);
        }
        assert_eq!(sum.finalize(), checksum(&data));
    }

    #[test]
    fn differs_from_zlib_crc32() {
        // zlib CRC-32 of "123456789" is 0xCBF43926
        assert_ne!(checksum(b"123456789"), 0xCBF4_3926);
    }
}
