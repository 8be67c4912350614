//! Software Hamming ECC: 3 bytes of parity per 256 bytes of data, correcting any single-bit error
//! and detecting any double-bit error.
//!
//! Parity layout (all bits stored inverted, so an erased step has an all-ones code):
//!
//! | byte | bits                              |
//! | ---- | --------------------------------- |
//! | 0    | line parity LP7..LP0              |
//! | 1    | line parity LP15..LP8             |
//! | 2    | column parity CP5..CP0, then 1, 1 |
//!
//! LP(2k) covers the bytes whose index has bit k clear, LP(2k+1) those with bit k set; column
//! parities do the same over the bit positions of the XOR of all bytes.

/// Data bytes covered by one code
pub const STEP_SIZE: usize = 256;

/// Parity bytes per step
pub const CODE_SIZE: usize = 3;

/// Result of checking a step against its stored code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    Clean,
    /// A data bit was flipped and has been repaired
    Data { byte: usize, bit: u8 },
    /// A bit of the stored code itself was flipped; the data is good
    Code,
    Uncorrectable,
}

pub fn calculate(data: &[u8]) -> [u8; CODE_SIZE] {
    debug_assert_eq!(data.len(), STEP_SIZE);

    let mut line: u16 = 0;
    let mut column: u8 = 0;
    for (index, &byte) in data.iter().enumerate() {
        column ^= byte;
        if byte.count_ones() & 1 == 1 {
            for k in 0..8 {
                let odd = (index >> k) & 1;
                line ^= 1 << (2 * k + odd);
            }
        }
    }

    let mut cp: u8 = 0;
    for bit in 0..8 {
        if column & (1 << bit) != 0 {
            for j in 0..3 {
                let odd = (bit >> j) & 1;
                cp ^= 1 << (2 * j + odd);
            }
        }
    }

    [!(line as u8), !((line >> 8) as u8), !(cp << 2)]
}

/// Check `data` against the code read from flash and repair a single-bit error in place
pub fn correct(data: &mut [u8], read: &[u8], calc: &[u8; CODE_SIZE]) -> Correction {
    let line = u16::from(read[0] ^ calc[0]) | u16::from(read[1] ^ calc[1]) << 8;
    let cp = (read[2] ^ calc[2]) >> 2;

    if line == 0 && cp == 0 {
        return Correction::Clean;
    }

    // A single data error flips exactly one parity of every pair
    if (line ^ (line >> 1)) & 0x5555 == 0x5555 && (cp ^ (cp >> 1)) & 0x15 == 0x15 {
        let byte = (0..8)
            .filter(|k| line & (1 << (2 * k + 1)) != 0)
            .fold(0usize, |acc, k| acc | 1 << k);
        let bit = (0..3)
            .filter(|j| cp & (1 << (2 * j + 1)) != 0)
            .fold(0u8, |acc, j| acc | 1 << j);
        data[byte] ^= 1 << bit;
        return Correction::Data { byte, bit };
    }

    if line.count_ones() + cp.count_ones() == 1 {
        return Correction::Code;
    }

    Correction::Uncorrectable
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn random_step(seed: u64) -> Vec<u8> {
        let mut rng = SmallRng::seed_from_u64(seed);
        (0..STEP_SIZE).map(|_| rng.gen()).collect()
    }

    #[test]
    fn test_erased_code() {
        assert_eq!(calculate(&[0xFF; STEP_SIZE]), [0xFF; 3]);
    }

    #[test]
    fn test_clean() {
        let mut data = random_step(1);
        let code = calculate(&data);
        assert_eq!(correct(&mut data, &code, &code), Correction::Clean);
    }

    #[test]
    fn test_single_bit_errors() {
        let original = random_step(2);
        let code = calculate(&original);
        let mut rng = SmallRng::seed_from_u64(3);

        for _ in 0..64 {
            let byte = rng.gen_range(0..STEP_SIZE);
            let bit = rng.gen_range(0..8u8);

            let mut data = original.clone();
            data[byte] ^= 1 << bit;
            let calc = calculate(&data);
            assert_eq!(
                correct(&mut data, &code, &calc),
                Correction::Data { byte, bit }
            );
            assert_eq!(data, original);
        }
    }

    #[test]
    fn test_code_bit_error() {
        let mut data = random_step(4);
        let mut code = calculate(&data);
        let calc = code;
        code[1] ^= 0x10;
        assert_eq!(correct(&mut data, &code, &calc), Correction::Code);
    }

    #[test]
    fn test_double_bit_errors() {
        let original = random_step(5);
        let code = calculate(&original);

        for ((b1, i1), (b2, i2)) in [((3, 1), (100, 6)), ((7, 0), (7, 5)), ((0, 0), (255, 0))] {
            let mut data = original.clone();
            data[b1] ^= 1 << i1;
            data[b2] ^= 1 << i2;
            let calc = calculate(&data);
            assert_eq!(correct(&mut data, &code, &calc), Correction::Uncorrectable);
        }
    }
}
