//! Useful traits and other utilities that don't really belong anywhere else.

use std::io::{self, Read};

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;

    /// How many bits differ between this page and `other`
    fn bit_errors(&self, other: &[u8]) -> usize;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }

    fn bit_errors(&self, other: &[u8]) -> usize {
        self.iter()
            .zip(other)
            .map(|(a, b)| (a ^ b).count_ones() as usize)
            .sum()
    }
}

pub trait ReadExt {
    /// Fill `buf` from the reader, like `read_exact`, but treat an early EOF as erased flash: the
    /// unread tail of `buf` is set to 0xFF.
    ///
    /// Returns how many bytes actually came from the reader.
    fn read_erased_tail(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl<T: Read> ReadExt for T {
    fn read_erased_tail(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut cursor = 0;
        while cursor < buf.len() {
            cursor += match self.read(&mut buf[cursor..]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(x) => return Err(x),
            };
        }

        buf[cursor..].fill(0xFF);
        Ok(cursor)
    }
}

#[test]
fn test_read_erased_tail() -> io::Result<()> {
    let mut buf = [0u8; 6];
    assert_eq!(io::repeat(0xAA).read_erased_tail(&mut buf)?, 6);
    assert_eq!(buf, [0xAA; 6]);

    assert_eq!((&[1, 2, 3][..]).read_erased_tail(&mut buf)?, 3);
    assert_eq!(buf, [1, 2, 3, 0xFF, 0xFF, 0xFF]);
    Ok(())
}

#[test]
fn test_page_util() {
    assert!([0xFFu8; 16][..].is_erased());
    assert!(![0xFF, 0xFE][..].is_erased());
    assert_eq!([0xFFu8, 0x00][..].bit_errors(&[0xFE, 0x03]), 3);
}
