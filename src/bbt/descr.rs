//! Descriptors of the patterns the bad block table code looks for in the spare area: the
//! on-flash table markers, and the factory bad block markers scanned when no table exists.

use bitflags::bitflags;
use deku::prelude::*;
use log::debug;

use crate::config::BoardConfig;
use crate::error::{self, NandError};
use crate::nand::EccLayout;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BbtOptions: u32 {
        const NRBITS_1 = 0x0001;
        const NRBITS_2 = 0x0002;
        const NRBITS_4 = 0x0004;
        const NRBITS_8 = 0x0008;
        const NRBITS_MSK = 0x000F;
        /// Search from the last block of the chip downwards
        const LASTBLOCK = 0x0010;
        /// The table is at a fixed page, no searching
        const ABSPAGE = 0x0020;
        /// One table per chip
        const PERCHIP = 0x0080;
        /// A version byte follows the pattern
        const VERSION = 0x0100;
        /// Build the table by scanning when none is found
        const CREATE = 0x0200;
        const SCANALLPAGES = 0x0400;
        /// Write the table back when it changes
        const WRITE = 0x1000;
        /// Preserve the rest of the table block when rewriting it
        const SAVECONTENT = 0x2000;
        /// Check the second page of each block too
        const SCAN2NDPAGE = 0x4000;
    }
}

impl BbtOptions {
    /// Bits per block in the on-flash table
    pub fn nrbits(self) -> u32 {
        (self & BbtOptions::NRBITS_MSK).bits()
    }
}

/// Marker of an on-flash table, as it appears in the first page's spare area
#[derive(Debug, Clone, Copy, PartialEq, Eq, DekuRead, DekuWrite)]
pub struct BbtMarker {
    pub pattern: [u8; 4],
    pub version: u8,
}

impl BbtMarker {
    pub const SIZE: usize = 5;

    pub fn parse(buf: &[u8]) -> Option<Self> {
        let (_, marker) = Self::from_bytes((buf, 0)).ok()?;
        Some(marker)
    }
}

/// A table (or marker scan) descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NandBbtDesc {
    pub options: BbtOptions,
    /// Page of the table, per chip (or one entry for the whole device), once found or written
    pub pages: Vec<Option<u32>>,
    /// OOB offset of the pattern
    pub offs: usize,
    /// OOB offset of the version byte
    pub veroffs: usize,
    pub version: Vec<u8>,
    /// Pattern length
    pub len: usize,
    /// Candidate blocks searched for the table
    pub maxblocks: u32,
    /// On-flash code for reserved blocks; 0 stores them as good
    pub reserved_block_code: u8,
    pub pattern: Vec<u8>,
}

pub const MAIN_PATTERN: [u8; 4] = *b"Bbt0";
pub const MIRROR_PATTERN: [u8; 4] = *b"1tbB";

const BBT_OOB_OFFSET: usize = 8;

impl NandBbtDesc {
    fn table(config: &BoardConfig, pattern: [u8; 4]) -> Self {
        let mut options = BbtOptions::CREATE | BbtOptions::WRITE;
        options |= match config.bbt_bits {
            1 => BbtOptions::NRBITS_1,
            4 => BbtOptions::NRBITS_4,
            8 => BbtOptions::NRBITS_8,
            _ => BbtOptions::NRBITS_2,
        };
        options.set(BbtOptions::LASTBLOCK, config.bbt_last_block);
        options.set(BbtOptions::PERCHIP, config.bbt_per_chip);
        options.set(BbtOptions::VERSION, config.bbt_versioned);
        options.set(BbtOptions::SAVECONTENT, config.bbt_save_content);

        Self {
            options,
            pages: Vec::new(),
            offs: BBT_OOB_OFFSET,
            veroffs: BBT_OOB_OFFSET + pattern.len(),
            version: Vec::new(),
            len: pattern.len(),
            maxblocks: config.bbt_max_blocks,
            reserved_block_code: 0,
            pattern: pattern.to_vec(),
        }
    }

    pub fn main(config: &BoardConfig) -> Self {
        Self::table(config, MAIN_PATTERN)
    }

    pub fn mirror(config: &BoardConfig) -> Self {
        Self::table(config, MIRROR_PATTERN)
    }

    /// The factory marker scan: blocks whose marker byte(s) are not 0xFF are bad
    pub fn factory(large_page: bool) -> Self {
        let (offs, len) = match large_page {
            true => (0, 2),
            false => (5, 1),
        };
        Self {
            options: BbtOptions::SCAN2NDPAGE,
            pages: Vec::new(),
            offs,
            veroffs: 0,
            version: Vec::new(),
            len,
            maxblocks: 0,
            reserved_block_code: 0,
            pattern: vec![0xFF; len],
        }
    }

    /// Size the per-chip page and version slots
    pub fn reset(&mut self, nrchips: usize) {
        self.pages = vec![None; nrchips];
        self.version = vec![0; nrchips];
    }

    /// Bytes the pattern and version occupy
    fn marker_len(&self) -> usize {
        match self.options.contains(BbtOptions::VERSION) {
            true => self.len + 1,
            false => self.len,
        }
    }

    fn fits(&self, layout: &EccLayout) -> bool {
        layout.oobfree.iter().any(|free| {
            let pattern_fits = self.offs >= free.offset && self.offs + self.len <= free.end();
            let version_fits = !self.options.contains(BbtOptions::VERSION)
                || (self.veroffs >= free.offset && self.veroffs < free.end());
            pattern_fits && version_fits
        })
    }

    /// Make sure the marker lands in OOB bytes the layout leaves to users, moving it to the first
    /// free region large enough if it does not
    pub fn fit_layout(&mut self, layout: &EccLayout) -> error::Result<()> {
        if self.fits(layout) {
            return Ok(());
        }

        let needed = self.marker_len();
        let Some(free) = layout.oobfree.iter().find(|f| f.length >= needed) else {
            debug!("no free OOB region holds a {needed} byte table marker");
            return Err(NandError::InvalidArgument);
        };

        self.offs = free.offset;
        self.veroffs = free.offset + self.len;
        debug!("table marker moved to OOB offset {}", self.offs);
        Ok(())
    }

    /// Does the spare area hold this descriptor's pattern?
    pub fn check_pattern(&self, oob: &[u8]) -> bool {
        oob.get(self.offs..self.offs + self.len) == Some(&self.pattern[..])
    }

    /// Version byte stored alongside the pattern
    pub fn read_version(&self, oob: &[u8]) -> u8 {
        if self.veroffs == self.offs + self.len && self.len == MAIN_PATTERN.len() {
            if let Some(marker) = oob.get(self.offs..).and_then(BbtMarker::parse) {
                return marker.version;
            }
        }
        oob.get(self.veroffs).copied().unwrap_or(0)
    }

    /// Place the pattern (and version, if versioned) into an erased spare area
    pub fn write_marker(&self, oob: &mut [u8], version: u8) -> error::Result<()> {
        let pattern: [u8; 4] = self
            .pattern
            .as_slice()
            .try_into()
            .map_err(|_| NandError::InvalidArgument)?;
        let bytes = BbtMarker { pattern, version }
            .to_bytes()
            .map_err(|_| NandError::InvalidArgument)?;

        let dst = oob
            .get_mut(self.offs..self.offs + self.len)
            .ok_or(NandError::InvalidArgument)?;
        dst.copy_from_slice(&bytes[..self.len]);
        if self.options.contains(BbtOptions::VERSION) {
            *oob.get_mut(self.veroffs).ok_or(NandError::InvalidArgument)? = version;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nand::OobFree;

    #[test]
    fn test_default_descriptors() {
        let config = BoardConfig::default();
        let td = NandBbtDesc::main(&config);
        assert_eq!(td.offs, 8);
        assert_eq!(td.veroffs, 12);
        assert_eq!(td.options.nrbits(), 2);
        assert!(td.options.contains(BbtOptions::LASTBLOCK | BbtOptions::VERSION));
        assert_eq!(NandBbtDesc::mirror(&config).pattern, b"1tbB");

        let factory = NandBbtDesc::factory(false);
        assert_eq!((factory.offs, factory.len), (5, 1));
        assert_eq!((NandBbtDesc::factory(true).offs, NandBbtDesc::factory(true).len), (0, 2));
    }

    #[test]
    fn test_fit_soft_layouts_unchanged() {
        let config = BoardConfig::default();
        for oobsize in [16, 64, 128] {
            let mut td = NandBbtDesc::main(&config);
            td.fit_layout(&EccLayout::soft(oobsize).unwrap()).unwrap();
            assert_eq!((td.offs, td.veroffs), (8, 12));
        }
    }

    #[test]
    fn test_fit_moves_marker_into_metadata() {
        let config = BoardConfig::default();

        let mut td = NandBbtDesc::main(&config);
        td.fit_layout(&EccLayout::hw(64, 10, 0..2)).unwrap();
        assert_eq!((td.offs, td.veroffs), (2, 6));

        let mut td = NandBbtDesc::main(&config);
        td.fit_layout(&EccLayout::hw(16, 10, 5..6)).unwrap();
        assert_eq!((td.offs, td.veroffs), (0, 4));

        let mut td = NandBbtDesc::main(&config);
        let tiny = EccLayout {
            eccpos: vec![],
            oobfree: vec![OobFree::new(0, 3), OobFree::new(4, 3)],
        };
        assert_eq!(td.fit_layout(&tiny), Err(NandError::InvalidArgument));
    }

    #[test]
    fn test_marker_bytes() {
        let td = NandBbtDesc::main(&BoardConfig::default());
        let mut oob = [0xFF; 64];
        td.write_marker(&mut oob, 7).unwrap();
        assert_eq!(&oob[8..13], b"Bbt0\x07");
        assert!(td.check_pattern(&oob));
        assert_eq!(td.read_version(&oob), 7);
        assert!(!NandBbtDesc::mirror(&BoardConfig::default()).check_pattern(&oob));

        let marker = BbtMarker::parse(&oob[8..]).unwrap();
        assert_eq!(marker.pattern, MAIN_PATTERN);
        assert_eq!(marker.to_bytes().unwrap().len(), BbtMarker::SIZE);
    }
}
