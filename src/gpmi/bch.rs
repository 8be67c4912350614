//! BCH ECC geometry derived from the NAND page layout

use super::regs::{BchLayout0, BchLayout1};
use crate::error::{NandError, Result};

/// Bytes of metadata the BCH engine stores (and protects) ahead of the first chunk
pub const METADATA_SIZE: usize = 10;

/// Size of each ECC chunk of the payload
pub const CHUNK_SIZE: usize = 512;

/// Bits per BCH parity symbol
pub const GF_LEN: usize = 13;

/// Highest correction strength the engine supports
pub const MAX_STRENGTH: usize = 20;

/// Page/OOB size pairs this controller knows how to lay out
pub const SUPPORTED_LAYOUTS: [(usize, usize); 7] = [
    (512, 16),
    (2048, 64),
    (4096, 128),
    (4096, 218),
    (4096, 224),
    (8192, 376),
    (8192, 436),
];

/// Status byte written for a chunk that read back fully erased
pub const STATUS_ERASED: u8 = 0xFF;
/// Status byte written for a chunk with more errors than the engine can correct
pub const STATUS_UNCORRECTABLE: u8 = 0xFE;

/// How a page is split into BCH chunks, and where the engine leaves its results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BchGeometry {
    pub page_size: usize,
    pub oob_size: usize,
    pub chunk_size: usize,
    pub chunk_count: usize,
    /// Correctable bit errors per chunk
    pub ecc_strength: usize,
    pub metadata_size: usize,
    /// Offset of the per-chunk status bytes in the auxiliary buffer
    pub status_offset: usize,
}

impl BchGeometry {
    pub fn new(page_size: usize, oob_size: usize) -> Result<Self> {
        if !SUPPORTED_LAYOUTS.contains(&(page_size, oob_size)) {
            log::error!("no BCH layout for {page_size}+{oob_size} byte pages");
            return Err(NandError::InvalidArgument);
        }

        let chunk_count = page_size / CHUNK_SIZE;
        let ecc_strength =
            ((oob_size - METADATA_SIZE) * 8 / (GF_LEN * chunk_count)).min(MAX_STRENGTH) & !1;
        if ecc_strength == 0 {
            return Err(NandError::InvalidArgument);
        }

        Ok(Self {
            page_size,
            oob_size,
            chunk_size: CHUNK_SIZE,
            chunk_count,
            ecc_strength,
            metadata_size: METADATA_SIZE,
            status_offset: (METADATA_SIZE + 3) & !3,
        })
    }

    /// Bytes of the OOB taken by parity for the whole page; parity bits are packed across chunks
    pub fn parity_size(&self) -> usize {
        (self.chunk_count * self.ecc_strength * GF_LEN + 7) / 8
    }

    /// Size of the auxiliary buffer: metadata, padding, then one status byte per chunk
    pub fn aux_size(&self) -> usize {
        self.status_offset + self.chunk_count
    }

    /// Bytes of the raw page (payload plus OOB) the engine reads or writes
    pub fn raw_page_size(&self) -> usize {
        self.page_size + self.oob_size
    }

    pub fn layout_regs(&self) -> (BchLayout0, BchLayout1) {
        let mut l0 = BchLayout0::default();
        l0.set_nblocks((self.chunk_count - 1) as u8);
        l0.set_meta_size(self.metadata_size as u8);
        l0.set_ecc0((self.ecc_strength / 2) as u8);
        l0.set_data0_size((self.chunk_size / 4) as u16);

        let mut l1 = BchLayout1::default();
        l1.set_page_size(self.raw_page_size() as u16);
        l1.set_eccn((self.ecc_strength / 2) as u8);
        l1.set_datan_size((self.chunk_size / 4) as u16);

        (l0, l1)
    }

    /// Rebuild a geometry from programmed layout registers, as the engine sees it
    pub fn from_regs(l0: BchLayout0, l1: BchLayout1) -> Self {
        let chunk_size = l0.data0_size() as usize * 4;
        let chunk_count = l0.nblocks() as usize + 1;
        let metadata_size = l0.meta_size() as usize;
        let page_size = chunk_size * chunk_count;
        Self {
            page_size,
            oob_size: l1.page_size() as usize - page_size,
            chunk_size,
            chunk_count,
            ecc_strength: l0.ecc0() as usize * 2,
            metadata_size,
            status_offset: (metadata_size + 3) & !3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(512, 16, 1, 2)]
    #[case(2048, 64, 4, 8)]
    #[case(4096, 128, 8, 8)]
    #[case(4096, 218, 8, 16)]
    #[case(4096, 224, 8, 16)]
    #[case(8192, 376, 16, 14)]
    #[case(8192, 436, 16, 16)]
    fn test_supported_geometry(
        #[case] page: usize,
        #[case] oob: usize,
        #[case] chunks: usize,
        #[case] strength: usize,
    ) {
        let geo = BchGeometry::new(page, oob).unwrap();
        assert_eq!(geo.chunk_count, chunks);
        assert_eq!(geo.ecc_strength, strength);
        assert!(geo.metadata_size + geo.parity_size() <= oob);
        assert_eq!(BchGeometry::from_regs(geo.layout_regs().0, geo.layout_regs().1), geo);
    }

    #[rstest]
    #[case(2048, 128)]
    #[case(1024, 32)]
    #[case(0, 0)]
    fn test_unsupported_geometry(#[case] page: usize, #[case] oob: usize) {
        assert_eq!(
            BchGeometry::new(page, oob),
            Err(NandError::InvalidArgument)
        );
    }

    #[test]
    fn test_aux_layout() {
        let geo = BchGeometry::new(2048, 64).unwrap();
        assert_eq!(geo.status_offset, 12);
        assert_eq!(geo.aux_size(), 16);
    }
}
