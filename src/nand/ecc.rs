//! ECC modes, OOB layouts, and the strategies that move a page through them

use super::ecc_soft::{self, Correction};
use super::NandTransport;
use crate::error::{NandError, Result};

/// How page data is protected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum EccMode {
    /// No ECC at all
    None,
    /// Hamming code computed by the CPU
    Soft,
    /// The transport's own ECC engine
    #[default]
    Hw,
}

/// A run of OOB bytes not used by ECC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OobFree {
    pub offset: usize,
    pub length: usize,
}

impl OobFree {
    pub const fn new(offset: usize, length: usize) -> Self {
        Self { offset, length }
    }

    pub fn end(&self) -> usize {
        self.offset + self.length
    }
}

/// Where ECC bytes live in the OOB area, and which bytes are left for users
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EccLayout {
    pub eccpos: Vec<usize>,
    pub oobfree: Vec<OobFree>,
}

impl EccLayout {
    /// The standard software ECC layouts, by OOB size
    pub fn soft(oobsize: usize) -> Option<Self> {
        let (eccpos, oobfree) = match oobsize {
            8 => (vec![0, 1, 2], vec![OobFree::new(3, 2), OobFree::new(6, 2)]),
            16 => (vec![0, 1, 2, 3, 6, 7], vec![OobFree::new(8, 8)]),
            64 => ((40..64).collect(), vec![OobFree::new(2, 38)]),
            128 => ((80..128).collect(), vec![OobFree::new(2, 78)]),
            _ => return None,
        };
        Some(Self { eccpos, oobfree })
    }

    /// Layout of a hardware ECC engine that hands back `metadata_size` protected bytes from the
    /// start of the OOB. The bad block marker is kept out of the free regions.
    pub fn hw(oobsize: usize, metadata_size: usize, marker: std::ops::Range<usize>) -> Self {
        let mut oobfree = Vec::new();
        if marker.start > 0 {
            oobfree.push(OobFree::new(0, marker.start.min(metadata_size)));
        }
        if marker.end < metadata_size {
            oobfree.push(OobFree::new(marker.end, metadata_size - marker.end));
        }

        Self {
            eccpos: (metadata_size..oobsize).collect(),
            oobfree,
        }
    }

    /// OOB bytes per page available to users
    pub fn oobavail(&self) -> usize {
        self.oobfree.iter().map(|f| f.length).sum()
    }
}

/// ECC configuration of a chip, fixed at scan time
#[derive(Debug, Clone, Default)]
pub struct EccCtrl {
    pub mode: EccMode,
    /// ECC steps per page
    pub steps: usize,
    /// Data bytes per step
    pub size: usize,
    /// ECC bytes per step
    pub bytes: usize,
    /// ECC bytes per page
    pub total: usize,
    /// Correctable bits per step
    pub strength: usize,
    /// OOB bytes the hardware engine protects along with the data
    pub metadata_size: usize,
    pub layout: EccLayout,
}

/// Running totals kept by a chip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EccStats {
    /// Bit errors corrected
    pub corrected: u32,
    /// ECC steps that could not be corrected
    pub failed: u32,
    /// Blocks known to be bad
    pub badblocks: u32,
    /// Blocks reserved for the bad block table
    pub bbtblocks: u32,
}

/// Moves one page (data and OOB) between the transport and memory, applying ECC.
///
/// The page has already been addressed; `oob` is always `oobsize` bytes.
pub trait EccStrategy {
    fn read_page(
        &self,
        io: &mut dyn NandTransport,
        ecc: &EccCtrl,
        buf: &mut [u8],
        oob: &mut [u8],
        stats: &mut EccStats,
    ) -> Result<()>;

    fn write_page(
        &self,
        io: &mut dyn NandTransport,
        ecc: &EccCtrl,
        buf: &[u8],
        oob: &mut [u8],
    ) -> Result<()>;
}

/// Raw transfers
pub struct NoEcc;

pub struct SoftEcc;

/// Transfers through the transport's ECC engine
pub struct HwEcc;

impl EccMode {
    pub fn strategy(self) -> &'static dyn EccStrategy {
        match self {
            EccMode::None => &NoEcc,
            EccMode::Soft => &SoftEcc,
            EccMode::Hw => &HwEcc,
        }
    }
}

impl EccStrategy for NoEcc {
    fn read_page(
        &self,
        io: &mut dyn NandTransport,
        _ecc: &EccCtrl,
        buf: &mut [u8],
        oob: &mut [u8],
        _stats: &mut EccStats,
    ) -> Result<()> {
        io.read_buf(buf)?;
        io.read_buf(oob)
    }

    fn write_page(
        &self,
        io: &mut dyn NandTransport,
        _ecc: &EccCtrl,
        buf: &[u8],
        oob: &mut [u8],
    ) -> Result<()> {
        io.write_buf(buf)?;
        io.write_buf(oob)
    }
}

impl EccStrategy for SoftEcc {
    fn read_page(
        &self,
        io: &mut dyn NandTransport,
        ecc: &EccCtrl,
        buf: &mut [u8],
        oob: &mut [u8],
        stats: &mut EccStats,
    ) -> Result<()> {
        io.read_buf(buf)?;
        io.read_buf(oob)?;

        for (step, data) in buf.chunks_mut(ecc.size).enumerate() {
            let positions = ecc
                .layout
                .eccpos
                .get(step * ecc.bytes..(step + 1) * ecc.bytes)
                .ok_or(NandError::InvalidArgument)?;
            let mut stored = [0u8; ecc_soft::CODE_SIZE];
            for (dst, &pos) in stored.iter_mut().zip(positions) {
                *dst = oob[pos];
            }

            let calc = ecc_soft::calculate(data);
            match ecc_soft::correct(data, &stored, &calc) {
                Correction::Clean => {}
                Correction::Data { byte, bit } => {
                    log::debug!("corrected bit {bit} of byte {byte} in ECC step {step}");
                    stats.corrected += 1;
                }
                Correction::Code => stats.corrected += 1,
                Correction::Uncorrectable => stats.failed += 1,
            }
        }

        Ok(())
    }

    fn write_page(
        &self,
        io: &mut dyn NandTransport,
        ecc: &EccCtrl,
        buf: &[u8],
        oob: &mut [u8],
    ) -> Result<()> {
        for (step, data) in buf.chunks(ecc.size).enumerate() {
            let code = ecc_soft::calculate(data);
            let positions = ecc
                .layout
                .eccpos
                .get(step * ecc.bytes..(step + 1) * ecc.bytes)
                .ok_or(NandError::InvalidArgument)?;
            for (&pos, byte) in positions.iter().zip(code) {
                oob[pos] = byte;
            }
        }

        io.write_buf(buf)?;
        io.write_buf(oob)
    }
}

impl EccStrategy for HwEcc {
    fn read_page(
        &self,
        io: &mut dyn NandTransport,
        ecc: &EccCtrl,
        buf: &mut [u8],
        oob: &mut [u8],
        stats: &mut EccStats,
    ) -> Result<()> {
        let (meta, rest) = oob.split_at_mut(ecc.metadata_size);
        let counts = io.hw_read_page(buf, meta)?;
        rest.fill(0xFF);

        stats.corrected += counts.corrected;
        stats.failed += counts.failed;
        Ok(())
    }

    fn write_page(
        &self,
        io: &mut dyn NandTransport,
        ecc: &EccCtrl,
        buf: &[u8],
        oob: &mut [u8],
    ) -> Result<()> {
        io.hw_write_page(buf, &oob[..ecc.metadata_size])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(8, 3, 4)]
    #[case(16, 6, 8)]
    #[case(64, 24, 38)]
    #[case(128, 48, 78)]
    fn test_soft_layouts(#[case] oobsize: usize, #[case] eccbytes: usize, #[case] avail: usize) {
        let layout = EccLayout::soft(oobsize).unwrap();
        assert_eq!(layout.eccpos.len(), eccbytes);
        assert_eq!(layout.oobavail(), avail);
        for free in &layout.oobfree {
            assert!(free.end() <= oobsize);
            assert!(!layout.eccpos.iter().any(|p| (free.offset..free.end()).contains(p)));
        }
    }

    #[test]
    fn test_soft_layout_unknown_size() {
        assert!(EccLayout::soft(218).is_none());
    }

    #[test]
    fn test_hw_layout_skips_marker() {
        let large = EccLayout::hw(64, 10, 0..2);
        assert_eq!(large.oobfree, [OobFree::new(2, 8)]);
        assert_eq!(large.eccpos, (10..64).collect::<Vec<_>>());

        let small = EccLayout::hw(16, 10, 5..6);
        assert_eq!(small.oobfree, [OobFree::new(0, 5), OobFree::new(6, 4)]);
        assert_eq!(small.oobavail(), 9);
    }
}
