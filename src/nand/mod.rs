//! The generic NAND layer: command sequencing, chip identification, ECC, and the MTD-style
//! interface the rest of the firmware uses to access flash.
//!
//! A [NandChip] drives any [NandTransport] (the GPMI front end on real hardware); [MtdDevice]
//! composes a chip with its bad block table and implements [Mtd].

use std::str::FromStr;

use bitflags::bitflags;

use crate::error::{NandError, ReadStatus, Result};
use crate::gpmi::timing::NandTiming;

pub mod chip;
pub mod ecc;
pub mod ecc_soft;
pub mod ids;
mod io;
pub mod mtd;

pub use chip::{ChipOptions, ChipState, NandChip};
pub use ecc::{EccCtrl, EccLayout, EccMode, EccStats, OobFree};
pub use mtd::MtdDevice;

/// NAND command opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NandCommand {
    Read0 = 0x00,
    Read1 = 0x01,
    RndOut = 0x05,
    PageProg = 0x10,
    CachedProg = 0x15,
    ReadStart = 0x30,
    ReadOob = 0x50,
    Erase1 = 0x60,
    Status = 0x70,
    SeqIn = 0x80,
    RndIn = 0x85,
    ReadId = 0x90,
    Erase2 = 0xD0,
    RndOutStart = 0xE0,
    Reset = 0xFF,
}

impl TryFrom<u8> for NandCommand {
    type Error = NandError;

    fn try_from(value: u8) -> Result<Self> {
        use NandCommand::*;
        Ok(match value {
            0x00 => Read0,
            0x01 => Read1,
            0x05 => RndOut,
            0x10 => PageProg,
            0x15 => CachedProg,
            0x30 => ReadStart,
            0x50 => ReadOob,
            0x60 => Erase1,
            0x70 => Status,
            0x80 => SeqIn,
            0x85 => RndIn,
            0x90 => ReadId,
            0xD0 => Erase2,
            0xE0 => RndOutStart,
            0xFF => Reset,
            _ => return Err(NandError::Unsupported),
        })
    }
}

bitflags! {
    /// Bits of the byte returned by the STATUS command
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NandStatus: u8 {
        const FAIL = 0x01;
        const READY = 0x40;
        /// Set when the part is *not* write protected
        const WP = 0x80;
    }
}

bitflags! {
    /// Control lines asserted alongside a [NandTransport::cmd_ctrl] byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CtrlFlags: u8 {
        /// Chip enable
        const NCE = 0x01;
        /// Command latch
        const CLE = 0x02;
        /// Address latch
        const ALE = 0x04;
        /// The line state differs from the previous call
        const CHANGE = 0x80;
    }
}

/// Result of one hardware ECC page read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EccCounts {
    /// Bit errors corrected across all chunks
    pub corrected: u32,
    /// Chunks that could not be corrected
    pub failed: u32,
}

/// How a transport with its own ECC engine lays out a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwEccInfo {
    pub step_size: usize,
    pub steps: usize,
    pub strength: usize,
    /// OOB bytes at the start of the spare area that the engine protects and hands back
    pub metadata_size: usize,
    /// Parity bytes the engine stores per page
    pub parity_bytes: usize,
}

/// The raw transport a [NandChip] issues bus cycles through.
///
/// Command and address bytes go through [NandTransport::cmd_ctrl]; a call without CLE or ALE ends
/// the current command sequence. The ECC page transfers are only available on transports with an
/// ECC engine.
pub trait NandTransport {
    fn select_chip(&mut self, chip: Option<usize>) -> Result<()>;

    fn cmd_ctrl(&mut self, byte: Option<u8>, ctrl: CtrlFlags) -> Result<()>;

    /// State of the ready/busy line, or `None` if the transport cannot see it
    fn dev_ready(&mut self) -> Result<Option<bool>>;

    fn read_buf(&mut self, buf: &mut [u8]) -> Result<()>;

    fn write_buf(&mut self, buf: &[u8]) -> Result<()>;

    fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0];
        self.read_buf(&mut byte)?;
        Ok(byte[0])
    }

    fn read_word(&mut self) -> Result<u16> {
        let mut word = [0; 2];
        self.read_buf(&mut word)?;
        Ok(u16::from_le_bytes(word))
    }

    /// Tell the transport the page geometry. Transports with an ECC engine return its layout.
    fn set_geometry(&mut self, _writesize: usize, _oobsize: usize) -> Result<Option<HwEccInfo>> {
        Ok(None)
    }

    fn set_timing(&mut self, _timing: &NandTiming) -> Result<()> {
        Ok(())
    }

    /// Read the page the chip has loaded through the ECC engine, returning the protected OOB
    /// metadata in `meta`
    fn hw_read_page(&mut self, _buf: &mut [u8], _meta: &mut [u8]) -> Result<EccCounts> {
        Err(NandError::Unsupported)
    }

    /// Send a page and its OOB metadata through the ECC engine
    fn hw_write_page(&mut self, _buf: &[u8], _meta: &[u8]) -> Result<()> {
        Err(NandError::Unsupported)
    }
}

/// How OOB bytes in an [MtdOobOps] are placed in the spare area
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OobMode {
    /// At absolute offsets, with ECC on the page data
    #[default]
    Place,
    /// Packed into the free regions of the ECC layout
    Auto,
    /// At absolute offsets, with no ECC at all
    Raw,
}

/// A combined data and OOB transfer
#[derive(Debug, Default)]
pub struct MtdOobOps<B> {
    pub mode: OobMode,
    /// Offset of the OOB transfer within each page's spare area (or free bytes, for
    /// [OobMode::Auto])
    pub ooboffs: usize,
    pub datbuf: Option<B>,
    pub oobbuf: Option<B>,
    /// Data bytes transferred
    pub retlen: usize,
    /// OOB bytes transferred
    pub oobretlen: usize,
}

impl<B: AsRef<[u8]>> MtdOobOps<B> {
    pub fn new(mode: OobMode, datbuf: Option<B>, oobbuf: Option<B>) -> Self {
        Self {
            mode,
            ooboffs: 0,
            datbuf,
            oobbuf,
            retlen: 0,
            oobretlen: 0,
        }
    }

    pub fn with_ooboffs(mut self, ooboffs: usize) -> Self {
        self.ooboffs = ooboffs;
        self
    }

    /// Requested data length
    pub fn len(&self) -> usize {
        self.datbuf.as_ref().map_or(0, |b| b.as_ref().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Requested OOB length
    pub fn ooblen(&self) -> usize {
        self.oobbuf.as_ref().map_or(0, |b| b.as_ref().len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EraseState {
    #[default]
    Pending,
    Erasing,
    Done,
    Failed,
}

/// An erase request and its outcome
#[derive(Debug, Clone, Default)]
pub struct EraseInfo {
    pub addr: u64,
    pub len: u64,
    /// Address of the block that failed, if the failure was in the chip itself
    pub fail_addr: Option<u64>,
    pub state: EraseState,
}

impl EraseInfo {
    pub fn new(addr: u64, len: u64) -> Self {
        Self {
            addr,
            len,
            ..Default::default()
        }
    }
}

/// Geometry of an MTD device as seen by its users
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtdInfo {
    pub size: u64,
    pub erasesize: u32,
    pub writesize: usize,
    pub oobsize: usize,
    /// OOB bytes per page available to users in [OobMode::Auto]
    pub oobavail: usize,
    pub numchips: usize,
}

impl MtdInfo {
    pub fn blocks(&self) -> u32 {
        (self.size / u64::from(self.erasesize)) as u32
    }

    pub fn pages_per_block(&self) -> u32 {
        self.erasesize / self.writesize as u32
    }
}

/// A memory technology device: the interface filesystems and loaders program against
pub trait Mtd {
    fn info(&self) -> MtdInfo;

    /// Read data with ECC. ECC trouble is reported in the status, not as an error.
    fn read(&mut self, from: u64, buf: &mut [u8]) -> Result<(usize, ReadStatus)>;

    /// Write data with ECC, returning how many bytes were written
    fn write(&mut self, to: u64, buf: &[u8]) -> Result<usize>;

    fn erase(&mut self, instr: &mut EraseInfo) -> Result<()>;

    fn read_oob(&mut self, from: u64, ops: &mut MtdOobOps<&mut [u8]>) -> Result<ReadStatus>;

    fn write_oob(&mut self, to: u64, ops: &mut MtdOobOps<&[u8]>) -> Result<()>;

    fn block_isbad(&mut self, ofs: u64) -> Result<bool>;

    fn block_markbad(&mut self, ofs: u64) -> Result<()>;

    /// Wait for outstanding operations to finish
    fn sync(&mut self) -> Result<()>;
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
}

impl NandLayout {
    pub fn block_size(&self) -> u32 {
        self.pages_per_block * self.bytes_per_page as u32
    }

    pub fn total_size(&self) -> u64 {
        u64::from(self.blocks) * u64::from(self.block_size())
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#"))?;
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page = bytes_per_page.parse()?;

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
        })
    }
}

#[test]
fn test_layout_parse() -> anyhow::Result<()> {
    let layout: NandLayout = "1024x64x2048".parse()?;
    assert_eq!(
        layout,
        NandLayout {
            blocks: 1024,
            pages_per_block: 64,
            bytes_per_page: 2048,
        }
    );
    assert_eq!(layout.block_size(), 128 * 1024);
    assert_eq!(layout.total_size(), 128 << 20);
    assert!("1024x64".parse::<NandLayout>().is_err());
    assert!("ax64x2048".parse::<NandLayout>().is_err());
    Ok(())
}

#[test]
fn test_command_opcodes() {
    for op in [0x00, 0x30, 0x70, 0x80, 0x90, 0xD0, 0xFF] {
        let cmd = NandCommand::try_from(op).unwrap();
        assert_eq!(cmd as u8, op);
    }
    assert_eq!(NandCommand::try_from(0x42), Err(NandError::Unsupported));
}
