//! The bad block table: a 2-bit-per-block health map kept in memory and, optionally, persisted in
//! a pair of on-flash tables (main and mirror) so the device does not need a full factory marker
//! scan on every boot.
//!
//! In memory each block is one of [BlockCode]. On flash a table uses 1, 2, 4 or 8 bits per block
//! with erased bits meaning "good"; [encode_table] and [decode_table] convert between the two.

pub mod descr;

pub use descr::{BbtMarker, BbtOptions, NandBbtDesc};

use log::{debug, error, info, warn};

use crate::config::BoardConfig;
use crate::error::{NandError, ReadStatus, Result};
use crate::nand::{EraseInfo, MtdOobOps, NandChip, NandTransport, OobMode};

/// Health of one erase block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockCode {
    Good = 0b00,
    /// Marked bad at runtime
    Worn = 0b01,
    /// Holds (or may hold) a bad block table
    Reserved = 0b10,
    /// Marked bad at the factory
    Factory = 0b11,
}

impl BlockCode {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => BlockCode::Good,
            0b01 => BlockCode::Worn,
            0b10 => BlockCode::Reserved,
            _ => BlockCode::Factory,
        }
    }

    pub fn is_bad(self) -> bool {
        matches!(self, BlockCode::Worn | BlockCode::Factory)
    }
}

/// The in-memory map, four blocks per byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bbt {
    map: Vec<u8>,
    blocks: u32,
}

impl Bbt {
    pub fn new(blocks: u32) -> Self {
        Self {
            map: vec![0; (blocks as usize).div_ceil(4)],
            blocks,
        }
    }

    pub fn blocks(&self) -> u32 {
        self.blocks
    }

    pub fn get(&self, block: u32) -> BlockCode {
        let byte = self.map.get(block as usize >> 2).copied().unwrap_or(0);
        BlockCode::from_bits(byte >> ((block & 3) * 2))
    }

    pub fn set(&mut self, block: u32, code: BlockCode) {
        if let Some(byte) = self.map.get_mut(block as usize >> 2) {
            let shift = (block & 3) * 2;
            *byte = (*byte & !(0b11 << shift)) | ((code as u8) << shift);
        }
    }

    /// Reserved blocks count as bad unless the caller is the table code itself
    pub fn is_bad(&self, block: u32, allow_bbt: bool) -> bool {
        match self.get(block) {
            BlockCode::Good => false,
            BlockCode::Reserved => !allow_bbt,
            BlockCode::Worn | BlockCode::Factory => true,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = BlockCode> + '_ {
        (0..self.blocks).map(|block| self.get(block))
    }
}

/// Bytes an on-flash table for `blocks` blocks takes at `bits` per block
pub fn table_len(blocks: u32, bits: u32) -> usize {
    (blocks as usize * bits as usize).div_ceil(8)
}

/// Bits to clear in an erased on-flash entry to store each in-memory code
fn write_masks(bits: u32, reserved_block_code: u8) -> [u8; 4] {
    let field = ((1u16 << bits) - 1) as u8;
    let worn = match bits {
        1 | 2 => 0x01,
        4 => 0x0C,
        _ => 0x0F,
    };
    // Without a reserved code, reserved blocks are stored as good and re-reserved at scan time
    let reserved = match reserved_block_code {
        0 => 0x00,
        code => !code & field,
    };
    [0x00, worn, reserved, field]
}

/// Encode `bbt[first..first + count]` into `buf`, which must be erased (all 0xFF)
pub fn encode_table(
    bbt: &Bbt,
    first: u32,
    count: u32,
    bits: u32,
    reserved_block_code: u8,
    buf: &mut [u8],
) {
    let msk = write_masks(bits, reserved_block_code);
    for i in 0..count {
        let bit = i as usize * bits as usize;
        let code = bbt.get(first + i) as usize;
        buf[bit / 8] &= !(msk[code] << (bit % 8));
    }
}

/// Decode an on-flash table into the codes of the blocks it marks, as `(index, code)` pairs.
/// Entries reading back as good are skipped.
pub fn decode_table(
    buf: &[u8],
    count: u32,
    bits: u32,
    reserved_block_code: u8,
) -> Vec<(u32, BlockCode)> {
    let msk = ((1u16 << bits) - 1) as u8;
    let mut marked = Vec::new();
    for i in 0..count {
        let bit = i as usize * bits as usize;
        let Some(&byte) = buf.get(bit / 8) else {
            break;
        };
        let entry = (byte >> (bit % 8)) & msk;
        let code = if entry == msk {
            continue;
        } else if reserved_block_code != 0 && entry == reserved_block_code {
            BlockCode::Reserved
        } else if entry == 0 {
            BlockCode::Factory
        } else {
            BlockCode::Worn
        };
        marked.push((i, code));
    }
    marked
}

/// Which of the two on-flash tables an operation is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Main,
    Mirror,
}

/// Owner of the in-memory table and the descriptors of the on-flash ones
#[derive(Debug)]
pub struct BbtManager {
    pub bbt: Bbt,
    td: Option<NandBbtDesc>,
    md: Option<NandBbtDesc>,
    bd: NandBbtDesc,
}

impl BbtManager {
    /// Set up for a scanned chip. Without a flash table only the factory marker scan is used.
    pub fn new<T: NandTransport>(chip: &NandChip<T>, config: &BoardConfig) -> Result<Self> {
        let blocks = (chip.size() >> chip.bbt_erase_shift) as u32;
        let (td, md) = match config.use_flash_bbt {
            true => {
                let mut td = NandBbtDesc::main(config);
                let mut md = NandBbtDesc::mirror(config);
                for desc in [&mut td, &mut md] {
                    desc.fit_layout(&chip.ecc.layout)?;
                    let nrchips = match desc.options.contains(BbtOptions::PERCHIP) {
                        true => chip.numchips,
                        false => 1,
                    };
                    desc.reset(nrchips);
                }
                (Some(td), Some(md))
            }
            false => (None, None),
        };

        Ok(Self {
            bbt: Bbt::new(blocks),
            td,
            md,
            bd: NandBbtDesc::factory(chip.is_large_page()),
        })
    }

    pub fn main_table(&self) -> Option<&NandBbtDesc> {
        self.td.as_ref()
    }

    pub fn mirror_table(&self) -> Option<&NandBbtDesc> {
        self.md.as_ref()
    }

    fn desc(&self, table: Table) -> Option<&NandBbtDesc> {
        match table {
            Table::Main => self.td.as_ref(),
            Table::Mirror => self.md.as_ref(),
        }
    }

    /// Number of chips a descriptor keeps tables for, and blocks covered by each table
    fn span<T: NandTransport>(chip: &NandChip<T>, desc: &NandBbtDesc) -> (usize, u32) {
        match desc.options.contains(BbtOptions::PERCHIP) {
            true => (
                chip.numchips,
                (chip.chipsize >> chip.bbt_erase_shift) as u32,
            ),
            false => (1, (chip.size() >> chip.bbt_erase_shift) as u32),
        }
    }

    pub fn is_bad(&self, block: u32, allow_bbt: bool) -> bool {
        self.bbt.is_bad(block, allow_bbt)
    }

    /// Build the in-memory table, from flash if possible
    pub fn scan<T: NandTransport>(&mut self, chip: &mut NandChip<T>) -> Result<()> {
        if self.td.is_none() {
            return self.create_bbt(chip, None);
        }

        for table in [Table::Main, Table::Mirror] {
            let abspage = self
                .desc(table)
                .is_some_and(|d| d.options.contains(BbtOptions::ABSPAGE));
            match abspage {
                true => self.read_abs_versions(chip, table)?,
                false => self.search_bbt(chip, table)?,
            }
        }

        self.check_create(chip)?;
        self.mark_bbt_region(chip, Table::Main)?;
        if self.md.is_some() {
            self.mark_bbt_region(chip, Table::Mirror)?;
        }

        debug!(
            "bad block table: {} bad, {} reserved",
            chip.ecc_stats.badblocks, chip.ecc_stats.bbtblocks
        );
        Ok(())
    }

    fn read_first_oob<T: NandTransport>(
        chip: &mut NandChip<T>,
        ofs: u64,
        oob: &mut [u8],
    ) -> Result<()> {
        let mut ops = MtdOobOps::new(OobMode::Raw, None, Some(oob));
        chip.read_oob(ofs, &mut ops).map(|_| ())
    }

    /// Look for a table among the candidate blocks of each chip, recording its page and version
    fn search_bbt<T: NandTransport>(&mut self, chip: &mut NandChip<T>, table: Table) -> Result<()> {
        let desc = match table {
            Table::Main => self.td.as_mut(),
            Table::Mirror => self.md.as_mut(),
        };
        let Some(td) = desc else {
            return Ok(());
        };

        let (nrchips, blocks) = Self::span(chip, td);
        let block_page_shift = chip.bbt_erase_shift - chip.page_shift;
        let mut oob = vec![0xFF; chip.oobsize];

        for i in 0..nrchips {
            td.pages[i] = None;
            let first = blocks * i as u32;
            for j in 0..td.maxblocks.min(blocks) {
                let block = match td.options.contains(BbtOptions::LASTBLOCK) {
                    true => first + blocks - 1 - j,
                    false => first + j,
                };
                let ofs = u64::from(block) << chip.bbt_erase_shift;
                if let Err(e) = Self::read_first_oob(chip, ofs, &mut oob) {
                    warn!("cannot read block {block} while searching for the bad block table: {e}");
                    continue;
                }
                if td.check_pattern(&oob) {
                    td.pages[i] = Some(block << block_page_shift);
                    if td.options.contains(BbtOptions::VERSION) {
                        td.version[i] = td.read_version(&oob);
                    }
                    break;
                }
            }

            match td.pages[i] {
                Some(page) => info!(
                    "Bad block table found at page {page}, version {:#04x}",
                    td.version[i]
                ),
                None => info!("Bad block table not found for chip {i}"),
            }
        }
        Ok(())
    }

    /// Read the version bytes of tables at fixed pages
    fn read_abs_versions<T: NandTransport>(
        &mut self,
        chip: &mut NandChip<T>,
        table: Table,
    ) -> Result<()> {
        let desc = match table {
            Table::Main => self.td.as_mut(),
            Table::Mirror => self.md.as_mut(),
        };
        let Some(td) = desc else {
            return Ok(());
        };
        if !td.options.contains(BbtOptions::VERSION) {
            return Ok(());
        }

        let mut oob = vec![0xFF; chip.oobsize];
        for i in 0..td.pages.len() {
            if let Some(page) = td.pages[i] {
                Self::read_first_oob(chip, u64::from(page) << chip.page_shift, &mut oob)?;
                td.version[i] = td.read_version(&oob);
            }
        }
        Ok(())
    }

    /// Decode one on-flash table into the in-memory map.
    ///
    /// An uncorrectable ECC error is reported but the table is still used.
    fn read_bbt<T: NandTransport>(
        &mut self,
        chip: &mut NandChip<T>,
        page: u32,
        table: Table,
        first: u32,
        count: u32,
    ) -> Result<ReadStatus> {
        let Some(td) = self.desc(table) else {
            return Err(NandError::InvalidArgument);
        };
        let bits = td.options.nrbits();
        let rcode = td.reserved_block_code;

        let mut buf = vec![0xFF; table_len(count, bits)];
        let (_, status) = chip.read(u64::from(page) << chip.page_shift, &mut buf)?;
        if status == ReadStatus::Uncorrectable {
            warn!("ECC error while reading bad block table at page {page}");
        }

        for (i, code) in decode_table(&buf, count, bits, rcode) {
            let block = first + i;
            let old = self.bbt.get(block);
            match code {
                BlockCode::Reserved => {
                    if old != BlockCode::Reserved {
                        chip.ecc_stats.bbtblocks += 1;
                    }
                }
                _ => {
                    debug!(
                        "bad block {block} at {:#x} from table",
                        u64::from(block) << chip.bbt_erase_shift
                    );
                    if !old.is_bad() {
                        chip.ecc_stats.badblocks += 1;
                    }
                }
            }
            self.bbt.set(block, code);
        }
        Ok(status)
    }

    /// Read the table(s) a descriptor points at, for one chip or all of them, returning the worst
    /// ECC result seen
    fn read_abs_bbt<T: NandTransport>(
        &mut self,
        chip: &mut NandChip<T>,
        table: Table,
        chipsel: Option<usize>,
    ) -> Result<ReadStatus> {
        let Some(td) = self.desc(table) else {
            return Err(NandError::InvalidArgument);
        };
        let (nrchips, blocks) = Self::span(chip, td);
        let pages = td.pages.clone();

        let chips = match chipsel {
            Some(c) => c..c + 1,
            None => 0..nrchips,
        };
        let mut status = ReadStatus::Ok;
        for i in chips {
            if let Some(page) = pages.get(i).copied().flatten() {
                let read = self.read_bbt(chip, page, table, blocks * i as u32, blocks)?;
                status = status.merge(read);
            }
        }
        Ok(status)
    }

    /// Build the map by checking the factory marker of every block, on one chip or the whole
    /// device
    fn create_bbt<T: NandTransport>(
        &mut self,
        chip: &mut NandChip<T>,
        chipsel: Option<usize>,
    ) -> Result<()> {
        let per_chip = (chip.chipsize >> chip.bbt_erase_shift) as u32;
        let (first, count) = match chipsel {
            Some(c) => (per_chip * c as u32, per_chip),
            None => (0, self.bbt.blocks()),
        };
        let pages_to_check: u32 = if self.bd.options.contains(BbtOptions::SCANALLPAGES) {
            chip.pages_per_block()
        } else if self.bd.options.contains(BbtOptions::SCAN2NDPAGE) {
            2
        } else {
            1
        };

        info!("Scanning device for bad blocks");
        let rpt = howudoin::new()
            .label("Scanning for bad blocks")
            .set_len(u64::from(count));

        let mut oob = vec![0xFF; chip.oobsize];
        for block in first..first + count {
            let ofs = u64::from(block) << chip.bbt_erase_shift;
            for p in 0..pages_to_check {
                let page_ofs = ofs + (u64::from(p) << chip.page_shift);
                if let Err(e) = Self::read_first_oob(chip, page_ofs, &mut oob) {
                    rpt.close();
                    return Err(e);
                }
                if !self.bd.check_pattern(&oob) {
                    warn!("Bad eraseblock {block} at {ofs:#010x}");
                    if !self.bbt.get(block).is_bad() {
                        chip.ecc_stats.badblocks += 1;
                    }
                    self.bbt.set(block, BlockCode::Factory);
                    break;
                }
            }
            rpt.inc();
        }

        rpt.close();
        Ok(())
    }

    /// Reconcile what the search found with what should be on flash: create missing tables,
    /// load the newest one, and refresh any that are stale
    fn check_create<T: NandTransport>(&mut self, chip: &mut NandChip<T>) -> Result<()> {
        let Some(td) = self.td.as_ref() else {
            return Ok(());
        };
        let (nrchips, _) = Self::span(chip, td);
        let perchip = td.options.contains(BbtOptions::PERCHIP);

        for i in 0..nrchips {
            let chipsel = perchip.then_some(i);
            let mut writeops = 0u8;
            let mut rd = None;
            let mut rd2 = None;
            let mut create = false;

            let Self { td, md, .. } = self;
            let Some(td) = td.as_mut() else {
                return Ok(());
            };
            match md.as_mut() {
                Some(md) => match (td.pages[i], md.pages[i]) {
                    (None, None) => {
                        writeops = 0x03;
                        create = true;
                    }
                    (None, Some(_)) => {
                        rd = Some(Table::Mirror);
                        td.version[i] = md.version[i];
                        writeops = 0x01;
                    }
                    (Some(_), None) => {
                        rd = Some(Table::Main);
                        md.version[i] = td.version[i];
                        writeops = 0x02;
                    }
                    (Some(_), Some(_)) if td.version[i] == md.version[i] => {
                        rd = Some(Table::Main);
                        if !td.options.contains(BbtOptions::VERSION) {
                            rd2 = Some(Table::Mirror);
                        }
                    }
                    (Some(_), Some(_)) => {
                        if td.version[i].wrapping_sub(md.version[i]) as i8 > 0 {
                            rd = Some(Table::Main);
                            md.version[i] = td.version[i];
                            writeops = 0x02;
                        } else {
                            rd = Some(Table::Mirror);
                            td.version[i] = md.version[i];
                            writeops = 0x01;
                        }
                    }
                },
                None => match td.pages[i] {
                    None => {
                        writeops = 0x01;
                        create = true;
                    }
                    Some(_) => rd = Some(Table::Main),
                },
            }

            if create {
                if !td.options.contains(BbtOptions::CREATE) {
                    continue;
                }
                td.version[i] = 1;
                if let Some(md) = md.as_mut() {
                    md.version[i] = 1;
                }
                self.create_bbt(chip, chipsel)?;
            }

            let mut status = ReadStatus::Ok;
            for table in [rd, rd2].into_iter().flatten() {
                status = status.merge(self.read_abs_bbt(chip, table, chipsel)?);
            }
            if status != ReadStatus::Ok {
                debug!("bad block table for chip {i} read with status {status:?}");
            }

            let writes = |table: Table| {
                self.desc(table)
                    .is_some_and(|d| d.options.contains(BbtOptions::WRITE))
            };
            let (write_main, write_mirror) = (writes(Table::Main), writes(Table::Mirror));
            if writeops & 0x01 != 0 && write_main {
                self.write_bbt(chip, Table::Main, chipsel)?;
            }
            if writeops & 0x02 != 0 && write_mirror {
                self.write_bbt(chip, Table::Mirror, chipsel)?;
            }
        }
        Ok(())
    }

    /// Write a table (for one chip or all chips) from the in-memory map.
    ///
    /// The table goes to the block it already occupies, or else to the first candidate block
    /// that is neither bad nor holding the other table.
    fn write_bbt<T: NandTransport>(
        &mut self,
        chip: &mut NandChip<T>,
        table: Table,
        chipsel: Option<usize>,
    ) -> Result<()> {
        let Self { bbt, td, md, .. } = self;
        let (td, md) = match table {
            Table::Main => (td.as_mut(), md.as_ref()),
            Table::Mirror => (md.as_mut(), td.as_ref()),
        };
        let Some(td) = td else {
            return Err(NandError::InvalidArgument);
        };

        let (nrchips, numblocks) = Self::span(chip, td);
        let chips = match (td.options.contains(BbtOptions::PERCHIP), chipsel) {
            (true, Some(c)) => c..c + 1,
            (true, None) => 0..nrchips,
            (false, _) => 0..1,
        };
        let block_page_shift = chip.bbt_erase_shift - chip.page_shift;
        let bits = td.options.nrbits();

        for i in chips {
            let page = match td.pages[i] {
                Some(page) => page,
                None => {
                    let first = numblocks * i as u32;
                    let candidate = (0..td.maxblocks.min(numblocks))
                        .map(|j| match td.options.contains(BbtOptions::LASTBLOCK) {
                            true => first + numblocks - 1 - j,
                            false => first + j,
                        })
                        .filter(|&block| !bbt.get(block).is_bad())
                        .map(|block| block << block_page_shift)
                        .find(|&page| md.map_or(true, |md| md.pages[i] != Some(page)));
                    match candidate {
                        Some(page) => page,
                        None => {
                            error!("No space left to write bad block table");
                            return Err(NandError::NoSpace);
                        }
                    }
                }
            };

            let to = u64::from(page) << chip.page_shift;
            let block_len = 1usize << chip.bbt_erase_shift;
            let tlen = table_len(numblocks, bits);

            let (mut data, mut oob) = if td.options.contains(BbtOptions::SAVECONTENT) {
                let block_start = to & !(block_len as u64 - 1);
                let mut data = vec![0xFF; block_len];
                let (_, status) = chip.read(block_start, &mut data)?;
                if status == ReadStatus::Uncorrectable {
                    warn!("ECC error while saving the contents of block at {block_start:#x}");
                }
                let mut oob = vec![0xFF; (block_len >> chip.page_shift) * chip.oobsize];
                let mut ops = MtdOobOps::new(OobMode::Place, None, Some(&mut oob[..]));
                chip.read_oob(block_start, &mut ops)?;

                data[..tlen].fill(0xFF);
                oob[..chip.oobsize].fill(0xFF);
                (data, oob)
            } else {
                let len = tlen.next_multiple_of(chip.writesize);
                let oob = vec![0xFF; (len >> chip.page_shift) * chip.oobsize];
                (vec![0xFF; len], oob)
            };

            td.write_marker(&mut oob[..chip.oobsize], td.version[i])?;
            encode_table(
                bbt,
                numblocks * i as u32,
                numblocks,
                bits,
                td.reserved_block_code,
                &mut data,
            );

            let mut einfo = EraseInfo::new(to, block_len as u64);
            let erased = chip.erase_range(&mut einfo, true, |c, ofs, allow| {
                Ok(bbt.is_bad((ofs >> c.bbt_erase_shift) as u32, allow))
            });
            if let Err(e) = erased {
                error!("error while erasing block for the bad block table: {e}");
                return Err(e);
            }

            let mut ops = MtdOobOps::new(OobMode::Place, Some(&data[..]), Some(&oob[..]));
            if let Err(e) = chip.write_oob(to, &mut ops) {
                error!("error while writing bad block table: {e}");
                return Err(e);
            }

            info!(
                "Bad block table written to {to:#010x}, version {:#04x}",
                td.version[i]
            );
            td.pages[i] = Some(page);
        }
        Ok(())
    }

    /// Reserve every block a table may occupy so ordinary erase and write never touch them
    fn mark_bbt_region<T: NandTransport>(
        &mut self,
        chip: &mut NandChip<T>,
        table: Table,
    ) -> Result<()> {
        let Some(td) = self.desc(table) else {
            return Ok(());
        };
        let (nrchips, blocks) = Self::span(chip, td);
        let fixed = td.options.contains(BbtOptions::ABSPAGE) || !td.options.contains(BbtOptions::WRITE);
        let lastblock = td.options.contains(BbtOptions::LASTBLOCK);
        let maxblocks = td.maxblocks.min(blocks);
        let rcode = td.reserved_block_code;
        let pages = td.pages.clone();
        let block_page_shift = chip.bbt_erase_shift - chip.page_shift;

        for i in 0..nrchips {
            let candidates = if fixed {
                let Some(page) = pages.get(i).copied().flatten() else {
                    continue;
                };
                let block = page >> block_page_shift;
                block..block + 1
            } else {
                let first = match lastblock {
                    true => blocks * (i as u32 + 1) - maxblocks,
                    false => blocks * i as u32,
                };
                first..first + maxblocks
            };

            let mut update = None;
            for block in candidates {
                if self.bbt.get(block) == BlockCode::Good {
                    self.bbt.set(block, BlockCode::Reserved);
                    chip.ecc_stats.bbtblocks += 1;
                    update = Some(block);
                }
            }

            // Only a table with a reserved code records reservations on flash
            if let (Some(block), true) = (update, rcode != 0) {
                self.update(chip, u64::from(block) << chip.bbt_erase_shift)?;
            }
        }
        Ok(())
    }

    /// Rewrite the tables after the map changed for the block at `ofs`, bumping their versions
    pub fn update<T: NandTransport>(&mut self, chip: &mut NandChip<T>, ofs: u64) -> Result<()> {
        let Some(td) = self.td.as_mut() else {
            return Err(NandError::InvalidArgument);
        };

        let (i, chipsel) = match td.options.contains(BbtOptions::PERCHIP) {
            true => {
                let c = (ofs >> chip.chip_shift) as usize;
                (c, Some(c))
            }
            false => (0, None),
        };

        td.version[i] = td.version[i].wrapping_add(1);
        let write_main = td.options.contains(BbtOptions::WRITE);
        let write_mirror = match self.md.as_mut() {
            Some(md) => {
                md.version[i] = md.version[i].wrapping_add(1);
                md.options.contains(BbtOptions::WRITE)
            }
            None => false,
        };

        if write_main {
            self.write_bbt(chip, Table::Main, chipsel)?;
        }
        if write_mirror {
            self.write_bbt(chip, Table::Mirror, chipsel)?;
        }
        Ok(())
    }

    /// Record a runtime failure of `block` in the map
    pub fn mark_worn(&mut self, block: u32) {
        self.bbt.set(block, BlockCode::Worn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use rstest::rstest;

    #[test]
    fn test_packed_codes() {
        let mut bbt = Bbt::new(10);
        assert_eq!(bbt.iter().filter(|c| *c == BlockCode::Good).count(), 10);

        bbt.set(0, BlockCode::Factory);
        bbt.set(5, BlockCode::Worn);
        bbt.set(9, BlockCode::Reserved);
        assert_eq!(bbt.get(0), BlockCode::Factory);
        assert_eq!(bbt.get(1), BlockCode::Good);
        assert_eq!(bbt.get(5), BlockCode::Worn);
        assert_eq!(bbt.get(9), BlockCode::Reserved);

        bbt.set(5, BlockCode::Good);
        assert_eq!(bbt.get(5), BlockCode::Good);
        assert_eq!(bbt.get(4), BlockCode::Good);
    }

    #[test]
    fn test_reserved_blocks_need_allow_bbt() {
        let mut bbt = Bbt::new(4);
        bbt.set(3, BlockCode::Reserved);
        bbt.set(1, BlockCode::Worn);
        assert!(bbt.is_bad(3, false));
        assert!(!bbt.is_bad(3, true));
        assert!(bbt.is_bad(1, true));
        assert!(!bbt.is_bad(0, false));
    }

    #[test]
    fn test_two_bit_encoding() {
        let mut bbt = Bbt::new(4);
        bbt.set(1, BlockCode::Worn);
        bbt.set(2, BlockCode::Reserved);
        bbt.set(3, BlockCode::Factory);

        let mut buf = [0xFF];
        encode_table(&bbt, 0, 4, 2, 0, &mut buf);
        // good=11, worn=10, reserved stored as good=11, factory=00
        assert_eq!(buf[0], 0b00_11_10_11);

        let decoded = decode_table(&buf, 4, 2, 0);
        assert_eq!(decoded, [(1, BlockCode::Worn), (3, BlockCode::Factory)]);
    }

    #[rstest]
    #[case(2, 0x01)]
    #[case(4, 0x05)]
    #[case(8, 0x7F)]
    fn test_round_trip_with_reserved_code(#[case] bits: u32, #[case] rcode: u8) {
        let mut rng = SmallRng::seed_from_u64(bits.into());
        let blocks = 100;
        let mut bbt = Bbt::new(blocks);
        for block in 0..blocks {
            let code = match rng.gen_range(0..8) {
                0 => BlockCode::Worn,
                1 => BlockCode::Factory,
                2 => BlockCode::Reserved,
                _ => BlockCode::Good,
            };
            bbt.set(block, code);
        }

        let mut buf = vec![0xFF; table_len(blocks, bits)];
        encode_table(&bbt, 0, blocks, bits, rcode, &mut buf);

        let mut read_back = Bbt::new(blocks);
        for (block, code) in decode_table(&buf, blocks, bits, rcode) {
            read_back.set(block, code);
        }
        assert_eq!(read_back, bbt);
    }

    #[test]
    fn test_one_bit_table_loses_wear_distinction() {
        let mut bbt = Bbt::new(8);
        bbt.set(2, BlockCode::Worn);
        bbt.set(6, BlockCode::Factory);
        let mut buf = [0xFF];
        encode_table(&bbt, 0, 8, 1, 0, &mut buf);
        assert_eq!(buf[0], !0b0100_0100);
        assert_eq!(
            decode_table(&buf, 8, 1, 0),
            [(2, BlockCode::Factory), (6, BlockCode::Factory)]
        );
    }

    #[test]
    fn test_table_len() {
        assert_eq!(table_len(1024, 2), 256);
        assert_eq!(table_len(10, 2), 3);
        assert_eq!(table_len(10, 8), 10);
        assert_eq!(table_len(9, 1), 2);
    }
}
