//! A NAND chip as the generic layer sees it: geometry, command sequencing, identification, and
//! the page-level building blocks the I/O paths are made of.

use bitflags::bitflags;
use log::{debug, error, info, trace, warn};

use super::ecc::{EccCtrl, EccLayout, EccMode, EccStats};
use super::ids::{self, NandDeviceInfo};
use super::{CtrlFlags, NandCommand, NandStatus, NandTransport};
use crate::error::{NandError, Result};
use crate::platform::Delay;
use crate::util::PageUtil;

use std::ops::Range;

/// Pages up to this size use small-page addressing
pub const SMALL_PAGE_SIZE: usize = 512;

/// STATUS poll limits, in milliseconds
const PROGRAM_TIMEOUT_MS: u64 = 20;
const ERASE_TIMEOUT_MS: u64 = 400;
const READY_TIMEOUT_MS: u64 = 400;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChipOptions: u32 {
        const BUSWIDTH_16 = 0x0002;
        /// No ready/busy wait is needed between pages of a read
        const NO_READRDY = 0x0100;
        /// Partial-page programs are not allowed
        const NO_SUBPAGE_WRITE = 0x0200;
        /// The bad block table is kept on flash
        const USE_FLASH_BBT = 0x10000;
    }
}

/// What the chip is currently doing. Only one operation can own the chip at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChipState {
    #[default]
    Ready,
    Reading,
    Writing,
    Erasing,
    Syncing,
    Suspended,
}

/// One or more identical NAND dies behind a transport
pub struct NandChip<T> {
    pub(crate) io: T,
    pub(crate) delay: Box<dyn Delay>,
    pub options: ChipOptions,

    pub page_shift: u32,
    /// Mask of the page number within one chip
    pub page_mask: u32,
    pub phys_erase_shift: u32,
    pub bbt_erase_shift: u32,
    pub chip_shift: u32,
    pub numchips: usize,
    pub chipsize: u64,
    pub writesize: usize,
    pub oobsize: usize,
    pub erasesize: u32,
    pub badblockpos: usize,

    pub ecc: EccCtrl,
    pub ecc_stats: EccStats,
    pub state: ChipState,
    /// Page currently held in the data scratch buffer
    pub pagebuf: Option<u32>,
    pub(crate) databuf: Vec<u8>,
    pub(crate) oob_poi: Vec<u8>,
    pub chip_delay_us: u32,

    pub device: Option<&'static NandDeviceInfo>,
    pub id: [u8; 4],
}

impl<T: NandTransport> NandChip<T> {
    pub fn new(io: T, delay: Box<dyn Delay>, ecc_mode: EccMode, options: ChipOptions) -> Self {
        Self {
            io,
            delay,
            options,
            page_shift: 0,
            page_mask: 0,
            phys_erase_shift: 0,
            bbt_erase_shift: 0,
            chip_shift: 0,
            numchips: 0,
            chipsize: 0,
            writesize: 0,
            oobsize: 0,
            erasesize: 0,
            badblockpos: 0,
            ecc: EccCtrl {
                mode: ecc_mode,
                ..Default::default()
            },
            ecc_stats: EccStats::default(),
            state: ChipState::Ready,
            pagebuf: None,
            databuf: Vec::new(),
            oob_poi: Vec::new(),
            chip_delay_us: 20,
            device: None,
            id: [0; 4],
        }
    }

    pub fn transport(&self) -> &T {
        &self.io
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.io
    }

    /// Total size of all chips
    pub fn size(&self) -> u64 {
        self.numchips as u64 * self.chipsize
    }

    pub fn oobavail(&self) -> usize {
        self.ecc.layout.oobavail()
    }

    pub fn pages_per_block(&self) -> u32 {
        1 << (self.phys_erase_shift - self.page_shift)
    }

    pub fn is_large_page(&self) -> bool {
        self.writesize > SMALL_PAGE_SIZE
    }

    /// OOB bytes holding the factory bad block marker
    pub fn marker_range(&self) -> Range<usize> {
        match self.is_large_page() {
            true => self.badblockpos..self.badblockpos + 2,
            false => self.badblockpos..self.badblockpos + 1,
        }
    }

    pub fn select_chip(&mut self, chip: Option<usize>) -> Result<()> {
        self.io.select_chip(chip)
    }

    /// Claim the chip for an operation
    pub fn get_device(&mut self, state: ChipState) -> Result<()> {
        if self.state != ChipState::Ready {
            debug!("chip busy ({:?}), cannot start {state:?}", self.state);
            return Err(NandError::Busy);
        }
        self.state = state;
        Ok(())
    }

    /// Deselect the chip and return it to the ready state
    pub fn release_device(&mut self) {
        if let Err(e) = self.io.select_chip(None) {
            warn!("failed to deselect chip: {e}");
        }
        self.state = ChipState::Ready;
    }

    fn ctrl(&mut self, byte: u8, ctrl: CtrlFlags) -> Result<()> {
        self.io.cmd_ctrl(Some(byte), ctrl)
    }

    fn end_command(&mut self) -> Result<()> {
        self.io.cmd_ctrl(None, CtrlFlags::NCE | CtrlFlags::CHANGE)
    }

    /// Send a command with its address cycles, using the addressing the chip's page size needs
    pub fn cmdfunc(
        &mut self,
        cmd: NandCommand,
        column: Option<usize>,
        page: Option<u32>,
    ) -> Result<()> {
        trace!("NAND command {cmd:?} column {column:?} page {page:?}");
        match self.is_large_page() {
            true => self.command_lp(cmd, column, page),
            false => self.command(cmd, column, page),
        }
    }

    /// Small-page command sequencing: 1 column cycle and 2 or 3 row cycles. The column register
    /// only spans 256 bytes, so programs first point the chip at the right half or the OOB.
    pub fn command(
        &mut self,
        cmd: NandCommand,
        column: Option<usize>,
        page: Option<u32>,
    ) -> Result<()> {
        let cle = CtrlFlags::CLE | CtrlFlags::NCE | CtrlFlags::CHANGE;
        let mut column = column;

        if cmd == NandCommand::SeqIn {
            let col = column.unwrap_or(0);
            let (col, readcmd) = if col >= self.writesize {
                (col - self.writesize, NandCommand::ReadOob)
            } else if col < 256 {
                (col, NandCommand::Read0)
            } else {
                (col - 256, NandCommand::Read1)
            };
            column = Some(col);
            self.ctrl(readcmd as u8, cle)?;
        }
        self.ctrl(cmd as u8, cle)?;

        let mut ale = CtrlFlags::ALE | CtrlFlags::NCE | CtrlFlags::CHANGE;
        if let Some(mut col) = column {
            if self.options.contains(ChipOptions::BUSWIDTH_16) {
                col >>= 1;
            }
            self.ctrl(col as u8, ale)?;
            ale.remove(CtrlFlags::CHANGE);
        }
        if let Some(page) = page {
            self.ctrl(page as u8, ale)?;
            ale.remove(CtrlFlags::CHANGE);
            self.ctrl((page >> 8) as u8, ale)?;
            if self.chipsize > 32 << 20 {
                self.ctrl((page >> 16) as u8, ale)?;
            }
        }
        self.end_command()?;

        match cmd {
            NandCommand::PageProg
            | NandCommand::Erase1
            | NandCommand::Erase2
            | NandCommand::SeqIn
            | NandCommand::Status => return Ok(()),
            NandCommand::Reset => return self.reset_wait(),
            _ => {}
        }

        self.wait_ready()
    }

    /// Large-page command sequencing: 2 column cycles and 2 or 3 row cycles, with the READSTART
    /// and RNDOUTSTART confirm cycles. READOOB is emulated with a column past the page data.
    pub fn command_lp(
        &mut self,
        cmd: NandCommand,
        column: Option<usize>,
        page: Option<u32>,
    ) -> Result<()> {
        let cle = CtrlFlags::CLE | CtrlFlags::NCE | CtrlFlags::CHANGE;
        let (cmd, column) = match cmd {
            NandCommand::ReadOob => (
                NandCommand::Read0,
                Some(column.unwrap_or(0) + self.writesize),
            ),
            _ => (cmd, column),
        };

        self.ctrl(cmd as u8, cle)?;

        let mut ale = CtrlFlags::ALE | CtrlFlags::NCE | CtrlFlags::CHANGE;
        if let Some(mut col) = column {
            if self.options.contains(ChipOptions::BUSWIDTH_16) {
                col >>= 1;
            }
            self.ctrl(col as u8, ale)?;
            ale.remove(CtrlFlags::CHANGE);
            // READID takes a single address cycle
            if cmd != NandCommand::ReadId {
                self.ctrl((col >> 8) as u8, ale)?;
            }
        }
        if let Some(page) = page {
            self.ctrl(page as u8, ale)?;
            ale.remove(CtrlFlags::CHANGE);
            self.ctrl((page >> 8) as u8, ale)?;
            if self.chipsize > 128 << 20 {
                self.ctrl((page >> 16) as u8, ale)?;
            }
        }
        self.end_command()?;

        match cmd {
            NandCommand::CachedProg
            | NandCommand::PageProg
            | NandCommand::Erase1
            | NandCommand::Erase2
            | NandCommand::SeqIn
            | NandCommand::RndIn
            | NandCommand::Status => return Ok(()),
            NandCommand::Reset => return self.reset_wait(),
            NandCommand::RndOut => {
                self.ctrl(NandCommand::RndOutStart as u8, cle)?;
                return self.end_command();
            }
            NandCommand::Read0 => {
                self.ctrl(NandCommand::ReadStart as u8, cle)?;
                self.end_command()?;
            }
            _ => {}
        }

        self.wait_ready()
    }

    /// After RESET: wait on the ready line, or poll STATUS where there is none
    fn reset_wait(&mut self) -> Result<()> {
        if self.io.dev_ready()?.is_some() {
            return self.wait_ready();
        }

        self.delay.udelay(self.chip_delay_us);
        self.ctrl(
            NandCommand::Status as u8,
            CtrlFlags::CLE | CtrlFlags::NCE | CtrlFlags::CHANGE,
        )?;
        self.end_command()?;

        let base = self.delay.timer_ms();
        loop {
            let status = NandStatus::from_bits_retain(self.io.read_byte()?);
            if status.contains(NandStatus::READY) {
                return Ok(());
            }
            if self.delay.get_timer(base) > READY_TIMEOUT_MS {
                error!("chip did not come out of reset");
                return Err(NandError::Timeout);
            }
        }
    }

    /// Wait for the ready/busy line, or give the chip its fixed delay if it has none
    pub fn wait_ready(&mut self) -> Result<()> {
        if self.io.dev_ready()?.is_none() {
            self.delay.udelay(self.chip_delay_us);
            return Ok(());
        }

        let base = self.delay.timer_ms();
        loop {
            if self.io.dev_ready()? == Some(true) {
                return Ok(());
            }
            if self.delay.get_timer(base) > READY_TIMEOUT_MS {
                error!("timed out waiting for chip ready");
                return Err(NandError::Timeout);
            }
        }
    }

    /// Poll STATUS until the chip is ready, bounded by the program (or erase) time
    pub fn wait_status(&mut self, state: ChipState) -> Result<NandStatus> {
        let timeout = match state {
            ChipState::Erasing => ERASE_TIMEOUT_MS,
            _ => PROGRAM_TIMEOUT_MS,
        };

        self.delay.udelay(1);
        self.cmdfunc(NandCommand::Status, None, None)?;

        let base = self.delay.timer_ms();
        loop {
            let status = NandStatus::from_bits_retain(self.io.read_byte()?);
            if status.contains(NandStatus::READY) {
                return Ok(status);
            }
            if self.delay.get_timer(base) > timeout {
                error!("{state:?} timed out, status {status:?}");
                return Err(NandError::Timeout);
            }
        }
    }

    /// Is the selected chip write protected?
    pub fn check_wp(&mut self) -> Result<bool> {
        self.cmdfunc(NandCommand::Status, None, None)?;
        let status = NandStatus::from_bits_retain(self.io.read_byte()?);
        Ok(!status.contains(NandStatus::WP))
    }

    fn read_id(&mut self, buf: &mut [u8]) -> Result<()> {
        self.cmdfunc(NandCommand::ReadId, Some(0), None)?;
        self.io.read_buf(buf)
    }

    /// Identify the chip on the first chip select, derive the geometry, and count how many
    /// identical chips follow it
    pub fn scan_ident(&mut self, maxchips: usize) -> Result<()> {
        self.select_chip(Some(0))?;
        self.cmdfunc(NandCommand::Reset, None, None)?;

        let mut first = [0u8; 2];
        self.read_id(&mut first)?;
        let mut id = [0u8; 4];
        self.read_id(&mut id)?;

        if first[..] != id[..2] {
            info!(
                "second ID read did not match {:02x},{:02x} against {:02x},{:02x}",
                first[0], first[1], id[0], id[1]
            );
            self.select_chip(None)?;
            return Err(NandError::NoDevice);
        }

        let [mfr_id, dev_id, _, ext_id] = id;
        let Some(device) = ids::lookup(mfr_id, dev_id) else {
            info!("no NAND device found (ID {mfr_id:#04x},{dev_id:#04x})");
            self.select_chip(None)?;
            return Err(NandError::NoDevice);
        };

        let geometry = device.geometry(ext_id);
        self.id = id;
        self.device = Some(device);
        self.chipsize = geometry.chipsize;
        self.writesize = geometry.writesize;
        self.oobsize = geometry.oobsize;
        self.erasesize = geometry.erasesize;
        self.options.set(ChipOptions::BUSWIDTH_16, geometry.bus16);

        self.page_shift = self.writesize.trailing_zeros();
        self.page_mask = ((self.chipsize >> self.page_shift) - 1) as u32;
        self.phys_erase_shift = self.erasesize.trailing_zeros();
        self.bbt_erase_shift = self.phys_erase_shift;
        self.chip_shift = self.chipsize.trailing_zeros();
        self.badblockpos = match self.is_large_page() {
            true => 0,
            false => 5,
        };

        info!(
            "NAND device: Manufacturer ID: {mfr_id:#04x}, Chip ID: {dev_id:#04x} ({} {})",
            ids::manufacturer_name(mfr_id),
            device.name
        );

        self.numchips = 1;
        for chip in 1..maxchips {
            if self.select_chip(Some(chip)).is_err() {
                break;
            }
            self.cmdfunc(NandCommand::Reset, None, None)?;
            let mut other = [0u8; 2];
            self.read_id(&mut other)?;
            if other != [mfr_id, dev_id] {
                break;
            }
            self.numchips += 1;
        }
        self.select_chip(None)?;

        if self.numchips > 1 {
            info!("{} NAND chips detected", self.numchips);
        }

        self.io.set_timing(&device.timing)?;
        Ok(())
    }

    /// Finish setup once the geometry is known: ECC layout, scratch buffers, transport geometry
    pub fn scan_tail(&mut self) -> Result<()> {
        self.databuf = vec![0xFF; self.writesize];
        self.oob_poi = vec![0xFF; self.oobsize];

        let marker = self.marker_range();
        match self.ecc.mode {
            EccMode::Hw => {
                let hw = self
                    .io
                    .set_geometry(self.writesize, self.oobsize)?
                    .ok_or(NandError::Unsupported)?;
                self.ecc.size = hw.step_size;
                self.ecc.steps = hw.steps;
                self.ecc.strength = hw.strength;
                self.ecc.total = hw.parity_bytes;
                self.ecc.bytes = hw.parity_bytes.div_ceil(hw.steps.max(1));
                self.ecc.metadata_size = hw.metadata_size;
                self.ecc.layout = EccLayout::hw(self.oobsize, hw.metadata_size, marker);
            }
            EccMode::Soft => {
                let Some(layout) = EccLayout::soft(self.oobsize) else {
                    error!("no software ECC layout for {} byte OOB", self.oobsize);
                    return Err(NandError::Unsupported);
                };
                self.ecc.size = super::ecc_soft::STEP_SIZE;
                self.ecc.bytes = super::ecc_soft::CODE_SIZE;
                self.ecc.steps = self.writesize / self.ecc.size;
                self.ecc.total = self.ecc.steps * self.ecc.bytes;
                self.ecc.strength = 1;
                if layout.eccpos.len() < self.ecc.total {
                    error!("ECC layout too small for {} steps", self.ecc.steps);
                    return Err(NandError::InvalidArgument);
                }
                self.ecc.layout = layout;
            }
            EccMode::None => {
                warn!("no ECC selected; this is not recommended");
                self.ecc.size = self.writesize;
                self.ecc.steps = 1;
                self.ecc.bytes = 0;
                self.ecc.total = 0;
                self.ecc.strength = 0;
                self.ecc.layout = EccLayout::soft(self.oobsize)
                    .unwrap_or_else(|| EccLayout::hw(self.oobsize, self.oobsize, marker));
            }
        }

        if self.ecc.steps * self.ecc.size != self.writesize {
            error!(
                "invalid ECC parameters: {} steps of {} bytes for a {} byte page",
                self.ecc.steps, self.ecc.size, self.writesize
            );
            return Err(NandError::InvalidArgument);
        }

        self.pagebuf = None;
        debug!(
            "ECC {:?}: {} x {} bytes, {} bytes OOB available",
            self.ecc.mode,
            self.ecc.steps,
            self.ecc.size,
            self.oobavail()
        );
        Ok(())
    }

    pub fn scan(&mut self, maxchips: usize) -> Result<()> {
        self.scan_ident(maxchips)?;
        self.scan_tail()
    }

    /// Read the addressed page with ECC, leaving its OOB in the OOB scratch buffer
    pub fn read_page(&mut self, buf: &mut [u8]) -> Result<()> {
        let strategy = self.ecc.mode.strategy();
        strategy.read_page(
            &mut self.io,
            &self.ecc,
            buf,
            &mut self.oob_poi,
            &mut self.ecc_stats,
        )
    }

    pub fn read_page_raw(&mut self, buf: &mut [u8]) -> Result<()> {
        let strategy = EccMode::None.strategy();
        strategy.read_page(
            &mut self.io,
            &self.ecc,
            buf,
            &mut self.oob_poi,
            &mut self.ecc_stats,
        )
    }

    /// Read the spare area of `page` into the OOB scratch buffer
    pub fn read_oob_std(&mut self, page: u32) -> Result<()> {
        self.cmdfunc(NandCommand::ReadOob, Some(0), Some(page))?;
        self.io.read_buf(&mut self.oob_poi)
    }

    /// Program `buf` and the OOB scratch buffer into `page`
    pub fn write_page(&mut self, page: u32, buf: &[u8], raw: bool) -> Result<()> {
        let strategy = match raw {
            true => EccMode::None.strategy(),
            false => self.ecc.mode.strategy(),
        };

        self.cmdfunc(NandCommand::SeqIn, Some(0), Some(page))?;
        strategy.write_page(&mut self.io, &self.ecc, buf, &mut self.oob_poi)?;
        self.cmdfunc(NandCommand::PageProg, None, None)?;

        let status = self.wait_status(ChipState::Writing)?;
        if status.contains(NandStatus::FAIL) {
            error!("program of page {page:#x} failed, status {status:?}");
            return Err(NandError::Io);
        }
        Ok(())
    }

    pub fn write_page_raw(&mut self, page: u32, buf: &[u8]) -> Result<()> {
        self.write_page(page, buf, true)
    }

    /// Program the OOB scratch buffer into the spare area of `page`
    pub fn write_oob_std(&mut self, page: u32) -> Result<()> {
        self.cmdfunc(NandCommand::SeqIn, Some(self.writesize), Some(page))?;
        self.io.write_buf(&self.oob_poi)?;
        self.cmdfunc(NandCommand::PageProg, None, None)?;

        let status = self.wait_status(ChipState::Writing)?;
        if status.contains(NandStatus::FAIL) {
            error!("OOB program of page {page:#x} failed, status {status:?}");
            return Err(NandError::Io);
        }
        Ok(())
    }

    /// Erase the block containing `page` on the selected chip
    pub(crate) fn single_erase(&mut self, page: u32) -> Result<NandStatus> {
        self.cmdfunc(NandCommand::Erase1, None, Some(page))?;
        self.cmdfunc(NandCommand::Erase2, None, None)?;
        self.wait_status(ChipState::Erasing)
    }

    /// Check the factory bad block marker of the block at `ofs`
    pub fn block_bad_marker(&mut self, ofs: u64) -> Result<bool> {
        let page = ((ofs >> self.page_shift) as u32) & self.page_mask;
        let chipnr = (ofs >> self.chip_shift) as usize;

        self.get_device(ChipState::Reading)?;
        let result = self
            .select_chip(Some(chipnr))
            .and_then(|_| self.read_oob_std(page));
        let bad = result.map(|_| !self.oob_poi[self.marker_range()].is_erased());
        self.release_device();

        let bad = bad?;
        if bad {
            debug!("factory bad block marker at {ofs:#x}");
        }
        Ok(bad)
    }

    /// Program the bad block marker of the block at `ofs`
    pub fn write_bad_marker(&mut self, ofs: u64) -> Result<()> {
        let ofs = ofs & !(u64::from(self.erasesize) - 1);
        let range = self.marker_range();
        let marker = vec![0u8; range.len()];
        let mut ops = super::MtdOobOps::new(super::OobMode::Place, None, Some(&marker[..]))
            .with_ooboffs(range.start);
        self.write_oob(ofs, &mut ops)
    }
}
