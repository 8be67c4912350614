//! The GPMI NAND controller front end.
//!
//! Every bus cycle goes through the APBH DMA engine: command and address bytes are collected in a
//! small queue and sent as one descriptor, data moves through a bounce buffer in DMA memory, and
//! page transfers with ECC hand the payload and auxiliary buffers to the BCH engine.

pub mod bch;
pub mod regs;
pub mod timing;

use log::{debug, error, trace};

use crate::config::BoardConfig;
use crate::dma::{ApbhHardware, DescFlags, DescId, DmaCommand, DmaEngine, DmaMemory, DmaSlice};
use crate::error::{NandError, Result};
use crate::nand::{CtrlFlags, EccCounts, HwEccInfo, NandTransport};
use crate::platform::{reset_block, BlockControl, Clock, HwBlock, PollBudget};

use bch::{BchGeometry, STATUS_ERASED, STATUS_UNCORRECTABLE};
use regs::{
    AddressSpace, BchLayout0, BchLayout1, CommandMode, Ctrl0, Ctrl1, EccCtrlReg, EccCommand,
    Timing0, Timing1,
};
use timing::{compute_hw_timing, HwTiming, NandTiming};

/// Descriptors the front end allocates for itself
pub const GPMI_DESCRIPTORS: usize = 8;

/// Longest run of command and address bytes one NAND command needs
pub const COMMAND_BUFFER_SIZE: usize = 10;

/// Largest raw page (payload and OOB) the controller handles
const MAX_RAW_PAGE: usize = 8192 + 512;
const MAX_PAYLOAD: usize = 8192;
const MAX_AUX: usize = 128;

/// The GPMI and BCH register surface
pub trait GpmiHardware: BlockControl {
    fn write_ctrl1(&mut self, ctrl1: Ctrl1);
    fn write_timing0(&mut self, timing0: Timing0);
    fn write_timing1(&mut self, timing1: Timing1);
    fn write_bch_layout(&mut self, layout0: BchLayout0, layout1: BchLayout1);

    /// The BCH engine finished a page
    fn bch_complete(&self) -> bool;
    fn clear_bch_complete(&mut self);
    fn enable_bch_irq(&mut self, enable: bool);

    /// State of the ready/busy line of a chip select
    fn ready(&self, cs: usize) -> bool;
}

/// Command and address bytes waiting to be sent
#[derive(Debug)]
struct CommandQueue {
    buffer: DmaSlice,
    len: usize,
}

/// The controller and the DMA engine feeding it
pub struct Gpmi<H, G> {
    dma: DmaEngine<H>,
    hw: G,
    clock: Box<dyn Clock>,
    descs: Vec<DescId>,
    queue: CommandQueue,
    data_buffer: DmaSlice,
    payload: DmaSlice,
    aux: DmaSlice,
    cs: Option<usize>,
    chip_selects: usize,
    geometry: Option<BchGeometry>,
    hw_timing: HwTiming,
    ctrl1: Ctrl1,
    pub ecc: EccCounts,
    dma_budget: PollBudget,
    bch_budget: PollBudget,
    reset_budget: PollBudget,
}

impl<H: ApbhHardware, G: GpmiHardware> Gpmi<H, G> {
    /// Bring up the DMA engine, claim a channel per chip select, and reset the controller into
    /// NAND mode with safe timing
    pub fn new(dma_hw: H, hw: G, clock: Box<dyn Clock>, config: &BoardConfig) -> Result<Self> {
        let mem = DmaMemory::new(config.dma_pool_base, config.dma_pool_size);
        let mut dma = DmaEngine::new(dma_hw, mem, GPMI_DESCRIPTORS);
        for cs in 0..config.chip_selects {
            dma.register_device(cs)?;
        }
        dma.init(config.reset_budget)?;
        for cs in 0..config.chip_selects {
            dma.request(cs)?;
        }

        let descs = (0..GPMI_DESCRIPTORS)
            .map(|_| dma.alloc_desc())
            .collect::<Result<Vec<_>>>()?;
        let mem = dma.memory_mut();
        let queue = CommandQueue {
            buffer: mem.alloc(COMMAND_BUFFER_SIZE, 4)?,
            len: 0,
        };
        let data_buffer = mem.alloc(MAX_RAW_PAGE, 32)?;
        let payload = mem.alloc(MAX_PAYLOAD, 32)?;
        let aux = mem.alloc(MAX_AUX, 32)?;

        let mut gpmi = Self {
            dma,
            hw,
            clock,
            descs,
            queue,
            data_buffer,
            payload,
            aux,
            cs: None,
            chip_selects: config.chip_selects,
            geometry: None,
            hw_timing: HwTiming::default(),
            ctrl1: Ctrl1::default(),
            ecc: EccCounts::default(),
            dma_budget: config.dma_budget,
            bch_budget: config.bch_budget,
            reset_budget: config.reset_budget,
        };
        gpmi.init()?;
        Ok(gpmi)
    }

    fn init(&mut self) -> Result<()> {
        self.clock.enable();
        reset_block(&mut self.hw, HwBlock::Gpmi, self.reset_budget).inspect_err(|e| {
            error!("GPMI reset failed: {e}");
        })?;
        reset_block(&mut self.hw, HwBlock::Bch, self.reset_budget).inspect_err(|e| {
            error!("BCH reset failed: {e}");
        })?;

        // NAND mode, ready/busy active high, device reset deasserted, BCH (not legacy ECC8)
        let mut ctrl1 = Ctrl1::default();
        ctrl1.set_gpmi_mode(false);
        ctrl1.set_ata_irqrdy_polarity(true);
        ctrl1.set_dev_reset(true);
        ctrl1.set_bch_mode(true);
        self.ctrl1 = ctrl1;
        self.hw.write_ctrl1(ctrl1);
        self.hw.enable_bch_irq(true);

        self.timing(&NandTiming::SAFE)
    }

    pub fn hardware(&self) -> &G {
        &self.hw
    }

    pub fn dma(&self) -> &DmaEngine<H> {
        &self.dma
    }

    pub fn bch_geometry(&self) -> Option<&BchGeometry> {
        self.geometry.as_ref()
    }

    pub fn hw_timing(&self) -> &HwTiming {
        &self.hw_timing
    }

    /// Lay out pages of the given size for the BCH engine
    pub fn geometry(&mut self, writesize: usize, oobsize: usize) -> Result<BchGeometry> {
        let geo = BchGeometry::new(writesize, oobsize)?;
        if geo.aux_size() > self.aux.len() || geo.raw_page_size() > self.data_buffer.len() {
            return Err(NandError::NoMemory);
        }

        reset_block(&mut self.hw, HwBlock::Bch, self.reset_budget).inspect_err(|e| {
            error!("BCH reset failed: {e}");
        })?;
        let (l0, l1) = geo.layout_regs();
        self.hw.write_bch_layout(l0, l1);
        self.hw.enable_bch_irq(true);

        debug!(
            "BCH: {} chunks of {} bytes, strength {}, {} bytes parity",
            geo.chunk_count,
            geo.chunk_size,
            geo.ecc_strength,
            geo.parity_size()
        );
        self.geometry = Some(geo);
        Ok(geo)
    }

    /// Program the controller timing for a part
    pub fn timing(&mut self, timing: &NandTiming) -> Result<()> {
        let rate = self.clock.rate()?;
        let hw = compute_hw_timing(rate, timing)?;
        self.hw.write_timing0(hw.timing0());
        self.hw.write_timing1(hw.timing1());
        self.ctrl1 = hw.apply_ctrl1(self.ctrl1);
        self.hw.write_ctrl1(self.ctrl1);
        self.hw_timing = hw;
        Ok(())
    }

    fn selected(&self) -> Result<usize> {
        self.cs.ok_or(NandError::NoDevice)
    }

    /// Arm descriptor `n` of our pool
    fn arm(
        &mut self,
        n: usize,
        command: DmaCommand,
        pio: &[u32],
        buffer: Option<DmaSlice>,
    ) -> Result<DescId> {
        let id = self.descs[n];
        let desc = self.dma.desc_mut(id)?;
        desc.clear();
        desc.cmd.set_command(command);
        desc.set_pio(pio);
        desc.cmd.set_nand_lock(true);
        desc.cmd.set_wait4endcmd(true);
        desc.cmd.set_dec_sem(true);
        if let Some(buffer) = buffer {
            desc.set_buffer(buffer);
        }
        desc.flags = DescFlags::READY;
        Ok(id)
    }

    /// Run a chain on the channel of `cs`. The last descriptor raises the completion IRQ.
    fn run(&mut self, cs: usize, chain: &[DescId]) -> Result<()> {
        if let Some(&last) = chain.last() {
            self.dma.desc_mut(last)?.cmd.set_irq(true);
        }
        self.dma.append_list(cs, chain)?;
        self.dma.go(cs, self.dma_budget).inspect_err(|e| {
            error!("GPMI DMA on chip select {cs} failed: {e}");
        })
    }

    /// Send command and address bytes: the first byte is latched as a command, the rest as
    /// addresses
    pub fn send_command(&mut self, cs: usize, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() || bytes.len() > self.queue.buffer.len() {
            return Err(NandError::InvalidArgument);
        }
        trace!("GPMI cs{cs} command {bytes:02x?}");

        let buffer = self.queue.buffer.prefix(bytes.len())?;
        self.dma.memory_mut().slice_mut(buffer)?.copy_from_slice(bytes);

        let mut ctrl0 = Ctrl0::new(CommandMode::Write, cs, AddressSpace::Cle, bytes.len());
        ctrl0.set_lock_cs(true);
        ctrl0.set_address_increment(bytes.len() > 1);
        let id = self.arm(0, DmaCommand::Read, &[ctrl0.0], Some(buffer))?;
        self.run(cs, &[id])
    }

    /// Submit the queued command bytes, if any
    fn flush_queue(&mut self) -> Result<()> {
        if self.queue.len == 0 {
            return Ok(());
        }
        let cs = self.selected()?;
        let len = std::mem::take(&mut self.queue.len);
        let bytes = self
            .dma
            .memory()
            .slice(self.queue.buffer.prefix(len)?)?
            .to_vec();
        self.send_command(cs, &bytes)
    }

    fn queue_byte(&mut self, byte: u8) -> Result<()> {
        if self.queue.len == self.queue.buffer.len() {
            self.flush_queue()?;
        }
        let slot = self.queue.buffer.addr + self.queue.len as u32;
        self.dma.memory_mut().bytes_mut(slot, 1)?[0] = byte;
        self.queue.len += 1;
        Ok(())
    }

    pub fn send_data(&mut self, cs: usize, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(self.data_buffer.len()) {
            let buffer = self.data_buffer.prefix(chunk.len())?;
            self.dma.memory_mut().slice_mut(buffer)?.copy_from_slice(chunk);

            let ctrl0 = Ctrl0::new(CommandMode::Write, cs, AddressSpace::Data, chunk.len());
            let id = self.arm(0, DmaCommand::Read, &[ctrl0.0], Some(buffer))?;
            self.run(cs, &[id])?;
        }
        Ok(())
    }

    pub fn read_data(&mut self, cs: usize, buf: &mut [u8]) -> Result<()> {
        for chunk in buf.chunks_mut(self.data_buffer.len()) {
            let buffer = self.data_buffer.prefix(chunk.len())?;

            let ctrl0 = Ctrl0::new(CommandMode::Read, cs, AddressSpace::Data, chunk.len());
            let id = self.arm(0, DmaCommand::Write, &[ctrl0.0], Some(buffer))?;
            self.run(cs, &[id])?;

            chunk.copy_from_slice(self.dma.memory().slice(buffer)?);
        }
        Ok(())
    }

    fn wait_ready_pio(cs: usize) -> u32 {
        Ctrl0::new(CommandMode::WaitForReady, cs, AddressSpace::Data, 0).0
    }

    /// Have the controller wait for the chip's ready/busy line
    pub fn wait_ready(&mut self, cs: usize) -> Result<()> {
        let id = self.arm(0, DmaCommand::NoTransfer, &[Self::wait_ready_pio(cs)], None)?;
        self.dma.desc_mut(id)?.cmd.set_nand_wait4ready(true);
        self.run(cs, &[id])
    }

    fn wait_bch(&mut self) -> Result<()> {
        let hw = &self.hw;
        let result = self.bch_budget.poll(|| hw.bch_complete());
        self.hw.clear_bch_complete();
        result.inspect_err(|_| error!("timed out waiting for the BCH engine"))
    }

    /// The PIO words of an ECC transaction: CTRL0, COMPARE, ECCCTRL, ECCCOUNT, payload, aux
    fn ecc_pio(&self, cs: usize, mode: CommandMode, cmd: EccCommand, geo: &BchGeometry) -> [u32; 6] {
        let ctrl0 = Ctrl0::new(mode, cs, AddressSpace::Data, geo.raw_page_size());
        let eccctrl = EccCtrlReg::page(cmd);
        [
            ctrl0.0,
            0,
            eccctrl.0,
            geo.raw_page_size() as u32,
            self.payload.addr,
            self.aux.addr,
        ]
    }

    /// Read the page the chip has loaded through the BCH engine.
    ///
    /// `meta` receives the protected metadata. Per-chunk results are added to the running ECC
    /// counts and returned.
    pub fn read_page(&mut self, cs: usize, payload: &mut [u8], meta: &mut [u8]) -> Result<EccCounts> {
        let geo = self.geometry.ok_or(NandError::InvalidArgument)?;
        if payload.len() != geo.page_size || meta.len() > geo.metadata_size {
            return Err(NandError::InvalidArgument);
        }

        let pio = self.ecc_pio(cs, CommandMode::Read, EccCommand::Decode, &geo);
        let wait = self.arm(0, DmaCommand::NoTransfer, &[Self::wait_ready_pio(cs)], None)?;
        self.dma.desc_mut(wait)?.cmd.set_nand_wait4ready(true);
        let read = self.arm(1, DmaCommand::NoTransfer, &pio, None)?;
        // Release the engine once the page is in
        let done = self.arm(2, DmaCommand::NoTransfer, &[Self::wait_ready_pio(cs)], None)?;
        self.dma.desc_mut(done)?.cmd.set_nand_wait4ready(true);

        self.hw.clear_bch_complete();
        self.run(cs, &[wait, read, done])?;
        self.wait_bch()?;

        let mem = self.dma.memory();
        payload.copy_from_slice(mem.slice(self.payload.prefix(geo.page_size)?)?);
        let aux = mem.slice(self.aux.prefix(geo.aux_size())?)?;
        let n = meta.len();
        meta.copy_from_slice(&aux[..n]);

        let mut counts = EccCounts::default();
        for (chunk, &status) in aux[geo.status_offset..].iter().enumerate() {
            match status {
                STATUS_ERASED => {}
                STATUS_UNCORRECTABLE => {
                    debug!("uncorrectable ECC error in chunk {chunk}");
                    counts.failed += 1;
                }
                corrected => counts.corrected += u32::from(corrected),
            }
        }

        self.ecc.corrected += counts.corrected;
        self.ecc.failed += counts.failed;
        Ok(counts)
    }

    /// Send a page and its metadata through the BCH engine, which appends the parity
    pub fn send_page(&mut self, cs: usize, payload: &[u8], meta: &[u8]) -> Result<()> {
        let geo = self.geometry.ok_or(NandError::InvalidArgument)?;
        if payload.len() != geo.page_size || meta.len() > geo.metadata_size {
            return Err(NandError::InvalidArgument);
        }

        let mem = self.dma.memory_mut();
        mem.slice_mut(self.payload.prefix(geo.page_size)?)?.copy_from_slice(payload);
        let aux = mem.slice_mut(self.aux.prefix(geo.metadata_size)?)?;
        aux.fill(0xFF);
        aux[..meta.len()].copy_from_slice(meta);

        let pio = self.ecc_pio(cs, CommandMode::Write, EccCommand::Encode, &geo);
        let write = self.arm(0, DmaCommand::NoTransfer, &pio, None)?;

        self.hw.clear_bch_complete();
        self.run(cs, &[write])?;
        self.wait_bch()
    }
}

impl<H: ApbhHardware, G: GpmiHardware> NandTransport for Gpmi<H, G> {
    fn select_chip(&mut self, chip: Option<usize>) -> Result<()> {
        if self.cs.is_some() && chip != self.cs {
            self.flush_queue()?;
        }
        match chip {
            Some(cs) if cs >= self.chip_selects => Err(NandError::NoDevice),
            _ => {
                self.cs = chip;
                Ok(())
            }
        }
    }

    fn cmd_ctrl(&mut self, byte: Option<u8>, ctrl: CtrlFlags) -> Result<()> {
        let Some(byte) = byte else {
            return self.flush_queue();
        };

        // A new command starts a new transfer
        if ctrl.contains(CtrlFlags::CLE) {
            self.flush_queue()?;
        }
        if ctrl.intersects(CtrlFlags::CLE | CtrlFlags::ALE) {
            self.queue_byte(byte)?;
        }
        Ok(())
    }

    fn dev_ready(&mut self) -> Result<Option<bool>> {
        let cs = self.selected()?;
        Ok(Some(self.hw.ready(cs)))
    }

    fn read_buf(&mut self, buf: &mut [u8]) -> Result<()> {
        self.flush_queue()?;
        let cs = self.selected()?;
        self.read_data(cs, buf)
    }

    fn write_buf(&mut self, buf: &[u8]) -> Result<()> {
        self.flush_queue()?;
        let cs = self.selected()?;
        self.send_data(cs, buf)
    }

    fn set_geometry(&mut self, writesize: usize, oobsize: usize) -> Result<Option<HwEccInfo>> {
        let geo = self.geometry(writesize, oobsize)?;
        Ok(Some(HwEccInfo {
            step_size: geo.chunk_size,
            steps: geo.chunk_count,
            strength: geo.ecc_strength,
            metadata_size: geo.metadata_size,
            parity_bytes: geo.parity_size(),
        }))
    }

    fn set_timing(&mut self, timing: &NandTiming) -> Result<()> {
        self.timing(timing)
    }

    fn hw_read_page(&mut self, buf: &mut [u8], meta: &mut [u8]) -> Result<EccCounts> {
        self.flush_queue()?;
        let cs = self.selected()?;
        self.read_page(cs, buf, meta)
    }

    fn hw_write_page(&mut self, buf: &[u8], meta: &[u8]) -> Result<()> {
        self.flush_queue()?;
        let cs = self.selected()?;
        self.send_page(cs, buf, meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nand::{NandCommand, NandLayout};
    use crate::platform::FixedClock;
    use crate::sim::{SimFlash, SimSoc};

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 1024,
        pages_per_block: 64,
        bytes_per_page: 2048,
    };

    fn gpmi() -> (SimSoc, Gpmi<SimSoc, SimSoc>) {
        let soc = SimSoc::new(vec![SimFlash::from_layout(TEST_LAYOUT, 64).unwrap()]);
        let gpmi = Gpmi::new(
            soc.clone(),
            soc.clone(),
            Box::new(FixedClock::new(100_000_000)),
            &BoardConfig::default(),
        )
        .unwrap();
        (soc, gpmi)
    }

    fn send(gpmi: &mut Gpmi<SimSoc, SimSoc>, cmd: NandCommand, addr: &[u8]) -> Result<()> {
        gpmi.cmd_ctrl(Some(cmd as u8), CtrlFlags::CLE | CtrlFlags::NCE)?;
        for &byte in addr {
            gpmi.cmd_ctrl(Some(byte), CtrlFlags::ALE | CtrlFlags::NCE)?;
        }
        gpmi.cmd_ctrl(None, CtrlFlags::NCE)
    }

    #[test]
    fn test_init_programs_controller() {
        let (soc, gpmi) = gpmi();
        let ctrl1 = soc.ctrl1();
        assert!(ctrl1.bch_mode());
        assert!(ctrl1.dev_reset());
        assert!(!ctrl1.gpmi_mode());
        assert!(soc.bch_irq_enabled());

        let (t0, _) = soc.timing();
        assert_eq!(t0, gpmi.hw_timing().timing0());
        assert!(t0.data_setup() > 0);
    }

    #[test]
    fn test_zero_clock_rate() {
        let soc = SimSoc::without_flash();
        let result = Gpmi::new(
            soc.clone(),
            soc,
            Box::new(FixedClock::new(0)),
            &BoardConfig::default(),
        );
        assert_eq!(result.err(), Some(NandError::InvalidArgument));
    }

    #[test]
    fn test_command_queue_flushed_on_data() -> anyhow::Result<()> {
        let (_soc, mut gpmi) = gpmi();
        gpmi.select_chip(Some(0))?;
        gpmi.cmd_ctrl(Some(NandCommand::ReadId as u8), CtrlFlags::CLE | CtrlFlags::NCE)?;
        gpmi.cmd_ctrl(Some(0x00), CtrlFlags::ALE | CtrlFlags::NCE)?;
        assert_eq!(gpmi.queue.len, 2);

        let mut id = [0; 4];
        gpmi.read_buf(&mut id)?;
        assert_eq!(gpmi.queue.len, 0);
        assert_eq!(id, [0x98, 0xF1, 0x00, 0x15]);
        Ok(())
    }

    #[test]
    fn test_select_chip_range() {
        let (_soc, mut gpmi) = gpmi();
        assert_eq!(gpmi.select_chip(Some(1)), Err(NandError::NoDevice));
        assert!(gpmi.select_chip(Some(0)).is_ok());
        assert!(gpmi.select_chip(None).is_ok());
    }

    #[test]
    fn test_unsupported_geometry() {
        let (_soc, mut gpmi) = gpmi();
        assert_eq!(gpmi.geometry(2048, 128).err(), Some(NandError::InvalidArgument));
        assert!(gpmi.bch_geometry().is_none());
    }

    #[test]
    fn test_ecc_page_round_trip() -> anyhow::Result<()> {
        let (soc, mut gpmi) = gpmi();
        let info = gpmi.set_geometry(2048, 64)?.unwrap();
        assert_eq!((info.steps, info.strength, info.metadata_size), (4, 8, 10));
        assert_eq!(BchGeometry::from_regs(soc.bch_layout().0, soc.bch_layout().1).page_size, 2048);

        let payload: Vec<u8> = (0..2048).map(|i| (i * 7) as u8).collect();
        let meta = *b"metadata!!";

        gpmi.select_chip(Some(0))?;
        send(&mut gpmi, NandCommand::SeqIn, &[0, 0, 0x80, 0])?;
        gpmi.hw_write_page(&payload, &meta)?;
        send(&mut gpmi, NandCommand::PageProg, &[])?;

        // Two flipped bits in the last chunk are corrected
        soc.flash(0).unwrap().flip_bit(0x80, 1600 * 8);
        soc.flash(0).unwrap().flip_bit(0x80, 1700 * 8 + 3);

        send(&mut gpmi, NandCommand::Read0, &[0, 0, 0x80, 0])?;
        send(&mut gpmi, NandCommand::ReadStart, &[])?;
        let mut out = vec![0; 2048];
        let mut out_meta = [0; 10];
        let counts = gpmi.hw_read_page(&mut out, &mut out_meta)?;
        assert_eq!(counts, EccCounts { corrected: 2, failed: 0 });
        assert_eq!(out, payload);
        assert_eq!(out_meta, meta);
        assert_eq!(gpmi.ecc.corrected, 2);
        Ok(())
    }

    #[test]
    fn test_bch_timeout() -> anyhow::Result<()> {
        let (soc, mut gpmi) = gpmi();
        gpmi.geometry(2048, 64)?;
        gpmi.select_chip(Some(0))?;
        send(&mut gpmi, NandCommand::Read0, &[0, 0, 0, 0])?;
        send(&mut gpmi, NandCommand::ReadStart, &[])?;

        soc.set_bch_stuck(true);
        let mut out = vec![0; 2048];
        assert_eq!(
            gpmi.read_page(0, &mut out, &mut []),
            Err(NandError::Timeout)
        );
        Ok(())
    }

    #[test]
    fn test_dma_timeout() {
        let (soc, mut gpmi) = gpmi();
        soc.set_dma_stalled(true);
        assert_eq!(gpmi.send_command(0, &[0xFF]), Err(NandError::Timeout));
        assert_eq!(gpmi.dma().hardware().semaphore(0), 0);

        soc.set_dma_stalled(false);
        assert!(gpmi.send_command(0, &[0xFF]).is_ok());
        assert_eq!(gpmi.send_command(0, &[]), Err(NandError::InvalidArgument));
    }
}
