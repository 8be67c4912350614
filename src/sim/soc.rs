//! The SoC model: APBH channels that execute descriptor chains, the GPMI controller that turns PIO
//! words into NAND bus cycles, and the BCH engine.

use std::cell::{RefCell, RefMut};
use std::collections::HashMap;
use std::rc::Rc;

use log::{debug, trace, warn};

use super::bch::SimBch;
use super::bus::SimNandBus;
use super::flash::SimFlash;
use crate::dma::{
    ApbhHardware, DescId, DescLink, DmaBus, DmaCommand, DmaDescriptor, DmaMemory, APBH_CHANNELS,
};
use crate::gpmi::bch::BchGeometry;
use crate::gpmi::regs::{
    AddressSpace, BchLayout0, BchLayout1, CommandMode, Ctrl0, Ctrl1, EccCtrlReg, Timing0, Timing1,
};
use crate::gpmi::GpmiHardware;
use crate::platform::{BlockControl, HwBlock};

#[derive(Debug, Default, Clone, Copy)]
struct BlockRegs {
    soft_reset: bool,
    clock_gate: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct ChannelRegs {
    next: Option<DescId>,
    /// Last descriptor run, kept while the channel waits at the end of a chain
    parked: Option<DescId>,
    sem: u32,
    frozen: bool,
    irq_pending: bool,
    irq_enabled: bool,
    error: bool,
}

/// A descriptor the model could not carry out
#[derive(Debug)]
struct BusFault(&'static str);

#[derive(Debug, Default)]
struct State {
    blocks: HashMap<HwBlock, BlockRegs>,
    channels: [ChannelRegs; APBH_CHANNELS],

    dma_stalled: bool,
    dma_step_limit: Option<usize>,
    dma_error: bool,
    bch_stuck: bool,

    bch_complete: bool,
    bch_irq_enabled: bool,
    ctrl1: Ctrl1,
    timing0: Timing0,
    timing1: Timing1,
    layout: (BchLayout0, BchLayout1),

    /// The chip on each chip select
    buses: Vec<SimNandBus>,
}

/// A shared handle on the simulated SoC. Clones refer to the same hardware.
#[derive(Debug, Clone)]
pub struct SimSoc(Rc<RefCell<State>>);

impl SimSoc {
    /// A SoC with one flash chip per chip select
    pub fn new(flashes: Vec<SimFlash>) -> Self {
        let state = State {
            buses: flashes.into_iter().map(SimNandBus::new).collect(),
            ..Default::default()
        };
        Self(Rc::new(RefCell::new(state)))
    }

    /// A SoC with nothing on the NAND bus
    pub fn without_flash() -> Self {
        Self::new(Vec::new())
    }

    fn state(&self) -> RefMut<'_, State> {
        self.0.borrow_mut()
    }

    /// Channels accept descriptors but never run them
    pub fn set_dma_stalled(&self, stalled: bool) {
        self.state().dma_stalled = stalled;
    }

    /// Run at most this many descriptors per semaphore increment
    pub fn set_dma_step_limit(&self, limit: Option<usize>) {
        self.state().dma_step_limit = limit;
    }

    /// Terminate every chain with an error
    pub fn set_dma_error(&self, error: bool) {
        self.state().dma_error = error;
    }

    /// The BCH engine never signals completion
    pub fn set_bch_stuck(&self, stuck: bool) {
        self.state().bch_stuck = stuck;
    }

    pub fn dma_irq_enabled(&self, channel: usize) -> bool {
        self.0.borrow().channels[channel].irq_enabled
    }

    pub fn bch_irq_enabled(&self) -> bool {
        self.0.borrow().bch_irq_enabled
    }

    pub fn ctrl1(&self) -> Ctrl1 {
        self.0.borrow().ctrl1
    }

    pub fn timing(&self) -> (Timing0, Timing1) {
        let state = self.0.borrow();
        (state.timing0, state.timing1)
    }

    pub fn bch_layout(&self) -> (BchLayout0, BchLayout1) {
        self.0.borrow().layout
    }

    /// The flash on a chip select
    pub fn flash(&self, cs: usize) -> Option<RefMut<'_, SimFlash>> {
        RefMut::filter_map(self.state(), |s| s.buses.get_mut(cs).map(SimNandBus::flash_mut)).ok()
    }

    /// Pull the flash chips out of the SoC, leaving the bus empty
    pub fn take_flashes(&self) -> Vec<SimFlash> {
        std::mem::take(&mut self.state().buses)
            .into_iter()
            .map(SimNandBus::into_flash)
            .collect()
    }
}

impl State {
    fn block(&mut self, block: HwBlock) -> &mut BlockRegs {
        self.blocks.entry(block).or_default()
    }

    /// Run descriptors on a channel while it has semaphore credit
    fn run(&mut self, channel: usize, bus: DmaBus<'_>) {
        let DmaBus { descs, mem } = bus;
        let mut steps = 0;
        loop {
            let chan = &mut self.channels[channel];
            if chan.sem == 0 || chan.frozen || self.dma_stalled {
                return;
            }
            if self.dma_step_limit.is_some_and(|limit| steps >= limit) {
                return;
            }

            // A chain that ended may have been extended since
            if chan.next.is_none() {
                if let Some(parked) = chan.parked {
                    if let Ok(desc) = descs.get(parked) {
                        if let (true, DescLink::Next(next)) = (desc.cmd.chain(), desc.link) {
                            chan.next = Some(next);
                            chan.parked = None;
                        }
                    }
                }
            }
            let Some(id) = chan.next else {
                return;
            };

            let Ok(desc) = descs.get(id) else {
                warn!("DMA channel {channel}: fetch of a free descriptor");
                self.terminate(channel);
                return;
            };
            if self.dma_error {
                self.terminate(channel);
                return;
            }

            trace!("DMA channel {channel}: running {id:?}");
            if let Err(BusFault(why)) = self.execute(desc, mem) {
                warn!("DMA channel {channel}: {why}");
                self.terminate(channel);
                return;
            }
            steps += 1;

            let chan = &mut self.channels[channel];
            if desc.cmd.dec_sem() {
                chan.sem = chan.sem.saturating_sub(1);
            }
            if desc.cmd.irq() {
                chan.irq_pending = true;
            }
            match (desc.cmd.chain(), desc.link) {
                (true, DescLink::Next(next)) => chan.next = Some(next),
                _ => {
                    chan.next = None;
                    chan.parked = Some(id);
                }
            }
        }
    }

    fn terminate(&mut self, channel: usize) {
        let chan = &mut self.channels[channel];
        chan.error = true;
        chan.irq_pending = true;
        chan.sem = 0;
        chan.next = None;
    }

    /// Carry out one descriptor on the GPMI
    fn execute(
        &mut self,
        desc: &DmaDescriptor,
        mem: &mut DmaMemory,
    ) -> Result<(), BusFault> {
        let Some(&word) = desc.pio().first() else {
            return match desc.cmd.command() {
                DmaCommand::NoTransfer => Ok(()),
                _ => Err(BusFault("transfer without a GPMI command")),
            };
        };
        let ctrl0 = Ctrl0(word);
        let pio = desc.pio();
        let ecc = pio.get(2).map(|&w| EccCtrlReg(w)).filter(|r| r.enable_ecc());

        let cs = ctrl0.cs() as usize;
        let geometry = BchGeometry::from_regs(self.layout.0, self.layout.1);
        let bch_stuck = self.bch_stuck;
        let Some(nand) = self.buses.get_mut(cs) else {
            // Nothing answers on a floating bus
            if let (DmaCommand::Write, Some(buffer)) = (desc.cmd.command(), desc.buffer) {
                mem.slice_mut(buffer)
                    .map_err(|_| BusFault("buffer outside DMA memory"))?
                    .fill(0xFF);
            }
            return Ok(());
        };

        match (ctrl0.command_mode(), ecc) {
            (CommandMode::WaitForReady, _) => Ok(()),
            (CommandMode::Write, Some(_)) => {
                let payload_addr = *pio.get(4).ok_or(BusFault("no payload address"))?;
                let aux_addr = *pio.get(5).ok_or(BusFault("no auxiliary address"))?;
                let payload = mem
                    .bytes(payload_addr, geometry.page_size)
                    .map_err(|_| BusFault("payload outside DMA memory"))?;
                let meta = mem
                    .bytes(aux_addr, geometry.metadata_size)
                    .map_err(|_| BusFault("auxiliary buffer outside DMA memory"))?;

                let (raw, shadow) = SimBch::new(geometry).encode(payload, meta);
                nand.write(&raw);
                nand.set_pending_shadow(shadow);
                self.bch_complete = !bch_stuck;
                Ok(())
            }
            (CommandMode::Read, Some(_)) => {
                let payload_addr = *pio.get(4).ok_or(BusFault("no payload address"))?;
                let aux_addr = *pio.get(5).ok_or(BusFault("no auxiliary address"))?;

                let mut raw = vec![0; geometry.raw_page_size()];
                nand.read(&mut raw);
                let decoded = SimBch::new(geometry).decode(&raw, nand.loaded_shadow());

                mem.bytes_mut(payload_addr, geometry.page_size)
                    .map_err(|_| BusFault("payload outside DMA memory"))?
                    .copy_from_slice(&decoded.payload);
                let aux = mem
                    .bytes_mut(aux_addr, geometry.aux_size())
                    .map_err(|_| BusFault("auxiliary buffer outside DMA memory"))?;
                aux[..geometry.metadata_size].copy_from_slice(&decoded.metadata);
                aux[geometry.status_offset..].copy_from_slice(&decoded.status);
                if decoded.status.iter().any(|&s| s != 0) {
                    debug!("simulated BCH status {:02x?}", decoded.status);
                }
                self.bch_complete = !bch_stuck;
                Ok(())
            }
            (CommandMode::Write, None) => {
                let buffer = desc.buffer.ok_or(BusFault("write without a buffer"))?;
                if desc.cmd.command() != DmaCommand::Read {
                    return Err(BusFault("GPMI write needs a memory read"));
                }
                let data = mem
                    .slice(buffer)
                    .map_err(|_| BusFault("buffer outside DMA memory"))?;
                match ctrl0.address() {
                    AddressSpace::Data => nand.write(data),
                    AddressSpace::Ale => data.iter().for_each(|&b| nand.address(b)),
                    AddressSpace::Cle => {
                        let (first, rest) = data.split_first().ok_or(BusFault("empty command"))?;
                        nand.command(*first);
                        match ctrl0.address_increment() {
                            true => rest.iter().for_each(|&b| nand.address(b)),
                            false => rest.iter().for_each(|&b| nand.command(b)),
                        }
                    }
                }
                Ok(())
            }
            (CommandMode::Read, None) => {
                let buffer = desc.buffer.ok_or(BusFault("read without a buffer"))?;
                if desc.cmd.command() != DmaCommand::Write {
                    return Err(BusFault("GPMI read needs a memory write"));
                }
                let dst = mem
                    .slice_mut(buffer)
                    .map_err(|_| BusFault("buffer outside DMA memory"))?;
                nand.read(dst);
                Ok(())
            }
            (CommandMode::ReadAndCompare, _) => Err(BusFault("read-and-compare is not modeled")),
        }
    }
}

impl BlockControl for SimSoc {
    fn set_soft_reset(&mut self, block: HwBlock, on: bool) {
        let mut state = self.state();
        let regs = state.block(block);
        regs.soft_reset = on;
        // The block gates its own clock once the reset has taken hold
        if on {
            regs.clock_gate = true;
        }
    }

    fn set_clock_gate(&mut self, block: HwBlock, on: bool) {
        self.state().block(block).clock_gate = on;
    }

    fn soft_reset(&self, block: HwBlock) -> bool {
        self.0
            .borrow()
            .blocks
            .get(&block)
            .is_some_and(|r| r.soft_reset)
    }

    fn clock_gated(&self, block: HwBlock) -> bool {
        self.0
            .borrow()
            .blocks
            .get(&block)
            .is_some_and(|r| r.clock_gate)
    }
}

impl ApbhHardware for SimSoc {
    fn set_next_command(&mut self, channel: usize, desc: DescId) {
        let mut state = self.state();
        let chan = &mut state.channels[channel];
        chan.next = Some(desc);
        chan.parked = None;
    }

    fn inc_semaphore(&mut self, channel: usize, count: u32, bus: DmaBus<'_>) {
        let mut state = self.state();
        state.channels[channel].sem += count;
        state.run(channel, bus);
    }

    fn semaphore(&self, channel: usize) -> u32 {
        self.0.borrow().channels[channel].sem
    }

    fn reset_channel(&mut self, channel: usize) {
        let mut state = self.state();
        let irq_enabled = state.channels[channel].irq_enabled;
        state.channels[channel] = ChannelRegs {
            irq_enabled,
            ..Default::default()
        };
    }

    fn freeze_channel(&mut self, channel: usize, freeze: bool) {
        self.state().channels[channel].frozen = freeze;
    }

    fn irq_pending(&self, channel: usize) -> bool {
        self.0.borrow().channels[channel].irq_pending
    }

    fn ack_irq(&mut self, channel: usize) {
        let mut state = self.state();
        state.channels[channel].irq_pending = false;
        state.channels[channel].error = false;
    }

    fn enable_irq(&mut self, channel: usize, enable: bool) {
        self.state().channels[channel].irq_enabled = enable;
    }

    fn error_pending(&self, channel: usize) -> bool {
        self.0.borrow().channels[channel].error
    }
}

impl GpmiHardware for SimSoc {
    fn write_ctrl1(&mut self, ctrl1: Ctrl1) {
        self.state().ctrl1 = ctrl1;
    }

    fn write_timing0(&mut self, timing0: Timing0) {
        self.state().timing0 = timing0;
    }

    fn write_timing1(&mut self, timing1: Timing1) {
        self.state().timing1 = timing1;
    }

    fn write_bch_layout(&mut self, layout0: BchLayout0, layout1: BchLayout1) {
        self.state().layout = (layout0, layout1);
    }

    fn bch_complete(&self) -> bool {
        self.0.borrow().bch_complete
    }

    fn clear_bch_complete(&mut self) {
        self.state().bch_complete = false;
    }

    fn enable_bch_irq(&mut self, enable: bool) {
        self.state().bch_irq_enabled = enable;
    }

    fn ready(&self, cs: usize) -> bool {
        // An empty chip select reads as ready through the pull-up
        self.0.borrow().buses.get(cs).map_or(true, SimNandBus::ready)
    }
}
