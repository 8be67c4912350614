//! The APBH DMA engine: channel ownership, descriptor chains, and synchronous execution.
//!
//! Each channel keeps one ordered list of descriptors that have been appended but not yet
//! reclaimed. The first `active_num` entries have been handed to the hardware; the remaining
//! `pending_num` are waiting for [DmaEngine::enable]. The hardware counts the descriptors it still
//! owes in a per-channel semaphore, and [DmaEngine::cooked] uses that count to reclaim the ones
//! that have finished.

pub mod descriptor;
pub mod memory;

pub use descriptor::{
    DescArena, DescFlags, DescId, DescLink, DmaCommand, DmaCommandWord, DmaDescriptor,
};
pub use memory::{DmaMemory, DmaSlice};

use crate::error::{NandError, Result};
use crate::platform::{reset_block, BlockControl, HwBlock, PollBudget};

use bitflags::bitflags;
use log::{debug, error, trace};

use std::collections::VecDeque;

/// Number of channels on the APBH bridge
pub const APBH_CHANNELS: usize = 8;

/// What the hardware sees of system memory while it runs a chain
pub struct DmaBus<'a> {
    pub descs: &'a DescArena,
    pub mem: &'a mut DmaMemory,
}

/// The APBH register surface
pub trait ApbhHardware: BlockControl {
    /// Point the channel at the descriptor it fetches next
    fn set_next_command(&mut self, channel: usize, desc: DescId);

    /// Add `count` to the channel's semaphore, letting it run that many more descriptors
    fn inc_semaphore(&mut self, channel: usize, count: u32, bus: DmaBus<'_>);

    fn semaphore(&self, channel: usize) -> u32;

    /// Reset the channel; this also clears its semaphore
    fn reset_channel(&mut self, channel: usize);

    fn freeze_channel(&mut self, channel: usize, freeze: bool);

    fn irq_pending(&self, channel: usize) -> bool;
    fn ack_irq(&mut self, channel: usize);
    fn enable_irq(&mut self, channel: usize, enable: bool);

    /// Did the channel terminate a chain with an error?
    fn error_pending(&self, channel: usize) -> bool;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChannelFlags: u8 {
        /// A device is wired to this channel
        const VALID = 0b001;
        /// Claimed by a driver
        const ALLOCATED = 0b010;
        /// The hardware owns at least one descriptor
        const BUSY = 0b100;
    }
}

/// Software state of one hardware channel
#[derive(Debug, Default)]
pub struct DmaChannel {
    pub flags: ChannelFlags,
    pub active_num: u32,
    pub pending_num: u32,
    active: VecDeque<DescId>,
    done: VecDeque<DescId>,
    registered: bool,
}

impl DmaChannel {
    /// Descriptors appended and not yet reclaimed, oldest first
    pub fn active(&self) -> impl Iterator<Item = DescId> + '_ {
        self.active.iter().copied()
    }

    /// Descriptors reclaimed by [DmaEngine::cooked] without an explicit destination
    pub fn done(&self) -> impl Iterator<Item = DescId> + '_ {
        self.done.iter().copied()
    }
}

/// The DMA engine of one SoC
pub struct DmaEngine<H> {
    hw: H,
    channels: [DmaChannel; APBH_CHANNELS],
    descs: DescArena,
    mem: DmaMemory,
}

impl<H: ApbhHardware> DmaEngine<H> {
    pub fn new(hw: H, mem: DmaMemory, max_descriptors: usize) -> Self {
        Self {
            hw,
            channels: Default::default(),
            descs: DescArena::new(max_descriptors),
            mem,
        }
    }

    /// Declare that a peripheral is wired to `channel`. Takes effect at [DmaEngine::init].
    pub fn register_device(&mut self, channel: usize) -> Result<()> {
        self.channels
            .get_mut(channel)
            .ok_or(NandError::InvalidArgument)?
            .registered = true;
        Ok(())
    }

    /// Reset the APBH block and mark every channel with a registered device usable
    pub fn init(&mut self, budget: PollBudget) -> Result<()> {
        reset_block(&mut self.hw, HwBlock::Apbh, budget).inspect_err(|e| {
            error!("APBH reset failed: {e}");
        })?;

        for chan in self.channels.iter_mut() {
            chan.flags = ChannelFlags::empty();
            if chan.registered {
                chan.flags |= ChannelFlags::VALID;
            }
        }

        Ok(())
    }

    fn channel(&self, channel: usize) -> Result<&DmaChannel> {
        let chan = self.channels.get(channel).ok_or(NandError::InvalidArgument)?;
        if !chan.flags.contains(ChannelFlags::VALID) {
            return Err(NandError::NoDevice);
        }
        Ok(chan)
    }

    /// Look up a channel that has been claimed with [DmaEngine::request]
    fn allocated(&mut self, channel: usize) -> Result<&mut DmaChannel> {
        self.channel(channel)?;
        let chan = &mut self.channels[channel];
        if !chan.flags.contains(ChannelFlags::ALLOCATED) {
            return Err(NandError::Fault);
        }
        Ok(chan)
    }

    pub fn request(&mut self, channel: usize) -> Result<()> {
        if self.channel(channel)?.flags.contains(ChannelFlags::ALLOCATED) {
            return Err(NandError::Busy);
        }

        self.reset(channel)?;
        let chan = &mut self.channels[channel];
        chan.flags |= ChannelFlags::ALLOCATED;
        chan.active_num = 0;
        chan.pending_num = 0;
        chan.active.clear();
        chan.done.clear();
        debug!("DMA channel {channel} allocated");
        Ok(())
    }

    pub fn release(&mut self, channel: usize) -> Result<()> {
        self.allocated(channel)?;
        self.disable(channel)?;

        let chan = &mut self.channels[channel];
        chan.active.clear();
        chan.done.clear();
        chan.active_num = 0;
        chan.pending_num = 0;
        chan.flags.remove(ChannelFlags::ALLOCATED);
        debug!("DMA channel {channel} released");
        Ok(())
    }

    pub fn alloc_desc(&mut self) -> Result<DescId> {
        self.descs.alloc()
    }

    pub fn free_desc(&mut self, id: DescId) {
        self.descs.free(id);
    }

    pub fn desc(&self, id: DescId) -> Result<&DmaDescriptor> {
        self.descs.get(id)
    }

    pub fn desc_mut(&mut self, id: DescId) -> Result<&mut DmaDescriptor> {
        self.descs.get_mut(id)
    }

    pub fn memory(&self) -> &DmaMemory {
        &self.mem
    }

    pub fn memory_mut(&mut self) -> &mut DmaMemory {
        &mut self.mem
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    /// Inspect a channel's software state
    pub fn channel_state(&self, channel: usize) -> Result<&DmaChannel> {
        self.channels.get(channel).ok_or(NandError::InvalidArgument)
    }

    /// Add a ready descriptor to the end of a channel's chain.
    ///
    /// The previous tail (if any) is chained to it; the new descriptor becomes the terminal one.
    pub fn append(&mut self, channel: usize, id: DescId) -> Result<()> {
        if !self.descs.get(id)?.is_ready() {
            return Err(NandError::InvalidArgument);
        }

        let tail = self.allocated(channel)?.active.back().copied();
        if let Some(tail) = tail {
            let prev = self.descs.get_mut(tail)?;
            prev.cmd.set_chain(true);
            prev.link = DescLink::Next(id);
            prev.flags.remove(DescFlags::LAST);
        }

        let desc = self.descs.get_mut(id)?;
        desc.link = DescLink::Terminal;
        desc.cmd.set_chain(false);
        desc.flags.insert(DescFlags::LAST);
        desc.flags.set(DescFlags::FIRST, tail.is_none());

        let chan = &mut self.channels[channel];
        chan.active.push_back(id);
        chan.pending_num += 1;
        trace!("DMA channel {channel}: appended {id:?}");
        Ok(())
    }

    pub fn append_list(&mut self, channel: usize, ids: &[DescId]) -> Result<()> {
        ids.iter().try_for_each(|&id| self.append(channel, id))
    }

    /// Hand all pending descriptors to the hardware.
    ///
    /// On an idle channel the chain starts at the first pending descriptor. On a running channel
    /// [DmaEngine::append] has already chained the old tail to the new descriptors, so the hardware
    /// follows it there once the semaphore is raised, even if it had stopped at that tail.
    pub fn enable(&mut self, channel: usize) -> Result<()> {
        let chan = self.allocated(channel)?;
        if chan.pending_num == 0 {
            return Ok(());
        }

        let pending = chan.pending_num;
        let first_pending = chan
            .active
            .get(chan.active_num as usize)
            .copied()
            .ok_or(NandError::Fault)?;

        if chan.flags.contains(ChannelFlags::BUSY) {
            trace!("DMA channel {channel}: extending running chain by {pending}");
        } else {
            chan.flags |= ChannelFlags::BUSY;
            self.hw.set_next_command(channel, first_pending);
        }

        let chan = &mut self.channels[channel];
        chan.active_num += pending;
        chan.pending_num = 0;

        self.hw.freeze_channel(channel, false);
        self.hw.inc_semaphore(
            channel,
            pending,
            DmaBus {
                descs: &self.descs,
                mem: &mut self.mem,
            },
        );
        Ok(())
    }

    /// Stop a channel, dropping its BUSY state
    pub fn disable(&mut self, channel: usize) -> Result<()> {
        self.allocated(channel)?;
        self.hw.freeze_channel(channel, true);
        self.channels[channel].flags.remove(ChannelFlags::BUSY);
        self.hw.freeze_channel(channel, false);
        Ok(())
    }

    pub fn reset(&mut self, channel: usize) -> Result<()> {
        self.channel(channel)?;
        self.hw.reset_channel(channel);
        Ok(())
    }

    pub fn freeze(&mut self, channel: usize) -> Result<()> {
        self.channel(channel)?;
        self.hw.freeze_channel(channel, true);
        Ok(())
    }

    pub fn unfreeze(&mut self, channel: usize) -> Result<()> {
        self.channel(channel)?;
        self.hw.freeze_channel(channel, false);
        Ok(())
    }

    pub fn read_semaphore(&self, channel: usize) -> Result<u32> {
        self.channel(channel)?;
        Ok(self.hw.semaphore(channel))
    }

    /// Reclaim descriptors the hardware has finished.
    ///
    /// Finished descriptors are moved to `out`, or to the channel's done list when no destination
    /// is given. Returns how many were reclaimed.
    pub fn cooked(&mut self, channel: usize, out: Option<&mut Vec<DescId>>) -> Result<u32> {
        self.allocated(channel)?;
        let sem = self.hw.semaphore(channel);
        let chan = &mut self.channels[channel];

        let finished = chan.active_num.saturating_sub(sem);
        let mut reclaimed = Vec::with_capacity(finished as usize);
        for _ in 0..finished {
            let Some(id) = chan.active.pop_front() else {
                break;
            };
            reclaimed.push(id);
        }
        chan.active_num -= reclaimed.len() as u32;
        let count = reclaimed.len() as u32;

        if sem == 0 && chan.active_num == 0 {
            chan.flags.remove(ChannelFlags::BUSY);
        }

        for &id in &reclaimed {
            self.descs.get_mut(id)?.flags.remove(DescFlags::READY);
        }

        match out {
            Some(out) => out.extend(reclaimed),
            None => self.channels[channel].done.extend(reclaimed),
        }

        Ok(count)
    }

    /// Run everything appended to a channel and wait for it to finish.
    ///
    /// However the wait ends, the channel is left reset, acknowledged, and disabled, with all of its
    /// descriptors reclaimed.
    pub fn go(&mut self, channel: usize, budget: PollBudget) -> Result<()> {
        self.allocated(channel)?;

        self.hw.enable_irq(channel, true);
        let mut result = self.enable(channel);
        if result.is_ok() {
            let hw = &self.hw;
            result = budget.poll(|| hw.irq_pending(channel));
            if result.is_err() {
                error!("DMA channel {channel} timed out");
                self.hw.reset_channel(channel);
            } else if self.hw.error_pending(channel) {
                error!("DMA channel {channel} terminated with an error");
                result = Err(NandError::Io);
            }
        }

        let mut finished = Vec::new();
        let cooked = self.cooked(channel, Some(&mut finished));
        self.hw.ack_irq(channel);
        self.hw.reset_channel(channel);
        self.hw.enable_irq(channel, false);
        let disabled = self.disable(channel);

        // After a reset the semaphore is zero, so nothing can remain pending or active.
        let chan = &mut self.channels[channel];
        for id in chan.active.drain(..) {
            if let Ok(desc) = self.descs.get_mut(id) {
                desc.flags.remove(DescFlags::READY);
            }
        }
        chan.active_num = 0;
        chan.pending_num = 0;

        result.and(cooked.map(|_| ())).and(disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimSoc;

    fn engine() -> (SimSoc, DmaEngine<SimSoc>) {
        let soc = SimSoc::without_flash();
        let mut dma = DmaEngine::new(soc.clone(), DmaMemory::new(0x1000, 4096), 16);
        dma.register_device(0).unwrap();
        dma.register_device(1).unwrap();
        dma.init(PollBudget(100)).unwrap();
        (soc, dma)
    }

    fn ready_desc(dma: &mut DmaEngine<SimSoc>) -> DescId {
        let id = dma.alloc_desc().unwrap();
        let desc = dma.desc_mut(id).unwrap();
        desc.cmd.set_command(DmaCommand::NoTransfer);
        desc.cmd.set_dec_sem(true);
        desc.flags = DescFlags::READY;
        id
    }

    fn check_accounting(dma: &DmaEngine<SimSoc>, channel: usize) {
        let chan = dma.channel_state(channel).unwrap();
        assert_eq!(
            (chan.active_num + chan.pending_num) as usize,
            chan.active().count()
        );
    }

    #[test]
    fn test_request_errors() {
        let (_soc, mut dma) = engine();
        assert_eq!(dma.request(APBH_CHANNELS), Err(NandError::InvalidArgument));
        assert_eq!(dma.request(5), Err(NandError::NoDevice));
        assert_eq!(dma.release(0), Err(NandError::Fault));
        dma.request(0).unwrap();
        assert_eq!(dma.request(0), Err(NandError::Busy));
        dma.release(0).unwrap();
        dma.request(0).unwrap();
    }

    #[test]
    fn test_append_requires_ready() {
        let (_soc, mut dma) = engine();
        dma.request(0).unwrap();
        let id = dma.alloc_desc().unwrap();
        assert_eq!(dma.append(0, id), Err(NandError::InvalidArgument));
        let id = ready_desc(&mut dma);
        let other = ready_desc(&mut dma);
        assert_eq!(dma.append(1, id), Err(NandError::Fault));
        dma.append_list(0, &[id, other]).unwrap();
        check_accounting(&dma, 0);

        let first = dma.desc(id).unwrap();
        assert!(first.cmd.chain());
        assert_eq!(first.link, DescLink::Next(other));
        assert!(first.flags.contains(DescFlags::FIRST));
        let last = dma.desc(other).unwrap();
        assert!(!last.cmd.chain());
        assert_eq!(last.link, DescLink::Terminal);
        assert!(last.flags.contains(DescFlags::LAST));
    }

    #[test]
    fn test_semaphore_tracks_active() {
        let (soc, mut dma) = engine();
        dma.request(0).unwrap();
        soc.set_dma_stalled(true);

        let ids: Vec<_> = (0..3).map(|_| ready_desc(&mut dma)).collect();
        for &id in &ids {
            dma.append(0, id).unwrap();
            check_accounting(&dma, 0);
        }
        assert_eq!(dma.channel_state(0).unwrap().pending_num, 3);

        dma.enable(0).unwrap();
        let chan = dma.channel_state(0).unwrap();
        assert_eq!(chan.active_num, 3);
        assert_eq!(chan.pending_num, 0);
        assert_eq!(dma.read_semaphore(0).unwrap(), chan.active_num);
        check_accounting(&dma, 0);

        // Nothing ran, so nothing may be reclaimed
        assert_eq!(dma.cooked(0, None).unwrap(), 0);
        assert_eq!(dma.channel_state(0).unwrap().active_num, 3);
    }

    #[test]
    fn test_cooked_partial_progress() {
        let (soc, mut dma) = engine();
        dma.request(0).unwrap();
        soc.set_dma_step_limit(Some(1));

        let ids: Vec<_> = (0..3).map(|_| ready_desc(&mut dma)).collect();
        dma.append_list(0, &ids).unwrap();
        dma.enable(0).unwrap();
        assert_eq!(dma.read_semaphore(0).unwrap(), 2);

        let mut out = Vec::new();
        assert_eq!(dma.cooked(0, Some(&mut out)).unwrap(), 1);
        assert_eq!(out, [ids[0]]);
        let chan = dma.channel_state(0).unwrap();
        assert_eq!(chan.active_num, 2);
        assert!(chan.active_num >= dma.read_semaphore(0).unwrap());
        assert!(chan.flags.contains(ChannelFlags::BUSY));
        check_accounting(&dma, 0);
        assert!(!dma.desc(ids[0]).unwrap().is_ready());
    }

    #[test]
    fn test_cooked_to_done_list() {
        let (_soc, mut dma) = engine();
        dma.request(0).unwrap();
        let ids: Vec<_> = (0..2).map(|_| ready_desc(&mut dma)).collect();
        dma.append_list(0, &ids).unwrap();
        dma.enable(0).unwrap();
        assert_eq!(dma.cooked(0, None).unwrap(), 2);
        let chan = dma.channel_state(0).unwrap();
        assert_eq!(chan.done().collect::<Vec<_>>(), ids);
        assert!(!chan.flags.contains(ChannelFlags::BUSY));
    }

    #[test]
    fn test_go_completes() {
        let (_soc, mut dma) = engine();
        dma.request(0).unwrap();
        let id = ready_desc(&mut dma);
        dma.desc_mut(id).unwrap().cmd.set_irq(true);
        dma.append(0, id).unwrap();
        dma.go(0, PollBudget(10)).unwrap();

        let chan = dma.channel_state(0).unwrap();
        assert_eq!(chan.active_num, 0);
        assert_eq!(chan.active().count(), 0);
        assert!(!chan.flags.contains(ChannelFlags::BUSY));
    }

    #[test]
    fn test_go_timeout_cleans_up() {
        let (soc, mut dma) = engine();
        dma.request(0).unwrap();
        soc.set_dma_stalled(true);
        let id = ready_desc(&mut dma);
        dma.desc_mut(id).unwrap().cmd.set_irq(true);
        dma.append(0, id).unwrap();

        assert_eq!(dma.go(0, PollBudget(10)), Err(NandError::Timeout));
        let chan = dma.channel_state(0).unwrap();
        assert_eq!(chan.active_num, 0);
        assert_eq!(chan.pending_num, 0);
        assert!(!chan.flags.contains(ChannelFlags::BUSY));
        assert!(!soc.dma_irq_enabled(0));
        assert_eq!(dma.read_semaphore(0).unwrap(), 0);

        // The channel is usable again
        soc.set_dma_stalled(false);
        let id = ready_desc(&mut dma);
        dma.desc_mut(id).unwrap().cmd.set_irq(true);
        dma.append(0, id).unwrap();
        dma.go(0, PollBudget(10)).unwrap();
    }

    #[test]
    fn test_go_error_termination() {
        let (soc, mut dma) = engine();
        dma.request(0).unwrap();
        soc.set_dma_error(true);
        let id = ready_desc(&mut dma);
        dma.desc_mut(id).unwrap().cmd.set_irq(true);
        dma.append(0, id).unwrap();
        assert_eq!(dma.go(0, PollBudget(10)), Err(NandError::Io));
        assert_eq!(dma.channel_state(0).unwrap().active().count(), 0);
    }

    #[test]
    fn test_extend_chain_after_tail() {
        let (_soc, mut dma) = engine();
        dma.request(0).unwrap();

        let first = ready_desc(&mut dma);
        dma.append(0, first).unwrap();
        dma.enable(0).unwrap();
        assert_eq!(dma.read_semaphore(0).unwrap(), 0);
        assert!(dma.channel_state(0).unwrap().flags.contains(ChannelFlags::BUSY));

        // The hardware stopped at the old tail; the new descriptor still runs
        let second = ready_desc(&mut dma);
        dma.append(0, second).unwrap();
        dma.enable(0).unwrap();
        assert_eq!(dma.channel_state(0).unwrap().pending_num, 0);
        assert_eq!(dma.read_semaphore(0).unwrap(), 0);
        check_accounting(&dma, 0);

        assert_eq!(dma.cooked(0, None).unwrap(), 2);
        let chan = dma.channel_state(0).unwrap();
        assert_eq!(chan.done().collect::<Vec<_>>(), [first, second]);
    }
}
