//! APBH DMA command descriptors and the arena that owns them

use super::memory::DmaSlice;
use crate::error::{NandError, Result};

use bitfield::bitfield;
use bitflags::bitflags;

/// Maximum number of PIO words a descriptor can carry
pub const MAX_PIO_WORDS: usize = 15;

/// What the channel does with the descriptor's buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DmaCommand {
    /// Only write PIO words (and wait, if asked)
    NoTransfer = 0,
    /// Move bytes from the device into memory
    Write = 1,
    /// Move bytes from memory to the device
    Read = 2,
    /// Branch on device sense
    Sense = 3,
}

impl From<u8> for DmaCommand {
    fn from(value: u8) -> Self {
        match value & 3 {
            0 => DmaCommand::NoTransfer,
            1 => DmaCommand::Write,
            2 => DmaCommand::Read,
            _ => DmaCommand::Sense,
        }
    }
}

bitfield! {
    /// The hardware command word at the head of every descriptor
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct DmaCommandWord(u32);
    impl Debug;
    pub u8, command_bits, set_command_bits: 1, 0;
    pub chain, set_chain: 2;
    pub irq, set_irq: 3;
    pub nand_lock, set_nand_lock: 4;
    pub nand_wait4ready, set_nand_wait4ready: 5;
    pub dec_sem, set_dec_sem: 6;
    pub wait4endcmd, set_wait4endcmd: 7;
    pub halt_on_terminate, set_halt_on_terminate: 8;
    pub u8, pio_words, set_pio_words: 15, 12;
    pub u16, xfer_count, set_xfer_count: 31, 16;
}

impl DmaCommandWord {
    pub fn command(&self) -> DmaCommand {
        self.command_bits().into()
    }

    pub fn set_command(&mut self, cmd: DmaCommand) {
        self.set_command_bits(cmd as u8);
    }
}

bitflags! {
    /// Driver-side bookkeeping, never seen by the hardware
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DescFlags: u8 {
        /// Fully built and allowed to be appended to a channel
        const READY = 0b001;
        /// First descriptor of a chain
        const FIRST = 0b010;
        /// Last descriptor of a chain
        const LAST = 0b100;
    }
}

/// Index of a descriptor slot in a [DescArena]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescId(pub(crate) usize);

/// Where the channel goes after a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DescLink {
    Next(DescId),
    /// End of the chain
    #[default]
    Terminal,
}

/// One command for a DMA channel
#[derive(Debug, Clone, Default)]
pub struct DmaDescriptor {
    pub cmd: DmaCommandWord,
    pub buffer: Option<DmaSlice>,
    pub link: DescLink,
    pio: [u32; MAX_PIO_WORDS],
    pub flags: DescFlags,
}

impl DmaDescriptor {
    /// Clear everything, leaving an unarmed descriptor
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Load the PIO words the channel writes to the device before the transfer
    pub fn set_pio(&mut self, words: &[u32]) {
        assert!(words.len() <= MAX_PIO_WORDS, "too many PIO words");
        self.pio[..words.len()].copy_from_slice(words);
        self.cmd.set_pio_words(words.len() as u8);
    }

    pub fn pio(&self) -> &[u32] {
        &self.pio[..self.cmd.pio_words() as usize]
    }

    /// Attach a memory buffer and set the transfer count to its length
    pub fn set_buffer(&mut self, buffer: DmaSlice) {
        self.cmd.set_xfer_count(buffer.len as u16);
        self.buffer = Some(buffer);
    }

    pub fn is_ready(&self) -> bool {
        self.flags.contains(DescFlags::READY)
    }
}

/// Fixed-capacity storage for descriptors
#[derive(Debug)]
pub struct DescArena {
    slots: Vec<DmaDescriptor>,
    in_use: Vec<bool>,
}

impl DescArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![DmaDescriptor::default(); capacity],
            in_use: vec![false; capacity],
        }
    }

    pub fn alloc(&mut self) -> Result<DescId> {
        let index = self
            .in_use
            .iter()
            .position(|used| !used)
            .ok_or(NandError::NoMemory)?;
        self.in_use[index] = true;
        self.slots[index].clear();
        Ok(DescId(index))
    }

    pub fn free(&mut self, id: DescId) {
        if let Some(used) = self.in_use.get_mut(id.0) {
            *used = false;
        }
    }

    pub fn get(&self, id: DescId) -> Result<&DmaDescriptor> {
        match self.in_use.get(id.0) {
            Some(true) => Ok(&self.slots[id.0]),
            _ => Err(NandError::InvalidArgument),
        }
    }

    pub fn get_mut(&mut self, id: DescId) -> Result<&mut DmaDescriptor> {
        match self.in_use.get(id.0) {
            Some(true) => Ok(&mut self.slots[id.0]),
            _ => Err(NandError::InvalidArgument),
        }
    }

    pub fn available(&self) -> usize {
        self.in_use.iter().filter(|used| !**used).count()
    }
}

#[test]
fn test_command_word_layout() {
    let mut word = DmaCommandWord::default();
    word.set_command(DmaCommand::Read);
    word.set_chain(true);
    word.set_dec_sem(true);
    word.set_pio_words(3);
    word.set_xfer_count(0x1234);
    assert_eq!(word.0, 0x1234_3046);
    assert_eq!(word.command(), DmaCommand::Read);
}

#[test]
fn test_arena_exhaustion() -> anyhow::Result<()> {
    let mut arena = DescArena::new(2);
    let a = arena.alloc()?;
    let b = arena.alloc()?;
    assert_ne!(a, b);
    assert_eq!(arena.alloc(), Err(NandError::NoMemory));
    arena.free(a);
    assert_eq!(arena.available(), 1);
    assert_eq!(arena.alloc()?, a);
    assert!(arena.get(DescId(7)).is_err());
    Ok(())
}

#[test]
fn test_pio_words() {
    let mut desc = DmaDescriptor::default();
    desc.set_pio(&[1, 2, 3]);
    assert_eq!(desc.pio(), &[1, 2, 3]);
    assert_eq!(desc.cmd.pio_words(), 3);
}
