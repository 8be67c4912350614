//! Board-level configuration of the NAND stack

use crate::nand::EccMode;
use crate::platform::PollBudget;

/// Everything a board decides about its NAND wiring and policies
#[derive(Debug, Clone)]
pub struct BoardConfig {
    /// Number of chip selects wired to NAND packages (and scanned for chips)
    pub chip_selects: usize,

    /// How the page payload is protected
    pub ecc_mode: EccMode,

    /// Build an in-memory bad block table at scan time
    pub scan_bbt: bool,

    /// Persist the bad block table to flash (otherwise it is rebuilt by a factory scan each boot)
    pub use_flash_bbt: bool,

    /// Look for the table starting from the last block of each chip
    pub bbt_last_block: bool,

    /// Keep one table per chip rather than one for the whole device
    pub bbt_per_chip: bool,

    /// Bits per block in the on-flash table: 1, 2, 4 or 8
    pub bbt_bits: u8,

    /// Write a version byte next to the table marker
    pub bbt_versioned: bool,

    /// Preserve the rest of a table block's contents when rewriting the table
    pub bbt_save_content: bool,

    /// How many blocks at the end (or start) of a chip may hold a table
    pub bbt_max_blocks: u32,

    /// Fallback wait after commands when the ready/busy line cannot be read
    pub chip_delay_us: u32,

    /// Poll budget for a DMA chain to complete
    pub dma_budget: PollBudget,

    /// Poll budget for the BCH engine to signal completion
    pub bch_budget: PollBudget,

    /// Poll budget for each step of a block soft reset
    pub reset_budget: PollBudget,

    /// Bus address and size of the memory pool handed to the DMA engine
    pub dma_pool_base: u32,
    pub dma_pool_size: usize,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            chip_selects: 1,
            ecc_mode: EccMode::Hw,
            scan_bbt: true,
            use_flash_bbt: true,
            bbt_last_block: true,
            bbt_per_chip: true,
            bbt_bits: 2,
            bbt_versioned: true,
            bbt_save_content: false,
            bbt_max_blocks: 4,
            chip_delay_us: 20,
            dma_budget: PollBudget(10_000),
            bch_budget: PollBudget(10_000),
            reset_budget: PollBudget(1_000),
            dma_pool_base: 0x4000_0000,
            dma_pool_size: 64 * 1024,
        }
    }
}
