//! A NAND flash driver stack for i.MX-style SoCs: the APBH DMA engine, the GPMI controller with
//! its BCH ECC engine, a generic NAND layer, and a bad block table kept on the flash itself.

/// Bad block table management
pub mod bbt;

/// Board-level configuration
pub mod config;

/// The APBH DMA engine
pub mod dma;

pub mod error;

/// Writers of bootloader-facing images
pub mod format;

/// The GPMI NAND controller and BCH ECC engine
pub mod gpmi;

/// The generic NAND layer and the MTD interface
pub mod nand;

pub mod platform;

/// A software model of the hardware, for tests and host-side tooling
pub mod sim;

pub mod util;
