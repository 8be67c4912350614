//! A software model of the NAND subsystem of the SoC, from the APBH DMA channels down to the
//! flash array.
//!
//! The model is the hardware behind every test of the stack, and the backend of `nand-tool`. It
//! is deliberately `!Send`: the driver stack has a single caller, and so does its hardware.

mod bch;
mod bus;
mod flash;
mod soc;

pub use bch::{Decoded, SimBch};
pub use bus::SimNandBus;
pub use flash::SimFlash;
pub use soc::SimSoc;

use crate::config::BoardConfig;
use crate::error::Result;
use crate::gpmi::Gpmi;
use crate::nand::MtdDevice;
use crate::platform::{FixedClock, NoDelay};

/// Rate of the simulated GPMI clock
pub const SIM_GPMI_CLOCK_HZ: u64 = 100_000_000;

/// The driver stack as a board would assemble it, over simulated hardware
pub type SimMtd = MtdDevice<Gpmi<SimSoc, SimSoc>>;

/// A simulated board: the SoC model and the driver stack running on it
pub struct SimNandSystem {
    pub soc: SimSoc,
    pub mtd: SimMtd,
}

impl SimNandSystem {
    /// Wire one flash chip to each chip select and bring the stack up on them
    pub fn build(config: &BoardConfig, flashes: Vec<SimFlash>) -> Result<Self> {
        let soc = SimSoc::new(flashes);
        let gpmi = Gpmi::new(
            soc.clone(),
            soc.clone(),
            Box::new(FixedClock::new(SIM_GPMI_CLOCK_HZ)),
            config,
        )?;
        let mtd = MtdDevice::scan(gpmi, Box::new(NoDelay::default()), config)?;
        Ok(Self { soc, mtd })
    }

    /// Power-cycle the board: the flash keeps its contents, everything else starts over
    pub fn reboot(self, config: &BoardConfig) -> Result<Self> {
        let flashes = self.soc.take_flashes();
        drop(self.mtd);
        Self::build(config, flashes)
    }

    /// Take the flash chips back out, e.g. to save them
    pub fn into_flashes(self) -> Vec<SimFlash> {
        self.soc.take_flashes()
    }
}
