//! Conversion of NAND timing requirements (in nanoseconds) to GPMI clock-cycle fields

use super::regs::{Ctrl1, Timing0, Timing1};
use crate::error::{NandError, Result};

/// The widest data setup TIMING0 can express
pub const MAX_DATA_SETUP_CYCLES: u32 = 255;

/// The widest RDN_DELAY sample delay, in DLL taps
pub const MAX_SAMPLE_DELAY_FACTOR: u32 = 15;

/// Clock periods longer than this run the DLL in half-period mode
pub const DLL_THRESHOLD_NS: u32 = 16;

/// Busy timeouts are programmed in units of this many clock cycles
pub const BUSY_TIMEOUT_UNIT: u32 = 4096;

/// Timing requirements of a NAND part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NandTiming {
    pub data_setup_ns: u32,
    pub data_hold_ns: u32,
    pub address_setup_ns: u32,
    pub busy_timeout_ns: u32,
    /// RE# access time (RE# low to data valid)
    pub t_rea_ns: Option<u32>,
    /// Data hold after RE# low
    pub t_rloh_ns: Option<u32>,
    /// Data hold after RE# high
    pub t_rhoh_ns: Option<u32>,
}

impl NandTiming {
    /// Slow enough for any part, used until the chip has been identified
    pub const SAFE: NandTiming = NandTiming {
        data_setup_ns: 80,
        data_hold_ns: 60,
        address_setup_ns: 25,
        busy_timeout_ns: 10_000_000,
        t_rea_ns: None,
        t_rloh_ns: None,
        t_rhoh_ns: None,
    };

    /// Typical asynchronous timing of classic small/large page parts
    pub const LEGACY: NandTiming = NandTiming {
        data_setup_ns: 25,
        data_hold_ns: 15,
        address_setup_ns: 20,
        busy_timeout_ns: 10_000_000,
        t_rea_ns: None,
        t_rloh_ns: None,
        t_rhoh_ns: None,
    };

    /// EDO-capable parts that publish their read-eye parameters
    pub const EDO: NandTiming = NandTiming {
        data_setup_ns: 15,
        data_hold_ns: 10,
        address_setup_ns: 15,
        busy_timeout_ns: 10_000_000,
        t_rea_ns: Some(20),
        t_rloh_ns: Some(5),
        t_rhoh_ns: Some(15),
    };
}

impl Default for NandTiming {
    fn default() -> Self {
        NandTiming::SAFE
    }
}

/// Register-level timing for the GPMI controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HwTiming {
    pub data_setup_cycles: u8,
    pub data_hold_cycles: u8,
    pub address_setup_cycles: u8,
    /// In units of [BUSY_TIMEOUT_UNIT] cycles
    pub busy_timeout: u16,
    /// Read sample delay, in DLL taps
    pub sample_delay_factor: u8,
    pub use_half_period: bool,
}

impl HwTiming {
    pub fn timing0(&self) -> Timing0 {
        let mut t0 = Timing0::default();
        t0.set_data_setup(self.data_setup_cycles);
        t0.set_data_hold(self.data_hold_cycles);
        t0.set_address_setup(self.address_setup_cycles);
        t0
    }

    pub fn timing1(&self) -> Timing1 {
        let mut t1 = Timing1::default();
        t1.set_busy_timeout(self.busy_timeout);
        t1
    }

    /// Merge the DLL settings into a CTRL1 value
    pub fn apply_ctrl1(&self, mut ctrl1: Ctrl1) -> Ctrl1 {
        ctrl1.set_rdn_delay(self.sample_delay_factor);
        ctrl1.set_half_period(self.use_half_period);
        ctrl1.set_dll_enable(self.sample_delay_factor != 0);
        ctrl1
    }
}

fn ns_to_cycles(ns: u32, period_ns: u32, min: u32) -> u32 {
    ns.div_ceil(period_ns).max(min)
}

/// Compute register timing for a GPMI clock of `rate` Hz.
///
/// When the part publishes its read-eye parameters, the data setup is widened until the ideal
/// sample point, measured from the rising edge of RE#, can be expressed in the 4-bit sample delay
/// field. If no setup up to the register maximum achieves that, the maximum setup and delay are
/// used.
pub fn compute_hw_timing(rate: u64, timing: &NandTiming) -> Result<HwTiming> {
    if rate == 0 {
        return Err(NandError::InvalidArgument);
    }
    let period_ns = 1_000_000_000u64.div_ceil(rate).max(1) as u32;

    let mut data_setup = ns_to_cycles(timing.data_setup_ns, period_ns, 1);
    let data_hold = ns_to_cycles(timing.data_hold_ns, period_ns, 1).min(255);
    let address_setup = ns_to_cycles(timing.address_setup_ns, period_ns, 0).min(255);

    let busy_cycles = ns_to_cycles(timing.busy_timeout_ns, period_ns, 0);
    let busy_timeout = busy_cycles.div_ceil(BUSY_TIMEOUT_UNIT).min(u16::MAX.into()) as u16;

    let (dll_shift, use_half_period) = match period_ns > DLL_THRESHOLD_NS {
        true => (4, true),
        false => (3, false),
    };

    let mut sample_delay_factor = 0;
    if let (Some(t_rea), Some(t_rhoh)) = (timing.t_rea_ns, timing.t_rhoh_ns) {
        let t_rloh = timing.t_rloh_ns.unwrap_or(0);

        sample_delay_factor = loop {
            data_setup = data_setup.min(MAX_DATA_SETUP_CYCLES);
            let setup_ns = data_setup * period_ns;

            // Data is valid from tREA after RE# falls until it is released after RE# rises
            // (or, in EDO mode, after the next RE# falling edge).
            let eye_end = (setup_ns + t_rhoh).max((data_setup + data_hold) * period_ns + t_rloh);
            if t_rea < eye_end {
                let ideal_ns = ((t_rea + eye_end) / 2).saturating_sub(setup_ns);
                let factor = (ideal_ns << dll_shift).div_ceil(period_ns);
                if factor <= MAX_SAMPLE_DELAY_FACTOR {
                    break factor;
                }
            }

            if data_setup >= MAX_DATA_SETUP_CYCLES {
                log::warn!("NAND read eye cannot be centered; using the widest timing");
                break MAX_SAMPLE_DELAY_FACTOR;
            }
            data_setup += 1;
        };
    }

    let hw = HwTiming {
        data_setup_cycles: data_setup.min(MAX_DATA_SETUP_CYCLES) as u8,
        data_hold_cycles: data_hold as u8,
        address_setup_cycles: address_setup as u8,
        busy_timeout,
        sample_delay_factor: sample_delay_factor as u8,
        use_half_period,
    };
    log::debug!("GPMI timing at {rate} Hz: {hw:?}");
    Ok(hw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_safe_timing() -> anyhow::Result<()> {
        let hw = compute_hw_timing(100_000_000, &NandTiming::SAFE)?;
        assert_eq!(hw.data_setup_cycles, 8);
        assert_eq!(hw.data_hold_cycles, 6);
        assert_eq!(hw.address_setup_cycles, 3);
        assert_eq!(hw.busy_timeout, 245);
        assert_eq!(hw.sample_delay_factor, 0);
        assert!(!hw.use_half_period);
        Ok(())
    }

    #[rstest]
    #[case(0, 0, 0, 1, 0)]
    #[case(1, 1, 1, 1, 1)]
    #[case(10, 10, 10, 1, 1)]
    #[case(11, 11, 11, 2, 2)]
    fn test_minimum_cycles(
        #[case] setup: u32,
        #[case] hold: u32,
        #[case] addr: u32,
        #[case] expect_data: u8,
        #[case] expect_addr: u8,
    ) {
        let timing = NandTiming {
            data_setup_ns: setup,
            data_hold_ns: hold,
            address_setup_ns: addr,
            ..NandTiming::SAFE
        };
        let hw = compute_hw_timing(100_000_000, &timing).unwrap();
        assert_eq!(hw.data_setup_cycles, expect_data);
        assert_eq!(hw.data_hold_cycles, expect_data);
        assert_eq!(hw.address_setup_cycles, expect_addr);
    }

    #[test]
    fn test_zero_rate() {
        assert_eq!(
            compute_hw_timing(0, &NandTiming::SAFE),
            Err(NandError::InvalidArgument)
        );
    }

    #[test]
    fn test_sample_delay_search_widens_setup() -> anyhow::Result<()> {
        let timing = NandTiming {
            data_setup_ns: 20,
            data_hold_ns: 10,
            address_setup_ns: 10,
            busy_timeout_ns: 0,
            t_rea_ns: Some(40),
            t_rloh_ns: Some(5),
            t_rhoh_ns: Some(15),
        };
        let hw = compute_hw_timing(100_000_000, &timing)?;
        // At 2 cycles the eye closes before tREA; at 3 the midpoint is 12ns past RE# rising.
        assert_eq!(hw.data_setup_cycles, 3);
        assert_eq!(hw.sample_delay_factor, 10);
        Ok(())
    }

    #[test]
    fn test_sample_delay_clamps() -> anyhow::Result<()> {
        let timing = NandTiming {
            data_setup_ns: 1,
            data_hold_ns: 1,
            address_setup_ns: 0,
            busy_timeout_ns: 0,
            t_rea_ns: Some(300),
            t_rloh_ns: Some(0),
            t_rhoh_ns: Some(0),
        };
        let hw = compute_hw_timing(1_000_000_000, &timing)?;
        assert_eq!(hw.data_setup_cycles, 255);
        assert_eq!(hw.sample_delay_factor, 15);
        Ok(())
    }

    #[test]
    fn test_half_period_mode() -> anyhow::Result<()> {
        let hw = compute_hw_timing(50_000_000, &NandTiming::EDO)?;
        assert!(hw.use_half_period);
        assert!(u32::from(hw.sample_delay_factor) <= MAX_SAMPLE_DELAY_FACTOR);

        let ctrl1 = hw.apply_ctrl1(Ctrl1::default());
        assert!(ctrl1.half_period());
        assert_eq!(ctrl1.rdn_delay(), hw.sample_delay_factor);
        Ok(())
    }
}
