//! Interfaces to the SoC services this stack consumes but does not implement: the GPMI clock,
//! blocking delays, and the soft-reset handshake shared by every APBH peripheral.

use crate::error::{NandError, Result};

use std::time::{Duration, Instant};

/// The clock feeding the GPMI controller
pub trait Clock {
    /// The current rate in Hz. A clock that cannot report a rate returns an error rather than a
    /// sentinel value.
    fn rate(&self) -> Result<u64>;
    fn enable(&mut self);
    fn disable(&mut self);
}

/// A clock running at a fixed, known rate
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    rate: u64,
    enabled: bool,
}

impl FixedClock {
    pub fn new(rate: u64) -> Self {
        Self {
            rate,
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Clock for FixedClock {
    fn rate(&self) -> Result<u64> {
        match self.rate {
            0 => Err(NandError::InvalidArgument),
            rate => Ok(rate),
        }
    }

    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }
}

/// Blocking wait primitives
pub trait Delay {
    fn udelay(&mut self, us: u32);

    fn mdelay(&mut self, ms: u32) {
        for _ in 0..ms {
            self.udelay(1000);
        }
    }

    /// Milliseconds since an arbitrary epoch
    fn timer_ms(&mut self) -> u64;

    /// Milliseconds elapsed since `base`, a value previously returned by [Delay::timer_ms]
    fn get_timer(&mut self, base: u64) -> u64 {
        self.timer_ms().saturating_sub(base)
    }
}

/// Real delays, for running against hardware (or a simulator in real time)
#[derive(Debug)]
pub struct StdDelay {
    epoch: Instant,
}

impl Default for StdDelay {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Delay for StdDelay {
    fn udelay(&mut self, us: u32) {
        std::thread::sleep(Duration::from_micros(us.into()));
    }

    fn timer_ms(&mut self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Delays that return immediately and only advance a virtual clock.
///
/// Every read of the timer also advances it by one millisecond, so a polling loop bounded by
/// elapsed time always terminates.
#[derive(Debug, Default, Clone)]
pub struct NoDelay {
    now_us: u64,
}

impl NoDelay {
    pub fn elapsed_us(&self) -> u64 {
        self.now_us
    }
}

impl Delay for NoDelay {
    fn udelay(&mut self, us: u32) {
        self.now_us += u64::from(us);
    }

    fn timer_ms(&mut self) -> u64 {
        self.now_us += 1000;
        self.now_us / 1000
    }
}

/// A bound on how many times a hardware status is polled before giving up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget(pub u32);

impl PollBudget {
    /// Spin until `done` returns true. Fails with [NandError::Timeout] once the budget is spent.
    pub fn poll<F: FnMut() -> bool>(self, mut done: F) -> Result<()> {
        for _ in 0..self.0 {
            if done() {
                return Ok(());
            }
            std::hint::spin_loop();
        }

        Err(NandError::Timeout)
    }
}

/// Peripheral blocks sharing the SFTRST/CLKGATE reset protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwBlock {
    Apbh,
    Gpmi,
    Bch,
}

/// The SFTRST and CLKGATE bits of a block's CTRL register
pub trait BlockControl {
    fn set_soft_reset(&mut self, block: HwBlock, on: bool);
    fn set_clock_gate(&mut self, block: HwBlock, on: bool);
    fn soft_reset(&self, block: HwBlock) -> bool;
    fn clock_gated(&self, block: HwBlock) -> bool;
}

/// Put a block through a full soft reset and leave it running.
///
/// The hardware gates its own clock once the reset has taken effect; each transition is polled
/// within `budget`.
pub fn reset_block<R: BlockControl + ?Sized>(
    regs: &mut R,
    block: HwBlock,
    budget: PollBudget,
) -> Result<()> {
    regs.set_soft_reset(block, false);
    budget.poll(|| !regs.soft_reset(block))?;
    regs.set_clock_gate(block, false);

    regs.set_soft_reset(block, true);
    budget.poll(|| regs.clock_gated(block))?;

    regs.set_soft_reset(block, false);
    budget.poll(|| !regs.soft_reset(block))?;
    regs.set_clock_gate(block, false);
    budget.poll(|| !regs.clock_gated(block))?;

    log::trace!("{block:?} block reset");
    Ok(())
}

#[test]
fn test_fixed_clock() {
    let mut clk = FixedClock::new(100_000_000);
    assert_eq!(clk.rate(), Ok(100_000_000));
    clk.enable();
    assert!(clk.is_enabled());
    assert_eq!(FixedClock::new(0).rate(), Err(NandError::InvalidArgument));
}

#[test]
fn test_poll_budget() {
    let mut n = 0;
    assert_eq!(
        PollBudget(10).poll(|| {
            n += 1;
            n == 3
        }),
        Ok(())
    );
    assert_eq!(PollBudget(10).poll(|| false), Err(NandError::Timeout));
    assert_eq!(PollBudget(0).poll(|| true), Err(NandError::Timeout));
}

#[test]
fn test_no_delay_timer_advances() {
    let mut delay = NoDelay::default();
    let base = delay.timer_ms();
    delay.mdelay(5);
    assert!(delay.get_timer(base) >= 5);
}
