//! GPMI and BCH register layouts, as packed into PIO words and control registers

use bitfield::bitfield;

/// GPMI_CTRL0 command modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandMode {
    Write = 0,
    Read = 1,
    ReadAndCompare = 2,
    WaitForReady = 3,
}

impl From<u8> for CommandMode {
    fn from(value: u8) -> Self {
        match value & 3 {
            0 => CommandMode::Write,
            1 => CommandMode::Read,
            2 => CommandMode::ReadAndCompare,
            _ => CommandMode::WaitForReady,
        }
    }
}

/// Which NAND latch a transfer targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressSpace {
    Data = 0,
    Cle = 1,
    Ale = 2,
}

impl From<u8> for AddressSpace {
    fn from(value: u8) -> Self {
        match value {
            1 => AddressSpace::Cle,
            2 => AddressSpace::Ale,
            _ => AddressSpace::Data,
        }
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct Ctrl0(u32);
    impl Debug;
    pub run, set_run: 29;
    pub dev_irq_en, set_dev_irq_en: 28;
    pub lock_cs, set_lock_cs: 27;
    pub udma, set_udma: 26;
    pub u8, command_mode_bits, set_command_mode_bits: 25, 24;
    pub word_length_8, set_word_length_8: 23;
    pub u8, cs, set_cs: 22, 20;
    pub u8, address_bits, set_address_bits: 19, 17;
    pub address_increment, set_address_increment: 16;
    pub u16, xfer_count, set_xfer_count: 15, 0;
}

impl Ctrl0 {
    /// An 8-bit transfer of `count` units on chip select `cs`
    pub fn new(mode: CommandMode, cs: usize, space: AddressSpace, count: usize) -> Self {
        let mut ctrl0 = Ctrl0::default();
        ctrl0.set_command_mode_bits(mode as u8);
        ctrl0.set_word_length_8(true);
        ctrl0.set_cs(cs as u8);
        ctrl0.set_address_bits(space as u8);
        ctrl0.set_xfer_count(count as u16);
        ctrl0
    }

    pub fn command_mode(&self) -> CommandMode {
        self.command_mode_bits().into()
    }

    pub fn address(&self) -> AddressSpace {
        self.address_bits().into()
    }
}

/// BCH operation requested through GPMI_ECCCTRL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EccCommand {
    Decode = 0,
    Encode = 1,
}

/// ECCCTRL buffer mask covering the full page (payload and auxiliary)
pub const BUFFER_MASK_PAGE: u16 = 0x1FF;
/// ECCCTRL buffer mask covering only the auxiliary buffer
pub const BUFFER_MASK_AUX_ONLY: u16 = 0x100;

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct EccCtrlReg(u32);
    impl Debug;
    pub u16, handle, set_handle: 31, 16;
    pub u8, ecc_cmd, set_ecc_cmd: 14, 13;
    pub enable_ecc, set_enable_ecc: 12;
    pub u16, buffer_mask, set_buffer_mask: 8, 0;
}

impl EccCtrlReg {
    pub fn page(cmd: EccCommand) -> Self {
        let mut reg = EccCtrlReg::default();
        reg.set_enable_ecc(true);
        reg.set_ecc_cmd(cmd as u8);
        reg.set_buffer_mask(BUFFER_MASK_PAGE);
        reg
    }

    pub fn encoding(&self) -> bool {
        self.ecc_cmd() == EccCommand::Encode as u8
    }
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct Timing0(u32);
    impl Debug;
    pub u8, address_setup, set_address_setup: 23, 16;
    pub u8, data_hold, set_data_hold: 15, 8;
    pub u8, data_setup, set_data_setup: 7, 0;
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct Timing1(u32);
    impl Debug;
    pub u16, busy_timeout, set_busy_timeout: 31, 16;
}

bitfield! {
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct Ctrl1(u32);
    impl Debug;
    pub u8, wrn_dly_sel, set_wrn_dly_sel: 23, 22;
    pub bch_mode, set_bch_mode: 18;
    pub dll_enable, set_dll_enable: 17;
    pub half_period, set_half_period: 16;
    pub u8, rdn_delay, set_rdn_delay: 15, 12;
    pub dev_reset, set_dev_reset: 3;
    pub ata_irqrdy_polarity, set_ata_irqrdy_polarity: 2;
    pub gpmi_mode, set_gpmi_mode: 0;
}

bitfield! {
    /// BCH_FLASH0LAYOUT0
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct BchLayout0(u32);
    impl Debug;
    pub u8, nblocks, set_nblocks: 31, 24;
    pub u8, meta_size, set_meta_size: 23, 16;
    pub u8, ecc0, set_ecc0: 15, 12;
    pub u16, data0_size, set_data0_size: 11, 0;
}

bitfield! {
    /// BCH_FLASH0LAYOUT1
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct BchLayout1(u32);
    impl Debug;
    pub u16, page_size, set_page_size: 31, 16;
    pub u8, eccn, set_eccn: 15, 12;
    pub u16, datan_size, set_datan_size: 11, 0;
}

#[test]
fn test_ctrl0_packing() {
    let ctrl0 = Ctrl0::new(CommandMode::Write, 1, AddressSpace::Cle, 3);
    assert_eq!(ctrl0.0, (1 << 23) | (1 << 20) | (1 << 17) | 3);
    assert_eq!(ctrl0.command_mode(), CommandMode::Write);
    assert_eq!(ctrl0.address(), AddressSpace::Cle);

    let ctrl0 = Ctrl0::new(CommandMode::WaitForReady, 0, AddressSpace::Data, 0);
    assert_eq!(ctrl0.command_mode(), CommandMode::WaitForReady);
}

#[test]
fn test_eccctrl_packing() {
    let reg = EccCtrlReg::page(EccCommand::Encode);
    assert_eq!(reg.0, (1 << 13) | (1 << 12) | 0x1FF);
    assert!(reg.encoding());
    assert!(!EccCtrlReg::page(EccCommand::Decode).encoding());
}
