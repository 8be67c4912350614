//! The NAND side of the bus: a command decoder driving a [SimFlash] the way a real part's
//! interface logic would.

use log::{trace, warn};

use super::flash::SimFlash;
use crate::error::{NandError, Result};
use crate::nand::{CtrlFlags, NandCommand, NandStatus, NandTransport};

/// What a data-out cycle returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    None,
    Id,
    Status,
    /// The page register, from a column
    Register,
}

/// One NAND chip on the bus
#[derive(Debug)]
pub struct SimNandBus {
    flash: SimFlash,

    cmd: Option<NandCommand>,
    addr: Vec<u8>,
    output: Output,

    /// Small-page region pointer set by READ0, READ1 and READOOB
    pointer: usize,
    column: usize,
    row: u32,

    /// Page data and spare area, as last loaded or being filled for a program
    register: Vec<u8>,
    /// Page whose contents are in the register
    loaded: Option<u32>,
    /// What the ECC engine stored into the register, recorded at program time
    pending_shadow: Option<Vec<u8>>,
    last_failed: bool,
}

impl SimNandBus {
    pub fn new(flash: SimFlash) -> Self {
        let size = flash.raw_page_size();
        Self {
            flash,
            cmd: None,
            addr: Vec::new(),
            output: Output::None,
            pointer: 0,
            column: 0,
            row: 0,
            register: vec![0xFF; size],
            loaded: None,
            pending_shadow: None,
            last_failed: false,
        }
    }

    pub fn flash(&self) -> &SimFlash {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut SimFlash {
        &mut self.flash
    }

    pub fn into_flash(self) -> SimFlash {
        self.flash
    }

    /// The simulated part is never busy: every operation completes within its command cycle
    pub fn ready(&self) -> bool {
        true
    }

    fn large_page(&self) -> bool {
        self.flash.geometry().writesize > 512
    }

    fn column_cycles(&self) -> usize {
        match self.large_page() {
            true => 2,
            false => 1,
        }
    }

    fn row_cycles(&self) -> usize {
        let threshold = match self.large_page() {
            true => 128 << 20,
            false => 32 << 20,
        };
        match self.flash.geometry().chipsize > threshold {
            true => 3,
            false => 2,
        }
    }

    /// Address cycles the current command takes before it acts
    fn address_cycles(&self) -> Option<usize> {
        use NandCommand::*;
        match self.cmd? {
            ReadId => Some(1),
            Read0 | Read1 | ReadOob | SeqIn => Some(self.column_cycles() + self.row_cycles()),
            Erase1 => Some(self.row_cycles()),
            RndOut | RndIn => Some(2),
            _ => None,
        }
    }

    /// Latch a byte on CLE
    pub fn command(&mut self, byte: u8) {
        let Ok(cmd) = NandCommand::try_from(byte) else {
            warn!("simulated NAND ignoring unknown command {byte:#04x}");
            return;
        };
        trace!("simulated NAND command {cmd:?}");
        self.addr.clear();

        use NandCommand::*;
        match cmd {
            Reset => {
                self.cmd = None;
                self.output = Output::None;
                self.pointer = 0;
                self.last_failed = false;
                return;
            }
            Status => {
                self.output = Output::Status;
                return;
            }
            Read0 | Read1 | ReadOob if !self.large_page() => {
                self.pointer = match cmd {
                    Read0 => 0,
                    Read1 => 256,
                    _ => self.flash.geometry().writesize,
                };
            }
            ReadStart => {
                if self.cmd == Some(Read0) {
                    self.load_page();
                }
                self.cmd = None;
                return;
            }
            RndOutStart => {
                self.output = Output::Register;
                self.cmd = None;
                return;
            }
            SeqIn => {
                self.register.fill(0xFF);
                self.pending_shadow = None;
            }
            PageProg | CachedProg => {
                self.program();
                self.cmd = None;
                return;
            }
            Erase2 => {
                if self.cmd == Some(Erase1) {
                    let block = self.row / self.flash.pages_per_block();
                    self.last_failed = !self.flash.erase(block);
                    self.loaded = None;
                }
                self.cmd = None;
                return;
            }
            _ => {}
        }
        self.cmd = Some(cmd);
    }

    /// Latch a byte on ALE
    pub fn address(&mut self, byte: u8) {
        let Some(cycles) = self.address_cycles() else {
            warn!("simulated NAND ignoring address byte {byte:#04x}");
            return;
        };
        self.addr.push(byte);
        if self.addr.len() == cycles {
            self.address_complete();
        }
    }

    fn address_complete(&mut self) {
        use NandCommand::*;
        let Some(cmd) = self.cmd else {
            return;
        };
        let le = |bytes: &[u8]| {
            bytes
                .iter()
                .rev()
                .fold(0u32, |acc, &b| (acc << 8) | u32::from(b))
        };

        match cmd {
            ReadId => {
                self.output = Output::Id;
                self.column = 0;
            }
            Erase1 => self.row = le(&self.addr),
            RndOut | RndIn => self.column = le(&self.addr) as usize,
            Read0 | Read1 | ReadOob | SeqIn => {
                let (col, row) = self.addr.split_at(self.column_cycles());
                self.column = le(col) as usize;
                self.row = le(row);
                if !self.large_page() {
                    self.column += std::mem::take(&mut self.pointer);
                    if cmd != SeqIn {
                        // Small-page parts start the array read as soon as the address is in
                        self.load_page();
                        self.cmd = None;
                    }
                }
            }
            _ => {}
        }
    }

    fn load_page(&mut self) {
        self.flash.read_page(self.row, &mut self.register);
        self.loaded = Some(self.row);
        self.output = Output::Register;
    }

    fn program(&mut self) {
        if self.cmd != Some(NandCommand::SeqIn) {
            warn!("simulated NAND: program without SEQIN");
            self.last_failed = true;
            return;
        }
        self.last_failed = !self.flash.program(self.row, &self.register);
        if let (false, Some(shadow)) = (self.last_failed, self.pending_shadow.take()) {
            self.flash.set_shadow(self.row, shadow);
        }
        if self.loaded == Some(self.row) {
            self.loaded = None;
        }
    }

    /// Data-out cycles
    pub fn read(&mut self, buf: &mut [u8]) {
        match self.output {
            Output::None => buf.fill(0xFF),
            Output::Id => {
                let id = self.flash.id();
                for byte in buf.iter_mut() {
                    *byte = id.get(self.column).copied().unwrap_or(0);
                    self.column += 1;
                }
            }
            Output::Status => {
                let mut status = NandStatus::READY;
                status.set(NandStatus::WP, !self.flash.is_write_protected());
                status.set(NandStatus::FAIL, self.last_failed);
                buf.fill(status.bits());
            }
            Output::Register => {
                let src = self.register.get(self.column..).unwrap_or_default();
                let n = src.len().min(buf.len());
                buf[..n].copy_from_slice(&src[..n]);
                buf[n..].fill(0xFF);
                self.column += buf.len();
            }
        }
    }

    /// Data-in cycles into the page register
    pub fn write(&mut self, buf: &[u8]) {
        if !matches!(self.cmd, Some(NandCommand::SeqIn)) {
            warn!("simulated NAND ignoring {} data bytes", buf.len());
            return;
        }
        let dst = self.register.get_mut(self.column..).unwrap_or_default();
        let n = dst.len().min(buf.len());
        dst[..n].copy_from_slice(&buf[..n]);
        self.column += buf.len();
    }

    /// The page last read into the register, and what the ECC engine stored there
    pub fn loaded_shadow(&self) -> Option<&[u8]> {
        self.flash.shadow(self.loaded?)
    }

    /// Record what the ECC engine is storing with the page being programmed
    pub fn set_pending_shadow(&mut self, shadow: Vec<u8>) {
        self.pending_shadow = Some(shadow);
    }
}

/// Direct access, with no controller in between
impl NandTransport for SimNandBus {
    fn select_chip(&mut self, chip: Option<usize>) -> Result<()> {
        match chip {
            None | Some(0) => Ok(()),
            Some(_) => Err(NandError::NoDevice),
        }
    }

    fn cmd_ctrl(&mut self, byte: Option<u8>, ctrl: CtrlFlags) -> Result<()> {
        match byte {
            Some(byte) if ctrl.contains(CtrlFlags::CLE) => self.command(byte),
            Some(byte) if ctrl.contains(CtrlFlags::ALE) => self.address(byte),
            _ => {}
        }
        Ok(())
    }

    fn dev_ready(&mut self) -> Result<Option<bool>> {
        Ok(Some(self.ready()))
    }

    fn read_buf(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read(buf);
        Ok(())
    }

    fn write_buf(&mut self, buf: &[u8]) -> Result<()> {
        self.write(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nand::NandLayout;

    fn bus(bytes_per_page: usize, oob: usize, pages_per_block: u32) -> SimNandBus {
        let layout = NandLayout {
            blocks: 1024,
            pages_per_block,
            bytes_per_page,
        };
        SimNandBus::new(SimFlash::from_layout(layout, oob).unwrap())
    }

    #[test]
    fn test_read_id() {
        let mut bus = bus(2048, 64, 64);
        bus.command(0x90);
        bus.address(0x00);
        let mut id = [0; 4];
        bus.read(&mut id);
        assert_eq!(id, [0x98, 0xF1, 0x00, 0x15]);
    }

    #[test]
    fn test_large_page_program_and_read() {
        let mut bus = bus(2048, 64, 64);
        // SEQIN, column 0, page 0x41
        bus.command(0x80);
        for b in [0x00, 0x00, 0x41, 0x00] {
            bus.address(b);
        }
        bus.write(b"HELLO");
        bus.command(0x10);

        bus.command(0x70);
        let mut status = [0];
        bus.read(&mut status);
        assert_eq!(status[0], 0xC0);

        // READ0 at column 1, READSTART
        bus.command(0x00);
        for b in [0x01, 0x00, 0x41, 0x00] {
            bus.address(b);
        }
        bus.command(0x30);
        let mut out = [0; 5];
        bus.read(&mut out);
        assert_eq!(&out, b"ELLO\xff");

        // RNDOUT back to column 0
        bus.command(0x05);
        bus.address(0x00);
        bus.address(0x00);
        bus.command(0xE0);
        bus.read(&mut out[..1]);
        assert_eq!(out[0], b'H');
    }

    #[test]
    fn test_small_page_oob_pointer() {
        let mut bus = bus(512, 16, 32);
        bus.flash_mut().set_factory_bad(1).unwrap();

        // READOOB, column 5, page 32
        bus.command(0x50);
        for b in [0x05, 0x20, 0x00] {
            bus.address(b);
        }
        let mut marker = [0xAA];
        bus.read(&mut marker);
        assert_eq!(marker[0], 0x00);

        // The pointer does not outlive the command
        bus.command(0x00);
        for b in [0x00, 0x20, 0x00] {
            bus.address(b);
        }
        let mut data = [0; 4];
        bus.read(&mut data);
        assert_eq!(data, [0xFF; 4]);
    }

    #[test]
    fn test_erase_and_failure_status() {
        let mut bus = bus(2048, 64, 64);
        bus.flash_mut().fail_erase(1);

        bus.command(0x60);
        for b in [0x40, 0x00] {
            bus.address(b);
        }
        bus.command(0xD0);
        bus.command(0x70);
        let mut status = [0];
        bus.read(&mut status);
        assert_eq!(NandStatus::from_bits_retain(status[0]) & NandStatus::FAIL, NandStatus::FAIL);

        bus.flash_mut().set_write_protected(true);
        bus.command(0xFF);
        bus.command(0x70);
        bus.read(&mut status);
        assert_eq!(status[0], 0x40);
    }
}
