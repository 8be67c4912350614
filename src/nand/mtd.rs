//! The composed NAND device: a scanned chip plus its bad block table, behind the [Mtd] interface

use log::{debug, info, warn};

use super::chip::{ChipOptions, NandChip};
use super::{EccStats, EraseInfo, Mtd, MtdInfo, MtdOobOps, NandTransport};
use crate::bbt::BbtManager;
use crate::config::BoardConfig;
use crate::error::{NandError, ReadStatus, Result};
use crate::platform::Delay;

/// A NAND device ready for use by filesystems and loaders
pub struct MtdDevice<T> {
    chip: NandChip<T>,
    bbt: Option<BbtManager>,
}

impl<T: NandTransport> MtdDevice<T> {
    /// Identify the chip(s) behind `transport`, set up ECC, and build the bad block table
    pub fn scan(transport: T, delay: Box<dyn Delay>, config: &BoardConfig) -> Result<Self> {
        let mut options = ChipOptions::empty();
        options.set(ChipOptions::USE_FLASH_BBT, config.use_flash_bbt);

        let mut chip = NandChip::new(transport, delay, config.ecc_mode, options);
        chip.chip_delay_us = config.chip_delay_us;
        chip.scan(config.chip_selects)?;

        let bbt = match config.scan_bbt {
            true => {
                let mut bbt = BbtManager::new(&chip, config)?;
                bbt.scan(&mut chip)?;
                Some(bbt)
            }
            false => None,
        };

        info!(
            "{} MiB NAND, {} byte pages, {} KiB blocks, {} bad",
            chip.size() >> 20,
            chip.writesize,
            chip.erasesize >> 10,
            chip.ecc_stats.badblocks
        );
        Ok(Self { chip, bbt })
    }

    pub fn chip(&self) -> &NandChip<T> {
        &self.chip
    }

    pub fn chip_mut(&mut self) -> &mut NandChip<T> {
        &mut self.chip
    }

    pub fn bbt(&self) -> Option<&BbtManager> {
        self.bbt.as_ref()
    }

    pub fn ecc_stats(&self) -> EccStats {
        self.chip.ecc_stats
    }

    pub fn suspend(&mut self) -> Result<()> {
        self.chip.suspend()
    }

    pub fn resume(&mut self) {
        self.chip.resume()
    }

    fn block_of(&self, ofs: u64) -> u32 {
        (ofs >> self.chip.bbt_erase_shift) as u32
    }

    /// Is the block at `ofs` bad? Without a table the factory marker is read.
    fn isbad(
        chip: &mut NandChip<T>,
        bbt: Option<&BbtManager>,
        ofs: u64,
        allow_bbt: bool,
    ) -> Result<bool> {
        match bbt {
            Some(bbt) => Ok(bbt.is_bad((ofs >> chip.bbt_erase_shift) as u32, allow_bbt)),
            None => chip.block_bad_marker(ofs),
        }
    }

    fn check_block(&self, ofs: u64) -> Result<()> {
        if ofs >= self.chip.size() {
            debug!("block offset {ofs:#x} beyond end of device");
            return Err(NandError::InvalidArgument);
        }
        Ok(())
    }
}

impl<T: NandTransport> Mtd for MtdDevice<T> {
    fn info(&self) -> MtdInfo {
        MtdInfo {
            size: self.chip.size(),
            erasesize: self.chip.erasesize,
            writesize: self.chip.writesize,
            oobsize: self.chip.oobsize,
            oobavail: self.chip.oobavail(),
            numchips: self.chip.numchips,
        }
    }

    fn read(&mut self, from: u64, buf: &mut [u8]) -> Result<(usize, ReadStatus)> {
        self.chip.read(from, buf)
    }

    fn write(&mut self, to: u64, buf: &[u8]) -> Result<usize> {
        self.chip.write(to, buf)
    }

    fn erase(&mut self, instr: &mut EraseInfo) -> Result<()> {
        let Self { chip, bbt } = self;
        let bbt = bbt.as_ref();
        chip.erase_range(instr, false, |chip, ofs, allow_bbt| {
            Self::isbad(chip, bbt, ofs, allow_bbt)
        })
    }

    fn read_oob(&mut self, from: u64, ops: &mut MtdOobOps<&mut [u8]>) -> Result<ReadStatus> {
        self.chip.read_oob(from, ops)
    }

    fn write_oob(&mut self, to: u64, ops: &mut MtdOobOps<&[u8]>) -> Result<()> {
        self.chip.write_oob(to, ops)
    }

    fn block_isbad(&mut self, ofs: u64) -> Result<bool> {
        self.check_block(ofs)?;
        Self::isbad(&mut self.chip, self.bbt.as_ref(), ofs, false)
    }

    /// Mark a block bad in the table and on the block itself. Marking a block that is already bad
    /// changes nothing.
    fn block_markbad(&mut self, ofs: u64) -> Result<()> {
        self.check_block(ofs)?;
        if self.block_isbad(ofs)? {
            debug!("block at {ofs:#x} is already bad");
            return Ok(());
        }

        let block = self.block_of(ofs);
        let flash_bbt = self.chip.options.contains(ChipOptions::USE_FLASH_BBT);
        if let Some(bbt) = self.bbt.as_mut() {
            bbt.mark_worn(block);
        }

        let marked = self.chip.write_bad_marker(ofs);
        match (&marked, flash_bbt) {
            (Err(e), true) => warn!("could not write bad block marker at {ofs:#x}: {e}"),
            (Err(_), false) => return marked,
            _ => {}
        }

        if let (Some(bbt), true) = (self.bbt.as_mut(), flash_bbt) {
            bbt.update(&mut self.chip, ofs)?;
        }

        self.chip.ecc_stats.badblocks += 1;
        info!("block {block} marked bad");
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.chip.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bbt::BlockCode;
    use crate::nand::{NandLayout, OobMode};
    use crate::platform::NoDelay;
    use crate::sim::{SimFlash, SimNandBus, SimNandSystem};
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use rstest::rstest;

    const LAYOUT: NandLayout = NandLayout {
        blocks: 1024,
        pages_per_block: 64,
        bytes_per_page: 2048,
    };
    const BLOCK: u64 = 64 * 2048;

    fn flash() -> SimFlash {
        SimFlash::from_layout(LAYOUT, 64).unwrap()
    }

    fn system(flash: SimFlash) -> SimNandSystem {
        SimNandSystem::build(&BoardConfig::default(), vec![flash]).unwrap()
    }

    /// Table blocks with the default table placement
    const MAIN_BLOCK: u32 = 1023;
    const MIRROR_BLOCK: u32 = 1022;

    /// Replace a block of `to` with the same block of `from`, including what the ECC engine stored
    fn copy_block(from: &SimFlash, to: &mut SimFlash, block: u32) {
        assert!(to.erase(block));
        let ppb = from.pages_per_block();
        let mut raw = vec![0; from.raw_page_size()];
        for page in block * ppb..(block + 1) * ppb {
            from.read_page(page, &mut raw);
            assert!(to.program(page, &raw));
            if let Some(shadow) = from.shadow(page) {
                to.set_shadow(page, shadow.to_vec());
            }
        }
    }

    fn random_page(rng: &mut SmallRng) -> Vec<u8> {
        let mut page = vec![0; 2048];
        rng.fill(&mut page[..]);
        page
    }

    #[test]
    fn test_scan_geometry() {
        let sys = system(flash());
        let info = sys.mtd.info();
        assert_eq!(info.size, LAYOUT.total_size());
        assert_eq!(info.erasesize, 64 * 2048);
        assert_eq!(info.writesize, 2048);
        assert_eq!(info.oobsize, 64);
        assert_eq!(info.blocks(), 1024);
        assert!(sys.mtd.bbt().is_some());
    }

    #[test]
    fn test_hello_page() -> anyhow::Result<()> {
        let mut sys = system(flash());
        let mut page = vec![0xFF; 2048];
        page[..5].copy_from_slice(b"HELLO");
        assert_eq!(sys.mtd.write(0, &page)?, 2048);

        let mut out = vec![0; 2048];
        let (len, status) = sys.mtd.read(0, &mut out)?;
        assert_eq!(len, 2048);
        assert_eq!(status, ReadStatus::Ok);
        assert!(out.starts_with(b"HELLO"));

        // Erasing the block brings the page back to all ones
        sys.mtd.erase(&mut EraseInfo::new(0, BLOCK))?;
        let (_, status) = sys.mtd.read(0, &mut out)?;
        assert_eq!(status, ReadStatus::Ok);
        assert!(out.iter().all(|&b| b == 0xFF));
        Ok(())
    }

    #[test]
    fn test_multi_page_round_trip() -> anyhow::Result<()> {
        let mut sys = system(flash());
        let mut rng = SmallRng::seed_from_u64(0x5EED);
        let data: Vec<u8> = (0..70).flat_map(|_| random_page(&mut rng)).collect();

        // Spans a block boundary
        let start = 3 * BLOCK + 60 * 2048;
        assert_eq!(sys.mtd.write(start, &data)?, data.len());

        let mut out = vec![0; data.len()];
        let (len, status) = sys.mtd.read(start, &mut out)?;
        assert_eq!(len, data.len());
        assert_eq!(status, ReadStatus::Ok);
        assert!(out == data);
        Ok(())
    }

    #[test]
    fn test_partial_page_write() -> anyhow::Result<()> {
        let mut sys = system(flash());
        let page = 7 * 2048;
        sys.mtd.write(page + 100, b"abcde")?;

        let mut data = vec![0; 2048];
        let mut oob = vec![0; sys.mtd.info().oobavail];
        let mut ops = MtdOobOps::new(OobMode::Auto, Some(&mut data[..]), Some(&mut oob[..]));
        assert_eq!(sys.mtd.read_oob(page, &mut ops)?, ReadStatus::Ok);

        assert!(data[..100].iter().all(|&b| b == 0xFF));
        assert_eq!(&data[100..105], b"abcde");
        assert!(data[105..].iter().all(|&b| b == 0xFF));
        assert!(oob.iter().all(|&b| b == 0xFF));

        // Reading the tail of the page on its own agrees
        let mut tail = [0; 8];
        sys.mtd.read(page + 98, &mut tail)?;
        assert_eq!(&tail, b"\xFF\xFFabcde\xFF");
        Ok(())
    }

    #[test]
    fn test_ecc_boundary() -> anyhow::Result<()> {
        let mut sys = system(flash());
        let strength = sys.mtd.chip().ecc.strength;
        assert_eq!(strength, 8);

        let before = sys.mtd.ecc_stats();
        let mut rng = SmallRng::seed_from_u64(11);
        let good = random_page(&mut rng);
        let bad = random_page(&mut rng);
        sys.mtd.write(10 * 2048, &good)?;
        sys.mtd.write(11 * 2048, &bad)?;

        {
            let mut flash = sys.soc.flash(0).unwrap();
            for n in 0..strength {
                flash.flip_bit(10, (600 + n) * 8);
            }
            for n in 0..=strength {
                flash.flip_bit(11, (600 + n) * 8 + 5);
            }
        }

        let mut out = vec![0; 2048];
        assert_eq!(sys.mtd.read(10 * 2048, &mut out)?.1, ReadStatus::Corrected);
        assert!(out == good);
        assert_eq!(sys.mtd.ecc_stats().corrected - before.corrected, strength as u32);

        assert_eq!(
            sys.mtd.read(11 * 2048, &mut out)?.1,
            ReadStatus::Uncorrectable
        );
        assert!(out != bad);
        assert_eq!(sys.mtd.ecc_stats().failed - before.failed, 1);
        Ok(())
    }

    #[test]
    fn test_markbad_idempotent() -> anyhow::Result<()> {
        let mut sys = system(flash());
        let before = sys.mtd.ecc_stats().badblocks;

        sys.mtd.block_markbad(12 * BLOCK)?;
        assert!(sys.mtd.block_isbad(12 * BLOCK)?);
        assert_eq!(sys.mtd.ecc_stats().badblocks, before + 1);
        let version = sys.mtd.bbt().unwrap().main_table().unwrap().version.clone();

        sys.mtd.block_markbad(12 * BLOCK + 2048)?;
        assert_eq!(sys.mtd.ecc_stats().badblocks, before + 1);
        assert_eq!(
            sys.mtd.bbt().unwrap().main_table().unwrap().version,
            version
        );
        assert_eq!(sys.mtd.bbt().unwrap().bbt.get(12), BlockCode::Worn);
        Ok(())
    }

    #[test]
    fn test_bbt_survives_reboot() -> anyhow::Result<()> {
        let mut flash = flash();
        flash.set_factory_bad(37)?;
        let config = BoardConfig::default();
        let mut sys = system(flash);
        assert_eq!(sys.mtd.bbt().unwrap().bbt.get(37), BlockCode::Factory);

        sys.mtd.block_markbad(100 * BLOCK)?;
        sys.mtd.block_markbad(101 * BLOCK)?;
        let map = sys.mtd.bbt().unwrap().bbt.clone();
        let version = sys.mtd.bbt().unwrap().main_table().unwrap().version.clone();
        assert!(version[0] > 1);

        let mut sys = sys.reboot(&config)?;
        let bbt = sys.mtd.bbt().unwrap();
        assert_eq!(bbt.bbt, map);
        assert_eq!(bbt.main_table().unwrap().version, version);
        assert_eq!(bbt.mirror_table().unwrap().version, version);
        assert!(sys.mtd.block_isbad(37 * BLOCK)?);
        assert!(sys.mtd.block_isbad(101 * BLOCK)?);
        assert!(!sys.mtd.block_isbad(102 * BLOCK)?);
        Ok(())
    }

    #[test]
    fn test_factory_bad_without_table() -> anyhow::Result<()> {
        let mut flash = flash();
        flash.set_factory_bad(5)?;
        let config = BoardConfig {
            scan_bbt: false,
            use_flash_bbt: false,
            ..Default::default()
        };
        let mut sys = SimNandSystem::build(&config, vec![flash])?;
        assert!(sys.mtd.bbt().is_none());
        assert!(sys.mtd.block_isbad(5 * BLOCK)?);
        assert!(!sys.mtd.block_isbad(6 * BLOCK)?);

        // Without a table the marker itself records the block
        sys.mtd.block_markbad(6 * BLOCK)?;
        assert!(sys.mtd.block_isbad(6 * BLOCK)?);
        Ok(())
    }

    #[test]
    fn test_erase_stops_at_bad_block() -> anyhow::Result<()> {
        let mut sys = system(flash());
        let mut rng = SmallRng::seed_from_u64(3);
        let page = random_page(&mut rng);
        for block in [3, 4, 6, 8] {
            sys.mtd.write(block * BLOCK, &page)?;
        }
        sys.mtd.block_markbad(5 * BLOCK)?;

        let mut instr = EraseInfo::new(3 * BLOCK, 4 * BLOCK);
        assert_eq!(
            sys.mtd.erase(&mut instr),
            Err(NandError::BadBlock { offset: 5 * BLOCK })
        );
        assert_eq!(instr.fail_addr, Some(5 * BLOCK));
        assert_eq!(instr.state, crate::nand::EraseState::Failed);

        let mut out = vec![0; 2048];
        for block in [3, 4] {
            sys.mtd.read(block * BLOCK, &mut out)?;
            assert!(out.iter().all(|&b| b == 0xFF));
        }
        for block in [6, 8] {
            sys.mtd.read(block * BLOCK, &mut out)?;
            assert!(out == page);
        }
        Ok(())
    }

    #[test]
    fn test_out_of_range() {
        let mut sys = system(flash());
        let size = sys.mtd.info().size;
        assert_eq!(sys.mtd.block_isbad(size), Err(NandError::InvalidArgument));
        assert_eq!(
            sys.mtd.erase(&mut EraseInfo::new(size - BLOCK, 2 * BLOCK)),
            Err(NandError::InvalidArgument)
        );
        assert_eq!(
            sys.mtd.erase(&mut EraseInfo::new(100, BLOCK)),
            Err(NandError::InvalidArgument)
        );
    }

    #[test]
    fn test_write_protected() -> anyhow::Result<()> {
        let mut flash = flash();
        flash.set_write_protected(true);
        let config = BoardConfig {
            use_flash_bbt: false,
            ..Default::default()
        };
        let mut sys = SimNandSystem::build(&config, vec![flash])?;
        assert_eq!(sys.mtd.write(0, &[0; 2048]), Err(NandError::WriteProtected));
        assert_eq!(
            sys.mtd.erase(&mut EraseInfo::new(0, BLOCK)),
            Err(NandError::WriteProtected)
        );
        Ok(())
    }

    #[test]
    fn test_soft_ecc_over_bus() -> anyhow::Result<()> {
        let config = BoardConfig {
            ecc_mode: crate::nand::EccMode::Soft,
            ..Default::default()
        };
        let bus = SimNandBus::new(flash());
        let mut mtd = MtdDevice::scan(bus, Box::new(NoDelay::default()), &config)?;

        let mut rng = SmallRng::seed_from_u64(21);
        let page = random_page(&mut rng);
        mtd.write(2048, &page)?;

        let mut out = vec![0; 2048];
        assert_eq!(mtd.read(2048, &mut out)?.1, ReadStatus::Ok);
        assert!(out == page);

        mtd.chip_mut().transport_mut().flash_mut().flip_bit(1, 300 * 8 + 2);
        assert_eq!(mtd.read(2048, &mut out)?.1, ReadStatus::Corrected);
        assert!(out == page);
        Ok(())
    }

    #[test]
    fn test_raw_read_bypasses_page_cache() -> anyhow::Result<()> {
        let mut sys = system(flash());
        sys.mtd.write(20 * 2048, &[0x11; 2048])?;
        sys.soc.flash(0).unwrap().flip_bit(20, 10 * 8);

        let mut raw = vec![0; 100];
        let mut ops = MtdOobOps::new(OobMode::Raw, Some(&mut raw[..]), None);
        sys.mtd.read_oob(20 * 2048, &mut ops)?;
        assert_eq!(raw[10], 0x10);

        // The same partial page read with ECC must see the flipped bit and correct it
        let mut out = vec![0; 100];
        let (len, status) = sys.mtd.read(20 * 2048, &mut out)?;
        assert_eq!(len, 100);
        assert_eq!(status, ReadStatus::Corrected);
        assert!(out.iter().all(|&b| b == 0x11));

        // A cached ECC read is not replaced by a raw one either
        sys.mtd.read_oob(20 * 2048, &mut MtdOobOps::new(OobMode::Raw, Some(&mut raw[..]), None))?;
        sys.mtd.read(20 * 2048, &mut out)?;
        assert_eq!(out[10], 0x11);
        Ok(())
    }

    #[test]
    fn test_oob_with_data_must_fit() -> anyhow::Result<()> {
        let mut sys = system(flash());
        let data = vec![0x5A; 2 * 2048];

        let oob = [0; 4];
        let mut ops =
            MtdOobOps::new(OobMode::Place, Some(&data[..]), Some(&oob[..])).with_ooboffs(64);
        assert_eq!(
            sys.mtd.write_oob(30 * 2048, &mut ops),
            Err(NandError::InvalidArgument)
        );

        // Two pages hold at most two spare areas
        let oob = vec![0; 2 * 64 + 1];
        let mut ops = MtdOobOps::new(OobMode::Place, Some(&data[..]), Some(&oob[..]));
        assert_eq!(
            sys.mtd.write_oob(30 * 2048, &mut ops),
            Err(NandError::InvalidArgument)
        );

        let mut out = vec![0; 2 * 2048];
        sys.mtd.read(30 * 2048, &mut out)?;
        assert!(out.iter().all(|&b| b == 0xFF));
        Ok(())
    }

    #[test]
    fn test_suspend_blocks_io() -> anyhow::Result<()> {
        let mut sys = system(flash());
        sys.mtd.suspend()?;

        let mut out = vec![0; 2048];
        assert_eq!(sys.mtd.read(0, &mut out), Err(NandError::Busy));
        assert_eq!(sys.mtd.write(0, &out), Err(NandError::Busy));
        assert_eq!(sys.mtd.sync(), Err(NandError::Busy));
        assert_eq!(sys.mtd.suspend(), Err(NandError::Busy));

        sys.mtd.resume();
        assert_eq!(sys.mtd.read(0, &mut out)?, (2048, ReadStatus::Ok));
        assert_eq!(sys.mtd.write(0, &out)?, 2048);
        Ok(())
    }

    #[test]
    fn test_missing_mirror_regenerated() -> anyhow::Result<()> {
        let config = BoardConfig::default();
        let mut sys = system(flash());
        sys.mtd.block_markbad(50 * BLOCK)?;
        let map = sys.mtd.bbt().unwrap().bbt.clone();

        assert!(sys.soc.flash(0).unwrap().erase(MIRROR_BLOCK));
        let sys = sys.reboot(&config)?;
        let bbt = sys.mtd.bbt().unwrap();
        assert_eq!(bbt.bbt, map);
        assert_eq!(bbt.main_table().unwrap().version, [2]);
        assert_eq!(bbt.mirror_table().unwrap().version, [2]);
        assert_eq!(bbt.mirror_table().unwrap().pages, [Some(MIRROR_BLOCK * 64)]);

        // The mirror is back on flash
        let sys = sys.reboot(&config)?;
        let bbt = sys.mtd.bbt().unwrap();
        assert_eq!(bbt.mirror_table().unwrap().pages, [Some(MIRROR_BLOCK * 64)]);
        assert_eq!(bbt.mirror_table().unwrap().version, [2]);
        assert_eq!(bbt.bbt.get(50), BlockCode::Worn);
        Ok(())
    }

    #[test]
    fn test_newer_mirror_wins() -> anyhow::Result<()> {
        let config = BoardConfig::default();
        let mut sys = system(flash());
        let stale = sys.soc.flash(0).unwrap().clone();

        sys.mtd.block_markbad(60 * BLOCK)?;
        let map = sys.mtd.bbt().unwrap().bbt.clone();
        copy_block(&stale, &mut sys.soc.flash(0).unwrap(), MAIN_BLOCK);

        let sys = sys.reboot(&config)?;
        let bbt = sys.mtd.bbt().unwrap();
        assert_eq!(bbt.bbt, map);
        assert_eq!(bbt.bbt.get(60), BlockCode::Worn);
        assert_eq!(bbt.main_table().unwrap().version, [2]);
        assert_eq!(bbt.mirror_table().unwrap().version, [2]);

        // The stale main table was rewritten in place
        let sys = sys.reboot(&config)?;
        let bbt = sys.mtd.bbt().unwrap();
        assert_eq!(bbt.main_table().unwrap().pages, [Some(MAIN_BLOCK * 64)]);
        assert_eq!(bbt.main_table().unwrap().version, [2]);
        assert_eq!(bbt.bbt, map);
        Ok(())
    }

    #[test]
    fn test_no_space_for_table() -> anyhow::Result<()> {
        let mut flash = flash();
        for block in 1020..1024 {
            flash.set_factory_bad(block)?;
        }
        let result = SimNandSystem::build(&BoardConfig::default(), vec![flash]);
        assert_eq!(result.err(), Some(NandError::NoSpace));
        Ok(())
    }

    #[test]
    fn test_table_block_contents_saved() -> anyhow::Result<()> {
        let config = BoardConfig {
            bbt_save_content: true,
            ..Default::default()
        };
        let mut sys = SimNandSystem::build(&config, vec![flash()])?;
        let mut rng = SmallRng::seed_from_u64(0xB0B);
        let page = random_page(&mut rng);
        let ofs = u64::from(MAIN_BLOCK) * BLOCK + 10 * 2048;
        sys.mtd.write(ofs, &page)?;

        // Rewriting the table erases its block
        sys.mtd.block_markbad(200 * BLOCK)?;
        let mut out = vec![0; 2048];
        assert_eq!(sys.mtd.read(ofs, &mut out)?.1, ReadStatus::Ok);
        assert!(out == page);

        let map = sys.mtd.bbt().unwrap().bbt.clone();
        let mut sys = sys.reboot(&config)?;
        assert_eq!(sys.mtd.bbt().unwrap().bbt, map);
        assert_eq!(sys.mtd.bbt().unwrap().main_table().unwrap().version, [2]);
        sys.mtd.read(ofs, &mut out)?;
        assert!(out == page);
        Ok(())
    }

    #[test]
    fn test_table_per_chip() -> anyhow::Result<()> {
        let config = BoardConfig {
            chip_selects: 2,
            ..Default::default()
        };
        let mut second = flash();
        second.set_factory_bad(9)?;
        let mut sys = SimNandSystem::build(&config, vec![flash(), second])?;
        assert_eq!(sys.mtd.info().numchips, 2);

        sys.mtd.block_markbad(1500 * BLOCK)?;
        let bbt = sys.mtd.bbt().unwrap();
        assert_eq!(bbt.bbt.get(1024 + 9), BlockCode::Factory);
        assert_eq!(bbt.bbt.get(1500), BlockCode::Worn);
        // Only the second chip's tables changed
        assert_eq!(bbt.main_table().unwrap().version, [1, 2]);
        assert_eq!(bbt.mirror_table().unwrap().version, [1, 2]);
        assert_eq!(
            bbt.main_table().unwrap().pages,
            [Some(MAIN_BLOCK * 64), Some((1024 + MAIN_BLOCK) * 64)]
        );
        let map = bbt.bbt.clone();

        let sys = sys.reboot(&config)?;
        let bbt = sys.mtd.bbt().unwrap();
        assert_eq!(bbt.bbt, map);
        assert_eq!(bbt.main_table().unwrap().version, [1, 2]);
        assert_eq!(
            bbt.mirror_table().unwrap().pages,
            [Some(MIRROR_BLOCK * 64), Some((1024 + MIRROR_BLOCK) * 64)]
        );
        Ok(())
    }

    #[test]
    fn test_table_at_start_of_chip() -> anyhow::Result<()> {
        let config = BoardConfig {
            bbt_last_block: false,
            ..Default::default()
        };
        let mut sys = SimNandSystem::build(&config, vec![flash()])?;
        let bbt = sys.mtd.bbt().unwrap();
        assert_eq!(bbt.main_table().unwrap().pages, [Some(0)]);
        assert_eq!(bbt.mirror_table().unwrap().pages, [Some(64)]);
        assert!((0..4).all(|block| bbt.bbt.get(block) == BlockCode::Reserved));
        assert_eq!(bbt.bbt.get(4), BlockCode::Good);

        assert_eq!(
            sys.mtd.erase(&mut EraseInfo::new(0, BLOCK)),
            Err(NandError::BadBlock { offset: 0 })
        );

        sys.mtd.block_markbad(10 * BLOCK)?;
        let map = sys.mtd.bbt().unwrap().bbt.clone();
        let sys = sys.reboot(&config)?;
        let bbt = sys.mtd.bbt().unwrap();
        assert_eq!(bbt.bbt, map);
        assert_eq!(bbt.main_table().unwrap().pages, [Some(0)]);
        Ok(())
    }

    #[rstest]
    #[case(4)]
    #[case(8)]
    fn test_wide_table_entries(#[case] bits: u8) -> anyhow::Result<()> {
        let config = BoardConfig {
            bbt_bits: bits,
            ..Default::default()
        };
        let mut flash = flash();
        flash.set_factory_bad(37)?;
        let mut sys = SimNandSystem::build(&config, vec![flash])?;
        sys.mtd.block_markbad(700 * BLOCK)?;
        let map = sys.mtd.bbt().unwrap().bbt.clone();

        let sys = sys.reboot(&config)?;
        let bbt = sys.mtd.bbt().unwrap();
        assert_eq!(bbt.bbt, map);
        assert_eq!(bbt.bbt.get(37), BlockCode::Factory);
        assert_eq!(bbt.bbt.get(700), BlockCode::Worn);
        assert_eq!(sys.mtd.ecc_stats().badblocks, 2);
        Ok(())
    }

    #[test]
    fn test_uncorrectable_table_still_used() -> anyhow::Result<()> {
        let config = BoardConfig::default();
        let mut flash = flash();
        flash.set_factory_bad(37)?;
        let mut sys = SimNandSystem::build(&config, vec![flash])?;
        sys.mtd.block_markbad(40 * BLOCK)?;
        let map = sys.mtd.bbt().unwrap().bbt.clone();

        // Wreck the second ECC step of the main table page; the entries live in the first
        {
            let mut flash = sys.soc.flash(0).unwrap();
            for n in 0..9 {
                flash.flip_bit(MAIN_BLOCK * 64, (600 + n) * 8);
            }
        }

        let sys = sys.reboot(&config)?;
        assert!(sys.mtd.ecc_stats().failed >= 1);
        let bbt = sys.mtd.bbt().unwrap();
        assert_eq!(bbt.bbt, map);
        assert_eq!(bbt.bbt.get(37), BlockCode::Factory);
        assert_eq!(bbt.bbt.get(40), BlockCode::Worn);
        Ok(())
    }
}
