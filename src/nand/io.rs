//! Page loops behind the MTD operations: reads and writes spanning pages and chips, OOB
//! transfers, and block erase

use log::{debug, error, warn};

use super::chip::{ChipOptions, ChipState, NandChip};
use super::{EraseInfo, EraseState, MtdOobOps, NandStatus, NandTransport, OobMode};
use crate::error::{NandError, ReadStatus, Result};

impl<T: NandTransport> NandChip<T> {
    fn check_range(&self, ofs: u64, len: usize) -> Result<()> {
        match ofs.checked_add(len as u64) {
            Some(end) if end <= self.size() => Ok(()),
            _ => {
                debug!("access {ofs:#x}+{len:#x} beyond end of device");
                Err(NandError::InvalidArgument)
            }
        }
    }

    /// Per-page OOB capacity for a transfer mode
    fn oob_capacity(&self, mode: OobMode) -> usize {
        match mode {
            OobMode::Auto => self.oobavail(),
            OobMode::Place | OobMode::Raw => self.oobsize,
        }
    }

    /// Copy up to `dst.len()` OOB bytes of the scratch OOB out to a caller buffer
    fn transfer_oob(&self, dst: &mut [u8], mode: OobMode, ooboffs: usize) -> usize {
        match mode {
            OobMode::Place | OobMode::Raw => {
                let src = self.oob_poi.get(ooboffs..).unwrap_or_default();
                let n = dst.len().min(src.len());
                dst[..n].copy_from_slice(&src[..n]);
                n
            }
            OobMode::Auto => {
                let mut skip = ooboffs;
                let mut done = 0;
                for free in &self.ecc.layout.oobfree {
                    if done == dst.len() {
                        break;
                    }
                    if skip >= free.length {
                        skip -= free.length;
                        continue;
                    }
                    let start = free.offset + skip;
                    let n = (free.length - skip).min(dst.len() - done);
                    dst[done..done + n].copy_from_slice(&self.oob_poi[start..start + n]);
                    done += n;
                    skip = 0;
                }
                done
            }
        }
    }

    /// Place caller OOB bytes into the (erased) scratch OOB
    fn fill_oob(&mut self, src: &[u8], mode: OobMode, ooboffs: usize) -> usize {
        self.oob_poi.fill(0xFF);
        match mode {
            OobMode::Place | OobMode::Raw => {
                let dst = self.oob_poi.get_mut(ooboffs..).unwrap_or_default();
                let n = src.len().min(dst.len());
                dst[..n].copy_from_slice(&src[..n]);
                n
            }
            OobMode::Auto => {
                let mut skip = ooboffs;
                let mut done = 0;
                for free in &self.ecc.layout.oobfree {
                    if done == src.len() {
                        break;
                    }
                    if skip >= free.length {
                        skip -= free.length;
                        continue;
                    }
                    let start = free.offset + skip;
                    let n = (free.length - skip).min(src.len() - done);
                    self.oob_poi[start..start + n].copy_from_slice(&src[done..done + n]);
                    done += n;
                    skip = 0;
                }
                done
            }
        }
    }

    /// Move to the next chip when a page loop wraps
    fn next_chip(&mut self, chipnr: &mut usize) -> Result<()> {
        *chipnr += 1;
        self.select_chip(None)?;
        self.select_chip(Some(*chipnr))
    }

    fn classify(&self, before: &super::EccStats) -> ReadStatus {
        if self.ecc_stats.failed > before.failed {
            ReadStatus::Uncorrectable
        } else if self.ecc_stats.corrected > before.corrected {
            ReadStatus::Corrected
        } else {
            ReadStatus::Ok
        }
    }

    /// Read data (and optionally OOB) starting at `from`.
    ///
    /// Whole pages are read straight into the caller's buffer. A partial page goes through the
    /// scratch buffer, which is then remembered as the cached page so a following read of the same
    /// page skips the flash. Raw reads never use or fill the cache, since the scratch buffer then
    /// holds uncorrected data.
    pub(crate) fn do_read_ops(
        &mut self,
        from: u64,
        ops: &mut MtdOobOps<&mut [u8]>,
    ) -> Result<ReadStatus> {
        let before = self.ecc_stats;
        let readlen = ops.len();
        let ooblen = ops.ooblen();
        let mode = ops.mode;
        let ooboffs = ops.ooboffs;
        let want_oob = ops.oobbuf.is_some();

        let mut chipnr = (from >> self.chip_shift) as usize;
        self.select_chip(Some(chipnr))?;

        let mut realpage = (from >> self.page_shift) as u32;
        let mut page = realpage & self.page_mask;
        let mut col = (from & (self.writesize as u64 - 1)) as usize;
        let mut done = 0;
        let mut oob_done = 0;

        while done < readlen {
            let bytes = (self.writesize - col).min(readlen - done);
            let aligned = bytes == self.writesize;

            if self.pagebuf != Some(realpage) || want_oob || mode == OobMode::Raw {
                self.cmdfunc(super::NandCommand::Read0, Some(0), Some(page))?;

                let failed_before = self.ecc_stats.failed;
                if aligned {
                    let datbuf = ops.datbuf.as_deref_mut().unwrap_or_default();
                    let dst = &mut datbuf[done..done + bytes];
                    match mode {
                        OobMode::Raw => self.read_page_raw(dst)?,
                        _ => self.read_page(dst)?,
                    }
                } else {
                    let mut scratch = std::mem::take(&mut self.databuf);
                    let result = match mode {
                        OobMode::Raw => self.read_page_raw(&mut scratch),
                        _ => self.read_page(&mut scratch),
                    };
                    self.databuf = scratch;
                    result?;

                    let cacheable = mode != OobMode::Raw && !want_oob;
                    self.pagebuf = if cacheable && self.ecc_stats.failed == failed_before {
                        Some(realpage)
                    } else {
                        None
                    };
                    if let Some(datbuf) = ops.datbuf.as_deref_mut() {
                        datbuf[done..done + bytes].copy_from_slice(&self.databuf[col..col + bytes]);
                    }
                }

                if let Some(oobbuf) = ops.oobbuf.as_deref_mut() {
                    if oob_done < ooblen {
                        let n = self.transfer_oob(&mut oobbuf[oob_done..], mode, ooboffs);
                        oob_done += n;
                    }
                }

                if !self.options.contains(ChipOptions::NO_READRDY) {
                    self.wait_ready()?;
                }
            } else if let Some(datbuf) = ops.datbuf.as_deref_mut() {
                datbuf[done..done + bytes].copy_from_slice(&self.databuf[col..col + bytes]);
            }

            done += bytes;
            if done == readlen {
                break;
            }

            col = 0;
            realpage += 1;
            page = realpage & self.page_mask;
            if page == 0 {
                self.next_chip(&mut chipnr)?;
            }
        }

        ops.retlen = done;
        ops.oobretlen = oob_done;
        Ok(self.classify(&before))
    }

    /// Read OOB only, one spare area per page from `from`
    pub(crate) fn do_read_oob(
        &mut self,
        from: u64,
        ops: &mut MtdOobOps<&mut [u8]>,
    ) -> Result<ReadStatus> {
        let before = self.ecc_stats;
        let per_page = self.oob_capacity(ops.mode);
        if ops.ooboffs >= per_page {
            debug!("OOB offset {} beyond {per_page} bytes per page", ops.ooboffs);
            return Err(NandError::InvalidArgument);
        }

        let readlen = ops.ooblen();
        let pages_left = (self.size() - from.min(self.size())) >> self.page_shift;
        let per_page = per_page - ops.ooboffs;
        if from >= self.size() || readlen as u64 > pages_left * per_page as u64 {
            debug!("OOB read {from:#x}+{readlen} beyond end of device");
            return Err(NandError::InvalidArgument);
        }

        let mut chipnr = (from >> self.chip_shift) as usize;
        self.select_chip(Some(chipnr))?;
        let mut realpage = (from >> self.page_shift) as u32;
        let mut page = realpage & self.page_mask;
        let mut done = 0;

        let oobbuf = ops.oobbuf.as_deref_mut().unwrap_or_default();
        while done < readlen {
            self.read_oob_std(page)?;
            let len = per_page.min(readlen - done);
            done += self.transfer_oob(&mut oobbuf[done..done + len], ops.mode, ops.ooboffs);

            if !self.options.contains(ChipOptions::NO_READRDY) {
                self.wait_ready()?;
            }
            if done == readlen {
                break;
            }

            realpage += 1;
            page = realpage & self.page_mask;
            if page == 0 {
                self.next_chip(&mut chipnr)?;
            }
        }

        ops.oobretlen = done;
        Ok(self.classify(&before))
    }

    /// Write data (and optionally OOB) starting at `to`. A partial first or last page is padded
    /// with 0xFF, which leaves the untouched bytes erased.
    pub(crate) fn do_write_ops(&mut self, to: u64, ops: &mut MtdOobOps<&[u8]>) -> Result<()> {
        let writelen = ops.len();
        ops.retlen = 0;
        ops.oobretlen = 0;
        if writelen == 0 {
            return Ok(());
        }

        let mut column = (to & (self.writesize as u64 - 1)) as usize;
        if column != 0 && self.options.contains(ChipOptions::NO_SUBPAGE_WRITE) {
            debug!("write to {to:#x} is not page aligned");
            return Err(NandError::InvalidArgument);
        }

        // Every OOB byte must land in the spare area of one of the pages written
        if ops.oobbuf.is_some() {
            let per_page = self.oob_capacity(ops.mode);
            let pages = (column + writelen).div_ceil(self.writesize);
            let ooblen = ops.ooblen();
            if ops.ooboffs >= per_page || ooblen > pages * (per_page - ops.ooboffs) {
                debug!("OOB write of {ooblen} bytes at {} does not fit", ops.ooboffs);
                return Err(NandError::InvalidArgument);
            }
        }

        let mut chipnr = (to >> self.chip_shift) as usize;
        self.select_chip(Some(chipnr))?;
        if self.check_wp()? {
            debug!("device is write protected");
            return Err(NandError::WriteProtected);
        }

        let mut realpage = (to >> self.page_shift) as u32;
        let mut page = realpage & self.page_mask;
        // Any cached page may be about to change
        self.pagebuf = None;

        let raw = ops.mode == OobMode::Raw;
        let datbuf = ops.datbuf.unwrap_or_default();
        let oobbuf = ops.oobbuf.unwrap_or_default();
        let mut done = 0;
        let mut oob_done = 0;

        loop {
            let bytes = (self.writesize - column).min(writelen - done);

            oob_done += self.fill_oob(&oobbuf[oob_done..], ops.mode, ops.ooboffs);

            if bytes < self.writesize {
                let mut scratch = std::mem::take(&mut self.databuf);
                scratch.fill(0xFF);
                scratch[column..column + bytes].copy_from_slice(&datbuf[done..done + bytes]);
                let result = self.write_page(page, &scratch, raw);
                self.databuf = scratch;
                result?;
            } else {
                self.write_page(page, &datbuf[done..done + bytes], raw)?;
            }

            done += bytes;
            if done == writelen {
                break;
            }

            column = 0;
            realpage += 1;
            page = realpage & self.page_mask;
            if page == 0 {
                self.next_chip(&mut chipnr)?;
            }
        }

        ops.retlen = done;
        ops.oobretlen = oob_done;
        Ok(())
    }

    /// Write the spare area of the single page at `to`
    pub(crate) fn do_write_oob(&mut self, to: u64, ops: &mut MtdOobOps<&[u8]>) -> Result<()> {
        let ooblen = ops.ooblen();
        let capacity = self.oob_capacity(ops.mode);
        if ops.ooboffs + ooblen > capacity {
            debug!("OOB write of {ooblen} bytes at {} does not fit", ops.ooboffs);
            return Err(NandError::InvalidArgument);
        }
        if to >= self.size() {
            return Err(NandError::InvalidArgument);
        }

        let chipnr = (to >> self.chip_shift) as usize;
        let realpage = (to >> self.page_shift) as u32;
        let page = realpage & self.page_mask;

        self.select_chip(Some(chipnr))?;
        if self.check_wp()? {
            return Err(NandError::WriteProtected);
        }
        if self.pagebuf == Some(realpage) {
            self.pagebuf = None;
        }

        let oobbuf = ops.oobbuf.unwrap_or_default();
        self.fill_oob(oobbuf, ops.mode, ops.ooboffs);
        self.write_oob_std(page)?;

        ops.oobretlen = ooblen;
        Ok(())
    }

    /// Erase whole blocks.
    ///
    /// `is_bad` decides whether each block may be touched; the first bad block fails the request
    /// without erasing it or anything after it. Blocks erased before the failure stay erased.
    pub fn erase_range<F>(
        &mut self,
        instr: &mut EraseInfo,
        allow_bbt: bool,
        mut is_bad: F,
    ) -> Result<()>
    where
        F: FnMut(&mut Self, u64, bool) -> Result<bool>,
    {
        let block_mask = u64::from(self.erasesize) - 1;
        if instr.addr & block_mask != 0 || instr.len & block_mask != 0 {
            debug!("erase {:#x}+{:#x} not block aligned", instr.addr, instr.len);
            return Err(NandError::InvalidArgument);
        }
        if instr.addr.checked_add(instr.len).map_or(true, |end| end > self.size()) {
            debug!("erase {:#x}+{:#x} beyond end of device", instr.addr, instr.len);
            return Err(NandError::InvalidArgument);
        }

        instr.fail_addr = None;
        self.get_device(ChipState::Erasing)?;
        let result = self.erase_blocks(instr, allow_bbt, &mut is_bad);
        instr.state = match result {
            Ok(()) => EraseState::Done,
            Err(_) => EraseState::Failed,
        };
        self.release_device();
        result
    }

    fn erase_blocks<F>(
        &mut self,
        instr: &mut EraseInfo,
        allow_bbt: bool,
        is_bad: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&mut Self, u64, bool) -> Result<bool>,
    {
        let pages_per_block = self.pages_per_block();
        let mut page = (instr.addr >> self.page_shift) as u32;
        let mut chipnr = (instr.addr >> self.chip_shift) as usize;
        let mut len = instr.len;

        self.select_chip(Some(chipnr))?;
        if self.check_wp()? {
            debug!("device is write protected");
            return Err(NandError::WriteProtected);
        }

        instr.state = EraseState::Erasing;
        let rpt = howudoin::new()
            .label("Erasing")
            .set_len(instr.len / u64::from(self.erasesize));

        while len > 0 {
            let ofs = u64::from(page) << self.page_shift;

            // The state is released while the bad block check may read the flash
            self.state = ChipState::Ready;
            let bad = is_bad(self, ofs, allow_bbt);
            self.state = ChipState::Erasing;
            self.select_chip(Some(chipnr))?;
            if bad? {
                warn!("attempt to erase a bad block at {ofs:#x}");
                instr.fail_addr = Some(ofs);
                rpt.close();
                return Err(NandError::BadBlock { offset: ofs });
            }

            if let Some(cached) = self.pagebuf {
                if (page..page + pages_per_block).contains(&cached) {
                    self.pagebuf = None;
                }
            }

            let status = self.single_erase(page & self.page_mask)?;
            if status.contains(NandStatus::FAIL) {
                error!("failed erase at {ofs:#x}, status {status:?}");
                instr.fail_addr = Some(ofs);
                rpt.close();
                return Err(NandError::EraseFailed { addr: ofs });
            }

            len -= u64::from(self.erasesize);
            page += pages_per_block;
            rpt.inc();

            if len > 0 && page & self.page_mask == 0 {
                self.next_chip(&mut chipnr)?;
            }
        }

        rpt.close();
        Ok(())
    }

    /// Read with ECC
    pub fn read(&mut self, from: u64, buf: &mut [u8]) -> Result<(usize, ReadStatus)> {
        self.check_range(from, buf.len())?;
        if buf.is_empty() {
            return Ok((0, ReadStatus::Ok));
        }

        self.get_device(ChipState::Reading)?;
        let mut ops = MtdOobOps::new(OobMode::Place, Some(buf), None);
        let result = self.do_read_ops(from, &mut ops);
        self.release_device();
        Ok((ops.retlen, result?))
    }

    pub fn write(&mut self, to: u64, buf: &[u8]) -> Result<usize> {
        self.check_range(to, buf.len())?;
        if buf.is_empty() {
            return Ok(0);
        }

        self.get_device(ChipState::Writing)?;
        let mut ops = MtdOobOps::new(OobMode::Place, Some(buf), None);
        let result = self.do_write_ops(to, &mut ops);
        self.release_device();
        result.map(|_| ops.retlen)
    }

    /// Read OOB, with or without page data
    pub fn read_oob(&mut self, from: u64, ops: &mut MtdOobOps<&mut [u8]>) -> Result<ReadStatus> {
        ops.retlen = 0;
        ops.oobretlen = 0;
        if ops.datbuf.is_some() {
            self.check_range(from, ops.len())?;
        }

        self.get_device(ChipState::Reading)?;
        let result = if ops.datbuf.is_none() {
            self.do_read_oob(from, ops)
        } else {
            self.do_read_ops(from, ops)
        };
        self.release_device();
        result
    }

    /// Write OOB, with or without page data
    pub fn write_oob(&mut self, to: u64, ops: &mut MtdOobOps<&[u8]>) -> Result<()> {
        ops.retlen = 0;
        ops.oobretlen = 0;
        if ops.datbuf.is_some() {
            self.check_range(to, ops.len())?;
        }

        self.get_device(ChipState::Writing)?;
        let result = if ops.datbuf.is_none() {
            self.do_write_oob(to, ops)
        } else {
            self.do_write_ops(to, ops)
        };
        self.release_device();
        result
    }

    pub fn sync(&mut self) -> Result<()> {
        self.get_device(ChipState::Syncing)?;
        self.release_device();
        Ok(())
    }

    pub fn suspend(&mut self) -> Result<()> {
        self.get_device(ChipState::Suspended)
    }

    pub fn resume(&mut self) {
        match self.state {
            ChipState::Suspended => self.release_device(),
            state => error!("resume called for a chip which is not suspended ({state:?})"),
        }
    }
}
