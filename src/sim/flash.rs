//! A simulated NAND array: raw pages of data and spare area, with the failure modes real parts
//! have.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::{BufWriter, Read, Write};

use anyhow::{ensure, Context};
use log::{debug, trace};

use crate::nand::ids::{self, ChipGeometry};
use crate::nand::NandLayout;
use crate::util::{PageUtil, ReadExt};

/// One chip of simulated flash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimFlash {
    geometry: ChipGeometry,
    id: [u8; 4],

    /// Programmed pages (data then spare area); absent pages are erased
    pages: HashMap<u32, Vec<u8>>,

    /// What the ECC engine was last asked to store in each page, for the simulated BCH decoder
    shadow: HashMap<u32, Vec<u8>>,

    factory_bad: BTreeSet<u32>,
    fail_program: HashSet<u32>,
    fail_erase: HashSet<u32>,
    write_protected: bool,
}

impl SimFlash {
    /// An erased chip with the given geometry, which must be one a real part could report
    pub fn new(geometry: ChipGeometry) -> anyhow::Result<Self> {
        ensure!(
            geometry.writesize.is_power_of_two() && geometry.erasesize.is_power_of_two(),
            "page and block sizes must be powers of two"
        );
        ensure!(
            u64::from(geometry.erasesize) <= geometry.chipsize,
            "block larger than the chip"
        );
        let id = ids::synthesize_id(&geometry)
            .with_context(|| format!("no known NAND part has the geometry {geometry:?}"))?;

        Ok(Self {
            geometry,
            id,
            pages: HashMap::new(),
            shadow: HashMap::new(),
            factory_bad: BTreeSet::new(),
            fail_program: HashSet::new(),
            fail_erase: HashSet::new(),
            write_protected: false,
        })
    }

    /// A chip laid out as `layout`, with `oobsize` spare bytes per page
    pub fn from_layout(layout: NandLayout, oobsize: usize) -> anyhow::Result<Self> {
        Self::new(ChipGeometry {
            writesize: layout.bytes_per_page,
            oobsize,
            erasesize: layout.block_size(),
            bus16: false,
            chipsize: layout.total_size(),
        })
    }

    pub fn geometry(&self) -> &ChipGeometry {
        &self.geometry
    }

    /// The bytes READID returns
    pub fn id(&self) -> [u8; 4] {
        self.id
    }

    pub fn raw_page_size(&self) -> usize {
        self.geometry.writesize + self.geometry.oobsize
    }

    pub fn page_count(&self) -> u32 {
        (self.geometry.chipsize / self.geometry.writesize as u64) as u32
    }

    pub fn pages_per_block(&self) -> u32 {
        self.geometry.erasesize / self.geometry.writesize as u32
    }

    pub fn block_count(&self) -> u32 {
        (self.geometry.chipsize / u64::from(self.geometry.erasesize)) as u32
    }

    /// Spare area offset of the factory bad block marker
    pub fn badblockpos(&self) -> usize {
        match self.geometry.writesize > 512 {
            true => 0,
            false => 5,
        }
    }

    pub fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    pub fn set_write_protected(&mut self, wp: bool) {
        self.write_protected = wp;
    }

    /// Copy out the raw contents of a page
    pub fn read_page(&self, page: u32, buf: &mut [u8]) {
        match self.pages.get(&page) {
            Some(data) => {
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                buf[n..].fill(0xFF);
            }
            None => buf.fill(0xFF),
        }
    }

    /// Program a page. Like real flash, programming can only clear bits.
    ///
    /// Returns false if the program failed (write protect or an injected failure).
    pub fn program(&mut self, page: u32, data: &[u8]) -> bool {
        if page >= self.page_count() || self.write_protected || self.fail_program.contains(&page) {
            debug!("simulated program of page {page:#x} failed");
            return false;
        }
        if data.is_erased() {
            return true;
        }

        let size = self.raw_page_size();
        let stored = self.pages.entry(page).or_insert_with(|| vec![0xFF; size]);
        for (dst, src) in stored.iter_mut().zip(data) {
            *dst &= *src;
        }
        trace!("simulated program of page {page:#x}");
        true
    }

    /// Erase a block, then restore its factory marker if it has one.
    ///
    /// Returns false if the erase failed.
    pub fn erase(&mut self, block: u32) -> bool {
        if block >= self.block_count() || self.write_protected || self.fail_erase.contains(&block) {
            debug!("simulated erase of block {block} failed");
            return false;
        }

        let ppb = self.pages_per_block();
        let pages = block * ppb..(block + 1) * ppb;
        self.pages.retain(|page, _| !pages.contains(page));
        self.shadow.retain(|page, _| !pages.contains(page));

        if self.factory_bad.contains(&block) {
            self.apply_factory_marker(block);
        }
        true
    }

    fn apply_factory_marker(&mut self, block: u32) {
        let page = block * self.pages_per_block();
        let mut raw = vec![0xFF; self.raw_page_size()];
        let pos = self.geometry.writesize + self.badblockpos();
        raw[pos] = 0x00;
        if self.geometry.writesize > 512 {
            raw[pos + 1] = 0x00;
        }
        let size = self.raw_page_size();
        let stored = self.pages.entry(page).or_insert_with(|| vec![0xFF; size]);
        for (dst, src) in stored.iter_mut().zip(raw) {
            *dst &= src;
        }
    }

    /// Mark a block bad the way the factory does; the marker survives erases
    pub fn set_factory_bad(&mut self, block: u32) -> anyhow::Result<()> {
        ensure!(block < self.block_count(), "block {block} out of range");
        self.factory_bad.insert(block);
        self.apply_factory_marker(block);
        Ok(())
    }

    pub fn factory_bad(&self) -> impl Iterator<Item = u32> + '_ {
        self.factory_bad.iter().copied()
    }

    /// Flip one bit of a page's raw contents, as a disturb or retention error would
    pub fn flip_bit(&mut self, page: u32, bit: usize) {
        let size = self.raw_page_size();
        let stored = self.pages.entry(page).or_insert_with(|| vec![0xFF; size]);
        stored[bit / 8] ^= 1 << (bit % 8);
    }

    /// Make every program of `page` fail
    pub fn fail_program(&mut self, page: u32) {
        self.fail_program.insert(page);
    }

    /// Make every erase of `block` fail
    pub fn fail_erase(&mut self, block: u32) {
        self.fail_erase.insert(block);
    }

    /// Remember the payload and metadata the ECC engine stored in `page`
    pub fn set_shadow(&mut self, page: u32, payload: Vec<u8>) {
        self.shadow.insert(page, payload);
    }

    pub fn shadow(&self, page: u32) -> Option<&[u8]> {
        self.shadow.get(&page).map(Vec::as_slice)
    }

    /// Initialize the flash contents from a raw image: every page's data and spare area in order.
    /// A short image leaves the remaining pages erased.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        self.pages.clear();
        self.shadow.clear();

        let mut buf = vec![0; self.raw_page_size()];
        for page in 0..self.page_count() {
            let n = read.read_erased_tail(&mut buf)?;
            if !buf.is_erased() {
                self.pages.insert(page, buf.clone());
            }
            if n < buf.len() {
                break;
            }
        }

        for block in self.factory_bad.clone() {
            self.apply_factory_marker(block);
        }
        Ok(())
    }

    /// Write the contents of the flash out as a raw image
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let mut write = BufWriter::new(write);
        let mut buf = vec![0; self.raw_page_size()];
        for page in 0..self.page_count() {
            self.read_page(page, &mut buf);
            write.write_all(&buf)?;
        }
        write.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 1024,
        pages_per_block: 64,
        bytes_per_page: 2048,
    };

    fn flash() -> SimFlash {
        SimFlash::from_layout(TEST_LAYOUT, 64).unwrap()
    }

    #[test]
    fn test_program_only_clears_bits() {
        let mut flash = flash();
        let mut page = vec![0xFF; flash.raw_page_size()];
        page[0] = 0xF0;
        assert!(flash.program(3, &page));
        page[0] = 0x3F;
        assert!(flash.program(3, &page));

        let mut out = vec![0; flash.raw_page_size()];
        flash.read_page(3, &mut out);
        assert_eq!(out[0], 0x30);
        assert!(out[1..].is_erased());

        assert!(flash.erase(0));
        flash.read_page(3, &mut out);
        assert!(out.is_erased());
    }

    #[test]
    fn test_factory_marker_survives_erase() -> anyhow::Result<()> {
        let mut flash = flash();
        flash.set_factory_bad(7)?;
        assert!(flash.erase(7));

        let mut out = vec![0; flash.raw_page_size()];
        flash.read_page(7 * 64, &mut out);
        assert_eq!(&out[2048..2050], &[0, 0]);
        assert!(flash.set_factory_bad(1024).is_err());
        Ok(())
    }

    #[test]
    fn test_injected_failures() {
        let mut flash = flash();
        let page = vec![0u8; flash.raw_page_size()];
        flash.fail_program(5);
        flash.fail_erase(2);
        assert!(!flash.program(5, &page));
        assert!(flash.program(6, &page));
        assert!(!flash.erase(2));

        flash.set_write_protected(true);
        assert!(!flash.program(7, &page));
        assert!(!flash.erase(0));
    }

    #[test]
    fn test_id_and_bad_geometry() {
        assert_eq!(flash().id(), [0x98, 0xF1, 0x00, 0x15]);
        let odd = NandLayout {
            blocks: 10,
            pages_per_block: 64,
            bytes_per_page: 2048,
        };
        assert!(SimFlash::from_layout(odd, 64).is_err());
    }

    #[test]
    fn test_save_load() -> anyhow::Result<()> {
        let small = NandLayout {
            blocks: 1024,
            pages_per_block: 32,
            bytes_per_page: 512,
        };
        let mut flash = SimFlash::from_layout(small, 16)?;
        assert_eq!(flash.badblockpos(), 5);
        let mut page = vec![0xFF; flash.raw_page_size()];
        page[..5].copy_from_slice(b"HELLO");
        assert!(flash.program(32, &page));

        let mut image = Vec::new();
        flash.save(&mut image)?;
        assert_eq!(image.len(), 1024 * 32 * (512 + 16));

        let mut copy = SimFlash::from_layout(small, 16)?;
        copy.load(&mut &image[..])?;
        let mut out = vec![0; copy.raw_page_size()];
        copy.read_page(32, &mut out);
        assert_eq!(&out[..5], b"HELLO");

        // A truncated image leaves the rest erased
        copy.load(&mut &image[..100])?;
        copy.read_page(32, &mut out);
        assert!(out.is_erased());
        Ok(())
    }
}
