//! This module implements logic to write raw blobs to NAND flash.

use crate::error::ReadStatus;
use crate::nand::{EraseInfo, Mtd};
use crate::util::{PageUtil, ReadExt};

use anyhow::Context;
use log::{debug, warn};

use std::io::Read;

/// Attempts at writing a block before it is given up as bad
const BLOCK_ATTEMPTS: usize = 5;

/// Scan the block at `ofs` to confirm that its contents match the provided slice.
///
/// The provided slice should be no longer than the block contents. If it is shorter, the remaining
/// bytes are "don't care."
///
/// The return value is the number of pages of the block that match (and therefore the index of the
/// page where write can start), or None if there is no partial match and the block must be erased.
fn check_raw_block<M: Mtd>(mtd: &mut M, ofs: u64, mut data: &[u8]) -> Option<u32> {
    // How many pages do we read at a time? A higher number helps in high-latency situations.
    const PAGE_CHUNKS: u32 = 8;

    let info = mtd.info();
    let page_size = info.writesize;
    let page_count = info.pages_per_block();

    let mut buf = vec![0; page_size * PAGE_CHUNKS as usize];
    let mut filled = 0;
    let mut consumed = 0;

    let mut page: u32 = 0;
    let mut data_correct_upto: Option<u32> = None;
    loop {
        if data_correct_upto.is_none() && data.is_empty() {
            // No data mismatch found and no further data to compare
            break Some(page);
        }

        if consumed == filled {
            filled = buf.len().min(page_size * (page_count - page) as usize);
            consumed = 0;

            if filled == 0 {
                // Nothing more to read
                break data_correct_upto;
            }

            // Read errors are considered "needs erase"
            let from = ofs + u64::from(page) * page_size as u64;
            match mtd.read(from, &mut buf[..filled]) {
                Ok((_, ReadStatus::Uncorrectable)) | Err(_) => break None,
                Ok(_) => {}
            }
        }

        let page_content = &buf[consumed..consumed + page_size];
        consumed += page_size;

        // Still comparing data?
        if data_correct_upto.is_none() {
            let cmp_len = std::cmp::min(page_content.len(), data.len());
            if page_content[..cmp_len] == data[..cmp_len] {
                data = &data[cmp_len..];
            } else {
                // A mismatch means we're now looking for erased pages; if all others are erased,
                // this becomes the return value.
                data_correct_upto = Some(page);
            }
        }

        // A non-erased page after a data mismatch means an erase is required
        if data_correct_upto.is_some() && !page_content.is_erased() {
            break None;
        }

        page += 1;
    }
}

fn erase_block<M: Mtd>(mtd: &mut M, ofs: u64) -> anyhow::Result<()> {
    let erasesize = u64::from(mtd.info().erasesize);
    mtd.erase(&mut EraseInfo::new(ofs, erasesize))?;
    Ok(())
}

/// Update the contents of the block at `ofs`, resuming from a partial write if possible.
///
/// The provided slice should be no longer than the block contents. If it is shorter, the remaining
/// bytes are "don't care."
fn update_raw_block<M: Mtd>(mtd: &mut M, ofs: u64, data: &[u8]) -> anyhow::Result<()> {
    let page_size = mtd.info().writesize;
    let start_page = match check_raw_block(mtd, ofs, data) {
        None => {
            erase_block(mtd, ofs)?;
            0
        }
        Some(x) => x,
    };

    // Ensure `data` is a multiple of the page size
    let mut data_len = data.len() + page_size - 1;
    data_len -= data_len % page_size;
    let mut vec;
    let mut data = data;
    if data_len != data.len() {
        // Not padded to a multiple of page size
        vec = Vec::with_capacity(data_len);
        vec.extend(data);
        vec.resize(data_len, 0xFF);
        data = &vec[..];
    }

    let skip = start_page as usize * page_size;
    if skip >= data.len() {
        return Ok(());
    }
    mtd.write(ofs + skip as u64, &data[skip..])?;

    // Trust, but verify
    anyhow::ensure!(
        check_raw_block(mtd, ofs, data).is_some(),
        "block at {ofs:#x} did not read back as written"
    );
    Ok(())
}

/// Write a raw blob to the NAND flash device, starting from its first block.
///
/// This operation is idempotent; if the image is already written, no erase/writes will occur.
///
/// The `skip_bad` parameter will cause bad blocks to be skipped over. If this is `false`,
/// encountering a bad block is an error. Returns the number of blocks the image occupies,
/// including any skipped bad ones.
pub fn write_raw_image<M: Mtd, R: Read>(
    mtd: &mut M,
    image: &mut R,
    skip_bad: bool,
) -> anyhow::Result<u32> {
    let info = mtd.info();
    let block_size = info.erasesize as usize;

    let rpt = howudoin::new().label("Writing image");
    let mut data = vec![0; block_size];
    let mut block_index: u32 = 0;
    loop {
        let len = image
            .read_erased_tail(&mut data)
            .context("failed to read image")?;
        if len == 0 {
            // EOF encountered means the write is complete
            rpt.close();
            break Ok(block_index);
        }

        'find_block_and_write: loop {
            anyhow::ensure!(
                block_index < info.blocks(),
                "image does not fit on the device"
            );
            let ofs = u64::from(block_index) * block_size as u64;
            block_index += 1;

            if !mtd.block_isbad(ofs)? {
                // Give 5 attempts to update it
                for attempt in 0..BLOCK_ATTEMPTS {
                    match update_raw_block(mtd, ofs, &data[..len]) {
                        Ok(()) => {
                            debug!("block at {ofs:#x} up to date");
                            rpt.inc();
                            break 'find_block_and_write;
                        }
                        Err(e) => {
                            warn!("writing block at {ofs:#x} failed (attempt {attempt}): {e:#}");
                            // A failing erase is handled by the next attempt
                            let _ = erase_block(mtd, ofs);
                        }
                    }
                }

                // Block must have gone bad
                mtd.block_markbad(ofs)?;
            }

            // Block is bad; if we can't tolerate it, bail. Otherwise, loop to find a good one.
            anyhow::ensure!(skip_bad, "unhandled bad block at {ofs:#x}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoardConfig;
    use crate::nand::NandLayout;
    use crate::sim::{SimFlash, SimNandSystem};

    const TEST_LAYOUT: NandLayout = NandLayout {
        blocks: 1024,
        pages_per_block: 64,
        bytes_per_page: 2048,
    };
    const BLOCK: u64 = 64 * 2048;

    fn system() -> SimNandSystem {
        let flash = SimFlash::from_layout(TEST_LAYOUT, 64).unwrap();
        SimNandSystem::build(&BoardConfig::default(), vec![flash]).unwrap()
    }

    #[test]
    fn test_check_raw_block() -> anyhow::Result<()> {
        let mut sys = system();
        let mtd = &mut sys.mtd;

        assert_eq!(check_raw_block(mtd, 0, &[]), Some(0));
        assert_eq!(check_raw_block(mtd, 0, &[0xFF, 0xFF]), Some(1));
        assert_eq!(check_raw_block(mtd, 0, &[0xFF, 0x7F]), Some(0));

        // Generate a bunch of test data: 10 pages of data, 15 empty, 5 more of data
        let mut test_data: Vec<u8> = (0..2048 * 30)
            .map(|i| match i / 2048 {
                0..=9 => (i * 23) as u8,
                25..=29 => (i * 11) as u8,
                _ => 0xFF,
            })
            .collect();

        // Program only the first 27 pages
        mtd.write(0, &test_data[..27 * 2048])?;

        assert_eq!(check_raw_block(mtd, 0, &test_data[..2048 * 5]), Some(5));
        assert_eq!(check_raw_block(mtd, 0, &test_data[..2048 * 15]), Some(15));
        assert_eq!(check_raw_block(mtd, 0, &test_data), Some(27));

        test_data[20 * 2048] = 0x00;
        assert_eq!(check_raw_block(mtd, 0, &test_data), None);
        Ok(())
    }

    #[test]
    fn test_update_raw_block() -> anyhow::Result<()> {
        let mut sys = system();
        update_raw_block(&mut sys.mtd, BLOCK, &[])?;
        update_raw_block(&mut sys.mtd, BLOCK, &[0xAA])?;
        update_raw_block(&mut sys.mtd, BLOCK, &[0x55; 700])?;

        let mut out = vec![0; 4096];
        sys.mtd.read(BLOCK, &mut out)?;
        assert!(out[..700].iter().all(|&b| b == 0x55));
        assert!(out[700..].is_erased());
        Ok(())
    }

    #[test]
    fn test_write_raw_image() -> anyhow::Result<()> {
        let mut sys = system();
        let image: Vec<u8> = (0..BLOCK as usize * 3 + 100).map(|i| (i % 251) as u8).collect();
        sys.mtd.block_markbad(BLOCK)?;

        assert!(write_raw_image(&mut sys.mtd, &mut &image[..], false).is_err());
        assert_eq!(write_raw_image(&mut sys.mtd, &mut &image[..], true)?, 5);

        let mut out = vec![0; BLOCK as usize];
        for (n, block) in [0, 2, 3, 4].into_iter().enumerate() {
            sys.mtd.read(block * BLOCK, &mut out)?;
            let chunk = &image[n * BLOCK as usize..];
            let len = chunk.len().min(BLOCK as usize);
            assert!(out[..len] == chunk[..len]);
        }

        // A second run finds everything in place
        let flashes = sys.into_flashes();
        let before = flashes[0].clone();
        let mut sys = SimNandSystem::build(&BoardConfig::default(), flashes)?;
        write_raw_image(&mut sys.mtd, &mut &image[..], true)?;
        assert!(sys.into_flashes()[0] == before);
        Ok(())
    }

    #[test]
    fn test_failing_block_marked_bad() -> anyhow::Result<()> {
        let mut flash = SimFlash::from_layout(TEST_LAYOUT, 64)?;
        flash.fail_program(64);
        let mut sys = SimNandSystem::build(&BoardConfig::default(), vec![flash])?;

        let image = vec![0x42; BLOCK as usize * 2];
        assert_eq!(write_raw_image(&mut sys.mtd, &mut &image[..], true)?, 3);
        assert!(sys.mtd.block_isbad(BLOCK)?);
        assert!(!sys.mtd.block_isbad(2 * BLOCK)?);
        Ok(())
    }
}
