//! A host-side tool for poking at NAND flash images through the full driver stack.
//!
//! The image is loaded into the simulated SoC, the stack is brought up on it exactly as a board
//! would bring it up (including finding or creating the bad block table), and the requested
//! operation goes through the MTD interface. `--save` writes the result back to the image file.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;

use std::fs::{self, File};
use std::io::Write;
use std::num::ParseIntError;
use std::path::PathBuf;

use nandboot::{
    bbt::BlockCode,
    config::BoardConfig,
    error::ReadStatus,
    format::write_raw_image,
    nand::{EraseInfo, Mtd, NandLayout},
    sim::{SimFlash, SimNandSystem},
};

/// Parse a number in decimal, or hex with a `0x` prefix
fn parse_number(s: &str) -> Result<u64, ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

#[derive(Args, Debug)]
struct FlashOptions {
    /// Path to the NAND image to use; a missing file starts out erased
    #[clap(long)]
    image: Option<PathBuf>,

    /// Layout of the NAND to simulate
    #[clap(long, default_value = "1024x64x2048")]
    layout: NandLayout,

    /// Size of each page's spare area
    #[clap(long, default_value_t = 64)]
    oob: usize,

    /// Blocks to give a factory bad block marker before the stack comes up
    #[clap(long, value_delimiter = ',')]
    factory_bad: Vec<u32>,

    /// Write back the NAND image when done
    #[clap(long, requires = "image")]
    save: bool,
}

impl FlashOptions {
    fn open(&self, config: &BoardConfig) -> Result<SimNandSystem> {
        let mut flash = SimFlash::from_layout(self.layout, self.oob)?;
        if let Some(path) = self.image.as_ref().filter(|p| p.exists()) {
            let mut file =
                File::open(path).with_context(|| format!("could not open {}", path.display()))?;
            flash.load(&mut file)?;
        }
        for &block in &self.factory_bad {
            flash.set_factory_bad(block)?;
        }

        SimNandSystem::build(config, vec![flash]).context("could not bring up the NAND")
    }

    fn cleanup(&self, mut sys: SimNandSystem) -> Result<()> {
        sys.mtd.sync()?;
        if !self.save {
            return Ok(());
        }

        if let Some(path) = &self.image {
            for flash in sys.into_flashes() {
                flash.save(&mut File::create(path)?)?;
            }
            info!("saved {}", path.display());
        }
        Ok(())
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Describe the chip and the ECC in use
    Info,

    /// Print every block that is not good
    Bbt,

    /// Read data, with ECC
    Read {
        #[clap(long, value_parser = parse_number)]
        offset: u64,

        #[clap(long, value_parser = parse_number)]
        len: u64,

        /// Write the data here instead of dumping it in hex
        #[clap(long)]
        out: Option<PathBuf>,
    },

    /// Write the contents of a file, with ECC
    Write {
        #[clap(long, value_parser = parse_number)]
        offset: u64,

        path: PathBuf,
    },

    /// Erase whole blocks
    Erase {
        #[clap(long, value_parser = parse_number)]
        offset: u64,

        #[clap(long, value_parser = parse_number)]
        len: u64,
    },

    /// Mark the block containing an offset bad
    MarkBad {
        #[clap(long, value_parser = parse_number)]
        offset: u64,
    },

    /// Write a raw image from the start of the NAND
    WriteImage {
        /// The path to the image to write to NAND
        path: PathBuf,

        /// Whether to skip over (thereby tolerating) any bad blocks encountered
        #[clap(long)]
        skip_bad: bool,
    },
}

fn hexdump(base: u64, data: &[u8]) {
    for (n, line) in data.chunks(16).enumerate() {
        let hex: Vec<String> = line.iter().map(|b| format!("{b:02x}")).collect();
        let ascii: String = line
            .iter()
            .map(|&b| match b.is_ascii_graphic() || b == b' ' {
                true => b as char,
                false => '.',
            })
            .collect();
        println!("{:08x}  {:<47}  |{ascii}|", base + 16 * n as u64, hex.join(" "));
    }
}

impl Command {
    fn execute(self, sys: &mut SimNandSystem) -> Result<()> {
        let mtd = &mut sys.mtd;
        match self {
            Command::Info => {
                let info = mtd.info();
                let chip = mtd.chip();
                let name = chip.device.map_or("unknown", |d| d.name);
                println!("ID:         {:02x?} ({name})", chip.id);
                println!("Size:       {} MiB, {} chip(s)", info.size >> 20, info.numchips);
                println!("Blocks:     {} x {} KiB", info.blocks(), info.erasesize >> 10);
                println!("Pages:      {} + {} bytes", info.writesize, info.oobsize);
                println!(
                    "ECC:        {:?}, {} x {} bytes, strength {}",
                    chip.ecc.mode, chip.ecc.steps, chip.ecc.size, chip.ecc.strength
                );
                println!("OOB free:   {} bytes", info.oobavail);
                println!("Bad blocks: {}", mtd.ecc_stats().badblocks);
            }

            Command::Bbt => match mtd.bbt() {
                Some(bbt) => {
                    for (block, code) in bbt.bbt.iter().enumerate() {
                        if code != BlockCode::Good {
                            println!("{block:5} => {code:?}");
                        }
                    }
                    for (name, desc) in [("main", bbt.main_table()), ("mirror", bbt.mirror_table())]
                    {
                        if let Some(desc) = desc {
                            println!("{name} table: pages {:?}, versions {:?}", desc.pages, desc.version);
                        }
                    }
                }
                None => {
                    let info = mtd.info();
                    for block in 0..info.blocks() {
                        if mtd.block_isbad(u64::from(block) * u64::from(info.erasesize))? {
                            println!("{block:5} => bad");
                        }
                    }
                }
            },

            Command::Read { offset, len, out } => {
                let mut buf = vec![0; usize::try_from(len)?];
                let (read, status) = mtd.read(offset, &mut buf)?;
                match out {
                    Some(path) => File::create(path)?.write_all(&buf[..read])?,
                    None => hexdump(offset, &buf[..read]),
                }
                if status != ReadStatus::Ok {
                    eprintln!("read status: {status:?}");
                }
            }

            Command::Write { offset, path } => {
                let data = fs::read(&path)
                    .with_context(|| format!("could not read {}", path.display()))?;
                let written = mtd.write(offset, &data)?;
                info!("wrote {written} bytes at {offset:#x}");
            }

            Command::Erase { offset, len } => {
                let mut instr = EraseInfo::new(offset, len);
                mtd.erase(&mut instr).with_context(|| match instr.fail_addr {
                    Some(addr) => format!("erase failed at {addr:#x}"),
                    None => "erase failed".to_string(),
                })?;
            }

            Command::MarkBad { offset } => mtd.block_markbad(offset)?,

            Command::WriteImage { path, skip_bad } => {
                let mut image = File::open(&path)
                    .with_context(|| format!("could not open {}", path.display()))?;
                let blocks = write_raw_image(mtd, &mut image, skip_bad)?;
                info!("image occupies {blocks} blocks");
            }
        };

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The flash to operate on
    #[clap(flatten)]
    flash: FlashOptions,

    /// The operation to run against this flash
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Cli::parse();
    howudoin::init(howudoin::consumers::TermLine::default());

    let mut sys = args.flash.open(&BoardConfig::default())?;
    args.cmd.execute(&mut sys)?;
    args.flash.cleanup(sys)?;
    Ok(())
}

#[test]
fn test_parse_number() {
    assert_eq!(parse_number("4096"), Ok(4096));
    assert_eq!(parse_number("0x20000"), Ok(0x20000));
    assert!(parse_number("0xZZ").is_err());
}
