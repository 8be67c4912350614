//! Known NAND parts and manufacturers, keyed by the bytes READID returns

use crate::gpmi::timing::NandTiming;

/// Matches any manufacturer in [NandDeviceInfo::mfr_id]
pub const ANY_MFR: u8 = 0;

/// One entry of the device table.
///
/// Classic large-page parts report their page, OOB and block sizes in the 4th ID byte; those
/// entries have a `page_size` of 0 and are decoded with [NandDeviceInfo::geometry].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NandDeviceInfo {
    pub name: &'static str,
    pub mfr_id: u8,
    pub dev_id: u8,
    pub page_size: usize,
    pub chip_size_mib: u32,
    pub erase_size: u32,
    pub oob_size: usize,
    pub bus16: bool,
    pub timing: NandTiming,
}

/// Page geometry of an identified chip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipGeometry {
    pub writesize: usize,
    pub oobsize: usize,
    pub erasesize: u32,
    pub bus16: bool,
    pub chipsize: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NandManufacturer {
    pub id: u8,
    pub name: &'static str,
}

const fn small(dev_id: u8, name: &'static str, chip_size_mib: u32) -> NandDeviceInfo {
    NandDeviceInfo {
        name,
        mfr_id: ANY_MFR,
        dev_id,
        page_size: 512,
        chip_size_mib,
        erase_size: 0x4000,
        oob_size: 16,
        bus16: false,
        timing: NandTiming::LEGACY,
    }
}

const fn large(dev_id: u8, name: &'static str, chip_size_mib: u32) -> NandDeviceInfo {
    NandDeviceInfo {
        name,
        mfr_id: ANY_MFR,
        dev_id,
        page_size: 0,
        chip_size_mib,
        erase_size: 0,
        oob_size: 0,
        bus16: false,
        timing: NandTiming::LEGACY,
    }
}

pub static DEVICES: &[NandDeviceInfo] = &[
    small(0x73, "NAND 16MiB 3,3V 8-bit", 16),
    small(0x75, "NAND 32MiB 3,3V 8-bit", 32),
    small(0x76, "NAND 64MiB 3,3V 8-bit", 64),
    small(0x79, "NAND 128MiB 3,3V 8-bit", 128),
    large(0xA2, "NAND 64MiB 1,8V 8-bit", 64),
    large(0xF2, "NAND 64MiB 3,3V 8-bit", 64),
    large(0xA1, "NAND 128MiB 1,8V 8-bit", 128),
    large(0xF1, "NAND 128MiB 3,3V 8-bit", 128),
    large(0xAA, "NAND 256MiB 1,8V 8-bit", 256),
    large(0xDA, "NAND 256MiB 3,3V 8-bit", 256),
    large(0xAC, "NAND 512MiB 1,8V 8-bit", 512),
    large(0xDC, "NAND 512MiB 3,3V 8-bit", 512),
    large(0xA3, "NAND 1GiB 1,8V 8-bit", 1024),
    large(0xD3, "NAND 1GiB 3,3V 8-bit", 1024),
    large(0xA5, "NAND 2GiB 1,8V 8-bit", 2048),
    large(0xD5, "NAND 2GiB 3,3V 8-bit", 2048),
    NandDeviceInfo {
        name: "MT29F16G08ABABA",
        mfr_id: 0x2C,
        dev_id: 0x48,
        page_size: 4096,
        chip_size_mib: 2048,
        erase_size: 0x80000,
        oob_size: 224,
        bus16: false,
        timing: NandTiming::EDO,
    },
    NandDeviceInfo {
        name: "K9GAG08U0E",
        mfr_id: 0xEC,
        dev_id: 0xD5,
        page_size: 8192,
        chip_size_mib: 2048,
        erase_size: 0x100000,
        oob_size: 436,
        bus16: false,
        timing: NandTiming::EDO,
    },
];

const fn mfr(id: u8, name: &'static str) -> NandManufacturer {
    NandManufacturer { id, name }
}

pub static MANUFACTURERS: &[NandManufacturer] = &[
    mfr(0x98, "Toshiba"),
    mfr(0xEC, "Samsung"),
    mfr(0x04, "Fujitsu"),
    mfr(0x8F, "National"),
    mfr(0x07, "Renesas"),
    mfr(0x20, "ST Micro"),
    mfr(0xAD, "Hynix"),
    mfr(0x2C, "Micron"),
    mfr(0x01, "AMD"),
    mfr(0xC2, "Macronix"),
];

/// Find the entry for a manufacturer/device ID pair, preferring one specific to the manufacturer
pub fn lookup(mfr_id: u8, dev_id: u8) -> Option<&'static NandDeviceInfo> {
    DEVICES
        .iter()
        .find(|d| d.dev_id == dev_id && d.mfr_id == mfr_id)
        .or_else(|| {
            DEVICES
                .iter()
                .find(|d| d.dev_id == dev_id && d.mfr_id == ANY_MFR)
        })
}

pub fn manufacturer_name(id: u8) -> &'static str {
    MANUFACTURERS
        .iter()
        .find(|m| m.id == id)
        .map_or("Unknown", |m| m.name)
}

impl NandDeviceInfo {
    /// Page geometry of this part, decoding the extended ID byte where the table defers to it
    pub fn geometry(&self, ext_id: u8) -> ChipGeometry {
        let chipsize = u64::from(self.chip_size_mib) << 20;
        if self.page_size != 0 {
            return ChipGeometry {
                writesize: self.page_size,
                oobsize: self.oob_size,
                erasesize: self.erase_size,
                bus16: self.bus16,
                chipsize,
            };
        }

        let writesize = 1024usize << (ext_id & 0x03);
        let oob_per_512 = 8usize << ((ext_id >> 2) & 0x01);
        ChipGeometry {
            writesize,
            oobsize: oob_per_512 * (writesize >> 9),
            erasesize: (64 * 1024) << ((ext_id >> 4) & 0x03),
            bus16: ext_id & 0x40 != 0,
            chipsize,
        }
    }
}

/// Build the 4 ID bytes a part with the given geometry would return, for simulated chips.
///
/// Explicit table entries are matched first; otherwise the geometry must be expressible in the
/// extended ID byte of a generic entry.
pub fn synthesize_id(geometry: &ChipGeometry) -> Option<[u8; 4]> {
    let size_mib = u32::try_from(geometry.chipsize >> 20).ok()?;

    let explicit = DEVICES.iter().find(|d| {
        d.mfr_id != ANY_MFR
            && d.page_size == geometry.writesize
            && d.oob_size == geometry.oobsize
            && d.erase_size == geometry.erasesize
            && d.chip_size_mib == size_mib
    });
    if let Some(dev) = explicit {
        return Some([dev.mfr_id, dev.dev_id, 0x00, 0x00]);
    }

    // Any manufacturer without parts of its own in the table
    const GENERIC_MFR: u8 = 0x98;

    if geometry.writesize == 512 {
        let dev = DEVICES.iter().find(|d| {
            d.page_size == 512
                && d.chip_size_mib == size_mib
                && d.oob_size == geometry.oobsize
                && d.erase_size == geometry.erasesize
        })?;
        return Some([GENERIC_MFR, dev.dev_id, 0x00, 0x00]);
    }

    let page_code = (geometry.writesize / 1024).checked_ilog2()?;
    let oob_per_512 = geometry.oobsize / (geometry.writesize >> 9);
    let erase_code = (geometry.erasesize / (64 * 1024)).checked_ilog2()?;
    if page_code > 3 || erase_code > 3 || !matches!(oob_per_512, 8 | 16) {
        return None;
    }
    let ext = page_code as u8
        | u8::from(oob_per_512 == 16) << 2
        | (erase_code as u8) << 4
        | u8::from(geometry.bus16) << 6;

    let dev = DEVICES
        .iter()
        .find(|d| d.page_size == 0 && d.chip_size_mib == size_mib && d.name.contains("3,3V"))?;
    let id = [GENERIC_MFR, dev.dev_id, 0x00, ext];
    (dev.geometry(ext) == *geometry).then_some(id)
}
