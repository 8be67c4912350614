//! Writers that lay data out on the NAND the way a boot ROM or bootloader expects to find it.
//!
//! Everything here goes through the [Mtd](crate::nand::Mtd) interface, so bad blocks are handled
//! the same way the loader will handle them. The writers are meant to be idempotent: running one
//! twice with the same input leaves the flash untouched the second time.

pub mod raw;

pub use raw::write_raw_image;
