//! Error and status types shared by every layer of the NAND stack.

use thiserror::Error;

/// Failures that abort a driver operation
///
/// Each variant corresponds to one status code class the firmware above this stack understands;
/// see [NandError::errno].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NandError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("timed out waiting for hardware")]
    Timeout,
    #[error("no such device")]
    NoDevice,
    #[error("DMA channel not allocated")]
    Fault,
    #[error("resource busy")]
    Busy,
    #[error("out of memory")]
    NoMemory,
    #[error("no space left for the bad block table")]
    NoSpace,
    #[error("I/O error")]
    Io,
    #[error("device is write protected")]
    WriteProtected,
    #[error("erase failed at {addr:#x}")]
    EraseFailed { addr: u64 },
    #[error("bad block at {offset:#x}")]
    BadBlock { offset: u64 },
    #[error("operation not supported")]
    Unsupported,
}

impl NandError {
    /// The negative errno equivalent of this error
    pub fn errno(&self) -> i32 {
        match self {
            NandError::InvalidArgument => -22,
            NandError::Timeout => -110,
            NandError::NoDevice => -19,
            NandError::Fault => -14,
            NandError::Busy => -16,
            NandError::NoMemory => -12,
            NandError::NoSpace => -28,
            NandError::Io => -5,
            NandError::WriteProtected => -30,
            NandError::EraseFailed { .. } => -5,
            NandError::BadBlock { .. } => -5,
            NandError::Unsupported => -95,
        }
    }
}

pub type Result<T> = core::result::Result<T, NandError>;

/// Outcome of a successful read, as classified from ECC statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ReadStatus {
    /// No bit errors were seen
    #[default]
    Ok,
    /// Bit errors were seen and corrected; the data is good but the block is wearing
    Corrected,
    /// At least one ECC step could not be corrected; the returned bytes are raw and suspect
    Uncorrectable,
}

impl ReadStatus {
    pub fn errno(self) -> i32 {
        match self {
            ReadStatus::Ok => 0,
            ReadStatus::Corrected => -117,
            ReadStatus::Uncorrectable => -74,
        }
    }

    /// Combine the status of two reads, keeping the worse one
    pub fn merge(self, other: ReadStatus) -> ReadStatus {
        self.max(other)
    }
}

#[test]
fn test_errno_mapping() {
    assert_eq!(NandError::InvalidArgument.errno(), -22);
    assert_eq!(NandError::Timeout.errno(), -110);
    assert_eq!(NandError::NoSpace.errno(), -28);
    assert_eq!(ReadStatus::Corrected.errno(), -117);
    assert_eq!(ReadStatus::Uncorrectable.errno(), -74);
}

#[test]
fn test_status_merge() {
    assert_eq!(ReadStatus::Ok.merge(ReadStatus::Corrected), ReadStatus::Corrected);
    assert_eq!(
        ReadStatus::Uncorrectable.merge(ReadStatus::Corrected),
        ReadStatus::Uncorrectable
    );
    assert_eq!(ReadStatus::Ok.merge(ReadStatus::Ok), ReadStatus::Ok);
}
