//! XM (FastTracker II) file format codec.
//!
//! Loads and saves [`xm_ir::Song`] values to the binary `.xm` module format.

mod xm_format;

pub use xm_format::{load_xm, load_xm_file, save_xm, save_xm_file};

use thiserror::Error;

/// Errors from loading or saving an XM file.
#[derive(Debug, Error)]
pub enum XmError {
    /// The file has no content at all.
    #[error("file is zero bytes")]
    ZeroByteFile,
    /// The file could not be opened or read.
    #[error("could not open file: {0}")]
    OpenFailed(std::io::Error),
    /// The file does not start with the XM magic string.
    #[error("not a valid XM file")]
    BadMagic,
    /// An allocation needed to hold file data failed.
    #[error("out of memory")]
    OutOfMemory,
    /// A pattern's packed cell data ended before all rows were read.
    #[error("pattern read error")]
    PatternReadError,
    /// The file is larger than this codec is willing to load.
    #[error("file too large to load")]
    FileTooLarge,
    /// A pattern declares more rows than the format allows.
    #[error("pattern too long: {rows} rows (max {max})")]
    PatternTooLong {
        /// Declared row count.
        rows: u16,
        /// Maximum allowed row count.
        max: u16,
    },
    /// The destination disk ran out of space while saving.
    #[error("disk is full")]
    DiskFull,
}
