//!
//! Common utilities for dealing with PostgreSQL relation files.
//!
//! A relation fork lives under `base/<db oid>/<rel oid>`, with a `_fsm`,
//! `_vm` or `_init` suffix for the non-main forks, split into 1 GiB
//! segment files numbered `.1`, `.2`, ... after the first.
//!

use camino::{Utf8Path, Utf8PathBuf};

use crate::{BlockNumber, Oid, BLCKSZ};

/// Blocks per 1 GiB relation segment file.
pub const RELSEG_SIZE: u32 = 1024 * 1024 * 1024 / (BLCKSZ as u32);

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FilePathError {
    #[error("invalid relation fork number")]
    InvalidForkNumber,
}

/// The physical forks of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ForkNumber {
    Main = 0,
    Fsm = 1,
    VisibilityMap = 2,
    Init = 3,
}

impl ForkNumber {
    /// Convert a fork number from an XLogRecordBlockHeader to the enum.
    pub fn try_from_u8(forknum: u8) -> Result<ForkNumber, FilePathError> {
        match forknum {
            0 => Ok(ForkNumber::Main),
            1 => Ok(ForkNumber::Fsm),
            2 => Ok(ForkNumber::VisibilityMap),
            3 => Ok(ForkNumber::Init),
            _ => Err(FilePathError::InvalidForkNumber),
        }
    }

    /// The file name suffix of this fork. "main" is not in filenames, it's
    /// implicit when no suffix is present.
    pub fn suffix(self) -> Option<&'static str> {
        match self {
            ForkNumber::Main => None,
            ForkNumber::Fsm => Some("fsm"),
            ForkNumber::VisibilityMap => Some("vm"),
            ForkNumber::Init => Some("init"),
        }
    }
}

impl std::fmt::Display for ForkNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ForkNumber::Main => "main",
            ForkNumber::Fsm => "fsm",
            ForkNumber::VisibilityMap => "vm",
            ForkNumber::Init => "init",
        })
    }
}

/// Split a block number into the 1 GiB segment file that holds it and the
/// byte offset of the page within that file.
pub fn block_to_segment(block: BlockNumber) -> (u32, u64) {
    let segno = block / RELSEG_SIZE;
    let offset = (block % RELSEG_SIZE) as u64 * BLCKSZ as u64;
    (segno, offset)
}

/// Path of a relation fork segment file relative to the data directory,
/// mirroring PostgreSQL's relpath()/_mdfd_segpath().
pub fn rel_file_path(datadir: &Utf8Path, db: Oid, rel: Oid, fork: ForkNumber, segno: u32) -> Utf8PathBuf {
    let mut name = match fork.suffix() {
        None => format!("{}", rel),
        Some(suffix) => format!("{}_{}", rel, suffix),
    };
    if segno > 0 {
        name.push_str(&format!(".{}", segno));
    }
    datadir.join("base").join(db.to_string()).join(name)
}
