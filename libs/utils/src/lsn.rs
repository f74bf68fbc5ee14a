#![warn(missing_docs)]

use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

/// WAL pages are 8 KiB.
const BLCKSZ: u64 = 8192;

/// A position in the WAL stream: PostgreSQL's XLogRecPtr, a 64-bit byte
/// offset from the beginning of the cluster's history.
#[derive(Debug, Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
pub struct Lsn(pub u64);

/// The string was not a valid `hi/lo` LSN.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid LSN")]
pub struct LsnParseError;

impl Lsn {
    /// Which `seg_sz`-byte WAL segment this position falls in.
    pub fn segment_number(self, seg_sz: u64) -> u64 {
        self.0 / seg_sz
    }

    /// Byte offset of this position within its WAL segment.
    pub fn segment_offset(self, seg_sz: u64) -> u64 {
        self.0 % seg_sz
    }

    /// Byte offset of this position within its WAL page.
    pub fn block_offset(self) -> u64 {
        self.0 % BLCKSZ
    }

    /// Bytes left on the WAL page holding this position. On the page
    /// boundary the whole page is left.
    pub fn remaining_in_block(self) -> u64 {
        BLCKSZ - (self.0 % BLCKSZ)
    }

    /// Bytes of padding that bring this position up to an `sz` boundary;
    /// zero if it is already aligned.
    pub fn calc_padding<T: Into<u64>>(self, sz: T) -> u64 {
        let sz: u64 = sz.into();
        // subtract first, mod second: an aligned position must yield 0,
        // not a full chunk
        (sz.wrapping_sub(self.0)) % sz
    }
}

impl FromStr for Lsn {
    type Err = LsnParseError;

    /// Parse the `hi/lo` form the server prints, e.g. `2/AB000000`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s.split_once('/').ok_or(LsnParseError)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| LsnParseError)?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| LsnParseError)?;
        Ok(Lsn((hi as u64) << 32 | lo as u64))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 as u32)
    }
}

impl Add<u64> for Lsn {
    type Output = Lsn;

    fn add(self, other: u64) -> Self::Output {
        // running off the end of the 64-bit WAL address space is a bug
        Lsn(self.0.checked_add(other).unwrap())
    }
}

impl AddAssign<u64> for Lsn {
    fn add_assign(&mut self, other: u64) {
        self.0 = self.0.checked_add(other).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        assert_eq!("2/AB000000".parse(), Ok(Lsn(0x0000_0002_AB00_0000)));
        assert_eq!("0/0".parse(), Ok(Lsn(0)));
        assert_eq!("FFFFFFFF/FFFFFFFF".parse(), Ok(Lsn(u64::MAX)));
        "".parse::<Lsn>().unwrap_err();
        "2AB000000".parse::<Lsn>().unwrap_err(); // no separator
        "2/AB000000/0".parse::<Lsn>().unwrap_err();
        "2/xyz".parse::<Lsn>().unwrap_err();
        "2/1AB000000".parse::<Lsn>().unwrap_err(); // low half wider than 32 bits
        "-2/AB000000".parse::<Lsn>().unwrap_err();

        assert_eq!(Lsn(0x0000_0002_AB00_0000).to_string(), "2/AB000000");
        assert_eq!(Lsn(3).to_string(), "0/3");
    }

    #[test]
    fn segment_and_page_arithmetic() {
        let seg_sz = 16u64 * 1024 * 1024;
        let lsn = Lsn(2 * seg_sz + 100);
        assert_eq!(lsn.segment_number(seg_sz), 2);
        assert_eq!(lsn.segment_offset(seg_sz), 100);

        assert_eq!(Lsn(3 * 8192).block_offset(), 0);
        assert_eq!(Lsn(3 * 8192 + 17).block_offset(), 17);
        assert_eq!(Lsn(3 * 8192).remaining_in_block(), 8192);
        assert_eq!(Lsn(3 * 8192 + 17).remaining_in_block(), 8175);

        assert_eq!(Lsn(24).calc_padding(8u32), 0);
        assert_eq!(Lsn(25).calc_padding(8u32), 7);
        assert_eq!(Lsn(31).calc_padding(8u32), 1);
        assert_eq!(Lsn(0).calc_padding(seg_sz), 0);
    }

    #[test]
    fn addition_advances_the_position() {
        assert_eq!(Lsn(1000) + 24u64, Lsn(1024));

        let mut lsn = Lsn(1000);
        lsn += 24u64;
        assert_eq!(lsn, Lsn(1024));
    }
}
