//
// WAL file naming and segment arithmetic.
//
// A WAL file name is 24 uppercase hex characters: the timeline, then the
// "WAL id" (high 32 bits of the LSN), then the segment index within that
// WAL id. Several of these functions are counterparts of PostgreSQL's
// xlog_internal.h macros and keep similar names.
//

use crate::{TimeLineId, XLogSegNo, WAL_SEGMENT_SIZE};
use utils::lsn::Lsn;

pub const XLOG_FNAME_LEN: usize = 24;

/// Number of segments that share one WAL id: 2^32 / 16 MiB = 256.
pub const SEGMENTS_PER_WAL_ID: u64 = 0x1_0000_0000 / WAL_SEGMENT_SIZE as u64;

/// We tried to parse a WAL file name, but it wasn't one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed WAL file name: {0:?}")]
pub struct MalformedWalFileName(pub String);

pub fn wal_file_name(tli: TimeLineId, segno: XLogSegNo) -> String {
    format!(
        "{:>08X}{:>08X}{:>08X}",
        tli,
        segno / SEGMENTS_PER_WAL_ID,
        segno % SEGMENTS_PER_WAL_ID
    )
}

/// Format the name of the segment containing `lsn`.
pub fn lsn_to_wal_file_name(tli: TimeLineId, lsn: Lsn) -> String {
    wal_file_name(tli, lsn.segment_number(WAL_SEGMENT_SIZE as u64))
}

/// Parse a WAL file name into its timeline and the LSN of the start of the
/// segment it covers.
pub fn parse_wal_file_name(fname: &str) -> Result<(TimeLineId, Lsn), MalformedWalFileName> {
    let malformed = || MalformedWalFileName(fname.to_owned());
    if fname.len() != XLOG_FNAME_LEN || !fname.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(malformed());
    }
    let tli = u32::from_str_radix(&fname[0..8], 16).map_err(|_| malformed())?;
    let wal_id = u32::from_str_radix(&fname[8..16], 16).map_err(|_| malformed())?;
    let seg_idx = u32::from_str_radix(&fname[16..24], 16).map_err(|_| malformed())?;
    if seg_idx as u64 >= SEGMENTS_PER_WAL_ID {
        return Err(malformed());
    }
    let segno = wal_id as u64 * SEGMENTS_PER_WAL_ID + seg_idx as u64;
    Ok((tli, Lsn(segno * WAL_SEGMENT_SIZE as u64)))
}

/// Names of the segments covering `[lsn, lsn + max_bytes)`, in increasing
/// order, starting with the segment containing `lsn`.
///
/// The last segment index of a WAL id (0xFF) is reserved per PostgreSQL
/// convention and never named: 0xFE rolls straight over to 0x00 of the next
/// WAL id. The result is never empty.
pub fn readahead(tli: TimeLineId, lsn: Lsn, max_bytes: u64) -> Vec<String> {
    let start_segno = lsn.segment_number(WAL_SEGMENT_SIZE as u64);
    let last_byte = lsn.0.saturating_add(max_bytes.saturating_sub(1));
    let mut last_segno = std::cmp::max(start_segno, last_byte / WAL_SEGMENT_SIZE as u64);

    let mut names = Vec::with_capacity((last_segno - start_segno + 1) as usize);
    let mut segno = start_segno;
    while segno <= last_segno {
        if segno != start_segno && segno % SEGMENTS_PER_WAL_ID == SEGMENTS_PER_WAL_ID - 1 {
            // the bytes this index would have covered live in the next
            // segment, so the window extends one segment further
            last_segno += 1;
            segno += 1;
            continue;
        }
        names.push(wal_file_name(tli, segno));
        segno += 1;
    }
    names
}
