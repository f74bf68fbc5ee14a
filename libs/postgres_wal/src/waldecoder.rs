//!
//! Decoder for a single on-disk WAL segment file.
//!
//! The decoder walks the segment page by page, reassembles records that
//! straddle page boundaries, verifies record CRCs, and yields a
//! [`BlockRef`] for every heap/index page a record will touch on replay.
//!
//! A segment on a live follower is usually only partially written, so a
//! zero length word, a CRC mismatch, or plain EOF are all normal ways for
//! a segment to end: the decoder stops cleanly and keeps everything
//! gathered so far. Only a wrong page magic or an unknown resource manager
//! inside a CRC-valid record are reported as errors, and even those are
//! advisory for the caller.
//!

use std::cmp::min;
use std::collections::VecDeque;
use std::io::Read;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::pg_constants::*;
use crate::relfile_utils::ForkNumber;
use crate::{
    bkpimage_is_compressed, Oid, PgVersion, XLogPageHeaderData, XLogLongPageHeaderData,
    XLogRecord, WAL_SEGMENT_SIZE, XLOG_BLCKSZ, XLOG_RECORD_CRC_OFFS, XLOG_SIZE_OF_XLOG_LONG_PHD,
    XLOG_SIZE_OF_XLOG_RECORD, XLOG_SIZE_OF_XLOG_SHORT_PHD,
};
use utils::lsn::Lsn;

/// One page a WAL record will touch on replay: the currency of the
/// prefault pipeline. Plain value, hashable, totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockRef {
    pub database: Oid,
    pub relation: Oid,
    pub fork: ForkNumber,
    pub block: u32,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} at {lsn}")]
pub struct WalDecodeError {
    pub kind: WalDecodeErrorKind,
    pub lsn: Lsn,
}

#[derive(Debug, Clone)]
pub enum WalDecodeErrorKind {
    /// Page header magic doesn't match the given server version.
    CorruptHeader { expected: u16, found: u16 },
    /// Resource manager id outside the known range in a CRC-valid record.
    UnknownRmgr(u8),
    /// The major version has no known WAL page magic.
    UnsupportedVersion(u32),
}

impl std::fmt::Display for WalDecodeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalDecodeErrorKind::CorruptHeader { expected, found } => write!(
                f,
                "corrupt page header: expected magic {expected:#06X}, found {found:#06X}"
            ),
            WalDecodeErrorKind::UnknownRmgr(rmid) => write!(f, "unknown rmgr id {rmid}"),
            WalDecodeErrorKind::UnsupportedVersion(v) => {
                write!(f, "unsupported PostgreSQL version {v}")
            }
        }
    }
}

/// Resource managers whose records touch heap/index pages worth
/// prefaulting. Everything else is skipped silently.
fn rmgr_is_prefaultable(rmid: u8) -> bool {
    matches!(
        rmid,
        RM_HEAP2_ID
            | RM_HEAP_ID
            | RM_BTREE_ID
            | RM_HASH_ID
            | RM_GIN_ID
            | RM_GIST_ID
            | RM_SEQ_ID
            | RM_SPGIST_ID
            | RM_BRIN_ID
            | RM_GENERIC_ID
    )
}

pub struct WalSegmentDecoder<R> {
    reader: R,
    version: PgVersion,
    magic: Option<u16>,

    /// Position of the next input byte not yet consumed.
    lsn: Lsn,
    seg_end: Lsn,

    contlen: u32,
    padlen: u32,
    /// Reassembling the tail of a record that started in the previous
    /// segment: consume it, emit nothing.
    skipping_contrecord: bool,

    inputbuf: BytesMut,
    recordbuf: BytesMut,

    pending: VecDeque<BlockRef>,
    finished: bool,
    error: Option<WalDecodeError>,
}

impl<R: Read> WalSegmentDecoder<R> {
    /// `seg_start` is the LSN of the first byte of the segment, as derived
    /// from its file name; `reader` must be positioned at the start of the
    /// file.
    pub fn new(version: PgVersion, seg_start: Lsn, reader: R) -> WalSegmentDecoder<R> {
        WalSegmentDecoder {
            reader,
            version,
            magic: version.xlog_page_magic(),
            lsn: seg_start,
            seg_end: seg_start + WAL_SEGMENT_SIZE as u64,
            contlen: 0,
            padlen: 0,
            skipping_contrecord: false,
            inputbuf: BytesMut::new(),
            recordbuf: BytesMut::new(),
            pending: VecDeque::new(),
            finished: false,
            error: None,
        }
    }

    /// The error that stopped decoding, if any. Truncation is not an
    /// error; this is only set for a corrupt header or unknown rmgr.
    pub fn error(&self) -> Option<&WalDecodeError> {
        self.error.as_ref()
    }

    /// Pull the next page worth of file bytes into the input buffer.
    /// Returns false when the file (or the segment) is exhausted; read
    /// errors end the input the same way truncation does.
    fn fill(&mut self) -> bool {
        let fed = self.lsn.0 + self.inputbuf.remaining() as u64;
        let want = min(
            XLOG_BLCKSZ as u64,
            self.seg_end.0.saturating_sub(fed),
        ) as usize;
        if want == 0 {
            return false;
        }
        let mut chunk = vec![0u8; want];
        match self.reader.read(&mut chunk) {
            Ok(0) => false,
            Ok(n) => {
                self.inputbuf.extend_from_slice(&chunk[..n]);
                true
            }
            Err(err) => {
                tracing::debug!("read error in WAL segment at {}: {}", self.lsn, err);
                false
            }
        }
    }

    /// True if `n` contiguous input bytes are available, filling as needed.
    fn ensure(&mut self, n: usize) -> bool {
        while self.inputbuf.remaining() < n {
            if !self.fill() {
                return false;
            }
        }
        true
    }

    /// Decode the next complete record, stitching across page boundaries.
    ///
    /// `Ok(None)` is the clean end of the decodable part of the segment:
    /// EOF, zeros, an invalid length, a CRC mismatch, a recycled page, or
    /// an XLOG_SWITCH record.
    fn poll_record(&mut self) -> Result<Option<Bytes>, WalDecodeError> {
        loop {
            if self.lsn >= self.seg_end {
                return Ok(None);
            }
            if self.lsn.segment_offset(WAL_SEGMENT_SIZE as u64) == 0 {
                // long page header at the segment start
                if !self.ensure(XLOG_SIZE_OF_XLOG_LONG_PHD) {
                    return Ok(None);
                }
                let hdr = XLogLongPageHeaderData::from_bytes(&mut self.inputbuf);
                self.check_magic(hdr.std.xlp_magic)?;
                if hdr.std.xlp_pageaddr != self.lsn.0 {
                    // recycled segment still carrying old contents
                    return Ok(None);
                }
                self.lsn += XLOG_SIZE_OF_XLOG_LONG_PHD as u64;
                if hdr.std.xlp_info & XLP_FIRST_IS_CONTRECORD != 0 && hdr.std.xlp_rem_len > 0 {
                    // tail of a record begun in the previous segment
                    self.contlen = hdr.std.xlp_rem_len;
                    self.skipping_contrecord = true;
                }
                continue;
            } else if self.lsn.block_offset() == 0 {
                if !self.ensure(XLOG_SIZE_OF_XLOG_SHORT_PHD) {
                    return Ok(None);
                }
                let hdr = XLogPageHeaderData::from_bytes(&mut self.inputbuf);
                self.check_magic(hdr.xlp_magic)?;
                if hdr.xlp_pageaddr != self.lsn.0 {
                    return Ok(None);
                }
                self.lsn += XLOG_SIZE_OF_XLOG_SHORT_PHD as u64;
                continue;
            } else if self.padlen > 0 {
                // alignment padding never crosses a page boundary: both
                // record starts and page boundaries are 8-byte aligned
                if !self.ensure(self.padlen as usize) {
                    return Ok(None);
                }
                self.inputbuf.advance(self.padlen as usize);
                self.lsn += self.padlen as u64;
                self.padlen = 0;
            } else if self.contlen == 0 {
                // the length word of a record never straddles a page
                // boundary (record starts are 8-byte aligned)
                if !self.ensure(4) {
                    return Ok(None);
                }
                let xl_tot_len = self.inputbuf.get_u32_le();
                if xl_tot_len < XLOG_SIZE_OF_XLOG_RECORD as u32 {
                    // zeros: the tail of a partially-written segment
                    return Ok(None);
                }
                self.lsn += 4;

                self.recordbuf.clear();
                self.recordbuf.reserve(xl_tot_len as usize);
                self.recordbuf.put_u32_le(xl_tot_len);
                self.contlen = xl_tot_len - 4;
                continue;
            } else {
                // continuing a record, possibly from a previous page
                let pageleft = self.lsn.remaining_in_block() as u32;
                let n = min(self.contlen, pageleft) as usize;
                if !self.ensure(n) {
                    return Ok(None);
                }
                if self.skipping_contrecord {
                    self.inputbuf.advance(n);
                } else {
                    self.recordbuf.put(self.inputbuf.split_to(n));
                }
                self.lsn += n as u64;
                self.contlen -= n as u32;
                if self.contlen > 0 {
                    continue;
                }

                self.padlen = self.lsn.calc_padding(8u32) as u32;
                if self.skipping_contrecord {
                    self.skipping_contrecord = false;
                    continue;
                }

                let recordbuf = std::mem::take(&mut self.recordbuf).freeze();
                if !record_crc_ok(&recordbuf) {
                    // mid-record tail of the WAL on a live system
                    return Ok(None);
                }
                let xlogrec = XLogRecord::from_bytes(&mut recordbuf.clone());
                if xlogrec.is_xlog_switch_record() {
                    // the rest of the segment is unused
                    return Ok(None);
                }
                return Ok(Some(recordbuf));
            }
        }
    }

    fn check_magic(&self, found: u16) -> Result<(), WalDecodeError> {
        let expected = match self.magic {
            Some(m) => m,
            None => {
                return Err(WalDecodeError {
                    kind: WalDecodeErrorKind::UnsupportedVersion(self.version.version_num()),
                    lsn: self.lsn,
                })
            }
        };
        if found != expected {
            return Err(WalDecodeError {
                kind: WalDecodeErrorKind::CorruptHeader { expected, found },
                lsn: self.lsn,
            });
        }
        Ok(())
    }

    /// Walk the XLogRecordBlockHeaders of a CRC-valid record and collect
    /// the pages it touches. See xlogrecord.h for the layout:
    /// XLogRecord, then block headers (each optionally followed by an
    /// image header and a RelFileNode), then a data header, then data.
    fn extract_block_refs(&self, record: &Bytes) -> Result<Vec<BlockRef>, WalDecodeError> {
        let mut buf = record.clone();
        let xlogrec = XLogRecord::from_bytes(&mut buf);

        let rmid = xlogrec.xl_rmid;
        let custom_rmgr = self.version.is_at_least(150000) && rmid >= RM_MIN_CUSTOM_ID;
        if rmid > RM_MAX_BUILTIN_ID && !custom_rmgr {
            return Err(WalDecodeError {
                kind: WalDecodeErrorKind::UnknownRmgr(rmid),
                lsn: self.lsn,
            });
        }
        if !rmgr_is_prefaultable(rmid) {
            return Ok(Vec::new());
        }

        let mut blocks = Vec::new();
        let mut rnode_dbnode: Oid = 0;
        let mut rnode_relnode: Oid = 0;
        let mut got_rnode = false;
        let mut datatotal: usize = 0;

        while buf.remaining() > datatotal {
            let block_id = buf.get_u8();
            match block_id {
                XLR_BLOCK_ID_DATA_SHORT => {
                    if buf.remaining() < 1 {
                        break;
                    }
                    datatotal += buf.get_u8() as usize;
                }
                XLR_BLOCK_ID_DATA_LONG => {
                    if buf.remaining() < 4 {
                        break;
                    }
                    datatotal += buf.get_u32_le() as usize;
                }
                XLR_BLOCK_ID_ORIGIN => {
                    if buf.remaining() < 2 {
                        break;
                    }
                    buf.advance(2);
                }
                XLR_BLOCK_ID_TOPLEVEL_XID => {
                    if buf.remaining() < 4 {
                        break;
                    }
                    buf.advance(4);
                }
                0..=XLR_MAX_BLOCK_ID => {
                    if buf.remaining() < 3 {
                        break;
                    }
                    let fork_flags = buf.get_u8();
                    let data_len = buf.get_u16_le();
                    datatotal += data_len as usize;

                    if fork_flags & BKPBLOCK_HAS_IMAGE != 0 {
                        if buf.remaining() < 5 {
                            break;
                        }
                        let bimg_len = buf.get_u16_le();
                        buf.advance(2); // hole_offset
                        let bimg_info = buf.get_u8();
                        if bkpimage_is_compressed(bimg_info, self.version)
                            && bimg_info & BKPIMAGE_HAS_HOLE != 0
                        {
                            if buf.remaining() < 2 {
                                break;
                            }
                            buf.advance(2); // hole_length
                        }
                        datatotal += bimg_len as usize;
                    }
                    if fork_flags & BKPBLOCK_SAME_REL == 0 {
                        if buf.remaining() < 12 {
                            break;
                        }
                        buf.advance(4); // tablespace; relations resolve under base/
                        rnode_dbnode = buf.get_u32_le();
                        rnode_relnode = buf.get_u32_le();
                        got_rnode = true;
                    } else if !got_rnode {
                        break;
                    }
                    if buf.remaining() < 4 {
                        break;
                    }
                    let blkno = buf.get_u32_le();

                    if let Ok(fork) = ForkNumber::try_from_u8(fork_flags & BKPBLOCK_FORK_MASK) {
                        blocks.push(BlockRef {
                            database: rnode_dbnode,
                            relation: rnode_relnode,
                            fork,
                            block: blkno,
                        });
                    }
                }
                _ => break,
            }
        }

        Ok(blocks)
    }
}

fn record_crc_ok(record: &[u8]) -> bool {
    if record.len() < XLOG_SIZE_OF_XLOG_RECORD {
        return false;
    }
    let expected = u32::from_le_bytes(
        record[XLOG_RECORD_CRC_OFFS..XLOG_RECORD_CRC_OFFS + 4]
            .try_into()
            .expect("4-byte slice"),
    );
    let crc = crc32c::crc32c(&record[XLOG_SIZE_OF_XLOG_RECORD..]);
    let crc = crc32c::crc32c_append(crc, &record[..XLOG_RECORD_CRC_OFFS]);
    crc == expected
}

impl<R: Read> Iterator for WalSegmentDecoder<R> {
    type Item = BlockRef;

    fn next(&mut self) -> Option<BlockRef> {
        loop {
            if let Some(blockref) = self.pending.pop_front() {
                return Some(blockref);
            }
            if self.finished {
                return None;
            }
            match self.poll_record() {
                Ok(Some(record)) => match self.extract_block_refs(&record) {
                    Ok(refs) => self.pending.extend(refs),
                    Err(err) => {
                        self.error = Some(err);
                        self.finished = true;
                    }
                },
                Ok(None) => self.finished = true,
                Err(err) => {
                    self.error = Some(err);
                    self.finished = true;
                }
            }
        }
    }
}
