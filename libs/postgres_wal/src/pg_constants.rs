//! Flag bits and resource-manager ids from the PostgreSQL headers
//! (xlogrecord.h, xlog_internal.h, rmgrlist.h). Values are stable across
//! the supported majors unless noted.

/* xlp_info flag bits */
pub const XLP_FIRST_IS_CONTRECORD: u16 = 0x0001;
pub const XLP_LONG_HEADER: u16 = 0x0002;

/* Pseudo block ids that terminate the XLogRecordBlockHeader array */
pub const XLR_BLOCK_ID_DATA_SHORT: u8 = 255;
pub const XLR_BLOCK_ID_DATA_LONG: u8 = 254;
pub const XLR_BLOCK_ID_ORIGIN: u8 = 253;
pub const XLR_BLOCK_ID_TOPLEVEL_XID: u8 = 252;
pub const XLR_MAX_BLOCK_ID: u8 = 32;

/* fork_flags in XLogRecordBlockHeader */
pub const BKPBLOCK_FORK_MASK: u8 = 0x0F;
pub const BKPBLOCK_HAS_IMAGE: u8 = 0x10;
pub const BKPBLOCK_HAS_DATA: u8 = 0x20;
pub const BKPBLOCK_WILL_INIT: u8 = 0x40;
pub const BKPBLOCK_SAME_REL: u8 = 0x80;

/* bimg_info in XLogRecordBlockImageHeader */
pub const BKPIMAGE_HAS_HOLE: u8 = 0x01;
/* before PostgreSQL 15 */
pub const BKPIMAGE_IS_COMPRESSED: u8 = 0x02;
/* PostgreSQL 15 and later */
pub const BKPIMAGE_COMPRESS_PGLZ: u8 = 0x04;
pub const BKPIMAGE_COMPRESS_LZ4: u8 = 0x08;
pub const BKPIMAGE_COMPRESS_ZSTD: u8 = 0x10;

/* Built-in resource managers, in rmgrlist.h order */
pub const RM_XLOG_ID: u8 = 0;
pub const RM_XACT_ID: u8 = 1;
pub const RM_SMGR_ID: u8 = 2;
pub const RM_CLOG_ID: u8 = 3;
pub const RM_DBASE_ID: u8 = 4;
pub const RM_TBLSPC_ID: u8 = 5;
pub const RM_MULTIXACT_ID: u8 = 6;
pub const RM_RELMAP_ID: u8 = 7;
pub const RM_STANDBY_ID: u8 = 8;
pub const RM_HEAP2_ID: u8 = 9;
pub const RM_HEAP_ID: u8 = 10;
pub const RM_BTREE_ID: u8 = 11;
pub const RM_HASH_ID: u8 = 12;
pub const RM_GIN_ID: u8 = 13;
pub const RM_GIST_ID: u8 = 14;
pub const RM_SEQ_ID: u8 = 15;
pub const RM_SPGIST_ID: u8 = 16;
pub const RM_BRIN_ID: u8 = 17;
pub const RM_COMMIT_TS_ID: u8 = 18;
pub const RM_REPLORIGIN_ID: u8 = 19;
pub const RM_GENERIC_ID: u8 = 20;
pub const RM_LOGICALMSG_ID: u8 = 21;
pub const RM_MAX_BUILTIN_ID: u8 = RM_LOGICALMSG_ID;

/* Custom resource managers occupy 128..=255 on PostgreSQL 15+ */
pub const RM_MIN_CUSTOM_ID: u8 = 128;

/* xl_info value (RM_XLOG_ID) marking the rest of a segment unused */
pub const XLOG_SWITCH: u8 = 0x40;
