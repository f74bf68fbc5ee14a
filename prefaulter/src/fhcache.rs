//! A bounded cache of open file descriptors for relation fork segments.
//!
//! Keys are `(database, relation, fork, 1 GiB segment)`. Values are
//! `Arc<File>`, so an evicted descriptor stays valid for a worker that is
//! mid-pread and is closed when the last reference drops; a double close
//! cannot happen.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use hashlink::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use postgres_wal::relfile_utils::{block_to_segment, rel_file_path, ForkNumber};
use postgres_wal::waldecoder::BlockRef;
use postgres_wal::{Oid, WAL_PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandleKey {
    pub database: Oid,
    pub relation: Oid,
    pub fork: ForkNumber,
    pub segno: u32,
}

pub struct FileHandleCache {
    datadir: Utf8PathBuf,
    handles: Mutex<LruCache<FileHandleKey, Arc<File>>>,
}

impl FileHandleCache {
    pub fn new(datadir: Utf8PathBuf, capacity: usize) -> FileHandleCache {
        FileHandleCache {
            datadir,
            handles: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Return a cached descriptor for the segment file, opening and
    /// inserting it on a miss. Inserting evicts the least recently used
    /// entry when the cache is full.
    fn get_or_open(&self, key: FileHandleKey) -> io::Result<Arc<File>> {
        if let Some(file) = self.handles.lock().get(&key) {
            return Ok(Arc::clone(file));
        }

        // Open outside the lock: a racing open of the same file just
        // produces a second descriptor that the insert below replaces.
        let path = rel_file_path(&self.datadir, key.database, key.relation, key.fork, key.segno);
        let file = Arc::new(File::open(&path)?);
        debug!(%path, "opened relation segment");
        self.handles.lock().insert(key, Arc::clone(&file));
        Ok(file)
    }

    /// Read the page `blockref` names into a throwaway buffer. The result
    /// is discarded; the side effect is that the OS now has the page hot.
    ///
    /// A missing relation file is the common soft failure: the relation
    /// was dropped between WAL emit and replay.
    pub fn prefault_page(&self, blockref: &BlockRef) -> io::Result<()> {
        let (segno, offset) = block_to_segment(blockref.block);
        let file = self.get_or_open(FileHandleKey {
            database: blockref.database,
            relation: blockref.relation,
            fork: blockref.fork,
            segno,
        })?;

        let mut page = [0u8; WAL_PAGE_SIZE];
        // A short read past the current end of the fork is fine: replay
        // will extend the file rather than read it.
        file.read_at(&mut page, offset)?;
        Ok(())
    }

    /// Close and drop every cached descriptor.
    pub fn purge(&self) {
        self.handles.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use postgres_wal::relfile_utils::RELSEG_SIZE;

    fn write_relation(datadir: &Utf8PathBuf, db: u32, rel: u32, pages: usize) {
        let dbdir = datadir.join("base").join(db.to_string());
        std::fs::create_dir_all(&dbdir).unwrap();
        std::fs::write(dbdir.join(rel.to_string()), vec![0x5Au8; pages * WAL_PAGE_SIZE]).unwrap();
    }

    fn testdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    fn blockref(db: u32, rel: u32, block: u32) -> BlockRef {
        BlockRef {
            database: db,
            relation: rel,
            fork: ForkNumber::Main,
            block,
        }
    }

    #[test]
    fn prefaults_existing_pages() {
        let (_guard, datadir) = testdir();
        write_relation(&datadir, 5, 1234, 3);

        let cache = FileHandleCache::new(datadir, 10);
        cache.prefault_page(&blockref(5, 1234, 0)).unwrap();
        cache.prefault_page(&blockref(5, 1234, 2)).unwrap();
        // past the end of the fork: not an error
        cache.prefault_page(&blockref(5, 1234, 99)).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn missing_relation_is_a_soft_error() {
        let (_guard, datadir) = testdir();
        let cache = FileHandleCache::new(datadir, 10);
        let err = cache.prefault_page(&blockref(5, 9999, 0)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn eviction_keeps_the_bound() {
        let (_guard, datadir) = testdir();
        for rel in 0..4u32 {
            write_relation(&datadir, 5, 1000 + rel, 1);
        }

        let cache = FileHandleCache::new(datadir, 2);
        for rel in 0..4u32 {
            cache.prefault_page(&blockref(5, 1000 + rel, 0)).unwrap();
        }
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn purge_closes_everything() {
        let (_guard, datadir) = testdir();
        write_relation(&datadir, 5, 1234, 1);

        let cache = FileHandleCache::new(datadir, 10);
        cache.prefault_page(&blockref(5, 1234, 0)).unwrap();
        assert_eq!(cache.len(), 1);
        cache.purge();
        assert!(cache.is_empty());
        // usable again after a purge
        cache.prefault_page(&blockref(5, 1234, 0)).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn blocks_resolve_into_gigabyte_segments() {
        // block RELSEG_SIZE lands in segment file ".1" at offset 0
        let (segno, offset) = block_to_segment(RELSEG_SIZE);
        assert_eq!((segno, offset), (1, 0));
    }
}
