//! Deduplicating front door for page prefault requests, plus the fixed
//! pool of workers that execute them.
//!
//! The cache maps a [`BlockRef`] to nothing but a TTL: presence itself is
//! the dedup signal. The marker is installed before the request is handed
//! to a worker, so a concurrent duplicate observes a hit instead of
//! queueing the same pread twice. A worker that fails removes the marker,
//! so the next request retries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hashlink::LruCache;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::fhcache::FileHandleCache;
use crate::PrefaulterConf;
use postgres_wal::waldecoder::BlockRef;

struct CacheEntry {
    expires_at: Instant,
}

#[derive(Default)]
pub struct IoCacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub prefault_errors: AtomicU64,
}

pub struct IoCache {
    cache: Mutex<LruCache<BlockRef, CacheEntry>>,
    ttl: std::time::Duration,
    work_tx: mpsc::Sender<BlockRef>,
    // Keeps the channel open independent of the worker tasks; workers
    // share this receiver.
    work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<BlockRef>>>,
    fhcache: Arc<FileHandleCache>,
    cancel: CancellationToken,
    stats: IoCacheStats,
}

impl IoCache {
    /// Create the cache and start `max_concurrent_ios` worker tasks.
    /// The returned handles complete once the cancellation token fires
    /// and each worker has finished its in-flight prefault.
    pub fn new(
        conf: &PrefaulterConf,
        fhcache: Arc<FileHandleCache>,
        cancel: CancellationToken,
    ) -> (Arc<IoCache>, Vec<JoinHandle<()>>) {
        // Backpressure: a saturated pool makes request() block rather
        // than queue unboundedly.
        let (work_tx, work_rx) = mpsc::channel(1);

        let iocache = Arc::new(IoCache {
            cache: Mutex::new(LruCache::new(conf.iocache_size)),
            ttl: conf.iocache_ttl,
            work_tx,
            work_rx: Arc::new(tokio::sync::Mutex::new(work_rx)),
            fhcache,
            cancel,
            stats: IoCacheStats::default(),
        });

        let workers = (0..conf.max_concurrent_ios)
            .map(|worker_id| {
                let iocache = Arc::clone(&iocache);
                let work_rx = Arc::clone(&iocache.work_rx);
                tokio::spawn(iocache.io_worker(work_rx, worker_id))
            })
            .collect();
        info!(
            io_worker_tasks = conf.max_concurrent_ios,
            "started IO worker tasks"
        );

        (iocache, workers)
    }

    async fn io_worker(
        self: Arc<IoCache>,
        work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<BlockRef>>>,
        worker_id: usize,
    ) {
        loop {
            let request = tokio::select! {
                _ = self.cancel.cancelled() => return,
                request = async { work_rx.lock().await.recv().await } => match request {
                    Some(request) => request,
                    None => return,
                },
            };

            if let Err(err) = self.fhcache.prefault_page(&request) {
                // Drop the marker so a future request retries the page.
                self.cache.lock().remove(&request);
                self.stats.prefault_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    io_worker = worker_id,
                    database = request.database,
                    relation = request.relation,
                    fork = %request.fork,
                    block = request.block,
                    %err,
                    "unable to prefault page"
                );
            }
        }
    }

    /// Ask for `blockref` to be prefaulted. A no-op while an unexpired
    /// marker for the same page exists. Blocks while the worker pool is
    /// saturated; on shutdown it returns without queueing (the marker is
    /// still installed, so a draining control loop doesn't block again on
    /// the same page).
    pub async fn request(&self, blockref: BlockRef) {
        let now = Instant::now();
        {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.get(&blockref) {
                if entry.expires_at > now {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                cache.remove(&blockref);
            }
            cache.insert(
                blockref,
                CacheEntry {
                    expires_at: now + self.ttl,
                },
            );
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        // The marker is in place before the work is queued, so concurrent
        // duplicates observe a hit while this send blocks.
        tokio::select! {
            _ = self.cancel.cancelled() => (),
            _ = self.work_tx.send(blockref) => (),
        }
    }

    /// Empty this cache and the file-handle cache below it.
    pub fn purge(&self) {
        self.cache.lock().clear();
        self.fhcache.purge();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &IoCacheStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{defaults, PgMode};
    use camino::Utf8PathBuf;
    use postgres_wal::relfile_utils::ForkNumber;
    use postgres_wal::WAL_PAGE_SIZE;
    use std::time::Duration;

    fn test_conf(datadir: &Utf8PathBuf) -> PrefaulterConf {
        PrefaulterConf {
            mode: PgMode::Follower,
            pgdata: datadir.clone(),
            pid_path: datadir.join("postmaster.pid"),
            connstr: defaults::DEFAULT_CONNSTR.to_owned(),
            poll_interval: Duration::from_secs(1),
            iocache_size: 1024,
            iocache_ttl: Duration::from_secs(60),
            max_concurrent_ios: 2,
            readahead_bytes: defaults::DEFAULT_READAHEAD_BYTES,
            fhcache_size: 16,
        }
    }

    fn testdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    fn write_relation(datadir: &Utf8PathBuf, db: u32, rel: u32, pages: usize) {
        let dbdir = datadir.join("base").join(db.to_string());
        std::fs::create_dir_all(&dbdir).unwrap();
        std::fs::write(dbdir.join(rel.to_string()), vec![0x5Au8; pages * WAL_PAGE_SIZE]).unwrap();
    }

    fn blockref(db: u32, rel: u32, block: u32) -> BlockRef {
        BlockRef {
            database: db,
            relation: rel,
            fork: ForkNumber::Main,
            block,
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached within timeout");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_requests_enqueue_once() {
        let (_guard, datadir) = testdir();
        write_relation(&datadir, 5, 1234, 1);
        let conf = test_conf(&datadir);
        let fhcache = Arc::new(FileHandleCache::new(datadir, conf.fhcache_size));
        let cancel = CancellationToken::new();
        let (iocache, workers) = IoCache::new(&conf, fhcache, cancel.clone());

        let br = blockref(5, 1234, 0);
        tokio::join!(iocache.request(br), iocache.request(br));
        iocache.request(br).await;

        assert_eq!(iocache.stats().misses.load(Ordering::Relaxed), 1);
        assert_eq!(iocache.stats().hits.load(Ordering::Relaxed), 2);
        assert_eq!(iocache.len(), 1);

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_prefault_removes_the_marker() {
        let (_guard, datadir) = testdir();
        let conf = test_conf(&datadir);
        let fhcache = Arc::new(FileHandleCache::new(datadir, conf.fhcache_size));
        let cancel = CancellationToken::new();
        let (iocache, workers) = IoCache::new(&conf, fhcache, cancel.clone());

        // the relation file does not exist
        let br = blockref(5, 40404, 0);
        iocache.request(br).await;
        wait_until(|| iocache.stats().prefault_errors.load(Ordering::Relaxed) == 1).await;
        wait_until(|| iocache.is_empty()).await;

        // an identical request re-enqueues the work
        iocache.request(br).await;
        assert_eq!(iocache.stats().misses.load(Ordering::Relaxed), 2);
        wait_until(|| iocache.stats().prefault_errors.load(Ordering::Relaxed) == 2).await;

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expired_markers_requeue() {
        let (_guard, datadir) = testdir();
        write_relation(&datadir, 5, 1234, 1);
        let mut conf = test_conf(&datadir);
        conf.iocache_ttl = Duration::from_millis(1);
        let fhcache = Arc::new(FileHandleCache::new(datadir, conf.fhcache_size));
        let cancel = CancellationToken::new();
        let (iocache, workers) = IoCache::new(&conf, fhcache, cancel.clone());

        let br = blockref(5, 1234, 0);
        iocache.request(br).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        iocache.request(br).await;
        assert_eq!(iocache.stats().misses.load(Ordering::Relaxed), 2);

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn purge_cascades_to_the_file_handle_cache() {
        let (_guard, datadir) = testdir();
        write_relation(&datadir, 5, 1234, 1);
        let conf = test_conf(&datadir);
        let fhcache = Arc::new(FileHandleCache::new(datadir, conf.fhcache_size));
        let cancel = CancellationToken::new();
        let (iocache, workers) = IoCache::new(&conf, Arc::clone(&fhcache), cancel.clone());

        iocache.request(blockref(5, 1234, 0)).await;
        wait_until(|| fhcache.len() == 1).await;

        iocache.purge();
        assert!(iocache.is_empty());
        assert!(fhcache.is_empty());

        cancel.cancel();
        for worker in workers {
            worker.await.unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_unblocks_a_saturated_loader() {
        let (_guard, datadir) = testdir();
        write_relation(&datadir, 5, 1234, 1);
        let mut conf = test_conf(&datadir);
        conf.max_concurrent_ios = 0; // nobody drains the channel
        let fhcache = Arc::new(FileHandleCache::new(datadir, conf.fhcache_size));
        let cancel = CancellationToken::new();
        let (iocache, workers) = IoCache::new(&conf, fhcache, cancel.clone());
        assert!(workers.is_empty());

        // first request fills the channel, second blocks until cancel
        iocache.request(blockref(5, 1234, 0)).await;
        let blocked = {
            let iocache = Arc::clone(&iocache);
            tokio::spawn(async move { iocache.request(blockref(5, 1234, 1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());
        cancel.cancel();
        blocked.await.unwrap();

        // the marker was still installed
        assert_eq!(iocache.len(), 2);
    }
}
