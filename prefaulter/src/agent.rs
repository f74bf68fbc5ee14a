//! The control loop: polls PostgreSQL for where replay is, predicts the
//! WAL segments replay is about to consume, decodes them, and feeds every
//! page reference into the I/O cache.

use std::cmp::min;
use std::io::BufReader;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::{DbState, PgAdapter};
use crate::iocache::IoCache;
use crate::{PgMode, PrefaulterConf};
use postgres_wal::waldecoder::WalSegmentDecoder;
use postgres_wal::xlog_utils::{lsn_to_wal_file_name, parse_wal_file_name, readahead};
use postgres_wal::{PgVersion, TimeLineId};
use utils::lsn::Lsn;

/// WAL position bookkeeping across ticks. Guarded by one lock: readers
/// are the stats logger, the writer is the tick.
#[derive(Debug, Default)]
struct WalProgress {
    /// Zero until the first successful poll; a change afterwards means a
    /// failover happened and every cached page is semantically stale.
    last_timeline_id: TimeLineId,
    /// Most recently observed WAL file, for the segment counter only.
    last_wal_log: Option<String>,
    wal_segments_advanced: u64,
}

pub struct Agent {
    conf: Arc<PrefaulterConf>,
    version: PgVersion,
    db: PgAdapter,
    iocache: Arc<IoCache>,
    cancel: CancellationToken,
    progress: Mutex<WalProgress>,
}

impl Agent {
    pub fn new(
        conf: Arc<PrefaulterConf>,
        version: PgVersion,
        db: PgAdapter,
        iocache: Arc<IoCache>,
        cancel: CancellationToken,
    ) -> Agent {
        Agent {
            conf,
            version,
            db,
            iocache,
            cancel,
            progress: Mutex::new(WalProgress::default()),
        }
    }

    /// Tick until the shutdown token fires.
    pub async fn run(&self) {
        info!(
            mode = ?self.conf.mode,
            poll_interval = ?self.conf.poll_interval,
            "agent started"
        );
        let mut ticker = tokio::time::interval(self.conf.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
        info!("agent stopped");
    }

    /// One pass of the control loop. Nothing in here is fatal: every
    /// failure is logged and retried on the next tick.
    async fn tick(&self) {
        let state = match self.db_state().await {
            Ok(state) => state,
            Err(err) => {
                warn!("unable to determine whether database is primary or follower, retrying: {err:#}");
                return;
            }
        };

        let (timeline, lsns) = match self.db.oldest_unreplayed_lsns().await {
            Ok(result) => result,
            Err(err) => {
                warn!("unable to query checkpoint information, retrying: {err:#}");
                return;
            }
        };
        self.observe_timeline(timeline);

        for lsn in lsns {
            self.note_wal_file(&lsn_to_wal_file_name(timeline, lsn));

            let wal_files = match self.predict_wal_filenames(state, timeline, lsn).await {
                Ok(wal_files) => wal_files,
                Err(err) => {
                    debug!(%lsn, "unable to predict WAL filenames: {err:#}");
                    continue;
                }
            };
            for wal_file in wal_files {
                if self.cancel.is_cancelled() {
                    return;
                }
                self.prefault_segment(&wal_file).await;
            }
        }

        self.log_stats();
    }

    async fn db_state(&self) -> anyhow::Result<DbState> {
        match self.conf.mode {
            PgMode::Primary => Ok(DbState::Primary),
            PgMode::Follower => Ok(DbState::Follower),
            // re-queried every tick: a promotion can happen at any time
            PgMode::Auto => Ok(if self.db.is_in_recovery().await? {
                DbState::Follower
            } else {
                DbState::Primary
            }),
        }
    }

    /// A timeline change means the heap now has different contents behind
    /// the same block addresses: purge everything before any reference
    /// from the new timeline is enqueued.
    fn observe_timeline(&self, timeline: TimeLineId) {
        let mut progress = self.progress.lock();
        if progress.last_timeline_id != timeline {
            if progress.last_timeline_id != 0 {
                info!(
                    old = progress.last_timeline_id,
                    new = timeline,
                    "timeline changed, purging caches"
                );
                self.iocache.purge();
            }
            progress.last_timeline_id = timeline;
        }
    }

    fn note_wal_file(&self, wal_file: &str) {
        let mut progress = self.progress.lock();
        if progress.last_wal_log.as_deref() != Some(wal_file) {
            // only count once we've initialised ourselves to a last log
            if progress.last_wal_log.is_some() {
                progress.wal_segments_advanced += 1;
            }
            progress.last_wal_log = Some(wal_file.to_owned());
        }
    }

    /// Forecast the WAL files replay will consume next, starting from the
    /// segment containing `lsn`. A primary has nothing to fault in, so the
    /// forecast is empty. On a follower the horizon is the configured
    /// readahead clamped to the apply lag, so we never read past what the
    /// primary has actually sent.
    async fn predict_wal_filenames(
        &self,
        state: DbState,
        timeline: TimeLineId,
        lsn: Lsn,
    ) -> anyhow::Result<Vec<String>> {
        match state {
            DbState::Primary => Ok(Vec::new()),
            DbState::Follower => {
                let lag = self
                    .db
                    .visibility_lag_bytes(state)
                    .await
                    .unwrap_or_else(|err| {
                        warn!("unable to query follower lag: {err:#}");
                        None
                    });
                let max_bytes = match lag {
                    Some(lag_bytes) => min(self.conf.readahead_bytes, lag_bytes),
                    // unknown lag: stay within the current segment
                    None => 0,
                };
                Ok(readahead(timeline, lsn, max_bytes))
            }
        }
    }

    /// Decode one WAL segment file and offer every block reference to the
    /// I/O cache. A missing segment is routine (not yet received, or
    /// already recycled); decode errors are advisory.
    async fn prefault_segment(&self, wal_file: &str) {
        let (_, seg_start) = match parse_wal_file_name(wal_file) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("{err}");
                return;
            }
        };

        let path = self
            .conf
            .pgdata
            .join(self.version.wal_dir())
            .join(wal_file);
        let file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(%path, "WAL segment not present, skipping");
                return;
            }
            Err(err) => {
                warn!(%path, "unable to open WAL segment: {err}");
                return;
            }
        };

        let mut decoder = WalSegmentDecoder::new(self.version, seg_start, BufReader::new(file));
        let mut refs = 0usize;
        for blockref in &mut decoder {
            if self.cancel.is_cancelled() {
                return;
            }
            self.iocache.request(blockref).await;
            refs += 1;
        }
        if let Some(err) = decoder.error() {
            warn!(walfile = wal_file, "WAL decode stopped early: {err}");
        }
        debug!(walfile = wal_file, refs, "decoded WAL segment");
    }

    fn log_stats(&self) {
        use std::sync::atomic::Ordering;
        let stats = self.iocache.stats();
        let progress = self.progress.lock();
        debug!(
            timeline = progress.last_timeline_id,
            wal_segments_advanced = progress.wal_segments_advanced,
            iocache_len = self.iocache.len(),
            hits = stats.hits.load(Ordering::Relaxed),
            misses = stats.misses.load(Ordering::Relaxed),
            prefault_errors = stats.prefault_errors.load(Ordering::Relaxed),
            "iocache stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fhcache::FileHandleCache;
    use crate::{defaults, PgMode};
    use camino::Utf8PathBuf;
    use postgres_wal::relfile_utils::ForkNumber;
    use postgres_wal::waldecoder::BlockRef;
    use std::time::Duration;

    fn testdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    fn test_agent(datadir: &Utf8PathBuf, mode: PgMode) -> (Agent, CancellationToken) {
        let conf = Arc::new(PrefaulterConf {
            mode,
            pgdata: datadir.clone(),
            pid_path: datadir.join("postmaster.pid"),
            connstr: defaults::DEFAULT_CONNSTR.to_owned(),
            poll_interval: Duration::from_secs(1),
            iocache_size: 1024,
            iocache_ttl: Duration::from_secs(60),
            max_concurrent_ios: 1,
            readahead_bytes: defaults::DEFAULT_READAHEAD_BYTES,
            fhcache_size: 16,
        });
        let version = PgVersion::new(140000);
        let cancel = CancellationToken::new();
        let fhcache = Arc::new(FileHandleCache::new(datadir.clone(), conf.fhcache_size));
        let (iocache, _workers) = IoCache::new(&conf, fhcache, cancel.clone());
        let db = PgAdapter::new(conf.connstr.clone(), version, cancel.clone());
        (
            Agent::new(conf, version, db, iocache, cancel.clone()),
            cancel,
        )
    }

    fn write_relation(datadir: &Utf8PathBuf, db: u32, rel: u32, pages: usize) {
        let dbdir = datadir.join("base").join(db.to_string());
        std::fs::create_dir_all(&dbdir).unwrap();
        std::fs::write(dbdir.join(rel.to_string()), vec![0u8; pages * 8192]).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn primary_predicts_no_wal_files() {
        let (_guard, datadir) = testdir();
        let (agent, _cancel) = test_agent(&datadir, PgMode::Primary);
        let wal_files = agent
            .predict_wal_filenames(DbState::Primary, 1, Lsn(0x0000_0002_AB00_0000))
            .await
            .unwrap();
        assert!(wal_files.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timeline_change_purges_the_caches() {
        let (_guard, datadir) = testdir();
        write_relation(&datadir, 5, 1234, 1);
        let (agent, _cancel) = test_agent(&datadir, PgMode::Follower);

        agent.observe_timeline(7);
        agent
            .iocache
            .request(BlockRef {
                database: 5,
                relation: 1234,
                fork: ForkNumber::Main,
                block: 0,
            })
            .await;
        assert_eq!(agent.iocache.len(), 1);

        // same timeline: nothing happens
        agent.observe_timeline(7);
        assert_eq!(agent.iocache.len(), 1);

        // new timeline: caches are emptied before any new reference
        agent.observe_timeline(8);
        assert!(agent.iocache.is_empty());
        assert_eq!(agent.progress.lock().last_timeline_id, 8);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn first_observed_timeline_does_not_purge() {
        let (_guard, datadir) = testdir();
        write_relation(&datadir, 5, 1234, 1);
        let (agent, _cancel) = test_agent(&datadir, PgMode::Follower);

        agent
            .iocache
            .request(BlockRef {
                database: 5,
                relation: 1234,
                fork: ForkNumber::Main,
                block: 0,
            })
            .await;
        agent.observe_timeline(7);
        assert_eq!(agent.iocache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn wal_segment_counter_counts_transitions() {
        let (_guard, datadir) = testdir();
        let (agent, _cancel) = test_agent(&datadir, PgMode::Follower);

        agent.note_wal_file("0000000100000002000000AB");
        assert_eq!(agent.progress.lock().wal_segments_advanced, 0);
        agent.note_wal_file("0000000100000002000000AB");
        assert_eq!(agent.progress.lock().wal_segments_advanced, 0);
        agent.note_wal_file("0000000100000002000000AC");
        assert_eq!(agent.progress.lock().wal_segments_advanced, 1);
        agent.note_wal_file("0000000100000002000000AD");
        assert_eq!(agent.progress.lock().wal_segments_advanced, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_wal_segment_is_skipped() {
        let (_guard, datadir) = testdir();
        std::fs::create_dir_all(datadir.join("pg_wal")).unwrap();
        let (agent, _cancel) = test_agent(&datadir, PgMode::Follower);
        // must not error or panic
        agent.prefault_segment("0000000100000002000000AB").await;
        assert!(agent.iocache.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn db_state_follows_configured_mode() {
        let (_guard, datadir) = testdir();
        let (agent, _cancel) = test_agent(&datadir, PgMode::Primary);
        assert_eq!(agent.db_state().await.unwrap(), DbState::Primary);

        let (agent, _cancel) = test_agent(&datadir, PgMode::Follower);
        assert_eq!(agent.db_state().await.unwrap(), DbState::Follower);
    }
}
