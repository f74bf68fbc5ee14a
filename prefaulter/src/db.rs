//! Thin accessors for the PostgreSQL state the control loop needs: am I a
//! follower, where is replay, and how far behind is it. Also the two
//! filesystem artefacts read at startup (postmaster.pid, PG_VERSION).
//!
//! The connection is established lazily and dropped on any query error so
//! the next tick reconnects; after startup, losing the database is always
//! a transient condition.

use std::fmt;

use anyhow::{anyhow, Context};
use camino::Utf8Path;
use tokio_postgres::{Client, NoTls};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use postgres_wal::{PgVersion, TimeLineId};
use utils::lsn::Lsn;

/// What the database is, as far as prefaulting is concerned. The agent
/// only ever acts on one of these two; "don't know yet" is an error from
/// [`PgAdapter`], not a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    Primary,
    Follower,
}

impl fmt::Display for DbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DbState::Primary => "primary",
            DbState::Follower => "follower",
        })
    }
}

/// SQL per version family. The `xlog` function family was renamed to
/// `wal` in PostgreSQL 10; on 10+ the replayed (not received) position is
/// what matters for prefaulting.
struct Queries {
    replay_lsn: &'static str,
    receive_lsn: &'static str,
    lag_follower: &'static str,
    lag_primary: &'static str,
}

static QUERIES_V9: Queries = Queries {
    replay_lsn: "SELECT pg_last_xlog_replay_location()::text",
    receive_lsn: "SELECT pg_last_xlog_receive_location()::text",
    lag_follower: "SELECT pg_xlog_location_diff(pg_last_xlog_receive_location(), \
                   pg_last_xlog_replay_location())::float8",
    lag_primary: "SELECT MAX(pg_xlog_location_diff(pg_current_xlog_location(), \
                  replay_location))::float8 FROM pg_stat_replication",
};

static QUERIES_V10: Queries = Queries {
    replay_lsn: "SELECT pg_last_wal_replay_lsn()::text",
    receive_lsn: "SELECT pg_last_wal_receive_lsn()::text",
    lag_follower: "SELECT pg_wal_lsn_diff(pg_last_wal_receive_lsn(), \
                   pg_last_wal_replay_lsn())::float8",
    lag_primary: "SELECT MAX(pg_wal_lsn_diff(pg_current_wal_lsn(), \
                  replay_lsn))::float8 FROM pg_stat_replication",
};

const TIMELINE_SQL: &str = "SELECT timeline_id FROM pg_control_checkpoint()";
const IN_RECOVERY_SQL: &str = "SELECT pg_is_in_recovery()";

pub struct PgAdapter {
    connstr: String,
    queries: &'static Queries,
    cancel: CancellationToken,
    client: tokio::sync::Mutex<Option<Client>>,
}

impl PgAdapter {
    pub fn new(connstr: String, version: PgVersion, cancel: CancellationToken) -> PgAdapter {
        let queries = if version.is_at_least(100000) {
            &QUERIES_V10
        } else {
            &QUERIES_V9
        };
        PgAdapter {
            connstr,
            queries,
            cancel,
            client: tokio::sync::Mutex::new(None),
        }
    }

    /// Establish the initial connection. Failure here is fatal to startup;
    /// afterwards the adapter reconnects on its own.
    pub async fn connect(&self) -> anyhow::Result<()> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(self.establish().await?);
        }
        Ok(())
    }

    async fn establish(&self) -> anyhow::Result<Client> {
        let (client, connection) = tokio_postgres::connect(&self.connstr, NoTls)
            .await
            .context("unable to connect to PostgreSQL")?;
        // The connection object performs the actual communication with
        // the database, so spawn it off to run on its own.
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("postgres connection error: {err}");
            }
        });

        let row = client
            .query_one("SELECT version()", &[])
            .await
            .context("unable to query DB version")?;
        debug!(version = row.get::<_, String>(0), "established DB connection");
        Ok(client)
    }

    /// Run a single-row query against the (lazily re-established)
    /// connection. On error the client is dropped so the next call
    /// reconnects.
    async fn query_one(&self, sql: &str) -> anyhow::Result<tokio_postgres::Row> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(self.establish().await?);
        }
        let client = guard.as_ref().expect("client just established");

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(anyhow!("shutting down")),
            row = client.query_one(sql, &[]) => row.with_context(|| format!("query failed: {sql}")),
        };
        if result.is_err() {
            *guard = None;
        }
        result
    }

    pub async fn is_in_recovery(&self) -> anyhow::Result<bool> {
        let row = self.query_one(IN_RECOVERY_SQL).await?;
        Ok(row.get::<_, bool>(0))
    }

    /// The current timeline plus the LSNs replay still has to catch up
    /// from: the replay position, then the receive position when the
    /// server reports one. Each is an independent prefault origin.
    pub async fn oldest_unreplayed_lsns(&self) -> anyhow::Result<(TimeLineId, Vec<Lsn>)> {
        let row = self.query_one(TIMELINE_SQL).await?;
        let timeline = row.get::<_, i32>(0) as TimeLineId;

        let mut lsns = Vec::with_capacity(2);
        for sql in [self.queries.replay_lsn, self.queries.receive_lsn] {
            let row = self.query_one(sql).await?;
            if let Some(text) = row.get::<_, Option<String>>(0) {
                let lsn: Lsn = text
                    .parse()
                    .map_err(|_| anyhow!("unparseable LSN from database: {text:?}"))?;
                lsns.push(lsn);
            }
        }
        Ok((timeline, lsns))
    }

    /// Bytes of WAL the follower has received but not yet replayed (or,
    /// on a primary, the worst replay lag across its standbys). `None`
    /// when the database can't tell us.
    pub async fn visibility_lag_bytes(&self, state: DbState) -> anyhow::Result<Option<u64>> {
        let sql = match state {
            DbState::Primary => self.queries.lag_primary,
            DbState::Follower => self.queries.lag_follower,
        };
        let row = self.query_one(sql).await?;
        let lag = row.get::<_, Option<f64>>(0);
        Ok(lag.map(|bytes| bytes.max(0.0) as u64))
    }
}

/// First line of `postmaster.pid`: the postmaster's PID.
pub fn read_postmaster_pid(path: &Utf8Path) -> anyhow::Result<u32> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read PostgreSQL postmaster PID file {path:?}"))?;
    let first_line = contents
        .lines()
        .next()
        .ok_or_else(|| anyhow!("empty postmaster PID file {path:?}"))?;
    first_line
        .trim()
        .parse()
        .with_context(|| format!("unable to parse PostgreSQL PID number {first_line:?}"))
}

/// Read `<pgdata>/PG_VERSION` and normalise it the way
/// `server_version_num` would, except the minor is always zero: PG_VERSION
/// only records the major.
pub fn read_pg_version(datadir: &Utf8Path) -> anyhow::Result<u32> {
    let path = datadir.join("PG_VERSION");
    let contents =
        std::fs::read_to_string(&path).with_context(|| format!("unable to read {path:?}"))?;
    let first_line = contents
        .lines()
        .next()
        .ok_or_else(|| anyhow!("empty version file {path:?}"))?;
    normalize_pg_version(first_line)
}

/// `9.6` → 90600, `10` → 100000, `11` → 110000.
pub fn normalize_pg_version(raw: &str) -> anyhow::Result<u32> {
    let raw = raw.trim();
    let mut parts = raw.split('.');
    let first: u32 = parts
        .next()
        .unwrap_or_default()
        .parse()
        .with_context(|| format!("unable to parse version string {raw:?}"))?;
    if first < 10 {
        let second: u32 = parts
            .next()
            .ok_or_else(|| anyhow!("version {raw:?} is missing its minor part"))?
            .parse()
            .with_context(|| format!("unable to parse version string {raw:?}"))?;
        Ok(first * 10000 + second * 100)
    } else {
        Ok(first * 10000)
    }
}
