//
// Main entry point for the prefaulter executable.
//
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use prefaulter::agent::Agent;
use prefaulter::db::{self, PgAdapter};
use prefaulter::fhcache::FileHandleCache;
use prefaulter::iocache::IoCache;
use prefaulter::{defaults, PgMode, PrefaulterConf};
use postgres_wal::PgVersion;
use utils::logging::{self, LogFormat};
use utils::signals;

const ABOUT: &str = r#"
Runs alongside a PostgreSQL follower and reads the heap and index pages
its WAL replay is about to touch into the OS page cache, so replay never
stalls on a cold read.
"#;

#[derive(Parser)]
#[command(name = "pg_prefaulter", version, about = ABOUT, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the agent.
    Run(RunArgs),
    /// Print the version and exit.
    Version,
}

#[derive(Args)]
struct RunArgs {
    /// Database mode: primary, follower, or auto.
    #[arg(long, default_value = defaults::DEFAULT_PG_MODE)]
    mode: String,
    /// Path to the PostgreSQL data directory.
    #[arg(short = 'D', long)]
    pgdata: Utf8PathBuf,
    /// Path to postmaster.pid. Defaults to <pgdata>/postmaster.pid.
    #[arg(long)]
    pid_path: Option<Utf8PathBuf>,
    /// libpq-style connection string.
    #[arg(long, default_value = defaults::DEFAULT_CONNSTR)]
    connstr: String,
    /// Interval between control-loop ticks.
    #[arg(long, value_parser = humantime::parse_duration, default_value = defaults::DEFAULT_POLL_INTERVAL)]
    poll_interval: Duration,
    /// Maximum entries in the page dedup cache.
    #[arg(long, default_value_t = defaults::DEFAULT_IOCACHE_SIZE)]
    iocache_size: usize,
    /// How long a prefaulted page is considered hot.
    #[arg(long, value_parser = humantime::parse_duration, default_value = defaults::DEFAULT_IOCACHE_TTL)]
    iocache_ttl: Duration,
    /// Number of concurrent prefault reads.
    #[arg(long, default_value_t = defaults::DEFAULT_MAX_CONCURRENT_IOS)]
    max_concurrent_ios: usize,
    /// Upper bound on bytes of WAL to prefault ahead of replay.
    #[arg(long, default_value_t = defaults::DEFAULT_READAHEAD_BYTES)]
    readahead_bytes: u64,
    /// Maximum number of cached open relation file descriptors.
    #[arg(long, default_value_t = defaults::DEFAULT_FHCACHE_SIZE)]
    fhcache_size: usize,
    /// Format for logging, either 'plain' or 'json'.
    #[arg(long, default_value = "plain")]
    log_format: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Version => {
            println!("pg_prefaulter {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    logging::init(LogFormat::from_config(&args.log_format)?)?;

    let conf = Arc::new(PrefaulterConf {
        mode: PgMode::from_config(&args.mode)?,
        pid_path: args
            .pid_path
            .unwrap_or_else(|| args.pgdata.join("postmaster.pid")),
        pgdata: args.pgdata,
        connstr: args.connstr,
        poll_interval: args.poll_interval,
        iocache_size: args.iocache_size,
        iocache_ttl: args.iocache_ttl,
        max_concurrent_ios: args.max_concurrent_ios,
        readahead_bytes: args.readahead_bytes,
        fhcache_size: args.fhcache_size,
    });

    let version_num = db::read_pg_version(&conf.pgdata)?;
    let version = PgVersion::new(version_num);
    if version < PgVersion::MIN_SUPPORTED || version.xlog_page_magic().is_none() {
        bail!("unsupported PostgreSQL version {version} in {:?}", conf.pgdata);
    }
    match db::read_postmaster_pid(&conf.pid_path) {
        Ok(pid) => info!(pid, %version, "found running PostgreSQL"),
        // the postmaster may simply not be up yet
        Err(err) => warn!("{err:#}"),
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(signals::signal_handler(shutdown.clone()));

    let database = PgAdapter::new(conf.connstr.clone(), version, shutdown.clone());
    database
        .connect()
        .await
        .context("unable to establish initial database connection")?;

    let fhcache = Arc::new(FileHandleCache::new(conf.pgdata.clone(), conf.fhcache_size));
    let (iocache, io_workers) = IoCache::new(&conf, fhcache, shutdown.clone());
    let agent = Agent::new(
        Arc::clone(&conf),
        version,
        database,
        iocache,
        shutdown.clone(),
    );

    agent.run().await;

    // in-flight prefaults finish before we report a clean exit
    for worker in io_workers {
        if let Err(err) = worker.await {
            warn!("IO worker task panicked: {err}");
        }
    }
    info!("shut down cleanly");
    Ok(())
}
