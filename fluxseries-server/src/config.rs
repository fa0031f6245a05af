//! Command-line configuration

use clap::Parser;
use fluxseries_core::docstore::StoreConfig;
use fluxseries_core::query::PipelineConfig;
use fluxseries_core::writer::WriterConfig;
use fluxseries_core::EngineConfig;
use std::path::PathBuf;
use std::time::Duration;

fn default_workers() -> usize {
    fluxseries_core::config::doc_workers()
}

/// Time-series JSON document store with bucketed aggregate queries
#[derive(Parser, Debug, Clone)]
#[command(
    name = "fluxseries",
    version,
    about = "Time-series JSON document store with bucketed aggregate queries",
    after_help = "EXAMPLES:\n    \
        fluxseries --root /var/lib/fluxseries\n    \
        fluxseries --addr 0.0.0.0:3133 --memcbind 0.0.0.0:11211 --cache-size 50000\n    \
        RUST_LOG=fluxseries_core=debug fluxseries --flush-time 1s"
)]
pub struct ServerArgs {
    /// HTTP listen address
    #[arg(long, default_value = "0.0.0.0:3133", value_name = "ADDR")]
    pub addr: String,

    /// memcached binary protocol listen address (disabled when unset)
    #[arg(long, value_name = "ADDR")]
    pub memcbind: Option<String>,

    /// Directory holding the database files
    #[arg(long, default_value = "db", value_name = "DIR")]
    pub root: PathBuf,

    /// Commit pending writes after this long without new ones
    #[arg(long, default_value = "5s", value_parser = parse_duration)]
    pub flush_time: Duration,

    /// Close a database after this long without activity
    #[arg(long, default_value = "5m", value_parser = parse_duration)]
    pub live_time: Duration,

    /// Pending operations that force an immediate commit
    #[arg(long, default_value_t = fluxseries_core::config::MAX_BATCH, value_name = "NUM")]
    pub max_op_queue: usize,

    /// Per-database write mailbox capacity
    #[arg(long, default_value_t = fluxseries_core::config::QUEUE_DEPTH, value_name = "NUM")]
    pub queue_depth: usize,

    /// Document processing workers
    #[arg(long, default_value_t = default_workers(), value_name = "NUM")]
    pub doc_workers: usize,

    /// Document processing input backlog
    #[arg(long, default_value_t = fluxseries_core::config::DOC_BACKLOG, value_name = "NUM")]
    pub doc_backlog: usize,

    /// Bucket results to memoize (0 disables the cache tier)
    #[arg(long, default_value_t = 0, value_name = "NUM")]
    pub cache_size: usize,

    /// Cache tier workers
    #[arg(long, default_value_t = fluxseries_core::config::CACHE_WORKERS, value_name = "NUM")]
    pub cache_workers: usize,

    /// Cache tier input backlog
    #[arg(long, default_value_t = fluxseries_core::config::CACHE_BACKLOG, value_name = "NUM")]
    pub cache_backlog: usize,

    /// Maximum time a query may run
    #[arg(long, default_value = "1m", value_parser = parse_duration)]
    pub query_timeout: Duration,

    /// Maximum time to wait for databases to close on shutdown
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub shutdown_timeout: Duration,

    /// Skip fsync after each commit
    #[arg(long)]
    pub no_fsync: bool,

    /// Log every HTTP request
    #[arg(long)]
    pub log_access: bool,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

impl ServerArgs {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            data_dir: self.root.clone(),
            writer: WriterConfig {
                flush_interval: self.flush_time,
                live_interval: self.live_time,
                max_batch: self.max_op_queue.max(1),
                queue_depth: self.queue_depth,
                store: StoreConfig {
                    sync_on_commit: !self.no_fsync,
                    ..Default::default()
                },
            },
            pipeline: PipelineConfig {
                doc_workers: self.doc_workers.max(1),
                doc_backlog: self.doc_backlog,
                cache_workers: self.cache_workers.max(1),
                cache_backlog: self.cache_backlog,
            },
            cache_size: self.cache_size,
            query_timeout: self.query_timeout,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

/// Parse `250ms`, `5s`, `2m`, `1h`; a bare number is seconds
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let value: f64 = num
        .parse()
        .map_err(|_| format!("invalid duration: {:?}", s))?;
    let secs = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit {:?}", other)),
    };
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration {:?}: {}", s, e))
}
