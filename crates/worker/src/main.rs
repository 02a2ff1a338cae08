#![forbid(unsafe_code)]

mod worker;

#[cfg(test)]
mod tests;

use pl_storage::DEFAULT_CLAIM_LEASE_MS;
use pl_sync::SyncConfig;
use std::path::PathBuf;
use std::time::Duration;
use worker::{Services, Worker};

const DEFAULT_STORAGE_DIR: &str = ".plans";
const DEFAULT_POLL_MS: u64 = 1_000;
const DEFAULT_MAX_ATTEMPTS: i64 = 5;
const DEFAULT_REINDEX_BATCH_SIZE: usize = 5_000;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Drain the index queue; with `once`, stop when it is empty.
    Run { once: bool },
    Reindex {
        batch_size: usize,
        id: Option<i64>,
        offset: usize,
        limit: Option<usize>,
    },
}

#[derive(Debug, Clone)]
struct WorkerConfig {
    storage_dir: PathBuf,
    worker_id: String,
    poll_ms: u64,
    max_attempts: i64,
    /// How long a claimed job stays ours before another worker may take it.
    claim_lease_ms: u64,
    sync: SyncConfig,
    command: Command,
}

fn usage() -> &'static str {
    "pl_worker: apply queued plan index jobs\n\n\
USAGE:\n\
  pl_worker run [--once] [--storage-dir DIR] [--worker-id ID]\n\
                [--poll-ms MS] [--max-attempts N] [--lease-ms MS]\n\
  pl_worker reindex [--storage-dir DIR] [--batch-size N]\n\
                    [--id ID] [--offset N] [--limit N]\n\n\
ENVIRONMENT:\n\
  PL_STORAGE_DIR, PL_WORKER_ID, PL_POLL_MS, PL_MAX_ATTEMPTS, PL_CLAIM_LEASE_MS\n\
  PL_QUEUE_NAME, PL_INDEX_BATCH_SIZE, PL_INDEX_ATTACHMENTS, PL_TEMP_CONTAINER\n\
  RUST_LOG (tracing filter, default `info`)\n\n\
NOTES:\n\
  - jobs are delivered at least once; a failed job is retried until it has\n\
    been tried --max-attempts times.\n\
  - a job claimed by a worker that disappears is handed out again once its\n\
    --lease-ms has passed.\n\
  - `reindex` re-projects plans straight into the index, bypassing the queue.\n"
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_args() -> Result<WorkerConfig, String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        print!("{}", usage());
        std::process::exit(0);
    }
    parse_args_from(&args, env_var)
}

fn parse_args_from(
    args: &[String],
    env: impl Fn(&str) -> Option<String>,
) -> Result<WorkerConfig, String> {
    let sync = SyncConfig::from_lookup(&env).map_err(|e| e.to_string())?;

    let mut storage_dir = env("PL_STORAGE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR));
    let mut worker_id = env("PL_WORKER_ID")
        .unwrap_or_else(|| format!("pl_worker-{}", std::process::id()));
    let mut poll_ms: u64 = env("PL_POLL_MS")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_POLL_MS);
    let mut max_attempts: i64 = env("PL_MAX_ATTEMPTS")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_ATTEMPTS);
    let mut claim_lease_ms: u64 = env("PL_CLAIM_LEASE_MS")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_CLAIM_LEASE_MS.unsigned_abs());

    let mut once = false;
    let mut batch_size = DEFAULT_REINDEX_BATCH_SIZE;
    let mut id: Option<i64> = None;
    let mut offset = 0usize;
    let mut limit: Option<usize> = None;

    let (subcommand, rest) = match args.split_first() {
        Some((first, rest)) if !first.starts_with("--") => (first.as_str(), rest),
        _ => ("run", args),
    };
    let reindex = match subcommand {
        "run" => false,
        "reindex" => true,
        other => return Err(format!("unknown command {other:?}\n\n{}", usage())),
    };

    let mut i = 0usize;
    while i < rest.len() {
        let a = rest[i].as_str();
        match a {
            "--storage-dir" => {
                i += 1;
                let v = rest.get(i).ok_or("--storage-dir requires DIR")?;
                storage_dir = PathBuf::from(v);
            }
            "--worker-id" => {
                i += 1;
                let v = rest.get(i).ok_or("--worker-id requires ID")?;
                worker_id = v.to_string();
            }
            "--poll-ms" => {
                i += 1;
                let v = rest.get(i).ok_or("--poll-ms requires MS")?;
                poll_ms = v
                    .parse::<u64>()
                    .map_err(|_| "--poll-ms must be an integer (milliseconds)")?;
            }
            "--max-attempts" => {
                i += 1;
                let v = rest.get(i).ok_or("--max-attempts requires N")?;
                max_attempts = v
                    .parse::<i64>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or("--max-attempts must be a positive integer")?;
            }
            "--lease-ms" if !reindex => {
                i += 1;
                let v = rest.get(i).ok_or("--lease-ms requires MS")?;
                claim_lease_ms = v
                    .parse::<u64>()
                    .map_err(|_| "--lease-ms must be an integer (milliseconds)")?;
            }
            "--once" if !reindex => {
                once = true;
            }
            "--batch-size" if reindex => {
                i += 1;
                let v = rest.get(i).ok_or("--batch-size requires N")?;
                batch_size = v
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or("--batch-size must be a positive integer")?;
            }
            "--id" if reindex => {
                i += 1;
                let v = rest.get(i).ok_or("--id requires ID")?;
                id = Some(v.parse::<i64>().map_err(|_| "--id must be an integer")?);
            }
            "--offset" if reindex => {
                i += 1;
                let v = rest.get(i).ok_or("--offset requires N")?;
                offset = v
                    .parse::<usize>()
                    .map_err(|_| "--offset must be a non-negative integer")?;
            }
            "--limit" if reindex => {
                i += 1;
                let v = rest.get(i).ok_or("--limit requires N")?;
                limit = Some(
                    v.parse::<usize>()
                        .map_err(|_| "--limit must be a non-negative integer")?,
                );
            }
            other => return Err(format!("unexpected argument {other:?}\n\n{}", usage())),
        }
        i += 1;
    }

    let command = if reindex {
        Command::Reindex {
            batch_size,
            id,
            offset,
            limit,
        }
    } else {
        Command::Run { once }
    };

    Ok(WorkerConfig {
        storage_dir,
        worker_id,
        poll_ms,
        max_attempts,
        claim_lease_ms,
        sync,
        command,
    })
}

fn setup_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = match parse_args() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    };
    setup_tracing();

    let services = Services::open(&cfg.storage_dir)?
        .with_claim_lease(Duration::from_millis(cfg.claim_lease_ms));
    tracing::info!(
        storage_dir = %cfg.storage_dir.display(),
        queue = %cfg.sync.queue_name,
        command = ?cfg.command,
        "pl_worker starting"
    );

    match cfg.command {
        Command::Run { once } => {
            let worker = Worker::new(
                services,
                cfg.sync.queue_name.clone(),
                cfg.worker_id.clone(),
                cfg.max_attempts,
            );
            let stats = worker.run(Duration::from_millis(cfg.poll_ms), once)?;
            tracing::info!(
                completed = stats.completed,
                retried = stats.retried,
                failed = stats.failed,
                "pl_worker stopped"
            );
        }
        Command::Reindex {
            batch_size,
            id,
            offset,
            limit,
        } => {
            let submitted = services.reindex(batch_size, id, offset, limit)?;
            tracing::info!(submitted, "reindex finished");
        }
    }
    Ok(())
}
