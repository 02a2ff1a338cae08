#![forbid(unsafe_code)]

use super::*;
use crate::worker::{SEARCH_DIR, Step};
use pl_core::ids::EntityType;
use pl_storage::local::FsSearchIndex;
use pl_storage::{JobStatus, PLAN_ENTITY, PLAN_INDEX_DELEGATE, PlanCreateRequest, SqliteJobQueue};
use pl_sync::CommitCoordinator;
use std::collections::HashMap;
use std::sync::Arc;

fn args(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}

fn env_of(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<HashMap<_, _>>();
    move |name| vars.get(name).cloned()
}

#[test]
fn parse_args_defaults_to_run() {
    let cfg = parse_args_from(&[], env_of(&[])).expect("cfg");
    assert_eq!(cfg.command, Command::Run { once: false });
    assert_eq!(cfg.storage_dir, PathBuf::from(DEFAULT_STORAGE_DIR));
    assert_eq!(cfg.poll_ms, DEFAULT_POLL_MS);
    assert_eq!(cfg.max_attempts, DEFAULT_MAX_ATTEMPTS);
    assert_eq!(cfg.claim_lease_ms, 300_000);
    assert_eq!(cfg.sync, SyncConfig::default());
}

#[test]
fn parse_args_flags_override_env() {
    let cfg = parse_args_from(
        &args(&[
            "run",
            "--once",
            "--storage-dir",
            "/tmp/flag",
            "--poll-ms",
            "50",
            "--lease-ms",
            "2000",
        ]),
        env_of(&[
            ("PL_STORAGE_DIR", "/tmp/env"),
            ("PL_POLL_MS", "900"),
            ("PL_WORKER_ID", "w-7"),
            ("PL_QUEUE_NAME", "plans"),
        ]),
    )
    .expect("cfg");
    assert_eq!(cfg.command, Command::Run { once: true });
    assert_eq!(cfg.storage_dir, PathBuf::from("/tmp/flag"));
    assert_eq!(cfg.poll_ms, 50);
    assert_eq!(cfg.claim_lease_ms, 2_000);
    assert_eq!(cfg.worker_id, "w-7");
    assert_eq!(cfg.sync.queue_name, "plans");
}

#[test]
fn parse_args_reads_reindex_options() {
    let cfg = parse_args_from(
        &args(&["reindex", "--offset", "10", "--limit", "20", "--batch-size", "5"]),
        env_of(&[]),
    )
    .expect("cfg");
    assert_eq!(
        cfg.command,
        Command::Reindex {
            batch_size: 5,
            id: None,
            offset: 10,
            limit: Some(20),
        }
    );

    let cfg = parse_args_from(&args(&["reindex"]), env_of(&[])).expect("cfg");
    assert_eq!(
        cfg.command,
        Command::Reindex {
            batch_size: DEFAULT_REINDEX_BATCH_SIZE,
            id: None,
            offset: 0,
            limit: None,
        }
    );
}

#[test]
fn parse_args_rejects_bad_input() {
    assert!(parse_args_from(&args(&["serve"]), env_of(&[])).is_err());
    assert!(parse_args_from(&args(&["--poll-ms"]), env_of(&[])).is_err());
    assert!(parse_args_from(&args(&["--max-attempts", "0"]), env_of(&[])).is_err());
    assert!(parse_args_from(&args(&["run", "--batch-size", "5"]), env_of(&[])).is_err());
    assert!(parse_args_from(&args(&["reindex", "--once"]), env_of(&[])).is_err());
    assert!(parse_args_from(&args(&["reindex", "--lease-ms", "5"]), env_of(&[])).is_err());
    assert!(parse_args_from(&[], env_of(&[("PL_INDEX_BATCH_SIZE", "x")])).is_err());
}

fn plan(subject: &str) -> PlanCreateRequest {
    PlanCreateRequest {
        subject: subject.to_string(),
        ..PlanCreateRequest::default()
    }
}

/// Commits `subjects` through a coordinator that queues on `queue_name`.
fn commit_plans(dir: &std::path::Path, queue_name: &str, subjects: &[&str]) -> Vec<i64> {
    let services = Services::open(dir).expect("services");
    let mut store = pl_storage::SqliteStore::open(dir).expect("store");
    let queue = Arc::new(SqliteJobQueue::open(dir).expect("queue"));

    let mut coordinator = CommitCoordinator::new(SyncConfig {
        queue_name: queue_name.to_string(),
        ..SyncConfig::default()
    });
    coordinator.register_index(
        EntityType::try_new(PLAN_ENTITY).expect("type"),
        PLAN_INDEX_DELEGATE,
        services.writer.clone(),
    );
    let coordinator = Arc::new(coordinator);
    let mut sync = coordinator.register(Some(queue));

    let mut uow = store.begin(&mut sync).expect("begin");
    let ids = subjects
        .iter()
        .map(|s| uow.plan_create(plan(s)).expect("create").id)
        .collect();
    assert!(uow.commit().expect("commit").is_clean());
    ids
}

#[test]
fn run_once_applies_queued_job() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ids = commit_plans(dir.path(), "indexing", &["Noordpark", "Zuidpark"]);

    let worker = Worker::new(
        Services::open(dir.path()).expect("services"),
        "indexing".to_string(),
        "w-1".to_string(),
        3,
    );
    let Step::Ran { job_id, outcome } = worker.run_once().expect("run") else {
        panic!("expected a job");
    };
    assert_eq!(outcome.expect("report").indexed, 2);
    assert_eq!(
        worker.services().queue.status(&job_id).expect("status"),
        Some(JobStatus::Done)
    );
    assert!(matches!(worker.run_once().expect("run"), Step::Idle));

    let index = FsSearchIndex::open(dir.path().join(SEARCH_DIR)).expect("index");
    let doc = index
        .get(&ids[1].to_string())
        .expect("read")
        .expect("indexed");
    assert_eq!(doc["subject"], serde_json::json!("Zuidpark"));
}

#[test]
fn run_with_once_drains_only_its_queue() {
    let dir = tempfile::tempdir().expect("tempdir");
    commit_plans(dir.path(), "indexing", &["Eerste"]);
    commit_plans(dir.path(), "indexing", &["Tweede"]);
    commit_plans(dir.path(), "elsewhere", &["Derde"]);

    let worker = Worker::new(
        Services::open(dir.path()).expect("services"),
        "indexing".to_string(),
        "w-1".to_string(),
        3,
    );
    let stats = worker.run(Duration::from_millis(1), true).expect("run");
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.failed, 0);

    let counts = worker.services().queue.counts("elsewhere").expect("counts");
    assert_eq!(counts.queued, 1);
}

#[test]
fn job_left_running_by_a_dead_worker_is_picked_up_again() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ids = commit_plans(dir.path(), "indexing", &["Achtergelaten"]);

    let crashed = SqliteJobQueue::open(dir.path())
        .expect("queue")
        .with_claim_lease(Duration::ZERO);
    assert!(crashed.claim_next("indexing", "w-dead").expect("claim").is_some());
    drop(crashed);

    let worker = Worker::new(
        Services::open(dir.path()).expect("services"),
        "indexing".to_string(),
        "w-2".to_string(),
        3,
    );
    let Step::Ran { job_id, outcome } = worker.run_once().expect("run") else {
        panic!("expired claim should be handed out again");
    };
    assert_eq!(outcome.expect("report").indexed, 1);
    assert_eq!(
        worker.services().queue.status(&job_id).expect("status"),
        Some(JobStatus::Done)
    );

    let index = FsSearchIndex::open(dir.path().join(SEARCH_DIR)).expect("index");
    assert!(index.get(&ids[0].to_string()).expect("read").is_some());
}

#[test]
fn reindex_pages_through_plans() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ids = commit_plans(dir.path(), "unused", &["a", "b", "c", "d", "e"]);

    let services = Services::open(dir.path()).expect("services");
    assert_eq!(services.reindex(2, None, 1, Some(3)).expect("reindex"), 3);

    let index = FsSearchIndex::open(dir.path().join(SEARCH_DIR)).expect("index");
    let indexed = index.doc_ids().expect("ids");
    let expected = ids[1..4].iter().map(|id| id.to_string()).collect::<Vec<_>>();
    assert_eq!(indexed, expected);

    assert_eq!(services.reindex(2, Some(ids[0]), 0, None).expect("one"), 1);
    assert_eq!(services.reindex(2, Some(9_999), 0, None).expect("gone"), 0);
}
