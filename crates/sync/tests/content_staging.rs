#![forbid(unsafe_code)]

use pl_core::ids::{EntityType, TempKey};
use pl_core::model::{AttachmentChange, EntityChange};
use pl_sync::clients::BlobStore;
use pl_sync::memory::{MemoryBlobStore, StaticTokenProvider};
use pl_sync::{ContentStager, HookChain, NoHooks, SyncConfig, UnitOfWorkHooks};
use std::sync::Arc;

fn setup() -> (Arc<MemoryBlobStore>, Arc<ContentStager>) {
    let blobs = Arc::new(MemoryBlobStore::new());
    let stager = Arc::new(ContentStager::from_config(
        blobs.clone(),
        Arc::new(StaticTokenProvider::new("svc")),
        &SyncConfig::default(),
    ));
    (blobs, stager)
}

fn plan_file(owner_id: i64, child_id: i64, temp_key: Option<TempKey>) -> EntityChange {
    EntityChange::row(EntityType::try_new("plan_file").expect("type"), child_id).with_attachment(
        AttachmentChange {
            owner_id,
            child_id,
            temp_key,
        },
    )
}

#[test]
fn uploaded_file_lands_at_its_permanent_address_on_commit() {
    let (blobs, stager) = setup();
    let key = stager.stage_temporary(b"%PDF-1.7 site plan").expect("stage");
    assert!(stager.exists(&key).expect("exists"));

    let mut staging = stager.session();
    let mut others = NoHooks;
    {
        let mut hooks = HookChain::new().with(&mut staging).with(&mut others);
        hooks
            .on_entity_created(&plan_file(10, 3, Some(key)))
            .expect("flush");
        hooks.on_before_commit().expect("before commit");
        assert!(hooks.on_after_commit().is_empty());
    }

    assert_eq!(
        blobs.object("10", "003").as_deref(),
        Some(&b"%PDF-1.7 site plan"[..])
    );
    assert_eq!(staging.pending_compensations(), 0);
}

#[test]
fn content_never_promoted_leaves_nothing_permanent() {
    let (blobs, stager) = setup();
    let key = stager.stage_temporary(b"draft").expect("stage");

    let mut staging = stager.session();
    staging.on_rollback();

    assert_eq!(blobs.containers(), vec!["temp".to_string()]);
    assert_eq!(blobs.keys("temp"), vec![key.as_str().to_string()]);
}

#[test]
fn rolled_back_promotion_is_undone() {
    let (blobs, stager) = setup();
    let key = stager.stage_temporary(b"draft").expect("stage");

    let mut staging = stager.session();
    staging
        .on_entity_created(&plan_file(10, 3, Some(key)))
        .expect("flush");
    staging.on_rollback();

    assert!(blobs.object("10", "003").is_none());
}

#[test]
fn update_with_new_content_replaces_the_old_bytes() {
    let (blobs, stager) = setup();
    stager.store_content(10, 3, b"v1").expect("seed");
    let key = stager.stage_temporary(b"v2").expect("stage");

    let mut staging = stager.session();
    staging
        .on_entity_updated(&plan_file(10, 3, Some(key)))
        .expect("flush");
    assert!(staging.on_after_commit().is_empty());

    assert_eq!(blobs.object("10", "003").as_deref(), Some(&b"v2"[..]));
}

#[test]
fn promotion_failure_fails_the_flush() {
    let (blobs, stager) = setup();
    let key = stager.stage_temporary(b"gone soon").expect("stage");
    blobs
        .delete_object(
            "temp",
            key.as_str(),
            &pl_sync::clients::AuthToken::new("svc"),
        )
        .expect("expire temp object");

    let mut staging = stager.session();
    let err = staging
        .on_entity_created(&plan_file(10, 3, Some(key)))
        .expect_err("missing temp content");
    assert!(err.to_string().contains("no such object"));
    staging.on_rollback();
    assert!(blobs.object("10", "003").is_none());
}
