use datascanner_db::{RejectOutcome, ScannerDb};
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;

const LEASE: Duration = Duration::from_secs(60);

async fn open() -> (TempDir, ScannerDb) {
    let tmp = TempDir::new().unwrap();
    let db = ScannerDb::open(tmp.path().join("queue.db")).await.unwrap();
    (tmp, db)
}

#[tokio::test]
async fn test_claim_is_fifo_and_exclusive() {
    let (_tmp, db) = open().await;
    db.enqueue("os2ds_sources", "first").await.unwrap();
    db.enqueue("os2ds_sources", "second").await.unwrap();
    db.enqueue("os2ds_problems", "elsewhere").await.unwrap();

    let first = db.claim(&["os2ds_sources"], LEASE).await.unwrap().unwrap();
    assert_eq!(first.body, "first");
    let second = db.claim(&["os2ds_sources"], LEASE).await.unwrap().unwrap();
    assert_eq!(second.body, "second");
    assert!(db.claim(&["os2ds_sources"], LEASE).await.unwrap().is_none());

    let depth = db.depth("os2ds_sources").await.unwrap();
    assert_eq!((depth.ready, depth.leased), (0, 2));

    db.ack(first.id).await.unwrap();
    assert_eq!(db.pending("os2ds_sources").await.unwrap(), 1);
    assert!(db.ack(first.id).await.is_err());
}

#[tokio::test]
async fn test_claim_spans_several_queues() {
    let (_tmp, db) = open().await;
    db.enqueue("os2ds_metadata", "m").await.unwrap();
    db.enqueue("os2ds_matches", "x").await.unwrap();

    let queues = ["os2ds_matches", "os2ds_metadata", "os2ds_problems"];
    let a = db.claim(&queues, LEASE).await.unwrap().unwrap();
    let b = db.claim(&queues, LEASE).await.unwrap().unwrap();
    assert_eq!((a.queue.as_str(), b.queue.as_str()), ("os2ds_metadata", "os2ds_matches"));
}

#[tokio::test]
async fn test_expired_lease_is_redelivered() {
    let (_tmp, db) = open().await;
    db.enqueue("os2ds_handles", "h").await.unwrap();

    let claimed = db.claim(&["os2ds_handles"], Duration::ZERO).await.unwrap().unwrap();
    let again = db.claim(&["os2ds_handles"], LEASE).await.unwrap().unwrap();
    assert_eq!(claimed.id, again.id);
    assert_eq!(again.attempts, 0);
}

#[tokio::test]
async fn test_reject_requeues_until_the_limit() {
    let (_tmp, db) = open().await;
    db.enqueue("os2ds_conversions", "flaky").await.unwrap();

    for attempt in 0..2 {
        let message = db.claim(&["os2ds_conversions"], LEASE).await.unwrap().unwrap();
        assert_eq!(message.attempts, attempt);
        let outcome = db.reject(message.id, true, "busy", 2).await.unwrap();
        assert_eq!(outcome, RejectOutcome::Requeued);
    }

    let message = db.claim(&["os2ds_conversions"], LEASE).await.unwrap().unwrap();
    let outcome = db.reject(message.id, true, "still busy", 2).await.unwrap();
    assert_eq!(outcome, RejectOutcome::DeadLettered);
    assert_eq!(db.pending("os2ds_conversions").await.unwrap(), 0);

    let dead = db.dead_letters(Some("os2ds_conversions")).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(dead[0].error.as_deref(), Some("still busy"));
}

#[tokio::test]
async fn test_malformed_messages_skip_the_requeue() {
    let (_tmp, db) = open().await;
    db.enqueue("os2ds_sources", "{not json").await.unwrap();
    let message = db.claim(&["os2ds_sources"], LEASE).await.unwrap().unwrap();
    let outcome = db.reject(message.id, false, "malformed", 5).await.unwrap();
    assert_eq!(outcome, RejectOutcome::DeadLettered);
    assert_eq!(db.dead_letters(None).await.unwrap()[0].body, "{not json");
}

#[tokio::test]
async fn test_release_does_not_count() {
    let (_tmp, db) = open().await;
    db.enqueue("os2ds_matches", "m").await.unwrap();
    let message = db.claim(&["os2ds_matches"], LEASE).await.unwrap().unwrap();
    db.release(message.id).await.unwrap();
    let again = db.claim(&["os2ds_matches"], LEASE).await.unwrap().unwrap();
    assert_eq!(again.attempts, 0);
}

#[tokio::test]
async fn test_matches_upsert_by_natural_key() {
    let (_tmp, db) = open().await;
    let tag = "nightly@2024-03-01T12:00:00+00:00";
    let handle = r#"{"path":"a.txt","type":"file"}"#;

    db.upsert_match(tag, handle, false, &json!({"matched": false})).await.unwrap();
    db.upsert_match(tag, handle, true, &json!({"matched": true})).await.unwrap();
    db.upsert_match(tag, "other", false, &json!({"matched": false})).await.unwrap();

    let all = db.list_matches(tag, false).await.unwrap();
    assert_eq!(all.len(), 2);
    let hits = db.list_matches(tag, true).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].handle, handle);
    assert_eq!(hits[0].body, json!({"matched": true}));
}

#[tokio::test]
async fn test_metadata_and_problems() {
    let (_tmp, db) = open().await;
    let tag = "nightly@2024-03-01T12:00:00+00:00";
    db.upsert_metadata(tag, "h", &json!({"filesystem-owner-uid": 1000})).await.unwrap();
    db.upsert_metadata(tag, "h", &json!({"filesystem-owner-uid": 1001})).await.unwrap();
    let metadata = db.get_metadata(tag, "h").await.unwrap().unwrap();
    assert_eq!(metadata.metadata["filesystem-owner-uid"], 1001);
    assert!(db.get_metadata(tag, "missing").await.unwrap().is_none());

    let location = json!({"type": "smb", "unc": "//srv/share"});
    db.record_problem(Some(tag), Some(&location), "unavailable", &json!({"extra": ["down"]}))
        .await
        .unwrap();
    db.record_problem(None, None, "malformed", &json!({})).await.unwrap();

    assert_eq!(db.list_problems(Some(tag)).await.unwrap().len(), 1);
    let all = db.list_problems(None).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].location.as_ref(), Some(&location));
    assert!(all[1].location.is_none());
    assert!(all[1].scan_tag.is_none());
}

#[tokio::test]
async fn test_redelivered_problem_updates_its_row() {
    let (_tmp, db) = open().await;
    let tag = "nightly@2024-03-01T12:00:00+00:00";
    let location = json!({"type": "file", "path": "/srv/share"});

    let first = db
        .record_problem(Some(tag), Some(&location), "unavailable", &json!({"extra": ["down"]}))
        .await
        .unwrap();
    let again = db
        .record_problem(Some(tag), Some(&location), "unavailable", &json!({"extra": ["still down"]}))
        .await
        .unwrap();
    db.record_problem(None, None, "malformed", &json!({})).await.unwrap();
    db.record_problem(None, None, "malformed", &json!({})).await.unwrap();

    assert_eq!(first, again);
    let all = db.list_problems(None).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].body, json!({"extra": ["still down"]}));
}
