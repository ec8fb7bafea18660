//! Stages wired together over the in-memory broker.

use datascanner_db::ScannerDb;
use datascanner_engine::Engine;
use datascanner_pipeline::stages::Explorer;
use datascanner_pipeline::{Broker, MemoryBroker, Pipeline, PipelineConfig, StageContext, StageRunner};
use datascanner_protocol::{Message, Queue, ScanSpec, ScanTag};
use serde_json::json;
use std::fs::{self, File};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use zip::write::{FileOptions, ZipWriter};

fn file_source(root: &std::path::Path) -> serde_json::Value {
    json!({"type": "file", "path": root.to_string_lossy()})
}

#[tokio::test]
async fn test_explorer_publishes_one_message_per_file_then_acks() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("one.txt"), "1").unwrap();
    fs::write(tmp.path().join("two.txt"), "2").unwrap();
    fs::create_dir(tmp.path().join("empty")).unwrap();

    let broker = Arc::new(MemoryBroker::default());
    let spec = ScanSpec::new(ScanTag::new("test"), file_source(tmp.path()), json!({"type": "fallback"}));
    broker.publish(&spec.into()).await.unwrap();

    let ctx = StageContext::new(Arc::new(Engine::builtin().unwrap()));
    let runner = StageRunner::new(Arc::new(Explorer::new(ctx)), broker.clone() as Arc<dyn Broker>)
        .with_poll_interval(Duration::from_millis(10));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(runner.run(shutdown_rx));

    tokio::time::timeout(Duration::from_secs(10), async {
        while broker.depth(Queue::Conversions) < 2 || broker.pending().await.unwrap() != 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    shutdown_tx.send(true).unwrap();
    let stats = running.await.unwrap().unwrap();

    assert_eq!(stats.acked, 1);
    assert_eq!(stats.published, 2);
    assert_eq!(broker.depth(Queue::Sources), 0);
    let conversions = broker.take_all(Queue::Conversions).unwrap();
    let mut paths: Vec<String> = conversions
        .iter()
        .map(|message| match message {
            Message::Conversion(c) => c.handle["path"].as_str().unwrap().to_string(),
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    paths.sort();
    assert_eq!(paths, vec!["one.txt", "two.txt"]);
}

#[tokio::test]
async fn test_cpr_scan_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let share = tmp.path().join("share");
    fs::create_dir(&share).unwrap();
    fs::write(share.join("customer.txt"), "Kunde 111111-1118 ringede i dag").unwrap();
    fs::write(share.join("clean.txt"), "intet at se her").unwrap();
    let mut zip = ZipWriter::new(File::create(share.join("archive.zip")).unwrap());
    zip.start_file("old/letter.txt", FileOptions::default()).unwrap();
    zip.write_all(b"Vedr. 111111-1118").unwrap();
    zip.finish().unwrap();

    let db = ScannerDb::open(tmp.path().join("reports.sqlite3")).await.unwrap();
    let config = PipelineConfig {
        database_path: tmp.path().join("reports.sqlite3"),
        poll_interval_ms: 10,
        results_path: Some(tmp.path().join("results.jsonl")),
        ..PipelineConfig::default()
    };
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new(config.requeue_limit));
    let pipeline = Pipeline::new(config, Engine::builtin().unwrap(), db.clone(), broker);

    let tag = ScanTag::new("nightly");
    let spec = ScanSpec::new(tag.clone(), file_source(&share), json!({"type": "cpr"}));
    pipeline.submit(spec).await.unwrap();

    let stats = tokio::time::timeout(Duration::from_secs(60), pipeline.run_until_drained())
        .await
        .unwrap()
        .unwrap();
    assert!(stats.iter().all(|s| s.dead_lettered == 0));

    let all = db.list_matches(&tag.key(), false).await.unwrap();
    assert_eq!(all.len(), 3, "customer.txt, clean.txt and the zip member");
    let hits = db.list_matches(&tag.key(), true).await.unwrap();
    assert_eq!(hits.len(), 2);
    for hit in &hits {
        let fragments = hit.body["matches"].as_array().unwrap();
        assert_eq!(fragments[0]["matches"][0]["match"], "1111XXXXXX");
        assert!(db.get_metadata(&tag.key(), &hit.handle).await.unwrap().is_some());
    }
    assert!(hits.iter().any(|hit| hit.handle.contains("old/letter.txt")));
    assert!(db.list_problems(Some(&tag.key())).await.unwrap().is_empty());

    let exported = fs::read_to_string(tmp.path().join("results.jsonl")).unwrap();
    // Three verdicts and two metadata records.
    assert_eq!(exported.lines().count(), 5);
}
