//! Commit runs against a real `PrometheusStore`
//!
//! The bulk-load tool is replaced by a shell script and the reload endpoint
//! by a wiremock server.
//!
//! Run with:
//! ```bash
//! cargo test --test prometheus_commit
//! ```
#![cfg(unix)]

use ccbackfill_core::{
    parse_snapshot, Backfill, BackfillError, BackfillOptions, PricingTable, PrometheusStore,
    RunPhase, StoreConfig, StoreError, WarningKind,
};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BLOCK: &str = "01JBACKF1LLTESTBL0CK000000";

const SESSION: &[&str] = &[
    r#"{"type":"user","sessionId":"c0ffee","timestamp":"2025-03-10T08:00:00Z","message":{"content":"hi"}}"#,
    r#"{"type":"assistant","sessionId":"c0ffee","timestamp":"2025-03-10T08:00:03Z","message":{"model":"claude-haiku-4-5","usage":{"input_tokens":100,"output_tokens":40}}}"#,
];

fn fixture() -> TempDir {
    let dir = tempdir().unwrap();
    let file = dir.path().join("projects").join("-srv-app").join("c0ffee.jsonl");
    fs::create_dir_all(file.parent().unwrap()).unwrap();
    fs::write(&file, SESSION.join("\n")).unwrap();
    dir
}

/// argv template running `script` with `$1` = snapshot and `$2` = tsdb dir
fn sh(script: &str) -> Vec<String> {
    ["sh", "-c", script, "sh", "{snapshot}", "{tsdb}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

async fn reload_server(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/-/reload"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

fn commit_options(dir: &Path) -> BackfillOptions {
    BackfillOptions::commit(vec![dir.to_path_buf()], dir.join("out").join("snapshot.om"))
}

#[tokio::test]
async fn test_commit_loads_verifies_and_reloads() {
    let dir = fixture();
    let tsdb = dir.path().join("tsdb");
    let server = reload_server(200).await;
    let script = format!("cp \"$1\" \"$2/loaded.om\" && mkdir -p \"$2/{}\"", BLOCK);
    let store = PrometheusStore::new(
        StoreConfig::new(&tsdb)
            .with_url(server.uri())
            .with_bulk_load_command(sh(&script)),
    )
    .unwrap();

    let mut run = Backfill::new(commit_options(dir.path()), PricingTable::embedded());
    let outcome = run.run(&store).await.unwrap();

    assert_eq!(outcome.phase, RunPhase::Committed);
    assert!(outcome.warnings.is_empty());
    assert_eq!(outcome.receipt.as_ref().unwrap().new_blocks(), 1);

    let loaded = fs::read_to_string(tsdb.join("loaded.om")).unwrap();
    assert_eq!(loaded, outcome.snapshot.content);
    let parsed = parse_snapshot(&loaded).unwrap();
    assert!(parsed.openmetrics);
    assert!(loaded.ends_with("# EOF\n"));

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
}

#[tokio::test]
async fn test_rejected_bulk_load_keeps_snapshot() {
    let dir = fixture();
    let server = reload_server(200).await;
    let store = PrometheusStore::new(
        StoreConfig::new(dir.path().join("tsdb"))
            .with_url(server.uri())
            .with_bulk_load_command(sh("echo 'out of order sample' >&2; exit 1")),
    )
    .unwrap();

    let mut run = Backfill::new(commit_options(dir.path()), PricingTable::embedded());
    let err = run.run(&store).await.unwrap_err();

    assert_eq!(run.phase(), RunPhase::Failed);
    match err {
        BackfillError::StoreRejected { snapshot, source } => {
            assert!(snapshot.exists());
            assert!(parse_snapshot(&fs::read_to_string(&snapshot).unwrap()).is_ok());
            match source {
                StoreError::CommandFailed { stderr, .. } => {
                    assert!(stderr.contains("out of order sample"))
                }
                other => panic!("unexpected store error: {other}"),
            }
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_load_without_new_block_fails_verification() {
    let dir = fixture();
    let store = PrometheusStore::new(
        StoreConfig::new(dir.path().join("tsdb")).with_bulk_load_command(sh("true")),
    )
    .unwrap();

    let mut run = Backfill::new(commit_options(dir.path()), PricingTable::embedded());
    let err = run.run(&store).await.unwrap_err();

    assert!(matches!(
        err,
        BackfillError::StoreRejected {
            source: StoreError::NoBlocksCreated { .. },
            ..
        }
    ));
}

#[tokio::test]
async fn test_reload_failure_is_only_a_warning() {
    let dir = fixture();
    let server = reload_server(403).await;
    let store = PrometheusStore::new(
        StoreConfig::new(dir.path().join("tsdb"))
            .with_url(server.uri())
            .with_reload_timeout(Duration::from_secs(2))
            .with_bulk_load_command(sh(&format!("mkdir -p \"$2/{}\"", BLOCK))),
    )
    .unwrap();

    let mut run = Backfill::new(commit_options(dir.path()), PricingTable::embedded());
    let outcome = run.run(&store).await.unwrap();

    assert_eq!(outcome.phase, RunPhase::Committed);
    assert_eq!(outcome.warnings.count(WarningKind::ReloadFailed), 1);
}
