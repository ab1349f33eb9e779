//! Metrics store adapter
//!
//! `MetricsStore` is the seam between the orchestrator and the time-series
//! database. `PrometheusStore` bulk-loads a snapshot with
//! `promtool tsdb create-blocks-from openmetrics`, checks that new blocks
//! appeared in the TSDB directory, then asks the server to reload.

use crate::error::StoreError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

pub const DEFAULT_PROMETHEUS_URL: &str = "http://localhost:9090";
pub const DEFAULT_RELOAD_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BULK_LOAD_COMMAND: [&str; 6] = [
    "promtool",
    "tsdb",
    "create-blocks-from",
    "openmetrics",
    "{snapshot}",
    "{tsdb}",
];

/// Bytes of bulk-load stderr kept for reporting
const STDERR_TAIL_BYTES: usize = 2048;

/// Outcome of a bulk load, completed by `verify`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkLoadReceipt {
    pub snapshot: PathBuf,
    pub tsdb_dir: PathBuf,
    pub blocks_before: usize,
    pub blocks_after: usize,
    pub stderr_tail: String,
}

impl BulkLoadReceipt {
    pub fn new_blocks(&self) -> usize {
        self.blocks_after.saturating_sub(self.blocks_before)
    }
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    fn name(&self) -> &str;

    /// Hand a written snapshot to the store's bulk-load facility
    async fn bulk_load(&self, snapshot: &Path) -> Result<BulkLoadReceipt, StoreError>;

    /// Confirm the store accepted the data
    async fn verify(&self, receipt: BulkLoadReceipt) -> Result<BulkLoadReceipt, StoreError> {
        Ok(receipt)
    }

    /// Make loaded data queryable, attempted once
    async fn reload(&self) -> Result<(), StoreError>;
}

/// Prometheus store settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub tsdb_dir: PathBuf,
    pub url: String,
    pub reload_timeout: Duration,
    /// argv template, `{snapshot}` and `{tsdb}` are substituted
    pub bulk_load_command: Vec<String>,
}

impl StoreConfig {
    pub fn new(tsdb_dir: impl Into<PathBuf>) -> Self {
        Self {
            tsdb_dir: tsdb_dir.into(),
            url: DEFAULT_PROMETHEUS_URL.to_string(),
            reload_timeout: DEFAULT_RELOAD_TIMEOUT,
            bulk_load_command: DEFAULT_BULK_LOAD_COMMAND
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_reload_timeout(mut self, timeout: Duration) -> Self {
        self.reload_timeout = timeout;
        self
    }

    pub fn with_bulk_load_command(mut self, command: Vec<String>) -> Self {
        self.bulk_load_command = command;
        self
    }

    /// Command argv with placeholders replaced
    pub fn expand_command(&self, snapshot: &Path) -> Vec<String> {
        let snapshot = snapshot.display().to_string();
        let tsdb = self.tsdb_dir.display().to_string();
        self.bulk_load_command
            .iter()
            .map(|arg| arg.replace("{snapshot}", &snapshot).replace("{tsdb}", &tsdb))
            .collect()
    }

    pub fn reload_url(&self) -> String {
        format!("{}/-/reload", self.url.trim_end_matches('/'))
    }
}

/// Prometheus TSDB reached through promtool and the HTTP reload endpoint
pub struct PrometheusStore {
    config: StoreConfig,
    client: reqwest::Client,
}

impl PrometheusStore {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|source| StoreError::Reload {
                url: config.reload_url(),
                source,
            })?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    async fn count_blocks(&self) -> Result<usize, StoreError> {
        count_blocks(&self.config.tsdb_dir).await
    }
}

#[async_trait]
impl MetricsStore for PrometheusStore {
    fn name(&self) -> &str {
        "prometheus"
    }

    async fn bulk_load(&self, snapshot: &Path) -> Result<BulkLoadReceipt, StoreError> {
        let argv = self.config.expand_command(snapshot);
        let (program, args) = argv.split_first().ok_or(StoreError::EmptyCommand)?;

        tokio::fs::create_dir_all(&self.config.tsdb_dir)
            .await
            .map_err(|source| StoreError::TsdbInspect {
                path: self.config.tsdb_dir.clone(),
                source,
            })?;
        let blocks_before = self.count_blocks().await?;

        info!(command = %argv.join(" "), blocks_before, "Running bulk load");
        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| StoreError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stderr_tail = tail(&String::from_utf8_lossy(&output.stderr), STDERR_TAIL_BYTES);
        if !output.status.success() {
            return Err(StoreError::CommandFailed {
                status: output.status.to_string(),
                stderr: stderr_tail,
            });
        }
        debug!(stderr = %stderr_tail, "Bulk load command finished");

        Ok(BulkLoadReceipt {
            snapshot: snapshot.to_path_buf(),
            tsdb_dir: self.config.tsdb_dir.clone(),
            blocks_before,
            blocks_after: blocks_before,
            stderr_tail,
        })
    }

    async fn verify(&self, mut receipt: BulkLoadReceipt) -> Result<BulkLoadReceipt, StoreError> {
        receipt.blocks_after = self.count_blocks().await?;
        if receipt.blocks_after <= receipt.blocks_before {
            return Err(StoreError::NoBlocksCreated {
                tsdb_dir: receipt.tsdb_dir,
            });
        }
        info!(new_blocks = receipt.new_blocks(), "Bulk load verified");
        Ok(receipt)
    }

    async fn reload(&self) -> Result<(), StoreError> {
        let url = self.config.reload_url();
        let timeout = self.config.reload_timeout;

        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|source| {
                if source.is_timeout() {
                    StoreError::Timeout {
                        url: url.clone(),
                        timeout,
                    }
                } else {
                    StoreError::Reload {
                        url: url.clone(),
                        source,
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::ReloadStatus {
                url,
                status: status.as_u16(),
            });
        }
        info!(url = %url, "Prometheus reloaded");
        Ok(())
    }
}

/// TSDB block directories are named by a 26 character ULID
fn is_block_dir_name(name: &str) -> bool {
    name.len() == 26 && name.chars().all(|c| c.is_ascii_alphanumeric())
}

async fn count_blocks(dir: &Path) -> Result<usize, StoreError> {
    let inspect_error = |source: std::io::Error| StoreError::TsdbInspect {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(inspect_error(e)),
    };

    let mut count = 0;
    while let Some(entry) = entries.next_entry().await.map_err(inspect_error)? {
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        if is_dir && is_block_dir_name(&entry.file_name().to_string_lossy()) {
            count += 1;
        }
    }
    Ok(count)
}

/// Last `max_bytes` of `text`, on a char boundary
fn tail(text: &str, max_bytes: usize) -> String {
    let text = text.trim_end();
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BLOCK: &str = "01ABCDEFGHJKMNPQRSTVWXYZ00";

    fn sh(script: &str) -> Vec<String> {
        ["sh", "-c", script, "sh", "{snapshot}", "{tsdb}"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_expand_command_substitutes_placeholders() {
        let config = StoreConfig::new("/prometheus");
        assert_eq!(
            config.expand_command(Path::new("/tmp/snap.om")),
            vec![
                "promtool",
                "tsdb",
                "create-blocks-from",
                "openmetrics",
                "/tmp/snap.om",
                "/prometheus"
            ]
        );
        assert_eq!(
            config.with_url("http://prom:9090/").reload_url(),
            "http://prom:9090/-/reload"
        );
    }

    #[test]
    fn test_block_dir_names_and_tail() {
        assert!(is_block_dir_name(BLOCK));
        assert!(!is_block_dir_name("wal"));
        assert!(!is_block_dir_name("chunks_head"));
        assert_eq!(tail("abcdef\n", 3), "def");
        assert_eq!(tail("short", 100), "short");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bulk_load_and_verify_new_block() {
        let dir = tempdir().unwrap();
        let tsdb = dir.path().join("tsdb");
        let script = format!("mkdir -p \"$2/{}\"", BLOCK);
        let store =
            PrometheusStore::new(StoreConfig::new(&tsdb).with_bulk_load_command(sh(&script)))
                .unwrap();

        let receipt = store.bulk_load(Path::new("/tmp/snap.om")).await.unwrap();
        assert_eq!(receipt.blocks_before, 0);

        let receipt = store.verify(receipt).await.unwrap();
        assert_eq!(receipt.new_blocks(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_command_is_rejected_with_stderr() {
        let dir = tempdir().unwrap();
        let store = PrometheusStore::new(
            StoreConfig::new(dir.path())
                .with_bulk_load_command(sh("echo 'out of order sample' >&2; exit 3")),
        )
        .unwrap();

        match store.bulk_load(Path::new("/tmp/snap.om")).await {
            Err(StoreError::CommandFailed { stderr, .. }) => {
                assert_eq!(stderr, "out of order sample")
            }
            other => panic!("expected CommandFailed, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_verify_without_new_block_fails() {
        let dir = tempdir().unwrap();
        let store =
            PrometheusStore::new(StoreConfig::new(dir.path()).with_bulk_load_command(sh("true")))
                .unwrap();

        let receipt = store.bulk_load(Path::new("/tmp/snap.om")).await.unwrap();
        assert!(matches!(
            store.verify(receipt).await,
            Err(StoreError::NoBlocksCreated { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_command_template() {
        let dir = tempdir().unwrap();
        let store =
            PrometheusStore::new(StoreConfig::new(dir.path()).with_bulk_load_command(Vec::new()))
                .unwrap();
        assert!(matches!(
            store.bulk_load(Path::new("x")).await,
            Err(StoreError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = tempdir().unwrap();
        let store = PrometheusStore::new(
            StoreConfig::new(dir.path())
                .with_bulk_load_command(vec!["ccbackfill-no-such-promtool".to_string()]),
        )
        .unwrap();
        assert!(matches!(
            store.bulk_load(Path::new("x")).await,
            Err(StoreError::Spawn { .. })
        ));
    }

    #[tokio::test]
    async fn test_reload_posts_to_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/-/reload"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store =
            PrometheusStore::new(StoreConfig::new("/unused").with_url(server.uri())).unwrap();
        store.reload().await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/-/reload"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let store =
            PrometheusStore::new(StoreConfig::new("/unused").with_url(server.uri())).unwrap();
        assert!(matches!(
            store.reload().await,
            Err(StoreError::ReloadStatus { status: 403, .. })
        ));
    }

    #[tokio::test]
    async fn test_reload_timeout_is_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/-/reload"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let store = PrometheusStore::new(
            StoreConfig::new("/unused")
                .with_url(server.uri())
                .with_reload_timeout(Duration::from_millis(200)),
        )
        .unwrap();
        assert!(matches!(
            store.reload().await,
            Err(StoreError::Timeout { .. })
        ));
    }
}
