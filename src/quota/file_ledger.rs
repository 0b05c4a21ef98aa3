//! File-backed Usage Ledger
//!
//! Events are stored one JSON object per line. The whole file is indexed in
//! memory on open; queries never touch the disk.
//!
//! Each append is a single `write_all` of one newline-terminated record
//! followed by `sync_data`. A record that was only partially written (crash
//! mid-append) is always the last line of the file and is discarded on open.

use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::error::{QuotaError, QuotaResult};
use super::ledger::{AppendOutcome, LedgerState, TimeRange, UsageEvent, UsageLedger, UsageSum};
use super::policy::UsageScope;

#[derive(Debug)]
struct Writer {
    file: File,
    /// Length of the file up to the last complete record
    len: u64,
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    state: RwLock<LedgerState>,
    writer: Arc<Mutex<Writer>>,
}

/// Durable JSON-lines ledger
#[derive(Debug, Clone)]
pub struct FileLedger {
    inner: Arc<Inner>,
}

impl FileLedger {
    /// Open (or create) a ledger file and index its events
    pub fn open(path: impl AsRef<Path>) -> QuotaResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut state = LedgerState::default();
        let mut good_len = 0usize;
        let mut offset = 0usize;
        let mut line_no = 0usize;

        while offset < content.len() {
            line_no += 1;
            let rest = &content[offset..];
            let Some(newline) = rest.iter().position(|b| *b == b'\n') else {
                warn!(
                    path = %path.display(),
                    bytes = rest.len(),
                    "Discarding torn trailing ledger record"
                );
                break;
            };
            let line = &rest[..newline];
            offset += newline + 1;

            if !line.iter().all(u8::is_ascii_whitespace) {
                let event: UsageEvent = serde_json::from_slice(line).map_err(|e| {
                    QuotaError::Storage(format!(
                        "corrupt ledger record at {}:{}: {}",
                        path.display(),
                        line_no,
                        e
                    ))
                })?;
                state.apply(event);
            }
            good_len = offset;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if good_len < content.len() {
            file.set_len(good_len as u64)?;
        }

        debug!(path = %path.display(), events = state.len(), "Opened usage ledger");

        Ok(Self {
            inner: Arc::new(Inner {
                path,
                state: RwLock::new(state),
                writer: Arc::new(Mutex::new(Writer {
                    file,
                    len: good_len as u64,
                })),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Number of indexed events
    pub async fn count(&self) -> usize {
        self.inner.state.read().await.len()
    }
}

impl Inner {
    async fn append(&self, event: UsageEvent) -> QuotaResult<AppendOutcome> {
        let mut state = self.state.write().await;
        if state.is_duplicate(&event) {
            return Ok(AppendOutcome::Duplicate);
        }

        let mut record = serde_json::to_vec(&event)?;
        record.push(b'\n');

        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || write_record(&writer, &record))
            .await
            .map_err(|e| QuotaError::Storage(format!("ledger write task failed: {}", e)))??;

        Ok(state.apply(event))
    }
}

fn write_record(writer: &Mutex<Writer>, record: &[u8]) -> QuotaResult<()> {
    let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
    let result = writer
        .file
        .write_all(record)
        .and_then(|_| writer.file.sync_data());

    match result {
        Ok(()) => {
            writer.len += record.len() as u64;
            Ok(())
        }
        Err(e) => {
            // Drop whatever part of the record reached the file
            let len = writer.len;
            if let Err(truncate_err) = writer.file.set_len(len) {
                warn!(error = %truncate_err, "Failed to roll back partial ledger record");
            }
            Err(e.into())
        }
    }
}

#[async_trait]
impl UsageLedger for FileLedger {
    async fn append(&self, event: UsageEvent) -> QuotaResult<AppendOutcome> {
        event.validate()?;
        // The append runs on its own task so a caller dropping this future
        // cannot interrupt it between the disk write and the index update.
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.append(event).await })
            .await
            .map_err(|e| QuotaError::Storage(format!("ledger append task failed: {}", e)))?
    }

    async fn sum_in_range(
        &self,
        user_id: &str,
        scope: UsageScope,
        range: TimeRange,
    ) -> QuotaResult<UsageSum> {
        let state = self.inner.state.read().await;
        Ok(state.sum(user_id, scope, range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::deadline::OperationDeadline;
    use crate::quota::policy::ActionType;
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    fn today() -> TimeRange {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        TimeRange::new(start, start + Duration::days(1))
    }

    fn event(user: &str) -> UsageEvent {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        UsageEvent::new(user, ActionType::Explanation, at)
    }

    #[tokio::test]
    async fn test_events_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.jsonl");

        let ledger = FileLedger::open(&path).unwrap();
        ledger.append(event("user-1")).await.unwrap();
        ledger.append(event("user-1")).await.unwrap();
        ledger.append(event("user-2")).await.unwrap();
        drop(ledger);

        let reopened = FileLedger::open(&path).unwrap();
        assert_eq!(reopened.count().await, 3);
        let sum = reopened
            .sum_in_range("user-1", UsageScope::AllActions, today())
            .await
            .unwrap();
        assert_eq!(sum.total, 2);
    }

    #[tokio::test]
    async fn test_idempotency_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.jsonl");

        let ledger = FileLedger::open(&path).unwrap();
        let outcome = ledger
            .append(event("user-1").with_idempotency_key("k1"))
            .await
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Recorded);
        drop(ledger);

        let reopened = FileLedger::open(&path).unwrap();
        let outcome = reopened
            .append(event("user-1").with_idempotency_key("k1"))
            .await
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Duplicate);
        assert_eq!(reopened.count().await, 1);
    }

    #[tokio::test]
    async fn test_torn_trailing_record_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.jsonl");

        let ledger = FileLedger::open(&path).unwrap();
        ledger.append(event("user-1")).await.unwrap();
        drop(ledger);

        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(br#"{"id":"0b6c"#).unwrap();
        }

        let reopened = FileLedger::open(&path).unwrap();
        assert_eq!(reopened.count().await, 1);

        // Appends after recovery produce a clean file
        reopened.append(event("user-1")).await.unwrap();
        drop(reopened);
        let again = FileLedger::open(&path).unwrap();
        assert_eq!(again.count().await, 2);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_file_and_index_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.jsonl");

        let ledger = FileLedger::open(&path).unwrap();
        ledger.append(event("user-1")).await.unwrap();
        let len_before = std::fs::metadata(&path).unwrap().len();

        // Swap in a read-only handle so the next write fails
        ledger.inner.writer.lock().unwrap().file = File::open(&path).unwrap();

        let err = ledger
            .append(event("user-1").with_idempotency_key("k1"))
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::Storage(_)));
        assert_eq!(ledger.count().await, 1);
        assert_eq!(ledger.inner.writer.lock().unwrap().len, len_before);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len_before);

        // The failed key was never indexed, so a retry records once
        ledger.inner.writer.lock().unwrap().file =
            OpenOptions::new().append(true).open(&path).unwrap();
        let outcome = ledger
            .append(event("user-1").with_idempotency_key("k1"))
            .await
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Recorded);

        drop(ledger);
        assert_eq!(FileLedger::open(&path).unwrap().count().await, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_append_cut_off_by_deadline_is_whole_or_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.jsonl");
        let ledger = FileLedger::open(&path).unwrap();
        let deadline = OperationDeadline::new(std::time::Duration::from_nanos(1));
        let attempts = 20;

        for i in 0..attempts {
            let append = ledger.append(event("user-1").with_idempotency_key(format!("k{}", i)));
            match deadline.run(append).await {
                Ok(outcome) => assert_eq!(outcome, AppendOutcome::Recorded),
                Err(err) => assert!(matches!(err, QuotaError::DeadlineExceeded(_))),
            }
        }

        // Detached appends keep running after their caller gave up
        for _ in 0..200 {
            if ledger.count().await == attempts {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let indexed = ledger.count().await;
        assert!(indexed <= attempts);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.is_empty() || content.ends_with('\n'));
        for line in content.lines() {
            serde_json::from_str::<UsageEvent>(line).unwrap();
        }
        assert_eq!(content.lines().count(), indexed);

        drop(ledger);
        assert_eq!(FileLedger::open(&path).unwrap().count().await, indexed);
    }

    #[tokio::test]
    async fn test_corrupt_middle_record_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.jsonl");
        std::fs::write(&path, "not json\n").unwrap();

        let err = FileLedger::open(&path).unwrap_err();
        assert!(matches!(err, QuotaError::Storage(_)));
    }

    #[tokio::test]
    async fn test_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("ledger").join("usage.jsonl");
        let ledger = FileLedger::open(&path).unwrap();
        assert_eq!(ledger.path(), path.as_path());
        assert_eq!(ledger.count().await, 0);
    }
}
