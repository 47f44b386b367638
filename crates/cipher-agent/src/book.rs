//! Persistent deposit book.
//!
//! One JSON array at `<data-dir>/deposits.json`, owner-only, written with
//! temp-file + rename. A process-level mutex serializes every operation; a
//! pid lockfile guards against a second agent on the same directory.
//! Records are never deleted; a withdrawn deposit keeps its row forever.

use cipher_core::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const BOOK_FILE: &str = "deposits.json";
const LOCK_FILE: &str = "deposits.json.lock";

/// Sentinel reference set by the pre-mark step, replaced by the relayer
/// queue ID once the submission is accepted.
pub const PENDING_REF: &str = "pending";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DepositRecord {
    pub code: String,
    pub commitment: String,
    pub amount: u64,
    pub tx_id: String,
    pub timestamp: String,
    pub withdrawn: bool,
    pub withdraw_ref: Option<String>,
}

pub struct DepositBook {
    path: PathBuf,
    lock_path: PathBuf,
    guard: Mutex<()>,
}

impl DepositBook {
    pub async fn open(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(data_dir, std::fs::Permissions::from_mode(0o700))?;
        }
        let book = Self {
            path: data_dir.join(BOOK_FILE),
            lock_path: data_dir.join(LOCK_FILE),
            guard: Mutex::new(()),
        };
        book.acquire_lockfile().await?;
        Ok(book)
    }

    /// Take the pid lockfile, stealing it when the recorded owner is gone
    /// (crashed process) or is ourselves.
    async fn acquire_lockfile(&self) -> Result<()> {
        let my_pid = std::process::id();
        if let Ok(raw) = tokio::fs::read_to_string(&self.lock_path).await {
            let owner: Option<u32> = raw.trim().parse().ok();
            match owner {
                Some(pid) if pid != my_pid && process_alive(pid) => {
                    return Err(Error::Conflict(format!(
                        "deposit book is locked by pid {pid}"
                    )));
                }
                _ => warn!(path = %self.lock_path.display(), "replacing stale deposit-book lock"),
            }
        }
        tokio::fs::write(&self.lock_path, my_pid.to_string()).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.lock_path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub async fn add(&self, record: DepositRecord) -> Result<()> {
        let _guard = self.guard.lock().await;
        let mut records = self.read_all().await?;
        records.push(record);
        self.write_all(&records).await
    }

    /// Oldest record with `withdrawn == false`, optionally filtered by
    /// amount.
    pub async fn find_unwithdrawn(&self, amount: Option<u64>) -> Result<Option<DepositRecord>> {
        let _guard = self.guard.lock().await;
        let records = self.read_all().await?;
        Ok(records
            .into_iter()
            .find(|r| !r.withdrawn && amount.is_none_or(|a| r.amount == a)))
    }

    /// Flip a deposit to withdrawn. Refuses a second flip; that is the
    /// double-spend guard the withdraw pipeline relies on.
    pub async fn mark_withdrawn(&self, code: &str, reference: &str) -> Result<()> {
        let _guard = self.guard.lock().await;
        let mut records = self.read_all().await?;
        let record = records
            .iter_mut()
            .find(|r| r.code == code)
            .ok_or_else(|| Error::NotFound("no such deposit".into()))?;
        if record.withdrawn {
            return Err(Error::Conflict("deposit already withdrawn".into()));
        }
        record.withdrawn = true;
        record.withdraw_ref = Some(reference.to_string());
        record.timestamp = chrono::Utc::now().to_rfc3339();
        self.write_all(&records).await
    }

    /// Replace the reference on an already-withdrawn deposit (pre-mark
    /// sentinel → relayer queue ID).
    pub async fn set_reference(&self, code: &str, reference: &str) -> Result<()> {
        let _guard = self.guard.lock().await;
        let mut records = self.read_all().await?;
        let record = records
            .iter_mut()
            .find(|r| r.code == code)
            .ok_or_else(|| Error::NotFound("no such deposit".into()))?;
        if !record.withdrawn {
            return Err(Error::Conflict("deposit is not marked withdrawn".into()));
        }
        record.withdraw_ref = Some(reference.to_string());
        self.write_all(&records).await
    }

    /// Roll a pre-mark back after a failed submission.
    pub async fn unmark(&self, code: &str) -> Result<()> {
        let _guard = self.guard.lock().await;
        let mut records = self.read_all().await?;
        let record = records
            .iter_mut()
            .find(|r| r.code == code)
            .ok_or_else(|| Error::NotFound("no such deposit".into()))?;
        record.withdrawn = false;
        record.withdraw_ref = None;
        self.write_all(&records).await
    }

    pub async fn all(&self) -> Result<Vec<DepositRecord>> {
        let _guard = self.guard.lock().await;
        self.read_all().await
    }

    async fn read_all(&self) -> Result<Vec<DepositRecord>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::Integrity(format!("deposit book: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, records: &[DepositRecord]) -> Result<()> {
        let body = serde_json::to_vec_pretty(records).map_err(|e| Error::Disk(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(count = records.len(), "deposit book written");
        Ok(())
    }
}

impl Drop for DepositBook {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // no portable liveness probe; assume the owner is alive
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(code: &str, amount: u64) -> DepositRecord {
        DepositRecord {
            code: code.into(),
            commitment: "123".into(),
            amount,
            tx_id: format!("tx-{code}"),
            timestamp: chrono::Utc::now().to_rfc3339(),
            withdrawn: false,
            withdraw_ref: None,
        }
    }

    #[tokio::test]
    async fn add_and_find_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let book = DepositBook::open(dir.path()).await.unwrap();
        book.add(record("a", 100)).await.unwrap();
        book.add(record("b", 100)).await.unwrap();
        book.add(record("c", 200)).await.unwrap();

        let found = book.find_unwithdrawn(Some(100)).await.unwrap().unwrap();
        assert_eq!(found.code, "a");
        let any = book.find_unwithdrawn(None).await.unwrap().unwrap();
        assert_eq!(any.code, "a");
        assert!(book.find_unwithdrawn(Some(300)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_is_single_shot() {
        let dir = tempfile::tempdir().unwrap();
        let book = DepositBook::open(dir.path()).await.unwrap();
        book.add(record("a", 100)).await.unwrap();

        book.mark_withdrawn("a", PENDING_REF).await.unwrap();
        assert!(matches!(
            book.mark_withdrawn("a", "again").await,
            Err(Error::Conflict(_))
        ));
        assert!(book.find_unwithdrawn(Some(100)).await.unwrap().is_none());

        book.set_reference("a", "queue-1").await.unwrap();
        let all = book.all().await.unwrap();
        assert_eq!(all[0].withdraw_ref.as_deref(), Some("queue-1"));
    }

    #[tokio::test]
    async fn unmark_restores_spendability() {
        let dir = tempfile::tempdir().unwrap();
        let book = DepositBook::open(dir.path()).await.unwrap();
        book.add(record("a", 100)).await.unwrap();
        book.mark_withdrawn("a", PENDING_REF).await.unwrap();
        book.unmark("a").await.unwrap();

        let found = book.find_unwithdrawn(Some(100)).await.unwrap().unwrap();
        assert_eq!(found.code, "a");
        assert_eq!(found.withdraw_ref, None);
    }

    #[tokio::test]
    async fn premark_survives_crash_and_restart() {
        let dir = tempfile::tempdir().unwrap();
        let book = DepositBook::open(dir.path()).await.unwrap();
        book.add(record("a", 100)).await.unwrap();
        book.mark_withdrawn("a", PENDING_REF).await.unwrap();
        // crash: the lockfile never gets cleaned up
        std::mem::forget(book);

        let reopened = DepositBook::open(dir.path()).await.unwrap();
        assert!(reopened.find_unwithdrawn(Some(100)).await.unwrap().is_none());
        let all = reopened.all().await.unwrap();
        assert_eq!(all[0].withdraw_ref.as_deref(), Some(PENDING_REF));
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let book = DepositBook::open(dir.path()).await.unwrap();
            book.add(record("a", 100)).await.unwrap();
        }
        let book = DepositBook::open(dir.path()).await.unwrap();
        assert_eq!(book.all().await.unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn book_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let book = DepositBook::open(dir.path()).await.unwrap();
        book.add(record("a", 100)).await.unwrap();
        let mode = std::fs::metadata(dir.path().join(BOOK_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
