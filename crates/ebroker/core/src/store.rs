//! On-disk request records, one JSON file per request.
//!
//! Every invocation of the binary is a fresh process, so exclusion between
//! invocations goes through an `<id>.lock` file next to the record. Callers in
//! the same process are serialized first on an async mutex per request.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::request::Request;

/// A lock file untouched for this long is left over from a crashed
/// invocation. Holders refresh it between backend calls.
const STALE_LOCK: Duration = Duration::from_secs(10 * 60);
const LOCK_RETRY: Duration = Duration::from_millis(50);
const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(30);

type LockMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

pub struct RequestStore {
    root: PathBuf,
    locks: Arc<Mutex<LockMap>>,
    lock_wait: Duration,
    stale_after: Duration,
}

/// Exclusive hold on one request. Released on drop.
#[derive(Debug)]
pub struct RequestGuard {
    request_id: String,
    lock_path: PathBuf,
    token: String,
    locks: Arc<Mutex<LockMap>>,
    _held: OwnedMutexGuard<()>,
}

impl RequestGuard {
    /// Mark the hold as live so other invocations do not take it for stale.
    pub fn refresh(&self) {
        let touched = OpenOptions::new()
            .write(true)
            .open(&self.lock_path)
            .and_then(|file| file.set_modified(SystemTime::now()));
        if let Err(e) = touched {
            warn!(path = %self.lock_path.display(), error = %e, "failed to refresh request lock");
        }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        match fs::read_to_string(&self.lock_path) {
            Ok(contents) if contents.trim() == self.token => {
                if let Err(e) = fs::remove_file(&self.lock_path) {
                    warn!(path = %self.lock_path.display(), error = %e, "failed to release request lock");
                }
            }
            Ok(_) => warn!(path = %self.lock_path.display(), "request lock was taken over, leaving it in place"),
            Err(e) => warn!(path = %self.lock_path.display(), error = %e, "request lock vanished while held"),
        }
        // Only the map and this guard reference the mutex: nobody is waiting.
        let mut locks = self.locks.lock();
        if locks.get(&self.request_id).is_some_and(|m| Arc::strong_count(m) <= 2) {
            locks.remove(&self.request_id);
        }
    }
}

impl RequestStore {
    /// Open (creating if needed) the store under `data_dir`.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, BrokerError> {
        let root = data_dir.as_ref().join("requests");
        fs::create_dir_all(&root).map_err(|e| BrokerError::io(&root, e))?;
        Ok(RequestStore {
            root,
            locks: Arc::new(Mutex::new(HashMap::new())),
            lock_wait: DEFAULT_LOCK_WAIT,
            stale_after: STALE_LOCK,
        })
    }

    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    /// Must stay above the longest single backend call.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Keep stale detection well above `call_timeout`, the longest a holder
    /// goes between refreshes.
    pub fn with_call_timeout(self, call_timeout: Duration) -> Self {
        let stale_after = STALE_LOCK.max(call_timeout.saturating_mul(2));
        self.with_stale_after(stale_after)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, request_id: &str) -> Result<PathBuf, BrokerError> {
        let valid = !request_id.is_empty()
            && !request_id.starts_with('.')
            && request_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(BrokerError::refused(
                crate::codes::ProvCode::UnsupportedReq,
                request_id,
            ));
        }
        Ok(self.root.join(format!("{}.json", request_id)))
    }

    pub fn load(&self, request_id: &str) -> Result<Option<Request>, BrokerError> {
        let path = self.record_path(request_id)?;
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BrokerError::io(&path, e)),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| BrokerError::json(&path, e))
    }

    /// Write a record atomically: readers see the old file or the new one.
    pub fn save(&self, request: &Request) -> Result<(), BrokerError> {
        let path = self.record_path(&request.request_id)?;
        let json = serde_json::to_vec_pretty(request).map_err(|e| BrokerError::json(&path, e))?;
        let mut tmp = NamedTempFile::new_in(&self.root).map_err(|e| BrokerError::io(&self.root, e))?;
        tmp.write_all(&json).map_err(|e| BrokerError::io(tmp.path(), e))?;
        tmp.as_file().sync_all().map_err(|e| BrokerError::io(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| BrokerError::io(&path, e.error))?;
        debug!(request = %request.request_id, status = %request.status(), "request saved");
        Ok(())
    }

    /// All records, oldest first. Unreadable files are skipped.
    pub fn list(&self) -> Result<Vec<Request>, BrokerError> {
        let entries = fs::read_dir(&self.root).map_err(|e| BrokerError::io(&self.root, e))?;
        let mut requests = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| BrokerError::io(&self.root, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(|e| BrokerError::io(&path, e))
                .and_then(|s| serde_json::from_str::<Request>(&s).map_err(|e| BrokerError::json(&path, e)));
            match parsed {
                Ok(request) => requests.push(request),
                Err(e) => warn!(error = %e, "skipping unreadable request record"),
            }
        }
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.request_id.cmp(&b.request_id)));
        Ok(requests)
    }

    pub fn remove(&self, request_id: &str) -> Result<bool, BrokerError> {
        let path = self.record_path(request_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BrokerError::io(&path, e)),
        }
    }

    /// Take the exclusive hold on `request_id`, waiting up to the configured
    /// lock wait for other holders in this or another process.
    pub async fn lock(&self, request_id: &str) -> Result<RequestGuard, BrokerError> {
        self.record_path(request_id)?;
        let lock_path = self.root.join(format!("{}.lock", request_id));
        let mutex = self.locks.lock().entry(request_id.to_string()).or_default().clone();

        let held = tokio::time::timeout(self.lock_wait, mutex.lock_owned())
            .await
            .map_err(|_| BrokerError::LockTimeout(request_id.to_string()))?;

        let token = format!("{} {}", std::process::id(), Uuid::new_v4());
        let deadline = tokio::time::Instant::now() + self.lock_wait;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
                Ok(mut file) => {
                    if let Err(e) = writeln!(file, "{}", token) {
                        let _ = fs::remove_file(&lock_path);
                        return Err(BrokerError::io(&lock_path, e));
                    }
                    return Ok(RequestGuard {
                        request_id: request_id.to_string(),
                        lock_path,
                        token,
                        locks: Arc::clone(&self.locks),
                        _held: held,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.break_if_stale(&lock_path, request_id) {
                        continue;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(BrokerError::LockTimeout(request_id.to_string()));
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(BrokerError::io(&lock_path, e)),
            }
        }
    }

    /// Move a stale lock aside and delete it; true when the caller should try
    /// to create the lock again. Of several invocations judging the same file
    /// stale, only one rename succeeds. A file that turns out not to be the
    /// one judged stale is linked back into place.
    fn break_if_stale(&self, lock_path: &Path, request_id: &str) -> bool {
        let judged = match fs::read_to_string(lock_path) {
            Ok(contents) => contents,
            Err(e) => return e.kind() == ErrorKind::NotFound,
        };
        if !is_stale(lock_path, self.stale_after) {
            return false;
        }
        let aside = self.root.join(format!("{}.lock.{}.stale", request_id, Uuid::new_v4()));
        if fs::rename(lock_path, &aside).is_err() {
            return true;
        }
        let moved = fs::read_to_string(&aside).unwrap_or_default();
        if moved == judged {
            warn!(request = request_id, holder = judged.trim(), "broke stale request lock");
        } else if let Err(e) = fs::hard_link(&aside, lock_path) {
            warn!(request = request_id, error = %e, "could not restore a live request lock");
        }
        if let Err(e) = fs::remove_file(&aside) {
            warn!(path = %aside.display(), error = %e, "failed to remove displaced lock file");
        }
        true
    }

    /// Delete terminal records the resource manager has already seen once
    /// they are older than `retention`. Returns the removed ids.
    pub fn collect_garbage(&self, now: DateTime<Utc>, retention: Duration) -> Result<Vec<String>, BrokerError> {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let mut removed = Vec::new();
        for request in self.list()? {
            let expired = now.signed_duration_since(request.created_at) > retention;
            let settled = request.is_terminal() && request.observed_terminal && request.pending_reclaim().is_empty();
            if settled && expired {
                if self.remove(&request.request_id)? {
                    removed.push(request.request_id);
                }
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "collected finished requests");
        }
        Ok(removed)
    }
}

fn is_stale(lock_path: &Path, stale_after: Duration) -> bool {
    fs::metadata(lock_path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > stale_after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Backend;
    use crate::request::{Machine, RequestKind, RequestStatus};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 10, 8, 0, 0).unwrap()
    }

    fn record(id: &str, created_at: DateTime<Utc>) -> Request {
        Request::new(id, RequestKind::Create, Backend::CycleCloud, created_at, created_at + chrono::Duration::minutes(15))
    }

    #[test]
    fn saved_record_loads_back() {
        let dir = TempDir::new().unwrap();
        let store = RequestStore::open(dir.path()).unwrap();
        let mut req = record("req-a", t0());
        req.template_id = Some("execute".into());
        store.save(&req).unwrap();
        assert_eq!(store.load("req-a").unwrap(), Some(req));
        assert_eq!(store.load("req-missing").unwrap(), None);
    }

    #[test]
    fn list_is_oldest_first_and_skips_junk() {
        let dir = TempDir::new().unwrap();
        let store = RequestStore::open(dir.path()).unwrap();
        store.save(&record("req-late", t0() + chrono::Duration::minutes(5))).unwrap();
        store.save(&record("req-early", t0())).unwrap();
        fs::write(store.root().join("broken.json"), "{not json").unwrap();
        let ids: Vec<String> = store.list().unwrap().into_iter().map(|r| r.request_id).collect();
        assert_eq!(ids, vec!["req-early", "req-late"]);
    }

    #[test]
    fn path_like_ids_are_refused() {
        let dir = TempDir::new().unwrap();
        let store = RequestStore::open(dir.path()).unwrap();
        for id in ["../etc/passwd", "", ".hidden", "a/b"] {
            assert!(matches!(store.load(id), Err(BrokerError::Refused { .. })), "{}", id);
        }
    }

    #[tokio::test]
    async fn lock_excludes_second_holder_until_dropped() {
        let dir = TempDir::new().unwrap();
        let store = RequestStore::open(dir.path()).unwrap().with_lock_wait(Duration::from_millis(200));
        let guard = store.lock("req-a").await.unwrap();
        assert!(matches!(store.lock("req-a").await, Err(BrokerError::LockTimeout(_))));
        drop(guard);
        assert!(!store.root().join("req-a.lock").exists());
        let _again = store.lock("req-a").await.unwrap();
    }

    #[tokio::test]
    async fn lock_file_from_another_process_blocks() {
        let dir = TempDir::new().unwrap();
        let store = RequestStore::open(dir.path()).unwrap().with_lock_wait(Duration::from_millis(150));
        fs::write(store.root().join("req-b.lock"), "4242\n").unwrap();
        assert!(matches!(store.lock("req-b").await, Err(BrokerError::LockTimeout(_))));
    }

    fn age(path: &Path, by: Duration) {
        let old = SystemTime::now() - by;
        fs::File::options().write(true).open(path).unwrap().set_modified(old).unwrap();
    }

    #[tokio::test]
    async fn stale_lock_is_broken() {
        let dir = TempDir::new().unwrap();
        let store = RequestStore::open(dir.path()).unwrap().with_lock_wait(Duration::from_millis(150));
        let lock_path = store.root().join("req-c.lock");
        fs::write(&lock_path, "4242\n").unwrap();
        age(&lock_path, Duration::from_secs(60 * 60));
        let _guard = store.lock("req-c").await.unwrap();
        assert!(!fs::read_to_string(&lock_path).unwrap().starts_with("4242\n"));
    }

    #[tokio::test]
    async fn stale_lock_goes_to_exactly_one_taker() {
        let dir = TempDir::new().unwrap();
        let open = || RequestStore::open(dir.path()).unwrap().with_lock_wait(Duration::from_millis(150));
        let (first, second) = (open(), open());
        let lock_path = first.root().join("req-d.lock");
        fs::write(&lock_path, "4242\n").unwrap();
        age(&lock_path, Duration::from_secs(60 * 60));

        let (a, b) = tokio::join!(first.lock("req-d"), second.lock("req-d"));
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        assert!(lock_path.exists());
        let leftovers = fs::read_dir(first.root())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().extension().is_some_and(|x| x == "stale"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn refreshed_lock_is_not_taken_for_stale() {
        let dir = TempDir::new().unwrap();
        let stale_after = Duration::from_millis(500);
        let holder = RequestStore::open(dir.path()).unwrap().with_stale_after(stale_after);
        let other = RequestStore::open(dir.path())
            .unwrap()
            .with_lock_wait(Duration::from_millis(150))
            .with_stale_after(stale_after);

        let guard = holder.lock("req-e").await.unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        guard.refresh();
        assert!(matches!(other.lock("req-e").await, Err(BrokerError::LockTimeout(_))));

        // Unrefreshed for longer than the threshold, the hold is broken, and
        // the displaced holder leaves the new lock alone on release.
        tokio::time::sleep(Duration::from_millis(600)).await;
        let taken = other.lock("req-e").await.unwrap();
        drop(guard);
        assert!(other.root().join("req-e.lock").exists());
        drop(taken);
        assert!(!other.root().join("req-e.lock").exists());
    }

    #[test]
    fn stale_threshold_outlasts_backend_calls() {
        let dir = TempDir::new().unwrap();
        let store = RequestStore::open(dir.path()).unwrap().with_call_timeout(Duration::from_secs(60));
        assert_eq!(store.stale_after, STALE_LOCK);
        let store = store.with_call_timeout(Duration::from_secs(15 * 60));
        assert_eq!(store.stale_after, Duration::from_secs(30 * 60));
    }

    #[tokio::test]
    async fn released_locks_leave_no_map_entries() {
        let dir = TempDir::new().unwrap();
        let store = RequestStore::open(dir.path()).unwrap();
        for id in ["req-f", "req-g", "req-f"] {
            let _guard = store.lock(id).await.unwrap();
        }
        assert!(store.locks.lock().is_empty());
    }

    #[test]
    fn garbage_collection_keeps_unobserved_recent_and_owed() {
        let dir = TempDir::new().unwrap();
        let store = RequestStore::open(dir.path()).unwrap();
        let day = Duration::from_secs(24 * 60 * 60);

        let mut seen = record("req-seen", t0());
        seen.status = RequestStatus::Complete;
        seen.observed_terminal = true;
        let mut unseen = record("req-unseen", t0());
        unseen.status = RequestStatus::Complete;
        let running = record("req-running", t0());
        let mut recent = record("req-recent", t0() + chrono::Duration::hours(23));
        recent.status = RequestStatus::Error;
        recent.observed_terminal = true;
        let mut owed = record("req-owed", t0());
        owed.status = RequestStatus::CompleteWithError;
        owed.observed_terminal = true;
        let mut broken = Machine::pending("node-9", t0());
        broken.reclaim_pending = true;
        owed.machines.push(broken);
        for r in [&seen, &unseen, &running, &recent, &owed] {
            store.save(r).unwrap();
        }

        let removed = store.collect_garbage(t0() + chrono::Duration::hours(25), day).unwrap();
        assert_eq!(removed, vec!["req-seen"]);
        assert_eq!(store.list().unwrap().len(), 4);
    }
}
