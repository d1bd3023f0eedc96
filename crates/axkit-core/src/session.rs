//! On-disk session store
//!
//! Layout:
//!   <root>/<session-id>/session.json        metadata
//!   <root>/<session-id>/snapshots/<n>.json  one discovery batch each
//!   <root>/<session-id>/screenshot.<ext>    optional copy of the capture
//!
//!   <root>/<session-id>/.lock               advisory lock file
//!
//! Writes go through a temp file and a rename. Every read-modify-write of a
//! session holds the in-process mutex for its id and then an exclusive
//! `flock` on the session's lock file, so separate `ax` processes sharing a
//! root serialize too.

use crate::error::{Error, ErrorCode, Result};
use crate::record::{AppContext, DetectionResult, ElementRecord};
use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

const SESSION_FILE: &str = "session.json";
const SNAPSHOT_DIR: &str = "snapshots";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<AppContext>,
    #[serde(default)]
    pub snapshot_count: usize,
    /// Number the next snapshot file gets.
    #[serde(default)]
    pub next_snapshot: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub bytes_freed: u64,
    pub dry_run: bool,
}

pub struct SessionStore {
    root: PathBuf,
    max_snapshots: usize,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    seq: AtomicU64,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>, max_snapshots: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating session root {}", root.display()))?;
        Ok(Self {
            root,
            max_snapshots: max_snapshots.max(1),
            locks: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Run `f` holding both the in-process and the on-disk lock of `id`.
    /// The session directory must already exist.
    fn with_session_lock<T>(&self, id: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let local = self
            .locks
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = local.lock();
            FileLock::acquire(&self.session_path(id)).and_then(|_file| f())
        };
        self.release_local(id, local);
        result
    }

    // Drop the map entry once no other caller holds it.
    fn release_local(&self, id: &str, local: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock();
        drop(local);
        if locks.get(id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(id);
        }
    }

    fn require_dir(&self, id: &str) -> Result<()> {
        if self.session_path(id).is_dir() {
            Ok(())
        } else {
            Err(Error::session_not_found(id))
        }
    }

    /// New session with a `<pid>-<yyyyMMddHHmmss>-<seq>` id.
    pub fn create_session(&self) -> Result<String> {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        loop {
            let seq = self.seq.fetch_add(1, Ordering::SeqCst);
            let id = format!("{}-{}-{}", std::process::id(), stamp, seq);
            if !self.session_path(&id).exists() {
                self.ensure_session(&id)?;
                return Ok(id);
            }
        }
    }

    /// Create the session if it does not exist yet.
    pub fn ensure_session(&self, id: &str) -> Result<SessionInfo> {
        validate_id(id)?;
        fs::create_dir_all(self.session_path(id).join(SNAPSHOT_DIR))
            .with_context(|| format!("creating session {}", id))?;

        self.with_session_lock(id, || {
            if self.session_path(id).join(SESSION_FILE).exists() {
                return self.read_info(id);
            }
            let now = Utc::now();
            let info = SessionInfo {
                id: id.to_string(),
                created_at: now,
                last_accessed_at: now,
                app: None,
                snapshot_count: 0,
                next_snapshot: 1,
                screenshot: None,
            };
            self.write_info(&info)?;
            info!(session = id, "created session");
            Ok(info)
        })
    }

    /// Append a discovery batch. Returns the snapshot number.
    pub fn store_detection_result(&self, id: &str, batch: &DetectionResult) -> Result<u64> {
        validate_id(id)?;
        self.require_dir(id)?;
        self.with_session_lock(id, || self.append_batch(id, batch))
    }

    fn append_batch(&self, id: &str, batch: &DetectionResult) -> Result<u64> {
        let mut info = self.read_info(id)?;
        let mut batch = batch.clone();
        let dir = self.session_path(id);

        if let Some(src) = batch.screenshot_path.clone() {
            if src.is_file() {
                let ext = src.extension().and_then(|e| e.to_str()).unwrap_or("png");
                let dest = dir.join(format!("screenshot.{}", ext));
                if src != dest {
                    fs::copy(&src, &dest)
                        .with_context(|| format!("copying screenshot {}", src.display()))?;
                }
                batch.screenshot_path = Some(dest.clone());
                info.screenshot = Some(dest);
            } else {
                warn!(
                    session = id,
                    path = %src.display(),
                    "screenshot not found, keeping reference only"
                );
            }
        }

        let n = info.next_snapshot.max(1);
        let bytes = serde_json::to_vec_pretty(&batch)
            .map_err(|e| Error::system(format!("serializing snapshot: {}", e)))?;
        write_atomic(&self.snapshot_path(id, n), &bytes)?;

        info.next_snapshot = n + 1;
        info.app = Some(batch.app.clone());
        info.last_accessed_at = Utc::now();
        info.snapshot_count = self.prune_snapshots(id)?;
        self.write_info(&info)?;

        info!(
            session = id,
            snapshot = n,
            elements = batch.elements.len(),
            "stored detection result"
        );
        Ok(n)
    }

    /// Newest batch, or `None` when the session has no batches yet.
    pub fn get_detection_result(&self, id: &str) -> Result<Option<DetectionResult>> {
        validate_id(id)?;
        self.require_dir(id)?;
        self.with_session_lock(id, || self.read_latest(id))
    }

    fn read_latest(&self, id: &str) -> Result<Option<DetectionResult>> {
        let mut info = self.read_info(id)?;
        let Some(n) = self.snapshot_numbers(id)?.last().copied() else {
            return Ok(None);
        };
        let raw = fs::read(self.snapshot_path(id, n))
            .with_context(|| format!("reading snapshot {} of {}", n, id))?;
        let batch: DetectionResult = serde_json::from_slice(&raw)
            .map_err(|e| Error::session_corrupted(id, &format!("snapshot {}: {}", n, e)))?;

        info.last_accessed_at = Utc::now();
        if let Err(e) = self.write_info(&info) {
            warn!(session = id, error = %e, "could not update last access");
        }
        Ok(Some(batch))
    }

    pub fn get_element(&self, id: &str, element_id: &str) -> Result<Option<ElementRecord>> {
        Ok(self
            .get_detection_result(id)?
            .and_then(|batch| batch.element(element_id).cloned()))
    }

    pub fn find_elements(&self, id: &str, query: &str) -> Result<Vec<ElementRecord>> {
        Ok(self
            .get_detection_result(id)?
            .map(|batch| batch.find(query).into_iter().cloned().collect())
            .unwrap_or_default())
    }

    pub fn session_info(&self, id: &str) -> Result<SessionInfo> {
        validate_id(id)?;
        self.read_info(id)
    }

    pub fn touch(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        self.require_dir(id)?;
        self.with_session_lock(id, || {
            let mut info = self.read_info(id)?;
            info.last_accessed_at = Utc::now();
            self.write_info(&info)
        })
    }

    /// All readable sessions, most recently used first. Unreadable ones are
    /// skipped with a warning.
    pub fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let mut sessions = Vec::new();
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("listing {}", self.root.display()))?;
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            match self.read_info(&id) {
                Ok(info) => sessions.push(info),
                // Another process is still creating it.
                Err(e) if e.code == ErrorCode::SessionNotFound => {}
                Err(e) => warn!(session = %id, error = %e, "skipping unreadable session"),
            }
        }
        sessions.sort_by(|a, b| b.last_accessed_at.cmp(&a.last_accessed_at));
        Ok(sessions)
    }

    pub fn clean_session(&self, id: &str, dry_run: bool) -> Result<CleanupReport> {
        validate_id(id)?;
        self.require_dir(id)?;
        let mut report = CleanupReport {
            dry_run,
            ..Default::default()
        };
        self.remove(id, &mut report)?;
        Ok(report)
    }

    /// Remove sessions not accessed for `days` days.
    pub fn clean_sessions_older_than(&self, days: u32, dry_run: bool) -> Result<CleanupReport> {
        let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
        let mut report = CleanupReport {
            dry_run,
            ..Default::default()
        };
        for info in self.list_sessions()? {
            if info.last_accessed_at < cutoff {
                self.remove(&info.id, &mut report)?;
            }
        }
        Ok(report)
    }

    pub fn clean_all_sessions(&self, dry_run: bool) -> Result<CleanupReport> {
        let mut report = CleanupReport {
            dry_run,
            ..Default::default()
        };
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("listing {}", self.root.display()))?;
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                let id = entry.file_name().to_string_lossy().to_string();
                self.remove(&id, &mut report)?;
            }
        }
        Ok(report)
    }

    /// Keep the `max` most recently used sessions.
    pub fn enforce_session_limit(&self, max: usize, dry_run: bool) -> Result<CleanupReport> {
        let mut report = CleanupReport {
            dry_run,
            ..Default::default()
        };
        for info in self.list_sessions()?.into_iter().skip(max) {
            self.remove(&info.id, &mut report)?;
        }
        Ok(report)
    }

    fn remove(&self, id: &str, report: &mut CleanupReport) -> Result<()> {
        let path = self.session_path(id);
        let bytes = self.with_session_lock(id, || {
            let bytes = dir_size(&path);
            if !report.dry_run {
                fs::remove_dir_all(&path)
                    .with_context(|| format!("removing session {}", path.display()))?;
                info!(session = id, bytes, "removed session");
            }
            Ok(bytes)
        })?;
        report.removed.push(id.to_string());
        report.bytes_freed += bytes;
        Ok(())
    }

    fn snapshot_path(&self, id: &str, n: u64) -> PathBuf {
        self.session_path(id)
            .join(SNAPSHOT_DIR)
            .join(format!("{}.json", n))
    }

    fn snapshot_numbers(&self, id: &str) -> Result<Vec<u64>> {
        let dir = self.session_path(id).join(SNAPSHOT_DIR);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut numbers: Vec<u64> = fs::read_dir(&dir)
            .with_context(|| format!("listing {}", dir.display()))?
            .flatten()
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.strip_suffix(".json")?.parse::<u64>().ok()
            })
            .collect();
        numbers.sort_unstable();
        Ok(numbers)
    }

    // Caller holds the session lock.
    fn prune_snapshots(&self, id: &str) -> Result<usize> {
        let numbers = self.snapshot_numbers(id)?;
        let excess = numbers.len().saturating_sub(self.max_snapshots);
        for n in &numbers[..excess] {
            fs::remove_file(self.snapshot_path(id, *n))
                .with_context(|| format!("pruning snapshot {} of {}", n, id))?;
        }
        Ok(numbers.len() - excess)
    }

    fn read_info(&self, id: &str) -> Result<SessionInfo> {
        let path = self.session_path(id).join(SESSION_FILE);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::session_not_found(id))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw).map_err(|e| Error::session_corrupted(id, &e.to_string()))
    }

    fn write_info(&self, info: &SessionInfo) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(info)
            .map_err(|e| Error::system(format!("serializing session: {}", e)))?;
        write_atomic(&self.session_path(&info.id).join(SESSION_FILE), &bytes)?;
        Ok(())
    }
}

/// Exclusive advisory lock on `<session>/.lock`, released on drop.
struct FileLock {
    file: fs::File,
}

impl FileLock {
    fn acquire(session_dir: &Path) -> Result<Self> {
        let path = session_dir.join(LOCK_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        lock_exclusive(&file).with_context(|| format!("locking {}", path.display()))?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &fs::File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    loop {
        // SAFETY: the descriptor is owned by `file` and open for this call.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(unix)]
fn unlock(file: &fs::File) {
    use std::os::unix::io::AsRawFd;
    // SAFETY: as above. Closing the descriptor would release it anyway.
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

// Off Unix only the in-process mutex applies.
#[cfg(not(unix))]
fn lock_exclusive(_file: &fs::File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn unlock(_file: &fs::File) {}

fn validate_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(Error::invalid_command(format!("invalid session id '{}'", id)))
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|e| {
            let p = e.path();
            if p.is_dir() {
                dir_size(&p)
            } else {
                e.metadata().map(|m| m.len()).unwrap_or(0)
            }
        })
        .sum()
}
