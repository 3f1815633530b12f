//! Data-directory layout, atomic artifact writes, run state and the run lock.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use jobtrack_core::{LockRecord, RunState};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobtrack-storage";

pub const JSON_SNAPSHOT_FILE: &str = "jobs_full_open.json";
pub const CSV_SNAPSHOT_FILE: &str = "jobs_full_open.csv";
pub const STATE_FILE: &str = "last_state.json";
pub const SUMMARY_FILE: &str = "summary.txt";
pub const LOCK_FILE: &str = "run.lock";
pub const RAW_INPUT_FILE: &str = "jobs_raw.json";

/// Fixed artifact layout under one physical data directory.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_input(&self) -> PathBuf {
        self.root.join(RAW_INPUT_FILE)
    }

    pub fn json_snapshot(&self) -> PathBuf {
        self.root.join(JSON_SNAPSHOT_FILE)
    }

    pub fn csv_snapshot(&self) -> PathBuf {
        self.root.join(CSV_SNAPSHOT_FILE)
    }

    pub fn state(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    pub fn summary(&self) -> PathBuf {
        self.root.join(SUMMARY_FILE)
    }

    pub fn lock(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn run_lock(&self) -> RunLock {
        RunLock::new(self.lock())
    }

    pub async fn ensure(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating data directory {}", self.root.display()))
    }
}

/// Replace `path` with `bytes` via a sibling temp file and rename.
///
/// Readers never see a torn file.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!("renaming {} -> {}", temp_path.display(), path.display())
        });
    }
    Ok(())
}

/// Missing or unreadable state is an empty state, never an error.
pub async fn load_state(path: &Path) -> RunState {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return RunState::default(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "state unreadable; starting empty");
            return RunState::default();
        }
    };
    match serde_json::from_str::<RunState>(&text) {
        Ok(state) => state,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "state corrupt; starting empty");
            RunState::default()
        }
    }
}

pub async fn save_state(path: &Path, state: &RunState) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(state).context("serializing run state")?;
    write_atomic(path, &bytes).await
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of a lock attempt. Busy is a normal answer, not a failure.
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(RunLockGuard),
    /// `None` when the existing lock file could not be read or parsed.
    Busy(Option<LockRecord>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Idle,
    Held(Option<LockRecord>),
    /// Owner is dead, or the record never became readable within the grace period.
    Stale(Option<LockRecord>),
}

impl LockStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, LockStatus::Held(_))
    }
}

/// How long an empty or garbled lock record may sit before it counts as abandoned.
pub const UNREADABLE_LOCK_GRACE: Duration = Duration::from_secs(30);

/// Singleton on-disk run marker shared by every trigger of the pipeline.
///
/// Inspection, reclamation and creation happen under an exclusive advisory
/// lock on a sibling `.guard` file, so two processes can never both reclaim
/// the same stale record.
#[derive(Debug, Clone)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn guard_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".guard");
        PathBuf::from(name)
    }

    pub fn try_acquire(&self) -> Result<LockAttempt, LockError> {
        self.try_acquire_as(std::process::id())
    }

    /// Create the lock for `pid`, reclaiming a record left by a dead process.
    pub fn try_acquire_as(&self, pid: u32) -> Result<LockAttempt, LockError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| self.io_err(source))?;
        }
        let _serial = self.serialize()?;

        // One retry covers a reclaimed stale record.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&self.path) {
                Ok(mut file) => {
                    let record = LockRecord {
                        pid,
                        acquired_at: Utc::now().timestamp(),
                    };
                    let written = file
                        .write_all(record.render().as_bytes())
                        .and_then(|_| file.sync_all());
                    if let Err(source) = written {
                        let _ = std::fs::remove_file(&self.path);
                        return Err(self.io_err(source));
                    }
                    info!(pid, lock = %self.path.display(), "run lock acquired");
                    return Ok(LockAttempt::Acquired(RunLockGuard {
                        path: self.path.clone(),
                        record,
                    }));
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => match self.inspect()? {
                    LockStatus::Idle => continue,
                    LockStatus::Held(record) => return Ok(LockAttempt::Busy(record)),
                    LockStatus::Stale(record) => {
                        warn!(
                            stale_pid = record.map(|r| r.pid),
                            acquired_at = record.map(|r| r.acquired_at),
                            "reclaiming abandoned run lock"
                        );
                        match std::fs::remove_file(&self.path) {
                            Ok(()) => continue,
                            Err(err) if err.kind() == ErrorKind::NotFound => continue,
                            Err(source) => return Err(self.io_err(source)),
                        }
                    }
                },
                Err(source) => return Err(self.io_err(source)),
            }
        }

        Ok(LockAttempt::Busy(None))
    }

    /// Current lock state without modifying anything.
    ///
    /// An empty or unparseable record counts as held while it is younger than
    /// [`UNREADABLE_LOCK_GRACE`], and as stale after that.
    pub fn inspect(&self) -> Result<LockStatus, LockError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(LockStatus::Idle),
            Err(err) => {
                warn!(
                    lock = %self.path.display(),
                    error = %err,
                    "lock unreadable; treating as held"
                );
                return Ok(LockStatus::Held(None));
            }
        };
        match LockRecord::parse(&text) {
            Some(record) if process_alive(record.pid) => Ok(LockStatus::Held(Some(record))),
            Some(record) => Ok(LockStatus::Stale(Some(record))),
            None if self.older_than(UNREADABLE_LOCK_GRACE) => Ok(LockStatus::Stale(None)),
            None => Ok(LockStatus::Held(None)),
        }
    }

    fn older_than(&self, grace: Duration) -> bool {
        std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > grace)
    }

    /// Blocks until this process holds the exclusive lock on the guard file.
    #[cfg(unix)]
    fn serialize(&self) -> Result<nix::fcntl::Flock<std::fs::File>, LockError> {
        use nix::fcntl::{Flock, FlockArg};

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.guard_path())
            .map_err(|source| self.io_err(source))?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| self.io_err(std::io::Error::from(errno)))
    }

    #[cfg(not(unix))]
    fn serialize(&self) -> Result<(), LockError> {
        Ok(())
    }

    fn io_err(&self, source: std::io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Held lock. Dropping it removes the lock file, but only while the file
/// still carries this guard's record.
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
    record: LockRecord,
}

impl RunLockGuard {
    pub fn record(&self) -> LockRecord {
        self.record
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        let on_disk = match std::fs::read_to_string(&self.path) {
            Ok(text) => LockRecord::parse(&text),
            Err(err) if err.kind() == ErrorKind::NotFound => return,
            Err(err) => {
                warn!(
                    lock = %self.path.display(),
                    error = %err,
                    "failed to read run lock on release"
                );
                return;
            }
        };
        if on_disk != Some(self.record) {
            warn!(
                pid = self.record.pid,
                on_disk = ?on_disk,
                "run lock now belongs to another run; leaving it"
            );
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!(pid = self.record.pid, "run lock released"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                lock = %self.path.display(),
                error = %err,
                "failed to release run lock"
            ),
        }
    }
}

/// Single-host liveness probe: signal 0 to the pid.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // pid 0 and negative pids address process groups, never a single owner.
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), Option::<Signal>::None) {
        Ok(()) => true,
        // Exists but owned by another user.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Without a process table to query, every recorded owner is assumed alive.
#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn atomic_write_replaces_contents() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("out.json");
        write_atomic(&path, b"first").await.expect("first write");
        write_atomic(&path, b"second").await.expect("second write");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");

        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn missing_or_corrupt_state_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let data = DataDir::new(dir.path());
        assert_eq!(load_state(&data.state()).await, RunState::default());

        std::fs::write(data.state(), "{not json").unwrap();
        assert_eq!(load_state(&data.state()).await, RunState::default());

        std::fs::write(data.state(), "[1, 2]").unwrap();
        assert_eq!(load_state(&data.state()).await, RunState::default());
    }

    #[tokio::test]
    async fn state_round_trips() {
        let dir = tempdir().expect("tempdir");
        let data = DataDir::new(dir.path());
        let state = RunState {
            seen_urls: vec!["a".into(), "b".into()],
            last_run: "2024-06-01T08:00:00".into(),
            last_new_urls: vec!["b".into()],
        };
        save_state(&data.state(), &state).await.expect("save");
        assert_eq!(load_state(&data.state()).await, state);
    }

    #[test]
    fn second_acquire_reports_busy_until_release() {
        let dir = tempdir().expect("tempdir");
        let lock = DataDir::new(dir.path()).run_lock();

        let guard = match lock.try_acquire().expect("acquire") {
            LockAttempt::Acquired(guard) => guard,
            LockAttempt::Busy(_) => panic!("fresh lock reported busy"),
        };
        let text = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(LockRecord::parse(&text).unwrap().pid, std::process::id());

        match lock.try_acquire().expect("second acquire") {
            LockAttempt::Busy(Some(record)) => assert_eq!(record.pid, std::process::id()),
            other => panic!("expected busy, got {other:?}"),
        }
        assert!(lock.inspect().unwrap().is_running());

        drop(guard);
        assert!(!lock.path().exists());
        assert_eq!(lock.inspect().unwrap(), LockStatus::Idle);
        assert!(matches!(lock.try_acquire().unwrap(), LockAttempt::Acquired(_)));
    }

    #[cfg(unix)]
    #[test]
    fn stale_lock_from_dead_process_is_reclaimed() {
        let dir = tempdir().expect("tempdir");
        let lock = DataDir::new(dir.path()).run_lock();

        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let dead_pid = child.id();
        child.wait().expect("wait");
        std::fs::write(lock.path(), format!("{dead_pid} 1700000000\n")).unwrap();

        assert!(matches!(lock.inspect().unwrap(), LockStatus::Stale(Some(r)) if r.pid == dead_pid));
        match lock.try_acquire().expect("acquire") {
            LockAttempt::Acquired(guard) => assert_eq!(guard.record().pid, std::process::id()),
            LockAttempt::Busy(_) => panic!("stale lock was not reclaimed"),
        }
    }

    #[test]
    fn garbage_lock_counts_as_held() {
        let dir = tempdir().expect("tempdir");
        let lock = DataDir::new(dir.path()).run_lock();
        std::fs::write(lock.path(), "").unwrap();
        assert!(matches!(lock.try_acquire().unwrap(), LockAttempt::Busy(None)));
        assert!(lock.path().exists());
    }

    #[test]
    fn garbage_lock_past_grace_is_reclaimed() {
        let dir = tempdir().expect("tempdir");
        let lock = DataDir::new(dir.path()).run_lock();
        std::fs::write(lock.path(), "").unwrap();
        let backdated = std::time::SystemTime::now() - UNREADABLE_LOCK_GRACE * 4;
        std::fs::File::options()
            .write(true)
            .open(lock.path())
            .unwrap()
            .set_modified(backdated)
            .unwrap();

        assert_eq!(lock.inspect().unwrap(), LockStatus::Stale(None));
        match lock.try_acquire().expect("acquire") {
            LockAttempt::Acquired(guard) => assert_eq!(guard.record().pid, std::process::id()),
            LockAttempt::Busy(_) => panic!("abandoned empty lock was not reclaimed"),
        }
    }

    #[test]
    fn guard_leaves_a_lock_it_no_longer_owns() {
        let dir = tempdir().expect("tempdir");
        let lock = DataDir::new(dir.path()).run_lock();
        let guard = match lock.try_acquire().expect("acquire") {
            LockAttempt::Acquired(guard) => guard,
            LockAttempt::Busy(_) => panic!("fresh lock reported busy"),
        };
        let other = LockRecord {
            pid: guard.record().pid,
            acquired_at: guard.record().acquired_at + 1,
        };
        std::fs::write(lock.path(), other.render()).unwrap();

        drop(guard);
        let text = std::fs::read_to_string(lock.path()).expect("lock still present");
        assert_eq!(LockRecord::parse(&text), Some(other));
    }

    #[cfg(unix)]
    #[test]
    fn concurrent_reclaimers_yield_a_single_holder() {
        use std::sync::{Arc, Barrier};

        let dir = tempdir().expect("tempdir");
        let lock = DataDir::new(dir.path()).run_lock();
        let mut child = std::process::Command::new("true").spawn().expect("spawn");
        let dead_pid = child.id();
        child.wait().expect("wait");

        const CONTENDERS: usize = 8;
        for round in 0..300 {
            std::fs::write(lock.path(), format!("{dead_pid} 1700000000\n")).unwrap();
            let start = Arc::new(Barrier::new(CONTENDERS));
            let hold = Arc::new(Barrier::new(CONTENDERS));

            let acquired = std::thread::scope(|scope| {
                let handles: Vec<_> = (0..CONTENDERS)
                    .map(|_| {
                        let (lock, start, hold) = (lock.clone(), start.clone(), hold.clone());
                        scope.spawn(move || {
                            start.wait();
                            let attempt = lock.try_acquire().expect("acquire");
                            // Every contender keeps its outcome alive until all have tried.
                            hold.wait();
                            matches!(attempt, LockAttempt::Acquired(_))
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().expect("contender thread"))
                    .filter(|won| *won)
                    .count()
            });

            assert_eq!(acquired, 1, "round {round}: {acquired} holders at once");
            assert!(!lock.path().exists());
        }
    }
}
