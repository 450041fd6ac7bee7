//! The storage directory generated clips land in, plus the registry of file
//! names the invocation service has handed out.
//!
//! A name is issued exactly once and claimed at most once. Files that are
//! never claimed are removed by [`Storage::sweep`] after their time to live.
//! Output of a yt-dlp run that is still going is never swept: the run holds
//! an [`InFlight`] guard for its token until it returns.

use std::{
    collections::{HashMap, HashSet},
    fs,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::{task, time};
use tracing::{debug, info, warn};

use crate::error::{ClipError, ClipResult};
use crate::media::FileType;
use crate::security::is_plain_file_name;

#[derive(Debug, Clone, Copy)]
struct IssuedFile {
    file_type: FileType,
    issued_at: Instant,
}

pub struct Storage {
    dir: PathBuf,
    issued: Mutex<HashMap<String, IssuedFile>>,
    in_flight: Mutex<HashSet<String>>,
}

/// Marks a token as belonging to a running invocation. Dropping it releases
/// the token, on success and failure alike.
pub struct InFlight<'a> {
    storage: &'a Storage,
    token: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.storage.in_flight.lock().remove(&self.token);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub failed: usize,
}

impl Storage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            issued: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Creates the directory and resolves it to an absolute path so the
    /// realized paths yt-dlp prints can be compared against it.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let dir = dir
            .canonicalize()
            .with_context(|| format!("resolving {}", dir.display()))?;
        Ok(Self::new(dir))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn issue(&self, name: &str, file_type: FileType) {
        self.issued.lock().insert(
            name.to_string(),
            IssuedFile {
                file_type,
                issued_at: Instant::now(),
            },
        );
    }

    pub fn is_issued(&self, name: &str) -> bool {
        self.issued.lock().contains_key(name)
    }

    /// Protects every `<token>_*` file from the sweeper while the guard lives.
    pub fn begin_run(&self, token: &str) -> InFlight<'_> {
        self.in_flight.lock().insert(token.to_string());
        InFlight {
            storage: self,
            token: token.to_string(),
        }
    }

    /// True when `name` carries the token of a run that has not returned yet.
    pub fn is_in_flight(&self, name: &str) -> bool {
        name.split_once('_')
            .is_some_and(|(token, _)| self.in_flight.lock().contains(token))
    }

    /// Takes ownership of an issued name and returns its absolute path. A
    /// second claim of the same name fails, as does any name that never came
    /// out of the invocation service.
    pub fn claim(&self, name: &str) -> ClipResult<(PathBuf, FileType)> {
        if !is_plain_file_name(name) {
            return Err(ClipError::delivery(format!("File not found\n{name}")));
        }
        let entry = self
            .issued
            .lock()
            .remove(name)
            .ok_or_else(|| ClipError::delivery(format!("File not found\n{name}")))?;
        Ok((self.dir.join(name), entry.file_type))
    }

    /// Maps a path printed by yt-dlp back to a name inside the storage
    /// directory. Anything that landed elsewhere is rejected.
    pub fn relative_name(&self, realized: &Path) -> Option<String> {
        let parent = realized.parent()?;
        let parent = parent.canonicalize().ok()?;
        if parent != self.dir {
            return None;
        }
        let name = realized.file_name()?.to_str()?;
        is_plain_file_name(name).then(|| name.to_string())
    }

    /// Deletes generated files older than `ttl` and forgets their names.
    /// Files are aged by modification time, which also catches leftovers
    /// from a previous run of the server. Issued names and files of runs
    /// still in flight are left alone.
    pub fn sweep(&self, ttl: Duration) -> SweepReport {
        let mut report = SweepReport::default();
        self.issued
            .lock()
            .retain(|_, entry| entry.issued_at.elapsed() < ttl);

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %self.dir.display(), error = %err, "cannot list storage directory");
                return report;
            }
        };
        let now = SystemTime::now();
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < ttl {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                if self.is_issued(name) || self.is_in_flight(name) {
                    continue;
                }
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "swept expired clip");
                    report.removed += 1;
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to sweep expired clip");
                    report.failed += 1;
                }
            }
        }
        if report.removed > 0 {
            info!(removed = report.removed, "storage sweep finished");
        }
        report
    }
}

/// Runs [`Storage::sweep`] every `interval` until the runtime shuts down.
pub fn spawn_sweeper(
    storage: Arc<Storage>,
    ttl: Duration,
    interval: Duration,
) -> task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let storage = storage.clone();
            if let Err(err) = task::spawn_blocking(move || storage.sweep(ttl)).await {
                warn!(error = %err, "storage sweep task failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_and_canonicalizes() {
        let temp = tempdir().unwrap();
        let storage = Storage::open(temp.path().join("nested/clips")).unwrap();
        assert!(storage.dir().is_dir());
        assert!(storage.dir().is_absolute());
    }

    #[test]
    fn names_can_only_be_claimed_once() {
        let temp = tempdir().unwrap();
        let storage = Storage::open(temp.path()).unwrap();
        storage.issue("0011223344556677_abc.mp3", FileType::Mp3);

        let (path, file_type) = storage.claim("0011223344556677_abc.mp3").unwrap();
        assert_eq!(path, storage.dir().join("0011223344556677_abc.mp3"));
        assert_eq!(file_type, FileType::Mp3);

        let err = storage.claim("0011223344556677_abc.mp3").unwrap_err();
        assert!(matches!(err, ClipError::Delivery(_)));
    }

    #[test]
    fn unknown_and_traversal_names_are_refused() {
        let temp = tempdir().unwrap();
        let storage = Storage::open(temp.path()).unwrap();
        fs::write(storage.dir().join("stray.mp4"), b"x").unwrap();
        assert!(storage.claim("stray.mp4").is_err());
        assert!(storage.claim("../../etc/passwd").is_err());
        assert!(storage.claim("/etc/passwd").is_err());
    }

    #[test]
    fn relative_name_rejects_paths_outside_storage() {
        let temp = tempdir().unwrap();
        let storage = Storage::open(temp.path().join("clips")).unwrap();
        let inside = storage.dir().join("aa_b.mp4");
        assert_eq!(storage.relative_name(&inside).as_deref(), Some("aa_b.mp4"));
        assert_eq!(storage.relative_name(&temp.path().join("aa_b.mp4")), None);
    }

    #[test]
    fn sweep_removes_unclaimed_files_past_ttl() {
        let temp = tempdir().unwrap();
        let storage = Storage::open(temp.path()).unwrap();
        fs::write(storage.dir().join("old.mp4"), b"x").unwrap();

        let report = storage.sweep(Duration::from_secs(3600));
        assert_eq!(report.removed, 0);
        assert!(storage.dir().join("old.mp4").exists());

        let report = storage.sweep(Duration::ZERO);
        assert_eq!(report.removed, 1);
        assert!(!storage.dir().join("old.mp4").exists());
    }

    #[tokio::test]
    async fn sweeper_task_cleans_in_background() {
        let temp = tempdir().unwrap();
        let storage = Arc::new(Storage::open(temp.path()).unwrap());
        let path = storage.dir().join("leftover.mp3");
        fs::write(&path, b"x").unwrap();

        let handle = spawn_sweeper(storage.clone(), Duration::ZERO, Duration::from_millis(10));
        for _ in 0..100 {
            if !path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert!(!path.exists());
    }

    #[test]
    fn sweep_skips_files_of_running_invocations() {
        let temp = tempdir().unwrap();
        let storage = Storage::open(temp.path()).unwrap();
        let running = storage.dir().join("0123456789abcdef_vid.mp4.part");
        let stray = storage.dir().join("fedcba9876543210_vid.mp4");
        fs::write(&running, b"x").unwrap();
        fs::write(&stray, b"x").unwrap();

        let guard = storage.begin_run("0123456789abcdef");
        assert!(storage.is_in_flight("0123456789abcdef_vid.mp4.part"));
        let report = storage.sweep(Duration::ZERO);
        assert_eq!(report.removed, 1);
        assert!(running.exists());
        assert!(!stray.exists());

        drop(guard);
        assert!(!storage.is_in_flight("0123456789abcdef_vid.mp4.part"));
        storage.sweep(Duration::ZERO);
        assert!(!running.exists());
    }

    #[test]
    fn sweep_forgets_expired_names() {
        let temp = tempdir().unwrap();
        let storage = Storage::open(temp.path()).unwrap();
        storage.issue("gone.mp3", FileType::Mp3);
        storage.sweep(Duration::ZERO);
        assert!(!storage.is_issued("gone.mp3"));
    }
}
