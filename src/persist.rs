//! Locked, whole-file JSON persistence shared by the outcome store and the
//! cost ledger.
//!
//! # Error Handling
//!
//! A missing file or one that does not parse reads as the default value.
//! Failing to take the lock is an error for [`JsonFile::try_read`] and a
//! logged fallback to the default for [`JsonFile::read`]. Updates take an
//! exclusive advisory lock on a sibling `.lock` file for the whole
//! read-modify-write cycle and replace the data file atomically, so
//! concurrent runs serialize instead of losing updates.

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const LOCK_TIMEOUT_SECS: u64 = 5;
const LOCK_RETRY_MS: u64 = 50;

struct FileLock {
    file: File,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// A JSON document on disk, rewritten in full on every change.
#[derive(Debug, Clone)]
pub(crate) struct JsonFile {
    path: PathBuf,
    lock_timeout: Duration,
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: Duration::from_secs(LOCK_TIMEOUT_SECS),
        }
    }

    #[cfg(test)]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn ensure_parent(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    fn lock(&self, exclusive: bool) -> anyhow::Result<FileLock> {
        self.ensure_parent()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path())?;

        let start = Instant::now();
        loop {
            let result = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match result {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if start.elapsed() >= self.lock_timeout {
                        return Err(anyhow::anyhow!(
                            "Timed out waiting for lock on {} ({}ms)",
                            self.path.display(),
                            self.lock_timeout.as_millis()
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
            }
        }

        Ok(FileLock { file })
    }

    /// Load the document, falling back to the default on any problem.
    pub fn read<T: DeserializeOwned + Default>(&self) -> T {
        self.try_read().unwrap_or_else(|err| {
            tracing::warn!(path = %self.path.display(), error = %err, "could not lock file for reading");
            T::default()
        })
    }

    /// Load the document under a shared lock.
    ///
    /// A missing or unparsable file is the default document; only a lock
    /// that cannot be taken is an error.
    pub fn try_read<T: DeserializeOwned + Default>(&self) -> anyhow::Result<T> {
        if !self.path.exists() {
            return Ok(T::default());
        }
        let _lock = self.lock(false)?;
        Ok(match fs::read_to_string(&self.path) {
            Ok(content) => parse_or_default(&self.path, &content),
            Err(_) => T::default(),
        })
    }

    /// Run a read-modify-write cycle under an exclusive lock.
    ///
    /// `mutate` returns its result together with a flag telling whether it
    /// changed the document; unchanged documents are not rewritten.
    pub fn update<T, R>(&self, mutate: impl FnOnce(&mut T) -> (R, bool)) -> anyhow::Result<R>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        let _lock = self.lock(true)?;
        let mut data: T = match fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(data) => data,
                Err(err) => {
                    preserve_corrupt(&self.path, &content);
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %err,
                        "file was corrupted; a backup was saved and it starts empty"
                    );
                    T::default()
                }
            },
            Err(_) => T::default(),
        };

        let (result, changed) = mutate(&mut data);
        if changed {
            let content = serde_json::to_string_pretty(&data)?;
            write_atomic(&self.path, &content)?;
        }
        Ok(result)
    }
}

fn parse_or_default<T: DeserializeOwned + Default>(path: &Path, content: &str) -> T {
    match serde_json::from_str(content) {
        Ok(data) => data,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable file");
            T::default()
        }
    }
}

fn preserve_corrupt(path: &Path, content: &str) {
    let mut corrupt = path.as_os_str().to_owned();
    corrupt.push(".corrupt");
    let corrupt_path = PathBuf::from(corrupt);
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

/// Write via a temp file and rename so readers never see a partial file.
///
/// `rename` replaces an existing destination on every supported platform, so
/// the data file is never absent.
fn write_atomic(path: &Path, content: &str) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}
