//! Advisory locking of the mailbox file.
//!
//! The lock lives on a sidecar file (`<mailbox>.lock` by default) so the
//! mailbox itself can be truncated and rewritten while locked. Shared locks
//! are taken for scans, exclusive locks for anything that writes.
//!
//! Acquisition is scoped: [`LockGuard`] releases on drop, so every exit path
//! (including `?` returns and unwinding) gives the lock back.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::error::{MboxError, Phase, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A cooperative lock shared by every process that touches the mailbox.
pub trait Locker: Send + Sync {
    /// Acquire the lock in `mode`. Nested calls are counted.
    fn lock(&self, mode: LockMode) -> Result<()>;

    /// Release one level of locking.
    fn unlock(&self) -> Result<()>;

    /// Refresh the lock's age so other processes can tell it is still in use.
    fn touch(&self) -> Result<()>;

    /// Delete whatever backs the lock. Called once the mailbox itself is gone.
    fn remove(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Held {
    file: Option<File>,
    /// Mode requested by each nested acquisition, innermost last.
    modes: Vec<LockMode>,
}

impl Held {
    fn effective(&self) -> Option<LockMode> {
        if self.modes.is_empty() {
            None
        } else if self.modes.contains(&LockMode::Exclusive) {
            Some(LockMode::Exclusive)
        } else {
            Some(LockMode::Shared)
        }
    }
}

/// `flock`-style lock on a sidecar file, via `fs2`.
#[derive(Debug)]
pub struct FileLocker {
    path: PathBuf,
    config: LockConfig,
    held: Mutex<Held>,
}

impl FileLocker {
    /// Locker for `mailbox`, using the configured lock-file suffix.
    pub fn for_mailbox(mailbox: &Path, config: &LockConfig) -> Self {
        let mut name = mailbox.as_os_str().to_owned();
        name.push(&config.lock_file_suffix);
        Self {
            path: PathBuf::from(name),
            config: config.clone(),
            held: Mutex::new(Held::default()),
        }
    }

    /// Path of the sidecar lock file.
    pub fn lock_path(&self) -> &Path {
        &self.path
    }

    fn held(&self) -> Result<MutexGuard<'_, Held>> {
        self.held.lock().map_err(|_| {
            MboxError::io(
                Phase::Lock,
                0,
                &self.path,
                io::Error::other("lock state poisoned"),
            )
        })
    }

    fn open_lock_file(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| MboxError::io(Phase::Lock, 0, &self.path, e))
    }

    /// Try `mode` on `file`, retrying contention per configuration.
    fn acquire(&self, file: &File, mode: LockMode) -> Result<()> {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            let res = match mode {
                LockMode::Shared => FileExt::try_lock_shared(file),
                LockMode::Exclusive => FileExt::try_lock_exclusive(file),
            };
            match res {
                Ok(()) => {
                    debug!(path = %self.path.display(), ?mode, attempt, "Lock acquired");
                    return Ok(());
                }
                Err(e) if is_contended(&e) => {
                    if attempt >= self.config.retries {
                        self.report_stale_holder(file);
                        return Err(if self.config.retries == 0 {
                            MboxError::LockDenied {
                                path: self.path.clone(),
                            }
                        } else {
                            MboxError::LockTimeout {
                                path: self.path.clone(),
                                waited: started.elapsed(),
                            }
                        });
                    }
                    attempt += 1;
                    std::thread::sleep(self.config.retry_interval());
                }
                Err(e) => return Err(MboxError::io(Phase::Lock, 0, &self.path, e)),
            }
        }
    }

    /// Warn when the holder has not touched the lock for longer than the expiry age.
    ///
    /// The lock is never broken: `flock` locks die with their holder, so a
    /// lock that is still contended belongs to a live process. An old lock
    /// file nobody holds is simply acquired.
    fn report_stale_holder(&self, file: &File) {
        let age = file
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| SystemTime::now().duration_since(t).ok());
        if let Some(age) = age {
            if age > self.config.expire_after() {
                let mut holder = String::new();
                let mut f = file;
                let _ = f
                    .seek(SeekFrom::Start(0))
                    .and_then(|_| f.read_to_string(&mut holder));
                warn!(
                    path = %self.path.display(),
                    age_secs = age.as_secs(),
                    holder = holder.trim(),
                    "Lock holder looks abandoned but still holds the lock"
                );
            }
        }
    }

    fn write_owner(&self, file: &File) -> Result<()> {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let line = format!("{} {}\n", std::process::id(), stamp);
        let mut f = file;
        f.seek(SeekFrom::Start(0))
            .and_then(|_| f.write_all(line.as_bytes()))
            .and_then(|_| file.set_len(line.len() as u64))
            .map_err(|e| MboxError::io(Phase::Lock, 0, &self.path, e))
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl Locker for FileLocker {
    fn lock(&self, mode: LockMode) -> Result<()> {
        let mut held = self.held()?;
        let before = held.effective();
        if held.file.is_none() {
            held.file = Some(self.open_lock_file()?);
        }
        let Some(file) = held.file.as_ref() else {
            return Err(MboxError::InvalidHandle("lock file not open".into()));
        };
        match (before, mode) {
            (Some(LockMode::Exclusive), _) | (Some(LockMode::Shared), LockMode::Shared) => {}
            _ => {
                if let Err(e) = self.acquire(file, mode) {
                    if before.is_none() {
                        held.file = None;
                    }
                    return Err(e);
                }
                if mode == LockMode::Exclusive {
                    self.write_owner(file)?;
                }
            }
        }
        held.modes.push(mode);
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        let mut held = self.held()?;
        let before = held.effective();
        if held.modes.pop().is_none() {
            return Err(MboxError::InvalidHandle(format!(
                "{} is not locked",
                self.path.display()
            )));
        }
        match (before, held.effective()) {
            (_, None) => {
                if let Some(file) = held.file.take() {
                    FileExt::unlock(&file)
                        .map_err(|e| MboxError::io(Phase::Lock, 0, &self.path, e))?;
                }
                debug!(path = %self.path.display(), "Lock released");
            }
            (Some(LockMode::Exclusive), Some(LockMode::Shared)) => {
                // Leaving a nested exclusive section.
                if let Some(file) = held.file.as_ref() {
                    FileExt::lock_shared(file)
                        .map_err(|e| MboxError::io(Phase::Lock, 0, &self.path, e))?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn touch(&self) -> Result<()> {
        let held = self.held()?;
        match (held.file.as_ref(), held.effective()) {
            (Some(file), Some(LockMode::Exclusive)) => self.write_owner(file),
            (Some(file), Some(LockMode::Shared)) => file
                .set_modified(SystemTime::now())
                .map_err(|e| MboxError::io(Phase::Lock, 0, &self.path, e)),
            _ => Ok(()),
        }
    }

    fn remove(&self) -> Result<()> {
        if let Some(file) = self.held()?.file.take() {
            let _ = FileExt::unlock(&file);
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MboxError::io(Phase::Remove, 0, &self.path, e)),
        }
    }
}

/// Locker that never contends. Used for in-memory mailboxes.
#[derive(Debug, Default)]
pub struct NullLocker {
    depth: Mutex<usize>,
}

impl Locker for NullLocker {
    fn lock(&self, _mode: LockMode) -> Result<()> {
        if let Ok(mut depth) = self.depth.lock() {
            *depth += 1;
        }
        Ok(())
    }

    fn unlock(&self) -> Result<()> {
        let mut depth = self
            .depth
            .lock()
            .map_err(|_| MboxError::InvalidHandle("lock state poisoned".into()))?;
        if *depth == 0 {
            return Err(MboxError::InvalidHandle("not locked".into()));
        }
        *depth -= 1;
        Ok(())
    }

    fn touch(&self) -> Result<()> {
        Ok(())
    }
}

/// Scoped lock acquisition. Releases on drop.
pub struct LockGuard<'a> {
    locker: &'a dyn Locker,
    mode: LockMode,
}

impl<'a> LockGuard<'a> {
    pub fn acquire(locker: &'a dyn Locker, mode: LockMode) -> Result<Self> {
        locker.lock(mode)?;
        Ok(Self { locker, mode })
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn touch(&self) -> Result<()> {
        self.locker.touch()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.locker.unlock() {
            warn!(error = %e, "Failed to release mailbox lock");
        }
    }
}
