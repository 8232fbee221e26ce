//! Byte-range streams over the mailbox file.
//!
//! [`ByteStream`] is positional (`read_at` / `write_at`), so one handle can be
//! shared between the scanner, message views and the compactor without a
//! shared cursor. [`SubStream`] clamps a stream to `[start, end)` and adds its
//! own cursor for `Read` + `Seek`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seekable, truncatable byte storage.
pub trait ByteStream: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`. Returns 0 at end of stream.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Write all of `buf` at `offset`, extending the stream if needed.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    fn size(&self) -> io::Result<u64>;

    fn truncate(&self, len: u64) -> io::Result<()>;

    fn flush(&self) -> io::Result<()>;

    /// Last modification time, when the backing store has one.
    fn modified(&self) -> io::Result<Option<SystemTime>> {
        Ok(None)
    }

    /// Delete the backing store.
    fn remove(&self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "stream cannot be removed",
        ))
    }

    /// Path of the backing file, for diagnostics.
    fn path(&self) -> &Path;
}

fn lock_poisoned() -> io::Error {
    io::Error::other("stream lock poisoned")
}

/// A [`ByteStream`] backed by a file on disk.
#[derive(Debug)]
pub struct FileStream {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileStream {
    /// Open an existing file for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Open read-only (writes will fail).
    pub fn open_read_only(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Create the file if it does not exist.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    fn file(&self) -> io::Result<MutexGuard<'_, File>> {
        self.file.lock().map_err(|_| lock_poisoned())
    }
}

impl ByteStream for FileStream {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read(buf)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.file()?.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> io::Result<()> {
        self.file()?.set_len(len)
    }

    fn flush(&self) -> io::Result<()> {
        let mut file = self.file()?;
        file.flush()?;
        file.sync_data()
    }

    fn modified(&self) -> io::Result<Option<SystemTime>> {
        Ok(self.file()?.metadata()?.modified().ok())
    }

    fn remove(&self) -> io::Result<()> {
        std::fs::remove_file(&self.path)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// An in-memory [`ByteStream`], handy for tests and scratch mailboxes.
///
/// Every change bumps a counter that [`ByteStream::modified`] reports as a
/// timestamp, so same-size rewrites are noticed like on a real file.
#[derive(Debug, Default)]
pub struct MemStream {
    path: PathBuf,
    data: Mutex<Vec<u8>>,
    changes: AtomicU64,
}

impl MemStream {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: PathBuf::from("<memory>"),
            data: Mutex::new(data.into()),
            changes: AtomicU64::new(0),
        }
    }

    fn touched(&self) {
        self.changes.fetch_add(1, Ordering::AcqRel);
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Append bytes, as another writer would.
    pub fn append(&self, bytes: &[u8]) {
        if let Ok(mut data) = self.data.lock() {
            data.extend_from_slice(bytes);
        }
        self.touched();
    }
}

impl ByteStream for MemStream {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let data = self.data.lock().map_err(|_| lock_poisoned())?;
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut data = self.data.lock().map_err(|_| lock_poisoned())?;
        let start = offset as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.touched();
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.data.lock().map_err(|_| lock_poisoned())?.len() as u64)
    }

    fn truncate(&self, len: u64) -> io::Result<()> {
        self.data
            .lock()
            .map_err(|_| lock_poisoned())?
            .resize(len as usize, 0);
        self.touched();
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn modified(&self) -> io::Result<Option<SystemTime>> {
        let changes = self.changes.load(Ordering::Acquire);
        Ok(Some(UNIX_EPOCH + Duration::from_nanos(changes)))
    }

    fn remove(&self) -> io::Result<()> {
        self.data.lock().map_err(|_| lock_poisoned())?.clear();
        self.touched();
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Read-only view of `[start, end)` of a [`ByteStream`].
///
/// Reads past `end` see end-of-stream; offsets past `end` are rejected.
/// A sub-stream handed out by a message view stops working once the view is
/// invalidated by a rescan.
#[derive(Clone)]
pub struct SubStream {
    inner: Arc<dyn ByteStream>,
    start: u64,
    end: u64,
    pos: u64,
    live: Option<Arc<AtomicBool>>,
}

impl std::fmt::Debug for SubStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubStream")
            .field("path", &self.inner.path())
            .field("start", &self.start)
            .field("end", &self.end)
            .field("pos", &self.pos)
            .finish()
    }
}

impl SubStream {
    pub fn new(inner: Arc<dyn ByteStream>, start: u64, end: u64) -> Self {
        Self {
            inner,
            start,
            end: end.max(start),
            pos: 0,
            live: None,
        }
    }

    /// Tie the sub-stream to a liveness flag owned by a message view.
    pub(crate) fn with_liveness(mut self, live: Arc<AtomicBool>) -> Self {
        self.live = Some(live);
        self
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Absolute offset of the first byte in the underlying stream.
    pub fn start(&self) -> u64 {
        self.start
    }

    fn check_live(&self) -> io::Result<()> {
        match &self.live {
            Some(flag) if !flag.load(Ordering::Acquire) => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "message was rewritten; fetch it again",
            )),
            _ => Ok(()),
        }
    }

    /// Read at an offset relative to `start`.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.check_live()?;
        if offset > self.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("offset {offset} outside range of {} bytes", self.len()),
            ));
        }
        let remaining = self.len() - offset;
        let want = (buf.len() as u64).min(remaining) as usize;
        if want == 0 {
            return Ok(0);
        }
        self.inner.read_at(&mut buf[..want], self.start + offset)
    }

    /// Read the whole range.
    pub fn read_all(&self) -> io::Result<Vec<u8>> {
        let mut out = vec![0u8; self.len() as usize];
        let mut filled = 0;
        while filled < out.len() {
            let n = self.read_at(&mut out[filled..], filled as u64)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "mailbox shorter than indexed range",
                ));
            }
            filled += n;
        }
        Ok(out)
    }
}

impl Read for SubStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for SubStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::End(n) => self.len() as i128 + n as i128,
            SeekFrom::Current(n) => self.pos as i128 + n as i128,
        };
        if target < 0 || target > self.len() as i128 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek outside sub-stream range",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

/// Copy `len` bytes starting at `offset` of `src` into `dst`.
pub fn copy_range(
    src: &dyn ByteStream,
    offset: u64,
    len: u64,
    dst: &mut impl Write,
    buf: &mut [u8],
) -> io::Result<()> {
    let mut done = 0u64;
    while done < len {
        let want = ((len - done) as usize).min(buf.len());
        let n = src.read_at(&mut buf[..want], offset + done)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("expected {len} bytes at offset {offset}, got {done}"),
            ));
        }
        dst.write_all(&buf[..n])?;
        done += n as u64;
    }
    Ok(())
}
