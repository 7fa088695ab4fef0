#![forbid(unsafe_code)]
//! Positioned file I/O and the strategy that maps containers to files.

use std::{
    collections::HashMap,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::trace;

use crate::types::{ContainerKey, Result, StoreError};

/// Positioned file I/O.
pub trait FileIo: Send + Sync + 'static {
    /// Reads exactly `dst.len()` bytes at `off`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`, extending the file if needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Flushes data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current file length in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file.
    fn truncate(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
mod stdio {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::unix::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "read_at reached EOF"));
            }
            dst = &mut dst[read..];
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(ErrorKind::WriteZero, "write_at wrote zero bytes"));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod stdio {
    use std::{
        fs::File,
        io::{self, ErrorKind},
        os::windows::fs::FileExt,
    };

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "seek_read reached EOF"));
            }
            dst = &mut dst[read..];
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(ErrorKind::WriteZero, "seek_write wrote zero bytes"));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

/// [`FileIo`] over a real file.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an open file.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens or creates a file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        trace!(off, len = dst.len(), "io.read_at");
        stdio::read_exact(&self.inner, off, dst).map_err(StoreError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        trace!(off, len = src.len(), "io.write_at");
        stdio::write_all(&self.inner, off, src).map_err(StoreError::from)
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all().map_err(StoreError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.set_len(len).map_err(StoreError::from)
    }
}

/// [`FileIo`] over a heap buffer. Writes are immediately "durable".
#[derive(Default)]
pub struct MemFileIo {
    data: Mutex<Vec<u8>>,
}

impl MemFileIo {
    /// Creates an empty in-memory file.
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileIo for MemFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let data = self.data.lock();
        let start = usize::try_from(off).map_err(|_| StoreError::Invalid("offset too large"))?;
        let end = start
            .checked_add(dst.len())
            .filter(|end| *end <= data.len())
            .ok_or_else(|| {
                StoreError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "read past end of memory file",
                ))
            })?;
        dst.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let start = usize::try_from(off).map_err(|_| StoreError::Invalid("offset too large"))?;
        let end = start + src.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let len = usize::try_from(len).map_err(|_| StoreError::Invalid("length too large"))?;
        self.data.lock().resize(len, 0);
        Ok(())
    }
}

/// Resolves containers and the log to files.
///
/// Chosen once when the store is opened; the rest of the crate only sees
/// `Arc<dyn ContainerStorage>`.
pub trait ContainerStorage: Send + Sync + 'static {
    /// Opens the file backing `key`. Returns `None` if it does not exist and
    /// `create` is false.
    fn open(&self, key: ContainerKey, create: bool) -> Result<Option<Arc<dyn FileIo>>>;
    /// Deletes the file backing `key`. Missing files are not an error.
    fn remove(&self, key: ContainerKey) -> Result<()>;
    /// Every container with a backing file.
    fn list(&self) -> Result<Vec<ContainerKey>>;
    /// Opens (creating if needed) the write-ahead log file.
    fn open_log(&self) -> Result<Arc<dyn FileIo>>;
}

/// Containers as files under a directory: `seg<N>/c<id>.dat`, log in `log.dat`.
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    /// Uses `root`, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Path of the file backing `key`.
    pub fn container_path(&self, key: ContainerKey) -> PathBuf {
        self.root
            .join(format!("seg{}", key.segment))
            .join(format!("c{}.dat", key.container))
    }
}

impl ContainerStorage for DirStorage {
    fn open(&self, key: ContainerKey, create: bool) -> Result<Option<Arc<dyn FileIo>>> {
        let path = self.container_path(key);
        if !create && !path.exists() {
            return Ok(None);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Some(Arc::new(StdFileIo::open(path)?)))
    }

    fn remove(&self, key: ContainerKey) -> Result<()> {
        match fs::remove_file(self.container_path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self) -> Result<Vec<ContainerKey>> {
        let mut keys = Vec::new();
        for seg in fs::read_dir(&self.root)? {
            let seg = seg?;
            let name = seg.file_name();
            let Some(segment) = name
                .to_str()
                .and_then(|n| n.strip_prefix("seg"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            for entry in fs::read_dir(seg.path())? {
                let entry = entry?;
                let name = entry.file_name();
                if let Some(container) = name
                    .to_str()
                    .and_then(|n| n.strip_prefix('c'))
                    .and_then(|n| n.strip_suffix(".dat"))
                    .and_then(|n| n.parse::<u64>().ok())
                {
                    keys.push(ContainerKey::new(segment, container));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn open_log(&self) -> Result<Arc<dyn FileIo>> {
        Ok(Arc::new(StdFileIo::open(self.root.join("log.dat"))?))
    }
}

/// Containers held in memory. Cloning shares the same files, which lets a
/// test reopen a store over the state a previous instance left behind.
#[derive(Clone, Default)]
pub struct MemStorage {
    files: Arc<Mutex<HashMap<ContainerKey, Arc<MemFileIo>>>>,
    log: Arc<MemFileIo>,
}

impl MemStorage {
    /// Creates empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContainerStorage for MemStorage {
    fn open(&self, key: ContainerKey, create: bool) -> Result<Option<Arc<dyn FileIo>>> {
        let mut files = self.files.lock();
        if let Some(file) = files.get(&key) {
            return Ok(Some(file.clone() as Arc<dyn FileIo>));
        }
        if !create {
            return Ok(None);
        }
        let file = Arc::new(MemFileIo::new());
        files.insert(key, file.clone());
        Ok(Some(file as Arc<dyn FileIo>))
    }

    fn remove(&self, key: ContainerKey) -> Result<()> {
        self.files.lock().remove(&key);
        Ok(())
    }

    fn list(&self) -> Result<Vec<ContainerKey>> {
        let mut keys: Vec<_> = self.files.lock().keys().copied().collect();
        keys.sort();
        Ok(keys)
    }

    fn open_log(&self) -> Result<Arc<dyn FileIo>> {
        Ok(self.log.clone() as Arc<dyn FileIo>)
    }
}
