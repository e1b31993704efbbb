//! Positioned byte sources and sinks.
//!
//! Parts of one transfer read and write concurrently, so every
//! implementation here uses positioned I/O: no shared cursor is moved.
//!
//! - `MemorySource` / `MemorySink` - in-memory buffers
//! - `FileSource` - positioned reads from a local file
//! - `FileSink` - positioned writes into a temporary file that is renamed
//!   over the destination on `finalize` and removed on `discard`

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::types::ByteRange;

/// Source of bytes for uploads.
#[async_trait]
pub trait RangedReader: Send + Sync {
    /// Description used in logs and errors (usually a path).
    fn describe(&self) -> String;

    /// Total length of the source in bytes.
    async fn len(&self) -> io::Result<u64>;

    /// Read exactly the bytes of `range`.
    async fn read_range(&self, range: ByteRange) -> io::Result<Bytes>;
}

/// Destination of bytes for downloads.
#[async_trait]
pub trait RangedWriter: Send + Sync {
    /// Description used in logs and errors (usually a path).
    fn describe(&self) -> String;

    /// Write `data` starting at `offset`.
    async fn write_at(&self, offset: u64, data: Bytes) -> io::Result<()>;

    /// Called once after every range was written successfully.
    async fn finalize(&self) -> io::Result<()> {
        Ok(())
    }

    /// Called once when the transfer failed or was cancelled.
    async fn discard(&self) -> io::Result<()> {
        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// In-memory upload source.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl RangedReader for MemorySource {
    fn describe(&self) -> String {
        format!("<memory: {} bytes>", self.data.len())
    }

    async fn len(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    async fn read_range(&self, range: ByteRange) -> io::Result<Bytes> {
        if range.end > self.data.len() as u64 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {} beyond {} bytes", range, self.data.len()),
            ));
        }
        Ok(self.data.slice(range.start as usize..range.end as usize))
    }
}

/// In-memory download destination.
#[derive(Debug, Default)]
pub struct MemorySink {
    data: Mutex<Vec<u8>>,
    finalized: Mutex<bool>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the bytes written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// True once `finalize` has been called.
    pub fn is_finalized(&self) -> bool {
        *self.finalized.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RangedWriter for MemorySink {
    fn describe(&self) -> String {
        "<memory>".to_string()
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> io::Result<()> {
        let mut buf = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let start: usize = offset as usize;
        let end: usize = start + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(&data);
        Ok(())
    }

    async fn finalize(&self) -> io::Result<()> {
        *self.finalized.lock().unwrap_or_else(|e| e.into_inner()) = true;
        Ok(())
    }

    async fn discard(&self) -> io::Result<()> {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }
}

// ============================================================================
// Files
// ============================================================================

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            n => {
                let rest = buf;
                buf = &mut rest[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

/// Upload source backed by a local file.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    file: Arc<File>,
}

impl FileSource {
    /// Open `path` for positioned reads.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let file: File = File::open(&path)?;
        Ok(Self {
            path,
            file: Arc::new(file),
        })
    }
}

#[async_trait]
impl RangedReader for FileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn len(&self) -> io::Result<u64> {
        let file = self.file.clone();
        blocking(move || Ok(file.metadata()?.len())).await
    }

    async fn read_range(&self, range: ByteRange) -> io::Result<Bytes> {
        let file = self.file.clone();
        blocking(move || {
            let mut buffer: Vec<u8> = vec![0u8; range.len() as usize];
            read_exact_at(&file, &mut buffer, range.start)?;
            Ok(Bytes::from(buffer))
        })
        .await
    }
}

/// Download destination backed by a local file.
///
/// Bytes land in a temporary file next to the destination; the destination
/// itself only appears once `finalize` renames it into place.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    temp_path: PathBuf,
    file: Arc<File>,
    settled: AtomicBool,
}

impl FileSink {
    /// Create the temporary file for a download to `path`.
    ///
    /// Parent directories are created if needed.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file_name: String = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has no file name", path.display()),
                )
            })?;
        let temp_name: String = format!(
            ".{}.{}.part",
            file_name,
            uuid::Uuid::new_v4().simple()
        );
        let temp_path: PathBuf = path.with_file_name(temp_name);

        let file: File = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&temp_path)?;

        Ok(Self {
            path,
            temp_path,
            file: Arc::new(file),
            settled: AtomicBool::new(false),
        })
    }

    /// Path of the temporary file while the download is in progress.
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }
}

#[async_trait]
impl RangedWriter for FileSink {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn write_at(&self, offset: u64, data: Bytes) -> io::Result<()> {
        let file = self.file.clone();
        blocking(move || write_all_at(&file, &data, offset)).await
    }

    async fn finalize(&self) -> io::Result<()> {
        let file = self.file.clone();
        let temp_path: PathBuf = self.temp_path.clone();
        let path: PathBuf = self.path.clone();
        blocking(move || {
            file.sync_all()?;
            std::fs::rename(&temp_path, &path)
        })
        .await?;
        self.settled.store(true, Ordering::Release);
        Ok(())
    }

    async fn discard(&self) -> io::Result<()> {
        let temp_path: PathBuf = self.temp_path.clone();
        blocking(move || match std::fs::remove_file(&temp_path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        })
        .await?;
        self.settled.store(true, Ordering::Release);
        Ok(())
    }
}

impl Drop for FileSink {
    /// Remove the temporary file of a sink that was never finalized or
    /// discarded, e.g. one whose request was rejected or whose driver panicked.
    fn drop(&mut self) {
        if self.settled.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.temp_path) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("failed to remove {}: {}", self.temp_path.display(), e);
            }
        }
    }
}
