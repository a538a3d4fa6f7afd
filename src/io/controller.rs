//! Pluggable file access layer.
//!
//! Every file the engine touches goes through a [`FileController`], so the
//! physical I/O strategy can be swapped per deployment: [`PosixFileController`]
//! issues direct syscalls with an optional minimum-free-space guard, while
//! [`SsdFileController`] batches writes into fixed-size blocks per underlying
//! device and tracks cumulative per-device write volume for wear visibility.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Options for opening a file for writing.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Open in append mode instead of truncating.
    pub append: bool,
    /// Hint the OS not to keep the written pages in its cache.
    pub drop_cache: bool,
}

impl WriteOptions {
    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    pub fn drop_cache(mut self, drop_cache: bool) -> Self {
        self.drop_cache = drop_cache;
        self
    }
}

/// Read-only file handle supporting positional reads from shared references.
pub trait RandomAccessFile: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read_at(offset + done as u64, &mut buf[done..])?;
            if n == 0 {
                return Err(Error::IoError(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "read past end of file",
                )));
            }
            done += n;
        }
        Ok(())
    }

    fn size(&self) -> Result<u64>;
}

/// Writable file handle. Buffering policy is up to the implementation;
/// callers that want an explicit growable buffer layer a
/// [`crate::io::FileWriter`] on top.
pub trait WritableFile: Send {
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Push any implementation-internal staging out to the file.
    fn flush(&mut self) -> Result<()>;

    /// Durability point: flush and fsync.
    fn sync(&mut self) -> Result<()>;

    /// Flush, apply cache hints, and release the handle.
    fn close(&mut self) -> Result<()>;
}

/// Abstracts open/close/pread/read/write so that physical I/O strategies are
/// interchangeable. Injected into the storage map at construction.
pub trait FileController: Send + Sync {
    fn open_read(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>>;
    fn open_write(&self, path: &Path, opts: WriteOptions) -> Result<Box<dyn WritableFile>>;
    fn remove_file(&self, path: &Path) -> Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>>;
}

// --- POSIX implementation ---

struct FreeSpaceState {
    last_check: Option<Instant>,
    available: u64,
}

/// Direct syscall-backed controller with an optional minimum-free-space
/// guard. The guard is evaluated when a file is opened for writing and the
/// `statvfs` result is cached for `free_check_period` between opens.
pub struct PosixFileController {
    min_free_space: Option<u64>,
    free_check_period: Duration,
    free_state: Mutex<FreeSpaceState>,
}

impl Default for PosixFileController {
    fn default() -> Self {
        Self::new()
    }
}

impl PosixFileController {
    pub fn new() -> Self {
        Self {
            min_free_space: None,
            free_check_period: Duration::from_secs(10),
            free_state: Mutex::new(FreeSpaceState {
                last_check: None,
                available: 0,
            }),
        }
    }

    pub fn min_free_space(mut self, bytes: u64) -> Self {
        self.min_free_space = Some(bytes);
        self
    }

    pub fn free_check_period(mut self, period: Duration) -> Self {
        self.free_check_period = period;
        self
    }

    fn ensure_free_space(&self, path: &Path) -> Result<()> {
        let required = match self.min_free_space {
            Some(required) => required,
            None => return Ok(()),
        };

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut state = self.free_state.lock().unwrap();

        let stale = match state.last_check {
            Some(at) => at.elapsed() >= self.free_check_period,
            None => true,
        };
        if stale {
            state.available = available_space(dir)?;
            state.last_check = Some(Instant::now());
        }

        if state.available < required {
            return Err(Error::InsufficientSpace {
                required,
                available: state.available,
            });
        }
        Ok(())
    }
}

impl FileController for PosixFileController {
    fn open_read(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>> {
        let file = File::open(path)?;
        Ok(Box::new(PosixRandomAccessFile {
            file,
            #[cfg(not(unix))]
            pos_lock: Mutex::new(()),
        }))
    }

    fn open_write(&self, path: &Path, opts: WriteOptions) -> Result<Box<dyn WritableFile>> {
        self.ensure_free_space(path)?;
        let file = open_for_write(path, opts)?;
        Ok(Box::new(PosixWritableFile {
            file: Some(file),
            drop_cache: opts.drop_cache,
        }))
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to)?;
        Ok(())
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        list_dir_entries(dir)
    }
}

fn open_for_write(path: &Path, opts: WriteOptions) -> Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true);
    if opts.append {
        options.append(true);
    } else {
        options.truncate(true);
    }
    Ok(options.open(path)?)
}

fn list_dir_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        entries.push(entry?.path());
    }
    entries.sort();
    Ok(entries)
}

struct PosixRandomAccessFile {
    file: File,
    #[cfg(not(unix))]
    pos_lock: Mutex<()>,
}

impl RandomAccessFile for PosixRandomAccessFile {
    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        Ok(self.file.read_at(buf, offset)?)
    }

    #[cfg(not(unix))]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        use std::io::{Read, Seek, SeekFrom};

        let _guard = self.pos_lock.lock().unwrap();
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        Ok(file.read(buf)?)
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

struct PosixWritableFile {
    file: Option<File>,
    drop_cache: bool,
}

impl PosixWritableFile {
    fn file(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::InvalidOperation("write to a closed file".to_string()))
    }
}

impl WritableFile for PosixWritableFile {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.file()?.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file()?.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file()?.sync_all()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.flush_and_hint(self.drop_cache)?;
        }
        Ok(())
    }
}

trait FlushAndHint {
    fn flush_and_hint(self, drop_cache: bool) -> Result<()>;
}

impl FlushAndHint for File {
    fn flush_and_hint(mut self, drop_cache: bool) -> Result<()> {
        self.flush()?;
        if drop_cache {
            advise_dont_need(&self)?;
        }
        Ok(())
    }
}

/// Hint the kernel that the file's pages will not be re-read soon. Linux
/// only; other platforms fall through.
#[cfg(target_os = "linux")]
fn advise_dont_need(file: &File) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let ret = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_DONTNEED) };
    if ret != 0 {
        return Err(Error::IoError(io::Error::from_raw_os_error(ret)));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn advise_dont_need(_file: &File) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn available_space(dir: &Path) -> Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(dir.as_os_str().as_bytes()).map_err(|_| {
        Error::IoError(io::Error::new(
            io::ErrorKind::InvalidInput,
            "path contains a NUL byte",
        ))
    })?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(Error::IoError(io::Error::last_os_error()));
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn available_space(_dir: &Path) -> Result<u64> {
    Ok(u64::MAX)
}

// --- SSD-aware implementation ---

/// Controller that stages writes into fixed-size blocks per underlying device
/// and accounts the cumulative volume written to each device. Reads and
/// directory operations go straight through.
pub struct SsdFileController {
    block_size: usize,
    devices: Mutex<HashMap<u64, Arc<AtomicU64>>>,
}

impl SsdFileController {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(512),
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Cumulative bytes written per device id since this controller was
    /// created, sorted by device id.
    pub fn write_volume(&self) -> Vec<(u64, u64)> {
        let devices = self.devices.lock().unwrap();
        let mut volume: Vec<(u64, u64)> = devices
            .iter()
            .map(|(dev, counter)| (*dev, counter.load(Ordering::Relaxed)))
            .collect();
        volume.sort_by_key(|(dev, _)| *dev);
        volume
    }

    fn device_counter(&self, path: &Path) -> Arc<AtomicU64> {
        let dev = device_id(path);
        let mut devices = self.devices.lock().unwrap();
        devices.entry(dev).or_default().clone()
    }
}

impl FileController for SsdFileController {
    fn open_read(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>> {
        let file = File::open(path)?;
        Ok(Box::new(PosixRandomAccessFile {
            file,
            #[cfg(not(unix))]
            pos_lock: Mutex::new(()),
        }))
    }

    fn open_write(&self, path: &Path, opts: WriteOptions) -> Result<Box<dyn WritableFile>> {
        let counter = self.device_counter(path);
        let file = open_for_write(path, opts)?;
        Ok(Box::new(BlockBatchingFile {
            file: Some(file),
            block: Vec::with_capacity(self.block_size),
            block_size: self.block_size,
            counter,
            drop_cache: opts.drop_cache,
        }))
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to)?;
        Ok(())
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        list_dir_entries(dir)
    }
}

#[cfg(unix)]
fn device_id(path: &Path) -> u64 {
    use std::os::unix::fs::MetadataExt;

    // The file may not exist yet; the parent directory sits on the same device.
    let probe = if path.exists() {
        path
    } else {
        path.parent().unwrap_or_else(|| Path::new("."))
    };
    fs::metadata(probe).map(|m| m.dev()).unwrap_or(0)
}

#[cfg(not(unix))]
fn device_id(_path: &Path) -> u64 {
    0
}

struct BlockBatchingFile {
    file: Option<File>,
    block: Vec<u8>,
    block_size: usize,
    counter: Arc<AtomicU64>,
    drop_cache: bool,
}

impl BlockBatchingFile {
    fn file(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::InvalidOperation("write to a closed file".to_string()))
    }

    fn drain_full_blocks(&mut self) -> Result<()> {
        let block_size = self.block_size;
        while self.block.len() >= block_size {
            let rest = self.block.split_off(block_size);
            let full = std::mem::replace(&mut self.block, rest);
            self.file()?.write_all(&full)?;
            self.counter.fetch_add(full.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    fn drain_remainder(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let rest = std::mem::take(&mut self.block);
        self.file()?.write_all(&rest)?;
        self.counter.fetch_add(rest.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

impl WritableFile for BlockBatchingFile {
    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.block.extend_from_slice(buf);
        self.drain_full_blocks()
    }

    fn flush(&mut self) -> Result<()> {
        self.drain_remainder()?;
        self.file()?.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.drain_remainder()?;
        self.file()?.sync_all()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.drain_remainder()?;
        if let Some(file) = self.file.take() {
            file.flush_and_hint(self.drop_cache)?;
        }
        Ok(())
    }
}
