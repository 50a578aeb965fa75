//! # Filesystem Dispatch Layer
//!
//! Filesystems register a driver whose `resolve` probes a disk for its
//! on-disk signature; the first driver to claim a disk binds a
//! disk-specific `Filesystem` instance to it. Open files live in a
//! 512-slot descriptor table with 1-based indices; descriptor 0 means
//! "no descriptor" and is what `fopen` returns on *any* failure, richer
//! internal errors notwithstanding.

pub mod fat16;
pub mod path;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::{Mutex, Once};

use crate::config::{MAX_FILESYSTEMS, MAX_FILE_DESCRIPTORS};
use crate::disk::Disk;
use crate::status::KernelError;

/// Open mode resolved from the `fopen` mode string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
    Append,
}

impl FileMode {
    /// Maps "r"/"w"/"a" to a mode.
    pub fn from_mode_str(mode: &str) -> Option<Self> {
        match mode {
            "r" => Some(FileMode::Read),
            "w" => Some(FileMode::Write),
            "a" => Some(FileMode::Append),
            _ => None,
        }
    }
}

/// Seek origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    Set,
    Cur,
    End,
}

bitflags! {
    /// Stat flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileStatFlags: u32 {
        const READ_ONLY = 1 << 0;
    }
}

/// File metadata.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub filesize: u32,
    pub flags: FileStatFlags,
}

/// An open file, private to the filesystem that produced it.
pub trait FileHandle: Send {
    /// Reads `nmemb` records of `size` bytes into `out`, advancing the
    /// position by `size` per record. Returns the record count.
    fn read(&mut self, size: usize, nmemb: usize, out: &mut [u8]) -> Result<usize, KernelError>;

    /// Moves the position.
    fn seek(&mut self, offset: u32, whence: SeekMode) -> Result<(), KernelError>;

    /// Reports size and flags.
    fn stat(&self) -> Result<FileStat, KernelError>;
}

/// A filesystem instance bound to one disk.
pub trait Filesystem: Send + Sync {
    fn name(&self) -> &'static str;

    /// Resolves `parts` below the root and opens the named item.
    fn open(
        self: Arc<Self>,
        parts: &[String],
        mode: FileMode,
    ) -> Result<Box<dyn FileHandle>, KernelError>;
}

/// A registered filesystem implementation.
pub trait FilesystemDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Probes `disk`; `FsNotUs` when the signature does not match.
    fn resolve(&self, disk: &Arc<Disk>) -> Result<Arc<dyn Filesystem>, KernelError>;
}

static FILESYSTEMS: Mutex<Vec<Arc<dyn FilesystemDriver>>> = Mutex::new(Vec::new());

/// Registers a filesystem driver. The registry holds at most
/// `MAX_FILESYSTEMS` entries; overflowing it is a kernel bug.
pub fn insert_filesystem(driver: Arc<dyn FilesystemDriver>) {
    let mut filesystems = FILESYSTEMS.lock();
    if filesystems.len() >= MAX_FILESYSTEMS {
        panic!("filesystem registry is full");
    }
    log::info!("registered filesystem {}", driver.name());
    filesystems.push(driver);
}

static INIT: Once<()> = Once::new();

/// Loads the static filesystem drivers.
pub fn init() {
    INIT.call_once(|| {
        insert_filesystem(Arc::new(fat16::Fat16Driver));
    });
}

/// Walks the registered drivers in order and returns the first
/// filesystem that claims the disk.
pub fn resolve(disk: &Arc<Disk>) -> Option<Arc<dyn Filesystem>> {
    let drivers: Vec<Arc<dyn FilesystemDriver>> = FILESYSTEMS.lock().clone();
    for driver in drivers {
        match driver.resolve(disk) {
            Ok(fs) => return Some(fs),
            Err(_) => continue,
        }
    }
    None
}

struct OpenFile {
    handle: Box<dyn FileHandle>,
}

static FILE_DESCRIPTORS: Mutex<[Option<OpenFile>; MAX_FILE_DESCRIPTORS]> =
    Mutex::new([const { None }; MAX_FILE_DESCRIPTORS]);

fn new_descriptor(file: OpenFile) -> Result<usize, KernelError> {
    let mut descriptors = FILE_DESCRIPTORS.lock();
    for (index, slot) in descriptors.iter_mut().enumerate() {
        if slot.is_none() {
            *slot = Some(file);
            // Descriptors start at 1.
            return Ok(index + 1);
        }
    }
    Err(KernelError::NoMemory)
}

fn with_descriptor<R>(fd: usize, f: impl FnOnce(&mut OpenFile) -> R) -> Option<R> {
    if fd < 1 || fd > MAX_FILE_DESCRIPTORS {
        return None;
    }
    let mut descriptors = FILE_DESCRIPTORS.lock();
    descriptors[fd - 1].as_mut().map(f)
}

fn open_internal(filename: &str, mode_str: &str) -> Result<usize, KernelError> {
    let parsed = path::parse(filename)?;

    // A bare drive root has nothing to open.
    if parsed.parts.is_empty() {
        return Err(KernelError::InvalidArgument);
    }

    let disk = crate::disk::get(parsed.drive).ok_or(KernelError::Io)?;
    let fs = disk.filesystem().ok_or(KernelError::Io)?;
    let mode = FileMode::from_mode_str(mode_str).ok_or(KernelError::InvalidArgument)?;

    let handle = fs.open(&parsed.parts, mode)?;
    new_descriptor(OpenFile { handle })
}

/// Opens a file. Returns the descriptor index, or 0 on any failure.
pub fn fopen(filename: &str, mode_str: &str) -> usize {
    open_internal(filename, mode_str).unwrap_or(0)
}

/// Reads `nmemb` records of `size` bytes into `out`.
pub fn fread(out: &mut [u8], size: usize, nmemb: usize, fd: usize) -> Result<usize, KernelError> {
    if size == 0 || nmemb == 0 || fd < 1 {
        return Err(KernelError::Io);
    }
    if out.len() < size * nmemb {
        return Err(KernelError::InvalidArgument);
    }
    with_descriptor(fd, |file| file.handle.read(size, nmemb, out))
        .ok_or(KernelError::InvalidArgument)?
}

/// Seeks within an open file.
pub fn fseek(fd: usize, offset: u32, whence: SeekMode) -> Result<(), KernelError> {
    with_descriptor(fd, |file| file.handle.seek(offset, whence)).ok_or(KernelError::Io)?
}

/// Stats an open file.
pub fn fstat(fd: usize) -> Result<FileStat, KernelError> {
    with_descriptor(fd, |file| file.handle.stat()).ok_or(KernelError::Io)?
}

/// Closes a descriptor, releasing its slot.
pub fn fclose(fd: usize) -> Result<(), KernelError> {
    if fd < 1 || fd > MAX_FILE_DESCRIPTORS {
        return Err(KernelError::Io);
    }
    let mut descriptors = FILE_DESCRIPTORS.lock();
    match descriptors[fd - 1].take() {
        Some(_) => Ok(()),
        None => Err(KernelError::Io),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fopen_folds_failures_to_zero() {
        assert_eq!(fopen("bogus", "r"), 0);
        assert_eq!(fopen("0:/", "r"), 0);
        assert_eq!(fopen("5:/missing.txt", "r"), 0);
    }

    #[test]
    fn test_fread_rejects_degenerate_arguments() {
        let mut buf = [0u8; 4];
        assert_eq!(fread(&mut buf, 0, 1, 1), Err(KernelError::Io));
        assert_eq!(fread(&mut buf, 1, 0, 1), Err(KernelError::Io));
        assert_eq!(fread(&mut buf, 1, 1, 0), Err(KernelError::Io));
    }

    #[test]
    fn test_operations_on_unknown_descriptor_fail() {
        assert_eq!(fseek(400, 0, SeekMode::Set), Err(KernelError::Io));
        assert!(fstat(400).is_err());
        assert_eq!(fclose(400), Err(KernelError::Io));
        assert_eq!(fclose(0), Err(KernelError::Io));
    }

    #[test]
    fn test_mode_strings() {
        assert_eq!(FileMode::from_mode_str("r"), Some(FileMode::Read));
        assert_eq!(FileMode::from_mode_str("w"), Some(FileMode::Write));
        assert_eq!(FileMode::from_mode_str("a"), Some(FileMode::Append));
        assert_eq!(FileMode::from_mode_str("x"), None);
    }
}
