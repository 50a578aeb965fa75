//! # Disk Layer
//!
//! Block device abstraction plus the LBA28 PIO driver for the primary
//! ATA disk. The kernel drives a single disk (id 0); probing resolves a
//! filesystem for it through the registry in `fs`.

pub mod streamer;

use alloc::sync::Arc;

use spin::{Once, RwLock};

use crate::arch::{inb, insw, outb};
use crate::config::SECTOR_SIZE;
use crate::fs::Filesystem;
use crate::status::KernelError;

pub use streamer::DiskStream;

/// A sector-addressable device.
pub trait BlockDevice: Send + Sync {
    /// Reads whole sectors starting at `lba` into `buf`; the buffer
    /// length must be a multiple of the sector size.
    fn read_sectors(&self, lba: u32, buf: &mut [u8]) -> Result<(), KernelError>;
}

/// ATA ports for the primary bus.
mod ata {
    pub const DATA: u16 = 0x1F0;
    pub const SECTOR_COUNT: u16 = 0x1F2;
    pub const LBA_LOW: u16 = 0x1F3;
    pub const LBA_MID: u16 = 0x1F4;
    pub const LBA_HIGH: u16 = 0x1F5;
    pub const DRIVE_SELECT: u16 = 0x1F6;
    pub const COMMAND: u16 = 0x1F7;
    pub const STATUS: u16 = 0x1F7;

    pub const CMD_READ_SECTORS: u8 = 0x20;
    pub const STATUS_DRQ: u8 = 0x08;
}

/// The primary master disk, spoken to over LBA28 PIO.
pub struct AtaPio;

impl BlockDevice for AtaPio {
    fn read_sectors(&self, lba: u32, buf: &mut [u8]) -> Result<(), KernelError> {
        if buf.len() % SECTOR_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let count = buf.len() / SECTOR_SIZE;

        outb(ata::DRIVE_SELECT, ((lba >> 24) as u8 & 0x0F) | 0xE0);
        outb(ata::SECTOR_COUNT, count as u8);
        outb(ata::LBA_LOW, lba as u8);
        outb(ata::LBA_MID, (lba >> 8) as u8);
        outb(ata::LBA_HIGH, (lba >> 16) as u8);
        outb(ata::COMMAND, ata::CMD_READ_SECTORS);

        for sector in 0..count {
            while inb(ata::STATUS) & ata::STATUS_DRQ == 0 {
                core::hint::spin_loop();
            }
            let base = sector * SECTOR_SIZE;
            for word in 0..SECTOR_SIZE / 2 {
                let value = insw(ata::DATA);
                buf[base + word * 2] = value as u8;
                buf[base + word * 2 + 1] = (value >> 8) as u8;
            }
        }

        Ok(())
    }
}

/// One attached disk and the filesystem that claimed it.
pub struct Disk {
    pub id: u32,
    pub sector_size: usize,
    device: Arc<dyn BlockDevice>,
    filesystem: RwLock<Option<Arc<dyn Filesystem>>>,
}

impl Disk {
    fn new(id: u32, device: Arc<dyn BlockDevice>) -> Self {
        Self {
            id,
            sector_size: SECTOR_SIZE,
            device,
            filesystem: RwLock::new(None),
        }
    }

    /// Reads `count` sectors starting at `lba`.
    pub fn read_block(&self, lba: u32, count: usize, buf: &mut [u8]) -> Result<(), KernelError> {
        if buf.len() < count * self.sector_size {
            return Err(KernelError::InvalidArgument);
        }
        self.device
            .read_sectors(lba, &mut buf[..count * self.sector_size])
    }

    /// The filesystem bound to this disk, if any driver claimed it.
    pub fn filesystem(&self) -> Option<Arc<dyn Filesystem>> {
        self.filesystem.read().clone()
    }

    fn bind_filesystem(&self, fs: Arc<dyn Filesystem>) {
        *self.filesystem.write() = Some(fs);
    }
}

static PRIMARY_DISK: Once<Arc<Disk>> = Once::new();

/// Registers `device` as disk 0 and runs filesystem resolution on it.
pub fn register(device: Arc<dyn BlockDevice>) -> Arc<Disk> {
    let disk = PRIMARY_DISK
        .call_once(|| Arc::new(Disk::new(0, device)))
        .clone();

    match crate::fs::resolve(&disk) {
        Some(fs) => {
            log::info!("disk {}: resolved filesystem {}", disk.id, fs.name());
            disk.bind_filesystem(fs);
        }
        None => log::warn!("disk {}: no filesystem claimed it", disk.id),
    }

    disk
}

/// Probes the primary ATA disk.
pub fn search_and_init() {
    register(Arc::new(AtaPio));
}

/// Looks up a disk by index. Only disk 0 exists.
pub fn get(index: u32) -> Option<Arc<Disk>> {
    if index != 0 {
        return None;
    }
    PRIMARY_DISK.get().cloned()
}

/// RAM-backed block device for host-side tests.
#[cfg(test)]
pub mod testing {
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    use super::{BlockDevice, Disk};
    use crate::config::SECTOR_SIZE;
    use crate::status::KernelError;

    pub struct RamDisk {
        data: Vec<u8>,
    }

    impl RamDisk {
        pub fn new(data: Vec<u8>) -> Self {
            Self { data }
        }
    }

    impl BlockDevice for RamDisk {
        fn read_sectors(&self, lba: u32, buf: &mut [u8]) -> Result<(), KernelError> {
            let start = lba as usize * SECTOR_SIZE;
            let end = start + buf.len();
            if end > self.data.len() {
                return Err(KernelError::Io);
            }
            buf.copy_from_slice(&self.data[start..end]);
            Ok(())
        }
    }

    /// Builds an unregistered disk over an in-memory image.
    pub fn ram_disk(image: Vec<u8>) -> Arc<Disk> {
        Arc::new(Disk::new(0, Arc::new(RamDisk::new(image))))
    }
}
