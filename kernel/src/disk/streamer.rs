//! # Disk Stream
//!
//! Byte-addressable reads on top of sector-granular disks. A stream is a
//! disk plus a byte position; reads pull one sector at a time through a
//! stack scratch buffer and recurse across sector boundaries.

use alloc::sync::Arc;

use crate::config::SECTOR_SIZE;
use crate::status::KernelError;

use super::Disk;

/// A byte-position cursor over a disk.
pub struct DiskStream {
    disk: Arc<Disk>,
    position: usize,
}

impl DiskStream {
    /// Opens a stream at position 0 over the given disk.
    pub fn new(disk: Arc<Disk>) -> Self {
        Self { disk, position: 0 }
    }

    /// Opens a stream over a disk by id.
    pub fn open(disk_id: u32) -> Option<Self> {
        crate::disk::get(disk_id).map(Self::new)
    }

    /// Sets the absolute byte position.
    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }

    /// Current byte position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Reads exactly `out.len()` bytes from the current position,
    /// crossing sector boundaries as needed.
    pub fn read(&mut self, out: &mut [u8]) -> Result<(), KernelError> {
        if out.is_empty() {
            return Ok(());
        }

        let sector = (self.position / SECTOR_SIZE) as u32;
        let offset = self.position % SECTOR_SIZE;
        let take = out.len().min(SECTOR_SIZE - offset);

        let mut scratch = [0u8; SECTOR_SIZE];
        self.disk.read_block(sector, 1, &mut scratch)?;
        out[..take].copy_from_slice(&scratch[offset..offset + take]);
        self.position += take;

        if out.len() > take {
            return self.read(&mut out[take..]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::testing::ram_disk;
    use alloc::vec;

    fn patterned_image(sectors: usize) -> vec::Vec<u8> {
        (0..sectors * SECTOR_SIZE).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_read_within_one_sector() {
        let image = patterned_image(4);
        let disk = ram_disk(image.clone());
        let mut stream = DiskStream::new(disk);

        stream.seek(100);
        let mut out = [0u8; 32];
        stream.read(&mut out).unwrap();
        assert_eq!(&out[..], &image[100..132]);
        assert_eq!(stream.position(), 132);
    }

    #[test]
    fn test_read_across_sector_boundary() {
        let image = patterned_image(4);
        let disk = ram_disk(image.clone());
        let mut stream = DiskStream::new(disk);

        stream.seek(SECTOR_SIZE - 10);
        let mut out = [0u8; 300];
        stream.read(&mut out).unwrap();
        assert_eq!(&out[..], &image[SECTOR_SIZE - 10..SECTOR_SIZE - 10 + 300]);
    }

    #[test]
    fn test_read_past_end_is_io_error() {
        let disk = ram_disk(patterned_image(2));
        let mut stream = DiskStream::new(disk);
        stream.seek(2 * SECTOR_SIZE);
        let mut out = [0u8; 8];
        assert_eq!(stream.read(&mut out), Err(KernelError::Io));
    }
}
