//! # FAT16 Filesystem (read-only)
//!
//! Resolve parses the BPB and caches the root directory; reads walk the
//! FAT cluster chain. Each mounted instance keeps three dedicated
//! streams (FAT, cluster data, directory data) so nested reads do not
//! clobber each other's position.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::mem::size_of;

use bitflags::bitflags;
use spin::Mutex;

use crate::disk::{Disk, DiskStream};
use crate::fs::{
    FileHandle, FileMode, FileStat, FileStatFlags, Filesystem, FilesystemDriver, SeekMode,
};
use crate::status::KernelError;

/// Extended BPB signature identifying FAT16.
pub const FAT16_SIGNATURE: u8 = 0x29;

/// Size of one FAT entry in bytes.
const FAT_ENTRY_SIZE: usize = 2;

/// Size of one on-disk directory entry.
const DIRECTORY_ITEM_SIZE: usize = 32;

/// First byte of a free (deleted) directory entry.
const ENTRY_FREE: u8 = 0xE5;

bitflags! {
    /// Directory entry attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FatAttributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_LABEL = 0x08;
        const SUBDIRECTORY = 0x10;
        const ARCHIVED = 0x20;
        const DEVICE = 0x40;
        const RESERVED = 0x80;
    }
}

/// The BIOS parameter block.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct FatHeader {
    pub short_jmp: [u8; 3],
    pub oem_identifier: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_copies: u8,
    pub root_dir_entries: u16,
    pub number_of_sectors: u16,
    pub media_type: u8,
    pub sectors_per_fat: u16,
    pub sectors_per_track: u16,
    pub number_of_heads: u16,
    pub hidden_sectors: u32,
    pub sectors_big: u32,
}

/// The extended BPB.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct FatHeaderExtended {
    pub drive_number: u8,
    pub win_nt_bit: u8,
    pub signature: u8,
    pub volume_id: u32,
    pub volume_id_string: [u8; 11],
    pub system_id_string: [u8; 8],
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct FatH {
    primary: FatHeader,
    extended: FatHeaderExtended,
}

/// One 8.3 directory entry.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct FatDirectoryItem {
    pub filename: [u8; 8],
    pub ext: [u8; 3],
    pub attributes: u8,
    pub reserved: u8,
    pub creation_time_tenths: u8,
    pub creation_time: u16,
    pub creation_date: u16,
    pub last_access: u16,
    pub cluster_high: u16,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    pub cluster_low: u16,
    pub filesize: u32,
}

impl FatDirectoryItem {
    /// First cluster of the entry's data.
    pub fn first_cluster(&self) -> u32 {
        ((self.cluster_high as u32) << 16) | self.cluster_low as u32
    }

    /// Whether the subdirectory attribute bit is set.
    pub fn is_directory(&self) -> bool {
        self.attributes & FatAttributes::SUBDIRECTORY.bits() != 0
    }

    /// Reconstructs `NAME.EXT` from the raw 8+3 form, trimming the
    /// space padding.
    pub fn full_name(&self) -> String {
        let mut name = String::new();
        for &byte in self.filename.iter() {
            if byte == 0x00 || byte == b' ' {
                break;
            }
            name.push(byte as char);
        }
        if self.ext[0] != 0x00 && self.ext[0] != b' ' {
            name.push('.');
            for &byte in self.ext.iter() {
                if byte == 0x00 || byte == b' ' {
                    break;
                }
                name.push(byte as char);
            }
        }
        name
    }
}

fn read_directory_item(raw: &[u8]) -> FatDirectoryItem {
    unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const FatDirectoryItem) }
}

/// A loaded directory listing.
pub struct FatDirectory {
    items: Vec<FatDirectoryItem>,
    #[allow(dead_code)]
    start_sector: u32,
    end_sector: u32,
}

/// What a path resolved to.
enum FatItem {
    File(FatDirectoryItem),
    Directory(FatDirectory),
}

/// The FAT16 driver registered with the dispatch layer.
pub struct Fat16Driver;

impl FilesystemDriver for Fat16Driver {
    fn name(&self) -> &'static str {
        "FAT16"
    }

    fn resolve(&self, disk: &Arc<Disk>) -> Result<Arc<dyn Filesystem>, KernelError> {
        let mut stream = DiskStream::new(disk.clone());
        let mut raw = [0u8; size_of::<FatH>()];
        stream.read(&mut raw).map_err(|_| KernelError::Io)?;

        let header: FatH = unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const FatH) };
        if header.extended.signature != FAT16_SIGNATURE {
            return Err(KernelError::FsNotUs);
        }

        let fs = Fat16Fs::mount(disk.clone(), header.primary)?;
        let root_items = fs.root_directory.items.len();
        log::info!("fat16: mounted disk {} ({} root entries)", disk.id, root_items);
        Ok(Arc::new(fs))
    }
}

/// A FAT16 instance bound to one disk.
pub struct Fat16Fs {
    disk: Arc<Disk>,
    header: FatHeader,
    root_directory: FatDirectory,
    cluster_stream: Mutex<DiskStream>,
    fat_stream: Mutex<DiskStream>,
    directory_stream: Mutex<DiskStream>,
}

impl Fat16Fs {
    fn mount(disk: Arc<Disk>, header: FatHeader) -> Result<Self, KernelError> {
        let root_directory = Self::load_root_directory(&disk, &header)?;
        Ok(Self {
            cluster_stream: Mutex::new(DiskStream::new(disk.clone())),
            fat_stream: Mutex::new(DiskStream::new(disk.clone())),
            directory_stream: Mutex::new(DiskStream::new(disk.clone())),
            disk,
            header,
            root_directory,
        })
    }

    fn load_root_directory(disk: &Arc<Disk>, header: &FatHeader) -> Result<FatDirectory, KernelError> {
        let sector_size = disk.sector_size;
        let fat_copies = header.fat_copies as u32;
        let sectors_per_fat = header.sectors_per_fat as u32;
        let reserved_sectors = header.reserved_sectors as u32;
        let root_dir_entries = header.root_dir_entries as usize;

        let start_sector = fat_copies * sectors_per_fat + reserved_sectors;
        let root_dir_size = root_dir_entries * DIRECTORY_ITEM_SIZE;

        let mut raw = vec![0u8; root_dir_size];
        let mut stream = DiskStream::new(disk.clone());
        stream.seek(start_sector as usize * sector_size);
        stream.read(&mut raw).map_err(|_| KernelError::Io)?;

        Ok(FatDirectory {
            items: parse_directory_items(&raw),
            start_sector,
            end_sector: start_sector + (root_dir_size / sector_size) as u32,
        })
    }

    fn cluster_bytes(&self) -> usize {
        self.header.sectors_per_cluster as usize * self.disk.sector_size
    }

    fn cluster_to_sector(&self, cluster: u32) -> u32 {
        self.root_directory.end_sector
            + (cluster - 2) * self.header.sectors_per_cluster as u32
    }

    /// Reads one FAT entry.
    fn fat_entry(&self, cluster: u32) -> Result<u16, KernelError> {
        let fat_start = self.header.reserved_sectors as usize * self.disk.sector_size;
        let mut stream = self.fat_stream.lock();
        stream.seek(fat_start + cluster as usize * FAT_ENTRY_SIZE);
        let mut raw = [0u8; FAT_ENTRY_SIZE];
        stream.read(&mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    /// Follows the chain from `starting_cluster` until the cluster that
    /// holds byte `offset`.
    fn cluster_for_offset(
        &self,
        starting_cluster: u32,
        offset: usize,
    ) -> Result<u32, KernelError> {
        let clusters_ahead = offset / self.cluster_bytes();
        let mut cluster = starting_cluster;
        for _ in 0..clusters_ahead {
            let entry = self.fat_entry(cluster)?;
            match entry {
                // End-of-chain, reserved, and bad-sector markers all end
                // the walk; asking for bytes past them is an I/O error.
                0x0000 | 0x0FF0 | 0x0FF6 | 0x0FF7 | 0x0FF8 | 0x0FFF => {
                    return Err(KernelError::Io)
                }
                next => cluster = next as u32,
            }
        }
        Ok(cluster)
    }

    /// Reads `out.len()` bytes of a cluster chain starting `offset`
    /// bytes into it, at most one cluster per step.
    fn read_internal(
        &self,
        stream: &mut DiskStream,
        starting_cluster: u32,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), KernelError> {
        if out.is_empty() {
            return Ok(());
        }

        let cluster_bytes = self.cluster_bytes();
        let cluster = self.cluster_for_offset(starting_cluster, offset)?;
        let offset_in_cluster = offset % cluster_bytes;
        let start_sector = self.cluster_to_sector(cluster);
        let position = start_sector as usize * self.disk.sector_size + offset_in_cluster;
        let take = out.len().min(cluster_bytes - offset_in_cluster);

        stream.seek(position);
        stream.read(&mut out[..take])?;

        if out.len() > take {
            return self.read_internal(stream, starting_cluster, offset + take, &mut out[take..]);
        }
        Ok(())
    }

    fn read_from_cluster(
        &self,
        starting_cluster: u32,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), KernelError> {
        let mut stream = self.cluster_stream.lock();
        self.read_internal(&mut stream, starting_cluster, offset, out)
    }

    /// Loads a subdirectory by streaming its cluster chain entry by
    /// entry until the terminator.
    fn load_directory(&self, item: &FatDirectoryItem) -> Result<FatDirectory, KernelError> {
        if !item.is_directory() {
            return Err(KernelError::InvalidArgument);
        }

        let cluster = item.first_cluster();
        let mut items = Vec::new();
        let mut offset = 0usize;
        let mut stream = self.directory_stream.lock();

        loop {
            let mut raw = [0u8; DIRECTORY_ITEM_SIZE];
            self.read_internal(&mut stream, cluster, offset, &mut raw)?;
            offset += DIRECTORY_ITEM_SIZE;

            if raw[0] == 0x00 {
                break;
            }
            if raw[0] == ENTRY_FREE {
                continue;
            }
            items.push(read_directory_item(&raw));
        }

        let start_sector = self.cluster_to_sector(cluster);
        let used = offset / self.disk.sector_size;
        Ok(FatDirectory {
            items,
            start_sector,
            end_sector: start_sector + used as u32,
        })
    }

    /// Case-insensitive lookup of one component in a directory.
    fn find_item_in_directory(
        &self,
        directory: &FatDirectory,
        name: &str,
    ) -> Result<Option<FatItem>, KernelError> {
        for item in directory.items.iter() {
            if item.full_name().eq_ignore_ascii_case(name) {
                let found = if item.is_directory() {
                    FatItem::Directory(self.load_directory(item)?)
                } else {
                    FatItem::File(*item)
                };
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    /// Resolves a full component chain from the root.
    fn get_directory_entry(&self, parts: &[String]) -> Result<FatItem, KernelError> {
        let mut current = self
            .find_item_in_directory(&self.root_directory, &parts[0])?
            .ok_or(KernelError::Io)?;

        for part in parts[1..].iter() {
            let directory = match &current {
                FatItem::Directory(directory) => directory,
                // Descending through a file.
                FatItem::File(_) => return Err(KernelError::Io),
            };
            current = self
                .find_item_in_directory(directory, part)?
                .ok_or(KernelError::Io)?;
        }

        Ok(current)
    }
}

impl Filesystem for Fat16Fs {
    fn name(&self) -> &'static str {
        "FAT16"
    }

    fn open(
        self: Arc<Self>,
        parts: &[String],
        mode: FileMode,
    ) -> Result<Box<dyn FileHandle>, KernelError> {
        if mode != FileMode::Read {
            return Err(KernelError::ReadOnly);
        }
        if parts.is_empty() {
            return Err(KernelError::InvalidArgument);
        }

        let item = self.get_directory_entry(parts)?;
        Ok(Box::new(Fat16File {
            fs: self,
            item,
            pos: 0,
        }))
    }
}

/// An open FAT16 file or directory.
struct Fat16File {
    fs: Arc<Fat16Fs>,
    item: FatItem,
    pos: u32,
}

impl Fat16File {
    fn file_item(&self) -> Result<&FatDirectoryItem, KernelError> {
        match &self.item {
            FatItem::File(item) => Ok(item),
            FatItem::Directory(_) => Err(KernelError::InvalidArgument),
        }
    }
}

impl FileHandle for Fat16File {
    fn read(&mut self, size: usize, nmemb: usize, out: &mut [u8]) -> Result<usize, KernelError> {
        let item = *self.file_item()?;
        let cluster = item.first_cluster();

        let mut offset = self.pos as usize;
        for index in 0..nmemb {
            let record = &mut out[index * size..(index + 1) * size];
            self.fs.read_from_cluster(cluster, offset, record)?;
            offset += size;
        }
        self.pos = offset as u32;

        Ok(nmemb)
    }

    fn seek(&mut self, offset: u32, whence: SeekMode) -> Result<(), KernelError> {
        let item = self.file_item()?;
        let filesize = item.filesize;
        if offset >= filesize {
            return Err(KernelError::Io);
        }
        match whence {
            SeekMode::Set => self.pos = offset,
            SeekMode::Cur => self.pos += offset,
            SeekMode::End => return Err(KernelError::Unimplemented),
        }
        Ok(())
    }

    fn stat(&self) -> Result<FileStat, KernelError> {
        let item = self.file_item()?;
        let mut flags = FileStatFlags::empty();
        if item.attributes & FatAttributes::READ_ONLY.bits() != 0 {
            flags |= FileStatFlags::READ_ONLY;
        }
        Ok(FileStat {
            filesize: item.filesize,
            flags,
        })
    }
}

fn parse_directory_items(raw: &[u8]) -> Vec<FatDirectoryItem> {
    let mut items = Vec::new();
    for chunk in raw.chunks_exact(DIRECTORY_ITEM_SIZE) {
        if chunk[0] == 0x00 {
            break;
        }
        if chunk[0] == ENTRY_FREE {
            continue;
        }
        items.push(read_directory_item(chunk));
    }
    items
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::SECTOR_SIZE;
    use crate::disk::testing::ram_disk;
    use alloc::string::ToString;

    // Test image geometry: 512-byte sectors, 1 sector per cluster,
    // 1 reserved sector, 2 FATs of 20 sectors, 512 root entries.
    // Root directory: sectors 41..73; cluster 2 begins at sector 73.
    const RESERVED: usize = 1;
    const FAT_COPIES: usize = 2;
    const SECTORS_PER_FAT: usize = 20;
    const ROOT_ENTRIES: usize = 512;
    const ROOT_START: usize = RESERVED + FAT_COPIES * SECTORS_PER_FAT;
    const DATA_START: usize = ROOT_START + ROOT_ENTRIES * 32 / SECTOR_SIZE;
    const IMAGE_SECTORS: usize = DATA_START + 32;

    pub(crate) struct ImageBuilder {
        image: Vec<u8>,
        root_used: usize,
    }

    impl ImageBuilder {
        pub(crate) fn new() -> Self {
            let mut image = vec![0u8; IMAGE_SECTORS * SECTOR_SIZE];
            image[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
            image[13] = 1; // sectors per cluster
            image[14..16].copy_from_slice(&(RESERVED as u16).to_le_bytes());
            image[16] = FAT_COPIES as u8;
            image[17..19].copy_from_slice(&(ROOT_ENTRIES as u16).to_le_bytes());
            image[22..24].copy_from_slice(&(SECTORS_PER_FAT as u16).to_le_bytes());
            image[38] = FAT16_SIGNATURE;
            Self {
                image,
                root_used: 0,
            }
        }

        fn write_entry(&mut self, at: usize, name: &[u8; 11], attr: u8, cluster: u16, size: u32) {
            let entry = &mut self.image[at..at + 32];
            entry[..11].copy_from_slice(name);
            entry[11] = attr;
            entry[26..28].copy_from_slice(&cluster.to_le_bytes());
            entry[28..32].copy_from_slice(&size.to_le_bytes());
        }

        pub(crate) fn root_entry(&mut self, name: &[u8; 11], attr: u8, cluster: u16, size: u32) {
            let at = ROOT_START * SECTOR_SIZE + self.root_used * 32;
            self.root_used += 1;
            self.write_entry(at, name, attr, cluster, size);
        }

        pub(crate) fn dir_entry(
            &mut self,
            dir_cluster: u16,
            index: usize,
            name: &[u8; 11],
            attr: u8,
            cluster: u16,
            size: u32,
        ) {
            let at = (DATA_START + dir_cluster as usize - 2) * SECTOR_SIZE + index * 32;
            self.write_entry(at, name, attr, cluster, size);
        }

        pub(crate) fn fat(&mut self, cluster: u16, value: u16) {
            let at = RESERVED * SECTOR_SIZE + cluster as usize * 2;
            self.image[at..at + 2].copy_from_slice(&value.to_le_bytes());
        }

        pub(crate) fn data(&mut self, cluster: u16, bytes: &[u8]) {
            let at = (DATA_START + cluster as usize - 2) * SECTOR_SIZE;
            self.image[at..at + bytes.len()].copy_from_slice(bytes);
        }

        pub(crate) fn build(self) -> Vec<u8> {
            self.image
        }
    }

    pub(crate) fn mount(image: Vec<u8>) -> Arc<dyn Filesystem> {
        let disk = ram_disk(image);
        Fat16Driver.resolve(&disk).expect("mount")
    }

    fn parts(path: &[&str]) -> Vec<String> {
        path.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_resolve_rejects_wrong_signature() {
        let mut builder = ImageBuilder::new();
        builder.image[38] = 0x28;
        let disk = ram_disk(builder.build());
        assert_eq!(
            Fat16Driver.resolve(&disk).err(),
            Some(KernelError::FsNotUs)
        );
    }

    #[test]
    fn test_open_stat_read_small_file() {
        let mut builder = ImageBuilder::new();
        let body: Vec<u8> = (0..137u32).map(|i| (i * 7 % 256) as u8).collect();
        builder.root_entry(b"HELLO   ELF", 0x20, 3, 137);
        builder.data(3, &body);
        let fs = mount(builder.build());

        let mut handle = fs.open(&parts(&["HELLO.ELF"]), FileMode::Read).unwrap();
        let stat = handle.stat().unwrap();
        assert_eq!(stat.filesize, 137);
        assert!(!stat.flags.contains(FileStatFlags::READ_ONLY));

        let mut out = vec![0u8; 137];
        assert_eq!(handle.read(137, 1, &mut out).unwrap(), 1);
        assert_eq!(out, body);
    }

    #[test]
    fn test_read_across_cluster_chain() {
        let mut builder = ImageBuilder::new();
        let body: Vec<u8> = (0..600u32).map(|i| (i % 253) as u8).collect();
        builder.root_entry(b"BIG     BIN", 0x20, 4, 600);
        builder.data(4, &body[..512]);
        builder.data(5, &body[512..]);
        builder.fat(4, 5);
        builder.fat(5, 0x0FFF);
        let fs = mount(builder.build());

        let mut whole = vec![0u8; 600];
        let mut handle = fs.clone().open(&parts(&["BIG.BIN"]), FileMode::Read).unwrap();
        handle.read(600, 1, &mut whole).unwrap();
        assert_eq!(whole, body);

        // Two partial reads concatenate to the same bytes.
        let mut first = vec![0u8; 400];
        let mut second = vec![0u8; 200];
        let mut handle = fs.open(&parts(&["BIG.BIN"]), FileMode::Read).unwrap();
        handle.read(400, 1, &mut first).unwrap();
        handle.read(200, 1, &mut second).unwrap();
        first.extend_from_slice(&second);
        assert_eq!(first, body);
    }

    #[test]
    fn test_chain_end_is_io_error() {
        let mut builder = ImageBuilder::new();
        builder.root_entry(b"SHORT   TXT", 0x20, 3, 100);
        builder.fat(3, 0x0FF8);
        let fs = mount(builder.build());

        let mut handle = fs.open(&parts(&["SHORT.TXT"]), FileMode::Read).unwrap();
        // Asking past the single cluster must fail when the chain ends.
        let mut out = vec![0u8; 600];
        assert_eq!(handle.read(600, 1, &mut out), Err(KernelError::Io));
    }

    #[test]
    fn test_seek_semantics() {
        let mut builder = ImageBuilder::new();
        let body: Vec<u8> = (0..137u32).map(|i| i as u8).collect();
        builder.root_entry(b"HELLO   ELF", 0x20, 3, 137);
        builder.data(3, &body);
        let fs = mount(builder.build());
        let mut handle = fs.open(&parts(&["HELLO.ELF"]), FileMode::Read).unwrap();

        assert_eq!(handle.seek(137, SeekMode::Set), Err(KernelError::Io));
        assert_eq!(handle.seek(0, SeekMode::End), Err(KernelError::Unimplemented));

        handle.seek(100, SeekMode::Set).unwrap();
        handle.seek(10, SeekMode::Cur).unwrap();
        let mut out = [0u8; 4];
        handle.read(4, 1, &mut out).unwrap();
        assert_eq!(out, [110, 111, 112, 113]);
    }

    #[test]
    fn test_subdirectory_resolution() {
        let mut builder = ImageBuilder::new();
        builder.root_entry(b"BIN        ", 0x10, 2, 0);
        builder.dir_entry(2, 0, b"HELLO   TXT", 0x01, 6, 5);
        builder.data(6, b"hello");
        let fs = mount(builder.build());

        let mut handle = fs
            .open(&parts(&["bin", "hello.txt"]), FileMode::Read)
            .unwrap();
        let stat = handle.stat().unwrap();
        assert_eq!(stat.filesize, 5);
        assert!(stat.flags.contains(FileStatFlags::READ_ONLY));

        let mut out = [0u8; 5];
        handle.read(5, 1, &mut out).unwrap();
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn test_descending_through_a_file_fails() {
        let mut builder = ImageBuilder::new();
        builder.root_entry(b"HELLO   ELF", 0x20, 3, 137);
        let fs = mount(builder.build());
        assert!(fs
            .open(&parts(&["HELLO.ELF", "inner"]), FileMode::Read)
            .is_err());
    }

    #[test]
    fn test_write_modes_are_rejected() {
        let mut builder = ImageBuilder::new();
        builder.root_entry(b"HELLO   ELF", 0x20, 3, 137);
        let fs = mount(builder.build());
        let err = fs
            .open(&parts(&["HELLO.ELF"]), FileMode::Write)
            .err()
            .unwrap();
        assert_eq!(err, KernelError::ReadOnly);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let builder = ImageBuilder::new();
        let fs = mount(builder.build());
        let err = fs.open(&parts(&["NOPE.TXT"]), FileMode::Read).err().unwrap();
        assert_eq!(err, KernelError::Io);
    }
}
