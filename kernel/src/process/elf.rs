//! # ELF32 Program Loader
//!
//! Validates ELF32 executables and stages the raw file image in a
//! kernel buffer. Only PT_LOAD segments matter to the kernel; mapping
//! them into a task's address space happens in the process loader.
//!
//! Accepted files are little-endian `ET_EXEC` images whose entry point
//! sits at or above the user program base; everything else is an
//! `InvalidFormat`, which is what lets the process loader fall back to
//! flat binaries.

use alloc::vec::Vec;
use core::mem::size_of;

use crate::config::PROGRAM_VIRTUAL_ADDRESS;
use crate::fs;
use crate::mm::PageBuffer;
use crate::status::KernelError;

/// The four magic bytes.
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// e_ident index of the class byte.
pub const EI_CLASS: usize = 4;

/// e_ident index of the data-encoding byte.
pub const EI_DATA: usize = 5;

pub const ELFCLASSNONE: u8 = 0;
pub const ELFCLASS32: u8 = 1;

pub const ELFDATANONE: u8 = 0;
pub const ELFDATA2LSB: u8 = 1;

/// Executable file type.
pub const ET_EXEC: u16 = 2;

/// Loadable program header type.
pub const PT_LOAD: u32 = 1;

/// Segment flag: executable.
pub const PF_X: u32 = 1;

/// Segment flag: writable.
pub const PF_W: u32 = 2;

/// Segment flag: readable.
pub const PF_R: u32 = 4;

/// ELF32 file header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf32Header {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// ELF32 program header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf32Phdr {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

/// A validated ELF image staged in kernel memory.
pub struct ElfFile {
    memory: PageBuffer,
    virtual_base: u32,
    virtual_end: u32,
    physical_base_offset: u32,
    physical_end_offset: u32,
}

impl ElfFile {
    /// Opens, reads and validates an executable through the filesystem
    /// dispatch layer.
    pub fn load(path: &str) -> Result<Self, KernelError> {
        let fd = fs::fopen(path, "r");
        if fd == 0 {
            return Err(KernelError::Io);
        }

        let result = (|| {
            let stat = fs::fstat(fd)?;
            let size = stat.filesize as usize;
            let mut memory = PageBuffer::zeroed(size).ok_or(KernelError::NoMemory)?;
            fs::fread(memory.as_mut_slice(), size, 1, fd)?;
            Self::from_buffer(memory)
        })();

        let _ = fs::fclose(fd);
        result
    }

    /// Validates raw bytes already staged in a page buffer.
    pub fn from_buffer(memory: PageBuffer) -> Result<Self, KernelError> {
        let header = parse_header(memory.as_slice())?;
        validate(&header)?;

        let mut file = Self {
            memory,
            virtual_base: 0,
            virtual_end: 0,
            physical_base_offset: 0,
            physical_end_offset: 0,
        };

        for phdr in file.program_headers()? {
            if phdr.p_type != PT_LOAD {
                continue;
            }
            if phdr.p_offset.wrapping_add(phdr.p_filesz) as usize > file.memory.len() {
                return Err(KernelError::InvalidFormat);
            }

            if file.virtual_base == 0 || phdr.p_vaddr < file.virtual_base {
                file.virtual_base = phdr.p_vaddr;
                file.physical_base_offset = phdr.p_offset;
            }
            let segment_end = phdr.p_vaddr.wrapping_add(phdr.p_filesz);
            if segment_end > file.virtual_end {
                file.virtual_end = segment_end;
                file.physical_end_offset = phdr.p_offset.wrapping_add(phdr.p_filesz);
            }
        }

        Ok(file)
    }

    /// Copies bytes into a fresh buffer and validates them.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KernelError> {
        let mut memory = PageBuffer::zeroed(bytes.len()).ok_or(KernelError::NoMemory)?;
        memory.as_mut_slice().copy_from_slice(bytes);
        Self::from_buffer(memory)
    }

    /// The file header.
    pub fn header(&self) -> Elf32Header {
        unsafe { core::ptr::read_unaligned(self.memory.as_slice().as_ptr() as *const Elf32Header) }
    }

    /// All program headers, bounds checked against the file.
    pub fn program_headers(&self) -> Result<Vec<Elf32Phdr>, KernelError> {
        let header = self.header();
        let phoff = header.e_phoff as usize;
        let phnum = header.e_phnum as usize;
        let entry_size = size_of::<Elf32Phdr>();

        if phoff + phnum * entry_size > self.memory.len() {
            return Err(KernelError::InvalidFormat);
        }

        let mut headers = Vec::with_capacity(phnum);
        for index in 0..phnum {
            let at = phoff + index * entry_size;
            let phdr = unsafe {
                core::ptr::read_unaligned(
                    self.memory.as_slice()[at..].as_ptr() as *const Elf32Phdr
                )
            };
            headers.push(phdr);
        }
        Ok(headers)
    }

    /// Program entry point.
    pub fn entry(&self) -> u32 {
        self.header().e_entry
    }

    /// Lowest PT_LOAD virtual address.
    pub fn virtual_base(&self) -> u32 {
        self.virtual_base
    }

    /// One past the highest PT_LOAD virtual byte.
    pub fn virtual_end(&self) -> u32 {
        self.virtual_end
    }

    /// Physical address backing `virtual_base`.
    pub fn physical_base(&self) -> u32 {
        self.memory.phys().wrapping_add(self.physical_base_offset)
    }

    /// Physical address backing `virtual_end`.
    pub fn physical_end(&self) -> u32 {
        self.memory.phys().wrapping_add(self.physical_end_offset)
    }

    /// Physical address of a program header's file bytes.
    pub fn phdr_physical_address(&self, phdr: &Elf32Phdr) -> u32 {
        self.memory.phys().wrapping_add(phdr.p_offset)
    }

    /// Size of the staged file.
    pub fn size(&self) -> usize {
        self.memory.len()
    }
}

fn parse_header(bytes: &[u8]) -> Result<Elf32Header, KernelError> {
    if bytes.len() < size_of::<Elf32Header>() {
        return Err(KernelError::InvalidFormat);
    }
    Ok(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Elf32Header) })
}

fn validate(header: &Elf32Header) -> Result<(), KernelError> {
    if header.e_ident[..4] != ELF_MAGIC {
        return Err(KernelError::InvalidFormat);
    }
    if header.e_ident[EI_CLASS] != ELFCLASSNONE && header.e_ident[EI_CLASS] != ELFCLASS32 {
        return Err(KernelError::InvalidFormat);
    }
    if header.e_ident[EI_DATA] != ELFDATANONE && header.e_ident[EI_DATA] != ELFDATA2LSB {
        return Err(KernelError::InvalidFormat);
    }
    if header.e_phoff == 0 {
        return Err(KernelError::InvalidFormat);
    }
    if header.e_type != ET_EXEC || header.e_entry < PROGRAM_VIRTUAL_ADDRESS {
        return Err(KernelError::InvalidFormat);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use alloc::vec;

    /// Builds a minimal ELF32 image with one PT_LOAD segment whose
    /// contents are `body`.
    pub(crate) fn build_elf(e_type: u16, entry: u32, vaddr: u32, body: &[u8]) -> Vec<u8> {
        let header_size = size_of::<Elf32Header>();
        let phdr_size = size_of::<Elf32Phdr>();
        let body_offset = header_size + phdr_size;
        let mut image = vec![0u8; body_offset + body.len()];

        image[..4].copy_from_slice(&ELF_MAGIC);
        image[EI_CLASS] = ELFCLASS32;
        image[EI_DATA] = ELFDATA2LSB;
        image[16..18].copy_from_slice(&e_type.to_le_bytes());
        image[18..20].copy_from_slice(&3u16.to_le_bytes()); // EM_386
        image[24..28].copy_from_slice(&entry.to_le_bytes());
        image[28..32].copy_from_slice(&(header_size as u32).to_le_bytes()); // e_phoff
        image[42..44].copy_from_slice(&(phdr_size as u16).to_le_bytes());
        image[44..46].copy_from_slice(&1u16.to_le_bytes()); // e_phnum

        let phdr = header_size;
        image[phdr..phdr + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        image[phdr + 4..phdr + 8].copy_from_slice(&(body_offset as u32).to_le_bytes());
        image[phdr + 8..phdr + 12].copy_from_slice(&vaddr.to_le_bytes());
        image[phdr + 16..phdr + 20].copy_from_slice(&(body.len() as u32).to_le_bytes());
        image[phdr + 20..phdr + 24].copy_from_slice(&(body.len() as u32).to_le_bytes());
        image[phdr + 24..phdr + 28].copy_from_slice(&(PF_R | PF_X).to_le_bytes());

        image[body_offset..].copy_from_slice(body);
        image
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut image = build_elf(ET_EXEC, 0x0040_0000, 0x0040_0000, b"code");
        image[0] = 0x7E;
        assert_eq!(ElfFile::from_bytes(&image).err(), Some(KernelError::InvalidFormat));
    }

    #[test]
    fn test_rejects_relocatable_files() {
        let image = build_elf(1, 0x0040_0000, 0x0040_0000, b"code");
        assert_eq!(ElfFile::from_bytes(&image).err(), Some(KernelError::InvalidFormat));
    }

    #[test]
    fn test_rejects_low_entry_point() {
        let image = build_elf(ET_EXEC, 0x0010_0000, 0x0010_0000, b"code");
        assert_eq!(ElfFile::from_bytes(&image).err(), Some(KernelError::InvalidFormat));
    }

    #[test]
    fn test_rejects_missing_program_headers() {
        let mut image = build_elf(ET_EXEC, 0x0040_0000, 0x0040_0000, b"code");
        image[28..32].copy_from_slice(&0u32.to_le_bytes());
        assert_eq!(ElfFile::from_bytes(&image).err(), Some(KernelError::InvalidFormat));
    }

    #[test]
    fn test_accepts_minimal_executable() {
        let body = b"\x90\x90\x90\x90";
        let image = build_elf(ET_EXEC, 0x0040_0000, 0x0040_0000, body);
        let elf = ElfFile::from_bytes(&image).unwrap();

        assert_eq!(elf.entry(), 0x0040_0000);
        assert_eq!(elf.virtual_base(), 0x0040_0000);
        assert_eq!(elf.virtual_end(), 0x0040_0000 + body.len() as u32);

        let headers = elf.program_headers().unwrap();
        assert_eq!(headers.len(), 1);
        let phdr = headers[0];
        assert_eq!(phdr.p_type, PT_LOAD);
        assert_eq!(
            elf.physical_base(),
            elf.phdr_physical_address(&phdr)
        );
    }

    #[test]
    fn test_rejects_truncated_segment() {
        let mut image = build_elf(ET_EXEC, 0x0040_0000, 0x0040_0000, b"code");
        // Claim more file bytes than exist.
        let phdr = size_of::<Elf32Header>();
        image[phdr + 16..phdr + 20].copy_from_slice(&0x1000u32.to_le_bytes());
        assert_eq!(ElfFile::from_bytes(&image).err(), Some(KernelError::InvalidFormat));
    }
}
