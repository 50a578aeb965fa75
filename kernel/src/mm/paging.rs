//! # Address Space Management
//!
//! Two-level 32-bit page maps. A `PagingChunk` owns one directory and
//! its 1024 page tables; a fresh chunk identity-maps the full 4 GiB with
//! caller-supplied flags, which is how both the kernel's straight-through
//! view and each task's base address space start out.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use spin::Once;

use crate::arch;
use crate::status::KernelError;

/// Size of one page.
pub const PAGE_SIZE: usize = 4096;

/// Entries per directory and per table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Frame bits of a page table entry.
const ADDRESS_MASK: u32 = 0xFFFF_F000;

bitflags! {
    /// Page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Page is present in memory
        const PRESENT = 1 << 0;
        /// Page is writable
        const WRITEABLE = 1 << 1;
        /// Page is accessible from user mode
        const USER = 1 << 2;
        /// Writes go straight to memory
        const WRITE_THROUGH = 1 << 3;
        /// Disable caching for this page
        const CACHE_DISABLE = 1 << 4;
    }
}

/// One page-aligned table of 1024 entries, usable as a directory or a
/// leaf table.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [u32; ENTRIES_PER_TABLE],
}

fn new_table() -> Box<PageTable> {
    let layout = Layout::new::<PageTable>();
    // Box::new would stage 4 KiB on the stack first; allocate in place.
    unsafe {
        let ptr = alloc::alloc::alloc_zeroed(layout) as *mut PageTable;
        if ptr.is_null() {
            alloc::alloc::handle_alloc_error(layout);
        }
        Box::from_raw(ptr)
    }
}

fn table_phys(table: &PageTable) -> u32 {
    table as *const PageTable as usize as u32
}

/// Checks 4 KiB alignment.
pub fn is_aligned(addr: u32) -> bool {
    addr % PAGE_SIZE as u32 == 0
}

/// Rounds an address up to the next page boundary.
pub fn align_up(addr: u32) -> u32 {
    if is_aligned(addr) {
        addr
    } else {
        align_down(addr).wrapping_add(PAGE_SIZE as u32)
    }
}

/// Rounds an address down to its page boundary.
pub fn align_down(addr: u32) -> u32 {
    addr - addr % PAGE_SIZE as u32
}

/// A complete 4 GiB address space.
pub struct PagingChunk {
    directory: Box<PageTable>,
    tables: Vec<Box<PageTable>>,
}

impl PagingChunk {
    /// Builds a new address space where virtual page i maps to physical
    /// page i with the given flags. Directory entries additionally carry
    /// `WRITEABLE` so leaf flags alone decide writability.
    pub fn new(flags: PageFlags) -> Self {
        let mut directory = new_table();
        let mut tables = Vec::with_capacity(ENTRIES_PER_TABLE);
        let mut offset: u32 = 0;

        for dir_index in 0..ENTRIES_PER_TABLE {
            let mut table = new_table();
            for (map_index, entry) in table.entries.iter_mut().enumerate() {
                *entry = offset.wrapping_add((map_index * PAGE_SIZE) as u32) | flags.bits();
            }
            offset = offset.wrapping_add((ENTRIES_PER_TABLE * PAGE_SIZE) as u32);

            directory.entries[dir_index] =
                table_phys(&table) | (flags | PageFlags::WRITEABLE).bits();
            tables.push(table);
        }

        Self { directory, tables }
    }

    /// Physical address of the directory, suitable for CR3.
    pub fn directory_address(&self) -> u32 {
        table_phys(&self.directory)
    }

    fn indexes(virtual_address: u32) -> Result<(usize, usize), KernelError> {
        if !is_aligned(virtual_address) {
            return Err(KernelError::InvalidArgument);
        }
        let span = (ENTRIES_PER_TABLE * PAGE_SIZE) as u32;
        let directory_index = (virtual_address / span) as usize;
        let table_index = (virtual_address % span / PAGE_SIZE as u32) as usize;
        Ok((directory_index, table_index))
    }

    /// Writes a raw entry for an aligned virtual address.
    pub fn set(&mut self, virtual_address: u32, value: u32) -> Result<(), KernelError> {
        let (directory_index, table_index) = Self::indexes(virtual_address)?;
        self.tables[directory_index].entries[table_index] = value;
        Ok(())
    }

    /// Reads the raw entry for an aligned virtual address.
    pub fn get(&self, virtual_address: u32) -> Result<u32, KernelError> {
        let (directory_index, table_index) = Self::indexes(virtual_address)?;
        Ok(self.tables[directory_index].entries[table_index])
    }

    /// Maps one page. Both addresses must be page aligned.
    pub fn map(
        &mut self,
        virtual_address: u32,
        physical_address: u32,
        flags: PageFlags,
    ) -> Result<(), KernelError> {
        if !is_aligned(virtual_address) || !is_aligned(physical_address) {
            return Err(KernelError::InvalidArgument);
        }
        self.set(virtual_address, physical_address | flags.bits())
    }

    /// Maps `count` contiguous pages.
    pub fn map_range(
        &mut self,
        virtual_address: u32,
        physical_address: u32,
        count: usize,
        flags: PageFlags,
    ) -> Result<(), KernelError> {
        let mut virt = virtual_address;
        let mut phys = physical_address;
        for _ in 0..count {
            self.map(virt, phys, flags)?;
            virt = virt.wrapping_add(PAGE_SIZE as u32);
            phys = phys.wrapping_add(PAGE_SIZE as u32);
        }
        Ok(())
    }

    /// Maps the physical range `[begin, end)` at `virtual_address`. All
    /// three addresses must be page aligned and `end >= begin`.
    pub fn map_to(
        &mut self,
        virtual_address: u32,
        physical_begin: u32,
        physical_end: u32,
        flags: PageFlags,
    ) -> Result<(), KernelError> {
        if !is_aligned(virtual_address) || !is_aligned(physical_begin) || !is_aligned(physical_end)
        {
            return Err(KernelError::InvalidArgument);
        }
        if physical_end < physical_begin {
            return Err(KernelError::InvalidArgument);
        }
        let count = ((physical_end - physical_begin) as usize) / PAGE_SIZE;
        self.map_range(virtual_address, physical_begin, count, flags)
    }

    /// Walks the map and translates a (not necessarily aligned) virtual
    /// address to its physical counterpart.
    pub fn virtual_to_physical(&self, virtual_address: u32) -> Result<u32, KernelError> {
        let page = align_down(virtual_address);
        let offset = virtual_address - page;
        let entry = self.get(page)?;
        Ok((entry & ADDRESS_MASK).wrapping_add(offset))
    }
}

static CURRENT_DIRECTORY: AtomicU32 = AtomicU32::new(0);

/// Installs an address space.
pub fn switch(chunk: &PagingChunk) {
    switch_directory(chunk.directory_address());
}

/// Installs a directory by physical address. Used on the return path out
/// of an ISR, where the owning chunk is not borrowable.
pub fn switch_directory(directory_phys: u32) {
    arch::load_page_directory(directory_phys);
    CURRENT_DIRECTORY.store(directory_phys, Ordering::SeqCst);
}

/// The directory currently installed.
pub fn current_directory() -> u32 {
    CURRENT_DIRECTORY.load(Ordering::SeqCst)
}

static KERNEL_CHUNK: Once<PagingChunk> = Once::new();

/// Builds the kernel's identity-mapped address space, installs it, and
/// turns paging on. One-time.
pub fn init_kernel_chunk() {
    let chunk = PagingChunk::new(PageFlags::PRESENT | PageFlags::WRITEABLE | PageFlags::USER);
    let chunk = KERNEL_CHUNK.call_once(|| chunk);
    switch(chunk);
    arch::enable_paging();
    log::info!("paging enabled, kernel directory at {:#010x}", chunk.directory_address());
}

/// Reloads kernel data segments and the kernel address space.
pub fn kernel_page() {
    arch::kernel_registers();
    if let Some(chunk) = KERNEL_CHUNK.get() {
        switch(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_up(0x1000), 0x1000);
        assert_eq!(align_up(0x1001), 0x2000);
        assert_eq!(align_down(0x1FFF), 0x1000);
        assert_eq!(align_down(0x1000), 0x1000);
    }

    #[test]
    fn test_new_chunk_is_identity_mapped() {
        let chunk = PagingChunk::new(PageFlags::PRESENT | PageFlags::WRITEABLE);
        for addr in [0u32, 0x1000, 0x0040_0000, 0x7FFF_F000] {
            assert_eq!(chunk.virtual_to_physical(addr).unwrap(), addr);
        }
        // Offsets inside a page survive translation.
        assert_eq!(chunk.virtual_to_physical(0x0040_0123).unwrap(), 0x0040_0123);
    }

    #[test]
    fn test_map_rejects_misalignment() {
        let mut chunk = PagingChunk::new(PageFlags::PRESENT);
        assert_eq!(
            chunk.map(0x1001, 0x2000, PageFlags::PRESENT),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            chunk.map(0x1000, 0x2001, PageFlags::PRESENT),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            chunk.map_to(0x1000, 0x3000, 0x2000, PageFlags::PRESENT),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn test_map_to_translates_whole_range() {
        let mut chunk = PagingChunk::new(PageFlags::PRESENT | PageFlags::USER);
        chunk
            .map_to(
                0x0040_0000,
                0x0100_0000,
                0x0100_4000,
                PageFlags::PRESENT | PageFlags::USER,
            )
            .unwrap();

        for k in [0u32, 0x1, 0xFFF, 0x1000, 0x3FFF] {
            assert_eq!(
                chunk.virtual_to_physical(0x0040_0000 + k).unwrap(),
                0x0100_0000 + k
            );
        }
        // One page past the range still holds the identity mapping.
        assert_eq!(chunk.virtual_to_physical(0x0040_4000).unwrap(), 0x0040_4000);
    }

    #[test]
    fn test_switch_records_directory() {
        let _guard = crate::test_sync::LOCK.lock();
        let chunk = PagingChunk::new(PageFlags::PRESENT);
        switch(&chunk);
        assert_eq!(current_directory(), chunk.directory_address());
    }
}
