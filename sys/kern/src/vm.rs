// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Seams onto the memory-management collaborators the kernel consumes.
//!
//! The MMU page-table implementation and the physical page allocator live
//! outside this crate; the kernel only sees the trait surface below. The
//! hosted arch (and the tests) supply permissive in-memory doubles.

bitflags::bitflags! {
    /// Access attributes the kernel checks before touching user memory on a
    /// process's behalf.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct AccessRights: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Black-box handle on a process's page tables.
///
/// `map_page`, `set_user`, and `flush_tlb` are the operations the original
/// MMU layer exposes; `can_access` and `map_phys` are the queries the IPC
/// core and the MAP_PHYS operation consume.
pub trait AddressSpace: Send {
    /// Maps one page of physical memory at `vaddr`.
    fn map_page(&mut self, vaddr: usize, paddr: usize) -> bool;

    /// Installs this address space as the active user mapping.
    fn set_user(&self);

    /// Flushes stale translations after a mapping change.
    fn flush_tlb(&self);

    /// Checks whether `[base, base+len)` is mapped for the process with all
    /// of `rights`. Empty ranges are always accessible; they confer no
    /// authority.
    fn can_access(&self, base: usize, len: usize, rights: AccessRights) -> bool;

    /// Finds a free virtual range of `len` bytes, maps it to the physical
    /// range starting at `physaddr`, and returns the chosen virtual base.
    fn map_phys(&mut self, physaddr: usize, len: usize) -> Option<usize>;
}

/// One physical page of RAM, as handed out by the external page allocator.
#[derive(Debug)]
pub struct Page {
    /// Location in the flat high-memory map of all RAM. Always a multiple of
    /// `PAGE_SIZE`.
    pub base_address: usize,
}

/// Size of a physical page. Thread kernel stacks are exactly one of these.
pub const PAGE_SIZE: usize = 4096;

/// Seam onto the physical page allocator.
pub trait PageSource: Send {
    /// Provisions one page, or `None` if RAM is exhausted.
    fn alloc(&mut self) -> Option<Page>;

    /// Returns `page` to the free pool.
    fn free(&mut self, page: Page);
}
