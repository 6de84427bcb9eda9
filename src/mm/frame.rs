//! Interfaces to the physical frame allocator and to physical memory.
//!
//! The page table tree never holds references to its children. Every
//! descriptor stores a physical address and the tree is resolved through a
//! [`FrameStore`], which owns the translation from physical address to
//! memory for whatever addressing mode is currently active.

use crate::arch::mm::paging::PageTable;
use crate::mm::addr::PhysAddr;
use crate::mm::error::MmuError;

/// Source of zeroed, page aligned physical frames.
pub trait FrameAllocator {
	/// Returns a zeroed 4 KiB frame or [`MmuError::AllocationExhausted`].
	fn alloc_frame(&mut self) -> Result<PhysAddr, MmuError>;

	/// Returns a frame obtained from [`FrameAllocator::alloc_frame`].
	fn free_frame(&mut self, frame: PhysAddr);
}

/// Access to the contents of physical memory.
pub trait PhysMemory {
	/// The translation table stored in `frame`.
	fn table(&self, frame: PhysAddr) -> &PageTable;

	fn table_mut(&mut self, frame: PhysAddr) -> &mut PageTable;

	fn write_bytes(&mut self, dst: PhysAddr, src: &[u8]);

	fn read_bytes(&self, src: PhysAddr, dst: &mut [u8]);
}

/// Everything the page table builder needs from its environment.
pub trait FrameStore: FrameAllocator + PhysMemory {}

impl<T: FrameAllocator + PhysMemory + ?Sized> FrameStore for T {}

impl<T: FrameAllocator + ?Sized> FrameAllocator for &mut T {
	fn alloc_frame(&mut self) -> Result<PhysAddr, MmuError> {
		(**self).alloc_frame()
	}

	fn free_frame(&mut self, frame: PhysAddr) {
		(**self).free_frame(frame);
	}
}

impl<T: PhysMemory + ?Sized> PhysMemory for &mut T {
	fn table(&self, frame: PhysAddr) -> &PageTable {
		(**self).table(frame)
	}

	fn table_mut(&mut self, frame: PhysAddr) -> &mut PageTable {
		(**self).table_mut(frame)
	}

	fn write_bytes(&mut self, dst: PhysAddr, src: &[u8]) {
		(**self).write_bytes(dst, src);
	}

	fn read_bytes(&self, src: PhysAddr, dst: &mut [u8]) {
		(**self).read_bytes(src, dst);
	}
}
