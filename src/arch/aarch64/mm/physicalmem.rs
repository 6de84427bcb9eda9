use core::ops::Range;
use core::ptr;

use align_address::Align;
use free_list::{FreeList, PageLayout, PageRange};

use crate::arch::mm::paging::PageTable;
use crate::config::{KERNEL_VIRT_OFFSET, PAGE_SIZE};
use crate::mm::addr::PhysAddr;
use crate::mm::error::MmuError;
use crate::mm::frame::{FrameAllocator, PhysMemory};

const FREE_LIST_INLINE_SIZE: usize = 16;

/// Frames carved out of a range of RAM, accessed in place.
///
/// Memory is reached at its physical address while translation is off and
/// through the kernel space linear map once it is on.
pub struct PhysFrames {
	free: FreeList<FREE_LIST_INLINE_SIZE>,
	total: usize,
	in_use: usize,
}

impl PhysFrames {
	/// # Safety
	///
	/// `pool` must be unused RAM, reachable at its physical address until
	/// translation is enabled and at its kernel alias afterwards.
	pub unsafe fn new(pool: Range<PhysAddr>) -> Result<Self, MmuError> {
		let start = PhysAddr::new(pool.start.as_u64().align_up(PAGE_SIZE));
		let end = PhysAddr::new(pool.end.as_u64().align_down(PAGE_SIZE));
		if end <= start {
			return Err(MmuError::InvalidRange {
				start: pool.start.as_u64(),
				end: pool.end.as_u64(),
			});
		}

		let range = PageRange::new(start.as_u64() as usize, end.as_u64() as usize).map_err(|_| {
			MmuError::AlignmentError {
				addr: start.as_u64(),
			}
		})?;
		let mut free = FreeList::new();
		unsafe { free.deallocate(range) }.map_err(|_| MmuError::InvalidRange {
			start: start.as_u64(),
			end: end.as_u64(),
		})?;

		let total = ((end.as_u64() - start.as_u64()) / PAGE_SIZE) as usize;
		debug!("Frame pool {start:p}..{end:p}, {total} frames");
		Ok(Self {
			free,
			total,
			in_use: 0,
		})
	}

	pub fn total(&self) -> usize {
		self.total
	}

	pub fn in_use(&self) -> usize {
		self.in_use
	}

	fn window(addr: PhysAddr) -> usize {
		let offset = if crate::mm::is_translation_enabled() {
			KERNEL_VIRT_OFFSET
		} else {
			0
		};
		(addr.as_u64() + offset) as usize
	}

	fn ptr(addr: PhysAddr) -> *mut u8 {
		ptr::with_exposed_provenance_mut(Self::window(addr))
	}
}

impl FrameAllocator for PhysFrames {
	fn alloc_frame(&mut self) -> Result<PhysAddr, MmuError> {
		let layout =
			PageLayout::from_size(PAGE_SIZE as usize).map_err(|_| MmuError::AllocationExhausted)?;
		let range = self
			.free
			.allocate(layout)
			.map_err(|_| MmuError::AllocationExhausted)?;
		let frame = PhysAddr::new(range.start() as u64);
		self.table_mut(frame).zero();
		self.in_use += 1;
		trace!("Allocated frame {frame:p}");
		Ok(frame)
	}

	fn free_frame(&mut self, frame: PhysAddr) {
		let Ok(range) = PageRange::from_start_len(frame.as_u64() as usize, PAGE_SIZE as usize)
		else {
			warn!("Ignoring free of misaligned frame {frame:p}");
			return;
		};
		// SAFETY: the builder only returns frames it got from `alloc_frame`
		// and no longer references.
		if unsafe { self.free.deallocate(range) }.is_err() {
			warn!("Frame {frame:p} was not allocated");
			return;
		}
		self.in_use -= 1;
	}
}

impl PhysMemory for PhysFrames {
	fn table(&self, frame: PhysAddr) -> &PageTable {
		// SAFETY: tables live in frames of the pool, which are page aligned
		// and accessible through `window`.
		unsafe { &*Self::ptr(frame).cast::<PageTable>() }
	}

	fn table_mut(&mut self, frame: PhysAddr) -> &mut PageTable {
		unsafe { &mut *Self::ptr(frame).cast::<PageTable>() }
	}

	fn write_bytes(&mut self, dst: PhysAddr, src: &[u8]) {
		unsafe {
			ptr::copy_nonoverlapping(src.as_ptr(), Self::ptr(dst), src.len());
		}
	}

	fn read_bytes(&self, src: PhysAddr, dst: &mut [u8]) {
		unsafe {
			ptr::copy_nonoverlapping(Self::ptr(src).cast_const(), dst.as_mut_ptr(), dst.len());
		}
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use std::prelude::v1::*;

	use super::*;
	use crate::mm::addr::AddrExt;

	fn pool(pages: usize) -> (Vec<PageTable>, Range<PhysAddr>) {
		let mut memory: Vec<PageTable> = (0..pages).map(|_| PageTable::new()).collect();
		let start = memory.as_mut_ptr().expose_provenance() as u64;
		let range = PhysAddr::new(start)..PhysAddr::new(start + pages as u64 * PAGE_SIZE);
		(memory, range)
	}

	#[test]
	fn frames_are_zeroed_and_returned() {
		let (_memory, range) = pool(3);
		let mut frames = unsafe { PhysFrames::new(range.clone()) }.unwrap();
		assert_eq!(frames.total(), 3);

		let first = frames.alloc_frame().unwrap();
		assert!(range.contains(&first));
		assert!(first.is_page_aligned());
		assert!(frames.table(first).is_empty());

		frames.write_bytes(first, &[0xaa; 16]);
		let mut back = [0u8; 16];
		frames.read_bytes(first, &mut back);
		assert_eq!(back, [0xaa; 16]);

		frames.alloc_frame().unwrap();
		frames.alloc_frame().unwrap();
		assert_eq!(frames.alloc_frame(), Err(MmuError::AllocationExhausted));
		assert_eq!(frames.in_use(), 3);

		frames.free_frame(first);
		assert_eq!(frames.in_use(), 2);
		let again = frames.alloc_frame().unwrap();
		assert_eq!(again, first);
		assert!(frames.table(again).is_empty());
	}

	#[test]
	fn empty_pool_is_rejected() {
		let range = PhysAddr::new(0x4000_0800)..PhysAddr::new(0x4000_1000);
		assert!(matches!(
			unsafe { PhysFrames::new(range) },
			Err(MmuError::InvalidRange { .. })
		));
	}
}
