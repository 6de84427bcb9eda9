//! Physical and virtual addresses, plus the granule and table-walk helpers
//! the translation table code needs on top of them.

pub use memory_addresses::arch::aarch64::{PhysAddr, VirtAddr};

use crate::config::{PAGE_SIZE, TABLE_ENTRIES};
use crate::mm::error::MmuError;

/// One past the highest output address of a 48-bit descriptor.
pub const PHYS_ADDR_LIMIT: u64 = 1 << 48;

/// Builds a virtual address, rejecting values outside both canonical halves.
pub fn canonical(addr: u64) -> Result<VirtAddr, MmuError> {
	VirtAddr::try_new(addr).map_err(|_| MmuError::NonCanonical(addr))
}

pub trait AddrExt: Copy {
	fn is_page_aligned(self) -> bool;

	/// `self + bytes`, or `None` if that is not a valid address of the same kind.
	fn checked_offset(self, bytes: u64) -> Option<Self>;
}

impl AddrExt for PhysAddr {
	fn is_page_aligned(self) -> bool {
		self.as_u64() % PAGE_SIZE == 0
	}

	fn checked_offset(self, bytes: u64) -> Option<Self> {
		let addr = self.as_u64().checked_add(bytes)?;
		(addr < PHYS_ADDR_LIMIT).then(|| PhysAddr::new(addr))
	}
}

impl AddrExt for VirtAddr {
	fn is_page_aligned(self) -> bool {
		self.as_u64() % PAGE_SIZE == 0
	}

	fn checked_offset(self, bytes: u64) -> Option<Self> {
		VirtAddr::try_new(self.as_u64().checked_add(bytes)?).ok()
	}
}

pub trait VirtAddrExt {
	/// Upper canonical half, walked through `TTBR1_EL1`.
	fn is_high(self) -> bool;

	/// Index into the table of the given level (0 is the root).
	fn table_index(self, level: usize) -> usize;
}

impl VirtAddrExt for VirtAddr {
	fn is_high(self) -> bool {
		self.as_u64() >> 63 == 1
	}

	fn table_index(self, level: usize) -> usize {
		(self.as_u64() >> (39 - 9 * level)) as usize % TABLE_ENTRIES
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn canonical_halves() {
		assert!(canonical(0x0000_7fff_ffff_f000).is_ok());
		assert!(canonical(0xffff_8000_0000_0000).is_ok());
		assert_eq!(
			canonical(0x0001_0000_0000_0000),
			Err(MmuError::NonCanonical(0x0001_0000_0000_0000))
		);
		assert!(canonical(0x8000_0000_0000_0000).is_err());
	}

	#[test]
	fn offsets_stay_valid() {
		let top = VirtAddr::new(0x0000_7fff_ffff_f000);
		assert_eq!(top.checked_offset(0x800), Some(VirtAddr::new(0x0000_7fff_ffff_f800)));
		assert_eq!(VirtAddr::new(0xffff_ffff_ffff_f000).checked_offset(PAGE_SIZE), None);

		let phys = PhysAddr::new(0x0000_ffff_ffff_e000);
		assert_eq!(phys.checked_offset(PAGE_SIZE), Some(PhysAddr::new(0x0000_ffff_ffff_f000)));
		assert_eq!(phys.checked_offset(2 * PAGE_SIZE), None);
		assert!(phys.is_page_aligned());
		assert!(!VirtAddr::new(0x1800).is_page_aligned());
	}

	#[test]
	fn table_indices() {
		let virt = VirtAddr::new(0x1000_0000_0000);
		assert_eq!(virt.table_index(0), 0x20);
		assert_eq!(virt.table_index(1), 0);
		assert_eq!(virt.table_index(2), 0);
		assert_eq!(virt.table_index(3), 0);

		let virt = VirtAddr::new(0xffff_8000_4020_3000);
		assert!(virt.is_high());
		assert_eq!(virt.table_index(0), 0x100);
		assert_eq!(virt.table_index(1), 1);
		assert_eq!(virt.table_index(2), 1);
		assert_eq!(virt.table_index(3), 3);
	}
}
