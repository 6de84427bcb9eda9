//! The two address spaces that exist during bring-up.

use core::fmt;
use core::ops::Range;

use crate::arch::mm::paging::PageTableBuilder;
use crate::config::{KERNEL_SPACE_START, KERNEL_VIRT_OFFSET, VA_BITS};
use crate::mm::addr::{PhysAddr, VirtAddr, VirtAddrExt, canonical};
use crate::mm::error::MmuError;
use crate::mm::frame::FrameStore;

/// Which translation table base register an address space is loaded into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpaceRole {
	/// `TTBR0_EL1`, VA equals PA. Only walked until the kernel runs from its high alias.
	Identity,
	/// `TTBR1_EL1`, VA equals PA plus [`KERNEL_VIRT_OFFSET`].
	Kernel,
}

impl SpaceRole {
	pub const ALL: [Self; 2] = [Self::Identity, Self::Kernel];

	pub fn contains(self, virt: VirtAddr) -> bool {
		match self {
			Self::Identity => virt.as_u64() < 1 << VA_BITS,
			Self::Kernel => virt.as_u64() >= KERNEL_SPACE_START,
		}
	}

	/// The space that hardware walks for `virt`.
	pub fn of(virt: VirtAddr) -> Self {
		if virt.is_high() {
			Self::Kernel
		} else {
			Self::Identity
		}
	}

	/// The address `phys` is reachable at in this space.
	pub fn alias_of(self, phys: PhysAddr) -> Result<VirtAddr, MmuError> {
		let offset = match self {
			Self::Identity => 0,
			Self::Kernel => KERNEL_VIRT_OFFSET,
		};
		phys.as_u64()
			.checked_add(offset)
			.and_then(|addr| canonical(addr).ok())
			.filter(|&virt| self.contains(virt))
			.ok_or(MmuError::NoAlias { phys, space: self })
	}

	/// The addresses `phys` is reachable at in this space.
	pub fn alias_range(self, phys: &Range<PhysAddr>) -> Result<Range<VirtAddr>, MmuError> {
		Ok(self.alias_of(phys.start)?..self.alias_of(phys.end)?)
	}

	pub const fn name(self) -> &'static str {
		match self {
			Self::Identity => "identity",
			Self::Kernel => "kernel",
		}
	}
}

impl fmt::Display for SpaceRole {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

/// Whether the hardware walks an address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkState {
	/// `TCR_EL1` has not been programmed yet.
	Pending,
	Walking,
	/// Walks were turned off with `EPDx`.
	Disabled,
}

/// A root translation table and the register it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressSpace {
	role: SpaceRole,
	root: PhysAddr,
	walks: WalkState,
}

impl AddressSpace {
	/// Allocates the identity and the kernel root tables.
	pub fn new_pair<F: FrameStore>(
		builder: &mut PageTableBuilder<F>,
	) -> Result<(Self, Self), MmuError> {
		let identity = builder.create_table()?;
		let kernel = match builder.create_table() {
			Ok(kernel) => kernel,
			Err(err) => {
				builder.frames_mut().free_frame(identity);
				return Err(err);
			}
		};
		debug!("Identity root at {identity:p}, kernel root at {kernel:p}");

		Ok((
			Self {
				role: SpaceRole::Identity,
				root: identity,
				walks: WalkState::Pending,
			},
			Self {
				role: SpaceRole::Kernel,
				root: kernel,
				walks: WalkState::Pending,
			},
		))
	}

	pub fn role(&self) -> SpaceRole {
		self.role
	}

	/// Value for this space's base register.
	pub fn base(&self) -> PhysAddr {
		self.root
	}

	pub fn walk_state(&self) -> WalkState {
		self.walks
	}

	/// Whether the base register currently performs walks.
	pub fn walks_enabled(&self) -> bool {
		self.walks == WalkState::Walking
	}

	pub(crate) fn set_walk_state(&mut self, walks: WalkState) {
		self.walks = walks;
	}

	pub fn contains(&self, virt: VirtAddr) -> bool {
		self.role.contains(virt)
	}

	/// Fails unless all of `virt` lies in this space.
	pub fn check_range(&self, virt: &Range<VirtAddr>) -> Result<(), MmuError> {
		if virt.end <= virt.start {
			return Err(MmuError::InvalidRange {
				start: virt.start.as_u64(),
				end: virt.end.as_u64(),
			});
		}
		let last = canonical(virt.end.as_u64() - 1)?;
		for addr in [virt.start, last] {
			if !self.contains(addr) {
				return Err(MmuError::OutsideSpace {
					virt: addr,
					space: self.role,
				});
			}
		}
		Ok(())
	}
}

/// The identity and the kernel address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressSpaces {
	identity: AddressSpace,
	kernel: AddressSpace,
}

impl AddressSpaces {
	pub fn new<F: FrameStore>(builder: &mut PageTableBuilder<F>) -> Result<Self, MmuError> {
		let (identity, kernel) = AddressSpace::new_pair(builder)?;
		Ok(Self { identity, kernel })
	}

	pub fn get(&self, role: SpaceRole) -> &AddressSpace {
		match role {
			SpaceRole::Identity => &self.identity,
			SpaceRole::Kernel => &self.kernel,
		}
	}

	pub(crate) fn get_mut(&mut self, role: SpaceRole) -> &mut AddressSpace {
		match role {
			SpaceRole::Identity => &mut self.identity,
			SpaceRole::Kernel => &mut self.kernel,
		}
	}

	pub fn base_of(&self, role: SpaceRole) -> PhysAddr {
		self.get(role).base()
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;
	use crate::mm::addr::AddrExt;
	use crate::mm::frame::PhysMemory;
	use crate::mm::test::TestFrames;

	#[test]
	fn pair_has_distinct_empty_roots() {
		let mut builder = PageTableBuilder::new(TestFrames::new());
		let spaces = AddressSpaces::new(&mut builder).unwrap();

		let identity = spaces.base_of(SpaceRole::Identity);
		let kernel = spaces.base_of(SpaceRole::Kernel);
		assert_ne!(identity, kernel);
		assert!(identity.is_page_aligned() && kernel.is_page_aligned());
		assert!(builder.frames().table(identity).is_empty());
		assert!(builder.frames().table(kernel).is_empty());
		assert!(!spaces.get(SpaceRole::Identity).walks_enabled());
		assert_eq!(spaces.get(SpaceRole::Kernel).walk_state(), WalkState::Pending);
	}

	#[test]
	fn failed_pair_releases_first_root() {
		let mut builder = PageTableBuilder::new(TestFrames::with_capacity(1));
		assert_eq!(
			AddressSpaces::new(&mut builder),
			Err(MmuError::AllocationExhausted)
		);
		assert_eq!(builder.frames().in_use(), 0);
	}

	#[test]
	fn halves() {
		let low = VirtAddr::new(0x4000_0000);
		let high = SpaceRole::Kernel.alias_of(PhysAddr::new(0x4000_0000)).unwrap();
		assert_eq!(high, VirtAddr::new(0xffff_8000_4000_0000));
		assert_eq!(SpaceRole::Identity.alias_of(PhysAddr::new(0x4000_0000)), Ok(low));
		assert!(SpaceRole::Identity.contains(low));
		assert!(!SpaceRole::Identity.contains(high));
		assert!(SpaceRole::Kernel.contains(high));
		assert!(!SpaceRole::Kernel.contains(low));
		assert_eq!(SpaceRole::of(high), SpaceRole::Kernel);
		assert_eq!(SpaceRole::of(low), SpaceRole::Identity);
	}

	#[test]
	fn aliases_must_be_canonical() {
		let high_ram = PhysAddr::new(0x0000_8000_0000_0000);
		assert_eq!(
			SpaceRole::Kernel.alias_of(high_ram),
			Err(MmuError::NoAlias {
				phys: high_ram,
				space: SpaceRole::Kernel
			})
		);
		let ram = PhysAddr::new(0x4000_0000)..PhysAddr::new(0x4000_2000);
		assert_eq!(
			SpaceRole::Kernel.alias_range(&ram),
			Ok(VirtAddr::new(0xffff_8000_4000_0000)..VirtAddr::new(0xffff_8000_4000_2000))
		);
	}

	#[test]
	fn ranges_must_stay_inside() {
		let mut builder = PageTableBuilder::new(TestFrames::new());
		let spaces = AddressSpaces::new(&mut builder).unwrap();
		let identity = spaces.get(SpaceRole::Identity);

		let top = VirtAddr::new(0xffff_ffff_f000);
		assert!(identity.check_range(&(VirtAddr::new(0x1000)..VirtAddr::new(0x2000))).is_ok());
		assert!(identity.check_range(&(VirtAddr::new(0xffff_f000_0000)..top)).is_ok());
		assert_eq!(
			identity.check_range(&(top..VirtAddr::new(0xffff_8000_0000_1000))),
			Err(MmuError::OutsideSpace {
				virt: VirtAddr::new(0xffff_8000_0000_0fff),
				space: SpaceRole::Identity
			})
		);
		assert!(matches!(
			identity.check_range(&(VirtAddr::new(0x2000)..VirtAddr::new(0x2000))),
			Err(MmuError::InvalidRange { .. })
		));
	}
}
