//! The page tables, address spaces and mapping registry of the kernel.

use core::ops::Range;

use crate::arch::kernel::registers::{BarrierDomain, MmuRegisters};
use crate::arch::mm::paging::{PageTableBuilder, PageTableEntryFlags};
use crate::config::{MAX_REGIONS, PAGE_SIZE};
use crate::mm::addr::{PhysAddr, VirtAddr};
use crate::mm::diag::WalkReport;
use crate::mm::error::MmuError;
use crate::mm::frame::FrameStore;
use crate::mm::layout::{BootLayout, page_span, subtract};
use crate::mm::registry::{AuditReport, Conflict, MappingRegistry};
use crate::mm::space::{AddressSpace, AddressSpaces, SpaceRole, WalkState};

/// Owner of both translation table trees.
///
/// Every mapping goes through [`KernelVm::register_region`] so that the
/// registry always describes exactly what the tables contain.
pub struct KernelVm<F> {
	builder: PageTableBuilder<F>,
	spaces: AddressSpaces,
	registry: MappingRegistry,
}

impl<F: FrameStore> KernelVm<F> {
	/// Allocates the two empty root tables.
	pub fn new(frames: F) -> Result<Self, MmuError> {
		let mut builder = PageTableBuilder::new(frames);
		let spaces = AddressSpaces::new(&mut builder)?;
		Ok(Self {
			builder,
			spaces,
			registry: MappingRegistry::new(),
		})
	}

	pub fn space(&self, role: SpaceRole) -> &AddressSpace {
		self.spaces.get(role)
	}

	/// The value for the base register of `role`.
	pub fn base_of(&self, role: SpaceRole) -> PhysAddr {
		self.spaces.base_of(role)
	}

	pub fn registry(&self) -> &MappingRegistry {
		&self.registry
	}

	pub fn builder(&self) -> &PageTableBuilder<F> {
		&self.builder
	}

	pub(crate) fn frames_mut(&mut self) -> &mut F {
		self.builder.frames_mut()
	}

	pub(crate) fn set_walk_state(&mut self, role: SpaceRole, walks: WalkState) {
		self.spaces.get_mut(role).set_walk_state(walks);
	}

	fn check(
		&self,
		name: &'static str,
		space: SpaceRole,
		virt: &Range<VirtAddr>,
	) -> Result<(), MmuError> {
		self.spaces.get(space).check_range(virt)?;
		self.registry.check(name, virt, space)
	}

	/// Maps `virt` to the frames starting at `phys_start` in `space` and records it.
	///
	/// Nothing is mapped or recorded if the range overlaps a registered
	/// region of the same space.
	pub fn register_region(
		&mut self,
		name: &'static str,
		space: SpaceRole,
		virt: Range<VirtAddr>,
		phys_start: PhysAddr,
		flags: PageTableEntryFlags,
	) -> Result<(), MmuError> {
		self.check(name, space, &virt)?;
		let root = self.spaces.base_of(space);
		self.builder
			.map_range(root, virt.clone(), phys_start, flags)?;
		self.registry
			.register(name, virt, phys_start, flags, space)
	}

	/// [`KernelVm::register_region`] on tables the MMU may already walk.
	///
	/// The new descriptors are visible to the table walker when this returns.
	pub fn register_live_region<R: MmuRegisters>(
		&mut self,
		cpu: &mut R,
		name: &'static str,
		space: SpaceRole,
		virt: Range<VirtAddr>,
		phys_start: PhysAddr,
		flags: PageTableEntryFlags,
	) -> Result<(), MmuError> {
		self.register_region(name, space, virt, phys_start, flags)?;
		cpu.data_barrier(BarrierDomain::InnerShareableStore);
		cpu.instruction_barrier();
		Ok(())
	}

	/// Maps `phys` at its identity address and at its kernel alias.
	///
	/// Either both mappings exist afterwards or neither does.
	pub fn map_dual(
		&mut self,
		name: &'static str,
		phys: Range<PhysAddr>,
		flags: PageTableEntryFlags,
	) -> Result<(), MmuError> {
		let identity = SpaceRole::Identity.alias_range(&phys)?;
		let kernel = SpaceRole::Kernel.alias_range(&phys)?;
		self.check(name, SpaceRole::Identity, &identity)?;
		self.check(name, SpaceRole::Kernel, &kernel)?;
		if self.registry.len() + 2 > MAX_REGIONS {
			return Err(MmuError::RegistryFull);
		}

		let identity_root = self.spaces.base_of(SpaceRole::Identity);
		let kernel_root = self.spaces.base_of(SpaceRole::Kernel);
		self.builder
			.map_range(identity_root, identity.clone(), phys.start, flags)?;
		if let Err(err) = self
			.builder
			.map_range(kernel_root, kernel.clone(), phys.start, flags)
		{
			self.unmap_range(identity_root, &identity);
			return Err(err);
		}

		self.registry
			.register(name, identity, phys.start, flags, SpaceRole::Identity)?;
		self.registry
			.register(name, kernel, phys.start, flags, SpaceRole::Kernel)
	}

	fn unmap_range(&mut self, root: PhysAddr, virt: &Range<VirtAddr>) {
		let mut page = virt.start;
		while page < virt.end {
			self.builder.unmap_page(root, page);
			page = page + PAGE_SIZE;
		}
	}

	/// Maps the kernel image, trampoline, vector table, UART and RAM.
	///
	/// Everything the kernel touches before it runs from its alias is
	/// mapped into both spaces. The rest of RAM is only reachable through
	/// the kernel space.
	pub fn map_boot_layout(&mut self, layout: &BootLayout) -> Result<(), MmuError> {
		let image = &layout.image;
		let tramp = page_span(image.trampoline.clone());
		let text = page_span(image.text.clone());
		for piece in subtract(
			text.start.as_u64()..text.end.as_u64(),
			&[tramp.start.as_u64()..tramp.end.as_u64()],
		)? {
			self.map_dual(
				"text",
				PhysAddr::new(piece.start)..PhysAddr::new(piece.end),
				PageTableEntryFlags::KERNEL_TEXT,
			)?;
		}
		self.map_dual("trampoline", tramp.clone(), PageTableEntryFlags::KERNEL_TEXT)?;
		self.map_dual(
			"rodata",
			page_span(image.rodata.clone()),
			PageTableEntryFlags::KERNEL_RODATA,
		)?;
		self.map_dual(
			"data",
			page_span(image.data.clone()),
			PageTableEntryFlags::KERNEL_DATA,
		)?;
		self.map_dual("vectors", layout.vector_pages(), PageTableEntryFlags::KERNEL_TEXT)?;
		self.map_dual("uart", layout.uart_pages(), PageTableEntryFlags::DEVICE)?;

		if let Some(extra) = &layout.identity_extra {
			let extra = page_span(extra.clone());
			self.register_region(
				"boot identity",
				SpaceRole::Identity,
				SpaceRole::Identity.alias_range(&extra)?,
				extra.start,
				PageTableEntryFlags::KERNEL_DATA,
			)?;
		}

		let image_pages = page_span(image.start()..image.end());
		let vector_pages = layout.vector_pages();
		let ram = page_span(layout.ram.clone());
		for piece in subtract(
			ram.start.as_u64()..ram.end.as_u64(),
			&[
				image_pages.start.as_u64()..image_pages.end.as_u64(),
				vector_pages.start.as_u64()..vector_pages.end.as_u64(),
			],
		)? {
			let phys = PhysAddr::new(piece.start)..PhysAddr::new(piece.end);
			self.register_region(
				"ram",
				SpaceRole::Kernel,
				SpaceRole::Kernel.alias_range(&phys)?,
				phys.start,
				PageTableEntryFlags::KERNEL_DATA,
			)?;
		}

		info!(
			"Mapped boot layout: {} regions, identity root {:p}, kernel root {:p}",
			self.registry.len(),
			self.base_of(SpaceRole::Identity),
			self.base_of(SpaceRole::Kernel)
		);
		Ok(())
	}

	/// Leaf translation of `virt` in `role`, regardless of whether it is walked.
	pub fn walk(&self, role: SpaceRole, virt: VirtAddr) -> Option<(PhysAddr, PageTableEntryFlags)> {
		if !role.contains(virt) {
			return None;
		}
		self.builder.walk(self.base_of(role), virt)
	}

	/// Translates `virt` through the space the hardware would walk.
	///
	/// Addresses in a space whose walks have been disabled do not translate.
	pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
		let role = SpaceRole::of(virt);
		if self.spaces.get(role).walk_state() == WalkState::Disabled {
			return None;
		}
		self.walk(role, virt).map(|(phys, _)| phys)
	}

	pub fn walk_and_report(&self, role: SpaceRole, virt: VirtAddr) -> WalkReport {
		let root = self.base_of(role);
		WalkReport {
			space: role,
			root,
			trace: self.builder.trace(root, virt),
		}
	}

	/// Checks the registry for conflicts and every registered page against the tables.
	pub fn audit(&self) -> AuditReport {
		let mut report = self.registry.audit();
		for region in self.registry.regions() {
			let mut virt = region.virt.start;
			while virt < region.virt.end {
				let expected = region.expected_phys(virt);
				match self.walk(region.space, virt) {
					None => report.push(Conflict::Unmapped {
						region: region.name,
						virt,
					}),
					Some((found, _)) if found != expected => report.push(Conflict::Mismatch {
						region: region.name,
						virt,
						expected,
						found,
					}),
					Some((_, found)) if found != region.flags => {
						report.push(Conflict::FlagsDiffer {
							region: region.name,
							virt,
							expected: region.flags,
							found,
						});
					}
					Some(_) => {}
				}
				virt = virt + PAGE_SIZE;
			}
		}
		report
	}

	pub fn print_information(&self) {
		infoheader!(" MAPPING REGISTRY ");
		infoentry!("Identity root", "{:p}", self.base_of(SpaceRole::Identity));
		infoentry!("Kernel root", "{:p}", self.base_of(SpaceRole::Kernel));
		for region in self.registry.regions() {
			info!("{region}");
		}
		infofooter!();
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use std::prelude::v1::*;

	use super::*;
	use crate::config::KERNEL_VIRT_OFFSET;
	use crate::mm::layout::KernelImage;
	use crate::mm::test::{CpuOp, SimulatedCpu, TRAMPOLINE_PC, TestFrames, test_layout};

	fn vm() -> KernelVm<TestFrames> {
		KernelVm::new(TestFrames::new()).unwrap()
	}

	fn range(start: u64, end: u64) -> Range<VirtAddr> {
		VirtAddr::new(start)..VirtAddr::new(end)
	}

	#[test]
	fn overlap_maps_nothing() {
		let mut vm = vm();
		let flags = PageTableEntryFlags::KERNEL_DATA;

		vm.register_region("first", SpaceRole::Identity, range(0x1000, 0x2000), PhysAddr::new(0x1000), flags)
			.unwrap();
		let err = vm.register_region(
			"second",
			SpaceRole::Identity,
			range(0x1000, 0x3000),
			PhysAddr::new(0x8000),
			flags,
		);
		assert_eq!(
			err,
			Err(MmuError::OverlapConflict {
				name: "second",
				existing: "first",
				space: SpaceRole::Identity
			})
		);
		assert_eq!(vm.registry().len(), 1);
		assert_eq!(vm.walk(SpaceRole::Identity, VirtAddr::new(0x2000)), None);
		assert_eq!(
			vm.walk(SpaceRole::Identity, VirtAddr::new(0x1000)),
			Some((PhysAddr::new(0x1000), flags))
		);
	}

	#[test]
	fn regions_must_match_their_space() {
		let mut vm = vm();
		assert!(matches!(
			vm.register_region(
				"low",
				SpaceRole::Kernel,
				range(0x1000, 0x2000),
				PhysAddr::new(0x1000),
				PageTableEntryFlags::KERNEL_DATA
			),
			Err(MmuError::OutsideSpace { .. })
		));
		assert!(vm.registry().is_empty());
	}

	#[test]
	fn dual_mapping_is_all_or_nothing() {
		// two roots, then identity needs three tables and kernel three more
		let mut small = KernelVm::new(TestFrames::with_capacity(7)).unwrap();
		let phys = PhysAddr::new(0x4008_0000)..PhysAddr::new(0x4008_2000);

		assert_eq!(
			small.map_dual("tramp", phys.clone(), PageTableEntryFlags::KERNEL_TEXT),
			Err(MmuError::AllocationExhausted)
		);
		assert!(small.registry().is_empty());
		assert_eq!(small.walk(SpaceRole::Identity, VirtAddr::new(0x4008_0000)), None);
		assert_eq!(small.builder().frames().in_use(), 2);

		let mut fresh = vm();
		fresh.map_dual("tramp", phys, PageTableEntryFlags::KERNEL_TEXT).unwrap();
		for role in SpaceRole::ALL {
			assert_eq!(
				fresh.walk(role, role.alias_of(PhysAddr::new(0x4008_1000)).unwrap()),
				Some((PhysAddr::new(0x4008_1000), PageTableEntryFlags::KERNEL_TEXT))
			);
		}
		assert_eq!(fresh.registry().len(), 2);
	}

	#[test]
	fn boot_layout_is_consistent() {
		let mut vm = vm();
		let layout = test_layout();
		vm.map_boot_layout(&layout).unwrap();

		let report = vm.audit();
		assert!(report.is_clean(), "{report}");
		assert_eq!(vm.audit(), report);

		// trampoline in both spaces with identical flags
		let tramp = layout.image.trampoline.start;
		let low = vm.walk(SpaceRole::Identity, SpaceRole::Identity.alias_of(tramp).unwrap());
		let high = vm.walk(SpaceRole::Kernel, SpaceRole::Kernel.alias_of(tramp).unwrap());
		assert_eq!(low, Some((tramp, PageTableEntryFlags::KERNEL_TEXT)));
		assert_eq!(low, high);

		// RAM outside the image is only in the kernel space
		let free = PhysAddr::new(0x4100_0000);
		assert_eq!(vm.translate(VirtAddr::new(free.as_u64() + KERNEL_VIRT_OFFSET)), Some(free));
		assert_eq!(vm.translate(VirtAddr::new(free.as_u64())), None);

		// the UART is device memory
		let (_, uart) = vm
			.walk(SpaceRole::Kernel, SpaceRole::Kernel.alias_of(layout.uart).unwrap())
			.unwrap();
		assert_eq!(uart, PageTableEntryFlags::DEVICE);
	}

	#[test]
	fn retired_identity_space_stops_translating() {
		let mut vm = vm();
		vm.map_dual(
			"data",
			PhysAddr::new(0x4000_0000)..PhysAddr::new(0x4000_1000),
			PageTableEntryFlags::KERNEL_DATA,
		)
		.unwrap();
		let low = VirtAddr::new(0x4000_0000);

		assert_eq!(vm.translate(low), Some(PhysAddr::new(0x4000_0000)));
		vm.set_walk_state(SpaceRole::Identity, WalkState::Walking);
		assert_eq!(vm.translate(low), Some(PhysAddr::new(0x4000_0000)));
		vm.set_walk_state(SpaceRole::Identity, WalkState::Disabled);
		assert_eq!(vm.translate(low), None);
		assert_eq!(
			vm.translate(VirtAddr::new(0xffff_8000_4000_0000)),
			Some(PhysAddr::new(0x4000_0000))
		);
	}

	#[test]
	fn audit_finds_tampered_leaf() {
		let mut vm = vm();
		vm.register_region(
			"data",
			SpaceRole::Identity,
			range(0x4000_0000, 0x4000_2000),
			PhysAddr::new(0x4000_0000),
			PageTableEntryFlags::KERNEL_DATA,
		)
		.unwrap();
		let root = vm.base_of(SpaceRole::Identity);
		vm.builder
			.remap_page(
				root,
				VirtAddr::new(0x4000_1000),
				PhysAddr::new(0x4000_1000),
				PageTableEntryFlags::KERNEL_TEXT,
			)
			.unwrap();

		let report = vm.audit();
		assert_eq!(
			report.conflicts(),
			&[Conflict::FlagsDiffer {
				region: "data",
				virt: VirtAddr::new(0x4000_1000),
				expected: PageTableEntryFlags::KERNEL_DATA,
				found: PageTableEntryFlags::KERNEL_TEXT
			}]
		);
	}

	#[test]
	fn walk_report_lists_every_level() {
		let mut vm = vm();
		let layout = test_layout();
		vm.map_boot_layout(&layout).unwrap();

		let virt = VirtAddr::new(0xffff_8000_4008_8040);
		let report = vm.walk_and_report(SpaceRole::Kernel, virt);
		assert_eq!(report.trace.steps.len(), 4);
		assert_eq!(
			report.translation(),
			Some((PhysAddr::new(0x4008_8040), PageTableEntryFlags::KERNEL_TEXT))
		);
		let text = format!("{report}");
		assert!(text.starts_with("walk 0xffff800040088040 in kernel space"));
		assert!(text.contains("  L3 "));
		assert!(text.ends_with("  => 0x40088040\n"));

		let missing = vm.walk_and_report(SpaceRole::Identity, VirtAddr::new(0x4100_0000));
		assert_eq!(missing.translation(), None);
		assert!(format!("{missing}").ends_with("  => translation fault\n"));
	}

	#[test]
	fn image_must_not_overlap_itself() {
		let mut vm = vm();
		let mut layout = test_layout();
		layout.image = KernelImage {
			rodata: layout.image.text.clone(),
			..layout.image
		};
		assert!(matches!(
			vm.map_boot_layout(&layout),
			Err(MmuError::OverlapConflict { name: "rodata", .. })
		));
	}

	#[test]
	fn live_tables_get_barriers() {
		let mut vm = vm();
		let mut cpu = SimulatedCpu::new(TRAMPOLINE_PC);
		let high = VirtAddr::new(0xffff_8000_4000_0000);

		vm.register_live_region(
			&mut cpu,
			"ram",
			SpaceRole::Kernel,
			high..high + 0x1000u64,
			PhysAddr::new(0x4000_0000),
			PageTableEntryFlags::KERNEL_DATA,
		)
		.unwrap();
		assert_eq!(
			cpu.ops,
			[CpuOp::Dsb(BarrierDomain::InnerShareableStore), CpuOp::Isb]
		);
		assert_eq!(vm.translate(high), Some(PhysAddr::new(0x4000_0000)));

		cpu.ops.clear();
		let err = vm.register_live_region(
			&mut cpu,
			"again",
			SpaceRole::Kernel,
			high..high + 0x1000u64,
			PhysAddr::new(0x4100_0000),
			PageTableEntryFlags::KERNEL_DATA,
		);
		assert!(matches!(err, Err(MmuError::OverlapConflict { .. })));
		assert!(cpu.ops.is_empty());
	}
}
