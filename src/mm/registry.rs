//! Append-only record of every region mapped during bring-up.

use core::fmt;
use core::ops::Range;

use crate::arch::mm::paging::PageTableEntryFlags;
use crate::config::{MAX_AUDIT_CONFLICTS, MAX_REGIONS};
use crate::mm::addr::{PhysAddr, VirtAddr};
use crate::mm::error::MmuError;
use crate::mm::space::SpaceRole;

/// A named range of virtual addresses backed by consecutive frames.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MappingRegion {
	pub name: &'static str,
	pub virt: Range<VirtAddr>,
	pub phys_start: PhysAddr,
	pub flags: PageTableEntryFlags,
	pub space: SpaceRole,
}

impl MappingRegion {
	pub fn len(&self) -> u64 {
		self.virt.end.as_u64() - self.virt.start.as_u64()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn phys(&self) -> Range<PhysAddr> {
		self.phys_start..self.phys_start + self.len()
	}

	pub fn contains(&self, virt: VirtAddr) -> bool {
		self.virt.contains(&virt)
	}

	/// Whether this region shares virtual addresses with `virt` in `space`.
	pub fn overlaps(&self, space: SpaceRole, virt: &Range<VirtAddr>) -> bool {
		self.space == space && self.virt.start < virt.end && virt.start < self.virt.end
	}

	/// The frame `virt` is supposed to translate to.
	pub fn expected_phys(&self, virt: VirtAddr) -> PhysAddr {
		self.phys_start + (virt.as_u64() - self.virt.start.as_u64())
	}
}

impl fmt::Display for MappingRegion {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{:<16} {:<8} {:#018x}..{:#018x} -> {:#012x} {:?}",
			self.name,
			self.space,
			self.virt.start.as_u64(),
			self.virt.end.as_u64(),
			self.phys_start.as_u64(),
			self.flags
		)
	}
}

/// A problem found by an audit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Conflict {
	/// Two regions of one space share virtual addresses.
	Overlap {
		space: SpaceRole,
		first: &'static str,
		second: &'static str,
	},
	/// Two regions of one space map the same frames.
	PhysicalAlias {
		space: SpaceRole,
		first: &'static str,
		second: &'static str,
	},
	/// A registered page has no translation.
	Unmapped {
		region: &'static str,
		virt: VirtAddr,
	},
	/// A registered page translates to another frame.
	Mismatch {
		region: &'static str,
		virt: VirtAddr,
		expected: PhysAddr,
		found: PhysAddr,
	},
	/// A registered page has other attributes than recorded.
	FlagsDiffer {
		region: &'static str,
		virt: VirtAddr,
		expected: PageTableEntryFlags,
		found: PageTableEntryFlags,
	},
}

impl fmt::Display for Conflict {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Overlap {
				space,
				first,
				second,
			} => write!(f, "{space}: `{first}` overlaps `{second}`"),
			Self::PhysicalAlias {
				space,
				first,
				second,
			} => write!(f, "{space}: `{first}` and `{second}` map the same frames"),
			Self::Unmapped { region, virt } => write!(f, "`{region}`: {virt:p} is not mapped"),
			Self::Mismatch {
				region,
				virt,
				expected,
				found,
			} => write!(f, "`{region}`: {virt:p} maps {found:p}, expected {expected:p}"),
			Self::FlagsDiffer {
				region,
				virt,
				expected,
				found,
			} => write!(
				f,
				"`{region}`: {virt:p} has flags {:#x}, expected {:#x}",
				found.bits(),
				expected.bits()
			),
		}
	}
}

/// Result of an audit. Conflicts beyond the capacity are only counted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuditReport {
	conflicts: heapless::Vec<Conflict, MAX_AUDIT_CONFLICTS>,
	dropped: usize,
}

impl AuditReport {
	pub fn is_clean(&self) -> bool {
		self.conflicts.is_empty() && self.dropped == 0
	}

	pub fn conflicts(&self) -> &[Conflict] {
		&self.conflicts
	}

	/// Total number of conflicts found, including dropped ones.
	pub fn count(&self) -> usize {
		self.conflicts.len() + self.dropped
	}

	pub(crate) fn push(&mut self, conflict: Conflict) {
		if self.conflicts.push(conflict).is_err() {
			self.dropped += 1;
		}
	}
}

impl fmt::Display for AuditReport {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.is_clean() {
			return writeln!(f, "audit: no conflicts");
		}
		writeln!(f, "audit: {} conflicts", self.count())?;
		for conflict in &self.conflicts {
			writeln!(f, "  {conflict}")?;
		}
		if self.dropped > 0 {
			writeln!(f, "  ... and {} more", self.dropped)?;
		}
		Ok(())
	}
}

/// Every region mapped so far, in registration order.
#[derive(Debug, Default)]
pub struct MappingRegistry {
	regions: heapless::Vec<MappingRegion, MAX_REGIONS>,
}

impl MappingRegistry {
	pub const fn new() -> Self {
		Self {
			regions: heapless::Vec::new(),
		}
	}

	/// Fails if a region named `name` could not be appended.
	pub fn check(
		&self,
		name: &'static str,
		virt: &Range<VirtAddr>,
		space: SpaceRole,
	) -> Result<(), MmuError> {
		if let Some(existing) = self.regions.iter().find(|region| region.overlaps(space, virt)) {
			return Err(MmuError::OverlapConflict {
				name,
				existing: existing.name,
				space,
			});
		}
		if self.regions.is_full() {
			return Err(MmuError::RegistryFull);
		}
		Ok(())
	}

	/// Appends a region after checking it against every region of the same space.
	pub fn register(
		&mut self,
		name: &'static str,
		virt: Range<VirtAddr>,
		phys_start: PhysAddr,
		flags: PageTableEntryFlags,
		space: SpaceRole,
	) -> Result<(), MmuError> {
		self.check(name, &virt, space)?;
		let region = MappingRegion {
			name,
			virt,
			phys_start,
			flags: flags.attributes(),
			space,
		};
		trace!("Registered {region}");
		self.regions
			.push(region)
			.map_err(|_| MmuError::RegistryFull)
	}

	pub fn regions(&self) -> &[MappingRegion] {
		&self.regions
	}

	pub fn len(&self) -> usize {
		self.regions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.regions.is_empty()
	}

	pub fn in_space(&self, space: SpaceRole) -> impl Iterator<Item = &MappingRegion> {
		self.regions.iter().filter(move |region| region.space == space)
	}

	/// The region covering `virt` in `space`.
	pub fn find(&self, space: SpaceRole, virt: VirtAddr) -> Option<&MappingRegion> {
		self.in_space(space).find(|region| region.contains(virt))
	}

	/// Rescans all pairs of regions for shared virtual or physical addresses.
	pub fn audit(&self) -> AuditReport {
		let mut report = AuditReport::default();
		for (i, first) in self.regions.iter().enumerate() {
			for second in &self.regions[i + 1..] {
				if first.space != second.space {
					continue;
				}
				if first.overlaps(second.space, &second.virt) {
					report.push(Conflict::Overlap {
						space: first.space,
						first: first.name,
						second: second.name,
					});
				}
				let (a, b) = (first.phys(), second.phys());
				if a.start < b.end && b.start < a.end {
					report.push(Conflict::PhysicalAlias {
						space: first.space,
						first: first.name,
						second: second.name,
					});
				}
			}
		}
		report
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	fn range(start: u64, end: u64) -> Range<VirtAddr> {
		VirtAddr::new(start)..VirtAddr::new(end)
	}

	#[test]
	fn overlapping_region_is_rejected() {
		let mut registry = MappingRegistry::new();
		let flags = PageTableEntryFlags::KERNEL_DATA;

		registry
			.register("first", range(0x1000, 0x2000), PhysAddr::new(0x1000), flags, SpaceRole::Identity)
			.unwrap();
		assert_eq!(
			registry.register(
				"second",
				range(0x1800, 0x2500),
				PhysAddr::new(0x1800),
				flags,
				SpaceRole::Identity
			),
			Err(MmuError::OverlapConflict {
				name: "second",
				existing: "first",
				space: SpaceRole::Identity
			})
		);
		assert_eq!(registry.len(), 1);
		assert_eq!(registry.regions()[0].name, "first");
	}

	#[test]
	fn spaces_are_independent() {
		let mut registry = MappingRegistry::new();
		let flags = PageTableEntryFlags::KERNEL_TEXT;

		registry
			.register("tramp", range(0x1000, 0x2000), PhysAddr::new(0x1000), flags, SpaceRole::Identity)
			.unwrap();
		registry
			.register("tramp", range(0x1000, 0x2000), PhysAddr::new(0x1000), flags, SpaceRole::Kernel)
			.unwrap();
		// adjacent ranges do not overlap
		registry
			.register("next", range(0x2000, 0x3000), PhysAddr::new(0x2000), flags, SpaceRole::Identity)
			.unwrap();

		assert_eq!(registry.in_space(SpaceRole::Identity).count(), 2);
		assert_eq!(
			registry.find(SpaceRole::Identity, VirtAddr::new(0x2fff)).map(|r| r.name),
			Some("next")
		);
		assert!(registry.find(SpaceRole::Kernel, VirtAddr::new(0x2000)).is_none());
		assert!(registry.audit().is_clean());
	}

	#[test]
	fn audit_reports_physical_aliases() {
		let mut registry = MappingRegistry::new();
		let flags = PageTableEntryFlags::KERNEL_DATA;

		registry
			.register("a", range(0x1000, 0x3000), PhysAddr::new(0x4000_0000), flags, SpaceRole::Identity)
			.unwrap();
		registry
			.register("b", range(0x8000, 0x9000), PhysAddr::new(0x4000_1000), flags, SpaceRole::Identity)
			.unwrap();

		let report = registry.audit();
		assert_eq!(
			report.conflicts(),
			&[Conflict::PhysicalAlias {
				space: SpaceRole::Identity,
				first: "a",
				second: "b"
			}]
		);
		assert_eq!(registry.audit(), report);
	}

	#[test]
	fn registry_capacity() {
		let mut registry = MappingRegistry::new();
		for i in 0..MAX_REGIONS as u64 {
			registry
				.register(
					"page",
					range(i * 0x1000, (i + 1) * 0x1000),
					PhysAddr::new(i * 0x1000),
					PageTableEntryFlags::KERNEL_DATA,
					SpaceRole::Identity,
				)
				.unwrap();
		}
		let end = MAX_REGIONS as u64 * 0x1000;
		assert_eq!(
			registry.check("more", &range(end, end + 0x1000), SpaceRole::Identity),
			Err(MmuError::RegistryFull)
		);
	}
}
