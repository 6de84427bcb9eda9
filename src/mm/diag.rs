//! Read-only introspection of translation tables.

use core::fmt;

use crate::arch::mm::paging::{EntryKind, PageTableEntry, PageTableEntryFlags, WalkTrace};
use crate::mm::addr::{PhysAddr, VirtAddr};
use crate::mm::space::SpaceRole;

/// Human readable view of one descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PteSummary {
	pub entry: PageTableEntry,
	pub level: usize,
}

/// Describes `entry` as read at `level`.
pub fn decode(entry: PageTableEntry, level: usize) -> PteSummary {
	PteSummary { entry, level }
}

impl PteSummary {
	/// Compact form: valid, table/page, user, read-only, access flag, PXN, UXN.
	pub fn letters(&self) -> [u8; 7] {
		let flags = self.entry.flags();
		let pick = |flag: PageTableEntryFlags, set: u8| {
			if flags.contains(flag) { set } else { b'-' }
		};
		[
			pick(PageTableEntryFlags::VALID, b'V'),
			pick(PageTableEntryFlags::TABLE_OR_4KIB_PAGE, b'T'),
			pick(PageTableEntryFlags::USER_ACCESSIBLE, b'U'),
			pick(PageTableEntryFlags::READ_ONLY, b'R'),
			pick(PageTableEntryFlags::ACCESSED, b'A'),
			pick(PageTableEntryFlags::PRIVILEGED_EXECUTE_NEVER, b'P'),
			pick(PageTableEntryFlags::UNPRIVILEGED_EXECUTE_NEVER, b'X'),
		]
	}
}

impl fmt::Display for PteSummary {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let letters = self.letters();
		let letters = core::str::from_utf8(&letters).map_err(|_| fmt::Error)?;
		write!(f, "{:#018x} [{letters}]", self.entry.raw())?;

		let kind = self.entry.kind(self.level);
		match kind {
			EntryKind::Invalid => return f.write_str(" invalid"),
			EntryKind::Reserved => return f.write_str(" reserved"),
			EntryKind::Table => {
				return write!(f, " table -> {:#x}", self.entry.output_address().as_u64());
			}
			EntryKind::Page | EntryKind::Block => {}
		}

		let flags = self.entry.flags();
		let name = if kind == EntryKind::Page { "page" } else { "block" };
		write!(f, " {name} -> {:#x}", self.entry.output_address().as_u64())?;
		let attr = flags.memory_attr();
		match attr {
			Some(attr) => write!(f, " attr={}({attr})", attr.index())?,
			None => write!(f, " attr={}(?)", (flags & PageTableEntryFlags::ATTR_INDEX).bits() >> 2)?,
		}
		write!(
			f,
			" ap={} sh={}",
			flags.access_permission().name(),
			flags.shareability().name()
		)?;
		if flags.contains(PageTableEntryFlags::NOT_GLOBAL) {
			f.write_str(" ng")?;
		}
		// speculative instruction fetches must never reach device memory
		if attr.is_some_and(|attr| attr.is_device()) && flags.is_privileged_executable() {
			f.write_str(" executable-device")?;
		}
		Ok(())
	}
}

/// Outcome of walking one address, level by level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalkReport {
	pub space: SpaceRole,
	pub root: PhysAddr,
	pub trace: WalkTrace,
}

impl WalkReport {
	pub fn virt(&self) -> VirtAddr {
		self.trace.virt
	}

	pub fn translation(&self) -> Option<(PhysAddr, PageTableEntryFlags)> {
		self.trace.translation()
	}
}

impl fmt::Display for WalkReport {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(
			f,
			"walk {:#x} in {} space (root {:#x})",
			self.trace.virt.as_u64(),
			self.space,
			self.root.as_u64()
		)?;
		for step in &self.trace.steps {
			writeln!(
				f,
				"  L{} {:#x}[{:3}] {}",
				step.level,
				step.table.as_u64(),
				step.index,
				decode(step.entry, step.level)
			)?;
		}
		match self.translation() {
			Some((phys, _)) => writeln!(f, "  => {:#x}", phys.as_u64()),
			None => writeln!(f, "  => translation fault"),
		}
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use std::string::ToString;

	use super::*;

	#[test]
	fn decodes_leaf() {
		let entry = PageTableEntry::page(PhysAddr::new(0x4000_0000), PageTableEntryFlags::KERNEL_TEXT);
		assert_eq!(
			decode(entry, 3).to_string(),
			"0x0040000040000787 [VT-RA-X] page -> 0x40000000 attr=1(Normal WB) ap=kernel-ro sh=inner"
		);
	}

	#[test]
	fn decodes_device_and_table() {
		let device = PageTableEntry::page(PhysAddr::new(0x0900_0000), PageTableEntryFlags::DEVICE);
		assert_eq!(
			decode(device, 3).to_string(),
			"0x006000000900060f [VT--APX] page -> 0x9000000 attr=3(Device-nGnRE) ap=kernel-rw sh=outer"
		);

		let mut flags = PageTableEntryFlags::DEVICE;
		flags.remove(PageTableEntryFlags::PRIVILEGED_EXECUTE_NEVER);
		let executable = PageTableEntry::page(PhysAddr::new(0x0900_0000), flags);
		assert!(
			decode(executable, 3)
				.to_string()
				.ends_with("sh=outer executable-device")
		);

		let table = PageTableEntry::table(PhysAddr::new(0x4010_2000));
		assert_eq!(
			decode(table, 0).to_string(),
			"0x0000000040102003 [VT-----] table -> 0x40102000"
		);
		assert_eq!(
			decode(PageTableEntry::INVALID, 2).to_string(),
			"0x0000000000000000 [-------] invalid"
		);
	}
}
