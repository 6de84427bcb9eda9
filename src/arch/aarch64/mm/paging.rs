//! Stage 1 translation tables for the 4 KiB granule and 48-bit inputs.

use core::ops::{Index, IndexMut, Range};
use core::{fmt, slice};

use crate::arch::mm::policy::{AccessPermission, MemoryAttr, Shareability};
use crate::config::{PAGE_SIZE, TABLE_ENTRIES, VA_BITS};
use crate::mm::addr::{AddrExt, PhysAddr, VirtAddr, VirtAddrExt, canonical};
use crate::mm::error::MmuError;
use crate::mm::frame::FrameStore;

/// Number of levels walked for a 4 KiB leaf.
pub const LEVELS: usize = 4;

/// Bits 12 to 47 of a descriptor.
const OUTPUT_ADDRESS_MASK: u64 = 0x0000_ffff_ffff_f000;

bitflags! {
	/// Attribute bits of a stage 1 descriptor, output address excluded.
	///
	/// See ARM Architecture Reference Manual, D8.3 "Translation table descriptor formats".
	#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
	pub struct PageTableEntryFlags: u64 {
		/// Set if this entry is valid.
		const VALID = 1 << 0;

		/// Table descriptor at levels 0 to 2, page descriptor at level 3.
		const TABLE_OR_4KIB_PAGE = 1 << 1;

		/// Index into `MAIR_EL1`.
		const ATTR_INDEX = 0b111 << 2;

		/// `AP[1]`: accessible from EL0.
		const USER_ACCESSIBLE = 1 << 6;

		/// `AP[2]`: read-only at every exception level.
		const READ_ONLY = 1 << 7;

		const SHAREABILITY = 0b11 << 8;

		/// Set if software has accessed this entry (for memory access or address translation).
		const ACCESSED = 1 << 10;

		const NOT_GLOBAL = 1 << 11;

		/// Set if code execution shall be disabled for memory referenced by this entry in privileged mode.
		const PRIVILEGED_EXECUTE_NEVER = 1 << 53;

		/// Set if code execution shall be disabled for memory referenced by this entry in unprivileged mode.
		const UNPRIVILEGED_EXECUTE_NEVER = 1 << 54;
	}
}

impl PageTableEntryFlags {
	/// Executable, read-only kernel code.
	pub const KERNEL_TEXT: Self = Self::leaf(
		MemoryAttr::Normal,
		AccessPermission::KernelReadOnly,
		Shareability::InnerShareable,
		false,
		true,
	);

	pub const KERNEL_RODATA: Self = Self::leaf(
		MemoryAttr::Normal,
		AccessPermission::KernelReadOnly,
		Shareability::InnerShareable,
		true,
		true,
	);

	pub const KERNEL_DATA: Self = Self::leaf(
		MemoryAttr::Normal,
		AccessPermission::KernelReadWrite,
		Shareability::InnerShareable,
		true,
		true,
	);

	/// Memory mapped registers.
	pub const DEVICE: Self = Self::leaf(
		MemoryAttr::DeviceNgnre,
		AccessPermission::KernelReadWrite,
		Shareability::OuterShareable,
		true,
		true,
	);

	pub const USER_TEXT: Self = Self::leaf(
		MemoryAttr::Normal,
		AccessPermission::UserReadOnly,
		Shareability::InnerShareable,
		true,
		false,
	);

	pub const USER_DATA: Self = Self::leaf(
		MemoryAttr::Normal,
		AccessPermission::UserReadWrite,
		Shareability::InnerShareable,
		true,
		true,
	);

	const fn leaf(
		attr: MemoryAttr,
		permission: AccessPermission,
		shareability: Shareability,
		privileged_execute_never: bool,
		unprivileged_execute_never: bool,
	) -> Self {
		let mut bits = (attr.index() << 2)
			| (permission.field() << 6)
			| (shareability.field() << 8)
			| Self::ACCESSED.bits();
		if privileged_execute_never {
			bits |= Self::PRIVILEGED_EXECUTE_NEVER.bits();
		}
		if unprivileged_execute_never {
			bits |= Self::UNPRIVILEGED_EXECUTE_NEVER.bits();
		}
		Self::from_bits_retain(bits)
	}

	/// The flags as stored in a leaf, without the descriptor type bits.
	///
	/// Bits outside every attribute field are dropped as well.
	pub fn attributes(self) -> Self {
		Self::from_bits_truncate(self.bits()).difference(Self::VALID | Self::TABLE_OR_4KIB_PAGE)
	}

	/// Bits that belong to no attribute field, output address bits included.
	pub fn unknown_bits(self) -> u64 {
		self.bits() & !Self::all().bits()
	}

	pub fn memory_attr(self) -> Option<MemoryAttr> {
		MemoryAttr::from_index((self & Self::ATTR_INDEX).bits() >> 2)
	}

	pub fn access_permission(self) -> AccessPermission {
		AccessPermission::from_field(self.bits() >> 6)
	}

	pub fn shareability(self) -> Shareability {
		Shareability::from_field(self.bits() >> 8)
	}

	pub fn is_privileged_executable(self) -> bool {
		!self.contains(Self::PRIVILEGED_EXECUTE_NEVER)
	}

	pub fn set_memory_attr(&mut self, attr: MemoryAttr) -> &mut Self {
		self.remove(Self::ATTR_INDEX);
		self.insert(Self::from_bits_retain(attr.index() << 2));
		self
	}

	pub fn set_shareability(&mut self, shareability: Shareability) -> &mut Self {
		self.remove(Self::SHAREABILITY);
		self.insert(Self::from_bits_retain(shareability.field() << 8));
		self
	}

	pub fn normal(&mut self) -> &mut Self {
		self.set_memory_attr(MemoryAttr::Normal)
			.set_shareability(Shareability::InnerShareable)
	}

	pub fn device(&mut self) -> &mut Self {
		self.set_memory_attr(MemoryAttr::DeviceNgnre)
			.set_shareability(Shareability::OuterShareable)
	}

	pub fn read_only(&mut self) -> &mut Self {
		self.insert(Self::READ_ONLY);
		self
	}

	pub fn writable(&mut self) -> &mut Self {
		self.remove(Self::READ_ONLY);
		self
	}

	pub fn execute_disable(&mut self) -> &mut Self {
		self.insert(Self::PRIVILEGED_EXECUTE_NEVER | Self::UNPRIVILEGED_EXECUTE_NEVER);
		self
	}
}

/// What a descriptor denotes at the level it was read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
	Invalid,
	Table,
	/// A 1 GiB or 2 MiB leaf at level 1 or 2.
	Block,
	Page,
	/// Encodings the hardware treats as a translation fault.
	Reserved,
}

/// A stage 1 translation table descriptor.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
	pub const INVALID: Self = Self(0);

	pub const fn from_raw(raw: u64) -> Self {
		Self(raw)
	}

	pub const fn raw(self) -> u64 {
		self.0
	}

	/// Descriptor pointing to the next level table stored in `next`.
	pub fn table(next: PhysAddr) -> Self {
		Self(
			(next.as_u64() & OUTPUT_ADDRESS_MASK)
				| (PageTableEntryFlags::VALID | PageTableEntryFlags::TABLE_OR_4KIB_PAGE).bits(),
		)
	}

	/// Level 3 descriptor mapping the 4 KiB frame at `frame`.
	pub fn page(frame: PhysAddr, flags: PageTableEntryFlags) -> Self {
		let flags =
			flags.attributes() | PageTableEntryFlags::VALID | PageTableEntryFlags::TABLE_OR_4KIB_PAGE;
		Self((frame.as_u64() & OUTPUT_ADDRESS_MASK) | (flags.bits() & !OUTPUT_ADDRESS_MASK))
	}

	/// Level 1 or 2 descriptor mapping a naturally aligned block.
	pub fn block(base: PhysAddr, flags: PageTableEntryFlags) -> Self {
		let flags = flags.attributes() | PageTableEntryFlags::VALID;
		Self((base.as_u64() & OUTPUT_ADDRESS_MASK) | (flags.bits() & !OUTPUT_ADDRESS_MASK))
	}

	pub const fn is_valid(self) -> bool {
		self.0 & PageTableEntryFlags::VALID.bits() != 0
	}

	pub fn output_address(self) -> PhysAddr {
		PhysAddr::new(self.0 & OUTPUT_ADDRESS_MASK)
	}

	pub fn flags(self) -> PageTableEntryFlags {
		PageTableEntryFlags::from_bits_truncate(self.0 & !OUTPUT_ADDRESS_MASK)
	}

	pub fn kind(self, level: usize) -> EntryKind {
		if !self.is_valid() {
			return EntryKind::Invalid;
		}
		let table_or_page = self.0 & PageTableEntryFlags::TABLE_OR_4KIB_PAGE.bits() != 0;
		match (level, table_or_page) {
			(0..=2, true) => EntryKind::Table,
			(3, true) => EntryKind::Page,
			(1 | 2, false) => EntryKind::Block,
			_ => EntryKind::Reserved,
		}
	}

	/// Bytes covered by a leaf at `level`.
	pub const fn leaf_size(level: usize) -> u64 {
		PAGE_SIZE << (9 * (LEVELS - 1 - level))
	}
}

impl fmt::Debug for PageTableEntry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PageTableEntry")
			.field("raw", &format_args!("{:#018x}", self.0))
			.field("output_address", &self.output_address())
			.field("flags", &self.flags())
			.finish()
	}
}

/// One translation table, 512 descriptors in a 4 KiB aligned frame.
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct PageTable {
	entries: [PageTableEntry; TABLE_ENTRIES],
}

impl PageTable {
	pub const fn new() -> Self {
		Self {
			entries: [PageTableEntry::INVALID; TABLE_ENTRIES],
		}
	}

	pub fn zero(&mut self) {
		self.entries.fill(PageTableEntry::INVALID);
	}

	pub fn is_empty(&self) -> bool {
		self.entries.iter().all(|entry| !entry.is_valid())
	}

	pub fn iter(&self) -> slice::Iter<'_, PageTableEntry> {
		self.entries.iter()
	}
}

impl Default for PageTable {
	fn default() -> Self {
		Self::new()
	}
}

impl Index<usize> for PageTable {
	type Output = PageTableEntry;

	fn index(&self, index: usize) -> &PageTableEntry {
		&self.entries[index]
	}
}

impl IndexMut<usize> for PageTable {
	fn index_mut(&mut self, index: usize) -> &mut PageTableEntry {
		&mut self.entries[index]
	}
}

/// One level of a table walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WalkStep {
	pub level: usize,
	/// Physical address of the table read at this level.
	pub table: PhysAddr,
	pub index: usize,
	pub entry: PageTableEntry,
}

impl WalkStep {
	pub fn kind(&self) -> EntryKind {
		self.entry.kind(self.level)
	}
}

/// Record of a table walk, from the root to the first non-table descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalkTrace {
	pub virt: VirtAddr,
	pub steps: heapless::Vec<WalkStep, LEVELS>,
}

impl WalkTrace {
	/// The table read at `level`, if the walk got that far.
	pub fn table(&self, level: usize) -> Option<PhysAddr> {
		self.steps.get(level).map(|step| step.table)
	}

	/// The descriptor that terminated the walk as a leaf.
	pub fn leaf(&self) -> Option<&WalkStep> {
		self.steps
			.last()
			.filter(|step| matches!(step.kind(), EntryKind::Page | EntryKind::Block))
	}

	pub fn translation(&self) -> Option<(PhysAddr, PageTableEntryFlags)> {
		let leaf = self.leaf()?;
		let offset = self.virt.as_u64() & (PageTableEntry::leaf_size(leaf.level) - 1);
		Some((
			leaf.entry.output_address() + offset,
			leaf.entry.flags().attributes(),
		))
	}
}

/// Builds and inspects translation table trees.
///
/// Tables are addressed by the physical address of their frame and are only
/// ever reached through the [`FrameStore`]. A leaf is written once; replacing
/// a valid leaf requires [`PageTableBuilder::remap_page`].
pub struct PageTableBuilder<F> {
	frames: F,
}

impl<F: FrameStore> PageTableBuilder<F> {
	pub const fn new(frames: F) -> Self {
		Self { frames }
	}

	pub fn frames(&self) -> &F {
		&self.frames
	}

	pub fn frames_mut(&mut self) -> &mut F {
		&mut self.frames
	}

	/// Allocates a frame and clears it into an empty table.
	pub fn create_table(&mut self) -> Result<PhysAddr, MmuError> {
		let frame = self.frames.alloc_frame()?;
		self.frames.table_mut(frame).zero();
		trace!("Created translation table at {frame:p}");
		Ok(frame)
	}

	fn check_page(
		virt: VirtAddr,
		phys: PhysAddr,
		flags: PageTableEntryFlags,
	) -> Result<(), MmuError> {
		if !virt.is_page_aligned() {
			return Err(MmuError::AlignmentError {
				addr: virt.as_u64(),
			});
		}
		if !phys.is_page_aligned() {
			return Err(MmuError::AlignmentError {
				addr: phys.as_u64(),
			});
		}
		if phys.as_u64() & !OUTPUT_ADDRESS_MASK != 0 {
			return Err(MmuError::InvalidRange {
				start: phys.as_u64(),
				end: phys.as_u64() + PAGE_SIZE,
			});
		}
		if flags.unknown_bits() != 0 {
			return Err(MmuError::InvalidFlags {
				bits: flags.unknown_bits(),
			});
		}
		Ok(())
	}

	/// Descends to the level 3 table covering `virt`, creating missing tables.
	fn leaf_table(&mut self, root: PhysAddr, virt: VirtAddr) -> Result<PhysAddr, MmuError> {
		let mut table = root;
		for level in 0..LEVELS - 1 {
			let index = virt.table_index(level);
			let entry = self.frames.table(table)[index];
			table = match entry.kind(level) {
				EntryKind::Table => entry.output_address(),
				EntryKind::Invalid => {
					let next = self.create_table()?;
					self.frames.table_mut(table)[index] = PageTableEntry::table(next);
					next
				}
				EntryKind::Block | EntryKind::Page | EntryKind::Reserved => {
					return Err(MmuError::AlreadyMapped {
						virt,
						existing: entry.output_address(),
					});
				}
			};
		}
		Ok(table)
	}

	/// Maps the page at `virt` to the frame at `phys`.
	///
	/// Fails with [`MmuError::AlreadyMapped`] if `virt` already has a valid
	/// translation. On failure, tables created by this call are released.
	///
	/// The descriptor type bits in `flags` are ignored, any other bit outside
	/// the attribute fields is rejected with [`MmuError::InvalidFlags`].
	pub fn map_page(
		&mut self,
		root: PhysAddr,
		virt: VirtAddr,
		phys: PhysAddr,
		flags: PageTableEntryFlags,
	) -> Result<(), MmuError> {
		Self::check_page(virt, phys, flags)?;

		let table = match self.leaf_table(root, virt) {
			Ok(table) => table,
			Err(err) => {
				self.prune(root, virt);
				return Err(err);
			}
		};

		let slot = &mut self.frames.table_mut(table)[virt.table_index(LEVELS - 1)];
		if slot.is_valid() {
			return Err(MmuError::AlreadyMapped {
				virt,
				existing: slot.output_address(),
			});
		}
		*slot = PageTableEntry::page(phys, flags);

		trace!("Mapped {virt:p} to {phys:p} with {:?}", flags.attributes());
		Ok(())
	}

	/// Maps `virt` to `phys`, replacing an existing leaf.
	///
	/// Returns the replaced descriptor.
	pub fn remap_page(
		&mut self,
		root: PhysAddr,
		virt: VirtAddr,
		phys: PhysAddr,
		flags: PageTableEntryFlags,
	) -> Result<Option<PageTableEntry>, MmuError> {
		Self::check_page(virt, phys, flags)?;

		let table = match self.leaf_table(root, virt) {
			Ok(table) => table,
			Err(err) => {
				self.prune(root, virt);
				return Err(err);
			}
		};

		let slot = &mut self.frames.table_mut(table)[virt.table_index(LEVELS - 1)];
		let previous = slot.is_valid().then_some(*slot);
		*slot = PageTableEntry::page(phys, flags);

		debug!("Remapped {virt:p} to {phys:p}, previous {previous:?}");
		Ok(previous)
	}

	/// Maps every page of `virt` to consecutive frames starting at `phys_start`.
	///
	/// Returns the number of pages mapped. If any page fails, the pages
	/// mapped by this call are removed again before the error is returned.
	pub fn map_range(
		&mut self,
		root: PhysAddr,
		virt: Range<VirtAddr>,
		phys_start: PhysAddr,
		flags: PageTableEntryFlags,
	) -> Result<usize, MmuError> {
		if virt.end < virt.start {
			return Err(MmuError::InvalidRange {
				start: virt.start.as_u64(),
				end: virt.end.as_u64(),
			});
		}
		for addr in [virt.start.as_u64(), virt.end.as_u64(), phys_start.as_u64()] {
			if addr % PAGE_SIZE != 0 {
				return Err(MmuError::AlignmentError { addr });
			}
		}

		let len = virt.end.as_u64() - virt.start.as_u64();
		if len == 0 {
			return Ok(0);
		}
		let last = canonical(virt.end.as_u64() - PAGE_SIZE)?;
		if last.is_high() != virt.start.is_high() {
			// first address past the lower half
			return Err(MmuError::NonCanonical(1 << VA_BITS));
		}
		if phys_start.checked_offset(len - PAGE_SIZE).is_none() {
			return Err(MmuError::InvalidRange {
				start: phys_start.as_u64(),
				end: phys_start.as_u64().saturating_add(len),
			});
		}

		let pages = len / PAGE_SIZE;
		for page in 0..pages {
			let offset = page * PAGE_SIZE;
			if let Err(err) = self.map_page(root, virt.start + offset, phys_start + offset, flags) {
				for mapped in (0..page).rev() {
					self.unmap_page(root, virt.start + mapped * PAGE_SIZE);
				}
				warn!(
					"Mapping {:p}..{:p} failed after {page} pages: {err}",
					virt.start, virt.end
				);
				return Err(err);
			}
		}

		trace!(
			"Mapped {:p}..{:p} to {phys_start:p} ({pages} pages)",
			virt.start, virt.end
		);
		Ok(pages as usize)
	}

	/// Clears the leaf for `virt` and releases tables left empty.
	pub(crate) fn unmap_page(&mut self, root: PhysAddr, virt: VirtAddr) {
		let trace = self.trace(root, virt);
		if let Some(leaf) = trace.leaf() {
			self.frames.table_mut(leaf.table)[leaf.index] = PageTableEntry::INVALID;
		}
		self.prune_trace(&trace);
	}

	fn prune(&mut self, root: PhysAddr, virt: VirtAddr) {
		let trace = self.trace(root, virt);
		self.prune_trace(&trace);
	}

	/// Releases empty tables on the path of `trace`, deepest first. The root stays.
	fn prune_trace(&mut self, trace: &WalkTrace) {
		for level in (1..LEVELS).rev() {
			let Some(table) = trace.table(level) else {
				continue;
			};
			if !self.frames.table(table).is_empty() {
				break;
			}
			let parent = &trace.steps[level - 1];
			self.frames.table_mut(parent.table)[parent.index] = PageTableEntry::INVALID;
			self.frames.free_frame(table);
			trace!("Released empty level {level} table at {table:p}");
		}
	}

	/// Walks from `root` towards `virt` without modifying anything.
	pub fn trace(&self, root: PhysAddr, virt: VirtAddr) -> WalkTrace {
		let mut steps = heapless::Vec::new();
		let mut table = root;
		for level in 0..LEVELS {
			let index = virt.table_index(level);
			let entry = self.frames.table(table)[index];
			let step = WalkStep {
				level,
				table,
				index,
				entry,
			};
			if steps.push(step).is_err() {
				break;
			}
			match entry.kind(level) {
				EntryKind::Table => table = entry.output_address(),
				_ => break,
			}
		}
		WalkTrace { virt, steps }
	}

	/// Resolves `virt` to its physical address and leaf attributes.
	pub fn walk(&self, root: PhysAddr, virt: VirtAddr) -> Option<(PhysAddr, PageTableEntryFlags)> {
		self.trace(root, virt).translation()
	}
}
