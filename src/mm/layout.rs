//! Physical memory layout the kernel is mapped from.

use core::ops::Range;

use align_address::Align;

use crate::config::{
	PAGE_SIZE, RAM_END, RAM_START, UART_PHYS, VECTOR_TABLE_PHYS, VECTOR_TABLE_SIZE,
};
use crate::mm::addr::PhysAddr;
use crate::mm::error::MmuError;

/// Upper bound on the pieces [`subtract`] produces.
pub const MAX_PIECES: usize = 8;

/// Sections of the loaded kernel image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelImage {
	pub text: Range<PhysAddr>,
	/// The code that enables translation and jumps to the kernel alias, inside `text`.
	pub trampoline: Range<PhysAddr>,
	pub rodata: Range<PhysAddr>,
	/// Data, bss and the boot stack.
	pub data: Range<PhysAddr>,
}

impl KernelImage {
	pub fn start(&self) -> PhysAddr {
		self.text.start.min(self.rodata.start).min(self.data.start)
	}

	pub fn end(&self) -> PhysAddr {
		self.text.end.max(self.rodata.end).max(self.data.end)
	}
}

/// Everything that gets mapped before translation is turned on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootLayout {
	pub image: KernelImage,
	pub vectors: PhysAddr,
	pub uart: PhysAddr,
	pub ram: Range<PhysAddr>,
	/// Additional memory needed at its physical address until the kernel
	/// runs from its alias, such as the device tree blob.
	pub identity_extra: Option<Range<PhysAddr>>,
}

impl BootLayout {
	/// The QEMU `virt` machine with `image` loaded into RAM.
	pub fn qemu_virt(image: KernelImage) -> Self {
		Self {
			image,
			vectors: PhysAddr::new(VECTOR_TABLE_PHYS),
			uart: PhysAddr::new(UART_PHYS),
			ram: PhysAddr::new(RAM_START)..PhysAddr::new(RAM_END),
			identity_extra: None,
		}
	}

	/// The pages holding the vector table.
	pub fn vector_pages(&self) -> Range<PhysAddr> {
		page_span(self.vectors..self.vectors + VECTOR_TABLE_SIZE)
	}

	pub fn uart_pages(&self) -> Range<PhysAddr> {
		page_span(self.uart..self.uart + 1u64)
	}
}

/// Rounds `range` outwards to page boundaries.
pub fn page_span(range: Range<PhysAddr>) -> Range<PhysAddr> {
	PhysAddr::new(range.start.as_u64().align_down(PAGE_SIZE))
		..PhysAddr::new(range.end.as_u64().align_up(PAGE_SIZE))
}

/// The parts of `range` not covered by any of `holes`, in ascending order.
///
/// Fails instead of dropping pieces beyond [`MAX_PIECES`].
pub fn subtract(
	range: Range<u64>,
	holes: &[Range<u64>],
) -> Result<heapless::Vec<Range<u64>, MAX_PIECES>, MmuError> {
	let fragmented = MmuError::TooFragmented {
		start: range.start,
		end: range.end,
		max: MAX_PIECES,
	};
	let mut pieces = heapless::Vec::<Range<u64>, MAX_PIECES>::new();
	pieces.push(range).map_err(|_| fragmented)?;

	for hole in holes {
		let mut next = heapless::Vec::<Range<u64>, MAX_PIECES>::new();
		for piece in &pieces {
			if hole.end <= piece.start || piece.end <= hole.start {
				next.push(piece.clone()).map_err(|_| fragmented)?;
				continue;
			}
			if piece.start < hole.start {
				next.push(piece.start..hole.start).map_err(|_| fragmented)?;
			}
			if hole.end < piece.end {
				next.push(hole.end..piece.end).map_err(|_| fragmented)?;
			}
		}
		pieces = next;
	}
	Ok(pieces)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn holes_split_ranges() {
		let pieces =
			subtract(0x1000..0x9000, &[0x2000..0x3000, 0x8000..0xa000, 0x0..0x1000]).unwrap();
		assert_eq!(pieces.as_slice(), &[0x1000..0x2000, 0x3000..0x8000]);

		let pieces = subtract(0x1000..0x2000, &[0x0..0x3000]).unwrap();
		assert!(pieces.is_empty());
	}

	#[test]
	fn too_many_pieces_is_an_error() {
		let holes: [Range<u64>; MAX_PIECES] =
			core::array::from_fn(|i| (2 * i as u64 + 1) * 0x1000..(2 * i as u64 + 2) * 0x1000);

		// seven holes leave eight pieces
		let pieces = subtract(0..0x10000, &holes[..MAX_PIECES - 1]).unwrap();
		assert_eq!(pieces.len(), MAX_PIECES);

		assert_eq!(
			subtract(0..0x11000, &holes),
			Err(MmuError::TooFragmented {
				start: 0,
				end: 0x11000,
				max: MAX_PIECES
			})
		);
	}

	#[test]
	fn vectors_occupy_one_page() {
		let image = KernelImage {
			text: PhysAddr::new(0x4008_0000)..PhysAddr::new(0x4009_0000),
			trampoline: PhysAddr::new(0x4008_0000)..PhysAddr::new(0x4008_1000),
			rodata: PhysAddr::new(0x4009_0000)..PhysAddr::new(0x4009_4000),
			data: PhysAddr::new(0x4009_4000)..PhysAddr::new(0x400a_0000),
		};
		let layout = BootLayout::qemu_virt(image);

		assert_eq!(
			layout.vector_pages(),
			PhysAddr::new(0x47ff_f000)..PhysAddr::new(0x4800_0000)
		);
		assert_eq!(
			layout.uart_pages(),
			PhysAddr::new(0x0900_0000)..PhysAddr::new(0x0900_1000)
		);
		assert_eq!(layout.image.start(), PhysAddr::new(0x4008_0000));
		assert_eq!(layout.image.end(), PhysAddr::new(0x400a_0000));
	}
}
