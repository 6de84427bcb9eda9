//! Exception vector table placement.
//!
//! The table is copied to a fixed physical location before translation is
//! enabled and `VBAR_EL1` is pointed at it. Once the kernel runs from its
//! high alias, `VBAR_EL1` is moved to the kernel space alias of the same
//! frame.

use thiserror::Error;

use crate::arch::kernel::registers::{MmuRegisters, SystemRegister};
use crate::arch::mm::transition::{TransitionError, write_verified};
use crate::config::VECTOR_TABLE_SIZE;
use crate::mm::addr::{PhysAddr, VirtAddr};
use crate::mm::error::MmuError;
use crate::mm::frame::FrameStore;
use crate::mm::space::SpaceRole;
use crate::mm::vm::KernelVm;

/// `VBAR_EL1` ignores the low 11 bits.
const VECTOR_TABLE_ALIGN: u64 = 0x800;

/// Bytes compared per chunk when reading the copy back.
const CHUNK: usize = 64;

#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum VectorFault {
	#[error("image is {len:#x} bytes, expected 0x800")]
	WrongSize { len: usize },
	#[error("{0:p} is not 2 KiB aligned")]
	Misaligned(PhysAddr),
	#[error("first word {0:#010x} is not a branch")]
	NotABranch(u32),
	#[error("copy differs at offset {0:#x}")]
	CopyMismatch(usize),
	#[error("{0:#x} is not mapped executable")]
	NotExecutable(u64),
}

/// `B <label>`, the only instruction a vector slot may start with here.
pub const fn is_branch(word: u32) -> bool {
	word & 0xfc00_0000 == 0x1400_0000
}

/// A vector table image and its physical home.
#[derive(Clone, Copy, Debug)]
pub struct VectorTable<'a> {
	image: &'a [u8],
	phys: PhysAddr,
}

impl<'a> VectorTable<'a> {
	pub const fn new(image: &'a [u8], phys: PhysAddr) -> Self {
		Self { image, phys }
	}

	pub fn phys(&self) -> PhysAddr {
		self.phys
	}

	pub fn image(&self) -> &'a [u8] {
		self.image
	}

	/// The address the table is reached at once the kernel runs from its alias.
	pub fn alias(&self) -> Result<VirtAddr, MmuError> {
		SpaceRole::Kernel.alias_of(self.phys)
	}

	fn first_word(bytes: &[u8]) -> u32 {
		let mut word = [0; 4];
		word.copy_from_slice(&bytes[..4]);
		u32::from_le_bytes(word)
	}

	pub fn validate(&self) -> Result<(), VectorFault> {
		if self.image.len() as u64 != VECTOR_TABLE_SIZE {
			return Err(VectorFault::WrongSize {
				len: self.image.len(),
			});
		}
		if self.phys.as_u64() % VECTOR_TABLE_ALIGN != 0 {
			return Err(VectorFault::Misaligned(self.phys));
		}
		let word = Self::first_word(self.image);
		if !is_branch(word) {
			return Err(VectorFault::NotABranch(word));
		}
		Ok(())
	}

	/// Copies the image to its physical home and reads the copy back.
	fn copy<F: FrameStore>(&self, vm: &mut KernelVm<F>) -> Result<(), VectorFault> {
		let frames = vm.frames_mut();
		frames.write_bytes(self.phys, self.image);

		let mut buf = [0u8; CHUNK];
		for (i, expected) in self.image.chunks(CHUNK).enumerate() {
			let offset = i * CHUNK;
			let copied = &mut buf[..expected.len()];
			frames.read_bytes(self.phys + offset as u64, copied);
			if let Some(pos) = copied.iter().zip(expected).position(|(a, b)| a != b) {
				return Err(VectorFault::CopyMismatch(offset + pos));
			}
		}

		let mut word = [0u8; 4];
		frames.read_bytes(self.phys, &mut word);
		let word = u32::from_le_bytes(word);
		if !is_branch(word) {
			return Err(VectorFault::NotABranch(word));
		}
		Ok(())
	}

	/// Installs the table at its physical address, with translation still off.
	pub fn install_physical<R, F>(&self, cpu: &mut R, vm: &mut KernelVm<F>) -> Result<(), TransitionError>
	where
		R: MmuRegisters + ?Sized,
		F: FrameStore,
	{
		self.validate().map_err(TransitionError::VectorTableInvalid)?;
		self.copy(vm).map_err(TransitionError::VectorTableInvalid)?;
		write_verified(cpu, SystemRegister::Vbar, self.phys.as_u64())?;
		debug!("Vector table installed at {:p}", self.phys);
		Ok(())
	}

	/// Moves `VBAR_EL1` to the kernel space alias of the table.
	pub fn repoint_virtual<R, F>(&self, cpu: &mut R, vm: &KernelVm<F>) -> Result<(), TransitionError>
	where
		R: MmuRegisters + ?Sized,
		F: FrameStore,
	{
		let alias = self.alias()?;
		match vm.walk(SpaceRole::Kernel, alias) {
			Some((frame, flags)) if frame == self.phys && flags.is_privileged_executable() => {}
			_ => {
				return Err(TransitionError::VectorTableInvalid(
					VectorFault::NotExecutable(alias.as_u64()),
				));
			}
		}
		write_verified(cpu, SystemRegister::Vbar, alias.as_u64())?;
		debug!("Vector table moved to {alias:p}");
		Ok(())
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;
	use crate::arch::mm::paging::PageTableEntryFlags;
	use crate::mm::frame::PhysMemory;
	use crate::mm::test::{SimulatedCpu, TestFrames, VECTOR_IMAGE};

	fn phys() -> PhysAddr {
		PhysAddr::new(0x47ff_f000)
	}

	#[test]
	fn branch_detection() {
		assert!(is_branch(0x1400_0000));
		assert!(is_branch(0x17ff_ffff));
		assert!(!is_branch(0x9400_0000)); // bl
		assert!(!is_branch(0xd503_201f)); // nop
	}

	#[test]
	fn rejects_bad_images() {
		let short = VectorTable::new(&VECTOR_IMAGE[..0x400], phys());
		assert_eq!(short.validate(), Err(VectorFault::WrongSize { len: 0x400 }));

		let misplaced = VectorTable::new(&VECTOR_IMAGE, PhysAddr::new(0x47ff_f400));
		assert_eq!(
			misplaced.validate(),
			Err(VectorFault::Misaligned(PhysAddr::new(0x47ff_f400)))
		);

		let zeros = [0u8; 0x800];
		assert_eq!(
			VectorTable::new(&zeros, phys()).validate(),
			Err(VectorFault::NotABranch(0))
		);
	}

	#[test]
	fn install_copies_and_points_vbar() {
		let mut vm = KernelVm::new(TestFrames::new()).unwrap();
		let mut cpu = SimulatedCpu::new(0);
		let table = VectorTable::new(&VECTOR_IMAGE, phys());

		table.install_physical(&mut cpu, &mut vm).unwrap();

		let mut copy = [0u8; 0x800];
		vm.builder().frames().read_bytes(phys(), &mut copy);
		assert_eq!(copy, VECTOR_IMAGE);
		assert_eq!(cpu.read(SystemRegister::Vbar), phys().as_u64());
	}

	#[test]
	fn alias_must_be_executable() {
		let mut vm = KernelVm::new(TestFrames::new()).unwrap();
		let mut cpu = SimulatedCpu::new(0);
		let table = VectorTable::new(&VECTOR_IMAGE, phys());

		vm.map_dual("vectors", phys()..phys() + 0x1000u64, PageTableEntryFlags::KERNEL_DATA)
			.unwrap();
		assert_eq!(
			table.repoint_virtual(&mut cpu, &vm),
			Err(TransitionError::VectorTableInvalid(VectorFault::NotExecutable(
				0xffff_8000_47ff_f000
			)))
		);
		assert_eq!(cpu.read(SystemRegister::Vbar), 0);
	}
}
