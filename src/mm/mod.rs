pub mod addr;
pub mod diag;
pub mod error;
pub mod frame;
pub mod layout;
pub mod registry;
pub mod space;
pub mod vm;

use core::ops::Range;
use core::sync::atomic::{AtomicU64, Ordering};

use hermit_sync::SpinMutex;

use self::addr::{PhysAddr, VirtAddr};
use self::error::MmuError;
use self::space::SpaceRole;
use self::vm::KernelVm;
use crate::arch::mm::paging::PageTableEntryFlags;
use crate::arch::mm::physicalmem::PhysFrames;
use crate::arch::mm::transition::TRANSITION;

/// The page tables the kernel runs on once bring-up completed.
static KERNEL_VM: SpinMutex<Option<KernelVm<PhysFrames>>> = SpinMutex::new(None);

/// `TTBR1_EL1` of the installed kernel VM, zero before.
static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

/// Makes `vm` the kernel VM. Returns it back if one is installed already.
pub fn install(vm: KernelVm<PhysFrames>) -> Result<(), KernelVm<PhysFrames>> {
	let mut guard = KERNEL_VM.lock();
	if guard.is_some() {
		return Err(vm);
	}
	KERNEL_ROOT.store(vm.base_of(SpaceRole::Kernel).as_u64(), Ordering::Release);
	*guard = Some(vm);
	Ok(())
}

/// Root of the kernel address space.
pub fn get_kernel_root() -> Option<PhysAddr> {
	match KERNEL_ROOT.load(Ordering::Acquire) {
		0 => None,
		root => Some(PhysAddr::new(root)),
	}
}

/// Translates `virt` through the installed tables.
///
/// Identity addresses stop translating once TTBR0 walks are disabled.
pub fn translate(virt: VirtAddr) -> Option<PhysAddr> {
	KERNEL_VM.lock().as_ref()?.translate(virt)
}

pub fn is_translation_enabled() -> bool {
	TRANSITION.is_translation_enabled()
}

/// Maps and records a region after bring-up, with the same overlap check as during boot.
///
/// With translation on, the new descriptors are visible to the table walker
/// when this returns.
pub fn register_region(
	name: &'static str,
	space: SpaceRole,
	virt: Range<VirtAddr>,
	phys_start: PhysAddr,
	flags: PageTableEntryFlags,
) -> Result<(), MmuError> {
	let mut guard = KERNEL_VM.lock();
	let vm = guard.as_mut().ok_or(MmuError::NotInstalled)?;
	#[cfg(all(target_arch = "aarch64", target_os = "none"))]
	if is_translation_enabled() {
		// SAFETY: only barriers are issued, under the lock of the tables
		let mut cpu = unsafe { crate::arch::kernel::processor::Aarch64Registers::new() };
		return vm.register_live_region(&mut cpu, name, space, virt, phys_start, flags);
	}
	vm.register_region(name, space, virt, phys_start, flags)
}

pub fn print_information() {
	if let Some(vm) = KERNEL_VM.lock().as_ref() {
		vm.print_information();
	}
}
