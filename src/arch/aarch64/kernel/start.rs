use core::fmt::Write;
use core::ops::Range;
use core::ptr;

use crate::arch::kernel::processor::{self, Aarch64Registers};
use crate::arch::kernel::serial::SerialDevice;
use crate::arch::mm::physicalmem::PhysFrames;
use crate::arch::mm::transition::{MmuTransition, TRANSITION, TransitionPlan};
use crate::arch::mm::vectors::VectorTable;
use crate::config::KERNEL_VIRT_OFFSET;
use crate::console::{self, Console, ConsoleWriter};
use crate::mm::addr::PhysAddr;
use crate::mm::layout::BootLayout;
use crate::mm::vm::KernelVm;
use crate::{logging, mm};

static mut SERIAL: SerialDevice = SerialDevice::new();

fn fatal(serial: &mut SerialDevice, what: &str, err: &dyn core::fmt::Display) -> ! {
	write!(ConsoleWriter(serial), "{what}: {err}\n").ok();
	processor::halt()
}

/// Maps `layout`, enables translation and continues in `entry` at its kernel alias.
///
/// Never returns. Any failure is reported on the serial port and stops the core.
///
/// # Safety
///
/// Must be called once, on the boot core at EL1 with translation off. `pool`
/// must be unused RAM inside `layout.ram` and outside the kernel image. This
/// function and its caller must be linked into the trampoline section and the
/// stack must be part of `layout.image.data`.
pub unsafe fn bring_up(
	layout: &BootLayout,
	pool: Range<PhysAddr>,
	vectors: &'static [u8],
	entry: extern "C" fn() -> !,
) -> ! {
	// SAFETY: only the boot core gets here, before anything else uses the console.
	console::init(unsafe { &mut *ptr::addr_of_mut!(SERIAL) });
	logging::init();

	let mut serial = SerialDevice::new();
	serial.write_line("MMU: mapping boot layout");

	let frames = match unsafe { PhysFrames::new(pool) } {
		Ok(frames) => frames,
		Err(err) => fatal(&mut serial, "frame pool", &err),
	};
	let mut vm = match KernelVm::new(frames) {
		Ok(vm) => vm,
		Err(err) => fatal(&mut serial, "root tables", &err),
	};
	if let Err(err) = vm.map_boot_layout(layout) {
		fatal(&mut serial, "boot layout", &err);
	}

	vm.print_information();

	let entry = entry as usize as u64;
	let entry = if entry < KERNEL_VIRT_OFFSET {
		entry + KERNEL_VIRT_OFFSET
	} else {
		entry
	};
	debug!("Continuing at {entry:#x} after bring-up");

	let mut cpu = unsafe { Aarch64Registers::new() };
	let plan = TransitionPlan {
		trampoline: layout.image.trampoline.clone(),
		vectors: VectorTable::new(vectors, layout.vectors),
	};
	// SAFETY: the trampoline, the image and the stack are mapped in both spaces by
	// `map_boot_layout`.
	let engine = match unsafe { MmuTransition::begin(&mut cpu, &mut vm, &mut serial, &TRANSITION, plan) } {
		Ok(engine) => engine,
		Err(halted) => {
			error!("{halted}");
			processor::halt()
		}
	};

	// runs on the kernel alias, with identity addresses gone once it succeeded
	engine.run(move |steady| {
		// the engine has written the diagnosis already
		let Ok(steady) = steady else {
			processor::halt()
		};
		// SAFETY: the frame owning `vm` never returns, nothing else reads it
		let vm = unsafe { ptr::read(steady.into_vm()) };
		if mm::install(vm).is_err() {
			SerialDevice::new().write_line("MMU: kernel VM already installed");
			processor::halt();
		}

		// SAFETY: the kernel alias maps the same code as the identity address.
		let entry: extern "C" fn() -> ! = unsafe { core::mem::transmute(entry as usize) };
		entry()
	})
}
