use core::arch::asm;

use aarch64_cpu::asm::barrier;
use aarch64_cpu::registers::*;

use crate::arch::kernel::registers::{
	AliasContinuation, BarrierDomain, MmuRegisters, SystemRegister,
};

/// The EL1 system registers of the executing core.
pub struct Aarch64Registers {
	_private: (),
}

impl Aarch64Registers {
	/// # Safety
	///
	/// The caller must run at EL1 and be the only code touching the MMU
	/// registers of this core for the lifetime of the value.
	pub unsafe fn new() -> Self {
		Self { _private: () }
	}
}

impl MmuRegisters for Aarch64Registers {
	fn read(&self, register: SystemRegister) -> u64 {
		match register {
			SystemRegister::Mair => MAIR_EL1.get(),
			SystemRegister::Tcr => TCR_EL1.get(),
			SystemRegister::Ttbr0 => TTBR0_EL1.get(),
			SystemRegister::Ttbr1 => TTBR1_EL1.get(),
			SystemRegister::Sctlr => SCTLR_EL1.get(),
			SystemRegister::Vbar => VBAR_EL1.get(),
			SystemRegister::Daif => DAIF.get(),
		}
	}

	fn write(&mut self, register: SystemRegister, value: u64) {
		match register {
			SystemRegister::Mair => MAIR_EL1.set(value),
			SystemRegister::Tcr => TCR_EL1.set(value),
			SystemRegister::Ttbr0 => TTBR0_EL1.set(value),
			SystemRegister::Ttbr1 => TTBR1_EL1.set(value),
			SystemRegister::Sctlr => SCTLR_EL1.set(value),
			SystemRegister::Vbar => VBAR_EL1.set(value),
			SystemRegister::Daif => DAIF.set(value),
		}
	}

	fn data_barrier(&mut self, domain: BarrierDomain) {
		match domain {
			BarrierDomain::FullSystem => barrier::dsb(barrier::SY),
			BarrierDomain::NonShareable => barrier::dsb(barrier::NSH),
			BarrierDomain::InnerShareableStore => barrier::dsb(barrier::ISHST),
		}
	}

	fn instruction_barrier(&mut self) {
		barrier::isb(barrier::SY);
	}

	fn invalidate_tlb_local(&mut self) {
		unsafe {
			asm!("tlbi vmalle1", options(nostack, preserves_flags));
		}
	}

	#[inline(always)]
	fn program_counter(&self) -> u64 {
		let pc: u64;
		unsafe {
			asm!("adr {}, .", out(reg) pc, options(nomem, nostack, preserves_flags));
		}
		pc
	}

	#[inline(always)]
	fn stack_pointer(&self) -> u64 {
		let sp: u64;
		unsafe {
			asm!("mov {}, sp", out(reg) sp, options(nomem, nostack, preserves_flags));
		}
		sp
	}

	fn mask_interrupts(&mut self) {
		unsafe {
			asm!("msr daifset, #0xf", options(nomem, nostack, preserves_flags));
		}
	}

	unsafe fn branch_to_alias(
		_this: *mut Self,
		offset: u64,
		continuation: AliasContinuation,
		context: *mut (),
	) -> ! {
		// The frame pointer is cleared and the link register points at a
		// halt loop, so nothing unwinds into the identity frames.
		unsafe {
			asm!(
				"add sp, sp, x2",
				"mov x29, xzr",
				"adr x30, 2f",
				"add x30, x30, x2",
				"add x0, x0, x2",
				"add x1, x1, x2",
				"br x1",
				"2:",
				"wfe",
				"b 2b",
				in("x0") context,
				in("x1") continuation,
				in("x2") offset,
				options(noreturn),
			);
		}
	}
}

/// Stops this core for good.
pub fn halt() -> ! {
	loop {
		aarch64_cpu::asm::wfe();
	}
}
