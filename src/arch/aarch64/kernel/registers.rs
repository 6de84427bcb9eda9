//! The slice of the EL1 system register file used by the MMU bring-up.

use core::fmt;

/// System registers the transition engine reads and writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SystemRegister {
	Mair,
	Tcr,
	Ttbr0,
	Ttbr1,
	Sctlr,
	Vbar,
	Daif,
}

impl SystemRegister {
	/// Dump order for diagnostics.
	pub const ALL: [Self; 7] = [
		Self::Mair,
		Self::Tcr,
		Self::Ttbr0,
		Self::Ttbr1,
		Self::Sctlr,
		Self::Vbar,
		Self::Daif,
	];

	pub const fn name(self) -> &'static str {
		match self {
			Self::Mair => "MAIR_EL1",
			Self::Tcr => "TCR_EL1",
			Self::Ttbr0 => "TTBR0_EL1",
			Self::Ttbr1 => "TTBR1_EL1",
			Self::Sctlr => "SCTLR_EL1",
			Self::Vbar => "VBAR_EL1",
			Self::Daif => "DAIF",
		}
	}
}

impl fmt::Display for SystemRegister {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

/// Shareability domain of a data synchronization barrier.
///
/// TLB maintenance during bring-up is local to the executing core. Table
/// updates made afterwards are published to the inner shareable domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierDomain {
	/// `dsb sy`
	FullSystem,
	/// `dsb nsh`
	NonShareable,
	/// `dsb ishst`, waits for stores only.
	InnerShareableStore,
}

/// Entry point reached through [`MmuRegisters::branch_to_alias`].
///
/// Receives the context pointer, moved to its alias.
pub type AliasContinuation = extern "C-unwind" fn(*mut ()) -> !;

/// Privileged CPU state needed to turn on translation.
///
/// Implementations must not reorder operations: every call retires before
/// the next one is issued.
pub trait MmuRegisters {
	fn read(&self, register: SystemRegister) -> u64;

	/// Writes `register`. Callers synchronize with [`MmuRegisters::instruction_barrier`].
	fn write(&mut self, register: SystemRegister, value: u64);

	fn data_barrier(&mut self, domain: BarrierDomain);

	fn instruction_barrier(&mut self);

	/// Invalidates all stage 1 EL1 entries of this core's TLB.
	fn invalidate_tlb_local(&mut self);

	/// Address of the instruction currently executing.
	fn program_counter(&self) -> u64;

	fn stack_pointer(&self) -> u64;

	/// Masks debug, SError, IRQ and FIQ exceptions.
	fn mask_interrupts(&mut self);

	/// Abandons the current call chain and calls `continuation` at its alias
	/// `offset` bytes higher, on the same stack moved by `offset`.
	///
	/// `context` is passed on moved by `offset` as well. The frame chain is
	/// cut: the continuation has no caller to return to.
	///
	/// # Safety
	///
	/// `this` must be valid and not otherwise borrowed. Translation must be
	/// enabled and the code, the stack and everything reachable from
	/// `context` must be mapped at both the current addresses and the
	/// addresses `offset` bytes higher, with identical contents.
	unsafe fn branch_to_alias(
		this: *mut Self,
		offset: u64,
		continuation: AliasContinuation,
		context: *mut (),
	) -> !
	where
		Self: Sized;
}
