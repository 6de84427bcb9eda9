//! The ordered sequence that turns on stage 1 translation.
//!
//! ```text
//! INIT -> MAIR_PROGRAMMED -> TCR_BOOTSTRAP_DUAL -> BASES_LOADED -> TLB_CLEAN
//!      -> TRANSLATION_ON -> PC_MIGRATED -> TCR_KERNEL_ONLY -> STEADY
//! ```
//!
//! Each step consumes the [`MmuTransition`] of the previous phase, so the
//! steps can only be taken in this order and only once. The process-wide
//! [`TransitionCell`] mirrors the phase for code that cannot see the
//! typestate, such as the console and [`crate::mm::is_translation_enabled`].
//!
//! Every register write is read back. Any failure dumps the register file,
//! both roots and the mapping audit to the console, freezes the cell in
//! [`TransitionState::Halted`] and returns [`Halted`]. There are no retries.
//!
//! The move to the kernel alias does not return to the caller. The engine
//! continues in a new call chain on the kernel alias and hands its result
//! to a continuation. Once TTBR0 walks are off, nothing that holds a link
//! time address may be used: no formatting, no logging, no trait objects.

use core::fmt::{self, Write};
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ops::Range;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use thiserror::Error;

use crate::arch::kernel::registers::{BarrierDomain, MmuRegisters, SystemRegister};
use crate::arch::mm::paging::PageTableEntryFlags;
use crate::arch::mm::policy::{
	DAIF_MASK_ALL, MAIR_EL1_VALUE, SCTLR_MMU_ENABLE, TranslationControl,
};
use crate::arch::mm::vectors::{VectorFault, VectorTable};
use crate::config::{KERNEL_VIRT_OFFSET, PAGE_SIZE};
use crate::console::{Console, ConsoleWriter};
use crate::mm::addr::{PhysAddr, VirtAddr, canonical};
use crate::mm::error::MmuError;
use crate::mm::frame::FrameStore;
use crate::mm::space::{SpaceRole, WalkState};
use crate::mm::vm::KernelVm;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransitionState {
	Init = 0,
	MairProgrammed = 1,
	TcrBootstrapDual = 2,
	BasesLoaded = 3,
	TlbClean = 4,
	TranslationOn = 5,
	PcMigrated = 6,
	TcrKernelOnly = 7,
	Steady = 8,
	Halted = 9,
}

impl TransitionState {
	const fn from_u8(value: u8) -> Self {
		match value {
			0 => Self::Init,
			1 => Self::MairProgrammed,
			2 => Self::TcrBootstrapDual,
			3 => Self::BasesLoaded,
			4 => Self::TlbClean,
			5 => Self::TranslationOn,
			6 => Self::PcMigrated,
			7 => Self::TcrKernelOnly,
			8 => Self::Steady,
			_ => Self::Halted,
		}
	}

	/// The only state this one may advance to.
	pub const fn next(self) -> Option<Self> {
		match self {
			Self::Init => Some(Self::MairProgrammed),
			Self::MairProgrammed => Some(Self::TcrBootstrapDual),
			Self::TcrBootstrapDual => Some(Self::BasesLoaded),
			Self::BasesLoaded => Some(Self::TlbClean),
			Self::TlbClean => Some(Self::TranslationOn),
			Self::TranslationOn => Some(Self::PcMigrated),
			Self::PcMigrated => Some(Self::TcrKernelOnly),
			Self::TcrKernelOnly => Some(Self::Steady),
			Self::Steady | Self::Halted => None,
		}
	}

	pub const fn name(self) -> &'static str {
		match self {
			Self::Init => "INIT",
			Self::MairProgrammed => "MAIR_PROGRAMMED",
			Self::TcrBootstrapDual => "TCR_BOOTSTRAP_DUAL",
			Self::BasesLoaded => "BASES_LOADED",
			Self::TlbClean => "TLB_CLEAN",
			Self::TranslationOn => "TRANSLATION_ON",
			Self::PcMigrated => "PC_MIGRATED",
			Self::TcrKernelOnly => "TCR_KERNEL_ONLY",
			Self::Steady => "STEADY",
			Self::Halted => "HALTED",
		}
	}
}

impl fmt::Display for TransitionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

/// Single, forward-only record of the bring-up phase.
pub struct TransitionCell {
	state: AtomicU8,
	claimed: AtomicBool,
	translation: AtomicBool,
}

impl TransitionCell {
	pub const fn new() -> Self {
		Self {
			state: AtomicU8::new(TransitionState::Init as u8),
			claimed: AtomicBool::new(false),
			translation: AtomicBool::new(false),
		}
	}

	pub fn state(&self) -> TransitionState {
		TransitionState::from_u8(self.state.load(Ordering::Acquire))
	}

	pub fn is_translation_enabled(&self) -> bool {
		self.translation.load(Ordering::Acquire)
	}

	/// Hands the cell to exactly one engine.
	fn claim(&self) -> bool {
		self.state() == TransitionState::Init
			&& self
				.claimed
				.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
				.is_ok()
	}

	/// Moves from `from` to its successor `to`. Fails for anything else.
	fn advance(&self, from: TransitionState, to: TransitionState) -> bool {
		if from.next() != Some(to) {
			return false;
		}
		let advanced = self
			.state
			.compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
			.is_ok();
		if advanced && to == TransitionState::TranslationOn {
			self.translation.store(true, Ordering::Release);
		}
		advanced
	}

	/// Freezes the cell unless bring-up already completed.
	fn halt(&self) {
		self.state
			.fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
				(state != TransitionState::Steady as u8).then_some(TransitionState::Halted as u8)
			})
			.ok();
	}
}

impl Default for TransitionCell {
	fn default() -> Self {
		Self::new()
	}
}

/// The phase of the MMU bring-up on this core.
pub static TRANSITION: TransitionCell = TransitionCell::new();

#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionError {
	#[error("{register} reads back {actual:#x}, expected {expected:#x}")]
	RegisterVerificationFailed {
		register: SystemRegister,
		expected: u64,
		actual: u64,
	},
	#[error("trampoline page {phys:p} is not mapped executable at {virt:p} in the {space} space")]
	DualMappingMissing {
		phys: PhysAddr,
		virt: VirtAddr,
		space: SpaceRole,
	},
	#[error("trampoline page {phys:p} has different attributes in the two spaces")]
	DualMappingMismatch { phys: PhysAddr },
	#[error("program counter {pc:#x} is outside the trampoline")]
	ProgramCounterOutsideTrampoline { pc: u64 },
	#[error("program counter {pc:#x} does not run from the kernel space")]
	ProgramCounterNotMigrated { pc: u64 },
	#[error("stack pointer {sp:#x} is not in the kernel space")]
	StackNotMigrated { sp: u64 },
	#[error("vector table: {0}")]
	VectorTableInvalid(VectorFault),
	#[error("mapping audit found {count} conflicts")]
	AuditFailed { count: usize },
	#[error("bring-up is already in state {0}")]
	OutOfOrder(TransitionState),
	#[error(transparent)]
	Mapping(#[from] MmuError),
}

impl TransitionError {
	/// Whether the hardware or the tables were found in a state other than programmed.
	pub fn is_verification_failure(&self) -> bool {
		matches!(
			self,
			Self::RegisterVerificationFailed { .. }
				| Self::DualMappingMissing { .. }
				| Self::DualMappingMismatch { .. }
				| Self::ProgramCounterOutsideTrampoline { .. }
				| Self::ProgramCounterNotMigrated { .. }
				| Self::StackNotMigrated { .. }
				| Self::VectorTableInvalid(_)
				| Self::AuditFailed { .. }
		)
	}
}

/// Bring-up stopped. The core must not continue.
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
#[error("MMU bring-up halted after {state}: {error}")]
pub struct Halted {
	/// The last state that was reached.
	pub state: TransitionState,
	pub error: TransitionError,
}

/// Writes `register`, synchronizes and compares the value read back.
pub(crate) fn write_verified<R: MmuRegisters + ?Sized>(
	cpu: &mut R,
	register: SystemRegister,
	value: u64,
) -> Result<(), TransitionError> {
	cpu.write(register, value);
	cpu.instruction_barrier();
	let actual = cpu.read(register);
	if actual != value {
		return Err(TransitionError::RegisterVerificationFailed {
			register,
			expected: value,
			actual,
		});
	}
	trace!("{register} = {value:#x}");
	Ok(())
}

/// `dsb sy; tlbi vmalle1; dsb nsh; isb`
fn invalidate_tlb_local<R: MmuRegisters + ?Sized>(cpu: &mut R) {
	cpu.data_barrier(BarrierDomain::FullSystem);
	cpu.invalidate_tlb_local();
	cpu.data_barrier(BarrierDomain::NonShareable);
	cpu.instruction_barrier();
}

pub mod phase {
	//! Typestate markers, one per [`TransitionState`](super::TransitionState).

	pub struct Init;
	pub struct MairProgrammed;
	pub struct TcrBootstrapDual;
	pub struct BasesLoaded;
	pub struct TlbClean;
	pub struct TranslationOn;
	pub struct PcMigrated;
	pub struct TcrKernelOnly;
	pub struct Steady;
}

/// A typestate marker.
pub trait Phase: private::Sealed {
	const STATE: TransitionState;
}

mod private {
	pub trait Sealed {}
}

macro_rules! phases {
	($($marker:ident => $state:ident),+ $(,)?) => {
		$(
			impl private::Sealed for phase::$marker {}

			impl Phase for phase::$marker {
				const STATE: TransitionState = TransitionState::$state;
			}
		)+
	};
}

phases! {
	Init => Init,
	MairProgrammed => MairProgrammed,
	TcrBootstrapDual => TcrBootstrapDual,
	BasesLoaded => BasesLoaded,
	TlbClean => TlbClean,
	TranslationOn => TranslationOn,
	PcMigrated => PcMigrated,
	TcrKernelOnly => TcrKernelOnly,
	Steady => Steady,
}

/// What the engine needs to know besides the page tables.
#[derive(Clone, Debug)]
pub struct TransitionPlan<'a> {
	/// The code running while translation is switched on.
	pub trampoline: Range<PhysAddr>,
	pub vectors: VectorTable<'a>,
}

/// `ptr` moved to the kernel alias of what it points to, unless it is there already.
fn to_alias<T: ?Sized>(ptr: *const T, moved: bool) -> *const T {
	if moved && (ptr.addr() as u64) < KERNEL_VIRT_OFFSET {
		ptr.wrapping_byte_add(KERNEL_VIRT_OFFSET as usize)
	} else {
		ptr
	}
}

/// Exclusive handle on the MMU during bring-up, in phase `S`.
pub struct MmuTransition<'a, S, R, F, C> {
	cpu: &'a mut R,
	vm: &'a mut KernelVm<F>,
	console: &'a mut C,
	cell: &'a TransitionCell,
	plan: TransitionPlan<'a>,
	phase: PhantomData<S>,
}

impl<'a, S: Phase, R: MmuRegisters, F: FrameStore, C: Console> MmuTransition<'a, S, R, F, C> {
	pub fn state(&self) -> TransitionState {
		S::STATE
	}

	pub fn vm(&self) -> &KernelVm<F> {
		self.vm
	}

	fn into_phase<N: Phase>(self) -> MmuTransition<'a, N, R, F, C> {
		MmuTransition {
			cpu: self.cpu,
			vm: self.vm,
			console: self.console,
			cell: self.cell,
			plan: self.plan,
			phase: PhantomData,
		}
	}

	/// Runs `action` and moves to phase `N` if it succeeds.
	fn step<N: Phase>(
		mut self,
		action: impl FnOnce(&mut Self) -> Result<(), TransitionError>,
	) -> Result<MmuTransition<'a, N, R, F, C>, Halted> {
		if let Err(error) = action(&mut self) {
			return Err(self.fail(error));
		}
		if !self.cell.advance(S::STATE, N::STATE) {
			let error = TransitionError::OutOfOrder(self.cell.state());
			return Err(self.fail(error));
		}

		self.console.write_str("MMU: ");
		self.console.write_line(N::STATE.name());
		debug!("MMU transition {} -> {}", S::STATE, N::STATE);
		Ok(self.into_phase())
	}

	fn fail(mut self, error: TransitionError) -> Halted {
		error!("MMU bring-up failed after {}: {error}", S::STATE);
		self.dump(&error);
		self.cell.halt();
		Halted {
			state: S::STATE,
			error,
		}
	}

	/// Writes everything needed to diagnose a failed bring-up to the console.
	///
	/// Without identity walks, only the raw register file and the roots are
	/// written.
	fn dump(&mut self, error: &TransitionError) {
		let formatted = self.vm.space(SpaceRole::Identity).walk_state() != WalkState::Disabled;
		let console = &mut *self.console;
		console.write_str("MMU: HALT after ");
		console.write_line(S::STATE.name());
		if formatted {
			write!(ConsoleWriter(&mut *console), "MMU: {error}\n").ok();
		}

		for register in SystemRegister::ALL {
			console.write_str("MMU: ");
			console.write_str(register.name());
			console.write_str(" = ");
			console.write_hex(self.cpu.read(register));
			console.write_str("\n");
		}
		for role in SpaceRole::ALL {
			console.write_str("MMU: ");
			console.write_str(role.name());
			console.write_str(" root = ");
			console.write_hex(self.vm.base_of(role).as_u64());
			console.write_str("\n");
		}
		if !formatted {
			return;
		}
		if let Ok(pc) = canonical(self.cpu.program_counter()) {
			let report = self.vm.walk_and_report(SpaceRole::of(pc), pc);
			write!(ConsoleWriter(&mut *console), "{report}").ok();
		}
		write!(ConsoleWriter(&mut *console), "{}", self.vm.audit()).ok();
	}

	/// Every trampoline page must be an executable leaf at its identity
	/// address and at its kernel alias, backed by the same frame and with
	/// identical attributes.
	fn check_dual_mapping(&self) -> Result<(), TransitionError> {
		let trampoline = &self.plan.trampoline;
		let mut phys = PhysAddr::new(trampoline.start.as_u64() & !(PAGE_SIZE - 1));
		while phys < trampoline.end {
			let mut resolved = [None; 2];
			for (slot, role) in resolved.iter_mut().zip(SpaceRole::ALL) {
				let virt = role.alias_of(phys)?;
				match self.vm.walk(role, virt) {
					Some((frame, flags)) if frame == phys && flags.is_privileged_executable() => {
						*slot = Some(flags);
					}
					_ => {
						return Err(TransitionError::DualMappingMissing {
							phys,
							virt,
							space: role,
						});
					}
				}
			}
			if resolved[0] != resolved[1] {
				return Err(TransitionError::DualMappingMismatch { phys });
			}
			phys = phys + PAGE_SIZE;
		}
		Ok(())
	}

	/// Whether `addr` is a kernel space alias, mapped onto the frame it aliases.
	fn is_kernel_alias(&self, addr: u64, accept: impl Fn(PageTableEntryFlags) -> bool) -> bool {
		let Ok(virt) = canonical(addr) else {
			return false;
		};
		SpaceRole::of(virt) == SpaceRole::Kernel
			&& matches!(
				self.vm.walk(SpaceRole::Kernel, virt),
				Some((phys, flags))
					if phys.as_u64() == addr.wrapping_sub(KERNEL_VIRT_OFFSET) && accept(flags)
			)
	}

	/// The program counter and the stack must be kernel space aliases of the
	/// frames they started in.
	fn check_migrated(&self) -> Result<(), TransitionError> {
		let pc = self.cpu.program_counter();
		if !self.is_kernel_alias(pc, |flags| flags.is_privileged_executable()) {
			return Err(TransitionError::ProgramCounterNotMigrated { pc });
		}
		// the stack grows down, the byte below `sp` is the next one written
		let sp = self.cpu.stack_pointer();
		if !self.is_kernel_alias(sp.wrapping_sub(1), |flags| {
			flags.access_permission().is_writable()
		}) {
			return Err(TransitionError::StackNotMigrated { sp });
		}
		Ok(())
	}
}

impl<'a, R: MmuRegisters, F: FrameStore, C: Console> MmuTransition<'a, phase::Init, R, F, C> {
	/// Takes over the MMU: masks interrupts and installs the vector table at
	/// its physical address.
	///
	/// # Safety
	///
	/// Everything the caller executes or touches until the kernel runs from
	/// its alias, including its stack, must be mapped in both spaces by `vm`.
	pub unsafe fn begin(
		cpu: &'a mut R,
		vm: &'a mut KernelVm<F>,
		console: &'a mut C,
		cell: &'a TransitionCell,
		plan: TransitionPlan<'a>,
	) -> Result<Self, Halted> {
		if !cell.claim() {
			return Err(Halted {
				state: cell.state(),
				error: TransitionError::OutOfOrder(cell.state()),
			});
		}

		let engine = Self {
			cpu,
			vm,
			console,
			cell,
			plan,
			phase: PhantomData,
		};

		engine.cpu.mask_interrupts();
		let daif = engine.cpu.read(SystemRegister::Daif);
		if daif & DAIF_MASK_ALL != DAIF_MASK_ALL {
			let error = TransitionError::RegisterVerificationFailed {
				register: SystemRegister::Daif,
				expected: daif | DAIF_MASK_ALL,
				actual: daif,
			};
			return Err(engine.fail(error));
		}

		let vectors = engine.plan.vectors;
		if let Err(error) = vectors.install_physical(engine.cpu, engine.vm) {
			return Err(engine.fail(error));
		}

		engine.console.write_line("MMU: INIT");
		info!(
			"Enabling MMU: identity root {:p}, kernel root {:p}",
			engine.vm.base_of(SpaceRole::Identity),
			engine.vm.base_of(SpaceRole::Kernel)
		);
		Ok(engine)
	}

	pub fn program_mair(
		self,
	) -> Result<MmuTransition<'a, phase::MairProgrammed, R, F, C>, Halted> {
		self.step(|t| write_verified(t.cpu, SystemRegister::Mair, MAIR_EL1_VALUE))
	}

	/// Drives the whole sequence and calls `then` with the outcome.
	///
	/// Never returns: from [`TransitionState::TranslationOn`] on, the engine
	/// runs on the kernel alias in a call chain of its own.
	pub fn run<T>(self, then: T) -> !
	where
		T: FnOnce(Result<MmuTransition<'a, phase::Steady, R, F, C>, Halted>) -> !,
	{
		let translating = self
			.program_mair()
			.and_then(MmuTransition::configure_dual_walks)
			.and_then(MmuTransition::load_bases)
			.and_then(MmuTransition::invalidate_tlb)
			.and_then(MmuTransition::enable_translation);
		match translating {
			Ok(engine) => engine.migrate_pc(|migrated| {
				then(
					migrated
						.and_then(MmuTransition::narrow_to_kernel)
						.and_then(MmuTransition::finish),
				)
			}),
			Err(halted) => then(Err(halted)),
		}
	}
}

impl<'a, R: MmuRegisters, F: FrameStore, C: Console> MmuTransition<'a, phase::MairProgrammed, R, F, C> {
	/// Both TTBR0 and TTBR1 walk, with 48-bit inputs and the 4 KiB granule.
	pub fn configure_dual_walks(
		self,
	) -> Result<MmuTransition<'a, phase::TcrBootstrapDual, R, F, C>, Halted> {
		self.step(|t| {
			write_verified(
				t.cpu,
				SystemRegister::Tcr,
				TranslationControl::BOOTSTRAP_DUAL.bits(),
			)?;
			for role in SpaceRole::ALL {
				t.vm.set_walk_state(role, WalkState::Walking);
			}
			Ok(())
		})
	}
}

impl<'a, R: MmuRegisters, F: FrameStore, C: Console> MmuTransition<'a, phase::TcrBootstrapDual, R, F, C> {
	pub fn load_bases(self) -> Result<MmuTransition<'a, phase::BasesLoaded, R, F, C>, Halted> {
		self.step(|t| {
			for (role, register) in [
				(SpaceRole::Identity, SystemRegister::Ttbr0),
				(SpaceRole::Kernel, SystemRegister::Ttbr1),
			] {
				let base = t.vm.base_of(role);
				if base.as_u64() % PAGE_SIZE != 0 {
					return Err(MmuError::AlignmentError {
						addr: base.as_u64(),
					}
					.into());
				}
				write_verified(t.cpu, register, base.as_u64())?;
			}
			Ok(())
		})
	}
}

impl<'a, R: MmuRegisters, F: FrameStore, C: Console> MmuTransition<'a, phase::BasesLoaded, R, F, C> {
	pub fn invalidate_tlb(self) -> Result<MmuTransition<'a, phase::TlbClean, R, F, C>, Halted> {
		self.step(|t| {
			invalidate_tlb_local(t.cpu);
			Ok(())
		})
	}
}

impl<'a, R: MmuRegisters, F: FrameStore, C: Console> MmuTransition<'a, phase::TlbClean, R, F, C> {
	/// Sets `SCTLR_EL1.M` once the tables are known to keep the trampoline reachable.
	pub fn enable_translation(
		self,
	) -> Result<MmuTransition<'a, phase::TranslationOn, R, F, C>, Halted> {
		self.step(|t| {
			let audit = t.vm.audit();
			if !audit.is_clean() {
				return Err(TransitionError::AuditFailed {
					count: audit.count(),
				});
			}

			t.check_dual_mapping()?;

			let pc = t.cpu.program_counter();
			let trampoline = &t.plan.trampoline;
			if !(trampoline.start.as_u64()..trampoline.end.as_u64()).contains(&pc) {
				return Err(TransitionError::ProgramCounterOutsideTrampoline { pc });
			}

			let vbar = t.cpu.read(SystemRegister::Vbar);
			let executable = canonical(vbar)
				.ok()
				.and_then(|vbar| t.vm.walk(SpaceRole::Identity, vbar))
				.is_some_and(|(_, flags)| flags.is_privileged_executable());
			if !executable {
				return Err(TransitionError::VectorTableInvalid(
					VectorFault::NotExecutable(vbar),
				));
			}

			let sctlr = t.cpu.read(SystemRegister::Sctlr);
			write_verified(t.cpu, SystemRegister::Sctlr, sctlr | SCTLR_MMU_ENABLE)
		})
	}
}

/// Code that continues on the kernel alias after [`MmuRegisters::branch_to_alias`].
trait Resume {
	/// # Safety
	///
	/// Must run on the kernel alias if `moved`, with everything `self`
	/// references mapped at both addresses.
	unsafe fn resume(self, moved: bool) -> !;
}

extern "C-unwind" fn resume_at_alias<H: Resume>(context: *mut ()) -> ! {
	let moved = context.addr() as u64 >= KERNEL_VIRT_OFFSET;
	// SAFETY: `context` is the handoff left behind by `migrate_pc`, whose
	// frame never runs again
	let handoff = unsafe { context.cast::<H>().read() };
	// SAFETY: `branch_to_alias` moved the context along with the program counter
	unsafe { handoff.resume(moved) }
}

/// The engine and the continuation, carried across the branch to the alias.
struct Handoff<E, T> {
	engine: E,
	then: T,
}

impl<'a, R, F, C, T> Resume for Handoff<MmuTransition<'a, phase::TranslationOn, R, F, C>, T>
where
	R: MmuRegisters,
	F: FrameStore,
	C: Console,
	T: FnOnce(Result<MmuTransition<'a, phase::PcMigrated, R, F, C>, Halted>) -> !,
{
	unsafe fn resume(self, moved: bool) -> ! {
		// SAFETY: the caller guarantees both aliases of every reference are mapped
		let engine = unsafe { self.engine.rebased(moved) };
		(self.then)(engine.step(|t| t.check_migrated()))
	}
}

impl<'a, R: MmuRegisters, F: FrameStore, C: Console> MmuTransition<'a, phase::TranslationOn, R, F, C> {
	/// The same engine, referring to everything through the kernel alias if `moved`.
	///
	/// # Safety
	///
	/// Every object the engine refers to must be mapped at its kernel alias.
	unsafe fn rebased(self, moved: bool) -> Self {
		let image = to_alias(ptr::from_ref(self.plan.vectors.image()), moved);
		// SAFETY: the aliases map the same frames as the original references
		unsafe {
			Self {
				cpu: &mut *to_alias(ptr::from_mut(self.cpu), moved).cast_mut(),
				vm: &mut *to_alias(ptr::from_mut(self.vm), moved).cast_mut(),
				console: &mut *to_alias(ptr::from_mut(self.console), moved).cast_mut(),
				cell: &*to_alias(ptr::from_ref(self.cell), moved),
				plan: TransitionPlan {
					trampoline: self.plan.trampoline,
					vectors: VectorTable::new(&*image, self.plan.vectors.phys()),
				},
				phase: PhantomData,
			}
		}
	}

	/// Continues execution at the kernel space alias of the trampoline.
	///
	/// Never returns. The engine, now referring to everything through the
	/// kernel alias, is handed to `then` in a new call chain, in phase
	/// [`TransitionState::PcMigrated`] if the program counter and the stack
	/// moved.
	pub fn migrate_pc<T>(self, then: T) -> !
	where
		T: FnOnce(Result<MmuTransition<'a, phase::PcMigrated, R, F, C>, Halted>) -> !,
	{
		let mut handoff = ManuallyDrop::new(Handoff { engine: self, then });
		let cpu = ptr::from_mut::<R>(handoff.engine.cpu);
		let context = ptr::from_mut::<Handoff<Self, T>>(&mut handoff).cast::<()>();
		// SAFETY: `begin` requires the code and the stack to be mapped in both
		// spaces and translation is on. The handoff is read exactly once, by
		// `resume_at_alias`.
		unsafe {
			R::branch_to_alias(
				cpu,
				KERNEL_VIRT_OFFSET,
				resume_at_alias::<Handoff<Self, T>>,
				context,
			)
		}
	}
}

impl<'a, R: MmuRegisters, F: FrameStore, C: Console> MmuTransition<'a, phase::PcMigrated, R, F, C> {
	/// Stops TTBR0 walks. The vector table moves to its alias first.
	pub fn narrow_to_kernel(
		self,
	) -> Result<MmuTransition<'a, phase::TcrKernelOnly, R, F, C>, Halted> {
		self.step(|t| {
			t.check_migrated()?;
			let vectors = t.plan.vectors;
			vectors.repoint_virtual(t.cpu, t.vm)?;

			// identity addresses are unusable from here on, even if the write fails
			t.vm.set_walk_state(SpaceRole::Identity, WalkState::Disabled);
			crate::logging::disable();
			write_verified(
				t.cpu,
				SystemRegister::Tcr,
				TranslationControl::KERNEL_ONLY.bits(),
			)?;
			invalidate_tlb_local(t.cpu);
			Ok(())
		})
	}
}

impl<'a, R: MmuRegisters, F: FrameStore, C: Console> MmuTransition<'a, phase::TcrKernelOnly, R, F, C> {
	pub fn finish(self) -> Result<MmuTransition<'a, phase::Steady, R, F, C>, Halted> {
		self.step(|_| Ok(()))
	}
}

impl<'a, R: MmuRegisters, F: FrameStore, C: Console> MmuTransition<'a, phase::Steady, R, F, C> {
	/// Releases the registers and the console, keeping the tables.
	pub fn into_vm(self) -> &'a mut KernelVm<F> {
		self.vm
	}
}
