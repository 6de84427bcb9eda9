//! Translation table construction and MMU bring-up for AArch64 kernels.
//!
//! The kernel starts with translation off, executing at physical addresses.
//! [`mm::vm::KernelVm`] builds two translation table trees: an identity space
//! for `TTBR0_EL1` in which every virtual address equals its physical
//! address, and a kernel space for `TTBR1_EL1` at [`config::KERNEL_VIRT_OFFSET`].
//! [`arch::mm::transition::MmuTransition`] then programs the MMU step by step,
//! moves execution to the kernel space and stops walks of the identity space.

#![no_std]
#![feature(never_type)]

#[cfg(not(target_os = "none"))]
#[macro_use]
extern crate std;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

#[macro_use]
pub mod logging;

pub mod arch;
pub mod config;
pub mod console;
pub mod mm;

pub use crate::arch::mm::paging::PageTableEntryFlags;
pub use crate::arch::mm::transition::{Halted, TransitionError, TransitionState};
pub use crate::mm::addr::{PhysAddr, VirtAddr};
pub use crate::mm::error::MmuError;
pub use crate::mm::space::SpaceRole;
pub use crate::mm::{get_kernel_root, is_translation_enabled, register_region, translate};
