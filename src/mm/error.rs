use thiserror::Error;

use crate::mm::addr::{PhysAddr, VirtAddr};
use crate::mm::space::SpaceRole;

/// Errors reported by the page table builder and the mapping registry.
///
/// All of them leave the tables and the registry in the state they had
/// before the failing call.
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmuError {
	#[error("out of page frames")]
	AllocationExhausted,
	#[error("address {addr:#x} is not page aligned")]
	AlignmentError { addr: u64 },
	#[error("virtual address {0:#x} is not canonical")]
	NonCanonical(u64),
	#[error("physical address {phys:p} has no alias in the {space} space")]
	NoAlias { phys: PhysAddr, space: SpaceRole },
	#[error("virtual address {virt:p} does not belong to the {space} space")]
	OutsideSpace { virt: VirtAddr, space: SpaceRole },
	#[error("empty or reversed range {start:#x}..{end:#x}")]
	InvalidRange { start: u64, end: u64 },
	#[error("descriptor bits {bits:#x} are not leaf attributes")]
	InvalidFlags { bits: u64 },
	#[error("{virt:p} is already mapped to {existing:p}")]
	AlreadyMapped { virt: VirtAddr, existing: PhysAddr },
	#[error("region `{name}` overlaps `{existing}` in the {space} space")]
	OverlapConflict {
		name: &'static str,
		existing: &'static str,
		space: SpaceRole,
	},
	#[error("range {start:#x}..{end:#x} splits into more than {max} pieces")]
	TooFragmented { start: u64, end: u64, max: usize },
	#[error("mapping registry is full")]
	RegistryFull,
	#[error("no kernel address space is installed")]
	NotInstalled,
}
