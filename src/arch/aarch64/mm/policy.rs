//! Register values the MMU is brought up with.

use core::fmt;

use crate::config::VA_BITS;

/// Memory attribute slots programmed into `MAIR_EL1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemoryAttr {
	/// Device-nGnRnE, strongly ordered.
	DeviceNgnrne = 0,
	/// Normal, inner and outer write-back, read/write allocate.
	Normal = 1,
	/// Normal, inner and outer non-cacheable.
	NormalNonCacheable = 2,
	/// Device-nGnRE, early write acknowledgement.
	DeviceNgnre = 3,
}

impl MemoryAttr {
	pub const ALL: [Self; 4] = [
		Self::DeviceNgnrne,
		Self::Normal,
		Self::NormalNonCacheable,
		Self::DeviceNgnre,
	];

	pub const fn index(self) -> u64 {
		self as u64
	}

	pub const fn from_index(index: u64) -> Option<Self> {
		match index {
			0 => Some(Self::DeviceNgnrne),
			1 => Some(Self::Normal),
			2 => Some(Self::NormalNonCacheable),
			3 => Some(Self::DeviceNgnre),
			_ => None,
		}
	}

	/// The attribute byte stored in this slot of `MAIR_EL1`.
	pub const fn encoding(self) -> u64 {
		match self {
			Self::DeviceNgnrne => 0x00,
			Self::Normal => 0xff,
			Self::NormalNonCacheable => 0x44,
			Self::DeviceNgnre => 0x04,
		}
	}

	pub const fn is_device(self) -> bool {
		matches!(self, Self::DeviceNgnrne | Self::DeviceNgnre)
	}

	pub const fn name(self) -> &'static str {
		match self {
			Self::DeviceNgnrne => "Device-nGnRnE",
			Self::Normal => "Normal WB",
			Self::NormalNonCacheable => "Normal NC",
			Self::DeviceNgnre => "Device-nGnRE",
		}
	}
}

impl fmt::Display for MemoryAttr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

/// `AP[2:1]` of a stage 1 descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessPermission {
	KernelReadWrite,
	UserReadWrite,
	KernelReadOnly,
	UserReadOnly,
}

impl AccessPermission {
	/// Field value, to be shifted into bits 6 and 7.
	pub const fn field(self) -> u64 {
		match self {
			Self::KernelReadWrite => 0b00,
			Self::UserReadWrite => 0b01,
			Self::KernelReadOnly => 0b10,
			Self::UserReadOnly => 0b11,
		}
	}

	pub const fn from_field(field: u64) -> Self {
		match field & 0b11 {
			0b00 => Self::KernelReadWrite,
			0b01 => Self::UserReadWrite,
			0b10 => Self::KernelReadOnly,
			_ => Self::UserReadOnly,
		}
	}

	pub const fn is_writable(self) -> bool {
		matches!(self, Self::KernelReadWrite | Self::UserReadWrite)
	}

	pub const fn name(self) -> &'static str {
		match self {
			Self::KernelReadWrite => "kernel-rw",
			Self::UserReadWrite => "user-rw",
			Self::KernelReadOnly => "kernel-ro",
			Self::UserReadOnly => "user-ro",
		}
	}
}

/// `SH[1:0]` of a stage 1 descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Shareability {
	NonShareable,
	OuterShareable,
	InnerShareable,
}

impl Shareability {
	pub const fn field(self) -> u64 {
		match self {
			Self::NonShareable => 0b00,
			Self::OuterShareable => 0b10,
			Self::InnerShareable => 0b11,
		}
	}

	/// The reserved encoding `0b01` reads as non-shareable.
	pub const fn from_field(field: u64) -> Self {
		match field & 0b11 {
			0b10 => Self::OuterShareable,
			0b11 => Self::InnerShareable,
			_ => Self::NonShareable,
		}
	}

	pub const fn name(self) -> &'static str {
		match self {
			Self::NonShareable => "non",
			Self::OuterShareable => "outer",
			Self::InnerShareable => "inner",
		}
	}
}

/// Value of `MAIR_EL1`, one byte per [`MemoryAttr`] slot.
pub const MAIR_EL1_VALUE: u64 = MemoryAttr::DeviceNgnrne.encoding()
	| (MemoryAttr::Normal.encoding() << 8)
	| (MemoryAttr::NormalNonCacheable.encoding() << 16)
	| (MemoryAttr::DeviceNgnre.encoding() << 24);

bitflags! {
	/// Fields of `TCR_EL1` touched during bring-up.
	///
	/// A 4 KiB TTBR0 granule is encoded as `TG0 = 0b00` and has no flag.
	#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
	pub struct TranslationControl: u64 {
		const T0SZ = 0x3f;
		/// Disables table walks through TTBR0.
		const EPD0 = 1 << 7;
		const IRGN0_WBWA = 0b01 << 8;
		const ORGN0_WBWA = 0b01 << 10;
		const SH0_INNER = 0b11 << 12;
		const T1SZ = 0x3f << 16;
		/// Disables table walks through TTBR1.
		const EPD1 = 1 << 23;
		const IRGN1_WBWA = 0b01 << 24;
		const ORGN1_WBWA = 0b01 << 26;
		const SH1_INNER = 0b11 << 28;
		/// TTBR1 uses a different encoding than TTBR0 for the 4 KiB granule.
		const TG1_4KIB = 0b10 << 30;
		const IPS_40BIT = 0b010 << 32;
	}
}

impl TranslationControl {
	const TXSZ: u64 = 64 - VA_BITS;

	/// Both TTBR0 and TTBR1 perform walks.
	pub const BOOTSTRAP_DUAL: Self = Self::from_bits_retain(
		Self::TXSZ
			| (Self::TXSZ << 16)
			| Self::IRGN0_WBWA.bits()
			| Self::ORGN0_WBWA.bits()
			| Self::SH0_INNER.bits()
			| Self::IRGN1_WBWA.bits()
			| Self::ORGN1_WBWA.bits()
			| Self::SH1_INNER.bits()
			| Self::TG1_4KIB.bits()
			| Self::IPS_40BIT.bits(),
	);

	/// Only TTBR1 performs walks; identity addresses fault.
	pub const KERNEL_ONLY: Self =
		Self::from_bits_retain(Self::BOOTSTRAP_DUAL.bits() | Self::EPD0.bits());

	pub const fn walks_ttbr0(self) -> bool {
		self.bits() & Self::EPD0.bits() == 0
	}

	pub const fn walks_ttbr1(self) -> bool {
		self.bits() & Self::EPD1.bits() == 0
	}
}

/// `SCTLR_EL1.M`, the stage 1 enable bit.
pub const SCTLR_MMU_ENABLE: u64 = 1 << 0;

/// `DAIF` with debug, SError, IRQ and FIQ masked.
pub const DAIF_MASK_ALL: u64 = 0b1111 << 6;

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn mair_layout() {
		assert_eq!(MAIR_EL1_VALUE, 0x0444_ff00);
		for attr in MemoryAttr::ALL {
			let byte = (MAIR_EL1_VALUE >> (8 * attr.index())) & 0xff;
			assert_eq!(byte, attr.encoding());
			assert_eq!(MemoryAttr::from_index(attr.index()), Some(attr));
		}
		assert_eq!(MemoryAttr::from_index(4), None);
	}

	#[test]
	fn tcr_values() {
		assert_eq!(TranslationControl::BOOTSTRAP_DUAL.bits(), 0x0000_0002_b510_3510);
		assert_eq!(TranslationControl::KERNEL_ONLY.bits(), 0x0000_0002_b510_3590);
		assert!(TranslationControl::BOOTSTRAP_DUAL.walks_ttbr0());
		assert!(TranslationControl::BOOTSTRAP_DUAL.walks_ttbr1());
		assert!(!TranslationControl::KERNEL_ONLY.walks_ttbr0());
		assert!(TranslationControl::KERNEL_ONLY.walks_ttbr1());
	}

	#[test]
	fn permission_fields() {
		for ap in [
			AccessPermission::KernelReadWrite,
			AccessPermission::UserReadWrite,
			AccessPermission::KernelReadOnly,
			AccessPermission::UserReadOnly,
		] {
			assert_eq!(AccessPermission::from_field(ap.field()), ap);
		}
		assert_eq!(Shareability::from_field(0b01), Shareability::NonShareable);
	}
}
