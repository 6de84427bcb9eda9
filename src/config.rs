/// Translation granule.
pub const PAGE_SIZE: u64 = 0x1000;

/// Number of descriptors per translation table.
pub const TABLE_ENTRIES: usize = 512;

/// Width of both the TTBR0 and the TTBR1 input address range.
pub const VA_BITS: u64 = 48;

/// Lowest address walked through TTBR1.
pub const KERNEL_SPACE_START: u64 = !((1 << VA_BITS) - 1);

/// Added to a physical address to obtain its kernel-space alias.
pub const KERNEL_VIRT_OFFSET: u64 = 0xffff_8000_0000_0000;

/// PL011 UART on the QEMU `virt` machine.
pub const UART_PHYS: u64 = 0x0900_0000;

/// Default RAM window on the QEMU `virt` machine.
pub const RAM_START: u64 = 0x4000_0000;
pub const RAM_END: u64 = 0x4800_0000;

/// Fixed physical home of the exception vector table, the last page of RAM.
pub const VECTOR_TABLE_PHYS: u64 = RAM_END - PAGE_SIZE;

/// 16 vectors of 128 bytes.
pub const VECTOR_TABLE_SIZE: u64 = 0x800;

/// Capacity of the mapping registry.
pub const MAX_REGIONS: usize = 64;

/// Capacity of an audit report.
pub const MAX_AUDIT_CONFLICTS: usize = 32;
