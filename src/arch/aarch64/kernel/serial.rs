use core::arch::asm;
use core::convert::Infallible;

use embedded_io::{ErrorType, Write};

use crate::config::{KERNEL_VIRT_OFFSET, UART_PHYS};
use crate::console::Console;

/// The PL011 data register, written without any flow control.
pub struct SerialDevice {
	phys: u64,
}

impl SerialDevice {
	pub const fn new() -> Self {
		Self::with_base(UART_PHYS)
	}

	pub const fn with_base(phys: u64) -> Self {
		Self { phys }
	}

	/// Physical address while translation is off, the kernel alias afterwards.
	fn port(&self) -> *mut u8 {
		let addr = if crate::mm::is_translation_enabled() {
			self.phys + KERNEL_VIRT_OFFSET
		} else {
			self.phys
		};
		core::ptr::with_exposed_provenance_mut::<u8>(addr as usize)
	}
}

impl Default for SerialDevice {
	fn default() -> Self {
		Self::new()
	}
}

impl ErrorType for SerialDevice {
	type Error = Infallible;
}

impl Write for SerialDevice {
	fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
		let port = self.port();
		for &byte in buf {
			// LF newline characters need to be extended to CRLF over a real serial port.
			if byte == b'\n' {
				unsafe {
					asm!(
						"strb w8, [{port}]",
						port = in(reg) port,
						in("x8") b'\r',
						options(nostack),
					);
				}
			}

			unsafe {
				asm!(
					"strb w8, [{port}]",
					port = in(reg) port,
					in("x8") byte,
					options(nostack),
				);
			}
		}

		Ok(buf.len())
	}

	fn flush(&mut self) -> Result<(), Self::Error> {
		Ok(())
	}
}

impl Console for SerialDevice {
	fn write_str(&mut self, s: &str) {
		let Ok(()) = self.write_all(s.as_bytes());
	}
}
