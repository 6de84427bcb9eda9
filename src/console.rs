use core::fmt;

use hermit_sync::SpinMutex;

/// Raw character output used before anything else is available.
///
/// Writes are fire-and-forget. The boot path must be able to report a
/// failure even when the output device itself is misbehaving.
pub trait Console {
	fn write_str(&mut self, s: &str);

	fn write_line(&mut self, s: &str) {
		self.write_str(s);
		self.write_str("\n");
	}

	/// Writes `value` as `0x` followed by 16 hex digits, without formatting machinery.
	fn write_hex(&mut self, value: u64) {
		const DIGITS: &[u8; 16] = b"0123456789abcdef";

		let mut buf = [0u8; 18];
		buf[0] = b'0';
		buf[1] = b'x';
		for (i, digit) in buf[2..].iter_mut().enumerate() {
			let nibble = (value >> (60 - 4 * i)) & 0xf;
			*digit = DIGITS[nibble as usize];
		}
		if let Ok(s) = core::str::from_utf8(&buf) {
			self.write_str(s);
		}
	}
}

/// Adapter for `write!` on a [`Console`].
pub struct ConsoleWriter<'a>(pub &'a mut dyn Console);

impl fmt::Write for ConsoleWriter<'_> {
	fn write_str(&mut self, s: &str) -> fmt::Result {
		self.0.write_str(s);
		Ok(())
	}
}

static CONSOLE: SpinMutex<Option<&'static mut (dyn Console + Send)>> = SpinMutex::new(None);

/// Routes the kernel logger to `console`.
pub fn init(console: &'static mut (dyn Console + Send)) {
	*CONSOLE.lock() = Some(console);
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
	use core::fmt::Write;

	let mut guard = CONSOLE.lock();
	if let Some(console) = guard.as_mut() {
		ConsoleWriter(&mut **console).write_fmt(args).ok();
	}
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use core::fmt::Write;

	use super::*;
	use crate::mm::test::RecordingConsole;

	#[test]
	fn hex_is_zero_padded() {
		let mut console = RecordingConsole::default();
		console.write_hex(0x0444_ff00);
		console.write_line("");
		console.write_hex(u64::MAX);
		assert_eq!(console.output, "0x000000000444ff00\n0xffffffffffffffff");
	}

	#[test]
	fn formatted_output() {
		let mut console = RecordingConsole::default();
		write!(ConsoleWriter(&mut console), "{}-{:#x}", "MMU", 16).unwrap();
		assert_eq!(console.output, "MMU-0x10");
	}
}
