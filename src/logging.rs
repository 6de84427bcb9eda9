use log::{LevelFilter, Metadata, Record, set_logger, set_max_level};

/// Writes log records to the console.
struct KernelLogger;

impl log::Log for KernelLogger {
	fn enabled(&self, _: &Metadata<'_>) -> bool {
		true
	}

	fn flush(&self) {
		// nothing to do
	}

	fn log(&self, record: &Record<'_>) {
		if self.enabled(record.metadata()) {
			crate::console::_print(format_args!("[{}] {}\n", record.level(), record.args()));
		}
	}
}

fn max_level(filter: Option<&str>) -> LevelFilter {
	match filter {
		Some("Error") => LevelFilter::Error,
		Some("Debug") => LevelFilter::Debug,
		Some("Off") => LevelFilter::Off,
		Some("Trace") => LevelFilter::Trace,
		Some("Warn") => LevelFilter::Warn,
		_ => LevelFilter::Info,
	}
}

/// Installs the console logger. Later calls keep the first logger.
pub fn init() {
	if set_logger(&KernelLogger).is_err() {
		return;
	}
	// Determines LevelFilter at compile time
	set_max_level(max_level(option_env!("VMBOOT_LOG_LEVEL_FILTER")));
}

/// Turns every log macro into a no-op.
///
/// The logger is registered by the address it had when `init` ran, which
/// stops translating once TTBR0 walks are disabled.
pub fn disable() {
	set_max_level(LevelFilter::Off);
}

macro_rules! infoheader {
	($str:expr) => {{
		info!("");
		info!("{:=^70}", $str);
	}};
}

macro_rules! infoentry {
	($str:expr, $rhs:expr) => (infoentry!($str, "{}", $rhs));
	($str:expr, $($arg:tt)+) => (info!("{:25}{}", concat!($str, ":"), format_args!($($arg)+)));
}

macro_rules! infofooter {
	() => {{
		info!("{:=^70}", '=');
		info!("");
	}};
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
	use super::*;

	#[test]
	fn level_from_environment() {
		assert_eq!(max_level(Some("Trace")), LevelFilter::Trace);
		assert_eq!(max_level(Some("Off")), LevelFilter::Off);
		assert_eq!(max_level(Some("verbose")), LevelFilter::Info);
		assert_eq!(max_level(None), LevelFilter::Info);
	}
}
