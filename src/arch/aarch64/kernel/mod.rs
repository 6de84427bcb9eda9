#[cfg(target_arch = "aarch64")]
pub mod processor;
pub mod registers;
#[cfg(target_arch = "aarch64")]
pub mod serial;
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod start;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub use self::start::bring_up;
