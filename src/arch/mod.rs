//! Architecture-specific architecture abstraction.
//!
//! The translation table format and the transition engine are plain data
//! manipulation and build everywhere. Only the register and serial backends
//! need an AArch64 target.

pub mod aarch64;

pub use self::aarch64::*;
