pub mod kernel;
pub mod mm;
