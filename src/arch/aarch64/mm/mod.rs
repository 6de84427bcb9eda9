pub mod paging;
pub mod physicalmem;
pub mod policy;
pub mod transition;
pub mod vectors;
