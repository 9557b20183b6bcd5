pub mod binary;
pub mod debug;
pub mod error;
pub mod refs;
