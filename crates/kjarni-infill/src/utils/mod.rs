//! Utility modules

pub mod linear_algebra;
pub mod masks;
pub use masks::*;
