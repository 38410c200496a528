//! Data models

mod enrollment;
mod request;
mod vm;

pub use enrollment::*;
pub use request::*;
pub use vm::*;
