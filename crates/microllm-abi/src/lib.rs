//! MicroLLM ABI crate: stable contracts shared by the session core and native engines.

pub mod backend;
pub mod ffi;
pub mod metadata;
pub mod sampling;
pub mod token;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use backend::*;
pub use metadata::*;
pub use sampling::*;
pub use token::*;
