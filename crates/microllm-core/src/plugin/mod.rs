//! Native engines loaded from shared libraries through the `ffi` vtable.

mod backend;
mod loader;

pub use backend::PluginEngine;
