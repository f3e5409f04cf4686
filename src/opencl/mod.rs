//! Native OpenCL surface.
//!
//! Raw types, the loadable entry-point table and a few helpers. Everything
//! here is unsafe to use directly; the safe wrappers live one level up.

pub mod bindings;
pub mod callbacks;
pub mod types;
pub mod utils;
