//! Safe bindings over the OpenCL compute API.
//!
//! Platforms, devices, contexts, queues, programs, kernels, buffers and events
//! are owning Rust values. Each one forwards to the native driver through a
//! loaded function table ([`opencl::bindings::Api`]) and turns every native
//! status into [`Error`].
//!
//! ```no_run
//! use oclwrap::{ArrayReadWrite, Config, Context, DriverKind};
//!
//! # fn main() -> oclwrap::Result<()> {
//! let context = Context::from_config(&Config::new().with_driver(DriverKind::Soft))?;
//! let queue = context.create_command_queue(0)?;
//! let buffer = context.create_simple_memory_from(&[1.0f32, 2.0, 3.0])?;
//! let mut out = [0.0f32; 3];
//! buffer.read(&queue, &mut out, &[])?;
//! # Ok(())
//! # }
//! ```

/// Checks the status returned by a native entry point.
///
/// `cl_check!(api, clFinish(queue))` calls `(api.clFinish)(queue)` and maps a
/// non-success status to [`Error::Status`].
#[macro_export]
macro_rules! cl_check {
    ($api:expr, $func:ident($($arg:expr),* $(,)?)) => {
        $crate::error::check(unsafe { ($api.$func)($($arg),*) })
    };
}

/// Calls a native creation entry point that reports through `errcode_ret`.
///
/// The `errcode_ret` argument is appended by the macro. Yields the new handle,
/// or an error if the status is not success or the handle is null.
#[macro_export]
macro_rules! cl_create {
    ($api:expr, $func:ident($($arg:expr),* $(,)?)) => {{
        let mut status: $crate::opencl::types::cl_int = $crate::opencl::types::CL_SUCCESS;
        let obj = unsafe { ($api.$func)($($arg,)* &mut status) };
        $crate::error::check_created(status, obj, stringify!($func))
    }};
}

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub(crate) mod handle;
pub mod kernel;
pub mod logging;
pub mod memory;
pub mod opencl;
pub mod platform;
pub mod program;
pub mod queue;
pub mod soft;
pub mod utils;

pub use config::{Config, DriverKind};
pub use context::Context;
pub use error::{Error, Result};
pub use event::{Event, ExecutionStatus, ProfilingInfo};
pub use kernel::{Kernel, KernelArg, LocalMemorySize, Scalar};
pub use memory::{
    ArrayReadWrite, Element, MappedRegion, MappingMemory, MemoryObject, SimpleMemory, SvmBuffer,
};
pub use opencl::bindings::Api;
pub use platform::{Device, DeviceType, Platform};
pub use program::Program;
pub use queue::{CommandQueue, QueueProperties};
