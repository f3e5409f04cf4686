//! Program compilation.

use crate::cl_create;
use crate::context::Context;
use crate::error::{status_name, Error, Result};
use crate::handle::{Handle, Kind, Live};
use crate::kernel::Kernel;
use crate::opencl::types::*;
use crate::opencl::utils::{info_string, to_c_string};
use std::ptr;
use std::sync::Arc;
use tracing::{debug, error};

/// Kernel source compiled for every device of one context.
#[derive(Debug, Clone)]
pub struct Program {
    handle: Arc<Handle>,
    context: Context,
}

impl Program {
    /// Creates the program and builds it immediately.
    ///
    /// A failed build returns [`Error::Build`] with the compiler log.
    pub fn new(context: &Context, source: &str, options: &str) -> Result<Self> {
        let api = context.api();
        let c_source = to_c_string(source)?;
        let c_options = to_c_string(options)?;

        let raw = {
            let ctx = context.live()?;
            let strings = [c_source.as_ptr()];
            let lengths = [source.len()];
            cl_create!(
                api,
                clCreateProgramWithSource(ctx.ptr(), 1, strings.as_ptr(), lengths.as_ptr())
            )?
        };

        // Wrapped before building so a failed build still releases it.
        let program = Self {
            handle: Handle::new(api.clone(), Kind::Program, raw),
            context: context.clone(),
        };

        let devices: Vec<cl_device_id> = context.devices().iter().map(|d| d.as_raw()).collect();
        let status = unsafe {
            (api.clBuildProgram)(
                raw,
                devices.len() as cl_uint,
                devices.as_ptr(),
                c_options.as_ptr(),
                None,
                ptr::null_mut(),
            )
        };

        if status != CL_SUCCESS {
            let log = program.build_log().unwrap_or_default();
            error!("program build failed with {}:\n{}", status_name(status), log);
            return Err(Error::Build {
                code: status,
                name: status_name(status),
                log,
            });
        }

        debug!("built program {:p} with options {:?}", raw, options);
        Ok(program)
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn as_raw(&self) -> cl_program {
        self.handle.as_raw()
    }

    pub(crate) fn live(&self) -> Result<Live<'_>> {
        self.handle.get()
    }

    /// The build log of every device, one after another.
    pub fn build_log(&self) -> Result<String> {
        let program = self.live()?;
        let api = self.handle.api();
        let mut log = String::new();
        for device in self.context.devices() {
            let id = device.as_raw();
            let part = info_string(|size, value, size_ret| unsafe {
                (api.clGetProgramBuildInfo)(program.ptr(), id, CL_PROGRAM_BUILD_LOG, size, value, size_ret)
            })?;
            if !part.is_empty() {
                if !log.is_empty() {
                    log.push('\n');
                }
                log.push_str(&part);
            }
        }
        Ok(log)
    }

    pub fn create_kernel(&self, name: &str) -> Result<Kernel> {
        Kernel::new(self, name)
    }

    pub fn release(&self) -> Result<()> {
        self.handle.release()
    }
}
