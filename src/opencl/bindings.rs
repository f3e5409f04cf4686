//! Low-level OpenCL entry points.
//!
//! The driver is never linked at build time. [`Api::load`] opens the ICD loader
//! with `libloading` and copies every entry point into a plain table of
//! function pointers; [`crate::soft::api`] fills the same table from the
//! in-process software driver.

#![allow(non_snake_case, non_camel_case_types)]

use super::types::*;
use crate::error::{Error, Result};
use libloading::{Library, Symbol};
use std::ffi::{c_char, c_void};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub type clGetPlatformIDs_fn = unsafe extern "C" fn(
    num_entries: cl_uint,
    platforms: *mut cl_platform_id,
    num_platforms: *mut cl_uint,
) -> cl_int;

pub type clGetPlatformInfo_fn = unsafe extern "C" fn(
    platform: cl_platform_id,
    param_name: cl_platform_info,
    param_value_size: usize,
    param_value: *mut c_void,
    param_value_size_ret: *mut usize,
) -> cl_int;

pub type clGetDeviceIDs_fn = unsafe extern "C" fn(
    platform: cl_platform_id,
    device_type: cl_device_type,
    num_entries: cl_uint,
    devices: *mut cl_device_id,
    num_devices: *mut cl_uint,
) -> cl_int;

pub type clGetDeviceInfo_fn = unsafe extern "C" fn(
    device: cl_device_id,
    param_name: cl_device_info,
    param_value_size: usize,
    param_value: *mut c_void,
    param_value_size_ret: *mut usize,
) -> cl_int;

pub type clCreateContext_fn = unsafe extern "C" fn(
    properties: *const cl_context_properties,
    num_devices: cl_uint,
    devices: *const cl_device_id,
    pfn_notify: cl_context_notify,
    user_data: *mut c_void,
    errcode_ret: *mut cl_int,
) -> cl_context;

pub type clCreateCommandQueue_fn = unsafe extern "C" fn(
    context: cl_context,
    device: cl_device_id,
    properties: cl_command_queue_properties,
    errcode_ret: *mut cl_int,
) -> cl_command_queue;

pub type clCreateProgramWithSource_fn = unsafe extern "C" fn(
    context: cl_context,
    count: cl_uint,
    strings: *const *const c_char,
    lengths: *const usize,
    errcode_ret: *mut cl_int,
) -> cl_program;

pub type clBuildProgram_fn = unsafe extern "C" fn(
    program: cl_program,
    num_devices: cl_uint,
    device_list: *const cl_device_id,
    options: *const c_char,
    pfn_notify: cl_build_notify,
    user_data: *mut c_void,
) -> cl_int;

pub type clGetProgramBuildInfo_fn = unsafe extern "C" fn(
    program: cl_program,
    device: cl_device_id,
    param_name: cl_program_build_info,
    param_value_size: usize,
    param_value: *mut c_void,
    param_value_size_ret: *mut usize,
) -> cl_int;

pub type clCreateKernel_fn = unsafe extern "C" fn(
    program: cl_program,
    kernel_name: *const c_char,
    errcode_ret: *mut cl_int,
) -> cl_kernel;

pub type clGetKernelInfo_fn = unsafe extern "C" fn(
    kernel: cl_kernel,
    param_name: cl_kernel_info,
    param_value_size: usize,
    param_value: *mut c_void,
    param_value_size_ret: *mut usize,
) -> cl_int;

pub type clSetKernelArg_fn = unsafe extern "C" fn(
    kernel: cl_kernel,
    arg_index: cl_uint,
    arg_size: usize,
    arg_value: *const c_void,
) -> cl_int;

pub type clEnqueueNDRangeKernel_fn = unsafe extern "C" fn(
    command_queue: cl_command_queue,
    kernel: cl_kernel,
    work_dim: cl_uint,
    global_work_offset: *const usize,
    global_work_size: *const usize,
    local_work_size: *const usize,
    num_events_in_wait_list: cl_uint,
    event_wait_list: *const cl_event,
    event: *mut cl_event,
) -> cl_int;

pub type clCreateBuffer_fn = unsafe extern "C" fn(
    context: cl_context,
    flags: cl_mem_flags,
    size: usize,
    host_ptr: *mut c_void,
    errcode_ret: *mut cl_int,
) -> cl_mem;

pub type clEnqueueReadBuffer_fn = unsafe extern "C" fn(
    command_queue: cl_command_queue,
    buffer: cl_mem,
    blocking_read: cl_bool,
    offset: usize,
    size: usize,
    ptr: *mut c_void,
    num_events_in_wait_list: cl_uint,
    event_wait_list: *const cl_event,
    event: *mut cl_event,
) -> cl_int;

pub type clEnqueueWriteBuffer_fn = unsafe extern "C" fn(
    command_queue: cl_command_queue,
    buffer: cl_mem,
    blocking_write: cl_bool,
    offset: usize,
    size: usize,
    ptr: *const c_void,
    num_events_in_wait_list: cl_uint,
    event_wait_list: *const cl_event,
    event: *mut cl_event,
) -> cl_int;

pub type clEnqueueCopyBuffer_fn = unsafe extern "C" fn(
    command_queue: cl_command_queue,
    src_buffer: cl_mem,
    dst_buffer: cl_mem,
    src_offset: usize,
    dst_offset: usize,
    size: usize,
    num_events_in_wait_list: cl_uint,
    event_wait_list: *const cl_event,
    event: *mut cl_event,
) -> cl_int;

pub type clEnqueueMapBuffer_fn = unsafe extern "C" fn(
    command_queue: cl_command_queue,
    buffer: cl_mem,
    blocking_map: cl_bool,
    map_flags: cl_map_flags,
    offset: usize,
    size: usize,
    num_events_in_wait_list: cl_uint,
    event_wait_list: *const cl_event,
    event: *mut cl_event,
    errcode_ret: *mut cl_int,
) -> *mut c_void;

pub type clEnqueueUnmapMemObject_fn = unsafe extern "C" fn(
    command_queue: cl_command_queue,
    memobj: cl_mem,
    mapped_ptr: *mut c_void,
    num_events_in_wait_list: cl_uint,
    event_wait_list: *const cl_event,
    event: *mut cl_event,
) -> cl_int;

pub type clWaitForEvents_fn =
    unsafe extern "C" fn(num_events: cl_uint, event_list: *const cl_event) -> cl_int;

pub type clGetEventInfo_fn = unsafe extern "C" fn(
    event: cl_event,
    param_name: cl_event_info,
    param_value_size: usize,
    param_value: *mut c_void,
    param_value_size_ret: *mut usize,
) -> cl_int;

pub type clGetEventProfilingInfo_fn = unsafe extern "C" fn(
    event: cl_event,
    param_name: cl_profiling_info,
    param_value_size: usize,
    param_value: *mut c_void,
    param_value_size_ret: *mut usize,
) -> cl_int;

pub type clQueueCall_fn = unsafe extern "C" fn(command_queue: cl_command_queue) -> cl_int;
pub type clRetainContext_fn = unsafe extern "C" fn(context: cl_context) -> cl_int;
pub type clReleaseContext_fn = unsafe extern "C" fn(context: cl_context) -> cl_int;
pub type clReleaseCommandQueue_fn = unsafe extern "C" fn(command_queue: cl_command_queue) -> cl_int;
pub type clReleaseProgram_fn = unsafe extern "C" fn(program: cl_program) -> cl_int;
pub type clReleaseKernel_fn = unsafe extern "C" fn(kernel: cl_kernel) -> cl_int;
pub type clReleaseMemObject_fn = unsafe extern "C" fn(memobj: cl_mem) -> cl_int;
pub type clReleaseEvent_fn = unsafe extern "C" fn(event: cl_event) -> cl_int;

pub type clSVMAlloc_fn = unsafe extern "C" fn(
    context: cl_context,
    flags: cl_svm_mem_flags,
    size: usize,
    alignment: cl_uint,
) -> *mut c_void;

pub type clSVMFree_fn = unsafe extern "C" fn(context: cl_context, svm_pointer: *mut c_void);

pub type clSetKernelArgSVMPointer_fn = unsafe extern "C" fn(
    kernel: cl_kernel,
    arg_index: cl_uint,
    arg_value: *const c_void,
) -> cl_int;

pub type clEnqueueSVMMap_fn = unsafe extern "C" fn(
    command_queue: cl_command_queue,
    blocking_map: cl_bool,
    flags: cl_map_flags,
    svm_ptr: *mut c_void,
    size: usize,
    num_events_in_wait_list: cl_uint,
    event_wait_list: *const cl_event,
    event: *mut cl_event,
) -> cl_int;

pub type clEnqueueSVMUnmap_fn = unsafe extern "C" fn(
    command_queue: cl_command_queue,
    svm_ptr: *mut c_void,
    num_events_in_wait_list: cl_uint,
    event_wait_list: *const cl_event,
    event: *mut cl_event,
) -> cl_int;

pub type clEnqueueSVMMemcpy_fn = unsafe extern "C" fn(
    command_queue: cl_command_queue,
    blocking_copy: cl_bool,
    dst_ptr: *mut c_void,
    src_ptr: *const c_void,
    size: usize,
    num_events_in_wait_list: cl_uint,
    event_wait_list: *const cl_event,
    event: *mut cl_event,
) -> cl_int;

/// OpenCL 2.0 shared virtual memory entry points.
///
/// Loaded only when the driver exports all of them.
#[derive(Clone, Copy)]
pub struct SvmApi {
    pub clSVMAlloc: clSVMAlloc_fn,
    pub clSVMFree: clSVMFree_fn,
    pub clSetKernelArgSVMPointer: clSetKernelArgSVMPointer_fn,
    pub clEnqueueSVMMap: clEnqueueSVMMap_fn,
    pub clEnqueueSVMUnmap: clEnqueueSVMUnmap_fn,
    pub clEnqueueSVMMemcpy: clEnqueueSVMMemcpy_fn,
}

/// Where a function table came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiOrigin {
    /// A dynamically loaded ICD loader or vendor library.
    System(PathBuf),
    /// The in-process software driver.
    Soft,
}

/// Table of native entry points every wrapper calls through.
pub struct Api {
    pub origin: ApiOrigin,
    pub clGetPlatformIDs: clGetPlatformIDs_fn,
    pub clGetPlatformInfo: clGetPlatformInfo_fn,
    pub clGetDeviceIDs: clGetDeviceIDs_fn,
    pub clGetDeviceInfo: clGetDeviceInfo_fn,
    pub clCreateContext: clCreateContext_fn,
    pub clRetainContext: clRetainContext_fn,
    pub clReleaseContext: clReleaseContext_fn,
    pub clCreateCommandQueue: clCreateCommandQueue_fn,
    pub clReleaseCommandQueue: clReleaseCommandQueue_fn,
    pub clFlush: clQueueCall_fn,
    pub clFinish: clQueueCall_fn,
    pub clCreateProgramWithSource: clCreateProgramWithSource_fn,
    pub clBuildProgram: clBuildProgram_fn,
    pub clGetProgramBuildInfo: clGetProgramBuildInfo_fn,
    pub clReleaseProgram: clReleaseProgram_fn,
    pub clCreateKernel: clCreateKernel_fn,
    pub clGetKernelInfo: clGetKernelInfo_fn,
    pub clSetKernelArg: clSetKernelArg_fn,
    pub clReleaseKernel: clReleaseKernel_fn,
    pub clEnqueueNDRangeKernel: clEnqueueNDRangeKernel_fn,
    pub clCreateBuffer: clCreateBuffer_fn,
    pub clReleaseMemObject: clReleaseMemObject_fn,
    pub clEnqueueReadBuffer: clEnqueueReadBuffer_fn,
    pub clEnqueueWriteBuffer: clEnqueueWriteBuffer_fn,
    pub clEnqueueCopyBuffer: clEnqueueCopyBuffer_fn,
    pub clEnqueueMapBuffer: clEnqueueMapBuffer_fn,
    pub clEnqueueUnmapMemObject: clEnqueueUnmapMemObject_fn,
    pub clWaitForEvents: clWaitForEvents_fn,
    pub clGetEventInfo: clGetEventInfo_fn,
    pub clGetEventProfilingInfo: clGetEventProfilingInfo_fn,
    pub clReleaseEvent: clReleaseEvent_fn,
    pub svm: Option<SvmApi>,
    // Keeps the function pointers above valid.
    pub(crate) _lib: Option<Library>,
}

impl fmt::Debug for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Api")
            .field("origin", &self.origin)
            .field("svm", &self.svm.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(target_os = "windows")]
const LIBRARY_NAMES: &[&str] = &["OpenCL.dll"];
#[cfg(target_os = "macos")]
const LIBRARY_NAMES: &[&str] = &["/System/Library/Frameworks/OpenCL.framework/OpenCL"];
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const LIBRARY_NAMES: &[&str] = &["libOpenCL.so.1", "libOpenCL.so"];

impl Api {
    /// Loads the system OpenCL library from its well-known names.
    pub fn load() -> Result<Self> {
        let mut last_err = String::from("no candidate library names");
        for name in LIBRARY_NAMES {
            match Self::load_from(Path::new(name)) {
                Ok(api) => return Ok(api),
                Err(e) => {
                    debug!("failed to load {}: {}", name, e);
                    last_err = e.to_string();
                }
            }
        }
        Err(Error::Library(last_err))
    }

    /// Loads an OpenCL library from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let lib = unsafe { Library::new(path) }
            .map_err(|e| Error::Library(format!("{}: {}", path.display(), e)))?;

        unsafe {
            let svm = Self::load_svm(&lib);
            let api = Self {
                origin: ApiOrigin::System(path.to_path_buf()),
                clGetPlatformIDs: load_fn(&lib, "clGetPlatformIDs")?,
                clGetPlatformInfo: load_fn(&lib, "clGetPlatformInfo")?,
                clGetDeviceIDs: load_fn(&lib, "clGetDeviceIDs")?,
                clGetDeviceInfo: load_fn(&lib, "clGetDeviceInfo")?,
                clCreateContext: load_fn(&lib, "clCreateContext")?,
                clRetainContext: load_fn(&lib, "clRetainContext")?,
                clReleaseContext: load_fn(&lib, "clReleaseContext")?,
                clCreateCommandQueue: load_fn(&lib, "clCreateCommandQueue")?,
                clReleaseCommandQueue: load_fn(&lib, "clReleaseCommandQueue")?,
                clFlush: load_fn(&lib, "clFlush")?,
                clFinish: load_fn(&lib, "clFinish")?,
                clCreateProgramWithSource: load_fn(&lib, "clCreateProgramWithSource")?,
                clBuildProgram: load_fn(&lib, "clBuildProgram")?,
                clGetProgramBuildInfo: load_fn(&lib, "clGetProgramBuildInfo")?,
                clReleaseProgram: load_fn(&lib, "clReleaseProgram")?,
                clCreateKernel: load_fn(&lib, "clCreateKernel")?,
                clGetKernelInfo: load_fn(&lib, "clGetKernelInfo")?,
                clSetKernelArg: load_fn(&lib, "clSetKernelArg")?,
                clReleaseKernel: load_fn(&lib, "clReleaseKernel")?,
                clEnqueueNDRangeKernel: load_fn(&lib, "clEnqueueNDRangeKernel")?,
                clCreateBuffer: load_fn(&lib, "clCreateBuffer")?,
                clReleaseMemObject: load_fn(&lib, "clReleaseMemObject")?,
                clEnqueueReadBuffer: load_fn(&lib, "clEnqueueReadBuffer")?,
                clEnqueueWriteBuffer: load_fn(&lib, "clEnqueueWriteBuffer")?,
                clEnqueueCopyBuffer: load_fn(&lib, "clEnqueueCopyBuffer")?,
                clEnqueueMapBuffer: load_fn(&lib, "clEnqueueMapBuffer")?,
                clEnqueueUnmapMemObject: load_fn(&lib, "clEnqueueUnmapMemObject")?,
                clWaitForEvents: load_fn(&lib, "clWaitForEvents")?,
                clGetEventInfo: load_fn(&lib, "clGetEventInfo")?,
                clGetEventProfilingInfo: load_fn(&lib, "clGetEventProfilingInfo")?,
                clReleaseEvent: load_fn(&lib, "clReleaseEvent")?,
                svm,
                _lib: Some(lib),
            };
            info!(
                "loaded OpenCL driver from {} (svm: {})",
                path.display(),
                api.svm.is_some()
            );
            Ok(api)
        }
    }

    unsafe fn load_svm(lib: &Library) -> Option<SvmApi> {
        Some(SvmApi {
            clSVMAlloc: load_fn_opt(lib, "clSVMAlloc")?,
            clSVMFree: load_fn_opt(lib, "clSVMFree")?,
            clSetKernelArgSVMPointer: load_fn_opt(lib, "clSetKernelArgSVMPointer")?,
            clEnqueueSVMMap: load_fn_opt(lib, "clEnqueueSVMMap")?,
            clEnqueueSVMUnmap: load_fn_opt(lib, "clEnqueueSVMUnmap")?,
            clEnqueueSVMMemcpy: load_fn_opt(lib, "clEnqueueSVMMemcpy")?,
        })
    }

    /// The shared virtual memory entry points, if the driver has them.
    pub fn svm(&self) -> Result<&SvmApi> {
        self.svm.as_ref().ok_or(Error::Unsupported("clSVMAlloc"))
    }
}

unsafe fn load_fn<F: Copy>(lib: &Library, name: &str) -> Result<F> {
    let sym: Symbol<F> = lib
        .get(name.as_bytes())
        .map_err(|e| Error::Library(format!("failed to load {}: {}", name, e)))?;
    Ok(*sym)
}

unsafe fn load_fn_opt<F: Copy>(lib: &Library, name: &str) -> Option<F> {
    lib.get(name.as_bytes()).ok().map(|s: Symbol<F>| *s)
}
