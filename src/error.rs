//! Error type shared by every wrapper.
//!
//! Every native status code goes through [`check`]. Anything other than
//! `CL_SUCCESS` becomes [`Error::Status`], named after its OpenCL enumerant.

use crate::opencl::types::*;
use std::ffi::NulError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A native call returned a status other than `CL_SUCCESS`.
    #[error("{name} ({code})")]
    Status { code: cl_int, name: &'static str },

    /// `clBuildProgram` failed; `log` holds the compiler output.
    #[error("{name} ({code}) while building program:\n{log}")]
    Build {
        code: cl_int,
        name: &'static str,
        log: String,
    },

    /// A creation call reported success but handed back a null handle.
    #[error("{0} returned a null handle")]
    NullHandle(&'static str),

    #[error("index out of range: {what} {offset} + {length} exceeds {bound}")]
    OutOfRange {
        what: &'static str,
        offset: usize,
        length: usize,
        bound: usize,
    },

    #[error("invalid work dimensions: {0} (expected 1 to 3)")]
    InvalidDimensions(usize),

    #[error("local size has {local} dimensions but work size has {global}")]
    DimensionMismatch { global: usize, local: usize },

    #[error("mapped pointer is not aligned to {align} bytes")]
    Misaligned { align: usize },

    #[error("{0} used after release")]
    Released(&'static str),

    #[error("failed to allocate {size} bytes of shared virtual memory")]
    AllocationFailed { size: usize },

    #[error("OpenCL library unavailable: {0}")]
    Library(String),

    #[error("driver does not export {0}")]
    Unsupported(&'static str),

    #[error("no OpenCL platform found")]
    NoPlatform,

    #[error("no OpenCL device found")]
    NoDevice,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Nul(#[from] NulError),
}

impl Error {
    pub fn status(code: cl_int) -> Self {
        Self::Status {
            code,
            name: status_name(code),
        }
    }

    /// The native status code, for errors that carry one.
    pub fn code(&self) -> Option<cl_int> {
        match self {
            Self::Status { code, .. } | Self::Build { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn out_of_range(what: &'static str, offset: usize, length: usize, bound: usize) -> Self {
        Self::OutOfRange {
            what,
            offset,
            length,
            bound,
        }
    }
}

/// Turns a native status code into a `Result`.
#[inline]
pub fn check(code: cl_int) -> Result<()> {
    if code == CL_SUCCESS {
        Ok(())
    } else {
        Err(Error::status(code))
    }
}

/// Checks the `errcode_ret` of a creation call together with its handle.
#[inline]
pub fn check_created<P>(code: cl_int, obj: *mut P, call: &'static str) -> Result<*mut P> {
    check(code)?;
    if obj.is_null() {
        return Err(Error::NullHandle(call));
    }
    Ok(obj)
}

/// Validates `offset + length <= bound` without overflowing.
pub(crate) fn check_range(what: &'static str, offset: usize, length: usize, bound: usize) -> Result<()> {
    match offset.checked_add(length) {
        Some(end) if end <= bound => Ok(()),
        _ => Err(Error::out_of_range(what, offset, length, bound)),
    }
}

/// Name of an OpenCL status enumerant.
pub fn status_name(code: cl_int) -> &'static str {
    match code {
        CL_SUCCESS => "CL_SUCCESS",
        CL_DEVICE_NOT_FOUND => "CL_DEVICE_NOT_FOUND",
        CL_DEVICE_NOT_AVAILABLE => "CL_DEVICE_NOT_AVAILABLE",
        CL_COMPILER_NOT_AVAILABLE => "CL_COMPILER_NOT_AVAILABLE",
        CL_MEM_OBJECT_ALLOCATION_FAILURE => "CL_MEM_OBJECT_ALLOCATION_FAILURE",
        CL_OUT_OF_RESOURCES => "CL_OUT_OF_RESOURCES",
        CL_OUT_OF_HOST_MEMORY => "CL_OUT_OF_HOST_MEMORY",
        CL_PROFILING_INFO_NOT_AVAILABLE => "CL_PROFILING_INFO_NOT_AVAILABLE",
        CL_MEM_COPY_OVERLAP => "CL_MEM_COPY_OVERLAP",
        CL_IMAGE_FORMAT_MISMATCH => "CL_IMAGE_FORMAT_MISMATCH",
        CL_IMAGE_FORMAT_NOT_SUPPORTED => "CL_IMAGE_FORMAT_NOT_SUPPORTED",
        CL_BUILD_PROGRAM_FAILURE => "CL_BUILD_PROGRAM_FAILURE",
        CL_MAP_FAILURE => "CL_MAP_FAILURE",
        CL_MISALIGNED_SUB_BUFFER_OFFSET => "CL_MISALIGNED_SUB_BUFFER_OFFSET",
        CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST => {
            "CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST"
        }
        CL_COMPILE_PROGRAM_FAILURE => "CL_COMPILE_PROGRAM_FAILURE",
        CL_LINKER_NOT_AVAILABLE => "CL_LINKER_NOT_AVAILABLE",
        CL_LINK_PROGRAM_FAILURE => "CL_LINK_PROGRAM_FAILURE",
        CL_DEVICE_PARTITION_FAILED => "CL_DEVICE_PARTITION_FAILED",
        CL_KERNEL_ARG_INFO_NOT_AVAILABLE => "CL_KERNEL_ARG_INFO_NOT_AVAILABLE",
        CL_INVALID_VALUE => "CL_INVALID_VALUE",
        CL_INVALID_DEVICE_TYPE => "CL_INVALID_DEVICE_TYPE",
        CL_INVALID_PLATFORM => "CL_INVALID_PLATFORM",
        CL_INVALID_DEVICE => "CL_INVALID_DEVICE",
        CL_INVALID_CONTEXT => "CL_INVALID_CONTEXT",
        CL_INVALID_QUEUE_PROPERTIES => "CL_INVALID_QUEUE_PROPERTIES",
        CL_INVALID_COMMAND_QUEUE => "CL_INVALID_COMMAND_QUEUE",
        CL_INVALID_HOST_PTR => "CL_INVALID_HOST_PTR",
        CL_INVALID_MEM_OBJECT => "CL_INVALID_MEM_OBJECT",
        CL_INVALID_IMAGE_FORMAT_DESCRIPTOR => "CL_INVALID_IMAGE_FORMAT_DESCRIPTOR",
        CL_INVALID_IMAGE_SIZE => "CL_INVALID_IMAGE_SIZE",
        CL_INVALID_SAMPLER => "CL_INVALID_SAMPLER",
        CL_INVALID_BINARY => "CL_INVALID_BINARY",
        CL_INVALID_BUILD_OPTIONS => "CL_INVALID_BUILD_OPTIONS",
        CL_INVALID_PROGRAM => "CL_INVALID_PROGRAM",
        CL_INVALID_PROGRAM_EXECUTABLE => "CL_INVALID_PROGRAM_EXECUTABLE",
        CL_INVALID_KERNEL_NAME => "CL_INVALID_KERNEL_NAME",
        CL_INVALID_KERNEL_DEFINITION => "CL_INVALID_KERNEL_DEFINITION",
        CL_INVALID_KERNEL => "CL_INVALID_KERNEL",
        CL_INVALID_ARG_INDEX => "CL_INVALID_ARG_INDEX",
        CL_INVALID_ARG_VALUE => "CL_INVALID_ARG_VALUE",
        CL_INVALID_ARG_SIZE => "CL_INVALID_ARG_SIZE",
        CL_INVALID_KERNEL_ARGS => "CL_INVALID_KERNEL_ARGS",
        CL_INVALID_WORK_DIMENSION => "CL_INVALID_WORK_DIMENSION",
        CL_INVALID_WORK_GROUP_SIZE => "CL_INVALID_WORK_GROUP_SIZE",
        CL_INVALID_WORK_ITEM_SIZE => "CL_INVALID_WORK_ITEM_SIZE",
        CL_INVALID_GLOBAL_OFFSET => "CL_INVALID_GLOBAL_OFFSET",
        CL_INVALID_EVENT_WAIT_LIST => "CL_INVALID_EVENT_WAIT_LIST",
        CL_INVALID_EVENT => "CL_INVALID_EVENT",
        CL_INVALID_OPERATION => "CL_INVALID_OPERATION",
        CL_INVALID_GL_OBJECT => "CL_INVALID_GL_OBJECT",
        CL_INVALID_BUFFER_SIZE => "CL_INVALID_BUFFER_SIZE",
        CL_INVALID_MIP_LEVEL => "CL_INVALID_MIP_LEVEL",
        CL_INVALID_GLOBAL_WORK_SIZE => "CL_INVALID_GLOBAL_WORK_SIZE",
        CL_INVALID_PROPERTY => "CL_INVALID_PROPERTY",
        CL_INVALID_IMAGE_DESCRIPTOR => "CL_INVALID_IMAGE_DESCRIPTOR",
        CL_INVALID_COMPILER_OPTIONS => "CL_INVALID_COMPILER_OPTIONS",
        CL_INVALID_LINKER_OPTIONS => "CL_INVALID_LINKER_OPTIONS",
        CL_INVALID_DEVICE_PARTITION_COUNT => "CL_INVALID_DEVICE_PARTITION_COUNT",
        CL_INVALID_PIPE_SIZE => "CL_INVALID_PIPE_SIZE",
        CL_INVALID_DEVICE_QUEUE => "CL_INVALID_DEVICE_QUEUE",
        CL_INVALID_SPEC_ID => "CL_INVALID_SPEC_ID",
        CL_MAX_SIZE_RESTRICTION_EXCEEDED => "CL_MAX_SIZE_RESTRICTION_EXCEEDED",
        CL_PLATFORM_NOT_FOUND_KHR => "CL_PLATFORM_NOT_FOUND_KHR",
        _ => "CL_UNKNOWN_ERROR",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_passes() {
        assert!(check(CL_SUCCESS).is_ok());
    }

    #[test]
    fn failure_is_named_after_enumerant() {
        let err = check(CL_INVALID_KERNEL_ARGS).unwrap_err();
        assert!(matches!(
            err,
            Error::Status {
                code: CL_INVALID_KERNEL_ARGS,
                name: "CL_INVALID_KERNEL_ARGS"
            }
        ));
        assert_eq!(err.to_string(), "CL_INVALID_KERNEL_ARGS (-52)");
        assert_eq!(err.code(), Some(-52));
    }

    #[test]
    fn unknown_codes_still_fail() {
        let err = check(-12345).unwrap_err();
        assert_eq!(err.to_string(), "CL_UNKNOWN_ERROR (-12345)");
    }

    #[test]
    fn created_null_handle_is_an_error() {
        let obj: *mut std::ffi::c_void = std::ptr::null_mut();
        assert!(matches!(
            check_created(CL_SUCCESS, obj, "clCreateBuffer"),
            Err(Error::NullHandle("clCreateBuffer"))
        ));
        assert!(matches!(
            check_created(CL_INVALID_CONTEXT, obj, "clCreateBuffer"),
            Err(Error::Status { code: CL_INVALID_CONTEXT, .. })
        ));
    }

    #[test]
    fn range_check_handles_overflow() {
        assert!(check_range("buffer", 0, 100, 100).is_ok());
        assert!(check_range("buffer", 75, 25, 100).is_ok());
        assert!(check_range("buffer", 76, 25, 100).is_err());
        assert!(check_range("buffer", usize::MAX, 2, 100).is_err());
    }
}
