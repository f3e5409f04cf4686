//! Helpers for the `clGet*Info` query pattern and C strings.

use crate::error::{check, Result};
use super::types::cl_int;
use bytemuck::Pod;
use std::ffi::{c_void, CString};
use std::ptr;

/// Converts a host string into a NUL-terminated C string.
pub fn to_c_string(s: &str) -> Result<CString> {
    Ok(CString::new(s)?)
}

/// Runs a two-phase `clGet*Info` query: first the size, then the bytes.
///
/// `query` receives `(param_value_size, param_value, param_value_size_ret)`.
pub(crate) fn info_bytes<F>(mut query: F) -> Result<Vec<u8>>
where
    F: FnMut(usize, *mut c_void, *mut usize) -> cl_int,
{
    let mut size = 0usize;
    check(query(0, ptr::null_mut(), &mut size))?;
    let mut buf = vec![0u8; size];
    if size > 0 {
        check(query(size, buf.as_mut_ptr().cast(), ptr::null_mut()))?;
    }
    Ok(buf)
}

/// Decodes a NUL-terminated info string.
pub(crate) fn info_string<F>(query: F) -> Result<String>
where
    F: FnMut(usize, *mut c_void, *mut usize) -> cl_int,
{
    let mut bytes = info_bytes(query)?;
    if let Some(end) = bytes.iter().position(|&b| b == 0) {
        bytes.truncate(end);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Reads a fixed-size info value.
pub(crate) fn info_value<T: Pod, F>(mut query: F) -> Result<T>
where
    F: FnMut(usize, *mut c_void, *mut usize) -> cl_int,
{
    let mut value = T::zeroed();
    check(query(
        std::mem::size_of::<T>(),
        (&mut value as *mut T).cast(),
        ptr::null_mut(),
    ))?;
    Ok(value)
}

/// Reads an info value that is an array of `T`.
pub(crate) fn info_vec<T: Pod, F>(query: F) -> Result<Vec<T>>
where
    F: FnMut(usize, *mut c_void, *mut usize) -> cl_int,
{
    let bytes = info_bytes(query)?;
    Ok(bytes
        .chunks_exact(std::mem::size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opencl::types::{CL_INVALID_VALUE, CL_SUCCESS};

    fn fake_string_query(value: &'static [u8]) -> impl FnMut(usize, *mut c_void, *mut usize) -> cl_int {
        move |size, out, size_ret| {
            if !size_ret.is_null() {
                unsafe { *size_ret = value.len() };
            }
            if !out.is_null() {
                if size < value.len() {
                    return CL_INVALID_VALUE;
                }
                unsafe { ptr::copy_nonoverlapping(value.as_ptr(), out.cast::<u8>(), value.len()) };
            }
            CL_SUCCESS
        }
    }

    #[test]
    fn strings_stop_at_nul() {
        let s = info_string(fake_string_query(b"Soft Platform\0")).unwrap();
        assert_eq!(s, "Soft Platform");
    }

    #[test]
    fn arrays_are_decoded_per_element() {
        let bytes: &'static [u8] = bytemuck::cast_slice(&[64usize, 32, 16]).to_vec().leak();
        let v: Vec<usize> = info_vec(fake_string_query(bytes)).unwrap();
        assert_eq!(v, vec![64, 32, 16]);
    }

    #[test]
    fn interior_nul_is_rejected() {
        assert!(to_c_string("abc").is_ok());
        assert!(to_c_string("a\0c").is_err());
    }
}
