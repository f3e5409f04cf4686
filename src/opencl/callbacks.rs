use std::ffi::{c_char, c_void, CStr};
use tracing::error;

/// Context error callback: forwards driver diagnostics to the log.
pub unsafe extern "C" fn log_context_error(
    errinfo: *const c_char,
    _private_info: *const c_void,
    _cb: usize,
    _user_data: *mut c_void,
) {
    if errinfo.is_null() {
        return;
    }
    let message = CStr::from_ptr(errinfo).to_string_lossy();
    error!(target: "oclwrap::driver", "{}", message);
}
