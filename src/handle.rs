//! Release-once ownership of native handles.
//!
//! Every wrapper keeps its native handle in an [`Handle`]. Native calls run
//! while holding a read guard ([`Live`]); `release` takes the write lock, so a
//! release can never interleave with a call that is still using the handle.

use crate::error::{check, Error, Result};
use crate::opencl::bindings::Api;
use std::ffi::c_void;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tracing::{debug, warn};

/// A native pointer that may cross threads; the driver owns its thread safety.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct RawPtr(pub *mut c_void);

unsafe impl Send for RawPtr {}
unsafe impl Sync for RawPtr {}

impl RawPtr {
    pub(crate) const NULL: Self = Self(std::ptr::null_mut());
}

impl fmt::Debug for RawPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Context,
    CommandQueue,
    Program,
    Kernel,
    Memory,
    Event,
    Svm,
}

impl Kind {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::CommandQueue => "command queue",
            Self::Program => "program",
            Self::Kernel => "kernel",
            Self::Memory => "memory object",
            Self::Event => "event",
            Self::Svm => "svm buffer",
        }
    }
}

pub(crate) struct Handle {
    api: Arc<Api>,
    kind: Kind,
    raw: RwLock<RawPtr>,
    // SVM allocations hold a retained reference to their context, dropped
    // after the free.
    context: Option<RawPtr>,
}

/// Read access to a handle that is guaranteed not to be released meanwhile.
pub(crate) struct Live<'a> {
    guard: RwLockReadGuard<'a, RawPtr>,
}

impl Live<'_> {
    #[inline]
    pub(crate) fn ptr(&self) -> *mut c_void {
        self.guard.0
    }
}

impl Handle {
    pub(crate) fn new(api: Arc<Api>, kind: Kind, raw: *mut c_void) -> Arc<Self> {
        debug!("created {} {:p}", kind.name(), raw);
        Arc::new(Self {
            api,
            kind,
            raw: RwLock::new(RawPtr(raw)),
            context: None,
        })
    }

    /// `context` must already be retained; the handle releases it once.
    pub(crate) fn with_context(api: Arc<Api>, kind: Kind, raw: *mut c_void, context: *mut c_void) -> Arc<Self> {
        debug!("created {} {:p} in context {:p}", kind.name(), raw, context);
        Arc::new(Self {
            api,
            kind,
            raw: RwLock::new(RawPtr(raw)),
            context: Some(RawPtr(context)),
        })
    }

    #[inline]
    pub(crate) fn api(&self) -> &Arc<Api> {
        &self.api
    }

    /// Locks the handle for the duration of a native call.
    pub(crate) fn get(&self) -> Result<Live<'_>> {
        let guard = self.raw.read().unwrap_or_else(PoisonError::into_inner);
        if guard.0.is_null() {
            return Err(Error::Released(self.kind.name()));
        }
        Ok(Live { guard })
    }

    /// The raw pointer, or null once released.
    pub(crate) fn as_raw(&self) -> *mut c_void {
        self.raw.read().unwrap_or_else(PoisonError::into_inner).0
    }

    /// Releases the native handle. A second call does nothing.
    pub(crate) fn release(&self) -> Result<()> {
        let mut guard = self.raw.write().unwrap_or_else(PoisonError::into_inner);
        let raw = std::mem::replace(&mut *guard, RawPtr::NULL);
        if raw.0.is_null() {
            return Ok(());
        }
        debug!("releasing {} {:p}", self.kind.name(), raw.0);
        self.release_raw(raw.0)
    }

    fn release_raw(&self, raw: *mut c_void) -> Result<()> {
        let api = &self.api;
        unsafe {
            match self.kind {
                Kind::Context => check((api.clReleaseContext)(raw)),
                Kind::CommandQueue => check((api.clReleaseCommandQueue)(raw)),
                Kind::Program => check((api.clReleaseProgram)(raw)),
                Kind::Kernel => check((api.clReleaseKernel)(raw)),
                Kind::Memory => check((api.clReleaseMemObject)(raw)),
                Kind::Event => check((api.clReleaseEvent)(raw)),
                Kind::Svm => {
                    let svm = api.svm()?;
                    let context = self.context.ok_or(Error::Released("context"))?;
                    (svm.clSVMFree)(context.0, raw);
                    check((api.clReleaseContext)(context.0))
                }
            }
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("failed to release {} on drop: {}", self.kind.name(), e);
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("kind", &self.kind)
            .field("raw", &self.as_raw())
            .finish()
    }
}
