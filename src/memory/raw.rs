use crate::cl_create;
use crate::context::Context;
use crate::error::Result;
use crate::event::{track, Event, WaitList};
use crate::handle::{Handle, Kind};
use crate::opencl::types::*;
use crate::queue::CommandQueue;
use std::ffi::c_void;
use std::fmt;
use std::ptr;
use std::sync::Arc;

/// The untyped `cl_mem` buffer behind every typed buffer.
pub struct RawMemory {
    handle: Arc<Handle>,
    context: Context,
    size: usize,
}

impl RawMemory {
    /// Allocates `size` bytes, initialised from `host` when given.
    pub(crate) fn new(context: &Context, flags: cl_mem_flags, size: usize, host: Option<&[u8]>) -> Result<Self> {
        let api = context.api();
        let (flags, host_ptr) = match host {
            Some(bytes) => (flags | CL_MEM_COPY_HOST_PTR, bytes.as_ptr() as *mut c_void),
            None => (flags, ptr::null_mut()),
        };

        let raw = {
            let ctx = context.live()?;
            cl_create!(api, clCreateBuffer(ctx.ptr(), flags, size, host_ptr))?
        };

        Ok(Self {
            handle: Handle::new(api.clone(), Kind::Memory, raw),
            context: context.clone(),
            size,
        })
    }

    pub(crate) fn handle(&self) -> &Arc<Handle> {
        &self.handle
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn as_raw(&self) -> cl_mem {
        self.handle.as_raw()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn release(&self) -> Result<()> {
        self.handle.release()
    }

    pub(crate) unsafe fn write(
        &self,
        queue: &CommandQueue,
        blocking: bool,
        offset: usize,
        len: usize,
        src: *const c_void,
        deps: &[&Event],
    ) -> Result<Event> {
        let api = self.handle.api();
        let mem = self.handle.get()?;
        let q = queue.live()?;
        let waits = WaitList::new(deps)?;
        track(api, |event| {
            (api.clEnqueueWriteBuffer)(
                q.ptr(),
                mem.ptr(),
                blocking as cl_bool,
                offset,
                len,
                src,
                waits.len(),
                waits.as_ptr(),
                event,
            )
        })
    }

    pub(crate) unsafe fn read(
        &self,
        queue: &CommandQueue,
        blocking: bool,
        offset: usize,
        len: usize,
        dst: *mut c_void,
        deps: &[&Event],
    ) -> Result<Event> {
        let api = self.handle.api();
        let mem = self.handle.get()?;
        let q = queue.live()?;
        let waits = WaitList::new(deps)?;
        track(api, |event| {
            (api.clEnqueueReadBuffer)(
                q.ptr(),
                mem.ptr(),
                blocking as cl_bool,
                offset,
                len,
                dst,
                waits.len(),
                waits.as_ptr(),
                event,
            )
        })
    }

    /// Device-side copy from `src` into `self`; `src` may be `self`.
    pub(crate) fn copy_from(
        &self,
        queue: &CommandQueue,
        src: &RawMemory,
        src_offset: usize,
        dst_offset: usize,
        len: usize,
        deps: &[&Event],
    ) -> Result<Event> {
        let api = self.handle.api();
        let dst = self.handle.get()?;
        // Never take a second read guard on the same lock.
        let src_live;
        let src_ptr = if Arc::ptr_eq(&self.handle, &src.handle) {
            dst.ptr()
        } else {
            src_live = src.handle.get()?;
            src_live.ptr()
        };
        let q = queue.live()?;
        let waits = WaitList::new(deps)?;
        track(api, |event| unsafe {
            (api.clEnqueueCopyBuffer)(
                q.ptr(),
                src_ptr,
                dst.ptr(),
                src_offset,
                dst_offset,
                len,
                waits.len(),
                waits.as_ptr(),
                event,
            )
        })
    }

    pub(crate) unsafe fn map(
        &self,
        queue: &CommandQueue,
        blocking: bool,
        flags: cl_map_flags,
        offset: usize,
        len: usize,
        deps: &[&Event],
    ) -> Result<(*mut c_void, Event)> {
        let api = self.handle.api();
        let mem = self.handle.get()?;
        let q = queue.live()?;
        let waits = WaitList::new(deps)?;
        let mut event: cl_event = ptr::null_mut();
        let mapped = cl_create!(
            api,
            clEnqueueMapBuffer(
                q.ptr(),
                mem.ptr(),
                blocking as cl_bool,
                flags,
                offset,
                len,
                waits.len(),
                waits.as_ptr(),
                &mut event,
            )
        )?;
        Ok((mapped, Event::from_raw(api, event)?))
    }

    pub(crate) unsafe fn unmap(&self, queue: &CommandQueue, mapped: *mut c_void, deps: &[&Event]) -> Result<Event> {
        let api = self.handle.api();
        let mem = self.handle.get()?;
        let q = queue.live()?;
        let waits = WaitList::new(deps)?;
        track(api, |event| {
            (api.clEnqueueUnmapMemObject)(q.ptr(), mem.ptr(), mapped, waits.len(), waits.as_ptr(), event)
        })
    }
}

impl fmt::Debug for RawMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMemory")
            .field("raw", &self.handle.as_raw())
            .field("size", &self.size)
            .finish()
    }
}
