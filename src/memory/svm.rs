use super::simple::byte_len;
use super::Element;
use crate::cl_check;
use crate::context::Context;
use crate::error::{check_range, Error, Result};
use crate::event::{track, Event};
use crate::handle::{Handle, Kind};
use crate::opencl::types::*;
use crate::queue::CommandQueue;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr;
use std::slice;
use std::sync::Arc;
use tracing::debug;

/// Shared virtual memory holding an `x * y * z` grid of `T`.
///
/// The allocation is addressable from host code directly. Element `(x, y, z)`
/// lives at `x + len_x * y + len_x * len_y * z`. Host access to coarse-grained
/// SVM must be bracketed by [`map`](Self::map) and [`unmap`](Self::unmap).
///
/// Freeing SVM does not wait for the device: finish every queue using the
/// buffer before releasing or dropping it.
pub struct SvmBuffer<T: Element = u8> {
    handle: Arc<Handle>,
    context: Context,
    dims: [usize; 3],
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: Element> SvmBuffer<T> {
    pub(crate) fn new(context: &Context, dims: [usize; 3], alignment: u32) -> Result<Self> {
        let api = context.api();
        let svm = api.svm()?;
        let len = dims[0]
            .checked_mul(dims[1])
            .and_then(|n| n.checked_mul(dims[2]))
            .ok_or(Error::out_of_range("svm dimensions", dims[0], dims[1], usize::MAX))?;
        let size = byte_len::<T>(len)?;

        let ctx = context.live()?;
        cl_check!(api, clRetainContext(ctx.ptr()))?;
        let raw = unsafe { (svm.clSVMAlloc)(ctx.ptr(), CL_MEM_READ_WRITE, size, alignment) };
        if raw.is_null() {
            cl_check!(api, clReleaseContext(ctx.ptr()))?;
            return Err(Error::AllocationFailed { size });
        }

        // The allocation keeps the native context alive even if `context` is
        // released first.
        let handle = Handle::with_context(api.clone(), Kind::Svm, raw, ctx.ptr());
        drop(ctx);
        if raw as usize % align_of::<T>() != 0 {
            // Dropping the handle frees the allocation.
            return Err(Error::Misaligned { align: align_of::<T>() });
        }
        debug!("svm buffer {:?} of {} bytes", dims, size);

        Ok(Self {
            handle,
            context: context.clone(),
            dims,
            len,
            _marker: PhantomData,
        })
    }

    pub(crate) fn handle(&self) -> &Arc<Handle> {
        &self.handle
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn as_ptr(&self) -> *mut T {
        self.handle.as_raw().cast()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `(len_x, len_y, len_z)`.
    pub fn dims(&self) -> (usize, usize, usize) {
        (self.dims[0], self.dims[1], self.dims[2])
    }

    pub fn byte_size(&self) -> usize {
        self.len * size_of::<T>()
    }

    fn index3(&self, x: usize, y: usize, z: usize) -> Result<usize> {
        let [lx, ly, lz] = self.dims;
        check_range("svm x", x, 1, lx)?;
        check_range("svm y", y, 1, ly)?;
        check_range("svm z", z, 1, lz)?;
        Ok(x + lx * y + lx * ly * z)
    }

    pub fn get(&self, index: usize) -> Result<T> {
        Ok(self.as_slice()?[self.checked(index)?])
    }

    pub fn set(&mut self, index: usize, value: T) -> Result<()> {
        let index = self.checked(index)?;
        self.as_mut_slice()?[index] = value;
        Ok(())
    }

    pub fn get2(&self, x: usize, y: usize) -> Result<T> {
        self.get(self.index3(x, y, 0)?)
    }

    pub fn set2(&mut self, x: usize, y: usize, value: T) -> Result<()> {
        let index = self.index3(x, y, 0)?;
        self.set(index, value)
    }

    pub fn get3(&self, x: usize, y: usize, z: usize) -> Result<T> {
        self.get(self.index3(x, y, z)?)
    }

    pub fn set3(&mut self, x: usize, y: usize, z: usize, value: T) -> Result<()> {
        let index = self.index3(x, y, z)?;
        self.set(index, value)
    }

    fn checked(&self, index: usize) -> Result<usize> {
        check_range("svm buffer", index, 1, self.len)?;
        Ok(index)
    }

    pub fn as_slice(&self) -> Result<&[T]> {
        let live = self.handle.get()?;
        Ok(unsafe { slice::from_raw_parts(live.ptr().cast::<T>(), self.len) })
    }

    pub fn as_mut_slice(&mut self) -> Result<&mut [T]> {
        let live = self.handle.get()?;
        Ok(unsafe { slice::from_raw_parts_mut(live.ptr().cast::<T>(), self.len) })
    }

    pub fn iter(&self) -> Result<slice::Iter<'_, T>> {
        Ok(self.as_slice()?.iter())
    }

    /// Makes the whole buffer host-accessible.
    pub fn map(&self, queue: &CommandQueue, blocking: bool) -> Result<Event> {
        let api = self.handle.api();
        let svm = api.svm()?;
        let buffer = self.handle.get()?;
        let q = queue.live()?;
        track(api, |event| unsafe {
            (svm.clEnqueueSVMMap)(
                q.ptr(),
                blocking as cl_bool,
                CL_MAP_READ | CL_MAP_WRITE,
                buffer.ptr(),
                self.byte_size(),
                0,
                ptr::null(),
                event,
            )
        })
    }

    /// Hands the buffer back to the device.
    pub fn unmap(&self, queue: &CommandQueue) -> Result<Event> {
        let api = self.handle.api();
        let svm = api.svm()?;
        let buffer = self.handle.get()?;
        let q = queue.live()?;
        track(api, |event| unsafe {
            (svm.clEnqueueSVMUnmap)(q.ptr(), buffer.ptr(), 0, ptr::null(), event)
        })
    }

    /// Copies `length` elements from `src[src_offset..]` into
    /// `self[dst_offset..]`.
    ///
    /// Without `blocking` the copy may still be running when this returns;
    /// wait for the event before touching either buffer from the host.
    pub fn copy_from(
        &mut self,
        queue: &CommandQueue,
        blocking: bool,
        src: &SvmBuffer<T>,
        src_offset: usize,
        dst_offset: usize,
        length: usize,
    ) -> Result<Event> {
        check_range("svm source", src_offset, length, src.len)?;
        check_range("svm buffer", dst_offset, length, self.len)?;
        let api = self.handle.api();
        let svm = api.svm()?;
        let dst = self.handle.get()?;
        let src = src.handle.get()?;
        let q = queue.live()?;
        let size = size_of::<T>();
        track(api, |event| unsafe {
            (svm.clEnqueueSVMMemcpy)(
                q.ptr(),
                blocking as cl_bool,
                dst.ptr().cast::<u8>().add(dst_offset * size).cast(),
                src.ptr().cast::<u8>().add(src_offset * size).cast(),
                length * size,
                0,
                ptr::null(),
                event,
            )
        })
    }

    /// Frees the allocation. Later calls do nothing.
    pub fn release(&mut self) -> Result<()> {
        self.handle.release()
    }
}

impl<T: Element> fmt::Debug for SvmBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SvmBuffer")
            .field("ptr", &self.handle.as_raw())
            .field("dims", &self.dims)
            .finish()
    }
}
