//! Device memory objects.
//!
//! [`SimpleMemory`] and [`MappingMemory`] are `cl_mem` buffers that share the
//! byte-level [`MemoryObject`] contract and the typed [`ArrayReadWrite`]
//! layer. [`SvmBuffer`] is shared virtual memory indexed directly from host
//! code.

mod mapping;
mod raw;
mod simple;
mod svm;

pub use mapping::{MappedRegion, MappingMemory};
pub use raw::RawMemory;
pub use simple::SimpleMemory;
pub use svm::SvmBuffer;

use crate::error::{check_range, Result};
use crate::event::Event;
use crate::queue::CommandQueue;
use bytemuck::Pod;
use std::ffi::c_void;
use std::mem::size_of;

/// Element type of a typed buffer.
///
/// Any plain-old-data type qualifies; it is copied to and from the device as
/// raw bytes.
pub trait Element: Pod + Send + Sync + 'static {}

impl<T: Pod + Send + Sync + 'static> Element for T {}

/// Byte-level operations shared by every `cl_mem` buffer.
pub trait MemoryObject {
    #[doc(hidden)]
    fn raw_memory(&self) -> &RawMemory;

    /// Size in bytes.
    fn byte_size(&self) -> usize {
        self.raw_memory().size()
    }

    /// Enqueues a write of `byte_len` bytes from `src` at `byte_offset`.
    ///
    /// # Safety
    ///
    /// `src` must be valid for `byte_len` bytes until the returned event
    /// completes (immediately, when `blocking`). Bounds are not checked.
    unsafe fn write_raw(
        &self,
        queue: &CommandQueue,
        blocking: bool,
        byte_offset: usize,
        byte_len: usize,
        src: *const c_void,
        deps: &[&Event],
    ) -> Result<Event> {
        self.raw_memory()
            .write(queue, blocking, byte_offset, byte_len, src, deps)
    }

    /// Enqueues a read of `byte_len` bytes at `byte_offset` into `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of `byte_len` bytes until the returned
    /// event completes. Bounds are not checked.
    unsafe fn read_raw(
        &self,
        queue: &CommandQueue,
        blocking: bool,
        byte_offset: usize,
        byte_len: usize,
        dst: *mut c_void,
        deps: &[&Event],
    ) -> Result<Event> {
        self.raw_memory()
            .read(queue, blocking, byte_offset, byte_len, dst, deps)
    }

    /// Copies `byte_len` bytes within this buffer.
    fn copy(
        &self,
        queue: &CommandQueue,
        src_offset: usize,
        dst_offset: usize,
        byte_len: usize,
        deps: &[&Event],
    ) -> Result<Event> {
        let raw = self.raw_memory();
        raw.copy_from(queue, raw, src_offset, dst_offset, byte_len, deps)
    }

    /// Copies `byte_len` bytes from `src` into this buffer.
    fn copy_from<M: MemoryObject + ?Sized>(
        &self,
        queue: &CommandQueue,
        src: &M,
        src_offset: usize,
        dst_offset: usize,
        byte_len: usize,
        deps: &[&Event],
    ) -> Result<Event>
    where
        Self: Sized,
    {
        self.raw_memory()
            .copy_from(queue, src.raw_memory(), src_offset, dst_offset, byte_len, deps)
    }

    fn release(&self) -> Result<()> {
        self.raw_memory().release()
    }
}

/// Element-typed transfers between host slices and a buffer.
///
/// Offsets and lengths count elements of `T`. The safe calls block until the
/// transfer completes because the host slice is only borrowed for the call.
pub trait ArrayReadWrite<T: Element>: MemoryObject {
    /// Number of elements.
    fn len(&self) -> usize {
        self.byte_size() / size_of::<T>()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self, queue: &CommandQueue, data: &[T], deps: &[&Event]) -> Result<Event> {
        self.write_range(queue, 0, data.len(), data, 0, deps)
    }

    fn write_at(&self, queue: &CommandQueue, offset: usize, data: &[T], deps: &[&Event]) -> Result<Event> {
        self.write_range(queue, offset, data.len(), data, 0, deps)
    }

    /// Writes `data[data_offset..data_offset + length]` to elements
    /// `buffer_offset..buffer_offset + length`.
    fn write_range(
        &self,
        queue: &CommandQueue,
        buffer_offset: usize,
        length: usize,
        data: &[T],
        data_offset: usize,
        deps: &[&Event],
    ) -> Result<Event> {
        check_range("buffer", buffer_offset, length, self.len())?;
        check_range("data", data_offset, length, data.len())?;
        let size = size_of::<T>();
        unsafe {
            self.write_raw(
                queue,
                true,
                buffer_offset * size,
                length * size,
                data.as_ptr().add(data_offset).cast(),
                deps,
            )
        }
    }

    /// Non-blocking [`write_range`](Self::write_range).
    ///
    /// # Safety
    ///
    /// `data` must stay alive and unmodified until the returned event
    /// completes.
    unsafe fn write_range_nonblocking(
        &self,
        queue: &CommandQueue,
        buffer_offset: usize,
        length: usize,
        data: &[T],
        data_offset: usize,
        deps: &[&Event],
    ) -> Result<Event> {
        check_range("buffer", buffer_offset, length, self.len())?;
        check_range("data", data_offset, length, data.len())?;
        let size = size_of::<T>();
        self.write_raw(
            queue,
            false,
            buffer_offset * size,
            length * size,
            data.as_ptr().add(data_offset).cast(),
            deps,
        )
    }

    fn read(&self, queue: &CommandQueue, data: &mut [T], deps: &[&Event]) -> Result<Event> {
        let length = data.len();
        self.read_range(queue, 0, length, data, 0, deps)
    }

    fn read_at(&self, queue: &CommandQueue, offset: usize, data: &mut [T], deps: &[&Event]) -> Result<Event> {
        let length = data.len();
        self.read_range(queue, offset, length, data, 0, deps)
    }

    /// Reads elements `buffer_offset..buffer_offset + length` into
    /// `data[data_offset..data_offset + length]`.
    fn read_range(
        &self,
        queue: &CommandQueue,
        buffer_offset: usize,
        length: usize,
        data: &mut [T],
        data_offset: usize,
        deps: &[&Event],
    ) -> Result<Event> {
        check_range("buffer", buffer_offset, length, self.len())?;
        check_range("data", data_offset, length, data.len())?;
        let size = size_of::<T>();
        unsafe {
            self.read_raw(
                queue,
                true,
                buffer_offset * size,
                length * size,
                data.as_mut_ptr().add(data_offset).cast(),
                deps,
            )
        }
    }

    /// Non-blocking [`read_range`](Self::read_range).
    ///
    /// # Safety
    ///
    /// `data` must stay alive and must not be accessed until the returned
    /// event completes.
    unsafe fn read_range_nonblocking(
        &self,
        queue: &CommandQueue,
        buffer_offset: usize,
        length: usize,
        data: &mut [T],
        data_offset: usize,
        deps: &[&Event],
    ) -> Result<Event> {
        check_range("buffer", buffer_offset, length, self.len())?;
        check_range("data", data_offset, length, data.len())?;
        let size = size_of::<T>();
        self.read_raw(
            queue,
            false,
            buffer_offset * size,
            length * size,
            data.as_mut_ptr().add(data_offset).cast(),
            deps,
        )
    }

    /// Reads the whole buffer into a new vector.
    fn to_vec(&self, queue: &CommandQueue, deps: &[&Event]) -> Result<Vec<T>> {
        let mut data = vec![<T as bytemuck::Zeroable>::zeroed(); self.len()];
        self.read(queue, &mut data, deps)?;
        Ok(data)
    }
}
