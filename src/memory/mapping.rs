use super::simple::byte_len;
use super::{ArrayReadWrite, Element, MemoryObject, RawMemory};
use crate::context::Context;
use crate::error::{check_range, Error, Result};
use crate::event::Event;
use crate::opencl::types::*;
use crate::queue::CommandQueue;
use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;
use tracing::warn;

/// A device buffer backed by host-accessible memory, so ranges of it can be
/// mapped into the host address space.
pub struct MappingMemory<T: Element = u8> {
    raw: RawMemory,
    _marker: PhantomData<T>,
}

const MAPPING_FLAGS: cl_mem_flags = CL_MEM_ALLOC_HOST_PTR | CL_MEM_READ_WRITE;

impl<T: Element> MappingMemory<T> {
    pub(crate) fn new(context: &Context, len: usize) -> Result<Self> {
        let raw = RawMemory::new(context, MAPPING_FLAGS, byte_len::<T>(len)?, None)?;
        Ok(Self {
            raw,
            _marker: PhantomData,
        })
    }

    pub(crate) fn from_slice(context: &Context, data: &[T]) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let raw = RawMemory::new(context, MAPPING_FLAGS, bytes.len(), Some(bytes))?;
        Ok(Self {
            raw,
            _marker: PhantomData,
        })
    }

    pub fn context(&self) -> &Context {
        self.raw.context()
    }

    pub fn as_raw(&self) -> cl_mem {
        self.raw.as_raw()
    }

    /// Enqueues a map of `byte_len` bytes at `byte_offset` for reading and
    /// writing.
    ///
    /// # Safety
    ///
    /// The returned pointer may only be used once the event has completed
    /// and until it is passed to [`unmap_raw`](Self::unmap_raw).
    pub unsafe fn map_raw(
        &self,
        queue: &CommandQueue,
        blocking: bool,
        byte_offset: usize,
        byte_len: usize,
        deps: &[&Event],
    ) -> Result<(*mut c_void, Event)> {
        self.raw.map(
            queue,
            blocking,
            CL_MAP_READ | CL_MAP_WRITE,
            byte_offset,
            byte_len,
            deps,
        )
    }

    /// # Safety
    ///
    /// `mapped` must come from [`map_raw`](Self::map_raw) on this buffer and
    /// must not be used afterwards.
    pub unsafe fn unmap_raw(&self, queue: &CommandQueue, mapped: *mut c_void, deps: &[&Event]) -> Result<Event> {
        self.raw.unmap(queue, mapped, deps)
    }

    /// Maps elements `offset..offset + length` into host memory.
    ///
    /// The map starts after `deps`. The region waits for the map to complete
    /// before it is returned and is unmapped once, by [`MappedRegion::unmap`]
    /// or on drop.
    pub fn map<'a>(
        &'a mut self,
        queue: &'a CommandQueue,
        blocking: bool,
        offset: usize,
        length: usize,
        deps: &[&Event],
    ) -> Result<MappedRegion<'a, T>> {
        check_range("buffer", offset, length, self.len())?;
        let size = size_of::<T>();
        let (mapped, event) = unsafe { self.map_raw(queue, blocking, offset * size, length * size, deps)? };

        let region = MappedRegion {
            memory: &self.raw,
            queue,
            ptr: NonNull::new(mapped.cast::<T>()).ok_or(Error::NullHandle("clEnqueueMapBuffer"))?,
            len: length,
            mapped: true,
        };
        // Dropping the region on error unmaps it again.
        event.wait()?;
        if mapped as usize % align_of::<T>() != 0 {
            return Err(Error::Misaligned { align: align_of::<T>() });
        }
        Ok(region)
    }
}

impl<T: Element> MemoryObject for MappingMemory<T> {
    fn raw_memory(&self) -> &RawMemory {
        &self.raw
    }
}

impl<T: Element> ArrayReadWrite<T> for MappingMemory<T> {}

impl<T: Element> fmt::Debug for MappingMemory<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingMemory")
            .field("raw", &self.raw.as_raw())
            .field("len", &self.len())
            .finish()
    }
}

/// A mapped range of a [`MappingMemory`], usable as a host slice.
pub struct MappedRegion<'a, T: Element> {
    memory: &'a RawMemory,
    queue: &'a CommandQueue,
    ptr: NonNull<T>,
    len: usize,
    mapped: bool,
}

impl<T: Element> MappedRegion<'_, T> {
    pub fn get(&self, index: usize) -> Result<T> {
        check_range("mapped region", index, 1, self.len)?;
        Ok(self[index])
    }

    pub fn set(&mut self, index: usize, value: T) -> Result<()> {
        check_range("mapped region", index, 1, self.len)?;
        self[index] = value;
        Ok(())
    }

    /// Unmaps the region; the returned event completes once the device sees
    /// the host writes.
    pub fn unmap(mut self) -> Result<Event> {
        self.mapped = false;
        unsafe { self.memory.unmap(self.queue, self.ptr.as_ptr().cast(), &[]) }
    }
}

impl<T: Element> Deref for MappedRegion<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T: Element> DerefMut for MappedRegion<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<'r, T: Element> IntoIterator for &'r MappedRegion<'_, T> {
    type Item = &'r T;
    type IntoIter = slice::Iter<'r, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T: Element> Drop for MappedRegion<'_, T> {
    fn drop(&mut self) {
        if !self.mapped {
            return;
        }
        let result = unsafe { self.memory.unmap(self.queue, self.ptr.as_ptr().cast(), &[]) }
            .and_then(|event| event.wait().map(|_| ()));
        if let Err(e) = result {
            warn!("failed to unmap region on drop: {}", e);
        }
    }
}

impl<T: Element + fmt::Debug> fmt::Debug for MappedRegion<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, DriverKind};

    fn setup() -> (Context, CommandQueue) {
        let context = Context::from_config(&Config::new().with_driver(DriverKind::Soft)).unwrap();
        let queue = context.create_command_queue(0).unwrap();
        (context, queue)
    }

    #[test]
    fn map_sees_written_data() {
        let (context, queue) = setup();
        let mut memory = context.create_mapping_memory_from(&[1.5f32, 2.5, 3.5, 4.5]).unwrap();

        let region = memory.map(&queue, true, 1, 2, &[]).unwrap();
        assert_eq!(&*region, &[2.5, 3.5]);
        assert_eq!(region.get(1).unwrap(), 3.5);
        assert!(region.get(2).is_err());
        // Iteration restarts from the beginning each time.
        assert_eq!(region.iter().count(), 2);
        assert_eq!(region.iter().copied().sum::<f32>(), 6.0);
    }

    #[test]
    fn host_writes_are_visible_after_unmap() {
        let (context, queue) = setup();
        let mut memory = context.create_mapping_memory::<i64>(4).unwrap();
        memory.write(&queue, &[0; 4], &[]).unwrap();

        let mut region = memory.map(&queue, false, 0, 4, &[]).unwrap();
        region.set(0, -7).unwrap();
        region[3] = 9;
        assert!(matches!(region.set(4, 1), Err(Error::OutOfRange { .. })));
        region.unmap().unwrap().wait().unwrap();

        assert_eq!(memory.to_vec(&queue, &[]).unwrap(), vec![-7, 0, 0, 9]);
    }

    #[test]
    fn drop_unmaps() {
        let (context, queue) = setup();
        let mut memory = context.create_mapping_memory::<u8>(8).unwrap();
        {
            let mut region = memory.map(&queue, true, 0, 8, &[]).unwrap();
            region.fill(0xAB);
        }
        assert_eq!(memory.to_vec(&queue, &[]).unwrap(), vec![0xAB; 8]);
        assert!(matches!(
            memory.map(&queue, true, 4, 5, &[]),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn raw_map_round_trip() {
        let (context, queue) = setup();
        let memory = context.create_mapping_memory_bytes(16).unwrap();
        unsafe {
            let (ptr, event) = memory.map_raw(&queue, true, 4, 4, &[]).unwrap();
            event.wait().unwrap();
            std::ptr::write_bytes(ptr.cast::<u8>(), 0x11, 4);
            memory.unmap_raw(&queue, ptr, &[]).unwrap();
            let err = memory.unmap_raw(&queue, ptr, &[]).unwrap_err();
            assert_eq!(err.code(), Some(CL_INVALID_VALUE));
        }
        let bytes = memory.to_vec(&queue, &[]).unwrap();
        assert_eq!(&bytes[4..8], &[0x11; 4]);
    }
}
