use super::{ArrayReadWrite, Element, MemoryObject, RawMemory};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::opencl::types::*;
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;

/// A read-write device buffer of `T`, accessed through explicit transfers.
pub struct SimpleMemory<T: Element = u8> {
    raw: RawMemory,
    _marker: PhantomData<T>,
}

pub(crate) fn byte_len<T>(len: usize) -> Result<usize> {
    len.checked_mul(size_of::<T>())
        .ok_or(Error::out_of_range("element count", len, size_of::<T>(), usize::MAX))
}

impl<T: Element> SimpleMemory<T> {
    pub(crate) fn new(context: &Context, len: usize) -> Result<Self> {
        let raw = RawMemory::new(context, CL_MEM_READ_WRITE, byte_len::<T>(len)?, None)?;
        Ok(Self {
            raw,
            _marker: PhantomData,
        })
    }

    pub(crate) fn from_slice(context: &Context, data: &[T]) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let raw = RawMemory::new(context, CL_MEM_READ_WRITE, bytes.len(), Some(bytes))?;
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
}

impl<T: Element> MemoryObject for SimpleMemory<T> {
    fn raw_memory(&self) -> &RawMemory {
        &self.raw
    }
}

impl<T: Element> ArrayReadWrite<T> for SimpleMemory<T> {}

impl<T: Element> fmt::Debug for SimpleMemory<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleMemory")
            .field("raw", &self.raw.as_raw())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, DriverKind};

    fn context() -> Context {
        Context::from_config(&Config::new().with_driver(DriverKind::Soft)).unwrap()
    }

    #[test]
    fn sizes_are_in_elements() {
        let context = context();
        let memory = context.create_simple_memory::<f64>(10).unwrap();
        assert_eq!(memory.len(), 10);
        assert_eq!(memory.byte_size(), 80);
        assert!(!memory.is_empty());
    }

    #[test]
    fn created_from_host_data() {
        let context = context();
        let queue = context.create_command_queue(0).unwrap();
        let memory = context.create_simple_memory_from(&[1u16, 2, 3, 4]).unwrap();
        assert_eq!(memory.to_vec(&queue, &[]).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn zero_length_is_rejected_by_driver() {
        let err = context().create_simple_memory::<u32>(0).unwrap_err();
        assert_eq!(err.code(), Some(CL_INVALID_BUFFER_SIZE));
    }

    #[test]
    fn oversized_element_count() {
        assert!(matches!(
            context().create_simple_memory::<u64>(usize::MAX / 4),
            Err(Error::OutOfRange { what: "element count", .. })
        ));
    }

    #[test]
    fn copy_within_and_across() {
        let context = context();
        let queue = context.create_command_queue(0).unwrap();
        let a = context.create_simple_memory_from(&[1i32, 2, 3, 4, 5, 6]).unwrap();
        let b = context.create_simple_memory::<i32>(6).unwrap();
        b.write(&queue, &[0; 6], &[]).unwrap();

        let elem = size_of::<i32>();
        a.copy(&queue, 0, 3 * elem, 3 * elem, &[]).unwrap();
        assert_eq!(a.to_vec(&queue, &[]).unwrap(), vec![1, 2, 3, 1, 2, 3]);

        b.copy_from(&queue, &a, elem, 0, 2 * elem, &[]).unwrap();
        assert_eq!(b.to_vec(&queue, &[]).unwrap(), vec![2, 3, 0, 0, 0, 0]);

        let err = a.copy(&queue, 0, elem, 2 * elem, &[]).unwrap_err();
        assert_eq!(err.code(), Some(CL_MEM_COPY_OVERLAP));
    }
}
