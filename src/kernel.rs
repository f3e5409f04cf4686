//! Kernel argument binding and dispatch.
//!
//! A kernel remembers the last value bound to each argument slot and the last
//! global and local work sizes, so repeated dispatches only need to rebind
//! what changed.

use crate::cl_check;
use crate::cl_create;
use crate::error::{Error, Result};
use crate::event::{track, Event, WaitList};
use crate::handle::{Handle, Kind, RawPtr};
use crate::memory::{Element, MappingMemory, MemoryObject, SimpleMemory, SvmBuffer};
use crate::opencl::types::*;
use crate::opencl::utils::{info_string, info_value, to_c_string};
use crate::program::Program;
use crate::queue::CommandQueue;
use std::fmt;
use std::mem;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// A scalar kernel argument, bound by value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl Scalar {
    /// The bytes handed to `clSetKernelArg`.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::I8(v) => bytemuck::bytes_of(v),
            Self::U8(v) => bytemuck::bytes_of(v),
            Self::I16(v) => bytemuck::bytes_of(v),
            Self::U16(v) => bytemuck::bytes_of(v),
            Self::I32(v) => bytemuck::bytes_of(v),
            Self::U32(v) => bytemuck::bytes_of(v),
            Self::I64(v) => bytemuck::bytes_of(v),
            Self::U64(v) => bytemuck::bytes_of(v),
            Self::F32(v) => bytemuck::bytes_of(v),
            Self::F64(v) => bytemuck::bytes_of(v),
        }
    }
}

/// Size of a `__local` argument, allocated per work-group by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMemorySize(usize);

impl LocalMemorySize {
    pub fn new(bytes: usize) -> Self {
        Self(bytes)
    }

    /// Room for `count` elements of `T`.
    pub fn of<T>(count: usize) -> Self {
        Self(count * mem::size_of::<T>())
    }

    pub fn bytes(self) -> usize {
        self.0
    }
}

/// A memory object or SVM allocation captured as a kernel argument.
#[derive(Clone)]
pub struct ObjectArg {
    handle: Arc<Handle>,
}

impl fmt::Debug for ObjectArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectArg({:p})", self.handle.as_raw())
    }
}

#[derive(Debug, Clone)]
pub enum KernelArg {
    Scalar(Scalar),
    Memory(ObjectArg),
    Svm(ObjectArg),
    Local(LocalMemorySize),
}

macro_rules! scalar_arg {
    ($($ty:ty => $variant:ident),* $(,)?) => {$(
        impl From<$ty> for Scalar {
            fn from(v: $ty) -> Self {
                Scalar::$variant(v)
            }
        }

        impl From<$ty> for KernelArg {
            fn from(v: $ty) -> Self {
                KernelArg::Scalar(Scalar::$variant(v))
            }
        }
    )*};
}

scalar_arg! {
    i8 => I8, u8 => U8, i16 => I16, u16 => U16, i32 => I32,
    u32 => U32, i64 => I64, u64 => U64, f32 => F32, f64 => F64,
}

impl From<Scalar> for KernelArg {
    fn from(v: Scalar) -> Self {
        KernelArg::Scalar(v)
    }
}

impl From<LocalMemorySize> for KernelArg {
    fn from(v: LocalMemorySize) -> Self {
        KernelArg::Local(v)
    }
}

impl<T: Element> From<&SimpleMemory<T>> for KernelArg {
    fn from(memory: &SimpleMemory<T>) -> Self {
        KernelArg::Memory(ObjectArg {
            handle: memory.raw_memory().handle().clone(),
        })
    }
}

impl<T: Element> From<&MappingMemory<T>> for KernelArg {
    fn from(memory: &MappingMemory<T>) -> Self {
        KernelArg::Memory(ObjectArg {
            handle: memory.raw_memory().handle().clone(),
        })
    }
}

impl<T: Element> From<&SvmBuffer<T>> for KernelArg {
    fn from(buffer: &SvmBuffer<T>) -> Self {
        KernelArg::Svm(ObjectArg {
            handle: buffer.handle().clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WorkSize {
    dims: [usize; 3],
    len: usize,
}

impl WorkSize {
    fn new(sizes: &[usize]) -> Result<Self> {
        if sizes.is_empty() || sizes.len() > 3 {
            return Err(Error::InvalidDimensions(sizes.len()));
        }
        let mut dims = [1; 3];
        dims[..sizes.len()].copy_from_slice(sizes);
        Ok(Self {
            dims,
            len: sizes.len(),
        })
    }

    fn as_slice(&self) -> &[usize] {
        &self.dims[..self.len]
    }
}

impl Default for WorkSize {
    fn default() -> Self {
        Self { dims: [1; 3], len: 1 }
    }
}

/// What a slot is bound to. Memory slots keep the object alive and own the
/// host copy of the `cl_mem` value handed to the driver.
enum Bound {
    Scalar(Scalar),
    Memory {
        _value: Box<RawPtr>,
        _object: Arc<Handle>,
    },
    Svm(Arc<Handle>),
    Local(LocalMemorySize),
}

#[derive(Default)]
struct KernelState {
    args: Vec<Option<Bound>>,
    work_size: Option<WorkSize>,
    local_size: Option<WorkSize>,
}

impl KernelState {
    fn bind(&mut self, index: usize, bound: Bound) {
        if self.args.len() <= index {
            self.args.resize_with(index + 1, || None);
        }
        self.args[index] = Some(bound);
    }
}

/// A kernel function of a built program.
///
/// Clones share the native kernel and its bound state.
#[derive(Clone)]
pub struct Kernel {
    handle: Arc<Handle>,
    program: Program,
    name: Arc<str>,
    state: Arc<Mutex<KernelState>>,
}

impl Kernel {
    pub fn new(program: &Program, name: &str) -> Result<Self> {
        let api = program.context().api();
        let c_name = to_c_string(name)?;
        let raw = {
            let prog = program.live()?;
            cl_create!(api, clCreateKernel(prog.ptr(), c_name.as_ptr()))?
        };

        Ok(Self {
            handle: Handle::new(api.clone(), Kind::Kernel, raw),
            program: program.clone(),
            name: name.into(),
            state: Arc::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn as_raw(&self) -> cl_kernel {
        self.handle.as_raw()
    }

    fn state(&self) -> MutexGuard<'_, KernelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of parameters the kernel function declares.
    pub fn num_args(&self) -> Result<u32> {
        let kernel = self.handle.get()?;
        let api = self.handle.api();
        info_value(|size, value, size_ret| unsafe {
            (api.clGetKernelInfo)(kernel.ptr(), CL_KERNEL_NUM_ARGS, size, value, size_ret)
        })
    }

    /// The function name as reported by the driver.
    pub fn function_name(&self) -> Result<String> {
        let kernel = self.handle.get()?;
        let api = self.handle.api();
        info_string(|size, value, size_ret| unsafe {
            (api.clGetKernelInfo)(kernel.ptr(), CL_KERNEL_FUNCTION_NAME, size, value, size_ret)
        })
    }

    /// Binds argument slot `index`. The value stays bound across dispatches
    /// until the slot is set again.
    pub fn set_arg(&self, index: u32, arg: impl Into<KernelArg>) -> Result<()> {
        let kernel = self.handle.get()?;
        let api = self.handle.api();
        let mut state = self.state();

        let bound = match arg.into() {
            KernelArg::Scalar(value) => {
                let bytes = value.as_bytes();
                cl_check!(
                    api,
                    clSetKernelArg(kernel.ptr(), index, bytes.len(), bytes.as_ptr().cast())
                )?;
                Bound::Scalar(value)
            }
            KernelArg::Memory(object) => {
                let value = Box::new(RawPtr(object.handle.get()?.ptr()));
                let value_ptr: *const RawPtr = &*value;
                cl_check!(
                    api,
                    clSetKernelArg(kernel.ptr(), index, mem::size_of::<cl_mem>(), value_ptr.cast())
                )?;
                Bound::Memory {
                    _value: value,
                    _object: object.handle,
                }
            }
            KernelArg::Svm(object) => {
                let svm = api.svm()?;
                {
                    let target = object.handle.get()?;
                    cl_check!(svm, clSetKernelArgSVMPointer(kernel.ptr(), index, target.ptr()))?;
                }
                Bound::Svm(object.handle)
            }
            KernelArg::Local(size) => {
                cl_check!(
                    api,
                    clSetKernelArg(kernel.ptr(), index, size.bytes(), ptr::null())
                )?;
                Bound::Local(size)
            }
        };

        trace!("kernel {} arg {} bound", self.name, index);
        state.bind(index as usize, bound);
        Ok(())
    }

    /// Binds `args` to slots `0..n` in order.
    pub fn set_args<I>(&self, args: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Into<KernelArg>,
    {
        for (index, arg) in args.into_iter().enumerate() {
            self.set_arg(index as u32, arg)?;
        }
        Ok(())
    }

    /// Sets the global work size (1 to 3 dimensions).
    pub fn set_work_size(&self, sizes: &[usize]) -> Result<()> {
        let size = WorkSize::new(sizes)?;
        self.state().work_size = Some(size);
        Ok(())
    }

    /// Sets the work-group size (1 to 3 dimensions). Without one the driver
    /// picks the work-group size.
    pub fn set_local_size(&self, sizes: &[usize]) -> Result<()> {
        let size = WorkSize::new(sizes)?;
        self.state().local_size = Some(size);
        Ok(())
    }

    pub fn clear_local_size(&self) {
        self.state().local_size = None;
    }

    pub fn work_size(&self) -> Vec<usize> {
        self.state().work_size.unwrap_or_default().as_slice().to_vec()
    }

    /// Enqueues the kernel with whatever is currently bound.
    ///
    /// A kernel whose work size was never set runs as a single work item.
    pub fn dispatch(&self, queue: &CommandQueue, deps: &[&Event]) -> Result<Event> {
        let (global, local) = {
            let state = self.state();
            (state.work_size.unwrap_or_default(), state.local_size)
        };
        if let Some(local) = local {
            if local.len != global.len {
                return Err(Error::DimensionMismatch {
                    global: global.len,
                    local: local.len,
                });
            }
        }

        let api = self.handle.api();
        let kernel = self.handle.get()?;
        let q = queue.live()?;
        let waits = WaitList::new(deps)?;
        let local_ptr = local.as_ref().map_or(ptr::null(), |l| l.dims.as_ptr());

        trace!("dispatch {} over {:?}", self.name, global.as_slice());
        track(api, |event| unsafe {
            (api.clEnqueueNDRangeKernel)(
                q.ptr(),
                kernel.ptr(),
                global.len as cl_uint,
                ptr::null(),
                global.dims.as_ptr(),
                local_ptr,
                waits.len(),
                waits.as_ptr(),
                event,
            )
        })
    }

    /// Sets the work size, binds `args` from slot 0 and dispatches.
    pub fn run<I>(&self, queue: &CommandQueue, work_size: &[usize], args: I, deps: &[&Event]) -> Result<Event>
    where
        I: IntoIterator,
        I::Item: Into<KernelArg>,
    {
        self.set_work_size(work_size)?;
        self.set_args(args)?;
        self.dispatch(queue, deps)
    }

    /// Releases the kernel and drops every bound argument.
    pub fn release(&self) -> Result<()> {
        self.handle.release()?;
        *self.state() = KernelState::default();
        Ok(())
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("raw", &self.handle.as_raw())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::{self, Param};
    use crate::{ArrayReadWrite, Config, Context, DriverKind};

    const FILL_SOURCE: &str = "kernel void kernel_test_fill(global int* out, int value) {
        out[get_global_id(0)] = value;
    }";

    fn setup() -> (Context, CommandQueue, Kernel) {
        soft::register_kernel("kernel_test_fill", &[Param::Buffer, Param::Scalar(4)], |item| {
            let i = item.global_id(0);
            let value: i32 = item.scalar(1)?;
            item.write(0, i, value)
        });
        let context = Context::from_config(&Config::new().with_driver(DriverKind::Soft)).unwrap();
        let queue = context.create_command_queue(0).unwrap();
        let kernel = context.create_kernel(FILL_SOURCE, "kernel_test_fill").unwrap();
        (context, queue, kernel)
    }

    #[test]
    fn scalar_widths() {
        assert_eq!(Scalar::from(1i8).as_bytes().len(), 1);
        assert_eq!(Scalar::from(1u16).as_bytes().len(), 2);
        assert_eq!(Scalar::from(1.0f32).as_bytes(), 1.0f32.to_ne_bytes());
        assert_eq!(Scalar::from(-2i64).as_bytes(), (-2i64).to_ne_bytes());
        assert_eq!(Scalar::from(3.5f64).as_bytes().len(), 8);
        assert_eq!(LocalMemorySize::of::<f32>(16).bytes(), 64);
    }

    #[test]
    fn work_size_dimensions() {
        let (_context, _queue, kernel) = setup();
        assert_eq!(kernel.work_size(), vec![1]);
        assert!(matches!(kernel.set_work_size(&[]), Err(Error::InvalidDimensions(0))));
        assert!(matches!(
            kernel.set_work_size(&[1, 2, 3, 4]),
            Err(Error::InvalidDimensions(4))
        ));
        kernel.set_work_size(&[4, 2]).unwrap();
        assert_eq!(kernel.work_size(), vec![4, 2]);
    }

    #[test]
    fn arguments_persist_between_dispatches() {
        let (context, queue, kernel) = setup();
        let out = context.create_simple_memory::<i32>(8).unwrap();

        kernel.set_arg(0, &out).unwrap();
        kernel.set_arg(1, 5i32).unwrap();
        kernel.set_work_size(&[4]).unwrap();
        kernel.dispatch(&queue, &[]).unwrap().wait().unwrap();

        // Only the work size changes; both arguments stay bound.
        kernel.set_work_size(&[8]).unwrap();
        kernel.dispatch(&queue, &[]).unwrap();

        let mut host = [0i32; 8];
        out.read(&queue, &mut host, &[]).unwrap();
        assert_eq!(host, [5; 8]);
        assert_eq!(kernel.num_args().unwrap(), 2);
        assert_eq!(kernel.function_name().unwrap(), "kernel_test_fill");
    }

    #[test]
    fn unbound_argument_is_reported() {
        let (_context, queue, kernel) = setup();
        kernel.set_arg(1, 1i32).unwrap();
        let err = kernel.dispatch(&queue, &[]).unwrap_err();
        assert_eq!(err.code(), Some(CL_INVALID_KERNEL_ARGS));
    }

    #[test]
    fn wrong_scalar_width_is_reported() {
        let (_context, _queue, kernel) = setup();
        let err = kernel.set_arg(1, 1i64).unwrap_err();
        assert_eq!(err.code(), Some(CL_INVALID_ARG_SIZE));
        let err = kernel.set_arg(7, 1i32).unwrap_err();
        assert_eq!(err.code(), Some(CL_INVALID_ARG_INDEX));
    }

    #[test]
    fn local_size_must_match_dimensions() {
        let (context, queue, kernel) = setup();
        let out = context.create_simple_memory::<i32>(16).unwrap();
        kernel.set_args([KernelArg::from(&out), KernelArg::from(2i32)]).unwrap();
        kernel.set_work_size(&[16]).unwrap();
        kernel.set_local_size(&[4, 4]).unwrap();
        assert!(matches!(
            kernel.dispatch(&queue, &[]),
            Err(Error::DimensionMismatch { global: 1, local: 2 })
        ));

        kernel.set_local_size(&[3]).unwrap();
        let err = kernel.dispatch(&queue, &[]).unwrap_err();
        assert_eq!(err.code(), Some(CL_INVALID_WORK_GROUP_SIZE));

        kernel.set_local_size(&[4]).unwrap();
        kernel.dispatch(&queue, &[]).unwrap();
        kernel.clear_local_size();
        kernel.dispatch(&queue, &[]).unwrap();
    }

    #[test]
    fn release_drops_bound_memory() {
        let (context, _queue, kernel) = setup();
        let out = context.create_simple_memory::<i32>(4).unwrap();
        let raw = out.as_raw();
        kernel.set_arg(0, &out).unwrap();
        drop(out);
        // The kernel still holds the buffer.
        assert!(soft::is_live(raw));

        kernel.release().unwrap();
        kernel.release().unwrap();
        assert!(!soft::is_live(raw));
        assert!(matches!(kernel.set_arg(1, 1i32), Err(Error::Released("kernel"))));
    }
}
