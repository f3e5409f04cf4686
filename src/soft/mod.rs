//! In-process software OpenCL driver.
//!
//! [`api`] returns an [`Api`] whose entry points run on the host instead of a
//! device. It keeps one platform with one CPU device, validates handles,
//! ranges, argument sizes and work dimensions, and reports failures with the
//! same status codes a native driver uses. Commands execute eagerly: every
//! returned event is already complete.
//!
//! Kernel functions are host closures registered with [`register_kernel`]. A
//! program builds when each `kernel void name(...)` it declares has a
//! registered implementation with a matching parameter count.

mod entry;
mod kernels;

pub use kernels::{register_kernel, KernelBody, Param, WorkItem};

use crate::opencl::bindings::{Api, ApiOrigin, SvmApi};
use crate::opencl::types::*;
use kernels::KernelDef;
use std::alloc::{self, Layout};
use std::collections::BTreeMap;
use std::ffi::{c_char, c_void};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Instant;

pub const PLATFORM_NAME: &str = "oclwrap soft platform";
pub const DEVICE_NAME: &str = "oclwrap soft device";

pub(crate) const PLATFORM_ID: usize = 0x10;
pub(crate) const DEVICE_ID: usize = 0x20;

pub(crate) const MAX_WORK_GROUP_SIZE: usize = 1024;
pub(crate) const MAX_MEM_ALLOC_SIZE: u64 = 256 << 20;
pub(crate) const GLOBAL_MEM_SIZE: u64 = 1 << 30;
pub(crate) const LOCAL_MEM_SIZE: u64 = 32 << 10;
const MIN_ALIGN: usize = 128;
const FIRST_ID: usize = 0x1000;
const ID_STEP: usize = 0x10;

/// The driver table backed by this module.
pub fn api() -> Api {
    Api {
        origin: ApiOrigin::Soft,
        clGetPlatformIDs: entry::get_platform_ids,
        clGetPlatformInfo: entry::get_platform_info,
        clGetDeviceIDs: entry::get_device_ids,
        clGetDeviceInfo: entry::get_device_info,
        clCreateContext: entry::create_context,
        clRetainContext: entry::retain_context,
        clReleaseContext: entry::release_context,
        clCreateCommandQueue: entry::create_command_queue,
        clReleaseCommandQueue: entry::release_command_queue,
        clFlush: entry::flush,
        clFinish: entry::finish,
        clCreateProgramWithSource: entry::create_program_with_source,
        clBuildProgram: entry::build_program,
        clGetProgramBuildInfo: entry::get_program_build_info,
        clReleaseProgram: entry::release_program,
        clCreateKernel: entry::create_kernel,
        clGetKernelInfo: entry::get_kernel_info,
        clSetKernelArg: entry::set_kernel_arg,
        clReleaseKernel: entry::release_kernel,
        clEnqueueNDRangeKernel: entry::enqueue_nd_range_kernel,
        clCreateBuffer: entry::create_buffer,
        clReleaseMemObject: entry::release_mem_object,
        clEnqueueReadBuffer: entry::enqueue_read_buffer,
        clEnqueueWriteBuffer: entry::enqueue_write_buffer,
        clEnqueueCopyBuffer: entry::enqueue_copy_buffer,
        clEnqueueMapBuffer: entry::enqueue_map_buffer,
        clEnqueueUnmapMemObject: entry::enqueue_unmap_mem_object,
        clWaitForEvents: entry::wait_for_events,
        clGetEventInfo: entry::get_event_info,
        clGetEventProfilingInfo: entry::get_event_profiling_info,
        clReleaseEvent: entry::release_event,
        svm: Some(SvmApi {
            clSVMAlloc: entry::svm_alloc,
            clSVMFree: entry::svm_free,
            clSetKernelArgSVMPointer: entry::set_kernel_arg_svm_pointer,
            clEnqueueSVMMap: entry::enqueue_svm_map,
            clEnqueueSVMUnmap: entry::enqueue_svm_unmap,
            clEnqueueSVMMemcpy: entry::enqueue_svm_memcpy,
        }),
        _lib: None,
    }
}

/// Whether `handle` names an object or SVM allocation that has not been
/// released yet.
pub fn is_live(handle: *mut c_void) -> bool {
    let state = state();
    let key = handle as usize;
    state.objects.contains_key(&key) || state.svm.contains_key(&key)
}

/// Zeroed host memory with a fixed address and alignment.
pub(crate) struct Storage {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The driver lock serialises every access to the bytes.
unsafe impl Send for Storage {}

impl Storage {
    /// `align` of zero picks the default; otherwise it must be a power of two.
    pub(crate) fn new(size: usize, align: usize) -> Option<Self> {
        let align = match align {
            0 => MIN_ALIGN,
            a if a.is_power_of_two() => a.max(MIN_ALIGN),
            _ => return None,
        };
        let layout = Layout::from_size_align(size, align).ok()?;
        if layout.size() == 0 {
            return None;
        }
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        Some(Self { ptr, layout })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

pub(crate) type ContextNotify = unsafe extern "C" fn(*const c_char, *const c_void, usize, *mut c_void);

pub(crate) struct ContextObj {
    pub(crate) notify: Option<ContextNotify>,
    pub(crate) user_data: usize,
    pub(crate) refs: u32,
}

pub(crate) struct QueueObj {
    pub(crate) context: usize,
    pub(crate) profiling: bool,
}

pub(crate) struct ProgramObj {
    pub(crate) context: usize,
    pub(crate) source: String,
    pub(crate) options: String,
    pub(crate) build_status: cl_int,
    pub(crate) log: String,
    pub(crate) kernels: Vec<String>,
}

pub(crate) enum ArgValue {
    Memory(usize),
    Svm(usize),
    Scalar(Vec<u8>),
    Local(usize),
}

pub(crate) struct KernelObj {
    pub(crate) context: usize,
    pub(crate) name: String,
    pub(crate) def: Arc<KernelDef>,
    pub(crate) args: Vec<Option<ArgValue>>,
}

pub(crate) enum MemStorage {
    Owned(Storage),
    /// `CL_MEM_USE_HOST_PTR`: the caller's memory is the buffer.
    Host(usize),
}

pub(crate) struct MemObj {
    pub(crate) context: usize,
    pub(crate) size: usize,
    pub(crate) storage: MemStorage,
    pub(crate) mapped: Vec<usize>,
}

impl MemObj {
    pub(crate) fn base(&self) -> *mut u8 {
        match &self.storage {
            MemStorage::Owned(storage) => storage.as_ptr(),
            MemStorage::Host(addr) => *addr as *mut u8,
        }
    }
}

pub(crate) struct EventObj {
    pub(crate) queue: usize,
    pub(crate) context: usize,
    pub(crate) status: cl_int,
    pub(crate) times: Option<[u64; 4]>,
}

pub(crate) enum Object {
    Context(ContextObj),
    Queue(QueueObj),
    Program(ProgramObj),
    Kernel(KernelObj),
    Memory(MemObj),
    Event(EventObj),
}

pub(crate) struct SvmAlloc {
    pub(crate) context: usize,
    pub(crate) storage: Storage,
    pub(crate) size: usize,
}

pub(crate) struct SoftState {
    next_id: usize,
    pub(crate) objects: BTreeMap<usize, Object>,
    pub(crate) svm: BTreeMap<usize, SvmAlloc>,
}

static STATE: Mutex<SoftState> = Mutex::new(SoftState {
    next_id: FIRST_ID,
    objects: BTreeMap::new(),
    svm: BTreeMap::new(),
});

pub(crate) fn state() -> MutexGuard<'static, SoftState> {
    STATE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Nanoseconds on a monotonic clock shared by every event.
pub(crate) fn now_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

macro_rules! object_accessors {
    ($($get:ident, $get_mut:ident, $variant:ident, $ty:ty, $invalid:expr;)*) => {$(
        pub(crate) fn $get(&self, handle: *mut c_void) -> Result<&$ty, cl_int> {
            match self.objects.get(&(handle as usize)) {
                Some(Object::$variant(obj)) => Ok(obj),
                _ => Err($invalid),
            }
        }

        #[allow(dead_code)]
        pub(crate) fn $get_mut(&mut self, handle: *mut c_void) -> Result<&mut $ty, cl_int> {
            match self.objects.get_mut(&(handle as usize)) {
                Some(Object::$variant(obj)) => Ok(obj),
                _ => Err($invalid),
            }
        }
    )*};
}

impl SoftState {
    pub(crate) fn insert(&mut self, object: Object) -> *mut c_void {
        let id = self.next_id;
        self.next_id += ID_STEP;
        self.objects.insert(id, object);
        id as *mut c_void
    }

    object_accessors! {
        context, context_mut, Context, ContextObj, CL_INVALID_CONTEXT;
        queue, queue_mut, Queue, QueueObj, CL_INVALID_COMMAND_QUEUE;
        program, program_mut, Program, ProgramObj, CL_INVALID_PROGRAM;
        kernel, kernel_mut, Kernel, KernelObj, CL_INVALID_KERNEL;
        memory, memory_mut, Memory, MemObj, CL_INVALID_MEM_OBJECT;
        event, event_mut, Event, EventObj, CL_INVALID_EVENT;
    }

    /// Removes an object if it has the kind `matches` accepts.
    pub(crate) fn remove(&mut self, handle: *mut c_void, matches: fn(&Object) -> bool, invalid: cl_int) -> cl_int {
        let key = handle as usize;
        match self.objects.get(&key) {
            Some(obj) if matches(obj) => {
                self.objects.remove(&key);
                CL_SUCCESS
            }
            _ => invalid,
        }
    }

    /// The SVM allocation containing `addr`, with the offset into it.
    pub(crate) fn svm_containing(&self, addr: usize) -> Option<(&SvmAlloc, usize)> {
        let (&base, alloc) = self.svm.range(..=addr).next_back()?;
        let offset = addr - base;
        (offset < alloc.size).then_some((alloc, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_is_aligned_and_zeroed() {
        let storage = Storage::new(100, 4).unwrap();
        assert_eq!(storage.as_ptr() as usize % MIN_ALIGN, 0);
        let bytes = unsafe { std::slice::from_raw_parts(storage.as_ptr(), 100) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert!(Storage::new(0, 4).is_none());
        assert!(Storage::new(8, 3).is_none());
    }

    #[test]
    fn svm_lookup_by_interior_address() {
        let mut state = SoftState {
            next_id: FIRST_ID,
            objects: BTreeMap::new(),
            svm: BTreeMap::new(),
        };
        let storage = Storage::new(64, 0).unwrap();
        let base = storage.as_ptr() as usize;
        state.svm.insert(base, SvmAlloc { context: 0, storage, size: 64 });

        assert_eq!(state.svm_containing(base + 63).map(|(_, off)| off), Some(63));
        assert!(state.svm_containing(base + 64).is_none());
        assert!(state.svm_containing(base - 1).is_none());
    }

    #[test]
    fn handles_are_distinct() {
        let mut state = SoftState {
            next_id: FIRST_ID,
            objects: BTreeMap::new(),
            svm: BTreeMap::new(),
        };
        let a = state.insert(Object::Context(ContextObj { notify: None, user_data: 0, refs: 1 }));
        let b = state.insert(Object::Context(ContextObj { notify: None, user_data: 0, refs: 1 }));
        assert_ne!(a, b);
        assert!(state.context(a).is_ok());
        assert_eq!(state.queue(a).err(), Some(CL_INVALID_COMMAND_QUEUE));
    }
}
