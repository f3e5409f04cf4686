//! The `extern "C"` entry points of the software driver.
//!
//! Every function takes the driver lock for its whole duration, so commands
//! are serialised and complete before they return.

#![allow(clippy::missing_safety_doc, clippy::too_many_arguments)]

use super::kernels::{self, LaunchArg, Param, WorkItem};
use super::*;
use crate::opencl::types::*;
use std::ffi::CStr;
use std::mem::size_of;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::slice;
use tracing::{debug, trace};

type Status = Result<(), cl_int>;

/// Runs `f`, turning its result (or a panic) into a status code.
fn guard(f: impl FnOnce() -> Status) -> cl_int {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => CL_SUCCESS,
        Ok(Err(code)) => code,
        Err(_) => CL_OUT_OF_HOST_MEMORY,
    }
}

/// Like [`guard`] for calls returning a pointer and reporting through
/// `errcode_ret`.
unsafe fn create(errcode_ret: *mut cl_int, f: impl FnOnce() -> Result<*mut c_void, cl_int>) -> *mut c_void {
    let (obj, code) = match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(obj)) => (obj, CL_SUCCESS),
        Ok(Err(code)) => (ptr::null_mut(), code),
        Err(_) => (ptr::null_mut(), CL_OUT_OF_HOST_MEMORY),
    };
    if !errcode_ret.is_null() {
        *errcode_ret = code;
    }
    obj
}

unsafe fn write_info(bytes: &[u8], size: usize, value: *mut c_void, size_ret: *mut usize) -> Status {
    if !size_ret.is_null() {
        *size_ret = bytes.len();
    }
    if !value.is_null() {
        if size < bytes.len() {
            return Err(CL_INVALID_VALUE);
        }
        ptr::copy_nonoverlapping(bytes.as_ptr(), value.cast::<u8>(), bytes.len());
    }
    Ok(())
}

fn string_info(s: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(s.len() + 1);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    bytes
}

fn value_info<T: bytemuck::Pod>(value: T) -> Vec<u8> {
    bytemuck::bytes_of(&value).to_vec()
}

fn check_range(offset: usize, size: usize, bound: usize) -> Status {
    match offset.checked_add(size) {
        Some(end) if size > 0 && end <= bound => Ok(()),
        _ => Err(CL_INVALID_VALUE),
    }
}

fn overlaps(a: usize, b: usize, size: usize) -> bool {
    a < b + size && b < a + size
}

/// A validated enqueue: the queue it runs on and when it started.
struct Enqueue {
    queue: usize,
    context: usize,
    profiling: bool,
    started: u64,
}

unsafe fn begin(state: &SoftState, queue: cl_command_queue, num_events: cl_uint, events: *const cl_event) -> Result<Enqueue, cl_int> {
    let q = state.queue(queue)?;
    if (num_events == 0) != events.is_null() {
        return Err(CL_INVALID_EVENT_WAIT_LIST);
    }
    for i in 0..num_events as usize {
        match state.event(*events.add(i)) {
            Ok(e) if e.status < 0 => return Err(CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST),
            Ok(_) => {}
            Err(_) => return Err(CL_INVALID_EVENT_WAIT_LIST),
        }
    }
    Ok(Enqueue {
        queue: queue as usize,
        context: q.context,
        profiling: q.profiling,
        started: now_ns(),
    })
}

unsafe fn complete(state: &mut SoftState, enqueue: Enqueue, event: *mut cl_event) {
    if event.is_null() {
        return;
    }
    let times = enqueue.profiling.then(|| {
        let end = now_ns();
        [enqueue.started, enqueue.started, enqueue.started, end]
    });
    *event = state.insert(Object::Event(EventObj {
        queue: enqueue.queue,
        context: enqueue.context,
        status: CL_COMPLETE,
        times,
    }));
}

// Platforms and devices

pub(crate) unsafe extern "C" fn get_platform_ids(
    num_entries: cl_uint,
    platforms: *mut cl_platform_id,
    num_platforms: *mut cl_uint,
) -> cl_int {
    guard(|| {
        if (num_entries == 0 && !platforms.is_null()) || (platforms.is_null() && num_platforms.is_null()) {
            return Err(CL_INVALID_VALUE);
        }
        if !platforms.is_null() {
            *platforms = PLATFORM_ID as cl_platform_id;
        }
        if !num_platforms.is_null() {
            *num_platforms = 1;
        }
        Ok(())
    })
}

pub(crate) unsafe extern "C" fn get_platform_info(
    platform: cl_platform_id,
    param_name: cl_platform_info,
    param_value_size: usize,
    param_value: *mut c_void,
    param_value_size_ret: *mut usize,
) -> cl_int {
    guard(|| {
        if platform as usize != PLATFORM_ID {
            return Err(CL_INVALID_PLATFORM);
        }
        let text = match param_name {
            CL_PLATFORM_PROFILE => "FULL_PROFILE",
            CL_PLATFORM_VERSION => "OpenCL 2.0 oclwrap-soft",
            CL_PLATFORM_NAME => PLATFORM_NAME,
            CL_PLATFORM_VENDOR => "oclwrap",
            CL_PLATFORM_EXTENSIONS => "",
            _ => return Err(CL_INVALID_VALUE),
        };
        write_info(&string_info(text), param_value_size, param_value, param_value_size_ret)
    })
}

pub(crate) unsafe extern "C" fn get_device_ids(
    platform: cl_platform_id,
    device_type: cl_device_type,
    num_entries: cl_uint,
    devices: *mut cl_device_id,
    num_devices: *mut cl_uint,
) -> cl_int {
    guard(|| {
        if platform as usize != PLATFORM_ID {
            return Err(CL_INVALID_PLATFORM);
        }
        if device_type == 0 {
            return Err(CL_INVALID_DEVICE_TYPE);
        }
        if (num_entries == 0 && !devices.is_null()) || (devices.is_null() && num_devices.is_null()) {
            return Err(CL_INVALID_VALUE);
        }
        let matches = device_type == CL_DEVICE_TYPE_ALL
            || device_type & (CL_DEVICE_TYPE_CPU | CL_DEVICE_TYPE_DEFAULT) != 0;
        if !matches {
            if !num_devices.is_null() {
                *num_devices = 0;
            }
            return Err(CL_DEVICE_NOT_FOUND);
        }
        if !devices.is_null() {
            *devices = DEVICE_ID as cl_device_id;
        }
        if !num_devices.is_null() {
            *num_devices = 1;
        }
        Ok(())
    })
}

pub(crate) unsafe extern "C" fn get_device_info(
    device: cl_device_id,
    param_name: cl_device_info,
    param_value_size: usize,
    param_value: *mut c_void,
    param_value_size_ret: *mut usize,
) -> cl_int {
    guard(|| {
        if device as usize != DEVICE_ID {
            return Err(CL_INVALID_DEVICE);
        }
        let compute_units = std::thread::available_parallelism().map_or(1, |n| n.get()) as cl_uint;
        let bytes = match param_name {
            CL_DEVICE_TYPE => value_info(CL_DEVICE_TYPE_CPU),
            CL_DEVICE_MAX_COMPUTE_UNITS => value_info(compute_units),
            CL_DEVICE_MAX_WORK_ITEM_DIMENSIONS => value_info(3 as cl_uint),
            CL_DEVICE_MAX_WORK_GROUP_SIZE => value_info(MAX_WORK_GROUP_SIZE),
            CL_DEVICE_MAX_WORK_ITEM_SIZES => bytemuck::cast_slice::<usize, u8>(&[MAX_WORK_GROUP_SIZE; 3]).to_vec(),
            CL_DEVICE_MAX_CLOCK_FREQUENCY => value_info(1000 as cl_uint),
            CL_DEVICE_MAX_MEM_ALLOC_SIZE => value_info(MAX_MEM_ALLOC_SIZE),
            CL_DEVICE_GLOBAL_MEM_SIZE => value_info(GLOBAL_MEM_SIZE),
            CL_DEVICE_LOCAL_MEM_SIZE => value_info(LOCAL_MEM_SIZE),
            CL_DEVICE_NAME => string_info(DEVICE_NAME),
            CL_DEVICE_VENDOR => string_info("oclwrap"),
            CL_DRIVER_VERSION => string_info(env!("CARGO_PKG_VERSION")),
            CL_DEVICE_PROFILE => string_info("FULL_PROFILE"),
            CL_DEVICE_VERSION => string_info("OpenCL 2.0"),
            CL_DEVICE_EXTENSIONS => string_info(""),
            CL_DEVICE_PLATFORM => value_info(PLATFORM_ID),
            CL_DEVICE_SVM_CAPABILITIES => {
                value_info(CL_DEVICE_SVM_COARSE_GRAIN_BUFFER | CL_DEVICE_SVM_FINE_GRAIN_BUFFER)
            }
            _ => return Err(CL_INVALID_VALUE),
        };
        write_info(&bytes, param_value_size, param_value, param_value_size_ret)
    })
}

// Contexts and queues

pub(crate) unsafe extern "C" fn create_context(
    properties: *const cl_context_properties,
    num_devices: cl_uint,
    devices: *const cl_device_id,
    pfn_notify: cl_context_notify,
    user_data: *mut c_void,
    errcode_ret: *mut cl_int,
) -> cl_context {
    create(errcode_ret, || {
        if num_devices == 0 || devices.is_null() || (pfn_notify.is_none() && !user_data.is_null()) {
            return Err(CL_INVALID_VALUE);
        }
        if !properties.is_null() {
            let mut at = properties;
            while *at != 0 {
                match *at {
                    CL_CONTEXT_PLATFORM if *at.add(1) as usize == PLATFORM_ID => {}
                    CL_CONTEXT_PLATFORM => return Err(CL_INVALID_PLATFORM),
                    _ => return Err(CL_INVALID_PROPERTY),
                }
                at = at.add(2);
            }
        }
        for i in 0..num_devices as usize {
            if *devices.add(i) as usize != DEVICE_ID {
                return Err(CL_INVALID_DEVICE);
            }
        }
        Ok(state().insert(Object::Context(ContextObj {
            notify: pfn_notify,
            user_data: user_data as usize,
            refs: 1,
        })))
    })
}

pub(crate) unsafe extern "C" fn retain_context(context: cl_context) -> cl_int {
    guard(|| {
        state().context_mut(context)?.refs += 1;
        Ok(())
    })
}

/// Drops one reference; the context goes away with the last one.
pub(crate) unsafe extern "C" fn release_context(context: cl_context) -> cl_int {
    let mut state = state();
    match state.context_mut(context) {
        Ok(ctx) if ctx.refs > 1 => ctx.refs -= 1,
        Ok(_) => {
            state.objects.remove(&(context as usize));
        }
        Err(code) => return code,
    }
    CL_SUCCESS
}

pub(crate) unsafe extern "C" fn create_command_queue(
    context: cl_context,
    device: cl_device_id,
    properties: cl_command_queue_properties,
    errcode_ret: *mut cl_int,
) -> cl_command_queue {
    create(errcode_ret, || {
        let mut state = state();
        state.context(context)?;
        if device as usize != DEVICE_ID {
            return Err(CL_INVALID_DEVICE);
        }
        if properties & !(CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE | CL_QUEUE_PROFILING_ENABLE) != 0 {
            return Err(CL_INVALID_VALUE);
        }
        Ok(state.insert(Object::Queue(QueueObj {
            context: context as usize,
            profiling: properties & CL_QUEUE_PROFILING_ENABLE != 0,
        })))
    })
}

pub(crate) unsafe extern "C" fn release_command_queue(queue: cl_command_queue) -> cl_int {
    state().remove(queue, |o| matches!(o, Object::Queue(_)), CL_INVALID_COMMAND_QUEUE)
}

pub(crate) unsafe extern "C" fn flush(queue: cl_command_queue) -> cl_int {
    guard(|| state().queue(queue).map(|_| ()))
}

pub(crate) unsafe extern "C" fn finish(queue: cl_command_queue) -> cl_int {
    guard(|| state().queue(queue).map(|_| ()))
}

// Programs and kernels

pub(crate) unsafe extern "C" fn create_program_with_source(
    context: cl_context,
    count: cl_uint,
    strings: *const *const c_char,
    lengths: *const usize,
    errcode_ret: *mut cl_int,
) -> cl_program {
    create(errcode_ret, || {
        let mut state = state();
        state.context(context)?;
        if count == 0 || strings.is_null() {
            return Err(CL_INVALID_VALUE);
        }
        let mut source = String::new();
        for i in 0..count as usize {
            let s = *strings.add(i);
            if s.is_null() {
                return Err(CL_INVALID_VALUE);
            }
            let len = if lengths.is_null() { 0 } else { *lengths.add(i) };
            let bytes = if len == 0 {
                CStr::from_ptr(s).to_bytes()
            } else {
                slice::from_raw_parts(s.cast::<u8>(), len)
            };
            source.push_str(&String::from_utf8_lossy(bytes));
        }
        Ok(state.insert(Object::Program(ProgramObj {
            context: context as usize,
            source,
            options: String::new(),
            build_status: CL_BUILD_NONE,
            log: String::new(),
            kernels: Vec::new(),
        })))
    })
}

fn valid_options(options: &str) -> bool {
    let mut tokens = options.split_whitespace();
    while let Some(token) = tokens.next() {
        match token {
            "-D" | "-I" => {
                if tokens.next().is_none() {
                    return false;
                }
            }
            t if t.starts_with('-') => {}
            _ => return false,
        }
    }
    true
}

/// Checks every declared kernel against the registry; returns the names or
/// the build log.
fn compile(source: &str) -> Result<Vec<String>, String> {
    let declarations = kernels::scan(source)?;
    let mut names = Vec::with_capacity(declarations.len());
    let mut errors = Vec::new();
    for decl in declarations {
        match kernels::lookup(&decl.name) {
            None => errors.push(format!(
                "error: kernel `{}` has no registered implementation",
                decl.name
            )),
            Some(def) if def.params.len() != decl.params => errors.push(format!(
                "error: kernel `{}` declares {} parameters but its implementation takes {}",
                decl.name,
                decl.params,
                def.params.len()
            )),
            Some(_) => names.push(decl.name),
        }
    }
    if errors.is_empty() {
        Ok(names)
    } else {
        Err(errors.join("\n"))
    }
}

pub(crate) unsafe extern "C" fn build_program(
    program: cl_program,
    num_devices: cl_uint,
    device_list: *const cl_device_id,
    options: *const c_char,
    pfn_notify: cl_build_notify,
    user_data: *mut c_void,
) -> cl_int {
    let code = guard(|| {
        let mut state = state();
        let prog = state.program_mut(program)?;
        if (num_devices == 0) != device_list.is_null() || (pfn_notify.is_none() && !user_data.is_null()) {
            return Err(CL_INVALID_VALUE);
        }
        for i in 0..num_devices as usize {
            if *device_list.add(i) as usize != DEVICE_ID {
                return Err(CL_INVALID_DEVICE);
            }
        }
        let options = if options.is_null() {
            String::new()
        } else {
            CStr::from_ptr(options).to_string_lossy().into_owned()
        };
        if !valid_options(&options) {
            return Err(CL_INVALID_BUILD_OPTIONS);
        }
        prog.options = options;

        match compile(&prog.source) {
            Ok(names) => {
                debug!("soft build ok: {:?}", names);
                prog.build_status = CL_BUILD_SUCCESS;
                prog.log.clear();
                prog.kernels = names;
                Ok(())
            }
            Err(log) => {
                prog.build_status = CL_BUILD_ERROR;
                prog.log = log;
                prog.kernels.clear();
                Err(CL_BUILD_PROGRAM_FAILURE)
            }
        }
    });
    if let Some(notify) = pfn_notify {
        notify(program, user_data);
    }
    code
}

pub(crate) unsafe extern "C" fn get_program_build_info(
    program: cl_program,
    device: cl_device_id,
    param_name: cl_program_build_info,
    param_value_size: usize,
    param_value: *mut c_void,
    param_value_size_ret: *mut usize,
) -> cl_int {
    guard(|| {
        let state = state();
        let prog = state.program(program)?;
        if device as usize != DEVICE_ID {
            return Err(CL_INVALID_DEVICE);
        }
        let bytes = match param_name {
            CL_PROGRAM_BUILD_STATUS => value_info(prog.build_status),
            CL_PROGRAM_BUILD_OPTIONS => string_info(&prog.options),
            CL_PROGRAM_BUILD_LOG => string_info(&prog.log),
            _ => return Err(CL_INVALID_VALUE),
        };
        write_info(&bytes, param_value_size, param_value, param_value_size_ret)
    })
}

pub(crate) unsafe extern "C" fn release_program(program: cl_program) -> cl_int {
    state().remove(program, |o| matches!(o, Object::Program(_)), CL_INVALID_PROGRAM)
}

pub(crate) unsafe extern "C" fn create_kernel(
    program: cl_program,
    kernel_name: *const c_char,
    errcode_ret: *mut cl_int,
) -> cl_kernel {
    create(errcode_ret, || {
        let mut state = state();
        let prog = state.program(program)?;
        if kernel_name.is_null() {
            return Err(CL_INVALID_VALUE);
        }
        if prog.build_status != CL_BUILD_SUCCESS {
            return Err(CL_INVALID_PROGRAM_EXECUTABLE);
        }
        let name = CStr::from_ptr(kernel_name).to_string_lossy().into_owned();
        if !prog.kernels.contains(&name) {
            return Err(CL_INVALID_KERNEL_NAME);
        }
        let def = kernels::lookup(&name).ok_or(CL_INVALID_KERNEL_NAME)?;
        let context = prog.context;
        let args = (0..def.params.len()).map(|_| None).collect();
        Ok(state.insert(Object::Kernel(KernelObj {
            context,
            name,
            def,
            args,
        })))
    })
}

pub(crate) unsafe extern "C" fn get_kernel_info(
    kernel: cl_kernel,
    param_name: cl_kernel_info,
    param_value_size: usize,
    param_value: *mut c_void,
    param_value_size_ret: *mut usize,
) -> cl_int {
    guard(|| {
        let state = state();
        let k = state.kernel(kernel)?;
        let bytes = match param_name {
            CL_KERNEL_NUM_ARGS => value_info(k.def.params.len() as cl_uint),
            CL_KERNEL_FUNCTION_NAME => string_info(&k.name),
            _ => return Err(CL_INVALID_VALUE),
        };
        write_info(&bytes, param_value_size, param_value, param_value_size_ret)
    })
}

pub(crate) unsafe extern "C" fn set_kernel_arg(
    kernel: cl_kernel,
    arg_index: cl_uint,
    arg_size: usize,
    arg_value: *const c_void,
) -> cl_int {
    guard(|| {
        let mut state = state();
        let index = arg_index as usize;
        let param = *state.kernel(kernel)?.def.params.get(index).ok_or(CL_INVALID_ARG_INDEX)?;
        let value = match param {
            Param::Buffer => {
                if arg_size != size_of::<cl_mem>() {
                    return Err(CL_INVALID_ARG_SIZE);
                }
                if arg_value.is_null() {
                    return Err(CL_INVALID_ARG_VALUE);
                }
                let mem = *arg_value.cast::<cl_mem>();
                state.memory(mem).map_err(|_| CL_INVALID_MEM_OBJECT)?;
                ArgValue::Memory(mem as usize)
            }
            Param::Scalar(size) => {
                if arg_size != size {
                    return Err(CL_INVALID_ARG_SIZE);
                }
                if arg_value.is_null() {
                    return Err(CL_INVALID_ARG_VALUE);
                }
                ArgValue::Scalar(slice::from_raw_parts(arg_value.cast::<u8>(), arg_size).to_vec())
            }
            Param::Local => {
                if !arg_value.is_null() {
                    return Err(CL_INVALID_ARG_VALUE);
                }
                if arg_size == 0 {
                    return Err(CL_INVALID_ARG_SIZE);
                }
                ArgValue::Local(arg_size)
            }
        };
        state.kernel_mut(kernel)?.args[index] = Some(value);
        Ok(())
    })
}

pub(crate) unsafe extern "C" fn release_kernel(kernel: cl_kernel) -> cl_int {
    state().remove(kernel, |o| matches!(o, Object::Kernel(_)), CL_INVALID_KERNEL)
}

/// A kernel failure to report through the context callback once the driver
/// lock is released.
struct Failure {
    notify: ContextNotify,
    user_data: usize,
    message: String,
}

unsafe fn launch(
    state: &mut SoftState,
    queue: cl_command_queue,
    kernel: cl_kernel,
    work_dim: cl_uint,
    global_work_offset: *const usize,
    global_work_size: *const usize,
    local_work_size: *const usize,
    wait: (cl_uint, *const cl_event),
    event: *mut cl_event,
    failure: &mut Option<Failure>,
) -> Status {
    let enqueue = begin(state, queue, wait.0, wait.1)?;
    let result = {
        let k = state.kernel(kernel)?;
        if k.context != enqueue.context {
            return Err(CL_INVALID_CONTEXT);
        }
        if !(1..=3).contains(&work_dim) {
            return Err(CL_INVALID_WORK_DIMENSION);
        }
        if global_work_size.is_null() {
            return Err(CL_INVALID_GLOBAL_WORK_SIZE);
        }
        let dims = work_dim as usize;
        let mut global = [1usize; 3];
        let mut offset = [0usize; 3];
        for d in 0..dims {
            global[d] = *global_work_size.add(d);
            if global[d] == 0 {
                return Err(CL_INVALID_GLOBAL_WORK_SIZE);
            }
            if !global_work_offset.is_null() {
                offset[d] = *global_work_offset.add(d);
                if offset[d].checked_add(global[d]).is_none() {
                    return Err(CL_INVALID_GLOBAL_OFFSET);
                }
            }
        }
        if !local_work_size.is_null() {
            let mut group = 1usize;
            for d in 0..dims {
                let l = *local_work_size.add(d);
                if l == 0 || global[d] % l != 0 {
                    return Err(CL_INVALID_WORK_GROUP_SIZE);
                }
                group = group.saturating_mul(l);
            }
            if group > MAX_WORK_GROUP_SIZE {
                return Err(CL_INVALID_WORK_GROUP_SIZE);
            }
        }

        let mut args = Vec::with_capacity(k.args.len());
        for slot in &k.args {
            let arg = match slot {
                None => return Err(CL_INVALID_KERNEL_ARGS),
                Some(ArgValue::Memory(id)) => {
                    let mem = state
                        .memory(*id as cl_mem)
                        .map_err(|_| CL_INVALID_MEM_OBJECT)?;
                    if mem.context != enqueue.context {
                        return Err(CL_INVALID_CONTEXT);
                    }
                    LaunchArg::Buffer {
                        ptr: mem.base(),
                        len: mem.size,
                    }
                }
                Some(ArgValue::Svm(addr)) => {
                    let (alloc, at) = state.svm_containing(*addr).ok_or(CL_INVALID_ARG_VALUE)?;
                    LaunchArg::Buffer {
                        ptr: alloc.storage.as_ptr().add(at),
                        len: alloc.size - at,
                    }
                }
                Some(ArgValue::Scalar(bytes)) => LaunchArg::Scalar(bytes),
                Some(ArgValue::Local(size)) => LaunchArg::Local(*size),
            };
            args.push(arg);
        }

        trace!("soft launch {} over {:?}", k.name, &global[..dims]);
        let body = k.def.body.clone();
        let mut item = WorkItem::new(&args, global, dims);
        let run = panic::catch_unwind(AssertUnwindSafe(|| -> Status {
            for z in offset[2]..offset[2] + global[2] {
                for y in offset[1]..offset[1] + global[1] {
                    for x in offset[0]..offset[0] + global[0] {
                        item.set_id([x, y, z]);
                        (*body)(&mut item)?;
                    }
                }
            }
            Ok(())
        }));
        let result = run.unwrap_or(Err(CL_OUT_OF_RESOURCES));
        if let Err(code) = result {
            if let Ok(ContextObj {
                notify: Some(notify),
                user_data,
                ..
            }) = state.context(enqueue.context as cl_context)
            {
                *failure = Some(Failure {
                    notify: *notify,
                    user_data: *user_data,
                    message: format!("kernel `{}` failed with status {}", k.name, code),
                });
            }
        }
        result
    };
    result?;
    complete(state, enqueue, event);
    Ok(())
}

pub(crate) unsafe extern "C" fn enqueue_nd_range_kernel(
    command_queue: cl_command_queue,
    kernel: cl_kernel,
    work_dim: cl_uint,
    global_work_offset: *const usize,
    global_work_size: *const usize,
    local_work_size: *const usize,
    num_events_in_wait_list: cl_uint,
    event_wait_list: *const cl_event,
    event: *mut cl_event,
) -> cl_int {
    let mut failure = None;
    let code = guard(|| {
        launch(
            &mut state(),
            command_queue,
            kernel,
            work_dim,
            global_work_offset,
            global_work_size,
            local_work_size,
            (num_events_in_wait_list, event_wait_list),
            event,
            &mut failure,
        )
    });
    if let Some(failure) = failure {
        let message = string_info(&failure.message);
        (failure.notify)(
            message.as_ptr().cast(),
            ptr::null(),
            0,
            failure.user_data as *mut c_void,
        );
    }
    code
}

// Buffers

pub(crate) unsafe extern "C" fn create_buffer(
    context: cl_context,
    flags: cl_mem_flags,
    size: usize,
    host_ptr: *mut c_void,
    errcode_ret: *mut cl_int,
) -> cl_mem {
    create(errcode_ret, || {
        let mut state = state();
        state.context(context)?;
        let access = flags & (CL_MEM_READ_WRITE | CL_MEM_WRITE_ONLY | CL_MEM_READ_ONLY);
        if access.count_ones() > 1 {
            return Err(CL_INVALID_VALUE);
        }
        let use_host = flags & CL_MEM_USE_HOST_PTR != 0;
        let copy_host = flags & CL_MEM_COPY_HOST_PTR != 0;
        if use_host && flags & (CL_MEM_ALLOC_HOST_PTR | CL_MEM_COPY_HOST_PTR) != 0 {
            return Err(CL_INVALID_VALUE);
        }
        if size == 0 || size as u64 > MAX_MEM_ALLOC_SIZE {
            return Err(CL_INVALID_BUFFER_SIZE);
        }
        if host_ptr.is_null() == (use_host || copy_host) {
            return Err(CL_INVALID_HOST_PTR);
        }

        let storage = if use_host {
            MemStorage::Host(host_ptr as usize)
        } else {
            let storage = Storage::new(size, 0).ok_or(CL_MEM_OBJECT_ALLOCATION_FAILURE)?;
            if copy_host {
                ptr::copy_nonoverlapping(host_ptr.cast::<u8>(), storage.as_ptr(), size);
            }
            MemStorage::Owned(storage)
        };
        Ok(state.insert(Object::Memory(MemObj {
            context: context as usize,
            size,
            storage,
            mapped: Vec::new(),
        })))
    })
}

pub(crate) unsafe extern "C" fn release_mem_object(memobj: cl_mem) -> cl_int {
    state().remove(memobj, |o| matches!(o, Object::Memory(_)), CL_INVALID_MEM_OBJECT)
}

unsafe fn buffer_for<'s>(state: &'s SoftState, enqueue: &Enqueue, buffer: cl_mem) -> Result<&'s MemObj, cl_int> {
    let mem = state.memory(buffer)?;
    if mem.context != enqueue.context {
        return Err(CL_INVALID_CONTEXT);
    }
    Ok(mem)
}

pub(crate) unsafe extern "C" fn enqueue_read_buffer(
    command_queue: cl_command_queue,
    buffer: cl_mem,
    _blocking_read: cl_bool,
    offset: usize,
    size: usize,
    dst: *mut c_void,
    num_events_in_wait_list: cl_uint,
    event_wait_list: *const cl_event,
    event: *mut cl_event,
) -> cl_int {
    guard(|| {
        let mut state = state();
        let enqueue = begin(&state, command_queue, num_events_in_wait_list, event_wait_list)?;
        let mem = buffer_for(&state, &enqueue, buffer)?;
        if dst.is_null() {
            return Err(CL_INVALID_VALUE);
        }
        check_range(offset, size, mem.size)?;
        ptr::copy(mem.base().add(offset), dst.cast::<u8>(), size);
        complete(&mut state, enqueue, event);
        Ok(())
    })
}

pub(crate) unsafe extern "C" fn enqueue_write_buffer(
    command_queue: cl_command_queue,
    buffer: cl_mem,
    _blocking_write: cl_bool,
    offset: usize,
    size: usize,
    src: *const c_void,
    num_events_in_wait_list: cl_uint,
    event_wait_list: *const cl_event,
    event: *mut cl_event,
) -> cl_int {
    guard(|| {
        let mut state = state();
        let enqueue = begin(&state, command_queue, num_events_in_wait_list, event_wait_list)?;
        let mem = buffer_for(&state, &enqueue, buffer)?;
        if src.is_null() {
            return Err(CL_INVALID_VALUE);
        }
        check_range(offset, size, mem.size)?;
        ptr::copy(src.cast::<u8>(), mem.base().add(offset), size);
        complete(&mut state, enqueue, event);
        Ok(())
    })
}

pub(crate) unsafe extern "C" fn enqueue_copy_buffer(
    command_queue: cl_command_queue,
    src_buffer: cl_mem,
    dst_buffer: cl_mem,
    src_offset: usize,
    dst_offset: usize,
    size: usize,
    num_events_in_wait_list: cl_uint,
    event_wait_list: *const cl_event,
    event: *mut cl_event,
) -> cl_int {
    guard(|| {
        let mut state = state();
        let enqueue = begin(&state, command_queue, num_events_in_wait_list, event_wait_list)?;
        let src = buffer_for(&state, &enqueue, src_buffer)?;
        let dst = buffer_for(&state, &enqueue, dst_buffer)?;
        check_range(src_offset, size, src.size)?;
        check_range(dst_offset, size, dst.size)?;
        if src_buffer == dst_buffer && overlaps(src_offset, dst_offset, size) {
            return Err(CL_MEM_COPY_OVERLAP);
        }
        ptr::copy(src.base().add(src_offset), dst.base().add(dst_offset), size);
        complete(&mut state, enqueue, event);
        Ok(())
    })
}

pub(crate) unsafe extern "C" fn enqueue_map_buffer(
    command_queue: cl_command_queue,
    buffer: cl_mem,
    _blocking_map: cl_bool,
    map_flags: cl_map_flags,
    offset: usize,
    size: usize,
    num_events_in_wait_list: cl_uint,
    event_wait_list: *const cl_event,
    event: *mut cl_event,
    errcode_ret: *mut cl_int,
) -> *mut c_void {
    create(errcode_ret, || {
        let mut state = state();
        let enqueue = begin(&state, command_queue, num_events_in_wait_list, event_wait_list)?;
        let mem = buffer_for(&state, &enqueue, buffer)?;
        let known = CL_MAP_READ | CL_MAP_WRITE | CL_MAP_WRITE_INVALIDATE_REGION;
        if map_flags & !known != 0
            || (map_flags & CL_MAP_WRITE_INVALIDATE_REGION != 0 && map_flags & (CL_MAP_READ | CL_MAP_WRITE) != 0)
        {
            return Err(CL_INVALID_VALUE);
        }
        check_range(offset, size, mem.size)?;
        let mapped = mem.base().add(offset);
        state.memory_mut(buffer)?.mapped.push(mapped as usize);
        complete(&mut state, enqueue, event);
        Ok(mapped.cast())
    })
}

pub(crate) unsafe extern "C" fn enqueue_unmap_mem_object(
    command_queue: cl_command_queue,
    memobj: cl_mem,
    mapped_ptr: *mut c_void,
    num_events_in_wait_list: cl_uint,
    event_wait_list: *const cl_event,
    event: *mut cl_event,
) -> cl_int {
    guard(|| {
        let mut state = state();
        let enqueue = begin(&state, command_queue, num_events_in_wait_list, event_wait_list)?;
        buffer_for(&state, &enqueue, memobj)?;
        let mem = state.memory_mut(memobj)?;
        let at = mem
            .mapped
            .iter()
            .position(|&p| p == mapped_ptr as usize)
            .ok_or(CL_INVALID_VALUE)?;
        mem.mapped.swap_remove(at);
        complete(&mut state, enqueue, event);
        Ok(())
    })
}

// Events

pub(crate) unsafe extern "C" fn wait_for_events(num_events: cl_uint, event_list: *const cl_event) -> cl_int {
    guard(|| {
        if num_events == 0 || event_list.is_null() {
            return Err(CL_INVALID_VALUE);
        }
        let state = state();
        for i in 0..num_events as usize {
            let event = state.event(*event_list.add(i))?;
            if event.status < 0 {
                return Err(CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST);
            }
        }
        Ok(())
    })
}

pub(crate) unsafe extern "C" fn get_event_info(
    event: cl_event,
    param_name: cl_event_info,
    param_value_size: usize,
    param_value: *mut c_void,
    param_value_size_ret: *mut usize,
) -> cl_int {
    guard(|| {
        let state = state();
        let e = state.event(event)?;
        let bytes = match param_name {
            CL_EVENT_COMMAND_QUEUE => value_info(e.queue),
            CL_EVENT_CONTEXT => value_info(e.context),
            CL_EVENT_REFERENCE_COUNT => value_info(1 as cl_uint),
            CL_EVENT_COMMAND_EXECUTION_STATUS => value_info(e.status),
            _ => return Err(CL_INVALID_VALUE),
        };
        write_info(&bytes, param_value_size, param_value, param_value_size_ret)
    })
}

pub(crate) unsafe extern "C" fn get_event_profiling_info(
    event: cl_event,
    param_name: cl_profiling_info,
    param_value_size: usize,
    param_value: *mut c_void,
    param_value_size_ret: *mut usize,
) -> cl_int {
    guard(|| {
        let state = state();
        let e = state.event(event)?;
        let times = e.times.ok_or(CL_PROFILING_INFO_NOT_AVAILABLE)?;
        let index = match param_name {
            CL_PROFILING_COMMAND_QUEUED => 0,
            CL_PROFILING_COMMAND_SUBMIT => 1,
            CL_PROFILING_COMMAND_START => 2,
            CL_PROFILING_COMMAND_END => 3,
            _ => return Err(CL_INVALID_VALUE),
        };
        write_info(&value_info(times[index]), param_value_size, param_value, param_value_size_ret)
    })
}

pub(crate) unsafe extern "C" fn release_event(event: cl_event) -> cl_int {
    state().remove(event, |o| matches!(o, Object::Event(_)), CL_INVALID_EVENT)
}

// Shared virtual memory

pub(crate) unsafe extern "C" fn svm_alloc(
    context: cl_context,
    _flags: cl_svm_mem_flags,
    size: usize,
    alignment: cl_uint,
) -> *mut c_void {
    let mut state = state();
    if state.context(context).is_err() || size == 0 || size as u64 > MAX_MEM_ALLOC_SIZE {
        return ptr::null_mut();
    }
    let Some(storage) = Storage::new(size, alignment as usize) else {
        return ptr::null_mut();
    };
    let base = storage.as_ptr();
    state.svm.insert(
        base as usize,
        SvmAlloc {
            context: context as usize,
            storage,
            size,
        },
    );
    base.cast()
}

pub(crate) unsafe extern "C" fn svm_free(_context: cl_context, svm_pointer: *mut c_void) {
    state().svm.remove(&(svm_pointer as usize));
}

pub(crate) unsafe extern "C" fn set_kernel_arg_svm_pointer(
    kernel: cl_kernel,
    arg_index: cl_uint,
    arg_value: *const c_void,
) -> cl_int {
    guard(|| {
        let mut state = state();
        let index = arg_index as usize;
        let k = state.kernel(kernel)?;
        match k.def.params.get(index) {
            Some(Param::Buffer) => {}
            Some(_) => return Err(CL_INVALID_ARG_VALUE),
            None => return Err(CL_INVALID_ARG_INDEX),
        }
        let addr = arg_value as usize;
        let (alloc, _) = state.svm_containing(addr).ok_or(CL_INVALID_ARG_VALUE)?;
        if alloc.context != k.context {
            return Err(CL_INVALID_ARG_VALUE);
        }
        state.kernel_mut(kernel)?.args[index] = Some(ArgValue::Svm(addr));
        Ok(())
    })
}

unsafe fn svm_region(state: &SoftState, addr: usize, size: usize) -> Status {
    let (alloc, offset) = state.svm_containing(addr).ok_or(CL_INVALID_VALUE)?;
    check_range(offset, size, alloc.size)
}

pub(crate) unsafe extern "C" fn enqueue_svm_map(
    command_queue: cl_command_queue,
    _blocking_map: cl_bool,
    flags: cl_map_flags,
    svm_ptr: *mut c_void,
    size: usize,
    num_events_in_wait_list: cl_uint,
    event_wait_list: *const cl_event,
    event: *mut cl_event,
) -> cl_int {
    guard(|| {
        let mut state = state();
        let enqueue = begin(&state, command_queue, num_events_in_wait_list, event_wait_list)?;
        if flags & !(CL_MAP_READ | CL_MAP_WRITE | CL_MAP_WRITE_INVALIDATE_REGION) != 0 {
            return Err(CL_INVALID_VALUE);
        }
        svm_region(&state, svm_ptr as usize, size)?;
        complete(&mut state, enqueue, event);
        Ok(())
    })
}

pub(crate) unsafe extern "C" fn enqueue_svm_unmap(
    command_queue: cl_command_queue,
    svm_ptr: *mut c_void,
    num_events_in_wait_list: cl_uint,
    event_wait_list: *const cl_event,
    event: *mut cl_event,
) -> cl_int {
    guard(|| {
        let mut state = state();
        let enqueue = begin(&state, command_queue, num_events_in_wait_list, event_wait_list)?;
        svm_region(&state, svm_ptr as usize, 1)?;
        complete(&mut state, enqueue, event);
        Ok(())
    })
}

pub(crate) unsafe extern "C" fn enqueue_svm_memcpy(
    command_queue: cl_command_queue,
    _blocking_copy: cl_bool,
    dst_ptr: *mut c_void,
    src_ptr: *const c_void,
    size: usize,
    num_events_in_wait_list: cl_uint,
    event_wait_list: *const cl_event,
    event: *mut cl_event,
) -> cl_int {
    guard(|| {
        let mut state = state();
        let enqueue = begin(&state, command_queue, num_events_in_wait_list, event_wait_list)?;
        if dst_ptr.is_null() || src_ptr.is_null() {
            return Err(CL_INVALID_VALUE);
        }
        if overlaps(dst_ptr as usize, src_ptr as usize, size) {
            return Err(CL_MEM_COPY_OVERLAP);
        }
        ptr::copy_nonoverlapping(src_ptr.cast::<u8>(), dst_ptr.cast::<u8>(), size);
        complete(&mut state, enqueue, event);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_is_size_checked() {
        let bytes = string_info("abc");
        let mut size = 0usize;
        let mut out = [0u8; 2];
        unsafe {
            assert!(write_info(&bytes, 0, ptr::null_mut(), &mut size).is_ok());
            assert_eq!(size, 4);
            assert_eq!(
                write_info(&bytes, out.len(), out.as_mut_ptr().cast(), ptr::null_mut()),
                Err(CL_INVALID_VALUE)
            );
        }
    }

    #[test]
    fn build_options() {
        assert!(valid_options(""));
        assert!(valid_options("-cl-fast-relaxed-math -D N=4 -I include"));
        assert!(!valid_options("-D"));
        assert!(!valid_options("fast"));
    }

    #[test]
    fn overlap_detection() {
        assert!(overlaps(0, 3, 4));
        assert!(!overlaps(0, 4, 4));
        assert!(overlaps(8, 4, 5));
    }

    #[test]
    fn ranges_reject_empty_and_overflow() {
        assert!(check_range(0, 4, 4).is_ok());
        assert!(check_range(0, 0, 4).is_err());
        assert!(check_range(usize::MAX, 1, 4).is_err());
    }

    #[test]
    fn unregistered_kernel_fails_compile() {
        let log = compile("kernel void entry_test_unregistered(global int* a) {}").unwrap_err();
        assert!(log.contains("entry_test_unregistered"));
    }
}
