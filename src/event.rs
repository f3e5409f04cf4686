//! Completion tracking for enqueued commands.

use crate::cl_check;
use crate::error::{check, Error, Result};
use crate::handle::{Handle, Kind, Live};
use crate::opencl::bindings::Api;
use crate::opencl::types::*;
use crate::opencl::utils::info_value;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Queued,
    Submitted,
    Running,
    Complete,
    /// The command terminated abnormally with this (negative) status.
    Error(cl_int),
}

impl ExecutionStatus {
    fn from_raw(status: cl_int) -> Self {
        match status {
            CL_COMPLETE => Self::Complete,
            CL_RUNNING => Self::Running,
            CL_SUBMITTED => Self::Submitted,
            CL_QUEUED => Self::Queued,
            other => Self::Error(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilingInfo {
    Queued,
    Submit,
    Start,
    End,
}

impl ProfilingInfo {
    fn raw(self) -> cl_profiling_info {
        match self {
            Self::Queued => CL_PROFILING_COMMAND_QUEUED,
            Self::Submit => CL_PROFILING_COMMAND_SUBMIT,
            Self::Start => CL_PROFILING_COMMAND_START,
            Self::End => CL_PROFILING_COMMAND_END,
        }
    }
}

/// One enqueued command. Clones share the native event.
#[derive(Debug, Clone)]
pub struct Event {
    handle: Arc<Handle>,
}

impl Event {
    pub(crate) fn from_raw(api: &Arc<Api>, raw: cl_event) -> Result<Self> {
        if raw.is_null() {
            return Err(Error::NullHandle("event"));
        }
        Ok(Self {
            handle: Handle::new(api.clone(), Kind::Event, raw),
        })
    }

    pub fn as_raw(&self) -> cl_event {
        self.handle.as_raw()
    }

    /// Blocks until the command has finished. Waiting again returns at once.
    pub fn wait(&self) -> Result<&Self> {
        let live = self.handle.get()?;
        let raw = live.ptr();
        cl_check!(self.handle.api(), clWaitForEvents(1, &raw))?;
        Ok(self)
    }

    /// Blocks until every event in `events` has finished.
    pub fn wait_all(events: &[&Event]) -> Result<()> {
        let Some(first) = events.first() else {
            return Ok(());
        };
        let list = WaitList::new(events)?;
        cl_check!(first.handle.api(), clWaitForEvents(list.len(), list.as_ptr()))
    }

    pub fn status(&self) -> Result<ExecutionStatus> {
        let live = self.handle.get()?;
        let api = self.handle.api();
        let status: cl_int = info_value(|size, value, size_ret| unsafe {
            (api.clGetEventInfo)(live.ptr(), CL_EVENT_COMMAND_EXECUTION_STATUS, size, value, size_ret)
        })?;
        Ok(ExecutionStatus::from_raw(status))
    }

    pub fn is_complete(&self) -> Result<bool> {
        Ok(self.status()? == ExecutionStatus::Complete)
    }

    /// A device timestamp in nanoseconds. The queue must have profiling on.
    pub fn profiling(&self, info: ProfilingInfo) -> Result<u64> {
        let live = self.handle.get()?;
        let api = self.handle.api();
        info_value(|size, value, size_ret| unsafe {
            (api.clGetEventProfilingInfo)(live.ptr(), info.raw(), size, value, size_ret)
        })
    }

    /// Time between the command starting and ending on the device.
    pub fn execution_time(&self) -> Result<Duration> {
        let start = self.profiling(ProfilingInfo::Start)?;
        let end = self.profiling(ProfilingInfo::End)?;
        Ok(Duration::from_nanos(end.saturating_sub(start)))
    }

    pub fn release(&self) -> Result<()> {
        self.handle.release()
    }
}

/// Raw event list for an enqueue call, holding every event alive while used.
pub(crate) struct WaitList<'a> {
    _guards: Vec<Live<'a>>,
    raw: Vec<cl_event>,
}

impl<'a> WaitList<'a> {
    pub(crate) fn new(events: &[&'a Event]) -> Result<Self> {
        let mut guards = Vec::with_capacity(events.len());
        let mut raw = Vec::with_capacity(events.len());
        for (i, event) in events.iter().enumerate() {
            // One guard per handle; a repeated event reuses the first pointer.
            if let Some(first) = events[..i].iter().position(|e| Arc::ptr_eq(&e.handle, &event.handle)) {
                raw.push(raw[first]);
                continue;
            }
            let live = event.handle.get()?;
            raw.push(live.ptr());
            guards.push(live);
        }
        Ok(Self { _guards: guards, raw })
    }

    pub(crate) fn len(&self) -> cl_uint {
        self.raw.len() as cl_uint
    }

    /// Null when empty, as the native API requires.
    pub(crate) fn as_ptr(&self) -> *const cl_event {
        if self.raw.is_empty() {
            ptr::null()
        } else {
            self.raw.as_ptr()
        }
    }
}

/// Runs an enqueue call and wraps the event it produces.
pub(crate) fn track<F>(api: &Arc<Api>, call: F) -> Result<Event>
where
    F: FnOnce(*mut cl_event) -> cl_int,
{
    let mut raw: cl_event = ptr::null_mut();
    check(call(&mut raw))?;
    Event::from_raw(api, raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ArrayReadWrite, Config, Context, DriverKind, QueueProperties};

    fn context() -> Context {
        Context::from_config(&Config::new().with_driver(DriverKind::Soft)).unwrap()
    }

    #[test]
    fn wait_is_idempotent() {
        let context = context();
        let queue = context.create_command_queue(0).unwrap();
        let buffer = context.create_simple_memory_bytes(16).unwrap();
        let data = [7u8; 16];
        let event = unsafe { buffer.write_range_nonblocking(&queue, 0, 16, &data, 0, &[]) }.unwrap();

        event.wait().unwrap().wait().unwrap();
        assert_eq!(event.status().unwrap(), ExecutionStatus::Complete);
        assert!(event.is_complete().unwrap());
    }

    #[test]
    fn empty_wait_list_is_null() {
        let list = WaitList::new(&[]).unwrap();
        assert_eq!(list.len(), 0);
        assert!(list.as_ptr().is_null());
        assert!(Event::wait_all(&[]).is_ok());
    }

    #[test]
    fn repeated_event_is_locked_once() {
        let context = context();
        let queue = context.create_command_queue(0).unwrap();
        let buffer = context.create_simple_memory_bytes(4).unwrap();
        let first = buffer.write(&queue, &[1u8; 4], &[]).unwrap();
        let second = buffer.write(&queue, &[2u8; 4], &[]).unwrap();

        let list = WaitList::new(&[&first, &second, &first]).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list._guards.len(), 2);
        assert_eq!(list.raw, vec![first.as_raw(), second.as_raw(), first.as_raw()]);
        drop(list);

        Event::wait_all(&[&first, &first]).unwrap();
        assert_eq!(buffer.to_vec(&queue, &[&second, &second]).unwrap(), vec![2u8; 4]);
    }

    #[test]
    fn profiling_needs_profiling_queue() {
        let context = context();
        let device = context.devices()[0].clone();
        let plain = context
            .create_command_queue_for(&device, QueueProperties::NONE)
            .unwrap();
        let buffer = context.create_simple_memory_bytes(8).unwrap();
        let event = buffer.write(&plain, &[1u8; 8], &[]).unwrap();

        let err = event.execution_time().unwrap_err();
        assert_eq!(err.code(), Some(CL_PROFILING_INFO_NOT_AVAILABLE));

        let profiled = context.create_command_queue(0).unwrap();
        let event = buffer.write(&profiled, &[2u8; 8], &[]).unwrap();
        let start = event.profiling(ProfilingInfo::Start).unwrap();
        let end = event.profiling(ProfilingInfo::End).unwrap();
        assert!(end >= start);
        assert!(event.profiling(ProfilingInfo::Queued).unwrap() <= start);
    }

    #[test]
    fn released_event_is_rejected() {
        let context = context();
        let queue = context.create_command_queue(0).unwrap();
        let buffer = context.create_simple_memory_bytes(4).unwrap();
        let event = buffer.write(&queue, &[0u8; 4], &[]).unwrap();
        let copy = event.clone();

        event.release().unwrap();
        event.release().unwrap();
        assert!(matches!(copy.wait(), Err(Error::Released("event"))));
    }
}
