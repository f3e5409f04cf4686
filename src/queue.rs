//! Command queues.

use crate::cl_check;
use crate::cl_create;
use crate::context::Context;
use crate::error::Result;
use crate::event::Event;
use crate::handle::{Handle, Kind, Live};
use crate::kernel::Kernel;
use crate::opencl::types::*;
use crate::platform::Device;
use std::ops::BitOr;
use std::sync::Arc;

/// `cl_command_queue_properties` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueProperties(pub cl_command_queue_properties);

impl QueueProperties {
    pub const NONE: Self = Self(0);
    pub const OUT_OF_ORDER: Self = Self(CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE);
    pub const PROFILING: Self = Self(CL_QUEUE_PROFILING_ENABLE);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for QueueProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// An in-order (unless configured otherwise) queue on one device.
///
/// The queue keeps the context and device it was created for; releasing the
/// queue does not release either.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    handle: Arc<Handle>,
    context: Context,
    device: Device,
    properties: QueueProperties,
}

impl CommandQueue {
    pub fn new(context: &Context, device: &Device, properties: QueueProperties) -> Result<Self> {
        let api = context.api();
        let ctx = context.live()?;
        let raw = cl_create!(
            api,
            clCreateCommandQueue(ctx.ptr(), device.as_raw(), properties.0)
        )?;

        Ok(Self {
            handle: Handle::new(api.clone(), Kind::CommandQueue, raw),
            context: context.clone(),
            device: device.clone(),
            properties,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn properties(&self) -> QueueProperties {
        self.properties
    }

    /// Whether events from this queue carry profiling timestamps.
    pub fn profiling(&self) -> bool {
        self.properties.contains(QueueProperties::PROFILING)
    }

    pub fn as_raw(&self) -> cl_command_queue {
        self.handle.as_raw()
    }

    pub(crate) fn live(&self) -> Result<Live<'_>> {
        self.handle.get()
    }

    /// Submits every queued command to the device.
    pub fn flush(&self) -> Result<()> {
        let queue = self.live()?;
        cl_check!(self.handle.api(), clFlush(queue.ptr()))
    }

    /// Blocks until every queued command has completed.
    pub fn finish(&self) -> Result<()> {
        let queue = self.live()?;
        cl_check!(self.handle.api(), clFinish(queue.ptr()))
    }

    /// Dispatches `kernel` with its currently bound arguments and sizes.
    pub fn enqueue_kernel(&self, kernel: &Kernel, deps: &[&Event]) -> Result<Event> {
        kernel.dispatch(self, deps)
    }

    pub fn release(&self) -> Result<()> {
        self.handle.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::{Config, DriverKind};

    #[test]
    fn queue_keeps_its_parents() {
        let context = Context::from_config(&Config::new().with_driver(DriverKind::Soft)).unwrap();
        let queue = context.create_command_queue(0).unwrap();

        assert_eq!(queue.device(), &context.devices()[0]);
        assert_eq!(queue.context().as_raw(), context.as_raw());
        assert!(queue.profiling());
        queue.flush().unwrap();
        queue.finish().unwrap();
    }

    #[test]
    fn release_is_idempotent() {
        let context = Context::from_config(&Config::new().with_driver(DriverKind::Soft)).unwrap();
        let queue = context.create_command_queue(0).unwrap();
        let raw = queue.as_raw();
        assert!(crate::soft::is_live(raw));

        queue.release().unwrap();
        queue.release().unwrap();
        assert!(!crate::soft::is_live(raw));
        assert!(matches!(queue.finish(), Err(Error::Released("command queue"))));
        // The context outlives its queue.
        assert!(crate::soft::is_live(context.as_raw()));
    }

    #[test]
    fn property_bits() {
        let both = QueueProperties::PROFILING | QueueProperties::OUT_OF_ORDER;
        assert!(both.contains(QueueProperties::PROFILING));
        assert!(!QueueProperties::NONE.contains(QueueProperties::PROFILING));
        assert_eq!(both.0, 0b11);
    }
}
