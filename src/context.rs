//! Contexts and the factories hanging off them.

use crate::cl_create;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::handle::{Handle, Kind, Live};
use crate::kernel::Kernel;
use crate::memory::{Element, MappingMemory, SimpleMemory, SvmBuffer};
use crate::opencl::bindings::Api;
use crate::opencl::callbacks::log_context_error;
use crate::opencl::types::*;
use crate::platform::Device;
use crate::program::Program;
use crate::queue::{CommandQueue, QueueProperties};
use std::ptr;
use std::sync::Arc;

/// A group of devices sharing memory objects and programs.
///
/// Clones share the native context. It is released on [`Context::release`] or
/// when the last clone, queue, program or buffer holding it is dropped.
#[derive(Debug, Clone)]
pub struct Context {
    handle: Arc<Handle>,
    devices: Arc<[Device]>,
    queue_properties: QueueProperties,
}

impl Context {
    pub fn new(devices: &[Device]) -> Result<Self> {
        let first = devices.first().ok_or(Error::NoDevice)?;
        let api = first.api().clone();
        let ids: Vec<cl_device_id> = devices.iter().map(Device::as_raw).collect();

        let raw = cl_create!(
            api,
            clCreateContext(
                ptr::null(),
                ids.len() as cl_uint,
                ids.as_ptr(),
                Some(log_context_error),
                ptr::null_mut(),
            )
        )?;

        Ok(Self {
            handle: Handle::new(api, Kind::Context, raw),
            devices: devices.into(),
            queue_properties: QueueProperties::PROFILING,
        })
    }

    /// Loads the configured driver and opens a context on its first matching
    /// device.
    pub fn from_config(config: &Config) -> Result<Self> {
        let api = config.load_api()?;
        let device = Device::first_of(&api, config.device_type)?;
        let mut context = Self::new(std::slice::from_ref(&device))?;
        context.queue_properties = config.queue_properties();
        Ok(context)
    }

    pub fn api(&self) -> &Arc<Api> {
        self.handle.api()
    }

    pub fn as_raw(&self) -> cl_context {
        self.handle.as_raw()
    }

    pub(crate) fn live(&self) -> Result<Live<'_>> {
        self.handle.get()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// A queue on the `index`-th device, with the context's default
    /// properties (profiling on unless configured off).
    pub fn create_command_queue(&self, index: usize) -> Result<CommandQueue> {
        let device = self
            .devices
            .get(index)
            .ok_or_else(|| Error::out_of_range("device index", index, 1, self.devices.len()))?;
        CommandQueue::new(self, device, self.queue_properties)
    }

    pub fn create_command_queue_for(&self, device: &Device, properties: QueueProperties) -> Result<CommandQueue> {
        CommandQueue::new(self, device, properties)
    }

    /// Compiles `source` for every device of the context.
    pub fn create_program(&self, source: &str) -> Result<Program> {
        Program::new(self, source, "")
    }

    pub fn create_program_with_options(&self, source: &str, options: &str) -> Result<Program> {
        Program::new(self, source, options)
    }

    /// Compiles `source` and returns its kernel `name`.
    pub fn create_kernel(&self, source: &str, name: &str) -> Result<Kernel> {
        self.create_program(source)?.create_kernel(name)
    }

    pub fn create_simple_memory<T: Element>(&self, len: usize) -> Result<SimpleMemory<T>> {
        SimpleMemory::new(self, len)
    }

    pub fn create_simple_memory_from<T: Element>(&self, data: &[T]) -> Result<SimpleMemory<T>> {
        SimpleMemory::from_slice(self, data)
    }

    pub fn create_simple_memory_bytes(&self, size: usize) -> Result<SimpleMemory<u8>> {
        SimpleMemory::new(self, size)
    }

    pub fn create_mapping_memory<T: Element>(&self, len: usize) -> Result<MappingMemory<T>> {
        MappingMemory::new(self, len)
    }

    pub fn create_mapping_memory_from<T: Element>(&self, data: &[T]) -> Result<MappingMemory<T>> {
        MappingMemory::from_slice(self, data)
    }

    pub fn create_mapping_memory_bytes(&self, size: usize) -> Result<MappingMemory<u8>> {
        MappingMemory::new(self, size)
    }

    /// Shared virtual memory of `x * y * z` elements; `alignment` of zero
    /// lets the driver choose.
    pub fn create_svm_buffer<T: Element>(&self, x: usize, y: usize, z: usize, alignment: u32) -> Result<SvmBuffer<T>> {
        SvmBuffer::new(self, [x, y, z], alignment)
    }

    /// Releases the native context. Objects created from it should be
    /// released first.
    pub fn release(&self) -> Result<()> {
        self.handle.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DriverKind;

    fn soft() -> Config {
        Config::new().with_driver(DriverKind::Soft)
    }

    #[test]
    fn context_from_device() {
        let api = soft().load_api().unwrap();
        let device = Device::first(&api).unwrap();
        let context = device.create_context().unwrap();
        assert_eq!(context.devices(), &[device]);
        assert!(crate::soft::is_live(context.as_raw()));
    }

    #[test]
    fn empty_device_list_fails() {
        assert!(matches!(Context::new(&[]), Err(Error::NoDevice)));
    }

    #[test]
    fn queue_index_is_checked() {
        let context = Context::from_config(&soft()).unwrap();
        assert!(matches!(
            context.create_command_queue(1),
            Err(Error::OutOfRange { what: "device index", .. })
        ));
    }

    #[test]
    fn profiling_follows_config() {
        let context = Context::from_config(&soft().with_profiling(false)).unwrap();
        assert!(!context.create_command_queue(0).unwrap().profiling());
    }

    #[test]
    fn release_then_use() {
        let context = Context::from_config(&soft()).unwrap();
        let raw = context.as_raw();
        context.release().unwrap();
        context.release().unwrap();
        assert!(!crate::soft::is_live(raw));
        assert!(matches!(context.create_command_queue(0), Err(Error::Released("context"))));
        assert!(matches!(
            context.create_simple_memory::<f32>(4),
            Err(Error::Released("context"))
        ));
    }
}
