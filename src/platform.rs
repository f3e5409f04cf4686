//! Platform and device enumeration.
//!
//! Neither platforms nor devices are released: they belong to the driver for
//! the lifetime of the process.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::handle::RawPtr;
use crate::opencl::bindings::Api;
use crate::opencl::types::*;
use crate::opencl::utils::{info_string, info_value, info_vec};
use crate::cl_check;
use serde::Serialize;
use std::fmt;
use std::ptr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum DeviceType {
    Default,
    Cpu,
    Gpu,
    Accelerator,
    #[default]
    All,
}

impl DeviceType {
    pub fn bits(self) -> cl_device_type {
        match self {
            Self::Default => CL_DEVICE_TYPE_DEFAULT,
            Self::Cpu => CL_DEVICE_TYPE_CPU,
            Self::Gpu => CL_DEVICE_TYPE_GPU,
            Self::Accelerator => CL_DEVICE_TYPE_ACCELERATOR,
            Self::All => CL_DEVICE_TYPE_ALL,
        }
    }

    /// Names the most specific type bit set in `bits`.
    pub fn from_bits(bits: cl_device_type) -> Self {
        if bits & CL_DEVICE_TYPE_GPU != 0 {
            Self::Gpu
        } else if bits & CL_DEVICE_TYPE_CPU != 0 {
            Self::Cpu
        } else if bits & CL_DEVICE_TYPE_ACCELERATOR != 0 {
            Self::Accelerator
        } else if bits & CL_DEVICE_TYPE_DEFAULT != 0 {
            Self::Default
        } else {
            Self::All
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "cpu" => Ok(Self::Cpu),
            "gpu" => Ok(Self::Gpu),
            "accelerator" => Ok(Self::Accelerator),
            "all" => Ok(Self::All),
            other => Err(Error::InvalidConfig(format!("unknown device type `{other}`"))),
        }
    }
}

#[derive(Clone)]
pub struct Platform {
    api: Arc<Api>,
    id: RawPtr,
}

impl Platform {
    /// Every platform the driver reports.
    pub fn all(api: &Arc<Api>) -> Result<Vec<Platform>> {
        let mut count: cl_uint = 0;
        match cl_check!(api, clGetPlatformIDs(0, ptr::null_mut(), &mut count)) {
            Err(Error::Status { code: CL_PLATFORM_NOT_FOUND_KHR, .. }) => return Ok(Vec::new()),
            other => other?,
        }
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut ids: Vec<cl_platform_id> = vec![ptr::null_mut(); count as usize];
        cl_check!(api, clGetPlatformIDs(count, ids.as_mut_ptr(), ptr::null_mut()))?;

        Ok(ids
            .into_iter()
            .map(|id| Platform {
                api: api.clone(),
                id: RawPtr(id),
            })
            .collect())
    }

    pub fn api(&self) -> &Arc<Api> {
        &self.api
    }

    pub fn as_raw(&self) -> cl_platform_id {
        self.id.0
    }

    pub fn info(&self, param: cl_platform_info) -> Result<String> {
        let api = &self.api;
        let id = self.id.0;
        info_string(|size, value, size_ret| unsafe {
            (api.clGetPlatformInfo)(id, param, size, value, size_ret)
        })
    }

    pub fn name(&self) -> Result<String> {
        self.info(CL_PLATFORM_NAME)
    }

    pub fn vendor(&self) -> Result<String> {
        self.info(CL_PLATFORM_VENDOR)
    }

    pub fn version(&self) -> Result<String> {
        self.info(CL_PLATFORM_VERSION)
    }

    pub fn profile(&self) -> Result<String> {
        self.info(CL_PLATFORM_PROFILE)
    }

    pub fn extensions(&self) -> Result<String> {
        self.info(CL_PLATFORM_EXTENSIONS)
    }

    /// Devices of `device_type` on this platform; empty if there are none.
    pub fn devices(&self, device_type: DeviceType) -> Result<Vec<Device>> {
        let api = &self.api;
        let mut count: cl_uint = 0;
        match cl_check!(
            api,
            clGetDeviceIDs(self.id.0, device_type.bits(), 0, ptr::null_mut(), &mut count)
        ) {
            Err(Error::Status { code: CL_DEVICE_NOT_FOUND, .. }) => return Ok(Vec::new()),
            other => other?,
        }
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut ids: Vec<cl_device_id> = vec![ptr::null_mut(); count as usize];
        cl_check!(
            api,
            clGetDeviceIDs(self.id.0, device_type.bits(), count, ids.as_mut_ptr(), ptr::null_mut())
        )?;

        Ok(ids
            .into_iter()
            .map(|id| Device {
                api: api.clone(),
                id: RawPtr(id),
                platform: self.id,
            })
            .collect())
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform").field("id", &self.id).finish()
    }
}

/// One compute device.
#[derive(Clone)]
pub struct Device {
    api: Arc<Api>,
    id: RawPtr,
    platform: RawPtr,
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Device {}

impl Device {
    /// The first device of the first platform that has one.
    pub fn first(api: &Arc<Api>) -> Result<Device> {
        Self::first_of(api, DeviceType::All)
    }

    pub fn first_of(api: &Arc<Api>, device_type: DeviceType) -> Result<Device> {
        let platforms = Platform::all(api)?;
        if platforms.is_empty() {
            return Err(Error::NoPlatform);
        }
        for platform in &platforms {
            if let Some(device) = platform.devices(device_type)?.into_iter().next() {
                return Ok(device);
            }
        }
        Err(Error::NoDevice)
    }

    /// Every device on every platform.
    pub fn all(api: &Arc<Api>) -> Result<Vec<Device>> {
        let mut devices = Vec::new();
        for platform in Platform::all(api)? {
            devices.extend(platform.devices(DeviceType::All)?);
        }
        Ok(devices)
    }

    pub fn api(&self) -> &Arc<Api> {
        &self.api
    }

    pub fn as_raw(&self) -> cl_device_id {
        self.id.0
    }

    pub fn platform(&self) -> Platform {
        Platform {
            api: self.api.clone(),
            id: self.platform,
        }
    }

    pub fn create_context(&self) -> Result<Context> {
        Context::new(std::slice::from_ref(self))
    }

    fn query(
        &self,
        param: cl_device_info,
    ) -> impl FnMut(usize, *mut std::ffi::c_void, *mut usize) -> cl_int + '_ {
        let api = &self.api;
        let id = self.id.0;
        move |size, value, size_ret| unsafe { (api.clGetDeviceInfo)(id, param, size, value, size_ret) }
    }

    pub fn info_string(&self, param: cl_device_info) -> Result<String> {
        info_string(self.query(param))
    }

    pub fn info_value<T: bytemuck::Pod>(&self, param: cl_device_info) -> Result<T> {
        info_value(self.query(param))
    }

    pub fn name(&self) -> Result<String> {
        self.info_string(CL_DEVICE_NAME)
    }

    pub fn vendor(&self) -> Result<String> {
        self.info_string(CL_DEVICE_VENDOR)
    }

    pub fn version(&self) -> Result<String> {
        self.info_string(CL_DEVICE_VERSION)
    }

    pub fn driver_version(&self) -> Result<String> {
        self.info_string(CL_DRIVER_VERSION)
    }

    pub fn device_type(&self) -> Result<DeviceType> {
        self.info_value::<cl_device_type>(CL_DEVICE_TYPE)
            .map(DeviceType::from_bits)
    }

    pub fn max_compute_units(&self) -> Result<u32> {
        self.info_value::<cl_uint>(CL_DEVICE_MAX_COMPUTE_UNITS)
    }

    pub fn max_work_group_size(&self) -> Result<usize> {
        self.info_value::<usize>(CL_DEVICE_MAX_WORK_GROUP_SIZE)
    }

    pub fn max_work_item_sizes(&self) -> Result<Vec<usize>> {
        info_vec(self.query(CL_DEVICE_MAX_WORK_ITEM_SIZES))
    }

    pub fn global_mem_size(&self) -> Result<u64> {
        self.info_value::<cl_ulong>(CL_DEVICE_GLOBAL_MEM_SIZE)
    }

    pub fn local_mem_size(&self) -> Result<u64> {
        self.info_value::<cl_ulong>(CL_DEVICE_LOCAL_MEM_SIZE)
    }

    pub fn max_mem_alloc_size(&self) -> Result<u64> {
        self.info_value::<cl_ulong>(CL_DEVICE_MAX_MEM_ALLOC_SIZE)
    }

    /// SVM capability bits; zero on pre-2.0 devices that reject the query.
    pub fn svm_capabilities(&self) -> Result<cl_device_svm_capabilities> {
        match self.info_value::<cl_device_svm_capabilities>(CL_DEVICE_SVM_CAPABILITIES) {
            Err(Error::Status { code: CL_INVALID_VALUE, .. }) => Ok(0),
            other => other,
        }
    }

    /// Collects the common attributes in one serializable record.
    pub fn summary(&self) -> Result<DeviceSummary> {
        Ok(DeviceSummary {
            name: self.name()?,
            vendor: self.vendor()?,
            version: self.version()?,
            device_type: self.device_type()?,
            max_compute_units: self.max_compute_units()?,
            max_work_group_size: self.max_work_group_size()?,
            max_work_item_sizes: self.max_work_item_sizes()?,
            global_mem_size: self.global_mem_size()?,
            local_mem_size: self.local_mem_size()?,
            max_mem_alloc_size: self.max_mem_alloc_size()?,
            svm_capabilities: self.svm_capabilities()?,
        })
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("platform", &self.platform)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub device_type: DeviceType,
    pub max_compute_units: u32,
    pub max_work_group_size: usize,
    pub max_work_item_sizes: Vec<usize>,
    pub global_mem_size: u64,
    pub local_mem_size: u64,
    pub max_mem_alloc_size: u64,
    pub svm_capabilities: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformSummary {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub profile: String,
    pub extensions: String,
    pub devices: Vec<DeviceSummary>,
}

impl Platform {
    pub fn summary(&self) -> Result<PlatformSummary> {
        Ok(PlatformSummary {
            name: self.name()?,
            vendor: self.vendor()?,
            version: self.version()?,
            profile: self.profile()?,
            extensions: self.extensions()?,
            devices: self
                .devices(DeviceType::All)?
                .iter()
                .map(Device::summary)
                .collect::<Result<_>>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api() -> Arc<Api> {
        Arc::new(crate::soft::api())
    }

    #[test]
    fn soft_platform_is_enumerated() {
        let platforms = Platform::all(&api()).unwrap();
        assert_eq!(platforms.len(), 1);
        assert_eq!(platforms[0].name().unwrap(), crate::soft::PLATFORM_NAME);
        assert!(platforms[0].version().unwrap().starts_with("OpenCL 2.0"));
    }

    #[test]
    fn device_attributes() {
        let device = Device::first(&api()).unwrap();
        assert_eq!(device.device_type().unwrap(), DeviceType::Cpu);
        assert!(device.max_work_group_size().unwrap() >= 1);
        assert_eq!(device.max_work_item_sizes().unwrap().len(), 3);
        assert!(device.global_mem_size().unwrap() > device.local_mem_size().unwrap());
        assert_ne!(device.svm_capabilities().unwrap(), 0);
    }

    #[test]
    fn no_gpu_on_soft_platform() {
        let api = api();
        let platform = &Platform::all(&api).unwrap()[0];
        assert!(platform.devices(DeviceType::Gpu).unwrap().is_empty());
        assert!(matches!(Device::first_of(&api, DeviceType::Gpu), Err(Error::NoDevice)));
    }

    #[test]
    fn device_type_bits_round_trip() {
        for ty in [DeviceType::Cpu, DeviceType::Gpu, DeviceType::Accelerator] {
            assert_eq!(DeviceType::from_bits(ty.bits()), ty);
        }
        assert_eq!("gpu".parse::<DeviceType>().unwrap(), DeviceType::Gpu);
    }

    #[test]
    fn summary_serializes() {
        let platform = &Platform::all(&api()).unwrap()[0];
        let summary = platform.summary().unwrap();
        assert_eq!(summary.devices.len(), 1);
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"device_type\":\"Cpu\""));
    }
}
