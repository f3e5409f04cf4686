//! Driver selection.
//!
//! A [`Config`] decides which native function table the wrappers call through
//! and how default command queues are created. It can be built explicitly or
//! read from `OCLWRAP_*` environment variables.

use crate::error::{Error, Result};
use crate::opencl::bindings::Api;
use crate::platform::DeviceType;
use crate::queue::QueueProperties;
use std::path::PathBuf;
use std::sync::Arc;

/// Which implementation of the native call surface to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverKind {
    /// The installed ICD loader (`libOpenCL`).
    #[default]
    System,
    /// The in-process software driver.
    Soft,
}

impl std::str::FromStr for DriverKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "system" | "opencl" => Ok(Self::System),
            "soft" | "software" => Ok(Self::Soft),
            other => Err(Error::InvalidConfig(format!("unknown driver `{other}`"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub driver: DriverKind,
    /// Overrides the library search when `driver` is `System`.
    pub library_path: Option<PathBuf>,
    /// Whether queues created through [`crate::Context::create_command_queue`]
    /// record profiling timestamps.
    pub profiling: bool,
    pub device_type: DeviceType,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: DriverKind::System,
            library_path: None,
            profiling: true,
            device_type: DeviceType::All,
        }
    }
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_driver(mut self, driver: DriverKind) -> Self {
        self.driver = driver;
        self
    }

    #[must_use]
    pub fn with_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_profiling(mut self, enable: bool) -> Self {
        self.profiling = enable;
        self
    }

    #[must_use]
    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    /// Reads the configuration from the environment.
    ///
    /// - `OCLWRAP_DRIVER`: `system` or `soft`
    /// - `OCLWRAP_LIBRARY`: path to an OpenCL library
    /// - `OCLWRAP_PROFILING`: `0`/`false` disables queue profiling
    /// - `OCLWRAP_DEVICE_TYPE`: `all`, `gpu`, `cpu`, `accelerator` or `default`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("OCLWRAP_DRIVER") {
            config.driver = val.parse()?;
        }
        if let Ok(val) = std::env::var("OCLWRAP_LIBRARY") {
            if !val.is_empty() {
                config.library_path = Some(PathBuf::from(val));
            }
        }
        if let Ok(val) = std::env::var("OCLWRAP_PROFILING") {
            config.profiling = !(val == "0" || val.eq_ignore_ascii_case("false"));
        }
        if let Ok(val) = std::env::var("OCLWRAP_DEVICE_TYPE") {
            config.device_type = val.parse()?;
        }

        Ok(config)
    }

    /// Loads the function table this configuration selects.
    pub fn load_api(&self) -> Result<Arc<Api>> {
        let api = match (self.driver, &self.library_path) {
            (DriverKind::Soft, _) => crate::soft::api(),
            (DriverKind::System, Some(path)) => Api::load_from(path)?,
            (DriverKind::System, None) => Api::load()?,
        };
        Ok(Arc::new(api))
    }

    pub(crate) fn queue_properties(&self) -> QueueProperties {
        if self.profiling {
            QueueProperties::PROFILING
        } else {
            QueueProperties::NONE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_chain() {
        let config = Config::new()
            .with_driver(DriverKind::Soft)
            .with_profiling(false)
            .with_device_type(DeviceType::Gpu)
            .with_library_path("/opt/opencl/libOpenCL.so");

        assert_eq!(config.driver, DriverKind::Soft);
        assert!(!config.profiling);
        assert_eq!(config.queue_properties(), QueueProperties::NONE);
        assert_eq!(config.device_type, DeviceType::Gpu);
        assert!(config.library_path.is_some());
    }

    #[test]
    fn driver_names_parse() {
        assert_eq!("soft".parse::<DriverKind>().unwrap(), DriverKind::Soft);
        assert_eq!("System".parse::<DriverKind>().unwrap(), DriverKind::System);
        assert!("cuda".parse::<DriverKind>().is_err());
    }

    #[test]
    fn profiling_is_on_by_default() {
        assert_eq!(Config::default().queue_properties(), QueueProperties::PROFILING);
    }

    #[test]
    fn soft_driver_loads_without_a_library() {
        let api = Config::new().with_driver(DriverKind::Soft).load_api().unwrap();
        assert_eq!(api.origin, crate::opencl::bindings::ApiOrigin::Soft);
        assert!(api.svm.is_some());
    }
}
