//! Logging setup.
//!
//! The library itself only emits `tracing` events. Binaries call
//! [`init_logging`] once to install a formatted subscriber; `RUST_LOG`
//! always overrides the configured default level.

use std::sync::Once;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub default_level: LogLevel,
    pub with_timestamps: bool,
    pub with_target: bool,
    pub with_ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_level: LogLevel::Info,
            with_timestamps: true,
            with_target: true,
            with_ansi: true,
        }
    }
}

impl LogConfig {
    #[must_use]
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.default_level = level;
        self
    }

    #[must_use]
    pub fn with_timestamps(mut self, enable: bool) -> Self {
        self.with_timestamps = enable;
        self
    }

    #[must_use]
    pub fn with_ansi(mut self, enable: bool) -> Self {
        self.with_ansi = enable;
        self
    }
}

static INIT_LOGGING: Once = Once::new();

/// Installs the global subscriber. Later calls are ignored.
pub fn init_logging(config: &LogConfig) {
    INIT_LOGGING.call_once(|| {
        let filter = std::env::var("RUST_LOG")
            .unwrap_or_else(|_| config.default_level.as_filter_str().to_string());

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(config.with_ansi)
            .with_target(config.with_target);

        // A test harness or host application may already own the global subscriber.
        let _ = if config.with_timestamps {
            builder.try_init()
        } else {
            builder.without_time().try_init()
        };
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        let config = LogConfig::default().with_level(LogLevel::Warn).with_ansi(false);
        init_logging(&config);
        init_logging(&config.with_timestamps(false));
        tracing::warn!("logging initialised twice");
    }
}
