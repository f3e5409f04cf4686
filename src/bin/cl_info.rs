//! Lists OpenCL platforms and devices.
//!
//! `cl_info` prints a table; `cl_info --json` prints the same data as JSON.
//! The driver is chosen through the `OCLWRAP_*` environment variables.

use anyhow::{bail, Context, Result};
use oclwrap::logging::{init_logging, LogConfig, LogLevel};
use oclwrap::platform::PlatformSummary;
use oclwrap::{Config, Platform};
use prettytable::{row, Table};

fn print_table(platforms: &[PlatformSummary]) {
    for platform in platforms {
        let mut table = Table::new();
        table.add_row(row!["Platform", platform.name]);
        table.add_row(row!["Vendor", platform.vendor]);
        table.add_row(row!["Version", platform.version]);
        table.add_row(row!["Profile", platform.profile]);
        table.printstd();

        let mut devices = Table::new();
        devices.add_row(row![
            "Device",
            "Type",
            "Compute units",
            "Work group",
            "Global memory (MiB)",
            "Local memory (KiB)",
            "SVM"
        ]);
        for device in &platform.devices {
            devices.add_row(row![
                device.name,
                format!("{:?}", device.device_type),
                device.max_compute_units,
                device.max_work_group_size,
                device.global_mem_size >> 20,
                device.local_mem_size >> 10,
                if device.svm_capabilities != 0 { "yes" } else { "no" }
            ]);
        }
        devices.printstd();
        println!();
    }
}

fn main() -> Result<()> {
    init_logging(&LogConfig::default().with_level(LogLevel::Warn));

    let mut json = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--json" => json = true,
            other => bail!("unknown argument `{}` (usage: cl_info [--json])", other),
        }
    }

    let config = Config::from_env()?;
    let api = config.load_api().context("failed to load an OpenCL driver")?;
    let platforms = Platform::all(&api)?
        .iter()
        .map(Platform::summary)
        .collect::<oclwrap::Result<Vec<_>>>()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&platforms)?);
    } else if platforms.is_empty() {
        println!("No OpenCL platforms found");
    } else {
        print_table(&platforms);
    }
    Ok(())
}
