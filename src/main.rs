//! Scales a random vector on the selected OpenCL device and checks the result
//! against the host.
//!
//! The driver comes from `OCLWRAP_DRIVER` (`system` or `soft`).

use anyhow::{Context as _, Result};
use oclwrap::logging::{init_logging, LogConfig};
use oclwrap::soft::{self, Param};
use oclwrap::utils::{max_abs_diff, measure_time};
use oclwrap::{ArrayReadWrite, Config, Context, DriverKind};
use rand::Rng;
use tracing::info;

const VECTOR_LEN: usize = 1 << 16;
const RATE: f32 = 2.5;

const SCALE_SOURCE: &str = r#"
kernel void scale(global float* array, float rate) {
    size_t i = get_global_id(0);
    array[i] = array[i] * rate;
}
"#;

/// Host version of `scale` for the software driver.
fn register_soft_kernels() {
    soft::register_kernel("scale", &[Param::Buffer, Param::Scalar(4)], |item| {
        let i = item.global_id(0);
        let rate = item.scalar::<f32>(1)?;
        let value = item.read::<f32>(0, i)?;
        item.write(0, i, value * rate)
    });
}

fn main() -> Result<()> {
    init_logging(&LogConfig::default());

    let config = Config::from_env().context("invalid OCLWRAP_* environment")?;
    if config.driver == DriverKind::Soft {
        register_soft_kernels();
    }

    let context = Context::from_config(&config).context("failed to create an OpenCL context")?;
    let device = &context.devices()[0];
    info!("device: {} ({})", device.name()?, device.version()?);

    let queue = context.create_command_queue(0)?;
    let kernel = context
        .create_kernel(SCALE_SOURCE, "scale")
        .context("failed to build the scale kernel")?;

    let mut rng = rand::thread_rng();
    let input: Vec<f32> = (0..VECTOR_LEN).map(|_| rng.gen_range(-100.0..100.0)).collect();
    let buffer = context.create_simple_memory_from(&input)?;

    kernel.set_arg(0, &buffer)?;
    kernel.set_arg(1, RATE)?;
    kernel.set_work_size(&[VECTOR_LEN])?;

    let (event, device_time) = measure_time(|| kernel.dispatch(&queue, &[]));
    let event = event?;
    event.wait()?;
    if queue.profiling() {
        info!("kernel time (profiled): {:?}", event.execution_time()?);
    }

    let output = buffer.to_vec(&queue, &[])?;
    let (expected, host_time) = measure_time(|| input.iter().map(|v| v * RATE).collect::<Vec<_>>());

    let diff = max_abs_diff(&output, &expected);
    println!("elements:        {}", VECTOR_LEN);
    println!("device dispatch: {:?}", device_time);
    println!("host loop:       {:?}", host_time);
    println!("max difference:  {}", diff);

    anyhow::ensure!(diff <= 1e-4, "device and host results differ by {}", diff);
    println!("results match");
    Ok(())
}
