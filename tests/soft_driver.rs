//! End-to-end behaviour of the wrappers on the in-process software driver.

use oclwrap::opencl::types::*;
use oclwrap::soft::{self, Param};
use oclwrap::{
    ArrayReadWrite, CommandQueue, Config, Context, DriverKind, Element, Error, ExecutionStatus,
    LocalMemorySize, MemoryObject, ProfilingInfo, QueueProperties,
};
use bytemuck::{Pod, Zeroable};
use rand::rngs::ThreadRng;
use rand::seq::SliceRandom;
use rand::Rng;

fn soft_context() -> Context {
    Context::from_config(&Config::new().with_driver(DriverKind::Soft)).unwrap()
}

fn setup() -> (Context, CommandQueue) {
    let context = soft_context();
    let queue = context.create_command_queue(0).unwrap();
    (context, queue)
}

/// Writes `data`, overwrites a random sub-range and reads it back, through
/// plain, mapped and shared-virtual memory.
fn round_trip<T, R>(context: &Context, queue: &CommandQueue, data: &[T], rng: &mut R, mut gen: impl FnMut(&mut R) -> T)
where
    T: Element + PartialEq + std::fmt::Debug,
    R: Rng,
{
    let n = data.len();
    let offset = rng.gen_range(0..n);
    let length = rng.gen_range(1..=n - offset);
    let patch: Vec<T> = (0..length).map(|_| gen(rng)).collect();
    let mut expected = data.to_vec();
    expected[offset..offset + length].copy_from_slice(&patch);

    let simple = context.create_simple_memory::<T>(n).unwrap();
    overwrite_range(&simple, queue, data, offset, &patch, &expected);
    let mapping = context.create_mapping_memory::<T>(n).unwrap();
    overwrite_range(&mapping, queue, data, offset, &patch, &expected);

    let mut src = context.create_svm_buffer::<T>(n, 1, 1, 0).unwrap();
    let mut dst = context.create_svm_buffer::<T>(n, 1, 1, 0).unwrap();
    src.map(queue, true).unwrap();
    src.as_mut_slice().unwrap().copy_from_slice(data);
    src.unmap(queue).unwrap();
    dst.map(queue, true).unwrap();
    dst.as_mut_slice().unwrap().fill(T::zeroed());
    dst.unmap(queue).unwrap();

    dst.copy_from(queue, true, &src, offset, 0, length).unwrap();
    dst.map(queue, true).unwrap();
    let copied = dst.as_slice().unwrap();
    assert_eq!(&copied[..length], &data[offset..offset + length]);
    assert!(copied[length..].iter().all(|v| *v == T::zeroed()));
    dst.unmap(queue).unwrap();
}

fn overwrite_range<T, B>(buffer: &B, queue: &CommandQueue, data: &[T], offset: usize, patch: &[T], expected: &[T])
where
    T: Element + PartialEq + std::fmt::Debug,
    B: ArrayReadWrite<T>,
{
    buffer.write(queue, data, &[]).unwrap();
    assert_eq!(buffer.to_vec(queue, &[]).unwrap(), data);

    buffer.write_range(queue, offset, patch.len(), patch, 0, &[]).unwrap();
    let mut back = vec![T::zeroed(); patch.len() + 1];
    buffer.read_range(queue, offset, patch.len(), &mut back, 1, &[]).unwrap();
    assert_eq!(&back[1..], patch);
    assert_eq!(buffer.to_vec(queue, &[]).unwrap(), expected);
}

fn sweep<T>(context: &Context, queue: &CommandQueue, mut gen: impl FnMut(&mut ThreadRng) -> T)
where
    T: Element + PartialEq + std::fmt::Debug,
{
    let mut rng = rand::thread_rng();
    for n in 1..=100 {
        let data: Vec<T> = (0..n).map(|_| gen(&mut rng)).collect();
        round_trip(context, queue, &data, &mut rng, &mut gen);
    }
}

#[test]
fn every_element_width_round_trips() {
    let (context, queue) = setup();

    sweep(&context, &queue, |rng| rng.gen::<i8>());
    sweep(&context, &queue, |rng| rng.gen::<u8>());
    sweep(&context, &queue, |rng| rng.gen::<i16>());
    sweep(&context, &queue, |rng| rng.gen::<u16>());
    sweep(&context, &queue, |rng| rng.gen::<i32>());
    sweep(&context, &queue, |rng| rng.gen::<u32>());
    sweep(&context, &queue, |rng| rng.gen::<i64>());
    sweep(&context, &queue, |rng| rng.gen::<u64>());
    sweep(&context, &queue, |rng| rng.gen::<f32>());
    sweep(&context, &queue, |rng| rng.gen::<f64>());
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
struct Particle {
    position: [f32; 3],
    mass: f32,
    id: u32,
    flags: u32,
}

fn particle(rng: &mut ThreadRng) -> Particle {
    Particle {
        position: rng.gen(),
        mass: rng.gen_range(0.1..10.0),
        id: rng.gen(),
        flags: rng.gen(),
    }
}

#[test]
fn struct_elements_round_trip() {
    let (context, queue) = setup();
    sweep(&context, &queue, particle);

    let mut rng = rand::thread_rng();
    let particles: Vec<Particle> = (0..10).map(|_| particle(&mut rng)).collect();
    let mut memory = context.create_mapping_memory_from(&particles).unwrap();
    {
        let mut region = memory.map(&queue, true, 4, 2, &[]).unwrap();
        assert_eq!(&*region, &particles[4..6]);
        region[1].mass = 0.0;
    }
    let back = memory.to_vec(&queue, &[]).unwrap();
    assert_eq!(back[5].mass, 0.0);
    assert_eq!(back[5].id, particles[5].id);
    assert_eq!(back[4], particles[4]);
    assert_eq!(memory.byte_size(), 10 * 24);
}

#[test]
fn quarters_written_in_any_order() {
    let (context, queue) = setup();
    let data: Vec<u32> = (0..100).collect();
    let mut rng = rand::thread_rng();

    for _ in 0..12 {
        let buffer = context.create_simple_memory::<u32>(100).unwrap();
        buffer.write(&queue, &[0; 100], &[]).unwrap();
        let mut order = [0usize, 1, 2, 3];

        order.shuffle(&mut rng);
        for &quarter in &order {
            buffer
                .write_range(&queue, quarter * 25, 25, &data, quarter * 25, &[])
                .unwrap();
        }
        assert_eq!(buffer.to_vec(&queue, &[]).unwrap(), data);

        order.shuffle(&mut rng);
        let mut back = vec![0u32; 100];
        for &quarter in &order {
            buffer
                .read_range(&queue, quarter * 25, 25, &mut back, quarter * 25, &[])
                .unwrap();
        }
        assert_eq!(back, data);
    }
}

#[test]
fn transfers_are_bounds_checked() {
    let (context, queue) = setup();
    let buffer = context.create_simple_memory::<f32>(4).unwrap();

    let err = buffer.write_at(&queue, 2, &[1.0, 2.0, 3.0], &[]).unwrap_err();
    assert!(matches!(err, Error::OutOfRange { what: "buffer", offset: 2, length: 3, bound: 4 }));

    let mut small = [0.0f32; 2];
    let err = buffer.read_range(&queue, 0, 3, &mut small, 0, &[]).unwrap_err();
    assert!(matches!(err, Error::OutOfRange { what: "data", .. }));

    let err = buffer
        .write_range(&queue, usize::MAX, 2, &[0.0, 0.0], 0, &[])
        .unwrap_err();
    assert!(matches!(err, Error::OutOfRange { .. }));
}

#[test]
fn mapped_view_is_coherent_with_transfers() {
    let (context, queue) = setup();
    let mut memory = context.create_mapping_memory::<i32>(8).unwrap();
    let written = memory.write(&queue, &[1, 2, 3, 4, 5, 6, 7, 8], &[]).unwrap();

    {
        let mut region = memory.map(&queue, true, 2, 4, &[&written]).unwrap();
        assert_eq!(&*region, &[3, 4, 5, 6]);
        for value in region.iter_mut() {
            *value *= -1;
        }
        region.unmap().unwrap().wait().unwrap();
    }

    assert_eq!(memory.to_vec(&queue, &[]).unwrap(), vec![1, 2, -3, -4, -5, -6, 7, 8]);
    assert_eq!(memory.byte_size(), 32);
}

#[test]
fn halves_and_overlapping_remaps_stay_coherent() {
    let (context, queue) = setup();
    let data: Vec<i32> = (0..100).collect();
    let mut memory = context.create_mapping_memory_from(&data).unwrap();

    {
        let mut first = memory.map(&queue, true, 0, 50, &[]).unwrap();
        assert_eq!(&*first, &data[..50]);
        first.iter_mut().for_each(|v| *v += 1000);
        first.unmap().unwrap().wait().unwrap();
    }
    {
        let mut second = memory.map(&queue, false, 50, 50, &[]).unwrap();
        assert_eq!(&*second, &data[50..]);
        second.iter_mut().for_each(|v| *v += 2000);
    }

    let mut expected: Vec<i32> = data
        .iter()
        .map(|&v| if v < 50 { v + 1000 } else { v + 2000 })
        .collect();
    assert_eq!(memory.to_vec(&queue, &[]).unwrap(), expected);

    // A typed write across the boundary, then a map overlapping both halves.
    let patch: Vec<i32> = (0..20).map(|v| -v).collect();
    let written = memory.write_at(&queue, 40, &patch, &[]).unwrap();
    expected[40..60].copy_from_slice(&patch);
    {
        let mut middle = memory.map(&queue, true, 25, 50, &[&written]).unwrap();
        assert_eq!(&*middle, &expected[25..75]);
        middle.set(0, 7).unwrap();
        middle.set(49, 9).unwrap();
    }
    expected[25] = 7;
    expected[74] = 9;

    let mut tail = vec![0; 30];
    memory.read_range(&queue, 70, 30, &mut tail, 0, &[]).unwrap();
    assert_eq!(tail, &expected[70..]);
    assert_eq!(memory.to_vec(&queue, &[]).unwrap(), expected);
}

#[test]
fn scale_kernel() {
    soft::register_kernel("it_scale", &[Param::Buffer, Param::Scalar(4)], |item| {
        let i = item.global_id(0);
        let rate = item.scalar::<f32>(1)?;
        let value = item.read::<f32>(0, i)?;
        item.write(0, i, value * rate)
    });
    let source = "kernel void it_scale(global float* array, float rate) {
        array[get_global_id(0)] *= rate;
    }";

    let (context, queue) = setup();
    let kernel = context.create_kernel(source, "it_scale").unwrap();
    let buffer = context.create_simple_memory_from(&[3.0f32, 4.5, 0.0, -4.4]).unwrap();

    kernel.set_arg(0, &buffer).unwrap();
    kernel.set_arg(1, 2.0f32).unwrap();
    kernel.set_work_size(&[4]).unwrap();
    kernel.dispatch(&queue, &[]).unwrap().wait().unwrap();

    assert_eq!(buffer.to_vec(&queue, &[]).unwrap(), vec![6.0, 9.0, 0.0, -8.8]);
}

#[test]
fn bound_arguments_persist_between_dispatches() {
    soft::register_kernel("it_accumulate", &[Param::Buffer, Param::Scalar(4)], |item| {
        let i = item.global_id(0);
        let step = item.scalar::<i32>(1)?;
        let value = item.read::<i32>(0, i)?;
        item.write(0, i, value + step)
    });
    let source = "kernel void it_accumulate(global int* data, int step) {}";

    let (context, queue) = setup();
    let kernel = context.create_kernel(source, "it_accumulate").unwrap();
    let buffer = context.create_simple_memory_from(&[0i32; 6]).unwrap();

    kernel.run(&queue, &[6], [oclwrap::KernelArg::from(&buffer), 1i32.into()], &[]).unwrap();
    kernel.dispatch(&queue, &[]).unwrap();
    assert_eq!(buffer.to_vec(&queue, &[]).unwrap(), vec![2; 6]);

    // Only the scalar changes; the buffer stays bound.
    kernel.set_arg(1, 10i32).unwrap();
    kernel.set_work_size(&[3]).unwrap();
    kernel.dispatch(&queue, &[]).unwrap();
    assert_eq!(buffer.to_vec(&queue, &[]).unwrap(), vec![12, 12, 12, 2, 2, 2]);
    assert_eq!(kernel.work_size(), vec![3]);
}

#[test]
fn two_dimensional_launch_with_dependencies() {
    soft::register_kernel("it_grid", &[Param::Buffer], |item| {
        let (x, y) = (item.global_id(0), item.global_id(1));
        let width = item.global_size(0);
        let value = item.read::<u32>(0, x + y * width)?;
        item.write(0, x + y * width, value + (x as u32) * 100 + y as u32)
    });
    let source = "__kernel void it_grid(__global uint* grid) {}";

    let (context, queue) = setup();
    let kernel = context.create_kernel(source, "it_grid").unwrap();
    let grid = context.create_simple_memory::<u32>(12).unwrap();
    let written = grid.write(&queue, &[1; 12], &[]).unwrap();

    kernel.set_arg(0, &grid).unwrap();
    kernel.set_work_size(&[4, 3]).unwrap();
    kernel.set_local_size(&[2, 1]).unwrap();
    let done = kernel.dispatch(&queue, &[&written]).unwrap();
    assert_eq!(done.status().unwrap(), ExecutionStatus::Complete);

    let values = grid.to_vec(&queue, &[&done]).unwrap();
    assert_eq!(values[0], 1);
    assert_eq!(values[3 + 2 * 4], 1 + 300 + 2);

    kernel.set_local_size(&[2]).unwrap();
    assert!(matches!(
        kernel.dispatch(&queue, &[]),
        Err(Error::DimensionMismatch { global: 2, local: 1 })
    ));
    kernel.clear_local_size();
    kernel.dispatch(&queue, &[]).unwrap();
}

#[test]
fn local_memory_arguments_reach_the_kernel() {
    soft::register_kernel("it_local", &[Param::Local, Param::Buffer], |item| {
        let size = item.local_size(0)?;
        item.write(1, item.global_id(0), size as u64)
    });
    let source = "kernel void it_local(local float* scratch, global ulong* out) {}";

    let (context, queue) = setup();
    let kernel = context.create_kernel(source, "it_local").unwrap();
    let out = context.create_simple_memory::<u64>(2).unwrap();
    kernel.set_arg(0, LocalMemorySize::of::<f32>(16)).unwrap();
    kernel.set_arg(1, &out).unwrap();
    kernel.set_work_size(&[2]).unwrap();
    kernel.dispatch(&queue, &[]).unwrap();
    assert_eq!(out.to_vec(&queue, &[]).unwrap(), vec![64, 64]);

    let err = kernel.set_arg(0, LocalMemorySize::new(0)).unwrap_err();
    assert_eq!(err.code(), Some(CL_INVALID_ARG_SIZE));
}

#[test]
fn failing_kernel_reports_status() {
    soft::register_kernel("it_overrun", &[Param::Buffer], |item| {
        let i = item.global_id(0);
        item.write(0, i + 1, 0u8)
    });
    let source = "kernel void it_overrun(global uchar* data) {}";

    let (context, queue) = setup();
    let kernel = context.create_kernel(source, "it_overrun").unwrap();
    let data = context.create_simple_memory::<u8>(4).unwrap();
    kernel.set_arg(0, &data).unwrap();
    kernel.set_work_size(&[4]).unwrap();
    let err = kernel.dispatch(&queue, &[]).unwrap_err();
    assert!(matches!(err, Error::Status { code: CL_OUT_OF_RESOURCES, .. }));
}

#[test]
fn svm_buffer_as_kernel_argument() {
    soft::register_kernel("it_svm_square", &[Param::Buffer], |item| {
        let i = item.global_id(0);
        let v = item.read::<f32>(0, i)?;
        item.write(0, i, v * v)
    });
    let source = "kernel void it_svm_square(global float* values) {}";

    let (context, queue) = setup();
    let kernel = context.create_kernel(source, "it_svm_square").unwrap();
    let mut values = context.create_svm_buffer::<f32>(4, 2, 1, 0).unwrap();

    values.map(&queue, true).unwrap();
    for (i, v) in values.as_mut_slice().unwrap().iter_mut().enumerate() {
        *v = i as f32;
    }
    values.unmap(&queue).unwrap();

    kernel.set_arg(0, &values).unwrap();
    kernel.set_work_size(&[values.len()]).unwrap();
    kernel.dispatch(&queue, &[]).unwrap().wait().unwrap();

    values.map(&queue, true).unwrap();
    assert_eq!(values.get2(3, 1).unwrap(), 49.0);
    assert_eq!(values.iter().unwrap().copied().sum::<f32>(), 140.0);
    values.unmap(&queue).unwrap();
}

#[test]
fn profiling_timestamps_are_ordered() {
    let context = soft_context();
    let device = context.devices()[0].clone();
    let queue = context
        .create_command_queue_for(&device, QueueProperties::PROFILING)
        .unwrap();
    assert!(queue.profiling());

    let buffer = context.create_simple_memory::<u8>(1024).unwrap();
    let event = buffer.write(&queue, &[7; 1024], &[]).unwrap();
    event.wait().unwrap();

    let queued = event.profiling(ProfilingInfo::Queued).unwrap();
    let start = event.profiling(ProfilingInfo::Start).unwrap();
    let end = event.profiling(ProfilingInfo::End).unwrap();
    assert!(queued <= start && start <= end);
    assert_eq!(event.execution_time().unwrap().as_nanos() as u64, end - start);
}

#[test]
fn release_is_idempotent_and_use_after_release_fails() {
    let (context, queue) = setup();
    let buffer = context.create_simple_memory::<u16>(8).unwrap();
    let raw = buffer.as_raw();

    buffer.release().unwrap();
    buffer.release().unwrap();
    assert!(!soft::is_live(raw));
    assert!(matches!(
        buffer.write(&queue, &[1; 8], &[]),
        Err(Error::Released("memory object"))
    ));

    queue.release().unwrap();
    queue.release().unwrap();
    assert!(matches!(queue.finish(), Err(Error::Released("command queue"))));

    context.release().unwrap();
    context.release().unwrap();
    assert!(matches!(
        context.create_simple_memory::<u8>(4),
        Err(Error::Released("context"))
    ));
}

#[test]
fn dropping_the_last_owner_releases() {
    let context = soft_context();
    let raw_context = context.as_raw();
    let buffer = context.create_simple_memory::<u8>(4).unwrap();
    let raw_buffer = buffer.as_raw();

    drop(context);
    // The buffer still holds the context.
    assert!(soft::is_live(raw_context));
    drop(buffer);
    assert!(!soft::is_live(raw_buffer));
    assert!(!soft::is_live(raw_context));
}
