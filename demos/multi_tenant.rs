//! gpu-tenant demo: three tenants sharing one device.
//!
//! Each tenant gets its own stream and a scratch buffer, then submits a few
//! jobs. The kernel runs them on its worker pool while the tenants' streams
//! copy data independently. Runs on the simulated device unless built with
//! `--features cuda`.
//!
//! Config comes from the usual sources (`GPU_TENANT_*` env, optional TOML
//! via `GPU_TENANT_CONFIG`); set `GPU_TENANT_LOG=debug` to watch the
//! scheduler.

use gpu_tenant::{
    logging, ComputeTask, DeviceBackend, Job, JobError, Kernel, KernelConfig, MemoryKind,
    TaskPriority, TaskState,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "cuda")]
fn device() -> Arc<dyn DeviceBackend> {
    Arc::new(gpu_tenant::device::cuda::CudaDevice::new())
}

#[cfg(not(feature = "cuda"))]
fn device() -> Arc<dyn DeviceBackend> {
    Arc::new(gpu_tenant::SimDevice::single(8, 2 << 30))
}

fn main() {
    logging::init();

    let config = KernelConfig::load().expect("Failed to load config");
    let kernel = Kernel::new(config, device()).expect("Failed to create kernel");

    kernel.handlers().register_fn("sum", |ctx| {
        let n: u64 = ctx.parsed("n")?;
        Ok((1..=n).sum::<u64>().to_string())
    });
    kernel.handlers().register_fn("tokenize", |ctx| {
        let text = ctx.param("text")?;
        Ok(text.split_whitespace().count().to_string())
    });
    kernel.handlers().register_fn("divide", |ctx| {
        let a: i64 = ctx.parsed("a")?;
        let b: i64 = ctx.parsed("b")?;
        a.checked_div(b)
            .map(|q| q.to_string())
            .ok_or_else(|| JobError::Failed("division by zero".to_string()))
    });

    println!("gpu-tenant demo: multi-tenant scheduling");
    for info in kernel.get_available_devices() {
        println!(
            "  device {}: {} (cc {}.{}, {} SMs, {} MB)",
            info.device_id,
            info.name,
            info.compute_capability / 10,
            info.compute_capability % 10,
            info.multiprocessor_count,
            info.total_memory >> 20
        );
    }

    kernel.initialize().expect("Failed to initialize kernel");
    println!(
        "  pool: {} compute nodes, {} memory partitions",
        kernel.get_available_compute_nodes().len(),
        kernel.get_memory_partitions().len()
    );
    println!();

    let tenants = ["llm-chat", "llm-code", "llm-embed"];
    let mut submitted = Vec::new();

    for (i, tenant) in tenants.iter().enumerate() {
        let stream = kernel.create_stream(tenant).expect("Failed to create stream");
        let src = kernel.allocate_memory(4096, tenant).expect("Failed to allocate");
        let dst = kernel.allocate_memory(4096, tenant).expect("Failed to allocate");
        kernel
            .write_memory(src, tenant.as_bytes())
            .expect("Failed to write");
        kernel
            .copy_memory_async(dst, src, tenant.len(), stream)
            .expect("Failed to queue copy");

        let partition = kernel
            .acquire_memory_partition(1 << 20, MemoryKind::Global, tenant)
            .expect("Failed to acquire partition");
        println!("  {tenant}: stream {stream}, buffers {src}/{dst}, partition {partition}");

        let jobs = [
            Job::new("sum").with_param("n", (1000 * (i + 1)).to_string()),
            Job::new("tokenize").with_param("text", format!("hello from {tenant}")),
            Job::new("divide").with_param("a", "42").with_param("b", i.to_string()),
        ];
        for (j, job) in jobs.into_iter().enumerate() {
            let priority = if j == 0 {
                TaskPriority::High
            } else {
                TaskPriority::Normal
            };
            let task = ComputeTask::new(format!("{tenant}-{j}"), *tenant, job)
                .with_priority(priority)
                .with_memory(1 << 20)
                .with_cores(1);
            let id = kernel.schedule_task(task).expect("Failed to schedule");
            submitted.push((tenant.to_string(), id));
        }
    }

    for tenant in tenants {
        for stream in kernel.get_streams_for_tenant(tenant) {
            kernel
                .synchronize_stream(stream)
                .expect("Failed to synchronize");
        }
        let allocations = kernel.tenant_allocations(tenant);
        let copied = kernel
            .read_memory(allocations[1].handle, tenant.len())
            .expect("Failed to read");
        println!("  {tenant}: copied back {:?}", String::from_utf8_lossy(&copied));
    }
    println!();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let pending = submitted
            .iter()
            .filter(|(_, id)| {
                kernel
                    .get_task_status(id)
                    .is_some_and(|t| !t.state.is_terminal())
            })
            .count();
        if pending == 0 || Instant::now() > deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    println!("Results:");
    for (tenant, id) in &submitted {
        match kernel.get_task_status(id) {
            Some(t) => {
                let marker = match t.state {
                    TaskState::Completed => "ok ",
                    TaskState::Failed => "ERR",
                    _ => "...",
                };
                println!("  [{marker}] {tenant:<10} {id}  {}", t.result);
            }
            None => println!("  [???] {tenant:<10} {id}  (gone)"),
        }
    }
    println!();

    println!("Resource usage:");
    for (key, value) in kernel.get_resource_usage() {
        println!("  {key:<28} {value}");
    }
    println!("Performance:");
    for (key, value) in kernel.get_performance_metrics() {
        println!("  {key:<28} {value:.2}");
    }

    kernel.shutdown();
    println!();
    println!(
        "Shut down; streams left for {}: {}",
        tenants[0],
        kernel.get_streams_for_tenant(tenants[0]).len()
    );
}
