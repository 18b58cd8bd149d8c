//! Pool stress test
//!
//! Hammers the staging, command pool, command buffer and heap allocators from several
//! threads on the headless host backend, then reports pool statistics.
//!
//! Usage: `pool_stress [config.toml|config.ron]`

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use ash::vk;
use parking_lot::Mutex;
use rand::Rng;
use render_pools::prelude::*;
use thiserror::Error;

const WORKER_THREADS: usize = 8;
const ITERATIONS_PER_THREAD: usize = 2_000;
const QUEUE_FAMILIES: u32 = 2;
const DESCRIPTOR_ALIGNMENT: u64 = 256;

/// Errors that abort the run
#[derive(Error, Debug)]
enum StressError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Worker thread panicked")]
    WorkerPanicked,
}

/// Per-run counters shared by the workers
#[derive(Default)]
struct Counters {
    uploads: AtomicU64,
    readbacks: AtomicU64,
    command_pools: AtomicU64,
    command_buffers: AtomicU64,
    heap_allocations: AtomicU64,
    exhausted: AtomicU64,
    heap_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Pools {
    submit: StagingBufferPool<HostStagingAllocator>,
    fetch: StagingBufferPool<HostStagingAllocator>,
    commands: CommandPoolManager<HostCommandPoolFactory>,
    buffers: CommandBufferPool<HostCommandBufferAllocator>,
    heap: Mutex<HeapAllocator>,
}

impl Pools {
    fn new(config: &PoolsConfig) -> Result<Self, StressError> {
        Ok(Self {
            submit: StagingBufferPool::new(HostStagingAllocator::new(), config.staging_submit.clone())?,
            fetch: StagingBufferPool::new(HostStagingAllocator::new(), config.staging_fetch.clone())?,
            commands: CommandPoolManager::new(Arc::new(HostCommandPoolFactory::new()), config.command_pools.clone())?,
            buffers: CommandBufferPool::new(HostCommandBufferAllocator::new(0), &config.command_buffers)?,
            heap: Mutex::new(HeapAllocator::new(config.descriptor_heap_size)),
        })
    }
}

fn load_config() -> Result<PoolsConfig, StressError> {
    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => {
            log::info!("Loading pool configuration from {}", path.display());
            PoolsConfig::load_from_file(&path)?
        }
        None => PoolsConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

/// Note an exhausted pool and keep going; anything else aborts the worker
fn tolerate_exhaustion<T>(result: PoolResult<T>, counters: &Counters) -> PoolResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(error) if error.is_exhaustion() => {
            Counters::bump(&counters.exhausted);
            Ok(None)
        }
        Err(error) => Err(error),
    }
}

fn run_worker(worker: usize, iterations: usize, pools: &Pools, counters: &Counters) -> PoolResult<()> {
    let mut rng = rand::thread_rng();
    let payload = vec![u8::try_from(worker % 256).unwrap_or(0); 4096];

    for iteration in 0..iterations {
        // Mostly small uploads with the occasional large texture
        let size = if rng.gen_bool(0.05) {
            rng.gen_range(4 * 1024 * 1024..=48 * 1024 * 1024)
        } else {
            rng.gen_range(1..=512 * 1024)
        };

        if let Some(mut buffer) = tolerate_exhaustion(pools.submit.acquire_buffer(size), counters)? {
            let len = payload.len().min(usize::try_from(buffer.size()).unwrap_or(usize::MAX));
            buffer.write_bytes(0, &payload[..len])?;
            Counters::bump(&counters.uploads);
        }

        if iteration % 4 == 0 {
            if let Some(buffer) = tolerate_exhaustion(pools.fetch.acquire_buffer(size / 4), counters)? {
                let mut readback = [0u8; 64];
                buffer.read_bytes(0, &mut readback)?;
                Counters::bump(&counters.readbacks);
            }
        }

        let family = rng.gen_range(0..QUEUE_FAMILIES);
        let flags = if rng.gen_bool(0.25) {
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
        } else {
            vk::CommandPoolCreateFlags::TRANSIENT
        };
        if tolerate_exhaustion(pools.commands.acquire_command_pool(family, flags), counters)?.is_some() {
            Counters::bump(&counters.command_pools);
        }

        let level = if rng.gen_bool(0.2) {
            vk::CommandBufferLevel::SECONDARY
        } else {
            vk::CommandBufferLevel::PRIMARY
        };
        if tolerate_exhaustion(pools.buffers.acquire_buffer(level), counters)?.is_some() {
            Counters::bump(&counters.command_buffers);
        }

        let range = rng.gen_range(1..=64 * 1024);
        let allocation = pools.heap.lock().allocate(range, DESCRIPTOR_ALIGNMENT);
        match allocation {
            Ok(offset) => {
                Counters::bump(&counters.heap_allocations);
                if let Err(error) = pools.heap.lock().free(offset, range) {
                    log::error!("Worker {worker}: {error}");
                }
            }
            Err(_) => Counters::bump(&counters.heap_failures),
        }
    }

    Ok(())
}

fn report(name: &str, statistics: PoolStatistics) {
    log::info!(
        "{name}: {} available, {} busy, peak {}, created {}, evicted {}",
        statistics.available,
        statistics.busy,
        statistics.peak_demand,
        statistics.total_created,
        statistics.total_evicted
    );
}

fn main() -> Result<(), StressError> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("Starting pool stress test");

    let config = load_config()?;
    let pools = Pools::new(&config)?;
    let counters = Counters::default();
    let started = Instant::now();

    thread::scope(|scope| {
        let workers: Vec<_> = (0..WORKER_THREADS)
            .map(|worker| {
                let pools = &pools;
                let counters = &counters;
                scope.spawn(move || run_worker(worker, ITERATIONS_PER_THREAD, pools, counters))
            })
            .collect();

        for handle in workers {
            handle.join().map_err(|_| StressError::WorkerPanicked)??;
        }
        Ok::<(), StressError>(())
    })?;

    log::info!(
        "Finished {} iterations on {WORKER_THREADS} threads in {:.2?}",
        WORKER_THREADS * ITERATIONS_PER_THREAD,
        started.elapsed()
    );
    log::info!(
        "uploads {}, readbacks {}, command pools {}, command buffers {}, heap ranges {}, exhausted {}, heap failures {}",
        counters.uploads.load(Ordering::Relaxed),
        counters.readbacks.load(Ordering::Relaxed),
        counters.command_pools.load(Ordering::Relaxed),
        counters.command_buffers.load(Ordering::Relaxed),
        counters.heap_allocations.load(Ordering::Relaxed),
        counters.exhausted.load(Ordering::Relaxed),
        counters.heap_failures.load(Ordering::Relaxed)
    );

    report("staging submit", pools.submit.statistics());
    report("staging fetch", pools.fetch.statistics());
    for family in pools.commands.queue_families() {
        if let Some(statistics) = pools.commands.statistics(family) {
            report(&format!("command pools (family {family})"), statistics);
        }
    }

    report("command buffers", pools.buffers.statistics());

    let submit = pools.submit.run_maintenance();
    let fetch = pools.fetch.run_maintenance();
    log::info!(
        "Final maintenance: submit evicted {} created {}, fetch evicted {} created {}",
        submit.evicted,
        submit.created,
        fetch.evicted,
        fetch.created
    );

    let heap = pools.heap.lock();
    log::info!(
        "Descriptor heap: {} of {} bytes free in {} block(s)",
        heap.free_bytes(),
        heap.total_size(),
        heap.free_block_count()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_worker_run_uploads() {
        let pools = Pools::new(&PoolsConfig::default()).expect("pools");
        let counters = Counters::default();

        run_worker(0, 50, &pools, &counters).expect("worker");

        assert!(counters.uploads.load(Ordering::Relaxed) > 0);
        assert!(counters.command_buffers.load(Ordering::Relaxed) > 0);
        assert_eq!(pools.submit.statistics().busy, 0);
        assert_eq!(pools.buffers.statistics().busy, 0);
    }
}
