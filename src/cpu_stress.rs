use std::hint::black_box;
use std::iter;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, Error};

/// Wall-clock length of one busy/idle cycle.
pub const CYCLE: Duration = Duration::from_millis(100);

/// Upper bound on the threads a static request may spawn.
pub const MAX_WORKERS: usize = 1024;

/// Per-worker duty fraction written by the controller and read by every worker.
///
/// The `f64` is stored as its bit pattern so reads never observe a torn value.
#[derive(Clone, Debug, Default)]
pub struct SharedLoad(Arc<AtomicU64>);

impl SharedLoad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    /// Stores `load` clamped to [0, 1]. NaN stores 0.
    pub fn set(&self, load: f64) {
        self.0.store(clamp_unit(load).to_bits(), Ordering::Release);
    }
}

pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Where a worker takes its duty fraction from at the start of each cycle.
#[derive(Clone, Debug)]
pub enum Duty {
    Fixed(f64),
    Shared(SharedLoad),
}

impl Duty {
    fn current(&self) -> f64 {
        match self {
            Duty::Fixed(load) => *load,
            Duty::Shared(load) => load.get(),
        }
    }
}

/// Splits a cycle into its busy and idle phases. `load` must not be negative.
pub fn split_cycle(load: f64, cycle: Duration) -> (Duration, Duration) {
    let busy = cycle.mul_f64(load.min(1.0));
    (busy, cycle.saturating_sub(busy))
}

/// Runs one cycle at `load` and returns the time actually spent busy.
pub fn run_cycle<R: Rng>(load: f64, cycle: Duration, rng: &mut R) -> Duration {
    if !(load > 0.0) {
        thread::sleep(cycle);
        return Duration::ZERO;
    }

    let (busy, idle) = split_cycle(load, cycle);
    let start = Instant::now();
    let end = start + busy;
    while Instant::now() < end {
        black_box(exp_variate(rng));
    }
    let spent = start.elapsed();

    thread::sleep(idle);
    spent
}

// Inverse-CDF exponential sample; 1 - u is in (0, 1] so ln never sees 0.
fn exp_variate<R: Rng>(rng: &mut R) -> f64 {
    -(1.0 - rng.random::<f64>()).ln()
}

fn run_worker(duty: Duty, cycle: Duration, stop: &AtomicBool) {
    let mut rng = rand::rng();
    while !stop.load(Ordering::SeqCst) {
        run_cycle(duty.current(), cycle, &mut rng);
    }
}

/// Rejects static requests that are not finite or need more than
/// `MAX_WORKERS` threads.
pub fn check_static_load(cores: f64) -> Result<(), ConfigError> {
    if !cores.is_finite() || cores.ceil() > MAX_WORKERS as f64 {
        return Err(ConfigError::TooManyWorkers(cores));
    }
    Ok(())
}

/// Duties for a static request of `cores`: whole cores at full duty, then
/// one worker carrying the remainder.
pub fn static_plan(cores: f64) -> Result<Vec<f64>, ConfigError> {
    check_static_load(cores)?;
    if !(cores > 0.0) {
        return Ok(Vec::new());
    }

    let full = cores.trunc();
    let fraction = cores - full;
    let mut plan: Vec<f64> = iter::repeat(1.0).take(full as usize).collect();
    if fraction > 0.0 {
        plan.push(fraction);
    }
    Ok(plan)
}

/// Worker threads sharing one stop flag.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(stop: Arc<AtomicBool>) -> Self {
        Self {
            handles: Vec::new(),
            stop,
        }
    }

    pub fn spawn(&mut self, duty: Duty, cycle: Duration) -> Result<(), Error> {
        let id = self.handles.len();
        let stop = Arc::clone(&self.stop);
        let handle = thread::Builder::new()
            .name(format!("duty-worker-{}", id))
            .spawn(move || run_worker(duty, cycle, &stop))?;
        self.handles.push(handle);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Waits for every worker. Call after raising the stop flag.
    pub fn join(self) {
        for (id, handle) in self.handles.into_iter().enumerate() {
            if handle.join().is_err() {
                warn!("[Worker {}] panicked", id);
            }
        }
        debug!("All CPU workers stopped.");
    }
}

/// Starts a constant load of `cores` cores' worth of CPU.
pub fn stress_cpu(
    cores: f64,
    cycle: Duration,
    stop: Arc<AtomicBool>,
) -> Result<WorkerPool, Error> {
    let plan = static_plan(cores)?;
    let available = num_cpus::get();
    if cores > available as f64 {
        warn!(
            "Requested {} cores of load but only {} are available",
            cores, available
        );
    }

    let mut pool = WorkerPool::new(stop);
    for load in plan {
        pool.spawn(Duty::Fixed(load), cycle)?;
    }

    info!("Applying {}% CPU load", (cores * 100.0) as i64);
    Ok(pool)
}

/// Starts one worker per core, all following `load`.
pub fn stress_cpu_dynamic(
    cores: usize,
    load: &SharedLoad,
    cycle: Duration,
    stop: Arc<AtomicBool>,
) -> Result<WorkerPool, Error> {
    let mut pool = WorkerPool::new(stop);
    for _ in 0..cores {
        pool.spawn(Duty::Shared(load.clone()), cycle)?;
    }
    Ok(pool)
}
