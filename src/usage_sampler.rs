use sysinfo::System;

use crate::error::SampleError;

/// Source of aggregate CPU usage, where 100.0 is one core fully busy.
pub trait UsageSampler {
    fn sample(&mut self) -> Result<f64, SampleError>;
}

/// Reads system-wide usage through `sysinfo`.
///
/// Usage is computed between two consecutive refreshes, so the first call on
/// a fresh sampler reports 0. The controller discards that reading.
pub struct SystemSampler {
    system: System,
    cores: usize,
}

impl SystemSampler {
    pub fn new(cores: usize) -> Self {
        Self {
            system: System::new(),
            cores,
        }
    }
}

impl UsageSampler for SystemSampler {
    fn sample(&mut self) -> Result<f64, SampleError> {
        self.system.refresh_cpu_usage();
        if self.system.cpus().is_empty() {
            return Err(SampleError::NoCpus);
        }

        let usage = self.system.global_cpu_usage();
        if !usage.is_finite() {
            return Err(SampleError::NotFinite(usage));
        }

        Ok(scale_to_cores(usage, self.cores))
    }
}

// global_cpu_usage is averaged over all CPUs; scale back up to per-core percent.
fn scale_to_cores(usage: f32, cores: usize) -> f64 {
    f64::from(usage) * cores as f64
}
