use clap::Parser;

use crate::controller::Gains;
use crate::cpu_stress::check_static_load;
use crate::error::ConfigError;

/// Generate CPU and memory load.
///
/// Without flags, takes an optional number of cores to load (all cores by
/// default). With -a, -c is the system-wide usage to hold, in cores.
#[derive(Parser, Debug)]
#[command(name = "stress-test", version, about)]
pub struct Args {
    /// CPU load to apply, in cores (1.5 = 150% of one core)
    #[arg(short = 'c', long = "cpu", allow_negative_numbers = true)]
    pub cpu: Option<f64>,

    /// Memory to allocate in GiB (0 to disable)
    #[arg(short = 'm', long = "mem", allow_negative_numbers = true)]
    pub mem: Option<f64>,

    /// Hold system-wide CPU usage at -c cores instead of adding a fixed load
    #[arg(short = 'a', long = "absolute")]
    pub absolute: bool,

    /// Proportional gain for -a
    #[arg(long)]
    pub kp: Option<f64>,

    /// Integral gain for -a
    #[arg(long)]
    pub ki: Option<f64>,

    /// Derivative gain for -a
    #[arg(long)]
    pub kd: Option<f64>,

    /// Legacy form: CPU load in cores
    #[arg(allow_negative_numbers = true)]
    pub load: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CpuMode {
    Off,
    /// Fixed load, in cores.
    Static(f64),
    /// System-wide target, in cores.
    Absolute(f64),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunPlan {
    pub cpu: CpuMode,
    pub mem_gib: f64,
    pub gains: Gains,
}

impl Args {
    fn has_flags(&self) -> bool {
        self.cpu.is_some()
            || self.mem.is_some()
            || self.absolute
            || self.kp.is_some()
            || self.ki.is_some()
            || self.kd.is_some()
    }

    fn gains(&self) -> Gains {
        let defaults = Gains::default();
        Gains {
            kp: self.kp.unwrap_or(defaults.kp),
            ki: self.ki.unwrap_or(defaults.ki),
            kd: self.kd.unwrap_or(defaults.kd),
        }
    }

    /// Validates the arguments. `available_cores` is the legacy default load.
    pub fn into_plan(self, available_cores: usize) -> Result<RunPlan, ConfigError> {
        if self.has_flags() {
            self.flags_plan()
        } else {
            self.legacy_plan(available_cores)
        }
    }

    fn flags_plan(self) -> Result<RunPlan, ConfigError> {
        if !self.load.is_empty() {
            return Err(ConfigError::PositionalWithFlags);
        }

        let cpu = self.cpu.unwrap_or(0.0);
        let mem_gib = self.mem.unwrap_or(0.0);
        for value in [cpu, mem_gib] {
            if !value.is_finite() {
                return Err(ConfigError::InvalidLoad(value.to_string()));
            }
        }
        if cpu < 0.0 || mem_gib < 0.0 {
            return Err(ConfigError::NegativeValue);
        }

        let cpu = if self.absolute {
            if !(cpu > 0.0) {
                return Err(ConfigError::AbsoluteWithoutTarget);
            }
            CpuMode::Absolute(cpu)
        } else if cpu > 0.0 {
            check_static_load(cpu)?;
            CpuMode::Static(cpu)
        } else {
            CpuMode::Off
        };

        if cpu == CpuMode::Off && !(mem_gib > 0.0) {
            return Err(ConfigError::NoStressors);
        }

        Ok(RunPlan {
            cpu,
            mem_gib,
            gains: self.gains(),
        })
    }

    fn legacy_plan(self, available_cores: usize) -> Result<RunPlan, ConfigError> {
        let cores = match self.load.as_slice() {
            [] => available_cores as f64,
            [value] => match value.parse::<f64>() {
                Ok(n) if n > 0.0 && n.is_finite() => n,
                _ => return Err(ConfigError::InvalidLoad(value.clone())),
            },
            _ => return Err(ConfigError::TooManyArguments),
        };
        check_static_load(cores)?;

        Ok(RunPlan {
            cpu: CpuMode::Static(cores),
            mem_gib: 0.0,
            gains: Gains::default(),
        })
    }
}
