use thiserror::Error;

/// Rejected command line or controller settings.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("positional arguments not allowed with flags")]
    PositionalWithFlags,
    #[error("too many arguments")]
    TooManyArguments,
    #[error("negative values not allowed")]
    NegativeValue,
    #[error("-c must be specified and positive when using -a")]
    AbsoluteWithoutTarget,
    #[error("no stressors specified")]
    NoStressors,
    #[error("invalid CPU load value: {0}")]
    InvalidLoad(String),
    #[error("static load of {0} cores needs more worker threads than allowed")]
    TooManyWorkers(f64),
    #[error("target must be positive, got {0}")]
    NonPositiveTarget(f64),
    #[error("core count must be positive")]
    NoCores,
}

/// A failed reading of system CPU usage. Never fatal.
#[derive(Debug, Error, PartialEq)]
pub enum SampleError {
    #[error("cannot get system CPU usage: no CPU reported")]
    NoCpus,
    #[error("cannot get system CPU usage: reading is {0}")]
    NotFinite(f32),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("cannot allocate {0} GiB")]
    Memory(f64),
}
