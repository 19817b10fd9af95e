//! Closed-loop CPU target mode.
//!
//! A PID loop samples system usage every tick and publishes a per-core duty
//! fraction that every dynamic worker picks up on its next cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cpu_stress::{self, clamp_unit, SharedLoad, WorkerPool};
use crate::error::{ConfigError, Error};
use crate::usage_sampler::{SystemSampler, UsageSampler};

/// Period between two controller updates.
pub const TICK: Duration = Duration::from_millis(333);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Gains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Default for Gains {
    fn default() -> Self {
        Self {
            kp: 0.9,
            ki: 0.05,
            kd: 0.3,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Desired system usage, 100.0 per fully busy core.
    pub target_percent: f64,
    pub core_count: usize,
    pub gains: Gains,
    pub tick: Duration,
    pub cycle: Duration,
}

impl ControllerConfig {
    pub fn new(target_percent: f64, core_count: usize) -> Result<Self, ConfigError> {
        if !(target_percent > 0.0) || !target_percent.is_finite() {
            return Err(ConfigError::NonPositiveTarget(target_percent));
        }
        if core_count == 0 {
            return Err(ConfigError::NoCores);
        }

        Ok(Self {
            target_percent,
            core_count,
            gains: Gains::default(),
            tick: TICK,
            cycle: cpu_stress::CYCLE,
        })
    }

    pub fn with_gains(self, gains: Gains) -> Self {
        Self { gains, ..self }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PidState {
    pub previous_error: f64,
    pub integral: f64,
}

/// PID law over system usage, producing a per-core duty fraction.
///
/// The integral is a plain running sum with no decay and no anti-windup; only
/// the final output is clamped. A target the host cannot reach therefore
/// winds the integral up for as long as it stays out of reach.
#[derive(Clone, Debug)]
pub struct PidController {
    target: f64,
    cores: f64,
    gains: Gains,
    state: PidState,
}

impl PidController {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            target: config.target_percent,
            cores: config.core_count as f64,
            gains: config.gains,
            state: PidState::default(),
        }
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn state(&self) -> PidState {
        self.state
    }

    /// Feeds one valid sample and returns the new per-core load in [0, 1].
    pub fn update(&mut self, sample: f64) -> f64 {
        let error = self.target - sample;
        self.state.integral += error;
        let derivative = error - self.state.previous_error;

        let Gains { kp, ki, kd } = self.gains;
        let output = kp * error + ki * self.state.integral + kd * derivative;
        self.state.previous_error = error;

        clamp_unit(output / self.cores / 100.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Tick {
    Adjusted { sample: f64, load: f64 },
    Skipped,
}

pub struct ControlLoop<S> {
    sampler: S,
    pid: PidController,
    load: SharedLoad,
}

impl<S: UsageSampler> ControlLoop<S> {
    pub fn new(sampler: S, config: &ControllerConfig, load: SharedLoad) -> Self {
        Self {
            sampler,
            pid: PidController::new(config),
            load,
        }
    }

    /// One controller step. Failed and zero samples leave every piece of
    /// state untouched.
    pub fn tick(&mut self) -> Tick {
        let sample = match self.sampler.sample() {
            Ok(sample) if sample == 0.0 => {
                debug!("Skipping empty CPU usage sample");
                return Tick::Skipped;
            }
            Ok(sample) => sample,
            Err(e) => {
                warn!("Error getting CPU usage: {}", e);
                return Tick::Skipped;
            }
        };

        let load = self.pid.update(sample);
        self.load.set(load);

        info!(
            "Adjusting: System={:.2}%, Target={:.2}%, New Load={:.2}% per core",
            sample,
            self.pid.target(),
            load * 100.0
        );
        Tick::Adjusted { sample, load }
    }

    /// Ticks every `period` until `stop` is raised.
    pub async fn run(mut self, period: Duration, stop: Arc<AtomicBool>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if stop.load(Ordering::SeqCst) {
                break;
            }
            self.tick();
        }
        debug!("Controller loop stopped with {:?}", self.pid.state());
    }
}

/// Starts one dynamic worker per core and the controller task driving them.
pub fn absolute_cpu_mode(
    config: &ControllerConfig,
    stop: Arc<AtomicBool>,
) -> Result<(WorkerPool, JoinHandle<()>), Error> {
    info!(
        "Absolute mode: Targeting {:.2}% system CPU usage with {} cores",
        config.target_percent, config.core_count
    );

    let load = SharedLoad::new();
    let pool = cpu_stress::stress_cpu_dynamic(
        config.core_count,
        &load,
        config.cycle,
        Arc::clone(&stop),
    )?;

    let control = ControlLoop::new(SystemSampler::new(config.core_count), config, load);
    let handle = tokio::spawn(control.run(config.tick, stop));
    Ok((pool, handle))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use rand::Rng;

    use super::*;
    use crate::error::SampleError;

    struct ScriptedSampler {
        samples: VecDeque<Result<f64, SampleError>>,
        repeat: Option<f64>,
    }

    impl ScriptedSampler {
        fn new(samples: Vec<Result<f64, SampleError>>) -> Self {
            Self {
                samples: samples.into(),
                repeat: None,
            }
        }

        fn constant(sample: f64) -> Self {
            Self {
                samples: VecDeque::new(),
                repeat: Some(sample),
            }
        }

        fn with_repeat(self, sample: f64) -> Self {
            Self {
                repeat: Some(sample),
                ..self
            }
        }
    }

    impl UsageSampler for ScriptedSampler {
        fn sample(&mut self) -> Result<f64, SampleError> {
            match self.samples.pop_front() {
                Some(sample) => sample,
                None => self.repeat.ok_or(SampleError::NoCpus),
            }
        }
    }

    fn control(
        sampler: ScriptedSampler,
        target: f64,
        cores: usize,
    ) -> (ControlLoop<ScriptedSampler>, SharedLoad) {
        let config = ControllerConfig::new(target, cores).unwrap();
        let load = SharedLoad::new();
        (ControlLoop::new(sampler, &config, load.clone()), load)
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {}, got {}",
            expected,
            actual
        );
    }

    #[test]
    fn config_rejects_non_positive_target() {
        assert_eq!(
            ControllerConfig::new(0.0, 4),
            Err(ConfigError::NonPositiveTarget(0.0))
        );
        assert!(ControllerConfig::new(-50.0, 4).is_err());
        assert!(ControllerConfig::new(f64::NAN, 4).is_err());
        assert_eq!(ControllerConfig::new(100.0, 0), Err(ConfigError::NoCores));
    }

    #[test]
    fn zero_sample_is_skipped_then_first_valid_tick_applies_full_law() {
        let sampler = ScriptedSampler::new(vec![Ok(0.0)]).with_repeat(100.0);
        let (mut control, load) = control(sampler, 400.0, 4);

        assert_eq!(control.tick(), Tick::Skipped);
        assert_eq!(control.pid.state(), PidState::default());
        assert_eq!(load.get(), 0.0);

        match control.tick() {
            Tick::Adjusted { sample, load: published } => {
                assert_eq!(sample, 100.0);
                assert_close(published, 0.9375);
            }
            Tick::Skipped => panic!("valid sample was skipped"),
        }
        assert_close(load.get(), 0.9375);
        assert_eq!(
            control.pid.state(),
            PidState {
                previous_error: 300.0,
                integral: 300.0,
            }
        );
    }

    #[test]
    fn sampler_error_changes_nothing() {
        let sampler = ScriptedSampler::new(vec![
            Ok(100.0),
            Err(SampleError::NotFinite(f32::NAN)),
        ]);
        let (mut control, load) = control(sampler, 400.0, 4);

        control.tick();
        let state = control.pid.state();
        let published = load.get();

        assert_eq!(control.tick(), Tick::Skipped);
        assert_eq!(control.pid.state(), state);
        assert_eq!(load.get(), published);
    }

    #[test]
    fn on_target_sample_keeps_output_at_rest() {
        let (mut control, load) = control(ScriptedSampler::constant(200.0), 200.0, 4);

        for _ in 0..10 {
            assert_eq!(
                control.tick(),
                Tick::Adjusted {
                    sample: 200.0,
                    load: 0.0,
                }
            );
        }
        assert_eq!(control.pid.state(), PidState::default());
        assert_eq!(load.get(), 0.0);
    }

    #[test]
    fn steady_state_output_comes_from_residual_integral() {
        let sampler = ScriptedSampler::new(vec![Ok(100.0)]).with_repeat(400.0);
        let (mut control, load) = control(sampler, 400.0, 4);

        control.tick();
        // error drops to zero but the derivative kick pulls the output negative
        control.tick();
        assert_eq!(load.get(), 0.0);

        for _ in 0..5 {
            control.tick();
            assert_close(load.get(), 0.05 * 300.0 / 4.0 / 100.0);
        }
        assert_eq!(control.pid.state().integral, 300.0);
    }

    #[test]
    fn output_clamps_to_unit_range() {
        let (mut over, over_load) = control(ScriptedSampler::constant(800.0), 100.0, 8);
        over.tick();
        assert_eq!(over_load.get(), 0.0);

        let (mut under, under_load) = control(ScriptedSampler::constant(1.0), 400.0, 4);
        under.tick();
        assert_eq!(under_load.get(), 1.0);
    }

    #[test]
    fn integral_winds_up_when_target_is_unreachable() {
        let (mut control, _) = control(ScriptedSampler::constant(400.0), 800.0, 4);
        for _ in 0..100 {
            control.tick();
        }
        assert_eq!(control.pid.state().integral, 400.0 * 100.0);
    }

    #[test]
    fn state_stays_finite_and_load_bounded() {
        let mut rng = rand::rng();
        let config = ControllerConfig::new(350.0, 8).unwrap();
        let mut pid = PidController::new(&config);

        for _ in 0..10_000 {
            let sample = rng.random_range(0.1..=800.0);
            let load = pid.update(sample);
            assert!((0.0..=1.0).contains(&load));
            let state = pid.state();
            assert!(state.previous_error.is_finite());
            assert!(state.integral.is_finite());
        }
    }

    #[test]
    fn custom_gains_are_used() {
        let config = ControllerConfig::new(400.0, 4).unwrap().with_gains(Gains {
            kp: 1.0,
            ki: 0.0,
            kd: 0.0,
        });
        let mut pid = PidController::new(&config);
        assert_close(pid.update(200.0), 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_ticks_on_period_until_stopped() {
        let sampler = ScriptedSampler::new(vec![Ok(0.0)]).with_repeat(100.0);
        let config = ControllerConfig::new(400.0, 4).unwrap();
        let load = SharedLoad::new();
        let stop = Arc::new(AtomicBool::new(false));

        let control = ControlLoop::new(sampler, &config, load.clone());
        let handle = tokio::spawn(control.run(config.tick, Arc::clone(&stop)));

        // ticks at 0 (skipped), 333 and 666 ms
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_close(load.get(), (0.9 * 300.0 + 0.05 * 600.0) / 400.0);

        stop.store(true, Ordering::SeqCst);
        handle.await.unwrap();
    }
}
