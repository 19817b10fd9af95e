use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::task;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod controller;
mod cpu_stress;
mod error;
mod memory_stress;
mod usage_sampler;

use cli::{Args, CpuMode};
use controller::ControllerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cores = num_cpus::get();
    let plan = Args::parse().into_plan(cores)?;
    let stop = Arc::new(AtomicBool::new(false));

    let mut controller = None;
    let pool = match plan.cpu {
        CpuMode::Off => None,
        CpuMode::Static(load) => Some(cpu_stress::stress_cpu(
            load,
            cpu_stress::CYCLE,
            Arc::clone(&stop),
        )?),
        CpuMode::Absolute(target) => {
            let config = ControllerConfig::new(target * 100.0, cores)?.with_gains(plan.gains);
            let (pool, handle) = controller::absolute_cpu_mode(&config, Arc::clone(&stop))?;
            controller = Some(handle);
            Some(pool)
        }
    };
    if let Some(pool) = &pool {
        debug!("Started {} CPU workers", pool.len());
    }

    // Held until exit.
    let _memory = if plan.mem_gib > 0.0 {
        let gib = plan.mem_gib;
        memory_stress::check_memory_usage();
        let block = task::spawn_blocking(move || memory_stress::stress_memory(gib)).await??;
        memory_stress::check_memory_usage();
        debug!("Holding {} bytes", block.len());
        Some(block)
    } else {
        None
    };

    wait_for_interrupt().await?;
    info!("Exiting...");

    stop.store(true, Ordering::SeqCst);
    if let Some(handle) = controller {
        handle.await?;
    }
    if let Some(pool) = pool {
        task::spawn_blocking(move || pool.join()).await?;
    }
    Ok(())
}

async fn wait_for_interrupt() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
