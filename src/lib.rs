pub mod replay;
pub mod scheduling;
pub mod utils;
pub mod visibility;

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};

pub use replay::{replay, ReplayTrace};
pub use scheduling::{Clock, RuntimeClock, ScheduledTask, TaskScheduler, TokioScheduler};
pub use visibility::{
    ReportWhen, TriggerState, VisibilityModel, VisibilitySpec, VisibilityState,
};

/// Replays the trace file named by the first argument and prints every
/// fired state as a JSON line.
pub fn run() -> Result<()> {
    let debug_mode = std::env::var("AMP_VISIBILITY_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::new()
        .filter_level(if debug_mode {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .parse_default_env()
        .init();

    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("usage: amp-visibility <trace.json>"))?;

    let trace = ReplayTrace::load(&path)?;
    log::info!(
        "replaying {} samples from {}",
        trace.samples.len(),
        path.display()
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    let states = runtime.block_on(replay(&trace))?;

    for state in &states {
        println!("{}", serde_json::to_string(state)?);
    }
    log::info!("trigger fired {} time(s)", states.len());
    Ok(())
}
