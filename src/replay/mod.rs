pub mod trace;

pub use trace::{ReplayTrace, Sample};

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use tokio::time::{self, Instant};

use crate::{
    scheduling::{Clock, RuntimeClock, TokioScheduler},
    visibility::{VisibilityModel, VisibilitySpec, VisibilityState},
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Drives a model through `trace` in real time and returns the state
/// captured at every firing.
pub async fn replay(trace: &ReplayTrace) -> Result<Vec<VisibilityState>> {
    let spec = VisibilitySpec::parse(&trace.spec)?;
    let clock = Arc::new(RuntimeClock::new());
    let start_time = clock.now_ms();
    let started = Instant::now();

    let visibility = Arc::new(Mutex::new(0.0_f64));
    let source = visibility.clone();
    let model = VisibilityModel::with_runtime(
        spec,
        move || match source.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        },
        clock,
        Arc::new(TokioScheduler::current()?),
    );

    let fired = Arc::new(Mutex::new(Vec::new()));
    {
        let fired = fired.clone();
        let reporter = model.clone();
        model.on_trigger_event(move || {
            let state = reporter.get_state(start_time);
            match serde_json::to_string(&state) {
                Ok(json) => log_info!("visibility model {} fired: {json}", reporter.id()),
                Err(err) => log_warn!("failed to serialize visibility state: {err}"),
            }
            if let Ok(mut guard) = fired.lock() {
                guard.push(state);
            }
            reporter.maybe_dispose();
        });
    }

    let outcome = drive(&model, trace, &visibility, started).await;
    // Handlers hold a clone of the model; disposing breaks that cycle.
    model.dispose();
    outcome?;

    let states = match fired.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    Ok(states)
}

async fn drive(
    model: &VisibilityModel,
    trace: &ReplayTrace,
    visibility: &Mutex<f64>,
    started: Instant,
) -> Result<()> {
    for sample in &trace.samples {
        time::sleep_until(started + Duration::from_millis(sample.at)).await;
        if let Ok(mut guard) = visibility.lock() {
            *guard = sample.visibility;
        }
        match sample.ready {
            Some(ready) => model.set_ready(ready)?,
            None => model.update()?,
        }
    }

    time::sleep_until(started + Duration::from_millis(trace.end_offset())).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn replays_until_pending_re_check_fires() {
        let trace = ReplayTrace::from_json(
            r#"{
                "spec": {"totalTimeMin": 1000},
                "samples": [
                    {"at": 0, "visibility": 0.5},
                    {"at": 500, "visibility": 0.6}
                ],
                "until": 1500
            }"#,
        )
        .unwrap();

        let states = replay(&trace).await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].total_visible_time, 1000);
        assert_eq!(states[0].max_visible_percentage, 60.0);
        assert_eq!(states[0].first_visible_time, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_trace_fires_per_episode() {
        let trace = ReplayTrace::from_json(
            r#"{
                "spec": {"visiblePercentageMin": 50, "repeat": true},
                "samples": [
                    {"at": 0, "visibility": 0.8},
                    {"at": 100, "visibility": 0.2},
                    {"at": 200, "visibility": 0.9},
                    {"at": 300, "visibility": 0.0, "ready": false},
                    {"at": 400, "visibility": 0.9, "ready": true}
                ]
            }"#,
        )
        .unwrap();

        let states = replay(&trace).await.unwrap();
        assert_eq!(states.len(), 3);
        assert_eq!(states[1].first_visible_time, 200);
        assert_eq!(states[2].max_visible_percentage, 90.0);
    }

    #[tokio::test(start_paused = true)]
    async fn surfaces_invalid_samples() {
        let trace = ReplayTrace::from_json(r#"{"samples": [{"at": 0, "visibility": 2}]}"#).unwrap();
        let err = replay(&trace).await.unwrap_err();
        assert!(err.to_string().contains("invalid visibility value"));
    }
}
