use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::scheduling::{
    Clock, ReadyFuture, RuntimeClock, ScheduledTask, TaskScheduler, TokioScheduler,
};

use super::{
    counters::{validate_visibility, VisibilityCounters, VisibilityState},
    VisibilitySpec,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error};

type CalcVisibility = Arc<dyn Fn() -> f64 + Send + Sync>;
type ReportReadyFactory = Box<dyn FnOnce() -> ReadyFuture + Send>;
type Unsubscribe = Box<dyn FnOnce() + Send>;
pub type TriggerHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TriggerState {
    Armed,
    Fired,
    Disposed,
}

struct ModelState {
    counters: VisibilityCounters,
    trigger: TriggerState,
    ready: bool,
    report_ready: bool,
    report_ready_factory: Option<ReportReadyFactory>,
    /// Set after a repeating trigger fires; cleared once visibility leaves
    /// the matching range.
    wait_to_reset: bool,
    handlers: Vec<TriggerHandler>,
    unsubscribe: Vec<Unsubscribe>,
    scheduled: Option<ScheduledTask>,
    /// Bumped whenever a re-check is scheduled so a stale timer can tell
    /// it was superseded.
    schedule_generation: u64,
    initial_scroll_depth: Option<f64>,
}

struct ModelShared {
    id: Uuid,
    spec: VisibilitySpec,
    calc_visibility: CalcVisibility,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn TaskScheduler>,
    /// Serializes sampling and applying so a stale reading can never land
    /// after a newer one. Held while `calc_visibility` runs.
    update_lock: Mutex<()>,
    state: Mutex<ModelState>,
}

enum Outcome {
    Idle,
    Fire(Vec<TriggerHandler>),
    AwaitReport(ReportReadyFactory),
}

/// Visibility trigger for one target.
///
/// The handle is cheap to clone; all clones drive the same state. Every
/// callback (visibility source, trigger handlers, unsubscribe hooks,
/// report-ready factory) runs with the internal lock released.
#[derive(Clone)]
pub struct VisibilityModel {
    inner: Arc<ModelShared>,
}

impl fmt::Debug for VisibilityModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisibilityModel")
            .field("id", &self.inner.id)
            .field("spec", &self.inner.spec)
            .field("trigger", &self.trigger_state())
            .finish()
    }
}

impl VisibilityModel {
    /// Builds a model from a JSON spec on the current tokio runtime.
    pub fn new<F>(spec: &Value, calc_visibility: F) -> Result<Self>
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        let spec = VisibilitySpec::parse(spec)?;
        let scheduler = TokioScheduler::current()?;
        Ok(Self::with_runtime(
            spec,
            calc_visibility,
            Arc::new(RuntimeClock::new()),
            Arc::new(scheduler),
        ))
    }

    pub fn with_runtime<F>(
        spec: VisibilitySpec,
        calc_visibility: F,
        clock: Arc<dyn Clock>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Self
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        let created_time = clock.now_ms();
        let id = Uuid::new_v4();
        log_debug!("visibility model {} created with spec {:?}", id, spec);

        Self {
            inner: Arc::new(ModelShared {
                id,
                spec,
                calc_visibility: Arc::new(calc_visibility),
                clock,
                scheduler,
                update_lock: Mutex::new(()),
                state: Mutex::new(ModelState {
                    counters: VisibilityCounters::new(created_time),
                    trigger: TriggerState::Armed,
                    ready: true,
                    report_ready: true,
                    report_ready_factory: None,
                    wait_to_reset: false,
                    handlers: Vec::new(),
                    unsubscribe: Vec::new(),
                    scheduled: None,
                    schedule_generation: 0,
                    initial_scroll_depth: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn spec(&self) -> &VisibilitySpec {
        &self.inner.spec
    }

    pub fn trigger_state(&self) -> TriggerState {
        self.lock_state().trigger
    }

    pub fn is_fired(&self) -> bool {
        self.trigger_state() == TriggerState::Fired
    }

    pub fn is_disposed(&self) -> bool {
        self.trigger_state() == TriggerState::Disposed
    }

    pub fn has_scheduled_update(&self) -> bool {
        self.lock_state().scheduled.is_some()
    }

    /// Cancels the pending re-check, runs the unsubscribe hooks and drops
    /// every trigger handler. Safe to call repeatedly.
    pub fn dispose(&self) {
        let callbacks = {
            let mut state = self.lock_state();
            if state.trigger != TriggerState::Disposed {
                log_debug!("visibility model {} disposed", self.inner.id);
            }
            state.trigger = TriggerState::Disposed;
            state.scheduled = None;
            state.wait_to_reset = false;
            state.report_ready_factory = None;
            state.handlers.clear();
            std::mem::take(&mut state.unsubscribe)
        };

        for unsubscribe in callbacks {
            unsubscribe();
        }
    }

    /// Disposes unless the trigger repeats.
    pub fn maybe_dispose(&self) {
        if !self.inner.spec.repeat {
            self.dispose();
        }
    }

    pub fn unsubscribe<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.lock_state().unsubscribe.push(Box::new(handler));
    }

    /// Registers a handler for every firing of the trigger. A handler added
    /// while the trigger is already fired runs right away.
    pub fn on_trigger_event<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let handler: TriggerHandler = Arc::new(handler);
        let run_now = {
            let mut state = self.lock_state();
            match state.trigger {
                TriggerState::Disposed => false,
                TriggerState::Armed => {
                    state.handlers.push(handler.clone());
                    false
                }
                TriggerState::Fired => {
                    state.handlers.push(handler.clone());
                    true
                }
            }
        };

        if run_now {
            handler();
        }
    }

    pub fn set_ready(&self, ready: bool) -> Result<()> {
        self.lock_state().ready = ready;
        self.update()
    }

    /// Holds the trigger until the future built by `factory` completes.
    /// The factory runs the first time the conditions are met.
    pub fn set_report_ready<F, Fut>(&self, factory: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.lock_state();
        state.report_ready = false;
        state.report_ready_factory =
            Some(Box::new(move || -> ReadyFuture { Box::pin(factory()) }));
    }

    /// Samples the visibility source (0 while not ready) and folds it in.
    ///
    /// Concurrent callers are serialized from the sample through the state
    /// change, so the visibility source must not call back into the model.
    pub fn update(&self) -> Result<()> {
        let outcome = {
            let _serial = self.lock_update();
            let ready = self.lock_state().ready;
            let visibility = if ready {
                (self.inner.calc_visibility)()
            } else {
                0.0
            };
            self.fold(visibility)?
        };
        self.dispatch(outcome);
        Ok(())
    }

    pub fn update_with(&self, visibility: f64) -> Result<()> {
        let outcome = {
            let _serial = self.lock_update();
            self.fold(visibility)?
        };
        self.dispatch(outcome);
        Ok(())
    }

    fn fold(&self, visibility: f64) -> Result<Outcome> {
        validate_visibility(visibility)?;
        let mut state = self.lock_state();
        self.apply(&mut state, visibility)
    }

    /// Runs the side effects of an update with every lock released.
    fn dispatch(&self, outcome: Outcome) {
        match outcome {
            Outcome::Idle => {}
            Outcome::Fire(handlers) => {
                for handler in handlers {
                    handler();
                }
            }
            Outcome::AwaitReport(factory) => {
                let ready = factory();
                let weak = Arc::downgrade(&self.inner);
                self.inner.scheduler.when_ready(
                    ready,
                    Box::new(move || {
                        if let Some(model) = Self::from_weak(&weak) {
                            model.lock_state().report_ready = true;
                            if let Err(err) = model.update() {
                                log_error!(
                                    "visibility model {} report update failed: {err:?}",
                                    model.inner.id
                                );
                            }
                        }
                    }),
                );
            }
        }
    }

    pub fn get_state(&self, start_time: u64) -> VisibilityState {
        self.lock_state().counters.snapshot(start_time)
    }

    /// Keeps the deepest scroll position reported so far.
    pub fn maybe_set_initial_scroll_depth(&self, depth: f64) {
        let mut state = self.lock_state();
        state.initial_scroll_depth = Some(match state.initial_scroll_depth {
            Some(current) => current.max(depth),
            None => depth,
        });
    }

    pub fn initial_scroll_depth(&self) -> Option<f64> {
        self.lock_state().initial_scroll_depth
    }

    fn apply(&self, state: &mut ModelState, visibility: f64) -> Result<Outcome> {
        let spec = &self.inner.spec;

        if state.trigger == TriggerState::Disposed {
            return Ok(Outcome::Idle);
        }
        if state.wait_to_reset {
            if !spec.matches(visibility) {
                self.reset(state);
            }
            return Ok(Outcome::Idle);
        }
        if state.trigger != TriggerState::Armed {
            return Ok(Outcome::Idle);
        }

        let now = self.inner.clock.now_ms();
        let conditions_met =
            state.counters.update(spec, visibility, now)? || spec.report_when.is_some();

        if conditions_met {
            state.scheduled = None;
            if state.report_ready {
                state.trigger = TriggerState::Fired;
                if spec.repeat {
                    state.wait_to_reset = true;
                    state.counters.continuous_time = 0;
                }
                log_debug!("visibility model {} fired", self.inner.id);
                return Ok(Outcome::Fire(state.handlers.clone()));
            }
            if let Some(factory) = state.report_ready_factory.take() {
                log_debug!("visibility model {} waiting for report", self.inner.id);
                return Ok(Outcome::AwaitReport(factory));
            }
        } else if state.counters.matches_visibility && state.scheduled.is_none() {
            let wait_ms = state.counters.time_to_wait(spec);
            if wait_ms > 0.0 && wait_ms.is_finite() {
                state.schedule_generation += 1;
                let delay = Duration::from_millis(wait_ms.ceil() as u64);
                state.scheduled = Some(self.schedule_update(delay, state.schedule_generation));
                log_debug!("visibility model {} re-checking in {:?}", self.inner.id, delay);
            }
        } else if !state.counters.matches_visibility && state.scheduled.take().is_some() {
            log_debug!("visibility model {} cancelled re-check", self.inner.id);
        }

        Ok(Outcome::Idle)
    }

    fn schedule_update(&self, delay: Duration, generation: u64) -> ScheduledTask {
        let weak = Arc::downgrade(&self.inner);
        self.inner.scheduler.schedule_after(
            delay,
            Box::new(move || {
                let Some(model) = Self::from_weak(&weak) else {
                    return;
                };
                {
                    let mut state = model.lock_state();
                    if state.schedule_generation != generation || state.scheduled.is_none() {
                        return;
                    }
                    state.scheduled = None;
                }
                if let Err(err) = model.update() {
                    log_error!(
                        "visibility model {} scheduled update failed: {err:?}",
                        model.inner.id
                    );
                }
            }),
        )
    }

    /// Re-arms a fired trigger for the next episode.
    fn reset(&self, state: &mut ModelState) {
        if state.trigger != TriggerState::Fired {
            return;
        }
        state.counters.reset();
        state.trigger = TriggerState::Armed;
        state.scheduled = None;
        state.wait_to_reset = false;
        log_debug!("visibility model {} reset for repeat", self.inner.id);
    }

    fn from_weak(weak: &Weak<ModelShared>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn lock_update(&self) -> MutexGuard<'_, ()> {
        match self.inner.update_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ModelState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
