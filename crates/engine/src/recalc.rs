//! Recalculation scheduler: the outer loop deciding when to run a full
//! cycle, a delta cycle, or sleep.
//!
//! The loop keeps four deadlines — eligible-for-delta-from, delta-required-
//! by, eligible-for-full-from, full-required-by — recomputed from the view
//! definition's periods after every cycle. A full cycle also refreshes the
//! delta windows, since a full result subsumes a delta. Live-data
//! notifications wake the loop early only when doing so could plausibly
//! shorten the wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cycle::ComputationCycle;
use crate::error::EngineError;
use crate::resources::{ResourceManager, ResourceRetainer};
use crate::view::ViewDefinition;

/// Flag-plus-notify pair raised by a live market-data subscription.
#[derive(Debug, Default)]
pub struct LiveDataSignal {
    changed: AtomicBool,
    notify: Notify,
}

impl LiveDataSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the market-data subscription when underlying data changed.
    pub fn market_data_changed(&self) {
        self.changed.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.changed.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.changed.store(false, Ordering::Relaxed);
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// The four scheduling deadlines.
#[derive(Debug, Clone, Copy)]
pub struct CycleDeadlines {
    pub delta_from: Instant,
    pub delta_by: Instant,
    pub full_from: Instant,
    pub full_by: Instant,
}

impl CycleDeadlines {
    /// Startup state: everything due immediately, forcing an initial full
    /// cycle.
    pub fn startup(now: Instant) -> Self {
        Self {
            delta_from: now,
            delta_by: now,
            full_from: now,
            full_by: now,
        }
    }

    /// Deadlines after a full cycle: both windows refresh.
    pub fn after_full(now: Instant, view: &ViewDefinition) -> Self {
        Self {
            delta_from: now + view.min_delta_period,
            delta_by: now + view.max_delta_period,
            full_from: now + view.min_full_period,
            full_by: now + view.max_full_period,
        }
    }

    /// Deadlines after a delta cycle: only the delta window refreshes.
    pub fn after_delta(&self, now: Instant, view: &ViewDefinition) -> Self {
        Self {
            delta_from: now + view.min_delta_period,
            delta_by: now + view.max_delta_period,
            ..*self
        }
    }
}

/// What the scheduler should do this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleTrigger {
    Full,
    Delta,
    Sleep(Duration),
}

/// Pure scheduling decision over the current deadlines.
///
/// Order: force full when overdue or the successive-delta cap is hit;
/// force delta when overdue or running flat out; upgrade a live-data
/// change to full, else delta, when eligible; otherwise sleep until the
/// nearer actionable deadline.
pub fn decide(
    now: Instant,
    deadlines: &CycleDeadlines,
    live_data: bool,
    successive_deltas: usize,
    view: &ViewDefinition,
) -> CycleTrigger {
    if now >= deadlines.full_by || successive_deltas >= view.max_successive_deltas {
        return CycleTrigger::Full;
    }
    if now >= deadlines.delta_by || view.run_as_fast_as_possible {
        return CycleTrigger::Delta;
    }
    if live_data {
        if now >= deadlines.full_from {
            return CycleTrigger::Full;
        }
        if now >= deadlines.delta_from {
            return CycleTrigger::Delta;
        }
    }
    let wake = if live_data {
        // Data arrived but is not actionable yet: wake at eligibility.
        deadlines.delta_from.min(deadlines.full_from)
    } else {
        deadlines.delta_by.min(deadlines.full_by)
    };
    CycleTrigger::Sleep(wake.saturating_duration_since(now))
}

/// Kind of cycle the scheduler asks the driver to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    Full,
    Delta,
}

/// The engine facade the scheduler drives: creates a cycle, executes it
/// (against `previous` for deltas), registers it with the resource
/// manager, and returns its id.
#[async_trait]
pub trait CycleDriver: Send + Sync {
    async fn run_cycle(
        &self,
        kind: CycleKind,
        previous: Option<Arc<ComputationCycle>>,
    ) -> Result<Uuid, EngineError>;
}

/// The recalculation loop for one view.
pub struct RecalculationScheduler {
    view: Arc<ViewDefinition>,
    driver: Arc<dyn CycleDriver>,
    manager: Arc<ResourceManager<ComputationCycle>>,
    live_data: Arc<LiveDataSignal>,
    retainer: ResourceRetainer<ComputationCycle>,
    stop: AtomicBool,
    stopped: Notify,
}

impl RecalculationScheduler {
    pub fn new(
        view: Arc<ViewDefinition>,
        driver: Arc<dyn CycleDriver>,
        manager: Arc<ResourceManager<ComputationCycle>>,
    ) -> Self {
        Self {
            view,
            driver,
            manager,
            live_data: Arc::new(LiveDataSignal::new()),
            retainer: ResourceRetainer::new(),
            stop: AtomicBool::new(false),
            stopped: Notify::new(),
        }
    }

    /// The signal a market-data subscription should raise on changes.
    pub fn live_data(&self) -> Arc<LiveDataSignal> {
        Arc::clone(&self.live_data)
    }

    /// Id of the most recent successfully-executed cycle.
    pub fn latest_cycle(&self) -> Option<Uuid> {
        self.retainer.retained_id()
    }

    /// Ask the loop to terminate; it releases the retained cycle on exit.
    pub fn terminate(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.stopped.notify_waiters();
    }

    /// Run the loop until terminated.
    pub async fn run(&self) {
        info!(view = %self.view.name, "recalculation loop starting");
        let mut deadlines = CycleDeadlines::startup(Instant::now());
        let mut successive_deltas = 0usize;

        while !self.stop.load(Ordering::Relaxed) {
            let now = Instant::now();
            let live = self.live_data.is_set();

            match decide(now, &deadlines, live, successive_deltas, &self.view) {
                CycleTrigger::Full => {
                    debug!(view = %self.view.name, "running full cycle");
                    match self.driver.run_cycle(CycleKind::Full, None).await {
                        Ok(id) => {
                            if !self.retainer.retain(&self.manager, id) {
                                warn!(cycle = %id, "executed cycle already released");
                            }
                            self.live_data.clear();
                            successive_deltas = 0;
                        }
                        Err(e) => warn!(view = %self.view.name, error = %e, "full cycle failed"),
                    }
                    // Refreshed even after a failure so the loop cannot spin.
                    deadlines = CycleDeadlines::after_full(Instant::now(), &self.view);
                }
                CycleTrigger::Delta => {
                    debug!(view = %self.view.name, "running delta cycle");
                    let previous = self.retainer.resource();
                    match self.driver.run_cycle(CycleKind::Delta, previous).await {
                        Ok(id) => {
                            if !self.retainer.retain(&self.manager, id) {
                                warn!(cycle = %id, "executed cycle already released");
                            }
                            self.live_data.clear();
                            successive_deltas += 1;
                        }
                        Err(e) => warn!(view = %self.view.name, error = %e, "delta cycle failed"),
                    }
                    deadlines = deadlines.after_delta(Instant::now(), &self.view);
                }
                CycleTrigger::Sleep(duration) => {
                    // Register the stop waiter before re-checking the flag
                    // so a terminate() between the two cannot be missed.
                    let stopped = self.stopped.notified();
                    tokio::pin!(stopped);
                    if self.stop.load(Ordering::Relaxed) {
                        break;
                    }
                    // A live-data notification only helps if an eligibility
                    // deadline falls before the sleep would end anyway.
                    let eligibility = deadlines.delta_from.min(deadlines.full_from);
                    let wake_early = !live && eligibility < now + duration;
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = self.live_data.notified(), if wake_early => {
                            debug!(view = %self.view.name, "woken by live data change");
                        }
                        _ = &mut stopped => {}
                    }
                }
            }
        }

        // Termination releases the most recent cycle reference.
        self.retainer.release();
        self.live_data.clear();
        info!(view = %self.view.name, "recalculation loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::CalculationConfiguration;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn view() -> ViewDefinition {
        let mut view = ViewDefinition::new("v", vec![CalculationConfiguration::new("Default")]);
        view.min_delta_period = Duration::from_secs(1);
        view.max_delta_period = Duration::from_secs(10);
        view.min_full_period = Duration::from_secs(30);
        view.max_full_period = Duration::from_secs(120);
        view.max_successive_deltas = 5;
        view
    }

    #[test]
    fn startup_forces_full() {
        let now = Instant::now();
        let deadlines = CycleDeadlines::startup(now);
        assert_eq!(decide(now, &deadlines, false, 0, &view()), CycleTrigger::Full);
    }

    #[test]
    fn overdue_delta_forces_delta() {
        let view = view();
        let base = Instant::now();
        let deadlines = CycleDeadlines::after_full(base, &view);
        let now = base + Duration::from_secs(11);
        assert_eq!(decide(now, &deadlines, false, 0, &view), CycleTrigger::Delta);
    }

    #[test]
    fn successive_delta_cap_forces_full() {
        let view = view();
        let base = Instant::now();
        let deadlines = CycleDeadlines::after_full(base, &view);
        assert_eq!(decide(base, &deadlines, false, 5, &view), CycleTrigger::Full);
    }

    #[test]
    fn run_as_fast_as_possible_always_deltas() {
        let mut view = view();
        view.run_as_fast_as_possible = true;
        let base = Instant::now();
        let deadlines = CycleDeadlines::after_full(base, &view);
        assert_eq!(decide(base, &deadlines, false, 0, &view), CycleTrigger::Delta);
    }

    #[test]
    fn live_data_upgrades_when_eligible() {
        let view = view();
        let base = Instant::now();
        let deadlines = CycleDeadlines::after_full(base, &view);

        // Inside the delta eligibility window: delta.
        let now = base + Duration::from_secs(2);
        assert_eq!(decide(now, &deadlines, true, 0, &view), CycleTrigger::Delta);

        // Past full eligibility: upgrade to full.
        let now = base + Duration::from_secs(31);
        assert_eq!(decide(now, &deadlines, true, 0, &view), CycleTrigger::Full);
    }

    #[test]
    fn live_data_not_actionable_sleeps_to_eligibility() {
        let view = view();
        let base = Instant::now();
        let deadlines = CycleDeadlines::after_full(base, &view);

        // Data changed immediately after the cycle: sleep to delta_from,
        // not delta_by.
        match decide(base, &deadlines, true, 0, &view) {
            CycleTrigger::Sleep(duration) => {
                assert!(duration <= Duration::from_secs(1));
                assert!(duration > Duration::from_millis(500));
            }
            other => panic!("expected sleep, got {other:?}"),
        }
    }

    #[test]
    fn idle_sleeps_to_required_by() {
        let view = view();
        let base = Instant::now();
        let deadlines = CycleDeadlines::after_full(base, &view);

        match decide(base, &deadlines, false, 0, &view) {
            CycleTrigger::Sleep(duration) => {
                // Nearer required-by is the delta deadline at +10s.
                assert!(duration <= Duration::from_secs(10));
                assert!(duration > Duration::from_secs(9));
            }
            other => panic!("expected sleep, got {other:?}"),
        }
    }

    #[test]
    fn full_refreshes_delta_window() {
        let view = view();
        let base = Instant::now();
        let after = CycleDeadlines::after_full(base, &view);
        assert_eq!(after.delta_from, base + view.min_delta_period);
        assert_eq!(after.full_by, base + view.max_full_period);

        let later = base + Duration::from_secs(5);
        let after_delta = after.after_delta(later, &view);
        assert_eq!(after_delta.delta_from, later + view.min_delta_period);
        // Full window untouched by a delta.
        assert_eq!(after_delta.full_by, after.full_by);
    }

    /// Driver that records the kinds it was asked to run and registers a
    /// fresh cycle for each.
    struct RecordingDriver {
        manager: Arc<ResourceManager<ComputationCycle>>,
        kinds: Mutex<Vec<CycleKind>>,
    }

    #[async_trait]
    impl CycleDriver for RecordingDriver {
        async fn run_cycle(
            &self,
            kind: CycleKind,
            _previous: Option<Arc<ComputationCycle>>,
        ) -> Result<Uuid, EngineError> {
            self.kinds.lock().unwrap().push(kind);
            let cycle = Arc::new(ComputationCycle::new(
                Arc::new(ViewDefinition::new("v", vec![])),
                HashMap::new(),
            ));
            let id = cycle.id();
            // Leak the initial reference on purpose: the manager keeps the
            // cycle live for the retainer to reference.
            std::mem::forget(self.manager.insert(id, cycle));
            Ok(id)
        }
    }

    #[tokio::test]
    async fn loop_runs_initial_full_then_terminates() {
        let manager = ResourceManager::new();
        let driver = Arc::new(RecordingDriver {
            manager: Arc::clone(&manager),
            kinds: Mutex::new(Vec::new()),
        });
        let mut v = view();
        // Long periods so the loop sleeps after the first full.
        v.min_delta_period = Duration::from_secs(60);
        v.max_delta_period = Duration::from_secs(600);

        let scheduler = Arc::new(RecalculationScheduler::new(
            Arc::new(v),
            driver.clone(),
            manager,
        ));
        let runner = Arc::clone(&scheduler);
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(driver.kinds.lock().unwrap().as_slice(), &[CycleKind::Full]);
        assert!(scheduler.latest_cycle().is_some());

        scheduler.terminate();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop should stop promptly")
            .unwrap();
        assert!(scheduler.latest_cycle().is_none());
    }
}
