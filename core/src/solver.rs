//! Iterative proportional fitting over the 4-way cube.
//!
//! SWEEP ORDER (fixed, never reordered): nationality, visa, age, gender.
//!
//! RULES:
//!   - The solver never loops on its own; a driver calls step() or auto_run().
//!   - A pass only rescales existing cells. Keys are never added or removed.
//!   - Categories with a zero target or zero current sum are skipped.
//!   - Error for a pass = Σ|current − target| over all sweeps / anchor × 100.

use crate::{
    config::SolverConfig,
    cube::{Cube, CubeKey},
    marginal::MarginalSet,
};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorSample {
    pub iteration:     u32,
    pub error_percent: f64,
}

/// Bounded trailing window of error samples.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorHistory {
    window:  usize,
    samples: VecDeque<ErrorSample>,
}

impl ErrorHistory {
    pub fn new(window: usize) -> Self {
        Self { window, samples: VecDeque::with_capacity(window) }
    }

    pub fn push(&mut self, sample: ErrorSample) {
        if self.window == 0 {
            return;
        }
        while self.samples.len() >= self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn latest(&self) -> Option<&ErrorSample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ErrorSample> {
        self.samples.iter()
    }

    pub fn to_vec(&self) -> Vec<ErrorSample> {
        self.samples.iter().copied().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverPhase {
    Idle,
    Running,
    Converged,
    Capped,
    Stopped,
}

/// Shared running flag for auto-run. Clearing it stops the run after the
/// pass in flight completes.
#[derive(Debug, Clone, Default)]
pub struct RunFlag(Arc<AtomicBool>);

impl RunFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Sleep for `delay`, waking early once the flag is cleared.
fn pause(flag: &RunFlag, delay: Duration) {
    const SLICE: Duration = Duration::from_millis(10);
    let deadline = Instant::now() + delay;
    while flag.is_running() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(SLICE.min(deadline - now));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutoRunOutcome {
    pub passes:     u32,
    pub phase:      SolverPhase,
    pub last_error: Option<f64>,
}

pub struct IpfSolver {
    config:  SolverConfig,
    cube:    Cube,
    targets: MarginalSet,
    passes:  u32,
    history: ErrorHistory,
    phase:   SolverPhase,
}

impl IpfSolver {
    pub fn new(cube: Cube, targets: MarginalSet, config: SolverConfig) -> Self {
        Self {
            history: ErrorHistory::new(config.history_window),
            config,
            cube,
            targets,
            passes: 0,
            phase: SolverPhase::Idle,
        }
    }

    pub fn cube(&self) -> &Cube {
        &self.cube
    }

    pub fn targets(&self) -> &MarginalSet {
        &self.targets
    }

    pub fn passes(&self) -> u32 {
        self.passes
    }

    pub fn history(&self) -> &ErrorHistory {
        &self.history
    }

    pub fn phase(&self) -> SolverPhase {
        self.phase
    }

    /// One complete pass: four sweeps in the fixed order.
    pub fn step(&mut self) -> ErrorSample {
        let sample = self.run_pass();
        if self.phase != SolverPhase::Running {
            self.phase = if self.within_tolerance(&sample) {
                SolverPhase::Converged
            } else {
                SolverPhase::Idle
            };
        }
        sample
    }

    /// Bounded auto-run. Restarts the pass counter and error history (the
    /// cube keeps its current state), then performs up to `max_passes`
    /// passes, pausing `pass_delay_ms` between them. `observer` sees every
    /// sample as it completes and may stop the run through `flag`.
    pub fn auto_run<F>(&mut self, flag: &RunFlag, mut observer: F) -> AutoRunOutcome
    where
        F: FnMut(&ErrorSample),
    {
        self.passes = 0;
        self.history.clear();
        self.phase = SolverPhase::Running;
        flag.start();

        let delay = Duration::from_millis(self.config.pass_delay_ms);
        let mut last: Option<ErrorSample> = None;

        while self.passes < self.config.max_passes {
            if !flag.is_running() {
                self.phase = SolverPhase::Stopped;
                break;
            }
            let sample = self.run_pass();
            observer(&sample);
            last = Some(sample);

            if self.config.stop_on_convergence && self.within_tolerance(&sample) {
                self.phase = SolverPhase::Converged;
                break;
            }
            if !delay.is_zero() && self.passes < self.config.max_passes {
                pause(flag, delay);
            }
        }

        if self.phase == SolverPhase::Running {
            self.phase = match last {
                Some(s) if self.within_tolerance(&s) => SolverPhase::Converged,
                _ => SolverPhase::Capped,
            };
        }
        flag.stop();

        let outcome = AutoRunOutcome {
            passes:     self.passes,
            phase:      self.phase,
            last_error: last.map(|s| s.error_percent),
        };
        log::info!(
            "auto-run finished: passes={} phase={:?} error={:?}",
            outcome.passes,
            outcome.phase,
            outcome.last_error
        );
        outcome
    }

    fn within_tolerance(&self, sample: &ErrorSample) -> bool {
        sample.error_percent <= self.config.convergence_tolerance_percent
    }

    fn run_pass(&mut self) -> ErrorSample {
        let nationality = sweep(&mut self.cube, &self.targets.nationality, CubeKey::nationality);
        let visa = sweep(&mut self.cube, &self.targets.visa, CubeKey::visa);
        let age = sweep(&mut self.cube, &self.targets.age, CubeKey::age);
        let gender = sweep(&mut self.cube, &self.targets.gender, CubeKey::gender);

        let total_abs_error = nationality + visa + age + gender;
        let error_percent = if self.targets.anchor > 0 {
            total_abs_error / self.targets.anchor as f64 * 100.0
        } else {
            0.0
        };

        self.passes += 1;
        let sample = ErrorSample { iteration: self.passes, error_percent };
        self.history.push(sample);

        log::debug!(
            "pass={} error={error_percent:.4}% (nat={nationality:.1} visa={visa:.1} age={age:.1} gender={gender:.1})",
            self.passes
        );
        sample
    }
}

/// Rescale every slice of `cube` along one dimension so its sum matches the
/// target for that slice's category. Returns the summed absolute deviation
/// observed before rescaling.
///
/// Slices of one dimension are disjoint, so all current sums are gathered
/// in a single pass before any cell is touched.
pub fn sweep<T, Q, F>(cube: &mut Cube, targets: &BTreeMap<T, u64>, component: F) -> f64
where
    T: Borrow<Q> + Ord,
    Q: Ord + ?Sized,
    F: Fn(&CubeKey) -> &Q,
{
    let mut sums: BTreeMap<&T, (f64, f64)> = BTreeMap::new();
    for (key, value) in cube.iter() {
        if let Some((label, target)) = targets.get_key_value(component(key)) {
            sums.entry(label).or_insert((*target as f64, 0.0)).1 += *value;
        }
    }

    let mut abs_error = 0.0;
    let mut ratios: BTreeMap<&T, f64> = BTreeMap::new();
    for (label, (target, current)) in sums {
        if target <= 0.0 || current == 0.0 {
            continue;
        }
        abs_error += (current - target).abs();
        let ratio = target / current;
        if ratio != 1.0 {
            ratios.insert(label, ratio);
        }
    }

    if !ratios.is_empty() {
        for (key, value) in cube.iter_mut() {
            if let Some((label, _)) = targets.get_key_value(component(key)) {
                if let Some(ratio) = ratios.get(&label) {
                    *value *= ratio;
                }
            }
        }
    }
    abs_error
}
