//! The estimation engine: owns the record store and the solving pipeline.
//!
//! PIPELINE (fixed order):
//!   1. Marginal builder: on ingestion or selection change
//!   2. Seed constructor: on ingestion, selection change, or prior-seed toggle
//!   3. IPF solver: one pass per step(), or a bounded auto_run()
//!   4. Aggregation: on demand, read-only over the current cube
//!
//! RULES:
//!   - A reseed replaces the whole solver (cube, pass counter, history) at once.
//!   - Projection never mutates the cube.
//!   - Nothing here fails; missing data degrades the quality report instead.

use crate::{
    aggregate::{self, Projection, ProjectionParams},
    config::EngineConfig,
    cube::Cube,
    event::EngineEvent,
    marginal::{MarginalBuilder, MarginalSet, QualityReport},
    record::{ClassifiedRecord, RecordStore},
    seed::{HistoricalPrior, RuleTable, SeedConstructor},
    solver::{AutoRunOutcome, ErrorHistory, IpfSolver, RunFlag, SolverPhase},
    trend::{population_trend, TrendPoint},
    types::{Gender, Period, Region},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub period: Period,
    pub region: Region,
}

pub struct EstimationEngine {
    pub config:     EngineConfig,
    records:        RecordStore,
    selection:      Option<Selection>,
    /// Set once `select` is called; until then the selection follows the data.
    pinned:         bool,
    use_prior_seed: bool,
    builder:        MarginalBuilder,
    seeder:         SeedConstructor,
    marginals:      MarginalSet,
    report:         Option<QualityReport>,
    solver:         IpfSolver,
}

impl EstimationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_rules(config, RuleTable::default())
    }

    /// Build an engine with a custom seed rule table.
    pub fn with_rules(config: EngineConfig, rules: RuleTable) -> Self {
        Self {
            records:        RecordStore::new(),
            selection:      None,
            pinned:         false,
            use_prior_seed: config.seed.use_prior_seed,
            builder:        MarginalBuilder::new(config.marginal.clone()),
            seeder:         SeedConstructor::new(rules),
            marginals:      MarginalSet::default(),
            report:         None,
            solver:         IpfSolver::new(Cube::new(), MarginalSet::default(), config.solver.clone()),
            config,
        }
    }

    // ── Inputs ─────────────────────────────────────────────────────

    /// Append a batch of records. Until a selection is made explicitly, the
    /// engine selects the most recent period and the first region of the
    /// whole store, so the default does not depend on batch order.
    pub fn ingest<I>(&mut self, batch: I) -> Vec<EngineEvent>
    where
        I: IntoIterator<Item = ClassifiedRecord>,
    {
        let added = self.records.append(batch);
        let mut events = vec![EngineEvent::RecordsIngested {
            added,
            total: self.records.len(),
        }];
        log::info!("ingested {added} records ({} total)", self.records.len());

        if !self.pinned {
            if let Some(default) = self.default_selection() {
                if self.selection.as_ref() != Some(&default) {
                    events.push(EngineEvent::SelectionChanged {
                        period: default.period.clone(),
                        region: default.region.clone(),
                    });
                    self.selection = Some(default);
                }
            }
        }

        if added > 0 {
            events.extend(self.rebuild());
        }
        events
    }

    /// Select a (period, region). Unknown values yield empty marginals.
    pub fn select(&mut self, period: &str, region: &str) -> Vec<EngineEvent> {
        let selection = Selection { period: period.to_string(), region: region.to_string() };
        let mut events = vec![EngineEvent::SelectionChanged {
            period: selection.period.clone(),
            region: selection.region.clone(),
        }];
        self.selection = Some(selection);
        self.pinned = true;
        events.extend(self.rebuild());
        events
    }

    /// Toggle blending with the prior period. Reseeds only when the value changes.
    pub fn set_use_prior_seed(&mut self, enabled: bool) -> Vec<EngineEvent> {
        if self.use_prior_seed == enabled {
            return Vec::new();
        }
        self.use_prior_seed = enabled;
        vec![self.reseed()]
    }

    // ── Solving ────────────────────────────────────────────────────

    pub fn step(&mut self) -> EngineEvent {
        let sample = self.solver.step();
        EngineEvent::PassCompleted { sample }
    }

    /// Bounded auto-run. `on_event` receives every pass as it completes,
    /// then the final outcome.
    pub fn auto_run<F>(&mut self, flag: &RunFlag, mut on_event: F) -> AutoRunOutcome
    where
        F: FnMut(&EngineEvent),
    {
        let outcome = self.solver.auto_run(flag, |sample| {
            on_event(&EngineEvent::PassCompleted { sample: *sample });
        });
        on_event(&EngineEvent::AutoRunFinished { outcome });
        outcome
    }

    // ── Outputs ────────────────────────────────────────────────────

    pub fn project(&self, params: &ProjectionParams) -> Projection {
        aggregate::project(self.solver.cube(), params)
    }

    /// Projection with the configured display parameters.
    pub fn project_default(&self) -> Projection {
        self.project(&self.config.display)
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    pub fn use_prior_seed(&self) -> bool {
        self.use_prior_seed
    }

    pub fn marginals(&self) -> &MarginalSet {
        &self.marginals
    }

    pub fn report(&self) -> Option<&QualityReport> {
        self.report.as_ref()
    }

    pub fn cube(&self) -> &Cube {
        self.solver.cube()
    }

    pub fn history(&self) -> &ErrorHistory {
        self.solver.history()
    }

    pub fn passes(&self) -> u32 {
        self.solver.passes()
    }

    pub fn phase(&self) -> SolverPhase {
        self.solver.phase()
    }

    pub fn available_periods(&self) -> Vec<Period> {
        self.records.available_periods()
    }

    pub fn available_regions(&self) -> Vec<Region> {
        self.records.available_regions()
    }

    /// Population per period for the selected region.
    pub fn trend(&self) -> Vec<TrendPoint> {
        match &self.selection {
            Some(sel) => population_trend(&self.records, &sel.region),
            None => Vec::new(),
        }
    }

    pub fn gender_split(&self) -> BTreeMap<Gender, f64> {
        aggregate::gender_split(self.solver.cube())
    }

    // ── Internals ──────────────────────────────────────────────────

    fn default_selection(&self) -> Option<Selection> {
        let period = self.records.available_periods().into_iter().next()?;
        let region = self.records.available_regions().into_iter().next()?;
        Some(Selection { period, region })
    }

    fn rebuild(&mut self) -> Vec<EngineEvent> {
        let Some(sel) = self.selection.clone() else {
            return Vec::new();
        };
        let (marginals, report) = self.builder.build(&self.records, &sel.period, &sel.region);
        let rebuilt = EngineEvent::MarginalsRebuilt {
            anchor: report.anchor,
            status: report.status,
            discrepancy_rate_percent: report.discrepancy_rate_percent,
        };
        self.marginals = marginals;
        self.report = Some(report);
        vec![rebuilt, self.reseed()]
    }

    fn reseed(&mut self) -> EngineEvent {
        let prior_key = self
            .report
            .as_ref()
            .and_then(|r| r.prior_period_key.clone())
            .filter(|_| self.use_prior_seed);

        let prior = match (&prior_key, &self.selection) {
            (Some(period), Some(sel)) => HistoricalPrior::from_store(&self.records, period, &sel.region),
            _ => None,
        };

        let cube = self.seeder.build(&self.marginals, prior.as_ref());
        let cells = cube.len();
        self.solver = IpfSolver::new(cube, self.marginals.clone(), self.config.solver.clone());

        let prior_period = prior.and(prior_key);
        log::debug!("reseeded: {cells} cells, prior={prior_period:?}");
        EngineEvent::Reseeded { cells, prior_period }
    }
}
