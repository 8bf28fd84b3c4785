//! Events emitted by the estimation engine.
//!
//! The engine returns these from every state-changing call; the runner
//! streams them to its client and they are logged as they happen.

use crate::{
    marginal::QualityStatus,
    solver::{AutoRunOutcome, ErrorSample},
    types::{Period, Region},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RecordsIngested {
        added: usize,
        total: usize,
    },
    SelectionChanged {
        period: Period,
        region: Region,
    },
    MarginalsRebuilt {
        anchor: u64,
        status: QualityStatus,
        discrepancy_rate_percent: f64,
    },
    /// The cube was replaced wholesale; pass counter and history restart.
    Reseeded {
        cells: usize,
        prior_period: Option<Period>,
    },
    PassCompleted {
        sample: ErrorSample,
    },
    AutoRunFinished {
        outcome: AutoRunOutcome,
    },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RecordsIngested { .. }  => "records_ingested",
            Self::SelectionChanged { .. } => "selection_changed",
            Self::MarginalsRebuilt { .. } => "marginals_rebuilt",
            Self::Reseeded { .. }         => "reseeded",
            Self::PassCompleted { .. }    => "pass_completed",
            Self::AutoRunFinished { .. }  => "auto_run_finished",
        }
    }
}
