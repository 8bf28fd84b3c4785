use crate::{
    aggregate::ProjectionParams,
    error::EstimateResult,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SolverConfig {
    /// Pass budget for auto-run. There is no early stop unless
    /// `stop_on_convergence` is set.
    pub max_passes: u32,
    /// Pause between auto-run passes so intermediate states can be observed.
    pub pass_delay_ms: u64,
    /// Number of trailing error samples retained.
    pub history_window: usize,
    pub convergence_tolerance_percent: f64,
    pub stop_on_convergence: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_passes: 100,
            pass_delay_ms: 30,
            history_window: 50,
            convergence_tolerance_percent: 0.0,
            stop_on_convergence: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SeedConfig {
    pub use_prior_seed: bool,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self { use_prior_seed: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MarginalConfig {
    /// Male share used to synthesise gender targets when no gender totals
    /// were reported. Female gets the remainder.
    pub default_male_share: f64,
}

impl Default for MarginalConfig {
    fn default() -> Self {
        Self { default_male_share: 0.52 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub display:  ProjectionParams,
    pub solver:   SolverConfig,
    pub seed:     SeedConfig,
    pub marginal: MarginalConfig,
}

impl EngineConfig {
    /// Load from a JSON file. Missing sections fall back to defaults.
    /// In tests, use EngineConfig::default_test().
    pub fn load(path: impl AsRef<Path>) -> EstimateResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        log::debug!("config loaded from {}", path.as_ref().display());
        Ok(config)
    }

    /// Defaults with no pause between auto-run passes.
    pub fn default_test() -> Self {
        let mut config = Self::default();
        config.solver.pass_delay_ms = 0;
        config
    }
}
