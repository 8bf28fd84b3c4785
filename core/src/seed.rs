//! Seed constructor: the starting 4-way table the IPF solver reshapes.
//!
//! Weight of one cell, in order:
//!   1. baseline 1.0 × every matching `RuleScope::Cell` multiplier
//!   2. blended with the prior period's independence-product probability
//!      when one is available and positive
//!   3. × every matching `RuleScope::Gender` multiplier
//!   4. + LAPLACE_SMOOTHING, so no cell is ever zero
//!
//! Rules match on medium-level groups; storage stays at fine level.

use crate::{
    category::{is_marriage_visa, AgeBand, Generation, NationalityGroup, VisaGroup},
    cube::{Cube, CubeKey},
    marginal::{DetailTallies, MarginalSet},
    record::RecordStore,
    types::Gender,
};
use std::collections::BTreeMap;
use std::fmt;

/// Weight kept from the heuristic when history is available.
pub const HEURISTIC_SHARE: f64 = 0.3;
/// Weight given to the prior period's probability.
pub const HISTORY_SHARE: f64 = 0.7;
/// Brings probabilities to the magnitude of heuristic weights.
pub const HISTORY_SCALE: f64 = 10_000.0;
pub const LAPLACE_SMOOTHING: f64 = 0.1;

// ── Rule table ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    /// Applies to the (nationality, visa, age) weight before history blending.
    Cell,
    /// Applies per gender after blending.
    Gender,
}

/// What a rule gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub nationality: NationalityGroup,
    pub visa:        VisaGroup,
    pub visa_label:  &'a str,
    pub generation:  Generation,
    /// `None` while evaluating `RuleScope::Cell` rules.
    pub gender:      Option<Gender>,
}

#[derive(Clone, Copy)]
pub struct WeightRule {
    pub name:       &'static str,
    pub scope:      RuleScope,
    pub multiplier: f64,
    pub applies:    fn(&RuleContext<'_>) -> bool,
}

impl fmt::Debug for WeightRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeightRule")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("multiplier", &self.multiplier)
            .finish_non_exhaustive()
    }
}

fn unskilled_from_southeast_or_central_asia(ctx: &RuleContext<'_>) -> bool {
    ctx.visa == VisaGroup::UnskilledLabor
        && matches!(ctx.nationality, NationalityGroup::SoutheastAsia | NationalityGroup::CentralAsia)
}

fn unskilled_prime_working_age(ctx: &RuleContext<'_>) -> bool {
    ctx.visa == VisaGroup::UnskilledLabor
        && matches!(ctx.generation, Generation::Twenties | Generation::Thirties)
}

fn student_in_twenties(ctx: &RuleContext<'_>) -> bool {
    ctx.visa == VisaGroup::Student && ctx.generation == Generation::Twenties
}

fn compatriot_residency(ctx: &RuleContext<'_>) -> bool {
    ctx.visa == VisaGroup::Residency
        && matches!(ctx.nationality, NationalityGroup::GreaterChina | NationalityGroup::CentralAsia)
}

fn unskilled_male(ctx: &RuleContext<'_>) -> bool {
    ctx.visa == VisaGroup::UnskilledLabor && ctx.gender == Some(Gender::Male)
}

fn marriage_migrant_female(ctx: &RuleContext<'_>) -> bool {
    is_marriage_visa(ctx.visa_label) && ctx.gender == Some(Gender::Female)
}

pub const DEFAULT_RULES: [WeightRule; 6] = [
    WeightRule {
        name:       "unskilled_southeast_central_asia",
        scope:      RuleScope::Cell,
        multiplier: 5.0,
        applies:    unskilled_from_southeast_or_central_asia,
    },
    WeightRule {
        name:       "unskilled_prime_working_age",
        scope:      RuleScope::Cell,
        multiplier: 4.0,
        applies:    unskilled_prime_working_age,
    },
    WeightRule {
        name:       "student_twenties",
        scope:      RuleScope::Cell,
        multiplier: 10.0,
        applies:    student_in_twenties,
    },
    WeightRule {
        name:       "compatriot_residency",
        scope:      RuleScope::Cell,
        multiplier: 5.0,
        applies:    compatriot_residency,
    },
    WeightRule {
        name:       "unskilled_male",
        scope:      RuleScope::Gender,
        multiplier: 2.0,
        applies:    unskilled_male,
    },
    WeightRule {
        name:       "marriage_migrant_female",
        scope:      RuleScope::Gender,
        multiplier: 6.0,
        applies:    marriage_migrant_female,
    },
];

/// Ordered rule set. Multipliers of all matching rules in a scope compound.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<WeightRule>,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self { rules: DEFAULT_RULES.to_vec() }
    }
}

impl RuleTable {
    pub fn new(rules: Vec<WeightRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[WeightRule] {
        &self.rules
    }

    pub fn multiplier(&self, scope: RuleScope, ctx: &RuleContext<'_>) -> f64 {
        self.rules
            .iter()
            .filter(|r| r.scope == scope && (r.applies)(ctx))
            .map(|r| r.multiplier)
            .product()
    }

    /// Names of the rules that fire for `ctx` in `scope`, in table order.
    pub fn matching(&self, scope: RuleScope, ctx: &RuleContext<'_>) -> Vec<&'static str> {
        self.rules
            .iter()
            .filter(|r| r.scope == scope && (r.applies)(ctx))
            .map(|r| r.name)
            .collect()
    }
}

// ── Historical prior ─────────────────────────────────────────────────────────

/// Prior-period joint probability under an independence assumption:
/// P(n, v, a) ≈ P(n) · P(v) · P(a), each share taken over the prior
/// period's nationality total.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoricalPrior {
    nationality: BTreeMap<String, f64>,
    visa:        BTreeMap<String, f64>,
    age:         BTreeMap<AgeBand, f64>,
}

impl HistoricalPrior {
    /// Returns `None` when the period has no nationality detail for the region.
    pub fn from_store(store: &RecordStore, period: &str, region: &str) -> Option<Self> {
        let tallies = DetailTallies::from_records(store.for_selection(period, region));
        let total = tallies.sum_nationality();
        if total == 0 {
            return None;
        }
        let total = total as f64;
        let share = |count: &u64| *count as f64 / total;
        Some(Self {
            nationality: tallies.nationality.iter().map(|(k, c)| (k.clone(), share(c))).collect(),
            visa:        tallies.visa.iter().map(|(k, c)| (k.clone(), share(c))).collect(),
            age:         tallies.age.iter().map(|(k, c)| (*k, share(c))).collect(),
        })
    }

    pub fn probability(&self, nationality: &str, visa: &str, age: AgeBand) -> f64 {
        let p_n = self.nationality.get(nationality).copied().unwrap_or(0.0);
        let p_v = self.visa.get(visa).copied().unwrap_or(0.0);
        let p_a = self.age.get(&age).copied().unwrap_or(0.0);
        p_n * p_v * p_a
    }
}

// ── Constructor ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SeedConstructor {
    rules: RuleTable,
}

impl SeedConstructor {
    pub fn new(rules: RuleTable) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// One cell per nationality × visa × fine age band × gender.
    pub fn build(&self, marginals: &MarginalSet, prior: Option<&HistoricalPrior>) -> Cube {
        let mut cube = Cube::new();
        for nationality in marginals.nationalities() {
            for visa in marginals.visas() {
                for age in AgeBand::ALL {
                    for gender in Gender::ALL {
                        let weight = self.cell_weight(nationality, visa, age, gender, prior);
                        cube.insert(CubeKey::new(nationality, visa, age, gender), weight);
                    }
                }
            }
        }
        log::debug!(
            "seed built: {} cells, prior={}",
            cube.len(),
            if prior.is_some() { "blended" } else { "heuristic" }
        );
        cube
    }

    pub fn cell_weight(
        &self,
        nationality: &str,
        visa: &str,
        age: AgeBand,
        gender: Gender,
        prior: Option<&HistoricalPrior>,
    ) -> f64 {
        let mut ctx = RuleContext {
            nationality: NationalityGroup::of(nationality),
            visa:        VisaGroup::of(visa),
            visa_label:  visa,
            generation:  age.generation(),
            gender:      None,
        };

        let mut weight = self.rules.multiplier(RuleScope::Cell, &ctx);

        if let Some(prior) = prior {
            let probability = prior.probability(nationality, visa, age);
            if probability > 0.0 {
                weight = HEURISTIC_SHARE * weight + HISTORY_SHARE * probability * HISTORY_SCALE;
            }
        }

        ctx.gender = Some(gender);
        weight * self.rules.multiplier(RuleScope::Gender, &ctx) + LAPLACE_SMOOTHING
    }
}
