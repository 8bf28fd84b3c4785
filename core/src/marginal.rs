//! Marginal builder: turns one (period, region) slice of the record store
//! into anchor-normalised target marginals plus a data-quality report.
//!
//! Design:
//!   - Anchor = the single largest aggregate/aggregate row. Overlapping files
//!     re-report the same total, so summing totals would inflate the population.
//!   - No aggregate row → anchor falls back to the largest dimension sum.
//!   - Every dimension is rescaled to the anchor (rounded per category).
//!   - Gender comes from gender-specific total rows (max per gender); when
//!     absent, a configurable default split of the anchor is synthesised.
//!   - Never fails. Missing data yields zero vectors and a degraded status.

use crate::{
    category::AgeBand,
    config::MarginalConfig,
    record::{ClassifiedRecord, RecordStore},
    types::{prior_period, DimensionKind, Gender, Period},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Public types ─────────────────────────────────────────────────────────────

/// Target marginals for one selection. Category counts in every dimension
/// sum to `anchor` up to per-category rounding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarginalSet {
    pub anchor:      u64,
    pub nationality: BTreeMap<String, u64>,
    pub visa:        BTreeMap<String, u64>,
    pub age:         BTreeMap<AgeBand, u64>,
    pub gender:      BTreeMap<Gender, u64>,
}

impl MarginalSet {
    pub fn nationalities(&self) -> impl Iterator<Item = &str> {
        self.nationality.keys().map(String::as_str)
    }

    pub fn visas(&self) -> impl Iterator<Item = &str> {
        self.visa.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSums {
    pub nationality: u64,
    pub visa:        u64,
    pub age:         u64,
    pub gender:      u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityStatus {
    Clean,
    Warning,
    Error,
}

impl QualityStatus {
    pub fn from_rate(discrepancy_rate_percent: f64) -> Self {
        if discrepancy_rate_percent == 0.0 {
            Self::Clean
        } else if discrepancy_rate_percent < 1.0 {
            Self::Warning
        } else {
            Self::Error
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub raw_sums:                 RawSums,
    pub anchor:                   u64,
    pub max_absolute_diff:        u64,
    pub discrepancy_rate_percent: f64,
    pub status:                   QualityStatus,
    pub prior_period_available:   bool,
    pub prior_period_key:         Option<Period>,
    /// Dimensions with no detail rows at all for the selection.
    pub missing_dimensions:       Vec<DimensionKind>,
    /// Age rows whose label carried no parsable age.
    pub skipped_age_rows:         usize,
}

// ── Detail tallies ───────────────────────────────────────────────────────────

/// Per-category sums of detail rows (non-aggregate, gender-aggregate).
/// Every non-aggregate label seen in the slice is present, possibly at zero.
#[derive(Debug, Clone, Default)]
pub(crate) struct DetailTallies {
    pub nationality:      BTreeMap<String, u64>,
    pub visa:             BTreeMap<String, u64>,
    pub age:              BTreeMap<AgeBand, u64>,
    pub skipped_age_rows: usize,
}

impl DetailTallies {
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a ClassifiedRecord>,
    {
        let mut tallies = Self {
            age: AgeBand::ALL.iter().map(|a| (*a, 0)).collect(),
            ..Self::default()
        };

        for r in records {
            if r.is_aggregate_row {
                continue;
            }
            let count = if r.is_gender_aggregate() { r.count } else { 0 };
            match r.dimension {
                DimensionKind::Nationality => {
                    add_to(tallies.nationality.entry(r.category_label.clone()).or_default(), count);
                }
                DimensionKind::Visa => {
                    add_to(tallies.visa.entry(r.category_label.clone()).or_default(), count);
                }
                DimensionKind::Age => match AgeBand::parse(&r.category_label) {
                    Some(band) => add_to(tallies.age.entry(band).or_default(), count),
                    None => {
                        if r.is_gender_aggregate() {
                            tallies.skipped_age_rows += 1;
                        }
                    }
                },
            }
        }
        tallies
    }

    pub fn sum_nationality(&self) -> u64 {
        saturating_sum(self.nationality.values())
    }

    pub fn sum_visa(&self) -> u64 {
        saturating_sum(self.visa.values())
    }

    pub fn sum_age(&self) -> u64 {
        saturating_sum(self.age.values())
    }
}

/// Counts are unbounded input; sums clamp at `u64::MAX` instead of overflowing.
fn add_to(slot: &mut u64, count: u64) {
    *slot = slot.saturating_add(count);
}

fn saturating_sum<'a>(values: impl IntoIterator<Item = &'a u64>) -> u64 {
    values.into_iter().fold(0, |acc, v| acc.saturating_add(*v))
}

// ── Builder ──────────────────────────────────────────────────────────────────

pub struct MarginalBuilder {
    config: MarginalConfig,
}

impl MarginalBuilder {
    pub fn new(config: MarginalConfig) -> Self {
        Self { config }
    }

    pub fn build(
        &self,
        store: &RecordStore,
        period: &str,
        region: &str,
    ) -> (MarginalSet, QualityReport) {
        let selected: Vec<&ClassifiedRecord> = store.for_selection(period, region).collect();

        let reported_total = Self::smart_anchor(&selected);
        let tallies = DetailTallies::from_records(selected.iter().copied());
        let (gender_totals, has_gender_totals) = Self::gender_totals(&selected);

        let sum_nat = tallies.sum_nationality();
        let sum_visa = tallies.sum_visa();
        let sum_age = tallies.sum_age();
        let sum_gender = saturating_sum(gender_totals.values());

        let anchor = if reported_total > 0 {
            reported_total
        } else {
            sum_nat.max(sum_visa).max(sum_age)
        };

        let DetailTallies { mut nationality, mut visa, mut age, skipped_age_rows } = tallies;
        let mut gender = gender_totals;

        if anchor > 0 {
            rescale(&mut nationality, sum_nat, anchor);
            rescale(&mut visa, sum_visa, anchor);
            rescale(&mut age, sum_age, anchor);

            if !has_gender_totals || sum_gender == 0 {
                let male_share = self.config.default_male_share.clamp(0.0, 1.0);
                gender.insert(Gender::Male, (anchor as f64 * male_share).round() as u64);
                gender.insert(Gender::Female, (anchor as f64 * (1.0 - male_share)).round() as u64);
            } else {
                rescale(&mut gender, sum_gender, anchor);
            }
        }

        let raw_sums = RawSums {
            nationality: sum_nat,
            visa:        sum_visa,
            age:         sum_age,
            gender:      sum_gender,
        };

        let prior_key = prior_period(period).filter(|p| store.has_selection(p, region));

        let report = Self::assess(raw_sums, anchor, prior_key, skipped_age_rows);

        if skipped_age_rows > 0 {
            log::warn!(
                "{period}/{region}: {skipped_age_rows} age rows without a parsable age were skipped"
            );
        }
        if report.status == QualityStatus::Error {
            log::warn!(
                "{period}/{region}: marginal discrepancy {:.2}% (anchor={anchor}, sums={:?})",
                report.discrepancy_rate_percent,
                raw_sums
            );
        }
        log::debug!(
            "{period}/{region}: anchor={anchor} nat={} visa={} status={:?}",
            nationality.len(),
            visa.len(),
            report.status
        );

        let marginals = MarginalSet { anchor, nationality, visa, age, gender };
        (marginals, report)
    }

    /// Largest single aggregate/aggregate row, or 0 when none was reported.
    fn smart_anchor(records: &[&ClassifiedRecord]) -> u64 {
        records
            .iter()
            .filter(|r| r.is_aggregate_row && r.is_gender_aggregate())
            .map(|r| r.count)
            .max()
            .unwrap_or(0)
    }

    /// Per-gender maximum over gender-specific total rows. Both genders are
    /// always present in the returned map.
    fn gender_totals(records: &[&ClassifiedRecord]) -> (BTreeMap<Gender, u64>, bool) {
        let mut totals: BTreeMap<Gender, u64> = Gender::ALL.iter().map(|g| (*g, 0)).collect();
        let mut any_positive = false;
        for r in records.iter().filter(|r| r.is_aggregate_row) {
            if let Some(g) = r.gender {
                let slot = totals.entry(g).or_default();
                *slot = (*slot).max(r.count);
                any_positive |= r.count > 0;
            }
        }
        (totals, any_positive)
    }

    fn assess(
        raw_sums: RawSums,
        anchor: u64,
        prior_period_key: Option<Period>,
        skipped_age_rows: usize,
    ) -> QualityReport {
        let mut sums = vec![raw_sums.nationality, raw_sums.visa, raw_sums.age];
        if raw_sums.gender > 0 {
            sums.push(raw_sums.gender);
        }
        let max_sum = sums.iter().copied().max().unwrap_or(0);
        let min_nonzero = sums.iter().copied().filter(|s| *s > 0).min().unwrap_or(max_sum);
        let max_absolute_diff = max_sum - min_nonzero;
        let discrepancy_rate_percent = if max_sum > 0 {
            max_absolute_diff as f64 / max_sum as f64 * 100.0
        } else {
            0.0
        };

        let missing_dimensions: Vec<DimensionKind> = [
            (DimensionKind::Nationality, raw_sums.nationality),
            (DimensionKind::Visa, raw_sums.visa),
            (DimensionKind::Age, raw_sums.age),
        ]
        .into_iter()
        .filter(|(_, sum)| *sum == 0)
        .map(|(dim, _)| dim)
        .collect();

        let mut status = QualityStatus::from_rate(discrepancy_rate_percent);
        if anchor == 0 {
            status = QualityStatus::Error;
        } else if !missing_dimensions.is_empty() {
            status = status.max(QualityStatus::Warning);
        }

        QualityReport {
            raw_sums,
            anchor,
            max_absolute_diff,
            discrepancy_rate_percent,
            status,
            prior_period_available: prior_period_key.is_some(),
            prior_period_key,
            missing_dimensions,
            skipped_age_rows,
        }
    }
}

/// Scale every count by `target / current`, rounding per entry.
/// A zero `current` leaves the map untouched.
fn rescale<K: Ord>(counts: &mut BTreeMap<K, u64>, current: u64, target: u64) {
    if current == 0 {
        return;
    }
    let ratio = target as f64 / current as f64;
    for v in counts.values_mut() {
        *v = (*v as f64 * ratio).round() as u64;
    }
}
