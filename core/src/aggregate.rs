//! Aggregation engine: projects the converged cube onto display buckets.
//!
//! Pure and idempotent: the cube is only read, and iteration order over it
//! is fixed, so identical inputs give bit-identical tables.
//!
//! Steps:
//!   1. Map every fine label to its display bucket at the chosen level.
//!   2. Sum the cube per bucket, per dimension (all genders).
//!   3. Buckets under the dimension threshold fold into `Bucket::Other`.
//!   4. Cross-tabulate nationality×visa, nationality×age, visa×age,
//!      optionally for a single gender.
//!   5. Append `Bucket::Total` row/column and the grand total.
//!   6. Attach a normal-approximation interval to every non-total cell > 0.

use crate::{
    category::{map_age, map_nationality, map_visa},
    cube::{Cube, CubeKey},
    error::{EstimateError, EstimateResult},
    types::{Gender, Granularity},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

// ── Confidence ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    #[serde(rename = "90")]   P90,
    #[serde(rename = "95")]   P95,
    #[serde(rename = "99")]   P99,
    #[serde(rename = "99.5")] P995,
}

impl ConfidenceLevel {
    pub fn z(&self) -> f64 {
        match self {
            Self::P90  => 1.645,
            Self::P95  => 1.96,
            Self::P99  => 2.576,
            Self::P995 => 2.807,
        }
    }

    pub fn percent(&self) -> f64 {
        match self {
            Self::P90  => 90.0,
            Self::P95  => 95.0,
            Self::P99  => 99.0,
            Self::P995 => 99.5,
        }
    }
}

impl FromStr for ConfidenceLevel {
    type Err = EstimateError;

    /// Accepts "95", "95%", or "0.95".
    fn from_str(s: &str) -> EstimateResult<Self> {
        let invalid = || EstimateError::InvalidOption { option: "confidence", value: s.to_string() };
        let value: f64 = s.trim().trim_end_matches('%').parse().map_err(|_| invalid())?;
        let percent = if value <= 1.0 { value * 100.0 } else { value };
        [Self::P90, Self::P95, Self::P99, Self::P995]
            .into_iter()
            .find(|level| (level.percent() - percent).abs() < 1e-9)
            .ok_or_else(invalid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: u64,
    pub upper: u64,
}

/// Poisson-style interval around an estimated count: se = √v, half-width
/// z·se. The lower bound is taken up to the next whole person and floored
/// at zero, the upper bound is rounded. `None` for v ≤ 0.
pub fn confidence_interval(value: f64, level: ConfidenceLevel) -> Option<ConfidenceInterval> {
    if value.is_nan() || value <= 0.0 {
        return None;
    }
    let half_width = level.z() * value.sqrt();
    Some(ConfidenceInterval {
        lower: (value - half_width).ceil().max(0.0) as u64,
        upper: (value + half_width).round() as u64,
    })
}

// ── Parameters ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionParams {
    pub nationality_level:     Granularity,
    pub visa_level:            Granularity,
    pub age_level:             Granularity,
    pub nationality_threshold: u64,
    pub visa_threshold:        u64,
    pub age_threshold:         u64,
    /// `None` sums both genders.
    pub gender:                Option<Gender>,
    /// `None` disables intervals.
    pub confidence:            Option<ConfidenceLevel>,
}

impl Default for ProjectionParams {
    fn default() -> Self {
        Self {
            nationality_level:     Granularity::Fine,
            visa_level:            Granularity::Fine,
            age_level:             Granularity::Medium,
            nationality_threshold: 50,
            visa_threshold:        50,
            age_threshold:         0,
            gender:                None,
            confidence:            Some(ConfidenceLevel::P95),
        }
    }
}

// ── Buckets and tables ───────────────────────────────────────────────────────

/// A display row/column. `Other` and `Total` are synthetic and can never
/// collide with a category that happens to carry the same text, neither as
/// values nor in rendered labels.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Named(String),
    Other,
    Total,
}

impl Bucket {
    pub fn label(&self) -> &str {
        match self {
            Self::Named(s) => s,
            Self::Other    => "Other (below threshold)",
            Self::Total    => "Total",
        }
    }

    pub fn is_total(&self) -> bool {
        matches!(self, Self::Total)
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A 2-D table with a trailing Total row and column.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossTab {
    rows:      Vec<Bucket>,
    cols:      Vec<Bucket>,
    cells:     BTreeMap<(Bucket, Bucket), f64>,
    intervals: BTreeMap<(Bucket, Bucket), ConfidenceInterval>,
}

impl CrossTab {
    fn new(rows: &[Bucket], cols: &[Bucket]) -> Self {
        let mut cells = BTreeMap::new();
        for r in rows {
            for c in cols {
                cells.insert((r.clone(), c.clone()), 0.0);
            }
        }
        let mut rows = rows.to_vec();
        let mut cols = cols.to_vec();
        rows.push(Bucket::Total);
        cols.push(Bucket::Total);
        Self { rows, cols, cells, intervals: BTreeMap::new() }
    }

    fn add(&mut self, row: &Bucket, col: &Bucket, value: f64) {
        *self.cells.entry((row.clone(), col.clone())).or_insert(0.0) += value;
    }

    /// Row, column and grand totals over every non-total row and column,
    /// `Other` included.
    fn close_totals(&mut self) {
        let body_rows: Vec<Bucket> = self.rows.iter().filter(|b| !b.is_total()).cloned().collect();
        let body_cols: Vec<Bucket> = self.cols.iter().filter(|b| !b.is_total()).cloned().collect();

        let mut grand = 0.0;
        for r in &body_rows {
            let row_sum: f64 = body_cols.iter().map(|c| self.get(r, c)).sum();
            self.cells.insert((r.clone(), Bucket::Total), row_sum);
            grand += row_sum;
        }
        for c in &body_cols {
            let col_sum: f64 = body_rows.iter().map(|r| self.get(r, c)).sum();
            self.cells.insert((Bucket::Total, c.clone()), col_sum);
        }
        self.cells.insert((Bucket::Total, Bucket::Total), grand);
    }

    fn attach_intervals(&mut self, level: ConfidenceLevel) {
        self.intervals = self
            .cells
            .iter()
            .filter(|((r, c), _)| !r.is_total() && !c.is_total())
            .filter_map(|(key, v)| confidence_interval(*v, level).map(|ci| (key.clone(), ci)))
            .collect();
    }

    pub fn rows(&self) -> &[Bucket] {
        &self.rows
    }

    pub fn cols(&self) -> &[Bucket] {
        &self.cols
    }

    /// Get-or-zero lookup.
    pub fn get(&self, row: &Bucket, col: &Bucket) -> f64 {
        self.cells
            .get(&(row.clone(), col.clone()))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn interval(&self, row: &Bucket, col: &Bucket) -> Option<ConfidenceInterval> {
        self.intervals.get(&(row.clone(), col.clone())).copied()
    }

    pub fn grand_total(&self) -> f64 {
        self.get(&Bucket::Total, &Bucket::Total)
    }

    /// Dense, serializable rendering of the table.
    pub fn to_view(&self) -> CrossTabView {
        CrossTabView {
            rows:      self.rows.iter().map(|b| b.label().to_string()).collect(),
            cols:      self.cols.iter().map(|b| b.label().to_string()).collect(),
            values:    self
                .rows
                .iter()
                .map(|r| self.cols.iter().map(|c| self.get(r, c)).collect())
                .collect(),
            intervals: self
                .rows
                .iter()
                .map(|r| self.cols.iter().map(|c| self.interval(r, c)).collect())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossTabView {
    pub rows:      Vec<String>,
    pub cols:      Vec<String>,
    pub values:    Vec<Vec<f64>>,
    pub intervals: Vec<Vec<Option<ConfidenceInterval>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    /// Display lists: explicit buckets, then `Other` when anything folded.
    pub nationalities: Vec<Bucket>,
    pub visas:         Vec<Bucket>,
    pub ages:          Vec<Bucket>,
    pub nat_visa:      CrossTab,
    pub nat_age:       CrossTab,
    pub visa_age:      CrossTab,
}

impl Projection {
    pub fn to_view(&self) -> ProjectionView {
        let labels = |buckets: &[Bucket]| buckets.iter().map(|b| b.label().to_string()).collect();
        ProjectionView {
            nationalities: labels(&self.nationalities),
            visas:         labels(&self.visas),
            ages:          labels(&self.ages),
            nat_visa:      self.nat_visa.to_view(),
            nat_age:       self.nat_age.to_view(),
            visa_age:      self.visa_age.to_view(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionView {
    pub nationalities: Vec<String>,
    pub visas:         Vec<String>,
    pub ages:          Vec<String>,
    pub nat_visa:      CrossTabView,
    pub nat_age:       CrossTabView,
    pub visa_age:      CrossTabView,
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Display-bucket assignment for one dimension.
struct DimensionView {
    /// Fine label → display label.
    mapping:  BTreeMap<String, String>,
    /// Display buckets in display order.
    display:  Vec<Bucket>,
    explicit: BTreeSet<String>,
}

impl DimensionView {
    fn build<'a, I>(
        cells: I,
        map: impl Fn(&CubeKey) -> (String, String),
        threshold: u64,
        order_by_value: bool,
    ) -> Self
    where
        I: Iterator<Item = (&'a CubeKey, &'a f64)>,
    {
        let mut mapping = BTreeMap::new();
        let mut totals: BTreeMap<String, f64> = BTreeMap::new();
        for (key, value) in cells {
            let (fine, shown) = map(key);
            *totals.entry(shown.clone()).or_insert(0.0) += *value;
            mapping.insert(fine, shown);
        }

        let threshold = threshold as f64;
        let mut kept: Vec<(&String, f64)> = totals
            .iter()
            .filter(|(_, v)| **v >= threshold)
            .map(|(k, v)| (k, *v))
            .collect();
        if order_by_value {
            kept.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        }
        let folded = totals.values().any(|v| *v < threshold);

        let explicit: BTreeSet<String> = kept.iter().map(|(k, _)| (*k).clone()).collect();
        let mut display: Vec<Bucket> = kept.into_iter().map(|(k, _)| Bucket::Named(k.clone())).collect();
        if folded {
            display.push(Bucket::Other);
        }
        Self { mapping, display, explicit }
    }

    fn bucket(&self, fine: &str) -> Bucket {
        match self.mapping.get(fine) {
            Some(shown) if self.explicit.contains(shown) => Bucket::Named(shown.clone()),
            _ => Bucket::Other,
        }
    }
}

pub fn project(cube: &Cube, params: &ProjectionParams) -> Projection {
    let nat = DimensionView::build(
        cube.iter(),
        |k| (k.nationality.clone(), map_nationality(&k.nationality, params.nationality_level)),
        params.nationality_threshold,
        true,
    );
    let visa = DimensionView::build(
        cube.iter(),
        |k| (k.visa.clone(), map_visa(&k.visa, params.visa_level)),
        params.visa_threshold,
        true,
    );
    let age = DimensionView::build(
        cube.iter(),
        |k| (k.age.label().to_string(), map_age(k.age, params.age_level)),
        params.age_threshold,
        false,
    );

    let mut nat_visa = CrossTab::new(&nat.display, &visa.display);
    let mut nat_age = CrossTab::new(&nat.display, &age.display);
    let mut visa_age = CrossTab::new(&visa.display, &age.display);

    for (key, value) in cube.iter() {
        if params.gender.is_some_and(|g| g != key.gender) {
            continue;
        }
        let n = nat.bucket(&key.nationality);
        let v = visa.bucket(&key.visa);
        let a = age.bucket(key.age.label());
        nat_visa.add(&n, &v, *value);
        nat_age.add(&n, &a, *value);
        visa_age.add(&v, &a, *value);
    }

    for table in [&mut nat_visa, &mut nat_age, &mut visa_age] {
        table.close_totals();
        if let Some(level) = params.confidence {
            table.attach_intervals(level);
        }
    }

    Projection {
        nationalities: nat.display,
        visas: visa.display,
        ages: age.display,
        nat_visa,
        nat_age,
        visa_age,
    }
}

/// Male and female totals of the cube.
pub fn gender_split(cube: &Cube) -> BTreeMap<Gender, f64> {
    Gender::ALL.iter().map(|g| (*g, cube.gender_total(*g))).collect()
}
