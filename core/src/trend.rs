//! Population trend across periods for one region.

use crate::{
    record::RecordStore,
    types::{DimensionKind, Period},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub period: Period,
    pub total:  u64,
}

/// Total population per period, oldest first. The total is the largest
/// aggregate/aggregate row of the period; without one, the visa detail
/// rows are summed instead.
pub fn population_trend(store: &RecordStore, region: &str) -> Vec<TrendPoint> {
    let mut periods = store.available_periods();
    periods.reverse();

    periods
        .into_iter()
        .filter(|p| store.has_selection(p, region))
        .map(|period| {
            let reported = store
                .for_selection(&period, region)
                .filter(|r| r.is_aggregate_row && r.is_gender_aggregate())
                .map(|r| r.count)
                .max()
                .unwrap_or(0);
            let total = if reported > 0 {
                reported
            } else {
                store
                    .for_selection(&period, region)
                    .filter(|r| r.dimension == DimensionKind::Visa && r.is_detail())
                    .fold(0u64, |acc, r| acc.saturating_add(r.count))
            };
            TrendPoint { period, total }
        })
        .collect()
}
