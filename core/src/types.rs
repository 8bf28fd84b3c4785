//! Shared primitive types used across the entire estimation pipeline.

use crate::error::{EstimateError, EstimateResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A reporting period label, e.g. "2023". Numeric periods have a predecessor.
pub type Period = String;

/// A reporting region label (district, county, ...).
pub type Region = String;

/// The three categorical dimensions that source files report marginals for.
/// Gender is carried on every record instead of being a dimension of its own.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    Nationality,
    Visa,
    Age,
}

impl DimensionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Nationality => "nationality",
            Self::Visa        => "visa",
            Self::Age         => "age",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub const ALL: [Gender; 2] = [Gender::Male, Gender::Female];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Male   => "male",
            Self::Female => "female",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Gender {
    type Err = EstimateError;

    fn from_str(s: &str) -> EstimateResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "male" | "m"   => Ok(Self::Male),
            "female" | "f" => Ok(Self::Female),
            _ => Err(EstimateError::InvalidOption { option: "gender", value: s.to_string() }),
        }
    }
}

/// Display granularity. Estimation always happens at `Fine`; coarser levels
/// only exist for projection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[default]
    Fine,
    Medium,
    Coarse,
}

impl FromStr for Granularity {
    type Err = EstimateError;

    fn from_str(s: &str) -> EstimateResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fine" | "small"   => Ok(Self::Fine),
            "medium"           => Ok(Self::Medium),
            "coarse" | "large" => Ok(Self::Coarse),
            _ => Err(EstimateError::InvalidOption { option: "granularity", value: s.to_string() }),
        }
    }
}

/// The period immediately preceding `period`, if it is numeric.
pub fn prior_period(period: &str) -> Option<Period> {
    period
        .trim()
        .parse::<i64>()
        .ok()
        .map(|p| (p - 1).to_string())
}
