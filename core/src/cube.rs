//! The 4-way sparse estimate table.
//!
//! Keys are structured tuples, never concatenated strings, so labels may
//! contain any character. A `BTreeMap` keeps iteration order stable, which
//! makes every sum over the cube reproducible bit for bit.

use crate::{category::AgeBand, types::Gender};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CubeKey {
    pub nationality: String,
    pub visa:        String,
    pub age:         AgeBand,
    pub gender:      Gender,
}

impl CubeKey {
    pub fn new(nationality: &str, visa: &str, age: AgeBand, gender: Gender) -> Self {
        Self {
            nationality: nationality.to_string(),
            visa:        visa.to_string(),
            age,
            gender,
        }
    }

    pub fn nationality(&self) -> &str {
        &self.nationality
    }

    pub fn visa(&self) -> &str {
        &self.visa
    }

    pub fn age(&self) -> &AgeBand {
        &self.age
    }

    pub fn gender(&self) -> &Gender {
        &self.gender
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cube {
    cells: BTreeMap<CubeKey, f64>,
}

impl Cube {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: CubeKey, value: f64) {
        self.cells.insert(key, value);
    }

    /// Get-or-zero lookup.
    pub fn get(&self, key: &CubeKey) -> f64 {
        self.cells.get(key).copied().unwrap_or(0.0)
    }

    pub fn contains(&self, key: &CubeKey) -> bool {
        self.cells.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CubeKey, &f64)> {
        self.cells.iter()
    }

    /// Values may be rescaled in place; keys are fixed for the life of the cube.
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (&CubeKey, &mut f64)> {
        self.cells.iter_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = &CubeKey> {
        self.cells.keys()
    }

    pub fn total(&self) -> f64 {
        self.cells.values().sum()
    }

    pub fn gender_total(&self, gender: Gender) -> f64 {
        self.cells
            .iter()
            .filter(|(k, _)| k.gender == gender)
            .map(|(_, v)| *v)
            .sum()
    }

    /// Flat cell listing for serialization; JSON maps cannot carry tuple keys.
    pub fn cells(&self) -> Vec<CubeCell> {
        self.cells
            .iter()
            .map(|(key, value)| CubeCell { key: key.clone(), value: *value })
            .collect()
    }

    /// True when every cell is finite and non-negative.
    pub fn is_well_formed(&self) -> bool {
        self.cells.values().all(|v| v.is_finite() && *v >= 0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CubeCell {
    #[serde(flatten)]
    pub key:   CubeKey,
    pub value: f64,
}
