//! Classified input records and the append-only record store.
//!
//! RULE: records are immutable once ingested. The store only grows, and no
//! derived output may depend on the order batches arrived in.

use crate::{
    error::{EstimateError, EstimateResult},
    types::{DimensionKind, Gender, Period, Region},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Labels that mark a reported total or subtotal rather than a leaf category.
const AGGREGATE_MARKERS: &[&str] = &["합계", "소계", "총계", "계", "전체"];
const AGGREGATE_MARKERS_LATIN: &[&str] = &["total", "subtotal", "all"];

/// One reported row, already extracted from whatever tabular source it came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassifiedRecord {
    pub period:          Period,
    pub region:          Region,
    pub dimension:       DimensionKind,
    pub category_label:  String,
    /// `None` is the gender aggregate (both genders together). On the wire
    /// it is `"aggregate"`; `null` or a missing field are read the same way.
    #[serde(default, with = "gender_field")]
    pub gender:          Option<Gender>,
    pub count:           u64,
    pub is_aggregate_row: bool,
}

impl ClassifiedRecord {
    pub fn is_gender_aggregate(&self) -> bool {
        self.gender.is_none()
    }

    /// A leaf row reported for both genders together; the input to the
    /// per-dimension marginals.
    pub fn is_detail(&self) -> bool {
        !self.is_aggregate_row && self.gender.is_none()
    }

    pub fn matches(&self, period: &str, region: &str) -> bool {
        self.period == period && self.region == region
    }
}

/// A row as handed over by the tabular reader, before classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub period:      Period,
    pub region:      Region,
    pub dimension:   DimensionKind,
    pub label:       String,
    #[serde(default)]
    pub gender_text: Option<String>,
    pub count_text:  String,
}

impl RawRecord {
    pub fn classify(&self) -> EstimateResult<ClassifiedRecord> {
        let label = self.label.trim().to_string();
        Ok(ClassifiedRecord {
            period:           self.period.trim().to_string(),
            region:           self.region.trim().to_string(),
            dimension:        self.dimension,
            is_aggregate_row: is_aggregate_label(&label),
            gender:           self.gender_text.as_deref().and_then(classify_gender),
            count:            parse_count(&label, &self.count_text)?,
            category_label:   label,
        })
    }
}

mod gender_field {
    use crate::types::Gender;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    enum Wire {
        Male,
        Female,
        Aggregate,
    }

    pub fn serialize<S: Serializer>(gender: &Option<Gender>, s: S) -> Result<S::Ok, S::Error> {
        let wire = match gender {
            Some(Gender::Male)   => Wire::Male,
            Some(Gender::Female) => Wire::Female,
            None                 => Wire::Aggregate,
        };
        wire.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Gender>, D::Error> {
        Ok(match Option::<Wire>::deserialize(d)? {
            Some(Wire::Male)   => Some(Gender::Male),
            Some(Wire::Female) => Some(Gender::Female),
            Some(Wire::Aggregate) | None => None,
        })
    }
}

pub fn is_aggregate_label(label: &str) -> bool {
    let trimmed = label.trim();
    AGGREGATE_MARKERS.contains(&trimmed)
        || AGGREGATE_MARKERS_LATIN
            .iter()
            .any(|m| trimmed.eq_ignore_ascii_case(m))
}

/// Map free-form gender text to a gender; anything unrecognised is the aggregate.
pub fn classify_gender(text: &str) -> Option<Gender> {
    let lowered = text.trim().to_lowercase();
    if lowered == "male" || lowered == "m" || text.contains('남') {
        Some(Gender::Male)
    } else if lowered == "female" || lowered == "f" || text.contains('여') {
        Some(Gender::Female)
    } else {
        None
    }
}

fn parse_count(label: &str, text: &str) -> EstimateResult<u64> {
    text.replace(',', "")
        .trim()
        .parse::<u64>()
        .map_err(|_| EstimateError::InvalidCount {
            label: label.to_string(),
            value: text.to_string(),
        })
}

/// One entry of a batch file: either already classified, or raw text
/// still to be classified.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RecordInput {
    Classified(ClassifiedRecord),
    Raw(RawRecord),
}

impl RecordInput {
    pub fn into_classified(self) -> EstimateResult<ClassifiedRecord> {
        match self {
            Self::Classified(rec) => Ok(rec),
            Self::Raw(raw) => raw.classify(),
        }
    }
}

/// Read a JSON array of records from `path`. Raw entries are classified on
/// the way in; a malformed count rejects the whole batch.
pub fn load_batch(path: impl AsRef<Path>) -> EstimateResult<Vec<ClassifiedRecord>> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let inputs: Vec<RecordInput> = serde_json::from_str(&content)?;
    let batch = inputs
        .into_iter()
        .map(RecordInput::into_classified)
        .collect::<EstimateResult<Vec<_>>>()?;
    log::debug!("{} records read from {}", batch.len(), path.as_ref().display());
    Ok(batch)
}

/// The accumulated record multiset.
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    records: Vec<ClassifiedRecord>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append<I>(&mut self, batch: I) -> usize
    where
        I: IntoIterator<Item = ClassifiedRecord>,
    {
        let before = self.records.len();
        self.records.extend(batch);
        self.records.len() - before
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn all(&self) -> &[ClassifiedRecord] {
        &self.records
    }

    pub fn for_selection<'a>(
        &'a self,
        period: &'a str,
        region: &'a str,
    ) -> impl Iterator<Item = &'a ClassifiedRecord> + 'a {
        self.records.iter().filter(move |r| r.matches(period, region))
    }

    pub fn has_selection(&self, period: &str, region: &str) -> bool {
        self.records.iter().any(|r| r.matches(period, region))
    }

    /// Distinct periods, most recent first.
    pub fn available_periods(&self) -> Vec<Period> {
        let set: BTreeSet<&Period> = self.records.iter().map(|r| &r.period).collect();
        set.into_iter().rev().cloned().collect()
    }

    /// Distinct regions, ascending.
    pub fn available_regions(&self) -> Vec<Region> {
        let set: BTreeSet<&Region> = self.records.iter().map(|r| &r.region).collect();
        set.into_iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(label: &str, gender: Option<&str>, count: &str) -> RawRecord {
        RawRecord {
            period:      "2023".into(),
            region:      " Ansan ".into(),
            dimension:   DimensionKind::Nationality,
            label:       label.into(),
            gender_text: gender.map(str::to_string),
            count_text:  count.into(),
        }
    }

    #[test]
    fn aggregate_markers_are_detected() {
        for label in ["합계", "소계", "계", "Total", "SUBTOTAL", " all "] {
            assert!(is_aggregate_label(label), "{label} should be an aggregate marker");
        }
        assert!(!is_aggregate_label("베트남"));
        assert!(!is_aggregate_label("Totality"));
    }

    #[test]
    fn gender_text_classification() {
        assert_eq!(classify_gender("남자"), Some(Gender::Male));
        assert_eq!(classify_gender("Male"), Some(Gender::Male));
        assert_eq!(classify_gender("여"), Some(Gender::Female));
        assert_eq!(classify_gender("female"), Some(Gender::Female));
        assert_eq!(classify_gender("계"), None);
        assert_eq!(classify_gender(""), None);
    }

    #[test]
    fn classify_strips_separators_and_whitespace() {
        let rec = raw(" 베트남 ", Some("남"), "1,234").classify().unwrap();
        assert_eq!(rec.category_label, "베트남");
        assert_eq!(rec.region, "Ansan");
        assert_eq!(rec.count, 1234);
        assert_eq!(rec.gender, Some(Gender::Male));
        assert!(!rec.is_aggregate_row);
    }

    #[test]
    fn classify_rejects_non_numeric_counts() {
        let err = raw("베트남", None, "-").classify().unwrap_err();
        assert!(matches!(err, EstimateError::InvalidCount { .. }));
    }

    #[test]
    fn store_lists_periods_descending_and_regions_ascending() {
        let mut store = RecordStore::new();
        let mut a = raw("합계", None, "10").classify().unwrap();
        a.period = "2021".into();
        a.region = "B".into();
        let mut b = a.clone();
        b.period = "2023".into();
        b.region = "A".into();
        store.append(vec![a, b]);
        assert_eq!(store.available_periods(), vec!["2023".to_string(), "2021".to_string()]);
        assert_eq!(store.available_regions(), vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn batch_entries_may_be_raw_or_classified() {
        let json = r#"[
            { "period": "2023", "region": "A", "dimension": "visa",
              "category_label": "E-9", "count": 40, "is_aggregate_row": false },
            { "period": "2023", "region": "A", "dimension": "visa",
              "label": "합계", "gender_text": "계", "count_text": "1,000" }
        ]"#;
        let inputs: Vec<RecordInput> = serde_json::from_str(json).unwrap();
        let batch: Vec<ClassifiedRecord> = inputs
            .into_iter()
            .map(|i| i.into_classified().unwrap())
            .collect();
        assert_eq!(batch[0].count, 40);
        assert!(batch[0].is_detail());
        assert_eq!(batch[1].count, 1000);
        assert!(batch[1].is_aggregate_row);
        assert!(batch[1].is_gender_aggregate());
    }

    #[test]
    fn gender_reads_and_writes_all_three_values() {
        for (text, gender) in [
            ("male", Some(Gender::Male)),
            ("female", Some(Gender::Female)),
            ("aggregate", None),
        ] {
            let json = format!(
                r#"{{ "period": "2023", "region": "A", "dimension": "age",
                     "category_label": "20-24세", "gender": "{text}",
                     "count": 7, "is_aggregate_row": false }}"#
            );
            let input: RecordInput = serde_json::from_str(&json).unwrap();
            let rec = input.into_classified().unwrap();
            assert_eq!(rec.gender, gender);

            let written = serde_json::to_value(&rec).unwrap();
            assert_eq!(written["gender"], text);
            let back: ClassifiedRecord = serde_json::from_value(written).unwrap();
            assert_eq!(back, rec);
        }

        let json = r#"{ "period": "2023", "region": "A", "dimension": "age",
                        "category_label": "20-24세", "gender": null,
                        "count": 7, "is_aggregate_row": false }"#;
        let rec: ClassifiedRecord = serde_json::from_str(json).unwrap();
        assert!(rec.is_gender_aggregate());
    }
}
