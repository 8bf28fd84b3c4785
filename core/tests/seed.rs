//! Seed constructor: rule multipliers, history blending, smoothing.

use popcube_core::{
    category::AgeBand,
    marginal::MarginalSet,
    record::{is_aggregate_label, ClassifiedRecord, RecordStore},
    seed::{
        HistoricalPrior, RuleContext, RuleScope, RuleTable, SeedConstructor, WeightRule,
        LAPLACE_SMOOTHING,
    },
    types::{DimensionKind, Gender},
};
use std::collections::BTreeMap;

fn marginals(nationalities: &[&str], visas: &[&str]) -> MarginalSet {
    MarginalSet {
        anchor:      100,
        nationality: nationalities.iter().map(|n| (n.to_string(), 10)).collect(),
        visa:        visas.iter().map(|v| (v.to_string(), 10)).collect(),
        age:         AgeBand::ALL.iter().map(|a| (*a, 1)).collect(),
        gender:      BTreeMap::from([(Gender::Male, 50), (Gender::Female, 50)]),
    }
}

fn rec(period: &str, dimension: DimensionKind, label: &str, count: u64) -> ClassifiedRecord {
    ClassifiedRecord {
        period:           period.into(),
        region:           "Ansan".into(),
        dimension,
        category_label:   label.into(),
        gender:           None,
        count,
        is_aggregate_row: is_aggregate_label(label),
    }
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[test]
fn seed_covers_every_combination() {
    let seed = SeedConstructor::default();
    let m = marginals(&["베트남", "중국", "미국"], &["E-9", "D-2"]);
    let cube = seed.build(&m, None);
    assert_eq!(cube.len(), 3 * 2 * AgeBand::ALL.len() * 2);
    assert!(cube.iter().all(|(_, v)| *v >= LAPLACE_SMOOTHING));
}

#[test]
fn empty_marginals_give_an_empty_seed() {
    let cube = SeedConstructor::default().build(&MarginalSet::default(), None);
    assert!(cube.is_empty());
}

#[test]
fn baseline_cell_is_one_plus_smoothing() {
    let seed = SeedConstructor::default();
    let w = seed.cell_weight("미국", "E-7", AgeBand::Age40To44, Gender::Male, None);
    assert!(close(w, 1.1));
}

#[test]
fn unskilled_southeast_asian_rules_compound() {
    let seed = SeedConstructor::default();
    // 5 (region) × 4 (prime age) × 2 (male) + 0.1
    let male = seed.cell_weight("베트남", "E-9", AgeBand::Age25To29, Gender::Male, None);
    assert!(close(male, 40.1));
    let female = seed.cell_weight("베트남", "E-9", AgeBand::Age25To29, Gender::Female, None);
    assert!(close(female, 20.1));
    // Outside prime working age only the region rule fires.
    let older = seed.cell_weight("베트남", "E-9", AgeBand::Age50To54, Gender::Female, None);
    assert!(close(older, 5.1));
}

#[test]
fn student_and_compatriot_rules() {
    let seed = SeedConstructor::default();
    let student = seed.cell_weight("미국", "유학(D-2)", AgeBand::Age20To24, Gender::Female, None);
    assert!(close(student, 10.1));
    let compatriot = seed.cell_weight("한국계 중국인", "F-4", AgeBand::Age40To44, Gender::Female, None);
    assert!(close(compatriot, 5.1));
    let not_compatriot = seed.cell_weight("베트남", "F-4", AgeBand::Age40To44, Gender::Female, None);
    assert!(close(not_compatriot, 1.1));
}

#[test]
fn marriage_migrant_rule_matches_raw_visa_label() {
    let seed = SeedConstructor::default();
    let female = seed.cell_weight("베트남", "결혼이민(F-6)", AgeBand::Age30To34, Gender::Female, None);
    assert!(close(female, 6.1));
    let male = seed.cell_weight("베트남", "결혼이민(F-6)", AgeBand::Age30To34, Gender::Male, None);
    assert!(close(male, 1.1));
}

#[test]
fn matching_lists_rule_names_in_table_order() {
    let table = RuleTable::default();
    let ctx = RuleContext {
        nationality: popcube_core::category::NationalityGroup::SoutheastAsia,
        visa:        popcube_core::category::VisaGroup::UnskilledLabor,
        visa_label:  "E-9",
        generation:  popcube_core::category::Generation::Twenties,
        gender:      Some(Gender::Male),
    };
    assert_eq!(
        table.matching(RuleScope::Cell, &ctx),
        vec!["unskilled_southeast_central_asia", "unskilled_prime_working_age"]
    );
    assert_eq!(table.matching(RuleScope::Gender, &ctx), vec!["unskilled_male"]);
}

#[test]
fn custom_rule_tables_replace_the_defaults() {
    fn everyone(_: &RuleContext<'_>) -> bool {
        true
    }
    let table = RuleTable::new(vec![WeightRule {
        name:       "flat",
        scope:      RuleScope::Cell,
        multiplier: 3.0,
        applies:    everyone,
    }]);
    let seed = SeedConstructor::new(table);
    let w = seed.cell_weight("베트남", "E-9", AgeBand::Age25To29, Gender::Male, None);
    assert!(close(w, 3.1));
}

#[test]
fn prior_probability_is_product_of_shares() {
    let mut store = RecordStore::new();
    store.append(vec![
        rec("2022", DimensionKind::Nationality, "베트남", 80),
        rec("2022", DimensionKind::Nationality, "미국", 20),
        rec("2022", DimensionKind::Visa, "E-9", 60),
        rec("2022", DimensionKind::Visa, "D-2", 40),
        rec("2022", DimensionKind::Age, "25-29", 100),
    ]);
    let prior = HistoricalPrior::from_store(&store, "2022", "Ansan").unwrap();
    assert!(close(prior.probability("베트남", "E-9", AgeBand::Age25To29), 0.8 * 0.6));
    assert!(close(prior.probability("베트남", "E-9", AgeBand::Age30To34), 0.0));
    assert!(close(prior.probability("중국", "E-9", AgeBand::Age25To29), 0.0));

    let seed = SeedConstructor::default();
    // (0.3·20 + 0.7·0.48·10000) × 2 + 0.1
    let blended = seed.cell_weight("베트남", "E-9", AgeBand::Age25To29, Gender::Male, Some(&prior));
    assert!(close(blended, (0.3 * 20.0 + 0.7 * 4800.0) * 2.0 + 0.1));

    // Zero prior probability leaves the heuristic untouched.
    let unblended = seed.cell_weight("베트남", "E-9", AgeBand::Age30To34, Gender::Male, Some(&prior));
    assert!(close(unblended, 40.1));
}

#[test]
fn no_prior_without_nationality_detail() {
    let mut store = RecordStore::new();
    store.append(vec![
        rec("2022", DimensionKind::Nationality, "합계", 100),
        rec("2022", DimensionKind::Visa, "E-9", 60),
    ]);
    assert!(HistoricalPrior::from_store(&store, "2022", "Ansan").is_none());
    assert!(HistoricalPrior::from_store(&store, "2021", "Ansan").is_none());
}
