//! IPF solver: sweep exactness, numerical safety, pass control.

use popcube_core::{
    category::AgeBand,
    config::SolverConfig,
    cube::{Cube, CubeKey},
    marginal::MarginalSet,
    solver::{sweep, IpfSolver, RunFlag, SolverPhase},
    types::Gender,
};
use rand::Rng;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

const NATIONALITIES: [&str; 3] = ["베트남", "중국", "미국"];
const VISAS: [&str; 3] = ["E-9", "F-4", "D-2"];

fn config(max_passes: u32) -> SolverConfig {
    SolverConfig {
        max_passes,
        pass_delay_ms: 0,
        ..SolverConfig::default()
    }
}

fn random_cube(rng: &mut Pcg64Mcg, low: f64, high: f64) -> Cube {
    let mut cube = Cube::new();
    for n in NATIONALITIES {
        for v in VISAS {
            for a in AgeBand::ALL {
                for g in Gender::ALL {
                    cube.insert(CubeKey::new(n, v, a, g), rng.gen_range(low..high));
                }
            }
        }
    }
    cube
}

/// Marginals of an integer-valued cube; all four dimensions agree exactly.
fn marginals_of(cube: &Cube) -> MarginalSet {
    let mut m = MarginalSet::default();
    for (key, value) in cube.iter() {
        let count = value.round() as u64;
        m.anchor += count;
        *m.nationality.entry(key.nationality.clone()).or_default() += count;
        *m.visa.entry(key.visa.clone()).or_default() += count;
        *m.age.entry(key.age).or_default() += count;
        *m.gender.entry(key.gender).or_default() += count;
    }
    m
}

fn integer_truth(rng: &mut Pcg64Mcg) -> Cube {
    let mut cube = Cube::new();
    for n in NATIONALITIES {
        for v in VISAS {
            for a in AgeBand::ALL {
                for g in Gender::ALL {
                    cube.insert(CubeKey::new(n, v, a, g), rng.gen_range(1..50) as f64);
                }
            }
        }
    }
    cube
}

fn nationality_sum(cube: &Cube, label: &str) -> f64 {
    cube.iter().filter(|(k, _)| k.nationality == label).map(|(_, v)| *v).sum()
}

/// Targets that cannot all hold at once: visa disagrees with the rest.
fn inconsistent_targets() -> MarginalSet {
    MarginalSet {
        anchor:      300,
        nationality: NATIONALITIES.iter().map(|n| (n.to_string(), 100)).collect(),
        visa:        VISAS.iter().map(|v| (v.to_string(), 130)).collect(),
        age:         AgeBand::ALL.iter().map(|a| (*a, 20)).collect(),
        gender:      BTreeMap::from([(Gender::Male, 160), (Gender::Female, 140)]),
    }
}

#[test]
fn one_sweep_hits_every_positive_target() {
    let mut rng = Pcg64Mcg::seed_from_u64(7);
    let mut cube = random_cube(&mut rng, 0.1, 10.0);
    let targets: BTreeMap<String, u64> =
        BTreeMap::from([("베트남".into(), 500), ("중국".into(), 300), ("미국".into(), 20)]);

    sweep(&mut cube, &targets, CubeKey::nationality);

    for (label, target) in &targets {
        let sum = nationality_sum(&cube, label);
        let rel = (sum - *target as f64).abs() / *target as f64;
        assert!(rel < 1e-6, "{label}: {sum} vs {target}");
    }
}

#[test]
fn sweep_skips_zero_targets_and_unknown_categories() {
    let mut rng = Pcg64Mcg::seed_from_u64(11);
    let mut cube = random_cube(&mut rng, 0.1, 10.0);
    let before_china = nationality_sum(&cube, "중국");
    let before_us = nationality_sum(&cube, "미국");

    let targets: BTreeMap<String, u64> = BTreeMap::from([
        ("베트남".into(), 400),
        ("중국".into(), 0),
        ("Atlantis".into(), 900),
    ]);
    let error = sweep(&mut cube, &targets, CubeKey::nationality);

    assert_eq!(nationality_sum(&cube, "중국"), before_china);
    assert_eq!(nationality_sum(&cube, "미국"), before_us);
    assert!((nationality_sum(&cube, "베트남") - 400.0).abs() < 1e-6);
    assert!(error > 0.0);
}

#[test]
fn hundred_passes_stay_finite_and_non_negative() {
    let mut rng = Pcg64Mcg::seed_from_u64(0xDEAD_BEEF);
    for _ in 0..5 {
        let seed = random_cube(&mut rng, 0.1, 1_000.0);
        let mut targets = inconsistent_targets();
        for count in targets.age.values_mut() {
            *count = rng.gen_range(1..5_000);
        }
        let mut solver = IpfSolver::new(seed, targets, config(100));
        for _ in 0..100 {
            let sample = solver.step();
            assert!(sample.error_percent.is_finite());
            assert!(solver.cube().is_well_formed());
        }
    }
}

#[test]
fn consistent_targets_converge() {
    let mut rng = Pcg64Mcg::seed_from_u64(42);
    let truth = integer_truth(&mut rng);
    let targets = marginals_of(&truth);
    let seed = random_cube(&mut rng, 0.1, 10.0);

    let mut solver = IpfSolver::new(seed, targets.clone(), config(100));
    let first = solver.step().error_percent;
    let mut last = first;
    for _ in 1..100 {
        last = solver.step().error_percent;
    }
    assert!(last < first);
    assert!(last < 0.01, "error after 100 passes: {last}%");

    let cube = solver.cube();
    for (label, target) in &targets.nationality {
        assert!((nationality_sum(cube, label) - *target as f64).abs() < 0.5);
    }
    assert!((cube.gender_total(Gender::Male) - targets.gender[&Gender::Male] as f64).abs() < 1e-6);
}

#[test]
fn auto_run_stops_at_the_pass_budget() {
    let mut rng = Pcg64Mcg::seed_from_u64(3);
    let mut solver = IpfSolver::new(random_cube(&mut rng, 0.1, 10.0), inconsistent_targets(), config(7));
    let flag = RunFlag::new();
    let mut seen = Vec::new();

    let outcome = solver.auto_run(&flag, |s| seen.push(s.iteration));

    assert_eq!(outcome.passes, 7);
    assert_eq!(outcome.phase, SolverPhase::Capped);
    assert_eq!(seen, (1..=7).collect::<Vec<u32>>());
    assert!(outcome.last_error.is_some_and(|e| e > 0.0));
    assert!(!flag.is_running());
}

#[test]
fn clearing_the_flag_stops_after_the_pass_in_flight() {
    let mut rng = Pcg64Mcg::seed_from_u64(5);
    let mut solver = IpfSolver::new(random_cube(&mut rng, 0.1, 10.0), inconsistent_targets(), config(100));
    let flag = RunFlag::new();
    let remote = flag.clone();

    let outcome = solver.auto_run(&flag, |s| {
        if s.iteration == 3 {
            remote.stop();
        }
    });

    assert_eq!(outcome.passes, 3);
    assert_eq!(outcome.phase, SolverPhase::Stopped);
    assert_eq!(solver.history().len(), 3);
}

#[test]
fn stop_during_the_pause_starts_no_further_pass() {
    let mut rng = Pcg64Mcg::seed_from_u64(6);
    let cfg = SolverConfig { pass_delay_ms: 60_000, ..config(5) };
    let mut solver = IpfSolver::new(random_cube(&mut rng, 0.1, 10.0), inconsistent_targets(), cfg);
    let flag = RunFlag::new();
    let remote = flag.clone();
    let stopper = std::thread::spawn(move || {
        while !remote.is_running() {
            std::thread::yield_now();
        }
        std::thread::sleep(Duration::from_millis(100));
        remote.stop();
    });

    let started = Instant::now();
    let outcome = solver.auto_run(&flag, |_| {});
    stopper.join().unwrap();

    assert_eq!(outcome.passes, 1);
    assert_eq!(outcome.phase, SolverPhase::Stopped);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn auto_run_restarts_counter_but_keeps_the_cube() {
    let mut rng = Pcg64Mcg::seed_from_u64(9);
    let mut solver = IpfSolver::new(random_cube(&mut rng, 0.1, 10.0), inconsistent_targets(), config(4));
    solver.step();
    solver.step();
    let cube_before = solver.cube().clone();

    let outcome = solver.auto_run(&RunFlag::new(), |_| {});

    assert_eq!(outcome.passes, 4);
    assert_eq!(solver.history().to_vec().first().map(|s| s.iteration), Some(1));
    assert_ne!(solver.cube(), &cube_before);
}

#[test]
fn early_stop_on_convergence_when_enabled() {
    let mut rng = Pcg64Mcg::seed_from_u64(21);
    let truth = integer_truth(&mut rng);
    let targets = marginals_of(&truth);
    let cfg = SolverConfig {
        convergence_tolerance_percent: 0.5,
        stop_on_convergence: true,
        ..config(100)
    };
    let mut solver = IpfSolver::new(random_cube(&mut rng, 0.1, 10.0), targets, cfg);

    let outcome = solver.auto_run(&RunFlag::new(), |_| {});

    assert_eq!(outcome.phase, SolverPhase::Converged);
    assert!(outcome.passes < 100);
    assert!(outcome.last_error.is_some_and(|e| e <= 0.5));
}

#[test]
fn history_keeps_a_trailing_window() {
    let mut rng = Pcg64Mcg::seed_from_u64(13);
    let cfg = SolverConfig { history_window: 5, ..config(100) };
    let mut solver = IpfSolver::new(random_cube(&mut rng, 0.1, 10.0), inconsistent_targets(), cfg);
    for _ in 0..12 {
        solver.step();
    }
    assert_eq!(solver.passes(), 12);
    assert_eq!(solver.history().len(), 5);
    assert_eq!(solver.history().latest().map(|s| s.iteration), Some(12));
    assert_eq!(solver.phase(), SolverPhase::Idle);
}

#[test]
fn empty_problem_is_a_quiet_no_op() {
    let mut solver = IpfSolver::new(Cube::new(), MarginalSet::default(), config(3));
    let sample = solver.step();
    assert_eq!(sample.error_percent, 0.0);
    assert_eq!(sample.iteration, 1);
    // Zero error counts as within the default tolerance.
    assert_eq!(solver.phase(), SolverPhase::Converged);
}
