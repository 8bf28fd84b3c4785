//! ipf-runner: headless driver for the population estimation engine.
//!
//! Usage:
//!   ipf-runner --records 2022.json --records 2023.json --passes 100
//!   ipf-runner --records 2023.json --period 2023 --region Ansan --no-prior
//!   ipf-runner --records 2023.json --nationality-level medium --gender female --confidence 99
//!   ipf-runner --config engine.json --ipc-mode

use anyhow::Result;
use popcube_core::{
    aggregate::{CrossTab, ProjectionParams, ProjectionView},
    config::EngineConfig,
    engine::{EstimationEngine, Selection},
    event::EngineEvent,
    marginal::{MarginalSet, QualityReport},
    record::{self, ClassifiedRecord, RecordInput},
    solver::{ErrorSample, RunFlag, SolverPhase},
    trend::TrendPoint,
    types::{Gender, Period, Region},
};
use std::collections::BTreeMap;
use std::env;
use std::io::{self, BufRead, Write};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::{Arc, Mutex};

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    GetState,
    Ingest {
        records: Vec<RecordInput>,
    },
    LoadFile {
        path: String,
    },
    Select {
        period: Period,
        region: Region,
    },
    SetUsePriorSeed {
        enabled: bool,
    },
    Step {
        #[serde(default = "one")]
        count: u32,
    },
    AutoRun,
    /// Only meaningful while an auto-run is in flight.
    Stop,
    Project {
        #[serde(default)]
        params: Option<ProjectionParams>,
    },
    Quit,
}

fn one() -> u32 {
    1
}

#[derive(serde::Serialize)]
struct UiState {
    selection:         Option<Selection>,
    use_prior_seed:    bool,
    record_count:      usize,
    available_periods: Vec<Period>,
    available_regions: Vec<Region>,
    passes:            u32,
    phase:             SolverPhase,
    history:           Vec<ErrorSample>,
    report:            Option<QualityReport>,
    marginals:         MarginalSet,
    gender_split:      BTreeMap<Gender, f64>,
    trend:             Vec<TrendPoint>,
    projection:        ProjectionView,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let passes = parse_arg(&args, "--passes", 0u32);
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let no_prior = args.iter().any(|a| a == "--no-prior");
    let period = arg_value(&args, "--period");
    let region = arg_value(&args, "--region");
    let record_files = arg_values(&args, "--records");

    let mut config = match arg_value(&args, "--config") {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if passes > 0 {
        config.solver.max_passes = passes;
    }
    if let Some(level) = arg_value(&args, "--nationality-level") {
        config.display.nationality_level = level.parse()?;
    }
    if let Some(level) = arg_value(&args, "--visa-level") {
        config.display.visa_level = level.parse()?;
    }
    if let Some(level) = arg_value(&args, "--age-level") {
        config.display.age_level = level.parse()?;
    }
    if let Some(gender) = arg_value(&args, "--gender") {
        config.display.gender = Some(gender.parse()?);
    }
    match arg_value(&args, "--confidence") {
        Some("off") => config.display.confidence = None,
        Some(level) => config.display.confidence = Some(level.parse()?),
        None => {}
    }
    if !ipc_mode {
        // Nobody is watching intermediate states on the command line.
        config.solver.pass_delay_ms = 0;
    }

    let mut engine = EstimationEngine::new(config);
    if no_prior {
        engine.set_use_prior_seed(false);
    }

    for path in &record_files {
        let batch = record::load_batch(path)?;
        for event in engine.ingest(batch) {
            log::debug!("{}: {}", event.name(), serde_json::to_string(&event)?);
        }
    }
    if let (Some(period), Some(region)) = (period, region) {
        engine.select(period, region);
    }

    if ipc_mode {
        run_ipc_loop(&mut engine)?;
    } else {
        println!("ipf-runner");
        println!("  record files: {}", record_files.len());
        println!("  records:      {}", engine.records().len());
        println!("  max passes:   {}", engine.config.solver.max_passes);
        println!("  prior seed:   {}", engine.use_prior_seed());
        println!();

        let flag = RunFlag::new();
        engine.auto_run(&flag, |_| {});
        print_summary(&engine);
    }

    Ok(())
}

// ── IPC ──────────────────────────────────────────────────────────────────────

fn run_ipc_loop(engine: &mut EstimationEngine) -> Result<()> {
    let (tx, rx) = mpsc::channel::<String>();
    // Flag of the auto-run in flight, if any. The reader clears it the
    // moment a stop line arrives, so no pass starts after that.
    let active: Arc<Mutex<Option<RunFlag>>> = Arc::new(Mutex::new(None));
    let reader_active = Arc::clone(&active);
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if is_stop(&line) {
                if let Ok(slot) = reader_active.lock() {
                    if let Some(flag) = slot.as_ref() {
                        flag.stop();
                    }
                }
            }
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut stdout = io::stdout();
    let mut params = engine.config.display.clone();
    let mut pending: Vec<String> = Vec::new();

    loop {
        let line = if pending.is_empty() {
            match rx.recv() {
                Ok(line) => line,
                Err(_) => break, // EOF
            }
        } else {
            pending.remove(0)
        };
        if line.trim().is_empty() {
            continue;
        }

        let cmd: IpcCommand = match serde_json::from_str(&line) {
            Ok(c) => c,
            Err(e) => {
                write_error(&mut stdout, &e.to_string())?;
                continue;
            }
        };

        match cmd {
            IpcCommand::Quit => break,
            IpcCommand::GetState => {}
            IpcCommand::Stop => {}
            IpcCommand::Ingest { records } => {
                let batch = match records
                    .into_iter()
                    .map(RecordInput::into_classified)
                    .collect::<Result<Vec<ClassifiedRecord>, _>>()
                {
                    Ok(batch) => batch,
                    Err(e) => {
                        write_error(&mut stdout, &e.to_string())?;
                        continue;
                    }
                };
                write_events(&mut stdout, &engine.ingest(batch))?;
            }
            IpcCommand::LoadFile { path } => match record::load_batch(&path) {
                Ok(batch) => write_events(&mut stdout, &engine.ingest(batch))?,
                Err(e) => {
                    write_error(&mut stdout, &e.to_string())?;
                    continue;
                }
            },
            IpcCommand::Select { period, region } => {
                write_events(&mut stdout, &engine.select(&period, &region))?;
            }
            IpcCommand::SetUsePriorSeed { enabled } => {
                write_events(&mut stdout, &engine.set_use_prior_seed(enabled))?;
            }
            IpcCommand::Step { count } => {
                let events: Vec<EngineEvent> = (0..count).map(|_| engine.step()).collect();
                write_events(&mut stdout, &events)?;
            }
            IpcCommand::AutoRun => {
                let flag = RunFlag::new();
                set_active(&active, Some(flag.clone()));
                let mut io_error: Option<io::Error> = None;
                engine.auto_run(&flag, |event| {
                    drain_during_run(&rx, &flag, &mut pending);
                    if io_error.is_none() {
                        if let Err(e) = write_event(&mut stdout, event) {
                            io_error = Some(e);
                            flag.stop();
                        }
                    }
                });
                set_active(&active, None);
                if let Some(e) = io_error {
                    return Err(e.into());
                }
            }
            IpcCommand::Project { params: requested } => {
                if let Some(requested) = requested {
                    params = requested;
                }
            }
        }

        let state = build_ui_state(engine, &params);
        writeln!(stdout, "{}", serde_json::to_string(&state)?)?;
        stdout.flush()?;
    }
    Ok(())
}

fn is_stop(line: &str) -> bool {
    matches!(serde_json::from_str::<IpcCommand>(line), Ok(IpcCommand::Stop))
}

fn set_active(slot: &Mutex<Option<RunFlag>>, flag: Option<RunFlag>) {
    if let Ok(mut slot) = slot.lock() {
        *slot = flag;
    }
}

/// Pull whatever arrived on stdin while a run is in flight. A stop that was
/// queued before the run began still clears the flag; anything else waits
/// until the run is over.
fn drain_during_run(rx: &Receiver<String>, flag: &RunFlag, pending: &mut Vec<String>) {
    loop {
        match rx.try_recv() {
            Ok(line) => {
                if is_stop(&line) {
                    flag.stop();
                } else {
                    pending.push(line);
                }
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }
}

fn write_event(out: &mut impl Write, event: &EngineEvent) -> io::Result<()> {
    let json = serde_json::to_string(event).map_err(io::Error::other)?;
    writeln!(out, "{json}")?;
    out.flush()
}

fn write_events(out: &mut impl Write, events: &[EngineEvent]) -> io::Result<()> {
    for event in events {
        write_event(out, event)?;
    }
    Ok(())
}

fn write_error(out: &mut impl Write, message: &str) -> io::Result<()> {
    let err_json = serde_json::json!({ "error": message });
    writeln!(out, "{err_json}")?;
    out.flush()
}

fn build_ui_state(engine: &EstimationEngine, params: &ProjectionParams) -> UiState {
    UiState {
        selection:         engine.selection().cloned(),
        use_prior_seed:    engine.use_prior_seed(),
        record_count:      engine.records().len(),
        available_periods: engine.available_periods(),
        available_regions: engine.available_regions(),
        passes:            engine.passes(),
        phase:             engine.phase(),
        history:           engine.history().to_vec(),
        report:            engine.report().cloned(),
        marginals:         engine.marginals().clone(),
        gender_split:      engine.gender_split(),
        trend:             engine.trend(),
        projection:        engine.project(params).to_view(),
    }
}

// ── Summary ──────────────────────────────────────────────────────────────────

fn print_summary(engine: &EstimationEngine) {
    println!("=== SELECTION ===");
    match engine.selection() {
        Some(sel) => println!("  {} / {}", sel.period, sel.region),
        None => {
            println!("  (no records loaded)");
            return;
        }
    }

    if let Some(report) = engine.report() {
        println!();
        println!("=== DATA QUALITY ===");
        println!("  anchor:         {}", report.anchor);
        println!(
            "  raw sums:       nat={} visa={} age={} gender={}",
            report.raw_sums.nationality,
            report.raw_sums.visa,
            report.raw_sums.age,
            report.raw_sums.gender
        );
        println!("  max abs diff:   {}", report.max_absolute_diff);
        println!("  discrepancy:    {:.2}%", report.discrepancy_rate_percent);
        println!("  status:         {:?}", report.status);
        println!(
            "  prior period:   {}",
            report.prior_period_key.as_deref().unwrap_or("(none)")
        );
        if !report.missing_dimensions.is_empty() {
            let names: Vec<&str> = report.missing_dimensions.iter().map(|d| d.name()).collect();
            println!("  missing:        {}", names.join(", "));
        }
        if report.skipped_age_rows > 0 {
            println!("  skipped ages:   {}", report.skipped_age_rows);
        }
    }

    println!();
    println!("=== SOLVER ===");
    println!("  passes: {}  phase: {:?}", engine.passes(), engine.phase());
    let history = engine.history().to_vec();
    for sample in history.iter().rev().take(5).collect::<Vec<_>>().into_iter().rev() {
        println!("  pass {:>4} | error {:.6}%", sample.iteration, sample.error_percent);
    }

    let split = engine.gender_split();
    println!();
    println!("=== GENDER ===");
    for (gender, total) in &split {
        println!("  {:<7} {total:.0}", gender.label());
    }

    let trend = engine.trend();
    if trend.len() > 1 {
        println!();
        println!("=== TREND ===");
        for point in &trend {
            println!("  {} | {}", point.period, point.total);
        }
    }

    let projection = engine.project_default();
    println!();
    println!("=== NATIONALITY × VISA ===");
    print_table(&projection.nat_visa);
    println!();
    println!("=== NATIONALITY × AGE ===");
    print_table(&projection.nat_age);
}

fn print_table(table: &CrossTab) {
    let header: Vec<String> = table.cols().iter().map(|c| format!("{:>12}", c.label())).collect();
    println!("  {:<28}{}", "", header.join(""));
    for row in table.rows() {
        let cells: Vec<String> = table
            .cols()
            .iter()
            .map(|c| format!("{:>12.0}", table.get(row, c)))
            .collect();
        println!("  {:<28}{}", row.label(), cells.join(""));
    }
}

// ── Args ─────────────────────────────────────────────────────────────────────

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}

/// Every value given for a repeatable flag, in order.
fn arg_values<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
    args.windows(2)
        .filter(|w| w[0] == flag)
        .map(|w| w[1].as_str())
        .collect()
}
