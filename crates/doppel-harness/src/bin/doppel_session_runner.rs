#![forbid(unsafe_code)]

//! `doppel_session_runner` runs a mimic-challenge campaign with the
//! built-in reference parties and prints a replayable JSON report.
//!
//! The genuine engine and a black-box mimic are driven through identical
//! seeded sessions; the report carries per-seed verdicts, the rebound
//! summary, and the MDL margin evidence. Non-zero exit when the campaign
//! surfaces a fatal finding or the audit trail fails reverification.

use std::error::Error;
use std::fs;
use std::path::PathBuf;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use doppel_harness::audit_store::{reverify, AuditStore};
use doppel_harness::config::ProtocolConfig;
use doppel_harness::finding::FindingCode;
use doppel_harness::fixtures::{EngineParams, MimicChallenger, MimicParams, RecursiveEngine};
use doppel_harness::orchestrator::{run_campaign, CampaignReport};

const RUNNER_REPORT_SCHEMA_VERSION: &str = "doppel-harness.runner-report.v1";
const DEFAULT_SEED_COUNT: usize = 10;

#[derive(Debug)]
struct CliArgs {
    seed_count: usize,
    base_seed: u64,
    steps: u64,
    out_path: Option<PathBuf>,
    skip_challenger: bool,
    print_help: bool,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            seed_count: DEFAULT_SEED_COUNT,
            base_seed: 1,
            steps: 100,
            out_path: None,
            skip_challenger: false,
            print_help: false,
        }
    }
}

#[derive(Debug, Serialize)]
struct RunnerReport {
    schema_version: String,
    generated_rfc3339: String,
    base_seed: u64,
    seed_count: usize,
    steps: u64,
    campaign: CampaignReport,
    archive_sessions: usize,
    reverified: bool,
}

fn print_usage() {
    eprintln!(
        "usage: doppel_session_runner [--seeds N] [--base-seed S] [--steps N] \
         [--no-challenger] [--out PATH]"
    );
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<CliArgs, Box<dyn Error>> {
    let mut parsed = CliArgs::default();
    let mut args = args.peekable();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--seeds" => {
                let value = args.next().ok_or("--seeds requires a value")?;
                parsed.seed_count = value.parse()?;
            }
            "--base-seed" => {
                let value = args.next().ok_or("--base-seed requires a value")?;
                parsed.base_seed = value.parse()?;
            }
            "--steps" => {
                let value = args.next().ok_or("--steps requires a value")?;
                parsed.steps = value.parse()?;
            }
            "--out" => {
                let value = args.next().ok_or("--out requires a value")?;
                parsed.out_path = Some(PathBuf::from(value));
            }
            "--no-challenger" => parsed.skip_challenger = true,
            "--help" | "-h" => parsed.print_help = true,
            other => return Err(format!("unknown argument: {other}").into()),
        }
    }
    if parsed.seed_count == 0 {
        return Err("--seeds must be positive".into());
    }
    Ok(parsed)
}

fn main() {
    match run() {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(error) => {
            eprintln!("{error}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32, Box<dyn Error>> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.print_help {
        print_usage();
        return Ok(0);
    }

    let mut base_config = ProtocolConfig::baseline(args.base_seed);
    base_config.steps = args.steps;
    if args.steps < 100 {
        // Keep the stress window and diagonal range inside short runs.
        base_config.stress_schedule.windows[0].onset_step = args.steps * 2 / 5;
        base_config.stress_schedule.windows[0].duration = (args.steps / 10).max(1);
        base_config.diagonal_min_step = args.steps * 3 / 5;
    }
    base_config.validate()?;

    let trial_seeds: Vec<u64> = (0..args.seed_count)
        .map(|i| args.base_seed.wrapping_add(i as u64).max(1))
        .collect();

    let store = AuditStore::new();
    let skip_challenger = args.skip_challenger;
    let campaign = run_campaign(
        &base_config,
        &trial_seeds,
        |seed| RecursiveEngine::new(format!("engine-{seed:04}"), seed, EngineParams::default()),
        |seed| {
            if skip_challenger {
                None
            } else {
                Some(MimicChallenger::new(
                    format!("mimic-{seed:04}"),
                    seed,
                    MimicParams::default(),
                ))
            }
        },
        &store,
    )?;

    let mut reverified = true;
    for envelope in store.sessions() {
        if let Err(error) = reverify(&envelope.session) {
            eprintln!("reverification failed for {}: {error}", envelope.session_id);
            reverified = false;
        }
    }

    let report = RunnerReport {
        schema_version: RUNNER_REPORT_SCHEMA_VERSION.to_string(),
        generated_rfc3339: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        base_seed: args.base_seed,
        seed_count: args.seed_count,
        steps: args.steps,
        campaign,
        archive_sessions: store.len(),
        reverified,
    };
    let json = serde_json::to_string_pretty(&report)?;

    if let Some(out_path) = &args.out_path {
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(out_path, json.as_bytes())?;
        let archive_path = out_path.with_extension("archive.jsonl");
        store.export_jsonl(&archive_path)?;
    }

    println!("{json}");

    let fatal = report
        .campaign
        .findings
        .iter()
        .any(|f| f.code == FindingCode::IntegrityViolation)
        || !reverified;
    Ok(if fatal { 2 } else { 0 })
}
