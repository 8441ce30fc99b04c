//! `culprit` CLI: bisect a regression range or sweep revisions for a
//! metric drift.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use clap::{Parser, Subcommand};

use culprit::core::policy::{PolicyKind, ReferencePoints};
use culprit::core::types::{Revision, StepOutcome};
use culprit::core::walker::RevisionWalker;
use culprit::driver::{self, RunStop};
use culprit::exit_codes;
use culprit::io::config::{CommandSpec, EngineConfig, load_config, write_config};
use culprit::io::git::{Git, GitBisectWalker};
use culprit::io::oracle::CommandOracle;
use culprit::io::recorder::RunRecorder;
use culprit::io::session_state::clear_session_state;
use culprit::session::{BisectionSession, SessionParams};
use culprit::sweep::run_sweep;

#[derive(Parser)]
#[command(
    name = "culprit",
    version,
    about = "Find the revision that introduced a regression"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a starter config file for the operator to edit.
    Init {
        /// History working copy.
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Clear session state and abandon any in-flight bisection.
    Reset {
        /// History working copy.
        #[arg(long, default_value = ".")]
        repo: PathBuf,
    },
    /// Binary-search the range until a single culprit revision remains.
    Bisect {
        #[command(flatten)]
        common: CommonArgs,

        /// Known-good anchor (any git revision expression).
        #[arg(long)]
        good: String,

        /// Known-bad anchor (any git revision expression).
        #[arg(long)]
        bad: String,

        /// Verdict policy applied to oracle results.
        #[arg(long, value_enum, default_value = "threshold")]
        policy: PolicyKind,

        /// Reference metric measured at the good anchor (threshold policy).
        #[arg(long)]
        good_ref: Option<f64>,

        /// Reference metric measured at the bad anchor (threshold policy).
        #[arg(long)]
        bad_ref: Option<f64>,

        /// Run the auxiliary structural check before each measurement.
        #[arg(long)]
        with_check: bool,
    },
    /// Measure every Nth revision of a range or explicit list without
    /// bisecting.
    Sweep {
        #[command(flatten)]
        common: CommonArgs,

        /// Sample stride: measure every Nth revision.
        #[arg(long, default_value_t = 1)]
        every: usize,

        /// Revisions to sweep, oldest first.
        #[arg(value_name = "REV", conflicts_with = "revs_file")]
        revs: Vec<String>,

        /// File with one revision expression per line, oldest first.
        #[arg(long)]
        revs_file: Option<PathBuf>,

        /// Sweep the history between two anchors instead of listing
        /// revisions explicitly (good exclusive, bad inclusive).
        #[arg(long, requires = "bad", conflicts_with_all = ["revs", "revs_file"])]
        good: Option<String>,

        /// Bad anchor bounding the swept range.
        #[arg(long, requires = "good")]
        bad: Option<String>,
    },
}

#[derive(clap::Args)]
struct CommonArgs {
    /// History working copy.
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Directory where the measurement command runs. Defaults to the repo.
    #[arg(long)]
    target: Option<PathBuf>,

    /// Config file path. Defaults to `<repo>/.culprit/config.toml`.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    culprit::logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_codes::FATAL
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { repo, force } => cmd_init(repo, force),
        Command::Reset { repo } => cmd_reset(repo),
        Command::Bisect {
            common,
            good,
            bad,
            policy,
            good_ref,
            bad_ref,
            with_check,
        } => cmd_bisect(common, good, bad, policy, good_ref, bad_ref, with_check),
        Command::Sweep {
            common,
            every,
            revs,
            revs_file,
            good,
            bad,
        } => cmd_sweep(common, every, revs, revs_file, good, bad),
    }
}

fn cmd_init(repo: PathBuf, force: bool) -> Result<i32> {
    let repo = repo
        .canonicalize()
        .with_context(|| format!("resolve repo path {}", repo.display()))?;
    let path = repo.join(".culprit").join("config.toml");
    if path.exists() && !force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    // Starter measurement command; the operator replaces it with the real
    // build and timing pipeline.
    let starter = EngineConfig {
        measure: CommandSpec {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo 'Build time: 0.0s'".to_string(),
            ],
        },
        ..EngineConfig::default()
    };
    write_config(&path, &starter)?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_reset(repo: PathBuf) -> Result<i32> {
    let repo = repo
        .canonicalize()
        .with_context(|| format!("resolve repo path {}", repo.display()))?;
    let git = Git::new(&repo);
    // The config may still be a template here; only the state location
    // matters, so skip full validation.
    let config = load_config(&repo.join(".culprit").join("config.toml"))?;
    let state_prefix = config.state_dir.display().to_string();
    let mut walker = GitBisectWalker::new(git, state_prefix);
    walker.reset().context("abandon in-flight bisection")?;
    clear_session_state(&repo.join(&config.state_dir).join("session.json"))?;
    println!("session state cleared");
    Ok(exit_codes::OK)
}

/// Shared preflight: load config, verify the working copy is clean.
struct Prepared {
    git: Git,
    config: EngineConfig,
    recorder: RunRecorder,
    state_prefix: String,
    target_dir: PathBuf,
}

fn prepare(common: &CommonArgs, with_check: bool) -> Result<Prepared> {
    let repo = common
        .repo
        .canonicalize()
        .with_context(|| format!("resolve repo path {}", common.repo.display()))?;
    let git = Git::new(&repo);

    let config_path = common
        .config
        .clone()
        .unwrap_or_else(|| repo.join(".culprit").join("config.toml"));
    let mut config = load_config(&config_path)?;
    if with_check {
        config.run_check = true;
    }
    config.validate().context("invalid engine config")?;

    let state_prefix = config.state_dir.display().to_string();
    git.ensure_clean_except_prefixes(&[&state_prefix])
        .context("preflight working copy check")?;

    let state_dir = repo.join(&config.state_dir);
    let recorder = RunRecorder::new(&state_dir);
    let target_dir = common.target.clone().unwrap_or_else(|| repo.clone());
    Ok(Prepared {
        git,
        config,
        recorder,
        state_prefix,
        target_dir,
    })
}

fn cmd_bisect(
    common: CommonArgs,
    good: String,
    bad: String,
    policy: PolicyKind,
    good_ref: Option<f64>,
    bad_ref: Option<f64>,
    with_check: bool,
) -> Result<i32> {
    let prepared = prepare(&common, with_check)?;
    let good = prepared
        .git
        .rev_parse(&good)
        .with_context(|| format!("resolve good anchor '{good}'"))?;
    let bad = prepared
        .git
        .rev_parse(&bad)
        .with_context(|| format!("resolve bad anchor '{bad}'"))?;
    let refs = match policy {
        PolicyKind::Threshold => {
            let good_ref = good_ref
                .ok_or_else(|| anyhow!("--good-ref is required with the threshold policy"))?;
            let bad_ref =
                bad_ref.ok_or_else(|| anyhow!("--bad-ref is required with the threshold policy"))?;
            ReferencePoints { good_ref, bad_ref }
        }
        // The binary policy never consults the references.
        PolicyKind::Binary => ReferencePoints {
            good_ref: 0.0,
            bad_ref: 0.0,
        },
    };

    let state_dir = prepared.git.workdir().join(&prepared.config.state_dir);
    let oracle = CommandOracle::new(
        prepared.git.workdir(),
        &prepared.target_dir,
        prepared.config.clone(),
        prepared.recorder.clone(),
    )?;
    let walker = GitBisectWalker::new(prepared.git.clone(), prepared.state_prefix.clone());
    let mut session = BisectionSession::new(
        walker,
        oracle,
        prepared.recorder.clone(),
        SessionParams {
            good,
            bad,
            policy,
            refs,
            label: prepared.config.label.clone(),
            state_path: state_dir.join("session.json"),
        },
    )?;

    let outcome = driver::run(&mut session, print_step);
    // Leave the history on its original branch whatever happened.
    if let Err(err) = session.abandon() {
        eprintln!("warning: failed to reset bisect state: {err:#}");
    }
    let outcome = outcome?;

    match outcome.stop {
        RunStop::CulpritFound(culprit) => {
            println!(
                "culprit isolated after {} steps: {}",
                outcome.steps_executed, culprit
            );
            println!("transcript: {}", prepared.recorder.transcript_path().display());
            Ok(exit_codes::OK)
        }
        RunStop::Exhausted(suspects) => {
            println!(
                "search exhausted after {} steps; culprit is one of {} skipped revisions:",
                outcome.steps_executed,
                suspects.len()
            );
            for suspect in suspects {
                println!("  {suspect}");
            }
            Ok(exit_codes::EXHAUSTED)
        }
    }
}

fn cmd_sweep(
    common: CommonArgs,
    every: usize,
    revs: Vec<String>,
    revs_file: Option<PathBuf>,
    good: Option<String>,
    bad: Option<String>,
) -> Result<i32> {
    let prepared = prepare(&common, false)?;
    let exprs = match revs_file {
        Some(path) => {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read revision list {}", path.display()))?;
            contents
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()
        }
        None => revs,
    };
    let revisions: Vec<Revision> = if let (Some(good), Some(bad)) = (good, bad) {
        let good = prepared
            .git
            .rev_parse(&good)
            .with_context(|| format!("resolve good anchor '{good}'"))?;
        let bad = prepared
            .git
            .rev_parse(&bad)
            .with_context(|| format!("resolve bad anchor '{bad}'"))?;
        prepared
            .git
            .revisions_between(&good, &bad)
            .context("enumerate revision range")?
    } else {
        exprs
            .iter()
            .map(|expr| {
                prepared
                    .git
                    .rev_parse(expr)
                    .with_context(|| format!("resolve revision '{expr}'"))
            })
            .collect::<Result<_>>()?
    };
    if revisions.is_empty() {
        return Err(anyhow!(
            "no revisions to sweep; pass them as arguments, via --revs-file, or as --good/--bad anchors"
        ));
    }

    let origin = prepared.git.current_revision()?;
    let oracle = CommandOracle::new(
        prepared.git.workdir(),
        &prepared.target_dir,
        prepared.config.clone(),
        prepared.recorder.clone(),
    )?;

    let rows = run_sweep(
        &prepared.git,
        &oracle,
        &prepared.recorder,
        &prepared.config.label,
        &revisions,
        every,
        &prepared.state_prefix,
    );
    if let Err(err) = prepared.git.checkout(&origin) {
        eprintln!("warning: failed to return to original revision: {err:#}");
    }
    let rows = rows?;

    for row in &rows {
        let metric = row
            .result
            .metric
            .map_or_else(|| "-".to_string(), |m| m.to_string());
        println!("{}\t{:?}\t{}", row.revision.short(), row.result.status, metric);
    }
    println!("swept {} of {} revisions", rows.len(), revisions.len());
    Ok(exit_codes::OK)
}

fn print_step(outcome: &StepOutcome) {
    let now = Utc::now().to_rfc3339();
    match outcome {
        StepOutcome::Continuing { revision, verdict } => {
            println!("[{now}] {} marked {}", revision.short(), verdict.as_str());
        }
        StepOutcome::NoOracleData { revision } => {
            println!("[{now}] {} skipped (no oracle data)", revision.short());
        }
        StepOutcome::CulpritFound(revision) => {
            println!("[{now}] culprit: {revision}");
        }
        StepOutcome::Exhausted(suspects) => {
            println!("[{now}] exhausted with {} suspects", suspects.len());
        }
    }
}
