//! Command-line driver for fstruth.
//!
//! `fstruthctl` builds ground-truth images, runs a parser under test against
//! them and reports the verdicts.  Scenarios come from the built-in catalog
//! or from TOML files.

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use fstruth::{
    adapter::jsonl,
    catalog,
    compare::verify,
    config::HarnessConfig,
    manifest::{Manifest, MANIFEST_NAME},
    scenario::{Harness, Scenario, ScenarioOutcome},
};

/// fstruthctl
#[derive(Debug, Parser)]
#[clap(name = "fstruthctl", version)]
pub struct App {
    /// Harness configuration file
    #[clap(long)]
    config: Option<PathBuf>,
    /// Directory image files are created in
    #[clap(long)]
    work_dir: Option<PathBuf>,
    /// Leave image files and manifests behind
    #[clap(long)]
    keep_images: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the built-in scenarios
    Catalog,
    /// Build a scenario's image and keep it, with its manifest
    Build {
        /// built-in scenario name or path to a scenario file
        scenario: String,
        /// Leave out the big files and use small devices
        #[clap(long)]
        fast: bool,
    },
    /// Build, parse and compare scenarios
    Run {
        /// built-in scenario names or paths to scenario files
        scenarios: Vec<String>,
        /// Run every built-in scenario
        #[clap(long)]
        all: bool,
        /// Leave out the big files and use small devices
        #[clap(long)]
        fast: bool,
        /// Print outcomes as JSON
        #[clap(long)]
        json: bool,
    },
    /// Run the parser against kept images and compare with their manifest
    Verify {
        /// the manifest, or the directory holding it
        manifest: PathBuf,
        /// Print the result as JSON
        #[clap(long)]
        json: bool,
    },
    /// Compare saved parser output (JSON lines) with a manifest, without
    /// running anything
    Compare {
        manifest: PathBuf,
        parsed: PathBuf,
        /// Print the result as JSON
        #[clap(long)]
        json: bool,
    },
}

fn load_config(args: &App) -> Result<HarnessConfig> {
    let mut config = match &args.config {
        Some(path) => HarnessConfig::load(path)?,
        None => HarnessConfig::default(),
    };
    if let Some(work_dir) = &args.work_dir {
        config.work_dir = work_dir.clone();
    }
    config.keep_images |= args.keep_images;
    Ok(config)
}

fn load_scenario(name: &str, fast: bool) -> Result<Scenario> {
    let path = Path::new(name);
    if name.ends_with(".toml") || path.exists() {
        Ok(Scenario::load(path)?)
    } else {
        Ok(catalog::scenario(name, fast)?)
    }
}

fn manifest_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(MANIFEST_NAME)
    } else {
        path.to_path_buf()
    }
}

fn main() -> Result<ExitCode> {
    env_logger::init();

    let args = App::parse();
    let mut config = load_config(&args)?;

    match args.cmd {
        Command::Catalog => {
            for name in catalog::names() {
                let scenario = catalog::scenario(name, false)?;
                println!("{:<20} {:<24} {}", name, scenario.spec, scenario.description);
            }
        }
        Command::Build { scenario, fast } => {
            config.keep_images = true;
            let scenario = load_scenario(&scenario, fast)?;
            let harness = Harness::new(config);
            let built = harness.build(&scenario)?;
            println!("{}", built.store.root().join(MANIFEST_NAME).display());
        }
        Command::Run {
            scenarios,
            all,
            fast,
            json,
        } => {
            let mut selected = scenarios
                .iter()
                .map(|name| load_scenario(name, fast))
                .collect::<Result<Vec<_>>>()?;
            if all {
                selected.extend(catalog::all(fast));
            }
            anyhow::ensure!(!selected.is_empty(), "no scenarios given");

            let harness = Harness::new(config);
            let mut passed = true;
            for scenario in &selected {
                let outcome = harness.run(scenario);
                passed &= outcome.passed();
                print_outcome(&scenario.name, &outcome, json)?;
            }
            if !passed {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Verify { manifest, json } => {
            let path = manifest_path(&manifest);
            let manifest = Manifest::load(&path)?;
            info!("verifying {} from {}", manifest.scenario, path.display());
            let harness = Harness::new(config);
            let outcome = ScenarioOutcome::from_result(harness.verify(&manifest));
            print_outcome(&manifest.scenario, &outcome, json)?;
            if !outcome.passed() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Compare {
            manifest,
            parsed,
            json,
        } => {
            let manifest = Manifest::load(manifest_path(&manifest))?;
            let text = std::fs::read_to_string(&parsed)
                .with_context(|| format!("reading {}", parsed.display()))?;
            let volume = config
                .parser
                .default_volume
                .unwrap_or(manifest.final_kind.top_level_volume());
            let parsed = jsonl::parse_output(&text, volume);
            let harness = Harness::new(config);
            let result = verify(
                &manifest.objects,
                &parsed,
                &harness.policy(&manifest.policy),
            );
            let outcome = ScenarioOutcome::from_result(Ok(result));
            print_outcome(&manifest.scenario, &outcome, json)?;
            if !outcome.passed() {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_outcome(name: &str, outcome: &ScenarioOutcome, json: bool) -> Result<()> {
    if json {
        let mut value = serde_json::to_value(outcome)?;
        value["scenario"] = name.into();
        println!("{value}");
    } else {
        print!("{name}: {outcome}");
    }
    Ok(())
}
