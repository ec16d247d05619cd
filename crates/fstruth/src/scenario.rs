//! Scenarios and the harness that runs them.
//!
//! A [`Scenario`] names a filesystem, the steps that populate it, and the
//! policy used to judge the parser.  Scenario files are TOML:
//!
//! ```toml
//! name = "hard_delete"
//!
//! [spec]
//! kind = "ext4"
//! device_size = 67108864
//!
//! [[steps]]
//! op = "create_file"
//! path = "/x"
//! size = 10
//!
//! [[steps]]
//! op = "delete"
//! path = "/x"
//!
//! [policy]
//! ignore = [{ name_prefix = "lost+found" }]
//! ```
//!
//! [`Harness::run`] builds the image, runs the parser and compares, and
//! always ends in one of three [`ScenarioOutcome`]s.

use std::{fmt, path::Path};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    adapter::ParserAdapter,
    builder::{BuiltImage, Builder},
    compare::{verify, ComparisonPolicy, TestResult},
    config::HarnessConfig,
    error::{Error, Result},
    manifest::{Manifest, MANIFEST_NAME},
    spec::FilesystemSpec,
    step::ConstructionStep,
    toolchain::Toolchain,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub spec: FilesystemSpec,
    #[serde(default)]
    pub steps: Vec<ConstructionStep>,
    #[serde(default)]
    pub policy: ComparisonPolicy,
}

impl Scenario {
    pub fn from_toml(content: &str) -> Result<Self> {
        let scenario: Scenario =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    /// Checks the scenario can be built at all, without building it.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("scenario without a name".into()));
        }
        Builder::check(&self.spec, &self.steps)
    }
}

/// How a scenario ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScenarioOutcome {
    Passed {
        result: TestResult,
    },
    Failed {
        result: TestResult,
    },
    /// No verdict: either the tooling could not build the image or the
    /// parser could not be run.
    CouldNotRun {
        error: String,
        parser_failure: bool,
    },
}

impl ScenarioOutcome {
    pub fn from_result(result: Result<TestResult>) -> Self {
        match result {
            Ok(result) if result.passed => ScenarioOutcome::Passed { result },
            Ok(result) => ScenarioOutcome::Failed { result },
            Err(err) => ScenarioOutcome::CouldNotRun {
                parser_failure: err.is_parser_failure(),
                error: err.to_string(),
            },
        }
    }

    pub fn passed(&self) -> bool {
        matches!(self, ScenarioOutcome::Passed { .. })
    }
}

impl fmt::Display for ScenarioOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioOutcome::Passed { result } | ScenarioOutcome::Failed { result } => {
                result.fmt(f)
            }
            ScenarioOutcome::CouldNotRun {
                error,
                parser_failure: true,
            } => writeln!(f, "COULD NOT RUN (parser): {error}"),
            ScenarioOutcome::CouldNotRun { error, .. } => {
                writeln!(f, "COULD NOT RUN (tooling): {error}")
            }
        }
    }
}

/// Runs scenarios with one configuration and toolchain.
#[derive(Debug)]
pub struct Harness {
    config: HarnessConfig,
    toolchain: Toolchain,
}

impl Harness {
    /// Resolves the toolchain from the configuration.
    pub fn new(config: HarnessConfig) -> Self {
        let toolchain = Toolchain::resolve(&config.tools);
        Harness { config, toolchain }
    }

    pub fn with_toolchain(config: HarnessConfig, toolchain: Toolchain) -> Self {
        Harness { config, toolchain }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    /// The scenario's policy with the configured overrides applied.
    pub fn policy(&self, policy: &ComparisonPolicy) -> ComparisonPolicy {
        let mut policy = policy.clone();
        self.config.compare.apply(&mut policy);
        policy
    }

    /// Builds the scenario's image.  With `keep_images` set, a manifest is
    /// written next to the images.
    pub fn build(&self, scenario: &Scenario) -> Result<BuiltImage> {
        scenario.validate()?;
        let missing = self.toolchain.missing_for(&scenario.spec, &scenario.steps);
        if !missing.is_empty() {
            let names: Vec<_> = missing.iter().map(|tool| tool.program()).collect();
            return Err(Error::Config(format!(
                "missing tools for {}: {}",
                scenario.name,
                names.join(", ")
            )));
        }

        let built = Builder::from_config(&self.config, &self.toolchain).build(
            &scenario.name,
            &scenario.spec,
            &scenario.steps,
        )?;
        if self.config.keep_images {
            Manifest::new(scenario, &built)?.write(built.store.root().join(MANIFEST_NAME))?;
        }
        Ok(built)
    }

    /// Builds, parses and compares, propagating errors.
    pub fn try_run(&self, scenario: &Scenario) -> Result<TestResult> {
        let adapter = ParserAdapter::from_config(&self.config.parser, &self.toolchain)?;
        let built = self.build(scenario)?;
        let parsed = adapter.run(&built.image_set()?)?;
        let result = verify(built.truth.current(), &parsed, &self.policy(&scenario.policy));
        // dropping the image releases the store
        drop(built);
        Ok(result)
    }

    /// Runs one scenario to a verdict, or to a "could not run" outcome.
    pub fn run(&self, scenario: &Scenario) -> ScenarioOutcome {
        info!("scenario {}", scenario.name);
        let outcome = ScenarioOutcome::from_result(self.try_run(scenario));
        match &outcome {
            ScenarioOutcome::Passed { .. } => info!("{}: passed", scenario.name),
            ScenarioOutcome::Failed { result } => warn!(
                "{}: failed with {} differing objects",
                scenario.name,
                result.failures.len()
            ),
            ScenarioOutcome::CouldNotRun { error, .. } => {
                warn!("{}: could not run: {error}", scenario.name)
            }
        }
        outcome
    }

    /// Runs the parser against kept images and compares with their manifest.
    pub fn verify(&self, manifest: &Manifest) -> Result<TestResult> {
        manifest.check_images()?;
        let adapter = ParserAdapter::from_config(&self.config.parser, &self.toolchain)?;
        let parsed = adapter.run(&manifest.image_set())?;
        Ok(verify(&manifest.objects, &parsed, &self.policy(&manifest.policy)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        compare::IgnoreRule,
        error::ToolError,
        object::DeleteIntent,
        spec::FsKind,
        toolchain::Tool,
    };

    const HARD_DELETE: &str = r#"
name = "hard_delete"

[spec]
kind = "ext4"
device_size = 67108864

[[steps]]
op = "create_file"
path = "/x"
size = 10

[[steps]]
op = "delete"
path = "/x"

[policy]
ignore = [{ name_prefix = "lost+found" }]
"#;

    #[test]
    fn test_parse_scenario() {
        let scenario = Scenario::from_toml(HARD_DELETE).unwrap();
        assert_eq!(scenario.spec.kind, FsKind::Ext4);
        assert_eq!(scenario.spec.device_size, 64 * 1024 * 1024);
        assert_eq!(scenario.steps.len(), 2);
        assert_eq!(
            scenario.steps[1],
            ConstructionStep::Delete {
                path: "/x".into(),
                intent: DeleteIntent::HardDelete
            }
        );
        assert_eq!(
            scenario.policy.ignore,
            vec![IgnoreRule::NamePrefix("lost+found".into())]
        );
        assert!(scenario.policy.lenient_subvolume_kind);
    }

    #[test]
    fn test_invalid_scenarios() {
        assert!(Scenario::from_toml("name = \"\"").is_err());
        let ext_subvolume = r#"
name = "bad"
[spec]
kind = "ext4"
[[steps]]
op = "create_subvolume"
path = "/s"
"#;
        assert!(matches!(
            Scenario::from_toml(ext_subvolume),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_missing_tools_could_not_run() {
        let dir = crate::test::tempdir();
        let config = HarnessConfig {
            work_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let harness = Harness::with_toolchain(
            config,
            Toolchain::with_tools(
                [(Tool::Fls, "/bin/true".into())],
                Duration::from_secs(1),
            ),
        );
        let outcome = harness.run(&Scenario::from_toml(HARD_DELETE).unwrap());
        match &outcome {
            ScenarioOutcome::CouldNotRun {
                error,
                parser_failure,
            } => {
                assert!(error.contains("mkfs.ext4"), "{error}");
                assert!(!parser_failure);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!outcome.passed());
        assert!(outcome.to_string().starts_with("COULD NOT RUN (tooling)"));
        // nothing left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_outcome_classification() {
        let outcome = ScenarioOutcome::from_result(Err(Error::Adapter(ToolError::NotFound {
            tool: "fls".into(),
        })));
        assert_eq!(
            outcome,
            ScenarioOutcome::CouldNotRun {
                error: "parser under test could not be run: fls: executable not found".into(),
                parser_failure: true,
            }
        );
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "could_not_run");
    }

    #[test]
    fn test_policy_overrides() {
        let mut config = HarnessConfig::default();
        config.compare.ignore_directory_size = Some(true);
        let harness = Harness::with_toolchain(
            config,
            Toolchain::with_tools(std::iter::empty(), Duration::from_secs(1)),
        );
        let policy = harness.policy(&ComparisonPolicy::default());
        assert!(policy.ignore_directory_size);
    }
}
