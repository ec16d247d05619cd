//! Harness configuration.
//!
//! The configuration is a TOML file.  Every field has a default, so an empty
//! file (or no file at all) is valid:
//!
//! ```toml
//! work_dir = "/var/tmp/fstruth"
//! keep_images = false
//!
//! [tools]
//! timeout_secs = 600
//! mkfs_btrfs = "/usr/local/sbin/mkfs.btrfs"
//!
//! [parser]
//! backend = "json-lines"
//! command = ["my-parser", "--json", "{image}"]
//! timeout_secs = 300
//!
//! [compare]
//! ignore_directory_size = true
//! pairing = "path"
//! ```

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    compare::{ComparisonPolicy, Field, IgnoreRule, Pairing, TimestampPrecision},
    error::{Error, Result},
};

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("fstruth")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Where per-scenario image directories are created.
    pub work_dir: PathBuf,
    /// Leave image files and manifests behind after each scenario.
    pub keep_images: bool,
    pub tools: ToolsConfig,
    pub parser: ParserConfig,
    pub compare: CompareOverrides,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            work_dir: default_work_dir(),
            keep_images: false,
            tools: ToolsConfig::default(),
            parser: ParserConfig::default(),
            compare: CompareOverrides::default(),
        }
    }
}

impl HarnessConfig {
    /// Parse configuration from TOML content.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: HarnessConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&content).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.tools.timeout_secs == 0 || self.parser.timeout_secs == 0 {
            return Err(Error::Config("timeouts must be at least one second".into()));
        }
        if self.parser.backend == ParserBackendKind::JsonLines && self.parser.command.is_empty() {
            return Err(Error::Config(
                "the json-lines backend needs a parser command".into(),
            ));
        }
        Ok(())
    }
}

/// Locations of the external tools.  Unset tools are looked up in `$PATH`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Upper bound for each formatting/toolchain invocation.
    pub timeout_secs: u64,
    pub mkfs_btrfs: Option<PathBuf>,
    pub mkfs_ext2: Option<PathBuf>,
    pub mkfs_ext3: Option<PathBuf>,
    pub mkfs_ext4: Option<PathBuf>,
    pub btrfs: Option<PathBuf>,
    pub btrfs_convert: Option<PathBuf>,
    pub fls: Option<PathBuf>,
    pub ils: Option<PathBuf>,
    pub icat: Option<PathBuf>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        ToolsConfig {
            timeout_secs: 600,
            mkfs_btrfs: None,
            mkfs_ext2: None,
            mkfs_ext3: None,
            mkfs_ext4: None,
            btrfs: None,
            btrfs_convert: None,
            fls: None,
            ils: None,
            icat: None,
        }
    }
}

impl ToolsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParserBackendKind {
    /// The Sleuth Kit command line tools (`fls`, `ils`, `icat`).
    #[default]
    Sleuthkit,
    /// Any command printing one JSON object per line.
    JsonLines,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    pub backend: ParserBackendKind,
    /// Command line for the json-lines backend.  `{image}` is replaced by the
    /// first image file, a lone `{images}` argument by all of them.
    pub command: Vec<String>,
    /// Upper bound for each parser invocation.
    pub timeout_secs: u64,
    /// Volume assigned to objects when the parser does not report one.
    /// Defaults to the filesystem's top-level volume.
    pub default_volume: Option<u64>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig {
            backend: ParserBackendKind::default(),
            command: vec![],
            timeout_secs: 300,
            default_volume: None,
        }
    }
}

impl ParserConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Settings applied on top of every scenario's own comparison policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompareOverrides {
    pub fields: Option<Vec<Field>>,
    pub ignore_directory_size: Option<bool>,
    pub timestamp_precision: Option<TimestampPrecision>,
    pub pairing: Option<Pairing>,
    /// Appended to the scenario's ignore rules.
    pub ignore: Vec<IgnoreRule>,
}

impl CompareOverrides {
    pub fn apply(&self, policy: &mut ComparisonPolicy) {
        if let Some(fields) = &self.fields {
            policy.fields = fields.iter().copied().collect();
        }
        if let Some(ignore) = self.ignore_directory_size {
            policy.ignore_directory_size = ignore;
        }
        if let Some(precision) = self.timestamp_precision {
            policy.timestamp_precision = precision;
        }
        if let Some(pairing) = self.pairing {
            policy.pairing = pairing;
        }
        policy.ignore.extend(self.ignore.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_empty_config() {
        let config = HarnessConfig::from_toml("").unwrap();
        assert_eq!(config, HarnessConfig::default());
        assert_eq!(config.tools.timeout(), Duration::from_secs(600));
        assert_eq!(config.parser.backend, ParserBackendKind::Sleuthkit);
    }

    #[test]
    fn test_parse_full_config() {
        let config = HarnessConfig::from_toml(
            r#"
work_dir = "/var/tmp/truth"
keep_images = true

[tools]
timeout_secs = 30
mkfs_btrfs = "/opt/btrfs-progs/mkfs.btrfs"

[parser]
backend = "json-lines"
command = ["parse", "--json", "{image}"]
default_volume = 5

[compare]
ignore_directory_size = true
pairing = "path"
ignore = [{ path_prefix = "/lost+found" }]
"#,
        )
        .unwrap();

        assert_eq!(config.work_dir, PathBuf::from("/var/tmp/truth"));
        assert!(config.keep_images);
        assert_eq!(
            config.tools.mkfs_btrfs,
            Some(PathBuf::from("/opt/btrfs-progs/mkfs.btrfs"))
        );
        assert_eq!(config.parser.backend, ParserBackendKind::JsonLines);
        assert_eq!(config.parser.default_volume, Some(5));

        let mut policy = ComparisonPolicy::default();
        config.compare.apply(&mut policy);
        assert!(policy.ignore_directory_size);
        assert_eq!(policy.pairing, Pairing::Path);
        assert!(policy
            .ignore
            .contains(&IgnoreRule::PathPrefix("/lost+found".into())));
    }

    #[test]
    fn test_invalid_configs() {
        assert!(matches!(
            HarnessConfig::from_toml("keep_images = 3"),
            Err(Error::Config(_))
        ));
        assert!(HarnessConfig::from_toml("[parser]\nbackend = \"json-lines\"").is_err());
        assert!(HarnessConfig::from_toml("[tools]\ntimeout_secs = 0").is_err());
    }

    #[test]
    fn test_load_reports_path() {
        let dir = crate::test::tempdir();
        let path = dir.path().join("fstruth.toml");
        std::fs::write(&path, "work_dir = [").unwrap();
        let err = HarnessConfig::load(&path).unwrap_err().to_string();
        assert!(err.contains("fstruth.toml"), "{err}");

        assert!(HarnessConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
