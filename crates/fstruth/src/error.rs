//! Error types for fstruth.
//!
//! Every fallible public operation returns [`Result<T>`], an alias for
//! `Result<T, Error>`.  The variants follow the life of a scenario:
//!
//! - **Building the image**: [`Allocation`], [`Format`], [`Mount`],
//!   [`Construction`], [`InvalidGroundTruth`]
//! - **Running the parser**: [`Adapter`], [`NotDetached`]
//! - **Setup**: [`Config`], [`Io`]
//!
//! Mismatches between the parser and the ground truth are not errors; they
//! are reported as [`crate::compare::Verdict`]s.
//!
//! [`Allocation`]: Error::Allocation
//! [`Format`]: Error::Format
//! [`Mount`]: Error::Mount
//! [`Construction`]: Error::Construction
//! [`InvalidGroundTruth`]: Error::InvalidGroundTruth
//! [`Adapter`]: Error::Adapter
//! [`NotDetached`]: Error::NotDetached
//! [`Config`]: Error::Config
//! [`Io`]: Error::Io

use std::path::PathBuf;

use crate::store::StoreState;

/// Result type alias for operations that may return an [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that end a scenario without a verdict.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Backing storage could not be allocated or exclusively attached.
    #[error("cannot allocate backing storage: {0}")]
    Allocation(String),

    /// The formatting toolchain rejected the filesystem profile.  The
    /// diagnostic is the tool's own output, unmodified.
    #[error("formatting failed: {diagnostic}")]
    Format {
        /// Output of the formatting tool.
        diagnostic: String,
    },

    /// The formatted image could not be mounted or unmounted.
    #[error("cannot (un)mount {}: {source}", target.display())]
    Mount {
        /// The mount point.
        target: PathBuf,
        /// The underlying error, including kernel log messages if any.
        #[source]
        source: std::io::Error,
    },

    /// A construction step failed; the remaining steps were not applied.
    #[error("construction step {index} ({step}) failed: {cause}")]
    Construction {
        /// Zero-based position of the step in the sequence.
        index: usize,
        /// Human readable rendering of the step.
        step: String,
        /// The full cause chain.
        cause: String,
    },

    /// A step produced a fact that contradicts what is already recorded.
    /// This is a bug in the scenario, not in the parser.
    #[error("invalid ground truth: {0}")]
    InvalidGroundTruth(String),

    /// The parser under test could not be invoked at all.
    #[error("parser under test could not be run: {0}")]
    Adapter(#[source] ToolError),

    /// The operation needs a detached store; in particular the parser may
    /// only be run against an image nobody has mounted or attached.
    #[error("backing store is {0}, expected it to be detached")]
    NotDetached(StoreState),

    /// Configuration, scenario or manifest file is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error outside of any construction step.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the scenario could not run because of the parser under test,
    /// as opposed to the tooling that builds the image.
    pub fn is_parser_failure(&self) -> bool {
        matches!(self, Error::Adapter(_))
    }
}

/// Failure to run an external tool to completion.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The executable is not installed or not configured.
    #[error("{tool}: executable not found")]
    NotFound {
        /// Tool name.
        tool: String,
    },

    /// The process could not be started.
    #[error("{tool}: cannot spawn: {source}")]
    Spawn {
        /// Tool name.
        tool: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The process did not finish in time and was killed.
    #[error("{tool}: timed out after {secs}s")]
    TimedOut {
        /// Tool name.
        tool: String,
        /// The timeout that expired.
        secs: u64,
    },

    /// The process exited with a non-zero status.
    #[error("{tool}: exited with status {status}: {diagnostic}")]
    Failed {
        /// Tool name.
        tool: String,
        /// Exit status.
        status: i32,
        /// What the tool printed on stderr (or stdout, if stderr was empty).
        diagnostic: String,
    },

    /// The process was killed by a signal.
    #[error("{tool}: killed by signal {signal}")]
    Crashed {
        /// Tool name.
        tool: String,
        /// The signal number.
        signal: i32,
    },
}

impl ToolError {
    /// The diagnostic text to surface as a [`Error::Format`].
    pub fn diagnostic(&self) -> String {
        match self {
            ToolError::Failed { diagnostic, .. } => diagnostic.clone(),
            other => other.to_string(),
        }
    }
}
