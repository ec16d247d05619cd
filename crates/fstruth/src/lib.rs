//! Ground-truth test images for forensic filesystem parsers.
//!
//! `fstruth` builds filesystem images whose contents are known exactly, because
//! it created them, and checks whether a parser under test reports the same
//! structure.  A run goes through five stages:
//!
//! 1. a [`store::BackingStore`] allocates sparse image files and attaches them
//!    to loop devices;
//! 2. the [`builder::Builder`] formats and mounts them, applying an
//!    ordered list of [`step::ConstructionStep`]s;
//! 3. every step contributes facts, read back from the live mount, to the
//!    [`truth::GroundTruth`] recorder;
//! 4. once the image is unmounted and detached, the [`adapter::ParserAdapter`]
//!    runs the parser and normalizes its output into [`object::ParsedObject`]s;
//! 5. [`compare::compare`] pairs both sets and produces per-object
//!    [`compare::Verdict`]s, which [`compare::summarize`] folds into a
//!    [`compare::TestResult`].
//!
//! [`scenario::Harness`] strings these together, and [`catalog`] provides the
//! built-in scenarios.

pub mod adapter;
pub mod builder;
pub mod catalog;
pub mod compare;
pub mod config;
pub mod content;
pub mod error;
pub mod manifest;
pub mod object;
pub mod pattern;
pub mod process;
pub mod scenario;
pub mod spec;
pub mod step;
pub mod store;
pub mod toolchain;
pub mod truth;
pub mod util;


pub use error::{Error, Result};

/// Chunk size used when streaming file contents through a hasher or onto disk.
pub const IO_CHUNK: usize = 64 * 1024;
