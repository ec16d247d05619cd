//! Running the parser under test.
//!
//! A [`ParserAdapter`] invokes an external parser against the image files of
//! a detached store and maps whatever it prints onto [`ParsedObject`]s.  The
//! parser is untrusted: each invocation is bounded by a timeout, and problems
//! it reports for single objects are carried along as `parse_error` markers
//! instead of failing the run.  Only a parser that cannot be run at all
//! yields [`Error::Adapter`].

pub mod jsonl;
pub mod sleuthkit;

use std::{collections::HashMap, fmt};

use log::{debug, info};

use crate::{
    config::{ParserBackendKind, ParserConfig},
    error::{Error, Result},
    object::{ObjectKey, ParentRef, ParsedObject, ParsedStatus},
    spec::FsKind,
    store::{BackingStore, ImageSet},
    toolchain::Toolchain,
    util::parent_path,
};

pub use jsonl::JsonLines;
pub use sleuthkit::Sleuthkit;

/// One way of running a parser and understanding its output.
pub trait ParserBackend: fmt::Debug {
    fn name(&self) -> &str;

    /// Lists every object the parser finds in `images`.
    fn parse(&self, images: &ImageSet) -> Result<Vec<ParsedObject>>;
}

#[derive(Debug)]
pub struct ParserAdapter {
    backend: Box<dyn ParserBackend>,
}

impl ParserAdapter {
    pub fn new(backend: impl ParserBackend + 'static) -> Self {
        ParserAdapter {
            backend: Box::new(backend),
        }
    }

    /// Sets up the backend selected in the configuration.
    pub fn from_config(config: &ParserConfig, toolchain: &Toolchain) -> Result<Self> {
        Ok(match config.backend {
            ParserBackendKind::Sleuthkit => Self::new(Sleuthkit::new(
                toolchain,
                config.timeout(),
                config.default_volume,
            )),
            ParserBackendKind::JsonLines => Self::new(JsonLines::new(
                config.command.clone(),
                config.timeout(),
                config.default_volume,
            )?),
        })
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    /// Runs the parser against finished image files.
    pub fn run(&self, images: &ImageSet) -> Result<Vec<ParsedObject>> {
        if images.images.is_empty() {
            return Err(Error::Config("no image files to parse".into()));
        }
        for image in &images.images {
            if !image.is_file() {
                return Err(Error::Config(format!(
                    "image {} does not exist",
                    image.display()
                )));
            }
        }

        info!(
            "running {} on {} image(s) of {}",
            self.name(),
            images.images.len(),
            images.kind
        );
        let objects = self.backend.parse(images)?;
        let errors = objects.iter().filter(|o| o.parse_error.is_some()).count();
        info!("{} reported {} objects, {errors} with errors", self.name(), objects.len());
        Ok(objects)
    }

    /// Runs the parser against the images of `store`, which must be detached.
    pub fn run_store(&self, store: &BackingStore, kind: FsKind) -> Result<Vec<ParsedObject>> {
        self.run(&store.image_set(kind)?)
    }
}

/// An object standing for a problem the parser reported about no object in
/// particular.
pub(crate) fn parse_failure(message: impl Into<String>) -> ParsedObject {
    ParsedObject {
        parse_error: Some(message.into()),
        ..Default::default()
    }
}

/// Fills in missing parent references by looking up the parent path among
/// the live containers the parser reported.
pub(crate) fn link_parents_by_path(objects: &mut [ParsedObject]) {
    let containers: HashMap<String, ObjectKey> = objects
        .iter()
        .filter(|o| o.status == ParsedStatus::Live)
        .filter(|o| o.facts.kind.is_some_and(|k| k.is_container()))
        .filter_map(|o| Some((o.path()?.to_string(), o.key?)))
        .collect();

    for object in objects.iter_mut() {
        if object.facts.parent.is_some() {
            continue;
        }
        let Some(path) = object.path() else {
            continue;
        };
        if path == "/" {
            continue;
        }
        let parent = match parent_path(path) {
            "/" => Some(ParentRef::Root),
            dir => containers.get(dir).copied().map(ParentRef::Object),
        };
        if parent.is_none() {
            debug!("no parent directory reported for {path}");
        }
        object.facts.parent = parent;
    }
}
