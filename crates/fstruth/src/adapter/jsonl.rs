//! Parsers that print one JSON object per line.
//!
//! Each line describes one object:
//!
//! ```json
//! {"id": 257, "volume": 5, "kind": "directory", "path": "/a", "parent_id": 256}
//! {"id": 258, "kind": "file", "path": "/a/f", "parent_id": 257, "size": 4096,
//!  "sha256": "...", "mtime": {"secs": 1700000000, "nanos": 5}, "status": "live"}
//! {"path": "/b", "error": "corrupt node"}
//! ```
//!
//! Everything is optional.  Timestamps are either whole seconds or a
//! `{secs, nanos}` object.  The entry for `/` identifies the root directory:
//! parent references to it become references to the root, and it is not
//! compared itself.  Entries without `parent_id` get their parent from their
//! path.  A line that is not valid JSON becomes an object carrying only a
//! parse error.

use std::time::Duration;

use log::debug;
use serde::Deserialize;

use super::{link_parents_by_path, parse_failure, ParserBackend};
use crate::{
    error::{Error, Result, ToolError},
    object::{
        ByteRange, ObjectFacts, ObjectKey, ObjectKind, ParentRef, ParsedObject, ParsedStatus,
        Timestamp,
    },
    process::ToolCommand,
    store::ImageSet,
    util::{file_name, normalize_path, parse_sha256},
};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonTime {
    Secs(i64),
    Precise(Timestamp),
}

impl From<JsonTime> for Timestamp {
    fn from(time: JsonTime) -> Self {
        match time {
            JsonTime::Secs(secs) => Timestamp::new(secs, 0),
            JsonTime::Precise(ts) => ts,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Entry {
    id: Option<u64>,
    volume: Option<u64>,
    kind: Option<ObjectKind>,
    path: Option<String>,
    name: Option<String>,
    parent_id: Option<u64>,
    parent_volume: Option<u64>,
    size: Option<u64>,
    sha256: Option<String>,
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    nlink: Option<u64>,
    mtime: Option<JsonTime>,
    atime: Option<JsonTime>,
    ctime: Option<JsonTime>,
    crtime: Option<JsonTime>,
    symlink_target: Option<String>,
    data_ranges: Option<Vec<ByteRange>>,
    status: ParsedStatus,
    error: Option<String>,
}

impl Entry {
    fn into_object(self, default_volume: u64) -> ParsedObject {
        let mut errors = vec![];
        errors.extend(self.error);

        let path = self.path.map(|path| match normalize_path(&path) {
            Ok(normalized) => normalized,
            Err(err) => {
                errors.push(err.to_string());
                path
            }
        });
        let fingerprint = self.sha256.and_then(|digest| match parse_sha256(&digest) {
            Ok(bytes) => Some(hex::encode(bytes)),
            Err(_) => {
                errors.push(format!("invalid sha256 {digest:?}"));
                None
            }
        });

        let volume = self.volume.unwrap_or(default_volume);
        let parent_volume = self.parent_volume.or(self.volume).unwrap_or(default_volume);
        let facts = ObjectFacts {
            kind: self.kind,
            name: self
                .name
                .or_else(|| path.as_deref().map(|p| file_name(p).to_string())),
            parent: self
                .parent_id
                .map(|id| ParentRef::Object(ObjectKey::new(parent_volume, id))),
            path,
            size: self.size,
            fingerprint,
            mode: self.mode.map(|mode| mode & 0o7777),
            uid: self.uid,
            gid: self.gid,
            nlink: self.nlink,
            mtime: self.mtime.map(Timestamp::from),
            atime: self.atime.map(Timestamp::from),
            ctime: self.ctime.map(Timestamp::from),
            crtime: self.crtime.map(Timestamp::from),
            symlink_target: self.symlink_target,
            data_ranges: self.data_ranges,
        };

        ParsedObject {
            key: self.id.map(|id| ObjectKey::new(volume, id)),
            facts,
            status: self.status,
            parse_error: (!errors.is_empty()).then(|| errors.join("; ")),
        }
    }
}

/// Turns the output of a JSON-lines parser into parsed objects.
pub fn parse_output(text: &str, default_volume: u64) -> Vec<ParsedObject> {
    let mut root = None;
    let mut objects = vec![];

    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let object = match serde_json::from_str::<Entry>(line) {
            Ok(entry) => entry.into_object(default_volume),
            Err(err) => {
                objects.push(parse_failure(format!("line {}: {err}", number + 1)));
                continue;
            }
        };
        if object.path() == Some("/") && object.parse_error.is_none() {
            root = object.key;
            continue;
        }
        objects.push(object);
    }

    if let Some(root) = root {
        for object in &mut objects {
            if object.facts.parent == Some(ParentRef::Object(root)) {
                object.facts.parent = Some(ParentRef::Root);
            }
        }
    }
    link_parents_by_path(&mut objects);
    objects
}

/// Any parser command that prints JSON lines on stdout.
#[derive(Debug)]
pub struct JsonLines {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    default_volume: Option<u64>,
}

impl JsonLines {
    /// `command` is a program followed by its arguments.  `{image}` in an
    /// argument is replaced by the first image file; an argument that is
    /// exactly `{images}` expands to all image files.
    pub fn new(command: Vec<String>, timeout: Duration, default_volume: Option<u64>) -> Result<Self> {
        let mut command = command.into_iter();
        let Some(program) = command.next() else {
            return Err(Error::Config(
                "the json-lines backend needs a parser command".into(),
            ));
        };
        Ok(JsonLines {
            program,
            args: command.collect(),
            timeout,
            default_volume,
        })
    }

    fn command(&self, images: &ImageSet) -> Result<ToolCommand> {
        let program = which::which(&self.program).map_err(|_| {
            Error::Adapter(ToolError::NotFound {
                tool: self.program.clone(),
            })
        })?;
        let first = images
            .first()
            .ok_or_else(|| Error::Config("no image files to parse".into()))?
            .to_string_lossy()
            .into_owned();

        let mut command = ToolCommand::new(program, self.timeout);
        for arg in &self.args {
            command = match arg.as_str() {
                "{images}" => command.args(&images.images),
                arg => command.arg(arg.replace("{image}", &first)),
            };
        }
        Ok(command)
    }
}

impl ParserBackend for JsonLines {
    fn name(&self) -> &str {
        &self.program
    }

    fn parse(&self, images: &ImageSet) -> Result<Vec<ParsedObject>> {
        let command = self.command(images)?;
        debug!("parser command: {}", command.command_line());
        let output = command.run().map_err(Error::Adapter)?;

        let volume = self
            .default_volume
            .unwrap_or(images.kind.top_level_volume());
        let mut objects = parse_output(&output.stdout_text(), volume);
        if !output.success() {
            objects.push(parse_failure(format!(
                "{} exited with status {}: {}",
                command.name(),
                output.status,
                output.diagnostic().trim()
            )));
        }
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{spec::FsKind, test::tempdir};

    const SHA: &str = "2CF24DBA5FB0A30E26E83B2AC5B9E29E1B161E5C1FA7425E73043362938B9824";

    #[test]
    fn test_parse_output() {
        let text = format!(
            r#"{{"id": 256, "kind": "directory", "path": "/"}}
{{"id": 257, "kind": "directory", "path": "/a/", "parent_id": 256}}
{{"id": 258, "kind": "file", "path": "/a/f", "size": 5, "sha256": "{SHA}", "mode": 33188, "mtime": 10, "atime": {{"secs": 11, "nanos": 7}}}}

{{"id": 259, "volume": 258, "kind": "file", "path": "/a/g", "sha256": "xyz", "status": "deleted"}}
{{"path": "/b", "error": "corrupt node"}}
not json
"#
        );
        let objects = parse_output(&text, 5);
        assert_eq!(objects.len(), 5);

        let dir = &objects[0];
        assert_eq!(dir.key, Some(ObjectKey::new(5, 257)));
        assert_eq!(dir.path(), Some("/a"));
        assert_eq!(dir.facts.name.as_deref(), Some("a"));
        assert_eq!(dir.facts.parent, Some(ParentRef::Root));

        let file = &objects[1];
        assert_eq!(file.facts.parent, Some(ParentRef::Object(ObjectKey::new(5, 257))));
        assert_eq!(file.facts.fingerprint, Some(SHA.to_lowercase()));
        assert_eq!(file.facts.mode, Some(0o644));
        assert_eq!(file.facts.mtime, Some(Timestamp::new(10, 0)));
        assert_eq!(file.facts.atime, Some(Timestamp::new(11, 7)));
        assert_eq!(file.parse_error, None);

        let deleted = &objects[2];
        assert_eq!(deleted.key, Some(ObjectKey::new(258, 259)));
        assert_eq!(deleted.status, ParsedStatus::Deleted);
        assert_eq!(deleted.facts.fingerprint, None);
        assert_eq!(deleted.parse_error.as_deref(), Some("invalid sha256 \"xyz\""));

        assert_eq!(objects[3].parse_error.as_deref(), Some("corrupt node"));
        assert_eq!(objects[3].facts.parent, Some(ParentRef::Root));
        assert!(objects[4].parse_error.as_deref().unwrap().starts_with("line 7:"));
    }

    #[test]
    fn test_run_command() {
        let dir = tempdir();
        let image = dir.path().join("test.img");
        std::fs::write(&image, "{\"id\": 300, \"path\": \"/x\"}\n").unwrap();

        // the "image" is the parser's output; exits non-zero after printing it
        let backend = JsonLines::new(
            vec!["sh".into(), "-c".into(), "cat \"$0\"; echo oops >&2; exit 2".into(), "{image}".into()],
            Duration::from_secs(10),
            None,
        )
        .unwrap();
        let objects = backend
            .parse(&ImageSet::new(vec![image], FsKind::Ext4))
            .unwrap();

        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].key, Some(ObjectKey::new(0, 300)));
        assert_eq!(
            objects[1].parse_error.as_deref(),
            Some("sh exited with status 2: oops")
        );
    }

    #[test]
    fn test_missing_parser() {
        let backend = JsonLines::new(
            vec!["/nonexistent/parser".into()],
            Duration::from_secs(1),
            None,
        )
        .unwrap();
        let images = ImageSet::new(vec!["/dev/null".into()], FsKind::Btrfs);
        let err = backend.parse(&images).unwrap_err();
        assert!(err.is_parser_failure(), "{err}");

        assert!(JsonLines::new(vec![], Duration::from_secs(1), None).is_err());
    }
}
