//! Object records shared by the ground truth and the parser output.
//!
//! Both sides describe filesystem objects with the same [`ObjectFacts`], so
//! the comparator can look at them field by field.  Every fact is optional:
//! ground truth leaves out what is not deterministic, and parsers leave out
//! what they do not report.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identity of an object: inode number plus the volume it lives in.
///
/// On btrfs the volume is the subvolume id; filesystems without volumes use 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub volume: u64,
    pub id: u64,
}

impl ObjectKey {
    pub fn new(volume: u64, id: u64) -> Self {
        ObjectKey { volume, id }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.volume, self.id)
    }
}

/// Non-owning reference to an object's parent directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentRef {
    /// The filesystem root (the top of the mounted image).
    Root,
    /// Another recorded object.
    Object(ObjectKey),
}

impl ParentRef {
    /// Compares two references by inode number only, ignoring volumes.
    ///
    /// Used when the parser does not expose volume membership.
    pub fn same_inode(&self, other: &ParentRef) -> bool {
        match (self, other) {
            (ParentRef::Root, ParentRef::Root) => true,
            (ParentRef::Object(a), ParentRef::Object(b)) => a.id == b.id,
            _ => false,
        }
    }
}

impl fmt::Display for ParentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParentRef::Root => f.write_str("root"),
            ParentRef::Object(key) => key.fmt(f),
        }
    }
}

/// What kind of object an entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    File,
    Directory,
    Symlink,
    SubvolumeRoot,
    Fifo,
    Socket,
    BlockDevice,
    CharDevice,
}

impl ObjectKind {
    /// Maps the file type bits of `st_mode`.
    pub fn from_mode(mode: u32) -> Option<ObjectKind> {
        match mode & 0o170000 {
            0o100000 => Some(ObjectKind::File),
            0o040000 => Some(ObjectKind::Directory),
            0o120000 => Some(ObjectKind::Symlink),
            0o010000 => Some(ObjectKind::Fifo),
            0o140000 => Some(ObjectKind::Socket),
            0o060000 => Some(ObjectKind::BlockDevice),
            0o020000 => Some(ObjectKind::CharDevice),
            _ => None,
        }
    }

    /// Directories and subvolume roots can have children.
    pub fn is_container(&self) -> bool {
        matches!(self, ObjectKind::Directory | ObjectKind::SubvolumeRoot)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::File => "file",
            ObjectKind::Directory => "directory",
            ObjectKind::Symlink => "symlink",
            ObjectKind::SubvolumeRoot => "subvolume_root",
            ObjectKind::Fifo => "fifo",
            ObjectKind::Socket => "socket",
            ObjectKind::BlockDevice => "block_device",
            ObjectKind::CharDevice => "char_device",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point in time with nanosecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub secs: i64,
    #[serde(default)]
    pub nanos: u32,
}

impl Timestamp {
    pub fn new(secs: i64, nanos: u32) -> Self {
        Timestamp { secs, nanos }
    }

    /// Drops the sub-second part.
    pub fn whole_seconds(self) -> Self {
        Timestamp {
            secs: self.secs,
            nanos: 0,
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

/// A logical byte range of a file that holds data (as opposed to a hole).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
}

impl ByteRange {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.offset, self.len)
    }
}

/// The comparable facts about one object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectFacts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ObjectKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Absolute path inside the image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Lowercase hex SHA-256 of the content, for regular files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Permission bits (`0o7777` mask), without the file type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nlink: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtime: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atime: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctime: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crtime: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symlink_target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_ranges: Option<Vec<ByteRange>>,
}

/// Why a deleted object was deleted, and so what a parser should report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteIntent {
    /// The object must be gone (or at least flagged as deleted).
    #[default]
    HardDelete,
    /// The object must still be recoverable as an orphan.
    OrphanRecoverable,
}

/// Lifecycle state of a ground truth record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruthStatus {
    Live,
    Deleted { intent: DeleteIntent, at_step: usize },
}

impl TruthStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, TruthStatus::Live)
    }
}

/// The expected state of one object, as recorded while building the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundTruthObject {
    /// Identity read back from the live filesystem.
    pub key: ObjectKey,
    pub facts: ObjectFacts,
    pub status: TruthStatus,
    /// Index of the step that created the object.
    pub created_at: usize,
    /// Whether mtime/atime were set explicitly and are therefore reproducible.
    #[serde(default)]
    pub timestamps_pinned: bool,
}

impl GroundTruthObject {
    pub fn live(key: ObjectKey, facts: ObjectFacts, created_at: usize) -> Self {
        GroundTruthObject {
            key,
            facts,
            status: TruthStatus::Live,
            created_at,
            timestamps_pinned: false,
        }
    }

    pub fn path(&self) -> &str {
        self.facts.path.as_deref().unwrap_or("")
    }

    pub fn kind(&self) -> Option<ObjectKind> {
        self.facts.kind
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }
}

/// How the parser classified an object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParsedStatus {
    #[default]
    Live,
    /// Reported, but flagged as deleted.
    Deleted,
    /// Reported under an orphan / lost-and-found classification.
    Orphan,
}

impl fmt::Display for ParsedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ParsedStatus::Live => "live",
            ParsedStatus::Deleted => "deleted",
            ParsedStatus::Orphan => "orphan",
        })
    }
}

/// One object as reported by the parser under test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<ObjectKey>,
    #[serde(default)]
    pub facts: ObjectFacts,
    #[serde(default)]
    pub status: ParsedStatus,
    /// A problem the parser reported for this object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl ParsedObject {
    pub fn path(&self) -> Option<&str> {
        self.facts.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_kind_from_mode() {
        assert_eq!(ObjectKind::from_mode(0o100644), Some(ObjectKind::File));
        assert_eq!(ObjectKind::from_mode(0o040755), Some(ObjectKind::Directory));
        assert_eq!(ObjectKind::from_mode(0o120777), Some(ObjectKind::Symlink));
        assert_eq!(ObjectKind::from_mode(0o010644), Some(ObjectKind::Fifo));
        assert_eq!(ObjectKind::from_mode(0o140755), Some(ObjectKind::Socket));
        assert_eq!(ObjectKind::from_mode(0o060600), Some(ObjectKind::BlockDevice));
        assert_eq!(ObjectKind::from_mode(0o020600), Some(ObjectKind::CharDevice));
        assert_eq!(ObjectKind::from_mode(0o644), None);
    }

    #[test]
    fn test_parent_same_inode() {
        let a = ParentRef::Object(ObjectKey::new(5, 257));
        let b = ParentRef::Object(ObjectKey::new(258, 257));
        assert!(a.same_inode(&b));
        assert!(a != b);
        assert!(!a.same_inode(&ParentRef::Root));
        assert!(ParentRef::Root.same_inode(&ParentRef::Root));
    }

    #[test]
    fn test_facts_serialization_skips_unknowns() {
        let facts = ObjectFacts {
            kind: Some(ObjectKind::File),
            size: Some(10),
            ..Default::default()
        };
        let json = serde_json::to_string(&facts).unwrap();
        assert_eq!(json, r#"{"kind":"file","size":10}"#);

        let back: ObjectFacts = serde_json::from_str(&json).unwrap();
        assert_eq!(back, facts);
    }

    #[test]
    fn test_timestamp_display() {
        assert_eq!(Timestamp::new(12, 5).to_string(), "12.000000005");
        assert_eq!(Timestamp::new(12, 5).whole_seconds(), Timestamp::new(12, 0));
    }
}
