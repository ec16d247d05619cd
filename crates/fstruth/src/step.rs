//! Construction steps.
//!
//! A scenario is an ordered list of [`ConstructionStep`]s.  Order matters:
//! later steps refer to objects created by earlier ones by path.  Paths are
//! absolute inside the image; `/` is the root of the mounted filesystem.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    object::{DeleteIntent, Timestamp},
    pattern::Pattern,
};

/// Name of the marker file at the end of a directory chain.
pub const DIRECTORY_CHAIN_MARKER: &str = "EOD";
/// Name of the marker file at the end of a subvolume chain.
pub const SUBVOLUME_CHAIN_MARKER: &str = "EOS";
/// Size of chain marker files.
pub const CHAIN_MARKER_SIZE: u64 = 100;
/// Most chunks a fragmented file may be written in.
pub const MAX_FRAGMENTS: u64 = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Fifo,
    Socket,
    BlockDevice,
    CharDevice,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Fifo => "fifo",
            NodeKind::Socket => "socket",
            NodeKind::BlockDevice => "block device",
            NodeKind::CharDevice => "char device",
        }
    }
}

/// Order in which the chunks of a fragmented file are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentLayout {
    /// Even chunks first, then odd ones, syncing after each.
    #[default]
    Interleaved,
    /// Last chunk first, syncing after each.
    Reverse,
    /// Only even chunks; odd chunks stay holes.
    Sparse,
}

impl FragmentLayout {
    /// Chunk indices in write order, for `count` chunks.
    pub fn order(&self, count: u64) -> Box<dyn Iterator<Item = u64>> {
        match self {
            FragmentLayout::Interleaved => {
                Box::new((0..count).step_by(2).chain((1..count).step_by(2)))
            }
            FragmentLayout::Reverse => Box::new((0..count).rev()),
            FragmentLayout::Sparse => Box::new((0..count).step_by(2)),
        }
    }
}

fn yes() -> bool {
    true
}

fn default_node_mode() -> u32 {
    0o600
}

fn directory_marker() -> String {
    DIRECTORY_CHAIN_MARKER.into()
}

fn subvolume_marker() -> String {
    SUBVOLUME_CHAIN_MARKER.into()
}

/// An atomic action against the mounted filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum ConstructionStep {
    /// Write `size` bytes of `pattern` to a new regular file.
    CreateFile {
        path: String,
        size: u64,
        #[serde(default)]
        pattern: Pattern,
    },
    CreateDirectory {
        path: String,
    },
    /// `path`, then `depth - 1` more directories of the same name nested
    /// inside it, then a marker file in the innermost one.
    CreateDirectoryChain {
        path: String,
        depth: usize,
        #[serde(default = "directory_marker")]
        marker: String,
    },
    CreateSubvolume {
        path: String,
    },
    /// Like [`ConstructionStep::CreateDirectoryChain`], with subvolumes.
    CreateSubvolumeChain {
        path: String,
        depth: usize,
        #[serde(default = "subvolume_marker")]
        marker: String,
    },
    /// Snapshot the subvolume at `source` (`/` for the top level) to `path`.
    CreateSnapshot {
        source: String,
        path: String,
        #[serde(default = "yes")]
        writable: bool,
    },
    Delete {
        path: String,
        #[serde(default)]
        intent: DeleteIntent,
    },
    /// A second name for the existing file `target`.
    CreateHardlink {
        path: String,
        target: String,
    },
    /// A symbolic link to `target`, stored verbatim.
    CreateSymlink {
        path: String,
        target: String,
    },
    CreateNode {
        path: String,
        node: NodeKind,
        #[serde(default = "default_node_mode")]
        mode: u32,
        #[serde(default)]
        major: u32,
        #[serde(default)]
        minor: u32,
    },
    /// A copy of `source` that shares its data extents.
    CreateReflink {
        path: String,
        source: String,
    },
    /// Extend a file by `len` bytes, starting the pattern from its beginning.
    Append {
        path: String,
        len: u64,
        #[serde(default)]
        pattern: Pattern,
    },
    /// Overwrite `len` bytes at `offset` with the pattern bytes found at the
    /// same offset of the pattern stream.
    WriteAt {
        path: String,
        offset: u64,
        len: u64,
        #[serde(default)]
        pattern: Pattern,
    },
    Truncate {
        path: String,
        size: u64,
    },
    /// A new file of `count` chunks, written out of order so the allocator
    /// cannot lay it out contiguously.
    CreateFragmentedFile {
        path: String,
        chunk: u64,
        count: u64,
        #[serde(default)]
        layout: FragmentLayout,
        #[serde(default)]
        pattern: Pattern,
    },
    /// Pins modification and access times.
    SetTimes {
        path: String,
        mtime: Timestamp,
        atime: Timestamp,
    },
    /// Changes ownership of `path`, and with `recursive` of everything
    /// below it too.
    SetOwner {
        path: String,
        uid: u32,
        gid: u32,
        #[serde(default)]
        recursive: bool,
    },
    SetMode {
        path: String,
        mode: u32,
    },
    /// Unmount, convert the ext filesystem to btrfs in place (with the
    /// standard btrfs features), and remount.
    ConvertToBtrfs,
}

impl ConstructionStep {
    /// The operation name, as used in scenario files.
    pub fn op(&self) -> &'static str {
        match self {
            ConstructionStep::CreateFile { .. } => "create_file",
            ConstructionStep::CreateDirectory { .. } => "create_directory",
            ConstructionStep::CreateDirectoryChain { .. } => "create_directory_chain",
            ConstructionStep::CreateSubvolume { .. } => "create_subvolume",
            ConstructionStep::CreateSubvolumeChain { .. } => "create_subvolume_chain",
            ConstructionStep::CreateSnapshot { .. } => "create_snapshot",
            ConstructionStep::Delete { .. } => "delete",
            ConstructionStep::CreateHardlink { .. } => "create_hardlink",
            ConstructionStep::CreateSymlink { .. } => "create_symlink",
            ConstructionStep::CreateNode { .. } => "create_node",
            ConstructionStep::CreateReflink { .. } => "create_reflink",
            ConstructionStep::Append { .. } => "append",
            ConstructionStep::WriteAt { .. } => "write_at",
            ConstructionStep::Truncate { .. } => "truncate",
            ConstructionStep::CreateFragmentedFile { .. } => "create_fragmented_file",
            ConstructionStep::SetTimes { .. } => "set_times",
            ConstructionStep::SetOwner { .. } => "set_owner",
            ConstructionStep::SetMode { .. } => "set_mode",
            ConstructionStep::ConvertToBtrfs => "convert_to_btrfs",
        }
    }

    /// Whether the step only makes sense on btrfs.
    pub fn needs_btrfs(&self) -> bool {
        matches!(
            self,
            ConstructionStep::CreateSubvolume { .. }
                | ConstructionStep::CreateSubvolumeChain { .. }
                | ConstructionStep::CreateSnapshot { .. }
                | ConstructionStep::CreateReflink { .. }
        )
    }
}

impl fmt::Display for ConstructionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op())?;
        match self {
            ConstructionStep::CreateFile {
                path,
                size,
                pattern,
            } => write!(f, " {path} ({size} bytes of {pattern})"),
            ConstructionStep::CreateDirectory { path }
            | ConstructionStep::CreateSubvolume { path } => write!(f, " {path}"),
            ConstructionStep::CreateDirectoryChain { path, depth, .. }
            | ConstructionStep::CreateSubvolumeChain { path, depth, .. } => {
                write!(f, " {path} (depth {depth})")
            }
            ConstructionStep::CreateSnapshot {
                source,
                path,
                writable,
            } => write!(
                f,
                " {source} -> {path}{}",
                if *writable { "" } else { " (read-only)" }
            ),
            ConstructionStep::Delete { path, intent } => write!(f, " {path} ({intent:?})"),
            ConstructionStep::CreateHardlink { path, target }
            | ConstructionStep::CreateSymlink { path, target } => {
                write!(f, " {path} -> {target}")
            }
            ConstructionStep::CreateNode { path, node, .. } => {
                write!(f, " {path} ({})", node.as_str())
            }
            ConstructionStep::CreateReflink { path, source } => write!(f, " {path} <- {source}"),
            ConstructionStep::Append { path, len, pattern } => {
                write!(f, " {path} (+{len} bytes of {pattern})")
            }
            ConstructionStep::WriteAt {
                path, offset, len, ..
            } => write!(f, " {path} ({len} bytes at {offset})"),
            ConstructionStep::Truncate { path, size } => write!(f, " {path} to {size}"),
            ConstructionStep::CreateFragmentedFile {
                path,
                chunk,
                count,
                layout,
                ..
            } => write!(f, " {path} ({count} x {chunk} bytes, {layout:?})"),
            ConstructionStep::SetTimes { path, mtime, .. } => write!(f, " {path} (mtime {mtime})"),
            ConstructionStep::SetOwner {
                path,
                uid,
                gid,
                recursive,
            } => write!(
                f,
                " {path} ({uid}:{gid}{})",
                if *recursive { ", recursive" } else { "" }
            ),
            ConstructionStep::SetMode { path, mode } => write!(f, " {path} ({mode:o})"),
            ConstructionStep::ConvertToBtrfs => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Steps {
        steps: Vec<ConstructionStep>,
    }

    #[test]
    fn test_parse_toml_steps() {
        let parsed: Steps = toml::from_str(
            r#"
[[steps]]
op = "create_directory"
path = "/a"

[[steps]]
op = "create_file"
path = "/a/f"
size = 4096
pattern = { type = "seeded", seed = 1 }

[[steps]]
op = "delete"
path = "/a/f"
intent = "orphan_recoverable"

[[steps]]
op = "convert_to_btrfs"
"#,
        )
        .unwrap();

        assert_eq!(
            parsed.steps,
            vec![
                ConstructionStep::CreateDirectory { path: "/a".into() },
                ConstructionStep::CreateFile {
                    path: "/a/f".into(),
                    size: 4096,
                    pattern: Pattern::Seeded { seed: 1 },
                },
                ConstructionStep::Delete {
                    path: "/a/f".into(),
                    intent: DeleteIntent::OrphanRecoverable,
                },
                ConstructionStep::ConvertToBtrfs,
            ]
        );
    }

    #[test]
    fn test_defaults() {
        let step: ConstructionStep =
            serde_json::from_str(r#"{"op":"create_node","path":"/n","node":"fifo"}"#).unwrap();
        assert_eq!(
            step,
            ConstructionStep::CreateNode {
                path: "/n".into(),
                node: NodeKind::Fifo,
                mode: 0o600,
                major: 0,
                minor: 0,
            }
        );

        let step: ConstructionStep =
            serde_json::from_str(r#"{"op":"create_snapshot","source":"/","path":"/s"}"#).unwrap();
        assert!(matches!(
            step,
            ConstructionStep::CreateSnapshot { writable: true, .. }
        ));

        let step: ConstructionStep =
            serde_json::from_str(r#"{"op":"set_owner","path":"/a","uid":1000,"gid":100}"#)
                .unwrap();
        assert!(matches!(
            step,
            ConstructionStep::SetOwner {
                recursive: false,
                ..
            }
        ));
        assert_eq!(step.to_string(), "set_owner /a (1000:100)");
    }

    #[test]
    fn test_fragment_order() {
        let order = |layout: FragmentLayout, count| layout.order(count).collect::<Vec<_>>();
        assert_eq!(order(FragmentLayout::Interleaved, 5), vec![0, 2, 4, 1, 3]);
        assert_eq!(order(FragmentLayout::Reverse, 3), vec![2, 1, 0]);
        assert_eq!(order(FragmentLayout::Sparse, 5), vec![0, 2, 4]);
        // nothing is allocated up front
        assert_eq!(FragmentLayout::Reverse.order(u64::MAX).next(), Some(u64::MAX - 1));
    }

    #[test]
    fn test_display() {
        let step = ConstructionStep::CreateFile {
            path: "/a/f".into(),
            size: 4096,
            pattern: Pattern::Seeded { seed: 1 },
        };
        assert_eq!(
            step.to_string(),
            "create_file /a/f (4096 bytes of seed(1))"
        );
        assert_eq!(ConstructionStep::ConvertToBtrfs.to_string(), "convert_to_btrfs");
    }
}
