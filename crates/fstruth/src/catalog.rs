//! Built-in scenarios.
//!
//! The profiles cover ext4 as a reference, btrfs with various on-disk
//! features, compression and RAID layouts, and ext2/3/4 converted to btrfs in
//! place.  All of them are populated with the same content sets:
//!
//! - *standard*: an inline file, a 1 MiB file, optionally a 1124 MiB file, a
//!   file with a very long name, a hard link, a symlink, device nodes, a fifo,
//!   a socket, directory chains of depth 1 and 5, and a sparse file;
//! - *btrfs*: a reflink, subvolume chains of depth 1 and 5, a snapshot of the
//!   top level, then modifications of the reflink and of the original file;
//! - *deleted*: a 1 MiB file that is deleted again.
//!
//! Finally everything is handed to an unprivileged owner.
//!
//! Files hold 80-column numbered lines followed by `-` padding.  A few small
//! scenarios exercising single properties complete the catalog.

use crate::{
    compare::{ComparisonPolicy, IgnoreRule},
    error::{Error, Result},
    object::DeleteIntent,
    pattern::{Pattern, LINE_WIDTH},
    scenario::Scenario,
    spec::{BtrfsFeatures, Compression, FilesystemSpec, FsKind, RaidProfile},
    step::{ConstructionStep, NodeKind},
};

const MIB: u64 = 1024 * 1024;
/// Owner and group of everything in the profiles once they are populated.
pub const OWNER: u32 = 1000;

/// The full-size profiles.
pub const PROFILES: [&str; 17] = [
    "ext4",
    "btrfs",
    "btrfs_nofeature",
    "btrfs_zlib",
    "btrfs_lzo",
    "btrfs_mixed",
    "btrfs_nodemin",
    "btrfs_nodemax",
    "btrfs_noextref",
    "btrfs_noskinny",
    "btrfs_noholes",
    "btrfs_raid0DM",
    "btrfs_raid1D",
    "btrfs_raid1DM",
    "ext2_btrfs",
    "ext3_btrfs",
    "ext4_btrfs",
];

/// Small scenarios, each checking one property.
pub const EXAMPLES: [&str; 3] = ["basic", "hard_delete", "snapshot_branching"];

const LONG_NAME: &str = "this_is_a_file_with_a_very_long_file_name_44\
_this_is_a_file_with_a_very_long_file_name_89\
_this_is_a_file_with_a_very_long_file_name_135\
_this_is_a_file_with_a_very_long_file_name_181\
_this_is_a_file_with_a_very_long_file_name_227\
_this_is_a_file_with_an_EOF";

/// Every scenario name.
pub fn names() -> impl Iterator<Item = &'static str> {
    PROFILES.into_iter().chain(EXAMPLES)
}

/// Every scenario.  `fast` leaves out the big file and shrinks the devices.
pub fn all(fast: bool) -> Vec<Scenario> {
    names()
        .filter_map(|name| scenario(name, fast).ok())
        .collect()
}

/// The scenario called `name`.
pub fn scenario(name: &str, fast: bool) -> Result<Scenario> {
    if let Some(example) = example(name) {
        return Ok(example);
    }
    let Some(spec) = profile_spec(name, fast) else {
        return Err(Error::Config(format!("no built-in scenario named {name:?}")));
    };

    let mut steps = standard_set(fast);
    let mut ignore = vec![IgnoreRule::NamePrefix("$".into())];
    match name {
        "ext4" => {
            steps.extend(deleted_set());
            ignore.push(IgnoreRule::NamePrefix("lost+found".into()));
        }
        "ext2_btrfs" | "ext3_btrfs" | "ext4_btrfs" => {
            steps.extend(deleted_set());
            steps.push(ConstructionStep::ConvertToBtrfs);
            steps.extend(btrfs_set());
            ignore.push(IgnoreRule::NamePrefix("lost+found".into()));
            ignore.push(IgnoreRule::PathContains("ext2_saved".into()));
        }
        _ => {
            steps.extend(btrfs_set());
            steps.extend(deleted_set());
        }
    }
    steps.push(ConstructionStep::SetOwner {
        path: "/".into(),
        uid: OWNER,
        gid: OWNER,
        recursive: true,
    });

    Ok(Scenario {
        name: name.into(),
        description: describe(name).into(),
        spec,
        steps,
        policy: ComparisonPolicy {
            ignore_directory_size: true,
            ignore,
            ..Default::default()
        },
    })
}

fn describe(name: &str) -> &'static str {
    match name {
        "ext4" => "ext4 as a reference",
        "btrfs" => "btrfs with the standard features",
        "btrfs_nofeature" => "btrfs with extref and skinny metadata disabled",
        "btrfs_zlib" => "standard btrfs, fully zlib compressed",
        "btrfs_lzo" => "standard btrfs, fully lzo compressed",
        "btrfs_mixed" => "standard btrfs with mixed block groups",
        "btrfs_nodemin" => "standard btrfs with the minimum node size",
        "btrfs_nodemax" => "standard btrfs with the maximum node size",
        "btrfs_noextref" => "standard btrfs without extended inode refs",
        "btrfs_noskinny" => "standard btrfs without skinny metadata",
        "btrfs_noholes" => "standard btrfs with no-holes",
        "btrfs_raid0DM" => "standard btrfs, raid0 data and metadata",
        "btrfs_raid1D" => "standard btrfs, raid1 data",
        "btrfs_raid1DM" => "standard btrfs, raid1 data and metadata",
        "ext2_btrfs" => "ext2 converted to standard btrfs",
        "ext3_btrfs" => "ext3 converted to standard btrfs",
        "ext4_btrfs" => "ext4 converted to standard btrfs",
        _ => "",
    }
}

fn profile_spec(name: &str, fast: bool) -> Option<FilesystemSpec> {
    let mut spec = FilesystemSpec::new(FsKind::Btrfs);
    spec.device_size = if fast { 256 * MIB } else { 2048 * MIB };
    spec.features = BtrfsFeatures::standard();

    let raid = |spec: &mut FilesystemSpec, data: RaidProfile, metadata: RaidProfile| {
        spec.devices = 2;
        spec.data_profile = Some(data);
        spec.metadata_profile = Some(metadata);
    };

    match name {
        "btrfs" => {}
        "btrfs_nofeature" => {
            spec.features.extref = Some(false);
            spec.features.skinny_metadata = Some(false);
        }
        "btrfs_zlib" => spec.compression = Compression::Zlib,
        "btrfs_lzo" => spec.compression = Compression::Lzo,
        "btrfs_mixed" => spec.mixed = true,
        "btrfs_nodemin" => spec.nodesize = Some(4096),
        "btrfs_nodemax" => spec.nodesize = Some(65536),
        "btrfs_noextref" => spec.features.extref = Some(false),
        "btrfs_noskinny" => spec.features.skinny_metadata = Some(false),
        "btrfs_noholes" => spec.features.no_holes = Some(true),
        "btrfs_raid0DM" => raid(&mut spec, RaidProfile::Raid0, RaidProfile::Raid0),
        "btrfs_raid1D" => raid(&mut spec, RaidProfile::Raid1, RaidProfile::Raid0),
        "btrfs_raid1DM" => raid(&mut spec, RaidProfile::Raid1, RaidProfile::Raid1),
        "ext4" | "ext4_btrfs" => return Some(ext(FsKind::Ext4, spec.device_size)),
        "ext3_btrfs" => return Some(ext(FsKind::Ext3, spec.device_size)),
        "ext2_btrfs" => return Some(ext(FsKind::Ext2, spec.device_size)),
        _ => return None,
    }
    Some(spec)
}

fn ext(kind: FsKind, device_size: u64) -> FilesystemSpec {
    FilesystemSpec {
        device_size,
        ..FilesystemSpec::new(kind)
    }
}

/// A file of `size - 5` bytes: numbered lines, then `-` padding to fill the
/// remainder of a line.
pub fn raw_file(path: &str, size: u64) -> Vec<ConstructionStep> {
    let (lines, padding) = raw_layout(size);
    let mut steps = vec![ConstructionStep::CreateFile {
        path: path.into(),
        size: lines,
        pattern: Pattern::NumberedLines,
    }];
    steps.extend(padding_step(path, padding));
    steps
}

/// Like [`raw_file`], appended to an existing file.  Line numbers restart
/// at 1.
pub fn raw_append(path: &str, size: u64) -> Vec<ConstructionStep> {
    let (lines, padding) = raw_layout(size);
    let mut steps = vec![ConstructionStep::Append {
        path: path.into(),
        len: lines,
        pattern: Pattern::NumberedLines,
    }];
    steps.extend(padding_step(path, padding));
    steps
}

fn raw_layout(size: u64) -> (u64, u64) {
    let payload = size.saturating_sub(5);
    (payload / LINE_WIDTH * LINE_WIDTH, payload % LINE_WIDTH)
}

fn padding_step(path: &str, len: u64) -> Option<ConstructionStep> {
    (len > 0).then(|| ConstructionStep::Append {
        path: path.into(),
        len,
        pattern: Pattern::Text { text: "-".into() },
    })
}

/// A centred banner line naming `tag`, then another 100 KiB of lines.
pub fn modification(path: &str, tag: &str) -> Vec<ConstructionStep> {
    let banner = format!("\n{:^79}\n", format!(" MODIFICATION:{tag} "));
    let mut steps = vec![ConstructionStep::Append {
        path: path.into(),
        len: banner.len() as u64,
        pattern: Pattern::Text { text: banner },
    }];
    steps.extend(raw_append(path, 100 * 1024));
    steps
}

fn node(path: &str, node: NodeKind, mode: u32) -> ConstructionStep {
    ConstructionStep::CreateNode {
        path: path.into(),
        node,
        mode,
        major: 0,
        minor: 0,
    }
}

pub fn standard_set(fast: bool) -> Vec<ConstructionStep> {
    let mut steps = vec![];
    steps.extend(raw_file("/file_inline", 400));
    steps.extend(raw_file("/file", MIB));
    if !fast {
        steps.extend(raw_file("/file_big", 1124 * MIB));
    }
    steps.extend(raw_file(&format!("/{LONG_NAME}"), MIB));
    steps.extend([
        ConstructionStep::CreateHardlink {
            path: "/file_hardlink".into(),
            target: "/file".into(),
        },
        ConstructionStep::CreateSymlink {
            path: "/file_symlink".into(),
            target: "file".into(),
        },
        node("/block_device", NodeKind::BlockDevice, 0o600),
        node("/char_device", NodeKind::CharDevice, 0o600),
        node("/named_fifo", NodeKind::Fifo, 0o644),
        node("/named_socket", NodeKind::Socket, 0o755),
        ConstructionStep::CreateDirectoryChain {
            path: "/directory_single".into(),
            depth: 1,
            marker: crate::step::DIRECTORY_CHAIN_MARKER.into(),
        },
        ConstructionStep::CreateDirectoryChain {
            path: "/directory".into(),
            depth: 5,
            marker: crate::step::DIRECTORY_CHAIN_MARKER.into(),
        },
        ConstructionStep::CreateFile {
            path: "/sparse_file".into(),
            size: 0,
            pattern: Pattern::Zeros,
        },
        ConstructionStep::Truncate {
            path: "/sparse_file".into(),
            size: MIB,
        },
    ]);
    steps
}

pub fn btrfs_set() -> Vec<ConstructionStep> {
    let mut steps = vec![
        ConstructionStep::CreateReflink {
            path: "/file_reflink".into(),
            source: "/file".into(),
        },
        ConstructionStep::CreateSubvolumeChain {
            path: "/subvolume_single".into(),
            depth: 1,
            marker: crate::step::SUBVOLUME_CHAIN_MARKER.into(),
        },
        ConstructionStep::CreateSubvolumeChain {
            path: "/subvolume".into(),
            depth: 5,
            marker: crate::step::SUBVOLUME_CHAIN_MARKER.into(),
        },
        ConstructionStep::CreateSnapshot {
            source: "/".into(),
            path: "/snapshot".into(),
            writable: true,
        },
    ];
    steps.extend(modification("/file_reflink", "reflink"));
    steps.extend(modification("/file", "file"));
    steps
}

pub fn deleted_set() -> Vec<ConstructionStep> {
    let mut steps = raw_file("/file_deleted", MIB);
    steps.push(ConstructionStep::Delete {
        path: "/file_deleted".into(),
        intent: DeleteIntent::HardDelete,
    });
    steps
}

fn example(name: &str) -> Option<Scenario> {
    let small_ext4 = FilesystemSpec {
        device_size: 64 * MIB,
        ..FilesystemSpec::new(FsKind::Ext4)
    };
    let ext_policy = ComparisonPolicy {
        ignore: vec![IgnoreRule::NamePrefix("lost+found".into())],
        ..Default::default()
    };

    let (description, spec, steps, policy) = match name {
        "basic" => (
            "a directory holding one seeded file",
            small_ext4,
            vec![
                ConstructionStep::CreateDirectory { path: "/a".into() },
                ConstructionStep::CreateFile {
                    path: "/a/f".into(),
                    size: 4096,
                    pattern: Pattern::Seeded { seed: 1 },
                },
            ],
            ext_policy,
        ),
        "hard_delete" => (
            "a file created and deleted again must not be reported",
            small_ext4,
            vec![
                ConstructionStep::CreateFile {
                    path: "/x".into(),
                    size: 10,
                    pattern: Pattern::default(),
                },
                ConstructionStep::Delete {
                    path: "/x".into(),
                    intent: DeleteIntent::HardDelete,
                },
            ],
            ext_policy,
        ),
        "snapshot_branching" => (
            "a snapshot keeps the content its source had when it was taken",
            FilesystemSpec {
                device_size: 256 * MIB,
                features: BtrfsFeatures::standard(),
                ..FilesystemSpec::new(FsKind::Btrfs)
            },
            vec![
                ConstructionStep::CreateSubvolume { path: "/sub".into() },
                ConstructionStep::CreateFile {
                    path: "/sub/f".into(),
                    size: 100,
                    pattern: Pattern::Seeded { seed: 7 },
                },
                ConstructionStep::CreateSnapshot {
                    source: "/sub".into(),
                    path: "/snap".into(),
                    writable: false,
                },
                ConstructionStep::Append {
                    path: "/sub/f".into(),
                    len: 50,
                    pattern: Pattern::Seeded { seed: 8 },
                },
            ],
            ComparisonPolicy {
                ignore: vec![IgnoreRule::NamePrefix("$".into())],
                ..Default::default()
            },
        ),
        _ => return None,
    };

    Some(Scenario {
        name: name.into(),
        description: description.into(),
        spec,
        steps,
        policy,
    })
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{builder::Builder, content::ContentModel};

    #[test]
    fn test_every_scenario_is_valid() {
        for fast in [true, false] {
            let scenarios = all(fast);
            assert_eq!(scenarios.len(), PROFILES.len() + EXAMPLES.len());
            for scenario in &scenarios {
                scenario.validate().unwrap();
                Builder::check(&scenario.spec, &scenario.steps).unwrap();
            }
        }
        assert!(matches!(scenario("btrfs_raid5", true), Err(Error::Config(_))));
    }

    #[test]
    fn test_raw_file_sizes() {
        let model = |steps: Vec<ConstructionStep>| {
            let mut model = ContentModel::new();
            for step in steps {
                match step {
                    ConstructionStep::CreateFile { size, pattern, .. } => {
                        model.append(size, &pattern)
                    }
                    ConstructionStep::Append { len, pattern, .. } => model.append(len, &pattern),
                    other => panic!("unexpected step {other}"),
                }
            }
            model
        };

        assert_eq!(model(raw_file("/f", 400)).size(), 395);
        assert_eq!(model(raw_file("/f", MIB)).size(), MIB - 5);
        assert_eq!(raw_file("/f", 85).len(), 1);

        let inline = model(raw_file("/f", 400));
        let mut buf = vec![0u8; 395];
        inline.read_at(0, &mut buf);
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("1 000"));
        assert_eq!(&text[79..80], "\n");
        assert!(text[320..].chars().all(|c| c == '-'));
    }

    #[test]
    fn test_modification_banner() {
        let steps = modification("/file", "file");
        let ConstructionStep::Append { len, pattern, .. } = &steps[0] else {
            panic!("expected an append");
        };
        assert_eq!(*len, 81);
        let Pattern::Text { text } = pattern else {
            panic!("expected text");
        };
        assert_eq!(text.trim(), "MODIFICATION:file");
        assert_eq!(text.find('M'), Some(1 + (79 - 19) / 2 + 1));
    }

    #[test]
    fn test_profile_layout() {
        let raid = scenario("btrfs_raid1D", true).unwrap();
        assert_eq!(raid.spec.devices, 2);
        assert_eq!(raid.spec.data_profile, Some(RaidProfile::Raid1));
        assert_eq!(raid.spec.metadata_profile, Some(RaidProfile::Raid0));
        assert_eq!(raid.spec.device_size, 256 * MIB);

        let converted = scenario("ext3_btrfs", false).unwrap();
        assert_eq!(converted.spec.kind, FsKind::Ext3);
        let convert_at = converted
            .steps
            .iter()
            .position(|s| matches!(s, ConstructionStep::ConvertToBtrfs))
            .unwrap();
        assert!(converted.steps[..convert_at]
            .iter()
            .any(|s| matches!(s, ConstructionStep::Delete { .. })));
        assert!(converted.steps[convert_at..]
            .iter()
            .any(|s| matches!(s, ConstructionStep::CreateSnapshot { .. })));
        assert!(converted
            .steps
            .iter()
            .any(|s| matches!(s, ConstructionStep::CreateFile { path, .. } if path == "/file_big")));
        assert!(converted.policy.is_ignored("/ext2_saved/image"));
        assert!(converted.policy.is_ignored("/snapshot/lost+found"));

        for name in PROFILES {
            let profile = scenario(name, true).unwrap();
            assert_eq!(
                profile.steps.last(),
                Some(&ConstructionStep::SetOwner {
                    path: "/".into(),
                    uid: OWNER,
                    gid: OWNER,
                    recursive: true,
                }),
                "{name}"
            );
        }

        let nofeature = scenario("btrfs_nofeature", true).unwrap();
        assert_eq!(
            nofeature.spec.features.option_list().as_deref(),
            Some("^extref,^skinny-metadata")
        );
    }
}
