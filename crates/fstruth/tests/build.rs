//! Building real images.  These need root (for loop devices and mounting)
//! and the formatting tools; without them they do nothing.

mod common;

use std::time::Duration;

use similar_asserts::assert_eq;
use tempfile::TempDir;

use fstruth::{
    catalog,
    compare::verify,
    config::HarnessConfig,
    manifest::{Manifest, MANIFEST_NAME},
    object::{ObjectKind, ParentRef},
    scenario::{Harness, Scenario},
    store::StoreState,
    toolchain::Toolchain,
};

use common::tempdir;

fn harness(dir: &TempDir, keep_images: bool) -> Option<Harness> {
    if !common::privileged() {
        return None;
    }
    let config = HarnessConfig {
        work_dir: dir.path().to_path_buf(),
        keep_images,
        ..Default::default()
    };
    let toolchain = Toolchain::resolve(&config.tools);
    Some(Harness::with_toolchain(config, toolchain))
}

#[test_with::executable(mkfs.ext4)]
fn test_basic_ground_truth() {
    let dir = tempdir();
    let Some(harness) = harness(&dir, false) else {
        return;
    };
    let scenario = catalog::scenario("basic", true).unwrap();
    let built = harness.build(&scenario).unwrap();
    assert_eq!(built.store.state(), StoreState::Detached);

    let live: Vec<_> = built
        .truth
        .current()
        .iter()
        .filter(|o| o.is_live())
        .collect();
    assert_eq!(live.len(), 2);
    let (a, f) = (live[0], live[1]);
    assert_eq!(a.path(), "/a");
    assert_eq!(a.kind(), Some(ObjectKind::Directory));
    assert_eq!(a.facts.parent, Some(ParentRef::Root));
    assert_eq!(f.path(), "/a/f");
    assert_eq!(f.facts.parent, Some(ParentRef::Object(a.key)));
    assert_eq!(f.facts.size, Some(4096));

    // the parser sees exactly what was recorded
    let images = built.image_set().unwrap();
    assert_eq!(images.images.len(), 1);

    drop(built);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test_with::executable(mkfs.ext4)]
fn test_builds_are_deterministic() {
    let dir = tempdir();
    let Some(harness) = harness(&dir, false) else {
        return;
    };
    let scenario = catalog::scenario("hard_delete", true).unwrap();
    let first = harness.build(&scenario).unwrap().truth.deterministic_view();
    let second = harness.build(&scenario).unwrap().truth.deterministic_view();
    assert_eq!(first, second);
    assert!(first.iter().all(|o| !o.is_live()));
}

#[test_with::executable(mkfs.ext4)]
fn test_failed_step_cleans_up() {
    let dir = tempdir();
    let Some(harness) = harness(&dir, false) else {
        return;
    };
    let scenario = Scenario::from_toml(
        r#"
name = "broken"
[spec]
kind = "ext4"
device_size = 67108864
[[steps]]
op = "create_file"
path = "/missing/f"
size = 10
"#,
    )
    .unwrap();
    let err = harness.build(&scenario).unwrap_err();
    assert!(err.to_string().contains("step 0"), "{err}");
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test_with::executable(mkfs.ext4)]
fn test_kept_images_verify_offline() {
    let dir = tempdir();
    let Some(harness) = harness(&dir, true) else {
        return;
    };
    let scenario = catalog::scenario("basic", true).unwrap();
    let built = harness.build(&scenario).unwrap();
    let manifest_path = built.store.root().join(MANIFEST_NAME);
    let truth = built.truth.current().to_vec();
    drop(built);

    let manifest = Manifest::load(&manifest_path).unwrap();
    manifest.check_images().unwrap();
    assert_eq!(manifest.objects, truth);

    // an empty parse can only pass if nothing was expected
    let result = verify(&manifest.objects, &[], &manifest.policy);
    assert_eq!(result.counts.missing, 2);
}

#[test_with::executable(mkfs.btrfs)]
fn test_snapshot_branching() {
    let dir = tempdir();
    let Some(harness) = harness(&dir, false) else {
        return;
    };
    let scenario = catalog::scenario("snapshot_branching", true).unwrap();
    let built = harness.build(&scenario).unwrap();
    let truth = &built.truth;

    let (_, sub) = truth.lookup("/sub/f").unwrap();
    let (_, snap) = truth.lookup("/snap/f").unwrap();
    assert_eq!(sub.facts.size, Some(150));
    assert_eq!(snap.facts.size, Some(100));
    assert_ne!(sub.key.volume, snap.key.volume);
    assert_eq!(sub.key.id, snap.key.id);

    let (_, snap_root) = truth.lookup("/snap").unwrap();
    assert_eq!(snap_root.kind(), Some(ObjectKind::SubvolumeRoot));
    assert_eq!(snap.facts.parent, Some(ParentRef::Object(snap_root.key)));
}

#[test_with::executable(mkfs.ext4)]
fn test_recursive_owner() {
    let dir = tempdir();
    let Some(harness) = harness(&dir, false) else {
        return;
    };
    let scenario = Scenario::from_toml(
        r#"
name = "owned"
[spec]
kind = "ext4"
device_size = 67108864
[[steps]]
op = "create_directory"
path = "/a"
[[steps]]
op = "create_file"
path = "/a/f"
size = 10
[[steps]]
op = "create_file"
path = "/g"
size = 10
[[steps]]
op = "set_owner"
path = "/a"
uid = 1000
gid = 100
recursive = true
"#,
    )
    .unwrap();
    let built = harness.build(&scenario).unwrap();
    let owner = |path: &str| {
        let (_, object) = built.truth.lookup(path).unwrap();
        (object.facts.uid, object.facts.gid)
    };
    assert_eq!(owner("/a"), (Some(1000), Some(100)));
    assert_eq!(owner("/a/f"), (Some(1000), Some(100)));
    assert_eq!(owner("/g"), (Some(0), Some(0)));
}

#[test_with::executable(mkfs.btrfs)]
fn test_subvolume_replacing_a_deleted_one() {
    let dir = tempdir();
    let Some(harness) = harness(&dir, false) else {
        return;
    };
    let scenario = Scenario::from_toml(
        r#"
name = "replaced_subvolume"
[spec]
kind = "btrfs"
device_size = 268435456
[[steps]]
op = "create_subvolume"
path = "/a"
[[steps]]
op = "create_file"
path = "/a/f"
size = 10
[[steps]]
op = "delete"
path = "/a"
[[steps]]
op = "create_subvolume"
path = "/b"
[[steps]]
op = "create_file"
path = "/b/g"
size = 10
"#,
    )
    .unwrap();
    let built = harness.build(&scenario).unwrap();
    let truth = &built.truth;

    let deleted = truth
        .current()
        .iter()
        .find(|o| o.path() == "/a/f")
        .unwrap();
    let (_, b) = truth.lookup("/b").unwrap();
    let (_, g) = truth.lookup("/b/g").unwrap();
    // subvolume ids are never reused, even where device numbers are
    assert_ne!(b.key.volume, deleted.key.volume);
    assert_eq!(g.key.volume, b.key.volume);
    assert_eq!(g.facts.parent, Some(ParentRef::Object(b.key)));
}

#[test]
fn test_unavailable_tools_are_reported() {
    let dir = tempdir();
    let harness = Harness::with_toolchain(
        HarnessConfig {
            work_dir: dir.path().to_path_buf(),
            ..Default::default()
        },
        Toolchain::with_tools(std::iter::empty(), Duration::from_secs(1)),
    );
    let outcome = harness.run(&catalog::scenario("snapshot_branching", true).unwrap());
    assert!(!outcome.passed());
    let text = outcome.to_string();
    assert!(text.contains("mkfs.btrfs"), "{text}");
}
