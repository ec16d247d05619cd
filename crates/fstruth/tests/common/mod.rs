//! Helpers shared by the integration tests.

use tempfile::TempDir;

/// Allocate a temporary directory, below `$FSTRUTH_TEST_TMPDIR` if set.
///
/// Image files are sparse, so that directory should be on a filesystem that
/// supports holes.
pub fn tempdir() -> TempDir {
    match std::env::var_os("FSTRUTH_TEST_TMPDIR") {
        Some(dir) => TempDir::with_prefix_in("fstruth-test-", dir).unwrap(),
        None => TempDir::with_prefix("fstruth-test-").unwrap(),
    }
}

/// Whether the tests can attach loop devices and mount.
pub fn privileged() -> bool {
    let root = rustix::process::geteuid().is_root();
    if !root {
        eprintln!("not running as root, skipping");
    }
    root
}
