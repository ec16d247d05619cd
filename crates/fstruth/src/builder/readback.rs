//! Reading facts back from the live mount.
//!
//! Object identifiers are assigned by the filesystem, never predicted.  After
//! every step the builder asks the mounted filesystem what it actually did.

use std::{
    collections::HashMap,
    fs::File,
    path::{Path, PathBuf},
};

use anyhow::{Context as _, Result};
use log::trace;
use rustix::fs::{statx, AtFlags, Statx, StatxFlags, StatxTimestamp, CWD};

use crate::{
    object::{ObjectFacts, ObjectKey, ObjectKind, Timestamp},
    spec::FsKind,
    toolchain::{Tool, Toolchain},
    util::{host_path, parent_path, sha256_reader},
};

/// Inode number of every btrfs subvolume root directory.
pub const BTRFS_FIRST_FREE_OBJECTID: u64 = 256;

/// What `statx` says about one object.
#[derive(Debug, Clone)]
pub struct Observed {
    pub key: ObjectKey,
    pub kind: ObjectKind,
    /// Kind, mode, ownership, link count, size and timestamps.
    pub facts: ObjectFacts,
}

fn timestamp(ts: StatxTimestamp) -> Timestamp {
    Timestamp::new(ts.tv_sec, ts.tv_nsec)
}

/// Reads facts about paths inside a mounted image.
#[derive(Debug)]
pub struct Probe<'a> {
    root: PathBuf,
    kind: FsKind,
    toolchain: &'a Toolchain,
    /// Subvolume id per anonymous device number.
    volumes: HashMap<(u32, u32), u64>,
}

impl<'a> Probe<'a> {
    pub fn new(root: &Path, kind: FsKind, toolchain: &'a Toolchain) -> Self {
        Probe {
            root: root.to_path_buf(),
            kind,
            toolchain,
            volumes: HashMap::new(),
        }
    }

    /// Switches to a different filesystem type after an in-place conversion.
    /// Cached volume ids are dropped.
    pub fn set_kind(&mut self, kind: FsKind) {
        self.kind = kind;
        self.forget_volumes();
    }

    /// Drops the cached volume ids.  Needed whenever subvolumes come or go:
    /// the kernel hands the anonymous device of a freed subvolume to the next
    /// one created.
    pub fn forget_volumes(&mut self) {
        if !self.volumes.is_empty() {
            trace!("forgetting {} cached volume ids", self.volumes.len());
            self.volumes.clear();
        }
    }

    /// The host path of the image path `path`.
    pub fn host(&self, path: &str) -> PathBuf {
        host_path(&self.root, path)
    }

    fn statx(&self, path: &str) -> Result<Statx> {
        statx(
            CWD,
            self.host(path),
            AtFlags::SYMLINK_NOFOLLOW,
            StatxFlags::BASIC_STATS | StatxFlags::BTIME,
        )
        .with_context(|| format!("statx {path}"))
    }

    /// The subvolume containing `path`.
    ///
    /// Every btrfs subvolume has its own anonymous device number, so the
    /// answer is cached per device.  `btrfs inspect-internal rootid` is asked
    /// about a directory, never about a node that might block on open.
    fn volume(&mut self, path: &str, stx: &Statx, kind: ObjectKind) -> Result<u64> {
        if self.kind != FsKind::Btrfs {
            return Ok(0);
        }
        let device = (stx.stx_dev_major, stx.stx_dev_minor);
        if let Some(&volume) = self.volumes.get(&device) {
            return Ok(volume);
        }

        let dir = match kind.is_container() {
            true => path,
            false => parent_path(path),
        };
        let output = self
            .toolchain
            .command(Tool::Btrfs)?
            .args(["inspect-internal", "rootid"])
            .arg(self.host(dir))
            .output()?;
        let text = output.stdout_text();
        let volume: u64 = text
            .trim()
            .parse()
            .with_context(|| format!("unexpected rootid output {text:?} for {dir}"))?;

        trace!("device {}:{} is subvolume {volume}", device.0, device.1);
        self.volumes.insert(device, volume);
        Ok(volume)
    }

    /// Reads the identity, kind and metadata of the object at `path`.
    pub fn observe(&mut self, path: &str) -> Result<Observed> {
        let stx = self.statx(path)?;
        let mode = u32::from(stx.stx_mode);
        let Some(mut kind) = ObjectKind::from_mode(mode) else {
            anyhow::bail!("{path} has unknown file type {mode:o}");
        };
        if self.kind == FsKind::Btrfs
            && kind == ObjectKind::Directory
            && stx.stx_ino == BTRFS_FIRST_FREE_OBJECTID
        {
            kind = ObjectKind::SubvolumeRoot;
        }

        let key = ObjectKey::new(self.volume(path, &stx, kind)?, stx.stx_ino);
        let crtime =
            (stx.stx_mask & StatxFlags::BTIME.bits() != 0).then(|| timestamp(stx.stx_btime));
        let facts = ObjectFacts {
            kind: Some(kind),
            size: Some(stx.stx_size),
            mode: Some(mode & 0o7777),
            uid: Some(stx.stx_uid),
            gid: Some(stx.stx_gid),
            nlink: Some(u64::from(stx.stx_nlink)),
            mtime: Some(timestamp(stx.stx_mtime)),
            atime: Some(timestamp(stx.stx_atime)),
            ctime: Some(timestamp(stx.stx_ctime)),
            crtime,
            ..Default::default()
        };
        trace!("{path}: {key} {kind} {facts:?}");
        Ok(Observed { key, kind, facts })
    }

    /// The identity of the object at `path`.
    pub fn key(&mut self, path: &str) -> Result<ObjectKey> {
        Ok(self.observe(path)?.key)
    }

    pub fn read_link(&self, path: &str) -> Result<String> {
        let target =
            std::fs::read_link(self.host(path)).with_context(|| format!("readlink {path}"))?;
        target
            .into_os_string()
            .into_string()
            .map_err(|target| anyhow::anyhow!("symlink target {target:?} of {path} is not UTF-8"))
    }

    /// SHA-256 and length of what the filesystem returns for `path`.
    pub fn hash(&self, path: &str) -> Result<(String, u64)> {
        let mut file = File::open(self.host(path)).with_context(|| format!("opening {path}"))?;
        sha256_reader(&mut file).with_context(|| format!("reading {path}"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::tempdir;

    #[test]
    fn test_observe_plain_directory() {
        let dir = tempdir();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a/f"), b"hello").unwrap();
        std::os::unix::fs::symlink("f", dir.path().join("a/l")).unwrap();

        let toolchain = Toolchain::with_tools(std::iter::empty(), Duration::from_secs(1));
        // treated as ext: no subvolume lookups
        let mut probe = Probe::new(dir.path(), FsKind::Ext4, &toolchain);

        let file = probe.observe("/a/f").unwrap();
        assert_eq!(file.kind, ObjectKind::File);
        assert_eq!(file.key.volume, 0);
        assert_eq!(file.facts.size, Some(5));
        assert_eq!(file.facts.nlink, Some(1));

        let directory = probe.observe("/a").unwrap();
        assert_eq!(directory.kind, ObjectKind::Directory);
        assert_ne!(directory.key, file.key);

        assert_eq!(probe.observe("/a/l").unwrap().kind, ObjectKind::Symlink);
        assert_eq!(probe.read_link("/a/l").unwrap(), "f");

        let (digest, len) = probe.hash("/a/f").unwrap();
        assert_eq!(len, 5);
        assert_eq!(
            digest,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        assert!(probe.observe("/missing").is_err());
    }

    #[test]
    fn test_forget_volumes() {
        let dir = tempdir();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let toolchain = Toolchain::with_tools(std::iter::empty(), Duration::from_secs(1));
        let mut probe = Probe::new(dir.path(), FsKind::Btrfs, &toolchain);

        // a subvolume that has since been deleted left its device behind
        let stx = probe.statx("/f").unwrap();
        probe
            .volumes
            .insert((stx.stx_dev_major, stx.stx_dev_minor), 256);
        assert_eq!(probe.key("/f").unwrap().volume, 256);

        probe.forget_volumes();
        let err = probe.key("/f").unwrap_err();
        assert!(format!("{err:#}").contains("btrfs: executable not found"));
    }

    #[test]
    fn test_btrfs_volume_needs_tool() {
        let dir = tempdir();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let toolchain = Toolchain::with_tools(std::iter::empty(), Duration::from_secs(1));
        let mut probe = Probe::new(dir.path(), FsKind::Btrfs, &toolchain);
        let err = probe.observe("/f").unwrap_err();
        assert!(format!("{err:#}").contains("btrfs: executable not found"));
    }
}
