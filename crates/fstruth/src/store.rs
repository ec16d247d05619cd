//! Image backing store.
//!
//! A [`BackingStore`] owns everything one scenario needs on the host: a
//! scratch directory, one sparse image file per device, the loop devices they
//! are attached to, and a mount point.  It moves through three states:
//!
//! ```text
//!   Detached --attach--> Attached --mount--> Mounted
//!            <--detach--          <-unmount-
//! ```
//!
//! Mounting hands out a [`MountHandle`] that borrows the store and unmounts
//! it when dropped, so a failing construction step can never leak a mount.
//! Loop devices are released when the store is destroyed or dropped.

use std::{
    fmt,
    fs::OpenOptions,
    io,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
};

use fstruth_ioctls::loop_device::LoopDevice;
use log::{debug, info, warn};
use rustix::{
    fs::CWD,
    mount::{
        fsconfig_create, fsconfig_set_flag, fsconfig_set_string, fsmount, fsopen, move_mount,
        unmount, FsMountFlags, FsOpenFlags, MountAttrFlags, MoveMountFlags, UnmountFlags,
    },
};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::{
    error::{Error, Result},
    spec::{FilesystemSpec, FsKind},
    toolchain::{Tool, Toolchain},
    util::ErrnoFilter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreState {
    Detached,
    Attached,
    Mounted,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreState::Detached => "detached",
            StoreState::Attached => "attached",
            StoreState::Mounted => "mounted",
        })
    }
}

/// The image files of a detached store, ready to be handed to a parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSet {
    pub images: Vec<PathBuf>,
    /// The filesystem the images hold now (after any conversion).
    pub kind: FsKind,
}

impl ImageSet {
    pub fn new(images: Vec<PathBuf>, kind: FsKind) -> Self {
        ImageSet { images, kind }
    }

    pub fn first(&self) -> Option<&Path> {
        self.images.first().map(PathBuf::as_path)
    }
}

fn sanitize(id: &str) -> String {
    let id: String = id
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    if id.is_empty() {
        "image".into()
    } else {
        id
    }
}

/// Storage for one synthesized filesystem.
#[derive(Debug)]
pub struct BackingStore {
    id: String,
    dir: Option<TempDir>,
    root: PathBuf,
    images: Vec<PathBuf>,
    devices: Vec<LoopDevice>,
    mount_point: PathBuf,
    state: StoreState,
    device_size: u64,
    sector_size: u32,
    keep: bool,
}

impl BackingStore {
    /// Allocates sparse image files for `spec` in a fresh directory below
    /// `work_dir`.
    ///
    /// Fails with [`Error::Allocation`] if the directory cannot be created or
    /// the filesystem holding it has less free space than the images could
    /// grow to.
    pub fn create(id: &str, spec: &FilesystemSpec, work_dir: &Path, keep: bool) -> Result<Self> {
        let alloc = |what: &str, e: &dyn fmt::Display| {
            Error::Allocation(format!("{what} in {}: {e}", work_dir.display()))
        };

        std::fs::create_dir_all(work_dir).map_err(|e| alloc("cannot create work directory", &e))?;

        let stat = rustix::fs::statvfs(work_dir).map_err(|e| alloc("cannot stat", &e))?;
        let available = stat.f_bavail.saturating_mul(stat.f_frsize);
        let needed = spec.total_size()?;
        if available < needed {
            return Err(Error::Allocation(format!(
                "{id} needs {needed} bytes but only {available} are free in {}",
                work_dir.display()
            )));
        }

        let id = sanitize(id);
        let dir = TempDir::with_prefix_in(format!("{id}-"), work_dir)
            .map_err(|e| alloc("cannot create image directory", &e))?;
        let root = dir.path().to_path_buf();

        let images: Vec<PathBuf> = match spec.devices {
            1 => vec![root.join(format!("{id}.img"))],
            n => (1..=n).map(|i| root.join(format!("{id}.{i}.img"))).collect(),
        };
        for image in &images {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(image)
                .map_err(|e| alloc("cannot create image", &e))?;
            file.set_len(spec.device_size)
                .map_err(|e| alloc("cannot size image", &e))?;
        }

        let mount_point = root.join("mnt");
        std::fs::create_dir(&mount_point).map_err(|e| alloc("cannot create mount point", &e))?;

        info!(
            "created {} image file(s) of {} bytes in {}",
            images.len(),
            spec.device_size,
            root.display()
        );
        Ok(BackingStore {
            id,
            dir: Some(dir),
            root,
            images,
            devices: vec![],
            mount_point,
            state: StoreState::Detached,
            device_size: spec.device_size,
            sector_size: spec.sector_size,
            keep,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The directory holding the image files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images(&self) -> &[PathBuf] {
        &self.images
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn state(&self) -> StoreState {
        self.state
    }

    /// Total size over all image files.
    pub fn size(&self) -> u64 {
        self.device_size.saturating_mul(self.images.len() as u64)
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Paths of the attached loop devices.
    pub fn device_paths(&self) -> Vec<PathBuf> {
        self.devices.iter().map(|d| d.path().to_path_buf()).collect()
    }

    fn expect_state(&self, expected: StoreState) -> Result<()> {
        if self.dir.is_none() {
            return Err(Error::Allocation(format!("store {} was destroyed", self.id)));
        }
        match (self.state, expected) {
            (actual, wanted) if actual == wanted => Ok(()),
            (actual, StoreState::Detached) => Err(Error::NotDetached(actual)),
            (actual, wanted) => Err(Error::Allocation(format!(
                "store {} is {actual}, expected {wanted}",
                self.id
            ))),
        }
    }

    /// Attaches every image file to a free loop device.
    ///
    /// Fails with [`Error::Allocation`] if no loop device can be claimed.
    pub fn attach(&mut self) -> Result<()> {
        self.expect_state(StoreState::Detached)?;

        for image in &self.images {
            let attached = OpenOptions::new()
                .read(true)
                .write(true)
                .open(image)
                .and_then(|file| LoopDevice::attach(&file, self.sector_size));
            match attached {
                Ok(device) => {
                    debug!("attached {} to {}", image.display(), device.path().display());
                    self.devices.push(device);
                }
                Err(e) => {
                    // dropping releases what we already have
                    self.devices.clear();
                    return Err(Error::Allocation(format!(
                        "cannot attach {} to a loop device: {e}",
                        image.display()
                    )));
                }
            }
        }

        self.state = StoreState::Attached;
        Ok(())
    }

    /// Releases the loop devices.
    pub fn detach(&mut self) -> Result<()> {
        self.expect_state(StoreState::Attached)?;
        self.release_devices()?;
        self.state = StoreState::Detached;
        Ok(())
    }

    fn release_devices(&mut self) -> Result<()> {
        let mut first_error = None;
        for device in self.devices.drain(..) {
            let path = device.path().to_path_buf();
            if let Err(e) = device.detach() {
                warn!("cannot detach {}: {e}", path.display());
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(Error::Io(e)),
            None => Ok(()),
        }
    }

    /// Formats the attached devices with the toolchain's mkfs for `spec`.
    ///
    /// On failure the tool's diagnostic output is returned verbatim as
    /// [`Error::Format`].
    pub fn format(&mut self, spec: &FilesystemSpec, toolchain: &Toolchain) -> Result<()> {
        self.expect_state(StoreState::Attached)?;

        let devices = self.device_paths();
        let devices: Vec<&Path> = devices.iter().map(PathBuf::as_path).collect();
        let command = toolchain
            .command(Tool::mkfs(spec.kind))
            .map_err(|e| Error::Format {
                diagnostic: e.diagnostic(),
            })?
            .args(spec.mkfs_args(&devices));

        info!("formatting {} as {spec}", self.id);
        command.output().map_err(|e| Error::Format {
            diagnostic: e.diagnostic(),
        })?;
        Ok(())
    }

    /// Mounts the attached devices at [`BackingStore::mount_point`].
    pub fn mount(&mut self, kind: FsKind, options: &[(String, String)]) -> Result<MountHandle<'_>> {
        self.expect_state(StoreState::Attached)?;
        self.mount_now(kind, options)?;
        Ok(MountHandle { store: self })
    }

    fn mount_now(&mut self, kind: FsKind, options: &[(String, String)]) -> Result<()> {
        let devices = self.device_paths();
        mount_filesystem(kind, &devices, options, &self.mount_point).map_err(|source| {
            Error::Mount {
                target: self.mount_point.clone(),
                source,
            }
        })?;
        debug!("mounted {} at {}", kind, self.mount_point.display());
        self.state = StoreState::Mounted;
        Ok(())
    }

    fn unmount_now(&mut self, flags: UnmountFlags) -> Result<()> {
        let mount_error = |source: io::Error| Error::Mount {
            target: self.mount_point.clone(),
            source,
        };
        if flags.is_empty() {
            let dir = std::fs::File::open(&self.mount_point).map_err(mount_error)?;
            rustix::fs::syncfs(&dir).map_err(|e| mount_error(e.into()))?;
        }
        // EINVAL: not a mount point any more
        unmount(&self.mount_point, flags)
            .filter_errno(rustix::io::Errno::INVAL)
            .map_err(|e| mount_error(e.into()))?;
        debug!("unmounted {}", self.mount_point.display());
        self.state = StoreState::Attached;
        Ok(())
    }

    /// The image files, provided nothing has them mounted or attached.
    pub fn image_set(&self, kind: FsKind) -> Result<ImageSet> {
        self.expect_state(StoreState::Detached)?;
        Ok(ImageSet::new(self.images.clone(), kind))
    }

    /// Releases everything the store holds: mount, loop devices, and (unless
    /// the store keeps its images) the files.
    ///
    /// Safe to call repeatedly and on partially set up stores.
    pub fn destroy(&mut self) -> Result<()> {
        if self.state == StoreState::Mounted {
            if let Err(e) = self.unmount_now(UnmountFlags::DETACH) {
                warn!("{e}");
            }
        }
        let released = self.release_devices();
        self.state = StoreState::Detached;

        if let Some(dir) = self.dir.take() {
            if self.keep {
                if let Err(e) = std::fs::remove_dir(&self.mount_point) {
                    debug!("cannot remove {}: {e}", self.mount_point.display());
                }
                let kept = dir.keep();
                info!("keeping images in {}", kept.display());
            } else {
                dir.close()?;
                debug!("removed {}", self.root.display());
            }
        }
        released
    }

    /// Whether [`BackingStore::destroy`] has run.
    pub fn is_destroyed(&self) -> bool {
        self.dir.is_none()
    }
}

impl Drop for BackingStore {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!("cleaning up {}: {e}", self.id);
        }
    }
}

/// A mounted store.  Dropping the handle unmounts it.
#[derive(Debug)]
pub struct MountHandle<'a> {
    store: &'a mut BackingStore,
}

impl MountHandle<'_> {
    /// Where the filesystem is mounted.
    pub fn path(&self) -> &Path {
        &self.store.mount_point
    }

    pub fn store(&self) -> &BackingStore {
        self.store
    }

    /// Flushes the filesystem to the devices.
    pub fn sync(&self) -> io::Result<()> {
        let dir = std::fs::File::open(self.path())?;
        Ok(rustix::fs::syncfs(&dir)?)
    }

    /// Unmounts, runs `between` on the unmounted (still attached) devices,
    /// then mounts again as `kind`.
    pub fn remount(
        &mut self,
        kind: FsKind,
        options: &[(String, String)],
        between: impl FnOnce(&[PathBuf]) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        self.store.unmount_now(UnmountFlags::empty())?;
        between(&self.store.device_paths())?;
        self.store.mount_now(kind, options)?;
        Ok(())
    }

    /// Syncs and unmounts, reporting errors.
    pub fn unmount(self) -> Result<()> {
        if self.store.state == StoreState::Mounted {
            self.store.unmount_now(UnmountFlags::empty())?;
        }
        Ok(())
    }
}

impl Drop for MountHandle<'_> {
    fn drop(&mut self) {
        if self.store.state == StoreState::Mounted {
            if let Err(e) = self.store.unmount_now(UnmountFlags::DETACH) {
                warn!("{e}");
            }
        }
    }
}

/// A filesystem context created via the new mount API.
///
/// The kernel reports why a mount was refused through messages that can be
/// read from the context; they are attached to the error.
#[derive(Debug)]
struct FsContext {
    fd: OwnedFd,
}

impl FsContext {
    fn open(name: &str) -> io::Result<FsContext> {
        Ok(FsContext {
            fd: fsopen(name, FsOpenFlags::FSOPEN_CLOEXEC)?,
        })
    }

    fn messages(&self) -> String {
        let mut messages = vec![];
        let mut buffer = [0u8; 1024];
        loop {
            match rustix::io::read(&self.fd, &mut buffer) {
                Err(_) | Ok(0) => break,
                Ok(size) => messages.push(String::from_utf8_lossy(&buffer[..size]).into_owned()),
            }
        }
        messages.join("; ")
    }
}

impl AsFd for FsContext {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

fn mount_filesystem(
    kind: FsKind,
    devices: &[PathBuf],
    options: &[(String, String)],
    target: &Path,
) -> io::Result<()> {
    let Some((first, rest)) = devices.split_first() else {
        return Err(io::Error::other("no devices to mount"));
    };

    let fs = FsContext::open(kind.mount_type())?;
    let configure = || -> rustix::io::Result<OwnedFd> {
        fsconfig_set_string(fs.as_fd(), "source", first)?;
        for device in rest {
            fsconfig_set_string(fs.as_fd(), "device", device)?;
        }
        for (key, value) in options {
            if value.is_empty() {
                fsconfig_set_flag(fs.as_fd(), key.as_str())?;
            } else {
                fsconfig_set_string(fs.as_fd(), key.as_str(), value.as_str())?;
            }
        }
        fsconfig_create(fs.as_fd())?;
        fsmount(
            fs.as_fd(),
            FsMountFlags::FSMOUNT_CLOEXEC,
            MountAttrFlags::MOUNT_ATTR_NOATIME,
        )
    };

    let mnt = configure().map_err(|errno| {
        let messages = fs.messages();
        match messages.is_empty() {
            true => io::Error::from(errno),
            false => io::Error::new(io::Error::from(errno).kind(), format!("{errno}: {messages}")),
        }
    })?;

    move_mount(
        mnt.as_fd(),
        "",
        CWD,
        target,
        MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH,
    )?;
    Ok(())
}
