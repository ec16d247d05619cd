//! The feature builder.
//!
//! [`Builder::build`] turns a [`FilesystemSpec`] and an ordered list of
//! [`ConstructionStep`]s into a populated image plus the [`GroundTruth`]
//! describing it.  Steps run strictly in order against the live mount; after
//! each one the affected objects are read back, so identifiers are the ones
//! the filesystem assigned.
//!
//! A failing step aborts the build.  The mount and the loop devices are
//! released and the partial ground truth is dropped, so nobody ever compares
//! against it.

pub mod readback;

use std::{
    collections::{HashMap, HashSet},
    fs::{File, OpenOptions},
    io,
    os::unix::fs::FileExt,
    path::PathBuf,
};

use anyhow::{bail, ensure, Context as _};
use log::{debug, info, warn};
use rustix::fs::{
    chmodat, ioctl_ficlone, linkat, makedev, mknodat, symlinkat, utimensat, AtFlags, FileType,
    Mode, Timespec, Timestamps, CWD,
};

use crate::{
    config::HarnessConfig,
    content::ContentModel,
    error::{Error, Result},
    object::{DeleteIntent, GroundTruthObject, ObjectKey, ObjectKind, Timestamp},
    pattern::Pattern,
    spec::{BtrfsFeatures, FilesystemSpec, FsKind},
    step::{ConstructionStep, FragmentLayout, NodeKind, CHAIN_MARKER_SIZE, MAX_FRAGMENTS},
    store::{BackingStore, ImageSet, MountHandle},
    toolchain::{Tool, Toolchain},
    truth::GroundTruth,
    util::{file_name, is_within, normalize_path, parent_path, rebase},
    IO_CHUNK,
};

use self::readback::Probe;

/// A finished image: unmounted, detached, with its ground truth.
#[derive(Debug)]
pub struct BuiltImage {
    pub store: BackingStore,
    pub truth: GroundTruth,
    /// The filesystem the image holds now; differs from `spec.kind` after
    /// a conversion.
    pub final_kind: FsKind,
}

impl BuiltImage {
    /// The image files, for the parser adapter.
    pub fn image_set(&self) -> Result<ImageSet> {
        self.store.image_set(self.final_kind)
    }
}

/// Builds images with an explicit toolchain.
#[derive(Debug)]
pub struct Builder<'a> {
    toolchain: &'a Toolchain,
    work_dir: PathBuf,
    keep_images: bool,
}

impl<'a> Builder<'a> {
    pub fn new(toolchain: &'a Toolchain, work_dir: impl Into<PathBuf>) -> Self {
        Builder {
            toolchain,
            work_dir: work_dir.into(),
            keep_images: false,
        }
    }

    pub fn from_config(config: &HarnessConfig, toolchain: &'a Toolchain) -> Self {
        Builder::new(toolchain, &config.work_dir).keep_images(config.keep_images)
    }

    /// Leave the image files in place when the built image is dropped.
    pub fn keep_images(mut self, keep: bool) -> Self {
        self.keep_images = keep;
        self
    }

    /// Rejects step sequences that cannot apply to the filesystem they would
    /// run on, before any storage is allocated.
    pub fn check(spec: &FilesystemSpec, steps: &[ConstructionStep]) -> Result<()> {
        spec.validate()?;
        let capacity = spec.total_size()?;

        let mut kind = spec.kind;
        for (index, step) in steps.iter().enumerate() {
            match step {
                ConstructionStep::CreateFragmentedFile { chunk, count, .. } => {
                    let fits = chunk
                        .checked_mul(*count)
                        .is_some_and(|size| size <= capacity);
                    if *count > MAX_FRAGMENTS || !fits {
                        return Err(Error::Config(format!(
                            "step {index} ({step}): {count} chunks of {chunk} bytes do not fit \
                             the image (at most {MAX_FRAGMENTS} chunks, {capacity} bytes)"
                        )));
                    }
                }
                ConstructionStep::ConvertToBtrfs if !kind.is_ext() => {
                    return Err(Error::Config(format!(
                        "step {index} ({step}): cannot convert {kind} to btrfs"
                    )));
                }
                ConstructionStep::ConvertToBtrfs => kind = FsKind::Btrfs,
                step if step.needs_btrfs() && kind != FsKind::Btrfs => {
                    return Err(Error::Config(format!(
                        "step {index} ({step}) needs btrfs but the image is {kind}"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Builds the image described by `spec` and `steps`.
    ///
    /// `id` names the image files.  On success the store is detached and the
    /// images are ready for the parser; on failure everything is released.
    pub fn build(
        &self,
        id: &str,
        spec: &FilesystemSpec,
        steps: &[ConstructionStep],
    ) -> Result<BuiltImage> {
        Builder::check(spec, steps)?;

        let mut store = BackingStore::create(id, spec, &self.work_dir, self.keep_images)?;
        match self.populate(&mut store, spec, steps) {
            Ok((truth, final_kind)) => {
                store.detach()?;
                info!(
                    "built {id}: {} ground truth records from {} steps",
                    truth.len(),
                    steps.len()
                );
                Ok(BuiltImage {
                    store,
                    truth,
                    final_kind,
                })
            }
            Err(err) => {
                if let Err(cleanup) = store.destroy() {
                    warn!("cleaning up after failed build of {id}: {cleanup}");
                }
                Err(err)
            }
        }
    }

    fn populate(
        &self,
        store: &mut BackingStore,
        spec: &FilesystemSpec,
        steps: &[ConstructionStep],
    ) -> Result<(GroundTruth, FsKind)> {
        store.attach()?;
        store.format(spec, self.toolchain)?;
        let mount = store.mount(spec.kind, &spec.mount_options())?;

        let mut session = Session::start(mount, spec, self.toolchain)
            .map_err(|err| step_failed(0, "inspect the filesystem root".into(), err))?;
        for (index, step) in steps.iter().enumerate() {
            info!("step {index}: {step}");
            session
                .apply(index, step)
                .map_err(|err| step_failed(index, step.to_string(), err))?;
        }
        session
            .finalize(steps.len())
            .map_err(|err| step_failed(steps.len(), "final read-back".into(), err))?;
        session.finish()
    }
}

/// Wraps a step failure.  Ground truth inconsistencies are scenario bugs and
/// keep their own error class.
fn step_failed(index: usize, step: String, err: anyhow::Error) -> Error {
    if let Some(Error::InvalidGroundTruth(message)) = err.downcast_ref::<Error>() {
        return Error::InvalidGroundTruth(message.clone());
    }
    Error::Construction {
        index,
        step,
        cause: format!("{err:#}"),
    }
}

fn normalized(path: &str) -> anyhow::Result<String> {
    normalize_path(path).with_context(|| format!("invalid path {path:?}"))
}

/// Writes `len` bytes of `pattern`, taken from `pattern_offset` on, at
/// `offset` in `file`.
fn write_pattern(
    file: &File,
    offset: u64,
    len: u64,
    pattern: &Pattern,
    pattern_offset: u64,
) -> io::Result<()> {
    let mut buffer = vec![0u8; len.min(IO_CHUNK as u64) as usize];
    let mut done = 0;
    while done < len {
        let n = (len - done).min(IO_CHUNK as u64) as usize;
        pattern.fill(pattern_offset + done, &mut buffer[..n]);
        file.write_all_at(&buffer[..n], offset + done)?;
        done += n as u64;
    }
    Ok(())
}

fn timespec(ts: Timestamp) -> Timespec {
    Timespec {
        tv_sec: ts.secs as _,
        tv_nsec: ts.nanos as _,
    }
}

/// One build in progress: the mount, what was recorded so far, and the
/// content model of every regular file.
struct Session<'s, 'a> {
    mount: MountHandle<'s>,
    probe: Probe<'a>,
    toolchain: &'a Toolchain,
    kind: FsKind,
    truth: GroundTruth,
    /// Shared by hard links.
    contents: HashMap<ObjectKey, ContentModel>,
}

impl<'s, 'a> Session<'s, 'a> {
    fn start(
        mount: MountHandle<'s>,
        spec: &FilesystemSpec,
        toolchain: &'a Toolchain,
    ) -> anyhow::Result<Self> {
        let mut probe = Probe::new(mount.path(), spec.kind, toolchain);
        let root = probe.key("/")?;
        debug!("filesystem root is {root}");
        Ok(Session {
            mount,
            probe,
            toolchain,
            kind: spec.kind,
            truth: GroundTruth::new(root),
            contents: HashMap::new(),
        })
    }

    fn finish(self) -> Result<(GroundTruth, FsKind)> {
        self.mount.unmount()?;
        Ok((self.truth, self.kind))
    }

    /// The live record at `path`.
    fn live(&self, path: &str) -> anyhow::Result<(usize, GroundTruthObject)> {
        match self.truth.lookup(path) {
            Some((slot, object)) => Ok((slot, object.clone())),
            None => bail!("{path} does not exist"),
        }
    }

    fn live_file(&self, path: &str) -> anyhow::Result<ObjectKey> {
        let (_, object) = self.live(path)?;
        ensure!(
            object.kind() == Some(ObjectKind::File),
            "{path} is not a regular file"
        );
        Ok(object.key)
    }

    fn model(&self, key: ObjectKey) -> anyhow::Result<&ContentModel> {
        self.contents
            .get(&key)
            .with_context(|| format!("no content model for {key}"))
    }

    fn btrfs(&self) -> anyhow::Result<crate::process::ToolCommand> {
        Ok(self.toolchain.command(Tool::Btrfs)?)
    }

    /// Reads back the new object at `path` and records it.
    ///
    /// Regular files take `content` as their model, or share the model of
    /// their identity if they are another link to a known file.
    fn record(
        &mut self,
        step: usize,
        path: &str,
        content: Option<ContentModel>,
    ) -> anyhow::Result<usize> {
        let observed = self.probe.observe(path)?;
        let parent = self.truth.resolve_parent(path)?;

        let mut facts = observed.facts;
        facts.name = Some(file_name(path).to_string());
        facts.path = Some(path.to_string());
        facts.parent = Some(parent);

        match observed.kind {
            ObjectKind::File => {
                if let Some(model) = content {
                    self.contents.insert(observed.key, model);
                }
                let model = self.model(observed.key)?;
                ensure!(
                    facts.size == Some(model.size()),
                    "{path} is {} bytes on disk, expected {}",
                    facts.size.unwrap_or_default(),
                    model.size()
                );
                facts.fingerprint = Some(model.fingerprint());
                facts.data_ranges = Some(model.data_ranges());
            }
            ObjectKind::Symlink => facts.symlink_target = Some(self.probe.read_link(path)?),
            _ => {}
        }

        let slot = self
            .truth
            .record(step, GroundTruthObject::live(observed.key, facts, step))?;
        self.unpin_parent(step, path)?;
        Ok(slot)
    }

    /// Creating or removing an entry changes the parent's timestamps.
    fn unpin_parent(&mut self, step: usize, path: &str) -> anyhow::Result<()> {
        if let Some((slot, parent)) = self.truth.lookup(parent_path(path)) {
            if parent.timestamps_pinned {
                self.truth
                    .update(step, slot, |o| o.timestamps_pinned = false)?;
            }
        }
        Ok(())
    }

    /// Re-reads the metadata of the record in `slot`.  With `content_changed`
    /// the fingerprint and data ranges are recomputed from the model.
    fn refresh(&mut self, step: usize, slot: usize, content_changed: bool) -> anyhow::Result<()> {
        let Some(object) = self.truth.get(slot) else {
            bail!("no ground truth slot {slot}");
        };
        let path = object.path().to_string();
        let observed = self.probe.observe(&path)?;
        ensure!(
            observed.key == object.key,
            "{path} changed identity from {} to {}",
            object.key,
            observed.key
        );

        let mut content = None;
        if observed.kind == ObjectKind::File {
            let model = self.model(observed.key)?;
            ensure!(
                observed.facts.size == Some(model.size()),
                "{path} is {} bytes on disk, expected {}",
                observed.facts.size.unwrap_or_default(),
                model.size()
            );
            if content_changed {
                content = Some((model.fingerprint(), model.data_ranges()));
            }
        }

        let fresh = observed.facts;
        self.truth.update(step, slot, |object| {
            let facts = &mut object.facts;
            facts.kind = fresh.kind;
            facts.size = fresh.size;
            facts.mode = fresh.mode;
            facts.uid = fresh.uid;
            facts.gid = fresh.gid;
            facts.nlink = fresh.nlink;
            facts.mtime = fresh.mtime;
            facts.atime = fresh.atime;
            facts.ctime = fresh.ctime;
            facts.crtime = fresh.crtime;
            if let Some((fingerprint, ranges)) = content {
                facts.fingerprint = Some(fingerprint);
                facts.data_ranges = Some(ranges);
            }
        })?;
        Ok(())
    }

    /// Refreshes every live link of `key`.
    fn refresh_key(&mut self, step: usize, key: ObjectKey, content_changed: bool) -> anyhow::Result<()> {
        for slot in self.truth.live_with_key(key) {
            self.refresh(step, slot, content_changed)?;
        }
        Ok(())
    }

    fn set_pinned(&mut self, step: usize, key: ObjectKey, pinned: bool) -> anyhow::Result<()> {
        for slot in self.truth.live_with_key(key) {
            self.truth
                .update(step, slot, |o| o.timestamps_pinned = pinned)?;
        }
        Ok(())
    }

    fn create_file(
        &mut self,
        step: usize,
        path: &str,
        size: u64,
        pattern: &Pattern,
    ) -> anyhow::Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.probe.host(path))
            .with_context(|| format!("creating {path}"))?;
        write_pattern(&file, 0, size, pattern, 0).with_context(|| format!("writing {path}"))?;
        drop(file);

        let mut model = ContentModel::new();
        model.write(0, size, pattern, 0);
        self.record(step, path, Some(model))?;
        Ok(())
    }

    fn create_directory(&mut self, step: usize, path: &str) -> anyhow::Result<()> {
        std::fs::create_dir(self.probe.host(path)).with_context(|| format!("mkdir {path}"))?;
        self.record(step, path, None)?;
        Ok(())
    }

    fn create_subvolume(&mut self, step: usize, path: &str) -> anyhow::Result<()> {
        self.btrfs()?
            .args(["subvolume", "create"])
            .arg(self.probe.host(path))
            .output()?;
        self.probe.forget_volumes();
        self.record(step, path, None)?;
        Ok(())
    }

    /// `path`, then the same name nested `depth - 1` more times, then a
    /// marker file inside the innermost level.
    fn create_chain(
        &mut self,
        step: usize,
        path: &str,
        depth: usize,
        marker: &str,
        subvolumes: bool,
    ) -> anyhow::Result<()> {
        ensure!(depth > 0, "a chain needs a depth of at least 1");
        let name = file_name(path).to_string();

        let mut current = path.to_string();
        for level in 0..depth {
            if level > 0 {
                current = format!("{current}/{name}");
            }
            match subvolumes {
                true => self.create_subvolume(step, &current)?,
                false => self.create_directory(step, &current)?,
            }
        }
        self.create_file(
            step,
            &format!("{current}/{marker}"),
            CHAIN_MARKER_SIZE,
            &Pattern::NumberedLines,
        )
    }

    fn create_snapshot(
        &mut self,
        step: usize,
        source: &str,
        path: &str,
        writable: bool,
    ) -> anyhow::Result<()> {
        if source != "/" {
            let (_, object) = self.live(source)?;
            ensure!(
                object.kind() == Some(ObjectKind::SubvolumeRoot),
                "{source} is not a subvolume"
            );
        }

        let mut command = self.btrfs()?.args(["subvolume", "snapshot"]);
        if !writable {
            command = command.arg("-r");
        }
        command
            .arg(self.probe.host(source))
            .arg(self.probe.host(path))
            .output()?;
        self.probe.forget_volumes();

        self.record(step, path, None)?;
        self.record_snapshot_members(step, source, path)
    }

    /// Records the copies a snapshot made of everything inside `source`, as
    /// it stood before this step.
    ///
    /// Nested subvolumes are not part of a snapshot: they show up as empty
    /// directories and their contents are not copied.
    fn record_snapshot_members(&mut self, step: usize, source: &str, dst: &str) -> anyhow::Result<()> {
        let mut members: Vec<GroundTruthObject> = self
            .truth
            .snapshot_view(step)
            .into_iter()
            .filter(|o| o.is_live() && o.path() != source && is_within(o.path(), source))
            .collect();
        members.sort_by(|a, b| a.path().cmp(b.path()));

        let mut nested: Vec<String> = vec![];
        for member in members {
            if nested.iter().any(|n| is_within(member.path(), n)) {
                continue;
            }
            let content = match member.kind() {
                Some(ObjectKind::SubvolumeRoot) => {
                    nested.push(member.path().to_string());
                    None
                }
                Some(ObjectKind::File) => Some(self.model(member.key)?.clone()),
                _ => None,
            };
            let copy = rebase(member.path(), source, dst);
            debug!("snapshot copy {} -> {copy}", member.path());
            self.record(step, &copy, content)?;
        }
        Ok(())
    }

    fn delete(&mut self, step: usize, path: &str, intent: DeleteIntent) -> anyhow::Result<()> {
        let (_, object) = self.live(path)?;
        let host = self.probe.host(path);
        match object.kind() {
            Some(ObjectKind::SubvolumeRoot) => {
                self.btrfs()?
                    .args(["subvolume", "delete"])
                    .arg(&host)
                    .output()?;
            }
            Some(ObjectKind::Directory) => {
                std::fs::remove_dir_all(&host).with_context(|| format!("removing {path}"))?
            }
            _ => std::fs::remove_file(&host).with_context(|| format!("removing {path}"))?,
        }
        // a directory may have held subvolumes too
        if object.kind().is_some_and(|k| k.is_container()) {
            self.probe.forget_volumes();
        }

        let slots = self.truth.mark_deleted(step, path, intent)?;
        debug!("{path}: {} record(s) marked deleted", slots.len());
        self.unpin_parent(step, path)?;
        // the remaining links of a hard-linked file lost one
        self.refresh_key(step, object.key, false)
    }

    fn create_node(
        &mut self,
        step: usize,
        path: &str,
        node: NodeKind,
        mode: u32,
        major: u32,
        minor: u32,
    ) -> anyhow::Result<()> {
        let (file_type, dev) = match node {
            NodeKind::Fifo => (FileType::Fifo, 0),
            NodeKind::Socket => (FileType::Socket, 0),
            NodeKind::BlockDevice => (FileType::BlockDevice, makedev(major, minor)),
            NodeKind::CharDevice => (FileType::CharacterDevice, makedev(major, minor)),
        };
        mknodat(
            CWD,
            self.probe.host(path),
            file_type,
            Mode::from_raw_mode(mode),
            dev,
        )
        .with_context(|| format!("mknod {path}"))?;
        self.record(step, path, None)?;
        Ok(())
    }

    fn create_reflink(&mut self, step: usize, path: &str, source: &str) -> anyhow::Result<()> {
        let key = self.live_file(source)?;
        let model = self.model(key)?.clone();

        let src = File::open(self.probe.host(source)).with_context(|| format!("opening {source}"))?;
        let dst = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.probe.host(path))
            .with_context(|| format!("creating {path}"))?;
        ioctl_ficlone(&dst, &src).with_context(|| format!("cloning {source} to {path}"))?;
        drop((src, dst));

        self.record(step, path, Some(model))?;
        Ok(())
    }

    /// Applies a content change to the file at `path`, both on disk and to
    /// its model.
    fn modify(
        &mut self,
        step: usize,
        path: &str,
        change: impl FnOnce(&File, &mut ContentModel) -> io::Result<()>,
    ) -> anyhow::Result<()> {
        let key = self.live_file(path)?;
        let file = OpenOptions::new()
            .write(true)
            .open(self.probe.host(path))
            .with_context(|| format!("opening {path}"))?;
        let Some(model) = self.contents.get_mut(&key) else {
            bail!("no content model for {key}");
        };
        change(&file, model).with_context(|| format!("writing {path}"))?;
        drop(file);

        self.set_pinned(step, key, false)?;
        self.refresh_key(step, key, true)
    }

    fn create_fragmented(
        &mut self,
        step: usize,
        path: &str,
        chunk: u64,
        count: u64,
        layout: FragmentLayout,
        pattern: &Pattern,
    ) -> anyhow::Result<()> {
        ensure!(chunk > 0 && count > 0, "fragmented file needs chunks");
        let size = chunk
            .checked_mul(count)
            .context("fragmented file size overflows")?;

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.probe.host(path))
            .with_context(|| format!("creating {path}"))?;
        let mut model = ContentModel::new();
        for index in layout.order(count) {
            let offset = index * chunk;
            write_pattern(&file, offset, chunk, pattern, offset)
                .and_then(|()| file.sync_data())
                .with_context(|| format!("writing chunk {index} of {path}"))?;
            model.write(offset, chunk, pattern, offset);
        }
        file.set_len(size)?;
        model.truncate(size);
        drop(file);

        self.record(step, path, Some(model))?;
        Ok(())
    }

    fn set_times(
        &mut self,
        step: usize,
        path: &str,
        mtime: Timestamp,
        atime: Timestamp,
    ) -> anyhow::Result<()> {
        let (_, object) = self.live(path)?;
        let times = Timestamps {
            last_access: timespec(atime),
            last_modification: timespec(mtime),
        };
        utimensat(CWD, self.probe.host(path), &times, AtFlags::SYMLINK_NOFOLLOW)
            .with_context(|| format!("utimensat {path}"))?;
        self.refresh_key(step, object.key, false)?;
        self.set_pinned(step, object.key, true)
    }

    fn set_owner(
        &mut self,
        step: usize,
        path: &str,
        uid: u32,
        gid: u32,
        recursive: bool,
    ) -> anyhow::Result<()> {
        let chown = |host: PathBuf, path: &str| {
            std::os::unix::fs::lchown(host, Some(uid), Some(gid))
                .with_context(|| format!("chown {path}"))
        };

        let mut targets = vec![];
        if path == "/" {
            // the root directory is not recorded
            ensure!(recursive, "the root directory can only be changed recursively");
            chown(self.probe.host(path), path)?;
        } else {
            let (_, object) = self.live(path)?;
            targets.push((path.to_string(), object.key));
        }
        if recursive {
            targets.extend(
                self.truth
                    .live_under(path)
                    .into_iter()
                    .filter(|(_, o)| o.path() != path)
                    .map(|(_, o)| (o.path().to_string(), o.key)),
            );
        }

        let mut refreshed = HashSet::new();
        for (target, key) in targets {
            chown(self.probe.host(&target), &target)?;
            if refreshed.insert(key) {
                self.refresh_key(step, key, false)?;
            }
        }
        debug!("{path}: {} object(s) now owned by {uid}:{gid}", refreshed.len());
        Ok(())
    }

    fn set_mode(&mut self, step: usize, path: &str, mode: u32) -> anyhow::Result<()> {
        let (_, object) = self.live(path)?;
        ensure!(
            object.kind() != Some(ObjectKind::Symlink),
            "cannot change the mode of symlink {path}"
        );
        chmodat(
            CWD,
            self.probe.host(path),
            Mode::from_raw_mode(mode),
            AtFlags::empty(),
        )
        .with_context(|| format!("chmod {path}"))?;
        self.refresh_key(step, object.key, false)
    }

    /// Converts the ext filesystem to btrfs in place.  Every live record is
    /// re-identified afterwards; the content models follow their objects.
    fn convert_to_btrfs(&mut self, step: usize) -> anyhow::Result<()> {
        ensure!(self.kind.is_ext(), "{} cannot be converted to btrfs", self.kind);

        let toolchain = self.toolchain;
        self.mount.remount(FsKind::Btrfs, &[], |devices| {
            let device = devices.first().context("no device to convert")?;
            let mut command = toolchain.command(Tool::BtrfsConvert)?;
            if let Some(features) = BtrfsFeatures::standard().option_list() {
                command = command.arg(format!("-O{features}"));
            }
            command.arg(device).output()?;
            Ok(())
        })?;
        self.kind = FsKind::Btrfs;
        self.probe.set_kind(FsKind::Btrfs);

        let before: Vec<(usize, ObjectKey)> = self
            .truth
            .live_under("/")
            .into_iter()
            .map(|(slot, object)| (slot, object.key))
            .collect();

        let root = self.probe.key("/")?;
        let probe = &mut self.probe;
        self.truth.rekey(step, root, |path| probe.key(path))?;

        let mut contents = HashMap::new();
        for (slot, old) in before {
            if let (Some(object), Some(model)) = (self.truth.get(slot), self.contents.get(&old)) {
                contents.insert(object.key, model.clone());
            }
        }
        self.contents = contents;
        info!("converted to btrfs, new root {root}");
        Ok(())
    }

    fn apply(&mut self, index: usize, step: &ConstructionStep) -> anyhow::Result<()> {
        match step {
            ConstructionStep::CreateFile {
                path,
                size,
                pattern,
            } => self.create_file(index, &normalized(path)?, *size, pattern),
            ConstructionStep::CreateDirectory { path } => {
                self.create_directory(index, &normalized(path)?)
            }
            ConstructionStep::CreateDirectoryChain {
                path,
                depth,
                marker,
            } => self.create_chain(index, &normalized(path)?, *depth, marker, false),
            ConstructionStep::CreateSubvolume { path } => {
                self.create_subvolume(index, &normalized(path)?)
            }
            ConstructionStep::CreateSubvolumeChain {
                path,
                depth,
                marker,
            } => self.create_chain(index, &normalized(path)?, *depth, marker, true),
            ConstructionStep::CreateSnapshot {
                source,
                path,
                writable,
            } => self.create_snapshot(index, &normalized(source)?, &normalized(path)?, *writable),
            ConstructionStep::Delete { path, intent } => {
                self.delete(index, &normalized(path)?, *intent)
            }
            ConstructionStep::CreateHardlink { path, target } => {
                let (path, target) = (normalized(path)?, normalized(target)?);
                let (_, object) = self.live(&target)?;
                ensure!(
                    !object.kind().is_some_and(|k| k.is_container()),
                    "cannot hard link directory {target}"
                );
                linkat(
                    CWD,
                    self.probe.host(&target),
                    CWD,
                    self.probe.host(&path),
                    AtFlags::empty(),
                )
                .with_context(|| format!("link {target} to {path}"))?;
                self.record(index, &path, None)?;
                self.refresh_key(index, object.key, false)
            }
            ConstructionStep::CreateSymlink { path, target } => {
                let path = normalized(path)?;
                symlinkat(target.as_str(), CWD, self.probe.host(&path))
                    .with_context(|| format!("symlink {path} -> {target}"))?;
                self.record(index, &path, None)?;
                Ok(())
            }
            ConstructionStep::CreateNode {
                path,
                node,
                mode,
                major,
                minor,
            } => self.create_node(index, &normalized(path)?, *node, *mode, *major, *minor),
            ConstructionStep::CreateReflink { path, source } => {
                self.create_reflink(index, &normalized(path)?, &normalized(source)?)
            }
            ConstructionStep::Append { path, len, pattern } => {
                self.modify(index, &normalized(path)?, |file, model| {
                    write_pattern(file, model.size(), *len, pattern, 0)?;
                    model.append(*len, pattern);
                    Ok(())
                })
            }
            ConstructionStep::WriteAt {
                path,
                offset,
                len,
                pattern,
            } => self.modify(index, &normalized(path)?, |file, model| {
                write_pattern(file, *offset, *len, pattern, *offset)?;
                model.write(*offset, *len, pattern, *offset);
                Ok(())
            }),
            ConstructionStep::Truncate { path, size } => {
                self.modify(index, &normalized(path)?, |file, model| {
                    file.set_len(*size)?;
                    model.truncate(*size);
                    Ok(())
                })
            }
            ConstructionStep::CreateFragmentedFile {
                path,
                chunk,
                count,
                layout,
                pattern,
            } => self.create_fragmented(index, &normalized(path)?, *chunk, *count, *layout, pattern),
            ConstructionStep::SetTimes { path, mtime, atime } => {
                self.set_times(index, &normalized(path)?, *mtime, *atime)
            }
            ConstructionStep::SetOwner {
                path,
                uid,
                gid,
                recursive,
            } => self.set_owner(index, &normalized(path)?, *uid, *gid, *recursive),
            ConstructionStep::SetMode { path, mode } => {
                self.set_mode(index, &normalized(path)?, *mode)
            }
            ConstructionStep::ConvertToBtrfs => self.convert_to_btrfs(index),
        }
    }

    /// Refreshes every live record and checks that the filesystem returns
    /// exactly the modelled content for every regular file.
    ///
    /// The mount uses `noatime`, so reading the files back does not disturb
    /// the access times just recorded.
    fn finalize(&mut self, step: usize) -> anyhow::Result<()> {
        let slots: Vec<usize> = self
            .truth
            .live_under("/")
            .into_iter()
            .map(|(slot, _)| slot)
            .collect();
        for &slot in &slots {
            self.refresh(step, slot, false)?;
        }

        let mut verified = HashSet::new();
        for slot in slots {
            let Some(object) = self.truth.get(slot) else {
                continue;
            };
            if object.kind() != Some(ObjectKind::File) || !verified.insert(object.key) {
                continue;
            }
            let (digest, len) = self.probe.hash(object.path())?;
            ensure!(
                object.facts.fingerprint.as_deref() == Some(digest.as_str()),
                "{}: the filesystem returns different content ({len} bytes, sha256 {digest})",
                object.path()
            );
        }
        self.mount.sync().context("syncing the filesystem")?;
        debug!("verified {} file(s)", verified.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::tempdir;

    fn toolchain() -> Toolchain {
        Toolchain::with_tools(std::iter::empty(), Duration::from_secs(1))
    }

    #[test]
    fn test_check_rejects_btrfs_steps_on_ext() {
        let spec = FilesystemSpec::new(FsKind::Ext4);
        let subvolume = ConstructionStep::CreateSubvolume { path: "/s".into() };

        match Builder::check(&spec, &[subvolume.clone()]) {
            Err(Error::Config(message)) => {
                assert_eq!(
                    message,
                    "step 0 (create_subvolume /s) needs btrfs but the image is ext4"
                )
            }
            other => panic!("unexpected {other:?}"),
        }
        // fine after a conversion
        Builder::check(&spec, &[ConstructionStep::ConvertToBtrfs, subvolume]).unwrap();

        let btrfs = FilesystemSpec::new(FsKind::Btrfs);
        assert!(Builder::check(&btrfs, &[ConstructionStep::ConvertToBtrfs]).is_err());
    }

    #[test]
    fn test_check_bounds_fragmented_files() {
        let spec = FilesystemSpec {
            device_size: 64 * 1024 * 1024,
            ..FilesystemSpec::new(FsKind::Ext4)
        };
        let fragmented = |chunk, count| ConstructionStep::CreateFragmentedFile {
            path: "/frag".into(),
            chunk,
            count,
            layout: FragmentLayout::Interleaved,
            pattern: Pattern::default(),
        };

        Builder::check(&spec, &[fragmented(4096, 16)]).unwrap();
        for step in [
            fragmented(1, u64::MAX),
            fragmented(1, MAX_FRAGMENTS + 1),
            fragmented(u64::MAX / 2, 4),
            fragmented(1024 * 1024, 65),
        ] {
            assert!(
                matches!(Builder::check(&spec, &[step.clone()]), Err(Error::Config(_))),
                "{step}"
            );
        }
    }

    #[test]
    fn test_invalid_spec_allocates_nothing() {
        let work = tempdir();
        let toolchain = toolchain();
        let spec = FilesystemSpec {
            devices: 0,
            ..Default::default()
        };
        let result = Builder::new(&toolchain, work.path()).build("bad", &spec, &[]);
        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_build_cleans_up() {
        let work = tempdir();
        let toolchain = toolchain();
        let spec = FilesystemSpec {
            device_size: 4 * 1024 * 1024,
            ..Default::default()
        };
        // without root the loop device cannot be attached; without mkfs the
        // format fails.  Either way nothing must be left behind.
        let result = Builder::new(&toolchain, work.path()).build("cleanup", &spec, &[]);
        assert!(matches!(
            result,
            Err(Error::Allocation(_) | Error::Format { .. })
        ));
        assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_step_failure_carries_cause_chain() {
        let err = anyhow::anyhow!("No space left on device").context("writing /big");
        match step_failed(3, "create_file /big".into(), err) {
            Error::Construction { index, step, cause } => {
                assert_eq!(index, 3);
                assert_eq!(step, "create_file /big");
                assert_eq!(cause, "writing /big: No space left on device");
            }
            other => panic!("unexpected {other:?}"),
        }

        let invalid: anyhow::Error = Error::InvalidGroundTruth("/a recorded twice".into()).into();
        assert!(matches!(
            step_failed(1, "create_directory /a".into(), invalid),
            Error::InvalidGroundTruth(_)
        ));
    }

    #[test]
    fn test_write_pattern_matches_model() {
        let dir = tempdir();
        let path = dir.path().join("f");
        let file = File::create(&path).unwrap();
        let pattern = Pattern::Seeded { seed: 7 };

        let mut model = ContentModel::new();
        for index in FragmentLayout::Reverse.order(3) {
            let offset = index * 100_000;
            write_pattern(&file, offset, 100_000, &pattern, offset).unwrap();
            model.write(offset, 100_000, &pattern, offset);
        }
        drop(file);

        assert_eq!(
            crate::util::sha256_file(&path).unwrap(),
            model.fingerprint()
        );
    }
}
