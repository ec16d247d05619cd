//! Which external tools are available, and where.
//!
//! Availability is environment dependent.  It is resolved once into a
//! [`Toolchain`] value that is passed explicitly to the builder and the
//! parser adapter.

use std::{collections::BTreeMap, fmt, path::PathBuf, time::Duration};

use log::debug;

use crate::{
    config::ToolsConfig,
    error::ToolError,
    process::ToolCommand,
    spec::{FilesystemSpec, FsKind},
    step::ConstructionStep,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tool {
    MkfsBtrfs,
    MkfsExt2,
    MkfsExt3,
    MkfsExt4,
    Btrfs,
    BtrfsConvert,
    Fls,
    Ils,
    Icat,
}

impl Tool {
    pub const ALL: [Tool; 9] = [
        Tool::MkfsBtrfs,
        Tool::MkfsExt2,
        Tool::MkfsExt3,
        Tool::MkfsExt4,
        Tool::Btrfs,
        Tool::BtrfsConvert,
        Tool::Fls,
        Tool::Ils,
        Tool::Icat,
    ];

    /// Executable name looked up in `$PATH`.
    pub fn program(&self) -> &'static str {
        match self {
            Tool::MkfsBtrfs => "mkfs.btrfs",
            Tool::MkfsExt2 => "mkfs.ext2",
            Tool::MkfsExt3 => "mkfs.ext3",
            Tool::MkfsExt4 => "mkfs.ext4",
            Tool::Btrfs => "btrfs",
            Tool::BtrfsConvert => "btrfs-convert",
            Tool::Fls => "fls",
            Tool::Ils => "ils",
            Tool::Icat => "icat",
        }
    }

    /// The formatting tool for `kind`.
    pub fn mkfs(kind: FsKind) -> Tool {
        match kind {
            FsKind::Btrfs => Tool::MkfsBtrfs,
            FsKind::Ext2 => Tool::MkfsExt2,
            FsKind::Ext3 => Tool::MkfsExt3,
            FsKind::Ext4 => Tool::MkfsExt4,
        }
    }

    fn configured(&self, config: &ToolsConfig) -> Option<PathBuf> {
        match self {
            Tool::MkfsBtrfs => config.mkfs_btrfs.clone(),
            Tool::MkfsExt2 => config.mkfs_ext2.clone(),
            Tool::MkfsExt3 => config.mkfs_ext3.clone(),
            Tool::MkfsExt4 => config.mkfs_ext4.clone(),
            Tool::Btrfs => config.btrfs.clone(),
            Tool::BtrfsConvert => config.btrfs_convert.clone(),
            Tool::Fls => config.fls.clone(),
            Tool::Ils => config.ils.clone(),
            Tool::Icat => config.icat.clone(),
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

/// Resolved locations of the external tools.
#[derive(Debug, Clone)]
pub struct Toolchain {
    tools: BTreeMap<Tool, PathBuf>,
    timeout: Duration,
}

impl Toolchain {
    /// Resolves every tool: configured paths win, the rest are searched in
    /// `$PATH`.  Missing tools are not an error until they are needed.
    pub fn resolve(config: &ToolsConfig) -> Self {
        let mut tools = BTreeMap::new();
        for tool in Tool::ALL {
            let found = tool
                .configured(config)
                .or_else(|| which::which(tool.program()).ok());
            match found {
                Some(path) => {
                    debug!("{tool}: {}", path.display());
                    tools.insert(tool, path);
                }
                None => debug!("{tool}: not found"),
            }
        }
        Toolchain {
            tools,
            timeout: config.timeout(),
        }
    }

    /// A toolchain with explicitly given tools, for tests and embedding.
    pub fn with_tools(tools: impl IntoIterator<Item = (Tool, PathBuf)>, timeout: Duration) -> Self {
        Toolchain {
            tools: tools.into_iter().collect(),
            timeout,
        }
    }

    pub fn path(&self, tool: Tool) -> Option<&PathBuf> {
        self.tools.get(&tool)
    }

    pub fn available(&self, tool: Tool) -> bool {
        self.tools.contains_key(&tool)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// A command for `tool`, bounded by the toolchain timeout.
    pub fn command(&self, tool: Tool) -> Result<ToolCommand, ToolError> {
        match self.tools.get(&tool) {
            Some(path) => Ok(ToolCommand::new(path, self.timeout)),
            None => Err(ToolError::NotFound {
                tool: tool.program().to_string(),
            }),
        }
    }

    /// Tools a build of `spec` with `steps` would need but that are missing.
    pub fn missing_for(&self, spec: &FilesystemSpec, steps: &[ConstructionStep]) -> Vec<Tool> {
        let mut needed = vec![Tool::mkfs(spec.kind)];
        if spec.kind == FsKind::Btrfs || steps.iter().any(ConstructionStep::needs_btrfs) {
            needed.push(Tool::Btrfs);
        }
        if steps
            .iter()
            .any(|s| matches!(s, ConstructionStep::ConvertToBtrfs))
        {
            needed.extend([Tool::BtrfsConvert, Tool::Btrfs]);
        }
        needed.sort();
        needed.dedup();
        needed.retain(|t| !self.available(*t));
        needed
    }
}
