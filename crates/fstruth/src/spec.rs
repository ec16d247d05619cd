//! Declarative description of the filesystem to build.

use std::{ffi::OsString, fmt, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default size of each backing device.
pub const DEFAULT_DEVICE_SIZE: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsKind {
    #[default]
    Btrfs,
    Ext2,
    Ext3,
    Ext4,
}

impl FsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsKind::Btrfs => "btrfs",
            FsKind::Ext2 => "ext2",
            FsKind::Ext3 => "ext3",
            FsKind::Ext4 => "ext4",
        }
    }

    /// Filesystem type name to hand to the kernel.  The ext4 driver serves
    /// all ext generations.
    pub fn mount_type(&self) -> &'static str {
        match self {
            FsKind::Btrfs => "btrfs",
            FsKind::Ext2 | FsKind::Ext3 | FsKind::Ext4 => "ext4",
        }
    }

    /// Volume id of the top-level volume: the top-level subvolume on btrfs,
    /// 0 where there are no volumes.
    pub fn top_level_volume(&self) -> u64 {
        match self {
            FsKind::Btrfs => 5,
            _ => 0,
        }
    }

    pub fn is_ext(&self) -> bool {
        !matches!(self, FsKind::Btrfs)
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transparent compression, forced for every write at mount time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Zlib,
    Lzo,
    Zstd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidProfile {
    Single,
    Dup,
    Raid0,
    Raid1,
    Raid10,
}

impl RaidProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            RaidProfile::Single => "single",
            RaidProfile::Dup => "dup",
            RaidProfile::Raid0 => "raid0",
            RaidProfile::Raid1 => "raid1",
            RaidProfile::Raid10 => "raid10",
        }
    }

    pub fn min_devices(&self) -> u32 {
        match self {
            RaidProfile::Single | RaidProfile::Dup => 1,
            RaidProfile::Raid0 | RaidProfile::Raid1 => 2,
            RaidProfile::Raid10 => 4,
        }
    }
}

/// On-disk btrfs features.  `None` leaves the toolchain default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BtrfsFeatures {
    pub extref: Option<bool>,
    pub skinny_metadata: Option<bool>,
    pub no_holes: Option<bool>,
}

impl BtrfsFeatures {
    /// The features used unless a profile says otherwise: extended inode
    /// refs and skinny metadata.
    pub fn standard() -> Self {
        BtrfsFeatures {
            extref: Some(true),
            skinny_metadata: Some(true),
            no_holes: None,
        }
    }

    /// The `-O` argument for mkfs.btrfs and btrfs-convert, if any feature is set.
    pub fn option_list(&self) -> Option<String> {
        let list: Vec<String> = [
            ("extref", self.extref),
            ("skinny-metadata", self.skinny_metadata),
            ("no-holes", self.no_holes),
        ]
        .into_iter()
        .filter_map(|(name, value)| match value? {
            true => Some(name.to_string()),
            false => Some(format!("^{name}")),
        })
        .collect();
        (!list.is_empty()).then(|| list.join(","))
    }

    fn is_default(&self) -> bool {
        *self == BtrfsFeatures::default()
    }
}

/// What filesystem to build.  Immutable once construction begins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesystemSpec {
    pub kind: FsKind,
    /// Number of backing devices.
    pub devices: u32,
    /// Size of each backing device in bytes.
    pub device_size: u64,
    /// Logical block size of the loop devices.
    pub sector_size: u32,
    pub label: Option<String>,
    /// Pinning the UUID makes the image bytes more reproducible.
    pub uuid: Option<String>,
    pub compression: Compression,
    pub data_profile: Option<RaidProfile>,
    pub metadata_profile: Option<RaidProfile>,
    /// Mixed data and metadata block groups.
    pub mixed: bool,
    pub nodesize: Option<u32>,
    pub features: BtrfsFeatures,
}

impl Default for FilesystemSpec {
    fn default() -> Self {
        FilesystemSpec {
            kind: FsKind::Btrfs,
            devices: 1,
            device_size: DEFAULT_DEVICE_SIZE,
            sector_size: 512,
            label: None,
            uuid: None,
            compression: Compression::None,
            data_profile: None,
            metadata_profile: None,
            mixed: false,
            nodesize: None,
            features: BtrfsFeatures::default(),
        }
    }
}

impl FilesystemSpec {
    pub fn new(kind: FsKind) -> Self {
        FilesystemSpec {
            kind,
            ..Default::default()
        }
    }

    /// Total backing size over all devices.
    pub fn total_size(&self) -> Result<u64> {
        self.device_size
            .checked_mul(self.devices as u64)
            .ok_or_else(|| {
                Error::Config(format!(
                    "{} devices of {} bytes overflow",
                    self.devices, self.device_size
                ))
            })
    }

    /// Rejects combinations no toolchain could build.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(msg));

        if self.devices == 0 {
            return fail("at least one device is required".into());
        }
        if self.device_size == 0 || self.device_size % self.sector_size.max(1) as u64 != 0 {
            return fail(format!(
                "device size {} is not a positive multiple of the sector size {}",
                self.device_size, self.sector_size
            ));
        }
        self.total_size()?;
        if !matches!(self.sector_size, 512 | 1024 | 2048 | 4096) {
            return fail(format!("unsupported sector size {}", self.sector_size));
        }

        if self.kind.is_ext() {
            let btrfs_only = self.devices > 1
                || self.compression != Compression::None
                || self.data_profile.is_some()
                || self.metadata_profile.is_some()
                || self.mixed
                || self.nodesize.is_some()
                || !self.features.is_default();
            if btrfs_only {
                return fail(format!(
                    "{} supports neither multiple devices nor btrfs options",
                    self.kind
                ));
            }
            return Ok(());
        }

        for profile in [self.data_profile, self.metadata_profile].into_iter().flatten() {
            if self.devices < profile.min_devices() {
                return fail(format!(
                    "{} needs at least {} devices, have {}",
                    profile.as_str(),
                    profile.min_devices(),
                    self.devices
                ));
            }
        }
        if let Some(nodesize) = self.nodesize {
            if !nodesize.is_power_of_two() || !(4096..=65536).contains(&nodesize) {
                return fail(format!("invalid node size {nodesize}"));
            }
        }
        Ok(())
    }

    /// Arguments for the formatting tool, devices last.
    pub fn mkfs_args(&self, devices: &[&Path]) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![];
        match self.kind {
            FsKind::Btrfs => {
                args.push("-f".into());
                if let Some(features) = self.features.option_list() {
                    args.push(format!("-O{features}").into());
                }
                if let Some(nodesize) = self.nodesize {
                    args.push(format!("-n{nodesize}").into());
                }
                if self.mixed {
                    args.push("--mixed".into());
                }
                if let Some(profile) = self.data_profile {
                    args.push(format!("-d{}", profile.as_str()).into());
                }
                if let Some(profile) = self.metadata_profile {
                    args.push(format!("-m{}", profile.as_str()).into());
                }
                if let Some(label) = &self.label {
                    args.extend(["-L".into(), label.into()]);
                }
                if let Some(uuid) = &self.uuid {
                    args.extend(["-U".into(), uuid.into()]);
                }
            }
            FsKind::Ext2 | FsKind::Ext3 | FsKind::Ext4 => {
                args.extend(["-q".into(), "-F".into()]);
                if let Some(label) = &self.label {
                    args.extend(["-L".into(), label.into()]);
                }
                if let Some(uuid) = &self.uuid {
                    args.extend(["-U".into(), uuid.into()]);
                }
            }
        }
        args.extend(devices.iter().map(|d| d.as_os_str().to_owned()));
        args
    }

    /// Mount options as `(key, value)` pairs; an empty value is a flag.
    pub fn mount_options(&self) -> Vec<(String, String)> {
        let algorithm = match self.compression {
            Compression::None => return vec![],
            Compression::Zlib => "zlib",
            Compression::Lzo => "lzo",
            Compression::Zstd => "zstd",
        };
        vec![("compress-force".into(), algorithm.into())]
    }
}

impl fmt::Display for FilesystemSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} x{} {}MiB",
            self.kind,
            self.devices,
            self.device_size / (1024 * 1024)
        )?;
        if self.compression != Compression::None {
            write!(f, " compress={:?}", self.compression)?;
        }
        if let Some(profile) = self.data_profile {
            write!(f, " data={}", profile.as_str())?;
        }
        if let Some(profile) = self.metadata_profile {
            write!(f, " metadata={}", profile.as_str())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.into_string().unwrap())
            .collect()
    }

    #[test]
    fn test_btrfs_mkfs_args() {
        let spec = FilesystemSpec {
            devices: 2,
            nodesize: Some(4096),
            data_profile: Some(RaidProfile::Raid1),
            metadata_profile: Some(RaidProfile::Raid0),
            features: BtrfsFeatures::standard(),
            ..FilesystemSpec::new(FsKind::Btrfs)
        };
        spec.validate().unwrap();
        let args = spec.mkfs_args(&[Path::new("/dev/loop0"), Path::new("/dev/loop1")]);
        assert_eq!(
            strings(args),
            [
                "-f",
                "-Oextref,skinny-metadata",
                "-n4096",
                "-draid1",
                "-mraid0",
                "/dev/loop0",
                "/dev/loop1"
            ]
        );
    }

    #[test]
    fn test_feature_negation() {
        let features = BtrfsFeatures {
            extref: Some(false),
            skinny_metadata: Some(true),
            no_holes: Some(true),
        };
        assert_eq!(
            features.option_list().unwrap(),
            "^extref,skinny-metadata,no-holes"
        );
        assert_eq!(BtrfsFeatures::default().option_list(), None);
    }

    #[test]
    fn test_ext_mkfs_args() {
        let spec = FilesystemSpec {
            label: Some("truth".into()),
            ..FilesystemSpec::new(FsKind::Ext4)
        };
        spec.validate().unwrap();
        assert_eq!(
            strings(spec.mkfs_args(&[Path::new("/dev/loop3")])),
            ["-q", "-F", "-L", "truth", "/dev/loop3"]
        );
        assert!(spec.mount_options().is_empty());
    }

    #[test]
    fn test_validate_rejects_impossible_profiles() {
        let raid1_single_device = FilesystemSpec {
            data_profile: Some(RaidProfile::Raid1),
            ..Default::default()
        };
        assert!(matches!(
            raid1_single_device.validate(),
            Err(Error::Config(_))
        ));

        let compressed_ext = FilesystemSpec {
            compression: Compression::Zlib,
            ..FilesystemSpec::new(FsKind::Ext2)
        };
        assert!(compressed_ext.validate().is_err());

        let odd_nodesize = FilesystemSpec {
            nodesize: Some(5000),
            ..Default::default()
        };
        assert!(odd_nodesize.validate().is_err());

        let no_devices = FilesystemSpec {
            devices: 0,
            ..Default::default()
        };
        assert!(no_devices.validate().is_err());

        let overflowing = FilesystemSpec {
            devices: 4,
            device_size: u64::MAX / 2 / 4096 * 4096,
            ..Default::default()
        };
        assert!(matches!(overflowing.total_size(), Err(Error::Config(_))));
        assert!(matches!(overflowing.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_compression_mount_option() {
        let spec = FilesystemSpec {
            compression: Compression::Lzo,
            ..Default::default()
        };
        assert_eq!(
            spec.mount_options(),
            vec![("compress-force".to_string(), "lzo".to_string())]
        );
    }

    #[test]
    fn test_parse_toml() {
        let spec: FilesystemSpec = toml::from_str(
            r#"
kind = "btrfs"
devices = 2
data_profile = "raid0"
metadata_profile = "raid0"
compression = "zlib"

[features]
no_holes = true
"#,
        )
        .unwrap();
        assert_eq!(spec.devices, 2);
        assert_eq!(spec.compression, Compression::Zlib);
        assert_eq!(spec.features.no_holes, Some(true));
        assert_eq!(spec.device_size, DEFAULT_DEVICE_SIZE);
        spec.validate().unwrap();
    }
}
