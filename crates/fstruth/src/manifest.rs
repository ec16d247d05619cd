//! Ground truth manifests.
//!
//! A manifest is written next to kept images.  It records how the images were
//! built, the SHA-256 of every image file, and the complete ground truth, so
//! a parser can be verified against the images later without rebuilding
//! them.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    builder::BuiltImage,
    compare::ComparisonPolicy,
    error::{Error, Result},
    object::{GroundTruthObject, ObjectKey},
    scenario::Scenario,
    spec::{FilesystemSpec, FsKind},
    step::ConstructionStep,
    store::ImageSet,
    util::sha256_reader,
};

/// File name of the manifest inside a kept image directory.
pub const MANIFEST_NAME: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Absolute, or relative to the manifest.
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
}

impl ImageRecord {
    fn hash(path: &Path) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);
        let (sha256, size) = sha256_reader(&mut file)?;
        Ok(ImageRecord {
            path: path.to_path_buf(),
            sha256,
            size,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub scenario: String,
    pub spec: FilesystemSpec,
    pub steps: Vec<ConstructionStep>,
    pub final_kind: FsKind,
    pub images: Vec<ImageRecord>,
    /// Identity of the filesystem root.
    pub root: ObjectKey,
    pub objects: Vec<GroundTruthObject>,
    pub policy: ComparisonPolicy,
}

impl Manifest {
    /// Describes a freshly built image.  Hashes every image file.
    pub fn new(scenario: &Scenario, built: &BuiltImage) -> Result<Self> {
        let images = built
            .store
            .images()
            .iter()
            .map(|path| ImageRecord::hash(path))
            .collect::<Result<_>>()?;
        Ok(Manifest {
            scenario: scenario.name.clone(),
            spec: scenario.spec.clone(),
            steps: scenario.steps.clone(),
            final_kind: built.final_kind,
            images,
            root: built.truth.root(),
            objects: built.truth.current().to_vec(),
            policy: scenario.policy.clone(),
        })
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        info!("wrote manifest {}", path.display());
        Ok(())
    }

    /// Reads a manifest; relative image paths are resolved against the
    /// manifest's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let mut manifest: Manifest = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;

        let dir = path.parent().unwrap_or(Path::new("."));
        for image in &mut manifest.images {
            if image.path.is_relative() {
                image.path = dir.join(&image.path);
            }
        }
        Ok(manifest)
    }

    /// Makes sure the image files are still the ones the ground truth
    /// describes.
    pub fn check_images(&self) -> Result<()> {
        for image in &self.images {
            let current = ImageRecord::hash(&image.path).map_err(|e| {
                Error::Config(format!("image {}: {e}", image.path.display()))
            })?;
            if current.sha256 != image.sha256 || current.size != image.size {
                return Err(Error::Config(format!(
                    "image {} changed since the manifest was written",
                    image.path.display()
                )));
            }
        }
        Ok(())
    }

    pub fn image_set(&self) -> ImageSet {
        ImageSet::new(
            self.images.iter().map(|image| image.path.clone()).collect(),
            self.final_kind,
        )
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        object::{ObjectFacts, ObjectKind, ParentRef},
        test::tempdir,
    };

    fn manifest(dir: &Path) -> Manifest {
        let image = dir.join("test.img");
        std::fs::write(&image, b"abc").unwrap();
        let objects = vec![GroundTruthObject::live(
            ObjectKey::new(0, 12),
            ObjectFacts {
                kind: Some(ObjectKind::File),
                path: Some("/f".into()),
                parent: Some(ParentRef::Root),
                ..Default::default()
            },
            0,
        )];
        Manifest {
            scenario: "test".into(),
            spec: FilesystemSpec::new(FsKind::Ext4),
            steps: vec![ConstructionStep::CreateDirectory { path: "/a".into() }],
            final_kind: FsKind::Ext4,
            images: vec![ImageRecord::hash(&image).unwrap()],
            root: ObjectKey::new(0, 2),
            objects,
            policy: ComparisonPolicy::default(),
        }
    }

    #[test]
    fn test_write_and_load() {
        let dir = tempdir();
        let original = manifest(dir.path());
        assert_eq!(
            original.images[0].sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );

        let path = dir.path().join(MANIFEST_NAME);
        original.write(&path).unwrap();
        let loaded = Manifest::load(&path).unwrap();
        assert_eq!(loaded, original);
        loaded.check_images().unwrap();

        let images = loaded.image_set();
        assert_eq!(images.kind, FsKind::Ext4);
        assert_eq!(images.images, vec![dir.path().join("test.img")]);
    }

    #[test]
    fn test_relative_images() {
        let dir = tempdir();
        let mut original = manifest(dir.path());
        original.images[0].path = "test.img".into();
        let path = dir.path().join(MANIFEST_NAME);
        original.write(&path).unwrap();

        let loaded = Manifest::load(&path).unwrap();
        assert_eq!(loaded.images[0].path, dir.path().join("test.img"));
    }

    #[test]
    fn test_changed_image() {
        let dir = tempdir();
        let original = manifest(dir.path());
        std::fs::write(dir.path().join("test.img"), b"abd").unwrap();
        assert!(matches!(original.check_images(), Err(Error::Config(_))));

        assert!(Manifest::load(dir.path().join("missing.json")).is_err());
    }
}
