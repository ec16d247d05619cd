//! The Sleuth Kit command line tools as parser under test.
//!
//! Three tools are combined:
//!
//! - `fls -r -m /` lists every name in body file format
//!   (`md5|name|inode|mode|uid|gid|size|atime|mtime|ctime|crtime`), deleted
//!   names marked with `(deleted)`;
//! - `ils -a` lists every inode with its link count and permission bits;
//! - `icat` extracts the content of each regular file, which is hashed as it
//!   streams by.
//!
//! The tools do not report volumes, so every object is placed in the default
//! volume and the comparator falls back to path pairing where that is wrong.
//! Objects reported under `$OrphanFiles` are classified as orphans.

use std::{collections::HashMap, path::Path, time::Duration};

use log::{debug, warn};

use super::{link_parents_by_path, parse_failure, ParserBackend};
use crate::{
    error::{Error, Result, ToolError},
    object::{ObjectFacts, ObjectKey, ObjectKind, ParsedObject, ParsedStatus, Timestamp},
    process::ToolCommand,
    store::ImageSet,
    toolchain::{Tool, Toolchain},
    util::file_name,
};

/// Virtual directory holding the orphans The Sleuth Kit found.
pub const ORPHAN_DIR: &str = "/$OrphanFiles";

const DELETED_SUFFIXES: [&str; 2] = [" (deleted)", " (deleted-realloc)"];

/// Link count and permission bits from `ils`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeMeta {
    pub nlink: u64,
    pub mode: u32,
}

fn kind_from_type(c: char) -> Option<ObjectKind> {
    match c {
        'r' => Some(ObjectKind::File),
        'd' => Some(ObjectKind::Directory),
        'l' => Some(ObjectKind::Symlink),
        'p' => Some(ObjectKind::Fifo),
        'c' => Some(ObjectKind::CharDevice),
        'b' => Some(ObjectKind::BlockDevice),
        's' => Some(ObjectKind::Socket),
        _ => None,
    }
}

/// Permission bits from an `ls`-style string such as `rwsr-xr-T`.
fn parse_permissions(perms: &str) -> Option<u32> {
    let chars: Vec<char> = perms.chars().collect();
    if chars.len() != 9 {
        return None;
    }
    let mut mode = 0;
    for (i, c) in chars.iter().enumerate() {
        let bit = 1 << (8 - i);
        match (i % 3, c) {
            (_, '-') => {}
            (0, 'r') | (1, 'w') | (2, 'x') => mode |= bit,
            (2, 's') if i == 2 => mode |= bit | 0o4000,
            (2, 'S') if i == 2 => mode |= 0o4000,
            (2, 's') if i == 5 => mode |= bit | 0o2000,
            (2, 'S') if i == 5 => mode |= 0o2000,
            (2, 't') if i == 8 => mode |= bit | 0o1000,
            (2, 'T') if i == 8 => mode |= 0o1000,
            _ => return None,
        }
    }
    Some(mode)
}

/// The leading decimal digits of a body file inode field like `1234-128-1`.
fn parse_inode(field: &str) -> Option<u64> {
    let end = field
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(field.len());
    field[..end].parse().ok()
}

fn parse_time(field: &str) -> Option<Timestamp> {
    let secs = field.trim().parse().ok()?;
    Some(Timestamp::new(secs, 0))
}

/// One body file line.
fn parse_body_line(line: &str, volume: u64) -> std::result::Result<ParsedObject, String> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() != 11 {
        return Err(format!("malformed fls line {line:?}"));
    }

    // `r/rrw-r--r--`: name type, '/', metadata type, permissions
    let mode_field = fields[3];
    let name_type = mode_field.chars().next();
    let meta_type = mode_field.chars().nth(2);
    let kind = match name_type {
        Some('-') | None => meta_type.and_then(kind_from_type),
        Some(c) => kind_from_type(c),
    };

    let mut name = fields[1];
    let mut status = ParsedStatus::Live;
    for suffix in DELETED_SUFFIXES {
        if let Some(stripped) = name.strip_suffix(suffix) {
            name = stripped;
            status = ParsedStatus::Deleted;
        }
    }
    let mut symlink_target = None;
    if kind == Some(ObjectKind::Symlink) {
        if let Some((link, target)) = name.split_once(" -> ") {
            name = link;
            symlink_target = Some(target.to_string());
        }
    }

    let mut path = name.replace("//", "/");
    if !path.starts_with('/') {
        path.insert(0, '/');
    }
    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    if path.starts_with(ORPHAN_DIR) && path != ORPHAN_DIR {
        status = ParsedStatus::Orphan;
    }

    let key = parse_inode(fields[2])
        .filter(|&id| id != 0)
        .map(|id| ObjectKey::new(volume, id));
    let facts = ObjectFacts {
        kind,
        name: Some(file_name(&path).to_string()),
        size: fields[6].parse().ok(),
        mode: mode_field.get(3..).and_then(parse_permissions),
        uid: fields[4].parse().ok(),
        gid: fields[5].parse().ok(),
        atime: parse_time(fields[7]),
        mtime: parse_time(fields[8]),
        ctime: parse_time(fields[9]),
        crtime: parse_time(fields[10]).filter(|ts| ts.secs != 0),
        symlink_target,
        path: Some(path),
        ..Default::default()
    };

    Ok(ParsedObject {
        key,
        facts,
        status,
        parse_error: None,
    })
}

/// Parses `fls -r -m /` output.  Malformed lines become parse errors.
pub fn parse_body(text: &str, volume: u64) -> Vec<ParsedObject> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse_body_line(line, volume).unwrap_or_else(parse_failure))
        .collect()
}

/// Parses `ils -a` output:
/// `inum|alloc|uid|gid|mtime|atime|ctime|crtime|mode|nlink|size`.
///
/// Header lines, inode 0 and inodes without a mode are skipped.
pub fn parse_ils(text: &str) -> HashMap<u64, InodeMeta> {
    let mut inodes = HashMap::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() < 11 || fields[8] == "0" {
            continue;
        }
        let Ok(inode) = fields[0].parse::<u64>() else {
            continue;
        };
        if inode == 0 {
            continue;
        }
        let (Ok(mode), Ok(nlink)) = (u32::from_str_radix(fields[8], 8), fields[9].parse()) else {
            debug!("skipping ils line {line:?}");
            continue;
        };
        inodes.insert(
            inode,
            InodeMeta {
                nlink,
                mode: mode & 0o7777,
            },
        );
    }
    inodes
}

/// `fls`, `ils` and `icat` from The Sleuth Kit.
#[derive(Debug)]
pub struct Sleuthkit {
    toolchain: Toolchain,
    timeout: Duration,
    default_volume: Option<u64>,
}

impl Sleuthkit {
    pub fn new(toolchain: &Toolchain, timeout: Duration, default_volume: Option<u64>) -> Self {
        Sleuthkit {
            toolchain: toolchain.clone(),
            timeout,
            default_volume,
        }
    }

    fn command(&self, tool: Tool) -> Result<ToolCommand> {
        Ok(self
            .toolchain
            .command(tool)
            .map_err(Error::Adapter)?
            .with_timeout(self.timeout))
    }

    /// Fills in fingerprints of regular files, one `icat` per inode.
    fn hash_contents(&self, image: &Path, objects: &mut [ParsedObject]) -> Result<()> {
        let mut hashed: HashMap<u64, std::result::Result<String, String>> = HashMap::new();
        for object in objects.iter_mut() {
            if object.facts.kind != Some(ObjectKind::File) || object.status == ParsedStatus::Deleted
            {
                continue;
            }
            let Some(key) = object.key else {
                continue;
            };

            let result = match hashed.get(&key.id) {
                Some(result) => result.clone(),
                None => {
                    let command = self
                        .command(Tool::Icat)?
                        .arg(image)
                        .arg(key.id.to_string());
                    let result = match command.hash_stdout() {
                        Ok((digest, _)) => Ok(digest),
                        Err(ToolError::Failed { diagnostic, .. }) => {
                            Err(format!("icat failed: {}", diagnostic.trim()))
                        }
                        // one inode taking icat down leaves the others readable
                        Err(err @ (ToolError::Crashed { .. } | ToolError::TimedOut { .. })) => {
                            warn!("inode {}: {err}", key.id);
                            Err(err.to_string())
                        }
                        Err(err) => return Err(Error::Adapter(err)),
                    };
                    hashed.insert(key.id, result.clone());
                    result
                }
            };
            match result {
                Ok(digest) => object.facts.fingerprint = Some(digest),
                Err(message) => object.parse_error = Some(message),
            }
        }
        Ok(())
    }
}

impl ParserBackend for Sleuthkit {
    fn name(&self) -> &str {
        "sleuthkit"
    }

    fn parse(&self, images: &ImageSet) -> Result<Vec<ParsedObject>> {
        let image = images
            .first()
            .ok_or_else(|| Error::Config("no image files to parse".into()))?;
        if images.images.len() > 1 {
            warn!("sleuthkit only reads the first of {} devices", images.images.len());
        }
        let volume = self
            .default_volume
            .unwrap_or(images.kind.top_level_volume());

        let fls = self
            .command(Tool::Fls)?
            .args(["-r", "-m", "/"])
            .arg(image)
            .run()
            .map_err(Error::Adapter)?;
        let mut objects = parse_body(&fls.stdout_text(), volume);
        if !fls.success() {
            objects.push(parse_failure(format!(
                "fls exited with status {}: {}",
                fls.status,
                fls.diagnostic().trim()
            )));
        }

        let ils = self
            .command(Tool::Ils)?
            .arg("-a")
            .arg(image)
            .run()
            .map_err(Error::Adapter)?;
        if ils.success() {
            let inodes = parse_ils(&ils.stdout_text());
            for object in &mut objects {
                let meta = object.key.and_then(|key| inodes.get(&key.id));
                if let Some(meta) = meta {
                    object.facts.nlink = Some(meta.nlink);
                    object.facts.mode = Some(meta.mode);
                }
            }
        } else {
            objects.push(parse_failure(format!(
                "ils exited with status {}: {}",
                ils.status,
                ils.diagnostic().trim()
            )));
        }

        self.hash_contents(image, &mut objects)?;
        link_parents_by_path(&mut objects);
        Ok(objects)
    }
}
