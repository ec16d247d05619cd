use std::{
    io::{Error, ErrorKind, Read, Result},
    path::{Component, Path, PathBuf},
};

use rustix::io::{Errno, Result as ErrnoResult};
use sha2::{Digest, Sha256};

use crate::IO_CHUNK;

/// A utility type representing a SHA-256 digest in binary.
pub type Sha256Digest = [u8; 32];

/// Parse a string containing a SHA256 digest in hexidecimal form into a Sha256Digest.
///
/// The string must contain exactly 64 characters and consist entirely of [0-9a-f], case
/// insensitive.
///
/// In case of a failure to parse the string, this function returns ErrorKind::InvalidInput.
pub fn parse_sha256(string: impl AsRef<str>) -> Result<Sha256Digest> {
    let mut value = [0u8; 32];
    hex::decode_to_slice(string.as_ref(), &mut value)
        .map_err(|source| Error::new(ErrorKind::InvalidInput, source))?;
    Ok(value)
}

/// Hashes everything `reader` produces, returning the lowercase hex digest and the byte count.
pub fn sha256_reader(reader: &mut impl Read) -> Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; IO_CHUNK];
    let mut total = 0u64;
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                hasher.update(&buffer[..n]);
                total += n as u64;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok((hex::encode(hasher.finalize()), total))
}

/// Hashes a file on the host.
pub fn sha256_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    Ok(sha256_reader(&mut file)?.0)
}

pub(crate) trait ErrnoFilter<T> {
    fn filter_errno(self, ignored: Errno) -> ErrnoResult<Option<T>>;
}

impl<T> ErrnoFilter<T> for ErrnoResult<T> {
    fn filter_errno(self, ignored: Errno) -> ErrnoResult<Option<T>> {
        match self {
            Ok(result) => Ok(Some(result)),
            Err(err) if err == ignored => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Brings an image path into canonical form: absolute, `/`-separated, no `.`
/// or `..` components, no trailing slash.  The filesystem root is `/`.
pub fn normalize_path(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            format!("image path {path:?} is not absolute"),
        ));
    }

    let mut parts = vec![];
    for component in Path::new(path).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(name) => match name.to_str() {
                Some(name) => parts.push(name),
                None => {
                    return Err(Error::new(
                        ErrorKind::InvalidInput,
                        format!("image path {path:?} is not UTF-8"),
                    ))
                }
            },
            Component::ParentDir | Component::Prefix(_) => {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("image path {path:?} must not contain '..'"),
                ))
            }
        }
    }

    Ok(format!("/{}", parts.join("/")))
}

/// The parent of a normalized image path; the parent of `/` is `/`.
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// The last component of a normalized image path; empty for `/`.
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Whether `path` is `prefix` itself or lies below it.
pub fn is_within(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Rebases a normalized image path `path` from `from` onto `to`.
pub fn rebase(path: &str, from: &str, to: &str) -> String {
    let rest = if from == "/" {
        path
    } else {
        &path[from.len()..]
    };
    match (to, rest) {
        (to, "") => to.to_string(),
        ("/", rest) => rest.to_string(),
        (to, rest) => format!("{to}{rest}"),
    }
}

/// Maps a normalized image path below the mount point `root`.
pub fn host_path(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_parse_sha256() {
        let valid = "a".repeat(64);
        assert_eq!(parse_sha256(&valid).unwrap(), [0xaa; 32]);
        assert_eq!(
            parse_sha256("abc").unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            parse_sha256("z".repeat(64)).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_sha256_reader() {
        let (digest, len) = sha256_reader(&mut (b"" as &[u8])).unwrap();
        assert_eq!(
            digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(len, 0);

        let (digest, len) = sha256_reader(&mut (b"abc" as &[u8])).unwrap();
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(len, 3);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("/a/b/").unwrap(), "/a/b");
        assert_eq!(normalize_path("//a/./b").unwrap(), "/a/b");
        assert!(normalize_path("a/b").is_err());
        assert!(normalize_path("/a/../b").is_err());
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(parent_path("/a/f"), "/a");
        assert_eq!(parent_path("/a"), "/");
        assert_eq!(parent_path("/"), "/");
        assert_eq!(file_name("/a/f"), "f");
        assert_eq!(file_name("/"), "");

        assert!(is_within("/a/f", "/a"));
        assert!(is_within("/a", "/a"));
        assert!(!is_within("/ab", "/a"));
        assert!(is_within("/ab", "/"));

        assert_eq!(rebase("/a/f", "/a", "/snap"), "/snap/f");
        assert_eq!(rebase("/a", "/a", "/snap"), "/snap");
        assert_eq!(rebase("/a/f", "/", "/snap"), "/snap/a/f");
        assert_eq!(rebase("/a/f", "/a", "/"), "/f");

        assert_eq!(
            host_path(Path::new("/mnt"), "/a/f"),
            PathBuf::from("/mnt/a/f")
        );
        assert_eq!(host_path(Path::new("/mnt"), "/"), PathBuf::from("/mnt/"));
    }
}
