//! Byte-addressable storage abstraction.
//!
//! Every repository, branch and control directory reads and writes through a
//! [`Transport`]. Paths are `/`-separated and relative to the transport base;
//! `..` segments address the parent of the base, which is how pack storage
//! moves files between sibling directories.

use crate::errors::{BzrError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use url::Url;

/// Size and kind of a transport entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub is_dir: bool,
}

/// Storage interface consumed by every on-disk format.
///
/// All implementations must make `put_bytes` atomic: readers see either the
/// old or the new content, never a partial file.
pub trait Transport: Send + Sync + fmt::Debug {
    /// URL of the transport base, ending in `/`.
    fn base(&self) -> String;

    /// A transport rooted at `relpath` below this one.
    fn clone_to(&self, relpath: &str) -> Result<Arc<dyn Transport>>;

    fn get_bytes(&self, relpath: &str) -> Result<Vec<u8>>;

    /// Read several `(offset, length)` ranges of one file.
    fn readv(&self, relpath: &str, offsets: &[(u64, u64)]) -> Result<Vec<Vec<u8>>> {
        let data = self.get_bytes(relpath)?;
        slice_ranges(relpath, &data, offsets)
    }

    fn put_bytes(&self, relpath: &str, bytes: &[u8]) -> Result<()>;

    /// Append to a file, creating it if needed. Returns the offset the
    /// bytes were written at.
    fn append_bytes(&self, relpath: &str, bytes: &[u8]) -> Result<u64>;

    fn has(&self, relpath: &str) -> Result<bool>;

    fn stat(&self, relpath: &str) -> Result<FileStat>;

    /// Names directly inside a directory, sorted.
    fn list_dir(&self, relpath: &str) -> Result<Vec<String>>;

    /// Create a directory; fails with `FileExists` if it is already there.
    fn mkdir(&self, relpath: &str) -> Result<()>;

    fn rename(&self, from: &str, to: &str) -> Result<()>;

    fn delete(&self, relpath: &str) -> Result<()>;

    fn rmdir(&self, relpath: &str) -> Result<()>;

    fn is_readonly(&self) -> bool {
        false
    }

    /// Create a directory unless it already exists.
    fn ensure_dir(&self, relpath: &str) -> Result<()> {
        match self.mkdir(relpath) {
            Ok(()) | Err(BzrError::FileExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Cut `offsets` out of a complete file body.
pub fn slice_ranges(relpath: &str, data: &[u8], offsets: &[(u64, u64)]) -> Result<Vec<Vec<u8>>> {
    offsets
        .iter()
        .map(|&(offset, length)| {
            let start = offset as usize;
            let end = start.saturating_add(length as usize);
            if end > data.len() {
                return Err(BzrError::ShortReadvError {
                    path: relpath.to_string(),
                    offset,
                    length,
                    actual: data.len().saturating_sub(start) as u64,
                });
            }
            Ok(data[start..end].to_vec())
        })
        .collect()
}

/// Resolve a relative path against a base given as segments.
///
/// `.` and empty segments are dropped, `..` pops a segment. Escaping above
/// the root is an error.
pub fn resolve_segments(base: &[String], relpath: &str) -> Result<Vec<String>> {
    let mut segments = base.to_vec();
    for part in relpath.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(BzrError::PathNotChild {
                        path: relpath.to_string(),
                        base: format!("/{}", base.join("/")),
                    });
                }
            }
            other => segments.push(other.to_string()),
        }
    }
    Ok(segments)
}

fn invalid_url(location: &str, extra: impl fmt::Display) -> BzrError {
    BzrError::InvalidUrl {
        url: location.to_string(),
        extra: extra.to_string(),
    }
}

/// `location` as an absolute URL, or `None` when it is a local path.
pub fn absolute_url(location: &str) -> Result<Option<Url>> {
    match Url::parse(location) {
        // One letter is a Windows drive, not a scheme.
        Ok(url) if url.scheme().len() > 1 => Ok(Some(url)),
        Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) => Ok(None),
        Err(e) => Err(invalid_url(location, e)),
    }
}

/// The URL of the directory named by `location` (a URL or a local path),
/// ending in `/` so relative locations join below it.
pub fn directory_url(location: &str) -> Result<Url> {
    let mut url = match absolute_url(location)? {
        Some(url) => url,
        None => Url::from_directory_path(normalize_path(&std::path::absolute(location)?))
            .map_err(|()| invalid_url(location, "not a directory path"))?,
    };
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Join `location` onto the directory `base`. Absolute URLs and absolute
/// paths are returned as they are.
pub fn join_location(base: &str, location: &str) -> Result<String> {
    if let Some(url) = absolute_url(location)? {
        return Ok(url.to_string());
    }
    if Path::new(location).is_absolute() {
        return Ok(location.to_string());
    }
    let joined = directory_url(base)?.join(location).map_err(|e| invalid_url(location, e))?;
    Ok(joined.to_string())
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                clean.pop();
            }
            other => clean.push(other),
        }
    }
    clean
}

/// Open a transport for a `file://` URL, a plain path, or `memory:///`.
pub fn get_transport(location: &str) -> Result<Arc<dyn Transport>> {
    let Some(url) = absolute_url(location)? else {
        return Ok(Arc::new(LocalTransport::new(location)));
    };
    match url.scheme() {
        "file" => {
            let path = url.to_file_path().map_err(|()| invalid_url(location, "not a local path"))?;
            Ok(Arc::new(LocalTransport::new(path)))
        }
        "memory" => Ok(Arc::new(MemoryTransport::new())),
        _ => Err(invalid_url(location, "unsupported scheme")),
    }
}

// ==================== Local filesystem ====================

/// Transport over a directory of the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    root: PathBuf,
}

impl LocalTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { root: path.into() }
    }

    fn abspath(&self, relpath: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in relpath.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    path.pop();
                }
                other => path.push(other),
            }
        }
        path
    }

    fn map_err(&self, relpath: &str, err: io::Error) -> BzrError {
        let path = self.abspath(relpath).display().to_string();
        match err.kind() {
            io::ErrorKind::NotFound => BzrError::NoSuchFile(path),
            io::ErrorKind::AlreadyExists => BzrError::FileExists(path),
            io::ErrorKind::PermissionDenied => BzrError::PermissionDenied {
                path,
                extra: String::new(),
            },
            io::ErrorKind::DirectoryNotEmpty => BzrError::DirectoryNotEmpty(path),
            _ => BzrError::Io(err),
        }
    }
}

impl Transport for LocalTransport {
    fn base(&self) -> String {
        directory_url(&self.root.to_string_lossy())
            .map(String::from)
            .unwrap_or_else(|_| format!("file://{}/", self.root.display()))
    }

    fn clone_to(&self, relpath: &str) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(LocalTransport::new(self.abspath(relpath))))
    }

    fn get_bytes(&self, relpath: &str) -> Result<Vec<u8>> {
        fs::read(self.abspath(relpath)).map_err(|e| self.map_err(relpath, e))
    }

    fn put_bytes(&self, relpath: &str, bytes: &[u8]) -> Result<()> {
        let path = self.abspath(relpath);
        let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp_path, bytes).map_err(|e| self.map_err(relpath, e))?;
        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(self.map_err(relpath, e));
        }
        Ok(())
    }

    fn append_bytes(&self, relpath: &str, bytes: &[u8]) -> Result<u64> {
        let path = self.abspath(relpath);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| self.map_err(relpath, e))?;
        let offset = file.metadata()?.len();
        file.write_all(bytes)?;
        Ok(offset)
    }

    fn has(&self, relpath: &str) -> Result<bool> {
        Ok(self.abspath(relpath).exists())
    }

    fn stat(&self, relpath: &str) -> Result<FileStat> {
        let meta = fs::metadata(self.abspath(relpath)).map_err(|e| self.map_err(relpath, e))?;
        Ok(FileStat {
            size: meta.len(),
            is_dir: meta.is_dir(),
        })
    }

    fn list_dir(&self, relpath: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.abspath(relpath)).map_err(|e| self.map_err(relpath, e))? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn mkdir(&self, relpath: &str) -> Result<()> {
        fs::create_dir(self.abspath(relpath)).map_err(|e| self.map_err(relpath, e))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.abspath(from), self.abspath(to)).map_err(|e| self.map_err(from, e))
    }

    fn delete(&self, relpath: &str) -> Result<()> {
        fs::remove_file(self.abspath(relpath)).map_err(|e| self.map_err(relpath, e))
    }

    fn rmdir(&self, relpath: &str) -> Result<()> {
        fs::remove_dir(self.abspath(relpath)).map_err(|e| self.map_err(relpath, e))
    }
}

// ==================== In-memory ====================

#[derive(Debug, Default)]
struct MemoryFs {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
}

impl MemoryFs {
    fn is_dir(&self, path: &str) -> bool {
        path.is_empty() || self.dirs.contains(path)
    }

    fn children(&self, dir: &str) -> BTreeSet<String> {
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };
        self.files
            .keys()
            .chain(self.dirs.iter())
            .filter_map(|p| p.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty())
            .map(|rest| rest.split('/').next().unwrap_or(rest).to_string())
            .collect()
    }
}

/// A transport whose files live in process memory. Clones share storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    fs: Arc<Mutex<MemoryFs>>,
    prefix: Vec<String>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryFs> {
        self.fs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn path(&self, relpath: &str) -> Result<String> {
        Ok(resolve_segments(&self.prefix, relpath)?.join("/"))
    }

    fn parent_of(path: &str) -> &str {
        path.rfind('/').map(|i| &path[..i]).unwrap_or("")
    }

    fn check_parent(fs: &MemoryFs, path: &str) -> Result<()> {
        if fs.is_dir(Self::parent_of(path)) {
            Ok(())
        } else {
            Err(BzrError::NoSuchFile(format!("memory:///{}", path)))
        }
    }
}

impl Transport for MemoryTransport {
    fn base(&self) -> String {
        if self.prefix.is_empty() {
            "memory:///".to_string()
        } else {
            format!("memory:///{}/", self.prefix.join("/"))
        }
    }

    fn clone_to(&self, relpath: &str) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(MemoryTransport {
            fs: Arc::clone(&self.fs),
            prefix: resolve_segments(&self.prefix, relpath)?,
        }))
    }

    fn get_bytes(&self, relpath: &str) -> Result<Vec<u8>> {
        let path = self.path(relpath)?;
        self.lock()
            .files
            .get(&path)
            .cloned()
            .ok_or_else(|| BzrError::NoSuchFile(format!("memory:///{}", path)))
    }

    fn put_bytes(&self, relpath: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(relpath)?;
        let mut fs = self.lock();
        Self::check_parent(&fs, &path)?;
        fs.files.insert(path, bytes.to_vec());
        Ok(())
    }

    fn append_bytes(&self, relpath: &str, bytes: &[u8]) -> Result<u64> {
        let path = self.path(relpath)?;
        let mut fs = self.lock();
        Self::check_parent(&fs, &path)?;
        let file = fs.files.entry(path).or_default();
        let offset = file.len() as u64;
        file.extend_from_slice(bytes);
        Ok(offset)
    }

    fn has(&self, relpath: &str) -> Result<bool> {
        let path = self.path(relpath)?;
        let fs = self.lock();
        Ok(fs.files.contains_key(&path) || fs.is_dir(&path))
    }

    fn stat(&self, relpath: &str) -> Result<FileStat> {
        let path = self.path(relpath)?;
        let fs = self.lock();
        if let Some(data) = fs.files.get(&path) {
            return Ok(FileStat {
                size: data.len() as u64,
                is_dir: false,
            });
        }
        if fs.is_dir(&path) {
            return Ok(FileStat { size: 0, is_dir: true });
        }
        Err(BzrError::NoSuchFile(format!("memory:///{}", path)))
    }

    fn list_dir(&self, relpath: &str) -> Result<Vec<String>> {
        let path = self.path(relpath)?;
        let fs = self.lock();
        if !fs.is_dir(&path) {
            return Err(BzrError::NoSuchFile(format!("memory:///{}", path)));
        }
        Ok(fs.children(&path).into_iter().collect())
    }

    fn mkdir(&self, relpath: &str) -> Result<()> {
        let path = self.path(relpath)?;
        let mut fs = self.lock();
        if fs.is_dir(&path) || fs.files.contains_key(&path) {
            return Err(BzrError::FileExists(format!("memory:///{}", path)));
        }
        Self::check_parent(&fs, &path)?;
        fs.dirs.insert(path);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = self.path(from)?;
        let to = self.path(to)?;
        let mut fs = self.lock();
        Self::check_parent(&fs, &to)?;
        if let Some(data) = fs.files.remove(&from) {
            fs.files.insert(to, data);
            return Ok(());
        }
        if !fs.dirs.contains(&from) {
            return Err(BzrError::NoSuchFile(format!("memory:///{}", from)));
        }
        if fs.dirs.contains(&to) && !fs.children(&to).is_empty() {
            return Err(BzrError::DirectoryNotEmpty(format!("memory:///{}", to)));
        }
        let prefix = format!("{}/", from);
        let moved_files: Vec<String> = fs.files.keys().filter(|k| k.starts_with(&prefix)).cloned().collect();
        for old in moved_files {
            if let Some(data) = fs.files.remove(&old) {
                fs.files.insert(format!("{}/{}", to, &old[prefix.len()..]), data);
            }
        }
        let moved_dirs: Vec<String> = fs.dirs.iter().filter(|k| k.starts_with(&prefix)).cloned().collect();
        for old in moved_dirs {
            fs.dirs.remove(&old);
            fs.dirs.insert(format!("{}/{}", to, &old[prefix.len()..]));
        }
        fs.dirs.remove(&from);
        fs.dirs.insert(to);
        Ok(())
    }

    fn delete(&self, relpath: &str) -> Result<()> {
        let path = self.path(relpath)?;
        self.lock()
            .files
            .remove(&path)
            .map(|_| ())
            .ok_or_else(|| BzrError::NoSuchFile(format!("memory:///{}", path)))
    }

    fn rmdir(&self, relpath: &str) -> Result<()> {
        let path = self.path(relpath)?;
        let mut fs = self.lock();
        if !fs.dirs.contains(&path) {
            return Err(BzrError::NoSuchFile(format!("memory:///{}", path)));
        }
        if !fs.children(&path).is_empty() {
            return Err(BzrError::DirectoryNotEmpty(format!("memory:///{}", path)));
        }
        fs.dirs.remove(&path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(t: &dyn Transport) {
        t.mkdir("packs").unwrap();
        assert!(matches!(t.mkdir("packs"), Err(BzrError::FileExists(_))));
        t.put_bytes("packs/a", b"hello world").unwrap();
        assert_eq!(t.get_bytes("packs/a").unwrap(), b"hello world");
        assert_eq!(t.stat("packs/a").unwrap().size, 11);
        assert!(t.stat("packs").unwrap().is_dir);

        let ranges = t.readv("packs/a", &[(0, 5), (6, 5)]).unwrap();
        assert_eq!(ranges, vec![b"hello".to_vec(), b"world".to_vec()]);
        assert!(matches!(
            t.readv("packs/a", &[(8, 10)]),
            Err(BzrError::ShortReadvError { .. })
        ));

        assert_eq!(t.append_bytes("packs/b", b"abc").unwrap(), 0);
        assert_eq!(t.append_bytes("packs/b", b"def").unwrap(), 3);
        assert_eq!(t.get_bytes("packs/b").unwrap(), b"abcdef");

        assert_eq!(t.list_dir("packs").unwrap(), vec!["a".to_string(), "b".to_string()]);

        t.mkdir("obsolete").unwrap();
        let packs = t.clone_to("packs").unwrap();
        packs.rename("a", "../obsolete/a").unwrap();
        assert!(!t.has("packs/a").unwrap());
        assert_eq!(t.get_bytes("obsolete/a").unwrap(), b"hello world");

        assert!(matches!(t.rmdir("packs"), Err(BzrError::DirectoryNotEmpty(_))));
        t.delete("packs/b").unwrap();
        t.rmdir("packs").unwrap();
        assert!(t.get_bytes("packs/b").unwrap_err().is_no_such_file());
        assert!(matches!(t.put_bytes("missing/x", b""), Err(BzrError::NoSuchFile(_))));
    }

    #[test]
    fn test_local_transport() {
        let temp_dir = TempDir::new().unwrap();
        let t = LocalTransport::new(temp_dir.path());
        exercise(&t);
    }

    #[test]
    fn test_memory_transport() {
        let t = MemoryTransport::new();
        exercise(&t);
    }

    #[test]
    fn test_memory_rename_directory() {
        let t = MemoryTransport::new();
        t.mkdir("upload").unwrap();
        t.mkdir("upload/x").unwrap();
        t.put_bytes("upload/x/f", b"1").unwrap();
        t.rename("upload/x", "moved").unwrap();
        assert_eq!(t.get_bytes("moved/f").unwrap(), b"1");
        assert!(!t.has("upload/x").unwrap());
    }

    #[test]
    fn test_locations() {
        let temp_dir = TempDir::new().unwrap();
        let base = LocalTransport::new(temp_dir.path().join("feature")).base();
        assert!(base.starts_with("file:///") && base.ends_with("/feature/"), "{}", base);

        let trunk = join_location(&base, "../trunk").unwrap();
        assert_eq!(trunk, base.replace("/feature/", "/trunk"));
        let t = get_transport(&trunk).unwrap();
        assert_eq!(t.base(), format!("{}/", trunk));

        assert_eq!(join_location(&base, "/srv/trunk").unwrap(), "/srv/trunk");
        assert_eq!(join_location(&base, "dbzr://host/x").unwrap(), "dbzr://host/x");
        assert_eq!(
            join_location("dbzr://host:4155/a/feature/", "../trunk").unwrap(),
            "dbzr://host:4155/a/trunk"
        );
        assert_eq!(
            join_location("file:///srv/a%20b/", "c").unwrap(),
            "file:///srv/a%20b/c"
        );
        assert!(matches!(get_transport("nosuch://host/"), Err(BzrError::InvalidUrl { .. })));
        assert!(matches!(get_transport("dbzr://[::1/"), Err(BzrError::InvalidUrl { .. })));
    }

    #[test]
    fn test_resolve_segments_rejects_escape() {
        assert!(resolve_segments(&[], "..").is_err());
        let base = vec!["a".to_string(), "b".to_string()];
        assert_eq!(resolve_segments(&base, "../c/./d").unwrap(), vec!["a", "c", "d"]);
    }
}
