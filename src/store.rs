// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

//! Content stores the cache daemon serves from.
//!
//! A store resolves a request path to a reader that knows its total size.
//! `Ok(None)` means "not in the cache"; `Err` is a store failure.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Sequential reader over one cached file.
pub trait ContentReader: Send {
    /// Total bytes the reader will produce.
    fn size(&self) -> u64;

    /// Read up to `buf.len()` bytes. `Ok(0)` means end of content.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Path-to-content lookup.
pub trait ContentStore: Send + Sync {
    fn open(&self, path: &str) -> io::Result<Option<Box<dyn ContentReader>>>;
}

impl<S: ContentStore + ?Sized> ContentStore for Arc<S> {
    fn open(&self, path: &str) -> io::Result<Option<Box<dyn ContentReader>>> {
        (**self).open(path)
    }
}

impl<S: ContentStore + ?Sized> ContentStore for Box<S> {
    fn open(&self, path: &str) -> io::Result<Option<Box<dyn ContentReader>>> {
        (**self).open(path)
    }
}

struct FileReader {
    file: File,
    size: u64,
}

impl ContentReader for FileReader {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.file.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }
}

/// Open `local` as a regular file. Missing files and non-files are "not found".
fn open_file(local: &Path) -> io::Result<Option<Box<dyn ContentReader>>> {
    let file = match File::open(local) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let meta = file.metadata()?;
    if !meta.is_file() {
        return Ok(None);
    }
    Ok(Some(Box::new(FileReader {
        file,
        size: meta.len(),
    })))
}

/// Serves the files below a root directory.
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::Store(format!("{} is not a directory", root.display())));
        }
        Ok(Self { root })
    }

    /// Map a request path onto the root. Only plain components are accepted.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let rel = path.strip_prefix('/')?;
        let mut local = self.root.clone();
        for component in Path::new(rel).components() {
            match component {
                Component::Normal(part) => local.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        if local == self.root {
            return None;
        }
        Some(local)
    }
}

impl ContentStore for DirectoryStore {
    fn open(&self, path: &str) -> io::Result<Option<Box<dyn ContentReader>>> {
        match self.resolve(path) {
            Some(local) => open_file(&local),
            None => {
                debug!(path, "rejected request path");
                Ok(None)
            }
        }
    }
}

/// Serves the files listed in an index of `<request-path> <local-file>` lines.
pub struct IndexedStore {
    entries: HashMap<String, PathBuf>,
}

impl IndexedStore {
    /// Load the index file. Relative local paths resolve against the index
    /// file's directory.
    pub fn load(index: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(index)?;
        let base = index.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&contents, base)
    }

    pub fn parse(contents: &str, base: &Path) -> Result<Self> {
        let mut entries = HashMap::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(request), Some(local), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(Error::Store(format!(
                    "index line {}: expected `<request-path> <local-file>`",
                    lineno + 1
                )));
            };
            entries.insert(request.to_string(), base.join(local));
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ContentStore for IndexedStore {
    fn open(&self, path: &str) -> io::Result<Option<Box<dyn ContentReader>>> {
        let Some(local) = self.entries.get(path) else {
            return Ok(None);
        };
        let reader = open_file(local)?;
        if reader.is_none() {
            warn!(path, local = %local.display(), "indexed file is missing");
        }
        Ok(reader)
    }
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    files: RwLock<HashMap<String, Arc<[u8]>>>,
}

struct MemoryReader {
    data: Arc<[u8]>,
    pos: usize,
}

impl ContentReader for MemoryReader {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        let contents: Vec<u8> = contents.into();
        self.files.write().unwrap().insert(path.into(), contents.into());
    }

    pub fn remove(&self, path: &str) -> bool {
        self.files.write().unwrap().remove(path).is_some()
    }
}

impl ContentStore for MemoryStore {
    fn open(&self, path: &str) -> io::Result<Option<Box<dyn ContentReader>>> {
        let files = self.files.read().unwrap();
        Ok(files.get(path).map(|data| {
            Box::new(MemoryReader {
                data: Arc::clone(data),
                pos: 0,
            }) as Box<dyn ContentReader>
        }))
    }
}

/// Open the store at `location`: a directory is served as-is, a file is
/// read as an index.
pub fn open_store(location: &Path) -> Result<Box<dyn ContentStore>> {
    if location.is_dir() {
        Ok(Box::new(DirectoryStore::new(location)?))
    } else if location.is_file() {
        let store = IndexedStore::load(location)?;
        debug!(entries = store.len(), index = %location.display(), "loaded cache index");
        Ok(Box::new(store))
    } else {
        Err(Error::Store(format!("{} does not exist", location.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(mut reader: Box<dyn ContentReader>) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn directory_store_serves_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), b"hello world").unwrap();

        let store = DirectoryStore::new(dir.path()).unwrap();
        let reader = store.open("/sub/a.txt").unwrap().expect("found");
        assert_eq!(reader.size(), 11);
        assert_eq!(read_all(reader), b"hello world");
        assert!(store.open("/missing").unwrap().is_none());
    }

    #[test]
    fn directory_store_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path()).unwrap();
        assert!(store.resolve("/../etc/passwd").is_none());
        assert!(store.resolve("relative").is_none());
        assert!(store.resolve("/").is_none());
        assert!(store.open("/sub").unwrap().is_none());
    }

    #[test]
    fn index_parses_and_resolves_relative_paths() {
        let store = IndexedStore::parse(
            "# comment\n\n/a.txt files/a.txt\n/b.bin /abs/b.bin\n",
            Path::new("/srv/cache"),
        )
        .unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.entries["/a.txt"], Path::new("/srv/cache/files/a.txt"));
        assert_eq!(store.entries["/b.bin"], Path::new("/abs/b.bin"));
    }

    #[test]
    fn index_rejects_malformed_lines() {
        assert!(IndexedStore::parse("/a.txt\n", Path::new(".")).is_err());
        assert!(IndexedStore::parse("/a b c\n", Path::new(".")).is_err());
    }

    #[test]
    fn indexed_store_reads_listed_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("local.dat"), vec![7u8; 300]).unwrap();
        let index = dir.path().join("locals.txt");
        std::fs::write(&index, "/remote/x local.dat\n/gone nothing.dat\n").unwrap();

        let store = open_store(&index).unwrap();
        let reader = store.open("/remote/x").unwrap().expect("found");
        assert_eq!(reader.size(), 300);
        assert_eq!(read_all(reader), vec![7u8; 300]);
        assert!(store.open("/gone").unwrap().is_none());
        assert!(store.open("/unlisted").unwrap().is_none());
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        store.insert("/m", b"abcdefghij".to_vec());
        let reader = store.open("/m").unwrap().unwrap();
        assert_eq!(reader.size(), 10);
        assert_eq!(read_all(reader), b"abcdefghij");
        assert!(store.remove("/m"));
        assert!(store.open("/m").unwrap().is_none());
    }
}
