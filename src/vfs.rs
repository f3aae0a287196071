//! A minimal read-only filesystem interface.
//!
//! RomFS images, the encrypted SD tree and plain OS directories all expose
//! this same surface, so the title readers (CDN, SD titles) can work over
//! any of them.

use std::fs;
use std::path::{Path, PathBuf};

use crate::fileio::{shared, FileLike, ReadOnly};
use crate::{LimonkaError, LimonkaResult};

/// Entry metadata returned by [`Filesystem::getinfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub is_file: bool,
    pub is_dir: bool,
    pub size: u64,
}

/// Read-only filesystem operations. Paths use `/` separators and are
/// relative to the filesystem root; a leading `/` is accepted.
pub trait Filesystem {
    /// Names of the entries in a directory.
    fn listdir(&self, path: &str) -> LimonkaResult<Vec<String>>;
    /// Metadata for a file or directory.
    fn getinfo(&self, path: &str) -> LimonkaResult<EntryInfo>;
    /// Opens a file for reading.
    fn open(&self, path: &str) -> LimonkaResult<Box<dyn FileLike>>;

    fn exists(&self, path: &str) -> bool {
        self.getinfo(path).is_ok()
    }

    /// Walks the tree depth-first, yielding `(dir, entries)` pairs.
    fn walk(&self, path: &str, out: &mut Vec<(String, Vec<String>)>) -> LimonkaResult<()> {
        let entries = self.listdir(path)?;
        for entry in &entries {
            let sub = join(path, entry);
            if self.getinfo(&sub)?.is_dir {
                self.walk(&sub, out)?;
            }
        }
        out.push((path.to_string(), entries));
        Ok(())
    }
}

pub(crate) fn join(base: &str, name: &str) -> String {
    if base.is_empty() || base == "/" {
        format!("/{name}")
    } else {
        format!("{}/{name}", base.trim_end_matches('/'))
    }
}

/// A plain OS directory as a [`Filesystem`]; used for CDN layouts on disk.
pub struct OsDir {
    root: PathBuf,
}

impl OsDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn real(&self, path: &str) -> PathBuf {
        let mut real = self.root.clone();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            real.push(part);
        }
        real
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Filesystem for OsDir {
    fn listdir(&self, path: &str) -> LimonkaResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.real(path))? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn getinfo(&self, path: &str) -> LimonkaResult<EntryInfo> {
        let meta = fs::metadata(self.real(path))?;
        Ok(EntryInfo {
            is_file: meta.is_file(),
            is_dir: meta.is_dir(),
            size: meta.len(),
        })
    }

    fn open(&self, path: &str) -> LimonkaResult<Box<dyn FileLike>> {
        let real = self.real(path);
        let file = fs::File::open(&real).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LimonkaError::MissingTitle(real.to_string_lossy().into_owned())
            } else {
                e.into()
            }
        })?;
        Ok(Box::new(ReadOnly(file)))
    }
}

/// Convenience: opens an OS file read-only as a [`crate::fileio::SharedFile`].
pub fn open_os_file(path: &Path) -> LimonkaResult<crate::fileio::SharedFile> {
    Ok(shared(ReadOnly(fs::File::open(path)?)))
}

/// Convenience: opens an OS file read-write as a [`crate::fileio::SharedFile`].
pub fn open_os_file_rw(path: &Path) -> LimonkaResult<crate::fileio::SharedFile> {
    Ok(shared(fs::OpenOptions::new().read(true).write(true).open(path)?))
}
