//! The encrypted SD card tree under "Nintendo 3DS".
//!
//! Every file below `Nintendo 3DS/<id0>/<id1>/` is AES-CTR encrypted with
//! the SD keyslot and an IV derived from its own path. [`SdRoot`] finds
//! the console's id0 directory from the SD KeyY and hands out per-id1
//! filesystems; titles installed on the card can be opened through the
//! same TMD-driven path as CDN contents.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::crypto::{CryptoEngine, Keyslot};
use crate::fileio::{shared, FileLike};
use crate::ncch::{NcchOptions, NcchReader};
use crate::tmd::{ContentChunk, Tmd};
use crate::vfs::{join, EntryInfo, Filesystem};
use crate::{LimonkaError, LimonkaResult};

use log::warn;

/// Root of an SD card's "Nintendo 3DS" directory.
pub struct SdRoot {
    crypto: CryptoEngine,
    id0: String,
    id0_path: PathBuf,
    id1s: Vec<String>,
    current_id1: String,
}

impl SdRoot {
    /// `path` points at the "Nintendo 3DS" directory. The engine must have
    /// the SD KeyY loaded (see [`CryptoEngine::setup_sd_key`]).
    pub fn new(path: &Path, crypto: CryptoEngine) -> LimonkaResult<Self> {
        let id0 = hex::encode(crypto.id0()?);
        let id0_path = path.join(&id0);
        if !id0_path.is_dir() {
            return Err(LimonkaError::MissingId0(id0));
        }

        let mut id1s = Vec::new();
        for entry in fs::read_dir(&id0_path)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.len() == 32 && name.bytes().all(|b| b.is_ascii_hexdigit()) {
                id1s.push(name);
            }
        }
        id1s.sort();
        let current_id1 = id1s
            .first()
            .cloned()
            .ok_or_else(|| LimonkaError::MissingId1(id0.clone()))?;

        Ok(Self {
            crypto,
            id0,
            id0_path,
            id1s,
            current_id1,
        })
    }

    #[must_use]
    pub fn id0(&self) -> &str {
        &self.id0
    }

    #[must_use]
    pub fn id1s(&self) -> &[String] {
        &self.id1s
    }

    #[must_use]
    pub fn current_id1(&self) -> &str {
        &self.current_id1
    }

    pub fn set_current_id1(&mut self, id1: &str) -> LimonkaResult<()> {
        if !self.id1s.iter().any(|known| known == id1) {
            return Err(LimonkaError::MissingId1(id1.to_string()));
        }
        self.current_id1 = id1.to_string();
        Ok(())
    }

    /// The decrypting filesystem of an id1 directory (default: current).
    pub fn filesystem(&self, id1: Option<&str>) -> LimonkaResult<SdFilesystem> {
        let id1 = id1.unwrap_or(&self.current_id1);
        if !self.id1s.iter().any(|known| known == id1) {
            return Err(LimonkaError::MissingId1(id1.to_string()));
        }
        Ok(SdFilesystem {
            crypto: self.crypto.clone(),
            root: self.id0_path.join(id1),
        })
    }

    /// Opens an installed title by title id, picking the TMD with the
    /// smallest numeric filename in its content directory.
    pub fn open_title(&self, title_id: u64) -> LimonkaResult<SdTitleReader> {
        let fs = self.filesystem(None)?;
        let content_dir = format!(
            "/title/{:08x}/{:08x}/content",
            (title_id >> 32) as u32,
            title_id as u32
        );
        let mut tmds: Vec<(u32, String)> = Vec::new();
        let entries = fs
            .listdir(&content_dir)
            .map_err(|_| LimonkaError::MissingTitle(format!("{title_id:016x}")))?;
        for name in entries {
            if let Some(prefix) = name.strip_suffix(".tmd") {
                if let Ok(index) = u32::from_str_radix(prefix, 16) {
                    tmds.push((index, name));
                }
            }
        }
        let (_, tmd_name) = tmds
            .into_iter()
            .min()
            .ok_or_else(|| LimonkaError::MissingTitle(format!("{title_id:016x}")))?;
        SdTitleReader::new(&fs, &join(&content_dir, &tmd_name), &NcchOptions::default())
    }
}

/// One id1 directory, with transparent SD crypto.
pub struct SdFilesystem {
    crypto: CryptoEngine,
    root: PathBuf,
}

impl SdFilesystem {
    fn real(&self, path: &str) -> PathBuf {
        let mut real = self.root.clone();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            real.push(part);
        }
        real
    }

    fn normalized(path: &str) -> String {
        let cleaned: Vec<&str> = path
            .split(['/', '\\'])
            .filter(|p| !p.is_empty())
            .collect();
        format!("/{}", cleaned.join("/"))
    }

    fn open_inner(&self, path: &str, write: bool) -> LimonkaResult<Box<dyn FileLike>> {
        let normalized = Self::normalized(path);
        // DSiWare exports use a different encryption layered over the SD
        // crypto and cannot be opened this way
        if normalized.contains("Nintendo DSiWare") {
            return Err(LimonkaError::UnsupportedDsiWare);
        }
        let real = self.real(&normalized);
        let file: Box<dyn FileLike> = if write {
            Box::new(fs::OpenOptions::new().read(true).write(true).open(real)?)
        } else {
            Box::new(crate::fileio::ReadOnly(fs::File::open(real)?))
        };
        let iv = CryptoEngine::sd_path_to_iv(&normalized);
        Ok(Box::new(self.crypto.create_ctr_io(
            Keyslot::Sd as u8,
            file,
            iv,
        )?))
    }

    /// Opens a file for reading and writing, decrypting and re-encrypting
    /// on the fly.
    pub fn open_rw(&self, path: &str) -> LimonkaResult<Box<dyn FileLike>> {
        self.open_inner(path, true)
    }
}

impl Filesystem for SdFilesystem {
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
        self.open_inner(path, false)
    }
}

/// Reads a title installed under "Nintendo 3DS" (or any filesystem laid
/// out the same way: a TMD next to `<content id>.app` files).
pub struct SdTitleReader {
    tmd: Tmd,
    content_info: Vec<ContentChunk>,
    contents: BTreeMap<u16, NcchReader>,
}

impl SdTitleReader {
    pub fn new(
        fs: &dyn Filesystem,
        tmd_path: &str,
        ncch_options: &NcchOptions,
    ) -> LimonkaResult<Self> {
        let mut tmd_raw = Vec::new();
        {
            use std::io::Read;
            fs.open(tmd_path)?.read_to_end(&mut tmd_raw)?;
        }
        let tmd = Tmd::from_bytes(&tmd_raw)?;

        let dir = match tmd_path.rfind('/') {
            Some(at) => &tmd_path[..at],
            None => "",
        };

        let title_is_twl = tmd
            .title_id()
            .map(|tid| tid.is_twl())
            .unwrap_or(false);

        let mut content_info = Vec::new();
        let mut contents = BTreeMap::new();
        for record in tmd.chunk_records() {
            // the console stores these names lowercase
            let path = join(dir, &format!("{}.app", record.id_hex()));
            if !fs.exists(&path) {
                continue;
            }
            content_info.push(*record);
            if title_is_twl && record.index() == 0 {
                continue;
            }
            let open = || -> LimonkaResult<NcchReader> {
                NcchReader::new(shared(fs.open(&path)?), None, ncch_options)
            };
            match open() {
                Ok(ncch) => {
                    contents.insert(record.index(), ncch);
                }
                Err(err) => warn!("SD title content {path} failed to parse: {err}"),
            }
        }

        Ok(Self {
            tmd,
            content_info,
            contents,
        })
    }

    #[must_use]
    pub fn tmd(&self) -> &Tmd {
        &self.tmd
    }

    /// Chunk records for contents that exist on disk.
    #[must_use]
    pub fn content_info(&self) -> &[ContentChunk] {
        &self.content_info
    }

    #[must_use]
    pub fn contents(&self) -> &BTreeMap<u16, NcchReader> {
        &self.contents
    }
}
