//! Seed database for NCCH containers that use seed crypto.
//!
//! `seeddb.bin` format: a little-endian u32 entry count, 12 bytes of
//! padding, then per entry a u64 title id, the 16-byte seed and 8 bytes of
//! padding.

use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use super::config_dirs;
use crate::{LimonkaError, LimonkaResult};

const SEED_ENTRY_PADDING: [u8; 8] = [0; 8];

/// A title-id → seed mapping with the `seeddb.bin` on-disk format.
///
/// Most callers use the process-wide default registry through
/// [`get_seed`]/[`add_seed`]; a private instance can be constructed for
/// isolated use.
#[derive(Debug, Default, Clone)]
pub struct SeedDb {
    seeds: HashMap<u64, [u8; 16]>,
}

impl SeedDb {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads entries from a `seeddb.bin` stream, merging over existing
    /// entries (last write wins).
    pub fn load<R: Read>(&mut self, reader: &mut R) -> LimonkaResult<()> {
        let mut header = [0u8; 0x10];
        reader.read_exact(&mut header)?;
        let count = u32::from_le_bytes(header[0..4].try_into().unwrap());
        for _ in 0..count {
            let mut entry = [0u8; 0x20];
            reader.read_exact(&mut entry)?;
            let title_id = u64::from_le_bytes(entry[0..8].try_into().unwrap());
            self.seeds
                .insert(title_id, entry[0x8..0x18].try_into().unwrap());
        }
        Ok(())
    }

    pub fn load_file(&mut self, path: &Path) -> LimonkaResult<()> {
        self.load(&mut File::open(path)?)
    }

    /// Serialises the database in `seeddb.bin` format.
    pub fn save<W: Write>(&self, writer: &mut W) -> LimonkaResult<()> {
        writer.write_all(&(self.seeds.len() as u32).to_le_bytes())?;
        writer.write_all(&[0u8; 12])?;
        for (title_id, seed) in &self.seeds {
            writer.write_all(&title_id.to_le_bytes())?;
            writer.write_all(seed)?;
            writer.write_all(&SEED_ENTRY_PADDING)?;
        }
        Ok(())
    }

    pub fn add(&mut self, title_id: u64, seed: [u8; 16]) {
        self.seeds.insert(title_id, seed);
    }

    pub fn get(&self, title_id: u64) -> Option<[u8; 16]> {
        self.seeds.get(&title_id).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }
}

struct DefaultDb {
    db: SeedDb,
    loaded_from_default_paths: bool,
}

fn default_db() -> &'static Mutex<DefaultDb> {
    static DEFAULT: OnceLock<Mutex<DefaultDb>> = OnceLock::new();
    DEFAULT.get_or_init(|| {
        Mutex::new(DefaultDb {
            db: SeedDb::new(),
            loaded_from_default_paths: false,
        })
    })
}

fn load_default_paths(state: &mut DefaultDb) {
    let mut paths = Vec::new();
    if let Ok(env_path) = env::var("SEEDDB_PATH") {
        paths.push(env_path.into());
    }
    for dir in config_dirs() {
        paths.push(dir.join("seeddb.bin"));
    }
    for path in paths {
        let _ = state.db.load_file(&path);
    }
    state.loaded_from_default_paths = true;
}

/// Loads a seeddb file into the process-wide registry; with `None`, the
/// `SEEDDB_PATH` environment variable and the config directories are
/// searched.
pub fn load_seeddb(path: Option<&Path>) -> LimonkaResult<()> {
    let mut state = default_db().lock().unwrap();
    match path {
        Some(p) => state.db.load_file(p),
        None => {
            if !state.loaded_from_default_paths {
                load_default_paths(&mut state);
            }
            Ok(())
        }
    }
}

/// Gets a seed from the process-wide registry, loading the default
/// database files on the first miss.
pub fn get_seed(title_id: u64) -> LimonkaResult<[u8; 16]> {
    let mut state = default_db().lock().unwrap();
    if let Some(seed) = state.db.get(title_id) {
        return Ok(seed);
    }
    if !state.loaded_from_default_paths {
        load_default_paths(&mut state);
        if let Some(seed) = state.db.get(title_id) {
            return Ok(seed);
        }
    }
    Err(LimonkaError::SeedNotFound(title_id))
}

/// Adds a seed to the process-wide registry.
pub fn add_seed(title_id: u64, seed: [u8; 16]) {
    default_db().lock().unwrap().db.add(title_id, seed);
}

/// Saves the process-wide registry in `seeddb.bin` format.
pub fn save_seeddb<W: Write>(writer: &mut W) -> LimonkaResult<()> {
    default_db().lock().unwrap().db.save(writer)
}
