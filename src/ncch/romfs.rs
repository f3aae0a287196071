//! RomFS: the read-only filesystem inside an NCCH, wrapped in an IVFC
//! hash-tree container.
//!
//! Lookups go through the level-3 hash tables the console itself uses, so
//! resolving a path is O(1) per component without walking the tree.

use std::io::{Read, Seek, SeekFrom};

use crate::align_up;
use crate::fileio::{SharedFile, SubFile};
use crate::vfs::{EntryInfo, Filesystem};
use crate::{LimonkaError, LimonkaResult};

pub const IVFC_HEADER_SIZE: u64 = 0x5C;
pub const IVFC_ROMFS_MAGIC_NUM: u32 = 0x10000;
pub const ROMFS_LV3_HEADER_SIZE: u32 = 0x28;

const NO_ENTRY: u32 = 0xFFFF_FFFF;

/// Computes the RomFS name hash used to pick a hash-table bucket.
fn name_hash(parent: u32, name_utf16: &[u16]) -> u32 {
    let mut hash = parent ^ 123456789;
    for &unit in name_utf16 {
        hash = (hash >> 5) | (hash << 27);
        hash ^= unit as u32;
    }
    hash
}

fn encode_name(name: &str) -> Vec<u16> {
    name.encode_utf16().collect()
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().unwrap())
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(data[at..at + 8].try_into().unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Dir(u32),
    File(u32),
}

/// Reads the directory tree of a RomFS and opens files inside it.
pub struct RomFsReader {
    base: SharedFile,
    case_insensitive: bool,
    /// Absolute offset of the file data area within `base`.
    data_offset: u64,
    dir_hash: Vec<u32>,
    dir_meta: Vec<u8>,
    file_hash: Vec<u32>,
    file_meta: Vec<u8>,
}

impl RomFsReader {
    /// `base` must present the RomFS (IVFC-wrapped or bare level 3) at
    /// offset 0.
    pub fn new(base: SharedFile, case_insensitive: bool) -> LimonkaResult<Self> {
        let mut head = [0u8; 0x60];
        let lv3_offset;
        {
            let mut guard = base.lock().unwrap();
            guard.seek(SeekFrom::Start(0))?;
            guard.read_exact(&mut head)?;

            if &head[0..4] == b"IVFC" {
                let magic_num = read_u32(&head, 0x4);
                if magic_num != IVFC_ROMFS_MAGIC_NUM {
                    return Err(LimonkaError::InvalidIvfc("wrong RomFS magic number"));
                }
                let master_hash_size = read_u32(&head, 0x8) as u64;
                let lv3_block_size = 1u64 << read_u32(&head, 0x4C);
                lv3_offset = align_up(0x60 + master_hash_size, lv3_block_size);
                guard.seek(SeekFrom::Start(lv3_offset))?;
                let mut lv3_head = [0u8; 0x28];
                guard.read_exact(&mut lv3_head)?;
                head[..0x28].copy_from_slice(&lv3_head);
            } else {
                lv3_offset = 0;
            }
        }

        let lv3 = &head[..0x28];
        let header_size = read_u32(lv3, 0x0);
        if header_size != ROMFS_LV3_HEADER_SIZE {
            return Err(LimonkaError::InvalidHeader {
                container: "RomFS Lv3",
                offset: lv3_offset,
            });
        }
        let dir_hash = (read_u32(lv3, 0x4), read_u32(lv3, 0x8));
        let dir_meta = (read_u32(lv3, 0xC), read_u32(lv3, 0x10));
        let file_hash = (read_u32(lv3, 0x14), read_u32(lv3, 0x18));
        let file_meta = (read_u32(lv3, 0x1C), read_u32(lv3, 0x20));
        let file_data_offset = read_u32(lv3, 0x24);

        // the regions must be packed in order after the header
        let ordered = dir_hash.0 >= ROMFS_LV3_HEADER_SIZE
            && dir_meta.0 >= dir_hash.0 + dir_hash.1
            && file_hash.0 >= dir_meta.0 + dir_meta.1
            && file_meta.0 >= file_hash.0 + file_hash.1
            && file_data_offset >= file_meta.0 + file_meta.1;
        if !ordered {
            return Err(LimonkaError::InvalidHeader {
                container: "RomFS Lv3",
                offset: lv3_offset,
            });
        }

        let read_region = |(offset, size): (u32, u32)| -> LimonkaResult<Vec<u8>> {
            let mut data = vec![0u8; size as usize];
            let mut guard = base.lock().unwrap();
            guard.seek(SeekFrom::Start(lv3_offset + offset as u64))?;
            guard.read_exact(&mut data)?;
            Ok(data)
        };

        let dir_hash_raw = read_region(dir_hash)?;
        let file_hash_raw = read_region(file_hash)?;
        let dir_meta = read_region(dir_meta)?;
        let file_meta = read_region(file_meta)?;
        let to_u32s = |raw: Vec<u8>| -> Vec<u32> {
            raw.chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                .collect()
        };

        Ok(Self {
            base,
            case_insensitive,
            data_offset: lv3_offset + file_data_offset as u64,
            dir_hash: to_u32s(dir_hash_raw),
            dir_meta,
            file_hash: to_u32s(file_hash_raw),
            file_meta,
        })
    }

    fn dir_name(&self, at: u32) -> String {
        let at = at as usize;
        let len = read_u32(&self.dir_meta, at + 0x14) as usize;
        let units: Vec<u16> = self.dir_meta[at + 0x18..at + 0x18 + len]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes(c.try_into().unwrap()))
            .collect();
        String::from_utf16_lossy(&units)
    }

    fn file_name(&self, at: u32) -> String {
        let at = at as usize;
        let len = read_u32(&self.file_meta, at + 0x1C) as usize;
        let units: Vec<u16> = self.file_meta[at + 0x20..at + 0x20 + len]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes(c.try_into().unwrap()))
            .collect();
        String::from_utf16_lossy(&units)
    }

    fn names_match(&self, stored: &str, wanted: &str) -> bool {
        if self.case_insensitive {
            stored.to_lowercase() == wanted.to_lowercase()
        } else {
            stored == wanted
        }
    }

    /// Hash-table lookup of a child directory.
    fn lookup_dir(&self, parent: u32, name: &str) -> Option<u32> {
        let wanted = if self.case_insensitive {
            name.to_lowercase()
        } else {
            name.to_string()
        };
        let bucket = name_hash(parent, &encode_name(&wanted)) as usize % self.dir_hash.len();
        let mut at = self.dir_hash[bucket];
        while at != NO_ENTRY {
            if read_u32(&self.dir_meta, at as usize) == parent
                && self.names_match(&self.dir_name(at), name)
            {
                return Some(at);
            }
            at = read_u32(&self.dir_meta, at as usize + 0x10);
        }
        if self.case_insensitive {
            // stored names may be mixed-case and then hash differently;
            // fall back to scanning the sibling list
            self.scan_dirs(parent, name)
        } else {
            None
        }
    }

    fn lookup_file(&self, parent: u32, name: &str) -> Option<u32> {
        let wanted = if self.case_insensitive {
            name.to_lowercase()
        } else {
            name.to_string()
        };
        let bucket = name_hash(parent, &encode_name(&wanted)) as usize % self.file_hash.len();
        let mut at = self.file_hash[bucket];
        while at != NO_ENTRY {
            if read_u32(&self.file_meta, at as usize) == parent
                && self.names_match(&self.file_name(at), name)
            {
                return Some(at);
            }
            at = read_u32(&self.file_meta, at as usize + 0x18);
        }
        if self.case_insensitive {
            self.scan_files(parent, name)
        } else {
            None
        }
    }

    fn scan_dirs(&self, parent: u32, name: &str) -> Option<u32> {
        let mut at = read_u32(&self.dir_meta, parent as usize + 0x8);
        while at != NO_ENTRY {
            if self.names_match(&self.dir_name(at), name) {
                return Some(at);
            }
            at = read_u32(&self.dir_meta, at as usize + 0x4);
        }
        None
    }

    fn scan_files(&self, parent: u32, name: &str) -> Option<u32> {
        let mut at = read_u32(&self.dir_meta, parent as usize + 0xC);
        while at != NO_ENTRY {
            if self.names_match(&self.file_name(at), name) {
                return Some(at);
            }
            at = read_u32(&self.file_meta, at as usize + 0x4);
        }
        None
    }

    fn not_found(path: &str) -> LimonkaError {
        LimonkaError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no such RomFS entry: {path}"),
        ))
    }

    fn resolve(&self, path: &str) -> LimonkaResult<Entry> {
        let mut current = 0u32; // root directory entry
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        for (i, part) in parts.iter().enumerate() {
            let last = i + 1 == parts.len();
            if let Some(dir) = self.lookup_dir(current, part) {
                current = dir;
            } else if last {
                if let Some(file) = self.lookup_file(current, part) {
                    return Ok(Entry::File(file));
                }
                return Err(Self::not_found(path));
            } else {
                return Err(Self::not_found(path));
            }
        }
        Ok(Entry::Dir(current))
    }

    /// Opens a file as a bounded sub-view over the decrypted RomFS.
    pub fn open_file(&self, path: &str) -> LimonkaResult<SubFile> {
        match self.resolve(path)? {
            Entry::File(at) => {
                let offset = read_u64(&self.file_meta, at as usize + 0x8);
                let size = read_u64(&self.file_meta, at as usize + 0x10);
                Ok(SubFile::new(
                    self.base.clone(),
                    self.data_offset + offset,
                    size,
                ))
            }
            Entry::Dir(_) => Err(LimonkaError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("is a directory: {path}"),
            ))),
        }
    }
}

impl Filesystem for RomFsReader {
    fn listdir(&self, path: &str) -> LimonkaResult<Vec<String>> {
        match self.resolve(path)? {
            Entry::Dir(at) => {
                let mut names = Vec::new();
                let mut child = read_u32(&self.dir_meta, at as usize + 0x8);
                while child != NO_ENTRY {
                    names.push(self.dir_name(child));
                    child = read_u32(&self.dir_meta, child as usize + 0x4);
                }
                let mut file = read_u32(&self.dir_meta, at as usize + 0xC);
                while file != NO_ENTRY {
                    names.push(self.file_name(file));
                    file = read_u32(&self.file_meta, file as usize + 0x4);
                }
                Ok(names)
            }
            Entry::File(_) => Err(LimonkaError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a directory: {path}"),
            ))),
        }
    }

    fn getinfo(&self, path: &str) -> LimonkaResult<EntryInfo> {
        Ok(match self.resolve(path)? {
            Entry::Dir(_) => EntryInfo {
                is_file: false,
                is_dir: true,
                size: 0,
            },
            Entry::File(at) => EntryInfo {
                is_file: true,
                is_dir: false,
                size: read_u64(&self.file_meta, at as usize + 0x10),
            },
        })
    }

    fn open(&self, path: &str) -> LimonkaResult<Box<dyn crate::fileio::FileLike>> {
        Ok(Box::new(self.open_file(path)?))
    }
}
