//! ExeFS: the executable filesystem inside an NCCH, up to ten named
//! entries such as `.code`, `icon`, `banner` and `logo`.

use core::mem;

use crate::fileio::{SharedFile, SubFile};
use crate::string::SizedCString;
use crate::{FromBytes, LimonkaError, LimonkaResult};

use derivative::Derivative;
use static_assertions::assert_eq_size;

pub const EXEFS_HEADER_SIZE: u64 = 0x200;
pub const EXEFS_ENTRY_COUNT: usize = 10;

/// One file entry in the ExeFS header.
#[derive(Clone, Debug)]
#[repr(C)]
pub struct FileEntry {
    name: SizedCString<0x8>,
    offset: [u8; 4],
    size: [u8; 4],
}
assert_eq_size!([u8; 16], FileEntry);

impl FileEntry {
    #[must_use]
    pub fn name(&self) -> std::borrow::Cow<'_, str> {
        self.name.trimmed()
    }
    /// Offset of the file data, relative to the end of the header.
    #[must_use]
    pub fn offset(&self) -> u32 {
        u32::from_le_bytes(self.offset)
    }
    #[must_use]
    pub fn size(&self) -> u32 {
        u32::from_le_bytes(self.size)
    }
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.name.is_zero() && self.offset() == 0 && self.size() == 0
    }
}

/// The raw 0x200 ExeFS header: ten entries, reserved space, and the file
/// hashes stored in reverse entry order.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
#[repr(C)]
pub struct ExeFsHeader {
    file_entries: [FileEntry; EXEFS_ENTRY_COUNT],
    #[derivative(Debug = "ignore")]
    _reserved: [u8; 0x20],
    #[derivative(Debug = "ignore")]
    file_hashes: [[u8; 0x20]; EXEFS_ENTRY_COUNT],
}
assert_eq_size!([u8; 0x200], ExeFsHeader);

impl FromBytes for ExeFsHeader {
    fn min_size() -> usize {
        mem::size_of::<ExeFsHeader>()
    }
    fn bytes_ok(_: &[u8]) -> LimonkaResult<()> {
        Ok(())
    }
    fn cast(bytes: &[u8]) -> &Self {
        unsafe { &*(bytes.as_ptr() as *const Self) }
    }
}

impl ExeFsHeader {
    /// Iterates over the entries that are in use.
    pub fn entries(&self) -> impl Iterator<Item = &FileEntry> {
        self.file_entries.iter().filter(|entry| !entry.is_unused())
    }

    #[must_use]
    pub fn entry(&self, name: &str) -> Option<&FileEntry> {
        self.entries().find(|entry| entry.name() == name)
    }

    /// SHA-256 of an entry's data. Hashes are stored in reverse order: the
    /// last hash belongs to the first entry.
    #[must_use]
    pub fn hash_for(&self, index: usize) -> &[u8; 0x20] {
        &self.file_hashes[EXEFS_ENTRY_COUNT - 1 - index]
    }
}

/// Reads an ExeFS from a (decrypted) stream.
pub struct ExeFsReader {
    base: SharedFile,
    header: ExeFsHeader,
}

impl ExeFsReader {
    /// `base` must present the decrypted ExeFS with its header at offset 0.
    pub fn new(base: SharedFile) -> LimonkaResult<Self> {
        let mut raw = [0u8; 0x200];
        {
            use std::io::{Read, Seek, SeekFrom};
            let mut guard = base.lock().unwrap();
            guard.seek(SeekFrom::Start(0))?;
            guard.read_exact(&mut raw)?;
        }
        let header = ExeFsHeader::from_bytes(&raw)?.clone();
        Ok(Self { base, header })
    }

    #[must_use]
    pub fn header(&self) -> &ExeFsHeader {
        &self.header
    }

    /// Opens a named entry as a bounded sub-view.
    pub fn open(&self, name: &str) -> LimonkaResult<SubFile> {
        let entry = self
            .header
            .entry(name)
            .ok_or_else(|| LimonkaError::MissingTitle(name.to_string()))?;
        Ok(SubFile::new(
            self.base.clone(),
            EXEFS_HEADER_SIZE + entry.offset() as u64,
            entry.size() as u64,
        ))
    }

    /// Reads a named entry fully.
    pub fn read_file(&self, name: &str) -> LimonkaResult<Vec<u8>> {
        Ok(self.open(name)?.read_all()?)
    }

    /// Reads `.code` and decompresses it if `compressed` is set (the flag
    /// lives in the extended header, so the caller supplies it).
    pub fn code(&self, compressed: bool) -> LimonkaResult<Vec<u8>> {
        let raw = self.read_file(".code")?;
        if compressed {
            decompress_code(&raw)
        } else {
            Ok(raw)
        }
    }
}

/// Decompresses a backwards-LZSS `.code` stream.
///
/// The last 8 bytes describe the compressed region and the size the data
/// grows by; decompression walks backwards from the end with 8 flag bits
/// per group and 12-bit-offset/4-bit-length back-references.
pub fn decompress_code(compressed: &[u8]) -> LimonkaResult<Vec<u8>> {
    let len = compressed.len();
    if len < 8 {
        return Err(LimonkaError::CodeDecompressionFailed("input too short"));
    }
    let footer = &compressed[len - 8..];
    let buffer_top_and_bottom = u32::from_le_bytes(footer[0..4].try_into().unwrap());
    let extra_size = u32::from_le_bytes(footer[4..8].try_into().unwrap()) as usize;

    let out_len = len + extra_size;
    let mut out = vec![0u8; out_len];
    out[..len].copy_from_slice(compressed);

    let footer_len = (buffer_top_and_bottom >> 24) as usize;
    let compressed_len = (buffer_top_and_bottom & 0xFF_FFFF) as usize;
    if footer_len > len || compressed_len > len || footer_len > compressed_len {
        return Err(LimonkaError::CodeDecompressionFailed("bad footer"));
    }
    let mut index = len - footer_len;
    let stop_index = len - compressed_len;
    let mut out_index = out_len;

    while index > stop_index {
        index -= 1;
        let mut control = out[index];

        for _ in 0..8 {
            if index <= stop_index || index == 0 || out_index == 0 {
                break;
            }

            if control & 0x80 != 0 {
                if index < 2 {
                    return Err(LimonkaError::CodeDecompressionFailed(
                        "reference out of bounds",
                    ));
                }
                index -= 2;

                let segment = out[index] as usize | ((out[index + 1] as usize) << 8);
                let segment_size = ((segment >> 12) & 0xF) + 3;
                let segment_offset = (segment & 0xFFF) + 2;

                if out_index < segment_size {
                    return Err(LimonkaError::CodeDecompressionFailed(
                        "reference out of bounds",
                    ));
                }
                for _ in 0..segment_size {
                    if out_index + segment_offset >= out_len {
                        return Err(LimonkaError::CodeDecompressionFailed(
                            "reference out of bounds",
                        ));
                    }
                    let data = out[out_index + segment_offset];
                    out_index -= 1;
                    out[out_index] = data;
                }
            } else {
                if out_index == 0 {
                    return Err(LimonkaError::CodeDecompressionFailed("output underrun"));
                }
                index -= 1;
                out_index -= 1;
                out[out_index] = out[index];
            }

            control <<= 1;
        }
    }

    Ok(out)
}
