//! Partition descriptors of DISA/DIFF archives: the DIFI header, the IVFC
//! hash tree and the DPFS duplexed tree.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use crate::fileio::{SharedFile, SubFile};
use crate::hash::sha256;
use crate::{LimonkaError, LimonkaResult};

/// Location of one level within IVFC or DPFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelData {
    pub offset: u64,
    pub size: u64,
    pub block_size_log2: u32,
}

impl LevelData {
    #[must_use]
    pub fn block_size(&self) -> u64 {
        1 << self.block_size_log2
    }

    fn parse(data: &[u8]) -> Self {
        Self {
            offset: u64::from_le_bytes(data[0..8].try_into().unwrap()),
            size: u64::from_le_bytes(data[8..16].try_into().unwrap()),
            block_size_log2: u32::from_le_bytes(data[16..20].try_into().unwrap()),
        }
    }

    fn emit(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.block_size_log2.to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
    }
}

/// DIFI: locates the IVFC/DPFS descriptors and the master hashes inside a
/// partition descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Difi {
    pub ivfc_offset: u64,
    pub ivfc_size: u64,
    pub dpfs_offset: u64,
    pub dpfs_size: u64,
    pub part_hash_offset: u64,
    pub part_hash_size: u64,
    pub enable_external_ivfc_lv4: bool,
    pub dpfs_tree_lv1_selector: u8,
    pub external_ivfc_lv4_offset: u64,
}

impl Difi {
    pub fn from_bytes(data: &[u8]) -> LimonkaResult<Self> {
        if data.len() < 0x44 {
            return Err(LimonkaError::SliceTooSmall);
        }
        if &data[0..8] != b"DIFI\0\0\x01\0" {
            return Err(LimonkaError::InvalidHeader {
                container: "DIFI",
                offset: 0,
            });
        }
        let le64 = |at: usize| u64::from_le_bytes(data[at..at + 8].try_into().unwrap());
        Ok(Self {
            ivfc_offset: le64(0x8),
            ivfc_size: le64(0x10),
            dpfs_offset: le64(0x18),
            dpfs_size: le64(0x20),
            part_hash_offset: le64(0x28),
            part_hash_size: le64(0x30),
            enable_external_ivfc_lv4: data[0x38] != 0,
            dpfs_tree_lv1_selector: data[0x39],
            external_ivfc_lv4_offset: le64(0x3C),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(0x44);
        out.extend_from_slice(b"DIFI\0\0\x01\0");
        for val in [
            self.ivfc_offset,
            self.ivfc_size,
            self.dpfs_offset,
            self.dpfs_size,
            self.part_hash_offset,
            self.part_hash_size,
        ] {
            out.extend_from_slice(&val.to_le_bytes());
        }
        out.push(self.enable_external_ivfc_lv4 as u8);
        out.push(self.dpfs_tree_lv1_selector);
        out.extend_from_slice(&[0u8; 2]);
        out.extend_from_slice(&self.external_ivfc_lv4_offset.to_le_bytes());
        out
    }
}

/// The save-archive IVFC descriptor (version 2, four levels).
#[derive(Debug, Clone, Copy)]
pub struct Ivfc {
    pub master_hash_size: u64,
    pub levels: [LevelData; 4],
    pub descriptor_size: u64,
}

impl Ivfc {
    pub fn from_bytes(data: &[u8]) -> LimonkaResult<Self> {
        if data.len() < 0x78 {
            return Err(LimonkaError::SliceTooSmall);
        }
        if &data[0..8] != b"IVFC\0\0\x02\0" {
            return Err(LimonkaError::InvalidIvfc("IVFC descriptor magic missing"));
        }
        let mut levels = [LevelData {
            offset: 0,
            size: 0,
            block_size_log2: 0,
        }; 4];
        for (i, level) in levels.iter_mut().enumerate() {
            *level = LevelData::parse(&data[0x10 + i * 0x18..]);
        }
        Ok(Self {
            master_hash_size: u64::from_le_bytes(data[0x8..0x10].try_into().unwrap()),
            levels,
            descriptor_size: u64::from_le_bytes(data[0x70..0x78].try_into().unwrap()),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(0x78);
        out.extend_from_slice(b"IVFC\0\0\x02\0");
        out.extend_from_slice(&self.master_hash_size.to_le_bytes());
        for level in &self.levels {
            level.emit(&mut out);
        }
        out.extend_from_slice(&self.descriptor_size.to_le_bytes());
        out
    }
}

/// The DPFS descriptor (three duplexed levels).
#[derive(Debug, Clone, Copy)]
pub struct Dpfs {
    pub levels: [LevelData; 3],
}

impl Dpfs {
    pub fn from_bytes(data: &[u8]) -> LimonkaResult<Self> {
        if data.len() < 0x50 {
            return Err(LimonkaError::SliceTooSmall);
        }
        if &data[0..8] != b"DPFS\0\0\x01\0" {
            return Err(LimonkaError::InvalidHeader {
                container: "DPFS",
                offset: 0,
            });
        }
        let mut levels = [LevelData {
            offset: 0,
            size: 0,
            block_size_log2: 0,
        }; 3];
        for (i, level) in levels.iter_mut().enumerate() {
            *level = LevelData::parse(&data[0x8 + i * 0x18..]);
        }
        Ok(Self { levels })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(0x50);
        out.extend_from_slice(b"DPFS\0\0\x01\0");
        for level in &self.levels {
            level.emit(&mut out);
        }
        out
    }
}

/// A parsed partition descriptor.
#[derive(Clone)]
pub struct PartDesc {
    pub difi: Difi,
    pub ivfc: Ivfc,
    pub dpfs: Dpfs,
    pub master_hashes: Vec<[u8; 0x20]>,
    pub size: usize,
}

impl PartDesc {
    pub fn from_bytes(data: &[u8]) -> LimonkaResult<Self> {
        let difi = Difi::from_bytes(data)?;
        let range = |offset: u64, size: u64| -> LimonkaResult<&[u8]> {
            data.get(offset as usize..(offset + size) as usize)
                .ok_or(LimonkaError::SliceTooSmall)
        };
        let ivfc = Ivfc::from_bytes(range(difi.ivfc_offset, difi.ivfc_size)?)?;
        let dpfs = Dpfs::from_bytes(range(difi.dpfs_offset, difi.dpfs_size)?)?;
        let hashes_raw = range(difi.part_hash_offset, difi.part_hash_size)?;
        let master_hashes = hashes_raw
            .chunks_exact(0x20)
            .map(|c| <[u8; 0x20]>::try_from(c).unwrap())
            .collect();
        Ok(Self {
            difi,
            ivfc,
            dpfs,
            master_hashes,
            size: data.len(),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.size];
        let difi = self.difi.to_bytes();
        out[..difi.len()].copy_from_slice(&difi);
        let put = |out: &mut Vec<u8>, at: u64, data: &[u8]| {
            out[at as usize..at as usize + data.len()].copy_from_slice(data);
        };
        put(&mut out, self.difi.ivfc_offset, &self.ivfc.to_bytes());
        put(&mut out, self.difi.dpfs_offset, &self.dpfs.to_bytes());
        let hashes: Vec<u8> = self.master_hashes.iter().flatten().copied().collect();
        put(&mut out, self.difi.part_hash_offset, &hashes);
        out
    }
}

/// Presents the active DPFS level-3 data as one contiguous stream.
///
/// Levels 1 and 2 are bit trees selecting which of the two level-3 chunks
/// holds the current data for each block. The active bits are resolved
/// once at construction; writes go to the currently-active chunk without
/// flipping bits.
pub struct DpfsLv3File {
    base: SharedFile,
    lv3_offset: u64,
    size: u64,
    block_size: u64,
    lv2_words: Vec<u32>,
    pos: u64,
}

impl DpfsLv3File {
    pub fn new(base: SharedFile, dpfs: &Dpfs, lv1_selector: u8) -> LimonkaResult<Self> {
        let [lv1, lv2, lv3] = dpfs.levels;

        let read_at = |offset: u64, len: usize| -> LimonkaResult<Vec<u8>> {
            let mut data = vec![0u8; len];
            let mut guard = base.lock().unwrap();
            guard.seek(SeekFrom::Start(offset))?;
            guard.read_exact(&mut data)?;
            Ok(data)
        };

        // level 1: one of the two chunks is active, by the DIFI selector
        let lv1_chunk = if lv1_selector != 0 {
            read_at(lv1.offset + lv1.size, lv1.size as usize)?
        } else {
            read_at(lv1.offset, lv1.size as usize)?
        };
        let lv1_words: Vec<u32> = lv1_chunk
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        let bit = |words: &[u32], index: u64| -> bool {
            let word = words[(index >> 5) as usize];
            (word >> (31 - (index % 32))) & 1 != 0
        };

        // level 2: each block comes from the chunk its level-1 bit selects
        let lv2_block = lv2.block_size();
        let mut lv2_active = Vec::with_capacity(lv2.size as usize);
        for (block, offset) in (0..lv2.size).step_by(lv2_block as usize).enumerate() {
            let chunk_offset = if bit(&lv1_words, block as u64) {
                lv2.size
            } else {
                0
            };
            let len = lv2_block.min(lv2.size - offset) as usize;
            lv2_active.extend(read_at(lv2.offset + chunk_offset + offset, len)?);
        }
        let lv2_words = lv2_active
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();

        Ok(Self {
            base,
            lv3_offset: lv3.offset,
            size: lv3.size,
            block_size: lv3.block_size(),
            lv2_words,
            pos: 0,
        })
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    fn active_chunk_offset(&self, block: u64) -> u64 {
        let word = self.lv2_words[(block >> 5) as usize];
        if (word >> (31 - (block % 32))) & 1 != 0 {
            self.size
        } else {
            0
        }
    }
}

impl Read for DpfsLv3File {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut copied = 0;
        while copied < buf.len() && self.pos < self.size {
            let block = self.pos / self.block_size;
            let within = self.pos % self.block_size;
            let n = (buf.len() - copied)
                .min((self.block_size - within) as usize)
                .min((self.size - self.pos) as usize);
            let at = self.lv3_offset + self.active_chunk_offset(block) + block * self.block_size
                + within;
            let got = {
                let mut guard = self.base.lock().unwrap();
                guard.seek(SeekFrom::Start(at))?;
                guard.read(&mut buf[copied..copied + n])?
            };
            if got == 0 {
                break;
            }
            copied += got;
            self.pos += got as u64;
        }
        Ok(copied)
    }
}

impl Write for DpfsLv3File {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() && self.pos < self.size {
            let block = self.pos / self.block_size;
            let within = self.pos % self.block_size;
            let n = (buf.len() - written)
                .min((self.block_size - within) as usize)
                .min((self.size - self.pos) as usize);
            let at = self.lv3_offset + self.active_chunk_offset(block) + block * self.block_size
                + within;
            {
                let mut guard = self.base.lock().unwrap();
                guard.seek(SeekFrom::Start(at))?;
                guard.write_all(&buf[written..written + n])?;
            }
            written += n;
            self.pos += n as u64;
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.base.lock().unwrap().flush()
    }
}

impl Seek for DpfsLv3File {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let next = match pos {
            SeekFrom::Start(off) => off as i64,
            SeekFrom::Current(off) => self.pos as i64 + off,
            SeekFrom::End(off) => self.size as i64 + off,
        };
        if next < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        self.pos = next as u64;
        Ok(self.pos)
    }
}

/// The IVFC hash tree over the DPFS level-3 stream. Level 4 holds the
/// data; levels 3..1 hold hashes, and level 1 is hashed by the master
/// hashes in the partition descriptor.
pub struct IvfcTree {
    file: SharedFile,
    /// External level-4 stream when the DIFI enables it.
    lv4_external: Option<SharedFile>,
    ivfc: Ivfc,
    master_hashes: Vec<[u8; 0x20]>,
    dirty: bool,
}

impl IvfcTree {
    pub fn new(
        file: SharedFile,
        ivfc: Ivfc,
        master_hashes: Vec<[u8; 0x20]>,
        lv4_external: Option<SharedFile>,
    ) -> Self {
        Self {
            file,
            lv4_external,
            ivfc,
            master_hashes,
            dirty: false,
        }
    }

    #[must_use]
    pub fn master_hashes(&self) -> &[[u8; 0x20]] {
        &self.master_hashes
    }

    #[must_use]
    pub fn dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    #[must_use]
    pub fn lv4(&self) -> LevelData {
        self.ivfc.levels[3]
    }

    fn level_stream(&self, level_index: usize) -> (SharedFile, u64) {
        let level = self.ivfc.levels[level_index];
        if level_index == 3 {
            if let Some(external) = &self.lv4_external {
                return (external.clone(), 0);
            }
        }
        (self.file.clone(), level.offset)
    }

    fn read_level(&self, level_index: usize, offset: u64, buf: &mut [u8]) -> LimonkaResult<()> {
        let (stream, base_offset) = self.level_stream(level_index);
        let mut guard = stream.lock().unwrap();
        guard.seek(SeekFrom::Start(base_offset + offset))?;
        guard.read_exact(buf)?;
        Ok(())
    }

    fn write_level_raw(&self, level_index: usize, offset: u64, data: &[u8]) -> LimonkaResult<()> {
        let (stream, base_offset) = self.level_stream(level_index);
        let mut guard = stream.lock().unwrap();
        guard.seek(SeekFrom::Start(base_offset + offset))?;
        guard.write_all(data)?;
        Ok(())
    }

    fn block_hash(&self, level_index: usize, block: u64) -> LimonkaResult<[u8; 0x20]> {
        let level = self.ivfc.levels[level_index];
        let block_size = level.block_size();
        let at = block * block_size;
        let len = block_size.min(level.size - at);
        let mut data = vec![0u8; block_size as usize];
        self.read_level(level_index, at, &mut data[..len as usize])?;
        Ok(sha256(&data))
    }

    /// Verifies level 1 against the master hashes.
    pub fn verify_master(&self) -> LimonkaResult<()> {
        let lv1 = self.ivfc.levels[0];
        let blocks = lv1.size.div_ceil(lv1.block_size());
        for block in 0..blocks {
            let expected = self
                .master_hashes
                .get(block as usize)
                .ok_or(LimonkaError::InvalidIvfc("missing master hash"))?;
            if self.block_hash(0, block)? != *expected {
                return Err(LimonkaError::InvalidIvfc("master hash mismatch"));
            }
        }
        Ok(())
    }

    /// Verifies the hash of a level-4 block through the whole chain.
    pub fn verify_lv4_block(&self, block: u64) -> LimonkaResult<()> {
        let mut hash = self.block_hash(3, block)?;
        let mut position = block * 0x20;
        // walk levels 3 -> 1 comparing stored hashes, then the master
        for level_index in (0..3).rev() {
            let mut stored = [0u8; 0x20];
            self.read_level(level_index, position, &mut stored)?;
            if stored != hash {
                return Err(LimonkaError::InvalidIvfc("hash chain mismatch"));
            }
            let level = self.ivfc.levels[level_index];
            let holding_block = position / level.block_size();
            hash = self.block_hash(level_index, holding_block)?;
            position = holding_block * 0x20;
        }
        let master = self
            .master_hashes
            .get((position / 0x20) as usize)
            .ok_or(LimonkaError::InvalidIvfc("missing master hash"))?;
        if *master != hash {
            return Err(LimonkaError::InvalidIvfc("master hash mismatch"));
        }
        Ok(())
    }

    /// Writes data into a level and refreshes the hashes above it.
    pub fn write_level(&mut self, level: usize, offset: u64, data: &[u8]) -> LimonkaResult<usize> {
        let level_index = level - 1;
        let level_data = self.ivfc.levels[level_index];
        let data = if offset + data.len() as u64 > level_data.size {
            &data[..(level_data.size - offset) as usize]
        } else {
            data
        };
        if data.is_empty() {
            return Ok(0);
        }
        self.write_level_raw(level_index, offset, data)?;
        self.dirty = true;

        let block_size = level_data.block_size();
        let first_block = offset / block_size;
        let last_block = (offset + data.len() as u64 - 1) / block_size;
        let mut hashes = Vec::new();
        for block in first_block..=last_block {
            hashes.push(self.block_hash(level_index, block)?);
        }

        if level == 1 {
            for (i, hash) in hashes.into_iter().enumerate() {
                let index = first_block as usize + i;
                if index < self.master_hashes.len() {
                    self.master_hashes[index] = hash;
                }
            }
        } else {
            let flat: Vec<u8> = hashes.into_iter().flatten().collect();
            self.write_level(level - 1, first_block * 0x20, &flat)?;
        }
        Ok(data.len())
    }
}

/// Seekable read-write view over IVFC level 4.
pub struct Lv4File {
    tree: Arc<Mutex<IvfcTree>>,
    size: u64,
    pos: u64,
}

impl Lv4File {
    pub fn new(tree: Arc<Mutex<IvfcTree>>) -> Self {
        let size = tree.lock().unwrap().lv4().size;
        Self { tree, size, pos: 0 }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Read for Lv4File {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.size {
            return Ok(0);
        }
        let n = buf.len().min((self.size - self.pos) as usize);
        let tree = self.tree.lock().unwrap();
        tree.read_level(3, self.pos, &mut buf[..n])
            .map_err(io::Error::other)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for Lv4File {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.pos >= self.size {
            return Ok(0);
        }
        let mut tree = self.tree.lock().unwrap();
        let written = tree
            .write_level(4, self.pos, buf)
            .map_err(io::Error::other)?;
        self.pos += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for Lv4File {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let next = match pos {
            SeekFrom::Start(off) => off as i64,
            SeekFrom::Current(off) => self.pos as i64 + off,
            SeekFrom::End(off) => self.size as i64 + off,
        };
        if next < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        self.pos = next as u64;
        Ok(self.pos)
    }
}

/// Builds a [`DpfsLv3File`]-backed [`IvfcTree`] for a partition.
pub fn open_partition_tree(
    partition: SubFile,
    desc: &PartDesc,
) -> LimonkaResult<Arc<Mutex<IvfcTree>>> {
    let partition = crate::fileio::shared(partition);
    let dpfs_file = DpfsLv3File::new(
        partition.clone(),
        &desc.dpfs,
        desc.difi.dpfs_tree_lv1_selector,
    )?;
    let dpfs_shared = crate::fileio::shared(dpfs_file);

    let lv4_external = if desc.difi.enable_external_ivfc_lv4 {
        let lv4 = desc.ivfc.levels[3];
        Some(crate::fileio::shared(SubFile::new(
            partition,
            desc.difi.external_ivfc_lv4_offset,
            lv4.size,
        )))
    } else {
        None
    };

    let tree = IvfcTree::new(
        dpfs_shared,
        desc.ivfc,
        desc.master_hashes.clone(),
        lv4_external,
    );
    Ok(Arc::new(Mutex::new(tree)))
}
