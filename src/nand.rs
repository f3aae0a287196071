//! NAND images: the NCSD container holding the TWL and CTR regions, FIRM
//! partitions and friends, each encrypted with its own keyslot and a
//! counter derived from the NAND CID.

use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::crypto::{CryptoEngine, Keyslot};
use crate::fileio::{shared, FileLike, SharedFile, SubFile};
use crate::hash::{sha1, sha256};
use crate::ncch::exefs::ExeFsReader;
use crate::{LimonkaError, LimonkaResult};

use log::warn;

pub const NAND_MEDIA_UNIT: u64 = 0x200;

/// Start of the TWL MBR inside the decrypted TWL region. Everything below
/// this shares bytes with the NCSD header.
const TWL_MBR_OFFSET: u64 = 0x1BE;

/// Sections of a NAND image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NandSection {
    /// The NCSD header itself.
    Header,
    /// Decrypted TWL MBR (0x42 bytes).
    TwlMbr,
    TwlNand,
    AgbSave,
    Firm0,
    Firm1,
    CtrNand,
    /// The New 3DS key sector, exposed raw; decryption uses keyslot 0x11
    /// but is left to the caller.
    Sector0x96,
    /// Unpartitioned space past the end of the last partition (GodMode9
    /// bonus volume), unencrypted.
    BonusVolume,
    /// A physical partition slot.
    Partition(u8),
}

#[derive(Debug, Clone, Copy)]
pub struct NandPartition {
    pub index: u8,
    pub fs_type: u8,
    pub crypt_type: u8,
    pub offset: u64,
    pub size: u64,
    /// Keyslot the partition is encrypted with; `None` for plain regions.
    pub keyslot: Option<u8>,
    /// TWL partitions use the byte-reversed cipher and counter base.
    pub twl: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NandOptions {
    pub dev: bool,
    /// OTP dump; when absent the embedded essentials are tried.
    pub otp: Option<Vec<u8>>,
    /// NAND CID; when absent the embedded essentials are tried, then a
    /// zero counter fallback.
    pub cid: Option<[u8; 16]>,
}

/// Counter bases derived from the NAND CID: `(ctr, twl)`.
pub(crate) fn counter_bases(cid: &[u8; 16]) -> (u128, u128) {
    let ctr = u128::from_be_bytes(sha256(cid)[0..16].try_into().unwrap());
    let twl = u128::from_le_bytes(sha1(cid)[0..16].try_into().unwrap());
    (ctr, twl)
}

/// Reads NAND backups (and physical NAND block devices).
pub struct NandReader {
    base: SharedFile,
    crypto: CryptoEngine,

    image_size: u64,
    file_size: u64,
    partitions: Vec<NandPartition>,
    sections: BTreeMap<NandSection, u8>,
    essentials: Option<ExeFsReader>,

    ctr_base: u128,
    twl_base: u128,
}

impl NandReader {
    pub fn new(
        base: SharedFile,
        crypto: Option<CryptoEngine>,
        options: &NandOptions,
    ) -> LimonkaResult<Self> {
        let mut crypto = crypto.unwrap_or_else(|| CryptoEngine::new(options.dev));

        let mut header = [0u8; 0x200];
        let file_size;
        {
            let mut guard = base.lock().unwrap();
            guard.seek(SeekFrom::Start(0))?;
            guard.read_exact(&mut header)?;
            file_size = guard.seek(SeekFrom::End(0))?;
        }
        if &header[0x100..0x104] != b"NCSD" {
            return Err(LimonkaError::InvalidHeader {
                container: "NAND",
                offset: 0x100,
            });
        }
        if header[0x108..0x110] != [0; 8] {
            // a nonzero media id means this is a CCI
            return Err(LimonkaError::InvalidHeader {
                container: "NAND",
                offset: 0x108,
            });
        }

        let image_size =
            u32::from_le_bytes(header[0x104..0x108].try_into().unwrap()) as u64 * NAND_MEDIA_UNIT;

        let fs_types = &header[0x110..0x118];
        let crypt_types = &header[0x118..0x120];

        let mut partitions = Vec::new();
        let mut sections: BTreeMap<NandSection, u8> = BTreeMap::new();
        let mut firm_count = 0u8;
        for idx in 0u8..8 {
            let at = 0x120 + idx as usize * 8;
            let offset = u32::from_le_bytes(header[at..at + 4].try_into().unwrap()) as u64
                * NAND_MEDIA_UNIT;
            let size = u32::from_le_bytes(header[at + 4..at + 8].try_into().unwrap()) as u64
                * NAND_MEDIA_UNIT;
            if size == 0 {
                continue;
            }
            let fs_type = fs_types[idx as usize];
            let crypt_type = crypt_types[idx as usize];

            let (keyslot, twl, section) = match (fs_type, crypt_type) {
                (1, 1) => (Some(Keyslot::TwlNand as u8), true, Some(NandSection::TwlNand)),
                (1, 2) => (
                    Some(Keyslot::CtrNandOld as u8),
                    false,
                    Some(NandSection::CtrNand),
                ),
                (1, 3) => (
                    Some(Keyslot::CtrNandNew as u8),
                    false,
                    Some(NandSection::CtrNand),
                ),
                (3, _) => {
                    let section = if firm_count == 0 {
                        NandSection::Firm0
                    } else {
                        NandSection::Firm1
                    };
                    firm_count += 1;
                    (Some(Keyslot::Firm as u8), false, Some(section))
                }
                (4, _) => (Some(Keyslot::Agb as u8), false, Some(NandSection::AgbSave)),
                _ => (None, false, None),
            };

            if let Some(section) = section {
                sections.entry(section).or_insert(idx);
            }
            partitions.push(NandPartition {
                index: idx,
                fs_type,
                crypt_type,
                offset,
                size,
                keyslot,
                twl,
            });
        }

        // GodMode9 keeps an essentials ExeFS right after the header
        let essentials_end = partitions
            .iter()
            .map(|p| p.offset)
            .filter(|&o| o > 0x200)
            .min()
            .unwrap_or(0x2200);
        let essentials =
            ExeFsReader::new(shared(SubFile::new(base.clone(), 0x200, essentials_end - 0x200)))
                .ok()
                .filter(|reader| reader.header().entries().next().is_some());

        if let Some(otp) = &options.otp {
            crypto.setup_keys_from_otp(otp)?;
        } else if !crypto.otp_keys_set() {
            if let Some(essentials) = &essentials {
                if let Ok(otp) = essentials.read_file("otp") {
                    if let Err(err) = crypto.setup_keys_from_otp(&otp) {
                        warn!("embedded OTP was not usable: {err}");
                    }
                }
            }
        }

        let cid = options.cid.or_else(|| {
            essentials.as_ref().and_then(|essentials| {
                essentials
                    .read_file("nand_cid")
                    .ok()
                    .and_then(|raw| raw.get(0..16).map(|s| <[u8; 16]>::try_from(s).unwrap()))
            })
        });

        let (ctr_base, twl_base) = match cid {
            Some(cid) => counter_bases(&cid),
            None => {
                warn!("no NAND CID available, encrypted sections will not decrypt correctly");
                (0, 0)
            }
        };

        Ok(Self {
            base,
            crypto,
            image_size,
            file_size,
            partitions,
            sections,
            essentials,
            ctr_base,
            twl_base,
        })
    }

    #[must_use]
    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    #[must_use]
    pub fn partitions(&self) -> &[NandPartition] {
        &self.partitions
    }

    #[must_use]
    pub fn essentials(&self) -> Option<&ExeFsReader> {
        self.essentials.as_ref()
    }

    /// End of the last partition: the minimum size a working image can
    /// have.
    #[must_use]
    pub fn min_size(&self) -> u64 {
        self.partitions
            .iter()
            .map(|p| p.offset + p.size)
            .max()
            .unwrap_or(0x200)
    }

    fn partition_by_index(&self, index: u8) -> LimonkaResult<&NandPartition> {
        self.partitions
            .iter()
            .find(|p| p.index == index)
            .ok_or(LimonkaError::MissingRegion("NAND partition"))
    }

    fn partition_for(&self, section: NandSection) -> LimonkaResult<&NandPartition> {
        let index = *self
            .sections
            .get(&section)
            .ok_or(LimonkaError::MissingRegion("NAND partition"))?;
        self.partition_by_index(index)
    }

    /// Decrypted (or raw, for plain regions) view of a partition.
    fn partition_view(&self, partition: &NandPartition) -> LimonkaResult<Box<dyn FileLike>> {
        let sub = SubFile::new(self.base.clone(), partition.offset, partition.size);
        let inner: Box<dyn FileLike> = match partition.keyslot {
            Some(slot) => {
                let base_ctr = if partition.twl {
                    self.twl_base
                } else {
                    self.ctr_base
                };
                let ctr = base_ctr.wrapping_add(partition.offset as u128 >> 4);
                Box::new(self.crypto.create_ctr_io(slot, Box::new(sub), ctr)?)
            }
            None => Box::new(sub),
        };
        let shield = if partition.twl && partition.offset == 0 {
            TWL_MBR_OFFSET
        } else {
            0
        };
        Ok(Box::new(BoundedFile {
            inner,
            size: partition.size,
            shield,
        }))
    }

    /// Opens a NAND section, decrypted where the section is encrypted.
    pub fn open_section(&self, section: NandSection) -> LimonkaResult<Box<dyn FileLike>> {
        match section {
            NandSection::Header => Ok(Box::new(SubFile::new(self.base.clone(), 0, 0x200))),
            NandSection::Sector0x96 => Ok(Box::new(SubFile::new(
                self.base.clone(),
                0x96 * NAND_MEDIA_UNIT,
                NAND_MEDIA_UNIT,
            ))),
            NandSection::BonusVolume => {
                let start = self.min_size();
                if self.file_size <= start {
                    return Err(LimonkaError::MissingRegion("bonus volume"));
                }
                Ok(Box::new(SubFile::new(
                    self.base.clone(),
                    start,
                    self.file_size - start,
                )))
            }
            NandSection::TwlMbr => {
                let twl = self.partition_for(NandSection::TwlNand)?;
                let view = self.partition_view(twl)?;
                Ok(Box::new(SubFile::new(shared(view), TWL_MBR_OFFSET, 0x42)))
            }
            NandSection::Partition(index) => {
                let partition = *self.partition_by_index(index)?;
                self.partition_view(&partition)
            }
            other => {
                let partition = *self.partition_for(other)?;
                self.partition_view(&partition)
            }
        }
    }

    /// Opens the CTRNAND filesystem: the decrypted partition minus the
    /// leading 0x200 bytes, landing on the FAT MBR.
    pub fn open_ctr_partition(&self) -> LimonkaResult<Box<dyn FileLike>> {
        let partition = *self.partition_for(NandSection::CtrNand)?;
        let view = self.partition_view(&partition)?;
        Ok(Box::new(SubFile::new(
            shared(view),
            0x200,
            partition.size - 0x200,
        )))
    }

    /// Opens a partition from the TWL MBR by index.
    pub fn open_twl_partition(&self, index: usize) -> LimonkaResult<Box<dyn FileLike>> {
        if index >= 4 {
            return Err(LimonkaError::MissingRegion("TWL MBR partition"));
        }
        let twl = *self.partition_for(NandSection::TwlNand)?;
        let mut mbr = [0u8; 0x42];
        {
            let mut view = self.partition_view(&twl)?;
            view.seek(SeekFrom::Start(TWL_MBR_OFFSET))?;
            view.read_exact(&mut mbr)?;
        }
        if mbr[0x40..0x42] != [0x55, 0xAA] {
            return Err(LimonkaError::InvalidHeader {
                container: "TWL MBR",
                offset: TWL_MBR_OFFSET,
            });
        }
        let entry = &mbr[index * 16..index * 16 + 16];
        let start = u32::from_le_bytes(entry[8..12].try_into().unwrap()) as u64 * NAND_MEDIA_UNIT;
        let sectors =
            u32::from_le_bytes(entry[12..16].try_into().unwrap()) as u64 * NAND_MEDIA_UNIT;
        if start == 0 || sectors == 0 {
            return Err(LimonkaError::MissingRegion("TWL MBR partition"));
        }
        let view = self.partition_view(&twl)?;
        Ok(Box::new(SubFile::new(shared(view), start, sectors)))
    }
}

/// Clamps a partition view: writes that would cross the partition end are
/// rejected, and writes into the shielded header prefix are discarded.
struct BoundedFile {
    inner: Box<dyn FileLike>,
    size: u64,
    shield: u64,
}

impl Read for BoundedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for BoundedFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl Write for BoundedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let pos = self.inner.stream_position()?;
        if pos + buf.len() as u64 > self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                LimonkaError::CrossPartitionWrite,
            ));
        }
        if pos < self.shield {
            // silently drop the bytes that overlap the NCSD header
            let skip = ((self.shield - pos) as usize).min(buf.len());
            self.inner.seek(SeekFrom::Start(pos + skip as u64))?;
            if skip == buf.len() {
                return Ok(buf.len());
            }
            self.inner.write_all(&buf[skip..])?;
            return Ok(buf.len());
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
