//! NCCH: the per-content container holding the extended header, ExeFS and
//! RomFS of a title.
//! <https://www.3dbrew.org/wiki/NCCH>

pub mod exefs;
pub mod romfs;

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};

use crate::align_up;
use crate::crypto::{CryptoEngine, KeyType, Keyslot};
use crate::fileio::{shared, ConcatFile, FileLike, SharedFile, SubFile};
use crate::hash::{sha256, sha256_2};
use crate::titleid::TitleId;
use crate::{FromBytes, LimonkaError, LimonkaResult};

use exefs::{ExeFsReader, EXEFS_HEADER_SIZE};
use log::warn;
use romfs::RomFsReader;

/// NCCH sections are stored in media units of this size (shifted by the
/// unit-size flag).
pub const NCCH_MEDIA_UNIT: u64 = 0x200;

/// ExeFS entries that always use the original NCCH keyslot, even when the
/// rest of the ExeFS uses an extra keyslot.
const EXEFS_NORMAL_CRYPTO_FILES: [&str; 2] = ["icon", "banner"];

/// Sections of an NCCH container. The discriminants of the encrypted
/// sections are the tag mixed into the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NcchSection {
    ExtendedHeader = 1,
    ExeFs = 2,
    RomFs = 3,

    // not encrypted
    Header = 4,
    Logo = 5,
    Plain = 6,
    Raw = 7,
}

#[derive(Debug, Clone, Copy)]
pub struct NcchRegion {
    pub section: NcchSection,
    pub offset: u64,
    pub size: u64,
    /// Counter for the start of the section; unused for plain sections.
    pub iv: u128,
}

/// Decoded NCCH flags.
#[derive(Debug, Clone, Copy)]
pub struct NcchFlags {
    /// Selects the extra keyslot used for RomFS and parts of ExeFS.
    pub crypto_method: u8,
    /// CXI when set, CFA otherwise.
    pub executable: bool,
    pub fixed_crypto_key: bool,
    pub no_romfs: bool,
    pub no_crypto: bool,
    pub uses_seed: bool,
    /// Content unit size exponent.
    pub unit_size: u8,
}

/// Options for opening an NCCH.
#[derive(Debug, Clone, Default)]
pub struct NcchOptions {
    pub dev: bool,
    /// Adds the seed to the registry before opening.
    pub seed: Option<[u8; 16]>,
    /// Treat contents as already decrypted even if the flags say otherwise.
    pub assume_decrypted: bool,
    pub case_insensitive: bool,
    /// Parse the ExeFS and RomFS immediately.
    pub skip_sections: bool,
}

/// Reads the contents of an NCCH container with on-the-fly decryption.
pub struct NcchReader {
    base: SharedFile,
    crypto: CryptoEngine,

    program_id: u64,
    partition_id: u64,
    product_code: String,
    version: u16,
    content_size: u64,
    flags: NcchFlags,
    sections: HashMap<NcchSection, NcchRegion>,

    main_keyslot: u8,
    extra_keyslot: u8,
    assume_decrypted: bool,
    /// ExeFS ranges decrypted with the main keyslot, in 0x200 units.
    exefs_primary_ranges: Vec<(u64, u64)>,

    exefs: Option<ExeFsReader>,
    romfs: Option<RomFsReader>,
}

impl NcchReader {
    /// Opens an NCCH presented at offset 0 of `base`. `crypto` defaults to
    /// a fresh engine; pass a clone when reading containers with multiple
    /// contents, since the reader programs its key material into it.
    pub fn new(
        base: SharedFile,
        crypto: Option<CryptoEngine>,
        options: &NcchOptions,
    ) -> LimonkaResult<Self> {
        let mut header = [0u8; 0x200];
        {
            let mut guard = base.lock().unwrap();
            guard.seek(SeekFrom::Start(0))?;
            guard.read_exact(&mut header)?;
        }
        if &header[0x100..0x104] != b"NCCH" {
            return Err(LimonkaError::InvalidHeader {
                container: "NCCH",
                offset: 0x100,
            });
        }

        let key_y: [u8; 16] = header[0x0..0x10].try_into().unwrap();
        let partition_id = u64::from_le_bytes(header[0x108..0x110].try_into().unwrap());
        let program_id = u64::from_le_bytes(header[0x118..0x120].try_into().unwrap());
        let version = u16::from_le_bytes(header[0x112..0x114].try_into().unwrap());
        let seed_verify: [u8; 4] = header[0x114..0x118].try_into().unwrap();
        let product_code = String::from_utf8_lossy(&header[0x150..0x160])
            .trim_end_matches('\0')
            .to_string();
        let exheader_size = u32::from_le_bytes(header[0x180..0x184].try_into().unwrap());

        let flags_raw = &header[0x188..0x190];
        let flags = NcchFlags {
            crypto_method: flags_raw[3],
            executable: flags_raw[5] & 0x2 != 0,
            fixed_crypto_key: flags_raw[7] & 0x1 != 0,
            no_romfs: flags_raw[7] & 0x2 != 0,
            no_crypto: flags_raw[7] & 0x4 != 0,
            uses_seed: flags_raw[7] & 0x20 != 0,
            unit_size: flags_raw[6],
        };

        let media_unit = NCCH_MEDIA_UNIT << flags.unit_size;
        let content_size =
            u32::from_le_bytes(header[0x104..0x108].try_into().unwrap()) as u64 * media_unit;

        let mut sections = HashMap::new();
        let mut add_region = |section: NcchSection, start_unit: u64, units: u64| {
            if units == 0 {
                return;
            }
            sections.insert(
                section,
                NcchRegion {
                    section,
                    offset: start_unit * media_unit,
                    size: units * media_unit,
                    iv: (partition_id as u128) << 64 | (section as u128) << 56,
                },
            );
        };

        let units_at = |at: usize| -> u64 {
            u32::from_le_bytes(header[at..at + 4].try_into().unwrap()) as u64
        };

        add_region(NcchSection::Header, 0, 1);
        add_region(NcchSection::Raw, 0, content_size / media_unit);
        if exheader_size == 0x400 {
            // the on-disk region is the exheader plus the access descriptor
            add_region(NcchSection::ExtendedHeader, 1, 4);
        }
        add_region(NcchSection::Logo, units_at(0x198), units_at(0x19C));
        add_region(NcchSection::Plain, units_at(0x190), units_at(0x194));
        add_region(NcchSection::ExeFs, units_at(0x1A0), units_at(0x1A4));
        add_region(NcchSection::RomFs, units_at(0x1B0), units_at(0x1B4));

        let mut crypto = match crypto {
            Some(engine) => engine,
            None => CryptoEngine::new(options.dev),
        };

        let (main_keyslot, extra_keyslot);
        if flags.fixed_crypto_key {
            let system = TitleId::from_u64(program_id)
                .map(|tid| tid.is_system())
                .unwrap_or(false);
            main_keyslot = if system {
                Keyslot::FixedSystemKey as u8
            } else {
                Keyslot::ZeroKey as u8
            };
            extra_keyslot = main_keyslot;
        } else {
            main_keyslot = Keyslot::Ncch as u8;
            let source = match flags.crypto_method {
                0x00 => Keyslot::Ncch as u8,
                0x01 => Keyslot::Ncch70 as u8,
                0x0A => Keyslot::Ncch93 as u8,
                0x0B => Keyslot::Ncch96 as u8,
                _ => return Err(LimonkaError::EnumValueOutOfRange("ncch crypto method")),
            };

            crypto.set_keyslot_bytes(KeyType::Y, main_keyslot, key_y);

            if let Some(seed) = options.seed {
                crate::crypto::add_seed(program_id, seed);
            }

            if flags.uses_seed {
                let seed = crate::crypto::get_seed(program_id)?;
                let verify = sha256_2(&seed, &program_id.to_le_bytes());
                if verify[0..4] != seed_verify {
                    return Err(LimonkaError::InvalidSeed(
                        "seed does not match the header verify field",
                    ));
                }
                let seeded_key_y: [u8; 16] = sha256_2(&key_y, &seed)[0..16].try_into().unwrap();
                // the hardware slot keeps its X; the seeded Y lives in the
                // synthetic extra slot so the original Y stays usable
                extra_keyslot = Keyslot::NcchExtra as u8;
                if crypto.copy_keyslot_x(source, extra_keyslot).is_err() {
                    warn!("KeyX for slot {source:#04x} not loaded; seeded sections will fail");
                }
                crypto.set_keyslot_bytes(KeyType::Y, extra_keyslot, seeded_key_y);
            } else {
                extra_keyslot = source;
                crypto.set_keyslot_bytes(KeyType::Y, extra_keyslot, key_y);
            }
        }

        let mut reader = Self {
            base,
            crypto,
            program_id,
            partition_id,
            product_code,
            version,
            content_size,
            flags,
            sections,
            main_keyslot,
            extra_keyslot,
            assume_decrypted: options.assume_decrypted,
            exefs_primary_ranges: vec![(0, EXEFS_HEADER_SIZE)],
            exefs: None,
            romfs: None,
        };

        if !options.skip_sections {
            reader.load_sections(options.case_insensitive)?;
        }

        Ok(reader)
    }

    #[must_use]
    pub fn program_id(&self) -> u64 {
        self.program_id
    }
    #[must_use]
    pub fn partition_id(&self) -> u64 {
        self.partition_id
    }
    #[must_use]
    pub fn product_code(&self) -> &str {
        &self.product_code
    }
    #[must_use]
    pub fn version(&self) -> u16 {
        self.version
    }
    #[must_use]
    pub fn content_size(&self) -> u64 {
        self.content_size
    }
    #[must_use]
    pub fn flags(&self) -> &NcchFlags {
        &self.flags
    }
    #[must_use]
    pub fn sections(&self) -> &HashMap<NcchSection, NcchRegion> {
        &self.sections
    }
    #[must_use]
    pub fn main_keyslot(&self) -> u8 {
        self.main_keyslot
    }
    #[must_use]
    pub fn extra_keyslot(&self) -> u8 {
        self.extra_keyslot
    }
    #[must_use]
    pub fn exefs(&self) -> Option<&ExeFsReader> {
        self.exefs.as_ref()
    }
    #[must_use]
    pub fn romfs(&self) -> Option<&RomFsReader> {
        self.romfs.as_ref()
    }
    #[must_use]
    pub fn check_for_extheader(&self) -> bool {
        self.sections.contains_key(&NcchSection::ExtendedHeader)
    }

    fn region(&self, section: NcchSection) -> LimonkaResult<&NcchRegion> {
        self.sections.get(&section).ok_or(match section {
            NcchSection::ExtendedHeader => LimonkaError::MissingRegion("extended header"),
            NcchSection::ExeFs => LimonkaError::MissingRegion("ExeFS"),
            NcchSection::RomFs => LimonkaError::MissingRegion("RomFS"),
            NcchSection::Logo => LimonkaError::MissingRegion("logo"),
            NcchSection::Plain => LimonkaError::MissingRegion("plain"),
            _ => LimonkaError::MissingRegion("NCCH"),
        })
    }

    fn plain(&self) -> bool {
        self.assume_decrypted || self.flags.no_crypto
    }

    /// Opens a raw NCCH section for reading with on-the-fly decryption.
    pub fn open_raw_section(&self, section: NcchSection) -> LimonkaResult<Box<dyn FileLike>> {
        let region = *self.region(section)?;
        let sub = SubFile::new(self.base.clone(), region.offset, region.size);
        let encrypted = !self.plain()
            && matches!(
                section,
                NcchSection::ExtendedHeader | NcchSection::ExeFs | NcchSection::RomFs
            );
        if !encrypted {
            return Ok(Box::new(sub));
        }
        if section == NcchSection::ExeFs && self.extra_keyslot != self.main_keyslot {
            return self.open_exefs_dual_key(&region);
        }
        let keyslot = if section == NcchSection::RomFs {
            self.extra_keyslot
        } else {
            self.main_keyslot
        };
        Ok(Box::new(
            self.crypto.create_ctr_io(keyslot, Box::new(sub), region.iv)?,
        ))
    }

    /// Builds the dual-key ExeFS view: the header and the icon/banner
    /// ranges use the main keyslot, everything else the extra keyslot. The
    /// ranges are concatenated into one decrypted stream.
    fn open_exefs_dual_key(&self, region: &NcchRegion) -> LimonkaResult<Box<dyn FileLike>> {
        let mut primary = self.exefs_primary_ranges.clone();
        primary.sort_unstable();

        let mut parts: Vec<(Box<dyn FileLike>, u64)> = Vec::new();
        let mut push = |this: &Self, start: u64, end: u64, keyslot: u8| -> LimonkaResult<()> {
            if start >= end {
                return Ok(());
            }
            let sub = SubFile::new(this.base.clone(), region.offset + start, end - start);
            let view =
                this.crypto
                    .create_ctr_io(keyslot, Box::new(sub), region.iv + (start as u128 >> 4))?;
            parts.push((Box::new(view), end - start));
            Ok(())
        };

        let mut at = 0;
        for &(start, end) in &primary {
            let end = end.min(region.size);
            if start > at {
                push(self, at, start, self.extra_keyslot)?;
            }
            push(self, at.max(start), end, self.main_keyslot)?;
            at = at.max(end);
        }
        if at < region.size {
            push(self, at, region.size, self.extra_keyslot)?;
        }

        Ok(Box::new(ConcatFile::new(parts)))
    }

    fn load_sections(&mut self, case_insensitive: bool) -> LimonkaResult<()> {
        if self.sections.contains_key(&NcchSection::ExeFs) {
            // parse the header alone first to learn which entries keep the
            // main keyslot, then build the real view
            let region = *self.region(NcchSection::ExeFs)?;
            let mut header_view: Box<dyn FileLike> = if self.plain() {
                Box::new(SubFile::new(self.base.clone(), region.offset, EXEFS_HEADER_SIZE))
            } else {
                let sub = SubFile::new(self.base.clone(), region.offset, EXEFS_HEADER_SIZE);
                Box::new(self.crypto.create_ctr_io(
                    self.main_keyslot,
                    Box::new(sub),
                    region.iv,
                )?)
            };
            let mut raw = [0u8; 0x200];
            header_view.read_exact(&mut raw)?;
            let header = exefs::ExeFsHeader::from_bytes(&raw)?.clone();
            for entry in header.entries() {
                if EXEFS_NORMAL_CRYPTO_FILES.contains(&entry.name().as_ref()) {
                    self.exefs_primary_ranges.push((
                        entry.offset() as u64 + EXEFS_HEADER_SIZE,
                        entry.offset() as u64
                            + EXEFS_HEADER_SIZE
                            + align_up(entry.size() as u64, NCCH_MEDIA_UNIT),
                    ));
                }
            }
            let view = self.open_raw_section(NcchSection::ExeFs)?;
            self.exefs = Some(ExeFsReader::new(shared(view))?);
        }

        if !self.flags.no_romfs && self.sections.contains_key(&NcchSection::RomFs) {
            let view = self.open_raw_section(NcchSection::RomFs)?;
            match RomFsReader::new(shared(view), case_insensitive) {
                Ok(romfs) => self.romfs = Some(romfs),
                Err(err) => warn!("RomFS of {:016x} failed to parse: {err}", self.program_id),
            }
        }
        Ok(())
    }

    /// Reads the decrypted extended header (0x400 bytes plus the access
    /// descriptor).
    pub fn exheader(&self) -> LimonkaResult<Vec<u8>> {
        let mut view = self.open_raw_section(NcchSection::ExtendedHeader)?;
        let mut out = Vec::new();
        view.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Whether `.code` in the ExeFS is compressed, from the extended
    /// header flags.
    pub fn code_compressed(&self) -> LimonkaResult<bool> {
        Ok(self.exheader()?[0xD] & 0x1 != 0)
    }

    /// Verifies the logo region hash in the header, when both exist.
    pub fn logo_hash_ok(&self) -> LimonkaResult<bool> {
        let mut view = self.open_raw_section(NcchSection::Logo)?;
        let mut logo = Vec::new();
        view.read_to_end(&mut logo)?;
        let mut header = [0u8; 0x200];
        {
            let mut guard = self.base.lock().unwrap();
            guard.seek(SeekFrom::Start(0))?;
            guard.read_exact(&mut header)?;
        }
        Ok(sha256(&logo) == header[0x130..0x150])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::KeyType;
    use crate::ncch::exefs::tests::build_exefs;
    use crate::ncch::romfs::tests::Lv3Builder;
    use crate::vfs::Filesystem;
    use std::io::Cursor;

    pub(crate) struct NcchSpec {
        pub program_id: u64,
        pub partition_id: u64,
        pub flags7: u8,
        pub crypto_method: u8,
        pub key_y: [u8; 16],
        pub seed: Option<[u8; 16]>,
        pub exheader: Option<Vec<u8>>,
        pub exefs: Option<Vec<u8>>,
        pub romfs: Option<Vec<u8>>,
    }

    impl Default for NcchSpec {
        fn default() -> Self {
            Self {
                program_id: 0x000400000FF3FF00,
                partition_id: 0x000400000FF3FF00,
                flags7: 0x01, // fixed crypto key
                crypto_method: 0,
                key_y: [0; 16],
                seed: None,
                exheader: None,
                exefs: None,
                romfs: None,
            }
        }
    }

    /// Assembles an NCCH image, encrypting the sections with the engine
    /// the reader is expected to derive.
    pub(crate) fn build_ncch(spec: &NcchSpec, engine: &CryptoEngine) -> Vec<u8> {
        let unit = NCCH_MEDIA_UNIT as usize;
        let units = |len: usize| len.div_ceil(unit);

        let mut total_units = 1;
        let exheader_units = spec.exheader.as_ref().map(|_| 4).unwrap_or(0);
        total_units += exheader_units;
        let exefs_start = total_units;
        let exefs_units = spec.exefs.as_ref().map(|e| units(e.len())).unwrap_or(0);
        total_units += exefs_units;
        let romfs_start = total_units;
        let romfs_units = spec.romfs.as_ref().map(|r| units(r.len())).unwrap_or(0);
        total_units += romfs_units;

        let mut out = vec![0u8; total_units * unit];
        out[0x0..0x10].copy_from_slice(&spec.key_y);
        out[0x100..0x104].copy_from_slice(b"NCCH");
        out[0x104..0x108].copy_from_slice(&(total_units as u32).to_le_bytes());
        out[0x108..0x110].copy_from_slice(&spec.partition_id.to_le_bytes());
        out[0x118..0x120].copy_from_slice(&spec.program_id.to_le_bytes());
        out[0x150..0x15A].copy_from_slice(b"CTR-P-TEST");
        if let Some(seed) = &spec.seed {
            let verify = crate::hash::sha256_2(seed, &spec.program_id.to_le_bytes());
            out[0x114..0x118].copy_from_slice(&verify[0..4]);
        }
        if spec.exheader.is_some() {
            out[0x180..0x184].copy_from_slice(&0x400u32.to_le_bytes());
        }
        out[0x188 + 3] = spec.crypto_method;
        out[0x188 + 5] = 0x2; // executable
        out[0x188 + 7] = spec.flags7;
        if spec.exefs.is_some() {
            out[0x1A0..0x1A4].copy_from_slice(&(exefs_start as u32).to_le_bytes());
            out[0x1A4..0x1A8].copy_from_slice(&(exefs_units as u32).to_le_bytes());
        }
        if spec.romfs.is_some() {
            out[0x1B0..0x1B4].copy_from_slice(&(romfs_start as u32).to_le_bytes());
            out[0x1B4..0x1B8].copy_from_slice(&(romfs_units as u32).to_le_bytes());
        }

        let iv = |section: NcchSection| -> u128 {
            (spec.partition_id as u128) << 64 | (section as u128) << 56
        };

        let no_crypto = spec.flags7 & 0x4 != 0;
        let fixed = spec.flags7 & 0x1 != 0;
        let main_slot = if fixed { Keyslot::ZeroKey as u8 } else { Keyslot::Ncch as u8 };
        let extra_slot = if fixed {
            main_slot
        } else if spec.seed.is_some() {
            Keyslot::NcchExtra as u8
        } else {
            match spec.crypto_method {
                0 => Keyslot::Ncch as u8,
                1 => Keyslot::Ncch70 as u8,
                _ => unreachable!(),
            }
        };

        let mut encrypt = |data: &[u8], slot: u8, iv: u128, at: usize| {
            let mut buf = data.to_vec();
            if !no_crypto {
                engine.create_ctr_cipher(slot, iv).unwrap().apply(&mut buf);
            }
            out[at..at + buf.len()].copy_from_slice(&buf);
        };

        if let Some(exheader) = &spec.exheader {
            encrypt(exheader, main_slot, iv(NcchSection::ExtendedHeader), unit);
        }
        if let Some(exefs_image) = &spec.exefs {
            // header plus icon/banner use the main slot, the rest the extra
            let header = exefs::ExeFsHeader::from_bytes(&exefs_image[..0x200])
                .unwrap()
                .clone();
            let mut ranges = vec![(0u64, 0x200u64)];
            for entry in header.entries() {
                if EXEFS_NORMAL_CRYPTO_FILES.contains(&entry.name().as_ref()) {
                    ranges.push((
                        0x200 + entry.offset() as u64,
                        0x200 + entry.offset() as u64
                            + crate::align_up(entry.size() as u64, NCCH_MEDIA_UNIT),
                    ));
                }
            }
            ranges.sort_unstable();
            let base_iv = iv(NcchSection::ExeFs);
            let image_at = exefs_start * unit;
            let mut at = 0u64;
            let mut emit = |start: u64, end: u64, slot: u8| {
                if start < end {
                    let chunk = &exefs_image[start as usize..(end as usize).min(exefs_image.len())];
                    encrypt(chunk, slot, base_iv + (start as u128 >> 4), image_at + start as usize);
                }
            };
            for &(start, end) in &ranges {
                let end = end.min(exefs_image.len() as u64);
                if start > at {
                    emit(at, start, extra_slot);
                }
                emit(at.max(start), end, main_slot);
                at = at.max(end);
            }
            emit(at, exefs_image.len() as u64, extra_slot);
        }
        if let Some(romfs_image) = &spec.romfs {
            encrypt(
                romfs_image,
                extra_slot,
                iv(NcchSection::RomFs),
                romfs_start * unit,
            );
        }
        out
    }

    fn sample_exefs() -> Vec<u8> {
        build_exefs(&[
            (".code", b"the code segment"),
            ("icon", b"icon pixels here"),
        ])
    }

    fn sample_romfs() -> Vec<u8> {
        let mut builder = Lv3Builder::new();
        builder.file(0, "greeting.txt", b"hello from romfs");
        builder.build()
    }

    #[test]
    fn fixed_key_ncch_round_trip() {
        let engine = CryptoEngine::new(false);
        let exheader = {
            let mut data = vec![0u8; 0x800];
            data[..8].copy_from_slice(b"TestApp\0");
            data
        };
        let spec = NcchSpec {
            exheader: Some(exheader.clone()),
            exefs: Some(sample_exefs()),
            romfs: Some(sample_romfs()),
            ..NcchSpec::default()
        };
        let image = build_ncch(&spec, &engine);

        let reader = NcchReader::new(
            shared(Cursor::new(image)),
            None,
            &NcchOptions::default(),
        )
        .unwrap();

        assert_eq!(reader.main_keyslot(), Keyslot::ZeroKey as u8);
        assert_eq!(reader.product_code(), "CTR-P-TEST");
        assert!(reader.check_for_extheader());
        assert_eq!(reader.exheader().unwrap(), exheader);

        let exefs = reader.exefs().unwrap();
        assert_eq!(exefs.read_file(".code").unwrap(), b"the code segment");

        let romfs = reader.romfs().unwrap();
        let mut out = Vec::new();
        romfs
            .open_file("/greeting.txt")
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"hello from romfs");
    }

    #[test]
    fn fixed_system_key_for_system_titles() {
        let engine = CryptoEngine::new(false);
        let spec = NcchSpec {
            program_id: 0x0004001000021000,
            partition_id: 0x0004001000021000,
            ..NcchSpec::default()
        };
        let image = build_ncch(&spec, &engine);
        let reader =
            NcchReader::new(shared(Cursor::new(image)), None, &NcchOptions::default()).unwrap();
        assert_eq!(reader.main_keyslot(), Keyslot::FixedSystemKey as u8);
    }

    #[test]
    fn no_crypto_ncch_reads_plain() {
        let engine = CryptoEngine::new(false);
        let spec = NcchSpec {
            flags7: 0x4, // no crypto
            exefs: Some(sample_exefs()),
            ..NcchSpec::default()
        };
        let image = build_ncch(&spec, &engine);
        let reader =
            NcchReader::new(shared(Cursor::new(image)), None, &NcchOptions::default()).unwrap();
        assert_eq!(
            reader.exefs().unwrap().read_file("icon").unwrap(),
            b"icon pixels here"
        );
    }

    fn seeded_engine() -> CryptoEngine {
        let mut engine = CryptoEngine::new(false);
        // the original-NCCH KeyX normally comes from boot9
        engine.set_keyslot_int(KeyType::X, Keyslot::Ncch as u8, 0x1234_5678_9ABC_DEF0);
        engine
    }

    /// Builder-side engine with the keys the console would derive.
    fn seeded_builder_engine(key_y: [u8; 16], seed: [u8; 16]) -> CryptoEngine {
        let mut engine = seeded_engine();
        engine.set_keyslot_bytes(KeyType::Y, Keyslot::Ncch as u8, key_y);
        let seeded_y: [u8; 16] = crate::hash::sha256_2(&key_y, &seed)[0..16]
            .try_into()
            .unwrap();
        engine
            .copy_keyslot_x(Keyslot::Ncch70 as u8, Keyslot::NcchExtra as u8)
            .unwrap();
        engine.set_keyslot_bytes(KeyType::Y, Keyslot::NcchExtra as u8, seeded_y);
        engine
    }

    #[test]
    fn seeded_romfs_decrypts_with_explicit_and_registry_seed() {
        let key_y = [0x55u8; 16];
        let seed = [0xA7u8; 16];
        let spec = NcchSpec {
            flags7: 0x20, // uses seed
            crypto_method: 0x01,
            key_y,
            seed: Some(seed),
            romfs: Some(sample_romfs()),
            ..NcchSpec::default()
        };
        let image = build_ncch(&spec, &seeded_builder_engine(key_y, seed));

        // explicit seed
        let reader = NcchReader::new(
            shared(Cursor::new(image.clone())),
            Some(seeded_engine()),
            &NcchOptions {
                seed: Some(seed),
                ..NcchOptions::default()
            },
        )
        .unwrap();
        assert_eq!(reader.extra_keyslot(), Keyslot::NcchExtra as u8);
        let via_explicit = {
            let mut out = Vec::new();
            reader
                .romfs()
                .unwrap()
                .open("/greeting.txt")
                .unwrap()
                .read_to_end(&mut out)
                .unwrap();
            out
        };

        // registry seed (left behind by the explicit open above)
        let reader = NcchReader::new(
            shared(Cursor::new(image)),
            Some(seeded_engine()),
            &NcchOptions::default(),
        )
        .unwrap();
        let via_registry = {
            let mut out = Vec::new();
            reader
                .romfs()
                .unwrap()
                .open("/greeting.txt")
                .unwrap()
                .read_to_end(&mut out)
                .unwrap();
            out
        };

        assert_eq!(via_explicit, b"hello from romfs");
        assert_eq!(via_explicit, via_registry);
    }

    #[test]
    fn wrong_seed_is_rejected() {
        let key_y = [0x55u8; 16];
        let seed = [0xA7u8; 16];
        let spec = NcchSpec {
            program_id: 0x000400000FF3FF01,
            partition_id: 0x000400000FF3FF01,
            flags7: 0x20,
            crypto_method: 0x01,
            key_y,
            seed: Some(seed),
            ..NcchSpec::default()
        };
        let image = build_ncch(&spec, &seeded_builder_engine(key_y, seed));
        let result = NcchReader::new(
            shared(Cursor::new(image)),
            Some(seeded_engine()),
            &NcchOptions {
                seed: Some([0xFF; 16]),
                ..NcchOptions::default()
            },
        );
        assert!(matches!(result, Err(LimonkaError::InvalidSeed(_))));
    }

    #[test]
    fn dual_key_exefs_mixes_keyslots() {
        let key_y = [0x66u8; 16];
        let mut builder_engine = seeded_engine();
        builder_engine.set_keyslot_bytes(KeyType::Y, Keyslot::Ncch as u8, key_y);
        builder_engine.set_keyslot_bytes(KeyType::Y, Keyslot::Ncch70 as u8, key_y);
        let spec = NcchSpec {
            flags7: 0,
            crypto_method: 0x01,
            key_y,
            exefs: Some(sample_exefs()),
            ..NcchSpec::default()
        };
        let image = build_ncch(&spec, &builder_engine);

        let reader = NcchReader::new(
            shared(Cursor::new(image)),
            Some(seeded_engine()),
            &NcchOptions::default(),
        )
        .unwrap();
        assert_eq!(reader.extra_keyslot(), Keyslot::Ncch70 as u8);
        let exefs = reader.exefs().unwrap();
        // icon is under the main keyslot, .code under the extra keyslot
        assert_eq!(exefs.read_file("icon").unwrap(), b"icon pixels here");
        assert_eq!(exefs.read_file(".code").unwrap(), b"the code segment");
    }
}
