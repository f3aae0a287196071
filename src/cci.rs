//! CCI: CTR Cart Image, the dump format of game cards. An NCSD container
//! with up to eight NCCH partitions.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};

use crate::fileio::{shared, FileLike, SharedFile, SubFile};
use crate::ncch::{NcchOptions, NcchReader};
use crate::{LimonkaError, LimonkaResult};

use log::warn;

/// Sections of a CCI image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CciSection {
    Header,
    CardInfo,
    DevInfo,
    /// Partition by physical index; 0 is the game, 1 the manual, 2 the
    /// Download Play child, 6/7 the New/Old 3DS update partitions.
    Partition(u8),
}

#[derive(Debug, Clone, Copy)]
pub struct CciRegion {
    pub section: CciSection,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CciOptions {
    pub dev: bool,
    pub case_insensitive: bool,
    pub assume_decrypted: bool,
    pub skip_contents: bool,
}

/// Reads CTR Cart Image files.
pub struct CciReader {
    base: SharedFile,
    media_id: u64,
    image_size: u64,
    sections: BTreeMap<CciSection, CciRegion>,
    contents: BTreeMap<u8, NcchReader>,
}

impl CciReader {
    pub fn new(base: SharedFile, options: &CciOptions) -> LimonkaResult<Self> {
        let mut header = [0u8; 0x200];
        {
            let mut guard = base.lock().unwrap();
            guard.seek(SeekFrom::Start(0))?;
            guard.read_exact(&mut header)?;
        }
        if &header[0x100..0x104] != b"NCSD" {
            return Err(LimonkaError::InvalidHeader {
                container: "CCI",
                offset: 0x100,
            });
        }
        let media_id = u64::from_le_bytes(header[0x108..0x110].try_into().unwrap());
        if media_id == 0 {
            // a zero media id means this is a NAND image
            return Err(LimonkaError::InvalidHeader {
                container: "CCI",
                offset: 0x108,
            });
        }

        let media_unit = 0x200u64 << header[0x188];
        let image_size =
            u32::from_le_bytes(header[0x104..0x108].try_into().unwrap()) as u64 * media_unit;

        let mut sections = BTreeMap::new();
        let mut add_region = |section, offset, size| {
            sections.insert(
                section,
                CciRegion {
                    section,
                    offset,
                    size,
                },
            );
        };
        add_region(CciSection::Header, 0, 0x200);
        add_region(CciSection::CardInfo, 0x200, 0x1000);
        add_region(CciSection::DevInfo, 0x1200, 0x300);

        let mut partitions = Vec::new();
        for idx in 0u8..8 {
            let at = 0x120 + idx as usize * 8;
            let offset =
                u32::from_le_bytes(header[at..at + 4].try_into().unwrap()) as u64 * media_unit;
            let size =
                u32::from_le_bytes(header[at + 4..at + 8].try_into().unwrap()) as u64 * media_unit;
            if offset != 0 {
                add_region(CciSection::Partition(idx), offset, size);
                partitions.push(idx);
            }
        }

        let mut reader = Self {
            base,
            media_id,
            image_size,
            sections,
            contents: BTreeMap::new(),
        };

        if !options.skip_contents {
            for idx in partitions {
                let open = || -> LimonkaResult<NcchReader> {
                    let view = reader.open_raw_section(CciSection::Partition(idx))?;
                    NcchReader::new(
                        shared(view),
                        None,
                        &NcchOptions {
                            dev: options.dev,
                            case_insensitive: options.case_insensitive,
                            assume_decrypted: options.assume_decrypted,
                            ..NcchOptions::default()
                        },
                    )
                };
                match open() {
                    Ok(ncch) => {
                        reader.contents.insert(idx, ncch);
                    }
                    Err(err) => warn!("CCI partition {idx} is unreadable: {err}"),
                }
            }
        }

        Ok(reader)
    }

    /// Opens a raw CCI section. Partition decryption happens in the NCCH
    /// layer, so this is always a plain sub-view.
    pub fn open_raw_section(&self, section: CciSection) -> LimonkaResult<Box<dyn FileLike>> {
        let region = self
            .sections
            .get(&section)
            .ok_or(LimonkaError::MissingRegion("CCI section"))?;
        Ok(Box::new(SubFile::new(
            self.base.clone(),
            region.offset,
            region.size,
        )))
    }

    /// Media ID; the same value as the title id of the game partition.
    #[must_use]
    pub fn media_id(&self) -> u64 {
        self.media_id
    }
    #[must_use]
    pub fn image_size(&self) -> u64 {
        self.image_size
    }
    #[must_use]
    pub fn sections(&self) -> &BTreeMap<CciSection, CciRegion> {
        &self.sections
    }
    #[must_use]
    pub fn contents(&self) -> &BTreeMap<u8, NcchReader> {
        &self.contents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoEngine as Engine;
    use crate::ncch::tests::{build_ncch, NcchSpec};
    use std::io::Cursor;

    const MEDIA_ID: u64 = 0x000400000FF3FF00;

    fn build_cci() -> Vec<u8> {
        let engine = Engine::new(false);
        let exefs = crate::ncch::exefs::tests::build_exefs(&[(".code", b"game code")]);
        let game = build_ncch(
            &NcchSpec {
                exefs: Some(exefs),
                ..NcchSpec::default()
            },
            &engine,
        );

        let part_offset = 0x4000usize;
        let mut out = vec![0u8; part_offset];
        out[0x100..0x104].copy_from_slice(b"NCSD");
        out[0x108..0x110].copy_from_slice(&MEDIA_ID.to_le_bytes());
        let total_units = ((part_offset + game.len()) / 0x200) as u32;
        out[0x104..0x108].copy_from_slice(&total_units.to_le_bytes());
        out[0x120..0x124].copy_from_slice(&((part_offset / 0x200) as u32).to_le_bytes());
        out[0x124..0x128].copy_from_slice(&((game.len() / 0x200) as u32).to_le_bytes());
        out.extend_from_slice(&game);
        out
    }

    #[test]
    fn parses_partitions_and_contents() {
        let reader = CciReader::new(
            shared(Cursor::new(build_cci())),
            &CciOptions::default(),
        )
        .unwrap();
        assert_eq!(reader.media_id(), MEDIA_ID);
        assert!(reader.sections().contains_key(&CciSection::CardInfo));
        let game = &reader.contents()[&0];
        assert_eq!(
            game.exefs().unwrap().read_file(".code").unwrap(),
            b"game code"
        );
    }

    #[test]
    fn nand_media_id_is_rejected() {
        let mut image = build_cci();
        image[0x108..0x110].copy_from_slice(&[0; 8]);
        assert!(CciReader::new(shared(Cursor::new(image)), &CciOptions::default()).is_err());
    }
}
