//! CDN layouts: a directory (or any [`Filesystem`]) holding `tmd`, an
//! optional `cetk` ticket, and content files named by hex content id.

use std::collections::BTreeMap;
use std::path::Path;

use crate::crypto::{CryptoEngine, Keyslot};
use crate::fileio::{shared, CloseGuard, FileLike, SharedFile};
use crate::ncch::{NcchOptions, NcchReader};
use crate::ticket::Ticket;
use crate::tmd::{ContentChunk, ContentType, Tmd};
use crate::vfs::{Filesystem, OsDir};
use crate::{LimonkaError, LimonkaResult};

use log::warn;

#[derive(Debug, Clone, Default)]
pub struct CdnOptions {
    pub dev: bool,
    pub case_insensitive: bool,
    pub skip_contents: bool,
    /// Already-decrypted title key; highest priority.
    pub decrypted_titlekey: Option<[u8; 16]>,
    /// Encrypted title key, decrypted with `common_key_index`. Used over
    /// the `cetk` file if present.
    pub titlekey: Option<[u8; 16]>,
    pub common_key_index: u8,
    pub seed: Option<[u8; 16]>,
}

/// Reads titles laid out the way the update CDN serves them.
pub struct CdnReader {
    crypto: CryptoEngine,
    tmd: Tmd,
    ticket: Option<Ticket>,
    /// Decrypted view per available content, shared so several opens of
    /// the same content reuse one underlying file.
    content_files: BTreeMap<u16, SharedFile>,
    content_info: Vec<ContentChunk>,
    contents: BTreeMap<u16, NcchReader>,
}

impl CdnReader {
    /// Opens a CDN layout rooted at an OS directory containing `tmd`.
    pub fn from_dir(dir: &Path, options: &CdnOptions) -> LimonkaResult<Self> {
        Self::new(&OsDir::new(dir), None, options)
    }

    pub fn new(
        fs: &dyn Filesystem,
        crypto: Option<CryptoEngine>,
        options: &CdnOptions,
    ) -> LimonkaResult<Self> {
        let mut crypto = crypto.unwrap_or_else(|| CryptoEngine::new(options.dev));

        let mut tmd_raw = Vec::new();
        {
            use std::io::Read;
            fs.open("tmd")?.read_to_end(&mut tmd_raw)?;
        }
        let tmd = Tmd::from_bytes(&tmd_raw)?;
        let title_id = tmd.body().title_id();

        if let Some(seed) = options.seed {
            crate::crypto::add_seed(title_id.to_u64(), seed);
        }

        let mut ticket = None;
        if let Some(key) = options.decrypted_titlekey {
            crypto.set_normal_key(Keyslot::DecryptedTitlekey as u8, key);
        } else if let Some(key) = options.titlekey {
            crypto.load_encrypted_titlekey(key, options.common_key_index, title_id.to_bytes())?;
        } else {
            let mut cetk = Vec::new();
            {
                use std::io::Read;
                fs.open("cetk")?.read_to_end(&mut cetk)?;
            }
            crypto.load_from_ticket(&cetk)?;
            ticket = Some(Ticket::from_bytes(&cetk)?);
        }

        let title_is_twl = title_id
            .to_titleid()
            .map(|tid| tid.is_twl())
            .unwrap_or(false);

        let mut reader = Self {
            crypto,
            tmd,
            ticket,
            content_files: BTreeMap::new(),
            content_info: Vec::new(),
            contents: BTreeMap::new(),
        };

        for record in reader.tmd.chunk_records().to_vec() {
            // contents may be stored with lower- or uppercase hex names
            let lower = record.id_hex();
            let upper = lower.to_uppercase();
            let name = if fs.exists(&lower) {
                lower
            } else if fs.exists(&upper) {
                upper
            } else {
                continue;
            };

            reader.content_info.push(record);

            let open = || -> LimonkaResult<SharedFile> {
                let base = fs.open(&name)?;
                let view: Box<dyn FileLike> =
                    if record.content_type().contains(ContentType::ENCRYPTED) {
                        let mut iv = [0u8; 16];
                        iv[0..2].copy_from_slice(&record.index().to_be_bytes());
                        Box::new(reader.crypto.create_cbc_io(
                            Keyslot::DecryptedTitlekey as u8,
                            base,
                            iv,
                        )?)
                    } else {
                        base
                    };
                Ok(shared(view))
            };

            let shared_view = match open() {
                Ok(v) => v,
                Err(err) => {
                    warn!("CDN content {name} is unreadable: {err}");
                    continue;
                }
            };
            reader.content_files.insert(record.index(), shared_view.clone());

            let is_srl = title_is_twl && record.index() == 0;
            if options.skip_contents || is_srl {
                continue;
            }
            match NcchReader::new(
                shared_view,
                Some(reader.crypto.clone()),
                &NcchOptions {
                    dev: options.dev,
                    case_insensitive: options.case_insensitive,
                    ..NcchOptions::default()
                },
            ) {
                Ok(ncch) => {
                    reader.contents.insert(record.index(), ncch);
                }
                Err(err) => warn!("CDN content {name} failed to parse: {err}"),
            }
        }

        Ok(reader)
    }

    /// Opens a decrypted view of a content. The returned guard shares the
    /// underlying file, so dropping it leaves other views usable.
    pub fn open_raw_content(&self, index: u16) -> LimonkaResult<Box<dyn FileLike>> {
        let shared_view = self
            .content_files
            .get(&index)
            .ok_or(LimonkaError::MissingRegion("CDN content"))?;
        Ok(Box::new(CloseGuard::new(shared_view.clone())))
    }

    #[must_use]
    pub fn tmd(&self) -> &Tmd {
        &self.tmd
    }
    #[must_use]
    pub fn ticket(&self) -> Option<&Ticket> {
        self.ticket.as_ref()
    }
    /// Chunk records for the contents that were actually found on disk.
    #[must_use]
    pub fn content_info(&self) -> &[ContentChunk] {
        &self.content_info
    }
    #[must_use]
    pub fn contents(&self) -> &BTreeMap<u16, NcchReader> {
        &self.contents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileio::ReadOnly;
    use crate::ncch::tests::{build_ncch, NcchSpec};
    use crate::ticket::tests::build_ticket;
    use crate::tmd::tests::build_tmd;
    use std::collections::HashMap;
    use std::io::Cursor;
    use crate::vfs::EntryInfo;

    const TITLE_ID: u64 = 0x000400000bcfff00;
    const TITLE_KEY: [u8; 16] = [0x31; 16];

    /// An in-memory CDN directory.
    struct MemDir {
        files: HashMap<String, Vec<u8>>,
    }

    impl Filesystem for MemDir {
        fn listdir(&self, _path: &str) -> LimonkaResult<Vec<String>> {
            let mut names: Vec<String> = self.files.keys().cloned().collect();
            names.sort();
            Ok(names)
        }
        fn getinfo(&self, path: &str) -> LimonkaResult<EntryInfo> {
            let name = path.trim_start_matches('/');
            self.files
                .get(name)
                .map(|data| EntryInfo {
                    is_file: true,
                    is_dir: false,
                    size: data.len() as u64,
                })
                .ok_or_else(|| {
                    LimonkaError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        name.to_string(),
                    ))
                })
        }
        fn open(&self, path: &str) -> LimonkaResult<Box<dyn FileLike>> {
            let name = path.trim_start_matches('/');
            let data = self.files.get(name).ok_or_else(|| {
                LimonkaError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    name.to_string(),
                ))
            })?;
            Ok(Box::new(ReadOnly(Cursor::new(data.clone()))))
        }
    }

    fn build_cdn() -> MemDir {
        let engine = CryptoEngine::new(false);
        let exefs = crate::ncch::exefs::tests::build_exefs(&[(".code", b"cdn code")]);
        let ncch = build_ncch(
            &NcchSpec {
                program_id: TITLE_ID,
                partition_id: TITLE_ID,
                exefs: Some(exefs),
                ..NcchSpec::default()
            },
            &engine,
        );

        let mut content = ncch;
        let mut cipher = {
            let mut engine = CryptoEngine::new(false);
            engine.set_normal_key(Keyslot::DecryptedTitlekey as u8, TITLE_KEY);
            engine
                .create_cbc_cipher(Keyslot::DecryptedTitlekey as u8, [0; 16])
                .unwrap()
        };
        cipher.encrypt(&mut content);

        let mut files = HashMap::new();
        files.insert(
            "tmd".to_string(),
            build_tmd(TITLE_ID, content.len() as u64, true),
        );
        files.insert("cetk".to_string(), build_ticket(TITLE_ID, TITLE_KEY));
        files.insert("00000000".to_string(), content);
        MemDir { files }
    }

    #[test]
    fn reads_contents_via_cetk() {
        let dir = build_cdn();
        let reader = CdnReader::new(
            &dir,
            Some(crate::ticket::tests::common_key_engine()),
            &CdnOptions::default(),
        )
        .unwrap();
        assert_eq!(reader.content_info().len(), 1);
        assert!(reader.ticket().is_some());
        let ncch = &reader.contents()[&0];
        assert_eq!(ncch.exefs().unwrap().read_file(".code").unwrap(), b"cdn code");
    }

    #[test]
    fn explicit_decrypted_titlekey_overrides_cetk() {
        let mut dir = build_cdn();
        dir.files.remove("cetk");
        let reader = CdnReader::new(
            &dir,
            None,
            &CdnOptions {
                decrypted_titlekey: Some(TITLE_KEY),
                ..CdnOptions::default()
            },
        )
        .unwrap();
        assert!(reader.ticket().is_none());
        assert_eq!(
            reader.contents()[&0]
                .exefs()
                .unwrap()
                .read_file(".code")
                .unwrap(),
            b"cdn code"
        );
    }

    #[test]
    fn missing_content_file_is_skipped() {
        let mut dir = build_cdn();
        dir.files.remove("00000000");
        let reader = CdnReader::new(
            &dir,
            Some(crate::ticket::tests::common_key_engine()),
            &CdnOptions::default(),
        )
        .unwrap();
        assert!(reader.content_info().is_empty());
        assert!(reader.contents().is_empty());
        assert!(reader.open_raw_content(0).is_err());
    }
}
