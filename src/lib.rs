pub mod cci;
pub mod cdn;
pub mod cia;
pub mod crypto;
pub mod fileio;
pub mod hash;
pub mod nand;
pub mod ncch;
pub mod save;
pub mod sd;
pub mod smdh;
pub mod string;
pub mod ticket;
pub mod titleid;
pub mod tmd;
pub mod vfs;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LimonkaError {
    #[error("invalid {container} header at {offset:#x}")]
    InvalidHeader {
        container: &'static str,
        offset: u64,
    },
    #[error("invalid signature type {0:#x}")]
    InvalidSignatureType(u32),
    #[error("IVFC hash chain malformed: {0}")]
    InvalidIvfc(&'static str),
    #[error("{which} key for keyslot {slot:#04x} is not set up")]
    KeyslotMissing { slot: u8, which: crypto::KeyType },
    #[error("an OTP dump is required")]
    MissingOtp,
    #[error("invalid OTP: {0}")]
    InvalidOtp(&'static str),
    #[error("invalid boot9: {0}")]
    InvalidBoot9(&'static str),
    #[error("movable.sed key is not set up")]
    MissingMovableSed,
    #[error("ID0 directory {0} not found")]
    MissingId0(String),
    #[error("no ID1 directories inside ID0 {0}")]
    MissingId1(String),
    #[error("title {0} not found")]
    MissingTitle(String),
    #[error("no seed in the database for title {0:016x}")]
    SeedNotFound(u64),
    #[error("invalid seed: {0}")]
    InvalidSeed(&'static str),
    #[error("files under \"Nintendo DSiWare\" use a different encryption")]
    UnsupportedDsiWare,
    #[error("write crosses a partition boundary")]
    CrossPartitionWrite,
    #[error(".code decompression failed: {0}")]
    CodeDecompressionFailed(&'static str),
    #[error("missing {0} region")]
    MissingRegion(&'static str),
    #[error("byte slice passed is too small")]
    SliceTooSmall,
    #[error("value out of range for {0} enum")]
    EnumValueOutOfRange(&'static str),
    #[error("string error: {0}")]
    StringErr(#[from] string::SizedCStringError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type LimonkaResult<T> = std::result::Result<T, LimonkaError>;

/// Cast helper for on-disk `#[repr(C)]` structures.
///
/// Implementors must consist only of byte-array fields (alignment 1) so the
/// pointer cast in `cast` is valid for any input slice.
pub trait FromBytes {
    fn min_size() -> usize;
    fn bytes_ok(_: &[u8]) -> LimonkaResult<()>;
    fn cast(_: &[u8]) -> &Self;
    fn from_bytes(bytes: &[u8]) -> LimonkaResult<&Self> {
        if bytes.len() < Self::min_size() {
            return Err(LimonkaError::SliceTooSmall);
        }
        Self::bytes_ok(bytes)?;
        Ok(Self::cast(bytes))
    }
}

pub(crate) const fn align_up(val: u64, alignment: u64) -> u64 {
    if val % alignment != 0 {
        val + (alignment - (val % alignment))
    } else {
        val
    }
}

pub mod prelude {
    pub use crate::cci::CciReader;
    pub use crate::cdn::CdnReader;
    pub use crate::cia::CiaReader;
    pub use crate::crypto::{CryptoEngine, Keyslot};
    pub use crate::fileio::{shared, SubFile};
    pub use crate::nand::NandReader;
    pub use crate::ncch::NcchReader;
    pub use crate::smdh::Smdh;
    pub use crate::vfs::Filesystem;
    pub use crate::FromBytes;
}
