//! Title Metadata: the signed manifest of contents in a title.

use core::mem;

use crate::string::SizedCString;
use crate::titleid::{MaybeTitleIdBe, TitleId};
use crate::{FromBytes, LimonkaError, LimonkaResult};

use bitflags::bitflags;
use derivative::Derivative;
use static_assertions::assert_eq_size;

/// Signature types found in TMDs, tickets and certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureType {
    Rsa4096Sha1,
    Rsa2048Sha1,
    EcdsaSha1,
    Rsa4096Sha256,
    Rsa2048Sha256,
    EcdsaSha256,
}

impl SignatureType {
    pub fn from_u32(raw: u32) -> LimonkaResult<Self> {
        Ok(match raw {
            0x10000 => Self::Rsa4096Sha1,
            0x10001 => Self::Rsa2048Sha1,
            0x10002 => Self::EcdsaSha1,
            0x10003 => Self::Rsa4096Sha256,
            0x10004 => Self::Rsa2048Sha256,
            0x10005 => Self::EcdsaSha256,
            _ => return Err(LimonkaError::InvalidSignatureType(raw)),
        })
    }

    #[must_use]
    pub fn to_u32(self) -> u32 {
        match self {
            Self::Rsa4096Sha1 => 0x10000,
            Self::Rsa2048Sha1 => 0x10001,
            Self::EcdsaSha1 => 0x10002,
            Self::Rsa4096Sha256 => 0x10003,
            Self::Rsa2048Sha256 => 0x10004,
            Self::EcdsaSha256 => 0x10005,
        }
    }

    /// Total length of the signature prefix, including the 4-byte type and
    /// the padding that aligns the signed data to 0x40.
    #[must_use]
    pub fn prefix_len(self) -> usize {
        match self {
            Self::Rsa4096Sha1 | Self::Rsa4096Sha256 => 0x240,
            Self::Rsa2048Sha1 | Self::Rsa2048Sha256 => 0x140,
            Self::EcdsaSha1 | Self::EcdsaSha256 => 0x80,
        }
    }
}

/// Header of the TMD, directly after the signature prefix.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
#[repr(C)]
pub struct TmdBody {
    issuer: SizedCString<0x40>,
    version: u8,
    ca_crl_version: u8,
    signer_crl_version: u8,
    #[derivative(Debug = "ignore")]
    _reserved0: u8,
    system_version: [u8; 8],
    title_id: MaybeTitleIdBe,
    title_type: [u8; 4],
    group_id: [u8; 2],
    save_data_size: [u8; 4],
    srl_private_save_size: [u8; 4],
    #[derivative(Debug = "ignore")]
    _reserved1: [u8; 4],
    srl_flag: u8,
    #[derivative(Debug = "ignore")]
    _reserved2: [u8; 0x31],
    access_rights: [u8; 4],
    title_version: [u8; 2],
    content_count: [u8; 2],
    boot_content: [u8; 2],
    #[derivative(Debug = "ignore")]
    _padding: [u8; 2],
    hash: [u8; 0x20],
}
assert_eq_size!([u8; 0xC4], TmdBody);

impl FromBytes for TmdBody {
    fn min_size() -> usize {
        mem::size_of::<TmdBody>()
    }
    fn bytes_ok(_: &[u8]) -> LimonkaResult<()> {
        Ok(())
    }
    fn cast(bytes: &[u8]) -> &Self {
        unsafe { &*(bytes.as_ptr() as *const Self) }
    }
}

impl TmdBody {
    #[must_use]
    pub fn issuer(&self) -> &SizedCString<0x40> {
        &self.issuer
    }
    #[must_use]
    pub fn title_id(&self) -> MaybeTitleIdBe {
        self.title_id
    }
    pub fn titleid(&self) -> LimonkaResult<TitleId> {
        self.title_id.to_titleid()
    }
    /// Save data size in bytes; little-endian on disk unlike the rest.
    #[must_use]
    pub fn save_data_size(&self) -> u32 {
        u32::from_le_bytes(self.save_data_size)
    }
    #[must_use]
    pub fn srl_private_save_size(&self) -> u32 {
        u32::from_le_bytes(self.srl_private_save_size)
    }
    #[must_use]
    pub fn title_version(&self) -> u16 {
        u16::from_be_bytes(self.title_version)
    }
    #[must_use]
    pub fn content_count(&self) -> u16 {
        u16::from_be_bytes(self.content_count)
    }
    #[must_use]
    pub fn boot_content(&self) -> u16 {
        u16::from_be_bytes(self.boot_content)
    }
    #[must_use]
    pub fn hash(&self) -> &[u8; 0x20] {
        &self.hash
    }

    fn as_bytes(&self) -> &[u8; 0xC4] {
        unsafe { &*(self as *const Self as *const [u8; 0xC4]) }
    }
}

/// One of the 64 content info records.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct ContentInfo {
    index_offset: [u8; 2],
    command_count: [u8; 2],
    hash: [u8; 0x20],
}
assert_eq_size!([u8; 0x24], ContentInfo);

impl ContentInfo {
    #[must_use]
    pub fn index_offset(&self) -> u16 {
        u16::from_be_bytes(self.index_offset)
    }
    #[must_use]
    pub fn command_count(&self) -> u16 {
        u16::from_be_bytes(self.command_count)
    }
    #[must_use]
    pub fn hash(&self) -> &[u8; 0x20] {
        &self.hash
    }

    fn as_bytes(&self) -> &[u8; 0x24] {
        unsafe { &*(self as *const Self as *const [u8; 0x24]) }
    }
}

/// A content chunk record: one per content in the title.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct ContentChunk {
    id: [u8; 4],
    index: [u8; 2],
    content_type: [u8; 2],
    size: [u8; 8],
    hash: [u8; 0x20],
}
assert_eq_size!([u8; 0x30], ContentChunk);

impl ContentChunk {
    #[must_use]
    pub fn id(&self) -> u32 {
        u32::from_be_bytes(self.id)
    }
    /// Content id as the lowercase hex filename used by CDN layouts.
    #[must_use]
    pub fn id_hex(&self) -> String {
        hex::encode(self.id)
    }
    #[must_use]
    pub fn index(&self) -> u16 {
        u16::from_be_bytes(self.index)
    }
    #[must_use]
    pub fn content_type(&self) -> ContentType {
        ContentType::from_bits_retain(u16::from_be_bytes(self.content_type))
    }
    #[must_use]
    pub fn size(&self) -> u64 {
        u64::from_be_bytes(self.size)
    }
    #[must_use]
    pub fn hash(&self) -> &[u8; 0x20] {
        &self.hash
    }

    fn as_bytes(&self) -> &[u8; 0x30] {
        unsafe { &*(self as *const Self as *const [u8; 0x30]) }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContentType: u16 {
        const ENCRYPTED = 0x1;
        const DISC = 0x2;
        const CFM = 0x4;
        const OPTIONAL = 0x4000;
        const SHARED = 0x8000;
    }
}

/// A parsed Title Metadata. `to_bytes` reproduces the input byte-exactly.
#[derive(Debug, Clone)]
pub struct Tmd {
    sig_type: SignatureType,
    signature: Vec<u8>,
    body: TmdBody,
    content_infos: Vec<ContentInfo>,
    chunks: Vec<ContentChunk>,
}

const CONTENT_INFO_COUNT: usize = 64;

impl Tmd {
    pub fn from_bytes(bytes: &[u8]) -> LimonkaResult<Tmd> {
        if bytes.len() < 4 {
            return Err(LimonkaError::SliceTooSmall);
        }
        let sig_type =
            SignatureType::from_u32(u32::from_be_bytes(bytes[0..4].try_into().unwrap()))?;
        let body_offset = sig_type.prefix_len();

        let body_end = body_offset + mem::size_of::<TmdBody>();
        let infos_end = body_end + CONTENT_INFO_COUNT * mem::size_of::<ContentInfo>();
        if bytes.len() < infos_end {
            return Err(LimonkaError::SliceTooSmall);
        }

        let body = TmdBody::from_bytes(&bytes[body_offset..body_end])?.clone();

        let mut content_infos = Vec::with_capacity(CONTENT_INFO_COUNT);
        for raw in bytes[body_end..infos_end].chunks_exact(mem::size_of::<ContentInfo>()) {
            content_infos.push(*ContentInfo::cast(raw));
        }

        let count = body.content_count() as usize;
        let chunks_end = infos_end + count * mem::size_of::<ContentChunk>();
        if bytes.len() < chunks_end {
            return Err(LimonkaError::SliceTooSmall);
        }
        let mut chunks = Vec::with_capacity(count);
        for raw in bytes[infos_end..chunks_end].chunks_exact(mem::size_of::<ContentChunk>()) {
            chunks.push(*ContentChunk::cast(raw));
        }

        Ok(Tmd {
            sig_type,
            signature: bytes[4..body_offset].to_vec(),
            body,
            content_infos,
            chunks,
        })
    }

    /// Re-serialises the TMD.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.sig_type.prefix_len()
                + mem::size_of::<TmdBody>()
                + CONTENT_INFO_COUNT * mem::size_of::<ContentInfo>()
                + self.chunks.len() * mem::size_of::<ContentChunk>(),
        );
        out.extend_from_slice(&self.sig_type.to_u32().to_be_bytes());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(self.body.as_bytes());
        for info in &self.content_infos {
            out.extend_from_slice(info.as_bytes());
        }
        for chunk in &self.chunks {
            out.extend_from_slice(chunk.as_bytes());
        }
        out
    }

    #[must_use]
    pub fn sig_type(&self) -> SignatureType {
        self.sig_type
    }
    #[must_use]
    pub fn body(&self) -> &TmdBody {
        &self.body
    }
    #[must_use]
    pub fn content_infos(&self) -> &[ContentInfo] {
        &self.content_infos
    }
    #[must_use]
    pub fn chunk_records(&self) -> &[ContentChunk] {
        &self.chunks
    }
    pub fn title_id(&self) -> LimonkaResult<TitleId> {
        self.body.titleid()
    }
}

impl FromBytes for ContentInfo {
    fn min_size() -> usize {
        mem::size_of::<ContentInfo>()
    }
    fn bytes_ok(_: &[u8]) -> LimonkaResult<()> {
        Ok(())
    }
    fn cast(bytes: &[u8]) -> &Self {
        unsafe { &*(bytes.as_ptr() as *const Self) }
    }
}

impl FromBytes for ContentChunk {
    fn min_size() -> usize {
        mem::size_of::<ContentChunk>()
    }
    fn bytes_ok(_: &[u8]) -> LimonkaResult<()> {
        Ok(())
    }
    fn cast(bytes: &[u8]) -> &Self {
        unsafe { &*(bytes.as_ptr() as *const Self) }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a plausible one-content TMD for tests around the crate.
    pub(crate) fn build_tmd(title_id: u64, content_size: u64, encrypted: bool) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0x10004u32.to_be_bytes());
        out.extend_from_slice(&[0x11; 0x100]); // signature
        out.extend_from_slice(&[0; 0x3C]); // padding
        let mut body = vec![0u8; 0xC4];
        body[..0x1A].copy_from_slice(b"Root-CA00000003-CP0000000b");
        body[0x40] = 1; // version
        body[0x4C..0x54].copy_from_slice(&title_id.to_be_bytes());
        body[0x9C..0x9E].copy_from_slice(&1u16.to_be_bytes()); // title version
        body[0x9E..0xA0].copy_from_slice(&1u16.to_be_bytes()); // content count
        out.extend_from_slice(&body);
        let mut infos = vec![0u8; 64 * 0x24];
        infos[2..4].copy_from_slice(&1u16.to_be_bytes()); // command count
        out.extend_from_slice(&infos);
        // one chunk record
        out.extend_from_slice(&0u32.to_be_bytes()); // id
        out.extend_from_slice(&0u16.to_be_bytes()); // index
        out.extend_from_slice(&(if encrypted { 1u16 } else { 0 }).to_be_bytes());
        out.extend_from_slice(&content_size.to_be_bytes());
        out.extend_from_slice(&[0x22; 0x20]); // hash
        out
    }

    #[test]
    fn parse_and_round_trip() {
        let raw = build_tmd(0x000400000bcfff00, 0x200, true);
        let tmd = Tmd::from_bytes(&raw).unwrap();
        assert_eq!(tmd.sig_type(), SignatureType::Rsa2048Sha256);
        assert_eq!(tmd.body().content_count(), 1);
        assert_eq!(tmd.title_id().unwrap().to_u64(), 0x000400000bcfff00);
        let chunk = &tmd.chunk_records()[0];
        assert_eq!(chunk.size(), 0x200);
        assert!(chunk.content_type().contains(ContentType::ENCRYPTED));
        assert_eq!(chunk.id_hex(), "00000000");

        assert_eq!(tmd.to_bytes(), raw);
    }

    #[test]
    fn body_issuer_survives() {
        let raw = build_tmd(0x0004000000055D00, 0, false);
        let tmd = Tmd::from_bytes(&raw).unwrap();
        assert_eq!(tmd.body().issuer().trimmed(), "Root-CA00000003-CP0000000b");
    }

    #[test]
    fn rejects_unknown_signature_type() {
        let mut raw = build_tmd(0x0004000000055D00, 0, false);
        raw[0..4].copy_from_slice(&0x20000u32.to_be_bytes());
        match Tmd::from_bytes(&raw) {
            Err(LimonkaError::InvalidSignatureType(0x20000)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn truncated_chunks_are_rejected() {
        let raw = build_tmd(0x0004000000055D00, 0, false);
        match Tmd::from_bytes(&raw[..raw.len() - 1]) {
            Err(LimonkaError::SliceTooSmall) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
