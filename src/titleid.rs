use crate::{LimonkaError, LimonkaResult};
use bitflags::bitflags;

/// A possibly-invalid title id stored little-endian, as found in NCCH
/// headers and seed databases.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct MaybeTitleId {
    raw: [u8; 8],
}

impl MaybeTitleId {
    #[must_use]
    pub fn to_u64(self) -> u64 {
        u64::from_le_bytes(self.raw)
    }
    pub fn to_titleid(self) -> LimonkaResult<TitleId> {
        TitleId::from_u64(self.to_u64())
    }
}

/// A possibly-invalid title id stored big-endian, as found in TMDs and
/// tickets.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct MaybeTitleIdBe {
    raw: [u8; 8],
}

impl MaybeTitleIdBe {
    #[must_use]
    pub fn to_u64(self) -> u64 {
        u64::from_be_bytes(self.raw)
    }
    pub fn to_titleid(self) -> LimonkaResult<TitleId> {
        TitleId::from_u64(self.to_u64())
    }
    #[must_use]
    pub fn to_bytes(self) -> [u8; 8] {
        self.raw
    }
}

impl From<[u8; 8]> for MaybeTitleIdBe {
    fn from(raw: [u8; 8]) -> Self {
        Self { raw }
    }
}

/// A decoded title id: platform in the high 16 bits, category in the next
/// 16, unique id in the low 32.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TitleId {
    id: u32,
    category: Category,
    platform: Platform,
}

impl TitleId {
    pub fn from_u64(raw: u64) -> LimonkaResult<TitleId> {
        let platform = match (raw >> 48) as u16 {
            1 => Platform::Wii,
            3 => Platform::Dsi,
            4 => Platform::Ctr,
            5 => Platform::WiiU,
            _ => return Err(LimonkaError::EnumValueOutOfRange("titleid::Platform")),
        };
        Ok(TitleId {
            id: raw as u32,
            category: Category::from_bits_retain((raw >> 32) as u16),
            platform,
        })
    }
    #[must_use]
    pub fn to_u64(self) -> u64 {
        ((self.platform as u64) << 48) | ((self.category.bits() as u64) << 32) | self.id as u64
    }
    #[must_use]
    pub fn is_null(self) -> bool {
        self.to_u64() == 0
    }
    #[must_use]
    pub fn id(self) -> u32 {
        self.id
    }
    #[must_use]
    pub fn category(self) -> Category {
        self.category
    }
    #[must_use]
    pub fn platform(self) -> Platform {
        self.platform
    }
    /// Whether the title is a system title; such titles use the fixed
    /// system key instead of the zero key under fixed crypto.
    #[must_use]
    pub fn is_system(self) -> bool {
        self.category.contains(Category::SYSTEM)
    }
    /// Whether the title carries TWL (DSi) content; content 0 of such a
    /// title is an SRL, not an NCCH.
    #[must_use]
    pub fn is_twl(self) -> bool {
        self.category.contains(Category::TWL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Platform {
    Wii = 1,
    Dsi = 3,
    Ctr = 4,
    WiiU = 5,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Category: u16 {
        const NORMAL = 0x0;
        const DLP_CHILD = 0x1;
        const DEMO = 0x2;
        const CONTENTS = 0x3;
        const ADDON_CONTENTS = 0x4;
        const PATCH = 0x6;
        const CANNOT_EXECUTION = 0x8;
        const SYSTEM = 0x10;
        const REQUIRE_BATCH_UPDATE = 0x20;
        const NOT_REQUIRE_USER_APPROVAL = 0x40;
        const NOT_REQUIRE_RIGHT_FOR_MOUNT = 0x80;
        const CAN_SKIP_CONVERT_JUMP_ID = 0x100;
        const TWL = 0x8000;

        const _ = !0;
    }
}
