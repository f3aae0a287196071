//! Tickets: the signed structure carrying the encrypted title key.

use crate::crypto::CryptoEngine;
use crate::titleid::{MaybeTitleIdBe, TitleId};
use crate::tmd::SignatureType;
use crate::{LimonkaError, LimonkaResult};

/// Minimum length of a usable ticket.
pub const MIN_TICKET_SIZE: usize = 0x2AC;

/// A parsed ticket. Only the fields the crate needs are decoded; the raw
/// body is kept for re-serialisation.
#[derive(Debug, Clone)]
pub struct Ticket {
    sig_type: SignatureType,
    signature: Vec<u8>,
    body: Vec<u8>,
}

// offsets within the ticket body (after issuer start)
const TITLE_KEY: usize = 0x7F;
const TICKET_ID: usize = 0x90;
const CONSOLE_ID: usize = 0x98;
const TITLE_ID: usize = 0x9C;
const LICENSE_TYPE: usize = 0xB0;
const COMMON_KEY_INDEX: usize = 0xB1;

impl Ticket {
    pub fn from_bytes(bytes: &[u8]) -> LimonkaResult<Ticket> {
        if bytes.len() < MIN_TICKET_SIZE {
            return Err(LimonkaError::InvalidHeader {
                container: "ticket",
                offset: bytes.len() as u64,
            });
        }
        let sig_type =
            SignatureType::from_u32(u32::from_be_bytes(bytes[0..4].try_into().unwrap()))?;
        let body_offset = sig_type.prefix_len();
        if bytes.len() < body_offset + COMMON_KEY_INDEX + 1 {
            return Err(LimonkaError::SliceTooSmall);
        }
        Ok(Ticket {
            sig_type,
            signature: bytes[4..body_offset].to_vec(),
            body: bytes[body_offset..].to_vec(),
        })
    }

    #[must_use]
    pub fn sig_type(&self) -> SignatureType {
        self.sig_type
    }

    /// The title key, still encrypted under the common key.
    #[must_use]
    pub fn title_key_raw(&self) -> [u8; 16] {
        self.body[TITLE_KEY..TITLE_KEY + 16].try_into().unwrap()
    }

    /// Decrypts the title key through the engine's common-key slot.
    pub fn title_key(&self, engine: &mut CryptoEngine) -> LimonkaResult<[u8; 16]> {
        engine.load_encrypted_titlekey(
            self.title_key_raw(),
            self.common_key_index(),
            self.title_id_be().to_bytes(),
        )?;
        // the decrypted key now lives in the title-key slot; decrypt a copy
        // here as well for the caller
        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&self.title_id_be().to_bytes());
        let mut key = self.title_key_raw();
        engine
            .create_cbc_cipher(crate::crypto::Keyslot::CommonKey as u8, iv)?
            .decrypt(&mut key);
        Ok(key)
    }

    #[must_use]
    pub fn title_id_be(&self) -> MaybeTitleIdBe {
        let raw: [u8; 8] = self.body[TITLE_ID..TITLE_ID + 8].try_into().unwrap();
        raw.into()
    }

    pub fn title_id(&self) -> LimonkaResult<TitleId> {
        self.title_id_be().to_titleid()
    }

    #[must_use]
    pub fn ticket_id(&self) -> u64 {
        u64::from_be_bytes(self.body[TICKET_ID..TICKET_ID + 8].try_into().unwrap())
    }

    #[must_use]
    pub fn console_id(&self) -> u32 {
        u32::from_be_bytes(self.body[CONSOLE_ID..CONSOLE_ID + 4].try_into().unwrap())
    }

    #[must_use]
    pub fn license_type(&self) -> u8 {
        self.body[LICENSE_TYPE]
    }

    #[must_use]
    pub fn common_key_index(&self) -> u8 {
        self.body[COMMON_KEY_INDEX]
    }

    /// Re-serialises the ticket.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(4 + self.signature.len() + self.body.len());
        out.extend_from_slice(&self.sig_type.to_u32().to_be_bytes());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.body);
        out
    }
}
