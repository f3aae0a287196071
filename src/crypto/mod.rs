//! Software model of the 3DS AES engine: the keyslot bank, the key
//! scrambler, cipher factories, and streaming cipher views.
//!
//! Keyslots 0x00-0x03 are TWL (DSi) slots: their KeyX/KeyY are interpreted
//! as little-endian 128-bit integers and the CTR mode reverses each
//! 16-byte block around the AES core, matching the hardware. Slots above
//! 0x3F do not exist on a console and are used by this crate for derived
//! keys (decrypted title keys, the fixed zero/system keys, the seeded NCCH
//! key, ...).

pub mod cipherio;
pub mod seeddb;

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use aes::cipher::{
    generic_array::GenericArray, BlockDecrypt, BlockEncrypt, BlockDecryptMut, BlockEncryptMut,
    KeyInit, KeyIvInit, StreamCipher,
};
use aes::Aes128;
use cmac::Cmac;
use hex_literal::hex;
use log::debug;

use crate::fileio::FileLike;
use crate::hash::{sha256, sha256_2};
use crate::{LimonkaError, LimonkaResult};

pub use cipherio::{CbcIo, CtrIo};
pub use seeddb::{add_seed, get_seed, load_seeddb, save_seeddb, SeedDb};

type Aes128CtrBe = ctr::Ctr128BE<Aes128>;
type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// SHA-256 of the protected region of the ARM9 BootROM.
const BOOT9_PROT_HASH: [u8; 32] =
    hex!("7331f7edece3dd33f2ab4bd0b3a5d607229fd19212c10b734cedcaf78c1a7b98");

/// First four bytes of a decrypted OTP region.
const OTP_MAGIC: [u8; 4] = hex!("0fb0adde");

const DEV_COMMON_KEY_0: [u8; 16] = hex!("55A3F872BDC80C555A654381139E153B");

/// Constant used by the CTR key scrambler.
const SCRAMBLER_CTR: u128 = 0x1FF9E9AAC5FE0408024591DC5D52768A;
/// Constant used by the TWL key scrambler.
const SCRAMBLER_TWL: u128 = 0xFFFEFB4E295902582A680F5F1A4F3E79;

const FIXED_SYSTEM_KEY: [u8; 16] = hex!("527CE630A9CA305F3696F3CDE954194B");

/// Common KeyYs for keyslot 0x3D, used to decrypt title keys.
const COMMON_KEY_Y: [u128; 6] = [
    // eShop
    0xD07B337F9CA4385932A2E25723232EB9,
    // System
    0x0C767230F0998F1C46828202FAACBE4C,
    0xC475CB3AB8C788BB575E12A10907B8A4,
    0xE486EEE3D0C09C902F6686D4C06F649F,
    0xED31BA9C04B067506C4497A35B7804FC,
    0x5E66998AB4E8931606850FD7A16DD755,
];

/// Built-in KeyXs for the extra NCCH keyslots, (retail, dev).
const BASE_KEY_X: [(u8, u128, u128); 3] = [
    // New3DS 9.3 NCCH
    (
        0x18,
        0x82E9C9BEBFB8BDB875ECC0A07D474374,
        0x304BF1468372EE64115EBD4093D84276,
    ),
    // New3DS 9.6 NCCH
    (
        0x1B,
        0x45AD04953992C7C893724A9A7BCE6182,
        0x6C8B2944A0726035F941DFC018524FB6,
    ),
    // 7x NCCH
    (
        0x25,
        0xCEE7D8AB30C00DAE850EF5E382AC5AF3,
        0x81907A4B6F1B47323A677974CE4AD71B,
    ),
];

/// AES engine keyslots. Values above 0x3F do not exist on hardware and are
/// reserved by this crate for derived keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Keyslot {
    /// Entire TWL region, including twln, twlp, and the header.
    TwlNand = 0x03,
    /// CTRNAND for the original Nintendo 3DS.
    CtrNandOld = 0x04,
    /// CTRNAND for the New Nintendo 3DS.
    CtrNandNew = 0x05,
    /// FIRM partitions.
    Firm = 0x06,
    /// AGBSAVE partition.
    Agb = 0x07,
    /// CMAC for NAND databases.
    CmacNandDb = 0x0B,
    /// Keyslot for the secret key sector (0x96).
    KeySector = 0x11,
    /// NCCH extra keyslot for New 3DS exclusives after 9.3.
    Ncch93 = 0x18,
    /// NCCH extra keyslot for New 3DS exclusives after 9.6.
    Ncch96 = 0x1B,
    /// CMAC for the AGBSAVE contents.
    CmacAgb = 0x24,
    /// NCCH extra keyslot for titles after 7.0.
    Ncch70 = 0x25,
    /// NCCH original keyslot.
    Ncch = 0x2C,
    /// Save key for retail games after 6.0.
    Save60 = 0x2F,
    CmacSdNand = 0x30,
    /// SD card contents under "Nintendo 3DS".
    Sd = 0x34,
    /// SpotPass content.
    Boss = 0x38,
    /// DSiWare exports on the SD card.
    DsiWareExport = 0x3A,
    /// Title keys in tickets.
    CommonKey = 0x3D,
    /// Internal ARM9 BootROM operations, including OTP decryption.
    Boot9Internal = 0x3F,
    /// Decrypted title key for CIA and CDN contents.
    DecryptedTitlekey = 0x40,
    /// All-zero key for NCCH containers with fixed crypto.
    ZeroKey = 0x41,
    /// Fixed key for system NCCH containers with fixed crypto.
    FixedSystemKey = 0x42,
    /// Key sector decryption for the New Nintendo 3DS.
    New3dsKeySector = 0x43,
    /// Holds the (possibly seeded) KeyY of the extra NCCH keyslot.
    NcchExtra = 0x44,
}

impl From<Keyslot> for u8 {
    fn from(slot: Keyslot) -> u8 {
        slot as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    X,
    Y,
    Normal,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::X => f.write_str("X"),
            Self::Y => f.write_str("Y"),
            Self::Normal => f.write_str("normal"),
        }
    }
}

/// Rotate a 128-bit value left.
pub const fn rol128(val: u128, shift: u32) -> u128 {
    let shift = shift % 128;
    if shift == 0 {
        return val;
    }
    (val << shift) | (val >> (128 - shift))
}

/// Directories searched for boot9.bin / seeddb.bin.
pub(crate) fn config_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(home) = dirs::home_dir() {
        dirs.push(home.join(".3ds"));
        dirs.push(home.join("3ds"));
    }
    if cfg!(any(target_os = "windows", target_os = "macos")) {
        if let Some(cfg) = dirs::config_dir() {
            dirs.push(cfg.join("3ds"));
        }
    }
    dirs
}

/// Streaming AES-CTR cipher; encryption and decryption are the same
/// operation. For TWL keyslots each 16-byte block is byte-reversed before
/// and after the AES core.
pub struct CtrCipher {
    inner: Aes128CtrBe,
    twl: bool,
}

impl std::fmt::Debug for CtrCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CtrCipher")
            .field("twl", &self.twl)
            .finish()
    }
}

impl CtrCipher {
    fn new(key: &[u8; 16], ctr: u128, twl: bool) -> Self {
        let iv = ctr.to_be_bytes();
        Self {
            inner: Aes128CtrBe::new(key.into(), (&iv).into()),
            twl,
        }
    }

    /// Applies the keystream in place. TWL mode operates on whole 16-byte
    /// blocks; callers are responsible for block alignment there.
    pub fn apply(&mut self, data: &mut [u8]) {
        if self.twl {
            for block in data.chunks_mut(0x10) {
                block.reverse();
            }
            self.inner.apply_keystream(data);
            for block in data.chunks_mut(0x10) {
                block.reverse();
            }
        } else {
            self.inner.apply_keystream(data);
        }
    }
}

/// Streaming AES-CBC cipher; the IV advances to the last ciphertext block
/// after each call, so consecutive calls continue the chain.
pub struct CbcCipher {
    key: [u8; 16],
    iv: [u8; 16],
}

impl CbcCipher {
    fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    /// Encrypts whole blocks in place. Trailing partial blocks are left
    /// untouched.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        let full = data.len() - data.len() % 16;
        let mut enc = Aes128CbcEnc::new((&self.key).into(), (&self.iv).into());
        for block in data[..full].chunks_exact_mut(16) {
            enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        if full >= 16 {
            self.iv.copy_from_slice(&data[full - 16..full]);
        }
    }

    /// Decrypts whole blocks in place. Trailing partial blocks are left
    /// untouched.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        let full = data.len() - data.len() % 16;
        let mut next_iv = self.iv;
        if full >= 16 {
            next_iv.copy_from_slice(&data[full - 16..full]);
        }
        let mut dec = Aes128CbcDec::new((&self.key).into(), (&self.iv).into());
        for block in data[..full].chunks_exact_mut(16) {
            dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        self.iv = next_iv;
    }
}

/// AES-ECB cipher over whole 16-byte blocks.
pub struct EcbCipher {
    aes: Aes128,
}

impl EcbCipher {
    fn new(key: &[u8; 16]) -> Self {
        Self {
            aes: Aes128::new(key.into()),
        }
    }

    pub fn encrypt(&self, data: &mut [u8]) {
        for block in data.chunks_exact_mut(16) {
            self.aes.encrypt_block(GenericArray::from_mut_slice(block));
        }
    }

    pub fn decrypt(&self, data: &mut [u8]) {
        for block in data.chunks_exact_mut(16) {
            self.aes.decrypt_block(GenericArray::from_mut_slice(block));
        }
    }
}

/// Emulates the AES engine of the Nintendo 3DS, including keyslots and the
/// key scrambler.
///
/// KeyX and KeyY are stored as 128-bit integers: big-endian interpretations
/// for CTR slots, little-endian for the TWL slots 0x00-0x03 (callers
/// passing integers to those slots must pass little-endian 128-bit values).
#[derive(Clone, Default)]
pub struct CryptoEngine {
    key_x: HashMap<u8, u128>,
    key_y: HashMap<u8, u128>,
    key_normal: HashMap<u8, [u8; 16]>,

    dev: bool,
    b9_keys_set: bool,
    otp_keys_set: bool,

    otp_key: Option<[u8; 16]>,
    otp_iv: Option<[u8; 16]>,
    b9_extdata_otp: Option<Vec<u8>>,
    b9_extdata_keygen: Option<Vec<u8>>,

    otp_enc: Option<[u8; 0x100]>,
    otp_dec: Option<[u8; 0x100]>,
    otp_device_id: Option<u32>,

    id0: Option<[u8; 16]>,
}

impl CryptoEngine {
    /// Creates an engine with the built-in keys loaded. `dev` selects
    /// devunit constants.
    #[must_use]
    pub fn new(dev: bool) -> Self {
        let mut this = Self {
            dev,
            ..Self::default()
        };
        for &(slot, retail, devkey) in &BASE_KEY_X {
            this.key_x.insert(slot, if dev { devkey } else { retail });
        }
        // these fake slots hold constants, not console-unique material
        this.key_normal.insert(Keyslot::ZeroKey as u8, [0; 16]);
        this.key_normal
            .insert(Keyslot::FixedSystemKey as u8, FIXED_SYSTEM_KEY);
        this
    }

    /// Copies the KeyX of one slot into another; used to mirror an NCCH
    /// extra keyslot into the synthetic seeded slot.
    pub fn copy_keyslot_x(&mut self, from: u8, to: u8) -> LimonkaResult<()> {
        let x = *self
            .key_x
            .get(&from)
            .ok_or(LimonkaError::KeyslotMissing {
                slot: from,
                which: KeyType::X,
            })?;
        self.set_keyslot_int(KeyType::X, to, x);
        Ok(())
    }

    #[must_use]
    pub fn dev(&self) -> bool {
        self.dev
    }

    #[must_use]
    pub fn b9_keys_set(&self) -> bool {
        self.b9_keys_set
    }

    #[must_use]
    pub fn otp_keys_set(&self) -> bool {
        self.otp_keys_set
    }

    /// Device ID from a loaded OTP.
    pub fn otp_device_id(&self) -> LimonkaResult<u32> {
        self.otp_device_id.ok_or(LimonkaError::MissingOtp)
    }

    /// ID0 derived from the SD KeyY; requires a loaded movable.sed.
    pub fn id0(&self) -> LimonkaResult<[u8; 16]> {
        self.id0.ok_or(LimonkaError::MissingMovableSed)
    }

    fn key(&self, slot: u8) -> LimonkaResult<[u8; 16]> {
        self.key_normal
            .get(&slot)
            .copied()
            .ok_or(LimonkaError::KeyslotMissing {
                slot,
                which: KeyType::Normal,
            })
    }

    /// Sets a keyslot from an integer. TWL slots take little-endian values.
    pub fn set_keyslot_int(&mut self, which: KeyType, slot: u8, key: u128) {
        debug!("setting keyslot {slot:#04x} type {which} from int");
        match which {
            KeyType::X => {
                self.key_x.insert(slot, key);
            }
            KeyType::Y => {
                self.key_y.insert(slot, key);
            }
            KeyType::Normal => {
                self.key_normal.insert(slot, key.to_be_bytes());
                return;
            }
        }
        if let Ok(normal) = self.keygen(slot) {
            self.key_normal.insert(slot, normal);
        }
    }

    /// Sets a keyslot from raw bytes. The bytes are interpreted big-endian
    /// for CTR slots and little-endian for TWL slots 0x00-0x03.
    pub fn set_keyslot_bytes(&mut self, which: KeyType, slot: u8, key: [u8; 16]) {
        if which == KeyType::Normal {
            self.set_normal_key(slot, key);
            return;
        }
        let int = if slot > 0x03 {
            u128::from_be_bytes(key)
        } else {
            u128::from_le_bytes(key)
        };
        self.set_keyslot_int(which, slot, int);
    }

    /// Sets KeyX or KeyY without rederiving the normal key; call
    /// [`update_normal_keys`](Self::update_normal_keys) when done.
    pub fn set_keyslot_int_no_update(&mut self, which: KeyType, slot: u8, key: u128) {
        match which {
            KeyType::X => {
                self.key_x.insert(slot, key);
            }
            KeyType::Y => {
                self.key_y.insert(slot, key);
            }
            KeyType::Normal => {
                self.key_normal.insert(slot, key.to_be_bytes());
            }
        }
    }

    /// Sets the normal key of a slot directly, overriding any derivation.
    pub fn set_normal_key(&mut self, slot: u8, key: [u8; 16]) {
        debug!("setting keyslot {slot:#04x} normal key");
        self.key_normal.insert(slot, key);
    }

    /// Rederives the normal key of every slot that has both X and Y set.
    pub fn update_normal_keys(&mut self) {
        let slots: Vec<u8> = self
            .key_x
            .keys()
            .filter(|slot| self.key_y.contains_key(slot))
            .copied()
            .collect();
        for slot in slots {
            if let Ok(normal) = self.keygen(slot) {
                self.key_normal.insert(slot, normal);
            }
        }
    }

    /// Generates the normal key for a slot from its KeyX and KeyY.
    pub fn keygen(&self, slot: u8) -> LimonkaResult<[u8; 16]> {
        let x = *self
            .key_x
            .get(&slot)
            .ok_or(LimonkaError::KeyslotMissing {
                slot,
                which: KeyType::X,
            })?;
        let y = *self
            .key_y
            .get(&slot)
            .ok_or(LimonkaError::KeyslotMissing {
                slot,
                which: KeyType::Y,
            })?;
        Ok(if slot < 0x04 {
            keygen_twl_manual(x, y)
        } else {
            keygen_manual(x, y)
        })
    }

    /// Creates an AES-CTR cipher for a keyslot. TWL slots get the
    /// block-reversing variant.
    pub fn create_ctr_cipher(&self, slot: u8, ctr: u128) -> LimonkaResult<CtrCipher> {
        Ok(CtrCipher::new(&self.key(slot)?, ctr, slot < 0x04))
    }

    /// Creates an AES-CBC cipher for a keyslot.
    pub fn create_cbc_cipher(&self, slot: u8, iv: [u8; 16]) -> LimonkaResult<CbcCipher> {
        Ok(CbcCipher::new(self.key(slot)?, iv))
    }

    /// Creates an AES-ECB cipher for a keyslot.
    pub fn create_ecb_cipher(&self, slot: u8) -> LimonkaResult<EcbCipher> {
        Ok(EcbCipher::new(&self.key(slot)?))
    }

    /// Creates an AES-CMAC object for a keyslot.
    pub fn create_cmac_object(&self, slot: u8) -> LimonkaResult<Cmac<Aes128>> {
        let key = self.key(slot)?;
        Ok(<Cmac<Aes128> as cmac::Mac>::new_from_slice(&key).expect("cmac accepts 16-byte keys"))
    }

    /// Wraps a stream in an on-the-fly AES-CTR view.
    pub fn create_ctr_io(
        &self,
        slot: u8,
        base: Box<dyn FileLike>,
        ctr: u128,
    ) -> LimonkaResult<CtrIo> {
        Ok(CtrIo::new(base, self.key(slot)?, ctr, slot < 0x04))
    }

    /// Wraps a stream in an on-the-fly AES-CBC view.
    pub fn create_cbc_io(
        &self,
        slot: u8,
        base: Box<dyn FileLike>,
        iv: [u8; 16],
    ) -> LimonkaResult<CbcIo> {
        Ok(CbcIo::new(base, self.key(slot)?, iv))
    }

    /// Decrypts a title key and stores it in keyslot 0x40.
    pub fn load_encrypted_titlekey(
        &mut self,
        titlekey: [u8; 16],
        common_key_index: u8,
        title_id: [u8; 8],
    ) -> LimonkaResult<()> {
        if common_key_index as usize >= COMMON_KEY_Y.len() {
            return Err(LimonkaError::EnumValueOutOfRange("common key index"));
        }
        if self.dev && common_key_index == 0 {
            self.set_normal_key(Keyslot::CommonKey as u8, DEV_COMMON_KEY_0);
        } else {
            self.set_keyslot_int(
                KeyType::Y,
                Keyslot::CommonKey as u8,
                COMMON_KEY_Y[common_key_index as usize],
            );
        }

        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&title_id);
        let mut key = titlekey;
        self.create_cbc_cipher(Keyslot::CommonKey as u8, iv)?
            .decrypt(&mut key);
        self.set_normal_key(Keyslot::DecryptedTitlekey as u8, key);
        Ok(())
    }

    /// Loads the title key from a raw ticket and stores it in slot 0x40.
    pub fn load_from_ticket(&mut self, ticket: &[u8]) -> LimonkaResult<()> {
        if ticket.len() < 0x2AC {
            return Err(LimonkaError::InvalidHeader {
                container: "ticket",
                offset: ticket.len() as u64,
            });
        }
        let titlekey: [u8; 16] = ticket[0x1BF..0x1CF].try_into().unwrap();
        let title_id: [u8; 8] = ticket[0x1DC..0x1E4].try_into().unwrap();
        let common_key_index = ticket[0x1F1];
        self.load_encrypted_titlekey(titlekey, common_key_index, title_id)
    }

    fn set_fixed_keys(&mut self) {
        self.set_keyslot_int(
            KeyType::Y,
            Keyslot::TwlNand as u8,
            0xE1A00005202DDD1DBD4DC4D30AB9DC76,
        );
        self.set_keyslot_int(
            KeyType::Y,
            Keyslot::CtrNandNew as u8,
            0x4D804F4E9990194613A204AC584460BE,
        );
        self.set_normal_key(Keyslot::ZeroKey as u8, [0; 16]);
        self.set_normal_key(Keyslot::FixedSystemKey as u8, FIXED_SYSTEM_KEY);
    }

    /// Ingests fixed keys from an ARM9 BootROM dump. Accepts the full
    /// 0x10000 image or the bare 0x8000 protected half.
    pub fn setup_keys_from_boot9(&mut self, b9: &[u8]) -> LimonkaResult<()> {
        if self.b9_keys_set {
            return Ok(());
        }

        let prot: &[u8] = match b9.len() {
            0x10000 => &b9[0x8000..],
            0x8000 => b9,
            _ => return Err(LimonkaError::InvalidBoot9("wrong length")),
        };

        if sha256(prot) != BOOT9_PROT_HASH {
            return Err(LimonkaError::InvalidBoot9("hash mismatch"));
        }

        let mut keyblob_offset = 0x5860;
        let mut otp_key_offset = 0x56E0;
        if self.dev {
            keyblob_offset += 0x400;
            otp_key_offset += 0x20;
        }

        self.otp_key = Some(prot[otp_key_offset..otp_key_offset + 0x10].try_into().unwrap());
        self.otp_iv = Some(
            prot[otp_key_offset + 0x10..otp_key_offset + 0x20]
                .try_into()
                .unwrap(),
        );

        let keyblob = &prot[keyblob_offset..keyblob_offset + 0x400];
        self.b9_extdata_keygen = Some(keyblob[0..0x200].to_vec());
        self.b9_extdata_otp = Some(keyblob[0..0x24].to_vec());

        // the key area starts at 0x170 within the keyblob; keys repeat for
        // four consecutive slots unless the area stores one per slot
        let mut pos = 0x170;
        let take = |pos: &mut usize| -> [u8; 16] {
            let key: [u8; 16] = keyblob[*pos..*pos + 16].try_into().unwrap();
            *pos += 16;
            key
        };

        let key_x_same = |this: &mut Self, pos: &mut usize, slot: u8| {
            let key = u128::from_be_bytes(take(pos));
            for i in 0..4 {
                this.key_x.insert(slot + i, key);
            }
        };
        let key_x_inc = |this: &mut Self, pos: &mut usize, slot: u8| {
            for i in 0..4 {
                let key = u128::from_be_bytes(take(pos));
                this.key_x.insert(slot + i, key);
            }
        };

        key_x_same(self, &mut pos, 0x2C);
        key_x_same(self, &mut pos, 0x30);
        key_x_same(self, &mut pos, 0x34);
        key_x_same(self, &mut pos, 0x38);
        key_x_inc(self, &mut pos, 0x3C);

        for slot in 0x04..0x0C {
            let key = u128::from_be_bytes(take(&mut pos));
            self.key_y.insert(slot, key);
        }

        let normal_same = |this: &mut Self, pos: &mut usize, slot: u8| {
            let key = take(pos);
            for i in 0..4 {
                this.key_normal.insert(slot + i, key);
            }
        };
        let normal_inc = |this: &mut Self, pos: &mut usize, slot: u8| {
            for i in 0..4 {
                let key = take(pos);
                this.key_normal.insert(slot + i, key);
            }
        };

        normal_same(self, &mut pos, 0x0C);
        normal_same(self, &mut pos, 0x10);
        normal_inc(self, &mut pos, 0x14);
        normal_same(self, &mut pos, 0x18);
        normal_same(self, &mut pos, 0x1C);
        normal_same(self, &mut pos, 0x20);
        normal_same(self, &mut pos, 0x24);
        pos -= 16;
        normal_inc(self, &mut pos, 0x28);
        normal_same(self, &mut pos, 0x2C);
        normal_same(self, &mut pos, 0x30);
        normal_same(self, &mut pos, 0x34);
        normal_same(self, &mut pos, 0x38);
        pos -= 16;
        normal_inc(self, &mut pos, 0x3C);

        self.set_fixed_keys();
        self.update_normal_keys();
        self.b9_keys_set = true;
        Ok(())
    }

    /// Loads boot9 from the given path, or searches `BOOT9_PATH` and the
    /// config directories.
    pub fn setup_keys_from_boot9_file(&mut self, path: Option<&Path>) -> LimonkaResult<()> {
        if self.b9_keys_set {
            return Ok(());
        }
        let mut paths: Vec<PathBuf> = Vec::new();
        match path {
            Some(p) => paths.push(p.to_owned()),
            None => {
                if let Ok(env_path) = env::var("BOOT9_PATH") {
                    paths.push(env_path.into());
                }
                for dir in config_dirs() {
                    paths.push(dir.join("boot9.bin"));
                    paths.push(dir.join("boot9_prot.bin"));
                }
            }
        }
        for p in &paths {
            if let Ok(data) = fs::read(p) {
                if matches!(data.len(), 0x8000 | 0x10000) {
                    return self.setup_keys_from_boot9(&data);
                }
            }
        }
        Err(LimonkaError::InvalidBoot9("no usable boot9 found"))
    }

    /// Sets up console-unique keys from an OTP dump. Encrypted and
    /// decrypted dumps are both accepted; boot9 keys must be loaded first.
    pub fn setup_keys_from_otp(&mut self, otp: &[u8]) -> LimonkaResult<()> {
        if !self.b9_keys_set {
            return Err(LimonkaError::MissingOtp);
        }
        let otp: &[u8; 0x100] = otp
            .try_into()
            .map_err(|_| LimonkaError::InvalidOtp("wrong length"))?;

        let otp_key = self.otp_key.unwrap();
        let otp_iv = self.otp_iv.unwrap();

        let (otp_enc, otp_dec): ([u8; 0x100], [u8; 0x100]) = if otp[0..4] == OTP_MAGIC {
            let mut enc = *otp;
            CbcCipher::new(otp_key, otp_iv).encrypt(&mut enc);
            (enc, *otp)
        } else {
            let mut dec = *otp;
            CbcCipher::new(otp_key, otp_iv).decrypt(&mut dec);
            (*otp, dec)
        };

        if otp_dec[0..4] != OTP_MAGIC {
            return Err(LimonkaError::InvalidOtp("magic not found"));
        }
        if sha256(&otp_dec[0..0xE0]) != otp_dec[0xE0..0x100] {
            return Err(LimonkaError::InvalidOtp("body hash mismatch"));
        }

        self.otp_device_id = Some(u32::from_le_bytes(otp_dec[4..8].try_into().unwrap()));

        let keysect_hash = sha256(&otp_enc[0..0x90]);
        self.set_keyslot_bytes(
            KeyType::X,
            Keyslot::New3dsKeySector as u8,
            keysect_hash[0..0x10].try_into().unwrap(),
        );
        self.set_keyslot_bytes(
            KeyType::Y,
            Keyslot::New3dsKeySector as u8,
            keysect_hash[0x10..0x20].try_into().unwrap(),
        );

        // TWL NAND KeyX is built from the TWL console id
        let mut twl_cid_lo = u32::from_le_bytes(otp_dec[0x08..0x0C].try_into().unwrap());
        let mut twl_cid_hi = u32::from_le_bytes(otp_dec[0x0C..0x10].try_into().unwrap());
        twl_cid_lo ^= 0xB358A6AF;
        twl_cid_lo |= 0x80000000;
        twl_cid_hi ^= 0x08C267B7;
        let mut twl_key_x = [0u8; 16];
        twl_key_x[0..4].copy_from_slice(&twl_cid_lo.to_le_bytes());
        twl_key_x[4..12].copy_from_slice(b"NINTENDO");
        twl_key_x[12..16].copy_from_slice(&twl_cid_hi.to_le_bytes());
        self.set_keyslot_bytes(KeyType::X, Keyslot::TwlNand as u8, twl_key_x);

        let b9_extdata_otp = self.b9_extdata_otp.clone().unwrap();
        let b9_extdata_keygen = self.b9_extdata_keygen.clone().unwrap();

        let console_key_xy = sha256_2(&otp_dec[0x90..0xAC], &b9_extdata_otp);
        self.set_keyslot_bytes(
            KeyType::X,
            Keyslot::Boot9Internal as u8,
            console_key_xy[0..0x10].try_into().unwrap(),
        );
        self.set_keyslot_bytes(
            KeyType::Y,
            Keyslot::Boot9Internal as u8,
            console_key_xy[0x10..0x20].try_into().unwrap(),
        );

        // console-unique KeyX chain, generated by CBC-encrypting windows of
        // the boot9 keygen extdata under the 0x3F key
        let mut extdata_off = 0usize;
        let mut gen = |this: &mut Self, n: usize| -> LimonkaResult<[u8; 64]> {
            extdata_off += 36;
            let iv: [u8; 16] = b9_extdata_keygen[extdata_off..extdata_off + 16]
                .try_into()
                .unwrap();
            extdata_off += 16;
            let mut data: [u8; 64] = b9_extdata_keygen[extdata_off..extdata_off + 64]
                .try_into()
                .unwrap();
            this.create_cbc_cipher(Keyslot::Boot9Internal as u8, iv)?
                .encrypt(&mut data);
            extdata_off += n;
            Ok(data)
        };

        let a = gen(self, 64)?;
        for slot in 0x04..0x08 {
            self.set_keyslot_bytes(KeyType::X, slot, a[0..16].try_into().unwrap());
        }
        for slot in 0x08..0x0C {
            self.set_keyslot_bytes(KeyType::X, slot, a[16..32].try_into().unwrap());
        }
        for slot in 0x0C..0x10 {
            self.set_keyslot_bytes(KeyType::X, slot, a[32..48].try_into().unwrap());
        }
        self.set_keyslot_bytes(KeyType::X, 0x10, a[48..64].try_into().unwrap());

        let b = gen(self, 16)?;
        for (i, slot) in (0x14..0x18).enumerate() {
            self.set_keyslot_bytes(KeyType::X, slot, b[i * 16..i * 16 + 16].try_into().unwrap());
        }

        let c = gen(self, 64)?;
        for slot in 0x18..0x1C {
            self.set_keyslot_bytes(KeyType::X, slot, c[0..16].try_into().unwrap());
        }
        for slot in 0x1C..0x20 {
            self.set_keyslot_bytes(KeyType::X, slot, c[16..32].try_into().unwrap());
        }
        for slot in 0x20..0x24 {
            self.set_keyslot_bytes(KeyType::X, slot, c[32..48].try_into().unwrap());
        }
        self.set_keyslot_bytes(KeyType::X, Keyslot::CmacAgb as u8, c[48..64].try_into().unwrap());

        let d = gen(self, 16)?;
        for (i, slot) in (0x28..0x2C).enumerate() {
            self.set_keyslot_bytes(KeyType::X, slot, d[i * 16..i * 16 + 16].try_into().unwrap());
        }

        self.otp_enc = Some(otp_enc);
        self.otp_dec = Some(otp_dec);
        self.otp_keys_set = true;
        Ok(())
    }

    /// Sets up the SD key from movable.sed contents: either the bare
    /// 16-byte KeyY, or a full 0x120/0x140 file with the KeyY at 0x110.
    pub fn setup_sd_key(&mut self, data: &[u8]) -> LimonkaResult<()> {
        let key: [u8; 16] = match data.len() {
            0x10 => data.try_into().unwrap(),
            0x120 | 0x140 => data[0x110..0x120].try_into().unwrap(),
            _ => {
                return Err(LimonkaError::InvalidHeader {
                    container: "movable.sed",
                    offset: data.len() as u64,
                })
            }
        };

        self.set_keyslot_bytes(KeyType::Y, Keyslot::Sd as u8, key);
        self.set_keyslot_bytes(KeyType::Y, Keyslot::CmacSdNand as u8, key);
        self.set_keyslot_bytes(KeyType::Y, Keyslot::DsiWareExport as u8, key);

        // ID0 is the key hash re-packed from LE words to BE words
        let key_hash = sha256(&key);
        let mut id0 = [0u8; 16];
        for (src, dst) in key_hash[..16].chunks_exact(4).zip(id0.chunks_exact_mut(4)) {
            let word = u32::from_le_bytes(src.try_into().unwrap());
            dst.copy_from_slice(&word.to_be_bytes());
        }
        self.id0 = Some(id0);
        Ok(())
    }

    /// Sets up the SD key from a movable.sed file.
    pub fn setup_sd_key_from_file(&mut self, path: &Path) -> LimonkaResult<()> {
        self.setup_sd_key(&fs::read(path)?)
    }

    /// Generates the AES-CTR IV for a file path relative to an SD ID1
    /// directory (e.g. `/title/00040000/0f70c600/content/00000000.app`).
    /// Windows-style separators and mixed case are accepted.
    #[must_use]
    pub fn sd_path_to_iv(path: &str) -> u128 {
        let mut path = path.to_lowercase().replace('\\', "/");

        // SD Save Data Backup copies the raw encrypted file out of the
        // title's data directory, so fake the original path
        if path.starts_with("/backup") && path.len() > 28 {
            let tid_upper = &path[12..20];
            let tid_lower = &path[20..28];
            path = format!("/title/{}/{}/data{}", tid_upper, tid_lower, &path[28..]);
        }

        let mut encoded: Vec<u8> = Vec::with_capacity(path.len() * 2 + 2);
        for unit in path.encode_utf16() {
            encoded.extend_from_slice(&unit.to_le_bytes());
        }
        encoded.extend_from_slice(&[0, 0]);

        let path_hash = sha256(&encoded);
        let p1 = u128::from_be_bytes(path_hash[0..16].try_into().unwrap());
        let p2 = u128::from_be_bytes(path_hash[16..32].try_into().unwrap());
        p1 ^ p2
    }
}

/// Generates a normal key using the 3DS key scrambler.
#[must_use]
pub fn keygen_manual(key_x: u128, key_y: u128) -> [u8; 16] {
    rol128(
        (rol128(key_x, 2) ^ key_y).wrapping_add(SCRAMBLER_CTR),
        87,
    )
    .to_be_bytes()
}

/// Generates a normal key using the DSi key scrambler.
#[must_use]
pub fn keygen_twl_manual(key_x: u128, key_y: u128) -> [u8; 16] {
    rol128((key_x ^ key_y).wrapping_add(SCRAMBLER_TWL), 42).to_be_bytes()
}
