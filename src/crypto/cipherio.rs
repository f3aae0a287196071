//! File-like views that de/encrypt on the fly.
//!
//! Cipher state is recomputed from the absolute offset on every call, so
//! the views are freely seekable. Key material is resolved from the engine
//! when the view is created.

use std::io::{self, Read, Seek, SeekFrom, Write};

use super::CtrCipher;
use crate::fileio::FileLike;

/// Transparent read-write AES-CTR view over a base stream.
///
/// A read or write at absolute offset `o` starts the counter at
/// `ctr + o / 16` and discards `o % 16` bytes of keystream. For TWL
/// keyslots the data is padded out to 16-byte blocks around the cipher
/// call, since each block is byte-reversed as a whole.
pub struct CtrIo {
    base: Box<dyn FileLike>,
    key: [u8; 16],
    ctr: u128,
    twl: bool,
}

impl CtrIo {
    pub(super) fn new(base: Box<dyn FileLike>, key: [u8; 16], ctr: u128, twl: bool) -> Self {
        Self {
            base,
            key,
            ctr,
            twl,
        }
    }

    fn cipher_at(&self, offset: u64) -> CtrCipher {
        CtrCipher::new(&self.key, self.ctr.wrapping_add(offset as u128 >> 4), self.twl)
    }

    /// Applies keystream to `data` located at absolute offset `offset`,
    /// handling unaligned head and tail.
    fn apply_at(&self, offset: u64, data: &mut [u8]) {
        let before = (offset % 0x10) as usize;
        let mut cipher = self.cipher_at(offset);
        if before == 0 && (!self.twl || data.len() % 0x10 == 0) {
            cipher.apply(data);
        } else {
            let after = (0x10 - (before + data.len()) % 0x10) % 0x10;
            let mut padded = vec![0u8; before + data.len() + after];
            padded[before..before + data.len()].copy_from_slice(data);
            cipher.apply(&mut padded);
            data.copy_from_slice(&padded[before..before + data.len()]);
        }
    }
}

impl Read for CtrIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let offset = self.base.stream_position()?;
        let got = self.base.read(buf)?;
        self.apply_at(offset, &mut buf[..got]);
        Ok(got)
    }
}

impl Write for CtrIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let offset = self.base.stream_position()?;
        let mut data = buf.to_vec();
        self.apply_at(offset, &mut data);
        self.base.write(&data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.base.flush()
    }
}

impl Seek for CtrIo {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.base.seek(pos)
    }
}

/// Transparent AES-CBC view over a base stream.
///
/// Reads are seekable: the preceding ciphertext block is re-read to serve
/// as the IV. Writes must start block-aligned; a trailing partial block is
/// discarded.
pub struct CbcIo {
    base: Box<dyn FileLike>,
    key: [u8; 16],
    iv: [u8; 16],
}

impl CbcIo {
    pub(super) fn new(base: Box<dyn FileLike>, key: [u8; 16], iv: [u8; 16]) -> Self {
        Self { base, key, iv }
    }

    /// IV that applies to the block containing `aligned_offset`.
    fn iv_for(&mut self, aligned_offset: u64) -> io::Result<[u8; 16]> {
        if aligned_offset == 0 {
            return Ok(self.iv);
        }
        self.base.seek(SeekFrom::Start(aligned_offset - 0x10))?;
        let mut iv = [0u8; 16];
        self.base.read_exact(&mut iv)?;
        Ok(iv)
    }
}

impl Read for CbcIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let offset = self.base.stream_position()?;
        let before = (offset % 0x10) as usize;
        let aligned = offset - before as u64;

        let iv = self.iv_for(aligned)?;

        // read the partial head, the requested data, and up to a block of
        // tail padding so the decryption operates on whole blocks
        self.base.seek(SeekFrom::Start(aligned))?;
        let mut data = vec![0u8; before + buf.len()];
        let mut got = 0;
        while got < data.len() {
            let n = self.base.read(&mut data[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        let requested = got.saturating_sub(before);
        if requested == 0 {
            self.base.seek(SeekFrom::Start(offset))?;
            return Ok(0);
        }
        data.truncate(got);

        let tail = (0x10 - data.len() % 0x10) % 0x10;
        if tail != 0 {
            let mut extra = vec![0u8; tail];
            let extra_got = self.base.read(&mut extra)?;
            extra.truncate(extra_got);
            extra.resize(tail, 0);
            data.extend_from_slice(&extra);
        }

        let mut cipher = super::CbcCipher::new(self.key, iv);
        cipher.decrypt(&mut data);

        buf[..requested].copy_from_slice(&data[before..before + requested]);
        self.base.seek(SeekFrom::Start(offset + requested as u64))?;
        Ok(requested)
    }
}

impl Write for CbcIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let offset = self.base.stream_position()?;
        if offset % 0x10 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "CBC writes must start on a block boundary",
            ));
        }
        let full = buf.len() - buf.len() % 0x10;
        let iv = self.iv_for(offset)?;
        let mut data = buf[..full].to_vec();
        let mut cipher = super::CbcCipher::new(self.key, iv);
        cipher.encrypt(&mut data);
        self.base.seek(SeekFrom::Start(offset))?;
        self.base.write_all(&data)?;
        // a trailing partial block is discarded, but reported as consumed
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.base.flush()
    }
}

impl Seek for CbcIo {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.base.seek(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{CryptoEngine, KeyType};
    use std::io::{Cursor, Read, Seek, SeekFrom, Write};

    fn engine() -> CryptoEngine {
        let mut engine = CryptoEngine::new(false);
        engine.set_keyslot_int(KeyType::X, 0x2C, 0x1111);
        engine.set_keyslot_int(KeyType::Y, 0x2C, 0x2222);
        engine.set_normal_key(0x03, [3; 16]);
        engine
    }

    #[test]
    fn ctr_io_round_trip_and_random_access() {
        let engine = engine();
        let plain: Vec<u8> = (0..0x400u32).map(|i| i as u8).collect();

        let mut writer = engine
            .create_ctr_io(0x2C, Box::new(Cursor::new(vec![0u8; 0x400])), 5)
            .unwrap();
        writer.write_all(&plain).unwrap();

        let mut reader = engine
            .create_ctr_io(0x2C, writer.base, 5)
            .unwrap();
        reader.seek(SeekFrom::Start(0)).unwrap();
        let mut out = vec![0u8; 0x400];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(out, plain);

        // unaligned random access
        reader.seek(SeekFrom::Start(0x123)).unwrap();
        let mut chunk = [0u8; 0x21];
        reader.read_exact(&mut chunk).unwrap();
        assert_eq!(&chunk[..], &plain[0x123..0x144]);
    }

    #[test]
    fn twl_ctr_io_round_trip() {
        let engine = engine();
        let plain: Vec<u8> = (0..0x100u32).map(|i| (i * 3) as u8).collect();

        let mut writer = engine
            .create_ctr_io(0x03, Box::new(Cursor::new(vec![0u8; 0x100])), 77)
            .unwrap();
        writer.write_all(&plain).unwrap();

        let mut reader = engine.create_ctr_io(0x03, writer.base, 77).unwrap();
        reader.seek(SeekFrom::Start(0x30)).unwrap();
        let mut out = [0u8; 0x20];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(&out[..], &plain[0x30..0x50]);
    }

    #[test]
    fn cbc_io_random_access_read() {
        let engine = engine();
        let plain: Vec<u8> = (0..0x100u32).map(|i| (255 - i) as u8).collect();
        let iv = [9u8; 16];

        let mut enc = plain.clone();
        engine.create_cbc_cipher(0x2C, iv).unwrap().encrypt(&mut enc);

        let mut view = engine
            .create_cbc_io(0x2C, Box::new(Cursor::new(enc)), iv)
            .unwrap();

        let mut all = vec![0u8; 0x100];
        view.read_exact(&mut all).unwrap();
        assert_eq!(all, plain);

        // unaligned seek into the middle
        view.seek(SeekFrom::Start(0x47)).unwrap();
        let mut mid = [0u8; 0x19];
        view.read_exact(&mut mid).unwrap();
        assert_eq!(&mid[..], &plain[0x47..0x60]);
    }

    #[test]
    fn cbc_io_block_aligned_write() {
        let engine = engine();
        let iv = [1u8; 16];
        let mut view = engine
            .create_cbc_io(0x2C, Box::new(Cursor::new(vec![0u8; 0x40])), iv)
            .unwrap();
        let plain = [0x5Au8; 0x20];
        view.seek(SeekFrom::Start(0x10)).unwrap();
        view.write_all(&plain).unwrap();

        view.seek(SeekFrom::Start(0x10)).unwrap();
        let mut out = [0u8; 0x20];
        view.read_exact(&mut out).unwrap();
        assert_eq!(out, plain);

        view.seek(SeekFrom::Start(0x7)).unwrap();
        assert!(view.write(&plain).is_err());
    }
}
