//! Byte-stream primitives that the container readers are built on.
//!
//! Every reader in this crate sees its input as a [`SharedFile`]: a
//! reference-counted, mutex-guarded seekable stream. [`SubFile`] carves a
//! bounded window out of one with an independent cursor, so any number of
//! sub-views (and cipher views wrapping them) can coexist on the same base
//! across threads; each seek+read/write pair happens under the base lock.

use std::hash::{Hash, Hasher};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

/// Anything the readers can use as a byte stream.
pub trait FileLike: Read + Write + Seek + Send {}
impl<T: Read + Write + Seek + Send + ?Sized> FileLike for T {}

/// A stream shared between sub-views. The mutex serialises seek+I/O pairs.
pub type SharedFile = Arc<Mutex<dyn FileLike>>;

/// Wraps an owned stream into a [`SharedFile`].
pub fn shared<F: FileLike + 'static>(file: F) -> SharedFile {
    Arc::new(Mutex::new(file))
}

/// A read-only stream that never supports writing. Useful for wrapping
/// `std::fs::File` handles opened read-only, or any `Read + Seek` type.
pub struct ReadOnly<F>(pub F);

impl<F: Read> Read for ReadOnly<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<F: Seek> Seek for ReadOnly<F> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.seek(pos)
    }
}

impl<F> Write for ReadOnly<F> {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "stream is read-only",
        ))
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Provides read-write access to a sub-region of a shared base stream.
///
/// The view has its own cursor. Reads clamp to the declared size; writes
/// past it are silently discarded (a write at or past the end reports 0
/// bytes written without erroring). Seeks beyond the end are allowed.
pub struct SubFile {
    base: SharedFile,
    offset: u64,
    size: u64,
    pos: u64,
}

impl std::fmt::Debug for SubFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubFile")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("pos", &self.pos)
            .finish()
    }
}

impl SubFile {
    pub fn new(base: SharedFile, offset: u64, size: u64) -> Self {
        Self {
            base,
            offset,
            size,
            pos: 0,
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads the whole sub-region into a buffer.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        self.seek(SeekFrom::Start(0))?;
        let mut out = Vec::with_capacity(self.size as usize);
        self.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Read for SubFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min((self.size - self.pos) as usize);
        let got = {
            let mut base = self.base.lock().unwrap();
            base.seek(SeekFrom::Start(self.offset + self.pos))?;
            base.read(&mut buf[..n])?
        };
        self.pos += got as u64;
        Ok(got)
    }
}

impl Write for SubFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.pos >= self.size {
            return Ok(0);
        }
        let n = buf.len().min((self.size - self.pos) as usize);
        let written = {
            let mut base = self.base.lock().unwrap();
            base.seek(SeekFrom::Start(self.offset + self.pos))?;
            base.write(&buf[..n])?
        };
        self.pos += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.base.lock().unwrap().flush()
    }
}

impl Seek for SubFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = resolve_seek(pos, self.pos, self.size)?;
        Ok(self.pos)
    }
}

impl PartialEq for SubFile {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.base, &other.base)
            && self.offset == other.offset
            && self.size == other.size
    }
}
impl Eq for SubFile {}

impl Hash for SubFile {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.base) as *const () as usize).hash(state);
        self.offset.hash(state);
        self.size.hash(state);
    }
}

/// Read-only concatenation of independent streams into one virtual stream.
pub struct ConcatFile {
    parts: Vec<(Box<dyn FileLike>, u64)>,
    /// Prefix sums; `starts[i]` is the virtual offset of part `i`.
    starts: Vec<u64>,
    total: u64,
    pos: u64,
}

impl ConcatFile {
    pub fn new(parts: Vec<(Box<dyn FileLike>, u64)>) -> Self {
        let mut starts = Vec::with_capacity(parts.len());
        let mut total = 0;
        for (_, size) in &parts {
            starts.push(total);
            total += size;
        }
        Self {
            parts,
            starts,
            total,
            pos: 0,
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.total
    }

    fn part_at(&self, pos: u64) -> Option<usize> {
        if pos >= self.total {
            return None;
        }
        // the partition point is the first part starting after pos
        Some(self.starts.partition_point(|&s| s <= pos) - 1)
    }
}

impl Read for ConcatFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut copied = 0;
        while copied < buf.len() {
            let Some(idx) = self.part_at(self.pos) else {
                break;
            };
            let inner_pos = self.pos - self.starts[idx];
            let (part, part_size) = &mut self.parts[idx];
            let n = (buf.len() - copied).min((*part_size - inner_pos) as usize);
            part.seek(SeekFrom::Start(inner_pos))?;
            let got = part.read(&mut buf[copied..copied + n])?;
            if got == 0 {
                break;
            }
            copied += got;
            self.pos += got as u64;
        }
        Ok(copied)
    }
}

impl Write for ConcatFile {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "concatenated streams are read-only",
        ))
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for ConcatFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = resolve_seek(pos, self.pos, self.total)?;
        Ok(self.pos)
    }
}

/// Adapts a [`SharedFile`] back into an owned stream.
///
/// The guard forwards every operation under the base lock and keeps its own
/// cursor. Dropping it never drops the base (the owner of the last `Arc`
/// does), which is how the original close-wrapper protocol maps onto Rust
/// ownership.
pub struct CloseGuard {
    base: SharedFile,
    pos: u64,
}

impl CloseGuard {
    pub fn new(base: SharedFile) -> Self {
        Self { base, pos: 0 }
    }
}

impl Read for CloseGuard {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut base = self.base.lock().unwrap();
        base.seek(SeekFrom::Start(self.pos))?;
        let got = base.read(buf)?;
        self.pos += got as u64;
        Ok(got)
    }
}

impl Write for CloseGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut base = self.base.lock().unwrap();
        base.seek(SeekFrom::Start(self.pos))?;
        let written = base.write(buf)?;
        self.pos += written as u64;
        Ok(written)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.base.lock().unwrap().flush()
    }
}

impl Seek for CloseGuard {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Start(off) => self.pos = off,
            SeekFrom::Current(off) => {
                self.pos = add_signed(self.pos, off)?;
            }
            SeekFrom::End(off) => {
                let end = {
                    let mut base = self.base.lock().unwrap();
                    base.seek(SeekFrom::End(0))?
                };
                self.pos = add_signed(end, off)?;
            }
        }
        Ok(self.pos)
    }
}

fn add_signed(base: u64, off: i64) -> io::Result<u64> {
    let res = base as i64 + off;
    if res < 0 {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "seek before start",
        ))
    } else {
        Ok(res as u64)
    }
}

fn resolve_seek(pos: SeekFrom, current: u64, size: u64) -> io::Result<u64> {
    match pos {
        SeekFrom::Start(off) => Ok(off),
        SeekFrom::Current(off) => Ok(add_signed(current, off).unwrap_or(0).max(0)),
        SeekFrom::End(off) => Ok(add_signed(size, off).unwrap_or(0).max(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::thread;

    fn base_with(data: &[u8]) -> SharedFile {
        shared(Cursor::new(data.to_vec()))
    }

    #[test]
    fn subfile_reads_clamp_to_size() {
        let base = base_with(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut sub = SubFile::new(base, 2, 4);
        let mut buf = [0u8; 16];
        let n = sub.read(&mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], &[3, 4, 5, 6]);
        // past the end
        sub.seek(SeekFrom::Start(100)).unwrap();
        assert_eq!(sub.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn subfile_writes_past_end_are_discarded() {
        let base = base_with(&[0u8; 8]);
        let mut sub = SubFile::new(base.clone(), 0, 4);
        sub.seek(SeekFrom::Start(4)).unwrap();
        assert_eq!(sub.write(&[9, 9]).unwrap(), 0);
        // straddling the end writes the fitting prefix only
        sub.seek(SeekFrom::Start(3)).unwrap();
        assert_eq!(sub.write(&[7, 7, 7]).unwrap(), 1);
        let mut all = [0u8; 8];
        let mut guard = CloseGuard::new(base);
        guard.read_exact(&mut all).unwrap();
        assert_eq!(all, [0, 0, 0, 7, 0, 0, 0, 0]);
    }

    #[test]
    fn subfile_identity() {
        let base = base_with(&[0u8; 8]);
        let a = SubFile::new(base.clone(), 0, 4);
        let b = SubFile::new(base.clone(), 0, 4);
        let c = SubFile::new(base, 4, 4);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn concat_crosses_boundaries() {
        let a = Box::new(Cursor::new(vec![1u8, 2, 3]));
        let b = Box::new(Cursor::new(vec![4u8, 5]));
        let c = Box::new(Cursor::new(vec![6u8, 7, 8, 9]));
        let mut cat = ConcatFile::new(vec![(a, 3), (b, 2), (c, 4)]);
        assert_eq!(cat.size(), 9);
        let mut buf = Vec::new();
        cat.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, &[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        cat.seek(SeekFrom::Start(2)).unwrap();
        let mut four = [0u8; 4];
        cat.read_exact(&mut four).unwrap();
        assert_eq!(four, [3, 4, 5, 6]);
        assert!(cat.write(&[0]).is_err());
    }

    #[test]
    fn concurrent_subfiles_on_one_base() {
        let chunk = 1 << 20;
        let mut data = Vec::with_capacity(4 * chunk);
        for i in 0..4u8 {
            data.extend(std::iter::repeat(i + 1).take(chunk));
        }
        let base = base_with(&data);

        let mut handles = Vec::new();
        for i in 0..4u8 {
            let mut sub = SubFile::new(base.clone(), i as u64 * chunk as u64, chunk as u64);
            handles.push(thread::spawn(move || {
                let mut buf = vec![0u8; chunk];
                sub.read_exact(&mut buf).unwrap();
                buf.iter().all(|&b| b == i + 1)
            }));
        }
        for h in handles {
            assert!(h.join().unwrap());
        }
    }
}
