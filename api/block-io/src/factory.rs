use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::Result;

/// Random access to the byte range of a backing file or block device.
///
/// A factory reports how many bytes it can address and performs positioned
/// reads and writes anywhere inside that range. Implementations must allow
/// concurrent calls through a shared reference; callers hold factories in an
/// `Arc` so that regions carved out of them can outlive their creator.
pub trait IoFactory: Send + Sync {
    /// The number of addressable bytes.
    fn capacity(&self) -> u64;

    /// Read up to `buf.len()` bytes starting at `offset`, returning how many
    /// bytes were read. A return shorter than `buf.len()` only occurs at the
    /// end of the addressable range.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `buf` at `offset`.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush all completed writes to durable storage.
    fn sync(&self) -> Result<()>;
}

pub struct FileIoFactory {
    file: spin::Mutex<File>,
    capacity: u64,
}

impl FileIoFactory {
    /// Open an existing backing file read-write. The capacity is the file's
    /// current length.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(file)
    }

    /// Create (or truncate) a backing file and extend it to `capacity` bytes.
    pub fn create(path: &Path, capacity: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(capacity)?;
        Ok(Self {
            file: spin::Mutex::new(file),
            capacity,
        })
    }

    pub fn from_file(file: File) -> Result<Self> {
        let capacity = file.metadata()?.len();
        Ok(Self {
            file: spin::Mutex::new(file),
            capacity,
        })
    }
}

impl IoFactory for FileIoFactory {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            let Some(rest) = buf.get_mut(total..) else {
                break;
            };
            let read = file.read(rest)?;
            if read == 0 {
                break;
            }
            total += read;
        }
        Ok(total)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing");

        let factory = FileIoFactory::create(&path, 8192).unwrap();
        assert_eq!(8192, factory.capacity());
        factory.write_at(4096, &[0xAB; 512]).unwrap();
        factory.sync().unwrap();
        drop(factory);

        let factory = FileIoFactory::open(&path).unwrap();
        assert_eq!(8192, factory.capacity());
        let mut buf = [0; 512];
        assert_eq!(512, factory.read_at(4096, &mut buf).unwrap());
        assert_eq!([0xAB; 512], buf);
    }

    #[test]
    fn test_read_past_end_is_short() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing");
        let factory = FileIoFactory::create(&path, 100).unwrap();

        let mut buf = [0; 64];
        assert_eq!(36, factory.read_at(64, &mut buf).unwrap());
        assert_eq!(0, factory.read_at(100, &mut buf).unwrap());
    }
}
