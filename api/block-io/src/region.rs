use std::sync::Arc;

use crate::error::{IoError, Result};
use crate::factory::IoFactory;

/// A bounded window onto an [`IoFactory`].
///
/// Offsets passed to `read` and `write` are relative to the region start.
/// Each region holds its own reference to the factory, so a region stays
/// usable after the object that carved it out has been dropped; the backing
/// store is closed when the last reference goes away.
#[derive(Clone)]
pub struct IoRegion {
    factory: Arc<dyn IoFactory>,
    start: u64,
    len: u64,
}

impl IoRegion {
    pub fn new(factory: Arc<dyn IoFactory>, start: u64, len: u64) -> Result<Self> {
        let capacity = factory.capacity();
        if start.checked_add(len).is_none_or(|end| end > capacity) {
            return Err(IoError::OutOfRange {
                offset: start,
                len,
                capacity,
            });
        }
        Ok(Self {
            factory,
            start,
            len,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read up to `buf.len()` bytes at `offset`, failing unless at least
    /// `min_len` bytes are available and actually read.
    pub fn read(&self, offset: u64, buf: &mut [u8], min_len: usize) -> Result<usize> {
        let available = self.len.saturating_sub(offset);
        if (min_len as u64) > available {
            return Err(IoError::EndOfFile);
        }
        let wanted = usize::try_from((buf.len() as u64).min(available))?;
        let target = buf
            .get_mut(..wanted)
            .ok_or(IoError::Buffer("region read out of range"))?;
        let read = self.factory.read_at(self.start + offset, target)?;
        if read < min_len {
            return Err(IoError::ShortRead {
                offset: self.start + offset,
                expected: min_len,
                actual: read,
            });
        }
        Ok(read)
    }

    /// Write all of `buf` at `offset`; the write must fit inside the region.
    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let end = offset.checked_add(buf.len() as u64);
        if end.is_none_or(|end| end > self.len) {
            return Err(IoError::OutOfRange {
                offset,
                len: buf.len() as u64,
                capacity: self.len,
            });
        }
        self.factory.write_at(self.start + offset, buf)
    }

    pub fn sync(&self) -> Result<()> {
        self.factory.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryIoFactory;

    fn factory() -> Arc<MemoryIoFactory> {
        Arc::new(MemoryIoFactory::new(4096))
    }

    #[test]
    fn test_bounds_at_creation() {
        let factory = factory();
        assert!(IoRegion::new(factory.clone(), 0, 4096).is_ok());
        assert!(IoRegion::new(factory.clone(), 1024, 3072).is_ok());
        assert!(IoRegion::new(factory.clone(), 1024, 3073).is_err());
        assert!(IoRegion::new(factory, u64::MAX, 2).is_err());
    }

    #[test]
    fn test_offsets_are_region_relative() {
        let factory = factory();
        let region = IoRegion::new(factory.clone(), 1024, 512).unwrap();

        region.write(0, &[7; 16]).unwrap();
        assert_eq!(vec![7; 16], factory.snapshot(1024, 16));

        let mut buf = [0; 16];
        assert_eq!(16, region.read(0, &mut buf, 16).unwrap());
        assert_eq!([7; 16], buf);
    }

    #[test]
    fn test_write_outside_region() {
        let region = IoRegion::new(factory(), 1024, 512).unwrap();
        assert!(region.write(508, &[0; 8]).is_err());
        region.write(504, &[0; 8]).unwrap();
    }

    #[test]
    fn test_read_min_len() {
        let region = IoRegion::new(factory(), 0, 100).unwrap();
        let mut buf = [0; 64];
        // Fewer bytes than the buffer is fine as long as min_len is met.
        assert_eq!(36, region.read(64, &mut buf, 36).unwrap());
        assert!(matches!(
            region.read(64, &mut buf, 64),
            Err(IoError::EndOfFile)
        ));
    }

    #[test]
    fn test_region_outlives_creator() {
        let factory = factory();
        let region = {
            let shared: Arc<dyn IoFactory> = factory.clone();
            IoRegion::new(shared, 0, 4096).unwrap()
        };
        drop(factory);
        region.write(0, &[1]).unwrap();
    }
}
