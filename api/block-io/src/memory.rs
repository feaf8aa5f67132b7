use crate::error::{IoError, Result};
use crate::factory::IoFactory;

/// An in-memory backing store with the same contract as a file factory.
///
/// Used by tests that need to create a layout, reopen it, and tamper with
/// individual bytes in between.
pub struct MemoryIoFactory {
    data: spin::Mutex<Vec<u8>>,
}

impl MemoryIoFactory {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: spin::Mutex::new(vec![0; capacity]),
        }
    }

    /// Overwrite `bytes` at `offset`, bypassing the factory bounds errors.
    /// Test-only corruption hook.
    pub fn patch(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.lock();
        if let Some(target) = data.get_mut(offset..offset + bytes.len()) {
            target.copy_from_slice(bytes);
        }
    }

    /// Copy out `len` bytes starting at `offset`.
    pub fn snapshot(&self, offset: usize, len: usize) -> Vec<u8> {
        let data = self.data.lock();
        data.get(offset..offset + len).unwrap_or(&[]).to_vec()
    }
}

impl IoFactory for MemoryIoFactory {
    fn capacity(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.lock();
        let start = usize::try_from(offset)?;
        if start >= data.len() {
            return Ok(0);
        }
        let end = (start + buf.len()).min(data.len());
        let source = data
            .get(start..end)
            .ok_or(IoError::Buffer("memory read out of range"))?;
        let target = buf
            .get_mut(..source.len())
            .ok_or(IoError::Buffer("memory read out of range"))?;
        target.copy_from_slice(source);
        Ok(source.len())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let start = usize::try_from(offset)?;
        let end = start + buf.len();
        if end > data.len() {
            return Err(IoError::OutOfRange {
                offset,
                len: buf.len() as u64,
                capacity: data.len() as u64,
            });
        }
        let target = data
            .get_mut(start..end)
            .ok_or(IoError::Buffer("memory write out of range"))?;
        target.copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
