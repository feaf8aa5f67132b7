use crate::error::{IoError, Result};
use crate::region::IoRegion;

/// Sequential block-aligned reader over an [`IoRegion`].
///
/// Data is fetched one block at a time; `read_fully` calls that stay inside
/// the current block are served from the buffer. Reading past the end of the
/// region fails with `EndOfFile`.
pub struct BufferedReader {
    region: IoRegion,
    buffer: Vec<u8>,
    /// Region offset of the next block to fetch.
    next_offset: u64,
    /// Valid bytes in `buffer`.
    end: usize,
    /// Consumed bytes in `buffer`.
    pos: usize,
}

impl BufferedReader {
    pub fn new(region: IoRegion, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(IoError::Buffer("block size must be nonzero"));
        }
        Ok(Self {
            region,
            buffer: vec![0; block_size],
            next_offset: 0,
            end: 0,
            pos: 0,
        })
    }

    /// Fill `buf` completely or fail.
    pub fn read_fully(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut copied = 0;
        while copied < buf.len() {
            if self.pos == self.end {
                self.fill_buffer()?;
            }
            let available = self.end - self.pos;
            let wanted = (buf.len() - copied).min(available);
            let source = self
                .buffer
                .get(self.pos..self.pos + wanted)
                .ok_or(IoError::Buffer("reader buffer out of range"))?;
            let target = buf
                .get_mut(copied..copied + wanted)
                .ok_or(IoError::Buffer("reader buffer out of range"))?;
            target.copy_from_slice(source);
            self.pos += wanted;
            copied += wanted;
        }
        Ok(())
    }

    fn fill_buffer(&mut self) -> Result<()> {
        let remaining = self.region.len().saturating_sub(self.next_offset);
        if remaining == 0 {
            return Err(IoError::EndOfFile);
        }
        let wanted = usize::try_from((self.buffer.len() as u64).min(remaining))?;
        let target = self
            .buffer
            .get_mut(..wanted)
            .ok_or(IoError::Buffer("reader buffer out of range"))?;
        self.region.read(self.next_offset, target, wanted)?;
        self.next_offset += wanted as u64;
        self.pos = 0;
        self.end = wanted;
        Ok(())
    }
}

/// Sequential block-aligned writer over an [`IoRegion`].
///
/// Bytes accumulate in a one-block buffer; each full block is written in
/// place. `flush` pads the trailing partial block with zeros so every write
/// issued to the region is a whole block. Callers must flush before dropping
/// the writer; nothing is written implicitly.
pub struct BufferedWriter {
    region: IoRegion,
    buffer: Vec<u8>,
    /// Region offset where the buffered block will land.
    block_offset: u64,
    /// Bytes accumulated in `buffer`.
    pos: usize,
}

impl BufferedWriter {
    pub fn new(region: IoRegion, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(IoError::Buffer("block size must be nonzero"));
        }
        Ok(Self {
            region,
            buffer: vec![0; block_size],
            block_offset: 0,
            pos: 0,
        })
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            let wanted = (data.len() - written).min(self.buffer.len() - self.pos);
            let source = data
                .get(written..written + wanted)
                .ok_or(IoError::Buffer("writer buffer out of range"))?;
            let target = self
                .buffer
                .get_mut(self.pos..self.pos + wanted)
                .ok_or(IoError::Buffer("writer buffer out of range"))?;
            target.copy_from_slice(source);
            self.pos += wanted;
            written += wanted;
            if self.pos == self.buffer.len() {
                self.write_block()?;
            }
        }
        Ok(())
    }

    /// Append `len` zero bytes.
    pub fn write_zeros(&mut self, mut len: usize) -> Result<()> {
        let zeros = vec![0; self.buffer.len()];
        while len > 0 {
            let wanted = len.min(zeros.len());
            let chunk = zeros
                .get(..wanted)
                .ok_or(IoError::Buffer("writer buffer out of range"))?;
            self.write(chunk)?;
            len -= wanted;
        }
        Ok(())
    }

    /// Write out the current partial block, zero-padded to a whole block.
    pub fn flush(&mut self) -> Result<()> {
        if self.pos == 0 {
            return Ok(());
        }
        if let Some(tail) = self.buffer.get_mut(self.pos..) {
            tail.fill(0);
        }
        self.write_partial_block()
    }

    pub fn sync(&self) -> Result<()> {
        self.region.sync()
    }

    fn write_block(&mut self) -> Result<()> {
        self.region.write(self.block_offset, &self.buffer)?;
        self.block_offset += self.buffer.len() as u64;
        self.pos = 0;
        Ok(())
    }

    fn write_partial_block(&mut self) -> Result<()> {
        // The final block of a region may be shorter than the block size.
        let room = self.region.len().saturating_sub(self.block_offset);
        let wanted = usize::try_from((self.buffer.len() as u64).min(room))?;
        if wanted < self.pos {
            return Err(IoError::OutOfRange {
                offset: self.block_offset,
                len: self.pos as u64,
                capacity: self.region.len(),
            });
        }
        let block = self
            .buffer
            .get(..wanted)
            .ok_or(IoError::Buffer("writer buffer out of range"))?;
        self.region.write(self.block_offset, block)?;
        self.block_offset += wanted as u64;
        self.pos = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::MemoryIoFactory;

    const BLOCK: usize = 64;

    fn region(factory: &Arc<MemoryIoFactory>, start: u64, len: u64) -> IoRegion {
        let shared: Arc<dyn crate::IoFactory> = factory.clone();
        IoRegion::new(shared, start, len).unwrap()
    }

    #[test]
    fn test_round_trip_across_blocks() {
        let factory = Arc::new(MemoryIoFactory::new(1024));
        let mut writer = BufferedWriter::new(region(&factory, 0, 1024), BLOCK).unwrap();

        let data: Vec<u8> = (0..200u16).map(|v| (v % 251) as u8).collect();
        writer.write(&data).unwrap();
        writer.flush().unwrap();

        let mut reader = BufferedReader::new(region(&factory, 0, 1024), BLOCK).unwrap();
        let mut read_back = vec![0; 200];
        reader.read_fully(&mut read_back).unwrap();
        assert_eq!(data, read_back);
    }

    #[test]
    fn test_flush_pads_block_with_zeros() {
        let factory = Arc::new(MemoryIoFactory::new(256));
        factory.patch(0, &[0xFF; 256]);

        let mut writer = BufferedWriter::new(region(&factory, 0, 256), BLOCK).unwrap();
        writer.write(&[1, 2, 3]).unwrap();
        writer.flush().unwrap();

        let block = factory.snapshot(0, BLOCK);
        assert_eq!(vec![1, 2, 3], block[0..3]);
        assert_eq!(vec![0; BLOCK - 3], block[3..BLOCK]);
        // The next block is untouched.
        assert_eq!(vec![0xFF; BLOCK], factory.snapshot(BLOCK, BLOCK));
    }

    #[test]
    fn test_sequential_flushes_advance() {
        let factory = Arc::new(MemoryIoFactory::new(256));
        let mut writer = BufferedWriter::new(region(&factory, 0, 256), BLOCK).unwrap();
        writer.write(&[1; 10]).unwrap();
        writer.flush().unwrap();
        writer.write(&[2; 10]).unwrap();
        writer.flush().unwrap();

        assert_eq!(vec![1; 10], factory.snapshot(0, 10));
        assert_eq!(vec![2; 10], factory.snapshot(BLOCK, 10));
    }

    #[test]
    fn test_write_zeros() {
        let factory = Arc::new(MemoryIoFactory::new(256));
        factory.patch(0, &[0xFF; 256]);
        let mut writer = BufferedWriter::new(region(&factory, 0, 256), BLOCK).unwrap();
        writer.write_zeros(3 * BLOCK).unwrap();
        assert_eq!(vec![0; 3 * BLOCK], factory.snapshot(0, 3 * BLOCK));
    }

    #[test]
    fn test_write_past_region_end() {
        let factory = Arc::new(MemoryIoFactory::new(1024));
        let mut writer = BufferedWriter::new(region(&factory, 0, BLOCK as u64), BLOCK).unwrap();
        writer.write(&[0; BLOCK]).unwrap();
        writer.write(&[0; 1]).unwrap();
        assert!(writer.flush().is_err());
    }

    #[test]
    fn test_read_past_region_end() {
        let factory = Arc::new(MemoryIoFactory::new(1024));
        let mut reader = BufferedReader::new(region(&factory, 0, BLOCK as u64), BLOCK).unwrap();
        let mut buf = [0; BLOCK];
        reader.read_fully(&mut buf).unwrap();
        assert!(matches!(
            reader.read_fully(&mut buf),
            Err(IoError::EndOfFile)
        ));
    }

    #[test]
    fn test_short_region_tail() {
        // A region that is not a whole number of blocks still reads fully.
        let factory = Arc::new(MemoryIoFactory::new(1024));
        factory.patch(0, &[9; 100]);
        let mut reader = BufferedReader::new(region(&factory, 0, 100), BLOCK).unwrap();
        let mut buf = [0; 100];
        reader.read_fully(&mut buf).unwrap();
        assert_eq!([9; 100], buf);
    }
}
