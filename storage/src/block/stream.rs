//! Sequential reader over a sector range.
//!
//! Streams only deal in whole blocks. There is no sub-block buffering, so a
//! read whose length is not a multiple of the block size is refused.

use super::{BlockDevice, BlockError};

/// Single-pass byte stream.
pub trait Stream {
    /// Fills `buf` from the current position.
    ///
    /// Returns the number of bytes read. Zero means the request was refused
    /// (misaligned, past the end, or the device failed) and the position is
    /// unchanged.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Sectors left before the end of the stream.
    fn remaining(&self) -> u64;
}

/// Stream backed directly by [`BlockDevice::read_blocks`].
pub struct SimpleStream<'a, D: BlockDevice + ?Sized> {
    device: &'a D,
    current: u64,
    end: u64,
    block_size: u64,
}

impl<'a, D: BlockDevice + ?Sized> SimpleStream<'a, D> {
    pub fn new(device: &'a D, start: u64, count: u64) -> Result<Self, BlockError> {
        let block_size = device.info().block_size as u64;
        if !block_size.is_power_of_two() {
            return Err(BlockError::InvalidSize);
        }
        let end = start.checked_add(count).ok_or(BlockError::OutOfRange)?;

        Ok(Self { device, current: start, end, block_size })
    }

    /// Next sector to be read.
    pub fn position(&self) -> u64 {
        self.current
    }
}

impl<D: BlockDevice + ?Sized> Stream for SimpleStream<'_, D> {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let len = buf.len() as u64;
        if len % self.block_size != 0 {
            log::warn!(
                "[block] Stream read of {} bytes is not a multiple of the {} byte block size",
                len,
                self.block_size
            );
            return 0;
        }

        let sectors = len / self.block_size;
        if sectors == 0 {
            return 0;
        }
        if sectors > self.end - self.current {
            log::warn!(
                "[block] Stream read of {} sectors at {} runs past the end ({})",
                sectors,
                self.current,
                self.end
            );
            return 0;
        }

        match self.device.read_blocks(self.current, sectors, buf) {
            Ok(read) => {
                let read = read.min(sectors);
                self.current += read;
                (read * self.block_size) as usize
            }
            Err(err) => {
                log::warn!("[block] Stream read at sector {} failed: {}", self.current, err);
                0
            }
        }
    }

    fn remaining(&self) -> u64 {
        self.end - self.current
    }
}
