//! The serial NOR flash command layer.
//!
//! Implements the Winbond W25Q-compatible command set over the SPI bridge.
//! Addresses are 24-bit and go out MSB first; the programming unit is the
//! 256-byte page and a single page program must not cross a page boundary.

use std::thread;
use std::time::Duration;

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::Error;
use crate::jtag::TapAccess;
use crate::spi::SpiPort;

pub const PAGE_SIZE: usize = 256;

/// Read chunk used by the streaming read and verify loops.
pub const READ_CHUNK: usize = 4096;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opcode {
    WriteStatus1 = 0x01,
    PageProgram = 0x02,
    Read = 0x03,
    ReadStatus1 = 0x05,
    WriteEnable = 0x06,
    SectorErase4 = 0x20,
    ReadStatus2 = 0x35,
    BlockErase32 = 0x52,
    ReadJedecId = 0x9F,
    ChipErase = 0xC7,
    BlockErase64 = 0xD8,
}

bitflags! {
    /// Status register 1 bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status1: u8 {
        /// Erase or program in progress.
        const BUSY = 1 << 0;
        /// Write enable latch.
        const WEL = 1 << 1;
        /// Block-protection bits.
        const BP0 = 1 << 2;
        const BP1 = 1 << 3;
        const BP2 = 1 << 4;
        /// Top/bottom protection select.
        const TB = 1 << 5;
        /// Sector/block protection select.
        const SEC = 1 << 6;
        /// Status register protect.
        const SRP = 1 << 7;
    }
}

/// Erase granularity selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseBlock {
    Sector4K,
    Block32K,
    Block64K,
}

impl EraseBlock {
    pub fn size(self) -> u32 {
        match self {
            EraseBlock::Sector4K => 4 * 1024,
            EraseBlock::Block32K => 32 * 1024,
            EraseBlock::Block64K => 64 * 1024,
        }
    }

    fn opcode(self) -> Opcode {
        match self {
            EraseBlock::Sector4K => Opcode::SectorErase4,
            EraseBlock::Block32K => Opcode::BlockErase32,
            EraseBlock::Block64K => Opcode::BlockErase64,
        }
    }
}

/// The sequence of page programs covering `[offset, offset + len)`.
///
/// The first page is truncated so that no program operation crosses a
/// 256-byte page boundary; every byte of the range is covered exactly once.
pub fn page_splits(offset: u32, len: usize) -> impl Iterator<Item = (u32, usize)> {
    let mut addr = offset;
    let mut remaining = len;
    std::iter::from_fn(move || {
        if remaining == 0 {
            return None;
        }
        let take = (PAGE_SIZE - (addr as usize % PAGE_SIZE)).min(remaining);
        let page = (addr, take);
        addr += take as u32;
        remaining -= take;
        Some(page)
    })
}

/// The smallest block-aligned address range covering `[offset, offset + len)`.
pub fn erase_span(offset: u32, len: usize, block: EraseBlock) -> std::ops::Range<u32> {
    let mask = block.size() - 1;
    let begin = offset & !mask;
    let end = (offset + len as u32 + mask) & !mask;
    begin..end
}

pub struct Flash<'a, T: TapAccess> {
    spi: SpiPort<'a, T>,
}

fn addressed(op: Opcode, addr: u32) -> [u8; 4] {
    [op as u8, (addr >> 16) as u8, (addr >> 8) as u8, addr as u8]
}

impl<'a, T: TapAccess> Flash<'a, T> {
    pub fn new(tap: &'a mut T) -> Self {
        Flash {
            spi: SpiPort::new(tap),
        }
    }

    /// Clears continuous-read and QPI modes and resets the chip.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.spi.reset_flash()
    }

    /// Reads the three JEDEC ID bytes (manufacturer, type, capacity).
    pub fn read_id(&mut self) -> Result<[u8; 3], Error> {
        let mut buf = [Opcode::ReadJedecId as u8, 0, 0, 0];
        self.spi.xfer(&mut buf)?;
        Ok([buf[1], buf[2], buf[3]])
    }

    pub fn read_status1(&mut self) -> Result<Status1, Error> {
        let mut buf = [Opcode::ReadStatus1 as u8, 0];
        self.spi.xfer(&mut buf)?;
        Ok(Status1::from_bits_retain(buf[1]))
    }

    pub fn read_status2(&mut self) -> Result<u8, Error> {
        let mut buf = [Opcode::ReadStatus2 as u8, 0];
        self.spi.xfer(&mut buf)?;
        Ok(buf[1])
    }

    /// Sets the write enable latch. Required before every program or erase.
    pub fn write_enable(&mut self) -> Result<(), Error> {
        let mut buf = [Opcode::WriteEnable as u8];
        self.spi.xfer(&mut buf)
    }

    /// Writes 0x00 to status register 1 to clear the block-protection bits.
    /// Some parts refuse a fully cleared register; that is reported as a
    /// warning and execution continues.
    pub fn disable_protection(&mut self) -> Result<(), Error> {
        let mut buf = [Opcode::WriteStatus1 as u8, 0x00];
        self.spi.xfer(&mut buf)?;
        self.wait()?;

        let sr1 = self.read_status1()?;
        if !sr1.is_empty() {
            warn!(
                "failed to disable write protection, SR1 reads 0x{:02X} (expected 0x00)",
                sr1.bits()
            );
        }
        Ok(())
    }

    pub fn chip_erase(&mut self) -> Result<(), Error> {
        let mut buf = [Opcode::ChipErase as u8];
        self.spi.xfer(&mut buf)
    }

    pub fn erase_block(&mut self, block: EraseBlock, addr: u32) -> Result<(), Error> {
        debug!("erase {} kB block at 0x{addr:06X}", block.size() / 1024);
        let mut buf = addressed(block.opcode(), addr);
        self.spi.xfer(&mut buf)
    }

    /// Programs up to one page. `data` must not cross a 256-byte boundary
    /// from `addr`; the caller is responsible for write-enable and the
    /// busy-wait.
    pub fn program_page(&mut self, addr: u32, data: &[u8]) -> Result<(), Error> {
        assert!(!data.is_empty() && data.len() <= PAGE_SIZE);
        assert!(addr as usize % PAGE_SIZE + data.len() <= PAGE_SIZE);

        let mut command = addressed(Opcode::PageProgram, addr);
        self.spi.send(&mut command)?;

        let mut buf = [0u8; PAGE_SIZE];
        buf[..data.len()].copy_from_slice(data);
        self.spi.xfer(&mut buf[..data.len()])
    }

    /// Issues a read command at `addr` and keeps chip-select asserted; the
    /// data is then pulled with any number of `continue_read` calls.
    pub fn start_read(&mut self, addr: u32) -> Result<(), Error> {
        let mut command = addressed(Opcode::Read, addr);
        self.spi.send(&mut command)
    }

    /// Clocks out the next `buf.len()` bytes of an in-progress read.
    pub fn continue_read(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        buf.fill(0);
        self.spi.send(buf)
    }

    /// Polls status register 1 until the busy bit has read clear on three
    /// consecutive polls, about 1 ms apart. Brief idle glitches during state
    /// transitions are thereby ignored. There is no timeout; a wedged flash
    /// is left to the operator's power switch.
    pub fn wait(&mut self) -> Result<(), Error> {
        let mut idle_polls = 0;
        loop {
            let sr1 = self.read_status1()?;
            if sr1.contains(Status1::BUSY) {
                idle_polls = 0;
            } else {
                idle_polls += 1;
                if idle_polls == 3 {
                    return Ok(());
                }
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_split_of_400_bytes_at_offset_100() {
        let pages: Vec<_> = page_splits(100, 400).collect();
        assert_eq!(pages, vec![(100, 156), (256, 244)]);
    }

    #[test]
    fn page_split_of_aligned_range() {
        let pages: Vec<_> = page_splits(512, 512).collect();
        assert_eq!(pages, vec![(512, 256), (768, 256)]);
    }

    #[test]
    fn page_split_within_one_page() {
        let pages: Vec<_> = page_splits(10, 20).collect();
        assert_eq!(pages, vec![(10, 20)]);
    }

    #[test]
    fn page_split_of_empty_range() {
        assert_eq!(page_splits(1234, 0).count(), 0);
    }

    #[test]
    fn page_splits_cover_exactly_and_never_cross() {
        let mut rng = 0x1234_5678u32;
        for _ in 0..500 {
            rng = rng.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let offset = rng % 100_000;
            rng = rng.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let len = (rng % 5_000) as usize;

            let mut expected = offset;
            let mut total = 0;
            for (addr, n) in page_splits(offset, len) {
                assert_eq!(addr, expected, "gap or overlap at 0x{addr:06X}");
                assert!(n > 0 && n <= PAGE_SIZE);
                assert!(
                    addr as usize % PAGE_SIZE + n <= PAGE_SIZE,
                    "page crossing at 0x{addr:06X}+{n}"
                );
                expected += n as u32;
                total += n;
            }
            assert_eq!(total, len);
        }
    }

    #[test]
    fn erase_span_of_10_bytes_at_70000_with_64k_blocks() {
        let span = erase_span(70_000, 10, EraseBlock::Block64K);
        assert_eq!(span, 65_536..131_072);
        assert_eq!(span.step_by(64 * 1024).count(), 1);
    }

    #[test]
    fn erase_span_is_minimal_and_aligned() {
        let mut rng = 0x600d_cafeu32;
        for block in [
            EraseBlock::Sector4K,
            EraseBlock::Block32K,
            EraseBlock::Block64K,
        ] {
            let bs = block.size();
            for _ in 0..500 {
                rng = rng.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                let offset = rng % 1_000_000;
                rng = rng.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                let len = (rng % 300_000) as usize;

                let span = erase_span(offset, len, block);
                assert_eq!(span.start % bs, 0);
                assert_eq!(span.end % bs, 0);
                assert!(span.start <= offset);
                assert!(span.end >= offset + len as u32);
                // Minimality: shrinking either end by one block would drop
                // part of the range.
                if len > 0 {
                    assert!(span.start + bs > offset);
                    assert!(span.end - bs < offset + len as u32);
                }
            }
        }
    }

    #[test]
    fn erase_span_of_zero_bytes_on_a_block_boundary_is_empty() {
        let span = erase_span(65_536, 0, EraseBlock::Block64K);
        assert!(span.is_empty());
    }
}
