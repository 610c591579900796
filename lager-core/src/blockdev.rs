//! Block device shim (C4): turns the SD/MMC driver (C3) into the
//! `embedded_sdmmc::BlockDevice` the external FAT filesystem layer expects,
//! retrying each sector up to [`crate::constants::DISK_RETRY_COUNT`] times
//! before surfacing an error.
//!
//! Grounded on the `disk_read`/`disk_write`/`disk_ioctl` shim pattern every
//! FatFs port in the retrieval pack uses (e.g. `original_source/shared/diskio.c`)
//! — translated to the trait the Rust FAT crate (`embedded-sdmmc`) actually
//! defines, rather than a bespoke vtable, since the filesystem itself is an
//! out-of-scope external collaborator here (§1).

use crate::constants::DISK_RETRY_COUNT;
use crate::{Error, Result};
use core::cell::RefCell;
use embedded_sdmmc::{Block, BlockCount, BlockDevice, BlockIdx, TimeSource, Timestamp};

/// The boundary the SD/MMC driver (C3) presents to this shim: single
/// 512-byte block reads and writes addressed by absolute block number, and
/// an optional batched multi-block write (§4.3.5). Implemented by
/// `lager-hal`'s SDIO driver; kept here as a trait so this module stays
/// hardware-independent and host-testable with a fake.
pub trait SdTransfer {
    /// Reads one 512-byte block at `block_addr` into `buf`.
    fn read_block(&mut self, block_addr: u32, buf: &mut [u8; 512]) -> Result<()>;
    /// Writes one 512-byte block at `block_addr` from `buf`.
    fn write_block(&mut self, block_addr: u32, buf: &[u8; 512]) -> Result<()>;
    /// Total number of 512-byte blocks the card exposes.
    fn block_count(&self) -> u32;
}

/// Wraps an [`SdTransfer`] implementation as a `(drive, sector, count,
/// buffer)` block device. Only drive 0 exists (§4.4); that is enforced by
/// the filesystem layer addressing this device directly rather than through
/// a drive-number parameter in `embedded_sdmmc::BlockDevice`, so the only
/// place `PARAMETER ERROR` can still arise is a request past the end of the
/// card, handled by `embedded_sdmmc` itself.
pub struct BlockShim<D> {
    driver: RefCell<D>,
}

impl<D: SdTransfer> BlockShim<D> {
    pub fn new(driver: D) -> Self {
        BlockShim { driver: RefCell::new(driver) }
    }

    pub fn into_inner(self) -> D {
        self.driver.into_inner()
    }

    /// Retries `op` up to `DISK_RETRY_COUNT` times, returning the first
    /// success or the last failure once the budget is exhausted.
    fn with_retry(&self, mut op: impl FnMut(&mut D) -> Result<()>) -> Result<()> {
        let mut attempt = 0;
        loop {
            match op(&mut self.driver.borrow_mut()) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= DISK_RETRY_COUNT {
                        return Err(e);
                    }
                }
            }
        }
    }

    fn read_one_with_retry(&self, addr: u32, buf: &mut [u8; 512]) -> Result<()> {
        self.with_retry(|driver| driver.read_block(addr, buf))
    }

    fn write_one_with_retry(&self, addr: u32, buf: &[u8; 512]) -> Result<()> {
        self.with_retry(|driver| driver.write_block(addr, buf))
    }
}

impl<D: SdTransfer> BlockDevice for BlockShim<D> {
    type Error = Error;

    /// Reads one or more blocks, retrying each sector up to
    /// `DISK_RETRY_COUNT` times before failing (§4.4).
    fn read(
        &self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
    ) -> core::result::Result<(), Self::Error> {
        for (i, block) in blocks.iter_mut().enumerate() {
            let addr = start_block_idx.0 + i as u32;
            self.read_one_with_retry(addr, &mut block.contents)
                .map_err(|_| Error::DiskIoError)?;
        }
        Ok(())
    }

    fn write(
        &self,
        blocks: &[Block],
        start_block_idx: BlockIdx,
    ) -> core::result::Result<(), Self::Error> {
        for (i, block) in blocks.iter().enumerate() {
            let addr = start_block_idx.0 + i as u32;
            self.write_one_with_retry(addr, &block.contents)
                .map_err(|_| Error::DiskIoError)?;
        }
        Ok(())
    }

    fn num_blocks(&self) -> core::result::Result<BlockCount, Self::Error> {
        Ok(BlockCount(self.driver.borrow().block_count()))
    }
}

/// The board has no RTC (§6 names no time source among its external
/// interfaces); every file this firmware creates is timestamped at the FAT
/// epoch rather than tracking wall-clock time it doesn't have.
pub struct NullTimeSource;

impl TimeSource for NullTimeSource {
    fn get_timestamp(&self) -> Timestamp {
        Timestamp { year_since_1970: 0, zero_indexed_month: 0, zero_indexed_day: 0, hours: 0, minutes: 0, seconds: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct FlakyDriver {
        /// Sectors that fail this many more times before succeeding.
        fail_budget: RefCell<std::collections::HashMap<u32, u32>>,
        calls: RefCell<u32>,
        blocks: RefCell<std::collections::HashMap<u32, [u8; 512]>>,
    }

    impl FlakyDriver {
        fn new() -> Self {
            FlakyDriver {
                fail_budget: RefCell::new(Default::default()),
                calls: RefCell::new(0),
                blocks: RefCell::new(Default::default()),
            }
        }
        fn fail_sector_times(&self, sector: u32, n: u32) {
            self.fail_budget.borrow_mut().insert(sector, n);
        }
    }

    impl SdTransfer for &FlakyDriver {
        fn read_block(&mut self, block_addr: u32, buf: &mut [u8; 512]) -> Result<()> {
            *self.calls.borrow_mut() += 1;
            let mut budget = self.fail_budget.borrow_mut();
            if let Some(n) = budget.get_mut(&block_addr) {
                if *n > 0 {
                    *n -= 1;
                    return Err(Error::SdTransferFailed);
                }
            }
            if let Some(data) = self.blocks.borrow().get(&block_addr) {
                buf.copy_from_slice(data);
            }
            Ok(())
        }
        fn write_block(&mut self, block_addr: u32, buf: &[u8; 512]) -> Result<()> {
            *self.calls.borrow_mut() += 1;
            self.blocks.borrow_mut().insert(block_addr, *buf);
            Ok(())
        }
        fn block_count(&self) -> u32 {
            65536
        }
    }

    #[test]
    fn transient_failure_recovers_within_retry_budget() {
        let driver = FlakyDriver::new();
        driver.fail_sector_times(5, 2); // fails twice, succeeds on 3rd (retry budget is 3)
        let shim = BlockShim::new(&driver);
        let mut buf = [0u8; 512];
        let addr = 5u32;
        assert!(shim.read_one_with_retry(addr, &mut buf).is_ok());
        assert_eq!(*driver.calls.borrow(), 3);
    }

    #[test]
    fn persistent_failure_surfaces_after_three_attempts() {
        let driver = FlakyDriver::new();
        driver.fail_sector_times(9, 100);
        let shim = BlockShim::new(&driver);
        let mut buf = [0u8; 512];
        let err = shim.read_one_with_retry(9, &mut buf).unwrap_err();
        assert_eq!(err, Error::SdTransferFailed);
        assert_eq!(*driver.calls.borrow(), DISK_RETRY_COUNT);
    }

    #[test]
    fn multi_sector_read_issues_at_most_3c_calls() {
        let driver = FlakyDriver::new();
        driver.fail_sector_times(2, 2);
        let shim = BlockShim::new(&driver);
        let mut blocks = [Block::default(), Block::default(), Block::default(), Block::default()];
        shim.read(&mut blocks, BlockIdx(0)).unwrap();
        assert!(*driver.calls.borrow() <= 3 * 4);
    }
}
