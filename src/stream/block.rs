//! Block scheduler shared by the block-oriented stream layers
//!
//! The partial, bitmap, encrypted, and sharded layers all present the
//! archive as a sequence of fixed-size blocks with per-block
//! availability. The scheduler rounds a byte request outward to block
//! boundaries, groups consecutive blocks of equal availability into
//! single runs, and reports missing runs through the download callback.

use super::ProgressCallback;
use crate::{Error, Result};

/// What a block-oriented layer must provide to the scheduler
pub(crate) trait BlockIo {
    /// Block size; always a power of two
    fn block_size(&self) -> u64;

    /// Logical stream size in bytes
    fn stream_size(&self) -> u64;

    /// True when every block is locally present
    fn is_complete(&self) -> bool;

    /// Availability of the block containing `block_offset`
    fn block_available(&self, block_offset: u64) -> bool;

    /// Whether a master stream exists to fill missing blocks from
    fn has_master(&self) -> bool;

    /// Read the run `[start, end)` into `out`
    ///
    /// `start` is block aligned; `end` is either block aligned or the
    /// stream size. For an unavailable run the implementation fetches the
    /// bytes from its master and persists them locally.
    fn read_run(&mut self, start: u64, end: u64, out: &mut [u8], available: bool) -> Result<()>;
}

/// Read `buf.len()` bytes at `offset` through the block scheduler
pub(crate) fn block_read(
    io: &mut dyn BlockIo,
    progress: &mut Option<ProgressCallback>,
    offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }

    let block_size = io.block_size();
    let stream_size = io.stream_size();
    let end_offset = offset + buf.len() as u64;
    if end_offset > stream_size {
        return Err(Error::EndOfFile);
    }

    let first_block = offset & !(block_size - 1);
    let block_count = (end_offset - first_block).div_ceil(block_size);
    let slice_start = (offset - first_block) as usize;

    let mut transfer = vec![0u8; (block_count * block_size) as usize];
    let mut callback_fired = false;

    if io.is_complete() {
        let end = end_offset.min(stream_size);
        let len = (end - first_block) as usize;
        io.read_run(first_block, end, &mut transfer[..len], true)?;
    } else {
        let mut run_start = first_block;
        let mut run_available = io.block_available(run_start);
        let mut block_offset = first_block;

        let mut flush_run =
            |io: &mut dyn BlockIo,
             progress: &mut Option<ProgressCallback>,
             run_start: u64,
             run_end: u64,
             available: bool,
             transfer: &mut [u8]|
             -> Result<()> {
                if !available && io.has_master() {
                    if let Some(cb) = progress.as_mut() {
                        cb(run_start, run_end - run_start);
                        callback_fired = true;
                    }
                }
                let end = run_end.min(stream_size);
                let at = (run_start - first_block) as usize;
                let len = (end - run_start) as usize;
                io.read_run(run_start, end, &mut transfer[at..at + len], available)
            };

        while block_offset < end_offset {
            let available = io.block_available(block_offset);
            if available != run_available {
                flush_run(
                    io,
                    progress,
                    run_start,
                    block_offset,
                    run_available,
                    &mut transfer,
                )?;
                run_start = block_offset;
                run_available = available;
            }
            block_offset += block_size;
        }

        if block_offset > run_start {
            flush_run(
                io,
                progress,
                run_start,
                block_offset,
                run_available,
                &mut transfer,
            )?;
        }
    }

    buf.copy_from_slice(&transfer[slice_start..slice_start + buf.len()]);

    // One terminating callback per request once any run was reported
    if callback_fired {
        if let Some(cb) = progress.as_mut() {
            cb(0, 0);
        }
    }

    Ok(())
}
