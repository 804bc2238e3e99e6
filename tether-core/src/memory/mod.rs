//! Memory access helpers.
//!
//! Large transfers are split into fixed-size chunks so that one request and
//! its reply always fit the controller's receive buffer.

use crate::control::CoreControl;
use crate::error::{Error, Result};
use std::ops::Range;

/// Default chunk size for memory transfers, in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 64;

/// One chunk of a transfer: target address and the matching slice range of
/// the caller's buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Target address of the chunk.
    pub address: u64,
    /// Matching range of the caller's buffer.
    pub range: Range<usize>,
}

/// Splits `len` bytes starting at `address` into chunks of at most
/// `chunk_size` bytes, in ascending address order.
pub fn chunks(address: u64, len: usize, chunk_size: usize) -> impl Iterator<Item = Chunk> {
    let step = chunk_size.max(1);
    (0..len).step_by(step).map(move |start| {
        let end = (start + step).min(len);
        Chunk { address: address.wrapping_add(start as u64), range: start..end }
    })
}

/// Runs `op` over every chunk; on failure the error is wrapped together with
/// the number of bytes that completed before it.
pub fn for_each_chunk<F>(address: u64, len: usize, chunk_size: usize, mut op: F) -> Result<()>
where
    F: FnMut(&Chunk) -> Result<()>,
{
    let mut transferred = 0;
    for chunk in chunks(address, len, chunk_size) {
        if let Err(source) = op(&chunk) {
            log::debug!("memory transfer failed at {:#010x} after {transferred} bytes", chunk.address);
            return Err(Error::PartialTransfer { transferred, source: Box::new(source) });
        }
        transferred = chunk.range.end;
    }
    Ok(())
}

/// Convenience reads and writes on top of any [`CoreControl`] backend.
pub struct MemoryManager;

impl MemoryManager {
    /// Read a block of memory.
    pub fn read_block(core: &mut dyn CoreControl, address: u64, size: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; size];
        core.mem_read(address, &mut data)?;
        Ok(data)
    }

    /// Read a little-endian 32-bit word.
    pub fn read_32(core: &mut dyn CoreControl, address: u64) -> Result<u32> {
        let mut word = [0u8; 4];
        core.mem_read(address, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Write a little-endian 32-bit word.
    pub fn write_32(core: &mut dyn CoreControl, address: u64, value: u32) -> Result<()> {
        core.mem_write(address, &value.to_le_bytes())
    }

    /// Read the program counter.
    pub fn read_pc(core: &mut dyn CoreControl, arch: crate::TargetArch) -> Result<u64> {
        let values = core.reg_read(arch.pc_mask())?;
        values
            .first()
            .copied()
            .ok_or(Error::core("reg_read", None, crate::StatusCode::TargetCtlBadParams))
    }

    /// Set the program counter.
    pub fn write_pc(core: &mut dyn CoreControl, arch: crate::TargetArch, pc: u64) -> Result<()> {
        core.reg_write(arch.pc_mask(), &[pc])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;

    #[test]
    fn test_chunks_cover_the_range() {
        let plan: Vec<_> = chunks(0x1000, 200, 64).collect();
        assert_eq!(plan.len(), 4);
        assert_eq!(plan[0], Chunk { address: 0x1000, range: 0..64 });
        assert_eq!(plan[3], Chunk { address: 0x10c0, range: 192..200 });
        assert_eq!(chunks(0, 0, 64).count(), 0);
    }

    #[test]
    fn test_failure_reports_completed_bytes() {
        let err = for_each_chunk(0x1000, 200, 64, |chunk| {
            if chunk.range.start >= 128 {
                Err(Error::core("mem_read", Some(chunk.address), StatusCode::TargetCtlMemReadError))
            } else {
                Ok(())
            }
        })
        .unwrap_err();
        assert_eq!(err.transferred(), 128);
        assert_eq!(err.status(), StatusCode::TargetCtlMemReadError);
    }
}
