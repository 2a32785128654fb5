//! Direct-mapped write-back block cache.
//!
//! Fixed 4096 slots keyed by `block % CACHE_SIZE` with a tag of
//! `block / CACHE_SIZE`. Slot data is allocated lazily on first touch and a
//! dirty slot is always flushed to the volume before being refilled, so at
//! any quiescent point the on-disk copy of a dirty block is older than the
//! cached one, never newer.

use crate::errors::{CanFail, Errno};
use crate::fs::lxfs::Volume;

/// With a block size of 2 KB, this gives 8 MB of cache.
pub const CACHE_SIZE: usize = 4096;

struct CacheSlot {
    valid: bool,
    dirty: bool,
    tag: u64,
    data: Option<Box<[u8]>>,
}

pub struct BlockCache {
    slots: Vec<CacheSlot>,
    block_size: usize,
}

impl BlockCache {
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        let mut slots = Vec::with_capacity(CACHE_SIZE);
        for _ in 0..CACHE_SIZE {
            slots.push(CacheSlot {
                valid: false,
                dirty: false,
                tag: 0,
                data: None,
            });
        }

        Self { slots, block_size }
    }

    /// Flushes the slot at `index` to the volume if it is valid and dirty.
    pub fn flush_slot(&mut self, volume: &mut dyn Volume, index: usize) -> CanFail<Errno> {
        let block_size = self.block_size;
        let slot = &mut self.slots[index % CACHE_SIZE];
        if !slot.valid || !slot.dirty {
            return Ok(());
        }

        let block = slot.tag * CACHE_SIZE as u64 + (index % CACHE_SIZE) as u64;
        let data = slot.data.as_ref().ok_or(Errno::EIO)?;
        volume.write_at(block * block_size as u64, data)?;

        slot.dirty = false;
        Ok(())
    }

    /// Reads `block` into `out`, filling the slot from the volume on a miss.
    pub fn read(&mut self, volume: &mut dyn Volume, block: u64, out: &mut [u8]) -> CanFail<Errno> {
        let tag = block / CACHE_SIZE as u64;
        let index = (block % CACHE_SIZE as u64) as usize;

        if self.slots[index].valid && self.slots[index].tag == tag {
            let data = self.slots[index].data.as_ref().ok_or(Errno::EIO)?;
            out[..self.block_size].copy_from_slice(data);
            return Ok(());
        }

        if self.slots[index].valid && self.slots[index].dirty {
            self.flush_slot(volume, index)?;
        }

        let block_size = self.block_size;
        let slot = &mut self.slots[index];
        slot.valid = true;
        slot.dirty = false;
        slot.tag = tag;

        let data = slot
            .data
            .get_or_insert_with(|| vec![0u8; block_size].into_boxed_slice());

        if volume.read_at(block * block_size as u64, data).is_err() {
            slot.valid = false;
            return Err(Errno::EIO);
        }

        out[..block_size].copy_from_slice(data);
        Ok(())
    }

    /// Installs `data` as the cached copy of `block` and marks the slot
    /// dirty; the volume is only written once the slot is flushed or
    /// evicted.
    pub fn write(&mut self, volume: &mut dyn Volume, block: u64, data: &[u8]) -> CanFail<Errno> {
        let tag = block / CACHE_SIZE as u64;
        let index = (block % CACHE_SIZE as u64) as usize;

        if !(self.slots[index].valid && self.slots[index].tag == tag)
            && self.slots[index].valid
            && self.slots[index].dirty
        {
            self.flush_slot(volume, index)?;
        }

        let block_size = self.block_size;
        let slot = &mut self.slots[index];
        slot.valid = true;
        slot.dirty = true;
        slot.tag = tag;

        let slot_data = slot
            .data
            .get_or_insert_with(|| vec![0u8; block_size].into_boxed_slice());
        slot_data.copy_from_slice(&data[..block_size]);
        Ok(())
    }

    /// Write-back sweep over every dirty slot.
    pub fn flush_all(&mut self, volume: &mut dyn Volume) -> CanFail<Errno> {
        for index in 0..CACHE_SIZE {
            self.flush_slot(volume, index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::lxfs::{RamDisk, Volume};

    const BS: usize = 512;

    #[test]
    fn write_is_deferred_until_flush() {
        let mut disk = RamDisk::new(64 * BS as u64);
        let mut cache = BlockCache::new(BS);

        let payload = vec![0xABu8; BS];
        cache.write(&mut disk, 5, &payload).unwrap();

        let mut raw = vec![0u8; BS];
        disk.read_at(5 * BS as u64, &mut raw).unwrap();
        assert_eq!(raw, vec![0u8; BS], "write must not reach the disk early");

        cache.flush_slot(&mut disk, 5).unwrap();
        disk.read_at(5 * BS as u64, &mut raw).unwrap();
        assert_eq!(raw, payload);
    }

    #[test]
    fn conflicting_block_evicts_dirty_slot() {
        let mut disk = RamDisk::new((CACHE_SIZE as u64 + 8) * BS as u64);
        let mut cache = BlockCache::new(BS);

        // blocks 3 and CACHE_SIZE+3 share a slot
        let low = vec![0x11u8; BS];
        cache.write(&mut disk, 3, &low).unwrap();

        let mut out = vec![0u8; BS];
        cache
            .read(&mut disk, CACHE_SIZE as u64 + 3, &mut out)
            .unwrap();

        // the dirty block must have been flushed before the refill
        let mut raw = vec![0u8; BS];
        disk.read_at(3 * BS as u64, &mut raw).unwrap();
        assert_eq!(raw, low);
    }

    #[test]
    fn read_hits_do_not_touch_the_volume() {
        let mut disk = RamDisk::new(64 * BS as u64);
        disk.write_at(7 * BS as u64, &vec![0x77u8; BS]).unwrap();

        let mut cache = BlockCache::new(BS);
        let mut out = vec![0u8; BS];
        cache.read(&mut disk, 7, &mut out).unwrap();

        // mutate the backing store behind the cache's back; a hit must serve
        // the cached copy
        disk.write_at(7 * BS as u64, &vec![0x00u8; BS]).unwrap();
        cache.read(&mut disk, 7, &mut out).unwrap();
        assert_eq!(out, vec![0x77u8; BS]);
    }
}
