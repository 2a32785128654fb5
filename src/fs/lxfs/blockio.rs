//! Block I/O, chaining, and the free-block allocator.

use crate::errors::{CanFail, Errno};
use crate::fs::lxfs::cache::CACHE_SIZE;
use crate::fs::lxfs::disk::{BLOCK_EOF, BLOCK_FREE, RESERVED_BLOCKS};
use crate::fs::lxfs::Mountpoint;

impl Mountpoint {
    /// Reads a block through the cache into `buf` (at least one block
    /// long).
    pub fn read_block(&mut self, block: u64, buf: &mut [u8]) -> CanFail<Errno> {
        let Self { volume, cache, .. } = self;
        cache.read(volume.as_mut(), block, buf)
    }

    /// Writes a block through the cache from `buf` (at least one block
    /// long).
    pub fn write_block(&mut self, block: u64, buf: &[u8]) -> CanFail<Errno> {
        let Self { volume, cache, .. } = self;
        cache.write(volume.as_mut(), block, buf)
    }

    /// Flushes the cache slot holding `block`, if dirty.
    pub fn flush_block(&mut self, block: u64) -> CanFail<Errno> {
        self.flush_slot((block % CACHE_SIZE as u64) as usize)
    }

    /// Flushes the cache slot at `index`, if dirty.
    pub fn flush_slot(&mut self, index: usize) -> CanFail<Errno> {
        let Self { volume, cache, .. } = self;
        cache.flush_slot(volume.as_mut(), index)
    }

    /// Writes every dirty cache slot back to the volume.
    pub fn flush_all(&mut self) -> CanFail<Errno> {
        let Self { volume, cache, .. } = self;
        cache.flush_all(volume.as_mut())
    }

    /// Returns the block-table entry of `block`: the next block in its
    /// chain, or a sentinel.
    pub fn next_block(&mut self, block: u64) -> Result<u64, Errno> {
        let entries_per_block = (self.block_size() / 8) as u64;
        let table_block = RESERVED_BLOCKS + block / entries_per_block;
        let table_index = (block % entries_per_block) as usize;

        let mut table = self.block_buf();
        self.read_block(table_block, &mut table)?;

        Ok(u64::from_le_bytes(
            table[table_index * 8..table_index * 8 + 8].try_into().unwrap(),
        ))
    }

    /// Read-modify-writes the block-table entry of `block`.
    pub fn set_next_block(&mut self, block: u64, next: u64) -> CanFail<Errno> {
        let entries_per_block = (self.block_size() / 8) as u64;
        let table_block = RESERVED_BLOCKS + block / entries_per_block;
        let table_index = (block % entries_per_block) as usize;

        let mut table = self.block_buf();
        self.read_block(table_block, &mut table)?;
        table[table_index * 8..table_index * 8 + 8].copy_from_slice(&next.to_le_bytes());
        self.write_block(table_block, &table)
    }

    /// Reads `block` into `buf` and returns the next block in its chain.
    pub fn read_next_block(&mut self, block: u64, buf: &mut [u8]) -> Result<u64, Errno> {
        self.read_block(block, buf)?;
        self.next_block(block)
    }

    /// Writes `block` from `buf` and returns the next block in its chain.
    pub fn write_next_block(&mut self, block: u64, buf: &[u8]) -> Result<u64, Errno> {
        self.write_block(block, buf)?;
        self.next_block(block)
    }

    /// Finds the `index`-th free block on the volume by a linear scan of the
    /// block table; guarantees the volume has at least `index + 1` free
    /// blocks.
    pub fn find_free_block(&mut self, index: u64) -> Result<u64, Errno> {
        let mut seen = 0;
        for block in RESERVED_BLOCKS..self.volume_size() {
            if self.next_block(block)? == BLOCK_FREE {
                seen += 1;
                if seen > index {
                    return Ok(block);
                }
            }
        }

        Err(Errno::ENOSPC)
    }

    /// Allocates `count` blocks and links them into a fresh chain terminated
    /// by the end-of-chain sentinel, returning the chain head.
    ///
    /// A request for zero blocks returns 0 with no side effects. On partial
    /// failure the prefix already linked is released back to the free pool
    /// before the error is reported.
    pub fn allocate(&mut self, count: u64) -> Result<u64, Errno> {
        if count == 0 {
            return Ok(0);
        }

        let mut blocks = Vec::with_capacity(count as usize);
        for i in 0..count {
            blocks.push(self.find_free_block(i)?);
        }

        for i in 0..blocks.len() {
            let next = if i + 1 < blocks.len() {
                blocks[i + 1]
            } else {
                BLOCK_EOF
            };

            if self.set_next_block(blocks[i], next).is_err() {
                // release the prefix already linked so nothing leaks
                for &linked in &blocks[..=i] {
                    let _ = self.set_next_block(linked, BLOCK_FREE);
                }
                return Err(Errno::EIO);
            }
        }

        Ok(blocks[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::lxfs::mkfs::{mkfs, MkfsOptions};
    use crate::fs::lxfs::{Mountpoint, RamDisk};

    fn test_mp() -> Mountpoint {
        let mut disk = RamDisk::new(256 * 2048);
        mkfs(&mut disk, MkfsOptions::default()).unwrap();
        Mountpoint::mount("/dev/ram0", Box::new(disk)).unwrap()
    }

    #[test]
    fn chain_links_terminate_at_eof() {
        let mut mp = test_mp();

        let head = mp.allocate(3).unwrap();
        assert_ne!(head, 0);

        let second = mp.next_block(head).unwrap();
        let third = mp.next_block(second).unwrap();
        assert_ne!(second, BLOCK_EOF);
        assert_ne!(third, BLOCK_EOF);
        assert_eq!(mp.next_block(third).unwrap(), BLOCK_EOF);

        // no block repeats within the chain
        assert_ne!(head, second);
        assert_ne!(second, third);
        assert_ne!(head, third);
    }

    #[test]
    fn allocate_zero_is_a_no_op() {
        let mut mp = test_mp();

        let free_before = count_free(&mut mp);
        assert_eq!(mp.allocate(0).unwrap(), 0);
        assert_eq!(count_free(&mut mp), free_before);
    }

    #[test]
    fn allocator_makes_progress_while_space_remains() {
        let mut mp = test_mp();

        let free = count_free(&mut mp);
        assert!(free > 4);
        assert!(mp.allocate(4).unwrap() != 0);
        assert_eq!(count_free(&mut mp), free - 4);

        // asking for more than what remains fails without consuming the pool
        let free = count_free(&mut mp);
        assert_eq!(mp.allocate(free + 1), Err(Errno::ENOSPC));
        assert_eq!(count_free(&mut mp), free);
    }

    fn count_free(mp: &mut Mountpoint) -> u64 {
        let mut free = 0;
        for block in RESERVED_BLOCKS..mp.volume_size() {
            if mp.next_block(block).unwrap() == BLOCK_FREE {
                free += 1;
            }
        }
        free
    }
}
