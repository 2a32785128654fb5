//! Volume formatter.
//!
//! Lays down the identification block, the boot header, the block allocation
//! table with its reserved-area sentinels, and an empty root directory.

use bytemuck::Zeroable;

use crate::errors::{CanFail, Errno};
use crate::fs::lxfs::disk::{
    BootHeader, DirectoryHeader, Identification, BLOCK_BOOT, BLOCK_EOF, BLOCK_FREE, BLOCK_ID,
    BLOCK_TABLE, LXFS_CPU_X86_64, LXFS_ID_BLOCK_SIZE_SHIFT, LXFS_ID_SECTOR_SIZE_SHIFT, LXFS_MAGIC,
    LXFS_VERSION, RESERVED_BLOCKS,
};
use crate::fs::lxfs::Volume;
use crate::ipc::put_str;
use crate::time::unix_now;

#[derive(Clone, Debug)]
pub struct MkfsOptions {
    /// Sector-size bits of the `parameters` byte (sector = 512 << bits).
    pub sector_size_bits: u8,

    /// Block-size bits of the `parameters` byte (sectors per block = bits + 1).
    pub block_size_bits: u8,

    pub volume_name: String,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        // 512-byte sectors, four sectors per block
        Self {
            sector_size_bits: 0,
            block_size_bits: 3,
            volume_name: "lxfs".to_string(),
        }
    }
}

/// Formats `volume` as an empty LXFS filesystem.
pub fn mkfs(volume: &mut dyn Volume, options: MkfsOptions) -> CanFail<Errno> {
    let sector_size = 512usize << (options.sector_size_bits & 0x03);
    let sectors_per_block = ((options.block_size_bits & 0x0F) + 1) as usize;
    let block_size = sector_size * sectors_per_block;

    let total_blocks = volume.size_bytes() / block_size as u64;
    let entries_per_block = (block_size / 8) as u64;
    let table_blocks = total_blocks.div_ceil(entries_per_block);
    let root_block = RESERVED_BLOCKS + table_blocks;

    if total_blocks <= root_block {
        return Err(Errno::ENOSPC);
    }

    // identification block
    let mut id = Identification::zeroed();
    id.identifier = LXFS_MAGIC;
    id.volume_size = total_blocks;
    id.root_block = root_block;
    id.parameters = ((options.sector_size_bits & 0x03) << LXFS_ID_SECTOR_SIZE_SHIFT)
        | ((options.block_size_bits & 0x0F) << LXFS_ID_BLOCK_SIZE_SHIFT);
    id.version = LXFS_VERSION;
    put_str(&mut id.name, &options.volume_name);

    let mut block = vec![0u8; block_size];
    block[..core::mem::size_of::<Identification>()].copy_from_slice(bytemuck::bytes_of(&id));
    volume.write_at(0, &block)?;

    // boot header
    let mut boot = BootHeader::zeroed();
    boot.identifier = LXFS_MAGIC;
    boot.cpu_arch = LXFS_CPU_X86_64;
    boot.timestamp = unix_now();
    put_str(&mut boot.description, "formatted by luxd");

    block.fill(0);
    block[..core::mem::size_of::<BootHeader>()].copy_from_slice(bytemuck::bytes_of(&boot));
    volume.write_at(block_size as u64, &block)?;

    // zero the reserved area behind the boot header
    block.fill(0);
    for reserved in 2..RESERVED_BLOCKS {
        volume.write_at(reserved * block_size as u64, &block)?;
    }

    // block allocation table: sentinels for the reserved area and the table
    // itself, an end-of-chain root directory, everything else free
    for table_index in 0..table_blocks {
        block.fill(0);
        for slot in 0..entries_per_block {
            let covered = table_index * entries_per_block + slot;
            if covered >= total_blocks {
                break;
            }

            let entry = if covered == 0 {
                BLOCK_ID
            } else if covered < RESERVED_BLOCKS {
                BLOCK_BOOT
            } else if covered < root_block {
                BLOCK_TABLE
            } else if covered == root_block {
                BLOCK_EOF
            } else {
                BLOCK_FREE
            };

            let at = (slot * 8) as usize;
            block[at..at + 8].copy_from_slice(&entry.to_le_bytes());
        }

        volume.write_at((RESERVED_BLOCKS + table_index) * block_size as u64, &block)?;
    }

    // empty root directory
    let now = unix_now();
    let mut header = DirectoryHeader::zeroed();
    header.create_time = now;
    header.mod_time = now;
    header.access_time = now;
    header.size_bytes = core::mem::size_of::<DirectoryHeader>() as u64;

    block.fill(0);
    block[..core::mem::size_of::<DirectoryHeader>()].copy_from_slice(bytemuck::bytes_of(&header));
    volume.write_at(root_block * block_size as u64, &block)?;

    Ok(())
}
