//! Driver for the LXFS file system.
//!
//! An LXFS volume is a flat array of blocks linked into per-file chains
//! through a block allocation table ([`disk`]). The engine reads and writes
//! blocks through a write-back [`cache`], walks directory chains with a
//! two-block window so entries may straddle block boundaries, and serves the
//! POSIX-shaped commands relayed by the VFS router ([`server`]).

pub mod attr;
pub mod blockio;
pub mod cache;
pub mod create;
pub mod dir;
pub mod disk;
pub mod file;
pub mod link;
pub mod mkfs;
pub mod server;

pub use server::LxfsServer;

use crate::errors::{CanFail, Errno};
use crate::fs::lxfs::cache::BlockCache;
use crate::fs::lxfs::disk::{Identification, LXFS_MAGIC};
use crate::info;

/// Byte-addressed backing store of a mounted volume.
///
/// In production this is the block device file published by the
/// storage-device layer; the test suite mounts [`RamDisk`]s.
pub trait Volume {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> CanFail<Errno>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> CanFail<Errno>;
    fn size_bytes(&self) -> u64;
}

/// Resolves a device path from a MOUNT command into its backing store.
pub trait VolumeSource {
    fn open(&mut self, device: &str) -> Result<Box<dyn Volume>, Errno>;
}

/// Memory-backed volume.
pub struct RamDisk {
    data: Vec<u8>,
}

impl RamDisk {
    #[must_use]
    pub fn new(size_bytes: u64) -> Self {
        Self {
            data: vec![0u8; size_bytes as usize],
        }
    }
}

impl Volume for RamDisk {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> CanFail<Errno> {
        let start = offset as usize;
        let end = start.checked_add(buf.len()).ok_or(Errno::EIO)?;
        if end > self.data.len() {
            return Err(Errno::EIO);
        }

        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> CanFail<Errno> {
        let start = offset as usize;
        let end = start.checked_add(buf.len()).ok_or(Errno::EIO)?;
        if end > self.data.len() {
            return Err(Errno::EIO);
        }

        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }
}

/// A mounted LXFS volume: geometry decoded from the identification block,
/// the block cache, and the backing store.
pub struct Mountpoint {
    device: String,
    volume: Box<dyn Volume>,
    sector_size: usize,
    sectors_per_block: usize,
    block_size: usize,
    volume_size: u64,
    root: u64,
    pub(crate) cache: BlockCache,
}

impl Mountpoint {
    /// Mounts `volume`, verifying the identification block and deriving the
    /// volume geometry from its `parameters` byte.
    pub fn mount(device: &str, mut volume: Box<dyn Volume>) -> Result<Self, Errno> {
        let mut sector = [0u8; 512];
        volume.read_at(0, &mut sector)?;

        let id = bytemuck::pod_read_unaligned::<Identification>(
            &sector[..core::mem::size_of::<Identification>()],
        );
        if id.identifier != LXFS_MAGIC {
            return Err(Errno::ENODEV);
        }

        let sector_size = id.sector_size();
        let sectors_per_block = id.sectors_per_block();
        let block_size = id.block_size();
        let root = id.root_block;
        let volume_size = id.volume_size;

        info!("lxfs", "mounted lxfs volume on {device}:");
        info!(
            "lxfs",
            "- {sector_size} bytes per sector, {sectors_per_block} sectors per block"
        );
        info!("lxfs", "- root directory at block {root}");

        Ok(Self {
            device: device.to_string(),
            volume,
            sector_size,
            sectors_per_block,
            block_size,
            volume_size,
            root,
            cache: BlockCache::new(block_size),
        })
    }

    #[must_use]
    pub fn device(&self) -> &str {
        &self.device
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    #[must_use]
    pub fn volume_size(&self) -> u64 {
        self.volume_size
    }

    #[must_use]
    pub fn root(&self) -> u64 {
        self.root
    }

    /// A scratch buffer holding exactly one block.
    #[must_use]
    pub fn block_buf(&self) -> Vec<u8> {
        vec![0u8; self.block_size]
    }

    /// A scratch buffer holding two consecutive blocks; directory readers
    /// are always double-buffered so entries may straddle a boundary.
    #[must_use]
    pub fn window_buf(&self) -> Vec<u8> {
        vec![0u8; 2 * self.block_size]
    }

    pub(crate) fn volume_mut(&mut self) -> &mut dyn Volume {
        self.volume.as_mut()
    }
}
