//! Metadata operations: stat, statvfs, chmod, chown, utime.

use bytemuck::Zeroable;

use crate::errors::{CanFail, Errno};
use crate::fs::lxfs::dir::{commit_entry, find, has_permission, Access};
use crate::fs::lxfs::disk::{
    mode_to_permissions, permissions_to_mode, DirectoryHeader, EntryType, FileHeader, BLOCK_EOF,
    BLOCK_FREE, RESERVED_BLOCKS,
};
use crate::fs::lxfs::Mountpoint;
use crate::ipc::wire::{FileStatus, StatvfsBuffer, ST_NOSUID, S_IFDIR, S_IFLNK, S_IFREG};

/// Projects an entry and its header block into a `stat`-shaped response.
///
/// Directories take size, blocks and timestamps from the directory header;
/// files take size and link count from the file header.
pub fn stat(mp: &mut Mountpoint, path: &str) -> Result<FileStatus, Errno> {
    let entry = find(mp, path)?.entry;

    let mut meta = mp.block_buf();
    let first = mp.read_next_block(entry.block, &mut meta)?;
    if first == 0 {
        return Err(Errno::EIO);
    }

    let block_size = mp.block_size() as u64;
    let mut status = FileStatus::zeroed();
    status.st_atime = entry.access_time;
    status.st_mtime = entry.mod_time;
    status.st_ctime = entry.create_time;
    status.st_blksize = block_size;
    status.st_uid = u32::from(entry.owner);
    status.st_gid = u32::from(entry.group);
    status.st_ino = first;

    match entry.entry_type() {
        EntryType::Directory => {
            let header = bytemuck::pod_read_unaligned::<DirectoryHeader>(
                &meta[..core::mem::size_of::<DirectoryHeader>()],
            );
            status.st_mode = S_IFDIR;
            status.st_size = header.size_bytes;
            status.st_blocks = header.size_bytes.div_ceil(block_size);
            status.st_nlink = 1;
            status.st_atime = header.access_time;
            status.st_mtime = header.mod_time;
            status.st_ctime = header.create_time;
        }
        EntryType::SoftLink => {
            status.st_mode = S_IFLNK;
            status.st_nlink = 1;
            status.st_size = entry.size;
            status.st_blocks = entry.size.div_ceil(block_size);
        }
        EntryType::File | EntryType::HardLink => {
            let header = bytemuck::pod_read_unaligned::<FileHeader>(
                &meta[..core::mem::size_of::<FileHeader>()],
            );
            status.st_mode = S_IFREG;
            status.st_size = header.size;
            status.st_blocks = header.size.div_ceil(block_size);
            status.st_nlink = header.ref_count as u32;
        }
    }

    status.st_mode |= permissions_to_mode(entry.permissions);
    Ok(status)
}

/// Computes free-block and free-file counts by scanning the block
/// allocation table.
pub fn statvfs(mp: &mut Mountpoint) -> Result<StatvfsBuffer, Errno> {
    let mut buffer = StatvfsBuffer::zeroed();
    buffer.f_bsize = mp.block_size() as u64;
    buffer.f_frsize = mp.block_size() as u64;
    buffer.f_blocks = mp.volume_size();
    buffer.f_flag = ST_NOSUID;
    buffer.f_namemax = 511;

    buffer.f_files = buffer.f_blocks / 2;
    buffer.f_ffree = buffer.f_files;

    for block in RESERVED_BLOCKS..mp.volume_size() {
        let next = mp.next_block(block)?;
        if next == BLOCK_FREE {
            buffer.f_bfree += 1;
        } else if next == BLOCK_EOF {
            buffer.f_ffree = buffer.f_ffree.saturating_sub(1);
        }
    }

    buffer.f_bavail = buffer.f_bfree;
    buffer.f_favail = buffer.f_ffree;
    Ok(buffer)
}

/// Rewrites the nine permission bits of `path`. Only the owner may set the
/// mode.
pub fn chmod(mp: &mut Mountpoint, path: &str, mode: u32, uid: u16) -> CanFail<Errno> {
    let mut found = find(mp, path)?;
    if found.is_root() {
        return Err(Errno::EPERM);
    }
    if found.entry.owner != uid {
        return Err(Errno::EPERM);
    }

    found.entry.permissions = mode_to_permissions(mode);
    found.entry.write_at(&mut found.window, found.offset);
    commit_entry(mp, &found)
}

/// Rewrites ownership of `path`; `(-1, -1)` is a no-op. Only the owner may
/// change it.
pub fn chown(
    mp: &mut Mountpoint,
    path: &str,
    new_uid: i32,
    new_gid: i32,
    uid: u16,
) -> CanFail<Errno> {
    if new_uid == -1 && new_gid == -1 {
        return Ok(());
    }

    let mut found = find(mp, path)?;
    if found.is_root() {
        return Err(Errno::EPERM);
    }
    if found.entry.owner != uid {
        return Err(Errno::EPERM);
    }

    if new_uid != -1 {
        found.entry.owner = new_uid as u16;
    }
    if new_gid != -1 {
        found.entry.group = new_gid as u16;
    }

    found.entry.write_at(&mut found.window, found.offset);
    commit_entry(mp, &found)
}

/// Sets access and modification times of `path`; for directories the
/// directory header is refreshed as well. The owner, or anyone else holding
/// write permission, may do this.
pub fn utime(
    mp: &mut Mountpoint,
    path: &str,
    access_time: u64,
    modified_time: u64,
    uid: u16,
    gid: u16,
) -> CanFail<Errno> {
    let mut found = find(mp, path)?;
    if found.is_root() {
        return Err(Errno::EPERM);
    }

    if found.entry.owner != uid && !has_permission(&found.entry, uid, gid, Access::Write) {
        return Err(Errno::EPERM);
    }

    found.entry.access_time = access_time;
    found.entry.mod_time = modified_time;
    found.entry.write_at(&mut found.window, found.offset);
    commit_entry(mp, &found)?;

    if found.entry.entry_type() == EntryType::Directory {
        let dir_block = found.entry.block;
        let mut meta = mp.block_buf();
        mp.read_block(dir_block, &mut meta)?;

        let mut header = bytemuck::pod_read_unaligned::<DirectoryHeader>(
            &meta[..core::mem::size_of::<DirectoryHeader>()],
        );
        header.access_time = access_time;
        header.mod_time = modified_time;
        meta[..core::mem::size_of::<DirectoryHeader>()].copy_from_slice(bytemuck::bytes_of(&header));

        mp.write_block(dir_block, &meta)?;
        mp.flush_block(dir_block)?;
    }

    Ok(())
}
