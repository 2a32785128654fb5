//! Hard links, symbolic links, and unlinking.

use crate::errors::{CanFail, Errno};
use crate::fs::lxfs::create::{create_entry, NewEntry};
use crate::fs::lxfs::dir::{
    commit_entry, find, has_permission, link_target, parent_path, Access,
};
use crate::fs::lxfs::disk::{
    permissions_to_mode, DirectoryHeader, EntryType, FileHeader, BLOCK_EOF, BLOCK_FREE,
    DIR_DELETED,
};
use crate::fs::lxfs::Mountpoint;
use crate::ipc::wire::{S_IRGRP, S_IROTH, S_IRUSR, S_IWUSR};
use crate::time::unix_now;

/// Creates a hard link `new_path` to `old_path`.
///
/// The target must be a regular file or another hard link; the new entry
/// references the same chain and the file header's reference count is
/// incremented.
pub fn link(
    mp: &mut Mountpoint,
    old_path: &str,
    new_path: &str,
    uid: u16,
    gid: u16,
) -> CanFail<Errno> {
    let old = find(mp, old_path)?.entry;

    if find(mp, new_path).is_ok() {
        return Err(Errno::EEXIST);
    }

    let entry_type = old.entry_type();
    if entry_type != EntryType::File && entry_type != EntryType::HardLink {
        return Err(Errno::EPERM);
    }

    create_entry(
        mp,
        new_path,
        NewEntry {
            entry_type: EntryType::HardLink,
            mode: permissions_to_mode(old.permissions),
            uid,
            gid,
            block: old.block,
            size: old.size,
        },
    )?;

    // account for the new name in the shared file header
    let mut meta = mp.block_buf();
    mp.read_block(old.block, &mut meta)?;
    let mut header = bytemuck::pod_read_unaligned::<FileHeader>(
        &meta[..core::mem::size_of::<FileHeader>()],
    );
    header.ref_count += 1;
    meta[..core::mem::size_of::<FileHeader>()].copy_from_slice(bytemuck::bytes_of(&header));
    mp.write_block(old.block, &meta)?;
    mp.flush_block(old.block)
}

/// Creates a symbolic link `new_path` whose target is the string
/// `old_path`.
///
/// The target string lives in a one-block chain; the entry's `size` is the
/// target length. Mode bits are copied from the target when it exists and
/// default to `rw-r--r--` otherwise.
pub fn symlink(
    mp: &mut Mountpoint,
    old_path: &str,
    new_path: &str,
    uid: u16,
    gid: u16,
) -> CanFail<Errno> {
    if find(mp, new_path).is_ok() {
        return Err(Errno::EEXIST);
    }

    let mode = match find(mp, old_path) {
        Ok(found) => permissions_to_mode(found.entry.permissions),
        Err(_) => S_IRUSR | S_IWUSR | S_IRGRP | S_IROTH,
    };

    let target = old_path.as_bytes();
    if target.len() > mp.block_size() {
        return Err(Errno::EINVAL);
    }

    let target_block = mp.allocate(1)?;
    if target_block == 0 {
        return Err(Errno::ENOSPC);
    }

    let mut buf = mp.block_buf();
    buf[..target.len()].copy_from_slice(target);
    mp.write_block(target_block, &buf)?;

    create_entry(
        mp,
        new_path,
        NewEntry {
            entry_type: EntryType::SoftLink,
            mode,
            uid,
            gid,
            block: target_block,
            size: target.len() as u64,
        },
    )?;

    Ok(())
}

/// Reads the target of a symbolic link, clamped to the recorded length.
pub fn readlink(mp: &mut Mountpoint, path: &str) -> Result<Vec<u8>, Errno> {
    let entry = find(mp, path)?.entry;
    if entry.entry_type() != EntryType::SoftLink {
        return Err(Errno::EINVAL);
    }

    Ok(link_target(mp, &entry)?.into_bytes())
}

/// Removes the name `path`.
///
/// The directory entry becomes a blanked tombstone of unchanged
/// `entry_size`. Files and hard links decrement the shared reference count
/// and free the chain once it reaches zero; directories (which must be
/// empty) and symbolic links free their chain unconditionally.
pub fn unlink(mp: &mut Mountpoint, path: &str, uid: u16, gid: u16) -> CanFail<Errno> {
    // the root directory is not removable
    if path == "/" || path.is_empty() {
        return Err(Errno::EPERM);
    }

    let mut found = find(mp, path)?;
    let entry = found.entry;

    if !has_permission(&entry, uid, gid, Access::Write) {
        return Err(Errno::EPERM);
    }

    let entry_type = entry.entry_type();
    if entry_type == EntryType::Directory {
        let mut meta = mp.block_buf();
        mp.read_block(entry.block, &mut meta)?;

        let header = bytemuck::pod_read_unaligned::<DirectoryHeader>(
            &meta[..core::mem::size_of::<DirectoryHeader>()],
        );
        if header.size_entries != 0 {
            return Err(Errno::ENOTEMPTY);
        }
    }

    // blank the record in place; entry_size survives so traversal still
    // steps over the tombstone
    let entry_size = entry.entry_size;
    found.entry.flags = DIR_DELETED;
    found.entry.block = 0;
    found.entry.permissions = 0;
    found.entry.owner = 0;
    found.entry.group = 0;
    found.entry.size = 0;
    found.entry.create_time = 0;
    found.entry.mod_time = 0;
    found.entry.access_time = 0;
    found.entry.name = [0; 512];
    found.entry.entry_size = entry_size;

    found.entry.write_at(&mut found.window, found.offset);
    commit_entry(mp, &found)?;

    match entry_type {
        EntryType::File | EntryType::HardLink => {
            let mut meta = mp.block_buf();
            mp.read_block(entry.block, &mut meta)?;

            let mut header = bytemuck::pod_read_unaligned::<FileHeader>(
                &meta[..core::mem::size_of::<FileHeader>()],
            );
            header.ref_count -= 1;

            if header.ref_count > 0 {
                meta[..core::mem::size_of::<FileHeader>()]
                    .copy_from_slice(bytemuck::bytes_of(&header));
                mp.write_block(entry.block, &meta)?;
                mp.flush_block(entry.block)?;
            } else {
                free_chain(mp, entry.block)?;
            }
        }
        EntryType::Directory | EntryType::SoftLink => {
            free_chain(mp, entry.block)?;
        }
    }

    // drop the name from the parent's header and refresh its timestamps
    let parent = find(mp, parent_path(path))?.entry;

    let mut meta = mp.block_buf();
    mp.read_block(parent.block, &mut meta)?;

    let mut header = bytemuck::pod_read_unaligned::<DirectoryHeader>(
        &meta[..core::mem::size_of::<DirectoryHeader>()],
    );
    let now = unix_now();
    header.size_entries -= 1;
    header.access_time = now;
    header.mod_time = now;
    meta[..core::mem::size_of::<DirectoryHeader>()].copy_from_slice(bytemuck::bytes_of(&header));

    mp.write_block(parent.block, &meta)?;
    mp.flush_block(parent.block)
}

/// Returns every block of a chain to the free pool.
fn free_chain(mp: &mut Mountpoint, first: u64) -> CanFail<Errno> {
    let mut block = first;
    while block != 0 && block != BLOCK_EOF {
        let next = mp.next_block(block)?;
        mp.set_next_block(block, BLOCK_FREE)?;
        block = next;
    }

    Ok(())
}
