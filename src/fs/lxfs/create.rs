//! Directory entry creation.
//!
//! New entries are appended at the zero-`entry_size` terminator of the parent
//! chain; when a record would run past the last block of the chain, a fresh
//! block is linked in first so the straddling write always has both halves.

use bytemuck::Zeroable;

use crate::errors::{CanFail, Errno};
use crate::fs::lxfs::dir::{
    find, has_permission, parent_path, path_component, path_depth, Access, DirWalker,
};
use crate::fs::lxfs::disk::{
    mode_to_permissions, DirectoryEntry, DirectoryHeader, EntryType, FileHeader, BLOCK_EOF,
    DIRENT_FIXED, DIR_TYPE_SHIFT, DIR_VALID,
};
use crate::fs::lxfs::Mountpoint;
use crate::ipc::put_str;
use crate::time::unix_now;

/// Template for a new directory entry.
pub(crate) struct NewEntry {
    pub entry_type: EntryType,
    pub mode: u32,
    pub uid: u16,
    pub gid: u16,
    pub block: u64,
    pub size: u64,
}

/// Inserts a new entry for `path` into its parent directory.
///
/// The caller provides the first block of the child's chain; this function
/// only checks permissions, builds the record, appends it, and maintains the
/// parent's header.
pub(crate) fn create_entry(
    mp: &mut Mountpoint,
    path: &str,
    new: NewEntry,
) -> Result<DirectoryEntry, Errno> {
    let depth = path_depth(path);
    if depth == 0 {
        return Err(Errno::EEXIST);
    }

    let parent = find(mp, parent_path(path))?;
    if parent.entry.entry_type() != EntryType::Directory {
        return Err(Errno::ENOTDIR);
    }
    if !has_permission(&parent.entry, new.uid, new.gid, Access::Write) {
        return Err(Errno::EACCES);
    }

    let name = path_component(path, depth - 1).ok_or(Errno::ENOENT)?;
    if name.len() > 511 {
        return Err(Errno::EINVAL);
    }

    let now = unix_now();
    let mut entry = DirectoryEntry::zeroed();
    entry.flags = DIR_VALID | ((new.entry_type as u16) << DIR_TYPE_SHIFT);
    entry.owner = new.uid;
    entry.group = new.gid;
    entry.permissions = mode_to_permissions(new.mode);
    entry.size = new.size;
    entry.create_time = now;
    entry.mod_time = now;
    entry.access_time = now;
    entry.block = new.block;
    entry.entry_size = (DIRENT_FIXED + name.len() + 1) as u16;
    put_str(&mut entry.name, name);

    insert_entry(mp, parent.entry.block, &entry)?;
    touch_parent(mp, parent.entry.block, entry.entry_size as u64, now)?;

    Ok(entry)
}

/// Walks the parent chain to its terminator and writes `entry` there,
/// extending the chain by one block when the record straddles past its end.
fn insert_entry(mp: &mut Mountpoint, parent_block: u64, entry: &DirectoryEntry) -> CanFail<Errno> {
    let block_size = mp.block_size();
    let mut walk = DirWalker::open(mp, parent_block)?;

    loop {
        let Some(existing) = walk.entry()? else {
            break;
        };

        if !walk.advance(mp, existing.entry_size as usize)? {
            // the chain ended exactly at a block boundary; link a zeroed
            // block and slide into it, the terminator lives there now
            while walk.offset >= block_size {
                let extension = mp.allocate(1)?;
                if extension == 0 {
                    return Err(Errno::ENOSPC);
                }

                let zero = mp.block_buf();
                mp.write_block(extension, &zero)?;
                mp.set_next_block(walk.cur, extension)?;

                walk.offset -= block_size;
                walk.window.copy_within(block_size.., 0);
                walk.cur = extension;
                walk.next = BLOCK_EOF;
                walk.window[block_size..].fill(0);
            }
        }
    }

    let straddles = walk.offset + entry.entry_size as usize > block_size;
    if straddles && walk.next == BLOCK_EOF {
        let extension = mp.allocate(1)?;
        if extension == 0 {
            return Err(Errno::ENOSPC);
        }

        mp.set_next_block(walk.cur, extension)?;
        walk.next = extension;
        walk.window[block_size..].fill(0);
    }

    entry.write_at(&mut walk.window, walk.offset);

    mp.write_block(walk.cur, &walk.window[..block_size])?;
    mp.flush_block(walk.cur)?;

    if straddles {
        mp.write_block(walk.next, &walk.window[block_size..])?;
        mp.flush_block(walk.next)?;
    }

    Ok(())
}

/// Bumps the parent directory header for a newly inserted record.
fn touch_parent(
    mp: &mut Mountpoint,
    parent_block: u64,
    entry_size: u64,
    now: u64,
) -> CanFail<Errno> {
    let mut buf = mp.block_buf();
    mp.read_block(parent_block, &mut buf)?;

    let mut header = bytemuck::pod_read_unaligned::<DirectoryHeader>(
        &buf[..core::mem::size_of::<DirectoryHeader>()],
    );
    header.size_entries += 1;
    header.size_bytes += entry_size;
    header.access_time = now;
    header.mod_time = now;
    buf[..core::mem::size_of::<DirectoryHeader>()].copy_from_slice(bytemuck::bytes_of(&header));

    mp.write_block(parent_block, &buf)?;
    mp.flush_block(parent_block)
}

/// Creates an empty regular file: one chain block holding the file header,
/// no data blocks yet.
pub fn create_file(
    mp: &mut Mountpoint,
    path: &str,
    mode: u32,
    uid: u16,
    gid: u16,
) -> CanFail<Errno> {
    if find(mp, path).is_ok() {
        return Err(Errno::EEXIST);
    }

    let meta_block = mp.allocate(1)?;
    if meta_block == 0 {
        return Err(Errno::ENOSPC);
    }

    let header = FileHeader {
        size: 0,
        ref_count: 1,
    };
    let mut buf = mp.block_buf();
    buf[..core::mem::size_of::<FileHeader>()].copy_from_slice(bytemuck::bytes_of(&header));
    mp.write_block(meta_block, &buf)?;

    create_entry(
        mp,
        path,
        NewEntry {
            entry_type: EntryType::File,
            mode,
            uid,
            gid,
            block: meta_block,
            size: 0,
        },
    )?;

    Ok(())
}

/// Creates an empty directory: one chain block holding the directory
/// header.
pub fn create_dir(
    mp: &mut Mountpoint,
    path: &str,
    mode: u32,
    uid: u16,
    gid: u16,
) -> CanFail<Errno> {
    if find(mp, path).is_ok() {
        return Err(Errno::EEXIST);
    }

    let dir_block = mp.allocate(1)?;
    if dir_block == 0 {
        return Err(Errno::ENOSPC);
    }

    let now = unix_now();
    let mut header = DirectoryHeader::zeroed();
    header.create_time = now;
    header.mod_time = now;
    header.access_time = now;
    header.size_bytes = core::mem::size_of::<DirectoryHeader>() as u64;

    let mut buf = mp.block_buf();
    buf[..core::mem::size_of::<DirectoryHeader>()].copy_from_slice(bytemuck::bytes_of(&header));
    mp.write_block(dir_block, &buf)?;

    create_entry(
        mp,
        path,
        NewEntry {
            entry_type: EntryType::Directory,
            mode,
            uid,
            gid,
            block: dir_block,
            size: 0,
        },
    )?;

    Ok(())
}
