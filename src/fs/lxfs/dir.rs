//! Path traversal and directory iteration.
//!
//! Directory entries are packed contiguously and may straddle a block
//! boundary, so every reader keeps a two-block window over the chain: when an
//! entry runs past the end of the first block, the second block slides into
//! its place and the following chain block is read behind it.

use crate::errors::{CanFail, Errno};
use crate::fs::lxfs::disk::{
    DirectoryEntry, DirectoryHeader, EntryType, BLOCK_EOF, DIRENT_FIXED, DIR_HEADER_SIZE,
    DIR_TYPE_SHIFT, DIR_VALID, PERMS_GROUP_R, PERMS_GROUP_W, PERMS_GROUP_X, PERMS_OTHER_R,
    PERMS_OTHER_W, PERMS_OTHER_X, PERMS_OWNER_R, PERMS_OWNER_W, PERMS_OWNER_X,
};
use crate::fs::lxfs::Mountpoint;
use crate::ipc::put_str;

/// Number of components in a mount-relative path; the root directory has
/// depth zero.
#[must_use]
pub fn path_depth(path: &str) -> usize {
    path.split('/').filter(|c| !c.is_empty()).count()
}

/// Returns the `n`-th component of a path, zero-based.
#[must_use]
pub fn path_component(path: &str, n: usize) -> Option<&str> {
    path.split('/').filter(|c| !c.is_empty()).nth(n)
}

/// Returns the parent directory of a path (`/` for top-level names).
#[must_use]
pub fn parent_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/",
        Some(at) => &trimmed[..at],
    }
}

/// The permission class a request needs on an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Exec,
}

/// Checks `access` for `(uid, gid)` against the entry's nine-bit mask,
/// owner class first, then group, then other.
#[must_use]
pub fn has_permission(entry: &DirectoryEntry, uid: u16, gid: u16, access: Access) -> bool {
    let mask = if uid == { entry.owner } {
        match access {
            Access::Read => PERMS_OWNER_R,
            Access::Write => PERMS_OWNER_W,
            Access::Exec => PERMS_OWNER_X,
        }
    } else if gid == { entry.group } {
        match access {
            Access::Read => PERMS_GROUP_R,
            Access::Write => PERMS_GROUP_W,
            Access::Exec => PERMS_GROUP_X,
        }
    } else {
        match access {
            Access::Read => PERMS_OTHER_R,
            Access::Write => PERMS_OTHER_W,
            Access::Exec => PERMS_OTHER_X,
        }
    };

    entry.permissions & mask != 0
}

/// A located directory entry: the record itself, the block holding its first
/// byte, that block's chain successor, the offset of the record within the
/// block, and the two-block window it was read from.
pub struct FoundEntry {
    pub entry: DirectoryEntry,
    pub block: u64,
    pub next: u64,
    pub offset: usize,
    pub(crate) window: Vec<u8>,
}

impl FoundEntry {
    /// True for the synthesized root entry, which has no on-disk record.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.window.is_empty()
    }
}

/// Sliding two-block window over a directory chain.
pub(crate) struct DirWalker {
    pub window: Vec<u8>,
    /// Block occupying the first half of the window.
    pub cur: u64,
    /// Chain successor of `cur`; its data occupies the second half.
    pub next: u64,
    /// Offset of the current entry, always within the first block.
    pub offset: usize,
}

impl DirWalker {
    /// Opens a window over the chain starting at `first`, positioned on the
    /// first entry behind the directory header.
    pub fn open(mp: &mut Mountpoint, first: u64) -> Result<Self, Errno> {
        let block_size = mp.block_size();
        let mut window = mp.window_buf();

        let next = mp.read_next_block(first, &mut window[..block_size])?;
        if next != BLOCK_EOF {
            mp.read_block(next, &mut window[block_size..])?;
        }

        Ok(Self {
            window,
            cur: first,
            next,
            offset: DIR_HEADER_SIZE,
        })
    }

    /// Reads the entry under the window cursor; `None` marks the
    /// zero-`entry_size` terminator.
    pub fn entry(&self) -> Result<Option<DirectoryEntry>, Errno> {
        let entry = DirectoryEntry::read_at(&self.window, self.offset).ok_or(Errno::EIO)?;
        if entry.entry_size == 0 {
            return Ok(None);
        }
        if (entry.entry_size as usize) < DIRENT_FIXED {
            return Err(Errno::EIO);
        }

        Ok(Some(entry))
    }

    /// Advances past an entry of `entry_size` bytes, sliding the window into
    /// the next chain block when the cursor leaves the first one. Returns
    /// `false` when the chain is exhausted.
    pub fn advance(&mut self, mp: &mut Mountpoint, entry_size: usize) -> Result<bool, Errno> {
        let block_size = mp.block_size();
        self.offset += entry_size;

        while self.offset >= block_size {
            if self.next == BLOCK_EOF {
                return Ok(false);
            }

            self.offset -= block_size;
            self.window.copy_within(block_size.., 0);
            self.cur = self.next;
            self.next = mp.next_block(self.cur)?;

            if self.next == BLOCK_EOF {
                self.window[block_size..].fill(0);
            } else {
                mp.read_block(self.next, &mut self.window[block_size..])?;
            }
        }

        Ok(true)
    }
}

fn root_entry(mp: &mut Mountpoint) -> Result<FoundEntry, Errno> {
    let mut buf = mp.block_buf();
    mp.read_block(mp.root(), &mut buf)?;

    let header =
        bytemuck::pod_read_unaligned::<DirectoryHeader>(&buf[..core::mem::size_of::<DirectoryHeader>()]);

    // the root directory has no on-disk entry; it is owned by root:root with
    // mode rwxr-xr-x
    let mut entry = DirectoryEntry {
        flags: DIR_VALID | ((EntryType::Directory as u16) << DIR_TYPE_SHIFT),
        owner: 0,
        group: 0,
        permissions: PERMS_OWNER_R
            | PERMS_OWNER_W
            | PERMS_OWNER_X
            | PERMS_GROUP_R
            | PERMS_GROUP_X
            | PERMS_OTHER_R
            | PERMS_OTHER_X,
        size: 1,
        create_time: header.create_time,
        mod_time: header.mod_time,
        access_time: header.access_time,
        block: mp.root(),
        entry_size: (DIRENT_FIXED + 2) as u16,
        reserved: [0; 14],
        name: [0; 512],
    };
    put_str(&mut entry.name, "/");

    Ok(FoundEntry {
        entry,
        block: 0,
        next: BLOCK_EOF,
        offset: 0,
        window: Vec::new(),
    })
}

/// Resolves `path` to its directory entry.
///
/// Returns `ENOENT` for a missing component and `ENOTDIR` when a parent
/// component is not a directory.
pub fn find(mp: &mut Mountpoint, path: &str) -> Result<FoundEntry, Errno> {
    if path == "/" || path.is_empty() {
        return root_entry(mp);
    }

    let depth = path_depth(path);
    let mut dir_block = mp.root();
    let mut component_index = 0;

    'components: while component_index < depth {
        let component = path_component(path, component_index).ok_or(Errno::ENOENT)?;
        let mut walk = DirWalker::open(mp, dir_block)?;

        loop {
            let Some(entry) = walk.entry()? else {
                return Err(Errno::ENOENT);
            };

            if entry.is_valid() && entry.name_str() == component {
                if component_index == depth - 1 {
                    return Ok(FoundEntry {
                        entry,
                        block: walk.cur,
                        next: walk.next,
                        offset: walk.offset,
                        window: walk.window,
                    });
                }

                if entry.entry_type() != EntryType::Directory {
                    return Err(Errno::ENOTDIR);
                }

                dir_block = entry.block;
                component_index += 1;
                continue 'components;
            }

            if !walk.advance(mp, entry.entry_size as usize)? {
                return Err(Errno::ENOENT);
            }
        }
    }

    Err(Errno::ENOENT)
}

/// Writes back an entry edited in place within its window: the holding block
/// is written and flushed, and so is the following chain block when the
/// record straddles the boundary.
pub(crate) fn commit_entry(mp: &mut Mountpoint, found: &FoundEntry) -> CanFail<Errno> {
    // the synthesized root entry has no on-disk record to edit
    if found.is_root() {
        return Err(Errno::EPERM);
    }

    let block_size = mp.block_size();

    let next = mp.write_next_block(found.block, &found.window[..block_size])?;
    mp.flush_block(found.block)?;

    if found.offset + found.entry.entry_size as usize > block_size {
        if next == BLOCK_EOF {
            return Err(Errno::EIO);
        }

        mp.write_block(next, &found.window[block_size..])?;
        mp.flush_block(next)?;
    }

    Ok(())
}

/// Reads the target string of a symbolic link entry.
pub(crate) fn link_target(mp: &mut Mountpoint, entry: &DirectoryEntry) -> Result<String, Errno> {
    let mut buf = mp.block_buf();
    mp.read_block(entry.block, &mut buf)?;

    let len = (entry.size as usize).min(buf.len());
    String::from_utf8(buf[..len].to_vec()).map_err(|_| Errno::EIO)
}

/// Verifies that `path` may be opened as a directory by `(uid, gid)`: the
/// target must be a directory (one level of symbolic link is resolved) and
/// must grant execute permission.
pub fn opendir(mp: &mut Mountpoint, path: &str, uid: u16, gid: u16) -> CanFail<Errno> {
    let mut entry = find(mp, path)?.entry;

    if entry.entry_type() == EntryType::SoftLink {
        let mut target = link_target(mp, &entry)?;
        if !target.starts_with('/') {
            target.insert(0, '/');
        }

        entry = find(mp, &target)?.entry;
    }

    if entry.entry_type() != EntryType::Directory {
        return Err(Errno::ENOTDIR);
    }

    if !has_permission(&entry, uid, gid, Access::Exec) {
        return Err(Errno::EPERM);
    }

    Ok(())
}

/// One `readdir` probe result.
pub enum DirIndex {
    Entry { name: String, ino: u64 },
    End,
}

/// Returns the `index`-th valid entry of the directory chain rooted at
/// `first`, skipping deleted tombstones. A zero-`entry_size` record or an
/// exhausted chain terminates the directory.
pub fn read_index(mp: &mut Mountpoint, first: u64, index: u64) -> Result<DirIndex, Errno> {
    let mut walk = DirWalker::open(mp, first)?;
    let mut seen = 0;

    loop {
        let Some(entry) = walk.entry()? else {
            return Ok(DirIndex::End);
        };

        if entry.is_valid() {
            if seen == index {
                return Ok(DirIndex::Entry {
                    name: entry.name_str().to_string(),
                    ino: entry.block,
                });
            }
            seen += 1;
        }

        if !walk.advance(mp, entry.entry_size as usize)? {
            return Ok(DirIndex::End);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_and_components() {
        assert_eq!(path_depth("/"), 0);
        assert_eq!(path_depth("/etc"), 1);
        assert_eq!(path_depth("/etc/conf.d/net"), 3);
        assert_eq!(path_component("/etc/conf.d/net", 1), Some("conf.d"));
        assert_eq!(path_component("/etc", 1), None);
    }

    #[test]
    fn parent_paths() {
        assert_eq!(parent_path("/a/b/c"), "/a/b");
        assert_eq!(parent_path("/a"), "/");
        assert_eq!(parent_path("/"), "/");
    }
}
