//! File data operations: read, write, mmap, fsync.

use crate::errors::{CanFail, Errno};
use crate::fs::lxfs::dir::{commit_entry, find};
use crate::fs::lxfs::disk::{FileHeader, BLOCK_EOF};
use crate::fs::lxfs::Mountpoint;
use crate::time::unix_now;

/// Reads the file header block of an entry and returns the header together
/// with the first data block (the chain successor of the header block).
fn read_file_header(
    mp: &mut Mountpoint,
    entry_block: u64,
) -> Result<(FileHeader, Vec<u8>, u64), Errno> {
    let mut meta = mp.block_buf();
    let first = mp.read_next_block(entry_block, &mut meta)?;

    let header = bytemuck::pod_read_unaligned::<FileHeader>(
        &meta[..core::mem::size_of::<FileHeader>()],
    );
    Ok((header, meta, first))
}

/// Reads up to `length` bytes starting at `position`.
///
/// Returns the bytes actually produced; a read past the end of file fails
/// with `EOVERFLOW`, a short chain truncates the result.
pub fn read(
    mp: &mut Mountpoint,
    path: &str,
    position: u64,
    length: u64,
) -> Result<Vec<u8>, Errno> {
    let entry = find(mp, path)?.entry;
    let (header, _, first) = read_file_header(mp, entry.block)?;

    if position >= header.size {
        return Err(Errno::EOVERFLOW);
    }

    let true_length = length.min(header.size - position) as usize;
    let block_size = mp.block_size();

    // find the data block containing the starting position
    let mut block = first;
    let mut skip = position / block_size as u64;
    let start_offset = (position % block_size as u64) as usize;
    while skip > 0 {
        block = mp.next_block(block)?;
        if block == 0 {
            return Err(Errno::EIO);
        }
        skip -= 1;
    }

    // separate counters: the chain may end early on a corrupted volume, in
    // which case a partial read is still returned
    let mut out = Vec::with_capacity(true_length);
    let mut buf = mp.block_buf();
    let mut remaining = true_length;

    while remaining > 0 {
        if block == BLOCK_EOF || block == 0 {
            break;
        }

        let next = mp.read_next_block(block, &mut buf)?;

        let offset = if out.is_empty() { start_offset } else { 0 };
        let take = remaining.min(block_size - offset);
        out.extend_from_slice(&buf[offset..offset + take]);
        remaining -= take;

        block = next;
    }

    if out.is_empty() {
        return Err(Errno::EIO);
    }

    Ok(out)
}

/// Writes `data` at `position`; `-1` means append.
///
/// Returns the caller's new file position. The file grows only when the
/// write extends past the current end, a pure in-extent overwrite leaves the
/// size untouched.
pub fn write(
    mp: &mut Mountpoint,
    path: &str,
    position: i64,
    data: &[u8],
) -> Result<u64, Errno> {
    let entry = find(mp, path)?.entry;
    let (mut header, mut meta, first) = read_file_header(mp, entry.block)?;

    let position = if position == -1 {
        header.size
    } else {
        position as u64
    };

    // writing past the end would need zero padding, which this revision does
    // not implement
    if position > header.size {
        return Err(Errno::ENOSYS);
    }

    if data.is_empty() {
        return Ok(position);
    }

    let block_size = mp.block_size();

    if first == BLOCK_EOF {
        write_new(mp, &entry, &mut header, &mut meta, data)?;
    } else {
        write_existing(mp, first, position, data)?;

        let end = position + data.len() as u64;
        if end > header.size {
            header.size = end;
        }
        meta[..core::mem::size_of::<FileHeader>()].copy_from_slice(bytemuck::bytes_of(&header));
        mp.write_block(entry.block, &meta)?;
    }

    // refresh the entry timestamps, writing both window blocks if the record
    // straddles
    let now = unix_now();
    let mut found = find(mp, path)?;
    found.entry.access_time = now;
    found.entry.mod_time = now;
    found.entry.write_at(&mut found.window, found.offset);
    commit_entry(mp, &found)?;

    Ok(position + data.len() as u64)
}

/// First write to an empty file: allocate the whole chain, fill it, link it
/// behind the header block.
fn write_new(
    mp: &mut Mountpoint,
    entry: &crate::fs::lxfs::disk::DirectoryEntry,
    header: &mut FileHeader,
    meta: &mut [u8],
    data: &[u8],
) -> CanFail<Errno> {
    let block_size = mp.block_size();
    let block_count = (data.len() as u64).div_ceil(block_size as u64);

    let first = mp.allocate(block_count)?;
    if first == 0 {
        return Err(Errno::ENOSPC);
    }

    let mut block = first;
    let mut buf = mp.block_buf();
    for chunk in data.chunks(block_size) {
        buf[..chunk.len()].copy_from_slice(chunk);
        buf[chunk.len()..].fill(0);

        block = mp.write_next_block(block, &buf)?;
        if block == 0 {
            return Err(Errno::EIO);
        }
    }

    header.size = data.len() as u64;
    meta[..core::mem::size_of::<FileHeader>()].copy_from_slice(bytemuck::bytes_of(header));
    mp.write_block(entry.block, meta)?;
    mp.set_next_block(entry.block, first)
}

/// Overwrites into the existing chain from `position`, allocating and
/// splicing additional blocks once the chain runs out.
fn write_existing(
    mp: &mut Mountpoint,
    first: u64,
    position: u64,
    data: &[u8],
) -> CanFail<Errno> {
    let block_size = mp.block_size();

    // locate the data block containing the write position, remembering the
    // last real block in case the chain must be extended
    let mut block = first;
    let mut last = first;
    let mut skip = position / block_size as u64;
    while skip > 0 && block != BLOCK_EOF {
        last = block;
        block = mp.next_block(block)?;
        if block == 0 {
            return Err(Errno::EIO);
        }
        skip -= 1;
    }

    let mut buf = mp.block_buf();
    let mut consumed = 0;
    let mut in_block = (position % block_size as u64) as usize;

    while consumed < data.len() && block != BLOCK_EOF && block != 0 {
        mp.read_block(block, &mut buf)?;

        let take = (data.len() - consumed).min(block_size - in_block);
        buf[in_block..in_block + take].copy_from_slice(&data[consumed..consumed + take]);
        consumed += take;
        in_block = 0;

        last = block;
        block = mp.write_next_block(block, &buf)?;
        if block == 0 {
            return Err(Errno::EIO);
        }
    }

    if consumed < data.len() {
        // allocate new blocks for the remaining bytes and splice them in
        // after the last written block
        let remaining = &data[consumed..];
        let block_count = (remaining.len() as u64).div_ceil(block_size as u64);

        let new_first = mp.allocate(block_count)?;
        if new_first == 0 {
            return Err(Errno::ENOSPC);
        }

        let mut new_block = new_first;
        for chunk in remaining.chunks(block_size) {
            buf[..chunk.len()].copy_from_slice(chunk);
            buf[chunk.len()..].fill(0);

            new_block = mp.write_next_block(new_block, &buf)?;
            if new_block == 0 {
                return Err(Errno::EIO);
            }
        }

        mp.set_next_block(last, new_first)?;
    }

    Ok(())
}

/// Reads `length` bytes from file offset zero for a mapping request; the
/// length is clamped to the file size.
pub fn mmap(mp: &mut Mountpoint, path: &str, length: u64) -> Result<Vec<u8>, Errno> {
    let entry = find(mp, path)?.entry;
    let (header, _, first) = read_file_header(mp, entry.block)?;

    let length = length.min(header.size) as usize;
    let block_size = mp.block_size();
    let block_count = length.div_ceil(block_size);

    let mut out = vec![0u8; length];
    let mut buf = mp.block_buf();
    let mut block = first;

    for i in 0..block_count {
        if block == BLOCK_EOF || block == 0 {
            break;
        }

        let next = mp.read_next_block(block, &mut buf)?;

        let at = i * block_size;
        let take = (length - at).min(block_size);
        out[at..at + take].copy_from_slice(&buf[..take]);

        block = next;
    }

    Ok(out)
}

/// Flushes every dirty cache slot along the entry's chain.
///
/// `close` suppresses `ENOENT`: the file may have been unlinked while still
/// open.
pub fn fsync(mp: &mut Mountpoint, path: &str, close: bool) -> CanFail<Errno> {
    let entry = match find(mp, path) {
        Ok(found) => found.entry,
        Err(Errno::ENOENT) if close => return Ok(()),
        Err(err) => return Err(err),
    };

    let mut block = entry.block;
    while block != 0 && block != BLOCK_EOF {
        mp.flush_block(block)?;

        block = mp.next_block(block)?;
        if block == 0 {
            return Err(Errno::EIO);
        }
    }

    Ok(())
}
