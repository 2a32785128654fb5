//! End-to-end scenarios against a freshly formatted in-memory volume.

use std::collections::BTreeSet;

use luxd::errors::Errno;
use luxd::fs::lxfs::create::{create_dir, create_file};
use luxd::fs::lxfs::dir::{self, DirIndex};
use luxd::fs::lxfs::mkfs::{mkfs, MkfsOptions};
use luxd::fs::lxfs::{attr, file, link, Mountpoint, RamDisk};
use luxd::ipc::wire::{S_IFDIR, S_IFLNK, S_IFMT};

/// 256 blocks of 2048 bytes: 512-byte sectors, four sectors per block, one
/// table block, root directory at block 34.
fn fresh_mp() -> Mountpoint {
    let mut disk = RamDisk::new(256 * 2048);
    mkfs(&mut disk, MkfsOptions::default()).unwrap();
    Mountpoint::mount("/dev/sd0", Box::new(disk)).unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn mount_and_stat_root() {
    let mut mp = fresh_mp();
    assert_eq!(mp.block_size(), 2048);
    assert_eq!(mp.sector_size(), 512);
    assert_eq!(mp.root(), 34);

    let status = attr::stat(&mut mp, "/").unwrap();
    assert_eq!({ status.st_mode } & S_IFMT, S_IFDIR);
    assert_eq!({ status.st_mode } & 0o777, 0o755);
    assert_eq!({ status.st_uid }, 0);
    assert_eq!({ status.st_gid }, 0);
}

#[test]
fn write_read_round_trip() {
    let mut mp = fresh_mp();
    create_file(&mut mp, "/a", 0o644, 0, 0).unwrap();

    let data = pattern(3000);
    let position = file::write(&mut mp, "/a", 0, &data).unwrap();
    assert_eq!(position, 3000);

    let read = file::read(&mut mp, "/a", 0, 3000).unwrap();
    assert_eq!(read, data);

    // a read crossing the end of file returns only the remaining bytes
    let tail = file::read(&mut mp, "/a", 2950, 100).unwrap();
    assert_eq!(tail.len(), 50);
    assert_eq!(tail, &data[2950..]);
}

#[test]
fn read_boundaries() {
    let mut mp = fresh_mp();
    create_file(&mut mp, "/a", 0o644, 0, 0).unwrap();
    file::write(&mut mp, "/a", 0, &pattern(3000)).unwrap();

    let last = file::read(&mut mp, "/a", 2999, 10).unwrap();
    assert_eq!(last, vec![(2999 % 251) as u8]);

    assert_eq!(file::read(&mut mp, "/a", 3000, 1), Err(Errno::EOVERFLOW));
}

#[test]
fn overwrite_preserves_size() {
    let mut mp = fresh_mp();
    create_file(&mut mp, "/a", 0o644, 0, 0).unwrap();
    file::write(&mut mp, "/a", 0, &pattern(3000)).unwrap();

    // a write fully inside the existing extent must not grow the file
    file::write(&mut mp, "/a", 100, &[0xAA; 64]).unwrap();
    let status = attr::stat(&mut mp, "/a").unwrap();
    assert_eq!({ status.st_size }, 3000);

    let read = file::read(&mut mp, "/a", 0, 3000).unwrap();
    assert_eq!(&read[100..164], &[0xAA; 64]);
    assert_eq!(read[99], pattern(3000)[99]);

    // extending past the end grows it to exactly offset + length
    file::write(&mut mp, "/a", 2990, &[0xBB; 20]).unwrap();
    let status = attr::stat(&mut mp, "/a").unwrap();
    assert_eq!({ status.st_size }, 3010);
}

#[test]
fn append_position_convention() {
    let mut mp = fresh_mp();
    create_file(&mut mp, "/a", 0o644, 0, 0).unwrap();
    file::write(&mut mp, "/a", 0, b"hello ").unwrap();

    // position -1 appends
    let position = file::write(&mut mp, "/a", -1, b"world").unwrap();
    assert_eq!(position, 11);
    assert_eq!(file::read(&mut mp, "/a", 0, 64).unwrap(), b"hello world");

    // writing past the end is unimplemented in this revision
    assert_eq!(file::write(&mut mp, "/a", 100, b"x"), Err(Errno::ENOSYS));
}

#[test]
fn crossing_block_directory() {
    let mut mp = fresh_mp();

    let mut expected = BTreeSet::new();
    for i in 0..200 {
        let path = format!("/f{i:04}");
        create_file(&mut mp, &path, 0o644, 0, 0).unwrap();
        expected.insert(format!("f{i:04}"));
    }

    assert_eq!(list_root(&mut mp), expected);
}

#[test]
fn straddling_entry_survives_unrelated_chmod() {
    let mut mp = fresh_mp();
    for i in 0..200 {
        create_file(&mut mp, &format!("/f{i:04}"), 0o644, 0, 0).unwrap();
    }

    let before = list_root(&mut mp);
    attr::chmod(&mut mp, "/f0000", 0o600, 0).unwrap();
    assert_eq!(list_root(&mut mp), before);

    let status = attr::stat(&mut mp, "/f0123").unwrap();
    assert_eq!({ status.st_mode } & 0o777, 0o644);
}

#[test]
fn hard_link_then_unlink() {
    let mut mp = fresh_mp();
    create_file(&mut mp, "/a", 0o644, 0, 0).unwrap();
    let data = pattern(1000);
    file::write(&mut mp, "/a", 0, &data).unwrap();

    link::link(&mut mp, "/a", "/b", 0, 0).unwrap();
    assert_eq!({ attr::stat(&mut mp, "/a").unwrap().st_nlink }, 2);
    assert_eq!({ attr::stat(&mut mp, "/b").unwrap().st_nlink }, 2);

    link::unlink(&mut mp, "/a", 0, 0).unwrap();
    assert_eq!(dir::find(&mut mp, "/a").err(), Some(Errno::ENOENT));
    assert_eq!({ attr::stat(&mut mp, "/b").unwrap().st_nlink }, 1);
    assert_eq!(file::read(&mut mp, "/b", 0, 1000).unwrap(), data);
}

#[test]
fn unlinking_last_name_frees_all_blocks() {
    let mut mp = fresh_mp();

    let free_before = attr::statvfs(&mut mp).unwrap().f_bfree;

    create_file(&mut mp, "/a", 0o644, 0, 0).unwrap();
    file::write(&mut mp, "/a", 0, &pattern(6000)).unwrap();
    link::link(&mut mp, "/a", "/b", 0, 0).unwrap();

    link::unlink(&mut mp, "/a", 0, 0).unwrap();
    let free_mid = attr::statvfs(&mut mp).unwrap().f_bfree;
    assert!(free_mid < free_before, "chain must survive the first unlink");

    link::unlink(&mut mp, "/b", 0, 0).unwrap();
    let free_after = attr::statvfs(&mut mp).unwrap().f_bfree;
    assert_eq!(free_after, free_before);
}

#[test]
fn mkdir_unlink_mkdir() {
    let mut mp = fresh_mp();

    create_dir(&mut mp, "/d", 0o755, 0, 0).unwrap();
    create_file(&mut mp, "/d/inner", 0o644, 0, 0).unwrap();

    // a populated directory refuses to go away
    assert_eq!(link::unlink(&mut mp, "/d", 0, 0), Err(Errno::ENOTEMPTY));

    link::unlink(&mut mp, "/d/inner", 0, 0).unwrap();
    link::unlink(&mut mp, "/d", 0, 0).unwrap();

    create_dir(&mut mp, "/d", 0o755, 0, 0).unwrap();
    let entry = dir::find(&mut mp, "/d").unwrap().entry;
    assert!(matches!(
        dir::read_index(&mut mp, entry.block, 0).unwrap(),
        DirIndex::End
    ));
}

#[test]
fn symlink_readlink_round_trip() {
    let mut mp = fresh_mp();
    create_file(&mut mp, "/a", 0o640, 0, 0).unwrap();

    link::symlink(&mut mp, "/a", "/l", 0, 0).unwrap();
    assert_eq!(link::readlink(&mut mp, "/l").unwrap(), b"/a");

    let status = attr::stat(&mut mp, "/l").unwrap();
    assert_eq!({ status.st_mode } & S_IFMT, S_IFLNK);
    assert_eq!({ status.st_size }, 2);

    // mode bits are inherited from the existing target
    assert_eq!({ status.st_mode } & 0o777, 0o640);

    // readlink on a regular file is invalid
    assert_eq!(link::readlink(&mut mp, "/a").err(), Some(Errno::EINVAL));
}

#[test]
fn chmod_chown_rules() {
    let mut mp = fresh_mp();
    create_file(&mut mp, "/a", 0o644, 0, 0).unwrap();
    attr::chown(&mut mp, "/a", 7, 7, 0).unwrap();

    // only the owner may change the mode
    assert_eq!(attr::chmod(&mut mp, "/a", 0o600, 3), Err(Errno::EPERM));
    attr::chmod(&mut mp, "/a", 0o600, 7).unwrap();
    assert_eq!({ attr::stat(&mut mp, "/a").unwrap().st_mode } & 0o777, 0o600);

    // (-1, -1) is a no-op regardless of caller
    attr::chown(&mut mp, "/a", -1, -1, 99).unwrap();

    attr::chown(&mut mp, "/a", 8, 9, 7).unwrap();
    let status = attr::stat(&mut mp, "/a").unwrap();
    assert_eq!({ status.st_uid }, 8);
    assert_eq!({ status.st_gid }, 9);
}

#[test]
fn utime_updates_entry_and_header() {
    let mut mp = fresh_mp();
    create_dir(&mut mp, "/d", 0o755, 0, 0).unwrap();

    attr::utime(&mut mp, "/d", 111, 222, 0, 0).unwrap();
    let status = attr::stat(&mut mp, "/d").unwrap();
    assert_eq!({ status.st_atime }, 111);
    assert_eq!({ status.st_mtime }, 222);
}

#[test]
fn opendir_follows_one_symlink_and_checks_execute() {
    let mut mp = fresh_mp();
    create_dir(&mut mp, "/d", 0o755, 0, 0).unwrap();
    link::symlink(&mut mp, "/d", "/dl", 0, 0).unwrap();

    dir::opendir(&mut mp, "/d", 0, 0).unwrap();
    dir::opendir(&mut mp, "/dl", 0, 0).unwrap();

    create_file(&mut mp, "/plain", 0o644, 0, 0).unwrap();
    assert_eq!(dir::opendir(&mut mp, "/plain", 0, 0), Err(Errno::ENOTDIR));

    // no execute bit for others
    create_dir(&mut mp, "/locked", 0o750, 0, 0).unwrap();
    attr::chown(&mut mp, "/locked", 5, 5, 0).unwrap();
    assert_eq!(dir::opendir(&mut mp, "/locked", 9, 9), Err(Errno::EPERM));
}

#[test]
fn mmap_reads_from_offset_zero_clamped() {
    let mut mp = fresh_mp();
    create_file(&mut mp, "/a", 0o644, 0, 0).unwrap();
    let data = pattern(3000);
    file::write(&mut mp, "/a", 0, &data).unwrap();

    // the mapping length is clamped to the file size
    let mapped = file::mmap(&mut mp, "/a", 5000).unwrap();
    assert_eq!(mapped, data);

    let mapped = file::mmap(&mut mp, "/a", 100).unwrap();
    assert_eq!(mapped, &data[..100]);
}

#[test]
fn fsync_close_variant_suppresses_enoent() {
    let mut mp = fresh_mp();
    create_file(&mut mp, "/a", 0o644, 0, 0).unwrap();
    file::write(&mut mp, "/a", 0, &pattern(100)).unwrap();

    file::fsync(&mut mp, "/a", false).unwrap();

    assert_eq!(file::fsync(&mut mp, "/gone", false), Err(Errno::ENOENT));
    file::fsync(&mut mp, "/gone", true).unwrap();
}

#[test]
fn nested_directories_resolve() {
    let mut mp = fresh_mp();
    create_dir(&mut mp, "/etc", 0o755, 0, 0).unwrap();
    create_dir(&mut mp, "/etc/conf.d", 0o755, 0, 0).unwrap();
    create_file(&mut mp, "/etc/conf.d/net", 0o644, 0, 0).unwrap();

    file::write(&mut mp, "/etc/conf.d/net", 0, b"iface=eth0\n").unwrap();
    assert_eq!(
        file::read(&mut mp, "/etc/conf.d/net", 0, 64).unwrap(),
        b"iface=eth0\n"
    );

    // a file used as an intermediate component is not a directory
    assert_eq!(
        dir::find(&mut mp, "/etc/conf.d/net/x").err(),
        Some(Errno::ENOTDIR)
    );
}

fn list_root(mp: &mut Mountpoint) -> BTreeSet<String> {
    let root = dir::find(mp, "/").unwrap().entry.block;
    let mut names = BTreeSet::new();
    let mut index = 0;
    loop {
        match dir::read_index(mp, root, index).unwrap() {
            DirIndex::Entry { name, .. } => {
                names.insert(name);
                index += 1;
            }
            DirIndex::End => break,
        }
    }
    names
}
