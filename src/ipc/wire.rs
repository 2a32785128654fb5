//! Command structures sent over the server sockets.
//!
//! These are raw packed layouts; field order and the absence of padding are
//! asserted below each definition. Commands that move bulk data (`read`,
//! `write`, `mmap`, the storage-device transfers) append a variable payload
//! after the fixed structure, covered by the envelope's `length`.

use bytemuck::{Pod, Zeroable};

use crate::ipc::message::{MessageHeader, Opcode, SyscallHeader};
use crate::ipc::put_str;

/// Longest path accepted on the wire, terminator included.
pub const MAX_FILE_PATH: usize = 1024;

/// Bound on simultaneously registered filesystem drivers.
pub const MAX_FILE_SYSTEMS: usize = 32;

pub const S_IFMT: u32 = 0xF000;
pub const S_IFCHR: u32 = 0x2000;
pub const S_IFDIR: u32 = 0x4000;
pub const S_IFBLK: u32 = 0x6000;
pub const S_IFREG: u32 = 0x8000;
pub const S_IFLNK: u32 = 0xA000;

pub const S_IRUSR: u32 = 0o400;
pub const S_IWUSR: u32 = 0o200;
pub const S_IXUSR: u32 = 0o100;
pub const S_IRGRP: u32 = 0o040;
pub const S_IWGRP: u32 = 0o020;
pub const S_IXGRP: u32 = 0o010;
pub const S_IROTH: u32 = 0o004;
pub const S_IWOTH: u32 = 0o002;
pub const S_IXOTH: u32 = 0o001;

/// `statvfs` mount flag: setuid bits are ignored on this volume.
pub const ST_NOSUID: u64 = 0x02;

/// POSIX `stat`-shaped projection of a file.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct FileStatus {
    pub st_dev: u64,
    pub st_ino: u64,
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_rdev: u64,
    pub st_size: u64,
    pub st_atime: u64,
    pub st_mtime: u64,
    pub st_ctime: u64,
    pub st_blksize: u64,
    pub st_blocks: u64,
}

const _: () = assert!(core::mem::size_of::<FileStatus>() == 88);

/// POSIX `statvfs`-shaped projection of a mounted volume.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct StatvfsBuffer {
    pub f_bsize: u64,
    pub f_frsize: u64,
    pub f_blocks: u64,
    pub f_bfree: u64,
    pub f_bavail: u64,
    pub f_files: u64,
    pub f_ffree: u64,
    pub f_favail: u64,
    pub f_fsid: u64,
    pub f_flag: u64,
    pub f_namemax: u64,
}

const _: () = assert!(core::mem::size_of::<StatvfsBuffer>() == 88);

/// One directory entry as returned by `readdir`.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct Dirent {
    pub d_ino: u64,
    pub d_name: [u8; 512],
}

const _: () = assert!(core::mem::size_of::<Dirent>() == 520);

/// Log line forwarded to the kernel; the message text trails the structure.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct LogCommand {
    pub header: MessageHeader,
    pub level: i32,
    pub server: [u8; 64],
}

const _: () = assert!(
    core::mem::size_of::<LogCommand>() == core::mem::size_of::<MessageHeader>() + 4 + 64
);

/// Filesystem-type advertisement sent by a filesystem server right after it
/// connects to the VFS router.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct VfsInitCommand {
    pub header: MessageHeader,
    pub fs_type: [u8; 16],
}

const _: () = assert!(
    core::mem::size_of::<VfsInitCommand>() == core::mem::size_of::<MessageHeader>() + 16
);

impl VfsInitCommand {
    #[must_use]
    pub fn new(fs_type: &str, requester: i32) -> Self {
        let mut cmd = Self::zeroed();
        cmd.header = MessageHeader::request(Opcode::VfsInit, requester);
        cmd.header.length = core::mem::size_of::<Self>() as u16;
        put_str(&mut cmd.fs_type, fs_type);
        cmd
    }
}

/// `mount()` request: attach `source` (a device path) at `target`.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct MountCommand {
    pub header: SyscallHeader,
    pub source: [u8; MAX_FILE_PATH],
    pub target: [u8; MAX_FILE_PATH],
    pub fs_type: [u8; 16],
    pub flags: u64,
}

const _: () = assert!(
    core::mem::size_of::<MountCommand>()
        == core::mem::size_of::<SyscallHeader>() + 2 * MAX_FILE_PATH + 16 + 8
);

impl MountCommand {
    #[must_use]
    pub fn request(source: &str, target: &str, fs_type: &str, flags: u64) -> Self {
        let mut cmd = Self::zeroed();
        cmd.header.header = MessageHeader::request(Opcode::Mount, 0);
        cmd.header.header.length = core::mem::size_of::<Self>() as u16;
        put_str(&mut cmd.source, source);
        put_str(&mut cmd.target, target);
        put_str(&mut cmd.fs_type, fs_type);
        cmd.flags = flags;
        cmd
    }
}

/// `stat()` request; the projection comes back in `status`.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct StatCommand {
    pub header: SyscallHeader,
    pub source: [u8; MAX_FILE_PATH],
    pub path: [u8; MAX_FILE_PATH],
    pub status: FileStatus,
}

const _: () = assert!(
    core::mem::size_of::<StatCommand>()
        == core::mem::size_of::<SyscallHeader>()
            + 2 * MAX_FILE_PATH
            + core::mem::size_of::<FileStatus>()
);

/// `open()` request. The filesystem server only verifies the path; open file
/// state belongs to the kernel.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct OpenCommand {
    pub header: SyscallHeader,
    pub abspath: [u8; MAX_FILE_PATH],
    pub path: [u8; MAX_FILE_PATH],
    pub device: [u8; MAX_FILE_PATH],
    pub flags: u32,
    pub mode: u32,
    pub uid: u16,
    pub gid: u16,
    pub id: u64,
    pub char_dev: u8,
}

const _: () = assert!(
    core::mem::size_of::<OpenCommand>()
        == core::mem::size_of::<SyscallHeader>() + 3 * MAX_FILE_PATH + 4 + 4 + 2 + 2 + 8 + 1
);

/// `read()`/`write()` request. Write data and read results trail the
/// structure.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct RWCommand {
    pub header: SyscallHeader,
    pub device: [u8; MAX_FILE_PATH],
    pub path: [u8; MAX_FILE_PATH],
    pub position: i64,
    pub length: u64,
    pub id: u64,
    pub silent: u8,
}

const _: () = assert!(
    core::mem::size_of::<RWCommand>()
        == core::mem::size_of::<SyscallHeader>() + 2 * MAX_FILE_PATH + 8 + 8 + 8 + 1
);

impl RWCommand {
    #[must_use]
    pub fn request(op: Opcode, path: &str, position: i64, length: u64) -> Self {
        let mut cmd = Self::zeroed();
        cmd.header.header = MessageHeader::request(op, 0);
        cmd.header.header.length = core::mem::size_of::<Self>() as u16;
        put_str(&mut cmd.path, path);
        cmd.position = position;
        cmd.length = length;
        cmd
    }
}

/// `ioctl()` request, only meaningful for device files.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct IoctlCommand {
    pub header: SyscallHeader,
    pub path: [u8; MAX_FILE_PATH],
    pub device: [u8; MAX_FILE_PATH],
    pub opcode: u64,
    pub arg: u64,
    pub id: u64,
}

const _: () = assert!(
    core::mem::size_of::<IoctlCommand>()
        == core::mem::size_of::<SyscallHeader>() + 2 * MAX_FILE_PATH + 24
);

/// `opendir()` request.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct OpendirCommand {
    pub header: SyscallHeader,
    pub abspath: [u8; MAX_FILE_PATH],
    pub path: [u8; MAX_FILE_PATH],
    pub device: [u8; MAX_FILE_PATH],
    pub uid: u16,
    pub gid: u16,
}

const _: () = assert!(
    core::mem::size_of::<OpendirCommand>()
        == core::mem::size_of::<SyscallHeader>() + 3 * MAX_FILE_PATH + 4
);

/// `readdir_r()` request: one entry per call, by index.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct ReaddirCommand {
    pub header: SyscallHeader,
    pub path: [u8; MAX_FILE_PATH],
    pub device: [u8; MAX_FILE_PATH],
    pub position: u64,
    pub end: u8,
    pub entry: Dirent,
}

const _: () = assert!(
    core::mem::size_of::<ReaddirCommand>()
        == core::mem::size_of::<SyscallHeader>()
            + 2 * MAX_FILE_PATH
            + 8
            + 1
            + core::mem::size_of::<Dirent>()
);

/// `chmod()` request.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct ChmodCommand {
    pub header: SyscallHeader,
    pub path: [u8; MAX_FILE_PATH],
    pub device: [u8; MAX_FILE_PATH],
    pub mode: u32,
    pub uid: u16,
    pub gid: u16,
}

const _: () = assert!(
    core::mem::size_of::<ChmodCommand>()
        == core::mem::size_of::<SyscallHeader>() + 2 * MAX_FILE_PATH + 8
);

/// `chown()` request; `(-1, -1)` is a no-op.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct ChownCommand {
    pub header: SyscallHeader,
    pub path: [u8; MAX_FILE_PATH],
    pub device: [u8; MAX_FILE_PATH],
    pub new_uid: i32,
    pub new_gid: i32,
    pub uid: u16,
    pub gid: u16,
}

const _: () = assert!(
    core::mem::size_of::<ChownCommand>()
        == core::mem::size_of::<SyscallHeader>() + 2 * MAX_FILE_PATH + 12
);

/// `link()` and `symlink()` request.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct LinkCommand {
    pub header: SyscallHeader,
    pub old_path: [u8; MAX_FILE_PATH],
    pub new_path: [u8; MAX_FILE_PATH],
    pub device: [u8; MAX_FILE_PATH],
    pub uid: u16,
    pub gid: u16,
}

const _: () = assert!(
    core::mem::size_of::<LinkCommand>()
        == core::mem::size_of::<SyscallHeader>() + 3 * MAX_FILE_PATH + 4
);

/// `mkdir()` request.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct MkdirCommand {
    pub header: SyscallHeader,
    pub path: [u8; MAX_FILE_PATH],
    pub device: [u8; MAX_FILE_PATH],
    pub mode: u32,
    pub uid: u16,
    pub gid: u16,
}

const _: () = assert!(
    core::mem::size_of::<MkdirCommand>()
        == core::mem::size_of::<SyscallHeader>() + 2 * MAX_FILE_PATH + 8
);

/// `utime()` request.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct UtimeCommand {
    pub header: SyscallHeader,
    pub path: [u8; MAX_FILE_PATH],
    pub device: [u8; MAX_FILE_PATH],
    pub access_time: u64,
    pub modified_time: u64,
    pub uid: u16,
    pub gid: u16,
}

const _: () = assert!(
    core::mem::size_of::<UtimeCommand>()
        == core::mem::size_of::<SyscallHeader>() + 2 * MAX_FILE_PATH + 20
);

/// `mmap()` request; the mapped bytes trail the response.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct MmapCommand {
    pub header: SyscallHeader,
    pub path: [u8; MAX_FILE_PATH],
    pub device: [u8; MAX_FILE_PATH],
    pub len: u64,
    pub off: u64,
    pub response_type: i32,
    pub mmio: u8,
}

const _: () = assert!(
    core::mem::size_of::<MmapCommand>()
        == core::mem::size_of::<SyscallHeader>() + 2 * MAX_FILE_PATH + 21
);

/// `unlink()` request.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct UnlinkCommand {
    pub header: SyscallHeader,
    pub path: [u8; MAX_FILE_PATH],
    pub device: [u8; MAX_FILE_PATH],
    pub uid: u16,
    pub gid: u16,
}

const _: () = assert!(
    core::mem::size_of::<UnlinkCommand>()
        == core::mem::size_of::<SyscallHeader>() + 2 * MAX_FILE_PATH + 4
);

/// `readlink()` request; the target comes back in `path`, its length in
/// `status`.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct ReadLinkCommand {
    pub header: SyscallHeader,
    pub path: [u8; MAX_FILE_PATH],
    pub device: [u8; MAX_FILE_PATH],
}

const _: () = assert!(
    core::mem::size_of::<ReadLinkCommand>()
        == core::mem::size_of::<SyscallHeader>() + 2 * MAX_FILE_PATH
);

/// `fsync()` request. The `close` variant suppresses `ENOENT`, the file may
/// have been unlinked while still open.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct FsyncCommand {
    pub header: SyscallHeader,
    pub path: [u8; MAX_FILE_PATH],
    pub device: [u8; MAX_FILE_PATH],
    pub close: u8,
}

const _: () = assert!(
    core::mem::size_of::<FsyncCommand>()
        == core::mem::size_of::<SyscallHeader>() + 2 * MAX_FILE_PATH + 1
);

/// `statvfs()` request.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct StatvfsCommand {
    pub header: SyscallHeader,
    pub device: [u8; MAX_FILE_PATH],
    pub buffer: StatvfsBuffer,
}

const _: () = assert!(
    core::mem::size_of::<StatvfsCommand>()
        == core::mem::size_of::<SyscallHeader>()
            + MAX_FILE_PATH
            + core::mem::size_of::<StatvfsBuffer>()
);

/// Device-node registration sent by a driver to the device-file namespace.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct DevfsRegisterCommand {
    pub header: MessageHeader,
    pub path: [u8; 256],
    pub server: [u8; 256],
    pub status: FileStatus,
    pub handle_open: u8,
}

const _: () = assert!(
    core::mem::size_of::<DevfsRegisterCommand>()
        == core::mem::size_of::<MessageHeader>() + 512 + core::mem::size_of::<FileStatus>() + 1
);

/// In-place update of a device node's status.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct DevfsChstatCommand {
    pub header: MessageHeader,
    pub path: [u8; 256],
    pub status: FileStatus,
}

const _: () = assert!(
    core::mem::size_of::<DevfsChstatCommand>()
        == core::mem::size_of::<MessageHeader>() + 256 + core::mem::size_of::<FileStatus>()
);

/// Storage-device registration sent by a hardware driver to the
/// storage-device layer. `device` is opaque to the receiver.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct SDevRegisterCommand {
    pub header: MessageHeader,
    pub server: [u8; 256],
    pub device: u64,
    pub size: u64,
    pub sector_size: u16,
    pub partitions: i32,
}

const _: () = assert!(
    core::mem::size_of::<SDevRegisterCommand>()
        == core::mem::size_of::<MessageHeader>() + 256 + 8 + 8 + 2 + 4
);

/// Sector-granular transfer between the storage-device layer and a hardware
/// driver. Write data and read results trail the structure.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C, packed)]
pub struct SDevRWCommand {
    pub header: MessageHeader,
    pub syscall: u16,
    pub device: u64,
    pub start: u64,
    pub count: u64,
    pub pid: i32,
    pub partition: i32,
    pub partition_start: u64,
    pub sector_size: u64,
}

const _: () = assert!(
    core::mem::size_of::<SDevRWCommand>()
        == core::mem::size_of::<MessageHeader>() + 2 + 8 + 8 + 8 + 4 + 4 + 8 + 8
);
