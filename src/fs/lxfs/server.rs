//! LXFS message dispatch.
//!
//! The server owns the mounted volumes and serves the syscall commands the
//! VFS router relays. Every handler flips the envelope into a response,
//! writes the outcome into `status`, and hands the frame back to be sent on
//! the same logical path.

use crate::errors::Errno;
use crate::fs::lxfs::{attr, create, dir, file, link};
use crate::fs::lxfs::{Mountpoint, VolumeSource};
use crate::ipc::message::Opcode;
use crate::ipc::wire::{
    ChmodCommand, ChownCommand, FsyncCommand, LinkCommand, MkdirCommand, MmapCommand,
    MountCommand, OpenCommand, OpendirCommand, RWCommand, ReadLinkCommand, ReaddirCommand,
    StatCommand, StatvfsCommand, UnlinkCommand, UtimeCommand, VfsInitCommand,
};
use crate::ipc::{decode, encode, get_str, peek_header, put_str};
use crate::{error, warn};

/// The filesystem type this server advertises to the VFS router.
pub const FS_TYPE: &str = "lxfs";

pub struct LxfsServer {
    mounts: Vec<Mountpoint>,
    source: Box<dyn VolumeSource>,
}

impl LxfsServer {
    #[must_use]
    pub fn new(source: Box<dyn VolumeSource>) -> Self {
        Self {
            mounts: Vec::new(),
            source,
        }
    }

    /// The type-advertisement frame sent to the VFS router at startup.
    #[must_use]
    pub fn init_frame(&self) -> Vec<u8> {
        encode(&VfsInitCommand::new(FS_TYPE, 0), &[])
    }

    fn find_mp(&mut self, device: &str) -> Result<&mut Mountpoint, Errno> {
        self.mounts
            .iter_mut()
            .find(|mp| mp.device() == device)
            .ok_or(Errno::EIO)
    }

    /// Handles one relayed frame and returns the response frame.
    pub fn handle(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let header = peek_header(frame)?;
        let opcode = Opcode::from_wire(header.command)?;

        match opcode {
            Opcode::Mount => self.mount(frame),
            Opcode::Open => self.open(frame),
            Opcode::Read => self.read(frame),
            Opcode::Write => self.write(frame),
            Opcode::Stat => self.stat(frame),
            Opcode::Opendir => self.opendir(frame),
            Opcode::Readdir => self.readdir(frame),
            Opcode::Mmap => self.mmap(frame),
            Opcode::Chmod => self.chmod(frame),
            Opcode::Chown => self.chown(frame),
            Opcode::Mkdir => self.mkdir(frame),
            Opcode::Utime => self.utime(frame),
            Opcode::Link => self.link(frame),
            Opcode::Unlink => self.unlink(frame),
            Opcode::Symlink => self.symlink(frame),
            Opcode::Readlink => self.readlink(frame),
            Opcode::Fsync => self.fsync(frame),
            Opcode::Statvfs => self.statvfs(frame),
            _ => {
                warn!("lxfs", "unimplemented command {:#06X}", { header.command });
                let mut header = header;
                header.into_response(core::mem::size_of_val(&header));
                header.status = Errno::ENOSYS.status();
                Some(encode(&header, &[]))
            }
        }
    }

    fn mount(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<MountCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<MountCommand>());

        let source = get_str(&cmd.source).to_string();
        cmd.header.header.status = match self
            .source
            .open(&source)
            .and_then(|volume| Mountpoint::mount(&source, volume))
        {
            Ok(mp) => {
                self.mounts.push(mp);
                0
            }
            Err(err) => {
                error!("lxfs", "failed to mount {source}: {err}");
                err.status()
            }
        };

        Some(encode(&cmd, &[]))
    }

    fn open(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<OpenCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<OpenCommand>());

        let device = get_str(&cmd.device).to_string();
        let path = get_str(&cmd.path).to_string();

        // the kernel owns the open file description; the server only
        // verifies that the path resolves
        cmd.header.header.status = match self
            .find_mp(&device)
            .and_then(|mp| dir::find(mp, &path))
        {
            Ok(_) => 0,
            Err(err) => err.status(),
        };

        Some(encode(&cmd, &[]))
    }

    fn read(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<RWCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<RWCommand>());

        let device = get_str(&cmd.device).to_string();
        let path = get_str(&cmd.path).to_string();
        let position = cmd.position;
        let length = cmd.length;

        match self
            .find_mp(&device)
            .and_then(|mp| file::read(mp, &path, position as u64, length))
        {
            Ok(data) => {
                cmd.position = position + data.len() as i64;
                cmd.length = data.len() as u64;
                cmd.header.header.status = data.len() as u64;
                cmd.header
                    .header
                    .into_response(core::mem::size_of::<RWCommand>() + data.len());
                Some(encode(&cmd, &data))
            }
            Err(err) => {
                cmd.header.header.status = err.status();
                Some(encode(&cmd, &[]))
            }
        }
    }

    fn write(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, payload) = decode::<RWCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<RWCommand>());

        let device = get_str(&cmd.device).to_string();
        let path = get_str(&cmd.path).to_string();
        let position = cmd.position;
        let data = &payload[..payload.len().min(cmd.length as usize)];

        match self
            .find_mp(&device)
            .and_then(|mp| file::write(mp, &path, position, data))
        {
            Ok(new_position) => {
                cmd.position = new_position as i64;
                cmd.header.header.status = data.len() as u64;
            }
            Err(err) => cmd.header.header.status = err.status(),
        }

        Some(encode(&cmd, &[]))
    }

    fn stat(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<StatCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<StatCommand>());

        let device = get_str(&cmd.source).to_string();
        let path = get_str(&cmd.path).to_string();

        match self.find_mp(&device).and_then(|mp| attr::stat(mp, &path)) {
            Ok(status) => {
                cmd.status = status;
                cmd.header.header.status = 0;
            }
            Err(err) => cmd.header.header.status = err.status(),
        }

        Some(encode(&cmd, &[]))
    }

    fn opendir(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<OpendirCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<OpendirCommand>());

        let device = get_str(&cmd.device).to_string();
        let path = get_str(&cmd.path).to_string();
        let uid = cmd.uid;
        let gid = cmd.gid;

        cmd.header.header.status = match self
            .find_mp(&device)
            .and_then(|mp| dir::opendir(mp, &path, uid, gid))
        {
            Ok(()) => 0,
            Err(err) => err.status(),
        };

        Some(encode(&cmd, &[]))
    }

    fn readdir(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<ReaddirCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<ReaddirCommand>());

        let device = get_str(&cmd.device).to_string();
        let path = get_str(&cmd.path).to_string();
        let position = cmd.position;

        // indexes 0 and 1 are always the synthetic '.' and '..'
        if position < 2 {
            put_str(&mut cmd.entry.d_name, if position == 0 { "." } else { ".." });
            cmd.entry.d_ino = position + 1;
            cmd.position = position + 1;
            cmd.end = 0;
            cmd.header.header.status = 0;
            return Some(encode(&cmd, &[]));
        }

        let outcome = self.find_mp(&device).and_then(|mp| {
            let entry = dir::find(mp, &path)?.entry;
            if entry.entry_type() != crate::fs::lxfs::disk::EntryType::Directory {
                return Err(Errno::ENOTDIR);
            }
            dir::read_index(mp, entry.block, position - 2)
        });

        match outcome {
            Ok(dir::DirIndex::Entry { name, ino }) => {
                put_str(&mut cmd.entry.d_name, &name);
                cmd.entry.d_ino = ino;
                cmd.position = position + 1;
                cmd.end = 0;
                cmd.header.header.status = 0;
            }
            Ok(dir::DirIndex::End) => {
                cmd.end = 1;
                cmd.header.header.status = 0;
            }
            Err(err) => cmd.header.header.status = err.status(),
        }

        Some(encode(&cmd, &[]))
    }

    fn mmap(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<MmapCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<MmapCommand>());

        let device = get_str(&cmd.device).to_string();
        let path = get_str(&cmd.path).to_string();
        let len = cmd.len;

        match self.find_mp(&device).and_then(|mp| file::mmap(mp, &path, len)) {
            Ok(data) => {
                // a plain memory buffer: not MMIO, not shared
                cmd.response_type = 0;
                cmd.mmio = 0;
                cmd.len = data.len() as u64;
                cmd.header.header.status = 0;
                cmd.header
                    .header
                    .into_response(core::mem::size_of::<MmapCommand>() + data.len());
                Some(encode(&cmd, &data))
            }
            Err(err) => {
                cmd.header.header.status = err.status();
                Some(encode(&cmd, &[]))
            }
        }
    }

    fn chmod(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<ChmodCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<ChmodCommand>());

        let device = get_str(&cmd.device).to_string();
        let path = get_str(&cmd.path).to_string();
        let mode = cmd.mode;
        let uid = cmd.uid;

        cmd.header.header.status = match self
            .find_mp(&device)
            .and_then(|mp| attr::chmod(mp, &path, mode, uid))
        {
            Ok(()) => 0,
            Err(err) => err.status(),
        };

        Some(encode(&cmd, &[]))
    }

    fn chown(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<ChownCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<ChownCommand>());

        let device = get_str(&cmd.device).to_string();
        let path = get_str(&cmd.path).to_string();
        let new_uid = cmd.new_uid;
        let new_gid = cmd.new_gid;
        let uid = cmd.uid;

        cmd.header.header.status = match self
            .find_mp(&device)
            .and_then(|mp| attr::chown(mp, &path, new_uid, new_gid, uid))
        {
            Ok(()) => 0,
            Err(err) => err.status(),
        };

        Some(encode(&cmd, &[]))
    }

    fn mkdir(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<MkdirCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<MkdirCommand>());

        let device = get_str(&cmd.device).to_string();
        let path = get_str(&cmd.path).to_string();
        let mode = cmd.mode;
        let uid = cmd.uid;
        let gid = cmd.gid;

        cmd.header.header.status = match self
            .find_mp(&device)
            .and_then(|mp| create::create_dir(mp, &path, mode, uid, gid))
        {
            Ok(()) => 0,
            Err(err) => err.status(),
        };

        Some(encode(&cmd, &[]))
    }

    fn utime(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<UtimeCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<UtimeCommand>());

        let device = get_str(&cmd.device).to_string();
        let path = get_str(&cmd.path).to_string();
        let access_time = cmd.access_time;
        let modified_time = cmd.modified_time;
        let uid = cmd.uid;
        let gid = cmd.gid;

        cmd.header.header.status = match self
            .find_mp(&device)
            .and_then(|mp| attr::utime(mp, &path, access_time, modified_time, uid, gid))
        {
            Ok(()) => 0,
            Err(err) => err.status(),
        };

        Some(encode(&cmd, &[]))
    }

    fn link(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<LinkCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<LinkCommand>());

        let device = get_str(&cmd.device).to_string();
        let old_path = get_str(&cmd.old_path).to_string();
        let new_path = get_str(&cmd.new_path).to_string();
        let uid = cmd.uid;
        let gid = cmd.gid;

        cmd.header.header.status = match self
            .find_mp(&device)
            .and_then(|mp| link::link(mp, &old_path, &new_path, uid, gid))
        {
            Ok(()) => 0,
            Err(err) => err.status(),
        };

        Some(encode(&cmd, &[]))
    }

    fn unlink(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<UnlinkCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<UnlinkCommand>());

        let device = get_str(&cmd.device).to_string();
        let path = get_str(&cmd.path).to_string();
        let uid = cmd.uid;
        let gid = cmd.gid;

        cmd.header.header.status = match self
            .find_mp(&device)
            .and_then(|mp| link::unlink(mp, &path, uid, gid))
        {
            Ok(()) => 0,
            Err(err) => err.status(),
        };

        Some(encode(&cmd, &[]))
    }

    fn symlink(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<LinkCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<LinkCommand>());

        let device = get_str(&cmd.device).to_string();
        let old_path = get_str(&cmd.old_path).to_string();
        let new_path = get_str(&cmd.new_path).to_string();
        let uid = cmd.uid;
        let gid = cmd.gid;

        cmd.header.header.status = match self
            .find_mp(&device)
            .and_then(|mp| link::symlink(mp, &old_path, &new_path, uid, gid))
        {
            Ok(()) => 0,
            Err(err) => err.status(),
        };

        Some(encode(&cmd, &[]))
    }

    fn readlink(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<ReadLinkCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<ReadLinkCommand>());

        let device = get_str(&cmd.device).to_string();
        let path = get_str(&cmd.path).to_string();

        match self.find_mp(&device).and_then(|mp| link::readlink(mp, &path)) {
            Ok(target) => {
                let len = target.len().min(cmd.path.len());
                cmd.path.fill(0);
                cmd.path[..len].copy_from_slice(&target[..len]);
                cmd.header.header.status = len as u64;
            }
            Err(err) => cmd.header.header.status = err.status(),
        }

        Some(encode(&cmd, &[]))
    }

    fn fsync(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<FsyncCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<FsyncCommand>());

        let device = get_str(&cmd.device).to_string();
        let path = get_str(&cmd.path).to_string();
        let close = cmd.close != 0;

        cmd.header.header.status = match self
            .find_mp(&device)
            .and_then(|mp| file::fsync(mp, &path, close))
        {
            Ok(()) => 0,
            Err(err) => err.status(),
        };

        Some(encode(&cmd, &[]))
    }

    fn statvfs(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<StatvfsCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<StatvfsCommand>());

        let device = get_str(&cmd.device).to_string();

        match self.find_mp(&device).and_then(attr::statvfs) {
            Ok(buffer) => {
                cmd.buffer = buffer;
                cmd.header.header.status = 0;
            }
            Err(err) => cmd.header.header.status = err.status(),
        }

        Some(encode(&cmd, &[]))
    }
}
