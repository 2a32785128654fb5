//! Microkernel server implementing a virtual file system.
//!
//! The router receives POSIX-shaped syscall messages from the kernel shim,
//! resolves each path against the mountpoint table, rewrites it to be
//! mount-relative, and relays the message to the filesystem server owning the
//! resolved type. Responses travel the reverse path; successful MOUNT
//! responses append a mountpoint entry on their way through.

use hashbrown::HashMap;

use crate::errors::Errno;
use crate::ipc::message::Opcode;
use crate::ipc::wire::{
    IoctlCommand, LinkCommand, MountCommand, VfsInitCommand, MAX_FILE_SYSTEMS,
};
use crate::ipc::{decode, encode, get_str, peek_header, put_str, Transport};
use crate::{error, info, warn};

/// Bound on the mountpoint table.
pub const MAX_MOUNTPOINTS: usize = 128;

/// A record binding a path prefix to a device path and a filesystem type.
#[derive(Clone, Debug)]
pub struct Mountpoint {
    pub device: String,
    pub path: String,
    pub fs_type: String,
    pub flags: u64,
    pub valid: bool,
}

/// One connected filesystem server; its type is known once it sends
/// VFS_INIT.
struct FsServer {
    link: Box<dyn Transport>,
    fs_type: Option<String>,
}

/// Result of resolving an absolute path against the mountpoint table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolved {
    pub fs_type: String,
    pub device: String,
    pub path: String,
}

pub struct VfsServer {
    lumen: Box<dyn Transport>,
    servers: Vec<FsServer>,
    by_type: HashMap<String, usize>,
    mounts: Vec<Mountpoint>,
}

impl VfsServer {
    #[must_use]
    pub fn new(lumen: Box<dyn Transport>) -> Self {
        Self {
            lumen,
            servers: Vec::new(),
            by_type: HashMap::new(),
            mounts: Vec::new(),
        }
    }

    /// Accepts a new filesystem-server connection; its type is learned from
    /// the VFS_INIT it sends next.
    pub fn accept(&mut self, link: Box<dyn Transport>) {
        if self.servers.len() >= MAX_FILE_SYSTEMS {
            warn!("vfs", "file system server table is full, dropping connection");
            return;
        }

        self.servers.push(FsServer {
            link,
            fs_type: None,
        });
    }

    #[must_use]
    pub fn mounts(&self) -> &[Mountpoint] {
        &self.mounts
    }

    /// Resolves an absolute path to `(filesystem type, device, relative
    /// path)` using the longest matching mount prefix.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<Resolved> {
        let mut best: Option<&Mountpoint> = None;

        for mount in self.mounts.iter().filter(|m| m.valid) {
            let matches = if mount.path == "/" {
                true
            } else {
                path == mount.path
                    || (path.starts_with(&mount.path)
                        && path.as_bytes().get(mount.path.len()) == Some(&b'/'))
            };

            if matches && best.map_or(true, |b| mount.path.len() > b.path.len()) {
                best = Some(mount);
            }
        }

        let mount = best?;
        let stripped = if mount.path == "/" {
            path.to_string()
        } else {
            let rest = &path[mount.path.len()..];
            if rest.is_empty() {
                "/".to_string()
            } else {
                rest.to_string()
            }
        };

        Some(Resolved {
            fs_type: mount.fs_type.clone(),
            device: mount.device.clone(),
            path: stripped,
        })
    }

    fn server_for(&mut self, fs_type: &str) -> Option<&mut FsServer> {
        let index = *self.by_type.get(fs_type)?;
        self.servers.get_mut(index)
    }

    /// One iteration of the server loop: drain filesystem-server messages
    /// (registrations and responses), then dispatch pending syscall requests
    /// from the kernel shim.
    pub fn poll(&mut self) {
        self.poll_servers();

        while let Some(frame) = self.lumen.recv() {
            self.dispatch(&frame);
        }
    }

    fn poll_servers(&mut self) {
        for index in 0..self.servers.len() {
            while let Some(frame) = {
                let server = &mut self.servers[index];
                server.link.recv()
            } {
                let Some(header) = peek_header(&frame) else {
                    continue;
                };

                match Opcode::from_wire(header.command) {
                    Some(Opcode::VfsInit) => {
                        if let Some((init, _)) = decode::<VfsInitCommand>(&frame) {
                            let fs_type = get_str(&init.fs_type).to_string();
                            info!("vfs", "loaded file system driver for '{fs_type}'");
                            self.by_type.insert(fs_type.clone(), index);
                            self.servers[index].fs_type = Some(fs_type);

                            // acknowledge the registration
                            let mut ack = init;
                            ack.header.into_response(core::mem::size_of::<VfsInitCommand>());
                            ack.header.status = 0;
                            let _ = self.servers[index].link.send(&encode(&ack, &[]));
                        }
                    }
                    Some(op) if op.is_syscall() && header.response != 0 => {
                        if op == Opcode::Mount {
                            self.register_mountpoint(&frame);
                        }
                        let _ = self.lumen.send(&frame);
                    }
                    _ => {
                        warn!(
                            "vfs",
                            "unimplemented response to command {:#06X} from file system driver for '{}'",
                            { header.command },
                            self.servers[index].fs_type.as_deref().unwrap_or("?")
                        );
                    }
                }
            }
        }
    }

    /// Appends a mountpoint entry for a successful MOUNT response.
    fn register_mountpoint(&mut self, frame: &[u8]) {
        let Some((cmd, _)) = decode::<MountCommand>(frame) else {
            return;
        };

        if cmd.header.header.status != 0 {
            return;
        }
        if self.mounts.len() >= MAX_MOUNTPOINTS {
            error!("vfs", "mountpoint table is full");
            return;
        }

        let path = get_str(&cmd.target).to_string();
        if self.mounts.iter().any(|m| m.valid && m.path == path) {
            warn!("vfs", "'{path}' is already a mountpoint, ignoring");
            return;
        }

        let mount = Mountpoint {
            device: get_str(&cmd.source).to_string(),
            path,
            fs_type: get_str(&cmd.fs_type).to_string(),
            flags: cmd.flags,
            valid: true,
        };
        info!("vfs", "mounted '{}' at '{}'", mount.fs_type, mount.path);
        self.mounts.push(mount);
    }

    /// Dispatches one syscall request from the kernel shim.
    pub fn dispatch(&mut self, frame: &[u8]) {
        let Some(header) = peek_header(frame) else {
            return;
        };

        let Some(opcode) = Opcode::from_wire(header.command) else {
            warn!(
                "vfs",
                "unimplemented syscall request {:#06X} for pid {}",
                { header.command },
                { header.requester }
            );
            return;
        };

        match opcode {
            Opcode::Mount => self.dispatch_mount(frame),
            Opcode::Ioctl => self.dispatch_ioctl(frame),
            Opcode::Link => self.dispatch_link(frame),
            Opcode::Stat => self.relay_resolved::<crate::ipc::wire::StatCommand>(frame),
            Opcode::Open => self.relay_resolved::<crate::ipc::wire::OpenCommand>(frame),
            Opcode::Read | Opcode::Write => {
                self.relay_resolved::<crate::ipc::wire::RWCommand>(frame);
            }
            Opcode::Opendir => {
                self.relay_resolved::<crate::ipc::wire::OpendirCommand>(frame);
            }
            Opcode::Readdir => {
                self.relay_resolved::<crate::ipc::wire::ReaddirCommand>(frame);
            }
            Opcode::Chmod => self.relay_resolved::<crate::ipc::wire::ChmodCommand>(frame),
            Opcode::Chown => self.relay_resolved::<crate::ipc::wire::ChownCommand>(frame),
            Opcode::Mkdir => self.relay_resolved::<crate::ipc::wire::MkdirCommand>(frame),
            Opcode::Utime => self.relay_resolved::<crate::ipc::wire::UtimeCommand>(frame),
            Opcode::Mmap => self.relay_resolved::<crate::ipc::wire::MmapCommand>(frame),
            Opcode::Unlink => self.relay_resolved::<crate::ipc::wire::UnlinkCommand>(frame),
            Opcode::Symlink => self.dispatch_symlink(frame),
            Opcode::Readlink => {
                self.relay_resolved::<crate::ipc::wire::ReadLinkCommand>(frame);
            }
            Opcode::Fsync => self.relay_resolved::<crate::ipc::wire::FsyncCommand>(frame),
            Opcode::Statvfs => self.dispatch_statvfs(frame),
            _ => {
                warn!(
                    "vfs",
                    "unimplemented syscall request {:#06X} for pid {}",
                    { header.command },
                    { header.requester }
                );
            }
        }
    }

    fn dispatch_mount(&mut self, frame: &[u8]) {
        let Some((cmd, _)) = decode::<MountCommand>(frame) else {
            return;
        };

        let fs_type = get_str(&cmd.fs_type).to_string();
        let target = get_str(&cmd.target).to_string();
        info!("vfs", "mounting file system '{fs_type}' at '{target}'");

        match self.server_for(&fs_type) {
            Some(server) => {
                let _ = server.link.send(frame);
            }
            None => warn!("vfs", "no file system driver loaded for '{fs_type}'"),
        }
    }

    /// `ioctl()` is only valid for the device-file namespace because it
    /// manipulates device files; everything else answers `ENOTTY`.
    fn dispatch_ioctl(&mut self, frame: &[u8]) {
        let Some((mut cmd, payload)) = decode::<IoctlCommand>(frame) else {
            return;
        };

        let path = get_str(&cmd.path).to_string();
        let Some(resolved) = self.resolve(&path) else {
            warn!("vfs", "could not resolve path '{path}'");
            return;
        };

        if resolved.fs_type != "devfs" {
            cmd.header
                .header
                .into_response(core::mem::size_of::<IoctlCommand>());
            cmd.header.header.status = Errno::ENOTTY.status();
            let _ = self.lumen.send(&encode(&cmd, &[]));
            return;
        }

        put_str(&mut cmd.path, &resolved.path);
        put_str(&mut cmd.device, &resolved.device);
        self.relay(&resolved.fs_type, &encode(&cmd, payload), &path);
    }

    /// `link()` across distinct devices is rejected with `EXDEV` before any
    /// server sees the request.
    fn dispatch_link(&mut self, frame: &[u8]) {
        let Some((mut cmd, _)) = decode::<LinkCommand>(frame) else {
            return;
        };

        let old_path = get_str(&cmd.old_path).to_string();
        let new_path = get_str(&cmd.new_path).to_string();

        let (Some(old), Some(new)) = (self.resolve(&old_path), self.resolve(&new_path)) else {
            warn!("vfs", "could not resolve paths '{new_path}', '{old_path}'");
            return;
        };

        if old.device != new.device {
            // linking between file systems is an optional POSIX feature this
            // router does not offer
            cmd.header
                .header
                .into_response(core::mem::size_of::<LinkCommand>());
            cmd.header.header.status = Errno::EXDEV.status();
            let _ = self.lumen.send(&encode(&cmd, &[]));
            return;
        }

        put_str(&mut cmd.old_path, &old.path);
        put_str(&mut cmd.new_path, &new.path);
        put_str(&mut cmd.device, &new.device);
        self.relay(&new.fs_type, &encode(&cmd, &[]), &new_path);
    }

    /// `symlink()` resolves only the new name; the target string is stored
    /// verbatim.
    fn dispatch_symlink(&mut self, frame: &[u8]) {
        let Some((mut cmd, _)) = decode::<LinkCommand>(frame) else {
            return;
        };

        let new_path = get_str(&cmd.new_path).to_string();
        let Some(new) = self.resolve(&new_path) else {
            warn!("vfs", "could not resolve path '{new_path}'");
            return;
        };

        put_str(&mut cmd.new_path, &new.path);
        put_str(&mut cmd.device, &new.device);
        self.relay(&new.fs_type, &encode(&cmd, &[]), &new_path);
    }

    fn dispatch_statvfs(&mut self, frame: &[u8]) {
        let Some((mut cmd, _)) = decode::<crate::ipc::wire::StatvfsCommand>(frame) else {
            return;
        };

        let path = get_str(&cmd.device).to_string();
        let Some(resolved) = self.resolve(&path) else {
            warn!("vfs", "could not resolve path '{path}'");
            return;
        };

        put_str(&mut cmd.device, &resolved.device);
        self.relay(&resolved.fs_type, &encode(&cmd, &[]), &path);
    }

    /// Common resolve-rewrite-relay path shared by most syscalls.
    ///
    /// The command's `path` is rewritten to be mount-relative and its device
    /// slot receives the mount's device path (`stat` keeps its device in the
    /// `source` field, which its mapping below accounts for).
    fn relay_resolved<T: WirePathCommand>(&mut self, frame: &[u8]) {
        let Some((mut cmd, payload)) = decode::<T>(frame) else {
            return;
        };

        let path = get_str(cmd.path_field()).to_string();
        let Some(resolved) = self.resolve(&path) else {
            warn!("vfs", "could not resolve path '{path}'");
            return;
        };

        put_str(cmd.path_field_mut(), &resolved.path);
        put_str(cmd.device_field_mut(), &resolved.device);

        self.relay(&resolved.fs_type, &encode(&cmd, payload), &path);
    }

    fn relay(&mut self, fs_type: &str, frame: &[u8], path: &str) {
        match self.server_for(fs_type) {
            Some(server) => {
                if server.link.send(frame).is_err() {
                    error!("vfs", "failed to relay request for '{path}'");
                }
            }
            None => warn!("vfs", "no file system driver loaded for '{fs_type}'"),
        }
    }
}

/// Syscall commands routed through the common resolve-rewrite-relay path.
pub trait WirePathCommand: bytemuck::Pod {
    fn path_field(&self) -> &[u8];
    fn path_field_mut(&mut self) -> &mut [u8];
    fn device_field_mut(&mut self) -> &mut [u8];
}

macro_rules! wire_path_command {
    ($type: ty, $path: ident, $device: ident) => {
        impl WirePathCommand for $type {
            fn path_field(&self) -> &[u8] {
                &self.$path
            }

            fn path_field_mut(&mut self) -> &mut [u8] {
                &mut self.$path
            }

            fn device_field_mut(&mut self) -> &mut [u8] {
                &mut self.$device
            }
        }
    };
}

wire_path_command!(crate::ipc::wire::StatCommand, path, source);
wire_path_command!(crate::ipc::wire::OpenCommand, path, device);
wire_path_command!(crate::ipc::wire::RWCommand, path, device);
wire_path_command!(crate::ipc::wire::OpendirCommand, path, device);
wire_path_command!(crate::ipc::wire::ReaddirCommand, path, device);
wire_path_command!(crate::ipc::wire::ChmodCommand, path, device);
wire_path_command!(crate::ipc::wire::ChownCommand, path, device);
wire_path_command!(crate::ipc::wire::MkdirCommand, path, device);
wire_path_command!(crate::ipc::wire::UtimeCommand, path, device);
wire_path_command!(crate::ipc::wire::MmapCommand, path, device);
wire_path_command!(crate::ipc::wire::UnlinkCommand, path, device);
wire_path_command!(crate::ipc::wire::ReadLinkCommand, path, device);
wire_path_command!(crate::ipc::wire::FsyncCommand, path, device);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::channel_pair;

    fn router_with_mounts(mounts: &[(&str, &str, &str)]) -> VfsServer {
        let (lumen, _shim) = channel_pair();
        let mut vfs = VfsServer::new(Box::new(lumen));
        for (device, path, fs_type) in mounts {
            vfs.mounts.push(Mountpoint {
                device: device.to_string(),
                path: path.to_string(),
                fs_type: fs_type.to_string(),
                flags: 0,
                valid: true,
            });
        }
        vfs
    }

    #[test]
    fn longest_prefix_wins() {
        let vfs = router_with_mounts(&[
            ("/dev/sd0", "/", "lxfs"),
            ("devfs", "/dev", "devfs"),
            ("/dev/sd1", "/dev/shm", "lxfs"),
        ]);

        assert_eq!(vfs.resolve("/etc/passwd").unwrap().fs_type, "lxfs");
        assert_eq!(vfs.resolve("/dev/tty0").unwrap().fs_type, "devfs");
        assert_eq!(vfs.resolve("/dev/shm/a").unwrap().device, "/dev/sd1");
    }

    #[test]
    fn stripped_path_stays_rooted() {
        let vfs = router_with_mounts(&[("devfs", "/dev", "devfs"), ("/dev/sd0", "/", "lxfs")]);

        assert_eq!(vfs.resolve("/dev").unwrap().path, "/");
        assert_eq!(vfs.resolve("/dev/sd0").unwrap().path, "/sd0");
        assert_eq!(vfs.resolve("/a/b").unwrap().path, "/a/b");
    }

    #[test]
    fn prefix_match_respects_component_boundaries() {
        let vfs = router_with_mounts(&[("devfs", "/dev", "devfs"), ("/dev/sd0", "/", "lxfs")]);

        // "/device" shares a byte prefix with "/dev" but is not inside it
        assert_eq!(vfs.resolve("/device").unwrap().fs_type, "lxfs");
    }

    #[test]
    fn unresolvable_without_root_mount() {
        let vfs = router_with_mounts(&[("devfs", "/dev", "devfs")]);
        assert!(vfs.resolve("/etc/passwd").is_none());
    }
}
