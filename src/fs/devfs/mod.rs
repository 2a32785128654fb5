//! Device-file namespace server.
//!
//! devfs owns an in-memory tree of device nodes and routes I/O to the
//! external driver servers that registered them; its own role is almost
//! entirely dispatch. Drivers publish nodes with DEVFS_REGISTER and adjust
//! them with DEVFS_CHSTAT; stat and readdir are answered from the tree, while
//! open (when the driver asked for it), read, write and ioctl are relayed to
//! the owning driver's socket.

use bytemuck::Zeroable;

use crate::errors::Errno;
use crate::ipc::message::Opcode;
use crate::ipc::wire::{
    DevfsChstatCommand, DevfsRegisterCommand, FileStatus, IoctlCommand, MountCommand,
    OpenCommand, OpendirCommand, RWCommand, ReaddirCommand, StatCommand, VfsInitCommand, S_IFDIR,
    S_IRGRP, S_IROTH, S_IRUSR, S_IWUSR, S_IXGRP, S_IXOTH, S_IXUSR,
};
use crate::ipc::{decode, encode, get_str, peek_header, put_str, Transport};
use crate::time::unix_now;
use crate::{info, warn};

/// One registered device node.
pub struct DevfsNode {
    pub path: String,
    pub server: String,
    pub status: FileStatus,
    pub handle_open: bool,
}

pub struct DevfsServer {
    nodes: Vec<DevfsNode>,
    drivers: hashbrown::HashMap<String, Box<dyn Transport>>,
    created: u64,
}

impl DevfsServer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            drivers: hashbrown::HashMap::new(),
            created: unix_now(),
        }
    }

    /// The type-advertisement frame sent to the VFS router at startup.
    #[must_use]
    pub fn init_frame(&self) -> Vec<u8> {
        encode(&VfsInitCommand::new("devfs", 0), &[])
    }

    /// Connects a driver server under its well-known name; relayed requests
    /// for its nodes go down this link.
    pub fn connect_driver(&mut self, name: &str, link: Box<dyn Transport>) {
        self.drivers.insert(name.to_string(), link);
    }

    #[must_use]
    pub fn node(&self, path: &str) -> Option<&DevfsNode> {
        self.nodes.iter().find(|n| n.path == path)
    }

    /// Handles one frame from the VFS router or from a driver connection.
    pub fn handle(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let header = peek_header(frame)?;
        let opcode = Opcode::from_wire(header.command)?;

        match opcode {
            Opcode::DevfsRegister => self.register(frame),
            Opcode::DevfsChstat => self.chstat(frame),
            Opcode::Mount => self.mount(frame),
            Opcode::Stat => self.stat(frame),
            Opcode::Open => self.open(frame),
            Opcode::Opendir => self.opendir(frame),
            Opcode::Readdir => self.readdir(frame),
            Opcode::Read | Opcode::Write => self.relay_rw(frame),
            Opcode::Ioctl => self.relay_ioctl(frame),
            _ => {
                warn!("devfs", "unimplemented command {:#06X}", { header.command });
                let mut header = header;
                header.into_response(core::mem::size_of_val(&header));
                header.status = Errno::ENOSYS.status();
                Some(encode(&header, &[]))
            }
        }
    }

    /// The namespace is purely in-memory, so mounting needs no device.
    fn mount(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<MountCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<MountCommand>());
        cmd.header.header.status = 0;
        Some(encode(&cmd, &[]))
    }

    /// Every node lives directly under the namespace root; only the root
    /// itself can be opened as a directory.
    fn opendir(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<OpendirCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<OpendirCommand>());

        let path = get_str(&cmd.path).to_string();
        cmd.header.header.status = if path == "/" {
            0
        } else if self.node(&path).is_some() {
            Errno::ENOTDIR.status()
        } else {
            Errno::ENOENT.status()
        };

        Some(encode(&cmd, &[]))
    }

    fn register(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<DevfsRegisterCommand>(frame)?;
        cmd.header.into_response(core::mem::size_of::<DevfsRegisterCommand>());

        let path = get_str(&cmd.path).to_string();
        if self.node(&path).is_some() {
            cmd.header.status = Errno::EEXIST.status();
            return Some(encode(&cmd, &[]));
        }

        info!("devfs", "registered device /dev{path}");
        self.nodes.push(DevfsNode {
            path,
            server: get_str(&cmd.server).to_string(),
            status: cmd.status,
            handle_open: cmd.handle_open != 0,
        });

        cmd.header.status = 0;
        Some(encode(&cmd, &[]))
    }

    fn chstat(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<DevfsChstatCommand>(frame)?;
        cmd.header.into_response(core::mem::size_of::<DevfsChstatCommand>());

        let path = get_str(&cmd.path).to_string();
        match self.nodes.iter_mut().find(|n| n.path == path) {
            Some(node) => {
                node.status = cmd.status;
                cmd.header.status = 0;
            }
            None => cmd.header.status = Errno::ENOENT.status(),
        }

        Some(encode(&cmd, &[]))
    }

    fn stat(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<StatCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<StatCommand>());

        let path = get_str(&cmd.path).to_string();
        if path == "/" {
            // the namespace root is a directory owned by root:root
            let mut status = FileStatus::zeroed();
            status.st_mode = S_IFDIR
                | S_IRUSR
                | S_IWUSR
                | S_IXUSR
                | S_IRGRP
                | S_IXGRP
                | S_IROTH
                | S_IXOTH;
            status.st_nlink = 1;
            status.st_atime = self.created;
            status.st_mtime = self.created;
            status.st_ctime = self.created;
            cmd.status = status;
            cmd.header.header.status = 0;
            return Some(encode(&cmd, &[]));
        }

        match self.node(&path) {
            Some(node) => {
                cmd.status = node.status;
                cmd.header.header.status = 0;
            }
            None => cmd.header.header.status = Errno::ENOENT.status(),
        }

        Some(encode(&cmd, &[]))
    }

    fn open(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<OpenCommand>(frame)?;

        let path = get_str(&cmd.path).to_string();
        let Some(node) = self.node(&path) else {
            cmd.header.header.into_response(core::mem::size_of::<OpenCommand>());
            cmd.header.header.status = Errno::ENOENT.status();
            return Some(encode(&cmd, &[]));
        };

        if node.handle_open {
            // the owning driver decides; its response travels back through
            // the same link
            let server = node.server.clone();
            self.relay_to(&server, frame);
            return None;
        }

        let is_char = node.status.st_mode & crate::ipc::wire::S_IFMT == crate::ipc::wire::S_IFCHR;
        cmd.header.header.into_response(core::mem::size_of::<OpenCommand>());
        cmd.header.header.status = 0;
        cmd.char_dev = u8::from(is_char);
        Some(encode(&cmd, &[]))
    }

    fn readdir(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<ReaddirCommand>(frame)?;
        cmd.header.header.into_response(core::mem::size_of::<ReaddirCommand>());

        let position = cmd.position;
        if position < 2 {
            put_str(&mut cmd.entry.d_name, if position == 0 { "." } else { ".." });
            cmd.entry.d_ino = position + 1;
            cmd.position = position + 1;
            cmd.end = 0;
            cmd.header.header.status = 0;
            return Some(encode(&cmd, &[]));
        }

        match self.nodes.get(position as usize - 2) {
            Some(node) => {
                put_str(&mut cmd.entry.d_name, node.path.trim_start_matches('/'));
                cmd.entry.d_ino = position + 1;
                cmd.position = position + 1;
                cmd.end = 0;
                cmd.header.header.status = 0;
            }
            None => {
                cmd.end = 1;
                cmd.header.header.status = 0;
            }
        }

        Some(encode(&cmd, &[]))
    }

    fn relay_rw(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<RWCommand>(frame)?;

        let path = get_str(&cmd.path).to_string();
        let Some(node) = self.node(&path) else {
            cmd.header.header.into_response(core::mem::size_of::<RWCommand>());
            cmd.header.header.status = Errno::ENOENT.status();
            return Some(encode(&cmd, &[]));
        };

        let server = node.server.clone();
        self.relay_to(&server, frame);
        None
    }

    fn relay_ioctl(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<IoctlCommand>(frame)?;

        let path = get_str(&cmd.path).to_string();
        let Some(node) = self.node(&path) else {
            cmd.header.header.into_response(core::mem::size_of::<IoctlCommand>());
            cmd.header.header.status = Errno::ENOENT.status();
            return Some(encode(&cmd, &[]));
        };

        let server = node.server.clone();
        self.relay_to(&server, frame);
        None
    }

    fn relay_to(&mut self, server: &str, frame: &[u8]) {
        match self.drivers.get_mut(server) {
            Some(link) => {
                let _ = link.send(frame);
            }
            None => warn!("devfs", "no driver connection for '{server}'"),
        }
    }

    /// Drains driver responses, returning them for relay up the chain.
    pub fn poll_drivers(&mut self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for link in self.drivers.values_mut() {
            while let Some(frame) = link.recv() {
                out.push(frame);
            }
        }
        out
    }
}

impl Default for DevfsServer {
    fn default() -> Self {
        Self::new()
    }
}
