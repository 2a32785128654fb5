//! Message-level scenarios: kernel shim, VFS router and LXFS server wired
//! together over in-memory links.

use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::HashMap;

use luxd::errors::{CanFail, Errno};
use luxd::fs::lxfs::create::create_file;
use luxd::fs::lxfs::mkfs::{mkfs, MkfsOptions};
use luxd::fs::lxfs::{LxfsServer, Mountpoint, Volume, VolumeSource};
use luxd::ipc::message::{MessageHeader, Opcode};
use luxd::ipc::wire::{
    IoctlCommand, LinkCommand, MountCommand, RWCommand, StatCommand, S_IFDIR, S_IFMT,
};
use luxd::ipc::{channel_pair, decode, encode, peek_header, put_str, ChannelEnd, Transport};
use luxd::vfs::VfsServer;

/// A volume whose backing bytes stay visible to the test after the server
/// has taken ownership of its handle.
#[derive(Clone)]
struct SharedDisk {
    data: Rc<RefCell<Vec<u8>>>,
}

impl SharedDisk {
    fn formatted() -> Self {
        let mut disk = Self {
            data: Rc::new(RefCell::new(vec![0u8; 256 * 2048])),
        };
        mkfs(&mut disk, MkfsOptions::default()).unwrap();
        disk
    }
}

impl Volume for SharedDisk {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> CanFail<Errno> {
        let data = self.data.borrow();
        let start = offset as usize;
        if start + buf.len() > data.len() {
            return Err(Errno::EIO);
        }
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> CanFail<Errno> {
        let mut data = self.data.borrow_mut();
        let start = offset as usize;
        if start + buf.len() > data.len() {
            return Err(Errno::EIO);
        }
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn size_bytes(&self) -> u64 {
        self.data.borrow().len() as u64
    }
}

struct TestSource {
    volumes: HashMap<String, SharedDisk>,
}

impl VolumeSource for TestSource {
    fn open(&mut self, device: &str) -> Result<Box<dyn Volume>, Errno> {
        self.volumes
            .get(device)
            .cloned()
            .map(|v| Box::new(v) as Box<dyn Volume>)
            .ok_or(Errno::ENOENT)
    }
}

struct Rig {
    shim: ChannelEnd,
    fs_link: ChannelEnd,
    vfs: VfsServer,
    lxfs: LxfsServer,
}

impl Rig {
    /// A router with one registered LXFS server and the given volumes.
    fn new(devices: Vec<(&str, SharedDisk)>) -> Self {
        let mut volumes = HashMap::new();
        for (device, disk) in devices {
            volumes.insert(device.to_string(), disk);
        }

        let (lumen_end, shim) = channel_pair();
        let (server_end, mut fs_link) = channel_pair();

        let mut vfs = VfsServer::new(Box::new(lumen_end));
        vfs.accept(Box::new(server_end));

        let lxfs = LxfsServer::new(Box::new(TestSource { volumes }));

        // advertise the filesystem type and drain the acknowledgement
        fs_link.send(&lxfs.init_frame()).unwrap();
        vfs.poll();
        let ack = fs_link.recv().expect("registration acknowledgement");
        assert_eq!({ peek_header(&ack).unwrap().status }, 0);

        Self {
            shim,
            fs_link,
            vfs,
            lxfs,
        }
    }

    /// Sends one syscall frame from the kernel side and pumps messages until
    /// the response comes back.
    fn roundtrip(&mut self, frame: &[u8]) -> Vec<u8> {
        self.shim.send(frame).unwrap();
        self.pump();
        self.shim.recv().expect("a response frame")
    }

    fn pump(&mut self) {
        for _ in 0..4 {
            self.vfs.poll();
            while let Some(request) = self.fs_link.recv() {
                if let Some(response) = self.lxfs.handle(&request) {
                    self.fs_link.send(&response).unwrap();
                }
            }
        }
    }

    fn mount(&mut self, device: &str, target: &str) {
        let cmd = MountCommand::request(device, target, "lxfs", 0);
        let response = self.roundtrip(&encode(&cmd, &[]));
        assert_eq!({ peek_header(&response).unwrap().status }, 0);
    }
}

fn request<T: bytemuck::Pod>(op: Opcode) -> T {
    let mut cmd = T::zeroed();
    let header = MessageHeader::request(op, 0);
    bytemuck::bytes_of_mut(&mut cmd)[..core::mem::size_of::<MessageHeader>()]
        .copy_from_slice(bytemuck::bytes_of(&header));
    cmd
}

#[test]
fn mount_registers_a_mountpoint() {
    let mut rig = Rig::new(vec![("/dev/sd0", SharedDisk::formatted())]);
    rig.mount("/dev/sd0", "/");

    assert_eq!(rig.vfs.mounts().len(), 1);
    assert_eq!(rig.vfs.mounts()[0].path, "/");
    assert_eq!(rig.vfs.mounts()[0].fs_type, "lxfs");
}

#[test]
fn duplicate_mount_path_is_rejected() {
    let mut rig = Rig::new(vec![
        ("/dev/sd0", SharedDisk::formatted()),
        ("/dev/sd1", SharedDisk::formatted()),
    ]);
    rig.mount("/dev/sd0", "/");

    let cmd = MountCommand::request("/dev/sd1", "/", "lxfs", 0);
    let response = rig.roundtrip(&encode(&cmd, &[]));
    assert_eq!({ peek_header(&response).unwrap().status }, 0);

    assert_eq!(rig.vfs.mounts().len(), 1, "duplicate mount-path rejected");
}

#[test]
fn stat_root_end_to_end() {
    let mut rig = Rig::new(vec![("/dev/sd0", SharedDisk::formatted())]);
    rig.mount("/dev/sd0", "/");

    let mut cmd: StatCommand = request(Opcode::Stat);
    put_str(&mut cmd.path, "/");
    let response = rig.roundtrip(&encode(&cmd, &[]));

    let (stat, _) = decode::<StatCommand>(&response).unwrap();
    assert_eq!({ stat.header.header.status }, 0);
    assert_eq!({ stat.status.st_mode } & S_IFMT, S_IFDIR);
    assert_eq!({ stat.status.st_mode } & 0o777, 0o755);
    assert_eq!({ stat.status.st_uid }, 0);
    assert_eq!({ stat.status.st_gid }, 0);
}

#[test]
fn write_read_through_the_router() {
    let disk = SharedDisk::formatted();

    // the file entry is prepared on the volume before the server mounts it
    {
        let mut mp = Mountpoint::mount("prep", Box::new(disk.clone())).unwrap();
        create_file(&mut mp, "/a", 0o644, 0, 0).unwrap();
        mp.flush_all().unwrap();
    }

    let mut rig = Rig::new(vec![("/dev/sd0", disk)]);
    rig.mount("/dev/sd0", "/");

    let data: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();

    let mut write = RWCommand::request(Opcode::Write, "/a", 0, data.len() as u64);
    put_str(&mut write.device, "ignored");
    let response = rig.roundtrip(&encode(&write, &data));
    let (written, _) = decode::<RWCommand>(&response).unwrap();
    assert_eq!({ written.header.header.status }, 3000);
    assert_eq!({ written.position }, 3000);

    let read = RWCommand::request(Opcode::Read, "/a", 0, 3000);
    let response = rig.roundtrip(&encode(&read, &[]));
    let (header, payload) = decode::<RWCommand>(&response).unwrap();
    assert_eq!({ header.header.header.status }, 3000);
    assert_eq!(payload, &data[..]);

    // the tail read returns only what the file still holds
    let read = RWCommand::request(Opcode::Read, "/a", 2950, 100);
    let response = rig.roundtrip(&encode(&read, &[]));
    let (header, payload) = decode::<RWCommand>(&response).unwrap();
    assert_eq!({ header.header.header.status }, 50);
    assert_eq!(payload, &data[2950..]);
}

#[test]
fn ioctl_outside_devfs_is_rejected_by_the_router() {
    let mut rig = Rig::new(vec![("/dev/sd0", SharedDisk::formatted())]);
    rig.mount("/dev/sd0", "/");

    let mut cmd: IoctlCommand = request(Opcode::Ioctl);
    put_str(&mut cmd.path, "/a");
    let response = rig.roundtrip(&encode(&cmd, &[]));

    assert_eq!(
        Errno::from_status(peek_header(&response).unwrap().status),
        Some(Errno::ENOTTY)
    );
}

#[test]
fn cross_device_link_is_rejected_by_the_router() {
    let mut rig = Rig::new(vec![
        ("/dev/sd0", SharedDisk::formatted()),
        ("/dev/sd1", SharedDisk::formatted()),
    ]);
    rig.mount("/dev/sd0", "/");
    rig.mount("/dev/sd1", "/mnt");

    let mut cmd: LinkCommand = request(Opcode::Link);
    put_str(&mut cmd.old_path, "/a");
    put_str(&mut cmd.new_path, "/mnt/b");
    let response = rig.roundtrip(&encode(&cmd, &[]));

    assert_eq!(
        Errno::from_status(peek_header(&response).unwrap().status),
        Some(Errno::EXDEV)
    );
}
