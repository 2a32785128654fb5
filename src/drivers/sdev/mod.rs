//! Abstraction for storage devices under `/dev/sdX`.
//!
//! Hardware drivers connect and register their devices; each one is assigned
//! the next `/sdN` name and published to the device-file namespace as a
//! block-device node. Byte-addressed read and write requests arriving from
//! devfs are relayed as sector-granular transfers on the owning driver's
//! socket, and driver responses travel back the same way.

use bytemuck::Zeroable;

use crate::errors::Errno;
use crate::ipc::message::{MessageHeader, Opcode};
use crate::ipc::wire::{
    DevfsRegisterCommand, RWCommand, SDevRWCommand, SDevRegisterCommand, S_IFBLK, S_IRGRP,
    S_IROTH, S_IRUSR, S_IWUSR,
};
use crate::ipc::{decode, encode, get_str, peek_header, put_str, Transport};
use crate::{info, warn};

/// Bound on connected driver servers.
pub const MAX_DRIVERS: usize = 8;

/// One registered storage device.
pub struct StorageDevice {
    /// Name under /dev.
    pub name: String,

    /// Server handling this device.
    pub server: String,

    /// Driver-specific identifier, opaque to this layer.
    pub device_id: u64,

    pub partitioned: bool,

    /// Total size in sectors.
    pub size: u64,

    /// Sector size in bytes.
    pub sector_size: u16,

    /// Index of the driver connection owning this device.
    driver: usize,
}

pub struct SdevServer {
    devfs: Box<dyn Transport>,
    drivers: Vec<Box<dyn Transport>>,
    devices: Vec<StorageDevice>,
}

impl SdevServer {
    #[must_use]
    pub fn new(devfs: Box<dyn Transport>) -> Self {
        Self {
            devfs,
            drivers: Vec::new(),
            devices: Vec::new(),
        }
    }

    /// Accepts a new driver connection; its first message is expected to be
    /// SDEV_REGISTER.
    pub fn accept(&mut self, link: Box<dyn Transport>) {
        if self.drivers.len() >= MAX_DRIVERS {
            warn!("sdev", "driver table is full, dropping connection");
            return;
        }

        self.drivers.push(link);
    }

    #[must_use]
    pub fn devices(&self) -> &[StorageDevice] {
        &self.devices
    }

    /// One iteration of the server loop: drain driver sockets (registrations
    /// and I/O responses), then requests from devfs.
    pub fn poll(&mut self) {
        for index in 0..self.drivers.len() {
            while let Some(frame) = self.drivers[index].recv() {
                self.handle_driver(index, &frame);
            }
        }

        while let Some(frame) = self.devfs.recv() {
            self.handle_devfs(&frame);
        }
    }

    fn handle_driver(&mut self, driver: usize, frame: &[u8]) {
        let Some(header) = peek_header(frame) else {
            return;
        };

        match Opcode::from_wire(header.command) {
            Some(Opcode::SdevRegister) => self.register(driver, frame),
            Some(Opcode::SdevRead | Opcode::SdevWrite) if header.response != 0 => {
                self.relay_completion(frame);
            }
            _ => warn!(
                "sdev",
                "unimplemented command {:#06X} from storage device driver, dropping message",
                { header.command }
            ),
        }
    }

    /// Registers a device and publishes its block-device node to devfs.
    fn register(&mut self, driver: usize, frame: &[u8]) {
        let Some((cmd, _)) = decode::<SDevRegisterCommand>(frame) else {
            return;
        };

        let name = format!("/sd{}", self.devices.len());
        let device = StorageDevice {
            name: name.clone(),
            server: get_str(&cmd.server).to_string(),
            device_id: cmd.device,
            partitioned: cmd.partitions != 0,
            size: cmd.size,
            sector_size: cmd.sector_size,
            driver,
        };

        // block device owned by root:root with permissions rw-r--r--
        let mut reg = DevfsRegisterCommand::zeroed();
        reg.header = MessageHeader::request(Opcode::DevfsRegister, 0);
        reg.header.length = core::mem::size_of::<DevfsRegisterCommand>() as u16;
        reg.status.st_mode = S_IFBLK | S_IRUSR | S_IWUSR | S_IRGRP | S_IROTH;
        reg.status.st_size = cmd.size * u64::from(cmd.sector_size);
        reg.status.st_blksize = u64::from(cmd.sector_size);
        reg.status.st_blocks = cmd.size;
        put_str(&mut reg.path, &name);
        put_str(&mut reg.server, &device.server);

        let _ = self.devfs.send(&encode(&reg, &[]));

        info!("sdev", "registered block device /dev{name}");
        self.devices.push(device);
    }

    fn handle_devfs(&mut self, frame: &[u8]) {
        let Some(header) = peek_header(frame) else {
            return;
        };

        match Opcode::from_wire(header.command) {
            Some(Opcode::Read) => self.relay_request(frame, Opcode::SdevRead),
            Some(Opcode::Write) => self.relay_request(frame, Opcode::SdevWrite),
            _ => warn!(
                "sdev",
                "unimplemented command {:#06X} from devfs, dropping message",
                { header.command }
            ),
        }
    }

    /// Translates a byte-addressed devfs request into the driver's
    /// sector-granular form and relays it.
    fn relay_request(&mut self, frame: &[u8], opcode: Opcode) {
        let Some((mut cmd, payload)) = decode::<RWCommand>(frame) else {
            return;
        };

        let path = get_str(&cmd.path).to_string();
        let device = path
            .strip_prefix("/sd")
            .and_then(|n| n.parse::<usize>().ok())
            .and_then(|n| self.devices.get(n));

        let Some(device) = device else {
            // possibly a hotpluggable device that has gone away
            cmd.header.header.into_response(core::mem::size_of::<RWCommand>());
            cmd.header.header.status = Errno::ENODEV.status();
            cmd.length = 0;
            let _ = self.devfs.send(&encode(&cmd, &[]));
            return;
        };

        let mut relay = SDevRWCommand::zeroed();
        relay.header = MessageHeader::request(opcode, cmd.header.header.requester);
        relay.header.length = (core::mem::size_of::<SDevRWCommand>() + payload.len()) as u16;
        relay.syscall = cmd.header.id as u16;
        relay.device = device.device_id;
        relay.start = cmd.position as u64;
        relay.count = cmd.length;
        relay.sector_size = u64::from(device.sector_size);
        relay.partition = -1;

        let driver = device.driver;
        let _ = self.drivers[driver].send(&encode(&relay, payload));
    }

    /// Relays a completed transfer back to devfs.
    fn relay_completion(&mut self, frame: &[u8]) {
        let _ = self.devfs.send(frame);
    }
}
