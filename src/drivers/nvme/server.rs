//! NVMe driver message handling for the storage-device layer.

use bytemuck::Zeroable;

use crate::drivers::nvme::NvmeController;
use crate::errors::Errno;
use crate::ipc::message::{MessageHeader, Opcode};
use crate::ipc::wire::{SDevRWCommand, SDevRegisterCommand};
use crate::ipc::{decode, encode, peek_header, put_str};
use crate::warn;

/// Well-known socket name of this driver.
pub const SERVER_NAME: &str = "lux:///dsnvme";

pub struct NvmeServer {
    controllers: Vec<NvmeController>,
}

impl NvmeServer {
    #[must_use]
    pub fn new(controllers: Vec<NvmeController>) -> Self {
        Self { controllers }
    }

    /// Device identifier layout: namespace index in the low 16 bits,
    /// controller index above.
    fn locate(&mut self, device: u64) -> Option<(&mut NvmeController, usize)> {
        let controller = self.controllers.get_mut((device >> 16) as usize)?;
        let ns = (device & 0xFFFF) as usize;
        if ns >= controller.ns_count() {
            return None;
        }

        Some((controller, ns))
    }

    /// SDEV_REGISTER frames for every namespace, sent to the storage-device
    /// layer at startup.
    #[must_use]
    pub fn register_frames(&self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        for (index, controller) in self.controllers.iter().enumerate() {
            for ns in 0..controller.ns_count() {
                let mut cmd = SDevRegisterCommand::zeroed();
                cmd.header = MessageHeader::request(Opcode::SdevRegister, 0);
                cmd.header.length = core::mem::size_of::<SDevRegisterCommand>() as u16;
                cmd.device = ((index as u64) << 16) | ns as u64;
                cmd.size = controller.ns_size(ns).unwrap_or(0);
                cmd.sector_size = controller.ns_sector_size(ns).unwrap_or(512) as u16;
                put_str(&mut cmd.server, SERVER_NAME);

                frames.push(encode(&cmd, &[]));
            }
        }

        frames
    }

    /// Handles one sector-transfer request from the storage-device layer.
    pub fn handle(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let header = peek_header(frame)?;

        match Opcode::from_wire(header.command) {
            Some(Opcode::SdevRead) => self.read(frame),
            Some(Opcode::SdevWrite) => self.write(frame),
            _ => {
                warn!("nvme", "unimplemented command {:#06X}", { header.command });
                let mut header = header;
                header.into_response(core::mem::size_of_val(&header));
                header.status = Errno::ENOSYS.status();
                Some(encode(&header, &[]))
            }
        }
    }

    fn read(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, _) = decode::<SDevRWCommand>(frame)?;
        cmd.header.into_response(core::mem::size_of::<SDevRWCommand>());

        let device = cmd.device;
        let start = cmd.start;
        let count = cmd.count;
        let id = if cmd.syscall != 0 { cmd.syscall } else { 1 };

        let Some((controller, ns)) = self.locate(device) else {
            cmd.header.status = Errno::ENODEV.status();
            return Some(encode(&cmd, &[]));
        };

        let sector_size = controller.ns_sector_size(ns)?;
        if start % sector_size != 0 || count % sector_size != 0 {
            cmd.header.status = Errno::EIO.status();
            return Some(encode(&cmd, &[]));
        }

        let outcome =
            match controller.read_sectors(ns, id, start / sector_size, (count / sector_size) as u16)
            {
                Ok(request) => controller.wait(&request).map(|()| request.buffer.to_vec()),
                Err(err) => Err(err),
            };

        match outcome {
            Ok(data) => {
                cmd.header.status = 0;
                cmd.header
                    .into_response(core::mem::size_of::<SDevRWCommand>() + data.len());
                Some(encode(&cmd, &data))
            }
            Err(err) => {
                warn!("nvme", "I/O error on device {device:#x}");
                cmd.header.status = err.status();
                Some(encode(&cmd, &[]))
            }
        }
    }

    fn write(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let (mut cmd, payload) = decode::<SDevRWCommand>(frame)?;
        cmd.header.into_response(core::mem::size_of::<SDevRWCommand>());

        let device = cmd.device;
        let start = cmd.start;
        let count = cmd.count;
        let id = if cmd.syscall != 0 { cmd.syscall } else { 1 };

        let Some((controller, ns)) = self.locate(device) else {
            cmd.header.status = Errno::ENODEV.status();
            return Some(encode(&cmd, &[]));
        };

        let sector_size = controller.ns_sector_size(ns)?;
        if start % sector_size != 0 || count % sector_size != 0 || payload.len() < count as usize {
            cmd.header.status = Errno::EIO.status();
            return Some(encode(&cmd, &[]));
        }

        let outcome = match controller.write_sectors(
            ns,
            id,
            start / sector_size,
            (count / sector_size) as u16,
            &payload[..count as usize],
        ) {
            Ok(request) => controller.wait(&request),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => cmd.header.status = 0,
            Err(err) => {
                warn!("nvme", "I/O error on device {device:#x}");
                cmd.header.status = err.status();
            }
        }

        Some(encode(&cmd, &[]))
    }
}
