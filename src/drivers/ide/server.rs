//! IDE driver message handling for the storage-device layer.

use crate::drivers::ide::IdeController;
use crate::errors::Errno;
use crate::ipc::message::{MessageHeader, Opcode};
use crate::ipc::wire::{SDevRWCommand, SDevRegisterCommand};
use crate::ipc::{decode, encode, peek_header, put_str};
use crate::warn;
use bytemuck::Zeroable;

/// Well-known socket name of this driver.
pub const SERVER_NAME: &str = "lux:///dside";

pub struct IdeServer {
    controllers: Vec<IdeController>,
}

impl IdeServer {
    #[must_use]
    pub fn new(controllers: Vec<IdeController>) -> Self {
        Self { controllers }
    }

    /// Drive identifier layout: bit 0 selects the port, bit 1 the channel,
    /// higher bits the controller index.
    fn locate(&mut self, device: u64) -> Option<(&mut IdeController, usize)> {
        let controller = self.controllers.get_mut((device >> 2) as usize)?;
        let slot = (device & 3) as usize;
        controller.drive(slot)?;
        Some((controller, slot))
    }

    /// SDEV_REGISTER frames for every identified drive, sent to the
    /// storage-device layer at startup.
    #[must_use]
    pub fn register_frames(&self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        for (index, controller) in self.controllers.iter().enumerate() {
            for slot in 0..4 {
                let Some(drive) = controller.drive(slot) else {
                    continue;
                };

                let mut cmd = SDevRegisterCommand::zeroed();
                cmd.header = MessageHeader::request(Opcode::SdevRegister, 0);
                cmd.header.length = core::mem::size_of::<SDevRegisterCommand>() as u16;
                cmd.device = ((index as u64) << 2) | slot as u64;
                cmd.size = drive.size;
                cmd.sector_size = drive.sector_size;
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
                warn!("ide", "unimplemented command {:#06X}", { header.command });
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

        let Some((controller, slot)) = self.locate(device) else {
            cmd.header.status = Errno::ENODEV.status();
            return Some(encode(&cmd, &[]));
        };

        let sector_size = u64::from(controller.drive(slot)?.sector_size);
        if start % sector_size != 0 || count % sector_size != 0 {
            cmd.header.status = Errno::EIO.status();
            return Some(encode(&cmd, &[]));
        }

        let mut data = vec![0u8; count as usize];
        match controller.read_sectors(
            slot,
            start / sector_size,
            (count / sector_size) as u16,
            &mut data,
        ) {
            Ok(()) => {
                cmd.header.status = 0;
                cmd.header
                    .into_response(core::mem::size_of::<SDevRWCommand>() + data.len());
                Some(encode(&cmd, &data))
            }
            Err(err) => {
                warn!("ide", "I/O error on device {device:#x}");
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

        let Some((controller, slot)) = self.locate(device) else {
            cmd.header.status = Errno::ENODEV.status();
            return Some(encode(&cmd, &[]));
        };

        let sector_size = u64::from(controller.drive(slot)?.sector_size);
        if start % sector_size != 0 || count % sector_size != 0 || payload.len() < count as usize {
            cmd.header.status = Errno::EIO.status();
            return Some(encode(&cmd, &[]));
        }

        match controller.write_sectors(
            slot,
            start / sector_size,
            (count / sector_size) as u16,
            &payload[..count as usize],
        ) {
            Ok(()) => cmd.header.status = 0,
            Err(err) => {
                warn!("ide", "I/O error on device {device:#x}");
                cmd.header.status = err.status();
            }
        }

        Some(encode(&cmd, &[]))
    }
}
