//! ATA device identification.

use crate::drivers::ide::{
    AtaCommand, AtaDrive, AtaIdentify, IdeController, StatusRegister, ATA_CAP3_LBA28,
    ATA_CMDCAP_LBA48, ATA_COMMAND_STATUS, ATA_DRIVE_SELECT, ATA_LBA_HIGH, ATA_LBA_LOW,
    ATA_LBA_MID, ATA_SECTOR_COUNT,
};
use crate::time::YieldBudget;
use crate::{info, warn};

/// Identification polling bound, in units of scheduler yields.
const IDENTIFY_TIMEOUT: u32 = 20;

impl IdeController {
    /// Probes one (channel, drive) pair with IDENTIFY and records the drive
    /// if it answers usefully.
    pub fn identify(&mut self, channel: u8, port: u8) {
        let channel = channel & 1;
        let port = port & 1;
        let base = self.channel_base(channel);
        let slot = ((channel << 1) | port) as usize;
        let name = if channel != 0 { "secondary" } else { "primary" };

        let io = self.io_mut();
        io.outb(base + ATA_DRIVE_SELECT, 0xA0 | (port << 4));
        self.delay(base);

        let io = self.io_mut();
        io.outb(base + ATA_SECTOR_COUNT, 0);
        io.outb(base + ATA_LBA_LOW, 0);
        io.outb(base + ATA_LBA_MID, 0);
        io.outb(base + ATA_LBA_HIGH, 0);
        io.outb(base + ATA_COMMAND_STATUS, AtaCommand::Identify as u8);
        self.delay(base);

        let status = self.status(base);
        if status == 0 || status == 0xFF {
            info!("ide", "- {name} port {port}: not present");
            return;
        }

        if self.io_mut().inb(base + ATA_LBA_HIGH) == 0xEB {
            warn!("ide", "- {name} port {port}: unimplemented ATAPI device");
            return;
        }

        let mut budget = YieldBudget::new(IDENTIFY_TIMEOUT);
        while StatusRegister::from(self.status(base)).bsy() {
            if !budget.yield_once() {
                warn!("ide", "- {name} port {port}: operation timed out");
                return;
            }
        }

        let mut budget = YieldBudget::new(IDENTIFY_TIMEOUT);
        loop {
            let status = StatusRegister::from(self.status(base));
            if status.drq() {
                break;
            }
            if status.err() || status.drive_fault() {
                warn!(
                    "ide",
                    "- {name} port {port}: {}",
                    if status.drive_fault() {
                        "drive fault"
                    } else {
                        "general I/O error"
                    }
                );
                return;
            }
            if !budget.yield_once() {
                warn!("ide", "- {name} port {port}: operation timed out");
                return;
            }
        }

        let mut raw = [0u16; 256];
        let io = self.io_mut();
        for word in &mut raw {
            *word = io.inw(base);
        }

        let identify = AtaIdentify(raw);
        let model = identify.model();
        let serial = identify.serial();

        let lba28 = identify.cap3() & ATA_CAP3_LBA28 == 0;
        let lba48 = (identify.cmd_cap2() | identify.cmd_cap5()) & ATA_CMDCAP_LBA48 != 0;
        if !lba28 && !lba48 {
            warn!(
                "ide",
                "- {name} port {port}: {model}, does not implement LBA, ignoring device"
            );
            return;
        }

        let mut sector_size = (identify.logical_sector_size_words() * 2) as u16;
        if sector_size == 0 {
            sector_size = 512;
        }

        let size = if lba48 {
            identify.logical_size48()
        } else {
            u64::from(identify.logical_size28())
        };
        if size == 0 {
            warn!(
                "ide",
                "- {name} port {port}: {model}, returned logical size zero, ignoring device"
            );
            return;
        }

        info!(
            "ide",
            "- {name} port {port}: {model}, sector size {sector_size}, {size} sectors, {}{}",
            if lba28 { "LBA28 " } else { "" },
            if lba48 { "LBA48 " } else { "" }
        );

        self.install_drive(
            slot,
            AtaDrive {
                identify,
                model,
                serial,
                size,
                sector_size,
                lba28,
                lba48,
                channel,
                port,
            },
        );
    }

    pub(crate) fn install_drive(&mut self, slot: usize, drive: AtaDrive) {
        self.drives_mut()[slot] = Some(drive);
    }
}
