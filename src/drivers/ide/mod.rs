//! Device driver for IDE (ATA) disks.
//!
//! Each PCI IDE controller carries up to four drives over two channels. The
//! programming-interface byte decides whether a channel uses the BAR-provided
//! ports or the legacy compatibility bases. All transfers are polled PIO with
//! bounded waits: identification polls on a yield budget, data transfers on
//! wall-clock deadlines.

pub mod identify;
pub mod rw;
pub mod server;

use modular_bitfield::bitfield;

use crate::drivers::pci::{PciBar, PciFunction};
use crate::info;
use crate::io::{IOPort, PortIo};

pub const ATA_SECTOR_COUNT: u16 = 0x02;
pub const ATA_LBA_LOW: u16 = 0x03;
pub const ATA_LBA_MID: u16 = 0x04;
pub const ATA_LBA_HIGH: u16 = 0x05;
pub const ATA_DRIVE_SELECT: u16 = 0x06;
pub const ATA_COMMAND_STATUS: u16 = 0x07;

/// ATA command bytes this driver issues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AtaCommand {
    Identify = 0xEC,
    Read28 = 0x20,
    Read48 = 0x24,
    Write28 = 0x30,
    Write48 = 0x34,
    Flush28 = 0xE7,
    Flush48 = 0xEA,
}

/// Identify word 69: deployed volumes gate LBA28 on this bit being clear.
pub const ATA_CAP3_LBA28: u16 = 0x0040;

/// Identify words 83/86: LBA48 command set support.
pub const ATA_CMDCAP_LBA48: u16 = 0x0400;

#[bitfield]
#[repr(u8)]
#[derive(Clone, Copy, Debug)]
pub struct StatusRegister {
    pub err: bool,
    pub idx: bool,
    pub corr: bool,
    pub drq: bool,
    pub srv: bool,
    pub drive_fault: bool,
    pub rdy: bool,
    pub bsy: bool,
}

/// Raw 256-word IDENTIFY DEVICE image.
pub struct AtaIdentify(pub [u16; 256]);

impl AtaIdentify {
    #[must_use]
    pub fn cap3(&self) -> u16 {
        self.0[69]
    }

    #[must_use]
    pub fn cmd_cap2(&self) -> u16 {
        self.0[83]
    }

    #[must_use]
    pub fn cmd_cap5(&self) -> u16 {
        self.0[86]
    }

    /// 28-bit addressable capacity in sectors.
    #[must_use]
    pub fn logical_size28(&self) -> u32 {
        (u32::from(self.0[61]) << 16) | u32::from(self.0[60])
    }

    /// 48-bit addressable capacity in sectors.
    #[must_use]
    pub fn logical_size48(&self) -> u64 {
        (u64::from(self.0[103]) << 48)
            | (u64::from(self.0[102]) << 32)
            | (u64::from(self.0[101]) << 16)
            | u64::from(self.0[100])
    }

    /// Logical sector size field in words; zero when the device uses the
    /// 512-byte default.
    #[must_use]
    pub fn logical_sector_size_words(&self) -> u32 {
        (u32::from(self.0[118]) << 16) | u32::from(self.0[117])
    }

    fn swapped_string(&self, words: core::ops::Range<usize>) -> String {
        let mut bytes = Vec::with_capacity(words.len() * 2);
        for word in &self.0[words] {
            // each pair of characters is stored byte-swapped
            bytes.push((word >> 8) as u8);
            bytes.push((word & 0xFF) as u8);
        }

        let mut text = String::from_utf8_lossy(&bytes).into_owned();
        if let Some(at) = text.find("  ") {
            text.truncate(at);
        }
        text.trim_end().to_string()
    }

    /// 40-byte model string, endianness corrected and double-space
    /// trimmed.
    #[must_use]
    pub fn model(&self) -> String {
        self.swapped_string(27..47)
    }

    /// 20-byte serial string, endianness corrected and double-space
    /// trimmed.
    #[must_use]
    pub fn serial(&self) -> String {
        self.swapped_string(10..20)
    }
}

/// One identified ATA drive.
pub struct AtaDrive {
    pub identify: AtaIdentify,
    pub model: String,
    pub serial: String,

    /// Capacity in sectors.
    pub size: u64,

    pub sector_size: u16,
    pub lba28: bool,
    pub lba48: bool,

    /// 0 for the primary channel, 1 for the secondary.
    pub channel: u8,

    /// 0 or 1 within the channel.
    pub port: u8,
}

/// One PCI IDE controller and the drives found on it.
pub struct IdeController {
    primary_base: IOPort,
    primary_ctrl: IOPort,
    secondary_base: IOPort,
    secondary_ctrl: IOPort,
    drives: [Option<AtaDrive>; 4],
    io: Box<dyn PortIo>,
}

impl IdeController {
    /// Initializes a controller from its PCI function, honoring the
    /// programming-interface bits that select native versus compatibility
    /// I/O bases, then identifies all four (channel, drive) pairs.
    pub fn init_from_pci(pci: &PciFunction, io: Box<dyn PortIo>) -> Self {
        let prog_if = pci.prog_if();

        let (primary_base, primary_ctrl) = if prog_if & 0x01 != 0 {
            match (pci.bars[0], pci.bars[1]) {
                (PciBar::Io(base), PciBar::Io(ctrl)) if base != 0 && ctrl != 0 => {
                    (IOPort::from(base), IOPort::from(ctrl + 2))
                }
                _ => (IOPort::PRIM_ATA, IOPort::PRIM_ATA_CTRL),
            }
        } else {
            (IOPort::PRIM_ATA, IOPort::PRIM_ATA_CTRL)
        };

        let (secondary_base, secondary_ctrl) = if prog_if & 0x04 != 0 {
            match (pci.bars[2], pci.bars[3]) {
                (PciBar::Io(base), PciBar::Io(ctrl)) if base != 0 && ctrl != 0 => {
                    (IOPort::from(base), IOPort::from(ctrl + 2))
                }
                _ => (IOPort::SEC_ATA, IOPort::SEC_ATA_CTRL),
            }
        } else {
            (IOPort::SEC_ATA, IOPort::SEC_ATA_CTRL)
        };

        info!(
            "ide",
            "- primary: {} mode: I/O ports {:#06X}, {:#06X}",
            if prog_if & 0x01 != 0 { "native" } else { "compatibility" },
            u16::from(primary_base),
            u16::from(primary_ctrl)
        );
        info!(
            "ide",
            "- secondary: {} mode: I/O ports {:#06X}, {:#06X}",
            if prog_if & 0x04 != 0 { "native" } else { "compatibility" },
            u16::from(secondary_base),
            u16::from(secondary_ctrl)
        );

        let mut controller = Self {
            primary_base,
            primary_ctrl,
            secondary_base,
            secondary_ctrl,
            drives: [None, None, None, None],
            io,
        };

        for channel in 0..2u8 {
            for port in 0..2u8 {
                controller.identify(channel, port);
            }
        }

        controller
    }

    /// I/O base of a channel.
    #[must_use]
    pub fn channel_base(&self, channel: u8) -> IOPort {
        if channel & 1 != 0 {
            self.secondary_base
        } else {
            self.primary_base
        }
    }

    /// Alternate-status port of a channel.
    #[must_use]
    pub fn channel_ctrl(&self, channel: u8) -> IOPort {
        if channel & 1 != 0 {
            self.secondary_ctrl
        } else {
            self.primary_ctrl
        }
    }

    /// Returns a drive by `(channel << 1) | port` slot.
    #[must_use]
    pub fn drive(&self, slot: usize) -> Option<&AtaDrive> {
        self.drives.get(slot)?.as_ref()
    }

    /// Delays roughly 400ns by reading the status port four times.
    pub(crate) fn delay(&mut self, base: IOPort) {
        for _ in 0..4 {
            self.io.inb(base + ATA_COMMAND_STATUS);
        }
    }

    pub(crate) fn status(&mut self, base: IOPort) -> u8 {
        self.io.inb(base + ATA_COMMAND_STATUS)
    }

    pub(crate) fn io_mut(&mut self) -> &mut dyn PortIo {
        self.io.as_mut()
    }

    pub(crate) fn drives_mut(&mut self) -> &mut [Option<AtaDrive>; 4] {
        &mut self.drives
    }
}
