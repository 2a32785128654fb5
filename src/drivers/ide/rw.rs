//! PIO sector transfers.
//!
//! 28-bit addressing is preferred for its lower port overhead; 48-bit is the
//! fallback for large addresses or drives identifying without LBA28. Waits
//! are bounded by wall-clock deadlines generous enough for a drive spinning
//! up and seeking: 20 seconds for reads, twice that for writes.

use crate::drivers::ide::{
    AtaCommand, IdeController, StatusRegister, ATA_COMMAND_STATUS, ATA_DRIVE_SELECT, ATA_LBA_HIGH,
    ATA_LBA_LOW, ATA_LBA_MID, ATA_SECTOR_COUNT,
};
use crate::errors::{CanFail, Errno};
use crate::error;
use crate::io::IOPort;
use crate::time::Deadline;

const READ_TIMEOUT_SECS: u64 = 20;
const WRITE_TIMEOUT_SECS: u64 = 40;
const FLUSH_TIMEOUT_SECS: u64 = 20;

impl IdeController {
    /// Selects a drive and programs the address registers.
    ///
    /// In 48-bit mode the high half of the sector count and address must be
    /// written before the low half.
    fn select(&mut self, base: IOPort, using48: bool, port: u8, lba: u64, count: u16) {
        let mut selector = (port & 1) << 4;
        if using48 {
            selector |= 0x40;
        } else {
            selector |= 0xE0 | (((lba >> 24) & 0x0F) as u8);
        }

        self.io_mut().outb(base + ATA_DRIVE_SELECT, selector);
        self.delay(base);

        let io = self.io_mut();
        if using48 {
            io.outb(base + ATA_SECTOR_COUNT, (count >> 8) as u8);
            io.outb(base + ATA_LBA_LOW, (lba >> 24) as u8);
            io.outb(base + ATA_LBA_MID, (lba >> 32) as u8);
            io.outb(base + ATA_LBA_HIGH, (lba >> 40) as u8);
        }

        let io = self.io_mut();
        io.outb(base + ATA_SECTOR_COUNT, count as u8);
        io.outb(base + ATA_LBA_LOW, lba as u8);
        io.outb(base + ATA_LBA_MID, (lba >> 8) as u8);
        io.outb(base + ATA_LBA_HIGH, (lba >> 16) as u8);
    }

    /// Picks the addressing mode for a transfer, failing before any port
    /// activity if the drive cannot address it.
    fn addressing(&self, slot: usize, lba: u64) -> Result<bool, Errno> {
        let drive = self.drive(slot).ok_or(Errno::ENODEV)?;

        let using48 = lba >= (1 << 28) || !drive.lba28;
        if using48 && !drive.lba48 {
            return Err(Errno::EIO);
        }

        Ok(using48)
    }

    /// Waits out BUSY, then waits for DRQ while watching the error bits.
    fn wait_drq(&mut self, base: IOPort, deadline: Deadline) -> CanFail<Errno> {
        loop {
            let status = StatusRegister::from(self.status(base));
            if !status.bsy() {
                break;
            }
            if !deadline.yield_once() {
                return Err(Errno::EIO);
            }
        }

        loop {
            let status = StatusRegister::from(self.status(base));
            if status.err() || status.drive_fault() {
                return Err(Errno::EIO);
            }
            if status.drq() {
                return Ok(());
            }
            if !deadline.yield_once() {
                return Err(Errno::EIO);
            }
        }
    }

    /// Reads `count` contiguous sectors starting at `lba` into `buffer`.
    pub fn read_sectors(
        &mut self,
        slot: usize,
        lba: u64,
        count: u16,
        buffer: &mut [u8],
    ) -> CanFail<Errno> {
        if count == 0 {
            return Err(Errno::EIO);
        }

        let drive = self.drive(slot).ok_or(Errno::ENODEV)?;
        let (channel, port, sector_size, capacity) =
            (drive.channel, drive.port, drive.sector_size as usize, drive.size);

        // capacity gating happens before any port write could start a
        // transfer
        if lba + u64::from(count) > capacity {
            return Err(Errno::EIO);
        }

        let using48 = self.addressing(slot, lba)?;
        let base = self.channel_base(channel);

        self.select(base, using48, port, lba, count);
        self.io_mut().outb(
            base + ATA_COMMAND_STATUS,
            if using48 {
                AtaCommand::Read48 as u8
            } else {
                AtaCommand::Read28 as u8
            },
        );
        self.delay(base);

        let status = self.status(base);
        if status == 0 || status == 0xFF {
            return Err(Errno::EIO);
        }

        let deadline = Deadline::after_secs(READ_TIMEOUT_SECS);
        for sector in 0..count as usize {
            self.wait_drq(base, deadline)?;

            let io = self.io_mut();
            let out = &mut buffer[sector * sector_size..(sector + 1) * sector_size];
            for word in out.chunks_exact_mut(2) {
                let data = io.inw(base);
                word[0] = (data & 0xFF) as u8;
                word[1] = (data >> 8) as u8;
            }

            self.delay(base);
        }

        Ok(())
    }

    /// Writes `count` contiguous sectors starting at `lba` from `buffer`,
    /// then flushes the drive cache.
    pub fn write_sectors(
        &mut self,
        slot: usize,
        lba: u64,
        count: u16,
        buffer: &[u8],
    ) -> CanFail<Errno> {
        if count == 0 {
            return Err(Errno::EIO);
        }

        let drive = self.drive(slot).ok_or(Errno::ENODEV)?;
        let (channel, port, sector_size, capacity) =
            (drive.channel, drive.port, drive.sector_size as usize, drive.size);

        if lba + u64::from(count) > capacity {
            return Err(Errno::EIO);
        }

        let using48 = self.addressing(slot, lba)?;
        let base = self.channel_base(channel);

        self.select(base, using48, port, lba, count);
        self.io_mut().outb(
            base + ATA_COMMAND_STATUS,
            if using48 {
                AtaCommand::Write48 as u8
            } else {
                AtaCommand::Write28 as u8
            },
        );
        self.delay(base);

        let status = self.status(base);
        if status == 0 || status == 0xFF {
            return Err(Errno::EIO);
        }

        let deadline = Deadline::after_secs(WRITE_TIMEOUT_SECS);
        for sector in 0..count as usize {
            self.wait_drq(base, deadline)?;

            let io = self.io_mut();
            let data = &buffer[sector * sector_size..(sector + 1) * sector_size];
            for word in data.chunks_exact(2) {
                io.outw(base, u16::from(word[0]) | (u16::from(word[1]) << 8));
            }

            self.delay(base);
        }

        // flush the drive cache; reselecting first accommodates older
        // controllers, with a fresh and less lenient deadline
        let deadline = Deadline::after_secs(FLUSH_TIMEOUT_SECS);
        self.select(base, using48, port, lba, count);
        self.io_mut().outb(
            base + ATA_COMMAND_STATUS,
            if using48 {
                AtaCommand::Flush48 as u8
            } else {
                AtaCommand::Flush28 as u8
            },
        );
        self.delay(base);

        loop {
            let status = StatusRegister::from(self.status(base));
            if !status.bsy() {
                break;
            }
            if !deadline.yield_once() {
                error!("ide", "flush timed out on channel {channel} port {port}");
                return Err(Errno::EIO);
            }
        }

        self.delay(base);
        let status = StatusRegister::from(self.status(base));
        if status.err() || status.drive_fault() {
            return Err(Errno::EIO);
        }

        Ok(())
    }
}
