//! NVMe admin commands: the identification sequence.

use bytemuck::Zeroable;

use crate::drivers::nvme::queue::SubmissionEntry;
use crate::drivers::nvme::regs::{NVME_CAP, NVME_CAP_IO_CMDS};
use crate::drivers::nvme::NvmeController;
use crate::errors::{CanFail, Errno};
use crate::{info, warn};

pub const ADMIN_DELETE_SUBQ: u8 = 0x00;
pub const ADMIN_CREATE_SUBQ: u8 = 0x01;
pub const ADMIN_GET_LOG: u8 = 0x02;
pub const ADMIN_DELETE_COMQ: u8 = 0x04;
pub const ADMIN_CREATE_COMQ: u8 = 0x05;
pub const ADMIN_IDENTIFY: u8 = 0x06;
pub const ADMIN_ABORT: u8 = 0x08;
pub const ADMIN_SET_FEATURES: u8 = 0x09;
pub const ADMIN_GET_FEATURES: u8 = 0x0A;

/// CNS values of the identify commands this driver issues.
pub const CNS_IDENTIFY_NAMESPACE: u32 = 0x00;
pub const CNS_IDENTIFY_CONTROLLER: u32 = 0x01;
pub const CNS_ACTIVE_NAMESPACES: u32 = 0x07;
pub const CNS_COMMAND_SET_PROFILES: u32 = 0x1C;

/// Set-Features identifier selecting the I/O command set profile.
pub const FID_COMMAND_SET_PROFILE: u32 = 0x19;

/// Bit 0 of a command-set profile word: the NVM command set.
pub const NVM_COMMAND_SET: u64 = 0x01;

/// Admin completion polling bound, in scheduler yields.
pub const ADMIN_POLL_TIMEOUT: u32 = 20;

impl NvmeController {
    /// Runs the recommended identification sequence: identify controller,
    /// then (when the capability advertises I/O command sets) pick and set a
    /// command-set profile including the NVM set, then enumerate the active
    /// NVM namespaces.
    pub(crate) fn identify(&mut self) -> CanFail<Errno> {
        let id = self.id_buffer();

        // CNS 1: identify controller, serial at byte 4, model at byte 24
        let mut cmd = SubmissionEntry::zeroed();
        cmd.dword0 = u32::from(ADMIN_IDENTIFY) | (0x1234 << 16);
        cmd.data_low = id.phys();
        cmd.dword10 = CNS_IDENTIFY_CONTROLLER;
        self.submit(0, &cmd);
        if self.poll(0, 0x1234, ADMIN_POLL_TIMEOUT).is_none() {
            warn!("nvme", "- timeout while identifying drive, aborting");
            return Err(Errno::EIO);
        }

        let mut serial = [0u8; 20];
        let mut model = [0u8; 40];
        id.read(4, &mut serial);
        id.read(24, &mut model);
        self.serial = String::from_utf8_lossy(&serial).trim_end().to_string();
        self.model = String::from_utf8_lossy(&model).trim_end().to_string();

        info!("nvme", "- serial number: {}", self.serial);
        info!("nvme", "- model: {}", self.model);

        // when the controller implements selectable I/O command sets, pick
        // the first profile carrying the NVM set and activate it
        let cap = self.regs_mut().read64(NVME_CAP);
        if cap & NVME_CAP_IO_CMDS != 0 {
            let mut cmd = SubmissionEntry::zeroed();
            cmd.dword0 = u32::from(ADMIN_IDENTIFY) | (0xDEAD << 16);
            cmd.data_low = id.phys();
            cmd.dword10 = CNS_COMMAND_SET_PROFILES;
            self.submit(0, &cmd);
            if self.poll(0, 0xDEAD, ADMIN_POLL_TIMEOUT).is_none() {
                warn!("nvme", "- timeout while identifying command sets, aborting");
                return Err(Errno::EIO);
            }

            let mut profile = None;
            for index in 0..512 {
                if id.read_u64(index) & NVM_COMMAND_SET != 0 {
                    profile = Some(index as u32);
                    break;
                }
            }

            let Some(profile) = profile else {
                warn!("nvme", "- device does not implement NVM command set, aborting");
                return Err(Errno::ENODEV);
            };

            info!("nvme", "- using I/O command set profile {profile}");

            let mut cmd = SubmissionEntry::zeroed();
            cmd.dword0 = u32::from(ADMIN_SET_FEATURES) | (0x9876 << 16);
            // the data pointer is unused by this feature but must be valid
            cmd.data_low = id.phys();
            cmd.dword10 = FID_COMMAND_SET_PROFILE;
            cmd.dword11 = profile;
            self.submit(0, &cmd);
            if self.poll(0, 0x9876, ADMIN_POLL_TIMEOUT).is_none() {
                warn!("nvme", "- timeout while setting command set profile, aborting");
                return Err(Errno::EIO);
            }
        }

        // CNS 7: active namespaces of the NVM command set, up to 1024
        // identifiers
        let mut cmd = SubmissionEntry::zeroed();
        cmd.dword0 = u32::from(ADMIN_IDENTIFY) | (0xBEEF << 16);
        cmd.data_low = id.phys();
        cmd.dword10 = CNS_ACTIVE_NAMESPACES;
        cmd.dword11 = 0; // CSI 0: NVM command set
        self.submit(0, &cmd);
        if self.poll(0, 0xBEEF, ADMIN_POLL_TIMEOUT).is_none() {
            warn!("nvme", "- timeout while identifying NVM namespaces, aborting");
            return Err(Errno::EIO);
        }

        let mut namespaces = Vec::new();
        for index in 0..1024 {
            let mut raw = [0u8; 4];
            id.read(index * 4, &mut raw);
            let nsid = u32::from_le_bytes(raw);
            if nsid != 0 && nsid < 0xFFFF_FFFE {
                namespaces.push(nsid);
            }
        }

        if namespaces.is_empty() {
            warn!("nvme", "- drive does not implement any namespaces, aborting");
            return Err(Errno::ENODEV);
        }

        info!(
            "nvme",
            "- found {} namespace{} implementing NVM I/O commands",
            namespaces.len(),
            if namespaces.len() == 1 { "" } else { "s" }
        );

        // CNS 0 per namespace: capacity and the active LBA format
        let mut sizes = Vec::with_capacity(namespaces.len());
        let mut sector_sizes = Vec::with_capacity(namespaces.len());
        for (index, &nsid) in namespaces.iter().enumerate() {
            let command_id = 0x4000 + index as u32;

            let mut cmd = SubmissionEntry::zeroed();
            cmd.dword0 = u32::from(ADMIN_IDENTIFY) | (command_id << 16);
            cmd.namespace_id = nsid;
            cmd.data_low = id.phys();
            cmd.dword10 = CNS_IDENTIFY_NAMESPACE;
            self.submit(0, &cmd);
            if self.poll(0, command_id as u16, ADMIN_POLL_TIMEOUT).is_none() {
                warn!("nvme", "- timeout while identifying namespace {nsid}, aborting");
                return Err(Errno::EIO);
            }

            sizes.push(id.read_u64(0));

            // FLBAS selects the active entry of the LBA format table at
            // byte 128; its `ds` field is a power-of-two sector size
            let mut flbas = [0u8; 1];
            id.read(26, &mut flbas);
            let mut lbaf = [0u8; 4];
            id.read(128 + 4 * (flbas[0] & 0x0F) as usize, &mut lbaf);
            sector_sizes.push(1u64 << lbaf[2]);
        }

        self.set_namespaces(namespaces, sizes, sector_sizes);
        Ok(())
    }
}
