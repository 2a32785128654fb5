//! Device driver for NVMe SSDs.
//!
//! References:
//! - NVM Express Base Specification 2.1
//! - NVM Command Set Specification 1.1
//! - NVM Express over PCIe Transport Specification 1.1

pub mod admin;
pub mod dma;
pub mod io;
pub mod queue;
pub mod regs;
pub mod server;

use crate::drivers::nvme::dma::{DmaAllocator, DmaBuffer};
use crate::drivers::nvme::queue::{QueuePair, SubmissionEntry};
use crate::drivers::nvme::regs::{
    Mmio, NVME_ACQ, NVME_AQA, NVME_ASQ, NVME_CAP, NVME_CAP_DSTRD_MASK, NVME_CAP_DSTRD_SHIFT,
    NVME_CAP_MAXQ_MASK, NVME_CAP_MPSMAX_MASK, NVME_CAP_MPSMAX_SHIFT, NVME_CAP_NVM_CMDS,
    NVME_CONFIG, NVME_CONFIG_CMDS_MASK, NVME_CONFIG_CMDS_NVM, NVME_CONFIG_CMDS_SHIFT,
    NVME_CONFIG_CQES_MASK, NVME_CONFIG_CQES_SHIFT, NVME_CONFIG_EN, NVME_CONFIG_MPS_MASK,
    NVME_CONFIG_MPS_SHIFT, NVME_CONFIG_SQES_MASK, NVME_CONFIG_SQES_SHIFT, NVME_STATUS,
    NVME_STATUS_RDY,
};
use crate::errors::Errno;
use crate::time::YieldBudget;
use crate::{info, warn};

/// Admin queue depth, in entries.
pub const ADMIN_QUEUE_SIZE: usize = 64;

/// I/O queue depth, in entries.
pub const IO_QUEUE_SIZE: usize = 64;

/// I/O queue pairs created at initialization.
pub const IO_QUEUE_COUNT: usize = 2;

/// Bound on controller-readiness polling, in scheduler yields.
const READY_TIMEOUT: u32 = 1000;

/// One NVMe controller with its admin and I/O queue pairs.
pub struct NvmeController {
    regs: Box<dyn Mmio>,
    dma: Box<dyn DmaAllocator>,

    page_size: usize,
    doorbell_stride: usize,
    max_queues: u32,

    admin: QueuePair,
    io_queues: Vec<QueuePair>,

    /// Scratch buffer for identify transfers.
    id_buffer: DmaBuffer,

    pub serial: String,
    pub model: String,

    /// Active namespace identifiers.
    ns: Vec<u32>,

    /// Per-namespace capacity in sectors.
    ns_sizes: Vec<u64>,

    /// Per-namespace sector size in bytes.
    ns_sector_sizes: Vec<u64>,
}

impl NvmeController {
    /// Brings up a controller: capability checks, reset, admin queue
    /// programming, enable, identification, and I/O queue creation.
    pub fn init(
        mut regs: Box<dyn Mmio>,
        mut dma: Box<dyn DmaAllocator>,
    ) -> Result<Self, Errno> {
        let cap = regs.read64(NVME_CAP);

        if cap & NVME_CAP_NVM_CMDS == 0 {
            warn!("nvme", "- drive does not support NVM command set, aborting");
            return Err(Errno::ENODEV);
        }

        let max_queues = (cap & NVME_CAP_MAXQ_MASK) as u32 + 1;
        let doorbell_stride = 4 << ((cap & NVME_CAP_DSTRD_MASK) >> NVME_CAP_DSTRD_SHIFT);
        let max_page = 1u64 << (((cap & NVME_CAP_MPSMAX_MASK) >> NVME_CAP_MPSMAX_SHIFT) + 12);

        info!(
            "nvme",
            "- max {max_queues} queues, doorbell stride {doorbell_stride}"
        );

        // disable the controller while reprogramming it
        let config = regs.read32(NVME_CONFIG);
        regs.write32(NVME_CONFIG, config & !NVME_CONFIG_EN);

        // use the largest page size the controller offers
        let mut config = regs.read32(NVME_CONFIG);
        config &= !(NVME_CONFIG_MPS_MASK << NVME_CONFIG_MPS_SHIFT);
        let page_size = if max_page >= 65536 {
            config |= 4 << NVME_CONFIG_MPS_SHIFT;
            65536
        } else if max_page >= 32768 {
            config |= 3 << NVME_CONFIG_MPS_SHIFT;
            32768
        } else if max_page >= 16384 {
            config |= 2 << NVME_CONFIG_MPS_SHIFT;
            16384
        } else {
            4096
        };

        info!("nvme", "- set page size to {} KiB", page_size / 1024);

        // NVM command set, 64-byte submission entries, 16-byte completion
        // entries
        config &= !(NVME_CONFIG_CMDS_MASK << NVME_CONFIG_CMDS_SHIFT);
        config |= NVME_CONFIG_CMDS_NVM << NVME_CONFIG_CMDS_SHIFT;
        config &= !(NVME_CONFIG_SQES_MASK << NVME_CONFIG_SQES_SHIFT);
        config |= 7 << NVME_CONFIG_SQES_SHIFT;
        config &= !(NVME_CONFIG_CQES_MASK << NVME_CONFIG_CQES_SHIFT);
        config |= 4 << NVME_CONFIG_CQES_SHIFT;
        regs.write32(NVME_CONFIG, config);

        // admin queues, 64 entries each
        let aqa = ((ADMIN_QUEUE_SIZE as u32) << 16) | ADMIN_QUEUE_SIZE as u32;
        regs.write32(NVME_AQA, aqa);

        let asq = dma.alloc(ADMIN_QUEUE_SIZE * 64)?;
        let acq = dma.alloc(ADMIN_QUEUE_SIZE * 16)?;
        asq.fill(0);
        acq.fill(0);

        regs.write64(NVME_ASQ, asq.phys());
        regs.write64(NVME_ACQ, acq.phys());

        // enable and wait for readiness
        let config = regs.read32(NVME_CONFIG);
        regs.write32(NVME_CONFIG, config | NVME_CONFIG_EN);

        let mut budget = YieldBudget::new(READY_TIMEOUT);
        while regs.read32(NVME_STATUS) & NVME_STATUS_RDY == 0 {
            if !budget.yield_once() {
                warn!("nvme", "- controller did not become ready, aborting");
                return Err(Errno::EIO);
            }
        }

        let id_buffer = dma.alloc(4096)?;

        let mut controller = Self {
            regs,
            dma,
            page_size,
            doorbell_stride,
            max_queues,
            admin: QueuePair::new(asq, acq, ADMIN_QUEUE_SIZE),
            io_queues: Vec::new(),
            id_buffer,
            serial: String::new(),
            model: String::new(),
            ns: Vec::new(),
            ns_sizes: Vec::new(),
            ns_sector_sizes: Vec::new(),
        };

        controller.identify()?;
        controller.create_io_queues()?;
        Ok(controller)
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn doorbell_stride(&self) -> usize {
        self.doorbell_stride
    }

    #[must_use]
    pub fn max_queues(&self) -> u32 {
        self.max_queues
    }

    /// Number of active namespaces.
    #[must_use]
    pub fn ns_count(&self) -> usize {
        self.ns.len()
    }

    /// Capacity of a namespace in sectors.
    #[must_use]
    pub fn ns_size(&self, ns: usize) -> Option<u64> {
        self.ns_sizes.get(ns).copied()
    }

    /// Sector size of a namespace in bytes.
    #[must_use]
    pub fn ns_sector_size(&self, ns: usize) -> Option<u64> {
        self.ns_sector_sizes.get(ns).copied()
    }

    pub(crate) fn queue_mut(&mut self, q: usize) -> &mut QueuePair {
        if q == 0 {
            &mut self.admin
        } else {
            &mut self.io_queues[q - 1]
        }
    }

    pub(crate) fn io_queues(&self) -> &[QueuePair] {
        &self.io_queues
    }

    pub(crate) fn regs_mut(&mut self) -> &mut dyn Mmio {
        self.regs.as_mut()
    }

    pub(crate) fn dma_mut(&mut self) -> &mut dyn DmaAllocator {
        self.dma.as_mut()
    }

    pub(crate) fn id_buffer(&self) -> DmaBuffer {
        self.id_buffer.clone()
    }

    pub(crate) fn namespace_id(&self, ns: usize) -> Option<u32> {
        self.ns.get(ns).copied()
    }

    pub(crate) fn set_namespaces(&mut self, ns: Vec<u32>, sizes: Vec<u64>, sector_sizes: Vec<u64>) {
        self.ns = ns;
        self.ns_sizes = sizes;
        self.ns_sector_sizes = sector_sizes;
    }

    /// Creates the I/O queue pairs through admin CREATE commands: each
    /// completion queue first, then its submission queue bound to it.
    fn create_io_queues(&mut self) -> Result<(), Errno> {
        use crate::drivers::nvme::admin::{
            ADMIN_CREATE_COMQ, ADMIN_CREATE_SUBQ, ADMIN_POLL_TIMEOUT,
        };
        use bytemuck::Zeroable;

        let count = IO_QUEUE_COUNT.min(self.max_queues.saturating_sub(1) as usize).max(1);

        for index in 0..count {
            let qid = (index + 1) as u32;

            let sq = self.dma_mut().alloc(IO_QUEUE_SIZE * 64)?;
            let cq = self.dma_mut().alloc(IO_QUEUE_SIZE * 16)?;
            sq.fill(0);
            cq.fill(0);

            let mut cmd = SubmissionEntry::zeroed();
            cmd.dword0 = u32::from(ADMIN_CREATE_COMQ) | ((0x0C00 + qid) << 16);
            cmd.data_low = cq.phys();
            cmd.dword10 = ((IO_QUEUE_SIZE as u32 - 1) << 16) | qid;
            cmd.dword11 = 0x1; // physically contiguous
            self.submit(0, &cmd);
            let completion = self
                .poll(0, (0x0C00 + qid) as u16, ADMIN_POLL_TIMEOUT)
                .ok_or(Errno::EIO)?;
            if !completion.ok() {
                return Err(Errno::EIO);
            }

            let mut cmd = SubmissionEntry::zeroed();
            cmd.dword0 = u32::from(ADMIN_CREATE_SUBQ) | ((0x0500 + qid) << 16);
            cmd.data_low = sq.phys();
            cmd.dword10 = ((IO_QUEUE_SIZE as u32 - 1) << 16) | qid;
            cmd.dword11 = (qid << 16) | 0x1; // bound to its completion queue
            self.submit(0, &cmd);
            let completion = self
                .poll(0, (0x0500 + qid) as u16, ADMIN_POLL_TIMEOUT)
                .ok_or(Errno::EIO)?;
            if !completion.ok() {
                return Err(Errno::EIO);
            }

            self.io_queues.push(QueuePair::new(sq, cq, IO_QUEUE_SIZE));
        }

        Ok(())
    }
}
