//! NVM I/O command submission.

use bytemuck::Zeroable;

use crate::drivers::nvme::dma::{build_prps, DmaBuffer};
use crate::drivers::nvme::queue::SubmissionEntry;
use crate::drivers::nvme::NvmeController;
use crate::errors::Errno;

pub const NVM_FLUSH: u8 = 0x00;
pub const NVM_WRITE: u8 = 0x01;
pub const NVM_READ: u8 = 0x02;

/// Completion polling bound for I/O commands, in scheduler yields.
pub const IO_POLL_TIMEOUT: u32 = 1000;

/// An in-flight transfer: the queue it went to, its command identifier, the
/// data buffer, and the PRP list page kept alive until completion.
pub struct IoRequest {
    pub queue: usize,
    pub id: u16,
    pub buffer: DmaBuffer,
    pub prp_list: Option<DmaBuffer>,
}

impl NvmeController {
    fn start_transfer(
        &mut self,
        opcode: u8,
        ns: usize,
        id: u16,
        lba: u64,
        count: u16,
    ) -> Result<(SubmissionEntry, DmaBuffer, Option<DmaBuffer>, usize), Errno> {
        if id == 0 || count == 0 {
            return Err(Errno::EINVAL);
        }

        let size = self.ns_size(ns).ok_or(Errno::ENODEV)?;
        let sector_size = self.ns_sector_size(ns).ok_or(Errno::ENODEV)?;
        if lba + u64::from(count) > size {
            return Err(Errno::EIO);
        }

        let len = u64::from(count) * sector_size;
        let nsid = self.namespace_id(ns).ok_or(Errno::ENODEV)?;
        let page_size = self.page_size();

        let buffer = self.dma_mut().alloc(len as usize)?;

        let mut cmd = SubmissionEntry::zeroed();
        cmd.dword0 = u32::from(opcode) | (u32::from(id) << 16);
        cmd.namespace_id = nsid;
        let prp_list = build_prps(&mut cmd, &buffer, len as usize, page_size, self.dma_mut())?;

        cmd.dword10 = lba as u32;
        cmd.dword11 = (lba >> 32) as u32;
        cmd.dword12 = u32::from(count) - 1;

        let queue = self.least_busy_queue();
        Ok((cmd, buffer, prp_list, queue))
    }

    /// Submits a read of `count` sectors starting at `lba` in namespace
    /// index `ns`. The caller polls the returned request for completion and
    /// then reads the data out of its buffer.
    pub fn read_sectors(
        &mut self,
        ns: usize,
        id: u16,
        lba: u64,
        count: u16,
    ) -> Result<IoRequest, Errno> {
        let (cmd, buffer, prp_list, queue) = self.start_transfer(NVM_READ, ns, id, lba, count)?;
        self.submit(queue, &cmd);

        Ok(IoRequest {
            queue,
            id,
            buffer,
            prp_list,
        })
    }

    /// Submits a write of `data` (exactly `count` sectors) starting at
    /// `lba` in namespace index `ns`.
    pub fn write_sectors(
        &mut self,
        ns: usize,
        id: u16,
        lba: u64,
        count: u16,
        data: &[u8],
    ) -> Result<IoRequest, Errno> {
        let (cmd, buffer, prp_list, queue) = self.start_transfer(NVM_WRITE, ns, id, lba, count)?;
        if data.len() != buffer.len() {
            return Err(Errno::EINVAL);
        }

        buffer.write(0, data);
        self.submit(queue, &cmd);

        Ok(IoRequest {
            queue,
            id,
            buffer,
            prp_list,
        })
    }

    /// Polls a request to completion; `EIO` on timeout or controller
    /// error. Late completions of timed-out commands are simply discarded
    /// by the next poll on the queue.
    pub fn wait(&mut self, request: &IoRequest) -> Result<(), Errno> {
        let completion = self
            .poll(request.queue, request.id, IO_POLL_TIMEOUT)
            .ok_or(Errno::EIO)?;

        if !completion.ok() {
            return Err(Errno::EIO);
        }

        Ok(())
    }
}
