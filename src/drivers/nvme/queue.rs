//! Submission and completion queue protocol.
//!
//! Each queue pair is a circular submission queue written by software and a
//! companion completion queue written by the controller. Software advances
//! the tail on submit and announces it through the queue's doorbell; the
//! controller flips the completion entry's phase bit each pass around the
//! ring, which is what the poll loop keys on.

use bytemuck::{Pod, Zeroable};

use crate::drivers::nvme::dma::DmaBuffer;
use crate::drivers::nvme::regs::{completion_doorbell, submission_doorbell};
use crate::drivers::nvme::NvmeController;
use crate::time::YieldBudget;

/// A 64-byte submission queue entry.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct SubmissionEntry {
    /// Opcode in the low byte, command identifier in bits 16..32.
    pub dword0: u32,
    pub namespace_id: u32,
    pub dword2: u32,
    pub dword3: u32,
    pub metaptr: u64,
    pub data_low: u64,
    pub data_high: u64,
    pub dword10: u32,
    pub dword11: u32,
    pub dword12: u32,
    pub dword13: u32,
    pub dword14: u32,
    pub dword15: u32,
}

const _: () = assert!(core::mem::size_of::<SubmissionEntry>() == 64);

/// A 16-byte completion queue entry.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct CompletionEntry {
    pub result: u32,
    pub reserved: u32,
    pub sq_head: u16,
    pub sq_id: u16,
    pub command_id: u16,
    /// Phase bit in bit 0, status code above it.
    pub status: u16,
}

const _: () = assert!(core::mem::size_of::<CompletionEntry>() == 16);

impl CompletionEntry {
    #[must_use]
    pub fn phase(&self) -> bool {
        self.status & 1 != 0
    }

    /// True when the controller reported success.
    #[must_use]
    pub fn ok(&self) -> bool {
        (self.status >> 1) == 0
    }
}

/// One queue pair and its software-tracked state.
pub struct QueuePair {
    pub sq: DmaBuffer,
    pub cq: DmaBuffer,
    pub size: usize,
    pub tail: usize,
    pub cq_head: usize,
    pub phase: bool,
    pub in_flight: u32,
}

impl QueuePair {
    #[must_use]
    pub fn new(sq: DmaBuffer, cq: DmaBuffer, size: usize) -> Self {
        Self {
            sq,
            cq,
            size,
            tail: 0,
            cq_head: 0,
            phase: true,
            in_flight: 0,
        }
    }
}

impl NvmeController {
    /// Copies a command into the submission queue, clears the matching
    /// completion slot, advances the tail, and rings the submission
    /// doorbell. Queue zero is the admin queue.
    pub fn submit(&mut self, q: usize, cmd: &SubmissionEntry) {
        let stride = self.doorbell_stride();
        let queue = self.queue_mut(q);

        let tail = queue.tail;
        queue.sq.write(tail * 64, bytemuck::bytes_of(cmd));
        queue
            .cq
            .write(tail * 16, bytemuck::bytes_of(&CompletionEntry::zeroed()));

        queue.tail = (queue.tail + 1) % queue.size;
        queue.in_flight += 1;
        let next_tail = queue.tail;

        let doorbell = submission_doorbell(stride, q);
        self.regs_mut().write32(doorbell, next_tail as u32);
    }

    /// Polls the completion queue for a command by identifier, bounded by a
    /// yield budget, and acknowledges it through the completion doorbell.
    pub fn poll(&mut self, q: usize, id: u16, timeout: u32) -> Option<CompletionEntry> {
        let stride = self.doorbell_stride();
        let mut budget = YieldBudget::new(timeout);

        loop {
            let queue = self.queue_mut(q);
            let head = queue.cq_head;

            let mut raw = [0u8; 16];
            queue.cq.read(head * 16, &mut raw);
            let entry = bytemuck::pod_read_unaligned::<CompletionEntry>(&raw);

            if entry.phase() == queue.phase && entry.command_id == id {
                queue.cq_head = (head + 1) % queue.size;
                if queue.cq_head == 0 {
                    queue.phase = !queue.phase;
                }
                queue.in_flight = queue.in_flight.saturating_sub(1);
                let new_head = queue.cq_head;

                let doorbell = completion_doorbell(stride, q);
                self.regs_mut().write32(doorbell, new_head as u32);
                return Some(entry);
            }

            if !budget.yield_once() {
                return None;
            }
        }
    }

    /// Returns the least-busy I/O queue, one-based because zero is the
    /// admin queue.
    #[must_use]
    pub fn least_busy_queue(&self) -> usize {
        let mut smallest = u32::MAX;
        let mut chosen = 0;

        for (index, queue) in self.io_queues().iter().enumerate() {
            if queue.in_flight < smallest {
                smallest = queue.in_flight;
                chosen = index;
            }
        }

        chosen + 1
    }
}
