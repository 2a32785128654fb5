//! NVMe driver scenarios against a simulated controller.

use std::cell::RefCell;
use std::rc::Rc;

use luxd::drivers::nvme::dma::{DmaAllocator, DmaBuffer};
use luxd::drivers::nvme::regs::{
    Mmio, NVME_ACQ, NVME_AQA, NVME_ASQ, NVME_CAP, NVME_CONFIG, NVME_CONFIG_EN, NVME_DOORBELLS,
    NVME_STATUS, NVME_STATUS_RDY,
};
use luxd::drivers::nvme::NvmeController;
use luxd::errors::Errno;

const PAGE: usize = 4096;
const SECTOR: u64 = 512;
const NS_SECTORS: u64 = 8192;

const SERIAL: &str = "SIM1234567890SER";
const MODEL: &str = "SIMULATED NVME CONTROLLER";

struct SimQueue {
    sq_phys: u64,
    cq_phys: u64,
    size: usize,
    sq_head: usize,
    cq_index: usize,
    phase: bool,
}

struct SimNvme {
    cc: u32,
    csts: u32,
    aqa: u32,
    asq: u64,
    acq: u64,
    admin: Option<SimQueue>,
    io: Vec<SimQueue>,
    /// Allocation map: base physical address and backing bytes.
    mem: Vec<(u64, Rc<RefCell<Vec<u8>>>)>,
    next_phys: u64,
    disk: Vec<u8>,
}

impl SimNvme {
    fn new() -> Self {
        Self {
            cc: 0,
            csts: 0,
            aqa: 0,
            asq: 0,
            acq: 0,
            admin: None,
            io: Vec::new(),
            mem: Vec::new(),
            next_phys: 0x0010_0000,
            disk: vec![0u8; (NS_SECTORS * SECTOR) as usize],
        }
    }

    fn capability() -> u64 {
        use luxd::drivers::nvme::regs::{NVME_CAP_IO_CMDS, NVME_CAP_NVM_CMDS};
        // 64 queues, stride 4, 4 KiB pages only
        63 | NVME_CAP_NVM_CMDS | NVME_CAP_IO_CMDS
    }

    fn read_mem(&self, phys: u64, out: &mut [u8]) {
        for (base, buf) in &self.mem {
            let buf = buf.borrow();
            if phys >= *base && phys + out.len() as u64 <= base + buf.len() as u64 {
                let at = (phys - base) as usize;
                out.copy_from_slice(&buf[at..at + out.len()]);
                return;
            }
        }
        panic!("simulated DMA read outside any allocation: {phys:#x}");
    }

    fn write_mem(&self, phys: u64, data: &[u8]) {
        for (base, buf) in &self.mem {
            let mut buf = buf.borrow_mut();
            if phys >= *base && phys + data.len() as u64 <= base + buf.len() as u64 {
                let at = (phys - base) as usize;
                buf[at..at + data.len()].copy_from_slice(data);
                return;
            }
        }
        panic!("simulated DMA write outside any allocation: {phys:#x}");
    }

    /// Data pages of a transfer, resolved through PRP1/PRP2 exactly the way
    /// a controller would.
    fn transfer_pages(&self, prp1: u64, prp2: u64, len: usize) -> Vec<u64> {
        let page_count = len.div_ceil(PAGE);
        let mut pages = vec![prp1];

        if page_count == 2 {
            pages.push(prp2);
        } else if page_count > 2 {
            for index in 0..page_count - 1 {
                let mut raw = [0u8; 8];
                self.read_mem(prp2 + (index * 8) as u64, &mut raw);
                pages.push(u64::from_le_bytes(raw));
            }
        }

        pages
    }

    fn execute(&mut self, q: usize, entry: &[u8; 64]) -> (u16, u16) {
        let dword0 = u32::from_le_bytes(entry[0..4].try_into().unwrap());
        let nsid = u32::from_le_bytes(entry[4..8].try_into().unwrap());
        let prp1 = u64::from_le_bytes(entry[24..32].try_into().unwrap());
        let prp2 = u64::from_le_bytes(entry[32..40].try_into().unwrap());
        let dword10 = u32::from_le_bytes(entry[40..44].try_into().unwrap());
        let dword11 = u32::from_le_bytes(entry[44..48].try_into().unwrap());
        let dword12 = u32::from_le_bytes(entry[48..52].try_into().unwrap());

        let opcode = (dword0 & 0xFF) as u8;
        let command_id = (dword0 >> 16) as u16;

        if q == 0 {
            match opcode {
                0x06 => {
                    // identify
                    let mut page = vec![0u8; PAGE];
                    match dword10 {
                        0x01 => {
                            page[4..4 + SERIAL.len()].copy_from_slice(SERIAL.as_bytes());
                            page[24..24 + MODEL.len()].copy_from_slice(MODEL.as_bytes());
                        }
                        0x1C => page[0] = 0x01, // profile 0 carries the NVM set
                        0x07 => page[0..4].copy_from_slice(&1u32.to_le_bytes()),
                        0x00 => {
                            page[0..8].copy_from_slice(&NS_SECTORS.to_le_bytes());
                            page[26] = 0; // FLBAS entry 0
                            page[128 + 2] = 9; // 512-byte sectors
                        }
                        _ => return (command_id, 0x02),
                    }
                    self.write_mem(prp1, &page);
                }
                0x09 => {} // set features
                0x05 => {
                    // create completion queue
                    self.io.push(SimQueue {
                        sq_phys: 0,
                        cq_phys: prp1,
                        size: ((dword10 >> 16) + 1) as usize,
                        sq_head: 0,
                        cq_index: 0,
                        phase: true,
                    });
                }
                0x01 => {
                    // create submission queue bound to its completion queue
                    let qid = (dword10 & 0xFFFF) as usize;
                    if let Some(queue) = self.io.get_mut(qid - 1) {
                        queue.sq_phys = prp1;
                    }
                }
                _ => return (command_id, 0x02),
            }
            return (command_id, 0);
        }

        // NVM I/O commands
        if nsid != 1 {
            return (command_id, 0x02);
        }

        let lba = u64::from(dword10) | (u64::from(dword11) << 32);
        let count = u64::from(dword12) + 1;
        if lba + count > NS_SECTORS {
            return (command_id, 0x02);
        }

        let len = (count * SECTOR) as usize;
        let pages = self.transfer_pages(prp1, prp2, len);
        let disk_at = (lba * SECTOR) as usize;

        match opcode {
            0x02 => {
                // read: disk to pages
                let mut moved = 0;
                for page in pages {
                    let take = (len - moved).min(PAGE);
                    let chunk = self.disk[disk_at + moved..disk_at + moved + take].to_vec();
                    self.write_mem(page, &chunk);
                    moved += take;
                    if moved == len {
                        break;
                    }
                }
            }
            0x01 => {
                // write: pages to disk
                let mut moved = 0;
                for page in pages {
                    let take = (len - moved).min(PAGE);
                    let mut chunk = vec![0u8; take];
                    self.read_mem(page, &mut chunk);
                    self.disk[disk_at + moved..disk_at + moved + take].copy_from_slice(&chunk);
                    moved += take;
                    if moved == len {
                        break;
                    }
                }
            }
            _ => return (command_id, 0x02),
        }

        (command_id, 0)
    }

    fn complete(&mut self, q: usize, command_id: u16, status: u16) {
        let queue = if q == 0 {
            self.admin.as_mut().unwrap()
        } else {
            &mut self.io[q - 1]
        };

        let index = queue.cq_index;
        let phase = queue.phase;
        queue.cq_index = (queue.cq_index + 1) % queue.size;
        if queue.cq_index == 0 {
            queue.phase = !queue.phase;
        }

        let mut entry = [0u8; 16];
        entry[12..14].copy_from_slice(&command_id.to_le_bytes());
        let status_word = (status << 1) | u16::from(phase);
        entry[14..16].copy_from_slice(&status_word.to_le_bytes());

        let cq_phys = if q == 0 {
            self.acq
        } else {
            self.io[q - 1].cq_phys
        };
        self.write_mem(cq_phys + (index * 16) as u64, &entry);
    }

    /// Processes every submission between the queue's head and the rung
    /// tail.
    fn process_doorbell(&mut self, q: usize, tail: usize) {
        if q == 0 && self.admin.is_none() {
            self.admin = Some(SimQueue {
                sq_phys: self.asq,
                cq_phys: self.acq,
                size: ((self.aqa & 0xFFFF) as usize).max(1),
                sq_head: 0,
                cq_index: 0,
                phase: true,
            });
        }

        loop {
            let (head, size, sq_phys) = {
                let queue = if q == 0 {
                    self.admin.as_ref().unwrap()
                } else {
                    &self.io[q - 1]
                };
                (queue.sq_head, queue.size, queue.sq_phys)
            };

            if head == tail {
                break;
            }

            let mut entry = [0u8; 64];
            self.read_mem(sq_phys + (head * 64) as u64, &mut entry);

            {
                let queue = if q == 0 {
                    self.admin.as_mut().unwrap()
                } else {
                    &mut self.io[q - 1]
                };
                queue.sq_head = (head + 1) % size;
            }

            let (command_id, status) = self.execute(q, &entry);
            self.complete(q, command_id, status);
        }
    }
}

#[derive(Clone)]
struct SimHandle {
    state: Rc<RefCell<SimNvme>>,
}

impl Mmio for SimHandle {
    fn read32(&mut self, offset: usize) -> u32 {
        let state = self.state.borrow();
        match offset {
            NVME_CONFIG => state.cc,
            NVME_STATUS => state.csts,
            NVME_AQA => state.aqa,
            _ => 0,
        }
    }

    fn write32(&mut self, offset: usize, data: u32) {
        if offset >= NVME_DOORBELLS {
            let doorbell = (offset - NVME_DOORBELLS) / 4;
            if doorbell % 2 == 0 {
                self.state
                    .borrow_mut()
                    .process_doorbell(doorbell / 2, data as usize);
            }
            return;
        }

        let mut state = self.state.borrow_mut();
        match offset {
            NVME_CONFIG => {
                state.cc = data;
                if data & NVME_CONFIG_EN != 0 {
                    state.csts |= NVME_STATUS_RDY;
                } else {
                    state.csts &= !NVME_STATUS_RDY;
                }
            }
            NVME_AQA => state.aqa = data,
            _ => {}
        }
    }

    fn read64(&mut self, offset: usize) -> u64 {
        match offset {
            NVME_CAP => SimNvme::capability(),
            _ => 0,
        }
    }

    fn write64(&mut self, offset: usize, data: u64) {
        let mut state = self.state.borrow_mut();
        match offset {
            NVME_ASQ => state.asq = data,
            NVME_ACQ => state.acq = data,
            _ => {}
        }
    }
}

impl DmaAllocator for SimHandle {
    fn alloc(&mut self, len: usize) -> Result<DmaBuffer, Errno> {
        let mut state = self.state.borrow_mut();
        let phys = state.next_phys;
        state.next_phys += (len as u64).next_multiple_of(PAGE as u64);

        let buffer = DmaBuffer::new(phys, len);
        state.mem.push((phys, buffer.shared()));
        Ok(buffer)
    }
}

fn simulated_controller() -> (NvmeController, Rc<RefCell<SimNvme>>) {
    let state = Rc::new(RefCell::new(SimNvme::new()));
    let handle = SimHandle {
        state: state.clone(),
    };
    let controller =
        NvmeController::init(Box::new(handle.clone()), Box::new(handle)).expect("controller init");
    (controller, state)
}

#[test]
fn init_identifies_controller() {
    let (controller, state) = simulated_controller();

    assert_eq!(controller.serial, SERIAL);
    assert_eq!(controller.model, MODEL);
    assert_eq!(controller.ns_count(), 1);
    assert_eq!(controller.ns_size(0), Some(NS_SECTORS));
    assert_eq!(controller.ns_sector_size(0), Some(SECTOR));
    assert_eq!(controller.page_size(), PAGE);

    // the controller was left enabled and ready
    assert_eq!(state.borrow().csts & NVME_STATUS_RDY, NVME_STATUS_RDY);
}

#[test]
fn io_round_trip_with_prp_list() {
    let (mut controller, _) = simulated_controller();

    // 24 sectors is three pages, exercising the PRP-list path
    let data: Vec<u8> = (0..24 * SECTOR as usize).map(|i| (i % 249) as u8).collect();
    let request = controller.write_sectors(0, 7, 16, 24, &data).unwrap();
    controller.wait(&request).unwrap();

    let request = controller.read_sectors(0, 8, 16, 24).unwrap();
    controller.wait(&request).unwrap();
    assert_eq!(request.buffer.to_vec(), data);
}

#[test]
fn single_sector_round_trip() {
    let (mut controller, _) = simulated_controller();

    let data = vec![0xC3u8; SECTOR as usize];
    let request = controller.write_sectors(0, 3, 0, 1, &data).unwrap();
    controller.wait(&request).unwrap();

    let request = controller.read_sectors(0, 4, 0, 1).unwrap();
    controller.wait(&request).unwrap();
    assert_eq!(request.buffer.to_vec(), data);
}

#[test]
fn out_of_range_transfer_is_rejected() {
    let (mut controller, _) = simulated_controller();

    assert_eq!(
        controller.read_sectors(0, 5, NS_SECTORS, 1).err(),
        Some(Errno::EIO)
    );
    assert_eq!(
        controller.read_sectors(0, 5, NS_SECTORS - 1, 2).err(),
        Some(Errno::EIO)
    );

    // the final sector itself is addressable
    let request = controller.read_sectors(0, 5, NS_SECTORS - 1, 1).unwrap();
    controller.wait(&request).unwrap();
}

#[test]
fn zero_count_and_zero_id_are_invalid() {
    let (mut controller, _) = simulated_controller();

    assert_eq!(controller.read_sectors(0, 0, 0, 1).err(), Some(Errno::EINVAL));
    assert_eq!(controller.read_sectors(0, 5, 0, 0).err(), Some(Errno::EINVAL));
}
