//! Storage drivers and the device abstraction layer above them.
//!
//! [`sdev`] presents every registered storage device as `/sdN` and relays
//! sector-granular requests to the hardware driver that owns it. [`ide`] and
//! [`nvme`] are those drivers: polled, timeout-bounded state machines over
//! the hardware access seams ([`crate::io::PortIo`] for ATA,
//! [`nvme::regs::Mmio`] plus [`nvme::dma::DmaAllocator`] for NVMe). [`pci`]
//! carries the configuration-space facts the external PCI scanner hands to
//! drivers.

pub mod ide;
pub mod nvme;
pub mod pci;
pub mod sdev;
