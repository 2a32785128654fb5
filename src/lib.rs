//! User-space I/O plane for a lux-style microkernel.
//!
//! The kernel delegates POSIX-shaped filesystem and device operations to the
//! servers implemented here, over datagram messages carrying the envelope
//! defined in [`ipc`]:
//!
//! - [`vfs`] routes each syscall to the filesystem server owning the path;
//! - [`fs::lxfs`] implements the block-linked on-disk filesystem with its
//!   write-back block cache;
//! - [`fs::devfs`] owns the device-file namespace and relays to drivers;
//! - [`drivers::sdev`] exposes registered storage devices as `/sdN`;
//! - [`drivers::ide`] and [`drivers::nvme`] implement the polled,
//!   timeout-bounded hardware state machines behind them;
//! - [`pty`] implements the pseudo-terminal line state machine.
//!
//! Each server is a single-threaded cooperative loop; all cross-server
//! coordination happens through messages.

pub mod drivers;
mod err;
pub mod fs;
pub mod io;
pub mod ipc;
pub mod log;
pub mod pty;
pub mod time;
pub mod vfs;

pub mod errors {
    pub use crate::err::*;
}
