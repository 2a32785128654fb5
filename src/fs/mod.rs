//! File system servers.
//!
//! [`lxfs`] is the block-backed on-disk filesystem engine; [`devfs`] is the
//! in-memory device-file namespace that routes device I/O to driver servers.
//! Both register themselves with the VFS router by advertising their
//! filesystem type, then serve the syscall commands the router relays.

pub mod devfs;
pub mod lxfs;
