//! Pseudo-terminal engine.
//!
//! Each pty pairs a primary (multiplexer) half with a secondary (user-facing)
//! half. Writes to the primary append to the primary buffer; reads from the
//! secondary consume it. In canonical mode a read is only satisfied once a
//! newline is present, backspace pops the last byte, and with ISIG the
//! interrupt and quit control characters raise a signal against the
//! foreground process group instead of being buffered. The engine is a pure
//! state machine: delivery of signals and devfs node management belong to
//! the surrounding server.

use bytemuck::Zeroable;
use conquer_once::spin::OnceCell;
use spin::RwLock;

use crate::errors::Errno;
use crate::ipc::wire::{FileStatus, S_IFCHR, S_IRUSR, S_IWGRP, S_IWUSR};

/// Process-global pty table of the devfs collaborator.
pub fn pty_registry() -> &'static RwLock<PtyRegistry> {
    static PTYS: OnceCell<RwLock<PtyRegistry>> = OnceCell::uninit();

    PTYS.try_get_or_init(|| RwLock::new(PtyRegistry::new()))
        .unwrap()
}

/// Bound on simultaneously allocated pseudo-terminals.
pub const MAX_PTYS: usize = 4096;

pub const ICRNL: u32 = 0x0001;
pub const IGNCR: u32 = 0x0002;
pub const IGNPAR: u32 = 0x0004;

pub const ONLRET: u32 = 0x0001;

pub const CS8: u32 = 0x0030;
pub const HUPCL: u32 = 0x0040;

pub const ECHO: u32 = 0x0001;
pub const ECHOE: u32 = 0x0002;
pub const ECHOK: u32 = 0x0004;
pub const ECHONL: u32 = 0x0008;
pub const ICANON: u32 = 0x0010;
pub const ISIG: u32 = 0x0020;

pub const DEFAULT_IFLAG: u32 = ICRNL | IGNCR | IGNPAR;
pub const DEFAULT_OFLAG: u32 = ONLRET;
pub const DEFAULT_CFLAG: u32 = CS8 | HUPCL;
pub const DEFAULT_LFLAG: u32 = ECHO | ECHOE | ECHOK | ECHONL | ICANON;

pub const VEOF: usize = 0;
pub const VEOL: usize = 1;
pub const VERASE: usize = 2;
pub const VINTR: usize = 3;
pub const VKILL: usize = 4;
pub const VMIN: usize = 5;
pub const VQUIT: usize = 6;
pub const VSTART: usize = 7;
pub const VSTOP: usize = 8;
pub const VSUSP: usize = 9;
pub const VTIME: usize = 10;
pub const NCCS: usize = 11;

/// Terminal line settings.
#[derive(Clone, Copy, Debug)]
pub struct Termios {
    pub c_iflag: u32,
    pub c_oflag: u32,
    pub c_cflag: u32,
    pub c_lflag: u32,
    pub c_cc: [u8; NCCS],
}

impl Default for Termios {
    fn default() -> Self {
        let mut c_cc = [0u8; NCCS];
        c_cc[VEOF] = 0x04; // ^D
        c_cc[VEOL] = b'\n';
        c_cc[VERASE] = 0x08; // backspace
        c_cc[VINTR] = 0x03; // ^C
        c_cc[VKILL] = 0x15; // ^U
        c_cc[VMIN] = 1;
        c_cc[VQUIT] = 0x1C; // ^backslash
        c_cc[VSTART] = 0x11; // ^Q
        c_cc[VSTOP] = 0x13; // ^S
        c_cc[VSUSP] = 0x1A; // ^Z

        Self {
            c_iflag: DEFAULT_IFLAG,
            c_oflag: DEFAULT_OFLAG,
            c_cflag: DEFAULT_CFLAG,
            c_lflag: DEFAULT_LFLAG,
            c_cc,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Winsize {
    pub ws_row: u16,
    pub ws_col: u16,
}

pub const DEFAULT_WIDTH: u16 = 80;
pub const DEFAULT_HEIGHT: u16 = 25;

/// Signal the engine asks the server to deliver to the foreground process
/// group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PtySignal {
    Interrupt,
    Quit,
}

/// Outcome of a primary-side write.
#[derive(Debug, Default)]
pub struct PrimaryWrite {
    /// Bytes accepted (control bytes that raised a signal count as
    /// accepted).
    pub count: usize,

    /// Signal to deliver to the foreground process group, if any.
    pub signal: Option<PtySignal>,
}

/// One pseudo-terminal pair.
pub struct Pty {
    pub index: usize,
    pub open_count: u32,
    pub locked: bool,
    pub termios: Termios,
    pub winsize: Winsize,
    pub foreground_group: i32,
    primary: Vec<u8>,
    secondary: Vec<u8>,
}

impl Pty {
    fn new(index: usize) -> Self {
        Self {
            index,
            open_count: 1,
            locked: true,
            termios: Termios::default(),
            winsize: Winsize {
                ws_row: DEFAULT_HEIGHT,
                ws_col: DEFAULT_WIDTH,
            },
            foreground_group: 0,
            primary: Vec::new(),
            secondary: Vec::new(),
        }
    }

    /// Appends input from the primary half (keystrokes headed for the
    /// process reading the secondary).
    pub fn write_primary(&mut self, data: &[u8]) -> PrimaryWrite {
        let mut outcome = PrimaryWrite {
            count: data.len(),
            signal: None,
        };

        if self.termios.c_lflag & ISIG != 0 {
            if let Some(&control) = data.first() {
                if control == self.termios.c_cc[VINTR] {
                    outcome.signal = Some(PtySignal::Interrupt);
                    return outcome;
                }
                if control == self.termios.c_cc[VQUIT] {
                    outcome.signal = Some(PtySignal::Quit);
                    return outcome;
                }
            }
        }

        let echo = self.termios.c_lflag & ECHO != 0;

        if self.termios.c_lflag & ICANON != 0 {
            for &byte in data {
                if byte == self.termios.c_cc[VERASE] || byte == 0x08 {
                    if self.primary.pop().is_some() && echo {
                        self.secondary.push(0x08);
                    }
                } else {
                    self.primary.push(byte);
                    if echo {
                        self.secondary.push(byte);
                    }
                }
            }
        } else {
            self.primary.extend_from_slice(data);
            if echo {
                self.secondary.extend_from_slice(data);
            }
        }

        outcome
    }

    /// Consumes buffered input from the secondary half.
    ///
    /// In canonical mode the read blocks (returns `None`) until a newline is
    /// buffered, and returns at most one line.
    pub fn read_secondary(&mut self, length: usize) -> Option<Vec<u8>> {
        if self.primary.is_empty() || length == 0 {
            return None;
        }

        let available = if self.termios.c_lflag & ICANON != 0 {
            let newline = self.primary.iter().position(|&b| b == b'\n')?;
            newline + 1
        } else {
            self.primary.len()
        };

        let take = available.min(length);
        Some(self.primary.drain(..take).collect())
    }

    /// Appends output from the secondary half (process output headed for
    /// the terminal multiplexer).
    pub fn write_secondary(&mut self, data: &[u8]) -> usize {
        self.secondary.extend_from_slice(data);
        data.len()
    }

    /// Consumes buffered output from the primary half.
    pub fn read_primary(&mut self, length: usize) -> Option<Vec<u8>> {
        if self.secondary.is_empty() || length == 0 {
            return None;
        }

        let take = self.secondary.len().min(length);
        Some(self.secondary.drain(..take).collect())
    }
}

/// The pty table: allocation is deterministic by lowest free index.
pub struct PtyRegistry {
    ptys: Vec<Option<Pty>>,
}

impl PtyRegistry {
    #[must_use]
    pub fn new() -> Self {
        let mut ptys = Vec::with_capacity(MAX_PTYS);
        ptys.resize_with(MAX_PTYS, || None);
        Self { ptys }
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Pty> {
        self.ptys.get(index)?.as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Pty> {
        self.ptys.get_mut(index)?.as_mut()
    }

    /// Opens the primary multiplexer: allocates the lowest free index with
    /// default line settings, locked until `unlockpt`.
    pub fn open_primary(&mut self) -> Result<usize, Errno> {
        let index = self
            .ptys
            .iter()
            .position(Option::is_none)
            .ok_or(Errno::ENOENT)?;

        self.ptys[index] = Some(Pty::new(index));
        Ok(index)
    }

    /// Opens the secondary half; fails with `EIO` while the pair is still
    /// locked.
    pub fn open_secondary(&mut self, index: usize) -> Result<(), Errno> {
        let pty = self.get_mut(index).ok_or(Errno::ENOENT)?;
        if pty.locked {
            return Err(Errno::EIO);
        }

        pty.open_count += 1;
        Ok(())
    }

    /// `unlockpt`: allows the secondary to be opened.
    pub fn unlock(&mut self, index: usize) -> Result<(), Errno> {
        let pty = self.get_mut(index).ok_or(Errno::ENOENT)?;
        pty.locked = false;
        Ok(())
    }

    /// `grantpt`: returns the chstat projection making the secondary
    /// `rw--w----` owned by the calling uid.
    pub fn grant(&mut self, index: usize, uid: u32) -> Result<FileStatus, Errno> {
        let pty = self.get(index).ok_or(Errno::ENOENT)?;

        let mut status = FileStatus::zeroed();
        status.st_mode = S_IFCHR | S_IRUSR | S_IWUSR | S_IWGRP;
        status.st_uid = uid;
        status.st_size = 4096;
        status.st_ino = pty.index as u64;
        Ok(status)
    }
}

impl Default for PtyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_picks_lowest_free_index() {
        let mut registry = PtyRegistry::new();
        assert_eq!(registry.open_primary().unwrap(), 0);
        assert_eq!(registry.open_primary().unwrap(), 1);

        registry.ptys[0] = None;
        assert_eq!(registry.open_primary().unwrap(), 0);
    }

    #[test]
    fn secondary_blocked_until_unlocked() {
        let mut registry = PtyRegistry::new();
        let index = registry.open_primary().unwrap();

        assert_eq!(registry.open_secondary(index), Err(Errno::EIO));
        registry.unlock(index).unwrap();
        assert_eq!(registry.open_secondary(index), Ok(()));
    }

    #[test]
    fn canonical_read_waits_for_newline() {
        let mut registry = PtyRegistry::new();
        let index = registry.open_primary().unwrap();
        let pty = registry.get_mut(index).unwrap();

        pty.write_primary(b"ls -l");
        assert!(pty.read_secondary(64).is_none());

        pty.write_primary(b"\n");
        assert_eq!(pty.read_secondary(64).unwrap(), b"ls -l\n");
    }

    #[test]
    fn backspace_pops_and_echoes() {
        let mut registry = PtyRegistry::new();
        let index = registry.open_primary().unwrap();
        let pty = registry.get_mut(index).unwrap();

        pty.write_primary(b"ab\x08c\n");
        assert_eq!(pty.read_secondary(64).unwrap(), b"ac\n");

        // echo carries the typed bytes plus the backspace
        assert_eq!(pty.read_primary(64).unwrap(), b"ab\x08c\n");
    }

    #[test]
    fn raw_mode_reads_whatever_is_buffered() {
        let mut registry = PtyRegistry::new();
        let index = registry.open_primary().unwrap();
        let pty = registry.get_mut(index).unwrap();
        pty.termios.c_lflag &= !ICANON;

        pty.write_primary(b"xy");
        assert_eq!(pty.read_secondary(1).unwrap(), b"x");
        assert_eq!(pty.read_secondary(8).unwrap(), b"y");
    }

    #[test]
    fn isig_raises_instead_of_buffering() {
        let mut registry = PtyRegistry::new();
        let index = registry.open_primary().unwrap();
        let pty = registry.get_mut(index).unwrap();

        let outcome = pty.write_primary(&[0x03]);
        assert_eq!(outcome.signal, Some(PtySignal::Interrupt));
        assert!(pty.read_secondary(64).is_none());

        let outcome = pty.write_primary(&[0x1C]);
        assert_eq!(outcome.signal, Some(PtySignal::Quit));
    }

    #[test]
    fn grant_projects_secondary_ownership() {
        let mut registry = PtyRegistry::new();
        let index = registry.open_primary().unwrap();

        let status = registry.grant(index, 1000).unwrap();
        assert_eq!({ status.st_uid }, 1000);
        assert_eq!({ status.st_mode } & 0o777, 0o620);
        assert_eq!({ status.st_mode } & 0xF000, S_IFCHR);
    }
}
