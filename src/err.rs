//! Error taxonomy shared by every server in the crate.
//!
//! Request-handling code reports its outcome through the message envelope's
//! `status` field: a non-negative byte count on success, or the negated
//! [`Errno`] on failure. Nothing is recovered across a request boundary, the
//! originator decides what to do with a failed request.

use core::fmt;

/// `CanFail` is a return type for functions that are allowed to fail, and
/// don't need to return anything.
pub type CanFail<E> = Result<(), E>;

/// Unix-style error kinds carried on the wire as negated `status` values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i64)]
pub enum Errno {
    /// Operation not permitted.
    EPERM = 1,

    /// No such file or directory.
    ENOENT = 2,

    /// Generic I/O error.
    EIO = 5,

    /// Operation would block.
    EWOULDBLOCK = 11,

    /// Out of memory.
    ENOMEM = 12,

    /// Permission denied.
    EACCES = 13,

    /// File exists.
    EEXIST = 17,

    /// Cross-device link.
    EXDEV = 18,

    /// No such device.
    ENODEV = 19,

    /// Not a directory.
    ENOTDIR = 20,

    /// Is a directory.
    EISDIR = 21,

    /// Invalid argument.
    EINVAL = 22,

    /// Inappropriate ioctl for device.
    ENOTTY = 25,

    /// No space left on device.
    ENOSPC = 28,

    /// Function not implemented.
    ENOSYS = 38,

    /// Directory not empty.
    ENOTEMPTY = 39,

    /// Value too large for defined data type.
    EOVERFLOW = 75,
}

impl Errno {
    /// Encodes this error kind as a message `status` field (negated, two's
    /// complement).
    #[must_use]
    pub fn status(self) -> u64 {
        (-(self as i64)) as u64
    }

    /// Decodes a message `status` field back into an error kind, if the
    /// status carries one.
    #[must_use]
    pub fn from_status(status: u64) -> Option<Self> {
        let raw = status as i64;
        if raw >= 0 {
            return None;
        }

        match -raw {
            1 => Some(Self::EPERM),
            2 => Some(Self::ENOENT),
            5 => Some(Self::EIO),
            11 => Some(Self::EWOULDBLOCK),
            12 => Some(Self::ENOMEM),
            13 => Some(Self::EACCES),
            17 => Some(Self::EEXIST),
            18 => Some(Self::EXDEV),
            19 => Some(Self::ENODEV),
            20 => Some(Self::ENOTDIR),
            21 => Some(Self::EISDIR),
            22 => Some(Self::EINVAL),
            25 => Some(Self::ENOTTY),
            28 => Some(Self::ENOSPC),
            38 => Some(Self::ENOSYS),
            39 => Some(Self::ENOTEMPTY),
            75 => Some(Self::EOVERFLOW),
            _ => Some(Self::EIO),
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for err in [Errno::ENOENT, Errno::EXDEV, Errno::EOVERFLOW] {
            assert_eq!(Errno::from_status(err.status()), Some(err));
        }
        assert_eq!(Errno::from_status(0), None);
        assert_eq!(Errno::from_status(4096), None);
    }
}
