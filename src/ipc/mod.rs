//! Kernel-server communication.
//!
//! Every server exchanges datagrams carrying a fixed envelope
//! ([`message::MessageHeader`]) followed by a command-specific structure and,
//! for some commands, a variable trailing payload. The datagram socket itself
//! belongs to the runtime; servers only see the [`Transport`] trait, and the
//! test suite wires servers together with in-memory [`channel_pair`]s.

pub mod message;
pub mod wire;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytemuck::Pod;

use crate::errors::{CanFail, Errno};
use crate::ipc::message::MessageHeader;

/// Well-known address of the kernel socket.
pub const SERVER_KERNEL_PATH: &str = "lux:///kernel";

/// Well-known address of the lumen supervisor socket.
pub const SERVER_LUMEN_PATH: &str = "lux:///lumen";

/// Largest frame a server accepts in one receive.
pub const SERVER_MAX_SIZE: usize = 0x8000;

/// One end of a datagram link between two servers.
///
/// Frames are whole messages; there is no partial delivery. A non-blocking
/// receive on an empty link returns `None`.
pub trait Transport {
    fn send(&mut self, frame: &[u8]) -> CanFail<Errno>;
    fn recv(&mut self) -> Option<Vec<u8>>;
}

struct ChannelShared {
    a_to_b: RefCell<VecDeque<Vec<u8>>>,
    b_to_a: RefCell<VecDeque<Vec<u8>>>,
}

/// One endpoint of an in-memory datagram link.
pub struct ChannelEnd {
    shared: Rc<ChannelShared>,
    is_a: bool,
}

/// Creates a connected pair of in-memory links.
///
/// Servers are single-threaded cooperative loops, so the queues never see
/// concurrent access.
#[must_use]
pub fn channel_pair() -> (ChannelEnd, ChannelEnd) {
    let shared = Rc::new(ChannelShared {
        a_to_b: RefCell::new(VecDeque::new()),
        b_to_a: RefCell::new(VecDeque::new()),
    });

    (
        ChannelEnd {
            shared: shared.clone(),
            is_a: true,
        },
        ChannelEnd { shared, is_a: false },
    )
}

impl Transport for ChannelEnd {
    fn send(&mut self, frame: &[u8]) -> CanFail<Errno> {
        let queue = if self.is_a {
            &self.shared.a_to_b
        } else {
            &self.shared.b_to_a
        };

        queue.borrow_mut().push_back(frame.to_vec());
        Ok(())
    }

    fn recv(&mut self) -> Option<Vec<u8>> {
        let queue = if self.is_a {
            &self.shared.b_to_a
        } else {
            &self.shared.a_to_b
        };

        let frame = queue.borrow_mut().pop_front()?;
        Some(frame)
    }
}

/// Serializes a command structure and its trailing payload into a frame.
#[must_use]
pub fn encode<T: Pod>(cmd: &T, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(core::mem::size_of::<T>() + payload.len());
    frame.extend_from_slice(bytemuck::bytes_of(cmd));
    frame.extend_from_slice(payload);
    frame
}

/// Splits a frame back into its command structure and trailing payload.
///
/// Returns `None` if the frame is shorter than the command structure.
#[must_use]
pub fn decode<T: Pod>(frame: &[u8]) -> Option<(T, &[u8])> {
    let fixed = core::mem::size_of::<T>();
    if frame.len() < fixed {
        return None;
    }

    let cmd = bytemuck::pod_read_unaligned::<T>(&frame[..fixed]);
    Some((cmd, &frame[fixed..]))
}

/// Reads just the envelope of a frame, without consuming it.
#[must_use]
pub fn peek_header(frame: &[u8]) -> Option<MessageHeader> {
    let fixed = core::mem::size_of::<MessageHeader>();
    if frame.len() < fixed {
        return None;
    }

    Some(bytemuck::pod_read_unaligned::<MessageHeader>(
        &frame[..fixed],
    ))
}

/// Copies a string into a fixed, null-terminated wire field.
pub fn put_str(dst: &mut [u8], src: &str) {
    let bytes = src.as_bytes();
    let len = bytes.len().min(dst.len().saturating_sub(1));
    dst[..len].copy_from_slice(&bytes[..len]);
    for b in &mut dst[len..] {
        *b = 0;
    }
}

/// Reads a null-terminated wire field back into a string slice.
///
/// Invalid UTF-8 yields an empty string; paths on the wire are always ASCII.
#[must_use]
pub fn get_str(src: &[u8]) -> &str {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    core::str::from_utf8(&src[..end]).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::{MessageHeader, Opcode};

    #[test]
    fn channel_delivers_in_order() {
        let (mut a, mut b) = channel_pair();
        a.send(&[1, 2, 3]).unwrap();
        a.send(&[4]).unwrap();
        assert_eq!(b.recv().unwrap(), vec![1, 2, 3]);
        assert_eq!(b.recv().unwrap(), vec![4]);
        assert!(b.recv().is_none());
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut header = MessageHeader::request(Opcode::Read, 0);
        header.status = Errno::EIO.status();

        let frame = encode(&header, b"tail");
        let (decoded, payload) = decode::<MessageHeader>(&frame).unwrap();
        assert_eq!({ decoded.command }, Opcode::Read as u16);
        assert_eq!(payload, b"tail");
    }

    #[test]
    fn str_fields_are_null_terminated() {
        let mut field = [0xFFu8; 8];
        put_str(&mut field, "/dev/sd0");
        // truncated to leave room for the terminator
        assert_eq!(get_str(&field), "/dev/sd");
    }
}
