//! General purpose macros for text output.
//!
//! Every server logs through the same set of macros, with an optional
//! 'context' as the first argument which is inserted at the beginning of the
//! message. The sink is process-global and defaults to standard error; the
//! kernel-bound wire format for log lines lives in [`crate::ipc::wire`].

use std::io::Write;

use bytemuck::Zeroable;
use spin::Mutex;

use crate::ipc::message::{MessageHeader, Opcode};
use crate::ipc::wire::LogCommand;
use crate::ipc::{encode, put_str};

/// Verbose diagnostics.
pub const KPRINT_LEVEL_DEBUG: i32 = 0;

/// Abnormal but recoverable conditions.
pub const KPRINT_LEVEL_WARNING: i32 = 1;

/// Failed requests and aborted initializations.
pub const KPRINT_LEVEL_ERROR: i32 = 2;

/// Unrecoverable conditions.
pub const KPRINT_LEVEL_PANIC: i32 = 3;

static LOG_SINK: Mutex<Option<Box<dyn Write + Send>>> = Mutex::new(None);

/// Redirects log output to the given writer (standard error if never called).
pub fn set_sink(sink: Box<dyn Write + Send>) {
    *LOG_SINK.lock() = Some(sink);
}

/// Builds the kernel-bound frame for one log line; the message text trails
/// the fixed structure, null terminated.
#[must_use]
pub fn log_frame(level: i32, server: &str, message: &str) -> Vec<u8> {
    let mut cmd = LogCommand::zeroed();
    cmd.header = MessageHeader::request(Opcode::Log, 0);
    cmd.header.length = (core::mem::size_of::<LogCommand>() + message.len() + 1) as u16;
    cmd.level = level;
    put_str(&mut cmd.server, server);

    let mut frame = encode(&cmd, message.as_bytes());
    frame.push(0);
    frame
}

#[doc(hidden)]
pub fn __log(level: i32, ctx: &str, args: core::fmt::Arguments) {
    let tag = match level {
        KPRINT_LEVEL_DEBUG => "info",
        KPRINT_LEVEL_WARNING => "warn",
        KPRINT_LEVEL_ERROR => "error",
        _ => "panic",
    };

    let mut sink = LOG_SINK.lock();
    match sink.as_mut() {
        Some(w) => {
            let _ = writeln!(w, "[{tag}] {ctx} : {args}");
        }
        None => {
            let _ = writeln!(std::io::stderr(), "[{tag}] {ctx} : {args}");
        }
    }
}

/// Prints a standard information message to the log sink.
///
/// The first argument is the context of the message, usually the name of the
/// server emitting it.
///
/// # Examples
///
/// ```
/// use luxd::info;
///
/// info!("lxfs", "mounted volume on {}", "/dev/sd0");
/// ```
#[macro_export]
macro_rules! info {
    ($ctx: literal, $($arg: tt)*) => {
        $crate::log::__log($crate::log::KPRINT_LEVEL_DEBUG, $ctx, format_args!($($arg)*))
    };
}

/// Prints a warning message to the log sink.
#[macro_export]
macro_rules! warn {
    ($ctx: literal, $($arg: tt)*) => {
        $crate::log::__log($crate::log::KPRINT_LEVEL_WARNING, $ctx, format_args!($($arg)*))
    };
}

/// Prints an error message to the log sink.
///
/// # Examples
///
/// ```
/// use luxd::error;
///
/// error!("vfs", "could not resolve path '{}'", "/mnt/nowhere");
/// ```
#[macro_export]
macro_rules! error {
    ($ctx: literal, $($arg: tt)*) => {
        $crate::log::__log($crate::log::KPRINT_LEVEL_ERROR, $ctx, format_args!($($arg)*))
    };
}
