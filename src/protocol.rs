//! Fixed-layout messages exchanged with the interpreted program.
//!
//! The guest talks to the scheduler over a narrow binary channel: one message
//! shape to open and close a session, and one delivered whenever the
//! interpreted location changes. Both are packed little-endian with no
//! padding. Malformed buffers are rejected before any session state moves.

use libafl_bolts::Error;
use num_enum::TryFromPrimitive;

use crate::engine::VmAddr;

/// Wire size of a [`SessionMessage`], in bytes.
pub const SESSION_MESSAGE_SIZE: usize = 24;

/// Wire size of a [`LocationMessage`] header (opcode + frame count), in bytes.
pub const LOCATION_HEADER_SIZE: usize = 8;

/// Upper bound on the `result_size` a guest may claim in an END message.
pub const MAX_RESULT_SIZE: usize = 4096;

/// Discriminant of a [`SessionMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
pub enum SessionCommand {
    /// Open a session on the sending instance.
    Start = 0,
    /// Close the current path of the sending instance.
    End = 1,
}

/// A session control message.
///
/// Layout: `u32 command`, `u32 max_time_secs`, `u32 is_error_path`,
/// `u64 result_ptr`, `u32 result_size`. Fields not meaningful for the command
/// are transmitted as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMessage {
    /// Open a session bounded by `max_time_secs` wall-clock seconds
    /// (zero means unbounded).
    Start {
        /// Session budget in seconds, zero for no limit.
        max_time_secs: u32,
    },
    /// Close the current path.
    End {
        /// Whether the path ended on an error.
        is_error_path: bool,
        /// Guest address of the run's result buffer.
        result_ptr: VmAddr,
        /// Size of the result buffer in bytes.
        result_size: u32,
    },
}

impl SessionMessage {
    /// Decode a session message from its wire form.
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() != SESSION_MESSAGE_SIZE {
            return Err(Error::illegal_argument(format!(
                "session message has {} bytes, expected {SESSION_MESSAGE_SIZE}",
                buf.len()
            )));
        }
        let raw = read_u32(buf, 0);
        let command = SessionCommand::try_from(raw)
            .map_err(|_| Error::illegal_argument(format!("unknown session command {raw:#x}")))?;
        Ok(match command {
            SessionCommand::Start => Self::Start {
                max_time_secs: read_u32(buf, 4),
            },
            SessionCommand::End => Self::End {
                is_error_path: read_u32(buf, 8) != 0,
                result_ptr: read_u64(buf, 12),
                result_size: read_u32(buf, 20),
            },
        })
    }

    /// Encode the message into its wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SESSION_MESSAGE_SIZE] {
        let mut buf = [0_u8; SESSION_MESSAGE_SIZE];
        match *self {
            Self::Start { max_time_secs } => {
                buf[0..4].copy_from_slice(&(SessionCommand::Start as u32).to_le_bytes());
                buf[4..8].copy_from_slice(&max_time_secs.to_le_bytes());
            }
            Self::End {
                is_error_path,
                result_ptr,
                result_size,
            } => {
                buf[0..4].copy_from_slice(&(SessionCommand::End as u32).to_le_bytes());
                buf[8..12].copy_from_slice(&u32::from(is_error_path).to_le_bytes());
                buf[12..20].copy_from_slice(&result_ptr.to_le_bytes());
                buf[20..24].copy_from_slice(&result_size.to_le_bytes());
            }
        }
        buf
    }
}

/// A location-changed message: the opcode at the new location and the
/// interpreted call stack, innermost frame last.
///
/// Layout: `u32 opcode`, `u32 frame_count`, then `frame_count` times
/// `u64 frame`. A real location always carries at least one frame; the empty
/// stack is reserved as the graph entry sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationMessage {
    /// Opcode of the instruction at the new location.
    pub opcode: u32,
    /// Interpreted call stack topped by the current instruction pointer.
    pub frames: Vec<u64>,
}

impl LocationMessage {
    /// Decode a location message from its wire form.
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < LOCATION_HEADER_SIZE {
            return Err(Error::illegal_argument(format!(
                "location message has {} bytes, expected at least {LOCATION_HEADER_SIZE}",
                buf.len()
            )));
        }
        let opcode = read_u32(buf, 0);
        let frame_count = read_u32(buf, 4) as usize;
        if frame_count == 0 {
            return Err(Error::illegal_argument(
                "location message carries no frames",
            ));
        }
        let expected = LOCATION_HEADER_SIZE + frame_count * 8;
        if buf.len() != expected {
            return Err(Error::illegal_argument(format!(
                "location message with {frame_count} frames has {} bytes, expected {expected}",
                buf.len()
            )));
        }
        let frames = (0..frame_count)
            .map(|i| read_u64(buf, LOCATION_HEADER_SIZE + i * 8))
            .collect();
        Ok(Self { opcode, frames })
    }

    /// Encode the message into its wire form.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(LOCATION_HEADER_SIZE + self.frames.len() * 8);
        buf.extend_from_slice(&self.opcode.to_le_bytes());
        buf.extend_from_slice(&(self.frames.len() as u32).to_le_bytes());
        for frame in &self.frames {
            buf.extend_from_slice(&frame.to_le_bytes());
        }
        buf
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}
