// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for AMS client operations.

use std::fmt;
use std::io;

/// Result type for AMS operations
pub type Result<T> = std::result::Result<T, AmsError>;

/// Errors that can occur while talking to an ADS device
#[derive(Debug)]
pub enum AmsError {
    /// Socket read/write failed, or the connection was torn down while a
    /// request was in flight
    Transport(io::Error),

    /// The local port already has an outstanding request
    BusyPort { port: u16 },

    /// The caller-supplied timeout expired before a reply arrived
    TimedOut,

    /// Incoming frame did not match the wire format (header too short,
    /// truncated notification stream, unknown opcode)
    MalformedFrame { reason: &'static str },

    /// A notification frame exceeded the free space of its dispatcher ring
    /// and was dropped
    BufferOverflow { needed: usize, free: usize },

    /// A reply carried an invoke id that does not match the reservation on
    /// its target port
    InvokeIdMismatch { expected: u32, received: u32 },

    /// A frame buffer had insufficient capacity for a prepend or append
    BufferTooSmall { needed: usize, capacity: usize },

    /// The router has no free local AMS port left to lease
    PortExhausted,

    /// A request named a local port outside the leased range
    /// `[PORT_BASE, PORT_END]`
    InvalidPort { port: u16 },

    /// The device answered with a nonzero ADS result code
    Device(u32),
}

impl AmsError {
    /// True for conditions the reader thread swallows (drain + log) rather
    /// than propagating; anything transport-level terminates the reader.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            AmsError::MalformedFrame { .. }
                | AmsError::BufferOverflow { .. }
                | AmsError::InvokeIdMismatch { .. }
        )
    }
}

impl fmt::Display for AmsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport failure: {}", e),
            Self::BusyPort { port } => {
                write!(f, "local port {} already has a request in flight", port)
            }
            Self::TimedOut => write!(f, "request timed out"),
            Self::MalformedFrame { reason } => write!(f, "malformed frame: {}", reason),
            Self::BufferOverflow { needed, free } => write!(
                f,
                "notification dropped: {} bytes needed, {} free in ring",
                needed, free
            ),
            Self::InvokeIdMismatch { expected, received } => write!(
                f,
                "invoke id mismatch: waiting for {:#x}, received {:#x}",
                expected, received
            ),
            Self::BufferTooSmall { needed, capacity } => write!(
                f,
                "frame buffer too small: {} bytes needed, capacity {}",
                needed, capacity
            ),
            Self::PortExhausted => write!(f, "no free local AMS port"),
            Self::InvalidPort { port } => {
                write!(f, "local port {} is outside the leased range", port)
            }
            Self::Device(code) => write!(f, "device returned ADS error {:#x}", code),
        }
    }
}

impl std::error::Error for AmsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for AmsError {
    fn from(e: io::Error) -> Self {
        Self::Transport(e)
    }
}
