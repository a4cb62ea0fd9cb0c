/*!
CAN frame value type.

A [`CanFrame`] is what the telegram codec produces on decode and what the
signal codec consumes. It is an immutable `Copy` value: identifier, addressing
mode and up to eight payload bytes.
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::protocol::{MAX_EXTENDED_ID, MAX_PAYLOAD_BYTES, MAX_STANDARD_ID};

/// Errors raised when constructing a frame from invalid components
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CanFrameError {
    #[error("Identifier 0x{id:X} out of range (extended addressing: {extended})")]
    IdOutOfRange { id: u32, extended: bool },

    #[error("Payload of {0} bytes exceeds the 8 byte CAN limit")]
    PayloadTooLong(usize),
}

/// A classic CAN frame (0-8 payload bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawCanFrame", into = "RawCanFrame")]
pub struct CanFrame {
    arbitration_id: u32,
    is_extended: bool,
    len: u8,
    data: [u8; MAX_PAYLOAD_BYTES],
}

impl CanFrame {
    /// Build a frame, validating the identifier range and payload length
    pub fn new(arbitration_id: u32, is_extended: bool, payload: &[u8]) -> Result<Self, CanFrameError> {
        let limit = if is_extended { MAX_EXTENDED_ID } else { MAX_STANDARD_ID };
        if arbitration_id > limit {
            return Err(CanFrameError::IdOutOfRange {
                id: arbitration_id,
                extended: is_extended,
            });
        }
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(CanFrameError::PayloadTooLong(payload.len()));
        }

        let mut data = [0u8; MAX_PAYLOAD_BYTES];
        data[..payload.len()].copy_from_slice(payload);

        Ok(Self {
            arbitration_id,
            is_extended,
            len: payload.len() as u8,
            data,
        })
    }

    /// Standard (11-bit) frame
    pub fn standard(arbitration_id: u32, payload: &[u8]) -> Result<Self, CanFrameError> {
        Self::new(arbitration_id, false, payload)
    }

    /// Extended (29-bit) frame
    pub fn extended(arbitration_id: u32, payload: &[u8]) -> Result<Self, CanFrameError> {
        Self::new(arbitration_id, true, payload)
    }

    pub fn arbitration_id(&self) -> u32 {
        self.arbitration_id
    }

    pub fn is_extended(&self) -> bool {
        self.is_extended
    }

    /// Payload bytes actually carried by the frame
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanFrame")
            .field("id", &format_args!("0x{:X}", self.arbitration_id))
            .field("extended", &self.is_extended)
            .field("payload", &format_args!("{}", hex::encode_upper(self.payload())))
            .finish()
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_extended {
            write!(f, "{:08X}", self.arbitration_id)?;
        } else {
            write!(f, "{:03X}", self.arbitration_id)?;
        }
        write!(f, " [{}] {}", self.len, hex::encode_upper(self.payload()))
    }
}

/// Serde shape of a frame: payload as a hex string
#[derive(Serialize, Deserialize)]
struct RawCanFrame {
    arbitration_id: u32,
    #[serde(default)]
    is_extended: bool,
    payload: String,
}

impl TryFrom<RawCanFrame> for CanFrame {
    type Error = String;

    fn try_from(raw: RawCanFrame) -> Result<Self, Self::Error> {
        let payload = hex::decode(&raw.payload).map_err(|e| e.to_string())?;
        CanFrame::new(raw.arbitration_id, raw.is_extended, &payload).map_err(|e| e.to_string())
    }
}

impl From<CanFrame> for RawCanFrame {
    fn from(frame: CanFrame) -> Self {
        Self {
            arbitration_id: frame.arbitration_id,
            is_extended: frame.is_extended,
            payload: hex::encode_upper(frame.payload()),
        }
    }
}
