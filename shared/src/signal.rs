/*!
Signal decoding and encoding against a [`MessageCatalog`].

Decoding extracts each signal's bits from a frame payload and applies
`physical = raw * scale + offset`. Encoding inverts that with
`raw = round((physical - offset) / scale)` and packs the raw values into a
zero-initialised payload of the message's declared length. Signals the
caller does not supply stay zero.
*/

use num_traits::ToPrimitive;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

use crate::can::{CanFrame, CanFrameError};
use crate::catalog::{MessageCatalog, MessageDefinition, SignalDefinition};

/// Signal name → physical value
pub type SignalValues = BTreeMap<String, f64>;

/// A frame's payload does not cover the layout the catalog declares
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalRangeError {
    #[error("Message 0x{id:X} carries {actual} bytes, catalog declares {declared}")]
    PayloadTooShort { id: u32, declared: usize, actual: usize },

    #[error("Signal {signal} reads bit {bit} past a {payload_len} byte payload")]
    BitRange { signal: String, bit: usize, payload_len: usize },

    #[error("Signal {signal} has invalid bit length {bits} (1..=64)")]
    InvalidLength { signal: String, bits: u8 },
}

/// Physical values cannot be packed into the requested message
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalEncodeError {
    #[error("Message 0x{0:X} is not in the catalog")]
    UnknownMessage(u32),

    #[error("Signal {signal} is not part of message 0x{id:X}")]
    UnknownSignal { id: u32, signal: String },

    #[error("Value for signal {signal} is not a finite number")]
    NotFinite { signal: String },

    #[error("Value {value} for signal {signal} is out of range: {reason}")]
    OutOfRange { signal: String, value: f64, reason: String },

    #[error("Signal {signal} does not fit the message payload")]
    Layout { signal: String },

    #[error("Signal {signal} has invalid bit length {bits} (1..=64)")]
    InvalidLength { signal: String, bits: u8 },

    #[error("Encoded frame is invalid: {0}")]
    Frame(#[from] CanFrameError),
}

/// Signals decoded from one frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedMessage {
    pub arbitration_id: u32,
    pub message: String,
    pub signals: SignalValues,
}

/// Result of looking a frame up in the catalog
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    Decoded(DecodedMessage),
    /// The catalog has no message with this arbitration id
    Unknown(CanFrame),
}

/// Decode a frame; unknown ids are reported, not treated as errors
pub fn decode_frame(catalog: &MessageCatalog, frame: &CanFrame) -> Result<DecodeOutcome, SignalRangeError> {
    match catalog.message(frame.arbitration_id()) {
        Some(message) => decode_message(message, frame.payload()).map(DecodeOutcome::Decoded),
        None => Ok(DecodeOutcome::Unknown(*frame)),
    }
}

/// Decode every signal of a message from a payload
pub fn decode_message(message: &MessageDefinition, payload: &[u8]) -> Result<DecodedMessage, SignalRangeError> {
    let declared = message.byte_length as usize;
    if payload.len() < declared {
        return Err(SignalRangeError::PayloadTooShort {
            id: message.arbitration_id,
            declared,
            actual: payload.len(),
        });
    }

    let mut signals = SignalValues::new();
    for signal in &message.signals {
        signals.insert(signal.name.clone(), decode_signal(signal, payload)?);
    }

    Ok(DecodedMessage {
        arbitration_id: message.arbitration_id,
        message: message.name.clone(),
        signals,
    })
}

/// Decode one signal to its physical value
pub fn decode_signal(signal: &SignalDefinition, payload: &[u8]) -> Result<f64, SignalRangeError> {
    if !signal.has_valid_length() {
        return Err(SignalRangeError::InvalidLength {
            signal: signal.name.clone(),
            bits: signal.bit_length,
        });
    }
    let bits = extract_bits(signal, payload)?;
    let raw = if signal.signed {
        sign_extend(bits, signal.bit_length) as f64
    } else {
        bits as f64
    };
    Ok(raw * signal.scale + signal.offset)
}

/// Encode a partial or complete set of physical values into a frame
pub fn encode_frame(
    catalog: &MessageCatalog,
    arbitration_id: u32,
    values: &SignalValues,
) -> Result<CanFrame, SignalEncodeError> {
    let message = catalog
        .message(arbitration_id)
        .ok_or(SignalEncodeError::UnknownMessage(arbitration_id))?;
    encode_message(message, values)
}

/// Encode values into a zero-initialised payload of the message's length
pub fn encode_message(message: &MessageDefinition, values: &SignalValues) -> Result<CanFrame, SignalEncodeError> {
    let mut payload = vec![0u8; message.byte_length as usize];

    for (name, &value) in values {
        let signal = message.signal(name).ok_or_else(|| SignalEncodeError::UnknownSignal {
            id: message.arbitration_id,
            signal: name.clone(),
        })?;
        encode_signal(signal, value, &mut payload)?;
    }

    debug!(
        "Encoded {} signal(s) into 0x{:X}: {}",
        values.len(),
        message.arbitration_id,
        hex::encode_upper(&payload)
    );

    Ok(CanFrame::new(message.arbitration_id, message.is_extended, &payload)?)
}

/// Pack one physical value into `payload`
pub fn encode_signal(signal: &SignalDefinition, physical: f64, payload: &mut [u8]) -> Result<(), SignalEncodeError> {
    if !signal.has_valid_length() {
        return Err(SignalEncodeError::InvalidLength {
            signal: signal.name.clone(),
            bits: signal.bit_length,
        });
    }
    if !physical.is_finite() {
        return Err(SignalEncodeError::NotFinite {
            signal: signal.name.clone(),
        });
    }

    let out_of_range = |reason: String| SignalEncodeError::OutOfRange {
        signal: signal.name.clone(),
        value: physical,
        reason,
    };

    if let Some(min) = signal.minimum {
        if physical < min {
            return Err(out_of_range(format!("below minimum {}", min)));
        }
    }
    if let Some(max) = signal.maximum {
        if physical > max {
            return Err(out_of_range(format!("above maximum {}", max)));
        }
    }

    let (lo, hi) = signal.raw_bounds();
    let raw = ((physical - signal.offset) / signal.scale)
        .round()
        .to_i128()
        .filter(|raw| (lo..=hi).contains(raw))
        .ok_or_else(|| {
            out_of_range(format!(
                "raw value must fit {} {}-bit",
                if signal.signed { "signed" } else { "unsigned" },
                signal.bit_length
            ))
        })?;

    // Two's complement for negative raw values, truncated to the signal width
    let bits = (raw as u128 as u64) & width_mask(signal.bit_length);
    insert_bits(signal, payload, bits)
}

fn width_mask(bit_length: u8) -> u64 {
    if bit_length >= 64 {
        u64::MAX
    } else {
        (1u64 << bit_length) - 1
    }
}

fn sign_extend(bits: u64, bit_length: u8) -> i64 {
    let shift = 64 - bit_length as u32;
    ((bits << shift) as i64) >> shift
}

fn extract_bits(signal: &SignalDefinition, payload: &[u8]) -> Result<u64, SignalRangeError> {
    let mut value = 0u64;
    for (i, pos) in signal.bit_positions().into_iter().enumerate() {
        let byte = payload.get(pos / 8).ok_or_else(|| SignalRangeError::BitRange {
            signal: signal.name.clone(),
            bit: pos,
            payload_len: payload.len(),
        })?;
        let bit = (byte >> (pos % 8)) & 1;
        value |= (bit as u64) << i;
    }
    Ok(value)
}

fn insert_bits(signal: &SignalDefinition, payload: &mut [u8], bits: u64) -> Result<(), SignalEncodeError> {
    for (i, pos) in signal.bit_positions().into_iter().enumerate() {
        let byte = payload.get_mut(pos / 8).ok_or_else(|| SignalEncodeError::Layout {
            signal: signal.name.clone(),
        })?;
        let mask = 1u8 << (pos % 8);
        if (bits >> i) & 1 == 1 {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
    Ok(())
}
