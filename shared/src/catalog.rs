/*!
Message catalog: which signals live at which bits of which CAN message.

This is the DBC-equivalent schema for one device type. A [`MessageCatalog`]
is validated once when built (or deserialized) and never mutated afterwards;
reloading means building a new catalog and swapping it in whole.
*/

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::protocol::MAX_PAYLOAD_BYTES;

/// Errors found while validating a catalog or a profile built on it
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CatalogError {
    #[error("Message 0x{0:X} is defined more than once")]
    DuplicateMessage(u32),

    #[error("Message 0x{message:X} defines signal {signal} more than once")]
    DuplicateSignal { message: u32, signal: String },

    #[error("Message 0x{message:X} declares {byte_length} bytes, CAN allows 8")]
    MessageTooLong { message: u32, byte_length: u8 },

    #[error("Signal {signal} has invalid bit length {bits}")]
    InvalidBitLength { signal: String, bits: u8 },

    #[error("Signal {signal} does not fit inside message 0x{message:X}")]
    SignalOutOfBounds { message: u32, signal: String },

    #[error("Signals {first} and {second} overlap in message 0x{message:X}")]
    OverlappingSignals { message: u32, first: String, second: String },

    #[error("Signal {signal} has a zero or non-finite scale/offset")]
    InvalidScale { signal: String },

    #[error("Signal {signal} has minimum above maximum")]
    InvalidRange { signal: String },

    #[error("Profile {profile} references unknown signal {signal}")]
    UnknownSignal { profile: String, signal: String },

    #[error("Profile {profile} references unknown message 0x{message:X}")]
    UnknownMessage { profile: String, message: u32 },

    #[error("Profile {profile} has an invalid rule: {reason}")]
    InvalidRule { profile: String, reason: String },

    #[error("Device type {0} is defined more than once")]
    DuplicateProfile(String),
}

/// Bit numbering convention of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Intel: `start_bit` is the least significant bit
    #[default]
    LittleEndian,
    /// Motorola: `start_bit` is the most significant bit, sawtooth numbering
    BigEndian,
}

fn default_scale() -> f64 {
    1.0
}

/// One named, scaled quantity inside a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDefinition {
    pub name: String,
    pub start_bit: u16,
    pub bit_length: u8,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub signed: bool,
    #[serde(default)]
    pub unit: String,
    /// Lowest physical value accepted on encode
    #[serde(default)]
    pub minimum: Option<f64>,
    /// Highest physical value accepted on encode
    #[serde(default)]
    pub maximum: Option<f64>,
}

impl SignalDefinition {
    /// Unsigned little-endian signal with unit scale
    pub fn new(name: impl Into<String>, start_bit: u16, bit_length: u8) -> Self {
        Self {
            name: name.into(),
            start_bit,
            bit_length,
            byte_order: ByteOrder::LittleEndian,
            scale: 1.0,
            offset: 0.0,
            signed: false,
            unit: String::new(),
            minimum: None,
            maximum: None,
        }
    }

    pub fn big_endian(mut self) -> Self {
        self.byte_order = ByteOrder::BigEndian;
        self
    }

    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    pub fn scaled(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn range(mut self, minimum: f64, maximum: f64) -> Self {
        self.minimum = Some(minimum);
        self.maximum = Some(maximum);
        self
    }

    /// Payload bit indices (`byte * 8 + bit`) from least to most significant
    pub fn bit_positions(&self) -> Vec<usize> {
        let len = self.bit_length as usize;
        let start = self.start_bit as usize;

        match self.byte_order {
            ByteOrder::LittleEndian => (start..start + len).collect(),
            ByteOrder::BigEndian => {
                let mut positions = Vec::with_capacity(len);
                let mut pos = start;
                for i in 0..len {
                    positions.push(pos);
                    if i + 1 == len {
                        break;
                    }
                    // Walk towards bit 0 of the byte, then jump to bit 7 of the next one
                    if pos % 8 == 0 {
                        pos += 15;
                    } else {
                        pos -= 1;
                    }
                }
                positions.reverse();
                positions
            }
        }
    }

    /// Between 1 and 64 bits, the widest raw value a payload can carry
    pub fn has_valid_length(&self) -> bool {
        (1..=64).contains(&self.bit_length)
    }

    /// Inclusive range of raw integer values the signal can hold.
    /// Lengths outside 1..=64 are clamped into that range.
    pub fn raw_bounds(&self) -> (i128, i128) {
        let bits = u32::from(self.bit_length.clamp(1, 64));
        if self.signed {
            let half = 1i128 << (bits - 1);
            (-half, half - 1)
        } else {
            (0, (1i128 << bits) - 1)
        }
    }

    fn validate(&self, message: u32, byte_length: u8) -> Result<u64, CatalogError> {
        if !self.has_valid_length() {
            return Err(CatalogError::InvalidBitLength {
                signal: self.name.clone(),
                bits: self.bit_length,
            });
        }
        if self.scale == 0.0 || !self.scale.is_finite() || !self.offset.is_finite() {
            return Err(CatalogError::InvalidScale { signal: self.name.clone() });
        }
        if let (Some(min), Some(max)) = (self.minimum, self.maximum) {
            if min > max {
                return Err(CatalogError::InvalidRange { signal: self.name.clone() });
            }
        }

        let limit = byte_length as usize * 8;
        let mut mask = 0u64;
        for pos in self.bit_positions() {
            if pos >= limit {
                return Err(CatalogError::SignalOutOfBounds {
                    message,
                    signal: self.name.clone(),
                });
            }
            mask |= 1u64 << pos;
        }
        Ok(mask)
    }
}

/// Layout of one CAN message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDefinition {
    pub arbitration_id: u32,
    pub name: String,
    pub byte_length: u8,
    #[serde(default)]
    pub is_extended: bool,
    #[serde(default)]
    pub signals: Vec<SignalDefinition>,
}

impl MessageDefinition {
    pub fn new(arbitration_id: u32, name: impl Into<String>, byte_length: u8) -> Self {
        Self {
            arbitration_id,
            name: name.into(),
            byte_length,
            is_extended: false,
            signals: Vec::new(),
        }
    }

    pub fn with_signal(mut self, signal: SignalDefinition) -> Self {
        self.signals.push(signal);
        self
    }

    /// Look up a signal by name
    pub fn signal(&self, name: &str) -> Option<&SignalDefinition> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// Check lengths, bit ranges, names and overlaps
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.byte_length as usize > MAX_PAYLOAD_BYTES {
            return Err(CatalogError::MessageTooLong {
                message: self.arbitration_id,
                byte_length: self.byte_length,
            });
        }

        let mut names = HashSet::new();
        let mut masks: Vec<(u64, &str)> = Vec::with_capacity(self.signals.len());

        for signal in &self.signals {
            if !names.insert(signal.name.as_str()) {
                return Err(CatalogError::DuplicateSignal {
                    message: self.arbitration_id,
                    signal: signal.name.clone(),
                });
            }

            let mask = signal.validate(self.arbitration_id, self.byte_length)?;
            if let Some((_, other)) = masks.iter().find(|(m, _)| m & mask != 0) {
                return Err(CatalogError::OverlappingSignals {
                    message: self.arbitration_id,
                    first: other.to_string(),
                    second: signal.name.clone(),
                });
            }
            masks.push((mask, &signal.name));
        }

        Ok(())
    }
}

/// Validated, immutable set of message definitions keyed by arbitration id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<MessageDefinition>", into = "Vec<MessageDefinition>")]
pub struct MessageCatalog {
    messages: HashMap<u32, MessageDefinition>,
}

impl MessageCatalog {
    /// Validate every message and build the catalog
    pub fn new(messages: Vec<MessageDefinition>) -> Result<Self, CatalogError> {
        let mut map = HashMap::with_capacity(messages.len());
        for message in messages {
            message.validate()?;
            let id = message.arbitration_id;
            if map.insert(id, message).is_some() {
                return Err(CatalogError::DuplicateMessage(id));
            }
        }
        Ok(Self { messages: map })
    }

    /// Look up a message by arbitration id
    pub fn message(&self, arbitration_id: u32) -> Option<&MessageDefinition> {
        self.messages.get(&arbitration_id)
    }

    /// Arbitration ids in ascending order
    pub fn message_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.messages.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Find the message carrying a signal
    pub fn message_for_signal(&self, signal: &str) -> Option<&MessageDefinition> {
        self.messages.values().find(|m| m.signal(signal).is_some())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl TryFrom<Vec<MessageDefinition>> for MessageCatalog {
    type Error = CatalogError;

    fn try_from(messages: Vec<MessageDefinition>) -> Result<Self, Self::Error> {
        Self::new(messages)
    }
}

impl From<MessageCatalog> for Vec<MessageDefinition> {
    fn from(catalog: MessageCatalog) -> Self {
        let mut messages: Vec<MessageDefinition> = catalog.messages.into_values().collect();
        messages.sort_by_key(|m| m.arbitration_id);
        messages
    }
}
