/*!
# Shared Types and Codecs

This crate contains the protocol translation pipeline shared between the
device bridge runtime and its tooling: everything between a raw serial line
and a business-level device state.

## Pipeline

Uplink: [`telegram`] → [`signal`] → [`semantic`] → [`state`]

Downlink: [`state`] → [`semantic`] → [`signal`] → [`telegram`]

## Core Types

- [`CanFrame`] - Immutable CAN frame value
- [`MessageCatalog`] - Validated message/signal layout for one device type
- [`MappingRules`] - Signal ↔ business field and command rules
- [`DeviceProfile`] - Catalog, rules and anomaly limits for a device type
- [`DeviceStateStore`] - Owner of per-device state and the connection state machine
- [`Pipeline`] - Uplink routing and downlink composition over the above

## Modules

- [`can`] - CAN frame type
- [`telegram`] - ASCII-hex wire framing and stream resynchronisation
- [`catalog`] - Message catalog and signal definitions
- [`signal`] - Bit-level signal decoding/encoding
- [`semantic`] - Semantic field mapping and command resolution
- [`profiles`] - Built-in and file-loaded device profiles
- [`state`] - Device state store
- [`pipeline`] - Component composition
- [`error`] - Common error types
*/

pub mod can;
pub mod catalog;
pub mod error;
pub mod pipeline;
pub mod profiles;
pub mod semantic;
pub mod signal;
pub mod state;
pub mod telegram;

// Re-export commonly used types
pub use can::{CanFrame, CanFrameError};
pub use catalog::{ByteOrder, CatalogError, MessageCatalog, MessageDefinition, SignalDefinition};
pub use error::{Result, SharedError};
pub use pipeline::{Pipeline, PipelineStats, UnknownFramePolicy};
pub use profiles::{DeviceProfile, ProfileRegistry, ProfileSet};
pub use semantic::{CommandArgs, CommandCall, CommandError, MappingRules, SemanticUpdate};
pub use signal::{DecodeOutcome, DecodedMessage, SignalEncodeError, SignalRangeError, SignalValues};
pub use state::{
    ConnectionStatus, DeviceEvent, DeviceState, DeviceStateStore, IssuedCommand, Severity,
    StoreConfig, StoreError,
};
pub use telegram::{decode_telegram, encode_telegram, FramingError, TelegramAssembler};

/// Version information for the shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire protocol constants
pub mod protocol {
    /// Telegram header bytes
    pub const TELEGRAM_HEADER: &[u8] = b"AT";

    /// Telegram terminator bytes
    pub const TELEGRAM_TERMINATOR: &[u8] = b"\r\n";

    /// Width of the identifier field in hex digits
    pub const ID_HEX_DIGITS: usize = 8;

    /// Width of the length field in hex digits
    pub const LEN_HEX_DIGITS: usize = 2;

    /// Maximum classic CAN payload
    pub const MAX_PAYLOAD_BYTES: usize = 8;

    /// Longest well-formed telegram, header and terminator included
    pub const MAX_TELEGRAM_BYTES: usize = 2 + ID_HEX_DIGITS + LEN_HEX_DIGITS + MAX_PAYLOAD_BYTES * 2 + 2;

    /// Largest 11-bit identifier
    pub const MAX_STANDARD_ID: u32 = 0x7FF;

    /// Largest 29-bit identifier
    pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

    /// Identifier field bit marking extended addressing
    pub const EXTENDED_ID_FLAG: u32 = 0x8000_0000;

    /// Identifier field bits that must be zero
    pub const RESERVED_ID_BITS: u32 = 0x6000_0000;
}
