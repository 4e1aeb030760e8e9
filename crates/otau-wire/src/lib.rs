//! otau-wire - UART frame protocol
//!
//! Wire-level types shared by the MCU emulator and its tests: one-byte
//! opcodes, typed messages, status codes, and the frame codec.
//!
//! A frame is `opcode:u8` followed by an opcode-specific payload.
//! Multi-byte integers are little-endian. Framing (preamble, length,
//! frame CRC) is the transport's concern and is not handled here.
//!
//! # Modules
//!
//! - [`opcode`] - Opcode enum and the DFU family split
//! - [`status`] - DFU status codes, modem states, error codes
//! - [`message`] - Typed [`Message`] enum with `encode`/`decode`

pub mod message;
pub mod opcode;
pub mod status;

pub use message::{decode, Message, WireError};
pub use opcode::Opcode;
pub use status::{DfuStatus, ErrorCode, ModemStateId, TransferPhase};
