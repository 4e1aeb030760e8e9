//! otau-mcu - emulated MCU for OTAU testing
//!
//! Emulates the application processor side of a UART-modem OTAU link:
//! a modem-lifecycle state machine, a DFU transfer state machine with
//! paged reception and CRC-32/SHA-256 integrity checking, crash-resume
//! via a small NVM document, and deterministic fault injection for
//! exercising a peer's negative paths.
//!
//! # Modules
//!
//! - [`config`] - TOML/CLI configuration
//! - [`memory`] - paged firmware reception and integrity hashes
//! - [`nvm`] - persisted key/value state for crash-resume
//! - [`fault`] - injection-point fault registry
//! - [`dfu`] - transfer FSM and its manager
//! - [`modem`] - modem lifecycle FSM
//! - [`dispatcher`] - frame routing between the two FSMs
//! - [`link`] - serial transport, framing, and the outbound sink
//! - [`events`] - outward domain-event traits
//! - [`console`] - coloured console + progress-bar event sink
//! - [`testing`] - recording doubles for tests

pub mod config;
pub mod console;
pub mod dfu;
pub mod dispatcher;
pub mod events;
pub mod fault;
pub mod link;
pub mod memory;
pub mod modem;
pub mod nvm;
pub mod testing;

pub use config::McuConfig;
pub use dfu::{DfuFsm, DfuManager, DfuState};
pub use dispatcher::Dispatcher;
pub use events::{DfuEventSink, ModemEventSink};
pub use fault::{FaultRegistry, FaultSpec, FaultTrigger, InjectionPoint};
pub use link::{FrameSink, SerialLink};
pub use memory::{PageMemory, MIN_SUPPORTED_PAGE_SIZE};
pub use modem::{ModemFsm, ModemState};
pub use nvm::NvmStore;
