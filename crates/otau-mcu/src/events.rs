//! Outward domain events.
//!
//! The core raises events through these sinks and never looks at the
//! result; they are best-effort notifications to whatever UI or test
//! harness is listening, and nothing they do feeds back into the
//! protocol. All methods default to no-ops so a sink only implements
//! what it cares about.

use otau_wire::{ErrorCode, Opcode};

use crate::dfu::DfuState;
use crate::modem::ModemState;

/// Events raised by the DFU transfer engine.
pub trait DfuEventSink: Send + Sync {
    /// A DFU frame arrived that is never legal, or not legal in the
    /// current state.
    fn dfu_unexpected_message(&self, _opcode: Opcode) {}

    fn dfu_state_changed(&self, _state: DfuState) {}

    /// A transfer is live: either a fresh init was accepted (`progress`
    /// 0) or a persisted transfer was resumed (`progress` = bytes
    /// already on disk).
    fn dfu_initialized(
        &self,
        _firmware_size: u32,
        _firmware_sha256: &[u8],
        _app_data: &[u8],
        _progress: u32,
    ) {
    }

    fn dfu_page_stored(&self, _firmware_offset: u32) {}

    fn dfu_update_complete(&self) {}

    fn dfu_failed(&self) {}
}

/// Events raised by the modem lifecycle engine.
pub trait ModemEventSink: Send + Sync {
    fn modem_unexpected_message(&self, _opcode: Opcode) {}

    fn modem_state_changed(&self, _state: ModemState) {}

    fn modem_registered_models(&self, _model_ids: &[u16]) {}

    fn modem_firmware_version(&self, _version: &[u8]) {}

    fn modem_device_uuid(&self, _uuid: &[u8]) {}

    fn modem_mesh_request(&self, _mesh_opcode: u16, _command: &[u8]) {}

    fn modem_factory_reset(&self) {}

    fn modem_soft_reset(&self) {}

    fn modem_attention(&self, _on: bool) {}

    /// An `Error` frame arrived. Implementations decide how hard to
    /// react; the model-registration errors are unrecoverable
    /// ([`ErrorCode::is_fatal`]).
    fn modem_error(&self, _code: ErrorCode) {}
}
