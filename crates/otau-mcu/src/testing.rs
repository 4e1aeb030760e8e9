//! Recording doubles for tests.
//!
//! A [`RecordingSink`] captures outbound frames and [`RecordingEvents`]
//! captures domain events, each behind a mutex so the sinks satisfy the
//! `Send + Sync` bounds of the real interfaces.

use otau_wire::{ErrorCode, Message, Opcode};
use parking_lot::Mutex;

use crate::dfu::DfuState;
use crate::events::{DfuEventSink, ModemEventSink};
use crate::link::FrameSink;
use crate::modem::ModemState;

/// Captures every frame the core tries to send.
#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<Message>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain and return everything sent since the last call.
    pub fn take(&self) -> Vec<Message> {
        std::mem::take(&mut self.frames.lock())
    }
}

impl FrameSink for RecordingSink {
    fn send(&self, msg: &Message) {
        self.frames.lock().push(msg.clone());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DfuEvent {
    Unexpected(Opcode),
    StateChanged(DfuState),
    Initialized {
        firmware_size: u32,
        firmware_sha256: Vec<u8>,
        app_data: Vec<u8>,
        progress: u32,
    },
    PageStored(u32),
    UpdateComplete,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModemEvent {
    Unexpected(Opcode),
    StateChanged(ModemState),
    RegisteredModels(Vec<u16>),
    FirmwareVersion(Vec<u8>),
    DeviceUuid(Vec<u8>),
    MeshRequest(u16, Vec<u8>),
    FactoryReset,
    SoftReset,
    Attention(bool),
    Error(ErrorCode),
}

/// Captures domain events from both engines.
#[derive(Default)]
pub struct RecordingEvents {
    dfu: Mutex<Vec<DfuEvent>>,
    modem: Mutex<Vec<ModemEvent>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_dfu(&self) -> Vec<DfuEvent> {
        std::mem::take(&mut self.dfu.lock())
    }

    pub fn take_modem(&self) -> Vec<ModemEvent> {
        std::mem::take(&mut self.modem.lock())
    }
}

impl DfuEventSink for RecordingEvents {
    fn dfu_unexpected_message(&self, opcode: Opcode) {
        self.dfu.lock().push(DfuEvent::Unexpected(opcode));
    }

    fn dfu_state_changed(&self, state: DfuState) {
        self.dfu.lock().push(DfuEvent::StateChanged(state));
    }

    fn dfu_initialized(
        &self,
        firmware_size: u32,
        firmware_sha256: &[u8],
        app_data: &[u8],
        progress: u32,
    ) {
        self.dfu.lock().push(DfuEvent::Initialized {
            firmware_size,
            firmware_sha256: firmware_sha256.to_vec(),
            app_data: app_data.to_vec(),
            progress,
        });
    }

    fn dfu_page_stored(&self, firmware_offset: u32) {
        self.dfu.lock().push(DfuEvent::PageStored(firmware_offset));
    }

    fn dfu_update_complete(&self) {
        self.dfu.lock().push(DfuEvent::UpdateComplete);
    }

    fn dfu_failed(&self) {
        self.dfu.lock().push(DfuEvent::Failed);
    }
}

impl ModemEventSink for RecordingEvents {
    fn modem_unexpected_message(&self, opcode: Opcode) {
        self.modem.lock().push(ModemEvent::Unexpected(opcode));
    }

    fn modem_state_changed(&self, state: ModemState) {
        self.modem.lock().push(ModemEvent::StateChanged(state));
    }

    fn modem_registered_models(&self, model_ids: &[u16]) {
        self.modem
            .lock()
            .push(ModemEvent::RegisteredModels(model_ids.to_vec()));
    }

    fn modem_firmware_version(&self, version: &[u8]) {
        self.modem
            .lock()
            .push(ModemEvent::FirmwareVersion(version.to_vec()));
    }

    fn modem_device_uuid(&self, uuid: &[u8]) {
        self.modem.lock().push(ModemEvent::DeviceUuid(uuid.to_vec()));
    }

    fn modem_mesh_request(&self, mesh_opcode: u16, command: &[u8]) {
        self.modem
            .lock()
            .push(ModemEvent::MeshRequest(mesh_opcode, command.to_vec()));
    }

    fn modem_factory_reset(&self) {
        self.modem.lock().push(ModemEvent::FactoryReset);
    }

    fn modem_soft_reset(&self) {
        self.modem.lock().push(ModemEvent::SoftReset);
    }

    fn modem_attention(&self, on: bool) {
        self.modem.lock().push(ModemEvent::Attention(on));
    }

    fn modem_error(&self, code: ErrorCode) {
        self.modem.lock().push(ModemEvent::Error(code));
    }
}
