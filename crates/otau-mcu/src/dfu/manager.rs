//! DFU manager: orchestrates page memory, NVM, and fault injection, and
//! formats every DFU response the MCU sends.
//!
//! The manager holds no reference to the FSM; the FSM drives it and acts
//! on its boolean results, so ownership stays one-way.

use std::sync::Arc;

use otau_wire::{DfuStatus, Message, Opcode};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::dfu::DfuState;
use crate::events::DfuEventSink;
use crate::fault::{FaultKind, FaultRegistry, InjectionPoint};
use crate::link::FrameSink;
use crate::memory::PageMemory;
use crate::nvm::{
    NvmStore, KEY_CURRENT_STATE, KEY_FIRMWARE_IMAGE_SHA256, KEY_FIRMWARE_IMAGE_SIZE,
};

pub struct DfuManager {
    memory: PageMemory,
    nvm: NvmStore,
    faults: FaultRegistry,
    sender: Arc<dyn FrameSink>,
    events: Arc<dyn DfuEventSink>,
    /// When set, init requests carrying different app data are rejected.
    expected_app_data: Option<Vec<u8>>,

    firmware_image_size: u32,
    firmware_image_sha256: Vec<u8>,
}

impl DfuManager {
    /// Build the manager, recovering any persisted transfer. Returns the
    /// state the FSM must start in: the persisted state if one survives
    /// in NVM, Standby otherwise. A resumed Upload/UploadPage transfer
    /// immediately raises `dfu_initialized` with the on-disk progress so
    /// the UI picks up where it left off.
    pub fn new(
        memory: PageMemory,
        mut nvm: NvmStore,
        faults: FaultRegistry,
        sender: Arc<dyn FrameSink>,
        events: Arc<dyn DfuEventSink>,
        expected_app_data: Option<Vec<u8>>,
    ) -> (Self, DfuState) {
        let initial_state = nvm
            .get_u32(KEY_CURRENT_STATE)
            .and_then(|id| u8::try_from(id).ok())
            .and_then(DfuState::from_id);

        let stored_size = nvm.get_u32(KEY_FIRMWARE_IMAGE_SIZE);
        let stored_sha = nvm.get_str(KEY_FIRMWARE_IMAGE_SHA256);

        let mut mgr = Self {
            memory,
            nvm,
            faults,
            sender,
            events,
            expected_app_data,
            firmware_image_size: 0,
            firmware_image_sha256: Vec::new(),
        };

        match stored_size {
            Some(size) => mgr.firmware_image_size = size,
            None => mgr.update_firmware_size(0),
        }
        match stored_sha {
            Some(hex_sha) => match hex::decode(&hex_sha) {
                Ok(sha) => mgr.firmware_image_sha256 = sha,
                Err(e) => {
                    warn!(error = %e, "stored firmware sha256 is not valid hex, ignoring");
                    mgr.update_firmware_sha256(&[]);
                }
            },
            None => mgr.update_firmware_sha256(&[]),
        }

        debug!(initial_state = ?initial_state, "DFU manager initialized");

        if matches!(
            initial_state,
            Some(DfuState::Upload) | Some(DfuState::UploadPage)
        ) {
            mgr.events.dfu_initialized(
                mgr.firmware_image_size,
                &mgr.firmware_image_sha256,
                mgr.memory.app_data(),
                mgr.memory.firmware_offset(),
            );
        }

        (mgr, initial_state.unwrap_or(DfuState::Standby))
    }

    pub fn memory(&self) -> &PageMemory {
        &self.memory
    }

    pub fn firmware_image_size(&self) -> u32 {
        self.firmware_image_size
    }

    fn update_firmware_size(&mut self, size: u32) {
        self.firmware_image_size = size;
        self.nvm.update(KEY_FIRMWARE_IMAGE_SIZE, json!(size));
    }

    fn update_firmware_sha256(&mut self, sha: &[u8]) {
        self.firmware_image_sha256 = sha.to_vec();
        self.nvm
            .update(KEY_FIRMWARE_IMAGE_SHA256, json!(hex::encode(sha)));
    }

    /// Persist the FSM state and raise `dfu_state_changed`.
    pub fn update_state(&mut self, state: DfuState) {
        self.nvm.update(KEY_CURRENT_STATE, json!(state.id()));
        self.events.dfu_state_changed(state);
    }

    /// Ask the peer whether it believes a transfer is in progress
    /// (Standby entry action; the reply is a `DfuStateResponse`).
    pub fn probe_peer_transfer(&self) {
        self.sender.send(&Message::DfuStateRequest);
    }

    /// Cancel whatever transfer the peer thinks is running.
    pub fn drop_otau(&self) {
        self.sender.send(&Message::DfuCancelRequest);
    }

    pub fn report_unexpected_message(&self, opcode: Opcode) {
        self.events.dfu_unexpected_message(opcode);
    }

    pub fn report_dfu_fail(&self) {
        self.events.dfu_failed();
    }

    /// Handle an init request. Returns true when the transfer is armed
    /// and the FSM should move to Upload.
    pub fn init_otau(&mut self, firmware_size: u32, firmware_sha256: &[u8], app_data: &[u8]) -> bool {
        if let Err(e) = self.memory.clear() {
            warn!(error = %e, "failed to clear page memory for init");
            self.send_init_response(DfuStatus::InsufficientResources);
            return false;
        }
        self.update_firmware_size(0);
        self.update_firmware_sha256(&[]);

        if let Some(kind) = self.faults.consult(InjectionPoint::PreValidation) {
            self.respond_per_fault(kind, |status| Message::DfuInitResponse { status });
            self.events.dfu_failed();
            debug!("pre-validation fault fired, init rejected");
            return false;
        }

        if let Some(expected) = &self.expected_app_data {
            if app_data != expected.as_slice() {
                self.send_init_response(DfuStatus::InvalidObject);
                debug!(
                    expected_len = expected.len(),
                    got_len = app_data.len(),
                    "app data does not match expected blob, init rejected"
                );
                return false;
            }
        }

        let armed = (|| {
            self.memory.set_app_data_memory_size(app_data.len());
            self.memory.write_app_data(app_data)?;
            self.memory.set_firmware_memory_size(firmware_size)
        })();
        if let Err(e) = armed {
            self.send_init_response(DfuStatus::InsufficientResources);
            debug!(error = %e, "initializing memory failed");
            return false;
        }

        self.update_firmware_size(firmware_size);
        self.update_firmware_sha256(firmware_sha256);

        self.send_init_response(DfuStatus::Success);
        self.events.dfu_initialized(
            self.firmware_image_size,
            &self.firmware_image_sha256,
            self.memory.app_data(),
            0,
        );

        info!(
            firmware_size,
            sha256 = %hex::encode(firmware_sha256),
            "DFU process initialized"
        );
        true
    }

    /// Send a `DfuStatusResponse`. With `report_empty`, offset and CRC
    /// are forced to 0 (Standby answers this way: nothing is in flight).
    pub fn send_state_response(&mut self, status: DfuStatus, report_empty: bool) {
        let (firmware_offset, firmware_crc) = if report_empty {
            (0, 0)
        } else {
            (
                self.memory.firmware_offset() + self.memory.page_offset(),
                self.memory.calc_firmware_crc(),
            )
        };
        let supported_page_size = self.memory.supported_page_size();

        if let Some(kind) = self.faults.consult(InjectionPoint::AfterPreValidation) {
            self.respond_per_fault(kind, |status| Message::DfuStatusResponse {
                status,
                supported_page_size,
                firmware_offset,
                firmware_crc,
            });
            return;
        }

        self.sender.send(&Message::DfuStatusResponse {
            status,
            supported_page_size,
            firmware_offset,
            firmware_crc,
        });
    }

    /// Arm a page accumulator and acknowledge it. A fired fault leaves
    /// the accumulator untouched; the page the peer then streams cannot
    /// match its declared length and fails at store time.
    pub fn create_page(&mut self, requested_page_size: u16) {
        if let Some(kind) = self.faults.consult(InjectionPoint::PageCreate) {
            self.respond_per_fault(kind, |status| Message::DfuPageCreateResponse { status });
            return;
        }

        self.memory.create_page(requested_page_size);
        self.sender.send(&Message::DfuPageCreateResponse {
            status: DfuStatus::Success,
        });
    }

    /// Accept a chunk of the in-progress page. WriteDataEvent is one-way;
    /// nothing is sent back.
    pub fn process_write_data(&mut self, data: &[u8]) {
        self.memory.write_data(data);
    }

    /// Finalise the in-progress page. Returns true when the transfer
    /// continues (more pages expected); false when it terminates, for
    /// good or ill, and the FSM must drop to Standby.
    pub fn page_store(&mut self) -> bool {
        if let Some(kind) = self.faults.consult(InjectionPoint::PageStore) {
            self.respond_per_fault(kind, |status| Message::DfuPageStoreResponse { status });
            return false;
        }

        if let Err(e) = self.memory.page_store() {
            self.send_page_store_response(DfuStatus::InvalidObject);
            debug!(error = %e, "storing page failed");
            return false;
        }

        if self.memory.firmware_offset() == self.firmware_image_size {
            let digest = self.memory.calc_firmware_sha256();
            if digest[..] == self.firmware_image_sha256[..] {
                if let Some(kind) = self.faults.consult(InjectionPoint::PostValidation) {
                    self.respond_per_fault(kind, |status| Message::DfuPageStoreResponse {
                        status,
                    });
                    self.events.dfu_failed();
                    return false;
                }

                self.send_page_store_response(DfuStatus::FirmwareSuccessfullyUpdated);
                self.events.dfu_page_stored(self.memory.firmware_offset());
                self.events.dfu_update_complete();
                info!("firmware successfully updated");
            } else {
                self.send_page_store_response(DfuStatus::InvalidObject);
                self.events.dfu_failed();
                warn!(
                    computed = %hex::encode(digest),
                    declared = %hex::encode(&self.firmware_image_sha256),
                    "firmware sha256 mismatch"
                );
            }
            return false;
        }

        self.send_page_store_response(DfuStatus::Success);
        self.events.dfu_page_stored(self.memory.firmware_offset());
        debug!(firmware_offset = self.memory.firmware_offset(), "page store success");
        true
    }

    pub fn send_page_store_response(&self, status: DfuStatus) {
        self.sender.send(&Message::DfuPageStoreResponse { status });
    }

    fn send_init_response(&self, status: DfuStatus) {
        self.sender.send(&Message::DfuInitResponse { status });
    }

    /// Apply a fired fault to the response that was about to go out:
    /// either suppress it entirely or send it with the injected status.
    fn respond_per_fault(&self, kind: FaultKind, make: impl FnOnce(DfuStatus) -> Message) {
        match kind {
            FaultKind::NoResponse => debug!("fault suppressed response"),
            FaultKind::RespondWithStatus(status) => self.sender.send(&make(status)),
        }
    }
}
