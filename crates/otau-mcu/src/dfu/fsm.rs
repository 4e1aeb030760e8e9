//! DFU transfer state machine.
//!
//! Three states drive the page protocol:
//!
//! - **Standby**: no transfer armed. Entering it persists the state and
//!   probes the peer with a `DfuStateRequest`; a peer that answers
//!   `InProgress` is mid-transfer from before a reboot and gets a
//!   `DfuCancelRequest`.
//! - **Upload**: init accepted, between pages.
//! - **UploadPage**: a page accumulator is open.
//!
//! Dispatch is a single match over `(state, message)`. Handlers that
//! need to re-process the triggering frame in a new state (an
//! InitRequest arriving mid-transfer, a PageCreate arriving while a page
//! is open) return it for re-delivery, and `dispatch` loops instead of
//! recursing, so a hostile peer cannot grow the stack.

use otau_wire::{Message, TransferPhase};
use tracing::debug;

use crate::dfu::DfuManager;

/// DFU FSM state. The discriminants are the NVM `current_state_id`
/// values and must stay stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuState {
    Standby = 1,
    Upload = 2,
    UploadPage = 3,
}

impl DfuState {
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(DfuState::Standby),
            2 => Some(DfuState::Upload),
            3 => Some(DfuState::UploadPage),
            _ => None,
        }
    }
}

pub struct DfuFsm {
    state: DfuState,
}

impl DfuFsm {
    pub fn new(initial: DfuState) -> Self {
        Self { state: initial }
    }

    pub fn state(&self) -> DfuState {
        self.state
    }

    /// Run the entry actions of the initial state (persist it, and from
    /// Standby probe the peer for a stale transfer).
    pub fn start(&mut self, mgr: &mut DfuManager) {
        self.enter(mgr, self.state);
    }

    /// Feed one DFU-family frame through the machine.
    pub fn dispatch(&mut self, mgr: &mut DfuManager, msg: Message) {
        let mut pending = Some(msg);
        while let Some(msg) = pending.take() {
            pending = self.handle(mgr, msg);
        }
    }

    fn enter(&mut self, mgr: &mut DfuManager, next: DfuState) {
        self.state = next;
        mgr.update_state(next);
        if next == DfuState::Standby {
            mgr.probe_peer_transfer();
        }
    }

    /// Handle one frame; a returned message is re-delivered in the state
    /// the handler switched to.
    fn handle(&mut self, mgr: &mut DfuManager, msg: Message) -> Option<Message> {
        match self.state {
            DfuState::Standby => self.handle_standby(mgr, msg),
            DfuState::Upload => self.handle_upload(mgr, msg),
            DfuState::UploadPage => self.handle_upload_page(mgr, msg),
        }
    }

    fn handle_standby(&mut self, mgr: &mut DfuManager, msg: Message) -> Option<Message> {
        match msg {
            Message::DfuInitRequest {
                firmware_size,
                firmware_sha256,
                app_data,
            } => {
                if mgr.init_otau(firmware_size, &firmware_sha256, &app_data) {
                    self.enter(mgr, DfuState::Upload);
                }
            }
            Message::DfuStatusRequest => {
                mgr.send_state_response(otau_wire::DfuStatus::Success, true);
            }
            Message::DfuPageCreateRequest { .. }
            | Message::DfuWriteDataEvent { .. }
            | Message::DfuPageStoreRequest => {
                mgr.report_unexpected_message(msg.opcode());
                mgr.drop_otau();
            }
            Message::DfuStateResponse { phase } => {
                debug!(?phase, "peer transfer probe answered");
                if phase == TransferPhase::InProgress {
                    mgr.drop_otau();
                }
            }
            Message::DfuCancelResponse => {}
            other => mgr.report_unexpected_message(other.opcode()),
        }
        None
    }

    fn handle_upload(&mut self, mgr: &mut DfuManager, msg: Message) -> Option<Message> {
        match msg {
            Message::DfuInitRequest { .. } => {
                // A new init mid-transfer kills the current one; the
                // request itself is then serviced from Standby.
                mgr.report_unexpected_message(msg.opcode());
                mgr.report_dfu_fail();
                self.enter(mgr, DfuState::Standby);
                return Some(msg);
            }
            Message::DfuStatusRequest => {
                mgr.send_state_response(otau_wire::DfuStatus::Success, false);
            }
            Message::DfuPageCreateRequest {
                requested_page_size,
            } => {
                mgr.create_page(requested_page_size);
                self.enter(mgr, DfuState::UploadPage);
            }
            Message::DfuWriteDataEvent { .. } => {
                mgr.report_unexpected_message(msg.opcode());
            }
            Message::DfuPageStoreRequest => {
                mgr.send_page_store_response(otau_wire::DfuStatus::OperationNotPermitted);
                mgr.report_unexpected_message(msg.opcode());
            }
            Message::DfuStateResponse { .. } => {}
            Message::DfuCancelResponse => {
                mgr.report_dfu_fail();
                self.enter(mgr, DfuState::Standby);
            }
            other => mgr.report_unexpected_message(other.opcode()),
        }
        None
    }

    fn handle_upload_page(&mut self, mgr: &mut DfuManager, msg: Message) -> Option<Message> {
        match msg {
            Message::DfuInitRequest { .. } => {
                mgr.report_unexpected_message(msg.opcode());
                mgr.report_dfu_fail();
                self.enter(mgr, DfuState::Standby);
                return Some(msg);
            }
            Message::DfuStatusRequest => {
                mgr.send_state_response(otau_wire::DfuStatus::Success, false);
            }
            Message::DfuPageCreateRequest { .. } => {
                // The open page is abandoned; the create is serviced from
                // Upload.
                self.enter(mgr, DfuState::Upload);
                return Some(msg);
            }
            Message::DfuWriteDataEvent { data } => {
                mgr.process_write_data(&data);
            }
            Message::DfuPageStoreRequest => {
                if mgr.page_store() {
                    self.enter(mgr, DfuState::Upload);
                } else {
                    self.enter(mgr, DfuState::Standby);
                }
            }
            Message::DfuStateResponse { .. } => {}
            Message::DfuCancelResponse => {
                mgr.report_dfu_fail();
                self.enter(mgr, DfuState::Standby);
            }
            other => mgr.report_unexpected_message(other.opcode()),
        }
        None
    }
}
