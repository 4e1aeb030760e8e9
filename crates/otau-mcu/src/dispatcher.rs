//! Frame demultiplexer.
//!
//! Owns the two state machines and the DFU manager, decodes raw frames
//! coming off the link, and routes each message to whichever machine
//! owns its opcode family. Undecodable frames are logged and dropped;
//! no error frame goes back to the peer.

use otau_wire::Message;
use tracing::{info, warn};

use crate::dfu::{DfuFsm, DfuManager, DfuState};
use crate::modem::{ModemFsm, ModemState};

pub struct Dispatcher {
    modem: ModemFsm,
    dfu: DfuFsm,
    dfu_mgr: DfuManager,
}

impl Dispatcher {
    pub fn new(modem: ModemFsm, dfu: DfuFsm, dfu_mgr: DfuManager) -> Self {
        info!("dispatcher initialized");
        Self {
            modem,
            dfu,
            dfu_mgr,
        }
    }

    /// Run both machines' entry actions.
    pub fn start(&mut self) {
        self.modem.start();
        self.dfu.start(&mut self.dfu_mgr);
    }

    /// Decode and route one raw frame (opcode + payload, framing already
    /// stripped).
    pub fn on_frame(&mut self, raw: &[u8]) {
        match otau_wire::decode(raw) {
            Ok(msg) => self.route(msg),
            Err(e) => warn!(error = %e, frame = ?raw, "dropping undecodable frame"),
        }
    }

    pub fn route(&mut self, msg: Message) {
        if msg.opcode().is_dfu() {
            self.dfu.dispatch(&mut self.dfu_mgr, msg);
        } else {
            self.modem.dispatch(msg);
        }
    }

    pub fn dfu_state(&self) -> DfuState {
        self.dfu.state()
    }

    pub fn modem_state(&self) -> ModemState {
        self.modem.state()
    }

    pub fn dfu_manager(&self) -> &DfuManager {
        &self.dfu_mgr
    }
}
