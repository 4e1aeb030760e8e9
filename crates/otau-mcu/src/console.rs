//! Console event sink: coloured status lines and a transfer progress bar.
//!
//! While the progress bar is live, routine chatter is suppressed so the
//! bar owns the terminal; errors always print. Fatal modem errors
//! terminate the process here, at the outward boundary, which keeps the
//! core library exit-free.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use otau_wire::{ErrorCode, Opcode};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::dfu::DfuState;
use crate::events::{DfuEventSink, ModemEventSink};
use crate::modem::ModemState;

const HEX_BYTES_PER_ROW: usize = 16;

#[derive(Default)]
pub struct ConsoleEvents {
    bar: Mutex<Option<ProgressBar>>,
}

impl ConsoleEvents {
    pub fn new() -> Self {
        Self::default()
    }

    fn print_standard(&self, msg: &str) {
        if self.bar.lock().is_none() {
            println!("{msg}");
        }
    }

    fn print_important(&self, msg: &str) {
        if self.bar.lock().is_none() {
            println!("{}", msg.yellow());
        }
    }

    fn print_informative(&self, msg: &str) {
        if self.bar.lock().is_none() {
            println!("{}", msg.green());
        }
    }

    fn print_error(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    fn start_progress(&self, total: u32, initial: u32) {
        let mut bar = self.bar.lock();
        if bar.is_some() {
            debug!("progress bar already started");
            return;
        }
        let pb = ProgressBar::new(u64::from(total));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        pb.set_position(u64::from(initial));
        *bar = Some(pb);
    }

    /// Close the bar if one is running.
    pub fn stop_progress(&self) {
        if let Some(pb) = self.bar.lock().take() {
            pb.finish_and_clear();
        }
    }
}

impl DfuEventSink for ConsoleEvents {
    fn dfu_unexpected_message(&self, opcode: Opcode) {
        self.print_error(&format!("Received unexpected DFU message: {opcode:?}"));
    }

    fn dfu_state_changed(&self, state: DfuState) {
        self.print_important(&format!("DFU state changed to: {state:?}"));
    }

    fn dfu_initialized(
        &self,
        firmware_size: u32,
        firmware_sha256: &[u8],
        app_data: &[u8],
        progress: u32,
    ) {
        let mut out = String::from("DFU initialized!\n");
        out.push_str(&format!("Firmware size:   {firmware_size}\n"));
        out.push_str(&format!("Firmware SHA256: {}\n", hex::encode(firmware_sha256)));
        out.push_str("Received app data:");
        for row in app_data.chunks(HEX_BYTES_PER_ROW) {
            out.push('\n');
            out.push_str(&hex::encode(row));
        }
        self.print_important(&out);
        self.start_progress(firmware_size, progress);
    }

    fn dfu_page_stored(&self, firmware_offset: u32) {
        if let Some(pb) = self.bar.lock().as_ref() {
            pb.set_position(u64::from(firmware_offset));
        }
    }

    fn dfu_update_complete(&self) {
        self.stop_progress();
        self.print_important("DFU update completed with success!");
    }

    fn dfu_failed(&self) {
        self.stop_progress();
        self.print_error("DFU update failed!");
    }
}

impl ModemEventSink for ConsoleEvents {
    fn modem_unexpected_message(&self, opcode: Opcode) {
        debug!(?opcode, "unexpected modem message");
    }

    fn modem_state_changed(&self, state: ModemState) {
        self.print_important(&format!("Modem state changed to: {state:?}"));
    }

    fn modem_registered_models(&self, model_ids: &[u16]) {
        let list = model_ids
            .iter()
            .map(|id| format!("0x{id:04x}"))
            .collect::<Vec<_>>()
            .join(" ");
        self.print_standard(&format!("Modem registered models: {list}"));
    }

    fn modem_firmware_version(&self, version: &[u8]) {
        self.print_informative(&format!("Modem firmware version: {}", hex::encode(version)));
    }

    fn modem_device_uuid(&self, uuid: &[u8]) {
        self.print_informative(&format!("Modem UUID: {}", hex::encode(uuid)));
    }

    fn modem_mesh_request(&self, mesh_opcode: u16, _command: &[u8]) {
        self.print_standard(&format!(
            "Received mesh message request with opcode 0x{mesh_opcode:04x}"
        ));
    }

    fn modem_factory_reset(&self) {
        self.print_standard("Modem factory reset!");
    }

    fn modem_soft_reset(&self) {
        self.print_standard("Modem soft reset!");
    }

    fn modem_attention(&self, on: bool) {
        self.print_important(&format!("Modem attention: {}", if on { "on" } else { "off" }));
    }

    fn modem_error(&self, code: ErrorCode) {
        if code.is_fatal() {
            error!(%code, "unrecoverable modem error");
            self.stop_progress();
            self.print_error(&format!("Unrecoverable modem error: {code}"));
            std::process::exit(1);
        }
        if code == ErrorCode::InvalidState {
            debug!(%code, "modem error");
            return;
        }
        self.print_error(&format!("Modem error: {code}"));
    }
}
