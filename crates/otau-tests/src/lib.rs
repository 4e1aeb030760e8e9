//! Shared fixtures for the end-to-end OTAU scenarios.
//!
//! A [`TestRig`] is a fully wired emulator core (dispatcher, both FSMs,
//! manager, real temp files) with recording doubles in place of the
//! serial link and the console. Frames are fed through the dispatcher in
//! encoded form, the same path live traffic takes.

use std::sync::Arc;

use otau_mcu::dfu::{DfuFsm, DfuManager};
use otau_mcu::dispatcher::Dispatcher;
use otau_mcu::fault::{FaultRegistry, FaultSpec, InjectionPoint};
use otau_mcu::memory::PageMemory;
use otau_mcu::modem::ModemFsm;
use otau_mcu::nvm::NvmStore;
use otau_mcu::testing::{RecordingEvents, RecordingSink};
use otau_wire::Message;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

/// Rig construction knobs; the defaults fit the happy-path scenario.
pub struct RigOptions {
    pub supported_page_size: u16,
    pub max_image_size: u32,
    pub expected_app_data: Option<Vec<u8>>,
    pub faults: Vec<(InjectionPoint, FaultSpec)>,
}

impl Default for RigOptions {
    fn default() -> Self {
        Self {
            supported_page_size: 64,
            max_image_size: 0,
            expected_app_data: None,
            faults: Vec::new(),
        }
    }
}

pub struct TestRig {
    pub dir: TempDir,
    pub frames: Arc<RecordingSink>,
    pub events: Arc<RecordingEvents>,
    pub dispatcher: Dispatcher,
}

impl TestRig {
    pub fn new(opts: RigOptions) -> Self {
        Self::with_dir(tempfile::tempdir().expect("tempdir"), opts)
    }

    /// Tear the core down and rebuild it over the same directory - the
    /// crash-and-restart case.
    pub fn reopen(self, opts: RigOptions) -> Self {
        let dir = self.dir;
        drop(self.dispatcher);
        Self::with_dir(dir, opts)
    }

    fn with_dir(dir: TempDir, opts: RigOptions) -> Self {
        let memory = PageMemory::new(
            dir.path().join("app_data"),
            dir.path().join("firmware"),
            dir.path().join("sha256"),
            opts.supported_page_size,
            opts.max_image_size,
        );
        let nvm = NvmStore::open(dir.path().join("nvm"));

        let mut faults = FaultRegistry::new();
        for (point, spec) in opts.faults {
            faults.arm(point, spec);
        }

        let frames = Arc::new(RecordingSink::new());
        let events = Arc::new(RecordingEvents::new());

        let (dfu_mgr, initial_state) = DfuManager::new(
            memory,
            nvm,
            faults,
            frames.clone(),
            events.clone(),
            opts.expected_app_data,
        );
        let dfu_fsm = DfuFsm::new(initial_state);
        let modem_fsm = ModemFsm::new(frames.clone(), events.clone(), vec![0x1001]);

        let mut dispatcher = Dispatcher::new(modem_fsm, dfu_fsm, dfu_mgr);
        dispatcher.start();

        Self {
            dir,
            frames,
            events,
            dispatcher,
        }
    }

    /// Feed one frame through the dispatcher, encoded, the way the link
    /// delivers it.
    pub fn feed(&mut self, msg: Message) {
        self.dispatcher.on_frame(&msg.encode());
    }

    /// Discard everything recorded so far (typically the start-up
    /// probes).
    pub fn drain(&self) {
        self.frames.take();
        self.events.take_dfu();
        self.events.take_modem();
    }
}

/// Deterministic firmware content for a given length.
pub fn firmware_bytes(len: u32) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

/// The digest form the protocol declares and compares: SHA-256 of the
/// image, byte-reversed.
pub fn declared_sha256(firmware: &[u8]) -> [u8; 32] {
    let mut sha: [u8; 32] = Sha256::digest(firmware).into();
    sha.reverse();
    sha
}

/// An init request declaring `firmware` with a matching digest.
pub fn init_request(firmware: &[u8], app_data: &[u8]) -> Message {
    Message::DfuInitRequest {
        firmware_size: firmware.len() as u32,
        firmware_sha256: declared_sha256(firmware),
        app_data: app_data.to_vec(),
    }
}

/// Drive one full page: create, write in `chunk` byte slices, store.
pub fn drive_page(rig: &mut TestRig, page: &[u8], chunk: usize) {
    rig.feed(Message::DfuPageCreateRequest {
        requested_page_size: page.len() as u16,
    });
    for part in page.chunks(chunk) {
        rig.feed(Message::DfuWriteDataEvent {
            data: part.to_vec(),
        });
    }
    rig.feed(Message::DfuPageStoreRequest);
}
