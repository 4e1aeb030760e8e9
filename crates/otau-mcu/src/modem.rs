//! Modem lifecycle state machine.
//!
//! Establishes the link before DFU traffic is useful. On start the
//! machine does not know what the modem is doing, so it asks
//! (`CurrentStateRequest`) and follows the answer; after that it walks
//! the modem through instance registration (InitDevice → Device) and
//! node start-up (InitNode → Node) as the modem emits its lifecycle
//! events.
//!
//! Every state echoes pings and surfaces firmware-version, UUID,
//! attention, soft-reset, and error frames as events. A lifecycle frame
//! arriving in the wrong state means our view of the modem is stale: the
//! event sink is told and the machine drops back to Unknown to re-probe.

use std::sync::Arc;

use otau_wire::{Message, ModemStateId};
use tracing::{debug, info};

use crate::events::ModemEventSink;
use crate::link::FrameSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemState {
    Unknown,
    InitDevice,
    Device,
    InitNode,
    Node,
}

pub struct ModemFsm {
    state: ModemState,
    /// Models registered on InitDeviceEvent.
    default_models: Vec<u16>,
    sender: Arc<dyn FrameSink>,
    events: Arc<dyn ModemEventSink>,
}

impl ModemFsm {
    pub fn new(
        sender: Arc<dyn FrameSink>,
        events: Arc<dyn ModemEventSink>,
        default_models: Vec<u16>,
    ) -> Self {
        debug!(models = default_models.len(), "modem FSM initialized");
        Self {
            state: ModemState::Unknown,
            default_models,
            sender,
            events,
        }
    }

    pub fn state(&self) -> ModemState {
        self.state
    }

    /// Enter the initial state and query the modem's identity.
    pub fn start(&mut self) {
        self.enter(self.state);
        self.sender.send(&Message::FirmwareVersionRequest);
        self.sender.send(&Message::DeviceUuidRequest);
        info!("modem FSM started");
    }

    fn enter(&mut self, next: ModemState) {
        self.state = next;
        self.events.modem_state_changed(next);
        if next == ModemState::Unknown {
            self.sender.send(&Message::CurrentStateRequest);
        }
        info!(state = ?next, "modem state entered");
    }

    fn unexpected(&mut self, msg: &Message) {
        self.events.modem_unexpected_message(msg.opcode());
    }

    /// Wrong-state lifecycle frame: report it and re-probe the modem.
    fn lost_sync(&mut self, msg: &Message) {
        self.unexpected(msg);
        self.enter(ModemState::Unknown);
    }

    pub fn dispatch(&mut self, msg: Message) {
        // Frames every state treats identically.
        match &msg {
            Message::PingRequest { data } => {
                self.sender.send(&Message::PongResponse { data: data.clone() });
                return;
            }
            Message::PongResponse { .. } => return,
            Message::FirmwareVersionResponse { version } => {
                self.events.modem_firmware_version(version);
                return;
            }
            Message::DeviceUuidResponse { uuid } => {
                self.events.modem_device_uuid(uuid);
                return;
            }
            Message::AttentionEvent { on } => {
                self.events.modem_attention(*on);
                return;
            }
            Message::SoftResetRequest | Message::FactoryResetResponse => return,
            Message::SoftResetResponse => {
                self.events.modem_soft_reset();
                return;
            }
            Message::Error { code } => {
                self.events.modem_error(*code);
                return;
            }
            // Frames that should never reach an MCU; their arrival is a
            // peer bug, not a state mismatch.
            Message::CreateInstancesRequest { .. }
            | Message::StartNodeRequest
            | Message::FactoryResetRequest
            | Message::CurrentStateRequest
            | Message::FirmwareVersionRequest
            | Message::DeviceUuidRequest
            | Message::SensorUpdateRequest { .. }
            | Message::SensorUpdateResponse => {
                self.unexpected(&msg);
                return;
            }
            _ => {}
        }

        match self.state {
            ModemState::Unknown => self.dispatch_unknown(msg),
            ModemState::InitDevice => self.dispatch_init_device(msg),
            ModemState::Device => self.dispatch_device(msg),
            ModemState::InitNode => self.dispatch_init_node(msg),
            ModemState::Node => self.dispatch_node(msg),
        }
    }

    fn dispatch_unknown(&mut self, msg: Message) {
        match msg {
            Message::InitDeviceEvent { .. } => self.enter(ModemState::InitDevice),
            Message::InitNodeEvent { .. } => self.enter(ModemState::InitNode),
            Message::CurrentStateResponse { state } => {
                let next = match state {
                    ModemStateId::InitDevice => ModemState::InitDevice,
                    ModemStateId::Device => ModemState::Device,
                    ModemStateId::InitNode => ModemState::InitNode,
                    ModemStateId::Node => ModemState::Node,
                };
                self.enter(next);
            }
            other => self.unexpected(&other),
        }
    }

    fn dispatch_init_device(&mut self, msg: Message) {
        match msg {
            Message::InitDeviceEvent { .. } => {
                self.sender.send(&Message::CreateInstancesRequest {
                    model_ids: self.default_models.clone(),
                });
            }
            Message::CreateInstancesResponse { model_ids } => {
                self.events.modem_registered_models(&model_ids);
                self.enter(ModemState::Device);
            }
            Message::CurrentStateResponse { state } => {
                if state != ModemStateId::InitDevice {
                    self.lost_sync(&Message::CurrentStateResponse { state });
                }
            }
            other => self.lost_sync(&other),
        }
    }

    fn dispatch_device(&mut self, msg: Message) {
        match msg {
            Message::InitNodeEvent { .. } => self.enter(ModemState::InitNode),
            Message::FactoryResetEvent => {
                self.events.modem_factory_reset();
                self.enter(ModemState::InitDevice);
            }
            Message::CurrentStateResponse { state } => {
                if state != ModemStateId::Device {
                    self.lost_sync(&Message::CurrentStateResponse { state });
                }
            }
            other => self.lost_sync(&other),
        }
    }

    fn dispatch_init_node(&mut self, msg: Message) {
        match msg {
            Message::InitNodeEvent { model_ids } => {
                self.events.modem_registered_models(&model_ids);
                self.sender.send(&Message::StartNodeRequest);
            }
            Message::StartNodeResponse => self.enter(ModemState::Node),
            Message::FactoryResetEvent => {}
            Message::CurrentStateResponse { state } => {
                if state != ModemStateId::InitNode {
                    self.lost_sync(&Message::CurrentStateResponse { state });
                }
            }
            other => self.lost_sync(&other),
        }
    }

    fn dispatch_node(&mut self, msg: Message) {
        match msg {
            Message::MeshMessageRequest {
                mesh_opcode,
                command,
            } => self.events.modem_mesh_request(mesh_opcode, &command),
            Message::MeshMessageResponse => {}
            Message::FactoryResetEvent => {
                self.events.modem_factory_reset();
                self.enter(ModemState::InitDevice);
            }
            Message::CurrentStateResponse { state } => {
                if state != ModemStateId::Node {
                    self.lost_sync(&Message::CurrentStateResponse { state });
                }
            }
            other => self.lost_sync(&other),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use otau_wire::{ErrorCode, Opcode};

    use super::*;
    use crate::testing::{ModemEvent, RecordingEvents, RecordingSink};

    struct Rig {
        fsm: ModemFsm,
        frames: Arc<RecordingSink>,
        events: Arc<RecordingEvents>,
    }

    fn rig() -> Rig {
        let frames = Arc::new(RecordingSink::new());
        let events = Arc::new(RecordingEvents::new());
        let mut fsm = ModemFsm::new(frames.clone(), events.clone(), vec![0x1300]);
        fsm.start();

        // start() probes state, firmware version, and UUID
        assert_eq!(
            frames.take(),
            vec![
                Message::CurrentStateRequest,
                Message::FirmwareVersionRequest,
                Message::DeviceUuidRequest,
            ]
        );
        assert_eq!(
            events.take_modem(),
            vec![ModemEvent::StateChanged(ModemState::Unknown)]
        );

        Rig { fsm, frames, events }
    }

    fn goto_node(rig: &mut Rig) {
        rig.fsm.dispatch(Message::CurrentStateResponse {
            state: ModemStateId::Node,
        });
        rig.frames.take();
        rig.events.take_modem();
    }

    #[test]
    fn ping_is_echoed_in_every_state() {
        let mut rig = rig();
        rig.fsm.dispatch(Message::PingRequest { data: vec![0xAA] });
        assert_eq!(
            rig.frames.take(),
            vec![Message::PongResponse { data: vec![0xAA] }]
        );

        goto_node(&mut rig);
        rig.fsm.dispatch(Message::PingRequest { data: vec![0xBB] });
        assert_eq!(
            rig.frames.take(),
            vec![Message::PongResponse { data: vec![0xBB] }]
        );
    }

    #[test]
    fn current_state_response_selects_state() {
        for (id, expected) in [
            (ModemStateId::InitDevice, ModemState::InitDevice),
            (ModemStateId::Device, ModemState::Device),
            (ModemStateId::InitNode, ModemState::InitNode),
            (ModemStateId::Node, ModemState::Node),
        ] {
            let mut rig = rig();
            rig.fsm.dispatch(Message::CurrentStateResponse { state: id });
            assert_eq!(rig.fsm.state(), expected);
            assert_eq!(
                rig.events.take_modem(),
                vec![ModemEvent::StateChanged(expected)]
            );
        }
    }

    #[test]
    fn init_device_handshake_reaches_device() {
        let mut rig = rig();
        rig.fsm.dispatch(Message::CurrentStateResponse {
            state: ModemStateId::InitDevice,
        });
        rig.events.take_modem();

        rig.fsm.dispatch(Message::InitDeviceEvent { model_ids: vec![] });
        assert_eq!(
            rig.frames.take(),
            vec![Message::CreateInstancesRequest {
                model_ids: vec![0x1300]
            }]
        );

        rig.fsm.dispatch(Message::CreateInstancesResponse {
            model_ids: vec![0x1300],
        });
        assert_eq!(rig.fsm.state(), ModemState::Device);
        assert_eq!(
            rig.events.take_modem(),
            vec![
                ModemEvent::RegisteredModels(vec![0x1300]),
                ModemEvent::StateChanged(ModemState::Device),
            ]
        );
    }

    #[test]
    fn init_node_handshake_reaches_node() {
        let mut rig = rig();
        rig.fsm.dispatch(Message::CurrentStateResponse {
            state: ModemStateId::Device,
        });
        rig.fsm.dispatch(Message::InitNodeEvent {
            model_ids: vec![0x1300],
        });
        assert_eq!(rig.fsm.state(), ModemState::InitNode);
        rig.events.take_modem();

        rig.fsm.dispatch(Message::InitNodeEvent {
            model_ids: vec![0x1300],
        });
        assert_eq!(rig.frames.take(), vec![Message::StartNodeRequest]);

        rig.fsm.dispatch(Message::StartNodeResponse);
        assert_eq!(rig.fsm.state(), ModemState::Node);
    }

    #[test]
    fn node_surfaces_mesh_requests() {
        let mut rig = rig();
        goto_node(&mut rig);

        rig.fsm.dispatch(Message::MeshMessageRequest {
            mesh_opcode: 0x8201,
            command: vec![0x01, 0x02],
        });
        assert_eq!(
            rig.events.take_modem(),
            vec![ModemEvent::MeshRequest(0x8201, vec![0x01, 0x02])]
        );
    }

    #[test]
    fn sensor_update_request_is_unexpected_in_every_state() {
        let mut rig = rig();
        rig.fsm.dispatch(Message::SensorUpdateRequest {
            payload: vec![0x01, 0x02],
        });
        assert_eq!(rig.fsm.state(), ModemState::Unknown);
        assert_eq!(
            rig.events.take_modem(),
            vec![ModemEvent::Unexpected(Opcode::SensorUpdateRequest)]
        );

        goto_node(&mut rig);
        rig.fsm.dispatch(Message::SensorUpdateRequest {
            payload: vec![0x03],
        });
        // Reported, but no state change and nothing sent back.
        assert_eq!(rig.fsm.state(), ModemState::Node);
        assert_eq!(
            rig.events.take_modem(),
            vec![ModemEvent::Unexpected(Opcode::SensorUpdateRequest)]
        );
        assert!(rig.frames.take().is_empty());
    }

    #[test]
    fn factory_reset_from_node_returns_to_init_device() {
        let mut rig = rig();
        goto_node(&mut rig);

        rig.fsm.dispatch(Message::FactoryResetEvent);
        assert_eq!(rig.fsm.state(), ModemState::InitDevice);
        assert_eq!(
            rig.events.take_modem(),
            vec![
                ModemEvent::FactoryReset,
                ModemEvent::StateChanged(ModemState::InitDevice),
            ]
        );
    }

    #[test]
    fn wrong_state_lifecycle_frame_drops_to_unknown() {
        let mut rig = rig();
        goto_node(&mut rig);

        rig.fsm.dispatch(Message::InitDeviceEvent { model_ids: vec![] });
        assert_eq!(rig.fsm.state(), ModemState::Unknown);
        let events = rig.events.take_modem();
        assert!(events.contains(&ModemEvent::Unexpected(Opcode::InitDeviceEvent)));
        assert!(events.contains(&ModemEvent::StateChanged(ModemState::Unknown)));
        // Re-entering Unknown re-probes the modem.
        assert_eq!(rig.frames.take(), vec![Message::CurrentStateRequest]);
    }

    #[test]
    fn stale_current_state_response_drops_to_unknown() {
        let mut rig = rig();
        goto_node(&mut rig);

        rig.fsm.dispatch(Message::CurrentStateResponse {
            state: ModemStateId::InitDevice,
        });
        assert_eq!(rig.fsm.state(), ModemState::Unknown);
    }

    #[test]
    fn errors_surface_as_events() {
        let mut rig = rig();
        rig.fsm.dispatch(Message::Error {
            code: ErrorCode::NoLicenseForModelRegistration,
        });
        assert_eq!(
            rig.events.take_modem(),
            vec![ModemEvent::Error(ErrorCode::NoLicenseForModelRegistration)]
        );
        // The sink decides fatality; the FSM itself stays put.
        assert_eq!(rig.fsm.state(), ModemState::Unknown);
    }

    #[test]
    fn identity_responses_surface_in_any_state() {
        let mut rig = rig();
        goto_node(&mut rig);

        rig.fsm.dispatch(Message::FirmwareVersionResponse {
            version: vec![0x01, 0x02],
        });
        rig.fsm.dispatch(Message::DeviceUuidResponse { uuid: [0x42; 16] });
        assert_eq!(
            rig.events.take_modem(),
            vec![
                ModemEvent::FirmwareVersion(vec![0x01, 0x02]),
                ModemEvent::DeviceUuid(vec![0x42; 16]),
            ]
        );
    }
}
