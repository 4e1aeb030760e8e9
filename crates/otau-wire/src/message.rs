//! Typed frames and the opcode+payload codec.
//!
//! `decode` parses exactly one frame (opcode byte plus payload) into a
//! [`Message`]; `Message::encode` produces the same bytes back. Both
//! directions of the link are covered so the emulator can recognise
//! response-typed frames that should never reach it and report them
//! instead of choking.
//!
//! # Payload layouts
//!
//! ```text
//! DfuInitRequest      firmware_size:u32 | firmware_sha256:32B | app_data_len:u8 | app_data
//! DfuStatusResponse   status:u8 | supported_page_size:u16 | firmware_offset:u32 | firmware_crc:u32
//! DfuPageCreateRequest requested_page_size:u16
//! DfuWriteDataEvent   data_len:u8 | data
//! MeshMessageRequest  mesh_opcode:u16 | command (rest of frame)
//! model-id lists      2N bytes of u16 ids (rest of frame)
//! ```
//!
//! All multi-byte integers are little-endian.

use thiserror::Error;

use crate::opcode::Opcode;
use crate::status::{DfuStatus, ErrorCode, ModemStateId, TransferPhase};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("empty frame")]
    Empty,

    #[error("unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),

    #[error("{opcode:?}: payload truncated, need {need} bytes, got {got}")]
    Truncated {
        opcode: Opcode,
        need: usize,
        got: usize,
    },

    #[error("{opcode:?}: {extra} trailing bytes after payload")]
    Trailing { opcode: Opcode, extra: usize },

    #[error("{opcode:?}: declared length {declared} does not match {got} remaining bytes")]
    BadLengthPrefix {
        opcode: Opcode,
        declared: usize,
        got: usize,
    },

    #[error("{opcode:?}: model id list of {len} bytes is not a whole number of u16s")]
    OddModelIdList { opcode: Opcode, len: usize },

    #[error("{opcode:?}: invalid {field} value 0x{value:02X}")]
    InvalidField {
        opcode: Opcode,
        field: &'static str,
        value: u8,
    },
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    InitDeviceEvent { model_ids: Vec<u16> },
    PingRequest { data: Vec<u8> },
    PongResponse { data: Vec<u8> },
    CreateInstancesRequest { model_ids: Vec<u16> },
    CreateInstancesResponse { model_ids: Vec<u16> },
    InitNodeEvent { model_ids: Vec<u16> },
    MeshMessageRequest { mesh_opcode: u16, command: Vec<u8> },
    StartNodeRequest,
    StartNodeResponse,
    FactoryResetRequest,
    FactoryResetResponse,
    FactoryResetEvent,
    MeshMessageResponse,
    CurrentStateRequest,
    CurrentStateResponse { state: ModemStateId },
    Error { code: ErrorCode },
    FirmwareVersionRequest,
    FirmwareVersionResponse { version: Vec<u8> },
    SensorUpdateRequest { payload: Vec<u8> },
    AttentionEvent { on: bool },
    SoftResetRequest,
    SoftResetResponse,
    SensorUpdateResponse,
    DeviceUuidRequest,
    DeviceUuidResponse { uuid: [u8; 16] },
    DfuInitRequest {
        firmware_size: u32,
        firmware_sha256: [u8; 32],
        app_data: Vec<u8>,
    },
    DfuInitResponse { status: DfuStatus },
    DfuStatusRequest,
    DfuStatusResponse {
        status: DfuStatus,
        supported_page_size: u16,
        firmware_offset: u32,
        firmware_crc: u32,
    },
    DfuPageCreateRequest { requested_page_size: u16 },
    DfuPageCreateResponse { status: DfuStatus },
    DfuWriteDataEvent { data: Vec<u8> },
    DfuPageStoreRequest,
    DfuPageStoreResponse { status: DfuStatus },
    DfuStateRequest,
    DfuStateResponse { phase: TransferPhase },
    DfuCancelRequest,
    DfuCancelResponse,
}

impl Message {
    pub fn opcode(&self) -> Opcode {
        use Message::*;
        match self {
            InitDeviceEvent { .. } => Opcode::InitDeviceEvent,
            PingRequest { .. } => Opcode::PingRequest,
            PongResponse { .. } => Opcode::PongResponse,
            CreateInstancesRequest { .. } => Opcode::CreateInstancesRequest,
            CreateInstancesResponse { .. } => Opcode::CreateInstancesResponse,
            InitNodeEvent { .. } => Opcode::InitNodeEvent,
            MeshMessageRequest { .. } => Opcode::MeshMessageRequest,
            StartNodeRequest => Opcode::StartNodeRequest,
            StartNodeResponse => Opcode::StartNodeResponse,
            FactoryResetRequest => Opcode::FactoryResetRequest,
            FactoryResetResponse => Opcode::FactoryResetResponse,
            FactoryResetEvent => Opcode::FactoryResetEvent,
            MeshMessageResponse => Opcode::MeshMessageResponse,
            CurrentStateRequest => Opcode::CurrentStateRequest,
            CurrentStateResponse { .. } => Opcode::CurrentStateResponse,
            Error { .. } => Opcode::Error,
            FirmwareVersionRequest => Opcode::FirmwareVersionRequest,
            FirmwareVersionResponse { .. } => Opcode::FirmwareVersionResponse,
            SensorUpdateRequest { .. } => Opcode::SensorUpdateRequest,
            AttentionEvent { .. } => Opcode::AttentionEvent,
            SoftResetRequest => Opcode::SoftResetRequest,
            SoftResetResponse => Opcode::SoftResetResponse,
            SensorUpdateResponse => Opcode::SensorUpdateResponse,
            DeviceUuidRequest => Opcode::DeviceUuidRequest,
            DeviceUuidResponse { .. } => Opcode::DeviceUuidResponse,
            DfuInitRequest { .. } => Opcode::DfuInitRequest,
            DfuInitResponse { .. } => Opcode::DfuInitResponse,
            DfuStatusRequest => Opcode::DfuStatusRequest,
            DfuStatusResponse { .. } => Opcode::DfuStatusResponse,
            DfuPageCreateRequest { .. } => Opcode::DfuPageCreateRequest,
            DfuPageCreateResponse { .. } => Opcode::DfuPageCreateResponse,
            DfuWriteDataEvent { .. } => Opcode::DfuWriteDataEvent,
            DfuPageStoreRequest => Opcode::DfuPageStoreRequest,
            DfuPageStoreResponse { .. } => Opcode::DfuPageStoreResponse,
            DfuStateRequest => Opcode::DfuStateRequest,
            DfuStateResponse { .. } => Opcode::DfuStateResponse,
            DfuCancelRequest => Opcode::DfuCancelRequest,
            DfuCancelResponse => Opcode::DfuCancelResponse,
        }
    }

    /// Serialise to opcode + payload bytes.
    pub fn encode(&self) -> Vec<u8> {
        use Message::*;
        let mut buf = vec![self.opcode() as u8];
        match self {
            InitDeviceEvent { model_ids }
            | CreateInstancesRequest { model_ids }
            | CreateInstancesResponse { model_ids }
            | InitNodeEvent { model_ids } => {
                for id in model_ids {
                    buf.extend_from_slice(&id.to_le_bytes());
                }
            }
            PingRequest { data } | PongResponse { data } => buf.extend_from_slice(data),
            MeshMessageRequest {
                mesh_opcode,
                command,
            } => {
                buf.extend_from_slice(&mesh_opcode.to_le_bytes());
                buf.extend_from_slice(command);
            }
            CurrentStateResponse { state } => buf.push(*state as u8),
            Error { code } => buf.push(code.raw()),
            FirmwareVersionResponse { version } => buf.extend_from_slice(version),
            SensorUpdateRequest { payload } => buf.extend_from_slice(payload),
            AttentionEvent { on } => buf.push(u8::from(*on)),
            DeviceUuidResponse { uuid } => buf.extend_from_slice(uuid),
            DfuInitRequest {
                firmware_size,
                firmware_sha256,
                app_data,
            } => {
                buf.extend_from_slice(&firmware_size.to_le_bytes());
                buf.extend_from_slice(firmware_sha256);
                buf.push(app_data.len() as u8);
                buf.extend_from_slice(app_data);
            }
            DfuInitResponse { status }
            | DfuPageCreateResponse { status }
            | DfuPageStoreResponse { status } => buf.push(*status as u8),
            DfuStatusResponse {
                status,
                supported_page_size,
                firmware_offset,
                firmware_crc,
            } => {
                buf.push(*status as u8);
                buf.extend_from_slice(&supported_page_size.to_le_bytes());
                buf.extend_from_slice(&firmware_offset.to_le_bytes());
                buf.extend_from_slice(&firmware_crc.to_le_bytes());
            }
            DfuPageCreateRequest {
                requested_page_size,
            } => buf.extend_from_slice(&requested_page_size.to_le_bytes()),
            DfuWriteDataEvent { data } => {
                buf.push(data.len() as u8);
                buf.extend_from_slice(data);
            }
            DfuStateResponse { phase } => buf.push(*phase as u8),
            // Payload-less frames
            StartNodeRequest | StartNodeResponse | FactoryResetRequest
            | FactoryResetResponse | FactoryResetEvent | MeshMessageResponse
            | CurrentStateRequest | FirmwareVersionRequest | SoftResetRequest
            | SoftResetResponse | SensorUpdateResponse | DeviceUuidRequest
            | DfuStatusRequest | DfuPageStoreRequest | DfuStateRequest
            | DfuCancelRequest | DfuCancelResponse => {}
        }
        buf
    }
}

/// Parse one frame (opcode byte + payload).
pub fn decode(frame: &[u8]) -> Result<Message, WireError> {
    let (&raw, payload) = frame.split_first().ok_or(WireError::Empty)?;
    let opcode = Opcode::from_raw(raw).ok_or(WireError::UnknownOpcode(raw))?;
    let mut r = Reader { opcode, buf: payload, pos: 0 };

    let msg = match opcode {
        Opcode::InitDeviceEvent => Message::InitDeviceEvent {
            model_ids: r.model_ids()?,
        },
        Opcode::PingRequest => Message::PingRequest { data: r.rest() },
        Opcode::PongResponse => Message::PongResponse { data: r.rest() },
        Opcode::CreateInstancesRequest => Message::CreateInstancesRequest {
            model_ids: r.model_ids()?,
        },
        Opcode::CreateInstancesResponse => Message::CreateInstancesResponse {
            model_ids: r.model_ids()?,
        },
        Opcode::InitNodeEvent => Message::InitNodeEvent {
            model_ids: r.model_ids()?,
        },
        Opcode::MeshMessageRequest => Message::MeshMessageRequest {
            mesh_opcode: r.u16()?,
            command: r.rest(),
        },
        Opcode::StartNodeRequest => Message::StartNodeRequest,
        Opcode::StartNodeResponse => Message::StartNodeResponse,
        Opcode::FactoryResetRequest => Message::FactoryResetRequest,
        Opcode::FactoryResetResponse => Message::FactoryResetResponse,
        Opcode::FactoryResetEvent => Message::FactoryResetEvent,
        Opcode::MeshMessageResponse => Message::MeshMessageResponse,
        Opcode::CurrentStateRequest => Message::CurrentStateRequest,
        Opcode::CurrentStateResponse => {
            let raw = r.u8()?;
            let state = ModemStateId::from_raw(raw).ok_or(WireError::InvalidField {
                opcode,
                field: "modem state",
                value: raw,
            })?;
            Message::CurrentStateResponse { state }
        }
        Opcode::Error => Message::Error {
            code: ErrorCode::from_raw(r.u8()?),
        },
        Opcode::FirmwareVersionRequest => Message::FirmwareVersionRequest,
        Opcode::FirmwareVersionResponse => Message::FirmwareVersionResponse {
            version: r.rest(),
        },
        Opcode::SensorUpdateRequest => Message::SensorUpdateRequest { payload: r.rest() },
        Opcode::AttentionEvent => Message::AttentionEvent { on: r.u8()? != 0 },
        Opcode::SoftResetRequest => Message::SoftResetRequest,
        Opcode::SoftResetResponse => Message::SoftResetResponse,
        Opcode::SensorUpdateResponse => Message::SensorUpdateResponse,
        Opcode::DeviceUuidRequest => Message::DeviceUuidRequest,
        Opcode::DeviceUuidResponse => {
            let mut uuid = [0u8; 16];
            uuid.copy_from_slice(r.take(16)?);
            Message::DeviceUuidResponse { uuid }
        }
        Opcode::DfuInitRequest => {
            let firmware_size = r.u32()?;
            let mut firmware_sha256 = [0u8; 32];
            firmware_sha256.copy_from_slice(r.take(32)?);
            let app_data = r.counted_rest()?;
            Message::DfuInitRequest {
                firmware_size,
                firmware_sha256,
                app_data,
            }
        }
        Opcode::DfuInitResponse => Message::DfuInitResponse {
            status: r.dfu_status()?,
        },
        Opcode::DfuStatusRequest => Message::DfuStatusRequest,
        Opcode::DfuStatusResponse => Message::DfuStatusResponse {
            status: r.dfu_status()?,
            supported_page_size: r.u16()?,
            firmware_offset: r.u32()?,
            firmware_crc: r.u32()?,
        },
        Opcode::DfuPageCreateRequest => Message::DfuPageCreateRequest {
            requested_page_size: r.u16()?,
        },
        Opcode::DfuPageCreateResponse => Message::DfuPageCreateResponse {
            status: r.dfu_status()?,
        },
        Opcode::DfuWriteDataEvent => Message::DfuWriteDataEvent {
            data: r.counted_rest()?,
        },
        Opcode::DfuPageStoreRequest => Message::DfuPageStoreRequest,
        Opcode::DfuPageStoreResponse => Message::DfuPageStoreResponse {
            status: r.dfu_status()?,
        },
        Opcode::DfuStateRequest => Message::DfuStateRequest,
        Opcode::DfuStateResponse => {
            let raw = r.u8()?;
            let phase = TransferPhase::from_raw(raw).ok_or(WireError::InvalidField {
                opcode,
                field: "transfer phase",
                value: raw,
            })?;
            Message::DfuStateResponse { phase }
        }
        Opcode::DfuCancelRequest => Message::DfuCancelRequest,
        Opcode::DfuCancelResponse => Message::DfuCancelResponse,
    };

    r.finish()?;
    Ok(msg)
}

struct Reader<'a> {
    opcode: Opcode,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() < self.pos + n {
            return Err(WireError::Truncated {
                opcode: self.opcode,
                need: self.pos + n,
                got: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn dfu_status(&mut self) -> Result<DfuStatus, WireError> {
        let raw = self.u8()?;
        DfuStatus::from_raw(raw).ok_or(WireError::InvalidField {
            opcode: self.opcode,
            field: "dfu status",
            value: raw,
        })
    }

    /// Remaining bytes, consumed.
    fn rest(&mut self) -> Vec<u8> {
        let out = self.buf[self.pos..].to_vec();
        self.pos = self.buf.len();
        out
    }

    /// One-byte length prefix that must cover exactly the remaining bytes.
    fn counted_rest(&mut self) -> Result<Vec<u8>, WireError> {
        let declared = self.u8()? as usize;
        let remaining = self.buf.len() - self.pos;
        if declared != remaining {
            return Err(WireError::BadLengthPrefix {
                opcode: self.opcode,
                declared,
                got: remaining,
            });
        }
        Ok(self.rest())
    }

    /// Rest of the frame as little-endian u16 model ids.
    fn model_ids(&mut self) -> Result<Vec<u16>, WireError> {
        let raw = self.rest();
        if raw.len() % 2 != 0 {
            return Err(WireError::OddModelIdList {
                opcode: self.opcode,
                len: raw.len(),
            });
        }
        Ok(raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }

    fn finish(self) -> Result<(), WireError> {
        if self.pos < self.buf.len() {
            return Err(WireError::Trailing {
                opcode: self.opcode,
                extra: self.buf.len() - self.pos,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let bytes = msg.encode();
        assert_eq!(decode(&bytes).unwrap(), msg, "frame {:02X?}", bytes);
    }

    #[test]
    fn round_trips() {
        round_trip(Message::PingRequest { data: vec![0xAA] });
        round_trip(Message::PongResponse { data: vec![] });
        round_trip(Message::InitDeviceEvent {
            model_ids: vec![0x1001, 0x1300],
        });
        round_trip(Message::CreateInstancesRequest {
            model_ids: vec![0x1300],
        });
        round_trip(Message::MeshMessageRequest {
            mesh_opcode: 0x8201,
            command: vec![0x01, 0x02, 0x03],
        });
        round_trip(Message::CurrentStateResponse {
            state: ModemStateId::Node,
        });
        round_trip(Message::Error {
            code: ErrorCode::NoLicenseForModelRegistration,
        });
        round_trip(Message::DeviceUuidResponse { uuid: [0x42; 16] });
        round_trip(Message::DfuInitRequest {
            firmware_size: 160,
            firmware_sha256: [0xCD; 32],
            app_data: vec![0xFF; 16],
        });
        round_trip(Message::DfuStatusResponse {
            status: DfuStatus::Success,
            supported_page_size: 1024,
            firmware_offset: 0x0000_0080,
            firmware_crc: 0xDEAD_BEEF,
        });
        round_trip(Message::DfuPageCreateRequest {
            requested_page_size: 16,
        });
        round_trip(Message::DfuWriteDataEvent {
            data: vec![0xAA, 0xBB, 0xCC, 0xDD],
        });
        round_trip(Message::DfuStateResponse {
            phase: TransferPhase::InProgress,
        });
        round_trip(Message::DfuPageStoreRequest);
        round_trip(Message::DfuCancelResponse);
    }

    #[test]
    fn init_request_layout_is_little_endian() {
        let bytes = Message::DfuInitRequest {
            firmware_size: 0x0102_0304,
            firmware_sha256: [0x11; 32],
            app_data: vec![0xEE, 0xFF],
        }
        .encode();

        assert_eq!(bytes[0], 0x80);
        assert_eq!(&bytes[1..5], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[5..37], &[0x11; 32]);
        assert_eq!(bytes[37], 2);
        assert_eq!(&bytes[38..], &[0xEE, 0xFF]);
    }

    #[test]
    fn status_response_layout() {
        let bytes = Message::DfuStatusResponse {
            status: DfuStatus::Success,
            supported_page_size: 0x0400,
            firmware_offset: 0x50,
            firmware_crc: 0xA1B2_C3D4,
        }
        .encode();
        assert_eq!(
            bytes,
            vec![0x83, 0x01, 0x00, 0x04, 0x50, 0x00, 0x00, 0x00, 0xD4, 0xC3, 0xB2, 0xA1]
        );
    }

    #[test]
    fn empty_frame_rejected() {
        assert_eq!(decode(&[]), Err(WireError::Empty));
    }

    #[test]
    fn unknown_opcode_rejected() {
        assert_eq!(decode(&[0x7F]), Err(WireError::UnknownOpcode(0x7F)));
    }

    #[test]
    fn truncated_init_request_rejected() {
        let mut bytes = Message::DfuInitRequest {
            firmware_size: 64,
            firmware_sha256: [0; 32],
            app_data: vec![],
        }
        .encode();
        bytes.truncate(20);
        assert!(matches!(
            decode(&bytes),
            Err(WireError::Truncated {
                opcode: Opcode::DfuInitRequest,
                ..
            })
        ));
    }

    #[test]
    fn write_data_length_prefix_must_match() {
        // data_len says 4 but only 3 bytes follow
        let frame = [0x86, 0x04, 0xAA, 0xBB, 0xCC];
        assert_eq!(
            decode(&frame),
            Err(WireError::BadLengthPrefix {
                opcode: Opcode::DfuWriteDataEvent,
                declared: 4,
                got: 3,
            })
        );
    }

    #[test]
    fn trailing_bytes_rejected() {
        let frame = [0x8A, 0x01, 0x99];
        assert_eq!(
            decode(&frame),
            Err(WireError::Trailing {
                opcode: Opcode::DfuStateResponse,
                extra: 1,
            })
        );
    }

    #[test]
    fn odd_model_id_list_rejected() {
        let frame = [0x00, 0x01, 0x10, 0x13];
        assert_eq!(
            decode(&frame),
            Err(WireError::OddModelIdList {
                opcode: Opcode::InitDeviceEvent,
                len: 3,
            })
        );
    }

    #[test]
    fn invalid_status_byte_rejected() {
        let frame = [0x81, 0x02];
        assert!(matches!(
            decode(&frame),
            Err(WireError::InvalidField {
                field: "dfu status",
                value: 0x02,
                ..
            })
        ));
    }
}
