//! Serial link: outbound frame sink, byte framing, and the read loop.
//!
//! Framing on the wire is `AA 55 | len:u16 LE | payload | crc:u16 LE`,
//! where the CRC-16 (X.25) covers the payload only. The payload is one
//! protocol frame (opcode + body). The decoder is incremental so the
//! blocking read loop can feed it whatever chunk sizes the port
//! delivers; a bad CRC or an oversized length drops the frame and
//! resyncs on the next preamble.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crc::{Crc, CRC_16_IBM_SDLC};
use otau_wire::Message;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, trace, warn};

pub const FRAME_PREAMBLE: [u8; 2] = [0xAA, 0x55];

/// Upper bound on a framed payload; nothing in the protocol comes close.
const MAX_FRAME_LEN: usize = 4096;

const FRAME_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

const READ_TIMEOUT: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        source: serialport::Error,
    },

    #[error("failed to clone serial port handle: {0}")]
    Clone(#[from] serialport::Error),
}

/// Outbound half of the link. Sends are fire-and-forget: serialisation
/// cannot fail and write errors are logged, never surfaced (the peer's
/// retry logic owns recovery).
pub trait FrameSink: Send + Sync {
    fn send(&self, msg: &Message);
}

/// Wrap one protocol frame in link framing.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 6);
    out.extend_from_slice(&FRAME_PREAMBLE);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&FRAME_CRC.checksum(payload).to_le_bytes());
    out
}

enum DecodeState {
    Preamble0,
    Preamble1,
    LenLo,
    LenHi { lo: u8 },
    Body { expected: usize },
    CrcLo,
    CrcHi { lo: u8 },
}

/// Incremental framing decoder.
pub struct FrameDecoder {
    state: DecodeState,
    body: Vec<u8>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Preamble0,
            body: Vec::new(),
        }
    }

    /// Feed one byte; returns a complete, CRC-checked protocol frame when
    /// one closes.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        match self.state {
            DecodeState::Preamble0 => {
                if byte == FRAME_PREAMBLE[0] {
                    self.state = DecodeState::Preamble1;
                }
            }
            DecodeState::Preamble1 => {
                self.state = if byte == FRAME_PREAMBLE[1] {
                    DecodeState::LenLo
                } else if byte == FRAME_PREAMBLE[0] {
                    // AA AA 55 ... still syncs
                    DecodeState::Preamble1
                } else {
                    DecodeState::Preamble0
                };
            }
            DecodeState::LenLo => self.state = DecodeState::LenHi { lo: byte },
            DecodeState::LenHi { lo } => {
                let expected = u16::from_le_bytes([lo, byte]) as usize;
                if expected == 0 || expected > MAX_FRAME_LEN {
                    warn!(expected, "implausible frame length, resyncing");
                    self.state = DecodeState::Preamble0;
                } else {
                    self.body.clear();
                    self.state = DecodeState::Body { expected };
                }
            }
            DecodeState::Body { expected } => {
                self.body.push(byte);
                if self.body.len() == expected {
                    self.state = DecodeState::CrcLo;
                }
            }
            DecodeState::CrcLo => self.state = DecodeState::CrcHi { lo: byte },
            DecodeState::CrcHi { lo } => {
                self.state = DecodeState::Preamble0;
                let received = u16::from_le_bytes([lo, byte]);
                let computed = FRAME_CRC.checksum(&self.body);
                if received == computed {
                    return Some(std::mem::take(&mut self.body));
                }
                warn!(
                    received = format!("0x{received:04X}"),
                    computed = format!("0x{computed:04X}"),
                    "frame CRC mismatch, dropping frame"
                );
            }
        }
        None
    }
}

/// Writer half of the serial link.
pub struct SerialSender {
    port: Mutex<Box<dyn serialport::SerialPort>>,
}

impl FrameSink for SerialSender {
    fn send(&self, msg: &Message) {
        let bytes = frame(&msg.encode());
        trace!(opcode = ?msg.opcode(), len = bytes.len(), "sending frame");

        let mut port = self.port.lock();
        if let Err(e) = port.write_all(&bytes).and_then(|()| port.flush()) {
            error!(opcode = ?msg.opcode(), error = %e, "failed to write frame");
        }
    }
}

/// Reader half of the serial link.
pub struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
    decoder: FrameDecoder,
}

impl SerialLink {
    /// Open `port_name` and split it into a reader and a shared writer.
    pub fn open(port_name: &str, baud_rate: u32) -> Result<(Self, Arc<SerialSender>), LinkError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|source| LinkError::Open {
                port: port_name.to_string(),
                source,
            })?;
        let writer = port.try_clone()?;

        debug!(port = port_name, baud_rate, "serial link open");
        Ok((
            Self {
                port,
                decoder: FrameDecoder::new(),
            },
            Arc::new(SerialSender {
                port: Mutex::new(writer),
            }),
        ))
    }

    /// Blocking read loop: feed bytes to the decoder and hand complete
    /// frames to `on_frame` until `running` clears. Everything the core
    /// does happens inside `on_frame`, on this one thread.
    pub fn run(&mut self, running: &AtomicBool, mut on_frame: impl FnMut(&[u8])) {
        let mut buf = [0u8; 512];
        while running.load(Ordering::SeqCst) {
            match self.port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    for &byte in &buf[..n] {
                        if let Some(frame) = self.decoder.push(byte) {
                            on_frame(&frame);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(error = %e, "serial read error");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }
}
