//! Protocol implementations
//!
//! Every protocol is a triple of capabilities: a frame codec that carves
//! the byte stream into messages, a message decoder that turns one framed
//! message into positions (and queued acknowledgements), and optionally a
//! command encoder for the outbound direction. The transport layer only
//! talks to these traits.

pub mod huabao;
pub mod manpower;
pub mod owntracks;
pub mod tr900;

use bytes::{
    Bytes,
    BytesMut,
    TryGetError,
};
use geolink_types::{
    Command,
    CommandType,
    Position,
    position::CoordinateError,
};

use crate::{
    config::ProtocolConfig,
    session::{
        DeviceInfo,
        DeviceSession,
        Endpoint,
        SessionRegistry,
    },
    util::InvalidDateTime,
};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("no frame delimiter within {length} bytes")]
    FrameTooLong { length: usize },
    #[error("line exceeds {max_length} bytes")]
    LineTooLong { max_length: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated message")]
    Truncated(#[from] TryGetError),
    #[error(transparent)]
    Coordinate(#[from] CoordinateError),
    #[error(transparent)]
    InvalidDateTime(#[from] InvalidDateTime),
    #[error("invalid sentence")]
    Tr900(#[from] tr900::SentenceError),
    #[error("invalid sentence")]
    ManPower(#[from] manpower::SentenceError),
    #[error("invalid json payload")]
    Json(#[from] serde_json::Error),
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("unsupported command type: {command_type:?}")]
    Unsupported { command_type: CommandType },
    #[error("invalid command payload: {reason}")]
    InvalidPayload { reason: String },
}

/// Extracts one complete message per call from a continuous byte stream.
/// `Ok(None)` means more data is needed.
pub trait FrameDecoder: Send {
    fn decode(&mut self, buffer: &mut BytesMut) -> Result<Option<Bytes>, FrameError>;
}

/// Inverse of [`FrameDecoder`]: escapes an outbound message for the wire.
pub trait FrameEncoder: Send + Sync {
    fn encode(&self, frame: &[u8], out: &mut BytesMut);
}

/// Interprets one framed message. Acknowledgements go through the context
/// so the transport writes them before any position is forwarded.
pub trait MessageDecoder: Send {
    fn decode(&mut self, ctx: &mut DecodeContext<'_>, frame: Bytes) -> Result<Vec<Position>, DecodeError>;
}

/// Turns an abstract command into wire bytes for one device.
pub trait CommandEncoder: Send + Sync {
    fn encode(
        &self,
        device: &DeviceInfo,
        config: &ProtocolConfig,
        command: &Command,
    ) -> Result<Bytes, CommandError>;
}

/// A protocol as the transport layer sees it.
pub trait Protocol: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn create_frame_decoder(&self) -> Box<dyn FrameDecoder>;

    fn create_frame_encoder(&self) -> Box<dyn FrameEncoder>;

    fn create_decoder(&self) -> Box<dyn MessageDecoder>;

    fn create_command_encoder(&self) -> Option<Box<dyn CommandEncoder>> {
        None
    }
}

/// Per-message decoder environment: session resolution for this endpoint
/// plus the outbound reply queue.
pub struct DecodeContext<'a> {
    sessions: &'a SessionRegistry,
    endpoint: Endpoint,
    config: &'a ProtocolConfig,
    responses: Vec<Bytes>,
}

impl<'a> DecodeContext<'a> {
    pub fn new(sessions: &'a SessionRegistry, endpoint: Endpoint, config: &'a ProtocolConfig) -> Self {
        Self {
            sessions,
            endpoint,
            config,
            responses: Vec::new(),
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        self.config
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn device_session(&self, unique_id: Option<&str>) -> Option<DeviceSession> {
        self.sessions.device_session(self.endpoint, unique_id)
    }

    /// Queues a reply frame. The transport writes queued replies before it
    /// forwards the decoded positions downstream.
    pub fn send(&mut self, frame: Bytes) {
        self.responses.push(frame);
    }

    pub fn take_responses(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.responses)
    }
}

const MAX_LINE_LENGTH: usize = 1024;

/// Frame decoder for newline-delimited text protocols. Splits at `\r` or
/// `\n` and skips the empty lines that `\r\n` produces.
#[derive(Debug)]
pub struct LineFrameDecoder {
    max_length: usize,
}

impl LineFrameDecoder {
    pub fn new() -> Self {
        Self {
            max_length: MAX_LINE_LENGTH,
        }
    }
}

impl Default for LineFrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder for LineFrameDecoder {
    fn decode(&mut self, buffer: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        loop {
            let Some(index) = buffer
                .iter()
                .position(|byte| *byte == b'\r' || *byte == b'\n')
            else {
                if buffer.len() > self.max_length {
                    return Err(FrameError::LineTooLong {
                        max_length: self.max_length,
                    });
                }
                return Ok(None);
            };

            let line = buffer.split_to(index + 1);
            if index > 0 {
                return Ok(Some(Bytes::copy_from_slice(&line[..index])));
            }
        }
    }
}

/// Frame encoder for protocols whose replies are plain text already.
#[derive(Debug, Default)]
pub struct IdentityFrameEncoder;

impl FrameEncoder for IdentityFrameEncoder {
    fn encode(&self, frame: &[u8], out: &mut BytesMut) {
        out.extend_from_slice(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_splits_lines_and_skips_empty_ones() {
        let mut decoder = LineFrameDecoder::new();
        let mut buffer = BytesMut::from(&b"first\r\nsecond\rthird"[..]);

        assert_eq!(
            decoder.decode(&mut buffer).unwrap().as_deref(),
            Some(&b"first"[..])
        );
        assert_eq!(
            decoder.decode(&mut buffer).unwrap().as_deref(),
            Some(&b"second"[..])
        );
        // "third" has no terminator yet
        assert_eq!(decoder.decode(&mut buffer).unwrap(), None);

        buffer.extend_from_slice(b"\n");
        assert_eq!(
            decoder.decode(&mut buffer).unwrap().as_deref(),
            Some(&b"third"[..])
        );
    }
}
