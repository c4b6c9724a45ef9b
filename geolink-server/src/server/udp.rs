//! UDP transport
//!
//! One logical message per datagram. The datagram still goes through the
//! frame decoder (devices escape their payloads the same way on both
//! transports); replies are sent back to the datagram's source address.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ProtocolConfig,
    pipeline::PositionPipeline,
    protocol::{
        DecodeContext,
        Protocol,
    },
    session::{
        Endpoint,
        SessionRegistry,
    },
};

const DATAGRAM_BUFFER_SIZE: usize = 4096;

pub struct UdpServer {
    pub protocol: Arc<dyn Protocol>,
    pub config: ProtocolConfig,
    pub sessions: Arc<SessionRegistry>,
    pub pipeline: PositionPipeline,
    pub shutdown: CancellationToken,
}

impl UdpServer {
    pub async fn serve(self, socket: UdpSocket) -> std::io::Result<()> {
        let mut frame_decoder = self.protocol.create_frame_decoder();
        let frame_encoder = self.protocol.create_frame_encoder();
        let mut decoder = self.protocol.create_decoder();

        let mut datagram = vec![0u8; DATAGRAM_BUFFER_SIZE];

        loop {
            let (length, address) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = socket.recv_from(&mut datagram) => result?,
            };

            // datagram sockets share one logical channel
            let endpoint = Endpoint::new(0, address);

            let mut buffer = BytesMut::from(&datagram[..length]);
            let frame = match frame_decoder.decode(&mut buffer) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::debug!(%address, "incomplete datagram");
                    continue;
                }
                Err(error) => {
                    tracing::warn!(%address, ?error, "dropping malformed datagram");
                    continue;
                }
            };

            let mut ctx = DecodeContext::new(&self.sessions, endpoint, &self.config);
            let positions = match decoder.decode(&mut ctx, frame) {
                Ok(positions) => positions,
                Err(error) => {
                    tracing::warn!(%address, ?error, "dropping undecodable datagram");
                    Vec::new()
                }
            };

            for response in ctx.take_responses() {
                let mut out = BytesMut::new();
                frame_encoder.encode(&response, &mut out);
                socket.send_to(&out, address).await?;
            }

            for mut position in positions {
                if self.config.ignore_fix_time {
                    position.set_fix_time(position.server_time());
                }
                if !position.outdated() {
                    if let Some(session) = self.sessions.device_session(endpoint, None) {
                        session.store_last_location(&position);
                    }
                }
                self.pipeline.forward(position).await;
            }
        }

        Ok(())
    }
}
