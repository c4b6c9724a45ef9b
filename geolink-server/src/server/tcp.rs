//! TCP transport
//!
//! One task per connection. The loop interleaves reads (with the
//! configured idle timeout) and outbound command frames; decoded replies
//! are flushed before positions are forwarded so the device always sees
//! its ack first.

use std::{
    sync::{
        Arc,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};

use bytes::{
    Bytes,
    BytesMut,
};
use geolink_types::DeviceId;
use tokio::{
    io::{
        AsyncReadExt,
        AsyncWriteExt,
    },
    net::{
        TcpListener,
        TcpStream,
        tcp::OwnedWriteHalf,
    },
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    config::ProtocolConfig,
    pipeline::PositionPipeline,
    protocol::{
        DecodeContext,
        Protocol,
    },
    server::{
        ConnectionError,
        ConnectionRegistry,
    },
    session::{
        Endpoint,
        SessionRegistry,
    },
};

const OUTBOUND_QUEUE_SIZE: usize = 16;
const READ_BUFFER_CAPACITY: usize = 4096;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

pub struct TcpServer {
    pub protocol: Arc<dyn Protocol>,
    pub config: ProtocolConfig,
    pub sessions: Arc<SessionRegistry>,
    pub pipeline: PositionPipeline,
    pub connections: Arc<ConnectionRegistry>,
    pub idle_timeout: Duration,
    pub shutdown: CancellationToken,
}

impl TcpServer {
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = listener.accept() => {
                    let (stream, address) = result?;
                    let endpoint = Endpoint::new(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed), address);

                    let connection = Connection {
                        protocol: Arc::clone(&self.protocol),
                        config: self.config.clone(),
                        sessions: Arc::clone(&self.sessions),
                        pipeline: self.pipeline.clone(),
                        connections: Arc::clone(&self.connections),
                        idle_timeout: self.idle_timeout,
                        shutdown: self.shutdown.clone(),
                    };

                    let span = tracing::info_span!("connection", protocol = self.protocol.name(), %address);
                    tokio::spawn(
                        async move {
                            tracing::debug!("new connection");
                            if let Err(error) = connection.run(stream, endpoint).await {
                                tracing::warn!(?error, "connection failed");
                            }
                            tracing::debug!("closing connection");
                        }
                        .instrument(span),
                    );
                }
            }
        }

        Ok(())
    }
}

struct Connection {
    protocol: Arc<dyn Protocol>,
    config: ProtocolConfig,
    sessions: Arc<SessionRegistry>,
    pipeline: PositionPipeline,
    connections: Arc<ConnectionRegistry>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
}

impl Connection {
    async fn run(self, stream: TcpStream, endpoint: Endpoint) -> Result<(), ConnectionError> {
        let (command_sender, command_receiver) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE_SIZE);
        let mut registered_device: Option<DeviceId> = None;

        let result = self
            .handle(stream, endpoint, &command_sender, command_receiver, &mut registered_device)
            .await;

        self.sessions.close_endpoint(endpoint);
        if let Some(device_id) = registered_device {
            self.connections.unregister(device_id, &command_sender);
        }

        result
    }

    async fn handle(
        &self,
        stream: TcpStream,
        endpoint: Endpoint,
        command_sender: &mpsc::Sender<Bytes>,
        mut command_receiver: mpsc::Receiver<Bytes>,
        registered_device: &mut Option<DeviceId>,
    ) -> Result<(), ConnectionError> {
        let mut frame_decoder = self.protocol.create_frame_decoder();
        let frame_encoder = self.protocol.create_frame_encoder();
        let mut decoder = self.protocol.create_decoder();

        let (mut read_half, mut write_half) = stream.into_split();
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_CAPACITY);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),

                command = command_receiver.recv() => {
                    // the sender side also lives in the connection registry,
                    // so the channel stays open for the connection lifetime
                    if let Some(frame) = command {
                        write_half.write_all(&frame).await?;
                        write_half.flush().await?;
                    }
                }

                result = tokio::time::timeout(self.idle_timeout, read_half.read_buf(&mut buffer)) => {
                    let Ok(result) = result else {
                        tracing::debug!("closing idle connection");
                        return Ok(());
                    };
                    if result? == 0 {
                        return Ok(());
                    }

                    self.drain_frames(
                        &mut *frame_decoder,
                        &*frame_encoder,
                        &mut *decoder,
                        &mut buffer,
                        endpoint,
                        &mut write_half,
                        command_sender,
                        registered_device,
                    )
                    .await?;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drain_frames(
        &self,
        frame_decoder: &mut dyn crate::protocol::FrameDecoder,
        frame_encoder: &dyn crate::protocol::FrameEncoder,
        decoder: &mut dyn crate::protocol::MessageDecoder,
        buffer: &mut BytesMut,
        endpoint: Endpoint,
        write_half: &mut OwnedWriteHalf,
        command_sender: &mpsc::Sender<Bytes>,
        registered_device: &mut Option<DeviceId>,
    ) -> Result<(), ConnectionError> {
        while let Some(frame) = frame_decoder.decode(buffer)? {
            let mut ctx = DecodeContext::new(&self.sessions, endpoint, &self.config);

            // errors never escape past a single message
            let positions = match decoder.decode(&mut ctx, frame) {
                Ok(positions) => positions,
                Err(error) => {
                    tracing::warn!(?error, "dropping undecodable message");
                    Vec::new()
                }
            };

            // replies queued before the failure point are still written
            for response in ctx.take_responses() {
                let mut out = BytesMut::new();
                frame_encoder.encode(&response, &mut out);
                write_half.write_all(&out).await?;
            }
            write_half.flush().await?;

            if registered_device.is_none() {
                if let Some(session) = self.sessions.device_session(endpoint, None) {
                    self.connections.register(
                        session.device_id(),
                        self.protocol.name(),
                        command_sender.clone(),
                    );
                    *registered_device = Some(session.device_id());
                }
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

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use geolink_types::Position;

    use super::*;
    use crate::{
        config::GatewayConfig,
        pipeline::PositionPipeline,
        protocol::huabao,
        session::InMemoryDirectory,
        util::xor_checksum,
    };

    const DEVICE_ID_BYTES: [u8; 6] = [0x01, 0x23, 0x45, 0x67, 0x89, 0x01];

    fn build_frame(msg_type: u16, index: u16, body: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(0x7e);
        buf.put_u16(msg_type);
        buf.put_u16(0);
        buf.put_slice(&DEVICE_ID_BYTES);
        buf.put_u16(index);
        buf.put_slice(body);
        let checksum = xor_checksum(&buf[1..]);
        buf.put_u8(checksum);
        buf.put_u8(0x7e);
        buf.to_vec()
    }

    #[tokio::test]
    async fn it_acks_a_register_and_forwards_location_reports() {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.add("012345678901", None);
        let sessions = Arc::new(SessionRegistry::new(directory, false));
        let (pipeline, mut positions) = PositionPipeline::new(16);
        let shutdown = CancellationToken::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let server = TcpServer {
            protocol: Arc::new(huabao::HuabaoProtocol),
            config: GatewayConfig::default().huabao,
            sessions,
            pipeline,
            connections: Arc::new(ConnectionRegistry::default()),
            idle_timeout: Duration::from_secs(10),
            shutdown: shutdown.clone(),
        };
        let server_task = tokio::spawn(server.serve(listener));

        let mut client = TcpStream::connect(address).await.unwrap();

        // register, expect the register response
        client
            .write_all(&build_frame(huabao::MSG_TERMINAL_REGISTER, 1, &[]))
            .await
            .unwrap();
        let mut reply = vec![0u8; 64];
        let n = client.read(&mut reply).await.unwrap();
        assert_eq!(&reply[1..3], &[0x81, 0x00]);
        assert_eq!(reply[n - 1], 0x7e);

        // heartbeat, expect the general response
        client
            .write_all(&build_frame(huabao::MSG_HEARTBEAT, 2, &[]))
            .await
            .unwrap();
        let n = client.read(&mut reply).await.unwrap();
        assert!(n > 0);
        assert_eq!(&reply[1..3], &[0x80, 0x01]);

        // location report: ack arrives and the position lands downstream
        let mut body = BytesMut::new();
        body.put_u32(0); // alarm
        body.put_u32(0x0000_0006); // status: valid, latitude negative
        body.put_u32(22_000_000);
        body.put_u32(114_000_000);
        body.put_i16(10);
        body.put_u16(50);
        body.put_u16(0);
        body.put_slice(&[0x24, 0x01, 0x15, 0x12, 0x00, 0x00]);
        client
            .write_all(&build_frame(huabao::MSG_LOCATION_REPORT, 3, &body))
            .await
            .unwrap();

        let n = client.read(&mut reply).await.unwrap();
        assert!(n > 0);
        assert_eq!(&reply[1..3], &[0x80, 0x01]);

        let position: Position = positions.recv().await.unwrap();
        assert!(position.valid());
        assert_eq!(position.latitude(), -22.0);
        assert_eq!(position.longitude(), 114.0);

        shutdown.cancel();
        let _ = server_task.await;
    }
}
