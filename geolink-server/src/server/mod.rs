//! Transport servers and outbound command routing
//!
//! One TCP listener per configured protocol, optionally a UDP socket for
//! datagram devices and an HTTP listener for OwnTracks. Each connection is
//! handled by its own task; decoding within a connection is strictly
//! serial so device reports stay ordered.

pub mod http;
pub mod tcp;
pub mod udp;

use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
    },
    time::Duration,
};

use bytes::{
    Bytes,
    BytesMut,
};
use geolink_types::{
    Command,
    DeviceId,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{
        GatewayConfig,
        ProtocolConfig,
    },
    pipeline::PositionPipeline,
    protocol::{
        CommandError,
        FrameError,
        Protocol,
        huabao::HuabaoProtocol,
        manpower::ManPowerProtocol,
        owntracks::OwnTracksState,
        tr900::Tr900Protocol,
    },
    session::{
        DeviceDirectory,
        SessionRegistry,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("i/o error")]
    Io(#[from] std::io::Error),
    #[error("device is not connected: {device_id}")]
    DeviceNotConnected { device_id: DeviceId },
    #[error("unknown device id: {device_id}")]
    UnknownDevice { device_id: DeviceId },
    #[error("protocol does not support commands: {protocol}")]
    CommandsNotSupported { protocol: String },
    #[error("command encoding failed")]
    Command(#[from] CommandError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("i/o error")]
    Io(#[from] std::io::Error),
    #[error("framing error")]
    Frame(#[from] FrameError),
}

/// Live connections, keyed by the device bound to them. Used to route
/// outbound commands to the right socket.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<DeviceId, ConnectionEntry>>,
}

#[derive(Debug)]
struct ConnectionEntry {
    protocol: &'static str,
    writer: mpsc::Sender<Bytes>,
}

impl ConnectionRegistry {
    pub fn register(&self, device_id: DeviceId, protocol: &'static str, writer: mpsc::Sender<Bytes>) {
        self.inner
            .lock()
            .expect("connection registry poisoned")
            .insert(device_id, ConnectionEntry { protocol, writer });
    }

    /// Removes the entry unless a newer connection already replaced it.
    pub fn unregister(&self, device_id: DeviceId, writer: &mpsc::Sender<Bytes>) {
        let mut inner = self.inner.lock().expect("connection registry poisoned");
        if let Some(entry) = inner.get(&device_id) {
            if entry.writer.same_channel(writer) {
                inner.remove(&device_id);
            }
        }
    }

    fn entry(&self, device_id: DeviceId) -> Option<(&'static str, mpsc::Sender<Bytes>)> {
        self.inner
            .lock()
            .expect("connection registry poisoned")
            .get(&device_id)
            .map(|entry| (entry.protocol, entry.writer.clone()))
    }
}

/// The assembled gateway: session registry, pipeline, listeners and the
/// command path.
pub struct Gateway {
    config: GatewayConfig,
    sessions: Arc<SessionRegistry>,
    pipeline: PositionPipeline,
    connections: Arc<ConnectionRegistry>,
    protocols: Vec<(Arc<dyn Protocol>, ProtocolConfig)>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        directory: Arc<dyn DeviceDirectory>,
        pipeline: PositionPipeline,
    ) -> Self {
        let sessions = Arc::new(SessionRegistry::new(directory, config.auto_register));
        let protocols: Vec<(Arc<dyn Protocol>, ProtocolConfig)> = vec![
            (Arc::new(HuabaoProtocol), config.huabao.clone()),
            (Arc::new(Tr900Protocol), config.tr900.clone()),
            (Arc::new(ManPowerProtocol), config.manpower.clone()),
        ];

        Self {
            config,
            sessions,
            pipeline,
            connections: Arc::new(ConnectionRegistry::default()),
            protocols,
            shutdown: CancellationToken::new(),
        }
    }

    /// Provide a [`CancellationToken`] with which the gateway (and all
    /// device connections) can be shut down.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.config.idle_timeout)
    }

    /// Binds every configured listener and serves until shutdown.
    pub async fn serve(&self) -> Result<(), GatewayError> {
        let mut tasks = Vec::new();

        for (protocol, protocol_config) in &self.protocols {
            if let Some(address) = protocol_config.address {
                let listener = tokio::net::TcpListener::bind(address).await?;
                tracing::info!(protocol = protocol.name(), %address, "listening (tcp)");
                let server = tcp::TcpServer {
                    protocol: Arc::clone(protocol),
                    config: protocol_config.clone(),
                    sessions: Arc::clone(&self.sessions),
                    pipeline: self.pipeline.clone(),
                    connections: Arc::clone(&self.connections),
                    idle_timeout: self.idle_timeout(),
                    shutdown: self.shutdown.clone(),
                };
                tasks.push(tokio::spawn(async move {
                    if let Err(error) = server.serve(listener).await {
                        tracing::error!(?error, "tcp server failed");
                    }
                }));
            }

            if let Some(address) = protocol_config.udp_address {
                let socket = tokio::net::UdpSocket::bind(address).await?;
                tracing::info!(protocol = protocol.name(), %address, "listening (udp)");
                let server = udp::UdpServer {
                    protocol: Arc::clone(protocol),
                    config: protocol_config.clone(),
                    sessions: Arc::clone(&self.sessions),
                    pipeline: self.pipeline.clone(),
                    shutdown: self.shutdown.clone(),
                };
                tasks.push(tokio::spawn(async move {
                    if let Err(error) = server.serve(socket).await {
                        tracing::error!(?error, "udp server failed");
                    }
                }));
            }
        }

        if let Some(address) = self.config.owntracks.address {
            let listener = tokio::net::TcpListener::bind(address).await?;
            tracing::info!(protocol = "owntracks", %address, "listening (http)");
            let state = OwnTracksState {
                sessions: Arc::clone(&self.sessions),
                pipeline: self.pipeline.clone(),
            };
            let shutdown = self.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(error) = http::serve(listener, state, shutdown).await {
                    tracing::error!(?error, "http server failed");
                }
            }));
        }

        for task in tasks {
            let _ = task.await;
        }

        Ok(())
    }

    /// Encodes a command for the device's protocol and writes it to the
    /// connection currently bound to the device.
    pub async fn send_command(&self, command: Command) -> Result<(), GatewayError> {
        let device_id = command.device_id();

        let (protocol_name, writer) =
            self.connections
                .entry(device_id)
                .ok_or(GatewayError::DeviceNotConnected { device_id })?;

        let info = self
            .sessions
            .directory()
            .lookup_by_id(device_id)
            .ok_or(GatewayError::UnknownDevice { device_id })?;

        let (protocol, protocol_config) = self
            .protocols
            .iter()
            .find(|(protocol, _)| protocol.name() == protocol_name)
            .ok_or_else(|| {
                GatewayError::CommandsNotSupported {
                    protocol: protocol_name.to_owned(),
                }
            })?;

        let encoder = protocol.create_command_encoder().ok_or_else(|| {
            GatewayError::CommandsNotSupported {
                protocol: protocol_name.to_owned(),
            }
        })?;

        let payload = encoder.encode(&info, protocol_config, &command)?;

        let mut framed = BytesMut::new();
        protocol.create_frame_encoder().encode(&payload, &mut framed);

        writer
            .send(framed.freeze())
            .await
            .map_err(|_| GatewayError::DeviceNotConnected { device_id })?;

        Ok(())
    }
}
