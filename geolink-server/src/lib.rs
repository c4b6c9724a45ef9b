//! Multi-protocol GPS/telematics ingestion gateway
//!
//! Accepts connections from field devices over TCP, UDP or HTTP, parses
//! each protocol's native wire format into normalized
//! [`Position`](geolink_types::Position) records, acknowledges devices on
//! the wire, and hands positions to a downstream pipeline.

pub mod config;
pub mod pipeline;
pub mod protocol;
pub mod server;
pub mod session;
pub mod util;

pub use crate::{
    config::GatewayConfig,
    pipeline::PositionPipeline,
    server::Gateway,
    session::{
        DeviceDirectory,
        InMemoryDirectory,
        SessionRegistry,
    },
};
