pub mod command;
pub mod geo;
pub mod network;
pub mod position;

pub use crate::{
    command::{
        Command,
        CommandType,
    },
    network::{
        CellTower,
        Network,
        WifiAccessPoint,
    },
    position::{
        AttributeValue,
        CoordinateError,
        Position,
    },
};

/// Internal numeric id assigned to a device by the session registry.
pub type DeviceId = u64;
