//! Outbound device commands
//!
//! A [`Command`] is the abstract request; each protocol encoder turns it
//! into wire bytes for its device family.

use std::collections::BTreeMap;

use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    DeviceId,
    position::AttributeValue,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandType {
    Custom,
    RebootDevice,
    PositionPeriodic,
    AlarmArm,
    AlarmDisarm,
    EngineStop,
    EngineResume,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Command {
    device_id: DeviceId,
    command_type: CommandType,
    attributes: BTreeMap<String, AttributeValue>,
}

impl Command {
    /// Reporting interval in seconds for [`CommandType::PositionPeriodic`].
    pub const KEY_FREQUENCY: &'static str = "frequency";
    /// Raw payload for [`CommandType::Custom`].
    pub const KEY_DATA: &'static str = "data";

    pub fn new(device_id: DeviceId, command_type: CommandType) -> Self {
        Self {
            device_id,
            command_type,
            attributes: BTreeMap::new(),
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn command_type(&self) -> CommandType {
        self.command_type
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(AttributeValue::as_str)
    }

    pub fn get_integer(&self, key: &str) -> Option<i64> {
        self.attributes.get(key).and_then(AttributeValue::as_i64)
    }
}
