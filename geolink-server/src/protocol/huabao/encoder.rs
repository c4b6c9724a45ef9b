//! Huabao command encoder
//!
//! Serializes abstract commands into the same envelope the decoder reads.
//! Several commands are parameter writes (0x0310); engine control depends
//! on the alternative-protocol flag and the device model.

use bytes::{
    BufMut,
    Bytes,
    BytesMut,
};
use chrono::Utc;
use geolink_types::{
    Command,
    CommandType,
    position::AttributeValue,
};

use crate::{
    config::ProtocolConfig,
    protocol::{
        CommandEncoder,
        CommandError,
        huabao,
    },
    session::DeviceInfo,
    util::parse_hex,
};

#[derive(Debug, Default)]
pub struct HuabaoCommandEncoder;

impl CommandEncoder for HuabaoCommandEncoder {
    fn encode(
        &self,
        device: &DeviceInfo,
        config: &ProtocolConfig,
        command: &Command,
    ) -> Result<Bytes, CommandError> {
        // a per-device attribute overrides the protocol-wide setting
        let alternative = device
            .attributes
            .get("alternative")
            .and_then(AttributeValue::as_bool)
            .unwrap_or(config.alternative);

        let id = parse_hex(&device.unique_id).map_err(|_| {
            CommandError::InvalidPayload {
                reason: format!("unique id is not hex: {}", device.unique_id),
            }
        })?;

        let model = device.model.as_deref();
        let mut data = BytesMut::new();

        match command.command_type() {
            CommandType::Custom => {
                let payload =
                    command
                        .get_string(Command::KEY_DATA)
                        .ok_or(CommandError::InvalidPayload {
                            reason: "custom command without data".to_owned(),
                        })?;

                if matches!(model, Some("AL300" | "GL100" | "VL300")) {
                    data.put_u8(1); // parameter count
                    data.put_u32(0xf030); // AT passthrough parameter
                    data.put_u8(payload.len() as u8);
                    data.put_slice(payload.as_bytes());
                    Ok(huabao::format_message(
                        0x7e,
                        huabao::MSG_CONFIGURATION_PARAMETERS,
                        &id,
                        false,
                        &data,
                    ))
                }
                else if model == Some("BSJ") {
                    data.put_u8(1); // flag
                    data.put_slice(payload.as_bytes());
                    Ok(huabao::format_message(
                        0x7e,
                        huabao::MSG_SEND_TEXT_MESSAGE,
                        &id,
                        false,
                        &data,
                    ))
                }
                else {
                    // raw hex passthrough, sent without an envelope
                    let raw = parse_hex(payload).map_err(|_| {
                        CommandError::InvalidPayload {
                            reason: format!("custom data is not hex: {payload}"),
                        }
                    })?;
                    Ok(Bytes::from(raw))
                }
            }

            CommandType::RebootDevice => {
                data.put_u8(1); // parameter count
                data.put_u8(0x23); // parameter id
                data.put_u8(1); // value length
                data.put_u8(0x03); // reboot
                Ok(huabao::format_message(
                    0x7e,
                    huabao::MSG_PARAMETER_SETTING,
                    &id,
                    false,
                    &data,
                ))
            }

            CommandType::PositionPeriodic => {
                let frequency = command.get_integer(Command::KEY_FREQUENCY).unwrap_or(0);
                data.put_u8(1); // parameter count
                data.put_u8(0x06); // parameter id
                data.put_u8(4); // value length
                data.put_u32(frequency as u32);
                Ok(huabao::format_message(
                    0x7e,
                    huabao::MSG_PARAMETER_SETTING,
                    &id,
                    false,
                    &data,
                ))
            }

            CommandType::AlarmArm | CommandType::AlarmDisarm => {
                let username = "user";
                data.put_u8(1); // parameter count
                data.put_u8(0x24); // parameter id
                data.put_u8(1 + username.len() as u8);
                data.put_u8(if command.command_type() == CommandType::AlarmArm {
                    0x01
                }
                else {
                    0x00
                });
                data.put_slice(username.as_bytes());
                Ok(huabao::format_message(
                    0x7e,
                    huabao::MSG_PARAMETER_SETTING,
                    &id,
                    false,
                    &data,
                ))
            }

            CommandType::EngineStop | CommandType::EngineResume => {
                let stop = command.command_type() == CommandType::EngineStop;

                if alternative {
                    let time = Utc::now().format("%y%m%d%H%M%S").to_string();
                    let time = parse_hex(&time).expect("bcd timestamp digits are valid hex");
                    data.put_u8(if stop { 0x01 } else { 0x00 });
                    data.put_slice(&time);
                    Ok(huabao::format_message(
                        0x7e,
                        huabao::MSG_OIL_CONTROL,
                        &id,
                        false,
                        &data,
                    ))
                }
                else {
                    if model == Some("VL300") {
                        data.put_slice(if stop { b"#0;1" } else { b"#0;0" });
                    }
                    else {
                        data.put_u8(if stop { 0xf0 } else { 0xf1 });
                    }
                    Ok(huabao::format_message(
                        0x7e,
                        huabao::MSG_TERMINAL_CONTROL,
                        &id,
                        false,
                        &data,
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn device(model: Option<&str>) -> DeviceInfo {
        DeviceInfo {
            id: 1,
            unique_id: "012345678901".to_owned(),
            model: model.map(str::to_owned),
            attributes: BTreeMap::new(),
        }
    }

    fn encode(command: Command, model: Option<&str>, alternative: bool) -> Bytes {
        let config = ProtocolConfig {
            alternative,
            ..ProtocolConfig::default()
        };
        HuabaoCommandEncoder
            .encode(&device(model), &config, &command)
            .unwrap()
    }

    #[test]
    fn it_encodes_engine_stop() {
        let message = encode(Command::new(1, CommandType::EngineStop), None, false);

        assert_eq!(
            &message[..],
            &[
                0x7e, 0x81, 0x05, 0x00, 0x01, 0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x00, 0x00,
                0xf0, 0xfd, 0x7e,
            ],
        );
    }

    #[test]
    fn it_encodes_engine_stop_for_vl300_as_text() {
        let message = encode(Command::new(1, CommandType::EngineStop), Some("VL300"), false);

        assert_eq!(&message[1..3], &[0x81, 0x05]);
        assert_eq!(&message[13..17], b"#0;1");
    }

    #[test]
    fn it_encodes_engine_control_on_the_oil_circuit_when_alternative() {
        let message = encode(Command::new(1, CommandType::EngineResume), None, true);

        assert_eq!(&message[1..3], &[0xa0, 0x06]);
        // resume flag plus a 6-byte bcd timestamp
        assert_eq!(u16::from_be_bytes([message[3], message[4]]), 7);
        assert_eq!(message[13], 0x00);
    }

    #[test]
    fn it_encodes_reboot_as_a_parameter_write() {
        let message = encode(Command::new(1, CommandType::RebootDevice), None, false);

        assert_eq!(&message[1..3], &[0x03, 0x10]);
        assert_eq!(&message[13..17], &[0x01, 0x23, 0x01, 0x03]);
    }

    #[test]
    fn it_encodes_the_reporting_interval() {
        let command =
            Command::new(1, CommandType::PositionPeriodic).with(Command::KEY_FREQUENCY, 60);
        let message = encode(command, None, false);

        assert_eq!(&message[1..3], &[0x03, 0x10]);
        assert_eq!(&message[13..20], &[0x01, 0x06, 0x04, 0x00, 0x00, 0x00, 0x3c]);
    }

    #[test]
    fn it_passes_custom_hex_through_raw() {
        let command = Command::new(1, CommandType::Custom).with(Command::KEY_DATA, "abcd");
        let message = encode(command, None, false);

        assert_eq!(&message[..], &[0xab, 0xcd]);
    }

    #[test]
    fn it_wraps_custom_at_commands_for_supported_models() {
        let command = Command::new(1, CommandType::Custom).with(Command::KEY_DATA, "AT+TEST");
        let message = encode(command, Some("AL300"), false);

        assert_eq!(&message[1..3], &[0x81, 0x03]);
        // count, 4-byte parameter id, length, payload
        assert_eq!(&message[13..19], &[0x01, 0x00, 0x00, 0xf0, 0x30, 0x07]);
        assert_eq!(&message[19..26], b"AT+TEST");
    }
}
