//! Huabao message decoder
//!
//! Interprets one unescaped frame: envelope, checksum, dispatch on the
//! message type, and the TLV-rich location report. Acknowledgements are
//! queued on the decode context so the transport writes them before any
//! position is forwarded downstream.

use std::fmt::Write as _;

use bytes::{
    Buf,
    BufMut,
    Bytes,
    BytesMut,
    TryGetError,
};
use chrono::{
    DateTime,
    Datelike,
    FixedOffset,
    Timelike,
    Utc,
};
use geolink_types::{
    CellTower,
    Network,
    Position,
    WifiAccessPoint,
};

use crate::{
    protocol::{
        DecodeContext,
        DecodeError,
        MessageDecoder,
        huabao::{
            self,
            frame::DELIMITER_ALTERNATIVE,
            frame::DELIMITER_STANDARD,
        },
    },
    session::{
        DeviceSession,
        default_timezone,
    },
    util::{
        BufReadBytesExt,
        DateBuilder,
        bit_check,
        bits_to,
        hex_dump,
        knots_from_kph,
        luhn_check_digit,
        read_bcd,
        read_string,
        signed_magnitude_word,
        utc_offset,
        xor_checksum,
    },
};

#[derive(Debug)]
pub struct HuabaoDecoder {
    delimiter: u8,
    checksum_warned: bool,
}

impl HuabaoDecoder {
    pub fn new() -> Self {
        Self {
            delimiter: DELIMITER_STANDARD,
            checksum_warned: false,
        }
    }

    pub fn is_alternative(&self) -> bool {
        self.delimiter == DELIMITER_ALTERNATIVE
    }
}

impl Default for HuabaoDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageDecoder for HuabaoDecoder {
    fn decode(&mut self, ctx: &mut DecodeContext<'_>, frame: Bytes) -> Result<Vec<Position>, DecodeError> {
        if frame.first() == Some(&b'(') {
            return self.decode_sentence(ctx, &frame);
        }

        if frame.len() < 4 {
            return Err(DecodeError::InvalidMessage {
                reason: format!("frame too short: {} bytes", frame.len()),
            });
        }

        let expected = xor_checksum(&frame[1..frame.len() - 2]);
        let actual = frame[frame.len() - 2];
        if expected != actual {
            if !self.checksum_warned {
                tracing::warn!(expected, actual, "dropping frame with bad checksum");
                self.checksum_warned = true;
            }
            return Ok(Vec::new());
        }

        let mut buf = frame;
        self.delimiter = buf.try_get_u8()?;
        let msg_type = buf.try_get_u16()?;
        let attribute = buf.try_get_u16()?;

        let id_length = if self.is_alternative() { 7 } else { 6 };
        if buf.remaining() < id_length {
            return Err(DecodeError::Truncated(TryGetError {
                requested: id_length,
                available: buf.remaining(),
            }));
        }
        let id = buf.split_to(id_length);

        let index = if msg_type == huabao::MSG_LOCATION_REPORT_2
            || msg_type == huabao::MSG_LOCATION_REPORT_BLIND
        {
            u16::from(buf.try_get_u8()?)
        }
        else {
            buf.try_get_u16()?
        };

        let unique_id = decode_id(&id);
        let Some(session) = ctx.device_session(Some(&unique_id)) else {
            return Ok(Vec::new());
        };

        if !session.has_timezone() {
            session.set_timezone(ctx.config().timezone().unwrap_or_else(default_timezone));
        }

        match msg_type {
            huabao::MSG_TERMINAL_REGISTER => {
                let mut body = BytesMut::new();
                body.put_u16(index);
                body.put_u8(huabao::RESULT_SUCCESS);
                body.put_slice(unique_id.as_bytes());
                ctx.send(huabao::format_message(
                    self.delimiter,
                    huabao::MSG_TERMINAL_REGISTER_RESPONSE,
                    &id,
                    false,
                    &body,
                ));
                Ok(Vec::new())
            }

            huabao::MSG_REPORT_TEXT_MESSAGE => {
                self.send_general_response(ctx, &id, msg_type, index);

                let mut position = Position::new(huabao::PROTOCOL_NAME);
                position.set_device_id(session.device_id());
                session.get_last_location(&mut position, None);

                buf.try_get_u8()?; // encoding
                let length = buf.remaining().saturating_sub(2);
                position.set(Position::KEY_RESULT, read_string(&mut buf, length)?);

                Ok(vec![position])
            }

            huabao::MSG_TERMINAL_AUTH
            | huabao::MSG_HEARTBEAT
            | huabao::MSG_HEARTBEAT_2
            | huabao::MSG_PHOTO => {
                self.send_general_response(ctx, &id, msg_type, index);
                Ok(Vec::new())
            }

            huabao::MSG_LOCATION_REPORT => {
                self.send_general_response(ctx, &id, msg_type, index);
                Ok(vec![self.decode_location(&session, &mut buf)?])
            }

            huabao::MSG_LOCATION_REPORT_2 | huabao::MSG_LOCATION_REPORT_BLIND => {
                if bit_check(attribute.into(), 15) {
                    self.send_general_response_2(ctx, &id, msg_type);
                }
                Ok(vec![self.decode_location2(&session, &mut buf, msg_type)?])
            }

            huabao::MSG_LOCATION_BATCH | huabao::MSG_LOCATION_BATCH_2 => {
                self.send_general_response(ctx, &id, msg_type, index);
                self.decode_location_batch(&session, &mut buf, msg_type)
            }

            huabao::MSG_TIME_SYNC_REQUEST => {
                // deployed terminals expect the register response type here,
                // not MSG_TIME_SYNC_RESPONSE
                let now = Utc::now();
                let mut body = BytesMut::new();
                body.put_u16(now.year() as u16);
                body.put_u8(now.month() as u8);
                body.put_u8(now.day() as u8);
                body.put_u8(now.hour() as u8);
                body.put_u8(now.minute() as u8);
                body.put_u8(now.second() as u8);
                ctx.send(huabao::format_message(
                    self.delimiter,
                    huabao::MSG_TERMINAL_REGISTER_RESPONSE,
                    &id,
                    false,
                    &body,
                ));
                Ok(Vec::new())
            }

            huabao::MSG_ACCELERATION => {
                let mut position = Position::new(huabao::PROTOCOL_NAME);
                position.set_device_id(session.device_id());
                session.get_last_location(&mut position, None);

                let mut data = String::from("[");
                while buf.remaining() > 2 {
                    if buf.remaining() < 12 {
                        return Err(DecodeError::Truncated(TryGetError {
                            requested: 12,
                            available: buf.remaining(),
                        }));
                    }
                    buf.advance(6); // time
                    if data.len() > 1 {
                        data.push(',');
                    }
                    let x = signed_magnitude_word(buf.try_get_u16()?);
                    let y = signed_magnitude_word(buf.try_get_u16()?);
                    let z = signed_magnitude_word(buf.try_get_u16()?);
                    let _ = write!(data, "[{x},{y},{z}]");
                }
                data.push(']');

                position.set(Position::KEY_G_SENSOR, data);
                Ok(vec![position])
            }

            huabao::MSG_TRANSPARENT => {
                self.send_general_response(ctx, &id, msg_type, index);
                self.decode_transparent(&session, &mut buf)
            }

            huabao::MSG_COMMAND_RESPONSE => {
                let mut position = Position::new(huabao::PROTOCOL_NAME);
                position.set_device_id(session.device_id());
                session.get_last_location(&mut position, None);

                let length = buf.try_get_u32()? as usize;
                position.set(Position::KEY_RESULT, read_string(&mut buf, length)?);

                Ok(vec![position])
            }

            _ => {
                tracing::debug!(msg_type, "unknown message type");
                Ok(Vec::new())
            }
        }
    }
}

impl HuabaoDecoder {
    /// Parenthesized ASCII sentences share the binary port. `BASE,2`
    /// requests are answered with the current UTC time spliced into the
    /// sentence; everything else is recorded as a command result.
    fn decode_sentence(
        &mut self,
        ctx: &mut DecodeContext<'_>,
        frame: &Bytes,
    ) -> Result<Vec<Position>, DecodeError> {
        let sentence = String::from_utf8_lossy(frame).into_owned();

        if sentence.contains("BASE,2") {
            let time = Utc::now().format("%Y%m%d%H%M%S").to_string();
            let response = sentence.replace("TIME", &time);
            ctx.send(Bytes::from(response.into_bytes()));
            return Ok(Vec::new());
        }

        let Some(session) = ctx.device_session(None) else {
            return Ok(Vec::new());
        };

        let mut position = Position::new(huabao::PROTOCOL_NAME);
        position.set_device_id(session.device_id());
        session.get_last_location(&mut position, None);
        position.set(Position::KEY_RESULT, sentence);
        Ok(vec![position])
    }

    fn send_general_response(&self, ctx: &mut DecodeContext<'_>, id: &[u8], msg_type: u16, index: u16) {
        let mut body = BytesMut::new();
        body.put_u16(index);
        body.put_u16(msg_type);
        body.put_u8(huabao::RESULT_SUCCESS);
        ctx.send(huabao::format_message(
            self.delimiter,
            huabao::MSG_GENERAL_RESPONSE,
            id,
            false,
            &body,
        ));
    }

    fn send_general_response_2(&self, ctx: &mut DecodeContext<'_>, id: &[u8], msg_type: u16) {
        let mut body = BytesMut::new();
        body.put_u16(msg_type);
        body.put_u8(huabao::RESULT_SUCCESS);
        ctx.send(huabao::format_message(
            self.delimiter,
            huabao::MSG_GENERAL_RESPONSE_2,
            id,
            true,
            &body,
        ));
    }

    fn decode_location(&self, session: &DeviceSession, buf: &mut Bytes) -> Result<Position, DecodeError> {
        let mut position = Position::new(huabao::PROTOCOL_NAME);
        position.set_device_id(session.device_id());

        let model = session.model();

        decode_alarm(&mut position, model, buf.try_get_u32()?);
        decode_coordinates(&mut position, model, buf)?;

        position.set_altitude(f64::from(buf.try_get_i16()?));
        position.set_speed(knots_from_kph(f64::from(buf.try_get_u16()?) * 0.1));
        position.set_course(f64::from(buf.try_get_u16()?));
        position.set_time(read_date(buf, session.timezone())?);

        // short tail variant without TLVs
        if buf.remaining() == 20 {
            buf.advance(4);
            position.set(Position::KEY_ODOMETER, u64::from(buf.try_get_u32()?) * 1000);
            position.set(Position::KEY_BATTERY, f64::from(buf.try_get_u16()?) * 0.1);
            buf.try_get_u32()?; // zone id
            position.set(Position::KEY_RSSI, buf.try_get_u8()?);
            buf.advance(3);
            return Ok(position);
        }

        let mut network = Network::new();

        while buf.remaining() > 2 {
            let subtype = buf.try_get_u8()?;
            let length = buf.try_get_u8()? as usize;

            // the nested extension block runs to the end of the body,
            // ignoring its own declared length
            if subtype == 0x80 {
                buf.try_get_u8()?; // content marker
                let mut extension = buf.split_to(buf.remaining().saturating_sub(2));
                decode_extension(&mut position, &mut extension)?;
                continue;
            }

            if length > buf.remaining() {
                return Err(DecodeError::Truncated(TryGetError {
                    requested: length,
                    available: buf.remaining(),
                }));
            }
            // the cursor advances by the declared length no matter how much
            // of the value a case interprets
            let mut value = buf.split_to(length);

            match subtype {
                0x01 => {
                    position.set(Position::KEY_ODOMETER, u64::from(value.try_get_u32()?) * 100);
                }
                0x02 => {
                    let fuel = value.try_get_u16()?;
                    if bit_check(fuel.into(), 15) {
                        position.set(Position::KEY_FUEL, bits_to(fuel.into(), 15));
                    }
                    else {
                        position.set(Position::KEY_FUEL, f64::from(fuel) / 10.0);
                    }
                }
                0x06 => {
                    position.set(Position::KEY_DEVICE_TEMP, value.try_get_i16()?);
                }
                0x14 => {
                    position.set("videoAlarm", value.try_get_u32()?);
                }
                0x25 => {
                    position.set(Position::KEY_INPUT, value.try_get_u32()?);
                }
                0x2b | 0xa7 => {
                    position.set_indexed(Position::PREFIX_ADC, 1, f64::from(value.try_get_u16()?) / 100.0);
                    position.set_indexed(Position::PREFIX_ADC, 2, f64::from(value.try_get_u16()?) / 100.0);
                }
                0x30 => {
                    position.set(Position::KEY_RSSI, value.try_get_u8()?);
                }
                0x31 => {
                    position.set(Position::KEY_SATELLITES, value.try_get_u8()?);
                }
                0x33 => {
                    if length == 1 {
                        position.set("mode", value.try_get_u8()?);
                    }
                    else {
                        let text = read_string(&mut value, length)?;
                        if text.starts_with("*M00") {
                            let lock_status = text.get(8..15).ok_or_else(|| {
                                DecodeError::InvalidMessage {
                                    reason: format!("short lock status: {text}"),
                                }
                            })?;
                            let battery =
                                lock_status[2..5].parse::<i64>().map_err(|_| {
                                    DecodeError::InvalidMessage {
                                        reason: format!("invalid lock battery: {lock_status}"),
                                    }
                                })?;
                            position.set(Position::KEY_BATTERY, battery as f64 * 0.01);
                        }
                    }
                }
                0x51 => {
                    if length == 2 || length == 16 {
                        for i in 1..=length / 2 {
                            let reading = value.try_get_u16()?;
                            if reading != 0xffff {
                                let temperature = if bit_check(reading.into(), 15) {
                                    -(bits_to(reading.into(), 15) as f64) / 10.0
                                }
                                else {
                                    f64::from(reading) / 10.0
                                };
                                position.set_indexed(Position::PREFIX_TEMP, i, temperature);
                            }
                        }
                    }
                }
                0x56 => {
                    position.set(Position::KEY_BATTERY_LEVEL, u16::from(value.try_get_u8()?) * 10);
                    value.try_get_u8()?; // reserved
                }
                0x57 => {
                    let alarm = value.try_get_u16()?;
                    if bit_check(alarm.into(), 8) {
                        position.add_alarm(Position::ALARM_ACCELERATION);
                    }
                    if bit_check(alarm.into(), 9) {
                        position.add_alarm(Position::ALARM_BRAKING);
                    }
                    if bit_check(alarm.into(), 10) {
                        position.add_alarm(Position::ALARM_CORNERING);
                    }
                    value.try_get_u16()?; // external switches
                    let alarm2 = value.try_get_u32()?;
                    if matches!(model, Some("MV810G" | "MV710G")) && bit_check(alarm2.into(), 16) {
                        position.add_alarm(Position::ALARM_DOOR);
                    }
                }
                0x60 => {
                    let event = value.try_get_u16()?;
                    position.set(Position::KEY_EVENT, event);
                    if (0x0061..=0x0066).contains(&event) {
                        skip(&mut value, 6)?; // lock id
                        position.set(Position::KEY_DRIVER_UNIQUE_ID, read_string(&mut value, 8)?);
                    }
                }
                0x61 => {
                    position.set(Position::KEY_POWER, f64::from(value.try_get_u16()?) * 0.01);
                }
                0x63 => {
                    for i in 1..=length / 11 {
                        position.set(
                            format!("lock{i}Id"),
                            hex_dump(&value.try_get_bytes::<6>()?),
                        );
                        position.set(
                            format!("lock{i}Battery"),
                            f64::from(value.try_get_u16()?) * 0.001,
                        );
                        position.set(format!("lock{i}Seal"), value.try_get_u8()? == 0x31);
                        value.try_get_u8()?; // physical state
                        value.try_get_u8()?; // rssi
                    }
                }
                0x64 => {
                    value.try_get_u32()?; // alarm serial
                    value.try_get_u8()?; // alarm state
                    position.set("adasAlarm", value.try_get_u8()?);
                }
                0x65 => {
                    value.try_get_u32()?; // alarm serial
                    value.try_get_u8()?; // alarm state
                    position.set("dmsAlarm", value.try_get_u8()?);
                }
                0x67 => {
                    position.set("password", read_string(&mut value, 8)?);
                }
                0x68 => {
                    position.set(Position::KEY_BATTERY_LEVEL, f64::from(value.try_get_u16()?) * 0.01);
                }
                0x69 => {
                    position.set(Position::KEY_BATTERY, f64::from(value.try_get_u16()?) * 0.01);
                }
                0x70 => {
                    value.try_get_u32()?; // alarm serial
                    value.try_get_u8()?; // alarm state
                    match value.try_get_u8()? {
                        0x01 => position.add_alarm(Position::ALARM_ACCELERATION),
                        0x02 => position.add_alarm(Position::ALARM_BRAKING),
                        0x03 => position.add_alarm(Position::ALARM_CORNERING),
                        0x16 => position.add_alarm(Position::ALARM_ACCIDENT),
                        _ => {}
                    }
                }
                0x77 => {
                    while value.remaining() > 0 {
                        let tire = value.try_get_u8()?;
                        position.set(
                            format!("tire{tire}SensorId"),
                            hex_dump(&value.try_get_bytes::<3>()?),
                        );
                        position.set(
                            format!("tire{tire}Pressure"),
                            bits_to(value.try_get_u16()?.into(), 10) as f64 / 40.0,
                        );
                        position.set(format!("tire{tire}Temp"), i32::from(value.try_get_u8()?) - 50);
                        position.set(format!("tire{tire}Status"), value.try_get_u8()?);
                    }
                }
                0x82 => {
                    position.set(Position::KEY_POWER, f64::from(value.try_get_u16()?) / 10.0);
                }
                0x91 => {
                    position.set(Position::KEY_BATTERY, f64::from(value.try_get_u16()?) * 0.1);
                    position.set(Position::KEY_RPM, value.try_get_u16()?);
                    position.set(Position::KEY_OBD_SPEED, value.try_get_u8()?);
                    position.set(Position::KEY_THROTTLE, u16::from(value.try_get_u8()?) * 100 / 255);
                    position.set(Position::KEY_ENGINE_LOAD, u16::from(value.try_get_u8()?) * 100 / 255);
                    position.set(Position::KEY_COOLANT_TEMP, i32::from(value.try_get_u8()?) - 40);
                    value.try_get_u16()?;
                    position.set(
                        Position::KEY_FUEL_CONSUMPTION,
                        f64::from(value.try_get_u16()?) * 0.01,
                    );
                    value.try_get_u16()?;
                    value.try_get_u32()?;
                    value.try_get_u16()?;
                    position.set(Position::KEY_FUEL_USED, f64::from(value.try_get_u16()?) * 0.01);
                }
                0x94 => {
                    if length > 0 {
                        position.set(Position::KEY_VIN, read_string(&mut value, length)?);
                    }
                }
                0xac => {
                    position.set(Position::KEY_ODOMETER, value.try_get_u32()?);
                }
                0xbc => {
                    let driver = read_string(&mut value, length)?;
                    position.set("driver", driver.trim());
                }
                0xbd => {
                    position.set(Position::KEY_DRIVER_UNIQUE_ID, read_string(&mut value, length)?);
                }
                0xd0 => {
                    let user_status = value.try_get_u32()?;
                    if bit_check(user_status.into(), 3) {
                        position.add_alarm(Position::ALARM_VIBRATION);
                    }
                }
                0xd3 => {
                    position.set(Position::KEY_POWER, f64::from(value.try_get_u16()?) * 0.1);
                }
                0xd4 | 0xe1 => {
                    if length == 1 {
                        position.set(Position::KEY_BATTERY_LEVEL, value.try_get_u8()?);
                    }
                    else {
                        position.set(
                            Position::KEY_DRIVER_UNIQUE_ID,
                            value.try_get_u32()?.to_string(),
                        );
                    }
                }
                0xd5 => {
                    if length == 2 {
                        position.set(Position::KEY_BATTERY, f64::from(value.try_get_u16()?) * 0.01);
                    }
                    else {
                        let count = value.try_get_u8()?;
                        for i in 1..=count {
                            position.set(
                                format!("lock{i}Id"),
                                hex_dump(&value.try_get_bytes::<5>()?),
                            );
                            position.set(
                                format!("lock{i}Card"),
                                hex_dump(&value.try_get_bytes::<5>()?),
                            );
                            position.set(format!("lock{i}Battery"), value.try_get_u8()?);
                            let status = value.try_get_u16()?;
                            position.set(format!("lock{i}Locked"), !bit_check(status.into(), 5));
                        }
                    }
                }
                0xda => {
                    value.try_get_u16()?; // string cut count
                    let device_status = value.try_get_u8()?;
                    position.set("string", bit_check(device_status.into(), 0));
                    position.set(Position::KEY_MOTION, bit_check(device_status.into(), 2));
                    position.set("cover", bit_check(device_status.into(), 3));
                }
                0xe2 => {
                    if model != Some("DT800") {
                        position.set(Position::KEY_FUEL, f64::from(value.try_get_u32()?) * 0.1);
                    }
                }
                0xe3 => {
                    value.try_get_u8()?; // reserved
                    position.set(Position::KEY_BATTERY_LEVEL, value.try_get_u8()?);
                    position.set(Position::KEY_BATTERY, f64::from(value.try_get_u16()?) / 100.0);
                }
                0xe4 => {
                    if value.try_get_u8()? == 0 {
                        position.set(Position::KEY_CHARGE, true);
                    }
                    position.set(Position::KEY_BATTERY_LEVEL, value.try_get_u8()?);
                }
                0xe6 => {
                    if value.len() >= 7 && &value[..7] == b"$OBD-RT" {
                        let data = read_string(&mut value, length)?;
                        decode_obd_rt(&mut position, &data)?;
                    }
                    else {
                        while value.remaining() > 0 {
                            let sensor = value.try_get_u8()?;
                            skip(&mut value, 6)?; // mac address
                            let temperature = decode_custom_double(&mut value)?;
                            let humidity = decode_custom_double(&mut value)?;
                            position.set_indexed(Position::PREFIX_TEMP, sensor as usize, temperature);
                            position.set(format!("humidity{sensor}"), humidity);
                        }
                    }
                }
                0xea => {
                    if length > 2 {
                        value.try_get_u8()?; // extension marker
                        while value.remaining() > 0 {
                            let extended_type = value.try_get_u8()?;
                            let extended_length = value.try_get_u8()? as usize;
                            if extended_length > value.remaining() {
                                return Err(DecodeError::Truncated(TryGetError {
                                    requested: extended_length,
                                    available: value.remaining(),
                                }));
                            }
                            let mut extended = value.split_to(extended_length);
                            match extended_type {
                                0x11 => {
                                    position.set("externalAlarms", extended.try_get_u16()?);
                                    position.set("alarmThresholdType", extended.try_get_u8()?);
                                }
                                0x13 => {
                                    position.set("externalIlluminance", extended.try_get_u16()?);
                                }
                                0x14 => {
                                    position.set("externalAirPressure", extended.try_get_u16()?);
                                }
                                0x15 => {
                                    position.set(
                                        "externalHumidity",
                                        f64::from(extended.try_get_u16()?) / 10.0,
                                    );
                                }
                                0x16 => {
                                    position.set(
                                        "externalTemp",
                                        f64::from(extended.try_get_u16()?) / 10.0 - 50.0,
                                    );
                                }
                                _ => {}
                            }
                        }
                    }
                }
                0xeb => {
                    decode_network_block(&mut position, &mut network, &mut value)?;
                }
                0xed => {
                    let card = read_string(&mut value, length)?;
                    position.set(Position::KEY_CARD, card.trim());
                }
                0xee => {
                    position.set(Position::KEY_RSSI, value.try_get_u8()?);
                    position.set(Position::KEY_POWER, f64::from(value.try_get_u16()?) * 0.001);
                    position.set(Position::KEY_BATTERY, f64::from(value.try_get_u16()?) * 0.001);
                    position.set(Position::KEY_SATELLITES, value.try_get_u8()?);
                }
                0xf1 => {
                    position.set(Position::KEY_ICCID, read_string(&mut value, length)?);
                }
                0xf3 => {
                    decode_obd_extension(&mut position, &mut value)?;
                }
                0xf4 => {
                    while value.remaining() > 0 {
                        let mac = value.try_get_bytes::<6>()?;
                        let rssi = value.try_get_i8()?;
                        let mac = mac
                            .iter()
                            .map(|byte| format!("{byte:02x}"))
                            .collect::<Vec<_>>()
                            .join(":");
                        network.add_wifi_access_point(WifiAccessPoint::from_mac(mac, rssi.into()));
                    }
                }
                0xf5 => {
                    if length == 2 {
                        position.set("illuminance", value.try_get_u16()?);
                    }
                }
                0xf6 => {
                    if length == 2 {
                        position.set("airPressure", value.try_get_u16()?);
                    }
                    else {
                        let event = value.try_get_u8()?;
                        position.set(Position::KEY_EVENT, event);
                        if event == 2 {
                            position.set(Position::KEY_MOTION, true);
                        }
                        let field_mask = value.try_get_u8()?;
                        if bit_check(field_mask.into(), 0) {
                            position.set("lightSensor", value.try_get_u16()?);
                        }
                        if bit_check(field_mask.into(), 1) {
                            position.set_indexed(
                                Position::PREFIX_TEMP,
                                1,
                                f64::from(value.try_get_i16()?) * 0.1,
                            );
                        }
                        if bit_check(field_mask.into(), 2) {
                            position.set(
                                Position::KEY_HUMIDITY,
                                f64::from(value.try_get_i16()?) * 0.1,
                            );
                        }
                    }
                }
                0xf7 => {
                    if length == 2 {
                        position.set(Position::KEY_HUMIDITY, f64::from(value.try_get_u16()?) / 10.0);
                    }
                    else {
                        position.set(Position::KEY_BATTERY, f64::from(value.try_get_u32()?) * 0.001);
                        if length >= 5 {
                            let battery_status = value.try_get_u8()?;
                            if battery_status == 2 || battery_status == 3 {
                                position.set(Position::KEY_CHARGE, true);
                            }
                        }
                        if length >= 6 {
                            position.set(Position::KEY_BATTERY_LEVEL, value.try_get_u8()?);
                        }
                    }
                }
                0xf8 => {
                    position.set_indexed(
                        Position::PREFIX_TEMP,
                        2,
                        f64::from(value.try_get_u16()?) / 10.0 - 50.0,
                    );
                }
                0xfb => {
                    position.set("container", read_string(&mut value, length)?);
                }
                0xfc => {
                    position.set(Position::KEY_GEOFENCE, value.try_get_u8()?);
                }
                0xfe => {
                    if length == 1 {
                        position.set(Position::KEY_BATTERY_LEVEL, value.try_get_u8()?);
                    }
                    else if length == 2 {
                        position.set(Position::KEY_POWER, f64::from(value.try_get_u16()?) * 0.1);
                    }
                    else {
                        let mark = value.try_get_u8()?;
                        if mark == 0x7c {
                            while value.remaining() > 1 {
                                let extended_type = value.try_get_u8()?;
                                let extended_length = value.try_get_u8()? as usize;
                                if extended_type == 0x01 {
                                    let alarms = value.try_get_u32()?;
                                    if bit_check(alarms.into(), 0) {
                                        position.add_alarm(Position::ALARM_ACCELERATION);
                                    }
                                    if bit_check(alarms.into(), 1) {
                                        position.add_alarm(Position::ALARM_BRAKING);
                                    }
                                    if bit_check(alarms.into(), 2) {
                                        position.add_alarm(Position::ALARM_CORNERING);
                                    }
                                    if bit_check(alarms.into(), 3) {
                                        position.add_alarm(Position::ALARM_ACCIDENT);
                                    }
                                    if bit_check(alarms.into(), 4) {
                                        position.add_alarm(Position::ALARM_TAMPERING);
                                    }
                                }
                                else {
                                    let skip = extended_length.min(value.remaining());
                                    value.advance(skip);
                                }
                            }
                        }
                        if value.remaining() > 0 {
                            position.set(Position::KEY_BATTERY_LEVEL, value.try_get_u8()?);
                        }
                    }
                }
                _ => {}
            }
        }

        if !network.is_empty() {
            position.set_network(network);
        }

        Ok(position)
    }

    fn decode_location2(
        &self,
        session: &DeviceSession,
        buf: &mut Bytes,
        msg_type: u16,
    ) -> Result<Position, DecodeError> {
        let mut position = Position::new(huabao::PROTOCOL_NAME);
        position.set_device_id(session.device_id());

        decode_binary_location(buf, &mut position)?;
        position.set_valid(msg_type != huabao::MSG_LOCATION_REPORT_BLIND);

        position.set(Position::KEY_RSSI, buf.try_get_u8()?);
        position.set(Position::KEY_SATELLITES, buf.try_get_u8()?);
        position.set(Position::KEY_ODOMETER, u64::from(buf.try_get_u32()?) * 1000);

        let battery = buf.try_get_u8()?;
        if battery <= 100 {
            position.set(Position::KEY_BATTERY_LEVEL, battery);
        }
        else if battery == 0xaa || battery == 0xab {
            position.set(Position::KEY_CHARGE, true);
        }

        let cid = buf.try_get_u32()?;
        let lac = buf.try_get_u16()?;
        if cid > 0 && lac > 0 {
            position.set_network(Network::from_cell_tower(CellTower::from_cid_lac(cid.into(), lac)));
        }

        let product = buf.try_get_u8()?;
        let status = buf.try_get_u16()?;
        let alarm = buf.try_get_u16()?;

        if product == 1 || product == 2 {
            if bit_check(alarm.into(), 0) {
                position.add_alarm(Position::ALARM_LOW_POWER);
            }
        }
        else if product == 3 {
            position.set(Position::KEY_BLOCKED, bit_check(status.into(), 5));
            if bit_check(alarm.into(), 0) {
                position.add_alarm(Position::ALARM_OVERSPEED);
            }
            if bit_check(alarm.into(), 1) {
                position.add_alarm(Position::ALARM_LOW_POWER);
            }
            if bit_check(alarm.into(), 2) {
                position.add_alarm(Position::ALARM_VIBRATION);
            }
            if bit_check(alarm.into(), 3) {
                position.add_alarm(Position::ALARM_LOW_BATTERY);
            }
            if bit_check(alarm.into(), 5) {
                position.add_alarm(Position::ALARM_GEOFENCE_ENTER);
            }
            if bit_check(alarm.into(), 6) {
                position.add_alarm(Position::ALARM_GEOFENCE_EXIT);
            }
        }

        position.set(Position::KEY_STATUS, status);

        while buf.remaining() > 2 {
            let id = buf.try_get_u8()?;
            let length = buf.try_get_u8()? as usize;
            match id {
                0x02 => {
                    position.set_altitude(f64::from(buf.try_get_i16()?));
                }
                0x10 => {
                    position.set("wakeSource", buf.try_get_u8()?);
                }
                0x0a => {
                    if length == 3 {
                        buf.try_get_u16()?; // mcc
                        buf.try_get_u8()?; // mnc
                    }
                    else {
                        skip(buf, length)?;
                    }
                }
                0x0b => {
                    position.set("lockCommand", buf.try_get_u8()?);
                    if (5..=6).contains(&length) {
                        position.set("lockCard", buf.try_get_u32()?);
                    }
                    else if length >= 7 {
                        position.set("lockPassword", read_string(buf, 6)?);
                    }
                    if length % 2 == 0 {
                        position.set("unlockResult", buf.try_get_u8()?);
                    }
                }
                0x0c => {
                    let mut tilt = [0i32; 3];
                    for axis in &mut tilt {
                        let mut raw = i32::from(buf.try_get_u16()?);
                        if raw > 0x8000 {
                            raw -= 0x10000;
                        }
                        *axis = raw;
                    }
                    position.set("tilt", format!("[{},{},{}]", tilt[0], tilt[1], tilt[2]));
                }
                0xfc => {
                    position.set(Position::KEY_GEOFENCE, buf.try_get_u8()?);
                }
                _ => {
                    skip(buf, length)?;
                }
            }
        }

        Ok(position)
    }

    fn decode_location_batch(
        &self,
        session: &DeviceSession,
        buf: &mut Bytes,
        msg_type: u16,
    ) -> Result<Vec<Position>, DecodeError> {
        let mut positions = Vec::new();

        let mut location_type = 0;
        if msg_type == huabao::MSG_LOCATION_BATCH {
            buf.try_get_u16()?; // count
            location_type = buf.try_get_u8()?;
        }

        while buf.remaining() > 2 {
            let length = if msg_type == huabao::MSG_LOCATION_BATCH_2 {
                buf.try_get_u8()? as usize
            }
            else {
                buf.try_get_u16()? as usize
            };
            if length > buf.remaining() {
                return Err(DecodeError::Truncated(TryGetError {
                    requested: length,
                    available: buf.remaining(),
                }));
            }
            let mut fragment = buf.split_to(length);
            let mut position = self.decode_location(session, &mut fragment)?;
            if location_type > 0 {
                position.set(Position::KEY_ARCHIVE, true);
            }
            positions.push(position);
        }

        Ok(positions)
    }

    fn decode_transparent(
        &self,
        session: &DeviceSession,
        buf: &mut Bytes,
    ) -> Result<Vec<Position>, DecodeError> {
        let subtype = buf.try_get_u8()?;

        match subtype {
            0x40 => {
                let mut position = Position::new(huabao::PROTOCOL_NAME);
                position.set_device_id(session.device_id());
                session.get_last_location(&mut position, None);

                let data = read_string(buf, buf.remaining())?;
                let data = data.trim();
                if data.starts_with("GTSL") {
                    let values: Vec<&str> = data.split('|').collect();
                    if values.len() > 4 {
                        position.set(Position::KEY_DRIVER_UNIQUE_ID, values[4]);
                    }
                }

                if position.attributes().is_empty() {
                    Ok(Vec::new())
                }
                else {
                    Ok(vec![position])
                }
            }

            0x41 => {
                let mut position = Position::new(huabao::PROTOCOL_NAME);
                position.set_device_id(session.device_id());
                session.get_last_location(&mut position, None);

                let length = buf.remaining().saturating_sub(2);
                let data = read_string(buf, length)?;
                decode_obd_rt(&mut position, data.trim())?;

                Ok(vec![position])
            }

            0xf0 => self.decode_vehicle_data(session, buf).map(|position| {
                position.map(|position| vec![position]).unwrap_or_default()
            }),

            0xff => {
                let mut position = Position::new(huabao::PROTOCOL_NAME);
                position.set_device_id(session.device_id());

                position.set_valid(true);
                position.set_time(read_date(buf, session.timezone())?);
                let latitude = f64::from(buf.try_get_i32()?) * 0.000001;
                let longitude = f64::from(buf.try_get_i32()?) * 0.000001;
                position.set_latitude_wgs84(latitude)?;
                position.set_longitude_wgs84(longitude)?;
                position.set_altitude(f64::from(buf.try_get_i16()?));
                position.set_speed(knots_from_kph(f64::from(buf.try_get_u16()?) * 0.1));
                position.set_course(f64::from(buf.try_get_u16()?));

                Ok(vec![position])
            }

            _ => Ok(Vec::new()),
        }
    }

    fn decode_vehicle_data(
        &self,
        session: &DeviceSession,
        buf: &mut Bytes,
    ) -> Result<Option<Position>, DecodeError> {
        let mut position = Position::new(huabao::PROTOCOL_NAME);
        position.set_device_id(session.device_id());

        let model = session.model();
        let time = read_date(buf, session.timezone())?;

        if buf.try_get_u8()? > 0 {
            position.set(Position::KEY_ARCHIVE, true);
        }
        buf.try_get_u8()?; // vehicle type

        let subtype = buf.try_get_u8()?;
        match subtype {
            0x01 => {
                let count = buf.try_get_u8()?;
                for _ in 0..count {
                    let id = buf.try_get_u16()?;
                    let length = buf.try_get_u8()? as usize;
                    match id {
                        0x0102 | 0x0528 | 0x0546 => {
                            position.set(Position::KEY_ODOMETER, u64::from(buf.try_get_u32()?) * 100);
                        }
                        0x0103 => {
                            position.set(Position::KEY_FUEL, f64::from(buf.try_get_u32()?) * 0.01);
                        }
                        0x0111 => {
                            position.set("fuelTemp", i32::from(buf.try_get_u8()?) - 40);
                        }
                        0x012e => {
                            position.set("oilLevel", f64::from(buf.try_get_u16()?) * 0.1);
                        }
                        0x052a => {
                            position.set(Position::KEY_FUEL, f64::from(buf.try_get_u16()?) * 0.01);
                        }
                        0x0105 | 0x052c => {
                            position.set(Position::KEY_FUEL_USED, f64::from(buf.try_get_u32()?) * 0.01);
                        }
                        0x014a | 0x0537 | 0x0538 | 0x0539 => {
                            position.set(
                                Position::KEY_FUEL_CONSUMPTION,
                                f64::from(buf.try_get_u16()?) * 0.01,
                            );
                        }
                        0x052b => {
                            position.set(Position::KEY_FUEL, buf.try_get_u8()?);
                        }
                        0x052d => {
                            position.set(Position::KEY_COOLANT_TEMP, i32::from(buf.try_get_u8()?) - 40);
                        }
                        0x052e => {
                            position.set("airTemp", i32::from(buf.try_get_u8()?) - 40);
                        }
                        0x0530 => {
                            position.set(Position::KEY_POWER, f64::from(buf.try_get_u16()?) * 0.001);
                        }
                        0x0535 => {
                            position.set(Position::KEY_OBD_SPEED, f64::from(buf.try_get_u16()?) * 0.1);
                        }
                        0x0536 => {
                            position.set(Position::KEY_RPM, buf.try_get_u16()?);
                        }
                        0x053d => {
                            position.set("intakePressure", f64::from(buf.try_get_u16()?) * 0.1);
                        }
                        0x0544 => {
                            position.set("liquidLevel", buf.try_get_u8()?);
                        }
                        0x0547 | 0x0548 => {
                            position.set(Position::KEY_THROTTLE, buf.try_get_u8()?);
                        }
                        _ => {
                            match length {
                                1 => position.set(format!("io{id}"), buf.try_get_u8()?),
                                2 => position.set(format!("io{id}"), buf.try_get_u16()?),
                                4 => position.set(format!("io{id}"), buf.try_get_u32()?),
                                _ => skip(buf, length)?,
                            }
                        }
                    }
                }
                session.get_last_location(&mut position, Some(time));
                decode_coordinates(&mut position, model, buf)?;
                position.set_time(time);
            }

            0x02 => {
                let mut codes = Vec::new();
                let count = buf.try_get_u16()?;
                for _ in 0..count {
                    buf.try_get_u32()?; // system id
                    let code_count = buf.try_get_u16()?;
                    for _ in 0..code_count {
                        buf.try_get_u32()?; // dtc
                        buf.try_get_u32()?; // status
                        let length = buf.try_get_u16()? as usize;
                        codes.push(read_string(buf, length)?.trim().to_owned());
                    }
                }
                position.set(Position::KEY_DTCS, codes.join(" "));
                session.get_last_location(&mut position, Some(time));
                decode_coordinates(&mut position, model, buf)?;
                position.set_time(time);
            }

            0x03 => {
                let count = buf.try_get_u8()?;
                for _ in 0..count {
                    let id = buf.try_get_u8()?;
                    let length = buf.try_get_u8()? as usize;
                    match id {
                        0x01 => position.add_alarm(Position::ALARM_POWER_RESTORED),
                        0x02 => position.add_alarm(Position::ALARM_POWER_CUT),
                        0x1a => position.add_alarm(Position::ALARM_ACCELERATION),
                        0x1b => position.add_alarm(Position::ALARM_BRAKING),
                        0x1c => position.add_alarm(Position::ALARM_CORNERING),
                        0x1d | 0x1e | 0x1f => position.add_alarm(Position::ALARM_LANE_CHANGE),
                        0x23 => position.add_alarm(Position::ALARM_FATIGUE_DRIVING),
                        0x26 | 0x27 | 0x28 => position.add_alarm(Position::ALARM_ACCIDENT),
                        0x31 | 0x32 => position.add_alarm(Position::ALARM_DOOR),
                        _ => {}
                    }
                    skip(buf, length)?;
                }
                session.get_last_location(&mut position, Some(time));
                decode_coordinates(&mut position, model, buf)?;
                position.set_time(time);
            }

            0x0b => {
                if buf.try_get_u8()? > 0 {
                    position.set(Position::KEY_VIN, read_string(buf, 17)?);
                }
                session.get_last_location(&mut position, Some(time));
            }

            0x15 => {
                let event = buf.try_get_i32()?;
                match event {
                    51 => position.add_alarm(Position::ALARM_ACCELERATION),
                    52 => position.add_alarm(Position::ALARM_BRAKING),
                    53 => position.add_alarm(Position::ALARM_CORNERING),
                    54 => position.add_alarm(Position::ALARM_LANE_CHANGE),
                    56 => position.add_alarm(Position::ALARM_ACCIDENT),
                    _ => position.set(Position::KEY_EVENT, event),
                }
                session.get_last_location(&mut position, Some(time));
            }

            _ => return Ok(None),
        }

        Ok(Some(position))
    }
}

/// Maps the 32-bit alarm word to alarm tokens, lowest bit first. Some
/// models redefine the word entirely.
fn decode_alarm(position: &mut Position, model: Option<&str>, value: u32) {
    let value = u64::from(value);

    match model {
        Some("G-360P" | "G-508P") => {
            if bit_check(value, 0) || bit_check(value, 4) {
                position.add_alarm(Position::ALARM_REMOVING);
            }
            if bit_check(value, 1) {
                position.add_alarm(Position::ALARM_TAMPERING);
            }
        }
        Some("AL300" | "GL100") => {
            if bit_check(value, 16) {
                position.add_alarm(Position::ALARM_MOVEMENT);
            }
        }
        _ => {
            if bit_check(value, 0) {
                position.add_alarm(Position::ALARM_SOS);
            }
            if bit_check(value, 1) {
                position.add_alarm(Position::ALARM_OVERSPEED);
            }
            if bit_check(value, 5) {
                position.add_alarm(Position::ALARM_GPS_ANTENNA_CUT);
            }
            if bit_check(value, 4) || bit_check(value, 9) || bit_check(value, 10) || bit_check(value, 11)
            {
                position.add_alarm(Position::ALARM_FAULT);
            }
            if bit_check(value, 7) || bit_check(value, 18) {
                position.add_alarm(Position::ALARM_LOW_BATTERY);
            }
            if bit_check(value, 8) {
                position.add_alarm(Position::ALARM_POWER_OFF);
            }
            if bit_check(value, 15) {
                position.add_alarm(Position::ALARM_VIBRATION);
            }
            if bit_check(value, 16) || bit_check(value, 17) {
                position.add_alarm(Position::ALARM_TAMPERING);
            }
            if bit_check(value, 20) {
                position.add_alarm(Position::ALARM_GEOFENCE);
            }
            if bit_check(value, 28) {
                position.add_alarm(Position::ALARM_MOVEMENT);
            }
            if (bit_check(value, 29) || bit_check(value, 30)) && model != Some("VL300") {
                position.add_alarm(Position::ALARM_ACCIDENT);
            }
        }
    }
}

/// The status word and the unsigned coordinate pair. Sign bits 2/3 apply
/// to latitude/longitude; bit 1 is fix validity.
fn decode_coordinates(
    position: &mut Position,
    model: Option<&str>,
    buf: &mut Bytes,
) -> Result<(), DecodeError> {
    let status = u64::from(buf.try_get_u32()?);

    position.set(Position::KEY_IGNITION, bit_check(status, 0));
    if model == Some("G1C Pro") {
        position.set(Position::KEY_MOTION, bit_check(status, 4));
    }
    position.set(Position::KEY_BLOCKED, bit_check(status, 10));
    if matches!(model, Some("MV810G" | "MV710G")) {
        position.set(Position::KEY_DOOR, bit_check(status, 16));
    }
    position.set(Position::KEY_CHARGE, bit_check(status, 26));

    position.set_valid(bit_check(status, 1));

    let latitude = f64::from(buf.try_get_u32()?) * 0.000001;
    let longitude = f64::from(buf.try_get_u32()?) * 0.000001;

    position.set_latitude_wgs84(if bit_check(status, 2) { -latitude } else { latitude })?;
    position.set_longitude_wgs84(if bit_check(status, 3) { -longitude } else { longitude })?;

    Ok(())
}

/// Six BCD bytes, `yy MM dd HH mm ss`, in the device timezone.
fn read_date(buf: &mut Bytes, timezone: FixedOffset) -> Result<DateTime<Utc>, DecodeError> {
    let year = read_bcd(buf, 2)? as u32;
    let month = read_bcd(buf, 2)? as u32;
    let day = read_bcd(buf, 2)? as u32;
    let hour = read_bcd(buf, 2)? as u32;
    let minute = read_bcd(buf, 2)? as u32;
    let second = read_bcd(buf, 2)? as u32;

    Ok(DateBuilder::new(timezone)
        .year(year)
        .month(month)
        .day(day)
        .time(hour, minute, second)
        .build()?)
}

/// Device id field: all-decimal ids are used verbatim, anything else is an
/// IMEI packed as 2+4 binary bytes, completed with its Luhn check digit.
fn decode_id(id: &[u8]) -> String {
    let serial = hex_dump(id);
    if serial.bytes().all(|byte| byte.is_ascii_digit()) {
        serial
    }
    else {
        let imei = (u64::from(u16::from_be_bytes([id[0], id[1]])) << 32)
            + u64::from(u32::from_be_bytes([id[2], id[3], id[4], id[5]]));
        format!("{imei}{}", luhn_check_digit(imei))
    }
}

/// Nested extension TLVs inside field 0x80. Known types consume their
/// fixed layouts, unknown types are skipped by their declared length.
fn decode_extension(position: &mut Position, buf: &mut Bytes) -> Result<(), DecodeError> {
    while buf.remaining() > 0 {
        let extension_type = buf.try_get_u8()?;
        let length = buf.try_get_u8()? as usize;

        match extension_type {
            0x01 => position.set(Position::KEY_ODOMETER, u64::from(buf.try_get_u32()?) * 100),
            0x02 => position.set(Position::KEY_FUEL, f64::from(buf.try_get_u16()?) * 0.1),
            0x03 => position.set(Position::KEY_OBD_SPEED, f64::from(buf.try_get_u16()?) * 0.1),
            0x56 => {
                buf.try_get_u8()?; // power level
                position.set(Position::KEY_BATTERY_LEVEL, buf.try_get_u8()?);
            }
            0x61 => position.set(Position::KEY_POWER, f64::from(buf.try_get_u16()?) * 0.01),
            0x69 => position.set(Position::KEY_BATTERY, f64::from(buf.try_get_u16()?) * 0.01),
            0x80 => position.set(Position::KEY_OBD_SPEED, buf.try_get_u8()?),
            0x81 => position.set(Position::KEY_RPM, buf.try_get_u16()?),
            0x82 => position.set(Position::KEY_POWER, f64::from(buf.try_get_u16()?) * 0.1),
            0x83 => position.set(Position::KEY_ENGINE_LOAD, buf.try_get_u8()?),
            0x84 => position.set(Position::KEY_COOLANT_TEMP, i32::from(buf.try_get_u8()?) - 40),
            0x85 => position.set(Position::KEY_FUEL_CONSUMPTION, buf.try_get_u16()?),
            0x86 => position.set("intakeTemp", i32::from(buf.try_get_u8()?) - 40),
            0x87 => position.set("intakeFlow", buf.try_get_u16()?),
            0x88 => position.set("intakePressure", buf.try_get_u8()?),
            0x89 => position.set(Position::KEY_THROTTLE, buf.try_get_u8()?),
            0x8b => position.set(Position::KEY_VIN, read_string(buf, 17)?),
            0x8c => position.set(Position::KEY_OBD_ODOMETER, u64::from(buf.try_get_u32()?) * 100),
            0x8d => position.set(Position::KEY_ODOMETER_TRIP, u64::from(buf.try_get_u16()?) * 1000),
            0x8e => position.set(Position::KEY_FUEL, buf.try_get_u8()?),
            0xa0 => {
                let codes = read_string(buf, length)?;
                position.set(Position::KEY_DTCS, codes.replace(',', " "));
            }
            0xcc => position.set(Position::KEY_ICCID, read_string(buf, 20)?),
            _ => skip(buf, length)?,
        }
    }

    Ok(())
}

/// Field 0xEB carries either cell towers (first word is an MCC) or nested
/// length-prefixed records.
fn decode_network_block(
    position: &mut Position,
    network: &mut Network,
    value: &mut Bytes,
) -> Result<(), DecodeError> {
    if value.remaining() < 2 {
        return Err(DecodeError::Truncated(TryGetError {
            requested: 2,
            available: value.remaining(),
        }));
    }

    if u16::from_be_bytes([value[0], value[1]]) > 200 {
        let mcc = value.try_get_u16()?;
        let mnc = value.try_get_u8()?;
        while value.remaining() > 0 {
            let lac = value.try_get_u16()?;
            let cid = value.try_get_u16()?;
            let rssi = value.try_get_u8()?;
            network.add_cell_tower(CellTower::with_signal(
                mcc,
                mnc.into(),
                lac,
                cid.into(),
                rssi.into(),
            ));
        }
        return Ok(());
    }

    while value.remaining() > 0 {
        let extended_length = value.try_get_u16()? as usize;
        if extended_length > value.remaining() {
            return Err(DecodeError::Truncated(TryGetError {
                requested: extended_length,
                available: value.remaining(),
            }));
        }
        let mut extended = value.split_to(extended_length);
        let extended_type = extended.try_get_u16()?;

        match extended_type {
            0x0001 => {
                position.set("fuel1", f64::from(extended.try_get_u16()?) * 0.1);
                extended.try_get_u8()?; // unused
            }
            0x0023 => {
                let fuel = read_string(&mut extended, 6)?;
                let fuel = fuel.parse::<f64>().map_err(|_| {
                    DecodeError::InvalidMessage {
                        reason: format!("invalid fuel value: {fuel}"),
                    }
                })?;
                position.set("fuel2", fuel);
            }
            0x00b2 => {
                let iccid = hex_dump(&extended.try_get_bytes::<10>()?);
                position.set(Position::KEY_ICCID, iccid.replace('f', ""));
            }
            0x00b9 => {
                extended.try_get_u8()?; // count
                let extended_remaining = extended.remaining();
                let csv = read_string(&mut extended, extended_remaining)?;
                let values: Vec<&str> = csv.split(',').collect();
                for pair in values.chunks_exact(2) {
                    let rssi = pair[1].parse::<i32>().map_err(|_| {
                        DecodeError::InvalidMessage {
                            reason: format!("invalid access point rssi: {}", pair[1]),
                        }
                    })?;
                    network.add_wifi_access_point(WifiAccessPoint::from_mac(pair[0], rssi));
                }
            }
            0x00c6 => {
                let battery_alarm = extended.try_get_u8()?;
                if battery_alarm == 0x03 || battery_alarm == 0x04 {
                    position.set(Position::KEY_ALARM, Position::ALARM_LOW_BATTERY);
                }
                position.set("batteryAlarm", battery_alarm);
            }
            0x00ce => {
                position.set(Position::KEY_POWER, f64::from(extended.try_get_u16()?) * 0.01);
            }
            0x00d8 => {
                let mcc = extended.try_get_u16()?;
                let mnc = extended.try_get_u8()?;
                let lac = extended.try_get_u16()?;
                let cid = extended.try_get_u32()?;
                network.add_cell_tower(CellTower::from_parts(mcc, mnc.into(), lac, cid.into()));
            }
            0x00a8 | 0x00e1 => {
                position.set(Position::KEY_BATTERY_LEVEL, extended.try_get_u8()?);
            }
            _ => {}
        }
    }

    Ok(())
}

/// OBD extension TLVs inside field 0xF3: 2-byte subtype, 1-byte length.
fn decode_obd_extension(position: &mut Position, value: &mut Bytes) -> Result<(), DecodeError> {
    while value.remaining() > 0 {
        let extended_type = value.try_get_u16()?;
        let extended_length = value.try_get_u8()? as usize;

        match extended_type {
            0x0002 => position.set(Position::KEY_OBD_SPEED, f64::from(value.try_get_u16()?) * 0.1),
            0x0003 => position.set(Position::KEY_RPM, value.try_get_u16()?),
            0x0004 => position.set(Position::KEY_POWER, f64::from(value.try_get_u16()?) * 0.001),
            0x0005 => {
                position.set(Position::KEY_OBD_ODOMETER, u64::from(value.try_get_u32()?) * 100);
            }
            0x0007 => {
                position.set(
                    Position::KEY_FUEL_CONSUMPTION,
                    f64::from(value.try_get_u16()?) * 0.1,
                );
            }
            0x0008 => position.set(Position::KEY_ENGINE_LOAD, f64::from(value.try_get_u16()?) * 0.1),
            0x0009 => position.set(Position::KEY_COOLANT_TEMP, i32::from(value.try_get_u16()?) - 40),
            0x000b => position.set("intakePressure", value.try_get_u16()?),
            0x000c => position.set("intakeTemp", i32::from(value.try_get_u16()?) - 40),
            0x000d => position.set("intakeFlow", value.try_get_u16()?),
            0x000e => position.set(Position::KEY_THROTTLE, u32::from(value.try_get_u16()?) * 100 / 255),
            0x0050 => position.set(Position::KEY_VIN, read_string(value, 17)?),
            0x0051 => {
                if extended_length > 0 {
                    if extended_length > value.remaining() {
                        return Err(DecodeError::Truncated(TryGetError {
                            requested: extended_length,
                            available: value.remaining(),
                        }));
                    }
                    position.set("cvn", hex_dump(&value.split_to(extended_length)));
                }
            }
            0x0052 => {
                if extended_length > 0 {
                    position.set("calid", read_string(value, extended_length)?);
                }
            }
            0x0100 => position.set(Position::KEY_ODOMETER_TRIP, f64::from(value.try_get_u16()?) * 0.1),
            0x0102 => position.set("tripFuel", f64::from(value.try_get_u16()?) * 0.1),
            0x0112 => position.set("hardAccelerationCount", value.try_get_u16()?),
            0x0113 => position.set("hardDecelerationCount", value.try_get_u16()?),
            0x0114 => position.set("hardCorneringCount", value.try_get_u16()?),
            _ => skip(value, extended_length)?,
        }
    }

    Ok(())
}

/// Comma-separated `$OBD-RT` realtime block. Fields may be empty; the list
/// may be cut short.
fn decode_obd_rt(position: &mut Position, data: &str) -> Result<(), DecodeError> {
    let values: Vec<&str> = data.split(',').collect();

    let fields: [(&str, bool); 12] = [
        (Position::KEY_POWER, false),
        (Position::KEY_RPM, false),
        (Position::KEY_OBD_SPEED, false),
        (Position::KEY_THROTTLE, false),
        (Position::KEY_ENGINE_LOAD, false),
        (Position::KEY_COOLANT_TEMP, true),
        (Position::KEY_FUEL_CONSUMPTION, false), // instant
        (Position::KEY_FUEL_CONSUMPTION, false), // average
        (Position::KEY_ODOMETER_TRIP, false),
        (Position::KEY_OBD_ODOMETER, false),
        ("tripFuelUsed", false),
        (Position::KEY_FUEL_USED, false),
    ];

    // index 0 is the $OBD-RT header
    for (offset, (key, integer)) in fields.iter().enumerate() {
        let Some(raw) = values.get(offset + 1) else {
            break;
        };
        if raw.is_empty() {
            continue;
        }

        if *integer {
            let parsed = raw.parse::<i64>().map_err(|_| {
                DecodeError::InvalidMessage {
                    reason: format!("invalid obd value: {raw}"),
                }
            })?;
            position.set(*key, parsed);
        }
        else {
            let parsed = raw.parse::<f64>().map_err(|_| {
                DecodeError::InvalidMessage {
                    reason: format!("invalid obd value: {raw}"),
                }
            })?;
            position.set(*key, parsed);
        }
    }

    Ok(())
}

/// Temperature/humidity encoding: signed integer part in the first byte,
/// fractional 255ths in the second.
fn decode_custom_double(buf: &mut Bytes) -> Result<f64, DecodeError> {
    let integer = i32::from(buf.try_get_i8()?);
    let fraction = f64::from(buf.try_get_u8()?);
    let sign = if integer < 0 { -1.0 } else { 1.0 };
    Ok(sign * (f64::from(integer.abs()) + fraction / 255.0))
}

/// The v2 location head: BCD date (day first), BCD coordinates in
/// degree-minute form, a shared digit/flag byte, BCD speed.
fn decode_binary_location(buf: &mut Bytes, position: &mut Position) -> Result<(), DecodeError> {
    let day = read_bcd(buf, 2)? as u32;
    let month = read_bcd(buf, 2)? as u32;
    let year = read_bcd(buf, 2)? as u32;
    let hour = read_bcd(buf, 2)? as u32;
    let minute = read_bcd(buf, 2)? as u32;
    let second = read_bcd(buf, 2)? as u32;
    position.set_time(
        DateBuilder::new(utc_offset())
            .year(year)
            .month(month)
            .day(day)
            .time(hour, minute, second)
            .build()?,
    );

    let mut latitude = convert_bcd_coordinate(read_bcd(buf, 8)?);
    let mut longitude = convert_bcd_coordinate(read_bcd(buf, 9)?);

    // the low nibble of the ninth longitude digit's byte carries the flags
    let flags = buf.try_get_u8()?;
    position.set_valid(flags & 0x01 == 0x01);
    if flags & 0x02 == 0 {
        latitude = -latitude;
    }
    if flags & 0x04 == 0 {
        longitude = -longitude;
    }
    position.set_latitude(latitude)?;
    position.set_longitude(longitude)?;

    position.set_speed(read_bcd(buf, 2)? as f64);
    position.set_course(f64::from(buf.try_get_u8()?) * 2.0);

    Ok(())
}

/// `ddmmmmmm` / `dddmmmmmm`: degrees, then minutes scaled by 1e4.
fn convert_bcd_coordinate(value: u64) -> f64 {
    let degrees = (value / 1_000_000) as f64;
    let minutes = (value % 1_000_000) as f64 / 10_000.0;
    degrees + minutes / 60.0
}

fn skip(buf: &mut Bytes, length: usize) -> Result<(), DecodeError> {
    if length > buf.remaining() {
        return Err(DecodeError::Truncated(TryGetError {
            requested: length,
            available: buf.remaining(),
        }));
    }
    buf.advance(length);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use geolink_types::position::AttributeValue;

    use super::*;
    use crate::{
        config::ProtocolConfig,
        session::{
            Endpoint,
            InMemoryDirectory,
            SessionRegistry,
        },
    };

    const DEVICE_ID_BYTES: [u8; 6] = [0x01, 0x23, 0x45, 0x67, 0x89, 0x01];
    const UNIQUE_ID: &str = "012345678901";

    fn registry() -> SessionRegistry {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.add(UNIQUE_ID, None);
        SessionRegistry::new(directory, false)
    }

    fn endpoint() -> Endpoint {
        Endpoint::new(1, "10.0.0.1:40000".parse().unwrap())
    }

    fn build_frame(msg_type: u16, attribute: u16, index_bytes: &[u8], body: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(0x7e);
        buf.put_u16(msg_type);
        buf.put_u16(attribute);
        buf.put_slice(&DEVICE_ID_BYTES);
        buf.put_slice(index_bytes);
        buf.put_slice(body);
        let checksum = xor_checksum(&buf[1..]);
        buf.put_u8(checksum);
        buf.put_u8(0x7e);
        buf.freeze()
    }

    fn location_body() -> Vec<u8> {
        let mut body = BytesMut::new();
        body.put_u32(0x0000_00a0); // alarm: bits 5 and 7
        body.put_u32(0x0000_0007); // status: ignition, valid, latitude negative
        body.put_u32(22_000_000); // latitude
        body.put_u32(114_000_000); // longitude
        body.put_i16(50); // altitude
        body.put_u16(100); // speed, x0.1 km/h
        body.put_u16(90); // course
        body.put_slice(&[0x24, 0x01, 0x15, 0x12, 0x00, 0x00]); // time
        body.to_vec()
    }

    fn decode(frame: Bytes) -> (Vec<Position>, Vec<Bytes>) {
        let sessions = registry();
        let config = ProtocolConfig::default();
        let mut ctx = DecodeContext::new(&sessions, endpoint(), &config);
        let mut decoder = HuabaoDecoder::new();
        let positions = decoder.decode(&mut ctx, frame).unwrap();
        let responses = ctx.take_responses();
        (positions, responses)
    }

    #[test]
    fn it_responds_to_registration() {
        let frame = build_frame(huabao::MSG_TERMINAL_REGISTER, 0, &[0x00, 0x01], &[]);
        let (positions, responses) = decode(frame);

        assert!(positions.is_empty());
        assert_eq!(responses.len(), 1);

        let mut body = BytesMut::new();
        body.put_u16(0x0001);
        body.put_u8(0x00);
        body.put_slice(UNIQUE_ID.as_bytes());
        let expected = huabao::format_message(
            0x7e,
            huabao::MSG_TERMINAL_REGISTER_RESPONSE,
            &DEVICE_ID_BYTES,
            false,
            &body,
        );
        assert_eq!(responses[0], expected);
    }

    #[test]
    fn it_decodes_a_location_report_and_acks() {
        let frame = build_frame(huabao::MSG_LOCATION_REPORT, 0, &[0x00, 0x05], &location_body());
        let (positions, responses) = decode(frame);

        assert_eq!(positions.len(), 1);
        let position = &positions[0];

        assert_eq!(position.latitude_wgs84(), -22.0);
        assert_eq!(position.longitude_wgs84(), 114.0);
        // outside China, the published coordinates are the raw ones
        assert_eq!(position.latitude(), -22.0);
        assert_eq!(position.longitude(), 114.0);
        assert_eq!(position.altitude(), 50.0);
        assert!((position.speed() - knots_from_kph(10.0)).abs() < 1e-9);
        assert_eq!(position.course(), 90.0);
        assert!(position.valid());
        assert_eq!(
            position.get(Position::KEY_IGNITION),
            Some(&AttributeValue::Bool(true))
        );
        assert_eq!(
            position.get(Position::KEY_ALARM).unwrap().as_str(),
            Some("gpsAntennaCut,lowBattery")
        );
        // GMT+08:00 is the default device timezone
        assert_eq!(
            position.fix_time().unwrap().to_rfc3339(),
            "2024-01-15T04:00:00+00:00"
        );

        assert_eq!(responses.len(), 1);
        let mut body = BytesMut::new();
        body.put_u16(0x0005);
        body.put_u16(huabao::MSG_LOCATION_REPORT);
        body.put_u8(0x00);
        let expected = huabao::format_message(
            0x7e,
            huabao::MSG_GENERAL_RESPONSE,
            &DEVICE_ID_BYTES,
            false,
            &body,
        );
        assert_eq!(responses[0], expected);
    }

    #[test]
    fn it_advances_past_unknown_fields() {
        let mut body = BytesMut::from(&location_body()[..]);
        // rssi
        body.put_slice(&[0x30, 0x01, 0x1f]);
        // unknown field, longer than its interpreted content
        body.put_slice(&[0x99, 0x03, 0xaa, 0xbb, 0xcc]);
        // satellites
        body.put_slice(&[0x31, 0x01, 0x0b]);
        // odometer
        body.put_slice(&[0x01, 0x04, 0x00, 0x00, 0x00, 0x64]);

        let frame = build_frame(huabao::MSG_LOCATION_REPORT, 0, &[0x00, 0x06], &body);
        let (positions, _) = decode(frame);

        let position = &positions[0];
        assert_eq!(position.get(Position::KEY_RSSI), Some(&AttributeValue::Integer(31)));
        assert_eq!(
            position.get(Position::KEY_SATELLITES),
            Some(&AttributeValue::Integer(11))
        );
        assert_eq!(
            position.get(Position::KEY_ODOMETER),
            Some(&AttributeValue::Integer(10000))
        );
    }

    #[test]
    fn it_rejects_a_bad_checksum() {
        let frame = build_frame(huabao::MSG_LOCATION_REPORT, 0, &[0x00, 0x05], &location_body());
        let mut corrupted = BytesMut::from(&frame[..]);
        let checksum_index = corrupted.len() - 2;
        corrupted[checksum_index] ^= 0xff;

        let (positions, responses) = decode(corrupted.freeze());
        assert!(positions.is_empty());
        assert!(responses.is_empty());
    }

    #[test]
    fn it_drops_messages_from_unknown_devices() {
        let sessions = SessionRegistry::new(Arc::new(InMemoryDirectory::new()), false);
        let config = ProtocolConfig::default();
        let mut ctx = DecodeContext::new(&sessions, endpoint(), &config);
        let mut decoder = HuabaoDecoder::new();

        let frame = build_frame(huabao::MSG_LOCATION_REPORT, 0, &[0x00, 0x05], &location_body());
        let positions = decoder.decode(&mut ctx, frame).unwrap();

        assert!(positions.is_empty());
        assert!(ctx.take_responses().is_empty());
    }

    #[test]
    fn it_decodes_batches_in_order() {
        let fragment = location_body();
        let mut body = BytesMut::new();
        body.put_u16(2); // count
        body.put_u8(1); // location type: archived
        for _ in 0..2 {
            body.put_u16(fragment.len() as u16);
            body.put_slice(&fragment);
        }

        let frame = build_frame(huabao::MSG_LOCATION_BATCH, 0, &[0x00, 0x07], &body);
        let (positions, responses) = decode(frame);

        assert_eq!(positions.len(), 2);
        for position in &positions {
            assert_eq!(
                position.get(Position::KEY_ARCHIVE),
                Some(&AttributeValue::Bool(true))
            );
            assert!(position.valid());
        }
        assert_eq!(responses.len(), 1);
    }

    #[test]
    fn it_answers_time_sync_with_the_register_response_type() {
        let frame = build_frame(huabao::MSG_TIME_SYNC_REQUEST, 0, &[0x00, 0x02], &[]);
        let (positions, responses) = decode(frame);

        assert!(positions.is_empty());
        assert_eq!(responses.len(), 1);
        // the reply reuses 0x8100 instead of MSG_TIME_SYNC_RESPONSE
        assert_eq!(&responses[0][1..3], &[0x81, 0x00]);
        // year(2) month day hour minute second = 7-byte body
        assert_eq!(u16::from_be_bytes([responses[0][3], responses[0][4]]), 7);
    }

    #[test]
    fn it_acks_the_v2_report_only_when_requested() {
        let mut body = BytesMut::new();
        // binary location: date 15/01/24 12:00:00, lat 22°30', lon 114°06'
        body.put_slice(&[0x15, 0x01, 0x24, 0x12, 0x00, 0x00]);
        body.put_slice(&[0x22, 0x30, 0x00, 0x00]); // latitude, 8 bcd digits
        body.put_slice(&[0x11, 0x40, 0x60, 0x00, 0x07]); // longitude 9 digits + flags
        body.put_u8(0x08); // speed, bcd
        body.put_u8(45); // course / 2
        body.put_u8(20); // rssi
        body.put_u8(9); // satellites
        body.put_u32(5); // odometer, km
        body.put_u8(80); // battery level
        body.put_u32(0); // cid
        body.put_u16(0); // lac
        body.put_u8(3); // product
        body.put_u16(0x0020); // status: blocked
        body.put_u16(0x0001); // alarm: overspeed

        let frame = build_frame(
            huabao::MSG_LOCATION_REPORT_2,
            0x8000,
            &[0x05],
            &body,
        );
        let (positions, responses) = decode(frame);

        assert_eq!(positions.len(), 1);
        let position = &positions[0];
        assert!(position.valid());
        assert!((position.latitude() - 22.5).abs() < 1e-9);
        assert!((position.longitude() - (114.0 + 6.0 / 60.0)).abs() < 1e-9);
        assert_eq!(position.speed(), 8.0);
        assert_eq!(position.course(), 90.0);
        assert_eq!(
            position.get(Position::KEY_ALARM).unwrap().as_str(),
            Some("overspeed")
        );
        assert_eq!(
            position.get(Position::KEY_BLOCKED),
            Some(&AttributeValue::Bool(true))
        );

        assert_eq!(responses.len(), 1);
        assert_eq!(&responses[0][1..3], &[0x44, 0x01]);

        // without attribute bit 15 no ack is sent
        let frame = build_frame(huabao::MSG_LOCATION_REPORT_2, 0, &[0x06], &body);
        let (_, responses) = decode(frame);
        assert!(responses.is_empty());
    }

    #[test]
    fn it_decodes_imei_ids_with_a_luhn_suffix() {
        // all-decimal ids pass through unchanged
        assert_eq!(decode_id(&[0x01, 0x23, 0x45, 0x67, 0x89, 0x01]), "012345678901");
        // 0x0868 << 32 | 0x120304a5 = 9243071808677, check digit 8
        let id = [0x08, 0x68, 0x12, 0x03, 0x04, 0xa5];
        assert_eq!(decode_id(&id), "92430718086778");
    }
}
