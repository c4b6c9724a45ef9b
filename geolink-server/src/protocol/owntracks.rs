//! OwnTracks protocol
//!
//! JSON location records over HTTP POST. Devices are identified by the
//! `tid` field; everything except `lat`, `lon` and `tst` is optional. The
//! reply is an empty 200, or 400 when the device is unknown or the payload
//! is malformed.
//!
//! - [Payload reference][1]
//!
//! [1]: https://owntracks.org/booklet/tech/json/

use std::{
    net::SocketAddr,
    sync::Arc,
};

use axum::{
    Router,
    extract::{
        ConnectInfo,
        State,
    },
    http::StatusCode,
    routing::post,
};
use bytes::Bytes;
use chrono::DateTime;
use geolink_types::Position;
use serde_json::Value;

use crate::{
    pipeline::PositionPipeline,
    protocol::DecodeError,
    session::{
        DeviceSession,
        Endpoint,
        SessionRegistry,
    },
    util::knots_from_kph,
};

pub const PROTOCOL_NAME: &str = "owntracks";

#[derive(Debug)]
pub enum Outcome {
    /// Not a location record; acknowledged and discarded.
    Ignored,
    /// The `tid` is not a known device.
    UnknownDevice,
    Position {
        session: DeviceSession,
        position: Position,
    },
}

pub fn decode_message(
    sessions: &SessionRegistry,
    endpoint: Endpoint,
    payload: &[u8],
) -> Result<Outcome, DecodeError> {
    let root: Value = serde_json::from_slice(payload)?;

    if root.get("_type").and_then(Value::as_str) != Some("location") {
        return Ok(Outcome::Ignored);
    }

    let unique_id = root
        .get("tid")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("tid"))?;

    let Some(session) = sessions.device_session(endpoint, Some(unique_id)) else {
        return Ok(Outcome::UnknownDevice);
    };

    let mut position = Position::new(PROTOCOL_NAME);
    position.set_device_id(session.device_id());

    let timestamp = root
        .get("tst")
        .and_then(Value::as_i64)
        .ok_or_else(|| missing("tst"))?;
    position.set_fix_time(
        DateTime::from_timestamp(timestamp, 0).ok_or_else(|| {
            DecodeError::InvalidMessage {
                reason: format!("timestamp out of range: {timestamp}"),
            }
        })?,
    );
    if let Some(sent) = root.get("sent").and_then(Value::as_i64) {
        position.set_device_time(DateTime::from_timestamp(sent, 0).ok_or_else(|| {
            DecodeError::InvalidMessage {
                reason: format!("timestamp out of range: {sent}"),
            }
        })?);
    }

    position.set_valid(true);

    let latitude = root
        .get("lat")
        .and_then(Value::as_f64)
        .ok_or_else(|| missing("lat"))?;
    let longitude = root
        .get("lon")
        .and_then(Value::as_f64)
        .ok_or_else(|| missing("lon"))?;
    position.set_latitude_wgs84(latitude)?;
    position.set_longitude_wgs84(longitude)?;

    if let Some(velocity) = root.get("vel").and_then(Value::as_f64) {
        position.set_speed(knots_from_kph(velocity));
    }
    if let Some(altitude) = root.get("alt").and_then(Value::as_f64) {
        position.set_altitude(altitude);
    }
    if let Some(course) = root.get("cog").and_then(Value::as_f64) {
        position.set_course(course);
    }
    if let Some(accuracy) = root.get("acc").and_then(Value::as_f64) {
        position.set_accuracy(accuracy);
    }
    if let Some(event) = root.get("t").and_then(Value::as_str) {
        let report_type = root.get("rty").and_then(Value::as_i64).unwrap_or(-1);
        decode_alarm(&mut position, event, report_type);
        position.set(Position::KEY_EVENT, event);
    }
    if let Some(battery) = root.get("batt").and_then(Value::as_i64) {
        position.set(Position::KEY_BATTERY_LEVEL, battery);
    }
    if let Some(power) = root.get("uext").and_then(Value::as_f64) {
        position.set(Position::KEY_POWER, power);
    }
    if let Some(battery) = root.get("ubatt").and_then(Value::as_f64) {
        position.set(Position::KEY_BATTERY, battery);
    }
    if let Some(vin) = root.get("vin").and_then(Value::as_str) {
        position.set(Position::KEY_VIN, vin);
    }
    if let Some(name) = root.get("name").and_then(Value::as_str) {
        position.set(Position::KEY_VIN, name);
    }
    if let Some(rpm) = root.get("rpm").and_then(Value::as_i64) {
        position.set(Position::KEY_RPM, rpm);
    }
    if let Some(ignition) = root.get("ign").and_then(Value::as_bool) {
        position.set(Position::KEY_IGNITION, ignition);
    }
    if let Some(motion) = root.get("motion").and_then(Value::as_bool) {
        position.set(Position::KEY_MOTION, motion);
    }
    if let Some(odometer) = root.get("odometer").and_then(Value::as_f64) {
        position.set(Position::KEY_ODOMETER, odometer * 1000.0);
    }
    if let Some(hours) = root.get("hmc").and_then(Value::as_f64) {
        position.set(Position::KEY_HOURS, hours / 3600.0);
    }

    if let Some(input_count) = root.get("anum").and_then(Value::as_i64) {
        for index in 0..input_count {
            let adc_key = format!("adda-{index:02}");
            if let Some(adc) = root.get(adc_key.as_str()).and_then(Value::as_str) {
                position.set_indexed(Position::PREFIX_ADC, index as usize + 1, adc);
            }
            let temperature_key = format!("temp_c-{index:02}");
            if let Some(temperature) = root.get(temperature_key.as_str()).and_then(Value::as_f64) {
                position.set_indexed(Position::PREFIX_TEMP, index as usize + 1, temperature);
            }
        }
    }

    Ok(Outcome::Position { session, position })
}

/// The `t` field is a single event letter; `h` (harsh driving) is refined
/// by the `rty` report type.
fn decode_alarm(position: &mut Position, event: &str, report_type: i64) {
    match event {
        "9" => position.add_alarm(Position::ALARM_LOW_BATTERY),
        "1" => position.add_alarm(Position::ALARM_POWER_ON),
        "i" => position.set(Position::KEY_IGNITION, true),
        "I" => position.set(Position::KEY_IGNITION, false),
        "E" => position.add_alarm(Position::ALARM_POWER_RESTORED),
        "e" => position.add_alarm(Position::ALARM_POWER_CUT),
        "!" => position.add_alarm(Position::ALARM_TOW),
        "s" => position.add_alarm(Position::ALARM_OVERSPEED),
        "h" => {
            match report_type {
                0 | 3 => position.add_alarm(Position::ALARM_BRAKING),
                1 | 4 => position.add_alarm(Position::ALARM_ACCELERATION),
                2 | 5 => position.add_alarm(Position::ALARM_CORNERING),
                _ => {}
            }
        }
        _ => {}
    }
}

fn missing(field: &str) -> DecodeError {
    DecodeError::InvalidMessage {
        reason: format!("missing field: {field}"),
    }
}

#[derive(Clone)]
pub struct OwnTracksState {
    pub sessions: Arc<SessionRegistry>,
    pub pipeline: PositionPipeline,
}

pub fn router(state: OwnTracksState) -> Router {
    Router::new().route("/", post(handle_post)).with_state(state)
}

async fn handle_post(
    State(state): State<OwnTracksState>,
    ConnectInfo(address): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> StatusCode {
    let endpoint = Endpoint::new(0, address);

    match decode_message(&state.sessions, endpoint, &body) {
        Ok(Outcome::Position { session, position }) => {
            session.store_last_location(&position);
            state.pipeline.forward(position).await;
            StatusCode::OK
        }
        Ok(Outcome::Ignored) => StatusCode::OK,
        Ok(Outcome::UnknownDevice) => StatusCode::BAD_REQUEST,
        Err(error) => {
            tracing::debug!(?error, "invalid owntracks payload");
            StatusCode::BAD_REQUEST
        }
    }
}

#[cfg(test)]
mod tests {
    use geolink_types::position::AttributeValue;

    use super::*;
    use crate::session::InMemoryDirectory;

    fn sessions() -> SessionRegistry {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.add("AB", None);
        SessionRegistry::new(directory, false)
    }

    fn endpoint() -> Endpoint {
        Endpoint::new(0, "192.0.2.1:54000".parse().unwrap())
    }

    #[test]
    fn it_decodes_a_location_record() {
        let payload = br#"{"_type":"location","tid":"AB","tst":1700000000,"lat":50.0,"lon":10.0,"vel":72,"batt":85,"t":"s"}"#;

        let outcome = decode_message(&sessions(), endpoint(), payload).unwrap();
        let Outcome::Position { position, .. } = outcome else {
            panic!("expected a position");
        };

        assert!(position.valid());
        assert!(position.device_time().is_none());
        assert_eq!(
            position.fix_time().unwrap().to_rfc3339(),
            "2023-11-14T22:13:20+00:00"
        );
        // outside China the published point equals the raw one
        assert_eq!(position.latitude(), 50.0);
        assert_eq!(position.longitude(), 10.0);
        assert!((position.speed() - knots_from_kph(72.0)).abs() < 1e-9);
        assert_eq!(
            position.get(Position::KEY_BATTERY_LEVEL),
            Some(&AttributeValue::Integer(85))
        );
        assert_eq!(
            position.get(Position::KEY_EVENT),
            Some(&AttributeValue::String("s".to_owned()))
        );
        assert_eq!(
            position.get(Position::KEY_ALARM).unwrap().as_str(),
            Some("overspeed")
        );
    }

    #[test]
    fn it_ignores_non_location_records() {
        let payload = br#"{"_type":"lwt","tid":"AB"}"#;
        assert!(matches!(
            decode_message(&sessions(), endpoint(), payload).unwrap(),
            Outcome::Ignored
        ));
    }

    #[test]
    fn it_rejects_unknown_devices() {
        let payload = br#"{"_type":"location","tid":"ZZ","tst":1700000000,"lat":1.0,"lon":2.0}"#;
        assert!(matches!(
            decode_message(&sessions(), endpoint(), payload).unwrap(),
            Outcome::UnknownDevice
        ));
    }

    #[test]
    fn it_maps_harsh_driving_events() {
        let payload = br#"{"_type":"location","tid":"AB","tst":1700000000,"lat":1.0,"lon":2.0,"t":"h","rty":4}"#;
        let Outcome::Position { position, .. } =
            decode_message(&sessions(), endpoint(), payload).unwrap()
        else {
            panic!("expected a position");
        };
        assert_eq!(
            position.get(Position::KEY_ALARM).unwrap().as_str(),
            Some("hardAcceleration")
        );
    }

    #[test]
    fn it_decodes_indexed_channels() {
        let payload = br#"{"_type":"location","tid":"AB","tst":1700000000,"lat":1.0,"lon":2.0,"anum":2,"adda-00":"1.2","temp_c-01":21.5}"#;
        let Outcome::Position { position, .. } =
            decode_message(&sessions(), endpoint(), payload).unwrap()
        else {
            panic!("expected a position");
        };
        assert_eq!(
            position.get("adc1"),
            Some(&AttributeValue::String("1.2".to_owned()))
        );
        assert_eq!(position.get("temp2"), Some(&AttributeValue::Double(21.5)));
    }
}
