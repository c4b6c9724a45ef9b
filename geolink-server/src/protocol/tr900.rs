//! TR900 text protocol
//!
//! Comma-separated ASCII sentences, one per line, starting with `>` and the
//! device id. Coordinates are hemisphere-prefixed degree-minute values,
//! longitude before latitude:
//!
//! ```text
//! >12345,1,1,140115,120000,E11424.0000,N2230.0000,,12.5,90,18,0,3-95,0,1,2
//! ```

use std::str::FromStr;

use bytes::Bytes;
use geolink_types::Position;

use crate::{
    protocol::{
        DecodeContext,
        DecodeError,
        FrameDecoder,
        FrameEncoder,
        IdentityFrameEncoder,
        LineFrameDecoder,
        MessageDecoder,
        Protocol,
    },
    util::{
        DateBuilder,
        coordinate_from_deg_min,
        utc_offset,
    },
};

pub const PROTOCOL_NAME: &str = "tr900";

#[derive(Debug, thiserror::Error)]
pub enum SentenceError {
    #[error("truncated sentence")]
    Truncated,
    #[error("missing '>' prefix")]
    MissingPrefix,
    #[error("invalid number: {value}")]
    InvalidNumber { value: String },
    #[error("invalid coordinate: {value}")]
    InvalidCoordinate { value: String },
    #[error("invalid date/time: {value}")]
    InvalidDateTime { value: String },
}

#[derive(Clone, Debug)]
struct Sentence {
    id: String,
    valid: bool,
    date: (u32, u32, u32),
    time: (u32, u32, u32),
    longitude: f64,
    latitude: f64,
    speed: f64,
    course: f64,
    rssi: f64,
    event: i64,
    adc1: i64,
    battery: i64,
    input: String,
    status: String,
}

fn parse_number<T: FromStr>(value: &str) -> Result<T, SentenceError> {
    value.parse().map_err(|_| {
        SentenceError::InvalidNumber {
            value: value.to_owned(),
        }
    })
}

/// `E11424.0000` style: hemisphere letter, fixed-width degrees, decimal
/// minutes.
fn parse_coordinate(value: &str, degree_digits: usize) -> Result<f64, SentenceError> {
    let err = || {
        SentenceError::InvalidCoordinate {
            value: value.to_owned(),
        }
    };

    let hemisphere = value.chars().next().ok_or_else(err)?;
    if !matches!(hemisphere, 'N' | 'S' | 'E' | 'W') {
        return Err(err());
    }

    let rest = &value[1..];
    if rest.len() < degree_digits {
        return Err(err());
    }
    let degrees: u32 = rest[..degree_digits].parse().map_err(|_| err())?;
    let minutes: f64 = rest[degree_digits..].parse().map_err(|_| err())?;

    Ok(coordinate_from_deg_min(degrees, minutes, hemisphere))
}

fn split_pair(value: &str, separator: char) -> Result<(&str, &str), SentenceError> {
    value.split_once(separator).ok_or_else(|| {
        SentenceError::InvalidNumber {
            value: value.to_owned(),
        }
    })
}

fn parse_digits(value: &str) -> Result<(u32, u32, u32), SentenceError> {
    let err = || {
        SentenceError::InvalidDateTime {
            value: value.to_owned(),
        }
    };
    if value.len() != 6 || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(err());
    }
    Ok((
        value[0..2].parse().map_err(|_| err())?,
        value[2..4].parse().map_err(|_| err())?,
        value[4..6].parse().map_err(|_| err())?,
    ))
}

impl FromStr for Sentence {
    type Err = SentenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split(',');
        let mut next = || fields.next().ok_or(SentenceError::Truncated);

        let id = next()?
            .strip_prefix('>')
            .ok_or(SentenceError::MissingPrefix)?
            .to_owned();
        next()?; // reporting period
        let valid = parse_number::<u32>(next()?)? == 1;
        let date = parse_digits(next()?)?;
        let time = parse_digits(next()?)?;
        let longitude = parse_coordinate(next()?, 3)?;
        let latitude = parse_coordinate(next()?, 2)?;
        next()?; // command echo
        let speed = parse_number(next()?)?;
        let course = parse_number(next()?)?;
        let rssi = parse_number(next()?)?;
        let event = parse_number(next()?)?;
        let (adc1, battery) = split_pair(next()?, '-')?;
        let adc1 = parse_number(adc1)?;
        let battery = parse_number(battery)?;
        next()?; // impulses
        let input = next()?.to_owned();
        let status = next()?.to_owned();

        Ok(Self {
            id,
            valid,
            date,
            time,
            longitude,
            latitude,
            speed,
            course,
            rssi,
            event,
            adc1,
            battery,
            input,
            status,
        })
    }
}

#[derive(Debug, Default)]
pub struct Tr900Decoder;

impl MessageDecoder for Tr900Decoder {
    fn decode(&mut self, ctx: &mut DecodeContext<'_>, frame: Bytes) -> Result<Vec<Position>, DecodeError> {
        let text = std::str::from_utf8(&frame).map_err(|error| {
            DecodeError::InvalidMessage {
                reason: format!("non-utf8 sentence: {error}"),
            }
        })?;

        let sentence: Sentence = text.parse()?;

        let Some(session) = ctx.device_session(Some(&sentence.id)) else {
            return Ok(Vec::new());
        };

        let mut position = Position::new(PROTOCOL_NAME);
        position.set_device_id(session.device_id());

        position.set_valid(sentence.valid);
        position.set_time(
            DateBuilder::new(utc_offset())
                .year(sentence.date.0)
                .month(sentence.date.1)
                .day(sentence.date.2)
                .time(sentence.time.0, sentence.time.1, sentence.time.2)
                .build()?,
        );

        position.set_longitude_wgs84(sentence.longitude)?;
        position.set_latitude_wgs84(sentence.latitude)?;
        position.set_speed(sentence.speed);
        position.set_course(sentence.course);

        position.set(Position::KEY_RSSI, sentence.rssi);
        position.set(Position::KEY_EVENT, sentence.event);
        position.set_indexed(Position::PREFIX_ADC, 1, sentence.adc1);
        position.set(Position::KEY_BATTERY, sentence.battery);
        position.set(Position::KEY_INPUT, sentence.input);
        position.set(Position::KEY_STATUS, sentence.status);

        Ok(vec![position])
    }
}

#[derive(Debug, Default)]
pub struct Tr900Protocol;

impl Protocol for Tr900Protocol {
    fn name(&self) -> &'static str {
        PROTOCOL_NAME
    }

    fn create_frame_decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(LineFrameDecoder::new())
    }

    fn create_frame_encoder(&self) -> Box<dyn FrameEncoder> {
        Box::new(IdentityFrameEncoder)
    }

    fn create_decoder(&self) -> Box<dyn MessageDecoder> {
        Box::new(Tr900Decoder)
    }
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

    const EXAMPLE: &str =
        ">123456789012345,1,1,140115,120000,E11424.0000,N2230.0000,,12.5,90,18,5,3-95,0,1,2";

    #[test]
    fn it_parses_the_example() {
        let sentence: Sentence = EXAMPLE.parse().unwrap();
        assert_eq!(sentence.id, "123456789012345");
        assert!(sentence.valid);
        assert!((sentence.longitude - 114.4).abs() < 1e-9);
        assert!((sentence.latitude - 22.5).abs() < 1e-9);
        assert_eq!(sentence.speed, 12.5);
        assert_eq!(sentence.course, 90.0);
        assert_eq!(sentence.battery, 95);
    }

    #[test]
    fn it_rejects_garbage() {
        assert!("hello world".parse::<Sentence>().is_err());
        assert!(">123,1".parse::<Sentence>().is_err());
        assert!(
            ">123,1,1,140115,120000,X11424.0000,N2230.0000,,1,2,3,4,5-6,7,8,9"
                .parse::<Sentence>()
                .is_err()
        );
    }

    #[test]
    fn it_decodes_a_position_with_converted_coordinates() {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.add("123456789012345", None);
        let sessions = SessionRegistry::new(directory, false);
        let config = ProtocolConfig::default();
        let endpoint = Endpoint::new(1, "10.0.0.2:7000".parse().unwrap());
        let mut ctx = DecodeContext::new(&sessions, endpoint, &config);

        let positions = Tr900Decoder
            .decode(&mut ctx, Bytes::from_static(EXAMPLE.as_bytes()))
            .unwrap();

        assert_eq!(positions.len(), 1);
        let position = &positions[0];

        assert!(position.valid());
        assert_eq!(
            position.fix_time().unwrap().to_rfc3339(),
            "2014-01-15T12:00:00+00:00"
        );
        // raw WGS-84 values are preserved...
        assert_eq!(position.latitude_wgs84(), 22.5);
        assert_eq!(position.longitude_wgs84(), 114.4);
        // ...and the published point is shifted, since this is inside China
        assert_ne!(position.latitude(), 22.5);
        assert!((position.latitude() - 22.5).abs() < 0.01);
        assert!((position.longitude() - 114.4).abs() < 0.01);
        assert_eq!(
            position.get(Position::KEY_BATTERY),
            Some(&AttributeValue::Integer(95))
        );
        assert_eq!(
            position.get(Position::KEY_INPUT),
            Some(&AttributeValue::String("1".to_owned()))
        );
    }
}
