//! ManPower text protocol
//!
//! Comma-separated sentences prefixed with `simei:`. Coordinates are
//! degree-minute values followed by the hemisphere letter:
//!
//! ```text
//! simei:352581250259539,,,tracker,51,24,1.73,130515221816,A,2233.0655,N,11404.9440,E,0.00,
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

pub const PROTOCOL_NAME: &str = "manpower";

#[derive(Debug, thiserror::Error)]
pub enum SentenceError {
    #[error("truncated sentence")]
    Truncated,
    #[error("missing 'simei:' prefix")]
    MissingPrefix,
    #[error("invalid number: {value}")]
    InvalidNumber { value: String },
    #[error("invalid coordinate: {value} {hemisphere}")]
    InvalidCoordinate { value: String, hemisphere: String },
    #[error("invalid validity flag: {value}")]
    InvalidValidity { value: String },
    #[error("invalid date/time: {value}")]
    InvalidDateTime { value: String },
}

#[derive(Clone, Debug)]
struct Sentence {
    imei: String,
    status: String,
    date: (u32, u32, u32),
    time: (u32, u32, u32),
    valid: bool,
    latitude: f64,
    longitude: f64,
    speed: f64,
}

/// `2233.0655,N` style: fixed-width degrees and decimal minutes in one
/// field, hemisphere in the next.
fn parse_coordinate(value: &str, hemisphere: &str, degree_digits: usize) -> Result<f64, SentenceError> {
    let err = || {
        SentenceError::InvalidCoordinate {
            value: value.to_owned(),
            hemisphere: hemisphere.to_owned(),
        }
    };

    // a missing hemisphere letter reads as positive, which some firmware
    // versions produce for the longitude
    let hemisphere = match hemisphere {
        "" => '+',
        "N" | "S" | "E" | "W" => hemisphere.chars().next().expect("hemisphere is one char"),
        _ => return Err(err()),
    };

    if value.len() < degree_digits {
        return Err(err());
    }
    let degrees: u32 = value[..degree_digits].parse().map_err(|_| err())?;
    let minutes: f64 = value[degree_digits..].parse().map_err(|_| err())?;

    Ok(coordinate_from_deg_min(degrees, minutes, hemisphere))
}

fn parse_timestamp(value: &str) -> Result<((u32, u32, u32), (u32, u32, u32)), SentenceError> {
    let err = || {
        SentenceError::InvalidDateTime {
            value: value.to_owned(),
        }
    };
    if value.len() != 12 || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(err());
    }

    let digits = |range: std::ops::Range<usize>| value[range].parse::<u32>().map_err(|_| err());
    Ok((
        (digits(0..2)?, digits(2..4)?, digits(4..6)?),
        (digits(6..8)?, digits(8..10)?, digits(10..12)?),
    ))
}

impl FromStr for Sentence {
    type Err = SentenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split(',');
        let mut next = || fields.next().ok_or(SentenceError::Truncated);

        let imei = next()?
            .strip_prefix("simei:")
            .ok_or(SentenceError::MissingPrefix)?
            .to_owned();
        if imei.is_empty() || !imei.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(SentenceError::InvalidNumber { value: imei });
        }

        next()?;
        next()?;
        let status = next()?.to_owned();
        next()?;
        next()?;
        next()?;

        let (date, time) = parse_timestamp(next()?)?;

        let validity = next()?;
        let valid = match validity {
            "A" => true,
            "V" => false,
            _ => {
                return Err(SentenceError::InvalidValidity {
                    value: validity.to_owned(),
                });
            }
        };

        let latitude_value = next()?.to_owned();
        let latitude = parse_coordinate(&latitude_value, next()?, 2)?;
        let longitude_value = next()?.to_owned();
        let longitude = parse_coordinate(&longitude_value, next()?, 3)?;

        let speed_value = next()?;
        let speed = speed_value.parse().map_err(|_| {
            SentenceError::InvalidNumber {
                value: speed_value.to_owned(),
            }
        })?;

        Ok(Self {
            imei,
            status,
            date,
            time,
            valid,
            latitude,
            longitude,
            speed,
        })
    }
}

#[derive(Debug, Default)]
pub struct ManPowerDecoder;

impl MessageDecoder for ManPowerDecoder {
    fn decode(&mut self, ctx: &mut DecodeContext<'_>, frame: Bytes) -> Result<Vec<Position>, DecodeError> {
        let text = std::str::from_utf8(&frame).map_err(|error| {
            DecodeError::InvalidMessage {
                reason: format!("non-utf8 sentence: {error}"),
            }
        })?;

        let sentence: Sentence = text.parse()?;

        let Some(session) = ctx.device_session(Some(&sentence.imei)) else {
            return Ok(Vec::new());
        };

        let mut position = Position::new(PROTOCOL_NAME);
        position.set_device_id(session.device_id());

        position.set(Position::KEY_STATUS, sentence.status);
        position.set_time(
            DateBuilder::new(utc_offset())
                .year(sentence.date.0)
                .month(sentence.date.1)
                .day(sentence.date.2)
                .time(sentence.time.0, sentence.time.1, sentence.time.2)
                .build()?,
        );
        position.set_valid(sentence.valid);
        position.set_latitude_wgs84(sentence.latitude)?;
        position.set_longitude_wgs84(sentence.longitude)?;
        position.set_speed(sentence.speed);

        Ok(vec![position])
    }
}

#[derive(Debug, Default)]
pub struct ManPowerProtocol;

impl Protocol for ManPowerProtocol {
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
        Box::new(ManPowerDecoder)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

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
        "simei:352581250259539,,,tracker,51,24,1.73,130515221816,A,2233.0655,N,11404.9440,E,0.00,";

    #[test]
    fn it_parses_the_example() {
        let sentence: Sentence = EXAMPLE.parse().unwrap();
        assert_eq!(sentence.imei, "352581250259539");
        assert_eq!(sentence.status, "tracker");
        assert!(sentence.valid);
        assert!((sentence.latitude - (22.0 + 33.0655 / 60.0)).abs() < 1e-9);
        assert!((sentence.longitude - (114.0 + 4.944 / 60.0)).abs() < 1e-9);
        assert_eq!(sentence.speed, 0.0);
    }

    #[test]
    fn it_rejects_garbage() {
        assert!("simei:abc,,,t,1,2,3,130515221816,A,1.0,N,2.0,E,0".parse::<Sentence>().is_err());
        assert!("nonsense".parse::<Sentence>().is_err());
        assert!(
            "simei:123,,,t,1,2,3,130515221816,X,2233.0655,N,11404.9440,E,0"
                .parse::<Sentence>()
                .is_err()
        );
    }

    #[test]
    fn it_decodes_a_position() {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.add("352581250259539", None);
        let sessions = SessionRegistry::new(directory, false);
        let config = ProtocolConfig::default();
        let endpoint = Endpoint::new(1, "10.0.0.3:7001".parse().unwrap());
        let mut ctx = DecodeContext::new(&sessions, endpoint, &config);

        let positions = ManPowerDecoder
            .decode(&mut ctx, Bytes::from_static(EXAMPLE.as_bytes()))
            .unwrap();

        assert_eq!(positions.len(), 1);
        let position = &positions[0];

        assert!(position.valid());
        assert_eq!(
            position.fix_time().unwrap().to_rfc3339(),
            "2013-05-15T22:18:16+00:00"
        );
        // Shenzhen is inside the conversion rectangle
        assert!((position.latitude_wgs84() - (22.0 + 33.0655 / 60.0)).abs() < 1e-9);
        assert_ne!(position.latitude(), position.latitude_wgs84());
        assert!((position.latitude() - position.latitude_wgs84()).abs() < 0.01);
    }
}
