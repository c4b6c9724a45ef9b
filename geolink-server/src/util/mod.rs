//! Byte-level and unit helpers shared by the protocol decoders.

use bytes::{
    Buf,
    Bytes,
    TryGetError,
};
use chrono::{
    DateTime,
    FixedOffset,
    LocalResult,
    TimeZone,
    Utc,
};

/// Reads a fixed-size byte array off a [`Buf`].
pub trait BufReadBytesExt {
    fn get_bytes<const N: usize>(&mut self) -> [u8; N];

    fn try_get_bytes<const N: usize>(&mut self) -> Result<[u8; N], TryGetError>;
}

impl<B: Buf> BufReadBytesExt for B {
    fn get_bytes<const N: usize>(&mut self) -> [u8; N] {
        let mut data: [u8; N] = [0; N];
        self.copy_to_slice(&mut data[..]);
        data
    }

    fn try_get_bytes<const N: usize>(&mut self) -> Result<[u8; N], TryGetError> {
        let mut data: [u8; N] = [0; N];
        self.try_copy_to_slice(&mut data[..])?;
        Ok(data)
    }
}

/// Reads a binary-coded-decimal integer of the given digit count.
///
/// For an odd digit count the final digit is the high nibble of the next
/// byte, which is peeked but not consumed (the low nibble belongs to the
/// following field).
pub fn read_bcd(buf: &mut impl Buf, digits: u32) -> Result<u64, TryGetError> {
    let mut result = 0u64;
    for _ in 0..digits / 2 {
        let byte = buf.try_get_u8()?;
        result = result * 10 + u64::from(byte >> 4);
        result = result * 10 + u64::from(byte & 0x0f);
    }
    if digits % 2 != 0 {
        let byte = *buf.chunk().first().ok_or(TryGetError {
            requested: 1,
            available: 0,
        })?;
        result = result * 10 + u64::from(byte >> 4);
    }
    Ok(result)
}

/// Reads `length` bytes as text. Non-UTF-8 bytes are replaced, which
/// matches how devices abuse these fields in practice.
pub fn read_string(buf: &mut Bytes, length: usize) -> Result<String, TryGetError> {
    if buf.len() < length {
        return Err(TryGetError {
            requested: length,
            available: buf.len(),
        });
    }
    Ok(String::from_utf8_lossy(&buf.split_to(length)).into_owned())
}

/// XOR over all bytes; the checksum used by the binary envelope.
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |checksum, byte| checksum ^ byte)
}

/// Luhn check digit for an IMEI body. Digits are doubled starting from the
/// least significant one.
pub fn luhn_check_digit(mut value: u64) -> u8 {
    let mut checksum = 0u64;
    while value != 0 {
        let digit = value % 10;
        checksum += if digit * 2 > 9 { digit * 2 - 9 } else { digit * 2 };
        value /= 10;
        checksum += value % 10;
        value /= 10;
    }
    ((10 - checksum % 10) % 10) as u8
}

/// Whether the given bit is set.
pub fn bit_check(value: u64, index: u32) -> bool {
    value & (1u64 << index) != 0
}

/// The low `bits` bits of the value.
pub fn bits_to(value: u64, bits: u32) -> u64 {
    value & ((1u64 << bits) - 1)
}

/// A 16-bit quantity with the sign in bit 15 and the magnitude in the low
/// 15 bits.
pub fn signed_magnitude_word(value: u16) -> i32 {
    let magnitude = i32::from(value & 0x7fff);
    if bit_check(value.into(), 15) {
        -magnitude
    }
    else {
        magnitude
    }
}

const KNOTS_PER_KPH: f64 = 0.539957;

pub fn knots_from_kph(kph: f64) -> f64 {
    kph * KNOTS_PER_KPH
}

pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[derive(Debug, thiserror::Error)]
#[error("invalid hex string: {input}")]
pub struct ParseHexError {
    pub input: String,
}

pub fn parse_hex(input: &str) -> Result<Vec<u8>, ParseHexError> {
    let err = || {
        ParseHexError {
            input: input.to_owned(),
        }
    };

    if input.len() % 2 != 0 {
        return Err(err());
    }

    (0..input.len())
        .step_by(2)
        .map(|index| u8::from_str_radix(&input[index..index + 2], 16).map_err(|_| err()))
        .collect()
}

/// Degree + decimal-minute coordinate with a hemisphere letter. `S` and `W`
/// make the result negative.
pub fn coordinate_from_deg_min(degrees: u32, minutes: f64, hemisphere: char) -> f64 {
    let value = f64::from(degrees) + minutes / 60.0;
    match hemisphere {
        'S' | 'W' => -value,
        _ => value,
    }
}

pub fn utc_offset() -> FixedOffset {
    FixedOffset::east_opt(0).expect("UTC is a valid offset")
}

#[derive(Debug, thiserror::Error)]
#[error("invalid date/time: {year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}")]
pub struct InvalidDateTime {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

/// Builds a UTC instant from device-reported calendar fields in the
/// device's timezone.
#[derive(Clone, Copy, Debug)]
pub struct DateBuilder {
    timezone: FixedOffset,
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
}

impl DateBuilder {
    pub fn new(timezone: FixedOffset) -> Self {
        Self {
            timezone,
            year: 1970,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
        }
    }

    /// Accepts two-digit years; values below 70 land in the 2000s.
    pub fn year(mut self, year: u32) -> Self {
        let mut year = year as i32;
        if year < 100 {
            year += 1900;
            if year < 1970 {
                year += 100;
            }
        }
        self.year = year;
        self
    }

    pub fn month(mut self, month: u32) -> Self {
        self.month = month;
        self
    }

    pub fn day(mut self, day: u32) -> Self {
        self.day = day;
        self
    }

    pub fn time(mut self, hour: u32, minute: u32, second: u32) -> Self {
        self.hour = hour;
        self.minute = minute;
        self.second = second;
        self
    }

    pub fn build(self) -> Result<DateTime<Utc>, InvalidDateTime> {
        match self
            .timezone
            .with_ymd_and_hms(self.year, self.month, self.day, self.hour, self.minute, self.second)
        {
            LocalResult::Single(time) => Ok(time.with_timezone(&Utc)),
            _ => {
                Err(InvalidDateTime {
                    year: self.year,
                    month: self.month,
                    day: self.day,
                    hour: self.hour,
                    minute: self.minute,
                    second: self.second,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn it_reads_even_bcd() {
        let mut buf = Bytes::from_static(&[0x24, 0x01, 0x15]);
        assert_eq!(read_bcd(&mut buf, 2).unwrap(), 24);
        assert_eq!(read_bcd(&mut buf, 4).unwrap(), 115);
    }

    #[test]
    fn it_peeks_the_odd_bcd_nibble() {
        let mut buf = Bytes::from_static(&[0x12, 0x34, 0x5f]);
        assert_eq!(read_bcd(&mut buf, 5).unwrap(), 12345);
        // the byte holding the fifth digit was not consumed
        assert_eq!(buf.get_u8(), 0x5f);
    }

    #[test]
    fn it_computes_the_xor_checksum() {
        assert_eq!(xor_checksum(&[0x01, 0x02, 0x03]), 0x00);
        assert_eq!(xor_checksum(&[0x81, 0x00, 0x00, 0x0a]), 0x8b);
    }

    #[test]
    fn it_computes_the_luhn_check_digit() {
        // reference IMEI: 49015420323751 -> check digit 8
        assert_eq!(luhn_check_digit(49015420323751), 8);
        assert_eq!(luhn_check_digit(35675107001239), 6);
    }

    #[test]
    fn it_interprets_signed_magnitude_words() {
        assert_eq!(signed_magnitude_word(0x0005), 5);
        assert_eq!(signed_magnitude_word(0x8005), -5);
        assert_eq!(signed_magnitude_word(0x7fff), 32767);
    }

    #[test]
    fn it_converts_coordinates() {
        let value = coordinate_from_deg_min(114, 3.0, 'E');
        assert!((value - 114.05).abs() < 1e-9);
        assert!(coordinate_from_deg_min(22, 30.0, 'S') < 0.0);
    }

    #[test]
    fn it_builds_dates_in_a_device_timezone() {
        let timezone = FixedOffset::east_opt(8 * 3600).unwrap();
        let time = DateBuilder::new(timezone)
            .year(24)
            .month(1)
            .day(15)
            .time(12, 0, 0)
            .build()
            .unwrap();
        assert_eq!(time.to_rfc3339(), "2024-01-15T04:00:00+00:00");
    }

    #[test]
    fn it_parses_hex() {
        assert_eq!(parse_hex("7e0a").unwrap(), vec![0x7e, 0x0a]);
        assert!(parse_hex("7e0").is_err());
        assert!(parse_hex("zz").is_err());
    }
}
