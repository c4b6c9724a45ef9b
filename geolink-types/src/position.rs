//! Normalized position record
//!
//! Every protocol decoder produces [`Position`] values. The record carries
//! the fix itself (coordinates, validity, times, motion vector) plus an open
//! string-keyed attribute bag for everything else a device reports. Keys
//! that have a conventional meaning are listed as associated constants; any
//! other key is allowed.

use std::collections::BTreeMap;

use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    DeviceId,
    geo,
    network::Network,
};

#[derive(Debug, thiserror::Error)]
pub enum CoordinateError {
    #[error("latitude out of range: {value}")]
    LatitudeOutOfRange { value: f64 },
    #[error("longitude out of range: {value}")]
    LongitudeOutOfRange { value: f64 },
}

/// A scalar attribute value.
///
/// The attribute bag is schemaless at the decoder layer; consumers decide
/// what to do with each key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Integer(i64),
    Double(f64),
    String(String),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(value) => Some(*value as f64),
            Self::Double(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<i16> for AttributeValue {
    fn from(value: i16) -> Self {
        Self::Integer(value.into())
    }
}

impl From<u8> for AttributeValue {
    fn from(value: u8) -> Self {
        Self::Integer(value.into())
    }
}

impl From<u16> for AttributeValue {
    fn from(value: u16) -> Self {
        Self::Integer(value.into())
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<u64> for AttributeValue {
    fn from(value: u64) -> Self {
        Self::Integer(value as i64)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Position {
    protocol: String,
    device_id: DeviceId,

    server_time: DateTime<Utc>,
    device_time: Option<DateTime<Utc>>,
    fix_time: Option<DateTime<Utc>>,

    valid: bool,
    outdated: bool,

    /// Published coordinates, GCJ-02 inside China.
    latitude: f64,
    longitude: f64,

    /// Raw device-reported coordinates.
    latitude_wgs84: f64,
    longitude_wgs84: f64,

    // latches for the pair-gated datum conversion
    #[serde(skip)]
    latitude_pending: bool,
    #[serde(skip)]
    longitude_pending: bool,

    /// In meters.
    altitude: f64,
    /// In knots.
    speed: f64,
    /// In degrees.
    course: f64,
    /// In meters.
    accuracy: f64,

    address: Option<String>,
    network: Option<Network>,
    geofence_ids: Option<Vec<i64>>,

    attributes: BTreeMap<String, AttributeValue>,
}

impl Position {
    pub const KEY_HDOP: &'static str = "hdop";
    pub const KEY_VDOP: &'static str = "vdop";
    pub const KEY_PDOP: &'static str = "pdop";
    pub const KEY_SATELLITES: &'static str = "satellites";
    pub const KEY_RSSI: &'static str = "rssi";
    pub const KEY_EVENT: &'static str = "event";
    pub const KEY_ALARM: &'static str = "alarm";
    pub const KEY_STATUS: &'static str = "status";
    /// In meters.
    pub const KEY_ODOMETER: &'static str = "odometer";
    pub const KEY_ODOMETER_SERVICE: &'static str = "serviceOdometer";
    pub const KEY_ODOMETER_TRIP: &'static str = "tripOdometer";
    /// In milliseconds.
    pub const KEY_HOURS: &'static str = "hours";
    pub const KEY_INPUT: &'static str = "input";
    pub const KEY_OUTPUT: &'static str = "output";
    /// In volts.
    pub const KEY_POWER: &'static str = "power";
    /// In volts.
    pub const KEY_BATTERY: &'static str = "battery";
    /// In percent.
    pub const KEY_BATTERY_LEVEL: &'static str = "batteryLevel";
    pub const KEY_FUEL: &'static str = "fuel";
    pub const KEY_FUEL_USED: &'static str = "fuelUsed";
    pub const KEY_FUEL_CONSUMPTION: &'static str = "fuelConsumption";
    pub const KEY_FUEL_LEVEL: &'static str = "fuelLevel";
    pub const KEY_IGNITION: &'static str = "ignition";
    pub const KEY_MOTION: &'static str = "motion";
    pub const KEY_CHARGE: &'static str = "charge";
    pub const KEY_BLOCKED: &'static str = "blocked";
    pub const KEY_DOOR: &'static str = "door";
    pub const KEY_RPM: &'static str = "rpm";
    pub const KEY_THROTTLE: &'static str = "throttle";
    pub const KEY_ENGINE_LOAD: &'static str = "engineLoad";
    pub const KEY_ENGINE_TEMP: &'static str = "engineTemp";
    pub const KEY_COOLANT_TEMP: &'static str = "coolantTemp";
    pub const KEY_DEVICE_TEMP: &'static str = "deviceTemp";
    pub const KEY_HUMIDITY: &'static str = "humidity";
    /// In km/h.
    pub const KEY_OBD_SPEED: &'static str = "obdSpeed";
    /// In meters.
    pub const KEY_OBD_ODOMETER: &'static str = "obdOdometer";
    pub const KEY_VIN: &'static str = "vin";
    pub const KEY_ICCID: &'static str = "iccid";
    pub const KEY_DTCS: &'static str = "dtcs";
    pub const KEY_CARD: &'static str = "card";
    pub const KEY_DRIVER_UNIQUE_ID: &'static str = "driverUniqueId";
    pub const KEY_RESULT: &'static str = "result";
    pub const KEY_ARCHIVE: &'static str = "archive";
    pub const KEY_APPROXIMATE: &'static str = "approximate";
    pub const KEY_GEOFENCE: &'static str = "geofence";
    pub const KEY_G_SENSOR: &'static str = "gSensor";

    // indexed attribute prefixes, starting with 1
    pub const PREFIX_TEMP: &'static str = "temp";
    pub const PREFIX_ADC: &'static str = "adc";
    pub const PREFIX_IO: &'static str = "io";
    pub const PREFIX_IN: &'static str = "in";
    pub const PREFIX_OUT: &'static str = "out";
    pub const PREFIX_COUNT: &'static str = "count";

    pub const ALARM_GENERAL: &'static str = "general";
    pub const ALARM_SOS: &'static str = "sos";
    pub const ALARM_VIBRATION: &'static str = "vibration";
    pub const ALARM_MOVEMENT: &'static str = "movement";
    pub const ALARM_LOW_SPEED: &'static str = "lowspeed";
    pub const ALARM_OVERSPEED: &'static str = "overspeed";
    pub const ALARM_FALL_DOWN: &'static str = "fallDown";
    pub const ALARM_LOW_POWER: &'static str = "lowPower";
    pub const ALARM_LOW_BATTERY: &'static str = "lowBattery";
    pub const ALARM_FAULT: &'static str = "fault";
    pub const ALARM_POWER_OFF: &'static str = "powerOff";
    pub const ALARM_POWER_ON: &'static str = "powerOn";
    pub const ALARM_DOOR: &'static str = "door";
    pub const ALARM_LOCK: &'static str = "lock";
    pub const ALARM_UNLOCK: &'static str = "unlock";
    pub const ALARM_GEOFENCE: &'static str = "geofence";
    pub const ALARM_GEOFENCE_ENTER: &'static str = "geofenceEnter";
    pub const ALARM_GEOFENCE_EXIT: &'static str = "geofenceExit";
    pub const ALARM_GPS_ANTENNA_CUT: &'static str = "gpsAntennaCut";
    pub const ALARM_ACCIDENT: &'static str = "accident";
    pub const ALARM_TOW: &'static str = "tow";
    pub const ALARM_IDLE: &'static str = "idle";
    pub const ALARM_HIGH_RPM: &'static str = "highRpm";
    pub const ALARM_ACCELERATION: &'static str = "hardAcceleration";
    pub const ALARM_BRAKING: &'static str = "hardBraking";
    pub const ALARM_CORNERING: &'static str = "hardCornering";
    pub const ALARM_LANE_CHANGE: &'static str = "laneChange";
    pub const ALARM_FATIGUE_DRIVING: &'static str = "fatigueDriving";
    pub const ALARM_POWER_CUT: &'static str = "powerCut";
    pub const ALARM_POWER_RESTORED: &'static str = "powerRestored";
    pub const ALARM_JAMMING: &'static str = "jamming";
    pub const ALARM_TEMPERATURE: &'static str = "temperature";
    pub const ALARM_PARKING: &'static str = "parking";
    pub const ALARM_BONNET: &'static str = "bonnet";
    pub const ALARM_FOOT_BRAKE: &'static str = "footBrake";
    pub const ALARM_FUEL_LEAK: &'static str = "fuelLeak";
    pub const ALARM_TAMPERING: &'static str = "tampering";
    pub const ALARM_REMOVING: &'static str = "removing";

    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            device_id: 0,
            server_time: Utc::now(),
            device_time: None,
            fix_time: None,
            valid: false,
            outdated: false,
            latitude: 0.0,
            longitude: 0.0,
            latitude_wgs84: 0.0,
            longitude_wgs84: 0.0,
            latitude_pending: false,
            longitude_pending: false,
            altitude: 0.0,
            speed: 0.0,
            course: 0.0,
            accuracy: 0.0,
            address: None,
            network: None,
            geofence_ids: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn set_device_id(&mut self, device_id: DeviceId) {
        self.device_id = device_id;
    }

    pub fn server_time(&self) -> DateTime<Utc> {
        self.server_time
    }

    pub fn device_time(&self) -> Option<DateTime<Utc>> {
        self.device_time
    }

    pub fn set_device_time(&mut self, time: DateTime<Utc>) {
        self.device_time = Some(time);
    }

    pub fn fix_time(&self) -> Option<DateTime<Utc>> {
        self.fix_time
    }

    pub fn set_fix_time(&mut self, time: DateTime<Utc>) {
        self.fix_time = Some(time);
    }

    /// Sets device time and fix time to the same instant. Most protocols
    /// report a single timestamp.
    pub fn set_time(&mut self, time: DateTime<Utc>) {
        self.device_time = Some(time);
        self.fix_time = Some(time);
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    pub fn outdated(&self) -> bool {
        self.outdated
    }

    pub fn set_outdated(&mut self, outdated: bool) {
        self.outdated = outdated;
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn set_latitude(&mut self, latitude: f64) -> Result<(), CoordinateError> {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(CoordinateError::LatitudeOutOfRange { value: latitude });
        }
        self.latitude = latitude;
        Ok(())
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn set_longitude(&mut self, longitude: f64) -> Result<(), CoordinateError> {
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(CoordinateError::LongitudeOutOfRange { value: longitude });
        }
        self.longitude = longitude;
        Ok(())
    }

    pub fn latitude_wgs84(&self) -> f64 {
        self.latitude_wgs84
    }

    pub fn longitude_wgs84(&self) -> f64 {
        self.longitude_wgs84
    }

    /// Records the WGS-84 latitude. Once both axes have been written since
    /// the last conversion, the GCJ-02 conversion fires and updates the
    /// published coordinates.
    pub fn set_latitude_wgs84(&mut self, latitude: f64) -> Result<(), CoordinateError> {
        self.latitude_wgs84 = latitude;
        self.latitude_pending = true;
        if self.longitude_pending {
            self.apply_datum_conversion()?;
        }
        Ok(())
    }

    /// Records the WGS-84 longitude. See [`set_latitude_wgs84`][Self::set_latitude_wgs84].
    pub fn set_longitude_wgs84(&mut self, longitude: f64) -> Result<(), CoordinateError> {
        self.longitude_wgs84 = longitude;
        self.longitude_pending = true;
        if self.latitude_pending {
            self.apply_datum_conversion()?;
        }
        Ok(())
    }

    /// Sets both WGS-84 axes at once and converts immediately.
    pub fn set_fix_coordinates(&mut self, latitude: f64, longitude: f64) -> Result<(), CoordinateError> {
        self.latitude_wgs84 = latitude;
        self.longitude_wgs84 = longitude;
        self.latitude_pending = true;
        self.longitude_pending = true;
        self.apply_datum_conversion()
    }

    fn apply_datum_conversion(&mut self) -> Result<(), CoordinateError> {
        let (lat, lon) = geo::wgs84_to_gcj02(self.latitude_wgs84, self.longitude_wgs84);
        self.set_latitude(lat)?;
        self.set_longitude(lon)?;
        self.latitude_pending = false;
        self.longitude_pending = false;
        Ok(())
    }

    pub fn altitude(&self) -> f64 {
        self.altitude
    }

    pub fn set_altitude(&mut self, altitude: f64) {
        self.altitude = altitude;
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn set_speed(&mut self, speed: f64) {
        self.speed = speed;
    }

    pub fn course(&self) -> f64 {
        self.course
    }

    pub fn set_course(&mut self, course: f64) {
        self.course = course;
    }

    pub fn accuracy(&self) -> f64 {
        self.accuracy
    }

    pub fn set_accuracy(&mut self, accuracy: f64) {
        self.accuracy = accuracy;
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn set_address(&mut self, address: impl Into<String>) {
        self.address = Some(address.into());
    }

    pub fn network(&self) -> Option<&Network> {
        self.network.as_ref()
    }

    pub fn set_network(&mut self, network: Network) {
        self.network = Some(network);
    }

    pub fn geofence_ids(&self) -> Option<&[i64]> {
        self.geofence_ids.as_deref()
    }

    pub fn set_geofence_ids(&mut self, geofence_ids: Vec<i64>) {
        self.geofence_ids = Some(geofence_ids);
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Sets an indexed attribute, e.g. `temp1` for `(PREFIX_TEMP, 1)`.
    pub fn set_indexed(&mut self, prefix: &str, index: usize, value: impl Into<AttributeValue>) {
        self.attributes.insert(format!("{prefix}{index}"), value.into());
    }

    pub fn has(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    pub fn attributes(&self) -> &BTreeMap<String, AttributeValue> {
        &self.attributes
    }

    /// Appends an alarm token to the `alarm` attribute. Tokens are joined
    /// with commas in the order they were added, without deduplication.
    pub fn add_alarm(&mut self, alarm: &str) {
        match self.attributes.get_mut(Self::KEY_ALARM) {
            Some(AttributeValue::String(existing)) => {
                existing.push(',');
                existing.push_str(alarm);
            }
            _ => {
                self.attributes
                    .insert(Self::KEY_ALARM.to_owned(), AttributeValue::String(alarm.to_owned()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_appends_alarms_in_order() {
        let mut position = Position::new("test");
        position.add_alarm(Position::ALARM_GPS_ANTENNA_CUT);
        position.add_alarm(Position::ALARM_LOW_BATTERY);
        position.add_alarm(Position::ALARM_LOW_BATTERY);
        assert_eq!(
            position.get(Position::KEY_ALARM).unwrap().as_str(),
            Some("gpsAntennaCut,lowBattery,lowBattery"),
        );
    }

    #[test]
    fn it_rejects_out_of_range_coordinates() {
        let mut position = Position::new("test");
        assert!(position.set_latitude(91.0).is_err());
        assert!(position.set_longitude(-180.5).is_err());
        assert!(position.set_latitude(-90.0).is_ok());
        assert!(position.set_longitude(180.0).is_ok());
    }

    #[test]
    fn it_converts_only_when_both_axes_are_set() {
        let mut position = Position::new("test");
        position.set_latitude_wgs84(39.90).unwrap();
        // only one axis written, nothing published yet
        assert_eq!(position.latitude(), 0.0);
        assert_eq!(position.longitude(), 0.0);

        position.set_longitude_wgs84(116.40).unwrap();
        assert!((position.latitude() - 39.901404).abs() < 1e-5);
        assert!((position.longitude() - 116.406243).abs() < 1e-5);
        assert_eq!(position.latitude_wgs84(), 39.90);
        assert_eq!(position.longitude_wgs84(), 116.40);
    }

    #[test]
    fn it_passes_through_outside_china() {
        let mut position = Position::new("test");
        position.set_fix_coordinates(-22.0, 114.0).unwrap();
        assert_eq!(position.latitude(), -22.0);
        assert_eq!(position.longitude(), 114.0);
    }

    #[test]
    fn it_serializes_attributes_untagged() {
        let mut position = Position::new("test");
        position.set(Position::KEY_ODOMETER, 1000u32);
        position.set(Position::KEY_IGNITION, true);
        position.add_alarm(Position::ALARM_SOS);

        let json = serde_json::to_value(&position).unwrap();
        assert_eq!(json["protocol"], "test");
        assert_eq!(json["attributes"]["odometer"], 1000);
        assert_eq!(json["attributes"]["ignition"], true);
        assert_eq!(json["attributes"]["alarm"], "sos");
    }

    #[test]
    fn it_resets_the_latch_after_conversion() {
        let mut position = Position::new("test");
        position.set_fix_coordinates(50.0, 10.0).unwrap();
        // a single follow-up write must wait for its pair again
        position.set_latitude_wgs84(51.0).unwrap();
        assert_eq!(position.latitude(), 50.0);
    }
}
