//! Device-session registry
//!
//! Maps transport peers to logical devices. A device is identified by the
//! unique id it reports (IMEI, TID, ...); the registry resolves that through
//! an injected [`DeviceDirectory`] and binds the connection endpoint to the
//! resolved device so follow-up messages without an id still find their
//! session.
//!
//! Per-device state (timezone, scratch attributes, last known location)
//! lives behind a per-device mutex so concurrent connections from the same
//! device see atomic updates. The state survives reconnections; only the
//! endpoint binding is dropped when a connection closes.

use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    net::SocketAddr,
    sync::{
        Arc,
        Mutex,
        RwLock,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
};

use chrono::{
    DateTime,
    FixedOffset,
    Utc,
};
use geolink_types::{
    DeviceId,
    Position,
    position::AttributeValue,
};

/// One transport peer: the connection (or datagram socket) id plus the
/// remote address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub channel: u64,
    pub remote_address: SocketAddr,
}

impl Endpoint {
    pub fn new(channel: u64, remote_address: SocketAddr) -> Self {
        Self {
            channel,
            remote_address,
        }
    }
}

/// Directory record for a known device.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub unique_id: String,
    pub model: Option<String>,
    pub attributes: BTreeMap<String, AttributeValue>,
}

/// The out-of-scope device directory, seen through the lookup the core
/// needs. Read-mostly; updates propagate eventually.
pub trait DeviceDirectory: Send + Sync {
    fn lookup(&self, unique_id: &str) -> Option<DeviceInfo>;

    fn lookup_by_id(&self, id: DeviceId) -> Option<DeviceInfo>;

    /// Creates a record for an unknown device. Only called when the gateway
    /// is configured to auto-register.
    fn register(&self, unique_id: &str) -> Option<DeviceInfo> {
        let _ = unique_id;
        None
    }
}

/// In-memory [`DeviceDirectory`]. Device ids start at 1; 0 marks an
/// unassigned position.
#[derive(Debug)]
pub struct InMemoryDirectory {
    devices: RwLock<DirectoryState>,
    next_id: AtomicU64,
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct DirectoryState {
    by_unique_id: HashMap<String, DeviceInfo>,
    by_id: HashMap<DeviceId, String>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(DirectoryState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add(&self, unique_id: impl Into<String>, model: Option<String>) -> DeviceInfo {
        let unique_id = unique_id.into();
        let info = DeviceInfo {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            unique_id: unique_id.clone(),
            model,
            attributes: BTreeMap::new(),
        };

        let mut state = self.devices.write().expect("directory lock poisoned");
        state.by_id.insert(info.id, unique_id.clone());
        state.by_unique_id.insert(unique_id, info.clone());
        info
    }
}

impl DeviceDirectory for InMemoryDirectory {
    fn lookup(&self, unique_id: &str) -> Option<DeviceInfo> {
        self.devices
            .read()
            .expect("directory lock poisoned")
            .by_unique_id
            .get(unique_id)
            .cloned()
    }

    fn lookup_by_id(&self, id: DeviceId) -> Option<DeviceInfo> {
        let state = self.devices.read().expect("directory lock poisoned");
        let unique_id = state.by_id.get(&id)?;
        state.by_unique_id.get(unique_id).cloned()
    }

    fn register(&self, unique_id: &str) -> Option<DeviceInfo> {
        Some(self.add(unique_id, None))
    }
}

#[derive(Debug)]
struct DeviceState {
    info: DeviceInfo,
    state: Mutex<SessionState>,
}

#[derive(Debug, Default)]
struct SessionState {
    timezone: Option<FixedOffset>,
    attributes: BTreeMap<String, AttributeValue>,
    last_location: Option<Position>,
}

/// Handle to one device's session state. Cheap to clone.
#[derive(Clone, Debug)]
pub struct DeviceSession {
    device: Arc<DeviceState>,
}

impl DeviceSession {
    pub fn device_id(&self) -> DeviceId {
        self.device.info.id
    }

    pub fn unique_id(&self) -> &str {
        &self.device.info.unique_id
    }

    pub fn model(&self) -> Option<&str> {
        self.device.info.model.as_deref()
    }

    /// The device's timezone, GMT+08:00 unless set.
    pub fn timezone(&self) -> FixedOffset {
        self.device
            .state
            .lock()
            .expect("session state poisoned")
            .timezone
            .unwrap_or_else(default_timezone)
    }

    pub fn has_timezone(&self) -> bool {
        self.device
            .state
            .lock()
            .expect("session state poisoned")
            .timezone
            .is_some()
    }

    pub fn set_timezone(&self, timezone: FixedOffset) {
        self.device
            .state
            .lock()
            .expect("session state poisoned")
            .timezone = Some(timezone);
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.device
            .state
            .lock()
            .expect("session state poisoned")
            .attributes
            .insert(key.into(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<AttributeValue> {
        self.device
            .state
            .lock()
            .expect("session state poisoned")
            .attributes
            .get(key)
            .cloned()
    }

    /// Stores the latest position as the last-known-location snapshot.
    pub fn store_last_location(&self, position: &Position) {
        self.device
            .state
            .lock()
            .expect("session state poisoned")
            .last_location = Some(position.clone());
    }

    /// Fills a position from the cached snapshot: fix coordinates, validity
    /// and fix time come from the last known location, the device time is
    /// the given one (or now). Used for messages that carry device data but
    /// no fix (heartbeats, command responses).
    pub fn get_last_location(&self, position: &mut Position, device_time: Option<DateTime<Utc>>) {
        position.set_outdated(true);

        let state = self.device.state.lock().expect("session state poisoned");
        if let Some(last) = &state.last_location {
            position.set_fix_time(last.fix_time().unwrap_or(DateTime::UNIX_EPOCH));
            position.set_valid(last.valid());
            position
                .set_latitude(last.latitude())
                .expect("cached latitude is range-checked");
            position
                .set_longitude(last.longitude())
                .expect("cached longitude is range-checked");
            position.set_altitude(last.altitude());
            position.set_speed(last.speed());
            position.set_course(last.course());
            position.set_accuracy(last.accuracy());
        }
        else {
            position.set_fix_time(DateTime::UNIX_EPOCH);
        }

        position.set_device_time(device_time.unwrap_or_else(Utc::now));
    }
}

pub fn default_timezone() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).expect("GMT+08:00 is a valid offset")
}

/// Process-wide registry of device sessions and endpoint bindings.
pub struct SessionRegistry {
    directory: Arc<dyn DeviceDirectory>,
    auto_register: bool,
    inner: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    devices: HashMap<DeviceId, Arc<DeviceState>>,
    by_endpoint: HashMap<Endpoint, DeviceId>,
}

impl SessionRegistry {
    pub fn new(directory: Arc<dyn DeviceDirectory>, auto_register: bool) -> Self {
        Self {
            directory,
            auto_register,
            inner: Mutex::new(RegistryState::default()),
        }
    }

    pub fn directory(&self) -> &Arc<dyn DeviceDirectory> {
        &self.directory
    }

    /// Resolves the session for an endpoint.
    ///
    /// With a unique id the device is resolved through the directory (and
    /// optionally auto-registered) and the endpoint is bound to it. Without
    /// one the existing endpoint binding is used. `None` means the message
    /// must be dropped: the device is unknown and no ack is sent, so it
    /// will time out and re-register.
    pub fn device_session(&self, endpoint: Endpoint, unique_id: Option<&str>) -> Option<DeviceSession> {
        let mut inner = self.inner.lock().expect("session registry poisoned");

        let device_id = if let Some(unique_id) = unique_id {
            let info = match self.directory.lookup(unique_id) {
                Some(info) => info,
                None if self.auto_register => {
                    let info = self.directory.register(unique_id)?;
                    tracing::info!(unique_id, device_id = info.id, "auto-registered device");
                    info
                }
                None => {
                    tracing::debug!(unique_id, "unknown device");
                    return None;
                }
            };

            let device_id = info.id;
            inner
                .devices
                .entry(device_id)
                .or_insert_with(|| {
                    Arc::new(DeviceState {
                        info,
                        state: Mutex::new(SessionState::default()),
                    })
                });
            inner.by_endpoint.insert(endpoint, device_id);
            device_id
        }
        else {
            *inner.by_endpoint.get(&endpoint)?
        };

        inner.devices.get(&device_id).map(|device| {
            DeviceSession {
                device: Arc::clone(device),
            }
        })
    }

    /// Drops the endpoint binding when a connection closes. Device state is
    /// kept for the next connection.
    pub fn close_endpoint(&self, endpoint: Endpoint) {
        let mut inner = self.inner.lock().expect("session registry poisoned");
        inner.by_endpoint.remove(&endpoint);
    }

    /// Drops a device's cached session state entirely.
    pub fn remove_device(&self, device_id: DeviceId) {
        let mut inner = self.inner.lock().expect("session registry poisoned");
        inner.devices.remove(&device_id);
        inner.by_endpoint.retain(|_, id| *id != device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(channel: u64) -> Endpoint {
        Endpoint::new(channel, "127.0.0.1:5023".parse().unwrap())
    }

    fn registry(auto_register: bool) -> (Arc<InMemoryDirectory>, SessionRegistry) {
        let directory = Arc::new(InMemoryDirectory::new());
        let registry = SessionRegistry::new(directory.clone(), auto_register);
        (directory, registry)
    }

    #[test]
    fn it_resolves_known_devices_and_binds_the_endpoint() {
        let (directory, registry) = registry(false);
        let info = directory.add("123456789012345", None);

        let session = registry
            .device_session(endpoint(1), Some("123456789012345"))
            .unwrap();
        assert_eq!(session.device_id(), info.id);

        // follow-up message without an id resolves via the binding
        let session = registry.device_session(endpoint(1), None).unwrap();
        assert_eq!(session.device_id(), info.id);
    }

    #[test]
    fn it_drops_unknown_devices() {
        let (_directory, registry) = registry(false);
        assert!(registry.device_session(endpoint(1), Some("999")).is_none());
        assert!(registry.device_session(endpoint(1), None).is_none());
    }

    #[test]
    fn it_auto_registers_when_configured() {
        let (_directory, registry) = registry(true);
        let session = registry.device_session(endpoint(1), Some("999")).unwrap();
        assert_eq!(session.unique_id(), "999");
    }

    #[test]
    fn it_keeps_device_state_across_reconnects() {
        let (_directory, registry) = registry(true);
        let session = registry.device_session(endpoint(1), Some("42")).unwrap();
        session.set_timezone(FixedOffset::east_opt(3600).unwrap());
        registry.close_endpoint(endpoint(1));

        // binding is gone
        assert!(registry.device_session(endpoint(1), None).is_none());

        // re-authentication finds the same state
        let session = registry.device_session(endpoint(2), Some("42")).unwrap();
        assert_eq!(session.timezone(), FixedOffset::east_opt(3600).unwrap());
    }

    #[test]
    fn it_copies_the_snapshot_into_last_location() {
        let (_directory, registry) = registry(true);
        let session = registry.device_session(endpoint(1), Some("42")).unwrap();

        let mut last = Position::new("test");
        last.set_valid(true);
        last.set_fix_coordinates(50.0, 10.0).unwrap();
        last.set_time(Utc::now());
        last.set_speed(12.0);
        session.store_last_location(&last);

        let mut position = Position::new("test");
        session.get_last_location(&mut position, None);
        assert!(position.outdated());
        assert!(position.valid());
        assert_eq!(position.latitude(), 50.0);
        assert_eq!(position.longitude(), 10.0);
        assert_eq!(position.speed(), 12.0);
        assert_eq!(position.fix_time(), last.fix_time());
    }
}
