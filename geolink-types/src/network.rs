//! Radio environment observed by a device: cell towers and WiFi access
//! points. Passive containers, forwarded verbatim to consumers that want to
//! resolve approximate locations from them.

use serde::{
    Deserialize,
    Serialize,
};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Network {
    #[serde(skip_serializing_if = "Option::is_none")]
    cell_towers: Option<Vec<CellTower>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    wifi_access_points: Option<Vec<WifiAccessPoint>>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cell_tower(cell_tower: CellTower) -> Self {
        Self {
            cell_towers: Some(vec![cell_tower]),
            wifi_access_points: None,
        }
    }

    pub fn add_cell_tower(&mut self, cell_tower: CellTower) {
        self.cell_towers.get_or_insert_with(Vec::new).push(cell_tower);
    }

    pub fn add_wifi_access_point(&mut self, access_point: WifiAccessPoint) {
        self.wifi_access_points
            .get_or_insert_with(Vec::new)
            .push(access_point);
    }

    pub fn cell_towers(&self) -> Option<&[CellTower]> {
        self.cell_towers.as_deref()
    }

    pub fn wifi_access_points(&self) -> Option<&[WifiAccessPoint]> {
        self.wifi_access_points.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.cell_towers.is_none() && self.wifi_access_points.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellTower {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile_country_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mobile_network_code: Option<u16>,
    pub location_area_code: u16,
    pub cell_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<i32>,
}

impl CellTower {
    pub fn from_parts(mcc: u16, mnc: u16, lac: u16, cid: u64) -> Self {
        Self {
            mobile_country_code: Some(mcc),
            mobile_network_code: Some(mnc),
            location_area_code: lac,
            cell_id: cid,
            signal_strength: None,
        }
    }

    pub fn with_signal(mcc: u16, mnc: u16, lac: u16, cid: u64, signal: i32) -> Self {
        Self {
            signal_strength: Some(signal),
            ..Self::from_parts(mcc, mnc, lac, cid)
        }
    }

    /// For devices that only report CID and LAC; the operator codes are
    /// filled in downstream from configuration.
    pub fn from_cid_lac(cid: u64, lac: u16) -> Self {
        Self {
            mobile_country_code: None,
            mobile_network_code: None,
            location_area_code: lac,
            cell_id: cid,
            signal_strength: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WifiAccessPoint {
    /// Colon-separated hex MAC, e.g. `aa:bb:cc:dd:ee:ff`.
    pub mac_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<i32>,
}

impl WifiAccessPoint {
    pub fn from_mac(mac_address: impl Into<String>, signal_strength: i32) -> Self {
        Self {
            mac_address: mac_address.into(),
            signal_strength: Some(signal_strength),
        }
    }
}
