//! Location fixes, the stored report record, and the text shown for it.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::session::SessionId;

const NOT_AVAILABLE: &str = "N/A";

/// A single reading from the location source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
    /// Radius of uncertainty in metres.
    pub accuracy: f64,
    /// Capture time, epoch milliseconds.
    pub timestamp: i64,
}

/// Best-effort address for a coordinate pair. A missing field is a field the
/// geocoder did not return.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neighborhood: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl AddressDetails {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// "Street, 123", the bare street, or N/A.
    pub fn street_line(&self) -> String {
        match (&self.street, &self.number) {
            (Some(street), Some(number)) => format!("{}, {}", street, number),
            (Some(street), None) => street.clone(),
            _ => NOT_AVAILABLE.to_string(),
        }
    }

    /// "City - State", whichever of the two exists, or N/A.
    pub fn city_state_line(&self) -> String {
        match (&self.city, &self.state) {
            (Some(city), Some(state)) => format!("{} - {}", city, state),
            (Some(one), None) | (None, Some(one)) => one.clone(),
            (None, None) => NOT_AVAILABLE.to_string(),
        }
    }

    fn neighborhood_line(&self) -> &str {
        self.neighborhood.as_deref().unwrap_or(NOT_AVAILABLE)
    }

    fn postcode_line(&self) -> &str {
        self.postcode.as_deref().unwrap_or(NOT_AVAILABLE)
    }
}

/// The latest fix of a session as written to the shared store. Each write
/// replaces the previous report for the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationReport {
    pub session_id: SessionId,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
    pub timestamp: i64,
    #[serde(default)]
    pub address: AddressDetails,
}

impl LocationReport {
    pub fn new(session_id: SessionId, fix: Fix, address: Option<AddressDetails>) -> Self {
        Self {
            session_id,
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy: fix.accuracy,
            timestamp: fix.timestamp,
            address: address.unwrap_or_default(),
        }
    }

    pub fn coordinates(&self) -> (f64, f64) {
        (self.latitude, self.longitude)
    }

    /// Popup shown on the tracker's map marker.
    pub fn popup_text(&self) -> String {
        let address = &self.address;
        format!(
            "Location updated:\n\
             Time: {}\n\
             ---\n\
             Estimated address:\n\
             Street: {}\n\
             Neighborhood: {}\n\
             City/State: {}\n\
             Postcode: {}\n\
             ---\n\
             Coordinates:\n\
             Lat: {:.6}, Lon: {:.6}\n\
             Accuracy: ±{:.1}m",
            local_time(self.timestamp),
            address.street_line(),
            address.neighborhood_line(),
            address.city_state_line(),
            address.postcode_line(),
            self.latitude,
            self.longitude,
            self.accuracy,
        )
    }

    /// One-glance status line for the tracker.
    pub fn status_line(&self) -> String {
        format!(
            "Location received at {} (Accuracy: {:.1}m)\nAddress: {}, {}",
            local_time(self.timestamp),
            self.accuracy,
            self.address.street_line(),
            self.address.city_state_line(),
        )
    }

    /// Confirmation shown to the submitter after a successful write.
    pub fn submitted_summary(&self) -> String {
        let address = if self.address.is_empty() {
            "Address not found or service unavailable.".to_string()
        } else {
            format!(
                "Postcode: {}\nStreet: {}\nNeighborhood: {}\nCity/State: {}",
                self.address.postcode_line(),
                self.address.street_line(),
                self.address.neighborhood_line(),
                self.address.city_state_line(),
            )
        };
        format!(
            "Location sent successfully!\n\
             Last update: {}\n\
             Coordinates: Lat: {:.6}, Lon: {:.6}\n\
             Accuracy: {:.1} metres\n\
             Estimated address:\n{}",
            local_time(self.timestamp),
            self.latitude,
            self.longitude,
            self.accuracy,
            address,
        )
    }
}

/// Local wall-clock time of an epoch-millisecond instant.
pub fn local_time(timestamp_ms: i64) -> String {
    match DateTime::from_timestamp_millis(timestamp_ms) {
        Some(utc) => utc.with_timezone(&Local).format("%H:%M:%S").to_string(),
        None => NOT_AVAILABLE.to_string(),
    }
}
