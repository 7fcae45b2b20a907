//! Reverse geocoding. Failures never reach the caller: they degrade to "no address".

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::NOMINATIM_URL;
use crate::error::{Error, Result};
use crate::report::AddressDetails;

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn reverse(&self, latitude: f64, longitude: f64) -> Option<AddressDetails>;
}

/// Geocoder that never resolves anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGeocoder;

#[async_trait]
impl Geocoder for NoGeocoder {
    async fn reverse(&self, _latitude: f64, _longitude: f64) -> Option<AddressDetails> {
        None
    }
}

/// OpenStreetMap Nominatim `reverse` client.
#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    client: reqwest::Client,
    endpoint: String,
}

impl NominatimGeocoder {
    pub fn new() -> Result<Self> {
        Self::with_endpoint(NOMINATIM_URL)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self> {
        // Nominatim's usage policy requires an identifying user agent.
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::GeocodingUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    async fn lookup(&self, latitude: f64, longitude: f64) -> Result<AddressDetails> {
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("format", "json".to_string()),
                ("lat", latitude.to_string()),
                ("lon", longitude.to_string()),
                ("addressdetails", "1".to_string()),
                ("zoom", "18".to_string()),
            ])
            .send()
            .await
            .map_err(|e| Error::GeocodingUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Error::GeocodingUnavailable(format!(
                "Nominatim returned status {}",
                resp.status()
            )));
        }

        let body: NominatimResponse = resp
            .json()
            .await
            .map_err(|e| Error::GeocodingUnavailable(e.to_string()))?;

        body.into_details()
            .ok_or_else(|| Error::GeocodingUnavailable("response has no address".to_string()))
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn reverse(&self, latitude: f64, longitude: f64) -> Option<AddressDetails> {
        match self.lookup(latitude, longitude).await {
            Ok(address) => {
                debug!(latitude, longitude, ?address, "Resolved address");
                Some(address)
            }
            Err(e) => {
                warn!(latitude, longitude, error = %e, "Reverse geocoding failed");
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct NominatimResponse {
    display_name: Option<String>,
    address: Option<NominatimAddress>,
}

#[derive(Debug, Default, Deserialize)]
struct NominatimAddress {
    road: Option<String>,
    pedestrian: Option<String>,
    street: Option<String>,
    house_number: Option<String>,
    suburb: Option<String>,
    quarter: Option<String>,
    village: Option<String>,
    city_district: Option<String>,
    city: Option<String>,
    town: Option<String>,
    municipality: Option<String>,
    state: Option<String>,
    postcode: Option<String>,
}

impl NominatimResponse {
    fn into_details(self) -> Option<AddressDetails> {
        let a = self.address?;
        Some(AddressDetails {
            street: first_present(&[&a.road, &a.pedestrian, &a.street]),
            number: first_present(&[&a.house_number]),
            neighborhood: first_present(&[&a.suburb, &a.quarter, &a.village, &a.city_district]),
            city: first_present(&[&a.city, &a.town, &a.village, &a.municipality]),
            state: first_present(&[&a.state]),
            postcode: first_present(&[&a.postcode]),
            display_name: first_present(&[&self.display_name]),
        })
    }
}

fn first_present(candidates: &[&Option<String>]) -> Option<String> {
    candidates
        .iter()
        .filter_map(|c| c.as_deref())
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}
