//! Geolocation collaborators
//!
//! Two lookups live here: turning free-form location labels into a
//! distance between them (used by the geo rule), and resolving an IP to
//! a country name with a MaxMind GeoLite2 database (used when answering
//! the client).

pub mod estimator;
pub mod geocoder;
pub mod geoip;

pub use estimator::GeoDistanceEstimator;
pub use geocoder::NominatimGeocoder;
pub use geoip::GeoIpService;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::LookupError;

/// Geographic coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
}

/// Resolves a location label ("Nairobi", "Berlin, Germany") to coordinates
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn coordinates(
        &self,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<GeoLocation, LookupError>;
}

/// Distance between two location labels
#[async_trait]
pub trait GeoResolver: Send + Sync {
    /// Great-circle distance in kilometers; fails when either label cannot be geocoded
    async fn distance_km(
        &self,
        from: &str,
        to: &str,
        cancel: &CancellationToken,
    ) -> Result<f64, LookupError>;
}

/// Resolves an IP address to a country name
#[async_trait]
pub trait CountryResolver: Send + Sync {
    async fn country(&self, ip: &str, cancel: &CancellationToken) -> Result<String, LookupError>;
}

/// Calculate the great-circle distance between two points using the Haversine formula
/// Returns distance in kilometers
pub fn haversine_distance(loc1: GeoLocation, loc2: GeoLocation) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;

    let lat1_rad = loc1.latitude.to_radians();
    let lat2_rad = loc2.latitude.to_radians();
    let delta_lat = (loc2.latitude - loc1.latitude).to_radians();
    let delta_lon = (loc2.longitude - loc1.longitude).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_KM * c
}
