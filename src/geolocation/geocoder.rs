//! Location label geocoding against a Nominatim-compatible search API

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{GeoLocation, Geocoder};
use crate::config::GeolocationConfig;
use crate::error::LookupError;

#[derive(Debug, Deserialize)]
struct SearchHit {
    lat: String,
    lon: String,
}

/// Geocoder using the OpenStreetMap Nominatim search endpoint
pub struct NominatimGeocoder {
    client: Client,
    url: String,
    user_agent: String,
}

impl NominatimGeocoder {
    pub fn new(config: &GeolocationConfig, timeout: std::time::Duration) -> Self {
        NominatimGeocoder {
            client: Client::builder().timeout(timeout).build().unwrap_or_default(),
            url: config.geocoder_url.clone(),
            user_agent: config.user_agent.clone(),
        }
    }

    fn parse_hits(label: &str, hits: Vec<SearchHit>) -> Result<GeoLocation, LookupError> {
        let hit = hits
            .into_iter()
            .next()
            .ok_or_else(|| LookupError::NotFound(label.to_string()))?;

        let latitude: f64 = hit
            .lat
            .parse()
            .map_err(|_| LookupError::Malformed(format!("latitude '{}'", hit.lat)))?;
        let longitude: f64 = hit
            .lon
            .parse()
            .map_err(|_| LookupError::Malformed(format!("longitude '{}'", hit.lon)))?;

        Ok(GeoLocation { latitude, longitude })
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn coordinates(
        &self,
        label: &str,
        cancel: &CancellationToken,
    ) -> Result<GeoLocation, LookupError> {
        if cancel.is_cancelled() {
            return Err(LookupError::Cancelled);
        }

        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .query(&[("q", label), ("format", "json"), ("limit", "1")])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(LookupError::Unavailable(format!(
                "geocoder returned {}",
                response.status()
            )));
        }

        let hits: Vec<SearchHit> = response
            .json()
            .await
            .map_err(|e| LookupError::Malformed(e.to_string()))?;

        Self::parse_hits(label, hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_first_hit() {
        let hits: Vec<SearchHit> =
            serde_json::from_str(r#"[{"lat":"-1.2921","lon":"36.8219","display_name":"Nairobi"}]"#)
                .unwrap();
        let location = NominatimGeocoder::parse_hits("Nairobi", hits).unwrap();
        assert!((location.latitude + 1.2921).abs() < 1e-9);
        assert!((location.longitude - 36.8219).abs() < 1e-9);
    }

    #[test]
    fn test_parse_empty_is_not_found() {
        let res = NominatimGeocoder::parse_hits("Nowhere", Vec::new());
        assert!(matches!(res, Err(LookupError::NotFound(label)) if label == "Nowhere"));
    }

    #[test]
    fn test_parse_malformed_coordinates() {
        let hits = vec![SearchHit { lat: "north".to_string(), lon: "1.0".to_string() }];
        let res = NominatimGeocoder::parse_hits("X", hits);
        assert!(matches!(res, Err(LookupError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_cancelled_before_request() {
        let geocoder =
            NominatimGeocoder::new(&GeolocationConfig::default(), std::time::Duration::from_secs(1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = geocoder.coordinates("Nairobi", &cancel).await;
        assert!(matches!(res, Err(LookupError::Cancelled)));
    }
}
