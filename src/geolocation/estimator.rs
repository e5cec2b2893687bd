use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{haversine_distance, GeoLocation, GeoResolver, Geocoder};
use crate::deadline::guarded_lookup;
use crate::error::LookupError;

/// [`GeoResolver`] backed by a geocoder, with resolved labels cached
///
/// The cache is owned by the estimator instance; construct one per
/// process and share it through an `Arc`.
pub struct GeoDistanceEstimator {
    geocoder: Arc<dyn Geocoder>,
    cache: Mutex<HashMap<String, GeoLocation>>,
    timeout: Duration,
}

impl GeoDistanceEstimator {
    pub fn new(geocoder: Arc<dyn Geocoder>, timeout: Duration) -> Self {
        GeoDistanceEstimator {
            geocoder,
            cache: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Number of labels currently cached
    pub fn cached_labels(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn cached(&self, label: &str) -> Option<GeoLocation> {
        self.cache.lock().ok()?.get(label).copied()
    }

    async fn resolve(&self, label: &str, cancel: &CancellationToken) -> Result<GeoLocation, LookupError> {
        let label = label.trim();
        if label.is_empty() {
            return Err(LookupError::NotFound("empty location".to_string()));
        }
        if let Some(location) = self.cached(label) {
            return Ok(location);
        }

        let location =
            guarded_lookup(cancel, self.timeout, self.geocoder.coordinates(label, cancel)).await?;

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(label.to_string(), location);
        }
        Ok(location)
    }
}

#[async_trait]
impl GeoResolver for GeoDistanceEstimator {
    async fn distance_km(
        &self,
        from: &str,
        to: &str,
        cancel: &CancellationToken,
    ) -> Result<f64, LookupError> {
        let (a, b) = tokio::try_join!(self.resolve(from, cancel), self.resolve(to, cancel))?;
        Ok(haversine_distance(a, b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TableGeocoder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Geocoder for TableGeocoder {
        async fn coordinates(
            &self,
            label: &str,
            _cancel: &CancellationToken,
        ) -> Result<GeoLocation, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match label {
                "New York" => Ok(GeoLocation { latitude: 40.7128, longitude: -74.0060 }),
                "Los Angeles" => Ok(GeoLocation { latitude: 34.0522, longitude: -118.2437 }),
                other => Err(LookupError::NotFound(other.to_string())),
            }
        }
    }

    struct StuckGeocoder;

    #[async_trait]
    impl Geocoder for StuckGeocoder {
        async fn coordinates(
            &self,
            _label: &str,
            _cancel: &CancellationToken,
        ) -> Result<GeoLocation, LookupError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(LookupError::Unavailable("never".to_string()))
        }
    }

    #[test]
    fn test_distance_and_cache() {
        let geocoder = Arc::new(TableGeocoder { calls: AtomicUsize::new(0) });
        let estimator = GeoDistanceEstimator::new(geocoder.clone(), Duration::from_secs(1));
        let cancel = CancellationToken::new();

        let d = tokio_test::block_on(estimator.distance_km("New York", "Los Angeles", &cancel)).unwrap();
        assert!((d - 3944.0).abs() < 50.0);
        assert_eq!(estimator.cached_labels(), 2);

        tokio_test::block_on(estimator.distance_km("Los Angeles", "New York", &cancel)).unwrap();
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 2, "second lookup served from cache");
    }

    #[tokio::test]
    async fn test_unknown_label_fails() {
        let geocoder = Arc::new(TableGeocoder { calls: AtomicUsize::new(0) });
        let estimator = GeoDistanceEstimator::new(geocoder, Duration::from_secs(1));
        let cancel = CancellationToken::new();

        let res = estimator.distance_km("New York", "Atlantis", &cancel).await;
        assert!(matches!(res, Err(LookupError::NotFound(_))));

        let res = estimator.distance_km("", "New York", &cancel).await;
        assert!(matches!(res, Err(LookupError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_stuck_geocoder_times_out() {
        let estimator = GeoDistanceEstimator::new(Arc::new(StuckGeocoder), Duration::from_millis(20));
        let cancel = CancellationToken::new();
        let res = estimator.distance_km("A", "B", &cancel).await;
        assert!(matches!(res, Err(LookupError::TimedOut)));
    }
}
