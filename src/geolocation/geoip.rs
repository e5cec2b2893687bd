//! IP to country resolution using a MaxMind GeoLite2 database
//!
//! Users must download the database file separately from MaxMind (free
//! with registration). Either the Country or the City edition works.

use async_trait::async_trait;
use maxminddb::{geoip2, Reader};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use super::CountryResolver;
use crate::error::LookupError;

/// GeoIP lookup service
///
/// Wraps the MaxMind database reader together with a cache of resolved
/// country names. Clones share both.
///
/// # Example
///
/// ```ignore
/// use otpguard::geolocation::GeoIpService;
///
/// let service = GeoIpService::new("GeoLite2-Country.mmdb")?;
/// let country = service.lookup_country(&"8.8.8.8".parse()?)?;
/// ```
#[derive(Clone)]
pub struct GeoIpService {
    reader: Arc<Reader<Vec<u8>>>,
    cache: Arc<Mutex<HashMap<IpAddr, String>>>,
}

impl GeoIpService {
    /// Open a MaxMind database file
    ///
    /// # Errors
    ///
    /// Returns an error if the database file cannot be opened or is invalid.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, LookupError> {
        let path = db_path.as_ref();
        if !path.exists() {
            return Err(LookupError::FileNotFound(path.display().to_string()));
        }

        let reader = Reader::open_readfile(path)?;
        log::info!("GeoIP database loaded from {}", path.display());
        Ok(GeoIpService {
            reader: Arc::new(reader),
            cache: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Look up the English country name of an IP address
    pub fn lookup_country(&self, ip: &IpAddr) -> Result<String, LookupError> {
        if let Some(country) = self.cache.lock().ok().and_then(|c| c.get(ip).cloned()) {
            return Ok(country);
        }

        let record: geoip2::Country = self.reader.lookup(*ip).map_err(|e| match e {
            maxminddb::MaxMindDBError::AddressNotFoundError(_) => LookupError::NotFound(ip.to_string()),
            other => LookupError::GeoIpDatabase(other),
        })?;

        let country = record
            .country
            .and_then(|c| c.names)
            .and_then(|n| n.get("en").copied())
            .map(String::from)
            .ok_or_else(|| LookupError::NotFound(ip.to_string()))?;

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(*ip, country.clone());
        }
        Ok(country)
    }
}

#[async_trait]
impl CountryResolver for GeoIpService {
    async fn country(&self, ip: &str, cancel: &CancellationToken) -> Result<String, LookupError> {
        if cancel.is_cancelled() {
            return Err(LookupError::Cancelled);
        }
        let ip: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| LookupError::Malformed(format!("invalid IP address: {}", ip)))?;
        self.lookup_country(&ip)
    }
}
