use std::net::IpAddr;

use ipnetwork::IpNetwork;

/// Configured address ranges (VPN providers, hosting networks)
#[derive(Debug, Clone, Default)]
pub struct NetworkRanges {
    networks: Vec<IpNetwork>,
}

impl NetworkRanges {
    /// Parse every entry, skipping (and logging) invalid ones
    ///
    /// Entries are CIDR blocks; a bare address is a single-host range.
    pub fn parse_lenient<S: AsRef<str>>(entries: &[S]) -> Self {
        let networks = entries
            .iter()
            .filter_map(|entry| {
                let entry = entry.as_ref().trim();
                match entry.parse::<IpNetwork>() {
                    Ok(network) => Some(network),
                    Err(e) => {
                        log::warn!("Ignoring VPN range '{}': {}", entry, e);
                        None
                    }
                }
            })
            .collect();
        NetworkRanges { networks }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|network| network.contains(ip))
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}
