use std::net::IpAddr;

use ipnet::IpNet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExclusionError {
    #[error("'{0}' is not a valid IP address or CIDR range")]
    Invalid(String),
}

/// Client addresses the abuse detector never tracks.
///
/// Entries are single addresses, CIDR ranges, or `localhost` (both loopback
/// ranges). Loopback is always excluded whatever the configuration says.
#[derive(Debug, Clone)]
pub struct ExclusionList {
    networks: Vec<IpNet>,
    /// Entries as configured, reported by detector stats.
    raw: Vec<String>,
}

impl ExclusionList {
    pub fn parse(entries: &[String]) -> Result<Self, ExclusionError> {
        let mut networks = Vec::with_capacity(entries.len());

        for entry in entries {
            let trimmed = entry.trim();
            if trimmed.eq_ignore_ascii_case("localhost") {
                networks.extend(loopback_networks());
            } else if let Ok(net) = trimmed.parse::<IpNet>() {
                networks.push(net.trunc());
            } else if let Ok(ip) = trimmed.parse::<IpAddr>() {
                networks.push(IpNet::from(ip.to_canonical()));
            } else {
                return Err(ExclusionError::Invalid(entry.clone()));
            }
        }

        Ok(Self {
            networks,
            raw: entries.to_vec(),
        })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        ip.is_loopback() || self.networks.iter().any(|net| net.contains(&ip))
    }

    pub fn entries(&self) -> &[String] {
        &self.raw
    }
}

impl Default for ExclusionList {
    fn default() -> Self {
        Self {
            networks: loopback_networks().collect(),
            raw: Vec::new(),
        }
    }
}

fn loopback_networks() -> impl Iterator<Item = IpNet> {
    ["127.0.0.0/8", "::1/128"]
        .into_iter()
        .filter_map(|cidr| cidr.parse::<IpNet>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[&str]) -> ExclusionList {
        let owned: Vec<String> = entries.iter().map(|s| s.to_string()).collect();
        ExclusionList::parse(&owned).unwrap()
    }

    #[test]
    fn test_default_entries() {
        let excluded = list(&["127.0.0.1", "::1", "localhost"]);
        assert!(excluded.contains("127.0.0.1".parse().unwrap()));
        assert!(excluded.contains("127.0.0.53".parse().unwrap()));
        assert!(excluded.contains("::1".parse().unwrap()));
        assert!(!excluded.contains("192.168.1.10".parse().unwrap()));
        assert_eq!(excluded.entries().len(), 3);
    }

    #[test]
    fn test_cidr_and_single_address() {
        let excluded = list(&["10.0.0.0/8", "192.168.1.7", "fd00::/8"]);
        assert!(excluded.contains("10.200.3.4".parse().unwrap()));
        assert!(excluded.contains("192.168.1.7".parse().unwrap()));
        assert!(!excluded.contains("192.168.1.8".parse().unwrap()));
        assert!(excluded.contains("fd12::1".parse().unwrap()));
    }

    #[test]
    fn test_loopback_always_excluded() {
        let excluded = list(&[]);
        assert!(excluded.contains("127.0.0.1".parse().unwrap()));
        assert!(ExclusionList::default().contains("::1".parse().unwrap()));
    }

    #[test]
    fn test_mapped_ipv4_matches() {
        let excluded = list(&["192.168.1.7"]);
        assert!(excluded.contains("::ffff:192.168.1.7".parse().unwrap()));
        assert!(excluded.contains("::ffff:127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_invalid_entry() {
        let err = ExclusionList::parse(&["example.com".to_string()]).unwrap_err();
        assert_eq!(err, ExclusionError::Invalid("example.com".to_string()));
    }
}
