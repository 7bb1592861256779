//! Region selection.
//!
//! Picks the point of presence a client should use: the region whose
//! networks contain the client's address, else the account's home region,
//! else the client's hint, else this process's own region. Regions marked
//! non-operational are skipped at every step.

use std::net::IpAddr;

use crate::config::RegionConfig;

/// An address block such as `10.0.0.0/8` or `2001:db8::/32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    addr: IpAddr,
    prefix: u8,
}

impl Network {
    pub fn parse(s: &str) -> Option<Self> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr.parse::<IpAddr>().ok()?, prefix.parse::<u8>().ok()?),
            None => {
                let addr = s.parse::<IpAddr>().ok()?;
                let full = if addr.is_ipv4() { 32 } else { 128 };
                (addr, full)
            }
        };
        let max = if addr.is_ipv4() { 32 } else { 128 };
        (prefix <= max).then_some(Self { addr, prefix })
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - self.prefix as u32).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - self.prefix as u32).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
struct Region {
    name: String,
    endpoint: String,
    operational: bool,
    networks: Vec<Network>,
}

/// Outcome of routing a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionDecision {
    /// Serve here, pinned to the named region.
    Local(String),
    /// Send the client elsewhere.
    Redirect { region: String, endpoint: String },
}

pub struct RegionRouter {
    local: String,
    regions: Vec<Region>,
}

impl RegionRouter {
    pub fn new(local: &str, configs: &[RegionConfig]) -> Self {
        let regions = configs
            .iter()
            .map(|c| Region {
                name: c.name.clone(),
                endpoint: c.endpoint.clone(),
                operational: c.operational,
                networks: c
                    .networks
                    .iter()
                    .filter_map(|n| {
                        let parsed = Network::parse(n);
                        if parsed.is_none() {
                            tracing::warn!("Ignoring malformed network '{}' for region {}", n, c.name);
                        }
                        parsed
                    })
                    .collect(),
            })
            .collect();
        Self {
            local: local.to_string(),
            regions,
        }
    }

    pub fn local_region(&self) -> &str {
        &self.local
    }

    fn find(&self, name: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.name == name)
    }

    fn is_operational(&self, name: &str) -> bool {
        match self.find(name) {
            Some(region) => region.operational,
            None => name == self.local,
        }
    }

    /// Region with the most specific network containing `ip`.
    fn by_origin(&self, ip: IpAddr) -> Option<&Region> {
        self.regions
            .iter()
            .filter(|r| r.operational)
            .filter_map(|r| {
                r.networks
                    .iter()
                    .filter(|n| n.contains(ip))
                    .map(|n| n.prefix())
                    .max()
                    .map(|p| (p, r))
            })
            .max_by_key(|(p, _)| *p)
            .map(|(_, r)| r)
    }

    /// Name of the region that should serve this client.
    pub fn resolve(&self, origin: Option<IpAddr>, home: Option<&str>, hint: Option<&str>) -> String {
        if let Some(region) = origin.and_then(|ip| self.by_origin(ip)) {
            return region.name.clone();
        }
        for name in [home, hint].into_iter().flatten() {
            if self.is_operational(name) {
                return name.to_string();
            }
        }
        self.local.clone()
    }

    /// Route a handshake. A client already following a redirect is served
    /// here unconditionally so it can never bounce twice.
    pub fn route(
        &self,
        origin: Option<IpAddr>,
        home: Option<&str>,
        hint: Option<&str>,
        redirected: bool,
    ) -> RegionDecision {
        if redirected {
            return RegionDecision::Local(self.local.clone());
        }
        let target = self.resolve(origin, home, hint);
        if target == self.local {
            return RegionDecision::Local(target);
        }
        match self.find(&target) {
            Some(region) => RegionDecision::Redirect {
                region: region.name.clone(),
                endpoint: region.endpoint.clone(),
            },
            None => RegionDecision::Local(self.local.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(name: &str, operational: bool, networks: &[&str]) -> RegionConfig {
        RegionConfig {
            name: name.to_string(),
            endpoint: format!("wss://{}.relay.example/ws", name),
            operational,
            networks: networks.iter().map(|n| n.to_string()).collect(),
        }
    }

    fn router() -> RegionRouter {
        RegionRouter::new(
            "eu-west",
            &[
                region("eu-west", true, &["10.1.0.0/16"]),
                region("us-east", true, &["10.2.0.0/16", "2001:db8::/32"]),
                region("ap-south", false, &["10.3.0.0/16"]),
            ],
        )
    }

    #[test]
    fn test_network_contains() {
        let net = Network::parse("10.2.0.0/16").unwrap();
        assert!(net.contains("10.2.44.1".parse().unwrap()));
        assert!(!net.contains("10.3.0.1".parse().unwrap()));
        assert!(Network::parse("0.0.0.0/0").unwrap().contains("8.8.8.8".parse().unwrap()));
        assert!(Network::parse("10.0.0.0/33").is_none());
        assert!(Network::parse("bogus").is_none());
    }

    #[test]
    fn test_origin_match_redirects() {
        let decision = router().route(Some("10.2.0.9".parse().unwrap()), None, None, false);
        assert_eq!(
            decision,
            RegionDecision::Redirect {
                region: "us-east".to_string(),
                endpoint: "wss://us-east.relay.example/ws".to_string(),
            }
        );
    }

    #[test]
    fn test_ipv6_origin() {
        let r = router();
        assert_eq!(r.resolve(Some("2001:db8::1".parse().unwrap()), None, None), "us-east");
    }

    #[test]
    fn test_unknown_origin_falls_back_to_home() {
        let r = router();
        assert_eq!(r.resolve(Some("192.168.1.1".parse().unwrap()), Some("us-east"), None), "us-east");
        assert_eq!(r.resolve(None, None, Some("us-east")), "us-east");
        assert_eq!(r.resolve(None, None, None), "eu-west");
    }

    #[test]
    fn test_non_operational_region_skipped() {
        let r = router();
        assert_eq!(r.resolve(Some("10.3.0.1".parse().unwrap()), None, None), "eu-west");
        assert_eq!(r.resolve(None, Some("ap-south"), None), "eu-west");
    }

    #[test]
    fn test_redirected_client_is_served_locally() {
        let decision = router().route(Some("10.2.0.9".parse().unwrap()), None, None, true);
        assert_eq!(decision, RegionDecision::Local("eu-west".to_string()));
    }

    #[test]
    fn test_no_regions_configured() {
        let r = RegionRouter::new("local", &[]);
        assert_eq!(
            r.route(Some("10.0.0.1".parse().unwrap()), Some("elsewhere"), None, false),
            RegionDecision::Local("local".to_string())
        );
    }
}
