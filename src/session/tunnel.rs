//! Tunnel interface configuration assembled from engine pushes
//!
//! The engine announces the local address, DNS servers and routes one
//! `NEED-OK` at a time before asking for the tunnel descriptor.
//! [`TunnelBuilder`] collects them and [`TunnelBuilder::establish`] turns
//! them into a [`TunnelConfig`] for the platform layer.

use crate::vpn::{AddressRange, RouteError, RouteSpace};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, info, warn};

const DEFAULT_MTU: u32 = 1500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub local_ipv4: Option<AddressRange>,
    pub local_ipv6: Option<AddressRange>,
    pub mtu: u32,
    pub dns: Vec<String>,
    pub search_domain: Option<String>,
    pub routes_v4: Vec<AddressRange>,
    pub routes_v6: Vec<AddressRange>,
    /// Shown by the platform layer, usually the server name
    pub session_name: String,
}

impl fmt::Display for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |routes: &[AddressRange]| {
            routes
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        };
        write!(f, "ips:")?;
        if let Some(ip) = &self.local_ipv4 {
            write!(f, "{}", ip)?;
        }
        if let Some(ip) = &self.local_ipv6 {
            write!(f, " {}", ip)?;
        }
        write!(
            f,
            " routes: {} {} dns: {} domain: {} mtu: {}",
            join(&self.routes_v4),
            join(&self.routes_v6),
            self.dns.join(" "),
            self.search_domain.as_deref().unwrap_or(""),
            self.mtu
        )
    }
}

/// Device names the engine uses for the tunnel we hand it
fn is_tunnel_device(device: Option<&str>) -> bool {
    matches!(device, Some(d) if d.starts_with("tun") || d == "(null)" || d == "vpnservice-tun")
}

pub struct TunnelBuilder {
    local_ipv4: Option<AddressRange>,
    local_ipv6: Option<AddressRange>,
    remote_gateway: Option<String>,
    mtu: u32,
    dns: Vec<String>,
    domain: Option<String>,
    routes: RouteSpace,
    routes_v6: RouteSpace,
    session_name: String,
    last_config: Option<String>,
}

impl TunnelBuilder {
    pub fn new(session_name: &str) -> Self {
        Self {
            local_ipv4: None,
            local_ipv6: None,
            remote_gateway: None,
            mtu: DEFAULT_MTU,
            dns: Vec::new(),
            domain: None,
            routes: RouteSpace::new(),
            routes_v6: RouteSpace::new(),
            session_name: session_name.to_string(),
            last_config: None,
        }
    }

    pub fn add_dns(&mut self, server: &str) {
        self.dns.push(server.trim().to_string());
    }

    /// The first domain wins
    pub fn set_domain(&mut self, domain: &str) {
        if self.domain.is_none() {
            self.domain = Some(domain.trim().to_string());
        }
    }

    /// `IFCONFIG <local> <netmask-or-remote> <mtu> <mode>`
    pub fn set_local_ip(
        &mut self,
        local: &str,
        netmask: &str,
        mtu: u32,
        mode: &str,
    ) -> Result<(), RouteError> {
        let local_ip: Ipv4Addr = local
            .parse()
            .map_err(|_| RouteError::InvalidAddress(local.to_string()))?;
        let mask_ip: Ipv4Addr = netmask
            .parse()
            .map_err(|_| RouteError::InvalidNetmask(netmask.to_string()))?;
        self.mtu = mtu;

        let prefix = match crate::vpn::address::netmask_to_prefix(netmask) {
            Ok(len) if len < 32 => len,
            _ if netmask == "255.255.255.255" => 32,
            _ => {
                // Point-to-point: the second address is the peer. When it
                // sits in the same /30 (net30) or /31 assume that small net.
                let (len, mask) = if mode == "net30" {
                    (30, 0xffff_fffc_u32)
                } else {
                    (31, 0xffff_fffe_u32)
                };
                if u32::from(mask_ip) & mask == u32::from(local_ip) & mask {
                    len
                } else {
                    if mode != "p2p" {
                        warn!(
                            "Local address {} with netmask {} is not a subnet in {} mode, using /32",
                            local, netmask, mode
                        );
                    }
                    32
                }
            }
        };

        if (mode == "p2p" && prefix < 32) || (mode == "net30" && prefix < 30) {
            warn!(
                "Address {}/{} looks like a subnet but mode is {}",
                local, prefix, mode
            );
        }

        let address = AddressRange::new(IpAddr::V4(local_ip), prefix, true)?;
        if prefix <= 31 {
            let mut interface_route = address;
            interface_route.normalize();
            self.routes.add_include(interface_route);
        }
        self.local_ipv4 = Some(address);
        self.remote_gateway = Some(netmask.to_string());
        Ok(())
    }

    /// `IFCONFIG6 <address/len> ...`
    pub fn set_local_ipv6(&mut self, spec: &str) -> Result<(), RouteError> {
        let address = spec.split_whitespace().next().unwrap_or(spec);
        let range = AddressRange::parse_cidr(address, true)?;
        if !range.is_ipv6() {
            return Err(RouteError::InvalidAddress(spec.to_string()));
        }
        self.local_ipv6 = Some(range);
        Ok(())
    }

    /// `ROUTE <network> <netmask> <gateway> [dev <device>]`
    pub fn add_route(
        &mut self,
        network: &str,
        netmask: &str,
        gateway: &str,
        device: Option<&str>,
    ) -> Result<(), RouteError> {
        let mut route = AddressRange::from_netmask(network, netmask, true)?;
        let Some(local) = self.local_ipv4 else {
            return Err(RouteError::LocalAddressUnset(route.to_string()));
        };

        let mut include = is_tunnel_device(device);
        if let Ok(gateway_ip) = gateway.parse::<IpAddr>() {
            if local.contains_address(gateway_ip) {
                include = true;
            }
        }
        if gateway == "255.255.255.255" || self.remote_gateway.as_deref() == Some(gateway) {
            include = true;
        }

        if route.normalize() {
            warn!(
                "Route {}/{} is not a network address, using {}",
                network,
                route.prefix_len(),
                route.network_address()
            );
        }
        self.routes.add(route.with_included(include));
        Ok(())
    }

    /// `ROUTE6 <network/len> [device]`
    pub fn add_route_v6(&mut self, network: &str, device: Option<&str>) -> Result<(), RouteError> {
        let mut route = AddressRange::parse_cidr(network, is_tunnel_device(device))?;
        if !route.is_ipv6() {
            return Err(RouteError::InvalidAddress(network.to_string()));
        }
        route.normalize();
        self.routes_v6.add(route);
        Ok(())
    }

    fn snapshot(&self) -> TunnelConfig {
        let multicast = AddressRange::new(IpAddr::V4(Ipv4Addr::new(224, 0, 0, 0)), 3, true)
            .ok();
        let routes_v4 = self
            .routes
            .positive_routes()
            .into_iter()
            .filter(|route| {
                let skip = multicast.as_ref().is_some_and(|m| m.contains(route));
                if skip {
                    debug!("Ignoring multicast route {}", route);
                }
                !skip
            })
            .collect();
        TunnelConfig {
            local_ipv4: self.local_ipv4,
            local_ipv6: self.local_ipv6,
            mtu: self.mtu,
            dns: self.dns.clone(),
            search_domain: self.domain.clone(),
            routes_v4,
            routes_v6: self.routes_v6.positive_routes(),
            session_name: self.session_name.clone(),
        }
    }

    /// `PERSIST_TUN_ACTION` answer: keep the open tunnel if nothing changed
    pub fn reopen_status(&self) -> &'static str {
        match &self.last_config {
            Some(last) if *last == self.snapshot().to_string() => "NOACTION",
            _ => "OPEN_BEFORE_CLOSE",
        }
    }

    /// Finish the configuration and start collecting the next one. `None`
    /// when the engine never sent a local address.
    pub fn establish(&mut self) -> Option<TunnelConfig> {
        if self.local_ipv4.is_none() && self.local_ipv6.is_none() {
            warn!("Refusing to open tunnel without a local address");
            return None;
        }
        let config = self.snapshot();
        info!(
            "Tunnel: local {} {} mtu {}, dns [{}], routes [{}] [{}]",
            config
                .local_ipv4
                .map(|a| a.to_string())
                .unwrap_or_default(),
            config
                .local_ipv6
                .map(|a| a.to_string())
                .unwrap_or_default(),
            config.mtu,
            config.dns.join(", "),
            self.routes
                .networks(true)
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(", "),
            self.routes
                .networks(false)
                .iter()
                .map(|r| format!("!{}", r))
                .collect::<Vec<_>>()
                .join(", "),
        );
        if config.dns.is_empty() {
            info!("No DNS servers pushed, keeping the system resolver");
        }
        self.last_config = Some(config.to_string());

        self.dns.clear();
        self.routes.clear();
        self.routes_v6.clear();
        self.local_ipv4 = None;
        self.local_ipv6 = None;
        self.domain = None;
        Some(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routes(config: &TunnelConfig) -> Vec<String> {
        config.routes_v4.iter().map(|r| r.to_string()).collect()
    }

    #[test]
    fn test_subnet_ifconfig_adds_local_network() {
        let mut builder = TunnelBuilder::new("vpn.example.com");
        builder
            .set_local_ip("10.8.0.6", "255.255.255.0", 1400, "subnet")
            .unwrap();
        let config = builder.establish().unwrap();
        assert_eq!(config.local_ipv4.unwrap().to_string(), "10.8.0.6/24");
        assert_eq!(config.mtu, 1400);
        assert_eq!(routes(&config), vec!["10.8.0.0/24"]);
    }

    #[test]
    fn test_net30_ifconfig() {
        let mut builder = TunnelBuilder::new("s");
        builder
            .set_local_ip("10.8.0.6", "10.8.0.5", 1500, "net30")
            .unwrap();
        assert_eq!(builder.local_ipv4.unwrap().prefix_len(), 30);

        let mut builder = TunnelBuilder::new("s");
        builder
            .set_local_ip("10.8.0.6", "192.168.1.1", 1500, "p2p")
            .unwrap();
        assert_eq!(builder.local_ipv4.unwrap().prefix_len(), 32);
    }

    #[test]
    fn test_route_inclusion_rules() {
        let mut builder = TunnelBuilder::new("s");
        builder
            .set_local_ip("10.8.0.6", "255.255.255.0", 1500, "subnet")
            .unwrap();
        // Gateway inside the local network
        builder
            .add_route("172.16.0.0", "255.240.0.0", "10.8.0.1", None)
            .unwrap();
        // Tunnel device
        builder
            .add_route("192.168.10.0", "255.255.255.0", "1.2.3.4", Some("tun0"))
            .unwrap();
        // Neither: excluded
        builder
            .add_route("172.20.0.0", "255.255.0.0", "192.0.2.1", Some("eth0"))
            .unwrap();
        // Multicast is never routed into the tunnel
        builder
            .add_route("239.0.0.0", "255.0.0.0", "10.8.0.1", None)
            .unwrap();

        let config = builder.establish().unwrap();
        let routes = routes(&config);
        assert!(routes.contains(&"10.8.0.0/24".to_string()));
        assert!(routes.contains(&"192.168.10.0/24".to_string()));
        assert!(!routes.iter().any(|r| r.starts_with("239.")));
        assert!(!routes.contains(&"172.16.0.0/12".to_string()));
        assert!(!routes.iter().any(|r| r.starts_with("172.20.")));
        assert!(routes.iter().any(|r| r.starts_with("172.16.")));
    }

    #[test]
    fn test_route_without_local_ip() {
        let mut builder = TunnelBuilder::new("s");
        let err = builder
            .add_route("10.0.0.0", "255.0.0.0", "10.8.0.1", None)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Local IP address unset, cannot add route 10.0.0.0/8"
        );
    }

    #[test]
    fn test_non_network_route_is_normalized() {
        let mut builder = TunnelBuilder::new("s");
        builder
            .set_local_ip("10.8.0.6", "255.255.255.255", 1500, "subnet")
            .unwrap();
        builder
            .add_route("10.1.2.3", "255.255.0.0", "10.8.0.6", None)
            .unwrap();
        let config = builder.establish().unwrap();
        assert_eq!(routes(&config), vec!["10.1.0.0/16"]);
    }

    #[test]
    fn test_ipv6_routes() {
        let mut builder = TunnelBuilder::new("s");
        builder.set_local_ipv6("2001:db8::2/64 2001:db8::1").unwrap();
        builder.add_route_v6("2001:db8:1::/48", Some("tun0")).unwrap();
        builder.add_route_v6("2001:db8:2::/48", Some("eth0")).unwrap();
        let config = builder.establish().unwrap();
        assert_eq!(config.local_ipv6.unwrap().to_string(), "2001:db8::2/64");
        let v6: Vec<String> = config.routes_v6.iter().map(|r| r.to_string()).collect();
        assert_eq!(v6, vec!["2001:db8:1::/48"]);
    }

    #[test]
    fn test_establish_requires_address() {
        let mut builder = TunnelBuilder::new("s");
        builder.add_dns("10.8.0.1");
        assert!(builder.establish().is_none());
    }

    #[test]
    fn test_reopen_status() {
        let mut builder = TunnelBuilder::new("s");
        assert_eq!(builder.reopen_status(), "OPEN_BEFORE_CLOSE");

        let push = |b: &mut TunnelBuilder| {
            b.set_local_ip("10.8.0.6", "255.255.255.0", 1500, "subnet").unwrap();
            b.add_dns("10.8.0.1");
            b.set_domain("corp.example");
            b.set_domain("ignored.example");
        };
        push(&mut builder);
        let config = builder.establish().unwrap();
        assert_eq!(config.search_domain.as_deref(), Some("corp.example"));

        push(&mut builder);
        assert_eq!(builder.reopen_status(), "NOACTION");

        builder.add_dns("10.8.0.2");
        assert_eq!(builder.reopen_status(), "OPEN_BEFORE_CLOSE");
    }
}
