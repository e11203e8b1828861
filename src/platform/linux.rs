//! Linux tunnel device and routing

use super::{PlatformError, TunnelPlatform, is_tunnel_interface, run_tool};
use crate::device::NetworkInfo;
use crate::session::TunnelConfig;
use nix::sys::socket::{setsockopt, sockopt};
use std::net::Ipv4Addr;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use tracing::{debug, info, warn};
use tun::AbstractDevice;

const PROC_NET_ROUTE: &str = "/proc/net/route";
const RTF_UP: u32 = 0x0001;

/// Firewall mark put on protected sockets ("ov")
pub const PROTECT_MARK: u32 = 0x6f76;

pub struct LinuxPlatform {
    mark: u32,
}

impl LinuxPlatform {
    pub fn new() -> Self {
        Self { mark: PROTECT_MARK }
    }
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelPlatform for LinuxPlatform {
    fn protect(&self, fd: OwnedFd) -> bool {
        match setsockopt(&fd, sockopt::Mark, &self.mark) {
            Ok(()) => {
                debug!("Marked engine socket with {:#x}", self.mark);
                true
            }
            Err(e) => {
                warn!("Failed to protect engine socket: {}", e);
                false
            }
        }
    }

    fn open_tunnel(&self, config: &TunnelConfig) -> Result<OwnedFd, PlatformError> {
        let mut tun_config = tun::Configuration::default();
        if let Some(local) = config.local_ipv4 {
            tun_config.address(local.address());
            if let Some(mask) = local.netmask() {
                tun_config.netmask(mask);
            }
        }
        tun_config
            .mtu(u16::try_from(config.mtu).unwrap_or(1500))
            .up();

        let device =
            tun::create(&tun_config).map_err(|e| PlatformError::TunnelError(e.to_string()))?;
        let name = device
            .tun_name()
            .map_err(|e| PlatformError::TunnelError(e.to_string()))?;
        info!("Tunnel device {} created for {}", name, config.session_name);

        if let Some(local) = config.local_ipv6 {
            let cidr = local.to_string();
            run_tool("ip", &["-6", "addr", "add", &cidr, "dev", &name], PlatformError::AddressError)?;
        }

        for route in config.routes_v4.iter().chain(&config.routes_v6) {
            let cidr = route.to_string();
            let family = if route.is_ipv6() { "-6" } else { "-4" };
            match run_tool(
                "ip",
                &[family, "route", "add", &cidr, "dev", &name],
                PlatformError::AddRouteError,
            ) {
                Ok(()) => debug!("Route {} via {}", cidr, name),
                Err(e) => warn!("{}", e),
            }
        }

        // SAFETY: into_raw_fd hands over sole ownership of the descriptor
        Ok(unsafe { OwnedFd::from_raw_fd(device.into_raw_fd()) })
    }
}

pub fn current_network() -> Option<NetworkInfo> {
    let content = match std::fs::read_to_string(PROC_NET_ROUTE) {
        Ok(content) => content,
        Err(e) => {
            debug!("Could not read {}: {}", PROC_NET_ROUTE, e);
            return None;
        }
    };
    let (interface, gateway) = parse_default_route(&content)?;
    let operstate = std::fs::read_to_string(format!("/sys/class/net/{}/operstate", interface))
        .unwrap_or_default();
    Some(NetworkInfo {
        connected: operstate.trim() != "down",
        kind: interface,
        detail: Some(gateway.to_string()),
    })
}

/// Lowest-metric IPv4 default route in `/proc/net/route` format that does
/// not go through a tunnel
fn parse_default_route(content: &str) -> Option<(String, Ipv4Addr)> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 || fields[1] != "00000000" || fields[7] != "00000000" {
                return None;
            }
            let flags = u32::from_str_radix(fields[3], 16).ok()?;
            if flags & RTF_UP == 0 || is_tunnel_interface(fields[0]) {
                return None;
            }
            let gateway = u32::from_str_radix(fields[2], 16).ok()?;
            let metric: u32 = fields[6].parse().ok()?;
            Some((metric, fields[0].to_string(), Ipv4Addr::from(gateway.to_le_bytes())))
        })
        .min_by_key(|(metric, _, _)| *metric)
        .map(|(_, interface, gateway)| (interface, gateway))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTES: &str = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT\n\
        tun0\t00000000\t00000000\t0001\t0\t0\t0\t00000000\t0\t0\t0\n\
        wlan0\t00000000\t0100A8C0\t0003\t0\t0\t600\t00000000\t0\t0\t0\n\
        eth0\t00000000\t0102A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0\n\
        eth0\t0002A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0\n";

    #[test]
    fn test_parse_default_route_prefers_lowest_metric() {
        assert_eq!(
            parse_default_route(ROUTES),
            Some(("eth0".to_string(), Ipv4Addr::new(192, 168, 2, 1)))
        );
    }

    #[test]
    fn test_parse_default_route_none() {
        let header = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT\n";
        assert_eq!(parse_default_route(header), None);
        let down = format!("{}eth0\t00000000\t0102A8C0\t0002\t0\t0\t100\t00000000\t0\t0\t0\n", header);
        assert_eq!(parse_default_route(&down), None);
    }
}
