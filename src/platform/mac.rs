//! macOS tunnel device and routing

use super::{PlatformError, TunnelPlatform, is_tunnel_interface, run_tool};
use crate::device::NetworkInfo;
use crate::session::TunnelConfig;
use std::process::Command;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use tracing::{debug, info, warn};
use tun::AbstractDevice;

pub struct MacPlatform;

impl MacPlatform {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MacPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelPlatform for MacPlatform {
    fn protect(&self, _fd: OwnedFd) -> bool {
        // Split routes never cover the server, nothing to do
        debug!("Socket protection is a no-op on macOS");
        true
    }

    fn open_tunnel(&self, config: &TunnelConfig) -> Result<OwnedFd, PlatformError> {
        let mut tun_config = tun::Configuration::default();
        if let Some(local) = config.local_ipv4 {
            tun_config.address(local.address()).destination(local.address());
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
            run_tool("ifconfig", &[&name, "inet6", &cidr], PlatformError::AddressError)?;
        }

        for route in config.routes_v4.iter().chain(&config.routes_v6) {
            let cidr = route.to_string();
            let family = if route.is_ipv6() { "-inet6" } else { "-net" };
            match run_tool(
                "route",
                &["-n", "add", family, &cidr, "-interface", &name],
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
    let output = match Command::new("route").args(["-n", "get", "default"]).output() {
        Ok(output) if output.status.success() => output,
        Ok(_) => return None,
        Err(e) => {
            debug!("Could not query default route: {}", e);
            return None;
        }
    };
    let (interface, gateway) = parse_route_get(&String::from_utf8_lossy(&output.stdout))?;
    Some(NetworkInfo {
        kind: interface,
        detail: gateway,
        connected: true,
    })
}

/// Interface and gateway from `route -n get default`
fn parse_route_get(output: &str) -> Option<(String, Option<String>)> {
    let mut interface = None;
    let mut gateway = None;
    for line in output.lines() {
        match line.trim().split_once(':') {
            Some(("interface", value)) => interface = Some(value.trim().to_string()),
            Some(("gateway", value)) => gateway = Some(value.trim().to_string()),
            _ => {}
        }
    }
    let interface = interface.filter(|name| !is_tunnel_interface(name))?;
    Some((interface, gateway))
}
