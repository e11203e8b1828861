//! Platform-specific tunnel and socket handling

#[cfg(target_os = "macos")]
pub mod mac;

#[cfg(target_os = "linux")]
pub mod linux;

use crate::device::NetworkInfo;
use crate::session::TunnelConfig;
use std::os::fd::OwnedFd;
use std::process::Command;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Failed to open tunnel device: {0}")]
    TunnelError(String),
    #[error("Failed to add route: {0}")]
    AddRouteError(String),
    #[error("Failed to configure address: {0}")]
    AddressError(String),
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// Host capabilities the management channel needs
pub trait TunnelPlatform: Send + Sync {
    /// Keep the engine's socket out of the tunnel. Takes ownership of our
    /// copy of the descriptor and closes it.
    fn protect(&self, fd: OwnedFd) -> bool;

    /// Create and configure the tunnel interface, returning its descriptor
    fn open_tunnel(&self, config: &TunnelConfig) -> Result<OwnedFd, PlatformError>;
}

/// Get the tunnel platform for the current OS
pub fn get_platform() -> Result<Box<dyn TunnelPlatform>, PlatformError> {
    #[cfg(target_os = "macos")]
    {
        Ok(Box::new(mac::MacPlatform::new()))
    }

    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(linux::LinuxPlatform::new()))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        Err(PlatformError::UnsupportedPlatform)
    }
}

/// The host's current uplink, from its default route. Tunnel interfaces
/// are skipped.
pub fn current_network() -> Option<NetworkInfo> {
    #[cfg(target_os = "macos")]
    {
        mac::current_network()
    }

    #[cfg(target_os = "linux")]
    {
        linux::current_network()
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Interfaces we or other VPNs create
#[cfg_attr(not(any(target_os = "macos", target_os = "linux")), allow(dead_code))]
fn is_tunnel_interface(name: &str) -> bool {
    ["tun", "utun", "tap", "wg", "ppp"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Run a routing tool, turning a failed exit into `make_err(stderr)`.
/// "File exists" counts as success: the kernel adds the interface's own
/// network by itself.
#[cfg_attr(not(any(target_os = "macos", target_os = "linux")), allow(dead_code))]
fn run_tool(
    program: &str,
    args: &[&str],
    make_err: fn(String) -> PlatformError,
) -> Result<(), PlatformError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| make_err(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("File exists") {
            return Ok(());
        }
        return Err(make_err(stderr.trim().to_string()));
    }

    Ok(())
}
