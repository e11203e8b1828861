//! ovpnctl - session control for an external OpenVPN-compatible engine
//!
//! This crate converts client profiles into engine configuration, drives
//! the engine over its local management socket, opens the tunnel device on
//! the engine's behalf and pauses or resumes the connection as the device's
//! network and screen state change.
//!
//! # Architecture
//!
//! - `vpn`: address ranges and split-route reconciliation
//! - `profile`: profile parsing, conversion and engine config rendering
//! - `management`: management protocol parsing, transport and channel
//! - `device`: network/screen/user pause state machine
//! - `session`: engine process, credentials, proxy, tunnel building and the orchestrator
//! - `platform`: tunnel device and route programming (Linux, macOS)
//! - `config`: settings file handling (TOML)
//! - `dialog`: terminal credential prompts
//!
//! # Usage
//!
//! ```bash
//! sudo ovpnctl connect office.ovpn
//! ```

pub mod config;
pub mod device;
pub mod dialog;
pub mod management;
pub mod platform;
pub mod profile;
pub mod session;
pub mod vpn;

pub use config::Settings;
pub use profile::Profile;
pub use session::{Session, SessionContext, SessionHandle};
pub use vpn::{AddressRange, RouteSpace};
