//! Address ranges and split-tunnel route reconciliation

pub mod address;
pub mod routing;

pub use address::{AddressRange, Family};
pub use routing::{RouteError, RouteSpace};
