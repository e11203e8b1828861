//! Engine management interface: line parsing, socket transport and the
//! control channel state machine

pub mod channel;
pub mod command;
pub mod transport;

pub use channel::{ChannelOptions, ChannelPhase, ManagementChannel, ManagementError, ManagementHandle};
pub use command::{ManagementCommand, ProtocolError};
pub use transport::FdStream;
