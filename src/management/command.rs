//! Lines received from the engine's management interface
//!
//! Real-time notifications look like `>CMD:rest`. Replies to commands start
//! with `SUCCESS:` or `ERROR:`. Parsing is pure; acting on a command is the
//! channel's job.

use crate::session::status::LogLevel;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed {command} line from management interface: {line}")]
    Malformed { command: &'static str, line: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementCommand {
    /// Greeting
    Info(String),
    PasswordRequest {
        kind: String,
    },
    PasswordVerifyFailed {
        kind: String,
        detail: String,
    },
    Hold {
        wait_seconds: u64,
    },
    NeedOk {
        kind: String,
        arg: String,
    },
    ByteCount {
        bytes_in: u64,
        bytes_out: u64,
    },
    State {
        name: String,
        detail: String,
    },
    ProxyQuery {
        proto_hint: Option<String>,
    },
    LogLine {
        level: LogLevel,
        verbosity: u8,
        text: String,
    },
    RsaSignRequest {
        data: String,
    },
    Success(String),
    Error(String),
    /// Bare `PROTECTFD: ` notification
    ProtectFd,
    Unrecognized(String),
}

impl ManagementCommand {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        if let Some(notification) = line.strip_prefix('>') {
            if let Some((cmd, rest)) = notification.split_once(':') {
                return parse_notification(line, cmd, rest);
            }
        }
        if let Some(rest) = line.strip_prefix("SUCCESS:") {
            return Ok(ManagementCommand::Success(rest.trim().to_string()));
        }
        if let Some(rest) = line.strip_prefix("ERROR:") {
            return Ok(ManagementCommand::Error(rest.trim().to_string()));
        }
        if line.starts_with("PROTECTFD: ") {
            return Ok(ManagementCommand::ProtectFd);
        }
        Ok(ManagementCommand::Unrecognized(line.to_string()))
    }
}

fn parse_notification(line: &str, cmd: &str, rest: &str) -> Result<ManagementCommand, ProtocolError> {
    let malformed = |command: &'static str| ProtocolError::Malformed {
        command,
        line: line.to_string(),
    };

    let command = match cmd {
        "INFO" => ManagementCommand::Info(rest.to_string()),
        "PASSWORD" => {
            let (kind, after) = quoted(rest).ok_or_else(|| malformed("PASSWORD"))?;
            if rest.starts_with("Verification Failed") {
                ManagementCommand::PasswordVerifyFailed {
                    kind,
                    detail: after.trim().to_string(),
                }
            } else {
                ManagementCommand::PasswordRequest { kind }
            }
        }
        "HOLD" => {
            // Older engines omit the wait time
            let wait_seconds = match rest.split(':').nth(1) {
                Some(wait) => wait.trim().parse().map_err(|_| malformed("HOLD"))?,
                None => 0,
            };
            ManagementCommand::Hold { wait_seconds }
        }
        "NEED-OK" => {
            let (kind, _) = quoted(rest).ok_or_else(|| malformed("NEED-OK"))?;
            let arg = rest.split_once(':').map(|(_, a)| a).unwrap_or_default();
            ManagementCommand::NeedOk {
                kind,
                arg: arg.to_string(),
            }
        }
        "BYTECOUNT" => {
            let (bytes_in, bytes_out) = rest.split_once(',').ok_or_else(|| malformed("BYTECOUNT"))?;
            ManagementCommand::ByteCount {
                bytes_in: bytes_in.trim().parse().map_err(|_| malformed("BYTECOUNT"))?,
                bytes_out: bytes_out.trim().parse().map_err(|_| malformed("BYTECOUNT"))?,
            }
        }
        "STATE" => {
            let mut parts = rest.splitn(3, ',');
            let _timestamp = parts.next();
            let name = parts.next().ok_or_else(|| malformed("STATE"))?;
            let detail = match parts.next() {
                None | Some(",,") => "",
                Some(detail) => detail,
            };
            ManagementCommand::State {
                name: name.to_string(),
                detail: detail.to_string(),
            }
        }
        "PROXY" => ManagementCommand::ProxyQuery {
            proto_hint: rest.splitn(3, ',').nth(1).map(str::to_string),
        },
        "LOG" => {
            let mut parts = rest.splitn(3, ',');
            let _timestamp = parts.next();
            let (Some(flag), Some(remainder)) = (parts.next(), parts.next()) else {
                return Err(malformed("LOG"));
            };
            // The numeric level is optional
            let (verbosity, text) = match remainder.split_once(',') {
                Some((level, text)) => match level.trim().parse::<u8>() {
                    Ok(level) => (level & 0x0F, text),
                    Err(_) => (0, remainder),
                },
                None => (0, remainder),
            };
            let verbosity = if text.starts_with("MANAGEMENT: CMD") {
                verbosity.max(4)
            } else {
                verbosity
            };
            ManagementCommand::LogLine {
                level: LogLevel::from_flag(flag),
                verbosity,
                text: text.to_string(),
            }
        }
        "RSA_SIGN" => ManagementCommand::RsaSignRequest {
            data: rest.to_string(),
        },
        _ => ManagementCommand::Unrecognized(line.to_string()),
    };
    Ok(command)
}

/// The first single-quoted word and everything after its closing quote
fn quoted(text: &str) -> Option<(String, &str)> {
    let start = text.find('\'')? + 1;
    let len = text[start..].find('\'')?;
    Some((text[start..start + len].to_string(), &text[start + len + 1..]))
}
