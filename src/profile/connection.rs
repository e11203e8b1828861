//! One reachable endpoint of a profile

use super::parser::ParseError;
use super::render::escape;
use serde::Serialize;

pub const DEFAULT_SERVER: &str = "openvpn.example.com";
pub const DEFAULT_PORT: u16 = 1194;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    pub server_name: String,
    pub server_port: u16,
    pub use_udp: bool,
    /// Seconds, 0 leaves the engine default
    pub connect_timeout: u32,
    /// Raw lines from a `<connection>` block that map to no field
    pub custom_directives: Vec<String>,
    pub enabled: bool,
}

impl Default for Connection {
    fn default() -> Self {
        Self {
            server_name: DEFAULT_SERVER.to_string(),
            server_port: DEFAULT_PORT,
            use_udp: true,
            connect_timeout: 0,
            custom_directives: Vec::new(),
            enabled: true,
        }
    }
}

impl Connection {
    /// True when the connection can be written as a bare `remote` line
    pub fn is_only_remote(&self) -> bool {
        self.connect_timeout == 0 && self.custom_directives.is_empty()
    }

    pub fn proto_name(&self) -> &'static str {
        if self.use_udp { "udp" } else { "tcp-client" }
    }

    /// Engine directives describing this endpoint
    pub fn engine_block(&self) -> String {
        let mut block = format!(
            "remote {} {} {}\n",
            escape(&self.server_name),
            self.server_port,
            self.proto_name()
        );
        if self.connect_timeout > 0 {
            block.push_str(&format!("connect-timeout {}\n", self.connect_timeout));
        }
        for line in &self.custom_directives {
            block.push_str(line);
            block.push('\n');
        }
        block
    }
}

/// Classify a transport name as UDP (`true`) or TCP (`false`)
pub fn is_udp_proto(proto: &str) -> Result<bool, ParseError> {
    match proto {
        "udp" | "udp4" | "udp6" => Ok(true),
        "tcp" | "tcp4" | "tcp6" | "tcp-client" => Ok(false),
        p if p.ends_with("tcp4-client") || p.ends_with("tcp6-client") => Ok(false),
        p => Err(ParseError::UnsupportedProtocol(p.to_string())),
    }
}

/// Parse a port number for `option`
pub fn parse_port(option: &str, value: &str) -> Result<u16, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidNumber {
        option: option.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_connection() {
        let conn = Connection::default();
        assert_eq!(conn.server_name, "openvpn.example.com");
        assert_eq!(conn.server_port, 1194);
        assert!(conn.use_udp);
        assert!(conn.enabled);
        assert!(conn.is_only_remote());
    }

    #[test]
    fn test_is_udp_proto() {
        assert!(is_udp_proto("udp").unwrap());
        assert!(is_udp_proto("udp6").unwrap());
        assert!(!is_udp_proto("tcp").unwrap());
        assert!(!is_udp_proto("tcp-client").unwrap());
        assert!(!is_udp_proto("tcp6-client").unwrap());
        assert_eq!(
            is_udp_proto("sctp"),
            Err(ParseError::UnsupportedProtocol("sctp".to_string()))
        );
    }

    #[test]
    fn test_engine_block() {
        let conn = Connection {
            server_name: "vpn.example.org".to_string(),
            server_port: 443,
            use_udp: false,
            connect_timeout: 15,
            custom_directives: vec!["http-proxy proxy.local 3128".to_string()],
            enabled: true,
        };
        assert!(!conn.is_only_remote());
        assert_eq!(
            conn.engine_block(),
            "remote vpn.example.org 443 tcp-client\nconnect-timeout 15\nhttp-proxy proxy.local 3128\n"
        );
    }

    #[test]
    fn test_template_clone_is_independent() {
        let template = Connection {
            custom_directives: vec!["float".to_string()],
            ..Connection::default()
        };
        let mut copy = template.clone();
        copy.server_name = "other".to_string();
        copy.custom_directives.push("nobind".to_string());
        assert_eq!(template.server_name, "openvpn.example.com");
        assert_eq!(template.custom_directives, vec!["float"]);
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("port", "443").unwrap(), 443);
        assert!(matches!(
            parse_port("rport", "http"),
            Err(ParseError::InvalidNumber { .. })
        ));
    }
}
