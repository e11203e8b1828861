//! Render a profile into the configuration text the engine is started with

use super::model::{AuthKind, AuthRetry, FileSource, Profile, TlsAuthMode, X509Verify};
use std::fmt::Write;
use std::path::PathBuf;

const DEFAULT_CONNECT_RETRY: &str = "2";
const DEFAULT_CONNECT_RETRY_MAX_TIME: &str = "300";
const DEFAULT_MSSFIX: u32 = 1450;
const DEFAULT_TUN_MTU: u32 = 1500;

/// Quote and escape a value so the engine's tokenizer reads it back
/// unchanged.
pub fn escape(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n");
    let needs_quotes = escaped != value
        || value.is_empty()
        || value.contains(char::is_whitespace)
        || value.contains('#')
        || value.contains(';');
    if needs_quotes {
        format!("\"{}\"", escaped)
    } else {
        escaped
    }
}

/// Session-specific settings that are not part of the profile
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub management_socket: PathBuf,
    /// Ask the controller for a proxy before connecting
    pub query_proxy: bool,
    /// Used when the profile has no `verb`
    pub verbosity: u8,
}

fn file_data(name: &str, source: &FileSource) -> String {
    match source {
        FileSource::Inline(body) => format!("<{}>\n{}\n</{}>\n", name, body, name),
        FileSource::Path(path) => format!("{} {}\n", name, escape(path)),
    }
}

fn push_file(cfg: &mut String, name: &str, source: Option<&FileSource>) {
    if let Some(source) = source {
        cfg.push_str(&file_data(name, source));
    }
}

impl Profile {
    /// Engine configuration for this profile, wired to a management socket
    pub fn engine_config(&self, options: &EngineOptions) -> String {
        let mut cfg = String::new();

        cfg.push_str("# Enables connection to the controller\n");
        let _ = writeln!(
            cfg,
            "management {} unix",
            escape(&options.management_socket.to_string_lossy())
        );
        cfg.push_str("management-client\n");
        cfg.push_str("management-query-passwords\n");
        cfg.push_str("management-hold\n\n");
        let _ = writeln!(
            cfg,
            "setenv IV_GUI_VER {}",
            escape(&format!("ovpnctl {}", env!("CARGO_PKG_VERSION")))
        );
        cfg.push_str("machine-readable-output\n");
        cfg.push_str("ifconfig-nowarn\n");

        let tls_client = self.auth_kind != AuthKind::StaticKey;
        if tls_client && self.pull {
            cfg.push_str("client\n");
        } else if self.pull {
            cfg.push_str("pull\n");
        } else if tls_client {
            cfg.push_str("tls-client\n");
        }

        let verb = self
            .verb
            .clone()
            .unwrap_or_else(|| options.verbosity.to_string());
        let _ = writeln!(cfg, "verb {}", verb);

        if let Some(max) = self.connect_retry_max.as_deref().filter(|m| *m != "-1") {
            let _ = writeln!(cfg, "connect-retry-max {}", max);
        }
        let _ = writeln!(
            cfg,
            "connect-retry {} {}",
            self.connect_retry.as_deref().unwrap_or(DEFAULT_CONNECT_RETRY),
            self.connect_retry_max_time
                .as_deref()
                .unwrap_or(DEFAULT_CONNECT_RETRY_MAX_TIME)
        );
        cfg.push_str("resolv-retry 60\n");
        cfg.push_str("dev tun\n");

        let plain_remotes = self.connections.iter().all(|c| c.is_only_remote());
        if self.connections.len() == 1 {
            cfg.push_str(&self.connections[0].engine_block());
        } else {
            if self.remote_random {
                cfg.push_str("remote-random\n");
            }
            if plain_remotes {
                for conn in self.enabled_connections() {
                    cfg.push_str(&conn.engine_block());
                }
            }
        }

        self.push_auth(&mut cfg);

        if self.is_user_pass_auth() {
            let retry = match self.auth_retry {
                AuthRetry::NoneForget => "none",
                AuthRetry::NoInteract => "nointeract",
                AuthRetry::Interact => "interact",
            };
            let _ = writeln!(cfg, "auth-retry {}", retry);
        }

        push_file(&mut cfg, "crl-verify", self.crl.as_ref());
        if self.lzo {
            cfg.push_str("comp-lzo\n");
        }

        if let Some(tls_auth) = &self.tls_auth {
            let name = match tls_auth.mode {
                TlsAuthMode::StaticKey => "secret",
                TlsAuthMode::Crypt => "tls-crypt",
                TlsAuthMode::Auth => "tls-auth",
            };
            cfg.push_str(&file_data(name, &tls_auth.key));
            if let Some(direction) = &tls_auth.direction {
                if tls_auth.mode != TlsAuthMode::Crypt {
                    let _ = writeln!(cfg, "key-direction {}", direction);
                }
            }
        }

        if !self.pull {
            if let Some(address) = &self.ipv4_address {
                if let Some(mask) = address.netmask() {
                    let _ = writeln!(cfg, "ifconfig {} {}", address.address(), mask);
                }
            }
        }
        if self.pull && self.route_nopull {
            cfg.push_str("route-nopull\n");
        }

        self.push_routes(&mut cfg);

        if !self.dns.is_empty() || !self.pull {
            for server in &self.dns {
                let kind = if server.contains(':') { "DNS6" } else { "DNS" };
                let _ = writeln!(cfg, "dhcp-option {} {}", kind, server);
            }
            if let Some(domain) = &self.search_domain {
                let _ = writeln!(cfg, "dhcp-option DOMAIN {}", escape(domain));
            }
        }

        if self.mss_fix != 0 {
            if self.mss_fix == DEFAULT_MSSFIX {
                cfg.push_str("mssfix\n");
            } else {
                let _ = writeln!(cfg, "mssfix {}", self.mss_fix);
            }
        }
        if self.tun_mtu >= 48 && self.tun_mtu != DEFAULT_TUN_MTU {
            let _ = writeln!(cfg, "tun-mtu {}", self.tun_mtu);
        }
        if self.nobind {
            cfg.push_str("nobind\n");
        }

        if self.auth_kind != AuthKind::StaticKey {
            self.push_x509(&mut cfg);
            if self.expect_tls_cert {
                cfg.push_str("remote-cert-tls server\n");
            }
        }

        if let Some(cipher) = &self.cipher {
            let _ = writeln!(cfg, "cipher {}", cipher);
        }
        if let Some(digest) = &self.digest {
            let _ = writeln!(cfg, "auth {}", digest);
        }

        if self.random_hostname {
            cfg.push_str("remote-random-hostname\n");
        }
        if self.float {
            cfg.push_str("float\n");
        }
        if self.persist_tun {
            cfg.push_str("persist-tun\n");
            cfg.push_str("preresolve\n");
        }
        if self.push_peer_info {
            cfg.push_str("push-peer-info\n");
        }
        if options.query_proxy {
            cfg.push_str("management-query-proxy\n");
        }

        if !self.custom_options.is_empty() {
            cfg.push_str("# Custom configuration options\n");
            cfg.push_str(&self.custom_options);
            cfg.push('\n');
        }

        if !plain_remotes && self.connections.len() > 1 {
            for conn in self.enabled_connections() {
                cfg.push_str("<connection>\n");
                cfg.push_str(&conn.engine_block());
                cfg.push_str("</connection>\n");
            }
        }

        cfg
    }

    fn push_auth(&self, cfg: &mut String) {
        let certificates = |cfg: &mut String| {
            push_file(cfg, "ca", self.ca.as_ref());
            push_file(cfg, "key", self.key.as_ref());
            push_file(cfg, "cert", self.cert.as_ref());
        };
        let key_store = |cfg: &mut String| {
            push_file(cfg, "ca", self.ca.as_ref());
            push_file(cfg, "pkcs12", self.pkcs12.as_ref());
        };
        match self.auth_kind {
            AuthKind::Certificates => certificates(cfg),
            AuthKind::KeyStore => key_store(cfg),
            AuthKind::Combined => {
                cfg.push_str("auth-user-pass\n");
                if self.pkcs12.is_some() {
                    key_store(cfg);
                } else {
                    certificates(cfg);
                }
            }
            AuthKind::UserPass => {
                cfg.push_str("auth-user-pass\n");
                push_file(cfg, "ca", self.ca.as_ref());
            }
            AuthKind::StaticKey => {}
        }
    }

    fn push_routes(&self, cfg: &mut String) {
        if self.default_route {
            cfg.push_str("route 0.0.0.0 0.0.0.0 vpn_gateway\n");
        }
        for route in &self.routes_v4 {
            if self.default_route && route.included() {
                continue;
            }
            if let Some(mask) = route.netmask() {
                let gateway = if route.included() { "vpn_gateway" } else { "net_gateway" };
                let _ = writeln!(cfg, "route {} {} {}", route.network_address(), mask, gateway);
            }
        }

        if self.default_route_v6 {
            cfg.push_str("route-ipv6 ::/0\n");
        }
        for route in &self.routes_v6 {
            if self.default_route_v6 && route.included() {
                continue;
            }
            if route.included() {
                let _ = writeln!(cfg, "route-ipv6 {}", route);
            } else {
                let _ = writeln!(cfg, "route-ipv6 {} net_gateway", route);
            }
        }
    }

    fn push_x509(&self, cfg: &mut String) {
        let Some(x509) = &self.x509 else {
            return;
        };
        if x509.name.is_empty() {
            if let Some(server) = self.connections.first() {
                let _ = writeln!(cfg, "verify-x509-name {} name", escape(&server.server_name));
            }
        } else {
            let name = escape(&x509.name);
            match x509.kind {
                X509Verify::TlsRemoteCompatNoRemapping => {
                    cfg.push_str("compat-names no-remapping\n");
                    let _ = writeln!(cfg, "tls-remote {}", name);
                }
                X509Verify::TlsRemote => {
                    let _ = writeln!(cfg, "tls-remote {}", name);
                }
                X509Verify::Rdn => {
                    let _ = writeln!(cfg, "verify-x509-name {} name", name);
                }
                X509Verify::RdnPrefix => {
                    let _ = writeln!(cfg, "verify-x509-name {} name-prefix", name);
                }
                X509Verify::Dn => {
                    let _ = writeln!(cfg, "verify-x509-name {}", name);
                }
            }
        }
        if let Some(field) = &self.x509_username_field {
            let _ = writeln!(cfg, "x509-username-field {}", escape(field));
        }
    }
}
