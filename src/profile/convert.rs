//! Option table to profile conversion
//!
//! Every recognized option is removed from the table as it is consumed.
//! Whatever remains at the end is either on the ignore list, rejected as
//! unsupported, or kept verbatim as a custom passthrough block.

use super::connection::{Connection, is_udp_proto, parse_port};
use super::model::{AuthKind, AuthRetry, FileSource, Profile, TlsAuth, TlsAuthMode, X509Check, X509Verify};
use super::parser::{self, ParseError, RawLine, RawOptionTable};
use super::render::escape;
use crate::vpn::AddressRange;
use tracing::{debug, warn};

const UNSUPPORTED_OPTIONS: &[&str] = &["config", "tls-server"];

const IGNORED_OPTIONS: &[&str] = &[
    "tls-client",
    "askpass",
    "auth-nocache",
    "up",
    "down",
    "route-up",
    "ipchange",
    "route-pre-down",
    "auth-user-pass-verify",
    "block-outside-dns",
    "dhcp-release",
    "dhcp-renew",
    "dh",
    "group",
    "allow-recursive-routing",
    "ip-win32",
    "management-hold",
    "management",
    "management-client",
    "management-query-remote",
    "management-query-passwords",
    "management-query-proxy",
    "management-external-key",
    "management-forget-disconnect",
    "management-signal",
    "management-log-cache",
    "management-up-down",
    "management-client-user",
    "management-client-group",
    "pause-exit",
    "plugin",
    "machine-readable-output",
    "persist-key",
    "push",
    "register-dns",
    "route-delay",
    "route-gateway",
    "route-metric",
    "route-method",
    "status",
    "script-security",
    "show-net-up",
    "suppress-timestamps",
    "tmp-dir",
    "tun-ipv6",
    "topology",
    "user",
    "win-sys",
];

/// Dropped from the passthrough block when the line starts with these args
const IGNORED_WITH_ARGS: &[&[&str]] = &[
    &["setenv", "IV_GUI_VER"],
    &["setenv", "IV_OPENVPN_GUI_VERSION"],
    &["engine", "dynamic"],
    &["setenv", "CLIENT_CERT"],
];

const PASSTHROUGH_HEADER: &str = "# These options found in the config file do not map to config settings:\n";

const DEFAULT_MSSFIX: u32 = 1450;

/// Parse and convert configuration text in one step
pub fn from_text(text: &str) -> Result<Profile, ParseError> {
    convert(parser::parse(text)?)
}

/// Build a profile from a parsed option table
pub fn convert(mut table: RawOptionTable) -> Result<Profile, ParseError> {
    let mut profile = Profile::default();
    // Set once something other than the default decided the auth kind
    let mut auth_set = false;

    if table.contains("client") || table.contains("pull") {
        profile.pull = true;
        table.remove("client");
        table.remove("pull");
    }

    if let Some(secret) = table.take("secret", 1, 2)? {
        profile.auth_kind = AuthKind::StaticKey;
        auth_set = true;
        profile.tls_auth = Some(TlsAuth {
            key: FileSource::from_line(&secret.args[1], secret.inline),
            direction: secret.arg(2).map(str::to_string),
            mode: TlsAuthMode::StaticKey,
        });
    }

    if let Some(routes) = table.take_all("route", 1, 4)? {
        for route in &routes {
            let network = &route.args[1];
            let netmask = route.arg(2).unwrap_or("255.255.255.255");
            let gateway = route.arg(3).unwrap_or("vpn_gateway");
            match AddressRange::from_netmask(network, netmask, gateway != "net_gateway") {
                Ok(mut range) => {
                    range.normalize();
                    profile.routes_v4.push(range);
                }
                Err(e) => warn!("Skipping route {} {}: {}", network, netmask, e),
            }
        }
    }

    if let Some(routes) = table.take_all("route-ipv6", 1, 3)? {
        for route in &routes {
            let included = route.arg(2) != Some("net_gateway");
            match AddressRange::parse_cidr(&route.args[1], included) {
                Ok(mut range) if range.is_ipv6() => {
                    range.normalize();
                    profile.routes_v6.push(range);
                }
                Ok(_) => warn!("Skipping route-ipv6 {}: not an IPv6 network", route.args[1]),
                Err(e) => warn!("Skipping route-ipv6 {}: {}", route.args[1], e),
            }
        }
    }

    if table.take_flag("route-nopull", 0)? {
        profile.route_nopull = true;
    }

    if let Some(lines) = table.take_all("tls-auth", 1, 2)? {
        let mut key = None;
        let mut direction = None;
        for line in &lines {
            if let Some(d) = line.arg(2) {
                direction = Some(d.to_string());
            }
            // `tls-auth [inline] 1` names the direction, the key arrives as a <tls-auth> block
            if line.inline || line.args[1] != "[inline]" {
                key = Some(FileSource::from_line(&line.args[1], line.inline));
            }
        }
        if let Some(key) = key {
            profile.tls_auth = Some(TlsAuth {
                key,
                direction,
                mode: TlsAuthMode::Auth,
            });
        }
    }

    if let Some(direction) = table.take("key-direction", 1, 1)? {
        match profile.tls_auth.as_mut() {
            Some(tls_auth) => tls_auth.direction = Some(direction.args[1].clone()),
            None => debug!("key-direction {} has no tls-auth key to apply to", direction.args[1]),
        }
    }

    if let Some(crypt) = table.take("tls-crypt", 1, 1)? {
        profile.tls_auth = Some(TlsAuth {
            key: FileSource::from_line(&crypt.args[1], crypt.inline),
            direction: None,
            mode: TlsAuthMode::Crypt,
        });
    }

    if let Some(redirects) = table.take_all("redirect-gateway", 0, 7)? {
        let mut no_ipv4 = false;
        for redirect in &redirects {
            for flag in &redirect.args[1..] {
                match flag.as_str() {
                    "block-local" => profile.allow_local_lan = false,
                    "unblock-local" => profile.allow_local_lan = true,
                    "!ipv4" => no_ipv4 = true,
                    "ipv6" => profile.default_route_v6 = true,
                    _ => {}
                }
            }
        }
        if !no_ipv4 {
            profile.default_route = true;
        }
    }
    // Accepted, the private ranges are pushed as routes by the server
    table.take_all("redirect-private", 0, 5)?;

    let dev = table.take("dev", 1, 1)?;
    let dev_type = table.take("dev-type", 1, 1)?;
    let tun_ok = match (&dev_type, &dev) {
        (Some(t), _) => t.args[1] == "tun",
        (None, Some(d)) => d.args[1].starts_with("tun"),
        (None, None) => true,
    };
    if !tun_ok {
        return Err(ParseError::OnlyTunSupported);
    }

    if let Some(mssfix) = table.take("mssfix", 0, 1)? {
        profile.mss_fix = match mssfix.arg(1) {
            Some(value) => parse_number("mssfix", value)?,
            None => DEFAULT_MSSFIX,
        };
    }

    for name in ["tun-mtu", "mtu"] {
        if let Some(mtu) = table.take(name, 1, 1)? {
            profile.tun_mtu = parse_number(name, &mtu.args[1])?;
        }
    }

    if let Some(mode) = table.take("mode", 1, 1)? {
        if mode.args[1] != "p2p" {
            return Err(ParseError::InvalidMode(mode.args[1].clone()));
        }
    }

    if let Some(options) = table.take_all("dhcp-option", 2, 2)? {
        for option in &options {
            let value = &option.args[2];
            match option.args[1].as_str() {
                "DOMAIN" => profile.search_domain = Some(value.clone()),
                "DNS" | "DNS6" => profile.dns.push(value.clone()),
                other => debug!("Ignoring dhcp-option {}", other),
            }
        }
    }

    if let Some(ifconfig) = table.take("ifconfig", 2, 2)? {
        profile.ipv4_address = Some(parse_ifconfig(&ifconfig.args[1], &ifconfig.args[2])?);
    }

    profile.random_hostname = table.take_flag("remote-random-hostname", 0)?;
    profile.float = table.take_flag("float", 0)?;
    profile.lzo = table.take_flag("comp-lzo", 1)?;

    if let Some(cipher) = table.take("cipher", 1, 1)? {
        profile.cipher = Some(cipher.args[1].clone());
    }
    if let Some(auth) = table.take("auth", 1, 1)? {
        profile.digest = Some(auth.args[1].clone());
    }

    profile.ca = take_file(&mut table, "ca")?;
    if let Some(cert) = take_file(&mut table, "cert")? {
        profile.cert = Some(cert);
        profile.auth_kind = AuthKind::Certificates;
        auth_set = true;
    }
    profile.key = take_file(&mut table, "key")?;
    if let Some(pkcs12) = take_file(&mut table, "pkcs12")? {
        profile.pkcs12 = Some(pkcs12);
        profile.auth_kind = AuthKind::KeyStore;
        auth_set = true;
    }
    if table.contains("cryptoapicert") {
        return Err(ParseError::UnsupportedOption("cryptoapicert".to_string()));
    }

    let compat_names = table.take("compat-names", 0, 1)?;
    let no_name_remapping = table.take_flag("no-name-remapping", 1)?;
    if let Some(tls_remote) = table.take("tls-remote", 1, 1)? {
        let no_remapping = no_name_remapping
            || compat_names
                .as_ref()
                .is_some_and(|c| c.arg(1) == Some("no-remapping"));
        profile.x509 = Some(X509Check {
            name: tls_remote.args[1].clone(),
            kind: if no_remapping {
                X509Verify::TlsRemoteCompatNoRemapping
            } else {
                X509Verify::TlsRemote
            },
        });
    }

    if let Some(verify) = table.take("verify-x509-name", 1, 2)? {
        let kind = match verify.arg(2) {
            None | Some("subject") => X509Verify::Dn,
            Some("name") => X509Verify::Rdn,
            Some("name-prefix") => X509Verify::RdnPrefix,
            Some(other) => {
                return Err(ParseError::InvalidValue {
                    option: "verify-x509-name".to_string(),
                    value: other.to_string(),
                });
            }
        };
        profile.x509 = Some(X509Check {
            name: verify.args[1].clone(),
            kind,
        });
    }

    if let Some(field) = table.take("x509-username-field", 1, 1)? {
        profile.x509_username_field = Some(field.args[1].clone());
    }

    if let Some(verb) = table.take("verb", 1, 1)? {
        profile.verb = Some(verb.args[1].clone());
    }

    profile.nobind = table.take_flag("nobind", 0)?;
    profile.persist_tun = table.take_flag("persist-tun", 0)?;
    profile.push_peer_info = table.take_flag("push-peer-info", 0)?;

    if let Some(retry) = table.take("connect-retry", 1, 2)? {
        profile.connect_retry = Some(retry.args[1].clone());
        profile.connect_retry_max_time = retry.arg(2).map(str::to_string);
    }
    if let Some(retry_max) = table.take("connect-retry-max", 1, 1)? {
        profile.connect_retry_max = Some(retry_max.args[1].clone());
    }

    if let Some(lines) = table.take_all("remote-cert-tls", 1, 1)? {
        if lines[0].args[1] == "server" {
            profile.expect_tls_cert = true;
        } else {
            for line in lines {
                table.insert(line);
            }
        }
    }

    if let Some(auth_user) = table.take("auth-user-pass", 0, 1)? {
        if !auth_set {
            profile.auth_kind = AuthKind::UserPass;
        } else if matches!(profile.auth_kind, AuthKind::Certificates | AuthKind::KeyStore) {
            profile.auth_kind = AuthKind::Combined;
        }
        if let Some(value) = auth_user.arg(1) {
            profile.username = None;
            if auth_user.inline {
                let mut parts = value.lines();
                if let (Some(user), Some(pass)) = (parts.next(), parts.next()) {
                    profile.username = Some(user.to_string());
                    profile.password = Some(pass.to_string());
                }
            } else {
                profile.auth_user_pass_file = Some(value.to_string());
            }
        }
    }

    if let Some(retry) = table.take("auth-retry", 1, 1)? {
        profile.auth_retry = match retry.args[1].as_str() {
            "none" => AuthRetry::NoneForget,
            "nointeract" => AuthRetry::NoInteract,
            "interact" => AuthRetry::Interact,
            other => {
                return Err(ParseError::InvalidValue {
                    option: "auth-retry".to_string(),
                    value: other.to_string(),
                });
            }
        };
    }

    if let Some(crl) = table.take("crl-verify", 1, 2)? {
        if crl.arg(2) == Some("dir") {
            profile.custom_options.push_str(&option_line(&crl));
        } else {
            profile.crl = Some(FileSource::from_line(&crl.args[1], crl.inline));
        }
    }

    let (template, remotes) = parse_connection_options(&mut table, None)?;
    let blocks = table.take_all("connection", 1, 1)?;
    match blocks {
        Some(_) if !remotes.is_empty() => return Err(ParseError::RemoteAndConnectionBlock),
        Some(blocks) => {
            profile.connections = blocks
                .iter()
                .map(|block| parse_connection_block(&block.args[1], &template))
                .collect::<Result<_, _>>()?;
        }
        None if !remotes.is_empty() => profile.connections = remotes,
        None => {}
    }

    profile.remote_random = table.take_flag("remote-random", 0)?;

    if let Some(force) = table.take("proto-force", 1, 1)? {
        let disable_udp = match force.args[1].as_str() {
            "udp" => true,
            "tcp" => false,
            other => {
                return Err(ParseError::InvalidValue {
                    option: "proto-force".to_string(),
                    value: other.to_string(),
                });
            }
        };
        for conn in &mut profile.connections {
            if conn.use_udp == disable_udp {
                conn.enabled = false;
            }
        }
    }

    if let Some(name) = table.meta("FRIENDLY_NAME") {
        profile.name = name.to_string();
    }
    if let Some(user) = table.meta("USERNAME") {
        profile.username = Some(user.to_string());
    }

    check_unsupported_and_passthrough(&mut table, &mut profile)?;
    fixup(&mut profile);
    Ok(profile)
}

/// Read the per-connection options. With a template the connection starts
/// as a copy of it and every option left in `table` becomes a custom
/// directive of the connection.
pub fn parse_connection_options(
    table: &mut RawOptionTable,
    template: Option<&Connection>,
) -> Result<(Connection, Vec<Connection>), ParseError> {
    let mut conn = template.cloned().unwrap_or_default();

    if let Some(port) = table.take("port", 1, 1)? {
        conn.server_port = parse_port("port", &port.args[1])?;
    }
    if let Some(rport) = table.take("rport", 1, 1)? {
        conn.server_port = parse_port("rport", &rport.args[1])?;
    }
    if let Some(proto) = table.take("proto", 1, 1)? {
        conn.use_udp = is_udp_proto(&proto.args[1])?;
    }
    for name in ["timeout-connect", "connect-timeout"] {
        if let Some(timeout) = table.take(name, 1, 1)? {
            conn.connect_timeout = parse_number(name, &timeout.args[1])?;
        }
    }

    let remotes = table.take_all("remote", 1, 3)?.unwrap_or_default();

    if template.is_some() {
        for (_, lines) in table.drain() {
            for line in &lines {
                if !is_ignored_line(line) {
                    conn.custom_directives.push(option_line(line).trim_end().to_string());
                }
            }
        }
    }

    let mut connections = Vec::with_capacity(remotes.len());
    for remote in &remotes {
        let mut entry = conn.clone();
        entry.server_name = remote.args[1].clone();
        if let Some(port) = remote.arg(2) {
            entry.server_port = parse_port("remote", port)?;
        }
        if let Some(proto) = remote.arg(3) {
            entry.use_udp = is_udp_proto(proto)?;
        }
        connections.push(entry);
    }

    Ok((conn, connections))
}

fn parse_connection_block(body: &str, template: &Connection) -> Result<Connection, ParseError> {
    let mut table = parser::parse(body)?;
    let (_, mut remotes) = parse_connection_options(&mut table, Some(template))?;
    if remotes.len() != 1 {
        return Err(ParseError::ConnectionBlockRemotes(remotes.len()));
    }
    Ok(remotes.remove(0))
}

fn take_file(table: &mut RawOptionTable, name: &str) -> Result<Option<FileSource>, ParseError> {
    Ok(table
        .take(name, 1, 1)?
        .map(|line| FileSource::from_line(&line.args[1], line.inline)))
}

fn parse_number(option: &str, value: &str) -> Result<u32, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidNumber {
        option: option.to_string(),
        value: value.to_string(),
    })
}

/// `ifconfig <local> <netmask>` in subnet mode, `ifconfig <local> <remote>`
/// in point-to-point mode. The latter yields a host address.
fn parse_ifconfig(local: &str, second: &str) -> Result<AddressRange, ParseError> {
    let invalid = || ParseError::InvalidAddress {
        option: "ifconfig".to_string(),
        value: format!("{} {}", local, second),
    };
    match AddressRange::from_netmask(local, second, true) {
        Ok(range) => Ok(range),
        Err(_) => AddressRange::parse_cidr(local, true)
            .ok()
            .filter(|r| !r.is_ipv6())
            .ok_or_else(invalid),
    }
}

fn is_ignored_line(line: &RawLine) -> bool {
    IGNORED_WITH_ARGS.iter().any(|ignore| {
        line.args.len() >= ignore.len() && ignore.iter().zip(&line.args).all(|(a, b)| *a == b.as_str())
    })
}

/// Render one raw option back to engine syntax, inline blocks kept inline
fn option_line(line: &RawLine) -> String {
    if line.inline {
        let name = &line.args[0];
        return format!("<{}>\n{}\n</{}>\n", name, line.args[1], name);
    }
    let mut out = line
        .args
        .iter()
        .map(|arg| escape(arg))
        .collect::<Vec<_>>()
        .join(" ");
    out.push('\n');
    out
}

fn check_unsupported_and_passthrough(
    table: &mut RawOptionTable,
    profile: &mut Profile,
) -> Result<(), ParseError> {
    for option in UNSUPPORTED_OPTIONS {
        if table.contains(option) {
            return Err(ParseError::UnsupportedOption(option.to_string()));
        }
    }
    for option in IGNORED_OPTIONS {
        table.remove(option);
    }

    let mut custom = std::mem::take(&mut profile.custom_options);
    for (name, lines) in table.drain() {
        debug!("Keeping unmapped option {} as custom configuration", name);
        for line in lines.iter().filter(|l| !is_ignored_line(l)) {
            custom.push_str(&option_line(line));
        }
    }
    if !custom.is_empty() {
        profile.custom_options = format!("{}{}", PASSTHROUGH_HEADER, custom);
    }
    Ok(())
}

fn fixup(profile: &mut Profile) {
    let server = profile.connections.first().map(|c| c.server_name.clone());
    if let (Some(x509), Some(server)) = (profile.x509.as_mut(), server) {
        if x509.name == server {
            x509.name.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert_text(text: &str) -> Profile {
        from_text(text).unwrap()
    }

    #[test]
    fn test_basic_client_profile() {
        let profile = convert_text(
            "client\ndev tun\nproto tcp\nremote vpn.example.com 443\nremote backup.example.com 1194 udp\n\
             cipher AES-256-GCM\nauth SHA256\nverb 3\nnobind\npersist-tun\n",
        );
        assert!(profile.pull);
        assert_eq!(profile.connections.len(), 2);
        assert_eq!(profile.connections[0].server_name, "vpn.example.com");
        assert_eq!(profile.connections[0].server_port, 443);
        assert!(!profile.connections[0].use_udp);
        assert!(profile.connections[1].use_udp);
        assert_eq!(profile.cipher.as_deref(), Some("AES-256-GCM"));
        assert_eq!(profile.digest.as_deref(), Some("SHA256"));
        assert_eq!(profile.verb.as_deref(), Some("3"));
        assert!(profile.nobind);
        assert!(profile.persist_tun);
        assert!(profile.custom_options.is_empty());
    }

    #[test]
    fn test_remote_and_connection_block_rejected() {
        let err = from_text(
            "remote a.example.com\n<connection>\nremote b.example.com 1194\n</connection>\n",
        )
        .unwrap_err();
        assert_eq!(err, ParseError::RemoteAndConnectionBlock);
        assert_eq!(
            err.to_string(),
            "Using a <connection> block and --remote is not allowed."
        );
    }

    #[test]
    fn test_connection_blocks_use_template() {
        let profile = convert_text(
            "proto tcp\nport 443\n<connection>\nremote a.example.com\nhttp-proxy proxy.local 3128\n</connection>\n\
             <connection>\nremote b.example.com 1195 udp\nconnect-timeout 10\n</connection>\n",
        );
        assert_eq!(profile.connections.len(), 2);
        let a = &profile.connections[0];
        assert_eq!(a.server_name, "a.example.com");
        assert_eq!(a.server_port, 443);
        assert!(!a.use_udp);
        assert_eq!(a.custom_directives, vec!["http-proxy proxy.local 3128"]);
        let b = &profile.connections[1];
        assert_eq!(b.server_port, 1195);
        assert!(b.use_udp);
        assert_eq!(b.connect_timeout, 10);
        assert!(b.custom_directives.is_empty());
    }

    #[test]
    fn test_connection_block_needs_one_remote() {
        let err = from_text("<connection>\nproto udp\n</connection>\n").unwrap_err();
        assert_eq!(err, ParseError::ConnectionBlockRemotes(0));
    }

    #[test]
    fn test_routes_and_net_gateway() {
        let profile = convert_text(
            "route 10.0.0.0 255.0.0.0\nroute 10.1.0.0 255.255.0.0 net_gateway\nroute 192.0.2.7\n\
             route 172.16.0.0 255.0.255.0\nroute-ipv6 2001:db8::/32\n",
        );
        let routes: Vec<_> = profile
            .routes_v4
            .iter()
            .map(|r| (r.to_string(), r.included()))
            .collect();
        assert_eq!(
            routes,
            vec![
                ("10.0.0.0/8".to_string(), true),
                ("10.1.0.0/16".to_string(), false),
                ("192.0.2.7/32".to_string(), true),
            ]
        );
        assert_eq!(profile.routes_v6.len(), 1);
        assert_eq!(profile.routes_v6[0].to_string(), "2001:db8::/32");
    }

    #[test]
    fn test_auth_kind_precedence() {
        assert_eq!(convert_text("auth-user-pass\n").auth_kind, AuthKind::UserPass);
        assert_eq!(
            convert_text("cert client.crt\nkey client.key\nauth-user-pass\n").auth_kind,
            AuthKind::Combined
        );
        assert_eq!(
            convert_text("pkcs12 bundle.p12\nauth-user-pass\n").auth_kind,
            AuthKind::Combined
        );
        assert_eq!(convert_text("pkcs12 bundle.p12\n").auth_kind, AuthKind::KeyStore);
        assert_eq!(convert_text("secret static.key 1\n").auth_kind, AuthKind::StaticKey);
    }

    #[test]
    fn test_inline_credentials_and_meta() {
        let profile = convert_text(
            "# OVPN_ACCESS_SERVER_FRIENDLY_NAME=Office\n<auth-user-pass>\nalice\ns3cret\n</auth-user-pass>\n",
        );
        assert_eq!(profile.name, "Office");
        assert_eq!(profile.username.as_deref(), Some("alice"));
        assert_eq!(profile.password.as_deref(), Some("s3cret"));
        assert!(profile.is_user_pass_auth());
    }

    #[test]
    fn test_auth_user_pass_file() {
        let profile = convert_text("auth-user-pass creds.txt\n");
        assert_eq!(profile.auth_user_pass_file.as_deref(), Some("creds.txt"));
        assert!(profile.username.is_none());
    }

    #[test]
    fn test_tls_auth_inline_and_direction() {
        let profile = convert_text(
            "tls-auth [inline] 1\n<tls-auth>\n-----BEGIN OpenVPN Static key V1-----\n</tls-auth>\n",
        );
        let tls = profile.tls_auth.unwrap();
        assert_eq!(tls.mode, TlsAuthMode::Auth);
        assert!(tls.key.is_inline());
        assert_eq!(tls.direction.as_deref(), Some("1"));

        let profile = convert_text("tls-auth ta.key\nkey-direction 0\n");
        let tls = profile.tls_auth.unwrap();
        assert_eq!(tls.key, FileSource::Path("ta.key".to_string()));
        assert_eq!(tls.direction.as_deref(), Some("0"));

        let profile = convert_text("tls-crypt tc.key\n");
        assert_eq!(profile.tls_auth.unwrap().mode, TlsAuthMode::Crypt);
    }

    #[test]
    fn test_numeric_errors_name_option() {
        let err = from_text("mssfix big\n").unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidNumber {
                option: "mssfix".to_string(),
                value: "big".to_string()
            }
        );
        assert!(from_text("tun-mtu x\n").unwrap_err().to_string().contains("tun-mtu"));
        assert!(from_text("connect-timeout soon\n").unwrap_err().to_string().contains("connect-timeout"));
        assert_eq!(convert_text("mssfix\n").mss_fix, 1450);
        assert_eq!(convert_text("mtu 1400\n").tun_mtu, 1400);
    }

    #[test]
    fn test_tap_and_mode_rejected() {
        assert_eq!(from_text("dev tap0\n").unwrap_err(), ParseError::OnlyTunSupported);
        assert_eq!(from_text("dev-type tap\ndev mytun\n").unwrap_err(), ParseError::OnlyTunSupported);
        assert!(from_text("dev tun0\n").is_ok());
        assert_eq!(
            from_text("mode server\n").unwrap_err(),
            ParseError::InvalidMode("server".to_string())
        );
    }

    #[test]
    fn test_unsupported_option() {
        assert_eq!(
            from_text("config other.conf\n").unwrap_err(),
            ParseError::UnsupportedOption("config".to_string())
        );
        assert_eq!(
            from_text("cryptoapicert \"SUBJ:me\"\n").unwrap_err(),
            ParseError::UnsupportedOption("cryptoapicert".to_string())
        );
    }

    #[test]
    fn test_passthrough_and_ignore() {
        let profile = convert_text(
            "persist-key\nsetenv IV_GUI_VER foo\nsetenv FORWARD_COMPATIBLE 1\nsndbuf 0\n\
             <extra-certs>\nCERTDATA\n</extra-certs>\nremote-cert-tls client\n",
        );
        let expected = format!(
            "{}setenv FORWARD_COMPATIBLE 1\nsndbuf 0\n<extra-certs>\nCERTDATA\n</extra-certs>\nremote-cert-tls client\n",
            PASSTHROUGH_HEADER
        );
        assert_eq!(profile.custom_options, expected);
        assert!(!profile.expect_tls_cert);
    }

    #[test]
    fn test_crl_dir_goes_to_custom_options() {
        let profile = convert_text("crl-verify /etc/crl dir\n");
        assert!(profile.crl.is_none());
        assert_eq!(
            profile.custom_options,
            format!("{}crl-verify /etc/crl dir\n", PASSTHROUGH_HEADER)
        );

        let profile = convert_text("crl-verify /etc/crl dir\nsndbuf 0\n");
        assert_eq!(
            profile.custom_options,
            format!("{}crl-verify /etc/crl dir\nsndbuf 0\n", PASSTHROUGH_HEADER)
        );

        let profile = convert_text("crl-verify crl.pem\n");
        assert_eq!(profile.crl, Some(FileSource::Path("crl.pem".to_string())));
    }

    #[test]
    fn test_redirect_gateway_flags() {
        let profile = convert_text("redirect-gateway def1 ipv6 unblock-local\n");
        assert!(profile.default_route);
        assert!(profile.default_route_v6);
        assert!(profile.allow_local_lan);

        let profile = convert_text("redirect-gateway !ipv4 ipv6\n");
        assert!(!profile.default_route);
        assert!(profile.default_route_v6);
    }

    #[test]
    fn test_x509_checks() {
        let profile = convert_text("verify-x509-name server.example.com name\n");
        let x509 = profile.x509.unwrap();
        assert_eq!(x509.kind, X509Verify::Rdn);
        assert_eq!(x509.name, "server.example.com");

        let profile = convert_text("tls-remote srv\ncompat-names no-remapping\n");
        assert_eq!(profile.x509.unwrap().kind, X509Verify::TlsRemoteCompatNoRemapping);

        let err = from_text("verify-x509-name srv bogus\n").unwrap_err();
        assert!(matches!(err, ParseError::InvalidValue { .. }));
    }

    #[test]
    fn test_remote_cn_equal_to_server_is_cleared() {
        let profile = convert_text("remote vpn.example.com\nverify-x509-name vpn.example.com name\n");
        assert_eq!(profile.x509.unwrap().name, "");
    }

    #[test]
    fn test_auth_retry() {
        assert_eq!(convert_text("auth-retry interact\n").auth_retry, AuthRetry::Interact);
        assert_eq!(convert_text("auth-retry none\n").auth_retry, AuthRetry::NoneForget);
        assert!(from_text("auth-retry sometimes\n").is_err());
    }

    #[test]
    fn test_proto_force_disables_transport() {
        let profile = convert_text("remote a 1194 udp\nremote b 443 tcp\nproto-force udp\n");
        assert!(!profile.connections[0].enabled);
        assert!(profile.connections[1].enabled);
        assert_eq!(profile.primary_server(), Some("b"));
    }

    #[test]
    fn test_dhcp_options_and_ifconfig() {
        let profile = convert_text(
            "dhcp-option DNS 10.0.0.53\ndhcp-option DNS 2001:db8::53\ndhcp-option DOMAIN corp.example\n\
             ifconfig 10.8.0.2 255.255.255.0\n",
        );
        assert_eq!(profile.dns, vec!["10.0.0.53", "2001:db8::53"]);
        assert_eq!(profile.search_domain.as_deref(), Some("corp.example"));
        assert_eq!(profile.ipv4_address.unwrap().to_string(), "10.8.0.2/24");

        let profile = convert_text("ifconfig 10.8.0.2 10.8.0.1\n");
        assert_eq!(profile.ipv4_address.unwrap().to_string(), "10.8.0.2/32");
    }

    #[test]
    fn test_argument_count_checked() {
        let err = from_text("remote a 1 udp extra\n").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Option remote has 4 parameters, expected between 1 and 3"
        );
    }
}
