//! HTTP proxy lookup for the engine's `PROXY` query

use tracing::debug;

pub trait ProxyResolver: Send + Sync {
    /// Proxy `(host, port)` to reach `server`, or `None` for a direct connection
    fn resolve(&self, server: &str) -> Option<(String, u16)>;
}

/// Never uses a proxy
pub struct NoProxy;

impl ProxyResolver for NoProxy {
    fn resolve(&self, _server: &str) -> Option<(String, u16)> {
        None
    }
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Proxy from `https_proxy`/`http_proxy`, honoring `no_proxy`
pub struct EnvProxy {
    lookup: Lookup,
}

impl EnvProxy {
    pub fn new() -> Self {
        Self::with_lookup(|name| std::env::var(name).ok())
    }

    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }

    fn var(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .or_else(|| (self.lookup)(&name.to_uppercase()))
            .filter(|v| !v.trim().is_empty())
    }

    fn bypassed(&self, server: &str) -> bool {
        let Some(no_proxy) = self.var("no_proxy") else {
            return false;
        };
        let server = server.to_ascii_lowercase();
        no_proxy.split(',').map(str::trim).any(|entry| {
            let entry = entry.to_ascii_lowercase();
            let suffix = entry.trim_start_matches('*').trim_start_matches('.');
            entry == "*"
                || (!suffix.is_empty()
                    && (server == suffix || server.ends_with(&format!(".{}", suffix))))
        })
    }
}

impl Default for EnvProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyResolver for EnvProxy {
    fn resolve(&self, server: &str) -> Option<(String, u16)> {
        if self.bypassed(server) {
            debug!("{} is listed in no_proxy", server);
            return None;
        }
        let value = self.var("https_proxy").or_else(|| self.var("http_proxy"))?;
        let parsed = parse_proxy_url(&value);
        if parsed.is_none() {
            debug!("Ignoring unparsable proxy setting {}", value);
        }
        parsed
    }
}

/// `http://user@host:port/` → `(host, port)`; port defaults to 8080
fn parse_proxy_url(value: &str) -> Option<(String, u16)> {
    let rest = value.split_once("://").map(|(_, r)| r).unwrap_or(value);
    let authority = rest.split('/').next()?;
    let host_port = authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority);

    let (host, port) = if let Some(bracketed) = host_port.strip_prefix('[') {
        let (host, after) = bracketed.split_once(']')?;
        (host, after.strip_prefix(':'))
    } else {
        match host_port.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (host_port, None),
        }
    };
    if host.is_empty() {
        return None;
    }
    let port = match port {
        Some(p) => p.parse().ok()?,
        None => 8080,
    };
    Some((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> EnvProxy {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvProxy::with_lookup(move |name| map.get(name).cloned())
    }

    #[test]
    fn test_parse_proxy_url() {
        assert_eq!(
            parse_proxy_url("http://proxy.corp:3128/"),
            Some(("proxy.corp".to_string(), 3128))
        );
        assert_eq!(
            parse_proxy_url("http://user:pw@proxy.corp:3128"),
            Some(("proxy.corp".to_string(), 3128))
        );
        assert_eq!(parse_proxy_url("proxy.corp"), Some(("proxy.corp".to_string(), 8080)));
        assert_eq!(parse_proxy_url("http://[::1]:3128"), Some(("::1".to_string(), 3128)));
        assert_eq!(parse_proxy_url("http://proxy:notaport"), None);
    }

    #[test]
    fn test_env_proxy() {
        let proxy = env(&[("HTTPS_PROXY", "http://proxy.corp:3128")]);
        assert_eq!(
            proxy.resolve("vpn.example.com"),
            Some(("proxy.corp".to_string(), 3128))
        );
        assert_eq!(env(&[]).resolve("vpn.example.com"), None);
    }

    #[test]
    fn test_no_proxy() {
        let proxy = env(&[
            ("http_proxy", "http://proxy.corp:3128"),
            ("no_proxy", "localhost, .example.com"),
        ]);
        assert_eq!(proxy.resolve("vpn.example.com"), None);
        assert_eq!(proxy.resolve("example.com"), None);
        assert!(proxy.resolve("vpn.example.org").is_some());
        assert_eq!(NoProxy.resolve("vpn.example.org"), None);
    }
}
