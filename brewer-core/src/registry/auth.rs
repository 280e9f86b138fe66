//! Registry authentication: docker config credentials, bearer-token
//! challenges, and the per-registry host list (including the read-only
//! Docker Hub proxy).

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use once_cell::sync::OnceCell;
use serde::Deserialize;
use tracing::{debug, warn};

/// What a registry host entry may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub pull: bool,
    pub resolve: bool,
    pub push: bool,
}

impl Capabilities {
    pub const ALL: Capabilities = Capabilities {
        pull: true,
        resolve: true,
        push: true,
    };
    pub const READ_ONLY: Capabilities = Capabilities {
        pull: true,
        resolve: true,
        push: false,
    };
}

/// One HTTP endpoint serving a registry namespace.
#[derive(Debug, Clone)]
pub struct RegistryHost {
    pub host: String,
    pub scheme: String,
    /// Path prefix up to and including `/v2`.
    pub path: String,
    pub capabilities: Capabilities,
    /// The credential lookup key (the logical registry, not the endpoint).
    pub auth_host: String,
}

impl RegistryHost {
    pub fn base_url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.path)
    }
}

/// The host list for a reference domain, most-preferred first.
///
/// `docker.io` resolves to `registry-1.docker.io`; when
/// `DOCKERHUB_PUBLIC_PROXY` is configured a read-only entry for it is
/// prepended (pull+resolve), keeping the real registry as push fallback.
pub fn registry_hosts(domain: &str) -> Vec<RegistryHost> {
    let mut config = RegistryHost {
        host: domain.to_string(),
        scheme: "https".to_string(),
        path: "/v2".to_string(),
        capabilities: Capabilities::ALL,
        auth_host: domain.to_string(),
    };

    if domain == "docker.io" {
        config.host = "registry-1.docker.io".to_string();

        if let Ok(proxy) = std::env::var("DOCKERHUB_PUBLIC_PROXY") {
            if !proxy.is_empty() {
                match parse_proxy_url(&proxy) {
                    Some((scheme, host, path)) => {
                        let proxy_config = RegistryHost {
                            host,
                            scheme,
                            path: format!("{}/v2", path.trim_end_matches('/')),
                            capabilities: Capabilities::READ_ONLY,
                            auth_host: domain.to_string(),
                        };
                        return vec![proxy_config, config];
                    }
                    None => warn!("ignoring unparseable DOCKERHUB_PUBLIC_PROXY: {proxy}"),
                }
            }
        }
    } else if domain.contains("localhost") {
        config.scheme = "http".to_string();
    }

    vec![config]
}

fn parse_proxy_url(proxy: &str) -> Option<(String, String, String)> {
    let (scheme, rest) = proxy.split_once("://")?;
    let (host, path) = match rest.split_once('/') {
        Some((host, path)) => (host, format!("/{}", path)),
        None => (rest, String::new()),
    };
    if host.is_empty() {
        return None;
    }
    Some((scheme.to_string(), host.to_string(), path))
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: std::collections::HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: String,
}

fn docker_config_path() -> PathBuf {
    match std::env::var_os("DOCKER_CONFIG") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("config.json"),
        _ => {
            let home = std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            home.join(".docker").join("config.json")
        }
    }
}

fn load_docker_config() -> DockerConfig {
    let path = docker_config_path();
    match std::fs::read(&path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(config) => config,
            Err(e) => {
                warn!("ignoring unparseable {}: {}", path.display(), e);
                DockerConfig::default()
            }
        },
        Err(_) => DockerConfig::default(),
    }
}

static DOCKER_CONFIG: OnceCell<DockerConfig> = OnceCell::new();

/// The `user:pass` pair for `registry` from the (lazily read, shared)
/// docker config. `docker.io` and `index.docker.io` are one logical host.
pub fn credentials_for(registry: &str) -> Option<(String, String)> {
    let config = DOCKER_CONFIG.get_or_init(load_docker_config);

    let hosts: &[&str] = match registry {
        "docker.io" | "index.docker.io" | "" => &["docker.io", "index.docker.io"],
        other => return credentials_for_host(config, other),
    };
    for host in hosts {
        if let Some(creds) = credentials_for_host(config, host) {
            return Some(creds);
        }
    }
    None
}

fn credentials_for_host(config: &DockerConfig, host: &str) -> Option<(String, String)> {
    for key in [host.to_string(), format!("https://{}/v1/", host)] {
        if let Some(entry) = config.auths.get(&key) {
            if entry.auth.is_empty() {
                continue;
            }
            match BASE64.decode(&entry.auth) {
                Ok(decoded) => {
                    let decoded = String::from_utf8_lossy(&decoded).into_owned();
                    if let Some((user, pass)) = decoded.split_once(':') {
                        return Some((user.to_string(), pass.to_string()));
                    }
                }
                Err(e) => debug!("undecodable auth entry for {:?}: {}", key, e),
            }
        }
    }
    None
}

/// A parsed `WWW-Authenticate: Bearer` challenge.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

/// Parse a bearer challenge header; None for Basic (or unparseable)
/// challenges.
pub fn parse_bearer_challenge(www_authenticate: &str) -> Option<BearerChallenge> {
    let rest = www_authenticate.strip_prefix("Bearer ")?;
    let mut challenge = BearerChallenge::default();
    for part in rest.split(',') {
        let part = part.trim();
        let (key, value) = match part.split_once('=') {
            Some(pair) => pair,
            None => continue,
        };
        let value = value.trim_matches('"').to_string();
        match key {
            "realm" => challenge.realm = value,
            "service" => challenge.service = Some(value),
            "scope" => challenge.scope = Some(value),
            _ => {}
        }
    }
    if challenge.realm.is_empty() {
        None
    } else {
        Some(challenge)
    }
}

impl BearerChallenge {
    /// The token endpoint URL, with `scope` defaulted from the repository
    /// when the challenge did not carry one.
    pub fn token_url(&self, fallback_scope: &str) -> String {
        let mut url = format!("{}?", self.realm);
        if let Some(service) = &self.service {
            url.push_str(&format!("service={}&", urlencode(service)));
        }
        let scope = self.scope.as_deref().unwrap_or(fallback_scope);
        url.push_str(&format!("scope={}", urlencode(scope)));
        url
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b':' | b'/' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}
