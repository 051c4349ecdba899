//! Ingress configuration parsing and validation
//!
//! Only the shape of the rules is checked here. Matching requests against
//! rules belongs to the proxy layer.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use url::Url;

/// Hostname of the rule that serves the connector's own management endpoints
pub const MANAGEMENT_HOSTNAME: &str = "management.edgetunnel.net";

const MANAGEMENT_PATH: &str = "^/(ping|logs|metrics|host_details|debug/.*)$";

const DEFAULT_SERVICE: &str = "http_status:503";

/// Ingress errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IngressError {
    #[error("Invalid configuration JSON: {0}")]
    Json(String),

    #[error("Invalid configuration YAML: {0}")]
    Yaml(String),

    #[error("Hostname {0:?} contains a port; ingress rules match on hostname only")]
    HostnameContainsPort(String),

    #[error("Hostname {0:?} is not allowed: wildcards are only supported as a leading \"*.\"")]
    BadWildcard(String),

    #[error("Rule #{index} ({hostname:?}) matches all requests, so every rule after it is unreachable; move it to the end")]
    CatchAllNotLast { index: usize, hostname: String },

    #[error("The last ingress rule must match all URLs (no hostname or \"*\", no path)")]
    LastRuleNotCatchAll,

    #[error("Rule #{index} has an invalid path regex {path:?}: {reason}")]
    InvalidPath {
        index: usize,
        path: String,
        reason: String,
    },

    #[error("Rule #{index} has an invalid service {service:?}: {reason}")]
    InvalidService {
        index: usize,
        service: String,
        reason: String,
    },
}

/// Per-origin connection settings; unset fields inherit from the top level
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OriginRequestConfig {
    /// Seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,
    /// Seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_timeout: Option<u64>,
    /// Seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_keep_alive: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_happy_eyeballs: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive_connections: Option<u32>,
    /// Seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_host_header: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_server_name: Option<String>,
    #[serde(rename = "matchSNItoHost", skip_serializing_if = "Option::is_none")]
    pub match_sni_to_host: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_pool: Option<String>,
    #[serde(rename = "noTLSVerify", skip_serializing_if = "Option::is_none")]
    pub no_tls_verify: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_chunked_encoding: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bastion_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http2_origin: Option<bool>,
}

impl OriginRequestConfig {
    /// Fill every unset field from `defaults`
    pub fn inherit(&self, defaults: &OriginRequestConfig) -> OriginRequestConfig {
        macro_rules! pick {
            ($($field:ident),* $(,)?) => {
                OriginRequestConfig {
                    $($field: self.$field.clone().or_else(|| defaults.$field.clone()),)*
                }
            };
        }
        pick!(
            connect_timeout,
            tls_timeout,
            tcp_keep_alive,
            no_happy_eyeballs,
            keep_alive_connections,
            keep_alive_timeout,
            http_host_header,
            origin_server_name,
            match_sni_to_host,
            ca_pool,
            no_tls_verify,
            disable_chunked_encoding,
            bastion_mode,
            proxy_address,
            proxy_port,
            proxy_type,
            http2_origin,
        )
    }
}

/// Private network routing settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WarpRoutingConfig {
    pub enabled: bool,
    /// Seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_active_flows: Option<u64>,
    /// Seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_keep_alive: Option<u64>,
}

/// Ingress rule as written by the user or pushed by the edge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnvalidatedIngressRule {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    pub service: String,
    #[serde(rename = "originRequest")]
    pub origin_request: OriginRequestConfig,
}

impl UnvalidatedIngressRule {
    pub fn new(hostname: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            service: service.into(),
            ..Default::default()
        }
    }
}

/// Configuration document: the edge pushes it as JSON, the CLI reads it as YAML
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnvalidatedConfig {
    pub ingress: Vec<UnvalidatedIngressRule>,
    #[serde(rename = "warp-routing")]
    pub warp_routing: WarpRoutingConfig,
    #[serde(rename = "originRequest")]
    pub origin_request: OriginRequestConfig,
}

impl UnvalidatedConfig {
    pub fn from_json(raw: &[u8]) -> Result<Self, IngressError> {
        serde_json::from_slice(raw).map_err(|e| IngressError::Json(e.to_string()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self, IngressError> {
        serde_yaml::from_str(raw).map_err(|e| IngressError::Yaml(e.to_string()))
    }
}

/// Where a rule sends matching traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressService {
    /// HTTP(S) or WebSocket origin
    Http(Url),
    /// Raw TCP stream origin (tcp, ssh, rdp, smb)
    Stream(Url),
    /// Unix socket origin
    Unix { path: String, tls: bool },
    /// Fixed HTTP status response
    HttpStatus(u16),
    HelloWorld,
    Bastion,
    /// Connector management endpoints
    Management,
}

impl IngressService {
    fn parse(raw: &str) -> Result<Self, String> {
        if let Some(code) = raw.strip_prefix("http_status:") {
            let code: u16 = code
                .parse()
                .map_err(|_| format!("{:?} is not a status code", code))?;
            if !(100..=599).contains(&code) {
                return Err(format!("status code {} out of range", code));
            }
            return Ok(IngressService::HttpStatus(code));
        }

        match raw {
            "" => return Err("service is required".to_string()),
            "hello_world" | "hello-world" => return Ok(IngressService::HelloWorld),
            "bastion" => return Ok(IngressService::Bastion),
            _ => {}
        }

        if let Some(path) = raw.strip_prefix("unix+tls:") {
            return Ok(IngressService::Unix {
                path: path.to_string(),
                tls: true,
            });
        }
        if let Some(path) = raw.strip_prefix("unix:") {
            return Ok(IngressService::Unix {
                path: path.to_string(),
                tls: false,
            });
        }

        let url = Url::parse(raw).map_err(|e| e.to_string())?;
        if url.host_str().map_or(true, str::is_empty) {
            return Err("URL has no host".to_string());
        }

        match url.scheme() {
            "http" | "https" | "ws" | "wss" => {
                if !(url.path().is_empty() || url.path() == "/") {
                    return Err("service URLs can't have a path".to_string());
                }
                Ok(IngressService::Http(url))
            }
            "tcp" | "ssh" | "rdp" | "smb" => Ok(IngressService::Stream(url)),
            other => Err(format!("unsupported scheme {:?}", other)),
        }
    }
}

impl fmt::Display for IngressService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngressService::Http(url) | IngressService::Stream(url) => {
                f.write_str(url.as_str().trim_end_matches('/'))
            }
            IngressService::Unix { path, tls: false } => write!(f, "unix:{}", path),
            IngressService::Unix { path, tls: true } => write!(f, "unix+tls:{}", path),
            IngressService::HttpStatus(code) => write!(f, "http_status:{}", code),
            IngressService::HelloWorld => f.write_str("hello_world"),
            IngressService::Bastion => f.write_str("bastion"),
            IngressService::Management => f.write_str("management"),
        }
    }
}

/// A validated ingress rule
#[derive(Debug, Clone)]
pub struct IngressRule {
    /// Empty for rules that match every host
    pub hostname: String,
    pub path: Option<Regex>,
    pub service: IngressService,
    /// Rule settings with the top-level defaults filled in
    pub config: OriginRequestConfig,
}

impl IngressRule {
    /// Whether this rule matches every request
    pub fn is_catch_all(&self) -> bool {
        is_catch_all_host(&self.hostname) && self.path.is_none()
    }

    fn management() -> Result<Self, IngressError> {
        let path = Regex::new(MANAGEMENT_PATH).map_err(|e| IngressError::InvalidPath {
            index: 0,
            path: MANAGEMENT_PATH.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            hostname: MANAGEMENT_HOSTNAME.to_string(),
            path: Some(path),
            service: IngressService::Management,
            config: OriginRequestConfig::default(),
        })
    }
}

impl PartialEq for IngressRule {
    fn eq(&self, other: &Self) -> bool {
        self.hostname == other.hostname
            && self.path.as_ref().map(Regex::as_str) == other.path.as_ref().map(Regex::as_str)
            && self.service == other.service
            && self.config == other.config
    }
}

fn is_catch_all_host(hostname: &str) -> bool {
    hostname.is_empty() || hostname == "*"
}

fn validate_hostname(hostname: &str) -> Result<(), IngressError> {
    if hostname.contains(':') {
        return Err(IngressError::HostnameContainsPort(hostname.to_string()));
    }
    if hostname == "*" {
        return Ok(());
    }
    let wildcards = hostname.matches('*').count();
    if wildcards > 1 || (wildcards == 1 && !hostname.starts_with("*.")) {
        return Err(IngressError::BadWildcard(hostname.to_string()));
    }
    Ok(())
}

/// Validated ingress rules, internal rules first
#[derive(Debug, Clone, PartialEq)]
pub struct Ingress {
    pub rules: Vec<IngressRule>,
    pub defaults: OriginRequestConfig,
    /// Number of leading rules added by the connector itself
    internal_rules: usize,
}

impl Ingress {
    /// Validate user rules and prepend the internal ones
    ///
    /// An empty rule list becomes a single catch-all answering 503.
    pub fn parse(
        rules: &[UnvalidatedIngressRule],
        defaults: &OriginRequestConfig,
    ) -> Result<Self, IngressError> {
        let default_rule;
        let rules = if rules.is_empty() {
            default_rule = [UnvalidatedIngressRule::new("", DEFAULT_SERVICE)];
            &default_rule[..]
        } else {
            rules
        };

        let mut validated = vec![IngressRule::management()?];
        let internal_rules = validated.len();
        let last = rules.len() - 1;

        for (index, rule) in rules.iter().enumerate() {
            validate_hostname(&rule.hostname)?;

            let path = if rule.path.is_empty() {
                None
            } else {
                Some(
                    Regex::new(&rule.path).map_err(|e| IngressError::InvalidPath {
                        index,
                        path: rule.path.clone(),
                        reason: e.to_string(),
                    })?,
                )
            };

            let service =
                IngressService::parse(&rule.service).map_err(|reason| {
                    IngressError::InvalidService {
                        index,
                        service: rule.service.clone(),
                        reason,
                    }
                })?;

            let catch_all = is_catch_all_host(&rule.hostname) && path.is_none();
            if catch_all && index != last {
                return Err(IngressError::CatchAllNotLast {
                    index,
                    hostname: rule.hostname.clone(),
                });
            }
            if !catch_all && index == last {
                return Err(IngressError::LastRuleNotCatchAll);
            }

            validated.push(IngressRule {
                hostname: rule.hostname.clone(),
                path,
                service,
                config: rule.origin_request.inherit(defaults),
            });
        }

        Ok(Self {
            rules: validated,
            defaults: defaults.clone(),
            internal_rules,
        })
    }

    /// Rules that came from configuration, without the internal ones
    pub fn user_rules(&self) -> &[IngressRule] {
        &self.rules[self.internal_rules..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(hostname: &str, path: &str, service: &str) -> UnvalidatedIngressRule {
        UnvalidatedIngressRule {
            hostname: hostname.to_string(),
            path: path.to_string(),
            service: service.to_string(),
            ..Default::default()
        }
    }

    fn parse(rules: &[UnvalidatedIngressRule]) -> Result<Ingress, IngressError> {
        Ingress::parse(rules, &OriginRequestConfig::default())
    }

    #[test]
    fn test_internal_rules_come_first() {
        let ingress = parse(&[
            rule("app.example.com", "", "http://localhost:8080"),
            rule("", "", "http_status:404"),
        ])
        .unwrap();

        assert_eq!(ingress.rules.len(), 3);
        assert_eq!(ingress.rules[0].service, IngressService::Management);
        assert_eq!(ingress.user_rules().len(), 2);
        assert!(ingress.user_rules()[1].is_catch_all());
    }

    #[test]
    fn test_empty_ingress_answers_503() {
        let ingress = parse(&[]).unwrap();
        assert_eq!(
            ingress.user_rules()[0].service,
            IngressService::HttpStatus(503)
        );
    }

    #[test]
    fn test_catch_all_must_be_last() {
        let err = parse(&[
            rule("*", "", "http://localhost:8080"),
            rule("app.example.com", "", "http://localhost:8081"),
        ])
        .unwrap_err();
        assert!(matches!(err, IngressError::CatchAllNotLast { index: 0, .. }));

        let err = parse(&[rule("app.example.com", "", "http://localhost:8080")]).unwrap_err();
        assert_eq!(err, IngressError::LastRuleNotCatchAll);
    }

    #[test]
    fn test_rule_with_path_is_not_catch_all() {
        let err = parse(&[rule("", "^/api", "http://localhost:8080")]).unwrap_err();
        assert_eq!(err, IngressError::LastRuleNotCatchAll);
    }

    #[test]
    fn test_hostname_rules() {
        let catch_all = rule("", "", "http_status:404");

        assert!(parse(&[rule("*.example.com", "", "hello_world"), catch_all.clone()]).is_ok());
        assert_eq!(
            parse(&[rule("app.*.com", "", "hello_world"), catch_all.clone()]).unwrap_err(),
            IngressError::BadWildcard("app.*.com".to_string())
        );
        assert_eq!(
            parse(&[rule("app.example.com:443", "", "hello_world"), catch_all]).unwrap_err(),
            IngressError::HostnameContainsPort("app.example.com:443".to_string())
        );
    }

    #[test]
    fn test_invalid_path_regex() {
        let err = parse(&[
            rule("app.example.com", "([a-z", "http://localhost:8080"),
            rule("", "", "http_status:404"),
        ])
        .unwrap_err();
        assert!(matches!(err, IngressError::InvalidPath { index: 0, .. }));
    }

    #[test]
    fn test_service_syntax() {
        assert_eq!(
            IngressService::parse("ssh://localhost:22").unwrap().to_string(),
            "ssh://localhost:22"
        );
        assert_eq!(
            IngressService::parse("unix+tls:/run/app.sock").unwrap(),
            IngressService::Unix {
                path: "/run/app.sock".to_string(),
                tls: true
            }
        );
        assert_eq!(
            IngressService::parse("http_status:418").unwrap(),
            IngressService::HttpStatus(418)
        );
        assert!(IngressService::parse("http_status:99").is_err());
        assert!(IngressService::parse("http://localhost:8080/api").is_err());
        assert!(IngressService::parse("ftp://localhost").is_err());
        assert!(IngressService::parse("").is_err());
    }

    #[test]
    fn test_rule_settings_inherit_defaults() {
        let defaults = OriginRequestConfig {
            connect_timeout: Some(30),
            no_tls_verify: Some(false),
            ..Default::default()
        };
        let mut catch_all = rule("", "", "https://localhost:8443");
        catch_all.origin_request.no_tls_verify = Some(true);

        let ingress = Ingress::parse(&[catch_all], &defaults).unwrap();
        let config = &ingress.user_rules()[0].config;
        assert_eq!(config.connect_timeout, Some(30));
        assert_eq!(config.no_tls_verify, Some(true));
    }

    #[test]
    fn test_json_field_names() {
        let raw = br#"{
            "ingress": [{"service": "http://localhost:8080", "originRequest": {"noTLSVerify": true}}],
            "warp-routing": {"enabled": true},
            "originRequest": {"connectTimeout": 10, "matchSNItoHost": true}
        }"#;
        let config = UnvalidatedConfig::from_json(raw).unwrap();

        assert!(config.warp_routing.enabled);
        assert_eq!(config.origin_request.connect_timeout, Some(10));
        assert_eq!(config.origin_request.match_sni_to_host, Some(true));
        assert_eq!(config.ingress[0].origin_request.no_tls_verify, Some(true));
    }

    #[test]
    fn test_yaml_document() {
        let raw = "ingress:\n  - hostname: app.example.com\n    service: http://localhost:8080\n  - service: http_status:404\n";
        let config = UnvalidatedConfig::from_yaml(raw).unwrap();
        assert_eq!(config.ingress.len(), 2);
        assert!(Ingress::parse(&config.ingress, &config.origin_request).is_ok());
    }
}
