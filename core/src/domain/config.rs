// Copyright (c) 2026 The Isthmus Authors
// SPDX-License-Identifier: AGPL-3.0

//! Operator configuration.
//!
//! A single YAML document loaded at startup. The file is watched; a change
//! causes a clean restart rather than a hot reload, so every consumer may
//! treat the loaded value as immutable for the process lifetime.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::policy::{CircuitBreakerPolicy, DnsLookupFamily};

/// Cipher suites the `tls.cipher-suites` allow-list may name.
pub const KNOWN_CIPHER_SUITES: &[&str] = &[
    "TLS_AES_128_GCM_SHA256",
    "TLS_AES_256_GCM_SHA384",
    "TLS_CHACHA20_POLY1305_SHA256",
    "ECDHE-ECDSA-AES128-GCM-SHA256",
    "ECDHE-RSA-AES128-GCM-SHA256",
    "ECDHE-ECDSA-AES256-GCM-SHA384",
    "ECDHE-RSA-AES256-GCM-SHA384",
    "ECDHE-ECDSA-CHACHA20-POLY1305",
    "ECDHE-RSA-CHACHA20-POLY1305",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum XdsServerType {
    #[default]
    StateOfTheWorld,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    Gzip,
    Brotli,
    Zstd,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLogLevel {
    #[default]
    Info,
    Error,
    Critical,
    Disabled,
}

/// Root configuration document. Field names follow the wire spelling of the
/// file format, which mixes kebab-case and camelCase for historical
/// reasons; do not "fix" them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct IsthmusConfig {
    #[serde(default)]
    pub xds_server_type: XdsServerType,

    /// Bind address/port for the xDS listener.
    #[serde(default = "default_xds_address")]
    pub xds_address: String,
    #[serde(default = "default_xds_port")]
    pub xds_port: u16,

    /// TLS material for the xDS listener; when set, clients must present a
    /// certificate signed by `ca-file`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xds_server_tls: Option<XdsServerTls>,

    /// Ingress-class names this instance admits. Empty admits resources
    /// with no class and the default class.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress_class_name: Vec<String>,

    /// Data-plane access-log format string; `None` selects the data plane's
    /// default format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accesslog_format: Option<String>,
    #[serde(default)]
    pub accesslog_level: AccessLogLevel,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accesslog_json_fields: Vec<String>,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub listener: ListenerConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(rename = "kubernetesClientQPS", default = "default_client_qps")]
    pub kubernetes_client_qps: f32,
    #[serde(rename = "kubernetesClientBurst", default = "default_client_burst")]
    pub kubernetes_client_burst: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    /// Informers to disable, by kind name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disable_feature: Vec<String>,

    /// Gate for external-name Services (security mitigation, off by
    /// default).
    #[serde(default)]
    pub enable_external_name_service: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub watch_namespaces: Vec<String>,
    /// Namespaces that may contain root HTTPProxies. Empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub root_namespaces: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_global_rate_limit_policy: Option<GlobalRateLimitPolicy>,

    #[serde(default)]
    pub compression: CompressionConfig,

    /// Debounce windows for the rebuild loop.
    #[serde(default)]
    pub rebuild: RebuildConfig,
}

impl Default for IsthmusConfig {
    fn default() -> Self {
        Self {
            xds_server_type: XdsServerType::default(),
            xds_address: default_xds_address(),
            xds_port: default_xds_port(),
            xds_server_tls: None,
            ingress_class_name: Vec::new(),
            accesslog_format: None,
            accesslog_level: AccessLogLevel::default(),
            accesslog_json_fields: Vec::new(),
            tls: TlsConfig::default(),
            timeouts: TimeoutConfig::default(),
            listener: ListenerConfig::default(),
            cluster: ClusterConfig::default(),
            kubernetes_client_qps: default_client_qps(),
            kubernetes_client_burst: default_client_burst(),
            gateway: None,
            disable_feature: Vec::new(),
            enable_external_name_service: false,
            watch_namespaces: Vec::new(),
            root_namespaces: Vec::new(),
            default_global_rate_limit_policy: None,
            compression: CompressionConfig::default(),
            rebuild: RebuildConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct XdsServerTls {
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TlsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_protocol_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_protocol_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cipher_suites: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TimeoutConfig {
    #[serde(with = "humantime_serde", default)]
    pub request_timeout: Option<Duration>,
    #[serde(with = "humantime_serde", default)]
    pub connection_idle_timeout: Option<Duration>,
    #[serde(with = "humantime_serde", default)]
    pub stream_idle_timeout: Option<Duration>,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Option<Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_timeout: None,
            connection_idle_timeout: None,
            stream_idle_timeout: None,
            connect_timeout: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ListenerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections_per_listener: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests_per_io_cycle: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http2_max_concurrent_streams: Option<u32>,
    /// Bind address for the data-plane listeners.
    #[serde(default = "default_listen_address")]
    pub address: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_connections_per_listener: None,
            max_requests_per_io_cycle: None,
            http2_max_concurrent_streams: None,
            address: default_listen_address(),
            http_port: default_http_port(),
            https_port: default_https_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ClusterConfig {
    #[serde(default)]
    pub dns_lookup_family: DnsLookupFamily,
    #[serde(default)]
    pub upstream_tls: TlsConfig,
    #[serde(default)]
    pub circuit_breakers: CircuitBreakerPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GatewayConfig {
    pub gateway_ref: GatewayRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GlobalRateLimitPolicy {
    pub extension_service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default)]
    pub fail_open: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CompressionConfig {
    #[serde(default)]
    pub algorithm: CompressionAlgorithm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RebuildConfig {
    #[serde(with = "humantime_serde", default = "default_holdoff")]
    pub holdoff: Duration,
    #[serde(with = "humantime_serde", default = "default_max_holdoff")]
    pub max_holdoff: Duration,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self { holdoff: default_holdoff(), max_holdoff: default_max_holdoff() }
    }
}

fn default_xds_address() -> String {
    "0.0.0.0".to_string()
}

fn default_xds_port() -> u16 {
    8001
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_https_port() -> u16 {
    8443
}

fn default_client_qps() -> f32 {
    50.0
}

fn default_client_burst() -> u32 {
    100
}

fn default_connect_timeout() -> Option<Duration> {
    Some(Duration::from_secs(2))
}

fn default_holdoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_holdoff() -> Duration {
    Duration::from_millis(500)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("unknown cipher suite {0:?}")]
    UnknownCipherSuite(String),
    #[error("unknown TLS protocol version {0:?} (expected \"1.2\" or \"1.3\")")]
    UnknownTlsVersion(String),
    #[error("holdoff {holdoff:?} exceeds max-holdoff {max_holdoff:?}")]
    HoldoffInverted { holdoff: Duration, max_holdoff: Duration },
}

impl IsthmusConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: IsthmusConfig =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for suites in [&self.tls.cipher_suites, &self.cluster.upstream_tls.cipher_suites] {
            for suite in suites {
                if !KNOWN_CIPHER_SUITES.contains(&suite.as_str()) {
                    return Err(ConfigError::UnknownCipherSuite(suite.clone()));
                }
            }
        }
        for tls in [&self.tls, &self.cluster.upstream_tls] {
            for version in [&tls.minimum_protocol_version, &tls.maximum_protocol_version]
                .into_iter()
                .flatten()
            {
                if super::dag::TlsVersion::parse(version).is_none() {
                    return Err(ConfigError::UnknownTlsVersion(version.clone()));
                }
            }
        }
        if self.rebuild.holdoff > self.rebuild.max_holdoff {
            return Err(ConfigError::HoldoffInverted {
                holdoff: self.rebuild.holdoff,
                max_holdoff: self.rebuild.max_holdoff,
            });
        }
        Ok(())
    }

    /// Whether the informer for `kind` is disabled via `disable-feature`.
    pub fn feature_disabled(&self, kind: &str) -> bool {
        self.disable_feature.iter().any(|k| k.eq_ignore_ascii_case(kind))
    }

    /// Whether a resource carrying `class` (annotation or spec field) is
    /// admitted by this instance.
    pub fn admits_ingress_class(&self, class: Option<&str>) -> bool {
        match class {
            None => true,
            Some(class) => {
                if self.ingress_class_name.is_empty() {
                    // No configured class: admit the conventional default
                    // marker only.
                    class == "isthmus"
                } else {
                    self.ingress_class_name.iter().any(|c| c == class)
                }
            }
        }
    }

    /// Whether `namespace` may hold root routing resources.
    pub fn admits_root_namespace(&self, namespace: &str) -> bool {
        self.root_namespaces.is_empty() || self.root_namespaces.iter().any(|n| n == namespace)
    }

    /// The annotation map form used by the builder for defaulted
    /// circuit-breaker thresholds.
    pub fn default_circuit_breakers(&self) -> &CircuitBreakerPolicy {
        &self.cluster.circuit_breakers
    }

    /// Serialize back to YAML, used by `config show`-style tooling.
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }
}
