//! Configuration schema definitions.
//!
//! [`Config`] mirrors the TOML file layout. Every scalar is optional so that
//! a layer only overrides what it actually sets; [`Config::resolve`] turns the
//! merged layers into validated [`Settings`].

use super::error::ConfigError;
use crate::proxy::ProxyConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Application directory name under the platform data directory.
pub const APP_DIR: &str = "rashomon";
/// Policy directory name inside the data directory.
pub const POLICY_DIR: &str = "policies";

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxySection,

    #[serde(default)]
    pub storage: StorageSection,

    #[serde(default)]
    pub policies: PoliciesSection,

    #[serde(default)]
    pub limits: LimitsSection,

    #[serde(default)]
    pub intent: IntentSection,

    #[serde(default)]
    pub telemetry: TelemetrySection,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Scalars set in `other` override; lists are appended.
    pub fn merge(&mut self, other: Config) {
        self.proxy.merge(other.proxy);
        self.storage.merge(other.storage);
        self.policies.merge(other.policies);
        self.limits.merge(other.limits);
        self.intent.merge(other.intent);
        self.telemetry.merge(other.telemetry);
    }

    /// Validate the merged layers and fill in derived paths.
    pub fn resolve(self) -> Result<Settings, ConfigError> {
        let listen_raw = required(self.proxy.listen, "proxy.listen")?;
        let listen: SocketAddr = listen_raw
            .parse()
            .map_err(|e| ConfigError::invalid("proxy.listen", format!("'{listen_raw}': {e}")))?;
        if !listen.ip().is_loopback() {
            return Err(ConfigError::invalid(
                "proxy.listen",
                format!("{listen} is not a loopback address"),
            ));
        }

        let data_dir = match self.storage.data_dir {
            Some(dir) => dir,
            None => dirs::data_local_dir()
                .map(|d| d.join(APP_DIR))
                .ok_or(ConfigError::NoDataDirectory)?,
        };
        let policy_dir = self
            .policies
            .dir
            .unwrap_or_else(|| data_dir.join(POLICY_DIR));

        let threshold = required(self.intent.threshold, "intent.threshold")?;
        if threshold > 100 {
            return Err(ConfigError::invalid(
                "intent.threshold",
                format!("{threshold} is outside 0..=100"),
            ));
        }
        let provider = self.intent.provider.unwrap_or_default();
        if provider == IntentProviderKind::LocalModel && self.intent.model.is_none() {
            return Err(ConfigError::invalid(
                "intent.model",
                "local_model needs a model name",
            ));
        }

        let max_scan_bytes = required(self.limits.max_scan_bytes, "limits.max_scan_bytes")?;
        if max_scan_bytes == 0 {
            return Err(ConfigError::invalid("limits.max_scan_bytes", "must be non-zero"));
        }
        let batch_size = required(self.telemetry.batch_size, "telemetry.batch_size")?;
        if batch_size == 0 {
            return Err(ConfigError::invalid("telemetry.batch_size", "must be non-zero"));
        }

        Ok(Settings {
            listen,
            intercept_tls: self.proxy.intercept_tls.unwrap_or(true),
            bypass_domains: self.proxy.bypass_domains,
            upstream_timeout: seconds(self.proxy.upstream_timeout_secs, "proxy.upstream_timeout_secs")?,
            data_dir,
            policy_dir,
            slot_timeout: seconds(self.limits.slot_timeout_secs, "limits.slot_timeout_secs")?,
            max_scan_bytes,
            lookup_timeout: millis(self.limits.lookup_timeout_ms, "limits.lookup_timeout_ms")?,
            intent: IntentSettings {
                provider,
                endpoint: self.intent.endpoint,
                model: self.intent.model,
                threshold,
                timeout: seconds(self.intent.timeout_secs, "intent.timeout_secs")?,
            },
            telemetry: TelemetrySettings {
                enabled: self.telemetry.enabled.unwrap_or(false),
                sink: self.telemetry.sink.unwrap_or_default(),
                batch_size,
                flush_interval: seconds(
                    self.telemetry.flush_interval_secs,
                    "telemetry.flush_interval_secs",
                )?,
            },
        })
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, ConfigError> {
    value.ok_or_else(|| ConfigError::invalid(field, "missing"))
}

fn seconds(value: Option<u64>, field: &str) -> Result<Duration, ConfigError> {
    match required(value, field)? {
        0 => Err(ConfigError::invalid(field, "timeout must be non-zero")),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn millis(value: Option<u64>, field: &str) -> Result<Duration, ConfigError> {
    match required(value, field)? {
        0 => Err(ConfigError::invalid(field, "timeout must be non-zero")),
        ms => Ok(Duration::from_millis(ms)),
    }
}

/// `[proxy]`: the loopback listener.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProxySection {
    pub listen: Option<String>,

    /// Decrypt CONNECT tunnels with the local CA.
    pub intercept_tls: Option<bool>,

    /// Hosts (globs) tunneled without decryption, on top of the pinned list.
    #[serde(default)]
    pub bypass_domains: Vec<String>,

    pub upstream_timeout_secs: Option<u64>,
}

impl ProxySection {
    fn merge(&mut self, other: ProxySection) {
        if other.listen.is_some() {
            self.listen = other.listen;
        }
        if other.intercept_tls.is_some() {
            self.intercept_tls = other.intercept_tls;
        }
        self.bypass_domains.extend(other.bypass_domains);
        if other.upstream_timeout_secs.is_some() {
            self.upstream_timeout_secs = other.upstream_timeout_secs;
        }
    }
}

/// `[storage]`: where the database and CA live.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageSection {
    pub data_dir: Option<PathBuf>,
}

impl StorageSection {
    fn merge(&mut self, other: StorageSection) {
        if other.data_dir.is_some() {
            self.data_dir = other.data_dir;
        }
    }
}

/// `[policies]`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PoliciesSection {
    /// Directory of YAML/TOML policy documents. Defaults to
    /// `<data_dir>/policies`.
    pub dir: Option<PathBuf>,
}

impl PoliciesSection {
    fn merge(&mut self, other: PoliciesSection) {
        if other.dir.is_some() {
            self.dir = other.dir;
        }
    }
}

/// `[limits]`: bounds on per-request work.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsSection {
    /// A concurrency slot not released within this time is reclaimed.
    pub slot_timeout_secs: Option<u64>,
    /// Requests larger than this are not scanned and are blocked.
    pub max_scan_bytes: Option<usize>,
    pub lookup_timeout_ms: Option<u64>,
}

impl LimitsSection {
    fn merge(&mut self, other: LimitsSection) {
        if other.slot_timeout_secs.is_some() {
            self.slot_timeout_secs = other.slot_timeout_secs;
        }
        if other.max_scan_bytes.is_some() {
            self.max_scan_bytes = other.max_scan_bytes;
        }
        if other.lookup_timeout_ms.is_some() {
            self.lookup_timeout_ms = other.lookup_timeout_ms;
        }
    }
}

/// Which intent backend to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentProviderKind {
    #[default]
    Disabled,
    RemoteApi,
    LocalModel,
}

/// `[intent]`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IntentSection {
    pub provider: Option<IntentProviderKind>,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub threshold: Option<u8>,
    pub timeout_secs: Option<u64>,
}

impl IntentSection {
    fn merge(&mut self, other: IntentSection) {
        if other.provider.is_some() {
            self.provider = other.provider;
        }
        if other.endpoint.is_some() {
            self.endpoint = other.endpoint;
        }
        if other.model.is_some() {
            self.model = other.model;
        }
        if other.threshold.is_some() {
            self.threshold = other.threshold;
        }
        if other.timeout_secs.is_some() {
            self.timeout_secs = other.timeout_secs;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetrySinkKind {
    #[default]
    Syslog,
    None,
}

/// `[telemetry]`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetrySection {
    pub enabled: Option<bool>,
    pub sink: Option<TelemetrySinkKind>,
    pub batch_size: Option<usize>,
    pub flush_interval_secs: Option<u64>,
}

impl TelemetrySection {
    fn merge(&mut self, other: TelemetrySection) {
        if other.enabled.is_some() {
            self.enabled = other.enabled;
        }
        if other.sink.is_some() {
            self.sink = other.sink;
        }
        if other.batch_size.is_some() {
            self.batch_size = other.batch_size;
        }
        if other.flush_interval_secs.is_some() {
            self.flush_interval_secs = other.flush_interval_secs;
        }
    }
}

/// Validated daemon settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen: SocketAddr,
    pub intercept_tls: bool,
    pub bypass_domains: Vec<String>,
    pub upstream_timeout: Duration,
    pub data_dir: PathBuf,
    pub policy_dir: PathBuf,
    pub slot_timeout: Duration,
    pub max_scan_bytes: usize,
    pub lookup_timeout: Duration,
    pub intent: IntentSettings,
    pub telemetry: TelemetrySettings,
}

impl Settings {
    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            listen: self.listen,
            intercept_tls: self.intercept_tls,
            bypass_domains: self.bypass_domains.clone(),
            upstream_timeout: self.upstream_timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntentSettings {
    pub provider: IntentProviderKind,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub threshold: u8,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub enabled: bool,
    pub sink: TelemetrySinkKind,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> Config {
        toml::from_str(
            r#"
            [proxy]
            listen = "127.0.0.1:9000"
            upstream_timeout_secs = 5

            [storage]
            data_dir = "/tmp/rashomon-test"

            [limits]
            slot_timeout_secs = 60
            max_scan_bytes = 1024
            lookup_timeout_ms = 250

            [intent]
            threshold = 30
            timeout_secs = 10

            [telemetry]
            batch_size = 10
            flush_interval_secs = 30
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_default_config_is_empty() {
        let config = Config::default();
        assert!(config.proxy.listen.is_none());
        assert!(config.proxy.bypass_domains.is_empty());
        assert!(config.intent.provider.is_none());
    }

    #[test]
    fn test_config_merge_scalars() {
        let mut base = complete();
        let mut layer = Config::default();
        layer.proxy.listen = Some("127.0.0.1:9100".into());
        layer.intent.provider = Some(IntentProviderKind::RemoteApi);

        base.merge(layer);

        assert_eq!(base.proxy.listen.as_deref(), Some("127.0.0.1:9100"));
        // unset in the layer, so kept
        assert_eq!(base.proxy.upstream_timeout_secs, Some(5));
        assert_eq!(base.intent.provider, Some(IntentProviderKind::RemoteApi));
    }

    #[test]
    fn test_config_merge_lists() {
        let mut base = Config::default();
        base.proxy.bypass_domains = vec!["*.corp.test".into()];
        let mut layer = Config::default();
        layer.proxy.bypass_domains = vec!["sso.example.com".into()];

        base.merge(layer);

        assert_eq!(base.proxy.bypass_domains, vec!["*.corp.test", "sso.example.com"]);
    }

    #[test]
    fn test_resolve() {
        let settings = complete().resolve().unwrap();
        assert_eq!(settings.listen.port(), 9000);
        assert!(settings.intercept_tls);
        assert_eq!(settings.upstream_timeout, Duration::from_secs(5));
        assert_eq!(settings.policy_dir, PathBuf::from("/tmp/rashomon-test/policies"));
        assert_eq!(settings.lookup_timeout, Duration::from_millis(250));
        assert_eq!(settings.intent.provider, IntentProviderKind::Disabled);
        assert_eq!(settings.telemetry.sink, TelemetrySinkKind::Syslog);
        assert!(!settings.telemetry.enabled);

        let proxy = settings.proxy_config();
        assert_eq!(proxy.listen, settings.listen);
    }

    #[test]
    fn test_rejects_non_loopback_listen() {
        let mut config = complete();
        config.proxy.listen = Some("0.0.0.0:8888".into());
        match config.resolve() {
            Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, "proxy.listen"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unparsable_listen() {
        let mut config = complete();
        config.proxy.listen = Some("localhost".into());
        assert!(matches!(
            config.resolve(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let mut config = complete();
        config.limits.slot_timeout_secs = Some(0);
        match config.resolve() {
            Err(ConfigError::InvalidValue { field, .. }) => {
                assert_eq!(field, "limits.slot_timeout_secs")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_local_model_needs_model_name() {
        let mut config = complete();
        config.intent.provider = Some(IntentProviderKind::LocalModel);
        assert!(config.clone().resolve().is_err());

        config.intent.model = Some("llama3.1:8b".into());
        assert_eq!(
            config.resolve().unwrap().intent.provider,
            IntentProviderKind::LocalModel
        );
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let result: Result<Config, _> = toml::from_str("[proxy]\nlisten_addr = \"127.0.0.1:1\"\n");
        assert!(result.is_err());
    }
}
