//! Daemon configuration.
//!
//! Settings are TOML, loaded from several layers and merged in order:
//!
//! 1. Embedded defaults
//! 2. System config: `/etc/rashomon/config.toml`
//! 3. User config: `~/.config/rashomon/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! Missing system and user files are skipped.
//!
//! ```toml
//! [proxy]
//! listen = "127.0.0.1:8888"
//! bypass_domains = ["sso.corp.example"]
//!
//! [intent]
//! provider = "local_model"
//! endpoint = "http://127.0.0.1:11434"
//! model = "llama3.1:8b"
//! ```
//!
//! Policy documents are separate; see [`crate::policy`].

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{ConfigLoader, SYSTEM_CONFIG_PATH};
pub use schema::{
    Config, IntentProviderKind, IntentSection, IntentSettings, LimitsSection, PoliciesSection,
    ProxySection, Settings, StorageSection, TelemetrySection, TelemetrySettings,
    TelemetrySinkKind,
};
