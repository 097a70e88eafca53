pub mod loader;
pub mod schema;

pub use loader::{default_config_path, load_config, load_policy, require_tls_unless_insecure};
pub use schema::{HomeAssistantConfig, MessengerConfig, RateLimitConfig, RuntimeConfig, TlsConfig};
