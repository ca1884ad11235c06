pub mod config;
pub mod error;
pub mod event;
pub mod paths;

pub use config::{
    ArchiveConfig, BreakerConfig, KaitConfig, LitellmConfig, ObservabilityConfig, OllamaConfig,
    PortsConfig, ReflectionConfig, RouterConfig, WatchdogConfig,
};
pub use error::{KaitError, ProviderErrorKind, StorageError};
pub use event::IngestEvent;
pub use paths::StateDir;

use uuid::Uuid;

/// Generate an opaque 16-hex-char record identifier.
///
/// Every persisted entity (interactions, contexts, corrections, archives,
/// evolution events) uses this format so ids are greppable across stores.
pub fn generate_id() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    simple[..16].to_string()
}

/// Current wall-clock time as fractional seconds since the Unix epoch.
pub fn now_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Parse the common "1"/"true"/"yes"/"on" boolean env convention.
pub fn env_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_shape() {
        let id = generate_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, id.to_lowercase());
    }

    #[test]
    fn test_generate_id_unique() {
        let a = generate_id();
        let b = generate_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_now_ts_is_recent() {
        let ts = now_ts();
        // Sanity: after 2020-01-01 and monotonic-ish
        assert!(ts > 1_577_836_800.0);
        assert!(now_ts() >= ts);
    }

    #[test]
    fn test_env_flag_values() {
        assert!(env_flag("1"));
        assert!(env_flag("true"));
        assert!(env_flag(" Yes "));
        assert!(env_flag("ON"));
        assert!(!env_flag("0"));
        assert!(!env_flag("false"));
        assert!(!env_flag(""));
    }
}
