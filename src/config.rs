use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::FlagError;

const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(1000);
const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);
const DEFAULT_SKIP_EVENTS: usize = 1;
const DEFAULT_CHANNEL_PREFIX: &str = "feature-flags";

const ENV_PREFIX: &str = "FLAGS_";

/// Timing and subscription settings for a [`FlagStore`](crate::FlagStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Wait between the initial load finishing and opening the subscription.
    pub settle_delay: Duration,
    /// Quiet period a burst of notifications must leave before a refresh.
    pub debounce: Duration,
    /// Notifications discarded right after a subscription opens.
    pub skip_events: usize,
    pub channel_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            debounce: DEFAULT_DEBOUNCE,
            skip_events: DEFAULT_SKIP_EVENTS,
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by `FLAGS_SETTLE_DELAY_MS`, `FLAGS_DEBOUNCE_MS`,
    /// `FLAGS_SKIP_EVENTS` and `FLAGS_CHANNEL_PREFIX`.
    pub fn from_env() -> Result<Self, FlagError> {
        let mut config = Self::default();

        if let Some(ms) = read_var::<u64>("SETTLE_DELAY_MS")? {
            config.settle_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = read_var::<u64>("DEBOUNCE_MS")? {
            config.debounce = Duration::from_millis(ms);
        }
        if let Some(skip) = read_var::<usize>("SKIP_EVENTS")? {
            config.skip_events = skip;
        }
        if let Some(prefix) = read_var::<String>("CHANNEL_PREFIX")? {
            if prefix.is_empty() {
                return Err(FlagError::ConfigError(format!(
                    "{}CHANNEL_PREFIX must not be empty",
                    ENV_PREFIX
                )));
            }
            config.channel_prefix = prefix;
        }

        Ok(config)
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_skip_events(mut self, skip_events: usize) -> Self {
        self.skip_events = skip_events;
        self
    }

    pub fn with_channel_prefix(mut self, channel_prefix: &str) -> Self {
        self.channel_prefix = channel_prefix.to_string();
        self
    }
}

fn read_var<T: FromStr>(suffix: &str) -> Result<Option<T>, FlagError> {
    let key = format!("{}{}", ENV_PREFIX, suffix);
    match env::var(&key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| FlagError::ConfigError(format!("Invalid value for {}: {:?}", key, value))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    fn clear_env() {
        for key in ["SETTLE_DELAY_MS", "DEBOUNCE_MS", "SKIP_EVENTS", "CHANNEL_PREFIX"] {
            env::remove_var(format!("{}{}", ENV_PREFIX, key));
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        assert_eq!(StoreConfig::from_env().unwrap(), StoreConfig::default());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        env::set_var("FLAGS_SETTLE_DELAY_MS", "250");
        env::set_var("FLAGS_DEBOUNCE_MS", " 100 ");
        env::set_var("FLAGS_SKIP_EVENTS", "0");
        env::set_var("FLAGS_CHANNEL_PREFIX", "kids-app-flags");

        let config = StoreConfig::from_env().unwrap();
        assert_eq!(config.settle_delay, Duration::from_millis(250));
        assert_eq!(config.debounce, Duration::from_millis(100));
        assert_eq!(config.skip_events, 0);
        assert_eq!(config.channel_prefix, "kids-app-flags");

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_garbage() {
        clear_env();
        env::set_var("FLAGS_DEBOUNCE_MS", "soon");

        let err = StoreConfig::from_env().unwrap_err();
        assert!(matches!(err, FlagError::ConfigError(_)));
        assert!(err.to_string().contains("FLAGS_DEBOUNCE_MS"));

        clear_env();
    }
}
