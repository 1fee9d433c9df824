/// Environment-driven configuration
///
/// Every component reads its own settings (`RedisConfig::from_env`,
/// `CacheClientConfig::from_env`, `StreamConfig::from_env`). This module holds
/// the parsing helper they share and a bundle for services that want the whole
/// coordination layer configured in one call.
///
/// # Example
///
/// ```no_run
/// use switchyard_shared::config::SwitchyardConfig;
///
/// # fn example() -> anyhow::Result<()> {
/// let config = SwitchyardConfig::from_env()?;
/// println!("cache version {}", config.cache.version);
/// # Ok(())
/// # }
/// ```

use crate::cache::CacheClientConfig;
use crate::redis::client::{RedisClientError, RedisConfig};
use std::env;
use std::str::FromStr;

/// Reads `key` and parses it, falling back to `default` when unset or invalid
pub fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "Ignoring unparsable environment value");
                default
            }
        },
        Err(_) => default,
    }
}

/// Configuration for the whole coordination layer
#[derive(Debug, Clone)]
pub struct SwitchyardConfig {
    /// Process-wide Redis connection
    pub redis: RedisConfig,

    /// Shared cache settings
    pub cache: CacheClientConfig,
}

impl SwitchyardConfig {
    /// Loads every section from the environment
    ///
    /// # Errors
    ///
    /// Returns an error if `REDIS_URL` is missing.
    pub fn from_env() -> Result<Self, RedisClientError> {
        Ok(Self {
            redis: RedisConfig::from_env()?,
            cache: CacheClientConfig::from_env(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_default_when_unset() {
        let value: u64 = env_parse("SWITCHYARD_TEST_UNSET_VARIABLE", 42);
        assert_eq!(value, 42);
    }

    #[test]
    fn test_env_parse_reads_value() {
        env::set_var("SWITCHYARD_TEST_PARSE_VALUE", " 17 ");
        let value: u64 = env_parse("SWITCHYARD_TEST_PARSE_VALUE", 1);
        assert_eq!(value, 17);
        env::remove_var("SWITCHYARD_TEST_PARSE_VALUE");
    }

    #[test]
    fn test_env_parse_invalid_falls_back() {
        env::set_var("SWITCHYARD_TEST_PARSE_INVALID", "many");
        let value: u32 = env_parse("SWITCHYARD_TEST_PARSE_INVALID", 3);
        assert_eq!(value, 3);
        env::remove_var("SWITCHYARD_TEST_PARSE_INVALID");
    }
}
