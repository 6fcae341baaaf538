// Environment settings shared by the worker and the CLI

use crate::redis::QUEUE_KEY;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_RESULT_TTL_SECONDS: u64 = 86_400;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub redis_url: String,
    pub queue_name: String,
    pub result_ttl_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            queue_name: QUEUE_KEY.to_string(),
            result_ttl_seconds: DEFAULT_RESULT_TTL_SECONDS,
        }
    }
}

impl Settings {
    /// Read REDIS_URL, GRADEBOX_QUEUE and RESULT_TTL_SECONDS, falling back to defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            queue_name: lookup("GRADEBOX_QUEUE").unwrap_or(defaults.queue_name),
            result_ttl_seconds: lookup("RESULT_TTL_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.result_ttl_seconds),
        }
    }
}
