use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use tracing::info;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(from = "MANIFEST_CACHE_IN_QUEUE")]
    pub in_queue_name: NonEmptyString,

    #[envconfig(from = "MANIFEST_CACHE_OUT_QUEUE")]
    pub out_queue_name: NonEmptyString,

    #[envconfig(from = "MANIFEST_CACHE_QUEUE_POLL_TIMEOUT")]
    pub poll_timeout: EnvSecsDuration,

    /// Where oversized message payloads live.
    #[envconfig(from = "MANIFEST_CACHE_MESSAGE_BUCKET")]
    pub message_bucket_name: NonEmptyString,

    #[envconfig(from = "MANIFEST_CACHE_BUCKET")]
    pub cache_bucket_name: NonEmptyString,

    #[envconfig(from = "MANIFEST_CACHE_STORE_DOMAIN", default = "s3.amazonaws.com")]
    pub store_domain: NonEmptyString,

    #[envconfig(from = "MANIFEST_CACHE_SERVICE_TIMEOUT")]
    pub service_timeout: EnvSecsDuration,

    #[envconfig(from = "MANIFEST_CACHE_FETCH_RETRIES", default = "2")]
    pub fetch_retries: usize,

    #[envconfig(from = "MANIFEST_CACHE_WORK_QUEUE_SIZE")]
    pub work_queue_size: usize,

    #[envconfig(from = "MANIFEST_CACHE_WORKERS")]
    pub workers: NonZeroUsize,

    /// How long a worker waits for the next message before flushing a partial block.
    #[envconfig(from = "MANIFEST_CACHE_IDLE_FLUSH_MS", default = "5000")]
    pub idle_flush: EnvMsDuration,

    #[envconfig(from = "MANIFEST_CACHE_POLICY", default = "best-effort")]
    pub cache_policy: CachePolicy,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn log(&self) {
        info!("[CONFIG] InQueueName          = [{}]", self.in_queue_name.as_str());
        info!("[CONFIG] OutQueueName         = [{}]", self.out_queue_name.as_str());
        info!("[CONFIG] PollTimeOut          = [{}s]", self.poll_timeout.0.as_secs());
        info!("[CONFIG] MessageBucketName    = [{}]", self.message_bucket_name.as_str());
        info!("[CONFIG] CacheBucketName      = [{}]", self.cache_bucket_name.as_str());
        info!("[CONFIG] StoreDomain          = [{}]", self.store_domain.as_str());
        info!("[CONFIG] ServiceTimeout       = [{}s]", self.service_timeout.0.as_secs());
        info!("[CONFIG] FetchRetries         = [{}]", self.fetch_retries);
        info!("[CONFIG] WorkQueueSize        = [{}]", self.work_queue_size);
        info!("[CONFIG] Workers              = [{}]", self.workers);
        info!("[CONFIG] IdleFlush            = [{}ms]", self.idle_flush.0.as_millis());
        info!("[CONFIG] CachePolicy          = [{:?}]", self.cache_policy);
    }
}

/// Whether a message that could not be cached may still be forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Caching is an optional enrichment: failures are logged and the
    /// message is forwarded untouched.
    #[default]
    BestEffort,
    /// Messages whose caching failed stay on the inbound queue for redelivery.
    RequireCached,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseCachePolicyError(String);

impl std::fmt::Display for ParseCachePolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} is not a valid cache policy", self.0)
    }
}

impl FromStr for CachePolicy {
    type Err = ParseCachePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best-effort" => Ok(CachePolicy::BestEffort),
            "require-cached" => Ok(CachePolicy::RequireCached),
            _ => Err(ParseCachePolicyError(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvSecsDuration(pub time::Duration);

impl FromStr for EnvSecsDuration {
    type Err = ParseEnvDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secs = s.parse::<u64>().map_err(|_| ParseEnvDurationError)?;

        Ok(EnvSecsDuration(time::Duration::from_secs(secs)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn required() -> HashMap<String, String> {
        [
            ("MANIFEST_CACHE_IN_QUEUE", "in-queue"),
            ("MANIFEST_CACHE_OUT_QUEUE", "out-queue"),
            ("MANIFEST_CACHE_QUEUE_POLL_TIMEOUT", "20"),
            ("MANIFEST_CACHE_MESSAGE_BUCKET", "messages"),
            ("MANIFEST_CACHE_BUCKET", "manifests"),
            ("MANIFEST_CACHE_SERVICE_TIMEOUT", "15"),
            ("MANIFEST_CACHE_WORK_QUEUE_SIZE", "100"),
            ("MANIFEST_CACHE_WORKERS", "4"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
    }

    #[test]
    fn test_config_from_required_values() {
        let config = Config::init_from_hashmap(&required()).expect("invalid config");

        assert_eq!(config.in_queue_name.as_str(), "in-queue");
        assert_eq!(config.poll_timeout.0, time::Duration::from_secs(20));
        assert_eq!(config.service_timeout.0, time::Duration::from_secs(15));
        assert_eq!(config.workers.get(), 4);
        assert_eq!(config.fetch_retries, 2);
        assert_eq!(config.idle_flush.0, time::Duration::from_secs(5));
        assert_eq!(config.store_domain.as_str(), "s3.amazonaws.com");
        assert_eq!(config.cache_policy, CachePolicy::BestEffort);
        assert_eq!(config.bind(), "0.0.0.0:3302");
    }

    #[test]
    fn test_config_missing_value_is_an_error() {
        let mut env = required();
        env.remove("MANIFEST_CACHE_BUCKET");
        assert!(Config::init_from_hashmap(&env).is_err());
    }

    #[test]
    fn test_config_empty_value_is_an_error() {
        let mut env = required();
        env.insert("MANIFEST_CACHE_IN_QUEUE".to_owned(), "".to_owned());
        assert!(Config::init_from_hashmap(&env).is_err());
    }

    #[test]
    fn test_config_non_numeric_value_is_an_error() {
        let mut env = required();
        env.insert("MANIFEST_CACHE_WORKERS".to_owned(), "four".to_owned());
        assert!(Config::init_from_hashmap(&env).is_err());

        let mut env = required();
        env.insert("MANIFEST_CACHE_SERVICE_TIMEOUT".to_owned(), "soon".to_owned());
        assert!(Config::init_from_hashmap(&env).is_err());
    }

    #[test]
    fn test_config_zero_workers_is_an_error() {
        let mut env = required();
        env.insert("MANIFEST_CACHE_WORKERS".to_owned(), "0".to_owned());
        assert!(Config::init_from_hashmap(&env).is_err());
    }

    #[test]
    fn test_parse_cache_policy() {
        assert_eq!("best-effort".parse(), Ok(CachePolicy::BestEffort));
        assert_eq!("Require-Cached".parse(), Ok(CachePolicy::RequireCached));
        assert!("sometimes".parse::<CachePolicy>().is_err());
    }
}
