/// Server-wide tuning for the read engine.
///
/// Field names track the proxy's public configuration surface; see the CLI
/// in `main.rs` for the flag/env spellings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Deadline applied to each read task (`proxy.fetch.max.wait.ms`).
    pub fetch_max_wait_ms: u64,
    /// Byte floor above which a read returns early. Negative disables the
    /// shortcut entirely (`proxy.fetch.min.bytes`).
    pub fetch_min_bytes: i64,
    /// Idle backoff between broker polls when the iterator comes up empty
    /// (`consumer.iterator.backoff.ms`).
    pub iterator_backoff_ms: u64,
    /// Bounded per-poll wait at the broker iterator
    /// (`consumer.iterator.timeout.ms`).
    pub iterator_timeout_ms: u64,
    /// Server-side cap on response bytes (`consumer.response.max.bytes`).
    /// The effective cap for a read is the min of this and the
    /// caller-supplied `max_bytes`.
    pub max_response_bytes: usize,
    /// Idle consumer instances are deleted after this long
    /// (`consumer.instance.timeout.ms`).
    pub instance_timeout_ms: u64,
    /// Number of cooperative read workers (`consumer.threads`).
    pub consumer_threads: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            fetch_max_wait_ms: 1_000,
            fetch_min_bytes: -1,
            iterator_backoff_ms: 50,
            iterator_timeout_ms: 1,
            max_response_bytes: 64 << 20,
            instance_timeout_ms: 300_000,
            consumer_threads: 1,
        }
    }
}

/// Per-consumer settings accepted at instance creation. Each shadows the
/// server-wide value for that instance only.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ConsumerOverrides {
    #[serde(rename = "response.min.bytes")]
    pub response_min_bytes: Option<i64>,
    #[serde(rename = "request.wait.ms")]
    pub request_wait_ms: Option<u64>,
    /// Broker-level request timeout, forwarded to the broker client
    /// configuration. Does not alter the wait observed by HTTP callers.
    #[serde(rename = "request.timeout.ms")]
    pub request_timeout_ms: Option<u64>,
}

/// Effective read settings for one instance: the server config with the
/// instance's overrides applied.
#[derive(Debug, Clone, Copy)]
pub struct ReadSettings {
    pub request_timeout_ms: u64,
    pub response_min_bytes: i64,
    pub iterator_backoff_ms: u64,
    pub iterator_timeout_ms: u64,
    pub max_response_bytes: usize,
}

impl ReadSettings {
    pub fn new(config: &ProxyConfig, overrides: &ConsumerOverrides) -> Self {
        Self {
            request_timeout_ms: overrides
                .request_wait_ms
                .unwrap_or(config.fetch_max_wait_ms),
            response_min_bytes: overrides
                .response_min_bytes
                .unwrap_or(config.fetch_min_bytes),
            iterator_backoff_ms: config.iterator_backoff_ms,
            iterator_timeout_ms: config.iterator_timeout_ms,
            max_response_bytes: config.max_response_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_shadow_globals_per_instance() {
        let config = ProxyConfig {
            fetch_max_wait_ms: 1_201,
            fetch_min_bytes: -1,
            ..ProxyConfig::default()
        };

        let settings = ReadSettings::new(&config, &ConsumerOverrides::default());
        assert_eq!(settings.request_timeout_ms, 1_201);
        assert_eq!(settings.response_min_bytes, -1);

        let overridden = ReadSettings::new(
            &config,
            &ConsumerOverrides {
                request_wait_ms: Some(111),
                response_min_bytes: Some(1),
                request_timeout_ms: None,
            },
        );
        assert_eq!(overridden.request_timeout_ms, 111);
        assert_eq!(overridden.response_min_bytes, 1);
    }

    #[test]
    fn broker_request_timeout_does_not_shadow_wait() {
        let config = ProxyConfig::default();
        let settings = ReadSettings::new(
            &config,
            &ConsumerOverrides {
                request_timeout_ms: Some(123),
                ..ConsumerOverrides::default()
            },
        );
        assert_eq!(settings.request_timeout_ms, config.fetch_max_wait_ms);
    }
}
