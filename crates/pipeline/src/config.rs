use std::time::Duration;

/// Job queue configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of processes executing at once (default: `1`).
    pub max_concurrent: usize,
    /// Re-enqueues allowed after transient failures (default: `2`).
    pub max_retries: u32,
    /// Delay before the n-th retry is `n * retry_backoff` (default: 500 ms).
    pub retry_backoff: Duration,
    /// Execution timeout when the algorithm declares none (default: 1 h).
    pub default_timeout: Duration,
    /// CLI used to run containers (default: `docker`).
    pub container_binary: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
            default_timeout: Duration::from_secs(3600),
            container_binary: "docker".into(),
        }
    }
}

impl QueueConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                          | Default  |
    /// |----------------------------------|----------|
    /// | `MAX_CONCURRENT_EXECUTIONS`      | `1`      |
    /// | `MAX_RETRIES`                    | `2`      |
    /// | `RETRY_BACKOFF_MS`               | `500`    |
    /// | `DEFAULT_EXECUTION_TIMEOUT_SECS` | `3600`   |
    /// | `CONTAINER_BINARY`               | `docker` |
    pub fn from_env() -> Self {
        let max_concurrent: usize = std::env::var("MAX_CONCURRENT_EXECUTIONS")
            .unwrap_or_else(|_| "1".into())
            .parse()
            .expect("MAX_CONCURRENT_EXECUTIONS must be a valid usize");
        assert!(max_concurrent > 0, "MAX_CONCURRENT_EXECUTIONS must be at least 1");

        let max_retries: u32 = std::env::var("MAX_RETRIES")
            .unwrap_or_else(|_| "2".into())
            .parse()
            .expect("MAX_RETRIES must be a valid u32");

        let retry_backoff_ms: u64 = std::env::var("RETRY_BACKOFF_MS")
            .unwrap_or_else(|_| "500".into())
            .parse()
            .expect("RETRY_BACKOFF_MS must be a valid u64");

        let default_timeout_secs: u64 = std::env::var("DEFAULT_EXECUTION_TIMEOUT_SECS")
            .unwrap_or_else(|_| "3600".into())
            .parse()
            .expect("DEFAULT_EXECUTION_TIMEOUT_SECS must be a valid u64");

        let container_binary =
            std::env::var("CONTAINER_BINARY").unwrap_or_else(|_| "docker".into());

        Self {
            max_concurrent,
            max_retries,
            retry_backoff: Duration::from_millis(retry_backoff_ms),
            default_timeout: Duration::from_secs(default_timeout_secs),
            container_binary,
        }
    }
}
