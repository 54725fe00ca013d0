use std::env;
use std::time::Duration;

const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);
const DEFAULT_CANDIDATE_QUEUE_LIMIT: usize = 64;

/// Tuning for one signaling manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingConfig {
    /// Period of the stale-connection sweep.
    pub reap_interval: Duration,
    /// How long a record may sit in a negotiating state without activity.
    pub stale_after: Duration,
    /// Buffered candidates kept per connection before the oldest is dropped.
    pub candidate_queue_limit: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            reap_interval: DEFAULT_REAP_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
            candidate_queue_limit: DEFAULT_CANDIDATE_QUEUE_LIMIT,
        }
    }
}

impl SignalingConfig {
    pub fn from_env() -> Self {
        let reap_interval = env_millis("HUDDLE_REAP_INTERVAL_MS").unwrap_or(DEFAULT_REAP_INTERVAL);
        let stale_after = env_millis("HUDDLE_STALE_AFTER_MS").unwrap_or(DEFAULT_STALE_AFTER);
        let candidate_queue_limit = env::var("HUDDLE_CANDIDATE_QUEUE_LIMIT")
            .ok()
            .and_then(|val| val.parse().ok())
            .filter(|limit: &usize| *limit > 0)
            .unwrap_or(DEFAULT_CANDIDATE_QUEUE_LIMIT);
        Self {
            reap_interval,
            stale_after,
            candidate_queue_limit,
        }
    }
}

fn env_millis(var: &str) -> Option<Duration> {
    env::var(var)
        .ok()
        .and_then(|val| val.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}
