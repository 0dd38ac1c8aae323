/// Usage accounting: per-user byte counts handed to an external collector.

pub trait UsageReporter: Send + Sync {
    fn report(&self, user_id: &str, bytes: u64);
}

/// Writes usage records to the log; deployments that bill traffic swap in a
/// reporter that posts to their collector.
#[derive(Debug, Clone)]
pub struct LogReporter {
    host_name: String,
}

impl LogReporter {
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
        }
    }
}

impl UsageReporter for LogReporter {
    fn report(&self, user_id: &str, bytes: u64) {
        tracing::info!(host = %self.host_name, user = %user_id, bytes, "usage");
    }
}
