use std::time::Duration;

/// Queue-wide configuration, enumerated in §6 with their defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Per-channel outstanding delivery cap (I4, §4.2, §5 "Backpressure").
    pub unsent_limit: u32,
    /// Idle period after which a queue may release cached working memory
    /// (§5 "Hibernation"). Correctness-neutral.
    pub hibernate_after: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            unsent_limit: 100,
            hibernate_after: Duration::from_millis(1000),
        }
    }
}
