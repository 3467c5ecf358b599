//! Retention windows for durable records.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Seven years, the regulatory audit retention figure.
const SEVEN_YEARS_DAYS: u64 = 2_557;

/// How long processed records are kept before an explicit purge.
///
/// Nothing expires implicitly: purging is an operator-scheduled store
/// operation that takes these windows as input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Published outbox records (audit trail of emitted facts).
    pub published_outbox: Duration,
    /// Workflow instances that reached a terminal state.
    pub terminal_sagas: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            published_outbox: Duration::from_secs(SEVEN_YEARS_DAYS * 86_400),
            terminal_sagas: Duration::from_secs(SEVEN_YEARS_DAYS * 86_400),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_seven_years() {
        let config = RetentionConfig::default();
        assert_eq!(config.published_outbox.as_secs() / 86_400, 2_557);
        assert_eq!(config.terminal_sagas, config.published_outbox);
    }
}
