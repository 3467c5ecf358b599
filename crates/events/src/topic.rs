use serde::{Deserialize, Serialize};

/// A dot-separated event topic, namespaced by domain.
///
/// The leading segment is the domain namespace (e.g. `member`, `transaction`,
/// `loan`, `payment`); the remainder names the fact:
/// `transaction.deposit.completed`, `loan.credit_check.passed`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Domain namespace: the segment before the first `.` (the whole name if
    /// there is none).
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or(&self.0)
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
