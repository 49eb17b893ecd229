//! Reports returned by lifecycle operations.

use std::time::Duration;

/// What an activation did to the partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationKind {
    /// No prior manifest: the content partition was rebuilt from the shell.
    Fresh,
    /// A prior manifest existed and unchanged entries were kept.
    Upgrade,
    /// Reconciliation failed and every partition was deleted.
    Wiped {
        /// Error that caused the wipe.
        reason: String,
    },
}

/// Outcome of an activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationReport {
    /// Which path the activation took.
    pub kind: ActivationKind,
    /// URLs removed from the content partition as stale or no longer listed.
    pub evicted: Vec<String>,
    /// URLs left in the content partition because their fingerprint is unchanged.
    pub retained: Vec<String>,
    /// Number of shell entries copied from the temp partition.
    pub promoted: usize,
    /// Time spent reconciling.
    pub elapsed: Duration,
}

impl ActivationReport {
    pub(crate) const fn fresh(promoted: usize) -> Self {
        Self {
            kind: ActivationKind::Fresh,
            evicted: Vec::new(),
            retained: Vec::new(),
            promoted,
            elapsed: Duration::ZERO,
        }
    }

    pub(crate) const fn upgrade(evicted: Vec<String>, retained: Vec<String>, promoted: usize) -> Self {
        Self {
            kind: ActivationKind::Upgrade,
            evicted,
            retained,
            promoted,
            elapsed: Duration::ZERO,
        }
    }

    pub(crate) const fn wiped(reason: String) -> Self {
        Self {
            kind: ActivationKind::Wiped { reason },
            evicted: Vec::new(),
            retained: Vec::new(),
            promoted: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// Returns true unless the partitions had to be wiped.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(self.kind, ActivationKind::Wiped { .. })
    }
}

/// Outcome of pre-warming the content partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OfflineReport {
    /// Manifest resources that were already cached.
    pub already_cached: usize,
    /// Resources fetched and stored by this run.
    pub fetched: usize,
    /// Total body bytes fetched.
    pub bytes: u64,
    /// Time spent fetching.
    pub elapsed: Duration,
}

impl OfflineReport {
    /// Returns the average throughput in bytes per second.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn average_speed(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.bytes as f64 / secs) as u64
        } else {
            0
        }
    }
}

/// Snapshot of the partitions relative to the current deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatus {
    /// Partitions that currently exist.
    pub partitions: Vec<String>,
    /// Manifest resources present in the content partition.
    pub cached: usize,
    /// Manifest resources missing from the content partition.
    pub missing: Vec<String>,
    /// Whether the stored manifest equals the current deployment's.
    pub manifest_current: bool,
    /// Entries in the temp partition waiting for activation.
    pub staged: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wiped_is_not_success() {
        assert!(ActivationReport::fresh(3).is_success());
        assert!(ActivationReport::upgrade(vec![], vec![], 0).is_success());
        assert!(!ActivationReport::wiped("boom".to_string()).is_success());
    }

    #[test]
    fn average_speed() {
        let report = OfflineReport {
            bytes: 2048,
            elapsed: Duration::from_secs(2),
            ..OfflineReport::default()
        };
        assert_eq!(report.average_speed(), 1024);
        assert_eq!(OfflineReport::default().average_speed(), 0);
    }
}
