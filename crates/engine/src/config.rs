//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs injected at log-system construction.
///
/// There are deliberately no process-global constants; every system carries
/// its own copy so tests can shrink the timescales.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogKnobs {
    /// How long a TLog may go unresponsive before the failure tracker and
    /// `on_error` consider it failed.
    pub tlog_timeout: Duration,

    /// Pause between attempts of the per-(server, tag) pop task.
    pub pop_retry_delay: Duration,

    /// Expected rate at which the sequencer advances versions.
    pub versions_per_second: u64,

    /// Upper bound on how far behind the recovered end version the known
    /// committed version may start.
    pub max_read_transaction_life_versions: u64,

    /// Fail-fast factor for recovery-time requests: initialization and
    /// recovery-finished calls time out after
    /// `tlog_timeout / recovery_failure_slope`.
    pub recovery_failure_slope: f64,
}

impl LogKnobs {
    /// Deadline applied to each new-epoch initialization request.
    pub fn recovery_request_timeout(&self) -> Duration {
        self.tlog_timeout.div_f64(self.recovery_failure_slope)
    }
}

impl Default for LogKnobs {
    fn default() -> Self {
        Self {
            tlog_timeout: Duration::from_millis(400),
            pop_retry_delay: Duration::from_secs(1),
            versions_per_second: 1_000_000,
            max_read_transaction_life_versions: 5_000_000,
            recovery_failure_slope: 0.1,
        }
    }
}
