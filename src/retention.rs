//! Age-based garbage collection of sessions and jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::orchestrator::Orchestrator;

/// How long sessions and jobs are kept and how often the sweeper runs.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub session_max_age: Duration,
    pub job_max_age: Duration,
    pub sweep_interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            session_max_age: Duration::from_secs(24 * 3600),
            job_max_age: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

/// Rows created before the returned instant are older than `max_age`.
/// `None` when `max_age` reaches past the representable range.
pub fn cutoff(max_age: Duration) -> Option<DateTime<Utc>> {
    let max_age = chrono::Duration::from_std(max_age).ok()?;
    Utc::now().checked_sub_signed(max_age)
}

/// Run [`Orchestrator::sweep`] every `sweep_interval`, skipping the immediate first tick.
pub fn spawn_sweeper(orchestrator: Arc<Orchestrator>, policy: RetentionPolicy) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(policy.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            orchestrator.sweep(&policy).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cutoff() {
        let before = Utc::now();
        let cutoff = cutoff(Duration::from_secs(3600)).unwrap();
        assert!(cutoff <= before - chrono::Duration::minutes(59));

        assert!(super::cutoff(Duration::MAX).is_none());
    }
}
