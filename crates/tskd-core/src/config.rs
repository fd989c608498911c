//! Explicit configuration threaded into the scheduler at construction,
//! replacing the process-wide singletons Design Notes §9 warns against
//! ("Global state"). Nothing in this crate reads an environment variable
//! or a hard-coded literal deep in the call stack -- every tunable lives
//! here.

use std::time::Duration;

/// Scoring weights for the candidate scorer (§4.2.1).
///
/// These are deliberately soft: an operator tuning the scheduler edits
/// this config, not the scoring function. The *shape* of the scoring
/// function (monotonic in staleness/priority/age, multiplicative
/// penalty on retries, multiplicative boost on try-jobs) is normative;
/// the weights below are calibrated defaults, not derived constants.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringConfig {
    /// Points per uncovered commit in a candidate's blamelist staleness.
    pub staleness_weight: f64,
    /// Scale applied to `task_spec.priority * job_spec.priority`.
    pub priority_scale: f64,
    /// Multiplicative boost applied to try-job candidates.
    pub try_job_boost: f64,
    /// Multiplicative decay applied once per attempt beyond the first.
    pub retry_decay: f64,
    /// Points per minute of job age.
    pub age_weight: f64,
    /// Upper bound on the age term's contribution.
    pub age_cap: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            staleness_weight: 1.0,
            priority_scale: 100.0,
            try_job_boost: 2.0,
            retry_decay: 0.5,
            age_weight: 0.1,
            age_cap: 50.0,
        }
    }
}

/// Top-level scheduler configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub scoring: ScoringConfig,
    /// How often the scheduler loop ticks.
    pub tick_interval: Duration,
    /// Wall-clock budget for a single tick's fan-out I/O before in-flight
    /// resolutions are abandoned (§5, "Cancellation & timeouts").
    pub tick_deadline: Duration,
    /// Deadline for the executor to confirm a dispatch before the task is
    /// marked `MISHAP` (§4.3).
    pub dispatch_deadline: Duration,
    /// Maximum first-parent commits a single blamelist walk may cover
    /// before truncating (§4.3, "blamelist_max_window").
    pub blamelist_max_window: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scoring: ScoringConfig::default(),
            tick_interval: Duration::from_secs(10),
            tick_deadline: Duration::from_secs(30),
            dispatch_deadline: Duration::from_secs(60),
            blamelist_max_window: 500,
        }
    }
}
