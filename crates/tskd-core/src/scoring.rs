//! Candidate scoring (§4.2, §4.2.1): a monotonic score used to rank
//! candidates competing for the same executor capacity, plus the
//! deterministic tie-break applied when two candidates land on the same
//! score.

use chrono::{DateTime, Utc};

use crate::candidates::Candidate;
use crate::config::ScoringConfig;

/// Score one candidate. Higher is more urgent.
///
/// Shape (normative, §4.2.1): staleness and priority contribute
/// positively and unboundedly; try-jobs get a flat multiplicative boost;
/// each attempt beyond the first is multiplicatively decayed (a retry
/// competes less aggressively than fresh work at the same priority); age
/// contributes positively but is capped so an ancient low-priority job
/// cannot outrank a fresh high-priority one indefinitely.
pub fn score(candidate: &Candidate, blamelist_len: usize, now: DateTime<Utc>, cfg: &ScoringConfig) -> f64 {
    let staleness = blamelist_len as f64 * cfg.staleness_weight;
    let priority = candidate.priority * cfg.priority_scale;

    let age_minutes = (now - candidate.oldest_job_created)
        .num_seconds()
        .max(0) as f64
        / 60.0;
    let age = (age_minutes * cfg.age_weight).min(cfg.age_cap);

    let mut total = staleness + priority + age;

    if candidate.is_try_job() {
        total *= cfg.try_job_boost;
    }

    if candidate.attempt > 0 {
        total *= cfg.retry_decay.powi(candidate.attempt as i32);
    }

    total
}

/// Order candidates most-urgent-first, breaking exact score ties
/// deterministically so two ticks over the same input always dispatch in
/// the same order (§8, determinism property): higher `priority` first,
/// then lower `attempt` (fresh work before retries), then lexicographic
/// `(repo, revision, name)`.
pub fn rank<'a>(
    candidates: &'a [Candidate],
    blamelist_lens: &[usize],
    now: DateTime<Utc>,
    cfg: &ScoringConfig,
) -> Vec<&'a Candidate> {
    let mut scored: Vec<(f64, &Candidate)> = candidates
        .iter()
        .zip(blamelist_lens.iter())
        .map(|(c, &len)| (score(c, len, now, cfg), c))
        .collect();

    scored.sort_by(|(score_a, a), (score_b, b)| {
        score_b
            .partial_cmp(score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.priority.partial_cmp(&a.priority).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.attempt.cmp(&b.attempt))
            .then_with(|| a.repo_state.repo.cmp(&b.repo_state.repo))
            .then_with(|| a.repo_state.revision.cmp(&b.repo_state.revision))
            .then_with(|| a.name.cmp(&b.name))
    });

    scored.into_iter().map(|(_, c)| c).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo_state::RepoState;
    use crate::tasks_cfg::TaskSpec;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn candidate(repo: &str, name: &str, priority: f64, attempt: u32, is_try: bool) -> Candidate {
        let mut repo_state = RepoState::new(repo, "rev");
        if is_try {
            repo_state = repo_state.with_patch(crate::repo_state::Patch {
                issue: "123".to_string(),
                patchset: "1".to_string(),
                server: "cr.example.com".to_string(),
                patch_repo: None,
            });
        }
        Candidate {
            repo_state,
            name: name.to_string(),
            task_spec: TaskSpec {
                dimensions: vec![],
                command: vec!["true".into()],
                dependencies: vec![],
                priority: 1.0,
                max_attempts: 2,
                cas_spec: None,
                environment: HashMap::new(),
                retry_on_failure: false,
            },
            priority,
            parent_job_ids: vec![Uuid::new_v4()],
            oldest_job_created: Utc::now(),
            attempt,
            retry_of: None,
            cas_digest: None,
        }
    }

    #[test]
    fn higher_priority_scores_higher() {
        let cfg = ScoringConfig::default();
        let now = Utc::now();
        let low = candidate("repo", "a", 0.1, 0, false);
        let high = candidate("repo", "a", 1.0, 0, false);
        assert!(score(&high, 0, now, &cfg) > score(&low, 0, now, &cfg));
    }

    #[test]
    fn more_stale_blamelist_scores_higher() {
        let cfg = ScoringConfig::default();
        let now = Utc::now();
        let c = candidate("repo", "a", 1.0, 0, false);
        assert!(score(&c, 10, now, &cfg) > score(&c, 1, now, &cfg));
    }

    #[test]
    fn try_job_gets_boosted() {
        let cfg = ScoringConfig::default();
        let now = Utc::now();
        let normal = candidate("repo", "a", 1.0, 0, false);
        let try_job = candidate("repo", "a", 1.0, 0, true);
        assert!(score(&try_job, 0, now, &cfg) > score(&normal, 0, now, &cfg));
    }

    #[test]
    fn retry_scores_lower_than_fresh_attempt_at_same_priority() {
        let cfg = ScoringConfig::default();
        let now = Utc::now();
        let fresh = candidate("repo", "a", 1.0, 0, false);
        let retry = candidate("repo", "a", 1.0, 1, false);
        assert!(score(&retry, 0, now, &cfg) < score(&fresh, 0, now, &cfg));
    }

    #[test]
    fn age_contribution_is_capped() {
        let cfg = ScoringConfig::default();
        let now = Utc::now();
        let mut ancient = candidate("repo", "a", 0.0, 0, false);
        ancient.priority = 0.0;
        ancient.oldest_job_created = now - chrono::Duration::days(365);
        assert_eq!(score(&ancient, 0, now, &cfg), cfg.age_cap);
    }

    #[test]
    fn rank_breaks_ties_by_priority_then_attempt_then_name() {
        let cfg = ScoringConfig::default();
        let now = Utc::now();
        let a = candidate("repo", "b", 0.5, 0, false);
        let b = candidate("repo", "a", 0.5, 0, false);
        let candidates = vec![a, b];
        let lens = vec![0, 0];
        let ranked = rank(&candidates, &lens, now, &cfg);
        assert_eq!(ranked[0].name, "a");
        assert_eq!(ranked[1].name, "b");
    }

    #[test]
    fn rank_is_deterministic_across_repeated_calls() {
        let cfg = ScoringConfig::default();
        let now = Utc::now();
        let candidates = vec![
            candidate("repo", "z", 1.0, 0, false),
            candidate("repo", "y", 0.5, 0, false),
            candidate("repo", "x", 0.9, 1, false),
        ];
        let lens = vec![3, 1, 0];
        let first: Vec<String> = rank(&candidates, &lens, now, &cfg)
            .iter()
            .map(|c| c.name.clone())
            .collect();
        let second: Vec<String> = rank(&candidates, &lens, now, &cfg)
            .iter()
            .map(|c| c.name.clone())
            .collect();
        assert_eq!(first, second);
    }
}
