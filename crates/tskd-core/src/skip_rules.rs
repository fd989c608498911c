//! The Skip-Rule Engine (§4.4): filters forbidden `(task-spec, commit)`
//! pairs out of the candidate set, after derivation and before scoring.
//!
//! The rule set is held as an immutable snapshot behind a
//! `std::sync::RwLock` -- many concurrent readers during candidate
//! filtering, at most one writer on add/delete -- per Design Notes §9's
//! "publish a new immutable snapshot rather than mutate in place"
//! guidance. A write persists to the durable store first, then swaps in
//! a freshly rebuilt snapshot; a reader never observes a rule that isn't
//! yet durable.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tskd_db::models::SkipRuleRow;
use tskd_db::queries::skip_rules;

use crate::candidates::Candidate;

/// One skip rule, as held in the in-memory snapshot.
#[derive(Debug, Clone)]
pub struct SkipRule {
    pub name: String,
    pub added_by: String,
    pub description: String,
    pub added_at: DateTime<Utc>,
    pub task_spec_patterns: Vec<String>,
    pub commits: Vec<String>,
}

impl From<SkipRuleRow> for SkipRule {
    fn from(row: SkipRuleRow) -> Self {
        Self {
            name: row.name,
            added_by: row.added_by,
            description: row.description,
            added_at: row.added_at,
            task_spec_patterns: row.task_spec_patterns,
            commits: row.commits,
        }
    }
}

impl SkipRule {
    /// Whether this rule applies to `(name, revision)`. `commits=[]` means
    /// "all commits" (§3). Try-job candidates are never skipped -- that
    /// exemption is enforced by the caller
    /// ([`SkipRuleSet::is_skipped`]/[`filter_candidates`]), not here,
    /// since a rule has no notion of try-jobs.
    fn applies_to(&self, name: &str, revision: &str) -> bool {
        let name_matches = self
            .task_spec_patterns
            .iter()
            .any(|pattern| glob_match(pattern, name));
        if !name_matches {
            return false;
        }
        self.commits.is_empty() || self.commits.iter().any(|c| c == revision)
    }
}

/// A simple glob: `*` matches any run of characters, everything else is
/// literal. Matching is case-sensitive and anchored -- the whole
/// task-spec name must match, not a substring (§3).
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern_bytes: Vec<char> = pattern.chars().collect();
    let text_bytes: Vec<char> = text.chars().collect();
    glob_match_rec(&pattern_bytes, &text_bytes)
}

fn glob_match_rec(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            glob_match_rec(&pattern[1..], text)
                || (!text.is_empty() && glob_match_rec(pattern, &text[1..]))
        }
        Some(c) => text.first() == Some(c) && glob_match_rec(&pattern[1..], &text[1..]),
    }
}

/// Immutable snapshot of every skip rule currently in effect.
#[derive(Debug, Clone, Default)]
struct Snapshot {
    rules: Vec<SkipRule>,
}

impl Snapshot {
    fn is_skipped(&self, name: &str, revision: &str) -> bool {
        self.rules.iter().any(|r| r.applies_to(name, revision))
    }
}

/// Error returned when adding a skip rule whose name already exists.
#[derive(Debug, Error)]
#[error("skip rule {0:?} already exists")]
pub struct DuplicateRuleName(pub String);

/// The engine: a durable store handle plus the readable in-memory
/// snapshot.
pub struct SkipRuleEngine {
    pool: sqlx::PgPool,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl SkipRuleEngine {
    /// Build an engine with an empty snapshot. Call [`reload`] once
    /// before serving traffic.
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self {
            pool,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    /// Rebuild the in-memory snapshot from the durable store.
    pub async fn reload(&self) -> anyhow::Result<()> {
        let rows = skip_rules::list_all(&self.pool).await?;
        let rules = rows.into_iter().map(SkipRule::from).collect();
        let snapshot = Arc::new(Snapshot { rules });
        *self.snapshot.write().expect("skip rule snapshot poisoned") = snapshot;
        Ok(())
    }

    /// Add a rule: persist first, then rebuild the snapshot.
    pub async fn add(
        &self,
        name: &str,
        added_by: &str,
        description: &str,
        task_spec_patterns: &[String],
        commits: &[String],
    ) -> anyhow::Result<SkipRule> {
        let existing = skip_rules::get(&self.pool, name).await?;
        if existing.is_some() {
            return Err(DuplicateRuleName(name.to_owned()).into());
        }
        let row = match skip_rules::add(
            &self.pool,
            name,
            added_by,
            description,
            task_spec_patterns,
            commits,
        )
        .await
        {
            Ok(row) => row,
            Err(e) if e.downcast_ref::<skip_rules::DuplicateRuleName>().is_some() => {
                return Err(DuplicateRuleName(name.to_owned()).into());
            }
            Err(e) => return Err(e),
        };
        self.reload().await?;
        Ok(row.into())
    }

    /// Delete a rule: persist first, then rebuild the snapshot. Idempotent
    /// per the durable layer (§8).
    pub async fn delete(&self, name: &str) -> anyhow::Result<bool> {
        let deleted = skip_rules::delete(&self.pool, name).await?;
        if deleted {
            self.reload().await?;
        }
        Ok(deleted)
    }

    pub fn list(&self) -> Vec<SkipRule> {
        self.snapshot().rules.clone()
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().expect("skip rule snapshot poisoned").clone()
    }

    /// Filter a candidate set, dropping any `(name, revision)` matched by
    /// an in-effect rule. Try-job candidates are always exempt (§4.4).
    pub fn filter_candidates(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let snapshot = self.snapshot();
        candidates
            .into_iter()
            .filter(|c| c.is_try_job() || !snapshot.is_skipped(&c.name, &c.repo_state.revision))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_matches_any_run() {
        assert!(glob_match("linux-*", "linux-rel"));
        assert!(glob_match("linux-*", "linux-"));
        assert!(!glob_match("linux-*", "mac-rel"));
    }

    #[test]
    fn glob_is_anchored_not_substring() {
        assert!(!glob_match("rel", "linux-rel"));
        assert!(glob_match("*rel", "linux-rel"));
    }

    #[test]
    fn glob_literal_exact_match() {
        assert!(glob_match("build", "build"));
        assert!(!glob_match("build", "build2"));
    }

    #[test]
    fn glob_is_case_sensitive() {
        assert!(!glob_match("Build", "build"));
    }

    #[test]
    fn rule_with_empty_commits_applies_to_all() {
        let rule = SkipRule {
            name: "r".into(),
            added_by: "op".into(),
            description: "".into(),
            added_at: Utc::now(),
            task_spec_patterns: vec!["flaky-*".into()],
            commits: vec![],
        };
        assert!(rule.applies_to("flaky-test", "any-rev"));
        assert!(rule.applies_to("flaky-test", "other-rev"));
        assert!(!rule.applies_to("stable-test", "any-rev"));
    }

    #[test]
    fn rule_with_explicit_commits_is_scoped() {
        let rule = SkipRule {
            name: "r".into(),
            added_by: "op".into(),
            description: "".into(),
            added_at: Utc::now(),
            task_spec_patterns: vec!["build".into()],
            commits: vec!["abc123".into()],
        };
        assert!(rule.applies_to("build", "abc123"));
        assert!(!rule.applies_to("build", "def456"));
    }

    #[test]
    fn snapshot_is_skipped_checks_all_rules() {
        let snapshot = Snapshot {
            rules: vec![
                SkipRule {
                    name: "a".into(),
                    added_by: "op".into(),
                    description: "".into(),
                    added_at: Utc::now(),
                    task_spec_patterns: vec!["foo".into()],
                    commits: vec![],
                },
                SkipRule {
                    name: "b".into(),
                    added_by: "op".into(),
                    description: "".into(),
                    added_at: Utc::now(),
                    task_spec_patterns: vec!["bar".into()],
                    commits: vec!["c1".into()],
                },
            ],
        };
        assert!(snapshot.is_skipped("foo", "anything"));
        assert!(snapshot.is_skipped("bar", "c1"));
        assert!(!snapshot.is_skipped("bar", "c2"));
        assert!(!snapshot.is_skipped("baz", "anything"));
    }
}
