//! `TasksCfg`: the pipeline definition read at a `RepoState`, plus its
//! pure, I/O-free TOML parser and validator.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A declarative bundle of files to be content-addressed and uploaded.
///
/// `digest` is "resolved" iff non-empty; specs with an empty digest are
/// the ones the Cacher must materialize and upload (§4.1 step 3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasSpec {
    pub root: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub digest: String,
}

impl CasSpec {
    pub fn is_resolved(&self) -> bool {
        !self.digest.is_empty()
    }
}

/// Immutable template for a task. Dimensions are an executor-matching
/// key/value list (e.g. `os=linux`, `cpu=x86-64`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub dimensions: Vec<(String, String)>,
    pub command: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub priority: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cas_spec: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Resolves the Open Question in §9: plain `FAILURE` is retried only
    /// when the task spec opts in. `MISHAP` is always retry-eligible
    /// regardless of this flag (§4.3).
    #[serde(default)]
    pub retry_on_failure: bool,
}

fn default_max_attempts() -> u32 {
    2
}

/// Immutable job template: which task specs make it up, its priority, and
/// what triggers it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub task_specs: Vec<String>,
    pub priority: f64,
    pub trigger: TriggerKind,
}

/// What caused a job to be requested. Mirrors `tskd_db::models::Trigger`;
/// kept as a separate type here so `tskd-core` has no hard dependency on
/// the persistence row shape while building a `TasksCfg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Periodic,
    AnyCommit,
    MasterOnly,
    OnDemand,
}

/// Pipeline definition for one `RepoState`.
///
/// Invariant (enforced by [`parse_tasks_cfg`], not re-checked elsewhere):
/// every `JobSpec.task_specs` name is a key in `tasks`; every
/// `TaskSpec.dependencies` name is a key in `tasks`; every
/// `TaskSpec.cas_spec` (if present) is a key in `cas_specs`; the
/// dependency graph is acyclic.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TasksCfg {
    #[serde(default)]
    pub tasks: HashMap<String, TaskSpec>,
    #[serde(default)]
    pub jobs: HashMap<String, JobSpec>,
    #[serde(default)]
    pub cas_specs: HashMap<String, CasSpec>,
}

impl TasksCfg {
    /// The transitive closure of task-spec names reachable from `job_name`
    /// via `dependencies`. Empty if the job itself has no task specs.
    pub fn closure_for_job(&self, job_name: &str) -> Option<HashSet<String>> {
        let job = self.jobs.get(job_name)?;
        let mut closure = HashSet::new();
        let mut queue: VecDeque<&str> = job.task_specs.iter().map(|s| s.as_str()).collect();
        while let Some(name) = queue.pop_front() {
            if !closure.insert(name.to_string()) {
                continue;
            }
            if let Some(spec) = self.tasks.get(name) {
                for dep in &spec.dependencies {
                    queue.push_back(dep);
                }
            }
        }
        Some(closure)
    }
}

/// Errors from parsing and validating a `TasksCfg`'s on-disk textual
/// representation. Distinct variants per the Cacher's permanent-error
/// taxonomy (§4.1, §7.1): each is a descriptive, named failure rather
/// than one opaque "invalid config" error.
#[derive(Debug, Error)]
pub enum TasksCfgParseError {
    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("job {job:?} references unknown task spec {task_spec:?}")]
    UnknownTaskSpecRef { job: String, task_spec: String },

    #[error("task spec {task_spec:?} depends on unknown task spec {dependency:?}")]
    UnknownDependency {
        task_spec: String,
        dependency: String,
    },

    #[error("task spec {task_spec:?} references unknown cas spec {cas_spec:?}")]
    UnknownCasSpecRef { task_spec: String, cas_spec: String },

    #[error("dependency cycle detected involving task specs: {0}")]
    CycleDetected(String),

    #[error("task spec {task_spec:?} has priority {priority} outside (0, 1]")]
    InvalidPriority { task_spec: String, priority: f64 },
}

/// Parse and validate a `TasksCfg` TOML document. Pure and I/O-free: the
/// Cacher is responsible for locating and fetching the bytes (§4.1).
pub fn parse_tasks_cfg(content: &str) -> Result<TasksCfg, TasksCfgParseError> {
    let cfg: TasksCfg = toml::from_str(content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &TasksCfg) -> Result<(), TasksCfgParseError> {
    for (task_spec, spec) in &cfg.tasks {
        if !(spec.priority > 0.0 && spec.priority <= 1.0) {
            return Err(TasksCfgParseError::InvalidPriority {
                task_spec: task_spec.clone(),
                priority: spec.priority,
            });
        }
        for dep in &spec.dependencies {
            if !cfg.tasks.contains_key(dep) {
                return Err(TasksCfgParseError::UnknownDependency {
                    task_spec: task_spec.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        if let Some(cas_spec) = &spec.cas_spec {
            if !cfg.cas_specs.contains_key(cas_spec) {
                return Err(TasksCfgParseError::UnknownCasSpecRef {
                    task_spec: task_spec.clone(),
                    cas_spec: cas_spec.clone(),
                });
            }
        }
    }

    for (job, job_spec) in &cfg.jobs {
        for task_spec in &job_spec.task_specs {
            if !cfg.tasks.contains_key(task_spec) {
                return Err(TasksCfgParseError::UnknownTaskSpecRef {
                    job: job.clone(),
                    task_spec: task_spec.clone(),
                });
            }
        }
    }

    check_for_cycles(cfg)?;
    Ok(())
}

/// Detect dependency cycles among task specs using Kahn's algorithm, the
/// same topological-sort technique used to confirm a job's transitive
/// closure is finite (§3).
fn check_for_cycles(cfg: &TasksCfg) -> Result<(), TasksCfgParseError> {
    let names: Vec<&str> = cfg.tasks.keys().map(|s| s.as_str()).collect();
    let index: HashMap<&str, usize> = names.iter().enumerate().map(|(i, n)| (*n, i)).collect();

    let n = names.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for (name, spec) in &cfg.tasks {
        let idx = index[name.as_str()];
        for dep in &spec.dependencies {
            let Some(&dep_idx) = index.get(dep.as_str()) else {
                continue; // reported separately by UnknownDependency
            };
            adj[dep_idx].push(idx);
            in_degree[idx] += 1;
        }
    }

    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(i, _)| i)
        .collect();

    let mut visited = 0usize;
    while let Some(node) = queue.pop_front() {
        visited += 1;
        for &neighbor in &adj[node] {
            in_degree[neighbor] -= 1;
            if in_degree[neighbor] == 0 {
                queue.push_back(neighbor);
            }
        }
    }

    if visited != n {
        let mut cyclic: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| names[i])
            .collect();
        cyclic.sort_unstable();
        return Err(TasksCfgParseError::CycleDetected(cyclic.join(", ")));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
[tasks.build]
command = ["ninja", "-C", "out/Release"]
priority = 1.0

[jobs.linux-rel]
task_specs = ["build"]
priority = 1.0
trigger = "any_commit"
"#
    }

    #[test]
    fn parses_minimal_config() {
        let cfg = parse_tasks_cfg(minimal_toml()).expect("should parse");
        assert_eq!(cfg.tasks.len(), 1);
        assert_eq!(cfg.jobs.len(), 1);
        assert_eq!(cfg.tasks["build"].max_attempts, 2);
        assert!(!cfg.tasks["build"].retry_on_failure);
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = parse_tasks_cfg("not valid toml {{{").unwrap_err();
        assert!(matches!(err, TasksCfgParseError::TomlError(_)));
    }

    #[test]
    fn rejects_unknown_task_spec_in_job() {
        let toml_str = r#"
[tasks.build]
command = ["true"]
priority = 1.0

[jobs.linux-rel]
task_specs = ["test"]
priority = 1.0
trigger = "any_commit"
"#;
        let err = parse_tasks_cfg(toml_str).unwrap_err();
        assert!(matches!(
            err,
            TasksCfgParseError::UnknownTaskSpecRef { .. }
        ));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let toml_str = r#"
[tasks.test]
command = ["true"]
priority = 1.0
dependencies = ["build"]

[jobs.linux-rel]
task_specs = ["test"]
priority = 1.0
trigger = "any_commit"
"#;
        let err = parse_tasks_cfg(toml_str).unwrap_err();
        assert!(matches!(err, TasksCfgParseError::UnknownDependency { .. }));
    }

    #[test]
    fn rejects_unknown_cas_spec() {
        let toml_str = r#"
[tasks.build]
command = ["true"]
priority = 1.0
cas_spec = "out"

[jobs.linux-rel]
task_specs = ["build"]
priority = 1.0
trigger = "any_commit"
"#;
        let err = parse_tasks_cfg(toml_str).unwrap_err();
        assert!(matches!(err, TasksCfgParseError::UnknownCasSpecRef { .. }));
    }

    #[test]
    fn rejects_invalid_priority() {
        let toml_str = r#"
[tasks.build]
command = ["true"]
priority = 0.0

[jobs.linux-rel]
task_specs = ["build"]
priority = 1.0
trigger = "any_commit"
"#;
        let err = parse_tasks_cfg(toml_str).unwrap_err();
        assert!(matches!(err, TasksCfgParseError::InvalidPriority { .. }));
    }

    #[test]
    fn rejects_direct_cycle() {
        let toml_str = r#"
[tasks.a]
command = ["true"]
priority = 1.0
dependencies = ["b"]

[tasks.b]
command = ["true"]
priority = 1.0
dependencies = ["a"]

[jobs.j]
task_specs = ["a"]
priority = 1.0
trigger = "any_commit"
"#;
        let err = parse_tasks_cfg(toml_str).unwrap_err();
        assert!(matches!(err, TasksCfgParseError::CycleDetected(_)));
    }

    #[test]
    fn rejects_transitive_cycle() {
        let toml_str = r#"
[tasks.a]
command = ["true"]
priority = 1.0
dependencies = ["c"]

[tasks.b]
command = ["true"]
priority = 1.0
dependencies = ["a"]

[tasks.c]
command = ["true"]
priority = 1.0
dependencies = ["b"]

[jobs.j]
task_specs = ["a"]
priority = 1.0
trigger = "any_commit"
"#;
        let err = parse_tasks_cfg(toml_str).unwrap_err();
        assert!(matches!(err, TasksCfgParseError::CycleDetected(_)));
    }

    #[test]
    fn accepts_diamond_dag() {
        let toml_str = r#"
[tasks.a]
command = ["true"]
priority = 1.0

[tasks.b]
command = ["true"]
priority = 1.0
dependencies = ["a"]

[tasks.c]
command = ["true"]
priority = 1.0
dependencies = ["a"]

[tasks.d]
command = ["true"]
priority = 1.0
dependencies = ["b", "c"]

[jobs.j]
task_specs = ["d"]
priority = 1.0
trigger = "master_only"
"#;
        let cfg = parse_tasks_cfg(toml_str).expect("diamond DAG should be valid");
        assert_eq!(cfg.tasks.len(), 4);
    }

    #[test]
    fn serialize_then_parse_round_trips() {
        let cfg = parse_tasks_cfg(minimal_toml()).expect("should parse");
        let serialized = toml::to_string(&cfg).expect("should serialize");
        let reparsed = parse_tasks_cfg(&serialized).expect("should reparse");
        assert_eq!(cfg, reparsed);
    }

    #[test]
    fn closure_for_job_follows_transitive_dependencies() {
        let toml_str = r#"
[tasks.a]
command = ["true"]
priority = 1.0

[tasks.b]
command = ["true"]
priority = 1.0
dependencies = ["a"]

[tasks.c]
command = ["true"]
priority = 1.0
dependencies = ["b"]

[jobs.j]
task_specs = ["c"]
priority = 1.0
trigger = "any_commit"
"#;
        let cfg = parse_tasks_cfg(toml_str).expect("should parse");
        let closure = cfg.closure_for_job("j").expect("job should exist");
        assert_eq!(closure.len(), 3);
        assert!(closure.contains("a"));
        assert!(closure.contains("b"));
        assert!(closure.contains("c"));
    }

    #[test]
    fn closure_for_unknown_job_is_none() {
        let cfg = parse_tasks_cfg(minimal_toml()).expect("should parse");
        assert!(cfg.closure_for_job("nonexistent").is_none());
    }

    #[test]
    fn empty_job_closure_is_empty() {
        let toml_str = r#"
[tasks.build]
command = ["true"]
priority = 1.0

[jobs.empty-job]
task_specs = []
priority = 1.0
trigger = "on_demand"
"#;
        let cfg = parse_tasks_cfg(toml_str).expect("should parse");
        let closure = cfg.closure_for_job("empty-job").expect("job should exist");
        assert!(closure.is_empty());
    }
}
