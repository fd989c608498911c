//! `tskd skip-rule ...`: operator-facing wrappers around the Skip-Rule
//! Engine's CRUD surface (§4.4, §6: `GetSkipTaskRules`/`AddSkipTaskRule`/
//! `DeleteSkipTaskRule`).

use anyhow::Result;

use tskd_core::auth::Role;
use tskd_core::rpc::Service;

pub async fn run_list(service: &Service) -> Result<()> {
    let rules = service.get_skip_task_rules(Role::Editor)?;
    for rule in &rules {
        println!(
            "{:<24} patterns={:?} commits={} added_by={} description={:?}",
            rule.name,
            rule.task_spec_patterns,
            if rule.commits.is_empty() { "<all>".to_string() } else { rule.commits.join(",") },
            rule.added_by,
            rule.description
        );
    }
    Ok(())
}

pub async fn run_add(
    service: &Service,
    name: &str,
    added_by: &str,
    description: &str,
    patterns: &[String],
    commits: &[String],
) -> Result<()> {
    let rules = service.add_skip_task_rule(Role::Editor, name, added_by, description, patterns, commits).await?;
    println!("rule {name:?} added; {} rule(s) now active", rules.len());
    Ok(())
}

pub async fn run_delete(service: &Service, name: &str) -> Result<()> {
    let rules = service.delete_skip_task_rule(Role::Editor, name).await?;
    println!("rule {name:?} removed (if it existed); {} rule(s) now active", rules.len());
    Ok(())
}
