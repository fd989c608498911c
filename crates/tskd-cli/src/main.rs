//! `tskd`: the operator CLI and HTTP server binary for the task scheduler
//! core. Every subcommand is a thin shell over `tskd-core`/`tskd-db` --
//! per §1, the CLI itself is named-interface ambient plumbing, not core
//! scheduling logic.

mod config;
mod http;
mod job_cmds;
mod serve_cmd;
mod skip_rule_cmds;
mod task_cmds;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use tskd_core::rpc::Service;
use tskd_core::skip_rules::SkipRuleEngine;
use tskd_db::models::{JobStatus, TaskStatus};
use tskd_db::pool;

use config::TskdConfig;

#[derive(Parser)]
#[command(name = "tskd", about = "Continuous-integration task scheduler core: operator CLI and HTTP server")]
struct Cli {
    /// Database URL (overrides TSKD_DATABASE_URL env var).
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a tskd config file (no database required).
    Init {
        /// PostgreSQL connection URL.
        #[arg(long, default_value = "postgresql://localhost:5432/tskd")]
        db_url: String,
        /// Overwrite existing config file.
        #[arg(long)]
        force: bool,
    },
    /// Create and migrate the tskd database.
    DbInit,
    /// Run the HTTP JSON API (§6.1).
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Job operations (`TriggerJobs`/`GetJob`/`CancelJob`/`SearchJobs`, §6).
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Task operations (`GetTask`/`SearchTasks`, §6).
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Skip-rule operations (§4.4, §6).
    SkipRule {
        #[command(subcommand)]
        command: SkipRuleCommands,
    },
    /// Generate shell completions.
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum JobCommands {
    /// Trigger a job at a commit or a try-job patch (`TriggerJobs`).
    Trigger {
        /// Job-spec name to trigger.
        job_name: String,
        /// Repository identifier.
        #[arg(long)]
        repo: String,
        /// Commit revision (mutually informative with a patch; at least
        /// one of revision/patch-issue must be given).
        #[arg(long)]
        revision: Option<String>,
        #[arg(long)]
        patch_issue: Option<String>,
        #[arg(long)]
        patch_patchset: Option<String>,
        #[arg(long)]
        patch_server: Option<String>,
        #[arg(long)]
        patch_repo: Option<String>,
        #[arg(long, default_value_t = 1.0)]
        priority: f64,
        /// Force re-running tasks that already have a non-failing attempt.
        #[arg(long)]
        force: bool,
    },
    /// Fetch a job by ID (`GetJob`).
    Get { job_id: Uuid },
    /// Cancel a job (`CancelJob`; idempotent).
    Cancel { job_id: Uuid },
    /// Search jobs (`SearchJobs`).
    Search {
        #[arg(long)]
        repo: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Fetch a task by ID (`GetTask`).
    Get {
        task_id: Uuid,
        /// Round-trip to the executor for runtime stats.
        #[arg(long)]
        stats: bool,
    },
    /// Search tasks (`SearchTasks`).
    Search {
        #[arg(long)]
        repo: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
}

#[derive(Subcommand)]
enum SkipRuleCommands {
    /// List all skip rules (`GetSkipTaskRules`).
    List,
    /// Add a skip rule (`AddSkipTaskRule`).
    Add {
        name: String,
        #[arg(long)]
        added_by: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Glob pattern matched against task-spec names; may be repeated.
        #[arg(long = "pattern", required = true)]
        patterns: Vec<String>,
        /// Commit to restrict the rule to; may be repeated. Omit for "all commits".
        #[arg(long = "commit")]
        commits: Vec<String>,
    },
    /// Delete a skip rule by name (`DeleteSkipTaskRule`; idempotent).
    Delete { name: String },
}

/// Execute the `tskd init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!("config file already exists at {}\nUse --force to overwrite.", path.display());
    }

    let token_secret = config::generate_token_secret();

    let cfg = config::ConfigFile {
        database: config::DatabaseSection { url: db_url.to_string() },
        auth: config::AuthSection { token_secret: token_secret.clone() },
        scheduler: config::SchedulerSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  auth.token_secret = {}...{}", &token_secret[..8], &token_secret[56..]);
    println!();
    println!("Next: run `tskd db-init` to create and migrate the database.");

    Ok(())
}

async fn cmd_db_init(cli_db_url: Option<&str>) -> Result<()> {
    let resolved = TskdConfig::resolve(cli_db_url)?;

    println!("Initializing tskd database...");
    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("tskd db-init complete.");
    Ok(())
}

/// Build the in-process [`Service`] used by every operator command: the
/// HTTP surface's auth is not in play here (this binary speaks directly
/// to the database as an already-trusted operator), so every call is
/// made as `Role::Editor`.
async fn build_service(pool: sqlx::PgPool) -> Result<Service> {
    let skip_rules = std::sync::Arc::new(SkipRuleEngine::new(pool.clone()));
    skip_rules.reload().await.context("failed to load skip rules")?;
    Ok(Service::new(pool, skip_rules, Vec::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Serve { bind, port } => {
            let resolved = TskdConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = serve_cmd::run_serve(db_pool.clone(), resolved.token_config, &bind, port, resolved.scheduler).await;
            db_pool.close().await;
            result?;
        }
        Commands::Job { command } => {
            let resolved = TskdConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let service = build_service(db_pool.clone()).await?;
            let result = run_job_command(&service, command).await;
            db_pool.close().await;
            result?;
        }
        Commands::Task { command } => {
            let resolved = TskdConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let service = build_service(db_pool.clone()).await?;
            let result = run_task_command(&service, command).await;
            db_pool.close().await;
            result?;
        }
        Commands::SkipRule { command } => {
            let resolved = TskdConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let service = build_service(db_pool.clone()).await?;
            let result = run_skip_rule_command(&service, command).await;
            db_pool.close().await;
            result?;
        }
        Commands::Completions { shell } => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
        }
    }

    Ok(())
}

async fn run_job_command(service: &Service, command: JobCommands) -> Result<()> {
    match command {
        JobCommands::Trigger {
            job_name,
            repo,
            revision,
            patch_issue,
            patch_patchset,
            patch_server,
            patch_repo,
            priority,
            force,
        } => {
            job_cmds::run_trigger(
                service,
                &job_name,
                &repo,
                revision.as_deref(),
                patch_issue.as_deref(),
                patch_patchset.as_deref(),
                patch_server.as_deref(),
                patch_repo.as_deref(),
                priority,
                force,
            )
            .await
        }
        JobCommands::Get { job_id } => job_cmds::run_get(service, job_id).await,
        JobCommands::Cancel { job_id } => job_cmds::run_cancel(service, job_id).await,
        JobCommands::Search { repo, name, status, since, until, limit, offset } => {
            job_cmds::run_search(service, repo, name, status, since, until, limit, offset).await
        }
    }
}

async fn run_task_command(service: &Service, command: TaskCommands) -> Result<()> {
    match command {
        TaskCommands::Get { task_id, stats } => task_cmds::run_get(service, task_id, stats).await,
        TaskCommands::Search { repo, name, status, since, until, limit, offset } => {
            task_cmds::run_search(service, repo, name, status, since, until, limit, offset).await
        }
    }
}

async fn run_skip_rule_command(service: &Service, command: SkipRuleCommands) -> Result<()> {
    match command {
        SkipRuleCommands::List => skip_rule_cmds::run_list(service).await,
        SkipRuleCommands::Add { name, added_by, description, patterns, commits } => {
            skip_rule_cmds::run_add(service, &name, &added_by, &description, &patterns, &commits).await
        }
        SkipRuleCommands::Delete { name } => skip_rule_cmds::run_delete(service, &name).await,
    }
}
