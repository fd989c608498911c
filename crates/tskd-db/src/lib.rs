//! Durable persistence for the task scheduler core: connection pooling,
//! schema migrations, and typed query functions for the `jobs`, `tasks`,
//! `job_tasks`, `skip_rules`, and `tasks_cfg_cache` tables (§4.5, §3.1).

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
