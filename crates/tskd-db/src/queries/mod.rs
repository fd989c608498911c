//! One query-function module per table: typed row structs live in
//! [`crate::models`], and every SQL statement touching a table lives in
//! exactly one module here.

pub mod job_tasks;
pub mod jobs;
pub mod skip_rules;
pub mod tasks;
pub mod tasks_cfg_cache;
