//! # k-vault
//!
//! Scheduled backups of local files through an encrypting, integrity-checked
//! transfer pipeline.
//!
//! ## Features
//!
//! - **Recurring schedules**: hourly, daily, weekly or monthly, evaluated in
//!   local time with month-end clamping and DST handling
//! - **Sessions**: per-file progress, pause/resume/cancel and aggregate
//!   counters that stay consistent under partial failure
//! - **Pipeline**: SHA-256 digest, deflate, then AES-256-CBC with a fresh IV
//!   per file; restores fail closed on any mismatch
//! - **Durable state**: schedules and sessions live in SQLite and survive
//!   restarts
//!
//! ## Quick Start
//!
//! ```no_run
//! use k_vault::backup::config::{Access, AppConfig};
//! use std::sync::Arc;
//!
//! let config = AppConfig::load("k-vault.yml")?;
//! let services = Arc::new(config.open(Access::Owner)?);
//! let pool = Arc::new(config.build_pool()?);
//! services.start_daemon(pool)?.wait();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
