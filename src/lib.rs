//! dbfleet - Fleet Discovery and Self-Service Operations for Managed Databases
//!
//! dbfleet discovers Amazon RDS instances across many AWS accounts and regions, keeps a
//! reconciled inventory of what it found, and lets operators run a small set of
//! state-changing operations against individual instances under an environment-aware
//! authorization model with a mandatory audit trail.
//!
//! # Core Features
//!
//! - **Partial-failure discovery**: every (account, region) unit is scanned independently;
//!   an inaccessible account yields a remediable error entry, never a failed run
//! - **Reconciled inventory**: records are inserted, updated, or soft-deleted only when a
//!   successful scan positively confirms their absence
//! - **Refresh-ahead cache**: fresh reads are served without touching AWS, stale reads
//!   return immediately and trigger a single background refresh
//! - **Tiered authorization**: risky operations on production instances require an
//!   elevated role and an explicit confirmation flag
//! - **Bounded execution**: asynchronous operations are polled to completion within a
//!   fixed timeout, and every attempt is written to the audit log
//!
//! # Architecture Overview
//!
//! - **Configuration** ([`app::fleet_config`]): immutable [`app::fleet_config::FleetConfig`]
//!   and the target registry it resolves
//! - **Fleet engine** ([`app::fleet`]): credential broker, scanner, inventory, cache,
//!   authorization, executor and audit log, wired together by
//!   [`app::fleet::FleetService`]
//!
//! The `dbfleet` binary wraps [`app::fleet::FleetService`] in a small CLI.

#![warn(clippy::all, rust_2018_idioms)]

// Include logging macros first
#[macro_use]
pub mod logging_macros;

pub mod app;
pub use app::fleet::FleetService;
pub use app::fleet_config::FleetConfig;
