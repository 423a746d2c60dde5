//! Core application modules for dbfleet.
//!
//! # Module Organization
//!
//! - [`fleet_config`] - Static configuration surface and target registry loading
//! - [`fleet`] - Discovery, inventory, caching, authorization and operation execution
//!
//! # Architecture
//!
//! Configuration is loaded once into an immutable [`fleet_config::FleetConfig`] and shared
//! behind an `Arc`. Every component of [`fleet`] receives it explicitly at construction;
//! nothing reads process-wide mutable configuration at call time.

pub mod fleet;
pub mod fleet_config;
