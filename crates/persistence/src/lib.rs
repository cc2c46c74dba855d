//! Persistence layer for the tool export engine.
//!
//! This crate contains:
//! - Database connection management
//! - Entity definitions (database row mappings)
//! - Postgres implementations of the domain storage traits
//! - SQL migrations

pub mod db;
pub mod entities;
pub mod metrics;
pub mod repositories;
