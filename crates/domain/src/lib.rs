//! Domain layer for the tool export engine.
//!
//! This crate contains:
//! - Domain models (ExportJob, ToolDefinition, listing queries)
//! - Storage and registry abstractions consumed by the engine
//! - In-memory implementations of those abstractions

pub mod models;
pub mod services;
