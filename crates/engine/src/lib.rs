//! Tool export orchestration engine.
//!
//! Packages a tool's configuration and assets into a downloadable archive
//! through a tracked, multi-step job with rollback, cancellation, integrity
//! checks and retention.

pub mod config;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod services;
