//! Shared utilities and common types for the tool export engine.
//!
//! This crate provides common functionality used across all other crates:
//! - Digest helpers (SHA-256 over strings, readers and files)
//! - Offset pagination math
//! - Common validation logic for file names and identifiers

pub mod crypto;
pub mod pagination;
pub mod validation;
