//! Mailhook Common - Shared types and utilities
//!
//! This crate provides the configuration surface, error type, and shared
//! types (addresses, envelope, session snapshot) used across all Mailhook
//! components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
