//! Core runtime infrastructure.
//!
//! This module contains the essential components for running kvsql:
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Main runtime orchestration
//! - [`time`] - TTL clock helpers
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod runtime;
pub mod time;
