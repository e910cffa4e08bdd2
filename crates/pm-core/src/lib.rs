//! Postmortem Scrubber Core Library
//!
//! The driver around `pm-redact`:
//! - Exit codes for CLI operations
//! - Configuration loading and validation
//! - Structured logging
//! - Detector dispatch with per-source timeouts and cancellation
//! - Parallel batch processing with a run-scoped pseudonym registry
//!
//! The binary entry point is in `main.rs`.

pub mod batch;
pub mod cli;
pub mod config;
pub mod detectors;
pub mod dispatch;
pub mod exit_codes;
pub mod logging;
