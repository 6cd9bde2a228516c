//! # berth-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the berth workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and provides the primitives the stream and CLI crates
//! build upon.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;
