//! # wslat-core
//!
//! Shared building blocks for the WebSocket feed latency harness.
//!
//! This crate provides the types every other crate in the workspace speaks:
//! latency [`types::Sample`]s, connection identity and lifecycle, the
//! injectable wall [`types::Clock`], the error taxonomy, the layered
//! configuration and the tracing initialization used by the binary.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;
