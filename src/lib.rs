//! Stagehand supervises local development services and streams their status and output
//! to connected sessions.
//!
//! A service is either a shell command pipeline (`runnable`) or an HTTP mock endpoint
//! (`mock`). Services are grouped into projects, and the `orchestrator::Orchestrator`
//! exposes every lifecycle operation over them.

pub mod config;
pub mod error;
pub mod events;
pub mod hub;
pub mod mock;
pub mod orchestrator;
pub mod output;
pub mod project;
pub mod runnable;
pub mod runner;
pub mod service;
