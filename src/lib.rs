//! Business-case report pipeline
//!
//! Accepts report requests over HTTP, runs them through a sequence of
//! LLM-backed steps on background workers, and exposes per-job status for
//! polling clients.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
