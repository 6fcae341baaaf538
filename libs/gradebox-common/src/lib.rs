//! Shared types and queue semantics for the gradebox worker and CLI.

pub mod config;
pub mod redis;
pub mod types;
