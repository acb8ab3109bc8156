//! Request-scoped gateway that runs the claude CLI inside per-session
//! sandboxes and streams its output as NDJSON.

pub mod cli;
pub mod config;
pub mod files;
pub mod launcher;
pub mod router;
pub mod stream;
pub mod workspace;
