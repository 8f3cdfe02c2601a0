//! Fastpush - a sidecar that hot-reloads an application from uploaded files
//!
//! The controller sits in front of a single backend process and:
//! - Accepts file uploads over HTTP and writes them into the app directories
//! - Restarts the backend when an uploaded path matches the restart pattern
//! - Lists app files with SHA-256 checksums, hashing only what changed
//! - Forwards every other request to the backend unchanged

pub mod auth;
pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod gateway;
pub mod policy;
pub mod proxy;
pub mod supervisor;
