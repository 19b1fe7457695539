//! gpufleet_server — REST surface and background workers for the control plane.
//!
//! Routes:
//!   POST /instances            — create an instance (202-style: work is queued)
//!   GET  /instances            — comprehensive merged listing
//!   GET  /instances/:id        — one instance
//!   POST /instances/:id/start  — start an exited instance
//!   POST /instances/:id/stop   — stop a ready instance
//!   GET  /health               — dependency health (503 when degraded)
//!   GET  /metrics              — metrics registry snapshot
//!   GET  /cache/stats, POST /cache/clear, POST /cache/cleanup — cache admin

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod migration;
pub mod probe;
pub mod router;
pub mod webhook;
