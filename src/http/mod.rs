//! HTTP API server for external control
//!
//! This module provides a REST API for controlling the live session:
//! - POST /session/connect - Open a session (optional extra context)
//! - POST /session/disconnect - Tear the session down
//! - GET /session/status - Query session statistics
//! - GET /session/transcript - Get finalized turns so far
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::{AppState, TranscriptLog};
