//! Terminal orchestration server.
//!
//! Manages interactive PTY sessions over WebSocket, automates Python virtual
//! environment setup inside those sessions, and exposes a workspace-scoped
//! filesystem API alongside a small HTTP surface for health and session
//! inspection.

pub mod api;
pub mod listener;
pub mod session;
pub mod term;
pub mod venv;
pub mod ws;
