//! Notification sync client for the welfare platform.
//!
//! Keeps a per-user notification list in step with the backend: history over
//! HTTP once per session, live events over a WebSocket channel, and read state
//! changed only after the backend confirms it.

pub mod auth;
pub mod config;
pub mod console;
pub mod notification;
pub mod session;
pub mod websocket;
