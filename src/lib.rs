//! Real-time price fan-out.
//!
//! Independent producers feed a single merged stream ([`data::mix`]); a
//! broadcast hub ([`data::Hub`]) fans that stream out to every connected
//! subscriber without ever waiting on a slow one. Subscribers connect over
//! WebSocket ([`websocket`]); a small HTTP server ([`api`]) serves health,
//! stats and static assets.

pub mod api;
pub mod config;
pub mod data;
pub mod websocket;
