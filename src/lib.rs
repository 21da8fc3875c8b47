//! Real-time multiplayer session backend.
//!
//! Browsers open a JSON control channel to the gateway, which ties each
//! session to an authoritative per-room simulation worker and to a
//! room-scoped SFU carrying every participant's audio/video to everyone
//! else in the room.

pub mod app;
pub mod config;
pub mod game;
pub mod gateway;
pub mod http;
pub mod proto;
pub mod room;
pub mod rtc;
pub mod util;
pub mod ws;
