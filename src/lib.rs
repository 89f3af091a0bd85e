//! embeddit — backend that turns Reddit content identifiers into renderable
//! artifacts for chat-client embeds: resolved share links and muxed
//! v.redd.it videos, both cached to keep upstream traffic down.

pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod server;
pub mod share;
pub mod video;
