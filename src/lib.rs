//! Keyboardia: authoritative coordinator and client sync/audio pipeline
//! for a real-time collaborative step sequencer
//!
//! The server side owns one [`coordinator`] actor per live session,
//! managed by [`registry::SessionRegistry`] and exposed over a single
//! WebSocket endpoint in [`server`]. [`model`] and [`protocol`] define the
//! data and wire shapes both sides share; [`hash`] gives every side a
//! byte-identical fingerprint of replicated state for divergence
//! detection. The [`client`] module is the other half: a transport,
//! reducer, clock, scheduler and audio boundary any native Rust client
//! (not just a browser) can embed.

pub mod client;
pub mod coordinator;
pub mod error;
pub mod hash;
pub mod id;
pub mod model;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod version;
