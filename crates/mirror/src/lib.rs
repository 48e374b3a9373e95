//! Mirror relay library
//!
//! Streams one editor's buffer to any number of viewers. The [`hub`] owns
//! sessions and fan-out; [`api`] exposes it over HTTP and WebSocket.

pub mod api;
pub mod config;
pub mod hub;
pub mod pages;
pub mod urls;

pub use mirror_protocol::{Envelope, MessageKind};
