//! Bridges a media server's playback sessions to a rich presence gateway.
//!
//! The two load-bearing pieces are [`gateway`], which owns one persistent
//! websocket per tracked user and runs the identify/resume/heartbeat
//! protocol, and [`tracker`], which turns unordered playback progress
//! notifications into the minimal set of presence updates.
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod artwork;
pub mod config;
pub mod gateway;
pub mod host;
pub mod imdb;
pub mod media;
pub mod payload;
pub mod protocol;
pub mod session;
pub mod sweeper;
pub mod tokens;
pub mod tracker;
