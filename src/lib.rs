#![forbid(unsafe_code)]

//! Library behind the tubeclip binaries.
//!
//! `backend` serves two endpoints: one runs yt-dlp to cut a clip into the
//! storage directory, the other streams that clip back once and deletes it.
//! `clip` is a small client that walks the same flow from a terminal.

pub mod config;
pub mod delivery;
pub mod error;
pub mod flow;
pub mod invoke;
pub mod logging;
pub mod media;
pub mod security;
pub mod server;
pub mod storage;
pub mod timecode;
