//! Control channel to the browser's DevTools endpoint.
//!
//! One WebSocket per session, request/response matched by id, protocol
//! events fanned out over a broadcast channel.

pub mod client;
pub mod protocol;

pub use client::{ControlClient, ControlError};
pub use protocol::{BrowserInfo, ControlEvent, ControlRequest, ControlResponse, PageTarget};
