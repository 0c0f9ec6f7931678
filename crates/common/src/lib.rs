//! Common types for the tunnelforge reverse TCP tunnel
//!
//! This crate provides the control-channel wire protocol, the frame codec and the
//! shared utilities used by both the client (local agent) and the server (public relay).

pub mod constants;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use error::{Result, TunnelError};
pub use protocol::{ClientMessage, FrameAccumulator, Payload, ServerMessage, encode_frame};
pub use transport::{FrameSender, OutboundFrame, spawn_frame_writer};
pub use utils::{
    SubdomainGenerator, current_timestamp_millis, extract_subdomain, generate_unique_string,
    is_loopback_host, resolve_container_host,
};
