//! tunnelforge local agent
//!
//! Keeps a control connection to a tunnelforge server and relays every public
//! connection the server multiplexes over it to a local TCP service.

pub mod config;
pub mod connection;
pub mod local;
pub mod reconnect;
pub mod writer;

pub use config::{ClientConfig, FileConfig};
pub use connection::{ConnectionState, TunnelClient};
pub use local::{LocalConnections, LocalTarget};
pub use reconnect::{ReconnectConfig, ReconnectState};
pub use writer::{Completion, OrderedStreamWriter};
