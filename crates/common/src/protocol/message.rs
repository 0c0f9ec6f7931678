use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::Payload;
use crate::error::{Result, TunnelError};

/// Raw control record as it appears on the wire
///
/// Field keys are the small integers used by the protocol:
/// `"1"` command, `"2"` stream name, `"3"` session token, `"4"` payload, `"5"` chunk number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRecord {
    #[serde(rename = "1")]
    pub command: u8,

    #[serde(rename = "2", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(rename = "3", default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,

    #[serde(rename = "4", default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,

    #[serde(rename = "5", default, skip_serializing_if = "Option::is_none")]
    pub chunk_number: Option<u64>,
}

/// Command codes of frames sent by the client
pub mod client_command {
    pub const CONNECTED: u8 = 1;
    pub const DATA_FROM_APP2: u8 = 3;
    pub const SUBDOMAIN_REGISTERED: u8 = 4;
    pub const RESUME: u8 = 5;
    pub const PING: u8 = 6;
}

/// Command codes of frames sent by the server
pub mod server_command {
    pub const DATA_FROM_APP1: u8 = 1;
    pub const REGISTER_SUBDOMAIN: u8 = 2;
    pub const PING_OK: u8 = 3;
    pub const CHUNK_AKNOWLEDGE: u8 = 4;
}

/// Frames sent by the tunnel client to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// First handshake, announces the local target as "host:port"
    Connected { local_address: String },

    /// Chunk read from a local service connection
    DataFromApp2 {
        name: String,
        token: String,
        data: Bytes,
    },

    /// Acknowledges the token assigned by REGISTER_SUBDOMAIN
    SubdomainRegistered { token: String },

    /// Reattaches a new control connection to an existing session
    Resume { token: String },

    Ping,
}

/// Frames sent by the tunnel server to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Chunk read from a public connection
    DataFromApp1 {
        name: String,
        token: String,
        data: Bytes,
    },

    /// Assigns the session token (empty when subdomain routing is disabled)
    RegisterSubdomain { token: String },

    PingOk,

    /// Reserved, never produced by the server
    ChunkAcknowledge {
        name: Option<String>,
        chunk_number: Option<u64>,
    },
}

fn required_name(record: &mut WireRecord) -> Result<String> {
    match record.name.take() {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(TunnelError::InvalidMessage(format!(
            "command {} requires a stream name",
            record.command
        ))),
    }
}

fn required_bytes(record: &mut WireRecord) -> Result<Bytes> {
    record
        .data
        .take()
        .and_then(Payload::into_bytes)
        .ok_or_else(|| {
            TunnelError::InvalidMessage(format!(
                "command {} requires a binary payload",
                record.command
            ))
        })
}

fn required_text(record: &mut WireRecord) -> Result<String> {
    match record.data.take() {
        Some(Payload::Text(text)) => Ok(text),
        _ => Err(TunnelError::InvalidMessage(format!(
            "command {} requires a text payload",
            record.command
        ))),
    }
}

impl ClientMessage {
    pub fn to_record(&self) -> WireRecord {
        use client_command::*;

        match self {
            ClientMessage::Connected { local_address } => WireRecord {
                command: CONNECTED,
                data: Some(Payload::text(local_address.as_str())),
                ..Default::default()
            },
            ClientMessage::DataFromApp2 { name, token, data } => WireRecord {
                command: DATA_FROM_APP2,
                name: Some(name.clone()),
                subdomain: Some(token.clone()),
                data: Some(Payload::binary(data)),
                ..Default::default()
            },
            ClientMessage::SubdomainRegistered { token } => WireRecord {
                command: SUBDOMAIN_REGISTERED,
                subdomain: Some(token.clone()),
                ..Default::default()
            },
            ClientMessage::Resume { token } => WireRecord {
                command: RESUME,
                subdomain: Some(token.clone()),
                ..Default::default()
            },
            ClientMessage::Ping => WireRecord {
                command: PING,
                ..Default::default()
            },
        }
    }
}

impl TryFrom<WireRecord> for ClientMessage {
    type Error = TunnelError;

    fn try_from(mut record: WireRecord) -> Result<Self> {
        use client_command::*;

        match record.command {
            CONNECTED => {
                let local_address = required_text(&mut record)?;
                if local_address.is_empty() {
                    return Err(TunnelError::InvalidMessage(
                        "CONNECTED requires a non-empty local address".to_string(),
                    ));
                }
                Ok(ClientMessage::Connected { local_address })
            }
            DATA_FROM_APP2 => Ok(ClientMessage::DataFromApp2 {
                name: required_name(&mut record)?,
                token: record.subdomain.take().unwrap_or_default(),
                data: required_bytes(&mut record)?,
            }),
            SUBDOMAIN_REGISTERED => Ok(ClientMessage::SubdomainRegistered {
                token: record.subdomain.unwrap_or_default(),
            }),
            RESUME => Ok(ClientMessage::Resume {
                token: record.subdomain.unwrap_or_default(),
            }),
            PING => Ok(ClientMessage::Ping),
            other => Err(TunnelError::UnknownCommand(other)),
        }
    }
}

impl ServerMessage {
    pub fn to_record(&self) -> WireRecord {
        use server_command::*;

        match self {
            ServerMessage::DataFromApp1 { name, token, data } => WireRecord {
                command: DATA_FROM_APP1,
                name: Some(name.clone()),
                subdomain: Some(token.clone()),
                data: Some(Payload::binary(data)),
                ..Default::default()
            },
            ServerMessage::RegisterSubdomain { token } => WireRecord {
                command: REGISTER_SUBDOMAIN,
                data: Some(Payload::text(token.as_str())),
                ..Default::default()
            },
            ServerMessage::PingOk => WireRecord {
                command: PING_OK,
                ..Default::default()
            },
            ServerMessage::ChunkAcknowledge { name, chunk_number } => WireRecord {
                command: CHUNK_AKNOWLEDGE,
                name: name.clone(),
                chunk_number: *chunk_number,
                ..Default::default()
            },
        }
    }
}

impl TryFrom<WireRecord> for ServerMessage {
    type Error = TunnelError;

    fn try_from(mut record: WireRecord) -> Result<Self> {
        use server_command::*;

        match record.command {
            DATA_FROM_APP1 => {
                let name = required_name(&mut record)?;
                let token = record.subdomain.take().ok_or_else(|| {
                    TunnelError::InvalidMessage("DATA_FROM_APP1 requires a session token".into())
                })?;
                Ok(ServerMessage::DataFromApp1 {
                    name,
                    token,
                    data: required_bytes(&mut record)?,
                })
            }
            REGISTER_SUBDOMAIN => Ok(ServerMessage::RegisterSubdomain {
                token: required_text(&mut record)?,
            }),
            PING_OK => Ok(ServerMessage::PingOk),
            CHUNK_AKNOWLEDGE => Ok(ServerMessage::ChunkAcknowledge {
                name: record.name,
                chunk_number: record.chunk_number,
            }),
            other => Err(TunnelError::UnknownCommand(other)),
        }
    }
}
