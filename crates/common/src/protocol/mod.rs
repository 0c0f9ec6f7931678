mod codec;
mod message;
mod payload;

pub use codec::{FrameAccumulator, encode_frame};
pub use message::{ClientMessage, ServerMessage, WireRecord, client_command, server_command};
pub use payload::{BufferKind, BufferPayload, Payload};
