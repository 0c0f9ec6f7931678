//! Newline-delimited JSON framing for the control channel
//!
//! Reads can split or merge frames, so the receiver accumulates bytes and re-parses
//! the whole accumulator on every read: trim it, turn every run of newlines into a
//! comma, wrap it in `[` `]` and parse it as one JSON array. While a frame is still
//! incomplete the whole batch fails to parse and the accumulator is kept as is; it is
//! only cleared after the entire buffer parsed successfully.

use bytes::BytesMut;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use super::WireRecord;
use crate::error::{Result, TunnelError};

static NEWLINE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n+").unwrap());

/// Serialize a record into a single newline-terminated frame
pub fn encode_frame(record: &WireRecord) -> Result<Vec<u8>> {
    let mut frame = serde_json::to_vec(record)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Receive-side accumulator for control frames
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buffer: BytesMut,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes waiting for the rest of their batch
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Append `data` and try to decode everything accumulated so far.
    ///
    /// `Err` means the batch is not complete yet; the accumulator is retained.
    /// On success each record is converted into `M` on its own, so one rejected
    /// record never hides the valid frames around it.
    pub fn push<M>(&mut self, data: &[u8]) -> Result<Vec<Result<M>>>
    where
        M: TryFrom<WireRecord, Error = TunnelError>,
    {
        self.buffer.extend_from_slice(data);

        let values = match self.parse_batch() {
            Ok(values) => values,
            Err(e) => {
                debug!(
                    pending = self.buffer.len(),
                    "Incomplete control batch, waiting for more data: {}", e
                );
                return Err(e);
            }
        };

        self.buffer.clear();

        Ok(values
            .into_iter()
            .map(|value| -> Result<M> {
                let record: WireRecord = serde_json::from_value(value)?;
                M::try_from(record)
            })
            .collect())
    }

    fn parse_batch(&self) -> Result<Vec<Value>> {
        let text = std::str::from_utf8(&self.buffer)
            .map_err(|e| TunnelError::InvalidMessage(format!("Invalid UTF-8 in frame: {}", e)))?;
        let joined = NEWLINE_RUNS.replace_all(text.trim(), ",");
        let batch = format!("[{}]", joined);
        Ok(serde_json::from_str(&batch)?)
    }
}
