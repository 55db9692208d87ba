//! Wire framing for the control socket.
//!
//! Every frame is a UTF-8 JSON document followed by the literal
//! `<F2B_END_COMMAND>`. Requests are JSON arrays of strings; replies are
//! `[code, value]` with code 0 (ok) or 1 (error).

use bytes::{Buf, BufMut, BytesMut};
use serde_json::{json, Value};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{WardenError, WardenResult};

pub const END_COMMAND: &[u8] = b"<F2B_END_COMMAND>";
pub const MAX_FRAME: usize = 1024 * 1024;

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Sentinel-delimited JSON codec.
#[derive(Debug, Default)]
pub struct ControlCodec {
    // bytes already scanned for the sentinel
    scanned: usize,
}

impl Decoder for ControlCodec {
    type Item = Value;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, io::Error> {
        let from = self.scanned.saturating_sub(END_COMMAND.len() - 1);
        let found = src[from..]
            .windows(END_COMMAND.len())
            .position(|w| w == END_COMMAND)
            .map(|i| from + i);

        let Some(end) = found else {
            if src.len() > MAX_FRAME + END_COMMAND.len() {
                return Err(invalid(format!(
                    "frame exceeds {} bytes without terminator",
                    MAX_FRAME
                )));
            }
            self.scanned = src.len();
            return Ok(None);
        };

        self.scanned = 0;
        let frame = src.split_to(end);
        src.advance(END_COMMAND.len());
        if frame.len() > MAX_FRAME {
            return Err(invalid(format!("frame exceeds {} bytes", MAX_FRAME)));
        }
        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| invalid(format!("malformed frame: {}", e)))
    }
}

impl Encoder<Value> for ControlCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), io::Error> {
        let body = serde_json::to_vec(&item).map_err(|e| invalid(e.to_string()))?;
        if body.len() > MAX_FRAME {
            return Err(invalid(format!("frame exceeds {} bytes", MAX_FRAME)));
        }
        dst.reserve(body.len() + END_COMMAND.len());
        dst.put_slice(&body);
        dst.put_slice(END_COMMAND);
        Ok(())
    }
}

/// Turn a decoded request frame into its argument list. Scalars are
/// accepted and stringified; anything else is a protocol error.
pub fn parse_request(value: Value) -> WardenResult<Vec<String>> {
    let Value::Array(items) = value else {
        return Err(WardenError::Protocol(
            "request must be a JSON array".to_string(),
        ));
    };
    if items.is_empty() {
        return Err(WardenError::Protocol("empty request".to_string()));
    }
    items
        .into_iter()
        .map(|item| match item {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(WardenError::Protocol(format!(
                "unsupported argument: {}",
                other
            ))),
        })
        .collect()
}

/// Reply envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub code: i32,
    pub value: Value,
}

impl Reply {
    pub fn ok(value: Value) -> Self {
        Self { code: 0, value }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: 1,
            value: Value::String(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    pub fn to_value(&self) -> Value {
        json!([self.code, self.value])
    }

    pub fn from_value(value: Value) -> WardenResult<Self> {
        match value {
            Value::Array(mut items) if items.len() == 2 => {
                let value = items.pop().unwrap_or(Value::Null);
                let code = items
                    .pop()
                    .and_then(|c| c.as_i64())
                    .and_then(|c| i32::try_from(c).ok())
                    .ok_or_else(|| WardenError::Protocol("reply code is not an integer".to_string()))?;
                Ok(Self { code, value })
            }
            other => Err(WardenError::Protocol(format!("malformed reply: {}", other))),
        }
    }
}
